//! Diverter settings builder.
//!
//! This module provides a fluent builder API for constructing
//! `DiverterSettings` in a type-safe and ergonomic way.
//!
//! # Example
//!
//! ```rust
//! use netdivert::network::core::Transport;
//! use netdivert::settings::{NetworkMode, SettingsBuilder};
//!
//! let settings = SettingsBuilder::new()
//!     .mode(NetworkMode::SingleHost)
//!     .listener("RawTCPListener", Transport::Tcp, 1337)
//!     .default_tcp_listener("RawTCPListener")
//!     .log_every_occurrence(true)
//!     .build();
//! ```

use crate::network::core::Transport;
use crate::settings::diverter::{DiverterSettings, NetworkMode};
use crate::settings::listeners::ListenerSettings;

/// Builder for constructing `DiverterSettings`.
#[derive(Debug, Default)]
pub struct SettingsBuilder {
    settings: DiverterSettings,
}

impl SettingsBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from existing settings, e.g. ones loaded from a file.
    pub fn from_settings(settings: DiverterSettings) -> Self {
        Self { settings }
    }

    /// Sets SingleHost or MultiHost operation.
    pub fn mode(mut self, mode: NetworkMode) -> Self {
        self.settings.network_mode = mode;
        self
    }

    /// Logs every sighting of a foreign address instead of only the first.
    pub fn log_every_occurrence(mut self, every: bool) -> Self {
        self.settings.log_nonlocal_only_once = !every;
        self
    }

    /// Restricts the optional hooks to one network interface.
    ///
    /// # Arguments
    ///
    /// * `iface` - Interface name, e.g. `eth0`
    pub fn restrict_interface(mut self, iface: impl Into<String>) -> Self {
        self.settings.restrict_interface = Some(iface.into());
        self
    }

    /// Adds a listener bound on this host.
    pub fn listener(mut self, name: impl Into<String>, protocol: Transport, port: u16) -> Self {
        self.settings.listeners.push(ListenerSettings {
            name: name.into(),
            protocol,
            port,
        });
        self
    }

    /// Names the listener receiving unhandled TCP traffic.
    pub fn default_tcp_listener(mut self, name: impl Into<String>) -> Self {
        self.settings.default_tcp_listener = Some(name.into());
        self
    }

    /// Names the listener receiving unhandled UDP traffic.
    pub fn default_udp_listener(mut self, name: impl Into<String>) -> Self {
        self.settings.default_udp_listener = Some(name.into());
        self
    }

    /// Enables or disables default-listener redirection.
    pub fn redirect_all_traffic(mut self, enabled: bool) -> Self {
        self.settings.redirect_all_traffic = enabled;
        self
    }

    /// Excludes a destination port from redirection.
    pub fn blacklist_port(mut self, protocol: Transport, port: u16) -> Self {
        match protocol {
            Transport::Tcp => self.settings.blacklist_ports_tcp.push(port),
            Transport::Udp => self.settings.blacklist_ports_udp.push(port),
        }
        self
    }

    /// Enables or disables the SingleHost ICMP redirect rule.
    pub fn redirect_icmp(mut self, enabled: bool) -> Self {
        self.settings.redirect_icmp = enabled;
        self
    }

    /// Snapshots and flushes iptables for the duration of the run.
    pub fn flush_iptables(mut self, enabled: bool) -> Self {
        self.settings.flush_iptables = enabled;
        self
    }

    /// Sets the statistics log interval in seconds (0 = never).
    pub fn statistics_interval(mut self, secs: u64) -> Self {
        self.settings.statistics_interval_secs = secs;
        self
    }

    /// Builds the final settings.
    pub fn build(self) -> DiverterSettings {
        self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let settings = SettingsBuilder::new()
            .mode(NetworkMode::MultiHost)
            .restrict_interface("eth1")
            .listener("RawTCPListener", Transport::Tcp, 1337)
            .default_tcp_listener("RawTCPListener")
            .blacklist_port(Transport::Udp, 5353)
            .log_every_occurrence(true)
            .build();

        assert_eq!(settings.network_mode, NetworkMode::MultiHost);
        assert_eq!(settings.restrict_interface.as_deref(), Some("eth1"));
        assert!(!settings.log_nonlocal_only_once);
        assert_eq!(settings.blacklist_ports_udp, vec![5353]);
        assert_eq!(settings.listeners.len(), 1);
        assert!(settings.validate().is_ok());
    }
}
