//! Diverter settings and their validation.

use crate::network::core::Transport;
use crate::settings::listeners::ListenerSettings;
use crate::settings::SettingsError;
use clap::ValueEnum;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

lazy_static! {
    /// Linux interface names: at most 15 bytes, no whitespace or slashes.
    static ref INTERFACE_NAME: Regex = Regex::new(r"^[A-Za-z0-9_.:@-]{1,15}$")
        .unwrap_or_else(|e| panic!("interface name pattern is invalid: {}", e));
}

/// Where the monitored process runs relative to the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// The monitored process runs on this machine; traffic is NATed to loopback
    #[default]
    #[value(name = "singlehost")]
    SingleHost,
    /// Another machine forwards its traffic here; foreign traffic is observed
    #[value(name = "multihost")]
    MultiHost,
}

impl NetworkMode {
    pub fn is_single_host(&self) -> bool {
        *self == NetworkMode::SingleHost
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkMode::SingleHost => write!(f, "SingleHost"),
            NetworkMode::MultiHost => write!(f, "MultiHost"),
        }
    }
}

/// Configuration of the diversion engine.
///
/// Read once at startup and never modified while the engine runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiverterSettings {
    /// SingleHost or MultiHost operation
    pub network_mode: NetworkMode,

    /// Log each foreign destination only the first time it is seen
    pub log_nonlocal_only_once: bool,

    /// Restrict the optional hooks and interface redirection to one interface
    pub restrict_interface: Option<String>,

    /// Send traffic for ports without a listener to the default listener
    pub redirect_all_traffic: bool,

    /// Name of the listener receiving otherwise unhandled TCP traffic
    pub default_tcp_listener: Option<String>,

    /// Name of the listener receiving otherwise unhandled UDP traffic
    pub default_udp_listener: Option<String>,

    /// TCP destination ports that are never redirected
    pub blacklist_ports_tcp: Vec<u16>,

    /// UDP destination ports that are never redirected
    pub blacklist_ports_udp: Vec<u16>,

    /// Redirect outgoing ICMP to the local host (SingleHost only)
    pub redirect_icmp: bool,

    /// Snapshot and flush iptables before starting, restore on stop
    pub flush_iptables: bool,

    /// Seconds between statistics log lines (0 = never)
    pub statistics_interval_secs: u64,

    /// Simulated protocol listeners bound on this host
    pub listeners: Vec<ListenerSettings>,
}

impl Default for DiverterSettings {
    fn default() -> Self {
        Self {
            network_mode: NetworkMode::SingleHost,
            log_nonlocal_only_once: true,
            restrict_interface: None,
            redirect_all_traffic: true,
            default_tcp_listener: None,
            default_udp_listener: None,
            blacklist_ports_tcp: Vec::new(),
            blacklist_ports_udp: Vec::new(),
            redirect_icmp: true,
            flush_iptables: false,
            statistics_interval_secs: 30,
            listeners: Vec::new(),
        }
    }
}

impl DiverterSettings {
    /// Ports excluded from redirection for one transport.
    pub fn blacklisted_ports(&self, transport: Transport) -> &[u16] {
        match transport {
            Transport::Tcp => &self.blacklist_ports_tcp,
            Transport::Udp => &self.blacklist_ports_udp,
        }
    }

    /// Name of the default listener for one transport.
    pub fn default_listener(&self, transport: Transport) -> Option<&str> {
        match transport {
            Transport::Tcp => self.default_tcp_listener.as_deref(),
            Transport::Udp => self.default_udp_listener.as_deref(),
        }
    }

    /// Interface restriction, only honoured in MultiHost mode.
    pub fn effective_interface(&self) -> Option<&str> {
        if self.network_mode.is_single_host() {
            return None;
        }
        self.restrict_interface
            .as_deref()
            .filter(|iface| !iface.is_empty())
    }

    /// Checks the settings for values the engine cannot work with.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if let Some(iface) = self.restrict_interface.as_deref() {
            if !iface.is_empty() && !INTERFACE_NAME.is_match(iface) {
                return Err(SettingsError::InvalidInterface(iface.to_string()));
            }
        }

        for listener in &self.listeners {
            if listener.port == 0 {
                return Err(SettingsError::InvalidPort(listener.name.clone()));
            }
        }

        for transport in [Transport::Tcp, Transport::Udp] {
            let Some(name) = self.default_listener(transport) else {
                continue;
            };
            let listener = self
                .listeners
                .iter()
                .find(|l| l.name == name)
                .ok_or_else(|| SettingsError::UnknownListener(name.to_string()))?;
            if listener.protocol != transport {
                return Err(SettingsError::ListenerProtocol {
                    name: name.to_string(),
                    expected: transport,
                });
            }
        }

        Ok(())
    }
}
