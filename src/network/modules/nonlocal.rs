//! Observation of traffic for foreign hosts.
//!
//! Runs on every hook before any rewrite and never modifies a packet.

use crate::error::{DivertError, Result};
use crate::network::core::{LocalAddresses, PacketContext};
use log::{debug, info};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Sightings {
    nonlocal: HashSet<IpAddr>,
    icmp: HashSet<IpAddr>,
}

/// Logs traffic addressed to hosts other than this one.
///
/// A malware sample contacting an unexpected address is one of the most
/// useful signals of an analysis run, so the first sighting of every
/// foreign destination is always logged. Repeats are logged only when
/// `log_every_occurrence` is set.
pub struct NonlocalTrafficMonitor {
    local_addresses: Arc<LocalAddresses>,
    log_every_occurrence: bool,
    seen: Mutex<Sightings>,
}

impl NonlocalTrafficMonitor {
    /// Creates a monitor.
    ///
    /// # Arguments
    ///
    /// * `local_addresses` - Addresses of this host, read once at startup
    /// * `log_every_occurrence` - Log repeats instead of first sightings only
    pub fn new(local_addresses: Arc<LocalAddresses>, log_every_occurrence: bool) -> Self {
        Self {
            local_addresses,
            log_every_occurrence,
            seen: Mutex::new(Sightings::default()),
        }
    }

    fn foreign_destination(&self, packet: &PacketContext) -> Option<IpAddr> {
        packet
            .dst_ip()
            .filter(|ip| !self.local_addresses.is_local(ip))
    }

    /// Logs a non-ICMP packet destined for a foreign address.
    ///
    /// # Returns
    ///
    /// `true` if a log line was emitted.
    pub fn check_log_nonlocal(&self, packet: &PacketContext) -> Result<bool> {
        if packet.is_icmp() {
            return Ok(false);
        }
        let Some(dst_ip) = self.foreign_destination(packet) else {
            return Ok(false);
        };

        debug!("{}: nonlocal {}", packet.label(), packet.header_summary());

        let first = self
            .seen
            .lock()
            .map_err(|_| DivertError::lock_poisoned("nonlocal sightings"))?
            .nonlocal
            .insert(dst_ip);

        if first || self.log_every_occurrence {
            info!(
                "Received nonlocal IPv{} datagram destined for {} ({})",
                packet.ip_version().unwrap_or_default(),
                dst_ip,
                packet.header_summary()
            );
            return Ok(true);
        }
        Ok(false)
    }

    /// Logs an ICMP packet destined for a foreign address.
    pub fn check_log_icmp(&self, packet: &PacketContext) -> Result<bool> {
        if !packet.is_icmp() {
            return Ok(false);
        }
        let Some(dst_ip) = self.foreign_destination(packet) else {
            return Ok(false);
        };

        let first = self
            .seen
            .lock()
            .map_err(|_| DivertError::lock_poisoned("ICMP sightings"))?
            .icmp
            .insert(dst_ip);

        if first || self.log_every_occurrence {
            let (icmp_type, code) = packet.icmp_type_code().unwrap_or_default();
            info!(
                "Received nonlocal ICMP type {} code {} destined for {}",
                icmp_type, code, dst_ip
            );
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::core::PacketBuilder;
    use std::thread;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn monitor(every: bool) -> NonlocalTrafficMonitor {
        let local: LocalAddresses = [ip("10.0.0.5")].into_iter().collect();
        NonlocalTrafficMonitor::new(Arc::new(local), every)
    }

    fn tcp_to(dst: &str) -> PacketContext {
        let raw = PacketBuilder::tcp(ip("10.0.0.5"), 40000, ip(dst), 80).build();
        PacketContext::parse("handle_outgoing", raw)
    }

    fn ping_to(dst: &str) -> PacketContext {
        let raw = PacketBuilder::icmp(ip("10.0.0.5"), ip(dst), 8, 0).build();
        PacketContext::parse("handle_outgoing", raw)
    }

    #[test]
    fn test_first_sighting_only() {
        let monitor = monitor(false);

        assert!(monitor.check_log_nonlocal(&tcp_to("198.51.100.7")).unwrap());
        assert!(!monitor.check_log_nonlocal(&tcp_to("198.51.100.7")).unwrap());
        assert!(monitor.check_log_nonlocal(&tcp_to("198.51.100.8")).unwrap());
    }

    #[test]
    fn test_every_occurrence() {
        let monitor = monitor(true);

        assert!(monitor.check_log_nonlocal(&tcp_to("198.51.100.7")).unwrap());
        assert!(monitor.check_log_nonlocal(&tcp_to("198.51.100.7")).unwrap());
    }

    #[test]
    fn test_local_destinations_ignored() {
        let monitor = monitor(true);

        assert!(!monitor.check_log_nonlocal(&tcp_to("10.0.0.5")).unwrap());
        assert!(!monitor.check_log_nonlocal(&tcp_to("127.0.0.1")).unwrap());
        assert!(!monitor.check_log_icmp(&ping_to("127.0.0.1")).unwrap());
    }

    #[test]
    fn test_icmp_logged_separately() {
        let monitor = monitor(false);
        let ping = ping_to("203.0.113.9");

        assert!(!monitor.check_log_nonlocal(&ping).unwrap());
        assert!(monitor.check_log_icmp(&ping).unwrap());
        assert!(!monitor.check_log_icmp(&ping).unwrap());

        // TCP to the same host is a separate first sighting
        assert!(monitor.check_log_nonlocal(&tcp_to("203.0.113.9")).unwrap());
        assert!(!monitor.check_log_icmp(&tcp_to("203.0.113.9")).unwrap());
    }

    #[test]
    fn test_concurrent_first_sighting_logs_once() {
        let monitor = Arc::new(monitor(false));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let monitor = Arc::clone(&monitor);
                thread::spawn(move || monitor.check_log_nonlocal(&tcp_to("198.51.100.7")).unwrap())
            })
            .collect();

        let logged = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|logged| *logged)
            .count();
        assert_eq!(logged, 1);
    }
}
