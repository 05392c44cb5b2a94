use crate::error::{DivertError, Result};
use crate::network::core::LocalAddresses;
use crate::network::firewall::{FirewallError, Iptables, RuleInstaller, RuleRecord, RuleRemoval, RuleSpec};
use crate::network::queue::nfqueue::{free_queue_numbers, NFNETLINK_QUEUE_PROC};
use crate::network::queue::{CaptureHandle, NfqueueHandle, QueueBinder, QueueError};
use crate::platform::Platform;
use log::debug;
use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::net::IpAddr;

/// NFQUEUE and iptables backed platform.
#[derive(Debug, Clone, Default)]
pub struct LinuxPlatform {
    iptables: Iptables,
}

impl LinuxPlatform {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RuleInstaller for LinuxPlatform {
    fn install(&self, spec: &RuleSpec) -> std::result::Result<RuleRecord, FirewallError> {
        self.iptables.install(spec)
    }

    fn remove(&self, rule: &RuleRecord) -> std::result::Result<RuleRemoval, FirewallError> {
        self.iptables.remove(rule)
    }
}

impl QueueBinder for LinuxPlatform {
    fn bind(&self, queue_number: u16) -> std::result::Result<Box<dyn CaptureHandle>, QueueError> {
        Ok(Box::new(NfqueueHandle::bind(queue_number)?))
    }
}

impl Platform for LinuxPlatform {
    fn is_privileged(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }

    fn next_queue_numbers(&self, count: usize) -> Result<Vec<u16>> {
        let listing = match fs::read_to_string(NFNETLINK_QUEUE_PROC) {
            Ok(listing) => listing,
            // The listing only exists once nfnetlink_queue is loaded; until then
            // no queue is bound
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => return Err(DivertError::Io(e)),
        };
        Ok(free_queue_numbers(&listing, count))
    }

    fn local_addresses(&self) -> Result<LocalAddresses> {
        let addresses = getifaddrs().map_err(std::io::Error::from)?;

        let local = addresses
            .filter_map(|ifa| {
                let address = ifa.address?;
                if let Some(v4) = address.as_sockaddr_in() {
                    Some(IpAddr::V4(v4.ip()))
                } else {
                    address.as_sockaddr_in6().map(|v6| IpAddr::V6(v6.ip()))
                }
            })
            .collect::<LocalAddresses>();

        debug!("Found {} local addresses", local.len());
        Ok(local)
    }

    fn interfaces(&self) -> Result<Vec<String>> {
        let addresses = getifaddrs().map_err(std::io::Error::from)?;

        let names: BTreeSet<String> = addresses
            .filter(|ifa| !ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK))
            .map(|ifa| ifa.interface_name)
            .collect();
        Ok(names.into_iter().collect())
    }

    fn snapshot_rules(&self) -> Result<String> {
        Ok(self.iptables.save()?)
    }

    fn flush_rules(&self) -> Result<()> {
        Ok(self.iptables.flush()?)
    }

    fn restore_rules(&self, snapshot: &str) -> Result<()> {
        Ok(self.iptables.restore(snapshot)?)
    }
}
