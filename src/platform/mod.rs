//! Host facilities the diverter depends on.
//!
//! Everything that touches the kernel (firewall rules, queue binding,
//! interface enumeration) goes through [`Platform`], so the engine can be
//! driven by a scripted substitute in tests.

pub mod linux;

use crate::error::Result;
use crate::network::core::LocalAddresses;
use crate::network::firewall::RuleInstaller;
use crate::network::queue::QueueBinder;

pub use linux::LinuxPlatform;

pub trait Platform: RuleInstaller + QueueBinder {
    /// Whether the process may install firewall rules and bind queues.
    fn is_privileged(&self) -> bool;

    /// Free netfilter queue numbers, lowest first.
    ///
    /// May return fewer than `count` numbers.
    fn next_queue_numbers(&self, count: usize) -> Result<Vec<u16>>;

    /// Addresses assigned to this host's interfaces.
    fn local_addresses(&self) -> Result<LocalAddresses>;

    /// Names of the non-loopback network interfaces.
    fn interfaces(&self) -> Result<Vec<String>>;

    /// Saves the current firewall rule set.
    fn snapshot_rules(&self) -> Result<String>;

    /// Removes every firewall rule.
    fn flush_rules(&self) -> Result<()>;

    /// Restores a rule set saved by `snapshot_rules`.
    fn restore_rules(&self, snapshot: &str) -> Result<()>;
}
