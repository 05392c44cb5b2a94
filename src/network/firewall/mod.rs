//! Firewall rules steering traffic into the diverter.
//!
//! Every rule the engine installs is described by a [`RuleSpec`], installed
//! through a [`RuleInstaller`] and recorded in the [`RuleLedger`] so it can
//! be removed again on shutdown or after a failed startup.

pub mod iptables;
pub mod ledger;

use std::fmt;
use thiserror::Error;

pub use iptables::Iptables;
pub use ledger::{RemovalSummary, RuleLedger};

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("Failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },
}

/// A rule to install: table, chain, match and target arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleSpec {
    pub table: String,
    pub chain: String,
    pub args: Vec<String>,
}

impl RuleSpec {
    pub fn new(table: impl Into<String>, chain: impl Into<String>, args: &[&str]) -> Self {
        Self {
            table: table.into(),
            chain: chain.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Sends every packet traversing `chain` to netfilter queue `queue_number`.
    ///
    /// # Arguments
    ///
    /// * `chain` - Chain to hook, e.g. `OUTPUT`
    /// * `table` - Table holding the chain, e.g. `raw`
    /// * `interface` - Restricts the rule to one interface when set
    /// * `queue_number` - Queue a capture worker is bound to
    pub fn nfqueue(chain: &str, table: &str, interface: Option<&str>, queue_number: u16) -> Self {
        let mut args = Vec::new();
        if let Some(iface) = interface {
            args.push(interface_flag(chain).to_string());
            args.push(iface.to_string());
        }
        args.extend(
            ["-j", "NFQUEUE", "--queue-num", &queue_number.to_string()]
                .iter()
                .map(|a| a.to_string()),
        );
        // Traffic keeps flowing unmodified until the worker has bound the queue
        args.push("--queue-bypass".to_string());

        Self {
            table: table.to_string(),
            chain: chain.to_string(),
            args,
        }
    }

    /// Redirects locally generated ICMP back to this host so pings to any
    /// address get a reply.
    pub fn icmp_redirect() -> Self {
        Self::new("nat", "OUTPUT", &["-p", "icmp", "-j", "REDIRECT"])
    }

    /// Redirects traffic arriving on `iface` for any address to this host.
    pub fn interface_redirect(iface: &str) -> Self {
        Self::new("nat", "PREROUTING", &["-i", iface, "-j", "REDIRECT"])
    }
}

impl fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-t {} {} {}", self.table, self.chain, self.args.join(" "))
    }
}

fn interface_flag(chain: &str) -> &'static str {
    match chain {
        "OUTPUT" | "POSTROUTING" => "-o",
        _ => "-i",
    }
}

/// An installed rule, carrying everything needed to reverse it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleRecord {
    spec: RuleSpec,
}

impl RuleRecord {
    pub fn new(spec: RuleSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &RuleSpec {
        &self.spec
    }
}

impl fmt::Display for RuleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.spec.fmt(f)
    }
}

/// Result of removing a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleRemoval {
    Removed,
    /// The rule was already gone, e.g. flushed by someone else
    AlreadyAbsent,
}

/// Installs and removes firewall rules.
pub trait RuleInstaller: Send + Sync {
    fn install(&self, spec: &RuleSpec) -> Result<RuleRecord, FirewallError>;

    /// Removes a rule. Removing a rule that no longer exists is not an error.
    fn remove(&self, rule: &RuleRecord) -> Result<RuleRemoval, FirewallError>;
}
