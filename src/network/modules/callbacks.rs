//! Hook and callback definitions.
//!
//! Every hook runs two ordered callback chains: network-layer callbacks,
//! which see every packet, and transport-layer callbacks, which only run
//! when a TCP or UDP header was parsed. The chains are plain ordered
//! `Vec<Callback>` values selected by the network mode, so the execution
//! order is an explicit contract rather than an implicit attribute list.

use crate::settings::NetworkMode;
use std::fmt;

/// Kernel interception point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// Pre-routing observation of foreign destinations (MultiHost only)
    Nonlocal,
    /// Packets delivered to this host
    Incoming,
    /// Packets leaving this host
    Outgoing,
}

impl HookKind {
    /// Hooks used by a mode, in the order they must be started.
    pub fn for_mode(mode: NetworkMode) -> Vec<HookKind> {
        let mut hooks = Vec::with_capacity(3);
        if !mode.is_single_host() {
            hooks.push(HookKind::Nonlocal);
        }
        hooks.push(HookKind::Incoming);
        hooks.push(HookKind::Outgoing);
        hooks
    }

    /// Diagnostic label attached to packets from this hook.
    pub fn label(&self) -> &'static str {
        match self {
            HookKind::Nonlocal => "handle_nonlocal",
            HookKind::Incoming => "handle_incoming",
            HookKind::Outgoing => "handle_outgoing",
        }
    }

    /// Firewall chain feeding this hook.
    ///
    /// Mangling hooks must sit where they do not break the kernel NAT:
    /// PREROUTING/raw and OUTPUT/raw run before connection tracking,
    /// INPUT/mangle after NAT has already been applied.
    pub fn chain(&self) -> &'static str {
        match self {
            HookKind::Nonlocal => "PREROUTING",
            HookKind::Incoming => "INPUT",
            HookKind::Outgoing => "OUTPUT",
        }
    }

    /// Firewall table feeding this hook.
    pub fn table(&self) -> &'static str {
        match self {
            HookKind::Nonlocal => "raw",
            HookKind::Incoming => "mangle",
            HookKind::Outgoing => "raw",
        }
    }

    /// Hooks every mode needs. Only optional hooks honour an interface restriction.
    pub fn is_mode_mandatory(&self) -> bool {
        !matches!(self, HookKind::Nonlocal)
    }

    /// Callback chains this hook runs in the given mode.
    pub fn chains(&self, mode: NetworkMode) -> HookChains {
        let single_host = mode.is_single_host();
        let mut chains = HookChains::default();

        match self {
            HookKind::Nonlocal => {
                chains.network = vec![Callback::CheckLogNonlocal, Callback::CheckLogIcmp];
            }
            HookKind::Incoming => {
                chains.transport.push(Callback::MaybeRedirPort);
                if single_host {
                    chains.transport.push(Callback::MaybeFixupSrcIp);
                }
            }
            HookKind::Outgoing => {
                // Nonlocal detection must see the destination before
                // maybe_redir_ip overwrites it
                if single_host {
                    chains.network.push(Callback::CheckLogNonlocal);
                    chains.network.push(Callback::CheckLogIcmp);
                }
                chains.transport.push(Callback::MaybeFixupSport);
                if single_host {
                    chains.transport.push(Callback::MaybeRedirIp);
                }
            }
        }

        chains
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}/{})", self.label(), self.chain(), self.table())
    }
}

/// A single step of a callback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callback {
    /// Log packets destined for foreign addresses
    CheckLogNonlocal,
    /// Log ICMP packets destined for foreign addresses
    CheckLogIcmp,
    /// Send traffic for unbound ports to the default listener
    MaybeRedirPort,
    /// Loop incoming traffic through loopback and restore reply sources
    MaybeFixupSrcIp,
    /// Send foreign-destined traffic to loopback
    MaybeRedirIp,
    /// Restore the source port of listener replies
    MaybeFixupSport,
}

impl Callback {
    pub fn name(&self) -> &'static str {
        match self {
            Callback::CheckLogNonlocal => "check_log_nonlocal",
            Callback::CheckLogIcmp => "check_log_icmp",
            Callback::MaybeRedirPort => "maybe_redir_port",
            Callback::MaybeFixupSrcIp => "maybe_fixup_srcip",
            Callback::MaybeRedirIp => "maybe_redir_ip",
            Callback::MaybeFixupSport => "maybe_fixup_sport",
        }
    }
}

/// Ordered callbacks for one hook.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookChains {
    /// Run for every packet
    pub network: Vec<Callback>,
    /// Run only when a TCP/UDP header was parsed
    pub transport: Vec<Callback>,
}

/// Transient context handed to each callback.
#[derive(Debug, Clone, Copy)]
pub struct CallbackContext<'a> {
    /// Name of the hook invoking the callback
    pub hook: &'a str,
}
