use crate::network::modules::callbacks::{Callback, HookKind};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Packet counters for one hook.
///
/// # Fields
///
/// * `received` - Packets handed to the hook by the kernel
/// * `mangled` - Packets returned with rewritten headers
/// * `failed` - Packets accepted unmodified after a callback failure
#[derive(Debug, Default)]
pub struct HookCounters {
    pub received: AtomicU64,
    pub mangled: AtomicU64,
    pub failed: AtomicU64,
}

impl HookCounters {
    fn snapshot(&self) -> HookSnapshot {
        HookSnapshot {
            received: self.received.load(Ordering::Relaxed),
            mangled: self.mangled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Statistics shared by every capture worker.
///
/// Counters are plain atomics so workers never contend on a lock just to
/// count a packet.
#[derive(Debug, Default)]
pub struct DiversionStatistics {
    nonlocal: HookCounters,
    incoming: HookCounters,
    outgoing: HookCounters,
    nonlocal_logged: AtomicU64,
    icmp_logged: AtomicU64,
    ports_redirected: AtomicU64,
    ports_restored: AtomicU64,
    ips_redirected: AtomicU64,
    sources_fixed: AtomicU64,
}

impl DiversionStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for the given hook.
    pub fn hook(&self, hook: HookKind) -> &HookCounters {
        match hook {
            HookKind::Nonlocal => &self.nonlocal,
            HookKind::Incoming => &self.incoming,
            HookKind::Outgoing => &self.outgoing,
        }
    }

    /// Records that a callback acted on a packet (logged or rewrote it).
    pub fn record_callback(&self, callback: Callback) {
        let counter = match callback {
            Callback::CheckLogNonlocal => &self.nonlocal_logged,
            Callback::CheckLogIcmp => &self.icmp_logged,
            Callback::MaybeRedirPort => &self.ports_redirected,
            Callback::MaybeFixupSport => &self.ports_restored,
            Callback::MaybeRedirIp => &self.ips_redirected,
            Callback::MaybeFixupSrcIp => &self.sources_fixed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            nonlocal: self.nonlocal.snapshot(),
            incoming: self.incoming.snapshot(),
            outgoing: self.outgoing.snapshot(),
            nonlocal_logged: self.nonlocal_logged.load(Ordering::Relaxed),
            icmp_logged: self.icmp_logged.load(Ordering::Relaxed),
            ports_redirected: self.ports_redirected.load(Ordering::Relaxed),
            ports_restored: self.ports_restored.load(Ordering::Relaxed),
            ips_redirected: self.ips_redirected.load(Ordering::Relaxed),
            sources_fixed: self.sources_fixed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookSnapshot {
    pub received: u64,
    pub mangled: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    pub nonlocal: HookSnapshot,
    pub incoming: HookSnapshot,
    pub outgoing: HookSnapshot,
    pub nonlocal_logged: u64,
    pub icmp_logged: u64,
    pub ports_redirected: u64,
    pub ports_restored: u64,
    pub ips_redirected: u64,
    pub sources_fixed: u64,
}

impl StatisticsSnapshot {
    pub fn total_received(&self) -> u64 {
        self.nonlocal.received + self.incoming.received + self.outgoing.received
    }

    pub fn total_failed(&self) -> u64 {
        self.nonlocal.failed + self.incoming.failed + self.outgoing.failed
    }
}

impl fmt::Display for HookSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} received, {} mangled, {} failed",
            self.received, self.mangled, self.failed
        )
    }
}
