//! Hook pipeline.
//!
//! Runs a packet through the callback chains of its hook and turns the
//! outcome into exactly one verdict.

use crate::error::{DivertError, Result};
use crate::network::core::PacketContext;
use crate::network::modules::{
    Callback, CallbackContext, DiversionStatistics, HookChains, HookKind, NonlocalTrafficMonitor,
    RedirectionPolicy,
};
use crate::network::queue::Verdict;
use crate::settings::NetworkMode;
use crate::utils::hex_dump;
use log::{debug, error, trace, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Receives a copy of every packet a hook sees, e.g. to write a capture file.
pub trait CaptureSink: Send + Sync {
    fn record(&self, hook: HookKind, octets: &[u8]);

    /// Flushes and releases the sink once every queue has stopped.
    fn close(&self) -> Result<()>;
}

/// Verdict for one packet plus its rewritten bytes, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandledPacket {
    pub verdict: Verdict,
    /// Set only when a callback rewrote the packet
    pub replacement: Option<Vec<u8>>,
}

/// Callback chains of every hook, with the state they act on.
pub struct HookPipeline {
    mode: NetworkMode,
    monitor: Arc<NonlocalTrafficMonitor>,
    policy: Arc<RedirectionPolicy>,
    stats: Arc<DiversionStatistics>,
    sink: Option<Arc<dyn CaptureSink>>,
    nonlocal: HookChains,
    incoming: HookChains,
    outgoing: HookChains,
}

impl HookPipeline {
    pub fn new(
        mode: NetworkMode,
        monitor: Arc<NonlocalTrafficMonitor>,
        policy: Arc<RedirectionPolicy>,
        stats: Arc<DiversionStatistics>,
    ) -> Self {
        Self {
            mode,
            monitor,
            policy,
            stats,
            sink: None,
            nonlocal: HookKind::Nonlocal.chains(mode),
            incoming: HookKind::Incoming.chains(mode),
            outgoing: HookKind::Outgoing.chains(mode),
        }
    }

    /// Mirrors every packet into `sink` before it is processed.
    pub fn with_sink(mut self, sink: Arc<dyn CaptureSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn mode(&self) -> NetworkMode {
        self.mode
    }

    pub fn chains(&self, hook: HookKind) -> &HookChains {
        match hook {
            HookKind::Nonlocal => &self.nonlocal,
            HookKind::Incoming => &self.incoming,
            HookKind::Outgoing => &self.outgoing,
        }
    }

    fn invoke(
        &self,
        callback: Callback,
        packet: &mut PacketContext,
        ctx: &CallbackContext<'_>,
    ) -> Result<()> {
        trace!("{}: running {}", ctx.hook, callback.name());
        let acted = match callback {
            Callback::CheckLogNonlocal => self.monitor.check_log_nonlocal(packet)?,
            Callback::CheckLogIcmp => self.monitor.check_log_icmp(packet)?,
            Callback::MaybeRedirPort => self.policy.maybe_redir_port(packet)?,
            Callback::MaybeFixupSrcIp => self.policy.maybe_fixup_srcip(packet)?,
            Callback::MaybeRedirIp => self.policy.maybe_redir_ip(packet)?,
            Callback::MaybeFixupSport => self.policy.maybe_fixup_sport(packet)?,
        };
        if acted {
            self.stats.record_callback(callback);
        }
        Ok(())
    }

    /// Runs the network callbacks, then the transport callbacks when the
    /// packet carries TCP or UDP.
    ///
    /// Callbacks only observe and rewrite; the verdict is always accept.
    /// The first failing callback stops the chain and its error is
    /// returned after being logged with the packet's details.
    pub fn process(
        &self,
        packet: &mut PacketContext,
        network_callbacks: &[Callback],
        transport_callbacks: &[Callback],
    ) -> Result<Verdict> {
        let hook = packet.label().to_string();
        let ctx = CallbackContext { hook: &hook };

        let transport: &[Callback] = if packet.protocol().is_some() {
            transport_callbacks
        } else {
            &[]
        };

        for callback in network_callbacks.iter().chain(transport) {
            if let Err(e) = self.invoke(*callback, packet, &ctx) {
                self.log_failure(*callback, packet, &ctx, &e);
                return Err(e);
            }
        }

        Ok(Verdict::Accept)
    }

    fn log_failure(
        &self,
        callback: Callback,
        packet: &PacketContext,
        ctx: &CallbackContext<'_>,
        e: &DivertError,
    ) {
        error!(
            "Exception in {} callback {}: {}\n  packet: {}\n  rewrites: [{}]\n  octets: {}",
            ctx.hook,
            callback.name(),
            e,
            packet.header_summary(),
            packet.diff_summary(),
            hex_dump(packet.original_octets())
        );
    }

    /// Handles one packet delivered to `hook`.
    ///
    /// Always yields exactly one verdict. A callback failure yields
    /// accept with the packet's original bytes.
    pub fn handle(&self, hook: HookKind, raw_octets: Vec<u8>) -> HandledPacket {
        let counters = self.stats.hook(hook);
        counters.received.fetch_add(1, Ordering::Relaxed);

        if let Some(sink) = &self.sink {
            sink.record(hook, &raw_octets);
        }

        let mut packet = PacketContext::parse(hook.label(), raw_octets);
        let chains = self.chains(hook);

        match self.process(&mut packet, &chains.network, &chains.transport) {
            Ok(verdict) if packet.is_mangled() => {
                counters.mangled.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "{}: {} [{}]",
                    hook.label(),
                    packet.header_summary(),
                    packet.diff_summary()
                );
                HandledPacket {
                    verdict,
                    replacement: Some(packet.into_octets()),
                }
            }
            Ok(verdict) => HandledPacket {
                verdict,
                replacement: None,
            },
            Err(_) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "{}: accepting {} unmodified after callback failure",
                    hook.label(),
                    packet.header_summary()
                );
                HandledPacket {
                    verdict: Verdict::Accept,
                    replacement: None,
                }
            }
        }
    }
}
