//! Listener redirection.
//!
//! Rewrites destination ports so traffic for unbound ports reaches a default
//! listener, and (in SingleHost mode) loops traffic for foreign hosts through
//! loopback. Every rewrite is recorded so the reply leg can be restored and
//! the monitored process sees the peer it originally contacted.

use crate::error::{DivertError, Result};
use crate::network::core::{Field, LocalAddresses, PacketContext, Transport};
use log::debug;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex, MutexGuard};

/// Outcome of looking up a destination port in the listener registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerLookup {
    /// A listener is bound to the port; leave the packet alone
    Bound,
    /// Nothing is bound; send the packet to this default listener port
    RedirectTo(u16),
    /// Nothing is bound and the packet must not be redirected
    Unhandled,
}

/// Read-only view of the listeners bound on this host.
pub trait ListenerRegistry: Send + Sync {
    fn lookup(&self, transport: Transport, port: u16) -> ListenerLookup;
}

/// Translations recorded while rewriting packets.
///
/// Keys are ports only; a later rewrite for the same key replaces the
/// earlier one.
#[derive(Debug, Default)]
pub struct RedirectionState {
    /// (transport, listener port) -> original destination port
    ports: HashMap<(Transport, u16), u16>,
    /// (transport, client port) -> original destination port of a redirected flow
    flows: HashMap<(Transport, u16), u16>,
    /// source port -> foreign destination the process addressed
    foreign: HashMap<u16, IpAddr>,
    /// source port -> non-loopback source replaced with loopback
    local_sources: HashMap<u16, IpAddr>,
}

impl RedirectionState {
    /// Whether `port` was the destination of a flow sent to a default listener.
    fn is_original_port(&self, transport: Transport, port: u16) -> bool {
        self.ports
            .iter()
            .any(|(&(t, _), &original)| t == transport && original == port)
    }
}

/// Header rewriting callbacks shared by every hook.
pub struct RedirectionPolicy {
    registry: Arc<dyn ListenerRegistry>,
    local_addresses: Arc<LocalAddresses>,
    state: Mutex<RedirectionState>,
}

impl RedirectionPolicy {
    pub fn new(registry: Arc<dyn ListenerRegistry>, local_addresses: Arc<LocalAddresses>) -> Self {
        Self {
            registry,
            local_addresses,
            state: Mutex::new(RedirectionState::default()),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, RedirectionState>> {
        self.state
            .lock()
            .map_err(|_| DivertError::lock_poisoned("redirection state"))
    }

    /// Sends incoming traffic for an unbound port to the default listener.
    ///
    /// # Returns
    ///
    /// `true` if the destination port was rewritten.
    pub fn maybe_redir_port(&self, packet: &mut PacketContext) -> Result<bool> {
        let (Some(transport), Some(src_port), Some(dst_port)) =
            (packet.protocol(), packet.src_port(), packet.dst_port())
        else {
            return Ok(false);
        };

        let ListenerLookup::RedirectTo(listener) = self.registry.lookup(transport, dst_port) else {
            return Ok(false);
        };
        if listener == dst_port {
            return Ok(false);
        }
        if self.registry.lookup(transport, src_port) == ListenerLookup::Bound {
            // Reply sent by a listener bound on this host
            return Ok(false);
        }

        let mut state = self.state()?;
        if state.flows.get(&(transport, dst_port)) == Some(&src_port)
            || state.is_original_port(transport, src_port)
        {
            // Reply to a flow this policy redirected earlier
            return Ok(false);
        }

        packet.set_field(Field::DstPort, listener.into())?;
        state.ports.insert((transport, listener), dst_port);
        state.flows.insert((transport, src_port), dst_port);

        debug!(
            "{}: redirected {} port {} to default listener port {}",
            packet.label(),
            transport,
            dst_port,
            listener
        );
        Ok(true)
    }

    /// Restores the original port on replies from a default listener.
    pub fn maybe_fixup_sport(&self, packet: &mut PacketContext) -> Result<bool> {
        let (Some(transport), Some(src_port)) = (packet.protocol(), packet.src_port()) else {
            return Ok(false);
        };

        let state = self.state()?;
        let Some(original) = state.ports.get(&(transport, src_port)).copied() else {
            return Ok(false);
        };

        packet.set_field(Field::SrcPort, original.into())?;
        debug!(
            "{}: restored {} source port {} to {}",
            packet.label(),
            transport,
            src_port,
            original
        );
        Ok(true)
    }

    /// Sends outgoing traffic for a foreign host to loopback.
    pub fn maybe_redir_ip(&self, packet: &mut PacketContext) -> Result<bool> {
        let (Some(dst_ip), Some(src_port)) = (packet.dst_ip(), packet.src_port()) else {
            return Ok(false);
        };
        if self.local_addresses.is_local(&dst_ip) {
            return Ok(false);
        }

        let mut state = self.state()?;
        packet.set_field(Field::DstIp, loopback_for(&dst_ip).into())?;
        state.foreign.insert(src_port, dst_ip);

        debug!(
            "{}: redirected foreign destination {} to loopback",
            packet.label(),
            dst_ip
        );
        Ok(true)
    }

    /// Loops incoming traffic through loopback, or restores the foreign peer
    /// on the reply leg of a flow `maybe_redir_ip` rewrote.
    pub fn maybe_fixup_srcip(&self, packet: &mut PacketContext) -> Result<bool> {
        let (Some(src_ip), Some(src_port), Some(dst_port)) =
            (packet.src_ip(), packet.src_port(), packet.dst_port())
        else {
            return Ok(false);
        };

        let mut state = self.state()?;

        if src_ip.is_loopback() {
            let Some(foreign) = state.foreign.get(&dst_port).copied() else {
                return Ok(false);
            };
            // Port-keyed maps can pair flows of different families
            if foreign.is_ipv4() != src_ip.is_ipv4() {
                return Ok(false);
            }

            packet.set_field(Field::SrcIp, foreign.into())?;
            if let Some(local) = state.local_sources.get(&dst_port).copied() {
                packet.set_field(Field::DstIp, local.into())?;
            }
            debug!(
                "{}: restored reply source {} on port {}",
                packet.label(),
                foreign,
                dst_port
            );
            return Ok(true);
        }

        packet.set_field(Field::SrcIp, loopback_for(&src_ip).into())?;
        state.local_sources.insert(src_port, src_ip);

        debug!(
            "{}: replaced source {} with loopback",
            packet.label(),
            src_ip
        );
        Ok(true)
    }

    /// Original destination port recorded for a listener port.
    pub fn original_port(&self, transport: Transport, listener_port: u16) -> Result<Option<u16>> {
        Ok(self.state()?.ports.get(&(transport, listener_port)).copied())
    }

    /// Foreign destination recorded for a source port.
    pub fn foreign_ip_for(&self, src_port: u16) -> Result<Option<IpAddr>> {
        Ok(self.state()?.foreign.get(&src_port).copied())
    }
}

#[cfg(test)]
impl RedirectionPolicy {
    /// Poisons the state lock so every later callback fails.
    pub(crate) fn poison_for_test(&self) {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = self.state.lock();
            panic!("poisoning redirection state");
        }));
    }
}

/// Loopback address of the same family as `ip`.
fn loopback_for(ip: &IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::core::{FieldValue, PacketBuilder};

    const LISTENER: u16 = 1337;

    struct Listeners;

    impl ListenerRegistry for Listeners {
        fn lookup(&self, _transport: Transport, port: u16) -> ListenerLookup {
            match port {
                53 | LISTENER => ListenerLookup::Bound,
                139 => ListenerLookup::Unhandled,
                _ => ListenerLookup::RedirectTo(LISTENER),
            }
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn policy() -> RedirectionPolicy {
        let local: LocalAddresses = [ip("10.0.0.5"), ip("fe80::5")].into_iter().collect();
        RedirectionPolicy::new(Arc::new(Listeners), Arc::new(local))
    }

    fn tcp(label: &str, src: &str, sport: u16, dst: &str, dport: u16) -> PacketContext {
        PacketContext::parse(
            label,
            PacketBuilder::tcp(ip(src), sport, ip(dst), dport).build(),
        )
    }

    #[test]
    fn test_redir_port_unbound() {
        let policy = policy();
        let mut packet = tcp("handle_incoming", "10.0.0.9", 40000, "10.0.0.5", 8080);

        assert!(policy.maybe_redir_port(&mut packet).unwrap());
        assert_eq!(packet.dst_port(), Some(LISTENER));
        assert!(packet.checksums_valid());
        assert_eq!(
            policy.original_port(Transport::Tcp, LISTENER).unwrap(),
            Some(8080)
        );
    }

    #[test]
    fn test_redir_port_leaves_bound_and_blacklisted() {
        let policy = policy();

        let mut bound = tcp("handle_incoming", "10.0.0.9", 40000, "10.0.0.5", 53);
        assert!(!policy.maybe_redir_port(&mut bound).unwrap());
        assert!(!bound.is_mangled());

        let mut blacklisted = tcp("handle_incoming", "10.0.0.9", 40000, "10.0.0.5", 139);
        assert!(!policy.maybe_redir_port(&mut blacklisted).unwrap());
        assert!(!blacklisted.is_mangled());
    }

    #[test]
    fn test_redir_port_skips_icmp() {
        let policy = policy();
        let raw = PacketBuilder::icmp(ip("10.0.0.9"), ip("10.0.0.5"), 8, 0).build();
        let mut packet = PacketContext::parse("handle_incoming", raw);

        assert!(!policy.maybe_redir_port(&mut packet).unwrap());
        assert!(!packet.is_mangled());
    }

    #[test]
    fn test_port_round_trip() {
        let policy = policy();

        let mut request = tcp("handle_incoming", "10.0.0.9", 40000, "10.0.0.5", 8080);
        policy.maybe_redir_port(&mut request).unwrap();

        let mut reply = tcp("handle_outgoing", "10.0.0.5", LISTENER, "10.0.0.9", 40000);
        assert!(policy.maybe_fixup_sport(&mut reply).unwrap());
        assert_eq!(reply.src_port(), Some(8080));
        assert!(reply.checksums_valid());

        let mut unrelated = tcp("handle_outgoing", "10.0.0.5", 2222, "10.0.0.9", 40000);
        assert!(!policy.maybe_fixup_sport(&mut unrelated).unwrap());
    }

    #[test]
    fn test_last_write_wins() {
        let policy = policy();

        let mut first = tcp("handle_incoming", "10.0.0.9", 40000, "10.0.0.5", 8080);
        policy.maybe_redir_port(&mut first).unwrap();
        let mut second = tcp("handle_incoming", "10.0.0.9", 40001, "10.0.0.5", 9090);
        policy.maybe_redir_port(&mut second).unwrap();

        assert_eq!(
            policy.original_port(Transport::Tcp, LISTENER).unwrap(),
            Some(9090)
        );
    }

    #[test]
    fn test_redir_ip_foreign_only() {
        let policy = policy();

        let mut foreign = tcp("handle_outgoing", "10.0.0.5", 40000, "198.51.100.7", 80);
        assert!(policy.maybe_redir_ip(&mut foreign).unwrap());
        assert_eq!(foreign.dst_ip(), Some(ip("127.0.0.1")));
        assert_eq!(policy.foreign_ip_for(40000).unwrap(), Some(ip("198.51.100.7")));

        let mut local = tcp("handle_outgoing", "10.0.0.5", 40001, "10.0.0.5", 80);
        assert!(!policy.maybe_redir_ip(&mut local).unwrap());

        let mut v6 = tcp("handle_outgoing", "fe80::5", 40002, "2001:db8::7", 443);
        assert!(policy.maybe_redir_ip(&mut v6).unwrap());
        assert_eq!(v6.dst_ip(), Some(ip("::1")));
    }

    #[test]
    fn test_fixup_srcip_loops_through_loopback() {
        let policy = policy();
        let mut packet = tcp("handle_incoming", "10.0.0.5", 40000, "127.0.0.1", LISTENER);

        assert!(policy.maybe_fixup_srcip(&mut packet).unwrap());
        assert_eq!(packet.src_ip(), Some(ip("127.0.0.1")));
        assert_eq!(
            packet.field_diff().get(&Field::SrcIp),
            Some(&(FieldValue::Ip(ip("10.0.0.5")), FieldValue::Ip(ip("127.0.0.1"))))
        );
    }

    #[test]
    fn test_fixup_srcip_restores_reply() {
        let policy = policy();

        let mut request = tcp("handle_outgoing", "10.0.0.5", 40000, "198.51.100.7", 80);
        policy.maybe_redir_ip(&mut request).unwrap();
        let mut looped = tcp("handle_incoming", "10.0.0.5", 40000, "127.0.0.1", 80);
        policy.maybe_fixup_srcip(&mut looped).unwrap();

        let mut reply = tcp("handle_incoming", "127.0.0.1", 80, "127.0.0.1", 40000);
        assert!(policy.maybe_fixup_srcip(&mut reply).unwrap());
        assert_eq!(reply.src_ip(), Some(ip("198.51.100.7")));
        assert_eq!(reply.dst_ip(), Some(ip("10.0.0.5")));
        assert!(reply.checksums_valid());
    }

    #[test]
    fn test_fixup_srcip_ignores_unknown_loopback() {
        let policy = policy();
        let mut packet = tcp("handle_incoming", "127.0.0.1", 5000, "127.0.0.1", 6000);

        assert!(!policy.maybe_fixup_srcip(&mut packet).unwrap());
        assert!(!packet.is_mangled());
    }

    #[test]
    fn test_reply_is_not_redirected_again() {
        let policy = policy();

        let mut request = tcp("handle_incoming", "10.0.0.5", 40000, "127.0.0.1", 8080);
        policy.maybe_redir_port(&mut request).unwrap();
        assert_eq!(request.dst_port(), Some(LISTENER));

        // Listener reply after maybe_fixup_sport restored port 8080
        let mut reply = tcp("handle_incoming", "127.0.0.1", 8080, "127.0.0.1", 40000);
        assert!(!policy.maybe_redir_port(&mut reply).unwrap());
        assert_eq!(reply.dst_port(), Some(40000));
    }

    #[test]
    fn test_reply_from_bound_listener_keeps_client_port() {
        let policy = policy();

        let mut reply = tcp("handle_incoming", "127.0.0.1", 53, "127.0.0.1", 40000);
        assert!(!policy.maybe_redir_port(&mut reply).unwrap());
        assert_eq!(reply.dst_port(), Some(40000));
        assert!(!reply.is_mangled());
        assert_eq!(policy.original_port(Transport::Tcp, LISTENER).unwrap(), None);
    }

    #[test]
    fn test_reply_from_restored_port_on_new_client_port() {
        let policy = policy();

        let mut request = tcp("handle_incoming", "10.0.0.9", 40000, "10.0.0.5", 8080);
        policy.maybe_redir_port(&mut request).unwrap();

        // Same service answering a different client port than the one recorded
        let mut reply = tcp("handle_incoming", "10.0.0.5", 8080, "10.0.0.9", 40007);
        assert!(!policy.maybe_redir_port(&mut reply).unwrap());
        assert_eq!(reply.dst_port(), Some(40007));
    }
}
