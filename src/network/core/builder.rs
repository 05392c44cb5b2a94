//! Synthetic packet construction.
//!
//! Builds well-formed IPv4/IPv6 datagrams with valid checksums. Used to
//! exercise the diversion pipeline without a live capture queue.

use crate::network::core::packet::wire_address;
use smoltcp::wire::{
    Icmpv4Message, Icmpv4Packet, Icmpv6Message, Icmpv6Packet, IpProtocol, Ipv4Address,
    Ipv4Packet, Ipv6Address, Ipv6Packet, TcpPacket, UdpPacket,
};
use std::net::IpAddr;

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const TCP_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const ICMP_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy)]
enum Kind {
    Tcp { src_port: u16, dst_port: u16 },
    Udp { src_port: u16, dst_port: u16 },
    Icmp { icmp_type: u8, code: u8 },
}

/// Builder for synthetic test packets.
///
/// # Example
///
/// ```rust
/// use netdivert::network::core::PacketBuilder;
///
/// let raw = PacketBuilder::tcp("10.0.0.5".parse().unwrap(), 40000,
///                              "198.51.100.7".parse().unwrap(), 80)
///     .payload(b"hello")
///     .build();
/// assert_eq!(raw[0] >> 4, 4);
/// ```
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    src: IpAddr,
    dst: IpAddr,
    kind: Kind,
    payload: Vec<u8>,
}

impl PacketBuilder {
    /// Starts a TCP SYN segment.
    pub fn tcp(src: IpAddr, src_port: u16, dst: IpAddr, dst_port: u16) -> Self {
        Self::new(src, dst, Kind::Tcp { src_port, dst_port })
    }

    /// Starts a UDP datagram.
    pub fn udp(src: IpAddr, src_port: u16, dst: IpAddr, dst_port: u16) -> Self {
        Self::new(src, dst, Kind::Udp { src_port, dst_port })
    }

    /// Starts an ICMP (or ICMPv6 for IPv6 addresses) message.
    pub fn icmp(src: IpAddr, dst: IpAddr, icmp_type: u8, code: u8) -> Self {
        Self::new(src, dst, Kind::Icmp { icmp_type, code })
    }

    fn new(src: IpAddr, dst: IpAddr, kind: Kind) -> Self {
        Self {
            src,
            dst,
            kind,
            payload: Vec::new(),
        }
    }

    /// Sets the application payload.
    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    /// Serializes the packet.
    ///
    /// Mixed address families fall back to the family of `src`.
    pub fn build(&self) -> Vec<u8> {
        let (src, dst) = match (self.src, self.dst) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => (IpAddr::V4(src), IpAddr::V4(dst)),
            (src, dst) => (IpAddr::V6(v6_mapped(src)), IpAddr::V6(v6_mapped(dst))),
        };
        let ipv4 = src.is_ipv4();

        let protocol = match self.kind {
            Kind::Tcp { .. } => IpProtocol::Tcp,
            Kind::Udp { .. } => IpProtocol::Udp,
            Kind::Icmp { .. } if ipv4 => IpProtocol::Icmp,
            Kind::Icmp { .. } => IpProtocol::Icmpv6,
        };
        let header_len = match self.kind {
            Kind::Tcp { .. } => TCP_HEADER_LEN,
            Kind::Udp { .. } => UDP_HEADER_LEN,
            Kind::Icmp { .. } => ICMP_HEADER_LEN,
        };
        let ip_len = if ipv4 { IPV4_HEADER_LEN } else { IPV6_HEADER_LEN };
        let segment_len = header_len + self.payload.len();

        let mut buffer = vec![0u8; ip_len + segment_len];
        buffer[ip_len + header_len..].copy_from_slice(&self.payload);

        match (src, dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                let mut packet = Ipv4Packet::new_unchecked(&mut buffer[..]);
                packet.set_version(4);
                packet.set_header_len(IPV4_HEADER_LEN as u8);
                packet.set_total_len((ip_len + segment_len) as u16);
                packet.set_ident(0x1234);
                packet.set_dont_frag(true);
                packet.set_hop_limit(64);
                packet.set_next_header(protocol);
                packet.set_src_addr(Ipv4Address::from_bytes(&s.octets()));
                packet.set_dst_addr(Ipv4Address::from_bytes(&d.octets()));
                packet.fill_checksum();
            }
            (s, d) => {
                let mut packet = Ipv6Packet::new_unchecked(&mut buffer[..]);
                packet.set_version(6);
                packet.set_payload_len(segment_len as u16);
                packet.set_next_header(protocol);
                packet.set_hop_limit(64);
                packet.set_src_addr(Ipv6Address::from_bytes(&v6_mapped(s).octets()));
                packet.set_dst_addr(Ipv6Address::from_bytes(&v6_mapped(d).octets()));
            }
        }

        let (src, dst) = (wire_address(src), wire_address(dst));
        let segment = &mut buffer[ip_len..];
        match self.kind {
            Kind::Tcp { src_port, dst_port } => {
                let mut tcp = TcpPacket::new_unchecked(segment);
                tcp.set_src_port(src_port);
                tcp.set_dst_port(dst_port);
                tcp.set_header_len(TCP_HEADER_LEN as u8);
                tcp.set_syn(true);
                tcp.set_window_len(0xffff);
                tcp.fill_checksum(&src, &dst);
            }
            Kind::Udp { src_port, dst_port } => {
                let mut udp = UdpPacket::new_unchecked(segment);
                udp.set_src_port(src_port);
                udp.set_dst_port(dst_port);
                udp.set_len(segment_len as u16);
                udp.fill_checksum(&src, &dst);
            }
            Kind::Icmp { icmp_type, code } if ipv4 => {
                let mut icmp = Icmpv4Packet::new_unchecked(segment);
                icmp.set_msg_type(Icmpv4Message::from(icmp_type));
                icmp.set_msg_code(code);
                icmp.fill_checksum();
            }
            Kind::Icmp { icmp_type, code } => {
                let mut icmp = Icmpv6Packet::new_unchecked(segment);
                icmp.set_msg_type(Icmpv6Message::from(icmp_type));
                icmp.set_msg_code(code);
                icmp.fill_checksum(&src, &dst);
            }
        }

        buffer
    }
}

fn v6_mapped(addr: IpAddr) -> std::net::Ipv6Addr {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}
