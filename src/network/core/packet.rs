//! Parsed view of a single intercepted packet.
//!
//! A `PacketContext` is built from the raw bytes delivered by a capture
//! queue, exposes the header fields the diversion callbacks care about and
//! keeps track of every rewrite so the verdict step knows whether the
//! mutated bytes must replace the original ones. Header access and checksum
//! recalculation go through `smoltcp::wire`.

use log::debug;
use serde::{Deserialize, Serialize};
use smoltcp::wire::{
    Icmpv4Packet, Icmpv6Packet, IpAddress, IpProtocol, Ipv4Address, Ipv4Packet, Ipv6Address,
    Ipv6Packet, TcpPacket, UdpPacket,
};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

/// Transport protocols the diverter can redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    /// Maps an IP protocol to a supported transport.
    pub fn from_protocol(protocol: IpProtocol) -> Option<Self> {
        match protocol {
            IpProtocol::Tcp => Some(Transport::Tcp),
            IpProtocol::Udp => Some(Transport::Udp),
            _ => None,
        }
    }

    pub fn ip_protocol(&self) -> IpProtocol {
        match self {
            Transport::Tcp => IpProtocol::Tcp,
            Transport::Udp => IpProtocol::Udp,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "TCP"),
            Transport::Udp => write!(f, "UDP"),
        }
    }
}

/// Header fields that callbacks may rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    SrcIp,
    DstIp,
    SrcPort,
    DstPort,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::SrcIp => "src_ip",
            Field::DstIp => "dst_ip",
            Field::SrcPort => "src_port",
            Field::DstPort => "dst_port",
        };
        f.write_str(name)
    }
}

/// Value of a rewritable header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue {
    Ip(IpAddr),
    Port(u16),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Ip(ip) => write!(f, "{}", ip),
            FieldValue::Port(port) => write!(f, "{}", port),
        }
    }
}

impl From<IpAddr> for FieldValue {
    fn from(ip: IpAddr) -> Self {
        FieldValue::Ip(ip)
    }
}

impl From<u16> for FieldValue {
    fn from(port: u16) -> Self {
        FieldValue::Port(port)
    }
}

/// Errors raised when rewriting a packet.
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("{field} is not present in {summary}")]
    MissingField { field: Field, summary: String },

    #[error("{value} is not a valid value for {field}")]
    TypeMismatch { field: Field, value: FieldValue },

    #[error("address {0} does not match the packet's IP version")]
    FamilyMismatch(IpAddr),
}

/// Converts a std address into its `smoltcp` wire form.
pub(crate) fn wire_address(ip: IpAddr) -> IpAddress {
    match ip {
        IpAddr::V4(v4) => IpAddress::Ipv4(Ipv4Address::from_bytes(&v4.octets())),
        IpAddr::V6(v6) => IpAddress::Ipv6(Ipv6Address::from_bytes(&v6.octets())),
    }
}

/// Header fields decoded from the network and transport layers.
#[derive(Debug, Clone, Copy, Default)]
struct Headers {
    ip_version: Option<u8>,
    ip_protocol: Option<u8>,
    protocol: Option<Transport>,
    src_ip: Option<IpAddr>,
    dst_ip: Option<IpAddr>,
    src_port: Option<u16>,
    dst_port: Option<u16>,
    icmp: Option<(u8, u8)>,
}

impl Headers {
    fn decode(data: &[u8]) -> Self {
        let mut headers = Headers::default();
        match data.first().map(|b| b >> 4) {
            Some(4) => headers.decode_ipv4(data),
            Some(6) => headers.decode_ipv6(data),
            _ => {}
        }
        headers
    }

    fn decode_ipv4(&mut self, data: &[u8]) {
        let Ok(ip) = Ipv4Packet::new_checked(data) else {
            return;
        };

        self.ip_version = Some(4);
        self.ip_protocol = Some(u8::from(ip.next_header()));
        self.src_ip = Some(IpAddr::V4(Ipv4Addr::from(ip.src_addr().0)));
        self.dst_ip = Some(IpAddr::V4(Ipv4Addr::from(ip.dst_addr().0)));

        // Only the first fragment carries a transport header, and only a
        // whole datagram can have its checksum recomputed
        if ip.more_frags() || ip.frag_offset() != 0 {
            return;
        }

        if ip.next_header() == IpProtocol::Icmp {
            self.icmp = Icmpv4Packet::new_checked(ip.payload())
                .ok()
                .map(|icmp| (u8::from(icmp.msg_type()), icmp.msg_code()));
            return;
        }
        self.decode_transport(ip.next_header(), ip.payload());
    }

    fn decode_ipv6(&mut self, data: &[u8]) {
        let Ok(ip) = Ipv6Packet::new_checked(data) else {
            return;
        };

        self.ip_version = Some(6);
        self.ip_protocol = Some(u8::from(ip.next_header()));
        self.src_ip = Some(IpAddr::V6(Ipv6Addr::from(ip.src_addr().0)));
        self.dst_ip = Some(IpAddr::V6(Ipv6Addr::from(ip.dst_addr().0)));

        // Jumbograms carry a zero payload length
        if ip.payload_len() == 0 {
            return;
        }

        if ip.next_header() == IpProtocol::Icmpv6 {
            self.icmp = Icmpv6Packet::new_checked(ip.payload())
                .ok()
                .map(|icmp| (u8::from(icmp.msg_type()), icmp.msg_code()));
            return;
        }
        self.decode_transport(ip.next_header(), ip.payload());
    }

    fn decode_transport(&mut self, next_header: IpProtocol, segment: &[u8]) {
        let ports = match Transport::from_protocol(next_header) {
            Some(Transport::Tcp) => TcpPacket::new_checked(segment)
                .ok()
                .map(|tcp| (Transport::Tcp, tcp.src_port(), tcp.dst_port())),
            Some(Transport::Udp) => UdpPacket::new_checked(segment)
                .ok()
                .map(|udp| (Transport::Udp, udp.src_port(), udp.dst_port())),
            None => return,
        };

        if let Some((transport, src_port, dst_port)) = ports {
            self.protocol = Some(transport);
            self.src_port = Some(src_port);
            self.dst_port = Some(dst_port);
        }
    }
}

/// A packet flowing through one hook, with its parsed header fields.
#[derive(Debug, Clone)]
pub struct PacketContext {
    label: String,
    original_octets: Vec<u8>,
    /// Only allocated once a field is rewritten
    working_octets: Option<Vec<u8>>,
    headers: Headers,
    mangled: bool,
    field_diff: BTreeMap<Field, (FieldValue, FieldValue)>,
}

impl PacketContext {
    /// Parses raw octets delivered by a hook.
    ///
    /// Never fails: fields that cannot be decoded are left unset so the packet
    /// can still be forwarded and logged.
    pub fn parse(label: impl Into<String>, raw_octets: Vec<u8>) -> Self {
        let label = label.into();
        let headers = Headers::decode(&raw_octets);

        if headers.ip_version.is_none() {
            debug!(
                "{}: unparseable network layer ({} bytes)",
                label,
                raw_octets.len()
            );
        } else if headers.protocol.is_none()
            && headers
                .ip_protocol
                .and_then(|p| Transport::from_protocol(IpProtocol::from(p)))
                .is_some()
        {
            debug!("{}: transport header not decoded, treating as network-layer only", label);
        }

        PacketContext {
            label,
            original_octets: raw_octets,
            working_octets: None,
            headers,
            mangled: false,
            field_diff: BTreeMap::new(),
        }
    }

    /// Diagnostic tag of the hook that produced this packet.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn ip_version(&self) -> Option<u8> {
        self.headers.ip_version
    }

    /// Raw protocol number from the network header.
    pub fn ip_protocol(&self) -> Option<u8> {
        self.headers.ip_protocol
    }

    /// Supported transport, `None` when the transport layer was not parsed.
    pub fn protocol(&self) -> Option<Transport> {
        self.headers.protocol
    }

    pub fn src_ip(&self) -> Option<IpAddr> {
        self.headers.src_ip
    }

    pub fn dst_ip(&self) -> Option<IpAddr> {
        self.headers.dst_ip
    }

    pub fn src_port(&self) -> Option<u16> {
        self.headers.src_port
    }

    pub fn dst_port(&self) -> Option<u16> {
        self.headers.dst_port
    }

    pub fn is_mangled(&self) -> bool {
        self.mangled
    }

    /// Every rewrite applied so far, as (original, current) pairs.
    pub fn field_diff(&self) -> &BTreeMap<Field, (FieldValue, FieldValue)> {
        &self.field_diff
    }

    /// Bytes exactly as delivered by the hook.
    pub fn original_octets(&self) -> &[u8] {
        &self.original_octets
    }

    /// Whether this is an ICMP (IPv4) or ICMPv6 (IPv6) packet.
    pub fn is_icmp(&self) -> bool {
        matches!(
            (self.headers.ip_version, self.headers.ip_protocol.map(IpProtocol::from)),
            (Some(4), Some(IpProtocol::Icmp)) | (Some(6), Some(IpProtocol::Icmpv6))
        )
    }

    /// ICMP type and code, when the message header is present.
    pub fn icmp_type_code(&self) -> Option<(u8, u8)> {
        self.headers.icmp
    }

    /// Returns the current bytes of the packet.
    pub fn serialize(&self) -> &[u8] {
        self.working_octets
            .as_deref()
            .unwrap_or(&self.original_octets)
    }

    /// Consumes the context, returning the current bytes.
    pub fn into_octets(self) -> Vec<u8> {
        self.working_octets.unwrap_or(self.original_octets)
    }

    /// Current value of a rewritable field.
    pub fn field(&self, field: Field) -> Option<FieldValue> {
        match field {
            Field::SrcIp => self.headers.src_ip.map(FieldValue::Ip),
            Field::DstIp => self.headers.dst_ip.map(FieldValue::Ip),
            Field::SrcPort => self.headers.src_port.map(FieldValue::Port),
            Field::DstPort => self.headers.dst_port.map(FieldValue::Port),
        }
    }

    /// Rewrites one header field and recomputes the dependent checksums.
    ///
    /// Setting a field to its current value leaves the packet untouched.
    pub fn set_field(&mut self, field: Field, value: FieldValue) -> Result<(), PacketError> {
        let Some(current) = self.field(field) else {
            return Err(PacketError::MissingField {
                field,
                summary: self.header_summary(),
            });
        };

        if current == value {
            return Ok(());
        }

        match (field, value) {
            (Field::SrcIp | Field::DstIp, FieldValue::Ip(ip)) => self.write_ip(field, ip)?,
            (Field::SrcPort | Field::DstPort, FieldValue::Port(port)) => {
                self.write_port(field, port)
            }
            _ => return Err(PacketError::TypeMismatch { field, value }),
        }

        self.recompute_checksums();
        self.mangled = true;
        self.field_diff
            .entry(field)
            .and_modify(|diff| diff.1 = value)
            .or_insert((current, value));

        Ok(())
    }

    fn working_mut(&mut self) -> &mut [u8] {
        let original = &self.original_octets;
        self.working_octets
            .get_or_insert_with(|| original.clone())
            .as_mut_slice()
    }

    // The working bytes passed `new_checked` in `parse`, so the unchecked
    // views below stay in bounds.

    fn write_ip(&mut self, field: Field, ip: IpAddr) -> Result<(), PacketError> {
        let ip_version = self.headers.ip_version;
        match (ip_version, ip) {
            (Some(4), IpAddr::V4(v4)) => {
                let address = Ipv4Address::from_bytes(&v4.octets());
                let mut packet = Ipv4Packet::new_unchecked(self.working_mut());
                if field == Field::SrcIp {
                    packet.set_src_addr(address);
                } else {
                    packet.set_dst_addr(address);
                }
            }
            (Some(6), IpAddr::V6(v6)) => {
                let address = Ipv6Address::from_bytes(&v6.octets());
                let mut packet = Ipv6Packet::new_unchecked(self.working_mut());
                if field == Field::SrcIp {
                    packet.set_src_addr(address);
                } else {
                    packet.set_dst_addr(address);
                }
            }
            _ => return Err(PacketError::FamilyMismatch(ip)),
        }

        if field == Field::SrcIp {
            self.headers.src_ip = Some(ip);
        } else {
            self.headers.dst_ip = Some(ip);
        }
        Ok(())
    }

    fn write_port(&mut self, field: Field, port: u16) {
        let protocol = self.headers.protocol;
        let ip_version = self.headers.ip_version;
        let data = self.working_mut();

        let mut ipv4;
        let mut ipv6;
        let segment = if ip_version == Some(4) {
            ipv4 = Ipv4Packet::new_unchecked(data);
            ipv4.payload_mut()
        } else {
            ipv6 = Ipv6Packet::new_unchecked(data);
            ipv6.payload_mut()
        };

        match (protocol, field) {
            (Some(Transport::Tcp), Field::SrcPort) => {
                TcpPacket::new_unchecked(segment).set_src_port(port)
            }
            (Some(Transport::Tcp), _) => TcpPacket::new_unchecked(segment).set_dst_port(port),
            (Some(Transport::Udp), Field::SrcPort) => {
                UdpPacket::new_unchecked(segment).set_src_port(port)
            }
            (Some(Transport::Udp), _) => UdpPacket::new_unchecked(segment).set_dst_port(port),
            (None, _) => return,
        }

        if field == Field::SrcPort {
            self.headers.src_port = Some(port);
        } else {
            self.headers.dst_port = Some(port);
        }
    }

    fn recompute_checksums(&mut self) {
        let Headers {
            ip_version,
            protocol,
            src_ip,
            dst_ip,
            ..
        } = self.headers;
        let (Some(src), Some(dst)) = (src_ip, dst_ip) else {
            return;
        };
        let (src, dst) = (wire_address(src), wire_address(dst));
        let data = self.working_mut();

        match ip_version {
            Some(4) => {
                let mut packet = Ipv4Packet::new_unchecked(data);
                packet.fill_checksum();
                fill_transport_checksum(protocol, packet.payload_mut(), &src, &dst, true);
            }
            Some(6) => {
                let mut packet = Ipv6Packet::new_unchecked(data);
                fill_transport_checksum(protocol, packet.payload_mut(), &src, &dst, false);
            }
            _ => {}
        }
    }

    /// Verifies the IPv4 header and TCP/UDP checksums of the current bytes.
    pub fn checksums_valid(&self) -> bool {
        let data = self.serialize();
        let (Some(src), Some(dst)) = (self.headers.src_ip, self.headers.dst_ip) else {
            return true;
        };
        let (src, dst) = (wire_address(src), wire_address(dst));

        let segment = match self.headers.ip_version {
            Some(4) => {
                let packet = Ipv4Packet::new_unchecked(data);
                if !packet.verify_checksum() {
                    return false;
                }
                packet.payload()
            }
            Some(6) => Ipv6Packet::new_unchecked(data).payload(),
            _ => return true,
        };

        match self.headers.protocol {
            Some(Transport::Tcp) => TcpPacket::new_unchecked(segment).verify_checksum(&src, &dst),
            Some(Transport::Udp) => UdpPacket::new_unchecked(segment).verify_checksum(&src, &dst),
            None => true,
        }
    }

    /// One-line description of the packet for logs.
    pub fn header_summary(&self) -> String {
        let headers = &self.headers;
        match (headers.protocol, headers.src_ip, headers.dst_ip) {
            (Some(transport), Some(src), Some(dst)) => format!(
                "{} {}->{}",
                transport,
                SocketAddr::new(src, headers.src_port.unwrap_or_default()),
                SocketAddr::new(dst, headers.dst_port.unwrap_or_default()),
            ),
            (None, Some(src), Some(dst)) => format!(
                "IPv{} proto {} {}->{}",
                headers.ip_version.unwrap_or_default(),
                headers.ip_protocol.unwrap_or_default(),
                src,
                dst
            ),
            _ => format!("unparsed packet ({} bytes)", self.original_octets.len()),
        }
    }

    /// Human readable list of rewrites, e.g. `dst_port: 8080->1337`.
    pub fn diff_summary(&self) -> String {
        self.field_diff
            .iter()
            .map(|(field, (old, new))| format!("{}: {}->{}", field, old, new))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Refills the TCP/UDP checksum after a header rewrite.
///
/// An IPv4 UDP datagram sent without a checksum keeps it disabled.
fn fill_transport_checksum(
    protocol: Option<Transport>,
    segment: &mut [u8],
    src: &IpAddress,
    dst: &IpAddress,
    ipv4: bool,
) {
    match protocol {
        Some(Transport::Tcp) => TcpPacket::new_unchecked(segment).fill_checksum(src, dst),
        Some(Transport::Udp) => {
            let mut udp = UdpPacket::new_unchecked(segment);
            if ipv4 && udp.checksum() == 0 {
                return;
            }
            udp.fill_checksum(src, dst);
        }
        None => {}
    }
}
