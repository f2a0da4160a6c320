//! Header writers and read-side slice views.
//!
//! Write-side functions lay out skeleton headers into caller-owned frame
//! buffers; the `*Header` wrappers expose field setters with explicit
//! big-endian conversion for the per-probe fixups. Read-side `*Slice` types
//! are bounds-checked views used by response validation and parsing.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::config::{MacAddr, MAX_TTL};
use crate::net::checksum::ipv4_header_checksum;

pub const ETH_HLEN: usize = 14;
pub const IPV4_HLEN: usize = 20;
pub const IPV6_HLEN: usize = 40;
pub const UDP_HLEN: usize = 8;
pub const TCP_HLEN: usize = 20;
pub const ICMP_HLEN: usize = 8;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;

// ---- write side ----

/// Write an Ethernet header with the default IPv4 ethertype.
pub fn write_eth_header(buf: &mut [u8], src: &MacAddr, dst: &MacAddr) {
    write_eth_header_ethertype(buf, src, dst, ETHERTYPE_IPV4);
}

/// Write an Ethernet header with an explicit ethertype.
pub fn write_eth_header_ethertype(buf: &mut [u8], src: &MacAddr, dst: &MacAddr, ethertype: u16) {
    buf[0..6].copy_from_slice(dst);
    buf[6..12].copy_from_slice(src);
    buf[12..14].copy_from_slice(&ethertype.to_be_bytes());
}

/// Write a skeleton IPv4 header: IHL=5, version 4, TOS 0, fragmentation off,
/// TTL at maximum, checksum zeroed for later computation.
pub fn write_ipv4_header(buf: &mut [u8], protocol: u8, total_len: u16) {
    buf[0] = 0x45;
    buf[1] = 0;
    buf[2..4].copy_from_slice(&total_len.to_be_bytes());
    buf[4..6].copy_from_slice(&[0, 0]); // id, set per probe
    buf[6..8].copy_from_slice(&[0, 0]); // flags + fragment offset
    buf[8] = MAX_TTL;
    buf[9] = protocol;
    buf[10..12].copy_from_slice(&[0, 0]); // checksum, computed last
}

/// Write a skeleton IPv6 header: version 6, payload length, next header,
/// hop limit at maximum.
pub fn write_ipv6_header(buf: &mut [u8], protocol: u8, payload_len: u16) {
    buf[0] = 0x60;
    buf[1] = 0;
    buf[2] = 0;
    buf[3] = 0;
    buf[4..6].copy_from_slice(&payload_len.to_be_bytes());
    buf[6] = protocol;
    buf[7] = MAX_TTL;
}

/// Write a UDP header with the given total length. The checksum is left
/// zero; IPv4 permits that, IPv6 callers must fill it in.
pub fn write_udp_header(buf: &mut [u8], len: u16) {
    buf[4..6].copy_from_slice(&len.to_be_bytes());
    buf[6..8].copy_from_slice(&[0, 0]);
}

/// Write a TCP header with the given flags and sequence number: data offset
/// 5 (no options yet), the largest possible window, everything else zero.
pub fn write_tcp_header(buf: &mut [u8], flags: u8, seq: u32) {
    buf[4..8].copy_from_slice(&seq.to_be_bytes());
    buf[8..12].copy_from_slice(&[0, 0, 0, 0]); // ack
    buf[12] = 5 << 4;
    buf[13] = flags;
    buf[14..16].copy_from_slice(&65535u16.to_be_bytes());
    buf[16..18].copy_from_slice(&[0, 0]); // checksum
    buf[18..20].copy_from_slice(&[0, 0]); // urgent pointer
}

/// Write an ICMP echo-request header (type 8), checksum zeroed.
pub fn write_icmp_echo_header(buf: &mut [u8]) {
    buf[..ICMP_HLEN].fill(0);
    buf[0] = 8;
}

/// Write an ICMPv6 echo-request header (type 128), checksum zeroed.
pub fn write_icmp6_echo_header(buf: &mut [u8]) {
    buf[..ICMP_HLEN].fill(0);
    buf[0] = 128;
}

/// Mutable view over a 20-byte IPv4 header for per-probe fixups.
pub struct Ipv4Header<'a> {
    buf: &'a mut [u8],
}

impl<'a> Ipv4Header<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        debug_assert!(buf.len() >= IPV4_HLEN);
        Self { buf }
    }

    pub fn set_total_len(&mut self, len: u16) {
        self.buf[2..4].copy_from_slice(&len.to_be_bytes());
    }

    pub fn set_id(&mut self, id: u16) {
        self.buf[4..6].copy_from_slice(&id.to_be_bytes());
    }

    pub fn set_ttl(&mut self, ttl: u8) {
        self.buf[8] = ttl;
    }

    pub fn set_src(&mut self, ip: Ipv4Addr) {
        self.buf[12..16].copy_from_slice(&ip.octets());
    }

    pub fn set_dst(&mut self, ip: Ipv4Addr) {
        self.buf[16..20].copy_from_slice(&ip.octets());
    }

    /// Zero the checksum field and recompute it over the 20-byte header.
    pub fn finalize_checksum(&mut self) {
        self.buf[10..12].copy_from_slice(&[0, 0]);
        let sum = ipv4_header_checksum(self.buf);
        self.buf[10..12].copy_from_slice(&sum.to_be_bytes());
    }
}

/// Mutable view over a 40-byte IPv6 header.
pub struct Ipv6Header<'a> {
    buf: &'a mut [u8],
}

impl<'a> Ipv6Header<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        debug_assert!(buf.len() >= IPV6_HLEN);
        Self { buf }
    }

    pub fn set_payload_len(&mut self, len: u16) {
        self.buf[4..6].copy_from_slice(&len.to_be_bytes());
    }

    pub fn set_hop_limit(&mut self, hops: u8) {
        self.buf[7] = hops;
    }

    pub fn set_src(&mut self, ip: Ipv6Addr) {
        self.buf[8..24].copy_from_slice(&ip.octets());
    }

    pub fn set_dst(&mut self, ip: Ipv6Addr) {
        self.buf[24..40].copy_from_slice(&ip.octets());
    }
}

/// Mutable view over an 8-byte UDP header.
pub struct UdpHeader<'a> {
    buf: &'a mut [u8],
}

impl<'a> UdpHeader<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        debug_assert!(buf.len() >= UDP_HLEN);
        Self { buf }
    }

    pub fn set_sport(&mut self, port: u16) {
        self.buf[0..2].copy_from_slice(&port.to_be_bytes());
    }

    pub fn set_dport(&mut self, port: u16) {
        self.buf[2..4].copy_from_slice(&port.to_be_bytes());
    }

    pub fn set_len(&mut self, len: u16) {
        self.buf[4..6].copy_from_slice(&len.to_be_bytes());
    }

    pub fn set_checksum(&mut self, sum: u16) {
        self.buf[6..8].copy_from_slice(&sum.to_be_bytes());
    }
}

// ---- read side ----

/// Bounds-checked view of an IPv4 packet (header + payload).
#[derive(Clone, Copy)]
pub struct Ipv4Slice<'a> {
    data: &'a [u8],
}

impl<'a> Ipv4Slice<'a> {
    /// Parse at the start of `data`; requires version 4 and enough bytes for
    /// the full header length the IHL claims.
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < IPV4_HLEN || data[0] >> 4 != 4 {
            return None;
        }
        let ihl = ((data[0] & 0x0F) as usize) * 4;
        if ihl < IPV4_HLEN || data.len() < ihl {
            return None;
        }
        Some(Self { data })
    }

    /// Parse the IP packet inside an Ethernet frame.
    pub fn from_eth_frame(frame: &'a [u8]) -> Option<Self> {
        Self::parse(frame.get(ETH_HLEN..)?)
    }

    pub fn header_len(&self) -> usize {
        ((self.data[0] & 0x0F) as usize) * 4
    }

    pub fn total_len(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    pub fn id(&self) -> u16 {
        u16::from_be_bytes([self.data[4], self.data[5]])
    }

    pub fn ttl(&self) -> u8 {
        self.data[8]
    }

    pub fn protocol(&self) -> u8 {
        self.data[9]
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.data[10], self.data[11]])
    }

    pub fn src(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.data[12], self.data[13], self.data[14], self.data[15])
    }

    pub fn dst(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.data[16], self.data[17], self.data[18], self.data[19])
    }

    pub fn header_bytes(&self) -> &'a [u8] {
        &self.data[..self.header_len()]
    }

    /// Everything after the header, unbounded by the total-length field.
    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.header_len()..]
    }

    /// Total byte length of this view (header + captured payload).
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Bounds-checked view of an IPv6 packet (fixed header + payload).
#[derive(Clone, Copy)]
pub struct Ipv6Slice<'a> {
    data: &'a [u8],
}

impl<'a> Ipv6Slice<'a> {
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < IPV6_HLEN || data[0] >> 4 != 6 {
            return None;
        }
        Some(Self { data })
    }

    pub fn from_eth_frame(frame: &'a [u8]) -> Option<Self> {
        Self::parse(frame.get(ETH_HLEN..)?)
    }

    pub fn payload_len(&self) -> u16 {
        u16::from_be_bytes([self.data[4], self.data[5]])
    }

    pub fn next_header(&self) -> u8 {
        self.data[6]
    }

    pub fn hop_limit(&self) -> u8 {
        self.data[7]
    }

    pub fn src(&self) -> Ipv6Addr {
        let mut o = [0u8; 16];
        o.copy_from_slice(&self.data[8..24]);
        Ipv6Addr::from(o)
    }

    pub fn dst(&self) -> Ipv6Addr {
        let mut o = [0u8; 16];
        o.copy_from_slice(&self.data[24..40]);
        Ipv6Addr::from(o)
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.data[IPV6_HLEN..]
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Bounds-checked view of a UDP datagram.
#[derive(Clone, Copy)]
pub struct UdpSlice<'a> {
    data: &'a [u8],
}

impl<'a> UdpSlice<'a> {
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < UDP_HLEN {
            return None;
        }
        Some(Self { data })
    }

    pub fn sport(&self) -> u16 {
        u16::from_be_bytes([self.data[0], self.data[1]])
    }

    pub fn dport(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    /// The wire-claimed datagram length (header included). Not trusted to be
    /// within the captured buffer.
    pub fn claimed_len(&self) -> u16 {
        u16::from_be_bytes([self.data[4], self.data[5]])
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.data[6], self.data[7]])
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.data[UDP_HLEN..]
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Bounds-checked view of an ICMP message (8-byte header + body).
#[derive(Clone, Copy)]
pub struct IcmpSlice<'a> {
    data: &'a [u8],
}

impl<'a> IcmpSlice<'a> {
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < ICMP_HLEN {
            return None;
        }
        Some(Self { data })
    }

    pub fn icmp_type(&self) -> u8 {
        self.data[0]
    }

    pub fn code(&self) -> u8 {
        self.data[1]
    }

    /// The quoted original datagram following the 8-byte header.
    pub fn body(&self) -> &'a [u8] {
        &self.data[ICMP_HLEN..]
    }
}

/// Bounds-checked view of an ICMPv6 message.
#[derive(Clone, Copy)]
pub struct Icmp6Slice<'a> {
    data: &'a [u8],
}

impl<'a> Icmp6Slice<'a> {
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < ICMP_HLEN {
            return None;
        }
        Some(Self { data })
    }

    pub fn icmp_type(&self) -> u8 {
        self.data[0]
    }

    pub fn code(&self) -> u8 {
        self.data[1]
    }

    pub fn body(&self) -> &'a [u8] {
        &self.data[ICMP_HLEN..]
    }
}

// ---- dry-run formatting ----

/// `ip { saddr | daddr | checksum }` line for dry-run dumps.
pub fn format_ipv4_line(ip: &Ipv4Slice) -> String {
    format!(
        "ip {{ saddr: {} | daddr: {} | checksum: {:#06X} }}",
        ip.src(),
        ip.dst(),
        ip.checksum()
    )
}

/// `ip6 { saddr | daddr | nxthdr }` line for dry-run dumps.
pub fn format_ipv6_line(ip: &Ipv6Slice) -> String {
    format!(
        "ip6 {{ saddr: {} | daddr: {} | nxthdr: {} }}",
        ip.src(),
        ip.dst(),
        ip.next_header()
    )
}

/// `eth { shost | dhost }` line for dry-run dumps.
pub fn format_eth_line(frame: &[u8]) -> String {
    let fmt = |o: &[u8]| {
        format!(
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    };
    format!("eth {{ shost: {} | dhost: {} }}", fmt(&frame[6..12]), fmt(&frame[0..6]))
}
