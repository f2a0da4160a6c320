//! IPv6 UDP probe module.
//!
//! Sends an arbitrary UDP payload to IPv6 targets. The payload comes from
//! `--probe-args`: `text:<string>`, `hex:<hexbytes>`, `file:<path>` for raw
//! bytes, or `template:<path>` for a payload re-rendered per probe with
//! `${FIELD}` substitutions (addresses, ports, random runs). The literal
//! `template-fields` lists the field catalog instead of scanning.
//!
//! Responses classify as `udp` (success), `icmp-unreach`, or `other`.

use std::io::{self, Write};
use std::net::Ipv6Addr;
use std::time::SystemTime;

use rand::Rng;

use crate::config::{MacAddr, ScanConfig, MAX_PACKET_SIZE};
use crate::error::{Result, ScanError};
use crate::net::checksum::ipv6_payload_checksum;
use crate::net::headers::{
    format_eth_line, format_ipv6_line, write_eth_header_ethertype, write_ipv6_header,
    write_udp_header, Icmp6Slice, Ipv6Header, Ipv6Slice, UdpHeader, UdpSlice, ETHERTYPE_IPV6,
    ETH_HLEN, IPPROTO_ICMPV6, IPPROTO_UDP, IPV6_HLEN, UDP_HLEN,
};
use crate::output::{FieldDef, FieldKind, FieldSet, OutputType};
use crate::probe::{
    udp6_validate_common, FlowAddrs, ProbeModule, ProbeTarget, ThreadCtx, PRINT_PACKET_SEP,
};
use crate::target::Blocklist;
use crate::validate::{SourcePortPool, Validation};

/// Largest UDP payload that fits a standard Ethernet frame.
pub const MAX_UDP_PAYLOAD_LEN: usize = 1472;

const DEFAULT_PAYLOAD: &[u8] = b"GET / HTTP/1.1\r\nHost: www\r\n\r\n";
const BASE_PCAP_FILTER: &str = "ip6 proto 17 || icmp6";

const USAGE_ERROR: &str = "unknown UDP probe specification (expected file:/path or text:STRING \
                           or hex:01020304 or template:/path or template-fields)";

const CHARSET_DIGIT: &[u8] = b"0123456789";
const CHARSET_ALPHA: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const CHARSET_ALPHANUM: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

// ---- payload templates ----

/// Substitutable field kinds inside a `${...}` template reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TemplateFieldKind {
    SaddrN,
    SaddrA,
    DaddrN,
    DaddrA,
    SportN,
    SportA,
    DportN,
    DportA,
    RandByte,
    RandDigit,
    RandAlpha,
    RandAlphanum,
}

struct TemplateFieldDef {
    name: &'static str,
    kind: TemplateFieldKind,
    desc: &'static str,
}

const TEMPLATE_FIELDS: &[TemplateFieldDef] = &[
    TemplateFieldDef {
        name: "SADDR_N",
        kind: TemplateFieldKind::SaddrN,
        desc: "Source IP address in network byte order",
    },
    TemplateFieldDef {
        name: "SADDR",
        kind: TemplateFieldKind::SaddrA,
        desc: "Source IP address in text format",
    },
    TemplateFieldDef {
        name: "DADDR_N",
        kind: TemplateFieldKind::DaddrN,
        desc: "Destination IP address in network byte order",
    },
    TemplateFieldDef {
        name: "DADDR",
        kind: TemplateFieldKind::DaddrA,
        desc: "Destination IP address in text format",
    },
    TemplateFieldDef {
        name: "SPORT_N",
        kind: TemplateFieldKind::SportN,
        desc: "UDP source port in network byte order",
    },
    TemplateFieldDef {
        name: "SPORT",
        kind: TemplateFieldKind::SportA,
        desc: "UDP source port in ascii format",
    },
    TemplateFieldDef {
        name: "DPORT_N",
        kind: TemplateFieldKind::DportN,
        desc: "UDP destination port in network byte order",
    },
    TemplateFieldDef {
        name: "DPORT",
        kind: TemplateFieldKind::DportA,
        desc: "UDP destination port in ascii format",
    },
    TemplateFieldDef {
        name: "RAND_BYTE",
        kind: TemplateFieldKind::RandByte,
        desc: "Random bytes from 0-255",
    },
    TemplateFieldDef {
        name: "RAND_DIGIT",
        kind: TemplateFieldKind::RandDigit,
        desc: "Random digits from 0-9",
    },
    TemplateFieldDef {
        name: "RAND_ALPHA",
        kind: TemplateFieldKind::RandAlpha,
        desc: "Random mixed-case letters (a-z)",
    },
    TemplateFieldDef {
        name: "RAND_ALPHANUM",
        kind: TemplateFieldKind::RandAlphanum,
        desc: "Random mixed-case letters (a-z) and numbers",
    },
];

/// The formatted field catalog shown for `template-fields`.
fn template_fields_catalog() -> String {
    let mut out = String::from("List of allowed UDP template fields (name: description)\n\n");
    for def in TEMPLATE_FIELDS {
        out.push_str(def.name);
        out.push_str(": ");
        out.push_str(def.desc);
        out.push('\n');
    }
    out
}

#[derive(Debug, Clone)]
enum TemplateField {
    /// Literal bytes copied verbatim.
    Data(Vec<u8>),
    /// Substituted field with its requested output length (random runs).
    Typed { kind: TemplateFieldKind, len: usize },
}

/// A parsed payload template: an ordered field list rendered per probe.
#[derive(Debug, Clone)]
pub(crate) struct PayloadTemplate {
    fields: Vec<TemplateField>,
}

impl PayloadTemplate {
    /// Parse `${NAME}` / `${NAME=len}` references out of a raw template.
    /// Unknown names stay in the payload as literal text.
    fn parse(buf: &[u8]) -> Self {
        let mut fields = Vec::new();
        let mut literal = Vec::new();
        let mut i = 0;
        while i < buf.len() {
            if buf[i] == b'$' && buf.get(i + 1) == Some(&b'{') {
                if let Some(end) = buf[i + 2..].iter().position(|&b| b == b'}') {
                    let inner = &buf[i + 2..i + 2 + end];
                    if let Some(field) = Self::lookup(inner) {
                        if !literal.is_empty() {
                            fields.push(TemplateField::Data(std::mem::take(&mut literal)));
                        }
                        fields.push(field);
                        i += end + 3;
                        continue;
                    }
                }
            }
            literal.push(buf[i]);
            i += 1;
        }
        if !literal.is_empty() {
            fields.push(TemplateField::Data(literal));
        }
        Self { fields }
    }

    /// Resolve a field reference, splitting off an `=len` parameter.
    fn lookup(inner: &[u8]) -> Option<TemplateField> {
        let text = std::str::from_utf8(inner).ok()?;
        let (name, len) = match text.split_once('=') {
            Some((name, param)) => (name, param.parse::<usize>().unwrap_or(0)),
            None => (text, 0),
        };
        let def = TEMPLATE_FIELDS.iter().find(|d| d.name == name)?;
        Some(TemplateField::Typed { kind: def.kind, len })
    }

    /// Upper bound on the rendered length, for frame-size planning.
    fn max_render_len(&self) -> usize {
        self.fields
            .iter()
            .map(|f| match f {
                TemplateField::Data(bytes) => bytes.len(),
                TemplateField::Typed { kind, len } => match kind {
                    TemplateFieldKind::SaddrN | TemplateFieldKind::DaddrN => 16,
                    // textual IPv6 peaks at 45 bytes (IPv4-mapped form)
                    TemplateFieldKind::SaddrA | TemplateFieldKind::DaddrA => 45,
                    TemplateFieldKind::SportN | TemplateFieldKind::DportN => 2,
                    TemplateFieldKind::SportA | TemplateFieldKind::DportA => 5,
                    _ => *len,
                },
            })
            .sum()
    }

    /// Render into `out` (cleared first). Fails if the payload would exceed
    /// `MAX_UDP_PAYLOAD_LEN`.
    fn render(
        &self,
        out: &mut Vec<u8>,
        src: Ipv6Addr,
        dst: Ipv6Addr,
        sport: u16,
        dport: u16,
        rng: &mut impl Rng,
    ) -> Result<()> {
        out.clear();
        for field in &self.fields {
            match field {
                TemplateField::Data(bytes) => out.extend_from_slice(bytes),
                TemplateField::Typed { kind, len } => match kind {
                    TemplateFieldKind::SaddrN => out.extend_from_slice(&src.octets()),
                    TemplateFieldKind::DaddrN => out.extend_from_slice(&dst.octets()),
                    TemplateFieldKind::SaddrA => out.extend_from_slice(src.to_string().as_bytes()),
                    TemplateFieldKind::DaddrA => out.extend_from_slice(dst.to_string().as_bytes()),
                    TemplateFieldKind::SportN => out.extend_from_slice(&sport.to_be_bytes()),
                    TemplateFieldKind::DportN => out.extend_from_slice(&dport.to_be_bytes()),
                    TemplateFieldKind::SportA => {
                        out.extend_from_slice(sport.to_string().as_bytes())
                    }
                    TemplateFieldKind::DportA => {
                        out.extend_from_slice(dport.to_string().as_bytes())
                    }
                    TemplateFieldKind::RandByte => {
                        out.extend((0..*len).map(|_| rng.gen::<u8>()));
                    }
                    TemplateFieldKind::RandDigit => {
                        out.extend(
                            (0..*len).map(|_| CHARSET_DIGIT[rng.gen_range(0..CHARSET_DIGIT.len())]),
                        );
                    }
                    TemplateFieldKind::RandAlpha => {
                        out.extend(
                            (0..*len).map(|_| CHARSET_ALPHA[rng.gen_range(0..CHARSET_ALPHA.len())]),
                        );
                    }
                    TemplateFieldKind::RandAlphanum => {
                        out.extend((0..*len).map(|_| {
                            CHARSET_ALPHANUM[rng.gen_range(0..CHARSET_ALPHANUM.len())]
                        }));
                    }
                },
            }
            if out.len() > MAX_UDP_PAYLOAD_LEN {
                return Err(ScanError::PayloadTooLarge {
                    len: out.len(),
                    limit: MAX_UDP_PAYLOAD_LEN,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum PayloadKind {
    /// Fixed bytes copied into every probe.
    Static(Vec<u8>),
    /// Re-rendered per probe.
    Template(PayloadTemplate),
}

/// Parse the `--probe-args` payload specification.
fn parse_payload_spec(args: Option<&str>) -> Result<PayloadKind> {
    let raw = match args {
        Some(s) if !s.is_empty() => s,
        _ => return Ok(PayloadKind::Static(DEFAULT_PAYLOAD.to_vec())),
    };
    if raw == "template-fields" {
        return Err(ScanError::Usage(template_fields_catalog()));
    }
    let (scheme, rest) = raw
        .split_once(':')
        .ok_or_else(|| ScanError::ProbeArgs(USAGE_ERROR.into()))?;
    let mut bytes = match scheme {
        "text" => rest.as_bytes().to_vec(),
        "hex" => {
            let mut bytes = Vec::with_capacity(rest.len() / 2);
            for i in 0..rest.len() / 2 {
                let pair = &rest[i * 2..i * 2 + 2];
                let byte = u8::from_str_radix(pair, 16).map_err(|_| {
                    ScanError::ProbeArgs(format!("non-hex character in \"{pair}\""))
                })?;
                bytes.push(byte);
            }
            bytes
        }
        "file" | "template" => std::fs::read(rest).map_err(|e| {
            tracing::error!(path = rest, "could not open UDP data file");
            ScanError::Io(e)
        })?,
        _ => return Err(ScanError::ProbeArgs(USAGE_ERROR.into())),
    };
    if scheme == "template" {
        return Ok(PayloadKind::Template(PayloadTemplate::parse(&bytes)));
    }
    if bytes.len() > MAX_UDP_PAYLOAD_LEN {
        tracing::warn!(
            from = bytes.len(),
            to = MAX_UDP_PAYLOAD_LEN,
            "reducing UDP payload to fit on the wire"
        );
        bytes.truncate(MAX_UDP_PAYLOAD_LEN);
    }
    Ok(PayloadKind::Static(bytes))
}

// ---- the module ----

/// The IPv6 UDP probe module.
#[derive(Debug)]
pub struct Ipv6UdpProbe {
    payload: PayloadKind,
    source_ip: Ipv6Addr,
    pool: SourcePortPool,
    max_packet_length: usize,
    pcap_filter: String,
}

impl Ipv6UdpProbe {
    pub fn from_config(cfg: &ScanConfig) -> Result<Self> {
        let source_ip = cfg.ipv6_source.ok_or_else(|| {
            ScanError::Config("ipv6_udp requires an IPv6 source address".into())
        })?;
        let payload = parse_payload_spec(cfg.probe_args.as_deref())?;
        let max_payload = match &payload {
            PayloadKind::Static(bytes) => bytes.len(),
            PayloadKind::Template(t) => t.max_render_len().min(MAX_UDP_PAYLOAD_LEN),
        };
        Ok(Self {
            payload,
            source_ip,
            pool: SourcePortPool::new(
                cfg.source_port_first,
                cfg.source_port_last,
                cfg.packet_streams,
            ),
            max_packet_length: ETH_HLEN + IPV6_HLEN + UDP_HLEN + max_payload,
            // Only look at packets destined to our scanning address, so
            // parallel scans on one machine don't see each other's traffic.
            pcap_filter: format!("{BASE_PCAP_FILTER} && ip6 dst host {source_ip}"),
        })
    }

    fn static_payload(&self) -> Option<&[u8]> {
        match &self.payload {
            PayloadKind::Static(bytes) => Some(bytes),
            PayloadKind::Template(_) => None,
        }
    }
}

impl ProbeModule for Ipv6UdpProbe {
    fn name(&self) -> &'static str {
        "ipv6_udp"
    }

    fn pcap_filter(&self) -> String {
        self.pcap_filter.clone()
    }

    fn max_packet_length(&self) -> usize {
        self.max_packet_length
    }

    fn output_type(&self) -> OutputType {
        OutputType::Static
    }

    fn fields(&self) -> &'static [FieldDef] {
        FIELDS
    }

    fn helptext(&self) -> &'static str {
        "Sends UDP packets to IPv6 hosts. The payload is configured with \
         --probe-args: text:STRING, hex:01020304, file:/path for raw bytes, \
         or template:/path for a payload re-rendered per probe with ${FIELD} \
         substitutions; 'template-fields' lists the allowed fields."
    }

    fn prepare_packet(
        &self,
        buf: &mut [u8],
        src_mac: &MacAddr,
        gw_mac: &MacAddr,
        _ctx: &mut ThreadCtx,
    ) -> Result<()> {
        buf.fill(0);
        write_eth_header_ethertype(buf, src_mac, gw_mac, ETHERTYPE_IPV6);
        let payload_len = self.static_payload().map(|p| p.len()).unwrap_or(0);
        write_ipv6_header(&mut buf[ETH_HLEN..], IPPROTO_UDP, (UDP_HLEN + payload_len) as u16);
        write_udp_header(&mut buf[ETH_HLEN + IPV6_HLEN..], (UDP_HLEN + payload_len) as u16);
        if let Some(payload) = self.static_payload() {
            let at = ETH_HLEN + IPV6_HLEN + UDP_HLEN;
            buf[at..at + payload.len()].copy_from_slice(payload);
        }
        Ok(())
    }

    fn make_packet(
        &self,
        buf: &mut [u8],
        target: &ProbeTarget,
        ctx: &mut ThreadCtx,
    ) -> Result<usize> {
        let (src_ip, dst_ip) = match target.addrs {
            FlowAddrs::V6 { src, dst } => (src, dst),
            FlowAddrs::V4 { .. } => {
                return Err(ScanError::Config("ipv6_udp module scans IPv6 targets only".into()))
            }
        };
        let sport = self.pool.src_port(target.probe_num, &target.validation);

        let payload_len = match &self.payload {
            PayloadKind::Static(bytes) => bytes.len(),
            PayloadKind::Template(template) => {
                let mut rendered = Vec::with_capacity(MAX_UDP_PAYLOAD_LEN);
                template.render(&mut rendered, src_ip, dst_ip, sport, target.dport, &mut ctx.rng)?;
                let at = ETH_HLEN + IPV6_HLEN + UDP_HLEN;
                buf[at..at + rendered.len()].copy_from_slice(&rendered);
                rendered.len()
            }
        };

        {
            let mut ip6 = Ipv6Header::new(&mut buf[ETH_HLEN..]);
            ip6.set_src(src_ip);
            ip6.set_dst(dst_ip);
            ip6.set_hop_limit(target.ttl);
            ip6.set_payload_len((UDP_HLEN + payload_len) as u16);
        }
        {
            let mut udp = UdpHeader::new(&mut buf[ETH_HLEN + IPV6_HLEN..]);
            udp.set_sport(sport);
            udp.set_dport(target.dport);
            udp.set_len((UDP_HLEN + payload_len) as u16);
            udp.set_checksum(0);
        }
        // pseudo-header checksum is mandatory for UDP over IPv6
        let segment_at = ETH_HLEN + IPV6_HLEN;
        let segment = &buf[segment_at..segment_at + UDP_HLEN + payload_len];
        let sum = ipv6_payload_checksum(&src_ip, &dst_ip, IPPROTO_UDP, segment);
        UdpHeader::new(&mut buf[segment_at..]).set_checksum(sum);

        let frame_len = ETH_HLEN + IPV6_HLEN + UDP_HLEN + payload_len;
        if frame_len > MAX_PACKET_SIZE {
            return Err(ScanError::PayloadTooLarge { len: frame_len, limit: MAX_PACKET_SIZE });
        }
        Ok(frame_len)
    }

    fn validate_packet(
        &self,
        ip_packet: &[u8],
        validation: &Validation,
        _blocklist: &dyn Blocklist,
    ) -> bool {
        let ip = match Ipv6Slice::parse(ip_packet) {
            Some(ip) => ip,
            None => return false,
        };
        // the claimed payload must fit the captured buffer
        if ip.payload_len() as usize > ip.payload().len() {
            return false;
        }
        udp6_validate_common(&ip, &self.pool, validation)
    }

    fn process_packet(
        &self,
        frame: &[u8],
        fs: &mut FieldSet,
        _validation: &Validation,
        _ts: SystemTime,
    ) {
        let ip6 = match Ipv6Slice::from_eth_frame(frame) {
            Some(ip6) => ip6,
            None => return,
        };
        match ip6.next_header() {
            IPPROTO_UDP => {
                let udp = match UdpSlice::parse(ip6.payload()) {
                    Some(udp) => udp,
                    None => return,
                };
                fs.add_string("classification", "udp");
                fs.add_uint64("success", 1);
                fs.add_uint64("sport", udp.sport() as u64);
                fs.add_uint64("dport", udp.dport() as u64);
                fs.add_null("icmp_responder");
                fs.add_null("icmp_type");
                fs.add_null("icmp_code");
                fs.add_null("icmp_unreach_str");
                fs.add_uint64("udp_pkt_size", udp.claimed_len() as u64);
                let claimed = udp.claimed_len() as usize;
                if claimed > UDP_HLEN {
                    // trim to what the wire, the UDP length, and the IP
                    // payload length all agree is present
                    let data_len = (claimed - UDP_HLEN)
                        .min(udp.payload().len())
                        .min((ip6.payload_len() as usize).saturating_sub(UDP_HLEN));
                    fs.add_binary("data", &udp.payload()[..data_len]);
                } else {
                    // some devices reply with a zero UDP length but still
                    // return data; ignore it
                    fs.add_null("data");
                }
            }
            IPPROTO_ICMPV6 => {
                let icmp = match Icmp6Slice::parse(ip6.payload()) {
                    Some(icmp) => icmp,
                    None => return,
                };
                // The unreachable comes from a node on the path, not the
                // target itself; report the quoted destination as saddr and
                // the actual responder separately.
                if let Some(inner) = Ipv6Slice::parse(icmp.body()) {
                    fs.modify_string("saddr", inner.dst().to_string());
                }
                fs.add_string("classification", "icmp-unreach");
                fs.add_uint64("success", 0);
                fs.add_null("sport");
                fs.add_null("dport");
                fs.add_string("icmp_responder", ip6.src().to_string());
                fs.add_uint64("icmp_type", icmp.icmp_type() as u64);
                fs.add_uint64("icmp_code", icmp.code() as u64);
                fs.add_null("icmp_unreach_str");
                fs.add_null("udp_pkt_size");
                fs.add_null("data");
            }
            _ => {
                fs.add_string("classification", "other");
                fs.add_uint64("success", 0);
                fs.add_null("sport");
                fs.add_null("dport");
                fs.add_null("icmp_responder");
                fs.add_null("icmp_type");
                fs.add_null("icmp_code");
                fs.add_null("icmp_unreach_str");
                fs.add_null("udp_pkt_size");
                fs.add_null("data");
            }
        }
    }

    fn print_packet(&self, w: &mut dyn Write, frame: &[u8]) -> io::Result<()> {
        if let Some(ip6) = Ipv6Slice::from_eth_frame(frame) {
            if let Some(udp) = UdpSlice::parse(ip6.payload()) {
                writeln!(
                    w,
                    "udp {{ source: {} | dest: {} | checksum: {:#06X} }}",
                    udp.sport(),
                    udp.dport(),
                    udp.checksum()
                )?;
            }
            writeln!(w, "{}", format_ipv6_line(&ip6))?;
        }
        writeln!(w, "{}", format_eth_line(frame))?;
        writeln!(w, "{PRINT_PACKET_SEP}")
    }
}

const FIELDS: &[FieldDef] = &[
    FieldDef { name: "classification", kind: FieldKind::String, desc: "packet classification" },
    FieldDef { name: "success", kind: FieldKind::Int, desc: "is response considered success" },
    FieldDef { name: "sport", kind: FieldKind::Int, desc: "UDP source port" },
    FieldDef { name: "dport", kind: FieldKind::Int, desc: "UDP destination port" },
    FieldDef {
        name: "icmp_responder",
        kind: FieldKind::String,
        desc: "source IP of ICMP unreachable message",
    },
    FieldDef { name: "icmp_type", kind: FieldKind::Int, desc: "icmp message type" },
    FieldDef { name: "icmp_code", kind: FieldKind::Int, desc: "icmp message sub type code" },
    FieldDef {
        name: "icmp_unreach_str",
        kind: FieldKind::String,
        desc: "for icmp_unreach responses, the string version of icmp_code",
    },
    FieldDef { name: "udp_pkt_size", kind: FieldKind::Int, desc: "UDP packet length" },
    FieldDef { name: "data", kind: FieldKind::Binary, desc: "UDP payload" },
];
