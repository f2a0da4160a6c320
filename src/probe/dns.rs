//! DNS-over-UDP probe module.
//!
//! Sends pre-built DNS queries and parses the responses far enough to be
//! useful offline: header bits, counts, and the four record sections with
//! per-type rdata decoding. Verification is deliberately light; a response
//! is `success` when its transaction ID and question echo one of our
//! queries, and `app_success` additionally requires QR=1 with a clean
//! rcode. Parse trouble never drops a response, it is reported through the
//! `dns_parse_err` and `dns_unconsumed_bytes` columns.
//!
//! `--probe-args` is a semicolon-separated list of questions, each
//! `QTYPE[:nr],DOMAIN` (the `:nr` suffix clears the recursion-desired bit).
//! The probe count must be a multiple of the question count; probe `i`
//! carries question `i mod num_questions`.

use std::io::{self, Write};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::SystemTime;

use crate::config::{MacAddr, ScanConfig, MAX_PACKET_SIZE};
use crate::error::{Result, ScanError};
use crate::net::headers::{
    format_eth_line, format_ipv4_line, write_eth_header, write_ipv4_header, write_udp_header,
    Ipv4Header, Ipv4Slice, UdpHeader, UdpSlice, ETH_HLEN, IPPROTO_ICMP, IPPROTO_UDP, IPV4_HLEN,
    UDP_HLEN,
};
use crate::net::icmp::{add_icmp_fields, add_null_icmp_fields};
use crate::output::{FieldDef, FieldKind, FieldSet, OutputType};
use crate::probe::{
    udp_validate_common, FlowAddrs, ProbeModule, ProbeTarget, ThreadCtx, PRINT_PACKET_SEP,
};
use crate::target::Blocklist;
use crate::validate::{SourcePortPool, Validation};

/// Arbitrary ceiling on a pre-built query payload.
const DNS_PAYLOAD_LEN_LIMIT: usize = 512;
const PCAP_SNAPLEN: usize = 1500;

/// Longest tolerated pointer chain when decompressing a name.
const MAX_LABEL_RECURSION: u16 = 10;
/// Decoded-name budget, terminator included.
const MAX_NAME_LENGTH: usize = 512;

const DNS_HLEN: usize = 12;
const QUESTION_TAIL_LEN: usize = 4;
const RECORD_TAIL_LEN: usize = 10;

pub const QTYPE_A: u16 = 1;
pub const QTYPE_NS: u16 = 2;
pub const QTYPE_CNAME: u16 = 5;
pub const QTYPE_SOA: u16 = 6;
pub const QTYPE_PTR: u16 = 12;
pub const QTYPE_MX: u16 = 15;
pub const QTYPE_TXT: u16 = 16;
pub const QTYPE_AAAA: u16 = 28;
pub const QTYPE_RRSIG: u16 = 46;
pub const QTYPE_ALL: u16 = 255;

const QTYPE_NAMES: &[(&str, u16)] = &[
    ("A", QTYPE_A),
    ("NS", QTYPE_NS),
    ("CNAME", QTYPE_CNAME),
    ("SOA", QTYPE_SOA),
    ("PTR", QTYPE_PTR),
    ("MX", QTYPE_MX),
    ("TXT", QTYPE_TXT),
    ("AAAA", QTYPE_AAAA),
    ("RRSIG", QTYPE_RRSIG),
    ("ALL", QTYPE_ALL),
];

const BAD_QTYPE_STR: &str = "BAD QTYPE";

const DEFAULT_DOMAIN: &str = "www.google.com";
const DEFAULT_QTYPE: u16 = QTYPE_A;

fn qtype_code(name: &str) -> Option<u16> {
    QTYPE_NAMES.iter().find(|(n, _)| *n == name).map(|(_, c)| *c)
}

fn qtype_str(code: u16) -> Option<&'static str> {
    QTYPE_NAMES.iter().find(|(_, c)| *c == code).map(|(n, _)| *n)
}

/// One user-requested question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionSpec {
    pub domain: String,
    pub qtype: u16,
    pub recursion_desired: bool,
}

/// Parse the `--probe-args` question list. `None` or an empty string falls
/// back to a single A query for the default domain.
fn parse_probe_args(args: Option<&str>) -> Result<Vec<QuestionSpec>> {
    let raw = match args {
        Some(s) if !s.trim().is_empty() => s.trim(),
        _ => {
            tracing::warn!(
                domain = DEFAULT_DOMAIN,
                "no dns questions provided, using default A query"
            );
            return Ok(vec![QuestionSpec {
                domain: DEFAULT_DOMAIN.to_string(),
                qtype: DEFAULT_QTYPE,
                recursion_desired: true,
            }]);
        }
    };

    let mut raw = raw;
    if let Some(stripped) = raw.strip_prefix(';') {
        tracing::debug!("probe args contain leading semicolon, stripping");
        raw = stripped;
    }
    if let Some(stripped) = raw.strip_suffix(';') {
        tracing::debug!("probe args contain trailing semicolon, stripping");
        raw = stripped;
    }

    let mut specs = Vec::new();
    for part in raw.split(';') {
        let (qtype_token, domain) = part.split_once(',').ok_or_else(|| {
            ScanError::ProbeArgs(format!(
                "expected QTYPE,DOMAIN (e.g. \"A,google.com\" or \"A,google.com;AAAA,example.com\"), got \"{part}\""
            ))
        })?;
        let (qtype_name, recursion_desired) = match qtype_token.split_once(':') {
            Some((name, "nr")) => (name, false),
            Some((name, other)) => {
                tracing::warn!(
                    suffix = other,
                    "invalid text after DNS query type; recursion is disabled with \":nr\""
                );
                (name, true)
            }
            None => (qtype_token, true),
        };
        if domain.is_empty() {
            return Err(ScanError::ProbeArgs("domain cannot be empty".into()));
        }
        let qtype = qtype_code(qtype_name)
            .ok_or_else(|| ScanError::ProbeArgs(format!("unrecognized qtype \"{qtype_name}\"")))?;
        tracing::debug!(domain, qtype, recursion_desired, "parsed dns question");
        specs.push(QuestionSpec { domain: domain.to_string(), qtype, recursion_desired });
    }
    Ok(specs)
}

/// Encode `a.b.c` as the length-prefixed label sequence `\x01a\x01b\x01c\0`.
/// Labels past 63 bytes are legal on the wire but worth a warning.
fn encode_qname(domain: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(domain.len() + 2);
    for label in domain.split('.') {
        if label.len() > 63 {
            tracing::warn!(len = label.len(), "dns label exceeds 63 bytes");
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out
}

/// A fully laid-out query payload: 12-byte header (ID patched per probe),
/// qname, then qtype/qclass.
#[derive(Debug, Clone)]
struct PrebuiltQuery {
    payload: Vec<u8>,
    qname_len: usize,
}

impl PrebuiltQuery {
    fn build(spec: &QuestionSpec) -> Result<Self> {
        let qname = encode_qname(&spec.domain);
        let len = DNS_HLEN + qname.len() + QUESTION_TAIL_LEN;
        if len > DNS_PAYLOAD_LEN_LIMIT {
            return Err(ScanError::PayloadTooLarge { len, limit: DNS_PAYLOAD_LEN_LIMIT });
        }
        let mut payload = vec![0u8; len];
        if spec.recursion_desired {
            payload[2] |= 0x01;
        }
        payload[4..6].copy_from_slice(&1u16.to_be_bytes()); // qdcount
        payload[DNS_HLEN..DNS_HLEN + qname.len()].copy_from_slice(&qname);
        let tail = DNS_HLEN + qname.len();
        payload[tail..tail + 2].copy_from_slice(&spec.qtype.to_be_bytes());
        payload[tail + 2..tail + 4].copy_from_slice(&1u16.to_be_bytes()); // qclass IN
        Ok(Self { payload, qname_len: qname.len() })
    }
}

/// Render the destination address as four fixed-width `\x03`-prefixed
/// three-digit labels, the 16-byte qname prefix used by IP-padding mode.
fn ip_padding_prefix(ip: Ipv4Addr) -> [u8; 16] {
    let mut out = [0u8; 16];
    for (i, octet) in ip.octets().iter().enumerate() {
        out[i * 4] = 3;
        out[i * 4 + 1..i * 4 + 4]
            .copy_from_slice(format!("{octet:03}").as_bytes());
    }
    out
}

// ---- compressed-name decoding ----

/// Decode one possibly-compressed name starting at `data`, appending the
/// dotted form to `out`. `payload` bounds pointer targets; `budget` tracks
/// remaining output bytes. Returns the bytes consumed from `data` (a
/// terminating pointer counts two, a terminating zero counts one), or
/// `None` on malformed input.
fn decode_name_into(
    data: &[u8],
    payload: &[u8],
    depth: u16,
    out: &mut Vec<u8>,
    budget: &mut usize,
) -> Option<usize> {
    if data.is_empty() || payload.is_empty() || *budget == 0 {
        return None;
    }
    if depth > MAX_LABEL_RECURSION {
        return None;
    }
    let mut consumed = 0usize;
    let mut i = 0usize;
    loop {
        let byte = *data.get(i)?;
        if byte >= 0xc0 {
            // 14-bit back-pointer into the payload
            if data.len() - i < 2 {
                return None;
            }
            let offset = (((byte & 0x3F) as usize) << 8) | data[i + 1] as usize;
            if offset >= payload.len() {
                return None;
            }
            if depth > 0 || consumed > 0 {
                if *budget < 1 {
                    tracing::warn!("exceeded name buffer while decoding dns name");
                    return None;
                }
                out.push(b'.');
                *budget -= 1;
            }
            decode_name_into(&payload[offset..], payload, depth + 1, out, budget)?;
            return Some(consumed + 2);
        } else if byte == 0 {
            return Some(consumed + 1);
        } else {
            let len = byte as usize;
            i += 1;
            // the label bytes plus at least a terminator must still fit
            if len + 1 > data.len() - i {
                return None;
            }
            if consumed > 0 {
                if *budget < 1 {
                    tracing::warn!("exceeded name buffer while decoding dns name");
                    return None;
                }
                out.push(b'.');
                *budget -= 1;
            }
            consumed += 1;
            if len > *budget {
                tracing::warn!("exceeded name buffer while decoding dns name");
                return None;
            }
            out.extend_from_slice(&data[i..i + len]);
            *budget -= len;
            i += len;
            consumed += len;
        }
    }
}

/// Decode a name at `data`; returns the dotted name and the bytes consumed
/// from `data`, or `None` with no partial output on malformed input.
fn decode_name(data: &[u8], payload: &[u8]) -> Option<(String, usize)> {
    let mut out = Vec::new();
    let mut budget = MAX_NAME_LENGTH - 1;
    let consumed = decode_name_into(data, payload, 0, &mut out, &mut budget)?;
    Some((String::from_utf8_lossy(&out).into_owned(), consumed))
}

// ---- response section parsing ----

fn add_type_str(fs: &mut FieldSet, name: &'static str, code: u16) {
    match qtype_str(code) {
        Some(s) => fs.add_string(name, s),
        None => fs.add_string(name, BAD_QTYPE_STR),
    }
}

/// Parse one question at `*pos`; advances the cursor on success.
fn parse_question(dns_payload: &[u8], pos: &mut usize) -> Option<FieldSet> {
    let data = dns_payload.get(*pos..)?;
    let (name, consumed) = decode_name(data, dns_payload)?;
    if consumed + QUESTION_TAIL_LEN > data.len() {
        return None;
    }
    let qtype = u16::from_be_bytes([data[consumed], data[consumed + 1]]);
    let qclass = u16::from_be_bytes([data[consumed + 2], data[consumed + 3]]);

    let mut qfs = FieldSet::new();
    qfs.add_string("name", name);
    qfs.add_uint64("qtype", qtype as u64);
    add_type_str(&mut qfs, "qtype_str", qtype);
    qfs.add_uint64("qclass", qclass as u64);

    *pos += consumed + QUESTION_TAIL_LEN;
    Some(qfs)
}

/// Parse one resource record at `*pos`; advances the cursor on success.
fn parse_record(dns_payload: &[u8], pos: &mut usize) -> Option<FieldSet> {
    let data = dns_payload.get(*pos..)?;
    let (name, consumed) = decode_name(data, dns_payload)?;
    if consumed + RECORD_TAIL_LEN > data.len() {
        return None;
    }
    let rtype = u16::from_be_bytes([data[consumed], data[consumed + 1]]);
    let class = u16::from_be_bytes([data[consumed + 2], data[consumed + 3]]);
    let ttl = u32::from_be_bytes([
        data[consumed + 4],
        data[consumed + 5],
        data[consumed + 6],
        data[consumed + 7],
    ]);
    let rdlength = u16::from_be_bytes([data[consumed + 8], data[consumed + 9]]) as usize;
    if consumed + RECORD_TAIL_LEN + rdlength > data.len() {
        return None;
    }
    let rdata = &data[consumed + RECORD_TAIL_LEN..consumed + RECORD_TAIL_LEN + rdlength];

    let mut afs = FieldSet::new();
    afs.add_string("name", name);
    afs.add_uint64("type", rtype as u64);
    add_type_str(&mut afs, "type_str", rtype);
    afs.add_uint64("class", class as u64);
    afs.add_uint64("ttl", ttl as u64);
    afs.add_uint64("rdlength", rdlength as u64);
    add_rdata(&mut afs, rtype, rdata, dns_payload);

    *pos += consumed + RECORD_TAIL_LEN + rdlength;
    Some(afs)
}

fn add_parsed_rdata(fs: &mut FieldSet, text: String) {
    fs.add_uint64("rdata_is_parsed", 1);
    fs.add_string("rdata", text);
}

fn add_raw_rdata(fs: &mut FieldSet, rdata: &[u8]) {
    fs.add_uint64("rdata_is_parsed", 0);
    fs.add_binary("rdata", rdata);
}

/// Type-specific rdata decoding; anything unparseable degrades to raw
/// bytes with `rdata_is_parsed = 0`.
fn add_rdata(fs: &mut FieldSet, rtype: u16, rdata: &[u8], dns_payload: &[u8]) {
    match rtype {
        QTYPE_NS | QTYPE_CNAME => match decode_name(rdata, dns_payload) {
            Some((name, _)) => add_parsed_rdata(fs, name),
            None => add_raw_rdata(fs, rdata),
        },
        QTYPE_MX => {
            if rdata.len() <= 4 {
                add_raw_rdata(fs, rdata);
                return;
            }
            let preference = u16::from_be_bytes([rdata[0], rdata[1]]);
            match decode_name(&rdata[2..], dns_payload) {
                Some((name, _)) => add_parsed_rdata(fs, format!("{preference} {name}")),
                None => add_raw_rdata(fs, rdata),
            }
        }
        QTYPE_TXT => {
            if !rdata.is_empty() && rdata[0] as usize != rdata.len() - 1 {
                tracing::warn!("TXT record with wrong length prefix, not parsing");
                add_raw_rdata(fs, rdata);
            } else {
                let text = rdata.get(1..).unwrap_or(&[]);
                add_parsed_rdata(fs, String::from_utf8_lossy(text).into_owned());
            }
        }
        QTYPE_A => {
            if rdata.len() != 4 {
                tracing::warn!(len = rdata.len(), "A record with bad address length, not parsing");
                add_raw_rdata(fs, rdata);
            } else {
                let addr = Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]);
                add_parsed_rdata(fs, addr.to_string());
            }
        }
        QTYPE_AAAA => {
            if rdata.len() != 16 {
                tracing::warn!(
                    len = rdata.len(),
                    "AAAA record with bad address length, not parsing"
                );
                add_raw_rdata(fs, rdata);
            } else {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                add_parsed_rdata(fs, Ipv6Addr::from(octets).to_string());
            }
        }
        _ => add_raw_rdata(fs, rdata),
    }
}

// ---- dns header view ----

struct DnsHeader<'a> {
    data: &'a [u8],
}

impl<'a> DnsHeader<'a> {
    fn parse(data: &'a [u8]) -> Option<Self> {
        (data.len() >= DNS_HLEN).then_some(Self { data })
    }

    fn id(&self) -> u16 {
        u16::from_be_bytes([self.data[0], self.data[1]])
    }

    fn qr(&self) -> u8 {
        self.data[2] >> 7
    }

    fn opcode(&self) -> u8 {
        (self.data[2] >> 3) & 0x0F
    }

    fn aa(&self) -> u8 {
        (self.data[2] >> 2) & 1
    }

    fn tc(&self) -> u8 {
        (self.data[2] >> 1) & 1
    }

    fn rd(&self) -> u8 {
        self.data[2] & 1
    }

    fn ra(&self) -> u8 {
        self.data[3] >> 7
    }

    fn z(&self) -> u8 {
        (self.data[3] >> 6) & 1
    }

    fn ad(&self) -> u8 {
        (self.data[3] >> 5) & 1
    }

    fn cd(&self) -> u8 {
        (self.data[3] >> 4) & 1
    }

    fn rcode(&self) -> u8 {
        self.data[3] & 0x0F
    }

    fn qdcount(&self) -> u16 {
        u16::from_be_bytes([self.data[4], self.data[5]])
    }

    fn ancount(&self) -> u16 {
        u16::from_be_bytes([self.data[6], self.data[7]])
    }

    fn nscount(&self) -> u16 {
        u16::from_be_bytes([self.data[8], self.data[9]])
    }

    fn arcount(&self) -> u16 {
        u16::from_be_bytes([self.data[10], self.data[11]])
    }
}

// ---- the module ----

/// The DNS probe module. Immutable after construction; every send thread
/// shares one instance.
#[derive(Debug)]
pub struct DnsProbe {
    queries: Vec<PrebuiltQuery>,
    pool: SourcePortPool,
    ip_padding: bool,
    max_packet_length: usize,
}

impl DnsProbe {
    pub fn from_config(cfg: &ScanConfig) -> Result<Self> {
        let specs = parse_probe_args(cfg.probe_args.as_deref())?;
        if cfg.packet_streams as usize % specs.len() != 0 {
            return Err(ScanError::Config(format!(
                "number of probes ({}) must be a multiple of the number of DNS questions ({})",
                cfg.packet_streams,
                specs.len()
            )));
        }
        let queries: Vec<PrebuiltQuery> =
            specs.iter().map(PrebuiltQuery::build).collect::<Result<_>>()?;
        let max_payload = queries.iter().map(|q| q.payload.len()).max().unwrap_or(0);
        Ok(Self {
            queries,
            pool: SourcePortPool::new(
                cfg.source_port_first,
                cfg.source_port_last,
                cfg.packet_streams,
            ),
            ip_padding: cfg.dns_ip_padding,
            max_packet_length: ETH_HLEN + IPV4_HLEN + UDP_HLEN + max_payload,
        })
    }

    pub fn num_questions(&self) -> usize {
        self.queries.len()
    }

    fn query_for_probe(&self, probe_num: u16) -> &PrebuiltQuery {
        &self.queries[probe_num as usize % self.queries.len()]
    }

    /// Does the response's transaction ID and question section echo one of
    /// our queries? This is the `success` criterion and the
    /// protocol-specific half of validation.
    fn matches_question(&self, udp: &UdpSlice, validation: &Validation) -> bool {
        let payload = udp.payload();
        if payload.len() < DNS_HLEN {
            return false;
        }
        let id = u16::from_be_bytes([payload[0], payload[1]]);
        if id != (validation[2] & 0xFFFF) as u16 {
            return false;
        }
        let skip = if self.ip_padding { 16 } else { 0 };
        for q in &self.queries {
            if (udp.claimed_len() as usize) < q.payload.len() {
                continue;
            }
            let q_section = &q.payload[DNS_HLEN..DNS_HLEN + q.qname_len + QUESTION_TAIL_LEN];
            let resp_section =
                match payload.get(DNS_HLEN..DNS_HLEN + q.qname_len + QUESTION_TAIL_LEN) {
                    Some(s) => s,
                    None => continue,
                };
            if skip < q.qname_len && q_section[skip..] == resp_section[skip..] {
                return true;
            }
        }
        false
    }

    fn add_null_dns_fields(fs: &mut FieldSet) {
        for name in [
            "dns_id", "dns_rd", "dns_tc", "dns_aa", "dns_opcode", "dns_qr", "dns_rcode",
            "dns_cd", "dns_ad", "dns_z", "dns_ra", "dns_qdcount", "dns_ancount", "dns_nscount",
            "dns_arcount",
        ] {
            fs.add_null(name);
        }
        fs.add_repeated("dns_questions", Vec::new());
        fs.add_repeated("dns_answers", Vec::new());
        fs.add_repeated("dns_authorities", Vec::new());
        fs.add_repeated("dns_additionals", Vec::new());
        fs.add_uint64("dns_parse_err", 1);
        fs.add_uint64("dns_unconsumed_bytes", 0);
    }

    /// Parse header bits and the four record sections into `fs`. A decode
    /// failure makes the error sticky: later sections stay unparsed and
    /// their bytes show up in `dns_unconsumed_bytes`.
    fn add_parsed_dns_fields(fs: &mut FieldSet, dns_payload: &[u8]) {
        let hdr = match DnsHeader::parse(dns_payload) {
            Some(hdr) => hdr,
            None => {
                Self::add_null_dns_fields(fs);
                return;
            }
        };
        fs.add_uint64("dns_id", hdr.id() as u64);
        fs.add_uint64("dns_rd", hdr.rd() as u64);
        fs.add_uint64("dns_tc", hdr.tc() as u64);
        fs.add_uint64("dns_aa", hdr.aa() as u64);
        fs.add_uint64("dns_opcode", hdr.opcode() as u64);
        fs.add_uint64("dns_qr", hdr.qr() as u64);
        fs.add_uint64("dns_rcode", hdr.rcode() as u64);
        fs.add_uint64("dns_cd", hdr.cd() as u64);
        fs.add_uint64("dns_ad", hdr.ad() as u64);
        fs.add_uint64("dns_z", hdr.z() as u64);
        fs.add_uint64("dns_ra", hdr.ra() as u64);
        fs.add_uint64("dns_qdcount", hdr.qdcount() as u64);
        fs.add_uint64("dns_ancount", hdr.ancount() as u64);
        fs.add_uint64("dns_nscount", hdr.nscount() as u64);
        fs.add_uint64("dns_arcount", hdr.arcount() as u64);

        let mut pos = DNS_HLEN;
        let mut err = false;

        let mut questions = Vec::new();
        for _ in 0..hdr.qdcount() {
            if err {
                break;
            }
            match parse_question(dns_payload, &mut pos) {
                Some(qfs) => questions.push(qfs),
                None => err = true,
            }
        }
        fs.add_repeated("dns_questions", questions);

        let sections: [(&'static str, u16); 3] = [
            ("dns_answers", hdr.ancount()),
            ("dns_authorities", hdr.nscount()),
            ("dns_additionals", hdr.arcount()),
        ];
        for (name, count) in sections {
            let mut records = Vec::new();
            for _ in 0..count {
                if err {
                    break;
                }
                match parse_record(dns_payload, &mut pos) {
                    Some(afs) => records.push(afs),
                    None => err = true,
                }
            }
            fs.add_repeated(name, records);
        }

        let unconsumed = dns_payload.len() - pos;
        if unconsumed != 0 {
            err = true;
        }
        fs.add_uint64("dns_parse_err", err as u64);
        fs.add_uint64("dns_unconsumed_bytes", unconsumed as u64);
    }
}

impl ProbeModule for DnsProbe {
    fn name(&self) -> &'static str {
        "dns"
    }

    fn pcap_filter(&self) -> String {
        "udp || icmp".to_string()
    }

    fn pcap_snaplen(&self) -> usize {
        PCAP_SNAPLEN
    }

    fn max_packet_length(&self) -> usize {
        self.max_packet_length
    }

    fn output_type(&self) -> OutputType {
        OutputType::Dynamic
    }

    fn fields(&self) -> &'static [FieldDef] {
        FIELDS
    }

    fn helptext(&self) -> &'static str {
        "Sends DNS queries and parses basic responses. By default performs an \
         A record lookup for www.google.com. Other queries are specified with \
         --probe-args in the form 'type,query' (e.g. 'A,google.com'); multiple \
         questions are separated by semicolons and require the probe count to \
         be a multiple of the question count. Supported query types: A, NS, \
         CNAME, SOA, PTR, MX, TXT, AAAA, RRSIG, ALL. Append ':nr' to a type \
         to clear the recursion-desired bit. Responses of type A, NS, CNAME, \
         MX, TXT, and AAAA are parsed in full; other types are output raw."
    }

    fn prepare_packet(
        &self,
        buf: &mut [u8],
        src_mac: &MacAddr,
        gw_mac: &MacAddr,
        _ctx: &mut ThreadCtx,
    ) -> Result<()> {
        buf.fill(0);
        let first = &self.queries[0];
        write_eth_header(buf, src_mac, gw_mac);
        write_ipv4_header(
            &mut buf[ETH_HLEN..],
            IPPROTO_UDP,
            (IPV4_HLEN + UDP_HLEN + first.payload.len()) as u16,
        );
        write_udp_header(
            &mut buf[ETH_HLEN + IPV4_HLEN..],
            (UDP_HLEN + first.payload.len()) as u16,
        );
        let payload_at = ETH_HLEN + IPV4_HLEN + UDP_HLEN;
        buf[payload_at..payload_at + first.payload.len()].copy_from_slice(&first.payload);
        Ok(())
    }

    fn make_packet(
        &self,
        buf: &mut [u8],
        target: &ProbeTarget,
        _ctx: &mut ThreadCtx,
    ) -> Result<usize> {
        let (src_ip, dst_ip) = match target.addrs {
            FlowAddrs::V4 { src, dst } => (src, dst),
            FlowAddrs::V6 { .. } => {
                return Err(ScanError::Config("dns module scans IPv4 targets only".into()))
            }
        };
        let query = self.query_for_probe(target.probe_num);
        let frame_len = ETH_HLEN + IPV4_HLEN + UDP_HLEN + query.payload.len();
        if frame_len > buf.len() || frame_len > MAX_PACKET_SIZE {
            return Err(ScanError::PayloadTooLarge { len: frame_len, limit: MAX_PACKET_SIZE });
        }

        let mut ip = Ipv4Header::new(&mut buf[ETH_HLEN..]);
        ip.set_total_len((IPV4_HLEN + UDP_HLEN + query.payload.len()) as u16);
        ip.set_src(src_ip);
        ip.set_dst(dst_ip);
        ip.set_ttl(target.ttl);
        ip.set_id(target.ip_id);

        let mut udp = UdpHeader::new(&mut buf[ETH_HLEN + IPV4_HLEN..]);
        udp.set_len((UDP_HLEN + query.payload.len()) as u16);
        // The question repeats across probes to the same target, the source
        // port does not: it indexes by probe number.
        udp.set_sport(self.pool.src_port(target.probe_num, &target.validation));
        udp.set_dport(target.dport);

        let payload_at = ETH_HLEN + IPV4_HLEN + UDP_HLEN;
        buf[payload_at..payload_at + query.payload.len()].copy_from_slice(&query.payload);
        let id = (target.validation[2] & 0xFFFF) as u16;
        buf[payload_at..payload_at + 2].copy_from_slice(&id.to_be_bytes());

        Ipv4Header::new(&mut buf[ETH_HLEN..]).finalize_checksum();

        if self.ip_padding {
            let qname_at = payload_at + DNS_HLEN;
            if frame_len >= qname_at + 16 {
                buf[qname_at..qname_at + 16].copy_from_slice(&ip_padding_prefix(dst_ip));
            } else {
                tracing::warn!(frame_len, "frame too small for IP padding, skipping");
            }
        }
        Ok(frame_len)
    }

    fn validate_packet(
        &self,
        ip_packet: &[u8],
        validation: &Validation,
        blocklist: &dyn Blocklist,
    ) -> bool {
        let ip = match Ipv4Slice::parse(ip_packet) {
            Some(ip) => ip,
            None => return false,
        };
        if !udp_validate_common(&ip, &self.pool, validation, blocklist) {
            return false;
        }
        if ip.protocol() == IPPROTO_UDP {
            let udp = match UdpSlice::parse(ip.payload()) {
                Some(udp) => udp,
                None => return false,
            };
            if (ip.len() as u64) < udp.claimed_len() as u64 {
                return false;
            }
            if !self.matches_question(&udp, validation) {
                return false;
            }
        }
        true
    }

    fn process_packet(
        &self,
        frame: &[u8],
        fs: &mut FieldSet,
        validation: &Validation,
        _ts: SystemTime,
    ) {
        let ip = match Ipv4Slice::from_eth_frame(frame) {
            Some(ip) => ip,
            None => return,
        };
        match ip.protocol() {
            IPPROTO_UDP => {
                let udp = match UdpSlice::parse(ip.payload()) {
                    Some(udp) => udp,
                    None => return,
                };
                let udp_len = udp.claimed_len() as usize;
                let is_valid = self.matches_question(&udp, validation);
                let payload = udp.payload();
                let dns_payload =
                    &payload[..payload.len().min(udp_len.saturating_sub(UDP_HLEN))];

                fs.add_uint64("sport", udp.sport() as u64);
                fs.add_uint64("dport", udp.dport() as u64);
                fs.add_string("classification", "dns");
                fs.add_bool("success", is_valid);
                let app_success = match DnsHeader::parse(dns_payload) {
                    Some(hdr) => is_valid && hdr.qr() == 1 && hdr.rcode() == 0,
                    None => false,
                };
                fs.add_bool("app_success", app_success);
                add_null_icmp_fields(fs);
                fs.add_uint64("udp_len", udp_len as u64);
                if is_valid {
                    Self::add_parsed_dns_fields(fs, dns_payload);
                } else {
                    Self::add_null_dns_fields(fs);
                }
                fs.add_binary("raw_data", dns_payload);
            }
            IPPROTO_ICMP => {
                fs.add_null("sport");
                fs.add_null("dport");
                fs.add_string("classification", "icmp");
                fs.add_bool("success", false);
                fs.add_bool("app_success", false);
                add_icmp_fields(fs, &ip);
                fs.add_null("udp_len");
                Self::add_null_dns_fields(fs);
                fs.add_binary("raw_data", frame);
            }
            proto => {
                // The pcap filter and validate_packet only admit UDP and
                // ICMP; anything else indicates a filter/process mismatch.
                tracing::error!(proto, "dns process_packet got unexpected protocol");
            }
        }
    }

    fn print_packet(&self, w: &mut dyn Write, frame: &[u8]) -> io::Result<()> {
        writeln!(w, "{PRINT_PACKET_SEP}")?;
        if let Some(ip) = Ipv4Slice::from_eth_frame(frame) {
            if let Some(udp) = UdpSlice::parse(ip.payload()) {
                writeln!(
                    w,
                    "dns {{ source: {} | dest: {} | checksum: {:#06X} }}",
                    udp.sport(),
                    udp.dport(),
                    udp.checksum()
                )?;
            }
            writeln!(w, "{}", format_ipv4_line(&ip))?;
        }
        writeln!(w, "{}", format_eth_line(frame))?;
        writeln!(w, "{PRINT_PACKET_SEP}")
    }
}

const FIELDS: &[FieldDef] = &[
    FieldDef { name: "sport", kind: FieldKind::Int, desc: "UDP source port" },
    FieldDef { name: "dport", kind: FieldKind::Int, desc: "UDP destination port" },
    FieldDef { name: "classification", kind: FieldKind::String, desc: "packet classification" },
    FieldDef { name: "success", kind: FieldKind::Bool, desc: "is response considered success" },
    FieldDef {
        name: "app_success",
        kind: FieldKind::Bool,
        desc: "is the RA bit set with no error code?",
    },
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
    FieldDef { name: "udp_len", kind: FieldKind::Int, desc: "UDP packet length" },
    FieldDef { name: "dns_id", kind: FieldKind::Int, desc: "DNS transaction ID" },
    FieldDef { name: "dns_rd", kind: FieldKind::Int, desc: "DNS recursion desired" },
    FieldDef { name: "dns_tc", kind: FieldKind::Int, desc: "DNS packet truncated" },
    FieldDef { name: "dns_aa", kind: FieldKind::Int, desc: "DNS authoritative answer" },
    FieldDef { name: "dns_opcode", kind: FieldKind::Int, desc: "DNS opcode (query type)" },
    FieldDef { name: "dns_qr", kind: FieldKind::Int, desc: "DNS query(0) or response (1)" },
    FieldDef { name: "dns_rcode", kind: FieldKind::Int, desc: "DNS response code" },
    FieldDef { name: "dns_cd", kind: FieldKind::Int, desc: "DNS checking disabled" },
    FieldDef { name: "dns_ad", kind: FieldKind::Int, desc: "DNS authenticated data" },
    FieldDef { name: "dns_z", kind: FieldKind::Int, desc: "DNS reserved" },
    FieldDef { name: "dns_ra", kind: FieldKind::Int, desc: "DNS recursion available" },
    FieldDef { name: "dns_qdcount", kind: FieldKind::Int, desc: "DNS number questions" },
    FieldDef { name: "dns_ancount", kind: FieldKind::Int, desc: "DNS number answer RR's" },
    FieldDef {
        name: "dns_nscount",
        kind: FieldKind::Int,
        desc: "DNS number NS RR's in authority section",
    },
    FieldDef { name: "dns_arcount", kind: FieldKind::Int, desc: "DNS number additional RR's" },
    FieldDef { name: "dns_questions", kind: FieldKind::Repeated, desc: "DNS question list" },
    FieldDef { name: "dns_answers", kind: FieldKind::Repeated, desc: "DNS answer list" },
    FieldDef { name: "dns_authorities", kind: FieldKind::Repeated, desc: "DNS authority list" },
    FieldDef { name: "dns_additionals", kind: FieldKind::Repeated, desc: "DNS additional list" },
    FieldDef {
        name: "dns_parse_err",
        kind: FieldKind::Int,
        desc: "problem parsing the DNS response",
    },
    FieldDef {
        name: "dns_unconsumed_bytes",
        kind: FieldKind::Int,
        desc: "bytes left over when parsing the DNS response",
    },
    FieldDef { name: "raw_data", kind: FieldKind::Binary, desc: "UDP payload" },
];
