//! Pluggable probe modules.
//!
//! A probe module owns one scan strategy: how to build probe frames, how to
//! recognize responses to them, and how to turn an accepted response into
//! output fields. The send and receive loops only ever talk to the
//! [`ProbeModule`] trait; concrete modules are constructed from the scan
//! configuration through the registry at startup and are immutable for the
//! rest of the run.

pub mod dns;
pub mod ipv6_udp;

use std::io::{self, Write};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::SystemTime;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::{MacAddr, ScanConfig};
use crate::error::{Result, ScanError};
use crate::net::headers::{
    Icmp6Slice, Ipv4Slice, Ipv6Slice, UdpSlice, IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_UDP,
    UDP_HLEN,
};
use crate::net::icmp::{
    icmp_helper_validate, ICMP6_TYPE_DEST_UNREACH, ICMP6_TYPE_PACKET_TOO_BIG,
    ICMP6_TYPE_PARAM_PROBLEM, ICMP6_TYPE_TIME_EXCEEDED,
};
use crate::output::{FieldDef, FieldKind, FieldSet, OutputType};
use crate::target::Blocklist;
use crate::validate::{SourcePortPool, Validation};

/// Separator line around dry-run packet dumps.
pub const PRINT_PACKET_SEP: &str = "------------------------------------------------------";

/// Flow addresses for one probe.
#[derive(Debug, Clone, Copy)]
pub enum FlowAddrs {
    V4 { src: Ipv4Addr, dst: Ipv4Addr },
    V6 { src: Ipv6Addr, dst: Ipv6Addr },
}

/// Everything `make_packet` needs to finalize one frame in place.
#[derive(Debug, Clone, Copy)]
pub struct ProbeTarget {
    pub addrs: FlowAddrs,
    pub dport: u16,
    pub ttl: u8,
    /// Which of the target's `packet_streams` probes this is.
    pub probe_num: u16,
    /// IP identification value (low 16 bits of validation word 3).
    pub ip_id: u16,
    pub validation: Validation,
}

/// Per-thread module context, created once per send thread and passed back
/// on every packet call. Holds the thread's reproducible random stream.
pub struct ThreadCtx {
    pub rng: StdRng,
}

impl ThreadCtx {
    /// Context for send thread `thread_id`, seeded from the scan seed so
    /// per-thread streams are disjoint but reproducible.
    pub fn new(cfg: &ScanConfig, thread_id: u32) -> Self {
        let base = cfg.seed.unwrap_or_else(rand::random);
        Self {
            rng: StdRng::seed_from_u64(base ^ ((thread_id as u64) << 32 | 0x9e37_79b9)),
        }
    }
}

/// One scan strategy: probe construction, response validation, response
/// parsing, plus the metadata the outer layers need (pcap filter, output
/// schema, frame ceiling).
pub trait ProbeModule: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// BPF expression selecting frames this module wants to see.
    fn pcap_filter(&self) -> String;

    fn pcap_snaplen(&self) -> usize {
        1500
    }

    /// Whether `--target-port` applies to this module.
    fn port_args(&self) -> bool {
        true
    }

    /// Upper bound on any frame `make_packet` will produce.
    fn max_packet_length(&self) -> usize;

    fn output_type(&self) -> OutputType {
        OutputType::Static
    }

    /// The module's output columns, in record order.
    fn fields(&self) -> &'static [FieldDef];

    fn helptext(&self) -> &'static str;

    /// Lay down the invariant header prefix into a reusable batch slot.
    /// Called once per slot before the send loop starts; must zero `buf`.
    fn prepare_packet(
        &self,
        buf: &mut [u8],
        src_mac: &MacAddr,
        gw_mac: &MacAddr,
        ctx: &mut ThreadCtx,
    ) -> Result<()>;

    /// Finalize one frame in place; returns the frame length.
    fn make_packet(&self, buf: &mut [u8], target: &ProbeTarget, ctx: &mut ThreadCtx)
        -> Result<usize>;

    /// Stateless response classifier over the IP packet (no Ethernet
    /// header). Returns whether the packet can be a response to a probe
    /// this scan could have sent.
    fn validate_packet(
        &self,
        ip_packet: &[u8],
        validation: &Validation,
        blocklist: &dyn Blocklist,
    ) -> bool;

    /// Populate `fs` from an accepted frame (Ethernet header included).
    /// Must not fail once `validate_packet` accepted; parse trouble is
    /// reported through data fields instead.
    fn process_packet(
        &self,
        frame: &[u8],
        fs: &mut FieldSet,
        validation: &Validation,
        ts: SystemTime,
    );

    /// Dry-run formatter for one prepared frame.
    fn print_packet(&self, w: &mut dyn Write, frame: &[u8]) -> io::Result<()>;
}

// ---- registry ----

type ModuleCtor = fn(&ScanConfig) -> Result<Box<dyn ProbeModule>>;

fn make_dns(cfg: &ScanConfig) -> Result<Box<dyn ProbeModule>> {
    Ok(Box::new(dns::DnsProbe::from_config(cfg)?))
}

fn make_ipv6_udp(cfg: &ScanConfig) -> Result<Box<dyn ProbeModule>> {
    Ok(Box::new(ipv6_udp::Ipv6UdpProbe::from_config(cfg)?))
}

const REGISTRY: &[(&str, ModuleCtor)] = &[("dns", make_dns), ("ipv6_udp", make_ipv6_udp)];

/// Construct the module registered under `name` (case-sensitive).
pub fn module_by_name(name: &str, cfg: &ScanConfig) -> Result<Box<dyn ProbeModule>> {
    match REGISTRY.iter().find(|(n, _)| *n == name) {
        Some((_, ctor)) => ctor(cfg),
        None => Err(ScanError::UnknownModule(name.to_string())),
    }
}

/// Names of all registered probe modules, in registration order.
pub fn module_names() -> Vec<&'static str> {
    REGISTRY.iter().map(|(n, _)| *n).collect()
}

// ---- shared response plumbing ----

/// UDP/ICMP admission shared by the IPv4 UDP-based modules: a UDP response
/// must target a source port in the validation window; an ICMP error must
/// quote a probe we could have sent, with the quoted source port in the
/// window.
pub(crate) fn udp_validate_common(
    ip: &Ipv4Slice,
    pool: &SourcePortPool,
    validation: &Validation,
    blocklist: &dyn Blocklist,
) -> bool {
    match ip.protocol() {
        IPPROTO_UDP => match UdpSlice::parse(ip.payload()) {
            Some(udp) => pool.contains(udp.dport(), validation),
            None => false,
        },
        IPPROTO_ICMP => {
            let inner = match icmp_helper_validate(ip, UDP_HLEN, blocklist) {
                Some(inner) => inner,
                None => return false,
            };
            match UdpSlice::parse(inner.payload()) {
                Some(udp) => pool.contains(udp.sport(), validation),
                None => false,
            }
        }
        _ => false,
    }
}

/// IPv6 counterpart of [`udp_validate_common`]: UDP responses check the
/// destination port window, ICMPv6 errors must quote one of our UDP probes.
pub(crate) fn udp6_validate_common(
    ip: &Ipv6Slice,
    pool: &SourcePortPool,
    validation: &Validation,
) -> bool {
    match ip.next_header() {
        IPPROTO_UDP => match UdpSlice::parse(ip.payload()) {
            Some(udp) => pool.contains(udp.dport(), validation),
            None => false,
        },
        IPPROTO_ICMPV6 => {
            let icmp = match Icmp6Slice::parse(ip.payload()) {
                Some(icmp) => icmp,
                None => return false,
            };
            match icmp.icmp_type() {
                ICMP6_TYPE_DEST_UNREACH
                | ICMP6_TYPE_PACKET_TOO_BIG
                | ICMP6_TYPE_TIME_EXCEEDED
                | ICMP6_TYPE_PARAM_PROBLEM => {}
                _ => return false,
            }
            let inner = match Ipv6Slice::parse(icmp.body()) {
                Some(inner) => inner,
                None => return false,
            };
            if inner.next_header() != IPPROTO_UDP {
                return false;
            }
            match UdpSlice::parse(inner.payload()) {
                Some(udp) => pool.contains(udp.sport(), validation),
                None => false,
            }
        }
        _ => false,
    }
}

/// Address/TTL columns shared by every IPv4 response record.
pub fn add_ip_fields(fs: &mut FieldSet, ip: &Ipv4Slice) {
    fs.add_string("saddr", ip.src().to_string());
    fs.add_uint64("saddr_raw", u32::from(ip.src()) as u64);
    fs.add_string("daddr", ip.dst().to_string());
    fs.add_uint64("daddr_raw", u32::from(ip.dst()) as u64);
    fs.add_uint64("ipid", ip.id() as u64);
    fs.add_uint64("ttl", ip.ttl() as u64);
}

/// Address/TTL columns shared by every IPv6 response record. The integer
/// columns cannot carry a 128-bit address; they stay as zero placeholders
/// so IPv4 and IPv6 records share one schema.
pub fn add_ipv6_fields(fs: &mut FieldSet, ip: &Ipv6Slice) {
    fs.add_string("saddr", ip.src().to_string());
    fs.add_uint64("saddr_raw", 0);
    fs.add_string("daddr", ip.dst().to_string());
    fs.add_uint64("daddr_raw", 0);
    fs.add_uint64("ipid", 0);
    fs.add_uint64("ttl", ip.hop_limit() as u64);
}

/// Schema for the shared IP columns.
pub const IP_FIELDS: &[FieldDef] = &[
    FieldDef { name: "saddr", kind: FieldKind::String, desc: "source IP address of response" },
    FieldDef {
        name: "saddr_raw",
        kind: FieldKind::Int,
        desc: "network order integer form of source IP address",
    },
    FieldDef { name: "daddr", kind: FieldKind::String, desc: "destination IP address of response" },
    FieldDef {
        name: "daddr_raw",
        kind: FieldKind::Int,
        desc: "network order integer form of destination IP address",
    },
    FieldDef { name: "ipid", kind: FieldKind::Int, desc: "IP identification number of response" },
    FieldDef { name: "ttl", kind: FieldKind::Int, desc: "time-to-live of response packet" },
];

/// The full column set of a response record: the shared IP columns followed
/// by the module's own fields. Output sinks build their schema from this.
pub fn full_field_catalog(module: &dyn ProbeModule) -> Vec<FieldDef> {
    IP_FIELDS.iter().chain(module.fields()).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanConfig;

    fn dns_config() -> ScanConfig {
        ScanConfig { dest_ports: vec![53], ..Default::default() }
    }

    #[test]
    fn test_registry_lookup_is_case_sensitive() {
        let cfg = dns_config();
        assert!(module_by_name("dns", &cfg).is_ok());
        let err = module_by_name("DNS", &cfg).unwrap_err();
        assert_eq!(err.kind(), "UnknownModule");
    }

    #[test]
    fn test_registry_enumerates_modules() {
        let names = module_names();
        assert_eq!(names, vec!["dns", "ipv6_udp"]);
    }

    #[test]
    fn test_unknown_module_error_names_the_module() {
        let err = module_by_name("quic", &dns_config()).unwrap_err();
        assert!(err.to_string().contains("quic"));
    }

    #[test]
    fn test_ip_field_helpers_match_the_declared_schema() {
        use crate::net::headers::{write_ipv4_header, write_ipv6_header};

        let expected: Vec<&str> = IP_FIELDS.iter().map(|d| d.name).collect();

        let mut v4_pkt = [0u8; 20];
        write_ipv4_header(&mut v4_pkt, 17, 20);
        let ip4 = Ipv4Slice::parse(&v4_pkt).unwrap();
        let mut fs = FieldSet::new();
        add_ip_fields(&mut fs, &ip4);
        let names: Vec<&str> = fs.iter().map(|(n, _)| n).collect();
        assert_eq!(names, expected);

        let mut v6_pkt = [0u8; 40];
        write_ipv6_header(&mut v6_pkt, 17, 0);
        let ip6 = Ipv6Slice::parse(&v6_pkt).unwrap();
        let mut fs = FieldSet::new();
        add_ipv6_fields(&mut fs, &ip6);
        let names: Vec<&str> = fs.iter().map(|(n, _)| n).collect();
        assert_eq!(names, expected, "IPv4 and IPv6 records must share one schema");
        assert_eq!(fs.get("saddr_raw"), Some(&crate::output::FieldVal::Uint(0)));
        assert_eq!(fs.get("daddr_raw"), Some(&crate::output::FieldVal::Uint(0)));
    }

    #[test]
    fn test_full_field_catalog_prepends_ip_columns() {
        let cfg = dns_config();
        let module = module_by_name("dns", &cfg).unwrap();
        let catalog = full_field_catalog(module.as_ref());
        assert_eq!(catalog.len(), IP_FIELDS.len() + module.fields().len());
        assert_eq!(catalog[0].name, "saddr");
        assert_eq!(
            catalog[IP_FIELDS.len()].name,
            module.fields()[0].name,
            "module columns follow the shared IP columns"
        );
    }

    #[test]
    fn test_thread_ctx_streams_are_reproducible_and_disjoint() {
        use rand::RngCore;
        let cfg = ScanConfig { seed: Some(99), ..Default::default() };
        let mut a1 = ThreadCtx::new(&cfg, 0);
        let mut a2 = ThreadCtx::new(&cfg, 0);
        let mut b = ThreadCtx::new(&cfg, 1);
        let first = a1.rng.next_u64();
        assert_eq!(first, a2.rng.next_u64(), "same seed + thread id must repeat");
        assert_ne!(first, b.rng.next_u64(), "different threads get different streams");
    }
}
