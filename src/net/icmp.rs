//! Shared handling for ICMP error responses that quote our probes.
//!
//! Hosts along the path may answer a UDP/TCP probe with destination
//! unreachable, source quench, redirect, or time exceeded, quoting the
//! original IP header plus at least 8 bytes of its payload. The helper here
//! digs out that inner packet so modules can match it against the probes
//! they could have sent.

use crate::net::headers::{IcmpSlice, Ipv4Slice, ICMP_HLEN, IPV4_HLEN};
use crate::output::FieldSet;
use crate::target::Blocklist;

pub const ICMP_TYPE_DEST_UNREACH: u8 = 3;
pub const ICMP_TYPE_SOURCE_QUENCH: u8 = 4;
pub const ICMP_TYPE_REDIRECT: u8 = 5;
pub const ICMP_TYPE_TIME_EXCEEDED: u8 = 11;

pub const ICMP6_TYPE_DEST_UNREACH: u8 = 1;
pub const ICMP6_TYPE_PACKET_TOO_BIG: u8 = 2;
pub const ICMP6_TYPE_TIME_EXCEEDED: u8 = 3;
pub const ICMP6_TYPE_PARAM_PROBLEM: u8 = 4;

/// Fixed strings for destination-unreachable codes 0..=15.
pub const ICMP_UNREACH_STRINGS: [&str; 16] = [
    "network unreachable",
    "host unreachable",
    "protocol unreachable",
    "port unreachable",
    "fragments required",
    "source route failed",
    "network unknown",
    "host unknown",
    "source host isolated",
    "network admin. prohibited",
    "host admin. prohibited",
    "network unreachable TOS",
    "host unreachable TOS",
    "communication admin. prohibited",
    "host precedence violation",
    "precedence cutoff",
];

/// Map an unreachable code to its fixed string; codes past the table emit
/// `unknown`.
pub fn unreach_code_str(code: u8) -> &'static str {
    ICMP_UNREACH_STRINGS
        .get(code as usize)
        .copied()
        .unwrap_or("unknown")
}

/// Validate an ICMP error against the probes we could have sent.
///
/// Accepts only the four quoting types, requires the quoted packet to cover
/// its own IP header plus `min_l4_len` bytes of transport header, and
/// requires the quoted destination to be one we are allowed to probe.
/// Returns the inner packet view on success.
pub fn icmp_helper_validate<'a>(
    ip: &Ipv4Slice<'a>,
    min_l4_len: usize,
    blocklist: &dyn Blocklist,
) -> Option<Ipv4Slice<'a>> {
    let min_len = ip.header_len() + ICMP_HLEN + IPV4_HLEN + min_l4_len;
    if ip.len() < min_len {
        return None;
    }
    let icmp = IcmpSlice::parse(ip.payload())?;
    match icmp.icmp_type() {
        ICMP_TYPE_DEST_UNREACH
        | ICMP_TYPE_SOURCE_QUENCH
        | ICMP_TYPE_REDIRECT
        | ICMP_TYPE_TIME_EXCEEDED => {}
        _ => return None,
    }
    let inner = Ipv4Slice::parse(icmp.body())?;
    if icmp.body().len() < inner.header_len() + min_l4_len {
        return None;
    }
    // The quoted destination is where *we* sent the probe.
    if !blocklist.is_allowed(inner.dst()) {
        return None;
    }
    Some(inner)
}

/// Null placeholders for the common ICMP output columns.
pub fn add_null_icmp_fields(fs: &mut FieldSet) {
    fs.add_null("icmp_responder");
    fs.add_null("icmp_type");
    fs.add_null("icmp_code");
    fs.add_null("icmp_unreach_str");
}

/// Populate the common ICMP output columns from an accepted ICMP error.
///
/// The responder is another host than the one we probed, so `saddr` is
/// rewritten to the quoted destination and the responder gets its own
/// column.
pub fn add_icmp_fields(fs: &mut FieldSet, ip: &Ipv4Slice) {
    let icmp = match IcmpSlice::parse(ip.payload()) {
        Some(icmp) => icmp,
        None => {
            add_null_icmp_fields(fs);
            return;
        }
    };
    if let Some(inner) = Ipv4Slice::parse(icmp.body()) {
        fs.modify_string("saddr", inner.dst().to_string());
    }
    fs.add_string("icmp_responder", ip.src().to_string());
    fs.add_uint64("icmp_type", icmp.icmp_type() as u64);
    fs.add_uint64("icmp_code", icmp.code() as u64);
    fs.add_string("icmp_unreach_str", unreach_code_str(icmp.code()).to_string());
}
