//! Runtime constants and the read-only scan configuration.
//!
//! All tunable ceilings and defaults are collected here so they can be found
//! and adjusted in a single place rather than scattered across modules.
//! `ScanConfig` is built once by the CLI layer and borrowed immutably by
//! every send thread; only the rate controller holds shared mutable state.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, ScanError};

/// Hard ceiling on any produced frame, headers included (bytes).
pub const MAX_PACKET_SIZE: usize = 4096;

/// Default IP TTL / IPv6 hop limit for skeleton headers.
pub const MAX_TTL: u8 = 255;

/// Default target rate when neither rate nor bandwidth is configured (pps).
pub const DEFAULT_RATE_PPS: u64 = 10_000;

/// Per-thread iteration rate below which the regulator sleeps between
/// packets instead of busy-spinning (iterations per second).
pub const SLOW_REGIME_THRESHOLD: f64 = 1000.0;

/// Default batch capacity for the per-thread packet batch.
pub const DEFAULT_BATCH_CAPACITY: u16 = 64;

/// Ethernet address length in bytes.
pub const ETH_ALEN: usize = 6;

/// A MAC address as raw octets.
pub type MacAddr = [u8; ETH_ALEN];

/// Read-only configuration shared by all send threads.
///
/// Field meanings follow the external config contract: the CLI layer
/// populates this once, validation happens in [`ScanConfig::validate`] and
/// the probe-module constructors.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Target send rate in packets per second (0 = derive from bandwidth
    /// or fall back to the default).
    pub rate_pps: u64,
    /// Target bandwidth in bits per second (0 = use `rate_pps`).
    pub bandwidth_bps: u64,
    /// Number of send threads.
    pub senders: u32,
    /// This process's shard number and the total shard count.
    pub shard_num: u32,
    pub total_shards: u32,
    /// Probes sent per target ("packet streams").
    pub packet_streams: u16,
    /// Extra attempts the transmit primitive may make per batch.
    pub retries: u32,
    /// Packet batch capacity per send thread.
    pub batch: u16,
    /// Inclusive source-port range probes are sent from.
    pub source_port_first: u16,
    pub source_port_last: u16,
    /// Source addresses probes rotate through.
    pub source_ips: Vec<Ipv4Addr>,
    /// Destination ports in scan order; the v6 path uses the first entry.
    pub dest_ports: Vec<u16>,
    /// TTL stamped on outgoing probes.
    pub probe_ttl: u8,
    /// Module-specific argument string (`--probe-args`).
    pub probe_args: Option<String>,
    /// Source and gateway MAC addresses, if resolved.
    pub hw_mac: Option<MacAddr>,
    pub gw_mac: Option<MacAddr>,
    /// Print frames instead of transmitting them.
    pub dryrun: bool,
    /// Wall-clock cap on the send phase.
    pub max_runtime: Option<Duration>,
    /// Per-shard caps.
    pub max_targets: Option<u64>,
    pub max_packets: Option<u64>,
    /// IPv6 scanning: source address and streamed target file.
    pub ipv6_source: Option<Ipv6Addr>,
    pub ipv6_target_file: Option<PathBuf>,
    /// Optional list-of-IPs bitmap file restricting iterator output.
    pub list_of_ips_file: Option<PathBuf>,
    /// DNS module: overwrite the leading 16 qname bytes with the dotted-quad
    /// destination (and skip them when matching responses).
    pub dns_ip_padding: bool,
    /// Fixed seed for reproducible per-thread random streams (None = random).
    pub seed: Option<u64>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            rate_pps: 0,
            bandwidth_bps: 0,
            senders: 1,
            shard_num: 0,
            total_shards: 1,
            packet_streams: 1,
            retries: 0,
            batch: DEFAULT_BATCH_CAPACITY,
            source_port_first: 32768,
            source_port_last: 61000,
            source_ips: vec![Ipv4Addr::new(192, 0, 2, 1)],
            dest_ports: vec![80],
            probe_ttl: MAX_TTL,
            probe_args: None,
            hw_mac: Some([0; ETH_ALEN]),
            gw_mac: Some([0; ETH_ALEN]),
            dryrun: false,
            max_runtime: None,
            max_targets: None,
            max_packets: None,
            ipv6_source: None,
            ipv6_target_file: None,
            list_of_ips_file: None,
            dns_ip_padding: false,
            seed: None,
        }
    }
}

impl ScanConfig {
    /// Number of source ports in the configured pool.
    pub fn num_src_ports(&self) -> u16 {
        self.source_port_last - self.source_port_first + 1
    }

    /// Source address for probe `local_offset` to `dst`, spreading probes
    /// across the configured addresses.
    pub fn source_ip_for(&self, dst: Ipv4Addr, local_offset: u16) -> Ipv4Addr {
        if self.source_ips.len() == 1 {
            return self.source_ips[0];
        }
        let idx = (u32::from(dst) as u64 + local_offset as u64) % self.source_ips.len() as u64;
        self.source_ips[idx as usize]
    }

    /// Resolve the effective packet rate, converting a bandwidth target to
    /// pps using the module's maximum frame length.
    ///
    /// The on-wire cost of a frame adds 24 bytes of preamble, start-frame
    /// delimiter, CRC, and inter-frame gap; frames below the 84-byte Ethernet
    /// minimum are billed at the minimum.
    pub fn effective_rate(&self, max_packet_length: usize) -> Result<u64> {
        if self.bandwidth_bps > 0 && self.rate_pps > 0 {
            return Err(ScanError::Config(
                "must specify rate or bandwidth, or neither, not both".into(),
            ));
        }
        if self.bandwidth_bps > 0 {
            let mut bits = (max_packet_length as u64 + 24) * 8;
            if bits < 84 * 8 {
                bits = 84 * 8;
            }
            let mut rate = self.bandwidth_bps / bits;
            if rate == 0 {
                tracing::warn!(
                    bandwidth_bps = self.bandwidth_bps,
                    "bandwidth is slower than 1 pkt/s, setting rate to 1 pkt/s"
                );
                rate = 1;
            }
            tracing::debug!(
                bandwidth_bps = self.bandwidth_bps,
                frame_bytes = max_packet_length,
                rate_pps = rate,
                "converted bandwidth target to packet rate"
            );
            return Ok(rate);
        }
        if self.rate_pps > 0 {
            return Ok(self.rate_pps);
        }
        Ok(DEFAULT_RATE_PPS)
    }

    /// Sanity checks that do not depend on the selected probe module.
    pub fn validate(&self) -> Result<()> {
        if self.senders == 0 {
            return Err(ScanError::Config("need at least one sender thread".into()));
        }
        if self.source_port_last < self.source_port_first {
            return Err(ScanError::Config("source port range is inverted".into()));
        }
        if self.source_ips.is_empty() {
            return Err(ScanError::Config("need at least one source IP".into()));
        }
        if self.dest_ports.is_empty() {
            return Err(ScanError::Config("need at least one destination port".into()));
        }
        if self.packet_streams == 0 {
            return Err(ScanError::Config("packet_streams must be positive".into()));
        }
        if self.ipv6_target_file.is_some() && self.ipv6_source.is_none() {
            return Err(ScanError::Config(
                "IPv6 scanning requires an IPv6 source address".into(),
            ));
        }
        Ok(())
    }
}

/// Render a MAC address as the usual colon-separated hex string.
pub fn format_mac(mac: &MacAddr) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ScanConfig::default().validate().is_ok());
    }

    #[test]
    fn test_num_src_ports() {
        let cfg = ScanConfig {
            source_port_first: 32768,
            source_port_last: 32775,
            ..Default::default()
        };
        assert_eq!(cfg.num_src_ports(), 8);
    }

    #[test]
    fn test_rate_and_bandwidth_both_set_is_rejected() {
        let cfg = ScanConfig {
            rate_pps: 1000,
            bandwidth_bps: 1_000_000,
            ..Default::default()
        };
        assert!(cfg.effective_rate(100).is_err());
    }

    #[test]
    fn test_effective_rate_defaults_to_10k() {
        let cfg = ScanConfig::default();
        assert_eq!(cfg.effective_rate(100).unwrap(), DEFAULT_RATE_PPS);
    }

    #[test]
    fn test_bandwidth_conversion_uses_min_frame_size() {
        // 54-byte DNS-ish frame + 24 bytes overhead = 78 < 84, so bill 84.
        let cfg = ScanConfig {
            bandwidth_bps: 84 * 8 * 100, // exactly 100 pps at minimum size
            ..Default::default()
        };
        assert_eq!(cfg.effective_rate(54).unwrap(), 100);
    }

    #[test]
    fn test_bandwidth_slower_than_one_pps_clamps_to_one() {
        let cfg = ScanConfig {
            bandwidth_bps: 8, // 1 byte per second
            ..Default::default()
        };
        assert_eq!(cfg.effective_rate(1000).unwrap(), 1);
    }

    #[test]
    fn test_source_ip_spreading_covers_all_addresses() {
        let ips = vec![
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 3),
        ];
        let cfg = ScanConfig { source_ips: ips.clone(), ..Default::default() };
        let dst = Ipv4Addr::new(1, 2, 3, 4);
        let mut seen = std::collections::HashSet::new();
        for i in 0..3 {
            seen.insert(cfg.source_ip_for(dst, i));
        }
        assert_eq!(seen.len(), 3, "three consecutive probes should use all three sources");
    }

    #[test]
    fn test_inverted_port_range_is_rejected() {
        let cfg = ScanConfig {
            source_port_first: 40000,
            source_port_last: 30000,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_format_mac() {
        assert_eq!(format_mac(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]), "de:ad:be:ef:00:01");
    }
}
