//! Per-flow validation tags and the source-port pool.
//!
//! The scanner keeps no per-flow state: every probe derives a 16-byte tag
//! from (source, destination, destination port) under a scan-wide secret
//! key, and stamps pieces of the tag into self-describing header fields
//! (source port, DNS transaction ID, IP-ID). Validating a response means
//! recomputing the tag for the claimed flow and comparing.

use std::net::{Ipv4Addr, Ipv6Addr};

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

/// Four 32-bit words of keyed pseudo-random tag.
pub type Validation = [u32; 4];

/// Scan-wide secret key behind every validation tag.
pub struct ValidationKey {
    key: [u8; 32],
}

impl ValidationKey {
    /// Fresh random key for this scan.
    pub fn generate() -> Self {
        Self { key: rand::thread_rng().gen() }
    }

    /// Key derived from a fixed seed, for reproducible runs and tests.
    pub fn from_seed(seed: u64) -> Self {
        let mut key = [0u8; 32];
        StdRng::seed_from_u64(seed).fill_bytes(&mut key);
        Self { key }
    }

    fn tag(&self, tuple: &[u8; 32]) -> Validation {
        let mut seed = self.key;
        for (s, t) in seed.iter_mut().zip(tuple) {
            *s ^= t;
        }
        let mut rng = StdRng::from_seed(seed);
        [rng.next_u32(), rng.next_u32(), rng.next_u32(), rng.next_u32()]
    }

    /// Tag for an IPv4 flow.
    pub fn tag_v4(&self, src: Ipv4Addr, dst: Ipv4Addr, dport: u16) -> Validation {
        let mut tuple = [0u8; 32];
        tuple[0..4].copy_from_slice(&src.octets());
        tuple[4..8].copy_from_slice(&dst.octets());
        tuple[8..10].copy_from_slice(&dport.to_be_bytes());
        self.tag(&tuple)
    }

    /// Tag for an IPv6 flow.
    pub fn tag_v6(&self, src: &Ipv6Addr, dst: &Ipv6Addr, dport: u16) -> Validation {
        let mut tuple = [0u8; 32];
        for (t, (s, d)) in tuple
            .iter_mut()
            .zip(src.octets().into_iter().zip(dst.octets()))
        {
            *t = s ^ d.rotate_left(3);
        }
        tuple[0] ^= dport.to_be_bytes()[0];
        tuple[1] ^= dport.to_be_bytes()[1];
        self.tag(&tuple)
    }
}

/// Contiguous source-port pool with the tag-anchored admission window.
///
/// Probe `i` of a target is sent from
/// `first + (validation[1] + i) mod num_ports`; a response is admitted if
/// its destination port falls in the window of `packet_streams` ports
/// starting at `validation[1] mod num_ports`. The window check needs no
/// record of which probe number actually went out.
#[derive(Debug, Clone, Copy)]
pub struct SourcePortPool {
    first: u16,
    last: u16,
    packet_streams: u16,
}

impl SourcePortPool {
    pub fn new(first: u16, last: u16, packet_streams: u16) -> Self {
        debug_assert!(first <= last);
        debug_assert!(packet_streams > 0);
        Self { first, last, packet_streams }
    }

    pub fn num_ports(&self) -> u32 {
        (self.last - self.first) as u32 + 1
    }

    /// Source port for probe `probe_num` under `validation`.
    pub fn src_port(&self, probe_num: u16, validation: &Validation) -> u16 {
        let offset = (validation[1] as u64 + probe_num as u64) % self.num_ports() as u64;
        self.first + offset as u16
    }

    /// Whether a returning packet's destination port lies in the admission
    /// window for `validation`.
    pub fn contains(&self, port: u16, validation: &Validation) -> bool {
        if port < self.first || port > self.last {
            return false;
        }
        let n = self.num_ports() as u64;
        let to_validate = (port - self.first) as u64;
        let min = validation[1] as u64 % n;
        let max = (validation[1] as u64 + self.packet_streams as u64 - 1) % n;
        if min <= max {
            to_validate >= min && to_validate <= max
        } else {
            // window wraps around the end of the pool
            to_validate >= min || to_validate <= max
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
    const DST: Ipv4Addr = Ipv4Addr::new(1, 2, 3, 4);

    #[test]
    fn test_tag_is_deterministic_for_same_key_and_flow() {
        let key = ValidationKey::from_seed(7);
        assert_eq!(key.tag_v4(SRC, DST, 53), key.tag_v4(SRC, DST, 53));
    }

    #[test]
    fn test_tag_depends_on_key() {
        let a = ValidationKey::from_seed(1);
        let b = ValidationKey::from_seed(2);
        assert_ne!(a.tag_v4(SRC, DST, 53), b.tag_v4(SRC, DST, 53));
    }

    #[test]
    fn test_tag_depends_on_every_tuple_component() {
        let key = ValidationKey::from_seed(7);
        let base = key.tag_v4(SRC, DST, 53);
        assert_ne!(base, key.tag_v4(Ipv4Addr::new(192, 0, 2, 2), DST, 53));
        assert_ne!(base, key.tag_v4(SRC, Ipv4Addr::new(1, 2, 3, 5), 53));
        assert_ne!(base, key.tag_v4(SRC, DST, 54));
    }

    #[test]
    fn test_v6_tag_deterministic_and_direction_sensitive() {
        let key = ValidationKey::from_seed(7);
        let a: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let b: Ipv6Addr = "2001:db8::2".parse().unwrap();
        assert_eq!(key.tag_v6(&a, &b, 53), key.tag_v6(&a, &b, 53));
        assert_ne!(key.tag_v6(&a, &b, 53), key.tag_v6(&b, &a, 53));
    }

    #[test]
    fn test_every_probe_port_is_admitted() {
        // The property the pool exists for: for all probe numbers in
        // [0, packet_streams), the chosen source port passes the check.
        let key = ValidationKey::from_seed(42);
        for streams in [1u16, 2, 4, 8] {
            let pool = SourcePortPool::new(32768, 32768 + 9, streams);
            for dport in [53u16, 80, 443] {
                let v = key.tag_v4(SRC, DST, dport);
                for i in 0..streams {
                    let sport = pool.src_port(i, &v);
                    assert!(
                        pool.contains(sport, &v),
                        "probe {i} port {sport} must be admitted (streams={streams})"
                    );
                }
            }
        }
    }

    #[test]
    fn test_port_outside_configured_range_is_rejected() {
        let pool = SourcePortPool::new(40000, 40009, 2);
        let v = [0u32, 5, 0, 0];
        assert!(!pool.contains(39999, &v));
        assert!(!pool.contains(40010, &v));
    }

    #[test]
    fn test_window_excludes_ports_outside_streams() {
        // validation[1] = 0 anchors the window at the pool start.
        let pool = SourcePortPool::new(40000, 40009, 2);
        let v = [0u32, 0, 0, 0];
        assert!(pool.contains(40000, &v));
        assert!(pool.contains(40001, &v));
        assert!(!pool.contains(40002, &v), "third port is outside a 2-wide window");
    }

    #[test]
    fn test_window_wraps_around_pool_end() {
        // 10 ports, window of 4 anchored at offset 8 wraps to offsets 8,9,0,1.
        let pool = SourcePortPool::new(40000, 40009, 4);
        let v = [0u32, 8, 0, 0];
        assert!(pool.contains(40008, &v));
        assert!(pool.contains(40009, &v));
        assert!(pool.contains(40000, &v));
        assert!(pool.contains(40001, &v));
        assert!(!pool.contains(40002, &v));
        assert!(!pool.contains(40007, &v));
    }
}
