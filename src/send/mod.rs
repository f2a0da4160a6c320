//! The send pipeline: per-thread batch producer driving a probe module.
//!
//! Each send thread owns one shard of the target space, one reusable packet
//! batch, and one rate regulator. A process-wide mutex serializes only
//! thread startup (batch preparation and module thread-init); after that
//! threads share nothing mutable but the rate target. Frames flow from the
//! probe module's `make_packet` into fixed-capacity batches and on to a
//! batched transmit primitive supplied by the caller.

pub mod rate;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::config::{ScanConfig, MAX_PACKET_SIZE};
use crate::error::{Result, ScanError};
use crate::probe::{FlowAddrs, ProbeModule, ProbeTarget, ThreadCtx};
use crate::target::{Blocklist, IpBitmap, Ipv6TargetFile, Target, TargetProvider};
use crate::validate::ValidationKey;

use rate::{RateControl, RateRegulator};

/// One reusable packet slot: a frame buffer and the valid length within it.
#[derive(Clone)]
pub struct PacketSlot {
    pub buf: [u8; MAX_PACKET_SIZE],
    pub len: u32,
}

impl PacketSlot {
    const EMPTY: Self = Self { buf: [0; MAX_PACKET_SIZE], len: 0 };

    pub fn frame(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }
}

/// Fixed-capacity frame batch, allocated once per send thread and reused
/// for every flush. The slots live in one contiguous allocation.
pub struct PacketBatch {
    slots: Box<[PacketSlot]>,
    len: usize,
}

impl PacketBatch {
    pub fn new(capacity: usize) -> Self {
        Self { slots: vec![PacketSlot::EMPTY; capacity.max(1)].into_boxed_slice(), len: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// The slot the next [`commit`](Self::commit) will make live.
    pub fn next_slot(&mut self) -> &mut PacketSlot {
        &mut self.slots[self.len]
    }

    pub fn commit(&mut self) {
        debug_assert!(self.len < self.capacity());
        self.len += 1;
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Committed slots, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &PacketSlot> {
        self.slots[..self.len].iter()
    }

    /// Every slot, for one-time header preparation.
    pub fn all_slots_mut(&mut self) -> &mut [PacketSlot] {
        &mut self.slots
    }
}

/// Batched transmit primitive. `Ok(n)` is the number of frames the OS
/// accepted (internal retries included); `Err` means none were sent.
pub trait PacketSender {
    fn send_batch(&mut self, batch: &PacketBatch, attempts: u32) -> io::Result<usize>;
}

/// Shared coordination between the send threads and the rest of the
/// process: cooperative completion, rate target, startup serialization.
pub struct SendControl {
    complete: AtomicBool,
    pub rate: RateControl,
    startup: Mutex<()>,
}

impl SendControl {
    pub fn new(rate_pps: u64) -> Self {
        Self {
            complete: AtomicBool::new(false),
            rate: RateControl::new(rate_pps),
            startup: Mutex::new(()),
        }
    }

    /// Ask every send thread to flush and stop at its next iteration.
    pub fn request_stop(&self) {
        self.complete.store(true, Ordering::Relaxed);
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Relaxed)
    }
}

/// Per-shard send accounting.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShardState {
    pub packets_sent: u64,
    pub packets_failed: u64,
    pub targets_scanned: u64,
}

/// Pre-flight checks and rate resolution shared by all senders.
///
/// Fails when the shard layout cannot produce disjoint work, when no source
/// MAC is available, or when rate and bandwidth are both set.
pub fn plan_scan(
    cfg: &ScanConfig,
    module: &dyn ProbeModule,
    blocklist: &dyn Blocklist,
) -> Result<u64> {
    cfg.validate()?;
    let num_subshards = cfg.senders as u64 * cfg.total_shards as u64;
    let allowed_probes =
        blocklist.count_allowed().saturating_mul(cfg.dest_ports.len() as u64);
    if num_subshards > allowed_probes {
        return Err(ScanError::Config("senders * shards exceeds allowed probes".into()));
    }
    if let Some(max_targets) = cfg.max_targets {
        if num_subshards > max_targets {
            return Err(ScanError::Config("senders * shards exceeds max targets".into()));
        }
    }
    if cfg.hw_mac.is_none() {
        return Err(ScanError::Config(
            "no source MAC address available; set one explicitly or run with raw socket privileges"
                .into(),
        ));
    }
    if cfg.gw_mac.is_none() {
        return Err(ScanError::Config("no gateway MAC address available".into()));
    }
    let rate = cfg.effective_rate(module.max_packet_length())?;
    if cfg.dryrun {
        tracing::info!("dryrun mode, packets will be printed instead of sent");
    }
    tracing::debug!(rate_pps = rate, "send rate resolved");
    Ok(rate)
}

enum CurrentTarget {
    V4(Target),
    V6(std::net::Ipv6Addr),
}

/// Pull the next admissible IPv4 target, skipping addresses outside the
/// list-of-IPs bitmap when one is configured.
fn next_listed_target(
    targets: &mut dyn TargetProvider,
    bitmap: Option<&IpBitmap>,
    mut current: Option<Target>,
) -> Option<Target> {
    if let Some(bitmap) = bitmap {
        while let Some(t) = current {
            if bitmap.check(t.ip) {
                break;
            }
            current = targets.next_target();
        }
    }
    current
}

fn flush_batch(
    batch: &mut PacketBatch,
    cfg: &ScanConfig,
    module: &dyn ProbeModule,
    sender: &mut dyn PacketSender,
    attempts: u32,
    state: &mut ShardState,
) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    if cfg.dryrun {
        // serialize multi-line dumps against other threads
        let stdout = io::stdout();
        let mut lock = stdout.lock();
        for slot in batch.iter() {
            module.print_packet(&mut lock, slot.frame())?;
        }
    } else {
        match sender.send_batch(batch, attempts) {
            Ok(sent) => {
                state.packets_failed += (batch.len() - sent.min(batch.len())) as u64;
            }
            Err(e) => {
                tracing::error!("could not send any batch packets: {e}");
                state.packets_failed += batch.len() as u64;
            }
        }
    }
    batch.clear();
    Ok(())
}

/// One send thread: pace, build, batch, transmit, until the shard is
/// exhausted or a stop condition fires. Returns the shard accounting.
pub fn send_run(
    cfg: &ScanConfig,
    module: &dyn ProbeModule,
    key: &ValidationKey,
    control: &SendControl,
    targets: &mut dyn TargetProvider,
    sender: &mut dyn PacketSender,
    ip_bitmap: Option<&IpBitmap>,
    thread_id: u32,
) -> Result<ShardState> {
    let hw_mac = cfg
        .hw_mac
        .ok_or_else(|| ScanError::Config("no source MAC address available".into()))?;
    let gw_mac = cfg
        .gw_mac
        .ok_or_else(|| ScanError::Config("no gateway MAC address available".into()))?;

    let mut batch;
    let mut ctx;
    {
        // one thread at a time through module thread-init and batch prep
        let _startup = control.startup.lock().unwrap_or_else(|e| e.into_inner());
        ctx = ThreadCtx::new(cfg, thread_id);
        batch = PacketBatch::new(cfg.batch as usize);
        for slot in batch.all_slots_mut() {
            module.prepare_packet(&mut slot.buf, &hw_mac, &gw_mac, &mut ctx)?;
        }
    }
    tracing::debug!(thread_id, mac = %crate::config::format_mac(&hw_mac), "send thread started");

    let mut regulator = RateRegulator::new(&control.rate, cfg);
    let mut state = ShardState::default();
    let attempts = cfg.retries + 1;
    let start = Instant::now();

    let mut v6_targets = match &cfg.ipv6_target_file {
        Some(path) => Some(Ipv6TargetFile::open(path)?),
        None => None,
    };
    let ipv6_src = cfg.ipv6_source;
    let v6_port = cfg.dest_ports.first().copied().unwrap_or(0);

    let mut current = match &mut v6_targets {
        Some(file) => file.next_addr().map(CurrentTarget::V6),
        None => {
            let first = targets.current();
            next_listed_target(targets, ip_bitmap, first).map(CurrentTarget::V4)
        }
    };

    loop {
        regulator.pace();

        if control.is_complete() {
            break;
        }
        if let Some(max) = cfg.max_runtime {
            if start.elapsed() >= max {
                break;
            }
        }
        if let Some(max) = cfg.max_targets {
            if state.targets_scanned >= max {
                tracing::debug!(thread_id, max, "send thread finished, max targets reached");
                break;
            }
        }
        if let Some(max) = cfg.max_packets {
            if state.packets_sent >= max {
                tracing::debug!(thread_id, max, "send thread finished, max packets reached");
                break;
            }
        }
        let Some(target) = &current else {
            tracing::debug!(thread_id, "send thread finished, shard depleted");
            break;
        };

        for probe_num in 0..cfg.packet_streams {
            let (addrs, dport, validation) = match target {
                CurrentTarget::V4(t) => {
                    let src = cfg.source_ip_for(t.ip, probe_num);
                    (
                        FlowAddrs::V4 { src, dst: t.ip },
                        t.port,
                        key.tag_v4(src, t.ip, t.port),
                    )
                }
                CurrentTarget::V6(dst) => {
                    let src = ipv6_src.ok_or_else(|| {
                        ScanError::Config("IPv6 scanning requires an IPv6 source address".into())
                    })?;
                    (
                        FlowAddrs::V6 { src, dst: *dst },
                        v6_port,
                        key.tag_v6(&src, dst, v6_port),
                    )
                }
            };
            let probe_target = ProbeTarget {
                addrs,
                dport,
                ttl: cfg.probe_ttl,
                probe_num,
                ip_id: (validation[3] & 0xFFFF) as u16,
                validation,
            };
            let slot = batch.next_slot();
            let len = module.make_packet(&mut slot.buf, &probe_target, &mut ctx)?;
            if len > MAX_PACKET_SIZE {
                return Err(ScanError::PayloadTooLarge { len, limit: MAX_PACKET_SIZE });
            }
            slot.len = len as u32;
            batch.commit();
            regulator.note_sent(1);
            if batch.is_full() {
                flush_batch(&mut batch, cfg, module, sender, attempts, &mut state)?;
            }
            state.packets_sent += 1;
        }
        state.targets_scanned += 1;

        current = match &mut v6_targets {
            Some(file) => file.next_addr().map(CurrentTarget::V6),
            None => {
                let next = targets.next_target();
                next_listed_target(targets, ip_bitmap, next).map(CurrentTarget::V4)
            }
        };
    }

    flush_batch(&mut batch, cfg, module, sender, attempts, &mut state)?;
    tracing::debug!(thread_id, "send thread cleanly finished");
    Ok(state)
}

/// Spawn `cfg.senders` send threads, each with its own target provider and
/// transmit primitive, and collect per-shard accounting.
pub fn run_senders<T, S>(
    cfg: &ScanConfig,
    module: &dyn ProbeModule,
    key: &ValidationKey,
    control: &SendControl,
    ip_bitmap: Option<&IpBitmap>,
    make_targets: impl Fn(u32) -> T + Sync,
    make_sender: impl Fn(u32) -> io::Result<S> + Sync,
) -> Result<Vec<ShardState>>
where
    T: TargetProvider,
    S: PacketSender,
{
    // an explicit bitmap wins; otherwise load the configured list-of-IPs
    let loaded_bitmap = match (ip_bitmap, &cfg.list_of_ips_file) {
        (None, Some(path)) => Some(IpBitmap::from_file(path)?),
        _ => None,
    };
    let ip_bitmap = ip_bitmap.or(loaded_bitmap.as_ref());

    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(cfg.senders as usize);
        for thread_id in 0..cfg.senders {
            let make_targets = &make_targets;
            let make_sender = &make_sender;
            let handle = std::thread::Builder::new()
                .name(format!("send-{thread_id}"))
                .spawn_scoped(scope, move || -> Result<ShardState> {
                    let mut targets = make_targets(thread_id);
                    let mut sender = make_sender(thread_id)?;
                    send_run(
                        cfg, module, key, control, &mut targets, &mut sender, ip_bitmap,
                        thread_id,
                    )
                })
                .expect("failed to spawn send thread");
            handles.push(handle);
        }
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .map_err(|_| ScanError::Config("send thread panicked".into()))?
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::headers::{Ipv4Slice, Ipv6Slice, UdpSlice};
    use crate::probe::module_by_name;
    use crate::target::{AllowAll, StaticTargets};
    use std::io::Write;
    use std::net::Ipv4Addr;

    /// Sender that records every flushed frame.
    #[derive(Default)]
    struct CapturingSender {
        frames: Vec<Vec<u8>>,
        /// Pretend this many frames of each batch failed to send.
        fail_suffix: usize,
        /// Fail entire batches outright.
        fail_all: bool,
    }

    impl PacketSender for CapturingSender {
        fn send_batch(&mut self, batch: &PacketBatch, _attempts: u32) -> io::Result<usize> {
            if self.fail_all {
                return Err(io::Error::new(io::ErrorKind::Other, "wire fell out"));
            }
            for slot in batch.iter() {
                self.frames.push(slot.frame().to_vec());
            }
            Ok(batch.len() - self.fail_suffix.min(batch.len()))
        }
    }

    fn dns_cfg() -> ScanConfig {
        ScanConfig {
            dest_ports: vec![53],
            packet_streams: 2,
            batch: 4,
            seed: Some(11),
            ..Default::default()
        }
    }

    fn targets3() -> Vec<Target> {
        vec![
            Target { ip: Ipv4Addr::new(10, 0, 0, 1), port: 53 },
            Target { ip: Ipv4Addr::new(10, 0, 0, 2), port: 53 },
            Target { ip: Ipv4Addr::new(10, 0, 0, 3), port: 53 },
        ]
    }

    fn run(
        cfg: &ScanConfig,
        targets: Vec<Target>,
        sender: &mut CapturingSender,
        bitmap: Option<&IpBitmap>,
    ) -> ShardState {
        let module = module_by_name("dns", cfg).unwrap();
        let key = ValidationKey::from_seed(5);
        let control = SendControl::new(0);
        let mut provider = StaticTargets::new(targets);
        send_run(cfg, module.as_ref(), &key, &control, &mut provider, sender, bitmap, 0)
            .expect("send_run should succeed")
    }

    #[test]
    fn test_batch_fill_and_clear() {
        let mut batch = PacketBatch::new(3);
        assert_eq!(batch.capacity(), 3);
        assert!(batch.is_empty());
        for i in 0..3 {
            let slot = batch.next_slot();
            slot.buf[0] = i as u8;
            slot.len = 1;
            batch.commit();
        }
        assert!(batch.is_full());
        let first: Vec<u8> = batch.iter().map(|s| s.buf[0]).collect();
        assert_eq!(first, vec![0, 1, 2]);
        batch.clear();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_send_run_emits_streams_per_target_in_iterator_order() {
        let cfg = dns_cfg();
        let mut sender = CapturingSender::default();
        let state = run(&cfg, targets3(), &mut sender, None);

        assert_eq!(state.targets_scanned, 3);
        assert_eq!(state.packets_sent, 6, "2 streams x 3 targets");
        assert_eq!(state.packets_failed, 0);
        assert_eq!(sender.frames.len(), 6, "trailing partial batch must be flushed");

        let dsts: Vec<Ipv4Addr> = sender
            .frames
            .iter()
            .map(|f| Ipv4Slice::from_eth_frame(f).unwrap().dst())
            .collect();
        let expected: Vec<Ipv4Addr> = targets3()
            .iter()
            .flat_map(|t| std::iter::repeat(t.ip).take(2))
            .collect();
        assert_eq!(dsts, expected, "within a thread packets follow iterator order");
    }

    #[test]
    fn test_send_run_frames_validate_against_their_own_tags() {
        let cfg = dns_cfg();
        let key = ValidationKey::from_seed(5);
        let mut sender = CapturingSender::default();
        run(&cfg, targets3(), &mut sender, None);
        let module = module_by_name("dns", &cfg).unwrap();

        for frame in &sender.frames {
            let ip = Ipv4Slice::from_eth_frame(frame).unwrap();
            let udp = UdpSlice::parse(ip.payload()).unwrap();
            let v = key.tag_v4(ip.src(), ip.dst(), udp.dport());
            // reflect the probe back as a response and check the sport window
            let mut echo = frame[14..].to_vec();
            echo[12..16].copy_from_slice(&ip.dst().octets());
            echo[16..20].copy_from_slice(&ip.src().octets());
            let (sp, dp) = (udp.sport(), udp.dport());
            echo[20..22].copy_from_slice(&dp.to_be_bytes());
            echo[22..24].copy_from_slice(&sp.to_be_bytes());
            assert!(
                module.validate_packet(&echo, &v, &AllowAll),
                "an echoed probe must validate"
            );
        }
    }

    #[test]
    fn test_max_targets_stops_early() {
        let cfg = ScanConfig { max_targets: Some(1), ..dns_cfg() };
        let mut sender = CapturingSender::default();
        let state = run(&cfg, targets3(), &mut sender, None);
        assert_eq!(state.targets_scanned, 1);
        assert_eq!(state.packets_sent, 2);
    }

    #[test]
    fn test_max_packets_stops_early() {
        let cfg = ScanConfig { max_packets: Some(2), ..dns_cfg() };
        let mut sender = CapturingSender::default();
        let state = run(&cfg, targets3(), &mut sender, None);
        assert_eq!(state.packets_sent, 2, "stop check happens between targets");
    }

    #[test]
    fn test_stop_request_flushes_and_exits() {
        let cfg = dns_cfg();
        let module = module_by_name("dns", &cfg).unwrap();
        let key = ValidationKey::from_seed(5);
        let control = SendControl::new(0);
        control.request_stop();
        let mut provider = StaticTargets::new(targets3());
        let mut sender = CapturingSender::default();
        let state = send_run(
            &cfg, module.as_ref(), &key, &control, &mut provider, &mut sender, None, 0,
        )
        .unwrap();
        assert_eq!(state.packets_sent, 0, "stop before the first iteration sends nothing");
    }

    #[test]
    fn test_partial_batch_failure_is_accounted() {
        let cfg = ScanConfig { batch: 6, ..dns_cfg() };
        let mut sender = CapturingSender { fail_suffix: 2, ..Default::default() };
        let state = run(&cfg, targets3(), &mut sender, None);
        assert_eq!(state.packets_sent, 6);
        assert_eq!(state.packets_failed, 2, "the unsent suffix is failed, not retried");
    }

    #[test]
    fn test_total_batch_failure_is_accounted() {
        let cfg = ScanConfig { batch: 6, ..dns_cfg() };
        let mut sender = CapturingSender { fail_all: true, ..Default::default() };
        let state = run(&cfg, targets3(), &mut sender, None);
        assert_eq!(state.packets_failed, 6);
    }

    #[test]
    fn test_bitmap_gates_targets() {
        let cfg = dns_cfg();
        let mut bitmap = IpBitmap::new();
        bitmap.set(Ipv4Addr::new(10, 0, 0, 2));
        let mut sender = CapturingSender::default();
        let state = run(&cfg, targets3(), &mut sender, Some(&bitmap));

        assert_eq!(state.targets_scanned, 1, "only the listed address is probed");
        let dsts: Vec<Ipv4Addr> = sender
            .frames
            .iter()
            .map(|f| Ipv4Slice::from_eth_frame(f).unwrap().dst())
            .collect();
        assert!(dsts.iter().all(|d| *d == Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[test]
    fn test_ipv6_send_run_streams_target_file() {
        let path = std::env::temp_dir().join("netprobe_send_v6_test.txt");
        {
            let mut f = std::fs::File::create(&path).unwrap();
            writeln!(f, "2001:db8::10").unwrap();
            writeln!(f, "2001:db8::11").unwrap();
        }
        let cfg = ScanConfig {
            probe_args: Some("text:PING".into()),
            ipv6_source: Some("2001:db8::1".parse().unwrap()),
            ipv6_target_file: Some(path.clone()),
            dest_ports: vec![7],
            packet_streams: 1,
            batch: 8,
            seed: Some(3),
            ..Default::default()
        };
        let module = module_by_name("ipv6_udp", &cfg).unwrap();
        let key = ValidationKey::from_seed(5);
        let control = SendControl::new(0);
        let mut provider = StaticTargets::new(Vec::new());
        let mut sender = CapturingSender::default();
        let state = send_run(
            &cfg, module.as_ref(), &key, &control, &mut provider, &mut sender, None, 0,
        )
        .unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(state.targets_scanned, 2);
        assert_eq!(sender.frames.len(), 2);
        let dsts: Vec<_> = sender
            .frames
            .iter()
            .map(|f| Ipv6Slice::from_eth_frame(f).unwrap().dst().to_string())
            .collect();
        assert_eq!(dsts, vec!["2001:db8::10", "2001:db8::11"]);
    }

    #[test]
    fn test_run_senders_loads_configured_ip_list() {
        let path = std::env::temp_dir().join("netprobe_send_iplist_test.txt");
        std::fs::write(&path, "10.0.0.3\n").unwrap();
        let cfg = ScanConfig { list_of_ips_file: Some(path.clone()), ..dns_cfg() };
        let module = module_by_name("dns", &cfg).unwrap();
        let key = ValidationKey::from_seed(5);
        let control = SendControl::new(0);
        let states = run_senders(
            &cfg,
            module.as_ref(),
            &key,
            &control,
            None,
            |_| StaticTargets::new(targets3()),
            |_| Ok(CapturingSender::default()),
        )
        .unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(states[0].targets_scanned, 1, "only the listed address is probed");
    }

    #[test]
    fn test_plan_scan_rejects_oversharded_scans() {
        struct TinyBlocklist;
        impl Blocklist for TinyBlocklist {
            fn is_allowed(&self, _ip: Ipv4Addr) -> bool {
                true
            }
            fn count_allowed(&self) -> u64 {
                1
            }
        }
        let cfg = ScanConfig { senders: 4, ..dns_cfg() };
        let module = module_by_name("dns", &cfg).unwrap();
        let err = plan_scan(&cfg, module.as_ref(), &TinyBlocklist).unwrap_err();
        assert!(err.to_string().contains("allowed probes"));
    }

    #[test]
    fn test_plan_scan_requires_macs() {
        let cfg = ScanConfig { hw_mac: None, ..dns_cfg() };
        let module = module_by_name("dns", &cfg).unwrap();
        assert!(plan_scan(&cfg, module.as_ref(), &AllowAll).is_err());
    }

    #[test]
    fn test_plan_scan_resolves_default_rate() {
        let cfg = dns_cfg();
        let module = module_by_name("dns", &cfg).unwrap();
        let rate = plan_scan(&cfg, module.as_ref(), &AllowAll).unwrap();
        assert_eq!(rate, crate::config::DEFAULT_RATE_PPS);
    }

    #[test]
    fn test_run_senders_collects_all_shard_states() {
        let cfg = ScanConfig { senders: 2, ..dns_cfg() };
        let module = module_by_name("dns", &cfg).unwrap();
        let key = ValidationKey::from_seed(5);
        let control = SendControl::new(0);
        let states = run_senders(
            &cfg,
            module.as_ref(),
            &key,
            &control,
            None,
            |thread_id| {
                // each thread gets its own disjoint shard
                StaticTargets::new(vec![Target {
                    ip: Ipv4Addr::new(10, 0, 1, thread_id as u8 + 1),
                    port: 53,
                }])
            },
            |_| Ok(CapturingSender::default()),
        )
        .unwrap();
        assert_eq!(states.len(), 2);
        for state in states {
            assert_eq!(state.targets_scanned, 1);
            assert_eq!(state.packets_sent, 2);
        }
    }
}
