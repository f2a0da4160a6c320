//! netprobe — the core of a high-rate, single-packet network scanner.
//!
//! The crate covers the send pipeline (rate-paced, multi-threaded batch
//! production), the probe-module framework with DNS and IPv6-UDP modules,
//! raw packet construction primitives, and the stateless validation-tag
//! scheme that authenticates responses without per-flow state. Address
//! iteration, pcap I/O, output sinks, and the CLI are external
//! collaborators consumed through the traits in [`target`], [`send`], and
//! [`output`].

pub mod config;
pub mod error;
pub mod net;
pub mod output;
pub mod probe;
pub mod send;
pub mod target;
pub mod validate;

pub use config::{ScanConfig, MAX_PACKET_SIZE};
pub use error::{Result, ScanError};
pub use output::{FieldDef, FieldKind, FieldSet, FieldVal, OutputType};
pub use probe::{
    full_field_catalog, module_by_name, module_names, FlowAddrs, ProbeModule, ProbeTarget,
    ThreadCtx,
};
pub use send::{
    plan_scan, run_senders, send_run, PacketBatch, PacketSender, PacketSlot, SendControl,
    ShardState,
};
pub use target::{Blocklist, Ipv6TargetFile, Target, TargetProvider};
pub use validate::{SourcePortPool, Validation, ValidationKey};

/// Install the tracing subscriber and a panic hook that logs before the
/// default handler runs. Call once from the binary entry point.
pub fn init_logging() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!("PANIC in netprobe: {info}");
        default_hook(info);
    }));

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "netprobe=info".into()),
        )
        .init();
}
