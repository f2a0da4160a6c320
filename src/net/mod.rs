//! Raw packet construction and inspection primitives.
//!
//! Pure byte-level code with no I/O: header writers and read-side slice
//! views (`headers`), one's-complement checksums (`checksum`), TCP option
//! stacks for OS fingerprint mimicry (`tcp_options`), and the shared ICMP
//! error helper (`icmp`).

pub mod checksum;
pub mod headers;
pub mod icmp;
pub mod tcp_options;

pub use headers::{
    Icmp6Slice, IcmpSlice, Ipv4Header, Ipv4Slice, Ipv6Header, Ipv6Slice, UdpHeader, UdpSlice,
};
