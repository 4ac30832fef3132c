//! Userspace control plane for 464xlat (CLAT) translation.
//!
//! Brings stateless IPv4-over-IPv6 translation up on a host whose uplink is
//! IPv6-only: provisions the `v4-` TUN interface, picks the translator's
//! source addresses, installs the TC/BPF fast path, starts the clatd
//! translator daemon, and tears all of it down again symmetrically.
//!
//! # Architecture
//!
//! ```text
//! IPv4 app --> v4-<iface> (TUN) --> clatd --> <iface> (IPv6-only uplink)
//!                     |                            |
//!                     +--> egress4 classifier      +--> ingress6 classifier
//!                            (fast path, optional, shares the BPF maps)
//! ```
//!
//! The coordinator never rewrites packets itself; it owns the lifecycle of
//! everything the translator needs and guarantees that a failed `start()`
//! leaves no kernel state behind.

pub mod checksum;
pub mod coordinator;
pub mod deps;
pub mod fwmark;
pub mod maps;
pub mod platform;
pub mod tracker;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

// Re-export commonly used types
pub use coordinator::{AID_CLAT, ClatCoordinator, ClatError, PRIO_CLAT};
pub use deps::{Dependencies, InterfaceConfig, NetdClient};
pub use fwmark::{adjust_mtu, fwmark};
pub use platform::{SysDeps, SysNetd};
pub use tracker::ClatdTracker;
