//! Platform dependency facade.
//!
//! Every OS-visible side effect the coordinator performs goes through the
//! [`Dependencies`] trait, so tests can record the call sequence and inject
//! a fault at any step of the startup sequence.

use crate::maps::{
    BpfMap, ClatEgress4Key, ClatEgress4Value, ClatIngress6Key, ClatIngress6Value, CookieTagMapKey,
    CookieTagMapValue,
};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

/// Interface index reported for interfaces that do not exist.
pub const INVALID_IFINDEX: u32 = 0;

/// Link state flag understood by [`NetdClient::interface_set_cfg`].
pub const IF_STATE_UP: &str = "up";

/// Ethertype of IPv4, as used for tc filter protocol matching.
pub const ETH_P_IP: u16 = 0x0800;

/// Ethertype of IPv6.
pub const ETH_P_IPV6: u16 = 0x86dd;

pub type Ingress6Map = Box<dyn BpfMap<ClatIngress6Key, ClatIngress6Value>>;
pub type Egress4Map = Box<dyn BpfMap<ClatEgress4Key, ClatEgress4Value>>;
pub type CookieTagMap = Box<dyn BpfMap<CookieTagMapKey, CookieTagMapValue>>;

/// Interface attributes applied in one call, mirroring the configuration
/// daemon's parcel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub if_name: String,
    pub ipv4_addr: Ipv4Addr,
    pub prefix_length: u8,
    pub hw_addr: String,
    pub flags: Vec<String>,
}

/// Interface attribute surface of the configuration daemon.
pub trait NetdClient {
    fn interface_set_enable_ipv6(&self, if_name: &str, enabled: bool) -> io::Result<()>;

    fn interface_set_mtu(&self, if_name: &str, mtu: u32) -> io::Result<()>;

    fn interface_set_cfg(&self, cfg: &InterfaceConfig) -> io::Result<()>;
}

/// The OS primitives the coordinator composes.
///
/// Implementations are expected to be thin wrappers with no policy of their
/// own; everything that can be pure lives in the coordinator.
pub trait Dependencies {
    /// Handle to the configuration daemon, fetched once at construction.
    fn netd(&self) -> Arc<dyn NetdClient>;

    /// Take ownership of a raw descriptor; the descriptor is closed when the
    /// returned handle drops.
    fn adopt_fd(&self, fd: RawFd) -> OwnedFd {
        unsafe { OwnedFd::from_raw_fd(fd) }
    }

    /// Interface index for `name`, or [`INVALID_IFINDEX`] if it does not
    /// exist.
    fn interface_index(&self, name: &str) -> u32;

    /// Create a TUN interface and return its control descriptor. Fails if an
    /// interface with that name already exists.
    fn create_tun_interface(&self, name: &str) -> io::Result<RawFd>;

    /// First IPv4 address in `seed/prefix_len` not configured anywhere on
    /// the host.
    fn select_ipv4_address(&self, seed: Ipv4Addr, prefix_len: u8) -> io::Result<Ipv4Addr>;

    /// A checksum-neutral IPv6 source address for the translator on `iface`.
    fn generate_ipv6_address(
        &self,
        iface: &str,
        v4: Ipv4Addr,
        pfx96: Ipv6Addr,
        fwmark: u32,
    ) -> io::Result<Ipv6Addr>;

    /// Probe the path MTU toward `target` synthesized into `pfx96`.
    fn detect_mtu(&self, pfx96: Ipv6Addr, target: Ipv4Addr, fwmark: u32) -> io::Result<u32>;

    /// AF_PACKET socket the translator reads inbound IPv6 from.
    fn open_packet_socket(&self) -> io::Result<RawFd>;

    /// AF_INET6 raw socket with SO_MARK set, the translator writes
    /// translated IPv6 through.
    fn open_raw_socket6(&self, fwmark: u32) -> io::Result<RawFd>;

    /// Join `v6` as an anycast address on `ifindex`.
    fn add_anycast_setsockopt(
        &self,
        sock: BorrowedFd<'_>,
        v6: Ipv6Addr,
        ifindex: u32,
    ) -> io::Result<()>;

    /// Bind the packet socket to `ifindex` and restrict it to frames
    /// addressed to `v6`.
    fn configure_packet_socket(
        &self,
        sock: BorrowedFd<'_>,
        v6: Ipv6Addr,
        ifindex: u32,
    ) -> io::Result<()>;

    /// Spawn the translator daemon. The daemon duplicates all three
    /// descriptors; the caller's copies can be closed after this returns.
    #[allow(clippy::too_many_arguments)]
    fn start_clatd(
        &self,
        tun_fd: BorrowedFd<'_>,
        read_fd: BorrowedFd<'_>,
        write_fd: BorrowedFd<'_>,
        iface: &str,
        pfx96: Ipv6Addr,
        v4: Ipv4Addr,
        v6: Ipv6Addr,
    ) -> io::Result<i32>;

    /// Terminate a previously started translator daemon.
    fn stop_clatd(&self, pid: i32) -> io::Result<()>;

    /// Kernel cookie of a socket, stable for the socket's lifetime.
    fn get_socket_cookie(&self, sock: BorrowedFd<'_>) -> io::Result<u64>;

    /// Whether `iface` uses an Ethernet L2 header (as opposed to raw IP).
    fn is_ethernet(&self, iface: &str) -> io::Result<bool>;

    /// Add a clsact qdisc to `ifindex`.
    fn tc_qdisc_add_clsact(&self, ifindex: u32) -> io::Result<()>;

    /// Attach a pinned BPF classifier in direct-action mode.
    fn tc_filter_add_bpf(
        &self,
        ifindex: u32,
        ingress: bool,
        prio: u16,
        proto: u16,
        prog_path: &str,
    ) -> io::Result<()>;

    /// Detach a tc filter.
    fn tc_filter_del(&self, ifindex: u32, ingress: bool, prio: u16, proto: u16) -> io::Result<()>;

    /// The ingress6 map, or `None` when the pin is unavailable.
    fn open_ingress6_map(&self) -> Option<Ingress6Map>;

    /// The egress4 map, or `None` when the pin is unavailable.
    fn open_egress4_map(&self) -> Option<Egress4Map>;

    /// The cookie tag map, or `None` when the pin is unavailable.
    fn open_cookie_tag_map(&self) -> Option<CookieTagMap>;
}
