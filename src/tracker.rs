//! Record of a running translator instance.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Bindings of a running clatd instance.
///
/// Purely a value record: the kernel objects it refers to (TUN interface,
/// map entries, tc filters, the daemon itself) are released explicitly by
/// the coordinator's stop path, never by dropping this struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClatdTracker {
    /// IPv6-only uplink interface being translated for.
    pub iface: String,
    /// Interface index of the uplink.
    pub ifindex: u32,
    /// The `v4-` TUN interface carrying the IPv4 leg.
    pub v4_iface: String,
    /// Interface index of the TUN.
    pub v4_ifindex: u32,
    /// Translator's synthetic IPv4 source address (from 192.0.0.0/29).
    pub v4: Ipv4Addr,
    /// Translator's checksum-neutral IPv6 source address.
    pub v6: Ipv6Addr,
    /// NAT64 /96 prefix IPv4 destinations are embedded into.
    pub pfx96: Ipv6Addr,
    /// Pid of the translator daemon.
    pub pid: i32,
    /// Kernel cookie of the write socket, keys the accounting tag.
    pub cookie: u64,
}

impl fmt::Display for ClatdTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "iface: {} ({}), v4iface: {} ({}), v4: {}, v6: {}, pfx96: {}, pid: {}, cookie: {}",
            self.iface,
            self.ifindex,
            self.v4_iface,
            self.v4_ifindex,
            self.v4,
            self.v6,
            self.pfx96,
            self.pid,
            self.cookie
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ClatdTracker {
        ClatdTracker {
            iface: "wlan0".to_string(),
            ifindex: 5,
            v4_iface: "v4-wlan0".to_string(),
            v4_ifindex: 6,
            v4: Ipv4Addr::new(192, 0, 0, 4),
            v6: "2001:db8:0:b11::464".parse().unwrap(),
            pfx96: "64:ff9b::".parse().unwrap(),
            pid: 10483,
            cookie: 27149,
        }
    }

    #[test]
    fn test_display_single_line() {
        let rendered = tracker().to_string();
        assert_eq!(
            rendered,
            "iface: wlan0 (5), v4iface: v4-wlan0 (6), v4: 192.0.0.4, \
             v6: 2001:db8:0:b11::464, pfx96: 64:ff9b::, pid: 10483, cookie: 27149"
        );
        assert!(!rendered.contains('\n'));
    }

    #[test]
    fn test_equality_is_field_wise() {
        let a = tracker();
        let mut b = tracker();
        assert_eq!(a, b);
        b.pid += 1;
        assert_ne!(a, b);
    }
}
