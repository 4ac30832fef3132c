//! Typed access to the pinned CLAT BPF maps.
//!
//! The maps are created and pinned by the BPF loader at boot; this module
//! only opens the pins and reads/writes entries. Key and value layouts must
//! match the eBPF programs exactly.

use aya::Pod;
use aya::maps::{HashMap as AyaHashMap, Map, MapData};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::io::{self, Write};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Pinned map written by the ingress6 classifier (v6 uplink -> v4 TUN).
pub const CLAT_INGRESS6_MAP_PATH: &str = "/sys/fs/bpf/net_shared/map_clatd_clat_ingress6_map";

/// Pinned map written by the egress4 classifier (v4 TUN -> v6 uplink).
pub const CLAT_EGRESS4_MAP_PATH: &str = "/sys/fs/bpf/net_shared/map_clatd_clat_egress4_map";

/// Pinned socket-cookie accounting map shared with the traffic controller.
pub const COOKIE_TAG_MAP_PATH: &str = "/sys/fs/bpf/netd_shared/map_netd_cookie_tag_map";

// BPF_MAP_UPDATE_ELEM flag: fail if the key already exists.
const BPF_NOEXIST: u64 = 1;

/// Key of the ingress6 map: (uplink ifindex, NAT64 prefix, local v6).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClatIngress6Key {
    pub iif: u32,
    pub pfx96: [u8; 16],
    pub local6: [u8; 16],
}

impl ClatIngress6Key {
    pub fn new(iif: u32, pfx96: Ipv6Addr, local6: Ipv6Addr) -> Self {
        Self {
            iif,
            pfx96: pfx96.octets(),
            local6: local6.octets(),
        }
    }

    pub fn pfx96_addr(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.pfx96)
    }

    pub fn local6_addr(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.local6)
    }
}

unsafe impl Pod for ClatIngress6Key {}

/// Value of the ingress6 map. Packet and byte counters are maintained by
/// the classifier.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClatIngress6Value {
    pub oif: u32,
    pub local4: [u8; 4],
    pub packets: u64,
    pub bytes: u64,
}

impl ClatIngress6Value {
    pub fn new(oif: u32, local4: Ipv4Addr) -> Self {
        Self {
            oif,
            local4: local4.octets(),
            packets: 0,
            bytes: 0,
        }
    }

    pub fn local4_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.local4)
    }
}

unsafe impl Pod for ClatIngress6Value {}

/// Key of the egress4 map: (TUN ifindex, local v4).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClatEgress4Key {
    pub iif: u32,
    pub local4: [u8; 4],
}

impl ClatEgress4Key {
    pub fn new(iif: u32, local4: Ipv4Addr) -> Self {
        Self {
            iif,
            local4: local4.octets(),
        }
    }

    pub fn local4_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.local4)
    }
}

unsafe impl Pod for ClatEgress4Key {}

/// Value of the egress4 map.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClatEgress4Value {
    pub oif: u32,
    pub local6: [u8; 16],
    pub pfx96: [u8; 16],
    /// 1 when the uplink uses an Ethernet L2 header, 0 for raw IP.
    pub oif_is_ethernet: u16,
    _pad: [u8; 2],
    pub packets: u64,
    pub bytes: u64,
}

impl ClatEgress4Value {
    pub fn new(oif: u32, local6: Ipv6Addr, pfx96: Ipv6Addr, oif_is_ethernet: bool) -> Self {
        Self {
            oif,
            local6: local6.octets(),
            pfx96: pfx96.octets(),
            oif_is_ethernet: oif_is_ethernet as u16,
            _pad: [0; 2],
            packets: 0,
            bytes: 0,
        }
    }

    pub fn local6_addr(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.local6)
    }

    pub fn pfx96_addr(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.pfx96)
    }
}

unsafe impl Pod for ClatEgress4Value {}

/// Key of the cookie tag map: a kernel socket cookie.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CookieTagMapKey {
    pub cookie: u64,
}

impl CookieTagMapKey {
    pub fn new(cookie: u64) -> Self {
        Self { cookie }
    }
}

unsafe impl Pod for CookieTagMapKey {}

/// Value of the cookie tag map: the (uid, tag) traffic is accounted under.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CookieTagMapValue {
    pub uid: u32,
    pub tag: u32,
}

impl CookieTagMapValue {
    pub fn new(uid: u32, tag: u32) -> Self {
        Self { uid, tag }
    }
}

unsafe impl Pod for CookieTagMapValue {}

fn bytes_of<T: Pod>(value: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>()) }
}

/// A CLAT-owned view of a BPF hash map.
pub trait BpfMap<K: Pod, V: Pod> {
    /// Insert a new entry. Fails if the key is already present: values carry
    /// in-kernel counters, so an existing entry must never be overwritten.
    fn insert(&mut self, key: &K, value: &V) -> io::Result<()>;

    /// Delete an entry. Fails if the key is absent.
    fn delete(&mut self, key: &K) -> io::Result<()>;

    /// Visit every entry.
    fn for_each(&self, f: &mut dyn FnMut(&K, &V)) -> io::Result<()>;

    fn is_empty(&self) -> io::Result<bool> {
        let mut empty = true;
        self.for_each(&mut |_, _| empty = false)?;
        Ok(empty)
    }

    /// Write one `<base64 key>,<base64 value>` line per entry, for
    /// regression tooling.
    fn dump_raw(&self, w: &mut dyn Write) -> io::Result<()> {
        let mut lines = Vec::new();
        self.for_each(&mut |k, v| {
            lines.push(format!(
                "{},{}",
                STANDARD.encode(bytes_of(k)),
                STANDARD.encode(bytes_of(v))
            ));
        })?;
        for line in lines {
            writeln!(w, "{line}")?;
        }
        Ok(())
    }
}

/// A BPF hash map opened from its pin under /sys/fs/bpf.
pub struct PinnedMap<K: Pod, V: Pod> {
    inner: AyaHashMap<MapData, K, V>,
}

impl<K: Pod, V: Pod> PinnedMap<K, V> {
    pub fn open(path: &str) -> io::Result<Self> {
        let data = MapData::from_pin(path).map_err(io::Error::other)?;
        let inner = AyaHashMap::try_from(Map::HashMap(data)).map_err(io::Error::other)?;
        Ok(Self { inner })
    }
}

impl<K: Pod, V: Pod> BpfMap<K, V> for PinnedMap<K, V> {
    fn insert(&mut self, key: &K, value: &V) -> io::Result<()> {
        self.inner
            .insert(key, value, BPF_NOEXIST)
            .map_err(io::Error::other)
    }

    fn delete(&mut self, key: &K) -> io::Result<()> {
        self.inner.remove(key).map_err(io::Error::other)
    }

    fn for_each(&self, f: &mut dyn FnMut(&K, &V)) -> io::Result<()> {
        for entry in self.inner.iter() {
            let (key, value) = entry.map_err(io::Error::other)?;
            f(&key, &value);
        }
        Ok(())
    }
}
