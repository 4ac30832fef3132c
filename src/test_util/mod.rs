//! In-memory fakes for exercising the coordinator without privileges.
//!
//! [`FakeDeps`] records every facade call in order and can be told to fail
//! any single operation, which is how the unwind paths are tested. The fake
//! maps are shared handles: a clone kept by the test observes the entries
//! the coordinator created.

use crate::deps::{
    CookieTagMap, Dependencies, Egress4Map, INVALID_IFINDEX, Ingress6Map, InterfaceConfig,
    NetdClient,
};
use crate::maps::{
    BpfMap, ClatEgress4Key, ClatEgress4Value, ClatIngress6Key, ClatIngress6Value, CookieTagMapKey,
    CookieTagMapValue,
};
use aya::Pod;
use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, BorrowedFd, IntoRawFd, RawFd};
use std::sync::{Arc, Mutex};

/// Interface index the fake reports for the uplink.
pub const UPLINK_IFINDEX: u32 = 42;

/// Interface index the fake reports for the `v4-` TUN.
pub const TUN_IFINDEX: u32 = 43;

/// Pid the fake "spawns" clatd with.
pub const FAKE_CLATD_PID: i32 = 10483;

/// Socket cookie the fake write socket reports.
pub const FAKE_COOKIE: u64 = 27149;

/// Address the fake generator returns.
pub const FAKE_V6: &str = "2001:db8:0:b11::464";

/// MTU the fake probe detects.
pub const FAKE_MTU: u32 = 1500;

/// An in-memory BPF map. Clones share the same entries.
pub struct FakeBpfMap<K, V> {
    entries: Arc<Mutex<Vec<(K, V)>>>,
    fail_inserts: Arc<Mutex<bool>>,
}

impl<K, V> Clone for FakeBpfMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            fail_inserts: Arc::clone(&self.fail_inserts),
        }
    }
}

impl<K: Pod + PartialEq, V: Pod> FakeBpfMap<K, V> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            fail_inserts: Arc::new(Mutex::new(false)),
        }
    }

    /// Make every subsequent insert fail, as if the kernel rejected it.
    pub fn set_fail_inserts(&self, fail: bool) {
        *self.fail_inserts.lock().unwrap() = fail;
    }

    pub fn entries(&self) -> Vec<(K, V)> {
        self.entries.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.lock().unwrap().iter().any(|(k, _)| k == key)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| *v)
    }
}

impl<K: Pod + PartialEq, V: Pod> Default for FakeBpfMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Pod + PartialEq, V: Pod> BpfMap<K, V> for FakeBpfMap<K, V> {
    fn insert(&mut self, key: &K, value: &V) -> io::Result<()> {
        if *self.fail_inserts.lock().unwrap() {
            return Err(io::Error::other("injected map insert failure"));
        }
        let mut entries = self.entries.lock().unwrap();
        if entries.iter().any(|(k, _)| k == key) {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }
        entries.push((*key, *value));
        Ok(())
    }

    fn delete(&mut self, key: &K) -> io::Result<()> {
        let mut entries = self.entries.lock().unwrap();
        match entries.iter().position(|(k, _)| k == key) {
            Some(index) => {
                entries.remove(index);
                Ok(())
            }
            None => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }

    fn for_each(&self, f: &mut dyn FnMut(&K, &V)) -> io::Result<()> {
        for (k, v) in self.entries.lock().unwrap().iter() {
            f(k, v);
        }
        Ok(())
    }
}

/// Recording fake of the configuration daemon. Shares the call log and the
/// failure set with [`FakeDeps`].
pub struct FakeNetd {
    calls: Arc<Mutex<Vec<String>>>,
    fail: Arc<Mutex<HashSet<String>>>,
}

impl FakeNetd {
    fn call(&self, line: String, op: &str) -> io::Result<()> {
        self.calls.lock().unwrap().push(line);
        if self.fail.lock().unwrap().contains(op) {
            return Err(io::Error::other(format!("injected {op} failure")));
        }
        Ok(())
    }
}

impl NetdClient for FakeNetd {
    fn interface_set_enable_ipv6(&self, if_name: &str, enabled: bool) -> io::Result<()> {
        self.call(
            format!("interface_set_enable_ipv6 {if_name} {enabled}"),
            "interface_set_enable_ipv6",
        )
    }

    fn interface_set_mtu(&self, if_name: &str, mtu: u32) -> io::Result<()> {
        self.call(
            format!("interface_set_mtu {if_name} {mtu}"),
            "interface_set_mtu",
        )
    }

    fn interface_set_cfg(&self, cfg: &InterfaceConfig) -> io::Result<()> {
        self.call(
            format!(
                "interface_set_cfg {} {}/{} {}",
                cfg.if_name,
                cfg.ipv4_addr,
                cfg.prefix_length,
                cfg.flags.join(",")
            ),
            "interface_set_cfg",
        )
    }
}

/// Recording platform fake.
///
/// Descriptors handed out are real fds on `/dev/null`, so the coordinator's
/// ownership handling (adopt, drop, dup to the daemon) runs against actual
/// kernel objects without needing privileges.
#[derive(Clone)]
pub struct FakeDeps {
    calls: Arc<Mutex<Vec<String>>>,
    fail: Arc<Mutex<HashSet<String>>>,
    pub ingress6: FakeBpfMap<ClatIngress6Key, ClatIngress6Value>,
    pub egress4: FakeBpfMap<ClatEgress4Key, ClatEgress4Value>,
    pub cookie_tag: FakeBpfMap<CookieTagMapKey, CookieTagMapValue>,
    netd: Arc<FakeNetd>,
    has_data_plane_maps: bool,
    has_cookie_tag_map: bool,
    /// Link type the fake uplink reports.
    pub ethernet_uplink: bool,
}

impl FakeDeps {
    pub fn new() -> Self {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let fail = Arc::new(Mutex::new(HashSet::new()));
        let netd = Arc::new(FakeNetd {
            calls: Arc::clone(&calls),
            fail: Arc::clone(&fail),
        });
        Self {
            calls,
            fail,
            ingress6: FakeBpfMap::new(),
            egress4: FakeBpfMap::new(),
            cookie_tag: FakeBpfMap::new(),
            netd,
            has_data_plane_maps: true,
            has_cookie_tag_map: true,
            ethernet_uplink: false,
        }
    }

    /// Simulate missing ingress6/egress4 pins.
    pub fn without_data_plane_maps(mut self) -> Self {
        self.has_data_plane_maps = false;
        self
    }

    /// Simulate a missing cookie tag pin.
    pub fn without_cookie_tag_map(mut self) -> Self {
        self.has_cookie_tag_map = false;
        self
    }

    /// Make operation `op` fail (or, for `*_interface_index`, report a
    /// missing interface).
    pub fn fail_on(&self, op: &str) {
        self.fail.lock().unwrap().insert(op.to_string());
    }

    /// Stop failing previously injected operations.
    pub fn clear_failures(&self) {
        self.fail.lock().unwrap().clear();
    }

    /// Every facade and netd call so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn checked(&self, op: &str, line: String) -> io::Result<()> {
        self.calls.lock().unwrap().push(line);
        if self.fail.lock().unwrap().contains(op) {
            return Err(io::Error::other(format!("injected {op} failure")));
        }
        Ok(())
    }

    fn fails(&self, op: &str) -> bool {
        self.fail.lock().unwrap().contains(op)
    }

    fn devnull_fd(&self) -> io::Result<RawFd> {
        Ok(File::open("/dev/null")?.into_raw_fd())
    }
}

impl Default for FakeDeps {
    fn default() -> Self {
        Self::new()
    }
}

impl Dependencies for FakeDeps {
    fn netd(&self) -> Arc<dyn NetdClient> {
        Arc::clone(&self.netd) as Arc<dyn NetdClient>
    }

    fn interface_index(&self, name: &str) -> u32 {
        self.calls
            .lock()
            .unwrap()
            .push(format!("interface_index {name}"));
        if name.starts_with("v4-") {
            if self.fails("tun_interface_index") {
                return INVALID_IFINDEX;
            }
            TUN_IFINDEX
        } else {
            if self.fails("uplink_interface_index") {
                return INVALID_IFINDEX;
            }
            UPLINK_IFINDEX
        }
    }

    fn create_tun_interface(&self, name: &str) -> io::Result<RawFd> {
        self.checked("create_tun_interface", format!("create_tun_interface {name}"))?;
        self.devnull_fd()
    }

    fn select_ipv4_address(&self, seed: Ipv4Addr, prefix_len: u8) -> io::Result<Ipv4Addr> {
        self.checked(
            "select_ipv4_address",
            format!("select_ipv4_address {seed}/{prefix_len}"),
        )?;
        Ok(seed)
    }

    fn generate_ipv6_address(
        &self,
        iface: &str,
        v4: Ipv4Addr,
        pfx96: Ipv6Addr,
        fwmark: u32,
    ) -> io::Result<Ipv6Addr> {
        self.checked(
            "generate_ipv6_address",
            format!("generate_ipv6_address {iface} {v4} {pfx96} {fwmark:#x}"),
        )?;
        Ok(FAKE_V6.parse().unwrap())
    }

    fn detect_mtu(&self, pfx96: Ipv6Addr, target: Ipv4Addr, fwmark: u32) -> io::Result<u32> {
        self.checked("detect_mtu", format!("detect_mtu {pfx96} {target} {fwmark:#x}"))?;
        Ok(FAKE_MTU)
    }

    fn open_packet_socket(&self) -> io::Result<RawFd> {
        self.checked("open_packet_socket", "open_packet_socket".to_string())?;
        self.devnull_fd()
    }

    fn open_raw_socket6(&self, fwmark: u32) -> io::Result<RawFd> {
        self.checked("open_raw_socket6", format!("open_raw_socket6 {fwmark:#x}"))?;
        self.devnull_fd()
    }

    fn add_anycast_setsockopt(
        &self,
        _sock: BorrowedFd<'_>,
        v6: Ipv6Addr,
        ifindex: u32,
    ) -> io::Result<()> {
        self.checked(
            "add_anycast_setsockopt",
            format!("add_anycast_setsockopt {v6} {ifindex}"),
        )
    }

    fn configure_packet_socket(
        &self,
        _sock: BorrowedFd<'_>,
        v6: Ipv6Addr,
        ifindex: u32,
    ) -> io::Result<()> {
        self.checked(
            "configure_packet_socket",
            format!("configure_packet_socket {v6} {ifindex}"),
        )
    }

    fn start_clatd(
        &self,
        tun_fd: BorrowedFd<'_>,
        read_fd: BorrowedFd<'_>,
        write_fd: BorrowedFd<'_>,
        iface: &str,
        pfx96: Ipv6Addr,
        v4: Ipv4Addr,
        v6: Ipv6Addr,
    ) -> io::Result<i32> {
        assert!(tun_fd.as_raw_fd() >= 0);
        assert!(read_fd.as_raw_fd() >= 0);
        assert!(write_fd.as_raw_fd() >= 0);
        self.checked(
            "start_clatd",
            format!("start_clatd {iface} {pfx96} {v4} {v6}"),
        )?;
        Ok(FAKE_CLATD_PID)
    }

    fn stop_clatd(&self, pid: i32) -> io::Result<()> {
        self.checked("stop_clatd", format!("stop_clatd {pid}"))
    }

    fn get_socket_cookie(&self, _sock: BorrowedFd<'_>) -> io::Result<u64> {
        self.checked("get_socket_cookie", "get_socket_cookie".to_string())?;
        Ok(FAKE_COOKIE)
    }

    fn is_ethernet(&self, iface: &str) -> io::Result<bool> {
        self.checked("is_ethernet", format!("is_ethernet {iface}"))?;
        Ok(self.ethernet_uplink)
    }

    fn tc_qdisc_add_clsact(&self, ifindex: u32) -> io::Result<()> {
        self.checked("tc_qdisc_add_clsact", format!("tc_qdisc_add_clsact {ifindex}"))
    }

    fn tc_filter_add_bpf(
        &self,
        ifindex: u32,
        ingress: bool,
        prio: u16,
        proto: u16,
        prog_path: &str,
    ) -> io::Result<()> {
        let direction = if ingress { "ingress" } else { "egress" };
        self.checked(
            &format!("tc_filter_add_bpf {direction}"),
            format!("tc_filter_add_bpf {ifindex} {direction} {prio} {proto:#06x} {prog_path}"),
        )
    }

    fn tc_filter_del(&self, ifindex: u32, ingress: bool, prio: u16, proto: u16) -> io::Result<()> {
        let direction = if ingress { "ingress" } else { "egress" };
        self.checked(
            &format!("tc_filter_del {direction}"),
            format!("tc_filter_del {ifindex} {direction} {prio} {proto:#06x}"),
        )
    }

    fn open_ingress6_map(&self) -> Option<Ingress6Map> {
        self.has_data_plane_maps
            .then(|| Box::new(self.ingress6.clone()) as Ingress6Map)
    }

    fn open_egress4_map(&self) -> Option<Egress4Map> {
        self.has_data_plane_maps
            .then(|| Box::new(self.egress4.clone()) as Egress4Map)
    }

    fn open_cookie_tag_map(&self) -> Option<CookieTagMap> {
        self.has_cookie_tag_map
            .then(|| Box::new(self.cookie_tag.clone()) as CookieTagMap)
    }
}
