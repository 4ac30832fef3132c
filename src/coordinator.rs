//! The CLAT start/stop state machine.
//!
//! A coordinator is either idle or running exactly one translator instance.
//! `start()` commits roughly a dozen kernel side effects in a fixed order;
//! any failure unwinds the ones already committed, so after every call the
//! kernel is observably in one of the two states and never in between. The
//! TC/BPF fast path is best effort: the daemon translates on its own if the
//! classifiers cannot be attached.

use crate::deps::{
    CookieTagMap, Dependencies, ETH_P_IP, ETH_P_IPV6, Egress4Map, IF_STATE_UP, INVALID_IFINDEX,
    Ingress6Map, InterfaceConfig, NetdClient,
};
use crate::fwmark::{adjust_mtu, fwmark};
use crate::maps::{
    ClatEgress4Key, ClatEgress4Value, ClatIngress6Key, ClatIngress6Value, CookieTagMapKey,
    CookieTagMapValue,
};
use crate::tracker::ClatdTracker;
use ipnet::Ipv6Net;
use std::io::{self, Write};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

/// Reserved uid the translator's own traffic is accounted under.
pub const AID_CLAT: u32 = 1029;

/// Priority of the clat tc filters - must be after tethering.
pub const PRIO_CLAT: u16 = 4;

/// Name prefix of the TUN interface, `v4-` + uplink name.
const CLAT_PREFIX: &str = "v4-";

/// First candidate for the translator's IPv4 address (RFC 7335).
const INIT_V4ADDR: Ipv4Addr = Ipv4Addr::new(192, 0, 0, 4);
const INIT_V4ADDR_PREFIX_LEN: u8 = 29;

/// IPv4 destination synthesized into the prefix for the MTU probe.
const MTU_PROBE_TARGET: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

const INGRESS: bool = true;
const EGRESS: bool = false;

const CLAT_EGRESS4_RAWIP_PROG_PATH: &str =
    "/sys/fs/bpf/net_shared/prog_clatd_schedcls_egress4_clat_rawip";
const CLAT_INGRESS6_ETHER_PROG_PATH: &str =
    "/sys/fs/bpf/net_shared/prog_clatd_schedcls_ingress6_clat_ether";
const CLAT_INGRESS6_RAWIP_PROG_PATH: &str =
    "/sys/fs/bpf/net_shared/prog_clatd_schedcls_ingress6_clat_rawip";

fn ingress6_prog_path(is_ethernet: bool) -> &'static str {
    if is_ethernet {
        CLAT_INGRESS6_ETHER_PROG_PATH
    } else {
        CLAT_INGRESS6_RAWIP_PROG_PATH
    }
}

/// Coordinator errors.
#[derive(Debug, Error)]
pub enum ClatError {
    #[error("clatd is already running on {iface} (pid {pid})")]
    AlreadyRunning { iface: String, pid: i32 },

    #[error("clatd is not running")]
    NotRunning,

    #[error("NAT64 prefix must be 96 bits long: {0}")]
    NotNat64Prefix(Ipv6Net),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl ClatError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClatError>;

/// Single-instance CLAT control coordinator.
///
/// Not internally synchronized: `start()`, `stop()` and `dump()` must be
/// called from one scheduling context.
pub struct ClatCoordinator<D: Dependencies> {
    deps: D,
    netd: Arc<dyn NetdClient>,
    ingress6: Option<Ingress6Map>,
    egress4: Option<Egress4Map>,
    cookie_tag: Option<CookieTagMap>,
    tracker: Option<ClatdTracker>,
}

impl<D: Dependencies> ClatCoordinator<D> {
    /// Create a coordinator, opening the three pinned maps. A missing
    /// ingress or egress map downgrades to daemon-only translation.
    pub fn new(deps: D) -> Self {
        let netd = deps.netd();
        let ingress6 = deps.open_ingress6_map();
        let egress4 = deps.open_egress4_map();
        let cookie_tag = deps.open_cookie_tag_map();
        Self {
            deps,
            netd,
            ingress6,
            egress4,
            cookie_tag,
            tracker: None,
        }
    }

    /// Bring translation up on `iface` and return the translator's IPv6
    /// source address.
    pub fn start(&mut self, iface: &str, net_id: u32, nat64_prefix: Ipv6Net) -> Result<Ipv6Addr> {
        if let Some(tracker) = &self.tracker {
            return Err(ClatError::AlreadyRunning {
                iface: tracker.iface.clone(),
                pid: tracker.pid,
            });
        }
        if nat64_prefix.prefix_len() != 96 {
            return Err(ClatError::NotNat64Prefix(nat64_prefix));
        }
        let pfx96 = nat64_prefix.addr();

        // Pick the translator's addresses before touching kernel state.
        let v4 = self
            .deps
            .select_ipv4_address(INIT_V4ADDR, INIT_V4ADDR_PREFIX_LEN)
            .map_err(|e| ClatError::io("failed to select an IPv4 address", e))?;
        let mark = fwmark(net_id);
        let v6 = self
            .deps
            .generate_ipv6_address(iface, v4, pfx96, mark)
            .map_err(|e| ClatError::io("failed to generate the IPv6 address", e))?;

        // clatd reads inbound IPv6 from the packet socket and writes
        // translated IPv6 through the marked raw socket.
        let read_sock = self.deps.adopt_fd(
            self.deps
                .open_packet_socket()
                .map_err(|e| ClatError::io("failed to open packet socket", e))?,
        );
        let write_sock = self.deps.adopt_fd(
            self.deps
                .open_raw_socket6(mark)
                .map_err(|e| ClatError::io("failed to open raw socket", e))?,
        );

        let ifindex = self.deps.interface_index(iface);
        if ifindex == INVALID_IFINDEX {
            return Err(ClatError::io(
                format!("failed to get interface index for {iface}"),
                io::ErrorKind::NotFound.into(),
            ));
        }

        self.deps
            .add_anycast_setsockopt(write_sock.as_fd(), v6, ifindex)
            .map_err(|e| ClatError::io(format!("failed to join anycast group {v6}"), e))?;

        // Tag the write socket under AID_CLAT so translated traffic is not
        // counted against an app a second time.
        let cookie = self
            .deps
            .get_socket_cookie(write_sock.as_fd())
            .map_err(|e| ClatError::io("failed to get socket cookie", e))?;
        self.tag_socket_as_clat(cookie)?;

        let tracker = match self.setup_tun_and_daemon(
            iface,
            ifindex,
            mark,
            pfx96,
            v4,
            v6,
            cookie,
            &read_sock,
            &write_sock,
        ) {
            Ok(tracker) => tracker,
            Err(e) => {
                if let Err(untag_err) = self.untag_socket(cookie) {
                    error!(cookie, error = %untag_err, "failed to untag write socket while unwinding");
                }
                return Err(e);
            }
        };
        // The daemon holds duplicates of the tun/read/write descriptors;
        // ours close when this function returns.

        info!(iface, pid = tracker.pid, v6 = %v6, "clatd started");
        self.tracker = Some(tracker);

        // Best effort: translation works through the daemon alone if the
        // fast path cannot be attached.
        self.maybe_start_bpf();

        Ok(v6)
    }

    /// Steps after the accounting tag is in place: packet socket filter,
    /// TUN setup, interface configuration, daemon spawn. Any error here is
    /// unwound by the caller deleting the cookie tag; everything else this
    /// function creates dies with the descriptors.
    #[allow(clippy::too_many_arguments)]
    fn setup_tun_and_daemon(
        &mut self,
        iface: &str,
        ifindex: u32,
        mark: u32,
        pfx96: Ipv6Addr,
        v4: Ipv4Addr,
        v6: Ipv6Addr,
        cookie: u64,
        read_sock: &OwnedFd,
        write_sock: &OwnedFd,
    ) -> Result<ClatdTracker> {
        // Narrow the packet socket to the chosen translator address.
        self.deps
            .configure_packet_socket(read_sock.as_fd(), v6, ifindex)
            .map_err(|e| ClatError::io("failed to configure packet socket", e))?;

        let v4_iface = format!("{CLAT_PREFIX}{iface}");
        let tun_fd = self.deps.adopt_fd(
            self.deps
                .create_tun_interface(&v4_iface)
                .map_err(|e| ClatError::io(format!("failed to create tun {v4_iface}"), e))?,
        );
        let v4_ifindex = self.deps.interface_index(&v4_iface);
        if v4_ifindex == INVALID_IFINDEX {
            return Err(ClatError::io(
                format!("failed to get interface index for {v4_iface}"),
                io::ErrorKind::NotFound.into(),
            ));
        }

        // The TUN only ever carries the IPv4 leg.
        self.netd
            .interface_set_enable_ipv6(&v4_iface, false)
            .map_err(|e| ClatError::io(format!("failed to disable IPv6 on {v4_iface}"), e))?;

        let detected = self
            .deps
            .detect_mtu(pfx96, MTU_PROBE_TARGET, mark)
            .map_err(|e| ClatError::io("failed to detect MTU", e))?;
        let mtu = adjust_mtu(detected);
        info!(detected, mtu, "detected ipv4 mtu");

        self.netd
            .interface_set_mtu(&v4_iface, mtu)
            .map_err(|e| ClatError::io(format!("failed to set MTU on {v4_iface}"), e))?;
        self.netd
            .interface_set_cfg(&InterfaceConfig {
                if_name: v4_iface.clone(),
                ipv4_addr: v4,
                prefix_length: 32,
                hw_addr: String::new(),
                flags: vec![IF_STATE_UP.to_string()],
            })
            .map_err(|e| ClatError::io(format!("failed to configure {v4_iface}"), e))?;

        let pid = self
            .deps
            .start_clatd(
                tun_fd.as_fd(),
                read_sock.as_fd(),
                write_sock.as_fd(),
                iface,
                pfx96,
                v4,
                v6,
            )
            .map_err(|e| ClatError::io("failed to start clatd", e))?;

        Ok(ClatdTracker {
            iface: iface.to_string(),
            ifindex,
            v4_iface,
            v4_ifindex,
            v4,
            v6,
            pfx96,
            pid,
            cookie,
        })
    }

    /// Attach the TC/BPF fast path. Failures are logged and rolled back but
    /// never surfaced: the coordinator stays running on the daemon path.
    fn maybe_start_bpf(&mut self) {
        let Some(tracker) = self.tracker.clone() else {
            return;
        };
        let (Some(egress4), Some(ingress6)) = (self.egress4.as_mut(), self.ingress6.as_mut())
        else {
            return;
        };

        let is_ethernet = match self.deps.is_ethernet(&tracker.iface) {
            Ok(is_ethernet) => is_ethernet,
            Err(e) => {
                error!(iface = %tracker.iface, error = %e, "failed to query uplink link type");
                return;
            }
        };

        // Insert, never update: the values hold the in-kernel packet/byte
        // counters and an update would reset them. This also means the
        // entries may only be created for a brand new v4- interface.
        let tx_key = ClatEgress4Key::new(tracker.v4_ifindex, tracker.v4);
        let tx_value =
            ClatEgress4Value::new(tracker.ifindex, tracker.v6, tracker.pfx96, is_ethernet);
        if let Err(e) = egress4.insert(&tx_key, &tx_value) {
            error!(error = %e, "could not insert egress map entry");
            return;
        }

        let rx_key = ClatIngress6Key::new(tracker.ifindex, tracker.pfx96, tracker.v6);
        let rx_value = ClatIngress6Value::new(tracker.v4_ifindex, tracker.v4);
        if let Err(e) = ingress6.insert(&rx_key, &rx_value) {
            error!(error = %e, "could not insert ingress map entry");
            if let Err(del_err) = egress4.delete(&tx_key) {
                error!(error = %del_err, "could not delete egress map entry");
            }
            return;
        }

        // clatd starts before the v4- interface joins any network, so the
        // clsact the filters hang off has to be added here.
        if let Err(e) = self.deps.tc_qdisc_add_clsact(tracker.v4_ifindex) {
            error!(v4_iface = %tracker.v4_iface, error = %e, "tc qdisc add dev clsact failed");
            if let Err(del_err) = egress4.delete(&tx_key) {
                error!(error = %del_err, "could not delete egress map entry");
            }
            if let Err(del_err) = ingress6.delete(&rx_key) {
                error!(error = %del_err, "could not delete ingress map entry");
            }
            return;
        }

        // The v4- interface is a TUN and therefore always raw IP.
        if let Err(e) = self.deps.tc_filter_add_bpf(
            tracker.v4_ifindex,
            EGRESS,
            PRIO_CLAT,
            ETH_P_IP,
            CLAT_EGRESS4_RAWIP_PROG_PATH,
        ) {
            error!(v4_iface = %tracker.v4_iface, error = %e, "tc filter add dev egress failed");
            // The clsact stays: its lifetime is tied to the interface, and
            // an empty clsact breaks nothing.
            if let Err(del_err) = egress4.delete(&tx_key) {
                error!(error = %del_err, "could not delete egress map entry");
            }
            if let Err(del_err) = ingress6.delete(&rx_key) {
                error!(error = %del_err, "could not delete ingress map entry");
            }
            return;
        }

        if let Err(e) = self.deps.tc_filter_add_bpf(
            tracker.ifindex,
            INGRESS,
            PRIO_CLAT,
            ETH_P_IPV6,
            ingress6_prog_path(is_ethernet),
        ) {
            error!(iface = %tracker.iface, error = %e, "tc filter add dev ingress failed");
            if let Err(del_err) =
                self.deps
                    .tc_filter_del(tracker.v4_ifindex, EGRESS, PRIO_CLAT, ETH_P_IP)
            {
                error!(v4_iface = %tracker.v4_iface, error = %del_err, "tc filter del dev egress failed");
            }
            if let Err(del_err) = egress4.delete(&tx_key) {
                error!(error = %del_err, "could not delete egress map entry");
            }
            if let Err(del_err) = ingress6.delete(&rx_key) {
                error!(error = %del_err, "could not delete ingress map entry");
            }
        }
    }

    /// Detach the fast path. Every step is best effort.
    fn maybe_stop_bpf(&mut self, tracker: &ClatdTracker) {
        let (Some(egress4), Some(ingress6)) = (self.egress4.as_mut(), self.ingress6.as_mut())
        else {
            return;
        };

        if let Err(e) = self
            .deps
            .tc_filter_del(tracker.ifindex, INGRESS, PRIO_CLAT, ETH_P_IPV6)
        {
            error!(iface = %tracker.iface, error = %e, "tc filter del dev ingress failed");
        }
        if let Err(e) = self
            .deps
            .tc_filter_del(tracker.v4_ifindex, EGRESS, PRIO_CLAT, ETH_P_IP)
        {
            error!(v4_iface = %tracker.v4_iface, error = %e, "tc filter del dev egress failed");
        }

        // Maps are cleaned up last, so scanning them shows what still needs
        // cleanup after a partial teardown.
        if let Err(e) = egress4.delete(&ClatEgress4Key::new(tracker.v4_ifindex, tracker.v4)) {
            error!(error = %e, "could not delete egress map entry");
        }
        if let Err(e) = ingress6.delete(&ClatIngress6Key::new(
            tracker.ifindex,
            tracker.pfx96,
            tracker.v6,
        )) {
            error!(error = %e, "could not delete ingress map entry");
        }
    }

    fn tag_socket_as_clat(&mut self, cookie: u64) -> Result<()> {
        let Some(map) = self.cookie_tag.as_mut() else {
            return Err(ClatError::io(
                "cookie tag map is not initialized",
                io::ErrorKind::NotFound.into(),
            ));
        };

        // The tag is unused by the accounting program; the uid alone keeps
        // clatd's traffic out of the per-app counters.
        let key = CookieTagMapKey::new(cookie);
        let value = CookieTagMapValue::new(AID_CLAT, 0);
        map.insert(&key, &value)
            .map_err(|e| ClatError::io(format!("could not tag socket cookie {cookie}"), e))?;

        info!(cookie, "tagged write socket as clat");
        Ok(())
    }

    fn untag_socket(&mut self, cookie: u64) -> Result<()> {
        let Some(map) = self.cookie_tag.as_mut() else {
            return Err(ClatError::io(
                "cookie tag map is not initialized",
                io::ErrorKind::NotFound.into(),
            ));
        };

        // The socket-destroy accounting listener only covers TCP and UDP
        // sockets, so the raw socket's entry has to be removed here.
        map.delete(&CookieTagMapKey::new(cookie))
            .map_err(|e| ClatError::io(format!("could not untag socket cookie {cookie}"), e))?;

        info!(cookie, "untagged write socket");
        Ok(())
    }

    /// Tear the running instance down. The coordinator is idle afterwards
    /// even when one of the teardown steps reports an error.
    pub fn stop(&mut self) -> Result<()> {
        let tracker = self.tracker.take().ok_or(ClatError::NotRunning)?;
        info!(iface = %tracker.iface, pid = tracker.pid, "stopping clatd");

        self.maybe_stop_bpf(&tracker);

        // Run both critical steps before surfacing either error.
        let daemon = self
            .deps
            .stop_clatd(tracker.pid)
            .map_err(|e| ClatError::io(format!("failed to stop clatd (pid {})", tracker.pid), e));
        let untag = self.untag_socket(tracker.cookie);
        daemon?;
        untag?;

        info!(iface = %tracker.iface, "clatd stopped");
        Ok(())
    }

    /// Human-readable state dump.
    pub fn dump<W: Write>(&self, w: &mut W) -> io::Result<()> {
        if let Some(tracker) = &self.tracker {
            writeln!(w, "CLAT tracker: {tracker}")?;
            writeln!(w, "Forwarding rules:")?;
            self.dump_bpf_ingress(w)?;
            self.dump_bpf_egress(w)?;
        } else {
            writeln!(w, "<not started>")?;
        }
        writeln!(w)
    }

    fn dump_bpf_ingress<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let Some(map) = &self.ingress6 else {
            return writeln!(w, "No BPF ingress6 map");
        };

        match map.is_empty() {
            Ok(true) => writeln!(w, "<empty>")?,
            Ok(false) => {}
            Err(e) => return writeln!(w, "Error dumping BPF ingress6 map: {e}"),
        }
        writeln!(
            w,
            "BPF ingress map: iif nat64Prefix v6Addr -> v4Addr oif (packets bytes)"
        )?;

        let mut lines = Vec::new();
        let result = map.for_each(&mut |k, v| {
            lines.push(format!(
                "  {} {}/96 {} -> {} {} ({} {})",
                k.iif,
                k.pfx96_addr(),
                k.local6_addr(),
                v.local4_addr(),
                v.oif,
                v.packets,
                v.bytes
            ));
        });
        for line in lines {
            writeln!(w, "{line}")?;
        }
        if let Err(e) = result {
            writeln!(w, "Error dumping BPF ingress6 map: {e}")?;
        }
        Ok(())
    }

    fn dump_bpf_egress<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let Some(map) = &self.egress4 else {
            return writeln!(w, "No BPF egress4 map");
        };

        match map.is_empty() {
            Ok(true) => writeln!(w, "<empty>")?,
            Ok(false) => {}
            Err(e) => return writeln!(w, "Error dumping BPF egress4 map: {e}"),
        }
        writeln!(
            w,
            "BPF egress map: iif v4Addr -> v6Addr nat64Prefix oif (packets bytes)"
        )?;

        let mut lines = Vec::new();
        let result = map.for_each(&mut |k, v| {
            lines.push(format!(
                "  {} {} -> {} {}/96 {} {} ({} {})",
                k.iif,
                k.local4_addr(),
                v.local6_addr(),
                v.pfx96_addr(),
                v.oif,
                if v.oif_is_ethernet != 0 {
                    "ether"
                } else {
                    "rawip"
                },
                v.packets,
                v.bytes
            ));
        });
        for line in lines {
            writeln!(w, "{line}")?;
        }
        if let Err(e) = result {
            writeln!(w, "Error dumping BPF egress4 map: {e}")?;
        }
        Ok(())
    }

    /// Dump one map as `<base64 key>,<base64 value>` lines, for regression
    /// tooling.
    pub fn dump_raw_map<W: Write>(&self, w: &mut W, is_egress4: bool) -> io::Result<()> {
        if is_egress4 {
            match &self.egress4 {
                Some(map) => map.dump_raw(w),
                None => writeln!(w, "BPF map is null"),
            }
        } else {
            match &self.ingress6 {
                Some(map) => map.dump_raw(w),
                None => writeln!(w, "BPF map is null"),
            }
        }
    }

    /// The running instance's bindings, if any. For diagnostics and tests.
    pub fn tracker(&self) -> Option<&ClatdTracker> {
        self.tracker.as_ref()
    }
}
