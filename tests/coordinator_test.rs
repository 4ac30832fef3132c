//! Coordinator state machine tests.
//!
//! Runs entirely against the in-memory fakes: no privileges, no netlink, no
//! real sockets beyond /dev/null descriptors. Covers the happy path, every
//! pre-state rejection, the per-step unwind of a failed start, the
//! best-effort BPF fast path, and teardown symmetry.

use clat_coordinator::maps::{ClatEgress4Key, ClatIngress6Key, CookieTagMapKey};
use clat_coordinator::test_util::{
    FAKE_CLATD_PID, FAKE_COOKIE, FAKE_V6, FakeDeps, TUN_IFINDEX, UPLINK_IFINDEX,
};
use clat_coordinator::{AID_CLAT, ClatCoordinator, ClatError};
use ipnet::Ipv6Net;
use std::net::{Ipv4Addr, Ipv6Addr};

const IFACE: &str = "wlan0";
const NET_ID: u32 = 100;

fn nat64_prefix() -> Ipv6Net {
    "2001:db8::/96".parse().unwrap()
}

fn pfx96() -> Ipv6Addr {
    "2001:db8::".parse().unwrap()
}

fn chosen_v4() -> Ipv4Addr {
    Ipv4Addr::new(192, 0, 0, 4)
}

fn chosen_v6() -> Ipv6Addr {
    FAKE_V6.parse().unwrap()
}

fn egress_key() -> ClatEgress4Key {
    ClatEgress4Key::new(TUN_IFINDEX, chosen_v4())
}

fn ingress_key() -> ClatIngress6Key {
    ClatIngress6Key::new(UPLINK_IFINDEX, pfx96(), chosen_v6())
}

#[test]
fn test_start_happy_path() {
    let deps = FakeDeps::new();
    let mut coordinator = ClatCoordinator::new(deps.clone());

    let v6 = coordinator
        .start(IFACE, NET_ID, nat64_prefix())
        .expect("start failed");
    assert_eq!(v6, chosen_v6());

    let tracker = coordinator.tracker().expect("tracker missing");
    assert_eq!(tracker.iface, IFACE);
    assert_eq!(tracker.ifindex, UPLINK_IFINDEX);
    assert_eq!(tracker.v4_iface, "v4-wlan0");
    assert_eq!(tracker.v4_ifindex, TUN_IFINDEX);
    assert_eq!(tracker.v4, chosen_v4());
    assert_eq!(tracker.v6, chosen_v6());
    assert_eq!(tracker.pfx96, pfx96());
    assert_eq!(tracker.pid, FAKE_CLATD_PID);
    assert_eq!(tracker.cookie, FAKE_COOKIE);

    // The write socket is tagged under AID_CLAT with tag 0.
    let tag = deps
        .cookie_tag
        .get(&CookieTagMapKey::new(FAKE_COOKIE))
        .expect("cookie tag entry missing");
    assert_eq!(tag.uid, AID_CLAT);
    assert_eq!(tag.tag, 0);

    // Both forwarding map entries exist.
    assert!(deps.egress4.contains(&egress_key()));
    assert!(deps.ingress6.contains(&ingress_key()));
    let tx = deps.egress4.get(&egress_key()).unwrap();
    assert_eq!(tx.oif, UPLINK_IFINDEX);
    assert_eq!(tx.oif_is_ethernet, 0);
    let rx = deps.ingress6.get(&ingress_key()).unwrap();
    assert_eq!(rx.oif, TUN_IFINDEX);

    // Both filters were attached at priority 4, wlan uplink gets rawip.
    let calls = deps.calls();
    assert!(calls.iter().any(|c| c.starts_with(&format!(
        "tc_filter_add_bpf {TUN_IFINDEX} egress 4 0x0800"
    ))));
    assert!(
        calls.iter().any(|c| c.starts_with(&format!(
            "tc_filter_add_bpf {UPLINK_IFINDEX} ingress 4 0x86dd"
        )) && c.ends_with("ingress6_clat_rawip"))
    );

    // The clsact went in before the filters.
    let qdisc = calls
        .iter()
        .position(|c| c == &format!("tc_qdisc_add_clsact {TUN_IFINDEX}"))
        .expect("no clsact call");
    let filter = calls
        .iter()
        .position(|c| c.starts_with("tc_filter_add_bpf"))
        .unwrap();
    assert!(qdisc < filter);
}

#[test]
fn test_start_rejects_bad_prefix() {
    let deps = FakeDeps::new();
    let mut coordinator = ClatCoordinator::new(deps.clone());

    let result = coordinator.start(IFACE, NET_ID, "2001:db8::/64".parse().unwrap());
    assert!(matches!(result, Err(ClatError::NotNat64Prefix(_))));
    assert!(coordinator.tracker().is_none());
    // Rejected before any side effect.
    assert!(deps.calls().is_empty());
}

#[test]
fn test_start_while_running_keeps_tracker() {
    let deps = FakeDeps::new();
    let mut coordinator = ClatCoordinator::new(deps.clone());

    coordinator
        .start(IFACE, NET_ID, nat64_prefix())
        .expect("start failed");
    let before = coordinator.tracker().unwrap().clone();

    let result = coordinator.start("eth0", 7, nat64_prefix());
    assert!(matches!(result, Err(ClatError::AlreadyRunning { .. })));
    assert_eq!(coordinator.tracker().unwrap(), &before);
    assert_eq!(deps.cookie_tag.len(), 1);
}

#[test]
fn test_stop_when_idle() {
    let deps = FakeDeps::new();
    let mut coordinator = ClatCoordinator::new(deps);
    assert!(matches!(coordinator.stop(), Err(ClatError::NotRunning)));
}

#[test]
fn test_stop_reverses_start() {
    let deps = FakeDeps::new();
    let mut coordinator = ClatCoordinator::new(deps.clone());

    coordinator
        .start(IFACE, NET_ID, nat64_prefix())
        .expect("start failed");
    coordinator.stop().expect("stop failed");

    assert!(coordinator.tracker().is_none());
    assert_eq!(deps.egress4.len(), 0);
    assert_eq!(deps.ingress6.len(), 0);
    assert_eq!(deps.cookie_tag.len(), 0);

    let calls = deps.calls();
    assert!(calls.contains(&format!("stop_clatd {FAKE_CLATD_PID}")));
    assert!(calls.contains(&format!(
        "tc_filter_del {UPLINK_IFINDEX} ingress 4 0x86dd"
    )));
    assert!(calls.contains(&format!("tc_filter_del {TUN_IFINDEX} egress 4 0x0800")));
}

#[test]
fn test_ingress_filter_failure_rolls_back_bpf_plane_only() {
    let deps = FakeDeps::new();
    deps.fail_on("tc_filter_add_bpf ingress");
    let mut coordinator = ClatCoordinator::new(deps.clone());

    // The BPF fast path is best effort: start still succeeds.
    coordinator
        .start(IFACE, NET_ID, nat64_prefix())
        .expect("start should succeed without the fast path");
    assert!(coordinator.tracker().is_some());

    // Map entries and the egress filter were reverted, the daemon and the
    // accounting tag stay.
    assert_eq!(deps.egress4.len(), 0);
    assert_eq!(deps.ingress6.len(), 0);
    assert_eq!(deps.cookie_tag.len(), 1);
    assert!(
        deps.calls()
            .contains(&format!("tc_filter_del {TUN_IFINDEX} egress 4 0x0800"))
    );
}

#[test]
fn test_egress_filter_failure_keeps_clsact() {
    let deps = FakeDeps::new();
    deps.fail_on("tc_filter_add_bpf egress");
    let mut coordinator = ClatCoordinator::new(deps.clone());

    coordinator
        .start(IFACE, NET_ID, nat64_prefix())
        .expect("start should succeed without the fast path");

    assert_eq!(deps.egress4.len(), 0);
    assert_eq!(deps.ingress6.len(), 0);
    let calls = deps.calls();
    // The clsact is left in place and no ingress filter was attempted.
    assert!(calls.contains(&format!("tc_qdisc_add_clsact {TUN_IFINDEX}")));
    assert!(!calls.iter().any(|c| c.starts_with(&format!(
        "tc_filter_add_bpf {UPLINK_IFINDEX} ingress"
    ))));
    assert!(!calls.iter().any(|c| c.starts_with("tc_filter_del")));
}

#[test]
fn test_cookie_tag_insert_failure_unwinds_everything() {
    let deps = FakeDeps::new();
    deps.cookie_tag.set_fail_inserts(true);
    let mut coordinator = ClatCoordinator::new(deps.clone());

    let result = coordinator.start(IFACE, NET_ID, nat64_prefix());
    assert!(matches!(result, Err(ClatError::Io { .. })));
    assert!(coordinator.tracker().is_none());

    assert_eq!(deps.cookie_tag.len(), 0);
    assert_eq!(deps.egress4.len(), 0);
    assert_eq!(deps.ingress6.len(), 0);
    // Failure happens before the TUN is touched.
    let calls = deps.calls();
    assert!(!calls.iter().any(|c| c.starts_with("create_tun_interface")));
    assert!(!calls.iter().any(|c| c.starts_with("start_clatd")));
}

#[test]
fn test_stop_swallows_filter_del_failure() {
    let deps = FakeDeps::new();
    let mut coordinator = ClatCoordinator::new(deps.clone());

    coordinator
        .start(IFACE, NET_ID, nat64_prefix())
        .expect("start failed");
    deps.fail_on("tc_filter_del ingress");

    coordinator.stop().expect("stop should swallow filter errors");
    assert!(coordinator.tracker().is_none());
    assert_eq!(deps.egress4.len(), 0);
    assert_eq!(deps.ingress6.len(), 0);
    assert_eq!(deps.cookie_tag.len(), 0);
}

#[test]
fn test_stop_daemon_failure_still_goes_idle() {
    let deps = FakeDeps::new();
    let mut coordinator = ClatCoordinator::new(deps.clone());

    coordinator
        .start(IFACE, NET_ID, nat64_prefix())
        .expect("start failed");
    deps.fail_on("stop_clatd");

    let result = coordinator.stop();
    assert!(matches!(result, Err(ClatError::Io { .. })));
    // Idle regardless, and the cookie tag was still removed.
    assert!(coordinator.tracker().is_none());
    assert_eq!(deps.cookie_tag.len(), 0);
    assert_eq!(deps.egress4.len(), 0);
    assert_eq!(deps.ingress6.len(), 0);
}

#[test]
fn test_missing_data_plane_maps_degrades_gracefully() {
    let deps = FakeDeps::new().without_data_plane_maps();
    let mut coordinator = ClatCoordinator::new(deps.clone());

    let v6 = coordinator
        .start(IFACE, NET_ID, nat64_prefix())
        .expect("start should succeed without data plane maps");
    assert_eq!(v6, chosen_v6());
    assert!(coordinator.tracker().is_some());

    // No fast path was attempted at all.
    assert_eq!(deps.egress4.len(), 0);
    assert_eq!(deps.ingress6.len(), 0);
    let calls = deps.calls();
    assert!(!calls.iter().any(|c| c.starts_with("is_ethernet")));
    assert!(!calls.iter().any(|c| c.starts_with("tc_")));

    coordinator.stop().expect("stop failed");
    assert!(coordinator.tracker().is_none());
    assert!(!deps.calls().iter().any(|c| c.starts_with("tc_filter_del")));
}

#[test]
fn test_missing_cookie_tag_map_fails_start_cleanly() {
    let deps = FakeDeps::new().without_cookie_tag_map();
    let mut coordinator = ClatCoordinator::new(deps.clone());

    let result = coordinator.start(IFACE, NET_ID, nat64_prefix());
    assert!(matches!(result, Err(ClatError::Io { .. })));
    assert!(coordinator.tracker().is_none());
    assert!(!deps.calls().iter().any(|c| c.starts_with("start_clatd")));
}

#[test]
fn test_every_start_step_failure_unwinds_cleanly() {
    // One entry per fallible step of the start sequence, in order.
    let steps = [
        "select_ipv4_address",
        "generate_ipv6_address",
        "open_packet_socket",
        "open_raw_socket6",
        "uplink_interface_index",
        "add_anycast_setsockopt",
        "get_socket_cookie",
        "configure_packet_socket",
        "create_tun_interface",
        "tun_interface_index",
        "interface_set_enable_ipv6",
        "detect_mtu",
        "interface_set_mtu",
        "interface_set_cfg",
        "start_clatd",
    ];

    for step in steps {
        let deps = FakeDeps::new();
        deps.fail_on(step);
        let mut coordinator = ClatCoordinator::new(deps.clone());

        let result = coordinator.start(IFACE, NET_ID, nat64_prefix());
        assert!(result.is_err(), "start should fail when {step} fails");
        assert!(
            coordinator.tracker().is_none(),
            "tracker leaked when {step} fails"
        );
        assert_eq!(
            deps.cookie_tag.len(),
            0,
            "cookie tag leaked when {step} fails"
        );
        assert_eq!(deps.egress4.len(), 0, "egress entry leaked when {step} fails");
        assert_eq!(
            deps.ingress6.len(),
            0,
            "ingress entry leaked when {step} fails"
        );
        assert!(
            !deps.calls().iter().any(|c| c.starts_with("tc_")),
            "fast path touched when {step} fails"
        );

        // A coordinator that failed to start still starts cleanly later.
        deps.clear_failures();
        coordinator
            .start(IFACE, NET_ID, nat64_prefix())
            .unwrap_or_else(|e| panic!("restart after failed {step} did not succeed: {e}"));
    }
}

#[test]
fn test_ethernet_uplink_selects_ether_program() {
    let mut deps = FakeDeps::new();
    deps.ethernet_uplink = true;
    let mut coordinator = ClatCoordinator::new(deps.clone());

    coordinator
        .start("eth0", NET_ID, nat64_prefix())
        .expect("start failed");

    assert!(
        deps.calls()
            .iter()
            .any(|c| c.starts_with("tc_filter_add_bpf") && c.ends_with("ingress6_clat_ether"))
    );
    let tx = deps
        .egress4
        .get(&ClatEgress4Key::new(TUN_IFINDEX, chosen_v4()))
        .unwrap();
    assert_eq!(tx.oif_is_ethernet, 1);
}

#[test]
fn test_dump_idle_and_running() {
    let deps = FakeDeps::new();
    let mut coordinator = ClatCoordinator::new(deps.clone());

    let mut out = Vec::new();
    coordinator.dump(&mut out).unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "<not started>\n\n");

    coordinator
        .start(IFACE, NET_ID, nat64_prefix())
        .expect("start failed");

    let mut out = Vec::new();
    coordinator.dump(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with(&format!(
        "CLAT tracker: iface: wlan0 ({UPLINK_IFINDEX}), v4iface: v4-wlan0 ({TUN_IFINDEX})"
    )));
    assert!(text.contains("Forwarding rules:"));
    assert!(text.contains("BPF ingress map:"));
    assert!(text.contains(&format!(
        "  {UPLINK_IFINDEX} 2001:db8::/96 {FAKE_V6} -> 192.0.0.4 {TUN_IFINDEX} (0 0)"
    )));
    assert!(text.contains("BPF egress map:"));
    assert!(text.contains(&format!(
        "  {TUN_IFINDEX} 192.0.0.4 -> {FAKE_V6} 2001:db8::/96 {UPLINK_IFINDEX} rawip (0 0)"
    )));
}

#[test]
fn test_dump_raw_map_emits_base64_pairs() {
    let deps = FakeDeps::new();
    let mut coordinator = ClatCoordinator::new(deps.clone());
    coordinator
        .start(IFACE, NET_ID, nat64_prefix())
        .expect("start failed");

    for is_egress4 in [false, true] {
        let mut out = Vec::new();
        coordinator.dump_raw_map(&mut out, is_egress4).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 1);
        let (key, value) = lines[0].split_once(',').expect("no comma separator");
        assert!(!key.is_empty());
        assert!(!value.is_empty());
    }

    let empty = ClatCoordinator::new(FakeDeps::new().without_data_plane_maps());
    let mut out = Vec::new();
    empty.dump_raw_map(&mut out, true).unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "BPF map is null\n");
}
