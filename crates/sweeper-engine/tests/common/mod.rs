#![allow(dead_code)]

use sweeper_engine::{EngineOptions, HeaderLocationQuestion, SolverChoice, SoundnessMode};
use sweeper_ir::addr::{InterfaceAddress, Ip, Prefix};
use sweeper_ir::network::{
    Acl, BgpNeighbor, BgpProcess, Interface, Network, OspfProcess, RouterConfig, StaticRoute,
};
use sweeper_ir::policy::{BooleanExpr, IntExpr, RoutingPolicy, Statement};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

pub fn verify_options(timeout_secs: u64) -> EngineOptions {
    EngineOptions {
        solver: SolverChoice::Z3,
        timeout_secs,
        soundness: SoundnessMode::Strict,
        dump_smt: None,
        inline_threshold: 500,
    }
}

pub fn ip(s: &str) -> Ip {
    s.parse().unwrap_or_else(|e| panic!("bad address {s}: {e:?}"))
}

pub fn prefix(s: &str) -> Prefix {
    s.parse().unwrap_or_else(|e| panic!("bad prefix {s}: {e:?}"))
}

pub fn iface(name: &str, addr: &str, len: u8) -> Interface {
    Interface::new(name, Some(InterfaceAddress::new(ip(addr), len)))
}

fn ospf_router(name: &str, router_id: u32, ifaces: Vec<Interface>) -> RouterConfig {
    let mut conf = RouterConfig::new(name);
    let mut ospf = OspfProcess::new(Ip(router_id));
    let mut area = Vec::new();
    for mut it in ifaces {
        it.ospf_enabled = true;
        area.push(it.name.clone());
        conf.add_interface(it);
    }
    ospf.areas.insert(0, area);
    conf.ospf = Some(ospf);
    conf
}

pub fn location(ingress: &str, final_node: &str, final_iface: &str) -> HeaderLocationQuestion {
    HeaderLocationQuestion {
        ingress_node_regex: ingress.into(),
        final_node_regex: final_node.into(),
        final_iface_regex: final_iface.into(),
        ..HeaderLocationQuestion::default()
    }
}

/// `A - B - C` running OSPF, with the stub subnet 10.0.200.0/24 on C.
pub fn line_abc() -> Network {
    let mut net = Network::new();
    net.add_router(ospf_router("A", 1, vec![iface("b", "10.0.1.1", 24)]));
    net.add_router(ospf_router(
        "B",
        2,
        vec![iface("a", "10.0.1.2", 24), iface("c", "10.0.2.1", 24)],
    ));
    net.add_router(ospf_router(
        "C",
        3,
        vec![iface("b", "10.0.2.2", 24), iface("stub", "10.0.200.1", 24)],
    ));
    net
}

/// A diamond `A -> {B, C} -> D` of equal OSPF costs. D owns the stub
/// 10.0.200.0/24. When `block_c` is set, C drops everything it sends to D.
pub fn diamond(block_c: bool) -> Network {
    let mut net = Network::new();
    net.add_router(ospf_router(
        "A",
        1,
        vec![iface("b", "10.1.0.1", 24), iface("c", "10.2.0.1", 24)],
    ));
    net.add_router(ospf_router(
        "B",
        2,
        vec![iface("a", "10.1.0.2", 24), iface("d", "10.3.0.1", 24)],
    ));
    let mut c = ospf_router(
        "C",
        3,
        vec![iface("a", "10.2.0.2", 24), iface("d", "10.4.0.1", 24)],
    );
    if block_c {
        c.add_acl(Acl {
            name: "block".into(),
            lines: Vec::new(),
        });
        if let Some(it) = c.interfaces.get_mut("d") {
            it.outgoing_filter = Some("block".into());
        }
    }
    net.add_router(c);
    net.add_router(ospf_router(
        "D",
        4,
        vec![
            iface("b", "10.3.0.2", 24),
            iface("c", "10.4.0.2", 24),
            iface("stub", "10.0.200.1", 24),
        ],
    ));
    net
}

/// A single router R1 (AS 1) with one external eBGP peer. Announcements for
/// 10.0.0.0/24 are imported with local preference 200, all others rejected.
pub fn local_pref_peer() -> Network {
    let mut r = RouterConfig::new("R1");
    r.add_interface(iface("e0", "192.168.0.1", 30));
    r.add_policy(RoutingPolicy::new(
        "from-peer",
        vec![Statement::if_then_else(
            BooleanExpr::match_prefixes(&[prefix("10.0.0.0/24")]),
            vec![
                Statement::SetLocalPreference(IntExpr::Literal(200)),
                Statement::ExitAccept,
            ],
            vec![Statement::ExitReject],
        )],
    ));
    let mut bgp = BgpProcess::new(ip("1.1.1.1"));
    let mut n = BgpNeighbor::new(ip("192.168.0.2"), 1, 2);
    n.import_policy = Some("from-peer".into());
    bgp.neighbors.push(n);
    r.bgp = Some(bgp);

    let mut net = Network::new();
    net.add_router(r);
    net
}

/// Two unconnected edge routers with the same interface names, each with a
/// LAN and one upstream eBGP peer.
pub fn twin_edge_routers() -> Network {
    let mut net = Network::new();
    for (i, name) in ["R1", "R2"].into_iter().enumerate() {
        let n = i + 1;
        let mut r = RouterConfig::new(name);
        r.add_interface(iface("lan", &format!("10.{n}.0.1"), 24));
        r.add_interface(iface("up", &format!("192.168.{n}.1"), 30));
        let mut bgp = BgpProcess::new(Ip(n as u32));
        bgp.neighbors.push(BgpNeighbor::new(ip(&format!("192.168.{n}.2")), 65000, 1));
        r.bgp = Some(bgp);
        net.add_router(r);
    }
    net
}

/// Two routers pointing static routes for 10.9.0.0/24 at each other.
pub fn static_loop() -> Network {
    let mut net = Network::new();
    for (name, local, remote) in [("A", "10.0.1.1", "10.0.1.2"), ("B", "10.0.1.2", "10.0.1.1")] {
        let mut r = RouterConfig::new(name);
        r.add_interface(iface("link", local, 24));
        let mut sr = StaticRoute::new(prefix("10.9.0.0/24"));
        sr.next_hop_ip = Some(ip(remote));
        r.static_routes.push(sr);
        net.add_router(r);
    }
    net
}
