//! Small networks for unit tests.

use sweeper_ir::addr::{InterfaceAddress, Ip, Prefix, PrefixRange};
use sweeper_ir::network::{BgpNeighbor, BgpProcess, Interface, Network, OspfProcess, RouterConfig};
use sweeper_ir::policy::{BooleanExpr, PrefixSetExpr, RoutingPolicy, Statement};
use sweeper_ir::protocol::RoutingProtocol;
use sweeper_smt::{Encoding, Model, ModelValue, SmtSort, SmtTerm};

pub fn ip(s: &str) -> Ip {
    s.parse().unwrap()
}

/// Every declared variable at its zero value.
pub fn zero_model(enc: &Encoding) -> Model {
    let mut m = Model::default();
    for (name, sort) in &enc.declarations {
        let v = match sort {
            SmtSort::Bool => ModelValue::Bool(false),
            SmtSort::Int => ModelValue::Int(0),
        };
        m.values.insert(name.clone(), v);
    }
    m
}

/// Assign `v` to the variable `term` names.
pub fn set(m: &mut Model, term: &SmtTerm, v: ModelValue) {
    match term {
        SmtTerm::Var(name) => {
            m.values.insert(name.clone(), v);
        }
        other => panic!("not a variable: {other:?}"),
    }
}

pub fn iface(name: &str, addr: &str, len: u8) -> Interface {
    Interface::new(name, Some(InterfaceAddress::new(ip(addr), len)))
}

/// `R0 - R1 - ... - Rn-1` running OSPF in area 0, with a stub subnet
/// 10.0.200.0/24 on the last router.
pub fn ospf_line(n: usize) -> Network {
    let mut net = Network::new();
    for i in 0..n {
        let mut conf = RouterConfig::new(format!("R{i}"));
        let mut ospf = OspfProcess::new(Ip(i as u32 + 1));
        let mut area = Vec::new();
        let mut add = |conf: &mut RouterConfig, mut it: Interface| {
            it.ospf_enabled = true;
            area.push(it.name.clone());
            conf.add_interface(it);
        };
        if i > 0 {
            add(&mut conf, iface(&format!("to{}", i - 1), &format!("10.0.{}.2", i - 1), 24));
        }
        if i + 1 < n {
            add(&mut conf, iface(&format!("to{}", i + 1), &format!("10.0.{i}.1"), 24));
        } else {
            add(&mut conf, iface("stub", "10.0.200.1", 24));
        }
        ospf.areas.insert(0, area);
        conf.ospf = Some(ospf);
        net.add_router(conf);
    }
    net
}

/// The common export policy originating `prefixes` into BGP.
pub fn bgp_origination_policy(prefixes: &[Prefix]) -> RoutingPolicy {
    RoutingPolicy::new(
        "~BGP_COMMON_EXPORT_POLICY:default~",
        vec![Statement::if_then_else(
            BooleanExpr::Conjunction(vec![
                BooleanExpr::MatchPrefixSet(PrefixSetExpr::Explicit(
                    prefixes.iter().copied().map(PrefixRange::exact).collect(),
                )),
                BooleanExpr::not(BooleanExpr::MatchProtocol(vec![RoutingProtocol::Bgp])),
            ]),
            vec![Statement::ExitAccept],
            vec![Statement::ExitReject],
        )],
    )
}

/// R1 (AS 1) and R2 (AS 2) peering over 10.1.0.0/24. R2 originates
/// 10.0.0.0/24 from its `lan` interface.
pub fn ebgp_pair() -> Network {
    let mut net = Network::new();

    let mut r1 = RouterConfig::new("R1");
    r1.add_interface(iface("e0", "10.1.0.1", 24));
    let mut bgp1 = BgpProcess::new(ip("1.1.1.1"));
    bgp1.neighbors.push(BgpNeighbor::new(ip("10.1.0.2"), 1, 2));
    r1.bgp = Some(bgp1);
    net.add_router(r1);

    let mut r2 = RouterConfig::new("R2");
    r2.add_interface(iface("e0", "10.1.0.2", 24));
    r2.add_interface(iface("lan", "10.0.0.1", 24));
    let mut bgp2 = BgpProcess::new(ip("2.2.2.2"));
    bgp2.neighbors.push(BgpNeighbor::new(ip("10.1.0.1"), 2, 1));
    r2.bgp = Some(bgp2);
    r2.add_policy(bgp_origination_policy(&["10.0.0.0/24".parse().unwrap()]));
    net.add_router(r2);

    net
}

/// One router with a single eBGP neighbor outside the network.
pub fn single_external_peer() -> Network {
    let mut net = Network::new();
    let mut r = RouterConfig::new("R1");
    r.add_interface(iface("e0", "192.168.0.1", 30));
    let mut bgp = BgpProcess::new(ip("1.1.1.1"));
    bgp.neighbors.push(BgpNeighbor::new(ip("192.168.0.2"), 1, 2));
    r.bgp = Some(bgp);
    net.add_router(r);
    net
}

/// `single_external_peer` importing through a policy of `statements`.
pub fn external_peer_importing(statements: Vec<Statement>) -> Network {
    let mut net = single_external_peer();
    let r = net.router_mut("R1").unwrap();
    r.add_policy(RoutingPolicy::new("import", statements));
    r.bgp.as_mut().unwrap().neighbors[0].import_policy = Some("import".into());
    net
}

/// `ospf_line(2)` with an iBGP session between R0 and R1 sourced from their
/// link addresses. R1 originates its stub subnet into BGP.
pub fn ibgp_over_ospf() -> Network {
    let mut net = ospf_line(2);
    let sessions = [("R0", "10.0.0.1", "10.0.0.2"), ("R1", "10.0.0.2", "10.0.0.1")];
    for (i, (router, local, remote)) in sessions.into_iter().enumerate() {
        let conf = net.router_mut(router).unwrap();
        let mut bgp = BgpProcess::new(Ip(i as u32 + 1));
        let mut n = BgpNeighbor::new(ip(remote), 1, 1);
        n.local_ip = Some(ip(local));
        bgp.neighbors.push(n);
        conf.bgp = Some(bgp);
    }
    net.router_mut("R1")
        .unwrap()
        .add_policy(bgp_origination_policy(&["10.0.200.0/24".parse().unwrap()]));
    net
}
