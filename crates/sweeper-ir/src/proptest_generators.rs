//! Proptest strategies for prefixes, routing policies and small networks.

use proptest::prelude::*;

use crate::addr::{InterfaceAddress, Ip, Prefix};
use crate::community::CommunityVar;
use crate::network::{Interface, Network, OspfProcess, RouterConfig};
use crate::policy::{BooleanExpr, CommunitySetExpr, IntExpr, PrefixSetExpr, Statement};
use crate::protocol::RoutingProtocol;

pub fn arb_prefix() -> impl Strategy<Value = Prefix> {
    (any::<u32>(), 8..=32u8).prop_map(|(ip, len)| Prefix::new(Ip(ip), len))
}

fn arb_community() -> impl Strategy<Value = CommunityVar> {
    (1..4u32).prop_map(|n| CommunityVar::Exact(format!("65000:{n}")))
}

fn arb_leaf_expr() -> impl Strategy<Value = BooleanExpr> {
    prop_oneof![
        Just(BooleanExpr::True),
        Just(BooleanExpr::False),
        Just(BooleanExpr::MatchIpv4),
        prop_oneof![
            Just(RoutingProtocol::Bgp),
            Just(RoutingProtocol::Ospf),
            Just(RoutingProtocol::Static),
            Just(RoutingProtocol::Connected),
        ]
        .prop_map(|p| BooleanExpr::MatchProtocol(vec![p])),
        proptest::collection::vec(arb_prefix(), 1..3).prop_map(|ps| BooleanExpr::match_prefixes(&ps)),
        arb_community()
            .prop_map(|c| BooleanExpr::MatchCommunitySet(CommunitySetExpr::Literal(vec![c]))),
    ]
}

/// Boolean guards built only from supported match expressions.
pub fn arb_guard() -> impl Strategy<Value = BooleanExpr> {
    arb_leaf_expr().prop_recursive(3, 12, 3, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 1..3).prop_map(BooleanExpr::Conjunction),
            proptest::collection::vec(inner.clone(), 1..3).prop_map(BooleanExpr::Disjunction),
            inner.prop_map(BooleanExpr::not),
        ]
    })
}

fn arb_simple_statement() -> impl Strategy<Value = Statement> {
    prop_oneof![
        Just(Statement::ExitAccept),
        Just(Statement::ExitReject),
        (0..500i64).prop_map(|v| Statement::SetLocalPreference(IntExpr::Literal(v))),
        (0..20i64).prop_map(|v| Statement::SetMetric(IntExpr::Increment(v))),
        arb_community()
            .prop_map(|c| Statement::AddCommunity(CommunitySetExpr::Literal(vec![c]))),
        arb_community()
            .prop_map(|c| Statement::DeleteCommunity(CommunitySetExpr::Literal(vec![c]))),
    ]
}

/// Statement lists using only constructs every encoder mode supports.
pub fn arb_policy_statements() -> impl Strategy<Value = Vec<Statement>> {
    let stmt = arb_simple_statement().prop_recursive(3, 16, 3, |inner| {
        (
            arb_guard(),
            proptest::collection::vec(inner.clone(), 0..3),
            proptest::collection::vec(inner, 0..3),
        )
            .prop_map(|(g, t, f)| Statement::if_then_else(g, t, f))
    });
    proptest::collection::vec(stmt, 0..4)
}

/// A chain `R0 - R1 - ... - Rn-1` running OSPF on every link, with a stub
/// subnet hanging off the last router.
pub fn arb_ospf_chain() -> impl Strategy<Value = Network> {
    (2..=5usize, proptest::collection::vec(1..10u32, 4)).prop_map(|(n, costs)| {
        let mut net = Network::new();
        for i in 0..n {
            let mut conf = RouterConfig::new(format!("R{i}"));
            let mut ospf = OspfProcess::new(Ip(i as u32 + 1));
            let mut area = Vec::new();
            let mut link = |name: String, subnet: u32, host: u32, cost: Option<u32>| {
                let mut iface = Interface::new(
                    name.clone(),
                    Some(InterfaceAddress::new(Ip((10 << 24) | (subnet << 8) | host), 24)),
                );
                iface.ospf_enabled = true;
                iface.ospf_cost = cost;
                area.push(name);
                iface
            };
            if i > 0 {
                conf.add_interface(link(format!("to{}", i - 1), i as u32, 2, None));
            }
            if i + 1 < n {
                conf.add_interface(link(format!("to{}", i + 1), i as u32 + 1, 1, Some(costs[i % 4])));
            } else {
                conf.add_interface(link("stub".into(), 200, 1, None));
            }
            ospf.areas.insert(0, area);
            conf.ospf = Some(ospf);
            net.add_router(conf);
        }
        net
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::protocol::Protocol;

    proptest! {
        #[test]
        fn chain_links_pair_up(net in arb_ospf_chain()) {
            let n = net.routers.len();
            let g = Graph::new(net).unwrap();
            let linked = g.edges().iter().filter(|e| e.peer.is_some()).count();
            prop_assert_eq!(linked, 2 * (n - 1));
            for e in g.edges().iter().filter(|e| e.peer.is_some()) {
                let back = g.other_end(e.id).unwrap();
                prop_assert_eq!(g.other_end(back), Some(e.id));
                prop_assert!(g.is_edge_used(&e.router, Protocol::Ospf, e.id));
            }
        }

        #[test]
        fn generated_policies_roundtrip(stmts in arb_policy_statements()) {
            let json = serde_json::to_string(&stmts).unwrap();
            let back: Vec<Statement> = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(back, stmts);
        }
    }

    #[test]
    fn prefix_sets_are_explicit() {
        let e = BooleanExpr::match_prefixes(&["10.0.0.0/8".parse().unwrap()]);
        assert!(matches!(e, BooleanExpr::MatchPrefixSet(PrefixSetExpr::Explicit(_))));
    }
}
