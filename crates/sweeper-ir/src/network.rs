//! Per-router configuration: interfaces, routing processes, filters and
//! policies, as handed over by a configuration loader.

use std::cell::RefCell;
use std::collections::HashSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::addr::{Ip, InterfaceAddress, Prefix};
use crate::community::CommunityVar;
use crate::header_space::HeaderSpace;
use crate::policy::{
    walk_expr, walk_statements, BooleanExpr, CommunityList, CommunitySetExpr, LineAction,
    RouteFilterList, RoutingPolicy, Statement,
};

/// Name of the pseudo-interface a discard static route points at.
pub const NULL_INTERFACE_NAME: &str = "null_interface";

/// Substring identifying the policy every BGP export goes through.
pub const BGP_COMMON_FILTER_LIST_NAME: &str = "BGP_COMMON_EXPORT_POLICY";

/// Substring identifying route filter lists of `summary-only` aggregates.
pub const SUPPRESSED_SUMMARY_LIST_NAME: &str = "MATCH_SUPPRESSED_SUMMARY_ONLY";

pub const DEFAULT_REFERENCE_BANDWIDTH: u64 = 100_000_000;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    #[serde(default)]
    pub address: Option<InterfaceAddress>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub loopback: bool,
    #[serde(default)]
    pub ospf_enabled: bool,
    #[serde(default)]
    pub ospf_cost: Option<u32>,
    #[serde(default)]
    pub ospf_area: Option<u32>,
    /// Bits per second.
    #[serde(default)]
    pub bandwidth: Option<u64>,
    /// Inbound ACL name.
    #[serde(default)]
    pub incoming_filter: Option<String>,
    /// Outbound ACL name.
    #[serde(default)]
    pub outgoing_filter: Option<String>,
}

impl Interface {
    pub fn new(name: impl Into<String>, address: Option<InterfaceAddress>) -> Self {
        Interface {
            name: name.into(),
            address,
            active: true,
            loopback: false,
            ospf_enabled: false,
            ospf_cost: None,
            ospf_area: None,
            bandwidth: None,
            incoming_filter: None,
            outgoing_filter: None,
        }
    }

    pub fn is_loopback(&self) -> bool {
        self.loopback || self.name.to_ascii_lowercase().starts_with("loopback")
    }

    pub fn prefix(&self) -> Option<Prefix> {
        self.address.map(InterfaceAddress::prefix)
    }

    pub fn ip(&self) -> Option<Ip> {
        self.address.map(|a| a.ip)
    }

    /// OSPF cost: the configured value, else reference bandwidth over
    /// interface bandwidth, never below 1.
    pub fn effective_ospf_cost(&self, reference_bandwidth: u64) -> i64 {
        if let Some(cost) = self.ospf_cost {
            return i64::from(cost.max(1));
        }
        match self.bandwidth {
            Some(bw) if bw > 0 => (reference_bandwidth / bw).max(1) as i64,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OspfProcess {
    pub router_id: Ip,
    #[serde(default)]
    pub export_policy: Option<String>,
    /// Area number to the names of interfaces in that area.
    #[serde(default)]
    pub areas: IndexMap<u32, Vec<String>>,
    #[serde(default = "OspfProcess::default_reference_bandwidth")]
    pub reference_bandwidth: u64,
}

impl OspfProcess {
    pub fn new(router_id: Ip) -> Self {
        OspfProcess {
            router_id,
            export_policy: None,
            areas: IndexMap::new(),
            reference_bandwidth: DEFAULT_REFERENCE_BANDWIDTH,
        }
    }

    fn default_reference_bandwidth() -> u64 {
        DEFAULT_REFERENCE_BANDWIDTH
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BgpNeighbor {
    /// Prefix the session's remote address must fall in.
    pub peer_prefix: Prefix,
    #[serde(default)]
    pub peer_address: Option<Ip>,
    #[serde(default)]
    pub local_ip: Option<Ip>,
    pub local_as: u32,
    pub remote_as: u32,
    #[serde(default)]
    pub import_policy: Option<String>,
    #[serde(default)]
    pub export_policy: Option<String>,
    #[serde(default)]
    pub send_community: bool,
    #[serde(default)]
    pub route_reflector_client: bool,
}

impl BgpNeighbor {
    pub fn new(peer_address: Ip, local_as: u32, remote_as: u32) -> Self {
        BgpNeighbor {
            peer_prefix: Prefix::host(peer_address),
            peer_address: Some(peer_address),
            local_ip: None,
            local_as,
            remote_as,
            import_policy: None,
            export_policy: None,
            send_community: false,
            route_reflector_client: false,
        }
    }

    pub fn is_ibgp(&self) -> bool {
        self.local_as == self.remote_as
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BgpProcess {
    pub router_id: Ip,
    #[serde(default)]
    pub multipath_ebgp: bool,
    #[serde(default)]
    pub multipath_ibgp: bool,
    #[serde(default)]
    pub neighbors: Vec<BgpNeighbor>,
}

impl BgpProcess {
    pub fn new(router_id: Ip) -> Self {
        BgpProcess {
            router_id,
            multipath_ebgp: false,
            multipath_ibgp: false,
            neighbors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRoute {
    pub network: Prefix,
    #[serde(default)]
    pub next_hop_ip: Option<Ip>,
    #[serde(default)]
    pub next_hop_interface: Option<String>,
    #[serde(default = "StaticRoute::default_admin_cost")]
    pub admin_cost: u32,
}

impl StaticRoute {
    pub fn new(network: Prefix) -> Self {
        StaticRoute {
            network,
            next_hop_ip: None,
            next_hop_interface: None,
            admin_cost: Self::default_admin_cost(),
        }
    }

    fn default_admin_cost() -> u32 {
        1
    }

    pub fn is_null_routed(&self) -> bool {
        self.next_hop_interface.as_deref() == Some(NULL_INTERFACE_NAME)
    }
}

/// An aggregate (generated) route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedRoute {
    pub network: Prefix,
    #[serde(default)]
    pub generation_policy: Option<String>,
    #[serde(default)]
    pub discard: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AclMatch {
    True,
    False,
    HeaderSpace(HeaderSpace),
    And(Vec<AclMatch>),
    Or(Vec<AclMatch>),
    Not(Box<AclMatch>),
    /// Matches what the named ACL permits.
    PermittedBy(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclLine {
    #[serde(default)]
    pub name: String,
    pub action: LineAction,
    pub matches: AclMatch,
}

/// A first-match access list with implicit deny.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    pub name: String,
    pub lines: Vec<AclLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    pub hostname: String,
    /// End host rather than a router.
    #[serde(default)]
    pub host: bool,
    #[serde(default)]
    pub interfaces: IndexMap<String, Interface>,
    #[serde(default)]
    pub ospf: Option<OspfProcess>,
    #[serde(default)]
    pub bgp: Option<BgpProcess>,
    #[serde(default)]
    pub static_routes: Vec<StaticRoute>,
    #[serde(default)]
    pub generated_routes: Vec<GeneratedRoute>,
    #[serde(default)]
    pub acls: IndexMap<String, Acl>,
    #[serde(default)]
    pub route_filter_lists: IndexMap<String, RouteFilterList>,
    #[serde(default)]
    pub community_lists: IndexMap<String, CommunityList>,
    #[serde(default)]
    pub routing_policies: IndexMap<String, RoutingPolicy>,
}

impl RouterConfig {
    pub fn new(hostname: impl Into<String>) -> Self {
        RouterConfig {
            hostname: hostname.into(),
            host: false,
            interfaces: IndexMap::new(),
            ospf: None,
            bgp: None,
            static_routes: Vec::new(),
            generated_routes: Vec::new(),
            acls: IndexMap::new(),
            route_filter_lists: IndexMap::new(),
            community_lists: IndexMap::new(),
            routing_policies: IndexMap::new(),
        }
    }

    pub fn add_interface(&mut self, iface: Interface) {
        self.interfaces.insert(iface.name.clone(), iface);
    }

    pub fn add_policy(&mut self, policy: RoutingPolicy) {
        self.routing_policies.insert(policy.name.clone(), policy);
    }

    pub fn add_acl(&mut self, acl: Acl) {
        self.acls.insert(acl.name.clone(), acl);
    }

    pub fn policy(&self, name: &str) -> Option<&RoutingPolicy> {
        self.routing_policies.get(name)
    }

    /// Walk `statements` and every policy they call, each called policy at
    /// most once.
    pub fn visit_policy(
        &self,
        statements: &[Statement],
        on_stmt: &mut dyn FnMut(&Statement),
        on_expr: &mut dyn FnMut(&BooleanExpr),
    ) {
        let mut seen = HashSet::new();
        self.visit_policy_inner(statements, on_stmt, on_expr, &mut seen);
    }

    fn visit_policy_inner(
        &self,
        statements: &[Statement],
        on_stmt: &mut dyn FnMut(&Statement),
        on_expr: &mut dyn FnMut(&BooleanExpr),
        seen: &mut HashSet<String>,
    ) {
        let called: RefCell<Vec<String>> = RefCell::new(Vec::new());
        walk_statements(
            statements,
            &mut |s| {
                if let Statement::SetDefaultPolicy(name) = s {
                    called.borrow_mut().push(name.clone());
                }
                on_stmt(s)
            },
            &mut |e| {
                if let BooleanExpr::CallPolicy(name) = e {
                    called.borrow_mut().push(name.clone());
                }
                on_expr(e)
            },
        );
        for name in called.into_inner() {
            if seen.insert(name.clone()) {
                if let Some(policy) = self.routing_policies.get(&name) {
                    self.visit_policy_inner(&policy.statements, on_stmt, on_expr, seen);
                }
            }
        }
    }

    /// Community variables named by a community set expression.
    pub fn community_vars(&self, expr: &CommunitySetExpr) -> Vec<CommunityVar> {
        match expr {
            CommunitySetExpr::Literal(vars) => vars.clone(),
            CommunitySetExpr::Named(name) => self
                .community_lists
                .get(name)
                .map(|cl| cl.lines.iter().map(|l| l.community.clone()).collect())
                .unwrap_or_default(),
        }
    }

    /// Every community variable any policy of this router mentions.
    pub fn all_policy_communities(&self) -> Vec<CommunityVar> {
        let mut out = Vec::new();
        for policy in self.routing_policies.values() {
            let exprs: RefCell<Vec<CommunitySetExpr>> = RefCell::new(Vec::new());
            walk_statements(
                &policy.statements,
                &mut |s| match s {
                    Statement::AddCommunity(e)
                    | Statement::SetCommunity(e)
                    | Statement::DeleteCommunity(e) => exprs.borrow_mut().push(e.clone()),
                    _ => {}
                },
                &mut |e| {
                    if let BooleanExpr::MatchCommunitySet(c) = e {
                        exprs.borrow_mut().push(c.clone());
                    }
                },
            );
            for e in &exprs.into_inner() {
                out.extend(self.community_vars(e));
            }
        }
        out
    }

    /// Interface owning `ip`, if any.
    pub fn interface_with_ip(&self, ip: Ip) -> Option<&Interface> {
        self.interfaces.values().find(|i| i.ip() == Some(ip))
    }
}

/// The whole network: router configurations keyed by hostname.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub routers: IndexMap<String, RouterConfig>,
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_router(&mut self, config: RouterConfig) {
        self.routers.insert(config.hostname.clone(), config);
    }

    pub fn router(&self, name: &str) -> Option<&RouterConfig> {
        self.routers.get(name)
    }

    pub fn router_mut(&mut self, name: &str) -> Option<&mut RouterConfig> {
        self.routers.get_mut(name)
    }
}

/// Collects every `BooleanExpr` under `expr`, used by tests and analyses
/// that need a flat view.
pub fn flatten_expr(expr: &BooleanExpr) -> Vec<BooleanExpr> {
    let mut out = Vec::new();
    walk_expr(expr, &mut |e| out.push(e.clone()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{IntExpr, RoutingPolicy};

    #[test]
    fn visit_follows_calls_once() {
        let mut r = RouterConfig::new("r1");
        r.add_policy(RoutingPolicy::new(
            "inner",
            vec![
                Statement::SetLocalPreference(IntExpr::Literal(300)),
                Statement::if_then(BooleanExpr::CallPolicy("outer".into()), vec![]),
            ],
        ));
        r.add_policy(RoutingPolicy::new(
            "outer",
            vec![Statement::if_then(
                BooleanExpr::CallPolicy("inner".into()),
                vec![Statement::ExitAccept],
            )],
        ));
        let mut set_lp = 0;
        let outer = r.policy("outer").unwrap().statements.clone();
        r.visit_policy(
            &outer,
            &mut |s| {
                if matches!(s, Statement::SetLocalPreference(_)) {
                    set_lp += 1;
                }
            },
            &mut |_| {},
        );
        assert_eq!(set_lp, 1);
    }

    #[test]
    fn visit_follows_default_policies_and_guard_calls() {
        let mut r = RouterConfig::new("r1");
        r.add_policy(RoutingPolicy::new("fallback", vec![Statement::ExitReject]));
        r.add_policy(RoutingPolicy::new("guard", vec![Statement::ExitAccept]));
        let top = vec![
            Statement::SetDefaultPolicy("fallback".into()),
            Statement::if_then(BooleanExpr::CallPolicy("guard".into()), vec![]),
        ];
        let mut exits = Vec::new();
        r.visit_policy(
            &top,
            &mut |s| {
                if matches!(s, Statement::ExitAccept | Statement::ExitReject) {
                    exits.push(s.clone());
                }
            },
            &mut |_| {},
        );
        assert_eq!(exits, vec![Statement::ExitReject, Statement::ExitAccept]);
    }

    #[test]
    fn policy_communities_come_from_matches_and_setters() {
        let mut r = RouterConfig::new("r1");
        let c = |v: &str| CommunityVar::Exact(v.into());
        r.add_policy(RoutingPolicy::new(
            "tagging",
            vec![Statement::if_then(
                BooleanExpr::MatchCommunitySet(CommunitySetExpr::Literal(vec![c("65000:1")])),
                vec![
                    Statement::AddCommunity(CommunitySetExpr::Literal(vec![c("65000:2")])),
                    Statement::DeleteCommunity(CommunitySetExpr::Literal(vec![c("65000:3")])),
                ],
            )],
        ));
        let mut found = r.all_policy_communities();
        found.sort();
        assert_eq!(found, vec![c("65000:1"), c("65000:2"), c("65000:3")]);
    }

    #[test]
    fn ospf_cost_from_bandwidth() {
        let mut i = Interface::new("eth0", None);
        assert_eq!(i.effective_ospf_cost(100_000_000), 1);
        i.bandwidth = Some(10_000_000);
        assert_eq!(i.effective_ospf_cost(100_000_000), 10);
        i.ospf_cost = Some(7);
        assert_eq!(i.effective_ospf_cost(100_000_000), 7);
    }

    #[test]
    fn router_config_deserializes_with_defaults() {
        let json = r#"{
            "hostname": "r1",
            "interfaces": {
                "eth0": { "name": "eth0", "address": "10.0.0.1/24" }
            }
        }"#;
        let r: RouterConfig = serde_json::from_str(json).unwrap();
        let eth0 = &r.interfaces["eth0"];
        assert!(eth0.active);
        assert_eq!(eth0.prefix().unwrap().to_string(), "10.0.0.0/24");
        assert!(r.bgp.is_none());
    }
}
