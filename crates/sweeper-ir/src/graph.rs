//! Topology graph inferred from a `Network`.
//!
//! Physical edges come from interfaces sharing a subnet on different
//! routers. On top of those the graph adds null-route edges for discard
//! static routes and abstract edges for iBGP sessions, classifies BGP
//! peerings, and collects the community variables every policy mentions.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;

use indexmap::{IndexMap, IndexSet};
use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::addr::{InterfaceAddress, Prefix, MAX_PREFIX_LENGTH};
use crate::community::CommunityVar;
use crate::network::{
    BgpNeighbor, Interface, Network, RouterConfig, StaticRoute, BGP_COMMON_FILTER_LIST_NAME,
    NULL_INTERFACE_NAME,
};
use crate::policy::{BooleanExpr, PrefixSetExpr, RoutingPolicy};
use crate::protocol::{BgpSendType, Protocol, RoutingProtocol};

/// Name prefix of the synthetic interfaces behind abstract iBGP edges.
pub const IBGP_INTERFACE_PREFIX: &str = "iBGP-";

#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("Unknown router '{0}'")]
    #[diagnostic(code(sweeper::graph::unknown_router))]
    UnknownRouter(String),
    #[error("Interface '{iface}' on '{router}' references unknown ACL '{acl}'")]
    #[diagnostic(
        code(sweeper::graph::unknown_acl),
        help("define the ACL or remove the filter from the interface")
    )]
    UnknownAcl {
        router: String,
        iface: String,
        acl: String,
    },
    #[error("Router '{router}' references unknown routing policy '{policy}'")]
    #[diagnostic(code(sweeper::graph::unknown_policy))]
    UnknownPolicy { router: String, policy: String },
    #[error("Invalid community regex '{regex}': {reason}")]
    #[diagnostic(code(sweeper::graph::community_regex))]
    InvalidCommunityRegex { regex: String, reason: String },
    #[error("Unable to find router id for edge {edge} ({protocol})")]
    #[diagnostic(code(sweeper::graph::router_id))]
    MissingRouterId { edge: String, protocol: Protocol },
    #[error("Edge {0} is not a BGP edge")]
    #[diagnostic(code(sweeper::graph::bgp_edge))]
    InvalidBgpEdge(String),
}

/// Index of an edge in the graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EdgeId(pub usize);

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// A directed edge leaving `router` through interface `start`.
///
/// `peer` and `end` are absent for edges leading outside the modelled
/// network. Abstract edges stand for iBGP sessions; null edges stand for
/// discard static routes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphEdge {
    pub id: EdgeId,
    pub router: String,
    pub peer: Option<String>,
    pub start: Interface,
    pub end: Option<Interface>,
    pub is_abstract: bool,
    pub is_null_edge: bool,
}

impl GraphEdge {
    pub fn start_prefix(&self) -> Option<Prefix> {
        self.start.prefix()
    }
}

impl fmt::Display for GraphEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.router, self.start.name)?;
        if let (Some(peer), Some(end)) = (&self.peer, &self.end) {
            write!(f, " --> {},{}", peer, end.name)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Graph {
    network: Network,
    edges: Vec<GraphEdge>,
    edge_map: IndexMap<String, Vec<EdgeId>>,
    neighbors: IndexMap<String, IndexSet<String>>,
    other_end: HashMap<EdgeId, EdgeId>,
    static_routes: HashMap<EdgeId, Vec<StaticRoute>>,
    ebgp_neighbors: HashMap<EdgeId, BgpNeighbor>,
    ibgp_neighbors: HashMap<EdgeId, BgpNeighbor>,
    route_reflector_parent: IndexMap<String, String>,
    route_reflector_clients: IndexMap<String, IndexSet<String>>,
    originator_id: IndexMap<String, i64>,
    area_ids: IndexMap<String, IndexSet<u32>>,
    domain_of: IndexMap<String, usize>,
    domains: Vec<IndexSet<String>>,
    all_communities: BTreeSet<CommunityVar>,
    community_dependencies: BTreeMap<CommunityVar, Vec<CommunityVar>>,
    named_communities: IndexMap<String, String>,
    has_static_route_with_dynamic_next_hop: bool,
}

impl Graph {
    pub fn new(network: Network) -> Result<Graph, GraphError> {
        validate_references(&network)?;
        let mut g = Graph {
            network,
            edges: Vec::new(),
            edge_map: IndexMap::new(),
            neighbors: IndexMap::new(),
            other_end: HashMap::new(),
            static_routes: HashMap::new(),
            ebgp_neighbors: HashMap::new(),
            ibgp_neighbors: HashMap::new(),
            route_reflector_parent: IndexMap::new(),
            route_reflector_clients: IndexMap::new(),
            originator_id: IndexMap::new(),
            area_ids: IndexMap::new(),
            domain_of: IndexMap::new(),
            domains: Vec::new(),
            all_communities: BTreeSet::new(),
            community_dependencies: BTreeMap::new(),
            named_communities: IndexMap::new(),
            has_static_route_with_dynamic_next_hop: false,
        };
        g.init_edges();
        g.init_static_routes();
        g.init_ebgp_neighbors();
        g.init_ibgp_neighbors();
        g.init_area_ids();
        g.init_domains();
        g.init_communities()?;
        debug!(
            routers = g.network.routers.len(),
            edges = g.edges.len(),
            communities = g.all_communities.len(),
            "built topology graph"
        );
        Ok(g)
    }

    /// A graph over the subset of `routers`; edges towards dropped routers
    /// become edges to the outside.
    pub fn restricted(&self, routers: &IndexSet<String>) -> Result<Graph, GraphError> {
        let mut network = Network::new();
        for r in routers {
            let conf = self
                .network
                .router(r)
                .ok_or_else(|| GraphError::UnknownRouter(r.clone()))?;
            network.add_router(conf.clone());
        }
        Graph::new(network)
    }

    fn push_edge(&mut self, mut edge: GraphEdge) -> EdgeId {
        let id = EdgeId(self.edges.len());
        edge.id = id;
        self.edge_map.entry(edge.router.clone()).or_default().push(id);
        self.edges.push(edge);
        id
    }

    fn init_edges(&mut self) {
        let mut by_iface: HashMap<(String, String), EdgeId> = HashMap::new();
        let mut pending: Vec<(EdgeId, String, String)> = Vec::new();
        let routers: Vec<RouterConfig> = self.network.routers.values().cloned().collect();

        for conf in &routers {
            self.edge_map.entry(conf.hostname.clone()).or_default();
            let mut neighs = IndexSet::new();
            for iface in conf.interfaces.values() {
                let Some(addr) = iface.address else {
                    continue;
                };
                let remote: Vec<(&RouterConfig, &Interface)> = routers
                    .iter()
                    .filter(|other| other.hostname != conf.hostname)
                    .flat_map(|other| other.interfaces.values().map(move |i| (other, i)))
                    .filter(|(_, i)| {
                        i.address
                            .is_some_and(|a| a.prefix() == addr.prefix() && a.ip != addr.ip)
                    })
                    .collect();
                if remote.len() != 1 {
                    self.push_edge(GraphEdge {
                        id: EdgeId(0),
                        router: conf.hostname.clone(),
                        peer: None,
                        start: iface.clone(),
                        end: None,
                        is_abstract: false,
                        is_null_edge: false,
                    });
                    continue;
                }
                let (peer_conf, peer_iface) = remote[0];
                let id = self.push_edge(GraphEdge {
                    id: EdgeId(0),
                    router: conf.hostname.clone(),
                    peer: Some(peer_conf.hostname.clone()),
                    start: iface.clone(),
                    end: Some(peer_iface.clone()),
                    is_abstract: false,
                    is_null_edge: false,
                });
                by_iface.insert((conf.hostname.clone(), iface.name.clone()), id);
                pending.push((id, peer_conf.hostname.clone(), peer_iface.name.clone()));
                neighs.insert(peer_conf.hostname.clone());
            }
            self.neighbors.insert(conf.hostname.clone(), neighs);
        }

        for (id, peer, peer_iface) in pending {
            if let Some(other) = by_iface.get(&(peer, peer_iface)) {
                self.other_end.insert(id, *other);
            }
        }
    }

    fn init_static_routes(&mut self) {
        let routers: Vec<RouterConfig> = self.network.routers.values().cloned().collect();
        for conf in &routers {
            let edge_ids = self.edge_map.get(&conf.hostname).cloned().unwrap_or_default();
            for sr in &conf.static_routes {
                if sr.is_null_routed() {
                    let mut iface = Interface::new(
                        NULL_INTERFACE_NAME,
                        Some(InterfaceAddress::new(sr.network.start_ip(), sr.network.len())),
                    );
                    iface.bandwidth = Some(0);
                    let id = self.push_edge(GraphEdge {
                        id: EdgeId(0),
                        router: conf.hostname.clone(),
                        peer: None,
                        start: iface,
                        end: None,
                        is_abstract: false,
                        is_null_edge: true,
                    });
                    self.static_routes.entry(id).or_default().push(sr.clone());
                    continue;
                }
                let mut matched = false;
                for id in &edge_ids {
                    let ge = &self.edges[id.0];
                    let by_name = sr.next_hop_interface.as_deref() == Some(ge.start.name.as_str());
                    let by_ip = match (sr.next_hop_ip, ge.end.as_ref().and_then(Interface::ip)) {
                        (Some(nh), Some(there)) => nh == there,
                        _ => false,
                    };
                    if by_name || by_ip {
                        matched = true;
                        self.static_routes.entry(*id).or_default().push(sr.clone());
                    }
                }
                if !matched {
                    self.has_static_route_with_dynamic_next_hop = true;
                }
            }
        }
    }

    fn init_ebgp_neighbors(&mut self) {
        for (router, conf) in &self.network.routers {
            let Some(bgp) = &conf.bgp else { continue };
            let Some(ids) = self.edge_map.get(router) else {
                continue;
            };
            for id in ids {
                let ge = &self.edges[id.0];
                if ge.is_null_edge {
                    continue;
                }
                let Some(prefix) = ge.start_prefix() else {
                    continue;
                };
                for n in &bgp.neighbors {
                    if n.is_ibgp() {
                        continue;
                    }
                    if n.peer_address.is_some_and(|ip| prefix.contains_ip(ip)) {
                        self.ebgp_neighbors.insert(*id, n.clone());
                    }
                }
            }
        }
    }

    /// Matches iBGP sessions: router -> peer -> the router's neighbor config.
    fn ibgp_session_table(&self) -> IndexMap<String, IndexMap<String, BgpNeighbor>> {
        let mut local_ips: IndexMap<&str, Vec<crate::addr::Ip>> = IndexMap::new();
        for (router, conf) in &self.network.routers {
            let Some(bgp) = &conf.bgp else { continue };
            for n in bgp.neighbors.iter().filter(|n| n.is_ibgp()) {
                if let Some(ip) = n.local_ip {
                    local_ips.entry(router.as_str()).or_default().push(ip);
                }
            }
        }

        let mut table: IndexMap<String, IndexMap<String, BgpNeighbor>> = IndexMap::new();
        for (router, conf) in &self.network.routers {
            let Some(bgp) = &conf.bgp else { continue };
            for n in bgp.neighbors.iter().filter(|n| n.is_ibgp()) {
                for (candidate, ips) in &local_ips {
                    if *candidate != router.as_str() && ips.iter().any(|ip| n.peer_prefix.contains_ip(*ip)) {
                        table
                            .entry(router.clone())
                            .or_default()
                            .insert((*candidate).to_string(), n.clone());
                    }
                }
            }
        }
        table
    }

    fn ibgp_interface(n: &BgpNeighbor, peer: &str) -> Interface {
        let ip = n.peer_address.unwrap_or_else(|| n.peer_prefix.ip());
        let mut iface = Interface::new(
            format!("{IBGP_INTERFACE_PREFIX}{peer}"),
            Some(InterfaceAddress::new(ip, MAX_PREFIX_LENGTH)),
        );
        iface.bandwidth = Some(0);
        iface
    }

    fn init_ibgp_neighbors(&mut self) {
        let table = self.ibgp_session_table();
        let mut reverse: IndexMap<(String, String), EdgeId> = IndexMap::new();

        for (r1, row) in &table {
            for (r2, n1) in row {
                let start = Self::ibgp_interface(n1, r2);
                let (peer, end) = match table.get(r2).and_then(|back| back.get(r1)) {
                    Some(n2) => (Some(r2.clone()), Some(Self::ibgp_interface(n2, r1))),
                    None => (None, None),
                };
                let id = self.push_edge(GraphEdge {
                    id: EdgeId(0),
                    router: r1.clone(),
                    peer,
                    start,
                    end,
                    is_abstract: true,
                    is_null_edge: false,
                });
                self.ibgp_neighbors.insert(id, n1.clone());
                reverse.insert((r1.clone(), r2.clone()), id);
            }
        }

        for ((r1, r2), id) in &reverse {
            if let Some(other) = reverse.get(&(r2.clone(), r1.clone())) {
                self.other_end.insert(*id, *other);
            }
        }

        let mut next_id = 1;
        for (r1, row) in &table {
            if !self.originator_id.contains_key(r1) {
                self.originator_id.insert(r1.clone(), next_id);
                next_id += 1;
            }
            let mut clients = IndexSet::new();
            for (r2, n) in row {
                if n.route_reflector_client {
                    clients.insert(r2.clone());
                    self.route_reflector_parent.insert(r2.clone(), r1.clone());
                }
            }
            self.route_reflector_clients.insert(r1.clone(), clients);
        }
    }

    fn init_area_ids(&mut self) {
        for (router, conf) in &self.network.routers {
            let ids = conf
                .ospf
                .as_ref()
                .map(|p| p.areas.keys().copied().collect())
                .unwrap_or_default();
            self.area_ids.insert(router.clone(), ids);
        }
    }

    /// Routers reachable from `router` without crossing an eBGP edge.
    fn find_domain(&self, router: &str) -> IndexSet<String> {
        let mut same = IndexSet::new();
        let mut todo = VecDeque::new();
        same.insert(router.to_string());
        todo.push_back(router.to_string());
        while let Some(current) = todo.pop_front() {
            for id in self.edges_of(&current) {
                let ge = &self.edges[id.0];
                if let Some(peer) = &ge.peer {
                    if !same.contains(peer) && !self.ebgp_neighbors.contains_key(id) {
                        same.insert(peer.clone());
                        todo.push_back(peer.clone());
                    }
                }
            }
        }
        same
    }

    fn init_domains(&mut self) {
        for router in self.network.routers.keys() {
            if self.domain_of.contains_key(router) {
                continue;
            }
            let domain = self.find_domain(router);
            let idx = self.domains.len();
            for r in &domain {
                self.domain_of.insert(r.clone(), idx);
            }
            self.domains.push(domain);
        }
    }

    fn init_communities(&mut self) -> Result<(), GraphError> {
        let mut comms = BTreeSet::new();
        for conf in self.network.routers.values() {
            comms.extend(conf.all_policy_communities());
        }
        let others: Vec<CommunityVar> = comms
            .iter()
            .filter(|c| c.is_regex())
            .map(|c| CommunityVar::Other(c.value().to_string()))
            .collect();
        comms.extend(others);

        for c in comms.iter().filter(|c| c.is_regex()) {
            let re = regex::Regex::new(c.value()).map_err(|e| GraphError::InvalidCommunityRegex {
                regex: c.value().to_string(),
                reason: e.to_string(),
            })?;
            let deps = comms
                .iter()
                .filter(|other| match other {
                    CommunityVar::Exact(v) => re.is_match(v),
                    CommunityVar::Other(v) => v == c.value(),
                    CommunityVar::Regex(_) => false,
                })
                .cloned()
                .collect();
            self.community_dependencies.insert(c.clone(), deps);
        }

        for conf in self.network.routers.values() {
            for (name, cl) in &conf.community_lists {
                if let [line] = cl.lines.as_slice() {
                    if let CommunityVar::Regex(re) = &line.community {
                        self.named_communities.insert(re.clone(), name.clone());
                    }
                }
            }
        }
        self.all_communities = comms;
        Ok(())
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn routers(&self) -> impl Iterator<Item = &String> {
        self.network.routers.keys()
    }

    pub fn config(&self, router: &str) -> Option<&RouterConfig> {
        self.network.router(router)
    }

    pub fn edge(&self, id: EdgeId) -> &GraphEdge {
        &self.edges[id.0]
    }

    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    /// Non-abstract edges.
    pub fn real_edges(&self) -> impl Iterator<Item = &GraphEdge> {
        self.edges.iter().filter(|e| !e.is_abstract)
    }

    pub fn edge_map(&self) -> &IndexMap<String, Vec<EdgeId>> {
        &self.edge_map
    }

    pub fn edges_of(&self, router: &str) -> &[EdgeId] {
        self.edge_map.get(router).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn neighbors(&self, router: &str) -> Option<&IndexSet<String>> {
        self.neighbors.get(router)
    }

    pub fn other_end(&self, id: EdgeId) -> Option<EdgeId> {
        self.other_end.get(&id).copied()
    }

    pub fn static_routes_on(&self, id: EdgeId) -> &[StaticRoute] {
        self.static_routes.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_static_route_with_dynamic_next_hop(&self) -> bool {
        self.has_static_route_with_dynamic_next_hop
    }

    pub fn ebgp_neighbor(&self, id: EdgeId) -> Option<&BgpNeighbor> {
        self.ebgp_neighbors.get(&id)
    }

    pub fn ibgp_neighbor(&self, id: EdgeId) -> Option<&BgpNeighbor> {
        self.ibgp_neighbors.get(&id)
    }

    pub fn ebgp_edges(&self) -> impl Iterator<Item = EdgeId> + '_ {
        let mut ids: Vec<EdgeId> = self.ebgp_neighbors.keys().copied().collect();
        ids.sort();
        ids.into_iter()
    }

    pub fn has_ibgp(&self) -> bool {
        !self.ibgp_neighbors.is_empty()
    }

    /// Routers with at least one iBGP session.
    pub fn ibgp_routers(&self) -> IndexSet<String> {
        let mut ids: Vec<&EdgeId> = self.ibgp_neighbors.keys().collect();
        ids.sort();
        ids.into_iter()
            .map(|id| self.edges[id.0].router.clone())
            .collect()
    }

    pub fn find_bgp_neighbor(&self, id: EdgeId) -> Option<&BgpNeighbor> {
        if self.edges[id.0].is_abstract {
            self.ibgp_neighbors.get(&id)
        } else {
            self.ebgp_neighbors.get(&id)
        }
    }

    /// An edge leaving the network towards an external eBGP peer.
    pub fn is_external(&self, id: EdgeId) -> bool {
        self.edges[id.0].peer.is_none() && self.ebgp_neighbors.contains_key(&id)
    }

    pub fn route_reflector_parent(&self, router: &str) -> Option<&String> {
        self.route_reflector_parent.get(router)
    }

    pub fn has_route_reflectors(&self) -> bool {
        !self.route_reflector_parent.is_empty()
    }

    pub fn route_reflector_clients(&self, router: &str) -> Option<&IndexSet<String>> {
        self.route_reflector_clients.get(router)
    }

    pub fn originator_id(&self, router: &str) -> Option<i64> {
        self.originator_id.get(router).copied()
    }

    pub fn originator_ids(&self) -> &IndexMap<String, i64> {
        &self.originator_id
    }

    pub fn area_ids(&self, router: &str) -> Option<&IndexSet<u32>> {
        self.area_ids.get(router)
    }

    /// Routers in the same autonomous system as `router`.
    pub fn domain(&self, router: &str) -> Option<&IndexSet<String>> {
        self.domain_of.get(router).map(|i| &self.domains[*i])
    }

    pub fn all_communities(&self) -> &BTreeSet<CommunityVar> {
        &self.all_communities
    }

    /// For each regex variable: the exact variables it matches plus its
    /// `Other` variable.
    pub fn community_dependencies(&self) -> &BTreeMap<CommunityVar, Vec<CommunityVar>> {
        &self.community_dependencies
    }

    /// Regex to the name of the single-line community list matching it.
    pub fn named_communities(&self) -> &IndexMap<String, String> {
        &self.named_communities
    }

    pub fn is_host(&self, router: &str) -> bool {
        self.network.router(router).is_some_and(|c| c.host)
    }

    pub fn is_loopback(&self, id: EdgeId) -> bool {
        self.edges[id.0].start.is_loopback()
    }

    pub fn is_interface_active(proto: Protocol, iface: &Interface) -> bool {
        if proto.is_ospf() {
            iface.active && iface.ospf_enabled
        } else {
            iface.active
        }
    }

    /// Whether `proto` on `router` may send or receive over edge `id`.
    pub fn is_edge_used(&self, router: &str, proto: Protocol, id: EdgeId) -> bool {
        let ge = &self.edges[id.0];
        if ge.is_null_edge {
            return proto.is_static();
        }
        let iface = &ge.start;
        if !Self::is_interface_active(proto, iface) {
            return false;
        }
        if iface.name.starts_with(IBGP_INTERFACE_PREFIX) {
            return proto.is_bgp();
        }
        if iface.is_loopback() {
            return proto.is_connected();
        }
        let external = match &ge.peer {
            None => true,
            Some(peer) => self.is_host(peer),
        };
        if external && proto.is_ospf() {
            return false;
        }
        if proto.is_static() {
            debug_assert_eq!(router, ge.router);
            return !self.static_routes_on(id).is_empty();
        }
        if proto.is_bgp() {
            return self.ebgp_neighbors.contains_key(&id) || self.ibgp_neighbors.contains_key(&id);
        }
        true
    }

    /// Router id of the neighbor across `id`; 0 for protocols that do not
    /// compare router ids.
    pub fn find_router_id(&self, id: EdgeId, proto: Protocol) -> Result<i64, GraphError> {
        if proto.is_ospf() || proto.is_connected() || proto.is_static() {
            return Ok(0);
        }
        let missing = || GraphError::MissingRouterId {
            edge: self.edges[id.0].to_string(),
            protocol: proto,
        };
        if let Some(other) = self.other_end(id) {
            let peer = &self.edges[other.0].router;
            let conf = self.network.router(peer).ok_or_else(missing)?;
            return match proto {
                Protocol::Bgp => conf.bgp.as_ref().map(|b| b.router_id.as_i64()).ok_or_else(missing),
                _ => Ok(0),
            };
        }
        self.find_bgp_neighbor(id)
            .and_then(|n| n.peer_address)
            .map(|ip| ip.as_i64())
            .ok_or_else(missing)
    }

    pub fn peer_type(&self, id: EdgeId) -> Result<BgpSendType, GraphError> {
        if self.ebgp_neighbors.contains_key(&id) {
            return Ok(BgpSendType::ToEbgp);
        }
        if self.ibgp_neighbors.contains_key(&id) {
            let ge = &self.edges[id.0];
            let is_client_of = |parent: &str, child: &str| {
                self.route_reflector_clients
                    .get(parent)
                    .is_some_and(|c| c.contains(child))
            };
            if let Some(peer) = &ge.peer {
                if is_client_of(peer, &ge.router) {
                    return Ok(BgpSendType::ToRr);
                }
                if is_client_of(&ge.router, peer) {
                    return Ok(BgpSendType::ToClient);
                }
            }
            return Ok(BgpSendType::ToNonClient);
        }
        Err(GraphError::InvalidBgpEdge(self.edges[id.0].to_string()))
    }

    pub fn find_import_routing_policy(
        &self,
        router: &str,
        proto: Protocol,
        id: EdgeId,
    ) -> Option<&RoutingPolicy> {
        let conf = self.network.router(router)?;
        match proto {
            Protocol::Bgp => {
                let name = self.find_bgp_neighbor(id)?.import_policy.as_ref()?;
                conf.policy(name)
            }
            _ => None,
        }
    }

    pub fn find_export_routing_policy(
        &self,
        router: &str,
        proto: Protocol,
        id: EdgeId,
    ) -> Option<&RoutingPolicy> {
        let conf = self.network.router(router)?;
        match proto {
            Protocol::Ospf => conf.policy(conf.ospf.as_ref()?.export_policy.as_ref()?),
            Protocol::Bgp => {
                let name = self.find_bgp_neighbor(id)?.export_policy.as_ref()?;
                conf.policy(name)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "---------- Router to edges map ----------")?;
        for (router, ids) in &self.edge_map {
            writeln!(f, "Router: {router}")?;
            for id in ids {
                writeln!(f, "  edge: {}", self.edges[id.0])?;
            }
        }
        writeln!(f, "---------- Neighbors of each router ----------")?;
        for (router, ns) in &self.neighbors {
            let ns: Vec<&str> = ns.iter().map(String::as_str).collect();
            writeln!(f, "Router: {router} -> {}", ns.join(", "))?;
        }
        writeln!(f, "---------- eBGP Neighbors ----------")?;
        for id in self.ebgp_edges() {
            writeln!(f, "  {}", self.edges[id.0])?;
        }
        writeln!(f, "---------- iBGP Neighbors ----------")?;
        let mut ibgp: Vec<&EdgeId> = self.ibgp_neighbors.keys().collect();
        ibgp.sort();
        for id in ibgp {
            writeln!(f, "  {}", self.edges[id.0])?;
        }
        Ok(())
    }
}

/// The policy every route of `proto` is exported through, if any.
pub fn find_common_routing_policy(conf: &RouterConfig, proto: Protocol) -> Option<&RoutingPolicy> {
    match proto {
        Protocol::Ospf => conf.policy(conf.ospf.as_ref()?.export_policy.as_ref()?),
        Protocol::Bgp => conf
            .routing_policies
            .iter()
            .find(|(name, _)| name.contains(BGP_COMMON_FILTER_LIST_NAME))
            .map(|(_, p)| p),
        _ => None,
    }
}

/// Prefixes `conf` originates into `proto`. Connected and static routes
/// count as originating their prefixes.
pub fn originated_networks(conf: &RouterConfig, proto: Protocol) -> IndexSet<Prefix> {
    let mut acc = IndexSet::new();
    match proto {
        Protocol::Ospf => {
            let Some(ospf) = &conf.ospf else { return acc };
            for ifaces in ospf.areas.values() {
                for name in ifaces {
                    if let Some(iface) = conf.interfaces.get(name) {
                        if iface.active && iface.ospf_enabled {
                            acc.extend(iface.prefix());
                        }
                    }
                }
            }
        }
        Protocol::Bgp => {
            let Some(common) = find_common_routing_policy(conf, Protocol::Bgp) else {
                return acc;
            };
            conf.visit_policy(&common.statements, &mut |_| {}, &mut |e| {
                if let BooleanExpr::Conjunction(cs) = e {
                    if let [BooleanExpr::MatchPrefixSet(PrefixSetExpr::Explicit(ranges)), BooleanExpr::Not(inner), ..] =
                        cs.as_slice()
                    {
                        if let BooleanExpr::MatchProtocol(ps) = inner.as_ref() {
                            if ps.contains(&RoutingProtocol::Bgp) {
                                acc.extend(ranges.iter().map(|r| r.prefix));
                            }
                        }
                    }
                }
            });
        }
        Protocol::Connected => {
            acc.extend(conf.interfaces.values().filter_map(Interface::prefix));
        }
        Protocol::Static => {
            acc.extend(conf.static_routes.iter().map(|sr| sr.network));
        }
        Protocol::Best => {}
    }
    acc
}

/// Prefixes `conf` originates into any protocol it runs.
pub fn all_originated_networks(conf: &RouterConfig) -> IndexSet<Prefix> {
    let mut acc = IndexSet::new();
    if conf.ospf.is_some() {
        acc.extend(originated_networks(conf, Protocol::Ospf));
    }
    if conf.bgp.is_some() {
        acc.extend(originated_networks(conf, Protocol::Bgp));
    }
    acc.extend(originated_networks(conf, Protocol::Static));
    acc.extend(originated_networks(conf, Protocol::Connected));
    acc
}

/// Protocols a policy may redistribute into `proto`, judged by the
/// protocols its `MatchProtocol` clauses mention.
pub fn find_redistributed_protocols(
    conf: &RouterConfig,
    policy: &RoutingPolicy,
    proto: Protocol,
) -> IndexSet<Protocol> {
    let mut protos = IndexSet::new();
    conf.visit_policy(&policy.statements, &mut |_| {}, &mut |e| {
        if let BooleanExpr::MatchProtocol(ps) = e {
            for p in ps {
                if let Some(other) = Protocol::from_routing_protocol(*p) {
                    if other != proto {
                        protos.insert(other);
                    }
                }
            }
        }
    });
    protos
}

fn validate_references(network: &Network) -> Result<(), GraphError> {
    for (router, conf) in &network.routers {
        for iface in conf.interfaces.values() {
            for acl in [&iface.incoming_filter, &iface.outgoing_filter].into_iter().flatten() {
                if !conf.acls.contains_key(acl) {
                    return Err(GraphError::UnknownAcl {
                        router: router.clone(),
                        iface: iface.name.clone(),
                        acl: acl.clone(),
                    });
                }
            }
        }
        let mut referenced: Vec<&String> = Vec::new();
        if let Some(bgp) = &conf.bgp {
            for n in &bgp.neighbors {
                referenced.extend(n.import_policy.iter());
                referenced.extend(n.export_policy.iter());
            }
        }
        if let Some(ospf) = &conf.ospf {
            referenced.extend(ospf.export_policy.iter());
        }
        for policy in referenced {
            if !conf.routing_policies.contains_key(policy) {
                return Err(GraphError::UnknownPolicy {
                    router: router.clone(),
                    policy: policy.clone(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Ip;
    use crate::network::{BgpProcess, OspfProcess};
    use crate::policy::{CommunityList, CommunityListLine, CommunitySetExpr, LineAction, Statement};

    fn iface(name: &str, addr: &str) -> Interface {
        Interface::new(name, Some(addr.parse().unwrap()))
    }

    fn ip(s: &str) -> Ip {
        s.parse().unwrap()
    }

    fn line_network() -> Network {
        let mut a = RouterConfig::new("A");
        a.add_interface(iface("eth0", "10.0.1.1/24"));
        let mut b = RouterConfig::new("B");
        b.add_interface(iface("eth0", "10.0.1.2/24"));
        b.add_interface(iface("eth1", "10.0.2.1/24"));
        let mut c = RouterConfig::new("C");
        c.add_interface(iface("eth0", "10.0.2.2/24"));
        c.add_interface(iface("host", "192.168.0.1/24"));
        let mut net = Network::new();
        for r in [a, b, c] {
            net.add_router(r);
        }
        net
    }

    #[test]
    fn infers_links_by_shared_subnet() {
        let g = Graph::new(line_network()).unwrap();
        assert_eq!(g.edges_of("A").len(), 1);
        assert_eq!(g.edges_of("B").len(), 2);
        let ab = g.edges_of("A")[0];
        assert_eq!(g.edge(ab).peer.as_deref(), Some("B"));
        let ba = g.other_end(ab).unwrap();
        assert_eq!(g.edge(ba).router, "B");
        assert_eq!(g.other_end(ba), Some(ab));
        let peerless: Vec<_> = g
            .edges_of("C")
            .iter()
            .filter(|id| g.edge(**id).peer.is_none())
            .collect();
        assert_eq!(peerless.len(), 1);
        assert_eq!(g.domain("A").unwrap().len(), 3);
    }

    #[test]
    fn null_static_route_gets_its_own_edge() {
        let mut net = line_network();
        let mut sr = StaticRoute::new("172.16.0.0/16".parse().unwrap());
        sr.next_hop_interface = Some(NULL_INTERFACE_NAME.into());
        net.router_mut("A").unwrap().static_routes.push(sr);
        let g = Graph::new(net).unwrap();
        let null = g
            .edges_of("A")
            .iter()
            .copied()
            .find(|id| g.edge(*id).is_null_edge)
            .unwrap();
        assert!(g.is_edge_used("A", Protocol::Static, null));
        assert!(!g.is_edge_used("A", Protocol::Ospf, null));
        assert_eq!(g.static_routes_on(null).len(), 1);
    }

    #[test]
    fn static_route_binds_to_next_hop_edge() {
        let mut net = line_network();
        let mut sr = StaticRoute::new("192.168.0.0/24".parse().unwrap());
        sr.next_hop_ip = Some(ip("10.0.2.2"));
        net.router_mut("B").unwrap().static_routes.push(sr);
        let g = Graph::new(net).unwrap();
        let bc = g
            .edges_of("B")
            .iter()
            .copied()
            .find(|id| g.edge(*id).peer.as_deref() == Some("C"))
            .unwrap();
        assert!(g.is_edge_used("B", Protocol::Static, bc));
        assert!(!g.has_static_route_with_dynamic_next_hop());
    }

    #[test]
    fn classifies_ebgp_and_ibgp_sessions() {
        let mut net = line_network();
        let mut a_bgp = BgpProcess::new(ip("1.1.1.1"));
        let mut ext = BgpNeighbor::new(ip("10.0.1.2"), 100, 200);
        ext.local_ip = Some(ip("10.0.1.1"));
        a_bgp.neighbors.push(ext);
        net.router_mut("A").unwrap().bgp = Some(a_bgp);

        let mut b_bgp = BgpProcess::new(ip("2.2.2.2"));
        let mut to_c = BgpNeighbor::new(ip("10.0.2.2"), 200, 200);
        to_c.local_ip = Some(ip("10.0.2.1"));
        to_c.route_reflector_client = true;
        b_bgp.neighbors.push(to_c);
        net.router_mut("B").unwrap().bgp = Some(b_bgp);

        let mut c_bgp = BgpProcess::new(ip("3.3.3.3"));
        let mut to_b = BgpNeighbor::new(ip("10.0.2.1"), 200, 200);
        to_b.local_ip = Some(ip("10.0.2.2"));
        c_bgp.neighbors.push(to_b);
        net.router_mut("C").unwrap().bgp = Some(c_bgp);

        let g = Graph::new(net).unwrap();
        let ab = g.edges_of("A")[0];
        assert_eq!(g.peer_type(ab).unwrap(), BgpSendType::ToEbgp);
        assert!(g.is_edge_used("A", Protocol::Bgp, ab));

        let b_to_c = g
            .edges_of("B")
            .iter()
            .copied()
            .find(|id| g.edge(*id).is_abstract)
            .unwrap();
        let c_to_b = g.other_end(b_to_c).unwrap();
        assert_eq!(g.peer_type(b_to_c).unwrap(), BgpSendType::ToClient);
        assert_eq!(g.peer_type(c_to_b).unwrap(), BgpSendType::ToRr);
        assert_eq!(g.route_reflector_parent("C").map(String::as_str), Some("B"));
        assert_eq!(g.find_router_id(b_to_c, Protocol::Bgp).unwrap(), ip("3.3.3.3").as_i64());
        assert!(!g.is_edge_used("B", Protocol::Ospf, b_to_c));
        assert_eq!(g.ibgp_routers().len(), 2);
    }

    #[test]
    fn ospf_skips_edges_to_the_outside() {
        let mut net = line_network();
        let c = net.router_mut("C").unwrap();
        let mut ospf = OspfProcess::new(ip("3.3.3.3"));
        ospf.areas.insert(0, vec!["eth0".into(), "host".into()]);
        c.ospf = Some(ospf);
        for i in c.interfaces.values_mut() {
            i.ospf_enabled = true;
        }
        let g = Graph::new(net.clone()).unwrap();
        for id in g.edges_of("C") {
            let used = g.is_edge_used("C", Protocol::Ospf, *id);
            assert_eq!(used, g.edge(*id).peer.is_some());
        }
        let conf = net.router("C").unwrap();
        assert_eq!(originated_networks(conf, Protocol::Ospf).len(), 2);
    }

    #[test]
    fn regex_communities_depend_on_matching_literals() {
        let mut net = line_network();
        let a = net.router_mut("A").unwrap();
        a.community_lists.insert(
            "CL".into(),
            CommunityList {
                name: "CL".into(),
                lines: vec![CommunityListLine {
                    action: LineAction::Permit,
                    community: CommunityVar::Regex("^65000:".into()),
                }],
            },
        );
        a.add_policy(RoutingPolicy::new(
            "p",
            vec![
                Statement::if_then(
                    BooleanExpr::MatchCommunitySet(CommunitySetExpr::Named("CL".into())),
                    vec![Statement::ExitAccept],
                ),
                Statement::AddCommunity(CommunitySetExpr::Literal(vec![
                    CommunityVar::Exact("65000:7".into()),
                    CommunityVar::Exact("1:1".into()),
                ])),
            ],
        ));
        let g = Graph::new(net).unwrap();
        assert_eq!(g.all_communities().len(), 4);
        let deps = &g.community_dependencies()[&CommunityVar::Regex("^65000:".into())];
        assert_eq!(
            deps,
            &vec![
                CommunityVar::Exact("65000:7".into()),
                CommunityVar::Other("^65000:".into())
            ]
        );
        assert_eq!(g.named_communities()["^65000:"], "CL");
    }

    #[test]
    fn rejects_dangling_acl_reference() {
        let mut net = line_network();
        net.router_mut("A").unwrap().interfaces["eth0"].outgoing_filter = Some("missing".into());
        let err = Graph::new(net).unwrap_err();
        assert!(matches!(err, GraphError::UnknownAcl { .. }));
    }
}
