//! One encoding slice: the control and data plane of the network for a
//! single header space.
//!
//! The main slice models every protocol for the queried packets. IGP slices
//! model reachability of a router's iBGP session address and feed the main
//! slice's iBGP import and forwarding constraints.

use std::cell::Cell;

use indexmap::{IndexMap, IndexSet};
use sweeper_ir::addr::{Prefix, PrefixRange};
use sweeper_ir::graph::{find_common_routing_policy, find_redistributed_protocols, originated_networks, EdgeId, Graph};
use sweeper_ir::header_space::HeaderSpace;
use sweeper_ir::network::{RouterConfig, DEFAULT_REFERENCE_BANDWIDTH};
use sweeper_ir::policy::{BooleanExpr, Statement};
use sweeper_ir::protocol::{BgpSendType, Protocol, RoutingProtocol};
use sweeper_smt::{Encoding, SmtTerm};
use tracing::{debug, trace};

use super::decisions::{SymbolicDecisions, SymbolicFailures};
use super::logical_graph::{EdgeType, LogicalEdge, LogicalGraph, RouteId};
use super::optimizations::Optimizations;
use super::symbolic::{in_prefix, Elidable, OspfType, RouteKind, SymbolicPacket, SymbolicRoute};
use super::transfer::{default_med, TransferSsa};
use super::{EncodingError, MAIN_SLICE_NAME};
use crate::options::EngineOptions;
use crate::question::BgpRankingCriterion;

const MAX_PREFIX_LENGTH: i64 = 32;

/// Shared state every slice reads while adding its constraints.
pub struct SliceEnv<'e> {
    pub graph: &'e Graph,
    pub options: &'e EngineOptions,
    pub bgp_ranking: &'e [BgpRankingCriterion],
    pub model_overflow: bool,
    pub failures: &'e SymbolicFailures,
    /// IGP slices keyed by the router whose session address they target.
    pub igp_slices: &'e IndexMap<String, EncoderSlice>,
    /// `slice_reachability[dst][src]`: `src` reaches `dst`'s session address.
    pub slice_reachability: &'e IndexMap<String, IndexMap<String, SmtTerm>>,
}

impl SliceEnv<'_> {
    pub fn model_igp(&self) -> bool {
        !self.igp_slices.is_empty()
    }

    pub fn igp_slice(&self, router: &str) -> Result<&EncoderSlice, EncodingError> {
        self.igp_slices
            .get(router)
            .ok_or_else(|| EncodingError::Invariant(format!("no IGP slice for {router}")))
    }

    /// IGP distance from `router` to the session address of `target`.
    pub fn igp_best_metric(&self, target: &str, router: &str) -> Result<SmtTerm, EncodingError> {
        let slice = self.igp_slice(target)?;
        slice
            .best(router)
            .map(|r| r.metric.clone())
            .ok_or_else(|| EncodingError::Invariant(format!("no best record for {router} in slice {}", slice.name())))
    }

    fn reachability(&self, dst: &str, src: &str) -> Result<SmtTerm, EncodingError> {
        self.slice_reachability
            .get(dst)
            .and_then(|m| m.get(src))
            .cloned()
            .ok_or_else(|| EncodingError::Invariant(format!("no reachability from {src} to {dst}")))
    }
}

#[derive(Debug)]
pub struct EncoderSlice {
    name: String,
    prefix: String,
    header_space: HeaderSpace,
    main: bool,
    pub optimizations: Optimizations,
    pub logical_graph: LogicalGraph,
    pub decisions: SymbolicDecisions,
    pub packet: SymbolicPacket,
    routes: Vec<SymbolicRoute>,
    inbound_acls: IndexMap<EdgeId, SmtTerm>,
    outbound_acls: IndexMap<EdgeId, SmtTerm>,
    forwards_across: IndexMap<EdgeId, SmtTerm>,
    ospf_redistributed: IndexMap<String, RouteId>,
    originated: IndexMap<(String, Protocol), IndexSet<Prefix>>,
    ssa_counter: Cell<usize>,
}

impl EncoderSlice {
    /// Declare every variable of the slice into `enc`. Constraints are added
    /// later by [`EncoderSlice::compute_encoding`].
    pub fn new(
        enc: &mut Encoding,
        graph: &Graph,
        header_space: HeaderSpace,
        encoder_id: usize,
        name: &str,
        failures: usize,
    ) -> EncoderSlice {
        let prefix = format!("{encoder_id}_{name}");
        let main = name.is_empty() || name == MAIN_SLICE_NAME;
        let packet = SymbolicPacket::new(enc, &prefix);
        let optimizations = Optimizations::compute(graph, &header_space, main, failures);

        let mut slice = EncoderSlice {
            name: name.to_string(),
            prefix,
            header_space,
            main,
            optimizations,
            logical_graph: LogicalGraph::new(),
            decisions: SymbolicDecisions::default(),
            packet,
            routes: Vec::new(),
            inbound_acls: IndexMap::new(),
            outbound_acls: IndexMap::new(),
            forwards_across: IndexMap::new(),
            ospf_redistributed: IndexMap::new(),
            originated: IndexMap::new(),
            ssa_counter: Cell::new(0),
        };
        slice.init_originated_prefixes(graph);
        slice.init_redistribution_protocols(graph);
        slice.build_edge_map();
        slice.add_forwarding_variables(enc, graph);
        slice.add_best_variables(enc, graph);
        slice.add_symbolic_records(enc, graph);
        slice.add_choice_variables(enc, graph);
        slice.add_environment_variables(enc, graph);
        slice.init_acl_functions(enc, graph);
        slice.init_forwarding_across(graph);
        debug!(
            slice = %slice.name,
            routes = slice.routes.len(),
            logical_edges = slice.logical_graph.all_edges().count(),
            "declared slice variables"
        );
        slice
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Prefix shared by every variable this slice declares.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn is_main(&self) -> bool {
        self.main
    }

    pub fn header_space(&self) -> &HeaderSpace {
        &self.header_space
    }

    pub(crate) fn next_ssa_id(&self) -> usize {
        let n = self.ssa_counter.get();
        self.ssa_counter.set(n + 1);
        n
    }

    pub fn routes(&self) -> &[SymbolicRoute] {
        &self.routes
    }

    pub fn route(&self, id: RouteId) -> &SymbolicRoute {
        &self.routes[id.0]
    }

    /// Overall best record of `router`.
    pub fn best(&self, router: &str) -> Option<&SymbolicRoute> {
        self.decisions.best(router).map(|id| self.route(id))
    }

    /// Best record of `router` for `proto`; the overall best when the router
    /// runs a single protocol.
    pub fn best_for(&self, router: &str, proto: Protocol) -> Option<RouteId> {
        if !self.optimizations.runs(router, proto) {
            return None;
        }
        if self.optimizations.is_single_protocol(router) {
            self.decisions.best(router)
        } else {
            self.decisions.best_for(router, proto)
        }
    }

    /// Packets sent over `edge` reach the far interface.
    pub fn forwards_across(&self, edge: EdgeId) -> Option<&SmtTerm> {
        self.forwards_across.get(&edge)
    }

    /// Permit condition of the inbound ACL on `edge`'s interface.
    pub fn inbound_acl(&self, edge: EdgeId) -> Option<&SmtTerm> {
        self.inbound_acls.get(&edge)
    }

    pub fn originated(&self, router: &str, proto: Protocol) -> Option<&IndexSet<Prefix>> {
        self.originated.get(&(router.to_string(), proto))
    }

    /// The record a logical edge stands for, following merged imports to
    /// the opposite export.
    pub fn correct_vars(&self, le: &LogicalEdge) -> &SymbolicRoute {
        let vars = self.route(le.route);
        if vars.used {
            return vars;
        }
        match self.logical_graph.other_end(le) {
            Some(other) => self.route(other.route),
            None => vars,
        }
    }

    /// The record feeding an import edge: the opposite export, or the
    /// environment announcement of an external peer.
    pub fn other_vars(&self, le: &LogicalEdge) -> Option<&SymbolicRoute> {
        if let Some(other) = self.logical_graph.other_end(le) {
            return Some(self.route(other.route));
        }
        self.logical_graph.env_route(le).map(|id| self.route(id))
    }

    /// `len` is in the range's length bounds and the destination lies in
    /// the range's prefix.
    pub fn relevant_for(&self, len: &SmtTerm, range: &PrefixRange) -> SmtTerm {
        let lo = i64::from(range.lengths.start);
        let hi = i64::from(range.lengths.end);
        let len_ok = if lo == hi {
            len.clone().eq(SmtTerm::int(lo))
        } else {
            len.clone().within(lo, hi)
        };
        SmtTerm::and(vec![len_ok, in_prefix(&self.packet.dst_ip, range.prefix)])
    }

    pub fn default_admin_distance(&self, proto: Protocol, route: &SymbolicRoute) -> SmtTerm {
        let def = SmtTerm::int(proto.default_admin_distance());
        match route.bgp_internal.get() {
            Some(internal) => internal.clone().ite(SmtTerm::int(200), def),
            None => def,
        }
    }

    pub fn equal_histories(&self, best: &SymbolicRoute, vars: &SymbolicRoute) -> SmtTerm {
        match (best.protocol_history.get(), vars.protocol_history.get()) {
            (None, _) => SmtTerm::tt(),
            (Some(b), None) => b.check_if_value(&vars.proto),
            (Some(b), Some(v)) => b.eq_enum(v),
        }
    }

    fn add_route(&mut self, route: SymbolicRoute) -> RouteId {
        self.routes.push(route);
        RouteId(self.routes.len() - 1)
    }

    fn new_route(
        &mut self,
        enc: &mut Encoding,
        graph: &Graph,
        name: String,
        router: &str,
        proto: Protocol,
        kind: RouteKind,
    ) -> RouteId {
        let fields = self.optimizations.route_fields(graph, router, proto, kind);
        let route = SymbolicRoute::new(enc, name, router, proto, kind, &fields);
        self.add_route(route)
    }

    fn record_name(&self, router: &str, proto: &str, kind: &str, suffix: &str) -> String {
        format!("{}{router}_{proto}_{kind}_{suffix}", self.prefix)
    }

    fn protocols(&self) -> Vec<(String, Vec<Protocol>)> {
        self.optimizations
            .protocols
            .iter()
            .map(|(r, ps)| (r.clone(), ps.clone()))
            .collect()
    }

    fn init_originated_prefixes(&mut self, graph: &Graph) {
        for (router, protos) in self.protocols() {
            let Some(conf) = graph.config(&router) else {
                continue;
            };
            for proto in protos {
                self.originated
                    .insert((router.clone(), proto), originated_networks(conf, proto));
            }
        }
    }

    fn init_redistribution_protocols(&mut self, graph: &Graph) {
        for (router, protos) in self.protocols() {
            let Some(conf) = graph.config(&router) else {
                continue;
            };
            for proto in &protos {
                let mut redistributed = IndexSet::from([*proto]);
                if let Some(pol) = find_common_routing_policy(conf, *proto) {
                    redistributed.extend(
                        find_redistributed_protocols(conf, pol, *proto)
                            .into_iter()
                            .filter(|p| protos.contains(p)),
                    );
                }
                self.logical_graph.set_redistributed(&router, *proto, redistributed);
            }
        }
    }

    fn build_edge_map(&mut self) {
        for (router, protos) in self.protocols() {
            for proto in protos {
                self.logical_graph.touch(&router, proto);
            }
        }
    }

    fn add_forwarding_variables(&mut self, enc: &mut Encoding, graph: &Graph) {
        for router in graph.routers() {
            for eid in graph.edges_of(router) {
                let ge = graph.edge(*eid);
                let iface = &ge.start.name;
                let c = enc.declare_bool(format!("{}CONTROL-FORWARDING_{router}_{iface}", self.prefix));
                self.decisions.control_forwarding.insert(*eid, c);
                if !ge.is_abstract {
                    let d = enc.declare_bool(format!("{}DATA-FORWARDING_{router}_{iface}", self.prefix));
                    self.decisions.data_forwarding.insert(*eid, d);
                }
            }
        }
    }

    fn add_best_variables(&mut self, enc: &mut Encoding, graph: &Graph) {
        for (router, protos) in self.protocols() {
            let name = self.record_name(&router, "OVERALL", "BEST", "None");
            let id = self.new_route(enc, graph, name, &router, Protocol::Best, RouteKind::BestOverall);
            self.decisions.best_neighbor.insert(router.clone(), id);

            if self.optimizations.is_single_protocol(&router) {
                continue;
            }
            for proto in protos {
                let name = self.record_name(&router, proto.name(), "BEST", "None");
                let id = self.new_route(enc, graph, name, &router, proto, RouteKind::Best);
                self.decisions
                    .best_per_protocol
                    .insert((router.clone(), proto), id);
            }
        }
    }

    fn add_symbolic_records(&mut self, enc: &mut Encoding, graph: &Graph) {
        for (router, protos) in self.protocols() {
            for proto in protos {
                let single_export = self.optimizations.is_single_export(&router, proto);
                let mut single: Option<RouteId> = None;
                let mut has_export = false;

                for eid in graph.edges_of(&router).to_vec() {
                    if !graph.is_edge_used(&router, proto, eid) {
                        continue;
                    }
                    let ge = graph.edge(eid);
                    let iface = ge.start.name.clone();
                    let mut group = Vec::new();

                    if !proto.is_connected() && !proto.is_static() {
                        let route = match single {
                            Some(id) if single_export => id,
                            _ => {
                                let name = if single_export {
                                    self.record_name(&router, proto.name(), "SINGLE-EXPORT", "")
                                } else {
                                    self.record_name(&router, proto.name(), "EXPORT", &iface)
                                };
                                let id = self.new_route(enc, graph, name, &router, proto, RouteKind::Export);
                                if single_export {
                                    single = Some(id);
                                }
                                id
                            }
                        };
                        group.push(LogicalEdge {
                            edge: eid,
                            edge_type: EdgeType::Export,
                            proto,
                            route,
                        });
                        has_export = true;
                    }

                    let relevant = ge
                        .start_prefix()
                        .is_some_and(|p| self.optimizations.relevant_prefix(p));
                    if !(proto.is_connected() && !relevant) {
                        let name = self.record_name(&router, proto.name(), "IMPORT", &iface);
                        let route = if self.optimizations.is_merged(&router, proto, eid) {
                            self.add_route(SymbolicRoute::unused(name, &router, proto))
                        } else {
                            self.new_route(enc, graph, name, &router, proto, RouteKind::Import)
                        };
                        group.insert(
                            0,
                            LogicalEdge {
                                edge: eid,
                                edge_type: EdgeType::Import,
                                proto,
                                route,
                            },
                        );
                    }
                    self.logical_graph.add_group(&router, proto, group);
                }

                let redistributes = self
                    .logical_graph
                    .redistributed(&router, proto)
                    .is_some_and(|r| r.len() > 1);
                if proto.is_ospf() && redistributes && has_export {
                    let name = format!("{}{router}_{}_Redistributed", self.prefix, proto.name());
                    let id = self.new_route(enc, graph, name, &router, proto, RouteKind::Redistributed);
                    self.ospf_redistributed.insert(router.clone(), id);
                }
            }
        }
        self.logical_graph.compute_other_ends(graph);
    }

    fn import_edges(&self, graph: &Graph, router: &str, proto: Protocol) -> Vec<LogicalEdge> {
        self.logical_graph
            .edges(router, proto)
            .filter(|le| le.is_import() && graph.is_edge_used(router, proto, le.edge))
            .copied()
            .collect()
    }

    fn add_choice_variables(&mut self, enc: &mut Encoding, graph: &Graph) {
        for (router, protos) in self.protocols() {
            for proto in protos {
                for le in self.import_edges(graph, &router, proto) {
                    let name = format!("{}_choice", self.route(le.route).name);
                    let v = enc.declare_bool(name);
                    self.decisions.choice.insert(le, v);
                }
            }
        }
    }

    /// One announcement record per external eBGP peer. Only the main slice
    /// models BGP, so only it declares them.
    fn add_environment_variables(&mut self, enc: &mut Encoding, graph: &Graph) {
        if !self.main {
            return;
        }
        for (router, protos) in self.protocols() {
            if !protos.contains(&Protocol::Bgp) {
                continue;
            }
            let imports: Vec<LogicalEdge> = self
                .logical_graph
                .edges(&router, Protocol::Bgp)
                .filter(|le| le.is_import())
                .copied()
                .collect();
            for le in imports {
                let ge = graph.edge(le.edge);
                let Some(n) = graph.ebgp_neighbor(le.edge) else {
                    continue;
                };
                if ge.end.is_some() {
                    continue;
                }
                let address = n
                    .peer_address
                    .map_or_else(|| "null".to_string(), |ip| ip.to_string());
                let name = self.record_name(&router, Protocol::Bgp.name(), "EXPORT", &format!("ENV-{address}"));
                let id = self.new_route(enc, graph, name, &router, Protocol::Bgp, RouteKind::Env);
                self.logical_graph.add_environment(le, id);
            }
        }
    }

    fn init_acl_functions(&mut self, enc: &mut Encoding, graph: &Graph) {
        for router in graph.routers() {
            let Some(conf) = graph.config(router) else {
                continue;
            };
            for eid in graph.edges_of(router) {
                let iface = &graph.edge(*eid).start;
                let directions = [
                    ("OUTBOUND", &iface.outgoing_filter),
                    ("INBOUND", &iface.incoming_filter),
                ];
                for (direction, filter) in directions {
                    let Some(acl) = filter.as_ref().and_then(|n| conf.acls.get(n)) else {
                        continue;
                    };
                    let var = enc.declare_bool(format!(
                        "{}_{router}_{}_{direction}_{}",
                        self.prefix, iface.name, acl.name
                    ));
                    enc.assert_term(var.clone().eq(self.packet.compile_acl(acl, &conf.acls)));
                    if direction == "OUTBOUND" {
                        self.outbound_acls.insert(*eid, var);
                    } else {
                        self.inbound_acls.insert(*eid, var);
                    }
                }
            }
        }
    }

    fn init_forwarding_across(&mut self, graph: &Graph) {
        for (eid, data) in &self.decisions.data_forwarding {
            let in_acl = graph
                .other_end(*eid)
                .and_then(|other| self.inbound_acls.get(&other))
                .cloned()
                .unwrap_or_else(SmtTerm::tt);
            self.forwards_across
                .insert(*eid, SmtTerm::and(vec![data.clone(), in_acl]));
        }
    }

    /// Add every constraint of the slice to `enc`.
    pub fn compute_encoding(&self, enc: &mut Encoding, env: &SliceEnv<'_>) -> Result<(), EncodingError> {
        let before = enc.assertions.len();
        self.add_bound_constraints(enc);
        self.add_community_constraints(enc, env.graph);
        self.add_transfer_functions(enc, env)?;
        self.add_history_constraints(enc);
        self.add_best_per_protocol_constraints(enc, env)?;
        self.add_choice_per_protocol_constraints(enc, env)?;
        self.add_best_overall_constraints(enc, env)?;
        self.add_control_forwarding_constraints(enc, env)?;
        self.add_data_forwarding_constraints(enc, env)?;
        self.add_unused_default_value_constraints(enc);
        enc.assert_term(self.packet.header_space_constraint(&self.header_space));
        if self.main {
            self.add_environment_constraints(enc);
        }
        debug!(slice = %self.name, assertions = enc.assertions.len() - before, "encoded slice");
        Ok(())
    }

    fn used_routes(&self) -> impl Iterator<Item = &SymbolicRoute> {
        self.routes.iter().filter(|r| r.used)
    }

    fn add_bound_constraints(&self, enc: &mut Encoding) {
        for c in self.packet.bound_constraints() {
            enc.assert_term(c);
        }
        let u32_max = i64::from(u32::MAX);
        for r in self.used_routes() {
            if let Some(id) = r.router_id.get() {
                enc.assert_term(id.clone().ge(SmtTerm::int(0)));
            }
            if let Some(ad) = r.admin_dist.get() {
                enc.assert_term(ad.clone().within(0, 255));
            }
            if let Some(med) = r.med.get() {
                enc.assert_term(med.clone().within(0, u32_max));
            }
            if let Some(lp) = r.local_pref.get() {
                enc.assert_term(lp.clone().within(0, u32_max));
            }
            let metric_max = if r.is_env() { 255 } else { 65_535 };
            enc.assert_term(r.metric.clone().within(0, metric_max));
            if let Some(igp) = r.igp_metric.get() {
                enc.assert_term(igp.clone().ge(SmtTerm::int(0)));
            }
            enc.assert_term(r.prefix_length.clone().within(0, MAX_PREFIX_LENGTH));
        }
    }

    /// A regex community holds exactly when one of the exact communities it
    /// matches does.
    fn add_community_constraints(&self, enc: &mut Encoding, graph: &Graph) {
        let deps = graph.community_dependencies();
        for r in self.used_routes() {
            for (c, var) in &r.communities {
                if !c.is_regex() {
                    continue;
                }
                let any = deps
                    .get(c)
                    .into_iter()
                    .flatten()
                    .filter_map(|d| r.communities.get(d).cloned())
                    .collect();
                enc.assert_term(SmtTerm::or(any).eq(var.clone()));
            }
        }
    }

    fn add_transfer_functions(&self, enc: &mut Encoding, env: &SliceEnv<'_>) -> Result<(), EncodingError> {
        let graph = env.graph;
        for (router, proto, groups) in self.logical_graph.iter() {
            let Some(conf) = graph.config(router) else {
                continue;
            };
            let mut used_export = false;
            let mut has_edge = false;
            for le in groups.iter().flatten() {
                if !graph.is_edge_used(router, proto, le.edge) {
                    continue;
                }
                has_edge = true;
                match le.edge_type {
                    EdgeType::Import => {
                        let other = self.other_vars(le);
                        self.add_import_constraint(enc, env, conf, le, other)?;
                    }
                    EdgeType::Export => {
                        let (other, redistributed) = if proto.is_ospf() {
                            let other = self.best_for(router, proto);
                            let redistributed = self.ospf_redistributed.get(router).copied();
                            (other, redistributed)
                        } else {
                            (self.decisions.best(router), None)
                        };
                        let other = other.ok_or_else(|| {
                            EncodingError::Invariant(format!("no best record for {router} {proto}"))
                        })?;
                        if !self.optimizations.is_single_export(router, proto) || !used_export {
                            self.add_export_constraint(enc, env, conf, le, other, redistributed)?;
                        }
                        used_export = true;
                    }
                }
            }
            if !has_edge {
                if let Some(best) = self.best_for(router, proto) {
                    enc.assert_term(self.route(best).permitted.clone().not());
                }
            }
        }
        Ok(())
    }

    fn not_failed(&self, env: &SliceEnv<'_>, edge: EdgeId) -> SmtTerm {
        match env.failures.failed_variable(env.graph, edge) {
            Some(v) => v.clone().eq(SmtTerm::int(0)),
            None => SmtTerm::tt(),
        }
    }

    fn node_up(env: &SliceEnv<'_>, router: Option<&String>) -> SmtTerm {
        match router.and_then(|r| env.failures.failed_node(r)) {
            Some(v) => v.clone().eq(SmtTerm::int(0)),
            None => SmtTerm::tt(),
        }
    }

    fn add_import_constraint(
        &self,
        enc: &mut Encoding,
        env: &SliceEnv<'_>,
        conf: &RouterConfig,
        le: &LogicalEdge,
        other: Option<&SymbolicRoute>,
    ) -> Result<(), EncodingError> {
        let graph = env.graph;
        let vars = self.route(le.route);
        if !vars.used {
            return Ok(());
        }
        let proto = le.proto;
        let ge = graph.edge(le.edge);
        let iface = &ge.start;
        let router = ge.router.as_str();
        let not_failed = self.not_failed(env, le.edge);
        let node_up = Self::node_up(env, Some(&ge.router));
        let active = SmtTerm::bool(Graph::is_interface_active(proto, iface));

        let local_values = |len: u8, ad: i64| {
            SmtTerm::and(vec![
                vars.permitted.clone(),
                vars.prefix_length.clone().eq(SmtTerm::int(i64::from(len))),
                safe_eq(&vars.admin_dist, SmtTerm::int(ad)),
                safe_eq(&vars.local_pref, SmtTerm::int(0)),
                vars.metric.clone().eq(SmtTerm::int(0)),
            ])
        };

        match proto {
            Protocol::Connected => {
                let Some(p) = iface.prefix() else {
                    enc.assert_term(vars.permitted.clone().not());
                    return Ok(());
                };
                let relevant = SmtTerm::and(vec![
                    active,
                    in_prefix(&self.packet.dst_ip, p),
                    not_failed,
                    node_up,
                ]);
                let values = local_values(p.len(), Protocol::Connected.default_admin_distance());
                enc.assert_term(relevant.ite(values, vars.permitted.clone().not()));
            }
            Protocol::Static => {
                let mut acc = vars.permitted.clone().not();
                for sr in graph.static_routes_on(le.edge) {
                    let relevant = SmtTerm::and(vec![
                        active.clone(),
                        in_prefix(&self.packet.dst_ip, sr.network),
                        not_failed.clone(),
                        node_up.clone(),
                    ]);
                    let values = local_values(sr.network.len(), i64::from(sr.admin_cost));
                    acc = relevant.ite(values, acc);
                }
                enc.assert_term(acc);
            }
            Protocol::Ospf | Protocol::Bgp => {
                let Some(other) = other else {
                    enc.assert_term(vars.permitted.clone().not());
                    return Ok(());
                };
                let peer_type = if proto.is_bgp() {
                    Some(graph.peer_type(le.edge)?)
                } else {
                    None
                };
                let receive = match peer_type {
                    Some(BgpSendType::ToRr) if env.model_igp() => {
                        let mut acc = Vec::new();
                        if let Some(cid) = other.client_id.get() {
                            for (r, id) in graph.originator_ids() {
                                if r == router {
                                    continue;
                                }
                                let reach = env.reachability(router, r)?;
                                acc.push(cid.clone().eq(SmtTerm::int(*id)).implies(reach));
                            }
                        }
                        SmtTerm::and(acc)
                    }
                    Some(BgpSendType::ToNonClient | BgpSendType::ToClient) if env.model_igp() => match &ge.peer {
                        Some(peer) => env.reachability(router, peer)?,
                        None => not_failed.clone(),
                    },
                    _ => not_failed.clone(),
                };

                // A router never takes back a route it forwards to the sender.
                let looped = match (proto.is_bgp(), graph.other_end(le.edge)) {
                    (true, Some(back)) => self
                        .decisions
                        .control(back)
                        .cloned()
                        .unwrap_or_else(SmtTerm::ff),
                    _ => SmtTerm::ff(),
                };
                let usable = SmtTerm::and(vec![
                    looped.not(),
                    active,
                    other.permitted.clone(),
                    receive,
                    node_up,
                ]);

                let accept_all = [Statement::ExitAccept];
                let statements = graph
                    .find_import_routing_policy(router, proto, le.edge)
                    .map_or(&accept_all[..], |p| p.statements.as_slice());
                let cost = if proto.is_ospf() {
                    let refbw = conf.ospf.as_ref().map_or(DEFAULT_REFERENCE_BANDWIDTH, |o| o.reference_bandwidth);
                    iface.effective_ospf_cost(refbw)
                } else {
                    0
                };
                trace!(router, edge = %ge, %proto, "import transfer function");
                let import = TransferSsa::new(self, env, conf, other, vars, proto, statements, cost, le.edge, false)
                    .compute(enc)?;
                enc.assert_term(usable.ite(import, vars.permitted.clone().not()));
            }
            Protocol::Best => {}
        }
        Ok(())
    }

    fn add_export_constraint(
        &self,
        enc: &mut Encoding,
        env: &SliceEnv<'_>,
        conf: &RouterConfig,
        le: &LogicalEdge,
        other_id: RouteId,
        redistributed: Option<RouteId>,
    ) -> Result<(), EncodingError> {
        let graph = env.graph;
        let proto = le.proto;
        let vars = self.route(le.route);
        let other = self.route(other_id);
        let ge = graph.edge(le.edge);
        let iface = &ge.start;
        let router = ge.router.as_str();
        let not_failed = self.not_failed(env, le.edge);
        let peer_up = Self::node_up(env, ge.peer.as_ref());
        let not_permitted = vars.permitted.clone().not();
        let active = SmtTerm::bool(Graph::is_interface_active(proto, iface));

        let mut cost = if proto.is_bgp() { 1 } else { 0 };
        let mut do_export = SmtTerm::tt();
        if proto.is_bgp() {
            let peer_type = graph.peer_type(le.edge)?;
            let internal_export = other.is_best() && self.optimizations.need_bgp_internal.contains(router);
            if internal_export && peer_type != BgpSendType::ToEbgp {
                if peer_type == BgpSendType::ToClient {
                    cost = 0;
                } else if let Some(internal) = self
                    .best_for(router, proto)
                    .and_then(|id| self.route(id).bgp_internal.get())
                {
                    // Routes learned over iBGP are not passed to non-clients.
                    do_export = internal.clone().not();
                    cost = 0;
                }
            }
        }

        let policy = graph.find_export_routing_policy(router, proto, le.edge);
        let statements = if proto.is_ospf() {
            vec![Statement::if_then_else(
                BooleanExpr::MatchProtocol(vec![RoutingProtocol::Ospf]),
                vec![Statement::ExitAccept],
                policy.map_or_else(|| vec![Statement::ExitReject], |p| p.statements.clone()),
            )]
        } else {
            policy.map_or_else(|| vec![Statement::ExitAccept], |p| p.statements.clone())
        };

        trace!(router, edge = %ge, %proto, "export transfer function");
        let export = TransferSsa::new(self, env, conf, other, vars, proto, &statements, cost, le.edge, true)
            .compute(enc)?;
        let usable = SmtTerm::and(vec![
            active.clone(),
            do_export.clone(),
            other.permitted.clone(),
            not_failed.clone(),
            peer_up.clone(),
        ]);

        let mut acc = match redistributed {
            Some(redist_id) => {
                let redist = self.route(redist_id);
                let overall = self
                    .best(router)
                    .ok_or_else(|| EncodingError::Invariant(format!("no best record for {router}")))?;
                let from_fib = TransferSsa::new(self, env, conf, overall, redist, proto, &statements, cost, le.edge, true)
                    .compute(enc)?;
                enc.assert_term(from_fib);
                let usable2 = SmtTerm::and(vec![
                    active.clone(),
                    do_export,
                    redist.permitted.clone(),
                    not_failed,
                    peer_up,
                ]);
                let geq = self.greater_or_equal(env, proto, redist, other, Some(le.edge))?;
                let ospf_better = SmtTerm::and(vec![redist.permitted.clone(), geq]).not();
                let uses_ospf = SmtTerm::and(vec![other.permitted.clone(), ospf_better]);
                let eq = self.equal(env, proto, redist, vars, Some(le.edge), false)?;
                let eq_per = redist.permitted.clone().eq(vars.permitted.clone());
                uses_ospf.ite(
                    usable.ite(export, not_permitted.clone()),
                    usable2.ite(SmtTerm::and(vec![eq, eq_per]), not_permitted),
                )
            }
            None => usable.ite(export, not_permitted),
        };

        if proto.is_ospf() {
            let originations = self.originated(router, proto).cloned().unwrap_or_default();
            let ospf_ad = Protocol::Ospf.default_admin_distance();
            for p in originations {
                let mut relevant = SmtTerm::and(vec![active.clone(), in_prefix(&self.packet.dst_ip, p)]);
                let len = i64::from(p.len());
                let area = match vars.ospf_area.get() {
                    Some(a) => a.clone().eq(SmtTerm::int(i64::from(iface.ospf_area.unwrap_or(0)))),
                    None => SmtTerm::tt(),
                };
                let ospf_type = match vars.ospf_type.get() {
                    Some(t) => t.check_if_value(&OspfType::O),
                    None => SmtTerm::tt(),
                };
                let mut values = vec![
                    vars.permitted.clone(),
                    safe_eq(&vars.local_pref, SmtTerm::int(0)),
                    safe_eq(&vars.admin_dist, SmtTerm::int(ospf_ad)),
                    vars.metric.clone().eq(SmtTerm::int(cost)),
                    safe_eq(&vars.med, SmtTerm::int(100)),
                    vars.prefix_length.clone().eq(SmtTerm::int(len)),
                    ospf_type,
                    area,
                    safe_eq(&vars.bgp_internal, SmtTerm::ff()),
                    safe_eq(&vars.igp_metric, SmtTerm::int(0)),
                ];
                values.extend(vars.communities.values().map(|c| c.clone().not()));

                // A better redistributed route suppresses the origination.
                if let Some(redist_id) = redistributed {
                    let redist = self.route(redist_id);
                    let redist_ad = redist
                        .admin_dist
                        .get()
                        .cloned()
                        .unwrap_or_else(|| self.default_admin_distance(proto, redist));
                    let better_len = redist.prefix_length.clone().gt(SmtTerm::int(len));
                    let equal_len = redist.prefix_length.clone().eq(SmtTerm::int(len));
                    let better_ad = redist_ad.lt(SmtTerm::int(ospf_ad));
                    let better = SmtTerm::or(vec![better_len, SmtTerm::and(vec![equal_len, better_ad])]);
                    let better_redistributed = SmtTerm::and(vec![redist.permitted.clone(), better]);
                    relevant = SmtTerm::and(vec![relevant, better_redistributed.not()]);
                }
                acc = relevant.ite(SmtTerm::and(values), acc);
            }
        }
        enc.assert_term(acc);
        Ok(())
    }

    /// A single-protocol router's best route comes from that protocol.
    fn add_history_constraints(&self, enc: &mut Encoding) {
        for (router, id) in &self.decisions.best_neighbor {
            if !self.optimizations.is_single_protocol(router) {
                continue;
            }
            let best = self.route(*id);
            let Some(proto) = self.optimizations.protocols_of(router).first() else {
                continue;
            };
            if let Some(h) = best.protocol_history.get() {
                enc.assert_term(best.permitted.clone().implies(h.check_if_value(proto)));
            }
        }
    }

    /// The best record is permitted iff some candidate is, ranks at least as
    /// high as every permitted candidate, and equals one of them.
    fn constrain_best<'r>(
        &self,
        enc: &mut Encoding,
        env: &SliceEnv<'_>,
        best: &SymbolicRoute,
        candidates: impl IntoIterator<Item = (Protocol, &'r SymbolicRoute, Option<EdgeId>)>,
    ) -> Result<(), EncodingError> {
        let mut some_permitted = Vec::new();
        let mut equal_one = Vec::new();
        for (proto, vars, edge) in candidates {
            some_permitted.push(vars.permitted.clone());
            let eq = self.equal(env, proto, best, vars, edge, true)?;
            equal_one.push(SmtTerm::and(vec![vars.permitted.clone(), eq]));
            let geq = self.greater_or_equal(env, proto, best, vars, edge)?;
            enc.assert_term(vars.permitted.clone().implies(geq));
        }
        if some_permitted.is_empty() {
            enc.assert_term(best.permitted.clone().not());
            return Ok(());
        }
        let some_permitted = SmtTerm::or(some_permitted);
        enc.assert_term(some_permitted.clone().eq(best.permitted.clone()));
        enc.assert_term(some_permitted.implies(SmtTerm::or(equal_one)));
        Ok(())
    }

    fn add_best_per_protocol_constraints(&self, enc: &mut Encoding, env: &SliceEnv<'_>) -> Result<(), EncodingError> {
        for (router, protos) in &self.optimizations.protocols {
            for proto in protos {
                let Some(best) = self.best_for(router, *proto) else {
                    continue;
                };
                let imports = self.import_edges(env.graph, router, *proto);
                let candidates = imports
                    .iter()
                    .map(|le| (*proto, self.correct_vars(le), Some(le.edge)));
                self.constrain_best(enc, env, self.route(best), candidates)?;
            }
        }
        Ok(())
    }

    /// `choice` holds when the import is permitted and equals the protocol's
    /// best.
    fn add_choice_per_protocol_constraints(&self, enc: &mut Encoding, env: &SliceEnv<'_>) -> Result<(), EncodingError> {
        for (router, protos) in &self.optimizations.protocols {
            for proto in protos {
                let Some(best) = self.best_for(router, *proto) else {
                    continue;
                };
                for le in self.import_edges(env.graph, router, *proto) {
                    let vars = self.correct_vars(&le);
                    let Some(choice) = self.decisions.choice.get(&le) else {
                        continue;
                    };
                    let is_best = self.equal(env, *proto, self.route(best), vars, Some(le.edge), false)?;
                    enc.assert_term(
                        choice
                            .clone()
                            .eq(SmtTerm::and(vec![vars.permitted.clone(), is_best])),
                    );
                }
            }
        }
        Ok(())
    }

    fn add_best_overall_constraints(&self, enc: &mut Encoding, env: &SliceEnv<'_>) -> Result<(), EncodingError> {
        for (router, protos) in &self.optimizations.protocols {
            if self.optimizations.is_single_protocol(router) {
                continue;
            }
            let Some(best) = self.best(router) else {
                continue;
            };
            let candidates = protos
                .iter()
                .filter_map(|p| self.best_for(router, *p).map(|id| (*p, self.route(id), None)));
            self.constrain_best(enc, env, best, candidates)?;
        }
        Ok(())
    }

    fn add_control_forwarding_constraints(&self, enc: &mut Encoding, env: &SliceEnv<'_>) -> Result<(), EncodingError> {
        let graph = env.graph;
        for (router, protos) in &self.optimizations.protocols {
            let Some(best) = self.best(router) else {
                continue;
            };
            let mut sends_on: IndexMap<EdgeId, Vec<SmtTerm>> = IndexMap::new();
            for proto in protos {
                for le in self.import_edges(graph, router, *proto) {
                    let vars = self.correct_vars(&le);
                    let Some(choice) = self.decisions.choice.get(&le) else {
                        continue;
                    };
                    let is_best = SmtTerm::and(vec![
                        choice.clone(),
                        self.equal(env, *proto, best, vars, Some(le.edge), false)?,
                    ]);
                    let can_send = if proto.is_connected() {
                        self.connected_will_send(graph, le.edge)
                    } else {
                        SmtTerm::tt()
                    };
                    let sends = SmtTerm::and(vec![can_send, is_best]);
                    if let Some(cf) = self.decisions.control(le.edge) {
                        enc.assert_term(sends.clone().implies(cf.clone()));
                    }
                    sends_on.entry(le.edge).or_default().push(sends);
                }
            }
            for eid in graph.edges_of(router) {
                let Some(cf) = self.decisions.control(*eid) else {
                    continue;
                };
                match sends_on.get(eid) {
                    Some(sends) => enc.assert_term(SmtTerm::or(sends.clone()).not().implies(cf.clone().not())),
                    None => enc.assert_term(cf.clone().not()),
                }
            }
        }
        Ok(())
    }

    /// A connected route forwards unless the packet is for the interface
    /// itself; towards another modelled router only the peer's address
    /// counts.
    fn connected_will_send(&self, graph: &Graph, edge: EdgeId) -> SmtTerm {
        let ge = graph.edge(edge);
        let towards_host = ge.peer.as_deref().is_some_and(|p| graph.is_host(p));
        match graph.other_end(edge) {
            Some(other) if !towards_host => match graph.edge(other).start.ip() {
                Some(ip) => self.packet.dst_ip.clone().eq(SmtTerm::int(ip.as_i64())),
                None => SmtTerm::ff(),
            },
            _ => match ge.start.ip() {
                Some(ip) => self.packet.dst_ip.clone().eq(SmtTerm::int(ip.as_i64())).not(),
                None => SmtTerm::tt(),
            },
        }
    }

    fn add_data_forwarding_constraints(&self, enc: &mut Encoding, env: &SliceEnv<'_>) -> Result<(), EncodingError> {
        let graph = env.graph;
        for router in graph.routers() {
            for eid in graph.edges_of(router) {
                let Some(data) = self.decisions.data(*eid) else {
                    continue;
                };
                let mut fwd = Vec::new();
                if let Some(cf) = self.decisions.control(*eid) {
                    fwd.push(cf.clone());
                }
                if self.main && env.model_igp() {
                    for ge2 in graph.edges_of(router).iter().map(|id| graph.edge(*id)) {
                        if !ge2.is_abstract {
                            continue;
                        }
                        let Some(ctrl) = self.decisions.control(ge2.id) else {
                            continue;
                        };
                        // iBGP next hops resolve through the IGP slice of the
                        // router that announced the route.
                        if graph.peer_type(ge2.id)? == BgpSendType::ToRr {
                            let Some(cid) = self.best(router).and_then(|b| b.client_id.get()) else {
                                continue;
                            };
                            let mut acc = Vec::new();
                            for (r, id) in graph.originator_ids() {
                                if let Some(out) = env.igp_slices.get(r).and_then(|s| s.decisions.data(*eid)) {
                                    acc.push(SmtTerm::and(vec![cid.clone().eq(SmtTerm::int(*id)), out.clone()]));
                                }
                            }
                            fwd.push(SmtTerm::and(vec![ctrl.clone(), SmtTerm::or(acc)]));
                        } else if let Some(peer) = &ge2.peer {
                            if let Some(out) = env.igp_slices.get(peer).and_then(|s| s.decisions.data(*eid)) {
                                fwd.push(SmtTerm::and(vec![ctrl.clone(), out.clone()]));
                            }
                        }
                    }
                }
                let acl = self.outbound_acls.get(eid).cloned().unwrap_or_else(SmtTerm::tt);
                enc.assert_term(SmtTerm::and(vec![SmtTerm::or(fwd), acl]).eq(data.clone()));
            }
        }
        Ok(())
    }

    /// Records that are not permitted carry default values.
    fn add_unused_default_value_constraints(&self, enc: &mut Encoding) {
        let zero = SmtTerm::int(0);
        for r in self.used_routes() {
            let not_permitted = r.permitted.clone().not();
            let mut defaults = vec![
                r.prefix_length.clone().eq(zero.clone()),
                r.metric.clone().eq(zero.clone()),
            ];
            for field in [&r.admin_dist, &r.med, &r.local_pref, &r.igp_metric, &r.router_id, &r.ospf_area, &r.client_id] {
                if let Some(v) = field.get() {
                    defaults.push(v.clone().eq(zero.clone()));
                }
            }
            if let Some(t) = r.ospf_type.get() {
                defaults.push(t.is_default_value());
            }
            if let Some(h) = r.protocol_history.get() {
                defaults.push(h.is_default_value());
            }
            if let Some(b) = r.bgp_internal.get() {
                defaults.push(b.clone().not());
            }
            defaults.extend(r.communities.values().map(|c| c.clone().not()));
            for d in defaults {
                enc.assert_term(not_permitted.clone().implies(d));
            }
        }
    }

    /// Announcements from external peers are eBGP and carry no client id.
    fn add_environment_constraints(&self, enc: &mut Encoding) {
        for id in self.logical_graph.environment().values() {
            let r = self.route(*id);
            if let Some(b) = r.bgp_internal.get() {
                enc.assert_term(b.clone().not());
            }
            if let Some(c) = r.client_id.get() {
                enc.assert_term(c.clone().eq(SmtTerm::int(0)));
            }
        }
    }

    /// Field-wise equality of `best` and `vars`, filling fields `vars` lacks
    /// with their defaults.
    pub fn equal(
        &self,
        env: &SliceEnv<'_>,
        proto: Protocol,
        best: &SymbolicRoute,
        vars: &SymbolicRoute,
        edge: Option<EdgeId>,
        compare_communities: bool,
    ) -> Result<SmtTerm, EncodingError> {
        let graph = env.graph;
        let default_ad = self.default_admin_distance(proto, vars);

        let len = best.prefix_length.clone().eq(vars.prefix_length.clone());
        let met = best.metric.clone().eq(vars.metric.clone());
        let ad = equal_helper(&best.admin_dist, &vars.admin_dist, default_ad);
        let lp = equal_helper(&best.local_pref, &vars.local_pref, SmtTerm::int(100));
        let med = equal_helper(&best.med, &vars.med, SmtTerm::int(default_med(proto)));
        let igp = equal_helper(&best.igp_metric, &vars.igp_metric, SmtTerm::int(0));

        let ospf_type = match (best.ospf_type.get(), vars.ospf_type.get()) {
            (Some(b), Some(v)) => b.eq_enum(v),
            (Some(b), None) => b.is_default_value(),
            _ => SmtTerm::tt(),
        };
        let area = match (best.ospf_area.get(), vars.ospf_area.get(), edge) {
            (Some(b), Some(v), Some(_)) => b.clone().eq(v.clone()),
            (Some(b), None, Some(e)) => {
                let a = graph.edge(e).start.ospf_area.unwrap_or(0);
                b.clone().eq(SmtTerm::int(i64::from(a)))
            }
            _ => SmtTerm::tt(),
        };
        let id = match (best.router_id.get(), vars.router_id.get(), edge) {
            (Some(b), Some(v), _) => b.clone().eq(v.clone()),
            (Some(b), None, Some(e)) => b.clone().eq(SmtTerm::int(graph.find_router_id(e, proto)?)),
            _ => SmtTerm::tt(),
        };
        let history = self.equal_histories(best, vars);
        let internal = match (best.bgp_internal.get(), vars.bgp_internal.get()) {
            (Some(b), Some(v)) => b.clone().eq(v.clone()),
            _ => SmtTerm::tt(),
        };
        let client = match (best.client_id.get(), vars.client_id.get()) {
            (None, _) => SmtTerm::tt(),
            (Some(b), Some(v)) => b.clone().eq(v.clone()),
            (Some(b), None) => b
                .clone()
                .eq(SmtTerm::int(graph.originator_id(&best.router).unwrap_or(0))),
        };
        let comms = if compare_communities {
            SmtTerm::and(
                best.communities
                    .iter()
                    .map(|(c, b)| match vars.communities.get(c) {
                        Some(v) => b.clone().eq(v.clone()),
                        None => b.clone().not(),
                    })
                    .collect(),
            )
        } else {
            SmtTerm::tt()
        };
        Ok(SmtTerm::and(vec![
            len, ad, lp, met, med, area, ospf_type, id, history, internal, client, igp, comms,
        ]))
    }

    /// `best` ranks at least as high as `vars`: longest prefix, then admin
    /// distance, then the BGP criteria in the queried order, then OSPF type,
    /// then router id.
    pub fn greater_or_equal(
        &self,
        env: &SliceEnv<'_>,
        proto: Protocol,
        best: &SymbolicRoute,
        vars: &SymbolicRoute,
        edge: Option<EdgeId>,
    ) -> Result<SmtTerm, EncodingError> {
        let default_ad = self.default_admin_distance(proto, vars);
        let int = |b: &SmtTerm, v: &SmtTerm, less: bool| {
            let better = if less { b.clone().lt(v.clone()) } else { b.clone().gt(v.clone()) };
            (better, b.clone().eq(v.clone()))
        };
        let opt = |b: &Elidable<SmtTerm>, v: &Elidable<SmtTerm>, default: SmtTerm, less: bool| match (b.get(), v.get()) {
            (Some(b), Some(v)) => int(b, v, less),
            (Some(b), None) => int(b, &default, less),
            _ => (SmtTerm::ff(), SmtTerm::tt()),
        };

        let (better_len, equal_len) = int(&best.prefix_length, &vars.prefix_length, false);
        let (better_ad, equal_ad) = opt(&best.admin_dist, &vars.admin_dist, default_ad, true);
        let (better_lp, equal_lp) = opt(&best.local_pref, &vars.local_pref, SmtTerm::int(100), false);
        let (better_met, equal_met) = int(&best.metric, &vars.metric, true);
        let (better_med, equal_med) = opt(&best.med, &vars.med, SmtTerm::int(default_med(proto)), true);
        let (better_igp, equal_igp) = opt(&best.igp_metric, &vars.igp_metric, SmtTerm::int(0), true);
        let (better_type, equal_type) = match (best.ospf_type.get(), vars.ospf_type.get()) {
            (Some(b), Some(v)) => int(b.term(), v.term(), true),
            (Some(b), None) => int(b.term(), &OspfType::O.term(), true),
            _ => (SmtTerm::ff(), SmtTerm::tt()),
        };
        // eBGP beats iBGP.
        let (better_internal, equal_internal) = match (best.bgp_internal.get(), vars.bgp_internal.get()) {
            (Some(b), Some(v)) => (
                SmtTerm::and(vec![b.clone().not(), v.clone()]),
                b.clone().eq(v.clone()),
            ),
            (Some(b), None) => (SmtTerm::ff(), b.clone().not()),
            _ => (SmtTerm::ff(), SmtTerm::tt()),
        };
        let tiebreak = match (best.router_id.get(), vars.router_id.get(), edge) {
            (Some(b), Some(v), _) => b.clone().le(v.clone()),
            (Some(b), None, None) => b.clone().le(SmtTerm::int(0)),
            (Some(b), None, Some(e)) => b.clone().le(SmtTerm::int(env.graph.find_router_id(e, proto)?)),
            _ => SmtTerm::tt(),
        };

        let mut b = SmtTerm::or(vec![better_type, SmtTerm::and(vec![equal_type, tiebreak])]);
        for criterion in env.bgp_ranking.iter().rev() {
            let (better, equal) = match criterion {
                BgpRankingCriterion::LocalPref => (&better_lp, &equal_lp),
                BgpRankingCriterion::PathLength => (&better_met, &equal_met),
                BgpRankingCriterion::Med => (&better_med, &equal_med),
                BgpRankingCriterion::EbgpOverIbgp => (&better_internal, &equal_internal),
                BgpRankingCriterion::IgpCost => (&better_igp, &equal_igp),
            };
            b = SmtTerm::or(vec![better.clone(), SmtTerm::and(vec![equal.clone(), b])]);
        }
        b = SmtTerm::or(vec![better_ad, SmtTerm::and(vec![equal_ad, b])]);
        Ok(SmtTerm::or(vec![better_len, SmtTerm::and(vec![equal_len, b])]))
    }
}

fn safe_eq(x: &Elidable<SmtTerm>, value: SmtTerm) -> SmtTerm {
    match x.get() {
        Some(x) => x.clone().eq(value),
        None => SmtTerm::tt(),
    }
}

fn equal_helper(best: &Elidable<SmtTerm>, vars: &Elidable<SmtTerm>, default: SmtTerm) -> SmtTerm {
    match (best.get(), vars.get()) {
        (Some(b), Some(v)) => b.clone().eq(v.clone()),
        (Some(b), None) => b.clone().eq(default),
        _ => SmtTerm::tt(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sweeper_ir::network::{Acl, Network};
    use sweeper_ir::policy::IntExpr;
    use sweeper_smt::{Model, ModelValue};

    use super::*;
    use crate::encoder::symbolic::RouteFields;
    use crate::encoder::{fixtures, Encoder};
    use crate::question::HeaderQuestion;

    fn encoder(net: Network) -> Encoder {
        let graph = Arc::new(Graph::new(net).unwrap());
        Encoder::new(graph, &HeaderQuestion::default(), &EngineOptions::default()).unwrap()
    }

    fn edge_named(g: &Graph, router: &str, iface: &str) -> EdgeId {
        g.edges_of(router)
            .iter()
            .copied()
            .find(|e| !g.edge(*e).is_abstract && g.edge(*e).start.name == iface)
            .unwrap()
    }

    fn lp_import() -> Network {
        fixtures::external_peer_importing(vec![
            Statement::SetLocalPreference(IntExpr::Literal(200)),
            Statement::ExitAccept,
        ])
    }

    #[test]
    fn every_router_has_a_best_record() {
        let enc = encoder(fixtures::ospf_line(3));
        let s = enc.main_slice();
        assert!(s.is_main());
        for r in ["R0", "R1", "R2"] {
            assert_eq!(s.best(r).unwrap().router, r);
        }
        assert!(s.logical_graph.environment().is_empty());
        let g = enc.graph();
        for ge in g.real_edges() {
            assert!(s.decisions.control(ge.id).is_some());
            assert!(s.forwards_across(ge.id).is_some());
        }
    }

    #[test]
    fn originated_prefixes_follow_protocols() {
        let enc = encoder(fixtures::ospf_line(2));
        let s = enc.main_slice();
        let stub = Prefix::new(fixtures::ip("10.0.200.0"), 24);
        let ospf = s.originated("R1", Protocol::Ospf).unwrap();
        assert!(ospf.contains(&stub));
        assert!(s.originated("R1", Protocol::Bgp).is_none());
    }

    #[test]
    fn identical_routes_rank_equal_both_ways() {
        let enc = encoder(lp_import());
        let s = enc.main_slice();
        let env = enc.slice_env();
        let m = fixtures::zero_model(enc.encoding());
        for r in s.routes() {
            let ge = s.greater_or_equal(&env, r.proto, r, r, None).unwrap();
            let eq = s.equal(&env, r.proto, r, r, None, true).unwrap();
            assert_eq!(m.eval_bool(&ge), Some(true), "{}", r.name);
            assert_eq!(m.eval_bool(&eq), Some(true), "{}", r.name);
        }
    }

    #[test]
    fn higher_local_preference_wins() {
        let enc = encoder(lp_import());
        let s = enc.main_slice();
        let env = enc.slice_env();
        let (le, env_id) = s.logical_graph.environment().first().unwrap();
        let (import, announced) = (s.route(le.route), s.route(*env_id));

        let mut m = fixtures::zero_model(enc.encoding());
        fixtures::set(&mut m, import.local_pref.get().unwrap(), ModelValue::Int(200));
        fixtures::set(&mut m, announced.local_pref.get().unwrap(), ModelValue::Int(100));
        let up = s.greater_or_equal(&env, Protocol::Bgp, import, announced, None).unwrap();
        let down = s.greater_or_equal(&env, Protocol::Bgp, announced, import, None).unwrap();
        assert_eq!(m.eval_bool(&up), Some(true));
        assert_eq!(m.eval_bool(&down), Some(false));

        // Longer prefixes win regardless of preference.
        fixtures::set(&mut m, &announced.prefix_length, ModelValue::Int(24));
        assert_eq!(m.eval_bool(&down), Some(true));
        assert_eq!(m.eval_bool(&up), Some(false));
    }

    #[test]
    fn missing_communities_compare_as_unset() {
        let enc = encoder(lp_import());
        let s = enc.main_slice();
        let env = enc.slice_env();
        let (le, env_id) = s.logical_graph.environment().first().unwrap();
        let (import, announced) = (s.route(le.route), s.route(*env_id));
        let eq = s.equal(&env, Protocol::Bgp, announced, import, None, true).unwrap();
        let m = fixtures::zero_model(enc.encoding());
        assert_eq!(m.eval_bool(&eq), Some(true));
    }

    #[test]
    fn inbound_acl_gates_forwarding_across() {
        let mut net = fixtures::ospf_line(2);
        let r1 = net.router_mut("R1").unwrap();
        r1.add_acl(Acl {
            name: "block".into(),
            lines: Vec::new(),
        });
        r1.interfaces.get_mut("to0").unwrap().incoming_filter = Some("block".into());

        let enc = encoder(net);
        let g = enc.graph();
        let s = enc.main_slice();
        let towards_r1 = edge_named(g, "R0", "to1");
        let acl = s.inbound_acl(edge_named(g, "R1", "to0")).unwrap();
        assert!(s.inbound_acl(towards_r1).is_none());

        let across = s.forwards_across(towards_r1).unwrap();
        let mut m = fixtures::zero_model(enc.encoding());
        fixtures::set(&mut m, s.decisions.data(towards_r1).unwrap(), ModelValue::Bool(true));
        fixtures::set(&mut m, acl, ModelValue::Bool(true));
        assert_eq!(m.eval_bool(across), Some(true));
        fixtures::set(&mut m, acl, ModelValue::Bool(false));
        assert_eq!(m.eval_bool(across), Some(false));
    }

    #[test]
    fn prefix_ranges_bound_the_length() {
        let enc = encoder(fixtures::ospf_line(2));
        let s = enc.main_slice();
        let len = SmtTerm::var("len");
        let p = Prefix::new(fixtures::ip("10.0.0.0"), 8);
        let exact = s.relevant_for(&len, &PrefixRange::exact(p));
        let ranged = s.relevant_for(&len, &PrefixRange::new(p, 16, 24));

        let mut m = fixtures::zero_model(enc.encoding());
        fixtures::set(&mut m, &s.packet.dst_ip, ModelValue::Int(fixtures::ip("10.1.2.3").as_i64()));
        for (l, in_exact, in_range) in [(8, true, false), (20, false, true), (25, false, false)] {
            fixtures::set(&mut m, &len, ModelValue::Int(l));
            assert_eq!(m.eval_bool(&exact), Some(in_exact), "length {l}");
            assert_eq!(m.eval_bool(&ranged), Some(in_range), "length {l}");
        }
    }

    fn ospf_record(enc: &mut Encoding, name: &str) -> SymbolicRoute {
        let fields = RouteFields {
            admin_dist: true,
            ospf_type: true,
            router_id: true,
            ..RouteFields::default()
        };
        SymbolicRoute::new(enc, name, "R1", Protocol::Ospf, RouteKind::Import, &fields)
    }

    /// Assign prefix length, admin distance, OSPF type index and router id.
    fn assign(m: &mut Model, r: &SymbolicRoute, (len, ad, ty, rid): (i64, i64, i64, i64)) {
        fixtures::set(m, &r.permitted, ModelValue::Bool(true));
        fixtures::set(m, &r.prefix_length, ModelValue::Int(len));
        fixtures::set(m, r.admin_dist.get().unwrap(), ModelValue::Int(ad));
        fixtures::set(m, r.ospf_type.get().unwrap().term(), ModelValue::Int(ty));
        fixtures::set(m, r.router_id.get().unwrap(), ModelValue::Int(rid));
    }

    #[test]
    fn route_comparison_is_total() {
        let enc = encoder(fixtures::ospf_line(2));
        let s = enc.main_slice();
        let env = enc.slice_env();
        let mut scratch = Encoding::new();
        let a = ospf_record(&mut scratch, "a");
        let b = ospf_record(&mut scratch, "b");
        let ab = s.greater_or_equal(&env, Protocol::Ospf, &a, &b, None).unwrap();
        let ba = s.greater_or_equal(&env, Protocol::Ospf, &b, &a, None).unwrap();

        let mut attrs = Vec::new();
        for len in [16, 24] {
            for ad in [110, 120] {
                for ty in [OspfType::O.index(), OspfType::E2.index()] {
                    for rid in [1, 2] {
                        attrs.push((len, ad, ty, rid));
                    }
                }
            }
        }
        let mut m = fixtures::zero_model(&scratch);
        for x in &attrs {
            for y in &attrs {
                assign(&mut m, &a, *x);
                assign(&mut m, &b, *y);
                let (ab, ba) = (m.eval_bool(&ab), m.eval_bool(&ba));
                assert!(ab == Some(true) || ba == Some(true), "{x:?} vs {y:?}");
                assert_eq!(ab == Some(true) && ba == Some(true), x == y, "{x:?} vs {y:?}");
            }
        }
    }

    #[test]
    fn best_route_is_the_unique_maximum() {
        let enc = encoder(fixtures::ospf_line(2));
        let s = enc.main_slice();
        let env = enc.slice_env();
        let mut scratch = Encoding::new();
        let best = ospf_record(&mut scratch, "best");
        let cands: Vec<SymbolicRoute> = (0..3).map(|i| ospf_record(&mut scratch, &format!("c{i}"))).collect();
        s.constrain_best(&mut scratch, &env, &best, cands.iter().map(|c| (Protocol::Ospf, c, None)))
            .unwrap();

        let attrs = [(24, 120, 0, 1), (24, 110, 0, 5), (16, 110, 0, 1)];
        let mut m = fixtures::zero_model(&scratch);
        for (c, a) in cands.iter().zip(attrs) {
            assign(&mut m, c, a);
        }
        for (j, a) in attrs.into_iter().enumerate() {
            assign(&mut m, &best, a);
            let holds = scratch.assertions.iter().all(|t| m.eval_bool(t) == Some(true));
            assert_eq!(holds, j == 1, "best copies candidate {j}");
        }

        // Nothing permitted leaves no best route.
        for c in &cands {
            fixtures::set(&mut m, &c.permitted, ModelValue::Bool(false));
        }
        assert!(!scratch.assertions.iter().all(|t| m.eval_bool(t) == Some(true)));
        fixtures::set(&mut m, &best.permitted, ModelValue::Bool(false));
        assert!(scratch.assertions.iter().all(|t| m.eval_bool(t) == Some(true)));
    }
}
