//! Attribute and variable-sharing analysis run once per slice.
//!
//! The encoder only declares the route attributes and logical-edge records
//! this pass says it needs. Every decision errs towards keeping a field.

use indexmap::{IndexMap, IndexSet};
use sweeper_ir::addr::Prefix;
use sweeper_ir::graph::{originated_networks, EdgeId, Graph};
use sweeper_ir::header_space::HeaderSpace;
use sweeper_ir::network::{GeneratedRoute, RouterConfig, SUPPRESSED_SUMMARY_LIST_NAME};
use sweeper_ir::network::BGP_COMMON_FILTER_LIST_NAME;
use sweeper_ir::policy::{walk_statements, BooleanExpr, Statement};
use sweeper_ir::protocol::Protocol;
use tracing::debug;

use super::symbolic::{RouteFields, RouteKind};

#[derive(Debug, Clone, Default)]
pub struct Optimizations {
    pub keep_local_pref: bool,
    pub keep_admin_dist: bool,
    pub keep_med: bool,
    pub keep_ospf_type: bool,
    /// Protocols each router participates in, in a fixed order.
    pub protocols: IndexMap<String, Vec<Protocol>>,
    pub need_bgp_internal: IndexSet<String>,
    pub single_protocol: IndexSet<String>,
    pub single_export: IndexSet<(String, Protocol)>,
    /// Edges whose import record is the opposite export record.
    pub merged_import_export: IndexMap<(String, Protocol), IndexSet<EdgeId>>,
    pub relevant_aggregates: IndexMap<String, Vec<GeneratedRoute>>,
    pub suppressed_aggregates: IndexMap<String, IndexSet<Prefix>>,
    pub need_originator_ids: bool,
    pub need_router_id: IndexSet<String>,
    header_space: HeaderSpace,
}

impl Optimizations {
    /// Analyse `graph` for a slice over `header_space`. Only the main slice
    /// models BGP.
    pub fn compute(
        graph: &Graph,
        header_space: &HeaderSpace,
        main_slice: bool,
        failures: usize,
    ) -> Optimizations {
        let mut opt = Optimizations {
            header_space: header_space.clone(),
            ..Optimizations::default()
        };
        let configs: Vec<&RouterConfig> = graph.network().routers.values().collect();

        opt.keep_local_pref = any_statement(&configs, |s| matches!(s, Statement::SetLocalPreference(_)));
        opt.keep_admin_dist = configs
            .iter()
            .any(|c| c.static_routes.iter().any(|sr| sr.admin_cost != 1));
        opt.keep_med = false;
        let areas: IndexSet<u32> = graph
            .routers()
            .filter_map(|r| graph.area_ids(r))
            .flatten()
            .copied()
            .collect();
        opt.keep_ospf_type = areas.len() > 1
            || any_statement(&configs, |s| matches!(s, Statement::SetOspfMetricType(_)));

        opt.init_protocols(graph, main_slice);
        opt.need_bgp_internal = graph.ibgp_routers();
        opt.single_protocol = opt
            .protocols
            .iter()
            .filter(|(_, ps)| ps.len() == 1)
            .map(|(r, _)| r.clone())
            .collect();
        opt.init_single_export(graph, failures);
        opt.init_merged_import_export(graph, failures);
        opt.init_aggregates(graph);
        opt.need_originator_ids = graph.has_route_reflectors();
        opt.need_router_id = opt
            .protocols
            .iter()
            .filter(|(r, ps)| {
                let Some(bgp) = graph.config(r).and_then(|c| c.bgp.as_ref()) else {
                    return false;
                };
                let uses_ibgp = opt.need_bgp_internal.contains(*r);
                (uses_ibgp && !bgp.multipath_ibgp) || (ps.contains(&Protocol::Bgp) && !bgp.multipath_ebgp)
            })
            .map(|(r, _)| r.clone())
            .collect();

        debug!(
            keep_local_pref = opt.keep_local_pref,
            keep_admin_dist = opt.keep_admin_dist,
            keep_ospf_type = opt.keep_ospf_type,
            single_export = opt.single_export.len(),
            merged = opt.merged_import_export.values().map(IndexSet::len).sum::<usize>(),
            "computed optimizations"
        );
        opt
    }

    /// Some destination of the slice lies in `prefix`.
    pub fn relevant_prefix(&self, prefix: Prefix) -> bool {
        self.header_space.dst_ips.is_empty() || self.header_space.overlaps_dst(prefix)
    }

    pub fn protocols_of(&self, router: &str) -> &[Protocol] {
        self.protocols.get(router).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn runs(&self, router: &str, proto: Protocol) -> bool {
        self.protocols_of(router).contains(&proto)
    }

    pub fn is_single_protocol(&self, router: &str) -> bool {
        self.single_protocol.contains(router)
    }

    pub fn is_single_export(&self, router: &str, proto: Protocol) -> bool {
        self.single_export.contains(&(router.to_string(), proto))
    }

    pub fn is_merged(&self, router: &str, proto: Protocol, edge: EdgeId) -> bool {
        self.merged_import_export
            .get(&(router.to_string(), proto))
            .is_some_and(|es| es.contains(&edge))
    }

    /// The optional fields a record of `kind` for `proto` at `router` needs.
    pub fn route_fields(&self, graph: &Graph, router: &str, proto: Protocol, kind: RouteKind) -> RouteFields {
        let protos = self.protocols_of(router);
        let has_ospf = protos.contains(&Protocol::Ospf);
        let has_bgp = protos.contains(&Protocol::Bgp);
        let bgp_or_best = proto.is_bgp() || proto.is_best();
        let multi_area = graph.area_ids(router).is_some_and(|a| a.len() > 1);
        let best_overall = kind == RouteKind::BestOverall;

        let communities = if proto.is_bgp() || kind == RouteKind::Env || (proto.is_best() && has_bgp) {
            graph.all_communities().iter().cloned().collect()
        } else {
            Vec::new()
        };
        RouteFields {
            admin_dist: (best_overall && protos.len() > 1) || self.keep_admin_dist,
            local_pref: self.keep_local_pref,
            med: self.keep_med,
            ospf_area: has_ospf && multi_area,
            ospf_type: has_ospf && self.keep_ospf_type,
            router_id: bgp_or_best && self.need_router_id.contains(router),
            bgp_internal: bgp_or_best && self.need_bgp_internal.contains(router),
            client_id: bgp_or_best && self.need_originator_ids,
            history: best_overall.then(|| protos.to_vec()),
            communities,
        }
    }

    fn init_protocols(&mut self, graph: &Graph, main_slice: bool) {
        for (router, conf) in &graph.network().routers {
            let mut protos = Vec::new();
            if conf.ospf.is_some() {
                protos.push(Protocol::Ospf);
            }
            if conf.bgp.is_some() && main_slice {
                protos.push(Protocol::Bgp);
            }
            for p in [Protocol::Connected, Protocol::Static] {
                if originated_networks(conf, p)
                    .iter()
                    .any(|n| self.relevant_prefix(*n))
                {
                    protos.push(p);
                }
            }
            self.protocols.insert(router.clone(), protos);
        }
    }

    fn init_single_export(&mut self, graph: &Graph, failures: usize) {
        for (router, protos) in &self.protocols {
            let Some(conf) = graph.config(router) else {
                continue;
            };
            for proto in protos {
                let single = failures == 0
                    && match proto {
                        Protocol::Connected | Protocol::Static => true,
                        Protocol::Ospf => {
                            let all_active = graph
                                .edges_of(router)
                                .iter()
                                .map(|id| graph.edge(*id))
                                .filter(|ge| ge.start.ospf_enabled && !ge.is_null_edge)
                                .all(|ge| ge.start.active);
                            let areas = graph.area_ids(router).map_or(0, |a| a.len());
                            all_active && areas <= 1
                        }
                        Protocol::Bgp => conf.bgp.as_ref().is_some_and(|bgp| {
                            bgp.neighbors.iter().all(|n| {
                                !n.is_ibgp()
                                    && n.export_policy
                                        .as_ref()
                                        .map_or(true, |p| is_default_bgp_export(conf, p))
                            })
                        }),
                        Protocol::Best => false,
                    };
                if single {
                    self.single_export.insert((router.clone(), *proto));
                }
            }
        }
    }

    fn init_merged_import_export(&mut self, graph: &Graph, failures: usize) {
        if failures > 0 {
            return;
        }
        for (router, protos) in &self.protocols {
            if !protos.contains(&Protocol::Bgp) {
                continue;
            }
            let mut merged = IndexSet::new();
            for id in graph.edges_of(router) {
                let ge = graph.edge(*id);
                if ge.is_abstract || !graph.is_edge_used(router, Protocol::Bgp, *id) {
                    continue;
                }
                let Some(peer) = &ge.peer else { continue };
                let Some(other) = graph.other_end(*id) else {
                    continue;
                };
                let same_internal =
                    self.need_bgp_internal.contains(router) == self.need_bgp_internal.contains(peer);
                let peer_exports = self.runs(peer, Protocol::Bgp)
                    && graph.is_edge_used(peer, Protocol::Bgp, other);
                let no_import_policy = graph
                    .find_import_routing_policy(router, Protocol::Bgp, *id)
                    .is_none();
                if same_internal && peer_exports && no_import_policy {
                    merged.insert(*id);
                }
            }
            if !merged.is_empty() {
                self.merged_import_export
                    .insert((router.clone(), Protocol::Bgp), merged);
            }
        }
    }

    fn init_aggregates(&mut self, graph: &Graph) {
        for (router, conf) in &graph.network().routers {
            let relevant: Vec<GeneratedRoute> = conf
                .generated_routes
                .iter()
                .filter(|gr| self.relevant_prefix(gr.network))
                .cloned()
                .collect();
            if !relevant.is_empty() {
                self.relevant_aggregates.insert(router.clone(), relevant);
            }
            let suppressed: IndexSet<Prefix> = conf
                .route_filter_lists
                .iter()
                .filter(|(name, _)| name.contains(SUPPRESSED_SUMMARY_LIST_NAME))
                .flat_map(|(_, list)| list.lines.iter().map(|l| l.prefix))
                .collect();
            if !suppressed.is_empty() {
                self.suppressed_aggregates.insert(router.clone(), suppressed);
            }
        }
    }
}

fn any_statement(configs: &[&RouterConfig], pred: impl Fn(&Statement) -> bool) -> bool {
    let mut found = false;
    for conf in configs {
        for policy in conf.routing_policies.values() {
            walk_statements(&policy.statements, &mut |s| found |= pred(s), &mut |_| {});
        }
    }
    found
}

/// `if (call <common export policy>) accept else reject`.
fn is_default_bgp_export(conf: &RouterConfig, name: &str) -> bool {
    let Some(policy) = conf.policy(name) else {
        return false;
    };
    match policy.statements.as_slice() {
        [Statement::If {
            guard: BooleanExpr::CallPolicy(called),
            true_statements,
            false_statements,
        }] => {
            called.contains(BGP_COMMON_FILTER_LIST_NAME)
                && true_statements.as_slice() == [Statement::ExitAccept]
                && false_statements.as_slice() == [Statement::ExitReject]
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::fixtures;
    use sweeper_ir::policy::{IntExpr, RoutingPolicy};

    #[test]
    fn plain_ospf_chain_drops_optional_attributes() {
        let g = Graph::new(fixtures::ospf_line(3)).unwrap();
        let opt = Optimizations::compute(&g, &HeaderSpace::default(), true, 0);
        assert!(!opt.keep_local_pref);
        assert!(!opt.keep_admin_dist);
        assert!(!opt.keep_ospf_type);
        assert_eq!(opt.protocols_of("R0"), &[Protocol::Ospf, Protocol::Connected]);
        assert!(opt.is_single_export("R0", Protocol::Ospf));
        assert!(opt.need_router_id.is_empty());
    }

    #[test]
    fn failures_disable_single_export() {
        let g = Graph::new(fixtures::ospf_line(2)).unwrap();
        let opt = Optimizations::compute(&g, &HeaderSpace::default(), true, 1);
        assert!(!opt.is_single_export("R0", Protocol::Ospf));
        assert!(opt.merged_import_export.is_empty());
    }

    #[test]
    fn irrelevant_connected_prefixes_are_skipped() {
        let g = Graph::new(fixtures::ospf_line(2)).unwrap();
        let hs = HeaderSpace::to_destination("192.168.0.0/16".parse().unwrap());
        let opt = Optimizations::compute(&g, &hs, true, 0);
        assert_eq!(opt.protocols_of("R1"), &[Protocol::Ospf]);
        assert!(opt.is_single_protocol("R1"));
    }

    #[test]
    fn local_pref_kept_when_any_policy_sets_it() {
        let mut net = fixtures::ebgp_pair();
        let conf = net.router_mut("R1").unwrap();
        conf.add_policy(RoutingPolicy::new(
            "IMPORT",
            vec![Statement::SetLocalPreference(IntExpr::Literal(200)), Statement::ExitAccept],
        ));
        let g = Graph::new(net).unwrap();
        let opt = Optimizations::compute(&g, &HeaderSpace::default(), true, 0);
        assert!(opt.keep_local_pref);
        let fields = opt.route_fields(&g, "R1", Protocol::Bgp, RouteKind::Import);
        assert!(fields.local_pref);
        assert!(fields.router_id);
    }

    #[test]
    fn igp_slices_leave_out_bgp() {
        let g = Graph::new(fixtures::ebgp_pair()).unwrap();
        let opt = Optimizations::compute(&g, &HeaderSpace::default(), false, 0);
        assert!(!opt.runs("R1", Protocol::Bgp));
    }

    #[test]
    fn ebgp_edges_merge_import_with_peer_export() {
        let g = Graph::new(fixtures::ebgp_pair()).unwrap();
        let opt = Optimizations::compute(&g, &HeaderSpace::default(), true, 0);
        let merged = opt
            .merged_import_export
            .get(&("R1".to_string(), Protocol::Bgp))
            .unwrap();
        assert_eq!(merged.len(), 1);
    }
}
