//! Instrumentation of a slice with derived per-router properties.
//!
//! Every instrumented quantity is declared per router and defined by one
//! constraint per router over the slice's forwarding decisions, so it can be
//! read back from the model or constrained by a query.

use indexmap::{IndexMap, IndexSet};
use sweeper_ir::graph::{EdgeId, Graph};
use sweeper_ir::protocol::Protocol;
use sweeper_smt::{Encoding, SmtTerm};

use crate::encoder::slice::EncoderSlice;

/// Pairwise equality of consecutive terms.
pub fn all_equal(terms: &[SmtTerm]) -> SmtTerm {
    if terms.len() < 2 {
        return SmtTerm::tt();
    }
    SmtTerm::and(
        terms
            .windows(2)
            .map(|w| w[0].clone().eq(w[1].clone()))
            .collect(),
    )
}

pub struct PropertyAdder<'a> {
    slice: &'a EncoderSlice,
    graph: &'a Graph,
}

impl<'a> PropertyAdder<'a> {
    pub fn new(slice: &'a EncoderSlice, graph: &'a Graph) -> Self {
        PropertyAdder { slice, graph }
    }

    fn var_name(&self, kind: &str, router: &str) -> String {
        format!("{}_{kind}_{router}", self.slice.prefix())
    }

    fn across(&self, edge: EdgeId) -> SmtTerm {
        self.slice
            .forwards_across(edge)
            .cloned()
            .unwrap_or_else(SmtTerm::ff)
    }

    /// Real edges of `router` towards another modelled router.
    fn peer_edges(&self, router: &str) -> impl Iterator<Item = (EdgeId, &'a str)> + '_ {
        let graph = self.graph;
        graph.edges_of(router).iter().filter_map(move |e| {
            let ge = graph.edge(*e);
            match (&ge.peer, ge.is_abstract) {
                (Some(peer), false) => Some((*e, peer.as_str())),
                _ => None,
            }
        })
    }

    /// The packet leaves the network over a destination edge, or the router
    /// keeps it on the address of a destination interface.
    fn direct_route(&self, router: &str, dest_edges: &IndexSet<EdgeId>, hosts_count: bool) -> SmtTerm {
        let connected = self
            .slice
            .best_for(router, Protocol::Connected)
            .map(|id| self.slice.route(id));
        let mut direct = Vec::new();
        for eid in self.graph.edges_of(router) {
            let ge = self.graph.edge(*eid);
            if ge.is_abstract || !dest_edges.contains(eid) {
                continue;
            }
            if hosts_count && self.graph.is_host(router) {
                return SmtTerm::tt();
            }
            if ge.peer.is_none() {
                direct.push(self.across(*eid));
            }
            if let (Some(r), Some(ip)) = (connected, ge.start.ip()) {
                direct.push(SmtTerm::and(vec![
                    r.permitted.clone(),
                    self.slice.packet.dst_ip.clone().eq(SmtTerm::int(ip.as_i64())),
                ]));
            }
        }
        SmtTerm::or(direct)
    }

    fn declare_reachability(&self, enc: &mut Encoding) -> (IndexMap<String, SmtTerm>, IndexMap<String, SmtTerm>) {
        let mut reach = IndexMap::new();
        let mut ids = IndexMap::new();
        for router in self.graph.routers() {
            let id = enc.declare_int(self.var_name("reachable-id", router));
            let var = enc.declare_bool(self.var_name("reachable", router));
            enc.assert_term(var.clone().eq(id.clone().gt(SmtTerm::int(0))));
            enc.assert_term(id.clone().ge(SmtTerm::int(0)));
            ids.insert(router.clone(), id);
            reach.insert(router.clone(), var);
        }
        (reach, ids)
    }

    /// A router forwarding to a reachable neighbor is reachable and has a
    /// larger id than every reachable next hop; otherwise its id is 0.
    fn recursive_reachability(&self, ids: &IndexMap<String, SmtTerm>, router: &str) -> SmtTerm {
        let zero = SmtTerm::int(0);
        let mut has_route = Vec::new();
        let mut larger = Vec::new();
        let Some(id) = ids.get(router) else {
            return SmtTerm::tt();
        };
        for (eid, peer) in self.peer_edges(router) {
            let Some(peer_id) = ids.get(peer) else {
                continue;
            };
            let sends = SmtTerm::and(vec![self.across(eid), peer_id.clone().gt(zero.clone())]);
            larger.push(sends.clone().implies(id.clone().gt(peer_id.clone())));
            has_route.push(sends);
        }
        SmtTerm::or(has_route).ite(SmtTerm::and(larger), id.clone().eq(zero))
    }

    /// Reachability of the destination edges from every router.
    pub fn instrument_reachability(&self, enc: &mut Encoding, dest_edges: &IndexSet<EdgeId>) -> IndexMap<String, SmtTerm> {
        let (reach, ids) = self.declare_reachability(enc);
        for router in self.graph.routers() {
            let direct = self.direct_route(router, dest_edges, true);
            let recursive = self.recursive_reachability(&ids, router);
            enc.assert_term(direct.ite(ids[router].clone().eq(SmtTerm::int(1)), recursive));
        }
        reach
    }

    /// Reachability of `router` itself from every router.
    pub fn instrument_reachability_to_router(&self, enc: &mut Encoding, router: &str) -> IndexMap<String, SmtTerm> {
        let (reach, ids) = self.declare_reachability(enc);
        if let Some(base) = ids.get(router) {
            enc.assert_term(base.clone().eq(SmtTerm::int(1)));
        }
        for r in self.graph.routers().filter(|r| *r != router) {
            enc.assert_term(self.recursive_reachability(&ids, r));
        }
        reach
    }

    /// Hop count to the destination edges: 0 at the destination, one more
    /// than a forwarding neighbor's, and -1 when no neighbor has a path.
    pub fn instrument_path_length(&self, enc: &mut Encoding, dest_edges: &IndexSet<EdgeId>) -> IndexMap<String, SmtTerm> {
        let zero = SmtTerm::int(0);
        let minus_one = SmtTerm::int(-1);
        let lens: IndexMap<String, SmtTerm> = self
            .graph
            .routers()
            .map(|r| (r.clone(), enc.declare_int(self.var_name("path-length", r))))
            .collect();
        for len in lens.values() {
            enc.assert_term(len.clone().ge(minus_one.clone()));
        }
        for router in self.graph.routers() {
            let length = &lens[router];
            let mut none = Vec::new();
            let mut some = Vec::new();
            for (eid, peer) in self.peer_edges(router) {
                let Some(peer_len) = lens.get(peer) else {
                    continue;
                };
                let fwd = self.across(eid);
                none.push(SmtTerm::or(vec![peer_len.clone().lt(zero.clone()), fwd.clone().not()]));
                some.push(SmtTerm::and(vec![
                    peer_len.clone().ge(zero.clone()),
                    fwd,
                    length.clone().eq(peer_len.clone().add(SmtTerm::int(1))),
                ]));
            }
            let recursive = SmtTerm::and(none).ite(length.clone().eq(minus_one.clone()), SmtTerm::or(some));
            let direct = self.direct_route(router, dest_edges, false);
            enc.assert_term(direct.ite(length.clone().eq(zero.clone()), recursive));
        }
        lens
    }

    /// Share of the traffic each router carries: 1 at the destination, else
    /// the sum of its forwarding neighbors' loads.
    pub fn instrument_load(&self, enc: &mut Encoding, dest_edges: &IndexSet<EdgeId>) -> IndexMap<String, SmtTerm> {
        let zero = SmtTerm::int(0);
        let loads: IndexMap<String, SmtTerm> = self
            .graph
            .routers()
            .map(|r| (r.clone(), enc.declare_int(self.var_name("load", r))))
            .collect();
        for load in loads.values() {
            enc.assert_term(load.clone().ge(zero.clone()));
        }
        for router in self.graph.routers() {
            let load = &loads[router];
            let sum = self
                .peer_edges(router)
                .filter_map(|(eid, peer)| {
                    loads
                        .get(peer)
                        .map(|l| self.across(eid).ite(l.clone(), zero.clone()))
                })
                .fold(zero.clone(), SmtTerm::add);
            let direct = self.direct_route(router, dest_edges, false);
            enc.assert_term(direct.ite(load.clone().eq(SmtTerm::int(1)), load.clone().eq(sum)));
        }
        loads
    }

    /// Whether `router` lies on a forwarding loop.
    pub fn instrument_loop(&self, enc: &mut Encoding, router: &str) -> SmtTerm {
        let on_loop: IndexMap<String, SmtTerm> = self
            .graph
            .routers()
            .map(|r| (r.clone(), enc.declare_bool(self.var_name(&format!("on-loop_{router}"), r))))
            .collect();
        for r in self.graph.routers() {
            let acc = self
                .peer_edges(r)
                .filter_map(|(eid, peer)| {
                    if peer == router {
                        Some(self.across(eid))
                    } else {
                        on_loop
                            .get(peer)
                            .map(|p| SmtTerm::and(vec![self.across(eid), p.clone()]))
                    }
                })
                .collect();
            enc.assert_term(on_loop[r].clone().eq(SmtTerm::or(acc)));
        }
        on_loop.get(router).cloned().unwrap_or_else(SmtTerm::ff)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::encoder::{fixtures, Encoder};
    use crate::options::EngineOptions;
    use crate::question::HeaderQuestion;
    use sweeper_smt::{Model, ModelValue, SmtSort};

    struct Line {
        enc: Encoder,
        graph: Arc<Graph>,
    }

    fn line(n: usize) -> Line {
        let graph = Arc::new(Graph::new(fixtures::ospf_line(n)).unwrap());
        let enc = Encoder::new(graph.clone(), &HeaderQuestion::default(), &EngineOptions::default()).unwrap();
        Line { enc, graph }
    }

    fn edge(g: &Graph, router: &str, peer: Option<&str>) -> EdgeId {
        g.edges_of(router)
            .iter()
            .copied()
            .find(|e| g.edge(*e).peer.as_deref() == peer)
            .unwrap()
    }

    fn assign(m: &mut Model, term: &SmtTerm, v: ModelValue) {
        if let SmtTerm::Var(name) = term {
            m.values.insert(name.clone(), v);
        }
    }

    /// Everything at its zero value, forwarding along `hops`, then the
    /// derived variables set to `values`.
    fn model(l: &Line, hops: &[EdgeId], values: &[(&SmtTerm, ModelValue)]) -> Model {
        let mut m = Model::default();
        for (name, sort) in &l.enc.encoding().declarations {
            let v = match sort {
                SmtSort::Bool => ModelValue::Bool(false),
                _ => ModelValue::Int(0),
            };
            m.values.insert(name.clone(), v);
        }
        for (e, d) in &l.enc.main_slice().decisions.data_forwarding {
            assign(&mut m, d, ModelValue::Bool(hops.contains(e)));
        }
        for (t, v) in values {
            assign(&mut m, t, *v);
        }
        m
    }

    fn holds(enc: &Encoding, from: usize, m: &Model) -> bool {
        enc.assertions[from..].iter().all(|a| m.eval_bool(a) == Some(true))
    }

    #[test]
    fn reachability_ids_decrease_towards_the_destination() {
        let mut l = line(3);
        let g = l.graph.clone();
        let stub = edge(&g, "R2", None);
        let dest = IndexSet::from([stub]);
        let from = l.enc.encoding().assertions.len();
        let reach = l.enc.instrument(|pa, enc| pa.instrument_reachability(enc, &dest));
        let prefix = l.enc.main_slice().prefix().to_string();
        let id = |r: &str| SmtTerm::var(format!("{prefix}_reachable-id_{r}"));
        let hops = [edge(&g, "R0", Some("R1")), edge(&g, "R1", Some("R2")), stub];
        let (a, b, c) = (id("R0"), id("R1"), id("R2"));

        let good = model(
            &l,
            &hops,
            &[
                (&a, ModelValue::Int(3)),
                (&b, ModelValue::Int(2)),
                (&c, ModelValue::Int(1)),
                (&reach["R0"], ModelValue::Bool(true)),
                (&reach["R1"], ModelValue::Bool(true)),
                (&reach["R2"], ModelValue::Bool(true)),
            ],
        );
        assert!(holds(l.enc.encoding(), from, &good));

        let mut cyclic = good.clone();
        assign(&mut cyclic, &a, ModelValue::Int(2));
        assert!(!holds(l.enc.encoding(), from, &cyclic));

        // Without R1 -> R2, R1 and R0 must be unreachable.
        let cut = [hops[0], stub];
        let cut_model = model(
            &l,
            &cut,
            &[
                (&a, ModelValue::Int(0)),
                (&b, ModelValue::Int(0)),
                (&c, ModelValue::Int(1)),
                (&reach["R0"], ModelValue::Bool(false)),
                (&reach["R1"], ModelValue::Bool(false)),
                (&reach["R2"], ModelValue::Bool(true)),
            ],
        );
        assert!(holds(l.enc.encoding(), from, &cut_model));
        let mut wrong = cut_model.clone();
        assign(&mut wrong, &b, ModelValue::Int(2));
        assign(&mut wrong, &reach["R1"], ModelValue::Bool(true));
        assert!(!holds(l.enc.encoding(), from, &wrong));
    }

    #[test]
    fn path_length_counts_hops() {
        let mut l = line(3);
        let g = l.graph.clone();
        let stub = edge(&g, "R2", None);
        let dest = IndexSet::from([stub]);
        let from = l.enc.encoding().assertions.len();
        let lens = l.enc.instrument(|pa, enc| pa.instrument_path_length(enc, &dest));
        let hops = [edge(&g, "R0", Some("R1")), edge(&g, "R1", Some("R2")), stub];
        let values = [
            (&lens["R0"], ModelValue::Int(2)),
            (&lens["R1"], ModelValue::Int(1)),
            (&lens["R2"], ModelValue::Int(0)),
        ];
        let m = model(&l, &hops, &values);
        assert!(holds(l.enc.encoding(), from, &m));

        let mut off_by_one = m.clone();
        assign(&mut off_by_one, &lens["R0"], ModelValue::Int(3));
        assert!(!holds(l.enc.encoding(), from, &off_by_one));

        let none = model(
            &l,
            &[],
            &[
                (&lens["R0"], ModelValue::Int(-1)),
                (&lens["R1"], ModelValue::Int(-1)),
                (&lens["R2"], ModelValue::Int(-1)),
            ],
        );
        assert!(holds(l.enc.encoding(), from, &none));
    }

    #[test]
    fn load_sums_forwarding_neighbors() {
        let mut l = line(2);
        let g = l.graph.clone();
        let stub = edge(&g, "R1", None);
        let dest = IndexSet::from([stub]);
        let from = l.enc.encoding().assertions.len();
        let loads = l.enc.instrument(|pa, enc| pa.instrument_load(enc, &dest));
        let hops = [edge(&g, "R0", Some("R1")), stub];
        let m = model(
            &l,
            &hops,
            &[(&loads["R0"], ModelValue::Int(1)), (&loads["R1"], ModelValue::Int(1))],
        );
        assert!(holds(l.enc.encoding(), from, &m));
    }

    #[test]
    fn loop_membership_follows_forwarding_cycles() {
        let mut l = line(3);
        let g = l.graph.clone();
        let from = l.enc.encoding().assertions.len();
        let on_loop = l.enc.instrument(|pa, enc| pa.instrument_loop(enc, "R1"));
        let prefix = l.enc.main_slice().prefix().to_string();
        let var = |r: &str| SmtTerm::var(format!("{prefix}_on-loop_R1_{r}"));
        let (r0, r2) = (var("R0"), var("R2"));

        let cycle = [edge(&g, "R1", Some("R2")), edge(&g, "R2", Some("R1"))];
        let m = model(
            &l,
            &cycle,
            &[(&on_loop, ModelValue::Bool(true)), (&r0, ModelValue::Bool(false)), (&r2, ModelValue::Bool(true))],
        );
        assert!(holds(l.enc.encoding(), from, &m));

        let straight = [edge(&g, "R1", Some("R2"))];
        let mut m = model(
            &l,
            &straight,
            &[(&on_loop, ModelValue::Bool(false)), (&r0, ModelValue::Bool(false)), (&r2, ModelValue::Bool(false))],
        );
        assert!(holds(l.enc.encoding(), from, &m));
        assign(&mut m, &on_loop, ModelValue::Bool(true));
        assert!(!holds(l.enc.encoding(), from, &m));
    }

    #[test]
    fn all_equal_chains_neighbors() {
        let (a, b, c) = (SmtTerm::var("a"), SmtTerm::var("b"), SmtTerm::var("c"));
        let mut m = Model::default();
        for (n, v) in [("a", 1), ("b", 1), ("c", 1)] {
            m.values.insert(n.into(), ModelValue::Int(v));
        }
        let eq = all_equal(&[a, b, c]);
        assert_eq!(m.eval_bool(&eq), Some(true));
        m.values.insert("c".into(), ModelValue::Int(2));
        assert_eq!(m.eval_bool(&eq), Some(false));
        assert!(all_equal(&[SmtTerm::var("x")]).is_true());
        assert!(all_equal(&[]).is_true());
    }
}
