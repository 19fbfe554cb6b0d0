//! Forwarding decisions of a slice and the network-wide failure variables.

use indexmap::IndexMap;
use sweeper_ir::graph::{EdgeId, Graph};
use sweeper_ir::protocol::Protocol;
use sweeper_smt::{Encoding, SmtTerm};

use super::logical_graph::{LogicalEdge, RouteId};

#[derive(Debug, Clone, Default)]
pub struct SymbolicDecisions {
    /// Overall best route of each router.
    pub best_neighbor: IndexMap<String, RouteId>,
    pub best_per_protocol: IndexMap<(String, Protocol), RouteId>,
    /// The router picked the route arriving over this import edge.
    pub choice: IndexMap<LogicalEdge, SmtTerm>,
    pub control_forwarding: IndexMap<EdgeId, SmtTerm>,
    pub data_forwarding: IndexMap<EdgeId, SmtTerm>,
}

impl SymbolicDecisions {
    pub fn best(&self, router: &str) -> Option<RouteId> {
        self.best_neighbor.get(router).copied()
    }

    pub fn best_for(&self, router: &str, proto: Protocol) -> Option<RouteId> {
        self.best_per_protocol
            .get(&(router.to_string(), proto))
            .copied()
    }

    pub fn control(&self, edge: EdgeId) -> Option<&SmtTerm> {
        self.control_forwarding.get(&edge)
    }

    pub fn data(&self, edge: EdgeId) -> Option<&SmtTerm> {
        self.data_forwarding.get(&edge)
    }
}

/// 0/1 integer failure variables, shared by every slice of an encoder.
#[derive(Debug, Clone, Default)]
pub struct SymbolicFailures {
    /// Links between two modelled routers, keyed by the sorted router pair.
    pub failed_internal_links: IndexMap<(String, String), SmtTerm>,
    /// Links leaving the network.
    pub failed_edge_links: IndexMap<EdgeId, SmtTerm>,
    pub failed_nodes: IndexMap<String, SmtTerm>,
}

impl SymbolicFailures {
    pub fn new(enc: &mut Encoding, graph: &Graph, id: &str) -> Self {
        let mut f = SymbolicFailures::default();
        for router in graph.routers() {
            f.failed_nodes.insert(
                router.clone(),
                enc.declare_int(format!("{id}_FAILED-NODE_{router}")),
            );
            for eid in graph.edges_of(router) {
                let ge = graph.edge(*eid);
                if ge.is_abstract || ge.is_null_edge {
                    continue;
                }
                match &ge.peer {
                    None => {
                        let v = enc.declare_int(format!(
                            "{id}_FAILED-EDGE_{}_{}",
                            ge.router, ge.start.name
                        ));
                        f.failed_edge_links.insert(*eid, v);
                    }
                    Some(peer) => {
                        let key = sorted_pair(router, peer);
                        if !f.failed_internal_links.contains_key(&key) {
                            let v = enc.declare_int(format!("{id}_FAILED-EDGE_{}_{}", key.0, key.1));
                            f.failed_internal_links.insert(key, v);
                        }
                    }
                }
            }
        }
        f
    }

    /// The link variable of `edge`; abstract and null edges never fail.
    pub fn failed_variable(&self, graph: &Graph, edge: EdgeId) -> Option<&SmtTerm> {
        let ge = graph.edge(edge);
        if ge.is_abstract || ge.is_null_edge {
            return None;
        }
        match &ge.peer {
            Some(peer) => self.failed_internal_links.get(&sorted_pair(&ge.router, peer)),
            None => self.failed_edge_links.get(&edge),
        }
    }

    pub fn failed_node(&self, router: &str) -> Option<&SmtTerm> {
        self.failed_nodes.get(router)
    }

    /// Every failure variable with a display label.
    pub fn labelled(&self, graph: &Graph) -> Vec<(String, &SmtTerm)> {
        let mut out: Vec<(String, &SmtTerm)> = self
            .failed_internal_links
            .iter()
            .map(|((a, b), v)| (format!("link({a},{b})"), v))
            .collect();
        out.extend(self.failed_edge_links.iter().map(|(e, v)| {
            let ge = graph.edge(*e);
            (format!("link({},{})", ge.router, ge.start.name), v)
        }));
        out.extend(self.failed_nodes.iter().map(|(r, v)| (format!("node({r})"), v)));
        out
    }

    pub fn all_vars(&self) -> impl Iterator<Item = &SmtTerm> {
        self.failed_internal_links
            .values()
            .chain(self.failed_edge_links.values())
            .chain(self.failed_nodes.values())
    }

    /// Each variable is 0 or 1 and at most `k` are set.
    pub fn constraints(&self, k: usize) -> Vec<SmtTerm> {
        let mut out: Vec<SmtTerm> = self.all_vars().map(|v| v.clone().within(0, 1)).collect();
        if k == 0 {
            out.extend(self.all_vars().map(|v| v.clone().eq(SmtTerm::int(0))));
        } else {
            let sum = self
                .all_vars()
                .cloned()
                .reduce(SmtTerm::add)
                .unwrap_or_else(|| SmtTerm::int(0));
            out.push(sum.le(SmtTerm::int(k as i64)));
        }
        out
    }
}

fn sorted_pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::fixtures;
    use sweeper_smt::{Model, ModelValue};

    #[test]
    fn both_directions_share_a_link_variable() {
        let g = Graph::new(fixtures::ospf_line(2)).unwrap();
        let mut enc = Encoding::new();
        let f = SymbolicFailures::new(&mut enc, &g, "0");
        let e = g.edges_of("R0")[0];
        let back = g.other_end(e).unwrap();
        assert_eq!(f.failed_variable(&g, e), f.failed_variable(&g, back));
        assert_eq!(f.failed_internal_links.len(), 1);
        // R1's stub subnet leaves the network.
        assert_eq!(f.failed_edge_links.len(), 1);
        assert!(enc.is_declared("0_FAILED-EDGE_R0_R1"));
        assert!(enc.is_declared("0_FAILED-NODE_R1"));
    }

    #[test]
    fn zero_failures_pin_every_variable() {
        let g = Graph::new(fixtures::ospf_line(2)).unwrap();
        let mut enc = Encoding::new();
        let f = SymbolicFailures::new(&mut enc, &g, "0");
        let cs = f.constraints(0);
        let mut m = Model::default();
        for (name, _) in &enc.declarations {
            m.values.insert(name.clone(), ModelValue::Int(0));
        }
        assert!(cs.iter().all(|c| m.eval_bool(c) == Some(true)));
        m.values.insert("0_FAILED-NODE_R0".into(), ModelValue::Int(1));
        assert!(cs.iter().any(|c| m.eval_bool(c) == Some(false)));
    }

    #[test]
    fn failure_budget_bounds_the_sum() {
        let g = Graph::new(fixtures::ospf_line(3)).unwrap();
        let mut enc = Encoding::new();
        let f = SymbolicFailures::new(&mut enc, &g, "0");
        let cs = f.constraints(1);
        let mut m = Model::default();
        for (name, _) in &enc.declarations {
            m.values.insert(name.clone(), ModelValue::Int(0));
        }
        m.values.insert("0_FAILED-EDGE_R0_R1".into(), ModelValue::Int(1));
        assert!(cs.iter().all(|c| m.eval_bool(c) == Some(true)));
        m.values.insert("0_FAILED-EDGE_R1_R2".into(), ModelValue::Int(1));
        assert!(cs.iter().any(|c| m.eval_bool(c) == Some(false)));
    }
}
