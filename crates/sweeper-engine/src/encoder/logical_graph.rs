//! Protocol-level view of the topology.
//!
//! Every physical edge used by a protocol yields an import and (for dynamic
//! protocols) an export logical edge, each pointing at a route record in
//! the slice's arena.

use std::collections::HashMap;

use indexmap::{IndexMap, IndexSet};
use sweeper_ir::graph::{EdgeId, Graph};
use sweeper_ir::protocol::Protocol;

/// Index of a route record in a slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RouteId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeType {
    Import,
    Export,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogicalEdge {
    pub edge: EdgeId,
    pub edge_type: EdgeType,
    pub proto: Protocol,
    pub route: RouteId,
}

impl LogicalEdge {
    pub fn is_import(&self) -> bool {
        self.edge_type == EdgeType::Import
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogicalGraph {
    /// Per router and protocol, one group of logical edges per physical edge.
    groups: IndexMap<(String, Protocol), Vec<Vec<LogicalEdge>>>,
    other_end: HashMap<LogicalEdge, LogicalEdge>,
    /// Announcements from external BGP peers, by the import edge they enter.
    environment: IndexMap<LogicalEdge, RouteId>,
    /// Protocols redistributed into each (router, protocol).
    redistributed: IndexMap<(String, Protocol), IndexSet<Protocol>>,
}

impl LogicalGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_group(&mut self, router: &str, proto: Protocol, group: Vec<LogicalEdge>) {
        self.groups
            .entry((router.to_string(), proto))
            .or_default()
            .push(group);
    }

    /// Make sure `(router, proto)` is listed even without edges.
    pub fn touch(&mut self, router: &str, proto: Protocol) {
        self.groups.entry((router.to_string(), proto)).or_default();
    }

    pub fn groups(&self, router: &str, proto: Protocol) -> &[Vec<LogicalEdge>] {
        self.groups
            .get(&(router.to_string(), proto))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every (router, protocol) with its logical edges.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Protocol, &[Vec<LogicalEdge>])> {
        self.groups
            .iter()
            .map(|((r, p), gs)| (r.as_str(), *p, gs.as_slice()))
    }

    pub fn edges(&self, router: &str, proto: Protocol) -> impl Iterator<Item = &LogicalEdge> {
        self.groups(router, proto).iter().flatten()
    }

    pub fn all_edges(&self) -> impl Iterator<Item = &LogicalEdge> {
        self.groups.values().flatten().flatten()
    }

    /// Pair every logical edge with the opposite-direction logical edge on
    /// the far side of its physical edge.
    pub fn compute_other_ends(&mut self, graph: &Graph) {
        let mut pairs = Vec::new();
        for ((_, proto), groups) in &self.groups {
            for le in groups.iter().flatten() {
                let Some(other) = graph.other_end(le.edge) else {
                    continue;
                };
                let peer = &graph.edge(other).router;
                let wanted = match le.edge_type {
                    EdgeType::Import => EdgeType::Export,
                    EdgeType::Export => EdgeType::Import,
                };
                let found = self
                    .groups(peer, *proto)
                    .iter()
                    .flatten()
                    .find(|o| o.edge == other && o.edge_type == wanted);
                if let Some(o) = found {
                    pairs.push((*le, *o));
                }
            }
        }
        self.other_end.extend(pairs);
    }

    pub fn other_end(&self, le: &LogicalEdge) -> Option<&LogicalEdge> {
        self.other_end.get(le)
    }

    pub fn add_environment(&mut self, le: LogicalEdge, route: RouteId) {
        self.environment.insert(le, route);
    }

    pub fn environment(&self) -> &IndexMap<LogicalEdge, RouteId> {
        &self.environment
    }

    pub fn env_route(&self, le: &LogicalEdge) -> Option<RouteId> {
        self.environment.get(le).copied()
    }

    pub fn set_redistributed(&mut self, router: &str, proto: Protocol, protos: IndexSet<Protocol>) {
        self.redistributed.insert((router.to_string(), proto), protos);
    }

    pub fn redistributed(&self, router: &str, proto: Protocol) -> Option<&IndexSet<Protocol>> {
        self.redistributed.get(&(router.to_string(), proto))
    }
}
