//! Concrete counterexamples read back from a solver model.

use std::collections::BTreeSet;

use indexmap::{IndexMap, IndexSet};
use sweeper_ir::addr::{Ip, Prefix};
use sweeper_ir::graph::{EdgeId, Graph};
use sweeper_ir::protocol::Protocol;
use sweeper_smt::{Model, SmtTerm};

use crate::encoder::slice::EncoderSlice;
use crate::encoder::symbolic::TCP_FLAG_NAMES;
use crate::encoder::Encoder;
use crate::result::{
    Environment, EnvironmentRoute, Flow, FlowDisposition, FlowHistory, FlowTrace, FlowTraceHop,
    VerificationResult,
};

const NO_NEXT_HOP: &str = "AUTO/NONE(-1l)";

fn ip_value(v: i64) -> Ip {
    Ip(u32::try_from(v).unwrap_or(0))
}

fn route_type(proto: Protocol) -> &'static str {
    match proto {
        Protocol::Connected => "Connected",
        Protocol::Static => "Static",
        Protocol::Ospf => "Ospf",
        Protocol::Bgp => "Bgp",
        Protocol::Best => "Best",
    }
}

pub struct CounterExample<'m> {
    model: &'m Model,
}

impl<'m> CounterExample<'m> {
    pub fn new(model: &'m Model) -> Self {
        CounterExample { model }
    }

    /// Unassigned booleans read as false.
    pub fn bool_value(&self, term: &SmtTerm) -> bool {
        self.model.eval_bool(term).unwrap_or(false)
    }

    /// Unassigned integers read as 0.
    pub fn int_value(&self, term: &SmtTerm) -> i64 {
        self.model.eval_int(term).unwrap_or(0)
    }

    /// Copy the model into the human-readable parts of `result`.
    pub fn fill_result(&self, enc: &Encoder, result: &mut VerificationResult) {
        if enc.question().full_model {
            for (name, _) in &enc.encoding().declarations {
                if let Some(v) = self.model.values.get(name) {
                    result.model.insert(name.clone(), v.to_string());
                }
            }
        }

        let slice = enc.main_slice();
        for (name, term) in slice.packet.int_fields() {
            let v = self.int_value(term);
            if v == 0 {
                continue;
            }
            let shown = match name {
                "dstIp" | "srcIp" => ip_value(v).to_string(),
                _ => v.to_string(),
            };
            result.packet_model.insert(name.to_string(), shown);
        }
        for (flag, term) in TCP_FLAG_NAMES.iter().zip(slice.packet.tcp_flags.iter()) {
            if self.bool_value(term) {
                result.packet_model.insert(format!("tcpFlag-{flag}"), "set".to_string());
            }
        }

        for id in slice.logical_graph.environment().values() {
            let r = slice.route(*id);
            if !self.bool_value(&r.permitted) {
                continue;
            }
            let mut fields: Vec<String> = r
                .int_fields()
                .into_iter()
                .map(|(k, t)| format!("{k}={}", self.int_value(t)))
                .collect();
            if let Some(t) = r.ospf_type.get() {
                fields.push(format!("ospfType={}", self.int_value(t.term())));
            }
            let comms: Vec<&str> = r
                .communities
                .iter()
                .filter(|(_, v)| self.bool_value(v))
                .map(|(c, _)| c.value())
                .collect();
            if !comms.is_empty() {
                fields.push(format!("communities=[{}]", comms.join(",")));
            }
            result.env_model.insert(r.name.clone(), fields.join(", "));
        }

        let graph = enc.graph();
        for (eid, data) in &slice.decisions.data_forwarding {
            if self.bool_value(data) {
                result.fwd_model.insert(graph.edge(*eid).to_string());
            }
        }
        for (label, var) in enc.failures().labelled(graph) {
            if self.int_value(var) == 1 {
                result.failures.insert(label);
            }
        }
    }

    /// The packet of `slice`, entering at `router`.
    pub fn build_flow(&self, slice: &EncoderSlice, router: &str) -> Flow {
        let p = &slice.packet;
        Flow {
            ingress_node: router.to_string(),
            src_ip: ip_value(self.int_value(&p.src_ip)),
            dst_ip: ip_value(self.int_value(&p.dst_ip)),
            src_port: self.int_value(&p.src_port),
            dst_port: self.int_value(&p.dst_port),
            ip_protocol: self.int_value(&p.ip_protocol),
            icmp_type: self.int_value(&p.icmp_type),
            icmp_code: self.int_value(&p.icmp_code),
            tcp_flags: p.tcp_flags.each_ref().map(|f| i64::from(self.bool_value(f))),
        }
    }

    /// Links that are down in the model.
    pub fn build_failed_links(&self, enc: &Encoder) -> BTreeSet<String> {
        enc.failures()
            .labelled(enc.graph())
            .into_iter()
            .filter(|(label, var)| label.starts_with("link(") && self.int_value(var) == 1)
            .map(|(label, _)| label)
            .collect()
    }

    /// Announcements from external peers that some router uses.
    pub fn build_env_routing_table(&self, enc: &Encoder) -> Vec<EnvironmentRoute> {
        let slice = enc.main_slice();
        let graph = enc.graph();
        let dst = self.int_value(&slice.packet.dst_ip);
        let mut out = Vec::new();
        for (le, id) in slice.logical_graph.environment() {
            let record = slice.route(*id);
            if !self.bool_value(&record.permitted) {
                continue;
            }
            let uses = slice
                .decisions
                .control(le.edge)
                .is_some_and(|cf| self.bool_value(cf));
            if !uses {
                continue;
            }
            let ge = graph.edge(le.edge);
            let Some(best) = slice.best(&ge.router) else {
                continue;
            };
            let len = u8::try_from(self.int_value(&best.prefix_length)).unwrap_or(0);
            let neighbor = graph.ebgp_neighbor(le.edge);
            out.push(EnvironmentRoute {
                router: ge.router.clone(),
                network: Prefix::new(ip_value(dst), len),
                as_path_length: self.int_value(&best.metric),
                local_pref: 100,
                communities: record
                    .communities
                    .iter()
                    .filter(|(_, v)| self.bool_value(v))
                    .map(|(c, _)| c.value().to_string())
                    .collect(),
                src_node: neighbor.map_or_else(|| "as?".to_string(), |n| format!("as{}", n.remote_as)),
                src_ip: neighbor.and_then(|n| n.peer_address).unwrap_or(Ip(0)),
                dst_ip: ge.start.ip().unwrap_or(Ip(0)),
            });
        }
        out
    }

    pub fn build_environment(&self, enc: &Encoder) -> Environment {
        Environment {
            failed_links: self.build_failed_links(enc),
            routes: self.build_env_routing_table(enc),
        }
    }

    /// The protocol `router`'s best route came from.
    fn build_protocol(&self, slice: &EncoderSlice, router: &str) -> Option<Protocol> {
        let history = slice.best(router).and_then(|b| b.protocol_history.get());
        match history {
            Some(h) => h.value(self.int_value(h.term())).copied(),
            None => slice.optimizations.protocols_of(router).first().copied(),
        }
    }

    /// The route `edge` forwards by, rendered like a routing table entry.
    pub fn build_route(&self, slice: &EncoderSlice, graph: &Graph, edge: EdgeId) -> String {
        let ge = graph.edge(edge);
        let dst = self.int_value(&slice.packet.dst_ip);
        let len = slice
            .best(&ge.router)
            .map_or(0, |b| self.int_value(&b.prefix_length));
        let pfx = Prefix::new(ip_value(dst), u8::try_from(len).unwrap_or(0));
        match self.build_protocol(slice, &ge.router) {
            Some(Protocol::Connected) => {
                format!("ConnectedRoute<{pfx},nhip:{NO_NEXT_HOP},nhint:{}>", ge.start.name)
            }
            proto => {
                let next_hop = ge
                    .end
                    .as_ref()
                    .and_then(|i| i.ip())
                    .map_or_else(|| NO_NEXT_HOP.to_string(), |ip| ip.to_string());
                let kind = proto.map_or("Unknown", route_type);
                format!("{kind}Route<{pfx},nhip:{next_hop},nhint:dynamic>")
            }
        }
    }

    /// Name of the ACL line that matched the packet, or the implicit deny.
    fn acl_verdict(&self, slice: &EncoderSlice, graph: &Graph, router: &str, filter: Option<&String>) -> String {
        let Some((acl, conf)) = graph
            .config(router)
            .and_then(|conf| filter.and_then(|f| conf.acls.get(f)).map(|acl| (acl, conf)))
        else {
            return "no filter".to_string();
        };
        let guards = slice.packet.acl_line_guards(acl, &conf.acls);
        match guards.iter().position(|g| self.bool_value(g)) {
            Some(i) => format!("{} line {}", acl.name, acl.lines[i].name),
            None => format!("{} default deny", acl.name),
        }
    }

    /// Follow data forwarding from `router` until the packet is absorbed,
    /// dropped or loops.
    pub fn build_flow_trace(&self, enc: &Encoder, slice: &EncoderSlice, router: &str) -> FlowTrace {
        let graph = enc.graph();
        let dst = ip_value(self.int_value(&slice.packet.dst_ip));
        let mut visited = IndexSet::new();
        let mut hops = Vec::new();
        let mut current = router.to_string();

        let done = |disposition, hops, notes: String| FlowTrace {
            disposition,
            hops,
            notes,
        };

        loop {
            visited.insert(current.clone());
            let mut next = None;
            for eid in graph.edges_of(&current) {
                let Some(data) = slice.decisions.data(*eid) else {
                    continue;
                };
                let ge = graph.edge(*eid);
                if self.bool_value(data) {
                    hops.push(FlowTraceHop {
                        edge: ge.to_string(),
                        routes: vec![self.build_route(slice, graph, *eid)],
                    });
                    if let Some(peer) = &ge.peer {
                        if visited.contains(peer) {
                            return done(FlowDisposition::Loop, hops, format!("revisits {peer}"));
                        }
                    }
                    let across = slice.forwards_across(*eid).is_some_and(|t| self.bool_value(t));
                    if !across {
                        let note = match (&ge.peer, &ge.end) {
                            (Some(peer), Some(end)) => self.acl_verdict(slice, graph, peer, end.incoming_filter.as_ref()),
                            _ => "denied in".to_string(),
                        };
                        return done(FlowDisposition::DeniedIn, hops, note);
                    }
                    if graph.is_loopback(*eid) {
                        return done(FlowDisposition::Accepted, hops, String::new());
                    }
                    match &ge.peer {
                        None if graph.ebgp_neighbor(*eid).is_some() => {
                            return done(FlowDisposition::Accepted, hops, "exits network".to_string());
                        }
                        None => {
                            return done(
                                FlowDisposition::InsufficientInfo,
                                hops,
                                "no visibility past this interface".to_string(),
                            );
                        }
                        Some(peer) if graph.is_host(peer) => {
                            return done(FlowDisposition::Accepted, hops, String::new());
                        }
                        Some(peer) => {
                            next = Some(peer.clone());
                            break;
                        }
                    }
                }
                if slice.decisions.control(*eid).is_some_and(|cf| self.bool_value(cf)) {
                    hops.push(FlowTraceHop {
                        edge: ge.to_string(),
                        routes: vec![self.build_route(slice, graph, *eid)],
                    });
                    let note = self.acl_verdict(slice, graph, &current, ge.start.outgoing_filter.as_ref());
                    return done(FlowDisposition::DeniedOut, hops, note);
                }
            }

            match next {
                Some(peer) => current = peer,
                None => {
                    let permitted = slice.best(&current).is_some_and(|b| self.bool_value(&b.permitted));
                    if !permitted {
                        return done(FlowDisposition::NoRoute, hops, format!("no route at {current}"));
                    }
                    let owns_dst = graph
                        .edges_of(&current)
                        .iter()
                        .any(|e| graph.edge(*e).start.ip() == Some(dst));
                    return if owns_dst {
                        done(FlowDisposition::Accepted, hops, String::new())
                    } else {
                        done(FlowDisposition::InsufficientInfo, hops, format!("{current} keeps the packet"))
                    };
                }
            }
        }
    }

    /// One `BASE` trace for every source whose reachability term is false.
    pub fn build_flow_history(
        &self,
        enc: &Encoder,
        sources: &[String],
        reach: &IndexMap<String, SmtTerm>,
    ) -> FlowHistory {
        let mut fh = FlowHistory::default();
        let slice = enc.main_slice();
        for source in sources {
            let reaches = reach.get(source).is_some_and(|r| self.bool_value(r));
            if reaches {
                continue;
            }
            let flow = self.build_flow(slice, source);
            let trace = self.build_flow_trace(enc, slice, source);
            fh.add_flow_trace(flow, "BASE", self.build_environment(enc), trace);
        }
        fh
    }

    /// `BASE` and `DELTA` traces for every source whose reachability
    /// differs between the two copies.
    pub fn build_flow_history_diff(
        &self,
        base: &Encoder,
        delta: &Encoder,
        sources: &[String],
        reach_base: &IndexMap<String, SmtTerm>,
        reach_delta: &IndexMap<String, SmtTerm>,
    ) -> FlowHistory {
        let mut fh = FlowHistory::default();
        for source in sources {
            let b = reach_base.get(source).is_some_and(|r| self.bool_value(r));
            let d = reach_delta.get(source).is_some_and(|r| self.bool_value(r));
            if b == d {
                continue;
            }
            let base_slice = base.main_slice();
            let delta_slice = delta.main_slice();
            fh.add_flow_trace(
                self.build_flow(base_slice, source),
                "BASE",
                self.build_environment(base),
                self.build_flow_trace(base, base_slice, source),
            );
            fh.add_flow_trace(
                self.build_flow(delta_slice, source),
                "DELTA",
                self.build_environment(delta),
                self.build_flow_trace(delta, delta_slice, source),
            );
        }
        fh
    }
}
