//! End-to-end property queries.
//!
//! Every query follows the same shape: find the locations the question
//! names, encode the network once per header-space partition, constrain
//! failures and the environment, assert the negation of the property and ask
//! the solver for a counterexample. Partitions are checked in parallel and
//! the scan stops at the first counterexample.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use indexmap::{IndexMap, IndexSet};
use rayon::prelude::*;
use regex::Regex;
use sweeper_ir::addr::Prefix;
use sweeper_ir::graph::{all_originated_networks, EdgeId, Graph};
use sweeper_ir::header_space::HeaderSpace;
use sweeper_ir::network::Network;
use sweeper_ir::protocol::Protocol;
use sweeper_smt::{Encoding, SmtTerm};
use tracing::{debug, info};

use super::adder::{all_equal, PropertyAdder};
use super::CheckError;
use crate::counterexample::CounterExample;
use crate::encoder::logical_graph::{EdgeType, LogicalEdge};
use crate::encoder::slice::EncoderSlice;
use crate::encoder::symbolic::{in_prefix, SymbolicRoute};
use crate::encoder::{Encoder, EncodingError};
use crate::options::EngineOptions;
use crate::question::{
    full_match_regex, DiffType, EnvironmentType, HeaderLocationQuestion, HeaderQuestion,
    Partitioning, SANE_ENVIRONMENT_MAX_METRIC,
};
use crate::result::{Answer, FlowHistory, Verdict, VerificationResult, VerificationStats};

/// Builds one property term per router over the main slice, given the
/// source routers and destination edges of the question.
type Instrument<'a> = dyn Fn(&PropertyAdder<'_>, &mut Encoding, &[String], &IndexSet<EdgeId>) -> IndexMap<String, SmtTerm>
    + Sync
    + 'a;

/// Routers and edges a location question refers to.
#[derive(Debug)]
struct Locations {
    sources: Vec<String>,
    destinations: IndexSet<EdgeId>,
    fail_links: IndexSet<EdgeId>,
    fail_nodes: IndexSet<String>,
}

/// Why the partition scan stopped early.
enum Halt {
    Counterexample,
    Failed(CheckError),
}

/// Statistics and answers collected across partitions.
#[derive(Default)]
struct Accumulator {
    stats: VerificationStats,
    counterexample: Option<Answer>,
    inconclusive: Option<Answer>,
    verified: Option<Answer>,
}

impl Accumulator {
    fn record(&mut self, answer: Answer) -> Result<(), Halt> {
        if let Some(stats) = answer.result().and_then(|r| r.stats.as_ref()) {
            self.stats.combine(stats);
        }
        let inconclusive = matches!(
            answer.result().map(|r| &r.verdict),
            Some(Verdict::Inconclusive { .. })
        );
        if inconclusive {
            if self.inconclusive.is_none() {
                self.inconclusive = Some(answer);
            }
            Ok(())
        } else if answer.holds() {
            self.verified = Some(answer);
            Ok(())
        } else {
            if self.counterexample.is_none() {
                self.counterexample = Some(answer);
            }
            Err(Halt::Counterexample)
        }
    }

    /// A counterexample wins over an inconclusive partition, which wins
    /// over a verified one.
    fn finish(self) -> Option<Answer> {
        let Accumulator {
            stats,
            counterexample,
            inconclusive,
            verified,
        } = self;
        let mut answer = counterexample.or(inconclusive).or(verified)?;
        if let Some(r) = answer.result_mut() {
            r.stats = Some(stats);
        }
        Some(answer)
    }
}

pub struct PropertyChecker {
    graph: Arc<Graph>,
    options: EngineOptions,
}

impl PropertyChecker {
    pub fn new(network: Network, options: EngineOptions) -> Result<Self, CheckError> {
        Ok(Self::from_graph(Arc::new(Graph::new(network)?), options))
    }

    pub fn from_graph(graph: Arc<Graph>, options: EngineOptions) -> Self {
        PropertyChecker { graph, options }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Forwarding of the network for some packet and environment, with no
    /// failures. The property is trivially violated so the answer carries a
    /// model of the forwarding.
    pub fn check_forwarding(&self, question: &HeaderQuestion) -> Result<Answer, CheckError> {
        let q = HeaderQuestion {
            failures: 0,
            ..question.clone()
        };
        info!(query = "forwarding", "checking property");
        let mut enc = Encoder::new(self.graph.clone(), &q, &self.options)?;
        for c in environment_constraints(enc.main_slice(), q.base_env_type) {
            enc.add(c);
        }
        let (result, _) = enc.verify();
        Ok(Answer::Single(result))
    }

    /// Every source router reaches one of the destination edges.
    pub fn check_reachability(&self, q: &HeaderLocationQuestion) -> Result<Answer, CheckError> {
        self.check_property(
            "reachability",
            q,
            &|pa, enc, _, dests| pa.instrument_reachability(enc, dests),
            true,
        )
    }

    /// Every source router reaches the destinations in at most `k` hops.
    pub fn check_bounded_length(&self, q: &HeaderLocationQuestion, k: i64) -> Result<Answer, CheckError> {
        self.check_property(
            "bounded-length",
            q,
            &move |pa, enc, _, dests| {
                pa.instrument_path_length(enc, dests)
                    .into_iter()
                    .map(|(router, len)| (router, len.le(SmtTerm::int(k))))
                    .collect()
            },
            false,
        )
    }

    /// All source routers have the same path length to the destinations.
    pub fn check_equal_length(&self, q: &HeaderLocationQuestion) -> Result<Answer, CheckError> {
        self.check_property(
            "equal-length",
            q,
            &|pa, enc, sources, dests| {
                let lens = pa.instrument_path_length(enc, dests);
                let of_sources: Vec<SmtTerm> = sources.iter().filter_map(|s| lens.get(s).cloned()).collect();
                let same = all_equal(&of_sources);
                enc.assert_term(same.clone().not());
                lens.keys()
                    .map(|r| {
                        let prop = if sources.contains(r) { same.clone() } else { SmtTerm::tt() };
                        (r.clone(), prop)
                    })
                    .collect()
            },
            false,
        )
    }

    /// Instruments the traffic load of every router. No bound on the load is
    /// asserted yet, so the property always holds.
    pub fn check_load_balancing(&self, q: &HeaderLocationQuestion) -> Result<Answer, CheckError> {
        self.check_property(
            "load-balancing",
            q,
            &|pa, enc, _, dests| {
                pa.instrument_load(enc, dests)
                    .into_keys()
                    .map(|r| (r, SmtTerm::tt()))
                    .collect()
            },
            false,
        )
    }

    /// Whether the network has two stable forwarding states for the same
    /// packet, environment and failures.
    pub fn check_determinism(&self, q: &HeaderQuestion) -> Result<Answer, CheckError> {
        info!(query = "determinism", "checking property");
        let first = Encoder::new(self.graph.clone(), q, &self.options)?;
        let mut second = Encoder::extend(first, self.graph.clone(), q)?;
        let (env, related, required) = {
            let first = base_of(&second)?;
            let env = environment_constraints(first.main_slice(), q.base_env_type);
            let related = SmtTerm::and(vec![
                relate_failures(first, &second),
                relate_environments(first, &second)?,
                relate_packets(first, &second),
            ]);
            let required = SmtTerm::and(
                forwarding_pairs(first, &second)
                    .into_iter()
                    .map(|(_, a, b)| a.clone().eq(b.clone()))
                    .collect(),
            );
            (env, related, required)
        };
        for c in env {
            second.add(c);
        }
        second.add(related);
        second.add(required.not());

        let (result, model) = second.verify();
        let model = match (&result.verdict, model) {
            (Verdict::Falsified, Some(m)) => m,
            (Verdict::Verified, _) => {
                return Ok(Answer::Determinism {
                    flow: None,
                    forwarding1: BTreeSet::new(),
                    forwarding2: BTreeSet::new(),
                })
            }
            _ => return Ok(Answer::Single(result)),
        };

        let first = base_of(&second)?;
        let ce = CounterExample::new(&model);
        let flow = ce.build_flow(first.main_slice(), "(none)");
        let mut case1 = BTreeSet::new();
        let mut case2 = BTreeSet::new();
        for (eid, d1, d2) in forwarding_pairs(first, &second) {
            let (b1, b2) = (ce.bool_value(d1), ce.bool_value(d2));
            if b1 == b2 {
                continue;
            }
            let ge = self.graph.edge(eid);
            if b1 {
                case1.insert(format!("{ge} -- {}", ce.build_route(first.main_slice(), &self.graph, eid)));
            }
            if b2 {
                case2.insert(format!("{ge} -- {}", ce.build_route(second.main_slice(), &self.graph, eid)));
            }
        }
        if case1.first() > case2.first() {
            std::mem::swap(&mut case1, &mut case2);
        }
        Ok(Answer::Determinism {
            flow: Some(flow),
            forwarding1: case1,
            forwarding2: case2,
        })
    }

    /// Whether some router without an edge to the outside receives traffic
    /// and then drops it.
    pub fn check_black_hole(&self, q: &HeaderQuestion) -> Result<Answer, CheckError> {
        let graph = &self.graph;
        let interior: Vec<&String> = graph
            .routers()
            .filter(|r| real_edges_of(graph, r).all(|e| graph.edge(e).end.is_some()))
            .collect();
        self.run_partitions("black-hole", q, |pq| {
            let mut enc = Encoder::new(graph.clone(), pq, &self.options)?;
            let some_black_hole = {
                let slice = enc.main_slice();
                let data = |e: EdgeId| slice.decisions.data(e).cloned().unwrap_or_else(SmtTerm::ff);
                SmtTerm::or(
                    interior
                        .iter()
                        .map(|router| {
                            let drops = SmtTerm::and(real_edges_of(graph, router).map(|e| data(e).not()).collect());
                            let receives = SmtTerm::or(
                                graph
                                    .neighbors(router)
                                    .into_iter()
                                    .flatten()
                                    .flat_map(|n| real_edges_of(graph, n))
                                    .filter(|e| graph.edge(*e).peer.as_deref() == Some(router.as_str()))
                                    .map(data)
                                    .collect(),
                            );
                            SmtTerm::and(vec![receives, drops])
                        })
                        .collect(),
                )
            };
            enc.add(some_black_hole);
            let (result, _) = enc.verify();
            Ok(Answer::Single(result))
        })
    }

    /// Traffic a router forwards along several paths is treated the same
    /// way on each of them: a router that reaches the destination must
    /// deliver over every edge it forwards on.
    pub fn check_multipath_consistency(&self, q: &HeaderLocationQuestion) -> Result<Answer, CheckError> {
        if q.header.negate {
            return Err(CheckError::InvalidQuery(
                "negation is not supported for multipath consistency".into(),
            ));
        }
        let loc = self.locations(q)?;
        let mut question = q.header.clone();
        infer_destination_header_space(&self.graph, &loc.destinations, &mut question.header_space);
        let graph = &self.graph;
        self.run_partitions("multipath-consistency", &question, |pq| {
            let mut enc = Encoder::new(graph.clone(), pq, &self.options)?;
            let reach = enc.instrument(|pa, e| pa.instrument_reachability(e, &loc.destinations));
            let violation = {
                let slice = enc.main_slice();
                let mut acc = Vec::new();
                for router in graph.routers() {
                    let mut all = Vec::new();
                    for eid in real_edges_of(graph, router) {
                        let Some(ctrl) = slice.decisions.control(eid) else {
                            continue;
                        };
                        let across = slice.forwards_across(eid).cloned().unwrap_or_else(SmtTerm::ff);
                        let peer_reach = match &graph.edge(eid).peer {
                            Some(peer) => prop_of(&reach, peer)?,
                            None => SmtTerm::tt(),
                        };
                        all.push(ctrl.clone().implies(SmtTerm::and(vec![across, peer_reach])));
                    }
                    acc.push(prop_of(&reach, router)?.implies(SmtTerm::and(all)).not());
                }
                SmtTerm::or(acc)
            };
            enc.add(violation);
            let (result, _) = enc.verify();
            Ok(Answer::Single(result))
        })
    }

    /// Whether packets towards a static route's prefix can loop. Only
    /// routers with static routes are checked, since the routing protocols
    /// prevent loops on their own.
    pub fn check_routing_loop(&self, q: &HeaderQuestion) -> Result<Answer, CheckError> {
        let mut routers = Vec::new();
        let mut destinations: IndexSet<Prefix> = IndexSet::new();
        for router in self.graph.routers() {
            let Some(conf) = self.graph.config(router) else {
                continue;
            };
            if !conf.static_routes.is_empty() {
                routers.push(router.clone());
            }
            destinations.extend(conf.static_routes.iter().map(|sr| sr.network));
        }
        let mut question = q.clone();
        question.header_space.dst_ips = destinations.into_iter().collect();
        self.run_partitions("routing-loop", &question, |pq| {
            let mut enc = Encoder::new(self.graph.clone(), pq, &self.options)?;
            let loops: Vec<SmtTerm> = routers
                .iter()
                .map(|r| enc.instrument(|pa, e| pa.instrument_loop(e, r)))
                .collect();
            enc.add(SmtTerm::or(loops));
            let (result, _) = enc.verify();
            Ok(Answer::Single(result))
        })
    }

    /// Compare each pair of consecutive routers (by name) matching
    /// `router_regex`. Given equal environments on same-named interfaces
    /// and the same packet, the routers must forward alike, or with
    /// `strict`, choose the same best route.
    pub fn check_local_equivalence(
        &self,
        router_regex: &str,
        strict: bool,
        full_model: bool,
    ) -> Result<Answer, CheckError> {
        let re = full_match_regex(router_regex)?;
        let mut routers: Vec<String> = self.graph.routers().filter(|r| re.is_match(r)).cloned().collect();
        routers.sort();
        info!(query = "local-equivalence", routers = routers.len(), strict, "checking property");
        let q = HeaderQuestion {
            full_model,
            failures: 0,
            base_env_type: EnvironmentType::Any,
            ..HeaderQuestion::default()
        };
        let mut results = BTreeMap::new();
        for pair in routers.windows(2) {
            let (r1, r2) = (&pair[0], &pair[1]);
            let result = self.local_equivalence(&q, r1, r2, strict)?;
            debug!(r1 = %r1, r2 = %r2, verdict = %result.verdict, "compared routers");
            results.insert(format!("{r1}<-->{r2}"), result);
        }
        Ok(Answer::Many(results))
    }

    fn local_equivalence(
        &self,
        q: &HeaderQuestion,
        r1: &str,
        r2: &str,
        strict: bool,
    ) -> Result<VerificationResult, CheckError> {
        let g1 = Arc::new(self.graph.restricted(&IndexSet::from([r1.to_string()]))?);
        let g2 = Arc::new(self.graph.restricted(&IndexSet::from([r2.to_string()]))?);
        let ifaces1 = interface_edges(&g1, r1);
        let ifaces2 = interface_edges(&g2, r2);
        if ifaces1.len() != ifaces2.len() || ifaces1.keys().any(|name| !ifaces2.contains_key(name)) {
            return Err(CheckError::InvalidQuery(format!(
                "routers {r1} and {r2} have different interfaces"
            )));
        }

        let e1 = Encoder::new(g1.clone(), q, &self.options)?;
        let mut e2 = Encoder::extend(e1, g2.clone(), q)?;
        let (assumptions, exclusive, required) = {
            let e1 = base_of(&e2)?;
            let (s1, s2) = (e1.main_slice(), e2.main_slice());
            let env1 = e1.slice_env();

            let mut by_iface: HashMap<(Protocol, &str, EdgeType), LogicalEdge> = HashMap::new();
            for &proto in s2.optimizations.protocols_of(r2) {
                for le in s2.logical_graph.edges(r2, proto) {
                    by_iface.insert((proto, g2.edge(le.edge).start.name.as_str(), le.edge_type), *le);
                }
            }

            let mut equal_envs = Vec::new();
            let mut env_records: Vec<&SymbolicRoute> = Vec::new();
            for &proto in s1.optimizations.protocols_of(r1) {
                for le1 in s1.logical_graph.edges(r1, proto).filter(|le| le.is_import()) {
                    let iface = g1.edge(le1.edge).start.name.as_str();
                    let le2 = by_iface.get(&(proto, iface, le1.edge_type)).ok_or_else(|| {
                        CheckError::InvalidQuery(format!("{r2} does not run {} on {iface}", proto.name()))
                    })?;
                    match (s1.logical_graph.env_route(le1), s2.logical_graph.env_route(le2)) {
                        (Some(v1), Some(v2)) => {
                            let (v1, v2) = (s1.route(v1), s2.route(v2));
                            equal_envs.push(v1.permitted.clone().eq(v2.permitted.clone()));
                            equal_envs.push(s1.equal(&env1, proto, v1, v2, Some(le1.edge), true)?);
                            for (c, b) in &v2.communities {
                                if !v1.communities.contains_key(c) {
                                    equal_envs.push(b.clone().not());
                                }
                            }
                            env_records.push(v1);
                        }
                        (None, None) => {}
                        _ => {
                            return Err(CheckError::InvalidQuery(format!(
                                "only one of {r1} and {r2} peers with the environment on {iface}"
                            )))
                        }
                    }
                }
            }

            let mut exclusive = Vec::new();
            if strict {
                for (i, a) in env_records.iter().enumerate() {
                    for (j, b) in env_records.iter().enumerate() {
                        if i != j {
                            exclusive.push(a.permitted.clone().implies(b.permitted.clone().not()));
                        }
                    }
                }
            }

            equal_envs.push(relate_packets(e1, &e2));
            equal_envs.push(outside_originated(s1, r1));
            equal_envs.push(outside_originated(s2, r2));

            let required = if strict {
                relate_routes(&e2, best_of(s1, r1)?, best_of(s2, r2)?)?
            } else {
                SmtTerm::and(
                    ifaces1
                        .iter()
                        .filter_map(|(name, eid1)| {
                            let eid2 = ifaces2.get(name)?;
                            let d1 = s1.decisions.data(*eid1).cloned().unwrap_or_else(SmtTerm::ff);
                            let d2 = s2.decisions.data(*eid2).cloned().unwrap_or_else(SmtTerm::ff);
                            Some(d1.eq(d2))
                        })
                        .collect(),
                )
            };
            (SmtTerm::and(equal_envs), exclusive, required)
        };
        e2.add(assumptions);
        for c in exclusive {
            e2.add(c);
        }
        e2.add(required.not());
        let (result, _) = e2.verify();
        Ok(result)
    }

    fn check_property(
        &self,
        query: &'static str,
        q: &HeaderLocationQuestion,
        instrument: &Instrument<'_>,
        flow_history: bool,
    ) -> Result<Answer, CheckError> {
        let loc = self.locations(q)?;
        let mut question = q.header.clone();
        infer_destination_header_space(&self.graph, &loc.destinations, &mut question.header_space);
        debug!(
            query,
            sources = loc.sources.len(),
            destinations = loc.destinations.len(),
            fail_links = loc.fail_links.len(),
            "resolved query locations"
        );
        self.run_partitions(query, &question, |pq| {
            self.check_property_partition(pq, &loc, instrument, flow_history)
        })
    }

    fn check_property_partition(
        &self,
        q: &HeaderQuestion,
        loc: &Locations,
        instrument: &Instrument<'_>,
        flow_history: bool,
    ) -> Result<Answer, CheckError> {
        let mut enc = Encoder::new(self.graph.clone(), q, &self.options)?;
        let env_type = match q.diff_type {
            Some(_) if q.env_diff => Some(q.delta_env_type),
            Some(_) => None,
            None => Some(q.base_env_type),
        };
        if let Some(t) = env_type {
            for c in environment_constraints(enc.main_slice(), t) {
                enc.add(c);
            }
        }
        let prop = enc.instrument(|pa, e| instrument(pa, e, &loc.sources, &loc.destinations));
        for c in link_failure_constraints(&enc, &loc.destinations, &loc.fail_links) {
            enc.add(c);
        }
        for c in node_failure_constraints(&enc, &loc.fail_nodes) {
            enc.add(c);
        }

        let Some(diff) = q.diff_type else {
            let props = loc
                .sources
                .iter()
                .map(|s| prop_of(&prop, s).map(|p| if q.negate { p.not() } else { p }))
                .collect::<Result<Vec<_>, _>>()?;
            enc.add(SmtTerm::and(props).not());
            let (result, model) = enc.verify();
            let history = flow_history.then(|| match (&result.verdict, &model) {
                (Verdict::Verified, _) => Some(FlowHistory::default()),
                (Verdict::Falsified, Some(m)) => {
                    let reach: IndexMap<String, SmtTerm> = prop
                        .iter()
                        .map(|(r, p)| (r.clone(), if q.negate { p.clone().not() } else { p.clone() }))
                        .collect();
                    Some(CounterExample::new(m).build_flow_history(&enc, &loc.sources, &reach))
                }
                _ => None,
            });
            return Ok(property_answer(result, history));
        };

        // The first copy keeps the failures and is the delta; the extension
        // is the failure-free base network.
        let base_q = HeaderQuestion {
            failures: 0,
            ..q.clone()
        };
        let mut base = Encoder::extend(enc, self.graph.clone(), &base_q)?;
        for c in environment_constraints(base.main_slice(), base_q.base_env_type) {
            base.add(c);
        }
        let prop2 = base.instrument(|pa, e| instrument(pa, e, &loc.sources, &loc.destinations));
        let (related, packets) = {
            let delta = base_of(&base)?;
            let related = if q.env_diff {
                SmtTerm::tt()
            } else {
                relate_environments(delta, &base)?
            };
            (related, relate_packets(delta, &base))
        };
        let required = loc
            .sources
            .iter()
            .map(|s| {
                let (p1, p2) = (prop_of(&prop, s)?, prop_of(&prop2, s)?);
                Ok(match diff {
                    DiffType::Increased => p1.implies(p2),
                    DiffType::Reduced => p2.implies(p1),
                    DiffType::Any => p1.eq(p2),
                })
            })
            .collect::<Result<Vec<_>, CheckError>>()?;
        base.add(related);
        base.add(packets);
        base.add(SmtTerm::and(required).not());

        let (result, model) = base.verify();
        let history = flow_history.then(|| match (&result.verdict, &model) {
            (Verdict::Verified, _) => Some(FlowHistory::default()),
            (Verdict::Falsified, Some(m)) => base.previous().map(|delta| {
                CounterExample::new(m).build_flow_history_diff(&base, delta, &loc.sources, &prop2, &prop)
            }),
            _ => None,
        });
        Ok(property_answer(result, history))
    }

    /// Split the destination space into partitions and check them in
    /// parallel, stopping at the first counterexample.
    fn run_partitions<F>(&self, query: &'static str, question: &HeaderQuestion, check: F) -> Result<Answer, CheckError>
    where
        F: Fn(&HeaderQuestion) -> Result<Answer, CheckError> + Sync,
    {
        let start = Instant::now();
        let spaces = self.partitions(&question.header_space, question.partitioning);
        info!(query, partitions = spaces.len(), "checking property");

        let acc = Mutex::new(Accumulator::default());
        let scan = spaces.into_par_iter().enumerate().try_for_each(|(i, hs)| {
            let pq = HeaderQuestion {
                header_space: hs,
                ..question.clone()
            };
            let answer = check(&pq).map_err(Halt::Failed)?;
            debug!(
                query,
                partition = i,
                verdict = ?answer.result().map(|r| r.verdict_class()),
                "partition checked"
            );
            acc.lock().unwrap_or_else(PoisonError::into_inner).record(answer)
        });
        if let Err(Halt::Failed(e)) = scan {
            return Err(e);
        }

        let answer = acc
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .finish()
            .ok_or_else(|| CheckError::InvalidQuery("no header space to check".into()))?;
        if question.benchmark {
            let stats = answer.result().and_then(|r| r.stats.clone()).unwrap_or_default();
            info!(
                query,
                total_ms = start.elapsed().as_millis() as u64,
                solver_ms = stats.solver_time_ms as u64,
                max_solver_ms = stats.max_solver_time_ms as u64,
                variables = stats.num_variables,
                constraints = stats.num_constraints,
                "benchmark"
            );
        }
        info!(query, holds = answer.holds(), "property checked");
        Ok(answer)
    }

    /// The header spaces checked independently for `hs`.
    fn partitions(&self, hs: &HeaderSpace, mode: Partitioning) -> Vec<HeaderSpace> {
        match mode {
            Partitioning::Single => vec![hs.clone()],
            Partitioning::ByDestinationPrefix => {
                let prefixes: IndexSet<Prefix> = self
                    .graph
                    .routers()
                    .filter_map(|r| self.graph.config(r))
                    .flat_map(all_originated_networks)
                    .filter(|p| covers_destination(hs, *p))
                    .collect();
                let mut out: Vec<HeaderSpace> = prefixes
                    .iter()
                    .map(|p| HeaderSpace {
                        dst_ips: vec![*p],
                        ..hs.clone()
                    })
                    .collect();
                let mut rest = hs.clone();
                rest.not_dst_ips.extend(prefixes.iter().copied());
                out.push(rest);
                out
            }
        }
    }

    fn locations(&self, q: &HeaderLocationQuestion) -> Result<Locations, CheckError> {
        let graph = &self.graph;
        let ingress = full_match_regex(&q.ingress_node_regex)?;
        let final_node = full_match_regex(&q.final_node_regex)?;
        let final_iface = full_match_regex(&q.final_iface_regex)?;

        let sources: Vec<String> = graph.routers().filter(|r| ingress.is_match(r)).cloned().collect();
        if sources.is_empty() {
            return Err(CheckError::InvalidQuery(format!(
                "no router matches ingress regex {:?}",
                q.ingress_node_regex
            )));
        }
        let destinations: IndexSet<EdgeId> = graph
            .edges()
            .iter()
            .filter(|ge| !ge.is_abstract && !ge.is_null_edge)
            .filter(|ge| final_node.is_match(&ge.router) && final_iface.is_match(&ge.start.name))
            .map(|ge| ge.id)
            .collect();
        if destinations.is_empty() {
            return Err(CheckError::InvalidQuery(format!(
                "no interface matches {:?} on a router matching {:?}",
                q.final_iface_regex, q.final_node_regex
            )));
        }

        let (f1, f2) = (full_match_regex(&q.fail_node1_regex)?, full_match_regex(&q.fail_node2_regex)?);
        let (n1, n2) = (
            full_match_regex(&q.not_fail_node1_regex)?,
            full_match_regex(&q.not_fail_node2_regex)?,
        );
        let mut fail_links = matching_edges(graph, &f1, &f2);
        fail_links.extend(matching_edges(graph, &f2, &f1));
        let mut excluded = matching_edges(graph, &n1, &n2);
        excluded.extend(matching_edges(graph, &n2, &n1));
        fail_links.retain(|e| !excluded.contains(e));

        let fail_node = full_match_regex(&q.fail_node_regex)?;
        let not_fail_node = full_match_regex(&q.not_fail_node_regex)?;
        let fail_nodes = graph
            .routers()
            .filter(|r| fail_node.is_match(r) && !not_fail_node.is_match(r))
            .cloned()
            .collect();

        Ok(Locations {
            sources,
            destinations,
            fail_links,
            fail_nodes,
        })
    }
}

fn property_answer(result: VerificationResult, history: Option<Option<FlowHistory>>) -> Answer {
    match history {
        Some(flow_history) => Answer::Reachability { result, flow_history },
        None => Answer::Single(result),
    }
}

fn prop_of(prop: &IndexMap<String, SmtTerm>, router: &str) -> Result<SmtTerm, EncodingError> {
    prop.get(router)
        .cloned()
        .ok_or_else(|| EncodingError::Invariant(format!("no property variable for {router}")))
}

fn best_of<'s>(slice: &'s EncoderSlice, router: &str) -> Result<&'s SymbolicRoute, EncodingError> {
    slice
        .best(router)
        .ok_or_else(|| EncodingError::Invariant(format!("no best record for {router}")))
}

fn base_of(enc: &Encoder) -> Result<&Encoder, EncodingError> {
    enc.previous()
        .ok_or_else(|| EncodingError::Invariant("encoder was not extended from another".into()))
}

fn real_edges_of<'g>(graph: &'g Graph, router: &str) -> impl Iterator<Item = EdgeId> + 'g {
    graph
        .edges_of(router)
        .iter()
        .copied()
        .filter(move |e| !graph.edge(*e).is_abstract)
}

/// Real edges of `router` keyed by interface name.
fn interface_edges(graph: &Graph, router: &str) -> IndexMap<String, EdgeId> {
    real_edges_of(graph, router)
        .map(|e| (graph.edge(e).start.name.clone(), e))
        .collect()
}

/// Edges from a router matching `r1` to a peer matching `r2`. Edges without
/// a modelled peer only need the router to match.
fn matching_edges(graph: &Graph, r1: &Regex, r2: &Regex) -> IndexSet<EdgeId> {
    graph
        .real_edges()
        .filter(|ge| r1.is_match(&ge.router) && ge.peer.as_ref().map_or(true, |p| r2.is_match(p)))
        .map(|ge| ge.id)
        .collect()
}

/// All of `prefix` lies in the destination space of `hs`, up to its
/// negated destinations.
fn covers_destination(hs: &HeaderSpace, prefix: Prefix) -> bool {
    let positive = hs.dst_ips.is_empty() || hs.dst_ips.iter().any(|d| d.contains_prefix(prefix));
    positive && !hs.not_dst_ips.iter().any(|n| n.contains_prefix(prefix))
}

/// Without explicit destination addresses, aim at the addresses behind the
/// destination edges.
fn infer_destination_header_space(graph: &Graph, dests: &IndexSet<EdgeId>, hs: &mut HeaderSpace) {
    if !hs.dst_ips.is_empty() {
        return;
    }
    let mut add = |list: &mut Vec<Prefix>, p: Prefix| {
        if !list.contains(&p) {
            list.push(p);
        }
    };
    for eid in dests {
        let ge = graph.edge(*eid);
        if graph.is_external(*eid) {
            hs.dst_ips.clear();
            hs.not_dst_ips.clear();
            break;
        }
        match &ge.peer {
            None => {
                if let Some(p) = ge.start_prefix() {
                    add(&mut hs.dst_ips, p);
                }
            }
            Some(_) if graph.is_host(&ge.router) => {
                if let Some(p) = ge.start_prefix() {
                    add(&mut hs.dst_ips, p);
                }
                if let Some(ip) = ge.end.as_ref().and_then(|i| i.ip()) {
                    add(&mut hs.not_dst_ips, Prefix::host(ip));
                }
            }
            Some(_) => {
                if let Some(ip) = ge.start.ip() {
                    add(&mut hs.dst_ips, Prefix::host(ip));
                }
            }
        }
    }
}

fn environment_constraints(slice: &EncoderSlice, env_type: EnvironmentType) -> Vec<SmtTerm> {
    let envs = slice.logical_graph.environment().values().map(|id| slice.route(*id));
    match env_type {
        EnvironmentType::Any => Vec::new(),
        EnvironmentType::None => envs.map(|r| r.permitted.clone().not()).collect(),
        EnvironmentType::Sane => envs
            .map(|r| r.metric.clone().le(SmtTerm::int(SANE_ENVIRONMENT_MAX_METRIC)))
            .collect(),
    }
}

/// Links outside the fail set never fail. A destination link may fail only
/// for packets it is not relevant to.
fn link_failure_constraints(
    enc: &Encoder,
    dests: &IndexSet<EdgeId>,
    fail_links: &IndexSet<EdgeId>,
) -> Vec<SmtTerm> {
    let graph = enc.graph();
    let dst_ip = &enc.main_slice().packet.dst_ip;
    let mut out = Vec::new();
    for ge in graph.edges() {
        let Some(f) = enc.failures().failed_variable(graph, ge.id) else {
            continue;
        };
        let not_failed = f.clone().eq(SmtTerm::int(0));
        if !fail_links.contains(&ge.id) {
            out.push(not_failed);
        } else if dests.contains(&ge.id) {
            if let Some(p) = ge.start_prefix() {
                out.push(in_prefix(dst_ip, p).implies(not_failed));
            }
        }
    }
    out
}

fn node_failure_constraints(enc: &Encoder, fail_nodes: &IndexSet<String>) -> Vec<SmtTerm> {
    enc.failures()
        .failed_nodes
        .iter()
        .filter(|(router, _)| !fail_nodes.contains(*router))
        .map(|(_, f)| f.clone().eq(SmtTerm::int(0)))
        .collect()
}

/// Same route attributes and the same permit decision.
fn relate_routes(enc: &Encoder, r1: &SymbolicRoute, r2: &SymbolicRoute) -> Result<SmtTerm, EncodingError> {
    let eq = enc
        .main_slice()
        .equal(&enc.slice_env(), Protocol::Connected, r1, r2, None, true)?;
    Ok(SmtTerm::and(vec![eq, r1.permitted.clone().eq(r2.permitted.clone())]))
}

/// Environment announcements on the same edge agree in both copies.
fn relate_environments(a: &Encoder, b: &Encoder) -> Result<SmtTerm, EncodingError> {
    let sb = b.main_slice();
    let related: HashMap<(EdgeId, EdgeType), &SymbolicRoute> = sb
        .logical_graph
        .environment()
        .iter()
        .map(|(le, id)| ((le.edge, le.edge_type), sb.route(*id)))
        .collect();
    let sa = a.main_slice();
    let mut out = Vec::new();
    for (le, id) in sa.logical_graph.environment() {
        let r2 = related.get(&(le.edge, le.edge_type)).ok_or_else(|| {
            EncodingError::Invariant(format!("no environment on {} in the other copy", a.graph().edge(le.edge)))
        })?;
        out.push(relate_routes(a, sa.route(*id), r2)?);
    }
    Ok(SmtTerm::and(out))
}

fn relate_failures(a: &Encoder, b: &Encoder) -> SmtTerm {
    let (fa, fb) = (a.failures(), b.failures());
    let links = a.graph().real_edges().filter_map(|ge| {
        let x = fa.failed_variable(a.graph(), ge.id)?;
        let y = fb.failed_variable(b.graph(), ge.id)?;
        Some(x.clone().eq(y.clone()))
    });
    let nodes = fa
        .failed_nodes
        .iter()
        .filter_map(|(r, x)| fb.failed_node(r).map(|y| x.clone().eq(y.clone())));
    SmtTerm::and(links.chain(nodes).collect())
}

fn relate_packets(a: &Encoder, b: &Encoder) -> SmtTerm {
    a.main_slice().packet.mk_equal(&b.main_slice().packet)
}

/// Data forwarding of every real edge in both copies.
fn forwarding_pairs<'e>(a: &'e Encoder, b: &'e Encoder) -> Vec<(EdgeId, &'e SmtTerm, &'e SmtTerm)> {
    a.graph()
        .real_edges()
        .filter_map(|ge| {
            let x = a.main_slice().decisions.data(ge.id)?;
            let y = b.main_slice().decisions.data(ge.id)?;
            Some((ge.id, x, y))
        })
        .collect()
}

/// The packet is not destined to a prefix `router` originates itself.
fn outside_originated(slice: &EncoderSlice, router: &str) -> SmtTerm {
    SmtTerm::and(
        slice
            .optimizations
            .protocols_of(router)
            .iter()
            .filter_map(|p| slice.originated(router, *p))
            .map(|prefixes| {
                SmtTerm::or(
                    prefixes
                        .iter()
                        .map(|p| in_prefix(&slice.packet.dst_ip, *p))
                        .collect(),
                )
                .not()
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::fixtures;
    use sweeper_ir::network::RouterConfig;
    use sweeper_smt::ModelValue;

    fn checker(net: Network) -> PropertyChecker {
        PropertyChecker::new(net, EngineOptions::default()).unwrap()
    }

    fn location(ingress: &str, final_node: &str, final_iface: &str) -> HeaderLocationQuestion {
        HeaderLocationQuestion {
            ingress_node_regex: ingress.into(),
            final_node_regex: final_node.into(),
            final_iface_regex: final_iface.into(),
            ..HeaderLocationQuestion::default()
        }
    }

    #[test]
    fn locations_follow_the_regexes() {
        let c = checker(fixtures::ospf_line(3));
        let loc = c.locations(&location("R[01]", "R2", "stub")).unwrap();
        assert_eq!(loc.sources, vec!["R0".to_string(), "R1".to_string()]);
        assert_eq!(loc.destinations.len(), 1);
        let dest = c.graph().edge(loc.destinations[0]);
        assert_eq!(dest.router, "R2");
        assert!(dest.peer.is_none());
        // Every real edge may fail and every router may fail by default.
        assert_eq!(loc.fail_links.len(), c.graph().real_edges().count());
        assert_eq!(loc.fail_nodes.len(), 3);
    }

    #[test]
    fn empty_sources_or_destinations_are_rejected() {
        let c = checker(fixtures::ospf_line(2));
        let err = c.locations(&location("X.*", ".*", ".*")).unwrap_err();
        assert!(matches!(err, CheckError::InvalidQuery(_)));
        let err = c.locations(&location(".*", "R1", "nope")).unwrap_err();
        assert!(matches!(err, CheckError::InvalidQuery(_)));
        let err = c.locations(&location("(", ".*", ".*")).unwrap_err();
        assert!(matches!(err, CheckError::Regex(_)));
    }

    #[test]
    fn fail_sets_exclude_protected_links_and_nodes() {
        let c = checker(fixtures::ospf_line(3));
        let q = HeaderLocationQuestion {
            fail_node1_regex: "R0".into(),
            fail_node2_regex: "R1".into(),
            not_fail_node_regex: "R2".into(),
            ..HeaderLocationQuestion::default()
        };
        let loc = c.locations(&q).unwrap();
        let g = c.graph();
        let names: BTreeSet<String> = loc.fail_links.iter().map(|e| g.edge(*e).to_string()).collect();
        assert_eq!(names.len(), 2);
        assert!(loc
            .fail_links
            .iter()
            .all(|e| matches!(g.edge(*e).router.as_str(), "R0" | "R1")));
        assert!(!loc.fail_nodes.contains("R2"));
        assert!(loc.fail_nodes.contains("R0"));
    }

    #[test]
    fn destination_inference_uses_interface_addresses() {
        let c = checker(fixtures::ospf_line(2));
        let g = c.graph();

        let stub = c.locations(&location(".*", "R1", "stub")).unwrap();
        let mut hs = HeaderSpace::default();
        infer_destination_header_space(g, &stub.destinations, &mut hs);
        assert_eq!(hs.dst_ips, vec![Prefix::new(fixtures::ip("10.0.200.0"), 24)]);

        let link = c.locations(&location(".*", "R1", "to0")).unwrap();
        let mut hs = HeaderSpace::default();
        infer_destination_header_space(g, &link.destinations, &mut hs);
        assert_eq!(hs.dst_ips, vec![Prefix::host(fixtures::ip("10.0.0.2"))]);

        let explicit = Prefix::new(fixtures::ip("1.2.3.0"), 24);
        let mut hs = HeaderSpace::to_destination(explicit);
        infer_destination_header_space(g, &link.destinations, &mut hs);
        assert_eq!(hs.dst_ips, vec![explicit]);
    }

    #[test]
    fn external_destinations_leave_the_space_open() {
        let c = checker(fixtures::single_external_peer());
        let loc = c.locations(&location(".*", "R1", "e0")).unwrap();
        let mut hs = HeaderSpace::default();
        hs.not_dst_ips.push(Prefix::new(fixtures::ip("10.0.0.0"), 8));
        infer_destination_header_space(c.graph(), &loc.destinations, &mut hs);
        assert!(hs.is_unconstrained());
    }

    #[test]
    fn destination_partitions_cover_originated_prefixes_and_the_rest() {
        let c = checker(fixtures::ospf_line(2));
        let hs = HeaderSpace::default();
        assert_eq!(c.partitions(&hs, Partitioning::Single), vec![hs.clone()]);

        let parts = c.partitions(&hs, Partitioning::ByDestinationPrefix);
        let link = Prefix::new(fixtures::ip("10.0.0.0"), 24);
        let stub = Prefix::new(fixtures::ip("10.0.200.0"), 24);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].dst_ips, vec![link]);
        assert_eq!(parts[1].dst_ips, vec![stub]);
        let rest = parts.last().unwrap();
        assert!(rest.dst_ips.is_empty());
        assert_eq!(rest.not_dst_ips, vec![link, stub]);

        let narrow = HeaderSpace::to_destination(stub);
        let parts = c.partitions(&narrow, Partitioning::ByDestinationPrefix);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].dst_ips, vec![stub]);
    }

    #[test]
    fn environment_types_constrain_every_announcement() {
        let g = Arc::new(Graph::new(fixtures::single_external_peer()).unwrap());
        let enc = Encoder::new(g, &HeaderQuestion::default(), &EngineOptions::default()).unwrap();
        let envs = enc.main_slice().logical_graph.environment().len();
        assert!(envs > 0);
        assert!(environment_constraints(enc.main_slice(), EnvironmentType::Any).is_empty());
        assert_eq!(environment_constraints(enc.main_slice(), EnvironmentType::None).len(), envs);

        let m = fixtures::zero_model(enc.encoding());
        let sane = environment_constraints(enc.main_slice(), EnvironmentType::Sane);
        assert!(sane.iter().all(|c| m.eval_bool(c) == Some(true)));
    }

    #[test]
    fn links_outside_the_fail_set_never_fail() {
        let c = checker(fixtures::ospf_line(2));
        let enc = Encoder::new(c.graph.clone(), &HeaderQuestion::default(), &EngineOptions::default()).unwrap();
        let cs = link_failure_constraints(&enc, &IndexSet::new(), &IndexSet::new());
        // One constraint per direction of the shared link plus the stub.
        assert_eq!(cs.len(), 3);

        let mut m = fixtures::zero_model(enc.encoding());
        assert!(cs.iter().all(|c| m.eval_bool(c) == Some(true)));
        m.values.insert("0_FAILED-EDGE_R0_R1".into(), ModelValue::Int(1));
        assert!(cs.iter().any(|c| m.eval_bool(c) == Some(false)));

        let fail_nodes: IndexSet<String> = IndexSet::from(["R0".to_string()]);
        let ns = node_failure_constraints(&enc, &fail_nodes);
        assert_eq!(ns.len(), 1);
    }

    #[test]
    fn destination_links_only_fail_for_other_packets() {
        let c = checker(fixtures::ospf_line(2));
        let loc = c.locations(&location(".*", "R1", "stub")).unwrap();
        let enc = Encoder::new(c.graph.clone(), &HeaderQuestion::default(), &EngineOptions::default()).unwrap();
        let cs = link_failure_constraints(&enc, &loc.destinations, &loc.fail_links);
        assert_eq!(cs.len(), 1);

        let mut m = fixtures::zero_model(enc.encoding());
        m.values.insert("0_FAILED-EDGE_R1_stub".into(), ModelValue::Int(1));
        let SmtTerm::Var(name) = enc.main_slice().packet.dst_ip.clone() else {
            panic!("destination address is not a variable");
        };
        m.values.insert(name.clone(), ModelValue::Int(fixtures::ip("10.0.200.7").as_i64()));
        assert_eq!(m.eval_bool(&cs[0]), Some(false));
        m.values.insert(name, ModelValue::Int(fixtures::ip("10.9.9.9").as_i64()));
        assert_eq!(m.eval_bool(&cs[0]), Some(true));
    }

    #[test]
    fn copies_relate_packets_and_failures() {
        let g = Arc::new(Graph::new(fixtures::ospf_line(2)).unwrap());
        let q = HeaderQuestion::default();
        let first = Encoder::new(g.clone(), &q, &EngineOptions::default()).unwrap();
        let second = Encoder::extend(first, g, &q).unwrap();
        let first = base_of(&second).unwrap();

        let mut m = fixtures::zero_model(second.encoding());
        let failures = relate_failures(first, &second);
        let packets = relate_packets(first, &second);
        assert_eq!(m.eval_bool(&failures), Some(true));
        assert_eq!(m.eval_bool(&packets), Some(true));
        m.values.insert("1_FAILED-NODE_R0".into(), ModelValue::Int(1));
        assert_eq!(m.eval_bool(&failures), Some(false));

        assert_eq!(forwarding_pairs(first, &second).len(), data_edges(&second));
    }

    fn data_edges(enc: &Encoder) -> usize {
        enc.graph()
            .real_edges()
            .filter(|ge| enc.main_slice().decisions.data(ge.id).is_some())
            .count()
    }

    #[test]
    fn multipath_consistency_rejects_negation() {
        let c = checker(fixtures::ospf_line(2));
        let mut q = HeaderLocationQuestion::default();
        q.header.negate = true;
        assert!(matches!(
            c.check_multipath_consistency(&q),
            Err(CheckError::InvalidQuery(_))
        ));
    }

    #[test]
    fn local_equivalence_needs_matching_interfaces() {
        // R0 has one interface, R1 has two.
        let c = checker(fixtures::ospf_line(2));
        let err = c.check_local_equivalence("R[01]", false, false).unwrap_err();
        assert!(matches!(err, CheckError::InvalidQuery(_)));
        // A single router has nothing to compare against.
        let answer = c.check_local_equivalence("R0", false, false).unwrap();
        assert_eq!(answer, Answer::Many(BTreeMap::new()));
    }

    #[test]
    fn local_equivalence_compares_routers_in_both_modes() {
        let mut net = Network::new();
        for (name, addr) in [("E1", "10.1.0.1"), ("E2", "10.2.0.1")] {
            let mut conf = RouterConfig::new(name);
            conf.add_interface(fixtures::iface("lan", addr, 24));
            net.add_router(conf);
        }
        let c = checker(net);
        for strict in [false, true] {
            let Answer::Many(results) = c.check_local_equivalence("E[12]", strict, false).unwrap() else {
                panic!("expected one result per pair");
            };
            assert_eq!(results.keys().collect::<Vec<_>>(), vec!["E1<-->E2"]);
            #[cfg(feature = "z3")]
            if !strict {
                assert!(results["E1<-->E2"].is_verified());
            }
        }
    }

    #[test]
    fn accumulator_prefers_counterexamples_and_sums_stats() {
        let with_stats = |verdict: Verdict, vars: usize| {
            let mut r = VerificationResult::with_verdict(verdict);
            r.stats = Some(VerificationStats {
                partitions: 1,
                num_variables: vars,
                ..Default::default()
            });
            Answer::Single(r)
        };
        let mut acc = Accumulator::default();
        assert!(acc.record(with_stats(Verdict::Verified, 3)).is_ok());
        assert!(acc
            .record(with_stats(Verdict::Inconclusive { reason: "timeout".into() }, 4))
            .is_ok());
        assert!(matches!(
            acc.record(with_stats(Verdict::Falsified, 5)),
            Err(Halt::Counterexample)
        ));
        let answer = acc.finish().unwrap();
        let r = answer.result().unwrap();
        assert_eq!(r.verdict, Verdict::Falsified);
        let stats = r.stats.as_ref().unwrap();
        assert_eq!(stats.partitions, 3);
        assert_eq!(stats.num_variables, 12);
    }

    #[test]
    fn inconclusive_partitions_are_never_reported_verified() {
        let mut acc = Accumulator::default();
        acc.record(Answer::Single(VerificationResult::verified())).ok();
        acc.record(Answer::Single(VerificationResult::inconclusive("unknown"))).ok();
        acc.record(Answer::Single(VerificationResult::verified())).ok();
        let answer = acc.finish().unwrap();
        assert_eq!(answer.result().unwrap().verdict_class(), "inconclusive");
        assert!(!answer.holds());
    }

    #[test]
    fn diff_questions_are_differential() {
        let q = HeaderQuestion {
            diff_type: Some(DiffType::Reduced),
            ..HeaderQuestion::default()
        };
        assert!(q.is_differential());
    }
}
