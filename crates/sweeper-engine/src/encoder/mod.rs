//! Network-wide encoder.
//!
//! An [`Encoder`] owns one SMT [`Encoding`] holding a main slice for the
//! queried header space and, when the network runs iBGP, one IGP slice per
//! iBGP router that models reachability of its session address. Failure
//! variables are shared by every slice. A differential query extends an
//! encoder with a second copy of the network in the same encoding.

pub mod decisions;
#[cfg(test)]
pub(crate) mod fixtures;
pub mod logical_graph;
pub mod optimizations;
pub mod slice;
pub mod symbolic;
pub(crate) mod transfer;

use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use sweeper_ir::addr::{Prefix, SubRange};
use sweeper_ir::graph::{Graph, GraphError};
use sweeper_ir::header_space::{HeaderSpace, IpProtocol};
use sweeper_smt::backends::smtlib_printer::encoding_to_script;
use sweeper_smt::{check_encoding, Encoding, Model, SatResult, SmtSolver, SmtTerm};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::counterexample::CounterExample;
use crate::options::EngineOptions;
use crate::property::adder::PropertyAdder;
use crate::question::HeaderQuestion;
use crate::result::{Verdict, VerificationResult, VerificationStats};

use self::decisions::SymbolicFailures;
use self::slice::{EncoderSlice, SliceEnv};

/// Name of the main slice when the network also has IGP slices.
pub const MAIN_SLICE_NAME: &str = "SLICE-MAIN_";

const BGP_PORT: u32 = 179;

#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("Unsupported construct on {router}: {construct}")]
    Unsupported { router: String, construct: String },
    #[error("Encoding invariant violated: {0}")]
    Invariant(String),
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),
}

#[derive(Debug)]
pub struct Encoder {
    id: usize,
    graph: Arc<Graph>,
    question: HeaderQuestion,
    options: EngineOptions,
    encoding: Encoding,
    failures: SymbolicFailures,
    main_slice: EncoderSlice,
    igp_slices: IndexMap<String, EncoderSlice>,
    slice_reachability: IndexMap<String, IndexMap<String, SmtTerm>>,
    previous: Option<Box<Encoder>>,
}

impl Encoder {
    /// Encode `graph` for `question` in a fresh encoding.
    pub fn new(
        graph: Arc<Graph>,
        question: &HeaderQuestion,
        options: &EngineOptions,
    ) -> Result<Encoder, EncodingError> {
        Self::build(0, Encoding::new(), None, graph, question, options)
    }

    /// Encode a second copy of the network into `previous`'s encoding, so
    /// that constraints can relate the two copies.
    pub fn extend(
        mut previous: Encoder,
        graph: Arc<Graph>,
        question: &HeaderQuestion,
    ) -> Result<Encoder, EncodingError> {
        let encoding = std::mem::take(&mut previous.encoding);
        let options = previous.options.clone();
        let id = previous.id + 1;
        Self::build(id, encoding, Some(Box::new(previous)), graph, question, &options)
    }

    fn build(
        id: usize,
        mut encoding: Encoding,
        previous: Option<Box<Encoder>>,
        graph: Arc<Graph>,
        question: &HeaderQuestion,
        options: &EngineOptions,
    ) -> Result<Encoder, EncodingError> {
        let start = Instant::now();
        let failures = SymbolicFailures::new(&mut encoding, &graph, &id.to_string());
        let model_igp = graph.has_ibgp();
        let main_name = if model_igp { MAIN_SLICE_NAME } else { "" };
        let main_slice = EncoderSlice::new(
            &mut encoding,
            &graph,
            question.header_space.clone(),
            id,
            main_name,
            question.failures,
        );

        let mut igp_slices = IndexMap::new();
        let mut slice_reachability = IndexMap::new();
        if model_igp {
            for (router, ip) in ibgp_session_addresses(&graph)? {
                let name = format!("SLICE-{router}_");
                let slice = EncoderSlice::new(
                    &mut encoding,
                    &graph,
                    session_header_space(ip),
                    id,
                    &name,
                    question.failures,
                );
                let reach = PropertyAdder::new(&slice, &graph).instrument_reachability_to_router(&mut encoding, &router);
                slice_reachability.insert(router.clone(), reach);
                igp_slices.insert(router, slice);
            }
        }

        let mut encoder = Encoder {
            id,
            graph,
            question: question.clone(),
            options: options.clone(),
            encoding,
            failures,
            main_slice,
            igp_slices,
            slice_reachability,
            previous,
        };
        encoder.compute_encoding()?;
        info!(
            encoder = id,
            slices = 1 + encoder.igp_slices.len(),
            variables = encoder.encoding.declarations.len(),
            assertions = encoder.encoding.assertions.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "network encoded"
        );
        Ok(encoder)
    }

    fn compute_encoding(&mut self) -> Result<(), EncodingError> {
        let Encoder {
            graph,
            question,
            options,
            encoding,
            failures,
            main_slice,
            igp_slices,
            slice_reachability,
            ..
        } = self;
        for c in failures.constraints(question.failures) {
            encoding.assert_term(c);
        }
        let env = SliceEnv {
            graph,
            options,
            bgp_ranking: &question.bgp_ranking,
            model_overflow: question.model_overflow,
            failures,
            igp_slices,
            slice_reachability,
        };
        main_slice.compute_encoding(encoding, &env)?;
        for slice in igp_slices.values() {
            slice.compute_encoding(encoding, &env)?;
        }
        Ok(())
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn question(&self) -> &HeaderQuestion {
        &self.question
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn encoding(&self) -> &Encoding {
        &self.encoding
    }

    pub fn failures(&self) -> &SymbolicFailures {
        &self.failures
    }

    pub fn main_slice(&self) -> &EncoderSlice {
        &self.main_slice
    }

    pub fn igp_slices(&self) -> &IndexMap<String, EncoderSlice> {
        &self.igp_slices
    }

    /// The encoder this one was extended from.
    pub fn previous(&self) -> Option<&Encoder> {
        self.previous.as_deref()
    }

    /// Shared view of the encoder for evaluating slice comparisons.
    pub fn slice_env(&self) -> SliceEnv<'_> {
        SliceEnv {
            graph: &self.graph,
            options: &self.options,
            bgp_ranking: &self.question.bgp_ranking,
            model_overflow: self.question.model_overflow,
            failures: &self.failures,
            igp_slices: &self.igp_slices,
            slice_reachability: &self.slice_reachability,
        }
    }

    /// Assert `term` in the shared encoding.
    pub fn add(&mut self, term: SmtTerm) {
        self.encoding.assert_term(term);
    }

    /// Declare and constrain property variables of the main slice.
    pub fn instrument<T>(&mut self, f: impl FnOnce(&PropertyAdder<'_>, &mut Encoding) -> T) -> T {
        let adder = PropertyAdder::new(&self.main_slice, &self.graph);
        f(&adder, &mut self.encoding)
    }

    /// Same as [`Encoder::instrument`] on the encoder this one extends.
    pub fn instrument_previous<T>(
        &mut self,
        f: impl FnOnce(&PropertyAdder<'_>, &mut Encoding) -> T,
    ) -> Option<T> {
        let previous = self.previous.as_deref()?;
        let adder = PropertyAdder::new(&previous.main_slice, &previous.graph);
        Some(f(&adder, &mut self.encoding))
    }

    fn stats(&self, solver_time_ms: u128) -> VerificationStats {
        VerificationStats {
            partitions: 1,
            num_nodes: self.graph.routers().count(),
            num_edges: self
                .graph
                .routers()
                .filter_map(|r| self.graph.neighbors(r))
                .map(|n| n.len())
                .sum(),
            num_variables: self.encoding.declarations.len(),
            num_constraints: self.encoding.assertions.len(),
            solver_time_ms,
            max_solver_time_ms: solver_time_ms,
        }
    }

    fn dump_smt(&self) {
        let Some(path) = &self.options.dump_smt else {
            return;
        };
        if let Err(e) = std::fs::write(path, encoding_to_script(&self.encoding)) {
            warn!(path = %path, error = %e, "could not write SMT-LIB dump");
        }
    }

    /// Flip at least one announcement that the counterexample uses off, and
    /// keep the unused ones off.
    fn environment_blocking_clause(&self, model: &Model) -> Option<SmtTerm> {
        let mut used = Vec::new();
        let mut unused = Vec::new();
        for id in self.main_slice.logical_graph.environment().values() {
            let r = self.main_slice.route(*id);
            for v in std::iter::once(&r.permitted).chain(r.communities.values()) {
                if model.eval_bool(v) == Some(true) {
                    used.push(v.clone().not());
                } else {
                    unused.push(v.clone().not());
                }
            }
        }
        if used.is_empty() {
            return None;
        }
        Some(SmtTerm::and(vec![SmtTerm::or(used), SmtTerm::and(unused)]))
    }

    /// Check the encoding with `solver`. UNSAT means the asserted negation
    /// of the property has no solution, so the property holds. The model of
    /// a SAT answer is returned alongside the result.
    pub fn verify_with<S: SmtSolver>(&mut self, solver: &mut S) -> (VerificationResult, Option<Model>) {
        self.dump_smt();
        let start = Instant::now();
        let (sat, mut model) = match check_encoding(solver, &self.encoding) {
            Ok(r) => r,
            Err(e) => {
                warn!(encoder = self.id, error = %e, "solver failed");
                let mut result = VerificationResult::inconclusive(e.to_string());
                result.stats = Some(self.stats(start.elapsed().as_millis()));
                return (result, None);
            }
        };

        let verdict = match sat {
            SatResult::Unsat => Verdict::Verified,
            SatResult::Sat => Verdict::Falsified,
            SatResult::Unknown(reason) => Verdict::Inconclusive { reason },
        };
        if verdict == Verdict::Falsified && self.question.minimize {
            model = self.minimize(solver, model);
        }

        let mut result = VerificationResult::with_verdict(verdict);
        result.stats = Some(self.stats(start.elapsed().as_millis()));
        if result.verdict == Verdict::Falsified {
            if let Some(m) = &model {
                CounterExample::new(m).fill_result(self, &mut result);
            }
        }
        debug!(
            encoder = self.id,
            verdict = %result.verdict,
            solver_ms = start.elapsed().as_millis() as u64,
            "verification finished"
        );
        (result, model)
    }

    /// Drop environment announcements from the counterexample until the
    /// solver can no longer do without the remaining ones.
    fn minimize<S: SmtSolver>(&mut self, solver: &mut S, mut model: Option<Model>) -> Option<Model> {
        let mut rounds = 0usize;
        while let Some(block) = model.as_ref().and_then(|m| self.environment_blocking_clause(m)) {
            self.encoding.assert_term(block);
            rounds += 1;
            match check_encoding(solver, &self.encoding) {
                Ok((SatResult::Sat, Some(next))) => model = Some(next),
                Ok(_) => break,
                Err(e) => {
                    warn!(encoder = self.id, error = %e, "solver failed during minimization");
                    break;
                }
            }
        }
        debug!(encoder = self.id, rounds, "minimized environment");
        model
    }

    /// Check the encoding with the default solver backend.
    #[cfg(feature = "z3")]
    pub fn verify(&mut self) -> (VerificationResult, Option<Model>) {
        let mut solver = sweeper_smt::Z3Solver::with_timeout_secs(self.options.timeout_secs);
        self.verify_with(&mut solver)
    }

    #[cfg(not(feature = "z3"))]
    pub fn verify(&mut self) -> (VerificationResult, Option<Model>) {
        (VerificationResult::inconclusive("built without a solver backend"), None)
    }
}

/// The iBGP session source address of every router, first session first.
fn ibgp_session_addresses(graph: &Graph) -> Result<IndexMap<String, sweeper_ir::addr::Ip>, EncodingError> {
    let mut out = IndexMap::new();
    for router in graph.routers() {
        for eid in graph.edges_of(router) {
            let Some(n) = graph.ibgp_neighbor(*eid) else {
                continue;
            };
            if out.contains_key(router) {
                continue;
            }
            let ip = n.local_ip.ok_or_else(|| {
                EncodingError::Invariant(format!("iBGP session on {router} has no local address"))
            })?;
            out.insert(router.clone(), ip);
        }
    }
    Ok(out)
}

/// BGP session packets towards `ip`.
fn session_header_space(ip: sweeper_ir::addr::Ip) -> HeaderSpace {
    HeaderSpace {
        dst_ips: vec![Prefix::host(ip)],
        dst_ports: vec![SubRange::singleton(BGP_PORT)],
        ip_protocols: vec![IpProtocol::TCP],
        ..HeaderSpace::default()
    }
}
