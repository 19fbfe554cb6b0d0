use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use sweeper_ir::addr::{Ip, Prefix};

/// Outcome of one solver query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Verdict {
    /// The negated property is unsatisfiable.
    Verified,
    /// The solver found a counterexample.
    Falsified,
    /// The solver gave up or failed.
    Inconclusive { reason: String },
}

impl Verdict {
    /// Stable machine-readable class of the verdict.
    pub fn verdict_class(&self) -> &'static str {
        match self {
            Verdict::Verified => "verified",
            Verdict::Falsified => "falsified",
            Verdict::Inconclusive { .. } => "inconclusive",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Verified => write!(f, "verified"),
            Verdict::Falsified => write!(f, "falsified"),
            Verdict::Inconclusive { reason } => write!(f, "inconclusive ({reason})"),
        }
    }
}

/// Size and timing of the encodings behind a result.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VerificationStats {
    pub partitions: usize,
    pub num_nodes: usize,
    pub num_edges: usize,
    pub num_variables: usize,
    pub num_constraints: usize,
    pub solver_time_ms: u128,
    pub max_solver_time_ms: u128,
}

impl VerificationStats {
    /// Fold the statistics of another partition into these.
    pub fn combine(&mut self, other: &VerificationStats) {
        self.partitions += other.partitions;
        self.num_nodes = self.num_nodes.max(other.num_nodes);
        self.num_edges = self.num_edges.max(other.num_edges);
        self.num_variables += other.num_variables;
        self.num_constraints += other.num_constraints;
        self.solver_time_ms += other.solver_time_ms;
        self.max_solver_time_ms = self.max_solver_time_ms.max(other.max_solver_time_ms);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationResult {
    pub verdict: Verdict,
    /// Every variable assignment, when a full model was requested.
    pub model: BTreeMap<String, String>,
    pub packet_model: BTreeMap<String, String>,
    /// Permitted environment announcements, keyed by route variable.
    pub env_model: BTreeMap<String, String>,
    /// Edges that forward data in the counterexample.
    pub fwd_model: BTreeSet<String>,
    pub failures: BTreeSet<String>,
    pub stats: Option<VerificationStats>,
}

impl VerificationResult {
    pub fn verified() -> Self {
        Self::with_verdict(Verdict::Verified)
    }

    pub fn inconclusive(reason: impl Into<String>) -> Self {
        Self::with_verdict(Verdict::Inconclusive {
            reason: reason.into(),
        })
    }

    pub fn with_verdict(verdict: Verdict) -> Self {
        VerificationResult {
            verdict,
            model: BTreeMap::new(),
            packet_model: BTreeMap::new(),
            env_model: BTreeMap::new(),
            fwd_model: BTreeSet::new(),
            failures: BTreeSet::new(),
            stats: None,
        }
    }

    pub fn is_verified(&self) -> bool {
        self.verdict == Verdict::Verified
    }

    pub fn verdict_class(&self) -> &'static str {
        self.verdict.verdict_class()
    }
}

impl fmt::Display for VerificationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Result: {}", self.verdict)?;
        for (k, v) in &self.packet_model {
            writeln!(f, "  packet {k} = {v}")?;
        }
        for (k, v) in &self.env_model {
            writeln!(f, "  environment {k}: {v}")?;
        }
        for e in &self.fwd_model {
            writeln!(f, "  forwarding {e}")?;
        }
        for e in &self.failures {
            writeln!(f, "  failed {e}")?;
        }
        Ok(())
    }
}

/// A concrete packet entering the network at a router.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Flow {
    pub ingress_node: String,
    pub src_ip: Ip,
    pub dst_ip: Ip,
    pub src_port: i64,
    pub dst_port: i64,
    pub ip_protocol: i64,
    pub icmp_type: i64,
    pub icmp_code: i64,
    /// Flag values in the order ack, cwr, ece, fin, psh, rst, syn, urg.
    pub tcp_flags: [i64; 8],
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Flow<ingress:{} src:{}:{} dst:{}:{} proto:{}>",
            self.ingress_node, self.src_ip, self.src_port, self.dst_ip, self.dst_port, self.ip_protocol
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FlowDisposition {
    Accepted,
    DeniedIn,
    DeniedOut,
    Loop,
    NoRoute,
    InsufficientInfo,
}

impl fmt::Display for FlowDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlowDisposition::Accepted => "ACCEPTED",
            FlowDisposition::DeniedIn => "DENIED_IN",
            FlowDisposition::DeniedOut => "DENIED_OUT",
            FlowDisposition::Loop => "LOOP",
            FlowDisposition::NoRoute => "NO_ROUTE",
            FlowDisposition::InsufficientInfo => "INSUFFICIENT_INFO",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowTraceHop {
    /// `router:iface -> peer:iface`
    pub edge: String,
    /// Routes the hop was forwarded by.
    pub routes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowTrace {
    pub disposition: FlowDisposition,
    pub hops: Vec<FlowTraceHop>,
    pub notes: String,
}

/// An announcement received from an external BGP peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentRoute {
    pub router: String,
    pub network: Prefix,
    pub as_path_length: i64,
    pub local_pref: i64,
    pub communities: Vec<String>,
    pub src_node: String,
    pub src_ip: Ip,
    pub dst_ip: Ip,
}

/// Failed links and external announcements of one counterexample.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Environment {
    pub failed_links: BTreeSet<String>,
    pub routes: Vec<EnvironmentRoute>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowHistoryEntry {
    pub flow: Flow,
    /// `BASE` or `DELTA`.
    pub label: String,
    pub environment: Environment,
    pub trace: FlowTrace,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlowHistory {
    pub entries: Vec<FlowHistoryEntry>,
}

impl FlowHistory {
    pub fn add_flow_trace(
        &mut self,
        flow: Flow,
        label: &str,
        environment: Environment,
        trace: FlowTrace,
    ) {
        self.entries.push(FlowHistoryEntry {
            flow,
            label: label.to_string(),
            environment,
            trace,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Answer to a property query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Answer {
    /// A single verification result.
    Single(VerificationResult),
    Reachability {
        result: VerificationResult,
        flow_history: Option<FlowHistory>,
    },
    /// Two forwarding outcomes for the same flow, when nondeterminism was
    /// found.
    Determinism {
        flow: Option<Flow>,
        forwarding1: BTreeSet<String>,
        forwarding2: BTreeSet<String>,
    },
    /// One result per compared pair, keyed `r1<-->r2`.
    Many(BTreeMap<String, VerificationResult>),
}

impl Answer {
    pub fn result(&self) -> Option<&VerificationResult> {
        match self {
            Answer::Single(r) | Answer::Reachability { result: r, .. } => Some(r),
            Answer::Determinism { .. } | Answer::Many(_) => None,
        }
    }

    pub fn result_mut(&mut self) -> Option<&mut VerificationResult> {
        match self {
            Answer::Single(r) | Answer::Reachability { result: r, .. } => Some(r),
            Answer::Determinism { .. } | Answer::Many(_) => None,
        }
    }

    /// True when the query found no counterexample.
    pub fn holds(&self) -> bool {
        match self {
            Answer::Single(r) | Answer::Reachability { result: r, .. } => r.is_verified(),
            Answer::Determinism { flow, .. } => flow.is_none(),
            Answer::Many(rs) => rs.values().all(VerificationResult::is_verified),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_classes_are_stable() {
        assert_eq!(VerificationResult::verified().verdict_class(), "verified");
        assert_eq!(
            VerificationResult::inconclusive("timeout").verdict_class(),
            "inconclusive"
        );
        assert_eq!(
            VerificationResult::with_verdict(Verdict::Falsified).verdict_class(),
            "falsified"
        );
    }

    #[test]
    fn stats_combine_sums_work_and_keeps_peaks() {
        let mut a = VerificationStats {
            partitions: 1,
            num_nodes: 3,
            num_variables: 10,
            solver_time_ms: 5,
            max_solver_time_ms: 5,
            ..Default::default()
        };
        let b = VerificationStats {
            partitions: 1,
            num_nodes: 2,
            num_variables: 7,
            solver_time_ms: 9,
            max_solver_time_ms: 9,
            ..Default::default()
        };
        a.combine(&b);
        assert_eq!(a.partitions, 2);
        assert_eq!(a.num_nodes, 3);
        assert_eq!(a.num_variables, 17);
        assert_eq!(a.solver_time_ms, 14);
        assert_eq!(a.max_solver_time_ms, 9);
    }

    #[test]
    fn many_answer_holds_only_if_every_pair_verified() {
        let mut rs = BTreeMap::new();
        rs.insert("a<-->b".to_string(), VerificationResult::verified());
        assert!(Answer::Many(rs.clone()).holds());
        rs.insert(
            "b<-->c".to_string(),
            VerificationResult::with_verdict(Verdict::Falsified),
        );
        assert!(!Answer::Many(rs).holds());
    }

    #[test]
    fn result_serializes_to_json() {
        let json = serde_json::to_value(VerificationResult::verified()).unwrap();
        assert_eq!(json["verdict"], "Verified");
    }
}
