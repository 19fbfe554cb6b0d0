//! SSA compilation of routing policies into transfer-function formulas.
//!
//! A policy is compiled against an input route (`other`) and an output
//! route (`current`). The resulting formula says: when the policy accepts,
//! `current` is the transformed `other`; otherwise `current` is not
//! permitted. Assignments create new SSA versions of a field; `If`
//! statements merge the versions of both branches with `ite` at a join
//! point.

use indexmap::IndexMap;
use sweeper_ir::addr::PrefixRange;
use sweeper_ir::community::CommunityVar;
use sweeper_ir::graph::{originated_networks, EdgeId, Graph};
use sweeper_ir::network::RouterConfig;
use sweeper_ir::policy::{
    BooleanExpr, CommunitySetExpr, IntExpr, OspfMetricType, PrefixSetExpr, Statement,
};
use sweeper_ir::protocol::{BgpSendType, Protocol};
use sweeper_smt::{Encoding, SmtSort, SmtTerm};
use tracing::{debug, warn};

use super::slice::{EncoderSlice, SliceEnv};
use super::symbolic::{in_prefix, OspfType, SymbolicRoute};
use super::EncodingError;
use crate::options::SoundnessMode;

const MAX_CALL_DEPTH: usize = 64;

/// A route attribute a policy can rewrite.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Field {
    PrefixLen,
    Metric,
    LocalPref,
    OspfType,
    Community(CommunityVar),
}

impl Field {
    fn ssa_name(&self) -> String {
        match self {
            Field::PrefixLen => "PREFIX-LEN".into(),
            Field::Metric => "METRIC".into(),
            Field::LocalPref => "LOCAL-PREF".into(),
            Field::OspfType => "OSPF-TYPE".into(),
            Field::Community(c) => c.var_suffix(),
        }
    }

    fn sort(&self) -> SmtSort {
        match self {
            Field::Community(_) => SmtSort::Bool,
            _ => SmtSort::Int,
        }
    }

    fn default_value(&self) -> SmtTerm {
        match self {
            Field::Community(_) => SmtTerm::ff(),
            Field::LocalPref => SmtTerm::int(100),
            _ => SmtTerm::int(0),
        }
    }
}

/// Something a compiled fragment may have changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Var {
    Return,
    Fallthrough,
    Field(Field),
}

/// Current SSA version of every field, as indices into the arena.
#[derive(Debug, Clone, Default)]
struct RouteState {
    versions: IndexMap<Field, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallContext {
    None,
    Expr,
    Stmt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainContext {
    None,
    Conjunction,
}

#[derive(Debug, Clone)]
struct Param {
    state: RouteState,
    call_context: CallContext,
    chain_context: ChainContext,
    default_accept: bool,
    default_accept_local: bool,
    default_policy: Option<String>,
    depth: usize,
    initial_call: bool,
}

impl Param {
    fn new(state: RouteState) -> Self {
        Param {
            state,
            call_context: CallContext::None,
            chain_context: ChainContext::None,
            default_accept: true,
            default_accept_local: false,
            default_policy: None,
            depth: 0,
            initial_call: true,
        }
    }

    fn indented(&self) -> Self {
        Param {
            depth: self.depth + 1,
            initial_call: false,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone)]
struct TransferResult {
    return_value: SmtTerm,
    return_assigned: SmtTerm,
    fallthrough: SmtTerm,
    changed: IndexMap<Var, SmtTerm>,
}

impl TransferResult {
    fn initial() -> Self {
        TransferResult {
            return_value: SmtTerm::ff(),
            return_assigned: SmtTerm::ff(),
            fallthrough: SmtTerm::ff(),
            changed: IndexMap::new(),
        }
    }

    fn from_expr(b: SmtTerm) -> Self {
        TransferResult {
            return_value: b,
            return_assigned: SmtTerm::tt(),
            ..Self::initial()
        }
    }

    fn merge_changed(&mut self, other: &TransferResult) {
        for (k, v) in &other.changed {
            self.changed.insert(k.clone(), v.clone());
        }
    }

    fn is_changed(&self, f: &Field) -> bool {
        self.changed.contains_key(&Var::Field(f.clone()))
    }
}

/// Compiler for one transfer function.
pub(crate) struct TransferSsa<'a, 'e> {
    slice: &'a EncoderSlice,
    env: &'a SliceEnv<'e>,
    conf: &'a RouterConfig,
    router: &'a str,
    proto: Protocol,
    statements: &'a [Statement],
    other: &'a SymbolicRoute,
    current: &'a SymbolicRoute,
    edge: EdgeId,
    added_cost: i64,
    is_export: bool,
    arena: Vec<SmtTerm>,
}

impl<'a, 'e> TransferSsa<'a, 'e> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        slice: &'a EncoderSlice,
        env: &'a SliceEnv<'e>,
        conf: &'a RouterConfig,
        other: &'a SymbolicRoute,
        current: &'a SymbolicRoute,
        proto: Protocol,
        statements: &'a [Statement],
        added_cost: i64,
        edge: EdgeId,
        is_export: bool,
    ) -> Self {
        TransferSsa {
            slice,
            env,
            router: &conf.hostname,
            conf,
            proto,
            statements,
            other,
            current,
            edge,
            added_cost,
            is_export,
            arena: Vec::new(),
        }
    }

    /// Compile the policy. SSA definitions too large to inline are asserted
    /// into `enc` as they are created.
    pub(crate) fn compute(mut self, enc: &mut Encoding) -> Result<SmtTerm, EncodingError> {
        let state = self.initial_state();
        let mut p = Param::new(state);
        self.intermediate_prefix_len(enc, &mut p);
        self.apply_metric_update(&mut p);
        let statements = self.statements;
        let result = self.compile_statements(enc, statements, &mut p, TransferResult::initial())?;
        Ok(result.return_value)
    }

    fn graph(&self) -> &'e Graph {
        self.env.graph
    }

    fn initial_state(&mut self) -> RouteState {
        let mut state = RouteState::default();
        let other = self.other;
        self.set(&mut state, Field::PrefixLen, other.prefix_length.clone());
        self.set(&mut state, Field::Metric, other.metric.clone());
        let lp = other
            .local_pref
            .get()
            .cloned()
            .unwrap_or_else(|| SmtTerm::int(100));
        self.set(&mut state, Field::LocalPref, lp);
        if let Some(t) = other.ospf_type.get() {
            self.set(&mut state, Field::OspfType, t.term().clone());
        }
        for (c, v) in &other.communities {
            self.set(&mut state, Field::Community(c.clone()), v.clone());
        }
        state
    }

    fn get(&self, state: &RouteState, f: &Field) -> Option<SmtTerm> {
        state.versions.get(f).map(|i| self.arena[*i].clone())
    }

    fn get_or_default(&self, state: &RouteState, f: &Field) -> SmtTerm {
        self.get(state, f).unwrap_or_else(|| f.default_value())
    }

    fn set(&mut self, state: &mut RouteState, f: Field, term: SmtTerm) {
        self.arena.push(term);
        state.versions.insert(f, self.arena.len() - 1);
    }

    /// Inline `term` when small, otherwise bind it to a fresh SSA constant.
    fn create(&self, enc: &mut Encoding, name: &str, term: SmtTerm, sort: SmtSort) -> SmtTerm {
        let simple = term.simplify();
        if simple.size() <= self.env.options.inline_threshold {
            return simple;
        }
        let var = enc.declare(
            format!("{}SSA_{}{}", self.slice.prefix(), name, self.slice.next_ssa_id()),
            sort,
        );
        enc.assert_term(var.clone().eq(simple));
        var
    }

    fn unsupported(&self, construct: &str) -> Result<(), EncodingError> {
        match self.env.options.soundness {
            SoundnessMode::Strict => Err(EncodingError::Unsupported {
                router: self.router.to_string(),
                construct: construct.to_string(),
            }),
            SoundnessMode::Permissive => {
                warn!(router = self.router, construct, "approximating unsupported policy construct");
                Ok(())
            }
        }
    }

    fn return_value(&self, enc: &mut Encoding, mut r: TransferResult, val: bool) -> TransferResult {
        let b = r
            .return_assigned
            .clone()
            .ite(r.return_value.clone(), SmtTerm::bool(val));
        let ret = self.create(enc, "RETURN", b, SmtSort::Bool);
        r.return_value = ret.clone();
        r.return_assigned = SmtTerm::tt();
        r.changed.insert(Var::Return, ret);
        r
    }

    fn fallthrough(&self, enc: &mut Encoding, mut r: TransferResult) -> TransferResult {
        let b = r
            .return_assigned
            .clone()
            .ite(r.fallthrough.clone(), SmtTerm::tt());
        let ft = self.create(enc, "FALLTHROUGH", b, SmtSort::Bool);
        r.fallthrough = ft.clone();
        r.return_assigned = SmtTerm::tt();
        r.changed.insert(Var::Fallthrough, ft);
        r
    }

    /// Record a new version of `field`, unless the policy already returned.
    fn assign(
        &mut self,
        enc: &mut Encoding,
        p: &mut Param,
        result: &mut TransferResult,
        field: Field,
        new_value: SmtTerm,
    ) {
        let old = self.get_or_default(&p.state, &field);
        let v = result.return_assigned.clone().ite(old, new_value);
        let x = self.create(enc, &field.ssa_name(), v, field.sort());
        self.set(&mut p.state, field.clone(), x.clone());
        result.changed.insert(Var::Field(field), x);
    }

    fn compile_statements(
        &mut self,
        enc: &mut Encoding,
        statements: &[Statement],
        p: &mut Param,
        mut result: TransferResult,
    ) -> Result<TransferResult, EncodingError> {
        let mut does_return = false;
        for stmt in statements {
            match stmt {
                Statement::ExitAccept | Statement::ReturnTrue | Statement::Unsuppress => {
                    does_return = true;
                    result = self.return_value(enc, result, true);
                }
                Statement::ExitReject | Statement::ReturnFalse | Statement::Suppress => {
                    does_return = true;
                    result = self.return_value(enc, result, false);
                }
                Statement::SetDefaultActionAccept => p.default_accept = true,
                Statement::SetDefaultActionReject => p.default_accept = false,
                Statement::SetLocalDefaultActionAccept => p.default_accept_local = true,
                Statement::SetLocalDefaultActionReject => p.default_accept_local = false,
                Statement::ReturnLocalDefaultAction => {
                    result = self.return_value(enc, result, p.default_accept_local);
                }
                Statement::FallThrough => result = self.fallthrough(enc, result),
                Statement::Return => {}
                Statement::If {
                    guard,
                    true_statements,
                    false_statements,
                } => {
                    result = self.compile_if(enc, guard, true_statements, false_statements, p, result)?;
                }
                Statement::SetDefaultPolicy(name) => p.default_policy = Some(name.clone()),
                Statement::SetMetric(e) => {
                    if !self.current.proto.is_bgp() {
                        let old = self.get_or_default(&p.state, &Field::Metric);
                        let new_value = modify(old, e);
                        self.assign(enc, p, &mut result, Field::Metric, new_value);
                    }
                }
                Statement::SetOspfMetricType(t) => {
                    let ty = match t {
                        OspfMetricType::E1 => OspfType::E1,
                        OspfMetricType::E2 => OspfType::E2,
                    };
                    self.assign(enc, p, &mut result, Field::OspfType, ty.term());
                }
                Statement::SetLocalPreference(e) => {
                    let old = self.get_or_default(&p.state, &Field::LocalPref);
                    let new_value = modify(old, e);
                    self.assign(enc, p, &mut result, Field::LocalPref, new_value);
                }
                Statement::AddCommunity(e) | Statement::SetCommunity(e) => {
                    for c in self.community_vars(e)? {
                        self.assign(enc, p, &mut result, Field::Community(c), SmtTerm::tt());
                    }
                }
                Statement::DeleteCommunity(e) => {
                    for c in self.communities_to_delete(e)? {
                        self.assign(enc, p, &mut result, Field::Community(c), SmtTerm::ff());
                    }
                }
                Statement::PrependAsPath(e) => {
                    let old = self.get_or_default(&p.state, &Field::Metric);
                    let new_value = old.add(SmtTerm::int(e.prepend_length()));
                    self.assign(enc, p, &mut result, Field::Metric, new_value);
                }
                Statement::SetOrigin(_) => self.unsupported("set origin")?,
                Statement::SetNextHop(_) => self.unsupported("set next-hop")?,
                Statement::RemovePrivateAs => self.unsupported("remove private-as")?,
                Statement::SetWeight(_) => self.unsupported("set weight")?,
                Statement::SetTag(_) => self.unsupported("set tag")?,
            }
        }

        if p.initial_call {
            if !does_return {
                result = self.return_value(enc, result, p.default_accept);
            }
            let related = self.relate_variables(p, &result)?;
            result.return_value = result
                .return_value
                .clone()
                .ite(related, self.current.permitted.clone().not());
        }
        Ok(result)
    }

    fn community_vars(&self, e: &CommunitySetExpr) -> Result<Vec<CommunityVar>, EncodingError> {
        if let CommunitySetExpr::Named(name) = e {
            if !self.conf.community_lists.contains_key(name) {
                return Err(EncodingError::Invariant(format!(
                    "unknown community list {name} on {}",
                    self.router
                )));
            }
        }
        Ok(self.conf.community_vars(e))
    }

    fn communities_to_delete(&self, e: &CommunitySetExpr) -> Result<Vec<CommunityVar>, EncodingError> {
        let deps = self.graph().community_dependencies();
        let mut out = Vec::new();
        for c in self.community_vars(e)? {
            if c.is_regex() {
                out.extend(deps.get(&c).into_iter().flatten().cloned());
            } else {
                out.push(c);
            }
        }
        Ok(out)
    }

    fn compile_if(
        &mut self,
        enc: &mut Encoding,
        guard: &BooleanExpr,
        true_statements: &[Statement],
        false_statements: &[Statement],
        p: &mut Param,
        mut result: TransferResult,
    ) -> Result<TransferResult, EncodingError> {
        let r = self.compile_expr(enc, guard, p)?;
        // Guards may rewrite fields (prefix length for BGP origination).
        for (var, term) in &r.changed {
            if let Var::Field(f) = var {
                self.set(&mut p.state, f.clone(), term.clone());
                result.changed.insert(var.clone(), term.clone());
            }
        }
        let g = r.return_value.simplify();

        if g.is_true() || g.is_false() {
            let branch = if g.is_true() { true_statements } else { false_statements };
            let mut child = p.indented();
            result = self.compile_statements(enc, branch, &mut child, result)?;
            p.state = child.state;
            return Ok(result);
        }

        let mut p1 = p.indented();
        let mut p2 = p.indented();
        let tr = self.compile_statements(enc, true_statements, &mut p1, TransferResult::initial())?;
        let fr = self.compile_statements(enc, false_statements, &mut p2, TransferResult::initial())?;
        debug!(
            router = self.router,
            depth = p.depth,
            changed = tr.changed.len() + fr.changed.len(),
            "joining branches"
        );

        let mut keys: Vec<Var> = tr.changed.keys().cloned().collect();
        for k in fr.changed.keys() {
            if !keys.contains(k) {
                keys.push(k.clone());
            }
        }
        if let Some(i) = keys.iter().position(|k| *k == Var::Return) {
            let ret = keys.remove(i);
            keys.push(ret);
        }

        let pre_assigned = result.return_assigned.clone();
        let mut assigned = pre_assigned.clone();
        for key in keys {
            let tv = tr.changed.get(&key).cloned();
            let fv = fr.changed.get(&key).cloned();
            match &key {
                Var::Return | Var::Fallthrough => {
                    let tass = if tv.is_some() { SmtTerm::tt() } else { pre_assigned.clone() };
                    let fass = if fv.is_some() { SmtTerm::tt() } else { pre_assigned.clone() };
                    let t = tv.unwrap_or_else(SmtTerm::ff);
                    let f = fv.unwrap_or_else(SmtTerm::ff);
                    let new_ass = g.clone().ite(tass, fass);
                    assigned = self.create(enc, "ASSIGNED", new_ass, SmtSort::Bool);
                    let (name, old) = if key == Var::Return {
                        ("RETURN", result.return_value.clone())
                    } else {
                        ("FALLTHROUGH", result.fallthrough.clone())
                    };
                    let value = pre_assigned.clone().ite(old, g.clone().ite(t, f));
                    let x = self.create(enc, name, value, SmtSort::Bool);
                    if key == Var::Return {
                        result.return_value = x.clone();
                    } else {
                        result.fallthrough = x.clone();
                    }
                    result.changed.insert(key.clone(), x);
                }
                Var::Field(field) => {
                    let cur = self.get_or_default(&p.state, field);
                    let t = tv.unwrap_or_else(|| cur.clone());
                    let f = fv.unwrap_or_else(|| cur.clone());
                    let value = pre_assigned.clone().ite(cur, g.clone().ite(t, f));
                    let x = self.create(enc, &field.ssa_name(), value, field.sort());
                    self.set(&mut p.state, field.clone(), x.clone());
                    result.changed.insert(key.clone(), x);
                }
            }
        }
        result.return_assigned = assigned;
        Ok(result)
    }

    fn compile_expr(
        &mut self,
        enc: &mut Encoding,
        expr: &BooleanExpr,
        p: &Param,
    ) -> Result<TransferResult, EncodingError> {
        match expr {
            BooleanExpr::True | BooleanExpr::MatchIpv4 => Ok(TransferResult::from_expr(SmtTerm::tt())),
            BooleanExpr::False | BooleanExpr::MatchIpv6 | BooleanExpr::MatchPrefix6Set => {
                Ok(TransferResult::from_expr(SmtTerm::ff()))
            }
            BooleanExpr::CallExprContext => Ok(TransferResult::from_expr(SmtTerm::bool(
                p.call_context == CallContext::Expr,
            ))),
            BooleanExpr::CallStatementContext => Ok(TransferResult::from_expr(SmtTerm::bool(
                p.call_context == CallContext::Stmt,
            ))),
            BooleanExpr::Conjunction(es) | BooleanExpr::Disjunction(es) => {
                let mut result = TransferResult::from_expr(SmtTerm::tt());
                let mut parts = Vec::with_capacity(es.len());
                for e in es {
                    let r = self.compile_expr(enc, e, &p.indented())?;
                    result.merge_changed(&r);
                    parts.push(r.return_value);
                }
                result.return_value = if matches!(expr, BooleanExpr::Conjunction(_)) {
                    SmtTerm::and(parts)
                } else {
                    SmtTerm::or(parts)
                };
                Ok(result)
            }
            BooleanExpr::ConjunctionChain(es) | BooleanExpr::FirstMatchChain(es) => {
                let mut chain: Vec<BooleanExpr> = es.clone();
                if let Some(name) = &p.default_policy {
                    chain.push(BooleanExpr::CallPolicy(name.clone()));
                }
                if chain.is_empty() {
                    return match expr {
                        BooleanExpr::ConjunctionChain(_) => Ok(TransferResult::from_expr(SmtTerm::tt())),
                        _ => Err(EncodingError::Invariant(format!(
                            "first-match chain without a default policy on {}",
                            self.router
                        ))),
                    };
                }
                let mut result = TransferResult::from_expr(SmtTerm::ff());
                let mut acc = SmtTerm::ff();
                for e in chain.iter().rev() {
                    let param = Param {
                        default_policy: None,
                        chain_context: ChainContext::Conjunction,
                        ..p.clone()
                    };
                    let r = self.compile_expr(enc, e, &param)?;
                    result.merge_changed(&r);
                    acc = r.fallthrough.ite(acc, r.return_value);
                }
                result.return_value = acc;
                Ok(result)
            }
            BooleanExpr::Not(inner) => {
                let mut r = self.compile_expr(enc, inner, p)?;
                r.return_value = r.return_value.not();
                Ok(r)
            }
            BooleanExpr::MatchProtocol(ps) => {
                if ps.len() > 1 {
                    let split = ps
                        .iter()
                        .map(|rp| BooleanExpr::MatchProtocol(vec![*rp]))
                        .collect();
                    return self.compile_expr(enc, &BooleanExpr::Disjunction(split), p);
                }
                let matched = ps
                    .first()
                    .and_then(|rp| Protocol::from_routing_protocol(*rp))
                    .map_or_else(SmtTerm::ff, |proto| match self.other.protocol_history.get() {
                        Some(h) => h.check_if_value(&proto),
                        None => SmtTerm::bool(proto == self.proto),
                    });
                Ok(TransferResult::from_expr(matched))
            }
            BooleanExpr::MatchPrefixSet(e) => {
                let mut r = self.match_prefix_set(e, &p.state)?;
                r.return_assigned = SmtTerm::tt();
                Ok(r)
            }
            BooleanExpr::CallPolicy(name) => {
                if p.depth >= MAX_CALL_DEPTH {
                    return Err(EncodingError::Invariant(format!(
                        "policy calls nested too deeply at {name} on {}",
                        self.router
                    )));
                }
                let conf = self.conf;
                let policy = conf.policy(name).ok_or_else(|| {
                    EncodingError::Invariant(format!("unknown policy {name} on {}", self.router))
                })?;
                debug!(router = self.router, policy = %name, depth = p.depth, chain = ?p.chain_context, "inlining policy call");
                let mut child = Param {
                    call_context: CallContext::Expr,
                    ..p.indented()
                };
                self.compile_statements(enc, &policy.statements, &mut child, TransferResult::initial())
            }
            BooleanExpr::WithEnvironment(inner) => self.compile_expr(enc, inner, p),
            BooleanExpr::MatchCommunitySet(e) => {
                Ok(TransferResult::from_expr(self.match_community_set(e, &p.state)?))
            }
            BooleanExpr::MatchAsPath(_) => {
                self.unsupported("as-path match")?;
                Ok(TransferResult::from_expr(SmtTerm::ff()))
            }
        }
    }

    fn match_community_set(&self, e: &CommunitySetExpr, state: &RouteState) -> Result<SmtTerm, EncodingError> {
        match e {
            CommunitySetExpr::Literal(cs) => Ok(SmtTerm::and(
                cs.iter()
                    .map(|c| self.get_or_default(state, &Field::Community(c.clone())))
                    .collect(),
            )),
            CommunitySetExpr::Named(name) => {
                let list = self.conf.community_lists.get(name).ok_or_else(|| {
                    EncodingError::Invariant(format!("unknown community list {name} on {}", self.router))
                })?;
                Ok(list.lines.iter().rev().fold(SmtTerm::ff(), |acc, line| {
                    let c = self.get_or_default(state, &Field::Community(line.community.clone()));
                    c.ite(SmtTerm::bool(line.action.is_permit()), acc)
                }))
            }
        }
    }

    fn match_prefix_set(
        &self,
        e: &PrefixSetExpr,
        state: &RouteState,
    ) -> Result<TransferResult, EncodingError> {
        let other_len = self.get_or_default(state, &Field::PrefixLen);
        match e {
            PrefixSetExpr::Explicit(ranges) => {
                if ranges.is_empty() {
                    return Ok(TransferResult::from_expr(SmtTerm::tt()));
                }
                if let [range] = ranges.as_slice() {
                    if let Some(r) = self.originated_prefix_match(range, &other_len) {
                        return Ok(r);
                    }
                }
                let any = ranges
                    .iter()
                    .map(|r| self.slice.relevant_for(&other_len, r))
                    .collect();
                Ok(TransferResult::from_expr(SmtTerm::or(any)))
            }
            PrefixSetExpr::Named(name) => {
                let list = self.conf.route_filter_lists.get(name).ok_or_else(|| {
                    EncodingError::Invariant(format!(
                        "unknown route filter list {name} on {}",
                        self.router
                    ))
                })?;
                let acc = list.lines.iter().rev().fold(SmtTerm::ff(), |acc, line| {
                    let matches = self.slice.relevant_for(&other_len, &line.range());
                    matches.ite(SmtTerm::bool(line.action.is_permit()), acc)
                });
                Ok(TransferResult::from_expr(acc))
            }
        }
    }

    /// A BGP network statement for an exact prefix only fires when the
    /// router has a local route of exactly that length.
    fn originated_prefix_match(&self, range: &PrefixRange, other_len: &SmtTerm) -> Option<TransferResult> {
        let pfx = range.prefix;
        let plen = u32::from(pfx.len());
        if range.lengths.start != plen || range.lengths.end != plen {
            return None;
        }
        if !originated_networks(self.conf, Protocol::Bgp).contains(&pfx) {
            return None;
        }
        let origin_len = SmtTerm::int(i64::from(plen));
        let local = originated_networks(self.conf, Protocol::Static).contains(&pfx)
            || originated_networks(self.conf, Protocol::Connected).contains(&pfx);
        let relevant = if local {
            self.slice.relevant_for(&origin_len, range)
        } else {
            let rec = self.slice.best_for(self.router, Protocol::Ospf)?;
            self.slice
                .relevant_for(&self.slice.route(rec).prefix_length, range)
        };
        let mut r = TransferResult::from_expr(relevant.clone());
        r.changed.insert(
            Var::Field(Field::PrefixLen),
            relevant.ite(origin_len, other_len.clone()),
        );
        Some(r)
    }

    /// Exported BGP routes covered by a suppressing aggregate take the
    /// aggregate's length.
    fn intermediate_prefix_len(&mut self, enc: &mut Encoding, p: &mut Param) {
        if !(self.is_export && self.proto.is_bgp()) {
            return;
        }
        let opt = &self.slice.optimizations;
        let Some(aggregates) = opt.relevant_aggregates.get(self.router) else {
            return;
        };
        let suppressed = opt.suppressed_aggregates.get(self.router);
        let old = self.get_or_default(&p.state, &Field::PrefixLen);
        let mut len = old.clone();
        for gr in aggregates {
            let is_suppressed = suppressed.is_some_and(|s| s.contains(&gr.network));
            let agg_len = SmtTerm::int(i64::from(gr.network.len()));
            let relevant = SmtTerm::and(vec![
                in_prefix(&self.slice.packet.dst_ip, gr.network),
                old.clone().gt(agg_len.clone()),
                SmtTerm::bool(is_suppressed),
            ]);
            len = relevant.ite(agg_len, len);
        }
        let x = self.create(enc, "PREFIX-LEN", len, SmtSort::Int);
        self.set(&mut p.state, Field::PrefixLen, x);
    }

    /// OSPF adds the link cost on import; BGP adds the hop on export, and
    /// starts from the cost alone for routes learned from another protocol.
    fn apply_metric_update(&mut self, p: &mut Param) {
        let update_ospf = !self.is_export && self.proto.is_ospf();
        let update_bgp = self.is_export && self.proto.is_bgp();
        if !(update_ospf || update_bgp) {
            return;
        }
        let cost = SmtTerm::int(self.added_cost);
        let sum = self.get_or_default(&p.state, &Field::Metric).add(cost.clone());
        let value = if self.proto.is_bgp() {
            let is_bgp = match self.other.protocol_history.get() {
                Some(h) => h.check_if_value(&Protocol::Bgp),
                None => SmtTerm::bool(self.slice.optimizations.is_single_protocol(self.router)),
            };
            is_bgp.ite(sum, cost)
        } else {
            sum
        };
        self.set(&mut p.state, Field::Metric, value);
    }

    fn send_community(&self) -> bool {
        if !self.proto.is_bgp() {
            return false;
        }
        if !self.is_export {
            return true;
        }
        self.graph()
            .find_bgp_neighbor(self.edge)
            .is_some_and(|n| n.send_community)
    }

    fn no_overflow(&self, metric: &SmtTerm) -> SmtTerm {
        if !self.env.model_overflow {
            return SmtTerm::tt();
        }
        match self.proto.max_metric() {
            Some(max) => metric.clone().le(SmtTerm::int(max)),
            None => SmtTerm::tt(),
        }
    }

    /// Tie every field of `current` to the final state of `other`.
    fn relate_variables(&self, p: &Param, result: &TransferResult) -> Result<SmtTerm, EncodingError> {
        let graph = self.graph();
        let cur = self.current;
        let other = self.other;
        let state = &p.state;
        let ge = graph.edge(self.edge);
        let iface_area = ge.start.ospf_area;

        let safe_eq = |x: &super::symbolic::Elidable<SmtTerm>, y: SmtTerm| match x.get() {
            Some(x) => x.clone().eq(y),
            None => SmtTerm::tt(),
        };

        let len = cur
            .prefix_length
            .clone()
            .eq(self.get_or_default(state, &Field::PrefixLen));
        let per = cur.permitted.clone().eq(other.permitted.clone());

        let id = if self.is_export {
            SmtTerm::tt()
        } else {
            safe_eq(
                &cur.router_id,
                other.router_id.get().cloned().unwrap_or_else(|| SmtTerm::int(0)),
            )
        };

        let area = match (other.ospf_area.get(), iface_area, cur.ospf_area.get()) {
            (Some(_), Some(a), Some(c)) => c.clone().eq(SmtTerm::int(i64::from(a))),
            _ => SmtTerm::tt(),
        };

        let mut igp = SmtTerm::tt();
        let mut peer_type = None;
        if ge.is_abstract {
            let pt = graph.peer_type(self.edge)?;
            peer_type = Some(pt);
            if let Some(cur_igp) = cur.igp_metric.get() {
                if pt == BgpSendType::ToRr {
                    let mut acc = Vec::new();
                    if let Some(other_cid) = other.client_id.get() {
                        for (r, cid) in graph.originator_ids() {
                            if r == self.router {
                                continue;
                            }
                            let metric = self.env.igp_best_metric(r, self.router)?;
                            acc.push(
                                other_cid
                                    .clone()
                                    .eq(SmtTerm::int(*cid))
                                    .implies(cur_igp.clone().eq(metric)),
                            );
                        }
                    }
                    igp = SmtTerm::and(acc);
                } else if let Some(peer) = &ge.peer {
                    let metric = self.env.igp_best_metric(peer, self.router)?;
                    igp = cur_igp.clone().eq(metric);
                }
            }
        }

        let is_ibgp = ge.is_abstract && self.proto.is_bgp();
        let internal = safe_eq(&cur.bgp_internal, SmtTerm::bool(is_ibgp));

        let ospf_type = match cur.ospf_type.get() {
            None => SmtTerm::tt(),
            Some(cur_t) => {
                let state_t = self.get(state, &Field::OspfType);
                match state_t {
                    None => SmtTerm::tt(),
                    Some(st) if result.is_changed(&Field::OspfType) => cur_t.term().clone().eq(st),
                    Some(st) => match (other.ospf_area.get(), iface_area) {
                        (Some(other_area), Some(a)) => {
                            let internal_type = st.clone().le(OspfType::Oia.term());
                            let other_area_differs = other_area.clone().eq(SmtTerm::int(i64::from(a))).not();
                            SmtTerm::and(vec![internal_type, other_area_differs]).ite(
                                cur_t.check_if_value(&OspfType::Oia),
                                cur_t.term().clone().eq(st),
                            )
                        }
                        _ => cur_t.term().clone().eq(st),
                    },
                }
            }
        };

        let send = self.send_community();
        let comms = SmtTerm::and(
            cur.communities
                .iter()
                .filter_map(|(c, e)| {
                    if !send {
                        return Some(e.clone().not());
                    }
                    if c.is_regex() {
                        return None;
                    }
                    Some(e.clone().eq(self.get_or_default(state, &Field::Community(c.clone()))))
                })
                .collect(),
        );

        let other_ad = other
            .admin_dist
            .get()
            .cloned()
            .unwrap_or_else(|| self.slice.default_admin_distance(self.proto, other));
        let other_med = other
            .med
            .get()
            .cloned()
            .unwrap_or_else(|| SmtTerm::int(default_med(self.proto)));
        let other_lp = self.get_or_default(state, &Field::LocalPref);
        let other_met = self.get_or_default(state, &Field::Metric);

        let ad = safe_eq(&cur.admin_dist, other_ad);
        let med = safe_eq(&cur.med, other_med);
        let lp = safe_eq(&cur.local_pref, other_lp);
        let met = cur.metric.clone().eq(other_met.clone());
        let history = self.slice.equal_histories(cur, other);

        let is_ebgp_edge = graph.ebgp_neighbor(self.edge).is_some();
        let mut cid = SmtTerm::tt();
        if self.proto.is_bgp() {
            if let (Some(other_cid), Some(cur_cid)) = (other.client_id.get(), cur.client_id.get()) {
                let copy = cur_cid.clone().eq(other_cid.clone());
                if self.is_export {
                    cid = if is_ebgp_edge {
                        cur_cid.clone().eq(SmtTerm::int(0))
                    } else {
                        copy
                    };
                } else {
                    let from_external = other_cid.clone().eq(SmtTerm::int(0));
                    let over_ibgp = matches!(peer_type, Some(_));
                    let own = graph.originator_id(&ge.router).unwrap_or(0);
                    cid = SmtTerm::and(vec![from_external, SmtTerm::bool(!over_ibgp)])
                        .ite(cur_cid.clone().eq(SmtTerm::int(own)), copy);
                }
            }
        }

        let updates = SmtTerm::and(vec![
            per, len, ad, med, lp, met, id, cid, ospf_type, area, comms, history, internal, igp,
        ]);
        Ok(self
            .no_overflow(&other_met)
            .ite(updates, cur.permitted.clone().not()))
    }
}

fn modify(x: SmtTerm, e: &IntExpr) -> SmtTerm {
    match e {
        IntExpr::Literal(v) => SmtTerm::int(*v),
        IntExpr::Increment(v) => x.add(SmtTerm::int(*v)),
        IntExpr::Decrement(v) => x.sub(SmtTerm::int(*v)),
    }
}

/// MED assumed for routes that do not carry one.
pub(crate) fn default_med(proto: Protocol) -> i64 {
    if proto.is_bgp() {
        100
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sweeper_ir::addr::Prefix;
    use sweeper_ir::network::Network;
    use sweeper_smt::{Model, ModelValue};

    use super::*;
    use crate::encoder::{fixtures, Encoder};
    use crate::options::EngineOptions;
    use crate::question::HeaderQuestion;

    fn encoder(net: Network, question: &HeaderQuestion, options: &EngineOptions) -> Result<Encoder, EncodingError> {
        let graph = Arc::new(Graph::new(net).unwrap());
        Encoder::new(graph, question, options)
    }

    fn lp_encoder(question: &HeaderQuestion) -> Encoder {
        let net = fixtures::external_peer_importing(vec![
            Statement::SetLocalPreference(IntExpr::Literal(200)),
            Statement::ExitAccept,
        ]);
        let options = EngineOptions {
            inline_threshold: usize::MAX,
            ..EngineOptions::default()
        };
        encoder(net, question, &options).unwrap()
    }

    /// Compile `statements` as the import of R1's environment announcement.
    /// Returns the formula with the announcement and the import record.
    fn import<'e>(enc: &'e Encoder, statements: &[Statement]) -> (SmtTerm, &'e SymbolicRoute, &'e SymbolicRoute) {
        let s = enc.main_slice();
        let env = enc.slice_env();
        let (le, env_id) = s.logical_graph.environment().first().unwrap();
        let (other, current) = (s.route(*env_id), s.route(le.route));
        let conf = enc.graph().config("R1").unwrap();
        let mut scratch = Encoding::new();
        let term = TransferSsa::new(s, &env, conf, other, current, Protocol::Bgp, statements, 0, le.edge, false)
            .compute(&mut scratch)
            .unwrap();
        assert!(scratch.declarations.is_empty());
        (term, other, current)
    }

    fn permit_both(m: &mut Model, other: &SymbolicRoute, current: &SymbolicRoute) {
        fixtures::set(m, &other.permitted, ModelValue::Bool(true));
        fixtures::set(m, &current.permitted, ModelValue::Bool(true));
    }

    #[test]
    fn empty_policy_copies_the_route() {
        let enc = lp_encoder(&HeaderQuestion::default());
        let (t, other, current) = import(&enc, &[]);
        let mut m = fixtures::zero_model(enc.encoding());
        permit_both(&mut m, other, current);
        assert_eq!(m.eval_bool(&t), Some(true));

        fixtures::set(&mut m, &current.metric, ModelValue::Int(7));
        assert_eq!(m.eval_bool(&t), Some(false));
        fixtures::set(&mut m, &other.metric, ModelValue::Int(7));
        assert_eq!(m.eval_bool(&t), Some(true));

        fixtures::set(&mut m, current.local_pref.get().unwrap(), ModelValue::Int(50));
        assert_eq!(m.eval_bool(&t), Some(false));
    }

    #[test]
    fn set_local_preference_overrides_the_announcement() {
        let enc = lp_encoder(&HeaderQuestion::default());
        let stmts = [Statement::SetLocalPreference(IntExpr::Literal(200)), Statement::ExitAccept];
        let (t, other, current) = import(&enc, &stmts);
        let mut m = fixtures::zero_model(enc.encoding());
        permit_both(&mut m, other, current);
        fixtures::set(&mut m, other.local_pref.get().unwrap(), ModelValue::Int(100));
        fixtures::set(&mut m, current.local_pref.get().unwrap(), ModelValue::Int(100));
        assert_eq!(m.eval_bool(&t), Some(false));
        fixtures::set(&mut m, current.local_pref.get().unwrap(), ModelValue::Int(200));
        assert_eq!(m.eval_bool(&t), Some(true));
    }

    #[test]
    fn rejected_routes_are_not_permitted() {
        let enc = lp_encoder(&HeaderQuestion::default());
        let (t, other, current) = import(&enc, &[Statement::ExitReject]);
        let mut m = fixtures::zero_model(enc.encoding());
        permit_both(&mut m, other, current);
        assert_eq!(m.eval_bool(&t), Some(false));
        fixtures::set(&mut m, &current.permitted, ModelValue::Bool(false));
        assert_eq!(m.eval_bool(&t), Some(true));
    }

    #[test]
    fn guarded_branches_join() {
        let enc = lp_encoder(&HeaderQuestion::default());
        let p = Prefix::new(fixtures::ip("10.0.0.0"), 24);
        let stmts = [Statement::if_then_else(
            BooleanExpr::match_prefixes(&[p]),
            vec![Statement::SetLocalPreference(IntExpr::Literal(200)), Statement::ExitAccept],
            vec![Statement::ExitReject],
        )];
        let (t, other, current) = import(&enc, &stmts);
        let dst_ip = enc.main_slice().packet.dst_ip.clone();

        let mut m = fixtures::zero_model(enc.encoding());
        permit_both(&mut m, other, current);
        fixtures::set(&mut m, current.local_pref.get().unwrap(), ModelValue::Int(200));
        // Outside the prefix the route is rejected.
        fixtures::set(&mut m, &dst_ip, ModelValue::Int(fixtures::ip("10.9.0.1").as_i64()));
        assert_eq!(m.eval_bool(&t), Some(false));

        fixtures::set(&mut m, &dst_ip, ModelValue::Int(fixtures::ip("10.0.0.5").as_i64()));
        fixtures::set(&mut m, &other.prefix_length, ModelValue::Int(24));
        fixtures::set(&mut m, &current.prefix_length, ModelValue::Int(24));
        assert_eq!(m.eval_bool(&t), Some(true));

        // A more specific announcement does not match the exact range.
        fixtures::set(&mut m, &other.prefix_length, ModelValue::Int(25));
        fixtures::set(&mut m, &current.prefix_length, ModelValue::Int(25));
        assert_eq!(m.eval_bool(&t), Some(false));
    }

    #[test]
    fn metric_overflow_withdraws_the_route() {
        let question = HeaderQuestion {
            model_overflow: true,
            ..HeaderQuestion::default()
        };
        let enc = lp_encoder(&question);
        let (t, other, current) = import(&enc, &[]);
        let mut m = fixtures::zero_model(enc.encoding());
        permit_both(&mut m, other, current);
        fixtures::set(&mut m, &other.metric, ModelValue::Int(255));
        fixtures::set(&mut m, &current.metric, ModelValue::Int(255));
        assert_eq!(m.eval_bool(&t), Some(true));

        fixtures::set(&mut m, &other.metric, ModelValue::Int(256));
        fixtures::set(&mut m, &current.metric, ModelValue::Int(256));
        assert_eq!(m.eval_bool(&t), Some(false));
        fixtures::set(&mut m, &current.permitted, ModelValue::Bool(false));
        assert_eq!(m.eval_bool(&t), Some(true));
    }

    #[test]
    fn ospf_metric_overflow_withdraws_the_route() {
        let question = HeaderQuestion {
            model_overflow: true,
            ..HeaderQuestion::default()
        };
        let options = EngineOptions {
            inline_threshold: usize::MAX,
            ..EngineOptions::default()
        };
        let enc = encoder(fixtures::ospf_line(2), &question, &options).unwrap();
        let s = enc.main_slice();
        let env = enc.slice_env();
        let le = s
            .logical_graph
            .edges("R1", Protocol::Ospf)
            .find(|le| le.is_import())
            .unwrap();
        let other = s.other_vars(le).unwrap();
        let current = s.route(le.route);
        let conf = enc.graph().config("R1").unwrap();
        let mut scratch = Encoding::new();
        let t = TransferSsa::new(s, &env, conf, other, current, Protocol::Ospf, &[Statement::ExitAccept], 1, le.edge, false)
            .compute(&mut scratch)
            .unwrap();

        let mut m = fixtures::zero_model(enc.encoding());
        m.values.extend(fixtures::zero_model(&scratch).values);
        fixtures::set(&mut m, &other.permitted, ModelValue::Bool(true));

        // One below the limit the import must copy the permitted bit.
        fixtures::set(&mut m, &other.metric, ModelValue::Int(65_534));
        assert_eq!(m.eval_bool(&t), Some(false));

        // Adding the link cost past the limit withdraws the route.
        fixtures::set(&mut m, &other.metric, ModelValue::Int(65_535));
        assert_eq!(m.eval_bool(&t), Some(true));
        fixtures::set(&mut m, &current.permitted, ModelValue::Bool(true));
        assert_eq!(m.eval_bool(&t), Some(false));
    }

    #[test]
    fn missing_named_lists_are_rejected() {
        let q = HeaderQuestion::default();
        let missing_comms = || CommunitySetExpr::Named("missing".into());
        let guarded = |guard: BooleanExpr| {
            vec![Statement::if_then_else(guard, vec![Statement::ExitAccept], vec![Statement::ExitReject])]
        };
        for stmts in [
            guarded(BooleanExpr::MatchCommunitySet(missing_comms())),
            guarded(BooleanExpr::MatchPrefixSet(PrefixSetExpr::Named("missing".into()))),
            vec![Statement::AddCommunity(missing_comms()), Statement::ExitAccept],
            vec![Statement::DeleteCommunity(missing_comms()), Statement::ExitAccept],
        ] {
            let net = fixtures::external_peer_importing(stmts);
            let Err(err) = encoder(net, &q, &EngineOptions::permissive()) else {
                panic!("unknown list accepted");
            };
            assert!(matches!(err, EncodingError::Invariant(ref m) if m.contains("missing")), "{err}");
        }
    }

    #[test]
    fn unsupported_statements_follow_the_soundness_mode() {
        let net = fixtures::external_peer_importing(vec![Statement::SetWeight(10), Statement::ExitAccept]);
        let q = HeaderQuestion::default();
        let Err(err) = encoder(net.clone(), &q, &EngineOptions::default()) else {
            panic!("strict mode accepted set weight");
        };
        assert!(matches!(
            err,
            EncodingError::Unsupported { ref router, ref construct } if router == "R1" && construct == "set weight"
        ));
        assert!(encoder(net, &q, &EngineOptions::permissive()).is_ok());
    }
}
