//! Vendor-independent routing-policy AST.
//!
//! Policies are ordered statement lists in a small imperative language:
//! statements mutate route attributes or decide accept/reject, guarded by
//! boolean match expressions. Both node kinds are closed enums so every
//! consumer matches exhaustively.

use serde::{Deserialize, Serialize};

use crate::addr::{Prefix, PrefixRange, SubRange};
use crate::community::CommunityVar;
use crate::protocol::RoutingProtocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LineAction {
    Permit,
    Deny,
}

impl LineAction {
    pub fn is_permit(self) -> bool {
        self == LineAction::Permit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OspfMetricType {
    E1,
    E2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OriginType {
    Igp,
    Egp,
    Incomplete,
}

/// An integer-valued update of a route attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntExpr {
    Literal(i64),
    Increment(i64),
    Decrement(i64),
}

/// The AS numbers a `PrependAsPath` statement adds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AsPathListExpr {
    Literal(Vec<u32>),
    MultipliedAs { asn: u32, count: u32 },
}

impl AsPathListExpr {
    /// Number of AS hops added to the path.
    pub fn prepend_length(&self) -> i64 {
        match self {
            AsPathListExpr::Literal(list) => list.len() as i64,
            AsPathListExpr::MultipliedAs { count, .. } => i64::from(*count),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrefixSetExpr {
    Explicit(Vec<PrefixRange>),
    /// A route filter list by name.
    Named(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommunitySetExpr {
    /// An inline set; matching requires every listed community.
    Literal(Vec<CommunityVar>),
    /// A community list by name.
    Named(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BooleanExpr {
    True,
    False,
    /// True when evaluated inside a policy called as an expression.
    CallExprContext,
    /// True when evaluated inside a policy called as a statement.
    CallStatementContext,
    MatchIpv4,
    MatchIpv6,
    Conjunction(Vec<BooleanExpr>),
    Disjunction(Vec<BooleanExpr>),
    ConjunctionChain(Vec<BooleanExpr>),
    FirstMatchChain(Vec<BooleanExpr>),
    Not(Box<BooleanExpr>),
    MatchProtocol(Vec<RoutingProtocol>),
    MatchPrefixSet(PrefixSetExpr),
    MatchPrefix6Set,
    CallPolicy(String),
    WithEnvironment(Box<BooleanExpr>),
    MatchCommunitySet(CommunitySetExpr),
    /// AS-path regex match.
    MatchAsPath(String),
}

impl BooleanExpr {
    pub fn not(expr: BooleanExpr) -> Self {
        BooleanExpr::Not(Box::new(expr))
    }

    pub fn match_prefixes(prefixes: &[Prefix]) -> Self {
        BooleanExpr::MatchPrefixSet(PrefixSetExpr::Explicit(
            prefixes.iter().copied().map(PrefixRange::exact).collect(),
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Statement {
    ExitAccept,
    ExitReject,
    ReturnTrue,
    ReturnFalse,
    ReturnLocalDefaultAction,
    SetDefaultActionAccept,
    SetDefaultActionReject,
    SetLocalDefaultActionAccept,
    SetLocalDefaultActionReject,
    Suppress,
    Unsuppress,
    FallThrough,
    Return,
    RemovePrivateAs,
    If {
        guard: BooleanExpr,
        #[serde(default)]
        true_statements: Vec<Statement>,
        #[serde(default)]
        false_statements: Vec<Statement>,
    },
    /// Name of the policy consulted at the end of a chain.
    SetDefaultPolicy(String),
    SetMetric(IntExpr),
    SetOspfMetricType(OspfMetricType),
    SetLocalPreference(IntExpr),
    AddCommunity(CommunitySetExpr),
    SetCommunity(CommunitySetExpr),
    DeleteCommunity(CommunitySetExpr),
    PrependAsPath(AsPathListExpr),
    SetOrigin(OriginType),
    SetNextHop(Option<crate::addr::Ip>),
    SetWeight(i64),
    SetTag(i64),
}

impl Statement {
    pub fn if_then(guard: BooleanExpr, then: Vec<Statement>) -> Self {
        Statement::If {
            guard,
            true_statements: then,
            false_statements: Vec::new(),
        }
    }

    pub fn if_then_else(guard: BooleanExpr, then: Vec<Statement>, els: Vec<Statement>) -> Self {
        Statement::If {
            guard,
            true_statements: then,
            false_statements: els,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingPolicy {
    pub name: String,
    pub statements: Vec<Statement>,
}

impl RoutingPolicy {
    pub fn new(name: impl Into<String>, statements: Vec<Statement>) -> Self {
        RoutingPolicy {
            name: name.into(),
            statements,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteFilterLine {
    pub action: LineAction,
    pub prefix: Prefix,
    pub lengths: SubRange,
}

impl RouteFilterLine {
    pub fn range(&self) -> PrefixRange {
        PrefixRange {
            prefix: self.prefix,
            lengths: self.lengths,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteFilterList {
    pub name: String,
    pub lines: Vec<RouteFilterLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityListLine {
    pub action: LineAction,
    pub community: CommunityVar,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityList {
    pub name: String,
    pub lines: Vec<CommunityListLine>,
}

/// Walk a statement list depth-first, calling `on_stmt` for every statement
/// and `on_expr` for every boolean expression. Called policies are not
/// followed; see `RouterConfig::visit_policy` for that.
pub fn walk_statements(
    statements: &[Statement],
    on_stmt: &mut dyn FnMut(&Statement),
    on_expr: &mut dyn FnMut(&BooleanExpr),
) {
    for stmt in statements {
        on_stmt(stmt);
        if let Statement::If {
            guard,
            true_statements,
            false_statements,
        } = stmt
        {
            walk_expr(guard, on_expr);
            walk_statements(true_statements, on_stmt, on_expr);
            walk_statements(false_statements, on_stmt, on_expr);
        }
    }
}

pub fn walk_expr(expr: &BooleanExpr, on_expr: &mut dyn FnMut(&BooleanExpr)) {
    on_expr(expr);
    match expr {
        BooleanExpr::Conjunction(es)
        | BooleanExpr::Disjunction(es)
        | BooleanExpr::ConjunctionChain(es)
        | BooleanExpr::FirstMatchChain(es) => {
            for e in es {
                walk_expr(e, on_expr);
            }
        }
        BooleanExpr::Not(e) | BooleanExpr::WithEnvironment(e) => walk_expr(e, on_expr),
        _ => {}
    }
}
