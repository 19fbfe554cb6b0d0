use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::solver::{Model, SatResult, SmtSolver};
use crate::sorts::SmtSort;
use crate::terms::SmtTerm;

/// An accumulated set of declarations and assertions.
///
/// Declarations are idempotent by name and assertions are deduplicated by a
/// canonical key that ignores operand order of commutative operators.
#[derive(Debug, Clone, Default)]
pub struct Encoding {
    /// Variable declarations in declaration order.
    pub declarations: Vec<(String, SmtSort)>,
    /// Assertions (constraints), already simplified.
    pub assertions: Vec<SmtTerm>,
    declared: HashMap<String, SmtSort>,
    assertion_keys: HashSet<String>,
    assertion_candidates: usize,
    assertion_dedup_hits: usize,
}

impl Encoding {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `name` with `sort` and return a term referring to it.
    ///
    /// Re-declaring an existing name is a no-op.
    pub fn declare(&mut self, name: impl Into<String>, sort: SmtSort) -> SmtTerm {
        let name = name.into();
        if !self.declared.contains_key(&name) {
            self.declared.insert(name.clone(), sort);
            self.declarations.push((name.clone(), sort));
        }
        SmtTerm::Var(name)
    }

    pub fn declare_bool(&mut self, name: impl Into<String>) -> SmtTerm {
        self.declare(name, SmtSort::Bool)
    }

    pub fn declare_int(&mut self, name: impl Into<String>) -> SmtTerm {
        self.declare(name, SmtSort::Int)
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.declared.contains_key(name)
    }

    pub fn sort_of(&self, name: &str) -> Option<SmtSort> {
        self.declared.get(name).copied()
    }

    /// Add a constraint. Trivially true constraints are dropped.
    pub fn assert_term(&mut self, term: SmtTerm) {
        self.assertion_candidates = self.assertion_candidates.saturating_add(1);
        let term = term.simplify();
        if term.is_true() {
            return;
        }
        let key = canonical_term_key(&term);
        if self.assertion_keys.insert(key) {
            self.assertions.push(term);
        } else {
            self.assertion_dedup_hits = self.assertion_dedup_hits.saturating_add(1);
        }
    }

    /// Merge another encoding's declarations and assertions into this one.
    pub fn append(&mut self, other: Encoding) {
        for (name, sort) in other.declarations {
            self.declare(name, sort);
        }
        for term in other.assertions {
            self.assert_term(term);
        }
    }

    pub fn assertion_candidates(&self) -> usize {
        self.assertion_candidates
    }

    pub fn assertion_unique(&self) -> usize {
        self.assertions.len()
    }

    pub fn assertion_dedup_hits(&self) -> usize {
        self.assertion_dedup_hits
    }

    /// Total node count over all assertions.
    pub fn term_size(&self) -> usize {
        self.assertions.iter().map(SmtTerm::size).sum()
    }
}

fn canonical_binary_commutative(tag: &str, lhs: &SmtTerm, rhs: &SmtTerm) -> String {
    let left = canonical_term_key(lhs);
    let right = canonical_term_key(rhs);
    if left <= right {
        format!("({tag} {left} {right})")
    } else {
        format!("({tag} {right} {left})")
    }
}

fn canonical_binary(tag: &str, lhs: &SmtTerm, rhs: &SmtTerm) -> String {
    format!("({tag} {} {})", canonical_term_key(lhs), canonical_term_key(rhs))
}

fn canonical_term_key(term: &SmtTerm) -> String {
    match term {
        SmtTerm::Var(name) => format!("(var {name})"),
        SmtTerm::IntLit(v) => format!("(int {v})"),
        SmtTerm::BoolLit(v) => format!("(bool {v})"),
        SmtTerm::Add(lhs, rhs) => canonical_binary_commutative("+", lhs, rhs),
        SmtTerm::Sub(lhs, rhs) => canonical_binary("-", lhs, rhs),
        SmtTerm::Eq(lhs, rhs) => canonical_binary_commutative("=", lhs, rhs),
        SmtTerm::Lt(lhs, rhs) => canonical_binary("<", lhs, rhs),
        SmtTerm::Le(lhs, rhs) => canonical_binary("<=", lhs, rhs),
        SmtTerm::Gt(lhs, rhs) => canonical_binary(">", lhs, rhs),
        SmtTerm::Ge(lhs, rhs) => canonical_binary(">=", lhs, rhs),
        SmtTerm::And(terms) => {
            let mut items = terms.iter().map(canonical_term_key).collect::<Vec<_>>();
            items.sort();
            format!("(and {})", items.join(" "))
        }
        SmtTerm::Or(terms) => {
            let mut items = terms.iter().map(canonical_term_key).collect::<Vec<_>>();
            items.sort();
            format!("(or {})", items.join(" "))
        }
        SmtTerm::Not(inner) => format!("(not {})", canonical_term_key(inner)),
        SmtTerm::Implies(lhs, rhs) => canonical_binary("=>", lhs, rhs),
        SmtTerm::Ite(cond, then, els) => format!(
            "(ite {} {} {})",
            canonical_term_key(cond),
            canonical_term_key(then),
            canonical_term_key(els)
        ),
    }
}

/// Load `encoding` into a freshly reset solver and check it.
///
/// On SAT the returned model assigns every declared variable.
pub fn check_encoding<S: SmtSolver>(
    solver: &mut S,
    encoding: &Encoding,
) -> Result<(SatResult, Option<Model>), S::Error> {
    solver.reset()?;
    for (name, sort) in &encoding.declarations {
        solver.declare_var(name, *sort)?;
    }
    for term in &encoding.assertions {
        solver.assert(term)?;
    }
    debug!(
        declarations = encoding.declarations.len(),
        assertions = encoding.assertions.len(),
        dedup_hits = encoding.assertion_dedup_hits(),
        "encoding loaded into solver"
    );
    let vars: Vec<(&str, SmtSort)> = encoding
        .declarations
        .iter()
        .map(|(n, s)| (n.as_str(), *s))
        .collect();
    let (result, model) = solver.check_sat_with_model(&vars)?;
    info!(result = ?result, "solver check finished");
    Ok((result, model))
}
