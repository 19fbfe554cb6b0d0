use std::collections::BTreeSet;
use std::fmt;

use crate::backends::smtlib_printer::to_smtlib;

/// Abstract SMT term representation, solver-agnostic.
///
/// Terms are plain values: cloning a term never aliases solver state, so
/// route records and SSA versions can hold them freely.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SmtTerm {
    /// Variable reference by name.
    Var(String),
    /// Integer literal.
    IntLit(i64),
    /// Boolean literal.
    BoolLit(bool),

    // Arithmetic
    Add(Box<SmtTerm>, Box<SmtTerm>),
    Sub(Box<SmtTerm>, Box<SmtTerm>),

    // Comparison
    Eq(Box<SmtTerm>, Box<SmtTerm>),
    Lt(Box<SmtTerm>, Box<SmtTerm>),
    Le(Box<SmtTerm>, Box<SmtTerm>),
    Gt(Box<SmtTerm>, Box<SmtTerm>),
    Ge(Box<SmtTerm>, Box<SmtTerm>),

    // Boolean logic
    And(Vec<SmtTerm>),
    Or(Vec<SmtTerm>),
    Not(Box<SmtTerm>),
    Implies(Box<SmtTerm>, Box<SmtTerm>),

    // If-then-else over either sort
    Ite(Box<SmtTerm>, Box<SmtTerm>, Box<SmtTerm>),
}

#[allow(clippy::should_implement_trait)]
impl SmtTerm {
    pub fn var(name: impl Into<String>) -> Self {
        SmtTerm::Var(name.into())
    }

    pub fn int(n: i64) -> Self {
        SmtTerm::IntLit(n)
    }

    pub fn bool(b: bool) -> Self {
        SmtTerm::BoolLit(b)
    }

    pub fn tt() -> Self {
        SmtTerm::BoolLit(true)
    }

    pub fn ff() -> Self {
        SmtTerm::BoolLit(false)
    }

    pub fn add(self, other: SmtTerm) -> Self {
        SmtTerm::Add(Box::new(self), Box::new(other))
    }

    pub fn sub(self, other: SmtTerm) -> Self {
        SmtTerm::Sub(Box::new(self), Box::new(other))
    }

    pub fn eq(self, other: SmtTerm) -> Self {
        SmtTerm::Eq(Box::new(self), Box::new(other))
    }

    pub fn lt(self, other: SmtTerm) -> Self {
        SmtTerm::Lt(Box::new(self), Box::new(other))
    }

    pub fn le(self, other: SmtTerm) -> Self {
        SmtTerm::Le(Box::new(self), Box::new(other))
    }

    pub fn gt(self, other: SmtTerm) -> Self {
        SmtTerm::Gt(Box::new(self), Box::new(other))
    }

    pub fn ge(self, other: SmtTerm) -> Self {
        SmtTerm::Ge(Box::new(self), Box::new(other))
    }

    pub fn and(terms: Vec<SmtTerm>) -> Self {
        SmtTerm::And(terms)
    }

    pub fn or(terms: Vec<SmtTerm>) -> Self {
        SmtTerm::Or(terms)
    }

    pub fn not(self) -> Self {
        SmtTerm::Not(Box::new(self))
    }

    pub fn implies(self, other: SmtTerm) -> Self {
        SmtTerm::Implies(Box::new(self), Box::new(other))
    }

    /// `ite(self, then, els)`; `self` is the condition.
    pub fn ite(self, then: SmtTerm, els: SmtTerm) -> Self {
        SmtTerm::Ite(Box::new(self), Box::new(then), Box::new(els))
    }

    /// Boolean disequality, i.e. exclusive or.
    pub fn xor(self, other: SmtTerm) -> Self {
        self.eq(other).not()
    }

    /// `lo <= self <= hi`.
    pub fn within(self, lo: i64, hi: i64) -> Self {
        SmtTerm::and(vec![self.clone().ge(SmtTerm::int(lo)), self.le(SmtTerm::int(hi))])
    }

    pub fn as_bool_lit(&self) -> Option<bool> {
        match self {
            SmtTerm::BoolLit(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int_lit(&self) -> Option<i64> {
        match self {
            SmtTerm::IntLit(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_true(&self) -> bool {
        self.as_bool_lit() == Some(true)
    }

    pub fn is_false(&self) -> bool {
        self.as_bool_lit() == Some(false)
    }

    /// Number of nodes in the term tree.
    pub fn size(&self) -> usize {
        match self {
            SmtTerm::Var(_) | SmtTerm::IntLit(_) | SmtTerm::BoolLit(_) => 1,
            SmtTerm::Not(inner) => 1 + inner.size(),
            SmtTerm::Add(l, r)
            | SmtTerm::Sub(l, r)
            | SmtTerm::Eq(l, r)
            | SmtTerm::Lt(l, r)
            | SmtTerm::Le(l, r)
            | SmtTerm::Gt(l, r)
            | SmtTerm::Ge(l, r)
            | SmtTerm::Implies(l, r) => 1 + l.size() + r.size(),
            SmtTerm::And(terms) | SmtTerm::Or(terms) => {
                1 + terms.iter().map(SmtTerm::size).sum::<usize>()
            }
            SmtTerm::Ite(c, t, e) => 1 + c.size() + t.size() + e.size(),
        }
    }

    /// Names of all free variables, sorted.
    pub fn variables(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_variables(&mut out);
        out
    }

    fn collect_variables(&self, out: &mut BTreeSet<String>) {
        match self {
            SmtTerm::Var(name) => {
                out.insert(name.clone());
            }
            SmtTerm::IntLit(_) | SmtTerm::BoolLit(_) => {}
            SmtTerm::Not(inner) => inner.collect_variables(out),
            SmtTerm::Add(l, r)
            | SmtTerm::Sub(l, r)
            | SmtTerm::Eq(l, r)
            | SmtTerm::Lt(l, r)
            | SmtTerm::Le(l, r)
            | SmtTerm::Gt(l, r)
            | SmtTerm::Ge(l, r)
            | SmtTerm::Implies(l, r) => {
                l.collect_variables(out);
                r.collect_variables(out);
            }
            SmtTerm::And(terms) | SmtTerm::Or(terms) => {
                for t in terms {
                    t.collect_variables(out);
                }
            }
            SmtTerm::Ite(c, t, e) => {
                c.collect_variables(out);
                t.collect_variables(out);
                e.collect_variables(out);
            }
        }
    }

    /// Bottom-up constant folding and local boolean rewriting.
    ///
    /// The result is equivalent to `self` under every assignment.
    pub fn simplify(&self) -> SmtTerm {
        match self {
            SmtTerm::Var(_) | SmtTerm::IntLit(_) | SmtTerm::BoolLit(_) => self.clone(),
            SmtTerm::Add(l, r) => {
                let (l, r) = (l.simplify(), r.simplify());
                match (l.as_int_lit(), r.as_int_lit()) {
                    (Some(a), Some(b)) => match a.checked_add(b) {
                        Some(n) => SmtTerm::int(n),
                        None => l.add(r),
                    },
                    (Some(0), None) => r,
                    (None, Some(0)) => l,
                    _ => l.add(r),
                }
            }
            SmtTerm::Sub(l, r) => {
                let (l, r) = (l.simplify(), r.simplify());
                match (l.as_int_lit(), r.as_int_lit()) {
                    (Some(a), Some(b)) => match a.checked_sub(b) {
                        Some(n) => SmtTerm::int(n),
                        None => l.sub(r),
                    },
                    (None, Some(0)) => l,
                    _ => l.sub(r),
                }
            }
            SmtTerm::Eq(l, r) => {
                let (l, r) = (l.simplify(), r.simplify());
                if l == r {
                    return SmtTerm::tt();
                }
                match (&l, &r) {
                    (SmtTerm::IntLit(a), SmtTerm::IntLit(b)) => SmtTerm::bool(a == b),
                    (SmtTerm::BoolLit(a), SmtTerm::BoolLit(b)) => SmtTerm::bool(a == b),
                    (SmtTerm::BoolLit(true), _) => r,
                    (_, SmtTerm::BoolLit(true)) => l,
                    (SmtTerm::BoolLit(false), _) => r.not().simplify(),
                    (_, SmtTerm::BoolLit(false)) => l.not().simplify(),
                    _ => l.eq(r),
                }
            }
            SmtTerm::Lt(l, r) => fold_cmp(l, r, |a, b| a < b, SmtTerm::lt),
            SmtTerm::Le(l, r) => fold_cmp(l, r, |a, b| a <= b, SmtTerm::le),
            SmtTerm::Gt(l, r) => fold_cmp(l, r, |a, b| a > b, SmtTerm::gt),
            SmtTerm::Ge(l, r) => fold_cmp(l, r, |a, b| a >= b, SmtTerm::ge),
            SmtTerm::And(terms) => {
                let mut out = Vec::with_capacity(terms.len());
                for t in terms {
                    match t.simplify() {
                        SmtTerm::BoolLit(true) => {}
                        SmtTerm::BoolLit(false) => return SmtTerm::ff(),
                        SmtTerm::And(inner) => out.extend(inner),
                        other => out.push(other),
                    }
                }
                match out.len() {
                    0 => SmtTerm::tt(),
                    1 => out.remove(0),
                    _ => SmtTerm::And(out),
                }
            }
            SmtTerm::Or(terms) => {
                let mut out = Vec::with_capacity(terms.len());
                for t in terms {
                    match t.simplify() {
                        SmtTerm::BoolLit(false) => {}
                        SmtTerm::BoolLit(true) => return SmtTerm::tt(),
                        SmtTerm::Or(inner) => out.extend(inner),
                        other => out.push(other),
                    }
                }
                match out.len() {
                    0 => SmtTerm::ff(),
                    1 => out.remove(0),
                    _ => SmtTerm::Or(out),
                }
            }
            SmtTerm::Not(inner) => match inner.simplify() {
                SmtTerm::BoolLit(b) => SmtTerm::bool(!b),
                SmtTerm::Not(x) => *x,
                other => other.not(),
            },
            SmtTerm::Implies(l, r) => {
                let (l, r) = (l.simplify(), r.simplify());
                match (l.as_bool_lit(), r.as_bool_lit()) {
                    (Some(false), _) | (_, Some(true)) => SmtTerm::tt(),
                    (Some(true), _) => r,
                    (_, Some(false)) => l.not().simplify(),
                    _ => l.implies(r),
                }
            }
            SmtTerm::Ite(c, t, e) => {
                let c = c.simplify();
                match c.as_bool_lit() {
                    Some(true) => return t.simplify(),
                    Some(false) => return e.simplify(),
                    None => {}
                }
                let (t, e) = (t.simplify(), e.simplify());
                if t == e {
                    return t;
                }
                match (t.as_bool_lit(), e.as_bool_lit()) {
                    (Some(true), Some(false)) => c,
                    (Some(false), Some(true)) => c.not().simplify(),
                    (Some(true), None) => SmtTerm::or(vec![c, e]).simplify(),
                    (Some(false), None) => SmtTerm::and(vec![c.not(), e]).simplify(),
                    (None, Some(true)) => SmtTerm::or(vec![c.not(), t]).simplify(),
                    (None, Some(false)) => SmtTerm::and(vec![c, t]).simplify(),
                    _ => c.ite(t, e),
                }
            }
        }
    }
}

fn fold_cmp(
    l: &SmtTerm,
    r: &SmtTerm,
    op: fn(i64, i64) -> bool,
    build: fn(SmtTerm, SmtTerm) -> SmtTerm,
) -> SmtTerm {
    let (l, r) = (l.simplify(), r.simplify());
    match (l.as_int_lit(), r.as_int_lit()) {
        (Some(a), Some(b)) => SmtTerm::bool(op(a, b)),
        _ => build(l, r),
    }
}

impl fmt::Display for SmtTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&to_smtlib(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn and_with_false_collapses() {
        let t = SmtTerm::and(vec![SmtTerm::var("a"), SmtTerm::ff(), SmtTerm::var("b")]);
        assert_eq!(t.simplify(), SmtTerm::ff());
    }

    #[test]
    fn nested_and_flattens_and_drops_true() {
        let t = SmtTerm::and(vec![
            SmtTerm::tt(),
            SmtTerm::and(vec![SmtTerm::var("a"), SmtTerm::var("b")]),
        ]);
        assert_eq!(
            t.simplify(),
            SmtTerm::And(vec![SmtTerm::var("a"), SmtTerm::var("b")])
        );
    }

    #[test]
    fn ite_with_constant_condition_selects_branch() {
        let t = SmtTerm::tt().ite(SmtTerm::int(1), SmtTerm::int(2));
        assert_eq!(t.simplify(), SmtTerm::int(1));
        let t = SmtTerm::var("c").ite(SmtTerm::var("x"), SmtTerm::var("x"));
        assert_eq!(t.simplify(), SmtTerm::var("x"));
    }

    #[test]
    fn boolean_ite_becomes_condition() {
        let t = SmtTerm::var("c").ite(SmtTerm::tt(), SmtTerm::ff());
        assert_eq!(t.simplify(), SmtTerm::var("c"));
        let t = SmtTerm::var("c").ite(SmtTerm::ff(), SmtTerm::tt());
        assert_eq!(t.simplify(), SmtTerm::var("c").not());
    }

    #[test]
    fn arithmetic_folds_literals() {
        let t = SmtTerm::int(3).add(SmtTerm::int(4)).le(SmtTerm::int(7));
        assert_eq!(t.simplify(), SmtTerm::tt());
        let t = SmtTerm::var("m").add(SmtTerm::int(0));
        assert_eq!(t.simplify(), SmtTerm::var("m"));
    }

    #[test]
    fn size_counts_nodes() {
        let t = SmtTerm::var("x").add(SmtTerm::int(1)).eq(SmtTerm::var("y"));
        assert_eq!(t.size(), 5);
    }

    #[test]
    fn variables_are_collected_sorted() {
        let t = SmtTerm::and(vec![SmtTerm::var("b"), SmtTerm::var("a").not()]);
        let vars: Vec<_> = t.variables().into_iter().collect();
        assert_eq!(vars, vec!["a".to_string(), "b".to_string()]);
    }
}
