use std::collections::HashMap;

use crate::sorts::SmtSort;
use crate::terms::SmtTerm;

/// Result of a satisfiability check.
#[derive(Debug, Clone, PartialEq)]
pub enum SatResult {
    Sat,
    Unsat,
    Unknown(String),
}

/// A model (variable assignments) extracted from a SAT result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Model {
    pub values: HashMap<String, ModelValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelValue {
    Int(i64),
    Bool(bool),
}

impl ModelValue {
    pub fn as_int(self) -> Option<i64> {
        match self {
            ModelValue::Int(n) => Some(n),
            ModelValue::Bool(_) => None,
        }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            ModelValue::Bool(b) => Some(b),
            ModelValue::Int(_) => None,
        }
    }
}

impl std::fmt::Display for ModelValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelValue::Int(n) => write!(f, "{n}"),
            ModelValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl Model {
    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.values.get(name) {
            Some(ModelValue::Int(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.values.get(name) {
            Some(ModelValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// Evaluate a term under this model.
    ///
    /// Returns `None` when the term mentions a variable the model does not
    /// assign, or when sorts do not line up.
    pub fn eval(&self, term: &SmtTerm) -> Option<ModelValue> {
        use ModelValue::{Bool, Int};
        match term {
            SmtTerm::Var(name) => self.values.get(name).copied(),
            SmtTerm::IntLit(n) => Some(Int(*n)),
            SmtTerm::BoolLit(b) => Some(Bool(*b)),
            SmtTerm::Add(l, r) => Some(Int(self.eval_int(l)?.checked_add(self.eval_int(r)?)?)),
            SmtTerm::Sub(l, r) => Some(Int(self.eval_int(l)?.checked_sub(self.eval_int(r)?)?)),
            SmtTerm::Eq(l, r) => Some(Bool(self.eval(l)? == self.eval(r)?)),
            SmtTerm::Lt(l, r) => Some(Bool(self.eval_int(l)? < self.eval_int(r)?)),
            SmtTerm::Le(l, r) => Some(Bool(self.eval_int(l)? <= self.eval_int(r)?)),
            SmtTerm::Gt(l, r) => Some(Bool(self.eval_int(l)? > self.eval_int(r)?)),
            SmtTerm::Ge(l, r) => Some(Bool(self.eval_int(l)? >= self.eval_int(r)?)),
            SmtTerm::And(terms) => {
                let mut acc = true;
                for t in terms {
                    acc &= self.eval_bool(t)?;
                }
                Some(Bool(acc))
            }
            SmtTerm::Or(terms) => {
                let mut acc = false;
                for t in terms {
                    acc |= self.eval_bool(t)?;
                }
                Some(Bool(acc))
            }
            SmtTerm::Not(inner) => Some(Bool(!self.eval_bool(inner)?)),
            SmtTerm::Implies(l, r) => Some(Bool(!self.eval_bool(l)? || self.eval_bool(r)?)),
            SmtTerm::Ite(c, t, e) => {
                if self.eval_bool(c)? {
                    self.eval(t)
                } else {
                    self.eval(e)
                }
            }
        }
    }

    pub fn eval_bool(&self, term: &SmtTerm) -> Option<bool> {
        self.eval(term).and_then(ModelValue::as_bool)
    }

    pub fn eval_int(&self, term: &SmtTerm) -> Option<i64> {
        self.eval(term).and_then(ModelValue::as_int)
    }
}

/// Abstract SMT solver interface.
pub trait SmtSolver {
    type Error: std::error::Error;

    /// Declare a new variable.
    fn declare_var(&mut self, name: &str, sort: SmtSort) -> Result<(), Self::Error>;

    /// Assert a constraint.
    fn assert(&mut self, term: &SmtTerm) -> Result<(), Self::Error>;

    /// Check satisfiability.
    fn check_sat(&mut self) -> Result<SatResult, Self::Error>;

    /// Check satisfiability and extract a model if SAT.
    ///
    /// Every listed variable is completed in the returned model, even when
    /// the solver left it unconstrained.
    fn check_sat_with_model(
        &mut self,
        var_names: &[(&str, SmtSort)],
    ) -> Result<(SatResult, Option<Model>), Self::Error>;

    /// Reset the solver state.
    fn reset(&mut self) -> Result<(), Self::Error>;
}
