//! Solver-agnostic SMT terms and solver integration for control-plane
//! verification.
//!
//! Terms are built as plain [`terms::SmtTerm`] trees, accumulated in an
//! [`encoding::Encoding`] and discharged through any [`solver::SmtSolver`].
//! A Z3 backend is provided behind the default `z3` feature.

pub mod backends;
pub mod encoding;
pub mod solver;
pub mod sorts;
pub mod terms;

#[cfg(feature = "z3")]
pub use backends::z3_backend::Z3Solver;
pub use encoding::{check_encoding, Encoding};
pub use solver::{Model, ModelValue, SatResult, SmtSolver};
pub use sorts::SmtSort;
pub use terms::SmtTerm;
