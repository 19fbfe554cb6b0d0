//! Property instrumentation and the query driver.

pub mod adder;
pub mod checker;

use sweeper_ir::graph::GraphError;
use thiserror::Error;

use crate::encoder::EncodingError;

pub use checker::PropertyChecker;

#[derive(Debug, Error)]
pub enum CheckError {
    /// The query cannot be answered as posed, e.g. no router matches the
    /// source regex.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
    #[error("Invalid regex: {0}")]
    Regex(#[from] regex::Error),
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),
}
