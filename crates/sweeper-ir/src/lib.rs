//! Network model for sweeper.
//!
//! This crate holds the vendor-independent view of a network that the
//! encoder consumes: addresses and header spaces, router configurations,
//! the routing-policy AST, and the topology graph inferred from them.

pub mod addr;
pub mod community;
pub mod graph;
pub mod header_space;
pub mod network;
pub mod policy;
#[cfg(any(test, feature = "proptest"))]
pub mod proptest_generators;
pub mod protocol;
