//! Sweeper verification engine.
//!
//! This crate compiles a network's control plane into an SMT encoding and
//! checks properties against it: optimization of the modelled route
//! attributes, SSA compilation of routing policies, per-partition encoding
//! of the forwarding decisions, property instrumentation, and
//! counterexample reconstruction.

pub mod counterexample;
pub mod encoder;
pub mod options;
pub mod property;
pub mod question;
pub mod result;

pub use encoder::{Encoder, EncodingError};
pub use options::{EngineOptions, SolverChoice, SoundnessMode};
pub use property::{CheckError, PropertyChecker};
pub use question::{HeaderLocationQuestion, HeaderQuestion};
pub use result::{Answer, Verdict, VerificationResult};
