//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Which solver backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SolverChoice {
    #[default]
    Z3,
}

/// How the encoder treats policy constructs it cannot model exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SoundnessMode {
    /// Reject policies that use unsupported constructs.
    #[default]
    Strict,
    /// Approximate unsupported constructs and keep going.
    Permissive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    pub solver: SolverChoice,
    pub timeout_secs: u64,
    pub soundness: SoundnessMode,
    /// Write the SMT-LIB script of every checked encoding to this path.
    pub dump_smt: Option<String>,
    /// SSA versions whose simplified term has more nodes than this are bound
    /// to a fresh variable instead of being inlined.
    pub inline_threshold: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            solver: SolverChoice::Z3,
            timeout_secs: 300,
            soundness: SoundnessMode::Strict,
            dump_smt: None,
            inline_threshold: 500,
        }
    }
}

impl EngineOptions {
    pub fn permissive() -> Self {
        Self {
            soundness: SoundnessMode::Permissive,
            ..Self::default()
        }
    }
}
