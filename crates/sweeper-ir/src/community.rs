use std::fmt;

use serde::{Deserialize, Serialize};

/// A symbolic community attribute.
///
/// Every literal community seen in the network becomes an `Exact` variable.
/// Every regex becomes a `Regex` variable plus an `Other` variable standing
/// for communities outside the network that the regex would accept.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CommunityVar {
    Exact(String),
    Regex(String),
    Other(String),
}

impl CommunityVar {
    pub fn value(&self) -> &str {
        match self {
            CommunityVar::Exact(v) | CommunityVar::Regex(v) | CommunityVar::Other(v) => v,
        }
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, CommunityVar::Exact(_))
    }

    pub fn is_regex(&self) -> bool {
        matches!(self, CommunityVar::Regex(_))
    }

    pub fn is_other(&self) -> bool {
        matches!(self, CommunityVar::Other(_))
    }

    /// Compact tag used inside SMT variable names.
    pub fn var_suffix(&self) -> String {
        match self {
            CommunityVar::Exact(v) => format!("E:{v}"),
            CommunityVar::Regex(v) => format!("R:{v}"),
            CommunityVar::Other(v) => format!("O:{v}"),
        }
    }
}

impl fmt::Display for CommunityVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommunityVar::Exact(v) => write!(f, "{v}"),
            CommunityVar::Regex(v) => write!(f, "/{v}/"),
            CommunityVar::Other(v) => write!(f, "other(/{v}/)"),
        }
    }
}
