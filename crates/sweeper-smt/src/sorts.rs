/// SMT sorts used by control-plane encodings.
///
/// IP addresses, prefix lengths and small enumerations are all encoded as
/// bounded integers, so two sorts suffice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmtSort {
    Bool,
    Int,
}

impl SmtSort {
    pub fn is_bool(self) -> bool {
        matches!(self, SmtSort::Bool)
    }
}

impl std::fmt::Display for SmtSort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SmtSort::Bool => write!(f, "Bool"),
            SmtSort::Int => write!(f, "Int"),
        }
    }
}
