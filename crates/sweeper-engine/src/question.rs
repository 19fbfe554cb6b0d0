//! Query descriptions consumed by the property checker.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sweeper_ir::header_space::HeaderSpace;

/// What external peers may announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EnvironmentType {
    /// Any announcement.
    #[default]
    Any,
    /// No announcements at all.
    None,
    /// Announcements with a bounded path length.
    Sane,
}

/// Metric bound applied to environment routes under [`EnvironmentType::Sane`].
pub const SANE_ENVIRONMENT_MAX_METRIC: i64 = 50;

/// How a differential query compares the base and delta copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffType {
    /// The delta network reaches at least what the base reaches.
    Increased,
    /// The delta network reaches at most what the base reaches.
    Reduced,
    /// Both copies agree.
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BgpRankingCriterion {
    LocalPref,
    PathLength,
    Med,
    EbgpOverIbgp,
    IgpCost,
}

impl BgpRankingCriterion {
    pub fn default_ranking() -> Vec<BgpRankingCriterion> {
        vec![
            BgpRankingCriterion::LocalPref,
            BgpRankingCriterion::PathLength,
            BgpRankingCriterion::Med,
            BgpRankingCriterion::EbgpOverIbgp,
            BgpRankingCriterion::IgpCost,
        ]
    }
}

/// How the destination header space is split into independently checked
/// encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Partitioning {
    #[default]
    Single,
    /// One partition per originated destination prefix, plus the rest.
    ByDestinationPrefix,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderQuestion {
    pub header_space: HeaderSpace,
    /// Maximum number of simultaneous link and node failures.
    pub failures: usize,
    pub base_env_type: EnvironmentType,
    pub delta_env_type: EnvironmentType,
    /// Set for differential queries.
    pub diff_type: Option<DiffType>,
    /// Let the environment differ between the base and delta copies.
    pub env_diff: bool,
    pub negate: bool,
    /// Block environment announcements that are not needed for the
    /// counterexample.
    pub minimize: bool,
    pub full_model: bool,
    pub benchmark: bool,
    /// Treat metrics past the protocol maximum as unreachable.
    pub model_overflow: bool,
    pub bgp_ranking: Vec<BgpRankingCriterion>,
    pub partitioning: Partitioning,
}

impl Default for HeaderQuestion {
    fn default() -> Self {
        Self {
            header_space: HeaderSpace::default(),
            failures: 0,
            base_env_type: EnvironmentType::Any,
            delta_env_type: EnvironmentType::Any,
            diff_type: None,
            env_diff: false,
            negate: false,
            minimize: false,
            full_model: false,
            benchmark: false,
            model_overflow: false,
            bgp_ranking: BgpRankingCriterion::default_ranking(),
            partitioning: Partitioning::Single,
        }
    }
}

impl HeaderQuestion {
    pub fn is_differential(&self) -> bool {
        self.diff_type.is_some()
    }
}

/// A header question anchored at locations in the network. Every regex is
/// matched against the whole name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderLocationQuestion {
    #[serde(flatten)]
    pub header: HeaderQuestion,
    pub ingress_node_regex: String,
    pub final_node_regex: String,
    pub final_iface_regex: String,
    pub fail_node1_regex: String,
    pub fail_node2_regex: String,
    pub not_fail_node1_regex: String,
    pub not_fail_node2_regex: String,
    pub fail_node_regex: String,
    pub not_fail_node_regex: String,
}

impl Default for HeaderLocationQuestion {
    fn default() -> Self {
        Self {
            header: HeaderQuestion::default(),
            ingress_node_regex: ".*".into(),
            final_node_regex: ".*".into(),
            final_iface_regex: ".*".into(),
            fail_node1_regex: ".*".into(),
            fail_node2_regex: ".*".into(),
            not_fail_node1_regex: String::new(),
            not_fail_node2_regex: String::new(),
            fail_node_regex: ".*".into(),
            not_fail_node_regex: String::new(),
        }
    }
}

impl HeaderLocationQuestion {
    pub fn new(header: HeaderQuestion) -> Self {
        Self {
            header,
            ..Self::default()
        }
    }
}

/// Compile `pattern` so that it must match a whole name.
pub fn full_match_regex(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})$"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_question_reads_flattened_json() {
        let q: HeaderLocationQuestion = serde_json::from_str(
            r#"{"failures": 1, "negate": true, "ingress_node_regex": "r[12]"}"#,
        )
        .unwrap();
        assert_eq!(q.header.failures, 1);
        assert!(q.header.negate);
        assert_eq!(q.ingress_node_regex, "r[12]");
        assert_eq!(q.final_node_regex, ".*");
        assert_eq!(q.header.bgp_ranking, BgpRankingCriterion::default_ranking());
    }

    #[test]
    fn regexes_match_whole_names() {
        let re = full_match_regex("r1").unwrap();
        assert!(re.is_match("r1"));
        assert!(!re.is_match("r10"));
        let empty = full_match_regex("").unwrap();
        assert!(!empty.is_match("r1"));
    }
}
