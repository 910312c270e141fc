use serde::{Deserialize, Serialize};

use super::evidence::EvidenceId;

/// Which pre-filter rule emitted a candidate pair. All rules that fire
/// for a pair are recorded; a pair is never emitted twice for the same
/// endpoint set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreFilterRule {
    SameAuthorDifferentSource,
    ExplicitReference,
    TemporalProximitySameAuthor,
    BranchTicketMatch,
    TitleNgramOverlap,
}

/// An unordered pair of evidence ids plus the union of rules that matched
/// it, and the minimal context later tiers need (matched key, time delta).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidatePair {
    pub a: EvidenceId,
    pub b: EvidenceId,
    pub rules: Vec<PreFilterRule>,
    /// External key matched by rule 2 or 4 (issue key, commit prefix, etc).
    pub matched_key: Option<String>,
    /// Absolute time delta between the two items, in seconds.
    pub time_delta_secs: i64,
    /// Jaccard n-gram overlap, populated when rule 5 fired.
    pub ngram_overlap: Option<f64>,
}

impl CandidatePair {
    /// Canonical ordering key: the pair endpoints sorted lexicographically.
    /// Pre-filter output is sorted by this to give deterministic ordering.
    pub fn sort_key(&self) -> (String, String) {
        if self.a.0 <= self.b.0 {
            (self.a.0.clone(), self.b.0.clone())
        } else {
            (self.b.0.clone(), self.a.0.clone())
        }
    }

    pub fn has_rule(&self, rule: PreFilterRule) -> bool {
        self.rules.contains(&rule)
    }
}
