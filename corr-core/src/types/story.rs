use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::evidence::EvidenceId;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StoryId(pub String);

impl std::fmt::Display for StoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A connected component of related evidence forming a coherent narrative.
///
/// `insights` is left as a generic JSON blob (populated by the Derived
/// Insights pass) rather than a typed field here, so this module
/// carries no dependency on the insights module — the same boundary the
/// source's `AnalysisResult` draws between a graph node and whatever
/// analyzer attached data to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkStory {
    pub id: StoryId,
    pub members: Vec<EvidenceId>,
    pub t_min: DateTime<Utc>,
    pub t_max: DateTime<Utc>,
    pub title: String,
    /// Ordered map so serialized stories are byte-stable across processes.
    pub per_source_counts: BTreeMap<String, u32>,
    #[serde(default)]
    pub insights: serde_json::Value,
}

impl WorkStory {
    /// Deterministic id derived from the sorted member fingerprints. Stable
    /// across runs given the same membership.
    pub fn derive_id(member_fingerprints: &[u64]) -> StoryId {
        let mut sorted = member_fingerprints.to_vec();
        sorted.sort_unstable();
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        use std::hash::{Hash, Hasher};
        sorted.hash(&mut hasher);
        StoryId(format!("story-{:016x}", hasher.finish()))
    }
}
