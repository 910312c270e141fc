use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::evidence::EvidenceId;

/// The tier that produced a relationship's winning verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    RuleBased,
    Embedding,
    Llm,
}

/// The semantic type of a relationship between two evidence items. Variants
/// are declared in the tie-breaking priority order the Confidence Scorer
/// (the confidence scorer) uses: `solves > references > duplicates > sequential > discusses >
/// co-authored`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    Solves,
    References,
    Duplicates,
    Sequential,
    Discusses,
    CoAuthored,
}

/// The finer-grained method that produced one scoring input. Several
/// map onto the same [`DetectionMethod`] tier (e.g. `SameAuthorTemporal` and
/// `NgramOverlap` both come from the rule-based tier).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictMethod {
    ExplicitReference,
    SameAuthorTemporal,
    NgramOverlap,
    EmbeddingHigh,
    LlmPositive,
    LlmNegative,
}

impl VerdictMethod {
    pub fn tier(self) -> DetectionMethod {
        match self {
            VerdictMethod::ExplicitReference
            | VerdictMethod::SameAuthorTemporal
            | VerdictMethod::NgramOverlap => DetectionMethod::RuleBased,
            VerdictMethod::EmbeddingHigh => DetectionMethod::Embedding,
            VerdictMethod::LlmPositive | VerdictMethod::LlmNegative => DetectionMethod::Llm,
        }
    }

    pub fn is_negative(self) -> bool {
        matches!(self, VerdictMethod::LlmNegative)
    }
}

/// One method's contribution to a pair's combined confidence. `strength` is
/// method-specific: normalized cosine similarity, Jaccard overlap, or the
/// LLM's self-reported confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodVerdict {
    pub method: VerdictMethod,
    pub strength: f64,
    /// Type suggested by this method, when it votes for one.
    pub suggested_type: Option<RelationshipType>,
}

/// Compact, human- and machine-readable explanation of why a relationship
/// was formed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvidenceOfEvidence {
    pub human_readable: String,
    #[serde(default)]
    pub machine_keyed: HashMap<String, serde_json::Value>,
}

/// A typed, confidence-weighted link between two evidence items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub a: EvidenceId,
    pub b: EvidenceId,
    pub rel_type: RelationshipType,
    pub confidence: f64,
    pub method: DetectionMethod,
    pub corroborating: Vec<VerdictMethod>,
    pub evidence: EvidenceOfEvidence,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_ordering_matches_tie_break_priority() {
        let mut types = vec![
            RelationshipType::CoAuthored,
            RelationshipType::Solves,
            RelationshipType::Discusses,
        ];
        types.sort();
        assert_eq!(
            types,
            vec![
                RelationshipType::Solves,
                RelationshipType::Discusses,
                RelationshipType::CoAuthored,
            ]
        );
    }

    #[test]
    fn verdict_method_maps_to_expected_tier() {
        assert_eq!(
            VerdictMethod::ExplicitReference.tier(),
            DetectionMethod::RuleBased
        );
        assert_eq!(VerdictMethod::EmbeddingHigh.tier(), DetectionMethod::Embedding);
        assert_eq!(VerdictMethod::LlmPositive.tier(), DetectionMethod::Llm);
        assert!(VerdictMethod::LlmNegative.is_negative());
        assert!(!VerdictMethod::LlmPositive.is_negative());
    }
}
