//! Confidence scorer: combines every method verdict fired for a pair
//! into a single calibrated confidence and a selected relationship type.

use crate::config::{ScorerConfig, ThresholdsConfig};
use crate::types::{
    CandidatePair, DetectionMethod, EvidenceOfEvidence, MethodVerdict, Relationship, RelationshipType,
    VerdictMethod,
};

fn prior_for(method: VerdictMethod, scorer: &ScorerConfig) -> f64 {
    match method {
        VerdictMethod::ExplicitReference => scorer.prior_explicit_reference,
        VerdictMethod::SameAuthorTemporal => scorer.prior_same_author_temporal,
        VerdictMethod::NgramOverlap => scorer.prior_ngram_overlap,
        VerdictMethod::EmbeddingHigh => scorer.prior_embedding_high,
        VerdictMethod::LlmPositive => scorer.prior_llm_positive,
        // Negative evidence has no prior of its own: it only dampens.
        VerdictMethod::LlmNegative => 0.0,
    }
}

/// Combine every verdict fired for one pair into a confidence score and a
/// selected type, via the `1 - prod(1 - prior*strength)` rule with
/// negative-LLM-evidence dampening.
pub fn score_pair(
    pair: &CandidatePair,
    verdicts: &[MethodVerdict],
    scorer: &ScorerConfig,
    thresholds: &ThresholdsConfig,
) -> Option<Relationship> {
    if verdicts.is_empty() {
        return None;
    }

    let positive: Vec<&MethodVerdict> = verdicts.iter().filter(|v| !v.method.is_negative()).collect();
    if positive.is_empty() {
        return None;
    }

    let mut complement_product = 1.0_f64;
    for v in &positive {
        let prior = prior_for(v.method, scorer);
        complement_product *= 1.0 - (prior * v.strength.clamp(0.0, 1.0));
    }
    let mut confidence = 1.0 - complement_product;

    let has_negative = verdicts.iter().any(|v| v.method.is_negative());
    if has_negative && scorer.dampen_negative_llm {
        confidence *= 1.0 - scorer.llm_negative_dampening;
    }
    confidence = confidence.clamp(0.0, 1.0);

    if confidence < thresholds.relationship_accept {
        return None;
    }

    let rel_type = select_type(&positive, scorer)?;
    let method = positive
        .iter()
        .max_by(|a, b| prior_for(a.method, scorer).total_cmp(&prior_for(b.method, scorer)))
        .map(|v| v.method.tier())
        .unwrap_or(DetectionMethod::RuleBased);

    let mut corroborating: Vec<VerdictMethod> = verdicts.iter().map(|v| v.method).collect();
    corroborating.sort_by_key(|m| format!("{m:?}"));
    corroborating.dedup();

    Some(Relationship {
        a: pair.a.clone(),
        b: pair.b.clone(),
        rel_type,
        confidence,
        method,
        corroborating,
        evidence: EvidenceOfEvidence {
            human_readable: describe(&positive, has_negative),
            machine_keyed: std::collections::HashMap::new(),
        },
    })
}

/// The highest-prior positive method's suggested type wins; ties broken by
/// the type's declared `Ord` (solves > references > duplicates > sequential
/// > discusses > co-authored — first variant wins ties).
fn select_type(positive: &[&MethodVerdict], scorer: &ScorerConfig) -> Option<RelationshipType> {
    let candidates: Vec<(f64, RelationshipType)> = positive
        .iter()
        .filter_map(|v| v.suggested_type.map(|t| (prior_for(v.method, scorer), t)))
        .collect();
    let top_prior = candidates.iter().map(|(p, _)| *p).fold(f64::MIN, f64::max);
    candidates
        .into_iter()
        .filter(|(p, _)| (*p - top_prior).abs() < f64::EPSILON)
        .map(|(_, t)| t)
        .min()
}

fn describe(positive: &[&MethodVerdict], has_negative: bool) -> String {
    let methods: Vec<String> = positive.iter().map(|v| format!("{:?}", v.method)).collect();
    let mut text = format!("corroborated by {}", methods.join(", "));
    if has_negative {
        text.push_str("; dampened by LLM dissent");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EvidenceId;

    fn pair() -> CandidatePair {
        CandidatePair {
            a: EvidenceId("a".into()),
            b: EvidenceId("b".into()),
            rules: vec![],
            matched_key: None,
            time_delta_secs: 0,
            ngram_overlap: None,
        }
    }

    fn verdict(method: VerdictMethod, strength: f64, suggested_type: Option<RelationshipType>) -> MethodVerdict {
        MethodVerdict {
            method,
            strength,
            suggested_type,
        }
    }

    #[test]
    fn single_explicit_reference_clears_acceptance_threshold() {
        let verdicts = vec![verdict(
            VerdictMethod::ExplicitReference,
            1.0,
            Some(RelationshipType::Solves),
        )];
        let rel = score_pair(&pair(), &verdicts, &ScorerConfig::default(), &ThresholdsConfig::default()).unwrap();
        assert!(rel.confidence >= 0.9);
        assert_eq!(rel.rel_type, RelationshipType::Solves);
    }

    #[test]
    fn corroborating_methods_raise_confidence_above_any_single_one() {
        let thresholds = ThresholdsConfig::default();
        let scorer = ScorerConfig::default();
        let single = vec![verdict(VerdictMethod::NgramOverlap, 1.0, Some(RelationshipType::Discusses))];
        let combined = vec![
            verdict(VerdictMethod::NgramOverlap, 1.0, Some(RelationshipType::Discusses)),
            verdict(VerdictMethod::SameAuthorTemporal, 1.0, Some(RelationshipType::Discusses)),
        ];
        let single_conf = score_pair(&pair(), &single, &scorer, &thresholds).unwrap().confidence;
        let combined_conf = score_pair(&pair(), &combined, &scorer, &thresholds).unwrap().confidence;
        assert!(combined_conf > single_conf);
    }

    #[test]
    fn negative_llm_evidence_dampens_confidence() {
        let thresholds = ThresholdsConfig::default();
        let scorer = ScorerConfig::default();
        let verdicts = vec![
            verdict(VerdictMethod::EmbeddingHigh, 0.9, Some(RelationshipType::Solves)),
            verdict(VerdictMethod::LlmNegative, 0.1, None),
        ];
        let with_negative = score_pair(&pair(), &verdicts, &scorer, &thresholds);
        let without_negative = score_pair(
            &pair(),
            &[verdict(VerdictMethod::EmbeddingHigh, 0.9, Some(RelationshipType::Solves))],
            &scorer,
            &thresholds,
        )
        .unwrap();
        match with_negative {
            Some(rel) => assert!(rel.confidence < without_negative.confidence),
            None => {} // dampened below acceptance threshold entirely is also valid
        }
    }

    #[test]
    fn below_acceptance_threshold_is_dropped() {
        let verdicts = vec![verdict(VerdictMethod::NgramOverlap, 0.1, Some(RelationshipType::Discusses))];
        let rel = score_pair(&pair(), &verdicts, &ScorerConfig::default(), &ThresholdsConfig::default());
        assert!(rel.is_none());
    }

    #[test]
    fn type_tie_break_prefers_solves_over_discusses() {
        let scorer = ScorerConfig {
            prior_ngram_overlap: 0.5,
            prior_same_author_temporal: 0.5,
            ..ScorerConfig::default()
        };
        let verdicts = vec![
            verdict(VerdictMethod::NgramOverlap, 1.0, Some(RelationshipType::Discusses)),
            verdict(VerdictMethod::SameAuthorTemporal, 1.0, Some(RelationshipType::Solves)),
        ];
        let positive: Vec<&MethodVerdict> = verdicts.iter().collect();
        assert_eq!(select_type(&positive, &scorer), Some(RelationshipType::Solves));
    }

    // ── Property-based calibration invariants ─────────────────────

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn arb_positive_method() -> impl Strategy<Value = VerdictMethod> {
            prop_oneof![
                Just(VerdictMethod::ExplicitReference),
                Just(VerdictMethod::SameAuthorTemporal),
                Just(VerdictMethod::NgramOverlap),
                Just(VerdictMethod::EmbeddingHigh),
                Just(VerdictMethod::LlmPositive),
            ]
        }

        fn arb_verdict() -> impl Strategy<Value = MethodVerdict> {
            (arb_positive_method(), 0.0..=1.0_f64).prop_map(|(method, strength)| MethodVerdict {
                method,
                strength,
                suggested_type: Some(RelationshipType::Discusses),
            })
        }

        /// Acceptance threshold dropped to zero so a score exists for every
        /// non-empty verdict set and the monotonicity comparison is total.
        fn open_thresholds() -> ThresholdsConfig {
            ThresholdsConfig {
                relationship_accept: 0.0,
                ..ThresholdsConfig::default()
            }
        }

        fn confidence_of(verdicts: &[MethodVerdict]) -> f64 {
            score_pair(&pair(), verdicts, &ScorerConfig::default(), &open_thresholds())
                .map_or(0.0, |r| r.confidence)
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(200))]

            #[test]
            fn adding_corroboration_never_decreases_confidence(
                base in proptest::collection::vec(arb_verdict(), 1..5),
                extra in arb_verdict(),
            ) {
                let before = confidence_of(&base);
                let mut extended = base.clone();
                extended.push(extra);
                let after = confidence_of(&extended);
                prop_assert!(after >= before - 1e-9);
            }

            #[test]
            fn llm_negative_never_increases_confidence(
                base in proptest::collection::vec(arb_verdict(), 1..5),
            ) {
                let before = confidence_of(&base);
                let mut dissented = base.clone();
                dissented.push(MethodVerdict {
                    method: VerdictMethod::LlmNegative,
                    strength: 0.9,
                    suggested_type: None,
                });
                let after = confidence_of(&dissented);
                prop_assert!(after <= before + 1e-9);
            }

            #[test]
            fn confidence_stays_in_unit_interval(
                verdicts in proptest::collection::vec(arb_verdict(), 1..8),
            ) {
                let confidence = confidence_of(&verdicts);
                prop_assert!((0.0..=1.0).contains(&confidence));
            }
        }
    }
}
