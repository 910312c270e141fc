//! Embedding similarity tier: cosine similarity over cached vectors,
//! content-addressed so repeated runs over the same evidence never re-embed.

mod cache;
pub mod provider;

pub use cache::{blob_key, decode_vector, encode_vector, parse_blob_key, EmbeddingCache};
pub use provider::{HashingEmbedder, OpenAiEmbeddingProvider};

use std::time::Duration;

use tracing::{instrument, warn};

use crate::cancel::CancellationToken;
use crate::config::{ConcurrencyConfig, ThresholdsConfig};
use crate::error::ProviderError;
use crate::types::{CandidatePair, Evidence, VerdictMethod};

/// An embedding backend. Batches up to `max_batch` items per call.
#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_id(&self) -> &str;

    fn max_batch(&self) -> usize {
        64
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

#[async_trait::async_trait]
impl EmbeddingProvider for Box<dyn EmbeddingProvider> {
    fn model_id(&self) -> &str {
        (**self).model_id()
    }

    fn max_batch(&self) -> usize {
        (**self).max_batch()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        (**self).embed(texts).await
    }
}

/// Verdict produced by the embedding tier for one candidate pair.
#[derive(Debug, Clone)]
pub enum EmbeddingVerdict {
    /// Similarity at or above `embed_high` — accept without the LLM tier.
    Accept { verdict: VerdictMethod, strength: f64 },
    /// Similarity between `embed_low` and `embed_high` — promote to the LLM tier.
    Promote,
    /// Similarity below `embed_low` — drop the pair.
    Drop,
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    f64::from(dot / (norm_a * norm_b))
}

/// Affine-maps accepted cosine similarity from `[embed_high, 1.0]` into a
/// `[0.75, 0.92]` strength band for the confidence scorer, so the
/// embedding tier's contribution scales smoothly rather than saturating at
/// the acceptance boundary.
fn strength_from_similarity(similarity: f64, thresholds: &ThresholdsConfig) -> f64 {
    let span = (1.0 - thresholds.embed_high).max(f64::EPSILON);
    let t = ((similarity - thresholds.embed_high) / span).clamp(0.0, 1.0);
    0.75 + t * (0.92 - 0.75)
}

pub fn classify_similarity(similarity: f64, thresholds: &ThresholdsConfig) -> EmbeddingVerdict {
    if similarity >= thresholds.embed_high {
        EmbeddingVerdict::Accept {
            verdict: VerdictMethod::EmbeddingHigh,
            strength: strength_from_similarity(similarity, thresholds),
        }
    } else if similarity >= thresholds.embed_low {
        EmbeddingVerdict::Promote
    } else {
        EmbeddingVerdict::Drop
    }
}

/// Runs the embedding tier over a batch of candidate pairs, using the cache
/// to skip re-embedding evidence already seen under the same model id.
pub struct EmbeddingTier<P: EmbeddingProvider> {
    provider: P,
    cache: EmbeddingCache,
}

impl<P: EmbeddingProvider> EmbeddingTier<P> {
    pub fn new(provider: P, cache: EmbeddingCache) -> Self {
        Self { provider, cache }
    }

    /// Evidence in `evidence` not already cached under this provider's model
    /// id. Records a cache hit/miss per item, feeding [`Self::cache_hit_rate`].
    pub fn missing(&mut self, evidence: &[Evidence]) -> Vec<Evidence> {
        let model_id = self.provider.model_id().to_string();
        let mut missing = Vec::new();
        for e in evidence {
            let hit = self.cache.contains(e.fingerprint(), &model_id);
            self.cache.record_lookup(hit);
            if !hit {
                missing.push(e.clone());
            }
        }
        missing
    }

    pub fn max_batch(&self) -> usize {
        self.provider.max_batch()
    }

    pub fn cache_hit_rate(&self) -> f64 {
        self.cache.hit_rate()
    }

    /// Embed `missing`, batched up to the provider's `max_batch` and fanned
    /// out in waves of `embed_workers` concurrent requests. A failed batch
    /// is skipped (its items simply stay un-cached) and counted, not fatal;
    /// cancellation is observed between waves.
    #[instrument(skip_all, name = "embedding_fill_cache")]
    pub async fn embed_missing(
        &mut self,
        missing: &[Evidence],
        concurrency: &ConcurrencyConfig,
        cancel: &CancellationToken,
    ) -> EmbedRunStats {
        let model_id = self.provider.model_id().to_string();
        let timeout = Duration::from_secs(concurrency.embed_timeout_secs);
        let wave_width = (concurrency.embed_workers as usize).max(1);
        let mut stats = EmbedRunStats::default();

        let batches: Vec<&[Evidence]> = missing.chunks(self.max_batch()).collect();
        for wave in batches.chunks(wave_width) {
            if cancel.is_cancelled() {
                stats.cancelled = true;
                return stats;
            }
            let provider = &self.provider;
            let results = futures::future::join_all(wave.iter().map(|batch| async move {
                let texts: Vec<String> = batch
                    .iter()
                    .map(|e| format!("{}\n{}", e.title, e.body))
                    .collect();
                let outcome = tokio::time::timeout(timeout, provider.embed(&texts))
                    .await
                    .unwrap_or_else(|_| {
                        Err(ProviderError::Network {
                            provider: "embedding".to_string(),
                            detail: format!("timed out after {}s", concurrency.embed_timeout_secs),
                        })
                    });
                (texts, outcome)
            }))
            .await;

            for (batch, (texts, outcome)) in wave.iter().zip(results) {
                match outcome {
                    Ok(vectors) => {
                        stats.requests += 1;
                        stats.token_estimate += texts.iter().map(|t| t.len() as u64 / 4).sum::<u64>();
                        for (item, vector) in batch.iter().zip(vectors) {
                            self.cache.insert(item.fingerprint(), model_id.clone(), vector);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, batch_len = batch.len(), "embedding batch skipped");
                        stats.skipped_batches += 1;
                    }
                }
            }
        }
        stats
    }

    /// Whether this item has a cached vector under the current model id.
    pub fn has_vector(&self, evidence: &Evidence) -> bool {
        self.cache.contains(evidence.fingerprint(), self.provider.model_id())
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    /// Classify every candidate pair whose endpoints are both cached.
    /// Pairs with a missing vector (e.g. their batch was skipped) are left
    /// out — the orchestrator promotes or drops those per budget.
    pub fn classify(
        &self,
        pairs: &[CandidatePair],
        by_id: &std::collections::HashMap<String, &Evidence>,
        thresholds: &ThresholdsConfig,
    ) -> Vec<(CandidatePair, EmbeddingVerdict)> {
        let model_id = self.provider.model_id();
        let mut out = Vec::new();
        for pair in pairs {
            let (Some(ea), Some(eb)) = (by_id.get(&pair.a.0), by_id.get(&pair.b.0)) else {
                continue;
            };
            let (Some(va), Some(vb)) = (
                self.cache.get(ea.fingerprint(), model_id),
                self.cache.get(eb.fingerprint(), model_id),
            ) else {
                continue;
            };
            let similarity = cosine_similarity(va, vb);
            out.push((pair.clone(), classify_similarity(similarity, thresholds)));
        }
        out
    }
}

/// Outcome of one [`EmbeddingTier::embed_missing`] pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbedRunStats {
    pub requests: u64,
    /// Rough `chars / 4` token estimate for the embedded text, used for the
    /// ledger's usage counters.
    pub token_estimate: u64,
    pub skipped_batches: u64,
    pub cancelled: bool,
}

impl<P: EmbeddingProvider> std::fmt::Debug for EmbeddingTier<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingTier")
            .field("model_id", &self.provider.model_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_similarity_identical_vectors_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_orthogonal_is_zero() {
        assert!((cosine_similarity(&[1.0, 0.0], &[0.0, 1.0])).abs() < 1e-6);
    }

    #[test]
    fn classify_similarity_tiers() {
        let thresholds = ThresholdsConfig::default();
        assert!(matches!(
            classify_similarity(0.95, &thresholds),
            EmbeddingVerdict::Accept { .. }
        ));
        assert!(matches!(
            classify_similarity(0.6, &thresholds),
            EmbeddingVerdict::Promote
        ));
        assert!(matches!(
            classify_similarity(0.1, &thresholds),
            EmbeddingVerdict::Drop
        ));
    }

    #[test]
    fn strength_scales_within_band() {
        let thresholds = ThresholdsConfig::default();
        let low_strength = strength_from_similarity(thresholds.embed_high, &thresholds);
        let high_strength = strength_from_similarity(1.0, &thresholds);
        assert!((low_strength - 0.75).abs() < 1e-6);
        assert!(high_strength > low_strength);
        assert!(high_strength <= 0.92 + 1e-6);
    }

    struct FixedEmbedder {
        fail: bool,
    }

    #[async_trait::async_trait]
    impl EmbeddingProvider for FixedEmbedder {
        fn model_id(&self) -> &str {
            "fixed-1"
        }

        fn max_batch(&self) -> usize {
            2
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            if self.fail {
                return Err(ProviderError::Network {
                    provider: "fixed".to_string(),
                    detail: "down".to_string(),
                });
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn items(n: usize) -> Vec<Evidence> {
        (0..n)
            .map(|i| {
                Evidence::try_new(
                    format!("e{i}"),
                    "git",
                    crate::types::EvidenceKind::Commit,
                    "alice",
                    "2025-01-01T00:00:00Z",
                    format!("title {i}"),
                    "",
                    None,
                )
                .unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn embed_missing_fills_cache_and_counts_requests() {
        let mut tier = EmbeddingTier::new(FixedEmbedder { fail: false }, EmbeddingCache::new());
        let evidence = items(5);
        let missing = tier.missing(&evidence);
        assert_eq!(missing.len(), 5);

        let stats = tier
            .embed_missing(&missing, &ConcurrencyConfig::default(), &CancellationToken::new())
            .await;
        // 5 items at max_batch 2 is 3 requests.
        assert_eq!(stats.requests, 3);
        assert_eq!(stats.skipped_batches, 0);
        assert!(evidence.iter().all(|e| tier.has_vector(e)));
        assert!(tier.missing(&evidence).is_empty());
    }

    #[tokio::test]
    async fn embed_missing_skips_failed_batches_without_erroring() {
        let mut tier = EmbeddingTier::new(FixedEmbedder { fail: true }, EmbeddingCache::new());
        let evidence = items(3);
        let missing = tier.missing(&evidence);
        let stats = tier
            .embed_missing(&missing, &ConcurrencyConfig::default(), &CancellationToken::new())
            .await;
        assert_eq!(stats.requests, 0);
        assert_eq!(stats.skipped_batches, 2);
        assert!(!stats.cancelled);
        assert!(evidence.iter().all(|e| !tier.has_vector(e)));
    }

    #[tokio::test]
    async fn embed_missing_observes_cancellation_between_waves() {
        let mut tier = EmbeddingTier::new(FixedEmbedder { fail: false }, EmbeddingCache::new());
        let evidence = items(4);
        let missing = tier.missing(&evidence);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let stats = tier.embed_missing(&missing, &ConcurrencyConfig::default(), &cancel).await;
        assert!(stats.cancelled);
        assert_eq!(stats.requests, 0);
    }
}
