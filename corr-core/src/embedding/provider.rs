//! Embedding provider implementations: a hosted HTTP backend and a local
//! deterministic fallback that costs nothing.

use std::hash::{Hash, Hasher};

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ProviderError;

use super::EmbeddingProvider;

/// OpenAI-compatible embeddings endpoint (`/v1/embeddings`).
#[derive(Debug)]
pub struct OpenAiEmbeddingProvider {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiEmbeddingProvider {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model,
            base_url: "https://api.openai.com".to_string(),
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[async_trait::async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let url = format!("{}/v1/embeddings", self.base_url);
        debug!(model = %self.model, batch = texts.len(), "calling embeddings API");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| ProviderError::Network {
                provider: "openai".to_string(),
                detail: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(if status.as_u16() == 401 {
                ProviderError::AuthFailed {
                    provider: "openai".to_string(),
                    detail: text,
                }
            } else {
                ProviderError::InvalidRequest {
                    provider: "openai".to_string(),
                    detail: format!("{status}: {text}"),
                }
            });
        }

        let parsed: EmbeddingResponse = resp.json().await.map_err(|e| ProviderError::Malformed {
            provider: "openai".to_string(),
            detail: e.to_string(),
        })?;

        if parsed.data.len() != texts.len() {
            return Err(ProviderError::Malformed {
                provider: "openai".to_string(),
                detail: format!("expected {} embeddings, got {}", texts.len(), parsed.data.len()),
            });
        }

        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

/// Local, deterministic bag-of-tokens embedder: each lowercased token hashes
/// to one dimension, and the resulting count vector is L2-normalized. Free
/// and offline — the reference binary's default when no embeddings API key
/// is configured. Much weaker than a learned model, but cosine over it
/// still separates near-duplicate titles from unrelated ones, which is all
/// the mid tier asks of it.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(8),
        }
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimensions];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            token.hash(&mut hasher);
            let h = hasher.finish();
            let index = (h % self.dimensions as u64) as usize;
            // Sign from a high bit spreads tokens over both directions,
            // keeping unrelated texts near-orthogonal in expectation.
            let sign = if h & (1 << 63) == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn model_id(&self) -> &str {
        "hashing-256"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|t| self.vectorize(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::cosine_similarity;

    #[tokio::test]
    async fn hashing_embedder_is_deterministic() {
        let embedder = HashingEmbedder::default();
        let a = embedder.embed(&["refactor payment retry".to_string()]).await.unwrap();
        let b = embedder.embed(&["refactor payment retry".to_string()]).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn hashing_embedder_separates_similar_from_unrelated() {
        let embedder = HashingEmbedder::default();
        let vectors = embedder
            .embed(&[
                "refactor payment retry logic".to_string(),
                "refactor payment retry backoff".to_string(),
                "update onboarding documentation images".to_string(),
            ])
            .await
            .unwrap();
        let similar = cosine_similarity(&vectors[0], &vectors[1]);
        let unrelated = cosine_similarity(&vectors[0], &vectors[2]);
        assert!(similar > unrelated);
    }

    #[tokio::test]
    async fn hashing_embedder_output_is_normalized() {
        let embedder = HashingEmbedder::default();
        let vectors = embedder.embed(&["one two three".to_string()]).await.unwrap();
        let norm: f32 = vectors[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }
}
