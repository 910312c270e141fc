//! LLM semantic adjudication tier: the most expensive, most precise
//! tier. Called only for pairs the embedding tier promotes.

pub mod provider;

pub use provider::{AnthropicProvider, DisabledLlmProvider, LlmProvider, MockLlmProvider, TokenUsage};

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::config::{ConcurrencyConfig, PrefilterConfig};
use crate::error::ProviderError;
use crate::types::{Evidence, RelationshipType, VerdictMethod};

/// The LLM's structured verdict on one candidate pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmVerdict {
    pub related: bool,
    pub suggested_type: Option<RelationshipType>,
    /// Self-reported confidence in `[0, 1]`.
    pub confidence: f64,
    pub rationale: String,
}

impl LlmVerdict {
    pub fn to_verdict_method(&self) -> VerdictMethod {
        if self.related {
            VerdictMethod::LlmPositive
        } else {
            VerdictMethod::LlmNegative
        }
    }
}

/// Build a bounded "item card" for one evidence item: title, truncated body,
/// author, timestamp, and source. Two cards plus a short instruction make up
/// the full adjudication prompt.
pub fn item_card(evidence: &Evidence, max_chars: usize) -> String {
    let mut body = evidence.body.clone();
    if body.chars().count() > max_chars {
        body = body.chars().take(max_chars).collect::<String>() + "...";
    }
    format!(
        "[{}:{}] {}\nauthor: {}\ntime: {}\n{}",
        evidence.source, evidence.id, evidence.title, evidence.author, evidence.timestamp, body
    )
}

pub fn build_prompt(a: &Evidence, b: &Evidence, config: &PrefilterConfig) -> String {
    format!(
        "You are adjudicating whether two pieces of engineering activity evidence describe the same underlying work.\n\
         Respond with a JSON object: {{\"related\": bool, \"suggested_type\": one of \
         \"solves\"|\"references\"|\"duplicates\"|\"sequential\"|\"discusses\"|\"co_authored\"|null, \
         \"confidence\": number in [0,1], \"rationale\": short string}}.\n\n\
         Item A:\n{}\n\nItem B:\n{}\n",
        item_card(a, config.llm_card_chars),
        item_card(b, config.llm_card_chars),
    )
}

/// Parse a raw LLM response into a verdict, attempting one repair pass if
/// the response isn't bare JSON (e.g. wrapped in a code fence).
pub fn parse_verdict(raw: &str) -> Result<LlmVerdict, ProviderError> {
    serde_json::from_str(raw).or_else(|_| {
        let repaired = raw
            .trim()
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();
        serde_json::from_str(repaired).map_err(|e| {
            warn!(error = %e, "failed to parse LLM verdict even after repair");
            ProviderError::Malformed {
                provider: "llm".to_string(),
                detail: e.to_string(),
            }
        })
    })
}

/// Token-bucket limiter shared by all LLM workers in a run. Each `acquire`
/// claims the next free send slot, spacing calls at least
/// `1 / requests_per_second` apart regardless of worker interleaving.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    next_free: tokio::sync::Mutex<tokio::time::Instant>,
}

impl RateLimiter {
    pub fn new(requests_per_second: f64) -> Self {
        let rps = requests_per_second.max(0.1);
        Self {
            min_interval: Duration::from_secs_f64(1.0 / rps),
            next_free: tokio::sync::Mutex::new(tokio::time::Instant::now()),
        }
    }

    pub async fn acquire(&self) {
        let slot = {
            let mut next_free = self.next_free.lock().await;
            let now = tokio::time::Instant::now();
            let slot = (*next_free).max(now);
            *next_free = slot + self.min_interval;
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

fn is_transient(err: &ProviderError) -> bool {
    matches!(err, ProviderError::Network { .. })
}

#[instrument(skip_all, name = "llm_adjudicate")]
pub async fn adjudicate(
    provider: &dyn LlmProvider,
    a: &Evidence,
    b: &Evidence,
    prefilter: &PrefilterConfig,
) -> Result<(LlmVerdict, TokenUsage), ProviderError> {
    let prompt = build_prompt(a, b, prefilter);
    let (raw, usage) = provider.call(&prompt, 0.0).await?;
    let verdict = parse_verdict(&raw)?;
    Ok((verdict, usage))
}

/// [`adjudicate`] with the per-call timeout and one retry on transient
/// failure. The retry backs off with jitter derived from the pair's
/// fingerprints, keeping the delay deterministic for a given input set.
pub async fn adjudicate_with_retry(
    provider: &dyn LlmProvider,
    a: &Evidence,
    b: &Evidence,
    prefilter: &PrefilterConfig,
    concurrency: &ConcurrencyConfig,
) -> Result<(LlmVerdict, TokenUsage), ProviderError> {
    let timeout = Duration::from_secs(concurrency.llm_timeout_secs);
    let call = || async {
        tokio::time::timeout(timeout, adjudicate(provider, a, b, prefilter))
            .await
            .unwrap_or_else(|_| {
                Err(ProviderError::Network {
                    provider: provider.name().to_string(),
                    detail: format!("timed out after {}s", concurrency.llm_timeout_secs),
                })
            })
    };

    match call().await {
        Err(e) if is_transient(&e) => {
            let jitter_ms = (a.fingerprint() ^ b.fingerprint()) % 250;
            let backoff = Duration::from_millis(250 + jitter_ms);
            debug!(error = %e, ?backoff, "transient LLM failure, retrying once");
            tokio::time::sleep(backoff).await;
            call().await
        }
        other => other,
    }
}
