//! Shared fixtures for the correlation pipeline's integration tests:
//! evidence builders, scripted providers, and a harness that wires an
//! orchestrator from them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use corr_core::budget::BudgetLedger;
use corr_core::cancel::CancellationToken;
use corr_core::collector::{Capabilities, Collector, CollectorRegistry, Health, Window};
use corr_core::config::CorrConfig;
use corr_core::embedding::{EmbeddingCache, EmbeddingProvider, EmbeddingTier};
use corr_core::error::{CollectorError, ProviderError};
use corr_core::llm::{LlmProvider, LlmVerdict, TokenUsage};
use corr_core::orchestrator::Orchestrator;
use corr_core::types::{Evidence, EvidenceKind, RelationshipType};

// ── Evidence builders ─────────────────────────────────────────────

pub fn item(
    id: &str,
    source: &str,
    kind: EvidenceKind,
    author: &str,
    ts: &str,
    title: &str,
    body: &str,
) -> Evidence {
    Evidence::try_new(id, source, kind, author, ts, title, body, None).expect("fixture evidence is valid")
}

pub fn commit(id: &str, author: &str, ts: &str, title: &str) -> Evidence {
    item(id, "git", EvidenceKind::Commit, author, ts, title, "")
}

pub fn ticket(id: &str, author: &str, ts: &str, title: &str) -> Evidence {
    item(id, "jira", EvidenceKind::Ticket, author, ts, title, "")
}

/// The exact text the embedding tier submits for one item.
pub fn embed_text(evidence: &Evidence) -> String {
    format!("{}\n{}", evidence.title, evidence.body)
}

// ── Scripted embedding provider ───────────────────────────────────

/// Deterministic embedder: exact-text vector table with a zero-vector
/// default, an optional always-fail switch, and an optional cancellation
/// trigger after the Nth batch (for mid-embedding cancellation tests).
pub struct StubEmbedder {
    vectors: HashMap<String, Vec<f32>>,
    batch_size: usize,
    fail: bool,
    calls: Arc<AtomicU32>,
    cancel_after: Option<(u32, CancellationToken)>,
}

impl Default for StubEmbedder {
    fn default() -> Self {
        Self {
            vectors: HashMap::new(),
            batch_size: 64,
            fail: false,
            calls: Arc::new(AtomicU32::new(0)),
            cancel_after: None,
        }
    }
}

impl StubEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_vector(mut self, text: impl Into<String>, vector: Vec<f32>) -> Self {
        self.vectors.insert(text.into(), vector);
        self
    }

    #[must_use]
    pub fn with_vector_for(self, evidence: &Evidence, vector: Vec<f32>) -> Self {
        self.with_vector(embed_text(evidence), vector)
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Cancel `token` once `batches` embed calls have completed.
    #[must_use]
    pub fn cancelling_after(mut self, batches: u32, token: CancellationToken) -> Self {
        self.cancel_after = Some((batches, token));
        self
    }

    pub fn batches_served(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Counter handle that stays readable after the embedder moves into an
    /// orchestrator.
    pub fn call_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.calls)
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for StubEmbedder {
    fn model_id(&self) -> &str {
        "stub-embed-1"
    }

    fn max_batch(&self) -> usize {
        self.batch_size
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if self.fail {
            return Err(ProviderError::Network {
                provider: "stub-embed".to_string(),
                detail: "forced failure".to_string(),
            });
        }
        let served = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, token)) = &self.cancel_after {
            if served >= *after {
                token.cancel();
            }
        }
        Ok(texts
            .iter()
            .map(|t| self.vectors.get(t).cloned().unwrap_or_else(|| vec![0.0, 0.0, 0.0]))
            .collect())
    }
}

// ── Scripted LLM provider ─────────────────────────────────────────

pub struct ScriptedLlm {
    verdict: LlmVerdict,
    usage: TokenUsage,
    fail: bool,
    calls: Arc<AtomicU32>,
}

impl ScriptedLlm {
    pub fn related(rel_type: RelationshipType, confidence: f64) -> Self {
        Self {
            verdict: LlmVerdict {
                related: true,
                suggested_type: Some(rel_type),
                confidence,
                rationale: "scripted".to_string(),
            },
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 20,
            },
            fail: false,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn unrelated() -> Self {
        Self {
            verdict: LlmVerdict {
                related: false,
                suggested_type: None,
                confidence: 0.1,
                rationale: "scripted".to_string(),
            },
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 20,
            },
            fail: false,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Every call fails with a fatal (non-retried) provider error.
    pub fn failing() -> Self {
        let mut llm = Self::unrelated();
        llm.fail = true;
        llm
    }

    #[must_use]
    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = TokenUsage {
            input_tokens,
            output_tokens,
        };
        self
    }

    pub fn calls_served(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Counter handle that stays readable after the provider moves into an
    /// orchestrator.
    pub fn call_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.calls)
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted-llm"
    }

    fn model_id(&self) -> &str {
        "scripted-llm-1"
    }

    async fn call(&self, _prompt: &str, _temperature: f64) -> Result<(String, TokenUsage), ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ProviderError::AuthFailed {
                provider: "scripted-llm".to_string(),
                detail: "forced failure".to_string(),
            });
        }
        Ok((
            serde_json::to_string(&self.verdict).expect("verdict serializes"),
            self.usage.clone(),
        ))
    }
}

// ── Scripted collector ────────────────────────────────────────────

pub struct StubCollector {
    name: &'static str,
    evidence: Vec<Evidence>,
    failure: Option<CollectorError>,
}

impl StubCollector {
    pub fn healthy(name: &'static str, evidence: Vec<Evidence>) -> Self {
        Self {
            name,
            evidence,
            failure: None,
        }
    }

    pub fn unavailable(name: &'static str) -> Self {
        Self {
            name,
            evidence: Vec::new(),
            failure: Some(CollectorError::Unavailable {
                name: name.to_string(),
                detail: "stub unavailable".to_string(),
            }),
        }
    }
}

#[async_trait::async_trait(?Send)]
impl Collector for StubCollector {
    fn name(&self) -> &'static str {
        self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    async fn collect(&self, _identity: &str, _window: Window) -> Result<Vec<Evidence>, CollectorError> {
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(self.evidence.clone()),
        }
    }

    async fn health(&self) -> Health {
        Health {
            ok: self.failure.is_none(),
            detail: "stub".to_string(),
        }
    }
}

// ── Harness ───────────────────────────────────────────────────────

/// Everything a pipeline test needs to drive one orchestrator and inspect
/// the shared ledger afterwards.
pub struct Harness {
    pub orchestrator: Orchestrator<StubEmbedder, ScriptedLlm>,
    pub ledger: Arc<BudgetLedger>,
}

pub fn window(from: &str, to: &str) -> Window {
    Window {
        from: from.parse().expect("valid from"),
        to: to.parse().expect("valid to"),
    }
}

pub fn config_with_cap(cap_usd: f64) -> CorrConfig {
    let mut config = CorrConfig::default();
    config.budget.monthly_cap_usd = cap_usd;
    config
}

pub fn harness(config: CorrConfig, embedder: StubEmbedder, llm: ScriptedLlm) -> Harness {
    harness_with_collectors(config, embedder, llm, CollectorRegistry::new())
}

pub fn harness_with_collectors(
    config: CorrConfig,
    embedder: StubEmbedder,
    llm: ScriptedLlm,
    collectors: CollectorRegistry,
) -> Harness {
    let ledger = Arc::new(BudgetLedger::new(&config.budget));
    let tier = EmbeddingTier::new(embedder, EmbeddingCache::new());
    let orchestrator = Orchestrator::new(config, collectors, Arc::clone(&ledger), tier, llm);
    Harness { orchestrator, ledger }
}
