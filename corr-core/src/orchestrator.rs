//! The seven-step state machine that drives
//! a correlation request through collect → filter → embed → adjudicate →
//! score → group → enrich.
//!
//! State machine: `New → Collecting → Filtering → Embedding → Llm →
//! Scoring → Grouping → Enriching → Done`, with `Failed` reachable from any
//! state on a fatal error (an early `Err` return, never a partial result)
//! and `Degraded` a terminal success-with-warnings outcome reachable from
//! Embedding or Llm on a non-fatal provider or budget issue.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, instrument, warn};

use crate::budget::{usd_to_micro, BudgetLedger, BudgetSnapshot, DegradationLevel};
use crate::cancel::CancellationToken;
use crate::collector::{CollectorRegistry, Window};
use crate::config::CorrConfig;
use crate::cost_projector::{self, CacheHitEstimator, CostEstimate, Mode};
use crate::embedding::{EmbeddingProvider, EmbeddingTier, EmbeddingVerdict};
use crate::error::{CorrError, EvidenceError, Result};
use crate::grouping;
use crate::insights::{self, StoryInsights};
use crate::llm::{self, LlmProvider, RateLimiter};
use crate::observability::{generate_run_id, MetricsReporter, NoopMetricsReporter, RunMode, RunReport};
use crate::prefilter;
use crate::scorer;
use crate::store::{self, Store};
use crate::types::{
    CandidatePair, Evidence, EvidenceId, MethodVerdict, PreFilterRule, Relationship, RelationshipType,
    VerdictMethod, WorkStory,
};

/// A request to correlate either an explicit evidence set or everything a
/// given identity produced within a window.
#[derive(Debug, Clone)]
pub struct CorrelateRequest {
    pub items: Option<Vec<Evidence>>,
    pub identity: Option<String>,
    pub window: Option<Window>,
    pub mode: Mode,
    pub max_cost_usd: Option<f64>,
}

impl Default for CorrelateRequest {
    fn default() -> Self {
        Self {
            items: None,
            identity: None,
            window: None,
            mode: Mode::Auto,
            max_cost_usd: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CorrelateResponse {
    pub relationships: Vec<Relationship>,
    pub stories: Vec<WorkStory>,
    pub insights: HashMap<String, StoryInsights>,
    pub run_report: RunReport,
}

/// Evidence and relationships persisted per run so `replay` can re-derive
/// stories and insights without re-running the paid tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunArtifacts {
    pub schema_version: u32,
    pub run_id: String,
    pub evidence: Vec<Evidence>,
    pub relationships: Vec<Relationship>,
}

/// State machine position, surfaced only through `tracing` — the
/// orchestrator never exposes mid-run state to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    New,
    Collecting,
    Filtering,
    Embedding,
    Llm,
    Scoring,
    Grouping,
    Enriching,
    Done,
}

/// Maps a pre-filter rule hit into the rule-based tier's method verdict.
/// Strengths mirror the priority the pre-filter rules themselves are named
/// in; the scorer's configurable priors do the actual calibration.
fn rule_based_verdicts(pair: &CandidatePair) -> Vec<MethodVerdict> {
    pair.rules
        .iter()
        .map(|rule| match rule {
            PreFilterRule::ExplicitReference => MethodVerdict {
                method: VerdictMethod::ExplicitReference,
                strength: 1.0,
                suggested_type: Some(RelationshipType::Solves),
            },
            PreFilterRule::BranchTicketMatch => MethodVerdict {
                method: VerdictMethod::ExplicitReference,
                strength: 0.85,
                suggested_type: Some(RelationshipType::References),
            },
            PreFilterRule::SameAuthorDifferentSource | PreFilterRule::TemporalProximitySameAuthor => {
                MethodVerdict {
                    method: VerdictMethod::SameAuthorTemporal,
                    strength: 0.6,
                    suggested_type: Some(RelationshipType::Discusses),
                }
            }
            PreFilterRule::TitleNgramOverlap => MethodVerdict {
                method: VerdictMethod::NgramOverlap,
                strength: pair.ngram_overlap.unwrap_or(0.5),
                suggested_type: Some(RelationshipType::Discusses),
            },
        })
        .collect()
}

/// Tracks the run's cancellation token together with its wall-clock
/// deadline; both are observed at the same boundaries.
struct RunGuard<'a> {
    cancel: &'a CancellationToken,
    deadline: Instant,
}

impl RunGuard<'_> {
    fn interrupted(&self) -> bool {
        self.cancel.is_cancelled() || Instant::now() >= self.deadline
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Drives one correlation request end to end over injected collaborators.
/// Generic over the embedding and LLM providers so tests can substitute
/// stubs without any trait-object overhead on the hot path.
pub struct Orchestrator<E: EmbeddingProvider, L: LlmProvider> {
    config: CorrConfig,
    collectors: CollectorRegistry,
    ledger: Arc<BudgetLedger>,
    embedding: AsyncMutex<EmbeddingTier<E>>,
    llm: L,
    llm_limiter: RateLimiter,
    reporter: Arc<dyn MetricsReporter>,
    store: Option<Arc<dyn Store>>,
    cache_hit_estimator: std::sync::Mutex<CacheHitEstimator>,
}

impl<E: EmbeddingProvider, L: LlmProvider> Orchestrator<E, L> {
    pub fn new(
        config: CorrConfig,
        collectors: CollectorRegistry,
        ledger: Arc<BudgetLedger>,
        embedding: EmbeddingTier<E>,
        llm: L,
    ) -> Self {
        let llm_limiter = RateLimiter::new(config.concurrency.llm_requests_per_second);
        Self {
            config,
            collectors,
            ledger,
            embedding: AsyncMutex::new(embedding),
            llm,
            llm_limiter,
            reporter: Arc::new(NoopMetricsReporter),
            store: None,
            cache_hit_estimator: std::sync::Mutex::new(CacheHitEstimator::default()),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn MetricsReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Current ledger state (`BudgetStatus` in the correlation API).
    pub fn budget_status(&self) -> BudgetSnapshot {
        self.ledger.snapshot()
    }

    /// Pre-flight cost estimate for a request: runs the free steps (resolve,
    /// dedup, pre-filter) and projects the paid tiers without touching them.
    pub async fn estimate(&self, request: &CorrelateRequest) -> Result<CostEstimate> {
        let mut report = RunReport::new(generate_run_id());
        let evidence = self.resolve_input(request, &mut report).await?;
        let deduped = self.normalize(evidence)?;
        let pairs = prefilter::generate_candidates(&deduped, &self.config.prefilter, &self.config.thresholds);
        let embeddable = embeddable_item_count(&pairs);
        let cache_hit_rate = self.cache_hit_rate_estimate();
        Ok(cost_projector::project(
            embeddable,
            pairs.len(),
            cache_hit_rate,
            request.mode,
            &self.config.budget,
            &self.ledger,
            &self.config.thresholds,
        ))
    }

    #[instrument(skip_all, name = "orchestrator_run")]
    pub async fn run(&self, request: CorrelateRequest, cancel: &CancellationToken) -> Result<CorrelateResponse> {
        let run_id = generate_run_id();
        let start = Instant::now();
        let guard = RunGuard {
            cancel,
            deadline: start + Duration::from_millis(self.config.concurrency.run_deadline_ms),
        };
        let mut report = RunReport::new(run_id.clone());
        let mut state = RunState::New;
        debug!(?state, run_id, "orchestrator run created");
        let mut degraded = false;

        // Step 1: resolve input.
        state = RunState::Collecting;
        debug!(?state, run_id, "orchestrator transition");
        let tier_start = Instant::now();
        let evidence = self.resolve_input(&request, &mut report).await?;
        report.record_tier_wall_time("collecting", tier_start.elapsed());
        report.tier_counts.collected = evidence.len() as u64;

        if guard.interrupted() {
            return Err(CorrError::Cancelled);
        }

        // Step 2: normalize (validate, truncate bodies) and deduplicate.
        let deduped = self.normalize(evidence)?;
        report.tier_counts.deduplicated = deduped.len() as u64;

        if deduped.len() < 2 {
            return Ok(self
                .finish(report, Vec::new(), Vec::new(), HashMap::new(), &deduped, start, false, Mode::RuleBased)
                .await);
        }

        let by_id: HashMap<String, &Evidence> = deduped.iter().map(|e| (e.id.0.clone(), e)).collect();

        // Step 3: pre-filter.
        state = RunState::Filtering;
        debug!(?state, run_id, "orchestrator transition");
        let filter_start = Instant::now();
        let pairs = prefilter::generate_candidates(&deduped, &self.config.prefilter, &self.config.thresholds);
        report.record_tier_wall_time("filtering", filter_start.elapsed());
        report.tier_counts.candidate_pairs = pairs.len() as u64;

        if guard.interrupted() {
            return Err(CorrError::Cancelled);
        }

        let mut verdicts: HashMap<(String, String), Vec<MethodVerdict>> = HashMap::new();
        for pair in &pairs {
            verdicts.entry(pair.sort_key()).or_default().extend(rule_based_verdicts(pair));
        }

        // Pairs already resolved by an explicit reference skip the paid
        // tiers entirely (rule 2's short circuit); only the residue is
        // embedded and adjudicated.
        let residual: Vec<CandidatePair> = pairs
            .iter()
            .filter(|p| !p.has_rule(PreFilterRule::ExplicitReference))
            .cloned()
            .collect();

        // Step 4: cost projection and mode selection.
        let cache_hit_rate = self.cache_hit_rate_estimate();
        let estimate = cost_projector::project(
            embeddable_item_count(&residual),
            pairs.len(),
            cache_hit_rate,
            request.mode,
            &self.config.budget,
            &self.ledger,
            &self.config.thresholds,
        );
        report.spend.projected_micro = estimate.total_micro;
        let mut mode = estimate.recommended_mode;
        if let Some(max_cost) = request.max_cost_usd {
            if estimate.total_micro > usd_to_micro(max_cost) {
                debug!(run_id, "projected cost exceeds the caller's max_cost, using rule-based mode");
                mode = Mode::RuleBased;
            }
        }

        // Step 5: embedding pass over the residual pairs' endpoints.
        let mut promoted: Vec<CandidatePair> = Vec::new();
        if mode != Mode::RuleBased && !residual.is_empty() {
            state = RunState::Embedding;
            debug!(?state, run_id, "orchestrator transition");
            let embed_start = Instant::now();
            match self.run_embedding(&deduped, &residual, &by_id, estimate.embed_micro, &guard).await? {
                EmbeddingOutcome::Ran {
                    verdicts: embed_verdicts,
                    promoted: embed_promoted,
                    actual_micro,
                    skipped_batches,
                } => {
                    report.tier_counts.embedded = embed_verdicts.len() as u64;
                    for (key, v) in embed_verdicts {
                        verdicts.entry(key).or_default().push(v);
                    }
                    promoted = embed_promoted;
                    report.spend.actual_micro += actual_micro;
                    if skipped_batches > 0 {
                        degraded = true;
                        report
                            .failure_categories
                            .push(format!("embedding_batches_skipped: {skipped_batches}"));
                    }
                }
                EmbeddingOutcome::Cancelled => {
                    report.total_wall_ms = start.elapsed().as_millis() as u64;
                    self.reporter.report(&report);
                    return Err(CorrError::Cancelled);
                }
                EmbeddingOutcome::BudgetDenied => {
                    mode = Mode::RuleBased;
                    degraded = true;
                    report.failure_categories.push("budget_denied_pre_embedding".to_string());
                }
            }
            report.record_tier_wall_time("embedding", embed_start.elapsed());
        }

        // Step 6: LLM pass on promoted pairs, gated by the degradation ladder.
        if !promoted.is_empty() && mode != Mode::RuleBased {
            state = RunState::Llm;
            debug!(?state, run_id, "orchestrator transition");
            let llm_start = Instant::now();
            let per_pair_micro = estimate.llm_micro / (promoted.len() as i64).max(1);
            match self.run_llm(&promoted, &by_id, per_pair_micro, &guard, &mut report).await {
                Ok(llm_verdicts) => {
                    for (key, v) in llm_verdicts {
                        verdicts.entry(key).or_default().push(v);
                    }
                }
                Err(CorrError::Cancelled) => {
                    report.total_wall_ms = start.elapsed().as_millis() as u64;
                    self.reporter.report(&report);
                    return Err(CorrError::Cancelled);
                }
                Err(e) => return Err(e),
            }
            if report.tier_counts.llm_skipped > 0 {
                degraded = true;
            }
            report.record_tier_wall_time("llm", llm_start.elapsed());
        }

        // Step 7: score, group, enrich.
        state = RunState::Scoring;
        debug!(?state, run_id, "orchestrator transition");
        let score_start = Instant::now();
        let mut relationships = Vec::new();
        for pair in &pairs {
            if let Some(vs) = verdicts.get(&pair.sort_key()) {
                if let Some(rel) = scorer::score_pair(pair, vs, &self.config.scorer, &self.config.thresholds) {
                    *report
                        .relationship_counts_by_method
                        .entry(format!("{:?}", rel.method))
                        .or_insert(0) += 1;
                    relationships.push(rel);
                }
            }
        }
        report.tier_counts.relationships_accepted = relationships.len() as u64;
        report.record_tier_wall_time("scoring", score_start.elapsed());

        if guard.interrupted() {
            return Err(CorrError::Cancelled);
        }

        state = RunState::Grouping;
        debug!(?state, run_id, "orchestrator transition");
        let group_start = Instant::now();
        let stories = grouping::group_into_stories(&relationships, &by_id, &self.config.thresholds);
        report.tier_counts.stories = stories.len() as u64;
        report.record_tier_wall_time("grouping", group_start.elapsed());

        state = RunState::Enriching;
        debug!(?state, run_id, "orchestrator transition");
        let enrich_start = Instant::now();
        let relationships_by_type: Vec<(EvidenceId, EvidenceId, RelationshipType)> =
            relationships.iter().map(|r| (r.a.clone(), r.b.clone(), r.rel_type)).collect();
        let mut insights_by_story = HashMap::new();
        let mut enriched_stories = Vec::with_capacity(stories.len());
        for mut story in stories {
            let story_insights = insights::compute_insights(&story, &by_id, &relationships_by_type, &self.config.thresholds);
            story.insights = serde_json::to_value(&story_insights).unwrap_or(serde_json::Value::Null);
            insights_by_story.insert(story.id.0.clone(), story_insights);
            enriched_stories.push(story);
        }
        report.record_tier_wall_time("enriching", enrich_start.elapsed());

        {
            let mut estimator = self.cache_hit_estimator.lock().expect("cache hit estimator mutex poisoned");
            let observed = self.embedding.lock().await.cache_hit_rate();
            estimator.observe(observed);
            report.cache_hit_rate = observed;
        }

        state = RunState::Done;
        debug!(?state, run_id, "orchestrator transition");
        Ok(self
            .finish(report, relationships, enriched_stories, insights_by_story, &deduped, start, degraded, mode)
            .await)
    }

    fn cache_hit_rate_estimate(&self) -> f64 {
        self.cache_hit_estimator
            .lock()
            .expect("cache hit estimator mutex poisoned")
            .current()
    }

    /// Validate every item, truncate bodies to the configured cap (before
    /// any cost-bearing operation sees them), and deduplicate by fingerprint.
    fn normalize(&self, evidence: Vec<Evidence>) -> Result<Vec<Evidence>> {
        for item in &evidence {
            item.validate()?;
        }
        let mut deduped = CollectorRegistry::deduplicate(evidence);
        for item in &mut deduped {
            item.truncate_body_to(self.config.prefilter.max_body_chars);
        }
        // Fingerprint-keyed map iteration is unordered; re-sort so every
        // later stage sees a deterministic input order.
        deduped.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.source.cmp(&b.source)));
        Ok(deduped)
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        mut report: RunReport,
        relationships: Vec<Relationship>,
        stories: Vec<WorkStory>,
        insights: HashMap<String, StoryInsights>,
        evidence: &[Evidence],
        start: Instant,
        degraded: bool,
        mode: Mode,
    ) -> CorrelateResponse {
        report.mode = if degraded {
            RunMode::Degraded
        } else if mode == Mode::RuleBased
            || (report.tier_counts.embedded == 0 && report.tier_counts.llm_adjudicated == 0)
        {
            RunMode::RuleBased
        } else {
            RunMode::Normal
        };
        report.total_wall_ms = start.elapsed().as_millis() as u64;
        debug!(run_id = %report.run_id, ?report.mode, "orchestrator done");
        self.reporter.report(&report);

        if let Some(store) = &self.store {
            let report_key = format!("run_reports/{}", report.run_id);
            if let Err(e) = store::put_json(store.as_ref(), &report_key, &report).await {
                warn!(error = %e, "failed to persist run report");
            }
            let artifacts = RunArtifacts {
                schema_version: 1,
                run_id: report.run_id.clone(),
                evidence: evidence.to_vec(),
                relationships: relationships.clone(),
            };
            let artifacts_key = format!("runs/{}", report.run_id);
            if let Err(e) = store::put_json(store.as_ref(), &artifacts_key, &artifacts).await {
                warn!(error = %e, "failed to persist run artifacts");
            }
            let snapshot = self.ledger.snapshot();
            let ledger_key = format!("ledger/{}", snapshot.month_key());
            if let Err(e) = store::put_json(store.as_ref(), &ledger_key, &snapshot.to_document()).await {
                warn!(error = %e, "failed to persist ledger document");
            }
            let tier = self.embedding.lock().await;
            for (fingerprint, model_id, vector) in tier.cache().entries() {
                let blob_key = format!("embeddings/{}", crate::embedding::blob_key(fingerprint, model_id));
                if let Err(e) = store.put(&blob_key, &crate::embedding::encode_vector(vector)).await {
                    warn!(error = %e, "failed to persist embedding blob");
                    break;
                }
            }
        }

        CorrelateResponse {
            relationships,
            stories,
            insights,
            run_report: report,
        }
    }

    async fn resolve_input(&self, request: &CorrelateRequest, report: &mut RunReport) -> Result<Vec<Evidence>> {
        if let Some(items) = &request.items {
            return Ok(items.clone());
        }
        let identity = request
            .identity
            .as_deref()
            .ok_or(CorrError::Evidence(EvidenceError::MissingField("items or identity")))?;
        let window = request
            .window
            .ok_or(CorrError::Evidence(EvidenceError::MissingField("window")))?;

        let outcome = self.collectors.collect_all(identity, window, &self.config.concurrency).await;
        report.partial_collection_warnings = outcome.warnings;
        Ok(outcome.evidence)
    }

    async fn run_embedding(
        &self,
        evidence: &[Evidence],
        residual: &[CandidatePair],
        by_id: &HashMap<String, &Evidence>,
        projected_micro: i64,
        guard: &RunGuard<'_>,
    ) -> Result<EmbeddingOutcome> {
        let level = self.ledger.degradation(&self.config.thresholds);
        if level >= DegradationLevel::DenyAll {
            return Ok(EmbeddingOutcome::BudgetDenied);
        }
        // Ladder step 1: past the warn threshold, serve from cache only.
        let cache_only = level >= DegradationLevel::Warn;

        let mut tier = self.embedding.lock().await;

        let endpoint_ids: HashSet<&str> = residual
            .iter()
            .flat_map(|p| [p.a.0.as_str(), p.b.0.as_str()])
            .collect();
        let embeddable: Vec<Evidence> = evidence
            .iter()
            .filter(|e| endpoint_ids.contains(e.id.0.as_str()))
            .cloned()
            .collect();
        let missing = tier.missing(&embeddable);

        let mut actual_micro = 0_i64;
        let mut skipped_batches = 0_u64;
        if !missing.is_empty() && !cache_only {
            let handle = match self.ledger.reserve(projected_micro) {
                Ok(h) => h,
                Err(_) => return Ok(EmbeddingOutcome::BudgetDenied),
            };

            let embed_future = tier.embed_missing(&missing, &self.config.concurrency, guard.cancel);
            let stats = match tokio::time::timeout(guard.remaining(), embed_future).await {
                Ok(stats) => stats,
                Err(_) => {
                    self.ledger.release(handle, projected_micro)?;
                    return Ok(EmbeddingOutcome::Cancelled);
                }
            };
            if stats.cancelled {
                self.ledger.release(handle, projected_micro)?;
                return Ok(EmbeddingOutcome::Cancelled);
            }

            self.ledger.record_embed_usage(stats.token_estimate, stats.requests);
            actual_micro = embed_actual_cost_micro(stats.token_estimate, &self.config.budget);
            self.ledger.commit(handle, projected_micro, actual_micro)?;
            skipped_batches = stats.skipped_batches;
        }

        let classified = tier.classify(residual, by_id, &self.config.thresholds);

        let mut verdicts = Vec::new();
        let mut promoted = Vec::new();
        let mut seen: HashSet<(String, String)> = HashSet::new();
        for (pair, verdict) in classified {
            seen.insert(pair.sort_key());
            match verdict {
                EmbeddingVerdict::Accept { verdict, strength } => {
                    verdicts.push((
                        pair.sort_key(),
                        MethodVerdict {
                            method: verdict,
                            strength,
                            suggested_type: Some(RelationshipType::Discusses),
                        },
                    ));
                }
                EmbeddingVerdict::Promote => promoted.push(pair),
                EmbeddingVerdict::Drop => {}
            }
        }
        // Pairs whose vectors never materialized (skipped batch, cache-only
        // degradation) are promoted rather than silently dropped; the LLM
        // pass applies its own budget gate to them.
        for pair in residual {
            if !seen.contains(&pair.sort_key()) {
                promoted.push(pair.clone());
            }
        }
        drop(tier);

        Ok(EmbeddingOutcome::Ran {
            verdicts,
            promoted,
            actual_micro,
            skipped_batches,
        })
    }

    /// Adjudicate promoted pairs in waves of `llm_workers` concurrent calls,
    /// rate-limited and individually budget-gated. Outcomes fold into the
    /// report between waves; cancellation and the deadline are observed at
    /// wave boundaries.
    async fn run_llm(
        &self,
        promoted: &[CandidatePair],
        by_id: &HashMap<String, &Evidence>,
        per_pair_micro: i64,
        guard: &RunGuard<'_>,
        report: &mut RunReport,
    ) -> Result<Vec<((String, String), MethodVerdict)>> {
        let wave_width = (self.config.concurrency.llm_workers as usize).max(1);
        let mut out = Vec::new();

        // Per-run request ceiling: the overflow is skipped outright.
        let cap = self.config.concurrency.llm_max_requests_per_run;
        let (eligible, overflow) = promoted.split_at(promoted.len().min(cap));
        report.tier_counts.llm_skipped += overflow.len() as u64;

        for wave in eligible.chunks(wave_width) {
            if guard.interrupted() {
                return Err(CorrError::Cancelled);
            }

            let outcomes = futures::future::join_all(wave.iter().map(|pair| self.adjudicate_pair(pair, by_id, per_pair_micro))).await;

            for outcome in outcomes {
                match outcome? {
                    PairOutcome::Verdict { key, verdict, actual_micro } => {
                        report.spend.actual_micro += actual_micro;
                        report.tier_counts.llm_adjudicated += 1;
                        out.push((key, verdict));
                    }
                    PairOutcome::Skipped { reason } => {
                        report.tier_counts.llm_skipped += 1;
                        if let Some(reason) = reason {
                            report.failure_categories.push(reason);
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    async fn adjudicate_pair(
        &self,
        pair: &CandidatePair,
        by_id: &HashMap<String, &Evidence>,
        per_pair_micro: i64,
    ) -> Result<PairOutcome> {
        let degradation = self.ledger.degradation(&self.config.thresholds);
        if degradation >= DegradationLevel::LlmDisabled {
            return Ok(PairOutcome::Skipped { reason: None });
        }
        let (Some(a), Some(b)) = (by_id.get(pair.a.0.as_str()), by_id.get(pair.b.0.as_str())) else {
            return Ok(PairOutcome::Skipped { reason: None });
        };
        let handle = match self.ledger.reserve(per_pair_micro) {
            Ok(h) => h,
            Err(_) => return Ok(PairOutcome::Skipped { reason: None }),
        };

        self.llm_limiter.acquire().await;
        match llm::adjudicate_with_retry(&self.llm, a, b, &self.config.prefilter, &self.config.concurrency).await {
            Ok((verdict, usage)) => {
                let actual_micro = llm_actual_cost_micro(&usage, &self.config.budget);
                self.ledger.commit(handle, per_pair_micro, actual_micro)?;
                self.ledger
                    .record_llm_usage(usage.input_tokens + usage.output_tokens, 1);
                Ok(PairOutcome::Verdict {
                    key: pair.sort_key(),
                    verdict: MethodVerdict {
                        method: verdict.to_verdict_method(),
                        strength: verdict.confidence,
                        suggested_type: verdict.suggested_type,
                    },
                    actual_micro,
                })
            }
            Err(e) => {
                self.ledger.release(handle, per_pair_micro)?;
                Ok(PairOutcome::Skipped {
                    reason: Some(format!("llm_skipped: {e}")),
                })
            }
        }
    }
}

enum EmbeddingOutcome {
    Ran {
        verdicts: Vec<((String, String), MethodVerdict)>,
        promoted: Vec<CandidatePair>,
        actual_micro: i64,
        skipped_batches: u64,
    },
    Cancelled,
    BudgetDenied,
}

enum PairOutcome {
    Verdict {
        key: (String, String),
        verdict: MethodVerdict,
        actual_micro: i64,
    },
    Skipped {
        reason: Option<String>,
    },
}

fn embeddable_item_count(pairs: &[CandidatePair]) -> usize {
    pairs
        .iter()
        .filter(|p| !p.has_rule(PreFilterRule::ExplicitReference))
        .flat_map(|p| [p.a.0.as_str(), p.b.0.as_str()])
        .collect::<HashSet<&str>>()
        .len()
}

fn embed_actual_cost_micro(token_estimate: u64, budget: &crate::config::BudgetConfig) -> i64 {
    usd_to_micro((token_estimate as f64 / 1000.0) * budget.embed_unit_price_per_1k)
}

fn llm_actual_cost_micro(usage: &llm::TokenUsage, budget: &crate::config::BudgetConfig) -> i64 {
    let input_usd = (usage.input_tokens as f64 / 1000.0) * budget.llm_input_price_per_1k;
    let output_usd = (usage.output_tokens as f64 / 1000.0) * budget.llm_output_price_per_1k;
    usd_to_micro(input_usd + output_usd)
}

/// Re-derive stories and insights from a stored run's relationships and
/// evidence (`corr replay`): the free tail of the pipeline, steps 7b and 7c
/// only, no collection and no paid tiers.
pub async fn replay(store: &dyn Store, run_id: &str, config: &CorrConfig) -> Result<CorrelateResponse> {
    let key = format!("runs/{run_id}");
    let artifacts: RunArtifacts = store::get_json(store, &key)
        .await?
        .ok_or_else(|| CorrError::Store(crate::error::StoreError::NotFound(key)))?;

    let by_id: HashMap<String, &Evidence> = artifacts.evidence.iter().map(|e| (e.id.0.clone(), e)).collect();
    let stories = grouping::group_into_stories(&artifacts.relationships, &by_id, &config.thresholds);

    let relationships_by_type: Vec<(EvidenceId, EvidenceId, RelationshipType)> = artifacts
        .relationships
        .iter()
        .map(|r| (r.a.clone(), r.b.clone(), r.rel_type))
        .collect();

    let mut report = RunReport::new(format!("replay-{run_id}"));
    report.mode = RunMode::RuleBased;
    report.tier_counts.deduplicated = artifacts.evidence.len() as u64;
    report.tier_counts.relationships_accepted = artifacts.relationships.len() as u64;
    report.tier_counts.stories = stories.len() as u64;

    let mut insights_by_story = HashMap::new();
    let mut enriched_stories = Vec::with_capacity(stories.len());
    for mut story in stories {
        let story_insights = insights::compute_insights(&story, &by_id, &relationships_by_type, &config.thresholds);
        story.insights = serde_json::to_value(&story_insights).unwrap_or(serde_json::Value::Null);
        insights_by_story.insert(story.id.0.clone(), story_insights);
        enriched_stories.push(story);
    }

    Ok(CorrelateResponse {
        relationships: artifacts.relationships,
        stories: enriched_stories,
        insights: insights_by_story,
        run_report: report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BudgetConfig;
    use crate::embedding::EmbeddingCache;
    use crate::error::ProviderError;
    use crate::llm::{LlmVerdict, TokenUsage};
    use crate::store::InMemoryStore;
    use crate::types::EvidenceKind;

    struct StubEmbedder {
        vectors: HashMap<String, Vec<f32>>,
    }

    #[async_trait::async_trait]
    impl EmbeddingProvider for StubEmbedder {
        fn model_id(&self) -> &str {
            "stub-embed"
        }

        async fn embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
            Ok(texts
                .iter()
                .map(|t| self.vectors.get(t).cloned().unwrap_or_else(|| vec![0.0, 0.0]))
                .collect())
        }
    }

    struct StubLlm {
        verdict: LlmVerdict,
    }

    #[async_trait::async_trait]
    impl LlmProvider for StubLlm {
        fn name(&self) -> &str {
            "stub-llm"
        }

        fn model_id(&self) -> &str {
            "stub-model"
        }

        async fn call(&self, _prompt: &str, _temperature: f64) -> std::result::Result<(String, TokenUsage), ProviderError> {
            Ok((serde_json::to_string(&self.verdict).unwrap(), TokenUsage::default()))
        }
    }

    fn evidence(id: &str, kind: EvidenceKind, author: &str, ts: &str, title: &str, body: &str) -> Evidence {
        Evidence::try_new(id, "git", kind, author, ts, title, body, None).unwrap()
    }

    fn orchestrator(cap_usd: f64, embedder: StubEmbedder, llm_verdict: LlmVerdict) -> Orchestrator<StubEmbedder, StubLlm> {
        let config = CorrConfig {
            budget: BudgetConfig {
                monthly_cap_usd: cap_usd,
                ..BudgetConfig::default()
            },
            ..CorrConfig::default()
        };
        let ledger = Arc::new(BudgetLedger::new(&config.budget));
        let tier = EmbeddingTier::new(embedder, EmbeddingCache::new());
        Orchestrator::new(config, CollectorRegistry::new(), ledger, tier, StubLlm { verdict: llm_verdict })
    }

    fn solves_verdict() -> LlmVerdict {
        LlmVerdict {
            related: true,
            suggested_type: Some(RelationshipType::Solves),
            confidence: 0.9,
            rationale: String::new(),
        }
    }

    #[tokio::test]
    async fn explicit_reference_short_circuits_with_zero_spend() {
        let commit = evidence(
            "c1",
            EvidenceKind::Commit,
            "alice",
            "2025-03-10T10:00:00Z",
            "Fix login crash (AUTH-123)",
            "",
        );
        let ticket = evidence(
            "AUTH-123",
            EvidenceKind::Ticket,
            "alice",
            "2025-03-09T08:00:00Z",
            "Login crashes on empty password",
            "",
        );

        let orch = orchestrator(1.0, StubEmbedder { vectors: HashMap::new() }, solves_verdict());
        let request = CorrelateRequest {
            items: Some(vec![commit, ticket]),
            ..CorrelateRequest::default()
        };
        let response = orch.run(request, &CancellationToken::new()).await.unwrap();
        assert_eq!(response.relationships.len(), 1);
        assert_eq!(response.relationships[0].rel_type, RelationshipType::Solves);
        assert!(response.relationships[0].confidence >= 0.90);
        assert_eq!(response.stories.len(), 1);
        assert_eq!(response.run_report.spend.actual_micro, 0);
    }

    #[tokio::test]
    async fn zero_cap_forces_rule_based_mode() {
        let a = evidence("1", EvidenceKind::Commit, "alice", "2025-01-01T00:00:00Z", "refactor payment retry", "");
        let b = evidence("2", EvidenceKind::Commit, "alice", "2025-01-01T01:00:00Z", "refactor payment retry again", "");
        let orch = orchestrator(0.0, StubEmbedder { vectors: HashMap::new() }, solves_verdict());
        let request = CorrelateRequest {
            items: Some(vec![a, b]),
            ..CorrelateRequest::default()
        };
        let response = orch.run(request, &CancellationToken::new()).await.unwrap();
        assert_eq!(response.run_report.spend.actual_micro, 0);
        assert_eq!(response.run_report.tier_counts.embedded, 0);
        assert_eq!(response.run_report.mode, RunMode::RuleBased);
    }

    #[tokio::test]
    async fn single_evidence_item_produces_empty_result_with_zero_spend() {
        let a = evidence("1", EvidenceKind::Commit, "alice", "2025-01-01T00:00:00Z", "solo item", "");
        let orch = orchestrator(
            1.0,
            StubEmbedder { vectors: HashMap::new() },
            LlmVerdict {
                related: false,
                suggested_type: None,
                confidence: 0.1,
                rationale: String::new(),
            },
        );
        let request = CorrelateRequest {
            items: Some(vec![a]),
            ..CorrelateRequest::default()
        };
        let response = orch.run(request, &CancellationToken::new()).await.unwrap();
        assert!(response.relationships.is_empty());
        assert!(response.stories.is_empty());
        assert_eq!(response.run_report.spend.actual_micro, 0);
    }

    #[tokio::test]
    async fn cancellation_before_the_run_starts_returns_cancelled() {
        let orch = orchestrator(1.0, StubEmbedder { vectors: HashMap::new() }, solves_verdict());
        let token = CancellationToken::new();
        token.cancel();
        let a = evidence("1", EvidenceKind::Commit, "alice", "2025-01-01T00:00:00Z", "x", "");
        let b = evidence("2", EvidenceKind::Commit, "alice", "2025-01-01T01:00:00Z", "y", "");
        let request = CorrelateRequest {
            items: Some(vec![a, b]),
            ..CorrelateRequest::default()
        };
        let result = orch.run(request, &token).await;
        assert!(matches!(result, Err(CorrError::Cancelled)));
    }

    #[tokio::test]
    async fn missing_identity_and_items_is_invalid_input() {
        let orch = orchestrator(1.0, StubEmbedder { vectors: HashMap::new() }, solves_verdict());
        let result = orch.run(CorrelateRequest::default(), &CancellationToken::new()).await;
        assert!(matches!(
            result.map_err(|e| e.kind()),
            Err(crate::error::ErrorKind::InvalidInput)
        ));
    }

    #[tokio::test]
    async fn max_cost_below_projection_forces_rule_based() {
        let a = evidence("1", EvidenceKind::Commit, "alice", "2025-01-01T00:00:00Z", "refactor payment retry logic", "");
        let b = Evidence::try_new(
            "PAY-7",
            "jira",
            EvidenceKind::Ticket,
            "alice",
            "2025-01-01T01:00:00Z",
            "payment retry keeps failing",
            "",
            None,
        )
        .unwrap();
        let orch = orchestrator(10.0, StubEmbedder { vectors: HashMap::new() }, solves_verdict());
        let request = CorrelateRequest {
            items: Some(vec![a, b]),
            max_cost_usd: Some(0.0),
            ..CorrelateRequest::default()
        };
        let response = orch.run(request, &CancellationToken::new()).await.unwrap();
        // The same-author pair would normally be embedded; the caller's zero
        // max_cost pins the run to the free tier.
        assert_eq!(response.run_report.tier_counts.candidate_pairs, 1);
        assert_eq!(response.run_report.spend.actual_micro, 0);
        assert_eq!(response.run_report.tier_counts.embedded, 0);
    }

    #[tokio::test]
    async fn run_persists_artifacts_and_replay_regroups_identically() {
        let commit = evidence(
            "c1",
            EvidenceKind::Commit,
            "alice",
            "2025-03-10T10:00:00Z",
            "Fix login crash (AUTH-123)",
            "",
        );
        let ticket = evidence(
            "AUTH-123",
            EvidenceKind::Ticket,
            "alice",
            "2025-03-09T08:00:00Z",
            "Login crashes on empty password",
            "",
        );
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let orch = orchestrator(1.0, StubEmbedder { vectors: HashMap::new() }, solves_verdict())
            .with_store(Arc::clone(&store));
        let request = CorrelateRequest {
            items: Some(vec![commit, ticket]),
            ..CorrelateRequest::default()
        };
        let response = orch.run(request, &CancellationToken::new()).await.unwrap();
        let run_id = response.run_report.run_id.clone();

        let replayed = replay(store.as_ref(), &run_id, &CorrConfig::default()).await.unwrap();
        assert_eq!(replayed.stories.len(), response.stories.len());
        assert_eq!(replayed.stories[0].id, response.stories[0].id);
        assert_eq!(replayed.relationships.len(), response.relationships.len());
    }

    #[tokio::test]
    async fn replay_of_unknown_run_is_invalid_input() {
        let store = InMemoryStore::new();
        let result = replay(&store, "nope", &CorrConfig::default()).await;
        assert!(matches!(
            result.map_err(|e| e.kind()),
            Err(crate::error::ErrorKind::InvalidInput)
        ));
    }

    #[tokio::test]
    async fn estimate_projects_zero_for_explicit_reference_only_input() {
        let commit = evidence(
            "c1",
            EvidenceKind::Commit,
            "bob",
            "2025-03-10T10:00:00Z",
            "Fix login crash (AUTH-123)",
            "",
        );
        let ticket = evidence(
            "AUTH-123",
            EvidenceKind::Ticket,
            "carol",
            "2025-03-09T08:00:00Z",
            "Login crashes on empty password",
            "",
        );
        let orch = orchestrator(1.0, StubEmbedder { vectors: HashMap::new() }, solves_verdict());
        let request = CorrelateRequest {
            items: Some(vec![commit, ticket]),
            ..CorrelateRequest::default()
        };
        let estimate = orch.estimate(&request).await.unwrap();
        assert_eq!(estimate.embed_micro, 0);
    }
}
