//! The injected `MetricsReporter` contract plus the
//! `RunReport` both it and the CLI's human/JSON summary are built from.
//!
//! Complements, but is independent of, the `tracing` spans the orchestrator
//! emits at each state transition — those are for humans reading a terminal
//! or log aggregator; this is for programmatic consumers.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::collector::PartialCollectionWarning;

/// Per-tier item counts for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierCounts {
    pub collected: u64,
    pub deduplicated: u64,
    pub candidate_pairs: u64,
    pub embedded: u64,
    pub llm_adjudicated: u64,
    pub llm_skipped: u64,
    pub relationships_accepted: u64,
    pub stories: u64,
}

/// Projected vs. actual spend for the run, in micro-USD.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SpendBreakdown {
    pub projected_micro: i64,
    pub actual_micro: i64,
}

/// Final outcome mode for the run, as recorded in the report. Distinct from
/// [`crate::cost_projector::Mode`] (the caller's *preference*) — this is
/// what actually happened, which may differ under degradation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Normal,
    RuleBased,
    Degraded,
}

/// Everything one correlation run produced besides the relationships and
/// stories themselves. Schema-versioned for the persisted-run-report layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub schema_version: u32,
    pub run_id: String,
    pub mode: RunMode,
    pub tier_counts: TierCounts,
    pub relationship_counts_by_method: HashMap<String, u64>,
    pub spend: SpendBreakdown,
    pub cache_hit_rate: f64,
    pub partial_collection_warnings: Vec<PartialCollectionWarning>,
    pub failure_categories: Vec<String>,
    pub total_wall_ms: u64,
    pub per_tier_wall_ms: HashMap<String, u64>,
}

impl RunReport {
    pub fn new(run_id: String) -> Self {
        Self {
            schema_version: 1,
            run_id,
            mode: RunMode::Normal,
            tier_counts: TierCounts::default(),
            relationship_counts_by_method: HashMap::new(),
            spend: SpendBreakdown::default(),
            cache_hit_rate: 0.0,
            partial_collection_warnings: Vec::new(),
            failure_categories: Vec::new(),
            total_wall_ms: 0,
            per_tier_wall_ms: HashMap::new(),
        }
    }

    pub fn record_tier_wall_time(&mut self, tier: &str, elapsed: Duration) {
        self.per_tier_wall_ms
            .insert(tier.to_string(), elapsed.as_millis() as u64);
    }
}

/// Consumer of a finished run's metrics (a dashboard, a log sink, a test
/// assertion buffer). The core never logs metrics itself beyond `tracing`
/// diagnostics — this is the programmatic channel.
pub trait MetricsReporter: Send + Sync {
    fn report(&self, report: &RunReport);
}

#[derive(Debug, Default)]
pub struct NoopMetricsReporter;

impl MetricsReporter for NoopMetricsReporter {
    fn report(&self, _report: &RunReport) {}
}

/// Generate a fresh run id. Stable in format (a UUID v4 string), not in
/// value — uniqueness, not reproducibility, is the property that matters
/// for correlating a report with its run.
pub fn generate_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
