//! Pre-flight cost estimate for a correlation run,
//! used by the orchestrator to pick a mode before committing to paid tiers.

use crate::budget::{usd_to_micro, BudgetLedger};
use crate::config::{BudgetConfig, ThresholdsConfig};

/// Rough per-item/per-pair token estimates used for projection only; actual
/// spend is tracked by the real provider calls via [`crate::budget`].
const EMBED_TOKENS_PER_ITEM: f64 = 200.0;
const LLM_INPUT_TOKENS_PER_PAIR: f64 = 500.0;
const LLM_OUTPUT_TOKENS_PER_PAIR: f64 = 100.0;

pub const DEFAULT_CACHE_HIT_RATE: f64 = 0.3;
pub const DEFAULT_RESIDUAL_FRACTION: f64 = 0.08;
const SAFETY_FACTOR: f64 = 1.25;

/// Caller's preferred mode for a correlation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Auto,
    Llm,
    RuleBased,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostEstimate {
    pub embed_micro: i64,
    pub llm_micro: i64,
    pub total_micro: i64,
    pub recommended_mode: Mode,
}

/// Tracks a per-source cache-hit moving average across runs in this process.
/// Process-lifetime only; not persisted across restarts.
#[derive(Debug, Clone, Copy)]
pub struct CacheHitEstimator {
    average: f64,
}

impl Default for CacheHitEstimator {
    fn default() -> Self {
        Self {
            average: DEFAULT_CACHE_HIT_RATE,
        }
    }
}

impl CacheHitEstimator {
    pub fn new(initial: f64) -> Self {
        Self {
            average: initial.clamp(0.0, 1.0),
        }
    }

    pub fn current(&self) -> f64 {
        self.average
    }

    /// Fold in an observed hit rate from a completed run with exponential
    /// smoothing (alpha = 0.2).
    pub fn observe(&mut self, observed_hit_rate: f64) {
        const ALPHA: f64 = 0.2;
        self.average = self.average * (1.0 - ALPHA) + observed_hit_rate.clamp(0.0, 1.0) * ALPHA;
    }
}

/// Project the cost of running the embedding and LLM tiers over
/// `unique_item_count` items producing `candidate_pair_count` pairs, and
/// recommend a mode honoring the caller's preference and the ledger's
/// current headroom. Over-projection is preferred to under-projection: a
/// 1.25x safety factor is applied before consulting the ledger.
pub fn project(
    unique_item_count: usize,
    candidate_pair_count: usize,
    cache_hit_rate: f64,
    preferred_mode: Mode,
    budget: &BudgetConfig,
    ledger: &BudgetLedger,
    thresholds: &ThresholdsConfig,
) -> CostEstimate {
    let embed_micro = project_embedding_cost(unique_item_count, cache_hit_rate, budget);
    let llm_micro = project_llm_cost(candidate_pair_count, DEFAULT_RESIDUAL_FRACTION, budget);
    let total_micro = embed_micro + llm_micro;

    // At `LlmDisabled` the paid tiers still serve from cache, so only a
    // full `DenyAll` (or an estimate that simply doesn't fit) downgrades
    // the recommendation to rule-based here; finer-grained degradation is
    // enforced per-tier by the orchestrator.
    let recommended_mode = match preferred_mode {
        Mode::RuleBased => Mode::RuleBased,
        Mode::Llm | Mode::Auto => {
            let degraded = ledger.degradation(thresholds);
            let fits = ledger.project(total_micro);
            if !fits || degraded >= crate::budget::DegradationLevel::DenyAll {
                Mode::RuleBased
            } else {
                preferred_mode
            }
        }
    };

    CostEstimate {
        embed_micro,
        llm_micro,
        total_micro,
        recommended_mode,
    }
}

fn project_embedding_cost(unique_item_count: usize, cache_hit_rate: f64, budget: &BudgetConfig) -> i64 {
    let miss_fraction = (1.0 - cache_hit_rate).clamp(0.0, 1.0);
    let billable_items = unique_item_count as f64 * miss_fraction;
    let tokens = billable_items * EMBED_TOKENS_PER_ITEM;
    let cost_usd = (tokens / 1000.0) * budget.embed_unit_price_per_1k * SAFETY_FACTOR;
    usd_to_micro(cost_usd)
}

fn project_llm_cost(candidate_pair_count: usize, residual_fraction: f64, budget: &BudgetConfig) -> i64 {
    let residual_pairs = candidate_pair_count as f64 * residual_fraction;
    let input_usd = (residual_pairs * LLM_INPUT_TOKENS_PER_PAIR / 1000.0) * budget.llm_input_price_per_1k;
    let output_usd = (residual_pairs * LLM_OUTPUT_TOKENS_PER_PAIR / 1000.0) * budget.llm_output_price_per_1k;
    usd_to_micro((input_usd + output_usd) * SAFETY_FACTOR)
}
