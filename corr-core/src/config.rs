//! Layered configuration: compiled defaults → `corr.toml` → environment.
//!
//! A top-level struct of `#[serde(default)]` sections, each with its own
//! `Default` impl, plus an environment-variable overlay applied after
//! deserialization.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorrConfig {
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub thresholds: ThresholdsConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub prefilter: PrefilterConfig,
    #[serde(default)]
    pub collectors: CollectorsConfig,
    #[serde(default)]
    pub scorer: ScorerConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Monthly spend cap in USD. Zero forces rule-based-only mode.
    pub monthly_cap_usd: f64,
    pub embed_unit_price_per_1k: f64,
    pub llm_input_price_per_1k: f64,
    pub llm_output_price_per_1k: f64,
    pub cache_dir: Option<String>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            monthly_cap_usd: 0.0,
            embed_unit_price_per_1k: 0.0001,
            llm_input_price_per_1k: 0.003,
            llm_output_price_per_1k: 0.015,
            cache_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdsConfig {
    /// cosine >= this emits a high-confidence embedding relationship.
    pub embed_high: f64,
    /// cosine >= this (but < embed_high) promotes to the LLM tier.
    pub embed_low: f64,
    /// title 3-gram Jaccard overlap threshold for pre-filter rule 5.
    pub ngram_overlap: f64,
    /// minimum edge confidence to participate in story grouping.
    pub group_confidence: f64,
    /// final acceptance threshold below which a pair is dropped.
    pub relationship_accept: f64,
    /// explicit-reference provisional confidence before calibration.
    pub explicit_reference_provisional: f64,
    /// max story member count before component splitting.
    pub max_story_members: usize,
    /// timeline phase-gap threshold, in hours.
    pub phase_gap_hours: i64,
    /// degradation ladder percentages of monthly cap.
    pub degrade_warn_pct: f64,
    pub degrade_disable_llm_pct: f64,
    pub degrade_deny_all_pct: f64,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            embed_high: 0.82,
            embed_low: 0.55,
            ngram_overlap: 0.35,
            group_confidence: 0.55,
            relationship_accept: 0.50,
            explicit_reference_provisional: 0.95,
            max_story_members: 50,
            phase_gap_hours: 72,
            degrade_warn_pct: 0.75,
            degrade_disable_llm_pct: 0.90,
            degrade_deny_all_pct: 1.00,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    pub embed_workers: u32,
    pub llm_workers: u32,
    /// Token-bucket rate cap across all LLM workers.
    pub llm_requests_per_second: f64,
    /// Hard ceiling on LLM calls within one correlation run; pairs beyond
    /// it are skipped, not queued.
    pub llm_max_requests_per_run: usize,
    pub run_deadline_ms: u64,
    pub collector_timeout_secs: u64,
    pub embed_timeout_secs: u64,
    pub llm_timeout_secs: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            embed_workers: 4,
            llm_workers: 2,
            llm_requests_per_second: 4.0,
            llm_max_requests_per_run: 200,
            run_deadline_ms: 30_000,
            collector_timeout_secs: 10,
            embed_timeout_secs: 15,
            llm_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefilterConfig {
    /// same-author-different-source window, in hours.
    pub same_author_window_hours: i64,
    /// max body length retained before any cost-bearing operation.
    pub max_body_chars: usize,
    /// per-item character cap in the LLM prompt card.
    pub llm_card_chars: usize,
    /// Path to a stop-word file for the title n-gram rule (one word per
    /// line, `#` comments allowed). Replaces the built-in list when set.
    #[serde(default)]
    pub stop_word_list_path: Option<String>,
}

impl Default for PrefilterConfig {
    fn default() -> Self {
        Self {
            same_author_window_hours: 24,
            max_body_chars: 8_000,
            llm_card_chars: 1_200,
            stop_word_list_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorsConfig {
    #[serde(default = "github_defaults")]
    pub github: ForgeCollectorConfig,
    #[serde(default = "gitlab_defaults")]
    pub gitlab: ForgeCollectorConfig,
}

fn github_defaults() -> ForgeCollectorConfig {
    ForgeCollectorConfig {
        token_env: "GITHUB_TOKEN".to_string(),
        ..ForgeCollectorConfig::default()
    }
}

fn gitlab_defaults() -> ForgeCollectorConfig {
    ForgeCollectorConfig {
        token_env: "GITLAB_TOKEN".to_string(),
        ..ForgeCollectorConfig::default()
    }
}

impl Default for CollectorsConfig {
    fn default() -> Self {
        Self {
            github: github_defaults(),
            gitlab: gitlab_defaults(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeCollectorConfig {
    pub enabled: bool,
    /// `owner/repo` (GitHub) or project path (GitLab).
    pub project: String,
    /// Name of the environment variable holding the API token.
    pub token_env: String,
}

impl Default for ForgeCollectorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            project: String::new(),
            token_env: "FORGE_TOKEN".to_string(),
        }
    }
}

/// Which provider backends the reference binary wires up. The API keys are
/// named indirectly by environment variable, never stored in the file; a
/// missing key downgrades that tier to its stub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    pub llm_model: String,
    pub llm_api_key_env: String,
    pub embed_model: String,
    pub embed_api_key_env: String,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            llm_model: "claude-3-5-haiku-latest".to_string(),
            llm_api_key_env: "ANTHROPIC_API_KEY".to_string(),
            embed_model: "text-embedding-3-small".to_string(),
            embed_api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorerConfig {
    pub prior_explicit_reference: f64,
    pub prior_llm_positive: f64,
    pub prior_embedding_high: f64,
    pub prior_same_author_temporal: f64,
    pub prior_ngram_overlap: f64,
    pub llm_negative_dampening: f64,
    pub dampen_negative_llm: bool,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            prior_explicit_reference: 0.95,
            prior_llm_positive: 0.88,
            prior_embedding_high: 0.78,
            prior_same_author_temporal: 0.62,
            prior_ngram_overlap: 0.45,
            llm_negative_dampening: 0.7,
            dampen_negative_llm: true,
        }
    }
}

impl CorrConfig {
    /// Load defaults, then an optional TOML file, then environment overrides.
    pub fn load(toml_path: Option<&std::path::Path>) -> Result<Self> {
        let mut config = match toml_path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    crate::error::CorrError::Config(ConfigError::Invalid(e.to_string()))
                })?;
                toml::from_str(&text)
                    .map_err(|e| crate::error::CorrError::Config(ConfigError::Parse(e.to_string())))?
            }
            Some(path) => {
                return Err(crate::error::CorrError::Config(ConfigError::NotFound(
                    path.display().to_string(),
                )));
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Core of [`Self::apply_env_overrides`], parameterized over the lookup
    /// so tests can supply a fixed map instead of mutating process env
    /// (`std::env::set_var` is unsound under concurrent test execution and
    /// this workspace forbids `unsafe`).
    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("CORR_MONTHLY_BUDGET_USD").and_then(|s| s.parse().ok()) {
            self.budget.monthly_cap_usd = v;
        }
        if let Some(v) = lookup("CORR_EMBED_UNIT_PRICE").and_then(|s| s.parse().ok()) {
            self.budget.embed_unit_price_per_1k = v;
        }
        if let Some(v) = lookup("CORR_LLM_INPUT_PRICE").and_then(|s| s.parse().ok()) {
            self.budget.llm_input_price_per_1k = v;
        }
        if let Some(v) = lookup("CORR_LLM_OUTPUT_PRICE").and_then(|s| s.parse().ok()) {
            self.budget.llm_output_price_per_1k = v;
        }
        if let Some(v) = lookup("CORR_CACHE_DIR") {
            self.budget.cache_dir = Some(v);
        }
        if let Some(v) = lookup("CORR_RUN_DEADLINE_MS").and_then(|s| s.parse().ok()) {
            self.concurrency.run_deadline_ms = v;
        }
        if let Some(v) = lookup("CORR_EMBED_WORKERS").and_then(|s| s.parse().ok()) {
            self.concurrency.embed_workers = v;
        }
        if let Some(v) = lookup("CORR_LLM_WORKERS").and_then(|s| s.parse().ok()) {
            self.concurrency.llm_workers = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.budget.monthly_cap_usd < 0.0 {
            return Err(crate::error::CorrError::Config(ConfigError::Invalid(
                "budget.monthly_cap_usd must be >= 0".into(),
            )));
        }
        if self.concurrency.embed_workers == 0 || self.concurrency.llm_workers == 0 {
            return Err(crate::error::CorrError::Config(ConfigError::Invalid(
                "worker counts must be >= 1".into(),
            )));
        }
        for (name, value) in [
            ("thresholds.embed_high", self.thresholds.embed_high),
            ("thresholds.embed_low", self.thresholds.embed_low),
            ("thresholds.ngram_overlap", self.thresholds.ngram_overlap),
            (
                "thresholds.group_confidence",
                self.thresholds.group_confidence,
            ),
            (
                "thresholds.relationship_accept",
                self.thresholds.relationship_accept,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(crate::error::CorrError::Config(ConfigError::Invalid(
                    format!("{name} must be within [0, 1], got {value}"),
                )));
            }
        }
        Ok(())
    }
}
