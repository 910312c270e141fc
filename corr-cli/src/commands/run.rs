use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use corr_core::cancel::CancellationToken;
use corr_core::collector::{CollectorRegistry, GitCollector, GitHubCollector, GitLabCollector, Window};
use corr_core::config::CorrConfig;
use corr_core::cost_projector::Mode;
use corr_core::embedding::{
    self, EmbeddingCache, EmbeddingProvider, EmbeddingTier, HashingEmbedder, OpenAiEmbeddingProvider,
};
use corr_core::llm::{AnthropicProvider, DisabledLlmProvider, LlmProvider};
use corr_core::observability::RunMode;
use corr_core::orchestrator::{CorrelateRequest, CorrelateResponse, Orchestrator};
use corr_core::store::Store;

use super::GlobalArgs;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Identity to collect for (git author email, forge username)
    #[arg(long)]
    pub identity: String,

    /// Window start (YYYY-MM-DD or RFC3339)
    #[arg(long)]
    pub from: String,

    /// Window end (YYYY-MM-DD or RFC3339, inclusive)
    #[arg(long)]
    pub to: String,

    /// Correlation mode
    #[arg(long, value_enum, default_value = "auto")]
    pub mode: ModeArg,

    /// Per-run spend ceiling in dollars
    #[arg(long)]
    pub max_cost: Option<f64>,

    /// Local git repository to collect commits from
    #[arg(long, default_value = ".")]
    pub repo: PathBuf,

    /// Print the cost estimate and exit without running the paid tiers
    #[arg(long)]
    pub estimate: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModeArg {
    Auto,
    Llm,
    Rules,
}

impl From<ModeArg> for Mode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Auto => Mode::Auto,
            ModeArg::Llm => Mode::Llm,
            ModeArg::Rules => Mode::RuleBased,
        }
    }
}

pub async fn run(args: RunArgs, globals: &GlobalArgs) -> anyhow::Result<i32> {
    let config = super::load_config(globals)?;
    let store = super::open_store(&config);
    let ledger = Arc::new(super::load_ledger(store.as_ref(), &config).await?);

    let window = Window {
        from: parse_date(&args.from, false).context("parsing --from")?,
        to: parse_date(&args.to, true).context("parsing --to")?,
    };

    let registry = build_registry(&config, &args.repo);
    let embedder = select_embedder(&config);
    let llm = select_llm(&config, args.mode);

    let cache = preload_cache(store.as_ref(), embedder.model_id()).await?;
    let tier = EmbeddingTier::new(embedder, cache);

    let orchestrator = Orchestrator::new(config, registry, ledger, tier, llm).with_store(Arc::clone(&store));

    let request = CorrelateRequest {
        items: None,
        identity: Some(args.identity),
        window: Some(window),
        mode: args.mode.into(),
        max_cost_usd: args.max_cost,
    };

    if args.estimate {
        let estimate = orchestrator.estimate(&request).await?;
        return print_estimate(&estimate, globals);
    }

    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling run");
            cancel_on_signal.cancel();
        }
    });

    let spinner = (!globals.quiet && !globals.json).then(|| {
        let bar = ProgressBar::new_spinner();
        bar.set_style(ProgressStyle::with_template("{spinner} {msg}").expect("valid template"));
        bar.set_message("correlating evidence...");
        bar.enable_steady_tick(std::time::Duration::from_millis(100));
        bar
    });

    let result = orchestrator.run(request, &cancel).await;
    if let Some(bar) = spinner {
        bar.finish_and_clear();
    }
    let response = result?;

    print_response(&response, globals)?;
    Ok(if response.run_report.mode == RunMode::Degraded { 2 } else { 0 })
}

fn build_registry(config: &CorrConfig, repo: &std::path::Path) -> CollectorRegistry {
    let mut registry = CollectorRegistry::new();
    registry.register(Arc::new(GitCollector::new(repo)));

    let github = &config.collectors.github;
    if github.enabled {
        if let Some((owner, name)) = github.project.split_once('/') {
            let token = std::env::var(&github.token_env).ok();
            registry.register(Arc::new(GitHubCollector::new(owner, name, token)));
        } else {
            warn!(project = %github.project, "github collector enabled but project is not owner/repo");
        }
    }

    let gitlab = &config.collectors.gitlab;
    if gitlab.enabled && !gitlab.project.is_empty() {
        let token = std::env::var(&gitlab.token_env).ok();
        let project_path = gitlab.project.replace('/', "%2F");
        registry.register(Arc::new(GitLabCollector::new(
            project_path,
            "https://gitlab.com/api/v4",
            token,
        )));
    }

    registry
}

fn select_embedder(config: &CorrConfig) -> Box<dyn EmbeddingProvider> {
    match std::env::var(&config.providers.embed_api_key_env) {
        Ok(key) if !key.is_empty() => Box::new(OpenAiEmbeddingProvider::new(
            key,
            config.providers.embed_model.clone(),
        )),
        _ => {
            info!(
                env = %config.providers.embed_api_key_env,
                "no embeddings API key, using the local hashing embedder"
            );
            Box::new(HashingEmbedder::default())
        }
    }
}

fn select_llm(config: &CorrConfig, mode: ModeArg) -> Box<dyn LlmProvider> {
    match std::env::var(&config.providers.llm_api_key_env) {
        Ok(key) if !key.is_empty() => Box::new(AnthropicProvider::new(key, config.providers.llm_model.clone())),
        _ => {
            if mode == ModeArg::Llm {
                warn!(
                    env = %config.providers.llm_api_key_env,
                    "LLM mode requested but no API key is set; promoted pairs will fall back to rule scores"
                );
            }
            Box::new(DisabledLlmProvider)
        }
    }
}

/// Pre-load persisted embedding blobs for this model into a fresh cache.
async fn preload_cache(store: &dyn Store, model_id: &str) -> anyhow::Result<EmbeddingCache> {
    let mut cache = EmbeddingCache::new();
    for key in store.list_prefix("embeddings/").await? {
        let Some(raw) = key.strip_prefix("embeddings/") else {
            continue;
        };
        let Some((fingerprint, cached_model)) = embedding::parse_blob_key(raw) else {
            continue;
        };
        if cached_model != model_id {
            continue;
        }
        if let Some(bytes) = store.get(&key).await? {
            cache.insert(fingerprint, cached_model, embedding::decode_vector(&bytes));
        }
    }
    Ok(cache)
}

/// Accept plain dates and full RFC3339 timestamps. A date-only `--to` means
/// end of that day. Unparseable input is a typed invalid-input error so the
/// process exits 4, not 1.
fn parse_date(raw: &str, end_of_day: bool) -> anyhow::Result<DateTime<Utc>> {
    use corr_core::error::{CorrError, EvidenceError};

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date: NaiveDate = raw.parse().map_err(|_| {
        anyhow::Error::new(CorrError::Evidence(EvidenceError::UnparseableTimestamp(
            raw.to_string(),
        )))
    })?;
    let time = if end_of_day {
        chrono::NaiveTime::from_hms_opt(23, 59, 59).expect("valid time")
    } else {
        chrono::NaiveTime::MIN
    };
    Ok(DateTime::from_naive_utc_and_offset(date.and_time(time), Utc))
}

fn print_estimate(estimate: &corr_core::cost_projector::CostEstimate, globals: &GlobalArgs) -> anyhow::Result<i32> {
    use corr_core::budget::micro_to_usd;
    if globals.json {
        println!(
            "{}",
            serde_json::json!({
                "embed_usd": micro_to_usd(estimate.embed_micro),
                "llm_usd": micro_to_usd(estimate.llm_micro),
                "total_usd": micro_to_usd(estimate.total_micro),
                "recommended_mode": format!("{:?}", estimate.recommended_mode),
            })
        );
    } else {
        println!(
            "estimated cost: ${:.4} (embedding ${:.4}, llm ${:.4}), recommended mode: {:?}",
            micro_to_usd(estimate.total_micro),
            micro_to_usd(estimate.embed_micro),
            micro_to_usd(estimate.llm_micro),
            estimate.recommended_mode,
        );
    }
    Ok(0)
}

fn print_response(response: &CorrelateResponse, globals: &GlobalArgs) -> anyhow::Result<()> {
    use corr_core::budget::micro_to_usd;

    if globals.json {
        let payload = serde_json::json!({
            "run_report": response.run_report,
            "relationships": response.relationships,
            "stories": response.stories,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    let report = &response.run_report;
    println!(
        "run {}: mode={:?} relationships={} stories={} spend=${:.4} (projected ${:.4})",
        report.run_id,
        report.mode,
        response.relationships.len(),
        response.stories.len(),
        micro_to_usd(report.spend.actual_micro),
        micro_to_usd(report.spend.projected_micro),
    );
    for story in &response.stories {
        println!(
            "  {}  {}  ({} items, {} .. {})",
            story.id,
            story.title,
            story.members.len(),
            story.t_min.format("%Y-%m-%d"),
            story.t_max.format("%Y-%m-%d"),
        );
    }
    if !report.partial_collection_warnings.is_empty() {
        println!("warnings:");
        for warning in &report.partial_collection_warnings {
            println!("  - collector {}: {}", warning.collector, warning.reason);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_date_accepts_plain_dates() {
        let from = parse_date("2025-03-01", false).unwrap();
        assert_eq!(from.to_rfc3339(), "2025-03-01T00:00:00+00:00");
        let to = parse_date("2025-03-01", true).unwrap();
        assert_eq!(to.to_rfc3339(), "2025-03-01T23:59:59+00:00");
    }

    #[test]
    fn parse_date_accepts_rfc3339() {
        let ts = parse_date("2025-03-01T12:30:00-05:00", false).unwrap();
        assert_eq!(ts.to_rfc3339(), "2025-03-01T17:30:00+00:00");
    }

    #[test]
    fn parse_date_rejects_garbage() {
        assert!(parse_date("yesterday", false).is_err());
    }

    #[test]
    fn mode_arg_maps_to_core_mode() {
        assert_eq!(Mode::from(ModeArg::Auto), Mode::Auto);
        assert_eq!(Mode::from(ModeArg::Llm), Mode::Llm);
        assert_eq!(Mode::from(ModeArg::Rules), Mode::RuleBased);
    }
}
