pub mod budget;
pub mod replay;
pub mod run;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Subcommand;

use corr_core::budget::{BudgetLedger, LedgerDocument};
use corr_core::config::CorrConfig;
use corr_core::store::{self, FsStore, Store};

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Correlate an identity's evidence within a time window
    Run(run::RunArgs),
    /// Print the monthly budget ledger snapshot
    Budget(budget::BudgetArgs),
    /// Re-derive stories and insights from a stored run
    Replay(replay::ReplayArgs),
}

/// Flags shared by every subcommand.
#[derive(Debug)]
pub struct GlobalArgs {
    pub json: bool,
    pub quiet: bool,
    pub config: Option<PathBuf>,
}

pub async fn run(cmd: Command, globals: &GlobalArgs) -> anyhow::Result<i32> {
    match cmd {
        Command::Run(args) => run::run(args, globals).await,
        Command::Budget(args) => budget::run(args, globals).await,
        Command::Replay(args) => replay::run(args, globals).await,
    }
}

/// Load configuration with the documented precedence: `--config`, then
/// `CORR_CONFIG_PATH`, then `./corr.toml` if present, then compiled defaults.
/// Environment-variable overrides apply in every case.
pub fn load_config(globals: &GlobalArgs) -> anyhow::Result<CorrConfig> {
    let path = globals
        .config
        .clone()
        .or_else(|| std::env::var("CORR_CONFIG_PATH").ok().map(PathBuf::from))
        .or_else(|| {
            let default = PathBuf::from("corr.toml");
            default.exists().then_some(default)
        });
    CorrConfig::load(path.as_deref()).context("loading configuration")
}

/// The filesystem store rooted at the configured cache directory
/// (`CORR_CACHE_DIR` / `budget.cache_dir`, default `.corr`).
pub fn open_store(config: &CorrConfig) -> Arc<dyn Store> {
    let root = config
        .budget
        .cache_dir
        .clone()
        .unwrap_or_else(|| ".corr".to_string());
    Arc::new(FsStore::new(root))
}

/// Ledger for the current month, seeded from its persisted document when one
/// exists.
pub async fn load_ledger(store: &dyn Store, config: &CorrConfig) -> anyhow::Result<BudgetLedger> {
    let probe = BudgetLedger::new(&config.budget);
    let key = format!("ledger/{}", probe.snapshot().month_key());
    let document: Option<LedgerDocument> = store::get_json(store, &key).await?;
    Ok(match document {
        Some(doc) => BudgetLedger::restore(&config.budget, &doc),
        None => probe,
    })
}
