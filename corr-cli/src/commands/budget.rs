use clap::Args;

use corr_core::budget::micro_to_usd;

use super::GlobalArgs;

#[derive(Args, Debug)]
pub struct BudgetArgs {}

pub async fn run(_args: BudgetArgs, globals: &GlobalArgs) -> anyhow::Result<i32> {
    let config = super::load_config(globals)?;
    let store = super::open_store(&config);
    let ledger = super::load_ledger(store.as_ref(), &config).await?;
    let snapshot = ledger.snapshot();

    if globals.json {
        println!("{}", serde_json::to_string_pretty(&snapshot.to_document())?);
        return Ok(0);
    }

    let used_pct = snapshot.used_fraction() * 100.0;
    println!(
        "month {:04}-{:02}: spent ${:.4} of ${:.2} cap ({used_pct:.1}% used), ${:.4} reserved",
        snapshot.year,
        snapshot.month,
        micro_to_usd(snapshot.spent_micro),
        micro_to_usd(snapshot.cap_micro),
        micro_to_usd(snapshot.reserved_micro),
    );
    println!(
        "  embedding: {} requests, {} tokens",
        snapshot.counters.embed_requests, snapshot.counters.embed_tokens,
    );
    println!(
        "  llm:       {} requests, {} tokens",
        snapshot.counters.llm_requests, snapshot.counters.llm_tokens,
    );
    Ok(0)
}
