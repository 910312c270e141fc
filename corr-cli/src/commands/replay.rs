use clap::Args;

use corr_core::observability::RunMode;
use corr_core::orchestrator;

use super::GlobalArgs;

#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Run id whose stored relationships to re-group and re-enrich
    #[arg(long = "run")]
    pub run_id: String,
}

pub async fn run(args: ReplayArgs, globals: &GlobalArgs) -> anyhow::Result<i32> {
    let config = super::load_config(globals)?;
    let store = super::open_store(&config);

    let response = orchestrator::replay(store.as_ref(), &args.run_id, &config).await?;

    if globals.json {
        let payload = serde_json::json!({
            "run_report": response.run_report,
            "relationships": response.relationships,
            "stories": response.stories,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!(
            "replay of {}: relationships={} stories={}",
            args.run_id,
            response.relationships.len(),
            response.stories.len(),
        );
        for story in &response.stories {
            println!("  {}  {}  ({} items)", story.id, story.title, story.members.len());
        }
    }

    Ok(if response.run_report.mode == RunMode::Degraded { 2 } else { 0 })
}
