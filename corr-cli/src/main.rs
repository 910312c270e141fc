use clap::Parser;

mod commands;

#[derive(Parser, Debug)]
#[command(
    name = "corr",
    version,
    about = "Correlate engineering activity evidence into work stories"
)]
struct Cli {
    #[command(subcommand)]
    command: commands::Command,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Machine-readable JSON output instead of the human summary
    #[arg(long, global = true)]
    json: bool,

    /// Path to corr.toml (overrides discovery and CORR_CONFIG_PATH)
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,
}

/// Classify an error into a spec-defined exit code.
///
/// Exit codes:
///   0 — success
///   1 — general/unknown error
///   2 — degraded success (returned by commands, not via an error)
///   3 — budget denied
///   4 — invalid input (bad evidence, bad config, unknown run id)
fn classify_exit_code(err: &anyhow::Error) -> i32 {
    use corr_core::error::{CorrError, ErrorKind};

    match err.downcast_ref::<CorrError>().map(CorrError::kind) {
        Some(ErrorKind::BudgetDenied) => 3,
        Some(ErrorKind::InvalidInput) => 4,
        _ => 1,
    }
}

fn main() {
    let cli = Cli::parse();

    // CORR_LOG takes precedence over -v/-q, mirroring RUST_LOG convention.
    let filter = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (_, 0) => "warn",
        (_, 1) => "info",
        (_, 2) => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("CORR_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let globals = commands::GlobalArgs {
        json: cli.json,
        quiet: cli.quiet,
        config: cli.config,
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: Failed to create runtime: {e}");
            std::process::exit(1);
        }
    };

    match runtime.block_on(commands::run(cli.command, &globals)) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(classify_exit_code(&e));
        }
    }
}
