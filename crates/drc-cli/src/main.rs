use anyhow::Result;
use clap::{Parser, Subcommand};
use drc_storage::MergeOutcome;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "drc-cli")]
#[command(about = "Direct report cache command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every configured account and refresh the rolling cache.
    Run,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| {
            std::env::var("LOG_LEVEL")
                .ok()
                .and_then(|level| EnvFilter::try_new(level).ok())
        })
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

// Accounts are fetched one after another.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = drc_sync::run_sync_once_from_env().await?;
            let merge = match summary.merge {
                MergeOutcome::Written(stats) => format!(
                    "written rows={} evicted={}",
                    stats.total_rows(),
                    stats.evicted_rows
                ),
                MergeOutcome::SkippedNoNewData => "skipped (no new data)".to_string(),
            };
            println!(
                "sync complete: run_id={} window={}..{} accounts_ok={} accounts_failed={} cache={} {}",
                summary.run_id,
                summary.window_first,
                summary.window_last,
                summary.accounts.accounts_ok,
                summary.accounts.accounts_failed,
                summary.cache_path.display(),
                merge
            );
        }
    }

    Ok(())
}
