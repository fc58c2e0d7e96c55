use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use comics_sync::{live_pipeline, RunSummary, SyncConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "comics-cli")]
#[command(about = "Comic archive ELT: one invocation per pipeline stage")]
struct Cli {
    /// Print the run summary as JSON instead of a single line.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Full historical load of `[start, end]`.
    Backfill {
        #[arg(long, default_value_t = 1)]
        start: i64,
        /// Defaults to the archive's latest comic.
        #[arg(long)]
        end: Option<i64>,
    },
    /// Load everything past the stored watermark.
    Incremental,
    /// Check for new comics. Exits 0 when there are some and 2 when there
    /// are none. A fatal error (upstream, storage, empty table) exits 1.
    Poll {
        /// Keep polling until new data shows up or the timeout passes.
        #[arg(long)]
        wait: bool,
        #[arg(long)]
        interval_secs: Option<u64>,
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Create the raw table if it does not exist.
    Migrate,
}

/// Exit status of `poll` when the archive has nothing past the watermark.
/// Kept apart from the status `main` returns on error.
const NO_NEW_DATA_EXIT: u8 = 2;

fn poll_exit_status(fresh: bool) -> u8 {
    if fresh {
        0
    } else {
        NO_NEW_DATA_EXIT
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }
    let window = summary
        .window
        .map(|w| format!("{}..={}", w.start, w.end))
        .unwrap_or_else(|| "none".to_string());
    println!(
        "{} complete: run_id={} window={} fetched={} missing={} invalid={} loaded={}",
        summary.mode,
        summary.run_id,
        window,
        summary.fetched,
        summary.missing.len(),
        summary.invalid,
        summary.loaded
    );
    if let Some(path) = &summary.quarantine_path {
        println!("quarantine: {path}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let pipeline = live_pipeline(&config)?;

    match cli.command {
        Commands::Backfill { start, end } => {
            let summary = pipeline.run_backfill(Some(start), end).await?;
            print_summary(&summary, cli.json)?;
        }
        Commands::Incremental => {
            let summary = pipeline.run_incremental().await?;
            print_summary(&summary, cli.json)?;
        }
        Commands::Poll {
            wait,
            interval_secs,
            timeout_secs,
        } => {
            let fresh = if wait {
                let mut settings = config.poll;
                if let Some(secs) = interval_secs {
                    settings.interval = Duration::from_secs(secs);
                }
                if let Some(secs) = timeout_secs {
                    settings.timeout = Duration::from_secs(secs);
                }
                pipeline.wait_for_new_data(settings).await?
            } else {
                pipeline.has_new_data().await?
            };
            println!("new data: {fresh}");
            return Ok(ExitCode::from(poll_exit_status(fresh)));
        }
        Commands::Migrate => {
            pipeline.ensure_table().await?;
            println!("table {} ready", pipeline.table());
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn no_new_data_is_not_the_error_status() {
        assert_eq!(poll_exit_status(true), 0);
        assert_eq!(poll_exit_status(false), NO_NEW_DATA_EXIT);
        // `Err` from main terminates with status 1.
        assert_ne!(NO_NEW_DATA_EXIT, 1);
    }

    #[test]
    fn poll_flags_parse() {
        let cli = Cli::try_parse_from([
            "comics-cli",
            "poll",
            "--wait",
            "--interval-secs",
            "30",
            "--json",
        ])
        .unwrap();
        assert!(cli.json);
        assert!(matches!(
            cli.command,
            Commands::Poll {
                wait: true,
                interval_secs: Some(30),
                timeout_secs: None
            }
        ));
    }
}
