use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gradlink_core::{CandidateRecord, EligibilityWindow};
use gradlink_engine::{
    progress_report, remaining_work, BatchScheduler, CancelFlag, PacingPolicy, RunConfig, RunLimit,
};
use gradlink_resolver::{SearchResolver, SearchResolverConfig};
use gradlink_store::{FileSnapshot, MasterStore};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gradlink")]
#[command(about = "Reconcile graduate records against public profile search")]
struct Cli {
    /// Source dataset CSV (headers: name, course, affiliation, graduation_date).
    #[arg(long, global = true, default_value = "new_graduates.csv")]
    dataset: PathBuf,

    /// Master catalog snapshot path.
    #[arg(long, global = true, default_value = "profiles_master.json")]
    store: PathBuf,

    /// Eligibility window span in trailing calendar years.
    #[arg(long, global = true, default_value_t = 2)]
    window_years: i32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Resolve the next slice of unprocessed candidates.
    Run {
        /// How much work to take on: quick|small|medium|large|all or a number.
        #[arg(long, default_value = "quick")]
        limit: RunLimit,

        #[arg(long, default_value_t = 25)]
        batch_size: usize,

        /// Checkpoint (merge + persist) interval, in completed chunks.
        #[arg(long, default_value_t = 5)]
        checkpoint_every: usize,

        /// Skip the confirmation prompt for runs over 100 records.
        #[arg(long)]
        yes: bool,
    },
    /// Report catalog progress against the dataset.
    Progress,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let window = EligibilityWindow::trailing(cli.window_years);
    let backend = FileSnapshot::new(&cli.store);

    match cli.command {
        Commands::Run {
            limit,
            batch_size,
            checkpoint_every,
            yes,
        } => {
            let candidates = load_dataset(&cli.dataset)?;
            let mut store = MasterStore::load(&backend, window).await;
            let committed = store.committed_names().clone();
            let remaining = remaining_work(&candidates, &window, &committed);
            println!(
                "dataset: {} records, {} eligible and unprocessed, {} already committed",
                candidates.len(),
                remaining.len(),
                store.len()
            );

            let bound = limit.effective(remaining.len());
            if bound == 0 {
                println!("all eligible candidates are already reconciled; nothing to do");
                return Ok(());
            }
            let work: Vec<&CandidateRecord> = remaining.into_iter().take(bound).collect();

            if work.len() > 100 && !yes && !confirm_large_run(work.len())? {
                println!("run cancelled");
                return Ok(());
            }

            let cancel = CancelFlag::new();
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("interrupt received; flushing completed chunks before stopping");
                        cancel.cancel();
                    }
                });
            }

            let resolver = SearchResolver::new(SearchResolverConfig::from_env())
                .context("setting up the search resolver")?;
            let config = RunConfig {
                batch_size,
                checkpoint_every,
                limit,
                resolver_timeout: Duration::from_secs(20),
                pacing: pacing_from_env(),
            };

            let summary = BatchScheduler::new(config)
                .run(&work, &mut store, &backend, &resolver, &cancel)
                .await;

            println!(
                "run complete: processed={} matched={} skipped={} inserted={} chunks={} checkpoints={} catalog={}",
                summary.counters.processed,
                summary.counters.matched,
                summary.counters.skipped,
                summary.inserted,
                summary.chunks_completed,
                summary.checkpoints,
                summary.catalog_size,
            );
            if summary.cancelled {
                println!("interrupted; run again to resume where this left off");
            }
            if summary.checkpoint_failures > 0 {
                eprintln!(
                    "warning: {} checkpoint write(s) failed; see log output above",
                    summary.checkpoint_failures
                );
            }
        }
        Commands::Progress => {
            let candidates = load_dataset(&cli.dataset)?;
            let store = MasterStore::load(&backend, window).await;
            println!("{}", progress_report(candidates.len(), &store));
        }
    }

    Ok(())
}

fn load_dataset(path: &Path) -> Result<Vec<CandidateRecord>> {
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("opening dataset {}", path.display()))?;
    let mut records = Vec::new();
    for row in reader.deserialize() {
        let record: CandidateRecord =
            row.with_context(|| format!("parsing dataset row in {}", path.display()))?;
        records.push(record);
    }
    Ok(records)
}

fn pacing_from_env() -> PacingPolicy {
    let defaults = PacingPolicy::default();
    let millis = |key: &str| {
        std::env::var(key)
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
    };
    PacingPolicy {
        item_delay_min: millis("GRADLINK_ITEM_DELAY_MIN_MS").unwrap_or(defaults.item_delay_min),
        item_delay_max: millis("GRADLINK_ITEM_DELAY_MAX_MS").unwrap_or(defaults.item_delay_max),
        batch_pause: std::env::var("GRADLINK_BATCH_PAUSE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.batch_pause),
    }
}

fn confirm_large_run(count: usize) -> Result<bool> {
    print!("this run will process {count} records and may take hours; continue? (y/n): ");
    io::stdout().flush().context("flushing prompt")?;
    let mut line = String::new();
    io::stdin().read_line(&mut line).context("reading confirmation")?;
    Ok(line.trim().eq_ignore_ascii_case("y"))
}
