//! Reconciliation engine: work selection, checkpointed batch scheduling,
//! pacing, and cooperative cancellation.
//!
//! Execution is strictly sequential: the external resolver is rate-sensitive
//! and checkpointing assumes chunks complete in dataset order. Durability is
//! chunk-granular; a chunk interrupted mid-execution contributes nothing and
//! its items are simply re-attempted on the next run.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gradlink_core::{canonical_name, CandidateRecord, EligibilityWindow, ResolvedCandidate};
use gradlink_resolver::ProfileResolver;
use gradlink_store::{MasterStore, SnapshotBackend};
use rand::Rng;
use serde::Serialize;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "gradlink-engine";

/// Recognized work-amount presets plus a custom bound. Collapses the
/// original interactive menu into one configuration value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunLimit {
    Quick,
    Small,
    Medium,
    Large,
    AllRemaining,
    Custom(usize),
}

impl RunLimit {
    /// Effective item bound for this run given how much work remains.
    /// Never exceeds `remaining`; zero is a valid answer.
    pub fn effective(self, remaining: usize) -> usize {
        let cap = match self {
            RunLimit::Quick => 10,
            RunLimit::Small => 50,
            RunLimit::Medium => 200,
            RunLimit::Large => 500,
            RunLimit::AllRemaining => remaining,
            RunLimit::Custom(n) => n,
        };
        cap.min(remaining)
    }
}

impl FromStr for RunLimit {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "quick" => Ok(RunLimit::Quick),
            "small" => Ok(RunLimit::Small),
            "medium" => Ok(RunLimit::Medium),
            "large" => Ok(RunLimit::Large),
            "all" => Ok(RunLimit::AllRemaining),
            other => other
                .parse::<usize>()
                .map(RunLimit::Custom)
                .map_err(|_| format!("expected quick|small|medium|large|all or a number, got {raw:?}")),
        }
    }
}

/// Inter-call spacing imposed by the external search service. The bounds are
/// a collaborator constraint, not an engine invariant; tests run with
/// [`PacingPolicy::none`].
#[derive(Debug, Clone, Copy)]
pub struct PacingPolicy {
    pub item_delay_min: Duration,
    pub item_delay_max: Duration,
    pub batch_pause: Duration,
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self {
            item_delay_min: Duration::from_secs(2),
            item_delay_max: Duration::from_secs(4),
            batch_pause: Duration::from_secs(30),
        }
    }
}

impl PacingPolicy {
    pub fn none() -> Self {
        Self {
            item_delay_min: Duration::ZERO,
            item_delay_max: Duration::ZERO,
            batch_pause: Duration::ZERO,
        }
    }

    /// Randomized delay inside the configured window, so call timing does
    /// not look mechanical to the external service.
    pub fn item_delay(&self) -> Duration {
        if self.item_delay_max <= self.item_delay_min {
            return self.item_delay_min;
        }
        let span = (self.item_delay_max - self.item_delay_min).as_millis() as u64;
        self.item_delay_min + Duration::from_millis(rand::thread_rng().gen_range(0..=span))
    }
}

/// Cooperative cancellation signal, checked between item-level operations.
/// A pending resolver call completes (or times out) before cancellation
/// takes effect at the next safe point.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Run-scoped counts; reconstructed every run, never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionCounters {
    pub processed: usize,
    pub matched: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub counters: SessionCounters,
    pub chunks_completed: usize,
    pub checkpoints: usize,
    pub checkpoint_failures: usize,
    pub inserted: usize,
    pub cancelled: bool,
    pub catalog_size: usize,
}

/// Configuration for one reconciliation pass.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub batch_size: usize,
    pub checkpoint_every: usize,
    /// Work bound consulted by [`reconcile`] when selecting the slice for
    /// this pass. [`BatchScheduler::run`] processes whatever work it is
    /// handed and does not re-apply it.
    pub limit: RunLimit,
    pub resolver_timeout: Duration,
    pub pacing: PacingPolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            checkpoint_every: 5,
            limit: RunLimit::Quick,
            resolver_timeout: Duration::from_secs(20),
            pacing: PacingPolicy::default(),
        }
    }
}

/// Candidates still needing resolution: eligible under the window and whose
/// trimmed name is not yet committed, in original dataset order.
///
/// This subtraction is the sole resume mechanism; there is no persisted
/// cursor. Resume identity is the trimmed name while storage identity is the
/// URL, so two candidates sharing a name are attempted once but two URLs for
/// differently-spelled names of one person can both be stored.
pub fn remaining_work<'a>(
    candidates: &'a [CandidateRecord],
    window: &EligibilityWindow,
    committed_names: &HashSet<String>,
) -> Vec<&'a CandidateRecord> {
    candidates
        .iter()
        .filter(|c| window.admits(&c.graduation_date))
        .filter(|c| !committed_names.contains(canonical_name(&c.name)))
        .collect()
}

/// First `limit` remaining candidates; returns fewer (including zero) when
/// less work is available.
pub fn select_work<'a>(
    candidates: &'a [CandidateRecord],
    window: &EligibilityWindow,
    committed_names: &HashSet<String>,
    limit: usize,
) -> Vec<&'a CandidateRecord> {
    remaining_work(candidates, window, committed_names)
        .into_iter()
        .take(limit)
        .collect()
}

/// Drives chunked, checkpointed execution of selected work against the
/// resolver.
#[derive(Debug, Clone)]
pub struct BatchScheduler {
    config: RunConfig,
}

impl BatchScheduler {
    pub fn new(config: RunConfig) -> Self {
        Self { config }
    }

    /// Process `work` in chunks of `batch_size`, flushing accumulated
    /// matches into the store after every `checkpoint_every`-th chunk and
    /// unconditionally after the final one. Resolver misses, errors, and
    /// timeouts are terminal unmatched outcomes for this run. Store write
    /// failures are reported and counted but never abort the run.
    pub async fn run(
        &self,
        work: &[&CandidateRecord],
        store: &mut MasterStore,
        backend: &dyn SnapshotBackend,
        resolver: &dyn ProfileResolver,
        cancel: &CancelFlag,
    ) -> RunSummary {
        let started_at = Utc::now();
        let batch_size = self.config.batch_size.max(1);
        let checkpoint_every = self.config.checkpoint_every.max(1);
        let total_chunks = work.chunks(batch_size).len();

        let mut counters = SessionCounters::default();
        // Matches from fully completed chunks that have not been flushed yet.
        let mut pending: Vec<ResolvedCandidate> = Vec::new();
        let mut inserted = 0usize;
        let mut checkpoints = 0usize;
        let mut checkpoint_failures = 0usize;
        let mut chunks_completed = 0usize;
        let mut cancelled = false;

        for (index, chunk) in work.chunks(batch_size).enumerate() {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            info!(
                chunk = index + 1,
                total_chunks,
                size = chunk.len(),
                "processing chunk"
            );

            let mut chunk_matches: Vec<ResolvedCandidate> = Vec::new();
            let mut interrupted = false;
            for (pos, candidate) in chunk.iter().copied().enumerate() {
                if cancel.is_cancelled() {
                    interrupted = true;
                    break;
                }
                let name = canonical_name(&candidate.name);
                if name.is_empty() || store.committed_names().contains(name) {
                    counters.skipped += 1;
                    continue;
                }

                let url = self.resolve_one(resolver, name, &candidate.affiliation).await;
                counters.processed += 1;
                if let Some(url) = url {
                    counters.matched += 1;
                    chunk_matches.push(ResolvedCandidate {
                        candidate: candidate.clone(),
                        profile_url: Some(url),
                        resolved_at: Utc::now(),
                    });
                }

                if pos + 1 < chunk.len() {
                    sleep(self.config.pacing.item_delay()).await;
                }
            }

            if interrupted {
                cancelled = true;
                debug!(
                    chunk = index + 1,
                    dropped = chunk_matches.len(),
                    "chunk interrupted mid-execution; its matches stay uncommitted"
                );
                break;
            }

            pending.extend(chunk_matches);
            chunks_completed += 1;

            let last = index + 1 == total_chunks;
            if (index + 1) % checkpoint_every == 0 || last {
                let (added, ok) = flush_pending(store, backend, &mut pending).await;
                inserted += added;
                if ok {
                    checkpoints += 1;
                } else {
                    checkpoint_failures += 1;
                }
            }

            if !last {
                if cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
                sleep(self.config.pacing.batch_pause).await;
            }
        }

        // Cancellation path: commit whatever completed chunks produced.
        if !pending.is_empty() {
            let (added, ok) = flush_pending(store, backend, &mut pending).await;
            inserted += added;
            if ok {
                checkpoints += 1;
            } else {
                checkpoint_failures += 1;
            }
        }

        RunSummary {
            started_at,
            finished_at: Utc::now(),
            counters,
            chunks_completed,
            checkpoints,
            checkpoint_failures,
            inserted,
            cancelled,
            catalog_size: store.len(),
        }
    }

    async fn resolve_one(
        &self,
        resolver: &dyn ProfileResolver,
        name: &str,
        affiliation: &str,
    ) -> Option<String> {
        match timeout(self.config.resolver_timeout, resolver.resolve(name, affiliation)).await {
            Ok(Ok(url)) => url.filter(|u| !u.is_empty()),
            Ok(Err(err)) => {
                debug!(name, error = %err, "resolver failed; treated as unmatched");
                None
            }
            Err(_) => {
                debug!(name, "resolver timed out; treated as unmatched");
                None
            }
        }
    }
}

async fn flush_pending(
    store: &mut MasterStore,
    backend: &dyn SnapshotBackend,
    pending: &mut Vec<ResolvedCandidate>,
) -> (usize, bool) {
    let inserted = store.merge(pending);
    pending.clear();
    match store.persist(backend).await {
        Ok(()) => {
            info!(inserted, catalog = store.len(), "checkpointed master catalog");
            (inserted, true)
        }
        Err(err) => {
            warn!(error = %err, "checkpoint write failed; in-memory catalog retained for a later attempt");
            (inserted, false)
        }
    }
}

/// One full reconciliation pass: load the catalog, select the remaining
/// work under the run limit, and schedule it.
pub async fn reconcile(
    candidates: &[CandidateRecord],
    backend: &dyn SnapshotBackend,
    resolver: &dyn ProfileResolver,
    config: RunConfig,
    window: EligibilityWindow,
    cancel: &CancelFlag,
) -> RunSummary {
    let mut store = MasterStore::load(backend, window).await;
    let committed = store.committed_names().clone();
    let remaining = remaining_work(candidates, &window, &committed);
    let remaining_len = remaining.len();
    let bound = config.limit.effective(remaining_len);
    let work: Vec<&CandidateRecord> = remaining.into_iter().take(bound).collect();
    info!(
        dataset = candidates.len(),
        remaining = remaining_len,
        selected = work.len(),
        "selected work for this run"
    );

    BatchScheduler::new(config)
        .run(&work, &mut store, backend, resolver, cancel)
        .await
}

/// Human-readable progress of the catalog against the full dataset.
pub fn progress_report(dataset_total: usize, store: &MasterStore) -> String {
    let committed = store.len();
    let percent = if dataset_total > 0 {
        committed as f64 / dataset_total as f64 * 100.0
    } else {
        0.0
    };

    let mut lines = vec![
        "# Reconciliation Progress".to_string(),
        String::new(),
        format!("- dataset records: {dataset_total}"),
        format!("- committed profiles: {committed} ({percent:.1}%)"),
        format!(
            "- not yet committed: {}",
            dataset_total.saturating_sub(committed)
        ),
    ];

    if !store.is_empty() {
        lines.push(String::new());
        lines.push("## Recently committed".to_string());
        let start = store.len().saturating_sub(10);
        for record in &store.records()[start..] {
            lines.push(format!(
                "- {} -> {} (updated {})",
                record.name,
                record.profile_url,
                record.last_updated.format("%Y-%m-%d %H:%M:%S")
            ));
        }
    }

    lines.join("\n")
}
