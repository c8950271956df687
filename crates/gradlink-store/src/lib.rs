//! Persistent master catalog: load, merge, compact, persist.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use gradlink_core::{
    allocate_profile_id, canonical_name, EligibilityWindow, MasterRecord, ResolvedCandidate,
};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gradlink-store";

/// Snapshot persistence seam. File-backed in production, in-memory in tests,
/// always injected explicitly so nothing in the catalog touches ambient
/// working-directory state.
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    /// Returns `None` when no snapshot exists yet; that is not an error.
    async fn read(&self) -> Result<Option<String>>;
    async fn write(&self, contents: &str) -> Result<()>;
}

/// Whole-file snapshot on disk, written via temp file + atomic rename so an
/// interrupted write never leaves a truncated catalog behind.
#[derive(Debug, Clone)]
pub struct FileSnapshot {
    path: PathBuf,
}

impl FileSnapshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SnapshotBackend for FileSnapshot {
    async fn read(&self) -> Result<Option<String>> {
        if !fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking snapshot path {}", self.path.display()))?
        {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading snapshot {}", self.path.display()))?;
        Ok(Some(text))
    }

    async fn write(&self, contents: &str) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating snapshot directory {}", parent.display()))?;
        }

        let temp_name = format!(".{}.tmp", Uuid::new_v4());
        let temp_path = match self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => parent.join(&temp_name),
            None => PathBuf::from(&temp_name),
        };

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot {}", temp_path.display()))?;
        file.write_all(contents.as_bytes())
            .await
            .with_context(|| format!("writing temp snapshot {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp snapshot {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }
        Ok(())
    }
}

/// In-memory snapshot for tests; tracks how many writes happened so
/// checkpoint behavior can be asserted.
#[derive(Debug, Default)]
pub struct MemorySnapshot {
    contents: Mutex<Option<String>>,
    writes: AtomicUsize,
}

impl MemorySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(contents: impl Into<String>) -> Self {
        Self {
            contents: Mutex::new(Some(contents.into())),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn contents(&self) -> Option<String> {
        self.contents.lock().expect("snapshot mutex poisoned").clone()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotBackend for MemorySnapshot {
    async fn read(&self) -> Result<Option<String>> {
        Ok(self.contents.lock().expect("snapshot mutex poisoned").clone())
    }

    async fn write(&self, contents: &str) -> Result<()> {
        *self.contents.lock().expect("snapshot mutex poisoned") = Some(contents.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// The persistent, deduplicated, eligibility-pruned catalog of committed
/// matches. Single-writer per run; load -> merge -> persist happens entirely
/// in-process.
#[derive(Debug)]
pub struct MasterStore {
    records: Vec<MasterRecord>,
    urls: HashSet<String>,
    ids: HashSet<String>,
    names: HashSet<String>,
    window: EligibilityWindow,
}

impl MasterStore {
    pub fn empty(window: EligibilityWindow) -> Self {
        Self {
            records: Vec::new(),
            urls: HashSet::new(),
            ids: HashSet::new(),
            names: HashSet::new(),
            window,
        }
    }

    /// Load a snapshot, dropping records that have aged out of the window.
    ///
    /// Infallible by design: an absent snapshot is an empty store, and an
    /// unreadable or corrupt one is recovered as empty with a visible
    /// warning, since that default risks discarding prior progress. If
    /// compaction dropped anything the snapshot is rewritten immediately so
    /// the on-disk file only ever holds currently-eligible records.
    pub async fn load(backend: &dyn SnapshotBackend, window: EligibilityWindow) -> Self {
        let raw = match backend.read().await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %err, "unreadable master snapshot; starting from an empty catalog");
                None
            }
        };

        let loaded: Vec<MasterRecord> = match raw {
            None => Vec::new(),
            Some(text) => match serde_json::from_str(&text) {
                Ok(records) => records,
                Err(err) => {
                    warn!(error = %err, "corrupt master snapshot; starting from an empty catalog");
                    Vec::new()
                }
            },
        };

        let total = loaded.len();
        let mut store = Self::empty(window);
        for record in loaded {
            if !window.admits(&record.graduation_date) {
                continue;
            }
            store.urls.insert(record.profile_url.clone());
            store.ids.insert(record.id.clone());
            store.names.insert(canonical_name(&record.name).to_string());
            store.records.push(record);
        }

        let dropped = total - store.records.len();
        if dropped > 0 {
            info!(dropped, kept = store.records.len(), "compacted stale records out of the catalog");
            if let Err(err) = store.persist(backend).await {
                warn!(error = %err, "failed to rewrite compacted snapshot; will retry at next checkpoint");
            }
        }
        store
    }

    /// Merge newly resolved candidates, in input order. An item is inserted
    /// only when it carries a non-empty URL not already in the catalog and
    /// its qualifying date passes the window; everything else is an expected
    /// steady-state skip, not an error. Returns the inserted count.
    pub fn merge(&mut self, resolved: &[ResolvedCandidate]) -> usize {
        let mut inserted = 0;
        for item in resolved {
            let Some(url) = item.profile_url.as_deref().filter(|url| !url.is_empty()) else {
                continue;
            };
            if self.urls.contains(url) {
                continue;
            }
            if !self.window.admits(&item.candidate.graduation_date) {
                continue;
            }

            let id = allocate_profile_id(&self.ids);
            self.ids.insert(id.clone());
            self.urls.insert(url.to_string());
            self.names
                .insert(canonical_name(&item.candidate.name).to_string());
            self.records.push(MasterRecord {
                id,
                name: item.candidate.name.clone(),
                course: item.candidate.course.clone(),
                affiliation: item.candidate.affiliation.clone(),
                graduation_date: item.candidate.graduation_date.clone(),
                profile_url: url.to_string(),
                last_updated: Utc::now(),
            });
            inserted += 1;
        }
        inserted
    }

    /// Serialize the full ordered record list. On failure the in-memory
    /// state is untouched and the error is returned for the caller to
    /// report; a later persist can still succeed.
    pub async fn persist(&self, backend: &dyn SnapshotBackend) -> Result<()> {
        let text =
            serde_json::to_string_pretty(&self.records).context("serializing master catalog")?;
        backend.write(&text).await.context("writing master snapshot")
    }

    pub fn records(&self) -> &[MasterRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains_url(&self, url: &str) -> bool {
        self.urls.contains(url)
    }

    /// Trimmed-name index used by the work selector to subtract committed
    /// identities from the dataset.
    pub fn committed_names(&self) -> &HashSet<String> {
        &self.names
    }

    pub fn window(&self) -> EligibilityWindow {
        self.window
    }
}
