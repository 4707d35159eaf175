use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lablens_common::{LabLensError, PipelineError, RebuildPolicy, Result, StorageConfig};

use crate::aggregate::{rebuild_aggregates, DerivedViews};
use crate::fact::{FactSnapshot, FactSource, ParquetFactSource};
use crate::reader::write_parquet_atomic;

const CURRENT_FILE: &str = "CURRENT";
const LOCK_FILE: &str = "LOCK";
const GENERATION_PREFIX: &str = "gen-";
const LOCK_POLL: Duration = Duration::from_millis(25);

/// One published generation: a fact snapshot and the views derived from it.
#[derive(Debug)]
pub struct Published {
    pub generation: u64,
    pub fingerprint: u64,
    pub snapshot: FactSnapshot,
    pub views: DerivedViews,
    pub published_at: DateTime<Utc>,
    /// directory holding this generation's parquet files, when persisted
    pub location: Option<PathBuf>,
}

impl Published {
    fn empty() -> Self {
        Self {
            generation: 0,
            fingerprint: FactSnapshot::default().fingerprint(),
            snapshot: FactSnapshot::default(),
            views: DerivedViews::default(),
            published_at: Utc::now(),
            location: None,
        }
    }
}

/// Serves the current generation to readers and runs rebuilds one at a time.
///
/// Readers take an `Arc` to the published generation and keep it for as long as
/// they like; a rebuild builds the next generation off to the side and swaps the
/// pointer only once it is complete. A failed rebuild leaves the old one in place.
pub struct ViewStore {
    current: RwLock<Arc<Published>>,
    rebuild_lock: Mutex<()>,
    policy: RebuildPolicy,
    storage: Option<StorageConfig>,
}

impl ViewStore {
    pub fn in_memory(policy: RebuildPolicy) -> Self {
        Self {
            current: RwLock::new(Arc::new(Published::empty())),
            rebuild_lock: Mutex::new(()),
            policy,
            storage: None,
        }
    }

    /// Store that also writes every generation under `storage.data_dir`.
    pub fn persistent(storage: StorageConfig, policy: RebuildPolicy) -> Self {
        Self { storage: Some(storage), ..Self::in_memory(policy) }
    }

    /// Open a persistent store and republish the last generation found on disk, if any.
    pub fn open(storage: StorageConfig, policy: RebuildPolicy, batch_size: usize) -> Result<Self> {
        let store = Self::persistent(storage.clone(), policy);
        let Some((generation, dir)) = read_current(&storage.data_dir())? else {
            tracing::debug!(dir = %storage.data_dir, "no published generation on disk");
            return Ok(store);
        };
        let results = dir.join(&storage.results_file);
        let source = ParquetFactSource::new(results.to_string_lossy(), batch_size);
        let snapshot = source.load()?;
        let views = rebuild_aggregates(&snapshot)?;
        let published = Published {
            generation,
            fingerprint: snapshot.fingerprint(),
            snapshot,
            views,
            published_at: Utc::now(),
            location: Some(dir),
        };
        tracing::info!(generation, rows = published.snapshot.len(), "reopened published generation");
        *store.write_current() = Arc::new(published);
        Ok(store)
    }

    pub fn policy(&self) -> RebuildPolicy {
        self.policy
    }

    /// The generation readers should use right now.
    pub fn current(&self) -> Arc<Published> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Load a fresh snapshot from `source`, derive its views and publish them.
    ///
    /// A persistent store also holds the `LOCK` file in its data directory for the
    /// whole rebuild, so stores in other processes sharing that directory take turns
    /// under the same policy.
    pub fn rebuild(&self, source: &dyn FactSource) -> Result<Arc<Published>> {
        let _guard = self.acquire()?;
        let _dir_lock = match &self.storage {
            Some(storage) => Some(DirLock::acquire(&storage.data_dir(), self.policy)?),
            None => None,
        };
        let previous = self.current();
        // another process may have published since this store last looked
        let on_disk = match &self.storage {
            Some(storage) => read_current(&storage.data_dir())?.map_or(0, |(g, _)| g),
            None => 0,
        };
        let generation = previous.generation.max(on_disk) + 1;
        tracing::info!(generation, "rebuild started");

        let snapshot = source.load().map_err(as_pipeline_error)?;
        let views = rebuild_aggregates(&snapshot)?;
        let fingerprint = snapshot.fingerprint();
        if fingerprint == previous.fingerprint {
            tracing::debug!(generation, "snapshot content unchanged");
        }

        let location = match &self.storage {
            Some(storage) => Some(persist(storage, generation, &snapshot, &views).map_err(as_pipeline_error)?),
            None => None,
        };
        let published = Arc::new(Published {
            generation,
            fingerprint,
            snapshot,
            views,
            published_at: Utc::now(),
            location,
        });
        *self.write_current() = published.clone();

        if let Some(storage) = &self.storage {
            prune_generations(&storage.data_dir(), generation);
        }
        tracing::info!(
            generation,
            rows = published.snapshot.len(),
            panels = published.views.panels().len(),
            repeats = published.views.repeats().len(),
            "rebuild published"
        );
        Ok(published)
    }

    fn acquire(&self) -> Result<MutexGuard<'_, ()>> {
        match self.policy {
            RebuildPolicy::Queue => Ok(self.rebuild_lock.lock().unwrap_or_else(|e| e.into_inner())),
            RebuildPolicy::Reject => match self.rebuild_lock.try_lock() {
                Ok(guard) => Ok(guard),
                Err(TryLockError::Poisoned(e)) => Ok(e.into_inner()),
                Err(TryLockError::WouldBlock) => {
                    tracing::warn!("rebuild rejected: another rebuild is running");
                    Err(PipelineError::RebuildInProgress.into())
                }
            },
        }
    }

    fn write_current(&self) -> std::sync::RwLockWriteGuard<'_, Arc<Published>> {
        self.current.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Exclusive hold on a data directory's `LOCK` file; released on drop.
struct DirLock {
    path: PathBuf,
}

impl DirLock {
    fn acquire(data_dir: &Path, policy: RebuildPolicy) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(LOCK_FILE);
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut f) => {
                    writeln!(f, "{}", std::process::id())?;
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => match policy {
                    RebuildPolicy::Reject => {
                        tracing::warn!(lock = %path.display(), "rebuild rejected: data directory is locked");
                        return Err(PipelineError::RebuildInProgress.into());
                    }
                    RebuildPolicy::Queue => std::thread::sleep(LOCK_POLL),
                },
                Err(e) => return Err(PipelineError::Storage(format!("{}: {e}", path.display())).into()),
            }
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(lock = %self.path.display(), error = %e, "could not release lock");
        }
    }
}

// anything that goes wrong during a rebuild surfaces as a pipeline failure
fn as_pipeline_error(e: LabLensError) -> LabLensError {
    match e {
        LabLensError::Pipeline(_) => e,
        other => PipelineError::SnapshotUnavailable(other.to_string()).into(),
    }
}

fn generation_dir(data_dir: &Path, generation: u64) -> PathBuf {
    data_dir.join(format!("{GENERATION_PREFIX}{generation:06}"))
}

/// Write the three tables of one generation, then flip `CURRENT` to point at it.
fn persist(storage: &StorageConfig, generation: u64, snapshot: &FactSnapshot, views: &DerivedViews) -> Result<PathBuf> {
    let data_dir = storage.data_dir();
    let dir = generation_dir(&data_dir, generation);
    write_parquet_atomic(&dir.join(&storage.results_file), &snapshot.to_record_batch()?)?;
    write_parquet_atomic(&dir.join(&storage.panels_file), &views.panels_batch()?)?;
    write_parquet_atomic(&dir.join(&storage.repeats_file), &views.repeats_batch()?)?;
    write_current(&data_dir, generation)?;
    tracing::debug!(dir = %dir.display(), "generation persisted");
    Ok(dir)
}

// keeps `current` and the one before it, for readers that resolved CURRENT just before the flip
fn prune_generations(data_dir: &Path, current: u64) {
    let Ok(entries) = std::fs::read_dir(data_dir) else { return };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(n) = name.to_str().and_then(|n| n.strip_prefix(GENERATION_PREFIX)).and_then(|n| n.parse::<u64>().ok()) else {
            continue;
        };
        if n + 1 < current {
            if let Err(e) = std::fs::remove_dir_all(entry.path()) {
                tracing::warn!(dir = %entry.path().display(), error = %e, "could not remove superseded generation");
            }
        }
    }
}

fn write_current(data_dir: &Path, generation: u64) -> Result<()> {
    std::fs::create_dir_all(data_dir)?;
    let mut tmp = tempfile::Builder::new().prefix(".current-").tempfile_in(data_dir)?;
    writeln!(tmp, "{generation}")?;
    tmp.as_file().sync_all()?;
    let target = data_dir.join(CURRENT_FILE);
    tmp.persist(&target)
        .map_err(|e| PipelineError::Storage(format!("{}: {}", target.display(), e.error)))?;
    Ok(())
}

/// Generation number and directory named by `CURRENT`, if one was ever published.
pub fn read_current(data_dir: &Path) -> Result<Option<(u64, PathBuf)>> {
    let path = data_dir.join(CURRENT_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path)?;
    let generation: u64 = text
        .trim()
        .parse()
        .map_err(|_| PipelineError::Storage(format!("{}: not a generation number: {:?}", path.display(), text.trim())))?;
    Ok(Some((generation, generation_dir(data_dir, generation))))
}
