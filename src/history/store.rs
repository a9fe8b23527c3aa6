// src/history/store.rs
//
// The history store: a write-through cache over one JSON file per
// (thing, program) pair. Appends are serialised per file; different files
// proceed in parallel.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::error;

use crate::registry::CycleRegistry;

use super::{History, HistoryCycle, PhaseError};

/// How many cycles a history file keeps. A longer history is more robust
/// for statistical evaluation, a shorter one reacts faster to changes in
/// the program behavior.
pub const MAX_HISTORY_LENGTH: usize = 10;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("history encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("no history found for thing {thing}")]
    NotFound { thing: String },
    #[error("phase validity check failed: {0}")]
    InvalidPhases(#[from] PhaseError),
}

pub struct HistoryStore {
    static_path: PathBuf,
    registry: Arc<CycleRegistry>,
    /// The current histories by their file path.
    cache: DashMap<PathBuf, History>,
    /// Per-file locks serialising reads and writes of the same file.
    file_locks: DashMap<PathBuf, Arc<Mutex<()>>>,
    /// Guards the single index file.
    pub(super) index_lock: Mutex<()>,
}

impl HistoryStore {
    pub fn new(static_path: impl Into<PathBuf>, registry: Arc<CycleRegistry>) -> Self {
        HistoryStore {
            static_path: static_path.into(),
            registry,
            cache: DashMap::new(),
            file_locks: DashMap::new(),
            index_lock: Mutex::new(()),
        }
    }

    pub(super) fn static_path(&self) -> &Path {
        &self.static_path
    }

    /// The history file for a thing, program-specific when a program is
    /// given.
    pub fn history_path(&self, thing: &str, program: Option<u8>) -> PathBuf {
        let file = match program {
            Some(program) => format!("{thing}-P{program}.json"),
            None => format!("{thing}.json"),
        };
        self.static_path.join("history").join(file)
    }

    fn file_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        self.file_locks
            .entry(path.to_path_buf())
            .or_default()
            .clone()
    }

    /// Append a cycle to the history at `path`, bounded to
    /// [`MAX_HISTORY_LENGTH`], and write the file through. The whole
    /// load-append-write sequence holds the file lock so concurrent appends
    /// to the same path cannot lose cycles. The cache is only updated after
    /// a successful write, so a failed write is retried with the same
    /// content on the next append.
    pub async fn append(&self, path: &Path, cycle: HistoryCycle) -> Result<History, HistoryError> {
        let lock = self.file_lock(path);
        let _guard = lock.lock().await;

        let mut history = self
            .cache
            .get(path)
            .map(|cached| cached.clone())
            .unwrap_or_default();
        history.cycles.push(cycle);
        if history.cycles.len() > MAX_HISTORY_LENGTH {
            let excess = history.cycles.len() - MAX_HISTORY_LENGTH;
            history.cycles.drain(..excess);
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec(&history)?;
        if let Err(err) = tokio::fs::write(path, &json).await {
            error!("Could not write history file {}: {err}", path.display());
            return Err(err.into());
        }

        self.cache.insert(path.to_path_buf(), history.clone());
        Ok(history)
    }

    /// Load a history from the cache, falling back to the file.
    pub async fn load(&self, path: &Path) -> Result<History, HistoryError> {
        if let Some(cached) = self.cache.get(path) {
            return Ok(cached.clone());
        }
        let lock = self.file_lock(path);
        let _guard = lock.lock().await;
        let bytes = tokio::fs::read(path).await?;
        let history: History = serde_json::from_slice(&bytes)?;
        self.cache.insert(path.to_path_buf(), history.clone());
        Ok(history)
    }

    /// Load the best fitting history for a thing: the one for the program
    /// currently reported on its `signal_program` stream, falling back to
    /// the unspecific history. Returns the history together with the
    /// program of the branch that succeeded.
    pub async fn load_best(&self, thing: &str) -> Result<(History, Option<u8>), HistoryError> {
        let mut programs: Vec<Option<u8>> = Vec::with_capacity(2);
        if let Some(observation) = self.registry.current_program(thing) {
            programs.push(Some(observation.result));
        }
        programs.push(None);

        for program in programs {
            let path = self.history_path(thing, program);
            if let Ok(history) = self.load(&path).await {
                return Ok((history, program));
            }
        }
        Err(HistoryError::NotFound {
            thing: thing.to_string(),
        })
    }

    /// Visit every cached (path, history) pair.
    pub(super) fn for_each_cached(&self, mut visit: impl FnMut(&Path, &History)) {
        for entry in self.cache.iter() {
            visit(entry.key(), entry.value());
        }
    }
}
