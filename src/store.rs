//! Storage backends and the patch store registry.
//!
//! A backend contributes three small pieces: a [`LogIndex`] holding the
//! durable index records, a [`PatchStorage`] holding the patch bodies, and
//! a [`LogLock`] for cross-process append exclusion. The chain-validation
//! and version-assignment logic lives in [`PatchLog`](crate::PatchLog) and
//! is shared by every backend.
//!
//! A [`PatchStore`] manages the lifecycle of the logs of one backend:
//! create, attach (recover), list, and retire.

use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    ids::PatchId,
    log::PatchLog,
    patch::{DecodeError, LogEntry, Patch},
};

pub mod fs;
pub mod memory;

/// Identity of the dataset a patch log belongs to.
///
/// Provided by the surrounding server when a log is created; stored
/// alongside the log and reported back from
/// [`info`](crate::PatchLog::info) and [`PatchStore::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDesc {
    /// Stable identifier of the dataset.
    pub id: PatchId,
    /// Short name, used to address the log within a store.
    pub name: String,
    /// Optional URI describing the dataset.
    pub uri: Option<String>,
}

impl DatasetDesc {
    /// Create a description.
    pub fn new(id: PatchId, name: impl Into<String>, uri: Option<String>) -> Self {
        DatasetDesc {
            id,
            name: name.into(),
            uri,
        }
    }
}

impl fmt::Display for DatasetDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {}]", self.name, self.id)
    }
}

/// Errors from the storage layer of a backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// A stored record could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// Stored data is inconsistent with the log index.
    #[error("corrupt log storage: {0}")]
    Corrupt(String),
    /// The coordination service failed the operation.
    #[error("coordination service: {0}")]
    Coordination(String),
    /// Non-retryable failure. The node must stop serving this log rather
    /// than risk acting on stale state.
    #[error("fatal: {0}")]
    Fatal(String),
    /// Any other backend failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The durable head as reported by [`LogIndex::refresh`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexHead {
    /// The backend has no shared view; the in-memory index is
    /// authoritative for as long as the process owns the log.
    Local,
    /// The durable head record, `None` while the shared log has no
    /// commits.
    Shared(Option<LogEntry>),
}

/// Durable index records of a patch log.
pub trait LogIndex: fmt::Debug + Send + Sync + 'static {
    /// Durably record a committed entry.
    ///
    /// Called with the append lock held, after the patch body has been
    /// persisted by [`PatchStorage::put`].
    fn save(&self, entry: &LogEntry) -> Result<(), StorageError>;

    /// All committed entries in ascending version order, for rebuilding
    /// the in-memory index on attach.
    fn scan(&self) -> Result<Vec<LogEntry>, StorageError>;

    /// The current durable head, for indexes shared between processes.
    ///
    /// Single-process backends keep the default and return
    /// [`IndexHead::Local`].
    fn refresh(&self) -> Result<IndexHead, StorageError> {
        Ok(IndexHead::Local)
    }
}

/// Blob storage for patch bodies, keyed by the committed entry.
pub trait PatchStorage: fmt::Debug + Send + Sync + 'static {
    /// Durably persist a patch under the entry's version and id.
    ///
    /// The write must be atomic: after a crash the patch is either fully
    /// readable or absent, never partial.
    fn put(&self, entry: &LogEntry, patch: &Patch) -> Result<(), StorageError>;

    /// Fetch the stored patch, byte-identical to what was persisted.
    fn get(&self, entry: &LogEntry) -> Result<Option<Patch>, StorageError>;

    /// Remove a stored patch. Used by store-level retire and by the
    /// append path only to undo a persisted body whose index record could
    /// not be written.
    fn delete(&self, entry: &LogEntry) -> Result<(), StorageError>;
}

/// Cross-process mutual exclusion for appends.
///
/// The append logic is identical for all backends; only the lock changes.
/// Single-process backends use [`NullLock`] and rely on the process-local
/// append mutex alone.
pub trait LogLock: fmt::Debug + Send + Sync + 'static {
    /// Block until this process holds the append lock. The returned guard
    /// releases on drop.
    fn acquire(&self) -> Result<LockGuard, StorageError>;
}

/// Holds an acquired [`LogLock`] until dropped or explicitly released.
pub struct LockGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    /// A guard over nothing, for [`NullLock`].
    pub fn noop() -> Self {
        LockGuard { release: None }
    }

    /// A guard running `release` when dropped.
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        LockGuard {
            release: Some(Box::new(release)),
        }
    }

    /// Release the lock now.
    pub fn release(self) {}
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").finish_non_exhaustive()
    }
}

/// Lock for backends owned by a single process.
///
/// The owning process's append mutex is the only serialization; sharing
/// such a log between processes is a documented precondition violation,
/// not something the backend detects.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLock;

impl LogLock for NullLock {
    fn acquire(&self) -> Result<LockGuard, StorageError> {
        Ok(LockGuard::noop())
    }
}

/// Errors from [`PatchStore`] lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A log with this name already exists in durable storage, live or
    /// retired.
    #[error("log {0:?} already exists")]
    AlreadyExists(String),
    /// No such log in this store.
    #[error("log {0:?} not found")]
    NotFound(String),
    /// The log exists but has been retired.
    #[error("log {0:?} is retired")]
    Retired(String),
    /// The name cannot be used to address a log.
    #[error("invalid log name {0:?}")]
    InvalidName(String),
    /// The backend failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Lifecycle manager for the patch logs of one backend.
///
/// A store owns at most one live [`PatchLog`] instance per dataset within
/// the process; [`attach`](PatchStore::attach) hands out the existing
/// instance instead of opening a second one, which is what makes the
/// process-local append mutex sufficient for single-process backends.
pub trait PatchStore: fmt::Debug + Send + Sync + 'static {
    /// Create a new, empty log.
    ///
    /// Fails with [`StoreError::AlreadyExists`] if a log with this name
    /// exists in durable storage — even retired, and even if it was
    /// created by a process that has since restarted.
    fn create(&self, desc: &DatasetDesc) -> Result<PatchLog, StoreError>;

    /// Attach to an existing log, recovering its index from what is
    /// actually durable.
    fn attach(&self, name: &str) -> Result<PatchLog, StoreError>;

    /// The live log instance for the given dataset id, if this process
    /// holds one.
    fn get(&self, id: &PatchId) -> Option<PatchLog>;

    /// Descriptions of all non-retired logs in this store.
    fn list(&self) -> Result<Vec<DatasetDesc>, StoreError>;

    /// Release the live instance and mark the log retired in durable
    /// storage. Patch bodies are kept; the name can never be reused.
    fn retire(&self, id: &PatchId) -> Result<(), StoreError>;
}

/// Registry of configured patch stores, keyed by name.
///
/// Explicitly constructed and passed by reference; independent instances
/// share no state, so tests can run several side by side.
#[derive(Debug, Default)]
pub struct StoreRegistry {
    stores: RwLock<HashMap<String, Arc<dyn PatchStore>>>,
}

impl StoreRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a store under a name, replacing any previous entry.
    pub fn register(&self, name: impl Into<String>, store: Arc<dyn PatchStore>) {
        self.stores.write().insert(name.into(), store);
    }

    /// Look up a store by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn PatchStore>> {
        self.stores.read().get(name).cloned()
    }

    /// Remove a store from the registry. Does not touch durable data.
    pub fn deregister(&self, name: &str) -> Option<Arc<dyn PatchStore>> {
        self.stores.write().remove(name)
    }

    /// The names of all registered stores.
    pub fn names(&self) -> Vec<String> {
        self.stores.read().keys().cloned().collect()
    }
}

/// Check that a log name is usable as a storage key.
pub(crate) fn ensure_valid_name(name: &str) -> Result<(), StoreError> {
    let ok = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !name.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_valid_names() {
        for name in ["data", "ds-1", "a.b_c", "X9"] {
            assert!(ensure_valid_name(name).is_ok(), "{name}");
        }
        for name in ["", ".hidden", "a/b", "a b", "ü", &"x".repeat(129)] {
            assert!(ensure_valid_name(name).is_err(), "{name:?}");
        }
    }

    #[test]
    fn test_registry_instances_are_independent() {
        let a = StoreRegistry::new();
        let b = StoreRegistry::new();
        a.register("mem", Arc::new(memory::MemStore::new()));
        assert!(a.get("mem").is_some());
        assert!(b.get("mem").is_none());
        assert_eq!(a.names(), vec!["mem".to_string()]);
        assert!(a.deregister("mem").is_some());
        assert!(a.get("mem").is_none());
    }
}
