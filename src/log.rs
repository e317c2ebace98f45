//! The patch log state machine.

use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    ids::{PatchId, Version},
    patch::{LogEntry, Patch},
    store::{DatasetDesc, IndexHead, LogIndex, LogLock, PatchStorage, StorageError},
};

/// Errors from [`PatchLog::append`].
#[derive(Debug, thiserror::Error)]
pub enum AppendError {
    /// The log is empty but the patch carries a `previous` pointer.
    #[error("patch {id}: log is empty but the patch has a previous pointer")]
    UnexpectedPrevious {
        /// Id of the rejected patch.
        id: PatchId,
    },
    /// The patch does not name the current head as its `previous`.
    ///
    /// The caller must refetch the head and resend with the correct
    /// pointer; the log is unchanged.
    #[error("patch {id}: previous {previous:?} does not match the log head {head:?}")]
    HeadMismatch {
        /// Id of the rejected patch.
        id: PatchId,
        /// The `previous` pointer the patch carried.
        previous: Option<PatchId>,
        /// The actual head of the log.
        head: Option<PatchId>,
    },
    /// A patch with this id is already in the log.
    #[error("patch {id} is already in the log")]
    Duplicate {
        /// Id of the rejected patch.
        id: PatchId,
    },
    /// The log has been released.
    #[error("log is no longer available")]
    NotAvailable,
    /// The backend failed while persisting the patch. Nothing was
    /// committed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors from read operations on a [`PatchLog`].
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// The log has been released.
    #[error("log is no longer available")]
    NotAvailable,
    /// A range bound lies outside the retained versions.
    #[error("range [{start}, {end}] outside the log range [{earliest}, {latest}]")]
    OutOfRange {
        /// Requested start of the range.
        start: Version,
        /// Requested end of the range.
        end: Version,
        /// Lowest retained version.
        earliest: Version,
        /// Latest committed version.
        latest: Version,
    },
    /// The backend failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Read-only snapshot of a log's position.
///
/// Stale the instant the log changes; refetch with
/// [`PatchLog::info`] instead of caching across calls that may append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchLogInfo {
    /// Description of the dataset the log belongs to.
    pub desc: DatasetDesc,
    /// Lowest retained version, [`Version::INIT`] when empty.
    pub earliest: Version,
    /// Latest committed version, [`Version::INIT`] when empty.
    pub latest: Version,
    /// Id of the latest committed patch, `None` when empty.
    pub latest_id: Option<PatchId>,
}

impl fmt::Display for PatchLogInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} [version {}, {}]",
            self.desc.name, self.earliest, self.latest
        )?;
        match &self.latest_id {
            Some(id) => write!(f, " {id}]"),
            None => write!(f, " <empty>]"),
        }
    }
}

/// In-memory index of a log: an append-only entry arena plus two lookup
/// maps, rebuilt on attach and mutated only under the append lock.
#[derive(Debug, Default)]
struct LogState {
    entries: Vec<LogEntry>,
    by_id: HashMap<PatchId, usize>,
    by_version: HashMap<Version, usize>,
    released: bool,
}

impl LogState {
    /// Rebuild the index from scanned entries, best-effort.
    ///
    /// Entries with a duplicate id, a non-contiguous version, or a
    /// `previous` that does not chain from the prior surviving entry are
    /// logged and skipped. The first surviving entry is accepted with any
    /// `previous` — a truncated log legally points outside the retained
    /// range.
    fn rebuild(mut scanned: Vec<LogEntry>) -> LogState {
        scanned.sort_by_key(|entry| entry.version);
        let mut state = LogState::default();
        for entry in scanned {
            if !entry.version.is_valid() {
                warn!(version = %entry.version, id = %entry.id, "recovery: sentinel version, skipping entry");
                continue;
            }
            if state.by_id.contains_key(&entry.id) {
                warn!(version = %entry.version, id = %entry.id, "recovery: duplicate patch id, skipping entry");
                continue;
            }
            if let Some(head) = state.head() {
                if entry.previous != Some(head.id) {
                    warn!(
                        version = %entry.version,
                        id = %entry.id,
                        head = %head.id,
                        "recovery: previous pointer does not chain from the log head, skipping entry"
                    );
                    continue;
                }
                if entry.version != head.version.inc() {
                    warn!(
                        version = %entry.version,
                        head_version = %head.version,
                        "recovery: non-contiguous version, skipping entry"
                    );
                    continue;
                }
            }
            state.push(entry);
        }
        state
    }

    /// Append a committed entry.
    ///
    /// A version or id collision here means the engine allocated the same
    /// slot twice; that is a bug, not user input.
    fn push(&mut self, entry: LogEntry) {
        if self.by_id.contains_key(&entry.id) || self.by_version.contains_key(&entry.version) {
            panic!("log index collision: {entry:?} already assigned");
        }
        let pos = self.entries.len();
        self.by_id.insert(entry.id, pos);
        self.by_version.insert(entry.version, pos);
        self.entries.push(entry);
    }

    fn head(&self) -> Option<&LogEntry> {
        self.entries.last()
    }

    fn earliest(&self) -> Option<&LogEntry> {
        self.entries.first()
    }

    fn by_version(&self, version: Version) -> Option<&LogEntry> {
        self.by_version.get(&version).map(|&pos| &self.entries[pos])
    }

    fn by_id(&self, id: &PatchId) -> Option<&LogEntry> {
        self.by_id.get(id).map(|&pos| &self.entries[pos])
    }
}

/// A strictly-ordered, append-only log of patches for one dataset.
///
/// Obtained from a [`PatchStore`](crate::store::PatchStore). Cheaply
/// cloneable; all clones share state. Reads never take the append lock and
/// only observe committed patches; [`append`](PatchLog::append) is the
/// single serialization point.
#[derive(Debug, Clone)]
pub struct PatchLog {
    inner: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    desc: DatasetDesc,
    state: RwLock<LogState>,
    append_lock: Mutex<()>,
    index: Box<dyn LogIndex>,
    storage: Box<dyn PatchStorage>,
    lock: Box<dyn LogLock>,
}

impl PatchLog {
    /// Open a log over backend parts, rebuilding the in-memory index from
    /// the durable entries.
    pub(crate) fn open(
        desc: DatasetDesc,
        index: Box<dyn LogIndex>,
        storage: Box<dyn PatchStorage>,
        lock: Box<dyn LogLock>,
    ) -> Result<Self, StorageError> {
        let scanned = index.scan()?;
        let scanned_len = scanned.len();
        let state = LogState::rebuild(scanned);
        if state.entries.len() != scanned_len {
            warn!(
                log = %desc.name,
                recovered = state.entries.len(),
                scanned = scanned_len,
                "log recovered with inconsistencies"
            );
        }
        debug!(
            log = %desc.name,
            latest = %state.head().map(|e| e.version).unwrap_or(Version::INIT),
            "opened patch log"
        );
        Ok(PatchLog {
            inner: Arc::new(Shared {
                desc,
                state: RwLock::new(state),
                append_lock: Mutex::new(()),
                index,
                storage,
                lock,
            }),
        })
    }

    /// The description of the dataset this log belongs to.
    pub fn desc(&self) -> &DatasetDesc {
        &self.inner.desc
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, LogState>, LogError> {
        let state = self.inner.state.read();
        if state.released {
            return Err(LogError::NotAvailable);
        }
        Ok(state)
    }

    /// Whether the log holds no patches.
    pub fn is_empty(&self) -> Result<bool, LogError> {
        Ok(self.read_state()?.entries.is_empty())
    }

    /// Lowest retained version, [`Version::INIT`] when empty.
    pub fn earliest_version(&self) -> Result<Version, LogError> {
        Ok(self
            .read_state()?
            .earliest()
            .map(|entry| entry.version)
            .unwrap_or(Version::INIT))
    }

    /// Id of the earliest retained patch, `None` when empty.
    pub fn earliest_id(&self) -> Result<Option<PatchId>, LogError> {
        Ok(self.read_state()?.earliest().map(|entry| entry.id))
    }

    /// Latest committed version, [`Version::INIT`] when empty.
    pub fn latest_version(&self) -> Result<Version, LogError> {
        Ok(self
            .read_state()?
            .head()
            .map(|entry| entry.version)
            .unwrap_or(Version::INIT))
    }

    /// Id of the latest committed patch, `None` when empty.
    pub fn latest_id(&self) -> Result<Option<PatchId>, LogError> {
        Ok(self.read_state()?.head().map(|entry| entry.id))
    }

    /// A point-in-time snapshot of the log's position.
    pub fn info(&self) -> Result<PatchLogInfo, LogError> {
        let state = self.read_state()?;
        Ok(PatchLogInfo {
            desc: self.inner.desc.clone(),
            earliest: state
                .earliest()
                .map(|entry| entry.version)
                .unwrap_or(Version::INIT),
            latest: state
                .head()
                .map(|entry| entry.version)
                .unwrap_or(Version::INIT),
            latest_id: state.head().map(|entry| entry.id),
        })
    }

    /// Whether a patch with this id has been committed.
    pub fn contains(&self, id: &PatchId) -> Result<bool, LogError> {
        Ok(self.read_state()?.by_id.contains_key(id))
    }

    /// The version a patch id was committed under, if any.
    pub fn find_version(&self, id: &PatchId) -> Result<Option<Version>, LogError> {
        Ok(self.read_state()?.by_id(id).map(|entry| entry.version))
    }

    /// The patch id committed under a version, if any.
    pub fn find_id(&self, version: Version) -> Result<Option<PatchId>, LogError> {
        Ok(self.read_state()?.by_version(version).map(|entry| entry.id))
    }

    /// Fetch a committed patch by id. Unknown ids are `Ok(None)`.
    pub fn fetch(&self, id: &PatchId) -> Result<Option<Patch>, LogError> {
        let entry = self.read_state()?.by_id(id).copied();
        match entry {
            None => Ok(None),
            Some(entry) => Ok(self.inner.storage.get(&entry)?),
        }
    }

    /// Fetch a committed patch by version. Unassigned versions are
    /// `Ok(None)`.
    pub fn fetch_version(&self, version: Version) -> Result<Option<Patch>, LogError> {
        let entry = self.read_state()?.by_version(version).copied();
        match entry {
            None => Ok(None),
            Some(entry) => Ok(self.inner.storage.get(&entry)?),
        }
    }

    /// The patches with versions in `[start, end]`, in ascending version
    /// order.
    ///
    /// Both bounds must lie within `[earliest, latest]`. Patches are
    /// fetched lazily; the iterator addresses only versions committed when
    /// it was created, so it is safe to drain concurrently with appends.
    pub fn range(&self, start: Version, end: Version) -> Result<RangeIter, LogError> {
        let (earliest, latest) = {
            let state = self.read_state()?;
            (
                state
                    .earliest()
                    .map(|entry| entry.version)
                    .unwrap_or(Version::INIT),
                state
                    .head()
                    .map(|entry| entry.version)
                    .unwrap_or(Version::INIT),
            )
        };
        let in_range = |v: Version| v.is_valid() && v >= earliest && v <= latest;
        if !in_range(start) || !in_range(end) || start > end {
            return Err(LogError::OutOfRange {
                start,
                end,
                earliest,
                latest,
            });
        }
        Ok(RangeIter {
            log: self.clone(),
            next: start.value(),
            end: end.value(),
        })
    }

    /// Append a patch, returning the version it was committed under.
    ///
    /// This is the single serialization point of the log. The patch's
    /// `previous` must name the current head (and must be absent on an
    /// empty log) and its id must be new, otherwise the append is rejected
    /// and the log is unchanged. The patch is durably persisted before the
    /// in-memory index is updated, so a crash can never leave the index
    /// claiming a version storage cannot produce.
    pub fn append(&self, patch: Patch) -> Result<Version, AppendError> {
        let inner = &*self.inner;
        if inner.state.read().released {
            return Err(AppendError::NotAvailable);
        }

        let _local = inner.append_lock.lock();
        let _coord = inner.lock.acquire()?;

        // With the cross-process lock held, reconcile against the durable
        // head: another process may have appended since this one last held
        // the lock.
        if let IndexHead::Shared(remote) = inner.index.refresh()? {
            let stale = {
                let state = inner.state.read();
                state.head().map(|entry| (entry.version, entry.id))
                    != remote.map(|entry| (entry.version, entry.id))
            };
            if stale {
                let scanned = inner.index.scan()?;
                let mut state = inner.state.write();
                let released = state.released;
                *state = LogState::rebuild(scanned);
                state.released = released;
                debug!(log = %inner.desc.name, "index rebuilt from the shared head");
            }
        }

        let next_version = {
            let state = inner.state.read();
            if state.released {
                return Err(AppendError::NotAvailable);
            }
            if state.by_id.contains_key(&patch.id()) {
                return Err(AppendError::Duplicate { id: patch.id() });
            }
            match state.head() {
                None => {
                    if patch.previous().is_some() {
                        return Err(AppendError::UnexpectedPrevious { id: patch.id() });
                    }
                    Version::FIRST
                }
                Some(head) => {
                    if patch.previous() != Some(head.id) {
                        return Err(AppendError::HeadMismatch {
                            id: patch.id(),
                            previous: patch.previous(),
                            head: Some(head.id),
                        });
                    }
                    head.version.inc()
                }
            }
        };

        let entry = LogEntry {
            version: next_version,
            id: patch.id(),
            previous: patch.previous(),
        };

        // Persist, then record. Storage is the source of truth recovery
        // reconciles from, so it must never lag the index.
        inner.storage.put(&entry, &patch)?;
        if let Err(err) = inner.index.save(&entry) {
            if let Err(undo) = inner.storage.delete(&entry) {
                warn!(
                    id = %entry.id,
                    error = %undo,
                    "failed to remove stored patch after index save failure"
                );
            }
            return Err(err.into());
        }

        inner.state.write().push(entry);
        Ok(next_version)
    }

    /// Detach the log. Every further operation fails with a
    /// "not available" error. Durable data is untouched; use
    /// [`PatchStore::retire`](crate::store::PatchStore::retire) to mark a
    /// log retired.
    pub fn release(&self) {
        let mut state = self.inner.state.write();
        if !state.released {
            state.released = true;
            debug!(log = %self.inner.desc.name, "patch log released");
        }
    }

    /// Whether [`release`](PatchLog::release) has been called.
    pub fn is_released(&self) -> bool {
        self.inner.state.read().released
    }

    fn fetch_committed(&self, version: Version) -> Result<Patch, LogError> {
        let entry = self.read_state()?.by_version(version).copied();
        let entry = entry.ok_or_else(|| {
            LogError::Storage(StorageError::Corrupt(format!(
                "version {version} vanished from the index"
            )))
        })?;
        match self.inner.storage.get(&entry)? {
            Some(patch) => Ok(patch),
            None => Err(LogError::Storage(StorageError::Corrupt(format!(
                "committed patch {} is missing from storage",
                entry.id
            )))),
        }
    }
}

/// Lazy iterator over a version range, created by [`PatchLog::range`].
#[derive(Debug)]
pub struct RangeIter {
    log: PatchLog,
    next: i64,
    end: i64,
}

impl Iterator for RangeIter {
    type Item = Result<Patch, LogError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next > self.end {
            return None;
        }
        let version = Version::new(self.next).expect("bounds checked in range()");
        self.next += 1;
        Some(self.log.fetch_committed(version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(version: i64, id: u8, previous: Option<u8>) -> LogEntry {
        LogEntry {
            version: Version::new(version).unwrap(),
            id: PatchId::from_bytes([id; 16]),
            previous: previous.map(|p| PatchId::from_bytes([p; 16])),
        }
    }

    #[test]
    fn test_rebuild_full_chain() {
        let state = LogState::rebuild(vec![
            entry(2, 2, Some(1)),
            entry(1, 1, None),
            entry(3, 3, Some(2)),
        ]);
        assert_eq!(state.entries.len(), 3);
        assert_eq!(state.earliest().unwrap().version, Version::FIRST);
        assert_eq!(state.head().unwrap().version, Version::new(3).unwrap());
    }

    #[test]
    fn test_rebuild_truncated_log() {
        // earliest retained entry points outside the retained range
        let state = LogState::rebuild(vec![entry(5, 5, Some(4)), entry(6, 6, Some(5))]);
        assert_eq!(state.entries.len(), 2);
        assert_eq!(state.earliest().unwrap().version, Version::new(5).unwrap());
    }

    #[test]
    fn test_rebuild_skips_duplicate_id() {
        let state = LogState::rebuild(vec![
            entry(1, 1, None),
            entry(2, 1, Some(1)), // same id again
        ]);
        assert_eq!(state.entries.len(), 1);
        assert_eq!(state.head().unwrap().version, Version::FIRST);
    }

    #[test]
    fn test_rebuild_chain_break_drops_tail() {
        let state = LogState::rebuild(vec![
            entry(1, 1, None),
            entry(2, 2, Some(9)), // does not chain from 1
            entry(3, 3, Some(2)),
        ]);
        // the break and everything after it is dropped
        assert_eq!(state.entries.len(), 1);
        assert_eq!(state.head().unwrap().id, PatchId::from_bytes([1; 16]));
    }

    #[test]
    fn test_rebuild_version_gap() {
        let state = LogState::rebuild(vec![entry(1, 1, None), entry(3, 3, Some(1))]);
        assert_eq!(state.entries.len(), 1);
    }

    #[test]
    #[should_panic]
    fn test_push_version_collision_panics() {
        let mut state = LogState::rebuild(vec![entry(1, 1, None)]);
        state.push(entry(1, 2, Some(1)));
    }
}
