//! In-memory patch store.
//!
//! The reference implementation of the storage contract: a slot per
//! version plus an id map, guarded by one lock, with no persistence.
//! Attaching after a process exit always yields nothing, by construction.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use crate::{
    ids::PatchId,
    log::PatchLog,
    patch::{LogEntry, Patch},
    store::{
        ensure_valid_name, DatasetDesc, LogIndex, NullLock, PatchStorage, PatchStore,
        StorageError, StoreError,
    },
};

/// Backend state of one in-memory log, shared between its index and
/// storage views.
#[derive(Debug, Clone, Default)]
pub(crate) struct MemLog {
    inner: Arc<RwLock<MemLogInner>>,
}

#[derive(Debug, Default)]
struct MemLogInner {
    /// Committed entries in append order.
    entries: Vec<LogEntry>,
    patches: HashMap<PatchId, Patch>,
}

impl LogIndex for MemLog {
    fn save(&self, entry: &LogEntry) -> Result<(), StorageError> {
        self.inner.write().entries.push(*entry);
        Ok(())
    }

    fn scan(&self) -> Result<Vec<LogEntry>, StorageError> {
        Ok(self.inner.read().entries.clone())
    }
}

impl PatchStorage for MemLog {
    fn put(&self, _entry: &LogEntry, patch: &Patch) -> Result<(), StorageError> {
        self.inner.write().patches.insert(patch.id(), patch.clone());
        Ok(())
    }

    fn get(&self, entry: &LogEntry) -> Result<Option<Patch>, StorageError> {
        Ok(self.inner.read().patches.get(&entry.id).cloned())
    }

    fn delete(&self, entry: &LogEntry) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        inner.patches.remove(&entry.id);
        inner.entries.retain(|e| e.id != entry.id);
        Ok(())
    }
}

#[derive(Debug)]
struct MemStoreEntry {
    desc: DatasetDesc,
    backend: MemLog,
    log: PatchLog,
    retired: bool,
}

/// A [`PatchStore`] keeping everything in process memory.
///
/// Used as the reference implementation for correctness tests and as a
/// zero-dependency deployment mode.
#[derive(Debug, Default)]
pub struct MemStore {
    logs: RwLock<HashMap<String, MemStoreEntry>>,
}

impl MemStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn open_log(desc: &DatasetDesc, backend: &MemLog) -> Result<PatchLog, StorageError> {
        PatchLog::open(
            desc.clone(),
            Box::new(backend.clone()),
            Box::new(backend.clone()),
            Box::new(NullLock),
        )
    }
}

impl PatchStore for MemStore {
    fn create(&self, desc: &DatasetDesc) -> Result<PatchLog, StoreError> {
        ensure_valid_name(&desc.name)?;
        let mut logs = self.logs.write();
        if logs.contains_key(&desc.name) {
            return Err(StoreError::AlreadyExists(desc.name.clone()));
        }
        let backend = MemLog::default();
        let log = Self::open_log(desc, &backend)?;
        logs.insert(
            desc.name.clone(),
            MemStoreEntry {
                desc: desc.clone(),
                backend,
                log: log.clone(),
                retired: false,
            },
        );
        Ok(log)
    }

    fn attach(&self, name: &str) -> Result<PatchLog, StoreError> {
        let mut logs = self.logs.write();
        let entry = logs
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        if entry.retired {
            return Err(StoreError::Retired(name.to_string()));
        }
        if !entry.log.is_released() {
            return Ok(entry.log.clone());
        }
        let log = Self::open_log(&entry.desc, &entry.backend)?;
        entry.log = log.clone();
        Ok(log)
    }

    fn get(&self, id: &PatchId) -> Option<PatchLog> {
        let logs = self.logs.read();
        logs.values()
            .find(|entry| entry.desc.id == *id && !entry.retired && !entry.log.is_released())
            .map(|entry| entry.log.clone())
    }

    fn list(&self) -> Result<Vec<DatasetDesc>, StoreError> {
        let logs = self.logs.read();
        let mut descs: Vec<_> = logs
            .values()
            .filter(|entry| !entry.retired)
            .map(|entry| entry.desc.clone())
            .collect();
        descs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(descs)
    }

    fn retire(&self, id: &PatchId) -> Result<(), StoreError> {
        let mut logs = self.logs.write();
        let entry = logs
            .values_mut()
            .find(|entry| entry.desc.id == *id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if entry.retired {
            return Err(StoreError::Retired(entry.desc.name.clone()));
        }
        entry.log.release();
        entry.retired = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rand::rngs::ThreadRng;

    use super::*;
    use crate::{
        log::AppendError,
        patch::PatchHeader,
        ids::Version,
    };

    fn desc(rng: &mut ThreadRng, name: &str) -> DatasetDesc {
        DatasetDesc::new(PatchId::random(rng), name, None)
    }

    fn patch(rng: &mut ThreadRng, previous: Option<PatchId>, body: &str) -> Patch {
        Patch::new(
            PatchHeader::new(PatchId::random(rng), previous),
            Bytes::copy_from_slice(body.as_bytes()),
        )
    }

    #[test]
    fn test_append_chain() {
        let mut rng = rand::thread_rng();
        let store = MemStore::new();
        let log = store.create(&desc(&mut rng, "data")).unwrap();
        assert!(log.is_empty().unwrap());

        let p1 = patch(&mut rng, None, "one");
        let a = p1.id();
        assert_eq!(log.append(p1).unwrap(), Version::FIRST);

        let p2 = patch(&mut rng, Some(a), "two");
        let b = p2.id();
        assert_eq!(log.append(p2).unwrap(), Version::new(2).unwrap());

        // wrong previous: chains from A instead of B
        let p3 = patch(&mut rng, Some(a), "three");
        assert!(matches!(
            log.append(p3),
            Err(AppendError::HeadMismatch { .. })
        ));
        assert_eq!(log.latest_version().unwrap(), Version::new(2).unwrap());
        assert_eq!(log.latest_id().unwrap(), Some(b));
    }

    #[test]
    fn test_first_append_must_not_have_previous() {
        let mut rng = rand::thread_rng();
        let store = MemStore::new();
        let log = store.create(&desc(&mut rng, "data")).unwrap();
        let prev = PatchId::random(&mut rng);
        let bad = patch(&mut rng, Some(prev), "x");
        assert!(matches!(
            log.append(bad),
            Err(AppendError::UnexpectedPrevious { .. })
        ));
        assert!(log.is_empty().unwrap());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut rng = rand::thread_rng();
        let store = MemStore::new();
        let log = store.create(&desc(&mut rng, "data")).unwrap();
        let p1 = patch(&mut rng, None, "one");
        let a = p1.id();
        log.append(p1.clone()).unwrap();
        let dup = Patch::new(PatchHeader::new(a, Some(a)), Bytes::new());
        assert!(matches!(log.append(dup), Err(AppendError::Duplicate { .. })));
    }

    #[test]
    fn test_fetch_and_find() {
        let mut rng = rand::thread_rng();
        let store = MemStore::new();
        let log = store.create(&desc(&mut rng, "data")).unwrap();
        let p1 = patch(&mut rng, None, "one");
        let a = p1.id();
        log.append(p1.clone()).unwrap();

        let fetched = log.fetch(&a).unwrap().unwrap();
        assert_eq!(fetched, p1);
        assert_eq!(
            log.fetch_version(Version::FIRST).unwrap().unwrap().id(),
            a
        );
        assert_eq!(log.find_version(&a).unwrap(), Some(Version::FIRST));
        assert_eq!(log.find_id(Version::FIRST).unwrap(), Some(a));
        assert!(log.contains(&a).unwrap());

        // not-found is empty, not an error
        assert!(log.fetch(&PatchId::random(&mut rng)).unwrap().is_none());
        assert!(log
            .fetch_version(Version::new(99).unwrap())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_released_log_not_available() {
        let mut rng = rand::thread_rng();
        let store = MemStore::new();
        let log = store.create(&desc(&mut rng, "data")).unwrap();
        log.release();
        assert!(matches!(log.is_empty(), Err(crate::LogError::NotAvailable)));
        assert!(matches!(
            log.append(patch(&mut rng, None, "x")),
            Err(AppendError::NotAvailable)
        ));
        // a released (not retired) log can be re-attached in process
        let log = store.attach("data").unwrap();
        assert!(log.is_empty().unwrap());
    }

    #[test]
    fn test_create_attach_retire() {
        let mut rng = rand::thread_rng();
        let store = MemStore::new();
        let d = desc(&mut rng, "data");
        let log = store.create(&d).unwrap();
        assert!(matches!(
            store.create(&d),
            Err(StoreError::AlreadyExists(_))
        ));
        // attach returns the live instance
        let again = store.attach("data").unwrap();
        log.append(patch(&mut rng, None, "one")).unwrap();
        assert_eq!(again.latest_version().unwrap(), Version::FIRST);
        assert!(store.get(&d.id).is_some());
        assert_eq!(store.list().unwrap(), vec![d.clone()]);

        store.retire(&d.id).unwrap();
        assert!(store.get(&d.id).is_none());
        assert!(store.list().unwrap().is_empty());
        assert!(matches!(store.attach("data"), Err(StoreError::Retired(_))));
        // the name stays taken after retirement
        assert!(matches!(
            store.create(&d),
            Err(StoreError::AlreadyExists(_))
        ));
        assert!(matches!(store.retire(&d.id), Err(StoreError::Retired(_))));
    }

    #[test]
    fn test_attach_unknown() {
        let store = MemStore::new();
        assert!(matches!(
            store.attach("nothing"),
            Err(StoreError::NotFound(_))
        ));
    }
}
