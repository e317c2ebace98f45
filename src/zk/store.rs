//! Zookeeper-backed store, index mirror, and patch storage.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use tracing::{debug, warn};
use zookeeper::{Acl, CreateMode, ZkError};

use crate::{
    ids::{PatchId, Version},
    log::PatchLog,
    patch::{LogEntry, Patch, PatchHeader},
    store::{
        ensure_valid_name, DatasetDesc, IndexHead, LogIndex, LogLock, PatchStorage, PatchStore,
        StorageError, StoreError,
    },
};

use super::{
    with_retry, zk_path, ZkConfig, ZkLock, ZkSession, N_LOCK, N_LOGS, N_META, N_PATCHES,
    N_RETIRED, N_STATE,
};

/// The mirrored index of one shared log.
///
/// [`save`](LogIndex::save) refreshes a small `state` node with the last
/// committed entry on every append; attaching processes bootstrap from it
/// by walking the `previous` chain through the stored patch headers
/// instead of replaying every body.
#[derive(Debug, Clone)]
struct ZkLogIndex {
    session: ZkSession,
    state_path: String,
    patches_path: String,
}

impl ZkLogIndex {
    fn read_head(&self) -> Result<Option<LogEntry>, StorageError> {
        let bytes = with_retry(&self.session, "read log head", |client| {
            match client.get_data(&self.state_path, false) {
                Ok((bytes, _stat)) => Ok(Some(bytes)),
                Err(ZkError::NoNode) => Ok(None),
                Err(err) => Err(err),
            }
        })?;
        match bytes {
            None => Ok(None),
            Some(bytes) if bytes.is_empty() => Ok(None),
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes).map_err(|err| {
                StorageError::Corrupt(format!("unreadable log head record: {err}"))
            })?)),
        }
    }

    fn read_patch_header(&self, id: &PatchId) -> Result<Option<PatchHeader>, StorageError> {
        let bytes = with_retry(&self.session, "read patch header", |client| {
            match client.get_data(&zk_path(&self.patches_path, &id.to_string()), false) {
                Ok((bytes, _stat)) => Ok(Some(bytes)),
                Err(ZkError::NoNode) => Ok(None),
                Err(err) => Err(err),
            }
        })?;
        let Some(bytes) = bytes else {
            return Ok(None);
        };
        match PatchHeader::read_from(&mut &bytes[..]) {
            Ok(header) => Ok(Some(header)),
            Err(err) => {
                warn!(patch = %id, error = %err, "recovery: unreadable patch header, stopping chain walk");
                Ok(None)
            }
        }
    }
}

impl LogIndex for ZkLogIndex {
    fn save(&self, entry: &LogEntry) -> Result<(), StorageError> {
        let bytes = postcard::to_stdvec(entry)
            .map_err(|err| StorageError::Other(anyhow::Error::new(err)))?;
        with_retry(&self.session, "save log head", |client| {
            client
                .set_data(&self.state_path, bytes.clone(), None)
                .map(|_stat| ())
        })
    }

    fn scan(&self) -> Result<Vec<LogEntry>, StorageError> {
        let Some(head) = self.read_head()? else {
            return Ok(Vec::new());
        };
        let mut entries = vec![head];
        let mut current = head;
        // walk latest -> previous; a missing predecessor means the log is
        // truncated and the retained range ends here
        while let Some(previous_id) = current.previous {
            let version = match Version::new(current.version.value() - 1) {
                Some(version) if version.is_valid() => version,
                _ => break,
            };
            let Some(header) = self.read_patch_header(&previous_id)? else {
                break;
            };
            let entry = LogEntry {
                version,
                id: previous_id,
                previous: header.previous,
            };
            entries.push(entry);
            current = entry;
        }
        entries.reverse();
        Ok(entries)
    }

    fn refresh(&self) -> Result<IndexHead, StorageError> {
        Ok(IndexHead::Shared(self.read_head()?))
    }
}

/// Patch bodies as znodes under the log's `patches` path.
#[derive(Debug, Clone)]
struct ZkPatchStorage {
    session: ZkSession,
    patches_path: String,
}

impl ZkPatchStorage {
    fn patch_path(&self, id: &PatchId) -> String {
        zk_path(&self.patches_path, &id.to_string())
    }
}

impl PatchStorage for ZkPatchStorage {
    fn put(&self, entry: &LogEntry, patch: &Patch) -> Result<(), StorageError> {
        let bytes = patch.to_vec()?;
        let path = self.patch_path(&entry.id);
        // a single create is the atomic commit point
        let created = with_retry(&self.session, "store patch", |client| {
            match client.create(
                &path,
                bytes.clone(),
                Acl::open_unsafe().clone(),
                CreateMode::Persistent,
            ) {
                Ok(_path) => Ok(true),
                Err(ZkError::NodeExists) => Ok(false),
                Err(err) => Err(err),
            }
        })?;
        if !created {
            return Err(StorageError::Corrupt(format!(
                "patch {} is already stored",
                entry.id
            )));
        }
        Ok(())
    }

    fn get(&self, entry: &LogEntry) -> Result<Option<Patch>, StorageError> {
        let path = self.patch_path(&entry.id);
        let bytes = with_retry(&self.session, "fetch patch", |client| {
            match client.get_data(&path, false) {
                Ok((bytes, _stat)) => Ok(Some(bytes)),
                Err(ZkError::NoNode) => Ok(None),
                Err(err) => Err(err),
            }
        })?;
        match bytes {
            None => Ok(None),
            Some(bytes) => Ok(Some(Patch::from_bytes(&bytes)?)),
        }
    }

    fn delete(&self, entry: &LogEntry) -> Result<(), StorageError> {
        let path = self.patch_path(&entry.id);
        with_retry(&self.session, "delete patch", |client| {
            match client.delete(&path, None) {
                Ok(()) | Err(ZkError::NoNode) => Ok(()),
                Err(err) => Err(err),
            }
        })
    }
}

#[derive(Debug)]
struct ZkStoreEntry {
    desc: DatasetDesc,
    log: PatchLog,
}

/// A [`PatchStore`] coordinated through Zookeeper, safe to share between
/// processes.
#[derive(Debug)]
pub struct ZkStore {
    session: ZkSession,
    root: String,
    live: RwLock<HashMap<String, ZkStoreEntry>>,
}

impl ZkStore {
    /// Connect to the ensemble and prepare the store's base paths.
    pub fn open(config: ZkConfig) -> Result<Arc<Self>, StoreError> {
        let session = ZkSession::connect(&config)?;
        let store = ZkStore {
            session,
            root: config.root.trim_end_matches('/').to_string(),
            live: RwLock::new(HashMap::new()),
        };
        store.ensure(&store.root)?;
        store.ensure(&store.logs_path())?;
        store.ensure(&zk_path(&store.root, N_LOCK))?;
        debug!(root = %store.root, "opened coordinated patch store");
        Ok(Arc::new(store))
    }

    fn logs_path(&self) -> String {
        zk_path(&self.root, N_LOGS)
    }

    fn log_path(&self, name: &str) -> String {
        zk_path(&self.logs_path(), name)
    }

    fn ensure(&self, path: &str) -> Result<(), StorageError> {
        with_retry(&self.session, "ensure path", |client| {
            match client.create(
                path,
                Vec::new(),
                Acl::open_unsafe().clone(),
                CreateMode::Persistent,
            ) {
                Ok(_path) => Ok(()),
                Err(ZkError::NodeExists) => Ok(()),
                Err(err) => Err(err),
            }
        })
    }

    fn exists(&self, path: &str) -> Result<bool, StorageError> {
        with_retry(&self.session, "check path", |client| {
            client.exists(path, false).map(|stat| stat.is_some())
        })
    }

    /// Store-wide lock serializing create and retire across processes.
    fn store_lock(&self) -> ZkLock {
        ZkLock::new(self.session.clone(), zk_path(&self.root, N_LOCK))
    }

    fn read_desc(&self, name: &str) -> Result<DatasetDesc, StorageError> {
        let path = zk_path(&self.log_path(name), N_META);
        let bytes = with_retry(&self.session, "read log metadata", |client| {
            client.get_data(&path, false).map(|(bytes, _stat)| bytes)
        })?;
        postcard::from_bytes(&bytes)
            .map_err(|err| StorageError::Corrupt(format!("unreadable log metadata: {err}")))
    }

    fn open_log(&self, desc: &DatasetDesc) -> Result<PatchLog, StorageError> {
        let log_path = self.log_path(&desc.name);
        let index = ZkLogIndex {
            session: self.session.clone(),
            state_path: zk_path(&log_path, N_STATE),
            patches_path: zk_path(&log_path, N_PATCHES),
        };
        let storage = ZkPatchStorage {
            session: self.session.clone(),
            patches_path: zk_path(&log_path, N_PATCHES),
        };
        let lock = ZkLock::new(self.session.clone(), zk_path(&log_path, N_LOCK));
        PatchLog::open(
            desc.clone(),
            Box::new(index),
            Box::new(storage),
            Box::new(lock),
        )
    }

    fn create_node(&self, path: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        with_retry(&self.session, "create node", |client| {
            match client.create(
                path,
                bytes.clone(),
                Acl::open_unsafe().clone(),
                CreateMode::Persistent,
            ) {
                Ok(_path) => Ok(()),
                Err(ZkError::NodeExists) => Ok(()),
                Err(err) => Err(err),
            }
        })
    }
}

impl PatchStore for ZkStore {
    fn create(&self, desc: &DatasetDesc) -> Result<PatchLog, StoreError> {
        ensure_valid_name(&desc.name)?;
        let _store_guard = self.store_lock().acquire()?;
        let mut live = self.live.write();
        let log_path = self.log_path(&desc.name);
        if self.exists(&log_path)? {
            return Err(StoreError::AlreadyExists(desc.name.clone()));
        }
        let meta = postcard::to_stdvec(desc)
            .map_err(|err| StorageError::Other(anyhow::Error::new(err)))?;
        self.create_node(&log_path, Vec::new())?;
        self.create_node(&zk_path(&log_path, N_META), meta)?;
        self.create_node(&zk_path(&log_path, N_STATE), Vec::new())?;
        self.create_node(&zk_path(&log_path, N_LOCK), Vec::new())?;
        self.create_node(&zk_path(&log_path, N_PATCHES), Vec::new())?;

        let log = self.open_log(desc)?;
        live.insert(
            desc.name.clone(),
            ZkStoreEntry {
                desc: desc.clone(),
                log: log.clone(),
            },
        );
        Ok(log)
    }

    fn attach(&self, name: &str) -> Result<PatchLog, StoreError> {
        ensure_valid_name(name)?;
        let mut live = self.live.write();
        if let Some(entry) = live.get(name) {
            if !entry.log.is_released() {
                return Ok(entry.log.clone());
            }
        }
        let log_path = self.log_path(name);
        if !self.exists(&log_path)? {
            return Err(StoreError::NotFound(name.to_string()));
        }
        if self.exists(&zk_path(&log_path, N_RETIRED))? {
            return Err(StoreError::Retired(name.to_string()));
        }
        let desc = self.read_desc(name)?;
        let log = self.open_log(&desc)?;
        live.insert(
            name.to_string(),
            ZkStoreEntry {
                desc,
                log: log.clone(),
            },
        );
        Ok(log)
    }

    fn get(&self, id: &PatchId) -> Option<PatchLog> {
        let live = self.live.read();
        live.values()
            .find(|entry| entry.desc.id == *id && !entry.log.is_released())
            .map(|entry| entry.log.clone())
    }

    fn list(&self) -> Result<Vec<DatasetDesc>, StoreError> {
        let names = with_retry(&self.session, "list logs", |client| {
            client.get_children(&self.logs_path(), false)
        })?;
        let mut descs = Vec::new();
        for name in names {
            if self.exists(&zk_path(&self.log_path(&name), N_RETIRED))? {
                continue;
            }
            match self.read_desc(&name) {
                Ok(desc) => descs.push(desc),
                Err(err) => {
                    warn!(log = %name, error = %err, "skipping log with unreadable metadata");
                }
            }
        }
        descs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(descs)
    }

    fn retire(&self, id: &PatchId) -> Result<(), StoreError> {
        let _store_guard = self.store_lock().acquire()?;
        let mut live = self.live.write();
        let name = match live.values().find(|entry| entry.desc.id == *id) {
            Some(entry) => entry.desc.name.clone(),
            None => {
                let names = with_retry(&self.session, "list logs", |client| {
                    client.get_children(&self.logs_path(), false)
                })?;
                let mut found = None;
                for name in names {
                    if let Ok(desc) = self.read_desc(&name) {
                        if desc.id == *id {
                            found = Some(name);
                            break;
                        }
                    }
                }
                found.ok_or_else(|| StoreError::NotFound(id.to_string()))?
            }
        };
        let marker = zk_path(&self.log_path(&name), N_RETIRED);
        if self.exists(&marker)? {
            return Err(StoreError::Retired(name));
        }
        if let Some(entry) = live.remove(&name) {
            entry.log.release();
        }
        self.create_node(&marker, Vec::new())?;
        debug!(log = %name, "patch log retired");
        Ok(())
    }
}
