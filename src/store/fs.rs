//! File-backed patch store.
//!
//! One directory per log under the store root. Each committed version is
//! one immutable file named by its zero-padded decimal version. New
//! patches are written to a temporary file in the same directory, flushed,
//! and then renamed onto the version-numbered name: the rename is the
//! commit point. Before it the patch does not exist for any reader; after
//! it the file is never modified.
//!
//! Attach recovers the index by scanning the directory in version order,
//! reading only each file's framed header. Unreadable entries are logged
//! and skipped; recovery never aborts on a single corrupt file.
//!
//! A log directory is owned by a single process at a time. That is a
//! documented precondition, not something this backend enforces; sharing
//! a log between processes needs the coordinated store.

use std::{
    collections::HashMap,
    fs,
    io::{BufReader, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::{
    ids::{PatchId, Version},
    log::PatchLog,
    patch::{LogEntry, Patch, PatchHeader},
    store::{
        ensure_valid_name, DatasetDesc, LogIndex, NullLock, PatchStorage, PatchStore,
        StorageError, StoreError,
    },
};

/// Version filenames are zero-padded to this width so lexicographic and
/// numeric order agree.
const VERSION_FILE_WIDTH: usize = 16;
/// Prefix of in-flight temporary files; leftovers are removed on attach.
const TMP_PREFIX: &str = "tmp-";
/// Per-log metadata file holding the postcard [`DatasetDesc`].
const META_FILE: &str = "log.meta";
/// Soft-delete marker. A retired log keeps its files for forensics.
const RETIRED_FILE: &str = "retired";

fn version_filename(version: Version) -> String {
    format!("{:0width$}", version.value(), width = VERSION_FILE_WIDTH)
}

fn parse_version_filename(name: &str) -> Option<Version> {
    if name.len() != VERSION_FILE_WIDTH || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: i64 = name.parse().ok()?;
    Version::new(value).filter(|v| v.is_valid())
}

/// Index and storage of one log directory.
#[derive(Debug, Clone)]
pub(crate) struct FsLog {
    dir: PathBuf,
}

impl FsLog {
    /// Open a log directory, removing temporary files a crash left behind.
    fn open(dir: PathBuf) -> Result<Self, StorageError> {
        for item in fs::read_dir(&dir)? {
            let item = item?;
            let name = item.file_name();
            if name.to_string_lossy().starts_with(TMP_PREFIX) {
                warn!(file = %item.path().display(), "removing leftover temporary file");
                if let Err(err) = fs::remove_file(item.path()) {
                    warn!(file = %item.path().display(), error = %err, "failed to remove temporary file");
                }
            }
        }
        Ok(FsLog { dir })
    }

    fn version_path(&self, version: Version) -> PathBuf {
        self.dir.join(version_filename(version))
    }
}

impl PatchStorage for FsLog {
    fn put(&self, entry: &LogEntry, patch: &Patch) -> Result<(), StorageError> {
        let final_path = self.version_path(entry.version);
        let tmp_path = self.dir.join(format!("{TMP_PREFIX}{}", entry.id));
        {
            let mut file = fs::File::create(&tmp_path)?;
            patch.write_to(&mut file)?;
            file.flush()?;
            file.sync_all()?;
        }
        // the commit point
        fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    fn get(&self, entry: &LogEntry) -> Result<Option<Patch>, StorageError> {
        let path = self.version_path(entry.version);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(Patch::from_bytes(&bytes)?))
    }

    fn delete(&self, entry: &LogEntry) -> Result<(), StorageError> {
        match fs::remove_file(self.version_path(entry.version)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl LogIndex for FsLog {
    fn save(&self, _entry: &LogEntry) -> Result<(), StorageError> {
        // The version-named patch file committed by `put` is the durable
        // index record; there is nothing further to write.
        Ok(())
    }

    fn scan(&self) -> Result<Vec<LogEntry>, StorageError> {
        let mut files = Vec::new();
        for item in fs::read_dir(&self.dir)? {
            let item = item?;
            let name = item.file_name();
            let Some(version) = parse_version_filename(&name.to_string_lossy()) else {
                continue;
            };
            files.push((version, item.path()));
        }
        files.sort_by_key(|(version, _)| *version);

        let mut entries = Vec::with_capacity(files.len());
        for (version, path) in files {
            let file = match fs::File::open(&path) {
                Ok(file) => file,
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "recovery: unreadable patch file, skipping");
                    continue;
                }
            };
            let mut reader = BufReader::new(file);
            let header = match PatchHeader::read_from(&mut reader) {
                Ok(header) => header,
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "recovery: unreadable patch header, skipping");
                    continue;
                }
            };
            entries.push(LogEntry {
                version,
                id: header.id,
                previous: header.previous,
            });
        }
        Ok(entries)
    }
}

#[derive(Debug)]
struct FsStoreEntry {
    desc: DatasetDesc,
    log: PatchLog,
}

/// A [`PatchStore`] with one directory per log under a root directory.
#[derive(Debug)]
pub struct FsStore {
    root: PathBuf,
    live: RwLock<HashMap<String, FsStoreEntry>>,
}

impl FsStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl AsRef<Path>) -> Result<Arc<Self>, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(StorageError::from)?;
        debug!(root = %root.display(), "opened file patch store");
        Ok(Arc::new(FsStore {
            root,
            live: RwLock::new(HashMap::new()),
        }))
    }

    /// The root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn log_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn read_desc(dir: &Path) -> Result<DatasetDesc, StorageError> {
        let bytes = fs::read(dir.join(META_FILE))?;
        postcard::from_bytes(&bytes)
            .map_err(|err| StorageError::Corrupt(format!("unreadable log metadata: {err}")))
    }

    fn open_log(&self, desc: &DatasetDesc) -> Result<PatchLog, StorageError> {
        let backend = FsLog::open(self.log_dir(&desc.name))?;
        PatchLog::open(
            desc.clone(),
            Box::new(backend.clone()),
            Box::new(backend),
            Box::new(NullLock),
        )
    }
}

impl PatchStore for FsStore {
    fn create(&self, desc: &DatasetDesc) -> Result<PatchLog, StoreError> {
        ensure_valid_name(&desc.name)?;
        let mut live = self.live.write();
        let dir = self.log_dir(&desc.name);
        // durable existence is what counts: a retired or crashed-mid-create
        // log still claims its name
        if dir.exists() {
            return Err(StoreError::AlreadyExists(desc.name.clone()));
        }
        fs::create_dir(&dir).map_err(StorageError::from)?;
        let meta = postcard::to_stdvec(desc)
            .map_err(|err| StorageError::Other(anyhow::Error::new(err)))?;
        let tmp = dir.join(format!("{TMP_PREFIX}meta"));
        fs::write(&tmp, &meta).map_err(StorageError::from)?;
        fs::rename(&tmp, dir.join(META_FILE)).map_err(StorageError::from)?;

        let log = self.open_log(desc)?;
        live.insert(
            desc.name.clone(),
            FsStoreEntry {
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
        let dir = self.log_dir(name);
        if !dir.is_dir() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        if dir.join(RETIRED_FILE).exists() {
            return Err(StoreError::Retired(name.to_string()));
        }
        let desc = Self::read_desc(&dir)?;
        let log = self.open_log(&desc)?;
        live.insert(
            name.to_string(),
            FsStoreEntry {
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
        let mut descs = Vec::new();
        for item in fs::read_dir(&self.root).map_err(StorageError::from)? {
            let item = item.map_err(StorageError::from)?;
            let dir = item.path();
            if !dir.is_dir() || !dir.join(META_FILE).is_file() {
                continue;
            }
            if dir.join(RETIRED_FILE).exists() {
                continue;
            }
            match Self::read_desc(&dir) {
                Ok(desc) => descs.push(desc),
                Err(err) => {
                    warn!(dir = %dir.display(), error = %err, "skipping log with unreadable metadata");
                }
            }
        }
        descs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(descs)
    }

    fn retire(&self, id: &PatchId) -> Result<(), StoreError> {
        let mut live = self.live.write();
        // resolve the name from the live registry or from disk
        let name = match live.values().find(|entry| entry.desc.id == *id) {
            Some(entry) => entry.desc.name.clone(),
            None => {
                let mut found = None;
                for desc in self.list()? {
                    if desc.id == *id {
                        found = Some(desc.name);
                        break;
                    }
                }
                found.ok_or_else(|| StoreError::NotFound(id.to_string()))?
            }
        };
        let dir = self.log_dir(&name);
        if dir.join(RETIRED_FILE).exists() {
            return Err(StoreError::Retired(name));
        }
        if let Some(entry) = live.remove(&name) {
            entry.log.release();
        }
        fs::write(dir.join(RETIRED_FILE), b"").map_err(StorageError::from)?;
        debug!(log = %name, "patch log retired");
        Ok(())
    }
}
