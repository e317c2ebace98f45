//! Store configuration.
//!
//! The surrounding server decides which backend a dataset's logs live on
//! and where; this module is the boundary object it hands in. Parsing a
//! configuration file into a [`StoreConfig`] is the server's business.

use std::{path::PathBuf, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::store::{fs::FsStore, memory::MemStore, PatchStore, StoreError};

/// Which backend a patch store uses and where it keeps its data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreConfig {
    /// Keep everything in process memory. No persistence.
    Memory,
    /// One directory per log under `root`.
    File {
        /// Root directory of the store.
        root: PathBuf,
    },
    /// Zookeeper-coordinated store for logs shared between processes.
    #[cfg(feature = "zk")]
    Zookeeper(crate::zk::ZkConfig),
}

impl StoreConfig {
    /// Open the store this configuration describes.
    pub fn open(&self) -> Result<Arc<dyn PatchStore>, StoreError> {
        match self {
            StoreConfig::Memory => Ok(Arc::new(MemStore::new())),
            StoreConfig::File { root } => Ok(FsStore::open(root)?),
            #[cfg(feature = "zk")]
            StoreConfig::Zookeeper(config) => Ok(crate::zk::ZkStore::open(config.clone())?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_memory() {
        let store = StoreConfig::Memory.open().unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_open_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::File {
            root: dir.path().join("store"),
        };
        let store = config.open().unwrap();
        assert!(store.list().unwrap().is_empty());
        assert!(dir.path().join("store").is_dir());
    }
}
