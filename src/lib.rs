//! Append-only patch logs for keeping dataset replicas in sync.
//!
//! A [`PatchLog`] is a strictly-ordered, append-only sequence of change
//! records ("patches") for one logical dataset. Replicas append patches and
//! later replay them in order to reconstruct or advance dataset state.
//!
//! Every patch names its predecessor through a `previous` header; the log
//! rejects any append whose `previous` does not match the current head, so
//! all replicas that drain the same log observe the same linear history.
//! Committed patches are assigned contiguous versions starting at `1`.
//!
//! Logs live in a [`store::PatchStore`], which manages their lifecycle
//! (create, attach, retire) over one of three backends:
//!
//! - [`store::memory::MemStore`]: process-local, no persistence. The
//!   reference implementation for the storage contract.
//! - [`store::fs::FsStore`]: one directory per log, one immutable file per
//!   committed version, written with a temp-file + atomic-rename commit
//!   point and recovered by a header-only directory scan.
//! - [`zk::ZkStore`] (feature `zk`): Zookeeper-coordinated, for several
//!   server processes sharing one log. Appends are serialized across
//!   processes with an ephemeral-sequential lock and the last committed
//!   head is mirrored into the coordination service.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod config;
mod ids;
mod log;
mod patch;
pub mod store;
#[cfg(feature = "zk")]
pub mod zk;

pub use self::config::StoreConfig;
pub use self::ids::{InvalidId, InvalidVersion, PatchId, Version};
pub use self::log::{AppendError, LogError, PatchLog, PatchLogInfo, RangeIter};
pub use self::patch::{DecodeError, LogEntry, Patch, PatchHeader};
pub use self::store::{DatasetDesc, PatchStore, StorageError, StoreError, StoreRegistry};
