//! Zookeeper-coordinated patch store.
//!
//! Used when several independent server processes share one patch log:
//! appends are serialized across processes with an ephemeral-sequential
//! lock, the last committed head is mirrored into a small data node so an
//! attaching process can bootstrap its index, and patch bodies are stored
//! in znodes.
//!
//! Layout under the configured root:
//!
//! ```text
//! <root>/lock                       store-wide lock (create/retire)
//! <root>/logs/<name>                log container
//! <root>/logs/<name>/meta           dataset description
//! <root>/logs/<name>/state          last committed entry ("" = none)
//! <root>/logs/<name>/lock           append lock, ephemeral-sequential children
//! <root>/logs/<name>/patches/<id>   framed patch records
//! <root>/logs/<name>/retired        soft-delete marker
//! ```
//!
//! Zookeeper keeps its database in memory and is not designed for large
//! blobs (the default znode limit is 1M); patch bodies stored here should
//! be small.
//!
//! Connection supervision lives in [`ZkSession`]: suspended connections
//! are retried by the client, expired sessions are transparently
//! re-established with bounded backoff, and auth failures or retry
//! exhaustion poison the session so the node fails fast instead of
//! serving while partitioned.

use std::time::Duration;

use tracing::debug;
use zookeeper::{ZkError, ZooKeeper};

use crate::store::StorageError;

mod lock;
mod session;
mod store;

pub use self::lock::ZkLock;
pub use self::session::{ZkConfig, ZkSession};
pub use self::store::ZkStore;

pub(crate) const N_LOGS: &str = "logs";
pub(crate) const N_LOCK: &str = "lock";
pub(crate) const N_META: &str = "meta";
pub(crate) const N_STATE: &str = "state";
pub(crate) const N_PATCHES: &str = "patches";
pub(crate) const N_RETIRED: &str = "retired";

/// Join znode path segments.
pub(crate) fn zk_path(base: &str, segment: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), segment)
}

fn is_transient(err: &ZkError) -> bool {
    matches!(
        err,
        ZkError::ConnectionLoss | ZkError::OperationTimeout | ZkError::SessionExpired
    )
}

/// Map a Zookeeper error that survived retries to a [`StorageError`].
///
/// Auth failures and exhausted transient errors are fatal: the node must
/// stop rather than risk a split-brain append.
pub(crate) fn storage_err(what: &str, err: ZkError) -> StorageError {
    match err {
        ZkError::AuthFailed | ZkError::NoAuth => {
            StorageError::Fatal(format!("{what}: authentication failed: {err}"))
        }
        err if is_transient(&err) => StorageError::Fatal(format!(
            "{what}: coordination service unreachable after retries: {err}"
        )),
        err => StorageError::Coordination(format!("{what}: {err}")),
    }
}

enum OpError {
    Session(StorageError),
    Zk(ZkError),
}

/// Run a coordination call with bounded exponential backoff on transient
/// failures, re-fetching the client each attempt so a reconnected session
/// is picked up.
///
/// Semantic outcomes (`NoNode`, `NodeExists`, ...) must be converted to
/// `Ok` values inside `op`; everything that leaves here as an error went
/// through [`storage_err`].
pub(crate) fn with_retry<T, F>(
    session: &ZkSession,
    what: &str,
    mut op: F,
) -> Result<T, StorageError>
where
    F: FnMut(&ZooKeeper) -> Result<T, ZkError>,
{
    let policy = backoff::ExponentialBackoff {
        initial_interval: Duration::from_millis(100),
        max_interval: Duration::from_secs(2),
        max_elapsed_time: Some(Duration::from_secs(20)),
        ..Default::default()
    };
    let result = backoff::retry(policy, || {
        let client = match session.client() {
            Ok(client) => client,
            Err(err) => return Err(backoff::Error::Permanent(OpError::Session(err))),
        };
        match op(&client) {
            Ok(value) => Ok(value),
            Err(err) if is_transient(&err) => {
                debug!(op = what, error = %err, "transient coordination failure, retrying");
                Err(backoff::Error::Transient {
                    err: OpError::Zk(err),
                    retry_after: None,
                })
            }
            Err(err) => Err(backoff::Error::Permanent(OpError::Zk(err))),
        }
    });
    match result {
        Ok(value) => Ok(value),
        Err(backoff::Error::Permanent(err)) | Err(backoff::Error::Transient { err, .. }) => {
            match err {
                OpError::Session(err) => Err(err),
                OpError::Zk(err) => Err(storage_err(what, err)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zk_path() {
        assert_eq!(zk_path("/deltalog", "logs"), "/deltalog/logs");
        assert_eq!(zk_path("/deltalog/", "logs"), "/deltalog/logs");
    }

    #[test]
    fn test_error_classification() {
        assert!(matches!(
            storage_err("op", ZkError::AuthFailed),
            StorageError::Fatal(_)
        ));
        assert!(matches!(
            storage_err("op", ZkError::ConnectionLoss),
            StorageError::Fatal(_)
        ));
        assert!(matches!(
            storage_err("op", ZkError::BadVersion),
            StorageError::Coordination(_)
        ));
    }
}
