//! Distributed append lock.
//!
//! The classic fair-queue recipe: every contender creates an
//! ephemeral-sequential child under the lock path; the lowest sequence
//! number holds the lock; everyone else sets a one-shot watch on the
//! next-lowest sibling and blocks until it disappears, then re-checks.
//! Waiters are served in sequence order, so there is no starvation.
//!
//! Releasing deletes the own node. If the holder's process or session
//! dies instead, the ephemeral node is removed by the coordination
//! service and the next waiter proceeds — the lock heals itself without
//! intervention.

use std::sync::mpsc;

use tracing::{debug, warn};
use zookeeper::{Acl, CreateMode, WatchedEvent, ZkError};

use crate::store::{LockGuard, LogLock, StorageError};

use super::{storage_err, ZkSession};

/// Lock node name prefix. The embedded random token lets a contender find
/// (and remove) a node it created right before losing the connection.
const LOCK_PREFIX: &str = "lk-";

/// A [`LogLock`] backed by an ephemeral-sequential queue.
#[derive(Debug, Clone)]
pub struct ZkLock {
    session: ZkSession,
    path: String,
}

impl ZkLock {
    pub(crate) fn new(session: ZkSession, path: String) -> Self {
        ZkLock { session, path }
    }

    fn child_path(&self, name: &str) -> String {
        format!("{}/{}", self.path, name)
    }

    /// Best-effort removal of any node carrying our token, for the case
    /// where a create raced a connection loss and we never learned its
    /// name.
    fn sweep_token(&self, token: &str) {
        let Ok(client) = self.session.client() else {
            return;
        };
        if let Ok(children) = client.get_children(&self.path, false) {
            for child in children.iter().filter(|child| child.contains(token)) {
                let _ = client.delete(&self.child_path(child), None);
            }
        }
    }
}

impl LogLock for ZkLock {
    fn acquire(&self) -> Result<LockGuard, StorageError> {
        let client = self.session.client()?;
        let token = hex::encode(rand::random::<[u8; 8]>());
        let created = client.create(
            &self.child_path(&format!("{LOCK_PREFIX}{token}-")),
            Vec::new(),
            Acl::open_unsafe().clone(),
            CreateMode::EphemeralSequential,
        );
        let my_path = match created {
            Ok(path) => path,
            Err(err) => {
                self.sweep_token(&token);
                return Err(storage_err("acquire append lock", err));
            }
        };
        let my_name = my_path
            .rsplit('/')
            .next()
            .expect("created path has a final segment")
            .to_string();
        let Some(my_seq) = sequence_of(&my_name) else {
            self.sweep_token(&token);
            return Err(StorageError::Coordination(format!(
                "unexpected lock node name {my_name:?}"
            )));
        };

        loop {
            let children = match client.get_children(&self.path, false) {
                Ok(children) => children,
                Err(err) => {
                    self.sweep_token(&token);
                    return Err(storage_err("list lock queue", err));
                }
            };
            // the next-lowest sequence ahead of ours, if any
            let predecessor = children
                .iter()
                .filter_map(|child| Some((sequence_of(child)?, child)))
                .filter(|(seq, _)| *seq < my_seq)
                .max_by_key(|(seq, _)| *seq)
                .map(|(_, child)| child.clone());

            let Some(predecessor) = predecessor else {
                break; // lowest sequence: the lock is ours
            };

            let (tx, rx) = mpsc::channel::<()>();
            let armed = client.exists_w(
                &self.child_path(&predecessor),
                move |_event: WatchedEvent| {
                    let _ = tx.send(());
                },
            );
            match armed {
                // wait for the one-shot watch, then re-check the queue
                Ok(Some(_)) => {
                    let _ = rx.recv();
                }
                // predecessor already gone
                Ok(None) | Err(ZkError::NoNode) => {}
                Err(err) => {
                    self.sweep_token(&token);
                    return Err(storage_err("watch lock predecessor", err));
                }
            }
        }

        debug!(node = %my_name, "append lock acquired");
        let session = self.session.clone();
        Ok(LockGuard::new(move || match session.client() {
            Ok(client) => match client.delete(&my_path, None) {
                Ok(()) | Err(ZkError::NoNode) => {}
                Err(err) => warn!(
                    node = %my_path,
                    error = %err,
                    "failed to release append lock; the ephemeral node expires with the session"
                ),
            },
            Err(err) => warn!(error = %err, "cannot release append lock"),
        }))
    }
}

/// Ephemeral-sequential names end in a ten-digit sequence number.
fn sequence_of(name: &str) -> Option<i64> {
    if name.len() < 10 || !name.starts_with(LOCK_PREFIX) {
        return None;
    }
    name[name.len() - 10..].parse().ok()
}
