//! Supervised Zookeeper connection.
//!
//! The `zookeeper` client rides out short disconnects on its own, but an
//! expired session leaves the handle permanently unusable. A supervisor
//! thread watches connection-state transitions: on closure it re-connects
//! with bounded backoff and swaps a fresh client in; on auth failure or
//! retry exhaustion it poisons the session, after which every operation
//! fails fatally — the node is expected to stop rather than keep serving
//! while partitioned.
//!
//! The supervisor also watches the ensemble's dynamic configuration node
//! and feeds reconfigured member addresses into the connect string used
//! for reconnects, without disturbing a healthy session.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Weak,
    },
    thread,
    time::Duration,
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use zookeeper::{WatchedEvent, WatchedEventType, ZkError, ZkState, ZooKeeper};

use crate::store::StorageError;

/// The ensemble's dynamic configuration node.
const CONFIG_NODE: &str = "/zookeeper/config";

/// Configuration of a [`ZkStore`](crate::zk::ZkStore).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZkConfig {
    /// Comma-separated `host:port` pairs of the ensemble members.
    pub connect: String,
    /// Root path all store data lives under.
    pub root: String,
    /// Session timeout negotiated with the ensemble.
    pub session_timeout: Duration,
    /// Reconnect attempts after a session expires before the session is
    /// poisoned.
    pub reconnect_retries: u32,
}

impl Default for ZkConfig {
    fn default() -> Self {
        ZkConfig {
            connect: "127.0.0.1:2181".to_string(),
            root: "/deltalog".to_string(),
            session_timeout: Duration::from_secs(10),
            reconnect_retries: 5,
        }
    }
}

enum Supervision {
    State(ZkState),
    EnsembleChanged,
}

/// A shared, supervised connection to the coordination service.
#[derive(Clone)]
pub struct ZkSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    session_timeout: Duration,
    reconnect_retries: u32,
    /// Current ensemble connect string; updated on reconfiguration.
    connect: RwLock<String>,
    client: RwLock<Arc<ZooKeeper>>,
    poisoned: AtomicBool,
    closed: AtomicBool,
}

impl fmt::Debug for ZkSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZkSession")
            .field("connect", &*self.inner.connect.read())
            .field("poisoned", &self.inner.poisoned.load(Ordering::SeqCst))
            .finish()
    }
}

impl ZkSession {
    /// Connect to the ensemble and start supervision.
    pub fn connect(config: &ZkConfig) -> Result<Self, StorageError> {
        let (tx, rx) = mpsc::channel();
        let client = open_client(&config.connect, config.session_timeout)
            .map_err(|err| super::storage_err("connect", err))?;
        register_state_listener(&client, tx.clone());
        let inner = Arc::new(SessionInner {
            session_timeout: config.session_timeout,
            reconnect_retries: config.reconnect_retries,
            connect: RwLock::new(config.connect.clone()),
            client: RwLock::new(Arc::new(client)),
            poisoned: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        refresh_ensemble(&inner, &tx);
        let weak = Arc::downgrade(&inner);
        thread::Builder::new()
            .name("zk-supervisor".to_string())
            .spawn(move || supervise(weak, tx, rx))
            .map_err(StorageError::Io)?;
        Ok(ZkSession { inner })
    }

    /// The current client handle.
    ///
    /// Fails with [`StorageError::Fatal`] once the session is poisoned or
    /// closed; callers must treat that as a signal to stop serving.
    pub(crate) fn client(&self) -> Result<Arc<ZooKeeper>, StorageError> {
        if self.inner.poisoned.load(Ordering::SeqCst) {
            return Err(StorageError::Fatal(
                "coordination session is poisoned; refusing to serve".to_string(),
            ));
        }
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Fatal(
                "coordination session is closed".to_string(),
            ));
        }
        Ok(self.inner.client.read().clone())
    }

    /// Stop supervision. Subsequent operations fail.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }
}

fn open_client(connect: &str, timeout: Duration) -> Result<ZooKeeper, ZkError> {
    ZooKeeper::connect(connect, timeout, |_event: WatchedEvent| {})
}

fn register_state_listener(client: &ZooKeeper, tx: Sender<Supervision>) {
    let _ = client.add_listener(move |state| {
        let _ = tx.send(Supervision::State(state));
    });
}

fn supervise(inner: Weak<SessionInner>, tx: Sender<Supervision>, rx: Receiver<Supervision>) {
    loop {
        let event = match rx.recv_timeout(Duration::from_secs(30)) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => return,
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        match event {
            None => {}
            Some(Supervision::State(state)) => match state {
                ZkState::Connected | ZkState::ConnectedReadOnly => {
                    debug!("coordination service connected");
                }
                ZkState::AuthFailed => {
                    error!("authentication to the coordination service failed; failing fast");
                    inner.poisoned.store(true, Ordering::SeqCst);
                    return;
                }
                ZkState::Closed => {
                    // session expired; the handle is unusable from here on
                    reconnect(&inner, &tx);
                    if inner.poisoned.load(Ordering::SeqCst) {
                        return;
                    }
                }
                state => {
                    debug!(?state, "coordination connection suspended; client retrying");
                }
            },
            Some(Supervision::EnsembleChanged) => refresh_ensemble(&inner, &tx),
        }
    }
}

fn reconnect(inner: &Arc<SessionInner>, tx: &Sender<Supervision>) {
    let mut delay = Duration::from_millis(500);
    for attempt in 1..=inner.reconnect_retries {
        let connect = inner.connect.read().clone();
        info!(attempt, %connect, "re-establishing coordination session");
        match open_client(&connect, inner.session_timeout) {
            Ok(client) => {
                register_state_listener(&client, tx.clone());
                *inner.client.write() = Arc::new(client);
                refresh_ensemble(inner, tx);
                info!("coordination session re-established");
                return;
            }
            Err(err) => {
                warn!(attempt, error = %err, "reconnect attempt failed");
                thread::sleep(delay);
                delay = (delay * 2).min(Duration::from_secs(8));
            }
        }
    }
    error!("could not re-establish the coordination session; failing fast rather than serving stale data");
    inner.poisoned.store(true, Ordering::SeqCst);
}

/// Re-arm the configuration watch and pick up reconfigured member
/// addresses.
fn refresh_ensemble(inner: &Arc<SessionInner>, tx: &Sender<Supervision>) {
    let client = inner.client.read().clone();
    let sender = tx.clone();
    let armed = client.exists_w(CONFIG_NODE, move |event: WatchedEvent| {
        if let WatchedEventType::NodeDataChanged = event.event_type {
            let _ = sender.send(Supervision::EnsembleChanged);
        }
    });
    match armed {
        Ok(Some(_)) => {}
        Ok(None) | Err(ZkError::NoNode) => {
            debug!("no dynamic ensemble configuration node");
            return;
        }
        Err(err) => {
            warn!(error = %err, "failed to watch the ensemble configuration");
            return;
        }
    }
    match client.get_data(CONFIG_NODE, false) {
        Ok((bytes, _stat)) => {
            if let Some(connect) = client_addrs_from_config(&bytes) {
                let mut current = inner.connect.write();
                if *current != connect {
                    info!(%connect, "coordination ensemble reconfigured");
                    *current = connect;
                }
            }
        }
        Err(ZkError::NoNode) => {}
        Err(err) => warn!(error = %err, "failed to read the ensemble configuration"),
    }
}

/// Extract client addresses from a dynamic ensemble configuration.
///
/// Lines look like
/// `server.1=host:2888:3888:participant;0.0.0.0:2181` — the part after
/// `;` is the client endpoint, with `0.0.0.0` or a missing host standing
/// in for the server's own address.
fn client_addrs_from_config(bytes: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(bytes).ok()?;
    let mut addrs = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if !line.starts_with("server.") {
            continue;
        }
        let Some((_, value)) = line.split_once('=') else {
            continue;
        };
        let server_host = value.split(':').next().unwrap_or_default();
        let Some((_, client)) = value.split_once(';') else {
            continue;
        };
        let addr = match client.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && host != "0.0.0.0" => {
                format!("{host}:{port}")
            }
            Some((_, port)) => format!("{server_host}:{port}"),
            None => format!("{server_host}:{client}"),
        };
        addrs.push(addr);
    }
    (!addrs.is_empty()).then(|| addrs.join(","))
}
