// src/connection/mod.rs
//! Host-side supervisor for one plugin worker.
//!
//! A [`Connection`] owns at most one worker at a time and walks it through
//! `Stopped → Starting → Running → Stopping → Stopped`. A worker that dies on
//! its own drops the connection straight back to `Stopped`.
//!
//! `start()` resolves only after the worker's `ready` handshake. Outer calls
//! (`send_message`) are correlated by id and bounded by the connection's call
//! timeout; teardown, requested or not, fails every call still waiting with
//! [`ConnectionError::ConnectionClosed`].

mod dispatch;
mod pending;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use plugin_protocol::id::generate_id;
use plugin_protocol::{Envelope, MessageType, RemoteError, TransportError, Worker, WorkerSender};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::bridge::IpcBridge;
use pending::PendingCalls;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// How long `stop()` waits for the event loop to drain after terminating.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConnectionError {
    /// `start()` while the previous worker is still being torn down.
    #[error("connection already has a worker that is still shutting down")]
    AlreadyRunning,

    #[error("connection is not started")]
    NotStarted,

    #[error("`{0}` is a reply, not a request")]
    NotARequest(MessageType),

    #[error("message {id} timed out after {timeout_ms} ms")]
    Timeout { id: String, timeout_ms: u128 },

    /// The worker answered with `error`; the remote stack is kept.
    #[error("{0}")]
    Remote(RemoteError),

    #[error("connection closed before a response arrived")]
    ConnectionClosed,

    #[error("worker exited with code {code} before it was ready")]
    WorkerExited { code: i32 },

    #[error("could not spawn worker: {0}")]
    Spawn(String),

    #[error("could not encode payload: {0}")]
    Serialize(String),
}

impl ConnectionError {
    /// The worker-side stack of a remote failure, if it sent one.
    pub fn remote_stack(&self) -> Option<&str> {
        match self {
            ConnectionError::Remote(err) => err.stack.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Starts the worker thread for a connection. Called once per `start()`.
pub trait WorkerSpawner: Send + Sync + 'static {
    fn spawn(&self, name: &str) -> Result<Worker, TransportError>;
}

impl<F> WorkerSpawner for F
where
    F: Fn(&str) -> Result<Worker, TransportError> + Send + Sync + 'static,
{
    fn spawn(&self, name: &str) -> Result<Worker, TransportError> {
        (self)(name)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub name: String,
    pub call_timeout: Duration,
    /// Channels this connection's worker may call. `None` means every channel
    /// registered on the bridge.
    pub allowed_channels: Option<HashSet<String>>,
}

impl ConnectionOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), call_timeout: DEFAULT_CALL_TIMEOUT, allowed_channels: None }
    }

    pub fn with_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn allow_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_channels = Some(channels.into_iter().map(Into::into).collect());
        self
    }
}

struct ActiveWorker {
    worker: Worker,
    sender: WorkerSender,
    dispatch: JoinHandle<()>,
}

#[derive(Default)]
struct Slot {
    active: Option<ActiveWorker>,
    last_exit: Option<i32>,
}

struct Inner {
    name: String,
    spawner: Box<dyn WorkerSpawner>,
    bridge: Arc<IpcBridge>,
    allowed: Option<HashSet<String>>,
    call_timeout: Duration,
    state: watch::Sender<ConnectionState>,
    slot: Mutex<Slot>,
    pending: PendingCalls,
}

/// Cheap to clone; all clones drive the same worker.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

impl Connection {
    pub fn new<S: WorkerSpawner>(options: ConnectionOptions, bridge: Arc<IpcBridge>, spawner: S) -> Self {
        let (state, _) = watch::channel(ConnectionState::Stopped);
        Self {
            inner: Arc::new(Inner {
                name: options.name,
                spawner: Box::new(spawner),
                bridge,
                allowed: options.allowed_channels,
                call_timeout: options.call_timeout,
                state,
                slot: Mutex::new(Slot::default()),
                pending: PendingCalls::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Follows state changes, e.g. to notice a worker crash.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn call_timeout(&self) -> Duration {
        self.inner.call_timeout
    }

    /// Spawns the worker and waits for its `ready`. Concurrent callers share
    /// the same start attempt.
    pub async fn start(&self) -> Result<(), ConnectionError> {
        let mut states = {
            let mut slot = self.inner.slot.lock().await;
            match self.state() {
                ConnectionState::Running => {
                    warn!(connection = %self.inner.name, "start() on a running connection");
                    return Ok(());
                }
                ConnectionState::Stopping => return Err(ConnectionError::AlreadyRunning),
                ConnectionState::Starting => {}
                ConnectionState::Stopped => {
                    let mut worker = self
                        .inner
                        .spawner
                        .spawn(&self.inner.name)
                        .map_err(|e| ConnectionError::Spawn(e.to_string()))?;
                    let events = worker
                        .take_events()
                        .ok_or_else(|| ConnectionError::Spawn("worker events already taken".into()))?;
                    let sender = worker.sender();

                    slot.last_exit = None;
                    self.inner.state.send_replace(ConnectionState::Starting);
                    let dispatch = tokio::spawn(dispatch::run(Arc::downgrade(&self.inner), events, sender.clone()));
                    slot.active = Some(ActiveWorker { worker, sender, dispatch });
                    info!(connection = %self.inner.name, "worker spawned, waiting for ready");
                }
            }
            self.inner.state.subscribe()
        };

        let reached = match states.wait_for(|s| *s != ConnectionState::Starting).await {
            Ok(state) => *state,
            Err(_) => ConnectionState::Stopped,
        };

        match reached {
            ConnectionState::Running => Ok(()),
            _ => match self.inner.slot.lock().await.last_exit {
                Some(code) => Err(ConnectionError::WorkerExited { code }),
                None => Err(ConnectionError::ConnectionClosed),
            },
        }
    }

    /// Terminates the worker. Calls still waiting fail with `ConnectionClosed`.
    pub async fn stop(&self) {
        let active = {
            let mut slot = self.inner.slot.lock().await;
            if matches!(self.state(), ConnectionState::Stopped | ConnectionState::Stopping) {
                debug!(connection = %self.inner.name, "stop() on a stopped connection");
                return;
            }
            self.inner.state.send_replace(ConnectionState::Stopping);
            slot.active.take()
        };

        let rejected = self.inner.pending.reject_all(|| ConnectionError::ConnectionClosed);
        if rejected > 0 {
            debug!(connection = %self.inner.name, rejected, "rejected pending calls on stop");
        }

        if let Some(ActiveWorker { mut worker, dispatch, .. }) = active {
            worker.terminate();
            let abort = dispatch.abort_handle();
            if timeout(STOP_GRACE, dispatch).await.is_err() {
                warn!(connection = %self.inner.name, "worker did not exit in time, detaching");
                abort.abort();
            }
        }

        self.inner.state.send_replace(ConnectionState::Stopped);
        info!(connection = %self.inner.name, "connection stopped");
    }

    /// Sends an outer request and waits for the matching `response`/`error`.
    /// Dropping the returned future abandons the call and frees its entry.
    pub async fn send_message<P: Serialize>(&self, kind: MessageType, payload: P) -> Result<Value, ConnectionError> {
        if !kind.is_request() {
            return Err(ConnectionError::NotARequest(kind));
        }
        if self.state() != ConnectionState::Running {
            return Err(ConnectionError::NotStarted);
        }
        let sender = {
            let slot = self.inner.slot.lock().await;
            slot.active.as_ref().map(|a| a.sender.clone())
        }
        .ok_or(ConnectionError::NotStarted)?;

        let payload = serde_json::to_value(payload).map_err(|e| ConnectionError::Serialize(e.to_string()))?;
        let id = generate_id(Some("msg"));
        let response = self.inner.pending.register(&id);
        let _entry = self.inner.pending.guard(&id);

        // a teardown between the state check and the register would miss this entry
        if self.state() != ConnectionState::Running {
            return Err(ConnectionError::ConnectionClosed);
        }

        if let Err(err) = sender.post_json(&Envelope::new(kind, id.clone(), payload)) {
            debug!(connection = %self.inner.name, %id, %err, "could not post message");
            return Err(ConnectionError::ConnectionClosed);
        }
        debug!(connection = %self.inner.name, %id, %kind, "message sent");

        match timeout(self.inner.call_timeout, response).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ConnectionError::ConnectionClosed),
            Err(_) => {
                warn!(connection = %self.inner.name, %id, %kind, "message timed out");
                Err(ConnectionError::Timeout { id: id.clone(), timeout_ms: self.inner.call_timeout.as_millis() })
            }
        }
    }
}
