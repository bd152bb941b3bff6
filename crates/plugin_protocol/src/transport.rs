// plugin_protocol/src/transport.rs
//! Dedicated-thread workers.
//!
//! A `Worker` owns one OS thread running its own current-thread tokio
//! runtime. Host and worker share no memory: they only exchange owned
//! `serde_json::Value`s over unbounded channels, so every message has to be
//! re-validated by whoever receives it.
//!
//! Everything the worker produces (messages, errors, its final exit code)
//! arrives on a single ordered event stream that exists before the thread is
//! started, so nothing a worker emits can be missed.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// Exit code reported when a worker is terminated from the outside.
pub const TERMINATED_EXIT_CODE: i32 = 1;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("the other side of the worker port is gone")]
    Disconnected,

    #[error("message could not be encoded: {0}")]
    Serialize(String),
}

/// What the host observes from a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Message(Value),
    Error(String),
    Exit(i32),
}

/// Worker-side handle used to post messages to the host.
#[derive(Debug, Clone)]
pub struct PortSender {
    tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl PortSender {
    pub fn post(&self, message: Value) -> Result<(), TransportError> {
        self.tx
            .send(WorkerEvent::Message(message))
            .map_err(|_| TransportError::Disconnected)
    }

    pub fn post_json<T: Serialize>(&self, message: &T) -> Result<(), TransportError> {
        let value = serde_json::to_value(message).map_err(|e| TransportError::Serialize(e.to_string()))?;
        self.post(value)
    }
}

/// The worker's end of the connection.
#[derive(Debug)]
pub struct WorkerPort {
    sender: PortSender,
    inbound: mpsc::UnboundedReceiver<Value>,
}

impl WorkerPort {
    /// Builds a detached port pair without a thread. The returned receiver
    /// sees what the worker posts; the sender feeds the worker's inbound side.
    pub fn pair() -> (Self, mpsc::UnboundedSender<Value>, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (to_worker, inbound) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        (Self { sender: PortSender { tx: event_tx }, inbound }, to_worker, events)
    }

    pub fn sender(&self) -> PortSender {
        self.sender.clone()
    }

    /// Next message from the host; `None` once the host dropped its side.
    pub async fn recv(&mut self) -> Option<Value> {
        self.inbound.recv().await
    }

    pub fn split(self) -> (PortSender, mpsc::UnboundedReceiver<Value>) {
        (self.sender, self.inbound)
    }
}

/// Host-side handle to post messages into a worker. Cheap to clone.
#[derive(Debug, Clone)]
pub struct WorkerSender {
    tx: mpsc::UnboundedSender<Value>,
}

impl WorkerSender {
    pub fn new(tx: mpsc::UnboundedSender<Value>) -> Self {
        Self { tx }
    }

    pub fn post(&self, message: Value) -> Result<(), TransportError> {
        self.tx.send(message).map_err(|_| TransportError::Disconnected)
    }

    pub fn post_json<T: Serialize>(&self, message: &T) -> Result<(), TransportError> {
        let value = serde_json::to_value(message).map_err(|e| TransportError::Serialize(e.to_string()))?;
        self.post(value)
    }
}

/// Host-side handle to a running worker thread.
///
/// Dropping the handle terminates the worker.
#[derive(Debug)]
pub struct Worker {
    name: String,
    sender: WorkerSender,
    events: Option<mpsc::UnboundedReceiver<WorkerEvent>>,
    terminate: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    /// Starts `entry` on a fresh thread named `name`.
    ///
    /// The worker ends with exit code 0 when `entry` returns `Ok`, and with a
    /// non-zero code (preceded by a `WorkerEvent::Error`) when it fails,
    /// panics or is terminated.
    pub fn spawn<F, Fut>(name: impl Into<String>, entry: F) -> Result<Self, TransportError>
    where
        F: FnOnce(WorkerPort) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        let name = name.into();
        let (port, to_worker, events) = WorkerPort::pair();
        let event_tx = port.sender.tx.clone();
        let (terminate_tx, terminate_rx) = oneshot::channel();

        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let code = run_entry(entry, port, terminate_rx, &event_tx);
                trace!(code, "worker thread finished");
                let _ = event_tx.send(WorkerEvent::Exit(code));
            })
            .map_err(|e| TransportError::SpawnFailed(e.to_string()))?;

        debug!(worker = %name, "worker thread spawned");
        Ok(Self {
            name,
            sender: WorkerSender::new(to_worker),
            events: Some(events),
            terminate: Some(terminate_tx),
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sender(&self) -> WorkerSender {
        self.sender.clone()
    }

    pub fn post(&self, message: Value) -> Result<(), TransportError> {
        self.sender.post(message)
    }

    /// The event stream can only be consumed by one listener.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<WorkerEvent>> {
        self.events.take()
    }

    /// Asks the worker to stop. Its future is dropped at the next await
    /// point and an `Exit(TERMINATED_EXIT_CODE)` event follows.
    pub fn terminate(&mut self) {
        if let Some(tx) = self.terminate.take() {
            debug!(worker = %self.name, "terminating worker");
            let _ = tx.send(());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.terminate();
        // the thread is detached; it reports its exit on the event stream
        self.thread.take();
    }
}

fn run_entry<F, Fut>(
    entry: F,
    port: WorkerPort,
    terminate_rx: oneshot::Receiver<()>,
    events: &mpsc::UnboundedSender<WorkerEvent>,
) -> i32
where
    F: FnOnce(WorkerPort) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = events.send(WorkerEvent::Error(format!("failed to build worker runtime: {e}")));
            return 1;
        }
    };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        runtime.block_on(async move {
            tokio::select! {
                res = entry(port) => Some(res),
                // a dropped sender counts as a termination request too
                _ = terminate_rx => None,
            }
        })
    }));

    match outcome {
        Ok(Some(Ok(()))) => 0,
        Ok(Some(Err(e))) => {
            let _ = events.send(WorkerEvent::Error(format!("{e:#}")));
            1
        }
        Ok(None) => TERMINATED_EXIT_CODE,
        Err(panic) => {
            let _ = events.send(WorkerEvent::Error(panic_message(panic.as_ref())));
            1
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("worker panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("worker panicked: {s}")
    } else {
        "worker panicked".to_string()
    }
}
