// plugin_protocol/src/ipc_client.rs
//! Worker-side client for calling host capabilities ("invoke IPC").
//!
//! Calls are matched to responses purely by correlation id, so any number of
//! them may be outstanding and their responses may arrive in any order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::id::generate_id;
use crate::message::IpcCallMessage;
use crate::schema::{Validation, validate_ipc_response};
use crate::transport::PortSender;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("IPC call to {channel} timed out")]
    Timeout { channel: String },

    /// The host handler (or the host itself) reported a failure.
    #[error("{0}")]
    Remote(String),

    #[error("host connection closed")]
    Disconnected,

    #[error("could not decode IPC result: {0}")]
    Decode(String),
}

type Responder = oneshot::Sender<Result<Value, RpcError>>;

/// Removes a pending call when its `invoke` future goes away, answered or not.
struct PendingEntry<'a> {
    pending: &'a DashMap<String, Responder>,
    id: &'a str,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.id);
    }
}

#[derive(Clone)]
pub struct IpcClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    sender: PortSender,
    pending: DashMap<String, Responder>,
    call_timeout: Duration,
    closed: AtomicBool,
}

impl std::fmt::Debug for IpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcClient")
            .field("pending", &self.inner.pending.len())
            .field("call_timeout", &self.inner.call_timeout)
            .finish()
    }
}

impl IpcClient {
    pub fn new(sender: PortSender, call_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                sender,
                pending: DashMap::new(),
                call_timeout,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Calls the host handler registered for `channel` and waits for its
    /// result, at most for the configured call timeout. Dropping the future
    /// cancels the call; a response that still arrives is ignored.
    pub async fn invoke(&self, channel: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RpcError::Disconnected);
        }

        let id = generate_id(Some("ipc"));
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id.clone(), tx);
        let _entry = PendingEntry { pending: &self.inner.pending, id: &id };

        // close() may have drained the table between the check and the insert
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RpcError::Disconnected);
        }

        if self.inner.sender.post_json(&IpcCallMessage::new(id.clone(), channel, args)).is_err() {
            return Err(RpcError::Disconnected);
        }
        debug!(%id, %channel, "ipc call sent");

        match timeout(self.inner.call_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RpcError::Disconnected),
            Err(_) => {
                warn!(%id, %channel, "ipc call timed out");
                Err(RpcError::Timeout { channel: channel.to_string() })
            }
        }
    }

    /// Like [`invoke`](Self::invoke) but deserializes the result.
    pub async fn invoke_as<T: DeserializeOwned>(&self, channel: &str, args: Vec<Value>) -> Result<T, RpcError> {
        let value = self.invoke(channel, args).await?;
        serde_json::from_value(value).map_err(|e| RpcError::Decode(e.to_string()))
    }

    /// Feeds an inbound `ipc-response`. Returns `true` when it settled a
    /// pending call; malformed and late responses are dropped.
    pub fn handle_response(&self, raw: &Value) -> bool {
        let response = match validate_ipc_response(raw) {
            Validation::Success(response) => response,
            Validation::Failure(err) => {
                warn!(%err, "dropping malformed ipc-response");
                return false;
            }
        };

        let Some((_, responder)) = self.inner.pending.remove(&response.id) else {
            debug!(id = %response.id, "ipc-response has no pending call");
            return false;
        };

        let outcome = match response.error {
            Some(error) => Err(RpcError::Remote(error)),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        let _ = responder.send(outcome);
        true
    }

    /// Rejects every outstanding call and refuses new ones.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let ids: Vec<String> = self.inner.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, responder)) = self.inner.pending.remove(&id) {
                let _ = responder.send(Err(RpcError::Disconnected));
            }
        }
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }
}
