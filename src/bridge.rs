// src/bridge.rs
//! Host capability gateway.
//!
//! Every host capability a plugin may call is a named channel in an
//! [`IpcBridge`]. Workers never reach the bridge directly: the connection's
//! dispatch loop calls [`IpcBridge::invoke`] on their behalf for each
//! `ipc-call` it receives.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("a handler is already registered for channel `{0}`")]
    DuplicateChannel(String),

    #[error("no handler registered for channel `{0}`")]
    UnknownChannel(String),

    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

/// Passed as the first argument to every handler.
///
/// Calls arriving over the bridge did not come through a real transport, so
/// the event only carries the host process identity. Its shape is the same for
/// every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeEvent {
    pub process_id: u32,
    pub synthetic: bool,
}

impl InvokeEvent {
    pub fn synthetic() -> Self {
        Self { process_id: std::process::id(), synthetic: true }
    }
}

#[async_trait]
pub trait IpcHandler: Send + Sync + 'static {
    async fn handle(&self, event: InvokeEvent, args: Vec<Value>) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> IpcHandler for F
where
    F: Fn(InvokeEvent, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn handle(&self, event: InvokeEvent, args: Vec<Value>) -> anyhow::Result<Value> {
        (self)(event, args).await
    }
}

#[derive(Default)]
pub struct IpcBridge {
    handlers: DashMap<String, Arc<dyn IpcHandler>>,
}

impl std::fmt::Debug for IpcBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcBridge").field("channels", &self.list_channels()).finish()
    }
}

impl IpcBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a capability. Every worker talking to this bridge can call it, so
    /// this belongs to host start-up rather than to individual calls.
    pub fn register<H: IpcHandler>(&self, channel: impl Into<String>, handler: H) -> Result<(), BridgeError> {
        let channel = channel.into();
        match self.handlers.entry(channel) {
            Entry::Occupied(e) => Err(BridgeError::DuplicateChannel(e.key().clone())),
            Entry::Vacant(e) => {
                info!(channel = %e.key(), "registered ipc handler");
                e.insert(Arc::new(handler));
                Ok(())
            }
        }
    }

    /// Removing a channel that is not there is fine. Returns whether one was removed.
    pub fn unregister(&self, channel: &str) -> bool {
        let removed = self.handlers.remove(channel).is_some();
        if removed {
            info!(%channel, "unregistered ipc handler");
        }
        removed
    }

    pub async fn invoke(&self, channel: &str, args: Vec<Value>) -> Result<Value, BridgeError> {
        // clone out of the map so no shard lock is held across the await
        let handler = self
            .handlers
            .get(channel)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| BridgeError::UnknownChannel(channel.to_string()))?;

        debug!(%channel, args = args.len(), "invoking ipc handler");
        Ok(handler.handle(InvokeEvent::synthetic(), args).await?)
    }

    /// Sorted channel names, for diagnostics only. This says nothing about
    /// what a particular worker is allowed to call.
    pub fn list_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        channels.sort();
        channels
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.handlers.contains_key(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn echo_bridge() -> IpcBridge {
        let bridge = IpcBridge::new();
        bridge
            .register("echo", |_event: InvokeEvent, args: Vec<Value>| async move {
                Ok::<_, anyhow::Error>(args.into_iter().next().unwrap_or(Value::Null))
            })
            .unwrap();
        bridge
    }

    #[tokio::test]
    async fn invoke_returns_handler_value() {
        let bridge = echo_bridge();
        let out = bridge.invoke("echo", vec![json!("hi"), json!(2)]).await.unwrap();
        assert_eq!(out, json!("hi"));
    }

    #[tokio::test]
    async fn unknown_channel_names_the_channel() {
        let bridge = echo_bridge();
        let err = bridge.invoke("ghost", vec![]).await.unwrap_err();
        assert!(matches!(err, BridgeError::UnknownChannel(_)));
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn duplicate_registration_keeps_first_handler() {
        let bridge = echo_bridge();
        let err = bridge
            .register("echo", |_e: InvokeEvent, _a: Vec<Value>| async move { Ok::<_, anyhow::Error>(json!("second")) })
            .unwrap_err();
        assert!(matches!(err, BridgeError::DuplicateChannel(ref c) if c == "echo"));
        assert_eq!(bridge.invoke("echo", vec![json!("first")]).await.unwrap(), json!("first"));
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let bridge = echo_bridge();
        assert!(bridge.unregister("echo"));
        assert!(!bridge.unregister("echo"));
        assert!(!bridge.unregister("never-there"));
        assert!(bridge.list_channels().is_empty());
    }

    #[tokio::test]
    async fn handler_errors_propagate_unchanged() {
        let bridge = IpcBridge::new();
        bridge
            .register("fs.read", |_e: InvokeEvent, _a: Vec<Value>| async move {
                Err::<Value, _>(anyhow::anyhow!("permission denied"))
            })
            .unwrap();
        let err = bridge.invoke("fs.read", vec![]).await.unwrap_err();
        assert!(matches!(err, BridgeError::Handler(_)));
        assert_eq!(err.to_string(), "permission denied");
    }

    #[tokio::test]
    async fn event_shape_is_stable_across_calls() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let bridge = IpcBridge::new();
        let sink = seen.clone();
        bridge
            .register("probe", move |event: InvokeEvent, _a: Vec<Value>| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(event);
                    Ok::<_, anyhow::Error>(Value::Null)
                }
            })
            .unwrap();

        bridge.invoke("probe", vec![]).await.unwrap();
        bridge.invoke("probe", vec![json!(1)]).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], seen[1]);
        assert!(seen[0].synthetic);
        assert_eq!(seen[0].process_id, std::process::id());
    }

    #[test]
    fn list_channels_is_sorted() {
        let bridge = echo_bridge();
        bridge
            .register("app.version", |_e: InvokeEvent, _a: Vec<Value>| async move { Ok::<_, anyhow::Error>(json!("1.0")) })
            .unwrap();
        assert_eq!(bridge.list_channels(), vec!["app.version".to_string(), "echo".to_string()]);
        assert!(bridge.contains("echo"));
    }
}
