// plugin_protocol/src/test_util.rs
//! An in-memory plugin loader for host tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::message::{InvokeExtensionParams, MessageType, RegisterPluginParams, RemoteError, UnregisterPluginParams};
use crate::transport::{TransportError, Worker};
use crate::worker_runtime::{WorkerConfig, WorkerContext, WorkerHandler, run_worker};

#[derive(Debug, Default)]
struct LoaderState {
    plugins: BTreeMap<String, RegisterPluginParams>,
    requests: Vec<MessageType>,
    initialized: bool,
    disposed: bool,
}

/// Keeps plugins in a map and forwards `invokeExtension` to the host: the
/// extension point is used as the IPC channel and the args are passed as-is.
#[derive(Debug, Clone, Default)]
pub struct RecordingLoader {
    state: Arc<Mutex<LoaderState>>,
}

/// Read side of a [`RecordingLoader`], kept by the test.
#[derive(Debug, Clone)]
pub struct LoaderProbe {
    state: Arc<Mutex<LoaderState>>,
}

impl RecordingLoader {
    pub fn with_probe() -> (Self, LoaderProbe) {
        let loader = Self::default();
        let probe = LoaderProbe { state: loader.state.clone() };
        (loader, probe)
    }

    /// Spawns a worker thread running this loader.
    pub fn spawn(&self, name: &str) -> Result<Worker, TransportError> {
        let loader = self.clone();
        Worker::spawn(name, move |port| run_worker(port, loader, WorkerConfig::default()))
    }
}

impl LoaderProbe {
    pub async fn plugin_ids(&self) -> Vec<String> {
        self.state.lock().await.plugins.keys().cloned().collect()
    }

    pub async fn requests(&self) -> Vec<MessageType> {
        self.state.lock().await.requests.clone()
    }

    pub async fn initialized(&self) -> bool {
        self.state.lock().await.initialized
    }

    pub async fn disposed(&self) -> bool {
        self.state.lock().await.disposed
    }
}

fn parse<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, RemoteError> {
    serde_json::from_value(payload).map_err(|e| RemoteError::new(format!("invalid payload: {e}")))
}

#[async_trait]
impl WorkerHandler for RecordingLoader {
    async fn handle(&mut self, kind: MessageType, payload: Value, ctx: &WorkerContext) -> Result<Value, RemoteError> {
        self.state.lock().await.requests.push(kind);
        let log = ctx.logger().with_context("recording-loader");

        match kind {
            MessageType::RegisterPlugin => {
                let params: RegisterPluginParams = parse(payload)?;
                let mut state = self.state.lock().await;
                if state.plugins.contains_key(&params.plugin_id) {
                    return Err(RemoteError::new(format!("plugin `{}` is already registered", params.plugin_id)));
                }
                log.info(format!("registered {}", params.plugin_id));
                let id = params.plugin_id.clone();
                state.plugins.insert(id.clone(), params);
                Ok(json!({ "pluginId": id }))
            }
            MessageType::UnregisterPlugin => {
                let params: UnregisterPluginParams = parse(payload)?;
                let removed = self.state.lock().await.plugins.remove(&params.plugin_id).is_some();
                Ok(json!({ "removed": removed }))
            }
            MessageType::InitializePlugins => {
                let mut state = self.state.lock().await;
                state.initialized = true;
                Ok(json!({ "initialized": state.plugins.len() }))
            }
            MessageType::DisposePlugins => {
                let mut state = self.state.lock().await;
                state.disposed = true;
                state.initialized = false;
                Ok(Value::Null)
            }
            MessageType::InvokeExtension => {
                let params: InvokeExtensionParams = parse(payload)?;
                if !self.state.lock().await.plugins.contains_key(&params.plugin_id) {
                    return Err(RemoteError::new(format!("unknown plugin `{}`", params.plugin_id)));
                }
                match ctx.ipc().invoke(&params.extension_point, params.args).await {
                    Ok(result) => Ok(result),
                    Err(e) => {
                        let err = RemoteError::new(e.to_string());
                        log.error_with("extension call failed", err.clone());
                        Err(err)
                    }
                }
            }
            other => Err(RemoteError::new(format!("unsupported request `{other}`"))),
        }
    }
}
