// src/demo.rs
//! A self-contained host + plugin loader pair, driven by `plugin_host demo`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use plugin_protocol::message::{InvokeExtensionParams, RegisterPluginParams, UnregisterPluginParams};
use plugin_protocol::{MessageType, RemoteError, Worker, WorkerConfig, WorkerContext, WorkerHandler, run_worker};
use serde_json::{Value, json};
use tracing::info;

use crate::bridge::{BridgeError, InvokeEvent, IpcBridge};
use crate::config::HostConfig;
use crate::connection::{Connection, ConnectionOptions};
use crate::lifecycle::PluginSession;

pub const DEMO_PLUGIN_ID: &str = "demo.greeter";

/// `echo` hands back its first argument, `host.version` the crate version.
pub fn demo_bridge() -> Result<IpcBridge, BridgeError> {
    let bridge = IpcBridge::new();
    bridge.register("echo", |_event: InvokeEvent, args: Vec<Value>| async move {
        Ok::<_, anyhow::Error>(args.into_iter().next().unwrap_or(Value::Null))
    })?;
    bridge.register("host.version", |_event: InvokeEvent, _args: Vec<Value>| async move {
        Ok::<_, anyhow::Error>(json!(env!("CARGO_PKG_VERSION")))
    })?;
    Ok(bridge)
}

/// Worker-side loader with one built-in extension point, `greet`, which
/// calls back into the host for the greeting and the host version.
#[derive(Debug, Default)]
pub struct DemoLoader {
    plugins: BTreeMap<String, RegisterPluginParams>,
    initialized: bool,
}

impl DemoLoader {
    async fn greet(&self, args: Vec<Value>, ctx: &WorkerContext) -> Result<Value, RemoteError> {
        let who = args.first().and_then(Value::as_str).unwrap_or("world").to_string();
        let remote = |e: plugin_protocol::RpcError| RemoteError::new(e.to_string());

        let greeting = ctx.ipc().invoke("echo", vec![json!(format!("hello, {who}"))]).await.map_err(remote)?;
        let version: String = ctx.ipc().invoke_as("host.version", vec![]).await.map_err(remote)?;
        Ok(json!({ "greeting": greeting, "hostVersion": version }))
    }
}

#[async_trait]
impl WorkerHandler for DemoLoader {
    async fn handle(&mut self, kind: MessageType, payload: Value, ctx: &WorkerContext) -> Result<Value, RemoteError> {
        let log = ctx.logger().with_context("demo-loader");
        let parse_err = |e: serde_json::Error| RemoteError::new(format!("invalid {kind} payload: {e}"));

        match kind {
            MessageType::RegisterPlugin => {
                let params: RegisterPluginParams = serde_json::from_value(payload).map_err(parse_err)?;
                if self.plugins.contains_key(&params.plugin_id) {
                    return Err(RemoteError::new(format!("plugin `{}` is already registered", params.plugin_id)));
                }
                log.info(format!("registered {} {}", params.name, params.version));
                let id = params.plugin_id.clone();
                self.plugins.insert(id.clone(), params);
                Ok(json!({ "pluginId": id }))
            }
            MessageType::UnregisterPlugin => {
                let params: UnregisterPluginParams = serde_json::from_value(payload).map_err(parse_err)?;
                Ok(json!({ "removed": self.plugins.remove(&params.plugin_id).is_some() }))
            }
            MessageType::InitializePlugins => {
                self.initialized = true;
                log.info(format!("initialized {} plugin(s)", self.plugins.len()));
                Ok(json!({ "initialized": self.plugins.len() }))
            }
            MessageType::DisposePlugins => {
                self.initialized = false;
                log.info("disposed plugins");
                Ok(Value::Null)
            }
            MessageType::InvokeExtension => {
                let params: InvokeExtensionParams = serde_json::from_value(payload).map_err(parse_err)?;
                if !self.initialized {
                    return Err(RemoteError::new("plugins are not initialized"));
                }
                if !self.plugins.contains_key(&params.plugin_id) {
                    return Err(RemoteError::new(format!("unknown plugin `{}`", params.plugin_id)));
                }
                match params.extension_point.as_str() {
                    "greet" => self.greet(params.args, ctx).await,
                    other => {
                        log.warn(format!("no extension point `{other}`"));
                        Err(RemoteError::new(format!("no extension point `{other}`")))
                    }
                }
            }
            other => Err(RemoteError::new(format!("unsupported request `{other}`"))),
        }
    }
}

/// Builds a connection whose worker runs a fresh [`DemoLoader`].
pub fn demo_connection(config: &HostConfig, bridge: Arc<IpcBridge>) -> Connection {
    let worker_config = WorkerConfig { call_timeout: config.call_timeout };
    Connection::new(
        ConnectionOptions::new("demo").with_timeout(config.call_timeout),
        bridge,
        move |name: &str| {
            let worker_config = worker_config.clone();
            Worker::spawn(name, move |port| run_worker(port, DemoLoader::default(), worker_config))
        },
    )
}

/// Runs the whole lifecycle once and returns each step's result.
pub async fn run_demo(config: &HostConfig) -> anyhow::Result<Vec<(&'static str, Value)>> {
    let bridge = Arc::new(demo_bridge()?);
    let session = PluginSession::new(demo_connection(config, bridge));
    let mut steps = Vec::new();

    session.start().await?;
    info!("demo worker started");

    let outcome = async {
        let register = RegisterPluginParams {
            plugin_id: DEMO_PLUGIN_ID.to_string(),
            name: "Greeter".to_string(),
            version: "1.0.0".to_string(),
            entry: "builtin:greeter".to_string(),
            settings: Value::Null,
        };
        steps.push(("registerPlugin", session.register_plugin(register).await?));
        steps.push(("initializePlugins", session.initialize_plugins().await?));
        steps.push(("invokeExtension", session.invoke_extension(DEMO_PLUGIN_ID, "greet", vec![json!("plugin host")]).await?));
        steps.push(("disposePlugins", session.dispose_plugins().await?));
        steps.push(("unregisterPlugin", session.unregister_plugin(DEMO_PLUGIN_ID).await?));
        Ok::<_, anyhow::Error>(())
    }
    .await;

    session.connection().stop().await;
    outcome?;
    Ok(steps)
}
