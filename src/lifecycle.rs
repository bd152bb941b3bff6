// src/lifecycle.rs
//! Plugin lifecycle over a connection.
//!
//! Each operation is a single `send_message` with a typed payload. The host
//! never looks inside the payloads; the worker's plugin loader gives them
//! meaning.

use dashmap::DashSet;
use plugin_protocol::MessageType;
use plugin_protocol::message::{InvokeExtensionParams, RegisterPluginParams, UnregisterPluginParams};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::connection::{Connection, ConnectionError, ConnectionState};

/// Owns the plugin-facing side of one connection. The connection is handed in
/// by whoever builds the session; there is no process-wide instance.
#[derive(Debug)]
pub struct PluginSession {
    connection: Connection,
    registered: DashSet<String>,
}

impl PluginSession {
    pub fn new(connection: Connection) -> Self {
        Self { connection, registered: DashSet::new() }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Plugin ids this session registered and has not unregistered yet.
    pub fn registered_plugins(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registered.iter().map(|id| id.key().clone()).collect();
        ids.sort();
        ids
    }

    pub async fn start(&self) -> Result<(), ConnectionError> {
        self.connection.start().await
    }

    pub async fn register_plugin(&self, params: RegisterPluginParams) -> Result<Value, ConnectionError> {
        let plugin_id = params.plugin_id.clone();
        let result = self.connection.send_message(MessageType::RegisterPlugin, &params).await?;
        self.registered.insert(plugin_id.clone());
        info!(connection = %self.connection.name(), %plugin_id, "plugin registered");
        Ok(result)
    }

    pub async fn unregister_plugin(&self, plugin_id: &str) -> Result<Value, ConnectionError> {
        let params = UnregisterPluginParams { plugin_id: plugin_id.to_string() };
        let result = self.connection.send_message(MessageType::UnregisterPlugin, &params).await?;
        self.registered.remove(plugin_id);
        info!(connection = %self.connection.name(), %plugin_id, "plugin unregistered");
        Ok(result)
    }

    pub async fn initialize_plugins(&self) -> Result<Value, ConnectionError> {
        self.connection.send_message(MessageType::InitializePlugins, json!({})).await
    }

    pub async fn dispose_plugins(&self) -> Result<Value, ConnectionError> {
        self.connection.send_message(MessageType::DisposePlugins, json!({})).await
    }

    pub async fn invoke_extension(
        &self,
        plugin_id: &str,
        extension_point: &str,
        args: Vec<Value>,
    ) -> Result<Value, ConnectionError> {
        let params = InvokeExtensionParams {
            plugin_id: plugin_id.to_string(),
            extension_point: extension_point.to_string(),
            args,
        };
        self.connection.send_message(MessageType::InvokeExtension, &params).await
    }

    /// Disposes plugins if the worker is still up, then stops it. A failing
    /// dispose is logged and does not prevent the stop.
    pub async fn shutdown(&self) {
        if self.connection.state() == ConnectionState::Running {
            if let Err(err) = self.dispose_plugins().await {
                warn!(connection = %self.connection.name(), %err, "dispose failed during shutdown");
            }
        }
        self.connection.stop().await;
        self.registered.clear();
    }
}
