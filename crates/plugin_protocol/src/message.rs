// plugin_protocol/src/message.rs
//! Everything that crosses the host/worker boundary.
//!
//! Two correlation scopes share the same port:
//! * the **outer** protocol (`Envelope`), driven by the host: lifecycle
//!   requests go host → worker, `response`/`error`/`ready` come back;
//! * the **nested** protocol (`IpcCallMessage` / `IpcResponseMessage`),
//!   driven by the worker when it calls a host capability.
//!
//! The `log` lane is one-way (worker → host) and carries no id at all.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::id::generate_id;

pub const LOG_TAG: &str = "log";
pub const IPC_CALL_TAG: &str = "ipc-call";
pub const IPC_RESPONSE_TAG: &str = "ipc-response";

/// Message kinds of the outer (host-initiated) protocol.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum MessageType {
    // Lifecycle (host → worker)
    RegisterPlugin,
    UnregisterPlugin,
    InitializePlugins,
    DisposePlugins,
    InvokeExtension,

    // Replies (worker → host)
    Response,
    Error,
    Ready,
}

impl MessageType {
    /// `true` for the kinds a host sends and a worker has to answer.
    pub const fn is_request(&self) -> bool {
        matches!(
            self,
            MessageType::RegisterPlugin
                | MessageType::UnregisterPlugin
                | MessageType::InitializePlugins
                | MessageType::DisposePlugins
                | MessageType::InvokeExtension
        )
    }
}

/// Outer protocol envelope: `{ type, id, payload }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub id: String,
    #[serde(default)]
    pub payload: Value,
}

/// A failure reported by the other side of the boundary.
///
/// `stack` is whatever diagnostic trace the remote side could produce; it is
/// carried verbatim so the caller can see where the failure happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum LogTag {
    #[serde(rename = "log")]
    Log,
}

/// One-way log line forwarded from the worker to the host logger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LogMessage {
    #[serde(rename = "type")]
    pub tag: LogTag,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum IpcCallTag {
    #[serde(rename = "ipc-call")]
    IpcCall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum IpcResponseTag {
    #[serde(rename = "ipc-response")]
    IpcResponse,
}

/// Worker → host: call the host capability registered under `channel`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct IpcCallMessage {
    #[serde(rename = "type")]
    pub tag: IpcCallTag,
    pub id: String,
    pub channel: String,
    pub args: Vec<Value>,
}

/// Host → worker: outcome of an `IpcCallMessage` with the same `id`.
/// Exactly one of `result` / `error` is meaningful; a missing `result`
/// without an `error` means the handler returned `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct IpcResponseMessage {
    #[serde(rename = "type")]
    pub tag: IpcResponseTag,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// -----------------------------------------------------------------------------
// Lifecycle payloads. The connection never looks inside these; they are here so
// host code and plugin loaders agree on a shape.
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPluginParams {
    pub plugin_id: String,
    pub name: String,
    #[serde(default)]
    pub version: String,
    /// Where the loader finds the plugin code (path, module name, ...).
    pub entry: String,
    #[serde(default)]
    pub settings: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UnregisterPluginParams {
    pub plugin_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InvokeExtensionParams {
    pub plugin_id: String,
    pub extension_point: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

// -----------------------------------------------------------------------------
// Helper constructors
// -----------------------------------------------------------------------------

impl Envelope {
    pub fn new(kind: MessageType, id: impl Into<String>, payload: Value) -> Self {
        Self { kind, id: id.into(), payload }
    }

    /// The one-time handshake a worker sends once its loop is installed.
    pub fn ready() -> Self {
        Self::new(MessageType::Ready, generate_id(Some("ready")), Value::Null)
    }

    pub fn response(id: impl Into<String>, result: Value) -> Self {
        Self::new(MessageType::Response, id, result)
    }

    pub fn error(id: impl Into<String>, err: &RemoteError) -> Self {
        Self::new(MessageType::Error, id, err.to_value())
    }
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), stack: None }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Reads `{message, stack?}` out of an `error` payload. Anything that is
    /// not shaped like that still becomes an error, with the raw payload as
    /// its message.
    pub fn from_payload(payload: &Value) -> Self {
        match serde_json::from_value::<RemoteError>(payload.clone()) {
            Ok(err) => err,
            Err(_) => match payload {
                Value::String(message) => RemoteError::new(message.clone()),
                other => RemoteError::new(other.to_string()),
            },
        }
    }

    pub fn to_value(&self) -> Value {
        match &self.stack {
            Some(stack) => json!({ "message": self.message, "stack": stack }),
            None => json!({ "message": self.message }),
        }
    }
}

impl From<anyhow::Error> for RemoteError {
    fn from(err: anyhow::Error) -> Self {
        let stack = err
            .chain()
            .skip(1)
            .map(|cause| format!("caused by: {cause}"))
            .collect::<Vec<_>>();
        let remote = RemoteError::new(err.to_string());
        if stack.is_empty() {
            remote
        } else {
            remote.with_stack(stack.join("\n"))
        }
    }
}

impl LogMessage {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self { tag: LogTag::Log, level, message: message.into(), context: None, error: None }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_error(mut self, error: RemoteError) -> Self {
        self.error = Some(error);
        self
    }
}

impl IpcCallMessage {
    pub fn new(id: impl Into<String>, channel: impl Into<String>, args: Vec<Value>) -> Self {
        Self { tag: IpcCallTag::IpcCall, id: id.into(), channel: channel.into(), args }
    }
}

impl IpcResponseMessage {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self { tag: IpcResponseTag::IpcResponse, id: id.into(), result: Some(result), error: None }
    }

    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self { tag: IpcResponseTag::IpcResponse, id: id.into(), result: None, error: Some(error.into()) }
    }
}
