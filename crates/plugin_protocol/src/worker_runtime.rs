// plugin_protocol/src/worker_runtime.rs
//! The worker side of a plugin connection.
//!
//! `run_worker` owns the port: it announces `ready`, routes `ipc-response`s
//! to the [`IpcClient`] and hands every lifecycle request to a
//! [`WorkerHandler`], one at a time, replying with `response` or `error`
//! under the request's id.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::ipc_client::IpcClient;
use crate::message::{Envelope, IPC_RESPONSE_TAG, LogLevel, LogMessage, MessageType, RemoteError};
use crate::schema::{Validation, message_tag, validate_envelope};
use crate::transport::{PortSender, WorkerPort};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Upper bound for each `invoke` made through the worker's IPC client.
    pub call_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { call_timeout: DEFAULT_CALL_TIMEOUT }
    }
}

/// What a plugin loader implements to serve the host's lifecycle requests.
#[async_trait]
pub trait WorkerHandler: Send + 'static {
    async fn handle(&mut self, kind: MessageType, payload: Value, ctx: &WorkerContext) -> Result<Value, RemoteError>;
}

/// Handed to the handler for every request.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    ipc: IpcClient,
    logger: WorkerLogger,
}

impl WorkerContext {
    pub fn ipc(&self) -> &IpcClient {
        &self.ipc
    }

    pub fn logger(&self) -> &WorkerLogger {
        &self.logger
    }
}

/// Forwards log lines to the host, where they land in its tracing output.
#[derive(Debug, Clone)]
pub struct WorkerLogger {
    sender: PortSender,
    context: Option<String>,
}

impl WorkerLogger {
    pub fn new(sender: PortSender) -> Self {
        Self { sender, context: None }
    }

    pub fn with_context(&self, context: impl Into<String>) -> Self {
        Self { sender: self.sender.clone(), context: Some(context.into()) }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(LogMessage::new(LogLevel::Info, message));
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(LogMessage::new(LogLevel::Warn, message));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(LogMessage::new(LogLevel::Error, message));
    }

    pub fn error_with(&self, message: impl Into<String>, error: RemoteError) {
        self.emit(LogMessage::new(LogLevel::Error, message).with_error(error));
    }

    fn emit(&self, mut line: LogMessage) {
        if let Some(context) = &self.context {
            line = line.with_context(context.clone());
        }
        // logging must never fail the caller; a closed port just drops the line
        if self.sender.post_json(&line).is_err() {
            debug!("log line dropped, host port closed");
        }
    }
}

/// Runs the worker loop until the host drops its side of the port.
pub async fn run_worker<H>(port: WorkerPort, handler: H, config: WorkerConfig) -> anyhow::Result<()>
where
    H: WorkerHandler,
{
    let (sender, mut inbound) = port.split();
    let ctx = WorkerContext {
        ipc: IpcClient::new(sender.clone(), config.call_timeout),
        logger: WorkerLogger::new(sender.clone()),
    };

    let (req_tx, req_rx) = mpsc::unbounded_channel::<Envelope>();
    let serve = tokio::spawn(serve_requests(handler, req_rx, ctx.clone(), sender.clone()));

    sender.post_json(&Envelope::ready())?;
    debug!("worker ready");

    while let Some(raw) = inbound.recv().await {
        if message_tag(&raw) == Some(IPC_RESPONSE_TAG) {
            ctx.ipc.handle_response(&raw);
            continue;
        }

        match validate_envelope(&raw) {
            Validation::Success(envelope) if envelope.kind.is_request() => {
                if req_tx.send(envelope).is_err() {
                    warn!("request loop is gone, dropping request");
                }
            }
            Validation::Success(envelope) => {
                debug!(kind = %envelope.kind, id = %envelope.id, "ignoring non-request envelope");
            }
            Validation::Failure(err) => {
                warn!(%err, "dropping malformed message from host");
            }
        }
    }

    drop(req_tx);
    ctx.ipc.close();
    serve.await?;
    Ok(())
}

async fn serve_requests<H: WorkerHandler>(
    mut handler: H,
    mut requests: mpsc::UnboundedReceiver<Envelope>,
    ctx: WorkerContext,
    sender: PortSender,
) {
    while let Some(Envelope { kind, id, payload }) = requests.recv().await {
        debug!(%kind, %id, "handling request");
        let reply = match handler.handle(kind, payload, &ctx).await {
            Ok(result) => Envelope::response(id, result),
            Err(err) => Envelope::error(id, &err),
        };
        if sender.post_json(&reply).is_err() {
            // host is gone, nothing left to answer to
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{IpcCallMessage, IpcResponseMessage};
    use crate::transport::WorkerEvent;
    use serde_json::json;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
    use tokio::time::timeout;

    struct Echo;

    #[async_trait]
    impl WorkerHandler for Echo {
        async fn handle(&mut self, kind: MessageType, payload: Value, ctx: &WorkerContext) -> Result<Value, RemoteError> {
            match kind {
                MessageType::InvokeExtension => {
                    let channel = payload["channel"].as_str().unwrap_or("echo").to_string();
                    ctx.ipc()
                        .invoke(&channel, vec![payload["arg"].clone()])
                        .await
                        .map_err(|e| RemoteError::new(e.to_string()))
                }
                MessageType::DisposePlugins => Err(RemoteError::new("dispose failed").with_stack("at dispose")),
                _ => {
                    ctx.logger().with_context("echo").info("handled");
                    Ok(payload)
                }
            }
        }
    }

    struct Harness {
        to_worker: UnboundedSender<Value>,
        events: UnboundedReceiver<WorkerEvent>,
        task: tokio::task::JoinHandle<anyhow::Result<()>>,
    }

    fn start() -> Harness {
        let (port, to_worker, events) = WorkerPort::pair();
        let task = tokio::spawn(run_worker(port, Echo, WorkerConfig { call_timeout: Duration::from_secs(5) }));
        Harness { to_worker, events, task }
    }

    async fn next_message(events: &mut UnboundedReceiver<WorkerEvent>) -> Value {
        match timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
            Some(WorkerEvent::Message(v)) => v,
            other => panic!("unexpected event {other:?}"),
        }
    }

    fn request(kind: MessageType, id: &str, payload: Value) -> Value {
        serde_json::to_value(Envelope::new(kind, id, payload)).unwrap()
    }

    #[tokio::test]
    async fn announces_ready_first() {
        let mut h = start();
        let ready = next_message(&mut h.events).await;
        assert_eq!(ready["type"], "ready");
        drop(h.to_worker);
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn answers_requests_under_their_id() {
        let mut h = start();
        next_message(&mut h.events).await;

        h.to_worker.send(request(MessageType::RegisterPlugin, "msg-1", json!({"a": 1}))).unwrap();
        let log = next_message(&mut h.events).await;
        assert_eq!(log, json!({"type": "log", "level": "info", "message": "handled", "context": "echo"}));
        let reply = next_message(&mut h.events).await;
        assert_eq!(reply, json!({"type": "response", "id": "msg-1", "payload": {"a": 1}}));

        h.to_worker.send(request(MessageType::DisposePlugins, "msg-2", Value::Null)).unwrap();
        let reply = next_message(&mut h.events).await;
        assert_eq!(
            reply,
            json!({"type": "error", "id": "msg-2", "payload": {"message": "dispose failed", "stack": "at dispose"}})
        );
    }

    #[tokio::test]
    async fn nested_ipc_call_completes_inside_a_request() {
        let mut h = start();
        next_message(&mut h.events).await;

        h.to_worker
            .send(request(MessageType::InvokeExtension, "msg-7", json!({"channel": "echo", "arg": "hi"})))
            .unwrap();

        let call: IpcCallMessage = serde_json::from_value(next_message(&mut h.events).await).unwrap();
        assert_eq!(call.channel, "echo");
        h.to_worker
            .send(serde_json::to_value(IpcResponseMessage::success(call.id, json!("hi"))).unwrap())
            .unwrap();

        let reply = next_message(&mut h.events).await;
        assert_eq!(reply, json!({"type": "response", "id": "msg-7", "payload": "hi"}));
    }

    #[tokio::test]
    async fn malformed_and_stray_messages_are_ignored() {
        let mut h = start();
        next_message(&mut h.events).await;

        h.to_worker.send(json!({"nonsense": true})).unwrap();
        h.to_worker.send(json!({"type": "response", "id": "x", "payload": null})).unwrap();
        h.to_worker.send(json!({"type": "ipc-response", "id": "unknown", "result": 1})).unwrap();
        h.to_worker.send(request(MessageType::InitializePlugins, "msg-3", json!(null))).unwrap();

        next_message(&mut h.events).await; // log line
        let reply = next_message(&mut h.events).await;
        assert_eq!(reply["id"], "msg-3");
    }

    #[tokio::test]
    async fn closing_the_port_fails_outstanding_ipc_calls() {
        let mut h = start();
        next_message(&mut h.events).await;

        h.to_worker
            .send(request(MessageType::InvokeExtension, "msg-9", json!({"channel": "never"})))
            .unwrap();
        let _call = next_message(&mut h.events).await;
        drop(h.to_worker);

        let reply = next_message(&mut h.events).await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["payload"]["message"], "host connection closed");
        h.task.await.unwrap().unwrap();
    }
}
