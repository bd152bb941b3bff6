// src/connection/dispatch.rs
//! The per-connection event loop.
//!
//! Every worker message is routed by its `type`: `log` lines go to tracing,
//! `ipc-call`s go to the bridge, anything else is the outer protocol. Nothing
//! in here may fail the loop; a bad message is logged and dropped.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use futures::FutureExt;
use plugin_protocol::message::{IPC_CALL_TAG, IpcCallMessage, IpcResponseMessage, LOG_TAG, LogLevel};
use plugin_protocol::schema::{Validation, message_tag, validate_envelope, validate_ipc_call, validate_log_message};
use plugin_protocol::{MessageType, RemoteError, WorkerEvent, WorkerSender};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};

use super::{ConnectionError, ConnectionState, Inner};

pub(super) async fn run(inner: Weak<Inner>, mut events: UnboundedReceiver<WorkerEvent>, sender: WorkerSender) {
    while let Some(event) = events.recv().await {
        let Some(conn) = inner.upgrade() else {
            return;
        };
        match event {
            WorkerEvent::Message(raw) => conn.route(raw, &sender),
            WorkerEvent::Error(err) => {
                // the exit that follows does the teardown
                error!(connection = %conn.name, %err, "worker error");
            }
            WorkerEvent::Exit(code) => {
                conn.on_exit(code).await;
                return;
            }
        }
    }

    if let Some(conn) = inner.upgrade() {
        conn.on_exit(1).await;
    }
}

impl Inner {
    fn route(self: &Arc<Self>, raw: Value, sender: &WorkerSender) {
        match message_tag(&raw) {
            Some(LOG_TAG) => self.forward_log(&raw),
            Some(IPC_CALL_TAG) => self.serve_ipc_call(&raw, sender),
            _ => self.settle_outer(&raw),
        }
    }

    fn forward_log(&self, raw: &Value) {
        let log = match validate_log_message(raw) {
            Validation::Success(log) => log,
            Validation::Failure(err) => {
                warn!(connection = %self.name, %err, "dropping malformed log message");
                return;
            }
        };

        let context = log.context.as_deref().unwrap_or_default();
        match log.level {
            LogLevel::Info => info!(connection = %self.name, context, "{}", log.message),
            LogLevel::Warn => warn!(connection = %self.name, context, "{}", log.message),
            LogLevel::Error => {
                let cause = log.error.as_ref().map(|e| e.message.as_str()).unwrap_or_default();
                let stack = log.error.as_ref().and_then(|e| e.stack.as_deref()).unwrap_or_default();
                error!(connection = %self.name, context, error = cause, stack, "{}", log.message);
            }
        }
    }

    fn serve_ipc_call(&self, raw: &Value, sender: &WorkerSender) {
        let IpcCallMessage { id, channel, args, .. } = match validate_ipc_call(raw) {
            Validation::Success(call) => call,
            Validation::Failure(err) => {
                warn!(connection = %self.name, %err, "dropping malformed ipc-call");
                return;
            }
        };

        if let Some(allowed) = &self.allowed {
            if !allowed.contains(&channel) {
                warn!(connection = %self.name, %channel, "ipc-call to a channel outside the allow-list");
                let reply = IpcResponseMessage::failure(
                    id,
                    format!("channel `{channel}` is not permitted for connection `{}`", self.name),
                );
                post_reply(sender, &reply);
                return;
            }
        }

        let bridge = Arc::clone(&self.bridge);
        let sender = sender.clone();
        let name = self.name.clone();
        // handlers may be slow; other calls keep flowing meanwhile
        tokio::spawn(async move {
            let reply = match AssertUnwindSafe(bridge.invoke(&channel, args)).catch_unwind().await {
                Ok(Ok(result)) => IpcResponseMessage::success(id, result),
                Ok(Err(err)) => {
                    debug!(connection = %name, %channel, %err, "ipc handler failed");
                    IpcResponseMessage::failure(id, err.to_string())
                }
                Err(_) => {
                    error!(connection = %name, %channel, "ipc handler panicked");
                    IpcResponseMessage::failure(id, format!("handler for {channel} panicked"))
                }
            };
            post_reply(&sender, &reply);
        });
    }

    fn settle_outer(&self, raw: &Value) {
        let envelope = match validate_envelope(raw) {
            Validation::Success(envelope) => envelope,
            Validation::Failure(err) => {
                warn!(connection = %self.name, %err, "dropping malformed message");
                return;
            }
        };

        let settled = match envelope.kind {
            MessageType::Ready => {
                let promoted = self.state.send_if_modified(|state| {
                    if *state == ConnectionState::Starting {
                        *state = ConnectionState::Running;
                        true
                    } else {
                        false
                    }
                });
                if promoted {
                    info!(connection = %self.name, "worker ready");
                } else {
                    debug!(connection = %self.name, "ignoring repeated ready");
                }
                return;
            }
            MessageType::Response => self.pending.settle(&envelope.id, Ok(envelope.payload)),
            MessageType::Error => {
                let remote = RemoteError::from_payload(&envelope.payload);
                self.pending.settle(&envelope.id, Err(ConnectionError::Remote(remote)))
            }
            other => {
                warn!(connection = %self.name, kind = %other, "worker sent a host-only message kind");
                return;
            }
        };

        if !settled {
            warn!(connection = %self.name, "no handler for message `{}`", envelope.id);
        }
    }

    async fn on_exit(&self, code: i32) {
        let mut slot = self.slot.lock().await;
        if *self.state.borrow() == ConnectionState::Stopping {
            debug!(connection = %self.name, code, "worker exited during stop");
            return;
        }

        if code != 0 {
            error!(connection = %self.name, code, "worker exited");
        } else {
            debug!(connection = %self.name, "worker exited cleanly");
        }

        slot.active = None;
        slot.last_exit = Some(code);
        let rejected = self.pending.reject_all(|| ConnectionError::ConnectionClosed);
        if rejected > 0 {
            warn!(connection = %self.name, rejected, "rejected pending calls after worker exit");
        }
        self.state.send_replace(ConnectionState::Stopped);
    }
}

fn post_reply(sender: &WorkerSender, reply: &IpcResponseMessage) {
    if let Err(err) = sender.post_json(reply) {
        debug!(id = %reply.id, %err, "could not deliver ipc-response");
    }
}
