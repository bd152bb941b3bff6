// plugin_protocol/src/schema.rs
//! Schema checks for everything a process receives but did not author.
//!
//! Validation never panics and never returns `Err`: a message is either
//! `Validation::Success` with its typed view or `Validation::Failure` with the
//! raw validator output, which callers log before dropping the message.

use std::marker::PhantomData;

use jsonschema::Validator;
use once_cell::sync::Lazy;
use schemars::{JsonSchema, schema_for};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::message::{Envelope, IpcCallMessage, IpcResponseMessage, LogMessage};

#[derive(Debug, Clone, PartialEq)]
pub enum Validation<T> {
    Success(T),
    Failure(String),
}

impl<T> Validation<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Validation::Success(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Validation::Success(v) => Some(v),
            Validation::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Validation::Success(_) => None,
            Validation::Failure(e) => Some(e),
        }
    }
}

/// A compiled JSON schema derived from `T`, plus the typed view it guards.
pub struct MessageSchema<T> {
    validator: Validator,
    _marker: PhantomData<fn() -> T>,
}

impl<T> MessageSchema<T>
where
    T: JsonSchema + DeserializeOwned,
{
    pub fn compile() -> Result<Self, String> {
        let schema = serde_json::to_value(schema_for!(T)).map_err(|e| e.to_string())?;
        let validator = jsonschema::validator_for(&schema).map_err(|e| e.to_string())?;
        Ok(Self { validator, _marker: PhantomData })
    }

    pub fn validate(&self, raw: &Value) -> Validation<T> {
        let errors: Vec<String> = self.validator.iter_errors(raw).map(|e| e.to_string()).collect();
        if !errors.is_empty() {
            return Validation::Failure(errors.join("; "));
        }
        match serde_json::from_value::<T>(raw.clone()) {
            Ok(message) => Validation::Success(message),
            Err(e) => Validation::Failure(e.to_string()),
        }
    }
}

static LOG_SCHEMA: Lazy<Result<MessageSchema<LogMessage>, String>> = Lazy::new(MessageSchema::compile);
static IPC_CALL_SCHEMA: Lazy<Result<MessageSchema<IpcCallMessage>, String>> = Lazy::new(MessageSchema::compile);
static IPC_RESPONSE_SCHEMA: Lazy<Result<MessageSchema<IpcResponseMessage>, String>> =
    Lazy::new(MessageSchema::compile);
static ENVELOPE_SCHEMA: Lazy<Result<MessageSchema<Envelope>, String>> = Lazy::new(MessageSchema::compile);

fn run<T>(schema: &Lazy<Result<MessageSchema<T>, String>>, raw: &Value) -> Validation<T>
where
    T: JsonSchema + DeserializeOwned,
{
    match Lazy::force(schema) {
        Ok(schema) => schema.validate(raw),
        Err(e) => Validation::Failure(format!("schema unavailable: {e}")),
    }
}

/// `{type:'log', level, message, context?, error?: {message, stack?}}`
pub fn validate_log_message(raw: &Value) -> Validation<LogMessage> {
    run(&LOG_SCHEMA, raw)
}

/// `{type:'ipc-call', id, channel, args: unknown[]}`
pub fn validate_ipc_call(raw: &Value) -> Validation<IpcCallMessage> {
    run(&IPC_CALL_SCHEMA, raw)
}

/// `{type:'ipc-response', id, result?, error?}`
pub fn validate_ipc_response(raw: &Value) -> Validation<IpcResponseMessage> {
    run(&IPC_RESPONSE_SCHEMA, raw)
}

/// Outer protocol `{type, id, payload}`.
pub fn validate_envelope(raw: &Value) -> Validation<Envelope> {
    run(&ENVELOPE_SCHEMA, raw)
}

/// The string discriminator every message carries in `type`, if any.
pub fn message_tag(raw: &Value) -> Option<&str> {
    raw.get("type").and_then(Value::as_str)
}
