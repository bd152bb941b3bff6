// plugin_protocol/src/id.rs
use uuid::Uuid;

/// Produces a correlation id for a single call.
///
/// The id is a random 128-bit UUID; the optional prefix (`msg`, `ipc`, ...)
/// only makes logs easier to read and plays no part in uniqueness.
pub fn generate_id(prefix: Option<&str>) -> String {
    let id = Uuid::new_v4();
    match prefix {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}-{id}"),
        _ => id.to_string(),
    }
}
