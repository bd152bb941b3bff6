pub mod bridge;
pub mod config;
pub mod connection;
pub mod demo;
pub mod lifecycle;
pub mod logger;

pub use bridge::{BridgeError, InvokeEvent, IpcBridge, IpcHandler};
pub use config::{ConfigError, HostConfig};
pub use connection::{Connection, ConnectionError, ConnectionOptions, ConnectionState, WorkerSpawner};
pub use lifecycle::PluginSession;
