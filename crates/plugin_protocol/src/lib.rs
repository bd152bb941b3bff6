pub mod id;
pub mod ipc_client;
pub mod message;
pub mod schema;
pub mod transport;
pub mod worker_runtime;

#[cfg(feature = "test-utils")]
pub mod test_util;

pub use ipc_client::{IpcClient, RpcError};
pub use message::{Envelope, MessageType, RemoteError};
pub use transport::{PortSender, TransportError, Worker, WorkerEvent, WorkerPort, WorkerSender};
pub use worker_runtime::{WorkerConfig, WorkerContext, WorkerHandler, WorkerLogger, run_worker};
