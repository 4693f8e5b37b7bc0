//! chatproxy: drive chat services in a separate worker process.
//!
//! The host writes base64-framed JSON requests to the worker's stdin and
//! correlates the responses it reads back from stdout. Many logical
//! connections share the one pipe.

pub mod bridge;
pub mod fault;
pub mod host;
pub mod logging;
pub mod service;
pub mod worker;

pub use bridge::protocol::{ConnectionId, OperationRecord, OperationStatus, Request, RequestId, Response};
pub use fault::{Fault, FaultRecord};
pub use host::channel::{ChannelConfig, ProcessChannel};
pub use host::client::ProxyClient;
pub use host::connection::{ConnectSpec, ConnectionHandle};
pub use host::spawner::{InProcessSpawner, LaunchParams, ProcessSpawner, SpawnError, WorkerSpawner};
pub use host::transport::Transport;
pub use service::{
    ChatHistory, ChatMessage, ChatResponse, ChatService, ChatSettings, Credentials, ServiceRegistry,
};
pub use worker::{WorkerConfig, run_worker};
