//! Worker side: read loop, dispatcher, connection table.
//!
//! The worker reads requests on stdin and writes responses on stdout. Logs go
//! to stderr or a file; stdout belongs to the protocol.

pub mod commands;
pub mod connections;
pub mod dispatcher;
pub mod listener;
pub mod operation;

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::fault::Fault;
use crate::service::{Credentials, ServiceRegistry};
use commands::CommandTable;
use connections::{ConnectionTable, DefaultService};
use dispatcher::Dispatcher;
use listener::{DispatchResponder, Listener, ListenerExit};

/// Worker launch parameters.
#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    /// Stop after this long without a request.
    pub idle_timeout: Option<Duration>,
    /// Service used when create-connection names none.
    pub default_service: Option<DefaultService>,
    pub credentials: Credentials,
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_default_service(mut self, default_service: Option<DefaultService>) -> Self {
        self.default_service = default_service;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }
}

/// Serve requests from `reader`, writing responses to `writer`, until the
/// loop stops.
pub async fn serve<R, W>(
    config: WorkerConfig,
    registry: ServiceRegistry,
    reader: R,
    writer: W,
) -> Result<ListenerExit, Fault>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let connections = ConnectionTable::new(registry, config.credentials)
        .with_default_service(config.default_service);
    let dispatcher = Dispatcher::new(CommandTable::standard(), connections);

    let listener = Listener::new(config.idle_timeout);
    let handle = listener.start(reader, writer, DispatchResponder::new(dispatcher))?;
    let _stop = listener.stop_guard();
    handle
        .await
        .map_err(|e| Fault::process(format!("worker loop panicked: {e}")))?
}

/// Run the worker over the process's stdin/stdout.
pub async fn run_worker(config: WorkerConfig, registry: ServiceRegistry) -> Result<ListenerExit, Fault> {
    tracing::info!(
        idle_timeout = ?config.idle_timeout,
        default_service = config.default_service.as_ref().map(|d| d.service_id.as_str()),
        has_api_key = config.credentials.api_key().is_some(),
        "Worker starting"
    );
    let exit = serve(config, registry, tokio::io::stdin(), tokio::io::stdout()).await?;
    tracing::info!(?exit, "Worker exiting");
    Ok(exit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::{decode_line, encode_line};
    use crate::bridge::protocol::{
        CREATE_CONNECTION, CreateConnectionPayload, CreateConnectionResult, EXIT, Request, Response,
    };
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn default_service_serves_empty_service_id() {
        let (mut host_in, worker_in) = tokio::io::duplex(64 * 1024);
        let (worker_out, host_out) = tokio::io::duplex(64 * 1024);
        let config = WorkerConfig::new().with_default_service(Some(DefaultService {
            service_id: "echo".to_string(),
            options: json!({"model": "configured"}),
        }));
        let worker = tokio::spawn(serve(config, ServiceRegistry::with_builtin(), worker_in, worker_out));
        let mut lines = BufReader::new(host_out).lines();

        let create = Request::new(
            CREATE_CONNECTION,
            &CreateConnectionPayload {
                service_id: String::new(),
                options: serde_json::Value::Null,
            },
        )
        .unwrap();
        for request in [&create, &Request::bare(EXIT)] {
            let line = encode_line(request).unwrap();
            host_in.write_all(format!("{line}\n").as_bytes()).await.unwrap();
        }

        let response: Response = decode_line(&lines.next_line().await.unwrap().unwrap()).unwrap();
        let result: CreateConnectionResult =
            serde_json::from_str(&response.into_single_result().unwrap()).unwrap();
        assert_eq!(result.current_options, json!({"model": "configured"}));

        assert_eq!(worker.await.unwrap().unwrap(), ListenerExit::Finished);
    }
}
