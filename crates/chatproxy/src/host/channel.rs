//! Process channel: owns the worker and its pipes.
//!
//! The worker is spawned lazily on the first send and respawned when the
//! previous one has gone away. Each spawn is a *generation* with its own
//! writer, its own reader task and its own pending table; a response can only
//! complete a request written to the same generation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::pending::PendingRequests;
use super::spawner::{LaunchParams, SpawnedWorker, WorkerHandle, WorkerSpawner};
use crate::bridge::codec::EnvelopeCodec;
use crate::bridge::protocol::{Request, Response};
use crate::fault::Fault;

type RequestWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, EnvelopeCodec<Request>>;
/// `None` once shutdown has closed the worker's input.
type SharedWriter = Arc<Mutex<Option<RequestWriter>>>;
type ResponseReader = FramedRead<Box<dyn AsyncRead + Send + Unpin>, EnvelopeCodec<Response>>;

pub struct ChannelConfig {
    pub spawner: Arc<dyn WorkerSpawner>,
    pub launch: LaunchParams,
}

impl ChannelConfig {
    pub fn new(spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            spawner,
            launch: LaunchParams::default(),
        }
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.launch.idle_timeout = Some(timeout);
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.launch.log_level = Some(level.into());
        self
    }

    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.launch.log_path = Some(path.into());
        self
    }
}

struct Generation {
    number: u64,
    writer: SharedWriter,
    pending: PendingRequests,
    worker: Box<dyn WorkerHandle>,
    reader: JoinHandle<()>,
}

impl Generation {
    fn is_alive(&mut self) -> bool {
        !self.reader.is_finished() && !self.pending.is_closed() && !self.worker.has_exited()
    }
}

#[derive(Default)]
struct ChannelState {
    current: Option<Generation>,
    spawned: u64,
}

pub struct ProcessChannel {
    config: ChannelConfig,
    state: Mutex<ChannelState>,
}

impl ProcessChannel {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ChannelState::default()),
        }
    }

    /// Number of workers spawned so far.
    pub async fn generation(&self) -> u64 {
        self.state.lock().await.spawned
    }

    /// True when there is no live worker (never started, exited, or stopped
    /// reading).
    pub async fn has_exited(&self) -> bool {
        let mut state = self.state.lock().await;
        !state.current.as_mut().is_some_and(Generation::is_alive)
    }

    /// Requests written but not yet answered by the current worker.
    pub async fn in_flight(&self) -> usize {
        let state = self.state.lock().await;
        state.current.as_ref().map_or(0, |g| g.pending.len())
    }

    /// Write one request and wait for the response with the same RequestId.
    pub async fn send(&self, request: Request) -> Result<Response, Fault> {
        let request_id = request.request_id;
        let (number, writer, pending) = self.ensure_worker().await?;

        let (_guard, slot) = pending.register(request_id)?;
        tracing::trace!(%request_id, generation = number, command = %request.command_name, "Sending request");
        {
            let mut writer = writer.lock().await;
            let Some(writer) = writer.as_mut() else {
                return Err(Fault::process("worker input is closed"));
            };
            if let Err(fault) = writer.send(request).await {
                tracing::warn!(%request_id, generation = number, error = %fault, "Failed to write request");
                // A broken pipe retires the whole generation.
                if matches!(fault, Fault::Process { .. }) {
                    pending.fail_all(&fault);
                }
                return Err(fault);
            }
        }

        let response = slot
            .await
            .map_err(|_| Fault::process("worker reader dropped the request"))??;
        if response.request_id != request_id {
            return Err(Fault::protocol(format!(
                "response {} does not match request {request_id}",
                response.request_id
            )));
        }
        Ok(response)
    }

    /// Close the worker's input and wait for it to stop; kill it after
    /// `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        let Some(generation) = self.state.lock().await.current.take() else {
            return;
        };
        let Generation {
            number,
            writer,
            mut worker,
            reader,
            ..
        } = generation;
        // Other senders may hold clones of the writer; take the sink itself so
        // the pipe closes now.
        if let Some(mut sink) = writer.lock().await.take()
            && let Err(e) = sink.close().await
        {
            tracing::debug!(generation = number, error = %e, "Failed to close worker input");
        }

        if tokio::time::timeout(timeout, worker.wait()).await.is_err() {
            tracing::warn!(generation = number, ?timeout, "Worker did not stop in time, killing");
            worker.kill();
        }
        reader.abort();
        tracing::info!(generation = number, "Worker shut down");
    }

    async fn ensure_worker(&self) -> Result<(u64, SharedWriter, PendingRequests), Fault> {
        let mut state = self.state.lock().await;

        if let Some(current) = state.current.as_mut()
            && current.is_alive()
        {
            return Ok((current.number, Arc::clone(&current.writer), current.pending.clone()));
        }

        if let Some(mut stale) = state.current.take() {
            tracing::warn!(generation = stale.number, "Worker has exited, respawning");
            stale.worker.kill();
        }

        let SpawnedWorker {
            stdin,
            stdout,
            handle,
        } = self.config.spawner.spawn(&self.config.launch)?;
        state.spawned += 1;
        let number = state.spawned;

        let pending = PendingRequests::new();
        let reader = FramedRead::new(stdout, EnvelopeCodec::<Response>::new());
        let reader = tokio::spawn(read_responses(number, reader, pending.clone()));
        let writer = Arc::new(Mutex::new(Some(FramedWrite::new(stdin, EnvelopeCodec::<Request>::new()))));
        tracing::info!(generation = number, "Worker started");

        state.current = Some(Generation {
            number,
            writer: Arc::clone(&writer),
            pending: pending.clone(),
            worker: handle,
            reader,
        });
        Ok((number, writer, pending))
    }
}

/// The single reader of one generation's stdout.
async fn read_responses(generation: u64, mut reader: ResponseReader, pending: PendingRequests) {
    let fault = loop {
        match reader.next().await {
            Some(Ok(response)) => {
                let request_id = response.request_id;
                if !pending.complete(response) {
                    tracing::warn!(%request_id, generation, "Dropping response with no waiter");
                }
            }
            Some(Err(fault)) => {
                tracing::error!(generation, error = %fault, "Failed to read worker response");
                break Fault::process(format!("worker channel failed: {fault}"));
            }
            None => {
                tracing::debug!(generation, "Worker output closed");
                break Fault::process("worker exited before responding");
            }
        }
    };
    let failed = pending.fail_all(&fault);
    if failed > 0 {
        tracing::warn!(generation, failed, "Failed outstanding requests");
    }
}
