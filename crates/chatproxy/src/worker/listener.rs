//! Worker read loop.
//!
//! One task reads request lines, hands each to a [`Responder`], and writes the
//! reply before reading the next line. The loop ends on end of input, when the
//! responder reports `finished`, on [`Listener::stop`], or after the idle
//! timeout. A responder error ends the loop and is returned to the caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::{CancellationToken, DropGuard};

use super::dispatcher::Dispatcher;
use crate::bridge::codec::{DEFAULT_MAX_LINE_LENGTH, EnvelopeCodec, decode_line};
use crate::bridge::protocol::{EXIT, Request, Response};
use crate::fault::Fault;

/// Why the read loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerExit {
    EndOfInput,
    Finished,
    Cancelled,
    IdleTimeout,
}

pub struct Reply {
    pub response: Response,
    /// Stop reading after this reply is written.
    pub finished: bool,
}

#[async_trait]
pub trait Responder: Send {
    async fn respond(&mut self, line: &str) -> Result<Reply, Fault>;
}

/// Decodes request lines and runs them through a [`Dispatcher`].
pub struct DispatchResponder {
    dispatcher: Dispatcher,
}

impl DispatchResponder {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

#[async_trait]
impl Responder for DispatchResponder {
    async fn respond(&mut self, line: &str) -> Result<Reply, Fault> {
        let request: Request = decode_line(line)?;
        tracing::debug!(
            request_id = %request.request_id,
            command = %request.command_name,
            what_if = request.what_if,
            "Request received"
        );

        let result = self
            .dispatcher
            .invoke(
                request.request_id,
                &request.command_name,
                &request.content,
                request.target_connection_id,
                request.what_if,
            )
            .await;
        let response = match result {
            Ok(response) => response,
            Err(fault) => Response::failure(request.request_id, &fault),
        };
        let finished = request.command_name == EXIT && !request.what_if && response.is_success();
        Ok(Reply { response, finished })
    }
}

struct ListenerState {
    started: AtomicBool,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
    idle_timeout: Option<Duration>,
}

/// Handle to the read loop. Clones share the same loop.
#[derive(Clone)]
pub struct Listener {
    state: Arc<ListenerState>,
}

impl Listener {
    pub fn new(idle_timeout: Option<Duration>) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            state: Arc::new(ListenerState {
                started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                done,
                idle_timeout,
            }),
        }
    }

    /// Spawn the read loop. Fails if the loop was already started.
    pub fn start<R, W, S>(
        &self,
        reader: R,
        writer: W,
        responder: S,
    ) -> Result<JoinHandle<Result<ListenerExit, Fault>>, Fault>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
        S: Responder + 'static,
    {
        if self.state.started.swap(true, Ordering::SeqCst) {
            return Err(Fault::invalid_state("listener already started"));
        }
        let state = Arc::clone(&self.state);
        Ok(tokio::spawn(async move {
            let result = read_loop(&state, reader, writer, responder).await;
            match &result {
                Ok(exit) => tracing::info!(?exit, "Listener stopped"),
                Err(e) => tracing::error!(error = %e, category = e.category(), "Listener failed"),
            }
            state.done.send_replace(true);
            result
        }))
    }

    /// Cancel the loop. A read in progress is abandoned and the reader dropped.
    pub fn stop(&self) {
        tracing::debug!("Listener stop requested");
        self.state.cancel.cancel();
    }

    /// Stops the loop when dropped.
    pub fn stop_guard(&self) -> DropGuard {
        self.state.cancel.clone().drop_guard()
    }

    pub fn is_done(&self) -> bool {
        *self.state.done.borrow()
    }

    /// Wait for the loop to finish. Returns false on timeout.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let mut done = self.state.done.subscribe();
        tokio::time::timeout(timeout, done.wait_for(|d| *d))
            .await
            .is_ok_and(|r| r.is_ok())
    }
}

async fn read_loop<R, W, S>(
    state: &ListenerState,
    reader: R,
    writer: W,
    mut responder: S,
) -> Result<ListenerExit, Fault>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    S: Responder,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(DEFAULT_MAX_LINE_LENGTH));
    let mut responses = FramedWrite::new(writer, EnvelopeCodec::<Response>::new());

    loop {
        let next = tokio::select! {
            biased;

            _ = state.cancel.cancelled() => break Ok(ListenerExit::Cancelled),

            read = read_line(&mut lines, state.idle_timeout) => match read {
                Some(next) => next,
                None => {
                    tracing::info!(timeout = ?state.idle_timeout, "Idle timeout reached");
                    break Ok(ListenerExit::IdleTimeout);
                }
            },
        };

        let line = match next {
            Some(Ok(line)) => line,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                break Err(Fault::protocol("request line exceeds maximum length"));
            }
            Some(Err(LinesCodecError::Io(e))) => break Err(e.into()),
            None => {
                tracing::info!("Input closed");
                break Ok(ListenerExit::EndOfInput);
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = responder.respond(line.trim()).await?;
        responses.send(reply.response).await?;
        if reply.finished {
            break Ok(ListenerExit::Finished);
        }
    }
}

/// Next line, or `None` if the idle timeout elapsed first.
async fn read_line<R: AsyncRead + Unpin>(
    lines: &mut FramedRead<R, LinesCodec>,
    idle_timeout: Option<Duration>,
) -> Option<Option<Result<String, LinesCodecError>>> {
    match idle_timeout {
        Some(timeout) => tokio::time::timeout(timeout, lines.next()).await.ok(),
        None => Some(lines.next().await),
    }
}
