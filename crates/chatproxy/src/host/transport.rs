//! Request transport with retry on stale connections.
//!
//! A send is retried when the worker answers with a bad-connection fault
//! (after unbinding the handle) or when the send itself fails. Every attempt
//! reuses the caller's RequestId, so the response always echoes it.
//! Configuration faults are never retried; process faults also unbind the
//! handle.

use std::sync::Arc;

use super::channel::ProcessChannel;
use super::connection::ConnectionHandle;
use crate::bridge::protocol::{
    CREATE_CONNECTION, ConnectionId, CreateConnectionPayload, CreateConnectionResult, Request,
    Response,
};
use crate::fault::Fault;

/// Attempts per logical send, first try included.
pub const MAX_ATTEMPTS: usize = 2;

#[derive(Clone)]
pub struct Transport {
    channel: Arc<ProcessChannel>,
}

impl Transport {
    pub fn new(channel: Arc<ProcessChannel>) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &Arc<ProcessChannel> {
        &self.channel
    }

    /// Send `request` on behalf of `handle`. Returns exactly one response or
    /// one fault.
    pub async fn send(&self, handle: &ConnectionHandle, request: Request) -> Result<Response, Fault> {
        let mut attempt = 1;
        loop {
            let (target, outcome) = self.attempt(handle, request.clone()).await;
            let last = attempt == MAX_ATTEMPTS;
            match outcome {
                Ok(response) if response.is_bad_connection() => {
                    let unbound = target.is_some_and(|id| handle.unbind_if(id));
                    tracing::warn!(
                        request_id = %request.request_id,
                        connection_id = ?target,
                        unbound,
                        attempt,
                        "Worker does not know the connection"
                    );
                    if last {
                        return Ok(response);
                    }
                }
                Ok(response) => return Ok(response),
                Err(fault) if last || matches!(fault, Fault::Configuration { .. }) => return Err(fault),
                Err(fault) => {
                    // A dead worker took its connection table with it.
                    if matches!(fault, Fault::Process { .. })
                        && let Some(id) = target
                    {
                        handle.unbind_if(id);
                    }
                    tracing::warn!(
                        request_id = %request.request_id,
                        attempt,
                        error = %fault,
                        category = fault.category(),
                        "Send failed, retrying"
                    );
                }
            }
            attempt += 1;
        }
    }

    /// Issue create-connection for `handle` and bind it. The handle must carry
    /// a connect spec and be unbound.
    pub async fn connect(&self, handle: &ConnectionHandle) -> Result<CreateConnectionResult, Fault> {
        let spec = handle
            .spec()
            .ok_or_else(|| Fault::invalid_state("connection handle has no connect spec"))?;
        let request = Request::new(
            CREATE_CONNECTION,
            &CreateConnectionPayload {
                service_id: spec.service_id.clone(),
                options: spec.options.clone(),
            },
        )?;
        let content = self.channel.send(request).await?.into_single_result()?;
        let result: CreateConnectionResult = serde_json::from_str(&content)
            .map_err(|e| Fault::protocol(format!("invalid create-connection result: {e}")))?;
        handle.bind(result.connection_id);
        tracing::debug!(connection_id = %result.connection_id, service_id = %spec.service_id, "Handle bound");
        Ok(result)
    }

    /// One send cycle. Returns the target the request went out with, so the
    /// caller unbinds only that binding.
    async fn attempt(
        &self,
        handle: &ConnectionHandle,
        request: Request,
    ) -> (Option<ConnectionId>, Result<Response, Fault>) {
        if handle.spec().is_some() && !handle.is_connected() {
            let _connecting = handle.connect_lock.lock().await;
            if !handle.is_connected()
                && let Err(fault) = self.connect(handle).await
            {
                return (None, Err(fault));
            }
        }
        let target = handle.target();
        let outcome = self.channel.send(request.with_target(target)).await;
        (target, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{SEND_CHAT, SendChatPayload, SendChatResult};
    use crate::host::channel::ChannelConfig;
    use crate::host::connection::ConnectSpec;
    use crate::host::spawner::InProcessSpawner;
    use crate::bridge::protocol::EXIT;
    use crate::service::{ChatMessage, ChatService, ChatSettings, Credentials, EchoService, ServiceRegistry};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn transport() -> Transport {
        let spawner = Arc::new(InProcessSpawner::new(ServiceRegistry::with_builtin()));
        Transport::new(Arc::new(ProcessChannel::new(ChannelConfig::new(spawner))))
    }

    fn chat_request() -> Request {
        Request::new(
            SEND_CHAT,
            &SendChatPayload {
                history: vec![ChatMessage::system("be brief"), ChatMessage::user("hello")],
                settings: ChatSettings::default(),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn connect_then_send_chat() {
        let transport = transport();
        let handle = ConnectionHandle::with_spec(ConnectSpec::new("echo", json!({})));
        let created = transport.connect(&handle).await.unwrap();
        assert_eq!(handle.connection_id(), Some(created.connection_id));

        let request = chat_request();
        let response = transport.send(&handle, request.clone()).await.unwrap();

        assert_eq!(response.request_id, request.request_id);
        let result: SendChatResult = serde_json::from_str(&response.into_single_result().unwrap()).unwrap();
        assert_eq!(result.chat_response.message, ChatMessage::assistant("echo: hello"));
    }

    #[tokio::test]
    async fn garbage_target_retries_then_returns_error_response() {
        let transport = transport();
        let handle = ConnectionHandle::new();
        let garbage = ConnectionId::new();
        handle.bind(garbage);

        let request = chat_request();
        let response = transport.send(&handle, request.clone()).await.unwrap();

        assert!(response.is_bad_connection());
        assert_eq!(response.request_id, request.request_id);
        assert!(!handle.is_connected());
        assert_eq!(handle.target(), Some(garbage));
        assert_eq!(transport.channel().in_flight().await, 0);
    }

    #[tokio::test]
    async fn stale_handle_with_spec_reconnects() {
        let transport = transport();
        let handle = ConnectionHandle::with_spec(ConnectSpec::new("echo", json!({})));
        let stale = ConnectionId::new();
        handle.bind(stale);

        let response = transport.send(&handle, chat_request()).await.unwrap();

        assert!(response.is_success());
        let current = handle.connection_id().unwrap();
        assert_ne!(current, stale);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_senders_reconnect_once_after_respawn() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let registry = ServiceRegistry::new().with_builder(
            "echo",
            move |options: &serde_json::Value, _: &Credentials| -> Result<Arc<dyn ChatService>, Fault> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(EchoService::new(options.clone())))
            },
        );
        let spawner = Arc::new(InProcessSpawner::new(registry));
        let transport = Transport::new(Arc::new(ProcessChannel::new(ChannelConfig::new(spawner))));
        let handle = Arc::new(ConnectionHandle::with_spec(ConnectSpec::new("echo", json!({}))));
        transport.connect(&handle).await.unwrap();

        transport.channel().send(Request::bare(EXIT)).await.unwrap();
        while !transport.channel().has_exited().await {
            tokio::task::yield_now().await;
        }

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let transport = transport.clone();
                let handle = Arc::clone(&handle);
                tokio::spawn(async move {
                    let request = chat_request();
                    let response = transport.send(&handle, request.clone()).await.unwrap();
                    assert!(response.is_success());
                    assert_eq!(response.request_id, request.request_id);
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        // One connection for the first worker, one for its replacement.
        assert_eq!(built.load(Ordering::SeqCst), 2);
        assert!(handle.is_connected());
    }

    #[tokio::test]
    async fn configuration_fault_is_not_retried() {
        let transport = transport();
        let handle = ConnectionHandle::with_spec(ConnectSpec::new("no-such-service", json!({})));

        let err = transport.send(&handle, chat_request()).await.unwrap_err();

        assert_eq!(err.category(), "ConfigurationFault");
        assert!(err.message().contains("no-such-service"));
        assert!(!handle.is_connected());
    }

    #[tokio::test]
    async fn connect_without_spec_is_invalid_state() {
        let transport = transport();
        let err = transport.connect(&ConnectionHandle::new()).await.unwrap_err();
        assert_eq!(err.category(), "InvalidStateFault");
    }
}
