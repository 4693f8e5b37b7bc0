//! Typed host facade over the transport.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::channel::{ChannelConfig, ProcessChannel};
use super::connection::{ConnectSpec, ConnectionHandle};
use super::transport::Transport;
use crate::bridge::protocol::{
    CLOSE_CONNECTION, CloseConnectionResult, EXIT, INVOKE_FUNCTION, InvokeFunctionPayload,
    InvokeFunctionResult, OperationRecord, Request, SEND_CHAT, SendChatPayload, SendChatResult,
};
use crate::fault::Fault;
use crate::service::{ChatHistory, ChatResponse, ChatSettings};

pub struct ProxyClient {
    transport: Transport,
}

impl ProxyClient {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            transport: Transport::new(Arc::new(ProcessChannel::new(config))),
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn channel(&self) -> &ProcessChannel {
        self.transport.channel()
    }

    /// Create a worker connection. The returned handle reconnects by itself
    /// if the worker forgets it.
    pub async fn connect(
        &self,
        service_id: impl Into<String>,
        options: serde_json::Value,
    ) -> Result<ConnectionHandle, Fault> {
        let handle = ConnectionHandle::with_spec(ConnectSpec::new(service_id, options));
        self.transport.connect(&handle).await?;
        Ok(handle)
    }

    pub async fn send_chat(
        &self,
        handle: &ConnectionHandle,
        history: ChatHistory,
        settings: ChatSettings,
    ) -> Result<ChatResponse, Fault> {
        let result: SendChatResult = self
            .call(handle, SEND_CHAT, &SendChatPayload { history, settings })
            .await?;
        Ok(result.chat_response)
    }

    /// Plan a send-chat without running it.
    pub async fn plan_chat(
        &self,
        handle: &ConnectionHandle,
        history: ChatHistory,
        settings: ChatSettings,
    ) -> Result<Vec<OperationRecord>, Fault> {
        let request = Request::new(SEND_CHAT, &SendChatPayload { history, settings })?.with_what_if(true);
        let response = self.transport.send(handle, request).await?;
        if !response.is_success() {
            return Err(first_fault(response.faults));
        }
        response
            .plan()
            .map(<[OperationRecord]>::to_vec)
            .ok_or_else(|| Fault::protocol("what-if request returned no plan"))
    }

    pub async fn invoke_function(
        &self,
        handle: &ConnectionHandle,
        definition_prompt: impl Into<String>,
        parameters: BTreeMap<String, String>,
        settings: ChatSettings,
    ) -> Result<String, Fault> {
        let payload = InvokeFunctionPayload {
            definition_prompt: definition_prompt.into(),
            parameters,
            settings,
        };
        let result: InvokeFunctionResult = self.call(handle, INVOKE_FUNCTION, &payload).await?;
        Ok(result.output)
    }

    /// Drop the worker-side connection and unbind the handle. Returns whether
    /// the worker still knew it.
    pub async fn close(&self, handle: &ConnectionHandle) -> Result<bool, Fault> {
        let Some(target) = handle.connection_id() else {
            return Ok(false);
        };
        let request = Request::bare(CLOSE_CONNECTION).with_target(Some(target));
        let response = self.transport.channel().send(request).await?;
        handle.unbind();
        if response.is_bad_connection() {
            return Ok(false);
        }
        let result: CloseConnectionResult = parse_result(response.into_single_result()?)?;
        Ok(result.removed)
    }

    /// Ask the worker to exit and wait for it, killing it after `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), Fault> {
        let channel = self.transport.channel();
        if !channel.has_exited().await {
            match tokio::time::timeout(timeout, channel.send(Request::bare(EXIT))).await {
                Ok(Ok(response)) if !response.is_success() => {
                    tracing::warn!(error = ?response.first_fault(), "Worker rejected exit");
                }
                Ok(Ok(_)) => {}
                Ok(Err(fault)) => tracing::debug!(error = %fault, "Exit request failed"),
                Err(_) => tracing::warn!(?timeout, "Worker did not answer exit"),
            }
        }
        channel.shutdown(timeout).await;
        Ok(())
    }

    async fn call<P: Serialize, T: DeserializeOwned>(
        &self,
        handle: &ConnectionHandle,
        command: &str,
        payload: &P,
    ) -> Result<T, Fault> {
        let request = Request::new(command, payload)?;
        let response = self.transport.send(handle, request).await?;
        parse_result(response.into_single_result()?)
    }
}

fn parse_result<T: DeserializeOwned>(content: String) -> Result<T, Fault> {
    serde_json::from_str(&content).map_err(|e| Fault::protocol(format!("invalid command result: {e}")))
}

fn first_fault(faults: Vec<crate::fault::FaultRecord>) -> Fault {
    faults
        .into_iter()
        .next()
        .map(crate::fault::FaultRecord::into_fault)
        .unwrap_or_else(|| Fault::protocol("error response carried no faults"))
}
