//! Command table and the standard command catalog.
//!
//! A command constructor parses the request payload and returns the
//! operations to run. Constructors never touch the connection table; all side
//! effects live in the operations' actions, so a what-if plan is free.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::operation::{Action, CommandContext, Operation};
use crate::bridge::protocol::{
    CLOSE_CONNECTION, CREATE_CONNECTION, CloseConnectionResult, CreateConnectionPayload,
    CreateConnectionResult, EXIT, INVOKE_FUNCTION, InvokeFunctionPayload, InvokeFunctionResult,
    SEND_CHAT, SendChatPayload, SendChatResult,
};
use crate::fault::Fault;

/// Builds the operations for one command from its raw payload.
pub type CommandConstructor = fn(payload: &str) -> Result<Vec<Operation>, Fault>;

/// Command name → constructor. Built explicitly and handed to the dispatcher.
#[derive(Clone, Default)]
pub struct CommandTable {
    constructors: HashMap<String, CommandConstructor>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The full command catalog.
    pub fn standard() -> Self {
        Self::new()
            .with_command(CREATE_CONNECTION, create_connection)
            .with_command(SEND_CHAT, send_chat)
            .with_command(INVOKE_FUNCTION, invoke_function)
            .with_command(CLOSE_CONNECTION, close_connection)
            .with_command(EXIT, exit)
    }

    pub fn with_command(mut self, name: impl Into<String>, constructor: CommandConstructor) -> Self {
        self.constructors.insert(name.into(), constructor);
        self
    }

    pub fn get(&self, name: &str) -> Option<CommandConstructor> {
        self.constructors.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }
}

fn parse_payload<P: DeserializeOwned>(command: &str, payload: &str) -> Result<P, Fault> {
    if payload.trim().is_empty() {
        return Err(Fault::protocol(format!("{command} requires a payload")));
    }
    serde_json::from_str(payload)
        .map_err(|e| Fault::protocol(format!("invalid {command} payload: {e}")))
}

fn to_result<T: Serialize>(value: &T) -> Result<String, Fault> {
    serde_json::to_string(value).map_err(|e| Fault::protocol(format!("failed to serialize result: {e}")))
}

fn create_connection(payload: &str) -> Result<Vec<Operation>, Fault> {
    let payload: CreateConnectionPayload = parse_payload(CREATE_CONNECTION, payload)?;
    Ok(vec![Operation::new(CREATE_CONNECTION, CreateConnection(payload))])
}

struct CreateConnection(CreateConnectionPayload);

#[async_trait]
impl Action for CreateConnection {
    async fn run(self: Box<Self>, ctx: &mut CommandContext<'_>) -> Result<String, Fault> {
        let CreateConnectionPayload {
            service_id,
            options,
        } = self.0;
        let connection = ctx.connections.create(&service_id, &options)?;
        to_result(&CreateConnectionResult {
            connection_id: connection.id(),
            current_options: connection.service().current_options(),
        })
    }
}

fn send_chat(payload: &str) -> Result<Vec<Operation>, Fault> {
    let payload: SendChatPayload = parse_payload(SEND_CHAT, payload)?;
    Ok(vec![Operation::new(SEND_CHAT, SendChat(payload))])
}

struct SendChat(SendChatPayload);

#[async_trait]
impl Action for SendChat {
    async fn run(self: Box<Self>, ctx: &mut CommandContext<'_>) -> Result<String, Fault> {
        let service = ctx.connections.get(ctx.target)?.service();
        let SendChatPayload { history, settings } = self.0;
        tracing::debug!(
            request_id = %ctx.request_id,
            messages = history.len(),
            plugins = settings.plugins.len(),
            "Sending chat"
        );
        let chat_response = service.send_chat(history, settings).await?;
        to_result(&SendChatResult { chat_response })
    }
}

fn invoke_function(payload: &str) -> Result<Vec<Operation>, Fault> {
    let payload: InvokeFunctionPayload = parse_payload(INVOKE_FUNCTION, payload)?;
    if payload.definition_prompt.trim().is_empty() {
        return Err(Fault::protocol("invoke-function requires a definitionPrompt"));
    }
    Ok(vec![Operation::new(INVOKE_FUNCTION, InvokeFunction(payload))])
}

struct InvokeFunction(InvokeFunctionPayload);

#[async_trait]
impl Action for InvokeFunction {
    async fn run(self: Box<Self>, ctx: &mut CommandContext<'_>) -> Result<String, Fault> {
        let service = ctx.connections.get(ctx.target)?.service();
        let InvokeFunctionPayload {
            definition_prompt,
            parameters,
            settings,
        } = self.0;
        let output = service
            .invoke_function(&definition_prompt, &parameters, settings)
            .await?;
        to_result(&InvokeFunctionResult { output })
    }
}

fn close_connection(_payload: &str) -> Result<Vec<Operation>, Fault> {
    Ok(vec![Operation::new(CLOSE_CONNECTION, CloseConnection)])
}

struct CloseConnection;

#[async_trait]
impl Action for CloseConnection {
    async fn run(self: Box<Self>, ctx: &mut CommandContext<'_>) -> Result<String, Fault> {
        let connection_id = ctx.connections.get(ctx.target)?.id();
        let removed = ctx.connections.remove(connection_id).is_some();
        to_result(&CloseConnectionResult {
            connection_id,
            removed,
        })
    }
}

fn exit(_payload: &str) -> Result<Vec<Operation>, Fault> {
    Ok(vec![Operation::synthetic(EXIT)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{OperationStatus, RequestId};
    use crate::service::{ChatMessage, Credentials, ServiceRegistry};
    use crate::worker::connections::ConnectionTable;
    use serde_json::json;

    fn table() -> ConnectionTable {
        ConnectionTable::new(ServiceRegistry::with_builtin(), Credentials::default())
    }

    async fn run_single(
        table: &mut ConnectionTable,
        command: CommandConstructor,
        payload: serde_json::Value,
        target: Option<crate::bridge::protocol::ConnectionId>,
    ) -> Operation {
        let mut ops = command(&payload.to_string()).unwrap();
        assert_eq!(ops.len(), 1);
        let mut op = ops.remove(0);
        let mut ctx = CommandContext {
            request_id: RequestId::new(),
            target,
            connections: table,
        };
        op.invoke(&mut ctx).await;
        op
    }

    #[test]
    fn standard_catalog_is_complete() {
        let table = CommandTable::standard();
        let mut names: Vec<_> = table.names().collect();
        names.sort();
        assert_eq!(
            names,
            vec!["close-connection", "create-connection", "exit", "invoke-function", "send-chat"]
        );
    }

    #[test]
    fn constructors_do_not_need_a_connection() {
        let ops = send_chat(&json!({"history": []}).to_string()).unwrap();
        assert_eq!(ops[0].status(), OperationStatus::NotStarted);
    }

    #[test]
    fn empty_payload_is_protocol_fault() {
        let err = send_chat("").err().unwrap();
        assert_eq!(err.category(), "ProtocolFault");
    }

    #[test]
    fn malformed_payload_is_protocol_fault() {
        let err = create_connection("{not json").err().unwrap();
        assert!(err.message().starts_with("invalid create-connection payload"));
    }

    #[test]
    fn blank_definition_prompt_is_rejected() {
        let err = invoke_function(&json!({"definitionPrompt": " "}).to_string()).err().unwrap();
        assert!(err.message().contains("definitionPrompt"));
    }

    #[tokio::test]
    async fn create_connection_returns_id_and_options() {
        let mut table = table();
        let op = run_single(
            &mut table,
            create_connection,
            json!({"serviceId": "echo", "options": {"model": "m"}}),
            None,
        )
        .await;
        assert_eq!(op.status(), OperationStatus::Succeeded);
        let result: CreateConnectionResult = serde_json::from_str(op.result().unwrap()).unwrap();
        assert_eq!(result.current_options, json!({"model": "m"}));
        assert!(table.get(Some(result.connection_id)).is_ok());
    }

    #[tokio::test]
    async fn send_chat_uses_target_connection() {
        let mut table = table();
        let id = table.create("echo", &json!({})).unwrap().id();
        let op = run_single(
            &mut table,
            send_chat,
            json!({"history": [ChatMessage::system("s"), ChatMessage::user("hello")]}),
            Some(id),
        )
        .await;
        let result: SendChatResult = serde_json::from_str(op.result().unwrap()).unwrap();
        assert_eq!(result.chat_response.message, ChatMessage::assistant("echo: hello"));
    }

    #[tokio::test]
    async fn send_chat_without_connection_is_bad_connection() {
        let mut table = table();
        let op = run_single(&mut table, send_chat, json!({"history": []}), None).await;
        assert_eq!(op.status(), OperationStatus::Error);
        assert!(op.fault().unwrap().is_bad_connection());
    }

    #[tokio::test]
    async fn invoke_function_returns_output() {
        let mut table = table();
        let id = table.create("echo", &json!({})).unwrap().id();
        let op = run_single(
            &mut table,
            invoke_function,
            json!({"definitionPrompt": "Hi {{$name}}", "parameters": {"name": "Ada"}}),
            Some(id),
        )
        .await;
        let result: InvokeFunctionResult = serde_json::from_str(op.result().unwrap()).unwrap();
        assert_eq!(result.output, "Hi Ada");
    }

    #[tokio::test]
    async fn close_connection_removes_entry() {
        let mut table = table();
        let id = table.create("echo", &json!({})).unwrap().id();
        let op = run_single(&mut table, close_connection, json!(null), Some(id)).await;
        let result: CloseConnectionResult = serde_json::from_str(op.result().unwrap()).unwrap();
        assert!(result.removed);
        assert!(table.is_empty());
    }

    #[test]
    fn exit_is_synthetic() {
        let ops = exit("").unwrap();
        assert_eq!(ops[0].status(), OperationStatus::Synthetic);
    }
}
