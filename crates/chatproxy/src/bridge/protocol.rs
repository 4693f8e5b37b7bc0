//! Wire protocol types for host-worker communication.
//!
//! One envelope per line. Requests flow host → worker, responses worker → host,
//! correlated by [`RequestId`]. Logical connections are multiplexed over the
//! single pipe through `TargetConnectionId`.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::fault::{Fault, FaultRecord};
use crate::service::{ChatHistory, ChatResponse, ChatSettings};

pub const CREATE_CONNECTION: &str = "create-connection";
pub const SEND_CHAT: &str = "send-chat";
pub const INVOKE_FUNCTION: &str = "invoke-function";
pub const CLOSE_CONNECTION: &str = "close-connection";
pub const EXIT: &str = "exit";

/// Correlation key for one request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(uuid::Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }

    /// The nil id is the wire's "empty" id and never correlates.
    pub fn is_empty(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Worker-side connection identifier, opaque to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A frame that can cross the pipe. `validate` runs on every decoded frame
/// before anyone sees it.
pub trait Envelope: Serialize + serde::de::DeserializeOwned {
    fn validate(&self) -> Result<(), Fault> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Request {
    pub request_id: RequestId,
    pub command_name: String,
    /// Command payload, itself serialized JSON.
    #[serde(default)]
    pub content: String,
    #[serde(default, with = "target_connection")]
    pub target_connection_id: Option<ConnectionId>,
    /// Plan the command without executing it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub what_if: bool,
}

impl Request {
    /// Request with no payload.
    pub fn bare(command_name: impl Into<String>) -> Self {
        Self {
            request_id: RequestId::new(),
            command_name: command_name.into(),
            content: String::new(),
            target_connection_id: None,
            what_if: false,
        }
    }

    pub fn new<P: Serialize>(command_name: impl Into<String>, payload: &P) -> Result<Self, Fault> {
        let content = serde_json::to_string(payload)
            .map_err(|e| Fault::protocol(format!("failed to serialize payload: {e}")))?;
        Ok(Self {
            content,
            ..Self::bare(command_name)
        })
    }

    pub fn with_target(mut self, target: Option<ConnectionId>) -> Self {
        self.target_connection_id = target;
        self
    }

    pub fn with_what_if(mut self, what_if: bool) -> Self {
        self.what_if = what_if;
        self
    }
}

impl Envelope for Request {
    fn validate(&self) -> Result<(), Fault> {
        if self.request_id.is_empty() {
            return Err(Fault::protocol("request has an empty RequestId"));
        }
        if self.command_name.trim().is_empty() {
            return Err(Fault::protocol(format!(
                "request {} has an empty CommandName",
                self.request_id
            )));
        }
        Ok(())
    }
}

/// Empty string on the wire means "unbound".
mod target_connection {
    use super::*;

    pub fn serialize<S: Serializer>(id: &Option<ConnectionId>, s: S) -> Result<S::Ok, S::Error> {
        match id {
            Some(id) => id.serialize(s),
            None => s.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<ConnectionId>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => ConnectionId::parse(s).map(Some).map_err(D::Error::custom),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    /// Never valid on a decoded response.
    #[default]
    Unknown,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseKind {
    Normal,
    WhatIf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    /// Built by the dispatcher itself; terminal, never invoked.
    Synthetic,
    NotStarted,
    Succeeded,
    Error,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::NotStarted)
    }
}

/// Wire form of a dispatch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OperationRecord {
    pub name: String,
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<FaultRecord>,
}

/// Content and Plan are mutually exclusive; the kind picks which one exists.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// One result string per executed operation.
    Normal(Vec<String>),
    /// Operations that were planned but not executed.
    WhatIf(Vec<OperationRecord>),
}

impl ResponseBody {
    pub fn kind(&self) -> ResponseKind {
        match self {
            Self::Normal(_) => ResponseKind::Normal,
            Self::WhatIf(_) => ResponseKind::WhatIf,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawResponse", into = "RawResponse")]
pub struct Response {
    pub request_id: RequestId,
    pub status: ResponseStatus,
    pub body: ResponseBody,
    pub faults: Vec<FaultRecord>,
}

impl Response {
    pub fn success(request_id: RequestId, content: Vec<String>) -> Self {
        Self {
            request_id,
            status: ResponseStatus::Success,
            body: ResponseBody::Normal(content),
            faults: Vec::new(),
        }
    }

    pub fn failure(request_id: RequestId, fault: &Fault) -> Self {
        Self {
            request_id,
            status: ResponseStatus::Error,
            body: ResponseBody::Normal(Vec::new()),
            faults: vec![fault.record()],
        }
    }

    pub fn kind(&self) -> ResponseKind {
        self.body.kind()
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    pub fn content(&self) -> Option<&[String]> {
        match &self.body {
            ResponseBody::Normal(content) => Some(content),
            ResponseBody::WhatIf(_) => None,
        }
    }

    pub fn plan(&self) -> Option<&[OperationRecord]> {
        match &self.body {
            ResponseBody::WhatIf(plan) => Some(plan),
            ResponseBody::Normal(_) => None,
        }
    }

    pub fn first_fault(&self) -> Option<&FaultRecord> {
        self.faults.first()
    }

    /// Error response whose first fault says the connection is unknown.
    pub fn is_bad_connection(&self) -> bool {
        self.status == ResponseStatus::Error
            && self.first_fault().is_some_and(FaultRecord::is_bad_connection)
    }

    /// First content entry of a successful normal response, or the fault
    /// rebuilt from the first fault record.
    pub fn into_single_result(self) -> Result<String, Fault> {
        if self.status == ResponseStatus::Error {
            return Err(self
                .faults
                .into_iter()
                .next()
                .map(FaultRecord::into_fault)
                .unwrap_or_else(|| Fault::protocol("error response carried no faults")));
        }
        match self.body {
            ResponseBody::Normal(content) => content
                .into_iter()
                .next()
                .ok_or_else(|| Fault::protocol("response carried no content")),
            ResponseBody::WhatIf(_) => Err(Fault::protocol("expected content, got a what-if plan")),
        }
    }
}

impl Envelope for Response {}

/// Wire mirror of [`Response`] with the nullable Content/Plan pair.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawResponse {
    request_id: RequestId,
    #[serde(default)]
    status: ResponseStatus,
    kind: ResponseKind,
    content: Option<Vec<String>>,
    plan: Option<Vec<OperationRecord>>,
    #[serde(default)]
    faults: Option<Vec<FaultRecord>>,
}

impl TryFrom<RawResponse> for Response {
    type Error = Fault;

    fn try_from(raw: RawResponse) -> Result<Self, Self::Error> {
        if raw.request_id.is_empty() {
            return Err(Fault::protocol("response has an empty RequestId"));
        }
        if raw.status == ResponseStatus::Unknown {
            return Err(Fault::protocol(format!(
                "response {} has status Unknown",
                raw.request_id
            )));
        }
        let body = match (raw.kind, raw.content, raw.plan) {
            (_, Some(_), Some(_)) => {
                return Err(Fault::protocol(format!(
                    "response {} carries both Content and Plan",
                    raw.request_id
                )));
            }
            (ResponseKind::Normal, content, None) => ResponseBody::Normal(content.unwrap_or_default()),
            (ResponseKind::WhatIf, None, plan) => ResponseBody::WhatIf(plan.unwrap_or_default()),
            (ResponseKind::Normal, None, Some(_)) => {
                return Err(Fault::protocol(format!(
                    "response {} is Normal but carries a Plan",
                    raw.request_id
                )));
            }
            (ResponseKind::WhatIf, Some(_), None) => {
                return Err(Fault::protocol(format!(
                    "response {} is WhatIf but carries Content",
                    raw.request_id
                )));
            }
        };
        Ok(Self {
            request_id: raw.request_id,
            status: raw.status,
            body,
            faults: raw.faults.unwrap_or_default(),
        })
    }
}

impl From<Response> for RawResponse {
    fn from(response: Response) -> Self {
        let kind = response.kind();
        let (content, plan) = match response.body {
            ResponseBody::Normal(content) => (Some(content), None),
            ResponseBody::WhatIf(plan) => (None, Some(plan)),
        };
        Self {
            request_id: response.request_id,
            status: response.status,
            kind,
            content,
            plan,
            faults: (!response.faults.is_empty()).then_some(response.faults),
        }
    }
}

// Command payloads and results.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConnectionPayload {
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub options: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConnectionResult {
    pub connection_id: ConnectionId,
    pub current_options: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendChatPayload {
    pub history: ChatHistory,
    #[serde(flatten)]
    pub settings: ChatSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendChatResult {
    pub chat_response: ChatResponse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeFunctionPayload {
    pub definition_prompt: String,
    #[serde(default)]
    pub parameters: std::collections::BTreeMap<String, String>,
    #[serde(flatten)]
    pub settings: ChatSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeFunctionResult {
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseConnectionResult {
    pub connection_id: ConnectionId,
    pub removed: bool,
}
