//! Fault taxonomy shared by host and worker.
//!
//! A [`Fault`] is a live error value. It never crosses the pipe: the worker
//! downcasts every fault into a [`FaultRecord`] before putting it in a
//! response, and the host rebuilds a `Fault` from the record when it needs to
//! surface one to a caller.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::bridge::protocol::ConnectionId;

/// Property key used to tag specific fault kinds inside the property bag.
pub const TAG_PROPERTY: &str = "tag";

/// Tag value meaning "the worker has no record of this connection id".
pub const BAD_CONNECTION_TAG: &str = "bad-connection";

/// Property key holding the rendered source chain of a live fault. It travels
/// as `FaultRecord::stack`, not inside the property bag.
const STACK_PROPERTY: &str = "stack";

pub type Properties = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Fault {
    /// Missing or invalid options. Fatal, never retried.
    #[error("{message}")]
    Configuration {
        message: String,
        properties: Properties,
    },

    /// The worker does not know the referenced connection.
    #[error("{message}")]
    Connection {
        message: String,
        properties: Properties,
    },

    /// Failure inside the chat-service collaborator.
    #[error("{message}")]
    Service {
        message: String,
        properties: Properties,
    },

    /// Malformed envelope, mismatched ids, Content and Plan both set.
    #[error("{message}")]
    Protocol {
        message: String,
        properties: Properties,
    },

    /// Worker failed to start or died.
    #[error("{message}")]
    Process {
        message: String,
        properties: Properties,
    },

    /// Operation not allowed in the current run state.
    #[error("{message}")]
    InvalidState {
        message: String,
        properties: Properties,
    },
}

impl Fault {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            properties: Properties::new(),
        }
    }

    pub fn service(message: impl Into<String>) -> Self {
        Self::Service {
            message: message.into(),
            properties: Properties::new(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            properties: Properties::new(),
        }
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::Process {
            message: message.into(),
            properties: Properties::new(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
            properties: Properties::new(),
        }
    }

    /// Connection lookup miss, tagged so the host transport can retry.
    pub fn bad_connection(id: Option<ConnectionId>) -> Self {
        let mut properties = Properties::new();
        properties.insert(TAG_PROPERTY.to_string(), BAD_CONNECTION_TAG.into());
        let message = match id {
            Some(id) => {
                properties.insert("connectionId".to_string(), id.to_string().into());
                format!("connection not found: {id}")
            }
            None => "request is not bound to a connection".to_string(),
        };
        Self::Connection {
            message,
            properties,
        }
    }

    /// Category name carried across the wire.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "ConfigurationFault",
            Self::Connection { .. } => "ConnectionFault",
            Self::Service { .. } => "ServiceFault",
            Self::Protocol { .. } => "ProtocolFault",
            Self::Process { .. } => "ProcessFault",
            Self::InvalidState { .. } => "InvalidStateFault",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Configuration { message, .. }
            | Self::Connection { message, .. }
            | Self::Service { message, .. }
            | Self::Protocol { message, .. }
            | Self::Process { message, .. }
            | Self::InvalidState { message, .. } => message,
        }
    }

    pub fn properties(&self) -> &Properties {
        match self {
            Self::Configuration { properties, .. }
            | Self::Connection { properties, .. }
            | Self::Service { properties, .. }
            | Self::Protocol { properties, .. }
            | Self::Process { properties, .. }
            | Self::InvalidState { properties, .. } => properties,
        }
    }

    fn properties_mut(&mut self) -> &mut Properties {
        match self {
            Self::Configuration { properties, .. }
            | Self::Connection { properties, .. }
            | Self::Service { properties, .. }
            | Self::Protocol { properties, .. }
            | Self::Process { properties, .. }
            | Self::InvalidState { properties, .. } => properties,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.properties_mut().insert(key.into(), value.into());
        self
    }

    pub fn with_stack(self, stack: impl Into<String>) -> Self {
        self.with_property(STACK_PROPERTY, stack.into())
    }

    /// Rendered source chain of the error this fault was built from.
    pub fn stack(&self) -> Option<&str> {
        self.properties().get(STACK_PROPERTY).and_then(|v| v.as_str())
    }

    pub fn is_bad_connection(&self) -> bool {
        has_bad_connection_tag(self.properties())
    }

    /// Downcast into the serializable record that travels in a response.
    pub fn record(&self) -> FaultRecord {
        let mut properties = self.properties().clone();
        let stack = properties
            .remove(STACK_PROPERTY)
            .and_then(|v| v.as_str().map(str::to_string));
        FaultRecord {
            message: self.message().to_string(),
            category: self.category().to_string(),
            stack,
            properties,
        }
    }

    /// Attach the rendered source chain of `error`, if it has one.
    pub fn with_source_chain(self, error: &(dyn std::error::Error + 'static)) -> Self {
        match render_chain(error) {
            Some(stack) => self.with_stack(stack),
            None => self,
        }
    }
}

/// Pipe I/O failures mean the worker is gone or unreachable.
impl From<std::io::Error> for Fault {
    fn from(e: std::io::Error) -> Self {
        Fault::process(format!("pipe I/O error: {e}"))
    }
}

fn has_bad_connection_tag(properties: &Properties) -> bool {
    properties
        .get(TAG_PROPERTY)
        .and_then(|v| v.as_str())
        .is_some_and(|tag| tag == BAD_CONNECTION_TAG)
}

/// Serializable fault: message, category name, stack text, property bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FaultRecord {
    pub message: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: Properties,
}

impl FaultRecord {
    /// Record an arbitrary error, keeping its source chain as stack text.
    ///
    /// A `Fault` anywhere at the top of the chain keeps its own category and
    /// properties; anything else is reported as a `ServiceFault`.
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut record = match error.downcast_ref::<Fault>() {
            Some(fault) => fault.record(),
            None => Fault::service(error.to_string()).record(),
        };
        if let Some(stack) = render_chain(error) {
            record.stack = Some(stack);
        }
        record
    }

    pub fn is_bad_connection(&self) -> bool {
        self.category == "ConnectionFault" && has_bad_connection_tag(&self.properties)
    }

    /// Rebuild a live fault. Unknown categories map to `Service`.
    pub fn into_fault(self) -> Fault {
        let FaultRecord {
            message,
            category,
            stack,
            mut properties,
        } = self;
        if let Some(stack) = stack {
            properties.insert(STACK_PROPERTY.to_string(), stack.into());
        }
        match category.as_str() {
            "ConfigurationFault" => Fault::Configuration { message, properties },
            "ConnectionFault" => Fault::Connection { message, properties },
            "ProtocolFault" => Fault::Protocol { message, properties },
            "ProcessFault" => Fault::Process { message, properties },
            "InvalidStateFault" => Fault::InvalidState { message, properties },
            _ => Fault::Service { message, properties },
        }
    }
}

impl From<Fault> for FaultRecord {
    fn from(fault: Fault) -> Self {
        fault.record()
    }
}

fn render_chain(error: &(dyn std::error::Error + 'static)) -> Option<String> {
    let mut source = error.source();
    if source.is_none() {
        return None;
    }
    let mut out = String::new();
    let mut depth = 0;
    while let Some(cause) = source {
        let _ = writeln!(out, "{depth}: {cause}");
        depth += 1;
        source = cause.source();
    }
    Some(out.trim_end().to_string())
}
