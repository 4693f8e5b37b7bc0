//! Chat-service capability consumed by the worker.
//!
//! The worker never talks to an AI backend itself. It asks a
//! [`ServiceRegistry`] to build a [`ChatService`] for a service id plus
//! options, binds it to a connection, and forwards commands to it.

mod echo;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::fault::Fault;

pub use echo::{ECHO_SERVICE_ID, EchoService};

/// Environment variable carrying the provider API key into the worker.
pub const API_KEY_ENV: &str = "CHATPROXY_API_KEY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: AuthorRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: AuthorRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: AuthorRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: AuthorRole::Assistant,
            content: content.into(),
        }
    }
}

pub type ChatHistory = Vec<ChatMessage>;

/// Per-call knobs forwarded to the service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSettings {
    /// Names of plugins the service may call into.
    #[serde(default)]
    pub plugins: Vec<String>,
    #[serde(default)]
    pub allow_function_call: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub message: ChatMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

/// Failure reported by a chat service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("backend request failed: {0}")]
    Backend(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl From<ServiceError> for Fault {
    fn from(e: ServiceError) -> Self {
        Fault::service(e.to_string()).with_source_chain(&e)
    }
}

/// The narrow interface the worker needs from an AI backend.
#[async_trait]
pub trait ChatService: Send + Sync {
    /// Complete the conversation with one assistant message.
    async fn send_chat(
        &self,
        history: ChatHistory,
        settings: ChatSettings,
    ) -> Result<ChatResponse, ServiceError>;

    /// Run a semantic function defined by a prompt template.
    async fn invoke_function(
        &self,
        definition_prompt: &str,
        parameters: &BTreeMap<String, String>,
        settings: ChatSettings,
    ) -> Result<String, ServiceError>;

    /// Effective options, with secrets omitted.
    fn current_options(&self) -> serde_json::Value;
}

/// Secret material for a service. Never serialized, never logged.
#[derive(Clone, Default)]
pub struct Credentials {
    api_key: Option<String>,
}

impl Credentials {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var(API_KEY_ENV).ok())
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Builds service instances for one provider.
pub trait ServiceBuilder: Send + Sync {
    fn build(
        &self,
        options: &serde_json::Value,
        credentials: &Credentials,
    ) -> Result<Arc<dyn ChatService>, Fault>;
}

impl<F> ServiceBuilder for F
where
    F: Fn(&serde_json::Value, &Credentials) -> Result<Arc<dyn ChatService>, Fault> + Send + Sync,
{
    fn build(
        &self,
        options: &serde_json::Value,
        credentials: &Credentials,
    ) -> Result<Arc<dyn ChatService>, Fault> {
        self(options, credentials)
    }
}

/// Service id → builder.
#[derive(Default, Clone)]
pub struct ServiceRegistry {
    builders: HashMap<String, Arc<dyn ServiceBuilder>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in providers.
    pub fn with_builtin() -> Self {
        Self::new().with_builder(ECHO_SERVICE_ID, EchoService::builder())
    }

    pub fn with_builder(mut self, service_id: impl Into<String>, builder: impl ServiceBuilder + 'static) -> Self {
        self.register(service_id, builder);
        self
    }

    pub fn register(&mut self, service_id: impl Into<String>, builder: impl ServiceBuilder + 'static) {
        self.builders.insert(service_id.into(), Arc::new(builder));
    }

    pub fn contains(&self, service_id: &str) -> bool {
        self.builders.contains_key(service_id)
    }

    pub fn build(
        &self,
        service_id: &str,
        options: &serde_json::Value,
        credentials: &Credentials,
    ) -> Result<Arc<dyn ChatService>, Fault> {
        let builder = self.builders.get(service_id).ok_or_else(|| {
            Fault::configuration(format!("unknown service id: {service_id}"))
                .with_property("serviceId", service_id)
        })?;
        builder.build(options, credentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn credentials_debug_redacts_key() {
        let creds = Credentials::new(Some("sk-secret".to_string()));
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn empty_api_key_is_none() {
        assert!(Credentials::new(Some(String::new())).api_key().is_none());
    }

    #[test]
    fn unknown_service_is_configuration_fault() {
        let registry = ServiceRegistry::with_builtin();
        let err = registry
            .build("azure-openai", &json!({}), &Credentials::default())
            .err()
            .unwrap();
        assert_eq!(err.category(), "ConfigurationFault");
        assert!(err.message().contains("azure-openai"));
    }

    #[test]
    fn closures_register_as_builders() {
        let registry = ServiceRegistry::new().with_builder(
            "custom",
            |options: &serde_json::Value, _: &Credentials| -> Result<Arc<dyn ChatService>, Fault> {
                Ok(Arc::new(EchoService::new(options.clone())))
            },
        );
        assert!(registry.contains("custom"));
        assert!(registry.build("custom", &json!({"model": "m"}), &Credentials::default()).is_ok());
    }

    #[test]
    fn author_role_serializes_lowercase() {
        let msg = ChatMessage::assistant("hello");
        insta::assert_json_snapshot!(msg, @r#"
        {
          "role": "assistant",
          "content": "hello"
        }
        "#);
    }
}
