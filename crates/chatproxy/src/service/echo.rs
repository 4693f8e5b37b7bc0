//! Echo provider: answers every chat with the last user message.
//!
//! Used for local development and as the side-effect counter in tests. Options:
//! `model` (string, defaults to `"echo"`) and `failWith` (string, makes every
//! call fail with a backend error).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{
    AuthorRole, ChatHistory, ChatMessage, ChatResponse, ChatService, ChatSettings, Credentials,
    ServiceError, TokenUsage,
};
use crate::fault::Fault;

pub const ECHO_SERVICE_ID: &str = "echo";

pub struct EchoService {
    model: String,
    fail_with: Option<String>,
    calls: AtomicUsize,
}

impl EchoService {
    pub fn new(options: serde_json::Value) -> Self {
        let model = options
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or(ECHO_SERVICE_ID)
            .to_string();
        let fail_with = options
            .get("failWith")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Self {
            model,
            fail_with,
            calls: AtomicUsize::new(0),
        }
    }

    /// Builder for the registry. Rejects non-object options.
    pub fn builder()
    -> impl Fn(&serde_json::Value, &Credentials) -> Result<Arc<dyn ChatService>, Fault> + Send + Sync
    {
        |options: &serde_json::Value, _credentials: &Credentials| {
            if !options.is_object() {
                return Err(Fault::configuration("echo options must be a JSON object"));
            }
            if options.get("model").is_some_and(|m| !m.is_string()) {
                return Err(Fault::configuration("echo option 'model' must be a string")
                    .with_property("field", "model"));
            }
            Ok(Arc::new(EchoService::new(options.clone())) as Arc<dyn ChatService>)
        }
    }

    /// Number of send-chat and invoke-function calls served.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn record_call(&self) -> Result<(), ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.fail_with {
            Some(message) => Err(ServiceError::Backend(message.clone())),
            None => Ok(()),
        }
    }
}

fn rough_tokens(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

#[async_trait]
impl ChatService for EchoService {
    async fn send_chat(
        &self,
        history: ChatHistory,
        _settings: ChatSettings,
    ) -> Result<ChatResponse, ServiceError> {
        self.record_call()?;
        let last_user = history
            .iter()
            .rev()
            .find(|m| m.role == AuthorRole::User)
            .ok_or_else(|| ServiceError::InvalidRequest("history has no user message".into()))?;
        let prompt_tokens = history.iter().map(|m| rough_tokens(&m.content)).sum();
        let reply = format!("echo: {}", last_user.content);
        Ok(ChatResponse {
            usage: Some(TokenUsage {
                prompt_tokens,
                completion_tokens: rough_tokens(&reply),
            }),
            message: ChatMessage::assistant(reply),
        })
    }

    async fn invoke_function(
        &self,
        definition_prompt: &str,
        parameters: &BTreeMap<String, String>,
        _settings: ChatSettings,
    ) -> Result<String, ServiceError> {
        self.record_call()?;
        let mut rendered = definition_prompt.to_string();
        for (name, value) in parameters {
            rendered = rendered.replace(&format!("{{{{${name}}}}}"), value);
        }
        Ok(rendered)
    }

    fn current_options(&self) -> serde_json::Value {
        serde_json::json!({ "model": self.model })
    }
}
