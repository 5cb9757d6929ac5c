//! Inbound relay request and outbound completion payload

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RequestDefaults;

/// One conversation turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    /// Plain string, or an array of content parts
    pub content: Value,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Value::String(content.into()),
        }
    }

    /// Text of the message, joining `text` parts of multi-part content
    pub fn text(&self) -> Option<String> {
        match &self.content {
            Value::String(s) => Some(s.clone()),
            Value::Array(parts) => {
                let texts: Vec<&str> = parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(Value::as_str))
                    .collect();
                if texts.is_empty() {
                    None
                } else {
                    Some(texts.join(" "))
                }
            }
            _ => None,
        }
    }
}

/// Body the calling client POSTs to the relay
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayRequest {
    #[serde(default)]
    pub conversation_history: Vec<ChatMessage>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: Option<bool>,
    /// Mode selector, e.g. "PARENT", "STUDENT", "DEVELOPER"
    #[serde(default)]
    pub mode: Option<String>,
}

impl RelayRequest {
    /// Content of the latest user turn, used as the retrieval query
    pub fn latest_user_query(&self) -> Option<String> {
        self.conversation_history
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .and_then(ChatMessage::text)
    }

    /// Build the outbound payload: system message first, then the history
    pub fn into_completion(self, system_prompt: String, defaults: &RequestDefaults) -> CompletionRequest {
        let mut messages = Vec::with_capacity(self.conversation_history.len() + 1);
        messages.push(ChatMessage::new("system", system_prompt));
        messages.extend(self.conversation_history);

        CompletionRequest {
            model: self.model.unwrap_or_else(|| defaults.model.clone()),
            messages,
            temperature: self.temperature.unwrap_or(defaults.temperature),
            top_p: self.top_p.unwrap_or(defaults.top_p),
            max_tokens: self.max_tokens.unwrap_or(defaults.max_tokens),
            stream: self.stream.unwrap_or(defaults.stream),
        }
    }
}

/// OpenAI-compatible chat completion request sent upstream
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
    pub stream: bool,
}
