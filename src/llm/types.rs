//! LLM request/response types
//!
//! Provider-agnostic request and response records plus an incremental
//! request builder.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub prompt: String,

    pub model: String,

    pub temperature: f32,

    pub max_tokens: u32,

    /// Optional system message prepended to the conversation
    #[serde(default)]
    pub system_message: Option<String>,

    /// Structured context rendered into the prompt
    #[serde(default)]
    pub context: Option<HashMap<String, String>>,

    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

/// Token accounting echoed back by the provider
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// One completion response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub success: bool,

    /// Generated text; empty when `success` is false
    pub content: String,

    pub error: Option<String>,

    pub usage: TokenUsage,

    /// Model name echoed back
    pub model: String,

    pub duration_ms: u64,
}

impl LlmResponse {
    pub fn ok(content: impl Into<String>, model: impl Into<String>, usage: TokenUsage, duration_ms: u64) -> Self {
        Self {
            success: true,
            content: content.into(),
            error: None,
            usage,
            model: model.into(),
            duration_ms,
        }
    }

    pub fn failure(error: impl std::fmt::Display, model: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            content: String::new(),
            error: Some(error.to_string()),
            usage: TokenUsage::default(),
            model: model.into(),
            duration_ms,
        }
    }
}

/// Incremental builder producing an immutable [`LlmRequest`]
#[derive(Debug, Clone)]
pub struct LlmRequestBuilder {
    model: String,
    temperature: f32,
    system_message: Option<String>,
    context: Option<HashMap<String, String>>,
    metadata: Option<HashMap<String, String>>,
}

impl LlmRequestBuilder {
    pub fn new(model: impl Into<String>, temperature: f32) -> Self {
        Self {
            model: model.into(),
            temperature,
            system_message: None,
            context: None,
            metadata: None,
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn system_message(mut self, message: impl Into<String>) -> Self {
        self.system_message = Some(message.into());
        self
    }

    pub fn context(mut self, context: HashMap<String, String>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn build(self, prompt: impl Into<String>, max_tokens: u32) -> LlmRequest {
        LlmRequest {
            prompt: prompt.into(),
            model: self.model,
            temperature: self.temperature,
            max_tokens,
            system_message: self.system_message,
            context: self.context,
            metadata: self.metadata,
        }
    }
}

/// Render the structured context map into prompt text
pub(crate) fn format_context(context: &HashMap<String, String>) -> String {
    let mut keys: Vec<&String> = context.keys().collect();
    keys.sort();
    let mut out = String::from("\n\nContext:\n");
    for key in keys {
        out.push_str(&format!("- {}: {}\n", key, context[key]));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_produces_request() {
        let request = LlmRequestBuilder::new("gpt-4", 0.3)
            .system_message("You are a planner")
            .build("plan this", 2000);

        assert_eq!(request.model, "gpt-4");
        assert_eq!(request.temperature, 0.3);
        assert_eq!(request.max_tokens, 2000);
        assert_eq!(request.system_message.as_deref(), Some("You are a planner"));
        assert!(request.context.is_none());
    }

    #[test]
    fn test_builder_overrides() {
        let request = LlmRequestBuilder::new("gpt-4", 0.7)
            .model("gpt-4o")
            .temperature(0.1)
            .build("x", 100);

        assert_eq!(request.model, "gpt-4o");
        assert_eq!(request.temperature, 0.1);
    }

    #[test]
    fn test_response_failure() {
        let response = LlmResponse::failure("connection refused", "gpt-4", 42);
        assert!(!response.success);
        assert!(response.content.is_empty());
        assert_eq!(response.error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_format_context_sorted() {
        let mut context = HashMap::new();
        context.insert("os".to_string(), "ubuntu".to_string());
        context.insert("arch".to_string(), "x86_64".to_string());

        let text = format_context(&context);
        let arch_pos = text.find("arch").unwrap();
        let os_pos = text.find("os:").unwrap();
        assert!(arch_pos < os_pos);
    }
}
