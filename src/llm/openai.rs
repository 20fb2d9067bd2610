//! OpenAI-compatible chat completions client

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::debug;

use super::types::format_context;
use super::{LlmError, LlmProvider, LlmRequest, LlmResponse, TokenUsage};
use crate::config::LlmConfig;

/// Client for any OpenAI-compatible `/chat/completions` endpoint
pub struct OpenAiProvider {
    api_key: String,
    base_url: String,
    http: Client,
    timeout: Duration,
}

impl OpenAiProvider {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        if config.api_key.trim().is_empty() {
            return Err(LlmError::InvalidConfig("api_key is empty".to_string()));
        }
        let timeout = config.timeout_duration();
        let http = Client::builder().timeout(timeout).build().map_err(LlmError::Network)?;

        Ok(Self {
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http,
            timeout,
        })
    }

    fn build_body(&self, request: &LlmRequest) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system_message {
            messages.push(serde_json::json!({ "role": "system", "content": system }));
        }

        let mut prompt = request.prompt.clone();
        if let Some(context) = &request.context {
            prompt.push_str(&format_context(context));
        }
        messages.push(serde_json::json!({ "role": "user", "content": prompt }));

        serde_json::json!({
            "model": request.model,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        })
    }

    async fn generate_inner(&self, request: &LlmRequest) -> Result<(String, TokenUsage), LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(request);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(self.timeout)
                } else {
                    LlmError::Network(e)
                }
            })?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Auth(text));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message: text,
            });
        }

        let api: ChatResponse = response.json().await.map_err(LlmError::Network)?;
        let content = api
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(LlmError::Empty)?;

        let usage = api.usage.map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        Ok((content, usage.unwrap_or_default()))
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn generate(&self, request: LlmRequest) -> LlmResponse {
        let start = Instant::now();
        let model = request.model.clone();

        match self.generate_inner(&request).await {
            Ok((content, usage)) => {
                let duration_ms = start.elapsed().as_millis() as u64;
                debug!(model = %model, duration_ms, tokens = usage.total_tokens, "completion ok");
                LlmResponse::ok(content, model, usage, duration_ms)
            }
            Err(e) => {
                let duration_ms = start.elapsed().as_millis() as u64;
                debug!(model = %model, error = %e, "completion failed");
                LlmResponse::failure(e, model, duration_ms)
            }
        }
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/models", self.base_url);
        match self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

// Wire types for the chat completions response

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> OpenAiProvider {
        let config = LlmConfig {
            api_key: "sk-test".to_string(),
            ..LlmConfig::default()
        };
        OpenAiProvider::from_config(&config).unwrap()
    }

    #[test]
    fn test_from_config_requires_key() {
        let config = LlmConfig::default();
        assert!(OpenAiProvider::from_config(&config).is_err());
    }

    #[test]
    fn test_build_body_basic() {
        let request = LlmRequest {
            prompt: "hello".to_string(),
            model: "gpt-4".to_string(),
            temperature: 0.2,
            max_tokens: 500,
            system_message: Some("be brief".to_string()),
            context: None,
            metadata: None,
        };

        let body = provider().build_body(&request);
        assert_eq!(body["model"], "gpt-4");
        assert_eq!(body["max_tokens"], 500);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][1]["content"], "hello");
    }

    #[test]
    fn test_build_body_renders_context() {
        let mut context = std::collections::HashMap::new();
        context.insert("os".to_string(), "ubuntu".to_string());

        let request = LlmRequest {
            prompt: "plan".to_string(),
            model: "gpt-4".to_string(),
            temperature: 0.2,
            max_tokens: 500,
            system_message: None,
            context: Some(context),
            metadata: None,
        };

        let body = provider().build_body(&request);
        let content = body["messages"][0]["content"].as_str().unwrap();
        assert!(content.contains("os: ubuntu"));
    }

    #[test]
    fn test_parse_chat_response() {
        let json = r#"{
            "choices": [{"message": {"content": "done"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }"#;
        let response: ChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.choices[0].message.content.as_deref(), Some("done"));
        assert_eq!(response.usage.unwrap().total_tokens, 15);
    }
}
