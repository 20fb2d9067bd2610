//! Gemini generateContent client

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::debug;

use super::types::format_context;
use super::{LlmError, LlmProvider, LlmRequest, LlmResponse, TokenUsage};
use crate::config::LlmConfig;

/// Client for the Gemini `generateContent` API
pub struct GeminiProvider {
    api_key: String,
    base_url: String,
    http: Client,
    timeout: Duration,
}

impl GeminiProvider {
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

    /// Gemini has no separate system role in this API shape; the system
    /// message and context are folded into the single user prompt.
    fn build_prompt(&self, request: &LlmRequest) -> String {
        let mut prompt = String::new();
        if let Some(system) = &request.system_message {
            prompt.push_str(system);
            prompt.push_str("\n\n");
        }
        prompt.push_str(&request.prompt);
        if let Some(context) = &request.context {
            prompt.push_str(&format_context(context));
        }
        prompt
    }

    async fn generate_inner(&self, request: &LlmRequest) -> Result<(String, TokenUsage), LlmError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, request.model, self.api_key
        );

        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": self.build_prompt(request) }] }],
            "generationConfig": {
                "temperature": request.temperature,
                "maxOutputTokens": request.max_tokens,
            }
        });

        let response = self.http.post(&url).json(&body).send().await.map_err(|e| {
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

        let api: GenerateResponse = response.json().await.map_err(LlmError::Network)?;
        let content = api
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .filter(|t| !t.trim().is_empty())
            .ok_or(LlmError::Empty)?;

        let usage = api
            .usage_metadata
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_token_count,
                completion_tokens: u.candidates_token_count,
                total_tokens: u.total_token_count,
            })
            .unwrap_or_default();

        Ok((content, usage))
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    async fn generate(&self, request: LlmRequest) -> LlmResponse {
        let start = Instant::now();
        let model = request.model.clone();

        match self.generate_inner(&request).await {
            Ok((content, usage)) => {
                let duration_ms = start.elapsed().as_millis() as u64;
                debug!(model = %model, duration_ms, "gemini completion ok");
                LlmResponse::ok(content, model, usage, duration_ms)
            }
            Err(e) => {
                let duration_ms = start.elapsed().as_millis() as u64;
                debug!(model = %model, error = %e, "gemini completion failed");
                LlmResponse::failure(e, model, duration_ms)
            }
        }
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/v1beta/models?key={}", self.base_url, self.api_key);
        match self.http.get(&url).timeout(Duration::from_secs(10)).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

// Wire types for generateContent

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u64,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u64,
    #[serde(rename = "totalTokenCount", default)]
    total_token_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_prompt_folds_system_message() {
        let config = LlmConfig {
            api_key: "g-test".to_string(),
            ..LlmConfig::default()
        };
        let provider = GeminiProvider::from_config(&config).unwrap();

        let request = LlmRequest {
            prompt: "plan the steps".to_string(),
            model: "gemini-1.5-pro".to_string(),
            temperature: 0.3,
            max_tokens: 1000,
            system_message: Some("You are a sysadmin".to_string()),
            context: None,
            metadata: None,
        };

        let prompt = provider.build_prompt(&request);
        assert!(prompt.starts_with("You are a sysadmin"));
        assert!(prompt.contains("plan the steps"));
    }

    #[test]
    fn test_parse_generate_response() {
        let json = r#"{
            "candidates": [{"content": {"parts": [{"text": "hello"}]}}],
            "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2, "totalTokenCount": 6}
        }"#;
        let response: GenerateResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.candidates[0].content.parts[0].text, "hello");
        assert_eq!(response.usage_metadata.unwrap().total_token_count, 6);
    }
}
