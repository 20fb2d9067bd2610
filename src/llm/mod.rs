//! LLM provider interface
//!
//! Providers implement the [`LlmProvider`] capability set
//! (generate + availability). Two HTTP providers are included
//! (OpenAI-compatible and Gemini) plus a deterministic mock for tests
//! and offline use.

use std::sync::Arc;

use tracing::{debug, warn};

mod client;
mod error;
mod gemini;
mod mock;
mod openai;
mod types;

pub use client::LlmProvider;
pub use error::LlmError;
pub use gemini::GeminiProvider;
pub use mock::MockProvider;
pub use openai::OpenAiProvider;
pub use types::{LlmRequest, LlmRequestBuilder, LlmResponse, TokenUsage};

use crate::config::LlmConfig;

/// Create a provider from configuration
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    debug!(provider = %config.provider, model = %config.model, "create_provider: called");
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiProvider::from_config(config)?)),
        "gemini" => Ok(Arc::new(GeminiProvider::from_config(config)?)),
        other => Err(LlmError::InvalidConfig(format!(
            "Unknown LLM provider: '{}'. Supported: openai, gemini",
            other
        ))),
    }
}

/// Create the configured provider, falling back to the mock when the
/// provider cannot be built or reports unavailable at startup.
pub async fn create_provider_with_fallback(config: &LlmConfig) -> Arc<dyn LlmProvider> {
    match create_provider(config) {
        Ok(provider) => {
            if provider.is_available().await {
                provider
            } else {
                warn!(provider = %config.provider, "LLM provider unavailable, falling back to mock");
                Arc::new(MockProvider::new())
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to create LLM provider, falling back to mock");
            Arc::new(MockProvider::new())
        }
    }
}
