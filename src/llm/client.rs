//! The provider capability set

use async_trait::async_trait;

use super::types::{LlmRequest, LlmResponse};

/// Capability set every LLM backend implements.
///
/// Failure modes (network timeout, auth failure, provider error, empty
/// response) are all yielded as a response with `success = false` and
/// `error` set, so callers branch on one flag.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Run one completion request
    async fn generate(&self, request: LlmRequest) -> LlmResponse;

    /// Probe whether the backend is reachable with the configured credentials
    async fn is_available(&self) -> bool;
}
