//! LLM error kinds

use std::time::Duration;
use thiserror::Error;

/// Errors produced while talking to an LLM backend
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Provider error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Provider returned an empty response")]
    Empty,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid provider configuration: {0}")]
    InvalidConfig(String),
}

impl LlmError {
    /// Whether retrying the same request could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Timeout(_) => true,
            LlmError::Network(_) => true,
            LlmError::Api { status, .. } => *status >= 500 || *status == 429,
            LlmError::Auth(_) => false,
            LlmError::Empty => false,
            LlmError::Json(_) => false,
            LlmError::InvalidConfig(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable() {
        assert!(LlmError::Timeout(Duration::from_secs(60)).is_retryable());
        assert!(
            LlmError::Api {
                status: 503,
                message: "overloaded".to_string()
            }
            .is_retryable()
        );
        assert!(
            LlmError::Api {
                status: 429,
                message: "rate limited".to_string()
            }
            .is_retryable()
        );
        assert!(
            !LlmError::Api {
                status: 400,
                message: "bad request".to_string()
            }
            .is_retryable()
        );
        assert!(!LlmError::Auth("bad key".to_string()).is_retryable());
        assert!(!LlmError::Empty.is_retryable());
    }
}
