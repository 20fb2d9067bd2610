//! Deterministic mock provider for tests and offline use

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{LlmProvider, LlmRequest, LlmResponse, TokenUsage};

/// Canned planning response: an ordered step plan
const MOCK_PLANNING_RESPONSE: &str = r#"{
    "steps": [
        {
            "title": "Prepare the system",
            "description": "Refresh the package index and install prerequisites",
            "priority": "high",
            "estimated_duration": 10,
            "dependencies": []
        },
        {
            "title": "Configure the service",
            "description": "Install, configure, and start the service",
            "priority": "high",
            "estimated_duration": 15,
            "dependencies": [0]
        },
        {
            "title": "Verify the deployment",
            "description": "Check that the service answers requests",
            "priority": "medium",
            "estimated_duration": 5,
            "dependencies": [1]
        }
    ]
}"#;

/// Canned execution response: subtasks with commands and health checks
const MOCK_EXECUTION_RESPONSE: &str = r#"{
    "subtasks": [
        {
            "title": "Update package index",
            "description": "Refresh the apt package lists",
            "commands": ["sudo apt update"],
            "health_checks": ["apt list --upgradable | wc -l"],
            "expected_output": "Package index refreshed",
            "rollback_commands": [],
            "dependencies": [],
            "timeout": 30
        },
        {
            "title": "Install nginx",
            "description": "Install the nginx package",
            "commands": ["sudo apt install -y nginx"],
            "health_checks": ["dpkg -l | grep nginx"],
            "expected_output": "nginx installed",
            "rollback_commands": ["sudo apt remove -y nginx"],
            "dependencies": [0],
            "timeout": 60
        },
        {
            "title": "Start nginx",
            "description": "Start and enable the nginx service",
            "commands": ["sudo systemctl start nginx", "sudo systemctl enable nginx"],
            "health_checks": ["systemctl is-active nginx", "curl -I http://localhost"],
            "expected_output": "nginx running",
            "rollback_commands": ["sudo systemctl stop nginx"],
            "dependencies": [1],
            "timeout": 30
        }
    ]
}"#;

/// Mock backend. Inspects the prompt for planning vs execution keywords
/// and returns a canned structured JSON response in the matching shape.
#[derive(Default)]
pub struct MockProvider {
    request_count: AtomicU64,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn generate(&self, request: LlmRequest) -> LlmResponse {
        self.request_count.fetch_add(1, Ordering::Relaxed);

        let prompt = request.prompt.to_lowercase();
        let content = if prompt.contains("command") || prompt.contains("subtask") {
            MOCK_EXECUTION_RESPONSE
        } else if prompt.contains("step") || prompt.contains("plan") {
            MOCK_PLANNING_RESPONSE
        } else {
            MOCK_EXECUTION_RESPONSE
        };

        LlmResponse::ok(
            content,
            request.model,
            TokenUsage {
                prompt_tokens: 50,
                completion_tokens: 50,
                total_tokens: 100,
            },
            10,
        )
    }

    async fn is_available(&self) -> bool {
        true
    }
}
