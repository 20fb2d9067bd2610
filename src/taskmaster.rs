//! Task Master integration
//!
//! Optional prompt-improvement helper. When enabled, planning prompts are
//! rewritten through the LLM before use and execution progress events are
//! mirrored to it. Failures here never fail the caller; the helper is
//! strictly opportunistic.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::config::TaskmasterConfig;
use crate::domain::ProgressEvent;
use crate::llm::{LlmProvider, LlmRequestBuilder};

/// Prompt-improvement and progress-mirroring helper
pub struct TaskMaster {
    llm: Arc<dyn LlmProvider>,
    config: TaskmasterConfig,
    events_reported: AtomicU64,
}

impl TaskMaster {
    pub fn new(llm: Arc<dyn LlmProvider>, config: TaskmasterConfig) -> Self {
        Self {
            llm,
            config,
            events_reported: AtomicU64::new(0),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Ask the LLM for a sharper version of a planning prompt. Returns
    /// `None` when disabled or on any failure; callers keep the original.
    pub async fn improve_prompt(&self, prompt: &str) -> Option<String> {
        if !self.config.enabled {
            return None;
        }

        let request = LlmRequestBuilder::new(&self.config.model, self.config.temperature)
            .system_message(
                "Rewrite the prompt to be clearer and more specific. \
                 Keep every requirement. Output only the rewritten prompt.",
            )
            .build(prompt, self.config.max_tokens);

        let response = self.llm.generate(request).await;
        if !response.success || response.content.trim().is_empty() {
            debug!(error = ?response.error, "prompt improvement failed, keeping original");
            return None;
        }
        Some(response.content.trim().to_string())
    }

    /// Mirror a progress event; only counts it today, but keeps the
    /// reporting seam in one place.
    pub fn report_progress(&self, event: &ProgressEvent) {
        if !self.config.enabled {
            return;
        }
        self.events_reported.fetch_add(1, Ordering::Relaxed);
        debug!(event = ?event, "progress reported to task master");
    }

    pub fn events_reported(&self) -> u64 {
        self.events_reported.load(Ordering::Relaxed)
    }
}
