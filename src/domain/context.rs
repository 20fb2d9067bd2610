//! Execution context handed to the command executor

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::llm::LlmProvider;
use crate::transport::SshTransport;

use super::subtask::Subtask;

/// Facts collected about the target host at connect time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerFacts {
    pub os_type: String,

    #[serde(default)]
    pub os_version: Option<String>,

    #[serde(default)]
    pub arch: Option<String>,

    #[serde(default)]
    pub installed_packages: Vec<String>,

    #[serde(default)]
    pub installed_services: Vec<String>,

    /// Raw `uname -a` output, when collected
    #[serde(default)]
    pub uname: Option<String>,

    /// Raw `df -h` output, when collected
    #[serde(default)]
    pub disk_usage: Option<String>,

    /// Raw `free -h` output, when collected
    #[serde(default)]
    pub memory: Option<String>,
}

/// Progress events emitted while a subtask executes
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    SubtaskStarted {
        subtask_id: String,
        title: String,
    },
    SubtaskCompleted {
        subtask_id: String,
        success: bool,
        duration_ms: u64,
        error_count: usize,
    },
    SubtaskFailed {
        subtask_id: String,
        error: String,
    },
}

/// Callback invoked for every progress event, in program order
pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Everything the executor needs to run one subtask.
///
/// Lifetime is the execution of that subtask; the transport handle is
/// shared with the owning orchestrator.
#[derive(Clone)]
pub struct ExecutionContext {
    pub subtask: Subtask,

    pub transport: Arc<dyn SshTransport>,

    pub server: ServerFacts,

    pub environment: HashMap<String, String>,

    pub step_id: Option<String>,

    pub task_id: Option<String>,

    pub progress: Option<ProgressCallback>,

    /// Present when execution-phase re-planning is allowed
    pub llm: Option<Arc<dyn LlmProvider>>,
}

impl ExecutionContext {
    pub fn new(subtask: Subtask, transport: Arc<dyn SshTransport>, server: ServerFacts) -> Self {
        Self {
            subtask,
            transport,
            server,
            environment: HashMap::new(),
            step_id: None,
            task_id: None,
            progress: None,
            llm: None,
        }
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Emit a progress event if a callback is registered
    pub fn emit(&self, event: ProgressEvent) {
        if let Some(callback) = &self.progress {
            callback(&event);
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("subtask", &self.subtask.id)
            .field("step_id", &self.step_id)
            .field("task_id", &self.task_id)
            .field("os_type", &self.server.os_type)
            .finish()
    }
}
