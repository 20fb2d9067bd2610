//! Command and subtask execution results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Status of one shell invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Outcome of one shell invocation. Immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,

    pub success: bool,

    pub exit_code: i32,

    pub stdout: String,

    pub stderr: String,

    pub duration_ms: u64,

    pub status: ExecutionStatus,

    pub error_message: Option<String>,

    pub retry_count: u32,

    /// Flags like `dry_run`, `idempotent_skip`, `autocorrected`
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,

    pub timestamp: DateTime<Utc>,
}

impl CommandResult {
    /// Result for a command that ran to completion
    pub fn completed(command: impl Into<String>, exit_code: i32, stdout: String, stderr: String, duration_ms: u64) -> Self {
        let success = exit_code == 0;
        Self {
            command: command.into(),
            success,
            exit_code,
            error_message: if success { None } else { Some(stderr.clone()) },
            stdout,
            stderr,
            duration_ms,
            status: if success { ExecutionStatus::Completed } else { ExecutionStatus::Failed },
            retry_count: 0,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Result for a command that never produced an exit code
    pub fn failed(command: impl Into<String>, error: impl Into<String>, duration_ms: u64) -> Self {
        let error = error.into();
        Self {
            command: command.into(),
            success: false,
            exit_code: -1,
            stdout: String::new(),
            stderr: error.clone(),
            duration_ms,
            status: ExecutionStatus::Failed,
            error_message: Some(error),
            retry_count: 0,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Result for a command that exceeded its timeout
    pub fn timed_out(command: impl Into<String>, timeout_ms: u64) -> Self {
        let command = command.into();
        Self {
            error_message: Some(format!("Command timed out after {} ms", timeout_ms)),
            command,
            success: false,
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: timeout_ms,
            status: ExecutionStatus::Timeout,
            retry_count: 0,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Synthetic success emitted when an idempotency probe shows the
    /// target state already holds and the command is skipped.
    pub fn idempotent_skip(command: impl Into<String>) -> Self {
        let command = command.into();
        let mut metadata = HashMap::new();
        metadata.insert("idempotent_skip".to_string(), serde_json::Value::Bool(true));
        Self {
            stdout: format!("[IDEMPOTENT] '{}' skipped - target state already holds", command),
            command,
            success: true,
            exit_code: 0,
            stderr: String::new(),
            duration_ms: 0,
            status: ExecutionStatus::Completed,
            error_message: None,
            retry_count: 0,
            metadata,
            timestamp: Utc::now(),
        }
    }

    pub fn failed_execution(&self) -> bool {
        !self.success
    }

    /// Check a boolean metadata flag
    pub fn flag(&self, key: &str) -> bool {
        self.metadata.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    pub fn set_flag(&mut self, key: &str, value: bool) {
        self.metadata.insert(key.to_string(), serde_json::Value::Bool(value));
    }
}

/// Outcome of executing one subtask
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskExecutionResult {
    pub subtask_id: String,

    /// All commands succeeded and all health checks passed
    pub success: bool,

    pub command_results: Vec<CommandResult>,

    pub health_check_results: Vec<CommandResult>,

    pub total_duration_ms: u64,

    pub error_count: usize,

    pub autocorrection_applied: bool,

    pub rollback_executed: bool,

    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SubtaskExecutionResult {
    pub fn new(subtask_id: impl Into<String>) -> Self {
        Self {
            subtask_id: subtask_id.into(),
            success: false,
            command_results: Vec::new(),
            health_check_results: Vec::new(),
            total_duration_ms: 0,
            error_count: 0,
            autocorrection_applied: false,
            rollback_executed: false,
            metadata: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_success() {
        let r = CommandResult::completed("echo ok", 0, "ok\n".to_string(), String::new(), 12);
        assert!(r.success);
        assert_eq!(r.status, ExecutionStatus::Completed);
        assert!(r.error_message.is_none());
    }

    #[test]
    fn test_completed_failure_carries_stderr() {
        let r = CommandResult::completed("false", 1, String::new(), "boom".to_string(), 5);
        assert!(!r.success);
        assert_eq!(r.status, ExecutionStatus::Failed);
        assert_eq!(r.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_timed_out() {
        let r = CommandResult::timed_out("sleep 100", 30_000);
        assert!(!r.success);
        assert_eq!(r.status, ExecutionStatus::Timeout);
        assert!(r.error_message.unwrap().contains("timed out"));
    }

    #[test]
    fn test_idempotent_skip() {
        let r = CommandResult::idempotent_skip("apt-get install nginx");
        assert!(r.success);
        assert!(r.stdout.contains("IDEMPOTENT"));
        assert!(r.flag("idempotent_skip"));
    }

    #[test]
    fn test_flag_roundtrip() {
        let mut r = CommandResult::completed("ls", 0, String::new(), String::new(), 1);
        assert!(!r.flag("autocorrected"));
        r.set_flag("autocorrected", true);
        assert!(r.flag("autocorrected"));
    }

    #[test]
    fn test_result_serde() {
        let r = CommandResult::completed("ls", 0, "a b".to_string(), String::new(), 3);
        let json = serde_json::to_string(&r).unwrap();
        let back: CommandResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.command, "ls");
        assert!(back.success);
    }
}
