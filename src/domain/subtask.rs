//! Subtask domain type
//!
//! A Subtask is one atomic unit inside a step: the shell commands to run,
//! the health checks that ratify them, and the rollback that inverts them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::id::generate_id;

/// An atomic unit of work inside a step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    /// Unique identifier
    pub id: String,

    pub title: String,

    pub description: String,

    /// Shell commands, executed in order
    pub commands: Vec<String>,

    /// Commands whose exit 0 ratifies the mutation
    #[serde(default)]
    pub health_checks: Vec<String>,

    /// Best-effort inverse sequence, run when the subtask fails
    #[serde(default)]
    pub rollback_commands: Vec<String>,

    /// What success should look like, for the operator
    #[serde(default)]
    pub expected_output: Option<String>,

    /// Subtask IDs that must complete first
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Per-command timeout in seconds
    pub timeout_secs: u64,

    pub max_retries: u32,

    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Subtask {
    /// Create a new subtask with a generated ID
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        let title = title.into();
        Self {
            id: generate_id("subtask", &title),
            title,
            description: description.into(),
            commands: Vec::new(),
            health_checks: Vec::new(),
            rollback_commands: Vec::new(),
            expected_output: None,
            dependencies: Vec::new(),
            timeout_secs: 30,
            max_retries: 2,
            metadata: HashMap::new(),
        }
    }

    /// Builder method to set the commands
    pub fn with_commands(mut self, commands: Vec<String>) -> Self {
        self.commands = commands;
        self
    }

    /// Builder method to set the health checks
    pub fn with_health_checks(mut self, health_checks: Vec<String>) -> Self {
        self.health_checks = health_checks;
        self
    }

    /// Builder method to set the rollback commands
    pub fn with_rollback(mut self, rollback_commands: Vec<String>) -> Self {
        self.rollback_commands = rollback_commands;
        self
    }

    pub fn add_dependency(&mut self, id: impl Into<String>) {
        self.dependencies.push(id.into());
    }

    pub fn set_meta(&mut self, key: &str, value: serde_json::Value) {
        self.metadata.insert(key.to_string(), value);
    }
}
