//! Task and TaskStep domain types
//!
//! A Task is one operator goal plus the ordered plan the task planner
//! produced for it. A TaskStep is one major phase inside that plan.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::generate_id;
use super::priority::Priority;
use super::subtask::Subtask;

/// Task status in the execution lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    /// Step plan being generated
    Planning,
    /// Steps executing
    Running,
    /// Every step completed
    Completed,
    /// At least one step failed
    Failed,
    /// Operator cancelled
    Cancelled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Planning => write!(f, "planning"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Step status inside one task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    /// All dependencies completed, eligible to run
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
    Retrying,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Retrying => write!(f, "retrying"),
        }
    }
}

/// One major phase inside a task's plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStep {
    /// Unique identifier
    pub id: String,

    /// Short title from the planner
    pub title: String,

    /// What this step accomplishes
    pub description: String,

    pub priority: Priority,

    pub status: StepStatus,

    /// Planner's duration estimate in minutes
    pub estimated_duration_mins: u32,

    /// Step IDs that must complete before this step runs
    pub dependencies: Vec<String>,

    /// Subtasks produced by the subtask planner
    #[serde(default)]
    pub subtasks: Vec<Subtask>,

    pub retry_count: u32,

    pub max_retries: u32,

    pub started_at: Option<DateTime<Utc>>,

    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskStep {
    /// Create a new step with a generated ID
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        let title = title.into();
        Self {
            id: generate_id("step", &title),
            title,
            description: description.into(),
            priority: Priority::Medium,
            status: StepStatus::Pending,
            estimated_duration_mins: 5,
            dependencies: Vec::new(),
            subtasks: Vec::new(),
            retry_count: 0,
            max_retries: 3,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn set_status(&mut self, status: StepStatus) {
        match status {
            StepStatus::Running if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped => {
                self.finished_at = Some(Utc::now());
            }
            _ => {}
        }
        self.status = status;
    }

    /// A step is eligible to run iff it is ready and every dependency
    /// appears in `completed` (the IDs of already-completed steps).
    pub fn is_eligible(&self, completed: &[String]) -> bool {
        self.status == StepStatus::Ready && self.dependencies.iter().all(|d| completed.contains(d))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// A user goal plus its ordered step plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: String,

    /// Short title derived from the goal
    pub title: String,

    /// The operator's goal, verbatim
    pub description: String,

    pub status: TaskStatus,

    /// Steps in dependency order
    pub steps: Vec<TaskStep>,

    pub created_at: DateTime<Utc>,

    pub started_at: Option<DateTime<Utc>>,

    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new task with a generated ID
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        let title = title.into();
        Self {
            id: generate_id("task", &title),
            title,
            description: description.into(),
            status: TaskStatus::Pending,
            steps: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn set_status(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Running if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                self.finished_at = Some(Utc::now());
            }
            _ => {}
        }
        self.status = status;
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Count of steps in a given status
    pub fn steps_in(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    /// A completed task must have every step completed; a failed task has
    /// at least one failed step. Used as a sanity check before reporting.
    pub fn status_consistent(&self) -> bool {
        match self.status {
            TaskStatus::Completed => self.steps.iter().all(|s| s.status == StepStatus::Completed),
            TaskStatus::Failed => self.steps.iter().any(|s| s.status == StepStatus::Failed),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_new() {
        let task = Task::new("Install Nginx", "install and configure nginx");
        assert!(task.id.contains("-task-"));
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.steps.is_empty());
    }

    #[test]
    fn test_task_status_transitions() {
        let mut task = Task::new("Test", "test");
        assert!(task.started_at.is_none());

        task.set_status(TaskStatus::Running);
        assert!(task.started_at.is_some());
        assert!(task.finished_at.is_none());

        task.set_status(TaskStatus::Completed);
        assert!(task.finished_at.is_some());
        assert!(task.is_terminal());
    }

    #[test]
    fn test_step_eligibility() {
        let mut step = TaskStep::new("Configure", "configure the service");
        step.dependencies = vec!["step-a".to_string(), "step-b".to_string()];

        let completed = vec!["step-a".to_string()];
        assert!(!step.is_eligible(&completed));

        step.set_status(StepStatus::Ready);
        assert!(!step.is_eligible(&completed));

        let completed = vec!["step-a".to_string(), "step-b".to_string()];
        assert!(step.is_eligible(&completed));
    }

    #[test]
    fn test_step_timestamps() {
        let mut step = TaskStep::new("Install", "install packages");
        step.set_status(StepStatus::Running);
        assert!(step.started_at.is_some());

        step.set_status(StepStatus::Completed);
        assert!(step.finished_at.is_some());
        assert!(step.is_terminal());
    }

    #[test]
    fn test_status_consistency() {
        let mut task = Task::new("Test", "test");
        let mut step = TaskStep::new("Step 1", "first");
        step.set_status(StepStatus::Completed);
        task.steps.push(step);

        task.set_status(TaskStatus::Completed);
        assert!(task.status_consistent());

        task.steps[0].set_status(StepStatus::Failed);
        assert!(!task.status_consistent());

        task.set_status(TaskStatus::Failed);
        assert!(task.status_consistent());
    }

    #[test]
    fn test_task_serde() {
        let mut task = Task::new("Test Task", "a test");
        task.steps.push(TaskStep::new("Step 1", "first"));

        let json = serde_json::to_string(&task).unwrap();
        let deserialized: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(task.id, deserialized.id);
        assert_eq!(deserialized.steps.len(), 1);
    }
}
