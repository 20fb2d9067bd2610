//! Shared domain entities
//!
//! The typed records that flow between the planner, executor, and
//! orchestrator: tasks, steps, subtasks, command results, and the
//! execution context handed to the executor.

mod context;
mod id;
mod priority;
mod result;
mod subtask;
mod task;

pub use context::{ExecutionContext, ProgressCallback, ProgressEvent, ServerFacts};
pub use id::generate_id;
pub use priority::Priority;
pub use result::{CommandResult, ExecutionStatus, SubtaskExecutionResult};
pub use subtask::Subtask;
pub use task::{StepStatus, Task, TaskStatus, TaskStep};
