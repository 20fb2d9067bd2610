//! Orchestrator
//!
//! Drives the whole lifecycle for one goal on one host: plan the task,
//! connect, snapshot, expand and execute each step in dependency order,
//! consult the error tracker for escalation, and run rollback when the
//! outcome calls for it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::{AgentConfig, ServerConfig};
use crate::domain::{
    ExecutionContext, ProgressCallback, ServerFacts, StepStatus, Subtask, SubtaskExecutionResult, Task, TaskStatus,
    TaskStep,
};
use crate::dryrun::DryRunSimulator;
use crate::executor::CommandExecutor;
use crate::idempotency::IdempotencySystem;
use crate::llm::LlmProvider;
use crate::planner::{PlanningContext, SubtaskPlanner, TaskPlanner};
use crate::safety::{SafetyValidator, ValidationStats};
use crate::taskmaster::TaskMaster;
use crate::tracker::{ErrorTracker, EscalationLevel};
use crate::transport::{GuardedTransport, SshTransport};


/// Options for one execution
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    pub dry_run: bool,

    /// Overrides `idempotency.auto_rollback` when set
    pub auto_rollback: Option<bool>,
}

/// Outcome of one step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutionResult {
    pub step_id: String,
    pub title: String,
    pub success: bool,
    pub subtask_results: Vec<SubtaskExecutionResult>,
    pub escalation: EscalationLevel,
    pub replanned: bool,
}

/// Outcome of one task execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecutionResult {
    /// The planned task; `None` when planning itself failed
    pub task: Option<Task>,
    pub success: bool,
    pub error: Option<String>,
    pub step_results: Vec<StepExecutionResult>,
    pub duration_ms: u64,
    pub rollback_executed: bool,
    pub escalations: u32,
    pub finished_at: DateTime<Utc>,
}

impl TaskExecutionResult {
    fn failure(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            task: None,
            success: false,
            error: Some(error.into()),
            step_results: Vec::new(),
            duration_ms,
            rollback_executed: false,
            escalations: 0,
            finished_at: Utc::now(),
        }
    }
}

/// One capped history record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub task_id: Option<String>,
    pub title: String,
    pub success: bool,
    pub duration_ms: u64,
    pub steps_total: usize,
    pub steps_completed: usize,
    pub finished_at: DateTime<Utc>,
}

/// Running aggregate statistics
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OrchestratorStats {
    pub tasks_executed: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub total_execution_time_ms: u64,
    pub escalations: u64,
}

/// Agent-level status surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub running: bool,
    pub stats: OrchestratorStats,
    pub validation: ValidationStats,
    pub history_entries: usize,
}

const MAX_HISTORY: usize = 50;

/// Owns one SSH connection and every core subsystem for the lifetime of
/// the executions it runs.
pub struct Orchestrator {
    config: AgentConfig,
    server_config: ServerConfig,
    llm: Arc<dyn LlmProvider>,
    transport: Arc<dyn SshTransport>,
    validator: Arc<SafetyValidator>,
    idempotency: Arc<IdempotencySystem>,
    tracker: Arc<ErrorTracker>,
    taskmaster: Option<Arc<TaskMaster>>,
    progress: Mutex<Option<ProgressCallback>>,
    history: Mutex<Vec<HistoryEntry>>,
    stats: Mutex<OrchestratorStats>,
    cancel_flag: Arc<AtomicBool>,
    running: AtomicBool,
}

impl Orchestrator {
    /// Build the orchestrator around a raw transport; the transport is
    /// wrapped so every command passes the safety validator first.
    pub fn new(
        config: AgentConfig,
        server_config: ServerConfig,
        llm: Arc<dyn LlmProvider>,
        raw_transport: Arc<dyn SshTransport>,
    ) -> Self {
        let validator = Arc::new(SafetyValidator::new(&config.security, &server_config.forbidden_commands));
        let transport: Arc<dyn SshTransport> = Arc::new(GuardedTransport::new(raw_transport, validator.clone()));
        let idempotency = Arc::new(IdempotencySystem::new(transport.clone(), config.idempotency.clone()));
        let tracker = Arc::new(ErrorTracker::new(config.error_handler.clone()));
        let taskmaster = if config.taskmaster.enabled {
            Some(Arc::new(TaskMaster::new(llm.clone(), config.taskmaster.clone())))
        } else {
            None
        };

        Self {
            config,
            server_config,
            llm,
            transport,
            validator,
            idempotency,
            tracker,
            taskmaster,
            progress: Mutex::new(None),
            history: Mutex::new(Vec::new()),
            stats: Mutex::new(OrchestratorStats::default()),
            cancel_flag: Arc::new(AtomicBool::new(false)),
            running: AtomicBool::new(false),
        }
    }

    pub fn set_progress_callback(&self, callback: ProgressCallback) {
        *self.progress.lock().unwrap() = Some(callback);
    }

    /// Request cooperative cancellation: the pipeline stops after the
    /// currently-running command finishes.
    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }

    /// Execute one goal end to end
    pub async fn execute_task(&self, goal: &str, options: ExecuteOptions) -> TaskExecutionResult {
        let start = Instant::now();
        self.running.store(true, Ordering::SeqCst);

        let result = self.run_lifecycle(goal, options, start).await;

        // Release the connection on every exit path
        if let Err(e) = self.transport.disconnect().await {
            warn!(error = %e, "disconnect failed");
        }
        self.idempotency.finish_task();
        self.running.store(false, Ordering::SeqCst);
        self.record_outcome(goal, &result);
        result
    }

    /// Current status surface
    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            running: self.running.load(Ordering::SeqCst),
            stats: *self.stats.lock().unwrap(),
            validation: self.validator.stats(),
            history_entries: self.history.lock().unwrap().len(),
        }
    }

    /// The most recent executions, oldest first
    pub fn history(&self, limit: usize) -> Vec<HistoryEntry> {
        let history = self.history.lock().unwrap();
        let skip = history.len().saturating_sub(limit);
        history[skip..].to_vec()
    }

    /// Drop error records past retention and history entries older than
    /// `days`.
    pub fn cleanup_old_data(&self, days: i64) {
        self.tracker.cleanup();
        let cutoff = Utc::now() - chrono::Duration::days(days);
        self.history.lock().unwrap().retain(|entry| entry.finished_at >= cutoff);
    }

    async fn run_lifecycle(&self, goal: &str, options: ExecuteOptions, start: Instant) -> TaskExecutionResult {
        let dry_run = options.dry_run || self.config.executor.dry_run_mode;
        let executor = self.build_executor(dry_run);

        // 1. Plan the task
        let mut planning_ctx = PlanningContext {
            server: self.server_config.server_facts(),
            ..PlanningContext::default()
        };

        let planning = self.build_task_planner().plan(goal, &planning_ctx).await;
        let Some(mut task) = planning.task else {
            let error = planning
                .error_message
                .unwrap_or_else(|| "planning produced no task".to_string());
            return TaskExecutionResult::failure(format!("planning error: {}", error), start.elapsed().as_millis() as u64);
        };

        // 2. Connect and gather server facts
        if !dry_run {
            if let Err(e) = self.transport.connect().await {
                task.set_status(TaskStatus::Failed);
                let mut result = TaskExecutionResult::failure(
                    format!("transport error: {}", e),
                    start.elapsed().as_millis() as u64,
                );
                result.task = Some(task);
                return result;
            }
            planning_ctx.server = self.collect_server_facts().await;
        }

        // 3. Snapshot for rollback
        let snapshot_id = if !dry_run && self.config.idempotency.enabled {
            Some(self.idempotency.create_snapshot(&task.id, true).await.snapshot_id)
        } else {
            None
        };

        task.set_status(TaskStatus::Running);
        info!(task_id = %task.id, steps = task.steps.len(), dry_run, "task started");

        // 4. Execute steps in dependency order
        let mut step_results: Vec<StepExecutionResult> = Vec::new();
        let mut escalations = 0u32;
        let mut emergency = false;
        let mut cancelled = false;
        let mut task_error: Option<String> = None;
        let mut completed_ids: Vec<String> = Vec::new();

        for index in 0..task.steps.len() {
            if self.cancel_requested() {
                cancelled = true;
                break;
            }

            task.steps[index].set_status(StepStatus::Ready);
            if !task.steps[index].is_eligible(&completed_ids) {
                task.steps[index].set_status(StepStatus::Skipped);
                continue;
            }

            let step = task.steps[index].clone();
            let outcome = self
                .run_step(&task, &step, &planning_ctx, &executor, &mut escalations, options)
                .await;

            match outcome {
                StepOutcome::Completed { result, subtasks } => {
                    task.steps[index].subtasks = subtasks;
                    task.steps[index].set_status(StepStatus::Completed);
                    completed_ids.push(step.id.clone());
                    step_results.push(result);
                }
                StepOutcome::Failed { result, error } => {
                    task.steps[index].set_status(StepStatus::Failed);
                    emergency = result.escalation == EscalationLevel::EmergencyStop;
                    step_results.push(result);
                    task_error = Some(error);
                    break;
                }
                StepOutcome::Cancelled => {
                    cancelled = true;
                    break;
                }
            }
        }

        // Pending steps after a cancel are marked off
        if cancelled {
            for step in task.steps.iter_mut() {
                if !step.is_terminal() {
                    step.set_status(StepStatus::Skipped);
                }
            }
            task.set_status(TaskStatus::Cancelled);
            task_error.get_or_insert_with(|| "cancelled by operator".to_string());
        } else if task.steps.iter().all(|s| s.status == StepStatus::Completed) {
            task.set_status(TaskStatus::Completed);
        } else {
            task.set_status(TaskStatus::Failed);
        }
        debug_assert!(task.status_consistent());

        // 5. Rollback policy
        let auto_rollback = options.auto_rollback.unwrap_or(self.config.idempotency.auto_rollback);
        let mut rollback_executed = false;
        if let Some(snapshot_id) = &snapshot_id
            && task.status != TaskStatus::Completed
            && (emergency || auto_rollback)
        {
            info!(task_id = %task.id, snapshot_id = %snapshot_id, "rolling back task mutations");
            if let Err(e) = self.idempotency.execute_rollback(snapshot_id).await {
                warn!(error = %e, "rollback failed");
            }
            rollback_executed = true;
        }

        let success = task.status == TaskStatus::Completed;
        info!(task_id = %task.id, success, escalations, "task finished");

        TaskExecutionResult {
            task: Some(task),
            success,
            error: task_error,
            step_results,
            duration_ms: start.elapsed().as_millis() as u64,
            rollback_executed,
            escalations,
            finished_at: Utc::now(),
        }
    }

    async fn run_step(
        &self,
        task: &Task,
        step: &TaskStep,
        planning_ctx: &PlanningContext,
        executor: &CommandExecutor,
        escalations: &mut u32,
        options: ExecuteOptions,
    ) -> StepOutcome {
        let subtask_planner = self.build_subtask_planner(options);

        let planning = subtask_planner.plan(step, planning_ctx).await;
        if !planning.success {
            let error = planning
                .error_message
                .unwrap_or_else(|| "subtask planning failed".to_string());
            return StepOutcome::Failed {
                result: StepExecutionResult {
                    step_id: step.id.clone(),
                    title: step.title.clone(),
                    success: false,
                    subtask_results: Vec::new(),
                    escalation: self.tracker.escalation_level(&step.id),
                    replanned: false,
                },
                error: format!("planning error in step '{}': {}", step.title, error),
            };
        }

        let mut queue: Vec<Subtask> = planning.subtasks;
        let mut executed: Vec<SubtaskExecutionResult> = Vec::new();
        let mut all_subtasks: Vec<Subtask> = queue.clone();
        let mut replanned = false;
        let mut next = 0usize;

        while next < queue.len() {
            if self.cancel_requested() {
                return StepOutcome::Cancelled;
            }

            let subtask = queue[next].clone();
            let ctx = self.execution_context(task, step, subtask, planning_ctx);
            let result = executor.execute_subtask(&ctx).await;
            let subtask_failed = !result.success;
            executed.push(result);
            next += 1;

            // Escalation consult after every subtask
            if self.tracker.escalation_level(&step.id) == EscalationLevel::EmergencyStop {
                warn!(step_id = %step.id, "emergency stop armed, aborting task");
                *escalations += 1;
                return StepOutcome::Failed {
                    result: StepExecutionResult {
                        step_id: step.id.clone(),
                        title: step.title.clone(),
                        success: false,
                        subtask_results: executed,
                        escalation: EscalationLevel::EmergencyStop,
                        replanned,
                    },
                    error: format!("emergency stop in step '{}'", step.title),
                };
            }

            if self.tracker.should_escalate_to_human(&step.id) {
                warn!(step_id = %step.id, "escalating to operator");
                *escalations += 1;
                return StepOutcome::Failed {
                    result: StepExecutionResult {
                        step_id: step.id.clone(),
                        title: step.title.clone(),
                        success: false,
                        subtask_results: executed,
                        escalation: EscalationLevel::Human,
                        replanned,
                    },
                    error: format!("step '{}' escalated to the operator", step.title),
                };
            }

            if !replanned && self.tracker.should_escalate_to_planner(&step.id) {
                info!(step_id = %step.id, "re-planning step after repeated failures");
                *escalations += 1;
                replanned = true;
                let revised = subtask_planner.plan(step, planning_ctx).await;
                if revised.success {
                    queue = revised.subtasks;
                    all_subtasks.extend(queue.iter().cloned());
                    next = 0;
                    continue;
                }
                // Re-planning failed: the escalation completes with the
                // current plan unchanged
                warn!(step_id = %step.id, "re-planning failed, keeping current plan");
            }

            if subtask_failed {
                return StepOutcome::Failed {
                    result: StepExecutionResult {
                        step_id: step.id.clone(),
                        title: step.title.clone(),
                        success: false,
                        subtask_results: executed,
                        escalation: self.tracker.escalation_level(&step.id),
                        replanned,
                    },
                    error: format!("subtask failed in step '{}'", step.title),
                };
            }
        }

        StepOutcome::Completed {
            result: StepExecutionResult {
                step_id: step.id.clone(),
                title: step.title.clone(),
                success: true,
                subtask_results: executed,
                escalation: self.tracker.escalation_level(&step.id),
                replanned,
            },
            subtasks: all_subtasks,
        }
    }

    fn execution_context(
        &self,
        task: &Task,
        step: &TaskStep,
        subtask: Subtask,
        planning_ctx: &PlanningContext,
    ) -> ExecutionContext {
        let mut ctx = ExecutionContext::new(subtask, self.transport.clone(), planning_ctx.server.clone())
            .with_step(step.id.clone())
            .with_task(task.id.clone());
        ctx.llm = Some(self.llm.clone());
        if let Some(callback) = self.progress.lock().unwrap().clone() {
            ctx = ctx.with_progress(callback);
        }
        ctx
    }

    fn build_executor(&self, dry_run: bool) -> CommandExecutor {
        let mut executor_config = self.config.executor.clone();
        executor_config.dry_run_mode = dry_run;
        CommandExecutor::new(
            executor_config,
            self.idempotency.clone(),
            DryRunSimulator::new(self.validator.clone()),
            self.tracker.clone(),
            self.taskmaster.clone(),
        )
    }

    fn build_task_planner(&self) -> TaskPlanner {
        let planner = TaskPlanner::new(self.llm.clone(), self.config.task_agent.clone());
        match &self.taskmaster {
            Some(tm) => planner.with_taskmaster(tm.clone()),
            None => planner,
        }
    }

    fn build_subtask_planner(&self, options: ExecuteOptions) -> SubtaskPlanner {
        let mut planner = SubtaskPlanner::new(
            self.llm.clone(),
            self.config.subtask_agent.clone(),
            self.validator.clone(),
        );
        // Wrap enrichment probes nothing, so it is safe in dry-run too
        if self.config.idempotency.enabled && !options.dry_run {
            planner = planner.with_idempotency(self.idempotency.clone());
        }
        match &self.taskmaster {
            Some(tm) => planner.with_taskmaster(tm.clone()),
            None => planner,
        }
    }

    async fn collect_server_facts(&self) -> ServerFacts {
        let mut facts = self.server_config.server_facts();
        let timeout = Duration::from_secs(10);

        if let Ok(out) = self.transport.execute_command("uname -a", timeout, None).await
            && out.success()
        {
            let uname = out.stdout.trim().to_string();
            facts.arch = uname.split_whitespace().rev().nth(1).map(|s| s.to_string());
            facts.uname = Some(uname);
        }
        if let Ok(out) = self.transport.execute_command("df -h", timeout, None).await
            && out.success()
        {
            facts.disk_usage = Some(out.stdout.trim().to_string());
        }
        if let Ok(out) = self.transport.execute_command("free -h", timeout, None).await
            && out.success()
        {
            facts.memory = Some(out.stdout.trim().to_string());
        }
        facts
    }

    fn record_outcome(&self, goal: &str, result: &TaskExecutionResult) {
        {
            let mut stats = self.stats.lock().unwrap();
            stats.tasks_executed += 1;
            if result.success {
                stats.tasks_completed += 1;
            } else {
                stats.tasks_failed += 1;
            }
            stats.total_execution_time_ms += result.duration_ms;
            stats.escalations += result.escalations as u64;
        }

        let entry = HistoryEntry {
            task_id: result.task.as_ref().map(|t| t.id.clone()),
            title: result
                .task
                .as_ref()
                .map(|t| t.title.clone())
                .unwrap_or_else(|| goal.to_string()),
            success: result.success,
            duration_ms: result.duration_ms,
            steps_total: result.task.as_ref().map(|t| t.steps.len()).unwrap_or(0),
            steps_completed: result
                .task
                .as_ref()
                .map(|t| t.steps_in(StepStatus::Completed))
                .unwrap_or(0),
            finished_at: result.finished_at,
        };

        let mut history = self.history.lock().unwrap();
        history.push(entry);
        let overflow = history.len().saturating_sub(MAX_HISTORY);
        if overflow > 0 {
            history.drain(..overflow);
        }
    }
}

enum StepOutcome {
    Completed {
        result: StepExecutionResult,
        subtasks: Vec<Subtask>,
    },
    Failed {
        result: StepExecutionResult,
        error: String,
    },
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ErrorHandlerConfig, ExecutorConfig, IdempotencyConfig};
    use crate::llm::MockProvider;
    use crate::test_utils::{ScriptedProvider, ScriptedTransport};

    fn orchestrator_with(
        config: AgentConfig,
        llm: Arc<dyn LlmProvider>,
        transport: Arc<ScriptedTransport>,
    ) -> Orchestrator {
        Orchestrator::new(config, ServerConfig::default(), llm, transport)
    }

    fn fast_config() -> AgentConfig {
        AgentConfig {
            executor: ExecutorConfig {
                max_retries_per_command: 0,
                auto_correction_enabled: false,
                ..ExecutorConfig::default()
            },
            ..AgentConfig::default()
        }
    }

    #[tokio::test]
    async fn test_happy_path_completes_task() {
        let transport = Arc::new(ScriptedTransport::new());
        let orch = orchestrator_with(fast_config(), Arc::new(MockProvider::new()), transport);

        let result = orch.execute_task("install and configure nginx", ExecuteOptions::default()).await;

        assert!(result.success, "error: {:?}", result.error);
        let task = result.task.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        // Invariant: completed task means every step completed
        assert!(task.steps.iter().all(|s| s.status == StepStatus::Completed));
        assert!(result.step_results.iter().all(|r| r.success));
        assert!(
            result
                .step_results
                .iter()
                .flat_map(|r| r.subtask_results.iter())
                .all(|r| r.success)
        );

        let stats = orch.status().stats;
        assert_eq!(stats.tasks_executed, 1);
        assert_eq!(stats.tasks_completed, 1);
    }

    #[tokio::test]
    async fn test_dry_run_makes_no_transport_calls() {
        let transport = Arc::new(ScriptedTransport::new());
        let orch = orchestrator_with(fast_config(), Arc::new(MockProvider::new()), transport.clone());

        let result = orch
            .execute_task(
                "install and configure nginx",
                ExecuteOptions {
                    dry_run: true,
                    ..ExecuteOptions::default()
                },
            )
            .await;

        assert!(result.success);
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_planning_failure_fails_task() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_failure("model overloaded");
        let transport = Arc::new(ScriptedTransport::new());
        let orch = orchestrator_with(fast_config(), provider, transport.clone());

        let result = orch.execute_task("do something", ExecuteOptions::default()).await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("planning error"));
        assert!(result.task.is_none());
        assert_eq!(orch.status().stats.tasks_failed, 1);
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_fails_task() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.fail_connect("no route to host");
        let orch = orchestrator_with(fast_config(), Arc::new(MockProvider::new()), transport);

        let result = orch.execute_task("install nginx now", ExecuteOptions::default()).await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("transport error"));
        let task = result.task.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_escalation_to_human_fails_step() {
        // Every command fails; thresholds are low so the step escalates
        // through planner re-planning to the operator.
        let mut config = fast_config();
        config.error_handler = ErrorHandlerConfig {
            error_threshold_per_step: 1,
            human_escalation_threshold: 2,
            emergency_stop_threshold: 20,
            ..ErrorHandlerConfig::default()
        };
        config.idempotency = IdempotencyConfig {
            enabled: false,
            ..IdempotencyConfig::default()
        };

        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("", 1, "", "persistent failure");
        let orch = orchestrator_with(config, Arc::new(MockProvider::new()), transport);

        let result = orch.execute_task("install and configure nginx", ExecuteOptions::default()).await;

        assert!(!result.success);
        assert!(result.escalations >= 2, "escalations: {}", result.escalations);
        let failed_step = result.step_results.last().unwrap();
        assert!(failed_step.replanned);
        assert_eq!(failed_step.escalation, EscalationLevel::Human);
        let task = result.task.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.steps_in(StepStatus::Failed), 1);
    }

    #[tokio::test]
    async fn test_cancel_marks_task_cancelled() {
        let transport = Arc::new(ScriptedTransport::new());
        let orch = orchestrator_with(fast_config(), Arc::new(MockProvider::new()), transport);

        orch.cancel();
        let result = orch.execute_task("install and configure nginx", ExecuteOptions::default()).await;

        assert!(!result.success);
        let task = result.task.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.steps.iter().all(|s| s.status == StepStatus::Skipped));
    }

    #[tokio::test]
    async fn test_auto_rollback_on_failure() {
        // First step succeeds and installs a package; planner output for
        // the mock is deterministic, so force a later failure by making
        // systemctl commands fail.
        let mut config = fast_config();
        config.error_handler = ErrorHandlerConfig {
            error_threshold_per_step: 10,
            human_escalation_threshold: 15,
            emergency_stop_threshold: 20,
            ..ErrorHandlerConfig::default()
        };

        let transport = Arc::new(ScriptedTransport::new());
        // The wrapped forms match before their probes: the install action
        // succeeds, the service start fails, and every probe reports the
        // state missing so nothing is skipped.
        transport.respond("|| apt-get install", 0, "", "");
        transport.respond("|| systemctl start", 1, "", "start failed");
        transport.respond("dpkg -l | grep -q", 1, "", "");
        transport.respond("systemctl is-active", 1, "", "");
        transport.respond("systemctl is-enabled", 1, "", "");
        let orch = orchestrator_with(config, Arc::new(MockProvider::new()), transport.clone());

        let result = orch
            .execute_task(
                "install and configure nginx",
                ExecuteOptions {
                    dry_run: false,
                    auto_rollback: Some(true),
                },
            )
            .await;

        assert!(!result.success);
        assert!(result.rollback_executed);
        // The installed package from the successful subtask was rolled back
        assert!(
            transport
                .calls()
                .iter()
                .any(|c| c.contains("apt-get remove -y nginx"))
        );
    }

    #[tokio::test]
    async fn test_history_and_cleanup() {
        let transport = Arc::new(ScriptedTransport::new());
        let orch = orchestrator_with(fast_config(), Arc::new(MockProvider::new()), transport);

        orch.execute_task("install and configure nginx", ExecuteOptions::default()).await;
        orch.execute_task("install and configure redis", ExecuteOptions::default()).await;

        let history = orch.history(10);
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|h| h.success));

        let history = orch.history(1);
        assert_eq!(history.len(), 1);

        orch.cleanup_old_data(0);
        assert!(orch.history(10).len() <= 2);
    }
}
