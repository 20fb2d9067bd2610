//! Command executor
//!
//! The per-subtask execution loop: idempotency skipping, dry-run
//! simulation, bounded retries, autocorrection of failures, health
//! checks, and best-effort rollback.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::autocorrect::AutocorrectionEngine;
use crate::config::ExecutorConfig;
use crate::domain::{CommandResult, ExecutionContext, ExecutionStatus, ProgressEvent, SubtaskExecutionResult};
use crate::dryrun::DryRunSimulator;
use crate::idempotency::IdempotencySystem;
use crate::safety::ValidationContext;
use crate::taskmaster::TaskMaster;
use crate::tracker::ErrorTracker;
use crate::transport::TransportError;

/// Commands that must not be proceeded past on failure. Operational
/// concern, distinct from the safety validator's policy tables.
const CRITICAL_COMMANDS: &[&str] = &[
    "systemctl start",
    "systemctl enable",
    "docker start",
    "nginx -t",
    "apache2ctl configtest",
];

/// Pause between commands to smooth transient I/O contention
const INTER_COMMAND_PAUSE: Duration = Duration::from_millis(50);

/// Aggregate execution statistics
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub total_commands: u64,
    pub successful_commands: u64,
    pub failed_commands: u64,
    pub retry_attempts: u64,
    pub autocorrections: u64,
    pub autocorrection_successes: u64,
    pub total_duration_ms: u64,
}

impl ExecutionStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_commands == 0 {
            0.0
        } else {
            self.successful_commands as f64 / self.total_commands as f64 * 100.0
        }
    }

    pub fn average_duration_ms(&self) -> f64 {
        if self.total_commands == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.total_commands as f64
        }
    }
}

/// Executes subtasks against the transport, consulting the safety,
/// idempotency, autocorrection, and error-tracking subsystems.
pub struct CommandExecutor {
    config: ExecutorConfig,
    autocorrect: AutocorrectionEngine,
    idempotency: Arc<IdempotencySystem>,
    dryrun: DryRunSimulator,
    tracker: Arc<ErrorTracker>,
    taskmaster: Option<Arc<TaskMaster>>,
    legacy_service_start: Regex,
    stats: Mutex<ExecutionStats>,
}

impl CommandExecutor {
    pub fn new(
        config: ExecutorConfig,
        idempotency: Arc<IdempotencySystem>,
        dryrun: DryRunSimulator,
        tracker: Arc<ErrorTracker>,
        taskmaster: Option<Arc<TaskMaster>>,
    ) -> Self {
        Self {
            autocorrect: AutocorrectionEngine::new(&config),
            config,
            idempotency,
            dryrun,
            tracker,
            taskmaster,
            legacy_service_start: Regex::new(r"service\s+\S+\s+start").unwrap(),
            stats: Mutex::new(ExecutionStats::default()),
        }
    }

    pub fn dry_run_mode(&self) -> bool {
        self.config.dry_run_mode
    }

    /// Execute one subtask: commands, autocorrection, health checks, and
    /// rollback on failure.
    pub async fn execute_subtask(&self, ctx: &ExecutionContext) -> SubtaskExecutionResult {
        let start = Instant::now();
        let subtask = &ctx.subtask;

        info!(
            subtask_id = %subtask.id,
            title = %subtask.title,
            commands = subtask.commands.len(),
            health_checks = subtask.health_checks.len(),
            "executing subtask"
        );
        self.emit(
            ctx,
            ProgressEvent::SubtaskStarted {
                subtask_id: subtask.id.clone(),
                title: subtask.title.clone(),
            },
        );

        let mut command_results = self.execute_commands(&subtask.commands, ctx).await;
        let mut commands_success = command_results.iter().all(|r| r.success);

        let mut autocorrection_applied = false;
        if !commands_success && self.config.auto_correction_enabled {
            if let Some(corrected) = self.apply_autocorrection(command_results.clone(), ctx).await {
                command_results = corrected;
                commands_success = command_results.iter().all(|r| r.success);
                autocorrection_applied = true;
            }
        }

        let health_check_results = if commands_success {
            self.execute_health_checks(&subtask.health_checks, ctx).await
        } else {
            warn!(
                subtask_id = %subtask.id,
                failed = command_results.iter().filter(|r| !r.success).count(),
                "subtask commands failed"
            );
            Vec::new()
        };
        let health_success = health_check_results.iter().all(|r| r.success);

        let overall_success = commands_success && health_success;

        let mut rollback_executed = false;
        if !overall_success && !subtask.rollback_commands.is_empty() {
            info!(subtask_id = %subtask.id, "running subtask rollback");
            self.execute_rollback(&subtask.rollback_commands, ctx).await;
            rollback_executed = true;
        }

        let total_duration_ms = start.elapsed().as_millis() as u64;
        self.update_stats(&command_results, &health_check_results, total_duration_ms);

        let error_count = command_results.iter().filter(|r| !r.success).count()
            + health_check_results.iter().filter(|r| !r.success).count();

        self.emit(
            ctx,
            ProgressEvent::SubtaskCompleted {
                subtask_id: subtask.id.clone(),
                success: overall_success,
                duration_ms: total_duration_ms,
                error_count,
            },
        );

        info!(
            subtask_id = %subtask.id,
            success = overall_success,
            duration_ms = total_duration_ms,
            "subtask finished"
        );

        let mut result = SubtaskExecutionResult::new(&subtask.id);
        result.success = overall_success;
        result.command_results = command_results;
        result.health_check_results = health_check_results;
        result.total_duration_ms = total_duration_ms;
        result.error_count = error_count;
        result.autocorrection_applied = autocorrection_applied;
        result.rollback_executed = rollback_executed;
        result
            .metadata
            .insert("subtask_title".to_string(), serde_json::json!(subtask.title));
        result
    }

    /// Current statistics snapshot
    pub fn stats(&self) -> ExecutionStats {
        *self.stats.lock().unwrap()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock().unwrap() = ExecutionStats::default();
    }

    async fn execute_commands(&self, commands: &[String], ctx: &ExecutionContext) -> Vec<CommandResult> {
        let mut results = Vec::with_capacity(commands.len());

        for (index, command) in commands.iter().enumerate() {
            let vctx = self.validation_context(ctx, index);

            // Skip when the target state already holds
            if self.idempotency.enabled() && !self.config.dry_run_mode {
                let checks = self.idempotency.infer_checks(command);
                if !checks.is_empty() && self.idempotency.should_skip(command, &checks).await {
                    results.push(CommandResult::idempotent_skip(command));
                    continue;
                }
            }

            let result = if self.config.dry_run_mode {
                self.dryrun.simulate_command(command)
            } else {
                self.run_with_retries(command, ctx, &vctx).await
            };

            // Successful mutations feed the rollback snapshot
            if result.success
                && !self.config.dry_run_mode
                && let Some((kind, target)) = self.idempotency.infer_mutation(command)
            {
                self.idempotency.record_mutation(kind, &target);
            }

            let failed_critical = !result.success && self.is_critical(command);
            results.push(result);

            if failed_critical {
                warn!(command = %command, "critical command failed, aborting subtask");
                break;
            }

            tokio::time::sleep(INTER_COMMAND_PAUSE).await;
        }

        results
    }

    async fn run_with_retries(&self, command: &str, ctx: &ExecutionContext, vctx: &ValidationContext) -> CommandResult {
        let timeout = self.config.command_timeout_for(ctx.subtask.timeout_secs);
        let step_id = self.tracking_id(ctx);
        let mut retry = 0u32;

        loop {
            let mut result = self.execute_once(command, ctx, vctx, timeout).await;
            result.retry_count = retry;

            self.tracker.record_attempt(
                &step_id,
                command,
                result.success,
                result.duration_ms,
                Some(result.exit_code),
                result.error_message.clone(),
                false,
            );

            let retriable = !result.success && result.status != ExecutionStatus::Timeout && !result.flag("safety_rejected");
            if !retriable || retry >= self.config.max_retries_per_command {
                return result;
            }

            retry += 1;
            self.stats.lock().unwrap().retry_attempts += 1;
            debug!(command = %command, retry, "retrying command");
            tokio::time::sleep(INTER_COMMAND_PAUSE).await;
        }
    }

    async fn execute_once(
        &self,
        command: &str,
        ctx: &ExecutionContext,
        vctx: &ValidationContext,
        timeout: Duration,
    ) -> CommandResult {
        match ctx.transport.execute_command(command, timeout, Some(vctx)).await {
            Ok(out) => CommandResult::completed(command, out.exit_code, out.stdout, out.stderr, out.duration_ms),
            Err(TransportError::Timeout(t)) => CommandResult::timed_out(command, t.as_millis() as u64),
            Err(e @ TransportError::Rejected { .. }) => {
                let mut result = CommandResult::failed(command, e.to_string(), 0);
                result.set_flag("safety_rejected", true);
                result
            }
            Err(e) => CommandResult::failed(command, e.to_string(), 0),
        }
    }

    /// Rewrite failed commands and re-execute the accepted rewrites.
    /// Timeouts and safety rejections are left alone.
    async fn apply_autocorrection(
        &self,
        results: Vec<CommandResult>,
        ctx: &ExecutionContext,
    ) -> Option<Vec<CommandResult>> {
        let step_id = self.tracking_id(ctx);
        let mut corrected_results = Vec::with_capacity(results.len());
        let mut corrections_applied = false;

        for result in results {
            let correctable =
                !result.success && result.status != ExecutionStatus::Timeout && !result.flag("safety_rejected");
            if !correctable {
                corrected_results.push(result);
                continue;
            }

            self.stats.lock().unwrap().autocorrections += 1;
            let correction = self.autocorrect.correct(&result, ctx).await;

            let Some(final_command) = correction.final_command.filter(|_| correction.success) else {
                warn!(command = %result.command, attempts = correction.total_attempts, "autocorrection failed");
                corrected_results.push(result);
                continue;
            };

            info!(
                original = %result.command,
                corrected = %final_command,
                attempts = correction.total_attempts,
                "applying autocorrection"
            );

            let vctx = self.validation_context(ctx, corrected_results.len());
            let timeout = self.config.command_timeout_for(ctx.subtask.timeout_secs);
            let mut corrected = self.execute_once(&final_command, ctx, &vctx, timeout).await;
            corrected.retry_count = result.retry_count + 1;
            corrected.set_flag("autocorrected", true);
            corrected
                .metadata
                .insert("original_command".to_string(), serde_json::json!(result.command));
            corrected.metadata.insert(
                "autocorrection_attempts".to_string(),
                serde_json::json!(correction.total_attempts),
            );
            corrected.metadata.insert(
                "autocorrection_strategies".to_string(),
                serde_json::json!(
                    correction
                        .attempts
                        .iter()
                        .map(|a| a.strategy.to_string())
                        .collect::<Vec<_>>()
                ),
            );

            self.tracker.record_attempt(
                &step_id,
                &corrected.command,
                corrected.success,
                corrected.duration_ms,
                Some(corrected.exit_code),
                corrected.error_message.clone(),
                true,
            );

            if corrected.success {
                self.stats.lock().unwrap().autocorrection_successes += 1;
            }
            corrections_applied = true;
            corrected_results.push(corrected);
        }

        if corrections_applied { Some(corrected_results) } else { None }
    }

    async fn execute_health_checks(&self, health_checks: &[String], ctx: &ExecutionContext) -> Vec<CommandResult> {
        let mut results = Vec::with_capacity(health_checks.len());

        for (index, check) in health_checks.iter().enumerate() {
            debug!(command = %check, "running health check");

            let result = if self.config.dry_run_mode {
                let mut result = CommandResult::completed(
                    check.clone(),
                    0,
                    format!("[DRY-RUN] health check '{}' passes", check),
                    String::new(),
                    0,
                );
                result.set_flag("dry_run", true);
                result
            } else {
                let vctx = self.validation_context(ctx, index);
                // Health checks run once; failures here are a verdict,
                // not something to autocorrect.
                self.execute_once(
                    check,
                    ctx,
                    &vctx,
                    self.config.command_timeout_for(ctx.subtask.timeout_secs),
                )
                .await
            };

            if !self.config.dry_run_mode {
                self.tracker.record_attempt(
                    &self.tracking_id(ctx),
                    check,
                    result.success,
                    result.duration_ms,
                    Some(result.exit_code),
                    result.error_message.clone(),
                    false,
                );
            }

            results.push(result);
            tokio::time::sleep(INTER_COMMAND_PAUSE).await;
        }

        results
    }

    async fn execute_rollback(&self, rollback_commands: &[String], ctx: &ExecutionContext) {
        for command in rollback_commands {
            if self.config.dry_run_mode {
                debug!(command = %command, "dry-run rollback, skipping");
                continue;
            }
            let vctx = self.validation_context(ctx, 0);
            let timeout = self.config.command_timeout_for(ctx.subtask.timeout_secs);
            let result = self.execute_once(command, ctx, &vctx, timeout).await;
            if !result.success {
                warn!(command = %command, exit = result.exit_code, "rollback command failed");
            }
        }
    }

    fn is_critical(&self, command: &str) -> bool {
        let lowered = command.to_lowercase();
        CRITICAL_COMMANDS.iter().any(|c| lowered.contains(c)) || self.legacy_service_start.is_match(&lowered)
    }

    fn validation_context(&self, ctx: &ExecutionContext, command_index: usize) -> ValidationContext {
        ValidationContext {
            task_id: ctx.task_id.clone(),
            step_id: ctx.step_id.clone(),
            subtask_id: Some(ctx.subtask.id.clone()),
            command_index: Some(command_index),
            user: None,
        }
    }

    fn tracking_id(&self, ctx: &ExecutionContext) -> String {
        ctx.step_id.clone().unwrap_or_else(|| ctx.subtask.id.clone())
    }

    fn emit(&self, ctx: &ExecutionContext, event: ProgressEvent) {
        if let Some(tm) = &self.taskmaster {
            tm.report_progress(&event);
        }
        ctx.emit(event);
    }

    fn update_stats(&self, commands: &[CommandResult], health_checks: &[CommandResult], duration_ms: u64) {
        let mut stats = self.stats.lock().unwrap();
        for result in commands.iter().chain(health_checks.iter()) {
            stats.total_commands += 1;
            if result.success {
                stats.successful_commands += 1;
            } else {
                stats.failed_commands += 1;
            }
        }
        stats.total_duration_ms += duration_ms;
    }
}
