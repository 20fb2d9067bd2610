//! Error tracker and escalation
//!
//! Counts failures per step, derives escalation levels, and applies a
//! cooldown so the same escalation does not fire repeatedly. Levels are
//! monotone within one step execution:
//! none -> planner -> human -> emergency_stop.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::config::ErrorHandlerConfig;

/// Severity of a step's failure trajectory
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    #[default]
    None,
    /// Re-plan the step
    Planner,
    /// Hand control to the operator
    Human,
    /// Abort the task and roll back
    EmergencyStop,
}

impl std::fmt::Display for EscalationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Planner => write!(f, "planner"),
            Self::Human => write!(f, "human"),
            Self::EmergencyStop => write!(f, "emergency_stop"),
        }
    }
}

/// One recorded execution attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub command: String,
    pub success: bool,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub autocorrection_used: bool,
}

/// Derived per-step statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepErrorSummary {
    pub step_id: String,
    pub attempts: usize,
    pub failures: usize,
    pub success_rate: f64,
    pub consecutive_failures: u32,
    pub autocorrection_uses: usize,
    pub last_error_time: Option<DateTime<Utc>>,
    pub escalation_level: EscalationLevel,
}

#[derive(Default)]
struct StepState {
    records: Vec<ErrorRecord>,
    consecutive_failures: u32,
    last_error_time: Option<DateTime<Utc>>,
    level: EscalationLevel,
    /// Last time each level's signal fired, for the cooldown
    signalled: HashMap<EscalationLevel, DateTime<Utc>>,
}

/// Tracks attempts per step and answers escalation queries
pub struct ErrorTracker {
    config: ErrorHandlerConfig,
    steps: Mutex<HashMap<String, StepState>>,
}

impl ErrorTracker {
    pub fn new(config: ErrorHandlerConfig) -> Self {
        Self {
            config,
            steps: Mutex::new(HashMap::new()),
        }
    }

    /// Record one execution attempt for a step
    #[allow(clippy::too_many_arguments)]
    pub fn record_attempt(
        &self,
        step_id: &str,
        command: &str,
        success: bool,
        duration_ms: u64,
        exit_code: Option<i32>,
        error: Option<String>,
        autocorrection_used: bool,
    ) {
        let mut steps = self.steps.lock().unwrap();
        let state = steps.entry(step_id.to_string()).or_default();

        let now = Utc::now();
        state.records.push(ErrorRecord {
            timestamp: now,
            command: command.to_string(),
            success,
            duration_ms,
            exit_code,
            error,
            autocorrection_used,
        });

        if success {
            state.consecutive_failures = 0;
        } else {
            state.consecutive_failures += 1;
            state.last_error_time = Some(now);
        }

        // Escalation level only ever climbs within one execution
        let derived = self.derive_level(state.consecutive_failures);
        if derived > state.level {
            warn!(step_id = %step_id, level = %derived, "escalation level raised");
            state.level = derived;
        }

        debug!(
            step_id = %step_id,
            success,
            consecutive_failures = state.consecutive_failures,
            "attempt recorded"
        );
    }

    /// The step has crossed the planner threshold and the signal is not in
    /// cooldown.
    pub fn should_escalate_to_planner(&self, step_id: &str) -> bool {
        if !self.config.send_to_planner_after_threshold {
            return false;
        }
        self.signal(step_id, EscalationLevel::Planner)
    }

    /// The step has crossed the human threshold and the signal is not in
    /// cooldown.
    pub fn should_escalate_to_human(&self, step_id: &str) -> bool {
        self.signal(step_id, EscalationLevel::Human)
    }

    /// Current (monotone) escalation level for a step
    pub fn escalation_level(&self, step_id: &str) -> EscalationLevel {
        self.steps
            .lock()
            .unwrap()
            .get(step_id)
            .map(|s| s.level)
            .unwrap_or_default()
    }

    /// Derived summary for a step
    pub fn summary(&self, step_id: &str) -> StepErrorSummary {
        let steps = self.steps.lock().unwrap();
        let Some(state) = steps.get(step_id) else {
            return StepErrorSummary {
                step_id: step_id.to_string(),
                attempts: 0,
                failures: 0,
                success_rate: 0.0,
                consecutive_failures: 0,
                autocorrection_uses: 0,
                last_error_time: None,
                escalation_level: EscalationLevel::None,
            };
        };

        let attempts = state.records.len();
        let failures = state.records.iter().filter(|r| !r.success).count();
        StepErrorSummary {
            step_id: step_id.to_string(),
            attempts,
            failures,
            success_rate: if attempts > 0 {
                (attempts - failures) as f64 / attempts as f64 * 100.0
            } else {
                0.0
            },
            consecutive_failures: state.consecutive_failures,
            autocorrection_uses: state.records.iter().filter(|r| r.autocorrection_used).count(),
            last_error_time: state.last_error_time,
            escalation_level: state.level,
        }
    }

    /// Drop records older than the retention window and forget steps with
    /// no remaining records.
    pub fn cleanup(&self) {
        let cutoff = Utc::now() - ChronoDuration::days(self.config.max_retention_days);
        let mut steps = self.steps.lock().unwrap();
        for state in steps.values_mut() {
            state.records.retain(|r| r.timestamp >= cutoff);
        }
        steps.retain(|_, state| !state.records.is_empty() || state.level != EscalationLevel::None);
    }

    /// Forget everything about a step (used after a successful re-plan)
    pub fn reset_step(&self, step_id: &str) {
        self.steps.lock().unwrap().remove(step_id);
    }

    /// Total attempts and failures across all steps
    pub fn global_counts(&self) -> (usize, usize) {
        let steps = self.steps.lock().unwrap();
        let attempts = steps.values().map(|s| s.records.len()).sum();
        let failures = steps
            .values()
            .map(|s| s.records.iter().filter(|r| !r.success).count())
            .sum();
        (attempts, failures)
    }

    fn derive_level(&self, consecutive_failures: u32) -> EscalationLevel {
        if consecutive_failures >= self.config.emergency_stop_threshold {
            EscalationLevel::EmergencyStop
        } else if consecutive_failures >= self.config.human_escalation_threshold {
            EscalationLevel::Human
        } else if consecutive_failures >= self.config.error_threshold_per_step {
            EscalationLevel::Planner
        } else {
            EscalationLevel::None
        }
    }

    /// A level signals when the step has reached it and that level has
    /// not signalled within the cooldown window.
    fn signal(&self, step_id: &str, level: EscalationLevel) -> bool {
        let mut steps = self.steps.lock().unwrap();
        let Some(state) = steps.get_mut(step_id) else {
            return false;
        };
        if state.level < level {
            return false;
        }

        let now = Utc::now();
        let cooldown = ChronoDuration::minutes(self.config.escalation_cooldown_minutes as i64);
        if let Some(last) = state.signalled.get(&level)
            && now.signed_duration_since(*last) < cooldown
        {
            return false;
        }
        state.signalled.insert(level, now);
        true
    }
}
