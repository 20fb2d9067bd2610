//! Subtask planner
//!
//! Expands one plan step into a sequence of subtasks via the LLM, then
//! post-validates: non-empty commands, no forbidden command, resolvable
//! acyclic dependencies. Validation problems are recorded but the
//! subtasks are still returned; the executor's safety checks catch
//! dangerous entries at run time.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SubtaskAgentConfig;
use crate::domain::{Subtask, TaskStep};
use crate::idempotency::IdempotencySystem;
use crate::llm::{LlmProvider, LlmRequestBuilder, TokenUsage};
use crate::safety::{SafetyValidator, SecurityLevel};
use crate::taskmaster::TaskMaster;

use super::{PlanningContext, extract_json, topological_sort, validate_dependency_graph};

/// Disk-usage guard added as a health check to install-heavy subtasks:
/// fails when any filesystem is above 90% full.
const DISK_USAGE_CHECK: &str = "df -h | grep -E '^/dev/' | awk '{print $5}' | sed 's/%//' | awk '$1 > 90 {exit 1}'";

/// Outcome of planning one step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskPlanningResult {
    pub success: bool,
    pub subtasks: Vec<Subtask>,
    /// Validation problems found after parsing; non-fatal
    pub issues: Vec<String>,
    pub error_message: Option<String>,
    pub planning_duration_ms: u64,
    pub usage: TokenUsage,
}

impl SubtaskPlanningResult {
    fn failure(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            subtasks: Vec::new(),
            issues: Vec::new(),
            error_message: Some(error.into()),
            planning_duration_ms: duration_ms,
            usage: TokenUsage::default(),
        }
    }
}

/// Expands steps into executable subtasks
pub struct SubtaskPlanner {
    llm: Arc<dyn LlmProvider>,
    config: SubtaskAgentConfig,
    validator: Arc<SafetyValidator>,
    idempotency: Option<Arc<IdempotencySystem>>,
    taskmaster: Option<Arc<TaskMaster>>,
}

impl SubtaskPlanner {
    pub fn new(llm: Arc<dyn LlmProvider>, config: SubtaskAgentConfig, validator: Arc<SafetyValidator>) -> Self {
        Self {
            llm,
            config,
            validator,
            idempotency: None,
            taskmaster: None,
        }
    }

    /// Enable idempotent-wrap enrichment of generated commands
    pub fn with_idempotency(mut self, idempotency: Arc<IdempotencySystem>) -> Self {
        self.idempotency = Some(idempotency);
        self
    }

    pub fn with_taskmaster(mut self, taskmaster: Arc<TaskMaster>) -> Self {
        self.taskmaster = Some(taskmaster);
        self
    }

    /// Plan the subtasks for one step
    pub async fn plan(&self, step: &TaskStep, ctx: &PlanningContext) -> SubtaskPlanningResult {
        let start = Instant::now();
        info!(step_id = %step.id, title = %step.title, "planning subtasks");

        let mut prompt = self.build_prompt(step, ctx);
        if let Some(tm) = &self.taskmaster
            && let Some(improved) = tm.improve_prompt(&prompt).await
        {
            prompt = improved;
        }

        let request = LlmRequestBuilder::new(&self.config.model, self.config.temperature)
            .system_message(
                "You are an experienced Linux administrator. You produce \
                 precise, non-interactive shell commands and answer only \
                 with the requested JSON.",
            )
            .build(prompt, self.config.max_tokens);

        let response = self.llm.generate(request).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        if !response.success {
            let error = response.error.unwrap_or_else(|| "LLM request failed".to_string());
            warn!(step_id = %step.id, error = %error, "subtask planning failed");
            return SubtaskPlanningResult::failure(error, duration_ms);
        }

        let Some(json) = extract_json(&response.content) else {
            return SubtaskPlanningResult::failure("no JSON object found in LLM response", duration_ms);
        };
        let parsed: serde_json::Value = match serde_json::from_str(json) {
            Ok(value) => value,
            Err(e) => {
                return SubtaskPlanningResult::failure(format!("malformed JSON in LLM response: {}", e), duration_ms);
            }
        };

        let mut subtasks = self.build_subtasks(&parsed, step);
        if subtasks.is_empty() {
            return SubtaskPlanningResult::failure("LLM response contained no subtasks", duration_ms);
        }

        let issues = self.validate(&subtasks);
        self.enrich(&mut subtasks);
        let subtasks = topological_sort(&subtasks);

        info!(
            step_id = %step.id,
            subtasks = subtasks.len(),
            issues = issues.len(),
            duration_ms,
            "subtask planning complete"
        );

        SubtaskPlanningResult {
            success: true,
            subtasks,
            issues,
            error_message: None,
            planning_duration_ms: duration_ms,
            usage: response.usage,
        }
    }

    fn build_prompt(&self, step: &TaskStep, ctx: &PlanningContext) -> String {
        let mut prompt = format!(
            "Expand this administration step into concrete subtasks with shell commands.\n\n\
             Step: {}\nDetails: {}\nTarget OS: {}\n",
            step.title, step.description, ctx.server.os_type
        );

        if !ctx.server.installed_services.is_empty() {
            prompt.push_str(&format!(
                "Installed services: {}\n",
                ctx.server.installed_services.join(", ")
            ));
        }
        if !ctx.server.installed_packages.is_empty() {
            prompt.push_str(&format!(
                "Installed packages: {}\n",
                ctx.server.installed_packages.join(", ")
            ));
        }
        if !ctx.constraints.is_empty() {
            prompt.push_str(&format!("Constraints: {}\n", ctx.constraints.join("; ")));
        }
        if !ctx.previous_subtasks.is_empty() {
            prompt.push_str(&format!(
                "Already planned subtasks: {}\n",
                ctx.previous_subtasks.join(", ")
            ));
        }

        prompt.push_str(&format!(
            "\nRespond with ONLY a JSON object in exactly this shape:\n\
             {{\n  \"subtasks\": [\n    {{\n      \"title\": \"...\",\n      \"description\": \"...\",\n      \
             \"commands\": [\"shell command\"],\n      \"health_checks\": [\"verification command\"],\n      \
             \"expected_output\": \"...\",\n      \"rollback_commands\": [\"inverse command\"],\n      \
             \"dependencies\": [0],\n      \"timeout\": 30\n    }}\n  ]\n}}\n\n\
             Rules: at most {} subtasks; dependencies are zero-based indices \
             into the subtasks array; commands must be non-interactive.\n",
            self.config.max_subtasks
        ));
        prompt
    }

    /// Instantiate subtasks from the parsed JSON, filtering non-string
    /// entries and translating index dependencies to generated IDs.
    fn build_subtasks(&self, parsed: &serde_json::Value, step: &TaskStep) -> Vec<Subtask> {
        let Some(items) = parsed.get("subtasks").and_then(|v| v.as_array()) else {
            return Vec::new();
        };

        let mut subtasks: Vec<Subtask> = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let title = item
                .get("title")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("Subtask {}", i + 1));

            let mut subtask = Subtask::new(&title, item.get("description").and_then(|v| v.as_str()).unwrap_or(""));
            subtask.commands = string_items(item.get("commands"));
            subtask.health_checks = string_items(item.get("health_checks"));
            subtask.rollback_commands = string_items(item.get("rollback_commands"));
            subtask.expected_output = item
                .get("expected_output")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            subtask.timeout_secs = item.get("timeout").and_then(|v| v.as_u64()).unwrap_or(30);
            subtask.set_meta("step_id", serde_json::json!(step.id));
            subtask.set_meta("subtask_order", serde_json::json!(i + 1));

            subtasks.push(subtask);
        }

        // Second pass: translate index-based dependencies to the
        // generated subtask IDs; out-of-range indices are dropped.
        for (i, item) in items.iter().enumerate() {
            let Some(deps) = item.get("dependencies").and_then(|v| v.as_array()) else {
                continue;
            };
            let ids: Vec<String> = deps
                .iter()
                .filter_map(|d| d.as_u64())
                .filter_map(|index| {
                    let index = index as usize;
                    if index < subtasks.len() && index != i {
                        Some(subtasks[index].id.clone())
                    } else {
                        debug!(index, "dropping invalid dependency index");
                        None
                    }
                })
                .collect();
            subtasks[i].dependencies = ids;
        }

        subtasks
    }

    fn validate(&self, subtasks: &[Subtask]) -> Vec<String> {
        let mut issues = Vec::new();

        if subtasks.len() > self.config.max_subtasks {
            issues.push(format!(
                "too many subtasks: {} > {}",
                subtasks.len(),
                self.config.max_subtasks
            ));
        }

        for (i, subtask) in subtasks.iter().enumerate() {
            if subtask.commands.is_empty() {
                issues.push(format!("subtask {} has no commands", i + 1));
            }
            for command in &subtask.commands {
                let verdict = self.validator.validate(command, None);
                if verdict.security_level == SecurityLevel::Forbidden {
                    issues.push(format!("subtask {} contains a forbidden command: {}", i + 1, command));
                }
            }
        }

        if let Err(offenders) = validate_dependency_graph(subtasks) {
            issues.push(format!("dependency graph problems: {}", offenders.join(", ")));
        }

        issues
    }

    /// Wrap mutating commands idempotently and add the common health checks
    fn enrich(&self, subtasks: &mut [Subtask]) {
        for subtask in subtasks.iter_mut() {
            if let Some(idempotency) = &self.idempotency
                && idempotency.enabled()
            {
                let mut wrapped_any = false;
                subtask.commands = subtask
                    .commands
                    .iter()
                    .map(|command| match idempotency.infer_mutation(command) {
                        Some((kind, target)) => {
                            wrapped_any = true;
                            idempotency.generate_idempotent(kind, &target).0
                        }
                        None => command.clone(),
                    })
                    .collect();
                if wrapped_any {
                    subtask.set_meta("idempotency_enhanced", serde_json::json!(true));
                }
            }

            let uses_systemctl = subtask.commands.iter().any(|c| c.contains("systemctl"));
            if uses_systemctl && !subtask.health_checks.iter().any(|c| c.contains("systemctl")) {
                subtask.health_checks.push("systemctl is-system-running".to_string());
            }

            let installs = subtask
                .commands
                .iter()
                .any(|c| c.contains("install") || c.contains("apt"));
            if installs && !subtask.health_checks.iter().any(|c| c.contains("df")) {
                subtask.health_checks.push(DISK_USAGE_CHECK.to_string());
            }
        }
    }
}

fn string_items(value: Option<&serde_json::Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;
    use crate::llm::MockProvider;
    use crate::test_utils::ScriptedProvider;

    fn planner_with(provider: Arc<dyn LlmProvider>) -> SubtaskPlanner {
        SubtaskPlanner::new(
            provider,
            SubtaskAgentConfig::default(),
            Arc::new(SafetyValidator::new(&SecurityConfig::default(), &[])),
        )
    }

    fn step() -> TaskStep {
        TaskStep::new("Install nginx", "install and start nginx")
    }

    #[tokio::test]
    async fn test_plan_with_mock_provider() {
        let planner = planner_with(Arc::new(MockProvider::new()));
        let result = planner.plan(&step(), &PlanningContext::default()).await;

        assert!(result.success);
        assert_eq!(result.subtasks.len(), 3);
        assert!(result.issues.is_empty());
        assert!(result.subtasks.iter().all(|s| !s.commands.is_empty()));
    }

    #[tokio::test]
    async fn test_dependency_indices_translated() {
        let planner = planner_with(Arc::new(MockProvider::new()));
        let result = planner.plan(&step(), &PlanningContext::default()).await;

        // Mock plan: 0 <- 1 <- 2, already in order
        let subtasks = &result.subtasks;
        assert!(subtasks[0].dependencies.is_empty());
        assert_eq!(subtasks[1].dependencies, vec![subtasks[0].id.clone()]);
        assert_eq!(subtasks[2].dependencies, vec![subtasks[1].id.clone()]);
    }

    #[tokio::test]
    async fn test_non_string_commands_filtered() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_content(
            r#"{"subtasks": [{"title": "Mixed", "description": "", "commands": ["echo ok", 42, null, "echo two"], "health_checks": [true, "echo hc"]}]}"#,
        );
        let planner = planner_with(provider);

        let result = planner.plan(&step(), &PlanningContext::default()).await;
        assert!(result.success);
        assert_eq!(result.subtasks[0].commands, vec!["echo ok", "echo two"]);
        assert_eq!(result.subtasks[0].health_checks, vec!["echo hc"]);
    }

    #[tokio::test]
    async fn test_json_extracted_from_prose() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_content(
            "Here is your plan:\n{\"subtasks\": [{\"title\": \"One\", \"commands\": [\"echo 1\"]}]}\nGood luck!",
        );
        let planner = planner_with(provider);

        let result = planner.plan(&step(), &PlanningContext::default()).await;
        assert!(result.success);
        assert_eq!(result.subtasks.len(), 1);
    }

    #[tokio::test]
    async fn test_forbidden_command_flagged_but_returned() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_content(r#"{"subtasks": [{"title": "Bad", "commands": ["rm -rf /"]}]}"#);
        let planner = planner_with(provider);

        let result = planner.plan(&step(), &PlanningContext::default()).await;
        assert!(result.success);
        assert_eq!(result.subtasks.len(), 1);
        assert!(result.issues.iter().any(|i| i.contains("forbidden")));
    }

    #[tokio::test]
    async fn test_empty_commands_flagged() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_content(r#"{"subtasks": [{"title": "Empty", "commands": []}]}"#);
        let planner = planner_with(provider);

        let result = planner.plan(&step(), &PlanningContext::default()).await;
        assert!(result.success);
        assert!(result.issues.iter().any(|i| i.contains("no commands")));
    }

    #[tokio::test]
    async fn test_out_of_range_dependency_dropped() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_content(
            r#"{"subtasks": [{"title": "One", "commands": ["echo 1"], "dependencies": [7]}]}"#,
        );
        let planner = planner_with(provider);

        let result = planner.plan(&step(), &PlanningContext::default()).await;
        assert!(result.subtasks[0].dependencies.is_empty());
    }

    #[tokio::test]
    async fn test_max_subtasks_flagged() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_content(
            r#"{"subtasks": [
                {"title": "One", "commands": ["echo 1"]},
                {"title": "Two", "commands": ["echo 2"]}
            ]}"#,
        );
        let planner = SubtaskPlanner::new(
            provider,
            SubtaskAgentConfig {
                max_subtasks: 1,
                ..SubtaskAgentConfig::default()
            },
            Arc::new(SafetyValidator::new(&SecurityConfig::default(), &[])),
        );

        let result = planner.plan(&step(), &PlanningContext::default()).await;
        assert!(result.success);
        assert!(result.issues.iter().any(|i| i.contains("too many subtasks")));
    }

    #[tokio::test]
    async fn test_llm_failure_reported() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_failure("provider unreachable");
        let planner = planner_with(provider);

        let result = planner.plan(&step(), &PlanningContext::default()).await;
        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("unreachable"));
    }

    #[tokio::test]
    async fn test_no_json_reported() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_content("I cannot help with that.");
        let planner = planner_with(provider);

        let result = planner.plan(&step(), &PlanningContext::default()).await;
        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("no JSON"));
    }

    #[tokio::test]
    async fn test_health_check_enrichment() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_content(
            r#"{"subtasks": [
                {"title": "Start", "commands": ["systemctl start nginx"], "health_checks": []},
                {"title": "Install", "commands": ["apt-get install -y nginx"], "health_checks": []}
            ]}"#,
        );
        let planner = planner_with(provider);

        let result = planner.plan(&step(), &PlanningContext::default()).await;
        let start = result.subtasks.iter().find(|s| s.title == "Start").unwrap();
        assert!(start.health_checks.iter().any(|c| c.contains("is-system-running")));

        let install = result.subtasks.iter().find(|s| s.title == "Install").unwrap();
        assert!(install.health_checks.iter().any(|c| c.contains("df -h")));
    }

    #[tokio::test]
    async fn test_idempotency_enrichment_wraps_commands() {
        use crate::config::IdempotencyConfig;
        use crate::idempotency::IdempotencySystem;
        use crate::test_utils::ScriptedTransport;

        let provider = Arc::new(ScriptedProvider::new());
        provider.push_content(
            r#"{"subtasks": [{"title": "Install", "commands": ["apt-get install -y nginx"], "health_checks": []}]}"#,
        );
        let idempotency = Arc::new(IdempotencySystem::new(
            Arc::new(ScriptedTransport::new()),
            IdempotencyConfig::default(),
        ));
        let planner = planner_with(provider).with_idempotency(idempotency);

        let result = planner.plan(&step(), &PlanningContext::default()).await;
        let install = &result.subtasks[0];
        assert!(install.commands[0].starts_with("dpkg -l | grep -q '^ii  nginx' ||"));
        assert_eq!(install.metadata["idempotency_enhanced"], serde_json::json!(true));
    }
}
