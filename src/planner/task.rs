//! Task planner
//!
//! Decomposes the operator's goal into an ordered, dependency-annotated
//! step plan. One level above the subtask planner: same JSON discipline,
//! but the output is a [`Task`] rather than shell material.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::TaskAgentConfig;
use crate::domain::{Priority, Task, TaskStep};
use crate::llm::{LlmProvider, LlmRequestBuilder, TokenUsage};
use crate::taskmaster::TaskMaster;

use super::{PlanningContext, extract_json, topological_sort, validate_dependency_graph};

/// Outcome of planning one goal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlanningResult {
    pub success: bool,
    pub task: Option<Task>,
    pub issues: Vec<String>,
    pub error_message: Option<String>,
    pub planning_duration_ms: u64,
    pub usage: TokenUsage,
}

impl TaskPlanningResult {
    fn failure(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            task: None,
            issues: Vec::new(),
            error_message: Some(error.into()),
            planning_duration_ms: duration_ms,
            usage: TokenUsage::default(),
        }
    }
}

/// Decomposes goals into ordered steps
pub struct TaskPlanner {
    llm: Arc<dyn LlmProvider>,
    config: TaskAgentConfig,
    taskmaster: Option<Arc<TaskMaster>>,
}

impl TaskPlanner {
    pub fn new(llm: Arc<dyn LlmProvider>, config: TaskAgentConfig) -> Self {
        Self {
            llm,
            config,
            taskmaster: None,
        }
    }

    pub fn with_taskmaster(mut self, taskmaster: Arc<TaskMaster>) -> Self {
        self.taskmaster = Some(taskmaster);
        self
    }

    /// Produce a step plan for the goal
    pub async fn plan(&self, goal: &str, ctx: &PlanningContext) -> TaskPlanningResult {
        let start = Instant::now();
        info!(goal = %goal, "planning task");

        let mut prompt = self.build_prompt(goal, ctx);
        if let Some(tm) = &self.taskmaster
            && let Some(improved) = tm.improve_prompt(&prompt).await
        {
            prompt = improved;
        }

        let request = LlmRequestBuilder::new(&self.config.model, self.config.temperature)
            .system_message(
                "You are an experienced Linux administrator planning server \
                 changes. Answer only with the requested JSON.",
            )
            .build(prompt, self.config.max_tokens);

        let response = self.llm.generate(request).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        if !response.success {
            let error = response.error.unwrap_or_else(|| "LLM request failed".to_string());
            warn!(goal = %goal, error = %error, "task planning failed");
            return TaskPlanningResult::failure(error, duration_ms);
        }

        let Some(json) = extract_json(&response.content) else {
            return TaskPlanningResult::failure("no JSON object found in LLM response", duration_ms);
        };
        let parsed: serde_json::Value = match serde_json::from_str(json) {
            Ok(value) => value,
            Err(e) => {
                return TaskPlanningResult::failure(format!("malformed JSON in LLM response: {}", e), duration_ms);
            }
        };

        let mut steps = self.build_steps(&parsed);
        if steps.is_empty() {
            return TaskPlanningResult::failure("LLM response contained no steps", duration_ms);
        }

        let issues = self.validate(&mut steps);
        let steps = topological_sort(&steps);

        let mut task = Task::new(goal, goal);
        task.steps = steps;

        info!(
            task_id = %task.id,
            steps = task.steps.len(),
            issues = issues.len(),
            duration_ms,
            "task planning complete"
        );

        TaskPlanningResult {
            success: true,
            task: Some(task),
            issues,
            error_message: None,
            planning_duration_ms: duration_ms,
            usage: response.usage,
        }
    }

    fn build_prompt(&self, goal: &str, ctx: &PlanningContext) -> String {
        let mut prompt = format!(
            "Break this administration goal into an ordered plan of steps.\n\n\
             Goal: {}\nTarget OS: {}\n",
            goal, ctx.server.os_type
        );

        if !ctx.server.installed_services.is_empty() {
            prompt.push_str(&format!(
                "Installed services: {}\n",
                ctx.server.installed_services.join(", ")
            ));
        }
        if !ctx.constraints.is_empty() {
            prompt.push_str(&format!("Constraints: {}\n", ctx.constraints.join("; ")));
        }

        prompt.push_str(&format!(
            "\nRespond with ONLY a JSON object in exactly this shape:\n\
             {{\n  \"steps\": [\n    {{\n      \"title\": \"...\",\n      \"description\": \"...\",\n      \
             \"priority\": \"low|medium|high|critical\",\n      \"estimated_duration\": 10,\n      \
             \"dependencies\": [0]\n    }}\n  ]\n}}\n\n\
             Rules: at most {} steps; estimated_duration is in minutes; \
             dependencies are zero-based indices into the steps array.\n",
            self.config.max_steps
        ));
        prompt
    }

    fn build_steps(&self, parsed: &serde_json::Value) -> Vec<TaskStep> {
        let Some(items) = parsed.get("steps").and_then(|v| v.as_array()) else {
            return Vec::new();
        };

        let mut steps: Vec<TaskStep> = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let title = item
                .get("title")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("Step {}", i + 1));

            let mut step = TaskStep::new(&title, item.get("description").and_then(|v| v.as_str()).unwrap_or(""));
            step.priority = item
                .get("priority")
                .and_then(|v| v.as_str())
                .and_then(|s| Priority::from_str(s).ok())
                .unwrap_or_default();
            step.estimated_duration_mins = item.get("estimated_duration").and_then(|v| v.as_u64()).unwrap_or(5) as u32;

            steps.push(step);
        }

        // Translate index dependencies to generated step IDs
        for (i, item) in items.iter().enumerate() {
            let Some(deps) = item.get("dependencies").and_then(|v| v.as_array()) else {
                continue;
            };
            let ids: Vec<String> = deps
                .iter()
                .filter_map(|d| d.as_u64())
                .filter_map(|index| {
                    let index = index as usize;
                    if index < steps.len() && index != i {
                        Some(steps[index].id.clone())
                    } else {
                        debug!(index, "dropping invalid step dependency index");
                        None
                    }
                })
                .collect();
            steps[i].dependencies = ids;
        }

        steps
    }

    fn validate(&self, steps: &mut [TaskStep]) -> Vec<String> {
        let mut issues = Vec::new();

        if steps.len() > self.config.max_steps {
            issues.push(format!("too many steps: {} > {}", steps.len(), self.config.max_steps));
        }

        // More than one critical step is usually plan inflation; keep the
        // first and downgrade the rest.
        let critical_count = steps.iter().filter(|s| s.priority == Priority::Critical).count();
        if critical_count > 1 {
            issues.push(format!("{} steps marked critical; keeping the first", critical_count));
            let mut seen_critical = false;
            for step in steps.iter_mut() {
                if step.priority == Priority::Critical {
                    if seen_critical {
                        step.priority = Priority::High;
                    }
                    seen_critical = true;
                }
            }
        }

        if let Err(offenders) = validate_dependency_graph(steps) {
            issues.push(format!("dependency graph problems: {}", offenders.join(", ")));
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockProvider;
    use crate::test_utils::ScriptedProvider;

    fn planner_with(provider: Arc<dyn LlmProvider>) -> TaskPlanner {
        TaskPlanner::new(provider, TaskAgentConfig::default())
    }

    #[tokio::test]
    async fn test_plan_with_mock_provider() {
        let planner = planner_with(Arc::new(MockProvider::new()));
        let result = planner.plan("install and configure nginx", &PlanningContext::default()).await;

        assert!(result.success);
        let task = result.task.unwrap();
        assert_eq!(task.steps.len(), 3);
        assert_eq!(task.description, "install and configure nginx");
        // Mock plan forms a chain; order must respect it
        assert!(task.steps[0].dependencies.is_empty());
        assert_eq!(task.steps[1].dependencies, vec![task.steps[0].id.clone()]);
    }

    #[tokio::test]
    async fn test_priorities_parsed() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_content(
            r#"{"steps": [
                {"title": "A", "description": "", "priority": "critical", "estimated_duration": 5},
                {"title": "B", "description": "", "priority": "bogus", "estimated_duration": 5}
            ]}"#,
        );
        let planner = planner_with(provider);

        let result = planner.plan("do things", &PlanningContext::default()).await;
        let task = result.task.unwrap();
        assert_eq!(task.steps[0].priority, Priority::Critical);
        assert_eq!(task.steps[1].priority, Priority::Medium);
    }

    #[tokio::test]
    async fn test_multiple_critical_downgraded() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_content(
            r#"{"steps": [
                {"title": "A", "priority": "critical"},
                {"title": "B", "priority": "critical"},
                {"title": "C", "priority": "critical"}
            ]}"#,
        );
        let planner = planner_with(provider);

        let result = planner.plan("do things", &PlanningContext::default()).await;
        assert!(result.issues.iter().any(|i| i.contains("critical")));
        let task = result.task.unwrap();
        let criticals = task.steps.iter().filter(|s| s.priority == Priority::Critical).count();
        assert_eq!(criticals, 1);
    }

    #[tokio::test]
    async fn test_dependency_order_respected() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_content(
            r#"{"steps": [
                {"title": "Verify", "dependencies": [1]},
                {"title": "Install", "dependencies": []}
            ]}"#,
        );
        let planner = planner_with(provider);

        let result = planner.plan("do things", &PlanningContext::default()).await;
        let task = result.task.unwrap();
        assert_eq!(task.steps[0].title, "Install");
        assert_eq!(task.steps[1].title, "Verify");
    }

    #[tokio::test]
    async fn test_llm_failure_reported() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_failure("timeout");
        let planner = planner_with(provider);

        let result = planner.plan("goal", &PlanningContext::default()).await;
        assert!(!result.success);
        assert!(result.task.is_none());
    }

    #[tokio::test]
    async fn test_empty_steps_is_failure() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_content(r#"{"steps": []}"#);
        let planner = planner_with(provider);

        let result = planner.plan("goal", &PlanningContext::default()).await;
        assert!(!result.success);
    }
}
