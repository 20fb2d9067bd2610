//! Hierarchical planners
//!
//! [`task::TaskPlanner`] decomposes the operator goal into ordered steps;
//! [`subtask::SubtaskPlanner`] expands one step into subtasks holding the
//! actual shell commands. Both consume LLM output through strict JSON
//! parsing and post-validation.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::domain::{ServerFacts, Subtask, TaskStep};

pub mod subtask;
pub mod task;

pub use subtask::{SubtaskPlanner, SubtaskPlanningResult};
pub use task::{TaskPlanner, TaskPlanningResult};

/// Shared planning context: facts about the target and any constraints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanningContext {
    pub server: ServerFacts,

    #[serde(default)]
    pub constraints: Vec<String>,

    /// Titles of subtasks already planned for earlier steps
    #[serde(default)]
    pub previous_subtasks: Vec<String>,

    #[serde(default)]
    pub environment: HashMap<String, String>,
}

/// Anything with an ID and a dependency set
pub trait DependencyNode {
    fn node_id(&self) -> &str;
    fn node_deps(&self) -> &[String];
}

impl DependencyNode for Subtask {
    fn node_id(&self) -> &str {
        &self.id
    }
    fn node_deps(&self) -> &[String] {
        &self.dependencies
    }
}

impl DependencyNode for TaskStep {
    fn node_id(&self) -> &str {
        &self.id
    }
    fn node_deps(&self) -> &[String] {
        &self.dependencies
    }
}

/// Check the dependency graph is a DAG whose references all resolve.
/// Returns the offending node IDs on error.
pub fn validate_dependency_graph<N: DependencyNode>(nodes: &[N]) -> Result<(), Vec<String>> {
    let ids: HashSet<&str> = nodes.iter().map(|n| n.node_id()).collect();

    let unresolved: Vec<String> = nodes
        .iter()
        .flat_map(|n| n.node_deps().iter())
        .filter(|d| !ids.contains(d.as_str()))
        .cloned()
        .collect();
    if !unresolved.is_empty() {
        return Err(unresolved);
    }

    // Kahn's algorithm; leftovers are the cycle participants
    let sorted = kahn_order(nodes);
    if sorted.len() == nodes.len() {
        Ok(())
    } else {
        let sorted_set: HashSet<String> = sorted.into_iter().collect();
        Err(nodes
            .iter()
            .map(|n| n.node_id().to_string())
            .filter(|id| !sorted_set.contains(id))
            .collect())
    }
}

/// Order nodes so every dependency comes before its dependents. Unknown
/// dependencies are ignored; on a cycle the cyclic tail keeps its input
/// order (callers detect cycles via [`validate_dependency_graph`]).
pub fn topological_sort<N: DependencyNode + Clone>(nodes: &[N]) -> Vec<N> {
    let order = kahn_order(nodes);
    let index: HashMap<&str, usize> = order.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();

    let mut sorted: Vec<N> = nodes.to_vec();
    sorted.sort_by_key(|n| index.get(n.node_id()).copied().unwrap_or(usize::MAX));
    sorted
}

fn kahn_order<N: DependencyNode>(nodes: &[N]) -> Vec<String> {
    let ids: HashSet<&str> = nodes.iter().map(|n| n.node_id()).collect();

    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for node in nodes {
        let known_deps = node.node_deps().iter().filter(|d| ids.contains(d.as_str())).count();
        in_degree.insert(node.node_id(), known_deps);
        for dep in node.node_deps() {
            if ids.contains(dep.as_str()) {
                dependents.entry(dep.as_str()).or_default().push(node.node_id());
            }
        }
    }

    // Seed with zero-degree nodes in input order for stable output
    let mut queue: VecDeque<&str> = nodes
        .iter()
        .map(|n| n.node_id())
        .filter(|id| in_degree[id] == 0)
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());
        if let Some(deps) = dependents.get(id) {
            for dependent in deps {
                let degree = in_degree.get_mut(dependent).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }
    }
    order
}

/// Extract the first balanced `{...}` block from LLM output
pub(crate) fn extract_json(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&content[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subtask_with(id: &str, deps: &[&str]) -> Subtask {
        let mut s = Subtask::new(id, "");
        s.id = id.to_string();
        s.dependencies = deps.iter().map(|d| d.to_string()).collect();
        s
    }

    #[test]
    fn test_topological_order_scenario() {
        // T3 depends on T1 and T2; T2 depends on T1. Expected: T1, T2, T3.
        let nodes = vec![
            subtask_with("t3", &["t1", "t2"]),
            subtask_with("t1", &[]),
            subtask_with("t2", &["t1"]),
        ];

        let sorted = topological_sort(&nodes);
        let ids: Vec<&str> = sorted.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["t1", "t2", "t3"]);
    }

    #[test]
    fn test_validate_graph_ok() {
        let nodes = vec![subtask_with("a", &[]), subtask_with("b", &["a"])];
        assert!(validate_dependency_graph(&nodes).is_ok());
    }

    #[test]
    fn test_validate_graph_cycle() {
        let nodes = vec![subtask_with("a", &["b"]), subtask_with("b", &["a"])];
        let err = validate_dependency_graph(&nodes).unwrap_err();
        assert_eq!(err.len(), 2);
    }

    #[test]
    fn test_validate_graph_unresolved() {
        let nodes = vec![subtask_with("a", &["ghost"])];
        let err = validate_dependency_graph(&nodes).unwrap_err();
        assert_eq!(err, vec!["ghost"]);
    }

    #[test]
    fn test_extract_json() {
        assert_eq!(extract_json("noise {\"a\": 1} trailing"), Some("{\"a\": 1}"));
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json("} reversed {"), None);
    }
}
