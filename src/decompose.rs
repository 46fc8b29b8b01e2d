//! Decompose a free-form request into a validated task plan via one LLM call.
//!
//! No retry lives here. The caller decides whether to retry, fall back to a
//! single-task plan, or abort.

use serde::{Deserialize, Serialize};

use crate::artifacts::extract_json;
use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, Complexity, Message};

// =============================================================================
// Types
// =============================================================================

/// Which specialist persona executes a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Designer,
    Frontend,
    Backend,
    Tester,
    Writer,
    General,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Designer => "designer",
            AgentKind::Frontend => "frontend",
            AgentKind::Backend => "backend",
            AgentKind::Tester => "tester",
            AgentKind::Writer => "writer",
            AgentKind::General => "general",
        }
    }

    /// Tolerant mapping from model output. Unrecognized kinds become General
    /// rather than failing the whole plan.
    pub fn from_wire(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "designer" | "design" | "ui" | "ux" => AgentKind::Designer,
            "frontend" | "front-end" | "web" => AgentKind::Frontend,
            "backend" | "back-end" | "api" | "server" => AgentKind::Backend,
            "tester" | "test" | "qa" => AgentKind::Tester,
            "writer" | "docs" | "documentation" => AgentKind::Writer,
            _ => AgentKind::General,
        }
    }
}

/// One unit of work. Immutable once the plan is validated.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub agent_kind: AgentKind,
    pub description: String,
    pub dependencies: Vec<String>,
    pub priority: u8,
}

/// Validated output of decomposition. Every id in `parallel_groups` exists in
/// `tasks`, each task appears in exactly one group, and a task's dependencies
/// all sit in strictly earlier groups.
#[derive(Debug, Clone, Serialize)]
pub struct TaskPlan {
    pub project_name: String,
    pub summary: String,
    pub tasks: Vec<Task>,
    pub parallel_groups: Vec<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum DecomposeError {
    #[error("LLM call failed: {0}")]
    LlmFailed(#[from] crate::gateway::ProviderError),
    #[error("JSON parse failed: {0}")]
    JsonParse(String),
    #[error("decomposition produced no tasks")]
    NoTasks,
    #[error("duplicate task id: {0}")]
    DuplicateTask(String),
    #[error("task {task} depends on unknown id {dependency}")]
    UnknownDependency { task: String, dependency: String },
    #[error("cyclic dependencies involving: {0}")]
    CyclicDependencies(String),
    #[error("parallel groups reference unknown id {0}")]
    UnknownGroupMember(String),
    #[error("task {0} does not appear in exactly one group")]
    GroupCoverage(String),
    #[error("task {task} depends on {dependency}, which is not in a strictly earlier group")]
    OrderingViolation { task: String, dependency: String },
}

// =============================================================================
// Wire format
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ExtractedTask {
    pub id: String,
    #[serde(default, alias = "agentKind", alias = "agent_kind", alias = "kind")]
    pub agent: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub priority: u8,
}

#[derive(Debug, Deserialize)]
pub struct ExtractedPlan {
    #[serde(default, alias = "projectName")]
    pub project_name: String,
    #[serde(default)]
    pub summary: String,
    pub tasks: Vec<ExtractedTask>,
    #[serde(default, alias = "parallelGroups")]
    pub parallel_groups: Vec<Vec<String>>,
}

// =============================================================================
// System prompt
// =============================================================================

const DECOMPOSE_SYSTEM_PROMPT: &str = "\
You are a project planner. You receive a free-form build request and must \
decompose it into 1-8 self-contained tasks for specialist agents, plus an \
execution schedule.

Requirements:
- Use descriptive kebab-case task ids (e.g. \"design-layout\", \"frontend-views\").
- agent_kind is one of: designer, frontend, backend, tester, writer, general.
- dependencies lists ids of tasks whose output this task needs. The graph must \
  be acyclic.
- parallel_groups schedules the tasks: groups run one after another, tasks \
  inside a group run concurrently. Every dependency of a task must appear in a \
  strictly earlier group. Every task appears in exactly one group.
- Fewer, well-scoped tasks beat many shallow ones. A simple request may be a \
  single task in a single group.

Respond with JSON only:
{
  \"project_name\": \"short-name\",
  \"summary\": \"One-sentence restatement of the request\",
  \"tasks\": [
    {
      \"id\": \"kebab-case-id\",
      \"agent_kind\": \"frontend\",
      \"description\": \"Detailed instructions for this agent...\",
      \"dependencies\": [],
      \"priority\": 1
    }
  ],
  \"parallel_groups\": [[\"kebab-case-id\"]]
}";

// =============================================================================
// Decomposition
// =============================================================================

/// Decompose a request into a validated plan.
///
/// Returns the plan and the LLM cost in nanodollars.
pub async fn decompose_request(
    gateway: &dyn ChatGateway,
    model: &str,
    request: &str,
) -> Result<(TaskPlan, i64), DecomposeError> {
    let messages = vec![
        Message::system(DECOMPOSE_SYSTEM_PROMPT),
        Message::user(format!("## Request\n\n{request}")),
    ];

    let req = ChatRequest::new(
        ChatModel::openrouter(model),
        messages,
        Attribution::new("decompose"),
    )
    .temperature(0.2)
    .complexity(Complexity::High)
    .json();

    let resp = gateway.chat(req).await?;
    let cost = resp.cost_nanodollars;

    let json_str = extract_json(&resp.content);
    let extracted: ExtractedPlan = serde_json::from_str(json_str).map_err(|e| {
        let preview: String = resp.content.chars().take(500).collect();
        DecomposeError::JsonParse(format!("failed to parse plan: {e}; raw: {preview}"))
    })?;

    let plan = build_plan(extracted)?;
    Ok((plan, cost))
}

/// Convert wire output into a validated plan. When the model omits the
/// schedule, one is derived from the dependency graph.
pub fn build_plan(extracted: ExtractedPlan) -> Result<TaskPlan, DecomposeError> {
    if extracted.tasks.is_empty() {
        return Err(DecomposeError::NoTasks);
    }

    let tasks: Vec<Task> = extracted
        .tasks
        .into_iter()
        .map(|t| Task {
            agent_kind: AgentKind::from_wire(&t.agent),
            id: t.id,
            description: t.description,
            dependencies: t.dependencies,
            priority: t.priority,
        })
        .collect();

    let parallel_groups = if extracted.parallel_groups.is_empty() {
        derive_groups(&tasks)?
    } else {
        extracted.parallel_groups
    };

    let plan = TaskPlan {
        project_name: extracted.project_name,
        summary: extracted.summary,
        tasks,
        parallel_groups,
    };
    validate_plan(&plan)?;
    Ok(plan)
}

/// Layered topological sort: group *n* holds every task whose dependencies
/// are all satisfied by groups before *n*.
pub fn derive_groups(tasks: &[Task]) -> Result<Vec<Vec<String>>, DecomposeError> {
    use std::collections::HashSet;

    let mut placed: HashSet<&str> = HashSet::new();
    let mut remaining: Vec<&Task> = tasks.iter().collect();
    let mut groups: Vec<Vec<String>> = Vec::new();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<&Task>, Vec<&Task>) = remaining
            .into_iter()
            .partition(|t| t.dependencies.iter().all(|d| placed.contains(d.as_str())));

        if ready.is_empty() {
            let stuck: Vec<&str> = blocked.iter().map(|t| t.id.as_str()).collect();
            return Err(DecomposeError::CyclicDependencies(stuck.join(", ")));
        }

        for task in &ready {
            placed.insert(task.id.as_str());
        }
        groups.push(ready.iter().map(|t| t.id.clone()).collect());
        remaining = blocked;
    }
    Ok(groups)
}

/// Enforce the plan invariants: unique ids, known dependencies, exactly-one
/// group membership, dependencies in strictly earlier groups.
pub fn validate_plan(plan: &TaskPlan) -> Result<(), DecomposeError> {
    use std::collections::HashMap;

    let mut ids: HashMap<&str, ()> = HashMap::new();
    for task in &plan.tasks {
        if ids.insert(task.id.as_str(), ()).is_some() {
            return Err(DecomposeError::DuplicateTask(task.id.clone()));
        }
    }

    for task in &plan.tasks {
        for dep in &task.dependencies {
            if !ids.contains_key(dep.as_str()) {
                return Err(DecomposeError::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    // Group index per task id; duplicates across or within groups fail.
    let mut group_of: HashMap<&str, usize> = HashMap::new();
    for (index, group) in plan.parallel_groups.iter().enumerate() {
        for id in group {
            if !ids.contains_key(id.as_str()) {
                return Err(DecomposeError::UnknownGroupMember(id.clone()));
            }
            if group_of.insert(id.as_str(), index).is_some() {
                return Err(DecomposeError::GroupCoverage(id.clone()));
            }
        }
    }
    for task in &plan.tasks {
        if !group_of.contains_key(task.id.as_str()) {
            return Err(DecomposeError::GroupCoverage(task.id.clone()));
        }
    }

    for task in &plan.tasks {
        let own = group_of[task.id.as_str()];
        for dep in &task.dependencies {
            if group_of[dep.as_str()] >= own {
                return Err(DecomposeError::OrderingViolation {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str]) -> Task {
        Task {
            id: id.to_string(),
            agent_kind: AgentKind::General,
            description: format!("do {id}"),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            priority: 1,
        }
    }

    fn plan(tasks: Vec<Task>, groups: Vec<Vec<&str>>) -> TaskPlan {
        TaskPlan {
            project_name: "test".into(),
            summary: "test plan".into(),
            tasks,
            parallel_groups: groups
                .into_iter()
                .map(|g| g.into_iter().map(str::to_string).collect())
                .collect(),
        }
    }

    #[test]
    fn agent_kind_wire_mapping_is_tolerant() {
        assert_eq!(AgentKind::from_wire("Design"), AgentKind::Designer);
        assert_eq!(AgentKind::from_wire("front-end"), AgentKind::Frontend);
        assert_eq!(AgentKind::from_wire("QA"), AgentKind::Tester);
        assert_eq!(AgentKind::from_wire("something else"), AgentKind::General);
    }

    #[test]
    fn wire_plan_parses_with_aliases_and_defaults() {
        let json = r#"{
            "projectName": "todo-app",
            "tasks": [
                {"id": "design", "agentKind": "designer", "description": "layout"},
                {"id": "frontend-1", "kind": "frontend", "dependencies": ["design"]}
            ],
            "parallelGroups": [["design"], ["frontend-1"]]
        }"#;
        let extracted: ExtractedPlan = serde_json::from_str(json).unwrap();
        let plan = build_plan(extracted).unwrap();
        assert_eq!(plan.project_name, "todo-app");
        assert_eq!(plan.tasks[0].agent_kind, AgentKind::Designer);
        assert_eq!(plan.parallel_groups.len(), 2);
    }

    #[test]
    fn valid_plan_passes() {
        let p = plan(
            vec![
                task("design", &[]),
                task("frontend-1", &["design"]),
                task("frontend-2", &["design"]),
            ],
            vec![vec!["design"], vec!["frontend-1", "frontend-2"]],
        );
        validate_plan(&p).unwrap();
    }

    #[test]
    fn unknown_dependency_rejected() {
        let p = plan(vec![task("a", &["ghost"])], vec![vec!["a"]]);
        assert!(matches!(
            validate_plan(&p),
            Err(DecomposeError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn dependency_in_same_group_rejected() {
        let p = plan(
            vec![task("a", &[]), task("b", &["a"])],
            vec![vec!["a", "b"]],
        );
        assert!(matches!(
            validate_plan(&p),
            Err(DecomposeError::OrderingViolation { .. })
        ));
    }

    #[test]
    fn task_in_two_groups_rejected() {
        let p = plan(
            vec![task("a", &[]), task("b", &[])],
            vec![vec!["a"], vec!["a", "b"]],
        );
        assert!(matches!(
            validate_plan(&p),
            Err(DecomposeError::GroupCoverage(_))
        ));
    }

    #[test]
    fn ungrouped_task_rejected() {
        let p = plan(vec![task("a", &[]), task("b", &[])], vec![vec!["a"]]);
        assert!(matches!(
            validate_plan(&p),
            Err(DecomposeError::GroupCoverage(_))
        ));
    }

    #[test]
    fn derive_groups_layers_by_dependency_depth() {
        let tasks = vec![
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["a"]),
            task("d", &["b", "c"]),
        ];
        let groups = derive_groups(&tasks).unwrap();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0], vec!["a"]);
        assert_eq!(groups[2], vec!["d"]);
    }

    #[test]
    fn derive_groups_detects_cycle() {
        let tasks = vec![task("a", &["b"]), task("b", &["a"])];
        assert!(matches!(
            derive_groups(&tasks),
            Err(DecomposeError::CyclicDependencies(_))
        ));
    }

    #[test]
    fn derived_groups_always_validate() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..50 {
            let count = rng.gen_range(1..=10);
            let mut tasks = Vec::new();
            for i in 0..count {
                // Only depend on earlier ids: guarantees a DAG.
                let deps: Vec<String> = (0..i)
                    .filter(|_| rng.gen_bool(0.3))
                    .map(|d| format!("t{d}"))
                    .collect();
                let dep_refs: Vec<&str> = deps.iter().map(String::as_str).collect();
                tasks.push(task(&format!("t{i}"), &dep_refs));
            }
            let groups = derive_groups(&tasks).unwrap();
            let p = TaskPlan {
                project_name: "gen".into(),
                summary: "generated".into(),
                tasks,
                parallel_groups: groups,
            };
            validate_plan(&p).unwrap();
        }
    }
}
