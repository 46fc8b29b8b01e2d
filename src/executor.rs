//! Group-sequential, task-concurrent plan execution.
//!
//! Groups run strictly in order. Tasks inside a group run concurrently with a
//! bounded fan-out, each with its own timeout and rate-limit admission. A
//! failed or timed-out task becomes a failed [`TaskResult`]; it never aborts
//! the group or the run. Later groups receive a bounded textual summary of
//! everything earlier groups produced.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use uuid::Uuid;

use crate::artifacts::{parse_artifacts, ArtifactSet};
use crate::decompose::{AgentKind, Task, TaskPlan};
use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, Complexity, Message};
use crate::quota::{QuotaDecision, QuotaGate, WorkKind};
use crate::ratelimit::RateLimiter;
use crate::trace::ProgressFn;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Model every specialist runs on, in `provider/model` form.
    pub model: String,
    /// Hard budget per task, including the provider call.
    pub task_timeout: Duration,
    /// How long a task waits for rate-limit admission before failing.
    pub admission_timeout: Duration,
    /// Cap on the context summary handed to later groups.
    pub context_limit_chars: usize,
    /// Fan-out bound within one group.
    pub max_parallel_tasks: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            model: "openai/gpt-4o-mini".to_string(),
            task_timeout: Duration::from_secs(60),
            admission_timeout: Duration::from_secs(10),
            context_limit_chars: 4000,
            max_parallel_tasks: 4,
        }
    }
}

/// Outcome of one task execution. Never mutated; verification produces a new
/// result with `verified` set.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: String,
    pub agent_kind: AgentKind,
    pub success: bool,
    pub output: String,
    pub artifacts: ArtifactSet,
    pub duration_ms: u64,
    pub cost_nanodollars: i64,
    pub verified: bool,
}

impl TaskResult {
    fn failed(task: &Task, reason: String, started: Instant) -> Self {
        Self {
            task_id: task.id.clone(),
            agent_kind: task.agent_kind,
            success: false,
            output: reason,
            artifacts: ArtifactSet::new(),
            duration_ms: started.elapsed().as_millis() as u64,
            cost_nanodollars: 0,
            verified: false,
        }
    }
}

fn agent_system_prompt(kind: AgentKind) -> &'static str {
    match kind {
        AgentKind::Designer => {
            "You are a product designer. Produce concrete layout, style, and interaction \
             decisions, not vague direction."
        }
        AgentKind::Frontend => {
            "You are a frontend engineer. Produce complete, working UI code for the task."
        }
        AgentKind::Backend => {
            "You are a backend engineer. Produce complete, working server-side code for the task."
        }
        AgentKind::Tester => {
            "You are a test engineer. Produce runnable tests covering the described behavior."
        }
        AgentKind::Writer => {
            "You are a technical writer. Produce clear, complete documentation for the task."
        }
        AgentKind::General => "You are a senior software engineer. Complete the task end to end.",
    }
}

const ARTIFACT_INSTRUCTIONS: &str = "\
Return your deliverables as a JSON object:\n\
{\"artifacts\": {\"relative/path.ext\": \"full file content\", ...}, \"notes\": \"brief summary\"}\n\
Every file must be complete; no placeholders or elisions.";

/// Bounded summary of prior results for later groups. Successful tasks carry
/// their output; failed tasks get a one-line note so downstream tasks know
/// what is missing. Truncated to `limit` characters.
pub fn summarize_results(results: &[TaskResult], limit: usize) -> String {
    let mut summary = String::new();
    for result in results {
        let remaining = limit.saturating_sub(summary.chars().count());
        if remaining == 0 {
            break;
        }
        let section = if result.success {
            let body: String = result.output.chars().take(600).collect();
            format!(
                "### {} ({})\n{body}\n\n",
                result.task_id,
                result.agent_kind.as_str()
            )
        } else {
            let reason: String = result.output.chars().take(120).collect();
            format!(
                "### {} ({}) failed: {reason}\n\n",
                result.task_id,
                result.agent_kind.as_str()
            )
        };
        summary.extend(section.chars().take(remaining));
    }
    summary
}

/// Execute every group of the plan in order. Returns one result per executed
/// task, in group order and declaration order within each group.
pub async fn execute_plan(
    gateway: Arc<dyn ChatGateway>,
    limiter: &RateLimiter,
    quota: &dyn QuotaGate,
    plan: &TaskPlan,
    config: &ExecutorConfig,
    user_id: Option<Uuid>,
    progress: Option<&ProgressFn>,
) -> Vec<TaskResult> {
    let total: usize = plan.parallel_groups.iter().map(Vec::len).sum();
    let mut results: Vec<TaskResult> = Vec::with_capacity(total);
    let route = ChatModel::openrouter(&config.model).route().to_string();

    for (group_index, group) in plan.parallel_groups.iter().enumerate() {
        let context = summarize_results(&results, config.context_limit_chars);
        eprintln!(
            "[executor] group {}/{}: {} task(s)",
            group_index + 1,
            plan.parallel_groups.len(),
            group.len()
        );

        let futures = group.iter().enumerate().map(|(index, task_id)| {
            let gateway = gateway.clone();
            let context = context.clone();
            let route = route.clone();
            async move {
                let result = match plan.tasks.iter().find(|t| t.id == *task_id) {
                    Some(task) => {
                        run_task(gateway, limiter, quota, task, &context, config, user_id, &route)
                            .await
                    }
                    // Validation makes this unreachable; fail the id anyway.
                    None => TaskResult {
                        task_id: task_id.clone(),
                        agent_kind: AgentKind::General,
                        success: false,
                        output: format!("task {task_id} missing from plan"),
                        artifacts: ArtifactSet::new(),
                        duration_ms: 0,
                        cost_nanodollars: 0,
                        verified: false,
                    },
                };
                (index, result)
            }
        });

        let mut group_results: Vec<(usize, TaskResult)> = stream::iter(futures)
            .buffer_unordered(config.max_parallel_tasks.max(1))
            .collect()
            .await;
        group_results.sort_by_key(|(index, _)| *index);
        results.extend(group_results.into_iter().map(|(_, r)| r));

        if let Some(progress) = progress {
            let done = results.len();
            let percent = 15 + ((60 * done) / total.max(1)) as u8;
            progress(
                percent.min(75),
                &format!("executed {done}/{total} tasks"),
            );
        }
    }

    results
}

#[allow(clippy::too_many_arguments)]
async fn run_task(
    gateway: Arc<dyn ChatGateway>,
    limiter: &RateLimiter,
    quota: &dyn QuotaGate,
    task: &Task,
    context: &str,
    config: &ExecutorConfig,
    user_id: Option<Uuid>,
    route: &str,
) -> TaskResult {
    let started = Instant::now();

    if let QuotaDecision::Exceeded { reason } =
        quota.check_quota(user_id, WorkKind::TaskExecution).await
    {
        return TaskResult::failed(task, format!("quota exceeded: {reason}"), started);
    }
    if let QuotaDecision::Exceeded { reason } = quota
        .check_cost_budget(user_id, WorkKind::TaskExecution)
        .await
    {
        return TaskResult::failed(task, format!("cost budget exceeded: {reason}"), started);
    }

    if let Err(e) = limiter.wait_for_slot(route, config.admission_timeout).await {
        return TaskResult::failed(task, e.to_string(), started);
    }

    let mut user_prompt = format!("## Task\n\n{}\n\n{ARTIFACT_INSTRUCTIONS}", task.description);
    if !context.is_empty() {
        user_prompt.push_str(&format!(
            "\n\n## Decisions from earlier tasks\n\n{context}"
        ));
    }

    let mut attribution = Attribution::new("executor");
    if let Some(uid) = user_id {
        attribution = attribution.with_user(uid);
    }
    let req = ChatRequest::new(
        ChatModel::openrouter(&config.model),
        vec![
            Message::system(agent_system_prompt(task.agent_kind)),
            Message::user(user_prompt),
        ],
        attribution,
    )
    .complexity(Complexity::Medium);

    let outcome = tokio::time::timeout(config.task_timeout, gateway.chat(req)).await;
    limiter.release_slot(route).await;

    match outcome {
        Ok(Ok(resp)) => {
            let artifacts = parse_artifacts(&resp.content);
            TaskResult {
                task_id: task.id.clone(),
                agent_kind: task.agent_kind,
                success: true,
                output: resp.content,
                artifacts,
                duration_ms: started.elapsed().as_millis() as u64,
                cost_nanodollars: resp.cost_nanodollars,
                verified: false,
            }
        }
        Ok(Err(e)) => {
            tracing::warn!(task_id = %task.id, error = %e, "task failed");
            TaskResult::failed(task, format!("provider error: {e}"), started)
        }
        Err(_) => {
            tracing::warn!(task_id = %task.id, "task timed out");
            TaskResult::failed(
                task,
                format!("timed out after {:?}", config.task_timeout),
                started,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str, success: bool, output: &str) -> TaskResult {
        TaskResult {
            task_id: id.to_string(),
            agent_kind: AgentKind::General,
            success,
            output: output.to_string(),
            artifacts: ArtifactSet::new(),
            duration_ms: 10,
            cost_nanodollars: 0,
            verified: false,
        }
    }

    #[test]
    fn summary_notes_failed_tasks() {
        let results = vec![
            result("a", true, "chose a blue palette"),
            result("b", false, "timed out after 120s"),
        ];
        let summary = summarize_results(&results, 4000);
        assert!(summary.contains("blue palette"));
        assert!(summary.contains("### b (general) failed: timed out after 120s"));
    }

    #[test]
    fn summary_respects_char_limit() {
        let long = "x".repeat(5000);
        let results = vec![result("a", true, &long), result("b", true, &long)];
        let summary = summarize_results(&results, 500);
        assert!(summary.chars().count() <= 500);
    }

    #[test]
    fn summary_of_only_failures_is_notes_only() {
        let results = vec![result("a", false, "boom")];
        let summary = summarize_results(&results, 4000);
        assert_eq!(summary, "### a (general) failed: boom\n\n");
    }

    #[test]
    fn summary_truncates_long_failure_reasons() {
        let long_reason = "y".repeat(500);
        let results = vec![result("a", false, &long_reason)];
        let summary = summarize_results(&results, 4000);
        assert!(summary.contains(&"y".repeat(120)));
        assert!(!summary.contains(&"y".repeat(121)));
    }
}
