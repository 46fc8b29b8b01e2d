//! Union per-task artifact sets and resolve same-path conflicts.
//!
//! The union itself is last-write-wins in task order. When two tasks produce
//! different content for the same path, the conflict is recorded and one
//! specialist call is made over all conflicts at once. If that call fails or
//! returns nothing parseable, the last-write-wins union stands; a merge never
//! fails the run.

use std::collections::HashMap;

use serde::Serialize;

use crate::artifacts::{cleanup, is_denied, parse_artifacts, ArtifactSet};
use crate::executor::TaskResult;
use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, Complexity, Message};

#[derive(Debug, Clone)]
pub struct MergeConfig {
    pub model: String,
    /// Per-version preview length in the conflict resolution prompt.
    pub preview_chars: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            model: "openai/gpt-4o-mini".to_string(),
            preview_chars: 400,
        }
    }
}

/// One contested path and the tasks that wrote differing content to it.
#[derive(Debug, Clone, Serialize)]
pub struct Conflict {
    pub path: String,
    pub task_ids: Vec<String>,
}

#[derive(Debug)]
pub struct MergeOutcome {
    pub artifacts: ArtifactSet,
    /// Every conflict detected during the union, resolved or not.
    pub conflicts: Vec<Conflict>,
    pub cost_nanodollars: i64,
}

const MERGE_SYSTEM_PROMPT: &str = "\
You are merging output from parallel agents. Several agents wrote different \
content to the same file paths. For each contested path, produce one combined \
version that preserves the intent of every contribution.\n\
Respond with JSON only: {\"artifacts\": {\"contested/path\": \"merged content\", ...}}. \
Include only the contested paths.";

pub async fn merge_results(
    gateway: &dyn ChatGateway,
    results: &[TaskResult],
    config: &MergeConfig,
) -> MergeOutcome {
    let mut union = ArtifactSet::new();
    let mut contributions: HashMap<String, Vec<(String, String)>> = HashMap::new();

    for result in results {
        for (path, content) in &result.artifacts {
            if is_denied(path) {
                continue;
            }
            contributions
                .entry(path.clone())
                .or_default()
                .push((result.task_id.clone(), content.clone()));
            union.insert(path.clone(), content.clone());
        }
    }

    let mut conflicts: Vec<Conflict> = contributions
        .iter()
        .filter(|(_, versions)| {
            versions
                .iter()
                .any(|(_, content)| content != &versions[0].1)
        })
        .map(|(path, versions)| Conflict {
            path: path.clone(),
            task_ids: versions.iter().map(|(id, _)| id.clone()).collect(),
        })
        .collect();
    conflicts.sort_by(|a, b| a.path.cmp(&b.path));

    let mut cost = 0i64;
    if !conflicts.is_empty() {
        eprintln!("[merge] {} conflicting path(s)", conflicts.len());
        match resolve_conflicts(gateway, &conflicts, &contributions, config).await {
            Ok((resolved, call_cost)) => {
                cost += call_cost;
                for (path, content) in resolved {
                    if union.contains_key(&path) {
                        union.insert(path, content);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "conflict resolution failed, keeping last write");
            }
        }
    }

    MergeOutcome {
        artifacts: cleanup(union),
        conflicts,
        cost_nanodollars: cost,
    }
}

async fn resolve_conflicts(
    gateway: &dyn ChatGateway,
    conflicts: &[Conflict],
    contributions: &HashMap<String, Vec<(String, String)>>,
    config: &MergeConfig,
) -> Result<(ArtifactSet, i64), crate::gateway::ProviderError> {
    let mut prompt = String::from("## Conflicts\n\n");
    for conflict in conflicts {
        prompt.push_str(&format!("### {}\n\n", conflict.path));
        if let Some(versions) = contributions.get(&conflict.path) {
            for (task_id, content) in versions {
                let preview: String = content.chars().take(config.preview_chars).collect();
                prompt.push_str(&format!("From task `{task_id}`:\n```\n{preview}\n```\n\n"));
            }
        }
    }

    let req = ChatRequest::new(
        ChatModel::openrouter(&config.model),
        vec![Message::system(MERGE_SYSTEM_PROMPT), Message::user(prompt)],
        Attribution::new("merge"),
    )
    .complexity(Complexity::Medium)
    .json();

    let resp = gateway.chat(req).await?;
    Ok((parse_artifacts(&resp.content), resp.cost_nanodollars))
}
