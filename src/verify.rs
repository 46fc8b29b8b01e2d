//! Artifact verification: one review pass, then a bounded validate-and-fix
//! loop.
//!
//! The loop never discards the most recent artifact set. When attempts run
//! out or the fix model misbehaves, the latest set comes back with
//! `verified=false`; returning something always beats returning nothing.

use crate::artifacts::{cleanup, parse_artifacts, ArtifactSet};
use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, Complexity, Message};

#[derive(Debug, Clone)]
pub struct VerifyConfig {
    pub model: String,
    pub max_fix_attempts: u32,
    /// Patterns the review pass must remove, e.g. hardcoded credentials or
    /// runtime-incompatible APIs.
    pub disallowed_patterns: Vec<String>,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            model: "openai/gpt-4o-mini".to_string(),
            max_fix_attempts: 5,
            disallowed_patterns: vec![
                "eval(".to_string(),
                "document.write(".to_string(),
                "TODO: implement".to_string(),
            ],
        }
    }
}

#[derive(Debug)]
pub struct VerifyOutcome {
    pub artifacts: ArtifactSet,
    pub verified: bool,
    pub cost_nanodollars: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

/// Health check over an artifact set. Only some artifact kinds need
/// runnable-code-level checks; `validate` ignores the rest.
pub trait Validator: Send + Sync {
    fn validate(&self, artifacts: &ArtifactSet) -> Vec<ValidationIssue>;
}

/// Heuristic syntax checks: balanced delimiters for code-like files, a real
/// parse for JSON. Prose and markup pass untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyntaxValidator;

const CODE_EXTENSIONS: &[&str] = &[
    "js", "jsx", "ts", "tsx", "rs", "py", "go", "java", "c", "cpp", "css",
];

impl Validator for SyntaxValidator {
    fn validate(&self, artifacts: &ArtifactSet) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        for (path, content) in artifacts {
            let extension = path.rsplit('.').next().unwrap_or("");
            if extension == "json" {
                if let Err(e) = serde_json::from_str::<serde_json::Value>(content) {
                    issues.push(ValidationIssue {
                        path: path.clone(),
                        message: format!("invalid JSON: {e}"),
                    });
                }
                continue;
            }
            if CODE_EXTENSIONS.contains(&extension) {
                if let Some(message) = check_balanced(content) {
                    issues.push(ValidationIssue {
                        path: path.clone(),
                        message,
                    });
                }
            }
        }
        issues
    }
}

/// Delimiter balance check, skipping string literals.
fn check_balanced(content: &str) -> Option<String> {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string: Option<char> = None;
    let mut escape = false;

    for c in content.chars() {
        if escape {
            escape = false;
            continue;
        }
        if let Some(quote) = in_string {
            match c {
                '\\' => escape = true,
                _ if c == quote => in_string = None,
                _ => {}
            }
            continue;
        }
        match c {
            '"' | '\'' | '`' => in_string = Some(c),
            '(' | '[' | '{' => stack.push(c),
            ')' | ']' | '}' => {
                let open = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                if stack.pop() != Some(open) {
                    return Some(format!("unbalanced delimiter '{c}'"));
                }
            }
            _ => {}
        }
    }
    if let Some(open) = stack.last() {
        return Some(format!("unclosed delimiter '{open}'"));
    }
    None
}

fn artifacts_json(artifacts: &ArtifactSet) -> String {
    serde_json::to_string_pretty(artifacts).unwrap_or_else(|_| "{}".to_string())
}

const REVIEW_SYSTEM_PROMPT: &str = "\
You are a code reviewer. You receive a set of generated files and a list of \
disallowed patterns. Remove every occurrence of a disallowed pattern and fix \
obvious defects, changing as little as possible. If the files are already \
clean, return them unchanged.\n\
Respond with JSON only: {\"artifacts\": {\"path\": \"full content\", ...}}";

const FIX_SYSTEM_PROMPT: &str = "\
You are a code fixer. You receive files and the validation errors found in \
them. Fix the errors, changing as little as possible. Return every file, \
including the ones you did not change.\n\
Respond with JSON only: {\"artifacts\": {\"path\": \"full content\", ...}}";

/// Run the review pass, then validate-and-fix up to the configured bound.
pub async fn verify_artifacts(
    gateway: &dyn ChatGateway,
    validator: &dyn Validator,
    artifacts: ArtifactSet,
    config: &VerifyConfig,
) -> VerifyOutcome {
    let mut cost = 0i64;
    let mut current = artifacts;

    // Step A: review pass. Adopt the reply only when it parses to a
    // non-empty set. A provider failure here aborts the whole loop: the
    // disallowed-pattern screen never ran, so the set cannot be reported
    // as verified.
    let review_prompt = format!(
        "## Disallowed patterns\n\n{}\n\n## Files\n\n{}",
        config.disallowed_patterns.join("\n"),
        artifacts_json(&current)
    );
    match chat(gateway, &config.model, REVIEW_SYSTEM_PROMPT, review_prompt, "verify_review").await {
        Ok(resp) => {
            cost += resp.cost_nanodollars;
            let reviewed = cleanup(parse_artifacts(&resp.content));
            if !reviewed.is_empty() {
                current = reviewed;
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "review pass failed, returning artifacts unverified");
            return VerifyOutcome {
                artifacts: current,
                verified: false,
                cost_nanodollars: cost,
            };
        }
    }

    // Step B: bounded validate-and-fix loop.
    for attempt in 0..config.max_fix_attempts {
        let issues = validator.validate(&current);
        if issues.is_empty() {
            return VerifyOutcome {
                artifacts: current,
                verified: true,
                cost_nanodollars: cost,
            };
        }

        eprintln!(
            "[verify] attempt {}/{}: {} issue(s)",
            attempt + 1,
            config.max_fix_attempts,
            issues.len()
        );

        let issue_list: String = issues
            .iter()
            .map(|i| format!("- {}: {}", i.path, i.message))
            .collect::<Vec<_>>()
            .join("\n");
        let fix_prompt = format!(
            "## Validation errors\n\n{issue_list}\n\n## Files\n\n{}",
            artifacts_json(&current)
        );

        match chat(gateway, &config.model, FIX_SYSTEM_PROMPT, fix_prompt, "verify_fix").await {
            Ok(resp) => {
                cost += resp.cost_nanodollars;
                let fixed = cleanup(parse_artifacts(&resp.content));
                if !fixed.is_empty() {
                    current = fixed;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "fix pass failed, returning best effort");
                return VerifyOutcome {
                    artifacts: current,
                    verified: false,
                    cost_nanodollars: cost,
                };
            }
        }
    }

    let verified = validator.validate(&current).is_empty();
    VerifyOutcome {
        artifacts: current,
        verified,
        cost_nanodollars: cost,
    }
}

async fn chat(
    gateway: &dyn ChatGateway,
    model: &str,
    system: &str,
    user: String,
    caller: &'static str,
) -> Result<crate::gateway::ChatResponse, crate::gateway::ProviderError> {
    let req = ChatRequest::new(
        ChatModel::openrouter(model),
        vec![Message::system(system), Message::user(user)],
        Attribution::new(caller),
    )
    .complexity(Complexity::Medium)
    .json();
    gateway.chat(req).await
}
