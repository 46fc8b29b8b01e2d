use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use taskweave::cache::{SqliteResultStore, TieredCache, TieredCacheConfig};
use taskweave::executor::ExecutorConfig;
use taskweave::gateway::openrouter::OpenRouterAdapter;
use taskweave::gateway::{ChatGateway, GatewayConfig, NoopUsageSink, ProviderGateway};
use taskweave::merge::MergeConfig;
use taskweave::orchestrator::{Orchestrator, OrchestratorConfig};
use taskweave::quota::NoopQuotaGate;
use taskweave::ratelimit::{MemoryCoordinationStore, RateLimitConfig, RateLimiter};
use taskweave::verify::{SyntaxValidator, VerifyConfig};

/// Scripted provider: routes on the prompts the pipeline sends.
#[derive(Clone, Copy)]
struct TodoAppBuilder {
    /// Delay injected into the task whose description carries "slow-marker".
    slow_task_delay_ms: u64,
}

fn request_text(request: &Request) -> String {
    let parsed: serde_json::Value = serde_json::from_slice(&request.body).unwrap_or_default();
    parsed
        .get("messages")
        .and_then(|m| m.as_array())
        .map(|messages| {
            messages
                .iter()
                .filter_map(|m| m.get("content").and_then(|c| c.as_str()))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

fn chat_response(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{
            "message": { "content": content },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 20, "completion_tokens": 40, "cost": 0.0001 }
    }))
}

impl Respond for TodoAppBuilder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let text = request_text(request);

        if text.contains("You are a project planner") {
            let plan = json!({
                "project_name": "todo-app",
                "summary": "Build a minimal todo application",
                "tasks": [
                    {
                        "id": "design",
                        "agent_kind": "designer",
                        "description": "Decide the layout and palette",
                        "dependencies": [],
                        "priority": 1
                    },
                    {
                        "id": "frontend-1",
                        "agent_kind": "frontend",
                        "description": "Build the todo list markup",
                        "dependencies": ["design"],
                        "priority": 2
                    },
                    {
                        "id": "frontend-2",
                        "agent_kind": "frontend",
                        "description": "Write the stylesheet slow-marker",
                        "dependencies": ["design"],
                        "priority": 2
                    }
                ],
                "parallel_groups": [["design"], ["frontend-1", "frontend-2"]]
            });
            return chat_response(&plan.to_string());
        }

        if text.contains("You are a code reviewer")
            || text.contains("You are a code fixer")
            || text.contains("You are merging output")
        {
            // Clean as-is: an empty reply keeps the current artifact set.
            return chat_response("{}");
        }

        if text.contains("Decide the layout") {
            return chat_response(
                &json!({"artifacts": {"design.md": "# Design\n\nBlue palette, single column."}})
                    .to_string(),
            );
        }
        if text.contains("todo list markup") {
            return chat_response(
                &json!({"artifacts": {"index.html": "<html><body><ul id=\"todos\"></ul></body></html>"}})
                    .to_string(),
            );
        }
        if text.contains("slow-marker") {
            return chat_response(
                &json!({"artifacts": {"style.css": "body { margin: 0; }"}}).to_string(),
            )
            .set_delay(Duration::from_millis(self.slow_task_delay_ms));
        }

        chat_response(&json!({"artifacts": {"misc.txt": "unexpected prompt"}}).to_string())
    }
}

fn gateway_for(server: &MockServer) -> Arc<dyn ChatGateway> {
    let adapter = OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(10))
        .expect("adapter");
    Arc::new(ProviderGateway::with_config(
        adapter,
        Arc::new(NoopUsageSink),
        GatewayConfig {
            max_retries: 0,
            retry_base_delay: Duration::from_millis(0),
        },
    ))
}

fn orchestrator_for(
    gateway: Arc<dyn ChatGateway>,
    cache_dir: &std::path::Path,
    task_timeout: Duration,
) -> Orchestrator {
    let limiter = Arc::new(RateLimiter::new(
        Arc::new(MemoryCoordinationStore::new()),
        RateLimitConfig::default(),
    ));
    let durable = Arc::new(SqliteResultStore::new(cache_dir.join("cache.sqlite")).expect("store"));
    let cache = Arc::new(TieredCache::new(durable, None, TieredCacheConfig::default()));

    let config = OrchestratorConfig {
        decompose_model: "openai/gpt-4o".to_string(),
        executor: ExecutorConfig {
            task_timeout,
            admission_timeout: Duration::from_secs(2),
            ..ExecutorConfig::default()
        },
        verify: VerifyConfig::default(),
        merge: MergeConfig::default(),
    };
    Orchestrator::new(
        gateway,
        limiter,
        cache,
        Arc::new(NoopQuotaGate),
        Arc::new(SyntaxValidator),
        config,
    )
}

#[tokio::test]
async fn full_run_produces_merged_verified_artifacts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(TodoAppBuilder {
            slow_task_delay_ms: 0,
        })
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let orchestrator =
        orchestrator_for(gateway_for(&server), dir.path(), Duration::from_secs(30));

    let outcome = orchestrator
        .run("Build me a todo app", None, None)
        .await
        .unwrap();

    assert!(outcome.success);
    assert!(!outcome.from_cache);
    assert!(outcome.verified);
    assert_eq!(outcome.task_results.len(), 3);
    assert!(outcome.task_results.iter().all(|r| r.success));
    assert!(outcome.conflicts.is_empty());
    assert_eq!(outcome.artifacts.len(), 3);
    assert!(outcome.artifacts.contains_key("index.html"));
    assert!(outcome.artifacts.contains_key("style.css"));
    assert!(outcome
        .artifacts
        .values()
        .all(|content| !content.trim().is_empty()));
    assert!(outcome.cost_nanodollars > 0);
    assert_eq!(outcome.summary, "Build a minimal todo application");
}

#[tokio::test]
async fn repeated_request_is_served_from_cache_without_provider_calls() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(TodoAppBuilder {
            slow_task_delay_ms: 0,
        })
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let orchestrator =
        orchestrator_for(gateway_for(&server), dir.path(), Duration::from_secs(30));

    let first = orchestrator
        .run("Build me a todo app", None, None)
        .await
        .unwrap();
    assert!(!first.from_cache);

    let calls_after_first = server.received_requests().await.unwrap_or_default().len();

    let second = orchestrator
        .run("Build me a todo app", None, None)
        .await
        .unwrap();
    assert!(second.from_cache);
    assert!(second.task_results.is_empty());
    assert_eq!(second.artifacts, first.artifacts);
    assert_eq!(second.cost_nanodollars, 0);

    let calls_after_second = server.received_requests().await.unwrap_or_default().len();
    assert_eq!(calls_after_first, calls_after_second);
}

#[tokio::test]
async fn timed_out_task_fails_alone_and_the_run_still_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(TodoAppBuilder {
            slow_task_delay_ms: 3_000,
        })
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let orchestrator =
        orchestrator_for(gateway_for(&server), dir.path(), Duration::from_millis(800));

    let outcome = orchestrator
        .run("Build me a todo app", None, None)
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.task_results.len(), 3);

    let failed: Vec<_> = outcome
        .task_results
        .iter()
        .filter(|r| !r.success)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].task_id, "frontend-2");
    assert!(failed[0].output.contains("timed out"));

    assert!(outcome.artifacts.contains_key("design.md"));
    assert!(outcome.artifacts.contains_key("index.html"));
    assert!(!outcome.artifacts.contains_key("style.css"));
}

#[tokio::test]
async fn progress_reaches_completion_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(TodoAppBuilder {
            slow_task_delay_ms: 0,
        })
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let orchestrator =
        orchestrator_for(gateway_for(&server), dir.path(), Duration::from_secs(30));

    let seen = Arc::new(std::sync::Mutex::new(Vec::<u8>::new()));
    let seen_in_callback = seen.clone();
    let progress = move |percent: u8, _message: &str| {
        seen_in_callback.lock().unwrap().push(percent);
    };

    orchestrator
        .run("Build me a todo app", None, Some(&progress))
        .await
        .unwrap();

    let percents = seen.lock().unwrap().clone();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(percents.first(), Some(&5));
    assert_eq!(percents.last(), Some(&100));
    assert!(percents.contains(&85));
    assert!(percents.contains(&95));
}
