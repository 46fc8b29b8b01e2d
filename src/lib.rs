#![forbid(unsafe_code)]

//! # taskweave
//!
//! Orchestration engine for multi-agent LLM builds. A free-form request is
//! decomposed into a dependency-ordered plan of specialist tasks, executed
//! group by group with bounded concurrency, rate limiting, and per-task
//! timeouts, then verified and merged into one artifact set. Partial failure
//! is tolerated everywhere it can be: only an unusable plan or a run with
//! zero successful tasks is fatal.
//!
//! Completed runs feed a three-tier cache (durable SQLite, per-process LRU,
//! embedding similarity) so repeated or near-repeated requests skip the
//! pipeline entirely.

pub mod artifacts;
pub mod cache;
pub mod decompose;
pub mod executor;
pub mod gateway;
pub mod merge;
pub mod orchestrator;
pub mod quota;
pub mod ratelimit;
pub mod similarity;
pub mod trace;
pub mod verify;

pub use artifacts::{parse_artifacts, ArtifactSet};
pub use cache::{
    CacheEntry, CacheHit, CacheTier, DurableResultStore, SqliteResultStore, TieredCache,
    TieredCacheConfig,
};
pub use decompose::{decompose_request, AgentKind, DecomposeError, Task, TaskPlan};
pub use executor::{execute_plan, ExecutorConfig, TaskResult};
pub use gateway::{Attribution, ChatGateway, NoopUsageSink, ProviderGateway, UsageSink};
pub use merge::{merge_results, Conflict, MergeConfig, MergeOutcome};
pub use orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorError, RunOutcome};
pub use quota::{NoopQuotaGate, QuotaDecision, QuotaGate, WorkKind};
pub use ratelimit::{
    AdmittedGateway, Admission, CoordinationStore, MemoryCoordinationStore, RateLimitConfig,
    RateLimiter, SqliteCoordinationStore,
};
pub use verify::{verify_artifacts, SyntaxValidator, Validator, VerifyConfig};
