//! End-to-end run pipeline: cache check, decompose, execute, verify, merge,
//! cache write-back.
//!
//! Failure policy: only a decomposition failure or a run where every task
//! failed is fatal. Everything downstream degrades, partial results always
//! beat no results.

use std::sync::Arc;

use uuid::Uuid;

use crate::artifacts::ArtifactSet;
use crate::cache::{CacheEntry, TieredCache};
use crate::decompose::{decompose_request, DecomposeError};
use crate::executor::{execute_plan, ExecutorConfig, TaskResult};
use crate::gateway::ChatGateway;
use crate::merge::{merge_results, Conflict, MergeConfig};
use crate::quota::{QuotaDecision, QuotaGate, WorkKind};
use crate::ratelimit::{AdmittedGateway, RateLimiter};
use crate::trace::{ProgressFn, TraceContext, TraceStep};
use crate::verify::{verify_artifacts, Validator, VerifyConfig};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub decompose_model: String,
    pub executor: ExecutorConfig,
    pub verify: VerifyConfig,
    pub merge: MergeConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            decompose_model: "openai/gpt-4o".to_string(),
            executor: ExecutorConfig::default(),
            verify: VerifyConfig::default(),
            merge: MergeConfig::default(),
        }
    }
}

/// Final result of one run.
#[derive(Debug)]
pub struct RunOutcome {
    pub success: bool,
    pub summary: String,
    pub artifacts: ArtifactSet,
    pub conflicts: Vec<Conflict>,
    pub task_results: Vec<TaskResult>,
    pub verified: bool,
    pub cost_nanodollars: i64,
    pub from_cache: bool,
    pub trace: Vec<TraceStep>,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("decomposition failed: {0}")]
    Decomposition(#[from] DecomposeError),
    #[error("all {0} tasks failed")]
    AllTasksFailed(usize),
    #[error("quota exceeded: {0}")]
    Quota(String),
}

pub struct Orchestrator {
    gateway: Arc<dyn ChatGateway>,
    /// Gated view of `gateway` for the one-shot pipeline calls. The executor
    /// keeps the raw gateway plus its own wait/release so a task deadline can
    /// free the slot.
    admitted: AdmittedGateway,
    limiter: Arc<RateLimiter>,
    cache: Arc<TieredCache>,
    quota: Arc<dyn QuotaGate>,
    validator: Arc<dyn Validator>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        limiter: Arc<RateLimiter>,
        cache: Arc<TieredCache>,
        quota: Arc<dyn QuotaGate>,
        validator: Arc<dyn Validator>,
        config: OrchestratorConfig,
    ) -> Self {
        let admitted = AdmittedGateway::new(
            gateway.clone(),
            limiter.clone(),
            config.executor.admission_timeout,
        );
        Self {
            gateway,
            admitted,
            limiter,
            cache,
            quota,
            validator,
            config,
        }
    }

    pub async fn run(
        &self,
        request: &str,
        user_id: Option<Uuid>,
        progress: Option<&ProgressFn>,
    ) -> Result<RunOutcome, OrchestratorError> {
        let trace = TraceContext::new();
        let report = |percent: u8, message: &str| {
            if let Some(progress) = progress {
                progress(percent, message);
            }
        };

        if let QuotaDecision::Exceeded { reason } = self
            .quota
            .check_quota(user_id, WorkKind::Decomposition)
            .await
        {
            return Err(OrchestratorError::Quota(reason));
        }
        if let QuotaDecision::Exceeded { reason } = self
            .quota
            .check_cost_budget(user_id, WorkKind::Decomposition)
            .await
        {
            return Err(OrchestratorError::Quota(reason));
        }

        report(5, "checking cache");
        if let Some(hit) = self.cache.find(request).await {
            trace.record(
                "cache",
                format!("hit in {:?} tier (score {:.2})", hit.tier, hit.score),
                0,
            );
            report(100, "served from cache");
            return Ok(RunOutcome {
                success: true,
                summary: hit.entry.summary,
                artifacts: hit.entry.artifacts,
                conflicts: Vec::new(),
                task_results: Vec::new(),
                verified: true,
                cost_nanodollars: 0,
                from_cache: true,
                trace: trace.steps(),
            });
        }

        let (plan, decompose_cost) =
            decompose_request(&self.admitted, &self.config.decompose_model, request)
                .await?;
        trace.record(
            "decompose",
            format!(
                "{} tasks in {} groups",
                plan.tasks.len(),
                plan.parallel_groups.len()
            ),
            decompose_cost,
        );
        report(15, &format!("planned {} tasks", plan.tasks.len()));

        let results = execute_plan(
            self.gateway.clone(),
            &self.limiter,
            self.quota.as_ref(),
            &plan,
            &self.config.executor,
            user_id,
            progress,
        )
        .await;
        let succeeded = results.iter().filter(|r| r.success).count();
        let execute_cost: i64 = results.iter().map(|r| r.cost_nanodollars).sum();
        trace.record(
            "execute",
            format!("{succeeded}/{} tasks succeeded", results.len()),
            execute_cost,
        );
        if succeeded == 0 {
            return Err(OrchestratorError::AllTasksFailed(results.len()));
        }

        // Corrections produce new results tagged verified; originals are
        // never mutated.
        let mut verified_results = Vec::with_capacity(results.len());
        let mut verify_cost = 0i64;
        let mut all_verified = true;
        for result in results {
            if !result.success || result.artifacts.is_empty() {
                verified_results.push(result);
                continue;
            }
            let outcome = verify_artifacts(
                &self.admitted,
                self.validator.as_ref(),
                result.artifacts.clone(),
                &self.config.verify,
            )
            .await;
            verify_cost += outcome.cost_nanodollars;
            all_verified &= outcome.verified;
            verified_results.push(TaskResult {
                artifacts: outcome.artifacts,
                verified: outcome.verified,
                ..result
            });
        }
        trace.record("verify", format!("all_verified={all_verified}"), verify_cost);
        report(85, "verification complete");

        let merge = merge_results(&self.admitted, &verified_results, &self.config.merge).await;
        trace.record(
            "merge",
            format!(
                "{} artifacts, {} conflicts",
                merge.artifacts.len(),
                merge.conflicts.len()
            ),
            merge.cost_nanodollars,
        );
        report(95, "merge complete");

        let summary = if plan.summary.is_empty() {
            request.chars().take(200).collect()
        } else {
            plan.summary.clone()
        };

        self.cache
            .store(CacheEntry::new(request, summary.clone(), merge.artifacts.clone()));

        report(100, "complete");
        Ok(RunOutcome {
            success: true,
            summary,
            artifacts: merge.artifacts,
            conflicts: merge.conflicts,
            task_results: verified_results,
            verified: all_verified,
            cost_nanodollars: trace.total_cost_nanodollars(),
            from_cache: false,
            trace: trace.steps(),
        })
    }
}
