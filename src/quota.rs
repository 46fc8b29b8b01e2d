//! Quota and cost-budget gate consulted before each unit of work.
//!
//! Accounting lives with the implementor; the orchestrator only asks yes/no.

use async_trait::async_trait;
use uuid::Uuid;

/// Kind of work being admitted, for per-kind quota policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    Decomposition,
    TaskExecution,
}

impl WorkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkKind::Decomposition => "decomposition",
            WorkKind::TaskExecution => "task_execution",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDecision {
    Allowed,
    Exceeded { reason: String },
}

#[async_trait]
pub trait QuotaGate: Send + Sync {
    async fn check_quota(&self, user_id: Option<Uuid>, kind: WorkKind) -> QuotaDecision;
    async fn check_cost_budget(&self, user_id: Option<Uuid>, kind: WorkKind) -> QuotaDecision;
}

/// Gate that admits everything. Default for single-user deployments.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopQuotaGate;

#[async_trait]
impl QuotaGate for NoopQuotaGate {
    async fn check_quota(&self, _user_id: Option<Uuid>, _kind: WorkKind) -> QuotaDecision {
        QuotaDecision::Allowed
    }

    async fn check_cost_budget(&self, _user_id: Option<Uuid>, _kind: WorkKind) -> QuotaDecision {
        QuotaDecision::Allowed
    }
}
