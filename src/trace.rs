//! Append-only run trace and progress reporting.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Progress callback: percent complete plus a short human-readable message.
pub type ProgressFn = dyn Fn(u8, &str) + Send + Sync;

/// One recorded step of a run.
#[derive(Debug, Clone, Serialize)]
pub struct TraceStep {
    pub stage: String,
    pub detail: String,
    pub cost_nanodollars: i64,
    pub at_epoch_ms: i64,
}

/// Append-only record of what a run did, in order. Steps are never edited
/// after being recorded.
#[derive(Debug, Default)]
pub struct TraceContext {
    steps: Mutex<Vec<TraceStep>>,
}

impl TraceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, stage: &str, detail: impl Into<String>, cost_nanodollars: i64) {
        let step = TraceStep {
            stage: stage.to_string(),
            detail: detail.into(),
            cost_nanodollars,
            at_epoch_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as i64,
        };
        if let Ok(mut steps) = self.steps.lock() {
            steps.push(step);
        }
    }

    pub fn steps(&self) -> Vec<TraceStep> {
        self.steps.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn total_cost_nanodollars(&self) -> i64 {
        self.steps
            .lock()
            .map(|s| s.iter().map(|step| step.cost_nanodollars).sum())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_in_order_and_sums_cost() {
        let trace = TraceContext::new();
        trace.record("decompose", "3 tasks", 1200);
        trace.record("execute", "group 1 of 2", 5000);

        let steps = trace.steps();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].stage, "decompose");
        assert_eq!(steps[1].stage, "execute");
        assert_eq!(trace.total_cost_nanodollars(), 6200);
    }
}
