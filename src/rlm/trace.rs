//! Execution trace, usage ledger and results

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::provider::Usage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    ModelCall,
    CodeExecution,
    SubModelCall,
    FinalOutput,
    Error,
}

/// One step of an execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub kind: TraceKind,
    pub depth: usize,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl TraceEntry {
    pub fn new(kind: TraceKind, depth: usize, payload: serde_json::Value) -> Self {
        Self {
            kind,
            depth,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Count entries of a kind
pub fn count_kind(trace: &[TraceEntry], kind: TraceKind) -> usize {
    trace.iter().filter(|e| e.kind == kind).count()
}

/// Accumulated token usage and cost
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
    pub total_calls: usize,
    pub estimated_cost: f64,
}

impl UsageSummary {
    /// Record one model call
    pub fn record(&mut self, usage: &Usage, cost: f64) {
        self.prompt_tokens += usage.prompt_tokens;
        self.completion_tokens += usage.completion_tokens;
        self.total_tokens += usage.total_tokens;
        self.total_calls += 1;
        self.estimated_cost += cost;
    }

    /// Fold in the usage of a child invocation
    pub fn absorb(&mut self, other: &UsageSummary) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        self.total_calls += other.total_calls;
        self.estimated_cost += other.estimated_cost;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    /// Stopped early; the response is the best answer obtained so far
    Partial { reason: String },
}

/// Result of one executor invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub run_id: Uuid,
    pub response: String,
    pub status: ExecutionStatus,
    pub trace: Vec<TraceEntry>,
    pub usage: UsageSummary,
    pub iterations: usize,
    pub elapsed_ms: u64,
}

impl ExecutionResult {
    pub fn is_complete(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

/// Spend tracker shared by a root invocation and all of its sub-queries
#[derive(Debug, Default)]
pub struct CostMeter {
    ceiling: Option<f64>,
    spent: Mutex<f64>,
}

impl CostMeter {
    pub fn new(ceiling: Option<f64>) -> Self {
        Self {
            ceiling,
            spent: Mutex::new(0.0),
        }
    }

    pub fn ceiling(&self) -> Option<f64> {
        self.ceiling
    }

    pub fn add(&self, cost: f64) {
        *self.spent.lock() += cost;
    }

    pub fn spent(&self) -> f64 {
        *self.spent.lock()
    }

    /// Whether spending `next` more would cross the ceiling
    pub fn would_exceed(&self, next: f64) -> bool {
        match self.ceiling {
            Some(ceiling) => self.spent() + next > ceiling,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_summary_accumulates() {
        let mut summary = UsageSummary::default();
        summary.record(&Usage::new(10, 5), 0.5);
        let mut child = UsageSummary::default();
        child.record(&Usage::new(1, 1), 0.25);
        summary.absorb(&child);

        assert_eq!(summary.total_tokens, 17);
        assert_eq!(summary.total_calls, 2);
        assert!((summary.estimated_cost - 0.75).abs() < 1e-9);
    }

    #[test]
    fn cost_meter_without_ceiling_never_trips() {
        let meter = CostMeter::new(None);
        meter.add(1_000.0);
        assert!(!meter.would_exceed(1_000.0));
    }

    #[test]
    fn cost_meter_trips_on_projection() {
        let meter = CostMeter::new(Some(1.0));
        meter.add(0.6);
        assert!(!meter.would_exceed(0.3));
        assert!(meter.would_exceed(0.5));
    }

    #[test]
    fn execution_result_serializes_status_inline() {
        let result = ExecutionResult {
            run_id: Uuid::nil(),
            response: "4".to_string(),
            status: ExecutionStatus::Partial {
                reason: "cost ceiling".to_string(),
            },
            trace: vec![TraceEntry::new(
                TraceKind::ModelCall,
                0,
                serde_json::json!({"iteration": 1}),
            )],
            usage: UsageSummary::default(),
            iterations: 1,
            elapsed_ms: 3,
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"]["status"], "partial");
        assert_eq!(value["trace"][0]["kind"], "model_call");
    }
}
