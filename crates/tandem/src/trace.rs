use std::ops::{Add, AddAssign};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::ToolCall;

/// Token counts and USD amounts for one call or an aggregate.
/// Aggregation is pure addition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostInfo {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cached_tokens: u32,
    pub input_cost: f64,
    pub output_cost: f64,
    pub cached_cost: f64,
    pub total_cost: f64,
}

impl Add for CostInfo {
    type Output = CostInfo;

    fn add(self, rhs: CostInfo) -> CostInfo {
        CostInfo {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
            cached_tokens: self.cached_tokens + rhs.cached_tokens,
            input_cost: self.input_cost + rhs.input_cost,
            output_cost: self.output_cost + rhs.output_cost,
            cached_cost: self.cached_cost + rhs.cached_cost,
            total_cost: self.total_cost + rhs.total_cost,
        }
    }
}

impl AddAssign for CostInfo {
    fn add_assign(&mut self, rhs: CostInfo) {
        *self = *self + rhs;
    }
}

/// Record of one LLM invocation within a run.
///
/// `sequence` is 1-based, strictly increasing, and gap-free within a trace.
/// `message_index` points at the assistant message this call produced in the
/// result's message list; it is captured at recording time and never
/// repaired afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCall {
    pub sequence: u32,
    pub message_index: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<CostInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_request: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<serde_json::Value>,
}

/// A timestamped observation attached to a run's trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Type tag, e.g. `"tool.call"` or `"validation.failed"`.
    pub kind: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Ordered record of the observable events of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub llm_calls: Vec<LlmCall>,
    pub events: Vec<TraceEvent>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    /// Unset while the run is in flight.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

impl ExecutionTrace {
    pub fn new() -> Self {
        Self {
            llm_calls: Vec::new(),
            events: Vec::new(),
            started_at: OffsetDateTime::now_utc(),
            completed_at: None,
        }
    }

    /// Append an event with the current timestamp.
    pub fn record_event(
        &mut self,
        kind: impl Into<String>,
        data: serde_json::Value,
        message: Option<String>,
    ) {
        self.events.push(TraceEvent {
            kind: kind.into(),
            timestamp: OffsetDateTime::now_utc(),
            data,
            message,
        });
    }

    /// Append an LLM call record. The caller supplies everything except the
    /// sequence number, which is assigned here to keep the 1-based, gap-free
    /// ordering.
    pub(crate) fn push_llm_call(&mut self, mut call: LlmCall) {
        call.sequence = self.llm_calls.len() as u32 + 1;
        self.llm_calls.push(call);
    }

    /// Sum of the per-call costs.
    pub fn total_cost(&self) -> CostInfo {
        self.llm_calls
            .iter()
            .filter_map(|c| c.cost)
            .fold(CostInfo::default(), |acc, c| acc + c)
    }

    pub(crate) fn complete(&mut self) {
        self.completed_at = Some(OffsetDateTime::now_utc());
    }
}

impl Default for ExecutionTrace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(cost: Option<CostInfo>) -> LlmCall {
        LlmCall {
            sequence: 0,
            message_index: 0,
            started_at: OffsetDateTime::now_utc(),
            duration: Duration::from_millis(5),
            cost,
            tool_calls: Vec::new(),
            error: None,
            raw_request: None,
            raw_response: None,
        }
    }

    #[test]
    fn sequences_are_one_based_and_gap_free() {
        let mut trace = ExecutionTrace::new();
        for _ in 0..3 {
            trace.push_llm_call(call(None));
        }
        let sequences: Vec<u32> = trace.llm_calls.iter().map(|c| c.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[test]
    fn total_cost_is_additive() {
        let mut trace = ExecutionTrace::new();
        trace.push_llm_call(call(Some(CostInfo {
            input_tokens: 10,
            output_tokens: 5,
            total_cost: 0.01,
            ..Default::default()
        })));
        trace.push_llm_call(call(None));
        trace.push_llm_call(call(Some(CostInfo {
            input_tokens: 2,
            output_tokens: 1,
            total_cost: 0.002,
            ..Default::default()
        })));

        let total = trace.total_cost();
        assert_eq!(total.input_tokens, 12);
        assert_eq!(total.output_tokens, 6);
        assert!((total.total_cost - 0.012).abs() < 1e-12);
    }
}
