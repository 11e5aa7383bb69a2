//! Compensation references registered by compensable steps.

use common::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Task queue compensation activities run on unless overridden.
pub const DEFAULT_COMPENSATION_QUEUE: &str = "default";

/// Where a compensation activity takes its input from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "source", content = "value")]
pub enum CompensationInput {
    /// The input the forward step was scheduled with.
    #[default]
    ForwardInput,

    /// The result the forward step completed with.
    ForwardResult,

    /// A fixed value chosen by the workflow author.
    Explicit(Value),
}

impl CompensationInput {
    /// Resolves the concrete compensation input once the forward step completed.
    pub fn resolve(&self, forward_input: &Value, forward_result: &Value) -> Value {
        match self {
            CompensationInput::ForwardInput => forward_input.clone(),
            CompensationInput::ForwardResult => forward_result.clone(),
            CompensationInput::Explicit(value) => value.clone(),
        }
    }
}

/// The undo action registered for one compensable step.
///
/// Recorded with the forward step's schedule event and pushed onto the
/// compensation stack only after that step completed successfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationRef {
    /// Name of the forward activity (or child workflow type).
    pub activity_name: String,

    /// Input the forward step was scheduled with.
    pub input: Value,

    /// Name of the activity that undoes the forward step.
    pub compensation_activity_name: String,

    /// Source of the compensation activity's input.
    #[serde(default)]
    pub compensation_input: CompensationInput,

    /// Retry policy of the compensation activity.
    pub retry_policy: RetryPolicy,

    /// Queue the compensation activity is dispatched on.
    pub task_queue: String,
}

impl CompensationRef {
    /// Creates a reference with the default compensation retry policy.
    pub fn new(
        activity_name: impl Into<String>,
        input: Value,
        compensation_activity_name: impl Into<String>,
    ) -> Self {
        Self {
            activity_name: activity_name.into(),
            input,
            compensation_activity_name: compensation_activity_name.into(),
            compensation_input: CompensationInput::default(),
            retry_policy: RetryPolicy::compensation(),
            task_queue: DEFAULT_COMPENSATION_QUEUE.to_string(),
        }
    }

    pub fn with_input(mut self, compensation_input: CompensationInput) -> Self {
        self.compensation_input = compensation_input;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = task_queue.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolve_input_sources() {
        let forward = json!({"order_id": "o-1"});
        let result = json!({"payment_id": "pay-o-1"});

        assert_eq!(
            CompensationInput::ForwardInput.resolve(&forward, &result),
            forward
        );
        assert_eq!(
            CompensationInput::ForwardResult.resolve(&forward, &result),
            result
        );
        assert_eq!(
            CompensationInput::Explicit(json!("fixed")).resolve(&forward, &result),
            json!("fixed")
        );
    }

    #[test]
    fn new_uses_compensation_retry_policy() {
        let compensation = CompensationRef::new("ChargeCard", json!({}), "RefundCard");
        assert_eq!(compensation.retry_policy, RetryPolicy::compensation());
        assert_eq!(compensation.task_queue, DEFAULT_COMPENSATION_QUEUE);
        assert_eq!(
            compensation.compensation_input,
            CompensationInput::ForwardInput
        );
    }

    #[test]
    fn serialization_roundtrip() {
        let compensation = CompensationRef::new("AuthorizePayment", json!({"amount": 109.97}), "VoidAuthorization")
            .with_input(CompensationInput::ForwardResult)
            .with_task_queue("payments");

        let json = serde_json::to_string(&compensation).unwrap();
        let back: CompensationRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, compensation);
    }
}
