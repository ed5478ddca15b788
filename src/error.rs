//! Engine error taxonomy
//!
//! Nothing below aborts a correlation cycle or a pipeline run: validation
//! errors are rejected at registry write time, and every evaluation-time
//! fault is isolated to the rule, event, or action it occurred in.

use thiserror::Error;

/// Errors raised by the correlation and response engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Rule/action/pipeline definition inconsistent with its type.
    /// Rejected at registry write, never reaches evaluation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Indicator lookup did not answer in time. Treated as no-match;
    /// the cycle continues and reports a warning count.
    #[error("indicator lookup timed out after {timeout_ms}ms")]
    LookupTimeout { timeout_ms: u64 },

    /// Unexpected fault inside one rule's evaluation. Isolated to that
    /// rule for the running cycle.
    #[error("rule {rule_id} evaluation failed: {reason}")]
    RuleEvaluation { rule_id: u64, reason: String },

    /// One remediation action failed. Recorded in the execution report;
    /// the pipeline continues per its failure policy.
    #[error("action '{action}' failed: {reason}")]
    ActionExecution { action: String, reason: String },

    /// Could not acquire a threshold counter lock in time. The event is
    /// skipped; the counter's prior state is untouched.
    #[error("contention on threshold counter for rule {rule_id}, key '{key}'")]
    ResourceContention { rule_id: u64, key: String },

    /// Referenced entity does not exist
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::validation("threshold_count must be > 0");
        assert_eq!(
            err.to_string(),
            "validation failed: threshold_count must be > 0"
        );

        let err = EngineError::not_found("pipeline", 42);
        assert_eq!(err.to_string(), "pipeline 42 not found");
    }
}
