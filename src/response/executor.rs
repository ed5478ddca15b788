//! Pipeline execution
//!
//! Runs resolved pipelines step by step in strict ascending order. A
//! failed step does not stop the pipeline unless it was saved with
//! abort_on_failure; the pipeline deadline and an operator cancel both
//! mark every remaining step as not attempted, while the action call
//! already in flight runs to completion. Every run produces an
//! execution report.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::core::{CancelFlag, SharedClock};
use crate::response::action::{CapabilityRegistry, ResponseActionType};
use crate::response::resolver::ResolvedPipeline;

/// Lifecycle of one pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    /// Every step executed
    Success,
    /// Some steps executed, some did not
    Partial,
    /// No step executed
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Partial => "partial",
            ExecutionStatus::Failed => "failed",
        }
    }
}

/// What happened to one step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StepOutcome {
    Executed { detail: Value },
    Failed { reason: String },
    /// Not run: the action is disabled, or an earlier step failed and
    /// the pipeline aborts on failure
    Skipped,
    /// Not run because the pipeline deadline was reached or the run
    /// was cancelled
    NotAttempted,
}

impl StepOutcome {
    pub fn is_executed(&self) -> bool {
        matches!(self, StepOutcome::Executed { .. })
    }
}

/// Per-step record on an execution report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub order: u32,
    pub action_id: u64,
    pub action_name: String,
    pub action_type: ResponseActionType,
    /// Final parameters the step ran with
    pub params: Value,
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

/// How an execution was initiated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTrigger {
    /// Linked to the offence's correlation rule
    RuleLinkage,
    /// Requested by an operator against a specific pipeline
    Manual,
}

/// Record of one pipeline run (or one ad-hoc action) against one offence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub id: Uuid,
    /// None for ad-hoc single-action runs
    pub pipeline_id: Option<u64>,
    pub pipeline_name: String,
    pub offence_id: Uuid,
    pub trigger: ExecutionTrigger,
    pub status: ExecutionStatus,
    pub steps: Vec<StepReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Executes resolved pipelines and keeps the run history
pub struct PipelineExecutor {
    capabilities: CapabilityRegistry,
    history: RwLock<Vec<ExecutionReport>>,
    clock: SharedClock,
    /// Wall-time budget for one pipeline run
    pipeline_timeout: StdDuration,
    cancel: CancelFlag,
}

impl PipelineExecutor {
    pub fn new(
        capabilities: CapabilityRegistry,
        clock: SharedClock,
        pipeline_timeout: StdDuration,
    ) -> Self {
        Self {
            capabilities,
            history: RwLock::new(Vec::new()),
            clock,
            pipeline_timeout,
            cancel: CancelFlag::new(),
        }
    }

    /// Share an externally owned cancel flag
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run every step of a resolved pipeline in order and record the
    /// report. Always returns a report, even when nothing ran.
    pub async fn execute(
        &self,
        resolved: ResolvedPipeline,
        offence_id: Uuid,
        trigger: ExecutionTrigger,
    ) -> ExecutionReport {
        let started_at = self.clock.now();
        let deadline = tokio::time::Instant::now() + self.pipeline_timeout;
        info!(
            pipeline_id = resolved.pipeline.id,
            %offence_id,
            steps = resolved.steps.len(),
            "pipeline execution started"
        );

        let abort_on_failure = resolved.pipeline.abort_on_failure;
        let mut steps: Vec<StepReport> = Vec::with_capacity(resolved.steps.len());
        let mut aborted = false;
        let mut out_of_time = false;
        let mut cancelled = false;

        for step in resolved.steps {
            let outcome = if aborted {
                StepOutcome::Skipped
            } else if out_of_time || cancelled {
                StepOutcome::NotAttempted
            } else if self.cancel.is_cancelled() {
                // Stop scheduling; the step already in flight has finished
                cancelled = true;
                StepOutcome::NotAttempted
            } else {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    out_of_time = true;
                    StepOutcome::NotAttempted
                } else {
                    match self.run_step(&step, remaining).await {
                        StepRun::Done(outcome) => outcome,
                        StepRun::DeadlineHit => {
                            out_of_time = true;
                            StepOutcome::NotAttempted
                        }
                    }
                }
            };

            if matches!(outcome, StepOutcome::Failed { .. }) && abort_on_failure {
                aborted = true;
            }
            steps.push(StepReport {
                order: step.order,
                action_id: step.action.id,
                action_name: step.action.name.clone(),
                action_type: step.action.action_type,
                params: step.params,
                outcome,
            });
        }

        let status = final_status(&steps);
        if cancelled {
            warn!(
                pipeline_id = resolved.pipeline.id,
                "pipeline cancelled, remaining steps not attempted"
            );
        }
        if out_of_time {
            warn!(
                pipeline_id = resolved.pipeline.id,
                timeout_secs = self.pipeline_timeout.as_secs(),
                "pipeline deadline reached, remaining steps not attempted"
            );
        }
        let report = ExecutionReport {
            id: Uuid::new_v4(),
            pipeline_id: Some(resolved.pipeline.id),
            pipeline_name: resolved.pipeline.name.clone(),
            offence_id,
            trigger,
            status,
            steps,
            started_at,
            finished_at: self.clock.now(),
        };
        info!(
            execution_id = %report.id,
            pipeline_id = report.pipeline_id,
            status = report.status.as_str(),
            "pipeline execution finished"
        );
        self.history.write().push(report.clone());
        report
    }

    /// Run one action outside any pipeline and record the report.
    /// Operator-initiated, so the trigger is always manual.
    pub async fn execute_adhoc(
        &self,
        step: crate::response::resolver::ResolvedStep,
        offence_id: Uuid,
    ) -> ExecutionReport {
        let started_at = self.clock.now();
        let outcome = match self.run_step(&step, self.pipeline_timeout).await {
            StepRun::Done(outcome) => outcome,
            StepRun::DeadlineHit => StepOutcome::NotAttempted,
        };
        let steps = vec![StepReport {
            order: step.order,
            action_id: step.action.id,
            action_name: step.action.name.clone(),
            action_type: step.action.action_type,
            params: step.params,
            outcome,
        }];
        let report = ExecutionReport {
            id: Uuid::new_v4(),
            pipeline_id: None,
            pipeline_name: format!("ad-hoc: {}", step.action.name),
            offence_id,
            trigger: ExecutionTrigger::Manual,
            status: final_status(&steps),
            steps,
            started_at,
            finished_at: self.clock.now(),
        };
        info!(
            execution_id = %report.id,
            action_id = report.steps[0].action_id,
            status = report.status.as_str(),
            "ad-hoc action execution finished"
        );
        self.history.write().push(report.clone());
        report
    }

    async fn run_step(
        &self,
        step: &crate::response::resolver::ResolvedStep,
        remaining: StdDuration,
    ) -> StepRun {
        if !step.action.enabled {
            warn!(action_id = step.action.id, "action is disabled, skipping step");
            return StepRun::Done(StepOutcome::Skipped);
        }
        let Some(capability) = self.capabilities.get(step.action.action_type) else {
            return StepRun::Done(StepOutcome::Failed {
                reason: format!("no capability registered for {}", step.action.action_type),
            });
        };

        // The invocation runs in its own task so that a cancel, a
        // deadline or a dropped caller future never interrupts an
        // external side effect mid-flight.
        let params = step.params.clone();
        let invocation = tokio::spawn(async move { capability.invoke(&params).await });
        match timeout(remaining, invocation).await {
            Ok(Ok(Ok(detail))) => StepRun::Done(StepOutcome::Executed { detail }),
            Ok(Ok(Err(err))) => {
                error!(
                    action = %step.action.action_type,
                    action_id = step.action.id,
                    %err,
                    "response action failed"
                );
                StepRun::Done(StepOutcome::Failed {
                    reason: err.to_string(),
                })
            }
            Ok(Err(join_err)) => StepRun::Done(StepOutcome::Failed {
                reason: format!("action task aborted: {join_err}"),
            }),
            // The detached task keeps running; only the wait is over
            Err(_) => StepRun::DeadlineHit,
        }
    }

    /// Execution history, newest first
    pub fn history(&self, skip: usize, limit: usize) -> Vec<ExecutionReport> {
        let history = self.history.read();
        history
            .iter()
            .rev()
            .skip(skip)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn get_report(&self, id: Uuid) -> Option<ExecutionReport> {
        self.history.read().iter().find(|r| r.id == id).cloned()
    }

    /// History for one offence, newest first
    pub fn history_for_offence(&self, offence_id: Uuid) -> Vec<ExecutionReport> {
        self.history
            .read()
            .iter()
            .rev()
            .filter(|r| r.offence_id == offence_id)
            .cloned()
            .collect()
    }
}

enum StepRun {
    Done(StepOutcome),
    DeadlineHit,
}

/// Skipped-for-disabled steps do not count against the run; a pipeline
/// whose every considered step executed is still a success.
fn final_status(steps: &[StepReport]) -> ExecutionStatus {
    let executed = steps.iter().filter(|s| s.outcome.is_executed()).count();
    let considered = steps
        .iter()
        .filter(|s| !matches!(s.outcome, StepOutcome::Skipped))
        .count();
    if executed > 0 && executed == considered {
        ExecutionStatus::Success
    } else if executed > 0 {
        ExecutionStatus::Partial
    } else {
        ExecutionStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::system_clock;
    use crate::error::EngineError;
    use crate::response::action::{ResponseAction, ResponseCapability};
    use crate::response::pipeline::ResponsePipeline;
    use crate::response::resolver::ResolvedStep;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    fn make_action(id: u64, action_type: ResponseActionType) -> ResponseAction {
        let now = Utc::now();
        ResponseAction {
            id,
            name: format!("action-{id}"),
            description: None,
            action_type,
            default_params: json!({}),
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn make_resolved(abort_on_failure: bool, steps: Vec<ResolvedStep>) -> ResolvedPipeline {
        let now = Utc::now();
        ResolvedPipeline {
            pipeline: ResponsePipeline {
                id: 1,
                name: "Contain C2".to_string(),
                description: None,
                enabled: true,
                trigger_correlation_rule_id: Some(1),
                actions: vec![],
                abort_on_failure,
                created_at: now,
                updated_at: now,
            },
            steps,
        }
    }

    fn ok_step(order: u32) -> ResolvedStep {
        ResolvedStep {
            order,
            action: make_action(u64::from(order), ResponseActionType::BlockIp),
            params: json!({ "ip_address": "203.0.113.9" }),
        }
    }

    fn failing_step(order: u32) -> ResolvedStep {
        // No ip_address parameter, so the default capability errors
        ResolvedStep {
            order,
            action: make_action(u64::from(order), ResponseActionType::BlockIp),
            params: json!({}),
        }
    }

    fn executor() -> PipelineExecutor {
        PipelineExecutor::new(
            CapabilityRegistry::with_defaults(),
            system_clock(),
            StdDuration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_all_steps_ok_is_success() {
        let executor = executor();
        let report = executor
            .execute(
                make_resolved(false, vec![ok_step(1), ok_step(2)]),
                Uuid::new_v4(),
                ExecutionTrigger::RuleLinkage,
            )
            .await;
        assert_eq!(report.status, ExecutionStatus::Success);
        assert!(report.steps.iter().all(|s| s.outcome.is_executed()));
    }

    #[tokio::test]
    async fn test_failed_step_continues_and_yields_partial() {
        let executor = executor();
        let report = executor
            .execute(
                make_resolved(false, vec![failing_step(1), ok_step(2)]),
                Uuid::new_v4(),
                ExecutionTrigger::RuleLinkage,
            )
            .await;
        assert_eq!(report.status, ExecutionStatus::Partial);
        assert!(matches!(report.steps[0].outcome, StepOutcome::Failed { .. }));
        assert!(report.steps[1].outcome.is_executed());
    }

    #[tokio::test]
    async fn test_middle_step_failure_runs_flanking_steps_in_order() {
        let executor = executor();
        let report = executor
            .execute(
                make_resolved(false, vec![ok_step(1), failing_step(2), ok_step(3)]),
                Uuid::new_v4(),
                ExecutionTrigger::RuleLinkage,
            )
            .await;
        assert_eq!(report.status, ExecutionStatus::Partial);
        let orders: Vec<u32> = report.steps.iter().map(|s| s.order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
        assert!(report.steps[0].outcome.is_executed());
        assert!(matches!(report.steps[1].outcome, StepOutcome::Failed { .. }));
        assert!(report.steps[2].outcome.is_executed());
    }

    #[tokio::test]
    async fn test_abort_on_failure_skips_remaining_steps() {
        let executor = executor();
        let report = executor
            .execute(
                make_resolved(true, vec![failing_step(1), ok_step(2)]),
                Uuid::new_v4(),
                ExecutionTrigger::Manual,
            )
            .await;
        assert_eq!(report.status, ExecutionStatus::Failed);
        assert!(matches!(report.steps[1].outcome, StepOutcome::Skipped));
    }

    struct HangingCapability;

    #[async_trait]
    impl ResponseCapability for HangingCapability {
        async fn invoke(&self, _params: &Value) -> Result<Value, EngineError> {
            tokio::time::sleep(StdDuration::from_secs(60)).await;
            Ok(json!({}))
        }
    }

    #[tokio::test]
    async fn test_deadline_marks_remaining_not_attempted() {
        let mut capabilities = CapabilityRegistry::with_defaults();
        capabilities.register(ResponseActionType::IsolateHost, Arc::new(HangingCapability));
        let executor = PipelineExecutor::new(
            capabilities,
            system_clock(),
            StdDuration::from_millis(50),
        );

        let hanging = ResolvedStep {
            order: 2,
            action: make_action(2, ResponseActionType::IsolateHost),
            params: json!({ "hostname": "ws-01" }),
        };
        let report = executor
            .execute(
                make_resolved(false, vec![ok_step(1), hanging, ok_step(3)]),
                Uuid::new_v4(),
                ExecutionTrigger::RuleLinkage,
            )
            .await;

        assert_eq!(report.status, ExecutionStatus::Partial);
        assert!(report.steps[0].outcome.is_executed());
        assert!(matches!(report.steps[1].outcome, StepOutcome::NotAttempted));
        assert!(matches!(report.steps[2].outcome, StepOutcome::NotAttempted));
    }

    struct SlowRecordingCapability {
        cancel: CancelFlag,
        completed: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl ResponseCapability for SlowRecordingCapability {
        async fn invoke(&self, _params: &Value) -> Result<Value, EngineError> {
            self.cancel.cancel();
            tokio::time::sleep(StdDuration::from_millis(30)).await;
            self.completed
                .store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(json!({ "blocked": true }))
        }
    }

    #[tokio::test]
    async fn test_cancel_lets_in_flight_step_finish() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let cancel = CancelFlag::new();
        let completed = Arc::new(AtomicBool::new(false));
        let mut capabilities = CapabilityRegistry::with_defaults();
        capabilities.register(
            ResponseActionType::BlockIp,
            Arc::new(SlowRecordingCapability {
                cancel: cancel.clone(),
                completed: Arc::clone(&completed),
            }),
        );
        let executor = PipelineExecutor::new(
            capabilities,
            system_clock(),
            StdDuration::from_secs(5),
        )
        .with_cancel_flag(cancel);

        // The first step raises the flag while it is still running
        let report = executor
            .execute(
                make_resolved(false, vec![ok_step(1), ok_step(2)]),
                Uuid::new_v4(),
                ExecutionTrigger::Manual,
            )
            .await;

        assert!(completed.load(Ordering::SeqCst));
        assert!(report.steps[0].outcome.is_executed());
        assert!(matches!(report.steps[1].outcome, StepOutcome::NotAttempted));
        assert_eq!(report.status, ExecutionStatus::Partial);
    }

    #[tokio::test]
    async fn test_deadline_does_not_interrupt_in_flight_call() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let completed = Arc::new(AtomicBool::new(false));
        let mut capabilities = CapabilityRegistry::with_defaults();
        capabilities.register(
            ResponseActionType::BlockIp,
            Arc::new(SlowRecordingCapability {
                cancel: CancelFlag::new(),
                completed: Arc::clone(&completed),
            }),
        );
        let executor = PipelineExecutor::new(
            capabilities,
            system_clock(),
            StdDuration::from_millis(10),
        );

        let report = executor
            .execute(
                make_resolved(false, vec![ok_step(1)]),
                Uuid::new_v4(),
                ExecutionTrigger::RuleLinkage,
            )
            .await;
        assert!(matches!(report.steps[0].outcome, StepOutcome::NotAttempted));
        assert!(!completed.load(Ordering::SeqCst));

        // The invocation outlives the deadline and still runs to the end
        tokio::time::sleep(StdDuration::from_millis(80)).await;
        assert!(completed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_disabled_action_is_skipped_not_failed() {
        let executor = executor();
        let mut disabled = ok_step(1);
        disabled.action.enabled = false;
        let report = executor
            .execute(
                make_resolved(false, vec![disabled, ok_step(2)]),
                Uuid::new_v4(),
                ExecutionTrigger::RuleLinkage,
            )
            .await;
        // The skipped step does not drag the run down to partial
        assert_eq!(report.status, ExecutionStatus::Success);
        assert!(matches!(report.steps[0].outcome, StepOutcome::Skipped));
        assert!(report.steps[1].outcome.is_executed());
    }

    #[tokio::test]
    async fn test_adhoc_action_run_is_recorded() {
        let executor = executor();
        let offence = Uuid::new_v4();
        let report = executor.execute_adhoc(ok_step(1), offence).await;
        assert_eq!(report.status, ExecutionStatus::Success);
        assert_eq!(report.pipeline_id, None);
        assert_eq!(report.trigger, ExecutionTrigger::Manual);
        assert_eq!(executor.history_for_offence(offence).len(), 1);
    }

    #[tokio::test]
    async fn test_history_is_recorded_newest_first() {
        let executor = executor();
        let offence = Uuid::new_v4();
        for _ in 0..2 {
            executor
                .execute(
                    make_resolved(false, vec![ok_step(1)]),
                    offence,
                    ExecutionTrigger::RuleLinkage,
                )
                .await;
        }
        assert_eq!(executor.history(0, 10).len(), 2);
        assert_eq!(executor.history_for_offence(offence).len(), 2);
        assert_eq!(executor.history_for_offence(Uuid::new_v4()).len(), 0);
    }
}
