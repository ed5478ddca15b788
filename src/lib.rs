//! siemcor: correlation and response engine
//!
//! Turns batches of normalized security events into offences by
//! evaluating correlation rules against a threat-intelligence indicator
//! set and sliding-window counters, then runs configured response
//! pipelines against the offences it creates.

pub mod config;
pub mod core;
pub mod correlation;
pub mod error;
pub mod intel;
pub mod offence;
pub mod response;
pub mod rules;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::Serialize;
use tracing::info;

use crate::config::Config;
use crate::core::{CancelFlag, Event, SharedClock};
use crate::correlation::{
    CorrelationEvaluator, CycleSummary, EvaluatorSettings, ThresholdWindowStore,
};
use crate::error::{EngineError, Result};
use crate::intel::IndicatorStore;
use crate::offence::OffenceStore;
use crate::response::{
    ActionRegistry, CapabilityRegistry, ExecutionReport, ExecutionTrigger, PipelineExecutor,
    PipelineRegistry, PipelineResolver,
};
use crate::rules::{RuleRegistry, SeedReport};

/// One cycle's correlation counters plus the pipeline runs it triggered
#[derive(Debug, Serialize)]
pub struct CycleReport {
    pub correlation: CycleSummary,
    pub executions: Vec<ExecutionReport>,
}

/// Engine facade wiring the registries, stores, evaluator and executor
pub struct SiemCore {
    intel: Arc<IndicatorStore>,
    rules: Arc<RuleRegistry>,
    offences: Arc<OffenceStore>,
    actions: Arc<ActionRegistry>,
    pipelines: Arc<PipelineRegistry>,
    evaluator: CorrelationEvaluator,
    resolver: PipelineResolver,
    executor: PipelineExecutor,
    cancel: CancelFlag,
}

impl SiemCore {
    pub fn new(config: &Config) -> Self {
        Self::with_parts(config, core::system_clock(), CapabilityRegistry::with_defaults())
    }

    /// Full wiring with an injected clock and capability set
    pub fn with_parts(
        config: &Config,
        clock: SharedClock,
        capabilities: CapabilityRegistry,
    ) -> Self {
        let intel = Arc::new(IndicatorStore::new());
        let rules = Arc::new(RuleRegistry::new());
        let offences = Arc::new(OffenceStore::new(Arc::clone(&clock)));
        let actions = Arc::new(ActionRegistry::new(Arc::clone(&clock)));
        let pipelines = Arc::new(PipelineRegistry::new(Arc::clone(&clock)));
        let windows = Arc::new(ThresholdWindowStore::new(StdDuration::from_millis(
            config.correlation.counter_lock_timeout_ms,
        )));

        let cancel = CancelFlag::new();
        let evaluator = CorrelationEvaluator::new(
            Arc::clone(&intel) as Arc<dyn intel::IndicatorLookup>,
            windows,
            Arc::clone(&offences),
            EvaluatorSettings {
                lookup_timeout: StdDuration::from_secs(config.correlation.lookup_timeout_secs),
                lookup_concurrency: config.correlation.lookup_concurrency,
                default_dedup_cooldown: Duration::minutes(i64::from(
                    config.correlation.dedup_cooldown_minutes,
                )),
            },
        )
        .with_cancel_flag(cancel.clone());
        let resolver = PipelineResolver::new(Arc::clone(&pipelines), Arc::clone(&actions));
        let executor = PipelineExecutor::new(
            capabilities,
            clock,
            StdDuration::from_secs(config.response.pipeline_timeout_secs),
        )
        .with_cancel_flag(cancel.clone());

        Self {
            intel,
            rules,
            offences,
            actions,
            pipelines,
            evaluator,
            resolver,
            executor,
            cancel,
        }
    }

    pub fn intel(&self) -> &IndicatorStore {
        &self.intel
    }

    pub fn rules(&self) -> &RuleRegistry {
        &self.rules
    }

    pub fn offences(&self) -> &OffenceStore {
        &self.offences
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    pub fn pipelines(&self) -> &PipelineRegistry {
        &self.pipelines
    }

    pub fn executor(&self) -> &PipelineExecutor {
        &self.executor
    }

    /// Handle for stopping in-progress work. Raising it halts rule and
    /// step scheduling while the action call already in flight finishes;
    /// call `reset` before the next run.
    pub fn cancel_handle(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Seed the built-in rule library; idempotent by rule name
    pub fn load_default_rules(&self) -> Result<SeedReport> {
        let report = self.rules.load_default_rules()?;
        info!(
            created = report.created,
            skipped = report.skipped,
            "default rule library loaded"
        );
        Ok(report)
    }

    /// Run one correlation cycle, then execute every pipeline linked to
    /// the rules behind the offences the cycle created.
    pub async fn run_cycle(&self, events: &[Event]) -> CycleReport {
        let summary = self
            .evaluator
            .run_cycle(events, self.rules.snapshot_enabled())
            .await;

        let mut executions = Vec::new();
        for offence_id in &summary.created_offence_ids {
            if self.cancel.is_cancelled() {
                break;
            }
            let Some(offence) = self.offences.get(*offence_id) else {
                continue;
            };
            for resolved in self.resolver.resolve_for_offence(&offence) {
                let report = self
                    .executor
                    .execute(resolved, offence.id, ExecutionTrigger::RuleLinkage)
                    .await;
                executions.push(report);
            }
        }
        CycleReport {
            correlation: summary,
            executions,
        }
    }

    /// Execute pipelines for an existing offence. With a pipeline id the
    /// run is manual and targets only that pipeline; without one, every
    /// pipeline linked to the offence's rule runs.
    pub async fn execute_for_offence(
        &self,
        offence_id: uuid::Uuid,
        pipeline_id: Option<u64>,
    ) -> Result<Vec<ExecutionReport>> {
        let offence = self
            .offences
            .get(offence_id)
            .ok_or_else(|| EngineError::not_found("offence", offence_id))?;

        let resolved = match pipeline_id {
            Some(id) => vec![self.resolver.resolve_manual(id, &offence)?],
            None => self.resolver.resolve_for_offence(&offence),
        };
        let trigger = if pipeline_id.is_some() {
            ExecutionTrigger::Manual
        } else {
            ExecutionTrigger::RuleLinkage
        };

        let mut reports = Vec::with_capacity(resolved.len());
        for pipeline in resolved {
            reports.push(self.executor.execute(pipeline, offence.id, trigger).await);
        }
        Ok(reports)
    }

    /// Run a single configured action against an offence, outside any
    /// pipeline, with operator-supplied parameter overrides.
    pub async fn execute_adhoc_action(
        &self,
        offence_id: uuid::Uuid,
        action_id: u64,
        params: response::ActionParamsTemplate,
    ) -> Result<ExecutionReport> {
        let offence = self
            .offences
            .get(offence_id)
            .ok_or_else(|| EngineError::not_found("offence", offence_id))?;
        let step = self.resolver.resolve_action(action_id, &params, &offence)?;
        Ok(self.executor.execute_adhoc(step, offence.id).await)
    }
}
