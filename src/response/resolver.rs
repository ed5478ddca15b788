//! Pipeline resolution
//!
//! Resolution turns a pipeline plus an offence into a concrete execution
//! plan: steps in order, each with its final parameter object. Parameters
//! start from the action's defaults; rendered template keys override them.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::correlation::{RenderContext, TemplateRenderer};
use crate::error::{EngineError, Result};
use crate::offence::Offence;
use crate::response::action::{ActionRegistry, ResponseAction};
use crate::response::pipeline::{ActionParamsTemplate, PipelineRegistry, ResponsePipeline};

/// A step ready to execute
#[derive(Debug, Clone)]
pub struct ResolvedStep {
    pub order: u32,
    pub action: ResponseAction,
    /// Defaults merged with the rendered step template, template wins
    pub params: Value,
}

/// A pipeline ready to execute against one offence
#[derive(Debug, Clone)]
pub struct ResolvedPipeline {
    pub pipeline: ResponsePipeline,
    pub steps: Vec<ResolvedStep>,
}

/// Resolves pipelines for offences
pub struct PipelineResolver {
    pipelines: Arc<PipelineRegistry>,
    actions: Arc<ActionRegistry>,
    renderer: TemplateRenderer,
}

impl PipelineResolver {
    pub fn new(pipelines: Arc<PipelineRegistry>, actions: Arc<ActionRegistry>) -> Self {
        Self {
            pipelines,
            actions,
            renderer: TemplateRenderer::new(),
        }
    }

    /// All enabled pipelines triggered by the offence's rule, resolved.
    /// A pipeline that fails to resolve is logged and dropped; the others
    /// still run.
    pub fn resolve_for_offence(&self, offence: &Offence) -> Vec<ResolvedPipeline> {
        self.pipelines
            .find_by_trigger_rule(offence.correlation_rule_id)
            .into_iter()
            .filter_map(|pipeline| match self.resolve(&pipeline, offence) {
                Ok(resolved) => Some(resolved),
                Err(err) => {
                    warn!(
                        pipeline_id = pipeline.id,
                        offence_id = %offence.id,
                        %err,
                        "pipeline failed to resolve, skipping"
                    );
                    None
                }
            })
            .collect()
    }

    /// Resolve one pipeline for manual execution. Disabled pipelines are
    /// refused rather than silently run.
    pub fn resolve_manual(&self, pipeline_id: u64, offence: &Offence) -> Result<ResolvedPipeline> {
        let pipeline = self
            .pipelines
            .get(pipeline_id)
            .ok_or_else(|| EngineError::not_found("response pipeline", pipeline_id))?;
        if !pipeline.enabled {
            return Err(EngineError::validation(format!(
                "pipeline {pipeline_id} is disabled"
            )));
        }
        self.resolve(&pipeline, offence)
    }

    /// Resolve one action for ad-hoc invocation against an offence
    pub fn resolve_action(
        &self,
        action_id: u64,
        template: &ActionParamsTemplate,
        offence: &Offence,
    ) -> Result<ResolvedStep> {
        let action = self
            .actions
            .get(action_id)
            .ok_or_else(|| EngineError::not_found("response action", action_id))?;
        let ctx = offence_context(offence);
        let rendered = template.render(&self.renderer, &ctx);
        Ok(ResolvedStep {
            order: 1,
            params: merge_params(&action.default_params, &rendered),
            action,
        })
    }

    fn resolve(&self, pipeline: &ResponsePipeline, offence: &Offence) -> Result<ResolvedPipeline> {
        let ctx = offence_context(offence);
        let mut steps = Vec::with_capacity(pipeline.actions.len());
        for config in &pipeline.actions {
            let action = self.actions.get(config.action_id).ok_or_else(|| {
                EngineError::not_found("response action", config.action_id)
            })?;
            let rendered = config.action_params_template.render(&self.renderer, &ctx);
            steps.push(ResolvedStep {
                order: config.order,
                action: action.clone(),
                params: merge_params(&action.default_params, &rendered),
            });
        }
        steps.sort_by_key(|s| s.order);
        Ok(ResolvedPipeline {
            pipeline: pipeline.clone(),
            steps,
        })
    }
}

/// Template scopes for an offence: `offence.*` plus the triggering
/// event snapshot as `event.*`
fn offence_context(offence: &Offence) -> RenderContext {
    let mut ctx = RenderContext::new().with_scope(
        "offence",
        serde_json::to_value(offence).unwrap_or(Value::Null),
    );
    if let Some(summary) = &offence.triggering_event_summary {
        ctx = ctx.with_scope("event", summary.clone());
    }
    ctx
}

/// Shallow merge: every key in `overrides` replaces the default
fn merge_params(defaults: &Value, overrides: &Value) -> Value {
    let mut merged = match defaults {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    if let Value::Object(map) = overrides {
        for (key, value) in map {
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}
