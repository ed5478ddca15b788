//! Response pipelines
//!
//! A pipeline is an ordered sequence of action references, optionally
//! linked to correlation rules. Referential checks run at save time so
//! that execution never encounters a step with an undefined order or a
//! dangling action id.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::core::SharedClock;
use crate::error::{EngineError, Result};
use crate::response::action::ActionRegistry;
use crate::rules::RuleRegistry;

/// One value in a step's parameter template
#[derive(Debug, Clone, PartialEq)]
enum ParamTemplate {
    /// Copied into the final parameters as-is
    Literal(Value),
    /// String carrying `{scope.path}` placeholders, rendered per offence
    Templated(String),
}

/// Typed step parameter template. Parsed from a JSON object at save
/// time, so a malformed placeholder is rejected before any execution.
/// Keys here override the action's default parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct ActionParamsTemplate {
    entries: BTreeMap<String, ParamTemplate>,
}

impl ActionParamsTemplate {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render every entry against a context, yielding the final
    /// parameter object for one step
    pub fn render(
        &self,
        renderer: &crate::correlation::TemplateRenderer,
        ctx: &crate::correlation::RenderContext,
    ) -> Value {
        let mut out = serde_json::Map::new();
        for (key, value) in &self.entries {
            let rendered = match value {
                ParamTemplate::Literal(v) => renderer.render_value(v, ctx),
                ParamTemplate::Templated(s) => Value::String(renderer.render(s, ctx)),
            };
            out.insert(key.clone(), rendered);
        }
        Value::Object(out)
    }
}

impl TryFrom<Value> for ActionParamsTemplate {
    type Error = EngineError;

    fn try_from(value: Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(EngineError::validation(
                "action_params_template must be a JSON object",
            ));
        };
        let mut entries = BTreeMap::new();
        for (key, value) in map {
            let entry = match value {
                Value::String(s) => {
                    validate_placeholders(&s)?;
                    ParamTemplate::Templated(s)
                }
                other => {
                    validate_nested_placeholders(&other)?;
                    ParamTemplate::Literal(other)
                }
            };
            entries.insert(key, entry);
        }
        Ok(Self { entries })
    }
}

impl From<ActionParamsTemplate> for Value {
    fn from(template: ActionParamsTemplate) -> Self {
        let map = template
            .entries
            .into_iter()
            .map(|(key, value)| match value {
                ParamTemplate::Literal(v) => (key, v),
                ParamTemplate::Templated(s) => (key, Value::String(s)),
            })
            .collect();
        Value::Object(map)
    }
}

/// Reject unterminated or ungrammatical `{scope.path}` placeholders
fn validate_placeholders(raw: &str) -> Result<()> {
    let mut rest = raw;
    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            return Err(EngineError::validation(format!(
                "unterminated placeholder in '{raw}'"
            )));
        };
        let inner = &after[..end];
        let mut parts = inner.splitn(2, '.');
        let scope = parts.next().unwrap_or("");
        let path = parts.next().unwrap_or("");
        let well_formed = !scope.is_empty()
            && !path.is_empty()
            && scope.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            && path
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
            && !path.split('.').any(str::is_empty);
        if !well_formed {
            return Err(EngineError::validation(format!(
                "malformed placeholder '{{{inner}}}'"
            )));
        }
        rest = &after[end + 1..];
    }
    Ok(())
}

fn validate_nested_placeholders(value: &Value) -> Result<()> {
    match value {
        Value::String(s) => validate_placeholders(s),
        Value::Object(map) => map.values().try_for_each(validate_nested_placeholders),
        Value::Array(items) => items.iter().try_for_each(validate_nested_placeholders),
        _ => Ok(()),
    }
}

/// One step: which action, where in the sequence, and parameter overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineActionConfig {
    pub action_id: u64,
    /// Position in the sequence; unique within a pipeline
    pub order: u32,
    #[serde(default)]
    pub action_params_template: ActionParamsTemplate,
}

/// A saved response pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePipeline {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub enabled: bool,
    /// Correlation rule whose offences trigger this pipeline;
    /// None = manually triggered only
    #[serde(default)]
    pub trigger_correlation_rule_id: Option<u64>,
    pub actions: Vec<PipelineActionConfig>,
    /// Stop at the first failed step instead of continuing
    #[serde(default)]
    pub abort_on_failure: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payload for creating a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDraft {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub trigger_correlation_rule_id: Option<u64>,
    pub actions: Vec<PipelineActionConfig>,
    #[serde(default)]
    pub abort_on_failure: bool,
}

fn default_enabled() -> bool {
    true
}

impl PipelineDraft {
    pub fn new(name: &str, actions: Vec<PipelineActionConfig>) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            enabled: true,
            trigger_correlation_rule_id: None,
            actions,
            abort_on_failure: false,
        }
    }

    pub fn with_trigger_rule(mut self, rule_id: u64) -> Self {
        self.trigger_correlation_rule_id = Some(rule_id);
        self
    }

    pub fn with_abort_on_failure(mut self) -> Self {
        self.abort_on_failure = true;
        self
    }

    fn validate(&self, actions: &ActionRegistry, rules: &RuleRegistry) -> Result<()> {
        if self.name.trim().len() < 3 {
            return Err(EngineError::validation(
                "pipeline name must be at least 3 characters",
            ));
        }
        if self.actions.is_empty() {
            return Err(EngineError::validation(
                "pipeline must contain at least one action",
            ));
        }
        let mut orders = HashSet::new();
        for step in &self.actions {
            if !orders.insert(step.order) {
                return Err(EngineError::validation(format!(
                    "duplicate step order {}",
                    step.order
                )));
            }
            if !actions.contains(step.action_id) {
                return Err(EngineError::validation(format!(
                    "unknown action id {}",
                    step.action_id
                )));
            }
        }
        if let Some(rule_id) = self.trigger_correlation_rule_id {
            if rules.get(rule_id).is_none() {
                return Err(EngineError::validation(format!(
                    "unknown trigger rule id {rule_id}"
                )));
            }
        }
        Ok(())
    }
}

/// Partial pipeline update; absent fields keep their value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineUpdate {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub enabled: Option<bool>,
    pub trigger_correlation_rule_id: Option<Option<u64>>,
    pub actions: Option<Vec<PipelineActionConfig>>,
    pub abort_on_failure: Option<bool>,
}

/// In-memory pipeline registry, ids ascending
pub struct PipelineRegistry {
    pipelines: RwLock<BTreeMap<u64, ResponsePipeline>>,
    next_id: AtomicU64,
    clock: SharedClock,
}

impl PipelineRegistry {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            pipelines: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            clock,
        }
    }

    pub fn create(
        &self,
        draft: PipelineDraft,
        actions: &ActionRegistry,
        rules: &RuleRegistry,
    ) -> Result<ResponsePipeline> {
        draft.validate(actions, rules)?;
        let now = self.clock.now();
        let mut steps = draft.actions;
        steps.sort_by_key(|s| s.order);
        let pipeline = ResponsePipeline {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            name: draft.name,
            description: draft.description,
            enabled: draft.enabled,
            trigger_correlation_rule_id: draft.trigger_correlation_rule_id,
            actions: steps,
            abort_on_failure: draft.abort_on_failure,
            created_at: now,
            updated_at: now,
        };
        info!(
            pipeline_id = pipeline.id,
            name = %pipeline.name,
            steps = pipeline.actions.len(),
            "response pipeline created"
        );
        self.pipelines.write().insert(pipeline.id, pipeline.clone());
        Ok(pipeline)
    }

    pub fn get(&self, id: u64) -> Option<ResponsePipeline> {
        self.pipelines.read().get(&id).cloned()
    }

    pub fn list(&self, skip: usize, limit: usize) -> Vec<ResponsePipeline> {
        self.pipelines
            .read()
            .values()
            .skip(skip)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn update(
        &self,
        id: u64,
        update: PipelineUpdate,
        actions: &ActionRegistry,
        rules: &RuleRegistry,
    ) -> Result<ResponsePipeline> {
        let current = self
            .get(id)
            .ok_or_else(|| EngineError::not_found("response pipeline", id))?;

        // Merge, then revalidate as a draft before storing
        let mut draft = PipelineDraft {
            name: current.name.clone(),
            description: current.description.clone(),
            enabled: current.enabled,
            trigger_correlation_rule_id: current.trigger_correlation_rule_id,
            actions: current.actions.clone(),
            abort_on_failure: current.abort_on_failure,
        };
        if let Some(name) = update.name {
            draft.name = name;
        }
        if let Some(description) = update.description {
            draft.description = description;
        }
        if let Some(enabled) = update.enabled {
            draft.enabled = enabled;
        }
        if let Some(rule_id) = update.trigger_correlation_rule_id {
            draft.trigger_correlation_rule_id = rule_id;
        }
        if let Some(steps) = update.actions {
            draft.actions = steps;
        }
        if let Some(abort) = update.abort_on_failure {
            draft.abort_on_failure = abort;
        }
        draft.validate(actions, rules)?;

        let mut pipelines = self.pipelines.write();
        let pipeline = pipelines
            .get_mut(&id)
            .ok_or_else(|| EngineError::not_found("response pipeline", id))?;
        pipeline.name = draft.name;
        pipeline.description = draft.description;
        pipeline.enabled = draft.enabled;
        pipeline.trigger_correlation_rule_id = draft.trigger_correlation_rule_id;
        pipeline.actions = draft.actions;
        pipeline.actions.sort_by_key(|s| s.order);
        pipeline.abort_on_failure = draft.abort_on_failure;
        pipeline.updated_at = self.clock.now();
        Ok(pipeline.clone())
    }

    pub fn delete(&self, id: u64) -> Result<()> {
        self.pipelines
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| EngineError::not_found("response pipeline", id))
    }

    pub fn count(&self) -> usize {
        self.pipelines.read().len()
    }

    /// Enabled pipelines linked to a correlation rule, ascending id
    pub fn find_by_trigger_rule(&self, rule_id: u64) -> Vec<ResponsePipeline> {
        self.pipelines
            .read()
            .values()
            .filter(|p| p.enabled && p.trigger_correlation_rule_id == Some(rule_id))
            .cloned()
            .collect()
    }
}
