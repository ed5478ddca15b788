//! Correlation rule definitions
//!
//! A rule is either an indicator match (event field against the active
//! IoC set) or a sliding-window threshold over an aggregation key. The
//! two shapes are a tagged variant so that a rule can never carry fields
//! belonging to the other type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{EventField, Severity};
use crate::error::EngineError;
use crate::intel::IndicatorType;

/// Rule-type-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "rule_type", rename_all = "snake_case")]
pub enum RuleKind {
    /// Match an event field value against active indicators
    IocMatch(IocMatchConfig),
    /// Fire when qualifying events for one aggregation key reach a count
    /// inside a sliding time window
    Threshold(ThresholdConfig),
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::IocMatch(_) => "ioc_match",
            RuleKind::Threshold(_) => "threshold",
        }
    }
}

/// Configuration for indicator-match rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IocMatchConfig {
    /// Event attribute whose value is checked against the indicator set
    pub event_field_to_match: EventField,
    /// Indicator type to match against
    pub ioc_type_to_match: IndicatorType,
    /// Tags the matched indicator must all carry
    #[serde(default)]
    pub ioc_tags_match: Vec<String>,
    /// Minimum indicator confidence (0-100)
    #[serde(default)]
    pub ioc_min_confidence: Option<u8>,
}

/// Configuration for threshold rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Event count that fires the rule
    pub threshold_count: u32,
    /// Sliding window length in minutes
    pub threshold_window_minutes: u32,
    /// Event attributes forming the grouping key, in order
    pub aggregation_fields: Vec<EventField>,
}

/// A validated correlation rule owned by the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationRule {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub enabled: bool,
    /// Event category tags this rule applies to; empty = all categories
    #[serde(default)]
    pub event_source_types: Vec<String>,
    #[serde(flatten)]
    pub kind: RuleKind,
    /// Title template for generated offences, `{event.x}` / `{ioc.x}`
    pub offence_title_template: String,
    /// Severity assigned to generated offences
    pub offence_severity: Severity,
    /// Per-rule suppression cooldown override; None = engine default
    #[serde(default)]
    pub dedup_cooldown_minutes: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CorrelationRule {
    /// Whether this rule applies to an event category
    pub fn applies_to_category(&self, category: &str) -> bool {
        self.event_source_types.is_empty()
            || self.event_source_types.iter().any(|t| t == category)
    }
}

/// Payload for creating a rule; the registry assigns id and timestamps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDraft {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub event_source_types: Vec<String>,
    #[serde(flatten)]
    pub kind: RuleKind,
    pub offence_title_template: String,
    #[serde(default)]
    pub offence_severity: Severity,
    #[serde(default)]
    pub dedup_cooldown_minutes: Option<u32>,
}

fn default_enabled() -> bool {
    true
}

impl RuleDraft {
    /// Create an indicator-match rule draft
    pub fn ioc_match(
        name: &str,
        field: EventField,
        ioc_type: IndicatorType,
        title_template: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            enabled: true,
            event_source_types: Vec::new(),
            kind: RuleKind::IocMatch(IocMatchConfig {
                event_field_to_match: field,
                ioc_type_to_match: ioc_type,
                ioc_tags_match: Vec::new(),
                ioc_min_confidence: None,
            }),
            offence_title_template: title_template.to_string(),
            offence_severity: Severity::Medium,
            dedup_cooldown_minutes: None,
        }
    }

    /// Create a threshold rule draft
    pub fn threshold(
        name: &str,
        count: u32,
        window_minutes: u32,
        aggregation_fields: Vec<EventField>,
        title_template: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            enabled: true,
            event_source_types: Vec::new(),
            kind: RuleKind::Threshold(ThresholdConfig {
                threshold_count: count,
                threshold_window_minutes: window_minutes,
                aggregation_fields,
            }),
            offence_title_template: title_template.to_string(),
            offence_severity: Severity::Medium,
            dedup_cooldown_minutes: None,
        }
    }

    pub fn with_description(mut self, desc: &str) -> Self {
        self.description = Some(desc.to_string());
        self
    }

    pub fn with_source_types(mut self, types: Vec<&str>) -> Self {
        self.event_source_types = types.into_iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.offence_severity = severity;
        self
    }

    pub fn with_min_confidence(mut self, confidence: u8) -> Self {
        if let RuleKind::IocMatch(ref mut cfg) = self.kind {
            cfg.ioc_min_confidence = Some(confidence);
        }
        self
    }

    pub fn with_ioc_tags(mut self, tags: Vec<&str>) -> Self {
        if let RuleKind::IocMatch(ref mut cfg) = self.kind {
            cfg.ioc_tags_match = tags.into_iter().map(|s| s.to_string()).collect();
        }
        self
    }

    pub fn with_dedup_cooldown(mut self, minutes: u32) -> Self {
        self.dedup_cooldown_minutes = Some(minutes);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Validate the draft before it enters the registry
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.trim().len() < 3 {
            return Err(EngineError::validation(
                "rule name must be at least 3 characters",
            ));
        }
        if self.offence_title_template.trim().is_empty() {
            return Err(EngineError::validation(
                "offence_title_template must not be empty",
            ));
        }
        match &self.kind {
            RuleKind::IocMatch(cfg) => {
                if let Some(c) = cfg.ioc_min_confidence {
                    if c > 100 {
                        return Err(EngineError::validation(
                            "ioc_min_confidence must be between 0 and 100",
                        ));
                    }
                }
            }
            RuleKind::Threshold(cfg) => {
                if cfg.threshold_count == 0 {
                    return Err(EngineError::validation("threshold_count must be > 0"));
                }
                if cfg.threshold_window_minutes == 0 {
                    return Err(EngineError::validation(
                        "threshold_window_minutes must be > 0",
                    ));
                }
                if cfg.aggregation_fields.is_empty() {
                    return Err(EngineError::validation(
                        "aggregation_fields must not be empty",
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Partial update of a rule; `kind` replacement swaps the whole variant
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub enabled: Option<bool>,
    pub event_source_types: Option<Vec<String>>,
    pub kind: Option<RuleKind>,
    pub offence_title_template: Option<String>,
    pub offence_severity: Option<Severity>,
    pub dedup_cooldown_minutes: Option<Option<u32>>,
}
