//! Rule registry
//!
//! Owns validated correlation rules. The evaluator only ever sees
//! snapshots, so definitions cannot mutate under a running cycle.

pub mod defaults;
pub mod rule;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

use crate::error::{EngineError, Result};

pub use rule::{CorrelationRule, IocMatchConfig, RuleDraft, RuleKind, RuleUpdate, ThresholdConfig};

/// Outcome of seeding the default rule library
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SeedReport {
    pub created: usize,
    pub skipped: usize,
}

/// Registry of correlation rules, keyed by ascending id
#[derive(Default)]
pub struct RuleRegistry {
    rules: RwLock<BTreeMap<u64, CorrelationRule>>,
    next_id: AtomicU64,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Validate and store a new rule
    pub fn create(&self, draft: RuleDraft) -> Result<CorrelationRule> {
        draft.validate()?;
        let now = Utc::now();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let rule = CorrelationRule {
            id,
            name: draft.name,
            description: draft.description,
            enabled: draft.enabled,
            event_source_types: draft.event_source_types,
            kind: draft.kind,
            offence_title_template: draft.offence_title_template,
            offence_severity: draft.offence_severity,
            dedup_cooldown_minutes: draft.dedup_cooldown_minutes,
            created_at: now,
            updated_at: now,
        };
        self.rules.write().insert(id, rule.clone());
        info!(rule_id = id, name = %rule.name, "correlation rule created");
        Ok(rule)
    }

    pub fn get(&self, id: u64) -> Option<CorrelationRule> {
        self.rules.read().get(&id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<CorrelationRule> {
        self.rules.read().values().find(|r| r.name == name).cloned()
    }

    /// List rules in ascending id order
    pub fn list(&self, skip: usize, limit: usize, only_enabled: bool) -> Vec<CorrelationRule> {
        self.rules
            .read()
            .values()
            .filter(|r| !only_enabled || r.enabled)
            .skip(skip)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Apply a partial update; the result is re-validated as a whole
    pub fn update(&self, id: u64, update: RuleUpdate) -> Result<CorrelationRule> {
        let mut rules = self.rules.write();
        let rule = rules
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("rule", id))?;

        let mut updated = rule;
        if let Some(name) = update.name {
            updated.name = name;
        }
        if let Some(description) = update.description {
            updated.description = Some(description);
        }
        if let Some(enabled) = update.enabled {
            updated.enabled = enabled;
        }
        if let Some(types) = update.event_source_types {
            updated.event_source_types = types;
        }
        if let Some(kind) = update.kind {
            updated.kind = kind;
        }
        if let Some(template) = update.offence_title_template {
            updated.offence_title_template = template;
        }
        if let Some(severity) = update.offence_severity {
            updated.offence_severity = severity;
        }
        if let Some(cooldown) = update.dedup_cooldown_minutes {
            updated.dedup_cooldown_minutes = cooldown;
        }
        updated.updated_at = Utc::now();

        // Re-run draft validation against the merged state
        let as_draft = RuleDraft {
            name: updated.name.clone(),
            description: updated.description.clone(),
            enabled: updated.enabled,
            event_source_types: updated.event_source_types.clone(),
            kind: updated.kind.clone(),
            offence_title_template: updated.offence_title_template.clone(),
            offence_severity: updated.offence_severity,
            dedup_cooldown_minutes: updated.dedup_cooldown_minutes,
        };
        as_draft.validate()?;

        rules.insert(id, updated.clone());
        Ok(updated)
    }

    pub fn delete(&self, id: u64) -> bool {
        self.rules.write().remove(&id).is_some()
    }

    pub fn count(&self) -> usize {
        self.rules.read().len()
    }

    /// Copy-on-read snapshot of enabled rules for one evaluation cycle,
    /// ascending id order
    pub fn snapshot_enabled(&self) -> Vec<CorrelationRule> {
        self.rules
            .read()
            .values()
            .filter(|r| r.enabled)
            .cloned()
            .collect()
    }

    /// Seed the built-in rule library; rules already present (by name)
    /// are skipped, so repeated runs create nothing
    pub fn load_default_rules(&self) -> Result<SeedReport> {
        let mut report = SeedReport::default();
        for draft in defaults::default_rules() {
            if self.find_by_name(&draft.name).is_some() {
                report.skipped += 1;
                continue;
            }
            self.create(draft)?;
            report.created += 1;
        }
        info!(
            created = report.created,
            skipped = report.skipped,
            "default rule seeding complete"
        );
        Ok(report)
    }
}
