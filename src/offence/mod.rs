//! Offences
//!
//! An offence is the incident record produced when a correlation rule
//! fires. The evaluator only appends through `commit`, which applies a
//! per-key suppression cooldown; analysts mutate status, severity and
//! notes afterwards. The engine never deletes an offence.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::{SharedClock, Severity};
use crate::error::{EngineError, Result};

/// Analyst-facing offence lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffenceStatus {
    New,
    InProgress,
    ClosedFalsePositive,
    ClosedTruePositive,
    ClosedOther,
}

impl OffenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffenceStatus::New => "new",
            OffenceStatus::InProgress => "in_progress",
            OffenceStatus::ClosedFalsePositive => "closed_false_positive",
            OffenceStatus::ClosedTruePositive => "closed_true_positive",
            OffenceStatus::ClosedOther => "closed_other",
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            OffenceStatus::ClosedFalsePositive
                | OffenceStatus::ClosedTruePositive
                | OffenceStatus::ClosedOther
        )
    }
}

impl Default for OffenceStatus {
    fn default() -> Self {
        OffenceStatus::New
    }
}

/// A persisted offence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offence {
    pub id: Uuid,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub severity: Severity,
    pub status: OffenceStatus,
    pub correlation_rule_id: u64,
    pub detected_at: DateTime<Utc>,
    /// Snapshot of the causing event or aggregate
    #[serde(default)]
    pub triggering_event_summary: Option<serde_json::Value>,
    /// Snapshot of the matched indicator, when applicable
    #[serde(default)]
    pub matched_ioc_details: Option<serde_json::Value>,
    #[serde(default)]
    pub attributed_apt_group_ids: Vec<u64>,
    #[serde(default)]
    pub notes: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Offence candidate emitted by the evaluator, not yet deduplicated
#[derive(Debug, Clone)]
pub struct OffenceDraft {
    pub title: String,
    pub description: Option<String>,
    pub severity: Severity,
    pub correlation_rule_id: u64,
    pub detected_at: DateTime<Utc>,
    pub triggering_event_summary: Option<serde_json::Value>,
    pub matched_ioc_details: Option<serde_json::Value>,
    pub attributed_apt_group_ids: Vec<u64>,
    /// Suppression key: rule + aggregation key, or rule + indicator value
    pub dedup_key: String,
    /// Suppression window for this draft's rule
    pub dedup_cooldown: Duration,
}

/// Result of committing a draft
#[derive(Debug, Clone)]
pub enum CommitOutcome {
    Created(Offence),
    /// A recent offence for the same dedup key already exists
    Suppressed,
}

/// Analyst update payload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OffenceUpdate {
    pub status: Option<OffenceStatus>,
    pub severity: Option<Severity>,
    pub notes: Option<String>,
}

/// Store statistics
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct OffenceStats {
    pub created: u64,
    pub suppressed: u64,
}

/// Offence store with per-key atomic dedup
pub struct OffenceStore {
    offences: RwLock<Vec<Offence>>,
    /// Last creation time per dedup key
    dedup: DashMap<String, DateTime<Utc>>,
    stats: RwLock<OffenceStats>,
    clock: SharedClock,
}

impl OffenceStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            offences: RwLock::new(Vec::new()),
            dedup: DashMap::new(),
            stats: RwLock::new(OffenceStats::default()),
            clock,
        }
    }

    /// Commit a draft, creating an offence unless the dedup window
    /// suppresses it. The check-and-set for one dedup key is atomic: the
    /// map entry stays locked across it.
    pub fn commit(&self, draft: OffenceDraft) -> CommitOutcome {
        match self.dedup.entry(draft.dedup_key.clone()) {
            Entry::Occupied(mut entry) => {
                let since_last = draft.detected_at - *entry.get();
                if since_last >= Duration::zero() && since_last < draft.dedup_cooldown {
                    self.stats.write().suppressed += 1;
                    debug!(key = %draft.dedup_key, "offence suppressed by dedup window");
                    return CommitOutcome::Suppressed;
                }
                entry.insert(draft.detected_at);
            }
            Entry::Vacant(entry) => {
                entry.insert(draft.detected_at);
            }
        }

        let offence = Offence {
            id: Uuid::new_v4(),
            title: draft.title,
            description: draft.description,
            severity: draft.severity,
            status: OffenceStatus::New,
            correlation_rule_id: draft.correlation_rule_id,
            detected_at: draft.detected_at,
            triggering_event_summary: draft.triggering_event_summary,
            matched_ioc_details: draft.matched_ioc_details,
            attributed_apt_group_ids: draft.attributed_apt_group_ids,
            notes: None,
            updated_at: draft.detected_at,
        };
        info!(
            offence_id = %offence.id,
            rule_id = offence.correlation_rule_id,
            severity = %offence.severity,
            title = %offence.title,
            "offence created"
        );
        self.offences.write().push(offence.clone());
        self.stats.write().created += 1;
        CommitOutcome::Created(offence)
    }

    pub fn get(&self, id: Uuid) -> Option<Offence> {
        self.offences.read().iter().find(|o| o.id == id).cloned()
    }

    /// List offences newest first
    pub fn list(&self, skip: usize, limit: usize) -> Vec<Offence> {
        let offences = self.offences.read();
        let mut sorted: Vec<Offence> = offences.clone();
        sorted.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        sorted.into_iter().skip(skip).take(limit).collect()
    }

    /// Apply an analyst update; status is the only mandatory field
    pub fn update(&self, id: Uuid, update: OffenceUpdate) -> Result<Offence> {
        let mut offences = self.offences.write();
        let offence = offences
            .iter_mut()
            .find(|o| o.id == id)
            .ok_or_else(|| EngineError::not_found("offence", id))?;

        if let Some(status) = update.status {
            offence.status = status;
        }
        if let Some(severity) = update.severity {
            offence.severity = severity;
        }
        if let Some(notes) = update.notes {
            offence.notes = Some(notes);
        }
        offence.updated_at = self.clock.now();
        Ok(offence.clone())
    }

    pub fn count(&self) -> usize {
        self.offences.read().len()
    }

    pub fn stats(&self) -> OffenceStats {
        *self.stats.read()
    }

    /// Offence counts per severity over the trailing period
    pub fn summary_by_severity(&self, days_back: i64) -> HashMap<String, usize> {
        let cutoff = self.clock.now() - Duration::days(days_back);
        let mut summary: HashMap<String, usize> = HashMap::new();
        for severity in [
            Severity::Low,
            Severity::Medium,
            Severity::High,
            Severity::Critical,
        ] {
            summary.insert(severity.as_str().to_string(), 0);
        }
        for offence in self.offences.read().iter() {
            if offence.detected_at >= cutoff {
                *summary.entry(offence.severity.as_str().to_string()).or_default() += 1;
            }
        }
        summary
    }

    /// Most recent offences
    pub fn recent(&self, limit: usize) -> Vec<Offence> {
        self.list(0, limit)
    }
}
