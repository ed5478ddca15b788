//! Correlation evaluation
//!
//! One cycle takes a batch of normalized events and a snapshot of enabled
//! rules, evaluates every rule against the batch, and commits offence
//! drafts to the store. A failing rule is isolated: it is logged and
//! counted, and the cycle continues with the next rule.

pub mod template;
pub mod window;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::core::{CancelFlag, Event};
use crate::error::{EngineError, Result};
use crate::intel::{Indicator, IndicatorLookup};
use crate::offence::{CommitOutcome, OffenceDraft, OffenceStore};
use crate::rules::{CorrelationRule, IocMatchConfig, RuleKind, ThresholdConfig};

pub use template::{RenderContext, TemplateRenderer};
pub use window::{ThresholdWindowStore, WindowOutcome};

/// Tuning knobs for the evaluator
#[derive(Debug, Clone)]
pub struct EvaluatorSettings {
    /// Per-lookup deadline; a timed-out lookup counts as no match
    pub lookup_timeout: StdDuration,
    /// Maximum indicator lookups in flight at once
    pub lookup_concurrency: usize,
    /// Suppression cooldown for rules without their own override
    pub default_dedup_cooldown: Duration,
}

impl Default for EvaluatorSettings {
    fn default() -> Self {
        Self {
            lookup_timeout: StdDuration::from_secs(2),
            lookup_concurrency: 16,
            default_dedup_cooldown: Duration::minutes(10),
        }
    }
}

/// Outcome counters for one cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleSummary {
    pub events_scanned: usize,
    pub rules_evaluated: usize,
    pub rules_failed: usize,
    pub lookup_timeouts: usize,
    pub contention_skips: usize,
    pub offences_created: usize,
    pub offences_suppressed: usize,
    /// True when a cancel request stopped the cycle before every rule ran
    pub cancelled: bool,
    /// Ids of offences created during this cycle, in creation order
    pub created_offence_ids: Vec<uuid::Uuid>,
}

enum LookupOutcome {
    Matched(Indicator),
    NoMatch,
    TimedOut,
    Failed(String),
}

/// Evaluates rule snapshots against event batches
pub struct CorrelationEvaluator {
    intel: Arc<dyn IndicatorLookup>,
    windows: Arc<ThresholdWindowStore>,
    offences: Arc<OffenceStore>,
    renderer: TemplateRenderer,
    settings: EvaluatorSettings,
    cancel: CancelFlag,
}

impl CorrelationEvaluator {
    pub fn new(
        intel: Arc<dyn IndicatorLookup>,
        windows: Arc<ThresholdWindowStore>,
        offences: Arc<OffenceStore>,
        settings: EvaluatorSettings,
    ) -> Self {
        Self {
            intel,
            windows,
            offences,
            renderer: TemplateRenderer::new(),
            settings,
            cancel: CancelFlag::new(),
        }
    }

    /// Share an externally owned cancel flag
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Evaluate one batch against a rule snapshot.
    ///
    /// Rules run in ascending id order. Threshold rules are sequential so
    /// that window state advances deterministically; indicator-match rules
    /// fan their lookups out under a concurrency cap and fold the results
    /// back in event order.
    pub async fn run_cycle(
        &self,
        events: &[Event],
        mut rules: Vec<CorrelationRule>,
    ) -> CycleSummary {
        rules.sort_by_key(|r| r.id);
        let mut summary = CycleSummary {
            events_scanned: events.len(),
            ..CycleSummary::default()
        };

        for rule in &rules {
            if self.cancel.is_cancelled() {
                warn!(
                    next_rule_id = rule.id,
                    "cycle cancelled, remaining rules not evaluated"
                );
                summary.cancelled = true;
                break;
            }
            if !rule.enabled {
                continue;
            }
            summary.rules_evaluated += 1;
            let result = match &rule.kind {
                RuleKind::IocMatch(cfg) => {
                    self.evaluate_ioc_match(rule, cfg, events, &mut summary).await
                }
                RuleKind::Threshold(cfg) => {
                    self.evaluate_threshold(rule, cfg, events, &mut summary)
                }
            };
            if let Err(err) = result {
                summary.rules_failed += 1;
                error!(rule_id = rule.id, rule = %rule.name, %err, "rule evaluation failed");
            }
        }

        info!(
            events = summary.events_scanned,
            rules = summary.rules_evaluated,
            failed = summary.rules_failed,
            created = summary.offences_created,
            suppressed = summary.offences_suppressed,
            "correlation cycle finished"
        );
        summary
    }

    async fn evaluate_ioc_match(
        &self,
        rule: &CorrelationRule,
        cfg: &IocMatchConfig,
        events: &[Event],
        summary: &mut CycleSummary,
    ) -> Result<()> {
        // Candidate events carrying a value for the matched field
        let candidates: Vec<(usize, String)> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| rule.applies_to_category(&e.category))
            .filter_map(|(i, e)| e.field(cfg.event_field_to_match).map(|v| (i, v)))
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }

        let semaphore = Arc::new(Semaphore::new(self.settings.lookup_concurrency.max(1)));
        let mut tasks: JoinSet<(usize, LookupOutcome)> = JoinSet::new();
        for (index, value) in &candidates {
            let index = *index;
            let value = value.clone();
            let intel = Arc::clone(&self.intel);
            let semaphore = Arc::clone(&semaphore);
            let ioc_type = cfg.ioc_type_to_match;
            let min_confidence = cfg.ioc_min_confidence;
            let required_tags = cfg.ioc_tags_match.clone();
            let deadline = self.settings.lookup_timeout;
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let outcome = match timeout(
                    deadline,
                    intel.find_active(&value, ioc_type, min_confidence, &required_tags),
                )
                .await
                {
                    Ok(Ok(Some(indicator))) => LookupOutcome::Matched(indicator),
                    Ok(Ok(None)) => LookupOutcome::NoMatch,
                    Ok(Err(err)) => LookupOutcome::Failed(err.to_string()),
                    Err(_) => LookupOutcome::TimedOut,
                };
                (index, outcome)
            });
        }

        // Collect all results, then apply them in event order
        let mut outcomes: Vec<(usize, LookupOutcome)> = Vec::with_capacity(candidates.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(pair) => outcomes.push(pair),
                Err(err) => {
                    return Err(EngineError::RuleEvaluation {
                        rule_id: rule.id,
                        reason: format!("lookup task panicked: {err}"),
                    });
                }
            }
        }
        outcomes.sort_by_key(|(index, _)| *index);

        for (index, outcome) in outcomes {
            let event = &events[index];
            match outcome {
                LookupOutcome::Matched(indicator) => {
                    self.commit_ioc_offence(rule, event, &indicator, summary);
                }
                LookupOutcome::NoMatch => {}
                LookupOutcome::TimedOut => {
                    summary.lookup_timeouts += 1;
                    let err = EngineError::LookupTimeout {
                        timeout_ms: self.settings.lookup_timeout.as_millis() as u64,
                    };
                    warn!(rule_id = rule.id, event_id = %event.id, %err, "treating as no match");
                }
                LookupOutcome::Failed(reason) => {
                    warn!(rule_id = rule.id, event_id = %event.id, %reason, "indicator lookup failed");
                }
            }
        }
        Ok(())
    }

    fn commit_ioc_offence(
        &self,
        rule: &CorrelationRule,
        event: &Event,
        indicator: &Indicator,
        summary: &mut CycleSummary,
    ) {
        let ctx = RenderContext::new()
            .with_event(event)
            .with_indicator(indicator);
        let title = self.renderer.render(&rule.offence_title_template, &ctx);
        let draft = OffenceDraft {
            title,
            description: rule.description.clone(),
            severity: rule.offence_severity,
            correlation_rule_id: rule.id,
            detected_at: event.timestamp,
            triggering_event_summary: Some(event.summary()),
            matched_ioc_details: Some(indicator.details()),
            attributed_apt_group_ids: indicator.attributed_apt_group_ids.clone(),
            dedup_key: format!("rule:{}:ioc:{}", rule.id, indicator.value),
            dedup_cooldown: self.cooldown_for(rule),
        };
        self.apply_commit(draft, summary);
    }

    fn evaluate_threshold(
        &self,
        rule: &CorrelationRule,
        cfg: &ThresholdConfig,
        events: &[Event],
        summary: &mut CycleSummary,
    ) -> Result<()> {
        let window = Duration::minutes(i64::from(cfg.threshold_window_minutes));
        for event in events {
            if !rule.applies_to_category(&event.category) {
                continue;
            }
            // Every aggregation field must be present or the event is skipped
            let Some(key) = aggregation_key(event, cfg) else {
                continue;
            };
            match self
                .windows
                .record(rule.id, &key, event.timestamp, window, cfg.threshold_count)
            {
                Ok(WindowOutcome::Fired { count }) => {
                    self.commit_threshold_offence(rule, event, &key, count, summary);
                }
                Ok(WindowOutcome::Accumulated { count }) => {
                    debug!(rule_id = rule.id, %key, count, "threshold accumulating");
                }
                Err(EngineError::ResourceContention { .. }) => {
                    summary.contention_skips += 1;
                    warn!(
                        rule_id = rule.id,
                        %key,
                        "counter lock contention, skipping event for this rule"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn commit_threshold_offence(
        &self,
        rule: &CorrelationRule,
        event: &Event,
        key: &str,
        count: u32,
        summary: &mut CycleSummary,
    ) {
        let ctx = RenderContext::new()
            .with_event(event)
            .with_scope("window", serde_json::json!({ "count": count, "key": key }));
        let title = self.renderer.render(&rule.offence_title_template, &ctx);
        let draft = OffenceDraft {
            title,
            description: rule.description.clone(),
            severity: rule.offence_severity,
            correlation_rule_id: rule.id,
            detected_at: event.timestamp,
            triggering_event_summary: Some(serde_json::json!({
                "aggregation_key": key,
                "event_count": count,
                "last_event": event.summary(),
            })),
            matched_ioc_details: None,
            attributed_apt_group_ids: Vec::new(),
            dedup_key: format!("rule:{}:agg:{}", rule.id, key),
            dedup_cooldown: self.cooldown_for(rule),
        };
        self.apply_commit(draft, summary);
    }

    fn apply_commit(&self, draft: OffenceDraft, summary: &mut CycleSummary) {
        match self.offences.commit(draft) {
            CommitOutcome::Created(offence) => {
                summary.offences_created += 1;
                summary.created_offence_ids.push(offence.id);
            }
            CommitOutcome::Suppressed => summary.offences_suppressed += 1,
        }
    }

    fn cooldown_for(&self, rule: &CorrelationRule) -> Duration {
        rule.dedup_cooldown_minutes
            .map(|m| Duration::minutes(i64::from(m)))
            .unwrap_or(self.settings.default_dedup_cooldown)
    }
}

/// Join the rule's aggregation field values; None when any is missing.
/// The tuple is encoded as a JSON array so a value containing a
/// separator cannot collide with a neighbouring tuple's key.
fn aggregation_key(event: &Event, cfg: &ThresholdConfig) -> Option<String> {
    let mut parts = Vec::with_capacity(cfg.aggregation_fields.len());
    for field in &cfg.aggregation_fields {
        parts.push(event.field(*field)?);
    }
    Some(serde_json::Value::from(parts).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{system_clock, EventField, Severity};
    use crate::intel::{IndicatorStore, IndicatorType};
    use crate::rules::{RuleDraft, RuleRegistry};
    use chrono::{DateTime, Utc};
    use std::net::IpAddr;

    fn t0() -> DateTime<Utc> {
        "2024-03-01T10:00:00Z".parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn make_evaluator(
        intel: Arc<IndicatorStore>,
    ) -> (CorrelationEvaluator, Arc<OffenceStore>) {
        let offences = Arc::new(OffenceStore::new(system_clock()));
        let evaluator = CorrelationEvaluator::new(
            intel,
            Arc::new(ThresholdWindowStore::default()),
            Arc::clone(&offences),
            EvaluatorSettings::default(),
        );
        (evaluator, offences)
    }

    fn ioc_rule(registry: &RuleRegistry) -> CorrelationRule {
        registry
            .create(
                RuleDraft::ioc_match(
                    "C2 source",
                    EventField::SourceIp,
                    IndicatorType::Ipv4Addr,
                    "C2 traffic from {event.source_ip}",
                )
                .with_severity(Severity::High),
            )
            .unwrap()
    }

    fn threshold_rule(registry: &RuleRegistry) -> CorrelationRule {
        registry
            .create(
                RuleDraft::threshold(
                    "Brute force",
                    3,
                    10,
                    vec![EventField::Username, EventField::DestinationIp],
                    "Brute force against {event.username}",
                )
                .with_source_types(vec!["syslog_auth_failure"]),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_ioc_match_creates_offence_with_details() {
        let intel = Arc::new(IndicatorStore::new());
        intel.insert(
            Indicator::new(IndicatorType::Ipv4Addr, "203.0.113.9").with_confidence(80),
        );
        let (evaluator, offences) = make_evaluator(intel);
        let registry = RuleRegistry::new();
        let rules = vec![ioc_rule(&registry)];

        let events = vec![
            Event::new("netflow", t0()).with_source_ip(ip("203.0.113.9")),
            Event::new("netflow", t0()).with_source_ip(ip("10.0.0.1")),
        ];
        let summary = evaluator.run_cycle(&events, rules).await;

        assert_eq!(summary.offences_created, 1);
        let offence = &offences.list(0, 10)[0];
        assert_eq!(offence.title, "C2 traffic from 203.0.113.9");
        assert_eq!(offence.severity, Severity::High);
        assert!(offence.matched_ioc_details.is_some());
    }

    #[tokio::test]
    async fn test_ioc_repeat_match_is_suppressed() {
        let intel = Arc::new(IndicatorStore::new());
        intel.insert(Indicator::new(IndicatorType::Ipv4Addr, "203.0.113.9"));
        let (evaluator, _) = make_evaluator(intel);
        let registry = RuleRegistry::new();
        let rules = vec![ioc_rule(&registry)];

        let events = vec![
            Event::new("netflow", t0()).with_source_ip(ip("203.0.113.9")),
            Event::new("netflow", t0() + Duration::minutes(1))
                .with_source_ip(ip("203.0.113.9")),
        ];
        let summary = evaluator.run_cycle(&events, rules).await;
        assert_eq!(summary.offences_created, 1);
        assert_eq!(summary.offences_suppressed, 1);
    }

    #[tokio::test]
    async fn test_threshold_fires_once_per_window() {
        let (evaluator, offences) = make_evaluator(Arc::new(IndicatorStore::new()));
        let registry = RuleRegistry::new();
        let rules = vec![threshold_rule(&registry)];

        let events: Vec<Event> = (0..3)
            .map(|i| {
                Event::new("syslog_auth_failure", t0() + Duration::minutes(i))
                    .with_username("admin")
                    .with_destination_ip(ip("10.0.0.2"))
            })
            .collect();
        let summary = evaluator.run_cycle(&events, rules).await;

        assert_eq!(summary.offences_created, 1);
        let offence = &offences.list(0, 10)[0];
        assert_eq!(offence.title, "Brute force against admin");
        assert_eq!(
            offence.triggering_event_summary.as_ref().unwrap()["aggregation_key"],
            r#"["admin","10.0.0.2"]"#
        );
    }

    #[tokio::test]
    async fn test_threshold_skips_events_missing_fields() {
        let (evaluator, _) = make_evaluator(Arc::new(IndicatorStore::new()));
        let registry = RuleRegistry::new();
        let rules = vec![threshold_rule(&registry)];

        // No username on any event, so nothing accumulates
        let events: Vec<Event> = (0..5)
            .map(|i| {
                Event::new("syslog_auth_failure", t0() + Duration::minutes(i))
                    .with_destination_ip(ip("10.0.0.2"))
            })
            .collect();
        let summary = evaluator.run_cycle(&events, rules).await;
        assert_eq!(summary.offences_created, 0);
    }

    #[tokio::test]
    async fn test_category_filter_limits_rule_scope() {
        let (evaluator, _) = make_evaluator(Arc::new(IndicatorStore::new()));
        let registry = RuleRegistry::new();
        let rules = vec![threshold_rule(&registry)];

        let events: Vec<Event> = (0..3)
            .map(|i| {
                Event::new("netflow", t0() + Duration::minutes(i))
                    .with_username("admin")
                    .with_destination_ip(ip("10.0.0.2"))
            })
            .collect();
        let summary = evaluator.run_cycle(&events, rules).await;
        assert_eq!(summary.offences_created, 0);
    }

    #[tokio::test]
    async fn test_disabled_rules_are_not_evaluated() {
        let intel = Arc::new(IndicatorStore::new());
        intel.insert(Indicator::new(IndicatorType::Ipv4Addr, "203.0.113.9"));
        let (evaluator, _) = make_evaluator(intel);
        let registry = RuleRegistry::new();
        let mut rule = ioc_rule(&registry);
        rule.enabled = false;

        let events =
            vec![Event::new("netflow", t0()).with_source_ip(ip("203.0.113.9"))];
        let summary = evaluator.run_cycle(&events, vec![rule]).await;
        assert_eq!(summary.rules_evaluated, 0);
        assert_eq!(summary.offences_created, 0);
    }

    struct SlowLookup;

    #[async_trait::async_trait]
    impl IndicatorLookup for SlowLookup {
        async fn find_active(
            &self,
            _value: &str,
            _indicator_type: IndicatorType,
            _min_confidence: Option<u8>,
            _required_tags: &[String],
        ) -> std::result::Result<Option<Indicator>, EngineError> {
            tokio::time::sleep(StdDuration::from_secs(10)).await;
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_lookup_timeout_counts_as_no_match() {
        let offences = Arc::new(OffenceStore::new(system_clock()));
        let evaluator = CorrelationEvaluator::new(
            Arc::new(SlowLookup),
            Arc::new(ThresholdWindowStore::default()),
            Arc::clone(&offences),
            EvaluatorSettings {
                lookup_timeout: StdDuration::from_millis(20),
                ..EvaluatorSettings::default()
            },
        );
        let registry = RuleRegistry::new();
        let rules = vec![ioc_rule(&registry)];

        let events =
            vec![Event::new("netflow", t0()).with_source_ip(ip("203.0.113.9"))];
        let summary = evaluator.run_cycle(&events, rules).await;
        assert_eq!(summary.lookup_timeouts, 1);
        assert_eq!(summary.offences_created, 0);
        assert_eq!(summary.rules_failed, 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_rule_scheduling() {
        let (evaluator, _) = make_evaluator(Arc::new(IndicatorStore::new()));
        let cancel = CancelFlag::new();
        let evaluator = evaluator.with_cancel_flag(cancel.clone());
        let registry = RuleRegistry::new();
        let rules = vec![ioc_rule(&registry), threshold_rule(&registry)];

        cancel.cancel();
        let events =
            vec![Event::new("netflow", t0()).with_source_ip(ip("203.0.113.9"))];
        let summary = evaluator.run_cycle(&events, rules).await;

        assert!(summary.cancelled);
        assert_eq!(summary.rules_evaluated, 0);

        cancel.reset();
        let rules = vec![ioc_rule(&registry)];
        let summary = evaluator.run_cycle(&events, rules).await;
        assert!(!summary.cancelled);
        assert_eq!(summary.rules_evaluated, 1);
    }

    #[tokio::test]
    async fn test_aggregation_tuples_with_separator_chars_stay_distinct() {
        let (evaluator, _) = make_evaluator(Arc::new(IndicatorStore::new()));
        let registry = RuleRegistry::new();
        let rule = registry
            .create(RuleDraft::threshold(
                "Repeated lockouts",
                3,
                10,
                vec![EventField::Username, EventField::Hostname],
                "Lockout burst for {event.username}",
            ))
            .unwrap();

        // ("a|b", "c") twice plus ("a", "b|c") once must not pool into a
        // single counter
        let events = vec![
            Event::new("auth", t0()).with_username("a|b").with_hostname("c"),
            Event::new("auth", t0() + Duration::minutes(1))
                .with_username("a|b")
                .with_hostname("c"),
            Event::new("auth", t0() + Duration::minutes(2))
                .with_username("a")
                .with_hostname("b|c"),
        ];
        let summary = evaluator.run_cycle(&events, vec![rule]).await;
        assert_eq!(summary.offences_created, 0);
    }
}
