//! End-to-end cycle: seed rules, load intel, correlate a batch, and run
//! the linked response pipeline.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use siemcor::config::Config;
use siemcor::core::Event;
use siemcor::intel::{Indicator, IndicatorType};
use siemcor::offence::{OffenceStatus, OffenceUpdate};
use siemcor::response::{
    ActionDraft, ExecutionStatus, PipelineActionConfig, PipelineDraft, ResponseActionType,
};
use siemcor::SiemCore;

fn t0() -> DateTime<Utc> {
    "2024-03-01T10:00:00Z".parse().unwrap()
}

fn auth_failure(minute: i64, username: &str) -> Event {
    Event::new("syslog_auth_failure", t0() + Duration::minutes(minute))
        .with_username(username)
        .with_destination_ip("10.0.0.2".parse().unwrap())
}

#[tokio::test]
async fn full_cycle_with_default_rules_and_response() {
    let engine = SiemCore::new(&Config::default());

    let seed = engine.load_default_rules().unwrap();
    assert_eq!(seed.created, 4);
    // Seeding again changes nothing
    let again = engine.load_default_rules().unwrap();
    assert_eq!(again.created, 0);
    assert_eq!(again.skipped, 4);

    engine.intel().insert(
        Indicator::new(IndicatorType::Ipv4Addr, "203.0.113.9")
            .with_tag("c2")
            .with_confidence(85),
    );

    // Link a containment pipeline to the C2 rule
    let c2_rule = engine
        .rules()
        .find_by_name("Known C2 source address")
        .expect("seeded rule present");
    let block = engine
        .actions()
        .create(
            ActionDraft::new("Block source", ResponseActionType::BlockIp)
                .with_default_params(json!({ "duration_minutes": 60 })),
        )
        .unwrap();
    let ticket = engine
        .actions()
        .create(ActionDraft::new("Open ticket", ResponseActionType::CreateTicket))
        .unwrap();
    engine
        .pipelines()
        .create(
            PipelineDraft::new(
                "Contain C2 contact",
                vec![
                    PipelineActionConfig {
                        action_id: block.id,
                        order: 1,
                        action_params_template: json!({
                            "ip_address": "{offence.matched_ioc_details.value}"
                        })
                        .try_into()
                        .unwrap(),
                    },
                    PipelineActionConfig {
                        action_id: ticket.id,
                        order: 2,
                        action_params_template: json!({
                            "title": "Investigate {offence.title}"
                        })
                        .try_into()
                        .unwrap(),
                    },
                ],
            )
            .with_trigger_rule(c2_rule.id),
            engine.actions(),
            engine.rules(),
        )
        .unwrap();

    // Batch: one C2 contact plus a brute-force burst against one account
    let mut events = vec![Event::new("netflow", t0())
        .with_source_ip("203.0.113.9".parse().unwrap())];
    for i in 0..5 {
        events.push(auth_failure(i, "admin"));
    }

    let report = engine.run_cycle(&events).await;

    // C2 match and the 5-failure threshold each created one offence
    assert_eq!(report.correlation.offences_created, 2);
    assert_eq!(report.correlation.rules_failed, 0);

    // The pipeline ran for the C2 offence, both steps in order
    assert_eq!(report.executions.len(), 1);
    let execution = &report.executions[0];
    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(execution.steps.len(), 2);
    assert_eq!(execution.steps[0].params["ip_address"], "203.0.113.9");
    assert_eq!(execution.steps[0].params["duration_minutes"], 60);
    assert!(execution.steps[1].params["title"]
        .as_str()
        .unwrap()
        .starts_with("Investigate "));

    // Re-running the same batch is fully suppressed by dedup
    let repeat = engine.run_cycle(&events).await;
    assert_eq!(repeat.correlation.offences_created, 0);
    assert!(repeat.executions.is_empty());

    // Analyst closes the C2 offence
    let offence = engine
        .offences()
        .list(0, 10)
        .into_iter()
        .find(|o| o.correlation_rule_id == c2_rule.id)
        .expect("c2 offence exists");
    let closed = engine
        .offences()
        .update(
            offence.id,
            OffenceUpdate {
                status: Some(OffenceStatus::ClosedTruePositive),
                severity: None,
                notes: Some("Blocked at the edge".to_string()),
            },
        )
        .unwrap();
    assert!(closed.status.is_closed());

    // Manual re-run of the pipeline against the closed offence
    let manual = engine
        .execute_for_offence(offence.id, Some(1))
        .await
        .unwrap();
    assert_eq!(manual.len(), 1);
    assert_eq!(manual[0].status, ExecutionStatus::Success);
    assert_eq!(engine.executor().history_for_offence(offence.id).len(), 2);

    // Operator fires a single ad-hoc action at the same offence
    let adhoc = engine
        .execute_adhoc_action(
            offence.id,
            ticket.id,
            json!({ "title": "Follow-up on {offence.title}" })
                .try_into()
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(adhoc.pipeline_id, None);
    assert_eq!(adhoc.status, ExecutionStatus::Success);
    assert_eq!(engine.executor().history_for_offence(offence.id).len(), 3);
}

#[tokio::test]
async fn threshold_burst_after_window_fires_again() {
    let engine = SiemCore::new(&Config::default());
    engine.load_default_rules().unwrap();

    // Recent timestamps so the severity summary's cutoff covers them
    let base = Utc::now() - Duration::hours(2);
    let failure = |minute: i64| {
        Event::new("syslog_auth_failure", base + Duration::minutes(minute))
            .with_username("root")
            .with_destination_ip("10.0.0.2".parse().unwrap())
    };

    let burst: Vec<Event> = (0..5).map(failure).collect();
    let first = engine.run_cycle(&burst).await;
    assert_eq!(first.correlation.offences_created, 1);

    // A second burst past both the window and the dedup cooldown
    let later: Vec<Event> = (60..65).map(failure).collect();
    let second = engine.run_cycle(&later).await;
    assert_eq!(second.correlation.offences_created, 1);

    let summary = engine.offences().summary_by_severity(7);
    assert_eq!(summary["medium"], 2);
}
