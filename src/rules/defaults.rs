//! Built-in rule library
//!
//! Seeded idempotently by name via `RuleRegistry::load_default_rules`.

use crate::core::{EventField, Severity};
use crate::intel::IndicatorType;

use super::rule::RuleDraft;

/// The default rule set shipped with the engine
pub fn default_rules() -> Vec<RuleDraft> {
    vec![
        RuleDraft::ioc_match(
            "Known C2 source address",
            EventField::SourceIp,
            IndicatorType::Ipv4Addr,
            "Traffic from known C2 host {ioc.value} ({event.hostname})",
        )
        .with_description("Source IP of any event matches an active C2 indicator")
        .with_ioc_tags(vec!["c2"])
        .with_min_confidence(60)
        .with_severity(Severity::High),
        RuleDraft::ioc_match(
            "Outbound contact to malicious address",
            EventField::DestinationIp,
            IndicatorType::Ipv4Addr,
            "Outbound connection from {event.source_ip} to {ioc.value}",
        )
        .with_description("Destination IP matches any active IP indicator")
        .with_source_types(vec!["netflow"])
        .with_min_confidence(50)
        .with_severity(Severity::High),
        RuleDraft::threshold(
            "Authentication brute force",
            5,
            10,
            vec![EventField::Username, EventField::DestinationIp],
            "Brute force against {event.username} on {event.destination_ip}",
        )
        .with_description("5+ failed logins for one account on one host inside 10 minutes")
        .with_source_types(vec!["syslog_auth_failure"])
        .with_severity(Severity::Medium),
        RuleDraft::threshold(
            "Possible data exfiltration",
            3,
            15,
            vec![EventField::SourceIp, EventField::DestinationIp],
            "Repeated large transfers {event.source_ip} -> {event.destination_ip}",
        )
        .with_description("Repeated large-volume flows between one host pair")
        .with_source_types(vec!["netflow_large_upload"])
        .with_severity(Severity::Critical),
    ]
}
