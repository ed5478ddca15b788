//! Normalized security events
//!
//! Unified event format produced by the ingestion collaborators (syslog,
//! netflow, agents). The attribute set is open: every field except
//! `category` and `timestamp` is optional, and unrecognized attributes
//! land in `extra`.

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Severity levels for generated offences
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Severity {
    Low = 0,
    Medium = 1,
    High = 2,
    Critical = 3,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Medium
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event attributes a rule can match or aggregate on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventField {
    SourceIp,
    DestinationIp,
    Username,
    Hostname,
    Message,
    #[serde(rename = "network_bytes_total")]
    BytesTotal,
}

impl EventField {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventField::SourceIp => "source_ip",
            EventField::DestinationIp => "destination_ip",
            EventField::Username => "username",
            EventField::Hostname => "hostname",
            EventField::Message => "message",
            EventField::BytesTotal => "network_bytes_total",
        }
    }
}

impl std::fmt::Display for EventField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized event entering the correlation engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event ID
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Event category tag (e.g. "syslog_auth_failure", "netflow")
    pub category: String,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub source_ip: Option<IpAddr>,
    #[serde(default)]
    pub destination_ip: Option<IpAddr>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub bytes_total: Option<u64>,
    /// Reporter address, if the event was relayed
    #[serde(default)]
    pub reporter_ip: Option<IpAddr>,
    /// Any additional attributes carried by the source
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

impl Event {
    /// Create an event with the required fields
    pub fn new(category: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            category: category.to_string(),
            timestamp,
            source_ip: None,
            destination_ip: None,
            username: None,
            hostname: None,
            message: None,
            bytes_total: None,
            reporter_ip: None,
            extra: HashMap::new(),
        }
    }

    pub fn with_source_ip(mut self, ip: IpAddr) -> Self {
        self.source_ip = Some(ip);
        self
    }

    pub fn with_destination_ip(mut self, ip: IpAddr) -> Self {
        self.destination_ip = Some(ip);
        self
    }

    pub fn with_username(mut self, username: &str) -> Self {
        self.username = Some(username.to_string());
        self
    }

    pub fn with_hostname(mut self, hostname: &str) -> Self {
        self.hostname = Some(hostname.to_string());
        self
    }

    pub fn with_message(mut self, message: &str) -> Self {
        self.message = Some(message.to_string());
        self
    }

    pub fn with_bytes_total(mut self, bytes: u64) -> Self {
        self.bytes_total = Some(bytes);
        self
    }

    pub fn with_extra(mut self, key: &str, value: &str) -> Self {
        self.extra.insert(key.to_string(), value.to_string());
        self
    }

    /// Extract a typed field as a string, if present
    pub fn field(&self, field: EventField) -> Option<String> {
        match field {
            EventField::SourceIp => self.source_ip.map(|ip| ip.to_string()),
            EventField::DestinationIp => self.destination_ip.map(|ip| ip.to_string()),
            EventField::Username => self.username.clone(),
            EventField::Hostname => self.hostname.clone(),
            EventField::Message => self.message.clone(),
            EventField::BytesTotal => self.bytes_total.map(|b| b.to_string()),
        }
    }

    /// Look up a field by its wire name, falling back to `extra`
    pub fn field_by_name(&self, name: &str) -> Option<String> {
        match name {
            "source_ip" => self.field(EventField::SourceIp),
            "destination_ip" => self.field(EventField::DestinationIp),
            "username" => self.field(EventField::Username),
            "hostname" => self.field(EventField::Hostname),
            "message" => self.field(EventField::Message),
            "network_bytes_total" | "bytes_total" => self.field(EventField::BytesTotal),
            "category" | "event_category" => Some(self.category.clone()),
            "reporter_ip" => self.reporter_ip.map(|ip| ip.to_string()),
            "timestamp" => Some(self.timestamp.to_rfc3339()),
            other => self.extra.get(other).cloned(),
        }
    }

    /// Compact snapshot of the event for offence records
    pub fn summary(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert("timestamp".into(), self.timestamp.to_rfc3339().into());
        map.insert("event_category".into(), self.category.clone().into());
        for field in [
            EventField::SourceIp,
            EventField::DestinationIp,
            EventField::Username,
            EventField::Hostname,
            EventField::Message,
        ] {
            if let Some(value) = self.field(field) {
                // Ingest layer caps summary values at 250 chars
                let capped: String = value.chars().take(250).collect();
                map.insert(field.as_str().into(), capped.into());
            }
        }
        if let Some(ip) = self.reporter_ip {
            map.insert("reporter_ip".into(), ip.to_string().into());
        }
        serde_json::Value::Object(map)
    }
}
