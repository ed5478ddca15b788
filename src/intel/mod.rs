//! Threat intelligence indicators
//!
//! Indicator of Compromise (IoC) types and the lookup contract the
//! correlation evaluator consumes. Ingestion/fetching of indicator feeds
//! is an external collaborator; the engine only queries active
//! indicators by value and type.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Type of Indicator of Compromise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndicatorType {
    #[serde(rename = "ipv4-addr")]
    Ipv4Addr,
    #[serde(rename = "ipv6-addr")]
    Ipv6Addr,
    #[serde(rename = "domain-name")]
    DomainName,
    #[serde(rename = "url")]
    Url,
    #[serde(rename = "file-hash-md5")]
    Md5Hash,
    #[serde(rename = "file-hash-sha1")]
    Sha1Hash,
    #[serde(rename = "file-hash-sha256")]
    Sha256Hash,
    #[serde(rename = "email-addr")]
    EmailAddr,
}

impl IndicatorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndicatorType::Ipv4Addr => "ipv4-addr",
            IndicatorType::Ipv6Addr => "ipv6-addr",
            IndicatorType::DomainName => "domain-name",
            IndicatorType::Url => "url",
            IndicatorType::Md5Hash => "file-hash-md5",
            IndicatorType::Sha1Hash => "file-hash-sha1",
            IndicatorType::Sha256Hash => "file-hash-sha256",
            IndicatorType::EmailAddr => "email-addr",
        }
    }

    /// Whether this indicator type carries an IP address value
    pub fn is_ip(&self) -> bool {
        matches!(self, IndicatorType::Ipv4Addr | IndicatorType::Ipv6Addr)
    }
}

impl std::fmt::Display for IndicatorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An Indicator of Compromise with attribution metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Indicator {
    /// The indicator value (IP, domain, hash, URL)
    pub value: String,
    /// Indicator type
    #[serde(rename = "type")]
    pub indicator_type: IndicatorType,
    #[serde(default)]
    pub description: Option<String>,
    /// Originating feed/source name
    #[serde(default)]
    pub source_name: Option<String>,
    /// Only active indicators participate in correlation
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Confidence score, 0-100
    #[serde(default)]
    pub confidence: Option<u8>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub first_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    /// Threat actor groups this indicator is attributed to
    #[serde(default)]
    pub attributed_apt_group_ids: Vec<u64>,
}

fn default_true() -> bool {
    true
}

impl Indicator {
    /// Create an indicator with minimal fields
    pub fn new(indicator_type: IndicatorType, value: &str) -> Self {
        Self {
            value: value.to_string(),
            indicator_type,
            description: None,
            source_name: None,
            is_active: true,
            confidence: None,
            tags: Vec::new(),
            first_seen: None,
            last_seen: None,
            attributed_apt_group_ids: Vec::new(),
        }
    }

    pub fn with_confidence(mut self, confidence: u8) -> Self {
        self.confidence = Some(confidence.min(100));
        self
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tags.push(tag.to_string());
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source_name = Some(source.to_string());
        self
    }

    pub fn with_apt_groups(mut self, ids: Vec<u64>) -> Self {
        self.attributed_apt_group_ids = ids;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Check confidence and tag constraints for a rule match
    pub fn satisfies(&self, min_confidence: Option<u8>, required_tags: &[String]) -> bool {
        if let Some(min) = min_confidence {
            match self.confidence {
                Some(c) if c >= min => {}
                _ => return false,
            }
        }
        required_tags.iter().all(|t| self.tags.contains(t))
    }

    /// Opaque snapshot stored on offences that matched this indicator
    pub fn details(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Point query over active indicators
///
/// Implemented by the indicator store collaborator. A timeout at the call
/// site is treated as no-match by the evaluator, never a cycle failure.
#[async_trait]
pub trait IndicatorLookup: Send + Sync {
    /// Find an active indicator of `indicator_type` with exactly `value`,
    /// satisfying the confidence floor and required tag set.
    async fn find_active(
        &self,
        value: &str,
        indicator_type: IndicatorType,
        min_confidence: Option<u8>,
        required_tags: &[String],
    ) -> Result<Option<Indicator>, EngineError>;
}

/// In-memory indicator store
///
/// Indexed by type then value for O(1) point queries, the same shape the
/// evaluator's upstream builds before a cycle.
#[derive(Default)]
pub struct IndicatorStore {
    by_type: RwLock<HashMap<IndicatorType, HashMap<String, Indicator>>>,
}

impl IndicatorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, indicator: Indicator) {
        self.by_type
            .write()
            .entry(indicator.indicator_type)
            .or_default()
            .insert(indicator.value.clone(), indicator);
    }

    pub fn extend(&self, indicators: impl IntoIterator<Item = Indicator>) {
        let mut map = self.by_type.write();
        for indicator in indicators {
            map.entry(indicator.indicator_type)
                .or_default()
                .insert(indicator.value.clone(), indicator);
        }
    }

    pub fn count(&self) -> usize {
        self.by_type.read().values().map(|m| m.len()).sum()
    }

    /// List indicators with pagination, insertion order not guaranteed
    pub fn list(&self, skip: usize, limit: usize) -> Vec<Indicator> {
        self.by_type
            .read()
            .values()
            .flat_map(|m| m.values().cloned())
            .skip(skip)
            .take(limit)
            .collect()
    }
}

#[async_trait]
impl IndicatorLookup for IndicatorStore {
    async fn find_active(
        &self,
        value: &str,
        indicator_type: IndicatorType,
        min_confidence: Option<u8>,
        required_tags: &[String],
    ) -> Result<Option<Indicator>, EngineError> {
        let map = self.by_type.read();
        let found = map
            .get(&indicator_type)
            .and_then(|by_value| by_value.get(value))
            .filter(|i| i.is_active)
            .filter(|i| i.satisfies(min_confidence, required_tags))
            .cloned();
        Ok(found)
    }
}
