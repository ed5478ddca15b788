//! Response actions
//!
//! An action is a configured capability invocation: a type drawn from the
//! fixed capability catalog plus default parameters. Pipelines reference
//! actions by id and may override parameters per step.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::core::SharedClock;
use crate::error::{EngineError, Result};

/// Built-in capability catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseActionType {
    BlockIp,
    UnblockIp,
    SendEmail,
    CreateTicket,
    IsolateHost,
}

impl ResponseActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseActionType::BlockIp => "block_ip",
            ResponseActionType::UnblockIp => "unblock_ip",
            ResponseActionType::SendEmail => "send_email",
            ResponseActionType::CreateTicket => "create_ticket",
            ResponseActionType::IsolateHost => "isolate_host",
        }
    }
}

impl std::fmt::Display for ResponseActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured response action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseAction {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub action_type: ResponseActionType,
    /// Base parameters; pipeline step templates override these per key
    #[serde(default = "empty_object")]
    pub default_params: Value,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn empty_object() -> Value {
    json!({})
}

/// Payload for creating an action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDraft {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub action_type: ResponseActionType,
    #[serde(default = "empty_object")]
    pub default_params: Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ActionDraft {
    pub fn new(name: &str, action_type: ResponseActionType) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            action_type,
            default_params: empty_object(),
            enabled: true,
        }
    }

    pub fn with_default_params(mut self, params: Value) -> Self {
        self.default_params = params;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().len() < 3 {
            return Err(EngineError::validation(
                "action name must be at least 3 characters",
            ));
        }
        if !self.default_params.is_object() {
            return Err(EngineError::validation(
                "default_params must be a JSON object",
            ));
        }
        Ok(())
    }
}

/// Partial action update; absent fields keep their value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionUpdate {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub default_params: Option<Value>,
    pub enabled: Option<bool>,
}

/// In-memory action registry, ids ascending
pub struct ActionRegistry {
    actions: RwLock<BTreeMap<u64, ResponseAction>>,
    next_id: AtomicU64,
    clock: SharedClock,
}

impl ActionRegistry {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            actions: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            clock,
        }
    }

    pub fn create(&self, draft: ActionDraft) -> Result<ResponseAction> {
        draft.validate()?;
        let now = self.clock.now();
        let action = ResponseAction {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            name: draft.name,
            description: draft.description,
            action_type: draft.action_type,
            default_params: draft.default_params,
            enabled: draft.enabled,
            created_at: now,
            updated_at: now,
        };
        info!(action_id = action.id, name = %action.name, r#type = %action.action_type, "response action created");
        self.actions.write().insert(action.id, action.clone());
        Ok(action)
    }

    pub fn get(&self, id: u64) -> Option<ResponseAction> {
        self.actions.read().get(&id).cloned()
    }

    pub fn list(&self, skip: usize, limit: usize) -> Vec<ResponseAction> {
        self.actions
            .read()
            .values()
            .skip(skip)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn update(&self, id: u64, update: ActionUpdate) -> Result<ResponseAction> {
        let mut actions = self.actions.write();
        let action = actions
            .get_mut(&id)
            .ok_or_else(|| EngineError::not_found("response action", id))?;

        if let Some(name) = update.name {
            if name.trim().len() < 3 {
                return Err(EngineError::validation(
                    "action name must be at least 3 characters",
                ));
            }
            action.name = name;
        }
        if let Some(description) = update.description {
            action.description = description;
        }
        if let Some(params) = update.default_params {
            if !params.is_object() {
                return Err(EngineError::validation(
                    "default_params must be a JSON object",
                ));
            }
            action.default_params = params;
        }
        if let Some(enabled) = update.enabled {
            action.enabled = enabled;
        }
        action.updated_at = self.clock.now();
        Ok(action.clone())
    }

    pub fn delete(&self, id: u64) -> Result<()> {
        self.actions
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| EngineError::not_found("response action", id))
    }

    pub fn count(&self) -> usize {
        self.actions.read().len()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.actions.read().contains_key(&id)
    }
}

/// One invocable response capability
#[async_trait]
pub trait ResponseCapability: Send + Sync {
    /// Perform the action with fully resolved parameters. Returns a
    /// detail value recorded on the execution report.
    async fn invoke(&self, params: &Value) -> Result<Value>;
}

/// Capability implementations keyed by action type
#[derive(Default)]
pub struct CapabilityRegistry {
    capabilities: HashMap<ResponseActionType, Arc<dyn ResponseCapability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a log-only implementation per catalog entry
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for action_type in [
            ResponseActionType::BlockIp,
            ResponseActionType::UnblockIp,
            ResponseActionType::SendEmail,
            ResponseActionType::CreateTicket,
            ResponseActionType::IsolateHost,
        ] {
            registry.register(action_type, Arc::new(LogOnlyCapability { action_type }));
        }
        registry
    }

    pub fn register(
        &mut self,
        action_type: ResponseActionType,
        capability: Arc<dyn ResponseCapability>,
    ) {
        self.capabilities.insert(action_type, capability);
    }

    pub fn get(&self, action_type: ResponseActionType) -> Option<Arc<dyn ResponseCapability>> {
        self.capabilities.get(&action_type).cloned()
    }
}

/// Default capability: validates parameters and logs the invocation
struct LogOnlyCapability {
    action_type: ResponseActionType,
}

impl LogOnlyCapability {
    fn required_param(&self) -> &'static str {
        match self.action_type {
            ResponseActionType::BlockIp | ResponseActionType::UnblockIp => "ip_address",
            ResponseActionType::SendEmail => "recipient",
            ResponseActionType::CreateTicket => "title",
            ResponseActionType::IsolateHost => "hostname",
        }
    }
}

#[async_trait]
impl ResponseCapability for LogOnlyCapability {
    async fn invoke(&self, params: &Value) -> Result<Value> {
        let key = self.required_param();
        let target = params
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| EngineError::ActionExecution {
                action: self.action_type.as_str().to_string(),
                reason: format!("missing required parameter '{key}'"),
            })?;
        info!(action = %self.action_type, %target, "response action invoked");
        Ok(json!({ "action": self.action_type.as_str(), "target": target }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::system_clock;

    #[test]
    fn test_create_and_update_action() {
        let registry = ActionRegistry::new(system_clock());
        let action = registry
            .create(
                ActionDraft::new("Block attacker", ResponseActionType::BlockIp)
                    .with_default_params(json!({ "duration_minutes": 60 })),
            )
            .unwrap();
        assert_eq!(action.id, 1);

        let updated = registry
            .update(
                action.id,
                ActionUpdate {
                    enabled: Some(false),
                    ..ActionUpdate::default()
                },
            )
            .unwrap();
        assert!(!updated.enabled);
    }

    #[test]
    fn test_draft_validation_rejects_bad_params() {
        let registry = ActionRegistry::new(system_clock());
        let draft = ActionDraft::new("Block attacker", ResponseActionType::BlockIp)
            .with_default_params(json!([1, 2]));
        assert!(registry.create(draft).is_err());

        let draft = ActionDraft::new("x", ResponseActionType::BlockIp);
        assert!(registry.create(draft).is_err());
    }

    #[tokio::test]
    async fn test_log_only_capability_requires_target() {
        let registry = CapabilityRegistry::with_defaults();
        let block = registry.get(ResponseActionType::BlockIp).unwrap();

        let ok = block.invoke(&json!({ "ip_address": "203.0.113.9" })).await;
        assert_eq!(ok.unwrap()["target"], "203.0.113.9");

        let missing = block.invoke(&json!({})).await;
        assert!(matches!(
            missing,
            Err(EngineError::ActionExecution { .. })
        ));
    }

    #[test]
    fn test_delete_unknown_action_errors() {
        let registry = ActionRegistry::new(system_clock());
        assert!(registry.delete(42).is_err());
    }
}
