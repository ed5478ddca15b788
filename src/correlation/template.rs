//! Placeholder template rendering
//!
//! Offence titles and action parameters use `{scope.path}` placeholders,
//! e.g. `{event.source_ip}`, `{ioc.value}`,
//! `{offence.matched_ioc_details.value}`. Unresolved placeholders render
//! as an empty string; a bad template never fails a rule or a pipeline.

use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;

use crate::core::Event;
use crate::intel::Indicator;

/// Named value scopes a template can reference
#[derive(Debug, Default, Clone)]
pub struct RenderContext {
    scopes: HashMap<String, Value>,
}

impl RenderContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an arbitrary JSON scope
    pub fn with_scope(mut self, name: &str, value: Value) -> Self {
        self.scopes.insert(name.to_string(), value);
        self
    }

    /// Attach the `event.*` scope
    pub fn with_event(self, event: &Event) -> Self {
        self.with_scope("event", event_scope(event))
    }

    /// Attach the `ioc.*` scope
    pub fn with_indicator(self, indicator: &Indicator) -> Self {
        self.with_scope("ioc", indicator.details())
    }

    fn resolve(&self, scope: &str, path: &str) -> Option<&Value> {
        let mut current = self.scopes.get(scope)?;
        for segment in path.split('.') {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

/// Flat JSON view of an event for templating, extras included
fn event_scope(event: &Event) -> Value {
    let mut map = serde_json::Map::new();
    map.insert("event_category".into(), event.category.clone().into());
    map.insert("category".into(), event.category.clone().into());
    map.insert("timestamp".into(), event.timestamp.to_rfc3339().into());
    for name in [
        "source_ip",
        "destination_ip",
        "username",
        "hostname",
        "message",
        "network_bytes_total",
        "reporter_ip",
    ] {
        if let Some(value) = event.field_by_name(name) {
            map.insert(name.into(), value.into());
        }
    }
    for (key, value) in &event.extra {
        map.entry(key.clone()).or_insert_with(|| value.clone().into());
    }
    Value::Object(map)
}

/// Renders `{scope.path}` placeholders against a context
pub struct TemplateRenderer {
    placeholder: Regex,
}

impl TemplateRenderer {
    pub fn new() -> Self {
        Self {
            // scope.path, path segments dot-separated
            placeholder: Regex::new(r"\{([A-Za-z0-9_]+)\.([A-Za-z0-9_.]+)\}")
                .expect("placeholder regex is valid"),
        }
    }

    /// Substitute every placeholder; unresolved ones become ""
    pub fn render(&self, template: &str, ctx: &RenderContext) -> String {
        self.placeholder
            .replace_all(template, |caps: &regex::Captures<'_>| {
                ctx.resolve(&caps[1], &caps[2])
                    .map(format_value)
                    .unwrap_or_default()
            })
            .into_owned()
    }

    /// Render a JSON value in place: strings pass through, other leaf
    /// values substitute into the string form
    pub fn render_value(&self, value: &Value, ctx: &RenderContext) -> Value {
        match value {
            Value::String(s) => Value::String(self.render(s, ctx)),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.render_value(v, ctx)))
                    .collect(),
            ),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.render_value(v, ctx)).collect())
            }
            other => other.clone(),
        }
    }
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        // Composite values render as compact JSON
        other => other.to_string(),
    }
}
