use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::error::{Error, Result};
use crate::graph::labels::LabelSet;
use crate::graph::model::{Entity, Properties};
use crate::graph::statement::NodePattern;
use crate::triggers::TriggerEvent;

pub trait Scope {
    fn lookup(&self, path: &str) -> Option<Value>;
}

/// Names visible to rule templates:
/// - `id`: id of the triggering entity
/// - `<property>`: property of the triggering entity
/// - `start.<property>`, `end.<property>`, `start.id`, `end.id`: relationship endpoints
/// - `event.id`, `event.seedId`: message provenance
/// - `config.<key>`: see [`crate::config::Config::value`]
/// - `now`: current UTC time, RFC 3339
impl Scope for TriggerEvent<'_> {
    fn lookup(&self, path: &str) -> Option<Value> {
        if let Some(key) = path.strip_prefix("config.") {
            return self.config.value(key);
        }
        match path {
            "event.id" => return Some(Value::String(self.message.event_id.clone())),
            "event.seedId" => return Some(Value::String(self.message.header.seed_id.clone())),
            "now" => return Some(Value::String(Utc::now().to_rfc3339())),
            _ => {}
        }

        let entity = self.entity?;
        if path == "id" {
            return Some(Value::String(entity.id().to_owned()));
        }
        if let Entity::Relationship(rel) = entity {
            for (prefix, node) in [("start.", &rel.start), ("end.", &rel.end)] {
                if let Some(key) = path.strip_prefix(prefix) {
                    if key == "id" {
                        return Some(Value::String(node.id.clone()));
                    }
                    return node.property(key).cloned();
                }
            }
        }
        entity.property(path).cloned()
    }
}

impl Scope for BTreeMap<String, Value> {
    fn lookup(&self, path: &str) -> Option<Value> {
        self.get(path).cloned()
    }
}

fn placeholder_regex() -> Option<&'static Regex> {
    static PLACEHOLDER: OnceLock<Option<Regex>> = OnceLock::new();
    PLACEHOLDER
        .get_or_init(|| Regex::new(r"\{([A-Za-z0-9_.\-]+)\}").ok())
        .as_ref()
}

pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Replaces every `{name}` in `template` with the named value. A name the
/// scope cannot resolve is an error, never an empty string.
pub fn render_format(template: &str, scope: &dyn Scope) -> Result<String> {
    let Some(regex) = placeholder_regex() else {
        return Err(Error::Template("placeholder pattern failed to compile".to_owned()));
    };

    let mut rendered = String::with_capacity(template.len());
    let mut last = 0;
    for captures in regex.captures_iter(template) {
        let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let value = scope.lookup(name.as_str()).ok_or_else(|| {
            Error::Template(format!(
                "'{}' is not available while rendering '{template}'",
                name.as_str()
            ))
        })?;
        rendered.push_str(&template[last..whole.start()]);
        rendered.push_str(&value_to_text(&value));
        last = whole.end();
    }
    rendered.push_str(&template[last..]);
    Ok(rendered)
}

/// A value in a rule table. Written in TOML as one of
/// `{ from = "sample" }`, `{ format = "{sample}-{readGroup}" }` or a literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueTemplate {
    From { from: String },
    Format { format: String },
    Literal(Value),
}

impl ValueTemplate {
    pub fn from(name: &str) -> Self {
        ValueTemplate::From {
            from: name.to_owned(),
        }
    }

    pub fn format(template: &str) -> Self {
        ValueTemplate::Format {
            format: template.to_owned(),
        }
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        ValueTemplate::Literal(value.into())
    }

    pub fn resolve(&self, scope: &dyn Scope) -> Result<Value> {
        match self {
            ValueTemplate::From { from } => scope
                .lookup(from)
                .ok_or_else(|| Error::Template(format!("'{from}' is not available"))),
            ValueTemplate::Format { format } => render_format(format, scope).map(Value::String),
            ValueTemplate::Literal(value) => Ok(value.clone()),
        }
    }
}

pub type PropertyTemplates = BTreeMap<String, ValueTemplate>;

pub fn resolve_properties(templates: &PropertyTemplates, scope: &dyn Scope) -> Result<Properties> {
    templates
        .iter()
        .map(|(key, template)| Ok((key.clone(), template.resolve(scope)?)))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternTemplate {
    pub this: bool,
    pub labels: LabelSet,
    pub banned_labels: LabelSet,
    pub properties: PropertyTemplates,
    pub excluded: PropertyTemplates,
    pub ids: Option<ValueTemplate>,
}

impl PatternTemplate {
    pub fn this() -> Self {
        Self {
            this: true,
            ..Self::default()
        }
    }

    pub fn labelled(labels: &[&str]) -> Self {
        Self {
            labels: LabelSet::of(labels),
            ..Self::default()
        }
    }

    pub fn ids_from(name: &str) -> Self {
        Self {
            ids: Some(ValueTemplate::from(name)),
            ..Self::default()
        }
    }

    pub fn with(mut self, key: &str, template: ValueTemplate) -> Self {
        self.properties.insert(key.to_owned(), template);
        self
    }

    pub fn without_label(mut self, label: &str) -> Self {
        self.banned_labels.insert(label);
        self
    }

    pub fn resolve(&self, scope: &dyn Scope) -> Result<NodePattern> {
        let mut ids = Vec::new();
        if self.this {
            let id = scope
                .lookup("id")
                .ok_or_else(|| Error::Template("pattern targets the triggering entity but there is none".to_owned()))?;
            ids.push(value_to_text(&id));
        }
        if let Some(template) = &self.ids {
            match template.resolve(scope)? {
                Value::Array(items) => ids.extend(items.iter().map(value_to_text)),
                Value::Null => {
                    return Err(Error::Template("pattern ids resolved to null".to_owned()));
                }
                single => ids.push(value_to_text(&single)),
            }
        }

        Ok(NodePattern {
            labels: self.labels.clone(),
            banned_labels: self.banned_labels.clone(),
            properties: resolve_properties(&self.properties, scope)?,
            excluded: resolve_properties(&self.excluded, scope)?,
            ids,
        })
    }
}
