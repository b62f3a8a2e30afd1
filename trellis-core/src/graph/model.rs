use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use crate::graph::labels::LabelSet;

pub type Properties = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub labels: LabelSet,
    #[serde(default)]
    pub properties: Properties,
}

impl Node {
    pub fn new(id: impl Into<String>, labels: LabelSet, properties: Properties) -> Self {
        Self {
            id: id.into(),
            labels,
            properties,
        }
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn str_property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    #[serde(rename = "type")]
    pub rel_type: String,
    pub start: Node,
    pub end: Node,
    #[serde(default)]
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    Node(Node),
    Relationship(Relationship),
}

impl Entity {
    pub fn id(&self) -> &str {
        match self {
            Entity::Node(node) => &node.id,
            Entity::Relationship(rel) => &rel.id,
        }
    }

    pub fn labels(&self) -> Option<&LabelSet> {
        match self {
            Entity::Node(node) => Some(&node.labels),
            Entity::Relationship(_) => None,
        }
    }

    pub fn properties(&self) -> &Properties {
        match self {
            Entity::Node(node) => &node.properties,
            Entity::Relationship(rel) => &rel.properties,
        }
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties().get(key)
    }

    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Entity::Node(node) => Some(node),
            Entity::Relationship(_) => None,
        }
    }

    pub fn as_relationship(&self) -> Option<&Relationship> {
        match self {
            Entity::Node(_) => None,
            Entity::Relationship(rel) => Some(rel),
        }
    }
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(v) => *v,
        Value::Number(v) => v.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Value::String(v) => !v.is_empty(),
        Value::Array(v) => !v.is_empty(),
        Value::Object(v) => !v.is_empty(),
        Value::Null => false,
    }
}

/// A property counts as present only when it holds a truthy value, so a
/// `readGroup` of `0` reads as absent. Rules depend on this exact behavior.
pub fn has_property(properties: &Properties, key: &str) -> bool {
    properties.get(key).map(is_truthy).unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    String,
    Integer,
    Float,
    Boolean,
    Array,
    Object,
    Null,
}

impl ValueKind {
    pub fn matches(self, value: &Value) -> bool {
        match self {
            ValueKind::String => value.is_string(),
            ValueKind::Integer => value.is_i64() || value.is_u64(),
            ValueKind::Float => value.is_f64(),
            ValueKind::Boolean => value.is_boolean(),
            ValueKind::Array => value.is_array(),
            ValueKind::Object => value.is_object(),
            ValueKind::Null => value.is_null(),
        }
    }
}

/// Orders two property values used as timestamps: numbers numerically,
/// strings lexically (RFC 3339 in one timezone sorts correctly). Mixed or
/// non-scalar values are incomparable.
pub fn compare_order(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}
