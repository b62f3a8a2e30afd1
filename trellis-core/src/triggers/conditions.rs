use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::graph::labels::LabelSet;
use crate::graph::model::{has_property, Entity, ValueKind};
use crate::triggers::TriggerEvent;

#[derive(Debug, Error, PartialEq)]
pub enum ConditionError {
    #[error("condition needs {0} but the event has none")]
    Missing(&'static str),
    #[error("field '{0}' is not present")]
    MissingField(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    HeaderLabels { labels: LabelSet },
    NodeLabels { labels: LabelSet },
    BannedLabels { labels: LabelSet },
    /// Property is present and truthy; `0`, `false` and `""` read as absent.
    HasProperty { key: String },
    PropertyEquals { key: String, value: Value },
    PropertyType { key: String, kind: ValueKind },
    BodyEquals { path: String, value: Value },
    ConfigEquals { key: String, value: Value },
    FeatureEnabled { name: String },
    /// Retry count absent or below `max` (defaults to the configured budget).
    RetryBudget {
        #[serde(default)]
        max: Option<u32>,
    },
    EntityPresent,
    EntityAbsent,
    RelationshipType { rel_type: String },
    StartLabels { labels: LabelSet },
    EndLabels { labels: LabelSet },
    Any { conditions: Vec<Condition> },
}

impl Condition {
    pub fn header_labels(labels: &[&str]) -> Self {
        Condition::HeaderLabels {
            labels: LabelSet::of(labels),
        }
    }

    pub fn node_labels(labels: &[&str]) -> Self {
        Condition::NodeLabels {
            labels: LabelSet::of(labels),
        }
    }

    pub fn banned_labels(labels: &[&str]) -> Self {
        Condition::BannedLabels {
            labels: LabelSet::of(labels),
        }
    }

    pub fn has_property(key: &str) -> Self {
        Condition::HasProperty {
            key: key.to_owned(),
        }
    }

    pub fn property_equals(key: &str, value: impl Into<Value>) -> Self {
        Condition::PropertyEquals {
            key: key.to_owned(),
            value: value.into(),
        }
    }

    pub fn property_type(key: &str, kind: ValueKind) -> Self {
        Condition::PropertyType {
            key: key.to_owned(),
            kind,
        }
    }

    pub fn relationship_type(rel_type: &str) -> Self {
        Condition::RelationshipType {
            rel_type: rel_type.to_owned(),
        }
    }

    pub fn evaluate(&self, event: &TriggerEvent<'_>) -> Result<bool, ConditionError> {
        match self {
            Condition::HeaderLabels { labels } => Ok(labels.is_subset_of(&event.header().labels)),
            Condition::NodeLabels { labels } => {
                let node = event.node().ok_or(ConditionError::Missing("a node"))?;
                Ok(labels.is_subset_of(&node.labels))
            }
            Condition::BannedLabels { labels } => Ok(match event.entity {
                Some(Entity::Node(node)) => labels.is_disjoint(&node.labels),
                Some(Entity::Relationship(_)) | None => true,
            }),
            Condition::HasProperty { key } => {
                let entity = event.entity.ok_or(ConditionError::Missing("an entity"))?;
                Ok(has_property(entity.properties(), key))
            }
            Condition::PropertyEquals { key, value } => {
                let entity = event.entity.ok_or(ConditionError::Missing("an entity"))?;
                Ok(entity.property(key) == Some(value))
            }
            Condition::PropertyType { key, kind } => {
                let entity = event.entity.ok_or(ConditionError::Missing("an entity"))?;
                Ok(entity.property(key).map_or(false, |value| kind.matches(value)))
            }
            Condition::BodyEquals { path, value } => {
                let actual = lookup_path(event.body(), path)
                    .ok_or_else(|| ConditionError::MissingField(path.clone()))?;
                Ok(actual == value)
            }
            Condition::ConfigEquals { key, value } => {
                let actual = event
                    .config
                    .value(key)
                    .ok_or_else(|| ConditionError::MissingField(format!("config.{key}")))?;
                Ok(&actual == value)
            }
            Condition::FeatureEnabled { name } => Ok(event.config.feature_enabled(name)),
            Condition::RetryBudget { max } => {
                let budget = max.unwrap_or(event.config.retry.max_retries);
                Ok(event
                    .header()
                    .retry_count
                    .map_or(true, |count| count < budget))
            }
            Condition::EntityPresent => Ok(event.entity.is_some()),
            Condition::EntityAbsent => Ok(event.entity.is_none()),
            Condition::RelationshipType { rel_type } => {
                let rel = event
                    .relationship()
                    .ok_or(ConditionError::Missing("a relationship"))?;
                Ok(&rel.rel_type == rel_type)
            }
            Condition::StartLabels { labels } => {
                let rel = event
                    .relationship()
                    .ok_or(ConditionError::Missing("a relationship"))?;
                Ok(labels.is_subset_of(&rel.start.labels))
            }
            Condition::EndLabels { labels } => {
                let rel = event
                    .relationship()
                    .ok_or(ConditionError::Missing("a relationship"))?;
                Ok(labels.is_subset_of(&rel.end.labels))
            }
            Condition::Any { conditions } => Ok(conditions
                .iter()
                .any(|condition| condition.evaluate(event).unwrap_or(false))),
        }
    }
}

/// Conjunction of conditions. Evaluation errors count as a non-match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConditionSet(Vec<Condition>);

impl ConditionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, condition: Condition) -> Self {
        self.0.push(condition);
        self
    }

    pub fn push(&mut self, condition: Condition) {
        self.0.push(condition);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, event: &TriggerEvent<'_>) -> bool {
        for condition in &self.0 {
            match condition.evaluate(event) {
                Ok(true) => {}
                Ok(false) => return false,
                Err(err) => {
                    tracing::debug!(error = %err, "condition not applicable");
                    return false;
                }
            }
        }
        true
    }
}

impl FromIterator<Condition> for ConditionSet {
    fn from_iter<I: IntoIterator<Item = Condition>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

pub fn lookup_path<'v>(root: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.').try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
