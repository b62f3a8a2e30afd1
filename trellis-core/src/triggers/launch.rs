use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::graph::labels::LabelSet;
use crate::graph::model::{is_truthy, Node};
use crate::graph::statement::{NodePattern, RequestKey};
use crate::triggers::composer::compose_guarded_request;
use crate::triggers::conditions::{Condition, ConditionSet};
use crate::triggers::template::value_to_text;
use crate::triggers::{Outgoing, Trigger, TriggerEvent};

fn default_sample_property() -> String {
    "sample".to_owned()
}

/// Relationship rules launch on both endpoints; node rules on the node
/// itself. The request key is the sample plus each of `key_properties`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRule {
    pub name: String,
    pub task: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub header_labels: LabelSet,
    #[serde(default)]
    pub relationship: Option<String>,
    #[serde(default)]
    pub node_labels: LabelSet,
    #[serde(default)]
    pub end_labels: LabelSet,
    #[serde(default = "default_sample_property")]
    pub sample_property: String,
    #[serde(default)]
    pub key_properties: Vec<String>,
    /// Key the request on the triggering event as well, allowing one launch
    /// per distinct event instead of one per sample.
    #[serde(default)]
    pub per_event: bool,
    #[serde(default)]
    pub feature: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl LaunchRule {
    pub fn on_relationship(name: &str, task: &str, rel_type: &str) -> Self {
        Self {
            relationship: Some(rel_type.to_owned()),
            ..Self::on_node(name, task)
        }
    }

    pub fn on_node(name: &str, task: &str) -> Self {
        Self {
            name: name.to_owned(),
            task: task.to_owned(),
            description: String::new(),
            header_labels: LabelSet::new(),
            relationship: None,
            node_labels: LabelSet::new(),
            end_labels: LabelSet::new(),
            sample_property: default_sample_property(),
            key_properties: Vec::new(),
            per_event: false,
            feature: None,
            conditions: Vec::new(),
        }
    }
}

pub struct LaunchTrigger {
    rule: LaunchRule,
    conditions: ConditionSet,
}

impl LaunchTrigger {
    pub fn new(rule: LaunchRule) -> Self {
        let mut conditions = ConditionSet::new();
        if !rule.header_labels.is_empty() {
            conditions.push(Condition::HeaderLabels {
                labels: rule.header_labels.clone(),
            });
        }
        match &rule.relationship {
            Some(rel_type) => {
                conditions.push(Condition::relationship_type(rel_type));
                conditions.push(Condition::StartLabels {
                    labels: rule.node_labels.clone(),
                });
                conditions.push(Condition::EndLabels {
                    labels: rule.end_labels.clone(),
                });
            }
            None => conditions.push(Condition::NodeLabels {
                labels: rule.node_labels.clone(),
            }),
        }
        if let Some(feature) = &rule.feature {
            conditions.push(Condition::FeatureEnabled {
                name: feature.clone(),
            });
        }
        for condition in &rule.conditions {
            conditions.push(condition.clone());
        }
        Self { rule, conditions }
    }

    pub fn rule(&self) -> &LaunchRule {
        &self.rule
    }

    fn key_node<'e>(&self, event: &TriggerEvent<'e>) -> Option<&'e Node> {
        match (&self.rule.relationship, event.relationship(), event.node()) {
            (Some(_), Some(rel), _) => Some(&rel.start),
            (None, _, Some(node)) => Some(node),
            _ => None,
        }
    }

    fn inputs(&self, event: &TriggerEvent<'_>) -> Vec<String> {
        match (event.relationship(), event.node()) {
            (Some(rel), _) => vec![rel.start.id.clone(), rel.end.id.clone()],
            (None, Some(node)) => vec![node.id.clone()],
            _ => Vec::new(),
        }
    }
}

impl Trigger for LaunchTrigger {
    fn name(&self) -> &str {
        &self.rule.name
    }

    fn description(&self) -> &str {
        &self.rule.description
    }

    fn check(&self, event: &TriggerEvent<'_>) -> bool {
        if !self.conditions.matches(event) {
            return false;
        }
        let Some(node) = self.key_node(event) else {
            return false;
        };
        let has_sample = node
            .property(&self.rule.sample_property)
            .map_or(false, is_truthy);
        // Key properties only need to exist: a read group of 0 is a valid key.
        let has_keys = self
            .rule
            .key_properties
            .iter()
            .all(|key| node.property(key).map_or(false, |value| !value.is_null()));
        has_sample && has_keys
    }

    fn compose(&self, event: &TriggerEvent<'_>) -> Result<Vec<Outgoing>> {
        let node = self.key_node(event).ok_or_else(|| {
            Error::Trigger(format!("launch '{}' fired without a key node", self.rule.name))
        })?;
        let sample = node
            .property(&self.rule.sample_property)
            .map(value_to_text)
            .ok_or_else(|| {
                Error::Trigger(format!(
                    "launch '{}': node {} has no '{}'",
                    self.rule.name, node.id, self.rule.sample_property
                ))
            })?;

        let mut key = RequestKey::new(sample, self.rule.task.clone());
        for property in &self.rule.key_properties {
            let value = node.property(property).cloned().unwrap_or(Value::Null);
            key = key.with(property, value);
        }
        if self.rule.per_event {
            key = key.with("eventId", event.message.event_id.clone());
        }

        let outgoing = compose_guarded_request(
            event,
            &self.rule.name,
            key,
            NodePattern::by_ids(self.inputs(event)),
        )?;
        Ok(vec![outgoing])
    }
}
