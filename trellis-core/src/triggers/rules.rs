use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::config::topics;
use crate::error::Result;
use crate::graph::labels::LabelSet;
use crate::graph::statement::{ResultMode, Statement};
use crate::triggers::composer::{compose_query, QueryOptions};
use crate::triggers::conditions::{Condition, ConditionSet};
use crate::triggers::template::{resolve_properties, PatternTemplate, PropertyTemplates};
use crate::triggers::{Outgoing, Trigger, TriggerEvent};

fn default_true() -> bool {
    true
}

fn default_publish_to() -> String {
    topics::TRIGGERS.to_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RuleAction {
    Create {
        labels: LabelSet,
        #[serde(default)]
        properties: PropertyTemplates,
    },
    Merge {
        labels: LabelSet,
        key: PropertyTemplates,
        #[serde(default)]
        properties: PropertyTemplates,
    },
    Match {
        pattern: PatternTemplate,
    },
    Update {
        target: PatternTemplate,
        #[serde(default)]
        set: PropertyTemplates,
        #[serde(default)]
        add_labels: LabelSet,
        #[serde(default)]
        remove_labels: LabelSet,
    },
    Relate {
        from: PatternTemplate,
        to: PatternTemplate,
        rel_type: String,
        #[serde(default)]
        properties: PropertyTemplates,
        #[serde(default = "default_true")]
        merge: bool,
    },
    RelateToPredecessor {
        target: PatternTemplate,
        candidates: PatternTemplate,
        order_property: String,
        rel_type: String,
    },
    RelateToEarliest {
        owner: PatternTemplate,
        target: PatternTemplate,
        candidates: PatternTemplate,
        order_property: String,
        rel_type: String,
    },
    RepointLatest {
        owner: PatternTemplate,
        target: PatternTemplate,
        rel_type: String,
        #[serde(default)]
        order_property: Option<String>,
    },
}

impl RuleAction {
    pub fn render(&self, event: &TriggerEvent<'_>) -> Result<Statement> {
        Ok(match self {
            RuleAction::Create { labels, properties } => Statement::CreateNode {
                labels: labels.clone(),
                properties: resolve_properties(properties, event)?,
            },
            RuleAction::Merge {
                labels,
                key,
                properties,
            } => Statement::MergeNode {
                labels: labels.clone(),
                key: resolve_properties(key, event)?,
                properties: resolve_properties(properties, event)?,
            },
            RuleAction::Match { pattern } => Statement::MatchNodes {
                pattern: pattern.resolve(event)?,
            },
            RuleAction::Update {
                target,
                set,
                add_labels,
                remove_labels,
            } => Statement::UpdateNodes {
                pattern: target.resolve(event)?,
                set: resolve_properties(set, event)?,
                add_labels: add_labels.clone(),
                remove_labels: remove_labels.clone(),
            },
            RuleAction::Relate {
                from,
                to,
                rel_type,
                properties,
                merge,
            } => Statement::Relate {
                from: from.resolve(event)?,
                to: to.resolve(event)?,
                rel_type: rel_type.clone(),
                properties: resolve_properties(properties, event)?,
                merge: *merge,
            },
            RuleAction::RelateToPredecessor {
                target,
                candidates,
                order_property,
                rel_type,
            } => Statement::RelateToPredecessor {
                target: target.resolve(event)?,
                candidates: candidates.resolve(event)?,
                order_property: order_property.clone(),
                rel_type: rel_type.clone(),
            },
            RuleAction::RelateToEarliest {
                owner,
                target,
                candidates,
                order_property,
                rel_type,
            } => Statement::RelateToEarliest {
                owner: owner.resolve(event)?,
                target: target.resolve(event)?,
                candidates: candidates.resolve(event)?,
                order_property: order_property.clone(),
                rel_type: rel_type.clone(),
            },
            RuleAction::RepointLatest {
                owner,
                target,
                rel_type,
                order_property,
            } => Statement::RepointLatest {
                owner: owner.resolve(event)?,
                target: target.resolve(event)?,
                rel_type: rel_type.clone(),
                order_property: order_property.clone(),
            },
        })
    }
}

/// A declarative trigger: a condition table plus the query it emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub header_labels: LabelSet,
    #[serde(default)]
    pub node_labels: LabelSet,
    #[serde(default)]
    pub banned_labels: LabelSet,
    #[serde(default)]
    pub required_properties: Vec<String>,
    #[serde(default)]
    pub property_equals: BTreeMap<String, Value>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub action: RuleAction,
    #[serde(default)]
    pub query_labels: LabelSet,
    #[serde(default = "default_publish_to")]
    pub publish_to: String,
    #[serde(default)]
    pub result_split: bool,
    #[serde(default)]
    pub result_mode: ResultMode,
}

impl RuleDefinition {
    pub fn new(name: &str, action: RuleAction) -> Self {
        Self {
            name: name.to_owned(),
            description: String::new(),
            header_labels: LabelSet::new(),
            node_labels: LabelSet::new(),
            banned_labels: LabelSet::new(),
            required_properties: Vec::new(),
            property_equals: BTreeMap::new(),
            conditions: Vec::new(),
            action,
            query_labels: LabelSet::new(),
            publish_to: default_publish_to(),
            result_split: false,
            result_mode: ResultMode::Data,
        }
    }

    pub fn condition_set(&self) -> ConditionSet {
        let mut set = ConditionSet::new();
        if !self.header_labels.is_empty() {
            set.push(Condition::HeaderLabels {
                labels: self.header_labels.clone(),
            });
        }
        if !self.node_labels.is_empty() {
            set.push(Condition::NodeLabels {
                labels: self.node_labels.clone(),
            });
        }
        if !self.banned_labels.is_empty() {
            set.push(Condition::BannedLabels {
                labels: self.banned_labels.clone(),
            });
        }
        for key in &self.required_properties {
            set.push(Condition::has_property(key));
        }
        for (key, value) in &self.property_equals {
            set.push(Condition::property_equals(key, value.clone()));
        }
        for condition in &self.conditions {
            set.push(condition.clone());
        }
        set
    }
}

pub struct RuleTrigger {
    definition: RuleDefinition,
    conditions: ConditionSet,
}

impl RuleTrigger {
    pub fn new(definition: RuleDefinition) -> Self {
        let conditions = definition.condition_set();
        Self {
            definition,
            conditions,
        }
    }

    pub fn definition(&self) -> &RuleDefinition {
        &self.definition
    }
}

impl Trigger for RuleTrigger {
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn description(&self) -> &str {
        &self.definition.description
    }

    fn check(&self, event: &TriggerEvent<'_>) -> bool {
        self.conditions.matches(event)
    }

    fn compose(&self, event: &TriggerEvent<'_>) -> Result<Vec<Outgoing>> {
        let statement = self.definition.action.render(event)?;
        let options = QueryOptions::new(&self.definition.name, self.definition.query_labels.clone())
            .publish_to(&self.definition.publish_to)
            .split(self.definition.result_split)
            .mode(self.definition.result_mode);
        Ok(vec![compose_query(event, &self.definition.name, statement, options)?])
    }
}
