//! Workflow lineage for Cromwell metadata: steps are chained in start-time
//! order under their workflow, and each step keeps its attempt history plus
//! a pointer to its latest attempt.

use crate::error::{Error, Result};
use crate::graph::labels::LabelSet;
use crate::graph::model::Node;
use crate::graph::statement::{NodePattern, Statement};
use crate::triggers::composer::{compose_query, QueryOptions};
use crate::triggers::conditions::{Condition, ConditionSet};
use crate::triggers::{Outgoing, Trigger, TriggerEvent};

pub const WORKFLOW_LABEL: &str = "CromwellWorkflow";
pub const STEP_LABEL: &str = "CromwellStep";
pub const ATTEMPT_LABEL: &str = "CromwellAttempt";

pub const WORKFLOW_ID: &str = "cromwellWorkflowId";
pub const CALL_ALIAS: &str = "wdlCallAlias";
pub const START_TIME: &str = "startTime";
pub const ATTEMPT: &str = "attempt";

pub const LED_TO: &str = "LED_TO";
pub const HAS_ATTEMPT: &str = "HAS_ATTEMPT";
pub const HAS_LATEST_ATTEMPT: &str = "HAS_LATEST_ATTEMPT";

fn created(label: &str, required: &[&str]) -> ConditionSet {
    let mut conditions = ConditionSet::new()
        .with(Condition::header_labels(&["Create"]))
        .with(Condition::node_labels(&[label]));
    for key in required {
        conditions.push(Condition::has_property(key));
    }
    conditions
}

fn scoped(label: &str, node: &Node, keys: &[&str]) -> NodePattern {
    let mut pattern = NodePattern::labelled(&[label]);
    for key in keys {
        if let Some(value) = node.property(key) {
            pattern.properties.insert((*key).to_owned(), value.clone());
        }
    }
    pattern
}

fn triggering_node<'e>(event: &TriggerEvent<'e>, trigger: &str) -> Result<&'e Node> {
    event
        .node()
        .ok_or_else(|| Error::Trigger(format!("{trigger} fired without a node")))
}

/// Links the workflow to its earliest step.
pub struct FirstStepTrigger {
    conditions: ConditionSet,
}

impl FirstStepTrigger {
    pub const NAME: &'static str = "relate-workflow-first-step";

    pub fn new() -> Self {
        Self {
            conditions: created(STEP_LABEL, &[WORKFLOW_ID, START_TIME]),
        }
    }
}

impl Trigger for FirstStepTrigger {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn check(&self, event: &TriggerEvent<'_>) -> bool {
        self.conditions.matches(event)
    }

    fn compose(&self, event: &TriggerEvent<'_>) -> Result<Vec<Outgoing>> {
        let step = triggering_node(event, Self::NAME)?;
        let statement = Statement::RelateToEarliest {
            owner: scoped(WORKFLOW_LABEL, step, &[WORKFLOW_ID]),
            target: NodePattern::by_id(step.id.clone()),
            candidates: scoped(STEP_LABEL, step, &[WORKFLOW_ID]),
            order_property: START_TIME.to_owned(),
            rel_type: LED_TO.to_owned(),
        };
        let options = QueryOptions::new(Self::NAME, LabelSet::of(&["Relate", WORKFLOW_LABEL, STEP_LABEL]));
        Ok(vec![compose_query(event, Self::NAME, statement, options)?])
    }
}

pub struct PreviousStepTrigger {
    conditions: ConditionSet,
}

impl PreviousStepTrigger {
    pub const NAME: &'static str = "relate-previous-step";

    pub fn new() -> Self {
        Self {
            conditions: created(STEP_LABEL, &[WORKFLOW_ID, START_TIME]),
        }
    }
}

impl Trigger for PreviousStepTrigger {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn check(&self, event: &TriggerEvent<'_>) -> bool {
        self.conditions.matches(event)
    }

    fn compose(&self, event: &TriggerEvent<'_>) -> Result<Vec<Outgoing>> {
        let step = triggering_node(event, Self::NAME)?;
        let statement = Statement::RelateToPredecessor {
            target: NodePattern::by_id(step.id.clone()),
            candidates: scoped(STEP_LABEL, step, &[WORKFLOW_ID]),
            order_property: START_TIME.to_owned(),
            rel_type: LED_TO.to_owned(),
        };
        let options = QueryOptions::new(Self::NAME, LabelSet::of(&["Relate", STEP_LABEL]));
        Ok(vec![compose_query(event, Self::NAME, statement, options)?])
    }
}

pub struct PreviousAttemptTrigger {
    conditions: ConditionSet,
}

impl PreviousAttemptTrigger {
    pub const NAME: &'static str = "relate-previous-attempt";

    pub fn new() -> Self {
        Self {
            conditions: created(ATTEMPT_LABEL, &[WORKFLOW_ID, CALL_ALIAS, START_TIME]),
        }
    }
}

impl Trigger for PreviousAttemptTrigger {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn check(&self, event: &TriggerEvent<'_>) -> bool {
        self.conditions.matches(event)
    }

    fn compose(&self, event: &TriggerEvent<'_>) -> Result<Vec<Outgoing>> {
        let attempt = triggering_node(event, Self::NAME)?;
        let statement = Statement::RelateToPredecessor {
            target: NodePattern::by_id(attempt.id.clone()),
            candidates: scoped(ATTEMPT_LABEL, attempt, &[WORKFLOW_ID, CALL_ALIAS]),
            order_property: START_TIME.to_owned(),
            rel_type: LED_TO.to_owned(),
        };
        let options = QueryOptions::new(Self::NAME, LabelSet::of(&["Relate", ATTEMPT_LABEL]));
        Ok(vec![compose_query(event, Self::NAME, statement, options)?])
    }
}

/// Records the attempt under its step and moves the step's latest-attempt
/// pointer forward.
pub struct LatestAttemptTrigger {
    conditions: ConditionSet,
}

impl LatestAttemptTrigger {
    pub const NAME: &'static str = "relate-latest-attempt";

    pub fn new() -> Self {
        Self {
            conditions: created(ATTEMPT_LABEL, &[WORKFLOW_ID, CALL_ALIAS, ATTEMPT]),
        }
    }
}

impl Trigger for LatestAttemptTrigger {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn check(&self, event: &TriggerEvent<'_>) -> bool {
        self.conditions.matches(event)
    }

    fn compose(&self, event: &TriggerEvent<'_>) -> Result<Vec<Outgoing>> {
        let attempt = triggering_node(event, Self::NAME)?;
        let step = scoped(STEP_LABEL, attempt, &[WORKFLOW_ID, CALL_ALIAS]);
        let target = NodePattern::by_id(attempt.id.clone());

        let history = Statement::Relate {
            from: step.clone(),
            to: target.clone(),
            rel_type: HAS_ATTEMPT.to_owned(),
            properties: Default::default(),
            merge: true,
        };
        let latest = Statement::RepointLatest {
            owner: step,
            target,
            rel_type: HAS_LATEST_ATTEMPT.to_owned(),
            order_property: Some(ATTEMPT.to_owned()),
        };

        Ok(vec![
            compose_query(
                event,
                Self::NAME,
                history,
                QueryOptions::new("relate-step-attempt", LabelSet::of(&["Relate", STEP_LABEL, ATTEMPT_LABEL])),
            )?,
            compose_query(
                event,
                Self::NAME,
                latest,
                QueryOptions::new("repoint-latest-attempt", LabelSet::of(&["Relate", "Latest", ATTEMPT_LABEL])),
            )?,
        ])
    }
}

macro_rules! impl_default {
    ($($name:ident),*) => {
        $(impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        })*
    };
}

impl_default!(FirstStepTrigger, PreviousStepTrigger, PreviousAttemptTrigger, LatestAttemptTrigger);
