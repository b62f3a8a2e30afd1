use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::config::topics;
use crate::error::{Error, Result};
use crate::graph::labels::LabelSet;
use crate::messages::{Message, MessageBody, Resource, RESULT_LABELS};
use crate::triggers::composer::TRIGGER_SENDER;
use crate::triggers::conditions::{Condition, ConditionSet};
use crate::triggers::{Outgoing, Trigger, TriggerEvent};

/// Re-issues a query whose result came back empty, for queries where an
/// empty result means "not visible yet" rather than "nothing to do".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequeueRule {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub header_labels: LabelSet,
    #[serde(default)]
    pub query_name: Option<String>,
    /// Overrides `retry.max_retries`.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Overrides `retry.delay_ms`.
    #[serde(default)]
    pub delay_ms: Option<u64>,
}

impl RequeueRule {
    pub fn new(name: &str, header_labels: &[&str]) -> Self {
        Self {
            name: name.to_owned(),
            description: String::new(),
            header_labels: LabelSet::of(header_labels),
            query_name: None,
            max_retries: None,
            delay_ms: None,
        }
    }
}

pub struct RequeueTrigger {
    rule: RequeueRule,
    conditions: ConditionSet,
}

impl RequeueTrigger {
    pub fn new(rule: RequeueRule) -> Self {
        let mut conditions = ConditionSet::new()
            .with(Condition::EntityAbsent)
            .with(Condition::HeaderLabels {
                labels: rule.header_labels.clone(),
            });
        if let Some(query_name) = &rule.query_name {
            conditions.push(Condition::BodyEquals {
                path: "request.queryName".to_owned(),
                value: query_name.clone().into(),
            });
        }
        Self { rule, conditions }
    }
}

impl Trigger for RequeueTrigger {
    fn name(&self) -> &str {
        &self.rule.name
    }

    fn description(&self) -> &str {
        &self.rule.description
    }

    fn check(&self, event: &TriggerEvent<'_>) -> bool {
        if event.message.body.as_result().is_none() || !self.conditions.matches(event) {
            return false;
        }
        let budget = self.rule.max_retries.unwrap_or(event.config.retry.max_retries);
        let within_budget = Condition::RetryBudget { max: Some(budget) }
            .evaluate(event)
            .unwrap_or(false);
        if !within_budget {
            tracing::debug!(
                trigger = %self.rule.name,
                seed_id = %event.header().seed_id,
                retries = event.header().retries(),
                "retry budget exhausted; abandoning chain"
            );
        }
        within_budget
    }

    fn compose(&self, event: &TriggerEvent<'_>) -> Result<Vec<Outgoing>> {
        let MessageBody::QueryResult(result) = &event.message.body else {
            return Err(Error::Trigger(format!(
                "requeue '{}' needs a query result, got {}",
                self.rule.name,
                event.message.body.kind()
            )));
        };

        let header = event.header();
        let labels = header.labels.difference(&LabelSet::of(&RESULT_LABELS));
        let retry_count = header.retries() + 1;
        let db_topic = event.config.topic(topics::DB_QUERY)?;

        let message = Message::derive(
            event.message,
            TRIGGER_SENDER,
            Resource::Query,
            header.method,
            labels,
            MessageBody::Query(result.request.clone()),
        )
        .with_trigger(&self.rule.name)
        .with_publish_to(db_topic)
        .with_retry_count(retry_count);

        let delay = Duration::from_millis(self.rule.delay_ms.unwrap_or(event.config.retry.delay_ms));
        tracing::debug!(
            trigger = %self.rule.name,
            query = %result.request.query_name,
            retry_count,
            delay_ms = delay.as_millis() as u64,
            "requeueing empty query result"
        );
        Ok(vec![Outgoing::delayed(db_topic, message, delay)])
    }
}
