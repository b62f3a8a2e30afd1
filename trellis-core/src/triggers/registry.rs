use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

use crate::bus::MessageBus;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::graph::model::Entity;
use crate::messages::Message;
use crate::triggers::defaults::register_builtins;
use crate::triggers::launch::LaunchTrigger;
use crate::triggers::requeue::RequeueTrigger;
use crate::triggers::rules::RuleTrigger;
use crate::triggers::{Outgoing, Trigger, TriggerEvent};

#[derive(Default)]
pub struct TriggerRegistry {
    triggers: Vec<Arc<dyn Trigger>>,
    names: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct Evaluation {
    pub outgoing: Vec<Outgoing>,
    pub matched: Vec<String>,
    pub failed: Vec<String>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(config: &Config) -> Result<Self> {
        let mut registry = Self::new();
        if config.builtin_rules {
            register_builtins(&mut registry)?;
        }
        for rule in &config.rules {
            registry.register(Arc::new(RuleTrigger::new(rule.clone())))?;
        }
        for rule in &config.launches {
            registry.register(Arc::new(LaunchTrigger::new(rule.clone())))?;
        }
        for rule in &config.requeue {
            registry.register(Arc::new(RequeueTrigger::new(rule.clone())))?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, trigger: Arc<dyn Trigger>) -> Result<()> {
        let name = trigger.name().to_owned();
        if !self.names.insert(name.clone()) {
            return Err(Error::Validation(format!("trigger '{name}' is registered twice")));
        }
        self.triggers.push(trigger);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.triggers.iter().map(|t| t.name().to_owned()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Trigger>> {
        self.triggers.iter()
    }

    /// Runs every trigger against every entity of the result, or once with
    /// no entity when the result is empty. A failing compose is skipped.
    pub fn evaluate(&self, message: &Message, config: &Config) -> Evaluation {
        let mut evaluation = Evaluation::default();
        let Some(result) = message.body.as_result() else {
            tracing::debug!(
                event_id = %message.event_id,
                kind = message.body.kind(),
                "not a query result; no triggers evaluated"
            );
            return evaluation;
        };

        let Some(body) = json_view(&message.body, &message.event_id) else {
            return evaluation;
        };
        let entities = result.results.entities();
        let slots: Vec<Option<&Entity>> = if entities.is_empty() {
            vec![None]
        } else {
            entities.iter().map(Some).collect()
        };

        for entity in slots {
            let event = TriggerEvent::new(message, entity, config, &body);
            for trigger in &self.triggers {
                if !trigger.check(&event) {
                    continue;
                }
                evaluation.matched.push(trigger.name().to_owned());
                match trigger.compose(&event) {
                    Ok(outgoing) => {
                        tracing::debug!(
                            trigger = trigger.name(),
                            event_id = %message.event_id,
                            messages = outgoing.len(),
                            "trigger fired"
                        );
                        evaluation.outgoing.extend(outgoing);
                    }
                    Err(err) => {
                        tracing::warn!(
                            trigger = trigger.name(),
                            event_id = %message.event_id,
                            error = %err,
                            "trigger failed to compose messages, skipping"
                        );
                        evaluation.failed.push(trigger.name().to_owned());
                    }
                }
            }
        }
        evaluation
    }
}

fn json_view<T: Serialize>(body: &T, event_id: &str) -> Option<Value> {
    match serde_json::to_value(body) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                event_id,
                error = %err,
                "message body cannot be viewed as json; no triggers evaluated"
            );
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub matched: usize,
    pub published: usize,
    pub failed: usize,
}

pub struct Dispatcher {
    registry: Arc<TriggerRegistry>,
    bus: Arc<dyn MessageBus>,
    config: Arc<Config>,
}

impl Dispatcher {
    pub fn new(registry: Arc<TriggerRegistry>, bus: Arc<dyn MessageBus>, config: Arc<Config>) -> Self {
        Self {
            registry,
            bus,
            config,
        }
    }

    pub fn registry(&self) -> &TriggerRegistry {
        &self.registry
    }

    /// Immediate messages are published first, then delayed ones in delay
    /// order after waiting out their delay. A publish failure is logged and
    /// counted; the remaining messages are still published.
    pub async fn dispatch(&self, message: &Message) -> DispatchReport {
        let evaluation = self.registry.evaluate(message, &self.config);
        let mut report = DispatchReport {
            matched: evaluation.matched.len(),
            failed: evaluation.failed.len(),
            ..DispatchReport::default()
        };

        let (mut delayed, immediate): (Vec<_>, Vec<_>) = evaluation
            .outgoing
            .into_iter()
            .partition(|outgoing| outgoing.delay.is_some());
        delayed.sort_by_key(|outgoing| outgoing.delay);

        for outgoing in immediate {
            self.publish(outgoing, &mut report).await;
        }

        let mut waited = tokio::time::Duration::ZERO;
        for outgoing in delayed {
            let delay = outgoing.delay.unwrap_or_default();
            if delay > waited {
                tokio::time::sleep(delay - waited).await;
                waited = delay;
            }
            self.publish(outgoing, &mut report).await;
        }

        if report.matched == 0 {
            tracing::trace!(event_id = %message.event_id, "no trigger matched");
        }
        report
    }

    async fn publish(&self, outgoing: Outgoing, report: &mut DispatchReport) {
        let event_id = outgoing.message.event_id.clone();
        match self.bus.publish(&outgoing.topic, outgoing.message).await {
            Ok(()) => report.published += 1,
            Err(err) => {
                tracing::error!(
                    topic = %outgoing.topic,
                    event_id = %event_id,
                    error = %err,
                    "failed to publish triggered message"
                );
                report.failed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::graph::labels::LabelSet;
    use crate::graph::model::Node;
    use crate::graph::statement::{NodePattern, QueryResults, Statement};
    use crate::messages::{MessageBody, Method, QueryRequest, QueryResultBody, Resource};
    use crate::triggers::requeue::RequeueRule;
    use serde_json::json;

    struct Failing;

    impl Trigger for Failing {
        fn name(&self) -> &str {
            "always-fails"
        }

        fn check(&self, _event: &TriggerEvent<'_>) -> bool {
            true
        }

        fn compose(&self, _event: &TriggerEvent<'_>) -> Result<Vec<Outgoing>> {
            Err(Error::Trigger("boom".to_owned()))
        }
    }

    fn result(labels: &[&str], nodes: Vec<Node>) -> Message {
        Message::root(
            "db-query",
            Resource::QueryResult,
            Method::Post,
            LabelSet::of(labels),
            MessageBody::QueryResult(QueryResultBody {
                request: QueryRequest::new("relate", Statement::MatchNodes { pattern: NodePattern::default() })
                    .publish_to("db-triggers"),
                results: QueryResults {
                    nodes,
                    ..QueryResults::default()
                },
            }),
        )
    }

    fn fastq(id: &str, mate: i64) -> Node {
        let properties = json!({"sample": "S1", "readGroup": 0, "matePair": mate});
        Node::new(id, LabelSet::of(&["Blob", "Fastq"]), properties.as_object().cloned().unwrap_or_default())
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = TriggerRegistry::new();
        registry.register(Arc::new(Failing)).expect("first");
        let err = registry.register(Arc::new(Failing)).expect_err("second");
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn failing_trigger_does_not_block_others() {
        let config = Config::default();
        let mut registry = TriggerRegistry::new();
        registry.register(Arc::new(Failing)).expect("register");
        register_builtins(&mut registry).expect("builtins");

        let message = result(&["Create", "Blob", "Database", "Result"], vec![fastq("f1", 1)]);
        let evaluation = registry.evaluate(&message, &config);
        assert_eq!(evaluation.failed, vec!["always-fails".to_owned()]);
        assert!(evaluation.matched.contains(&"relate-fastq-mate-pair".to_owned()));
        assert_eq!(evaluation.outgoing.len(), 1);
    }

    #[test]
    fn each_row_is_evaluated_separately() {
        let config = Config::default();
        let mut registry = TriggerRegistry::new();
        register_builtins(&mut registry).expect("builtins");
        let message = result(&["Create", "Blob"], vec![fastq("f1", 1), fastq("f2", 2)]);
        let evaluation = registry.evaluate(&message, &config);
        assert_eq!(evaluation.outgoing.len(), 2);
    }

    #[test]
    fn evaluation_is_deterministic() {
        let config = Config::default();
        let registry = TriggerRegistry::with_defaults(&config).expect("registry");
        let message = result(&["Create", "Blob"], vec![fastq("f1", 1)]);
        let first: Vec<_> = registry.evaluate(&message, &config).outgoing.into_iter().map(|o| (o.topic, o.message.body)).collect();
        let second: Vec<_> = registry.evaluate(&message, &config).outgoing.into_iter().map(|o| (o.topic, o.message.body)).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn configured_tables_extend_builtins() {
        let mut config = Config::default();
        config.requeue.push(RequeueRule::new("requeue-custom", &["Custom"]));
        let registry = TriggerRegistry::with_defaults(&config).expect("registry");
        assert!(registry.names().contains(&"requeue-custom".to_owned()));

        config.builtin_rules = false;
        let registry = TriggerRegistry::with_defaults(&config).expect("registry");
        assert_eq!(registry.names(), vec!["requeue-custom".to_owned()]);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatcher_publishes_delayed_requeue_after_delay() {
        let mut config = Config::default();
        config.builtin_rules = false;
        config.requeue.push(RequeueRule::new("requeue-relate", &["Relate"]));
        let config = Arc::new(config);
        let registry = Arc::new(TriggerRegistry::with_defaults(&config).expect("registry"));
        let (bus, mut receiver) = LocalBus::new();
        let dispatcher = Dispatcher::new(registry, Arc::new(bus), config);

        let started = tokio::time::Instant::now();
        let report = dispatcher.dispatch(&result(&["Relate", "Database", "Result"], vec![])).await;
        assert_eq!(report, DispatchReport { matched: 1, published: 1, failed: 0 });
        assert!(started.elapsed() >= tokio::time::Duration::from_millis(2_000));

        let delivery = receiver.try_recv().expect("requeued message");
        assert_eq!(delivery.topic, "db-query");
        assert_eq!(delivery.message.header.retry_count, Some(1));
    }

    #[tokio::test]
    async fn non_result_messages_are_ignored() {
        let config = Arc::new(Config::default());
        let registry = Arc::new(TriggerRegistry::with_defaults(&config).expect("registry"));
        let (bus, mut receiver) = LocalBus::new();
        let dispatcher = Dispatcher::new(registry, Arc::new(bus), config);
        let query = Message::root(
            "ingest",
            Resource::Query,
            Method::Post,
            LabelSet::of(&["Create", "Blob"]),
            MessageBody::Query(QueryRequest::new("q", Statement::MatchNodes { pattern: NodePattern::default() })),
        );
        let report = dispatcher.dispatch(&query).await;
        assert_eq!(report, DispatchReport::default());
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn body_json_view_skips_unserializable_bodies() {
        let message = result(&["Create"], Vec::new());
        let view = json_view(&message.body, &message.event_id).expect("query result view");
        assert_eq!(view["request"]["queryName"], json!("relate"));

        let mut tuple_keys = std::collections::BTreeMap::new();
        tuple_keys.insert((1u8, 2u8), "x");
        assert!(json_view(&tuple_keys, "e1").is_none());
    }
}
