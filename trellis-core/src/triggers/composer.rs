use crate::config::topics;
use crate::error::Result;
use crate::graph::labels::LabelSet;
use crate::graph::statement::{NodePattern, RequestKey, ResultMode, Statement};
use crate::messages::{Message, MessageBody, Method, QueryRequest, Resource};
use crate::triggers::{Outgoing, TriggerEvent};

pub const TRIGGER_SENDER: &str = "db-triggers";

pub const WAS_USED_BY: &str = "WAS_USED_BY";

#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub name: String,
    pub labels: LabelSet,
    pub method: Method,
    pub publish_to: String,
    pub result_split: bool,
    pub result_mode: ResultMode,
}

impl QueryOptions {
    pub fn new(name: &str, labels: LabelSet) -> Self {
        Self {
            name: name.to_owned(),
            labels,
            method: Method::Post,
            publish_to: topics::TRIGGERS.to_owned(),
            result_split: false,
            result_mode: ResultMode::Data,
        }
    }

    pub fn publish_to(mut self, topic_key: &str) -> Self {
        self.publish_to = topic_key.to_owned();
        self
    }

    pub fn split(mut self, split: bool) -> Self {
        self.result_split = split;
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn mode(mut self, mode: ResultMode) -> Self {
        self.result_mode = mode;
        self
    }
}

pub fn compose_query(
    event: &TriggerEvent<'_>,
    trigger: &str,
    statement: Statement,
    options: QueryOptions,
) -> Result<Outgoing> {
    let db_topic = event.config.topic(topics::DB_QUERY)?;
    let result_topic = event.config.topic(&options.publish_to)?;

    let request = QueryRequest::new(options.name, statement)
        .split(options.result_split)
        .mode(options.result_mode)
        .publish_to(result_topic);
    let message = Message::derive(
        event.message,
        TRIGGER_SENDER,
        Resource::Query,
        options.method,
        options.labels,
        MessageBody::Query(request),
    )
    .with_trigger(trigger)
    .with_publish_to(db_topic);

    Ok(Outgoing::now(db_topic, message))
}

/// The launch guard: a single query that creates the `JobRequest` for
/// `key` and links `inputs` to it only when no request exists yet. Its
/// result goes to the launcher, which launches once per non-empty result.
pub fn compose_guarded_request(
    event: &TriggerEvent<'_>,
    trigger: &str,
    key: RequestKey,
    inputs: NodePattern,
) -> Result<Outgoing> {
    let mut labels = LabelSet::of(&["Request", "JobRequest"]);
    labels.insert(key.task.clone());
    let options = QueryOptions::new(&format!("request-{}", key.task), labels)
        .publish_to(topics::LAUNCHER);
    compose_query(
        event,
        trigger,
        Statement::GuardedRequest {
            request: key,
            inputs,
            rel_type: WAS_USED_BY.to_owned(),
        },
        options,
    )
}
