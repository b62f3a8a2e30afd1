pub mod composer;
pub mod conditions;
pub mod dedup;
pub mod defaults;
pub mod launch;
pub mod lineage;
pub mod registry;
pub mod requeue;
pub mod rules;
pub mod template;

use serde_json::Value;
use tokio::time::Duration;

use crate::config::Config;
use crate::error::Result;
use crate::graph::model::{Entity, Node, Relationship};
use crate::messages::{Message, MessageHeader};

pub use conditions::{Condition, ConditionSet};
pub use registry::{DispatchReport, Dispatcher, TriggerRegistry};

#[derive(Debug, Clone, Copy)]
pub struct TriggerEvent<'a> {
    pub message: &'a Message,
    pub entity: Option<&'a Entity>,
    pub config: &'a Config,
    body: &'a Value,
}

impl<'a> TriggerEvent<'a> {
    /// `body` is the JSON view of `message.body`, computed once per message.
    pub fn new(
        message: &'a Message,
        entity: Option<&'a Entity>,
        config: &'a Config,
        body: &'a Value,
    ) -> Self {
        Self {
            message,
            entity,
            config,
            body,
        }
    }

    pub fn header(&self) -> &'a MessageHeader {
        &self.message.header
    }

    pub fn body(&self) -> &'a Value {
        self.body
    }

    pub fn node(&self) -> Option<&'a Node> {
        self.entity.and_then(Entity::as_node)
    }

    pub fn relationship(&self) -> Option<&'a Relationship> {
        self.entity.and_then(Entity::as_relationship)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub topic: String,
    pub message: Message,
    pub delay: Option<Duration>,
}

impl Outgoing {
    pub fn now(topic: &str, message: Message) -> Self {
        Self {
            topic: topic.to_owned(),
            message,
            delay: None,
        }
    }

    pub fn delayed(topic: &str, message: Message, delay: Duration) -> Self {
        Self {
            topic: topic.to_owned(),
            message,
            delay: Some(delay),
        }
    }
}

/// `check` must be total and side-effect free apart from logging.
/// `compose` only builds messages; the dispatcher publishes them.
pub trait Trigger: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn check(&self, event: &TriggerEvent<'_>) -> bool;

    fn compose(&self, event: &TriggerEvent<'_>) -> Result<Vec<Outgoing>>;
}
