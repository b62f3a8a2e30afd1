pub mod body;
pub mod header;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::graph::labels::LabelSet;

pub use body::{KillCommand, MessageBody, QueryRequest, QueryResultBody, ResultStructure};
pub use header::{Method, MessageHeader, Resource};

/// Labels the query stage adds to every result header. A requeue strips
/// them again before re-issuing the query.
pub const RESULT_LABELS: [&str; 2] = ["Database", "Result"];

/// A root message is its own seed; derived messages copy the seed and
/// record the parent's event id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub event_id: String,
    pub header: MessageHeader,
    pub body: MessageBody,
}

impl Message {
    pub fn root(
        sent_from: &str,
        resource: Resource,
        method: Method,
        labels: LabelSet,
        body: MessageBody,
    ) -> Self {
        let event_id = Uuid::new_v4().to_string();
        Self {
            header: MessageHeader {
                resource,
                method,
                labels,
                sent_from: sent_from.to_owned(),
                trigger: None,
                publish_to: None,
                seed_id: event_id.clone(),
                previous_event_id: None,
                retry_count: None,
            },
            event_id,
            body,
        }
    }

    /// A message caused by `parent`. The retry count is inherited, so it
    /// never decreases along a chain.
    pub fn derive(
        parent: &Message,
        sent_from: &str,
        resource: Resource,
        method: Method,
        labels: LabelSet,
        body: MessageBody,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            header: MessageHeader {
                resource,
                method,
                labels,
                sent_from: sent_from.to_owned(),
                trigger: None,
                publish_to: None,
                seed_id: parent.header.seed_id.clone(),
                previous_event_id: Some(parent.event_id.clone()),
                retry_count: parent.header.retry_count,
            },
            body,
        }
    }

    pub fn with_trigger(mut self, trigger: &str) -> Self {
        self.header.trigger = Some(trigger.to_owned());
        self
    }

    pub fn with_publish_to(mut self, topic: &str) -> Self {
        self.header.publish_to = Some(topic.to_owned());
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.header.retry_count = Some(retry_count);
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|err| Error::Serialization(format!("malformed bus message: {err}")))
    }
}
