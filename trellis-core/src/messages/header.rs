use serde::{Deserialize, Serialize};

use crate::graph::labels::LabelSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resource {
    Query,
    QueryResult,
    Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Post,
    Update,
    View,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeader {
    pub resource: Resource,
    pub method: Method,
    #[serde(default)]
    pub labels: LabelSet,
    pub sent_from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_to: Option<String>,
    pub seed_id: String,
    #[serde(default)]
    pub previous_event_id: Option<String>,
    #[serde(
        default,
        rename = "retry-count",
        skip_serializing_if = "Option::is_none"
    )]
    pub retry_count: Option<u32>,
}

impl MessageHeader {
    pub fn retries(&self) -> u32 {
        self.retry_count.unwrap_or(0)
    }

    pub fn is_root(&self) -> bool {
        self.previous_event_id.is_none()
    }
}
