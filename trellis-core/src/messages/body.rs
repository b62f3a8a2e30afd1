use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::graph::statement::{QueryResults, ResultMode, Statement};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStructure {
    #[default]
    List,
    /// Rows keyed by element id; repeated rows collapse into one.
    Dict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub query_name: String,
    pub query: Statement,
    pub write_transaction: bool,
    #[serde(default)]
    pub result_mode: ResultMode,
    #[serde(default)]
    pub result_structure: ResultStructure,
    #[serde(default)]
    pub result_split: bool,
    /// Topic the result is published to. No result is published when unset.
    #[serde(default)]
    pub publish_to: Option<String>,
}

impl QueryRequest {
    pub fn new(query_name: impl Into<String>, query: Statement) -> Self {
        let write_transaction = query.is_write();
        Self {
            query_name: query_name.into(),
            query,
            write_transaction,
            result_mode: ResultMode::Data,
            result_structure: ResultStructure::List,
            result_split: false,
            publish_to: None,
        }
    }

    pub fn split(mut self, split: bool) -> Self {
        self.result_split = split;
        self
    }

    pub fn mode(mut self, mode: ResultMode) -> Self {
        self.result_mode = mode;
        self
    }

    pub fn structure(mut self, structure: ResultStructure) -> Self {
        self.result_structure = structure;
        self
    }

    pub fn publish_to(mut self, topic: impl Into<String>) -> Self {
        self.publish_to = Some(topic.into());
        self
    }

    pub fn shape(&self, mut results: QueryResults) -> QueryResults {
        if self.result_structure == ResultStructure::Dict {
            let mut seen = HashSet::new();
            results.nodes.retain(|node| seen.insert(node.id.clone()));
            let mut seen = HashSet::new();
            results.relationships.retain(|rel| seen.insert(rel.id.clone()));
        }
        results
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResultBody {
    pub request: QueryRequest,
    pub results: QueryResults,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillCommand {
    pub job_id: String,
    #[serde(default)]
    pub backend_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Query(QueryRequest),
    QueryResult(QueryResultBody),
    Kill(KillCommand),
}

impl MessageBody {
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Query(_) => "query",
            MessageBody::QueryResult(_) => "query_result",
            MessageBody::Kill(_) => "kill",
        }
    }

    pub fn as_query(&self) -> Option<&QueryRequest> {
        match self {
            MessageBody::Query(request) => Some(request),
            _ => None,
        }
    }

    pub fn as_result(&self) -> Option<&QueryResultBody> {
        match self {
            MessageBody::QueryResult(result) => Some(result),
            _ => None,
        }
    }

    pub fn as_kill(&self) -> Option<&KillCommand> {
        match self {
            MessageBody::Kill(command) => Some(command),
            _ => None,
        }
    }
}
