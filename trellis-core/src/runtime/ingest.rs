use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::{topics, Config};
use crate::error::{Error, Result};
use crate::graph::labels::LabelSet;
use crate::graph::model::Properties;
use crate::graph::statement::Statement;
use crate::messages::{Message, MessageBody, Method, QueryRequest, Resource};

pub const INGEST_SENDER: &str = "ingest";

/// With `key` set the node is merged on those properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRecord {
    pub labels: LabelSet,
    #[serde(default)]
    pub key: Option<Properties>,
    #[serde(default)]
    pub properties: Properties,
}

impl IngestRecord {
    pub fn new(labels: &[&str], properties: Properties) -> Self {
        Self {
            labels: LabelSet::of(labels),
            key: None,
            properties,
        }
    }

    /// Root query message creating this node. Its result goes to the
    /// trigger stage under header labels `Create` plus the node labels.
    pub fn to_message(&self, config: &Config) -> Result<Message> {
        if self.labels.is_empty() {
            return Err(Error::Validation("ingested node needs at least one label".to_owned()));
        }
        let statement = match &self.key {
            Some(key) => Statement::MergeNode {
                labels: self.labels.clone(),
                key: key.clone(),
                properties: self.properties.clone(),
            },
            None => Statement::CreateNode {
                labels: self.labels.clone(),
                properties: self.properties.clone(),
            },
        };

        let db_topic = config.topic(topics::DB_QUERY)?;
        let request = QueryRequest::new(format!("ingest-{}", statement.kind()), statement)
            .publish_to(config.topic(topics::TRIGGERS)?);
        let mut labels = LabelSet::of(&["Create"]);
        labels.extend(&self.labels);
        Ok(Message::root(
            INGEST_SENDER,
            Resource::Query,
            Method::Post,
            labels,
            MessageBody::Query(request),
        )
        .with_publish_to(db_topic))
    }
}

pub fn load_records(path: &Path) -> Result<Vec<IngestRecord>> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        Error::Config(format!("failed to read ingest file '{}': {err}", path.display()))
    })?;
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .unwrap_or_default();

    if matches!(ext, "yaml" | "yml") {
        serde_yaml::from_str(&raw).map_err(|err| {
            Error::Config(format!("failed parsing ingest yaml '{}': {err}", path.display()))
        })
    } else {
        serde_json::from_str(&raw).map_err(|err| {
            Error::Config(format!("failed parsing ingest json '{}': {err}", path.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_becomes_root_create_query() {
        let config = Config::default();
        let record = IngestRecord::new(
            &["Blob", "Fastq"],
            json!({"sample": "S1"}).as_object().cloned().unwrap_or_default(),
        );
        let message = record.to_message(&config).expect("message");

        assert!(message.header.is_root());
        assert_eq!(message.header.seed_id, message.event_id);
        assert_eq!(message.header.labels, LabelSet::of(&["Create", "Blob", "Fastq"]));
        assert_eq!(message.header.publish_to.as_deref(), Some("db-query"));
        let request = message.body.as_query().expect("query");
        assert_eq!(request.publish_to.as_deref(), Some("db-triggers"));
        assert!(matches!(request.query, Statement::CreateNode { .. }));
    }

    #[test]
    fn keyed_record_merges() {
        let yaml = r#"
- labels: [Blob, Fastq]
  key: { path: "gs://b/S1_R1.fastq.gz" }
  properties: { sample: S1, matePair: 1, readGroup: 0 }
"#;
        let records: Vec<IngestRecord> = serde_yaml::from_str(yaml).expect("parse");
        let message = records[0].to_message(&Config::default()).expect("message");
        let request = message.body.as_query().expect("query");
        assert!(matches!(request.query, Statement::MergeNode { .. }));
    }

    #[test]
    fn unlabelled_record_is_rejected() {
        let record = IngestRecord::new(&[], Properties::new());
        assert!(matches!(record.to_message(&Config::default()), Err(Error::Validation(_))));
    }
}
