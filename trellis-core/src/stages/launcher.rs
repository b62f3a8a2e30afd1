use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;

use crate::bus::MessageBus;
use crate::config::{topics, Config};
use crate::error::{Error, Result};
use crate::graph::labels::LabelSet;
use crate::graph::model::Properties;
use crate::graph::statement::Statement;
use crate::jobs::{JobBackend, JobSpec, TaskRegistry};
use crate::messages::{Message, MessageBody, Method, QueryRequest, Resource};
use crate::stages::Stage;
use crate::triggers::dedup::JOB_LABEL;

pub const LAUNCHER_SENDER: &str = "job-launcher";
pub const SUBMITTED: &str = "SUBMITTED";

/// An empty result means the request already existed.
pub struct LauncherStage {
    tasks: Arc<TaskRegistry>,
    backend: Arc<dyn JobBackend>,
    bus: Arc<dyn MessageBus>,
    config: Arc<Config>,
}

impl LauncherStage {
    pub fn new(
        tasks: Arc<TaskRegistry>,
        backend: Arc<dyn JobBackend>,
        bus: Arc<dyn MessageBus>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            tasks,
            backend,
            bus,
            config,
        }
    }

    fn job_node(spec: &JobSpec, backend_id: &str, request_id: &str) -> Statement {
        let mut key = Properties::new();
        key.insert("jobId".to_owned(), Value::String(spec.job_id.clone()));

        let mut properties = Properties::new();
        properties.insert("name".to_owned(), Value::String(spec.task.clone()));
        properties.insert("sample".to_owned(), Value::String(spec.sample.clone()));
        properties.insert("inputHash".to_owned(), Value::String(spec.input_hash.clone()));
        properties.insert(
            "inputIds".to_owned(),
            Value::Array(spec.input_ids.iter().cloned().map(Value::String).collect()),
        );
        properties.insert("status".to_owned(), Value::String(SUBMITTED.to_owned()));
        properties.insert("backendId".to_owned(), Value::String(backend_id.to_owned()));
        properties.insert("jobRequestId".to_owned(), Value::String(request_id.to_owned()));
        properties.insert("image".to_owned(), Value::String(spec.image.clone()));

        Statement::MergeNode {
            labels: LabelSet::of(&[JOB_LABEL]),
            key,
            properties,
        }
    }
}

#[async_trait]
impl Stage for LauncherStage {
    fn name(&self) -> &str {
        LAUNCHER_SENDER
    }

    async fn handle(&self, message: Message) -> Result<()> {
        let Some(result) = message.body.as_result() else {
            return Err(Error::Validation(format!(
                "launcher cannot handle a {} message",
                message.body.kind()
            )));
        };
        let results = &result.results;
        let Some(request) = results.relationships.first().map(|rel| &rel.end) else {
            tracing::debug!(
                event_id = %message.event_id,
                query = %result.request.query_name,
                "job already requested; nothing to launch"
            );
            return Ok(());
        };

        let task_name = request
            .str_property("name")
            .ok_or_else(|| Error::Validation(format!("job request '{}' has no task name", request.id)))?;
        let sample = request
            .str_property("sample")
            .ok_or_else(|| Error::Validation(format!("job request '{}' has no sample", request.id)))?;

        let task = self.tasks.get(task_name)?;
        let spec = task.bind(&results.nodes, sample, &self.config, Utc::now())?;
        let backend_id = self.backend.submit(&spec).await.map_err(|err| {
            tracing::error!(
                job_id = %spec.job_id,
                task = %spec.task,
                seed_id = %message.header.seed_id,
                backend = self.backend.name(),
                error = %err,
                "job submission failed"
            );
            err
        })?;
        tracing::info!(
            job_id = %spec.job_id,
            task = %spec.task,
            sample = %spec.sample,
            backend_id = %backend_id,
            "job submitted"
        );

        let db_topic = self.config.topic(topics::DB_QUERY)?;
        let result_topic = self.config.topic(topics::TRIGGERS)?;
        let query = QueryRequest::new(
            format!("create-job-{}", spec.task),
            Self::job_node(&spec, &backend_id, &request.id),
        )
        .publish_to(result_topic);
        let create = Message::derive(
            &message,
            LAUNCHER_SENDER,
            Resource::Query,
            Method::Post,
            LabelSet::of(&["Create", JOB_LABEL]),
            MessageBody::Query(query),
        )
        .with_publish_to(db_topic);
        self.bus.publish(db_topic, create).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::graph::model::{Node, Relationship};
    use crate::graph::statement::{NodePattern, QueryResults};
    use crate::jobs::DryRunBackend;
    use crate::messages::QueryResultBody;
    use crate::triggers::defaults::FASTQ_TO_UBAM;
    use serde_json::json;

    fn node(id: &str, labels: &[&str], properties: Value) -> Node {
        Node::new(id, LabelSet::of(labels), properties.as_object().cloned().unwrap_or_default())
    }

    fn guard_result(launched: bool) -> Message {
        let request = node("req", &["Request", "JobRequest"], json!({"sample": "S1", "name": FASTQ_TO_UBAM, "readGroup": 0}));
        let mut results = QueryResults::default();
        if launched {
            for mate in [1, 2] {
                let input = node(
                    &format!("f{mate}"),
                    &["Blob", "Fastq"],
                    json!({"sample": "S1", "readGroup": 0, "matePair": mate, "path": format!("gs://b/{mate}.fq")}),
                );
                results.relationships.push(Relationship {
                    id: format!("r{mate}"),
                    rel_type: "WAS_USED_BY".to_owned(),
                    start: input.clone(),
                    end: request.clone(),
                    properties: Properties::new(),
                });
                results.nodes.push(input);
            }
        }
        Message::root(
            "db-query",
            Resource::QueryResult,
            Method::Post,
            LabelSet::of(&["Request", "JobRequest", FASTQ_TO_UBAM, "Database", "Result"]),
            MessageBody::QueryResult(QueryResultBody {
                request: QueryRequest::new("request-fastq-to-ubam", Statement::MatchNodes { pattern: NodePattern::default() }),
                results,
            }),
        )
    }

    fn stage(backend: Arc<DryRunBackend>) -> (LauncherStage, tokio::sync::mpsc::UnboundedReceiver<crate::bus::Delivery>) {
        let config = Arc::new(Config::default());
        let tasks = Arc::new(TaskRegistry::with_defaults(&config).expect("tasks"));
        let (bus, receiver) = LocalBus::new();
        (LauncherStage::new(tasks, backend, Arc::new(bus), config), receiver)
    }

    #[tokio::test]
    async fn submits_and_records_the_job() {
        let backend = Arc::new(DryRunBackend::new());
        let (stage, mut receiver) = stage(backend.clone());
        let message = guard_result(true);
        stage.handle(message.clone()).await.expect("launch");

        let submitted = backend.submitted().await;
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].inputs["FASTQ_1"], "gs://b/1.fq");

        let delivery = receiver.try_recv().expect("create job");
        assert_eq!(delivery.topic, "db-query");
        assert_eq!(delivery.message.header.labels, LabelSet::of(&["Create", "Job"]));
        assert_eq!(delivery.message.header.seed_id, message.header.seed_id);
        let Statement::MergeNode { properties, key, .. } = &delivery.message.body.as_query().expect("query").query else {
            panic!("expected merge");
        };
        assert_eq!(key.get("jobId"), Some(&json!(submitted[0].job_id)));
        assert_eq!(properties.get("status"), Some(&json!("SUBMITTED")));
        assert_eq!(properties.get("jobRequestId"), Some(&json!("req")));
        assert_eq!(properties.get("inputIds"), Some(&json!(["f1", "f2"])));
    }

    #[tokio::test]
    async fn empty_guard_result_launches_nothing() {
        let backend = Arc::new(DryRunBackend::new());
        let (stage, mut receiver) = stage(backend.clone());
        stage.handle(guard_result(false)).await.expect("no-op");
        assert!(backend.submitted().await.is_empty());
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_submission_publishes_nothing() {
        let backend = Arc::new(DryRunBackend::failing());
        let (stage, mut receiver) = stage(backend);
        assert!(matches!(stage.handle(guard_result(true)).await, Err(Error::Backend(_))));
        assert!(receiver.try_recv().is_err());
    }
}
