use async_trait::async_trait;
use std::sync::Arc;

use crate::bus::MessageBus;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::messages::Message;
use crate::stages::Stage;
use crate::triggers::dedup::{DedupPlan, DEDUP_SENDER};

pub struct DedupStage {
    bus: Arc<dyn MessageBus>,
    config: Arc<Config>,
}

impl DedupStage {
    pub fn new(bus: Arc<dyn MessageBus>, config: Arc<Config>) -> Self {
        Self { bus, config }
    }
}

#[async_trait]
impl Stage for DedupStage {
    fn name(&self) -> &str {
        DEDUP_SENDER
    }

    async fn handle(&self, message: Message) -> Result<()> {
        let Some(result) = message.body.as_result() else {
            return Err(Error::Validation(format!(
                "dedup stage cannot handle a {} message",
                message.body.kind()
            )));
        };
        let Some(plan) = DedupPlan::from_jobs(&result.results.nodes) else {
            tracing::debug!(event_id = %message.event_id, "no duplicate jobs running");
            return Ok(());
        };

        for outgoing in plan.compose(&message, &self.config)? {
            if let Err(err) = self.bus.publish(&outgoing.topic, outgoing.message).await {
                tracing::error!(topic = %outgoing.topic, error = %err, "failed to publish dedup message");
            }
        }
        Ok(())
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
    use serde_json::json;

    fn running(count: usize) -> Message {
        let nodes = (0..count)
            .map(|n| {
                let properties = json!({"jobId": format!("job-{n}"), "status": "RUNNING"});
                Node::new(format!("{n}"), LabelSet::of(&["Job"]), properties.as_object().cloned().unwrap_or_default())
            })
            .collect();
        Message::root(
            "db-query",
            Resource::QueryResult,
            Method::View,
            LabelSet::of(&["Match", "Job", "Running", "Database", "Result"]),
            MessageBody::QueryResult(QueryResultBody {
                request: QueryRequest::new("find-duplicate-jobs", Statement::MatchNodes { pattern: NodePattern::default() }),
                results: QueryResults {
                    nodes,
                    ..QueryResults::default()
                },
            }),
        )
    }

    #[tokio::test]
    async fn three_duplicates_yield_three_kills_and_three_marks() {
        let (bus, mut receiver) = LocalBus::new();
        let stage = DedupStage::new(Arc::new(bus), Arc::new(Config::default()));
        stage.handle(running(4)).await.expect("handle");

        let mut topics = Vec::new();
        while let Ok(delivery) = receiver.try_recv() {
            topics.push(delivery.topic);
        }
        assert_eq!(topics.iter().filter(|t| *t == "kill-job").count(), 3);
        assert_eq!(topics.iter().filter(|t| *t == "db-query").count(), 3);
    }

    #[tokio::test]
    async fn single_job_is_left_alone() {
        let (bus, mut receiver) = LocalBus::new();
        let stage = DedupStage::new(Arc::new(bus), Arc::new(Config::default()));
        stage.handle(running(1)).await.expect("handle");
        assert!(receiver.try_recv().is_err());
    }
}
