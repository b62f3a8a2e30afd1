use async_trait::async_trait;
use std::sync::Arc;

use crate::bus::MessageBus;
use crate::config::{topics, Config};
use crate::error::{Error, Result};
use crate::graph::labels::LabelSet;
use crate::graph::statement::QueryResults;
use crate::graph::GraphDatabase;
use crate::messages::{Message, MessageBody, QueryResultBody, Resource, RESULT_LABELS};
use crate::stages::Stage;

pub const QUERY_SENDER: &str = "db-query";

pub struct QueryStage {
    graph: Arc<dyn GraphDatabase>,
    bus: Arc<dyn MessageBus>,
    config: Arc<Config>,
}

impl QueryStage {
    pub fn new(graph: Arc<dyn GraphDatabase>, bus: Arc<dyn MessageBus>, config: Arc<Config>) -> Self {
        Self { graph, bus, config }
    }
}

#[async_trait]
impl Stage for QueryStage {
    fn name(&self) -> &str {
        QUERY_SENDER
    }

    /// A failed statement is reported as an empty result so requeue rules
    /// still see it. With `result_split` every row becomes its own message;
    /// zero rows still produce one empty message.
    async fn handle(&self, message: Message) -> Result<()> {
        let MessageBody::Query(request) = &message.body else {
            return Err(Error::Validation(format!(
                "query stage cannot handle a {} message",
                message.body.kind()
            )));
        };

        let results = match self.graph.execute(&request.query, request.result_mode).await {
            Ok(results) => results,
            Err(err) => {
                tracing::warn!(
                    query = %request.query_name,
                    event_id = %message.event_id,
                    store = self.graph.name(),
                    error = %err,
                    "query failed; publishing empty result"
                );
                QueryResults::default()
            }
        };
        let results = request.shape(results);
        tracing::debug!(
            query = %request.query_name,
            op = request.query.kind(),
            rows = results.len(),
            "query executed"
        );

        let parts = if request.result_split {
            let parts = results.split();
            if parts.is_empty() {
                vec![results]
            } else {
                parts
            }
        } else {
            vec![results]
        };

        let topic = match &request.publish_to {
            Some(topic) => topic.clone(),
            None => self.config.topic(topics::TRIGGERS)?.to_owned(),
        };
        let labels = message.header.labels.union(&LabelSet::of(&RESULT_LABELS));
        for results in parts {
            let mut reply = Message::derive(
                &message,
                QUERY_SENDER,
                Resource::QueryResult,
                message.header.method,
                labels.clone(),
                MessageBody::QueryResult(QueryResultBody {
                    request: request.clone(),
                    results,
                }),
            )
            .with_publish_to(&topic);
            reply.header.trigger = message.header.trigger.clone();
            self.bus.publish(&topic, reply).await?;
        }
        Ok(())
    }
}
