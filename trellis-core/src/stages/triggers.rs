use async_trait::async_trait;

use crate::error::Result;
use crate::messages::Message;
use crate::stages::Stage;
use crate::triggers::Dispatcher;

pub struct TriggerStage {
    dispatcher: Dispatcher,
}

impl TriggerStage {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

#[async_trait]
impl Stage for TriggerStage {
    fn name(&self) -> &str {
        "db-triggers"
    }

    async fn handle(&self, message: Message) -> Result<()> {
        let report = self.dispatcher.dispatch(&message).await;
        if report.matched > 0 {
            tracing::info!(
                event_id = %message.event_id,
                seed_id = %message.header.seed_id,
                matched = report.matched,
                published = report.published,
                failed = report.failed,
                "triggers evaluated"
            );
        }
        Ok(())
    }
}
