use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::jobs::JobBackend;
use crate::messages::Message;
use crate::stages::Stage;

pub struct KillStage {
    backend: Arc<dyn JobBackend>,
}

impl KillStage {
    pub fn new(backend: Arc<dyn JobBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Stage for KillStage {
    fn name(&self) -> &str {
        "kill-job"
    }

    /// Kills by backend id when the job recorded one, else by job id.
    async fn handle(&self, message: Message) -> Result<()> {
        let Some(command) = message.body.as_kill() else {
            return Err(Error::Validation(format!(
                "kill stage cannot handle a {} message",
                message.body.kind()
            )));
        };
        let target = command.backend_id.as_deref().unwrap_or(&command.job_id);
        self.backend.kill(target).await?;
        tracing::info!(
            job_id = %command.job_id,
            backend_id = target,
            reason = %command.reason,
            "job killed"
        );
        Ok(())
    }
}
