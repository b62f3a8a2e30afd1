pub mod dedup;
pub mod kill;
pub mod launcher;
pub mod query;
pub mod triggers;

use async_trait::async_trait;

use crate::error::Result;
use crate::messages::Message;

pub use dedup::DedupStage;
pub use kill::KillStage;
pub use launcher::LauncherStage;
pub use query::QueryStage;
pub use triggers::TriggerStage;

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;
    async fn handle(&self, message: Message) -> Result<()>;
}
