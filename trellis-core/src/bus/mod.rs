pub mod local;

use async_trait::async_trait;

use crate::error::Result;
use crate::messages::Message;

pub use local::{Delivery, LocalBus};

/// At-least-once publish/subscribe transport. Topics are plain names;
/// consumers must tolerate duplicate and out-of-order delivery.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, message: Message) -> Result<()>;
}
