use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::bus::MessageBus;
use crate::error::{Error, Result};
use crate::messages::Message;

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub topic: String,
    pub message: Message,
}

#[derive(Clone)]
pub struct LocalBus {
    sender: mpsc::UnboundedSender<Delivery>,
}

impl LocalBus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, topic: &str, message: Message) -> Result<()> {
        tracing::debug!(
            topic,
            event_id = %message.event_id,
            seed_id = %message.header.seed_id,
            "publishing message"
        );
        self.sender
            .send(Delivery {
                topic: topic.to_owned(),
                message,
            })
            .map_err(|_| Error::Bus(format!("cannot publish to '{topic}': local bus is closed")))
    }
}
