use std::sync::Arc;

use crate::broker::Broker;
use crate::broker::message::{DetachableMessage, Message};
use crate::transaction::PostTransactionAction;
use crate::utils::BrokerError;

/// Every operation takes effect immediately.
pub struct AutoCommitTransaction {
    broker: Arc<Broker>,
}

impl AutoCommitTransaction {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }

    pub fn enqueue(
        &mut self,
        message: Message,
        action: Option<Box<dyn PostTransactionAction>>,
    ) -> Result<(), BrokerError> {
        self.broker.publish(message)?;
        if let Some(mut action) = action {
            action.post_commit();
        }
        Ok(())
    }

    /// The post action runs even when the acknowledgment fails, so consumer
    /// bookkeeping is never left behind.
    pub fn dequeue(
        &mut self,
        queue: &str,
        message: Arc<DetachableMessage>,
        action: Option<Box<dyn PostTransactionAction>>,
    ) -> Result<(), BrokerError> {
        let result = self.broker.acknowledge(queue, &message);
        if let Some(mut action) = action {
            action.post_commit();
        }
        result
    }
}
