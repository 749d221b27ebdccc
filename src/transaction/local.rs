use std::sync::Arc;

use tracing::debug;

use crate::broker::Broker;
use crate::broker::message::{DetachableMessage, Message};
use crate::transaction::PostTransactionAction;
use crate::utils::BrokerError;

/// Single-resource transaction of one session.
///
/// Queue and store changes apply as each call is made. Only the post
/// transaction actions are held back: commit runs their commit hooks and
/// rollback their rollback hooks, both in registration order.
pub struct LocalTransaction {
    broker: Arc<Broker>,
    actions: Vec<Box<dyn PostTransactionAction>>,
    errors: Vec<String>,
}

impl LocalTransaction {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self {
            broker,
            actions: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn enqueue(
        &mut self,
        message: Message,
        action: Option<Box<dyn PostTransactionAction>>,
    ) -> Result<(), BrokerError> {
        let result = self.broker.publish(message);
        self.record(result, action)
    }

    pub fn dequeue(
        &mut self,
        queue: &str,
        message: Arc<DetachableMessage>,
        action: Option<Box<dyn PostTransactionAction>>,
    ) -> Result<(), BrokerError> {
        let result = self.broker.acknowledge(queue, &message);
        self.record(result, action)
    }

    fn record(
        &mut self,
        result: Result<(), BrokerError>,
        action: Option<Box<dyn PostTransactionAction>>,
    ) -> Result<(), BrokerError> {
        if let Some(action) = action {
            self.actions.push(action);
        }
        if let Err(e) = &result {
            self.errors.push(e.to_string());
        }
        result
    }

    /// Fails without running any hook if an operation of this transaction
    /// failed; the caller is expected to roll back.
    pub fn commit(&mut self) -> Result<(), BrokerError> {
        if !self.errors.is_empty() {
            return Err(BrokerError::validation(format!(
                "pre conditions failed for commit. Errors: {}",
                self.errors.join("; ")
            )));
        }
        debug!(actions = self.actions.len(), "local commit");
        for action in &mut self.actions {
            action.post_commit();
        }
        self.clear();
        Ok(())
    }

    pub fn rollback(&mut self) {
        debug!(actions = self.actions.len(), "local rollback");
        for action in &mut self.actions {
            action.on_rollback();
        }
        self.clear();
    }

    fn clear(&mut self) {
        self.actions.clear();
        self.errors.clear();
    }
}
