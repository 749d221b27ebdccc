use std::sync::{Arc, Weak};

use tracing::{trace, warn};

use crate::broker::Message;
use crate::config::{DeliveryFailurePolicy, DeliverySettings};
use crate::queue::QueueHandler;
use crate::utils::BrokerError;

/// What a task reports after one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskHint {
    /// Did work; poll again right away.
    Active,
    Idle,
}

/// A pull-based unit of work polled by the scheduler. One invocation must
/// be bounded.
pub trait Task: Send + Sync {
    fn id(&self) -> &str;

    fn run(&self) -> TaskHint;

    fn on_remove(&self) {}
}

/// Takes over messages a queue gives up on.
pub trait DeadLetterSink: Send + Sync {
    fn dead_letter(&self, queue: &str, message: Message) -> Result<(), BrokerError>;
}

/// Moves messages from one queue to its consumers.
pub struct DeliveryTask {
    id: String,
    handler: Arc<QueueHandler>,
    batch_limit: usize,
    failure_policy: DeliveryFailurePolicy,
    max_redelivery_count: u32,
    dead_letters: Option<Weak<dyn DeadLetterSink>>,
}

impl DeliveryTask {
    pub fn new(handler: Arc<QueueHandler>, settings: &DeliverySettings) -> Self {
        Self {
            id: handler.name().to_string(),
            handler,
            batch_limit: settings.batch_limit,
            failure_policy: settings.failure_policy,
            max_redelivery_count: settings.max_redelivery_count,
            dead_letters: None,
        }
    }

    /// Sends messages that fail more than `max_redelivery_count` times to
    /// `sink` instead of requeueing them.
    pub fn with_dead_letters(mut self, sink: Weak<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    fn on_failure(&self, message: Message) {
        if self.failure_policy != DeliveryFailurePolicy::Requeue {
            return;
        }
        if message.redelivery_count() >= self.max_redelivery_count {
            if let Some(sink) = self.dead_letters.as_ref().and_then(|sink| sink.upgrade()) {
                let id = message.internal_id();
                match sink.dead_letter(self.queue(), message) {
                    Ok(()) => trace!(queue = self.queue(), id, "dead-lettered"),
                    Err(e) => warn!(queue = self.queue(), id, error = %e, "dead-lettering failed"),
                }
                return;
            }
        }
        self.handler.requeue(message);
    }

    pub fn queue(&self) -> &str {
        self.handler.name()
    }
}

impl Task for DeliveryTask {
    fn id(&self) -> &str {
        &self.id
    }

    /// Delivers up to `batch_limit` messages round robin. A failed send ends
    /// the invocation.
    fn run(&self) -> TaskHint {
        let mut delivered = 0;
        while delivered < self.batch_limit && self.handler.has_ready_consumer() {
            let Some(message) = self.handler.take_for_delivery() else {
                break;
            };
            let Some(consumer) = self.handler.next_consumer() else {
                self.handler.restore_undelivered(message);
                break;
            };

            let id = message.internal_id();
            let delivery_tag = self.handler.next_delivery_tag();
            match consumer.send(message.clone(), delivery_tag) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(queue = self.queue(), id, consumer = consumer.id(), error = %e, "delivery failed");
                    self.on_failure(message);
                    break;
                }
            }
        }

        trace!(queue = self.queue(), delivered, "delivery pass");
        if delivered > 0 {
            TaskHint::Active
        } else {
            TaskHint::Idle
        }
    }

    fn on_remove(&self) {
        trace!(queue = self.queue(), "delivery task removed");
    }
}
