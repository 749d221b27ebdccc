//! Delivery endpoints registered on a queue.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use uuid::Uuid;

use crate::broker::message::Message;
use crate::utils::BrokerError;

/// Receives messages from the delivery scheduler. Implemented by the
/// protocol layer; a failed send is reported as an error, never retried here.
pub trait Consumer: Send + Sync {
    fn id(&self) -> &str;

    fn queue(&self) -> &str;

    /// Whether the consumer can take another message right now.
    fn is_ready(&self) -> bool {
        true
    }

    fn send(&self, message: Message, delivery_tag: u64) -> Result<(), BrokerError>;
}

/// A message handed to a consumer together with its delivery tag.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub message: Message,
}

/// Consumer that forwards deliveries over an unbounded tokio channel.
pub struct ChannelConsumer {
    id: String,
    queue: String,
    sender: UnboundedSender<Delivery>,
    paused: AtomicBool,
}

impl ChannelConsumer {
    pub fn new(queue: &str) -> (Self, UnboundedReceiver<Delivery>) {
        let (sender, receiver) = unbounded_channel();
        let consumer = Self {
            id: Uuid::new_v4().to_string(),
            queue: queue.to_string(),
            sender,
            paused: AtomicBool::new(false),
        };
        (consumer, receiver)
    }

    /// Flow control: a paused consumer is skipped by delivery.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }
}

impl Consumer for ChannelConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn queue(&self) -> &str {
        &self.queue
    }

    fn is_ready(&self) -> bool {
        !self.paused.load(Ordering::Acquire) && !self.sender.is_closed()
    }

    fn send(&self, message: Message, delivery_tag: u64) -> Result<(), BrokerError> {
        self.sender
            .send(Delivery {
                delivery_tag,
                message,
            })
            .map_err(|_| BrokerError::Delivery(format!("consumer {} disconnected", self.id)))
    }
}

impl fmt::Debug for ChannelConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConsumer")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .finish()
    }
}
