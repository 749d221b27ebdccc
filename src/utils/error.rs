//! Error types for the broker core.
//!
//! `BrokerError` is what callers of the queue, store and transaction layers
//! see. Sequencing and content errors are reported synchronously and are never
//! retried. `StoreError` covers the backing store; inside the store pipeline it
//! is logged by the final stage and never reaches a producer.

use thiserror::Error;

use crate::transaction::Xid;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("unknown message id {id}, cannot attach to queue {queue}")]
    UnknownMessage { id: u64, queue: String },

    #[error("branch not found with xid {0}")]
    UnknownXid(Xid),

    #[error("queue {0} does not exist")]
    UnknownQueue(String),

    #[error("exchange {0} does not exist")]
    UnknownExchange(String),

    #[error("queue {0} already exists with different properties")]
    QueueExists(String),

    #[error("queue {queue} is in use by {consumers} consumer(s)")]
    QueueInUse { queue: String, consumers: usize },

    #[error("queue {0} is full")]
    QueueFull(String),

    #[error("content overflow: declared {declared} bytes, received {received}")]
    ContentOverflow { declared: u64, received: u64 },

    #[error("{0}")]
    Validation(String),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BrokerError {
    pub fn validation(message: impl Into<String>) -> Self {
        BrokerError::Validation(message.into())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("store pipeline is closed")]
    Closed,
}
