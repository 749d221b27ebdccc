//! The `broker` module is the entry point the protocol layer drives.
//!
//! It holds the message model, message assembly, exchanges, the consumer
//! contract and the `Broker` facade tying queues, store, transactions and
//! delivery together.

pub mod consumer;
pub mod content;
pub mod engine;
pub mod exchange;
pub mod message;

pub use consumer::{ChannelConsumer, Consumer, Delivery};
pub use content::{ID_RESERVATION_BLOCK, InboundMessage, MessageIdGenerator};
pub use engine::Broker;
pub use exchange::{DEAD_LETTER_EXCHANGE, DEAD_LETTER_QUEUE, Exchange, ExchangeType};
pub use message::{ContentChunk, DetachableMessage, FieldValue, Message, Metadata};
