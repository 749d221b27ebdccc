//! Queues: the ordered in-memory buffer and the handler that owns it.

pub mod buffer;
pub mod handler;

pub use buffer::{MessageReader, NodeState, QueueBuffer};
pub use handler::QueueHandler;

#[cfg(test)]
mod tests;
