//! Delivery: per-queue tasks that push messages to consumers, and the
//! scheduler that polls them.

pub mod scheduler;
pub mod task;

pub use scheduler::TaskScheduler;
pub use task::{DeadLetterSink, DeliveryTask, Task, TaskHint};

#[cfg(test)]
mod tests;
