//! # PopCore
//!
//! `popcore` is the storage-and-delivery core of a message broker. It holds
//! messages once a publisher hands them over, decides what each consumer gets
//! next, keeps durable messages across restarts and offers auto-commit, local
//! and distributed (two-phase) transactions around enqueue and dequeue.
//!
//! ## Core Modules
//!
//! - `broker`: message model, assembly, exchanges, consumers and the `Broker` facade.
//! - `queue`: the per-queue ordered buffer and the handler that owns it.
//! - `persistence`: the write-behind store pipeline on top of `sled`.
//! - `transaction`: auto-commit, local and distributed transactions.
//! - `delivery`: per-queue delivery tasks and the scheduler polling them.
//! - `config`: layered configuration loading.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod config;
pub mod delivery;
pub mod persistence;
pub mod queue;
pub mod transaction;
pub mod utils;

#[cfg(test)]
mod tests;
