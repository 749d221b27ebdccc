//! The `persistence` module makes durable messages survive a restart.
//!
//! Producers never wait on disk. Operations go through a bounded ring buffer
//! into a single consumer thread that cancels redundant work, batches the rest
//! into `sled` transactions and reports failures in the log. The
//! `SharedMessageStore` is the only entry point the rest of the broker uses.

pub mod dao;
pub mod matcher;
pub mod operation;
pub mod pipeline;
pub mod ring;
pub mod sled_store;
pub mod store;
pub mod writer;

pub use dao::{MessageDao, PreparedRecord, StoredBinding, StoredExchange, StoredMessage, TransactionData};
pub use sled_store::SledMessageDao;
pub use store::{RestoredBranch, SharedMessageStore};
