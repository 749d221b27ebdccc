//! Transaction layer: auto-commit, local and distributed (XA) transactions
//! over the same queue and store primitives.

pub mod auto;
pub mod branch;
pub mod distributed;
pub mod local;
pub mod registry;
pub mod xid;

use std::sync::Arc;
use std::time::Duration;

pub use auto::AutoCommitTransaction;
pub use branch::{Branch, BranchState};
pub use distributed::DistributedTransaction;
pub use local::LocalTransaction;
pub use registry::Registry;
pub use xid::Xid;

use crate::broker::message::{DetachableMessage, Message};
use crate::utils::BrokerError;

/// Caller-supplied hook run when a transaction completes.
pub trait PostTransactionAction: Send {
    fn post_commit(&mut self);

    fn on_rollback(&mut self) {}
}

/// The transaction a session currently runs under.
pub enum BrokerTransaction {
    AutoCommit(AutoCommitTransaction),
    Local(LocalTransaction),
    Distributed(DistributedTransaction),
}

impl BrokerTransaction {
    fn kind(&self) -> &'static str {
        match self {
            BrokerTransaction::AutoCommit(_) => "non-transactional",
            BrokerTransaction::Local(_) => "local-transactional",
            BrokerTransaction::Distributed(_) => "distributed-transactional",
        }
    }

    fn misuse(&self, operation: &str) -> BrokerError {
        BrokerError::validation(format!("{operation} called on {} channel", self.kind()))
    }

    fn distributed(&mut self, operation: &str) -> Result<&mut DistributedTransaction, BrokerError> {
        match self {
            BrokerTransaction::Distributed(tx) => Ok(tx),
            other => Err(other.misuse(operation)),
        }
    }

    pub fn enqueue(
        &mut self,
        message: Message,
        action: Option<Box<dyn PostTransactionAction>>,
    ) -> Result<(), BrokerError> {
        match self {
            BrokerTransaction::AutoCommit(tx) => tx.enqueue(message, action),
            BrokerTransaction::Local(tx) => tx.enqueue(message, action),
            BrokerTransaction::Distributed(tx) => tx.enqueue(message),
        }
    }

    pub fn dequeue(
        &mut self,
        queue: &str,
        message: Arc<DetachableMessage>,
        action: Option<Box<dyn PostTransactionAction>>,
    ) -> Result<(), BrokerError> {
        match self {
            BrokerTransaction::AutoCommit(tx) => tx.dequeue(queue, message, action),
            BrokerTransaction::Local(tx) => tx.dequeue(queue, message, action),
            BrokerTransaction::Distributed(tx) => tx.dequeue(queue, message),
        }
    }

    /// No-op outside a local transaction.
    pub fn commit(&mut self) -> Result<(), BrokerError> {
        match self {
            BrokerTransaction::AutoCommit(_) => Ok(()),
            BrokerTransaction::Local(tx) => tx.commit(),
            BrokerTransaction::Distributed(_) => Err(self.misuse("tx.commit")),
        }
    }

    pub fn rollback(&mut self) -> Result<(), BrokerError> {
        match self {
            BrokerTransaction::AutoCommit(_) => Ok(()),
            BrokerTransaction::Local(tx) => {
                tx.rollback();
                Ok(())
            }
            BrokerTransaction::Distributed(_) => Err(self.misuse("tx.rollback")),
        }
    }

    pub fn is_transactional(&self) -> bool {
        match self {
            BrokerTransaction::AutoCommit(_) => false,
            BrokerTransaction::Local(_) => true,
            BrokerTransaction::Distributed(tx) => tx.in_transaction_block(),
        }
    }

    /// Session closed: an open local transaction is rolled back.
    pub fn on_close(&mut self) {
        if let BrokerTransaction::Local(tx) = self {
            tx.rollback();
        }
    }

    pub fn start(&mut self, xid: &Xid, join: bool, resume: bool) -> Result<(), BrokerError> {
        self.distributed("dtx.start")?.start(xid, join, resume)
    }

    pub fn end(&mut self, xid: &Xid, fail: bool, suspend: bool) -> Result<(), BrokerError> {
        self.distributed("dtx.end")?.end(xid, fail, suspend)
    }

    pub fn prepare(&mut self, xid: &Xid) -> Result<(), BrokerError> {
        self.distributed("dtx.prepare")?.prepare(xid)
    }

    pub fn commit_xid(&mut self, xid: &Xid, one_phase: bool) -> Result<(), BrokerError> {
        self.distributed("dtx.commit")?.commit(xid, one_phase)
    }

    pub fn rollback_xid(&mut self, xid: &Xid) -> Result<(), BrokerError> {
        self.distributed("dtx.rollback")?.rollback(xid)
    }

    pub fn forget(&mut self, xid: &Xid) -> Result<(), BrokerError> {
        self.distributed("dtx.forget")?.forget(xid)
    }

    pub fn set_timeout(&mut self, xid: &Xid, timeout: Duration) -> Result<(), BrokerError> {
        self.distributed("dtx.set-timeout")?.set_timeout(xid, timeout)
    }
}

#[cfg(test)]
mod tests;
