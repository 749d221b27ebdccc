use std::sync::Arc;
use std::time::Duration;

use crate::broker::Broker;
use crate::broker::message::{DetachableMessage, Message};
use crate::transaction::Xid;
use crate::transaction::branch::{Branch, BranchState};
use crate::transaction::registry::BranchRef;
use crate::utils::BrokerError;

/// Session side of XA. Between `start` and `end` enqueues and dequeues go
/// to the associated branch; outside they apply directly.
pub struct DistributedTransaction {
    broker: Arc<Broker>,
    session: u64,
    branch: Option<BranchRef>,
    errors: Vec<String>,
}

impl DistributedTransaction {
    pub fn new(broker: Arc<Broker>, session: u64) -> Self {
        Self {
            broker,
            session,
            branch: None,
            errors: Vec::new(),
        }
    }

    pub fn enqueue(&mut self, message: Message) -> Result<(), BrokerError> {
        let result = match &self.branch {
            Some(branch) => branch.lock().enqueue(&self.broker, message),
            None => self.broker.publish(message),
        };
        self.record(result)
    }

    pub fn dequeue(&mut self, queue: &str, message: Arc<DetachableMessage>) -> Result<(), BrokerError> {
        let result = match &self.branch {
            Some(branch) => branch.lock().dequeue(&self.broker, queue, message),
            None => self.broker.acknowledge(queue, &message),
        };
        self.record(result)
    }

    fn record(&mut self, result: Result<(), BrokerError>) -> Result<(), BrokerError> {
        if let Err(e) = &result {
            self.errors.push(e.to_string());
        }
        result
    }

    pub fn start(&mut self, xid: &Xid, join: bool, resume: bool) -> Result<(), BrokerError> {
        if join && resume {
            return Err(BrokerError::validation(format!(
                "cannot start a branch with both join and resume set {xid}"
            )));
        }

        let registry = self.broker.dtx_registry();
        let existing = registry.branch(xid)?;
        let branch = if join || resume {
            let branch = existing.ok_or_else(|| BrokerError::UnknownXid(xid.clone()))?;
            {
                let mut guard = branch.lock();
                if join {
                    guard.associate_session(self.session);
                } else {
                    guard.resume_session(self.session)?;
                }
            }
            branch
        } else {
            if existing.is_some() {
                return Err(BrokerError::validation(format!(
                    "xid {xid} cannot be started as it is already known"
                )));
            }
            let branch = registry.register(Branch::new(xid.clone(), self.broker.store().clone()))?;
            branch.lock().associate_session(self.session);
            branch
        };

        self.branch = Some(branch);
        Ok(())
    }

    pub fn end(&mut self, xid: &Xid, fail: bool, suspend: bool) -> Result<(), BrokerError> {
        let branch = self
            .broker
            .dtx_registry()
            .branch(xid)?
            .ok_or_else(|| BrokerError::UnknownXid(xid.clone()))?;

        let result = {
            let mut branch = branch.lock();
            if suspend && fail {
                branch.disassociate_session(self.session);
                Err(BrokerError::validation(format!(
                    "cannot end a branch with both suspend and fail set {xid}"
                )))
            } else if !branch.is_associated(self.session) {
                return Err(BrokerError::validation(format!(
                    "xid {xid} not associated with the current session"
                )));
            } else if suspend {
                branch.suspend_session(self.session);
                Ok(())
            } else {
                if fail {
                    branch.set_state(BranchState::RollbackOnly);
                }
                branch.disassociate_session(self.session);
                Ok(())
            }
        };

        self.branch = None;
        result
    }

    pub fn prepare(&mut self, xid: &Xid) -> Result<(), BrokerError> {
        if !self.errors.is_empty() {
            return Err(BrokerError::validation(format!(
                "pre conditions failed for prepare. Errors: {}",
                self.errors.join("; ")
            )));
        }
        self.broker.dtx_registry().prepare(xid)
    }

    pub fn commit(&mut self, xid: &Xid, one_phase: bool) -> Result<(), BrokerError> {
        self.broker
            .dtx_registry()
            .commit(&self.broker, xid, one_phase)?;
        self.errors.clear();
        Ok(())
    }

    pub fn rollback(&mut self, xid: &Xid) -> Result<(), BrokerError> {
        self.broker.dtx_registry().rollback(&self.broker, xid)?;
        self.errors.clear();
        Ok(())
    }

    pub fn forget(&mut self, xid: &Xid) -> Result<(), BrokerError> {
        self.broker.dtx_registry().forget(xid)
    }

    pub fn set_timeout(&mut self, xid: &Xid, timeout: Duration) -> Result<(), BrokerError> {
        self.broker.dtx_registry().set_timeout(xid, timeout)
    }

    pub fn in_transaction_block(&self) -> bool {
        self.branch.is_some()
    }
}
