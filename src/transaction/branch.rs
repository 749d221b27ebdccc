//! Broker-side participant of one distributed transaction.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::broker::Broker;
use crate::broker::message::{DetachableMessage, Message};
use crate::persistence::SharedMessageStore;
use crate::queue::QueueHandler;
use crate::transaction::Xid;
use crate::utils::BrokerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchState {
    Active,
    RollbackOnly,
    PrePrepare,
    Prepared,
    /// Known only from a prepared record in storage.
    PartialRestore,
    TimedOut,
    Forgotten,
    HeurCom,
    HeurRb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Active,
    Suspended,
}

pub struct Branch {
    xid: Xid,
    state: BranchState,
    store: Arc<SharedMessageStore>,
    affected: BTreeMap<String, Arc<QueueHandler>>,
    sessions: HashMap<u64, SessionState>,
    deadline: Option<Instant>,
}

impl Branch {
    pub fn new(xid: Xid, store: Arc<SharedMessageStore>) -> Self {
        store.branch(&xid);
        Self::with_state(xid, store, BranchState::Active)
    }

    /// Branch for an Xid found only in storage after a restart.
    pub fn recovery(xid: Xid, store: Arc<SharedMessageStore>) -> Self {
        Self::with_state(xid, store, BranchState::PartialRestore)
    }

    fn with_state(xid: Xid, store: Arc<SharedMessageStore>, state: BranchState) -> Self {
        Self {
            xid,
            state,
            store,
            affected: BTreeMap::new(),
            sessions: HashMap::new(),
            deadline: None,
        }
    }

    pub fn xid(&self) -> &Xid {
        &self.xid
    }

    pub fn state(&self) -> BranchState {
        self.state
    }

    pub fn set_state(&mut self, state: BranchState) {
        self.state = state;
    }

    fn track(&mut self, handler: Arc<QueueHandler>) {
        self.affected.insert(handler.name().to_string(), handler);
    }

    pub fn enqueue(&mut self, broker: &Broker, message: Message) -> Result<(), BrokerError> {
        for handler in broker.enqueue_xid(&self.xid, message)? {
            self.track(handler);
        }
        Ok(())
    }

    pub fn dequeue(
        &mut self,
        broker: &Broker,
        queue: &str,
        message: Arc<DetachableMessage>,
    ) -> Result<(), BrokerError> {
        let handler = broker.dequeue_xid(&self.xid, queue, message)?;
        self.track(handler);
        Ok(())
    }

    pub fn prepare(&mut self) -> Result<(), BrokerError> {
        self.state = BranchState::PrePrepare;
        self.store.prepare(&self.xid)?;
        self.state = BranchState::Prepared;
        debug!(xid = %self.xid, "branch prepared");
        Ok(())
    }

    /// Writes the branch and makes its queue changes visible.
    pub fn commit(&mut self, broker: &Broker, one_phase: bool) -> Result<(), BrokerError> {
        if self.state == BranchState::PartialRestore {
            let restored = self.store.restore_xid(&self.xid)?;
            for handler in broker.restore_prepared(&self.xid, restored) {
                self.track(handler);
            }
        }

        self.store.flush_xid(&self.xid, one_phase)?;
        for handler in self.affected.values() {
            handler.commit(&self.xid);
        }
        debug!(xid = %self.xid, one_phase, "branch committed");
        Ok(())
    }

    /// Discards the branch and any prepared record of it.
    pub fn dtx_rollback(&mut self) -> Result<(), BrokerError> {
        self.store.rollback_xid(&self.xid)?;
        self.rollback_queues();
        debug!(xid = %self.xid, "branch rolled back");
        Ok(())
    }

    fn rollback_queues(&self) {
        for handler in self.affected.values() {
            handler.rollback(&self.xid);
        }
    }

    pub fn associate_session(&mut self, session: u64) {
        self.sessions.insert(session, SessionState::Active);
    }

    pub fn resume_session(&mut self, session: u64) -> Result<(), BrokerError> {
        match self.sessions.get_mut(&session) {
            Some(state) if *state == SessionState::Suspended => {
                *state = SessionState::Active;
                Ok(())
            }
            _ => Err(BrokerError::validation(format!(
                "couldn't resume session {session} for branch with xid {}",
                self.xid
            ))),
        }
    }

    pub fn disassociate_session(&mut self, session: u64) {
        self.sessions.remove(&session);
    }

    pub fn suspend_session(&mut self, session: u64) {
        if let Some(state) = self.sessions.get_mut(&session) {
            *state = SessionState::Suspended;
        }
    }

    pub fn is_associated(&self, session: u64) -> bool {
        self.sessions.contains_key(&session)
    }

    pub fn has_active_sessions(&self) -> bool {
        self.sessions
            .values()
            .any(|state| *state == SessionState::Active)
    }

    pub fn clear_associations(&mut self) {
        self.sessions.clear();
    }

    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// A prepared branch never times out.
    pub fn is_expired(&self, now: Instant) -> bool {
        !self.is_prepared() && self.deadline.is_some_and(|deadline| now >= deadline)
    }

    pub fn is_prepared(&self) -> bool {
        matches!(self.state, BranchState::Prepared | BranchState::PartialRestore)
    }

    pub fn is_rollback_only(&self) -> bool {
        self.state == BranchState::RollbackOnly
    }
}
