//! Validates and drives the distributed transaction state machine.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::broker::Broker;
use crate::persistence::SharedMessageStore;
use crate::transaction::Xid;
use crate::transaction::branch::{Branch, BranchState};
use crate::utils::BrokerError;

pub type BranchRef = Arc<Mutex<Branch>>;

#[derive(Default)]
pub struct Registry {
    branches: Mutex<HashMap<Xid, BranchRef>>,
    /// Prepared Xids found in storage that have no live branch.
    stored: Mutex<HashSet<Xid>>,
    /// Serializes prepare, commit and rollback.
    outcome: Mutex<()>,
}

fn associated_error(xid: &Xid) -> BrokerError {
    BrokerError::validation(format!("branch still has associated active sessions for xid {xid}"))
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, branch: Branch) -> Result<BranchRef, BrokerError> {
        let mut branches = self.branches.lock();
        let xid = branch.xid().clone();
        if branches.contains_key(&xid) {
            return Err(BrokerError::validation(format!(
                "branch with the same xid {xid} is already registered"
            )));
        }
        let branch = Arc::new(Mutex::new(branch));
        branches.insert(xid, branch.clone());
        Ok(branch)
    }

    pub fn unregister(&self, xid: &Xid) {
        if self.branches.lock().remove(xid).is_none() {
            self.stored.lock().remove(xid);
        }
    }

    /// Live branch of `xid`. Branches only known from storage can be
    /// committed or rolled back, nothing else.
    pub fn branch(&self, xid: &Xid) -> Result<Option<BranchRef>, BrokerError> {
        if self.stored.lock().contains(xid) {
            return Err(BrokerError::validation(
                "branch is in prepared stage, it can only be committed or rolled back",
            ));
        }
        self.rollback_expired();
        Ok(self.branches.lock().get(xid).cloned())
    }

    fn live_branch(&self, xid: &Xid) -> Option<BranchRef> {
        self.branches.lock().get(xid).cloned()
    }

    pub fn prepare(&self, xid: &Xid) -> Result<(), BrokerError> {
        let _outcome = self.outcome.lock();
        if self.stored.lock().contains(xid) {
            return Err(BrokerError::validation(format!("branch {xid} is already prepared")));
        }
        let branch = self
            .live_branch(xid)
            .ok_or_else(|| BrokerError::UnknownXid(xid.clone()))?;
        let mut branch = branch.lock();

        if branch.has_active_sessions() {
            return Err(associated_error(xid));
        }
        self.check_expiration(&mut branch)?;
        branch.clear_associations();

        match branch.state() {
            BranchState::Active => branch.prepare(),
            BranchState::RollbackOnly => Err(BrokerError::validation("transaction can only be rolled back")),
            state => Err(BrokerError::validation(format!(
                "cannot prepare a branch in state {state:?}"
            ))),
        }
    }

    pub fn commit(&self, broker: &Broker, xid: &Xid, one_phase: bool) -> Result<(), BrokerError> {
        let _outcome = self.outcome.lock();
        let branch = match self.live_branch(xid) {
            Some(branch) => {
                {
                    let mut guard = branch.lock();
                    if guard.has_active_sessions() {
                        return Err(associated_error(xid));
                    }
                    self.check_expiration(&mut guard)?;
                    if guard.is_rollback_only() {
                        return Err(BrokerError::validation(format!(
                            "branch is set to rollback only, can't commit with xid {xid}"
                        )));
                    }
                    if !one_phase && !guard.is_prepared() {
                        return Err(BrokerError::validation(format!(
                            "cannot call two-phase commit on a non-prepared branch for xid {xid}"
                        )));
                    }
                }
                branch
            }
            None => self.recover(broker, xid)?,
        };

        let mut branch = branch.lock();
        if one_phase && branch.is_prepared() {
            return Err(BrokerError::validation(format!(
                "cannot call one-phase commit on a prepared branch for xid {xid}"
            )));
        }
        branch.clear_associations();
        branch.commit(broker, one_phase)?;
        branch.set_state(BranchState::Forgotten);
        drop(branch);
        self.unregister(xid);
        info!(%xid, one_phase, "distributed transaction committed");
        Ok(())
    }

    pub fn rollback(&self, broker: &Broker, xid: &Xid) -> Result<(), BrokerError> {
        let _outcome = self.outcome.lock();
        let branch = match self.live_branch(xid) {
            Some(branch) => {
                {
                    let mut guard = branch.lock();
                    self.check_expiration(&mut guard)?;
                    if guard.has_active_sessions() {
                        return Err(associated_error(xid));
                    }
                    guard.clear_associations();
                }
                branch
            }
            None => self.recover(broker, xid)?,
        };

        let mut branch = branch.lock();
        branch.dtx_rollback()?;
        branch.set_state(BranchState::Forgotten);
        drop(branch);
        self.unregister(xid);
        info!(%xid, "distributed transaction rolled back");
        Ok(())
    }

    /// Recovery branch for a prepared Xid known only from storage.
    fn recover(&self, broker: &Broker, xid: &Xid) -> Result<BranchRef, BrokerError> {
        if !self.stored.lock().contains(xid) {
            return Err(BrokerError::UnknownXid(xid.clone()));
        }
        debug!(%xid, "recovering branch from storage");
        Ok(Arc::new(Mutex::new(Branch::recovery(
            xid.clone(),
            broker.store().clone(),
        ))))
    }

    /// Only heuristically completed branches can be forgotten.
    pub fn forget(&self, xid: &Xid) -> Result<(), BrokerError> {
        let branch = self
            .live_branch(xid)
            .ok_or_else(|| BrokerError::UnknownXid(xid.clone()))?;
        let mut branch = branch.lock();
        if branch.has_active_sessions() {
            return Err(associated_error(xid));
        }
        if !matches!(branch.state(), BranchState::HeurCom | BranchState::HeurRb) {
            return Err(BrokerError::validation(format!(
                "branch is not heuristically complete, hence unable to forget xid {xid}"
            )));
        }
        branch.set_state(BranchState::Forgotten);
        drop(branch);
        self.unregister(xid);
        Ok(())
    }

    /// A zero timeout leaves the branch without a deadline.
    pub fn set_timeout(&self, xid: &Xid, timeout: Duration) -> Result<(), BrokerError> {
        let branch = self
            .live_branch(xid)
            .ok_or_else(|| BrokerError::UnknownXid(xid.clone()))?;
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        branch.lock().set_deadline(deadline);
        Ok(())
    }

    fn check_expiration(&self, branch: &mut Branch) -> Result<(), BrokerError> {
        if branch.state() == BranchState::TimedOut || branch.is_expired(Instant::now()) {
            let xid = branch.xid().clone();
            if branch.state() != BranchState::TimedOut {
                Self::expire(branch);
            }
            self.branches.lock().remove(&xid);
            return Err(BrokerError::validation(format!("transaction timed out for xid {xid}")));
        }
        Ok(())
    }

    fn expire(branch: &mut Branch) {
        if let Err(e) = branch.dtx_rollback() {
            error!(xid = %branch.xid(), error = %e, "rolling back timed out branch failed");
        }
        branch.set_state(BranchState::TimedOut);
    }

    /// Rolls back every branch past its deadline. Returns how many.
    pub fn rollback_expired(&self) -> usize {
        let now = Instant::now();
        let branches: Vec<BranchRef> = self.branches.lock().values().cloned().collect();
        let mut expired = Vec::new();
        for branch in branches {
            // Branches busy elsewhere are checked on the next sweep.
            let Some(mut guard) = branch.try_lock() else {
                continue;
            };
            if guard.is_expired(now) {
                Self::expire(&mut guard);
                debug!(xid = %guard.xid(), "branch timed out");
                expired.push(guard.xid().clone());
            }
        }

        let mut live = self.branches.lock();
        for xid in &expired {
            live.remove(xid);
        }
        expired.len()
    }

    /// Loads the prepared Xids left in storage by a previous run.
    pub fn sync_with_store(&self, store: &SharedMessageStore) -> Result<(), BrokerError> {
        let xids = store.stored_xids()?;
        let mut stored = self.stored.lock();
        stored.clear();
        stored.extend(xids);
        if !stored.is_empty() {
            info!(count = stored.len(), "prepared transactions awaiting outcome");
        }
        Ok(())
    }

    /// Prepared Xids awaiting an outcome, live and recovered.
    pub fn prepared_xids(&self) -> Vec<Xid> {
        let mut xids: Vec<Xid> = self.stored.lock().iter().cloned().collect();
        let branches: Vec<BranchRef> = self.branches.lock().values().cloned().collect();
        for branch in branches {
            let branch = branch.lock();
            if branch.is_prepared() {
                xids.push(branch.xid().clone());
            }
        }
        xids
    }

    pub fn is_registered(&self, xid: &Xid) -> bool {
        self.branches.lock().contains_key(xid)
    }
}
