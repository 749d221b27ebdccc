//! Facade the queues and transactions use instead of the pipeline.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::broker::message::{DetachableMessage, Message};
use crate::config::StoreSettings;
use crate::persistence::dao::{MessageDao, StoredMessage, TransactionData};
use crate::persistence::operation::DbOperation;
use crate::persistence::pipeline::StorePipeline;
use crate::queue::{MessageReader, QueueBuffer};
use crate::transaction::Xid;
use crate::utils::{BrokerError, StoreError};

/// What a prepared record in storage says a branch does.
#[derive(Debug, Default)]
pub struct RestoredBranch {
    /// Enqueued messages with their target queues.
    pub enqueued: Vec<(Message, BTreeSet<String>)>,
    /// Queue and internal id of every dequeue.
    pub dequeued: Vec<(String, u64)>,
}

pub struct SharedMessageStore {
    pending: DashMap<u64, Message>,
    transactions: DashMap<Xid, Arc<Mutex<TransactionData>>>,
    recovered: DashMap<u64, Weak<DetachableMessage>>,
    pipeline: StorePipeline,
    dao: Arc<dyn MessageDao>,
}

impl SharedMessageStore {
    pub fn new(dao: Arc<dyn MessageDao>, settings: &StoreSettings) -> Result<Self, StoreError> {
        Ok(Self {
            pending: DashMap::new(),
            transactions: DashMap::new(),
            recovered: DashMap::new(),
            pipeline: StorePipeline::start(dao.clone(), settings)?,
            dao,
        })
    }

    /// Registers a message that is not yet owned by any queue.
    pub fn add(&self, message: &Message) {
        self.pending.insert(message.internal_id(), message.clone());
    }

    pub fn attach(&self, queue: &str, id: u64) -> Result<(), BrokerError> {
        match self.pending.get(&id) {
            Some(message) => {
                message.attach_queue(queue);
                Ok(())
            }
            None => Err(BrokerError::UnknownMessage {
                id,
                queue: queue.to_string(),
            }),
        }
    }

    /// Ends the pending phase: owned messages are queued for insert, the rest
    /// are released without touching storage.
    pub fn flush(&self, id: u64) -> Result<(), BrokerError> {
        let Entry::Occupied(entry) = self.pending.entry(id) else {
            return Ok(());
        };

        // The entry stays locked until the insert is in the ring, so a detach
        // that misses it in `pending` is published after the insert.
        let published = if entry.get().has_attached_queues() {
            self.pipeline
                .publish(DbOperation::InsertMessage(entry.get().clone()))
                .map(|_| ())
        } else {
            trace!(id, "released unowned message");
            Ok(())
        };
        entry.remove();
        published?;
        Ok(())
    }

    /// Drops `queue` from the owners of `message`; the last owner deletes it.
    ///
    /// While the message is still pending only the owning set changes and
    /// [`flush`](Self::flush) decides what reaches storage.
    pub fn detach(&self, queue: &str, message: &DetachableMessage) -> Result<(), BrokerError> {
        let id = message.internal_id();
        if let Some(_pending) = self.pending.get(&id) {
            message.detach_queue(queue);
            trace!(id, queue, "detached before flush");
            return Ok(());
        }

        let op = if message.detach_queue(queue) {
            DbOperation::DeleteMessage(id)
        } else {
            DbOperation::DetachFromQueue {
                queue: queue.to_string(),
                id,
            }
        };
        self.pipeline.publish(op)?;
        Ok(())
    }

    /// Messages persisted for `queue`, oldest first.
    ///
    /// A message stored for several queues is rebuilt around one shared
    /// detachable part however many queues read it back.
    pub fn read_stored_messages(&self, queue: &str) -> Result<Vec<Message>, BrokerError> {
        let stored = self.dao.read_all(queue)?;
        let messages: Vec<Message> = stored
            .into_iter()
            .map(|record| self.rebuild(record))
            .collect();
        self.recovered.retain(|_, weak| weak.strong_count() > 0);
        Ok(messages)
    }

    fn rebuild(&self, record: StoredMessage) -> Message {
        let id = record.id;
        if let Some(detachable) = self.recovered.get(&id).and_then(|weak| weak.upgrade()) {
            return record.into_message_with(detachable);
        }

        let message = record.into_message();
        self.recovered
            .insert(id, Arc::downgrade(message.detachable()));
        message
    }

    /// Forgets the shared parts handed out while queues were read back.
    /// Called once every stored queue is restored.
    pub fn finish_recovery(&self) {
        debug!(shared = self.recovered.len(), "recovery finished");
        self.recovered.clear();
    }

    #[cfg(test)]
    pub(crate) fn recovered_count(&self) -> usize {
        self.recovered.len()
    }

    /// Opens an empty record for `xid` if it has none yet.
    pub fn branch(&self, xid: &Xid) {
        self.transactions
            .entry(xid.clone())
            .or_insert_with(|| Arc::new(Mutex::new(TransactionData::new())));
    }

    fn transaction_data(&self, xid: &Xid) -> Result<Arc<Mutex<TransactionData>>, BrokerError> {
        self.transactions
            .get(xid)
            .map(|data| data.value().clone())
            .ok_or_else(|| BrokerError::UnknownXid(xid.clone()))
    }

    /// Records a message enqueued under `xid`; its queues follow through
    /// [`attach_xid`](Self::attach_xid).
    pub fn add_xid(&self, xid: &Xid, message: &Message) -> Result<(), BrokerError> {
        self.transaction_data(xid)?
            .lock()
            .add_unattached_message(message.clone());
        Ok(())
    }

    /// Records that `queue` will own message `id` once `xid` commits. The
    /// owning-queue set is left untouched until then.
    pub fn attach_xid(&self, xid: &Xid, queue: &str, id: u64) -> Result<(), BrokerError> {
        if self.transaction_data(xid)?.lock().attach(queue, id) {
            Ok(())
        } else {
            Err(BrokerError::UnknownMessage {
                id,
                queue: queue.to_string(),
            })
        }
    }

    pub fn detach_xid(
        &self,
        xid: &Xid,
        queue: &str,
        message: Arc<DetachableMessage>,
    ) -> Result<(), BrokerError> {
        self.transaction_data(xid)?
            .lock()
            .prepare_for_detach(queue, message);
        Ok(())
    }

    /// Durably records everything `xid` would do.
    pub fn prepare(&self, xid: &Xid) -> Result<(), BrokerError> {
        let data = self.transaction_data(xid)?;
        self.dao.prepare(xid, &data.lock())?;
        debug!(%xid, "prepared");
        Ok(())
    }

    /// Applies `xid` to the shared messages and storage in one write.
    ///
    /// Waits for the pipeline first so inserts published before the commit
    /// are on disk before this transaction detaches from them.
    pub fn flush_xid(&self, xid: &Xid, one_phase: bool) -> Result<(), BrokerError> {
        let data = self.transaction_data(xid)?;
        {
            let mut data = data.lock();
            data.resolve();
            self.pipeline.sync();
            if one_phase {
                self.dao.persist(&data)?;
            } else {
                self.dao.commit_prepared(xid, &data)?;
            }
        }
        self.clear_xid(xid);
        Ok(())
    }

    /// Discards `xid`, including any prepared record.
    pub fn rollback_xid(&self, xid: &Xid) -> Result<(), BrokerError> {
        self.dao.rollback_prepared(xid)?;
        self.clear_xid(xid);
        Ok(())
    }

    pub fn clear_xid(&self, xid: &Xid) {
        self.transactions.remove(xid);
    }

    /// Rebuilds the transaction data of a prepared `xid` from storage.
    pub fn restore_xid(&self, xid: &Xid) -> Result<RestoredBranch, BrokerError> {
        let record = self
            .dao
            .prepared_record(xid)?
            .ok_or_else(|| BrokerError::UnknownXid(xid.clone()))?;

        let mut data = TransactionData::new();
        let mut enqueued = Vec::with_capacity(record.inserts.len());
        for mut stored in record.inserts {
            let queues = std::mem::take(&mut stored.queues);
            let message = stored.into_message();
            data.add_unattached_message(message.clone());
            for queue in &queues {
                data.attach(queue, message.internal_id());
            }
            enqueued.push((message, queues));
        }
        for (queue, id) in &record.detaches {
            data.detach(queue, *id);
        }

        self.transactions
            .insert(xid.clone(), Arc::new(Mutex::new(data)));
        Ok(RestoredBranch {
            enqueued,
            dequeued: record.detaches,
        })
    }

    pub fn stored_xids(&self) -> Result<Vec<Xid>, BrokerError> {
        Ok(self.dao.stored_xids()?)
    }

    pub fn last_message_id(&self) -> Result<u64, BrokerError> {
        Ok(self.dao.last_message_id()?)
    }

    /// Blocks until every operation published so far has been applied.
    pub fn sync(&self) {
        self.pipeline.sync();
    }

    /// Drains the pipeline and flushes the backing store.
    pub fn close(&self) {
        self.pipeline.close();
        if let Err(e) = self.dao.flush() {
            warn!(error = %e, "flushing the backing store failed");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl MessageReader for SharedMessageStore {
    fn fill(&self, buffer: Weak<QueueBuffer>, id: u64) -> Result<(), StoreError> {
        self.pipeline
            .publish(DbOperation::ReadMessageData { id, buffer })?;
        Ok(())
    }
}
