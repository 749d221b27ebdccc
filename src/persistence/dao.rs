//! Backing store contract
//!
//! The writer stage of the store pipeline and the distributed transaction
//! path talk to durable storage only through `MessageDao`. `TransactionData`
//! is the unit of work handed to it: one writer batch, or the state of one
//! distributed transaction branch.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::broker::exchange::ExchangeType;
use crate::broker::message::{ContentChunk, DetachableMessage, Message, Metadata};
use crate::transaction::Xid;
use crate::utils::StoreError;

pub trait MessageDao: Send + Sync {
    /// Applies inserts, then detaches, then deletes, atomically.
    fn persist(&self, data: &TransactionData) -> Result<(), StoreError>;

    /// All messages attached to `queue`, in internal id order.
    fn read_all(&self, queue: &str) -> Result<Vec<StoredMessage>, StoreError>;

    /// Content of the given messages. Ids that no longer exist are absent
    /// from the result.
    fn read_data(&self, ids: &[u64]) -> Result<HashMap<u64, StoredMessage>, StoreError>;

    fn prepare(&self, xid: &Xid, data: &TransactionData) -> Result<(), StoreError>;

    /// Applies `data` and drops the prepared record of `xid` in one step.
    fn commit_prepared(&self, xid: &Xid, data: &TransactionData) -> Result<(), StoreError>;

    fn rollback_prepared(&self, xid: &Xid) -> Result<(), StoreError>;

    fn prepared_record(&self, xid: &Xid) -> Result<Option<PreparedRecord>, StoreError>;

    fn stored_xids(&self) -> Result<Vec<Xid>, StoreError>;

    /// Highest internal id ever written or reserved, 0 for an empty store.
    fn last_message_id(&self) -> Result<u64, StoreError>;

    /// Records that ids up to `upto` may be in use.
    fn reserve_ids(&self, upto: u64) -> Result<(), StoreError>;

    fn store_queue(&self, queue: &str) -> Result<(), StoreError>;

    /// Forgets a durable queue together with its bindings.
    fn delete_queue(&self, queue: &str) -> Result<(), StoreError>;

    fn stored_queues(&self) -> Result<Vec<String>, StoreError>;

    fn store_exchange(&self, exchange: &StoredExchange) -> Result<(), StoreError>;

    /// Forgets a durable exchange together with its bindings.
    fn delete_exchange(&self, name: &str) -> Result<(), StoreError>;

    fn stored_exchanges(&self) -> Result<Vec<StoredExchange>, StoreError>;

    fn store_binding(&self, binding: &StoredBinding) -> Result<(), StoreError>;

    fn delete_binding(&self, binding: &StoredBinding) -> Result<(), StoreError>;

    fn stored_bindings(&self) -> Result<Vec<StoredBinding>, StoreError>;

    /// Makes every applied write durable.
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Durable exchange declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredExchange {
    pub name: String,
    pub kind: ExchangeType,
}

/// Binding between a durable exchange and a durable queue.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoredBinding {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl StoredBinding {
    pub fn new(exchange: &str, queue: &str, routing_key: &str) -> Self {
        Self {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredChunk {
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Durable form of a message together with the queues holding it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: u64,
    pub metadata: Metadata,
    pub chunks: Vec<StoredChunk>,
    pub queues: BTreeSet<String>,
    #[serde(default)]
    pub redelivery_count: u32,
}

impl StoredMessage {
    pub fn from_message(message: &Message, queues: BTreeSet<String>) -> Self {
        Self {
            id: message.internal_id(),
            metadata: message.metadata().clone(),
            chunks: message
                .content_chunks()
                .iter()
                .map(|chunk| StoredChunk {
                    offset: chunk.offset,
                    data: chunk.bytes.to_vec(),
                })
                .collect(),
            queues,
            redelivery_count: message.redelivery_count(),
        }
    }

    pub fn content_chunks(&self) -> Vec<ContentChunk> {
        self.chunks
            .iter()
            .map(|chunk| ContentChunk::new(chunk.offset, chunk.data.clone()))
            .collect()
    }

    pub fn into_message(self) -> Message {
        let chunks = self.content_chunks();
        let detachable = Arc::new(DetachableMessage::with_queues(
            self.id,
            self.queues,
            self.redelivery_count,
        ));
        Message::from_parts(detachable, self.metadata, chunks)
    }

    /// Rebuilds the message around a detachable part already tracked in memory.
    pub fn into_message_with(self, detachable: Arc<DetachableMessage>) -> Message {
        let chunks = self.content_chunks();
        Message::from_parts(detachable, self.metadata, chunks)
    }
}

/// What `prepare` writes for one Xid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedRecord {
    pub xid: Xid,
    pub inserts: Vec<StoredMessage>,
    pub detaches: Vec<(String, u64)>,
}

#[derive(Debug, Clone)]
pub struct PendingInsert {
    pub message: Message,
    pub queues: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct TransactionData {
    inserts: BTreeMap<u64, PendingInsert>,
    detaches: BTreeMap<String, Vec<u64>>,
    prepared_detaches: BTreeMap<String, Vec<Arc<DetachableMessage>>>,
    deletes: Vec<u64>,
    detach_count: usize,
    prepared_detach_count: usize,
}

impl TransactionData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert with the queues the message is attached to right now.
    pub fn add_enqueue_message(&mut self, message: Message) {
        let queues = message.attached_queues();
        self.inserts
            .insert(message.internal_id(), PendingInsert { message, queues });
    }

    /// Insert whose queues are recorded separately through [`attach`](Self::attach).
    pub fn add_unattached_message(&mut self, message: Message) {
        self.inserts.insert(
            message.internal_id(),
            PendingInsert {
                message,
                queues: BTreeSet::new(),
            },
        );
    }

    pub fn attach(&mut self, queue: &str, id: u64) -> bool {
        match self.inserts.get_mut(&id) {
            Some(pending) => {
                pending.queues.insert(queue.to_string());
                true
            }
            None => false,
        }
    }

    pub fn detach(&mut self, queue: &str, id: u64) {
        self.detaches.entry(queue.to_string()).or_default().push(id);
        self.detach_count += 1;
    }

    pub fn prepare_for_detach(&mut self, queue: &str, message: Arc<DetachableMessage>) {
        self.prepared_detaches
            .entry(queue.to_string())
            .or_default()
            .push(message);
        self.prepared_detach_count += 1;
    }

    pub fn add_deletable(&mut self, id: u64) {
        self.deletes.push(id);
    }

    /// Makes recorded attachments and prepared detaches real: queue sets of the
    /// shared messages are updated, and each prepared detach becomes either a
    /// per-queue detach or, for the last queue, a delete.
    pub fn resolve(&mut self) {
        for pending in self.inserts.values() {
            for queue in &pending.queues {
                pending.message.attach_queue(queue);
            }
        }

        let prepared = std::mem::take(&mut self.prepared_detaches);
        self.prepared_detach_count = 0;
        for (queue, messages) in prepared {
            for message in messages {
                let id = message.internal_id();
                if message.detach_queue(&queue) {
                    self.add_deletable(id);
                } else {
                    self.detach(&queue, id);
                }
            }
        }
    }

    pub fn inserts(&self) -> impl Iterator<Item = &PendingInsert> {
        self.inserts.values()
    }

    pub fn detaches(&self) -> impl Iterator<Item = (&str, u64)> {
        self.detaches
            .iter()
            .flat_map(|(queue, ids)| ids.iter().map(move |id| (queue.as_str(), *id)))
    }

    pub fn prepared_detaches(&self) -> impl Iterator<Item = (&str, &Arc<DetachableMessage>)> {
        self.prepared_detaches.iter().flat_map(|(queue, messages)| {
            messages.iter().map(move |message| (queue.as_str(), message))
        })
    }

    pub fn deletes(&self) -> &[u64] {
        &self.deletes
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty()
            && self.detaches.is_empty()
            && self.prepared_detaches.is_empty()
            && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.detach_count + self.prepared_detach_count + self.deletes.len()
    }

    pub fn clear(&mut self) {
        self.inserts.clear();
        self.detaches.clear();
        self.prepared_detaches.clear();
        self.deletes.clear();
        self.detach_count = 0;
        self.prepared_detach_count = 0;
    }

    pub fn to_prepared_record(&self, xid: &Xid) -> PreparedRecord {
        PreparedRecord {
            xid: xid.clone(),
            inserts: self
                .inserts
                .values()
                .map(|pending| StoredMessage::from_message(&pending.message, pending.queues.clone()))
                .collect(),
            detaches: self
                .detaches()
                .map(|(queue, id)| (queue.to_string(), id))
                .chain(
                    self.prepared_detaches()
                        .map(|(queue, message)| (queue.to_string(), message.internal_id())),
                )
                .collect(),
        }
    }
}
