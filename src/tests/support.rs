//! Test doubles shared by the module tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::broker::consumer::Consumer;
use crate::broker::message::{ContentChunk, Message, Metadata};
use crate::config::Settings;
use crate::persistence::dao::{
    MessageDao, PreparedRecord, StoredBinding, StoredExchange, StoredMessage, TransactionData,
};
use crate::transaction::Xid;
use crate::utils::{BrokerError, StoreError};

pub fn message(id: u64, routing_key: &str, persistent: bool, body: &str) -> Message {
    let metadata = Metadata::new(routing_key, "", body.len() as u64).persistent(persistent);
    Message::new(id, metadata, vec![ContentChunk::new(0, body.as_bytes().to_vec())])
}

pub fn persistent(id: u64, body: &str) -> Message {
    message(id, "q", true, body)
}

pub fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.store.ring_buffer_size = 64;
    settings.store.max_db_batch_size = 16;
    settings.delivery.idle_task_delay_ms = 5;
    settings.delivery.worker_count = 2;
    settings
}

/// What one `persist` call carried.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recorded {
    pub inserts: Vec<u64>,
    pub detaches: Vec<(String, u64)>,
    pub deletes: Vec<u64>,
}

impl Recorded {
    pub fn touches(&self, id: u64) -> bool {
        self.inserts.contains(&id)
            || self.deletes.contains(&id)
            || self.detaches.iter().any(|(_, detached)| *detached == id)
    }
}

/// In-memory `MessageDao` that records every write.
#[derive(Default)]
pub struct RecordingDao {
    pub writes: Mutex<Vec<Recorded>>,
    pub reads: Mutex<Vec<Vec<u64>>>,
    pub fail_writes: AtomicBool,
    stored: Mutex<BTreeMap<u64, StoredMessage>>,
    prepared: Mutex<HashMap<Xid, PreparedRecord>>,
    high_water: Mutex<u64>,
    queues: Mutex<BTreeSet<String>>,
    exchanges: Mutex<BTreeMap<String, StoredExchange>>,
    bindings: Mutex<BTreeSet<StoredBinding>>,
}

impl RecordingDao {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn writes(&self) -> Vec<Recorded> {
        self.writes.lock().clone()
    }

    pub fn stored_ids(&self) -> Vec<u64> {
        self.stored.lock().keys().copied().collect()
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    fn apply(&self, data: &TransactionData) {
        let mut stored = self.stored.lock();
        for pending in data.inserts() {
            let record = StoredMessage::from_message(&pending.message, pending.queues.clone());
            stored.insert(record.id, record);
        }
        for (queue, id) in data.detaches() {
            let now_empty = match stored.get_mut(&id) {
                Some(record) => {
                    record.queues.remove(queue);
                    record.queues.is_empty()
                }
                None => false,
            };
            if now_empty {
                stored.remove(&id);
            }
        }
        for id in data.deletes() {
            stored.remove(id);
        }
    }
}

impl MessageDao for RecordingDao {
    fn persist(&self, data: &TransactionData) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Corrupt("injected write failure".to_string()));
        }
        self.writes.lock().push(Recorded {
            inserts: data.inserts().map(|pending| pending.message.internal_id()).collect(),
            detaches: data
                .detaches()
                .map(|(queue, id)| (queue.to_string(), id))
                .collect(),
            deletes: data.deletes().to_vec(),
        });
        self.apply(data);
        Ok(())
    }

    fn read_all(&self, queue: &str) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self
            .stored
            .lock()
            .values()
            .filter(|record| record.queues.contains(queue))
            .cloned()
            .collect())
    }

    fn read_data(&self, ids: &[u64]) -> Result<HashMap<u64, StoredMessage>, StoreError> {
        self.reads.lock().push(ids.to_vec());
        let stored = self.stored.lock();
        Ok(ids
            .iter()
            .filter_map(|id| stored.get(id).map(|record| (*id, record.clone())))
            .collect())
    }

    fn prepare(&self, xid: &Xid, data: &TransactionData) -> Result<(), StoreError> {
        self.prepared
            .lock()
            .insert(xid.clone(), data.to_prepared_record(xid));
        Ok(())
    }

    fn commit_prepared(&self, xid: &Xid, data: &TransactionData) -> Result<(), StoreError> {
        self.persist(data)?;
        self.prepared.lock().remove(xid);
        Ok(())
    }

    fn rollback_prepared(&self, xid: &Xid) -> Result<(), StoreError> {
        self.prepared.lock().remove(xid);
        Ok(())
    }

    fn prepared_record(&self, xid: &Xid) -> Result<Option<PreparedRecord>, StoreError> {
        Ok(self.prepared.lock().get(xid).cloned())
    }

    fn stored_xids(&self) -> Result<Vec<Xid>, StoreError> {
        Ok(self.prepared.lock().keys().cloned().collect())
    }

    fn last_message_id(&self) -> Result<u64, StoreError> {
        let stored = self.stored.lock().keys().next_back().copied().unwrap_or(0);
        let prepared = self
            .prepared
            .lock()
            .values()
            .flat_map(|record| record.inserts.iter().map(|insert| insert.id))
            .max()
            .unwrap_or(0);
        Ok(stored.max(prepared).max(*self.high_water.lock()))
    }

    fn reserve_ids(&self, upto: u64) -> Result<(), StoreError> {
        let mut high_water = self.high_water.lock();
        *high_water = (*high_water).max(upto);
        Ok(())
    }

    fn store_queue(&self, queue: &str) -> Result<(), StoreError> {
        self.queues.lock().insert(queue.to_string());
        Ok(())
    }

    fn delete_queue(&self, queue: &str) -> Result<(), StoreError> {
        self.queues.lock().remove(queue);
        self.bindings.lock().retain(|binding| binding.queue != queue);
        Ok(())
    }

    fn stored_queues(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.queues.lock().iter().cloned().collect())
    }

    fn store_exchange(&self, exchange: &StoredExchange) -> Result<(), StoreError> {
        self.exchanges
            .lock()
            .insert(exchange.name.clone(), exchange.clone());
        Ok(())
    }

    fn delete_exchange(&self, name: &str) -> Result<(), StoreError> {
        self.exchanges.lock().remove(name);
        self.bindings.lock().retain(|binding| binding.exchange != name);
        Ok(())
    }

    fn stored_exchanges(&self) -> Result<Vec<StoredExchange>, StoreError> {
        Ok(self.exchanges.lock().values().cloned().collect())
    }

    fn store_binding(&self, binding: &StoredBinding) -> Result<(), StoreError> {
        self.bindings.lock().insert(binding.clone());
        Ok(())
    }

    fn delete_binding(&self, binding: &StoredBinding) -> Result<(), StoreError> {
        self.bindings.lock().remove(binding);
        Ok(())
    }

    fn stored_bindings(&self) -> Result<Vec<StoredBinding>, StoreError> {
        Ok(self.bindings.lock().iter().cloned().collect())
    }
}

/// Consumer that keeps what it was sent.
pub struct RecordingConsumer {
    id: String,
    queue: String,
    pub received: Mutex<Vec<(u64, u64)>>,
    pub failing: AtomicBool,
    pub ready: AtomicBool,
}

impl RecordingConsumer {
    pub fn new(id: &str, queue: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            queue: queue.to_string(),
            received: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            ready: AtomicBool::new(true),
        })
    }

    /// Internal ids received, in order.
    pub fn ids(&self) -> Vec<u64> {
        self.received.lock().iter().map(|(id, _)| *id).collect()
    }
}

impl Consumer for RecordingConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn queue(&self) -> &str {
        &self.queue
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn send(&self, message: Message, delivery_tag: u64) -> Result<(), BrokerError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BrokerError::Delivery(format!("{} refused", self.id)));
        }
        self.received
            .lock()
            .push((message.internal_id(), delivery_tag));
        Ok(())
    }
}

/// Reader that only records which ids were requested.
#[derive(Default)]
pub struct RecordingReader {
    pub requested: Mutex<Vec<u64>>,
}

impl RecordingReader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn requested(&self) -> Vec<u64> {
        self.requested.lock().clone()
    }
}

impl crate::queue::MessageReader for RecordingReader {
    fn fill(
        &self,
        _buffer: std::sync::Weak<crate::queue::QueueBuffer>,
        id: u64,
    ) -> Result<(), StoreError> {
        self.requested.lock().push(id);
        Ok(())
    }
}
