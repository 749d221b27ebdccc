//! Per-queue owner of the buffer, transactional pending lists and consumers.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace};

use crate::broker::consumer::Consumer;
use crate::broker::message::{DetachableMessage, Message};
use crate::config::BrokerSettings;
use crate::persistence::SharedMessageStore;
use crate::queue::buffer::{MessageReader, QueueBuffer};
use crate::transaction::Xid;
use crate::utils::BrokerError;

pub struct QueueHandler {
    name: String,
    buffer: Arc<QueueBuffer>,
    /// Present for durable queues only.
    store: Option<Arc<SharedMessageStore>>,
    pending_enqueue: Mutex<HashMap<Xid, Vec<Message>>>,
    pending_dequeue: Mutex<HashMap<Xid, Vec<Arc<DetachableMessage>>>>,
    redelivery: Mutex<VecDeque<Message>>,
    consumers: RwLock<Vec<Arc<dyn Consumer>>>,
    next_consumer: AtomicUsize,
    next_delivery_tag: AtomicU64,
}

impl QueueHandler {
    /// Creates a durable queue and loads its persisted messages.
    pub fn durable(
        name: &str,
        store: Arc<SharedMessageStore>,
        settings: &BrokerSettings,
    ) -> Result<Arc<Self>, BrokerError> {
        let reader: Arc<dyn MessageReader> = store.clone();
        let buffer = QueueBuffer::new(
            name,
            settings.durable_queue_in_memory_cache_limit,
            settings.non_durable_queue_max_depth,
            Some(reader),
        );

        let recovered = store.read_stored_messages(name)?;
        debug!(queue = name, count = recovered.len(), "recovered messages");
        buffer.add_all(recovered);

        Ok(Arc::new(Self::with_buffer(name, buffer, Some(store))))
    }

    pub fn in_memory(name: &str, settings: &BrokerSettings) -> Arc<Self> {
        let buffer = QueueBuffer::in_memory(name, settings.non_durable_queue_max_depth);
        Arc::new(Self::with_buffer(name, buffer, None))
    }

    fn with_buffer(name: &str, buffer: Arc<QueueBuffer>, store: Option<Arc<SharedMessageStore>>) -> Self {
        Self {
            name: name.to_string(),
            buffer,
            store,
            pending_enqueue: Mutex::new(HashMap::new()),
            pending_dequeue: Mutex::new(HashMap::new()),
            redelivery: Mutex::new(VecDeque::new()),
            consumers: RwLock::new(Vec::new()),
            next_consumer: AtomicUsize::new(0),
            next_delivery_tag: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.store.is_some()
    }

    pub fn buffer(&self) -> &Arc<QueueBuffer> {
        &self.buffer
    }

    /// Store that persists `message` for this queue, if any.
    fn persisting_store(&self, message: &Message) -> Option<&Arc<SharedMessageStore>> {
        self.store.as_ref().filter(|_| message.is_persistent())
    }

    /// Persistent messages of a durable queue are attached in the store and
    /// buffered; anything else is kept as an indelible message.
    pub fn enqueue(&self, message: Message) -> Result<(), BrokerError> {
        debug!(queue = %self.name, id = message.internal_id(), "enqueue");
        if let Some(store) = self.persisting_store(&message) {
            store.attach(&self.name, message.internal_id())?;
            self.buffer.add(message);
            return Ok(());
        }

        let id = message.internal_id();
        if self.buffer.add_indelible(message) {
            Ok(())
        } else {
            info!(queue = %self.name, id, "queue full, message dropped");
            Err(BrokerError::QueueFull(self.name.clone()))
        }
    }

    /// Holds `message` back until `xid` commits.
    pub fn prepare_enqueue(&self, xid: &Xid, message: Message) -> Result<(), BrokerError> {
        if let Some(store) = self.persisting_store(&message) {
            store.attach_xid(xid, &self.name, message.internal_id())?;
        }
        self.pending_enqueue
            .lock()
            .entry(xid.clone())
            .or_default()
            .push(message);
        Ok(())
    }

    /// Puts a message recovered from a prepared record back on the pending
    /// list of `xid`. The store already holds its attachment.
    pub fn restore_prepared(&self, xid: &Xid, message: Message) {
        self.pending_enqueue
            .lock()
            .entry(xid.clone())
            .or_default()
            .push(message);
    }

    /// Puts a dequeue recovered from a prepared record back on the pending
    /// list of `xid`. Returns `false` when the message is not buffered here.
    pub fn restore_prepared_detach(&self, xid: &Xid, id: u64) -> bool {
        let Some(message) = self.buffer.detachable(id) else {
            return false;
        };
        self.pending_dequeue
            .lock()
            .entry(xid.clone())
            .or_default()
            .push(message);
        true
    }

    /// Holds the removal of `message` back until `xid` commits.
    pub fn prepare_detach(&self, xid: &Xid, message: Arc<DetachableMessage>) -> Result<(), BrokerError> {
        if let Some(store) = &self.store {
            if message.is_attached_to(&self.name) {
                store.detach_xid(xid, &self.name, message.clone())?;
            }
        }
        self.pending_dequeue
            .lock()
            .entry(xid.clone())
            .or_default()
            .push(message);
        Ok(())
    }

    /// Makes the pending work of `xid` visible: dequeued messages leave the
    /// buffer, then enqueued ones join it.
    pub fn commit(&self, xid: &Xid) {
        if let Some(dequeued) = self.pending_dequeue.lock().remove(xid) {
            self.buffer
                .remove_all(dequeued.iter().map(|message| message.internal_id()));
        }

        let enqueued = self.pending_enqueue.lock().remove(xid).unwrap_or_default();
        for message in enqueued {
            if self.persisting_store(&message).is_some() {
                self.buffer.add(message);
            } else {
                let id = message.internal_id();
                if !self.buffer.add_indelible(message) {
                    info!(queue = %self.name, id, %xid, "queue full, committed message dropped");
                }
            }
        }
    }

    pub fn rollback(&self, xid: &Xid) {
        self.pending_dequeue.lock().remove(xid);
        self.pending_enqueue.lock().remove(xid);
    }

    /// Whether `xid` has pending work on this queue.
    pub fn has_pending(&self, xid: &Xid) -> bool {
        self.pending_enqueue.lock().contains_key(xid) || self.pending_dequeue.lock().contains_key(xid)
    }

    /// Redelivery queue first, then the buffer.
    pub fn take_for_delivery(&self) -> Option<Message> {
        if let Some(message) = self.redelivery.lock().pop_front() {
            return Some(message);
        }
        self.buffer.get_first_deliverable()
    }

    /// Acknowledged: removed from the buffer and detached in the store.
    pub fn dequeue(&self, message: &DetachableMessage) -> Result<(), BrokerError> {
        self.buffer.remove(message.internal_id());
        if let Some(store) = &self.store {
            if message.is_attached_to(&self.name) {
                store.detach(&self.name, message)?;
            }
        }
        Ok(())
    }

    /// Offers `message` again before anything else in the buffer.
    pub fn requeue(&self, message: Message) {
        let count = message.set_redeliver();
        debug!(queue = %self.name, id = message.internal_id(), count, "requeue");
        self.redelivery.lock().push_back(message);
    }

    /// Puts back a message taken for delivery that nobody received. It is not
    /// counted as a redelivery.
    pub fn restore_undelivered(&self, message: Message) {
        trace!(queue = %self.name, id = message.internal_id(), "returned undelivered");
        self.redelivery.lock().push_front(message);
    }

    pub fn add_consumer(&self, consumer: Arc<dyn Consumer>) -> bool {
        let mut consumers = self.consumers.write();
        if consumers.iter().any(|existing| existing.id() == consumer.id()) {
            return false;
        }
        consumers.push(consumer);
        true
    }

    pub fn remove_consumer(&self, consumer_id: &str) -> bool {
        let mut consumers = self.consumers.write();
        let before = consumers.len();
        consumers.retain(|consumer| consumer.id() != consumer_id);
        consumers.len() != before
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.read().len()
    }

    /// Next ready consumer in cyclic order, `None` when nobody can receive.
    pub fn next_consumer(&self) -> Option<Arc<dyn Consumer>> {
        let consumers = self.consumers.read();
        let count = consumers.len();
        (0..count)
            .map(|_| self.next_consumer.fetch_add(1, Ordering::Relaxed) % count)
            .map(|index| &consumers[index])
            .find(|consumer| consumer.is_ready())
            .cloned()
    }

    pub fn has_ready_consumer(&self) -> bool {
        self.consumers.read().iter().any(|consumer| consumer.is_ready())
    }

    pub fn next_delivery_tag(&self) -> u64 {
        self.next_delivery_tag.fetch_add(1, Ordering::Relaxed)
    }

    /// Messages waiting to be delivered, redeliveries included.
    pub fn size(&self) -> usize {
        self.buffer.undelivered() + self.redelivery.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Drops every message. Refused while consumers are attached.
    pub fn purge(&self) -> Result<usize, BrokerError> {
        let consumers = self.consumer_count();
        if consumers > 0 {
            return Err(BrokerError::QueueInUse {
                queue: self.name.clone(),
                consumers,
            });
        }
        self.clear()
    }

    /// Disconnects all consumers and drops every message; used when the
    /// queue is deleted.
    pub fn release_resources(&self) -> Result<usize, BrokerError> {
        self.consumers.write().clear();
        self.pending_enqueue.lock().clear();
        self.pending_dequeue.lock().clear();
        self.clear()
    }

    fn clear(&self) -> Result<usize, BrokerError> {
        self.redelivery.lock().clear();
        let removed = self.buffer.clear();
        if let Some(store) = &self.store {
            for message in &removed {
                if message.is_attached_to(&self.name) {
                    store.detach(&self.name, message)?;
                }
            }
        }
        info!(queue = %self.name, count = removed.len(), "queue cleared");
        Ok(removed.len())
    }
}
