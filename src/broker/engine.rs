use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::broker::consumer::Consumer;
use crate::broker::content::{InboundMessage, MessageIdGenerator};
use crate::broker::exchange::{
    DEAD_LETTER_EXCHANGE, DEAD_LETTER_QUEUE, DEFAULT_EXCHANGE, Exchange, ExchangeRegistry, ExchangeType, is_builtin,
};
use crate::broker::message::{DetachableMessage, FieldValue, Message, Metadata};
use crate::config::Settings;
use crate::delivery::{DeadLetterSink, DeliveryTask, TaskScheduler};
use crate::persistence::{
    MessageDao, RestoredBranch, SharedMessageStore, SledMessageDao, StoredBinding, StoredExchange,
};
use crate::queue::QueueHandler;
use crate::transaction::{
    AutoCommitTransaction, BrokerTransaction, DistributedTransaction, LocalTransaction, Registry, Xid,
};
use crate::utils::BrokerError;

/// Represents the broker core that protocol front-ends drive.
///
/// It owns the queues, the exchanges routing into them, the shared message
/// store, the distributed transaction registry and the delivery scheduler.
/// Every publish, acknowledgment and transactional operation goes through it.
pub struct Broker {
    this: Weak<Broker>,
    settings: Settings,
    dao: Arc<dyn MessageDao>,
    store: Arc<SharedMessageStore>,
    queues: RwLock<HashMap<String, Arc<QueueHandler>>>,
    exchanges: ExchangeRegistry,
    ids: MessageIdGenerator,
    registry: Registry,
    scheduler: Arc<TaskScheduler>,
}

impl Broker {
    /// Opens the sled store at `settings.store.path` and builds the broker
    /// on top of it.
    pub fn open(settings: Settings) -> Result<Arc<Self>, BrokerError> {
        let dao = SledMessageDao::open(&settings.store.path)?;
        Self::with_dao(Arc::new(dao), settings)
    }

    /// Builds the broker over any backing store.
    ///
    /// Durable exchanges, queues and bindings of a previous run are restored,
    /// message ids continue after the highest stored or reserved id and
    /// prepared transactions are loaded for recovery.
    pub fn with_dao(dao: Arc<dyn MessageDao>, settings: Settings) -> Result<Arc<Self>, BrokerError> {
        let store = Arc::new(SharedMessageStore::new(dao.clone(), &settings.store)?);
        let last_id = store.last_message_id()?;
        let registry = Registry::new();
        registry.sync_with_store(&store)?;

        let broker = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            scheduler: Arc::new(TaskScheduler::new(&settings.delivery)),
            settings,
            store,
            queues: RwLock::new(HashMap::new()),
            exchanges: ExchangeRegistry::new(),
            ids: MessageIdGenerator::reserving(last_id, dao.clone()),
            dao,
            registry,
        });
        broker.restore_definitions()?;
        broker.declare_queue(DEAD_LETTER_QUEUE, true)?;
        broker.bind(DEAD_LETTER_QUEUE, DEAD_LETTER_EXCHANGE, DEAD_LETTER_QUEUE)?;
        broker.store.finish_recovery();

        info!(last_id, queues = broker.queues.read().len(), "broker core started");
        Ok(broker)
    }

    fn restore_definitions(&self) -> Result<(), BrokerError> {
        for exchange in self.dao.stored_exchanges()? {
            self.exchanges.declare(&exchange.name, exchange.kind, true)?;
        }
        for queue in self.dao.stored_queues()? {
            self.create_queue(&queue, true)?;
        }
        for binding in self.dao.stored_bindings()? {
            match (self.exchanges.get(&binding.exchange), self.queue(&binding.queue)) {
                (Some(exchange), Some(_)) => {
                    exchange.bind(&binding.queue, &binding.routing_key);
                }
                _ => warn!(
                    exchange = %binding.exchange,
                    queue = %binding.queue,
                    "stored binding refers to a missing exchange or queue"
                ),
            }
        }
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<SharedMessageStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn dtx_registry(&self) -> &Registry {
        &self.registry
    }

    pub fn next_message_id(&self) -> Result<u64, BrokerError> {
        Ok(self.ids.next_id()?)
    }

    /// Starts assembling a message published with `metadata`.
    pub fn begin_publish(&self, metadata: Metadata) -> InboundMessage {
        InboundMessage::new(metadata)
    }

    /// Completes an assembled message with a fresh internal id. The id is
    /// only taken once all content has arrived.
    pub fn complete(&self, inbound: InboundMessage) -> Result<Message, BrokerError> {
        if !inbound.is_complete() {
            return Err(BrokerError::validation(format!(
                "message content incomplete, {} bytes received",
                inbound.received()
            )));
        }
        let id = self.next_message_id()?;
        inbound.into_message(id).map_err(|inbound| {
            BrokerError::validation(format!(
                "message content incomplete, {} bytes received",
                inbound.received()
            ))
        })
    }

    /// Creates the queue, or returns it when it exists with the same
    /// durability. New queues are bound to the default exchange by name and
    /// durable ones are recorded in storage.
    pub fn declare_queue(&self, name: &str, durable: bool) -> Result<Arc<QueueHandler>, BrokerError> {
        let (handler, created) = self.create_queue(name, durable)?;
        if created && durable {
            self.dao.store_queue(name)?;
        }
        Ok(handler)
    }

    fn create_queue(&self, name: &str, durable: bool) -> Result<(Arc<QueueHandler>, bool), BrokerError> {
        let mut queues = self.queues.write();
        if let Some(existing) = queues.get(name) {
            if existing.is_durable() != durable {
                return Err(BrokerError::QueueExists(name.to_string()));
            }
            return Ok((existing.clone(), false));
        }

        let handler = if durable {
            QueueHandler::durable(name, self.store.clone(), &self.settings.broker)?
        } else {
            QueueHandler::in_memory(name, &self.settings.broker)
        };
        queues.insert(name.to_string(), handler.clone());
        drop(queues);

        self.exchanges.lookup(DEFAULT_EXCHANGE)?.bind(name, name);
        info!(queue = name, durable, "queue declared");
        Ok((handler, true))
    }

    /// Deletes the queue and drops its messages. Returns how many.
    pub fn delete_queue(&self, name: &str, if_unused: bool, if_empty: bool) -> Result<usize, BrokerError> {
        let handler = self.lookup_queue(name)?;
        if if_unused && handler.consumer_count() > 0 {
            return Err(BrokerError::QueueInUse {
                queue: name.to_string(),
                consumers: handler.consumer_count(),
            });
        }
        if if_empty && !handler.is_empty() {
            return Err(BrokerError::validation(format!("queue {name} is not empty")));
        }

        self.queues.write().remove(name);
        self.exchanges.unbind_queue(name);
        self.scheduler.remove(name);
        if handler.is_durable() {
            self.dao.delete_queue(name)?;
        }
        let removed = handler.release_resources()?;
        info!(queue = name, removed, "queue deleted");
        Ok(removed)
    }

    pub fn queue(&self, name: &str) -> Option<Arc<QueueHandler>> {
        self.queues.read().get(name).cloned()
    }

    pub fn lookup_queue(&self, name: &str) -> Result<Arc<QueueHandler>, BrokerError> {
        self.queue(name)
            .ok_or_else(|| BrokerError::UnknownQueue(name.to_string()))
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn declare_exchange(&self, name: &str, kind: ExchangeType, durable: bool) -> Result<Arc<Exchange>, BrokerError> {
        let exchange = self.exchanges.declare(name, kind, durable)?;
        if exchange.is_durable() && !is_builtin(name) {
            self.dao.store_exchange(&StoredExchange {
                name: name.to_string(),
                kind,
            })?;
        }
        Ok(exchange)
    }

    pub fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<(), BrokerError> {
        self.exchanges.delete(name, if_unused)?;
        self.dao.delete_exchange(name)?;
        Ok(())
    }

    /// Bindings survive a restart when both ends are durable. Bindings to the
    /// default exchange follow from the queue itself.
    fn is_stored_binding(handler: &QueueHandler, exchange: &Exchange) -> bool {
        handler.is_durable() && exchange.is_durable() && exchange.name() != DEFAULT_EXCHANGE
    }

    pub fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        let handler = self.lookup_queue(queue)?;
        let target = self.exchanges.lookup(exchange)?;
        if target.bind(queue, routing_key) && Self::is_stored_binding(&handler, &target) {
            self.dao
                .store_binding(&StoredBinding::new(exchange, queue, routing_key))?;
        }
        debug!(queue, exchange, routing_key, "bound");
        Ok(())
    }

    pub fn unbind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        let handler = self.lookup_queue(queue)?;
        let target = self.exchanges.lookup(exchange)?;
        if !target.unbind(queue, routing_key) {
            return Err(BrokerError::validation(format!(
                "no binding of {queue} to {exchange:?} with key {routing_key}"
            )));
        }
        if Self::is_stored_binding(&handler, &target) {
            self.dao
                .delete_binding(&StoredBinding::new(exchange, queue, routing_key))?;
        }
        Ok(())
    }

    /// Target queues of a message, resolved through its exchange.
    fn route(&self, message: &Message) -> Result<Vec<Arc<QueueHandler>>, BrokerError> {
        let metadata = message.metadata();
        let exchange = self.exchanges.lookup(&metadata.exchange_name)?;
        let names: BTreeSet<String> = exchange.route(&metadata.routing_key);
        let queues = self.queues.read();
        Ok(names.iter().filter_map(|name| queues.get(name).cloned()).collect())
    }

    /// Routes `message` to every bound queue.
    ///
    /// The message is registered with the store, attached and buffered by
    /// each queue, then flushed: persisted when a durable queue took it,
    /// released otherwise. A full queue only loses its own copy.
    pub fn publish(&self, message: Message) -> Result<(), BrokerError> {
        let handlers = self.route(&message)?;
        let id = message.internal_id();
        if handlers.is_empty() {
            info!(
                id,
                routing_key = %message.metadata().routing_key,
                exchange = %message.metadata().exchange_name,
                "dropping message since no queues found for routing key"
            );
            return Ok(());
        }

        self.store.add(&message);
        let mut result = Ok(());
        for handler in &handlers {
            match handler.enqueue(message.clone()) {
                Ok(()) | Err(BrokerError::QueueFull(_)) => {}
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        self.store.flush(id)?;
        result
    }

    /// Removes an acknowledged message from `queue`.
    pub fn acknowledge(&self, queue: &str, message: &DetachableMessage) -> Result<(), BrokerError> {
        self.lookup_queue(queue)?.dequeue(message)
    }

    /// Offers a message a consumer gave back again. Past
    /// `max_redelivery_count` redeliveries it is dead-lettered instead.
    pub fn requeue(&self, queue: &str, message: Message) -> Result<(), BrokerError> {
        let handler = self.lookup_queue(queue)?;
        if queue != DEAD_LETTER_QUEUE
            && message.redelivery_count() >= self.settings.delivery.max_redelivery_count
        {
            return self.move_to_dead_letter(queue, &message);
        }
        handler.requeue(message);
        Ok(())
    }

    /// Publishes a copy of `message` under a new id to the dead letter
    /// exchange, then acknowledges the original on `queue`.
    ///
    /// The copy records where the original came from in the
    /// `x-origin-queue`, `x-origin-exchange` and `x-origin-routing-key`
    /// headers.
    pub fn move_to_dead_letter(&self, queue: &str, message: &Message) -> Result<(), BrokerError> {
        let origin = message.metadata();
        let mut metadata = origin.clone();
        metadata.exchange_name = DEAD_LETTER_EXCHANGE.to_string();
        metadata.routing_key = DEAD_LETTER_QUEUE.to_string();
        let metadata = metadata
            .with_header("x-origin-queue", FieldValue::Str(queue.to_string()))
            .with_header("x-origin-exchange", FieldValue::Str(origin.exchange_name.clone()))
            .with_header("x-origin-routing-key", FieldValue::Str(origin.routing_key.clone()));

        let copy = message.copy_with(self.next_message_id()?, metadata);
        let copy_id = copy.internal_id();
        self.publish(copy)?;
        self.acknowledge(queue, message.detachable())?;
        info!(queue, id = message.internal_id(), copy_id, "moved to dead letter queue");
        Ok(())
    }

    /// Enqueues `message` under `xid`. Returns the queues it went to.
    pub fn enqueue_xid(&self, xid: &Xid, message: Message) -> Result<Vec<Arc<QueueHandler>>, BrokerError> {
        let handlers = self.route(&message)?;
        if handlers.is_empty() {
            info!(id = message.internal_id(), %xid, "dropping transactional message since no queues found");
            return Ok(handlers);
        }

        self.store.add_xid(xid, &message)?;
        for handler in &handlers {
            handler.prepare_enqueue(xid, message.clone())?;
        }
        Ok(handlers)
    }

    pub fn dequeue_xid(
        &self,
        xid: &Xid,
        queue: &str,
        message: Arc<DetachableMessage>,
    ) -> Result<Arc<QueueHandler>, BrokerError> {
        let handler = self.lookup_queue(queue)?;
        handler.prepare_detach(xid, message)?;
        Ok(handler)
    }

    /// Hands the work recovered from a prepared record to its queues.
    pub fn restore_prepared(&self, xid: &Xid, restored: RestoredBranch) -> Vec<Arc<QueueHandler>> {
        let mut affected: HashMap<String, Arc<QueueHandler>> = HashMap::new();
        for (message, queues) in restored.enqueued {
            for queue in queues {
                match self.queue(&queue) {
                    Some(handler) => {
                        handler.restore_prepared(xid, message.clone());
                        affected.insert(queue, handler);
                    }
                    None => warn!(%xid, queue, "queue of prepared message no longer exists"),
                }
            }
        }
        for (queue, id) in restored.dequeued {
            match self.queue(&queue) {
                Some(handler) => {
                    if !handler.restore_prepared_detach(xid, id) {
                        debug!(%xid, queue, id, "prepared dequeue of a message not in the queue");
                    }
                    affected.insert(queue, handler);
                }
                None => warn!(%xid, queue, "queue of prepared dequeue no longer exists"),
            }
        }
        affected.into_values().collect()
    }

    /// Registers a consumer on its queue; the first one starts delivery.
    pub fn add_consumer(&self, consumer: Arc<dyn Consumer>) -> Result<(), BrokerError> {
        let handler = self.lookup_queue(consumer.queue())?;
        if !handler.add_consumer(consumer.clone()) {
            return Err(BrokerError::validation(format!(
                "consumer {} already registered",
                consumer.id()
            )));
        }
        if !self.scheduler.contains(handler.name()) {
            let dead_letters = handler.name() != DEAD_LETTER_QUEUE;
            let mut task = DeliveryTask::new(handler, &self.settings.delivery);
            if dead_letters {
                let sink: Weak<dyn DeadLetterSink> = self.this.clone();
                task = task.with_dead_letters(sink);
            }
            self.scheduler.add(Arc::new(task));
        }
        Ok(())
    }

    /// Removes a consumer; the last one stops delivery for the queue.
    pub fn remove_consumer(&self, queue: &str, consumer_id: &str) -> Result<bool, BrokerError> {
        let handler = self.lookup_queue(queue)?;
        let removed = handler.remove_consumer(consumer_id);
        if handler.consumer_count() == 0 {
            self.scheduler.remove(queue);
        }
        Ok(removed)
    }

    pub fn purge_queue(&self, queue: &str) -> Result<usize, BrokerError> {
        self.lookup_queue(queue)?.purge()
    }

    pub fn new_auto_commit_transaction(self: &Arc<Self>) -> BrokerTransaction {
        BrokerTransaction::AutoCommit(AutoCommitTransaction::new(self.clone()))
    }

    pub fn new_local_transaction(self: &Arc<Self>) -> BrokerTransaction {
        BrokerTransaction::Local(LocalTransaction::new(self.clone()))
    }

    pub fn new_distributed_transaction(self: &Arc<Self>, session: u64) -> BrokerTransaction {
        BrokerTransaction::Distributed(DistributedTransaction::new(self.clone(), session))
    }

    /// Stops delivery and drains the store pipeline.
    pub fn shutdown(&self) {
        self.scheduler.stop();
        self.store.sync();
        self.store.close();
        info!("broker core stopped");
    }
}

impl DeadLetterSink for Broker {
    fn dead_letter(&self, queue: &str, message: Message) -> Result<(), BrokerError> {
        self.move_to_dead_letter(queue, &message)
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("queues", &self.queue_names())
            .field("delivery_tasks", &self.scheduler.len())
            .finish()
    }
}
