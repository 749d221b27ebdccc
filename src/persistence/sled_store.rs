//! Backing store on `sled`
//!
//! Message trees:
//! - `messages`: internal id (big endian) -> JSON `StoredMessage`
//! - `queue_index`: queue name, `0x00`, internal id -> empty; one entry per
//!   attached queue so a queue's messages scan in id order
//! - `prepared`: Xid key -> JSON `PreparedRecord`
//!
//! Every batch is applied in one multi-tree sled transaction.
//!
//! Definition trees, written directly:
//! - `queues`: durable queue name -> empty
//! - `exchanges`: exchange name -> JSON `StoredExchange`
//! - `bindings`: exchange, `0x00`, queue, `0x00`, routing key -> JSON `StoredBinding`
//! - `meta`: `id_high_water` -> highest reserved message id (big endian)

use std::collections::HashMap;
use std::fmt;

use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::{Db, Transactional, Tree};
use tracing::{debug, warn};

use crate::persistence::dao::{
    MessageDao, PreparedRecord, StoredBinding, StoredExchange, StoredMessage, TransactionData,
};
use crate::transaction::Xid;
use crate::utils::StoreError;

type TxResult<T> = Result<T, ConflictableTransactionError<StoreError>>;

const ID_HIGH_WATER: &[u8] = b"id_high_water";

#[derive(Clone)]
pub struct SledMessageDao {
    db: Db,
    messages: Tree,
    queue_index: Tree,
    prepared: Tree,
    queues: Tree,
    exchanges: Tree,
    bindings: Tree,
    meta: Tree,
}

impl SledMessageDao {
    /// Open or create a sled database at `path`.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::with_db(db)
    }

    pub fn with_db(db: Db) -> Result<Self, StoreError> {
        Ok(Self {
            messages: db.open_tree("messages")?,
            queue_index: db.open_tree("queue_index")?,
            prepared: db.open_tree("prepared")?,
            queues: db.open_tree("queues")?,
            exchanges: db.open_tree("exchanges")?,
            bindings: db.open_tree("bindings")?,
            meta: db.open_tree("meta")?,
            db,
        })
    }

    /// Number of stored message records.
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    fn apply(
        &self,
        data: &TransactionData,
        prepared_key: Option<Vec<u8>>,
    ) -> Result<(), StoreError> {
        let trees = (&self.messages, &self.queue_index, &self.prepared);
        let result: Result<(), TransactionError<StoreError>> =
            trees.transaction(|(messages, queue_index, prepared)| {
                apply_batch(messages, queue_index, data)?;
                if let Some(key) = &prepared_key {
                    prepared.remove(&key[..])?;
                }
                Ok::<(), ConflictableTransactionError<StoreError>>(())
            });

        result.map_err(|e| match e {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => StoreError::Sled(e),
        })
    }
}

fn id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

fn queue_prefix(queue: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(queue.len() + 1);
    key.extend_from_slice(queue.as_bytes());
    key.push(0);
    key
}

fn queue_key(queue: &str, id: u64) -> Vec<u8> {
    let mut key = queue_prefix(queue);
    key.extend_from_slice(&id_key(id));
    key
}

fn binding_key(binding: &StoredBinding) -> Vec<u8> {
    let mut key = queue_prefix(&binding.exchange);
    key.extend_from_slice(&queue_prefix(&binding.queue));
    key.extend_from_slice(binding.routing_key.as_bytes());
    key
}

fn decode_id(bytes: &[u8], what: &str) -> Result<u64, StoreError> {
    let id_bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("bad {what}")))?;
    Ok(u64::from_be_bytes(id_bytes))
}

fn abort<E: Into<StoreError>>(e: E) -> ConflictableTransactionError<StoreError> {
    ConflictableTransactionError::Abort(e.into())
}

fn read_record(messages: &TransactionalTree, id: u64) -> TxResult<Option<StoredMessage>> {
    match messages.get(&id_key(id)[..])? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(abort)?)),
        None => Ok(None),
    }
}

fn apply_batch(
    messages: &TransactionalTree,
    queue_index: &TransactionalTree,
    data: &TransactionData,
) -> TxResult<()> {
    for pending in data.inserts() {
        let record = StoredMessage::from_message(&pending.message, pending.queues.clone());
        let bytes = serde_json::to_vec(&record).map_err(abort)?;
        messages.insert(&id_key(record.id)[..], bytes)?;
        for queue in &record.queues {
            queue_index.insert(queue_key(queue, record.id), Vec::<u8>::new())?;
        }
    }

    for (queue, id) in data.detaches() {
        queue_index.remove(queue_key(queue, id))?;
        if let Some(mut record) = read_record(messages, id)? {
            record.queues.remove(queue);
            if record.queues.is_empty() {
                messages.remove(&id_key(id)[..])?;
            } else {
                let bytes = serde_json::to_vec(&record).map_err(abort)?;
                messages.insert(&id_key(id)[..], bytes)?;
            }
        }
    }

    for id in data.deletes() {
        if let Some(record) = read_record(messages, *id)? {
            for queue in &record.queues {
                queue_index.remove(queue_key(queue, *id))?;
            }
            messages.remove(&id_key(*id)[..])?;
        }
    }

    Ok(())
}

impl MessageDao for SledMessageDao {
    fn persist(&self, data: &TransactionData) -> Result<(), StoreError> {
        if data.is_empty() {
            return Ok(());
        }
        self.apply(data, None)
    }

    fn read_all(&self, queue: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let prefix = queue_prefix(queue);
        let mut stored = Vec::new();

        for entry in self.queue_index.scan_prefix(&prefix) {
            let (key, _) = entry?;
            let id_bytes: [u8; 8] = key[prefix.len()..]
                .try_into()
                .map_err(|_| StoreError::Corrupt(format!("bad index key for queue {queue}")))?;
            let id = u64::from_be_bytes(id_bytes);

            match self.messages.get(id_key(id))? {
                Some(bytes) => stored.push(serde_json::from_slice(&bytes)?),
                None => warn!(queue, id, "index entry without message record"),
            }
        }

        debug!(queue, count = stored.len(), "read stored messages");
        Ok(stored)
    }

    fn read_data(&self, ids: &[u64]) -> Result<HashMap<u64, StoredMessage>, StoreError> {
        let mut found = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(bytes) = self.messages.get(id_key(*id))? {
                found.insert(*id, serde_json::from_slice(&bytes)?);
            }
        }
        Ok(found)
    }

    fn prepare(&self, xid: &Xid, data: &TransactionData) -> Result<(), StoreError> {
        let record = data.to_prepared_record(xid);
        let bytes = serde_json::to_vec(&record)?;
        self.prepared.insert(xid.to_key(), bytes)?;
        self.prepared.flush()?;
        Ok(())
    }

    fn commit_prepared(&self, xid: &Xid, data: &TransactionData) -> Result<(), StoreError> {
        self.apply(data, Some(xid.to_key()))
    }

    fn rollback_prepared(&self, xid: &Xid) -> Result<(), StoreError> {
        self.prepared.remove(xid.to_key())?;
        Ok(())
    }

    fn prepared_record(&self, xid: &Xid) -> Result<Option<PreparedRecord>, StoreError> {
        match self.prepared.get(xid.to_key())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn stored_xids(&self) -> Result<Vec<Xid>, StoreError> {
        self.prepared
            .iter()
            .map(|entry| {
                let (_, bytes) = entry?;
                let record: PreparedRecord = serde_json::from_slice(&bytes)?;
                Ok(record.xid)
            })
            .collect()
    }

    fn last_message_id(&self) -> Result<u64, StoreError> {
        let mut last = match self.messages.last()? {
            Some((key, _)) => decode_id(&key, "message key")?,
            None => 0,
        };
        if let Some(bytes) = self.meta.get(ID_HIGH_WATER)? {
            last = last.max(decode_id(&bytes, "id high water mark")?);
        }

        for entry in self.prepared.iter() {
            let (_, bytes) = entry?;
            let record: PreparedRecord = serde_json::from_slice(&bytes)?;
            for stored in &record.inserts {
                last = last.max(stored.id);
            }
        }
        Ok(last)
    }

    fn reserve_ids(&self, upto: u64) -> Result<(), StoreError> {
        self.meta.fetch_and_update(ID_HIGH_WATER, |current| {
            let current = current
                .and_then(|bytes| <[u8; 8]>::try_from(bytes).ok())
                .map(u64::from_be_bytes)
                .unwrap_or(0);
            Some(current.max(upto).to_be_bytes().to_vec())
        })?;
        self.meta.flush()?;
        Ok(())
    }

    fn store_queue(&self, queue: &str) -> Result<(), StoreError> {
        self.queues.insert(queue.as_bytes(), Vec::<u8>::new())?;
        Ok(())
    }

    fn delete_queue(&self, queue: &str) -> Result<(), StoreError> {
        self.queues.remove(queue.as_bytes())?;
        for binding in self.stored_bindings()? {
            if binding.queue == queue {
                self.bindings.remove(binding_key(&binding))?;
            }
        }
        Ok(())
    }

    fn stored_queues(&self) -> Result<Vec<String>, StoreError> {
        self.queues
            .iter()
            .keys()
            .map(|key| {
                let key = key?;
                String::from_utf8(key.to_vec())
                    .map_err(|_| StoreError::Corrupt("bad queue name".to_string()))
            })
            .collect()
    }

    fn store_exchange(&self, exchange: &StoredExchange) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(exchange)?;
        self.exchanges.insert(exchange.name.as_bytes(), bytes)?;
        Ok(())
    }

    fn delete_exchange(&self, name: &str) -> Result<(), StoreError> {
        self.exchanges.remove(name.as_bytes())?;
        for entry in self.bindings.scan_prefix(queue_prefix(name)) {
            let (key, _) = entry?;
            self.bindings.remove(key)?;
        }
        Ok(())
    }

    fn stored_exchanges(&self) -> Result<Vec<StoredExchange>, StoreError> {
        self.exchanges
            .iter()
            .values()
            .map(|bytes| Ok(serde_json::from_slice(&bytes?)?))
            .collect()
    }

    fn store_binding(&self, binding: &StoredBinding) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(binding)?;
        self.bindings.insert(binding_key(binding), bytes)?;
        Ok(())
    }

    fn delete_binding(&self, binding: &StoredBinding) -> Result<(), StoreError> {
        self.bindings.remove(binding_key(binding))?;
        Ok(())
    }

    fn stored_bindings(&self) -> Result<Vec<StoredBinding>, StoreError> {
        self.bindings
            .iter()
            .values()
            .map(|bytes| Ok(serde_json::from_slice(&bytes?)?))
            .collect()
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

impl fmt::Debug for SledMessageDao {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SledMessageDao")
            .field("db", &"sled::Db")
            .field("messages", &self.messages.len())
            .finish()
    }
}
