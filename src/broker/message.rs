//! Message definitions for the broker core
//!
//! A `Message` is immutable once assembled. Cloning one is a shallow copy:
//! metadata and content chunks are shared (`Arc` / `Bytes`), and so is the
//! `DetachableMessage` part that carries the set of queues still holding a
//! reference to the message. That set is the reference list that decides
//! when a persistent message may be deleted from durable storage.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Typed value of a property or header entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum FieldValue {
    Bool(bool),
    Int(i32),
    Long(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
}

pub type FieldTable = BTreeMap<String, FieldValue>;

/// Routing and delivery information of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub routing_key: String,
    pub exchange_name: String,
    pub content_length: u64,
    pub persistent: bool,
    pub properties: FieldTable,
    pub headers: FieldTable,
    /// Milliseconds since UNIX epoch; set when the header is received.
    pub timestamp: i64,
}

impl Metadata {
    pub fn new(routing_key: &str, exchange_name: &str, content_length: u64) -> Self {
        Self {
            routing_key: routing_key.to_string(),
            exchange_name: exchange_name.to_string(),
            content_length,
            persistent: false,
            properties: FieldTable::new(),
            headers: FieldTable::new(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn with_property(mut self, name: &str, value: FieldValue) -> Self {
        self.properties.insert(name.to_string(), value);
        self
    }

    pub fn with_header(mut self, name: &str, value: FieldValue) -> Self {
        self.headers.insert(name.to_string(), value);
        self
    }
}

/// One piece of message content starting at `offset` of the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentChunk {
    pub offset: u64,
    pub bytes: Bytes,
}

impl ContentChunk {
    pub fn new(offset: u64, bytes: impl Into<Bytes>) -> Self {
        Self {
            offset,
            bytes: bytes.into(),
        }
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// The part of a message shared by every queue it is attached to.
///
/// Acknowledgement and detach only need this part, which is why consumers
/// hand it back instead of the full message.
pub struct DetachableMessage {
    internal_id: u64,
    queues: Mutex<BTreeSet<String>>,
    redelivery_count: AtomicU32,
    redelivered: AtomicBool,
}

impl DetachableMessage {
    pub(crate) fn new(internal_id: u64) -> Self {
        Self::with_queues(internal_id, BTreeSet::new(), 0)
    }

    pub(crate) fn with_queues(
        internal_id: u64,
        queues: BTreeSet<String>,
        redelivery_count: u32,
    ) -> Self {
        Self {
            internal_id,
            queues: Mutex::new(queues),
            redelivery_count: AtomicU32::new(redelivery_count),
            redelivered: AtomicBool::new(redelivery_count > 0),
        }
    }

    pub fn internal_id(&self) -> u64 {
        self.internal_id
    }

    pub fn attach_queue(&self, queue: &str) {
        self.queues.lock().insert(queue.to_string());
    }

    /// Removes `queue` and returns true if no queue holds the message anymore.
    pub fn detach_queue(&self, queue: &str) -> bool {
        let mut queues = self.queues.lock();
        queues.remove(queue);
        queues.is_empty()
    }

    pub fn is_attached_to(&self, queue: &str) -> bool {
        self.queues.lock().contains(queue)
    }

    pub fn has_attached_queues(&self) -> bool {
        !self.queues.lock().is_empty()
    }

    pub fn attached_queues(&self) -> BTreeSet<String> {
        self.queues.lock().clone()
    }

    pub fn redelivery_count(&self) -> u32 {
        self.redelivery_count.load(Ordering::Acquire)
    }

    pub fn is_redelivered(&self) -> bool {
        self.redelivered.load(Ordering::Acquire)
    }

    pub(crate) fn set_redeliver(&self) -> u32 {
        self.redelivered.store(true, Ordering::Release);
        self.redelivery_count.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl fmt::Debug for DetachableMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetachableMessage")
            .field("internal_id", &self.internal_id)
            .field("queues", &*self.queues.lock())
            .field("redelivery_count", &self.redelivery_count())
            .finish()
    }
}

#[derive(Clone)]
pub struct Message {
    metadata: Arc<Metadata>,
    chunks: Arc<[ContentChunk]>,
    detachable: Arc<DetachableMessage>,
}

impl Message {
    pub(crate) fn new(internal_id: u64, metadata: Metadata, chunks: Vec<ContentChunk>) -> Self {
        Self::from_parts(
            Arc::new(DetachableMessage::new(internal_id)),
            metadata,
            chunks,
        )
    }

    /// Rebuilds a message around an existing detachable part, e.g. when the
    /// content of a bare buffer entry is read back from storage.
    pub(crate) fn from_parts(
        detachable: Arc<DetachableMessage>,
        metadata: Metadata,
        chunks: Vec<ContentChunk>,
    ) -> Self {
        Self {
            metadata: Arc::new(metadata),
            chunks: chunks.into(),
            detachable,
        }
    }

    /// A new message under `internal_id` and `metadata` that shares this
    /// one's content.
    pub(crate) fn copy_with(&self, internal_id: u64, metadata: Metadata) -> Self {
        Self {
            metadata: Arc::new(metadata),
            chunks: self.chunks.clone(),
            detachable: Arc::new(DetachableMessage::new(internal_id)),
        }
    }

    pub fn internal_id(&self) -> u64 {
        self.detachable.internal_id
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn content_chunks(&self) -> &[ContentChunk] {
        &self.chunks
    }

    /// Concatenated payload.
    pub fn content(&self) -> Bytes {
        match &*self.chunks {
            [single] => single.bytes.clone(),
            chunks => {
                let mut buf = Vec::with_capacity(self.metadata.content_length as usize);
                for chunk in chunks {
                    buf.extend_from_slice(&chunk.bytes);
                }
                Bytes::from(buf)
            }
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.metadata.persistent
    }

    pub fn detachable(&self) -> &Arc<DetachableMessage> {
        &self.detachable
    }

    pub fn attach_queue(&self, queue: &str) {
        self.detachable.attach_queue(queue);
    }

    pub fn has_attached_queues(&self) -> bool {
        self.detachable.has_attached_queues()
    }

    pub fn attached_queues(&self) -> BTreeSet<String> {
        self.detachable.attached_queues()
    }

    pub fn set_redeliver(&self) -> u32 {
        self.detachable.set_redeliver()
    }

    pub fn redelivery_count(&self) -> u32 {
        self.detachable.redelivery_count()
    }

    pub fn is_redelivered(&self) -> bool {
        self.detachable.is_redelivered()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("internal_id", &self.internal_id())
            .field("exchange", &self.metadata.exchange_name)
            .field("routing_key", &self.metadata.routing_key)
            .field("content_length", &self.metadata.content_length)
            .field("persistent", &self.metadata.persistent)
            .finish()
    }
}

impl Drop for DetachableMessage {
    fn drop(&mut self) {
        trace!(id = self.internal_id, "released message");
    }
}
