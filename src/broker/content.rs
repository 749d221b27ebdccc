//! Message assembly
//!
//! A publish arrives as a header followed by any number of content chunks.
//! `InboundMessage` accumulates them until the declared content length is
//! reached and only then produces the immutable `Message`. Receiving more
//! bytes than declared aborts the assembly.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::broker::message::{ContentChunk, Message, Metadata};
use crate::persistence::MessageDao;
use crate::utils::{BrokerError, StoreError};

#[derive(Debug)]
pub struct InboundMessage {
    metadata: Metadata,
    chunks: Vec<ContentChunk>,
    received: u64,
}

impl InboundMessage {
    pub fn new(metadata: Metadata) -> Self {
        Self {
            metadata,
            chunks: Vec::new(),
            received: 0,
        }
    }

    /// Appends the next chunk. On overflow the partial message is dropped and
    /// the error returned; it must never be enqueued.
    pub fn add_chunk(mut self, bytes: impl Into<Bytes>) -> Result<Self, BrokerError> {
        let bytes = bytes.into();
        let received = self.received + bytes.len() as u64;
        if received > self.metadata.content_length {
            warn!(
                routing_key = %self.metadata.routing_key,
                declared = self.metadata.content_length,
                received,
                "content exceeds declared length, dropping message"
            );
            return Err(BrokerError::ContentOverflow {
                declared: self.metadata.content_length,
                received,
            });
        }

        self.chunks.push(ContentChunk::new(self.received, bytes));
        self.received = received;
        Ok(self)
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.metadata.content_length
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Finishes the assembly. Returns the builder back if content is still
    /// missing.
    pub fn into_message(self, internal_id: u64) -> Result<Message, Self> {
        if !self.is_complete() {
            return Err(self);
        }
        Ok(Message::new(internal_id, self.metadata, self.chunks))
    }
}

/// Ids reserved in storage per round trip.
pub const ID_RESERVATION_BLOCK: u64 = 1024;

/// Hands out broker-wide internal message ids.
///
/// Ids are strictly increasing for the lifetime of the generator. With a
/// backing store, ids are handed out only from blocks whose upper end has
/// been recorded there first, so a restart never reuses an id even when
/// every message that carried it is gone.
pub struct MessageIdGenerator {
    range: Mutex<IdRange>,
    dao: Option<Arc<dyn MessageDao>>,
}

struct IdRange {
    next: u64,
    reserved: u64,
}

impl MessageIdGenerator {
    /// In-memory generator without reservations.
    pub fn starting_after(last_used: u64) -> Self {
        Self {
            range: Mutex::new(IdRange {
                next: last_used + 1,
                reserved: u64::MAX,
            }),
            dao: None,
        }
    }

    /// Generator that reserves ids in `dao` ahead of handing them out.
    pub fn reserving(last_used: u64, dao: Arc<dyn MessageDao>) -> Self {
        Self {
            range: Mutex::new(IdRange {
                next: last_used + 1,
                reserved: last_used,
            }),
            dao: Some(dao),
        }
    }

    pub fn next_id(&self) -> Result<u64, StoreError> {
        let mut range = self.range.lock();
        if range.next > range.reserved {
            if let Some(dao) = &self.dao {
                let upto = range.next + ID_RESERVATION_BLOCK - 1;
                dao.reserve_ids(upto)?;
                debug!(from = range.next, upto, "message ids reserved");
                range.reserved = upto;
            }
        }
        let id = range.next;
        range.next += 1;
        Ok(id)
    }
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::starting_after(0)
    }
}
