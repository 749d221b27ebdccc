//! Per-queue ordered message buffer.
//!
//! Nodes form a doubly linked chain keyed by internal id, so append and
//! removal by id are O(1). Two cursors walk the chain:
//! - `deliverable`: the next node not yet handed out; everything before it
//!   is in flight.
//! - `first_undeliverable`: the first node at or after `deliverable` whose
//!   content is not in memory. Delivery stops there until the content has
//!   been read back from the store.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::broker::message::{DetachableMessage, Message};
use crate::persistence::StoredMessage;
use crate::utils::StoreError;

/// Loads message content for bare buffer nodes.
pub trait MessageReader: Send + Sync {
    /// Requests the content of `id`. The answer arrives later through
    /// [`QueueBuffer::mark_filled`] or [`QueueBuffer::mark_fill_failed`].
    fn fill(&self, buffer: Weak<QueueBuffer>, id: u64) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Only the id and owning-queue handle are in memory.
    Bare,
    SubmittedForFilling,
    Full,
    /// Never cleared and never counted against the cache limit.
    Indelible,
}

impl NodeState {
    fn has_content(self) -> bool {
        matches!(self, NodeState::Full | NodeState::Indelible)
    }
}

struct Node {
    prev: Option<u64>,
    next: Option<u64>,
    detachable: Arc<DetachableMessage>,
    message: Option<Message>,
    state: NodeState,
    delivered: bool,
}

#[derive(Default)]
struct Inner {
    nodes: HashMap<u64, Node>,
    first: Option<u64>,
    last: Option<u64>,
    deliverable: Option<u64>,
    first_undeliverable: Option<u64>,
    full: usize,
    filling: usize,
    indelible: usize,
    in_flight: usize,
    undelivered: usize,
}

impl Inner {
    fn has_content(&self, id: u64) -> bool {
        self.nodes.get(&id).is_some_and(|node| node.state.has_content())
    }

    fn next_of(&self, id: u64) -> Option<u64> {
        self.nodes.get(&id).and_then(|node| node.next)
    }

    /// First node starting at `from` that has no content in memory.
    fn skip_full(&self, mut from: Option<u64>) -> Option<u64> {
        while let Some(id) = from {
            if !self.has_content(id) {
                return Some(id);
            }
            from = self.next_of(id);
        }
        None
    }

    fn link_last(&mut self, message: Option<Message>, detachable: Arc<DetachableMessage>, state: NodeState) -> u64 {
        let id = detachable.internal_id();
        let node = Node {
            prev: self.last,
            next: None,
            detachable,
            message,
            state,
            delivered: false,
        };

        if let Some(previous) = self.last.and_then(|last| self.nodes.get_mut(&last)) {
            previous.next = Some(id);
        }
        self.nodes.insert(id, node);
        self.last = Some(id);
        if self.first.is_none() {
            self.first = Some(id);
        }
        if self.deliverable.is_none() {
            self.deliverable = Some(id);
        }
        if !state.has_content() && self.first_undeliverable.is_none() {
            self.first_undeliverable = Some(id);
        }

        match state {
            NodeState::Full => self.full += 1,
            NodeState::Indelible => self.indelible += 1,
            NodeState::Bare | NodeState::SubmittedForFilling => {}
        }
        self.undelivered += 1;
        id
    }

    fn unlink(&mut self, id: u64) -> Option<Node> {
        let node = self.nodes.remove(&id)?;

        match node.prev.and_then(|prev| self.nodes.get_mut(&prev)) {
            Some(prev) => prev.next = node.next,
            None => self.first = node.next,
        }
        match node.next.and_then(|next| self.nodes.get_mut(&next)) {
            Some(next) => next.prev = node.prev,
            None => self.last = node.prev,
        }

        if self.deliverable == Some(id) {
            self.deliverable = node.next;
        }
        if self.first_undeliverable == Some(id) {
            self.first_undeliverable = self.skip_full(node.next);
        }

        match node.state {
            NodeState::Full => self.full -= 1,
            NodeState::Indelible => self.indelible -= 1,
            NodeState::SubmittedForFilling => self.filling -= 1,
            NodeState::Bare => {}
        }
        if node.delivered {
            self.in_flight -= 1;
        } else {
            self.undelivered -= 1;
        }
        Some(node)
    }
}

pub struct QueueBuffer {
    queue: String,
    in_memory_limit: usize,
    indelible_limit: usize,
    reader: Option<Arc<dyn MessageReader>>,
    this: Weak<QueueBuffer>,
    inner: Mutex<Inner>,
}

impl QueueBuffer {
    /// A buffer backed by `reader` that keeps at most `in_memory_limit`
    /// persistent messages with content in memory.
    pub fn new(
        queue: &str,
        in_memory_limit: usize,
        indelible_limit: usize,
        reader: Option<Arc<dyn MessageReader>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            queue: queue.to_string(),
            in_memory_limit,
            indelible_limit,
            reader,
            this: this.clone(),
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Buffer of a queue that never persists anything.
    pub fn in_memory(queue: &str, max_depth: usize) -> Arc<Self> {
        Self::new(queue, 0, max_depth, None)
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Appends a persistent message. Past the cache limit, or behind a node
    /// already waiting for content, only the bare node is kept.
    pub fn add(&self, message: Message) {
        let mut inner = self.inner.lock();
        self.link(&mut inner, message);
    }

    fn link(&self, inner: &mut Inner, message: Message) {
        let over_limit = inner.full + inner.filling >= self.in_memory_limit;
        if self.reader.is_some() && (over_limit || inner.first_undeliverable.is_some()) {
            let detachable = message.detachable().clone();
            inner.link_last(None, detachable, NodeState::Bare);
        } else {
            let detachable = message.detachable().clone();
            inner.link_last(Some(message), detachable, NodeState::Full);
        }
    }

    /// Bulk load of recovered messages, eager while they fit in the cache.
    pub fn add_all(&self, messages: impl IntoIterator<Item = Message>) {
        let mut inner = self.inner.lock();
        for message in messages {
            self.link(&mut inner, message);
        }
    }

    /// Appends a node whose content is read from the store on demand.
    pub fn add_bare(&self, message: &Message) {
        self.inner
            .lock()
            .link_last(None, message.detachable().clone(), NodeState::Bare);
    }

    /// Appends a message that is never persisted. Returns `false` when the
    /// indelible limit is reached.
    pub fn add_indelible(&self, message: Message) -> bool {
        let mut inner = self.inner.lock();
        if inner.indelible >= self.indelible_limit {
            return false;
        }
        let detachable = message.detachable().clone();
        inner.link_last(Some(message), detachable, NodeState::Indelible);
        true
    }

    /// Unlinks `id`. Unknown ids are logged and ignored.
    pub fn remove(&self, id: u64) -> bool {
        let (removed, fills) = {
            let mut inner = self.inner.lock();
            let removed = inner.unlink(id).is_some();
            (removed, self.collect_fills(&mut inner))
        };

        if !removed {
            debug!(queue = %self.queue, id, "message not in buffer, nothing to remove");
        }
        self.submit_fills(fills);
        removed
    }

    pub fn remove_all(&self, ids: impl IntoIterator<Item = u64>) {
        let fills = {
            let mut inner = self.inner.lock();
            for id in ids {
                if inner.unlink(id).is_none() {
                    debug!(queue = %self.queue, id, "message not in buffer, nothing to remove");
                }
            }
            self.collect_fills(&mut inner)
        };
        self.submit_fills(fills);
    }

    /// Hands out the message at the deliverable cursor and advances it. The
    /// node stays in the buffer until it is removed.
    pub fn get_first_deliverable(&self) -> Option<Message> {
        let (message, fills) = {
            let mut inner = self.inner.lock();
            let fills = self.collect_fills(&mut inner);
            (Self::take_deliverable(&mut inner), fills)
        };
        self.submit_fills(fills);
        message
    }

    fn take_deliverable(inner: &mut Inner) -> Option<Message> {
        let id = inner.deliverable?;
        if inner.first_undeliverable == Some(id) {
            return None;
        }

        let node = inner.nodes.get_mut(&id)?;
        let message = node.message.clone()?;
        node.delivered = true;
        inner.deliverable = node.next;
        inner.in_flight += 1;
        inner.undelivered -= 1;
        Some(message)
    }

    /// Marks up to the free cache capacity of bare nodes as submitted.
    fn collect_fills(&self, inner: &mut Inner) -> Vec<u64> {
        if self.reader.is_none() {
            return Vec::new();
        }

        let mut capacity = self
            .in_memory_limit
            .saturating_sub(inner.full + inner.filling);
        let mut fills = Vec::new();
        let mut cursor = inner.first_undeliverable;
        while capacity > 0 {
            let Some(id) = cursor else { break };
            let Some(node) = inner.nodes.get_mut(&id) else { break };
            if node.state == NodeState::Bare {
                node.state = NodeState::SubmittedForFilling;
                inner.filling += 1;
                fills.push(id);
                capacity -= 1;
            }
            cursor = node.next;
        }
        fills
    }

    fn submit_fills(&self, fills: Vec<u64>) {
        let Some(reader) = &self.reader else { return };
        for id in fills {
            if let Err(e) = reader.fill(self.this.clone(), id) {
                warn!(queue = %self.queue, id, error = %e, "could not request message content");
                self.mark_fill_failed(id);
            }
        }
    }

    /// Content for a submitted node has been read back.
    pub fn mark_filled(&self, id: u64, stored: StoredMessage) {
        let mut inner = self.inner.lock();
        let Some(node) = inner.nodes.get_mut(&id) else {
            warn!(queue = %self.queue, id, "filled message is no longer in the buffer");
            return;
        };
        if node.state != NodeState::SubmittedForFilling {
            trace!(queue = %self.queue, id, state = ?node.state, "ignoring fill");
            return;
        }

        node.message = Some(stored.into_message_with(node.detachable.clone()));
        node.state = NodeState::Full;
        inner.filling -= 1;
        inner.full += 1;
        if inner.first_undeliverable == Some(id) {
            inner.first_undeliverable = inner.skip_full(Some(id));
        }
    }

    /// Puts a submitted node back to bare so a later call retries it.
    pub fn mark_fill_failed(&self, id: u64) {
        let mut inner = self.inner.lock();
        let Some(node) = inner.nodes.get_mut(&id) else {
            warn!(queue = %self.queue, id, "failed fill for a message no longer in the buffer");
            return;
        };
        if node.state == NodeState::SubmittedForFilling {
            node.state = NodeState::Bare;
            inner.filling -= 1;
        }
    }

    /// No stored content was found for `id`.
    ///
    /// While this queue still owns the message its insert has not reached
    /// storage yet, so the node goes back to bare. Otherwise the message is
    /// gone and the node is dropped. Never requests more content, so the
    /// store pipeline can call it.
    pub fn mark_missing(&self, id: u64) {
        let mut inner = self.inner.lock();
        let Some(node) = inner.nodes.get_mut(&id) else {
            return;
        };
        if node.detachable.is_attached_to(&self.queue) {
            if node.state == NodeState::SubmittedForFilling {
                node.state = NodeState::Bare;
                inner.filling -= 1;
            }
            debug!(queue = %self.queue, id, "message content not stored yet");
        } else if inner.unlink(id).is_some() {
            warn!(queue = %self.queue, id, "message missing from store, dropped");
        }
    }

    /// Empties the buffer and returns what it held.
    pub fn clear(&self) -> Vec<Arc<DetachableMessage>> {
        let mut inner = self.inner.lock();
        let mut removed = Vec::with_capacity(inner.nodes.len());
        let mut cursor = inner.first;
        while let Some(id) = cursor {
            cursor = inner.next_of(id);
            if let Some(node) = inner.nodes.get(&id) {
                removed.push(node.detachable.clone());
            }
        }
        *inner = Inner::default();
        removed
    }

    pub fn size(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight
    }

    pub fn undelivered(&self) -> usize {
        self.inner.lock().undelivered
    }

    pub fn contains(&self, id: u64) -> bool {
        self.inner.lock().nodes.contains_key(&id)
    }

    pub fn detachable(&self, id: u64) -> Option<Arc<DetachableMessage>> {
        self.inner
            .lock()
            .nodes
            .get(&id)
            .map(|node| node.detachable.clone())
    }

    pub fn state_of(&self, id: u64) -> Option<NodeState> {
        self.inner.lock().nodes.get(&id).map(|node| node.state)
    }

    /// Ids from first to last.
    pub fn ids(&self) -> Vec<u64> {
        let inner = self.inner.lock();
        let mut ids = Vec::with_capacity(inner.nodes.len());
        let mut cursor = inner.first;
        while let Some(id) = cursor {
            ids.push(id);
            cursor = inner.next_of(id);
        }
        ids
    }
}

impl fmt::Debug for QueueBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("QueueBuffer")
            .field("queue", &self.queue)
            .field("size", &inner.nodes.len())
            .field("in_flight", &inner.in_flight)
            .field("full", &inner.full)
            .field("filling", &inner.filling)
            .field("indelible", &inner.indelible)
            .finish()
    }
}
