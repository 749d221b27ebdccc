//! First pipeline stage: cancels operations that never need to reach storage.

use std::collections::HashMap;

use tracing::trace;

use crate::persistence::operation::{DbOperation, Slot};
use crate::persistence::ring::RingBuffer;

/// Tracks pending inserts and detaches by message id inside one window.
///
/// A delete that finds a pending insert clears both slots, so a message
/// consumed before it was ever written costs no storage round trip. A delete
/// that finds pending detaches clears those instead. The maps are dropped at
/// the end of every drained batch and whenever `window` operations have been
/// seen; operations that would cancel across that boundary both go through.
pub struct EventMatcher {
    inserts: HashMap<u64, u64>,
    detaches: HashMap<u64, Vec<u64>>,
    processed: usize,
    window: usize,
    cancelled: u64,
}

impl EventMatcher {
    pub fn new(window: usize) -> Self {
        Self {
            inserts: HashMap::new(),
            detaches: HashMap::new(),
            processed: 0,
            window: window.max(1),
            cancelled: 0,
        }
    }

    pub fn on_event(&mut self, ring: &RingBuffer<Slot>, sequence: u64) {
        let event = {
            let slot = ring.slot(sequence);
            match &slot.op {
                DbOperation::InsertMessage(message) => Some(Event::Insert(message.internal_id())),
                DbOperation::DetachFromQueue { id, .. } => Some(Event::Detach(*id)),
                DbOperation::DeleteMessage(id) => Some(Event::Delete(*id)),
                DbOperation::NoOp | DbOperation::ReadMessageData { .. } => None,
            }
        };

        match event {
            Some(Event::Insert(id)) => {
                self.inserts.insert(id, sequence);
            }
            Some(Event::Detach(id)) => {
                self.detaches.entry(id).or_default().push(sequence);
            }
            Some(Event::Delete(id)) => self.on_delete(ring, sequence, id),
            None => {}
        }

        self.processed += 1;
        if self.processed >= self.window {
            self.reset();
        }
    }

    fn on_delete(&mut self, ring: &RingBuffer<Slot>, sequence: u64, id: u64) {
        let detaches = self.detaches.remove(&id).unwrap_or_default();
        for detach in &detaches {
            ring.slot(*detach).clear();
        }
        self.cancelled += detaches.len() as u64;

        if let Some(insert) = self.inserts.remove(&id) {
            ring.slot(insert).clear();
            ring.slot(sequence).clear();
            self.cancelled += 2;
            trace!(id, "insert and delete cancelled before write");
        }
    }

    /// Forgets everything seen so far.
    pub fn reset(&mut self) {
        self.inserts.clear();
        self.detaches.clear();
        self.processed = 0;
    }

    /// Operations cleared since the matcher was created.
    pub fn cancelled(&self) -> u64 {
        self.cancelled
    }
}

enum Event {
    Insert(u64),
    Detach(u64),
    Delete(u64),
}
