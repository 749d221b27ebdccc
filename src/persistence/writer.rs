//! Second and final pipeline stages.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::persistence::dao::{MessageDao, TransactionData};
use crate::persistence::operation::{DbOperation, Slot};
use crate::persistence::ring::RingBuffer;

/// Groups surviving writes into `TransactionData` batches and reads into
/// one `read_data` call per drained batch.
pub struct DbWriter {
    dao: Arc<dyn MessageDao>,
    max_batch_size: usize,
    batch: TransactionData,
    batch_sequences: Vec<u64>,
    /// Ids this batch deletes or detaches.
    removed: HashSet<u64>,
    reads: Vec<(u64, u64)>,
}

impl DbWriter {
    pub fn new(dao: Arc<dyn MessageDao>, max_batch_size: usize) -> Self {
        Self {
            dao,
            max_batch_size: max_batch_size.max(1),
            batch: TransactionData::new(),
            batch_sequences: Vec::new(),
            removed: HashSet::new(),
            reads: Vec::new(),
        }
    }

    pub fn on_event(&mut self, ring: &RingBuffer<Slot>, sequence: u64, end_of_batch: bool) {
        // A batch applies inserts before removals, so an insert that follows
        // a removal of the same id starts a new batch.
        let reinsert = match &ring.slot(sequence).op {
            DbOperation::InsertMessage(message) => self.removed.contains(&message.internal_id()),
            _ => false,
        };
        if reinsert {
            self.write(ring);
        }

        {
            let slot = ring.slot(sequence);
            match &slot.op {
                DbOperation::NoOp => {}
                DbOperation::InsertMessage(message) => {
                    self.batch.add_enqueue_message(message.clone());
                    self.batch_sequences.push(sequence);
                }
                DbOperation::DeleteMessage(id) => {
                    self.batch.add_deletable(*id);
                    self.removed.insert(*id);
                    self.batch_sequences.push(sequence);
                }
                DbOperation::DetachFromQueue { queue, id } => {
                    self.batch.detach(queue, *id);
                    self.removed.insert(*id);
                    self.batch_sequences.push(sequence);
                }
                DbOperation::ReadMessageData { id, .. } => self.reads.push((sequence, *id)),
            }
        }

        if self.batch.len() >= self.max_batch_size {
            self.write(ring);
        }
        if end_of_batch {
            self.write(ring);
            self.read(ring);
        }
    }

    fn write(&mut self, ring: &RingBuffer<Slot>) {
        self.removed.clear();
        if self.batch.is_empty() {
            self.batch_sequences.clear();
            return;
        }

        match self.dao.persist(&self.batch) {
            Ok(()) => debug!(operations = self.batch.len(), "batch written"),
            Err(e) => {
                let e = Arc::new(e);
                for sequence in &self.batch_sequences {
                    ring.slot(*sequence).error = Some(e.clone());
                }
            }
        }
        self.batch.clear();
        self.batch_sequences.clear();
    }

    fn read(&mut self, ring: &RingBuffer<Slot>) {
        if self.reads.is_empty() {
            return;
        }

        let ids: Vec<u64> = self.reads.iter().map(|(_, id)| *id).collect();
        match self.dao.read_data(&ids) {
            Ok(mut found) => {
                for (sequence, id) in &self.reads {
                    ring.slot(*sequence).fill = found.remove(id);
                }
            }
            Err(e) => {
                let e = Arc::new(e);
                for (sequence, _) in &self.reads {
                    ring.slot(*sequence).error = Some(e.clone());
                }
            }
        }
        self.reads.clear();
    }
}

/// Reports failures, hands read results to their buffers and frees the slot.
pub fn finish(ring: &RingBuffer<Slot>, sequence: u64) {
    let mut slot = ring.slot(sequence);
    let Slot { op, error, fill } = &mut *slot;

    match op {
        DbOperation::ReadMessageData { id, buffer } => {
            let id = *id;
            match buffer.upgrade() {
                Some(buffer) => match (fill.take(), error) {
                    (_, Some(e)) => {
                        warn!(id, error = %e, "reading message content failed");
                        buffer.mark_fill_failed(id);
                    }
                    (Some(stored), None) => buffer.mark_filled(id, stored),
                    (None, None) => {
                        debug!(id, "no stored content for message");
                        buffer.mark_missing(id);
                    }
                },
                None => debug!(id, "buffer released before read completed"),
            }
        }
        op => {
            if let Some(e) = error {
                error!(operation = ?op, error = %e, "store operation lost");
            }
        }
    }

    slot.clear();
}
