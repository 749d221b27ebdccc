//! Write-behind pipeline between the hot path and the backing store.

use std::ops::Range;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::config::StoreSettings;
use crate::persistence::dao::MessageDao;
use crate::persistence::matcher::EventMatcher;
use crate::persistence::operation::{DbOperation, Slot};
use crate::persistence::ring::RingBuffer;
use crate::persistence::writer::{self, DbWriter};
use crate::utils::StoreError;

/// The consumer side: matcher, writer and final stage run over each drained
/// range in publish order before the range is released.
pub struct PipelineConsumer {
    matcher: EventMatcher,
    writer: DbWriter,
}

impl PipelineConsumer {
    pub fn new(dao: Arc<dyn MessageDao>, window: usize, max_batch_size: usize) -> Self {
        Self {
            matcher: EventMatcher::new(window),
            writer: DbWriter::new(dao, max_batch_size),
        }
    }

    pub fn process(&mut self, ring: &RingBuffer<Slot>, range: Range<u64>) {
        if range.is_empty() {
            return;
        }
        let last = range.end - 1;

        for sequence in range.clone() {
            self.matcher.on_event(ring, sequence);
        }
        self.matcher.reset();

        for sequence in range.clone() {
            self.writer.on_event(ring, sequence, sequence == last);
        }

        for sequence in range.clone() {
            writer::finish(ring, sequence);
        }

        ring.release(range.end);
    }

    pub fn cancelled(&self) -> u64 {
        self.matcher.cancelled()
    }
}

pub struct StorePipeline {
    ring: Arc<RingBuffer<Slot>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl StorePipeline {
    pub fn start(dao: Arc<dyn MessageDao>, settings: &StoreSettings) -> Result<Self, StoreError> {
        let ring = Arc::new(RingBuffer::new(settings.ring_buffer_size));
        let mut consumer =
            PipelineConsumer::new(dao, ring.capacity(), settings.max_db_batch_size);

        let consumer_ring = ring.clone();
        let handle = thread::Builder::new()
            .name("store-pipeline".to_string())
            .spawn(move || {
                let _guard = TerminateOnExit(consumer_ring.clone());
                while let Some(range) = consumer_ring.next_batch() {
                    consumer.process(&consumer_ring, range);
                }
                debug!(cancelled = consumer.cancelled(), "store pipeline drained");
            })?;

        info!(capacity = ring.capacity(), "store pipeline started");
        Ok(Self {
            ring,
            consumer: Mutex::new(Some(handle)),
        })
    }

    /// Blocks while the ring is full.
    pub fn publish(&self, op: DbOperation) -> Result<u64, StoreError> {
        self.ring.publish(move |slot| {
            slot.clear();
            slot.op = op;
        })
    }

    /// Waits until every operation published so far has passed the final stage.
    pub fn sync(&self) {
        self.ring.wait_drained();
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Stops accepting operations, drains what is queued and joins the thread.
    pub fn close(&self) {
        self.ring.close();
        let Some(handle) = self.consumer.lock().take() else {
            return;
        };
        // The last store handle can be dropped by the final stage itself.
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!("store pipeline thread panicked");
        }
        info!("store pipeline stopped");
    }
}

impl Drop for StorePipeline {
    fn drop(&mut self) {
        self.close();
    }
}

struct TerminateOnExit(Arc<RingBuffer<Slot>>);

impl Drop for TerminateOnExit {
    fn drop(&mut self) {
        self.0.terminate();
    }
}
