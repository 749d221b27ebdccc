//! Bounded multi-producer ring buffer feeding the store pipeline.
//!
//! Producers claim the next sequence under the cursor lock and fill the slot
//! in place, so sequence order is publish order. The single consumer drains
//! every published sequence at once and releases them together after the
//! last stage. Publishing into a full ring blocks; that is the only
//! backpressure in the core.

use std::ops::Range;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::utils::StoreError;

#[derive(Debug, Default)]
struct Cursor {
    next: u64,
    consumed: u64,
    closed: bool,
    terminated: bool,
}

pub struct RingBuffer<T> {
    slots: Box<[Mutex<T>]>,
    mask: u64,
    cursor: Mutex<Cursor>,
    published: Condvar,
    released: Condvar,
}

impl<T: Default> RingBuffer<T> {
    /// Capacity is rounded up to a power of two.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let slots = (0..capacity).map(|_| Mutex::new(T::default())).collect();
        Self {
            slots,
            mask: capacity as u64 - 1,
            cursor: Mutex::new(Cursor::default()),
            published: Condvar::new(),
            released: Condvar::new(),
        }
    }
}

impl<T> RingBuffer<T> {
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn publish(&self, fill: impl FnOnce(&mut T)) -> Result<u64, StoreError> {
        let mut cursor = self.cursor.lock();
        while cursor.next - cursor.consumed == self.slots.len() as u64 && !cursor.closed {
            self.released.wait(&mut cursor);
        }
        if cursor.closed {
            return Err(StoreError::Closed);
        }

        let sequence = cursor.next;
        fill(&mut self.slots[(sequence & self.mask) as usize].lock());
        cursor.next += 1;
        self.published.notify_one();
        Ok(sequence)
    }

    /// Blocks until something is published. `None` once closed and drained.
    pub fn next_batch(&self) -> Option<Range<u64>> {
        let mut cursor = self.cursor.lock();
        while cursor.next == cursor.consumed {
            if cursor.closed {
                return None;
            }
            self.published.wait(&mut cursor);
        }
        Some(cursor.consumed..cursor.next)
    }

    /// Published but not yet drained sequences, without blocking.
    pub fn try_next_batch(&self) -> Option<Range<u64>> {
        let cursor = self.cursor.lock();
        (cursor.next > cursor.consumed).then(|| cursor.consumed..cursor.next)
    }

    pub fn slot(&self, sequence: u64) -> MutexGuard<'_, T> {
        self.slots[(sequence & self.mask) as usize].lock()
    }

    /// Hands every sequence below `upto` back to producers.
    pub fn release(&self, upto: u64) {
        let mut cursor = self.cursor.lock();
        cursor.consumed = upto;
        self.released.notify_all();
    }

    /// Blocks until everything published before the call has been released.
    pub fn wait_drained(&self) {
        let mut cursor = self.cursor.lock();
        let target = cursor.next;
        while cursor.consumed < target && !cursor.terminated {
            self.released.wait(&mut cursor);
        }
    }

    pub fn close(&self) {
        let mut cursor = self.cursor.lock();
        cursor.closed = true;
        self.published.notify_all();
        self.released.notify_all();
    }

    /// Marks the consumer gone so nobody waits on it forever.
    pub fn terminate(&self) {
        let mut cursor = self.cursor.lock();
        cursor.closed = true;
        cursor.terminated = true;
        self.published.notify_all();
        self.released.notify_all();
    }

    pub fn in_flight(&self) -> u64 {
        let cursor = self.cursor.lock();
        cursor.next - cursor.consumed
    }
}
