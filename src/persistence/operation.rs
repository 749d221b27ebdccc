//! Durable store operations
//!
//! Each ring buffer slot owns one `Slot` for the lifetime of the pipeline;
//! publishing overwrites the operation in place and the final stage clears it
//! back to `NoOp`, so the hot path does not allocate per operation.

use std::fmt;
use std::sync::{Arc, Weak};

use crate::broker::message::Message;
use crate::persistence::dao::StoredMessage;
use crate::queue::QueueBuffer;
use crate::utils::StoreError;

#[derive(Default)]
pub enum DbOperation {
    #[default]
    NoOp,
    InsertMessage(Message),
    DeleteMessage(u64),
    DetachFromQueue {
        queue: String,
        id: u64,
    },
    ReadMessageData {
        id: u64,
        buffer: Weak<QueueBuffer>,
    },
}

impl DbOperation {
    pub fn message_id(&self) -> Option<u64> {
        match self {
            DbOperation::NoOp => None,
            DbOperation::InsertMessage(message) => Some(message.internal_id()),
            DbOperation::DeleteMessage(id)
            | DbOperation::DetachFromQueue { id, .. }
            | DbOperation::ReadMessageData { id, .. } => Some(*id),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DbOperation::NoOp => "no-op",
            DbOperation::InsertMessage(_) => "insert",
            DbOperation::DeleteMessage(_) => "delete",
            DbOperation::DetachFromQueue { .. } => "detach",
            DbOperation::ReadMessageData { .. } => "read",
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            DbOperation::InsertMessage(_)
                | DbOperation::DeleteMessage(_)
                | DbOperation::DetachFromQueue { .. }
        )
    }
}

impl fmt::Debug for DbOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbOperation::DetachFromQueue { queue, id } => {
                write!(f, "detach(id={id}, queue={queue})")
            }
            other => match other.message_id() {
                Some(id) => write!(f, "{}(id={id})", other.kind()),
                None => f.write_str(other.kind()),
            },
        }
    }
}

/// Pre-allocated ring buffer entry.
#[derive(Default)]
pub struct Slot {
    pub op: DbOperation,
    /// Set by the writer when the batch holding this operation failed.
    pub error: Option<Arc<StoreError>>,
    /// Content found by the writer for a read operation.
    pub fill: Option<StoredMessage>,
}

impl Slot {
    /// Returns the slot to the free state, releasing any message it held.
    pub fn clear(&mut self) {
        self.op = DbOperation::NoOp;
        self.error = None;
        self.fill = None;
    }
}
