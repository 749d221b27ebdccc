use std::fmt;

use serde::{Deserialize, Serialize};

/// Distributed transaction identifier.
///
/// Equality and hashing cover the global id and the branch qualifier; the
/// format id is carried for the protocol layer only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Xid {
    pub format_id: i32,
    pub global_id: Vec<u8>,
    pub branch_qualifier: Vec<u8>,
}

impl Xid {
    pub fn new(format_id: i32, global_id: impl Into<Vec<u8>>, branch_qualifier: impl Into<Vec<u8>>) -> Self {
        Self {
            format_id,
            global_id: global_id.into(),
            branch_qualifier: branch_qualifier.into(),
        }
    }

    /// Key used by the backing store: length-prefixed global id followed by
    /// the branch qualifier.
    pub fn to_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(4 + self.global_id.len() + self.branch_qualifier.len());
        key.extend_from_slice(&(self.global_id.len() as u32).to_be_bytes());
        key.extend_from_slice(&self.global_id);
        key.extend_from_slice(&self.branch_qualifier);
        key
    }
}

impl PartialEq for Xid {
    fn eq(&self, other: &Self) -> bool {
        self.global_id == other.global_id && self.branch_qualifier == other.branch_qualifier
    }
}

impl Eq for Xid {}

impl std::hash::Hash for Xid {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.global_id.hash(state);
        self.branch_qualifier.hash(state);
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Xid{{format_id={}, global_id={}, branch_qualifier={}}}",
            self.format_id,
            String::from_utf8_lossy(&self.global_id),
            String::from_utf8_lossy(&self.branch_qualifier)
        )
    }
}
