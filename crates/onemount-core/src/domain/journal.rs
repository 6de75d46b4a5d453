//! Offline-change journal entries
//!
//! While the mount is offline every mutating operation appends one entry.
//! On reconnection the journal is replayed strictly in append order and each
//! entry becomes exactly one upload submission or deletion submission.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::ItemId;

/// The mutating operation recorded by a journal entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalOp {
    /// A file or folder was created locally
    Create {
        parent_id: ItemId,
        name: String,
        is_dir: bool,
    },
    /// Cached content was modified
    Modify,
    /// The item was deleted locally (tombstoned)
    Delete,
    /// The item was renamed or moved
    Rename {
        new_parent_id: ItemId,
        new_name: String,
    },
}

/// One recorded offline mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Item the operation applies to (local id for offline creates)
    pub id: ItemId,
    /// The recorded operation
    #[serde(flatten)]
    pub op: JournalOp,
    /// When the mutation happened
    pub timestamp: DateTime<Utc>,
}

impl JournalEntry {
    /// Records an operation against an item, stamped now.
    #[must_use]
    pub fn new(id: ItemId, op: JournalOp) -> Self {
        Self {
            id,
            op,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_roundtrip() {
        let entry = JournalEntry::new(
            ItemId::local(),
            JournalOp::Create {
                parent_id: ItemId::root(),
                name: "notes.txt".into(),
                is_dir: false,
            },
        );
        let json = serde_json::to_string(&entry).unwrap();
        let back: JournalEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(entry, back);
    }

    #[test]
    fn test_tagged_op_shape() {
        let entry = JournalEntry::new(ItemId::new("A1").unwrap(), JournalOp::Delete);
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"op\":\"delete\""));
    }

    #[test]
    fn test_rename_payload() {
        let entry = JournalEntry::new(
            ItemId::new("A1").unwrap(),
            JournalOp::Rename {
                new_parent_id: ItemId::new("B2").unwrap(),
                new_name: "renamed.txt".into(),
            },
        );
        match &entry.op {
            JournalOp::Rename {
                new_parent_id,
                new_name,
            } => {
                assert_eq!(new_parent_id.as_str(), "B2");
                assert_eq!(new_name, "renamed.txt");
            }
            other => panic!("unexpected op: {other:?}"),
        }
    }
}
