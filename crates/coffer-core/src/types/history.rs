use crate::types::change_set::ChangeKind;
use crate::types::object_id::ObjectId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position in a store's transaction log. Strictly increasing per store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HistoryToken(pub u64);

impl HistoryToken {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HistoryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryChange {
    pub id: ObjectId,
    pub kind: ChangeKind,
}

/// One committed transaction as recorded in a store's history log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTransaction {
    pub token: HistoryToken,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub changes: Vec<HistoryChange>,
}
