use crate::error::Result;
use crate::types::{HistoryToken, StoreIdentity};

/// Key under which a store's history cursor is persisted
pub fn token_key(store: &StoreIdentity) -> String {
    format!("HistoryToken{store}")
}

/// Durable side table of history cursors, one per physical store.
///
/// Lives outside the stores themselves so that erasing or swapping a store
/// file does not rewind its consumers.
pub trait TokenTable: Send + Sync {
    fn load(&self, store: &StoreIdentity) -> Result<Option<HistoryToken>>;

    fn store(&self, store: &StoreIdentity, token: HistoryToken) -> Result<()>;

    fn remove(&self, store: &StoreIdentity) -> Result<()>;
}
