pub mod change_set;
pub mod history;
pub mod meta;
pub mod object;
pub mod object_id;
pub mod value;

pub use change_set::{ChangeKind, ChangeSet};
pub use history::{HistoryChange, HistoryToken, HistoryTransaction};
pub use meta::{CommitInfo, StoreCommit, StoreMetadata};
pub use object::{ObjectUpdate, StoredObject};
pub use object_id::{ObjectId, StoreIdentity};
pub use value::{Attributes, Value};
