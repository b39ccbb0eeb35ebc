//! Out-of-band writes
//!
//! A [`RemoteWriter`] writes straight into a store under its own author,
//! bypassing the edit queue and the notifier, the way another process
//! sharing the store file would. Such writes only reach contexts and
//! subscribers once the store is reconciled.

use coffer_core::{
    error::Result,
    traits::ObjectStore,
    types::{Attributes, CommitInfo, ObjectId, ObjectUpdate, StoreCommit, StoredObject},
};
use std::sync::Arc;
use tracing::debug;

pub struct RemoteWriter {
    store: Arc<dyn ObjectStore>,
    author: String,
    schema_version: u32,
}

impl RemoteWriter {
    pub fn new(store: Arc<dyn ObjectStore>, author: impl Into<String>, schema_version: u32) -> Self {
        Self {
            store,
            author: author.into(),
            schema_version,
        }
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn insert(&self, entity: &str, attributes: Attributes) -> Result<ObjectId> {
        let key = self.store.allocate_keys(1)?;
        let id = ObjectId::new(self.store.identity(), entity, key);
        let mut commit = StoreCommit::new(&self.author);
        commit
            .inserts
            .push(StoredObject::new(id.clone(), attributes, self.schema_version));
        self.commit(commit)?;
        Ok(id)
    }

    pub fn update(&self, id: &ObjectId, set: Attributes) -> Result<CommitInfo> {
        let mut commit = StoreCommit::new(&self.author);
        commit.updates.push(ObjectUpdate::new(id.clone(), set));
        self.commit(commit)
    }

    pub fn delete(&self, id: &ObjectId) -> Result<CommitInfo> {
        let mut commit = StoreCommit::new(&self.author);
        commit.deletes.push(id.clone());
        self.commit(commit)
    }

    /// Commit a prepared batch. The commit's author is replaced with this
    /// writer's author.
    pub fn commit(&self, mut commit: StoreCommit) -> Result<CommitInfo> {
        commit.author = self.author.clone();
        let info = self.store.commit(commit)?;
        debug!(
            "Remote write by '{}' to {}: token {:?}",
            self.author,
            self.store.identity(),
            info.token
        );
        Ok(info)
    }
}
