//! Scoped contexts
//!
//! A [`Context`] is an isolated working set of objects, owned by exactly one
//! thread. Objects are addressed through [`Handle`]s that are only valid in
//! the context that produced them; to reach the same object from another
//! context, pass its [`ObjectId`] and resolve it there.

use crate::stores::StoreSet;
use coffer_core::{
    error::{CofferError, Result},
    traits::AttributeFilter,
    types::{
        Attributes, ChangeSet, ObjectId, ObjectUpdate, StoreCommit, StoreIdentity, StoredObject,
        Value,
    },
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;
use tracing::trace;

pub type ContextId = u64;

/// Context-bound reference to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    context: ContextId,
    slot: usize,
}

impl Handle {
    pub fn context(&self) -> ContextId {
        self.context
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Clean,
    /// Created in this context, not yet saved
    Inserted,
    Dirty,
    /// Deleted in this context, not yet saved
    Deleted,
    /// Deleted and saved, or removed by an incoming change
    Gone,
}

#[derive(Debug)]
struct Slot {
    entity: String,
    id: Option<ObjectId>,
    /// Last known durable state
    base: Attributes,
    working: Attributes,
    state: SlotState,
}

impl Slot {
    fn is_live(&self) -> bool {
        !matches!(self.state, SlotState::Deleted | SlotState::Gone)
    }
}

/// One save or reconciled batch, as delivered to auto-merging contexts.
#[derive(Debug, Clone)]
pub struct MergePayload {
    /// Context whose save produced this payload; it is never merged back
    /// into that context.
    pub origin: Option<ContextId>,
    pub change_set: ChangeSet,
    /// Post-change state of inserted and updated objects
    pub snapshots: BTreeMap<ObjectId, StoredObject>,
}

/// Pending payloads for one context. The notifier pushes, the owning
/// thread drains.
#[derive(Debug, Default)]
pub struct MergeInbox {
    queue: Mutex<Vec<Arc<MergePayload>>>,
}

impl MergeInbox {
    pub fn push(&self, payload: Arc<MergePayload>) {
        self.queue.lock().push(payload);
    }

    fn drain(&self) -> Vec<Arc<MergePayload>> {
        std::mem::take(&mut *self.queue.lock())
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

/// Effect of merging incoming changes into a context
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Objects whose state was replaced by newer durable state
    pub refreshed: Vec<ObjectId>,
    /// Objects that stopped resolving because they were deleted
    pub invalidated: Vec<ObjectId>,
}

impl MergeReport {
    pub fn is_empty(&self) -> bool {
        self.refreshed.is_empty() && self.invalidated.is_empty()
    }

    fn absorb(&mut self, other: MergeReport) {
        self.refreshed.extend(other.refreshed);
        self.invalidated.extend(other.invalidated);
    }
}

/// Changes collected from a context, grouped by target store
#[derive(Debug, Default)]
pub struct PendingSave {
    pub commits: BTreeMap<StoreIdentity, StoreCommit>,
}

impl PendingSave {
    pub fn is_empty(&self) -> bool {
        self.commits.values().all(|c| c.is_empty())
    }

    fn commit_for(&mut self, store: &StoreIdentity) -> &mut StoreCommit {
        self.commits.entry(store.clone()).or_default()
    }
}

/// Isolated working set of objects bound to one thread.
pub struct Context {
    id: ContextId,
    stores: Arc<StoreSet>,
    slots: Vec<Slot>,
    by_id: HashMap<ObjectId, usize>,
    inbox: Option<Arc<MergeInbox>>,
    // Contexts never leave the thread that created them.
    _not_send: PhantomData<Rc<()>>,
}

impl Context {
    pub(crate) fn new(id: ContextId, stores: Arc<StoreSet>, inbox: Option<Arc<MergeInbox>>) -> Self {
        Self {
            id,
            stores,
            slots: Vec::new(),
            by_id: HashMap::new(),
            inbox,
            _not_send: PhantomData,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Whether this context receives every writer save automatically.
    pub fn merges_on_save(&self) -> bool {
        self.inbox.is_some()
    }

    /// Create a new object. It gets a permanent identity on save or when
    /// [`Context::identity_of`] is called.
    pub fn insert(&mut self, entity: &str, attributes: Attributes) -> Result<Handle> {
        self.sync();
        self.stores
            .entity_schema(entity)?
            .validate(entity, &attributes, false)?;
        let slot = self.slots.len();
        self.slots.push(Slot {
            entity: entity.to_string(),
            id: None,
            base: Attributes::new(),
            working: attributes,
            state: SlotState::Inserted,
        });
        Ok(self.handle(slot))
    }

    /// Current (possibly uncommitted) attributes of an object
    pub fn get(&mut self, handle: Handle) -> Result<&Attributes> {
        self.sync();
        let slot = self.live_slot(handle)?;
        Ok(&self.slots[slot].working)
    }

    /// One attribute, `Value::Null` when unset
    pub fn attribute(&mut self, handle: Handle, name: &str) -> Result<Value> {
        Ok(self.get(handle)?.get(name).cloned().unwrap_or(Value::Null))
    }

    pub fn entity_of(&self, handle: Handle) -> Result<&str> {
        let slot = self.slot_index(handle)?;
        Ok(&self.slots[slot].entity)
    }

    pub fn set(&mut self, handle: Handle, name: &str, value: impl Into<Value>) -> Result<()> {
        self.sync();
        let slot = self.live_slot(handle)?;
        let value = value.into();
        let entity = self.slots[slot].entity.clone();
        let mut patch = Attributes::new();
        patch.insert(name.to_string(), value.clone());
        self.stores
            .entity_schema(&entity)?
            .validate(&entity, &patch, false)?;

        let slot = &mut self.slots[slot];
        if value.is_null() {
            slot.working.remove(name);
        } else {
            slot.working.insert(name.to_string(), value);
        }
        if slot.state == SlotState::Clean {
            slot.state = SlotState::Dirty;
        }
        Ok(())
    }

    pub fn delete(&mut self, handle: Handle) -> Result<()> {
        self.sync();
        let slot = self.live_slot(handle)?;
        let slot = &mut self.slots[slot];
        slot.state = match slot.state {
            // Never saved: nothing to delete durably.
            SlotState::Inserted => SlotState::Gone,
            _ => SlotState::Deleted,
        };
        Ok(())
    }

    /// Permanent identity of an object, assigning one if it is still
    /// provisional. Fails only if the object was removed in this context.
    pub fn identity_of(&mut self, handle: Handle) -> Result<ObjectId> {
        self.sync();
        let slot = self.live_slot(handle)?;
        if let Some(id) = &self.slots[slot].id {
            return Ok(id.clone());
        }

        let entity = self.slots[slot].entity.clone();
        let store = self.stores.for_entity(&entity)?;
        let key = store.allocate_keys(1)?;
        let id = ObjectId::new(store.identity(), entity, key);
        self.slots[slot].id = Some(id.clone());
        self.by_id.insert(id.clone(), slot);
        trace!("Context {} assigned {}", self.id, id);
        Ok(id)
    }

    /// Permanent identity if one has been assigned
    pub fn object_id(&self, handle: Handle) -> Result<Option<ObjectId>> {
        let slot = self.slot_index(handle)?;
        Ok(self.slots[slot].id.clone())
    }

    /// Look an identity up in this context. `None` is a normal outcome: the
    /// object may not exist in this scope's generation.
    pub fn resolve(&mut self, id: &ObjectId) -> Result<Option<Handle>> {
        self.sync();
        if let Some(&slot) = self.by_id.get(id) {
            return Ok(self.slots[slot].is_live().then(|| self.handle(slot)));
        }

        let Some(store) = self.stores.by_identity(id.store()) else {
            return Ok(None);
        };
        Ok(store.load(id)?.map(|object| self.register(object)))
    }

    /// Every object of `entity`, including unsaved inserts.
    pub fn all(&mut self, entity: &str) -> Result<Vec<Handle>> {
        self.query(entity, &AttributeFilter::All)
    }

    /// Every object of `entity` ordered by one attribute
    pub fn all_sorted_by(
        &mut self,
        entity: &str,
        attribute: &str,
        ascending: bool,
    ) -> Result<Vec<Handle>> {
        let mut handles = self.all(entity)?;
        let null = Value::Null;
        handles.sort_by(|a, b| {
            let va = self.slots[a.slot].working.get(attribute).unwrap_or(&null);
            let vb = self.slots[b.slot].working.get(attribute).unwrap_or(&null);
            let ord = va.sort_cmp(vb);
            if ascending {
                ord
            } else {
                ord.reverse()
            }
        });
        Ok(handles)
    }

    /// Objects of `entity` whose `attribute` equals `value`
    pub fn find(
        &mut self,
        entity: &str,
        attribute: &str,
        value: impl Into<Value>,
    ) -> Result<Vec<Handle>> {
        self.query(entity, &AttributeFilter::equals(attribute, value))
    }

    pub fn find_first(
        &mut self,
        entity: &str,
        attribute: &str,
        value: impl Into<Value>,
    ) -> Result<Option<Handle>> {
        Ok(self.find(entity, attribute, value)?.into_iter().next())
    }

    /// Find the object whose `key_attribute` equals `key`, or insert a
    /// placeholder carrying only that attribute.
    pub fn upsert_by(
        &mut self,
        entity: &str,
        key_attribute: &str,
        key: impl Into<Value>,
    ) -> Result<Handle> {
        let key = key.into();
        if let Some(found) = self.find_first(entity, key_attribute, key.clone())? {
            return Ok(found);
        }
        let mut attributes = Attributes::new();
        attributes.insert(key_attribute.to_string(), key);
        self.insert(entity, attributes)
    }

    /// Resolve many identities, skipping the ones that do not resolve.
    pub fn objects_with<'a>(
        &mut self,
        ids: impl IntoIterator<Item = &'a ObjectId>,
    ) -> Result<Vec<Handle>> {
        let mut handles = Vec::new();
        for id in ids {
            if let Some(handle) = self.resolve(id)? {
                handles.push(handle);
            }
        }
        Ok(handles)
    }

    /// True if saving would write anything.
    pub fn has_changes(&self) -> bool {
        self.slots.iter().any(|slot| match slot.state {
            SlotState::Inserted => true,
            SlotState::Deleted => slot.id.is_some(),
            SlotState::Dirty => !same_attributes(&slot.base, &slot.working),
            SlotState::Clean | SlotState::Gone => false,
        })
    }

    /// Apply every pending incoming change now.
    pub fn refresh(&mut self) -> MergeReport {
        let mut report = MergeReport::default();
        if let Some(inbox) = self.inbox.clone() {
            for payload in inbox.drain() {
                report.absorb(self.merge(&payload));
            }
        }
        report
    }

    /// Merge one incoming change into this context. Incoming state wins
    /// over local edits to the same attribute; re-applying a payload that
    /// is already reflected here changes nothing.
    pub fn merge(&mut self, payload: &MergePayload) -> MergeReport {
        let mut report = MergeReport::default();
        if payload.origin == Some(self.id) {
            return report;
        }

        for id in &payload.change_set.deleted {
            if let Some(&slot) = self.by_id.get(id) {
                let slot = &mut self.slots[slot];
                if slot.state != SlotState::Gone {
                    slot.state = SlotState::Gone;
                    report.invalidated.push(id.clone());
                }
            }
        }

        let touched = payload
            .change_set
            .updated
            .iter()
            .chain(payload.change_set.inserted.iter());
        for id in touched {
            let (Some(&slot), Some(snapshot)) = (self.by_id.get(id), payload.snapshots.get(id))
            else {
                continue;
            };
            let slot = &mut self.slots[slot];
            if !slot.is_live() || same_attributes(&slot.base, &snapshot.attributes) {
                continue;
            }

            let incoming = &snapshot.attributes;
            let mut working = slot.working.clone();
            for name in slot.base.keys().chain(incoming.keys()) {
                let old = slot.base.get(name);
                let new = incoming.get(name);
                let changed = match (old, new) {
                    (Some(a), Some(b)) => !a.same_as(b),
                    (None, None) => false,
                    _ => true,
                };
                if changed {
                    match new {
                        Some(v) => working.insert(name.clone(), v.clone()),
                        None => working.remove(name),
                    };
                }
            }

            slot.base = incoming.clone();
            slot.working = working;
            slot.state = if same_attributes(&slot.base, &slot.working) {
                SlotState::Clean
            } else {
                SlotState::Dirty
            };
            report.refreshed.push(id.clone());
        }

        report
    }

    /// Gather unsaved changes, assigning permanent identities to inserts.
    pub(crate) fn collect_changes(&mut self) -> Result<PendingSave> {
        self.sync();
        let schema_version = self.stores.schema().version;

        // Validate before allocating anything.
        for slot in &self.slots {
            if slot.state == SlotState::Inserted {
                self.stores
                    .entity_schema(&slot.entity)?
                    .validate(&slot.entity, &slot.working, true)?;
            }
        }

        // Batch key allocation per store.
        let mut needs_id: BTreeMap<StoreIdentity, Vec<usize>> = BTreeMap::new();
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot.state == SlotState::Inserted && slot.id.is_none() {
                let store = self.stores.for_entity(&slot.entity)?;
                needs_id.entry(store.identity()).or_default().push(idx);
            }
        }
        for (identity, slots) in needs_id {
            let store = self
                .stores
                .by_identity(&identity)
                .ok_or_else(|| CofferError::NotFound(format!("Store {identity}")))?;
            let first = store.allocate_keys(slots.len() as u64)?;
            for (offset, idx) in slots.into_iter().enumerate() {
                let id = ObjectId::new(
                    identity.clone(),
                    self.slots[idx].entity.clone(),
                    first + offset as u64,
                );
                self.slots[idx].id = Some(id.clone());
                self.by_id.insert(id, idx);
            }
        }

        let mut pending = PendingSave::default();
        for slot in &self.slots {
            let Some(id) = &slot.id else {
                continue;
            };
            match slot.state {
                SlotState::Inserted => {
                    pending.commit_for(id.store()).inserts.push(StoredObject::new(
                        id.clone(),
                        slot.working.clone(),
                        schema_version,
                    ));
                }
                SlotState::Dirty => {
                    let entity = self.stores.entity_schema(&slot.entity)?;
                    let changed = entity.changed_attributes(&slot.base, &slot.working);
                    if changed.is_empty() {
                        continue;
                    }
                    let set = changed
                        .into_iter()
                        .map(|name| {
                            let value = slot.working.get(&name).cloned().unwrap_or(Value::Null);
                            (name, value)
                        })
                        .collect();
                    pending
                        .commit_for(id.store())
                        .updates
                        .push(ObjectUpdate::new(id.clone(), set));
                }
                SlotState::Deleted => {
                    pending.commit_for(id.store()).deletes.push(id.clone());
                }
                SlotState::Clean | SlotState::Gone => {}
            }
        }
        pending.commits.retain(|_, c| !c.is_empty());
        Ok(pending)
    }

    /// Promote local state to durable state after a successful save.
    pub(crate) fn mark_saved(&mut self) {
        self.promote(|_| true);
    }

    /// Promote only objects living in `stores`, after a save that failed
    /// part way. Changes for the other stores stay pending.
    pub(crate) fn mark_saved_in(&mut self, stores: &[StoreIdentity]) {
        self.promote(|id| id.is_some_and(|id| stores.contains(id.store())));
    }

    fn promote(&mut self, in_scope: impl Fn(Option<&ObjectId>) -> bool) {
        for slot in &mut self.slots {
            if !in_scope(slot.id.as_ref()) {
                continue;
            }
            match slot.state {
                SlotState::Inserted | SlotState::Dirty => {
                    // Null patches remove the attribute from the stored row.
                    slot.working.retain(|_, v| !v.is_null());
                    slot.base = slot.working.clone();
                    slot.state = SlotState::Clean;
                }
                SlotState::Deleted => slot.state = SlotState::Gone,
                SlotState::Clean | SlotState::Gone => {}
            }
        }
    }

    fn query(&mut self, entity: &str, filter: &AttributeFilter) -> Result<Vec<Handle>> {
        self.sync();
        let store = self.stores.for_entity(entity)?;
        let mut handles = Vec::new();

        for object in store.fetch(entity, filter)? {
            let handle = match self.by_id.get(&object.id) {
                Some(&slot) => self.handle(slot),
                None => self.register(object),
            };
            handles.push(handle);
        }

        // Local state overrides what the store matched: unsaved inserts and
        // edits are visible, local deletes are not.
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot.entity == entity
                && matches!(slot.state, SlotState::Inserted | SlotState::Dirty)
                && !handles.iter().any(|h| h.slot == idx)
            {
                handles.push(self.handle(idx));
            }
        }
        let slots = &self.slots;
        handles.retain(|h| {
            let slot = &slots[h.slot];
            slot.is_live() && filter.matches_attributes(&slot.working)
        });
        Ok(handles)
    }

    fn register(&mut self, object: StoredObject) -> Handle {
        let slot = self.slots.len();
        self.by_id.insert(object.id.clone(), slot);
        self.slots.push(Slot {
            entity: object.entity().to_string(),
            id: Some(object.id),
            base: object.attributes.clone(),
            working: object.attributes,
            state: SlotState::Clean,
        });
        self.handle(slot)
    }

    fn handle(&self, slot: usize) -> Handle {
        Handle {
            context: self.id,
            slot,
        }
    }

    fn slot_index(&self, handle: Handle) -> Result<usize> {
        if handle.context != self.id || handle.slot >= self.slots.len() {
            return Err(CofferError::ForeignHandle {
                handle_context: handle.context,
                context: self.id,
            });
        }
        Ok(handle.slot)
    }

    fn live_slot(&self, handle: Handle) -> Result<usize> {
        let slot = self.slot_index(handle)?;
        if !self.slots[slot].is_live() {
            let name = self.slots[slot]
                .id
                .as_ref()
                .map(|id| id.to_string())
                .unwrap_or_else(|| format!("provisional {}", self.slots[slot].entity));
            return Err(CofferError::ObjectRemoved(name));
        }
        Ok(slot)
    }

    /// Drain the inbox before every operation.
    fn sync(&mut self) {
        if self.inbox.as_ref().is_some_and(|i| !i.is_empty()) {
            self.refresh();
        }
    }
}

fn same_attributes(a: &Attributes, b: &Attributes) -> bool {
    a.len() == b.len()
        && a.iter()
            .all(|(k, v)| b.get(k).is_some_and(|other| v.same_as(other)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::tests::memory_store_set;
    use coffer_core::attrs;
    use coffer_core::types::ChangeKind;

    fn context(stores: &Arc<StoreSet>, id: ContextId) -> Context {
        Context::new(id, stores.clone(), None)
    }

    #[test]
    fn test_handles_are_context_bound() {
        let stores = memory_store_set();
        let mut a = context(&stores, 1);
        let mut b = context(&stores, 2);
        let handle = a.insert("Note", attrs! { "title" => "x" }).unwrap();

        assert!(matches!(
            b.get(handle),
            Err(CofferError::ForeignHandle {
                handle_context: 1,
                context: 2
            })
        ));
    }

    #[test]
    fn test_identity_forced_before_save_is_kept() {
        let stores = memory_store_set();
        let mut ctx = context(&stores, 1);
        let handle = ctx.insert("Note", attrs! { "title" => "x" }).unwrap();
        let id = ctx.identity_of(handle).unwrap();

        let pending = ctx.collect_changes().unwrap();
        let commit = pending.commits.values().next().unwrap();
        assert_eq!(commit.inserts[0].id, id);
        assert_eq!(ctx.identity_of(handle).unwrap(), id);
    }

    #[test]
    fn test_removed_object_has_no_identity() {
        let stores = memory_store_set();
        let mut ctx = context(&stores, 1);
        let handle = ctx.insert("Note", attrs! { "title" => "x" }).unwrap();
        ctx.delete(handle).unwrap();
        assert!(matches!(
            ctx.identity_of(handle),
            Err(CofferError::ObjectRemoved(_))
        ));
        assert!(!ctx.has_changes());
    }

    #[test]
    fn test_unchanged_edit_produces_no_update() {
        let stores = memory_store_set();
        let mut ctx = context(&stores, 1);
        let handle = ctx.insert("Note", attrs! { "title" => "x" }).unwrap();
        let pending = ctx.collect_changes().unwrap();
        for (identity, commit) in pending.commits {
            stores.by_identity(&identity).unwrap().commit(commit).unwrap();
        }
        ctx.mark_saved();

        ctx.set(handle, "title", "x").unwrap();
        assert!(!ctx.has_changes());
        assert!(ctx.collect_changes().unwrap().is_empty());
    }

    #[test]
    fn test_incomplete_insert_fails_at_save() {
        let stores = memory_store_set();
        let mut ctx = context(&stores, 1);
        ctx.upsert_by("Note", "rank", 4i64).unwrap();
        assert!(matches!(
            ctx.collect_changes(),
            Err(CofferError::Operation(_))
        ));
    }

    #[test]
    fn test_find_sees_local_edits() {
        let stores = memory_store_set();
        let mut ctx = context(&stores, 1);
        let a = ctx.insert("Note", attrs! { "title" => "a" }).unwrap();
        ctx.insert("Note", attrs! { "title" => "b" }).unwrap();

        assert_eq!(ctx.find("Note", "title", "a").unwrap(), vec![a]);
        ctx.set(a, "title", "c").unwrap();
        assert!(ctx.find("Note", "title", "a").unwrap().is_empty());
        assert_eq!(ctx.find_first("Note", "title", "c").unwrap(), Some(a));

        let sorted = ctx.all_sorted_by("Note", "title", false).unwrap();
        assert_eq!(sorted[0], a);
    }

    #[test]
    fn test_merge_incoming_trumps_local_and_is_idempotent() {
        let stores = memory_store_set();
        let mut writer = context(&stores, 1);
        let handle = writer
            .insert("Note", attrs! { "title" => "a", "body" => "one" })
            .unwrap();
        let id = writer.identity_of(handle).unwrap();
        for (identity, commit) in writer.collect_changes().unwrap().commits {
            stores.by_identity(&identity).unwrap().commit(commit).unwrap();
        }

        let mut reader = context(&stores, 2);
        let local = reader.resolve(&id).unwrap().unwrap();
        reader.set(local, "title", "local").unwrap();
        reader.set(local, "rank", 9i64).unwrap();

        let mut change_set = ChangeSet::new();
        change_set.record(id.clone(), ChangeKind::Update);
        let snapshot = StoredObject::new(
            id.clone(),
            attrs! { "title" => "remote", "body" => "one" },
            1,
        );
        let payload = MergePayload {
            origin: None,
            change_set,
            snapshots: BTreeMap::from([(id.clone(), snapshot)]),
        };

        let report = reader.merge(&payload);
        assert_eq!(report.refreshed, vec![id.clone()]);
        assert_eq!(reader.attribute(local, "title").unwrap(), Value::from("remote"));
        // Attributes the incoming change did not touch keep local edits.
        assert_eq!(reader.attribute(local, "rank").unwrap(), Value::Int(9));

        assert!(reader.merge(&payload).is_empty());
    }

    #[test]
    fn test_merge_skips_origin() {
        let stores = memory_store_set();
        let mut ctx = context(&stores, 7);
        let payload = MergePayload {
            origin: Some(7),
            change_set: ChangeSet::new(),
            snapshots: BTreeMap::new(),
        };
        assert!(ctx.merge(&payload).is_empty());
    }
}
