use crate::types::object_id::ObjectId;
use crate::types::value::{Attributes, Value};
use serde::{Deserialize, Serialize};

/// A persisted object as read from or written to a physical store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    pub id: ObjectId,
    pub attributes: Attributes,
    /// Schema version the object was created (or last migrated) under
    pub schema_version: u32,
}

impl StoredObject {
    pub fn new(id: ObjectId, attributes: Attributes, schema_version: u32) -> Self {
        Self {
            id,
            attributes,
            schema_version,
        }
    }

    pub fn entity(&self) -> &str {
        self.id.entity()
    }

    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.attributes.get(attribute)
    }
}

/// Attribute patch for an existing object. Attributes not named in `set`
/// keep their stored value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectUpdate {
    pub id: ObjectId,
    pub set: Attributes,
}

impl ObjectUpdate {
    pub fn new(id: ObjectId, set: Attributes) -> Self {
        Self { id, set }
    }

    /// Apply the patch on top of `base`. A null value clears the attribute.
    pub fn apply_to(&self, base: &mut Attributes) {
        for (name, value) in &self.set {
            if value.is_null() {
                base.remove(name);
            } else {
                base.insert(name.clone(), value.clone());
            }
        }
    }
}
