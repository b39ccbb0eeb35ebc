use crate::error::{CofferError, Result};
use crate::schema::model::SchemaModel;
use crate::types::{Attributes, ObjectId, StoredObject, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How one destination attribute gets its value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AttributeMapping {
    Copy { from: String },
    Constant { value: Value },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityMapping {
    /// Source entity (None = same name as the destination entity)
    #[serde(default)]
    pub source_entity: Option<String>,

    /// Destination attribute -> source of its value
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeMapping>,
}

/// Mapping for one migration step `source_version -> destination_version`.
///
/// Entities of the source version with no destination counterpart are
/// dropped, along with references to them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingModel {
    pub source_version: u32,
    pub destination_version: u32,

    /// Destination entity -> mapping
    #[serde(default)]
    pub entities: BTreeMap<String, EntityMapping>,
}

impl MappingModel {
    /// Derive a mapping from two schema versions: attributes present on
    /// both sides with compatible kinds are copied, new attributes take
    /// their declared default (or null when optional). Anything else
    /// cannot be inferred.
    pub fn infer(source: &SchemaModel, destination: &SchemaModel) -> Result<Self> {
        let mut entities = BTreeMap::new();
        for (name, dest_entity) in &destination.entities {
            let source_entity = match source.entities.get(name) {
                Some(entity) => entity,
                None => {
                    // Entity introduced in this version: nothing to carry over.
                    entities.insert(name.clone(), EntityMapping::default());
                    continue;
                }
            };

            let mut attributes = BTreeMap::new();
            for (attr, dest_attr) in &dest_entity.attributes {
                let mapping = match source_entity.attributes.get(attr) {
                    Some(src_attr) if src_attr.kind.converts_to(&dest_attr.kind) => {
                        AttributeMapping::Copy { from: attr.clone() }
                    }
                    Some(_) => {
                        return Err(inference_error(
                            source,
                            destination,
                            format!("{name}.{attr} changed kind"),
                        ))
                    }
                    None => match (&dest_attr.default, dest_attr.optional) {
                        (Some(value), _) => AttributeMapping::Constant {
                            value: value.clone(),
                        },
                        (None, true) => AttributeMapping::Constant { value: Value::Null },
                        (None, false) => {
                            return Err(inference_error(
                                source,
                                destination,
                                format!("{name}.{attr} is required and has no default"),
                            ))
                        }
                    },
                };
                attributes.insert(attr.clone(), mapping);
            }

            entities.insert(
                name.clone(),
                EntityMapping {
                    source_entity: None,
                    attributes,
                },
            );
        }

        Ok(Self {
            source_version: source.version,
            destination_version: destination.version,
            entities,
        })
    }

    /// Complete an explicit mapping: destination entities it does not
    /// mention are inferred.
    pub fn resolve(
        explicit: Option<&MappingModel>,
        source: &SchemaModel,
        destination: &SchemaModel,
    ) -> Result<Self> {
        let Some(explicit) = explicit else {
            return Self::infer(source, destination);
        };

        let mut resolved = explicit.clone();
        let mut missing = destination.clone();
        missing
            .entities
            .retain(|name, _| !explicit.entities.contains_key(name));
        if !missing.entities.is_empty() {
            let inferred = Self::infer(source, &missing)?;
            resolved.entities.extend(inferred.entities);
        }
        resolved.source_version = source.version;
        resolved.destination_version = destination.version;
        Ok(resolved)
    }

    /// Source entity name -> destination entity name
    pub fn entity_renames(&self) -> BTreeMap<String, String> {
        self.entities
            .iter()
            .map(|(dest, m)| (m.source_entity.clone().unwrap_or_else(|| dest.clone()), dest.clone()))
            .collect()
    }

    /// Rewrite an identity into the destination version, or None when its
    /// entity does not survive the step.
    pub fn map_id(&self, id: &ObjectId) -> Option<ObjectId> {
        self.entities.iter().find_map(|(dest, m)| {
            let source = m.source_entity.as_deref().unwrap_or(dest);
            (source == id.entity()).then(|| id.with_entity(dest.clone()))
        })
    }

    /// Transform one source object. Returns None when its entity is dropped.
    pub fn apply(&self, object: &StoredObject) -> Option<StoredObject> {
        let (dest_entity, mapping) = self.entities.iter().find(|(dest, m)| {
            m.source_entity.as_deref().unwrap_or(dest.as_str()) == object.entity()
        })?;

        let mut attributes = Attributes::new();
        for (attr, rule) in &mapping.attributes {
            let value = match rule {
                AttributeMapping::Copy { from } => {
                    object.attributes.get(from).cloned().unwrap_or(Value::Null)
                }
                AttributeMapping::Constant { value } => value.clone(),
            };
            let value = value.map_refs(|id| self.map_id(&id));
            if !value.is_null() {
                attributes.insert(attr.clone(), value);
            }
        }

        Some(StoredObject::new(
            object.id.with_entity(dest_entity.clone()),
            attributes,
            self.destination_version,
        ))
    }
}

fn inference_error(source: &SchemaModel, destination: &SchemaModel, reason: String) -> CofferError {
    CofferError::MigrationStep {
        from: source.version,
        to: destination.version,
        reason: format!("cannot infer mapping: {reason}"),
    }
}
