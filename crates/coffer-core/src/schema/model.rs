use crate::config::DEFAULT_CONFIGURATION;
use crate::error::{CofferError, Result};
use crate::types::{Attributes, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttributeKind {
    Bool,
    Int,
    Float,
    Text,
    Bytes,
    Timestamp,
    Ref { target: String },
    Refs { target: String },
    Encoded,
}

impl AttributeKind {
    /// Whether `value` may be stored in an attribute of this kind.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (AttributeKind::Bool, Value::Bool(_))
            | (AttributeKind::Int, Value::Int(_))
            | (AttributeKind::Float, Value::Float(_) | Value::Int(_))
            | (AttributeKind::Text, Value::Text(_))
            | (AttributeKind::Bytes, Value::Bytes(_))
            | (AttributeKind::Timestamp, Value::Timestamp(_))
            | (AttributeKind::Encoded, Value::Encoded { .. }) => true,
            (AttributeKind::Ref { target }, Value::Ref(id)) => id.entity() == target,
            (AttributeKind::Refs { target }, Value::Refs(ids)) => {
                ids.iter().all(|id| id.entity() == target)
            }
            _ => false,
        }
    }

    /// Values of `self` can be carried over unchanged into `other`.
    pub fn converts_to(&self, other: &AttributeKind) -> bool {
        match (self, other) {
            (AttributeKind::Int, AttributeKind::Float) => true,
            (AttributeKind::Ref { .. }, AttributeKind::Ref { .. })
            | (AttributeKind::Refs { .. }, AttributeKind::Refs { .. }) => true,
            (a, b) => a == b,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeSchema {
    #[serde(flatten)]
    pub kind: AttributeKind,

    #[serde(default)]
    pub optional: bool,

    /// Value given to the attribute when an object is migrated into a
    /// version that introduces it
    #[serde(default)]
    pub default: Option<Value>,
}

impl AttributeSchema {
    pub fn required(kind: AttributeKind) -> Self {
        Self {
            kind,
            optional: false,
            default: None,
        }
    }

    pub fn optional(kind: AttributeKind) -> Self {
        Self {
            kind,
            optional: true,
            default: None,
        }
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntitySchema {
    /// Store configuration this entity lives in (None = default)
    #[serde(default)]
    pub configuration: Option<String>,

    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeSchema>,
}

impl EntitySchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_configuration(mut self, configuration: impl Into<String>) -> Self {
        self.configuration = Some(configuration.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, schema: AttributeSchema) -> Self {
        self.attributes.insert(name.into(), schema);
        self
    }

    pub fn configuration_name(&self) -> &str {
        self.configuration.as_deref().unwrap_or(DEFAULT_CONFIGURATION)
    }

    /// Per-field comparison: names of attributes whose value differs
    /// between `old` and `new`. Attributes missing on one side compare as
    /// null.
    pub fn changed_attributes(&self, old: &Attributes, new: &Attributes) -> Vec<String> {
        let null = Value::Null;
        self.attributes
            .keys()
            .filter(|name| {
                let a = old.get(*name).unwrap_or(&null);
                let b = new.get(*name).unwrap_or(&null);
                !a.same_as(b)
            })
            .cloned()
            .collect()
    }

    /// Check attribute values against their declared kinds. Undeclared
    /// attributes are rejected; missing required ones are only rejected
    /// when `complete` is set (new objects).
    pub fn validate(&self, entity: &str, attributes: &Attributes, complete: bool) -> Result<()> {
        for (name, value) in attributes {
            let schema = self.attributes.get(name).ok_or_else(|| {
                CofferError::Operation(format!("{entity} has no attribute '{name}'"))
            })?;
            if value.is_null() {
                if !schema.optional {
                    return Err(CofferError::Operation(format!(
                        "{entity}.{name} is required"
                    )));
                }
                continue;
            }
            if !schema.kind.accepts(value) {
                return Err(CofferError::Operation(format!(
                    "{entity}.{name} does not accept a {} value",
                    value.kind_name()
                )));
            }
        }
        if complete {
            for (name, schema) in &self.attributes {
                if !schema.optional && !attributes.contains_key(name) {
                    return Err(CofferError::Operation(format!(
                        "{entity}.{name} is required"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// One compiled schema version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaModel {
    pub version: u32,

    #[serde(default)]
    pub entities: BTreeMap<String, EntitySchema>,
}

impl SchemaModel {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            entities: BTreeMap::new(),
        }
    }

    pub fn with_entity(mut self, name: impl Into<String>, entity: EntitySchema) -> Self {
        self.entities.insert(name.into(), entity);
        self
    }

    pub fn entity(&self, name: &str) -> Result<&EntitySchema> {
        self.entities
            .get(name)
            .ok_or_else(|| CofferError::NotFound(format!("Entity {name} in schema v{}", self.version)))
    }

    /// Entities routed to `configuration`
    pub fn entities_in<'a>(&'a self, configuration: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entities
            .iter()
            .filter(move |(_, e)| e.configuration_name() == configuration)
            .map(|(name, _)| name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs;

    fn note() -> EntitySchema {
        EntitySchema::new()
            .with_attribute("title", AttributeSchema::required(AttributeKind::Text))
            .with_attribute("score", AttributeSchema::optional(AttributeKind::Float))
    }

    #[test]
    fn test_changed_attributes_per_field() {
        let entity = note();
        let old = attrs! { "title" => "a", "score" => 1.0 };
        let same = attrs! { "title" => "a", "score" => 1.0 };
        let new = attrs! { "title" => "b", "score" => 1.0 };

        assert!(entity.changed_attributes(&old, &same).is_empty());
        assert_eq!(entity.changed_attributes(&old, &new), vec!["title".to_string()]);
    }

    #[test]
    fn test_validate_kinds() {
        let entity = note();
        assert!(entity.validate("Note", &attrs! { "title" => "x" }, true).is_ok());
        assert!(entity.validate("Note", &attrs! { "score" => 2.0 }, true).is_err());
        assert!(entity.validate("Note", &attrs! { "score" => 2.0 }, false).is_ok());
        assert!(entity.validate("Note", &attrs! { "title" => 5i64 }, false).is_err());
        assert!(entity.validate("Note", &attrs! { "color" => "red" }, false).is_err());
    }

    #[test]
    fn test_schema_json_shape() {
        let json = r#"{
            "version": 2,
            "entities": {
                "Note": {
                    "configuration": "Cloud",
                    "attributes": {
                        "title": {"kind": "text"},
                        "folder": {"kind": "ref", "target": "Folder", "optional": true}
                    }
                }
            }
        }"#;
        let model: SchemaModel = serde_json::from_str(json).unwrap();
        let entity = model.entity("Note").unwrap();
        assert_eq!(entity.configuration_name(), "Cloud");
        assert_eq!(
            entity.attributes["folder"].kind,
            AttributeKind::Ref { target: "Folder".into() }
        );
        assert!(entity.attributes["folder"].optional);
    }
}
