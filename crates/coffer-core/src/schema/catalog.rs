use crate::error::{CofferError, Result};
use crate::schema::mapping::MappingModel;
use crate::schema::model::SchemaModel;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

const SCHEMA_SUFFIX: &str = ".schema.json";
const MAPPING_SUFFIX: &str = ".mapping.json";

/// Every compiled schema version plus explicit per-step mappings
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    versions: BTreeMap<u32, SchemaModel>,
    /// Keyed by source version
    mappings: BTreeMap<u32, MappingModel>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(model: SchemaModel) -> Self {
        Self::new().with_version(model)
    }

    pub fn with_version(mut self, model: SchemaModel) -> Self {
        self.versions.insert(model.version, model);
        self
    }

    pub fn with_mapping(mut self, mapping: MappingModel) -> Self {
        self.mappings.insert(mapping.source_version, mapping);
        self
    }

    /// Load `*.schema.json` and `*.mapping.json` from a directory.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let mut catalog = Self::new();
        let mut entries: Vec<_> = std::fs::read_dir(dir.as_ref())?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        entries.sort();

        for path in entries {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(SCHEMA_SUFFIX) {
                let model: SchemaModel = read_json(&path)?;
                debug!("Loaded schema v{} from {}", model.version, path.display());
                catalog = catalog.with_version(model);
            } else if name.ends_with(MAPPING_SUFFIX) {
                let mapping: MappingModel = read_json(&path)?;
                if mapping.destination_version != mapping.source_version + 1 {
                    return Err(CofferError::Config(format!(
                        "{}: mapping must cover exactly one version step",
                        path.display()
                    )));
                }
                catalog = catalog.with_mapping(mapping);
            }
        }

        if catalog.versions.is_empty() {
            return Err(CofferError::UnknownSchema(format!(
                "No schema files in {}",
                dir.as_ref().display()
            )));
        }
        Ok(catalog)
    }

    /// Highest compiled version: the version the program requires.
    pub fn latest(&self) -> Result<&SchemaModel> {
        self.versions
            .values()
            .next_back()
            .ok_or_else(|| CofferError::UnknownSchema("Schema catalog is empty".into()))
    }

    pub fn model(&self, version: u32) -> Result<&SchemaModel> {
        self.versions
            .get(&version)
            .ok_or_else(|| CofferError::UnknownSchema(format!("Schema version {version} is not compiled in")))
    }

    pub fn versions(&self) -> impl Iterator<Item = u32> + '_ {
        self.versions.keys().copied()
    }

    pub fn explicit_mapping(&self, source_version: u32) -> Option<&MappingModel> {
        self.mappings.get(&source_version)
    }

    /// Versions `current+1 ..= target`, each of which must be compiled in.
    pub fn chain(&self, current: u32, target: u32) -> Result<Vec<u32>> {
        self.model(current)?;
        if current > target {
            return Err(CofferError::UnknownSchema(format!(
                "Store version {current} is newer than program version {target}"
            )));
        }
        (current + 1..=target)
            .map(|v| self.model(v).map(|_| v))
            .collect()
    }

    /// Mapping for `from -> from + 1`, explicit where available.
    pub fn step_mapping(&self, from: u32) -> Result<MappingModel> {
        let source = self.model(from)?;
        let destination = self.model(from + 1)?;
        MappingModel::resolve(self.explicit_mapping(from), source, destination)
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| CofferError::Serialization(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog(versions: &[u32]) -> SchemaCatalog {
        versions
            .iter()
            .fold(SchemaCatalog::new(), |c, v| c.with_version(SchemaModel::new(*v)))
    }

    #[test]
    fn test_chain_is_contiguous() {
        let c = catalog(&[1, 2, 3]);
        assert_eq!(c.chain(1, 3).unwrap(), vec![2, 3]);
        assert!(c.chain(3, 3).unwrap().is_empty());
        assert_eq!(c.latest().unwrap().version, 3);
    }

    #[test]
    fn test_gap_is_unknown_schema() {
        let c = catalog(&[1, 3]);
        assert!(matches!(c.chain(1, 3), Err(CofferError::UnknownSchema(_))));
        assert!(matches!(c.chain(2, 3), Err(CofferError::UnknownSchema(_))));
    }

    #[test]
    fn test_load_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("v1.schema.json"),
            r#"{"version": 1, "entities": {"Note": {"attributes": {"title": {"kind": "text"}}}}}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("v2.schema.json"),
            r#"{"version": 2, "entities": {"Memo": {"attributes": {"title": {"kind": "text"}}}}}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("v1-v2.mapping.json"),
            r#"{"source_version": 1, "destination_version": 2,
                "entities": {"Memo": {"source_entity": "Note",
                    "attributes": {"title": {"op": "copy", "from": "title"}}}}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("README"), "ignored").unwrap();

        let c = SchemaCatalog::load_dir(dir.path()).unwrap();
        assert_eq!(c.versions().collect::<Vec<_>>(), vec![1, 2]);
        assert!(c.explicit_mapping(1).is_some());
        let step = c.step_mapping(1).unwrap();
        assert_eq!(step.entity_renames().get("Note"), Some(&"Memo".to_string()));
    }
}
