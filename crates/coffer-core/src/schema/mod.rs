//! Schema versions and mappings between them
//!
//! A [`SchemaCatalog`] holds every compiled [`SchemaModel`] the program
//! knows about plus optional explicit [`MappingModel`]s for individual
//! steps. Steps without an explicit mapping get one inferred from the two
//! neighbouring schema versions.

pub mod catalog;
pub mod mapping;
pub mod model;

pub use catalog::SchemaCatalog;
pub use mapping::{AttributeMapping, EntityMapping, MappingModel};
pub use model::{AttributeKind, AttributeSchema, EntitySchema, SchemaModel};
