//! Schema layer - declarative type → table mapping
//!
//! - `DbColumn`: one physical column and the relation it backs
//! - `Relation`: how one property is stored (scalar, reference, collection, virtual)
//! - `DbMapping`: one type's table, columns and relations
//! - `SchemaRegistry`: every mapping, validated together

pub mod column;
pub mod relation;
pub mod dbmapping;
pub mod registry;

pub use column::DbColumn;
pub use relation::{Cardinality, JoinTable, Relation, RelationKind, TargetTable};
pub use dbmapping::{CollectionQuery, CollectionSource, DbMapping, DbMappingBuilder, CREATED_COLUMN, MODIFIED_COLUMN, VERSION_COLUMN};
pub use registry::{SchemaRegistry, SchemaRegistryBuilder};
