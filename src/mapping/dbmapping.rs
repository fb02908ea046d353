//! Per-type schema: table, columns and property relations

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use crate::{Error, Result};
use crate::value::ColumnType;
use super::column::DbColumn;
use super::relation::{Cardinality, JoinTable, Relation, RelationKind, TargetTable};

/// Row version used for optimistic concurrency checks
pub const VERSION_COLUMN: &str = "_version";
/// Creation time, milliseconds since the epoch
pub const CREATED_COLUMN: &str = "_created";
/// Last modification time, milliseconds since the epoch
pub const MODIFIED_COLUMN: &str = "_modified";

const SYSTEM_COLUMNS: &[&str] = &[VERSION_COLUMN, CREATED_COLUMN, MODIFIED_COLUMN];

/// Immutable schema of one node type.
///
/// Shared read-only by every node of the type. A schema reload produces new
/// instances; fields of a live mapping never change.
#[derive(Debug)]
pub struct DbMapping {
    type_name: String,
    table: Option<String>,
    id_column: String,
    columns: Vec<DbColumn>,
    property_columns: HashMap<String, usize>,
    column_properties: HashMap<String, String>,
    relations: HashMap<String, Arc<Relation>>,
    property_order: Vec<String>,
    parent: Option<Arc<Relation>>,
}

impl DbMapping {
    /// Start building a mapping for `type_name`
    pub fn builder(type_name: impl Into<String>) -> DbMappingBuilder {
        DbMappingBuilder::new(type_name)
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Primary table, `None` for purely in-memory types
    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    pub fn id_column(&self) -> &str {
        &self.id_column
    }

    /// Whether nodes of this type are stored in a table
    pub fn is_relational(&self) -> bool {
        self.table.is_some()
    }

    /// All columns in declaration order, id column first
    pub fn columns(&self) -> &[DbColumn] {
        &self.columns
    }

    /// Column backing `property`
    pub fn column_for(&self, property: &str) -> Option<&DbColumn> {
        self.property_columns.get(property).map(|&idx| &self.columns[idx])
    }

    /// Relation describing `property`
    pub fn relation_for(&self, property: &str) -> Option<&Arc<Relation>> {
        self.relations.get(property)
    }

    /// Property stored in `column`
    pub fn property_for_column(&self, column: &str) -> Option<&str> {
        self.column_properties.get(column).map(String::as_str)
    }

    /// Relations in declaration order
    pub fn relations(&self) -> impl Iterator<Item = &Arc<Relation>> {
        self.property_order.iter().filter_map(|p| self.relations.get(p))
    }

    /// Reference relation that names the hierarchical parent
    pub fn parent_relation(&self) -> Option<&Arc<Relation>> {
        self.parent.as_ref()
    }

    /// Describe the ordered id query of a collection relation owned by this
    /// type, for the parent with id `parent_id`.
    ///
    /// Identical inputs always produce an identical query: join-column
    /// equality, then the static filter, then the order-by, then physical
    /// order as the final tie-breaker.
    pub fn collection_query(&self, relation: &Relation, parent_id: &str) -> Result<CollectionQuery> {
        if relation.kind() != RelationKind::Collection {
            return Err(Error::Config(format!(
                "{}.{} is a {} relation, not a collection",
                self.type_name, relation.property(), relation.kind()
            )));
        }

        let target_type = relation.target_type().ok_or_else(|| {
            Error::Config(format!("{}.{} has no target type", self.type_name, relation.property()))
        })?;
        let target = relation.target_table().ok_or_else(|| {
            Error::Config(format!("target {} of {}.{} is not stored in a table",
                target_type, self.type_name, relation.property()))
        })?;

        let source = match relation.cardinality() {
            Cardinality::OneToMany => {
                let join_column = relation.join_column().ok_or_else(|| {
                    Error::Config(format!("{}.{} has no join column", self.type_name, relation.property()))
                })?;
                CollectionSource::Direct { join_column: join_column.to_string() }
            }
            Cardinality::ManyToMany(join) => CollectionSource::Joined(join.clone()),
            Cardinality::One => {
                return Err(Error::Config(format!(
                    "{}.{} has cardinality one", self.type_name, relation.property()
                )));
            }
        };

        Ok(CollectionQuery {
            target_type: target_type.to_string(),
            target: target.clone(),
            source,
            parent_id: parent_id.to_string(),
            filter: relation.filter().map(str::to_string),
            order_by: relation.order_by().map(str::to_string),
        })
    }
}

/// Where the child ids of a collection come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionSource {
    /// Children carry the parent id in `join_column`
    Direct { join_column: String },
    /// Parent/child pairs live in a join table
    Joined(JoinTable),
}

/// Store-neutral description of a collection's ordered id list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionQuery {
    pub target_type: String,
    pub target: TargetTable,
    pub source: CollectionSource,
    pub parent_id: String,
    pub filter: Option<String>,
    pub order_by: Option<String>,
}

/// Builder for `DbMapping`.
#[derive(Debug)]
pub struct DbMappingBuilder {
    type_name: String,
    table: Option<String>,
    id_column: String,
    properties: Vec<(Relation, Option<ColumnType>)>,
    parent: Option<String>,
}

impl DbMappingBuilder {
    fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            table: None,
            id_column: "id".to_string(),
            properties: Vec::new(),
            parent: None,
        }
    }

    /// Store nodes of this type in `table`
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Name of the primary key column (defaults to `id`)
    pub fn id_column(mut self, column: impl Into<String>) -> Self {
        self.id_column = column.into();
        self
    }

    /// Add a scalar property
    pub fn scalar(self, property: &str, column: &str, ty: ColumnType) -> Self {
        self.relation_typed(Relation::scalar(property, column), ty)
    }

    /// Add a reference property (text column)
    pub fn reference(self, property: &str, column: &str, target: &str) -> Self {
        self.relation_typed(Relation::reference(property, column, target), ColumnType::Text)
    }

    /// Add a relation without a column of its own
    pub fn relation(mut self, relation: Relation) -> Self {
        self.properties.push((relation, None));
        self
    }

    /// Add a relation whose column has type `ty`
    pub fn relation_typed(mut self, relation: Relation, ty: ColumnType) -> Self {
        self.properties.push((relation, Some(ty)));
        self
    }

    /// Name the reference property that points at the hierarchical parent
    pub fn parent(mut self, property: impl Into<String>) -> Self {
        self.parent = Some(property.into());
        self
    }

    pub(crate) fn type_name(&self) -> &str {
        &self.type_name
    }

    pub(crate) fn target_info(&self) -> Option<TargetTable> {
        self.table.as_ref().map(|table| TargetTable {
            table: table.clone(),
            id_column: self.id_column.clone(),
        })
    }

    /// Attach target table information to relations that lack it
    pub(crate) fn resolve_targets(&mut self, targets: &HashMap<String, TargetTable>) {
        let properties = std::mem::take(&mut self.properties);
        self.properties = properties
            .into_iter()
            .map(|(rel, ty)| {
                let known = rel.target_table().is_some();
                match rel.target_type().and_then(|t| targets.get(t)) {
                    Some(target) if !known => {
                        let target = target.clone();
                        (rel.with_target_table(target.table, target.id_column), ty)
                    }
                    _ => (rel, ty),
                }
            })
            .collect();
    }

    /// Validate and freeze the mapping
    pub fn build(self) -> Result<DbMapping> {
        let type_name = self.type_name;
        if type_name.is_empty() {
            return Err(Error::Config("type name must not be empty".to_string()));
        }

        let mut columns = vec![DbColumn::new(self.id_column.clone(), ColumnType::Text, None)?];
        let mut seen_columns: HashSet<String> = HashSet::new();
        seen_columns.insert(self.id_column.clone());

        let mut property_columns = HashMap::new();
        let mut column_properties = HashMap::new();
        let mut relations = HashMap::new();
        let mut property_order = Vec::new();

        for (relation, ty) in self.properties {
            let property = relation.property().to_string();
            if relations.contains_key(&property) {
                return Err(Error::SchemaConflict(format!(
                    "{} declares property {} twice", type_name, property
                )));
            }

            let relation = Arc::new(relation);
            if relation.kind().has_column() {
                let column = relation.column().ok_or_else(|| {
                    Error::Config(format!("{}.{} needs a column", type_name, property))
                })?;
                if SYSTEM_COLUMNS.contains(&column) || !seen_columns.insert(column.to_string()) {
                    return Err(Error::SchemaConflict(format!(
                        "{}.{} reuses column {}", type_name, property, column
                    )));
                }
                let ty = ty.unwrap_or(ColumnType::Text);
                if relation.kind() == RelationKind::Reference && relation.join_column().is_none() && ty != ColumnType::Text {
                    return Err(Error::SchemaConflict(format!(
                        "{}.{} references ids, which are text, not {}", type_name, property, ty
                    )));
                }
                columns.push(DbColumn::new(column, ty, Some(relation.clone()))?);
                property_columns.insert(property.clone(), columns.len() - 1);
                column_properties.insert(column.to_string(), property.clone());
            }

            property_order.push(property.clone());
            relations.insert(property, relation);
        }

        let parent = match self.parent {
            Some(property) => match relations.get(&property) {
                Some(rel) if rel.kind() == RelationKind::Reference => Some(rel.clone()),
                _ => {
                    return Err(Error::SchemaConflict(format!(
                        "parent {} of {} must be a reference property", property, type_name
                    )));
                }
            },
            None => None,
        };

        Ok(DbMapping {
            type_name,
            table: self.table,
            id_column: self.id_column,
            columns,
            property_columns,
            column_properties,
            relations,
            property_order,
            parent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_mapping() -> DbMapping {
        DbMapping::builder("user")
            .table("users")
            .scalar("name", "name", ColumnType::Text)
            .scalar("age", "age", ColumnType::Integer)
            .reference("team", "team_id", "team")
            .relation(
                Relation::collection("posts", "post", "author_id")
                    .with_order_by("created_at")
                    .with_filter("published = 1")
                    .with_target_table("posts", "id"),
            )
            .relation(Relation::virtual_collection("scratch"))
            .parent("team")
            .build()
            .unwrap()
    }

    #[test]
    fn test_lookups() {
        let mapping = user_mapping();

        assert_eq!(mapping.table(), Some("users"));
        assert_eq!(mapping.columns().len(), 4);
        assert_eq!(mapping.columns()[0].name(), "id");
        assert_eq!(mapping.column_for("age").unwrap().column_type(), ColumnType::Integer);
        assert!(mapping.column_for("posts").is_none());
        assert_eq!(mapping.relation_for("team").unwrap().kind(), RelationKind::Reference);
        assert_eq!(mapping.property_for_column("team_id"), Some("team"));
        assert_eq!(mapping.parent_relation().unwrap().property(), "team");
    }

    #[test]
    fn test_relations_keep_declaration_order() {
        let mapping = user_mapping();
        let names: Vec<_> = mapping.relations().map(|r| r.property().to_string()).collect();
        assert_eq!(names, vec!["name", "age", "team", "posts", "scratch"]);
    }

    #[test]
    fn test_collection_query_is_deterministic() {
        let mapping = user_mapping();
        let rel = mapping.relation_for("posts").unwrap();

        let a = mapping.collection_query(rel, "42").unwrap();
        let b = mapping.collection_query(rel, "42").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.target.table, "posts");
        assert_eq!(a.source, CollectionSource::Direct { join_column: "author_id".to_string() });
        assert_eq!(a.order_by.as_deref(), Some("created_at"));
        assert_eq!(a.filter.as_deref(), Some("published = 1"));
    }

    #[test]
    fn test_collection_query_rejects_scalars_and_virtuals() {
        let mapping = user_mapping();
        assert!(mapping.collection_query(mapping.relation_for("name").unwrap(), "1").is_err());
        assert!(mapping.collection_query(mapping.relation_for("scratch").unwrap(), "1").is_err());
    }

    #[test]
    fn test_duplicate_property_is_conflict() {
        let err = DbMapping::builder("user")
            .scalar("name", "name", ColumnType::Text)
            .scalar("name", "full_name", ColumnType::Text)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::SchemaConflict(_)));
    }

    #[test]
    fn test_shared_column_is_conflict() {
        let err = DbMapping::builder("user")
            .scalar("name", "name", ColumnType::Text)
            .scalar("nick", "name", ColumnType::Text)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::SchemaConflict(_)));

        let err = DbMapping::builder("user")
            .scalar("version", "_version", ColumnType::Integer)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::SchemaConflict(_)));
    }

    #[test]
    fn test_parent_must_be_reference() {
        let err = DbMapping::builder("user")
            .scalar("name", "name", ColumnType::Text)
            .parent("name")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::SchemaConflict(_)));
    }

    #[test]
    fn test_in_memory_type() {
        let mapping = DbMapping::builder("session").build().unwrap();
        assert!(!mapping.is_relational());
        assert_eq!(mapping.columns().len(), 1);
    }
}
