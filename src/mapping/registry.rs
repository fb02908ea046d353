//! Schema registry - the immutable set of all type mappings

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};
use regex::Regex;
use crate::{Error, Result};
use crate::value::ColumnType;
use super::column::DbColumn;
use super::dbmapping::{DbMapping, DbMappingBuilder};
use super::relation::{Cardinality, Relation, RelationKind};

static IDENTIFIER: OnceLock<Regex> = OnceLock::new();

fn identifier() -> &'static Regex {
    IDENTIFIER.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"))
}

fn check_identifier(kind: &str, name: &str) -> Result<()> {
    if identifier().is_match(name) {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid {} name: {:?}", kind, name)))
    }
}

/// All mappings known to a node manager.
///
/// Built once and never mutated; a reload builds a new registry and swaps it
/// in as a whole.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    mappings: BTreeMap<String, Arc<DbMapping>>,
}

impl SchemaRegistry {
    /// A registry without any types (every node is purely in-memory)
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builder() -> SchemaRegistryBuilder {
        SchemaRegistryBuilder::default()
    }

    /// Mapping for `type_name`
    pub fn mapping(&self, type_name: &str) -> Option<&Arc<DbMapping>> {
        self.mappings.get(type_name)
    }

    /// Mappings sorted by type name
    pub fn mappings(&self) -> impl Iterator<Item = &Arc<DbMapping>> {
        self.mappings.values()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

/// Collects mapping builders and validates them as a whole.
#[derive(Debug, Default)]
pub struct SchemaRegistryBuilder {
    builders: Vec<DbMappingBuilder>,
}

impl SchemaRegistryBuilder {
    pub fn mapping(mut self, builder: DbMappingBuilder) -> Self {
        self.builders.push(builder);
        self
    }

    /// Build every mapping and check cross-type consistency.
    ///
    /// Fails with `SchemaConflict` when two declarations disagree on a
    /// storage type, and with `Config` for unknown targets or bad names.
    pub fn build(self) -> Result<SchemaRegistry> {
        let mut known: Vec<String> = Vec::with_capacity(self.builders.len());
        let mut targets = HashMap::new();
        for builder in &self.builders {
            let type_name = builder.type_name().to_string();
            if known.contains(&type_name) {
                return Err(Error::SchemaConflict(format!("type {} declared twice", type_name)));
            }
            if let Some(target) = builder.target_info() {
                targets.insert(type_name.clone(), target);
            }
            known.push(type_name);
        }

        let mut mappings = BTreeMap::new();
        for mut builder in self.builders {
            builder.resolve_targets(&targets);
            let mapping = builder.build()?;
            validate_names(&mapping)?;
            mappings.insert(mapping.type_name().to_string(), Arc::new(mapping));
        }

        for mapping in mappings.values() {
            for relation in mapping.relations() {
                validate_relation(mapping, relation, &mappings, &known)?;
            }
        }

        tracing::debug!(types = mappings.len(), "schema registry built");
        Ok(SchemaRegistry { mappings })
    }
}

fn validate_names(mapping: &DbMapping) -> Result<()> {
    if let Some(table) = mapping.table() {
        check_identifier("table", table)?;
    }
    for column in mapping.columns() {
        check_identifier("column", column.name())?;
    }
    for relation in mapping.relations() {
        if let Some(join) = relation.join_column() {
            check_identifier("join column", join)?;
        }
        if let Cardinality::ManyToMany(join) = relation.cardinality() {
            check_identifier("join table", &join.table)?;
            check_identifier("column", &join.parent_column)?;
            check_identifier("column", &join.child_column)?;
            if let Some(order) = &join.order_column {
                check_identifier("column", order)?;
            }
        }
    }
    Ok(())
}

/// Build the columns a relation touches on the far side so that their types
/// are checked against the relation's resolved type.
fn validate_relation(
    owner: &DbMapping,
    relation: &Arc<Relation>,
    mappings: &BTreeMap<String, Arc<DbMapping>>,
    known: &[String],
) -> Result<()> {
    let kind = relation.kind();
    if !matches!(kind, RelationKind::Reference | RelationKind::Collection) {
        return Ok(());
    }

    let target_type = relation.target_type().ok_or_else(|| {
        Error::Config(format!("{}.{} has no target type", owner.type_name(), relation.property()))
    })?;
    if !known.iter().any(|k| k == target_type) {
        return Err(Error::Config(format!(
            "{}.{} targets unknown type {}", owner.type_name(), relation.property(), target_type
        )));
    }
    let target = &mappings[target_type];

    match (kind, relation.cardinality()) {
        (RelationKind::Reference, _) => match relation.join_column() {
            Some(join) if join != target.id_column() => {
                let column = target.columns().iter().find(|c| c.name() == join).ok_or_else(|| {
                    Error::Config(format!(
                        "{}.{} joins on {}.{}, which does not exist",
                        owner.type_name(), relation.property(), target_type, join
                    ))
                })?;
                DbColumn::new(join, column.column_type(), Some(relation.clone()))?;
            }
            _ => {
                DbColumn::new(target.id_column(), ColumnType::Text, Some(relation.clone()))?;
            }
        },
        (RelationKind::Collection, Cardinality::OneToMany) => {
            let join = relation.join_column().ok_or_else(|| {
                Error::Config(format!("{}.{} has no join column", owner.type_name(), relation.property()))
            })?;
            DbColumn::new(join, ColumnType::Text, Some(relation.clone()))?;
            if let Some(column) = target.columns().iter().find(|c| c.name() == join) {
                DbColumn::new(join, column.column_type(), Some(relation.clone()))?;
            }
        }
        (RelationKind::Collection, Cardinality::ManyToMany(join)) => {
            DbColumn::new(join.child_column.clone(), ColumnType::Text, Some(relation.clone()))?;
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::JoinTable;

    fn blog() -> SchemaRegistryBuilder {
        SchemaRegistry::builder()
            .mapping(
                DbMapping::builder("user")
                    .table("users")
                    .scalar("name", "name", ColumnType::Text)
                    .relation(Relation::collection("posts", "post", "author_id").with_order_by("created_at")),
            )
            .mapping(
                DbMapping::builder("post")
                    .table("posts")
                    .scalar("title", "title", ColumnType::Text)
                    .scalar("createdAt", "created_at", ColumnType::Timestamp)
                    .reference("author", "author_id", "user")
                    .parent("author"),
            )
    }

    #[test]
    fn test_targets_are_resolved() {
        let registry = blog().build().unwrap();
        let user = registry.mapping("user").unwrap();
        let posts = user.relation_for("posts").unwrap();

        assert_eq!(posts.target_table().unwrap().table, "posts");
        assert_eq!(posts.column_type(), Some(ColumnType::Text));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_unknown_target() {
        let err = SchemaRegistry::builder()
            .mapping(DbMapping::builder("user").table("users").reference("team", "team_id", "team"))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_join_column_type_conflict() {
        let err = SchemaRegistry::builder()
            .mapping(
                DbMapping::builder("user")
                    .table("users")
                    .relation(Relation::collection("posts", "post", "author_id")),
            )
            .mapping(
                DbMapping::builder("post")
                    .table("posts")
                    .scalar("authorNumber", "author_id", ColumnType::Integer),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::SchemaConflict(_)));
    }

    #[test]
    fn test_invalid_identifier() {
        let err = SchemaRegistry::builder()
            .mapping(DbMapping::builder("user").table("users; DROP TABLE x"))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_many_to_many() {
        let registry = SchemaRegistry::builder()
            .mapping(DbMapping::builder("tag").table("tags").scalar("label", "label", ColumnType::Text))
            .mapping(
                DbMapping::builder("post").table("posts").relation(Relation::many_to_many(
                    "tags",
                    "tag",
                    JoinTable {
                        table: "post_tags".to_string(),
                        parent_column: "post_id".to_string(),
                        child_column: "tag_id".to_string(),
                        order_column: Some("position".to_string()),
                    },
                )),
            )
            .build()
            .unwrap();

        let tags = registry.mapping("post").unwrap().relation_for("tags").unwrap();
        assert_eq!(tags.target_table().unwrap().table, "tags");
    }

    #[test]
    fn test_duplicate_type() {
        let err = SchemaRegistry::builder()
            .mapping(DbMapping::builder("user"))
            .mapping(DbMapping::builder("user"))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::SchemaConflict(_)));
    }
}
