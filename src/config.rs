//! TOML configuration: database location, cache sizing and the type schema

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use serde::{Deserialize, Serialize};
use crate::{Error, Result};
use crate::manager::CacheConfig;
use crate::mapping::{DbMapping, DbMappingBuilder, JoinTable, Relation, RelationKind, SchemaRegistry, SchemaRegistryBuilder};
use crate::value::ColumnType;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct NodestoreConfig {
    pub database: Option<String>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub types: BTreeMap<String, TypeConfig>,
}

/// `[types.<name>]`
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TypeConfig {
    /// Primary table; omit for in-memory types
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_column: Option<String>,
    /// Reference property naming the hierarchical parent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyConfig>,
}

/// `[types.<name>.properties.<property>]`
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PropertyConfig {
    /// scalar (default), reference, collection or virtual
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub column_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_column: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_table: Option<JoinTable>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub eager: bool,
}

impl PropertyConfig {
    fn relation(&self, owner: &str, property: &str) -> Result<(Relation, Option<ColumnType>)> {
        let kind = match &self.kind {
            Some(kind) => RelationKind::from_str(kind)?,
            None => RelationKind::Scalar,
        };
        let column_type = self.column_type.as_deref().map(ColumnType::from_str).transpose()?;
        let target = || {
            self.target.clone().ok_or_else(|| {
                Error::Config(format!("{}.{} is a {} and needs a target", owner, property, kind))
            })
        };

        let (relation, ty) = match kind {
            RelationKind::Scalar => {
                let column = self.column.clone().unwrap_or_else(|| property.to_string());
                (Relation::scalar(property, column), Some(column_type.unwrap_or(ColumnType::Text)))
            }
            RelationKind::Reference => {
                let column = self.column.clone().unwrap_or_else(|| format!("{}_id", property));
                let mut relation = Relation::reference(property, column, target()?);
                if let Some(join) = &self.join_column {
                    relation = relation.with_join_column(join.clone());
                }
                (relation, Some(column_type.unwrap_or(ColumnType::Text)))
            }
            RelationKind::Collection => {
                let relation = match (&self.join_table, &self.join_column) {
                    (Some(join), _) => Relation::many_to_many(property, target()?, join.clone()),
                    (None, Some(join)) => Relation::collection(property, target()?, join.clone()),
                    (None, None) => {
                        return Err(Error::Config(format!(
                            "{}.{} needs a join_column or a join_table", owner, property
                        )));
                    }
                };
                (relation, None)
            }
            RelationKind::Virtual => (Relation::virtual_collection(property), None),
        };

        let mut relation = relation.eager(self.eager);
        if let Some(filter) = &self.filter {
            relation = relation.with_filter(filter.clone());
        }
        if let Some(order_by) = &self.order_by {
            relation = relation.with_order_by(order_by.clone());
        }
        Ok((relation, ty))
    }
}

impl TypeConfig {
    fn mapping(&self, type_name: &str) -> Result<DbMappingBuilder> {
        let mut builder = DbMapping::builder(type_name);
        if let Some(table) = &self.table {
            builder = builder.table(table.clone());
        }
        if let Some(id_column) = &self.id_column {
            builder = builder.id_column(id_column.clone());
        }
        for (property, config) in &self.properties {
            builder = match config.relation(type_name, property)? {
                (relation, Some(ty)) => builder.relation_typed(relation, ty),
                (relation, None) => builder.relation(relation),
            };
        }
        if let Some(parent) = &self.parent {
            builder = builder.parent(parent.clone());
        }
        Ok(builder)
    }
}

impl NodestoreConfig {
    /// Parse a configuration document
    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Schema builder for every `[types.*]` section
    pub fn schema_builder(&self) -> Result<SchemaRegistryBuilder> {
        let mut builder = SchemaRegistry::builder();
        for (type_name, config) in &self.types {
            builder = builder.mapping(config.mapping(type_name)?);
        }
        Ok(builder)
    }

    /// Build and validate the schema
    pub fn registry(&self) -> Result<SchemaRegistry> {
        self.schema_builder()?.build()
    }

    /// Starter configuration written by `nodestore init`
    pub fn example() -> Self {
        let mut user = TypeConfig { table: Some("users".to_string()), ..Default::default() };
        user.properties.insert("name".to_string(), PropertyConfig::default());
        user.properties.insert(
            "posts".to_string(),
            PropertyConfig {
                kind: Some("collection".to_string()),
                target: Some("post".to_string()),
                join_column: Some("author_id".to_string()),
                order_by: Some("created_at".to_string()),
                ..Default::default()
            },
        );

        let mut post = TypeConfig {
            table: Some("posts".to_string()),
            parent: Some("author".to_string()),
            ..Default::default()
        };
        post.properties.insert("title".to_string(), PropertyConfig::default());
        post.properties.insert(
            "createdAt".to_string(),
            PropertyConfig {
                column: Some("created_at".to_string()),
                column_type: Some("timestamp".to_string()),
                ..Default::default()
            },
        );
        post.properties.insert(
            "author".to_string(),
            PropertyConfig {
                kind: Some("reference".to_string()),
                target: Some("user".to_string()),
                ..Default::default()
            },
        );

        let mut types = BTreeMap::new();
        types.insert("user".to_string(), user);
        types.insert("post".to_string(), post);
        Self {
            database: Some(".nodestore/nodestore.db".to_string()),
            cache: CacheConfig::default(),
            types,
        }
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("nodestore.toml")
}

pub fn default_database_path_in(base: &Path) -> PathBuf {
    base.join(".nodestore").join("nodestore.db")
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Option<NodestoreConfig>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let config = NodestoreConfig::parse(&contents)?;
    Ok(Some(config))
}

pub fn write_config(path: &Path, config: &NodestoreConfig, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("config already exists at {} (use --force to overwrite)", path.display());
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

pub fn ensure_db_dir(db_path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
