//! Database schema definitions and SQL text for mapped types

use std::collections::BTreeMap;
use crate::mapping::{
    Cardinality, CollectionQuery, CollectionSource, DbMapping, JoinTable, RelationKind, SchemaRegistry,
    CREATED_COLUMN, MODIFIED_COLUMN, VERSION_COLUMN,
};
use crate::value::ColumnType;

/// SQL to create the primary table of `mapping`, plus any join columns other
/// types expect to find in it. `None` for in-memory types.
pub fn create_table_sql(mapping: &DbMapping, extra_columns: &[String]) -> Option<String> {
    let table = mapping.table()?;
    let mut defs = vec![
        format!("{} TEXT PRIMARY KEY", mapping.id_column()),
        format!("{} INTEGER NOT NULL DEFAULT 1", VERSION_COLUMN),
        format!("{} INTEGER NOT NULL", CREATED_COLUMN),
        format!("{} INTEGER NOT NULL", MODIFIED_COLUMN),
    ];
    for column in mapping.columns().iter().skip(1) {
        defs.push(format!("{} {}", column.name(), column.column_type().sql_type()));
    }
    for extra in extra_columns {
        if mapping.columns().iter().all(|c| c.name() != extra) {
            defs.push(format!("{} {}", extra, ColumnType::Text.sql_type()));
        }
    }
    Some(format!("CREATE TABLE IF NOT EXISTS {} (\n    {}\n)", table, defs.join(",\n    ")))
}

/// SQL to create a many-to-many join table
pub fn create_join_table_sql(join: &JoinTable) -> String {
    let mut defs = vec![
        format!("{} TEXT NOT NULL", join.parent_column),
        format!("{} TEXT NOT NULL", join.child_column),
    ];
    if let Some(order) = &join.order_column {
        defs.push(format!("{} INTEGER", order));
    }
    defs.push(format!("UNIQUE({}, {})", join.parent_column, join.child_column));
    format!("CREATE TABLE IF NOT EXISTS {} (\n    {}\n)", join.table, defs.join(",\n    "))
}

/// All schema creation statements for a registry: tables, join tables and
/// indexes on collection join columns
pub fn all_schema_statements(registry: &SchemaRegistry) -> Vec<String> {
    // table → join columns other types look up children by
    let mut join_columns: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut join_tables: BTreeMap<String, JoinTable> = BTreeMap::new();

    for mapping in registry.mappings() {
        for relation in mapping.relations() {
            if relation.kind() != RelationKind::Collection {
                continue;
            }
            match (relation.cardinality(), relation.target_table(), relation.join_column()) {
                (Cardinality::OneToMany, Some(target), Some(join)) => {
                    let cols = join_columns.entry(target.table.clone()).or_default();
                    if !cols.iter().any(|c| c == join) {
                        cols.push(join.to_string());
                    }
                }
                (Cardinality::ManyToMany(join), _, _) => {
                    join_tables.entry(join.table.clone()).or_insert_with(|| join.clone());
                }
                _ => {}
            }
        }
    }

    let mut stmts = Vec::new();
    for mapping in registry.mappings() {
        let Some(table) = mapping.table() else { continue };
        let extra = join_columns.get(table).cloned().unwrap_or_default();
        if let Some(sql) = create_table_sql(mapping, &extra) {
            stmts.push(sql);
        }
    }
    for join in join_tables.values() {
        stmts.push(create_join_table_sql(join));
        stmts.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{}_{} ON {}({})",
            join.table, join.parent_column, join.table, join.parent_column
        ));
    }
    for (table, cols) in &join_columns {
        for col in cols {
            stmts.push(format!("CREATE INDEX IF NOT EXISTS idx_{}_{} ON {}({})", table, col, table, col));
        }
    }
    stmts
}

/// Column list of a primary-table select: id, bookkeeping columns, then the
/// mapped columns in declaration order
pub fn select_columns(mapping: &DbMapping) -> String {
    let mut cols = vec![
        mapping.id_column().to_string(),
        VERSION_COLUMN.to_string(),
        CREATED_COLUMN.to_string(),
        MODIFIED_COLUMN.to_string(),
    ];
    cols.extend(mapping.columns().iter().skip(1).map(|c| c.name().to_string()));
    cols.join(", ")
}

/// SQL returning the ordered child ids of a collection; `?1` is the parent id
pub fn collection_sql(query: &CollectionQuery) -> String {
    let target = &query.target;
    match &query.source {
        CollectionSource::Direct { join_column } => {
            let mut sql = format!(
                "SELECT t.{id} FROM {table} t WHERE t.{join} = ?1",
                id = target.id_column,
                table = target.table,
                join = join_column
            );
            if let Some(filter) = &query.filter {
                sql.push_str(&format!(" AND ({})", filter));
            }
            let mut order = Vec::new();
            if let Some(order_by) = &query.order_by {
                order.push(order_by.clone());
            }
            order.push("t.rowid".to_string());
            sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
            sql
        }
        CollectionSource::Joined(join) => {
            let mut sql = format!(
                "SELECT j.{child} FROM {jt} j JOIN {table} t ON t.{id} = j.{child} WHERE j.{parent} = ?1",
                child = join.child_column,
                jt = join.table,
                table = target.table,
                id = target.id_column,
                parent = join.parent_column
            );
            if let Some(filter) = &query.filter {
                sql.push_str(&format!(" AND ({})", filter));
            }
            let mut order = Vec::new();
            if let Some(order_by) = &query.order_by {
                order.push(order_by.clone());
            }
            if let Some(position) = &join.order_column {
                order.push(format!("j.{}", position));
            }
            order.push("j.rowid".to_string());
            sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
            sql
        }
    }
}
