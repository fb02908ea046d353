//! SQLite storage implementation

use std::collections::BTreeMap;
use std::path::Path;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use crate::{Error, Result};
use crate::mapping::{CollectionQuery, DbMapping, SchemaRegistry, MODIFIED_COLUMN, VERSION_COLUMN};
use crate::value::{ColumnType, Value};
use super::{schema, RowOp, Store, StoredRow};

/// Largest id list bound into one `IN (...)` clause
const MAX_BATCH_PARAMS: usize = 500;

/// SQLite-backed store.
///
/// The connection is serialized behind a mutex; the node manager never
/// holds any of its own locks while calling in here.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open a database file (creates if doesn't exist)
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Create missing tables, join tables and indexes for `registry`
    pub fn ensure_schema(&self, registry: &SchemaRegistry) -> Result<()> {
        let conn = self.conn.lock();
        for stmt in schema::all_schema_statements(registry) {
            conn.execute(&stmt, [])?;
        }
        Ok(())
    }

    /// Run raw SQL (schema tweaks, fixtures)
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }

    /// Count rows of a table
    pub fn count_rows(&self, table: &str) -> Result<usize> {
        let count: i64 = self
            .conn
            .lock()
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // ========== Row Decoding ==========

    fn row_to_stored(mapping: &DbMapping, row: &rusqlite::Row) -> Result<StoredRow> {
        let id = match row.get_ref(0)? {
            ValueRef::Text(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            ValueRef::Integer(i) => i.to_string(),
            other => return Err(Error::StorageIO(format!("unexpected id value {:?}", other))),
        };
        let version: i64 = row.get(1)?;
        let created: i64 = row.get(2)?;
        let modified: i64 = row.get(3)?;

        let mut values = BTreeMap::new();
        for (offset, column) in mapping.columns().iter().skip(1).enumerate() {
            let value = decode(row.get_ref(4 + offset)?, column.column_type())?;
            if !value.is_null() {
                values.insert(column.name().to_string(), value);
            }
        }

        Ok(StoredRow {
            id,
            values,
            version: version.max(0) as u64,
            created: millis_to_datetime(created)?,
            modified: millis_to_datetime(modified)?,
        })
    }

    // ========== Flush Operations ==========

    fn apply_op(conn: &Connection, op: &RowOp) -> Result<()> {
        match op {
            RowOp::Insert { table, id_column, key, columns, created, modified } => {
                let mut names = vec![id_column.as_str(), VERSION_COLUMN, "_created", MODIFIED_COLUMN];
                let mut params = vec![
                    SqlValue::Text(key.id.clone()),
                    SqlValue::Integer(1),
                    SqlValue::Integer(created.timestamp_millis()),
                    SqlValue::Integer(modified.timestamp_millis()),
                ];
                for (name, value) in columns {
                    names.push(name);
                    params.push(encode(value));
                }
                let placeholders: Vec<String> = (1..=params.len()).map(|i| format!("?{}", i)).collect();
                let sql = format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    table,
                    names.join(", "),
                    placeholders.join(", ")
                );
                conn.execute(&sql, params_from_iter(params))?;
            }
            RowOp::Link { table, id_column, key, columns } => {
                if columns.is_empty() {
                    return Ok(());
                }
                let mut sets = Vec::new();
                let mut params = Vec::new();
                for (name, value) in columns {
                    params.push(encode(value));
                    sets.push(format!("{} = ?{}", name, params.len()));
                }
                params.push(SqlValue::Text(key.id.clone()));
                let sql = format!(
                    "UPDATE {} SET {} WHERE {} = ?{}",
                    table, sets.join(", "), id_column, params.len()
                );
                if conn.execute(&sql, params_from_iter(params))? == 0 {
                    return Err(Error::NotFound(key.to_string()));
                }
            }
            RowOp::Update { table, id_column, key, columns, expected_version, modified } => {
                let mut sets = Vec::new();
                let mut params = Vec::new();
                for (name, value) in columns {
                    params.push(encode(value));
                    sets.push(format!("{} = ?{}", name, params.len()));
                }
                params.push(SqlValue::Integer(*expected_version as i64 + 1));
                sets.push(format!("{} = ?{}", VERSION_COLUMN, params.len()));
                params.push(SqlValue::Integer(modified.timestamp_millis()));
                sets.push(format!("{} = ?{}", MODIFIED_COLUMN, params.len()));
                params.push(SqlValue::Text(key.id.clone()));
                let id_param = params.len();
                params.push(SqlValue::Integer(*expected_version as i64));
                let sql = format!(
                    "UPDATE {} SET {} WHERE {} = ?{} AND {} = ?{}",
                    table, sets.join(", "), id_column, id_param, VERSION_COLUMN, params.len()
                );
                if conn.execute(&sql, params_from_iter(params))? == 0 {
                    return Err(Error::ConcurrentModification(key.to_string()));
                }
            }
            RowOp::Delete { table, id_column, key, expected_version } => {
                let sql = format!(
                    "DELETE FROM {} WHERE {} = ?1 AND {} = ?2",
                    table, id_column, VERSION_COLUMN
                );
                let params = [SqlValue::Text(key.id.clone()), SqlValue::Integer(*expected_version as i64)];
                if conn.execute(&sql, params_from_iter(params))? == 0 {
                    return Err(Error::ConcurrentModification(key.to_string()));
                }
            }
            RowOp::AttachChild { join, parent, child } => {
                let sql = match &join.order_column {
                    Some(order) => format!(
                        "INSERT OR IGNORE INTO {jt} ({p}, {c}, {o}) \
                         VALUES (?1, ?2, (SELECT COALESCE(MAX({o}) + 1, 0) FROM {jt} WHERE {p} = ?1))",
                        jt = join.table, p = join.parent_column, c = join.child_column, o = order
                    ),
                    None => format!(
                        "INSERT OR IGNORE INTO {} ({}, {}) VALUES (?1, ?2)",
                        join.table, join.parent_column, join.child_column
                    ),
                };
                conn.execute(&sql, [parent, child])?;
            }
            RowOp::DetachChild { join, parent, child } => {
                let sql = format!(
                    "DELETE FROM {} WHERE {} = ?1 AND {} = ?2",
                    join.table, join.parent_column, join.child_column
                );
                conn.execute(&sql, [parent, child])?;
            }
        }
        Ok(())
    }
}

impl Store for SqliteStore {
    fn fetch_row(&self, mapping: &DbMapping, id: &str) -> Result<Option<StoredRow>> {
        let Some(table) = mapping.table() else {
            return Ok(None);
        };
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1",
            schema::select_columns(mapping),
            table,
            mapping.id_column()
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_stored(mapping, row)?)),
            None => Ok(None),
        }
    }

    fn fetch_rows(&self, mapping: &DbMapping, ids: &[String]) -> Result<Vec<StoredRow>> {
        let Some(table) = mapping.table() else {
            return Ok(Vec::new());
        };
        let conn = self.conn.lock();
        let mut result = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(MAX_BATCH_PARAMS) {
            let placeholders: Vec<String> = (1..=chunk.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT {} FROM {} WHERE {} IN ({})",
                schema::select_columns(mapping),
                table,
                mapping.id_column(),
                placeholders.join(", ")
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(chunk.iter()))?;
            while let Some(row) = rows.next()? {
                result.push(Self::row_to_stored(mapping, row)?);
            }
        }
        Ok(result)
    }

    fn fetch_ids(&self, query: &CollectionQuery) -> Result<Vec<String>> {
        let sql = schema::collection_sql(query);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map([&query.parent_id], |row| match row.get_ref(0)? {
                ValueRef::Integer(i) => Ok(i.to_string()),
                _ => row.get::<_, String>(0),
            })?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    fn lookup_id(&self, mapping: &DbMapping, column: &str, value: &Value) -> Result<Option<String>> {
        let Some(table) = mapping.table() else {
            return Ok(None);
        };
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1 ORDER BY rowid LIMIT 1",
            mapping.id_column(), table, column
        );
        self.conn
            .lock()
            .query_row(&sql, [encode(value)], |row| row.get::<_, String>(0))
            .optional()
            .map_err(Into::into)
    }

    fn apply(&self, ops: &[RowOp]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for op in ops {
            Self::apply_op(&tx, op)?;
        }
        tx.commit()?;
        Ok(())
    }
}

/// Convert a property value to its SQLite representation
fn encode(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Boolean(b) => SqlValue::Integer(i64::from(*b)),
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Float(x) => SqlValue::Real(*x),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Timestamp(ts) => SqlValue::Integer(ts.timestamp_millis()),
        Value::Reference(key) => SqlValue::Text(key.id.clone()),
    }
}

/// Decode a column value according to its declared storage type
fn decode(raw: ValueRef<'_>, ty: ColumnType) -> Result<Value> {
    let mismatch = |raw: &ValueRef<'_>| Error::StorageIO(format!("cannot read {:?} as {}", raw, ty));
    Ok(match (raw, ty) {
        (ValueRef::Null, _) => Value::Null,
        (ValueRef::Integer(i), ColumnType::Integer) => Value::Integer(i),
        (ValueRef::Integer(i), ColumnType::Float) => Value::Float(i as f64),
        (ValueRef::Integer(i), ColumnType::Boolean) => Value::Boolean(i != 0),
        (ValueRef::Integer(i), ColumnType::Timestamp) => Value::Timestamp(millis_to_datetime(i)?),
        (ValueRef::Integer(i), ColumnType::Text) => Value::Text(i.to_string()),
        (ValueRef::Real(x), ColumnType::Float) => Value::Float(x),
        (ValueRef::Text(bytes), ColumnType::Text) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        (other, _) => return Err(mismatch(&other)),
    })
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::StorageIO(format!("timestamp out of range: {}", ms)))
}
