//! Storage Layer - pluggable relational persistence
//!
//! The node manager talks to storage only through the `Store` trait:
//! - row loads by id, singly or in batches
//! - ordered child-id queries for collections
//! - an atomic `apply` of a whole flush plan
//!
//! `SqliteStore` is the reference implementation. Each relational type gets
//! a table `(<id>, _version, _created, _modified, <columns>...)`.

pub mod schema;
pub mod sqlite;

pub use sqlite::SqliteStore;

use std::collections::BTreeMap;
use chrono::{DateTime, Utc};
use crate::Result;
use crate::key::NodeKey;
use crate::mapping::{CollectionQuery, DbMapping, JoinTable};
use crate::value::Value;

/// One row of a type's primary table, decoded by column type.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub id: String,
    /// Column name → value; absent columns were NULL
    pub values: BTreeMap<String, Value>,
    pub version: u64,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

/// One step of a flush plan.
///
/// Every op that carries an `expected_version` is guarded: if the stored
/// version differs, `apply` fails with `ConcurrentModification` and nothing
/// from the plan is kept.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOp {
    /// Insert a new row at version 1
    Insert {
        key: NodeKey,
        table: String,
        id_column: String,
        columns: Vec<(String, Value)>,
        created: DateTime<Utc>,
        modified: DateTime<Utc>,
    },
    /// Fill reference columns of a row inserted earlier in the same plan
    Link {
        key: NodeKey,
        table: String,
        id_column: String,
        columns: Vec<(String, Value)>,
    },
    /// Update columns and move the row from `expected_version` to the next version
    Update {
        key: NodeKey,
        table: String,
        id_column: String,
        columns: Vec<(String, Value)>,
        expected_version: u64,
        modified: DateTime<Utc>,
    },
    /// Delete the row at `expected_version`
    Delete {
        key: NodeKey,
        table: String,
        id_column: String,
        expected_version: u64,
    },
    /// Add a (parent, child) pair to a join table
    AttachChild {
        join: JoinTable,
        parent: String,
        child: String,
    },
    /// Remove a (parent, child) pair from a join table
    DetachChild {
        join: JoinTable,
        parent: String,
        child: String,
    },
}

impl RowOp {
    /// Short label for logging
    pub fn label(&self) -> &'static str {
        match self {
            RowOp::Insert { .. } => "insert",
            RowOp::Link { .. } => "link",
            RowOp::Update { .. } => "update",
            RowOp::Delete { .. } => "delete",
            RowOp::AttachChild { .. } => "attach",
            RowOp::DetachChild { .. } => "detach",
        }
    }

    /// Node the op writes, if it targets a primary table
    pub fn key(&self) -> Option<&NodeKey> {
        match self {
            RowOp::Insert { key, .. }
            | RowOp::Link { key, .. }
            | RowOp::Update { key, .. }
            | RowOp::Delete { key, .. } => Some(key),
            RowOp::AttachChild { .. } | RowOp::DetachChild { .. } => None,
        }
    }
}

/// Relational backend used by the node manager.
///
/// Implementations must be safe to call from many worker threads at once.
pub trait Store: Send + Sync {
    /// Load one row of `mapping`'s table
    fn fetch_row(&self, mapping: &DbMapping, id: &str) -> Result<Option<StoredRow>>;

    /// Load several rows of `mapping`'s table; missing ids are skipped and
    /// the result order is unspecified
    fn fetch_rows(&self, mapping: &DbMapping, ids: &[String]) -> Result<Vec<StoredRow>>;

    /// Ordered child ids of a collection
    fn fetch_ids(&self, query: &CollectionQuery) -> Result<Vec<String>>;

    /// Id of the row of `mapping` whose `column` equals `value`
    fn lookup_id(&self, mapping: &DbMapping, column: &str, value: &Value) -> Result<Option<String>>;

    /// Apply a flush plan atomically, in order
    fn apply(&self, ops: &[RowOp]) -> Result<()>;
}
