//! # Nodestore - Object/relational persistence core
//!
//! Backs a hierarchical, dynamically-typed object graph with relational storage.
//!
//! Nodestore provides:
//! - Immutable schema descriptors (`DbMapping`, `Relation`, `DbColumn`)
//! - A sharded node cache with single-flight loading and paged collections
//! - A per-thread unit of work (`Transactor`) with optimistic commit/abort
//! - A pluggable `Store` with a SQLite reference implementation

pub mod key;
pub mod value;
pub mod mapping;
pub mod node;
pub mod manager;
pub mod transactor;
pub mod storage;
pub mod config;
pub mod ui;

// Re-exports for convenient access
pub use key::NodeKey;
pub use value::{ColumnType, Value};
pub use mapping::{Cardinality, DbColumn, DbMapping, Relation, RelationKind, SchemaRegistry};
pub use node::{Node, NodeState};
pub use manager::{CacheConfig, CacheStats, Children, NodeManager};
pub use transactor::{Transactor, TransactorState};
pub use storage::{SqliteStore, Store};

/// Result type alias for Nodestore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Nodestore operations
///
/// Every variant carries plain data so that one failed load can be handed to
/// every thread waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Node not found: {0}")]
    NotFound(String),

    #[error("Schema conflict: {0}")]
    SchemaConflict(String),

    #[error("Concurrent modification of {0}")]
    ConcurrentModification(String),

    #[error("Cache entry busy: {0}")]
    CacheBusy(String),

    #[error("Storage error: {0}")]
    StorageIO(String),

    #[error("A transaction is already active on this transactor")]
    TransactionAlreadyActive,

    #[error("No active transaction")]
    NoActiveTransaction,

    #[error("Invalid node key: {0}")]
    InvalidKey(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::StorageIO(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::StorageIO(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}
