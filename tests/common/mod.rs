#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use nodestore::mapping::{CollectionQuery, JoinTable, SchemaRegistryBuilder};
use nodestore::storage::{RowOp, StoredRow};
use nodestore::{
    CacheConfig, ColumnType, DbMapping, NodeManager, Relation, Result, SchemaRegistry, SqliteStore, Store, Value,
};

/// users ←author― posts ―tags→ tags, plus self-referencing people
pub fn blog_schema() -> SchemaRegistryBuilder {
    SchemaRegistry::builder()
        .mapping(
            DbMapping::builder("user")
                .table("users")
                .scalar("name", "name", ColumnType::Text)
                .scalar("email", "email", ColumnType::Text)
                .relation(Relation::collection("posts", "post", "author_id").with_order_by("created_at")),
        )
        .mapping(
            DbMapping::builder("post")
                .table("posts")
                .scalar("title", "title", ColumnType::Text)
                .scalar("createdAt", "created_at", ColumnType::Timestamp)
                .reference("author", "author_id", "user")
                .relation(Relation::many_to_many(
                    "tags",
                    "tag",
                    JoinTable {
                        table: "post_tags".to_string(),
                        parent_column: "post_id".to_string(),
                        child_column: "tag_id".to_string(),
                        order_column: Some("position".to_string()),
                    },
                ))
                .parent("author"),
        )
        .mapping(
            DbMapping::builder("tag")
                .table("tags")
                .scalar("label", "label", ColumnType::Text),
        )
        .mapping(
            DbMapping::builder("person")
                .table("people")
                .scalar("name", "name", ColumnType::Text)
                .reference("partner", "partner_id", "person"),
        )
}

pub fn open_store() -> Arc<SqliteStore> {
    let store = SqliteStore::open_in_memory().unwrap();
    store.ensure_schema(&blog_schema().build().unwrap()).unwrap();
    Arc::new(store)
}

pub fn manager(store: Arc<SqliteStore>) -> NodeManager {
    manager_with(store, CacheConfig::default())
}

pub fn manager_with(store: Arc<SqliteStore>, config: CacheConfig) -> NodeManager {
    NodeManager::new(blog_schema().build().unwrap(), store, config)
}

/// Commit `user/<id>` with a name through a throwaway manager
pub fn seed_user(store: &Arc<SqliteStore>, id: &str, name: &str) {
    let manager = manager(store.clone());
    let tx = manager.current_transactor();
    tx.run(|| {
        let user = manager.create_node_with_id("user", id)?;
        user.set("name", name)
    })
    .unwrap();
}

/// Store wrapper that slows down and counts single-row loads
pub struct SlowStore {
    inner: Arc<SqliteStore>,
    delay: Duration,
    pub fetches: AtomicUsize,
}

impl SlowStore {
    pub fn new(inner: Arc<SqliteStore>, delay: Duration) -> Self {
        Self { inner, delay, fetches: AtomicUsize::new(0) }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl Store for SlowStore {
    fn fetch_row(&self, mapping: &DbMapping, id: &str) -> Result<Option<StoredRow>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.inner.fetch_row(mapping, id)
    }

    fn fetch_rows(&self, mapping: &DbMapping, ids: &[String]) -> Result<Vec<StoredRow>> {
        self.inner.fetch_rows(mapping, ids)
    }

    fn fetch_ids(&self, query: &CollectionQuery) -> Result<Vec<String>> {
        self.inner.fetch_ids(query)
    }

    fn lookup_id(&self, mapping: &DbMapping, column: &str, value: &Value) -> Result<Option<String>> {
        self.inner.lookup_id(mapping, column, value)
    }

    fn apply(&self, ops: &[RowOp]) -> Result<()> {
        self.inner.apply(ops)
    }
}
