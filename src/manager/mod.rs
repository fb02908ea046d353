//! Node manager - the single authority mapping keys to live nodes
//!
//! The manager owns the node cache and the current schema:
//! - misses load through the type's mapping, one load per key at a time
//! - collections resolve to lazy `Children` sequences hydrated in batches
//! - schema reloads swap the whole registry; cached nodes keep the mapping
//!   they were loaded with

pub(crate) mod cache;
pub mod children;

pub use children::{ChildIter, Children};

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use crate::{Error, Result};
use crate::key::NodeKey;
use crate::mapping::{DbMapping, RelationKind, SchemaRegistry, SchemaRegistryBuilder};
use crate::node::{Lifecycle, Node, NodeState};
use crate::storage::{Store, StoredRow};
use crate::transactor::{self, Transactor};
use crate::value::Value;
use cache::{Lookup, NodeCache};

static NEXT_MANAGER: AtomicU64 = AtomicU64::new(1);

/// Cache sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Target number of cached nodes; pinned nodes may exceed it
    pub capacity: usize,
    /// Number of independently locked shards
    pub shards: usize,
    /// Nodes hydrated per store round-trip when iterating collections
    pub batch_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            shards: 16,
            batch_size: 100,
        }
    }
}

impl CacheConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// Cache counters since the manager was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Single-row loads issued to the store
    pub loads: u64,
    /// Batched row loads issued while hydrating collections
    pub batch_loads: u64,
    pub evictions: u64,
    pub entries: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    batch_loads: AtomicU64,
    evictions: AtomicU64,
}

/// State shared by a manager, its nodes and its transactors
pub(crate) struct Shared {
    id: u64,
    schema: RwLock<Arc<SchemaRegistry>>,
    store: Arc<dyn Store>,
    cache: NodeCache,
    config: CacheConfig,
    counters: Counters,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared").field("id", &self.id).field("config", &self.config).finish()
    }
}

impl Shared {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub(crate) fn cache(&self) -> &NodeCache {
        &self.cache
    }

    pub(crate) fn batch_size(&self) -> usize {
        self.config.batch_size.max(1)
    }

    pub(crate) fn schema(&self) -> Arc<SchemaRegistry> {
        self.schema.read().clone()
    }

    /// Mapping of `type_name`; unknown types get an in-memory mapping
    pub(crate) fn mapping_for(&self, type_name: &str) -> Result<Arc<DbMapping>> {
        if let Some(mapping) = self.schema.read().mapping(type_name) {
            return Ok(mapping.clone());
        }
        Ok(Arc::new(DbMapping::builder(type_name).build()?))
    }

    fn evicted(&self, count: usize) {
        if count > 0 {
            self.counters.evictions.fetch_add(count as u64, Ordering::Relaxed);
            tracing::debug!(count, "reclaimed clean entries");
        }
    }

    pub(crate) fn get_node(self: &Arc<Self>, key: &NodeKey) -> Result<Arc<Node>> {
        let mapping = self.mapping_for(&key.type_name)?;
        self.get_node_with(key, &mapping)
    }

    pub(crate) fn get_node_with(self: &Arc<Self>, key: &NodeKey, mapping: &Arc<DbMapping>) -> Result<Arc<Node>> {
        let node = match self.cache.lookup_or_claim(key) {
            Lookup::Hit(node) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%key, "cache hit");
                node
            }
            Lookup::Follower(pending) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%key, "waiting for load in flight");
                pending.wait()?
            }
            Lookup::Leader(pending) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                let loaded = self.load(key, mapping);
                let (outcome, evicted) = self.cache.complete(key, &pending, loaded);
                self.evicted(evicted);
                let node = outcome?;
                self.prefetch(&node)?;
                node
            }
        };

        if let Some(tx) = transactor::active(self.id) {
            tx.note_read(key, node.version());
        }
        Ok(node)
    }

    fn load(self: &Arc<Self>, key: &NodeKey, mapping: &Arc<DbMapping>) -> Result<Arc<Node>> {
        if !mapping.is_relational() {
            return Err(Error::NotFound(key.to_string()));
        }
        self.counters.loads.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%key, "loading");
        let row = self
            .store
            .fetch_row(mapping, &key.id)?
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        self.build(mapping, row)
    }

    /// Turn a stored row into a Clean node (not yet cached)
    fn build(self: &Arc<Self>, mapping: &Arc<DbMapping>, row: StoredRow) -> Result<Arc<Node>> {
        let mut props = BTreeMap::new();
        for column in mapping.columns().iter().skip(1) {
            let Some(value) = row.values.get(column.name()) else { continue };
            let Some(property) = mapping.property_for_column(column.name()) else { continue };
            let value = match mapping.relation_for(property) {
                Some(rel) if rel.kind() == RelationKind::Reference => self.resolve_reference(rel, value)?,
                _ => value.clone(),
            };
            if !value.is_null() {
                props.insert(property.to_string(), value);
            }
        }

        Ok(Node::new(
            NodeKey::new(mapping.type_name(), row.id),
            mapping.clone(),
            self,
            Lifecycle::Persistent,
            props,
            row.version,
            row.created,
            row.modified,
        ))
    }

    /// Stored reference column → target key
    fn resolve_reference(&self, relation: &crate::mapping::Relation, stored: &Value) -> Result<Value> {
        let Some(target_type) = relation.target_type() else {
            return Ok(Value::Null);
        };
        let by_id = match (relation.join_column(), relation.target_table()) {
            (None, _) => true,
            (Some(join), Some(target)) => join == target.id_column,
            (Some(_), None) => false,
        };
        if by_id {
            let id = match stored {
                Value::Text(id) => id.clone(),
                other => other.to_string(),
            };
            return Ok(Value::Reference(NodeKey::new(target_type, id)));
        }

        let target = self.mapping_for(target_type)?;
        let join = relation.join_column().unwrap_or_default();
        match self.store.lookup_id(&target, join, stored)? {
            Some(id) => Ok(Value::Reference(NodeKey::new(target_type, id))),
            None => {
                tracing::debug!(target = target_type, value = %stored, "dangling reference");
                Ok(Value::Null)
            }
        }
    }

    /// Load eager relations of a freshly loaded node
    fn prefetch(self: &Arc<Self>, node: &Arc<Node>) -> Result<()> {
        for relation in node.mapping().relations() {
            if !relation.is_eager() {
                continue;
            }
            match relation.kind() {
                RelationKind::Reference => match node.reference(relation.property()) {
                    Ok(_) | Err(Error::NotFound(_)) => {}
                    Err(err) => return Err(err),
                },
                RelationKind::Collection => {
                    let children = Children::stored(self.clone(), node.key().clone(), node.mapping(), relation.clone())?;
                    for child in children.iter().take(self.batch_size()) {
                        child?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Load the rows behind `keys` that are not cached, in one store call.
    /// Keys without a row are skipped; order follows `keys`.
    pub(crate) fn hydrate_batch(self: &Arc<Self>, mapping: &Arc<DbMapping>, keys: &[NodeKey]) -> Result<Vec<Arc<Node>>> {
        let mut found: HashMap<&NodeKey, Arc<Node>> = HashMap::with_capacity(keys.len());
        let mut missing = Vec::new();
        for key in keys {
            match self.cache.get(key) {
                Some(node) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    found.insert(key, node);
                }
                None => {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    missing.push(key.id.clone());
                }
            }
        }

        if !missing.is_empty() {
            self.counters.batch_loads.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(type_name = mapping.type_name(), rows = missing.len(), "hydrating batch");
            let mut loaded = HashMap::with_capacity(missing.len());
            for row in self.store.fetch_rows(mapping, &missing)? {
                let node = self.build(mapping, row)?;
                let (node, evicted) = self.cache.insert_if_absent(node);
                self.evicted(evicted);
                loaded.insert(node.key().clone(), node);
            }
            for key in keys {
                if let Some(node) = loaded.get(key) {
                    found.insert(key, node.clone());
                }
            }
        }

        let active = transactor::active(self.id);
        let mut nodes = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(node) = found.get(key) {
                if let Some(tx) = &active {
                    tx.note_read(key, node.version());
                }
                nodes.push(node.clone());
            }
        }
        Ok(nodes)
    }

    /// Turn a transient node into a New one owned by the active transaction
    pub(crate) fn persist(self: &Arc<Self>, node: &Arc<Node>) -> Result<()> {
        if node.manager_id() != self.id {
            return Err(Error::InvalidValue(format!("{} belongs to another node manager", node.key())));
        }
        let tx = transactor::active(self.id).ok_or(Error::NoActiveTransaction)?;
        {
            let mut inner = node.inner.lock();
            if inner.state() != NodeState::Transient {
                return Ok(());
            }
            let now = Utc::now();
            inner.lifecycle = Lifecycle::New(tx.id());
            inner.created = now;
            inner.modified = now;
        }

        let evicted = match self.cache.insert_new(node.clone()) {
            Ok(evicted) => evicted,
            Err(err) => {
                node.inner.lock().lifecycle = Lifecycle::Transient;
                return Err(err);
            }
        };
        self.evicted(evicted);
        tx.track(node)?;
        tracing::debug!(key = %node.key(), "persisted");
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            loads: self.counters.loads.load(Ordering::Relaxed),
            batch_loads: self.counters.batch_loads.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            entries: self.cache.len(),
        }
    }
}

/// Process-wide cache of live nodes.
///
/// Cheap to clone; clones share the cache, schema and store.
#[derive(Clone, Debug)]
pub struct NodeManager {
    shared: Arc<Shared>,
}

impl NodeManager {
    pub fn new(registry: SchemaRegistry, store: Arc<dyn Store>, config: CacheConfig) -> Self {
        let id = NEXT_MANAGER.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            manager = id, types = registry.len(),
            capacity = config.capacity, shards = config.shards, "node manager created"
        );
        Self {
            shared: Arc::new(Shared {
                id,
                schema: RwLock::new(Arc::new(registry)),
                store,
                cache: NodeCache::new(config.capacity, config.shards),
                config,
                counters: Counters::default(),
            }),
        }
    }

    /// Current schema
    pub fn schema(&self) -> Arc<SchemaRegistry> {
        self.shared.schema()
    }

    /// Mapping of a declared type
    pub fn mapping(&self, type_name: &str) -> Option<Arc<DbMapping>> {
        self.shared.schema.read().mapping(type_name).cloned()
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.shared.store.clone()
    }

    pub fn config(&self) -> CacheConfig {
        self.shared.config
    }

    /// Cached node for `key`, loading it on a miss.
    ///
    /// Concurrent misses for one key share a single load.
    pub fn get_node(&self, key: &NodeKey) -> Result<Arc<Node>> {
        self.shared.get_node(key)
    }

    /// Like `get_node`, loading through an explicit mapping
    pub fn get_node_in(&self, id: &str, mapping: &Arc<DbMapping>) -> Result<Arc<Node>> {
        self.shared.get_node_with(&NodeKey::new(mapping.type_name(), id), mapping)
    }

    /// Cached node without loading or touching recency
    pub fn cached(&self, key: &NodeKey) -> Option<Arc<Node>> {
        self.shared.cache.peek(key)
    }

    /// Children of `parent_key` through a collection or virtual relation
    pub fn get_nodes(&self, parent_key: &NodeKey, relation: &str) -> Result<Children> {
        let mapping = self.shared.mapping_for(&parent_key.type_name)?;
        let rel = mapping.relation_for(relation).cloned().ok_or_else(|| {
            Error::InvalidValue(format!("{} has no relation {}", parent_key.type_name, relation))
        })?;
        match rel.kind() {
            RelationKind::Collection => Children::stored(self.shared.clone(), parent_key.clone(), &mapping, rel),
            RelationKind::Virtual => {
                let parent = self.get_node(parent_key)?;
                let nodes = parent.virtual_members(relation);
                Ok(Children::in_memory(self.shared.clone(), parent_key.clone(), rel, nodes))
            }
            kind => Err(Error::InvalidValue(format!(
                "{}.{} is a {} relation, not a collection", parent_key.type_name, relation, kind
            ))),
        }
    }

    /// Add `node` to `tx`'s write-set (idempotent)
    pub fn register_dirty(&self, node: &Arc<Node>, tx: &Transactor) -> Result<()> {
        tx.register_change(node)
    }

    /// Drop a Clean entry from the cache.
    ///
    /// `Ok(false)` if nothing was cached, `CacheBusy` if the entry holds
    /// uncommitted state.
    pub fn evict(&self, key: &NodeKey) -> Result<bool> {
        match self.shared.cache.evict(key) {
            Ok(true) => {
                self.shared.counters.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%key, "evicted");
                Ok(true)
            }
            Err(err) => {
                tracing::warn!(%key, error = %err, "eviction refused");
                Err(err)
            }
            other => other,
        }
    }

    /// Create a New node with a generated id in the active transaction
    pub fn create_node(&self, type_name: &str) -> Result<Arc<Node>> {
        self.insert_new(NodeKey::generate(type_name))
    }

    /// Create a New node with a chosen id in the active transaction
    pub fn create_node_with_id(&self, type_name: &str, id: &str) -> Result<Arc<Node>> {
        if id.is_empty() {
            return Err(Error::InvalidKey(format!("missing id for {}", type_name)));
        }
        self.insert_new(NodeKey::new(type_name, id))
    }

    fn insert_new(&self, key: NodeKey) -> Result<Arc<Node>> {
        let node = self.transient_with_key(key)?;
        self.shared.persist(&node)?;
        Ok(node)
    }

    /// A node that lives only in memory until persisted
    pub fn transient_node(&self, type_name: &str) -> Result<Arc<Node>> {
        self.transient_with_key(NodeKey::generate(type_name))
    }

    fn transient_with_key(&self, key: NodeKey) -> Result<Arc<Node>> {
        let mapping = self.shared.mapping_for(&key.type_name)?;
        let now = Utc::now();
        Ok(Node::new(key, mapping, &self.shared, Lifecycle::Transient, BTreeMap::new(), 0, now, now))
    }

    /// Make a transient node New inside the active transaction
    pub fn persist(&self, node: &Arc<Node>) -> Result<()> {
        self.shared.persist(node)
    }

    /// The calling thread's transactor for this manager
    pub fn current_transactor(&self) -> Transactor {
        Transactor::current(&self.shared)
    }

    /// Bind a fresh transactor to the calling thread.
    ///
    /// Fails with `TransactionAlreadyActive` while the bound one is in use.
    pub fn new_transactor(&self) -> Result<Transactor> {
        Transactor::fresh(&self.shared)
    }

    /// Build a new schema and swap it in.
    ///
    /// On failure the current schema stays in force. Cached nodes keep the
    /// mapping they were loaded with until they leave the cache.
    pub fn reload_schema(&self, builder: SchemaRegistryBuilder) -> Result<()> {
        let registry = match builder.build() {
            Ok(registry) => registry,
            Err(err) => {
                tracing::warn!(error = %err, "schema reload rejected");
                return Err(err);
            }
        };
        let types = registry.len();
        *self.shared.schema.write() = Arc::new(registry);
        tracing::info!(types, "schema reloaded");
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        self.shared.stats()
    }
}
