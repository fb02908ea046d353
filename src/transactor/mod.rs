//! Transactor - per-thread unit of work
//!
//! A transactor collects every node written during one logical operation
//! and flushes them together:
//! - `begin` binds a fresh write-set to the calling thread
//! - node writes register the node and pin it in the cache
//! - `commit` flushes inserts, updates, links and deletes atomically
//! - `abort` (or dropping an active transactor) restores committed state
//!
//! Transactors are `!Send`: each worker thread owns its own.

pub(crate) mod flush;

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::{Rc, Weak as RcWeak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use chrono::Utc;
use serde::Serialize;
use crate::{Error, Result};
use crate::key::NodeKey;
use crate::manager::Shared;
use crate::mapping::JoinTable;
use crate::node::{put, Lifecycle, Node};
use crate::value::Value;

/// Identity of one begin..commit/abort span
pub(crate) type TxId = u64;

static NEXT_TX: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Transactor bound to this thread, per node manager
    static BOUND: RefCell<HashMap<u64, RcWeak<TxInner>>> = RefCell::new(HashMap::new());
}

/// State machine of a transactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactorState {
    Idle,
    Active,
    Committing,
    Aborting,
}

impl TransactorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactorState::Idle => "idle",
            TransactorState::Active => "active",
            TransactorState::Committing => "committing",
            TransactorState::Aborting => "aborting",
        }
    }
}

impl std::fmt::Display for TransactorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A join-table edit recorded by `add_child`/`remove_child`
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LinkChange {
    pub(crate) attach: bool,
    pub(crate) join: JoinTable,
    pub(crate) parent: String,
    pub(crate) child: String,
}

impl LinkChange {
    pub(crate) fn attach(join: JoinTable, parent: &str, child: &str) -> Self {
        Self { attach: true, join, parent: parent.to_string(), child: child.to_string() }
    }

    pub(crate) fn detach(join: JoinTable, parent: &str, child: &str) -> Self {
        Self { attach: false, join, parent: parent.to_string(), child: child.to_string() }
    }

    fn same_pair(&self, other: &LinkChange) -> bool {
        self.join.table == other.join.table && self.parent == other.parent && self.child == other.child
    }
}

/// One registered node and what this transaction did to it
#[derive(Debug)]
pub(crate) struct Entry {
    pub(crate) node: Arc<Node>,
    /// Version the transaction first saw
    pub(crate) base_version: u64,
    /// Last value written per property (`Null` = removed)
    pub(crate) changes: BTreeMap<String, Value>,
}

#[derive(Debug, Default)]
pub(crate) struct WriteSet {
    pub(crate) entries: Vec<Entry>,
    index: HashMap<NodeKey, usize>,
    reads: HashMap<NodeKey, u64>,
    pub(crate) links: Vec<LinkChange>,
}

impl WriteSet {
    pub(crate) fn contains(&self, key: &NodeKey) -> bool {
        self.index.contains_key(key)
    }
}

pub(crate) struct TxInner {
    manager_id: u64,
    manager: Weak<Shared>,
    state: Cell<TransactorState>,
    tx_id: Cell<TxId>,
    write_set: RefCell<WriteSet>,
}

impl TxInner {
    fn is_active(&self) -> bool {
        self.state.get() == TransactorState::Active
    }

    pub(crate) fn id(&self) -> TxId {
        self.tx_id.get()
    }

    /// Register `node` with the write-set (idempotent) and pin it
    pub(crate) fn track(&self, node: &Arc<Node>) -> Result<TxId> {
        let tx_id = self.tx_id.get();
        let mut ws = self.write_set.borrow_mut();
        if ws.index.contains_key(node.key()) {
            return Ok(tx_id);
        }

        let version = {
            let mut inner = node.inner.lock();
            match inner.lifecycle {
                Lifecycle::New(owner) if owner != tx_id => {
                    return Err(Error::ConcurrentModification(node.key().to_string()));
                }
                Lifecycle::Transient => {
                    return Err(Error::InvalidValue(format!("{} is transient", node.key())));
                }
                Lifecycle::Deleted => return Err(Error::NotFound(node.key().to_string())),
                _ => {}
            }
            inner.pins.insert(tx_id);
            inner.version
        };
        let base_version = ws.reads.get(node.key()).copied().unwrap_or(version);

        let idx = ws.entries.len();
        ws.index.insert(node.key().clone(), idx);
        ws.entries.push(Entry { node: node.clone(), base_version, changes: BTreeMap::new() });
        tracing::debug!(tx = tx_id, key = %node.key(), base_version, "registered");
        Ok(tx_id)
    }

    pub(crate) fn note_change(&self, key: &NodeKey, property: &str, value: Value) {
        let mut ws = self.write_set.borrow_mut();
        if let Some(&idx) = ws.index.get(key) {
            ws.entries[idx].changes.insert(property.to_string(), value);
        }
    }

    /// Record a join-table edit; an attach and a detach of the same pair cancel
    pub(crate) fn note_link(&self, change: LinkChange) {
        let mut ws = self.write_set.borrow_mut();
        if let Some(pos) = ws.links.iter().position(|l| l.same_pair(&change)) {
            if ws.links[pos].attach != change.attach {
                ws.links.remove(pos);
            }
            return;
        }
        ws.links.push(change);
    }

    /// Remember the version a node had when this transaction first read it
    pub(crate) fn note_read(&self, key: &NodeKey, version: u64) {
        self.write_set.borrow_mut().reads.entry(key.clone()).or_insert(version);
    }

    fn begin(&self) -> Result<()> {
        if self.state.get() != TransactorState::Idle {
            return Err(Error::TransactionAlreadyActive);
        }
        self.tx_id.set(NEXT_TX.fetch_add(1, Ordering::Relaxed));
        *self.write_set.borrow_mut() = WriteSet::default();
        self.state.set(TransactorState::Active);
        tracing::debug!(tx = self.tx_id.get(), "begin");
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        if !self.is_active() {
            return Err(Error::NoActiveTransaction);
        }
        self.state.set(TransactorState::Committing);
        let ws = std::mem::take(&mut *self.write_set.borrow_mut());
        let tx_id = self.tx_id.get();

        let result = match self.manager.upgrade() {
            Some(shared) => commit_write_set(&shared, tx_id, &ws),
            None => Err(Error::StorageIO("node manager is gone".to_string())),
        };

        if let Err(err) = &result {
            tracing::warn!(tx = tx_id, error = %err, "commit failed, rolling back");
            rollback(self.manager.upgrade().as_deref(), tx_id, &ws);
        }
        self.state.set(TransactorState::Idle);
        result
    }

    fn abort(&self) -> Result<()> {
        if !self.is_active() {
            return Err(Error::NoActiveTransaction);
        }
        self.state.set(TransactorState::Aborting);
        let ws = std::mem::take(&mut *self.write_set.borrow_mut());
        rollback(self.manager.upgrade().as_deref(), self.tx_id.get(), &ws);
        tracing::debug!(tx = self.tx_id.get(), nodes = ws.entries.len(), "aborted");
        self.state.set(TransactorState::Idle);
        Ok(())
    }
}

impl Drop for TxInner {
    fn drop(&mut self) {
        if self.is_active() {
            tracing::warn!(tx = self.tx_id.get(), "transactor dropped while active, aborting");
            let _ = self.abort();
        }
    }
}

fn commit_write_set(shared: &Arc<Shared>, tx_id: TxId, ws: &WriteSet) -> Result<()> {
    for entry in &ws.entries {
        claim(tx_id, entry)?;
    }

    let now = Utc::now();
    let ops = flush::plan(shared, tx_id, ws, now)?;
    tracing::debug!(tx = tx_id, ops = ops.len(), "flush plan built");
    if !ops.is_empty() {
        shared.store().apply(&ops)?;
    }

    for entry in &ws.entries {
        finish(shared, tx_id, entry, now);
    }
    tracing::info!(tx = tx_id, nodes = ws.entries.len(), links = ws.links.len(), "committed");
    Ok(())
}

/// Check an entry against the node and reserve the node for this commit.
///
/// Check and reservation happen under the node lock, so two transactions
/// never both pass for the same node; the reservation is released by
/// `finish` or `rollback`.
fn claim(tx_id: TxId, entry: &Entry) -> Result<()> {
    let node = &entry.node;
    let mut inner = node.inner.lock();
    let conflict = if inner.lifecycle == Lifecycle::Deleted {
        Some("deleted by another transaction")
    } else if inner.committing.is_some_and(|owner| owner != tx_id) {
        Some("another commit in flight")
    } else if inner.version != entry.base_version {
        Some("version moved since first read")
    } else {
        None
    };
    if let Some(reason) = conflict {
        tracing::warn!(
            tx = tx_id, key = %node.key(),
            expected = entry.base_version, found = inner.version,
            reason, "commit conflict"
        );
        return Err(Error::ConcurrentModification(node.key().to_string()));
    }
    inner.committing = Some(tx_id);
    Ok(())
}

/// Fold a committed entry into the node's committed snapshot and unpin it
fn finish(shared: &Shared, tx_id: TxId, entry: &Entry, now: chrono::DateTime<Utc>) {
    let node = &entry.node;
    let leaves_cache = {
        let mut inner = node.inner.lock();
        inner.pins.remove(&tx_id);
        inner.committing = None;
        inner.writers.retain(|_, writer| *writer != tx_id);

        if inner.tombstoned_by == Some(tx_id) {
            inner.tombstoned_by = None;
            inner.lifecycle = Lifecycle::Deleted;
            true
        } else {
            let created = matches!(inner.lifecycle, Lifecycle::New(_));
            if created {
                inner.lifecycle = Lifecycle::Persistent;
                inner.committed = inner.props.clone();
            } else {
                for (property, value) in &entry.changes {
                    put(&mut inner.committed, property, value.clone());
                }
            }
            if created || !entry.changes.is_empty() {
                inner.version += 1;
                inner.modified = now;
            }
            false
        }
    };
    if leaves_cache {
        shared.cache().remove_node(node);
    }
}

/// Restore committed state for everything this transaction still owns
fn rollback(shared: Option<&Shared>, tx_id: TxId, ws: &WriteSet) {
    for entry in &ws.entries {
        let node = &entry.node;
        let leaves_cache = {
            let mut inner = node.inner.lock();
            inner.pins.remove(&tx_id);
            if inner.committing == Some(tx_id) {
                inner.committing = None;
            }
            if inner.tombstoned_by == Some(tx_id) {
                inner.tombstoned_by = None;
            }

            if inner.lifecycle == Lifecycle::New(tx_id) {
                inner.lifecycle = Lifecycle::Transient;
                inner.writers.clear();
                true
            } else {
                for property in entry.changes.keys() {
                    if inner.writers.get(property) == Some(&tx_id) {
                        inner.writers.remove(property);
                        let committed = inner.committed.get(property).cloned().unwrap_or(Value::Null);
                        put(&mut inner.props, property, committed);
                    }
                }
                false
            }
        };
        if leaves_cache {
            if let Some(shared) = shared {
                shared.cache().remove_node(node);
            }
        }
    }
}

/// Transactor bound to the calling thread for `manager_id`, if one is active
pub(crate) fn active(manager_id: u64) -> Option<Rc<TxInner>> {
    bound(manager_id).filter(|tx| tx.is_active())
}

fn bound(manager_id: u64) -> Option<Rc<TxInner>> {
    BOUND.with(|b| b.borrow().get(&manager_id).and_then(RcWeak::upgrade))
}

/// Handle to the calling thread's unit of work.
///
/// Cloning yields another handle to the same transactor.
#[derive(Clone)]
pub struct Transactor {
    inner: Rc<TxInner>,
}

impl Transactor {
    /// Transactor bound to this thread for the manager, created on first use
    pub(crate) fn current(shared: &Arc<Shared>) -> Transactor {
        if let Some(inner) = bound(shared.id()) {
            return Transactor { inner };
        }
        Self::bind(shared)
    }

    /// Bind a fresh transactor to this thread, replacing an idle one
    pub(crate) fn fresh(shared: &Arc<Shared>) -> Result<Transactor> {
        if bound(shared.id()).is_some_and(|tx| tx.state.get() != TransactorState::Idle) {
            return Err(Error::TransactionAlreadyActive);
        }
        Ok(Self::bind(shared))
    }

    fn bind(shared: &Arc<Shared>) -> Transactor {
        let inner = Rc::new(TxInner {
            manager_id: shared.id(),
            manager: Arc::downgrade(shared),
            state: Cell::new(TransactorState::Idle),
            tx_id: Cell::new(0),
            write_set: RefCell::new(WriteSet::default()),
        });
        BOUND.with(|b| {
            let mut bound = b.borrow_mut();
            bound.retain(|_, tx| tx.strong_count() > 0);
            bound.insert(shared.id(), Rc::downgrade(&inner));
        });
        Transactor { inner }
    }

    pub fn state(&self) -> TransactorState {
        self.inner.state.get()
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    /// Number of nodes registered in the current write-set
    pub fn len(&self) -> usize {
        self.inner.write_set.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` is registered in the current write-set
    pub fn contains(&self, key: &NodeKey) -> bool {
        self.inner.write_set.borrow().contains(key)
    }

    /// Start a unit of work
    pub fn begin(&self) -> Result<()> {
        self.inner.begin()
    }

    /// Register `node` without changing it.
    ///
    /// The node becomes Dirty and its version is checked at commit.
    pub fn register_change(&self, node: &Arc<Node>) -> Result<()> {
        if !self.is_active() {
            return Err(Error::NoActiveTransaction);
        }
        if node.manager_id() != self.inner.manager_id {
            return Err(Error::InvalidValue(format!(
                "{} belongs to another node manager", node.key()
            )));
        }
        self.inner.track(node).map(|_| ())
    }

    /// Flush the write-set atomically.
    ///
    /// On any failure nothing is written and every registered node is
    /// restored to its last committed state.
    pub fn commit(&self) -> Result<()> {
        self.inner.commit()
    }

    /// Discard the write-set, restoring committed state
    pub fn abort(&self) -> Result<()> {
        self.inner.abort()
    }

    /// Run `f` in a transaction: commit on `Ok`, abort on `Err`
    pub fn run<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.begin()?;
        match f() {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                self.abort()?;
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for Transactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transactor")
            .field("state", &self.state())
            .field("nodes", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{CacheConfig, NodeManager};
    use crate::mapping::{DbMapping, SchemaRegistry};
    use crate::node::NodeState;
    use crate::storage::SqliteStore;
    use crate::value::ColumnType;

    fn manager() -> NodeManager {
        let registry = SchemaRegistry::builder()
            .mapping(
                DbMapping::builder("user")
                    .table("users")
                    .scalar("name", "name", ColumnType::Text),
            )
            .build()
            .unwrap();
        let store = SqliteStore::open_in_memory().unwrap();
        store.ensure_schema(&registry).unwrap();
        NodeManager::new(registry, Arc::new(store), CacheConfig::default())
    }

    #[test]
    fn test_state_machine() {
        let manager = manager();
        let tx = manager.current_transactor();

        assert_eq!(tx.state(), TransactorState::Idle);
        assert_eq!(tx.commit().unwrap_err(), Error::NoActiveTransaction);
        assert_eq!(tx.abort().unwrap_err(), Error::NoActiveTransaction);

        tx.begin().unwrap();
        assert_eq!(tx.state(), TransactorState::Active);
        assert_eq!(tx.begin().unwrap_err(), Error::TransactionAlreadyActive);

        tx.commit().unwrap();
        assert_eq!(tx.state(), TransactorState::Idle);
    }

    #[test]
    fn test_current_is_per_thread_singleton() {
        let manager = manager();
        let a = manager.current_transactor();
        a.begin().unwrap();
        let b = manager.current_transactor();
        assert!(b.is_active());
        assert!(matches!(manager.new_transactor(), Err(Error::TransactionAlreadyActive)));
        a.abort().unwrap();
    }

    #[test]
    fn test_register_is_idempotent() {
        let manager = manager();
        let tx = manager.current_transactor();
        tx.begin().unwrap();
        let node = manager.create_node_with_id("user", "1").unwrap();
        node.set("name", "a").unwrap();
        node.set("name", "b").unwrap();
        tx.register_change(&node).unwrap();
        assert_eq!(tx.len(), 1);
        tx.commit().unwrap();

        assert_eq!(node.version(), 1);
        assert_eq!(node.state(), NodeState::Clean);
    }

    #[test]
    fn test_attach_then_detach_cancels() {
        let join = JoinTable {
            table: "post_tags".to_string(),
            parent_column: "post_id".to_string(),
            child_column: "tag_id".to_string(),
            order_column: None,
        };
        let manager = manager();
        let tx = manager.current_transactor();
        tx.begin().unwrap();

        tx.inner.note_link(LinkChange::attach(join.clone(), "p", "t"));
        tx.inner.note_link(LinkChange::detach(join.clone(), "p", "t"));
        assert!(tx.inner.write_set.borrow().links.is_empty());
        tx.abort().unwrap();
    }

    #[test]
    fn test_dropped_transactor_aborts() {
        let manager = manager();
        let node = {
            let tx = manager.new_transactor().unwrap();
            tx.begin().unwrap();
            manager.create_node_with_id("user", "9").unwrap()
        };

        assert_eq!(node.state(), NodeState::Transient);
        assert!(manager.cached(node.key()).is_none());
    }

    #[test]
    fn test_run_aborts_on_error() {
        let manager = manager();
        let tx = manager.current_transactor();
        let result: Result<()> = tx.run(|| {
            let node = manager.create_node_with_id("user", "3")?;
            node.set("name", "x")?;
            Err(Error::InvalidValue("stop".to_string()))
        });

        assert!(result.is_err());
        assert_eq!(tx.state(), TransactorState::Idle);
        assert!(manager.cached(&NodeKey::new("user", "3")).is_none());
    }

    #[test]
    fn test_commit_in_flight_blocks_a_second_commit() {
        let manager = manager();
        let tx = manager.current_transactor();
        let session = tx
            .run(|| {
                let session = manager.create_node("session")?;
                session.set("token", "a")?;
                Ok(session)
            })
            .unwrap();

        tx.begin().unwrap();
        session.set("token", "b").unwrap();
        // another transaction sits between its version check and its finish
        let other: TxId = u64::MAX;
        session.inner.lock().committing = Some(other);

        assert!(matches!(tx.commit(), Err(Error::ConcurrentModification(_))));
        assert_eq!(session.get("token"), Some(Value::Text("a".to_string())));
        assert_eq!(session.version(), 1);
        assert_eq!(session.inner.lock().committing, Some(other));

        session.inner.lock().committing = None;
        tx.run(|| session.set("token", "c")).unwrap();
        assert_eq!(session.version(), 2);
        assert_eq!(session.inner.lock().committing, None);
    }
}
