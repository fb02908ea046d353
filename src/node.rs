//! Nodes - cached objects of the graph
//!
//! A node carries two property maps:
//! - `props`: what callers currently see, including uncommitted writes
//! - `committed`: the last state known to be in storage
//!
//! Every write to a persistent node goes through the calling thread's active
//! transactor, which pins the node until commit or abort. Each property
//! remembers the transaction that wrote it last, so an abort only reverts
//! what that transaction still owns.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use crate::{Error, Result};
use crate::key::NodeKey;
use crate::manager::{Children, Shared};
use crate::mapping::{Cardinality, DbMapping, Relation, RelationKind};
use crate::transactor::{self, LinkChange, TxId};
use crate::value::Value;

/// Externally visible lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Not known to storage or to the cache
    Transient,
    /// Identity assigned inside a transaction, not yet committed
    New,
    /// Identical to storage
    Clean,
    /// Written by at least one active transaction
    Dirty,
    /// Deleted, or deletion pending commit
    Tombstoned,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Transient => "transient",
            NodeState::New => "new",
            NodeState::Clean => "clean",
            NodeState::Dirty => "dirty",
            NodeState::Tombstoned => "tombstoned",
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Transient,
    /// Created by the given transaction, not yet committed
    New(TxId),
    Persistent,
    /// Deletion committed; the node has left the cache
    Deleted,
}

#[derive(Debug)]
pub(crate) struct NodeInner {
    pub(crate) lifecycle: Lifecycle,
    pub(crate) props: BTreeMap<String, Value>,
    pub(crate) committed: BTreeMap<String, Value>,
    pub(crate) version: u64,
    pub(crate) created: DateTime<Utc>,
    pub(crate) modified: DateTime<Utc>,
    /// Last uncommitted writer of each property
    pub(crate) writers: HashMap<String, TxId>,
    /// Transactions holding this node in their write-set
    pub(crate) pins: BTreeSet<TxId>,
    pub(crate) tombstoned_by: Option<TxId>,
    /// Transaction between its version check and the end of its commit
    pub(crate) committing: Option<TxId>,
    pub(crate) virtual_children: BTreeMap<String, Vec<Arc<Node>>>,
    pub(crate) parent: Option<Weak<Node>>,
}

impl NodeInner {
    pub(crate) fn state(&self) -> NodeState {
        match self.lifecycle {
            Lifecycle::Transient => NodeState::Transient,
            Lifecycle::Deleted => NodeState::Tombstoned,
            _ if self.tombstoned_by.is_some() => NodeState::Tombstoned,
            Lifecycle::New(_) => NodeState::New,
            Lifecycle::Persistent if !self.pins.is_empty() => NodeState::Dirty,
            Lifecycle::Persistent => NodeState::Clean,
        }
    }
}

/// One object of the graph.
///
/// Nodes are shared as `Arc<Node>`; the node manager guarantees at most one
/// live cached instance per key.
#[derive(Debug)]
pub struct Node {
    key: NodeKey,
    mapping: Arc<DbMapping>,
    manager_id: u64,
    manager: Weak<Shared>,
    pub(crate) inner: Mutex<NodeInner>,
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        key: NodeKey,
        mapping: Arc<DbMapping>,
        manager: &Arc<Shared>,
        lifecycle: Lifecycle,
        props: BTreeMap<String, Value>,
        version: u64,
        created: DateTime<Utc>,
        modified: DateTime<Utc>,
    ) -> Arc<Self> {
        let committed = match lifecycle {
            Lifecycle::Persistent => props.clone(),
            _ => BTreeMap::new(),
        };
        Arc::new(Self {
            key,
            mapping,
            manager_id: manager.id(),
            manager: Arc::downgrade(manager),
            inner: Mutex::new(NodeInner {
                lifecycle,
                props,
                committed,
                version,
                created,
                modified,
                writers: HashMap::new(),
                pins: BTreeSet::new(),
                tombstoned_by: None,
                committing: None,
                virtual_children: BTreeMap::new(),
                parent: None,
            }),
        })
    }

    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    pub fn type_name(&self) -> &str {
        &self.key.type_name
    }

    pub fn id(&self) -> &str {
        &self.key.id
    }

    /// Schema this node was loaded or created with
    pub fn mapping(&self) -> &Arc<DbMapping> {
        &self.mapping
    }

    pub fn state(&self) -> NodeState {
        self.inner.lock().state()
    }

    /// Committed version; 0 until the first commit
    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.inner.lock().created
    }

    pub fn modified(&self) -> DateTime<Utc> {
        self.inner.lock().modified
    }

    pub(crate) fn manager_id(&self) -> u64 {
        self.manager_id
    }

    pub(crate) fn shared(&self) -> Result<Arc<Shared>> {
        self.manager
            .upgrade()
            .ok_or_else(|| Error::StorageIO(format!("node manager of {} is gone", self.key)))
    }

    // ========== Properties ==========

    /// Current value of `property`, including uncommitted writes
    pub fn get(&self, property: &str) -> Option<Value> {
        self.inner.lock().props.get(property).cloned()
    }

    /// Snapshot of all current properties
    pub fn properties(&self) -> BTreeMap<String, Value> {
        self.inner.lock().props.clone()
    }

    /// Set `property`. Setting `Value::Null` removes it.
    ///
    /// Transient nodes change freely. Persistent nodes need an active
    /// transaction on the calling thread and become Dirty.
    pub fn set(self: &Arc<Self>, property: &str, value: impl Into<Value>) -> Result<()> {
        let value = self.check_value(property, value.into())?;
        self.write(property, value)
    }

    /// Remove `property`
    pub fn remove(self: &Arc<Self>, property: &str) -> Result<()> {
        self.set(property, Value::Null)
    }

    fn check_value(&self, property: &str, value: Value) -> Result<Value> {
        let Some(relation) = self.mapping.relation_for(property) else {
            if self.mapping.is_relational() {
                return Err(Error::InvalidValue(format!(
                    "{} has no property {}", self.key.type_name, property
                )));
            }
            return Ok(value);
        };

        match relation.kind() {
            RelationKind::Scalar => {
                let ty = relation
                    .column_type()
                    .or_else(|| self.mapping.column_for(property).map(|c| c.column_type()));
                match ty {
                    Some(ty) => value.coerce(ty),
                    None => Ok(value),
                }
            }
            RelationKind::Reference => match value {
                Value::Null => Ok(Value::Null),
                Value::Reference(key) if Some(key.type_name.as_str()) == relation.target_type() => {
                    Ok(Value::Reference(key))
                }
                other => Err(Error::InvalidValue(format!(
                    "{}.{} expects a reference to {}, got {}",
                    self.key.type_name,
                    property,
                    relation.target_type().unwrap_or("?"),
                    other
                ))),
            },
            RelationKind::Collection | RelationKind::Virtual => Err(Error::InvalidValue(format!(
                "{}.{} is a collection; use add_child/remove_child",
                self.key.type_name, property
            ))),
        }
    }

    fn write(self: &Arc<Self>, property: &str, value: Value) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            match inner.lifecycle {
                Lifecycle::Transient => {
                    put(&mut inner.props, property, value);
                    return Ok(());
                }
                Lifecycle::Deleted => return Err(Error::NotFound(self.key.to_string())),
                _ => {}
            }
        }

        let tx = transactor::active(self.manager_id).ok_or(Error::NoActiveTransaction)?;
        let tx_id = tx.track(self)?;
        {
            let mut inner = self.inner.lock();
            if let Some(owner) = inner.tombstoned_by {
                if owner != tx_id {
                    return Err(Error::ConcurrentModification(self.key.to_string()));
                }
                return Err(Error::NotFound(self.key.to_string()));
            }
            put(&mut inner.props, property, value.clone());
            inner.writers.insert(property.to_string(), tx_id);
        }
        tx.note_change(&self.key, property, value);
        Ok(())
    }

    /// Mark the node for deletion at commit
    pub fn delete(self: &Arc<Self>) -> Result<()> {
        {
            let inner = self.inner.lock();
            match inner.lifecycle {
                Lifecycle::Transient => return Ok(()),
                Lifecycle::Deleted => return Err(Error::NotFound(self.key.to_string())),
                _ => {}
            }
        }

        let tx = transactor::active(self.manager_id).ok_or(Error::NoActiveTransaction)?;
        let tx_id = tx.track(self)?;
        let mut inner = self.inner.lock();
        match inner.tombstoned_by {
            Some(owner) if owner != tx_id => Err(Error::ConcurrentModification(self.key.to_string())),
            _ => {
                inner.tombstoned_by = Some(tx_id);
                Ok(())
            }
        }
    }

    // ========== Relations ==========

    /// Resolve a reference property to its target node
    pub fn reference(&self, property: &str) -> Result<Option<Arc<Node>>> {
        match self.get(property) {
            Some(Value::Reference(key)) => self.shared()?.get_node(&key).map(Some),
            Some(Value::Null) | None => Ok(None),
            Some(other) => Err(Error::InvalidValue(format!(
                "{}.{} holds {}, not a reference", self.key, property, other
            ))),
        }
    }

    /// Hierarchical parent: the mapping's parent reference when declared,
    /// otherwise the in-memory parent set by `add_child`
    pub fn parent(&self) -> Result<Option<Arc<Node>>> {
        if let Some(relation) = self.mapping.parent_relation() {
            return self.reference(relation.property());
        }
        Ok(self.inner.lock().parent.as_ref().and_then(Weak::upgrade))
    }

    /// Children of a collection or virtual relation
    pub fn children(self: &Arc<Self>, relation: &str) -> Result<Children> {
        let rel = self.collection_relation(relation)?;
        let shared = self.shared()?;
        if rel.kind() == RelationKind::Virtual {
            let nodes = self.virtual_members(relation);
            return Ok(Children::in_memory(shared, self.key.clone(), rel, nodes));
        }
        Children::stored(shared, self.key.clone(), &self.mapping, rel)
    }

    pub(crate) fn virtual_members(&self, relation: &str) -> Vec<Arc<Node>> {
        self.inner
            .lock()
            .virtual_children
            .get(relation)
            .cloned()
            .unwrap_or_default()
    }

    /// Add `child` to a collection.
    ///
    /// One-to-many collections set the child's join reference, many-to-many
    /// collections record a join-table link, virtual collections edit the
    /// in-memory list. A transient child of a persistent parent is persisted.
    pub fn add_child(self: &Arc<Self>, relation: &str, child: &Arc<Node>) -> Result<()> {
        let rel = self.collection_relation(relation)?;
        self.check_target(&rel, child)?;
        let persistent_parent = self.state() != NodeState::Transient;
        if persistent_parent && child.state() == NodeState::Transient {
            self.shared()?.persist(child)?;
        }

        match (rel.kind(), rel.cardinality()) {
            (RelationKind::Virtual, _) => {
                let mut inner = self.inner.lock();
                let list = inner.virtual_children.entry(relation.to_string()).or_default();
                if !list.iter().any(|member| member.key() == child.key()) {
                    list.push(child.clone());
                }
                drop(inner);
                child.inner.lock().parent = Some(Arc::downgrade(self));
                Ok(())
            }
            (_, Cardinality::ManyToMany(join)) => {
                self.link(LinkChange::attach(join.clone(), self.id(), child.id()))
            }
            _ => {
                let property = self.join_property(&rel, child)?;
                child.set(&property, Value::Reference(self.key.clone()))
            }
        }
    }

    /// Remove `child` from a collection; the child itself is kept
    pub fn remove_child(self: &Arc<Self>, relation: &str, child: &Arc<Node>) -> Result<()> {
        let rel = self.collection_relation(relation)?;
        self.check_target(&rel, child)?;

        match (rel.kind(), rel.cardinality()) {
            (RelationKind::Virtual, _) => {
                let removed = {
                    let mut inner = self.inner.lock();
                    match inner.virtual_children.get_mut(relation) {
                        Some(list) => {
                            let before = list.len();
                            list.retain(|member| member.key() != child.key());
                            list.len() != before
                        }
                        None => false,
                    }
                };
                if removed {
                    let mut child_inner = child.inner.lock();
                    if child_inner.parent.as_ref().is_some_and(|p| p.as_ptr() == Arc::as_ptr(self)) {
                        child_inner.parent = None;
                    }
                }
                Ok(())
            }
            (_, Cardinality::ManyToMany(join)) => {
                self.link(LinkChange::detach(join.clone(), self.id(), child.id()))
            }
            _ => {
                let property = self.join_property(&rel, child)?;
                match child.get(&property) {
                    Some(Value::Reference(key)) if key == self.key => child.set(&property, Value::Null),
                    _ => Ok(()),
                }
            }
        }
    }

    fn link(&self, change: LinkChange) -> Result<()> {
        if self.state() == NodeState::Transient {
            return Err(Error::InvalidValue(format!(
                "persist {} before linking children", self.key
            )));
        }
        let tx = transactor::active(self.manager_id).ok_or(Error::NoActiveTransaction)?;
        tx.note_link(change);
        Ok(())
    }

    fn collection_relation(&self, relation: &str) -> Result<Arc<Relation>> {
        let rel = self.mapping.relation_for(relation).ok_or_else(|| {
            Error::InvalidValue(format!("{} has no relation {}", self.key.type_name, relation))
        })?;
        match rel.kind() {
            RelationKind::Collection | RelationKind::Virtual => Ok(rel.clone()),
            kind => Err(Error::InvalidValue(format!(
                "{}.{} is a {} relation, not a collection", self.key.type_name, relation, kind
            ))),
        }
    }

    fn check_target(&self, relation: &Relation, child: &Node) -> Result<()> {
        match relation.target_type() {
            Some(target) if target != child.type_name() => Err(Error::InvalidValue(format!(
                "{}.{} holds {} nodes, not {}",
                self.key.type_name, relation.property(), target, child.type_name()
            ))),
            _ => Ok(()),
        }
    }

    /// Child property that stores the join column of a one-to-many relation
    fn join_property(&self, relation: &Relation, child: &Node) -> Result<String> {
        let join = relation.join_column().unwrap_or_default();
        child
            .mapping
            .property_for_column(join)
            .filter(|p| {
                child
                    .mapping
                    .relation_for(p)
                    .is_some_and(|r| r.kind() == RelationKind::Reference)
            })
            .map(str::to_string)
            .ok_or_else(|| {
                Error::Config(format!(
                    "{} must declare a reference property on column {} to join {}.{}",
                    child.type_name(), join, self.key.type_name, relation.property()
                ))
            })
    }
}

/// Insert or, for null, remove a property
pub(crate) fn put(props: &mut BTreeMap<String, Value>, property: &str, value: Value) {
    if value.is_null() {
        props.remove(property);
    } else {
        props.insert(property.to_string(), value);
    }
}
