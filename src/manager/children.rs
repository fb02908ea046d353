//! Lazy, restartable child sequences
//!
//! A `Children` value describes one parent's collection. Every call to
//! `iter` starts over: it fetches the ordered child ids once, then hydrates
//! nodes in batches of the manager's configured size.

use std::collections::VecDeque;
use std::sync::Arc;
use crate::{Error, Result};
use crate::key::NodeKey;
use crate::mapping::{CollectionQuery, DbMapping, Relation};
use crate::node::Node;
use super::Shared;

enum Source {
    Stored {
        query: CollectionQuery,
        target: Arc<DbMapping>,
    },
    /// Members held by the parent; never loaded from storage
    InMemory(Vec<Arc<Node>>),
}

/// Children of one parent through one relation.
pub struct Children {
    shared: Arc<Shared>,
    parent: NodeKey,
    relation: Arc<Relation>,
    source: Source,
}

impl Children {
    pub(crate) fn stored(
        shared: Arc<Shared>,
        parent: NodeKey,
        parent_mapping: &DbMapping,
        relation: Arc<Relation>,
    ) -> Result<Self> {
        let query = parent_mapping.collection_query(&relation, &parent.id)?;
        let target = shared.mapping_for(&query.target_type)?;
        if !target.is_relational() {
            return Err(Error::Config(format!(
                "{}.{} targets {}, which has no table",
                parent.type_name, relation.property(), query.target_type
            )));
        }
        Ok(Self {
            shared,
            parent,
            relation,
            source: Source::Stored { query, target },
        })
    }

    pub(crate) fn in_memory(shared: Arc<Shared>, parent: NodeKey, relation: Arc<Relation>, nodes: Vec<Arc<Node>>) -> Self {
        Self {
            shared,
            parent,
            relation,
            source: Source::InMemory(nodes),
        }
    }

    pub fn parent(&self) -> &NodeKey {
        &self.parent
    }

    pub fn relation(&self) -> &Relation {
        &self.relation
    }

    /// Ordered child keys, freshly queried
    pub fn ids(&self) -> Result<Vec<NodeKey>> {
        match &self.source {
            Source::Stored { query, .. } => {
                let ids = self.shared.store().fetch_ids(query)?;
                tracing::debug!(parent = %self.parent, relation = self.relation.property(), count = ids.len(), "child ids");
                Ok(ids
                    .into_iter()
                    .map(|id| NodeKey::new(query.target_type.as_str(), id))
                    .collect())
            }
            Source::InMemory(nodes) => Ok(nodes.iter().map(|n| n.key().clone()).collect()),
        }
    }

    /// Number of children, without hydrating them
    pub fn count(&self) -> Result<usize> {
        self.ids().map(|ids| ids.len())
    }

    /// Start a new pass over the children
    pub fn iter(&self) -> ChildIter<'_> {
        ChildIter {
            children: self,
            pending: None,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    /// Hydrate every child
    pub fn to_vec(&self) -> Result<Vec<Arc<Node>>> {
        self.iter().collect()
    }

    fn hydrate(&self, keys: Vec<NodeKey>) -> Result<Vec<Arc<Node>>> {
        match &self.source {
            Source::Stored { target, .. } => self.shared.hydrate_batch(target, &keys),
            Source::InMemory(members) => Ok(keys
                .iter()
                .filter_map(|key| members.iter().find(|m| m.key() == key).cloned())
                .collect()),
        }
    }
}

impl std::fmt::Debug for Children {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Children")
            .field("parent", &self.parent)
            .field("relation", &self.relation.property())
            .finish()
    }
}

impl<'a> IntoIterator for &'a Children {
    type Item = Result<Arc<Node>>;
    type IntoIter = ChildIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// One pass over a collection.
///
/// Child ids are fetched on the first `next`; nodes are hydrated one batch
/// at a time. After an error the iterator is exhausted.
pub struct ChildIter<'a> {
    children: &'a Children,
    pending: Option<VecDeque<NodeKey>>,
    buffer: VecDeque<Arc<Node>>,
    done: bool,
}

impl ChildIter<'_> {
    fn fail(&mut self, err: Error) -> Option<Result<Arc<Node>>> {
        self.done = true;
        self.buffer.clear();
        Some(Err(err))
    }
}

impl Iterator for ChildIter<'_> {
    type Item = Result<Arc<Node>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.pending.is_none() {
            match self.children.ids() {
                Ok(ids) => self.pending = Some(ids.into()),
                Err(err) => return self.fail(err),
            }
        }

        let batch_size = self.children.shared.batch_size();
        while self.buffer.is_empty() {
            let pending = self.pending.as_mut()?;
            if pending.is_empty() {
                self.done = true;
                return None;
            }
            let take = batch_size.min(pending.len());
            let batch: Vec<NodeKey> = pending.drain(..take).collect();
            match self.children.hydrate(batch) {
                Ok(nodes) => self.buffer.extend(nodes),
                Err(err) => return self.fail(err),
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
