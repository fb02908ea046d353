//! Sharded node cache with single-flight loading
//!
//! Each shard owns an LRU map of live nodes and a table of loads in flight.
//! Shard locks are only held for map operations, never across store I/O.

use std::collections::HashMap;
use std::hash::{BuildHasher, RandomState};
use std::sync::Arc;
use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use crate::{Error, Result};
use crate::key::NodeKey;
use crate::node::{Node, NodeState};

/// A load in flight; followers block on it until the leader finishes.
pub(crate) struct PendingLoad {
    result: Mutex<Option<Result<Arc<Node>>>>,
    cv: Condvar,
}

impl PendingLoad {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn finish(&self, outcome: Result<Arc<Node>>) {
        let mut result = self.result.lock();
        if result.is_none() {
            *result = Some(outcome);
            self.cv.notify_all();
        }
    }

    /// Block until the leader publishes its outcome
    pub(crate) fn wait(&self) -> Result<Arc<Node>> {
        let mut guard = self.result.lock();
        loop {
            if let Some(result) = guard.as_ref() {
                return result.clone();
            }
            self.cv.wait(&mut guard);
        }
    }
}

/// Outcome of a cache lookup that may start a load
pub(crate) enum Lookup {
    Hit(Arc<Node>),
    /// Caller must load the node and call `complete`
    Leader(Arc<PendingLoad>),
    /// Another thread is loading; wait on the handle
    Follower(Arc<PendingLoad>),
}

struct Shard {
    entries: LruCache<NodeKey, Arc<Node>>,
    pending: HashMap<NodeKey, Arc<PendingLoad>>,
}

/// Whether dropping `node` loses nothing: it is Clean and its type has a
/// table to reload it from
fn reclaimable(node: &Node) -> bool {
    node.state() == NodeState::Clean && node.mapping().is_relational()
}

impl Shard {
    /// Drop least recently used reclaimable entries until the shard fits.
    /// Pinned and in-memory entries are skipped, so a shard may stay over
    /// capacity.
    fn reclaim(&mut self, capacity: usize) -> usize {
        let mut evicted = 0;
        while self.entries.len() > capacity {
            let victim = self
                .entries
                .iter()
                .rev()
                .find(|(_, node)| reclaimable(node))
                .map(|(key, _)| key.clone());
            match victim {
                Some(key) => {
                    self.entries.pop(&key);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }
}

pub(crate) struct NodeCache {
    shards: Vec<Mutex<Shard>>,
    shard_capacity: usize,
    hasher: RandomState,
}

impl NodeCache {
    pub(crate) fn new(capacity: usize, shards: usize) -> Self {
        let shards = shards.max(1);
        let shard_capacity = capacity.div_ceil(shards).max(1);
        Self {
            shards: (0..shards)
                .map(|_| {
                    Mutex::new(Shard {
                        entries: LruCache::unbounded(),
                        pending: HashMap::new(),
                    })
                })
                .collect(),
            shard_capacity,
            hasher: RandomState::new(),
        }
    }

    fn shard(&self, key: &NodeKey) -> &Mutex<Shard> {
        let idx = self.hasher.hash_one(key) as usize % self.shards.len();
        &self.shards[idx]
    }

    /// Cached node, marked as most recently used
    pub(crate) fn get(&self, key: &NodeKey) -> Option<Arc<Node>> {
        self.shard(key).lock().entries.get(key).cloned()
    }

    /// Cached node without touching recency
    pub(crate) fn peek(&self, key: &NodeKey) -> Option<Arc<Node>> {
        self.shard(key).lock().entries.peek(key).cloned()
    }

    /// Look `key` up, claiming the load if nobody else is loading it
    pub(crate) fn lookup_or_claim(&self, key: &NodeKey) -> Lookup {
        let mut shard = self.shard(key).lock();
        if let Some(node) = shard.entries.get(key) {
            return Lookup::Hit(node.clone());
        }
        if let Some(pending) = shard.pending.get(key) {
            return Lookup::Follower(pending.clone());
        }
        let pending = Arc::new(PendingLoad::new());
        shard.pending.insert(key.clone(), pending.clone());
        Lookup::Leader(pending)
    }

    /// Publish a leader's outcome.
    ///
    /// A loaded node is inserted unless another instance got there first, in
    /// which case that instance is handed to everyone. Returns the published
    /// outcome and the number of entries reclaimed.
    pub(crate) fn complete(
        &self,
        key: &NodeKey,
        pending: &PendingLoad,
        outcome: Result<Arc<Node>>,
    ) -> (Result<Arc<Node>>, usize) {
        let mut evicted = 0;
        let outcome = {
            let mut shard = self.shard(key).lock();
            shard.pending.remove(key);
            match outcome {
                Ok(node) => {
                    let winner = match shard.entries.get(key) {
                        Some(existing) => existing.clone(),
                        None => {
                            shard.entries.put(key.clone(), node.clone());
                            evicted = shard.reclaim(self.shard_capacity);
                            node
                        }
                    };
                    Ok(winner)
                }
                Err(err) => Err(err),
            }
        };
        pending.finish(outcome.clone());
        (outcome, evicted)
    }

    /// Insert unless the key is present; returns the cached instance and the
    /// number of entries reclaimed
    pub(crate) fn insert_if_absent(&self, node: Arc<Node>) -> (Arc<Node>, usize) {
        let mut shard = self.shard(node.key()).lock();
        if let Some(existing) = shard.entries.get(node.key()) {
            return (existing.clone(), 0);
        }
        shard.entries.put(node.key().clone(), node.clone());
        let evicted = shard.reclaim(self.shard_capacity);
        (node, evicted)
    }

    /// Insert a node that must not exist yet
    pub(crate) fn insert_new(&self, node: Arc<Node>) -> Result<usize> {
        let mut shard = self.shard(node.key()).lock();
        if shard.entries.contains(node.key()) || shard.pending.contains_key(node.key()) {
            return Err(Error::InvalidKey(format!("{} already exists", node.key())));
        }
        shard.entries.put(node.key().clone(), node);
        Ok(shard.reclaim(self.shard_capacity))
    }

    /// Remove `node` if it is the cached instance for its key
    pub(crate) fn remove_node(&self, node: &Arc<Node>) {
        let mut shard = self.shard(node.key()).lock();
        if shard.entries.peek(node.key()).is_some_and(|cached| Arc::ptr_eq(cached, node)) {
            shard.entries.pop(node.key());
        }
    }

    /// Drop a Clean entry; `CacheBusy` for anything uncommitted and for
    /// nodes of in-memory types, which have no other copy
    pub(crate) fn evict(&self, key: &NodeKey) -> Result<bool> {
        let mut shard = self.shard(key).lock();
        let Some(node) = shard.entries.peek(key) else {
            return Ok(false);
        };
        if !node.mapping().is_relational() {
            return Err(Error::CacheBusy(format!("{} lives only in memory", key)));
        }
        let state = node.state();
        if state != NodeState::Clean {
            return Err(Error::CacheBusy(format!("{} is {}", key, state)));
        }
        shard.entries.pop(key);
        Ok(true)
    }

    pub(crate) fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().entries.len()).sum()
    }
}
