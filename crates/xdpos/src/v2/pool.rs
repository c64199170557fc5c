//! Thread-safe BFT message pool.
//!
//! Messages are grouped under a string pool key (`round:gap[:number:hash]`)
//! and deduplicated by content digest within each group. All operations are
//! atomic; returned snapshots are clones safe to iterate without the pool
//! lock.

use alloy_primitives::B256;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::warn;

/// An object storable in a [`MessagePool`].
pub trait PoolObj: Clone {
    /// The grouping key. The leading colon-delimited token must be the
    /// decimal round so hygiene can reap stale groups.
    fn pool_key(&self) -> String;

    /// Content digest used for deduplication within a group.
    fn hash(&self) -> B256;
}

impl PoolObj for super::Vote {
    fn pool_key(&self) -> String {
        Self::pool_key(self)
    }

    fn hash(&self) -> B256 {
        Self::hash(self)
    }
}

impl PoolObj for super::Timeout {
    fn pool_key(&self) -> String {
        Self::pool_key(self)
    }

    fn hash(&self) -> B256 {
        Self::hash(self)
    }
}

/// A pool of BFT messages keyed by `pool_key`, deduplicated by digest.
#[derive(Debug)]
pub struct MessagePool<T: PoolObj> {
    objs: Mutex<HashMap<String, HashMap<B256, T>>>,
}

impl<T: PoolObj> Default for MessagePool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: PoolObj> MessagePool<T> {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self { objs: Mutex::new(HashMap::new()) }
    }

    /// Insert `obj`, ignoring duplicates. Returns the number of distinct
    /// messages under the object's key and a snapshot of that group.
    pub fn add(&self, obj: T) -> (usize, HashMap<B256, T>) {
        let key = obj.pool_key();
        let hash = obj.hash();

        let mut objs = self.objs.lock();
        let group = objs.entry(key).or_default();
        group.entry(hash).or_insert(obj);
        (group.len(), group.clone())
    }

    /// All pool keys currently present.
    pub fn pool_obj_keys_list(&self) -> Vec<String> {
        self.objs.lock().keys().cloned().collect()
    }

    /// Snapshot of a single group, empty if the key is absent.
    pub fn get_by_pool_key(&self, key: &str) -> HashMap<B256, T> {
        self.objs.lock().get(key).cloned().unwrap_or_default()
    }

    /// Drop a single group.
    pub fn clear_by_pool_key(&self, key: &str) {
        self.objs.lock().remove(key);
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.objs.lock().clear();
    }

    /// Total number of messages across all groups.
    pub fn len(&self) -> usize {
        self.objs.lock().values().map(HashMap::len).sum()
    }

    /// Whether the pool holds no messages.
    pub fn is_empty(&self) -> bool {
        self.objs.lock().is_empty()
    }

    /// Drop every group whose round is older than
    /// `current_round - retention`. The round is parsed from the leading
    /// token of the pool key; unparseable keys are dropped too.
    pub fn hygiene(&self, current_round: u64, retention: u64) {
        let floor = current_round.saturating_sub(retention);
        self.objs.lock().retain(|key, _| match key.split(':').next().and_then(|t| t.parse::<u64>().ok()) {
            Some(round) => round >= floor,
            None => {
                warn!(target: "xdpos::pool", key, "dropping pool group with unparseable round");
                false
            }
        });
    }
}
