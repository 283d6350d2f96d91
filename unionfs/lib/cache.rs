use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use tokio::sync::Mutex;

use crate::{EntryName, UnionNode};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The engine-wide name-to-node cache, keyed by `(parent id, child name)`.
///
/// The cache holds weak references only; node lifetime belongs to external
/// holders. Membership changes happen together with the node's `cached`
/// flag under a single acquisition of the cache lock (the node metadata
/// lock is taken inside it: cache lock first, node lock second, never
/// across a layer call).
pub(crate) struct NameCache {
    entries: Mutex<HashMap<(u64, EntryName), Weak<UnionNode>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NameCache {
    /// Creates an empty cache.
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached node for `(parent_id, name)`, pruning a dead
    /// entry on the way.
    pub(crate) async fn get(&self, parent_id: u64, name: &EntryName) -> Option<Arc<UnionNode>> {
        let mut entries = self.entries.lock().await;
        let key = (parent_id, name.clone());
        match entries.get(&key).and_then(Weak::upgrade) {
            Some(node) => Some(node),
            None => {
                entries.remove(&key);
                None
            }
        }
    }

    /// Interns `node` under `(parent_id, name)` and sets its `cached`
    /// flag.
    ///
    /// If a live node is already interned under the key (a racing
    /// resolution won), that node is returned instead and `node` is left
    /// uncached.
    pub(crate) async fn intern(
        &self,
        parent_id: u64,
        name: &EntryName,
        node: &Arc<UnionNode>,
    ) -> Option<Arc<UnionNode>> {
        let mut entries = self.entries.lock().await;
        let key = (parent_id, name.clone());

        if let Some(existing) = entries.get(&key).and_then(Weak::upgrade) {
            return Some(existing);
        }

        entries.insert(key, Arc::downgrade(node));
        node.meta.lock().await.cached = true;
        None
    }

    /// Drops the `(parent_id, name)` entry if it refers to `node` (or is
    /// dead) and clears the node's `cached` flag, atomically with respect
    /// to the cache lock.
    pub(crate) async fn forget(&self, parent_id: u64, name: &EntryName, node: &Arc<UnionNode>) {
        let mut entries = self.entries.lock().await;
        let key = (parent_id, name.clone());

        let refers_here = match entries.get(&key) {
            Some(weak) => match weak.upgrade() {
                Some(current) => Arc::ptr_eq(&current, node),
                None => true,
            },
            None => false,
        };
        if refers_here {
            entries.remove(&key);
        }
        node.meta.lock().await.cached = false;
    }

    /// Number of live entries, for tests.
    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        let entries = self.entries.lock().await;
        entries.values().filter(|weak| weak.strong_count() > 0).count()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
