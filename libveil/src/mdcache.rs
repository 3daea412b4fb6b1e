use crate::id::{BranchId, Revision, TlfId};
use crate::md::MdWithId;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

const MD_CACHE_CAPACITY: usize = 5000;

/// Decoded revisions by `(folder, revision, branch)`, so chain walks and
/// conflict resolution rarely refetch what the updater already validated.
pub struct MdCache {
    cache: Mutex<LruCache<(TlfId, Revision, BranchId), MdWithId>>,
}

impl MdCache {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(MD_CACHE_CAPACITY).unwrap())),
        }
    }

    pub fn get(&self, tlf: TlfId, rev: Revision, branch: BranchId) -> Option<MdWithId> {
        self.cache.lock().get(&(tlf, rev, branch)).cloned()
    }

    pub fn put(&self, md: MdWithId) {
        let key = (md.md.tlf(), md.md.revision, md.md.branch());
        self.cache.lock().put(key, md);
    }

    /// drop every cached revision of a pruned branch
    pub fn delete_branch(&self, tlf: TlfId, branch: BranchId) {
        let mut cache = self.cache.lock();
        let keys: Vec<_> = cache
            .iter()
            .map(|(key, _)| *key)
            .filter(|&(t, _, b)| t == tlf && b == branch)
            .collect();
        for key in keys {
            cache.pop(&key);
        }
    }
}

impl Default for MdCache {
    fn default() -> Self {
        Self::new()
    }
}
