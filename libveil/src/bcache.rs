use crate::block::{Block, BlockPointer};
use crate::crypto::{hash_bytes, Hash256};
use crate::id::{BlockRef, BranchId, TlfId};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::num::NonZeroUsize;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockLifetime {
    /// read acceleration only; evictable at any time
    Transient,
    /// pinned until explicitly deleted
    Permanent,
}

/// every write stalls once this much dirty file data is waiting on syncs
pub const DIRTY_BYTES_THRESHOLD: u64 = crate::bops::MAX_PARALLEL_BLOCK_PUTS as u64 * 512 << 10;

fn dirty_size_of(block: &Block) -> u64 {
    match block {
        Block::File(file) => file.contents.len() as u64,
        Block::Dir(..) => 0,
    }
}

fn content_hash(block: &Block) -> Option<Hash256> {
    match block {
        // only direct file blocks take part in dedup
        Block::File(file) if !file.is_indirect => Some(hash_bytes(&file.contents)),
        _ => None,
    }
}

#[derive(Default)]
struct DedupMaps {
    by_hash: FxHashMap<(TlfId, Hash256), BlockPointer>,
    by_ref: FxHashMap<BlockRef, (TlfId, Hash256)>,
}

impl DedupMaps {
    fn insert(&mut self, tlf: TlfId, ptr: BlockPointer, hash: Hash256) {
        self.by_hash.insert((tlf, hash), ptr);
        self.by_ref.insert(ptr.block_ref(), (tlf, hash));
    }

    fn remove_ref(&mut self, block_ref: BlockRef) {
        if let Some(key) = self.by_ref.remove(&block_ref) {
            self.by_hash.remove(&key);
        }
    }
}

/// Three disjoint spaces over one block-id space: a bounded LRU of clean
/// blocks, an unbounded pinned map, and the dirty space keyed additionally
/// by branch so unsynced local edits stay invisible across branches.
pub struct BlockCache {
    transient: Mutex<Option<LruCache<BlockRef, Block>>>,
    permanent: RwLock<FxHashMap<BlockRef, Block>>,
    dirty: RwLock<FxHashMap<(BlockRef, BranchId), Block>>,
    dedup: Mutex<DedupMaps>,
    dirty_bytes: Mutex<u64>,
    dirty_drained: Notify,
}

impl BlockCache {
    pub fn new(transient_capacity: usize) -> Self {
        Self {
            transient: Mutex::new(
                NonZeroUsize::new(transient_capacity).map(LruCache::new),
            ),
            permanent: Default::default(),
            dirty: Default::default(),
            dedup: Default::default(),
            dirty_bytes: Mutex::new(0),
            dirty_drained: Notify::new(),
        }
    }

    /// Insert a clean block. With a zero-capacity transient space this is
    /// silently a no-op for transient lifetimes.
    pub fn put(&self, ptr: BlockPointer, tlf: TlfId, block: Block, lifetime: BlockLifetime) {
        let block_ref = ptr.block_ref();
        match lifetime {
            BlockLifetime::Transient => {
                let mut transient = self.transient.lock();
                let Some(cache) = transient.as_mut() else { return };
                let mut dedup = self.dedup.lock();
                if let Some(hash) = content_hash(&block) {
                    dedup.insert(tlf, ptr, hash);
                }
                if let Some((evicted_ref, _)) = cache.push(block_ref, block) {
                    if evicted_ref != block_ref {
                        dedup.remove_ref(evicted_ref);
                    }
                }
            }
            BlockLifetime::Permanent => {
                self.permanent.write().insert(block_ref, block);
            }
        }
    }

    /// Dirty-first lookup: a dirty copy under the requested branch wins
    /// over any clean copy, and dirty copies under other branches are
    /// never visible.
    pub fn get(&self, ptr: BlockPointer, branch: BranchId) -> Option<Block> {
        let block_ref = ptr.block_ref();
        if let Some(block) = self.dirty.read().get(&(block_ref, branch)) {
            return Some(block.clone());
        }
        if let Some(cache) = self.transient.lock().as_mut() {
            if let Some(block) = cache.get(&block_ref) {
                return Some(block.clone());
            }
        }
        self.permanent.read().get(&block_ref).cloned()
    }

    pub fn put_dirty(&self, ptr: BlockPointer, branch: BranchId, block: Block) {
        let size = dirty_size_of(&block);
        let prev = self.dirty.write().insert((ptr.block_ref(), branch), block);
        let mut dirty_bytes = self.dirty_bytes.lock();
        *dirty_bytes = *dirty_bytes + size - prev.as_ref().map_or(0, dirty_size_of);
    }

    pub fn is_dirty(&self, ptr: BlockPointer, branch: BranchId) -> bool {
        self.dirty.read().contains_key(&(ptr.block_ref(), branch))
    }

    pub fn delete_dirty(&self, ptr: BlockPointer, branch: BranchId) {
        if let Some(prev) = self.dirty.write().remove(&(ptr.block_ref(), branch)) {
            let mut dirty_bytes = self.dirty_bytes.lock();
            *dirty_bytes -= dirty_size_of(&prev);
            drop(dirty_bytes);
            self.dirty_drained.notify_waiters();
        }
    }

    pub fn delete_permanent(&self, ptr: BlockPointer) {
        self.permanent.write().remove(&ptr.block_ref());
    }

    /// Is there an identical clean block already cached for this folder? A
    /// hit hands back the existing pointer so the writer can reference the
    /// same bytes instead of uploading them again. Only transient entries
    /// register: permanent blocks are pinned exactly because they are
    /// mid-sync, and reusing them would cross in-flight writes.
    pub fn check_for_known_ptr(&self, tlf: TlfId, block: &Block) -> Option<BlockPointer> {
        let hash = content_hash(block)?;
        self.dedup.lock().by_hash.get(&(tlf, hash)).copied()
    }

    /// drop the dedup registration for a block's contents
    pub fn delete_known_ptr(&self, tlf: TlfId, block: &Block) {
        if let Some(hash) = content_hash(block) {
            let mut dedup = self.dedup.lock();
            if let Some(ptr) = dedup.by_hash.remove(&(tlf, hash)) {
                dedup.by_ref.remove(&ptr.block_ref());
            }
        }
    }

    pub fn dirty_bytes(&self) -> u64 {
        *self.dirty_bytes.lock()
    }

    /// Park the caller until an in-flight sync drains the dirty space back
    /// under the threshold.
    pub async fn wait_for_dirty_room(&self) {
        loop {
            // register interest before re-checking to avoid a lost wakeup
            let notified = self.dirty_drained.notified();
            if self.dirty_bytes() <= DIRTY_BYTES_THRESHOLD {
                return;
            }
            notified.await;
        }
    }
}

impl Default for BlockCache {
    fn default() -> Self {
        // enough for a few large directories' worth of read traffic
        Self::new(5000)
    }
}
