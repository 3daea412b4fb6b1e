use crate::bcache::{BlockLifetime, DIRTY_BYTES_THRESHOLD};
use crate::block::{
    Block, BlockInfo, BlockPointer, DirBlock, DirEntry, EntryInfo, EntryType, FileBlock,
    IndirectFilePtr,
};
use crate::bops::BlockPutState;
use crate::config::VeilConfig;
use crate::error::{VeilError, VeilResult, VeilResultExt};
use crate::handle::{check_entry_name, TlfHandle};
use crate::id::{BlockId, BlockRef, BranchId, Revision, TlfId};
use crate::md::{MdFlags, MdWithId, RootMetadata};
use crate::nodecache::{NodeCache, NodeId};
use crate::observer::{NodeChange, Observer};
use crate::ops::{Attr, BlockUpdate, Op, SyncOp, WriteRange};
use crate::path::{FolderBranch, VeilPath};
use crate::status::FolderStatus;
use parking_lot::RwLock as SyncRwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

const MAX_SYNC_RETRIES: usize = 10;

// ---- lock-order tracking ----------------------------------------------

const L_MD_WRITER: u8 = 1 << 0;
const L_HEAD: u8 = 1 << 1;
const L_BLOCKS: u8 = 1 << 2;

/// Per-operation record of which lock levels have been taken. Levels only
/// ever go downward within one operation; re-acquiring a higher level
/// after a lower one trips the assertion even if the higher guard was
/// already dropped.
#[derive(Default)]
struct LockState(u8);

impl LockState {
    fn new() -> Self {
        Self::default()
    }
}

// ---- per-block sync state ---------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileSyncState {
    /// being uploaded; untouched since the sync started
    SyncingNotDirty,
    /// being uploaded, but a write landed mid-flight on a copied block
    SyncingAndDirty,
}

#[derive(Debug, Clone)]
enum DeferredKind {
    Write { data: Vec<u8>, off: u64 },
    Truncate { size: u64 },
}

/// A mutation parked while its file's sync is in flight, replayed against
/// the post-sync blocks.
#[derive(Debug, Clone)]
struct DeferredOp {
    node: NodeId,
    kind: DeferredKind,
}

/// The pending sync op for one dirty file, accumulated write by write.
#[derive(Debug, Clone, Default)]
struct SyncInfo {
    writes: Vec<WriteRange>,
    /// old block infos to unreference when the next sync commits
    unrefs: Vec<BlockInfo>,
    recorded_unrefs: FxHashSet<BlockRef>,
}

impl SyncInfo {
    fn record_unref(&mut self, info: BlockInfo) {
        if info.encoded_size > 0 && self.recorded_unrefs.insert(info.ptr.block_ref()) {
            self.unrefs.push(info);
        }
    }
}

#[derive(Default)]
struct BlockStates {
    sync_states: FxHashMap<BlockRef, FileSyncState>,
    deferred: Vec<DeferredOp>,
    dirty_files: FxHashMap<NodeId, SyncInfo>,
    /// dirty directory entries not yet folded into their parents
    de_cache: FxHashMap<NodeId, DirEntry>,
}

struct HeadState {
    md: MdWithId,
    branch: BranchId,
    staged: bool,
}

impl HeadState {
    fn folder_branch(&self, tlf: TlfId) -> FolderBranch {
        FolderBranch { tlf, branch: self.branch }
    }
}

/// The per-folder client engine: the write/sync pipeline, the update
/// pipeline and conflict-resolution scheduling, glued together by three
/// lock levels taken strictly in order (`mdWriter` -> `head` -> `blocks`).
pub struct FolderEngine {
    config: Arc<VeilConfig>,
    tlf: TlfId,
    handle: TlfHandle,
    root: NodeId,

    md_writer: Mutex<()>,
    head: RwLock<HeadState>,
    blocks: RwLock<BlockStates>,

    nodes: NodeCache,
    observers: SyncRwLock<Vec<Arc<dyn Observer>>>,

    shutdown: CancellationToken,
    force_sync_tx: mpsc::Sender<()>,
    cr_tx: mpsc::UnboundedSender<(Revision, Revision)>,
    head_rev_tx: watch::Sender<Revision>,

    updates_enabled: AtomicBool,
    cr_enabled: AtomicBool,
}

impl std::fmt::Debug for FolderEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FolderEngine")
            .field("tlf", &self.tlf)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl FolderEngine {
    /// Open (or create, for a writer) the folder named by `handle`, spawn
    /// the background update/flush/resolve tasks and return the engine.
    pub async fn new(config: Arc<VeilConfig>, handle: TlfHandle) -> VeilResult<Arc<Self>> {
        let mdops = config.mdops();
        let (tlf, merged_head) = mdops.get_for_handle(&handle).await?;

        // a device restarting mid-conflict finds its unmerged branch first
        let unmerged_head = mdops
            .get_for_tlf(tlf, BranchId::NULL, crate::server::MdStatus::Unmerged)
            .await?;
        let (head, staged, branch) = match unmerged_head {
            Some(md) => {
                let branch = md.md.branch();
                (md, true, branch)
            }
            None => {
                let head = match merged_head {
                    Some(md) => md,
                    None => Self::create_initial_md(&config, tlf, &handle).await?,
                };
                (head, false, BranchId::NULL)
            }
        };
        ensure!(head.md.is_readable(), VeilError::RekeyRead(handle.to_string()));

        let nodes = NodeCache::new();
        let root_ptr = head.md.data.dir.ptr();
        let root = nodes.get_or_create(root_ptr, handle.canonical_name().to_owned(), None);

        let (force_sync_tx, force_sync_rx) = mpsc::channel(1);
        let (cr_tx, cr_rx) = mpsc::unbounded_channel();
        let (head_rev_tx, _) = watch::channel(head.md.revision);

        let updates_enabled = AtomicBool::new(config.default_updates_enabled());
        let cr_enabled = AtomicBool::new(config.default_cr_enabled());
        let engine = Arc::new(Self {
            config,
            tlf,
            handle,
            root,
            md_writer: Mutex::new(()),
            head: RwLock::new(HeadState { md: head, branch, staged }),
            blocks: RwLock::new(BlockStates::default()),
            nodes,
            observers: SyncRwLock::new(Vec::new()),
            shutdown: CancellationToken::new(),
            force_sync_tx,
            cr_tx,
            head_rev_tx,
            updates_enabled,
            cr_enabled,
        });

        tokio::spawn(crate::updater::run(Arc::clone(&engine)));
        tokio::spawn(crate::flusher::run(Arc::clone(&engine), force_sync_rx));
        tokio::spawn(crate::resolver::run(Arc::clone(&engine), cr_rx));

        if staged {
            // pick up where the conflict left off
            let _ = engine.cr_tx.send((
                engine.head.read().await.md.md.revision,
                Revision::UNINITIALIZED,
            ));
        }
        Ok(engine)
    }

    async fn create_initial_md(
        config: &Arc<VeilConfig>,
        tlf: TlfId,
        handle: &TlfHandle,
    ) -> VeilResult<MdWithId> {
        debug!("initializing folder {} ({})", handle, tlf);
        ensure!(
            handle.is_writer(config.uid()),
            VeilError::WriteAccess(config.uid().to_string(), handle.to_string())
        );
        let mut md = RootMetadata::new(tlf, handle);
        if !tlf.is_public() {
            config.kmgr().rekey(&mut md, handle).await?;
        }

        let root_block = Block::empty_dir();
        let (id, _plain, ready) = config.bops().ready(&md, &root_block).await?;
        let root_ptr = BlockPointer::new_first(id, md.latest_key_gen(), config.uid());
        let info = BlockInfo { ptr: root_ptr, encoded_size: ready.encoded_size() };
        let now = now_nanos();
        md.data.dir = DirEntry::new(info, EntryInfo::new(EntryType::Dir, now));
        md.add_op(Op::create(
            BlockUpdate::new(BlockPointer::default(), root_ptr),
            "",
            EntryType::Dir,
        ));
        md.add_ref_block(info);

        let mut state = BlockPutState::new();
        state.add_new_block(root_ptr, root_block.clone(), ready);
        let cancel = CancellationToken::new();
        let (_, put_result) = config.bops().do_block_puts(&cancel, tlf, &state).await;
        put_result?;

        let id = config.mdops().put(&mut md).await?;
        config.block_cache().put(root_ptr, tlf, root_block, BlockLifetime::Permanent);
        Ok(MdWithId { md, id })
    }

    // ---- lock helpers --------------------------------------------------

    async fn md_writer_locked(&self, ls: &mut LockState) -> tokio::sync::MutexGuard<'_, ()> {
        debug_assert_eq!(ls.0, 0, "mdWriterLock must be the first level taken");
        ls.0 |= L_MD_WRITER;
        self.md_writer.lock().await
    }

    async fn head_read(&self, ls: &mut LockState) -> tokio::sync::RwLockReadGuard<'_, HeadState> {
        debug_assert_eq!(ls.0 & (L_HEAD | L_BLOCKS), 0, "headLock taken out of order");
        ls.0 |= L_HEAD;
        self.head.read().await
    }

    async fn head_write(&self, ls: &mut LockState) -> tokio::sync::RwLockWriteGuard<'_, HeadState> {
        debug_assert_eq!(ls.0 & (L_HEAD | L_BLOCKS), 0, "headLock taken out of order");
        ls.0 |= L_HEAD;
        self.head.write().await
    }

    async fn blocks_read(&self, ls: &mut LockState) -> tokio::sync::RwLockReadGuard<'_, BlockStates> {
        debug_assert_eq!(ls.0 & L_BLOCKS, 0, "blockLock is the lowest level");
        ls.0 |= L_BLOCKS;
        self.blocks.read().await
    }

    async fn blocks_write(&self, ls: &mut LockState) -> tokio::sync::RwLockWriteGuard<'_, BlockStates> {
        debug_assert_eq!(ls.0 & L_BLOCKS, 0, "blockLock is the lowest level");
        ls.0 |= L_BLOCKS;
        self.blocks.write().await
    }

    // ---- accessors -----------------------------------------------------

    #[inline]
    pub fn root(&self) -> NodeId {
        self.root
    }

    #[inline]
    pub fn tlf(&self) -> TlfId {
        self.tlf
    }

    #[inline]
    pub fn handle(&self) -> &TlfHandle {
        &self.handle
    }

    pub(crate) fn config(&self) -> &Arc<VeilConfig> {
        &self.config
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn cr_enabled(&self) -> bool {
        self.cr_enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn updates_enabled(&self) -> bool {
        self.updates_enabled.load(Ordering::SeqCst)
    }

    /// watch the head revision; fires on every install (test support and
    /// status surfaces)
    pub fn head_rev_receiver(&self) -> watch::Receiver<Revision> {
        self.head_rev_tx.subscribe()
    }

    pub fn register_observer(&self, observer: Arc<dyn Observer>) {
        self.observers.write().push(observer);
    }

    /// test hook: stop applying incoming merged updates
    pub fn pause_updates(&self) {
        self.updates_enabled.store(false, Ordering::SeqCst);
    }

    pub fn resume_updates(&self) {
        self.updates_enabled.store(true, Ordering::SeqCst);
    }

    /// test hook: keep conflicts staged instead of resolving them
    pub fn set_cr_enabled(&self, enabled: bool) {
        self.cr_enabled.store(enabled, Ordering::SeqCst);
        if enabled {
            let _ = self.cr_tx.send((Revision::UNINITIALIZED, Revision::UNINITIALIZED));
        }
    }

    pub async fn shutdown(&self) -> VeilResult<()> {
        self.shutdown.cancel();
        let blocks = self.blocks.read().await;
        ensure!(blocks.dirty_files.is_empty(), VeilError::DirtyWhileShutdown);
        Ok(())
    }

    pub async fn status(&self) -> FolderStatus {
        let head = self.head.read().await;
        let blocks = self.blocks.read().await;
        let fb = head.folder_branch(self.tlf);
        FolderStatus {
            staged: head.staged,
            branch: head.branch,
            head_revision: head.md.md.revision,
            head_writer: head.md.md.last_modifying_writer,
            dirty_files: blocks
                .dirty_files
                .keys()
                .map(|&node| self.nodes.path_from_node(fb, node).to_string())
                .collect(),
        }
    }

    // ---- block fetching ------------------------------------------------

    async fn fetch_block(
        &self,
        md: &RootMetadata,
        branch: BranchId,
        ptr: BlockPointer,
    ) -> VeilResult<Block> {
        if let Some(block) = self.config.block_cache().get(ptr, branch) {
            return Ok(block);
        }
        let block = self.config.bops().get(md, ptr).await?;
        self.config.block_cache().put(ptr, self.tlf, block.clone(), BlockLifetime::Transient);
        Ok(block)
    }

    pub(crate) async fn fetch_dir_block(
        &self,
        md: &RootMetadata,
        branch: BranchId,
        ptr: BlockPointer,
    ) -> VeilResult<DirBlock> {
        self.fetch_block(md, branch, ptr).await?.into_dir()
    }

    /// conflict resolution serializes against every other MD producer
    pub(crate) async fn md_writer_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.md_writer.lock().await
    }

    /// the directory entry describing `node`, local edits first
    async fn entry_for(
        &self,
        blocks: &BlockStates,
        head: &HeadState,
        node: NodeId,
    ) -> VeilResult<DirEntry> {
        if let Some(entry) = blocks.de_cache.get(&node) {
            return Ok(entry.clone());
        }
        if node == self.root {
            return Ok(head.md.md.data.dir.clone());
        }
        let fb = head.folder_branch(self.tlf);
        let path = self.nodes.path_from_node(fb, node);
        ensure!(path.is_valid() && path.depth() > 1, VeilError::InvalidPath);
        let parent_ptr = path.nodes[path.depth() - 2].ptr;
        let dir = self.fetch_dir_block(&head.md.md, head.branch, parent_ptr).await?;
        dir.children
            .get(path.tail_name())
            .cloned()
            .ok_or_else(|| anyhow!(VeilError::NoSuchName(path.tail_name().to_owned())))
    }

    // ---- reads ---------------------------------------------------------

    pub async fn lookup(
        &self,
        dir: NodeId,
        name: &str,
    ) -> VeilResult<(Option<NodeId>, EntryInfo)> {
        trace!("FolderEngine::lookup(dir: {:?}, name: {})", dir, name);
        let mut ls = LockState::new();
        let head = self.head_read(&mut ls).await;
        let dir_ptr = self.nodes.pointer_for(dir);
        let dir_block = self.fetch_dir_block(&head.md.md, head.branch, dir_ptr).await?;
        let entry = dir_block
            .children
            .get(name)
            .ok_or_else(|| anyhow!(VeilError::NoSuchName(name.to_owned())))?;

        let node = match entry.entry.entry_type {
            EntryType::Sym => None,
            _ => Some(self.nodes.get_or_create(entry.ptr(), name, Some(dir))),
        };
        Ok((node, entry.entry.clone()))
    }

    /// every child of a directory with its entry info
    pub async fn children(&self, dir: NodeId) -> VeilResult<Vec<(String, EntryInfo)>> {
        let mut ls = LockState::new();
        let head = self.head_read(&mut ls).await;
        let dir_ptr = self.nodes.pointer_for(dir);
        let dir_block = self.fetch_dir_block(&head.md.md, head.branch, dir_ptr).await?;
        Ok(dir_block
            .children
            .into_iter()
            .map(|(name, entry)| (name, entry.entry))
            .collect())
    }

    /// Read up to `len` bytes at `off`. Dirty state always wins over clean
    /// blocks, including mid-sync copies.
    pub async fn read(&self, file: NodeId, off: u64, len: usize) -> VeilResult<Vec<u8>> {
        trace!("FolderEngine::read(file: {:?}, off: {}, len: {})", file, off, len);
        let mut ls = LockState::new();
        let head = self.head_read(&mut ls).await;
        let blocks = self.blocks_read(&mut ls).await;

        let entry = self.entry_for(&blocks, &head, file).await?;
        let size = entry.entry.size;
        if off >= size {
            return Ok(Vec::new());
        }
        let want = len.min((size - off) as usize);

        let file_ptr = self.nodes.pointer_for(file);
        let branch = head.branch;
        let top = self.fetch_block(&head.md.md, branch, file_ptr).await?.into_file()?;

        let mut out = Vec::with_capacity(want);
        if !top.is_indirect {
            let start = off as usize;
            let end = (start + want).min(top.contents.len());
            if start < top.contents.len() {
                out.extend_from_slice(&top.contents[start..end]);
            }
        } else {
            let mut pos = off;
            let end = off + want as u64;
            while pos < end {
                let idx = top.indirect_index_for(pos);
                let iptr = &top.indirect_ptrs[idx];
                let child =
                    self.fetch_block(&head.md.md, branch, iptr.info.ptr).await?.into_file()?;
                let into = (pos - iptr.off) as usize;
                if into >= child.contents.len() {
                    break;
                }
                let n = child.contents.len().min(into + (end - pos) as usize) - into;
                out.extend_from_slice(&child.contents[into..into + n]);
                pos += n as u64;
                if idx + 1 >= top.indirect_ptrs.len() {
                    break;
                }
            }
        }
        Ok(out)
    }

    // ---- write path ----------------------------------------------------

    pub async fn write(&self, file: NodeId, data: &[u8], off: u64) -> VeilResult<()> {
        trace!("FolderEngine::write(file: {:?}, off: {}, len: {})", file, off, data.len());
        // park before taking any locks if dirty pressure is too high
        self.config.block_cache().wait_for_dirty_room().await;

        let mut ls = LockState::new();
        let head = self.head_read(&mut ls).await;
        let mut blocks = self.blocks_write(&mut ls).await;
        self.apply_write_locked(&mut blocks, &head, file, data, off).await?;
        drop(blocks);
        drop(head);

        if self.config.block_cache().dirty_bytes() > DIRTY_BYTES_THRESHOLD {
            let _ = self.force_sync_tx.try_send(());
        }
        self.notify_local(file, WriteRange { off, len: data.len() as u64 });
        Ok(())
    }

    pub async fn truncate(&self, file: NodeId, size: u64) -> VeilResult<()> {
        trace!("FolderEngine::truncate(file: {:?}, size: {})", file, size);
        self.config.block_cache().wait_for_dirty_room().await;

        let mut ls = LockState::new();
        let head = self.head_read(&mut ls).await;
        let mut blocks = self.blocks_write(&mut ls).await;
        self.apply_truncate_locked(&mut blocks, &head, file, size).await?;
        drop(blocks);
        drop(head);
        self.notify_local(file, WriteRange { off: size, len: 0 });
        Ok(())
    }

    /// Write with `blocks` already write-held. Also used to replay parked
    /// writes once a sync finishes; by then the in-flight markers are
    /// gone, so replays take the plain path.
    async fn apply_write_locked(
        &self,
        blocks: &mut BlockStates,
        head: &HeadState,
        file: NodeId,
        data: &[u8],
        off: u64,
    ) -> VeilResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let md = &head.md.md;
        let branch = head.branch;
        let splitter = self.config.splitter();
        let bcache = self.config.block_cache();
        let block_size = splitter.max_block_size as u64;

        let entry = self.entry_for(blocks, head, file).await?;
        let file_ptr = self.nodes.pointer_for(file);

        let mut top = self
            .fetch_block(md, branch, file_ptr)
            .await?
            .into_file()
            .map_err(|_| anyhow!(VeilError::InvalidPath))?;

        let top_syncing = blocks.sync_states.contains_key(&file_ptr.block_ref());
        let mut deferred = top_syncing;

        let end = off + data.len() as u64;
        // the top block must go indirect before any byte lands past the
        // first boundary
        if !top.is_indirect && end > block_size {
            let contents = std::mem::take(&mut top.contents);
            let child_ptr = self.temp_ptr(md);
            let child = FileBlock { contents, ..Default::default() };
            bcache.put_dirty(child_ptr, branch, Block::File(child));
            top = FileBlock::new_indirect(vec![IndirectFilePtr {
                info: BlockInfo::dirty(child_ptr),
                off: 0,
            }]);
        }

        if !top.is_indirect {
            // single-block file: the top block is the data block
            if !bcache.is_dirty(file_ptr, branch) {
                blocks
                    .dirty_files
                    .entry(file)
                    .or_default()
                    .record_unref(entry.info);
            }
            let mut block = top;
            splitter.copy_until_split(&mut block, off as usize, data);
            bcache.put_dirty(file_ptr, branch, Block::File(block));
        } else {
            // extend with zero blocks up to the target offset
            while (top.indirect_ptrs.len() as u64) * block_size < end {
                let next_off = top.indirect_ptrs.len() as u64 * block_size;
                let child_ptr = self.temp_ptr(md);
                bcache.put_dirty(child_ptr, branch, Block::File(FileBlock::default()));
                top.indirect_ptrs
                    .push(IndirectFilePtr { info: BlockInfo::dirty(child_ptr), off: next_off });
            }

            let mut written = 0usize;
            while written < data.len() {
                let pos = off + written as u64;
                let idx = (pos / block_size) as usize;
                let iptr = top.indirect_ptrs[idx];
                let child_state = blocks.sync_states.get(&iptr.info.ptr.block_ref()).copied();

                let mut child = match bcache.get(iptr.info.ptr, branch) {
                    Some(block) => block.into_file()?,
                    None => self.fetch_block(md, branch, iptr.info.ptr).await?.into_file()?,
                };

                match child_state {
                    Some(FileSyncState::SyncingNotDirty) => {
                        // copy-on-write: the clean copy is mid-upload
                        blocks
                            .sync_states
                            .insert(iptr.info.ptr.block_ref(), FileSyncState::SyncingAndDirty);
                        deferred = true;
                    }
                    Some(FileSyncState::SyncingAndDirty) => deferred = true,
                    None => {
                        if !bcache.is_dirty(iptr.info.ptr, branch) {
                            blocks
                                .dirty_files
                                .entry(file)
                                .or_default()
                                .record_unref(iptr.info);
                        }
                    }
                }

                let into = (pos - iptr.off) as usize;
                let n = splitter.copy_until_split(&mut child, into, &data[written..]);
                ensure!(n > 0, "write made no progress");
                bcache.put_dirty(iptr.info.ptr, branch, Block::File(child));
                written += n;
            }
            // the top block itself is dirty now too
            bcache.put_dirty(file_ptr, branch, Block::File(top));
        }

        // update the cached entry so readers observe the new size at once
        let now = now_nanos();
        let mut new_entry = blocks.de_cache.get(&file).cloned().unwrap_or(entry);
        new_entry.entry.size = new_entry.entry.size.max(end);
        new_entry.entry.mtime = now;
        blocks.de_cache.insert(file, new_entry);

        if deferred {
            // a sync holds these blocks; queue the write for replay once
            // it finishes
            blocks.deferred.push(DeferredOp {
                node: file,
                kind: DeferredKind::Write { data: data.to_vec(), off },
            });
            return Ok(());
        }
        blocks
            .dirty_files
            .entry(file)
            .or_default()
            .writes
            .push(WriteRange { off, len: data.len() as u64 });
        Ok(())
    }

    async fn apply_truncate_locked(
        &self,
        blocks: &mut BlockStates,
        head: &HeadState,
        file: NodeId,
        size: u64,
    ) -> VeilResult<()> {
        let md = &head.md.md;
        let branch = head.branch;
        let bcache = self.config.block_cache();
        let block_size = self.config.splitter().max_block_size as u64;

        let entry = self.entry_for(blocks, head, file).await?;
        let old_size = blocks.de_cache.get(&file).map_or(entry.entry.size, |e| e.entry.size);

        if size > old_size {
            // extending truncates degenerate to a zero write at the end
            let pad = vec![0u8; (size - old_size) as usize];
            return self.apply_write_locked(blocks, head, file, &pad, old_size).await;
        }

        let file_ptr = self.nodes.pointer_for(file);
        let mut top = self.fetch_block(md, branch, file_ptr).await?.into_file()?;
        let top_syncing = blocks.sync_states.contains_key(&file_ptr.block_ref());

        if !bcache.is_dirty(file_ptr, branch) {
            blocks.dirty_files.entry(file).or_default().record_unref(entry.info);
        }

        if top.is_indirect {
            let keep = ((size + block_size - 1) / block_size).max(1) as usize;
            for dropped in top.indirect_ptrs.drain(keep.min(top.indirect_ptrs.len())..) {
                if let Some(info) = blocks.dirty_files.get_mut(&file) {
                    info.record_unref(dropped.info);
                }
                bcache.delete_dirty(dropped.info.ptr, branch);
            }
            if let Some(last) = top.indirect_ptrs.last() {
                let within = (size - last.off) as usize;
                let mut child = match bcache.get(last.info.ptr, branch) {
                    Some(block) => block.into_file()?,
                    None => self.fetch_block(md, branch, last.info.ptr).await?.into_file()?,
                };
                child.contents.truncate(within);
                if let Some(info) = blocks.dirty_files.get_mut(&file) {
                    info.record_unref(last.info);
                }
                bcache.put_dirty(last.info.ptr, branch, Block::File(child));
            }
        } else {
            top.contents.truncate(size as usize);
        }
        bcache.put_dirty(file_ptr, branch, Block::File(top));

        let mut new_entry = blocks.de_cache.get(&file).cloned().unwrap_or(entry);
        new_entry.entry.size = size;
        new_entry.entry.mtime = now_nanos();
        blocks.de_cache.insert(file, new_entry);

        if top_syncing {
            blocks
                .deferred
                .push(DeferredOp { node: file, kind: DeferredKind::Truncate { size } });
            return Ok(());
        }
        let info = blocks.dirty_files.entry(file).or_default();
        info.writes.push(WriteRange { off: size, len: 0 });
        Ok(())
    }

    fn temp_ptr(&self, md: &RootMetadata) -> BlockPointer {
        BlockPointer::new_first(BlockId::new_temporary(), md.latest_key_gen(), self.config.uid())
    }

    // ---- tree rebuilding ----------------------------------------------

    /// Ready every modified block and rebuild all its ancestors up to the
    /// root, folding updated child entries into each parent along the way.
    /// Returns the new root pointer; all readied blocks land in `state`.
    pub(crate) async fn sync_tree(
        &self,
        md_old: &RootMetadata,
        branch: BranchId,
        md: &mut RootMetadata,
        modified: Vec<(VeilPath, Block, Option<DirEntry>)>,
        state: &mut BlockPutState,
    ) -> VeilResult<BlockPointer> {
        let bops = self.config.bops();
        let mut pending: Vec<(VeilPath, Block, Option<DirEntry>)> = modified;

        loop {
            // deepest first so parents absorb every child update
            pending.sort_by_key(|(path, ..)| path.depth());
            let (path, block, entry_override) = match pending.pop() {
                Some(deepest) => deepest,
                None => bail!("sync_tree requires at least one modified block"),
            };

            let (id, _plain, ready) = bops.ready(md, &block).await?;
            let new_ptr = BlockPointer::new_first(id, md.latest_key_gen(), self.config.uid());
            let new_info = BlockInfo { ptr: new_ptr, encoded_size: ready.encoded_size() };
            state.add_new_block(new_ptr, block, ready);

            if path.depth() == 1 {
                let old_info = md_old.data.dir.info;
                md.add_update_block(old_info, new_info);
                md.data.dir = DirEntry { info: new_info, entry: md_old.data.dir.entry.clone() };
                ensure!(pending.is_empty(), "orphan modified block outside the root's tree");
                return Ok(new_ptr);
            }

            let parent_path = path.parent_path();
            let name = path.tail_name().to_owned();

            // the parent may itself already be pending modification
            let existing = pending
                .iter()
                .position(|(p, ..)| p.nodes.len() == parent_path.nodes.len()
                    && p.nodes.iter().zip(&parent_path.nodes).all(|(a, b)| a.name == b.name));
            let (parent_path, mut parent_block, parent_override) = match existing {
                Some(i) => {
                    let (p, b, o) = pending.remove(i);
                    (p, b.into_dir()?, o)
                }
                None => {
                    let ptr = parent_path.tail_pointer();
                    let dir = self.fetch_dir_block(md_old, branch, ptr).await?;
                    (parent_path, dir, None)
                }
            };

            let old_info = parent_block
                .children
                .get(&name)
                .map(|e| e.info)
                .unwrap_or_else(|| BlockInfo::dirty(path.tail_pointer()));
            md.add_update_block(old_info, new_info);

            let mut entry = match entry_override {
                Some(entry) => entry,
                None => parent_block
                    .children
                    .get(&name)
                    .cloned()
                    .unwrap_or_else(|| DirEntry::new(new_info, EntryInfo::new(EntryType::Dir, now_nanos()))),
            };
            entry.info = new_info;
            parent_block.children.insert(name, entry);
            pending.push((parent_path, Block::Dir(parent_block), parent_override));
        }
    }

    // ---- MD finalization ----------------------------------------------

    /// Upload the put state, push the metadata, and install the new head.
    /// A merged-branch conflict forks onto a fresh unmerged branch and
    /// schedules conflict resolution instead of failing.
    async fn finalize_md_write(
        &self,
        cancel: &CancellationToken,
        mut md: RootMetadata,
        state: BlockPutState,
        notifications: Vec<NodeChange>,
    ) -> VeilResult<MdWithId> {
        let tlf = self.tlf;
        let splitter = self.config.splitter();

        // oversized op logs move into their own block
        let saved_ops = md.data.changes.ops.clone();
        let mut state = state;
        if !splitter.should_embed_changes(md.data.changes.encoded_len()?) {
            let changes_block =
                Block::File(FileBlock { contents: crate::codec::encode(&saved_ops)?, ..Default::default() });
            let (id, _plain, ready) = self.config.bops().ready(&md, &changes_block).await?;
            let ptr = BlockPointer::new_first(id, md.latest_key_gen(), self.config.uid());
            let info = BlockInfo { ptr, encoded_size: ready.encoded_size() };
            state.add_new_block(ptr, changes_block, ready);
            md.data.changes.info = Some(info);
            md.data.changes.ops = Vec::new();
            debug!("externalized {} ops into block {}", saved_ops.len(), ptr);
        }

        let (recoverable, put_result) =
            self.config.bops().do_block_puts(cancel, tlf, &state).await;
        if let Err(err) = put_result {
            // a recoverable race means some other client archived or
            // deleted a block we tried to reuse; forget its dedup hint so
            // the retry uploads fresh bytes instead
            for file_block in recoverable {
                self.config
                    .block_cache()
                    .delete_known_ptr(tlf, &Block::File(file_block));
            }
            return Err(err);
        }

        let mut staged_now;
        let branch_now;
        {
            let head = self.head.read().await;
            staged_now = head.staged;
            branch_now = head.branch;
        }

        let id = if staged_now {
            md.writer_md.branch = branch_now;
            md.flags.insert(MdFlags::UNMERGED);
            self.config.mdops().put(&mut md).await?
        } else {
            match self.config.mdops().put(&mut md).await {
                Ok(id) => id,
                Err(err) if err.is_conflict_err() => {
                    // someone beat us to this revision: fork and resolve
                    let branch = BranchId::new_random();
                    warn!(
                        "revision {} conflicted on {}; forking to branch {}",
                        md.revision, tlf, branch
                    );
                    md.writer_md.branch = branch;
                    md.flags.insert(MdFlags::UNMERGED);
                    let id = self.config.mdops().put(&mut md).await?;
                    staged_now = true;
                    let _ = self.cr_tx.send((md.revision, Revision::UNINITIALIZED));
                    id
                }
                Err(err) => return Err(err),
            }
        };

        // keep the op log embedded in the in-memory head
        md.data.changes.ops = saved_ops;
        md.data.changes.info = None;

        let new_head = MdWithId { md, id };
        {
            let mut head = self.head.write().await;
            head.branch = new_head.md.branch();
            head.staged = staged_now;
            head.md = new_head.clone();
        }
        let _ = self.head_rev_tx.send(new_head.md.revision);

        // clean blocks become visible under their new pointers
        for entry in state.iter() {
            let lifetime = match entry.block {
                Block::Dir(..) => BlockLifetime::Permanent,
                Block::File(..) => BlockLifetime::Transient,
            };
            self.config.block_cache().put(entry.ptr, tlf, entry.block.clone(), lifetime);
        }
        for op in &new_head.md.data.changes.ops {
            for update in op.all_updates() {
                self.nodes.update_pointer(update.unref.block_ref(), update.new_ref);
            }
        }

        // archive what this revision unreferenced, off the hot path
        let unrefs: Vec<BlockPointer> =
            new_head.md.data.changes.ops.iter().flat_map(|op| op.unrefs().to_vec()).collect();
        if !unrefs.is_empty() {
            let config = Arc::clone(&self.config);
            tokio::spawn(async move {
                if let Err(err) = config.bops().archive(tlf, &unrefs).await {
                    warn!("background block archival failed: {}", err);
                }
            });
        }

        self.notify_batch(&notifications);
        Ok(new_head)
    }

    // ---- directory mutations ------------------------------------------

    async fn create_entry(
        &self,
        dir: NodeId,
        name: &str,
        entry_type: EntryType,
        sym_path: Option<String>,
    ) -> VeilResult<Option<NodeId>> {
        check_entry_name(name)?;
        let mut ls = LockState::new();
        let _mdw = self.md_writer_locked(&mut ls).await;
        let (md_old, head_id, branch) = {
            let head = self.head_read(&mut ls).await;
            (head.md.md.clone(), head.md.id, head.branch)
        };
        let fb = FolderBranch { tlf: self.tlf, branch };
        let dir_path = self.nodes.path_from_node(fb, dir);
        ensure!(dir_path.is_valid(), VeilError::InvalidPath);

        let mut dir_block =
            self.fetch_dir_block(&md_old, branch, dir_path.tail_pointer()).await?;
        ensure!(
            !dir_block.children.contains_key(name),
            VeilError::NameExists(name.to_owned())
        );

        let mut md = md_old.make_successor(head_id);
        md.add_op(Op::create(
            BlockUpdate::new(dir_path.tail_pointer(), dir_path.tail_pointer()),
            name,
            entry_type,
        ));

        let now = now_nanos();
        let mut state = BlockPutState::new();
        let child_info = match entry_type {
            EntryType::Sym => BlockInfo::default(),
            EntryType::Dir => {
                let block = Block::empty_dir();
                let (id, _plain, ready) = self.config.bops().ready(&md, &block).await?;
                let ptr = BlockPointer::new_first(id, md.latest_key_gen(), self.config.uid());
                let info = BlockInfo { ptr, encoded_size: ready.encoded_size() };
                state.add_new_block(ptr, block, ready);
                md.add_ref_block(info);
                info
            }
            EntryType::File | EntryType::Exec => {
                let block = Block::empty_file();
                let (id, _plain, ready) = self.config.bops().ready(&md, &block).await?;
                let ptr = BlockPointer::new_first(id, md.latest_key_gen(), self.config.uid());
                let info = BlockInfo { ptr, encoded_size: ready.encoded_size() };
                state.add_new_block(ptr, block, ready);
                md.add_ref_block(info);
                info
            }
        };
        let mut entry_info = EntryInfo::new(entry_type, now);
        entry_info.sym_path = sym_path.unwrap_or_default();
        dir_block.children.insert(name.to_owned(), DirEntry::new(child_info, entry_info));

        self.sync_tree(
            &md_old,
            branch,
            &mut md,
            vec![(dir_path.clone(), Block::Dir(dir_block), None)],
            &mut state,
        )
        .await?;

        let notification = NodeChange {
            node: Some(dir),
            dir_updated: vec![name.to_owned()],
            file_updated: Vec::new(),
        };
        self.finalize_md_write(&self.shutdown.child_token(), md, state, vec![notification])
            .await?;

        Ok(match entry_type {
            EntryType::Sym => None,
            _ => Some(self.nodes.get_or_create(child_info.ptr, name, Some(dir))),
        })
    }

    pub async fn create_dir(&self, dir: NodeId, name: &str) -> VeilResult<NodeId> {
        trace!("FolderEngine::create_dir(dir: {:?}, name: {})", dir, name);
        Ok(self.create_entry(dir, name, EntryType::Dir, None).await?.expect("dir has a node"))
    }

    pub async fn create_file(&self, dir: NodeId, name: &str, exec: bool) -> VeilResult<NodeId> {
        trace!("FolderEngine::create_file(dir: {:?}, name: {})", dir, name);
        let entry_type = if exec { EntryType::Exec } else { EntryType::File };
        Ok(self.create_entry(dir, name, entry_type, None).await?.expect("file has a node"))
    }

    pub async fn create_link(&self, dir: NodeId, name: &str, target: &str) -> VeilResult<()> {
        trace!("FolderEngine::create_link(dir: {:?}, name: {})", dir, name);
        self.create_entry(dir, name, EntryType::Sym, Some(target.to_owned())).await?;
        Ok(())
    }

    /// collect every pointer a removed entry holds, so the rm op can
    /// unreference them
    async fn unref_entry(
        &self,
        md: &mut RootMetadata,
        md_old: &RootMetadata,
        branch: BranchId,
        entry: &DirEntry,
    ) -> VeilResult<()> {
        if entry.entry.entry_type == EntryType::Sym {
            return Ok(());
        }
        md.add_unref_block(entry.info);
        if entry.entry.entry_type.is_file() && entry.info.ptr.is_valid() {
            if let Ok(Block::File(top)) = self.fetch_block(md_old, branch, entry.ptr()).await {
                if top.is_indirect {
                    for iptr in &top.indirect_ptrs {
                        md.add_unref_block(iptr.info);
                    }
                }
            }
        }
        Ok(())
    }

    async fn remove_entry_inner(&self, dir: NodeId, name: &str, expect_dir: bool) -> VeilResult<()> {
        let mut ls = LockState::new();
        let _mdw = self.md_writer_locked(&mut ls).await;
        let (md_old, head_id, branch) = {
            let head = self.head_read(&mut ls).await;
            (head.md.md.clone(), head.md.id, head.branch)
        };
        let fb = FolderBranch { tlf: self.tlf, branch };
        let dir_path = self.nodes.path_from_node(fb, dir);
        let mut dir_block =
            self.fetch_dir_block(&md_old, branch, dir_path.tail_pointer()).await?;
        let entry = dir_block
            .children
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!(VeilError::NoSuchName(name.to_owned())))?;

        if expect_dir {
            ensure!(entry.entry.entry_type.is_dir(), VeilError::NoSuchName(name.to_owned()));
            let child = self.fetch_dir_block(&md_old, branch, entry.ptr()).await?;
            ensure!(child.children.is_empty(), "directory `{}` is not empty", name);
        } else {
            ensure!(!entry.entry.entry_type.is_dir(), VeilError::NoSuchName(name.to_owned()));
        }

        let mut md = md_old.make_successor(head_id);
        md.add_op(Op::rm(
            BlockUpdate::new(dir_path.tail_pointer(), dir_path.tail_pointer()),
            name,
            entry.entry.entry_type,
        ));
        self.unref_entry(&mut md, &md_old, branch, &entry).await?;
        dir_block.children.remove(name);

        let mut state = BlockPutState::new();
        self.sync_tree(
            &md_old,
            branch,
            &mut md,
            vec![(dir_path.clone(), Block::Dir(dir_block), None)],
            &mut state,
        )
        .await?;

        let notification = NodeChange {
            node: Some(dir),
            dir_updated: vec![name.to_owned()],
            file_updated: Vec::new(),
        };
        self.finalize_md_write(&self.shutdown.child_token(), md, state, vec![notification])
            .await?;

        // the node, if cached, lives on unlinked until forgotten
        if entry.info.ptr.is_valid() {
            let removed_path = dir_path.child_path(name, entry.ptr());
            self.nodes.unlink(entry.ptr().block_ref(), removed_path);
        }
        let mut blocks = self.blocks.write().await;
        if let Some(node) = self.nodes.get(entry.ptr().block_ref()) {
            blocks.dirty_files.remove(&node);
            blocks.de_cache.remove(&node);
        }
        Ok(())
    }

    pub async fn remove_file(&self, dir: NodeId, name: &str) -> VeilResult<()> {
        trace!("FolderEngine::remove_file(dir: {:?}, name: {})", dir, name);
        self.remove_entry_inner(dir, name, false).await
    }

    pub async fn remove_dir(&self, dir: NodeId, name: &str) -> VeilResult<()> {
        trace!("FolderEngine::remove_dir(dir: {:?}, name: {})", dir, name);
        self.remove_entry_inner(dir, name, true).await
    }

    pub async fn rename(
        &self,
        old_dir: NodeId,
        old_name: &str,
        new_dir: NodeId,
        new_name: &str,
    ) -> VeilResult<()> {
        trace!(
            "FolderEngine::rename({:?}/{} -> {:?}/{})",
            old_dir, old_name, new_dir, new_name
        );
        check_entry_name(new_name)?;
        let mut ls = LockState::new();
        let _mdw = self.md_writer_locked(&mut ls).await;
        let (md_old, head_id, branch) = {
            let head = self.head_read(&mut ls).await;
            (head.md.md.clone(), head.md.id, head.branch)
        };
        let fb = FolderBranch { tlf: self.tlf, branch };
        let old_path = self.nodes.path_from_node(fb, old_dir);
        let new_path = self.nodes.path_from_node(fb, new_dir);
        let same_dir = old_dir == new_dir;

        let mut old_block =
            self.fetch_dir_block(&md_old, branch, old_path.tail_pointer()).await?;
        let entry = old_block
            .children
            .remove(old_name)
            .ok_or_else(|| anyhow!(VeilError::NoSuchName(old_name.to_owned())))?;

        let mut md = md_old.make_successor(head_id);
        let old_update = BlockUpdate::new(old_path.tail_pointer(), old_path.tail_pointer());
        let new_update = (!same_dir)
            .then(|| BlockUpdate::new(new_path.tail_pointer(), new_path.tail_pointer()));
        md.add_op(Op::rename(
            old_update,
            old_name,
            new_update,
            new_name,
            entry.ptr(),
            entry.entry.entry_type,
        ));

        let mut modified = Vec::new();
        if same_dir {
            let replaced = old_block.children.insert(new_name.to_owned(), entry.clone());
            if let Some(replaced) = replaced {
                self.unref_entry(&mut md, &md_old, branch, &replaced).await?;
            }
            modified.push((old_path.clone(), Block::Dir(old_block), None));
        } else {
            let mut new_block =
                self.fetch_dir_block(&md_old, branch, new_path.tail_pointer()).await?;
            let replaced = new_block.children.insert(new_name.to_owned(), entry.clone());
            if let Some(replaced) = replaced {
                self.unref_entry(&mut md, &md_old, branch, &replaced).await?;
            }
            modified.push((old_path.clone(), Block::Dir(old_block), None));
            modified.push((new_path.clone(), Block::Dir(new_block), None));
        }

        let mut state = BlockPutState::new();
        self.sync_tree(&md_old, branch, &mut md, modified, &mut state).await?;

        let notifications = vec![
            NodeChange {
                node: Some(old_dir),
                dir_updated: vec![old_name.to_owned()],
                file_updated: Vec::new(),
            },
            NodeChange {
                node: Some(new_dir),
                dir_updated: vec![new_name.to_owned()],
                file_updated: Vec::new(),
            },
        ];
        self.finalize_md_write(&self.shutdown.child_token(), md, state, notifications).await?;

        if entry.info.ptr.is_valid() {
            self.nodes.move_node(entry.ptr().block_ref(), new_dir, new_name);
        }
        Ok(())
    }

    async fn set_attr(&self, file: NodeId, attr: Attr, apply: impl FnOnce(&mut DirEntry)) -> VeilResult<()> {
        let mut ls = LockState::new();
        let _mdw = self.md_writer_locked(&mut ls).await;
        let (md_old, head_id, branch) = {
            let head = self.head_read(&mut ls).await;
            (head.md.md.clone(), head.md.id, head.branch)
        };
        let fb = FolderBranch { tlf: self.tlf, branch };
        let path = self.nodes.path_from_node(fb, file);
        ensure!(path.depth() > 1, VeilError::InvalidPath);
        let parent_path = path.parent_path();
        let name = path.tail_name().to_owned();

        let mut dir_block =
            self.fetch_dir_block(&md_old, branch, parent_path.tail_pointer()).await?;
        let mut entry = dir_block
            .children
            .get(&name)
            .cloned()
            .ok_or_else(|| anyhow!(VeilError::NoSuchName(name.clone())))?;
        apply(&mut entry);
        entry.entry.ctime = now_nanos();
        dir_block.children.insert(name.clone(), entry.clone());

        let mut md = md_old.make_successor(head_id);
        md.add_op(Op::set_attr(
            BlockUpdate::new(parent_path.tail_pointer(), parent_path.tail_pointer()),
            name.clone(),
            attr,
            entry.ptr(),
        ));

        let mut state = BlockPutState::new();
        self.sync_tree(
            &md_old,
            branch,
            &mut md,
            vec![(parent_path.clone(), Block::Dir(dir_block), None)],
            &mut state,
        )
        .await?;

        let notification = NodeChange {
            node: Some(file),
            dir_updated: vec![name],
            file_updated: Vec::new(),
        };
        self.finalize_md_write(&self.shutdown.child_token(), md, state, vec![notification])
            .await?;
        Ok(())
    }

    pub async fn set_exec(&self, file: NodeId, exec: bool) -> VeilResult<()> {
        trace!("FolderEngine::set_exec(file: {:?}, exec: {})", file, exec);
        self.set_attr(file, Attr::Exec, |entry| {
            entry.entry.entry_type = if exec { EntryType::Exec } else { EntryType::File };
        })
        .await
    }

    pub async fn set_mtime(&self, file: NodeId, mtime: i64) -> VeilResult<()> {
        trace!("FolderEngine::set_mtime(file: {:?})", file);
        self.set_attr(file, Attr::Mtime, |entry| entry.entry.mtime = mtime).await
    }

    // ---- sync ----------------------------------------------------------

    pub async fn sync(&self, file: NodeId) -> VeilResult<()> {
        self.sync_cancellable(file, &self.shutdown.child_token()).await
    }

    /// Sync one file's dirty state into a new metadata revision.
    pub async fn sync_cancellable(&self, file: NodeId, cancel: &CancellationToken) -> VeilResult<()> {
        trace!("FolderEngine::sync(file: {:?})", file);
        let mut ls = LockState::new();
        let _mdw = self.md_writer_locked(&mut ls).await;

        let (md_old, head_id, branch) = {
            let head = self.head_read(&mut ls).await;
            (head.md.md.clone(), head.md.id, head.branch)
        };
        let fb = FolderBranch { tlf: self.tlf, branch };

        // unlinked files have nowhere to sync to; drop their state
        if self.nodes.is_unlinked(file) {
            let mut blocks = self.blocks.write().await;
            blocks.dirty_files.remove(&file);
            blocks.de_cache.remove(&file);
            let ptr = self.nodes.pointer_for(file);
            self.config.block_cache().delete_dirty(ptr, branch);
            return Ok(());
        }

        let mut attempt = 0;
        loop {
            match self.sync_attempt(file, &md_old, head_id, branch, fb, cancel).await {
                Ok(_) => return Ok(()),
                Err(err) if err.is_recoverable_block_err() && attempt + 1 < MAX_SYNC_RETRIES => {
                    attempt += 1;
                    debug!("recoverable sync failure (attempt {}): {}", attempt, err);
                    continue;
                }
                Err(err) => {
                    // leave dirty state for a later retry, but clear the
                    // in-flight markers and parked writes
                    let mut blocks = self.blocks.write().await;
                    blocks.sync_states.clear();
                    blocks.deferred.clear();
                    return Err(err);
                }
            }
        }
    }

    /// One full sync pass; returns Ok(false) when there was nothing to do.
    async fn sync_attempt(
        &self,
        file: NodeId,
        md_old: &RootMetadata,
        head_id: crate::id::MdId,
        branch: BranchId,
        fb: FolderBranch,
        cancel: &CancellationToken,
    ) -> VeilResult<bool> {
        let bcache = self.config.block_cache();
        let bops = self.config.bops();
        let splitter = self.config.splitter();

        let file_ptr = self.nodes.pointer_for(file);
        let path = self.nodes.path_from_node(fb, file);
        ensure!(path.depth() > 1, VeilError::InvalidPath);

        // phase 1: under blockLock, ready the dirty file blocks; snapshots
        // of every dirty block are kept so a failed attempt can restore
        // the pre-sync picture exactly
        let mut state = BlockPutState::new();
        let mut md = md_old.make_successor(head_id);
        let mut original_children: Vec<(BlockPointer, Block)> = Vec::new();
        let (sync_info, entry, new_top_ptr, top_block, original_top) = {
            let mut blocks = self.blocks.write().await;
            let Some(sync_info) = blocks.dirty_files.remove(&file) else {
                return Ok(false);
            };
            let Some(entry) = blocks.de_cache.remove(&file) else {
                blocks.dirty_files.insert(file, sync_info);
                bail!("dirty file without a cached entry");
            };

            let mut top = match bcache.get(file_ptr, branch) {
                Some(block) => block.into_file()?,
                None => {
                    // dirtiness got cleaned up under us; nothing to sync
                    blocks.dirty_files.insert(file, sync_info);
                    blocks.de_cache.insert(file, entry);
                    return Ok(false);
                }
            };
            let original_top = top.clone();

            md.add_op(Op::Sync(SyncOp {
                common: Default::default(),
                file: BlockUpdate::new(file_ptr, file_ptr),
                writes: sync_info.writes.clone(),
            }));
            for unref in &sync_info.unrefs {
                md.add_unref_block(*unref);
            }

            blocks.sync_states.insert(file_ptr.block_ref(), FileSyncState::SyncingNotDirty);

            if top.is_indirect {
                // settle block boundaries, then ready each dirty child
                let mut idx = 0;
                while idx < top.indirect_ptrs.len() {
                    let iptr = top.indirect_ptrs[idx];
                    if !bcache.is_dirty(iptr.info.ptr, branch) {
                        idx += 1;
                        continue;
                    }
                    let mut child = bcache
                        .get(iptr.info.ptr, branch)
                        .ok_or_else(|| anyhow!("dirty child vanished"))?
                        .into_file()?;
                    original_children.push((iptr.info.ptr, Block::File(child.clone())));

                    let is_last = idx + 1 == top.indirect_ptrs.len();
                    let shift = splitter.check_split(&child, is_last);
                    if shift > 0 {
                        // push the overflow into the next block
                        let excess = child.contents.split_off(splitter.max_block_size);
                        let next_off = iptr.off + child.contents.len() as u64;
                        if is_last {
                            let ptr = self.temp_ptr(&md);
                            bcache.put_dirty(
                                ptr,
                                branch,
                                Block::File(FileBlock { contents: excess, ..Default::default() }),
                            );
                            top.indirect_ptrs.push(IndirectFilePtr {
                                info: BlockInfo::dirty(ptr),
                                off: next_off,
                            });
                        } else {
                            let next = top.indirect_ptrs[idx + 1];
                            let mut next_block = match bcache.get(next.info.ptr, branch) {
                                Some(block) => block.into_file()?,
                                None => self
                                    .fetch_block(md_old, branch, next.info.ptr)
                                    .await?
                                    .into_file()?,
                            };
                            let mut merged = excess;
                            merged.extend_from_slice(&next_block.contents);
                            next_block.contents = merged;
                            bcache.put_dirty(next.info.ptr, branch, Block::File(next_block));
                            top.indirect_ptrs[idx + 1].off = next_off;
                        }
                    } else if shift < 0 && idx + 1 < top.indirect_ptrs.len() {
                        // steal from the next block to refill this one
                        let next = top.indirect_ptrs[idx + 1];
                        let mut next_block = match bcache.get(next.info.ptr, branch) {
                            Some(block) => block.into_file()?,
                            None => self
                                .fetch_block(md_old, branch, next.info.ptr)
                                .await?
                                .into_file()?,
                        };
                        let take = ((-shift) as usize).min(next_block.contents.len());
                        let stolen: Vec<u8> = next_block.contents.drain(..take).collect();
                        child.contents.extend_from_slice(&stolen);
                        if next_block.contents.is_empty() {
                            top.indirect_ptrs.remove(idx + 1);
                            bcache.delete_dirty(next.info.ptr, branch);
                        } else {
                            top.indirect_ptrs[idx + 1].off = iptr.off + child.contents.len() as u64;
                            bcache.put_dirty(next.info.ptr, branch, Block::File(next_block));
                        }
                    }

                    // dedup within the folder before paying for an upload
                    let child_block = Block::File(child.clone());
                    let (new_ptr, new_info) = if let Some(known) =
                        bcache.check_for_known_ptr(self.tlf, &child_block)
                    {
                        let dedup = known.dedup_ref(self.config.uid());
                        let info = BlockInfo { ptr: dedup, encoded_size: 0 };
                        state.add_new_block(
                            dedup,
                            child_block.clone(),
                            crate::bops::ReadyBlockData {
                                sealed: Default::default(),
                                half: crate::crypto::BlockCryptKeyServerHalf::new(
                                    [0; crate::crypto::KEY_SIZE],
                                ),
                            },
                        );
                        (dedup, info)
                    } else {
                        let (id, _plain, ready) = bops.ready(&md, &child_block).await?;
                        let ptr =
                            BlockPointer::new_first(id, md.latest_key_gen(), self.config.uid());
                        let info = BlockInfo { ptr, encoded_size: ready.encoded_size() };
                        state.add_new_block(ptr, child_block, ready);
                        (ptr, info)
                    };

                    md.add_update_block(top.indirect_ptrs[idx].info, new_info);
                    top.indirect_ptrs[idx].info = new_info;

                    bcache.delete_dirty(iptr.info.ptr, branch);
                    blocks.sync_states.insert(new_ptr.block_ref(), FileSyncState::SyncingNotDirty);
                    idx += 1;
                }
                // the (dirty) top now names the readied children; keep it
                // dirty so concurrent writes defer
                bcache.put_dirty(file_ptr, branch, Block::File(top.clone()));
            }

            (sync_info, entry, file_ptr, top, original_top)
        };

        // phase 2: ready the top block and rebuild the path to the root
        let result = self
            .sync_finish(
                file,
                md_old,
                branch,
                &path,
                md,
                state,
                &sync_info,
                &entry,
                new_top_ptr,
                top_block,
                cancel,
            )
            .await;

        match result {
            Ok(()) => {
                // phase 3: clear dirty state and replay deferred edits
                let deferred = {
                    let mut blocks = self.blocks.write().await;
                    bcache.delete_dirty(file_ptr, branch);
                    blocks.sync_states.clear();
                    std::mem::take(&mut blocks.deferred)
                };
                let mut ls2 = LockState::new();
                let head = self.head_read(&mut ls2).await;
                let mut blocks = self.blocks_write(&mut ls2).await;
                for op in deferred {
                    match op.kind {
                        DeferredKind::Write { data, off } => {
                            self.apply_write_locked(&mut blocks, &head, op.node, &data, off)
                                .await?;
                        }
                        DeferredKind::Truncate { size } => {
                            self.apply_truncate_locked(&mut blocks, &head, op.node, size).await?;
                        }
                    }
                }
                Ok(true)
            }
            Err(err) => {
                // restore the exact pre-sync dirty picture so a retry (or
                // a later sync, for non-recoverable failures) starts clean
                let mut blocks = self.blocks.write().await;
                for (ptr, block) in original_children {
                    bcache.put_dirty(ptr, branch, block);
                }
                bcache.put_dirty(file_ptr, branch, Block::File(original_top));
                blocks.dirty_files.insert(file, sync_info);
                blocks.de_cache.insert(file, entry);
                blocks.sync_states.clear();
                Err(err)
            }
        }
    }

    /// Readies the top file block, folds the file's entry into its parent,
    /// rebuilds to the root and pushes blocks + metadata.
    #[allow(clippy::too_many_arguments)]
    async fn sync_finish(
        &self,
        file: NodeId,
        md_old: &RootMetadata,
        branch: BranchId,
        path: &VeilPath,
        mut md: RootMetadata,
        state: BlockPutState,
        sync_info: &SyncInfo,
        entry: &DirEntry,
        old_top_ptr: BlockPointer,
        top_block: FileBlock,
        cancel: &CancellationToken,
    ) -> VeilResult<()> {
        let bops = self.config.bops();
        let mut new_entry = entry.clone();
        let top_block = Block::File(top_block);
        let (id, _plain, ready) = bops.ready(&md, &top_block).await?;
        let new_ptr = BlockPointer::new_first(id, md.latest_key_gen(), self.config.uid());
        let new_info = BlockInfo { ptr: new_ptr, encoded_size: ready.encoded_size() };
        let mut full_state = BlockPutState::new();
        full_state.add_new_block(new_ptr, top_block, ready);
        full_state.merge(state);
        md.add_update_block(
            BlockInfo { ptr: old_top_ptr, encoded_size: entry.info.encoded_size },
            new_info,
        );
        new_entry.info = new_info;

        let parent_path = path.parent_path();
        let mut parent_block =
            self.fetch_dir_block(md_old, branch, parent_path.tail_pointer()).await?;
        parent_block.children.insert(path.tail_name().to_owned(), new_entry);

        self.sync_tree(
            md_old,
            branch,
            &mut md,
            vec![(parent_path, Block::Dir(parent_block), None)],
            &mut full_state,
        )
        .await?;

        let notification = NodeChange {
            node: Some(file),
            dir_updated: Vec::new(),
            file_updated: sync_info.writes.clone(),
        };
        self.finalize_md_write(cancel, md, full_state, vec![notification]).await?;
        Ok(())
    }

    // ---- staging / unstaging ------------------------------------------

    /// Abandon the unmerged branch and fast-forward to the merged head.
    pub async fn unstage(&self) -> VeilResult<()> {
        trace!("FolderEngine::unstage()");
        let mut ls = LockState::new();
        let _mdw = self.md_writer_locked(&mut ls).await;
        let branch = {
            let head = self.head.read().await;
            if !head.staged {
                return Ok(());
            }
            head.branch
        };

        let blocks = self.blocks.read().await;
        ensure!(blocks.dirty_files.is_empty(), VeilError::DirtyWhileShutdown);
        drop(blocks);

        self.config.mdops().prune_branch(self.tlf, branch).await?;
        let merged = self
            .config
            .mdops()
            .get_for_tlf(self.tlf, BranchId::NULL, crate::server::MdStatus::Merged)
            .await?
            .ok_or_else(|| anyhow!("merged head vanished while unstaging"))?;

        self.install_head(merged, false, BranchId::NULL).await;
        Ok(())
    }

    /// Replace the head wholesale (unstage / conflict resolution / update
    /// application), rebinding cached nodes to the new tree.
    pub(crate) async fn install_head(&self, new_head: MdWithId, staged: bool, branch: BranchId) {
        {
            let mut ls = LockState::new();
            let mut head = self.head_write(&mut ls).await;
            head.md = new_head.clone();
            head.staged = staged;
            head.branch = branch;
        }
        self.rebind_nodes(&new_head).await;
        let _ = self.head_rev_tx.send(new_head.md.revision);
        self.notify_batch(&[NodeChange {
            node: Some(self.root),
            dir_updated: Vec::new(),
            file_updated: Vec::new(),
        }]);
    }

    /// Walk the new head's tree and point cached nodes at the entries that
    /// now live at their (parent, name) positions.
    async fn rebind_nodes(&self, head: &MdWithId) {
        let branch = head.md.branch();
        let root_ptr = head.md.data.dir.ptr();
        self.nodes.update_pointer(
            self.nodes.pointer_for(self.root).block_ref(),
            root_ptr,
        );

        let mut queue = vec![(self.root, root_ptr)];
        while let Some((dir_node, dir_ptr)) = queue.pop() {
            let Ok(dir_block) = self.fetch_dir_block(&head.md, branch, dir_ptr).await else {
                continue;
            };
            for (name, entry) in &dir_block.children {
                let Some(child) = self.nodes.find_child(dir_node, name) else { continue };
                let old_ptr = self.nodes.pointer_for(child);
                if old_ptr != entry.ptr() && entry.ptr().is_valid() {
                    self.nodes.update_pointer(old_ptr.block_ref(), entry.ptr());
                }
                if entry.entry.entry_type.is_dir() {
                    queue.push((child, entry.ptr()));
                }
            }
        }
    }

    // ---- rekey ---------------------------------------------------------

    /// Rotate or extend the folder's keys to match current membership.
    pub async fn rekey(&self) -> VeilResult<()> {
        trace!("FolderEngine::rekey()");
        let mut ls = LockState::new();
        let _mdw = self.md_writer_locked(&mut ls).await;
        let (md_old, head_id) = {
            let head = self.head_read(&mut ls).await;
            (head.md.md.clone(), head.md.id)
        };

        let mut md = md_old.make_successor(head_id);
        let result = self.config.kmgr().rekey(&mut md, &self.handle).await?;
        if !result.changed {
            return Ok(());
        }
        md.flags.insert(MdFlags::REKEY);
        if !self.handle.is_writer(self.config.uid()) {
            // a reader ships the previous writer metadata untouched
            md.flags.insert(MdFlags::WRITER_METADATA_COPIED);
            md.writer_md.serialized_private_md = md_old.writer_md.serialized_private_md.clone();
            md.writer_sig = md_old.writer_sig.clone();
        }
        md.add_op(Op::Rekey(crate::ops::RekeyOp::default()));
        md.data.dir = md_old.data.dir.clone();

        self.finalize_md_write(&self.shutdown.child_token(), md, BlockPutState::new(), vec![])
            .await?;
        ensure!(!result.incomplete, VeilError::RekeyIncomplete);
        Ok(())
    }

    /// Queue a rekey to run off the calling path. Partial completions
    /// (`RekeyIncomplete`) stay queued and retry, since another device may
    /// finish the job in the meantime.
    pub fn schedule_rekey(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut delay = std::time::Duration::from_millis(100);
            for _ in 0..5 {
                match engine.rekey().await {
                    Ok(()) => return,
                    Err(err)
                        if matches!(
                            err.downcast_ref::<VeilError>(),
                            Some(VeilError::RekeyIncomplete)
                        ) =>
                    {
                        tokio::select! {
                            _ = engine.shutdown.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        delay *= 2;
                    }
                    Err(err) => {
                        warn!("background rekey failed: {}", err);
                        return;
                    }
                }
            }
        });
    }

    // ---- notifications -------------------------------------------------

    fn notify_local(&self, node: NodeId, range: WriteRange) {
        for observer in self.observers.read().iter() {
            observer.local_change(node, range);
        }
    }

    pub(crate) fn notify_batch(&self, changes: &[NodeChange]) {
        for observer in self.observers.read().iter() {
            observer.batch_changes(changes);
        }
    }

    // ---- update application (called by the updater task) ---------------

    pub(crate) async fn handle_incoming_updates(&self) -> VeilResult<()> {
        let mut ls = LockState::new();
        let _mdw = self.md_writer_locked(&mut ls).await;
        let (head_md, cur_id, staged) = {
            let head = self.head.read().await;
            (head.md.md.clone(), head.md.id, head.staged)
        };
        let cur_rev = head_md.revision;

        if staged {
            // a staged device ignores merged updates; it keeps prodding
            // conflict resolution instead
            let merged = self
                .config
                .mdops()
                .get_for_tlf(self.tlf, BranchId::NULL, crate::server::MdStatus::Merged)
                .await?;
            if let Some(merged) = merged {
                let _ = self.cr_tx.send((cur_rev, merged.md.revision));
            }
            return Ok(());
        }

        {
            let blocks = self.blocks.read().await;
            if !blocks.dirty_files.is_empty() {
                // dirty state defers update application to the next clean
                // transition
                debug!("deferring incoming updates while dirty");
                return Ok(());
            }
        }

        let latest = match self
            .config
            .mdops()
            .get_for_tlf(self.tlf, BranchId::NULL, crate::server::MdStatus::Merged)
            .await?
        {
            Some(latest) if latest.md.revision > cur_rev => latest,
            _ => return Ok(()),
        };

        let range = self
            .config
            .mdops()
            .get_range(
                self.tlf,
                BranchId::NULL,
                crate::server::MdStatus::Merged,
                cur_rev.next(),
                latest.md.revision,
            )
            .await?;

        let mut prev = (cur_id, None::<RootMetadata>);
        let mut notifications = Vec::new();
        let mut last = None;
        for mut md in range {
            let expected = match &prev.1 {
                Some(prev_md) => prev_md.revision.next(),
                None => cur_rev.next(),
            };
            ensure!(
                md.md.revision == expected,
                VeilError::MdUpdateApply(expected, md.md.revision)
            );
            md.md.is_valid_successor(prev.0, prev.1.as_ref().unwrap_or(&head_md))?;
            self.reembed_changes(&mut md.md).await?;

            for op in &md.md.data.changes.ops {
                for update in op.all_updates() {
                    self.nodes.update_pointer(update.unref.block_ref(), update.new_ref);
                }
                notifications.push(NodeChange {
                    node: None,
                    dir_updated: match op {
                        Op::Create(c) => vec![c.new_name.clone()],
                        Op::Rm(r) => vec![r.old_name.clone()],
                        Op::Rename(r) => vec![r.old_name.clone(), r.new_name.clone()],
                        _ => Vec::new(),
                    },
                    file_updated: match op {
                        Op::Sync(s) => s.writes.clone(),
                        _ => Vec::new(),
                    },
                });
            }
            prev = (md.id, Some(md.md.clone()));
            last = Some(md);
        }

        if let Some(last) = last {
            debug!("applied merged updates through revision {}", last.md.revision);
            self.install_head(last, false, BranchId::NULL).await;
            self.notify_batch(&notifications);
        }
        Ok(())
    }

    /// fetch an externalized op log back into the metadata
    pub(crate) async fn reembed_changes(&self, md: &mut RootMetadata) -> VeilResult<()> {
        let Some(info) = md.data.changes.info else { return Ok(()) };
        let block = self.config.bops().get(md, info.ptr).await?.into_file()?;
        md.data.changes.ops = crate::codec::decode(&block.contents)?;
        md.data.changes.info = None;
        Ok(())
    }

    pub(crate) async fn dirty_nodes(&self) -> Vec<NodeId> {
        self.blocks.read().await.dirty_files.keys().copied().collect()
    }

    pub(crate) async fn head_snapshot(&self) -> (MdWithId, BranchId, bool) {
        let head = self.head.read().await;
        (head.md.clone(), head.branch, head.staged)
    }
}

fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

#[cfg(test)]
mod tests;
