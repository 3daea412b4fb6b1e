use crate::block::BlockPointer;
use crate::error::VeilResult;
use crate::id::BlockRef;
use crate::md::RootMetadata;
use crate::ops::{CreateOp, Op, RmOp};
use rustc_hash::{FxHashMap, FxHashSet};

/// Where a renamed node came from and where it went, in terms of the
/// *original* pointers of both parents. When a node is renamed repeatedly
/// within one range, the old side of the earliest rename is preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameInfo {
    pub original_old_parent: BlockRef,
    pub old_name: String,
    pub original_new_parent: BlockRef,
    pub new_name: String,
}

/// Every op that touched one node across a range of revisions, bracketed
/// by the earliest pointer the node was seen under and the pointer it ends
/// the range with.
#[derive(Debug, Clone)]
pub struct CrChain {
    pub original: BlockPointer,
    pub most_recent: BlockPointer,
    pub ops: Vec<Op>,
    pub is_file: bool,
}

impl CrChain {
    fn degenerate(ptr: BlockPointer) -> Self {
        Self { original: ptr, most_recent: ptr, ops: Vec::new(), is_file: false }
    }

    /// Drop ops that cancel within the chain: a create superseded by the
    /// create-half of a later rename of the same name, and create/rm pairs
    /// of the same name.
    pub fn collapse(&mut self) {
        let mut removed = vec![false; self.ops.len()];
        for i in 0..self.ops.len() {
            if removed[i] {
                continue;
            }
            let name = match &self.ops[i] {
                Op::Create(CreateOp { new_name, renamed: false, .. }) => new_name.clone(),
                _ => continue,
            };
            for j in i + 1..self.ops.len() {
                if removed[j] {
                    continue;
                }
                match &self.ops[j] {
                    Op::Rm(RmOp { old_name, .. }) if *old_name == name => {
                        removed[i] = true;
                        removed[j] = true;
                        break;
                    }
                    Op::Create(CreateOp { new_name, renamed: true, .. }) if *new_name == name => {
                        removed[i] = true;
                        break;
                    }
                    _ => {}
                }
            }
        }
        let mut keep = removed.iter().map(|r| !r);
        self.ops.retain(|_| keep.next().unwrap());
    }
}

/// All chains for one side (merged or unmerged) of a conflict, built from
/// an in-order range of decrypted revisions.
#[derive(Debug, Default)]
pub struct CrChains {
    pub by_original: FxHashMap<BlockRef, CrChain>,
    /// most recent pointer -> original pointer
    pub by_most_recent: FxHashMap<BlockRef, BlockRef>,
    /// every pointer observed in the range -> its original
    originals: FxHashMap<BlockRef, BlockRef>,
    pub created_originals: Vec<BlockRef>,
    pub deleted_originals: FxHashSet<BlockRef>,
    pub renamed_originals: FxHashMap<BlockRef, RenameInfo>,
    /// original pointer of the folder root across the range
    pub root_original: Option<BlockRef>,
}

impl CrChains {
    pub fn build(mds: &[RootMetadata]) -> VeilResult<Self> {
        let mut chains = Self::default();
        for md in mds {
            ensure!(!md.data.changes.is_externalized(), "changes must be re-embedded before chain building");
            for op in &md.data.changes.ops {
                chains.add_op(op.clone())?;
            }
        }
        if let Some(last) = mds.last() {
            let root = last.data.dir.ptr();
            chains.root_original = Some(chains.original_of(root.block_ref()));
        }
        Ok(chains)
    }

    pub fn original_of(&self, r: BlockRef) -> BlockRef {
        self.originals.get(&r).copied().unwrap_or(r)
    }

    pub fn chain_for(&self, r: BlockRef) -> Option<&CrChain> {
        self.by_original.get(&self.original_of(r))
    }

    pub fn chain_for_mut(&mut self, r: BlockRef) -> Option<&mut CrChain> {
        let original = self.original_of(r);
        self.by_original.get_mut(&original)
    }

    /// the pointer a node carries at the end of the range, given any
    /// pointer it was seen under
    pub fn most_recent_of(&self, r: BlockRef) -> BlockRef {
        self.chain_for(r).map(|chain| chain.most_recent.block_ref()).unwrap_or(r)
    }

    fn process_update(&mut self, unref: BlockPointer, new: BlockPointer) {
        let unref_ref = unref.block_ref();
        let original = match self.by_most_recent.remove(&unref_ref) {
            Some(original) => original,
            None => {
                // first sighting: the pre-update pointer is the original
                self.by_original
                    .entry(unref_ref)
                    .or_insert_with(|| CrChain::degenerate(unref));
                unref_ref
            }
        };
        let chain = self.by_original.get_mut(&original).expect("chain must exist");
        chain.most_recent = new;
        self.by_most_recent.insert(new.block_ref(), original);
        self.originals.insert(new.block_ref(), original);
        self.originals.insert(unref_ref, original);
    }

    fn attach(&mut self, target: BlockPointer, op: Op, is_file: bool) {
        let original = self.original_of(target.block_ref());
        let chain =
            self.by_original.entry(original).or_insert_with(|| CrChain::degenerate(target));
        chain.is_file |= is_file;
        chain.ops.push(op);
    }

    fn add_op(&mut self, op: Op) -> VeilResult<()> {
        // garbage collection never contributes chains; resolution
        // consults it separately
        if matches!(op, Op::Gc(..)) {
            return Ok(());
        }

        for update in op.all_updates() {
            self.process_update(update.unref, update.new_ref);
        }
        for &created in op.refs() {
            let created_ref = created.block_ref();
            if !self.by_original.contains_key(&created_ref) {
                self.by_original.insert(created_ref, CrChain::degenerate(created));
            }
            self.created_originals.push(created_ref);
        }
        for &unref in op.unrefs() {
            let original = self.original_of(unref.block_ref());
            self.deleted_originals.insert(original);
        }

        match op {
            Op::Create(ref create) => {
                let dir = create.dir.new_ref;
                self.attach(dir, op, false);
            }
            Op::Rm(ref rm) => {
                let dir = rm.dir.new_ref;
                self.attach(dir, op, false);
            }
            Op::Rename(rename) => {
                // a rename lives in the metadata as itself, but chains see
                // it split: an rm in the old parent, a create (tagged
                // renamed) in the new parent
                let new_dir = rename.new_dir.unwrap_or(rename.old_dir);

                let renamed_original = self.original_of(rename.renamed.block_ref());
                let old_parent = self.original_of(rename.old_dir.unref.block_ref());
                let new_parent = self.original_of(new_dir.unref.block_ref());
                let info = self
                    .renamed_originals
                    .entry(renamed_original)
                    .or_insert_with(|| RenameInfo {
                        original_old_parent: old_parent,
                        old_name: rename.old_name.clone(),
                        original_new_parent: new_parent,
                        new_name: String::new(),
                    });
                // the new side always tracks the latest rename
                info.original_new_parent = new_parent;
                info.new_name = rename.new_name.clone();

                let rm_half = Op::Rm(RmOp {
                    common: rename.common.clone(),
                    dir: rename.old_dir,
                    old_name: rename.old_name.clone(),
                    removed_type: rename.renamed_type,
                });
                self.attach(rename.old_dir.new_ref, rm_half, false);

                let create_half = Op::Create(CreateOp {
                    common: rename.common,
                    dir: new_dir,
                    new_name: rename.new_name,
                    entry_type: rename.renamed_type,
                    renamed: true,
                });
                self.attach(new_dir.new_ref, create_half, false);
            }
            Op::Sync(ref sync) => {
                let file = sync.file.new_ref;
                self.attach(file, op, true);
            }
            Op::SetAttr(ref set_attr) => {
                // may create a degenerate chain when the target's pointer
                // never moved in this range
                let original = self.original_of(set_attr.file.block_ref());
                let target =
                    self.by_original.get(&original).map(|c| c.most_recent).unwrap_or(set_attr.file);
                self.attach(target, op, true);
            }
            Op::Rekey(..) | Op::Resolution(..) => {}
            Op::Gc(..) => unreachable!(),
        }
        Ok(())
    }

    /// collapse every chain; empty chains are kept (their pointer travel
    /// still matters for path resolution)
    pub fn collapse(&mut self) {
        for chain in self.by_original.values_mut() {
            chain.collapse();
        }
    }

    pub fn is_created(&self, original: BlockRef) -> bool {
        self.created_originals.contains(&original)
    }

    pub fn is_deleted(&self, original: BlockRef) -> bool {
        self.deleted_originals.contains(&original)
    }
}
