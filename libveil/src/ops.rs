use crate::actions::CrAction;
use crate::block::{BlockPointer, EntryType};
use crate::id::Revision;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt::{self, Display, Formatter};

/// A live reference rewritten to a new pointer; the only permitted way an
/// MD chain replaces one of its block references.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BlockUpdate {
    pub unref: BlockPointer,
    pub new_ref: BlockPointer,
}

impl BlockUpdate {
    pub fn new(unref: BlockPointer, new_ref: BlockPointer) -> Self {
        Self { unref, new_ref }
    }
}

/// A contiguous byte range touched by a write or truncate.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Serialize, Deserialize)]
pub struct WriteRange {
    pub off: u64,
    pub len: u64,
}

impl WriteRange {
    /// truncates are encoded as a zero-length range at the new size
    pub fn is_truncate(self) -> bool {
        self.len == 0
    }
}

/// Which part of an entry a setattr touched.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug, Serialize, Deserialize)]
pub enum Attr {
    Exec,
    Mtime,
    Size,
}

/// The reference bookkeeping every op carries: pointers newly referenced by
/// this revision, pointers no live MD names anymore, and in-place pointer
/// rewrites. The three sets are disjoint.
#[derive(PartialEq, Eq, Clone, Debug, Default, Serialize, Deserialize)]
pub struct OpCommon {
    pub refs: Vec<BlockPointer>,
    pub unrefs: Vec<BlockPointer>,
    pub updates: Vec<BlockUpdate>,
}

impl OpCommon {
    pub fn add_ref_block(&mut self, ptr: BlockPointer) {
        self.refs.push(ptr);
    }

    pub fn add_unref_block(&mut self, ptr: BlockPointer) {
        self.unrefs.push(ptr);
    }

    pub fn add_update(&mut self, unref: BlockPointer, new_ref: BlockPointer) {
        self.updates.push(BlockUpdate::new(unref, new_ref));
    }
}

#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
pub struct CreateOp {
    pub common: OpCommon,
    /// the parent directory's pointer rewrite caused by this create
    pub dir: BlockUpdate,
    pub new_name: String,
    pub entry_type: EntryType,
    /// set when this create is the target half of a split rename
    pub renamed: bool,
}

#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
pub struct RmOp {
    pub common: OpCommon,
    pub dir: BlockUpdate,
    pub old_name: String,
    pub removed_type: EntryType,
}

#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
pub struct RenameOp {
    pub common: OpCommon,
    pub old_dir: BlockUpdate,
    pub old_name: String,
    /// `None` when the rename stays within one directory
    pub new_dir: Option<BlockUpdate>,
    pub new_name: String,
    /// most recent pointer of the node being renamed
    pub renamed: BlockPointer,
    pub renamed_type: EntryType,
}

#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
pub struct SyncOp {
    pub common: OpCommon,
    pub file: BlockUpdate,
    pub writes: Vec<WriteRange>,
}

impl SyncOp {
    pub fn add_write(&mut self, off: u64, len: u64) {
        self.writes.push(WriteRange { off, len });
    }

    pub fn add_truncate(&mut self, size: u64) {
        self.writes.push(WriteRange { off: size, len: 0 });
    }
}

#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
pub struct SetAttrOp {
    pub common: OpCommon,
    pub name: String,
    pub dir: BlockUpdate,
    pub attr: Attr,
    /// most recent pointer of the entry whose attribute changed
    pub file: BlockPointer,
}

#[derive(PartialEq, Eq, Clone, Debug, Default, Serialize, Deserialize)]
pub struct RekeyOp {
    pub common: OpCommon,
}

#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
pub struct GcOp {
    pub common: OpCommon,
    /// every unref in this op comes from a revision at or before this one
    pub latest_rev: Revision,
}

#[derive(PartialEq, Eq, Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResolutionOp {
    pub common: OpCommon,
}

/// Every mutation a metadata revision can record. `BlockChanges` is an
/// ordered list of these.
#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
pub enum Op {
    Create(CreateOp),
    Rm(RmOp),
    Rename(RenameOp),
    Sync(SyncOp),
    SetAttr(SetAttrOp),
    Rekey(RekeyOp),
    Gc(GcOp),
    Resolution(ResolutionOp),
}

impl Op {
    pub fn create(dir: BlockUpdate, new_name: impl Into<String>, entry_type: EntryType) -> Self {
        Op::Create(CreateOp {
            common: Default::default(),
            dir,
            new_name: new_name.into(),
            entry_type,
            renamed: false,
        })
    }

    pub fn rm(dir: BlockUpdate, old_name: impl Into<String>, removed_type: EntryType) -> Self {
        Op::Rm(RmOp { common: Default::default(), dir, old_name: old_name.into(), removed_type })
    }

    pub fn rename(
        old_dir: BlockUpdate,
        old_name: impl Into<String>,
        new_dir: Option<BlockUpdate>,
        new_name: impl Into<String>,
        renamed: BlockPointer,
        renamed_type: EntryType,
    ) -> Self {
        Op::Rename(RenameOp {
            common: Default::default(),
            old_dir,
            old_name: old_name.into(),
            new_dir,
            new_name: new_name.into(),
            renamed,
            renamed_type,
        })
    }

    pub fn sync(file: BlockUpdate) -> Self {
        Op::Sync(SyncOp { common: Default::default(), file, writes: Vec::new() })
    }

    pub fn set_attr(
        dir: BlockUpdate,
        name: impl Into<String>,
        attr: Attr,
        file: BlockPointer,
    ) -> Self {
        Op::SetAttr(SetAttrOp { common: Default::default(), name: name.into(), dir, attr, file })
    }

    pub fn common(&self) -> &OpCommon {
        match self {
            Op::Create(op) => &op.common,
            Op::Rm(op) => &op.common,
            Op::Rename(op) => &op.common,
            Op::Sync(op) => &op.common,
            Op::SetAttr(op) => &op.common,
            Op::Rekey(op) => &op.common,
            Op::Gc(op) => &op.common,
            Op::Resolution(op) => &op.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut OpCommon {
        match self {
            Op::Create(op) => &mut op.common,
            Op::Rm(op) => &mut op.common,
            Op::Rename(op) => &mut op.common,
            Op::Sync(op) => &mut op.common,
            Op::SetAttr(op) => &mut op.common,
            Op::Rekey(op) => &mut op.common,
            Op::Gc(op) => &mut op.common,
            Op::Resolution(op) => &mut op.common,
        }
    }

    pub fn refs(&self) -> &[BlockPointer] {
        &self.common().refs
    }

    pub fn unrefs(&self) -> &[BlockPointer] {
        &self.common().unrefs
    }

    /// every pointer rewrite this op performs, op-specific rewrites included
    pub fn all_updates(&self) -> SmallVec<[BlockUpdate; 4]> {
        let mut updates = SmallVec::from_slice(&self.common().updates);
        match self {
            Op::Create(op) => updates.push(op.dir),
            Op::Rm(op) => updates.push(op.dir),
            Op::Rename(op) => {
                updates.push(op.old_dir);
                if let Some(new_dir) = op.new_dir {
                    updates.push(new_dir);
                }
            }
            Op::Sync(op) => updates.push(op.file),
            Op::SetAttr(op) => updates.push(op.dir),
            Op::Rekey(..) | Op::Gc(..) | Op::Resolution(..) => {}
        }
        updates
    }

    /// Route a pointer rewrite to this op's own update slot if the old
    /// pointer matches one; returns false when the rewrite belongs in the
    /// shared update list instead.
    pub fn note_update(&mut self, old: BlockPointer, new: BlockPointer) -> bool {
        match self {
            Op::Create(op) if op.dir.unref == old => {
                op.dir.new_ref = new;
                true
            }
            Op::Rm(op) if op.dir.unref == old => {
                op.dir.new_ref = new;
                true
            }
            Op::Rename(op) if op.new_dir.map_or(false, |d| d.unref == old) => {
                op.new_dir = Some(BlockUpdate::new(old, new));
                true
            }
            Op::Rename(op) if op.old_dir.unref == old => {
                op.old_dir.new_ref = new;
                true
            }
            Op::Sync(op) if op.file.unref == old => {
                op.file.new_ref = new;
                true
            }
            Op::SetAttr(op) if op.dir.unref == old => {
                op.dir.new_ref = new;
                true
            }
            _ => false,
        }
    }

    /// the op undoing this one; used when rolling local state back off an
    /// abandoned branch
    pub fn invert(&self) -> Op {
        fn flip(common: &OpCommon) -> OpCommon {
            OpCommon {
                refs: common.unrefs.clone(),
                unrefs: common.refs.clone(),
                updates: common
                    .updates
                    .iter()
                    .rev()
                    .map(|u| BlockUpdate::new(u.new_ref, u.unref))
                    .collect(),
            }
        }
        fn flip_update(update: BlockUpdate) -> BlockUpdate {
            BlockUpdate::new(update.new_ref, update.unref)
        }

        match self {
            Op::Create(op) => Op::Rm(RmOp {
                common: flip(&op.common),
                dir: flip_update(op.dir),
                old_name: op.new_name.clone(),
                removed_type: op.entry_type,
            }),
            Op::Rm(op) => Op::Create(CreateOp {
                common: flip(&op.common),
                dir: flip_update(op.dir),
                new_name: op.old_name.clone(),
                entry_type: op.removed_type,
                renamed: false,
            }),
            Op::Rename(op) => Op::Rename(RenameOp {
                common: flip(&op.common),
                old_dir: op.new_dir.map_or_else(|| flip_update(op.old_dir), flip_update),
                old_name: op.new_name.clone(),
                new_dir: op.new_dir.map(|_| flip_update(op.old_dir)),
                new_name: op.old_name.clone(),
                renamed: op.renamed,
                renamed_type: op.renamed_type,
            }),
            Op::Sync(op) => Op::Sync(SyncOp {
                common: flip(&op.common),
                file: flip_update(op.file),
                writes: op.writes.clone(),
            }),
            Op::SetAttr(op) => Op::SetAttr(SetAttrOp {
                common: flip(&op.common),
                name: op.name.clone(),
                dir: flip_update(op.dir),
                attr: op.attr,
                file: op.file,
            }),
            Op::Rekey(op) => Op::Rekey(RekeyOp { common: flip(&op.common) }),
            Op::Gc(op) => Op::Gc(GcOp { common: flip(&op.common), latest_rev: op.latest_rev }),
            Op::Resolution(op) => Op::Resolution(ResolutionOp { common: flip(&op.common) }),
        }
    }

    /// Decide what to do when this (unmerged) op meets `merged` on the same
    /// node during conflict resolution. `None` means no conflict. `name` is
    /// the node's name in its merged parent, used when the node itself
    /// (rather than one of its children) must be renamed.
    pub fn check_conflict(
        &self,
        renamer: &dyn ConflictRenamer,
        merged: &Op,
        is_file: bool,
        name: &str,
    ) -> Option<CrAction> {
        match (self, merged) {
            (Op::Create(unmerged), Op::Create(merged)) => {
                if unmerged.new_name != merged.new_name {
                    return None;
                }
                // two creates of the same directory merge silently
                if unmerged.entry_type == EntryType::Dir && merged.entry_type == EntryType::Dir {
                    return None;
                }
                if unmerged.entry_type == EntryType::Dir {
                    // keep the directory where it is, move the merged file
                    Some(CrAction::RenameMerged {
                        from: merged.new_name.clone(),
                        to: renamer.conflict_rename(&merged.new_name),
                    })
                } else {
                    Some(CrAction::RenameUnmerged {
                        from: unmerged.new_name.clone(),
                        to: renamer.conflict_rename(&unmerged.new_name),
                    })
                }
            }
            (Op::Create(unmerged), Op::Rm(merged)) if unmerged.new_name == merged.old_name =>
            // the merged branch removed the name; re-create it as-is
                Some(CrAction::CopyUnmergedEntry {
                    from: unmerged.new_name.clone(),
                    to: unmerged.new_name.clone(),
                }),
            (Op::Rm(unmerged), Op::Create(merged)) if unmerged.old_name == merged.new_name =>
            // removal loses to the merged branch's re-create
                Some(CrAction::DropUnmergedOp { op: self.clone() }),
            (Op::Rm(unmerged), Op::Rm(merged)) if unmerged.old_name == merged.old_name =>
            // both sides already removed it; nothing left to do
                Some(CrAction::DropUnmergedOp { op: self.clone() }),
            (Op::Sync(_), Op::Sync(_)) if is_file => {
                // divergent writes to one file never merge byte ranges;
                // keep both copies under distinguishable names
                Some(CrAction::RenameUnmerged {
                    from: name.to_owned(),
                    to: renamer.conflict_rename(name),
                })
            }
            (Op::SetAttr(unmerged), Op::SetAttr(merged))
                if unmerged.name == merged.name && unmerged.attr == merged.attr =>
                Some(CrAction::CopyUnmergedAttr {
                    from: unmerged.name.clone(),
                    to: unmerged.name.clone(),
                    attrs: smallvec![unmerged.attr],
                }),
            _ => None,
        }
    }

    /// the merge action when nothing conflicts
    pub fn default_action(&self, name: &str) -> Option<CrAction> {
        match self {
            Op::Create(op) => Some(CrAction::CopyUnmergedEntry {
                from: op.new_name.clone(),
                to: op.new_name.clone(),
            }),
            Op::Rm(op) => Some(CrAction::RmMergedEntry { name: op.old_name.clone() }),
            Op::Sync(..) =>
                Some(CrAction::CopyUnmergedEntry { from: name.to_owned(), to: name.to_owned() }),
            Op::SetAttr(op) => Some(CrAction::CopyUnmergedAttr {
                from: op.name.clone(),
                to: op.name.clone(),
                attrs: smallvec![op.attr],
            }),
            Op::Rename(..) => bug!("rename ops are split before chain processing"),
            Op::Rekey(..) | Op::Gc(..) | Op::Resolution(..) => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Op::Create(..) => "create",
            Op::Rm(..) => "rm",
            Op::Rename(..) => "rename",
            Op::Sync(..) => "sync",
            Op::SetAttr(..) => "setAttr",
            Op::Rekey(..) => "rekey",
            Op::Gc(..) => "gc",
            Op::Resolution(..) => "resolution",
        }
    }
}

impl Display for Op {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Op::Create(op) => write!(f, "create {} ({})", op.new_name, op.entry_type),
            Op::Rm(op) => write!(f, "rm {}", op.old_name),
            Op::Rename(op) => write!(f, "rename {} -> {}", op.old_name, op.new_name),
            Op::Sync(op) => write!(f, "sync ({} writes)", op.writes.len()),
            Op::SetAttr(op) => write!(f, "setAttr {} ({:?})", op.name, op.attr),
            Op::Rekey(..) => write!(f, "rekey"),
            Op::Gc(op) => write!(f, "gc (latest rev {})", op.latest_rev),
            Op::Resolution(..) => write!(f, "resolution"),
        }
    }
}

/// Produces the replacement name for an entry that lost a conflict.
pub trait ConflictRenamer: Send + Sync {
    fn conflict_rename(&self, original: &str) -> String;
}

/// `<name>.conflict.<writer>.<timestamp>`: enough for a human to tell whose
/// divergent copy this was and when it diverged.
pub struct WriterDateConflictRenamer {
    writer_name: String,
    timestamp: chrono::DateTime<chrono::Utc>,
}

impl WriterDateConflictRenamer {
    pub fn new(writer_name: impl Into<String>, timestamp: chrono::DateTime<chrono::Utc>) -> Self {
        Self { writer_name: writer_name.into(), timestamp }
    }
}

impl ConflictRenamer for WriterDateConflictRenamer {
    fn conflict_rename(&self, original: &str) -> String {
        format!(
            "{}.conflict.{}.{}",
            original,
            self.writer_name,
            self.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
        )
    }
}

#[cfg(test)]
mod tests;
