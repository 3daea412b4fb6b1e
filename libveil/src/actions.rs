use crate::block::DirBlock;
use crate::error::VeilResult;
use crate::ops::{Attr, Op};
use smallvec::SmallVec;
use std::fmt::{self, Display, Formatter};

/// One planned step of merging an unmerged chain into its merged
/// counterpart. Actions are planned per node, collapsed, then applied to
/// the merged directory block.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum CrAction {
    /// take the unmerged entry wholesale
    CopyUnmergedEntry { from: String, to: String },
    /// take only the listed attributes from the unmerged entry
    CopyUnmergedAttr { from: String, to: String, attrs: SmallVec<[Attr; 1]> },
    /// the unmerged entry lost a conflict; it moves to a conflict name
    RenameUnmerged { from: String, to: String },
    /// the merged entry moves aside and the unmerged entry takes its name
    RenameMerged { from: String, to: String },
    RmMergedEntry { name: String },
    /// the unmerged op is abandoned entirely
    DropUnmergedOp { op: Op },
}

impl CrAction {
    /// Apply this action to the working merged block, reading from the
    /// unmerged block and from the merged block as it was before any action
    /// ran (renames must restore entries a superseded copy clobbered).
    /// Missing source entries are skipped rather than errored: an earlier
    /// action (or a gc on the other branch) may have removed them.
    pub fn apply(
        &self,
        unmerged: &DirBlock,
        merged_original: &DirBlock,
        merged: &mut DirBlock,
    ) -> VeilResult<()> {
        match self {
            CrAction::CopyUnmergedEntry { from, to } => {
                if let Some(entry) = unmerged.children.get(from) {
                    merged.children.insert(to.clone(), entry.clone());
                }
            }
            CrAction::CopyUnmergedAttr { from, to, attrs } => {
                if let Some(source) = unmerged.children.get(from) {
                    if let Some(target) = merged.children.get_mut(to) {
                        for attr in attrs {
                            match attr {
                                Attr::Exec => target.entry.entry_type = source.entry.entry_type,
                                Attr::Mtime => target.entry.mtime = source.entry.mtime,
                                Attr::Size => target.entry.size = source.entry.size,
                            }
                        }
                    }
                }
            }
            CrAction::RenameUnmerged { from, to } => {
                if let Some(entry) = unmerged.children.get(from) {
                    merged.children.insert(to.clone(), entry.clone());
                }
                // the original name keeps the merged side's entry
                match merged_original.children.get(from) {
                    Some(orig) => merged.children.insert(from.clone(), orig.clone()),
                    None => merged.children.remove(from),
                };
            }
            CrAction::RenameMerged { from, to } => {
                if let Some(orig) = merged_original.children.get(from) {
                    merged.children.insert(to.clone(), orig.clone());
                }
                match unmerged.children.get(from) {
                    Some(entry) => merged.children.insert(from.clone(), entry.clone()),
                    None => merged.children.remove(from),
                };
            }
            CrAction::RmMergedEntry { name } => {
                merged.children.remove(name);
            }
            CrAction::DropUnmergedOp { .. } => {}
        }
        Ok(())
    }
}

impl Display for CrAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CrAction::CopyUnmergedEntry { from, to } =>
                write!(f, "copyUnmergedEntry {} -> {}", from, to),
            CrAction::CopyUnmergedAttr { from, to, attrs } =>
                write!(f, "copyUnmergedAttr {} -> {} ({:?})", from, to, attrs),
            CrAction::RenameUnmerged { from, to } => write!(f, "renameUnmerged {} -> {}", from, to),
            CrAction::RenameMerged { from, to } => write!(f, "renameMerged {} -> {}", from, to),
            CrAction::RmMergedEntry { name } => write!(f, "rmMergedEntry {}", name),
            CrAction::DropUnmergedOp { op } => write!(f, "dropUnmergedOp ({})", op),
        }
    }
}

/// Collapse a node's planned action list:
///
/// - a `RenameUnmerged` discards prior copy actions for the same entry
///   (the rename moves the whole entry anyway),
/// - back-to-back `CopyUnmergedAttr` for the same entry merge their
///   attribute sets.
///
/// Survivor order is untouched, and collapsing is idempotent.
pub fn collapse_actions(actions: Vec<CrAction>) -> Vec<CrAction> {
    let mut out: Vec<CrAction> = Vec::with_capacity(actions.len());
    for action in actions {
        match &action {
            CrAction::RenameUnmerged { from, .. } => {
                out.retain(|prev| {
                    !matches!(
                        prev,
                        CrAction::CopyUnmergedEntry { from: f, .. }
                        | CrAction::CopyUnmergedAttr { from: f, .. }
                        if f == from
                    )
                });
                out.push(action);
            }
            CrAction::CopyUnmergedAttr { from, to, attrs } => {
                let merged_into_prev = out.iter_mut().any(|prev| match prev {
                    CrAction::CopyUnmergedAttr { from: f, to: t, attrs: prev_attrs }
                        if f == from && t == to =>
                    {
                        for &attr in attrs {
                            if !prev_attrs.contains(&attr) {
                                prev_attrs.push(attr);
                            }
                        }
                        true
                    }
                    _ => false,
                });
                if !merged_into_prev {
                    out.push(action);
                }
            }
            _ => out.push(action),
        }
    }
    out
}
