use crate::actions::{collapse_actions, CrAction};
use crate::block::{Block, DirBlock};
use crate::bops::BlockPutState;
use crate::chains::CrChains;
use crate::engine::FolderEngine;
use crate::error::{VeilResult, VeilResultExt};
use crate::id::{BlockRef, BranchId, Revision};
use crate::md::{MdWithId, RootMetadata};
use crate::ops::{Op, ResolutionOp, WriterDateConflictRenamer};
use crate::path::{FolderBranch, VeilPath};
use crate::server::MdStatus;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const MAX_RESOLVE_ATTEMPTS: usize = 5;

/// Long-lived task: drains conflict-resolution triggers and merges the
/// device's unmerged branch back into the merged chain.
pub(crate) async fn run(
    engine: Arc<FolderEngine>,
    mut rx: mpsc::UnboundedReceiver<(Revision, Revision)>,
) {
    let shutdown = engine.shutdown_token().clone();
    loop {
        let input = tokio::select! {
            _ = shutdown.cancelled() => return,
            input = rx.recv() => input,
        };
        if input.is_none() {
            return;
        }
        // coalesce a burst of triggers into one resolution pass
        while rx.try_recv().is_ok() {}

        if !engine.cr_enabled() {
            continue;
        }
        for attempt in 0..MAX_RESOLVE_ATTEMPTS {
            match resolve_once(&engine).await {
                Ok(_) => break,
                Err(err) if err.is_conflict_err() => {
                    // the merged head moved mid-resolution; take it again
                    debug!("resolution conflicted (attempt {}), retrying", attempt);
                    continue;
                }
                Err(err) => {
                    warn!("conflict resolution failed: {}", err);
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                    }
                    break;
                }
            }
        }
    }
}

struct TreeDir {
    path: VeilPath,
    block: DirBlock,
}

/// every directory of a head's tree, keyed by its chain-original pointer
async fn walk_tree(
    engine: &FolderEngine,
    md: &RootMetadata,
    chains: &CrChains,
) -> VeilResult<FxHashMap<BlockRef, TreeDir>> {
    let fb = FolderBranch { tlf: engine.tlf(), branch: md.branch() };
    let mut out = FxHashMap::default();
    let root_path = VeilPath::root(fb, md.data.dir.ptr(), engine.handle().canonical_name().to_owned());
    let mut queue = vec![root_path];
    while let Some(path) = queue.pop() {
        let block = engine.fetch_dir_block(md, md.branch(), path.tail_pointer()).await?;
        for (name, entry) in &block.children {
            if entry.entry.entry_type.is_dir() {
                queue.push(path.child_path(name.clone(), entry.ptr()));
            }
        }
        out.insert(chains.original_of(path.tail_pointer().block_ref()), TreeDir { path, block });
    }
    Ok(out)
}

/// the (parent dir original, entry name) a file original lives under
fn find_entry(
    tree: &FxHashMap<BlockRef, TreeDir>,
    chains: &CrChains,
    file_original: BlockRef,
) -> Option<(BlockRef, String)> {
    for (&dir_original, dir) in tree {
        for (name, entry) in &dir.block.children {
            if chains.original_of(entry.ptr().block_ref()) == file_original {
                return Some((dir_original, name.clone()));
            }
        }
    }
    None
}

/// One full resolution pass: walk back to the branch
/// point, build chains for both sides, plan and collapse per-node actions,
/// and commit a single resolution revision on the merged branch.
async fn resolve_once(engine: &Arc<FolderEngine>) -> VeilResult<bool> {
    let config = engine.config();
    let mdops = config.mdops();
    let tlf = engine.tlf();

    let _writer = engine.md_writer_guard().await;
    let (unmerged_head, branch, staged) = engine.head_snapshot().await;
    if !staged {
        return Ok(false);
    }
    trace!(
        "resolving branch {} of {} at revision {}",
        branch, tlf, unmerged_head.md.revision
    );

    // the whole unmerged branch, oldest first; its first revision sits
    // just past the branch point
    let unmerged = mdops
        .get_range(tlf, branch, MdStatus::Unmerged, Revision::INITIAL, unmerged_head.md.revision)
        .await?;
    ensure!(!unmerged.is_empty(), "staged engine with an empty unmerged branch");
    let branch_point = unmerged[0].md.revision.prev();

    let merged_head = mdops
        .get_for_tlf(tlf, BranchId::NULL, MdStatus::Merged)
        .await?
        .ok_or_else(|| anyhow!("no merged head to resolve against"))?;
    let merged = mdops
        .get_range(
            tlf,
            BranchId::NULL,
            MdStatus::Merged,
            branch_point.next(),
            merged_head.md.revision,
        )
        .await?;

    let mut unmerged_mds: Vec<RootMetadata> = Vec::with_capacity(unmerged.len());
    for mut md in unmerged {
        engine.reembed_changes(&mut md.md).await?;
        unmerged_mds.push(md.md);
    }
    let mut merged_mds: Vec<RootMetadata> = Vec::with_capacity(merged.len());
    for mut md in merged {
        engine.reembed_changes(&mut md.md).await?;
        merged_mds.push(md.md);
    }

    let writer_name = config
        .identity()
        .username(config.uid())
        .await
        .unwrap_or_else(|_| config.uid().to_string());
    let renamer = WriterDateConflictRenamer::new(writer_name, chrono::Utc::now());

    let mut uchains = CrChains::build(&unmerged_mds)?;
    uchains.collapse();
    let mchains = CrChains::build(&merged_mds)?;

    let utree = walk_tree(engine, unmerged_mds.last().expect("nonempty"), &uchains).await?;
    let mtree = walk_tree(engine, &merged_head.md, &mchains).await?;

    // plan actions; entry-level ops act on their directory chain, file
    // chains act on the file's parent
    let mut planned: FxHashMap<BlockRef, Vec<CrAction>> = FxHashMap::default();
    for (original, uchain) in &uchains.by_original {
        if uchain.ops.is_empty() {
            continue;
        }
        let (target_dir, name) = if uchain.is_file {
            match find_entry(&utree, &uchains, *original) {
                Some(found) => found,
                // the file vanished from its own tree (removed later in
                // the branch); nothing to merge
                None => continue,
            }
        } else {
            if !utree.contains_key(original) {
                continue;
            }
            (*original, String::new())
        };

        let merged_ops = mchains.chain_for(*original).map(|c| c.ops.as_slice()).unwrap_or(&[]);
        let actions = planned.entry(target_dir).or_default();
        for uop in &uchain.ops {
            let mut conflicted = false;
            for mop in merged_ops {
                if let Some(action) = uop.check_conflict(&renamer, mop, uchain.is_file, &name) {
                    actions.push(action);
                    conflicted = true;
                }
            }
            if !conflicted {
                if let Some(action) = uop.default_action(&name) {
                    actions.push(action);
                }
            }
        }
    }

    // build the resolution revision
    let mut res_md = merged_head.md.make_successor(merged_head.id);
    let mut resolution = ResolutionOp::default();
    for unmerged_md in &unmerged_mds {
        // the branch's root blocks die with the branch
        resolution.common.add_unref_block(unmerged_md.data.dir.ptr());
    }
    res_md.add_op(Op::Resolution(resolution));

    let mut modified: Vec<(VeilPath, Block, Option<crate::block::DirEntry>)> = Vec::new();
    for (dir_original, actions) in planned {
        let actions = collapse_actions(actions);
        if actions.is_empty() {
            continue;
        }
        // a directory that only exists on the unmerged side is adopted
        // wholesale through its parent's entry copy
        let Some(merged_dir) = mtree.get(&dir_original) else { continue };
        let unmerged_block = utree
            .get(&dir_original)
            .map(|d| d.block.clone())
            .unwrap_or_default();

        let mut new_block = merged_dir.block.clone();
        for action in &actions {
            trace!("applying {} under {}", action, merged_dir.path);
            action.apply(&unmerged_block, &merged_dir.block, &mut new_block)?;
        }
        if new_block != merged_dir.block {
            modified.push((merged_dir.path.clone(), Block::Dir(new_block), None));
        }
    }

    if modified.is_empty() {
        // everything the branch did was superseded; adopt the merged head
        debug!("resolution of {} is trivial; fast-forwarding", branch);
        mdops.prune_branch(tlf, branch).await?;
        engine.install_head(merged_head, false, BranchId::NULL).await;
        return Ok(true);
    }

    let mut state = BlockPutState::new();
    engine
        .sync_tree(&merged_head.md, BranchId::NULL, &mut res_md, modified, &mut state)
        .await?;

    let cancel = engine.shutdown_token().child_token();
    let (_recoverable, put_result) = config.bops().do_block_puts(&cancel, tlf, &state).await;
    put_result?;

    let id = mdops.put(&mut res_md).await?;
    debug!("resolution revision {} accepted; pruning {}", res_md.revision, branch);
    mdops.prune_branch(tlf, branch).await?;

    for entry in state.iter() {
        config.block_cache().put(
            entry.ptr,
            tlf,
            entry.block.clone(),
            crate::bcache::BlockLifetime::Permanent,
        );
    }
    engine.install_head(MdWithId { md: res_md, id }, false, BranchId::NULL).await;
    Ok(true)
}
