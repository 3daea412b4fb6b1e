use crate::block::BlockPointer;
use crate::id::BlockRef;
use crate::path::{FolderBranch, PathNode, VeilPath};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fmt::{self, Debug, Formatter};

/// Opaque handle to a node in the folder's namespace. Handles stay valid
/// across renames and pointer updates; the arena slot only dies with the
/// engine.
#[derive(PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct NodeId(usize);

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

struct NodeCore {
    ptr: BlockPointer,
    name: String,
    /// arena index of the parent; `None` for the root and for unlinked
    /// nodes (whose last known path is cached instead)
    parent: Option<NodeId>,
    cached_path: Option<VeilPath>,
}

#[derive(Default)]
struct Inner {
    arena: Vec<NodeCore>,
    by_ref: FxHashMap<BlockRef, NodeId>,
}

/// Per-engine map from block references to namespace nodes. Parent links
/// are arena indices, so moving a node is a single rewrite and cycles of
/// ownership never form.
#[derive(Default)]
pub struct NodeCache {
    inner: RwLock<Inner>,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(
        &self,
        ptr: BlockPointer,
        name: impl Into<String>,
        parent: Option<NodeId>,
    ) -> NodeId {
        let mut inner = self.inner.write();
        if let Some(&id) = inner.by_ref.get(&ptr.block_ref()) {
            return id;
        }
        let id = NodeId(inner.arena.len());
        inner.arena.push(NodeCore { ptr, name: name.into(), parent, cached_path: None });
        inner.by_ref.insert(ptr.block_ref(), id);
        id
    }

    pub fn get(&self, block_ref: BlockRef) -> Option<NodeId> {
        self.inner.read().by_ref.get(&block_ref).copied()
    }

    pub fn pointer_for(&self, node: NodeId) -> BlockPointer {
        self.inner.read().arena[node.0].ptr
    }

    /// Rebind a node to its post-sync pointer. Must happen before the
    /// copy-on-write window closes so later reads observe the new pointer.
    pub fn update_pointer(&self, old_ref: BlockRef, new_ptr: BlockPointer) {
        let mut inner = self.inner.write();
        if let Some(id) = inner.by_ref.remove(&old_ref) {
            inner.arena[id.0].ptr = new_ptr;
            inner.by_ref.insert(new_ptr.block_ref(), id);
        }
    }

    /// linear scan; directories are small and this only runs on head swaps
    pub fn find_child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        let inner = self.inner.read();
        inner
            .arena
            .iter()
            .position(|core| core.parent == Some(parent) && core.name == name)
            .map(NodeId)
    }

    pub fn move_node(&self, block_ref: BlockRef, new_parent: NodeId, new_name: impl Into<String>) {
        let mut inner = self.inner.write();
        if let Some(&id) = inner.by_ref.get(&block_ref) {
            let core = &mut inner.arena[id.0];
            core.parent = Some(new_parent);
            core.name = new_name.into();
        }
    }

    /// Sever a node from the tree while remembering where it used to live,
    /// so in-flight reads and syncs of the open file still resolve.
    pub fn unlink(&self, block_ref: BlockRef, last_path: VeilPath) {
        let mut inner = self.inner.write();
        if let Some(&id) = inner.by_ref.get(&block_ref) {
            let core = &mut inner.arena[id.0];
            core.parent = None;
            core.cached_path = Some(last_path);
        }
    }

    pub fn is_unlinked(&self, node: NodeId) -> bool {
        self.inner.read().arena[node.0].cached_path.is_some()
    }

    /// Path from the folder root to this node under the current pointers.
    pub fn path_from_node(&self, folder_branch: FolderBranch, node: NodeId) -> VeilPath {
        let inner = self.inner.read();
        if let Some(cached) = &inner.arena[node.0].cached_path {
            return cached.clone();
        }
        let mut nodes = Vec::new();
        let mut cursor = Some(node);
        while let Some(id) = cursor {
            let core = &inner.arena[id.0];
            nodes.push(PathNode { ptr: core.ptr, name: core.name.clone() });
            cursor = core.parent;
        }
        nodes.reverse();
        VeilPath { folder_branch, nodes }
    }
}
