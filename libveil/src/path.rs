use crate::block::BlockPointer;
use crate::id::{BranchId, TlfId};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display, Formatter};

/// A folder plus which fork of its revision chain we are operating on.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FolderBranch {
    pub tlf: TlfId,
    pub branch: BranchId,
}

impl FolderBranch {
    pub fn merged(tlf: TlfId) -> Self {
        Self { tlf, branch: BranchId::NULL }
    }

    #[inline]
    pub fn is_merged(self) -> bool {
        self.branch.is_null()
    }
}

impl Display for FolderBranch {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tlf, self.branch)
    }
}

#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
pub struct PathNode {
    pub ptr: BlockPointer,
    pub name: String,
}

/// A path from a folder's root block to some descendant, one node per
/// level. Valid iff non-empty with every node's pointer initialized.
#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
pub struct VeilPath {
    pub folder_branch: FolderBranch,
    pub nodes: Vec<PathNode>,
}

impl VeilPath {
    pub fn root(folder_branch: FolderBranch, root_ptr: BlockPointer, name: String) -> Self {
        Self { folder_branch, nodes: vec![PathNode { ptr: root_ptr, name }] }
    }

    pub fn is_valid(&self) -> bool {
        !self.nodes.is_empty() && self.nodes.iter().all(|node| node.ptr.is_valid())
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.nodes.len()
    }

    pub fn tail(&self) -> &PathNode {
        self.nodes.last().expect("empty path")
    }

    pub fn tail_pointer(&self) -> BlockPointer {
        self.tail().ptr
    }

    pub fn tail_name(&self) -> &str {
        &self.tail().name
    }

    pub fn root_pointer(&self) -> BlockPointer {
        self.nodes.first().expect("empty path").ptr
    }

    /// does the path have a parent directory within this folder?
    pub fn has_valid_parent(&self) -> bool {
        self.nodes.len() > 1 && self.parent_path().is_valid()
    }

    pub fn parent_path(&self) -> VeilPath {
        let mut nodes = self.nodes.clone();
        nodes.pop();
        Self { folder_branch: self.folder_branch, nodes }
    }

    pub fn child_path(&self, name: impl Into<String>, ptr: BlockPointer) -> VeilPath {
        let mut nodes = self.nodes.clone();
        nodes.push(PathNode { ptr, name: name.into() });
        Self { folder_branch: self.folder_branch, nodes }
    }
}

impl Display for VeilPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.nodes.iter().map(|node| node.name.as_str()).collect::<Vec<_>>().join("/"))
    }
}
