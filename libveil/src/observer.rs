use crate::nodecache::NodeId;
use crate::ops::WriteRange;

/// What changed about one node in a batch of applied metadata.
#[derive(Debug, Clone, Default)]
pub struct NodeChange {
    pub node: Option<NodeId>,
    /// child names whose entries changed, for directory nodes
    pub dir_updated: Vec<String>,
    /// byte ranges rewritten, for file nodes
    pub file_updated: Vec<WriteRange>,
}

/// Receives change notifications from a folder engine. `local_change`
/// fires synchronously with the mutating call; `batch_changes` fires after
/// a new head is installed (own syncs and remote updates alike).
pub trait Observer: Send + Sync {
    fn local_change(&self, node: NodeId, range: WriteRange);

    fn batch_changes(&self, changes: &[NodeChange]);
}
