//! Node persistence.
//!
//! A [StorageStrategy] owns everything about how nodes are stored: their identifiers,
//! their serialized form, the root pointer and the transaction boundaries used by the
//! tree around each mutation.

use crate::{Error, TreeLock};

pub mod codec;
pub mod file;
pub mod mem;

/// Opaque node identifier assigned by a [StorageStrategy].
pub type NodeId = i64;

/// Identifier meaning "no node", e.g. the root id of an empty tree.
pub const NO_NODE: NodeId = -1;

/// Transfer record used to move node contents across the storage boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeData<K, V> {
    /// Number of entries in the node.
    pub size: usize,
    /// The node entries in key order. Only filled by [StorageStrategy::load_node].
    pub entries: Vec<(K, V)>,
    /// The `size + 1` children ids of non-leaf nodes, `None` for leaves.
    pub children: Option<Vec<NodeId>>,
}

impl<K, V> Default for NodeData<K, V> {
    fn default() -> Self {
        Self {
            size: 0,
            entries: Vec::new(),
            children: None,
        }
    }
}

impl<K, V> NodeData<K, V> {
    /// Whether the node is a leaf.
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    /// Resets the record so it can be reused for another load.
    pub fn clear(&mut self) {
        self.size = 0;
        self.entries.clear();
        self.children = None;
    }
}

/// Pluggable persistence backend of a [crate::BTree].
///
/// All methods take `&self`: implementations use interior mutability and may rely on the
/// tree holding the [TreeLock] returned by [StorageStrategy::lock] (shared mode for loads,
/// exclusive mode for everything between `begin` and `commit`).
///
/// Writes (`save_*`, `alloc_*`, `free_node`) are only valid inside a transaction. A
/// transaction must be atomic: after a crash, or after [StorageStrategy::abort], none of its
/// writes may be visible.
pub trait StorageStrategy<K, V>: Send + Sync {
    /// Fixed capacity (in entries) of every node.
    fn max_node_size(&self) -> usize;

    /// Returns the persisted root id, [NO_NODE] for an empty tree.
    fn load_root_node_id(&self) -> Result<NodeId, Error>;

    /// Persists the root id.
    fn save_root_node_id(&self, id: NodeId) -> Result<(), Error>;

    /// Loads the node contents into `data`.
    fn load_node(&self, id: NodeId, data: &mut NodeData<K, V>) -> Result<(), Error>;

    /// Loads only the node size and children into `data`, leaving `data.entries` empty.
    fn load_node_except_entries(&self, id: NodeId, data: &mut NodeData<K, V>)
        -> Result<(), Error>;

    /// Persists the node contents.
    fn save_node(&self, id: NodeId, data: &NodeData<K, V>) -> Result<(), Error>;

    /// Allocates an id for a new leaf node.
    fn alloc_leaf_node(&self) -> Result<NodeId, Error>;

    /// Allocates an id for a new non-leaf node.
    fn alloc_non_leaf_node(&self) -> Result<NodeId, Error>;

    /// Releases a node id and its contents.
    fn free_node(&self, id: NodeId) -> Result<(), Error>;

    /// Attempts to remove every node in bulk. Returning `false` means bulk clearing isn't
    /// supported and the tree will free each node individually instead.
    fn clear(&self) -> Result<bool, Error>;

    /// The lock shared by the tree and this storage.
    fn lock(&self) -> &TreeLock;

    /// Starts a transaction.
    fn begin(&self) -> Result<(), Error>;

    /// Makes the writes since [StorageStrategy::begin] durable and visible.
    /// Returns whether anything was written.
    fn commit(&self) -> Result<bool, Error>;

    /// Discards the writes since [StorageStrategy::begin]. Does nothing without a transaction.
    fn abort(&self) -> Result<(), Error>;

    /// Flushes committed data to durable media. Returns whether anything was flushed.
    fn force(&self) -> Result<bool, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_data_reuse() {
        let mut data = NodeData {
            size: 1,
            entries: vec![(1u32, 2u32)],
            children: Some(vec![3, 4]),
        };
        assert!(!data.is_leaf());
        data.clear();
        assert_eq!(data, NodeData::default());
        assert!(data.is_leaf());
    }
}
