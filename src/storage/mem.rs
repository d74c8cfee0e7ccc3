use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::{NodeData, NodeId, StorageStrategy, NO_NODE};
use crate::{error::io_invalid_data, options::validate_max_node_size, Error, HashMap, TreeLock};

/// A [StorageStrategy] keeping every node in memory.
///
/// Transactions are fully isolated: writes are staged until `commit` and dropped by `abort`,
/// which also rolls back the id allocator.
pub struct MemoryStorage<K, V> {
    max_node_size: usize,
    lock: TreeLock,
    state: Mutex<MemState<K, V>>,
    loads: AtomicU64,
}

struct MemState<K, V> {
    nodes: HashMap<NodeId, NodeData<K, V>>,
    root_id: NodeId,
    next_id: NodeId,
    free_ids: Vec<NodeId>,
    txn: Option<MemTxn<K, V>>,
}

struct MemTxn<K, V> {
    /// `None` marks a freed node
    writes: HashMap<NodeId, Option<NodeData<K, V>>>,
    root_id: Option<NodeId>,
    cleared: bool,
    freed: Vec<NodeId>,
    // allocator state at begin
    next_id: NodeId,
    free_ids: Vec<NodeId>,
}

impl<K, V> MemTxn<K, V> {
    fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.root_id.is_none() && !self.cleared
    }
}

impl<K, V> std::fmt::Debug for MemoryStorage<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryStorage")
            .field("max_node_size", &self.max_node_size)
            .field("nodes", &state.nodes.len())
            .field("root_id", &state.root_id)
            .field("in_txn", &state.txn.is_some())
            .finish()
    }
}

impl<K, V> MemoryStorage<K, V> {
    /// Creates an empty storage with the given node capacity.
    pub fn new(max_node_size: usize) -> Result<Self, Error> {
        validate_max_node_size(max_node_size)?;
        Ok(Self {
            max_node_size,
            lock: TreeLock::new(),
            state: Mutex::new(MemState {
                nodes: Default::default(),
                root_id: NO_NODE,
                next_id: 0,
                free_ids: Vec::new(),
                txn: None,
            }),
            loads: AtomicU64::new(0),
        })
    }

    /// Number of committed nodes.
    pub fn node_count(&self) -> usize {
        self.state.lock().nodes.len()
    }

    /// Number of node loads served so far (both full and metadata-only).
    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }
}

impl<K: Clone, V: Clone> MemState<K, V> {
    fn txn_mut(&mut self) -> Result<&mut MemTxn<K, V>, Error> {
        self.txn
            .as_mut()
            .ok_or_else(|| Error::illegal_state("Storage write outside of a transaction"))
    }

    fn visible(&self, id: NodeId) -> Result<&NodeData<K, V>, Error> {
        let found = match &self.txn {
            Some(txn) => match txn.writes.get(&id) {
                Some(write) => write.as_ref(),
                None if txn.cleared => None,
                None => self.nodes.get(&id),
            },
            None => self.nodes.get(&id),
        };
        found.ok_or_else(|| io_invalid_data!("Node {id} not found"))
    }

    fn alloc(&mut self) -> Result<NodeId, Error> {
        self.txn_mut()?;
        Ok(if let Some(id) = self.free_ids.pop() {
            id
        } else {
            self.next_id += 1;
            self.next_id - 1
        })
    }
}

impl<K, V> StorageStrategy<K, V> for MemoryStorage<K, V>
where
    K: Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn max_node_size(&self) -> usize {
        self.max_node_size
    }

    fn load_root_node_id(&self) -> Result<NodeId, Error> {
        let state = self.state.lock();
        Ok(state
            .txn
            .as_ref()
            .and_then(|txn| txn.root_id)
            .unwrap_or(state.root_id))
    }

    fn save_root_node_id(&self, id: NodeId) -> Result<(), Error> {
        self.state.lock().txn_mut()?.root_id = Some(id);
        Ok(())
    }

    fn load_node(&self, id: NodeId, data: &mut NodeData<K, V>) -> Result<(), Error> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        let state = self.state.lock();
        data.clone_from(state.visible(id)?);
        Ok(())
    }

    fn load_node_except_entries(
        &self,
        id: NodeId,
        data: &mut NodeData<K, V>,
    ) -> Result<(), Error> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        let state = self.state.lock();
        let node = state.visible(id)?;
        data.clear();
        data.size = node.size;
        data.children.clone_from(&node.children);
        Ok(())
    }

    fn save_node(&self, id: NodeId, data: &NodeData<K, V>) -> Result<(), Error> {
        debug_assert_eq!(data.size, data.entries.len());
        debug_assert!(data.size <= self.max_node_size);
        self.state
            .lock()
            .txn_mut()?
            .writes
            .insert(id, Some(data.clone()));
        Ok(())
    }

    fn alloc_leaf_node(&self) -> Result<NodeId, Error> {
        self.state.lock().alloc()
    }

    fn alloc_non_leaf_node(&self) -> Result<NodeId, Error> {
        self.state.lock().alloc()
    }

    fn free_node(&self, id: NodeId) -> Result<(), Error> {
        let mut state = self.state.lock();
        let txn = state.txn_mut()?;
        txn.writes.insert(id, None);
        txn.freed.push(id);
        Ok(())
    }

    fn clear(&self) -> Result<bool, Error> {
        let mut state = self.state.lock();
        let txn = state.txn_mut()?;
        txn.writes.clear();
        txn.freed.clear();
        txn.cleared = true;
        txn.root_id = Some(NO_NODE);
        state.next_id = 0;
        state.free_ids.clear();
        Ok(true)
    }

    fn lock(&self) -> &TreeLock {
        &self.lock
    }

    fn begin(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.txn.is_some() {
            return Err(Error::illegal_state("Transaction already in progress"));
        }
        state.txn = Some(MemTxn {
            writes: Default::default(),
            root_id: None,
            cleared: false,
            freed: Vec::new(),
            next_id: state.next_id,
            free_ids: state.free_ids.clone(),
        });
        Ok(())
    }

    fn commit(&self) -> Result<bool, Error> {
        let mut state = self.state.lock();
        let Some(txn) = state.txn.take() else {
            return Err(Error::illegal_state("Commit without a transaction"));
        };
        if txn.is_empty() {
            return Ok(false);
        }
        if txn.cleared {
            state.nodes.clear();
        }
        for (id, write) in txn.writes {
            match write {
                Some(data) => {
                    state.nodes.insert(id, data);
                }
                None => {
                    state.nodes.remove(&id);
                }
            }
        }
        state.free_ids.extend(txn.freed);
        if let Some(root_id) = txn.root_id {
            state.root_id = root_id;
        }
        Ok(true)
    }

    fn abort(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        if let Some(txn) = state.txn.take() {
            state.next_id = txn.next_id;
            state.free_ids = txn.free_ids;
        }
        Ok(())
    }

    fn force(&self) -> Result<bool, Error> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(entries: &[(u32, u32)]) -> NodeData<u32, u32> {
        NodeData {
            size: entries.len(),
            entries: entries.to_vec(),
            children: None,
        }
    }

    #[test]
    fn writes_need_a_transaction() {
        let storage = MemoryStorage::<u32, u32>::new(4).unwrap();
        assert!(matches!(storage.alloc_leaf_node(), Err(Error::IllegalState(_))));
        assert!(matches!(storage.save_root_node_id(0), Err(Error::IllegalState(_))));
        assert!(matches!(storage.commit(), Err(Error::IllegalState(_))));
    }

    #[test]
    fn commit_publishes_and_abort_discards() {
        let storage = MemoryStorage::<u32, u32>::new(4).unwrap();
        storage.begin().unwrap();
        let id = storage.alloc_leaf_node().unwrap();
        storage.save_node(id, &leaf(&[(1, 10)])).unwrap();
        storage.save_root_node_id(id).unwrap();
        // read your own writes
        let mut data = NodeData::default();
        storage.load_node(id, &mut data).unwrap();
        assert_eq!(data.entries, vec![(1, 10)]);
        assert!(storage.commit().unwrap());
        assert_eq!(storage.load_root_node_id().unwrap(), id);
        assert_eq!(storage.node_count(), 1);

        storage.begin().unwrap();
        let id2 = storage.alloc_leaf_node().unwrap();
        assert_ne!(id, id2);
        storage.save_node(id2, &leaf(&[(2, 20)])).unwrap();
        storage.free_node(id).unwrap();
        assert!(storage.load_node(id, &mut data).is_err());
        storage.abort().unwrap();

        assert_eq!(storage.node_count(), 1);
        storage.load_node(id, &mut data).unwrap();
        assert_eq!(data.entries, vec![(1, 10)]);
        storage.begin().unwrap();
        assert_eq!(storage.alloc_leaf_node().unwrap(), id2, "allocator rolled back");
        assert!(!storage.commit().unwrap());
    }

    #[test]
    fn freed_ids_are_reused_after_commit() {
        let storage = MemoryStorage::<u32, u32>::new(4).unwrap();
        storage.begin().unwrap();
        let a = storage.alloc_leaf_node().unwrap();
        storage.save_node(a, &leaf(&[(1, 1)])).unwrap();
        storage.commit().unwrap();

        storage.begin().unwrap();
        storage.free_node(a).unwrap();
        assert_ne!(storage.alloc_leaf_node().unwrap(), a);
        storage.commit().unwrap();

        storage.begin().unwrap();
        assert_eq!(storage.alloc_non_leaf_node().unwrap(), a);
        storage.abort().unwrap();
    }

    #[test]
    fn clear_and_metadata_loads() {
        let storage = MemoryStorage::<u32, u32>::new(4).unwrap();
        storage.begin().unwrap();
        let a = storage.alloc_leaf_node().unwrap();
        let b = storage.alloc_non_leaf_node().unwrap();
        storage.save_node(a, &leaf(&[(1, 1), (2, 2)])).unwrap();
        storage
            .save_node(
                b,
                &NodeData {
                    size: 1,
                    entries: vec![(3, 3)],
                    children: Some(vec![a, a]),
                },
            )
            .unwrap();
        storage.save_root_node_id(b).unwrap();
        storage.commit().unwrap();

        let mut data = NodeData::default();
        storage.load_node_except_entries(b, &mut data).unwrap();
        assert_eq!(data.size, 1);
        assert!(data.entries.is_empty());
        assert_eq!(data.children, Some(vec![a, a]));

        storage.begin().unwrap();
        assert!(storage.clear().unwrap());
        assert_eq!(storage.load_root_node_id().unwrap(), NO_NODE);
        assert!(storage.load_node(a, &mut data).is_err());
        storage.commit().unwrap();
        assert_eq!(storage.node_count(), 0);
        assert_eq!(storage.loads(), 2);
    }
}
