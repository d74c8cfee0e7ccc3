use std::{
    cmp::Ordering,
    fmt::Write as _,
    marker::PhantomData,
    ops::{Bound, ControlFlow, RangeBounds},
    sync::atomic::{self, AtomicI64},
};

use parking_lot::RwLock;
use smallvec::SmallVec;
use triomphe::Arc;

use crate::{
    error::{error_validation, io_invalid_data},
    node::Node,
    options::validate_max_node_size,
    storage::{NodeData, NodeId, StorageStrategy, NO_NODE},
    Comparator, Error, HashMap, HashSet, NaturalOrder, TreeLock, TreeOptions,
};

type NodeRef<K, V> = Arc<Node<K, V>>;

type NodeCache<K, V> =
    quick_cache::sync::Cache<NodeId, NodeRef<K, V>, NodeWeighter, foldhash::fast::RandomState>;

#[derive(Clone, Debug)]
pub(crate) struct NodeWeighter;

impl<K, V> quick_cache::Weighter<NodeId, NodeRef<K, V>> for NodeWeighter {
    fn weight(&self, _key: &NodeId, val: &NodeRef<K, V>) -> u64 {
        val.len() as u64 + 1
    }
}

/// Persistent B-Tree
///
/// An ordered map whose nodes are stored by a [StorageStrategy]. Keys are ordered by the
/// tree [Comparator] ([NaturalOrder] by default).
///
/// # Nodes
///
/// Every node holds at most `max_node_size` entries (a storage property) and every node but
/// the root holds at least `max_node_size / 2`. Inserting into a full node splits it around
/// its median entry, which moves up to the parent; a root split grows the tree by one level.
/// Removals that leave a node under the minimum borrow one entry from a sibling through the
/// parent separator, or merge the node with a sibling. A root left without entries is replaced
/// by its only child, shrinking the tree by one level.
///
/// # Concurrency
///
/// All operations go through the [TreeLock] of the storage. Reads take it in shared mode,
/// [BTree::insert] and the clear operations take it exclusively and [BTree::remove] takes it in
/// upgradable mode, upgrading only once it knows the key exists. Lock waits can be interrupted
/// with [TreeLock::interrupt_waiters].
///
/// # Atomicity
///
/// Each mutation runs inside one storage transaction. The nodes touched by a mutation are
/// modified as private copies and written between `begin` and `commit`; if anything fails
/// the transaction is aborted and the tree is left unchanged.
///
/// # Node cache
///
/// Loaded nodes are kept in a bounded cache (see [TreeOptions::node_cache_size]). Evicted
/// nodes are reloaded from the storage on their next access.
pub struct BTree<K, V, S, C = NaturalOrder> {
    storage: S,
    comparator: C,
    max_node_size: usize,
    min_node_size: usize,
    root: RwLock<RootState<K, V>>,
    /// -1 when unknown
    total_size: AtomicI64,
    cache: NodeCache<K, V>,
}

struct RootState<K, V> {
    id: NodeId,
    node: Option<NodeRef<K, V>>,
}

/// Shape of a tree, as computed by [BTree::verify].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    /// Number of levels, 0 for an empty tree.
    pub height: usize,
    /// Total number of nodes.
    pub nodes: usize,
    /// Number of leaf nodes.
    pub leaves: usize,
    /// Number of entries in the root node.
    pub root_len: usize,
    /// Total number of entries.
    pub entries: u64,
}

enum Insertion<K, V> {
    Replaced(V),
    Inserted,
    /// Promoted entry and the id of the new high sibling
    Split(K, V, NodeId),
}

impl<K, V, S, C> std::fmt::Debug for BTree<K, V, S, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTree")
            .field("root_id", &self.root.read().id)
            .field("total_size", &self.total_size.load(atomic::Ordering::Relaxed))
            .field("max_node_size", &self.max_node_size)
            .finish()
    }
}

impl<K, V, S> BTree<K, V, S, NaturalOrder>
where
    K: Ord + Clone,
    V: Clone,
    S: StorageStrategy<K, V>,
{
    /// Opens the tree stored in `storage` with default [TreeOptions].
    pub fn open(storage: S) -> Result<Self, Error> {
        Self::with_options(storage, TreeOptions::default())
    }

    /// Opens the tree stored in `storage`.
    pub fn with_options(storage: S, options: TreeOptions) -> Result<Self, Error> {
        Self::with_comparator(storage, options, NaturalOrder)
    }
}

impl<K, V, S, C> BTree<K, V, S, C>
where
    K: Clone,
    V: Clone,
    S: StorageStrategy<K, V>,
    C: Comparator<K>,
{
    /// Opens the tree stored in `storage`, ordering keys with `comparator`.
    ///
    /// The comparator must be the same every time a non-empty tree is opened.
    pub fn with_comparator(
        storage: S,
        options: TreeOptions,
        comparator: C,
    ) -> Result<Self, Error> {
        options.validate()?;
        let max_node_size = storage.max_node_size();
        validate_max_node_size(max_node_size)?;
        let root_id = {
            let _guard = storage.lock().read()?;
            storage.load_root_node_id()?
        };
        let min_node_size = max_node_size / 2;
        let estimated_items = (options.node_cache_size / (min_node_size + 1)).max(1);
        let cache = NodeCache::<K, V>::with_options(
            quick_cache::OptionsBuilder::new()
                .estimated_items_capacity(estimated_items)
                .weight_capacity(options.node_cache_size.max(1) as u64)
                .build()
                .map_err(|e| error_validation!("Invalid node cache options: {e:?}"))?,
            NodeWeighter,
            Default::default(),
            Default::default(),
        );
        debug!("Opened tree root {root_id} max_node_size {max_node_size}");
        Ok(Self {
            storage,
            comparator,
            max_node_size,
            min_node_size,
            root: RwLock::new(RootState {
                id: root_id,
                node: None,
            }),
            total_size: AtomicI64::new(if root_id == NO_NODE { 0 } else { -1 }),
            cache,
        })
    }

    /// The comparator used to order keys.
    #[inline]
    pub fn comparator(&self) -> &C {
        &self.comparator
    }

    /// The lock guarding this tree, shared with its storage.
    #[inline]
    pub fn lock(&self) -> &TreeLock {
        self.storage.lock()
    }

    /// The storage strategy.
    #[inline]
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Maximum number of entries per node.
    #[inline]
    pub fn max_node_size(&self) -> usize {
        self.max_node_size
    }

    /// Flushes committed data to durable media, see [StorageStrategy::force].
    pub fn force(&self) -> Result<bool, Error> {
        let _guard = self.lock().read()?;
        self.storage.force()
    }

    #[inline]
    fn root_id(&self) -> NodeId {
        self.root.read().id
    }

    fn root_node(&self) -> Result<Option<NodeRef<K, V>>, Error> {
        let id = {
            let root = self.root.read();
            if root.id == NO_NODE {
                return Ok(None);
            }
            if let Some(node) = &root.node {
                return Ok(Some(node.clone()));
            }
            root.id
        };
        let node = self.load_node(id)?;
        let mut root = self.root.write();
        if root.id == id {
            root.node = Some(node.clone());
        }
        Ok(Some(node))
    }

    /// Returns the node from the cache, loading it from the storage on a miss.
    fn node(&self, id: NodeId) -> Result<NodeRef<K, V>, Error> {
        {
            let root = self.root.read();
            if root.id == id {
                if let Some(node) = &root.node {
                    return Ok(node.clone());
                }
            }
        }
        self.load_node(id)
    }

    fn load_node(&self, id: NodeId) -> Result<NodeRef<K, V>, Error> {
        if let Some(node) = self.cache.get(&id) {
            return Ok(node);
        }
        let mut data = NodeData::default();
        self.storage.load_node(id, &mut data)?;
        if data.size > self.max_node_size {
            return Err(io_invalid_data!(
                "Node {id} has {} entries, more than max_node_size {}",
                data.size,
                self.max_node_size
            ));
        }
        let node = Arc::new(Node::from_data(id, data));
        self.cache.insert(id, node.clone());
        Ok(node)
    }

    /// Returns the number of entries in the tree.
    ///
    /// The count is cached, when unknown (e.g. right after opening an existing tree) it's
    /// recomputed by walking every node with metadata-only loads.
    pub fn len(&self) -> Result<u64, Error> {
        let _guard = self.lock().read()?;
        self.len_inner()
    }

    fn len_inner(&self) -> Result<u64, Error> {
        let total = self.total_size.load(atomic::Ordering::Acquire);
        if total >= 0 {
            return Ok(total as u64);
        }
        let root_id = self.root_id();
        let total = if root_id == NO_NODE {
            0
        } else {
            self.count_subtree(root_id)?
        };
        trace!("Recomputed tree size {total}");
        self.total_size.store(total as i64, atomic::Ordering::Release);
        Ok(total)
    }

    fn count_subtree(&self, id: NodeId) -> Result<u64, Error> {
        let (size, children) = if let Some(node) = self.cache.get(&id) {
            (node.len(), node.children().to_vec())
        } else {
            let mut data = NodeData::default();
            self.storage.load_node_except_entries(id, &mut data)?;
            (data.size, data.children.unwrap_or_default())
        };
        let mut total = size as u64;
        for child in children {
            total += self.count_subtree(child)?;
        }
        Ok(total)
    }

    /// Returns whether the tree is empty.
    pub fn is_empty(&self) -> Result<bool, Error> {
        let _guard = self.lock().read()?;
        Ok(self.root_id() == NO_NODE)
    }

    fn find<R>(
        &self,
        key: &K,
        f: impl FnOnce(&Node<K, V>, usize) -> R,
    ) -> Result<Option<R>, Error> {
        let Some(mut node) = self.root_node()? else {
            return Ok(None);
        };
        loop {
            match node.search(key, &self.comparator) {
                Ok(i) => return Ok(Some(f(&node, i))),
                Err(_) if node.is_leaf() => return Ok(None),
                Err(i) => node = self.node(node.child(i))?,
            }
        }
    }

    /// Returns the value corresponding to the key.
    pub fn get(&self, key: &K) -> Result<Option<V>, Error> {
        let _guard = self.lock().read()?;
        self.find(key, |node, i| node.value(i).clone())
    }

    /// Returns the stored key and value matching `key`.
    pub fn get_entry(&self, key: &K) -> Result<Option<(K, V)>, Error> {
        let _guard = self.lock().read()?;
        self.find(key, |node, i| node.entry(i))
    }

    /// Returns whether the tree contains `key`.
    pub fn contains_key(&self, key: &K) -> Result<bool, Error> {
        let _guard = self.lock().read()?;
        Ok(self.find(key, |_, _| ())?.is_some())
    }

    /// Returns whether any entry has `value`. This walks the whole tree.
    pub fn contains_value(&self, value: &V) -> Result<bool, Error>
    where
        V: PartialEq,
    {
        let _guard = self.lock().read()?;
        let found = self.walk(&mut |_, v| {
            if v == value {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })?;
        Ok(found.is_break())
    }

    /// Visits all entries in key order.
    fn walk(
        &self,
        f: &mut dyn FnMut(&K, &V) -> ControlFlow<()>,
    ) -> Result<ControlFlow<()>, Error> {
        match self.root_node()? {
            Some(root) => self.walk_node(&root, f),
            None => Ok(ControlFlow::Continue(())),
        }
    }

    fn walk_node(
        &self,
        node: &Node<K, V>,
        f: &mut dyn FnMut(&K, &V) -> ControlFlow<()>,
    ) -> Result<ControlFlow<()>, Error> {
        for i in 0..node.len() {
            if !node.is_leaf() && self.walk_node(&*self.node(node.child(i))?, f)?.is_break() {
                return Ok(ControlFlow::Break(()));
            }
            if f(node.key(i), node.value(i)).is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        if !node.is_leaf() {
            return self.walk_node(&*self.node(node.child(node.len()))?, f);
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Appends all keys, in order, to `buf`. Returns the number of keys appended.
    pub fn copy_keys_into(&self, buf: &mut Vec<K>) -> Result<usize, Error> {
        let _guard = self.lock().read()?;
        let start = buf.len();
        buf.reserve(self.len_inner()? as usize);
        let _ = self.walk(&mut |k, _| {
            buf.push(k.clone());
            ControlFlow::Continue(())
        })?;
        Ok(buf.len() - start)
    }

    /// Appends all entries, in key order, to `buf`. Returns the number of entries appended.
    pub fn copy_entries_into(&self, buf: &mut Vec<(K, V)>) -> Result<usize, Error> {
        let _guard = self.lock().read()?;
        let start = buf.len();
        buf.reserve(self.len_inner()? as usize);
        let _ = self.walk(&mut |k, v| {
            buf.push((k.clone(), v.clone()));
            ControlFlow::Continue(())
        })?;
        Ok(buf.len() - start)
    }

    fn first_in(&self, mut node: NodeRef<K, V>) -> Result<Option<(K, V)>, Error> {
        while !node.is_leaf() {
            node = self.node(node.child(0))?;
        }
        Ok((node.len() != 0).then(|| node.entry(0)))
    }

    fn last_in(&self, mut node: NodeRef<K, V>) -> Result<Option<(K, V)>, Error> {
        while !node.is_leaf() {
            node = self.node(node.child(node.len()))?;
        }
        Ok(node.len().checked_sub(1).map(|i| node.entry(i)))
    }

    /// Smallest entry with a key strictly greater than `key`.
    fn next_in(&self, node: &Node<K, V>, key: &K) -> Result<Option<(K, V)>, Error> {
        match node.search(key, &self.comparator) {
            Ok(i) if node.is_leaf() => Ok((i + 1 < node.len()).then(|| node.entry(i + 1))),
            Ok(i) => self.first_in(self.node(node.child(i + 1))?),
            Err(i) if node.is_leaf() => Ok((i < node.len()).then(|| node.entry(i))),
            Err(i) => match self.next_in(&*self.node(node.child(i))?, key)? {
                Some(entry) => Ok(Some(entry)),
                None => Ok((i < node.len()).then(|| node.entry(i))),
            },
        }
    }

    /// Largest entry with a key strictly less than `key`.
    fn previous_in(&self, node: &Node<K, V>, key: &K) -> Result<Option<(K, V)>, Error> {
        match node.search(key, &self.comparator) {
            Ok(i) | Err(i) if node.is_leaf() => Ok(i.checked_sub(1).map(|i| node.entry(i))),
            Ok(i) => self.last_in(self.node(node.child(i))?),
            Err(i) => match self.previous_in(&*self.node(node.child(i))?, key)? {
                Some(entry) => Ok(Some(entry)),
                None => Ok(i.checked_sub(1).map(|i| node.entry(i))),
            },
        }
    }

    fn first_entry_inner(&self) -> Result<Option<(K, V)>, Error> {
        match self.root_node()? {
            Some(root) => self.first_in(root),
            None => Ok(None),
        }
    }

    fn next_entry_inner(&self, key: &K) -> Result<Option<(K, V)>, Error> {
        match self.root_node()? {
            Some(root) => self.next_in(&root, key),
            None => Ok(None),
        }
    }

    /// Returns the entry with the smallest key.
    pub fn first_entry(&self) -> Result<Option<(K, V)>, Error> {
        let _guard = self.lock().read()?;
        self.first_entry_inner()
    }

    /// Returns the entry with the largest key.
    pub fn last_entry(&self) -> Result<Option<(K, V)>, Error> {
        let _guard = self.lock().read()?;
        match self.root_node()? {
            Some(root) => self.last_in(root),
            None => Ok(None),
        }
    }

    /// Returns the entry with the smallest key strictly greater than `key`.
    /// `key` doesn't need to be present in the tree.
    pub fn next_entry(&self, key: &K) -> Result<Option<(K, V)>, Error> {
        let _guard = self.lock().read()?;
        self.next_entry_inner(key)
    }

    /// Returns the entry with the largest key strictly less than `key`.
    /// `key` doesn't need to be present in the tree.
    pub fn previous_entry(&self, key: &K) -> Result<Option<(K, V)>, Error> {
        let _guard = self.lock().read()?;
        match self.root_node()? {
            Some(root) => self.previous_in(&root, key),
            None => Ok(None),
        }
    }

    /// Returns the smallest key.
    pub fn first_key(&self) -> Result<Option<K>, Error> {
        Ok(self.first_entry()?.map(|(k, _)| k))
    }

    /// Returns the largest key.
    pub fn last_key(&self) -> Result<Option<K>, Error> {
        Ok(self.last_entry()?.map(|(k, _)| k))
    }

    /// Returns the smallest key strictly greater than `key`.
    pub fn next_key(&self, key: &K) -> Result<Option<K>, Error> {
        Ok(self.next_entry(key)?.map(|(k, _)| k))
    }

    /// Returns the largest key strictly less than `key`.
    pub fn previous_key(&self, key: &K) -> Result<Option<K>, Error> {
        Ok(self.previous_entry(key)?.map(|(k, _)| k))
    }

    /// Inserts a key-value pair into the tree.
    ///
    /// If the tree did have this key present, the value is updated and the old value returned.
    pub fn insert(&self, key: K, value: V) -> Result<Option<V>, Error> {
        let _guard = self.lock().write()?;
        let txn = StorageTxn::begin(&self.storage)?;
        let mut ws = WriteSet::new(self);
        let old = ws.insert(key, value)?;
        self.commit_write_set(txn, ws)?;
        Ok(old)
    }

    /// Removes `key` from the tree, returning its value if it was present.
    pub fn remove(&self, key: &K) -> Result<Option<V>, Error> {
        let lock = self.lock();
        let guard = lock.upgradable_read()?;
        let mut ws = WriteSet::new(self);
        let Some(old) = ws.remove(key)? else {
            return Ok(None);
        };
        let _guard = lock.upgrade(guard)?;
        let txn = StorageTxn::begin(&self.storage)?;
        self.commit_write_set(txn, ws)?;
        Ok(Some(old))
    }

    /// Removes every entry whose key is within `range`, returning the number of entries removed.
    ///
    /// Keys are removed one at a time (with the usual rebalancing), but all of them in a single
    /// storage transaction.
    pub fn clear_range<R: RangeBounds<K>>(&self, range: R) -> Result<u64, Error> {
        self.clear_bounds(range.start_bound(), range.end_bound())
    }

    pub(crate) fn clear_bounds(&self, start: Bound<&K>, end: Bound<&K>) -> Result<u64, Error> {
        if let (Bound::Included(s) | Bound::Excluded(s), Bound::Included(e) | Bound::Excluded(e)) =
            (start, end)
        {
            if self.comparator.compare(s, e) == Ordering::Greater {
                return Err(Error::illegal_argument("Range start is greater than range end"));
            }
        }
        let _guard = self.lock().write()?;
        let keys = self.keys_in_bounds(start, end)?;
        if keys.is_empty() {
            return Ok(0);
        }
        trace!("Clearing {} keys", keys.len());
        let txn = StorageTxn::begin(&self.storage)?;
        let mut ws = WriteSet::new(self);
        for key in &keys {
            let removed = ws.remove(key)?;
            debug_assert!(removed.is_some());
        }
        self.commit_write_set(txn, ws)?;
        Ok(keys.len() as u64)
    }

    fn keys_in_bounds(&self, start: Bound<&K>, end: Bound<&K>) -> Result<Vec<K>, Error> {
        let mut next = match start {
            Bound::Included(k) => match self.find(k, |node, i| node.entry(i))? {
                Some(entry) => Some(entry),
                None => self.next_entry_inner(k)?,
            },
            Bound::Excluded(k) => self.next_entry_inner(k)?,
            Bound::Unbounded => self.first_entry_inner()?,
        };
        let mut keys = Vec::new();
        while let Some((key, _)) = next {
            let in_range = match end {
                Bound::Included(e) => self.comparator.compare(&key, e) != Ordering::Greater,
                Bound::Excluded(e) => self.comparator.compare(&key, e) == Ordering::Less,
                Bound::Unbounded => true,
            };
            if !in_range {
                break;
            }
            next = self.next_entry_inner(&key)?;
            keys.push(key);
        }
        Ok(keys)
    }

    /// Removes all entries.
    ///
    /// Uses the storage bulk clear when supported, otherwise frees every node individually.
    pub fn clear(&self) -> Result<(), Error> {
        let _guard = self.lock().write()?;
        let root_id = self.root_id();
        let txn = StorageTxn::begin(&self.storage)?;
        if !self.storage.clear()? && root_id != NO_NODE {
            self.free_subtree(root_id)?;
        }
        self.storage.save_root_node_id(NO_NODE)?;
        txn.commit()?;
        debug!("Cleared tree, previous root {root_id}");
        self.cache.clear();
        *self.root.write() = RootState {
            id: NO_NODE,
            node: None,
        };
        self.total_size.store(0, atomic::Ordering::Release);
        Ok(())
    }

    fn free_subtree(&self, id: NodeId) -> Result<(), Error> {
        let mut data = NodeData::default();
        self.storage.load_node_except_entries(id, &mut data)?;
        for child in data.children.into_iter().flatten() {
            self.free_subtree(child)?;
        }
        self.storage.free_node(id)
    }

    fn commit_write_set(
        &self,
        txn: StorageTxn<'_, K, V, S>,
        ws: WriteSet<'_, K, V, S, C>,
    ) -> Result<(), Error> {
        ws.flush()?;
        txn.commit()?;
        self.publish(ws);
        Ok(())
    }

    /// Makes the committed write set visible to readers: node cache, root and size.
    fn publish(&self, mut ws: WriteSet<'_, K, V, S, C>) {
        for id in &ws.freed {
            self.cache.remove(id);
        }
        let mut new_root = None;
        for id in ws.dirty.drain() {
            let Some(node) = ws.nodes.remove(&id) else {
                continue;
            };
            let node = Arc::new(node);
            if id == ws.root_id {
                new_root = Some(node.clone());
            }
            self.cache.insert(id, node);
        }
        {
            let mut root = self.root.write();
            if root.id != ws.root_id || new_root.is_some() {
                if root.id != ws.root_id {
                    trace!("Root {} -> {}", root.id, ws.root_id);
                }
                root.id = ws.root_id;
                root.node = new_root;
            }
        }
        if ws.size_delta != 0 {
            let _ = self.total_size.fetch_update(
                atomic::Ordering::AcqRel,
                atomic::Ordering::Acquire,
                |total| (total >= 0).then_some(total + ws.size_delta),
            );
        }
    }

    /// Walks the whole tree checking its structural invariants:
    /// key order, separator bounds, node fill, child counts and uniform leaf depth.
    pub fn verify(&self) -> Result<TreeStats, Error> {
        let _guard = self.lock().read()?;
        let mut stats = TreeStats::default();
        let Some(root) = self.root_node()? else {
            return Ok(stats);
        };
        stats.root_len = root.len();
        if root.len() == 0 {
            return Err(io_invalid_data!("Root node {} is empty", root.id()));
        }
        let mut leaf_depth = None;
        self.verify_node(&root, None, None, 1, &mut leaf_depth, &mut stats)?;
        stats.height = leaf_depth.unwrap_or_default();
        let total = self.total_size.load(atomic::Ordering::Acquire);
        if total >= 0 && total as u64 != stats.entries {
            return Err(io_invalid_data!(
                "Cached size {total} doesn't match {} entries",
                stats.entries
            ));
        }
        Ok(stats)
    }

    fn verify_node(
        &self,
        node: &Node<K, V>,
        lower: Option<&K>,
        upper: Option<&K>,
        depth: usize,
        leaf_depth: &mut Option<usize>,
        stats: &mut TreeStats,
    ) -> Result<(), Error> {
        let id = node.id();
        if node.len() > self.max_node_size {
            return Err(io_invalid_data!("Node {id} overflows with {} entries", node.len()));
        }
        if depth > 1 && node.len() < self.min_node_size {
            return Err(io_invalid_data!("Node {id} underflows with {} entries", node.len()));
        }
        let keys = node.keys();
        if keys
            .windows(2)
            .any(|w| self.comparator.compare(&w[0], &w[1]) != Ordering::Less)
        {
            return Err(io_invalid_data!("Node {id} keys out of order"));
        }
        if let (Some(lower), Some(first)) = (lower, keys.first()) {
            if self.comparator.compare(lower, first) != Ordering::Less {
                return Err(io_invalid_data!("Node {id} first key below its lower bound"));
            }
        }
        if let (Some(upper), Some(last)) = (upper, keys.last()) {
            if self.comparator.compare(last, upper) != Ordering::Less {
                return Err(io_invalid_data!("Node {id} last key above its upper bound"));
            }
        }
        stats.nodes += 1;
        stats.entries += node.len() as u64;
        if node.is_leaf() {
            stats.leaves += 1;
            match *leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(d) if d != depth => {
                    return Err(io_invalid_data!(
                        "Leaf {id} at depth {depth}, expected depth {d}"
                    ));
                }
                Some(_) => (),
            }
            return Ok(());
        }
        if node.children().len() != node.len() + 1 {
            return Err(io_invalid_data!(
                "Node {id} has {} children for {} entries",
                node.children().len(),
                node.len()
            ));
        }
        for (i, &child_id) in node.children().iter().enumerate() {
            let child = self.node(child_id)?;
            let lower = if i == 0 { lower } else { Some(node.key(i - 1)) };
            let upper = if i == node.len() { upper } else { Some(node.key(i)) };
            self.verify_node(&child, lower, upper, depth + 1, leaf_depth, stats)?;
        }
        Ok(())
    }

    /// Returns an indented textual representation of every node, for debugging.
    pub fn dump(&self) -> Result<String, Error>
    where
        K: std::fmt::Debug,
    {
        let _guard = self.lock().read()?;
        let mut out = String::new();
        if let Some(root) = self.root_node()? {
            self.dump_node(&root, 0, &mut out)?;
        }
        Ok(out)
    }

    fn dump_node(&self, node: &Node<K, V>, depth: usize, out: &mut String) -> Result<(), Error>
    where
        K: std::fmt::Debug,
    {
        let kind = if node.is_leaf() { "leaf" } else { "branch" };
        let _ = writeln!(
            out,
            "{:indent$}#{} {kind} {:?}",
            "",
            node.id(),
            node.keys(),
            indent = depth * 2
        );
        for &child in node.children() {
            self.dump_node(&*self.node(child)?, depth + 1, out)?;
        }
        Ok(())
    }
}

/// Aborts the storage transaction unless committed, including on panics.
struct StorageTxn<'a, K, V, S: StorageStrategy<K, V>> {
    storage: &'a S,
    active: bool,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<'a, K, V, S: StorageStrategy<K, V>> StorageTxn<'a, K, V, S> {
    fn begin(storage: &'a S) -> Result<Self, Error> {
        storage.begin()?;
        Ok(Self {
            storage,
            active: true,
            _marker: PhantomData,
        })
    }

    fn commit(mut self) -> Result<bool, Error> {
        let written = self.storage.commit()?;
        self.active = false;
        Ok(written)
    }
}

impl<K, V, S: StorageStrategy<K, V>> Drop for StorageTxn<'_, K, V, S> {
    fn drop(&mut self) {
        if self.active {
            warn!("Aborting storage transaction");
            if let Err(e) = self.storage.abort() {
                error!("Error aborting storage transaction: {e}");
            }
        }
    }
}

/// Private copies of the nodes touched by one mutation.
///
/// Nodes are popped out of the set (or cloned from the tree on first access), modified and
/// stashed back. Nothing reaches the storage until [WriteSet::flush], so a mutation can be
/// computed under an upgradable lock and abandoned at no cost.
struct WriteSet<'t, K, V, S, C> {
    tree: &'t BTree<K, V, S, C>,
    root_id: NodeId,
    nodes: HashMap<NodeId, Node<K, V>>,
    dirty: HashSet<NodeId>,
    freed: SmallVec<NodeId, 4>,
    size_delta: i64,
}

impl<'t, K, V, S, C> WriteSet<'t, K, V, S, C>
where
    K: Clone,
    V: Clone,
    S: StorageStrategy<K, V>,
    C: Comparator<K>,
{
    fn new(tree: &'t BTree<K, V, S, C>) -> Self {
        Self {
            tree,
            root_id: tree.root_id(),
            nodes: Default::default(),
            dirty: Default::default(),
            freed: Default::default(),
            size_delta: 0,
        }
    }

    fn pop_node(&mut self, id: NodeId) -> Result<Node<K, V>, Error> {
        if let Some(node) = self.nodes.remove(&id) {
            return Ok(node);
        }
        Ok(Node::clone(&*self.tree.node(id)?))
    }

    /// Returns a node to the set, keeping its dirty state.
    #[inline]
    fn stash_node(&mut self, node: Node<K, V>) {
        self.nodes.insert(node.id(), node);
    }

    #[inline]
    fn stash_dirty(&mut self, node: Node<K, V>) {
        self.dirty.insert(node.id());
        self.stash_node(node);
    }

    fn free_node(&mut self, id: NodeId) {
        self.nodes.remove(&id);
        self.dirty.remove(&id);
        self.freed.push(id);
    }

    fn node_len(&self, id: NodeId) -> Result<usize, Error> {
        match self.nodes.get(&id) {
            Some(node) => Ok(node.len()),
            None => Ok(self.tree.node(id)?.len()),
        }
    }

    fn alloc(&self, leaf: bool) -> Result<NodeId, Error> {
        if leaf {
            self.tree.storage.alloc_leaf_node()
        } else {
            self.tree.storage.alloc_non_leaf_node()
        }
    }

    fn insert(&mut self, key: K, value: V) -> Result<Option<V>, Error> {
        if self.root_id == NO_NODE {
            let mut root = Node::new_leaf(self.alloc(true)?);
            root.insert_entry(0, key, value);
            trace!("New root leaf {}", root.id());
            self.root_id = root.id();
            self.size_delta += 1;
            self.stash_dirty(root);
            return Ok(None);
        }
        match self.insert_into(self.root_id, key, value)? {
            Insertion::Replaced(old) => Ok(Some(old)),
            Insertion::Inserted => Ok(None),
            Insertion::Split(key, value, high) => {
                let root = Node::new_root(self.alloc(false)?, key, value, self.root_id, high);
                trace!("Root split {} + {} -> {}", self.root_id, high, root.id());
                self.root_id = root.id();
                self.stash_dirty(root);
                Ok(None)
            }
        }
    }

    fn insert_into(&mut self, id: NodeId, key: K, value: V) -> Result<Insertion<K, V>, Error> {
        let tree = self.tree;
        let mut node = self.pop_node(id)?;
        match node.search(&key, &tree.comparator) {
            Ok(i) => {
                let old = node.replace_value(i, value);
                self.stash_dirty(node);
                Ok(Insertion::Replaced(old))
            }
            Err(i) if node.is_leaf() => {
                node.insert_entry(i, key, value);
                self.size_delta += 1;
                self.finish_insert(node)
            }
            Err(i) => match self.insert_into(node.child(i), key, value)? {
                Insertion::Split(key, value, high) => {
                    node.insert_split(i, key, value, high);
                    self.finish_insert(node)
                }
                other => {
                    self.stash_node(node);
                    Ok(other)
                }
            },
        }
    }

    /// Stashes a node that just received an entry, splitting it if it overflowed.
    fn finish_insert(&mut self, mut node: Node<K, V>) -> Result<Insertion<K, V>, Error> {
        let max_node_size = self.tree.max_node_size;
        if node.len() <= max_node_size {
            self.stash_dirty(node);
            return Ok(Insertion::Inserted);
        }
        let high_id = self.alloc(node.is_leaf())?;
        let (key, value, high) = node.split(high_id, max_node_size);
        trace!(
            "Split node {} into {} + {} ({} + {} entries)",
            node.id(),
            node.id(),
            high_id,
            node.len(),
            high.len()
        );
        self.stash_dirty(node);
        self.stash_dirty(high);
        Ok(Insertion::Split(key, value, high_id))
    }

    fn remove(&mut self, key: &K) -> Result<Option<V>, Error> {
        if self.root_id == NO_NODE {
            return Ok(None);
        }
        let Some(old) = self.remove_from(self.root_id, key)? else {
            return Ok(None);
        };
        self.size_delta -= 1;
        let root = self.pop_node(self.root_id)?;
        if root.len() != 0 {
            self.stash_node(root);
        } else if root.is_leaf() {
            trace!("Root leaf {} emptied", root.id());
            self.root_id = NO_NODE;
            self.free_node(root.id());
        } else {
            trace!("Root {} collapsed into {}", root.id(), root.child(0));
            self.root_id = root.child(0);
            self.free_node(root.id());
        }
        Ok(Some(old))
    }

    fn remove_from(&mut self, id: NodeId, key: &K) -> Result<Option<V>, Error> {
        let tree = self.tree;
        let mut node = self.pop_node(id)?;
        match node.search(key, &tree.comparator) {
            Ok(i) if node.is_leaf() => {
                let (_, old) = node.remove_entry(i);
                self.stash_dirty(node);
                Ok(Some(old))
            }
            Ok(i) => {
                // replace the entry with its predecessor or successor, taken from the larger side
                let (low, high) = (node.child(i), node.child(i + 1));
                let (replacement, donor) = if self.node_len(low)? >= self.node_len(high)? {
                    (self.remove_last(low)?, i)
                } else {
                    (self.remove_first(high)?, i + 1)
                };
                let (_, old) = node.replace_entry(i, replacement);
                self.repair_child(&mut node, donor)?;
                self.stash_dirty(node);
                Ok(Some(old))
            }
            Err(_) if node.is_leaf() => {
                self.stash_node(node);
                Ok(None)
            }
            Err(i) => {
                let removed = self.remove_from(node.child(i), key)?;
                if removed.is_some() && self.repair_child(&mut node, i)? {
                    self.stash_dirty(node);
                } else {
                    self.stash_node(node);
                }
                Ok(removed)
            }
        }
    }

    fn remove_last(&mut self, id: NodeId) -> Result<(K, V), Error> {
        let mut node = self.pop_node(id)?;
        if node.is_leaf() {
            let entry = node
                .pop_last()
                .ok_or_else(|| io_invalid_data!("Unexpected empty node {id}"))?;
            self.stash_dirty(node);
            return Ok(entry);
        }
        let last = node.len();
        let entry = self.remove_last(node.child(last))?;
        if self.repair_child(&mut node, last)? {
            self.stash_dirty(node);
        } else {
            self.stash_node(node);
        }
        Ok(entry)
    }

    fn remove_first(&mut self, id: NodeId) -> Result<(K, V), Error> {
        let mut node = self.pop_node(id)?;
        if node.is_leaf() {
            if node.len() == 0 {
                return Err(io_invalid_data!("Unexpected empty node {id}"));
            }
            let entry = node.remove_entry(0);
            self.stash_dirty(node);
            return Ok(entry);
        }
        let entry = self.remove_first(node.child(0))?;
        if self.repair_child(&mut node, 0)? {
            self.stash_dirty(node);
        } else {
            self.stash_node(node);
        }
        Ok(entry)
    }

    /// Repairs child `child_idx` of `parent` if it underflowed. Returns whether `parent` changed.
    fn repair_child(&mut self, parent: &mut Node<K, V>, child_idx: usize) -> Result<bool, Error> {
        if self.node_len(parent.child(child_idx))? >= self.tree.min_node_size {
            return Ok(false);
        }
        let sep = if child_idx < parent.len() {
            child_idx
        } else {
            child_idx - 1
        };
        self.rebalance(parent, sep)?;
        Ok(true)
    }

    /// Redistributes or merges the two children around separator `sep` of `parent`.
    fn rebalance(&mut self, parent: &mut Node<K, V>, sep: usize) -> Result<(), Error> {
        let min_node_size = self.tree.min_node_size;
        let mut low = self.pop_node(parent.child(sep))?;
        let mut high = self.pop_node(parent.child(sep + 1))?;
        if low.len() < min_node_size && high.len() > min_node_size {
            trace!("Rotate {} <- {} ({} <- {})", low.id(), high.id(), low.len(), high.len());
            low.rotate_from_high(parent, sep, &mut high);
            self.stash_dirty(low);
            self.stash_dirty(high);
        } else if high.len() < min_node_size && low.len() > min_node_size {
            trace!("Rotate {} -> {} ({} -> {})", low.id(), high.id(), low.len(), high.len());
            low.rotate_to_high(parent, sep, &mut high);
            self.stash_dirty(low);
            self.stash_dirty(high);
        } else {
            let high_id = high.id();
            trace!("Merge {} <- {} ({} <- {})", low.id(), high_id, low.len(), high.len());
            low.merge(parent, sep, high);
            debug_assert!(low.len() <= self.tree.max_node_size);
            self.stash_dirty(low);
            self.free_node(high_id);
        }
        Ok(())
    }

    /// Writes dirty nodes, frees and the root id to the storage (inside a transaction).
    fn flush(&self) -> Result<(), Error> {
        let storage = &self.tree.storage;
        for id in &self.dirty {
            let node = &self.nodes[id];
            storage.save_node(*id, &node.to_data())?;
        }
        for &id in &self.freed {
            storage.free_node(id)?;
        }
        if self.root_id != self.tree.root_id() {
            storage.save_root_node_id(self.root_id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStorage;

    fn tree(max_node_size: usize) -> BTree<u32, u32, MemoryStorage<u32, u32>> {
        BTree::open(MemoryStorage::new(max_node_size).unwrap()).unwrap()
    }

    #[test]
    fn write_set_is_private_until_published() {
        let t = tree(4);
        for k in 0..10 {
            t.insert(k, k).unwrap();
        }
        let before = t.dump().unwrap();
        let mut ws = WriteSet::new(&t);
        assert_eq!(ws.remove(&3).unwrap(), Some(3));
        assert_eq!(ws.remove(&3).unwrap(), None);
        drop(ws);
        assert_eq!(t.dump().unwrap(), before);
        assert_eq!(t.get(&3).unwrap(), Some(3));
    }

    #[test]
    fn traversal_skips_missing_keys() {
        let t = tree(4);
        for k in (0..100).step_by(10) {
            t.insert(k, k).unwrap();
        }
        assert_eq!(t.next_key(&15).unwrap(), Some(20));
        assert_eq!(t.next_key(&20).unwrap(), Some(30));
        assert_eq!(t.next_key(&90).unwrap(), None);
        assert_eq!(t.previous_key(&15).unwrap(), Some(10));
        assert_eq!(t.previous_key(&10).unwrap(), Some(0));
        assert_eq!(t.previous_key(&0).unwrap(), None);
        assert_eq!(t.previous_key(&1000).unwrap(), Some(90));
        assert_eq!(t.first_key().unwrap(), Some(0));
        assert_eq!(t.last_key().unwrap(), Some(90));
    }

    #[test]
    fn size_is_recomputed_when_unknown() {
        let t = tree(4);
        for k in 0..50 {
            t.insert(k, k).unwrap();
        }
        t.total_size.store(-1, atomic::Ordering::Release);
        assert_eq!(t.len().unwrap(), 50);
        assert_eq!(t.total_size.load(atomic::Ordering::Acquire), 50);
        t.remove(&7).unwrap();
        assert_eq!(t.len().unwrap(), 49);
    }

    #[test]
    fn eviction_only_costs_loads() {
        let t = tree(4);
        for k in 0..200 {
            t.insert(k, k * 2).unwrap();
        }
        let loads = t.storage().loads();
        for k in 0..200 {
            assert_eq!(t.get(&k).unwrap(), Some(k * 2));
        }
        assert_eq!(t.storage().loads(), loads, "everything is cached");

        t.cache.clear();
        *t.root.write() = RootState {
            id: t.root_id(),
            node: None,
        };
        for k in 0..200 {
            assert_eq!(t.get(&k).unwrap(), Some(k * 2));
        }
        assert!(t.storage().loads() > loads);
        t.verify().unwrap();
    }
}
