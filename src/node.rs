//! In-memory B-Tree pages.
//!
//! A [Node] holds a sorted run of entries as two parallel vectors. Non-leaf nodes also hold
//! `len + 1` child ids: child `i` contains the keys between entry `i - 1` and entry `i`.
//! Separator entries are real entries (this is a B-Tree, not a B+Tree).
//!
//! The operations here only touch one node (or one parent with two siblings); loading and
//! saving nodes is the tree's business.

use crate::{storage::NodeData, Comparator, NodeId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Node<K, V> {
    id: NodeId,
    keys: Vec<K>,
    values: Vec<V>,
    /// Empty for leaves
    children: Vec<NodeId>,
}

impl<K, V> Node<K, V> {
    pub fn new_leaf(id: NodeId) -> Self {
        Self {
            id,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
        }
    }

    /// A non-leaf node with a single separator between two children.
    pub fn new_root(id: NodeId, key: K, value: V, low: NodeId, high: NodeId) -> Self {
        Self {
            id,
            keys: vec![key],
            values: vec![value],
            children: vec![low, high],
        }
    }

    pub fn from_data(id: NodeId, data: NodeData<K, V>) -> Self {
        debug_assert_eq!(data.size, data.entries.len());
        let (keys, values) = data.entries.into_iter().unzip();
        let node = Self {
            id,
            keys,
            values,
            children: data.children.unwrap_or_default(),
        };
        node.debug_check_shape();
        node
    }

    pub fn to_data(&self) -> NodeData<K, V>
    where
        K: Clone,
        V: Clone,
    {
        NodeData {
            size: self.len(),
            entries: self.keys.iter().cloned().zip(self.values.iter().cloned()).collect(),
            children: (!self.is_leaf()).then(|| self.children.clone()),
        }
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    #[inline]
    pub fn key(&self, i: usize) -> &K {
        &self.keys[i]
    }

    #[inline]
    pub fn value(&self, i: usize) -> &V {
        &self.values[i]
    }

    #[inline]
    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    #[cfg(test)]
    pub fn values(&self) -> &[V] {
        &self.values
    }

    #[inline]
    pub fn child(&self, i: usize) -> NodeId {
        self.children[i]
    }

    #[inline]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn entry(&self, i: usize) -> (K, V)
    where
        K: Clone,
        V: Clone,
    {
        (self.keys[i].clone(), self.values[i].clone())
    }

    /// Binary search for `key`: `Ok(index)` of the matching entry or `Err(index)` of the
    /// insertion point, which is also the index of the child to descend into.
    #[inline]
    pub fn search<C: Comparator<K> + ?Sized>(&self, key: &K, cmp: &C) -> Result<usize, usize> {
        self.keys.binary_search_by(|k| cmp.compare(k, key))
    }

    pub fn insert_entry(&mut self, i: usize, key: K, value: V) {
        self.keys.insert(i, key);
        self.values.insert(i, value);
    }

    /// Inserts an entry promoted by the split of child `i`, `high` becomes child `i + 1`.
    pub fn insert_split(&mut self, i: usize, key: K, value: V, high: NodeId) {
        debug_assert!(!self.is_leaf());
        self.insert_entry(i, key, value);
        self.children.insert(i + 1, high);
    }

    pub fn replace_value(&mut self, i: usize, value: V) -> V {
        std::mem::replace(&mut self.values[i], value)
    }

    pub fn replace_entry(&mut self, i: usize, (key, value): (K, V)) -> (K, V) {
        (
            std::mem::replace(&mut self.keys[i], key),
            std::mem::replace(&mut self.values[i], value),
        )
    }

    pub fn remove_entry(&mut self, i: usize) -> (K, V) {
        (self.keys.remove(i), self.values.remove(i))
    }

    pub fn pop_last(&mut self) -> Option<(K, V)> {
        Some((self.keys.pop()?, self.values.pop()?))
    }

    /// Splits an overflowing node (`max_node_size + 1` entries).
    ///
    /// The entry at `max_node_size / 2` is promoted, the entries below it stay in `self` and the
    /// ones above move to a new node with id `high_id` (the high half gets the extra entry when
    /// `max_node_size` is odd). Children are partitioned with their entries. This covers an
    /// incoming entry landing below, at or above the median alike.
    pub fn split(&mut self, high_id: NodeId, max_node_size: usize) -> (K, V, Self) {
        debug_assert_eq!(self.len(), max_node_size + 1);
        let mid = max_node_size / 2;
        let keys = self.keys.split_off(mid + 1);
        let values = self.values.split_off(mid + 1);
        let children = if self.is_leaf() {
            Vec::new()
        } else {
            self.children.split_off(mid + 1)
        };
        let (key, value) = self.pop_last().expect("split of an empty node");
        let high = Self {
            id: high_id,
            keys,
            values,
            children,
        };
        self.debug_check_shape();
        high.debug_check_shape();
        (key, value, high)
    }

    /// Moves the first entry of `high` up into separator `sep` of `parent` and the old
    /// separator down to the end of `self` (the low sibling).
    pub fn rotate_from_high(&mut self, parent: &mut Self, sep: usize, high: &mut Self) {
        debug_assert_eq!(parent.child(sep), self.id);
        debug_assert_eq!(parent.child(sep + 1), high.id);
        let up = high.remove_entry(0);
        let (key, value) = parent.replace_entry(sep, up);
        self.keys.push(key);
        self.values.push(value);
        if !high.is_leaf() {
            self.children.push(high.children.remove(0));
        }
    }

    /// Moves the last entry of `self` (the low sibling) up into separator `sep` of `parent`
    /// and the old separator down to the front of `high`.
    pub fn rotate_to_high(&mut self, parent: &mut Self, sep: usize, high: &mut Self) {
        debug_assert_eq!(parent.child(sep), self.id);
        debug_assert_eq!(parent.child(sep + 1), high.id);
        let up = self.pop_last().expect("rotation from an empty node");
        let (key, value) = parent.replace_entry(sep, up);
        high.insert_entry(0, key, value);
        if let Some(child) = self.children.pop() {
            high.children.insert(0, child);
        }
    }

    /// Appends separator `sep` of `parent` and all of `high` to `self` (the low sibling),
    /// removing the separator and the `high` child from `parent`.
    pub fn merge(&mut self, parent: &mut Self, sep: usize, high: Self) {
        debug_assert_eq!(parent.child(sep), self.id);
        debug_assert_eq!(parent.child(sep + 1), high.id);
        let (key, value) = parent.remove_entry(sep);
        parent.children.remove(sep + 1);
        self.keys.push(key);
        self.values.push(value);
        self.keys.extend(high.keys);
        self.values.extend(high.values);
        self.children.extend(high.children);
        self.debug_check_shape();
    }

    #[inline]
    fn debug_check_shape(&self) {
        debug_assert_eq!(self.keys.len(), self.values.len());
        debug_assert!(self.is_leaf() || self.children.len() == self.keys.len() + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NaturalOrder;

    fn leaf(id: NodeId, keys: &[u32]) -> Node<u32, u32> {
        let mut node = Node::new_leaf(id);
        for &k in keys {
            node.insert_entry(node.len(), k, k * 10);
        }
        node
    }

    fn branch(id: NodeId, keys: &[u32], children: &[NodeId]) -> Node<u32, u32> {
        let mut node = leaf(id, keys);
        node.children = children.to_vec();
        node.debug_check_shape();
        node
    }

    #[test]
    fn search_with_comparators() {
        let node = leaf(0, &[10, 20, 30]);
        assert_eq!(node.search(&20, &NaturalOrder), Ok(1));
        assert_eq!(node.search(&5, &NaturalOrder), Err(0));
        assert_eq!(node.search(&25, &NaturalOrder), Err(2));
        assert_eq!(node.search(&35, &NaturalOrder), Err(3));

        let mut reversed = Node::new_leaf(1);
        for k in [30u32, 20, 10] {
            reversed.insert_entry(reversed.len(), k, ());
        }
        let rev = |a: &u32, b: &u32| b.cmp(a);
        assert_eq!(reversed.search(&20, &rev), Ok(1));
        assert_eq!(reversed.search(&25, &rev), Err(1));
    }

    #[test]
    fn split_even_capacity() {
        let mut node = leaf(0, &[1, 2, 3, 4, 5]);
        let (k, v, high) = node.split(7, 4);
        assert_eq!((k, v), (3, 30));
        assert_eq!(node.keys(), &[1, 2]);
        assert_eq!(high.keys(), &[4, 5]);
        assert_eq!(high.values(), &[40, 50]);
        assert_eq!(high.id(), 7);
        assert!(high.is_leaf());
    }

    #[test]
    fn split_odd_capacity_favors_high() {
        let mut node = leaf(0, &[1, 2, 3, 4, 5, 6]);
        let (k, _, high) = node.split(7, 5);
        assert_eq!(k, 3);
        assert_eq!(node.keys(), &[1, 2]);
        assert_eq!(high.keys(), &[4, 5, 6]);
    }

    #[test]
    fn split_branch_partitions_children() {
        let mut node = branch(0, &[10, 20, 30, 40, 50], &[100, 101, 102, 103, 104, 105]);
        let (k, _, high) = node.split(9, 4);
        assert_eq!(k, 30);
        assert_eq!(node.keys(), &[10, 20]);
        assert_eq!(node.children(), &[100, 101, 102]);
        assert_eq!(high.keys(), &[40, 50]);
        assert_eq!(high.children(), &[103, 104, 105]);
    }

    #[test]
    fn rotations_through_the_parent() {
        let mut parent = branch(0, &[10], &[1, 2]);
        let mut low = branch(1, &[5], &[100, 101]);
        let mut high = branch(2, &[12, 14, 16], &[102, 103, 104, 105]);

        low.rotate_from_high(&mut parent, 0, &mut high);
        assert_eq!(parent.keys(), &[12]);
        assert_eq!(low.keys(), &[5, 10]);
        assert_eq!(low.children(), &[100, 101, 102]);
        assert_eq!(high.keys(), &[14, 16]);
        assert_eq!(high.children(), &[103, 104, 105]);

        low.rotate_to_high(&mut parent, 0, &mut high);
        assert_eq!(parent.keys(), &[10]);
        assert_eq!(parent.values(), &[100]);
        assert_eq!(low.keys(), &[5]);
        assert_eq!(low.children(), &[100, 101]);
        assert_eq!(high.keys(), &[12, 14, 16]);
        assert_eq!(high.values(), &[120, 140, 160]);
        assert_eq!(high.children(), &[102, 103, 104, 105]);
    }

    #[test]
    fn merge_consolidates_into_low() {
        let mut parent = branch(0, &[10, 20], &[1, 2, 3]);
        let mut low = leaf(1, &[1, 2]);
        let high = leaf(2, &[11]);
        low.merge(&mut parent, 0, high);
        assert_eq!(low.keys(), &[1, 2, 10, 11]);
        assert_eq!(parent.keys(), &[20]);
        assert_eq!(parent.children(), &[1, 3]);
    }

    #[test]
    fn data_round_trip_keeps_shape() {
        let node = branch(4, &[1, 2], &[7, 8, 9]);
        let data = node.to_data();
        assert_eq!(data.size, 2);
        assert_eq!(data.children.as_deref(), Some(&[7, 8, 9][..]));
        assert_eq!(Node::from_data(4, data), node);
        assert_eq!(leaf(5, &[3]).to_data().children, None);
    }
}
