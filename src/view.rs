//! Sorted-map kernel and range views.
//!
//! [SortedMapKernel] is the minimal ordered-map surface of a [BTree]. [SortedMapView] wraps a
//! kernel, optionally restricted to a key range, and exposes map style operations and live
//! iterators on top of it.

use std::{cmp::Ordering, marker::PhantomData, ops::Bound};

use crate::{BTree, Comparator, Error, StorageStrategy};

/// Ordered map primitives consumed by [SortedMapView].
///
/// Lookups past either end return `None` instead of failing.
pub trait SortedMapKernel<K, V> {
    /// Compares two keys with the kernel ordering.
    fn compare(&self, a: &K, b: &K) -> Ordering;

    /// Number of entries.
    fn size(&self) -> Result<u64, Error>;

    /// Whether `key` is present.
    fn contains_key(&self, key: &K) -> Result<bool, Error>;

    /// Whether any entry has `value`.
    fn contains_value(&self, value: &V) -> Result<bool, Error>
    where
        V: PartialEq;

    /// The value of `key`.
    fn get(&self, key: &K) -> Result<Option<V>, Error>;

    /// The stored entry matching `key`.
    fn get_entry(&self, key: &K) -> Result<Option<(K, V)>, Error>;

    /// Inserts or replaces, returning the previous value.
    fn put(&self, key: K, value: V) -> Result<Option<V>, Error>;

    /// Removes `key`, returning its value.
    fn remove(&self, key: &K) -> Result<Option<V>, Error>;

    /// Entry with the smallest key.
    fn first_entry(&self) -> Result<Option<(K, V)>, Error>;

    /// Entry with the largest key.
    fn last_entry(&self) -> Result<Option<(K, V)>, Error>;

    /// Entry with the smallest key strictly greater than `key`.
    fn next_entry(&self, key: &K) -> Result<Option<(K, V)>, Error>;

    /// Entry with the largest key strictly less than `key`.
    fn previous_entry(&self, key: &K) -> Result<Option<(K, V)>, Error>;

    /// Smallest key.
    fn first_key(&self) -> Result<Option<K>, Error> {
        Ok(self.first_entry()?.map(|(k, _)| k))
    }

    /// Largest key.
    fn last_key(&self) -> Result<Option<K>, Error> {
        Ok(self.last_entry()?.map(|(k, _)| k))
    }

    /// Smallest key strictly greater than `key`.
    fn next_key(&self, key: &K) -> Result<Option<K>, Error> {
        Ok(self.next_entry(key)?.map(|(k, _)| k))
    }

    /// Largest key strictly less than `key`.
    fn previous_key(&self, key: &K) -> Result<Option<K>, Error> {
        Ok(self.previous_entry(key)?.map(|(k, _)| k))
    }

    /// Removes every entry.
    fn clear(&self) -> Result<(), Error>;

    /// Removes the entries within the bounds, returning how many were removed.
    fn clear_range(&self, start: Bound<&K>, end: Bound<&K>) -> Result<u64, Error>;

    /// Appends all keys in order to `buf`.
    fn copy_keys_into(&self, buf: &mut Vec<K>) -> Result<usize, Error>;

    /// Appends all entries in order to `buf`.
    fn copy_entries_into(&self, buf: &mut Vec<(K, V)>) -> Result<usize, Error>;
}

impl<K, V, S, C> SortedMapKernel<K, V> for BTree<K, V, S, C>
where
    K: Clone,
    V: Clone,
    S: StorageStrategy<K, V>,
    C: Comparator<K>,
{
    #[inline]
    fn compare(&self, a: &K, b: &K) -> Ordering {
        self.comparator().compare(a, b)
    }

    fn size(&self) -> Result<u64, Error> {
        BTree::len(self)
    }

    fn contains_key(&self, key: &K) -> Result<bool, Error> {
        BTree::contains_key(self, key)
    }

    fn contains_value(&self, value: &V) -> Result<bool, Error>
    where
        V: PartialEq,
    {
        BTree::contains_value(self, value)
    }

    fn get(&self, key: &K) -> Result<Option<V>, Error> {
        BTree::get(self, key)
    }

    fn get_entry(&self, key: &K) -> Result<Option<(K, V)>, Error> {
        BTree::get_entry(self, key)
    }

    fn put(&self, key: K, value: V) -> Result<Option<V>, Error> {
        BTree::insert(self, key, value)
    }

    fn remove(&self, key: &K) -> Result<Option<V>, Error> {
        BTree::remove(self, key)
    }

    fn first_entry(&self) -> Result<Option<(K, V)>, Error> {
        BTree::first_entry(self)
    }

    fn last_entry(&self) -> Result<Option<(K, V)>, Error> {
        BTree::last_entry(self)
    }

    fn next_entry(&self, key: &K) -> Result<Option<(K, V)>, Error> {
        BTree::next_entry(self, key)
    }

    fn previous_entry(&self, key: &K) -> Result<Option<(K, V)>, Error> {
        BTree::previous_entry(self, key)
    }

    fn clear(&self) -> Result<(), Error> {
        BTree::clear(self)
    }

    fn clear_range(&self, start: Bound<&K>, end: Bound<&K>) -> Result<u64, Error> {
        self.clear_bounds(start, end)
    }

    fn copy_keys_into(&self, buf: &mut Vec<K>) -> Result<usize, Error> {
        BTree::copy_keys_into(self, buf)
    }

    fn copy_entries_into(&self, buf: &mut Vec<(K, V)>) -> Result<usize, Error> {
        BTree::copy_entries_into(self, buf)
    }
}

impl<K, V, S, C> BTree<K, V, S, C>
where
    K: Clone,
    V: Clone,
    S: StorageStrategy<K, V>,
    C: Comparator<K>,
{
    /// An unbounded [SortedMapView] of this tree.
    pub fn view(&self) -> SortedMapView<'_, K, V, Self> {
        SortedMapView::new(self)
    }
}

/// A map view over a [SortedMapKernel], optionally restricted to the keys in `[from, to)`.
///
/// `None` bounds are unbounded. Views are live: they hold no data of their own, every
/// operation goes through the kernel.
pub struct SortedMapView<'k, K, V, T: ?Sized> {
    kernel: &'k T,
    from: Option<K>,
    to: Option<K>,
    _marker: PhantomData<fn() -> V>,
}

impl<K: Clone, V, T: ?Sized> Clone for SortedMapView<'_, K, V, T> {
    fn clone(&self) -> Self {
        Self {
            kernel: self.kernel,
            from: self.from.clone(),
            to: self.to.clone(),
            _marker: PhantomData,
        }
    }
}

impl<K: std::fmt::Debug, V, T: ?Sized> std::fmt::Debug for SortedMapView<'_, K, V, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortedMapView")
            .field("from", &self.from)
            .field("to", &self.to)
            .finish_non_exhaustive()
    }
}

impl<'k, K, V, T> SortedMapView<'k, K, V, T>
where
    K: Clone,
    T: SortedMapKernel<K, V> + ?Sized,
{
    /// An unbounded view of `kernel`.
    pub fn new(kernel: &'k T) -> Self {
        Self {
            kernel,
            from: None,
            to: None,
            _marker: PhantomData,
        }
    }

    /// The underlying kernel.
    pub fn kernel(&self) -> &'k T {
        self.kernel
    }

    /// Inclusive lower bound.
    pub fn from_key(&self) -> Option<&K> {
        self.from.as_ref()
    }

    /// Exclusive upper bound.
    pub fn to_key(&self) -> Option<&K> {
        self.to.as_ref()
    }

    /// A view of the keys in `[from, to)`.
    ///
    /// Both bounds must lie within this view and `from` must not be greater than `to`.
    pub fn sub_map(&self, from: K, to: K) -> Result<Self, Error> {
        if self.kernel.compare(&from, &to) == Ordering::Greater {
            return Err(Error::illegal_argument("sub_map from key is greater than to key"));
        }
        self.check_bound(&from)?;
        self.check_bound(&to)?;
        Ok(self.with_bounds(Some(from), Some(to)))
    }

    /// A view of the keys less than `to`.
    pub fn head_map(&self, to: K) -> Result<Self, Error> {
        self.check_bound(&to)?;
        Ok(self.with_bounds(self.from.clone(), Some(to)))
    }

    /// A view of the keys greater than or equal to `from`.
    pub fn tail_map(&self, from: K) -> Result<Self, Error> {
        self.check_bound(&from)?;
        Ok(self.with_bounds(Some(from), self.to.clone()))
    }

    fn with_bounds(&self, from: Option<K>, to: Option<K>) -> Self {
        Self {
            kernel: self.kernel,
            from,
            to,
            _marker: PhantomData,
        }
    }

    /// Bounds of nested views may touch but not exceed ours.
    fn check_bound(&self, key: &K) -> Result<(), Error> {
        let above = matches!(
            &self.to,
            Some(to) if self.kernel.compare(key, to) == Ordering::Greater
        );
        if self.too_low(key) || above {
            return Err(Error::illegal_argument("Key out of the view range"));
        }
        Ok(())
    }

    #[inline]
    fn too_low(&self, key: &K) -> bool {
        matches!(&self.from, Some(from) if self.kernel.compare(key, from) == Ordering::Less)
    }

    #[inline]
    fn too_high(&self, key: &K) -> bool {
        matches!(&self.to, Some(to) if self.kernel.compare(key, to) != Ordering::Less)
    }

    /// Whether `key` is within the view bounds.
    #[inline]
    pub fn in_range(&self, key: &K) -> bool {
        !self.too_low(key) && !self.too_high(key)
    }

    #[inline]
    fn is_unbounded(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }

    fn check_range(&self, key: &K) -> Result<(), Error> {
        if self.in_range(key) {
            Ok(())
        } else {
            Err(Error::illegal_argument("Key out of the view range"))
        }
    }

    /// Number of entries in the view. Bounded views count by iterating.
    pub fn len(&self) -> Result<u64, Error> {
        if self.is_unbounded() {
            return self.kernel.size();
        }
        let mut count = 0;
        for entry in self.iter() {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// Whether the view has no entries.
    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.first_entry()?.is_none())
    }

    /// Whether `key` is in range and present.
    pub fn contains_key(&self, key: &K) -> Result<bool, Error> {
        Ok(self.in_range(key) && self.kernel.contains_key(key)?)
    }

    /// Whether any entry of the view has `value`.
    pub fn contains_value(&self, value: &V) -> Result<bool, Error>
    where
        V: PartialEq,
    {
        if self.is_unbounded() {
            return self.kernel.contains_value(value);
        }
        for entry in self.iter() {
            if entry?.1 == *value {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// The value of `key`, `None` when absent or out of range.
    pub fn get(&self, key: &K) -> Result<Option<V>, Error> {
        if !self.in_range(key) {
            return Ok(None);
        }
        self.kernel.get(key)
    }

    /// Inserts through the kernel. Keys out of range are rejected.
    pub fn insert(&self, key: K, value: V) -> Result<Option<V>, Error> {
        self.check_range(&key)?;
        self.kernel.put(key, value)
    }

    /// Removes through the kernel. Keys out of range are rejected.
    pub fn remove(&self, key: &K) -> Result<Option<V>, Error> {
        self.check_range(key)?;
        self.kernel.remove(key)
    }

    /// Removes every entry of the view, returning how many were removed.
    pub fn clear(&self) -> Result<u64, Error> {
        if self.is_unbounded() {
            let len = self.kernel.size()?;
            self.kernel.clear()?;
            return Ok(len);
        }
        let start = self.from.as_ref().map_or(Bound::Unbounded, Bound::Included);
        let end = self.to.as_ref().map_or(Bound::Unbounded, Bound::Excluded);
        self.kernel.clear_range(start, end)
    }

    /// The lowest entry of the view.
    pub fn first_entry(&self) -> Result<Option<(K, V)>, Error> {
        let first = match &self.from {
            None => self.kernel.first_entry()?,
            Some(from) => match self.kernel.get_entry(from)? {
                Some(entry) => Some(entry),
                None => self.kernel.next_entry(from)?,
            },
        };
        Ok(first.filter(|(k, _)| !self.too_high(k)))
    }

    /// The highest entry of the view.
    pub fn last_entry(&self) -> Result<Option<(K, V)>, Error> {
        let last = match &self.to {
            None => self.kernel.last_entry()?,
            Some(to) => self.kernel.previous_entry(to)?,
        };
        Ok(last.filter(|(k, _)| !self.too_low(k)))
    }

    /// The lowest key, fails with [Error::NoSuchElement] on an empty view.
    pub fn first_key(&self) -> Result<K, Error> {
        self.first_entry()?.map(|(k, _)| k).ok_or(Error::NoSuchElement)
    }

    /// The highest key, fails with [Error::NoSuchElement] on an empty view.
    pub fn last_key(&self) -> Result<K, Error> {
        self.last_entry()?.map(|(k, _)| k).ok_or(Error::NoSuchElement)
    }

    /// The entry following `key` within the view.
    pub fn next_entry(&self, key: &K) -> Result<Option<(K, V)>, Error> {
        if self.too_low(key) {
            return self.first_entry();
        }
        Ok(self.kernel.next_entry(key)?.filter(|(k, _)| !self.too_high(k)))
    }

    /// The entry preceding `key` within the view.
    pub fn previous_entry(&self, key: &K) -> Result<Option<(K, V)>, Error> {
        if self.too_high(key) {
            return self.last_entry();
        }
        Ok(self.kernel.previous_entry(key)?.filter(|(k, _)| !self.too_low(k)))
    }

    /// Live iterator over the entries of the view, see [Iter].
    pub fn iter(&self) -> Iter<'k, K, V, T> {
        Iter {
            view: self.clone(),
            front: None,
            back: None,
            last: None,
            finished: false,
        }
    }

    /// Live iterator over the keys of the view.
    pub fn keys(&self) -> Keys<'k, K, V, T> {
        Keys(self.iter())
    }

    /// Live iterator over the values of the view.
    pub fn values(&self) -> Values<'k, K, V, T> {
        Values(self.iter())
    }

    /// Collects the entries of the view.
    pub fn to_vec(&self) -> Result<Vec<(K, V)>, Error> {
        let mut entries = Vec::new();
        if self.is_unbounded() {
            self.kernel.copy_entries_into(&mut entries)?;
        } else {
            for entry in self.iter() {
                entries.push(entry?);
            }
        }
        Ok(entries)
    }
}

/// Entry iterator of a [SortedMapView].
///
/// Each step is one kernel `next_entry`/`previous_entry` call from the last returned key, so
/// the iterator observes concurrent modifications made between steps. Iterating from both
/// ends stops once the two sides meet.
pub struct Iter<'k, K, V, T: ?Sized> {
    view: SortedMapView<'k, K, V, T>,
    front: Option<K>,
    back: Option<K>,
    last: Option<K>,
    finished: bool,
}

impl<'k, K, V, T> Iter<'k, K, V, T>
where
    K: Clone,
    T: SortedMapKernel<K, V> + ?Sized,
{
    /// Removes the key most recently returned by this iterator.
    ///
    /// Fails with [Error::IllegalState] if nothing was returned yet or it was already removed.
    pub fn remove(&mut self) -> Result<Option<V>, Error> {
        let Some(key) = self.last.take() else {
            return Err(Error::illegal_state("No current entry to remove"));
        };
        self.view.kernel.remove(&key)
    }

    fn step(
        &mut self,
        forward: bool,
        entry: Result<Option<(K, V)>, Error>,
    ) -> Option<Result<(K, V), Error>> {
        let (key, value) = match entry {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                self.finished = true;
                return None;
            }
            Err(e) => {
                self.finished = true;
                return Some(Err(e));
            }
        };
        let (cursor, other) = if forward {
            (&mut self.front, &self.back)
        } else {
            (&mut self.back, &self.front)
        };
        if let Some(other) = other {
            let crossed = match self.view.kernel.compare(&key, other) {
                Ordering::Equal => true,
                Ordering::Less => !forward,
                Ordering::Greater => forward,
            };
            if crossed {
                self.finished = true;
                return None;
            }
        }
        *cursor = Some(key.clone());
        self.last = Some(key.clone());
        Some(Ok((key, value)))
    }
}

impl<K, V, T> Iterator for Iter<'_, K, V, T>
where
    K: Clone,
    T: SortedMapKernel<K, V> + ?Sized,
{
    type Item = Result<(K, V), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let entry = match &self.front {
            None => self.view.first_entry(),
            Some(key) => self.view.next_entry(key),
        };
        self.step(true, entry)
    }
}

impl<K, V, T> DoubleEndedIterator for Iter<'_, K, V, T>
where
    K: Clone,
    T: SortedMapKernel<K, V> + ?Sized,
{
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let entry = match &self.back {
            None => self.view.last_entry(),
            Some(key) => self.view.previous_entry(key),
        };
        self.step(false, entry)
    }
}

/// Key iterator of a [SortedMapView].
pub struct Keys<'k, K, V, T: ?Sized>(Iter<'k, K, V, T>);

impl<K, V, T> Keys<'_, K, V, T>
where
    K: Clone,
    T: SortedMapKernel<K, V> + ?Sized,
{
    /// See [Iter::remove].
    pub fn remove(&mut self) -> Result<Option<V>, Error> {
        self.0.remove()
    }
}

impl<K, V, T> Iterator for Keys<'_, K, V, T>
where
    K: Clone,
    T: SortedMapKernel<K, V> + ?Sized,
{
    type Item = Result<K, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.0.next()?.map(|(k, _)| k))
    }
}

impl<K, V, T> DoubleEndedIterator for Keys<'_, K, V, T>
where
    K: Clone,
    T: SortedMapKernel<K, V> + ?Sized,
{
    fn next_back(&mut self) -> Option<Self::Item> {
        Some(self.0.next_back()?.map(|(k, _)| k))
    }
}

/// Value iterator of a [SortedMapView].
pub struct Values<'k, K, V, T: ?Sized>(Iter<'k, K, V, T>);

impl<K, V, T> Iterator for Values<'_, K, V, T>
where
    K: Clone,
    T: SortedMapKernel<K, V> + ?Sized,
{
    type Item = Result<V, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.0.next()?.map(|(_, v)| v))
    }
}

impl<K, V, T> DoubleEndedIterator for Values<'_, K, V, T>
where
    K: Clone,
    T: SortedMapKernel<K, V> + ?Sized,
{
    fn next_back(&mut self) -> Option<Self::Item> {
        Some(self.0.next_back()?.map(|(_, v)| v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStorage;

    type Tree = BTree<u32, String, MemoryStorage<u32, String>>;

    fn tree(keys: impl IntoIterator<Item = u32>) -> Tree {
        let tree = BTree::open(MemoryStorage::new(4).unwrap()).unwrap();
        for k in keys {
            tree.insert(k, k.to_string()).unwrap();
        }
        tree
    }

    fn keys<T: SortedMapKernel<u32, String>>(view: &SortedMapView<'_, u32, String, T>) -> Vec<u32> {
        view.keys().collect::<Result<_, _>>().unwrap()
    }

    #[test]
    fn sub_map_bounds() {
        let t = tree((0..50).map(|k| k * 2));
        let view = t.view();
        let sub = view.sub_map(10, 20).unwrap();
        assert_eq!(keys(&sub), vec![10, 12, 14, 16, 18]);
        assert_eq!(sub.len().unwrap(), 5);
        assert_eq!(sub.first_key().unwrap(), 10);
        assert_eq!(sub.last_key().unwrap(), 18);

        // bounds that aren't keys
        let sub = view.sub_map(11, 19).unwrap();
        assert_eq!(keys(&sub), vec![12, 14, 16, 18]);
        assert_eq!(sub.get(&10).unwrap(), None);
        assert_eq!(sub.get(&12).unwrap().as_deref(), Some("12"));
        assert!(!sub.contains_key(&20).unwrap());

        assert_eq!(keys(&view.head_map(5).unwrap()), vec![0, 2, 4]);
        assert_eq!(keys(&view.tail_map(95).unwrap()), vec![96, 98]);
        assert_eq!(view.len().unwrap(), 50);
    }

    #[test]
    fn invalid_bounds_and_out_of_range_mutations() {
        let t = tree(0..10);
        let view = t.view();
        assert!(matches!(view.sub_map(5, 4), Err(Error::IllegalArgument(_))));
        let sub = view.sub_map(2, 6).unwrap();
        assert!(matches!(sub.sub_map(1, 4), Err(Error::IllegalArgument(_))));
        assert!(matches!(sub.tail_map(7), Err(Error::IllegalArgument(_))));
        assert_eq!(keys(&sub.head_map(6).unwrap()), vec![2, 3, 4, 5]);

        assert!(matches!(sub.insert(6, "x".into()), Err(Error::IllegalArgument(_))));
        assert!(matches!(sub.remove(&1), Err(Error::IllegalArgument(_))));
        assert_eq!(sub.insert(3, "three".into()).unwrap().as_deref(), Some("3"));
        assert_eq!(sub.remove(&4).unwrap().as_deref(), Some("4"));
        assert_eq!(keys(&sub), vec![2, 3, 5]);
        assert_eq!(t.len().unwrap(), 9);
    }

    #[test]
    fn empty_views() {
        let t = tree(0..10);
        let empty = t.view().sub_map(20, 30).unwrap();
        assert!(empty.is_empty().unwrap());
        assert!(matches!(empty.first_key(), Err(Error::NoSuchElement)));
        assert!(matches!(empty.last_key(), Err(Error::NoSuchElement)));
        assert_eq!(empty.first_entry().unwrap(), None);
        assert_eq!(empty.iter().count(), 0);
        let same = t.view().sub_map(4, 4).unwrap();
        assert!(same.is_empty().unwrap());

        let t = tree([]);
        assert!(matches!(t.view().first_key(), Err(Error::NoSuchElement)));
        assert_eq!(t.view().len().unwrap(), 0);
    }

    #[test]
    fn reverse_and_double_ended_iteration() {
        let t = tree(0..20);
        let sub = t.view().sub_map(5, 15).unwrap();
        let rev: Vec<u32> = sub.keys().rev().collect::<Result<_, _>>().unwrap();
        assert_eq!(rev, (5..15).rev().collect::<Vec<_>>());

        let mut iter = sub.keys();
        let mut seen = Vec::new();
        loop {
            match iter.next() {
                Some(k) => seen.push(k.unwrap()),
                None => break,
            }
            match iter.next_back() {
                Some(k) => seen.push(k.unwrap()),
                None => break,
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, (5..15).collect::<Vec<_>>());

        let values: Vec<String> = sub.values().take(2).collect::<Result<_, _>>().unwrap();
        assert_eq!(values, vec!["5".to_string(), "6".to_string()]);
    }

    #[test]
    fn iterator_remove_goes_through_the_kernel() {
        let t = tree(0..30);
        let view = t.view();
        let mut iter = view.iter();
        assert!(matches!(iter.remove(), Err(Error::IllegalState(_))));
        while let Some(entry) = iter.next() {
            let (k, _) = entry.unwrap();
            if k % 3 == 0 {
                assert_eq!(iter.remove().unwrap(), Some(k.to_string()));
                assert!(matches!(iter.remove(), Err(Error::IllegalState(_))));
            }
        }
        assert_eq!(t.len().unwrap(), 20);
        assert!(keys(&view).iter().all(|k| k % 3 != 0));
        t.verify().unwrap();
    }

    #[test]
    fn iteration_is_live() {
        let t = tree([1, 3, 5]);
        let view = t.view();
        let mut iter = view.keys();
        assert_eq!(iter.next().unwrap().unwrap(), 1);
        t.insert(2, "2".into()).unwrap();
        t.remove(&3).unwrap();
        assert_eq!(iter.next().unwrap().unwrap(), 2);
        assert_eq!(iter.next().unwrap().unwrap(), 5);
        assert!(iter.next().is_none());
    }

    #[test]
    fn clear_views() {
        let t = tree(0..40);
        let view = t.view();
        assert_eq!(view.sub_map(10, 20).unwrap().clear().unwrap(), 10);
        assert_eq!(view.head_map(5).unwrap().clear().unwrap(), 5);
        assert_eq!(view.to_vec().unwrap().len(), 25);
        assert_eq!(view.tail_map(35).unwrap().to_vec().unwrap().len(), 5);
        assert!(view.contains_value(&"25".to_string()).unwrap());
        assert!(!view.head_map(30).unwrap().contains_value(&"35".to_string()).unwrap());
        t.verify().unwrap();
        assert_eq!(view.clear().unwrap(), 25);
        assert!(view.is_empty().unwrap());
    }
}
