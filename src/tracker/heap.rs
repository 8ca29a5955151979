//! Indexed binary min-heap.
//!
//! Ordering is supplied by a `less` function so the same structure backs both
//! the version heap and the start-time heap. A key to position index makes
//! removal by identity O(log n) and keeps `push` idempotent per key.

use std::collections::HashMap;
use std::hash::Hash;

pub type LessFn<V> = fn(&V, &V) -> bool;

pub struct IndexedHeap<K, V> {
    entries: Vec<(K, V)>,
    positions: HashMap<K, usize>,
    less: LessFn<V>,
}

impl<K, V> std::fmt::Debug for IndexedHeap<K, V>
where
    K: std::fmt::Debug,
    V: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexedHeap")
            .field("entries", &self.entries)
            .finish()
    }
}

impl<K: Hash + Eq + Clone, V> IndexedHeap<K, V> {
    pub fn new(less: LessFn<V>) -> Self {
        Self {
            entries: Vec::new(),
            positions: HashMap::new(),
            less,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.positions.contains_key(key)
    }

    /// Inserts `value` under `key`. Returns `false` and leaves the heap
    /// untouched when the key is already present.
    pub fn push(&mut self, key: K, value: V) -> bool {
        if self.positions.contains_key(&key) {
            return false;
        }
        let pos = self.entries.len();
        self.positions.insert(key.clone(), pos);
        self.entries.push((key, value));
        self.sift_up(pos);
        true
    }

    pub fn peek(&self) -> Option<(&K, &V)> {
        self.entries.first().map(|(k, v)| (k, v))
    }

    pub fn pop(&mut self) -> Option<(K, V)> {
        if self.entries.is_empty() {
            return None;
        }
        Some(self.remove_at(0))
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let pos = *self.positions.get(key)?;
        Some(self.remove_at(pos).1)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.positions.get(key).map(|&pos| &self.entries[pos].1)
    }

    /// Mutable access to a value. The caller must not change anything the
    /// ordering function looks at.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let pos = *self.positions.get(key)?;
        Some(&mut self.entries[pos].1)
    }

    /// Entries in heap order (root first, otherwise unspecified).
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    /// Entries in ascending order without disturbing the heap.
    pub fn sorted(&self) -> Vec<(&K, &V)> {
        let less = self.less;
        let mut sorted: Vec<(&K, &V)> = self.iter().collect();
        sorted.sort_by(|a, b| {
            if less(a.1, b.1) {
                std::cmp::Ordering::Less
            } else if less(b.1, a.1) {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Equal
            }
        });
        sorted
    }

    fn remove_at(&mut self, pos: usize) -> (K, V) {
        let last = self.entries.len() - 1;
        self.swap(pos, last);
        let (key, value) = match self.entries.pop() {
            Some(entry) => entry,
            None => unreachable!("remove_at called on an empty heap"),
        };
        self.positions.remove(&key);
        if pos < self.entries.len() {
            self.sift_down(pos);
            self.sift_up(pos);
        }
        (key, value)
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.entries.swap(a, b);
        self.positions.insert(self.entries[a].0.clone(), a);
        self.positions.insert(self.entries[b].0.clone(), b);
    }

    fn is_less(&self, a: usize, b: usize) -> bool {
        (self.less)(&self.entries[a].1, &self.entries[b].1)
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.is_less(pos, parent) {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut smallest = pos;
            if left < len && self.is_less(left, smallest) {
                smallest = left;
            }
            if right < len && self.is_less(right, smallest) {
                smallest = right;
            }
            if smallest == pos {
                break;
            }
            self.swap(pos, smallest);
            pos = smallest;
        }
    }

    #[cfg(test)]
    fn holds_heap_property(&self) -> bool {
        (1..self.entries.len()).all(|i| !self.is_less(i, (i - 1) / 2))
            && self
                .positions
                .iter()
                .all(|(k, &pos)| self.entries[pos].0 == *k)
    }
}
