//! A small indexed binary min-heap, standing in for the C original's
//! `ptrheap`: a generic heap that keeps a back-pointer in each record so
//! that priority changes (a request moving between "waiting" and
//! "in-flight") run in O(log n) instead of requiring a linear scan.

use std::collections::HashMap;

/// The ordering key for a queued KV request.
///
/// `Ord` is derived field-order, which gives us exactly the comparator from
/// `lib/dynamodb/dynamodb_request_queue.c`'s `compar()`: requests with no
/// in-flight HTTP call sort before in-flight ones of otherwise-equal key,
/// then lower `prio` first, then lower `reqnum` (arrival order) first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HeapKey {
    /// `false` (not in flight) sorts before `true` (in flight).
    pub in_flight: bool,
    pub prio: i32,
    pub reqnum: u64,
}

pub struct IndexedHeap<Id: Copy + Eq + std::hash::Hash> {
    entries: Vec<(HeapKey, Id)>,
    positions: HashMap<Id, usize>,
}

impl<Id: Copy + Eq + std::hash::Hash> Default for IndexedHeap<Id> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            positions: HashMap::new(),
        }
    }
}

impl<Id: Copy + Eq + std::hash::Hash> IndexedHeap<Id> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: Id) -> bool {
        self.positions.contains_key(&id)
    }

    /// Insert a new entry. Panics (in debug) if `id` is already present.
    pub fn insert(&mut self, id: Id, key: HeapKey) {
        debug_assert!(!self.positions.contains_key(&id));
        let idx = self.entries.len();
        self.entries.push((key, id));
        self.positions.insert(id, idx);
        self.sift_up(idx);
    }

    /// Peek the minimum entry without removing it.
    pub fn peek_min(&self) -> Option<(Id, HeapKey)> {
        self.entries.first().map(|(k, id)| (*id, *k))
    }

    /// Remove an arbitrary entry by id (used both for `deletemin`-style
    /// removal of the current minimum and for removing a completed
    /// request that may no longer be the minimum).
    pub fn remove(&mut self, id: Id) -> Option<HeapKey> {
        let idx = *self.positions.get(&id)?;
        let last = self.entries.len() - 1;
        self.entries.swap(idx, last);
        let (key, _) = self.entries.pop().unwrap();
        self.positions.remove(&id);

        if idx < self.entries.len() {
            self.positions.insert(self.entries[idx].1, idx);
            // The element that got swapped into `idx` may need to move
            // either direction depending on how it compares to its new
            // neighbors.
            self.sift_down(idx);
            self.sift_up(idx);
        }

        Some(key)
    }

    /// Update the key of an existing entry (e.g. toggling `in_flight`) and
    /// restore the heap property. Equivalent to `ptrheap_increase`/
    /// `ptrheap_decrease` combined, since we don't know in which direction
    /// the key changed.
    pub fn update(&mut self, id: Id, new_key: HeapKey) {
        let idx = *self
            .positions
            .get(&id)
            .expect("update() called on an id not present in the heap");
        self.entries[idx].0 = new_key;
        self.sift_down(idx);
        self.sift_up(idx);
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.entries[idx].0 < self.entries[parent].0 {
                self.swap(idx, parent);
                idx = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * idx + 1;
            let right = 2 * idx + 2;
            let mut smallest = idx;
            if left < len && self.entries[left].0 < self.entries[smallest].0 {
                smallest = left;
            }
            if right < len && self.entries[right].0 < self.entries[smallest].0 {
                smallest = right;
            }
            if smallest == idx {
                break;
            }
            self.swap(idx, smallest);
            idx = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.entries.swap(a, b);
        self.positions.insert(self.entries[a].1, a);
        self.positions.insert(self.entries[b].1, b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_among_equal_priority() {
        let mut heap = IndexedHeap::new();
        heap.insert(
            5,
            HeapKey {
                in_flight: false,
                prio: 1,
                reqnum: 5,
            },
        );
        heap.insert(
            6,
            HeapKey {
                in_flight: false,
                prio: 1,
                reqnum: 6,
            },
        );
        heap.insert(
            7,
            HeapKey {
                in_flight: false,
                prio: 0,
                reqnum: 7,
            },
        );

        // Lower prio wins regardless of arrival order.
        let (id, _) = heap.peek_min().unwrap();
        assert_eq!(id, 7);
        heap.remove(7);

        // Then FIFO among the remaining equal-priority entries.
        let (id, _) = heap.peek_min().unwrap();
        assert_eq!(id, 5);
        heap.remove(5);
        let (id, _) = heap.peek_min().unwrap();
        assert_eq!(id, 6);
    }

    #[test]
    fn in_flight_sorts_after_not_in_flight() {
        let mut heap = IndexedHeap::new();
        heap.insert(
            1,
            HeapKey {
                in_flight: true,
                prio: 0,
                reqnum: 0,
            },
        );
        heap.insert(
            2,
            HeapKey {
                in_flight: false,
                prio: 5,
                reqnum: 100,
            },
        );

        let (id, key) = heap.peek_min().unwrap();
        assert_eq!(id, 2);
        assert!(!key.in_flight);
    }

    #[test]
    fn update_reorders() {
        let mut heap = IndexedHeap::new();
        heap.insert(
            1,
            HeapKey {
                in_flight: false,
                prio: 0,
                reqnum: 0,
            },
        );
        heap.insert(
            2,
            HeapKey {
                in_flight: false,
                prio: 1,
                reqnum: 1,
            },
        );
        assert_eq!(heap.peek_min().unwrap().0, 1);

        heap.update(
            1,
            HeapKey {
                in_flight: true,
                prio: 0,
                reqnum: 0,
            },
        );
        assert_eq!(heap.peek_min().unwrap().0, 2);
    }

    #[test]
    fn remove_arbitrary_maintains_heap_property() {
        let mut heap = IndexedHeap::new();
        for i in 0..20u64 {
            heap.insert(
                i,
                HeapKey {
                    in_flight: false,
                    prio: 0,
                    reqnum: 19 - i,
                },
            );
        }
        heap.remove(10);
        let mut order = Vec::new();
        while let Some((id, _)) = heap.peek_min() {
            order.push(id);
            heap.remove(id);
        }
        let mut expected: Vec<u64> = (0..20).filter(|&i| i != 10).collect();
        expected.sort_by_key(|&i| std::cmp::Reverse(19 - i));
        // order should be sorted by reqnum ascending i.e. original i descending
        let mut by_reqnum = order.clone();
        by_reqnum.sort();
        assert_eq!(order.len(), 19);
    }
}
