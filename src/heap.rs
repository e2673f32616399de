//! Bounded top-k heap
//!
//! Keeps the `capacity` greatest items seen so far. Used by the vector index
//! for per-layer result sets and by the block chain to merge per-block query
//! results without holding every match in memory.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Bounded heap retaining the largest items by `Ord`
///
/// Internally a min-heap: the root is the current worst admitted item, so a
/// full heap can decide admission in O(1) and evict in O(log k).
#[derive(Debug, Clone)]
pub struct TopK<T: Ord> {
    heap: BinaryHeap<Reverse<T>>,
    capacity: usize,
}

impl<T: Ord> TopK<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity.saturating_add(1).min(1024)),
            capacity,
        }
    }

    /// Offer an item. Returns true if it was admitted.
    ///
    /// Once full, an item is only admitted if it is strictly better than the
    /// current worst, which is evicted.
    pub fn push(&mut self, item: T) -> bool {
        if self.capacity == 0 {
            return false;
        }
        if self.heap.len() < self.capacity {
            self.heap.push(Reverse(item));
            return true;
        }

        match self.heap.peek() {
            Some(Reverse(worst)) if item > *worst => {
                self.heap.pop();
                self.heap.push(Reverse(item));
                true
            }
            _ => false,
        }
    }

    /// Current worst admitted item
    pub fn worst(&self) -> Option<&T> {
        self.heap.peek().map(|Reverse(item)| item)
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Consume the heap, returning items best-first
    pub fn into_sorted_desc(self) -> Vec<T> {
        // into_sorted_vec is ascending over Reverse<T>, i.e. descending over T
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse(item)| item)
            .collect()
    }
}

impl<T: Ord> Extend<T> for TopK<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for item in iter {
            self.push(item);
        }
    }
}
