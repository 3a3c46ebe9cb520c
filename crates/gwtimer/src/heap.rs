//! Indexed binary min-heap.
//!
//! Keyed by `Instant` deadline, carrying a `usize` payload (the owning
//! timer's slab index) so callers can maintain a back-pointer from the
//! timer to its current heap slot. Every swap is funneled through
//! `sift_up`/`sift_down`, which notify the caller of each slot change via
//! an `on_move` callback — that callback is how `state::SetState` keeps
//! `TimerData::heap_slot` in sync without the heap needing to know
//! anything about timers.

use std::time::Instant;

#[derive(Default)]
pub(crate) struct IndexedHeap {
    entries: Vec<(Instant, usize)>,
}

impl IndexedHeap {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The root (earliest deadline), if any.
    pub(crate) fn peek(&self) -> Option<(Instant, usize)> {
        self.entries.first().copied()
    }

    /// Insert `id` with `deadline`. Returns true iff the root identity
    /// changed as a result (a fresh insert becoming the new earliest, or
    /// the heap transitioning empty -> non-empty).
    pub(crate) fn insert(
        &mut self,
        id: usize,
        deadline: Instant,
        mut on_move: impl FnMut(usize, usize),
    ) -> bool {
        let root_before = self.entries.first().map(|e| e.1);
        self.entries.push((deadline, id));
        let idx = self.entries.len() - 1;
        on_move(id, idx);
        self.sift_up(idx, &mut on_move);
        self.entries.first().map(|e| e.1) != root_before
    }

    /// Remove the entry occupying `slot`. `slot` must be a valid index
    /// into the heap (the caller tracks this via the timer's own
    /// `heap_slot` field).
    pub(crate) fn remove(&mut self, slot: usize, mut on_move: impl FnMut(usize, usize)) {
        let last = self.entries.len() - 1;
        if slot != last {
            self.entries.swap(slot, last);
            on_move(self.entries[slot].1, slot);
        }
        self.entries.pop();
        if slot < self.entries.len() {
            let moved = self.sift_down(slot, &mut on_move);
            if !moved {
                self.sift_up(slot, &mut on_move);
            }
        }
    }

    fn sift_up(&mut self, mut idx: usize, on_move: &mut impl FnMut(usize, usize)) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.entries[idx].0 < self.entries[parent].0 {
                self.entries.swap(idx, parent);
                on_move(self.entries[idx].1, idx);
                on_move(self.entries[parent].1, parent);
                idx = parent;
            } else {
                break;
            }
        }
    }

    /// Returns true if any swap happened.
    fn sift_down(&mut self, mut idx: usize, on_move: &mut impl FnMut(usize, usize)) -> bool {
        let mut moved = false;
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
            self.entries.swap(idx, smallest);
            on_move(self.entries[idx].1, idx);
            on_move(self.entries[smallest].1, smallest);
            idx = smallest;
            moved = true;
        }
        moved
    }

}
