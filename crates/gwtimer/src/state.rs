//! Per-set state: the timer slab and the indexed heap over it.
//!
//! Everything in here lives behind the single coarse `Mutex` owned by
//! `set::Shared` — there is deliberately no per-timer locking, since the
//! heap-maintenance invariant (`heap[timer.slot] == timer`) spans
//! multiple timers at once during a sift and can't be protected by
//! anything finer.

use std::time::Instant;

use crate::heap::IndexedHeap;

pub(crate) struct TimerData<E> {
    pub(crate) heap_slot: Option<usize>,
    pub(crate) template_event: Option<E>,
    pub(crate) in_flight_event: Option<E>,
}

impl<E> TimerData<E> {
    fn new() -> Self {
        Self {
            heap_slot: None,
            template_event: None,
            in_flight_event: None,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.heap_slot.is_some()
    }
}

pub(crate) struct SetState<E> {
    slab: Vec<Option<TimerData<E>>>,
    free: Vec<usize>,
    heap: IndexedHeap,
}

impl<E> SetState<E> {
    pub(crate) fn new() -> Self {
        Self {
            slab: Vec::new(),
            free: Vec::new(),
            heap: IndexedHeap::new(),
        }
    }

    pub(crate) fn alloc(&mut self) -> usize {
        if let Some(id) = self.free.pop() {
            self.slab[id] = Some(TimerData::new());
            id
        } else {
            self.slab.push(Some(TimerData::new()));
            self.slab.len() - 1
        }
    }

    /// Release a timer's slot. The timer must already be disarmed.
    pub(crate) fn free(&mut self, id: usize) {
        debug_assert!(self.slab[id].as_ref().map(|t| !t.is_active()).unwrap_or(true));
        self.slab[id] = None;
        self.free.push(id);
    }

    pub(crate) fn timer(&self, id: usize) -> &TimerData<E> {
        self.slab[id].as_ref().expect("timer slot not occupied")
    }

    pub(crate) fn timer_mut(&mut self, id: usize) -> &mut TimerData<E> {
        self.slab[id].as_mut().expect("timer slot not occupied")
    }

    /// (Re)arm `id` to fire at `deadline`, removing it from the heap
    /// first if it was already active. Returns true iff the heap's root
    /// changed identity as a result (the worker needs waking).
    pub(crate) fn arm(&mut self, id: usize, deadline: Instant) -> bool {
        let SetState { slab, heap, .. } = self;
        if let Some(slot) = slab[id].as_mut().expect("timer slot not occupied").heap_slot.take() {
            heap.remove(slot, |moved_id, moved_slot| {
                slab[moved_id].as_mut().unwrap().heap_slot = Some(moved_slot);
            });
        }
        let became_root = heap.insert(id, deadline, |moved_id, moved_slot| {
            slab[moved_id].as_mut().unwrap().heap_slot = Some(moved_slot);
        });
        became_root
    }

    /// Remove `id` from the heap if present. No-op (and no wake) if it
    /// wasn't active.
    pub(crate) fn disarm(&mut self, id: usize) {
        let SetState { slab, heap, .. } = self;
        if let Some(slot) = slab[id].as_mut().expect("timer slot not occupied").heap_slot.take() {
            heap.remove(slot, |moved_id, moved_slot| {
                slab[moved_id].as_mut().unwrap().heap_slot = Some(moved_slot);
            });
        }
    }

    /// The id at the heap's root, if its deadline is already due.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<usize> {
        match self.heap.peek() {
            Some((deadline, id)) if deadline <= now => {
                self.disarm(id);
                Some(id)
            }
            _ => None,
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|(deadline, _)| deadline)
    }

    pub(crate) fn active_count(&self) -> usize {
        self.heap.len()
    }

    /// Disarm every still-active timer, in no particular order.
    pub(crate) fn disarm_all(&mut self) {
        while let Some((_, id)) = self.heap.peek() {
            self.disarm(id);
        }
    }

    #[cfg(test)]
    pub(crate) fn heap_len(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn alloc_reuses_freed_slots() {
        let mut state: SetState<u32> = SetState::new();
        let a = state.alloc();
        let b = state.alloc();
        state.free(a);
        let c = state.alloc();
        assert_eq!(c, a);
        assert_ne!(b, c);
    }

    #[test]
    fn arm_and_disarm_track_heap_membership() {
        let mut state: SetState<u32> = SetState::new();
        let id = state.alloc();
        assert!(!state.timer(id).is_active());

        let now = Instant::now();
        state.arm(id, now + Duration::from_secs(5));
        assert!(state.timer(id).is_active());
        assert_eq!(state.heap_len(), 1);

        state.disarm(id);
        assert!(!state.timer(id).is_active());
        assert_eq!(state.heap_len(), 0);
    }

    #[test]
    fn rearming_an_active_timer_does_not_duplicate_heap_entries() {
        let mut state: SetState<u32> = SetState::new();
        let id = state.alloc();
        let now = Instant::now();
        state.arm(id, now + Duration::from_secs(5));
        state.arm(id, now + Duration::from_secs(1));
        assert_eq!(state.heap_len(), 1);
        assert_eq!(state.next_deadline(), Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn pop_due_only_returns_elapsed_timers() {
        let mut state: SetState<u32> = SetState::new();
        let id = state.alloc();
        let now = Instant::now();
        state.arm(id, now + Duration::from_secs(10));
        assert_eq!(state.pop_due(now), None);
        assert_eq!(state.pop_due(now + Duration::from_secs(11)), Some(id));
        assert!(!state.timer(id).is_active());
    }
}
