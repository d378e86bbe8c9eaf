//! Internal min-heap of pending deadlines backing both [`crate::timer::Timer`]
//! and the optional timeout clause on [`crate::readiness::ReadinessEvent::on`].
//!
//! A binary heap rather than the teacher's timing wheel (`timer.rs`'s
//! `Timer<T>`): this crate has no requirement on O(1) arm/disarm at wheel-tick
//! granularity, and a heap keeps cancellation and arbitrary-precision
//! deadlines simple. See `DESIGN.md` for the tradeoff.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::Instant;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct DeadlineId(u64);

struct Entry {
    deadline: Instant,
    id: u64,
    callback: Box<dyn FnOnce()>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Entry) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Entry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Entry) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline sorts
        // highest (comes out first).
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

#[derive(Default)]
pub struct DeadlineQueue {
    heap: BinaryHeap<Entry>,
    cancelled: HashSet<u64>,
    next_id: u64,
}

impl DeadlineQueue {
    pub fn new() -> DeadlineQueue {
        DeadlineQueue::default()
    }

    pub fn schedule(&mut self, deadline: Instant, callback: Box<dyn FnOnce()>) -> DeadlineId {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Entry {
            deadline,
            id,
            callback,
        });
        DeadlineId(id)
    }

    /// Marks a scheduled deadline cancelled. The entry is skipped when its
    /// turn comes up rather than removed from the heap immediately (lazy
    /// deletion), which keeps `cancel` O(log n) amortized instead of O(n).
    pub fn cancel(&mut self, id: DeadlineId) {
        self.cancelled.insert(id.0);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.deadline)
    }

    /// Pops and returns every callback whose deadline has passed, skipping
    /// cancelled entries.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<Box<dyn FnOnce()>> {
        let mut ready = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let entry = self.heap.pop().expect("peeked entry must pop");
            if self.cancelled.remove(&entry.id) {
                continue;
            }
            ready.push(entry.callback);
        }
        ready
    }

    pub fn len(&self) -> usize {
        self.heap.len() - self.cancelled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    #[test]
    fn drains_only_expired_entries_in_deadline_order() {
        let mut queue = DeadlineQueue::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let now = Instant::now();

        let o1 = order.clone();
        queue.schedule(now, Box::new(move || o1.borrow_mut().push(1)));
        let o2 = order.clone();
        queue.schedule(now + Duration::from_secs(10), Box::new(move || o2.borrow_mut().push(2)));
        let o3 = order.clone();
        queue.schedule(now - Duration::from_millis(1), Box::new(move || o3.borrow_mut().push(3)));

        for cb in queue.drain_expired(now) {
            cb();
        }
        assert_eq!(*order.borrow(), vec![3, 1]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn cancelled_entries_are_skipped() {
        let mut queue = DeadlineQueue::new();
        let ran = Rc::new(RefCell::new(false));
        let ran2 = ran.clone();
        let now = Instant::now();
        let id = queue.schedule(now, Box::new(move || *ran2.borrow_mut() = true));
        queue.cancel(id);
        let due = queue.drain_expired(now);
        assert!(due.is_empty());
        assert!(!*ran.borrow());
    }
}
