//! Bounded-concurrency priority queue for fetch and processing work.
//!
//! Work items carry a priority; when a slot frees, the highest-priority
//! pending item dispatches first, FIFO within a priority. The queue is owned
//! by the orchestrator and mutated only on its serial context, so it needs
//! no internal locking. Dispatched work runs elsewhere; the orchestrator
//! calls [`finish`](OperationQueue::finish) when the work's result arrives
//! to release the slot.
//!
//! Priorities of pending items can change after submission (a high-priority
//! task joining a session escalates its fetch). Rather than rebuilding the
//! heap, a priority change bumps the item's generation and pushes a fresh
//! heap entry; stale entries are skipped at pop time.

use crate::request::Priority;
use std::collections::{BinaryHeap, HashMap};

/// Identifier of a submitted work item.
pub(crate) type ItemId = u64;

struct HeapEntry {
    priority: Priority,
    seq: u64,
    id: ItemId,
    generation: u32,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then earlier submission.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

enum ItemState<T> {
    Pending {
        payload: T,
        priority: Priority,
        generation: u32,
    },
    Running,
}

/// Priority queue capping concurrently running work.
pub(crate) struct OperationQueue<T> {
    capacity: usize,
    running: usize,
    next_id: u64,
    heap: BinaryHeap<HeapEntry>,
    items: HashMap<ItemId, ItemState<T>>,
}

impl<T> OperationQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        Self {
            capacity,
            running: 0,
            next_id: 0,
            heap: BinaryHeap::new(),
            items: HashMap::new(),
        }
    }

    /// Submits work at the given priority. The item does not run until the
    /// caller drains it via [`poll_ready`](Self::poll_ready).
    pub fn push(&mut self, priority: Priority, payload: T) -> ItemId {
        self.next_id += 1;
        let id = self.next_id;
        self.items.insert(
            id,
            ItemState::Pending {
                payload,
                priority,
                generation: 0,
            },
        );
        self.heap.push(HeapEntry {
            priority,
            seq: id,
            id,
            generation: 0,
        });
        id
    }

    /// Returns the next dispatchable item, if a slot is free. The item is
    /// marked running until [`finish`](Self::finish) is called for it.
    pub fn poll_ready(&mut self) -> Option<(ItemId, T)> {
        while self.running < self.capacity {
            let entry = self.heap.pop()?;
            let current = match self.items.get(&entry.id) {
                Some(ItemState::Pending { generation, .. }) => *generation,
                _ => continue, // cancelled, finished, or already running
            };
            if current != entry.generation {
                continue; // superseded by a priority change
            }
            if let Some(ItemState::Pending { payload, .. }) =
                self.items.insert(entry.id, ItemState::Running)
            {
                self.running += 1;
                return Some((entry.id, payload));
            }
        }
        None
    }

    /// Cancels a not-yet-started item. Returns true if the item was pending
    /// and has been removed; a running or unknown item is left untouched.
    pub fn cancel(&mut self, id: ItemId) -> bool {
        match self.items.get(&id) {
            Some(ItemState::Pending { .. }) => {
                self.items.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// Releases the slot held by a running item. Idempotent: finishing an
    /// unknown or already-finished item is a no-op.
    pub fn finish(&mut self, id: ItemId) -> bool {
        match self.items.get(&id) {
            Some(ItemState::Running) => {
                self.items.remove(&id);
                self.running -= 1;
                true
            }
            _ => false,
        }
    }

    /// Updates the priority of a pending item. Running items are unaffected.
    pub fn set_priority(&mut self, id: ItemId, priority: Priority) {
        if let Some(ItemState::Pending {
            priority: current,
            generation,
            ..
        }) = self.items.get_mut(&id)
        {
            if *current == priority {
                return;
            }
            *current = priority;
            *generation += 1;
            let generation = *generation;
            self.heap.push(HeapEntry {
                priority,
                seq: id,
                id,
                generation,
            });
        }
    }

    /// Number of items currently running.
    pub fn running(&self) -> usize {
        self.running
    }
}
