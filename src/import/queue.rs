//! Import task queue
//!
//! A fixed-capacity ring of task slots shared by the driver and the
//! worker pool, coordinated by three cursors:
//!
//! - `pub` (driver): claims a free slot, fills it, publishes;
//! - `sub` (workers, and the driver when stealing): CAS-claims the next
//!   published slot and executes it;
//! - `collect` (driver): consumes done slots in publish order.
//!
//! Slot payloads sit behind a `Mutex` but the cursor protocol guarantees
//! exactly one owner per slot at any time, so locks never contend.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::import::task::ImportTask;

pub const QUEUE_CAPACITY: usize = 64;

const SLOT_FREE: u8 = 0;
const SLOT_PUBLISHED: u8 = 1;
const SLOT_CLAIMED: u8 = 2;
const SLOT_DONE: u8 = 3;

pub struct TaskQueue {
    slots: Vec<Mutex<ImportTask>>,
    states: Vec<AtomicU8>,
    mask: u64,
    /// Next sequence the driver will publish.
    pub_cursor: AtomicU64,
    /// Sequences below this are published.
    published: AtomicU64,
    /// Next sequence a consumer may claim.
    sub_cursor: AtomicU64,
    /// Next sequence the driver will collect.
    collect_cursor: AtomicU64,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "queue capacity must be a power of two");
        Self {
            slots: (0..capacity).map(|_| Mutex::new(ImportTask::idle())).collect(),
            states: (0..capacity).map(|_| AtomicU8::new(SLOT_FREE)).collect(),
            mask: capacity as u64 - 1,
            pub_cursor: AtomicU64::new(0),
            published: AtomicU64::new(0),
            sub_cursor: AtomicU64::new(0),
            collect_cursor: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn slot(&self, seq: u64) -> &Mutex<ImportTask> {
        &self.slots[(seq & self.mask) as usize]
    }

    #[inline]
    fn state(&self, seq: u64) -> &AtomicU8 {
        &self.states[(seq & self.mask) as usize]
    }

    /// Driver: claim the next slot for publishing, or `None` when the
    /// ring is full (the slot has not been collected yet).
    pub fn next_pub(&self) -> Option<u64> {
        let seq = self.pub_cursor.load(Ordering::Relaxed);
        if seq - self.collect_cursor.load(Ordering::Acquire) >= self.slots.len() as u64 {
            return None;
        }
        debug_assert_eq!(self.state(seq).load(Ordering::Acquire), SLOT_FREE);
        Some(seq)
    }

    /// Driver: make the filled slot visible to consumers.
    pub fn done_pub(&self, seq: u64) {
        self.state(seq).store(SLOT_PUBLISHED, Ordering::Release);
        self.pub_cursor.store(seq + 1, Ordering::Relaxed);
        self.published.store(seq + 1, Ordering::Release);
    }

    /// Consumer: claim the next published slot for execution.
    pub fn next_sub(&self) -> Option<u64> {
        loop {
            let seq = self.sub_cursor.load(Ordering::Acquire);
            if seq >= self.published.load(Ordering::Acquire) {
                return None;
            }
            if self
                .sub_cursor
                .compare_exchange_weak(seq, seq + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.state(seq).store(SLOT_CLAIMED, Ordering::Relaxed);
                return Some(seq);
            }
        }
    }

    /// Consumer: mark an executed slot ready for collection.
    pub fn done_sub(&self, seq: u64) {
        self.state(seq).store(SLOT_DONE, Ordering::Release);
    }

    /// Driver: next done slot in publish order, or `None` when the head
    /// slot is still in flight.
    pub fn next_collect(&self) -> Option<u64> {
        let seq = self.collect_cursor.load(Ordering::Relaxed);
        if seq >= self.published.load(Ordering::Acquire) {
            return None;
        }
        if self.state(seq).load(Ordering::Acquire) != SLOT_DONE {
            return None;
        }
        Some(seq)
    }

    /// Driver: free a collected slot.
    pub fn done_collect(&self, seq: u64) {
        self.state(seq).store(SLOT_FREE, Ordering::Release);
        self.collect_cursor.store(seq + 1, Ordering::Release);
    }

    /// Execute one published task in the caller's thread, if any.
    pub fn steal(&self, worker_id: usize) -> bool {
        match self.next_sub() {
            Some(seq) => {
                self.slot(seq).lock().run(worker_id);
                self.done_sub(seq);
                true
            }
            None => false,
        }
    }

    /// Back off when no sequence can advance.
    pub fn pause() {
        std::hint::spin_loop();
        std::thread::yield_now();
    }
}

/// Worker loop: drain published tasks, then exit once shutdown is raised.
pub fn worker_loop(queue: &TaskQueue, worker_id: usize, shutdown: &std::sync::atomic::AtomicBool) {
    loop {
        match queue.next_sub() {
            Some(seq) => {
                queue.slot(seq).lock().run(worker_id);
                queue.done_sub(seq);
            }
            None => {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                TaskQueue::pause();
            }
        }
    }
}
