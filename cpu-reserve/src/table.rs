//! Reservation table
//!
//! Fixed-capacity sequence of reservations kept sorted ascending by
//! priority. The table itself has no interior locking: it lives behind one
//! [`SharedTable`] mutex, and every structural change as well as every scan
//! from a watcher happens with that mutex held.
//!
//! A delete has to let go of the mutex while watchers shut down. Threads in
//! that window are marked as being deleted so nothing else touches them.

use crate::analysis;
use crate::reservation::{Reservation, ThreadId, PRIMARY_ID};
use crate::watch::Watcher;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

/// The table behind its single lock
pub type SharedTable = Arc<Mutex<ReservationTable>>;

/// One admitted reservation
pub struct ReservationEntry {
    /// Scheduling parameters
    pub params: Reservation,
    /// Human-readable name
    pub name: String,
    /// Client that requested the reservation
    pub creator: ThreadId,
    /// Preemption watcher, primary periodic entries only
    pub watcher: Option<Watcher>,
}

impl ReservationEntry {
    pub fn new(params: Reservation, name: impl Into<String>, creator: ThreadId) -> Self {
        Self {
            params,
            name: name.into(),
            creator,
            watcher: None,
        }
    }

    /// Check if this is the thread's primary periodic reservation
    pub fn is_primary(&self) -> bool {
        self.params.id == PRIMARY_ID && !self.params.is_dp()
    }
}

/// Priority-ordered reservation table
pub struct ReservationTable {
    entries: Vec<ReservationEntry>,
    capacity: usize,
    /// Threads with a delete in flight, with its completion signal
    deletions: HashMap<ThreadId, watch::Receiver<bool>>,
}

impl ReservationTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            deletions: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Lowest index whose priority is `>= priority`
    pub fn find_insert_position(&self, priority: u32) -> usize {
        self.entries.partition_point(|e| e.params.priority < priority)
    }

    /// Insert at `index`, shifting later entries up
    ///
    /// The caller picks `index` with [`find_insert_position`](Self::find_insert_position).
    pub fn insert_at(&mut self, index: usize, entry: ReservationEntry) {
        debug_assert!(self.entries.len() < self.capacity);
        self.entries.insert(index, entry);
    }

    /// Remove the entry at `index`, shifting later entries down
    pub fn remove_at(&mut self, index: usize) -> ReservationEntry {
        self.entries.remove(index)
    }

    /// Insert keeping priority order; returns the position used
    pub fn insert_sorted(&mut self, entry: ReservationEntry) -> usize {
        let pos = self.find_insert_position(entry.params.priority);
        self.insert_at(pos, entry);
        pos
    }

    pub fn get(&self, index: usize) -> Option<&ReservationEntry> {
        self.entries.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut ReservationEntry> {
        self.entries.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReservationEntry> {
        self.entries.iter()
    }

    /// Index of the periodic timeslice `id` of `thread`
    pub fn position(&self, thread: ThreadId, id: u32) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| !e.params.is_dp() && e.params.thread == thread && e.params.id == id)
    }

    /// Primary periodic reservation of `thread`
    pub fn primary_mut(&mut self, thread: ThreadId) -> Option<&mut ReservationEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.params.thread == thread && e.is_primary())
    }

    /// Periodic reservations of `thread`
    pub fn periodic_of(&self, thread: ThreadId) -> impl Iterator<Item = &ReservationEntry> {
        self.entries
            .iter()
            .filter(move |e| !e.params.is_dp() && e.params.thread == thread)
    }

    /// Consistent copy of the scheduling parameters, in table order
    pub fn snapshot(&self) -> Vec<Reservation> {
        self.entries.iter().map(|e| e.params).collect()
    }

    /// Remove every entry matching `pred`, in table order
    pub fn drain_matching<F>(&mut self, mut pred: F) -> Vec<ReservationEntry>
    where
        F: FnMut(&ReservationEntry) -> bool,
    {
        let mut removed = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            if pred(&self.entries[i]) {
                removed.push(self.entries.remove(i));
            } else {
                i += 1;
            }
        }
        removed
    }

    /// Check the ordering invariant
    pub fn is_sorted(&self) -> bool {
        self.entries
            .windows(2)
            .all(|w| w[0].params.priority <= w[1].params.priority)
    }

    /// Response time of the entry at `index` given the current table
    ///
    /// Interference is taken from `index` upwards, so among equal
    /// priorities only the entries placed after this one count.
    pub fn response_time_at(&self, index: usize) -> Option<Result<u64, analysis::Unschedulable>> {
        let entry = self.entries.get(index)?.params;
        let snapshot = self.snapshot();
        Some(analysis::response_time(&snapshot, &entry, index, None))
    }

    /// Mark `thread` as being deleted until `done` turns true
    pub fn begin_deletion(&mut self, thread: ThreadId, done: watch::Receiver<bool>) {
        self.deletions.insert(thread, done);
    }

    pub fn end_deletion(&mut self, thread: ThreadId) {
        self.deletions.remove(&thread);
    }

    /// Completion signal of a delete still running for `thread`
    ///
    /// A mark whose deleter went away without finishing is ignored.
    pub fn deletion(&self, thread: ThreadId) -> Option<watch::Receiver<bool>> {
        let done = self.deletions.get(&thread)?;
        if done.has_changed().is_err() || *done.borrow() {
            return None;
        }
        Some(done.clone())
    }

    pub fn is_deleting(&self, thread: ThreadId) -> bool {
        self.deletion(thread).is_some()
    }
}
