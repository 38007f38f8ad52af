use super::{EntryStore, Monitor};
use crate::error::Result;
use crate::metrics::RelayStats;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

/// Heap-backed entry store for the thread backend
#[derive(Debug)]
pub struct VecStore<T> {
    entries: VecDeque<(u64, T)>,
    capacity: usize,
    last_stamp: u64,
    stats: RelayStats,
}

impl<T> VecStore<T> {
    fn new(capacity: usize) -> Self {
        Self {
            // One spare slot for the entry that exists between publish and eviction
            entries: VecDeque::with_capacity(capacity + 1),
            capacity,
            last_stamp: 0,
            stats: RelayStats::default(),
        }
    }
}

impl<T: Clone> EntryStore for VecStore<T> {
    type Item = T;

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn last_stamp(&self) -> u64 {
        self.last_stamp
    }

    fn set_last_stamp(&mut self, stamp: u64) {
        self.last_stamp = stamp;
    }

    fn newest_stamp(&self) -> Option<u64> {
        self.entries.back().map(|(stamp, _)| *stamp)
    }

    fn push_back(&mut self, stamp: u64, item: T) {
        self.entries.push_back((stamp, item));
    }

    fn pop_front(&mut self) -> bool {
        self.entries.pop_front().is_some()
    }

    fn newest(&self) -> Option<T> {
        self.entries.back().map(|(_, item)| item.clone())
    }

    fn snapshot(&self) -> Vec<T> {
        self.entries.iter().map(|(_, item)| item.clone()).collect()
    }

    fn stats(&self) -> RelayStats {
        self.stats
    }

    fn stats_mut(&mut self) -> &mut RelayStats {
        &mut self.stats
    }
}

/// Lock and condition variable for threads sharing one heap
#[derive(Debug)]
pub struct SharedMonitor<T> {
    store: Mutex<VecStore<T>>,
    ready: Condvar,
}

impl<T> SharedMonitor<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            store: Mutex::new(VecStore::new(capacity)),
            ready: Condvar::new(),
        }
    }
}

impl<T: Clone + Send> Monitor for SharedMonitor<T> {
    type Store = VecStore<T>;

    fn with_store<R>(&self, f: impl FnOnce(&mut Self::Store) -> R) -> Result<R> {
        let mut store = self.store.lock();
        Ok(f(&mut *store))
    }

    fn wait_until<R>(&self, mut ready: impl FnMut(&mut Self::Store) -> Option<R>) -> Result<R> {
        let mut store = self.store.lock();
        loop {
            if let Some(value) = ready(&mut *store) {
                return Ok(value);
            }
            self.ready.wait(&mut store);
        }
    }

    fn notify_all(&self) {
        self.ready.notify_all();
    }
}
