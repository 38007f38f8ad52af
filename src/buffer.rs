//! Relay buffers: bounded, timestamp-gated hand-off points between stages.
//!
//! Every buffer keeps at most `capacity` `(timestamp, payload)` entries in
//! insertion order. Writers never block on space; the oldest entries are
//! evicted instead. Readers carry their own [`ReadCursor`] and only ever see
//! entries newer than the last one they consumed.
//!
//! The gating logic lives once in [`Relay`], which runs on top of a pluggable
//! [`Monitor`] (lock plus notify/wait) and [`EntryStore`] (bounded container).
//! Two monitors exist: one for threads sharing the heap and one living in
//! process-shared memory for forked stage processes.

mod process;
mod shared;

use crate::error::{PipelineError, Result};
use crate::metrics::{RelayStats, StatsSnapshot};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub use process::ProcessMonitor;
pub use shared::SharedMonitor;

/// Default slot size for process-shared buffers (64 KiB)
pub const DEFAULT_SLOT_SIZE: usize = 64 * 1024;

/// Values that can travel through a relay buffer.
///
/// The bound is the same for both backends so a pipeline can switch backend
/// without changing its payload type; only the process backend actually
/// serializes.
pub trait Payload: Clone + Send + Serialize + DeserializeOwned + 'static {}

impl<T> Payload for T where T: Clone + Send + Serialize + DeserializeOwned + 'static {}

/// Concurrency substrate for buffers and execution units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Stages run on threads and buffers live on the shared heap
    #[default]
    Threads,
    /// Stages run in forked processes and buffers live in shared mappings
    Processes,
}

/// How a stage reads its input buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    /// Freshest single entry, skipping anything older
    #[default]
    Single,
    /// Exactly `capacity` entries, oldest to newest
    Batch,
}

/// What a read hands to a stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageInput<T> {
    /// One freshest value
    Single(T),
    /// A full buffer worth of values, oldest first
    Batch(Vec<T>),
}

impl<T> StageInput<T> {
    /// Number of values carried
    pub fn len(&self) -> usize {
        match self {
            StageInput::Single(_) => 1,
            StageInput::Batch(items) => items.len(),
        }
    }

    /// True for an empty batch
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, StageInput::Batch(_))
    }

    /// The most recent value
    pub fn newest(&self) -> Option<&T> {
        match self {
            StageInput::Single(item) => Some(item),
            StageInput::Batch(items) => items.last(),
        }
    }

    /// Consume the input, keeping only the most recent value
    pub fn into_newest(self) -> Option<T> {
        match self {
            StageInput::Single(item) => Some(item),
            StageInput::Batch(mut items) => items.pop(),
        }
    }

    /// Consume the input as a vector, oldest first
    pub fn into_vec(self) -> Vec<T> {
        match self {
            StageInput::Single(item) => vec![item],
            StageInput::Batch(items) => items,
        }
    }
}

/// Per-reader position in a buffer's timeline.
///
/// Holds the timestamp of the newest entry this reader has consumed. It only
/// moves forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadCursor {
    last_consumed: u64,
}

impl ReadCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timestamp of the newest entry consumed so far (0 before any read)
    pub fn last_consumed(&self) -> u64 {
        self.last_consumed
    }

    fn advance(&mut self, stamp: u64) {
        self.last_consumed = self.last_consumed.max(stamp);
    }

    fn is_fresh(&self, stamp: u64) -> bool {
        stamp > self.last_consumed
    }
}

/// Bounded, insertion-ordered container of stamped entries.
///
/// Implementations are only touched while their [`Monitor`] lock is held.
pub trait EntryStore {
    type Item;

    fn capacity(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Timestamp handed out by the most recent publish
    fn last_stamp(&self) -> u64;

    fn set_last_stamp(&mut self, stamp: u64);

    /// Timestamp of the newest retained entry
    fn newest_stamp(&self) -> Option<u64>;

    /// Append at the back. Must accept one entry beyond `capacity` so that
    /// eviction can follow the wake-up.
    fn push_back(&mut self, stamp: u64, item: Self::Item);

    /// Drop the oldest entry, returning false if empty
    fn pop_front(&mut self) -> bool;

    /// Copy of the newest payload
    fn newest(&self) -> Option<Self::Item>;

    /// Copies of all payloads, oldest first
    fn snapshot(&self) -> Vec<Self::Item>;

    fn stats(&self) -> RelayStats;

    fn stats_mut(&mut self) -> &mut RelayStats;
}

/// Mutual exclusion plus a wake-up signal around one [`EntryStore`].
pub trait Monitor: Send + Sync {
    type Store: EntryStore;

    /// Run `f` with the lock held
    fn with_store<R>(&self, f: impl FnOnce(&mut Self::Store) -> R) -> Result<R>;

    /// Block until `ready` yields a value, re-checking after every wake-up.
    /// `ready` runs with the lock held.
    fn wait_until<R>(&self, ready: impl FnMut(&mut Self::Store) -> Option<R>) -> Result<R>;

    /// Wake every reader waiting on this monitor. Called with the lock held.
    fn notify_all(&self);
}

/// Next publish timestamp: wall-clock nanoseconds, forced strictly past the
/// previous stamp so two puts within one clock tick stay distinguishable.
fn next_stamp(previous: u64) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    now.max(previous + 1)
}

/// Backend-agnostic timestamp gating over a [`Monitor`].
#[derive(Debug)]
pub struct Relay<M> {
    monitor: M,
}

impl<M: Monitor> Relay<M> {
    pub fn new(monitor: M) -> Self {
        Self { monitor }
    }

    /// Append an entry, wake readers, then trim back to capacity.
    ///
    /// The wake-up is issued before eviction but inside the same critical
    /// section, so a woken reader always evaluates the trimmed state.
    pub fn publish(&self, item: <M::Store as EntryStore>::Item) -> Result<u64> {
        self.monitor.with_store(|store| {
            let stamp = next_stamp(store.last_stamp());
            store.set_last_stamp(stamp);
            store.push_back(stamp, item);
            store.stats_mut().published += 1;

            self.monitor.notify_all();

            let mut evicted = 0;
            while store.len() > store.capacity() && store.pop_front() {
                evicted += 1;
            }
            if evicted > 0 {
                store.stats_mut().evicted += evicted;
                tracing::trace!(evicted, "relay buffer evicted stale entries");
            }
            stamp
        })
    }

    /// Block until an entry newer than `cursor` exists, then peek the newest.
    pub fn latest(&self, cursor: &mut ReadCursor) -> Result<<M::Store as EntryStore>::Item> {
        self.monitor.wait_until(|store| take_latest(store, cursor))
    }

    /// Block until exactly `capacity` entries are held and the newest is
    /// newer than `cursor`, then snapshot them all.
    ///
    /// The predicate is an exact match: a producer that keeps the buffer
    /// overfull between wake-ups can starve this reader.
    pub fn batch(&self, cursor: &mut ReadCursor) -> Result<Vec<<M::Store as EntryStore>::Item>> {
        self.monitor.wait_until(|store| take_batch(store, cursor))
    }

    pub fn try_latest(
        &self,
        cursor: &mut ReadCursor,
    ) -> Result<Option<<M::Store as EntryStore>::Item>> {
        self.monitor.with_store(|store| take_latest(store, cursor))
    }

    pub fn try_batch(
        &self,
        cursor: &mut ReadCursor,
    ) -> Result<Option<Vec<<M::Store as EntryStore>::Item>>> {
        self.monitor.with_store(|store| take_batch(store, cursor))
    }

    pub fn len(&self) -> Result<usize> {
        self.monitor.with_store(|store| store.len())
    }

    pub fn stats(&self) -> Result<StatsSnapshot> {
        self.monitor
            .with_store(|store| StatsSnapshot::new(store.stats(), store.len(), store.capacity()))
    }
}

fn take_latest<S: EntryStore>(store: &mut S, cursor: &mut ReadCursor) -> Option<S::Item> {
    let stamp = store.newest_stamp()?;
    if !cursor.is_fresh(stamp) {
        return None;
    }
    let item = store.newest()?;
    cursor.advance(stamp);
    store.stats_mut().delivered += 1;
    Some(item)
}

fn take_batch<S: EntryStore>(store: &mut S, cursor: &mut ReadCursor) -> Option<Vec<S::Item>> {
    if store.len() != store.capacity() {
        return None;
    }
    let stamp = store.newest_stamp()?;
    if !cursor.is_fresh(stamp) {
        return None;
    }
    let items = store.snapshot();
    cursor.advance(stamp);
    store.stats_mut().delivered += items.len() as u64;
    Some(items)
}

enum Inner<T> {
    Shared(Relay<SharedMonitor<T>>),
    Process {
        relay: Relay<ProcessMonitor>,
        slot_size: usize,
        _payload: PhantomData<fn() -> T>,
    },
}

/// A relay buffer on either backend.
///
/// Cloning is cheap and yields another handle to the same buffer; read
/// position lives in the caller's [`ReadCursor`], not in the handle.
pub struct RelayBuffer<T> {
    inner: Arc<Inner<T>>,
    capacity: usize,
}

impl<T> Clone for RelayBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            capacity: self.capacity,
        }
    }
}

impl<T> std::fmt::Debug for RelayBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayBuffer")
            .field("backend", &self.backend())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<T: Payload> RelayBuffer<T> {
    /// Create a buffer on the given backend.
    ///
    /// `slot_size` bounds one encoded payload and is ignored by the thread
    /// backend.
    pub fn new(capacity: usize, backend: Backend, slot_size: usize) -> Result<Self> {
        match backend {
            Backend::Threads => Self::shared(capacity),
            Backend::Processes => Self::process(capacity, slot_size),
        }
    }

    /// Create a buffer for threads sharing this process's heap
    pub fn shared(capacity: usize) -> Result<Self> {
        check_capacity(capacity)?;
        Ok(Self {
            inner: Arc::new(Inner::Shared(Relay::new(SharedMonitor::new(capacity)))),
            capacity,
        })
    }

    /// Create a buffer in process-shared memory. It must be created before
    /// the stage processes are forked.
    pub fn process(capacity: usize, slot_size: usize) -> Result<Self> {
        check_capacity(capacity)?;
        if slot_size == 0 {
            return Err(PipelineError::ConfigError(
                "slot size must be greater than 0".into(),
            ));
        }
        let monitor = ProcessMonitor::new(capacity, slot_size)?;
        Ok(Self {
            inner: Arc::new(Inner::Process {
                relay: Relay::new(monitor),
                slot_size,
                _payload: PhantomData,
            }),
            capacity,
        })
    }

    /// Publish a payload. Never waits for space.
    ///
    /// The thread backend cannot fail. The process backend fails only when
    /// the payload cannot be encoded into one slot.
    pub fn put(&self, payload: T) -> Result<()> {
        match &*self.inner {
            Inner::Shared(relay) => relay.publish(payload).map(|_| ()),
            Inner::Process {
                relay, slot_size, ..
            } => {
                let bytes = bincode::serialize(&payload)?;
                if bytes.len() > *slot_size {
                    return Err(PipelineError::PayloadTooLarge {
                        size: bytes.len(),
                        slot_size: *slot_size,
                    });
                }
                relay.publish(bytes).map(|_| ())
            }
        }
    }

    /// Block until a payload newer than `cursor` is available and return
    /// the freshest one without removing it.
    pub fn get_latest(&self, cursor: &mut ReadCursor) -> Result<T> {
        match &*self.inner {
            Inner::Shared(relay) => relay.latest(cursor),
            Inner::Process { relay, .. } => decode(&relay.latest(cursor)?),
        }
    }

    /// Block until the buffer holds exactly `capacity` entries with a fresh
    /// newest one, then return all of them oldest first.
    pub fn get_batch(&self, cursor: &mut ReadCursor) -> Result<Vec<T>> {
        match &*self.inner {
            Inner::Shared(relay) => relay.batch(cursor),
            Inner::Process { relay, .. } => relay.batch(cursor)?.iter().map(|b| decode(b)).collect(),
        }
    }

    /// Non-blocking [`get_latest`](Self::get_latest)
    pub fn try_get_latest(&self, cursor: &mut ReadCursor) -> Result<Option<T>> {
        match &*self.inner {
            Inner::Shared(relay) => relay.try_latest(cursor),
            Inner::Process { relay, .. } => relay
                .try_latest(cursor)?
                .map(|bytes| decode(&bytes))
                .transpose(),
        }
    }

    /// Non-blocking [`get_batch`](Self::get_batch)
    pub fn try_get_batch(&self, cursor: &mut ReadCursor) -> Result<Option<Vec<T>>> {
        match &*self.inner {
            Inner::Shared(relay) => relay.try_batch(cursor),
            Inner::Process { relay, .. } => relay
                .try_batch(cursor)?
                .map(|batch| batch.iter().map(|b| decode(b)).collect())
                .transpose(),
        }
    }

    /// Blocking read in the given mode
    pub fn read(&self, mode: ReadMode, cursor: &mut ReadCursor) -> Result<StageInput<T>> {
        match mode {
            ReadMode::Single => self.get_latest(cursor).map(StageInput::Single),
            ReadMode::Batch => self.get_batch(cursor).map(StageInput::Batch),
        }
    }

    /// Number of retained entries
    pub fn len(&self) -> Result<usize> {
        match &*self.inner {
            Inner::Shared(relay) => relay.len(),
            Inner::Process { relay, .. } => relay.len(),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Counters and fill level
    pub fn stats(&self) -> Result<StatsSnapshot> {
        match &*self.inner {
            Inner::Shared(relay) => relay.stats(),
            Inner::Process { relay, .. } => relay.stats(),
        }
    }
}

impl<T> RelayBuffer<T> {
    /// Maximum retained entries, also the batch size
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn backend(&self) -> Backend {
        match &*self.inner {
            Inner::Shared(_) => Backend::Threads,
            Inner::Process { .. } => Backend::Processes,
        }
    }
}

fn check_capacity(capacity: usize) -> Result<()> {
    if capacity == 0 {
        return Err(PipelineError::ConfigError(
            "buffer capacity must be greater than 0".into(),
        ));
    }
    Ok(())
}

fn decode<T: Payload>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}
