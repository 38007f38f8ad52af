//! Relay storage in process-shared memory.
//!
//! The whole buffer lives in one anonymous `MAP_SHARED` mapping created
//! before the stage processes are forked, so parent and children address the
//! same pages. Layout:
//!
//! ```text
//! +-----------------------------+
//! | Header                      |  pthread mutex + cond (PROCESS_SHARED),
//! |                             |  ring indices, last stamp, counters
//! +-----------------------------+
//! | slot 0: SlotHeader | bytes  |
//! | slot 1: SlotHeader | bytes  |  capacity + 1 slots, each `stride` bytes
//! | ...                         |
//! +-----------------------------+
//! ```
//!
//! Payloads are stored as encoded bytes; nothing in the mapping refers to
//! process-local memory.

use super::{EntryStore, Monitor};
use crate::error::{PipelineError, Result};
use crate::metrics::RelayStats;
use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use std::ffi::c_void;
use std::mem::{align_of, size_of, MaybeUninit};
use std::num::NonZeroUsize;
use std::ptr::{addr_of_mut, NonNull};

#[repr(C)]
struct Header {
    mutex: libc::pthread_mutex_t,
    cond: libc::pthread_cond_t,
    capacity: usize,
    slots: usize,
    slot_size: usize,
    head: usize,
    len: usize,
    last_stamp: u64,
    stats: RelayStats,
}

#[repr(C)]
struct SlotHeader {
    stamp: u64,
    len: usize,
}

fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// An anonymous shared mapping, unmapped on drop in each process holding it
struct SharedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

impl SharedRegion {
    fn new(len: usize) -> Result<Self> {
        let size = NonZeroUsize::new(len)
            .ok_or_else(|| PipelineError::SharedMemory("mapping size must be non-zero".into()))?;
        // SAFETY: fresh anonymous mapping, no existing memory is aliased
        let ptr = unsafe {
            mmap_anonymous(
                None,
                size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .map_err(|e| PipelineError::SharedMemory(format!("mmap failed: {e}")))?;
        Ok(Self {
            ptr: ptr.cast::<u8>(),
            len,
        })
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe the mapping created in `new`
        unsafe {
            let _ = munmap(self.ptr.cast::<c_void>(), self.len);
        }
    }
}

fn check(rc: libc::c_int, what: &str) -> Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(PipelineError::SharedMemory(format!(
            "{what} failed: {}",
            std::io::Error::from_raw_os_error(rc)
        )))
    }
}

/// Lock result handling shared by lock and wait. A robust mutex whose owner
/// died (a stage process killed mid-operation) is marked consistent again.
fn check_lock(rc: libc::c_int, mutex: *mut libc::pthread_mutex_t, what: &str) -> Result<()> {
    if owner_died(rc) {
        tracing::warn!("relay buffer lock owner died; recovering mutex");
        // SAFETY: after EOWNERDEAD the caller holds the mutex
        return check(unsafe { mark_consistent(mutex) }, "pthread_mutex_consistent");
    }
    check(rc, what)
}

#[cfg(target_os = "linux")]
fn owner_died(rc: libc::c_int) -> bool {
    rc == libc::EOWNERDEAD
}

#[cfg(not(target_os = "linux"))]
fn owner_died(_rc: libc::c_int) -> bool {
    false
}

#[cfg(target_os = "linux")]
unsafe fn mark_consistent(mutex: *mut libc::pthread_mutex_t) -> libc::c_int {
    libc::pthread_mutex_consistent(mutex)
}

#[cfg(not(target_os = "linux"))]
unsafe fn mark_consistent(_mutex: *mut libc::pthread_mutex_t) -> libc::c_int {
    0
}

#[cfg(target_os = "linux")]
unsafe fn set_robust(attr: *mut libc::pthread_mutexattr_t) -> Result<()> {
    check(
        libc::pthread_mutexattr_setrobust(attr, libc::PTHREAD_MUTEX_ROBUST),
        "pthread_mutexattr_setrobust",
    )
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_robust(_attr: *mut libc::pthread_mutexattr_t) -> Result<()> {
    Ok(())
}

/// Process-shared lock and condition variable wrapping a slot ring.
pub struct ProcessMonitor {
    region: SharedRegion,
    stride: usize,
}

// SAFETY: all access to the mapping goes through the process-shared pthread
// mutex stored at its start.
unsafe impl Send for ProcessMonitor {}
unsafe impl Sync for ProcessMonitor {}

impl std::fmt::Debug for ProcessMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessMonitor")
            .field("mapping_len", &self.region.len)
            .field("stride", &self.stride)
            .finish()
    }
}

impl ProcessMonitor {
    /// Map and initialise a ring for `capacity` entries of at most
    /// `slot_size` encoded bytes each.
    pub fn new(capacity: usize, slot_size: usize) -> Result<Self> {
        let slots = capacity + 1;
        let stride = round_up(size_of::<SlotHeader>() + slot_size, align_of::<SlotHeader>());
        let header_len = round_up(size_of::<Header>(), align_of::<SlotHeader>());
        let region = SharedRegion::new(header_len + slots * stride)?;

        let monitor = Self { region, stride };
        // SAFETY: the mapping is zero-filled, large enough for Header and not
        // yet visible to any other process
        unsafe { monitor.init(capacity, slots, slot_size)? };
        Ok(monitor)
    }

    unsafe fn init(&self, capacity: usize, slots: usize, slot_size: usize) -> Result<()> {
        let header = self.header();

        let mut mutex_attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        check(
            libc::pthread_mutexattr_init(mutex_attr.as_mut_ptr()),
            "pthread_mutexattr_init",
        )?;
        let configured = check(
            libc::pthread_mutexattr_setpshared(mutex_attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED),
            "pthread_mutexattr_setpshared",
        )
        .and_then(|()| set_robust(mutex_attr.as_mut_ptr()))
        .and_then(|()| {
            check(
                libc::pthread_mutex_init(addr_of_mut!((*header).mutex), mutex_attr.as_ptr()),
                "pthread_mutex_init",
            )
        });
        libc::pthread_mutexattr_destroy(mutex_attr.as_mut_ptr());
        configured?;

        let mut cond_attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
        check(
            libc::pthread_condattr_init(cond_attr.as_mut_ptr()),
            "pthread_condattr_init",
        )?;
        let configured = check(
            libc::pthread_condattr_setpshared(cond_attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED),
            "pthread_condattr_setpshared",
        )
        .and_then(|()| {
            check(
                libc::pthread_cond_init(addr_of_mut!((*header).cond), cond_attr.as_ptr()),
                "pthread_cond_init",
            )
        });
        libc::pthread_condattr_destroy(cond_attr.as_mut_ptr());
        configured?;

        addr_of_mut!((*header).capacity).write(capacity);
        addr_of_mut!((*header).slots).write(slots);
        addr_of_mut!((*header).slot_size).write(slot_size);
        Ok(())
    }

    fn header(&self) -> *mut Header {
        self.region.ptr.as_ptr().cast::<Header>()
    }

    fn mutex(&self) -> *mut libc::pthread_mutex_t {
        // SAFETY: header points into the live mapping
        unsafe { addr_of_mut!((*self.header()).mutex) }
    }

    fn cond(&self) -> *mut libc::pthread_cond_t {
        // SAFETY: header points into the live mapping
        unsafe { addr_of_mut!((*self.header()).cond) }
    }

    fn lock(&self) -> Result<LockGuard<'_>> {
        // SAFETY: the mutex was initialised in `init`
        let rc = unsafe { libc::pthread_mutex_lock(self.mutex()) };
        check_lock(rc, self.mutex(), "pthread_mutex_lock")?;
        Ok(LockGuard { monitor: self })
    }

    /// Store view, valid only while the lock is held
    fn store(&self) -> ProcessStore {
        let header_len = round_up(size_of::<Header>(), align_of::<SlotHeader>());
        ProcessStore {
            header: self.header(),
            // SAFETY: the slot area starts header_len bytes into the mapping
            slots: unsafe { self.region.ptr.as_ptr().add(header_len) },
            stride: self.stride,
        }
    }
}

struct LockGuard<'a> {
    monitor: &'a ProcessMonitor,
}

impl LockGuard<'_> {
    fn wait(&self) -> Result<()> {
        // SAFETY: this guard holds the mutex paired with the condition
        let rc = unsafe { libc::pthread_cond_wait(self.monitor.cond(), self.monitor.mutex()) };
        check_lock(rc, self.monitor.mutex(), "pthread_cond_wait")
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: this guard holds the mutex
        unsafe {
            libc::pthread_mutex_unlock(self.monitor.mutex());
        }
    }
}

impl Monitor for ProcessMonitor {
    type Store = ProcessStore;

    fn with_store<R>(&self, f: impl FnOnce(&mut Self::Store) -> R) -> Result<R> {
        let _guard = self.lock()?;
        let mut store = self.store();
        Ok(f(&mut store))
    }

    fn wait_until<R>(&self, mut ready: impl FnMut(&mut Self::Store) -> Option<R>) -> Result<R> {
        let guard = self.lock()?;
        let mut store = self.store();
        loop {
            if let Some(value) = ready(&mut store) {
                return Ok(value);
            }
            guard.wait()?;
        }
    }

    fn notify_all(&self) {
        // SAFETY: the condition was initialised in `init`
        unsafe {
            libc::pthread_cond_broadcast(self.cond());
        }
    }
}

/// Ring of fixed-size slots inside a [`ProcessMonitor`] mapping
pub struct ProcessStore {
    header: *mut Header,
    slots: *mut u8,
    stride: usize,
}

impl ProcessStore {
    fn header(&self) -> &Header {
        // SAFETY: only constructed while the monitor lock is held
        unsafe { &*self.header }
    }

    fn header_mut(&mut self) -> &mut Header {
        // SAFETY: only constructed while the monitor lock is held
        unsafe { &mut *self.header }
    }

    fn slot(&self, index: usize) -> *mut u8 {
        // SAFETY: index < slots, so the slot lies inside the mapping
        unsafe { self.slots.add(index * self.stride) }
    }

    /// Ring position of the n-th retained entry (0 = oldest)
    fn position(&self, nth: usize) -> usize {
        let header = self.header();
        (header.head + nth) % header.slots
    }

    fn read_slot(&self, index: usize) -> (u64, Vec<u8>) {
        let slot = self.slot(index);
        // SAFETY: slot headers are written by push_back before len grows
        unsafe {
            let meta = &*slot.cast::<SlotHeader>();
            let data = slot.add(size_of::<SlotHeader>());
            (meta.stamp, std::slice::from_raw_parts(data, meta.len).to_vec())
        }
    }
}

impl EntryStore for ProcessStore {
    type Item = Vec<u8>;

    fn capacity(&self) -> usize {
        self.header().capacity
    }

    fn len(&self) -> usize {
        self.header().len
    }

    fn last_stamp(&self) -> u64 {
        self.header().last_stamp
    }

    fn set_last_stamp(&mut self, stamp: u64) {
        self.header_mut().last_stamp = stamp;
    }

    fn newest_stamp(&self) -> Option<u64> {
        let len = self.len();
        if len == 0 {
            return None;
        }
        let slot = self.slot(self.position(len - 1));
        // SAFETY: the slot holds a written entry
        Some(unsafe { (*slot.cast::<SlotHeader>()).stamp })
    }

    fn push_back(&mut self, stamp: u64, item: Vec<u8>) {
        let (len, slots, slot_size) = {
            let header = self.header();
            (header.len, header.slots, header.slot_size)
        };
        debug_assert!(item.len() <= slot_size, "payload checked against slot size");
        if len == slots {
            // Ring already holds capacity + 1 entries; make room
            self.pop_front();
        }
        let index = self.position(self.len());
        let slot = self.slot(index);
        let bytes = item.len().min(slot_size);
        // SAFETY: slot has room for a SlotHeader followed by slot_size bytes
        unsafe {
            slot.cast::<SlotHeader>().write(SlotHeader { stamp, len: bytes });
            std::ptr::copy_nonoverlapping(item.as_ptr(), slot.add(size_of::<SlotHeader>()), bytes);
        }
        self.header_mut().len += 1;
    }

    fn pop_front(&mut self) -> bool {
        let header = self.header_mut();
        if header.len == 0 {
            return false;
        }
        header.head = (header.head + 1) % header.slots;
        header.len -= 1;
        true
    }

    fn newest(&self) -> Option<Vec<u8>> {
        let len = self.len();
        if len == 0 {
            return None;
        }
        Some(self.read_slot(self.position(len - 1)).1)
    }

    fn snapshot(&self) -> Vec<Vec<u8>> {
        (0..self.len())
            .map(|nth| self.read_slot(self.position(nth)).1)
            .collect()
    }

    fn stats(&self) -> RelayStats {
        self.header().stats
    }

    fn stats_mut(&mut self) -> &mut RelayStats {
        &mut self.header_mut().stats
    }
}
