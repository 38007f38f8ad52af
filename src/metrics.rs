/// Counters kept inside every relay buffer.
///
/// They live next to the entries and are updated under the buffer lock, so
/// the process backend shares them across stage processes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Entries appended by `put`
    pub published: u64,
    /// Entries dropped from the front to stay within capacity
    pub evicted: u64,
    /// Payloads handed to readers (a batch counts each entry)
    pub delivered: u64,
}

/// A snapshot of a buffer's counters and fill level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub published: u64,
    pub evicted: u64,
    pub delivered: u64,
    pub len: usize,
    pub capacity: usize,
}

impl StatsSnapshot {
    pub fn new(stats: RelayStats, len: usize, capacity: usize) -> Self {
        Self {
            published: stats.published,
            evicted: stats.evicted,
            delivered: stats.delivered,
            len,
            capacity,
        }
    }

    /// Fill level as a percentage (0-100)
    pub fn utilization(&self) -> u32 {
        if self.capacity == 0 {
            return 0;
        }
        ((self.len * 100) / self.capacity).min(100) as u32
    }

    /// Share of published entries that were evicted
    pub fn eviction_ratio(&self) -> f64 {
        if self.published == 0 {
            0.0
        } else {
            self.evicted as f64 / self.published as f64
        }
    }

    /// Format counters as a human-readable string
    pub fn format(&self) -> String {
        format!(
            "Published: {}, Evicted: {}, Delivered: {}, Fill: {}/{} ({}%), Eviction ratio: {:.2}",
            self.published,
            self.evicted,
            self.delivered,
            self.len,
            self.capacity,
            self.utilization(),
            self.eviction_ratio()
        )
    }
}
