use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub read_hits: u64,
    pub read_misses: u64,
    pub read_bytes_cached: u64,
    pub write_bytes_cached: u64,
    pub evictions: u64,
    pub forced_writes: u64,
    pub blocks_written: u64,
    pub write_errors: u64,
    pub write_back_ns: u64,
    /// bytes of resident and queued blocks
    pub cache_used: u64,
    /// bytes of every block allocated by the pool
    pub pool_allocated: u64,
    pub open_files: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    read_hits: AtomicU64,
    read_misses: AtomicU64,
    read_bytes_cached: AtomicU64,
    write_bytes_cached: AtomicU64,
    evictions: AtomicU64,
    forced_writes: AtomicU64,
    blocks_written: AtomicU64,
    write_errors: AtomicU64,
    write_back_ns: AtomicU64,
}

impl Counters {
    pub(crate) fn record_read(&self, hit: bool) {
        if hit {
            self.read_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.read_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_add_read(&self, bytes: u64) {
        self.read_bytes_cached.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_add_write(&self, bytes: u64) {
        self.write_bytes_cached.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_evict(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_force_write(&self) {
        self.forced_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write_back(&self, ns: u64, ok: bool) {
        self.blocks_written.fetch_add(1, Ordering::Relaxed);
        self.write_back_ns.fetch_add(ns, Ordering::Relaxed);
        if !ok {
            self.write_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// the occupancy fields are left for the caller to fill in
    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            read_hits: self.read_hits.load(Ordering::Relaxed),
            read_misses: self.read_misses.load(Ordering::Relaxed),
            read_bytes_cached: self.read_bytes_cached.load(Ordering::Relaxed),
            write_bytes_cached: self.write_bytes_cached.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            forced_writes: self.forced_writes.load(Ordering::Relaxed),
            blocks_written: self.blocks_written.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            write_back_ns: self.write_back_ns.load(Ordering::Relaxed),
            ..CacheStats::default()
        }
    }
}
