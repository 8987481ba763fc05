//! # Buffer Cache
//!
//! Size-bucketed free lists of idle buffer objects.
//!
//! Releasing a buffer object and allocating one of similar size right after
//! is the common pattern of a GPU client: per-frame vertex data, staging
//! uploads, command buffers. Instead of closing the kernel handle, a
//! reusable buffer is parked in the bucket matching its (rounded) size and
//! handed out again by the next allocation with the same size and flags.
//!
//! ## Buckets
//!
//! ```text
//!   1 page   2 pages   3 pages
//!   4 pages  5        6        7          (4 pages   +0/+25/+50/+75 %)
//!   8 pages  10       12       14         (8 pages   +0/+25/+50/+75 %)
//!   ...
//!   64 MiB   80 MiB   96 MiB   112 MiB    (ceiling)
//! ```
//!
//! Each bucket is a FIFO: new entries at the back, so the front always
//! holds the buffer released longest ago (and most likely idle).
//!
//! The cache itself never talks to the kernel. Idleness is decided by the
//! caller-supplied idle check, eviction hands the evicted buffers back to the
//! caller for destruction.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arrayvec::ArrayVec;
use cinder_core::{BoFlags, PAGE_SIZE};

use crate::bo::BoInner;

/// Default largest power-of-two bucket size
pub const CACHE_MAX_SIZE: u64 = 64 * 1024 * 1024;

/// Capacity of the bucket table
pub const MAX_BUCKETS: usize = 64;

// =============================================================================
// BUCKET
// =============================================================================

#[derive(Debug)]
struct CacheEntry {
    bo: Arc<BoInner>,
    freed_at: Instant,
}

/// One size class of idle buffers
#[derive(Debug)]
pub struct Bucket {
    size: u64,
    entries: VecDeque<CacheEntry>,
}

impl Bucket {
    fn new(size: u64) -> Self {
        Self {
            size,
            entries: VecDeque::new(),
        }
    }

    /// Size of every buffer in this bucket
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of idle buffers parked here
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the bucket is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// BUFFER CACHE
// =============================================================================

/// Buffer cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Buffers handed out again
    pub hits: u64,
    /// Lookups that fell through to the kernel
    pub misses: u64,
    /// Buffers parked
    pub inserts: u64,
    /// Buffers evicted for destruction
    pub evictions: u64,
}

/// Size-bucketed cache of idle buffer objects
#[derive(Debug)]
pub struct BoCache {
    buckets: ArrayVec<Bucket, MAX_BUCKETS>,
    stats: CacheStats,
}

impl BoCache {
    /// Build the bucket table up to `max_size`
    ///
    /// The first three buckets are one, two and three pages. From four
    /// pages on, every power of two up to `max_size` gets four buckets at
    /// +0, +25, +50 and +75 %.
    pub fn new(max_size: u64) -> Self {
        let mut buckets = ArrayVec::new();

        for pages in 1..=3 {
            buckets.push(Bucket::new(pages * PAGE_SIZE));
        }

        let mut size = 4 * PAGE_SIZE;
        'outer: while size <= max_size {
            for quarter in 0..4 {
                if buckets.is_full() {
                    log::warn!("bucket table full at {} bytes", size);
                    break 'outer;
                }
                buckets.push(Bucket::new(size + size * quarter / 4));
            }
            size *= 2;
        }

        Self {
            buckets,
            stats: CacheStats::default(),
        }
    }

    /// Index of the smallest bucket that fits `size`
    fn bucket_index(&self, size: u64) -> Option<usize> {
        self.buckets.iter().position(|b| b.size >= size)
    }

    /// Size of the bucket that would hold a buffer of `size` bytes
    ///
    /// `None` above the largest bucket: such buffers are never cached.
    pub fn bucket_size(&self, size: u64) -> Option<u64> {
        self.bucket_index(size).map(|i| self.buckets[i].size)
    }

    /// Take an idle buffer of `size` bytes (a bucket size) and `flags`
    ///
    /// Scans the bucket oldest first. Entries with different flags are
    /// skipped. The first matching entry that `is_idle` accepts is removed
    /// and returned; the scan gives up at the first matching entry that is
    /// still busy, since everything behind it was released later.
    pub fn take<F>(&mut self, size: u64, flags: BoFlags, mut is_idle: F) -> Option<Arc<BoInner>>
    where
        F: FnMut(&BoInner) -> bool,
    {
        let Some(index) = self.bucket_index(size) else {
            self.stats.misses += 1;
            return None;
        };
        let bucket = &mut self.buckets[index];

        let mut found = None;
        for (pos, entry) in bucket.entries.iter().enumerate() {
            if entry.bo.flags() != flags {
                continue;
            }
            if is_idle(&entry.bo) {
                found = Some(pos);
            }
            break;
        }

        match found.and_then(|pos| bucket.entries.remove(pos)) {
            Some(entry) => {
                self.stats.hits += 1;
                Some(entry.bo)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Park `bo`, released at `now`
    ///
    /// Returns the buffer back when no bucket has exactly its size.
    pub fn insert(&mut self, bo: Arc<BoInner>, now: Instant) -> Result<(), Arc<BoInner>> {
        let Some(index) = self.bucket_index(bo.size()) else {
            return Err(bo);
        };
        let bucket = &mut self.buckets[index];
        if bucket.size != bo.size() {
            return Err(bo);
        }

        bucket.entries.push_back(CacheEntry { bo, freed_at: now });
        self.stats.inserts += 1;
        Ok(())
    }

    /// Remove every entry released more than `grace` before `now`
    pub fn evict_expired(&mut self, now: Instant, grace: Duration) -> Vec<Arc<BoInner>> {
        let mut evicted = Vec::new();

        for bucket in self.buckets.iter_mut() {
            while let Some(entry) = bucket.entries.front() {
                if now.saturating_duration_since(entry.freed_at) <= grace {
                    break;
                }
                if let Some(entry) = bucket.entries.pop_front() {
                    evicted.push(entry.bo);
                }
            }
        }

        self.stats.evictions += evicted.len() as u64;
        evicted
    }

    /// Remove every entry
    pub fn evict_all(&mut self) -> Vec<Arc<BoInner>> {
        let evicted: Vec<_> = self
            .buckets
            .iter_mut()
            .flat_map(|b| b.entries.drain(..))
            .map(|entry| entry.bo)
            .collect();
        self.stats.evictions += evicted.len() as u64;
        evicted
    }

    /// Unlink `bo` if it is parked here
    pub fn remove(&mut self, bo: &Arc<BoInner>) -> bool {
        let Some(index) = self.bucket_index(bo.size()) else {
            return false;
        };
        let bucket = &mut self.buckets[index];
        match bucket.entries.iter().position(|e| Arc::ptr_eq(&e.bo, bo)) {
            Some(pos) => {
                bucket.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Whether `bo` is parked here
    pub fn contains(&self, bo: &Arc<BoInner>) -> bool {
        self.buckets
            .iter()
            .any(|b| b.entries.iter().any(|e| Arc::ptr_eq(&e.bo, bo)))
    }

    /// Total number of parked buffers
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }

    /// Whether nothing is parked
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Bucket::is_empty)
    }

    /// The bucket table
    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Get statistics
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

impl Default for BoCache {
    fn default() -> Self {
        Self::new(CACHE_MAX_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::BoHandle;

    fn bo(handle: u32, size: u64, flags: BoFlags) -> Arc<BoInner> {
        Arc::new(BoInner::new(BoHandle::new(handle), size, flags, None, true))
    }

    #[test]
    fn test_bucket_table() {
        let cache = BoCache::default();
        let sizes: Vec<u64> = cache.buckets().iter().map(Bucket::size).collect();

        assert_eq!(&sizes[..7], &[4096, 8192, 12288, 16384, 20480, 24576, 28672]);
        assert_eq!(sizes.len(), 3 + 13 * 4);
        assert_eq!(*sizes.last().unwrap(), CACHE_MAX_SIZE + CACHE_MAX_SIZE * 3 / 4);
        assert!(sizes.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_bucket_size_covers_request() {
        let cache = BoCache::default();
        for size in [1, 4096, 4097, 13_000, 100_000, 1 << 20, 50 << 20] {
            let bucket = cache.bucket_size(size).unwrap();
            assert!(bucket >= size);
        }
        assert_eq!(cache.bucket_size(4097), Some(8192));
        assert_eq!(cache.bucket_size(113 * 1024 * 1024), None);
    }

    #[test]
    fn test_take_matches_flags() {
        let mut cache = BoCache::default();
        let now = Instant::now();
        let wc = bo(1, 4096, BoFlags::WC);
        let cached = bo(2, 4096, BoFlags::CACHED);
        cache.insert(wc.clone(), now).unwrap();
        cache.insert(cached.clone(), now).unwrap();

        let got = cache.take(4096, BoFlags::CACHED, |_| true).unwrap();
        assert!(Arc::ptr_eq(&got, &cached));
        assert!(cache.take(4096, BoFlags::UNCACHED, |_| true).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_take_stops_at_first_busy() {
        // An idle entry queued behind a busy one with the same flags is not
        // found; the lookup falls through to a fresh allocation.
        let mut cache = BoCache::default();
        let now = Instant::now();
        let busy = bo(1, 4096, BoFlags::WC);
        let idle = bo(2, 4096, BoFlags::WC);
        cache.insert(busy.clone(), now).unwrap();
        cache.insert(idle.clone(), now).unwrap();

        let got = cache.take(4096, BoFlags::WC, |b| b.handle() != busy.handle());
        assert!(got.is_none());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_insert_rejects_odd_sizes() {
        let mut cache = BoCache::default();
        let now = Instant::now();
        assert!(cache.insert(bo(1, 5000, BoFlags::WC), now).is_err());
        assert!(cache.insert(bo(2, 256 << 20, BoFlags::WC), now).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evict_after_grace() {
        let mut cache = BoCache::default();
        let t0 = Instant::now();
        let old = bo(1, 4096, BoFlags::WC);
        let young = bo(2, 4096, BoFlags::WC);
        cache.insert(old.clone(), t0).unwrap();
        cache.insert(young.clone(), t0 + Duration::from_millis(800)).unwrap();

        let grace = Duration::from_secs(1);
        assert!(cache.evict_expired(t0 + Duration::from_millis(500), grace).is_empty());

        let evicted = cache.evict_expired(t0 + Duration::from_millis(1500), grace);
        assert_eq!(evicted.len(), 1);
        assert!(Arc::ptr_eq(&evicted[0], &old));
        assert!(cache.contains(&young));

        assert_eq!(cache.evict_all().len(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().evictions, 2);
    }

    #[test]
    fn test_remove() {
        let mut cache = BoCache::default();
        let a = bo(1, 8192, BoFlags::WC);
        cache.insert(a.clone(), Instant::now()).unwrap();
        assert!(cache.remove(&a));
        assert!(!cache.remove(&a));
        assert!(cache.is_empty());
    }
}
