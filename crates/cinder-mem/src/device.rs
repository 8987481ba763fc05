//! # Device Registry
//!
//! One open GPU device and every buffer object known on it.
//!
//! ## Locking
//!
//! A single `spin::Mutex<DeviceState>` guards the handle and name tables,
//! the buffer cache, the GPU address space, the zombie list and every
//! buffer's stream link. Kernel calls that may block (allocation, import)
//! are made with the lock released; only non-blocking idle polls, unmaps
//! and handle closes run under it.
//!
//! A [`Bo`] must never be dropped while the lock is held: dropping the last
//! reference re-enters the device.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cinder_core::{
    BoFlags, BoHandle, CpuPrepOp, Descriptor, Errno, Error, GlobalName, GpuParam, Result,
    Transport, PAGE_SIZE,
};
use hashbrown::HashMap;
use spin::Mutex;

use crate::address_space::AddressSpace;
use crate::bo::{Bo, BoInner, StreamLink};
use crate::cache::{BoCache, CACHE_MAX_SIZE};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Device configuration
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Park released buffers in the cache instead of closing them
    pub bo_reuse: bool,
    /// Largest power-of-two cache bucket
    pub cache_max_size: u64,
    /// How long a cached buffer may sit unused before it is destroyed
    pub cache_grace: Duration,
    /// Upper bound for blocking CPU prepares
    pub cpu_prep_timeout: Duration,
}

impl DeviceConfig {
    /// Default configuration
    pub const fn new() -> Self {
        Self {
            bo_reuse: true,
            cache_max_size: CACHE_MAX_SIZE,
            cache_grace: Duration::from_secs(1),
            cpu_prep_timeout: Duration::from_secs(5),
        }
    }

    /// Every release goes straight back to the kernel
    pub const fn without_reuse() -> Self {
        Self {
            bo_reuse: false,
            ..Self::new()
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Device statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// Buffers allocated by the kernel
    pub kernel_allocs: u64,
    /// Buffers imported by name or descriptor
    pub imports: u64,
    /// Allocations served from the cache
    pub cache_hits: u64,
    /// Releases that parked a buffer in the cache
    pub cache_inserts: u64,
    /// Cached buffers evicted
    pub evictions: u64,
    /// Buffers destroyed (handle closed)
    pub destroyed: u64,
    /// Releases deferred because the GPU still used the buffer's address
    pub zombies: u64,
}

// =============================================================================
// DEVICE STATE
// =============================================================================

struct DeviceState {
    handles: HashMap<BoHandle, Arc<BoInner>>,
    names: HashMap<GlobalName, Arc<BoInner>>,
    cache: BoCache,
    va: Option<AddressSpace>,
    zombies: Vec<Arc<BoInner>>,
    stats: DeviceStats,
}

fn poll_idle<T: Transport>(transport: &T, bo: &BoInner) -> bool {
    transport
        .bo_cpu_prep(
            bo.handle(),
            CpuPrepOp::READ | CpuPrepOp::WRITE | CpuPrepOp::NOSYNC,
            Duration::ZERO,
        )
        .is_ok()
}

impl DeviceState {
    /// Take a reference found through the registry, rescuing an unreferenced
    /// buffer from the cache or the zombie list
    fn acquire(&mut self, bo: &Arc<BoInner>) {
        if bo.acquire() != 0 {
            return;
        }
        if self.cache.remove(bo) {
            log::debug!("rescued {:?} from the cache", bo.handle());
        } else if let Some(pos) = self.zombies.iter().position(|z| Arc::ptr_eq(z, bo)) {
            self.zombies.remove(pos);
            log::debug!("rescued {:?} from the zombie list", bo.handle());
        }
    }

    /// The last reference to `bo` is gone
    fn release_final<T: Transport>(
        &mut self,
        transport: &T,
        config: &DeviceConfig,
        bo: &Arc<BoInner>,
    ) {
        *bo.link().lock() = None;

        if config.bo_reuse && bo.is_reusable() {
            let now = Instant::now();
            if self.cache.insert(Arc::clone(bo), now).is_ok() {
                self.stats.cache_inserts += 1;
                self.cleanup_cache(transport, now, config.cache_grace);
                return;
            }
        }

        self.destroy(transport, bo);
    }

    fn cleanup_cache<T: Transport>(&mut self, transport: &T, now: Instant, grace: Duration) {
        let evicted = self.cache.evict_expired(now, grace);
        if evicted.is_empty() {
            return;
        }

        log::debug!("evicting {} cached buffers", evicted.len());
        self.stats.evictions += evicted.len() as u64;
        for bo in &evicted {
            self.destroy(transport, bo);
        }
    }

    /// Destroy `bo`, or park it on the zombie list while the GPU may still
    /// access its address
    fn destroy<T: Transport>(&mut self, transport: &T, bo: &Arc<BoInner>) {
        if bo.va().is_some() && !poll_idle(transport, bo) {
            log::debug!("{:?} still busy, deferring release", bo.handle());
            self.zombies.push(Arc::clone(bo));
            self.stats.zombies += 1;
            return;
        }
        self.kill(transport, bo);
    }

    fn reap_zombies<T: Transport>(&mut self, transport: &T) {
        if self.zombies.is_empty() {
            return;
        }

        let (dead, alive): (Vec<_>, Vec<_>) = core::mem::take(&mut self.zombies)
            .into_iter()
            .partition(|bo| poll_idle(transport, bo));
        self.zombies = alive;

        if !dead.is_empty() {
            log::debug!("reaping {} zombie buffers", dead.len());
        }
        for bo in &dead {
            self.kill(transport, bo);
        }
    }

    fn kill<T: Transport>(&mut self, transport: &T, bo: &Arc<BoInner>) {
        let handle = bo.handle();
        if self.handles.get(&handle).is_some_and(|b| Arc::ptr_eq(b, bo)) {
            self.handles.remove(&handle);
        }
        if let Some(name) = bo.global_name() {
            if self.names.get(&name).is_some_and(|b| Arc::ptr_eq(b, bo)) {
                self.names.remove(&name);
            }
        }

        if let Some(mapping) = bo.take_mapping() {
            transport.bo_unmap(mapping);
        }
        if let (Some(range), Some(space)) = (bo.va(), self.va.as_mut()) {
            if let Err(err) = space.free(range) {
                log::warn!("{:?}: freeing GPU range failed: {}", handle, err);
            }
        }

        transport.bo_close(handle);
        self.stats.destroyed += 1;
    }
}

// =============================================================================
// DEVICE
// =============================================================================

struct DeviceInner<T: Transport> {
    transport: T,
    owned: bool,
    config: DeviceConfig,
    state: Mutex<DeviceState>,
}

impl<T: Transport> Drop for DeviceInner<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut();

        for bo in state.cache.evict_all() {
            state.kill(&self.transport, &bo);
        }
        for bo in core::mem::take(&mut state.zombies) {
            state.kill(&self.transport, &bo);
        }
        state.handles.clear();
        state.names.clear();

        if self.owned {
            self.transport.close();
        }
        log::info!("device closed ({} buffers destroyed)", state.stats.destroyed);
    }
}

/// An open GPU device
///
/// Cheap to clone; the device is torn down when the last clone and the last
/// buffer object referring to it are gone. Teardown destroys every cached
/// and zombie buffer and, for devices from [`Device::open_owned`], closes
/// the transport.
pub struct Device<T: Transport> {
    inner: Arc<DeviceInner<T>>,
}

impl<T: Transport> Device<T> {
    /// Wrap `transport`; the caller keeps ownership of the underlying file
    pub fn open(transport: T) -> Self {
        Self::build(transport, false, DeviceConfig::default())
    }

    /// Open a private duplicate of `transport`, closed at teardown
    pub fn open_owned(transport: &T) -> Result<Self> {
        let dup = transport.duplicate().map_err(|errno| {
            log::error!("duplicating transport failed: {}", errno);
            Error::Transport(errno)
        })?;
        Ok(Self::build(dup, true, DeviceConfig::default()))
    }

    /// Wrap `transport` with a custom configuration
    pub fn with_config(transport: T, config: DeviceConfig) -> Self {
        Self::build(transport, false, config)
    }

    fn build(transport: T, owned: bool, config: DeviceConfig) -> Self {
        let va = match transport.query_param(0, GpuParam::SoftpinStartAddr) {
            Ok(start) => match AddressSpace::softpin(start) {
                Ok(space) => Some(space),
                Err(err) => {
                    log::warn!("ignoring softpin start 0x{:x}: {}", start, err);
                    None
                }
            },
            Err(_) => None,
        };
        log::info!("device opened (softpin: {}, reuse: {})", va.is_some(), config.bo_reuse);

        let state = DeviceState {
            handles: HashMap::new(),
            names: HashMap::new(),
            cache: BoCache::new(config.cache_max_size),
            va,
            zombies: Vec::new(),
            stats: DeviceStats::default(),
        };

        Self {
            inner: Arc::new(DeviceInner {
                transport,
                owned,
                config,
                state: Mutex::new(state),
            }),
        }
    }

    /// Underlying transport
    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Active configuration
    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    /// Whether buffers carry user-assigned GPU addresses
    pub fn uses_softpin(&self) -> bool {
        self.inner.state.lock().va.is_some()
    }

    /// Whether this device closes its transport at teardown
    pub fn is_owned(&self) -> bool {
        self.inner.owned
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> DeviceStats {
        self.inner.state.lock().stats
    }

    /// Number of buffers parked in the cache
    pub fn cached_count(&self) -> usize {
        self.inner.state.lock().cache.len()
    }

    /// Number of buffers waiting for the GPU before they can be destroyed
    pub fn zombie_count(&self) -> usize {
        self.inner.state.lock().zombies.len()
    }

    /// Whether two handles refer to the same device
    pub fn same_device(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Buffer registered under kernel handle `handle`
    pub fn lookup_handle(&self, handle: BoHandle) -> Option<Bo<T>> {
        let mut state = self.inner.state.lock();
        let bo = state.handles.get(&handle).cloned()?;
        state.acquire(&bo);
        drop(state);
        Some(Bo::from_parts(bo, self.clone()))
    }

    /// Buffer registered under global name `name`
    pub fn lookup_name(&self, name: GlobalName) -> Option<Bo<T>> {
        let mut state = self.inner.state.lock();
        let bo = state.names.get(&name).cloned()?;
        state.acquire(&bo);
        drop(state);
        Some(Bo::from_parts(bo, self.clone()))
    }

    // =========================================================================
    // Buffer object plumbing
    // =========================================================================

    pub(crate) fn allocate(&self, mut size: u64, flags: BoFlags) -> Result<Bo<T>> {
        let inner = &*self.inner;

        {
            let mut state = inner.state.lock();
            if inner.config.bo_reuse {
                if let Some(bucket) = state.cache.bucket_size(size) {
                    size = bucket;
                    let transport = &inner.transport;
                    if let Some(bo) = state.cache.take(size, flags, |bo| poll_idle(transport, bo)) {
                        bo.reset_refcount();
                        state.stats.cache_hits += 1;
                        drop(state);
                        log::debug!("reusing cached {:?} ({} bytes)", bo.handle(), size);
                        return Ok(Bo::from_parts(bo, self.clone()));
                    }
                }
            }
            state.reap_zombies(&inner.transport);
        }

        let handle = inner.transport.bo_new(size, flags).map_err(|errno| {
            log::error!("allocating {} bytes failed: {}", size, errno);
            Error::AllocationFailed(errno)
        })?;

        let mut state = inner.state.lock();
        let va = match state.va.as_mut().map(|space| space.allocate(size, PAGE_SIZE)) {
            Some(Ok(range)) => Some(range),
            Some(Err(err)) => {
                drop(state);
                log::error!("no GPU address left for {} bytes", size);
                inner.transport.bo_close(handle);
                return Err(err);
            }
            None => None,
        };

        let bo = Arc::new(BoInner::new(handle, size, flags, va, true));
        state.handles.insert(handle, Arc::clone(&bo));
        state.stats.kernel_allocs += 1;
        drop(state);

        Ok(Bo::from_parts(bo, self.clone()))
    }

    pub(crate) fn import_name(&self, name: GlobalName) -> Result<Bo<T>> {
        if let Some(bo) = self.lookup_name(name) {
            return Ok(bo);
        }

        let (handle, size) = self.inner.transport.bo_open_name(name).map_err(|errno| {
            log::error!("opening {:?} failed: {}", name, errno);
            Error::ImportFailed(errno)
        })?;
        self.register_import(handle, size, Some(name))
    }

    pub(crate) fn import_descriptor(&self, descriptor: Descriptor) -> Result<Bo<T>> {
        let (handle, size) = self.inner.transport.bo_import(descriptor).map_err(|errno| {
            log::error!("importing {:?} failed: {}", descriptor, errno);
            Error::ImportFailed(errno)
        })?;
        self.register_import(handle, size, None)
    }

    /// Register a handle the kernel returned for an import, unless another
    /// thread got there first
    fn register_import(
        &self,
        handle: BoHandle,
        size: u64,
        name: Option<GlobalName>,
    ) -> Result<Bo<T>> {
        let inner = &*self.inner;
        let mut state = inner.state.lock();

        let existing = name
            .and_then(|n| state.names.get(&n).cloned())
            .or_else(|| state.handles.get(&handle).cloned());
        if let Some(bo) = existing {
            if bo.handle() != handle {
                inner.transport.bo_close(handle);
            }
            state.acquire(&bo);
            if let Some(name) = name {
                bo.set_global_name(name);
                state.names.insert(name, Arc::clone(&bo));
            }
            drop(state);
            return Ok(Bo::from_parts(bo, self.clone()));
        }

        let va = match state.va.as_mut().map(|space| space.allocate(size, PAGE_SIZE)) {
            Some(Ok(range)) => Some(range),
            Some(Err(err)) => {
                drop(state);
                inner.transport.bo_close(handle);
                return Err(Error::ImportFailed(err.errno().unwrap_or(Errno::ENOSPC)));
            }
            None => None,
        };

        let bo = Arc::new(BoInner::new(handle, size, BoFlags::empty(), va, false));
        if let Some(name) = name {
            bo.set_global_name(name);
            state.names.insert(name, Arc::clone(&bo));
        }
        state.handles.insert(handle, Arc::clone(&bo));
        state.stats.imports += 1;
        drop(state);

        Ok(Bo::from_parts(bo, self.clone()))
    }

    pub(crate) fn register_name(&self, bo: &Arc<BoInner>, name: GlobalName) {
        let mut state = self.inner.state.lock();
        bo.set_global_name(name);
        bo.disable_reuse();
        state.names.insert(name, Arc::clone(bo));
    }

    pub(crate) fn poll_idle(&self, bo: &BoInner) -> bool {
        poll_idle(&self.inner.transport, bo)
    }

    pub(crate) fn with_link<R>(
        &self,
        bo: &BoInner,
        f: impl FnOnce(&mut Option<StreamLink>) -> R,
    ) -> R {
        let _state = self.inner.state.lock();
        let mut link = bo.link().lock();
        f(&mut link)
    }

    /// Drop a reference that may be the last one
    pub(crate) fn release(&self, bo: &Arc<BoInner>) {
        let inner = &*self.inner;
        let mut state = inner.state.lock();
        if bo.release() != 1 {
            return;
        }
        state.release_final(&inner.transport, &inner.config, bo);
    }
}

impl<T: Transport> Clone for Device<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> fmt::Debug for Device<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("owned", &self.inner.owned)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use super::*;
    use cinder_core::GpuAddr;
    use cinder_test_framework::MockTransport;

    #[test]
    fn test_identity_across_lookup_paths() {
        let mock = MockTransport::new();
        let dev = Device::open(mock.clone());
        let bo = Bo::new(&dev, 4096, BoFlags::WC).unwrap();

        let by_handle = dev.lookup_handle(bo.handle()).unwrap();
        assert_eq!(by_handle, bo);
        assert_eq!(bo.refcount(), 2);

        let fd = bo.descriptor().unwrap();
        let by_fd = Bo::from_descriptor(&dev, fd).unwrap();
        assert_eq!(by_fd, bo);
        assert_eq!(bo.refcount(), 3);

        let name = bo.name().unwrap();
        let by_name = Bo::from_name(&dev, name).unwrap();
        assert_eq!(by_name, bo);
        assert_eq!(mock.counts().bo_open_name, 0);
    }

    #[test]
    fn test_foreign_name_imported_once() {
        let mock = MockTransport::new();
        let dev = Device::open(mock.clone());
        let name = mock.create_foreign(8192);

        let a = Bo::from_name(&dev, name).unwrap();
        let b = Bo::from_name(&dev, name).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.size(), 8192);
        assert_eq!(mock.counts().bo_open_name, 1);
        assert_eq!(dev.stats().imports, 1);

        drop(a);
        drop(b);
        // Imported buffers never enter the cache.
        assert_eq!(dev.cached_count(), 0);
        assert_eq!(mock.open_handles(), 0);
    }

    #[test]
    fn test_concurrent_imports_share_one_object() {
        const THREADS: usize = 8;
        let mock = MockTransport::new();
        let dev = Device::open(mock.clone());

        for _ in 0..10 {
            let name = mock.create_foreign(8192);
            let barrier = Barrier::new(THREADS);

            let bos: Vec<Bo<MockTransport>> = thread::scope(|s| {
                let workers: Vec<_> = (0..THREADS)
                    .map(|_| {
                        s.spawn(|| {
                            barrier.wait();
                            Bo::from_name(&dev, name).unwrap()
                        })
                    })
                    .collect();
                workers.into_iter().map(|w| w.join().unwrap()).collect()
            });

            assert!(bos.iter().all(|bo| *bo == bos[0]));
            assert_eq!(bos[0].refcount(), THREADS as u32);
            assert_eq!(mock.open_handles(), 1);
            assert_eq!(dev.lookup_name(name).as_ref(), Some(&bos[0]));

            drop(bos);
            assert_eq!(mock.open_handles(), 0);
        }
        assert_eq!(dev.stats().imports, 10);
    }

    #[test]
    fn test_import_failure() {
        let mock = MockTransport::new();
        let dev = Device::open(mock.clone());
        assert_eq!(
            Bo::from_name(&dev, GlobalName::new(77)).err(),
            Some(Error::ImportFailed(Errno::ENOENT))
        );
        mock.fail_next_import(Errno::EIO);
        let fd = mock.create_foreign_descriptor(4096);
        assert_eq!(
            Bo::from_descriptor(&dev, fd).err(),
            Some(Error::ImportFailed(Errno::EIO))
        );
        assert_eq!(mock.open_handles(), 0);
    }

    #[test]
    fn test_reuse_round_trip() {
        let mock = MockTransport::new();
        let dev = Device::open(mock.clone());

        let first: Vec<_> = (0..8)
            .map(|_| Bo::new(&dev, 3 * 4096, BoFlags::WC).unwrap())
            .collect();
        let mut handles: Vec<_> = first.iter().map(Bo::handle).collect();
        drop(first);
        assert_eq!(dev.cached_count(), 8);
        assert_eq!(mock.counts().bo_new, 8);

        let second: Vec<_> = (0..8)
            .map(|_| Bo::new(&dev, 3 * 4096, BoFlags::WC).unwrap())
            .collect();
        let mut again: Vec<_> = second.iter().map(Bo::handle).collect();
        handles.sort();
        again.sort();
        assert_eq!(handles, again);
        assert_eq!(mock.counts().bo_new, 8);
        assert_eq!(dev.stats().cache_hits, 8);
        assert!(second.iter().all(|bo| bo.refcount() == 1));
    }

    #[test]
    fn test_busy_cached_buffer_not_reused() {
        let mock = MockTransport::new();
        let dev = Device::open(mock.clone());
        let bo = Bo::new(&dev, 4096, BoFlags::WC).unwrap();
        let handle = bo.handle();
        drop(bo);

        mock.set_busy(handle, true);
        let fresh = Bo::new(&dev, 4096, BoFlags::WC).unwrap();
        assert_ne!(fresh.handle(), handle);
        assert_eq!(mock.counts().bo_new, 2);

        mock.set_busy(handle, false);
        let reused = Bo::new(&dev, 4096, BoFlags::WC).unwrap();
        assert_eq!(reused.handle(), handle);
    }

    #[test]
    fn test_flags_must_match() {
        let mock = MockTransport::new();
        let dev = Device::open(mock.clone());
        drop(Bo::new(&dev, 4096, BoFlags::WC).unwrap());
        let other = Bo::new(&dev, 4096, BoFlags::CACHED).unwrap();
        assert_eq!(mock.counts().bo_new, 2);
        assert_eq!(mock.flags_of(other.handle()), Some(BoFlags::CACHED));
    }

    #[test]
    fn test_bucket_rounding() {
        let mock = MockTransport::new();
        let dev = Device::open(mock.clone());
        let bo = Bo::new(&dev, 17 * 1024, BoFlags::WC).unwrap();
        assert_eq!(bo.size(), 20 * 1024);

        let plain = Device::with_config(mock.clone(), DeviceConfig::without_reuse());
        let bo = Bo::new(&plain, 17 * 1024, BoFlags::WC).unwrap();
        assert_eq!(bo.size(), 20 * 1024);
        let bo = Bo::new(&plain, 18 * 1024, BoFlags::WC).unwrap();
        assert_eq!(bo.size(), 20 * 1024);
        let bo = Bo::new(&plain, 21 * 1024, BoFlags::WC).unwrap();
        assert_eq!(bo.size(), 24 * 1024);
    }

    #[test]
    fn test_oversized_buffers_bypass_cache() {
        let mock = MockTransport::new();
        let config = DeviceConfig {
            cache_max_size: 64 * 1024,
            ..DeviceConfig::new()
        };
        let dev = Device::with_config(mock.clone(), config);

        let big = Bo::new(&dev, 200 * 1024, BoFlags::WC).unwrap();
        assert_eq!(big.size(), 200 * 1024);
        let handle = big.handle();
        drop(big);
        assert!(!mock.is_open(handle));
        assert_eq!(dev.cached_count(), 0);
        assert_eq!(dev.stats().destroyed, 1);
    }

    #[test]
    fn test_release_to_cache_once() {
        let mock = MockTransport::new();
        let dev = Device::open(mock.clone());
        let bo = Bo::new(&dev, 4096, BoFlags::WC).unwrap();
        let clones: Vec<_> = (0..16).map(|_| bo.clone()).collect();
        drop(clones);
        assert_eq!(dev.stats().cache_inserts, 0);
        drop(bo);
        assert_eq!(dev.stats().cache_inserts, 1);
        assert_eq!(dev.cached_count(), 1);
    }

    #[test]
    fn test_lookup_rescues_cached_buffer() {
        let mock = MockTransport::new();
        let dev = Device::open(mock.clone());
        let bo = Bo::new(&dev, 4096, BoFlags::WC).unwrap();
        let handle = bo.handle();
        drop(bo);
        assert_eq!(dev.cached_count(), 1);

        let found = dev.lookup_handle(handle).unwrap();
        assert_eq!(found.refcount(), 1);
        assert_eq!(dev.cached_count(), 0);
        drop(found);
        assert_eq!(dev.cached_count(), 1);
    }

    #[test]
    fn test_release_evicts_expired_buffers() {
        let mock = MockTransport::new();
        let config = DeviceConfig {
            cache_grace: Duration::from_millis(1),
            ..DeviceConfig::new()
        };
        let dev = Device::with_config(mock.clone(), config);

        let a = Bo::new(&dev, 4096, BoFlags::WC).unwrap();
        let old = a.handle();
        drop(a);
        assert_eq!(dev.cached_count(), 1);
        assert_eq!(dev.stats().evictions, 0);

        thread::sleep(Duration::from_millis(20));

        let b = Bo::new(&dev, 8192, BoFlags::WC).unwrap();
        let fresh = b.handle();
        drop(b);

        assert!(!mock.is_open(old));
        assert!(mock.is_open(fresh));
        assert_eq!(dev.cached_count(), 1);
        assert_eq!(dev.stats().evictions, 1);
        assert_eq!(dev.stats().destroyed, 1);
    }

    #[test]
    fn test_no_reuse_config_closes_on_release() {
        let mock = MockTransport::new();
        let dev = Device::with_config(mock.clone(), DeviceConfig::without_reuse());
        drop(Bo::new(&dev, 4096, BoFlags::WC).unwrap());
        drop(Bo::new(&dev, 4096, BoFlags::WC).unwrap());
        assert_eq!(mock.counts().bo_new, 2);
        assert_eq!(mock.counts().bo_close, 2);
        assert_eq!(dev.cached_count(), 0);
    }

    #[test]
    fn test_teardown_evicts_everything() {
        let mock = MockTransport::new();
        let dev = Device::open(mock.clone());
        for size in [4096, 8192, 65536] {
            drop(Bo::new(&dev, size, BoFlags::WC).unwrap());
        }
        assert_eq!(mock.open_handles(), 3);
        drop(dev);
        assert_eq!(mock.open_handles(), 0);
        // Not owned: the caller's transport stays open.
        assert!(!mock.is_closed());
    }

    #[test]
    fn test_buffers_keep_device_alive() {
        let mock = MockTransport::new();
        let dev = Device::open(mock.clone());
        let bo = Bo::new(&dev, 4096, BoFlags::WC).unwrap();
        drop(dev);
        assert_eq!(mock.open_handles(), 1);
        assert!(bo.map().is_ok());
        drop(bo);
        assert_eq!(mock.open_handles(), 0);
    }

    #[test]
    fn test_owned_device_closes_duplicate() {
        let mock = MockTransport::new();
        let dev = Device::open_owned(&mock).unwrap();
        assert!(dev.is_owned());
        assert_eq!(mock.counts().duplicate, 1);
        drop(dev);
        assert_eq!(mock.counts().close, 1);
        assert!(!mock.is_closed());
    }

    #[test]
    fn test_softpin_assigns_addresses() {
        let mock = MockTransport::with_softpin(0x1000_0000);
        let dev = Device::open(mock.clone());
        assert!(dev.uses_softpin());

        let a = Bo::new(&dev, 4096, BoFlags::WC).unwrap();
        let b = Bo::new(&dev, 4096, BoFlags::WC).unwrap();
        assert_eq!(a.gpu_addr(), Some(GpuAddr::new(0x1000_0000)));
        assert_eq!(b.gpu_addr(), Some(GpuAddr::new(0x1000_1000)));
    }

    #[test]
    fn test_zombie_reaped_and_address_reused() {
        let mock = MockTransport::with_softpin(0x1000_0000);
        let dev = Device::with_config(mock.clone(), DeviceConfig::without_reuse());

        let bo = Bo::new(&dev, 4096, BoFlags::WC).unwrap();
        let addr = bo.gpu_addr();
        let handle = bo.handle();
        mock.set_busy(handle, true);
        drop(bo);

        assert_eq!(dev.zombie_count(), 1);
        assert!(mock.is_open(handle));

        // Still busy: the next allocation must not take its address.
        let other = Bo::new(&dev, 4096, BoFlags::WC).unwrap();
        assert_ne!(other.gpu_addr(), addr);
        assert_eq!(dev.zombie_count(), 1);

        mock.set_busy(handle, false);
        let again = Bo::new(&dev, 4096, BoFlags::WC).unwrap();
        assert_eq!(dev.zombie_count(), 0);
        assert!(!mock.is_open(handle));
        assert_eq!(again.gpu_addr(), addr);
        assert_eq!(dev.stats().zombies, 1);
    }

    #[test]
    fn test_lookup_revives_zombie() {
        let mock = MockTransport::with_softpin(0x1000_0000);
        let dev = Device::with_config(mock.clone(), DeviceConfig::without_reuse());

        let bo = Bo::new(&dev, 4096, BoFlags::WC).unwrap();
        let addr = bo.gpu_addr();
        let handle = bo.handle();
        mock.set_busy(handle, true);
        drop(bo);
        assert_eq!(dev.zombie_count(), 1);

        let revived = dev.lookup_handle(handle).unwrap();
        assert_eq!(dev.zombie_count(), 0);
        assert_eq!(revived.gpu_addr(), addr);
        assert_eq!(revived.refcount(), 1);
        assert!(mock.is_open(handle));

        drop(revived);
        assert_eq!(dev.zombie_count(), 1);
        assert_eq!(dev.stats().zombies, 2);
        assert!(mock.is_open(handle));
    }

    #[test]
    fn test_address_exhaustion_closes_handle() {
        let mock = MockTransport::with_softpin(0xffff_e000);
        let dev = Device::with_config(mock.clone(), DeviceConfig::without_reuse());
        let a = Bo::new(&dev, 8192, BoFlags::WC).unwrap();
        assert_eq!(
            Bo::new(&dev, 4096, BoFlags::WC).err(),
            Some(Error::AllocationFailed(Errno::ENOSPC))
        );
        assert_eq!(mock.open_handles(), 1);
        drop(a);
    }
}
