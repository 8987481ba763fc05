//! # Buffer Objects
//!
//! Reference-counted handles to kernel buffer objects.
//!
//! ## Lifetime
//!
//! ```text
//!            Bo::new / import
//!                  │
//!                  ▼
//!   ┌──────────► LIVE ◄───────────────┐
//!   │              │ last Bo dropped  │ lookup / import
//!   │   reusable?  ├──────────────► CACHED
//!   │              │                  │ evicted
//!   │   busy + VA? ├──────────────► ZOMBIE ──► destroyed once idle
//!   │              ▼
//!   │          destroyed (unmapped, handle closed, VA freed)
//!   └── cache hit (Bo::new)
//! ```
//!
//! Every buffer has exactly one canonical [`BoInner`], owned by its device's
//! registry. [`Bo`] is a counted reference to it; cloning a `Bo` takes a
//! reference and dropping the last one hands the buffer to the device,
//! which parks it in the cache or destroys it.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use cinder_core::{
    page_align, BoFlags, BoHandle, CpuPrepOp, Descriptor, Error, GlobalName, GpuAddr, Mapping,
    Result, StreamId, Transport,
};
use spin::Mutex;

use crate::address_space::VaRange;
use crate::device::Device;

// =============================================================================
// STREAM LINK
// =============================================================================

/// Where a buffer sits in the buffer table of the stream that last used it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLink {
    /// Stream that referenced the buffer
    pub stream: StreamId,
    /// Index in that stream's buffer table
    pub index: u32,
}

// =============================================================================
// CANONICAL BUFFER STATE
// =============================================================================

/// Canonical per-handle buffer state
///
/// Only reachable through a [`Bo`] or the owning device's registry.
pub struct BoInner {
    handle: BoHandle,
    size: u64,
    flags: BoFlags,
    va: Option<VaRange>,
    refcnt: AtomicU32,
    reuse: AtomicBool,
    /// Global name, 0 when never published
    name: AtomicU32,
    map: Mutex<Option<Mapping>>,
    /// Read and written with the device lock held
    link: Mutex<Option<StreamLink>>,
}

impl BoInner {
    pub(crate) fn new(
        handle: BoHandle,
        size: u64,
        flags: BoFlags,
        va: Option<VaRange>,
        reuse: bool,
    ) -> Self {
        Self {
            handle,
            size,
            flags,
            va,
            refcnt: AtomicU32::new(1),
            reuse: AtomicBool::new(reuse),
            name: AtomicU32::new(0),
            map: Mutex::new(None),
            link: Mutex::new(None),
        }
    }

    /// Kernel handle
    #[inline]
    pub fn handle(&self) -> BoHandle {
        self.handle
    }

    /// Size in bytes
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Allocation flags
    #[inline]
    pub fn flags(&self) -> BoFlags {
        self.flags
    }

    pub(crate) fn va(&self) -> Option<VaRange> {
        self.va
    }

    pub(crate) fn refcount(&self) -> u32 {
        self.refcnt.load(Ordering::Acquire)
    }

    /// Take a reference; returns the previous count
    pub(crate) fn acquire(&self) -> u32 {
        self.refcnt.fetch_add(1, Ordering::AcqRel)
    }

    /// Drop a reference; returns the previous count
    pub(crate) fn release(&self) -> u32 {
        self.refcnt.fetch_sub(1, Ordering::AcqRel)
    }

    pub(crate) fn reset_refcount(&self) {
        self.refcnt.store(1, Ordering::Release);
    }

    pub(crate) fn is_reusable(&self) -> bool {
        self.reuse.load(Ordering::Acquire)
    }

    pub(crate) fn disable_reuse(&self) {
        self.reuse.store(false, Ordering::Release);
    }

    pub(crate) fn global_name(&self) -> Option<GlobalName> {
        match self.name.load(Ordering::Acquire) {
            0 => None,
            raw => Some(GlobalName::new(raw)),
        }
    }

    pub(crate) fn set_global_name(&self, name: GlobalName) {
        self.name.store(name.raw(), Ordering::Release);
    }

    pub(crate) fn take_mapping(&self) -> Option<Mapping> {
        self.map.lock().take()
    }

    pub(crate) fn link(&self) -> &Mutex<Option<StreamLink>> {
        &self.link
    }
}

impl fmt::Debug for BoInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoInner")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("flags", &self.flags)
            .field("refcnt", &self.refcount())
            .finish()
    }
}

// =============================================================================
// BUFFER OBJECT HANDLE
// =============================================================================

/// Counted reference to a GPU buffer object
///
/// Two `Bo`s for the same kernel handle on the same device always refer to
/// the same canonical object and compare equal.
pub struct Bo<T: Transport> {
    inner: Arc<BoInner>,
    dev: Device<T>,
}

impl<T: Transport> Bo<T> {
    pub(crate) fn from_parts(inner: Arc<BoInner>, dev: Device<T>) -> Self {
        Self { inner, dev }
    }

    /// Allocate a buffer of at least `size` bytes
    ///
    /// The size is rounded up to whole pages (and to its cache bucket when
    /// reuse is enabled). An idle cached buffer with identical flags is
    /// handed out without a kernel call.
    pub fn new(dev: &Device<T>, size: u64, flags: BoFlags) -> Result<Self> {
        if size == 0 {
            log::error!("refusing zero-sized buffer allocation");
            return Err(Error::InvalidArgument);
        }
        let Some(size) = page_align(size) else {
            log::error!("buffer size {} overflows page rounding", size);
            return Err(Error::InvalidArgument);
        };
        dev.allocate(size, flags)
    }

    /// Open a buffer another client published under `name`
    pub fn from_name(dev: &Device<T>, name: GlobalName) -> Result<Self> {
        dev.import_name(name)
    }

    /// Import a buffer from a transferable descriptor
    pub fn from_descriptor(dev: &Device<T>, descriptor: Descriptor) -> Result<Self> {
        dev.import_descriptor(descriptor)
    }

    /// Kernel handle
    #[inline]
    pub fn handle(&self) -> BoHandle {
        self.inner.handle
    }

    /// Size in bytes
    #[inline]
    pub fn size(&self) -> u64 {
        self.inner.size
    }

    /// Allocation flags
    #[inline]
    pub fn flags(&self) -> BoFlags {
        self.inner.flags
    }

    /// GPU virtual address, on softpin devices
    #[inline]
    pub fn gpu_addr(&self) -> Option<GpuAddr> {
        self.inner.va.map(|va| va.start)
    }

    /// Current reference count
    pub fn refcount(&self) -> u32 {
        self.inner.refcount()
    }

    /// Owning device
    pub fn device(&self) -> &Device<T> {
        &self.dev
    }

    /// Map the buffer into the process
    ///
    /// The mapping is created on first use and kept until the buffer is
    /// destroyed; later calls return the same pointer.
    pub fn map(&self) -> Result<NonNull<u8>> {
        if let Some(mapping) = self.inner.map.lock().as_ref() {
            return Ok(mapping.ptr());
        }

        // The kernel calls may block; keep the lock released across them.
        let transport = self.dev.transport();
        let offset = transport
            .bo_mmap_offset(self.handle())
            .map_err(Error::MappingFailed)?;
        let mapping = transport
            .bo_map(self.handle(), offset, self.size())
            .map_err(Error::MappingFailed)?;

        let mut map = self.inner.map.lock();
        if let Some(existing) = map.as_ref() {
            let ptr = existing.ptr();
            drop(map);
            transport.bo_unmap(mapping);
            return Ok(ptr);
        }
        let ptr = mapping.ptr();
        *map = Some(mapping);
        Ok(ptr)
    }

    /// Acquire CPU access for `op`
    ///
    /// Waits up to the device's CPU-prepare timeout for the GPU. With
    /// [`CpuPrepOp::NOSYNC`] never waits and fails with [`Error::Busy`]
    /// while the GPU still uses the buffer.
    pub fn cpu_prep(&self, op: CpuPrepOp) -> Result<()> {
        self.dev
            .transport()
            .bo_cpu_prep(self.handle(), op, self.dev.config().cpu_prep_timeout)
            .map_err(Error::from_wait)
    }

    /// Release CPU access
    pub fn cpu_fini(&self) -> Result<()> {
        self.dev
            .transport()
            .bo_cpu_fini(self.handle())
            .map_err(Error::WaitFailed)
    }

    /// Whether the GPU is done with the buffer
    pub fn is_idle(&self) -> bool {
        self.dev.poll_idle(&self.inner)
    }

    /// Publish the buffer under a global name
    ///
    /// A published buffer is never returned to the cache.
    pub fn name(&self) -> Result<GlobalName> {
        if let Some(name) = self.inner.global_name() {
            return Ok(name);
        }
        let name = self
            .dev
            .transport()
            .bo_flink(self.handle())
            .map_err(Error::ExportFailed)?;
        self.dev.register_name(&self.inner, name);
        Ok(name)
    }

    /// Export the buffer as a transferable descriptor
    ///
    /// An exported buffer is never returned to the cache.
    pub fn descriptor(&self) -> Result<Descriptor> {
        let descriptor = self
            .dev
            .transport()
            .bo_export(self.handle())
            .map_err(Error::ExportFailed)?;
        self.inner.disable_reuse();
        Ok(descriptor)
    }

    /// Run `f` on the buffer's stream link with the device lock held
    pub fn with_stream_link<R>(&self, f: impl FnOnce(&mut Option<StreamLink>) -> R) -> R {
        self.dev.with_link(&self.inner, f)
    }

    /// Forget the stream link if it names `stream`
    pub fn clear_stream_link(&self, stream: StreamId) {
        self.with_stream_link(|link| {
            if link.is_some_and(|l| l.stream == stream) {
                *link = None;
            }
        });
    }
}

impl<T: Transport> Clone for Bo<T> {
    fn clone(&self) -> Self {
        self.inner.acquire();
        Self {
            inner: Arc::clone(&self.inner),
            dev: self.dev.clone(),
        }
    }
}

impl<T: Transport> Drop for Bo<T> {
    fn drop(&mut self) {
        // Not the last reference: no need for the device lock.
        let fast = self
            .inner
            .refcnt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                if c > 1 { Some(c - 1) } else { None }
            });
        if fast.is_ok() {
            return;
        }
        self.dev.release(&self.inner);
    }
}

impl<T: Transport> PartialEq for Bo<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Transport> Eq for Bo<T> {}

impl<T: Transport> fmt::Debug for Bo<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bo")
            .field("handle", &self.inner.handle)
            .field("size", &self.inner.size)
            .field("flags", &self.inner.flags)
            .field("gpu_addr", &self.gpu_addr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::{Errno, PAGE_SIZE};
    use cinder_test_framework::MockTransport;

    fn device() -> (MockTransport, Device<MockTransport>) {
        let mock = MockTransport::new();
        let dev = Device::open(mock.clone());
        (mock, dev)
    }

    #[test]
    fn test_zero_size_rejected() {
        let (mock, dev) = device();
        assert_eq!(Bo::new(&dev, 0, BoFlags::WC).err(), Some(Error::InvalidArgument));
        assert_eq!(mock.counts().bo_new, 0);
    }

    #[test]
    fn test_size_overflowing_page_rounding_rejected() {
        let (mock, dev) = device();
        assert_eq!(
            Bo::new(&dev, u64::MAX - 10, BoFlags::WC).err(),
            Some(Error::InvalidArgument)
        );
        assert_eq!(mock.counts().bo_new, 0);
    }

    #[test]
    fn test_size_rounded_to_pages() {
        let (_mock, dev) = device();
        let bo = Bo::new(&dev, 100, BoFlags::WC).unwrap();
        assert_eq!(bo.size(), PAGE_SIZE);
        assert_eq!(bo.refcount(), 1);
        assert!(bo.gpu_addr().is_none());
    }

    #[test]
    fn test_alloc_failure_leaves_nothing() {
        let (mock, dev) = device();
        mock.fail_next_alloc(Errno::ENOMEM);
        assert_eq!(
            Bo::new(&dev, 4096, BoFlags::WC).err(),
            Some(Error::AllocationFailed(Errno::ENOMEM))
        );
        assert_eq!(mock.open_handles(), 0);
        assert_eq!(dev.stats().kernel_allocs, 0);
    }

    #[test]
    fn test_clone_and_drop_count() {
        let (mock, dev) = device();
        let a = Bo::new(&dev, 4096, BoFlags::WC).unwrap();
        let b = a.clone();
        assert_eq!(a.refcount(), 2);
        assert_eq!(a, b);
        drop(b);
        assert_eq!(a.refcount(), 1);
        drop(a);
        // Parked in the cache, not closed.
        assert_eq!(mock.counts().bo_close, 0);
        assert_eq!(dev.stats().cache_inserts, 1);
    }

    #[test]
    fn test_map_is_idempotent() {
        let (mock, dev) = device();
        let bo = Bo::new(&dev, 4096, BoFlags::WC).unwrap();
        let p1 = bo.map().unwrap();
        let p2 = bo.map().unwrap();
        assert_eq!(p1, p2);
        assert_eq!(mock.counts().bo_map, 1);

        // SAFETY: the mapping covers the whole 4096-byte buffer.
        unsafe {
            p1.as_ptr().write(0xab);
            assert_eq!(p2.as_ptr().read(), 0xab);
        }
    }

    #[test]
    fn test_concurrent_map_keeps_one_mapping() {
        let (mock, dev) = device();
        let bo = Bo::new(&dev, 4096, BoFlags::WC).unwrap();

        let addrs: Vec<usize> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..4)
                .map(|_| s.spawn(|| bo.map().unwrap().as_ptr() as usize))
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert!(addrs.iter().all(|&a| a == addrs[0]));
        assert_eq!(bo.map().unwrap().as_ptr() as usize, addrs[0]);
        let counts = mock.counts();
        assert_eq!(counts.bo_map - counts.bo_unmap, 1);
    }

    #[test]
    fn test_map_failure() {
        let (mock, dev) = device();
        let bo = Bo::new(&dev, 4096, BoFlags::WC).unwrap();
        mock.fail_next_map(Errno::ENOMEM);
        assert_eq!(bo.map().err(), Some(Error::MappingFailed(Errno::ENOMEM)));
        assert!(bo.map().is_ok());
    }

    #[test]
    fn test_cpu_prep_nosync_busy() {
        let (mock, dev) = device();
        let bo = Bo::new(&dev, 4096, BoFlags::WC).unwrap();
        mock.set_busy(bo.handle(), true);
        assert!(!bo.is_idle());
        assert_eq!(
            bo.cpu_prep(CpuPrepOp::WRITE | CpuPrepOp::NOSYNC),
            Err(Error::Busy)
        );
        assert_eq!(bo.cpu_prep(CpuPrepOp::WRITE), Ok(()));
        assert_eq!(bo.cpu_fini(), Ok(()));
        assert!(bo.is_idle());
    }

    #[test]
    fn test_name_disables_reuse() {
        let (mock, dev) = device();
        let bo = Bo::new(&dev, 4096, BoFlags::WC).unwrap();
        let name = bo.name().unwrap();
        assert_eq!(bo.name().unwrap(), name);
        assert_eq!(mock.counts().bo_flink, 1);

        let found = dev.lookup_name(name).unwrap();
        assert_eq!(found, bo);
        drop(found);

        let handle = bo.handle();
        drop(bo);
        assert!(!mock.is_open(handle));
        assert_eq!(dev.stats().cache_inserts, 0);
    }

    #[test]
    fn test_descriptor_disables_reuse() {
        let (mock, dev) = device();
        let bo = Bo::new(&dev, 4096, BoFlags::WC).unwrap();
        bo.descriptor().unwrap();
        let handle = bo.handle();
        drop(bo);
        assert!(!mock.is_open(handle));
        assert_eq!(dev.stats().destroyed, 1);
        assert_eq!(dev.stats().cache_inserts, 0);
    }

    #[test]
    fn test_stream_link() {
        let (_mock, dev) = device();
        let bo = Bo::new(&dev, 4096, BoFlags::WC).unwrap();
        let stream = StreamId::next();
        let other = StreamId::next();

        bo.with_stream_link(|link| *link = Some(StreamLink { stream, index: 3 }));
        bo.clear_stream_link(other);
        assert_eq!(bo.with_stream_link(|link| *link), Some(StreamLink { stream, index: 3 }));
        bo.clear_stream_link(stream);
        assert_eq!(bo.with_stream_link(|link| *link), None);
    }
}
