//! # CINDER Core Types
//!
//! Strong types for the identifiers the kernel hands out.
//!
//! Kernel handles, global names and descriptors are all small integers on the
//! wire. Wrapping them keeps a global name from being passed where a handle
//! is expected.

use core::fmt;
use core::ops::Add;
use core::sync::atomic::{AtomicU32, Ordering};

// =============================================================================
// SIZES
// =============================================================================

/// Granularity of every buffer allocation, in bytes
pub const PAGE_SIZE: u64 = 4096;

/// Round `size` up to a multiple of `alignment` (a power of two)
///
/// Returns `None` when the result does not fit in a `u64`.
#[inline]
pub const fn align_up(size: u64, alignment: u64) -> Option<u64> {
    let mask = alignment - 1;
    match size.checked_add(mask) {
        Some(sum) => Some(sum & !mask),
        None => None,
    }
}

/// Round `size` up to whole pages
#[inline]
pub const fn page_align(size: u64) -> Option<u64> {
    align_up(size, PAGE_SIZE)
}

// =============================================================================
// GPU ADDRESS
// =============================================================================

/// GPU Virtual Address
///
/// An address in the GPU's virtual address space, only meaningful on
/// devices where userspace assigns addresses (softpin).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct GpuAddr(u64);

impl GpuAddr {
    /// Create a new GPU address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl Add<u64> for GpuAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        self.offset(rhs)
    }
}

impl fmt::Debug for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuAddr(0x{:08x})", self.0)
    }
}

impl fmt::Display for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

// =============================================================================
// KERNEL IDENTIFIERS
// =============================================================================

/// Per-file kernel handle of a buffer object
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct BoHandle(u32);

impl BoHandle {
    /// Wrap a raw kernel handle
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw kernel handle
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for BoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BoHandle({})", self.0)
    }
}

/// Device-global name under which a buffer can be opened by other clients
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct GlobalName(u32);

impl GlobalName {
    /// Wrap a raw global name
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw global name
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for GlobalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalName({})", self.0)
    }
}

/// Transferable descriptor (a dma-buf or sync-file descriptor)
///
/// The value is owned by whoever received it from the transport; this crate
/// never closes descriptors it is handed.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Descriptor(i32);

impl Descriptor {
    /// Wrap a raw descriptor
    #[inline]
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    /// Get the raw descriptor
    #[inline]
    pub const fn raw(self) -> i32 {
        self.0
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Descriptor({})", self.0)
    }
}

// =============================================================================
// STREAM ID
// =============================================================================

static NEXT_STREAM_ID: AtomicU32 = AtomicU32::new(1);

/// Process-unique identity of a command stream
///
/// Buffer objects remember the stream they were last referenced from by id,
/// never by pointer, so a dropped stream cannot leave a dangling link.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct StreamId(u32);

impl StreamId {
    /// Allocate a fresh id
    pub fn next() -> Self {
        Self(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw id
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_align() {
        assert_eq!(page_align(1), Some(PAGE_SIZE));
        assert_eq!(page_align(PAGE_SIZE), Some(PAGE_SIZE));
        assert_eq!(page_align(PAGE_SIZE + 1), Some(2 * PAGE_SIZE));
        assert_eq!(page_align(0), Some(0));
        assert_eq!(page_align(u64::MAX - 10), None);
        assert_eq!(align_up(u64::MAX - PAGE_SIZE + 1, PAGE_SIZE), Some(u64::MAX - PAGE_SIZE + 1));
    }

    #[test]
    fn test_stream_ids_unique() {
        let a = StreamId::next();
        let b = StreamId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_gpu_addr_offset() {
        let addr = GpuAddr::new(0x1000);
        assert_eq!((addr + 0x20).raw(), 0x1020);
        assert!(GpuAddr::default().is_null());
    }
}
