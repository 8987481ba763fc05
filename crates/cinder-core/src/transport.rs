//! # Kernel Transport
//!
//! The contract between CINDER and the kernel driver.
//!
//! Every method is a blocking call that either succeeds or reports an
//! [`Errno`]. Implementations wrap an open device file; tests use the fake
//! kernel from `cinder-test-framework`. Nothing above this trait issues
//! system calls directly.
//!
//! The buffer manager never calls [`Transport::bo_new`],
//! [`Transport::bo_open_name`], [`Transport::bo_import`],
//! [`Transport::submit`] or [`Transport::wait_fence`] with its device lock
//! held. Non-blocking polls (`bo_cpu_prep` with `NOSYNC`) and
//! [`Transport::bo_close`] may be issued under the lock.

use alloc::string::String;
use core::ptr::NonNull;
use core::time::Duration;

use crate::error::Errno;
use crate::flags::{BoFlags, CpuPrepOp};
use crate::param::GpuParam;
use crate::submit::{SubmitRequest, SubmitResponse};
use crate::sync::Timestamp;
use crate::types::{BoHandle, Descriptor, GlobalName};

/// Result of a raw transport call
pub type TransportResult<T> = core::result::Result<T, Errno>;

// =============================================================================
// MAPPING
// =============================================================================

/// A buffer mapped into the process address space
#[derive(Debug, PartialEq, Eq)]
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

impl Mapping {
    /// Record a mapping established by the transport
    pub const fn new(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Start of the mapping
    #[inline]
    pub const fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Length of the mapping in bytes
    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// SAFETY: a mapping is plain process memory; synchronising access to its
// contents is the caller's job (cpu_prep / cpu_fini).
unsafe impl Send for Mapping {}
// SAFETY: see above, the handle itself is immutable.
unsafe impl Sync for Mapping {}

// =============================================================================
// PERF MONITOR DESCRIPTORS
// =============================================================================

/// Iterator end marker for perf domains
pub const PERF_DOMAIN_END: u8 = 0xff;
/// Iterator end marker for perf signals
pub const PERF_SIGNAL_END: u16 = 0xffff;

/// One perf domain as reported by the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerfDomainDesc {
    /// Domain id
    pub id: u8,
    /// Number of signals in the domain
    pub nr_signals: u16,
    /// Human-readable name
    pub name: String,
    /// Iterator value for the next domain, `PERF_DOMAIN_END` when done
    pub next: u8,
}

/// One perf signal as reported by the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerfSignalDesc {
    /// Signal id inside its domain
    pub id: u16,
    /// Human-readable name
    pub name: String,
    /// Iterator value for the next signal, `PERF_SIGNAL_END` when done
    pub next: u16,
}

// =============================================================================
// TRANSPORT TRAIT
// =============================================================================

/// Blocking calls into the kernel driver
pub trait Transport: Send + Sync + 'static {
    /// Allocate a buffer of `size` bytes
    fn bo_new(&self, size: u64, flags: BoFlags) -> TransportResult<BoHandle>;

    /// Open a buffer by global name, returning its handle and size
    fn bo_open_name(&self, name: GlobalName) -> TransportResult<(BoHandle, u64)>;

    /// Import a buffer from a descriptor, returning its handle and size
    ///
    /// Importing an object that already has a handle in this file returns
    /// that same handle.
    fn bo_import(&self, descriptor: Descriptor) -> TransportResult<(BoHandle, u64)>;

    /// Close a buffer handle
    fn bo_close(&self, handle: BoHandle);

    /// Offset to pass to the mapping call
    fn bo_mmap_offset(&self, handle: BoHandle) -> TransportResult<u64>;

    /// Map `size` bytes of the buffer at `offset`
    fn bo_map(&self, handle: BoHandle, offset: u64, size: u64) -> TransportResult<Mapping>;

    /// Undo a mapping returned by [`Transport::bo_map`]
    fn bo_unmap(&self, mapping: Mapping);

    /// Publish the buffer under a global name
    fn bo_flink(&self, handle: BoHandle) -> TransportResult<GlobalName>;

    /// Export the buffer as a transferable descriptor
    fn bo_export(&self, handle: BoHandle) -> TransportResult<Descriptor>;

    /// Acquire CPU access, waiting up to `timeout` for the GPU
    ///
    /// With [`CpuPrepOp::NOSYNC`] the call never waits and reports
    /// `EBUSY` when the GPU still uses the buffer.
    fn bo_cpu_prep(&self, handle: BoHandle, op: CpuPrepOp, timeout: Duration)
        -> TransportResult<()>;

    /// Release CPU access
    fn bo_cpu_fini(&self, handle: BoHandle) -> TransportResult<()>;

    /// Query a parameter of GPU core `core`
    fn query_param(&self, core: u32, param: GpuParam) -> TransportResult<u64>;

    /// Submit a command stream
    fn submit(&self, request: &SubmitRequest<'_>) -> TransportResult<SubmitResponse>;

    /// Wait for `fence` on GPU core `core`; a zero timeout polls
    ///
    /// Reports `ETIMEDOUT` when the fence did not signal in time.
    fn wait_fence(&self, core: u32, fence: Timestamp, timeout: Duration) -> TransportResult<()>;

    /// Describe perf domain `iter` of a pipe
    fn perfmon_domain(&self, core: u32, pipe: u32, iter: u8) -> TransportResult<PerfDomainDesc>;

    /// Describe signal `iter` of a perf domain
    fn perfmon_signal(
        &self,
        core: u32,
        pipe: u32,
        domain: u8,
        iter: u16,
    ) -> TransportResult<PerfSignalDesc>;

    /// Open an independent transport on the same device (`dup`)
    fn duplicate(&self) -> TransportResult<Self>
    where
        Self: Sized;

    /// Close the transport
    fn close(&self);
}
