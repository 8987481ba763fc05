//! # Submission Layout
//!
//! The tables a command stream hands to the kernel. Layouts match the kernel
//! ABI byte for byte; sizes are checked at compile time.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

use crate::flags::{PerfFlags, SubmitBoFlags, SubmitFlags};
use crate::param::PipeId;
use crate::sync::Timestamp;
use crate::types::{BoHandle, Descriptor, GpuAddr};

// =============================================================================
// BUFFER TABLE ENTRY
// =============================================================================

/// A buffer referenced by a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct SubmitBo {
    /// Access flags (`SubmitBoFlags` bits)
    pub flags: u32,
    /// Kernel handle
    pub handle: u32,
    /// User-assigned GPU address (softpin only)
    pub presumed: u64,
}

impl SubmitBo {
    /// New entry with no access recorded yet
    pub const fn new(handle: BoHandle, presumed: GpuAddr) -> Self {
        Self {
            flags: 0,
            handle: handle.raw(),
            presumed: presumed.raw(),
        }
    }

    /// Access flags accumulated so far
    pub fn access(&self) -> SubmitBoFlags {
        SubmitBoFlags::from_bits_truncate(self.flags)
    }

    /// OR more access flags into the entry
    pub fn add_access(&mut self, access: SubmitBoFlags) {
        self.flags |= access.bits();
    }

    /// Kernel handle
    pub const fn handle(&self) -> BoHandle {
        BoHandle::new(self.handle)
    }
}

// =============================================================================
// RELOCATION
// =============================================================================

/// Patch request: write the GPU address of `reloc_idx` + `reloc_offset` at
/// byte `submit_offset` of the command stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct SubmitReloc {
    /// Byte offset inside the command stream
    pub submit_offset: u32,
    /// Index into the buffer table
    pub reloc_idx: u32,
    /// Byte offset inside the target buffer
    pub reloc_offset: u64,
    /// Reserved, zero
    pub flags: u32,
    _pad: u32,
}

impl SubmitReloc {
    /// Build a relocation entry
    pub const fn new(submit_offset: u32, reloc_idx: u32, reloc_offset: u64) -> Self {
        Self {
            submit_offset,
            reloc_idx,
            reloc_offset,
            flags: 0,
            _pad: 0,
        }
    }
}

// =============================================================================
// PERFORMANCE MONITOR REQUEST
// =============================================================================

/// Performance-counter sample written into a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct SubmitPmr {
    /// `PerfFlags` bits
    pub flags: u32,
    /// Perf domain id
    pub domain: u8,
    _pad: u8,
    /// Signal id inside the domain
    pub signal: u16,
    /// Caller-chosen sequence number
    pub sequence: u32,
    /// Byte offset of the sample inside the target buffer
    pub read_offset: u32,
    /// Index into the buffer table
    pub read_idx: u32,
}

impl SubmitPmr {
    /// Build a perf request entry
    pub const fn new(
        flags: PerfFlags,
        domain: u8,
        signal: u16,
        sequence: u32,
        read_offset: u32,
        read_idx: u32,
    ) -> Self {
        Self {
            flags: flags.bits(),
            domain,
            _pad: 0,
            signal,
            sequence,
            read_offset,
            read_idx,
        }
    }
}

const_assert_eq!(core::mem::size_of::<SubmitBo>(), 16);
const_assert_eq!(core::mem::size_of::<SubmitReloc>(), 24);
const_assert_eq!(core::mem::size_of::<SubmitPmr>(), 20);

// =============================================================================
// REQUEST / RESPONSE
// =============================================================================

/// Everything the kernel needs for one submission
#[derive(Debug, Clone, Copy)]
pub struct SubmitRequest<'a> {
    /// GPU core index
    pub core: u32,
    /// Pipe the stream executes on
    pub pipe: PipeId,
    /// Submission flags
    pub flags: SubmitFlags,
    /// Referenced buffers
    pub bos: &'a [SubmitBo],
    /// Relocations
    pub relocs: &'a [SubmitReloc],
    /// Performance-monitor requests
    pub pmrs: &'a [SubmitPmr],
    /// Command words, trimmed to the write cursor
    pub stream: &'a [u32],
    /// Fence to wait on before execution
    pub in_fence: Option<Descriptor>,
}

impl SubmitRequest<'_> {
    /// Command stream as raw bytes
    pub fn stream_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(self.stream)
    }

    /// Buffer table as raw bytes
    pub fn bos_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(self.bos)
    }

    /// Relocation table as raw bytes
    pub fn relocs_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(self.relocs)
    }

    /// Perf table as raw bytes
    pub fn pmrs_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(self.pmrs)
    }
}

/// Result of a successful submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitResponse {
    /// Completion fence
    pub fence: Timestamp,
    /// Sync-file descriptor, when requested with `FENCE_FD_OUT`
    pub out_fence: Option<Descriptor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bo_access_accumulates() {
        let mut bo = SubmitBo::new(BoHandle::new(7), GpuAddr::default());
        assert!(bo.access().is_empty());
        bo.add_access(SubmitBoFlags::READ);
        bo.add_access(SubmitBoFlags::WRITE);
        assert_eq!(bo.access(), SubmitBoFlags::READ | SubmitBoFlags::WRITE);
        assert_eq!(bo.handle(), BoHandle::new(7));
    }

    #[test]
    fn test_table_byte_views() {
        let words = [0x0403_0201u32, 0x0807_0605];
        let req = SubmitRequest {
            core: 0,
            pipe: PipeId::ThreeD,
            flags: SubmitFlags::empty(),
            bos: &[],
            relocs: &[],
            pmrs: &[],
            stream: &words,
            in_fence: None,
        };
        assert_eq!(req.stream_bytes().len(), 8);
        assert_eq!(req.relocs_bytes().len(), 0);
    }
}
