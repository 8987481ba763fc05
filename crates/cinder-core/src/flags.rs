//! # Flag Sets
//!
//! Bit flags exchanged with the kernel. Values follow the kernel ABI so the
//! transport can pass them through unchanged.

bitflags::bitflags! {
    /// Buffer allocation flags
    ///
    /// Two buffers are interchangeable in the buffer cache only when their
    /// flags are identical.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BoFlags: u32 {
        /// CPU-cached mapping
        const CACHED = 0x0001_0000;
        /// Write-combined mapping
        const WC = 0x0002_0000;
        /// Uncached mapping
        const UNCACHED = 0x0004_0000;
        /// Force the buffer behind the GPU MMU
        const FORCE_MMU = 0x0010_0000;
        /// Mask of the mutually exclusive cache modes
        const CACHE_MASK = Self::CACHED.bits() | Self::WC.bits() | Self::UNCACHED.bits();
    }
}

bitflags::bitflags! {
    /// CPU access requested through `cpu_prep`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CpuPrepOp: u32 {
        /// CPU reads the buffer
        const READ = 0x01;
        /// CPU writes the buffer
        const WRITE = 0x02;
        /// Do not wait; report busy instead
        const NOSYNC = 0x04;
    }
}

bitflags::bitflags! {
    /// GPU access performed through a relocation or buffer reference
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RelocFlags: u32 {
        /// GPU reads the buffer
        const READ = 0x0001;
        /// GPU writes the buffer
        const WRITE = 0x0002;
    }
}

bitflags::bitflags! {
    /// Per-buffer access flags in the submission's buffer table
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SubmitBoFlags: u32 {
        /// Buffer is read by the submission
        const READ = 0x0001;
        /// Buffer is written by the submission
        const WRITE = 0x0002;
    }
}

impl From<RelocFlags> for SubmitBoFlags {
    fn from(flags: RelocFlags) -> Self {
        let mut out = SubmitBoFlags::empty();
        if flags.contains(RelocFlags::READ) {
            out |= SubmitBoFlags::READ;
        }
        if flags.contains(RelocFlags::WRITE) {
            out |= SubmitBoFlags::WRITE;
        }
        out
    }
}

bitflags::bitflags! {
    /// Submission-level flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SubmitFlags: u32 {
        /// Wait on the in-fence descriptor before executing
        const FENCE_FD_IN = 0x0001;
        /// Return a sync-file descriptor for this submission
        const FENCE_FD_OUT = 0x0002;
        /// Buffer table carries user-assigned GPU addresses
        const SOFTPIN = 0x0004;
        /// Skip implicit synchronisation on referenced buffers
        const NO_IMPLICIT = 0x0008;
    }
}

bitflags::bitflags! {
    /// When a performance-monitor sample is taken
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PerfFlags: u32 {
        /// Sample before the command stream executes
        const PRE = 0x0001;
        /// Sample after the command stream executes
        const POST = 0x0002;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reloc_to_submit_flags() {
        assert_eq!(SubmitBoFlags::from(RelocFlags::READ), SubmitBoFlags::READ);
        assert_eq!(
            SubmitBoFlags::from(RelocFlags::READ | RelocFlags::WRITE),
            SubmitBoFlags::READ | SubmitBoFlags::WRITE
        );
        assert!(SubmitBoFlags::from(RelocFlags::empty()).is_empty());
    }
}
