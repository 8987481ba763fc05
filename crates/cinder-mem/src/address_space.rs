//! # GPU Address Space
//!
//! User-managed GPU virtual addresses for softpin devices.
//!
//! When the kernel lets userspace pick GPU addresses, every buffer object
//! gets a fixed range for its whole life. The range is only returned to the
//! allocator once the GPU is done with the buffer (see the zombie list in
//! [`crate::device`]).

use cinder_core::{align_up, Errno, Error, GpuAddr, Result, PAGE_SIZE};

/// Upper end of the softpin address window
pub const SOFTPIN_END: u64 = 1 << 32;

// =============================================================================
// VIRTUAL ADDRESS RANGE
// =============================================================================

/// A range in GPU virtual address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaRange {
    /// Start address
    pub start: GpuAddr,
    /// End address (exclusive)
    pub end: GpuAddr,
}

impl VaRange {
    /// Create a new VA range
    pub const fn new(start: GpuAddr, size: u64) -> Self {
        Self {
            start,
            end: GpuAddr::new(start.raw() + size),
        }
    }

    /// Range size in bytes
    pub fn size(&self) -> u64 {
        self.end.raw() - self.start.raw()
    }

    /// Check if address is in range
    pub fn contains(&self, addr: GpuAddr) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Check if ranges overlap
    pub fn overlaps(&self, other: &VaRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// =============================================================================
// VA BLOCK
// =============================================================================

#[derive(Debug, Clone)]
struct VaBlock {
    range: VaRange,
    free: bool,
}

// =============================================================================
// ADDRESS SPACE
// =============================================================================

/// First-fit allocator over one GPU address window
#[derive(Debug)]
pub struct AddressSpace {
    range: VaRange,
    blocks: Vec<VaBlock>,
    stats: AddressSpaceStats,
}

/// Address space statistics
#[derive(Debug, Clone, Default)]
pub struct AddressSpaceStats {
    /// Number of allocations
    pub allocs: u64,
    /// Number of frees
    pub frees: u64,
    /// Currently allocated bytes
    pub allocated: u64,
}

impl AddressSpace {
    /// Manage `range`
    pub fn new(range: VaRange) -> Self {
        Self {
            range,
            blocks: vec![VaBlock { range, free: true }],
            stats: AddressSpaceStats::default(),
        }
    }

    /// Softpin window `[start, 4 GiB)` reported by the kernel
    pub fn softpin(start: u64) -> Result<Self> {
        if start >= SOFTPIN_END {
            return Err(Error::InvalidArgument);
        }
        let start = align_up(start, PAGE_SIZE).ok_or(Error::InvalidArgument)?;
        Ok(Self::new(VaRange {
            start: GpuAddr::new(start),
            end: GpuAddr::new(SOFTPIN_END),
        }))
    }

    /// Managed range
    pub fn range(&self) -> VaRange {
        self.range
    }

    /// Allocate `size` bytes aligned to `alignment` (at least a page)
    ///
    /// Exhaustion is reported as an allocation failure with `ENOSPC`.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Result<VaRange> {
        if size == 0 {
            return Err(Error::InvalidArgument);
        }
        let alignment = alignment.max(PAGE_SIZE);

        for i in 0..self.blocks.len() {
            if !self.blocks[i].free {
                continue;
            }

            let block = self.blocks[i].range;
            let Some(aligned_start) = align_up(block.start.raw(), alignment) else {
                continue;
            };
            let Some(aligned_end) = aligned_start.checked_add(size) else {
                continue;
            };

            if aligned_end <= block.end.raw() {
                let alloc_range = VaRange {
                    start: GpuAddr::new(aligned_start),
                    end: GpuAddr::new(aligned_end),
                };
                self.split_block(i, alloc_range);

                self.stats.allocs += 1;
                self.stats.allocated += size;
                return Ok(alloc_range);
            }
        }

        Err(Error::AllocationFailed(Errno::ENOSPC))
    }

    fn split_block(&mut self, index: usize, alloc: VaRange) {
        let block = self.blocks.remove(index);
        let mut at = index;

        if alloc.start > block.range.start {
            self.blocks.insert(at, VaBlock {
                range: VaRange {
                    start: block.range.start,
                    end: alloc.start,
                },
                free: true,
            });
            at += 1;
        }

        self.blocks.insert(at, VaBlock {
            range: alloc,
            free: false,
        });

        if alloc.end < block.range.end {
            self.blocks.insert(at + 1, VaBlock {
                range: VaRange {
                    start: alloc.end,
                    end: block.range.end,
                },
                free: true,
            });
        }
    }

    /// Return a range obtained from [`AddressSpace::allocate`]
    pub fn free(&mut self, range: VaRange) -> Result<()> {
        let index = self
            .blocks
            .iter()
            .position(|b| b.range == range && !b.free)
            .ok_or(Error::NotFound)?;

        self.blocks[index].free = true;
        self.stats.frees += 1;
        self.stats.allocated -= range.size();

        self.merge_free_blocks();
        Ok(())
    }

    fn merge_free_blocks(&mut self) {
        let mut i = 0;
        while i + 1 < self.blocks.len() {
            if self.blocks[i].free && self.blocks[i + 1].free {
                self.blocks[i].range.end = self.blocks[i + 1].range.end;
                self.blocks.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }

    /// Get statistics
    pub fn stats(&self) -> &AddressSpaceStats {
        &self.stats
    }

    /// Total free bytes
    pub fn free_space(&self) -> u64 {
        self.blocks
            .iter()
            .filter(|b| b.free)
            .map(|b| b.range.size())
            .sum()
    }

    /// Largest contiguous free region
    pub fn largest_free(&self) -> u64 {
        self.blocks
            .iter()
            .filter(|b| b.free)
            .map(|b| b.range.size())
            .max()
            .unwrap_or(0)
    }
}
