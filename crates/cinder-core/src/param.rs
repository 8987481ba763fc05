//! # GPU Parameters and Pipes
//!
//! Identifiers for the values a GPU core reports through `query_param`, and
//! for the logical queues (pipes) a core exposes.

// =============================================================================
// GPU PARAMETERS
// =============================================================================

/// Parameter ids understood by the kernel's query call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum GpuParam {
    /// Chip model
    Model = 0x01,
    /// Chip revision
    Revision = 0x02,
    /// Feature word 0
    Features0 = 0x03,
    /// Feature word 1
    Features1 = 0x04,
    /// Feature word 2
    Features2 = 0x05,
    /// Feature word 3
    Features3 = 0x06,
    /// Feature word 4
    Features4 = 0x07,
    /// Feature word 5
    Features5 = 0x08,
    /// Feature word 6
    Features6 = 0x09,
    /// Number of command streams
    StreamCount = 0x10,
    /// Highest register index
    RegisterMax = 0x11,
    /// Shader thread count
    ThreadCount = 0x12,
    /// Vertex cache size
    VertexCacheSize = 0x13,
    /// Number of shader cores
    ShaderCoreCount = 0x14,
    /// Number of pixel pipes
    PixelPipes = 0x15,
    /// Vertex output buffer size
    VertexOutputBufferSize = 0x16,
    /// Internal buffer size
    BufferSize = 0x17,
    /// Shader instruction count
    InstructionCount = 0x18,
    /// Number of shader constants
    NumConstants = 0x19,
    /// Number of varyings
    NumVaryings = 0x1a,
    /// First GPU virtual address userspace may assign
    SoftpinStartAddr = 0x1b,
    /// Product id
    ProductId = 0x1c,
    /// Customer id
    CustomerId = 0x1d,
    /// ECO id
    EcoId = 0x1e,
}

impl GpuParam {
    /// Every parameter, in id order
    pub const ALL: [GpuParam; 24] = [
        Self::Model,
        Self::Revision,
        Self::Features0,
        Self::Features1,
        Self::Features2,
        Self::Features3,
        Self::Features4,
        Self::Features5,
        Self::Features6,
        Self::StreamCount,
        Self::RegisterMax,
        Self::ThreadCount,
        Self::VertexCacheSize,
        Self::ShaderCoreCount,
        Self::PixelPipes,
        Self::VertexOutputBufferSize,
        Self::BufferSize,
        Self::InstructionCount,
        Self::NumConstants,
        Self::NumVaryings,
        Self::SoftpinStartAddr,
        Self::ProductId,
        Self::CustomerId,
        Self::EcoId,
    ];

    /// Look up a parameter by its raw id
    pub fn from_raw(id: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| *p as u32 == id)
    }

    /// Raw id passed to the kernel
    #[inline]
    pub const fn raw(self) -> u32 {
        self as u32
    }
}

// =============================================================================
// PIPES
// =============================================================================

/// Logical queue on a GPU core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PipeId {
    /// 3D pipe
    ThreeD = 0,
    /// 2D pipe
    TwoD = 1,
    /// Vector graphics pipe
    Vg = 2,
}

impl PipeId {
    /// Raw exec-state id passed to the kernel
    #[inline]
    pub const fn raw(self) -> u32 {
        self as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_from_raw() {
        assert_eq!(GpuParam::from_raw(0x01), Some(GpuParam::Model));
        assert_eq!(GpuParam::from_raw(0x1b), Some(GpuParam::SoftpinStartAddr));
        assert_eq!(GpuParam::from_raw(0x0a), None);
        assert_eq!(GpuParam::from_raw(0xff), None);
    }
}
