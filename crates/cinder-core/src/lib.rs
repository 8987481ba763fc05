//! # CINDER Core
//!
//! Foundational types shared by every layer of the CINDER buffer manager.
//!
//! This crate owns nothing stateful. It defines:
//! - the error taxonomy and the errno values the kernel transport reports
//! - strong types for kernel handles, global names, descriptors and GPU addresses
//! - the flag sets used for allocation, CPU access, relocations and submission
//! - the `#[repr(C)]` submission tables handed to the kernel
//! - the [`Transport`] trait, the only way the upper layers reach the kernel
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      cinder-core                            │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │  Transport  │  │   Types /   │  │  Error / Errno      │  │
//! │  │  (kernel    │  │   Flags     │  │                     │  │
//! │  │   contract) │  │  (BoHandle) │  │                     │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod error;
pub mod flags;
pub mod param;
pub mod submit;
pub mod sync;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use error::{Errno, Error, Result};
pub use flags::*;
pub use param::{GpuParam, PipeId};
pub use submit::{SubmitBo, SubmitPmr, SubmitReloc, SubmitRequest, SubmitResponse};
pub use sync::Timestamp;
pub use transport::{Mapping, PerfDomainDesc, PerfSignalDesc, Transport, TransportResult};
pub use types::*;
