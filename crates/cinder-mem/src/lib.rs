//! # CINDER Memory Management
//!
//! Buffer objects, the buffer cache and the per-device registry.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      CINDER Memory System                       │
//! │                                                                 │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                     Device Registry                       │  │
//! │  │     handle → BO   │   name → BO   │   zombie list         │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │            │                  │                  │              │
//! │  ┌─────────┴───────┐  ┌───────┴───────┐  ┌───────┴──────────┐   │
//! │  │  Buffer Objects │  │ Buffer Cache  │  │  GPU Address     │   │
//! │  │  (Bo handles)   │  │ (size buckets)│  │  Space (softpin) │   │
//! │  └─────────────────┘  └───────────────┘  └──────────────────┘   │
//! │                              │                                  │
//! │  ┌───────────────────────────┴───────────────────────────────┐  │
//! │  │                  Transport (kernel driver)                │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - At most one canonical buffer object exists per kernel handle.
//! - A cached buffer is only handed out again once the GPU is done with it.
//! - On softpin devices a GPU address is only reused after the GPU stopped
//!   using the buffer that held it.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address_space;
pub mod bo;
pub mod cache;
pub mod device;

// Re-exports
pub use address_space::{AddressSpace, VaRange};
pub use bo::{Bo, StreamLink};
pub use cache::{BoCache, CACHE_MAX_SIZE};
pub use device::{Device, DeviceConfig, DeviceStats};
