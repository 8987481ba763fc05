//! # CINDER Command System
//!
//! GPU cores, pipes, command streams and performance monitors.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                    Command Submission Pipeline                    │
//! │                                                                   │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────────┐     │
//! │  │   Command    │    │  Submission  │    │    Transport     │     │
//! │  │   Stream     │───▶│   Tables     │───▶│    (kernel)      │     │
//! │  │  (Building)  │    │ bos/relocs/  │    │                  │     │
//! │  └──────┬───────┘    │    pmrs      │    └────────┬─────────┘     │
//! │         │            └──────────────┘             │               │
//! │  ┌──────▼───────┐                        ┌────────▼─────────┐     │
//! │  │ Buffer       │                        │  Pipe / Fence    │     │
//! │  │ Objects      │                        │  (3D, 2D, VG)    │     │
//! │  └──────────────┘                        └──────────────────┘     │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Submission Flow
//!
//! 1. Open a [`Gpu`] core on a device and a [`Pipe`] on it
//! 2. Emit words, relocations and perf records into a [`CmdStream`]
//! 3. Flush: the tables are submitted and the stream is reset
//! 4. Wait on the returned [`Timestamp`](cinder_core::Timestamp) through the pipe

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod gpu;
pub mod perfmon;
pub mod pipe;
pub mod stream;

// Re-exports
pub use gpu::Gpu;
pub use perfmon::{PerfDomain, PerfMonitor, PerfSignal};
pub use pipe::Pipe;
pub use stream::{
    CmdStream, PerfRecord, Reloc, ResetNotify, StreamConfig, END_CLEARANCE, MAX_STREAM_WORDS,
};
