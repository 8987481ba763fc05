//! # Pipes
//!
//! A pipe is one logical queue (3D, 2D or VG) of a GPU core. Command
//! streams execute on a pipe and their fences are waited on through it.

use std::fmt;
use std::time::Duration;

use cinder_core::{Errno, Error, PipeId, Result, Timestamp, Transport};
use cinder_mem::Device;

use crate::gpu::Gpu;

/// Logical queue on a GPU core
pub struct Pipe<T: Transport> {
    gpu: Gpu<T>,
    id: PipeId,
}

impl<T: Transport> Pipe<T> {
    /// Open pipe `id` on `gpu`
    pub fn new(gpu: &Gpu<T>, id: PipeId) -> Self {
        Self {
            gpu: gpu.clone(),
            id,
        }
    }

    /// Pipe id
    pub fn id(&self) -> PipeId {
        self.id
    }

    /// GPU core the pipe belongs to
    pub fn gpu(&self) -> &Gpu<T> {
        &self.gpu
    }

    /// Owning device
    pub fn device(&self) -> &Device<T> {
        self.gpu.device()
    }

    /// Block until `timestamp` signalled, at most `timeout`
    ///
    /// A zero timeout polls.
    pub fn wait(&self, timestamp: Timestamp, timeout: Duration) -> Result<()> {
        self.device()
            .transport()
            .wait_fence(self.gpu.core(), timestamp, timeout)
            .map_err(|errno| match errno {
                Errno::ETIMEDOUT => Error::Timeout,
                other => {
                    log::error!("waiting for fence {} failed: {}", timestamp, other);
                    Error::WaitFailed(other)
                }
            })
    }

    /// Whether `timestamp` already signalled
    pub fn is_signalled(&self, timestamp: Timestamp) -> bool {
        self.wait(timestamp, Duration::ZERO).is_ok()
    }
}

impl<T: Transport> Clone for Pipe<T> {
    fn clone(&self) -> Self {
        Self {
            gpu: self.gpu.clone(),
            id: self.id,
        }
    }
}

impl<T: Transport> fmt::Debug for Pipe<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("core", &self.gpu.core())
            .field("id", &self.id)
            .finish()
    }
}
