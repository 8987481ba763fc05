//! # GPU Core
//!
//! One GPU core of an open device.

use std::fmt;

use cinder_core::{Error, GpuParam, Result, Transport};
use cinder_mem::Device;

/// A GPU core, identified by its index on the device
///
/// Model and revision are read once when the core is opened; every other
/// parameter is queried from the kernel on demand.
pub struct Gpu<T: Transport> {
    dev: Device<T>,
    core: u32,
    model: u32,
    revision: u32,
}

impl<T: Transport> Gpu<T> {
    /// Open core `core` of `dev`
    ///
    /// Fails with [`Error::NotFound`] when the kernel reports no chip model
    /// for the core.
    pub fn new(dev: &Device<T>, core: u32) -> Result<Self> {
        let query = |param| {
            dev.transport()
                .query_param(core, param)
                .map_err(Error::Transport)
        };

        let model = query(GpuParam::Model)?;
        if model == 0 {
            log::error!("gpu core {} does not exist", core);
            return Err(Error::NotFound);
        }
        let revision = query(GpuParam::Revision)?;

        log::info!("gpu core {}: model {:x}, revision {:x}", core, model, revision);

        Ok(Self {
            dev: dev.clone(),
            core,
            model: model as u32,
            revision: revision as u32,
        })
    }

    /// Owning device
    pub fn device(&self) -> &Device<T> {
        &self.dev
    }

    /// Core index
    pub fn core(&self) -> u32 {
        self.core
    }

    /// Chip model
    pub fn model(&self) -> u32 {
        self.model
    }

    /// Chip revision
    pub fn revision(&self) -> u32 {
        self.revision
    }

    /// Read a parameter of this core
    pub fn get_param(&self, param: GpuParam) -> Result<u64> {
        match param {
            GpuParam::Model => Ok(u64::from(self.model)),
            GpuParam::Revision => Ok(u64::from(self.revision)),
            other => self
                .dev
                .transport()
                .query_param(self.core, other)
                .map_err(Error::Transport),
        }
    }

    /// Read a parameter by raw id
    pub fn param_by_id(&self, id: u32) -> Result<u64> {
        let param = GpuParam::from_raw(id).ok_or_else(|| {
            log::error!("invalid gpu param id: 0x{:x}", id);
            Error::InvalidArgument
        })?;
        self.get_param(param)
    }
}

impl<T: Transport> Clone for Gpu<T> {
    fn clone(&self) -> Self {
        Self {
            dev: self.dev.clone(),
            core: self.core,
            model: self.model,
            revision: self.revision,
        }
    }
}

impl<T: Transport> fmt::Debug for Gpu<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gpu")
            .field("core", &self.core)
            .field("model", &format_args!("{:x}", self.model))
            .field("revision", &format_args!("{:x}", self.revision))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::Errno;
    use cinder_test_framework::{MockTransport, MOCK_MODEL, MOCK_REVISION};

    #[test]
    fn test_open_core() {
        let mock = MockTransport::new();
        let dev = Device::open(mock.clone());
        let gpu = Gpu::new(&dev, 0).unwrap();
        assert_eq!(u64::from(gpu.model()), MOCK_MODEL);
        assert_eq!(gpu.get_param(GpuParam::Revision).unwrap(), MOCK_REVISION);
        assert_eq!(gpu.get_param(GpuParam::ShaderCoreCount).unwrap(), 4);
    }

    #[test]
    fn test_missing_core() {
        let mock = MockTransport::new();
        mock.set_param(1, GpuParam::Model, 0);
        let dev = Device::open(mock.clone());
        assert_eq!(Gpu::new(&dev, 1).err(), Some(Error::NotFound));
        assert_eq!(Gpu::new(&dev, 2).err(), Some(Error::Transport(Errno::EINVAL)));
    }

    #[test]
    fn test_param_by_id() {
        let mock = MockTransport::new();
        let dev = Device::open(mock.clone());
        let gpu = Gpu::new(&dev, 0).unwrap();
        assert_eq!(gpu.param_by_id(0x01).unwrap(), MOCK_MODEL);
        assert_eq!(gpu.param_by_id(0x0b).err(), Some(Error::InvalidArgument));
        // Known id, but the kernel does not report it.
        assert_eq!(
            gpu.param_by_id(GpuParam::EcoId.raw()).err(),
            Some(Error::Transport(Errno::EINVAL))
        );
    }
}
