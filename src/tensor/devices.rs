//! Device placement for tensors and parameters

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{LossError, LossResult};

/// Compute device a tensor is placed on.
///
/// Selected explicitly at construction time; nothing in the crate binds to
/// an accelerator implicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl Device {
    /// Check if device is GPU-based
    pub const fn is_gpu(&self) -> bool {
        matches!(self, Device::Cuda(_) | Device::Metal(_))
    }

    /// Whether this build has a compute backend for the device
    pub const fn is_available(&self) -> bool {
        matches!(self, Device::Cpu)
    }

    /// Fail unless the device has a compute backend
    pub fn ensure_available(&self) -> LossResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(LossError::device_error(
                &self.to_string(),
                "no compute backend is available for this device, use Device::Cpu",
            ))
        }
    }

    /// Fail if two operands live on different devices
    pub fn ensure_same(&self, other: Device, operation: &str) -> LossResult<()> {
        if *self == other {
            Ok(())
        } else {
            Err(LossError::device_error(
                &self.to_string(),
                &format!("{} mixes tensors on {} and {}", operation, self, other),
            ))
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(id) => write!(f, "cuda:{}", id),
            Device::Metal(id) => write!(f, "metal:{}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_features() {
        assert!(Device::Cuda(0).is_gpu());
        assert!(!Device::Cpu.is_gpu());
        assert_eq!(Device::Cuda(1).to_string(), "cuda:1");
        assert_eq!(Device::default(), Device::Cpu);
    }

    #[test]
    fn test_device_availability() {
        assert!(Device::Cpu.ensure_available().is_ok());
        let err = Device::Cuda(0).ensure_available().unwrap_err();
        assert!(matches!(err, LossError::DeviceError(_)));
    }

    #[test]
    fn test_device_mismatch() {
        assert!(Device::Cpu.ensure_same(Device::Cpu, "matmul").is_ok());
        assert!(Device::Cpu.ensure_same(Device::Metal(0), "matmul").is_err());
    }
}
