// src/backend/device.rs
use crate::error::GraphError;
use std::str::FromStr;

/// Memory location tag of a tensor: host memory or the memory of a CUDA device.
/// The CUDA variant exists in every build; without the `cuda` feature any attempt to
/// allocate on it fails with `Unsupported`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    #[default]
    CPU,
    CUDA(usize), // Device ID for multi-GPU systems
}

impl Device {
    // Check if device is CPU
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::CPU)
    }

    // Check if device is any GPU type
    pub fn is_cuda(&self) -> bool {
        matches!(self, Device::CUDA(_))
    }

    // Get device ID for CUDA devices
    pub fn device_id(&self) -> Option<usize> {
        match self {
            Device::CPU => None,
            Device::CUDA(id) => Some(*id),
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::CPU => write!(f, "CPU"),
            Device::CUDA(id) => write!(f, "CUDA:{}", id),
        }
    }
}

impl FromStr for Device {
    type Err = GraphError;

    /// Accepts `cpu`, `cuda` and `cuda:N`, case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "cpu" | "host" => Ok(Device::CPU),
            "cuda" | "gpu" => Ok(Device::CUDA(0)),
            other => {
                let id = other
                    .strip_prefix("cuda:")
                    .and_then(|id| id.parse::<usize>().ok())
                    .ok_or_else(|| GraphError::invalid(format!("unknown device '{s}'")))?;
                Ok(Device::CUDA(id))
            }
        }
    }
}

pub fn cpu() -> Device {
    Device::CPU
}

pub fn cuda(device_id: usize) -> Device {
    Device::CUDA(device_id)
}

// Picks CUDA when the feature is on and a context could be created for f32.
pub fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if crate::backend::manager::has_cuda::<f32>() {
            return Device::CUDA(0);
        }
    }
    Device::CPU
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_devices() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::CPU);
        assert_eq!("CUDA".parse::<Device>().unwrap(), Device::CUDA(0));
        assert_eq!("cuda:3".parse::<Device>().unwrap(), Device::CUDA(3));
        assert!("tpu".parse::<Device>().is_err());
        assert!("cuda:x".parse::<Device>().is_err());
    }

    #[test]
    fn test_display_round_trip() {
        let dev = cuda(1);
        assert_eq!(dev.to_string(), "CUDA:1");
        assert_eq!(dev.to_string().parse::<Device>().unwrap(), dev);
        assert!(cpu().is_cpu());
        assert!(dev.is_cuda() && !cpu().is_cuda());
        assert_eq!(dev.device_id(), Some(1));
    }
}
