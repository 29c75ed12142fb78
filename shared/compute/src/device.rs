use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What kind of device this process computes on. Resolved once per process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    Accelerator,
    Cpu,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Accelerator => write!(f, "accelerator"),
            DeviceKind::Cpu => write!(f, "cpu"),
        }
    }
}

/// The concrete device handle a process hands to the model-construction code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Device {
    Cpu,
    Cuda(usize),
}

impl Device {
    pub fn kind(&self) -> DeviceKind {
        match self {
            Device::Cpu => DeviceKind::Cpu,
            Device::Cuda(_) => DeviceKind::Accelerator,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(idx) => write!(f, "cuda:{idx}"),
        }
    }
}

/// The `--device-type` knob. `Auto` defers to accelerator detection, the other
/// two bypass it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeviceRequest {
    #[default]
    Auto,
    Accelerator,
    Cpu,
}

const DEVICE_REQUEST_STRINGS: &str = "auto, cuda (alias: gpu, accelerator), cpu";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceParseError {
    #[error("invalid device type '{0}'. Accepted device types are: {DEVICE_REQUEST_STRINGS}")]
    InvalidDeviceType(String),
}

impl FromStr for DeviceRequest {
    type Err = DeviceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(DeviceRequest::Auto),
            "cuda" | "gpu" | "accelerator" => Ok(DeviceRequest::Accelerator),
            "cpu" => Ok(DeviceRequest::Cpu),
            _ => Err(DeviceParseError::InvalidDeviceType(s.to_owned())),
        }
    }
}

impl fmt::Display for DeviceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceRequest::Auto => write!(f, "auto"),
            DeviceRequest::Accelerator => write!(f, "cuda"),
            DeviceRequest::Cpu => write!(f, "cpu"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("device type {requested} was requested but no accelerator was found on this system")]
    NoAccelerator { requested: DeviceRequest },

    #[error("local rank {local_rank} has no accelerator, only {available} visible on this host")]
    NoDeviceForRank { local_rank: usize, available: usize },
}

/// Accelerator detection. Implementations may under-report (a driver problem
/// shows up as zero devices); callers treat zero as "use the CPU" rather than fail.
pub trait AcceleratorProbe: Send + Sync {
    fn accelerator_count(&self) -> usize;
}

/// Counts CUDA devices visible to this process through libtorch. Built
/// without the `tch` feature it reports none, so `auto` resolves to the CPU.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemProbe;

impl AcceleratorProbe for SystemProbe {
    #[cfg(feature = "tch")]
    fn accelerator_count(&self) -> usize {
        if tch::utils::has_cuda() && tch::Cuda::is_available() {
            tch::Cuda::device_count().max(0) as usize
        } else {
            0
        }
    }

    #[cfg(not(feature = "tch"))]
    fn accelerator_count(&self) -> usize {
        0
    }
}

/// A probe that always reports the same count.
#[derive(Clone, Copy, Debug)]
pub struct FixedProbe(pub usize);

impl AcceleratorProbe for FixedProbe {
    fn accelerator_count(&self) -> usize {
        self.0
    }
}

pub fn resolve_device_kind(
    request: DeviceRequest,
    probe: &dyn AcceleratorProbe,
) -> Result<DeviceKind, DeviceError> {
    match request {
        DeviceRequest::Cpu => Ok(DeviceKind::Cpu),
        DeviceRequest::Auto => Ok(if probe.accelerator_count() > 0 {
            DeviceKind::Accelerator
        } else {
            DeviceKind::Cpu
        }),
        DeviceRequest::Accelerator => {
            if probe.accelerator_count() > 0 {
                Ok(DeviceKind::Accelerator)
            } else {
                Err(DeviceError::NoAccelerator { requested: request })
            }
        }
    }
}

/// One process per accelerator: local rank `n` owns `cuda:n`.
pub fn device_for_local_rank(
    kind: DeviceKind,
    local_rank: usize,
    probe: &dyn AcceleratorProbe,
) -> Result<Device, DeviceError> {
    match kind {
        DeviceKind::Cpu => Ok(Device::Cpu),
        DeviceKind::Accelerator => {
            let available = probe.accelerator_count();
            if local_rank < available {
                Ok(Device::Cuda(local_rank))
            } else {
                Err(DeviceError::NoDeviceForRank {
                    local_rank,
                    available,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_request() {
        assert_eq!("auto".parse::<DeviceRequest>(), Ok(DeviceRequest::Auto));
        assert_eq!("CUDA".parse::<DeviceRequest>(), Ok(DeviceRequest::Accelerator));
        assert_eq!("gpu".parse::<DeviceRequest>(), Ok(DeviceRequest::Accelerator));
        assert_eq!(
            "accelerator".parse::<DeviceRequest>(),
            Ok(DeviceRequest::Accelerator)
        );
        assert_eq!(" cpu ".parse::<DeviceRequest>(), Ok(DeviceRequest::Cpu));
        assert!("".parse::<DeviceRequest>().is_err());
        assert!("banana".parse::<DeviceRequest>().is_err());
        assert!("cuda:0".parse::<DeviceRequest>().is_err());
    }

    #[test]
    fn test_auto_follows_detection() {
        assert_eq!(
            resolve_device_kind(DeviceRequest::Auto, &FixedProbe(8)),
            Ok(DeviceKind::Accelerator)
        );
        assert_eq!(
            resolve_device_kind(DeviceRequest::Auto, &FixedProbe(0)),
            Ok(DeviceKind::Cpu)
        );
    }

    #[test]
    fn test_explicit_override_bypasses_detection() {
        assert_eq!(
            resolve_device_kind(DeviceRequest::Cpu, &FixedProbe(8)),
            Ok(DeviceKind::Cpu)
        );
        assert_eq!(
            resolve_device_kind(DeviceRequest::Accelerator, &FixedProbe(0)),
            Err(DeviceError::NoAccelerator {
                requested: DeviceRequest::Accelerator
            })
        );
    }

    #[test]
    fn test_device_for_local_rank() {
        assert_eq!(
            device_for_local_rank(DeviceKind::Accelerator, 3, &FixedProbe(8)),
            Ok(Device::Cuda(3))
        );
        assert_eq!(
            device_for_local_rank(DeviceKind::Cpu, 3, &FixedProbe(8)),
            Ok(Device::Cpu)
        );
        assert_eq!(
            device_for_local_rank(DeviceKind::Accelerator, 2, &FixedProbe(2)),
            Err(DeviceError::NoDeviceForRank {
                local_rank: 2,
                available: 2
            })
        );
    }

    #[test]
    fn test_invalid_device_type_lists_accepted_ones() {
        assert_eq!(
            "tpu".parse::<DeviceRequest>().unwrap_err().to_string(),
            "invalid device type 'tpu'. Accepted device types are: auto, cuda (alias: gpu, accelerator), cpu"
        );
    }

    #[test]
    fn test_system_probe_does_not_panic() {
        let count = SystemProbe.accelerator_count();
        let kind = resolve_device_kind(DeviceRequest::Auto, &SystemProbe).unwrap();
        assert_eq!(kind == DeviceKind::Accelerator, count > 0);
    }
}
