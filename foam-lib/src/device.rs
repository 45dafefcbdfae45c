use std::fmt;

use crate::error::FoamError;

/// Compute device an evaluation runs on.
///
/// Rendering on an accelerator happens inside the external renderer; this
/// crate only ships CPU collaborators, so any other request is rejected up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
}

impl Device {
    pub fn parse(value: &str) -> Result<Self, FoamError> {
        let name = value.trim().to_ascii_lowercase();
        match name.split(':').next().unwrap_or_default() {
            "cpu" => Ok(Device::Cpu),
            "cuda" | "vulkan" | "metal" | "gpu" => Err(FoamError::Device(format!(
                "'{}' requested, but no accelerator backend is available in this build",
                value
            ))),
            _ => Err(FoamError::Device(format!("unknown device '{}'", value))),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
        }
    }
}
