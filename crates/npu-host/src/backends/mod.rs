//! Platform backends
//!
//! A [`Platform`] bundles the per-variant collaborators the host needs:
//! - **FirmwareLoader**: installs and boots the coprocessor image
//! - **PowerController**: rail and clock sequencing behind power votes
//! - **PacketCodec**: the firmware's IPC packet layout
//!
//! The platform is chosen when the `HostContext` is built and never swapped.
//! One variant ships here: **Software**, an in-process virtual coprocessor for
//! CI, demos and fault injection.

pub mod software;

pub use software::{
    BootBehavior, FirmwareControl, Reply, SoftwareFirmware, SoftwareFirmwareConfig,
};

use crate::firmware::FirmwareLoader;
use crate::power::{PowerController, SoftwarePower};
use crate::protocol::{PacketCodec, WordCodec};
use std::sync::Arc;

/// Backend type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    /// Virtual coprocessor in a host thread
    Software,
    /// Externally supplied collaborators
    Custom,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Software => write!(f, "Software (virtual NPU)"),
            Self::Custom => write!(f, "Custom"),
        }
    }
}

/// Collaborators for one hardware variant
#[derive(Debug)]
pub struct Platform {
    /// Which variant this is
    pub backend_type: BackendType,
    /// Firmware bring-up
    pub firmware: Box<dyn FirmwareLoader>,
    /// Power sequencing
    pub power: Arc<dyn PowerController>,
    /// IPC packet layout
    pub codec: Arc<dyn PacketCodec>,
}

impl Platform {
    /// Software platform with default firmware configuration
    ///
    /// Returns the platform plus handles for scripting firmware and observing
    /// the power rail.
    pub fn software() -> (Self, FirmwareControl, Arc<SoftwarePower>) {
        Self::software_with(SoftwareFirmwareConfig::default())
    }

    /// Software platform with explicit firmware configuration
    pub fn software_with(
        config: SoftwareFirmwareConfig,
    ) -> (Self, FirmwareControl, Arc<SoftwarePower>) {
        let firmware = SoftwareFirmware::new(config);
        let control = firmware.control();
        let power = Arc::new(SoftwarePower::new());
        let platform = Self {
            backend_type: BackendType::Software,
            firmware: Box::new(firmware),
            power: power.clone(),
            codec: Arc::new(WordCodec),
        };
        (platform, control, power)
    }

    /// Platform from externally supplied collaborators
    pub fn custom(
        firmware: Box<dyn FirmwareLoader>,
        power: Arc<dyn PowerController>,
        codec: Arc<dyn PacketCodec>,
    ) -> Self {
        Self {
            backend_type: BackendType::Custom,
            firmware,
            power,
            codec,
        }
    }
}
