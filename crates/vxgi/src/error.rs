//! Error taxonomy for the VXGI core.

use thiserror::Error;

use crate::passes::FrameStage;

pub type Result<T, E = VxgiError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum VxgiError {
    /// Grid storage does not fit the device budget or the host allocation failed.
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// Invalid resolution/bounds combination or an invalid pass registration.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A position or voxel coordinate lies outside the grid.
    #[error("out of bounds: {0}")]
    OutOfBounds(String),

    /// The device was lost while the frame was in `stage`.
    #[error("device lost during {stage:?}")]
    DeviceLost { stage: FrameStage },

    /// A pass tried to enter a stage that does not follow the current one.
    #[error("illegal stage transition {from:?} -> {to:?}")]
    StageOrder { from: FrameStage, to: FrameStage },
}

impl VxgiError {
    /// Whether the pipeline may continue with the next frame after this error.
    pub fn is_frame_recoverable(&self) -> bool {
        matches!(self, VxgiError::DeviceLost { .. } | VxgiError::OutOfBounds(_))
    }

    /// Whether the error must be surfaced to the caller as a hard failure.
    pub fn is_fatal(&self) -> bool {
        !self.is_frame_recoverable()
    }
}
