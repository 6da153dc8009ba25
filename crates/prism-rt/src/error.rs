//! Path integrator error types.

use prism_gpu::GpuError;
use thiserror::Error;

/// Errors raised by the ray-traced integrator.
#[derive(Error, Debug)]
pub enum RtError {
    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error("Invalid render settings: {0}")]
    Settings(#[from] prism_core::Error),

    #[error("Failed to encode output image: {0}")]
    Encode(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation was attempted in a state that does not allow it.
    #[error("Integrator is {0:?}")]
    InvalidState(crate::tracer::IntegratorState),
}

impl From<ash::vk::Result> for RtError {
    fn from(e: ash::vk::Result) -> Self {
        Self::Gpu(GpuError::Vulkan(e))
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, RtError>;
