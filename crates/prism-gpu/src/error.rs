//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// Vulkan loader could not be opened.
    #[error("Failed to load Vulkan: {0}")]
    Loading(String),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// The device lacks the ray tracing extension set.
    #[error("Ray tracing unsupported: {0}")]
    RayTracingUnsupported(String),

    /// The device cannot recurse as deep as the path tracer needs.
    #[error("Ray recursion depth {available} below required {required}")]
    InsufficientRecursionDepth { available: u32, required: u32 },

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// A bounded wait on a fence elapsed.
    #[error("GPU did not signal within {0:?}")]
    Timeout(std::time::Duration),

    /// The logical device was lost.
    #[error("Device lost")]
    DeviceLost,

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl GpuError {
    /// Whether the device is unusable after this error.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceLost | Self::Vulkan(vk::Result::ERROR_DEVICE_LOST))
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_loss_is_fatal() {
        assert!(GpuError::DeviceLost.is_fatal());
        assert!(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST).is_fatal());
        assert!(!GpuError::Timeout(std::time::Duration::from_secs(1)).is_fatal());
    }
}
