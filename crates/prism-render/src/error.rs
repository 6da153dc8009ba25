//! Error types for the raster renderer.

use prism_gpu::GpuError;
use thiserror::Error;

/// Errors raised while building or recording the raster pipeline.
#[derive(Error, Debug)]
pub enum RenderError {
    /// Vulkan or allocation failure
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),

    /// A render target handle outlived its swapchain generation
    #[error("Stale render target: generation {found}, current generation {current}")]
    StaleTarget { found: u64, current: u64 },

    /// A typed handle that no table entry answers to
    #[error("Unknown {kind} handle {index}")]
    UnknownHandle { kind: &'static str, index: u32 },

    /// A fixed-size table is full
    #[error("{kind} table is full ({capacity} entries)")]
    TableFull { kind: &'static str, capacity: u32 },

    /// Source image could not be decoded
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Rejected input data
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl From<prism_core::Error> for RenderError {
    fn from(err: prism_core::Error) -> Self {
        Self::InvalidData(err.to_string())
    }
}

impl From<ash::vk::Result> for RenderError {
    fn from(err: ash::vk::Result) -> Self {
        Self::Gpu(GpuError::Vulkan(err))
    }
}

/// Result alias for raster rendering.
pub type Result<T> = std::result::Result<T, RenderError>;
