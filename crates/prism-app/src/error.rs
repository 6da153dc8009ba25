//! Frame loop and engine error types.

use std::time::Duration;

use prism_gpu::GpuError;
use prism_render::RenderError;
use prism_rt::RtError;
use thiserror::Error;

/// Errors raised by a frame loop tick or its control operations.
#[derive(Error, Debug)]
pub enum FrameError {
    /// A slot fence did not signal within the configured timeout.
    #[error("GPU did not retire frame slot {slot} within {timeout:?}")]
    DeviceHang { slot: usize, timeout: Duration },

    #[error("Device lost")]
    DeviceLost,

    #[error("Frame loop did not become idle within {0:?}")]
    IdleTimeout(Duration),

    #[error("Failed to spawn frame loop thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    Gpu(GpuError),

    #[error(transparent)]
    Render(RenderError),
}

impl FrameError {
    /// Errors that stop the loop.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceHang { .. } | Self::DeviceLost)
    }

    /// Map a fence wait failure on `slot`.
    pub fn from_fence(slot: usize, error: GpuError) -> Self {
        match error {
            GpuError::Timeout(timeout) => Self::DeviceHang { slot, timeout },
            other => other.into(),
        }
    }
}

impl From<GpuError> for FrameError {
    fn from(e: GpuError) -> Self {
        if e.is_fatal() {
            Self::DeviceLost
        } else {
            Self::Gpu(e)
        }
    }
}

impl From<RenderError> for FrameError {
    fn from(e: RenderError) -> Self {
        match e {
            RenderError::Gpu(gpu) => gpu.into(),
            other => Self::Render(other),
        }
    }
}

impl From<ash::vk::Result> for FrameError {
    fn from(e: ash::vk::Result) -> Self {
        GpuError::from(e).into()
    }
}

/// Errors raised by [`crate::Engine`].
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    RayTracing(#[from] RtError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("Ray tracing is not available on this device")]
    RayTracingUnavailable,
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fence_timeout_is_a_hang() {
        let error = FrameError::from_fence(2, GpuError::Timeout(Duration::from_secs(5)));
        assert!(matches!(error, FrameError::DeviceHang { slot: 2, .. }));
        assert!(error.is_fatal());
    }

    #[test]
    fn lost_device_is_fatal_from_any_source() {
        assert!(FrameError::from(GpuError::DeviceLost).is_fatal());
        assert!(FrameError::from(ash::vk::Result::ERROR_DEVICE_LOST).is_fatal());
        assert!(FrameError::from_fence(0, GpuError::DeviceLost).is_fatal());
    }

    #[test]
    fn other_failures_keep_the_loop_running() {
        assert!(!FrameError::from(ash::vk::Result::ERROR_OUT_OF_DATE_KHR).is_fatal());
        assert!(!FrameError::IdleTimeout(Duration::from_millis(10)).is_fatal());
    }
}
