//! Engine configuration.

use std::time::Duration;

use ash::vk;
use prism_render::{IblConfig, RasterConfig};

/// Frame loop pacing and fence policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoopConfig {
    /// Rate cap (None for unlimited).
    pub target_fps: Option<u32>,
    /// Upper bound on a single slot fence wait.
    pub fence_timeout: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            target_fps: Some(60),
            fence_timeout: Duration::from_secs(5),
        }
    }
}

impl LoopConfig {
    /// Minimum time between two ticks.
    pub fn frame_time(&self) -> Option<Duration> {
        self.target_fps
            .filter(|&fps| fps > 0)
            .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps)))
    }
}

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Application name reported to the driver.
    pub app_name: String,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    pub vsync: bool,
    pub target_fps: Option<u32>,
    pub fence_timeout: Duration,
    /// Requested MSAA sample count, clamped to what the device supports.
    pub samples: vk::SampleCountFlags,
    pub ibl: IblConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let frame_loop = LoopConfig::default();
        Self {
            app_name: "Prism".to_string(),
            validation: cfg!(debug_assertions),
            vsync: true,
            target_fps: frame_loop.target_fps,
            fence_timeout: frame_loop.fence_timeout,
            samples: vk::SampleCountFlags::TYPE_4,
            ibl: IblConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a new config with the given application name.
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub const fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    #[must_use]
    pub const fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Set the frame rate cap. `None` runs unthrottled.
    #[must_use]
    pub const fn with_target_fps(mut self, fps: Option<u32>) -> Self {
        self.target_fps = fps;
        self
    }

    #[must_use]
    pub const fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.fence_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }

    #[must_use]
    pub const fn with_ibl(mut self, ibl: IblConfig) -> Self {
        self.ibl = ibl;
        self
    }

    pub const fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            target_fps: self.target_fps,
            fence_timeout: self.fence_timeout,
        }
    }

    pub fn raster_config(&self) -> RasterConfig {
        RasterConfig {
            samples: self.samples,
            ..RasterConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_caps_at_sixty_hertz() {
        let config = LoopConfig::default();
        assert_eq!(config.frame_time(), Some(Duration::from_nanos(16_666_666)));
        assert_eq!(config.fence_timeout, Duration::from_secs(5));
    }

    #[test]
    fn zero_or_missing_rate_is_unthrottled() {
        let mut config = LoopConfig {
            target_fps: None,
            ..LoopConfig::default()
        };
        assert_eq!(config.frame_time(), None);
        config.target_fps = Some(0);
        assert_eq!(config.frame_time(), None);
    }

    #[test]
    fn engine_config_feeds_loop_and_raster() {
        let config = EngineConfig::new("test")
            .with_target_fps(Some(30))
            .with_fence_timeout(Duration::from_millis(250))
            .with_samples(vk::SampleCountFlags::TYPE_1);
        assert_eq!(config.loop_config().target_fps, Some(30));
        assert_eq!(config.loop_config().fence_timeout, Duration::from_millis(250));
        assert_eq!(config.raster_config().samples, vk::SampleCountFlags::TYPE_1);
    }
}
