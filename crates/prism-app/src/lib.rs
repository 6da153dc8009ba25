//! Frame orchestration for the Prism engine.
//!
//! This crate provides:
//! - The background frame loop (`Stopped → Idle ⇄ Running`) with bounded
//!   fence waits and a pause bracket for resource edits
//! - A swapchain frame backend driving the raster pipeline
//! - The [`Engine`] facade combining raster presentation and on-demand
//!   path tracing
//! - Shared logging setup for the apps
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use prism_app::{Engine, EngineConfig};
//! use prism_core::{RenderSettings, SharedScene};
//!
//! # fn demo<W>(window: &W) -> prism_app::Result<()>
//! # where W: prism_app::raw_window_handle::HasDisplayHandle + prism_app::raw_window_handle::HasWindowHandle {
//! let scene = SharedScene::default();
//! let mut engine = Engine::new(window, (1280, 720), Arc::new(scene), EngineConfig::new("demo"))?;
//! engine.set_active(true);
//! let report = engine.render_scene(&RenderSettings::default())?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod slots;

pub use backend::VulkanFrameBackend;
pub use config::{EngineConfig, LoopConfig};
pub use engine::Engine;
pub use error::{EngineError, FrameError, Result};
pub use logging::init_logging;
pub use orchestrator::{tick, FrameBackend, FrameLoop, LoopState, PauseGuard, TickOutcome};
pub use slots::FrameRing;

// Re-export commonly used types for convenience
pub use prism_gpu::{GpuContext, GpuContextBuilder};
pub use prism_rt::RenderReport;
pub use raw_window_handle;
