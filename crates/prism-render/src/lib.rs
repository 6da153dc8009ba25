//! Raster rendering for the Prism engine.
//!
//! This crate provides:
//! - Material-kind draw batching and per-draw descriptor binding
//! - GPU resource tables (meshes, materials, bindless textures, environments)
//! - Image based lighting bakes (environment, irradiance, prefiltered, BRDF LUT)
//! - The forward + post + UI raster pipeline with MSAA resolve
//! - Selection-buffer picking

pub mod batching;
pub mod error;
pub mod gizmo;
pub mod ibl;
pub mod picking;
pub mod raster;
pub mod resources;
pub mod targets;
pub mod uniforms;

pub use batching::{build_batches, BatchResolver, DrawBatch, DrawList, DrawRecord};
pub use error::{RenderError, Result};
pub use ibl::{EquirectImage, IblAsset, IblBaker, IblConfig};
pub use raster::{FrameStats, OutputImage, RasterConfig, RasterPipeline};
pub use resources::{EnvironmentBinding, GpuMesh, RenderResources};
pub use targets::{RenderTargetSet, TargetArena, TargetHandle};
pub use uniforms::{DrawPushConstants, MaterialBlock, ObjectBlock, PostPushConstants, SceneUniforms};
