//! Hardware ray-traced path integrator for the Prism engine.
//!
//! The integrator runs on its own logical device created from the shared
//! [`prism_gpu::GpuContext`], using:
//! - `VK_KHR_acceleration_structure`
//! - `VK_KHR_ray_tracing_pipeline`
//! - `VK_KHR_deferred_host_operations`
//!
//! Acceleration structures are rebuilt for every render and destroyed before
//! [`PathTracer::render`] returns.
//!
//! # Feature Flags
//!
//! - `ray_tracing` - Compile the ray tracing shaders. Without it
//!   [`PathTracer::new`] reports the integrator as unsupported.
//!
//! # Example
//!
//! ```ignore
//! use prism_rt::PathTracer;
//!
//! let mut tracer = PathTracer::new(gpu)?;
//! let report = tracer.render(&scene, &resources, None, &settings)?;
//! ```

pub mod acceleration;
pub mod device;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod plan;
pub mod sbt;
pub mod tracer;
pub mod uniforms;

pub use acceleration::{AsTracker, MeshBlas, SceneAccelerationStructure, Tlas};
pub use device::{check_support, RtDevice, RtDeviceBuilder};
pub use error::{Result, RtError};
pub use output::write_image;
pub use plan::{plan_instances, InstancePlan, ObjectDescription, SceneResolver};
pub use sbt::{SbtLayout, ShaderBindingTable};
pub use tracer::{IntegratorState, PathTracer, RenderReport};
pub use uniforms::TraceUniforms;

/// Whether the ray tracing shaders were compiled in.
pub const fn is_available() -> bool {
    cfg!(feature = "ray_tracing")
}
