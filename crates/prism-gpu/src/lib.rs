//! Vulkan abstraction layer for the Prism renderers.
//!
//! This crate provides:
//! - Vulkan instance and device management (raster and ray tracing devices)
//! - GPU capability detection
//! - Memory allocation via gpu-allocator
//! - Command buffers, bounded fence waits and barrier helpers
//! - Descriptor and dynamic-rendering pipeline builders
//! - Surface and swapchain handling

pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod error;
pub mod image;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use capabilities::{GpuCapabilities, GpuVendor, RayTracingCapabilities, RAY_TRACING_EXTENSIONS};
pub use command::CommandPool;
pub use context::{GpuContext, GpuContextBuilder};
pub use descriptors::{DescriptorPool, DescriptorSetLayoutBuilder};
pub use error::{GpuError, Result};
pub use image::SamplerKind;
pub use memory::{GpuAllocator, GpuBuffer, GpuImage};
pub use pipeline::{BlendMode, ColorTarget, GraphicsPipeline, GraphicsPipelineConfig};
pub use surface::{SurfaceCapabilities, SurfaceContext};
pub use swapchain::Swapchain;
pub use sync::{FrameSync, ImageTransition};

pub use ash::vk;
pub use gpu_allocator::MemoryLocation;
