//! Logical device dedicated to the path integrator.
//!
//! The integrator never shares a queue, allocator or command pool with the
//! raster renderer. It opens its own logical device on the same physical
//! device, with the ray tracing extension set enabled.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use parking_lot::Mutex;
use prism_core::constants::RAY_RECURSION_DEPTH;
use prism_gpu::command::execute_single_time_commands;
use prism_gpu::context::create_device;
use prism_gpu::{
    CommandPool, GpuAllocator, GpuContext, GpuError, RayTracingCapabilities, Result,
    RAY_TRACING_EXTENSIONS,
};

/// Check that the reported capabilities can host the integrator.
pub fn check_support(
    capabilities: Option<&RayTracingCapabilities>,
) -> Result<RayTracingCapabilities> {
    let Some(capabilities) = capabilities else {
        let names: Vec<String> = RAY_TRACING_EXTENSIONS
            .iter()
            .map(|name| name.to_string_lossy().into_owned())
            .collect();
        return Err(GpuError::RayTracingUnsupported(names.join(", ")));
    };
    if capabilities.max_ray_recursion_depth < RAY_RECURSION_DEPTH {
        return Err(GpuError::InsufficientRecursionDepth {
            available: capabilities.max_ray_recursion_depth,
            required: RAY_RECURSION_DEPTH,
        });
    }
    Ok(*capabilities)
}

/// Builder for [`RtDevice`].
pub struct RtDeviceBuilder {
    gpu: Arc<GpuContext>,
    timeout: Duration,
}

impl RtDeviceBuilder {
    pub fn new(gpu: Arc<GpuContext>) -> Self {
        Self {
            gpu,
            timeout: Duration::from_secs(300),
        }
    }

    /// Bound on every submission made through [`RtDevice::execute`].
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Create the device, allocator and command pool.
    ///
    /// Each stage destroys what the earlier stages created when it fails.
    pub fn build(self) -> Result<RtDevice> {
        let capabilities = check_support(self.gpu.capabilities().ray_tracing.as_ref())?;
        let instance = self.gpu.instance();
        let physical_device = self.gpu.physical_device();
        let queue_family = self.gpu.graphics_queue_family();

        let device = Arc::new(unsafe {
            create_device(
                instance,
                physical_device,
                queue_family,
                &RAY_TRACING_EXTENSIONS,
                true,
            )
        }?);

        let allocator =
            match unsafe { GpuAllocator::new(instance, Arc::clone(&device), physical_device) } {
                Ok(allocator) => allocator,
                Err(e) => {
                    unsafe { device.destroy_device(None) };
                    return Err(e);
                }
            };

        let command_pool = match unsafe {
            CommandPool::new(
                &device,
                queue_family,
                vk::CommandPoolCreateFlags::TRANSIENT
                    | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )
        } {
            Ok(pool) => pool,
            Err(e) => {
                let mut allocator = allocator;
                allocator.shutdown();
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };

        let queue = unsafe { device.get_device_queue(queue_family, 0) };
        let acceleration_structure =
            ash::khr::acceleration_structure::Device::new(instance, &device);
        let ray_tracing_pipeline = ash::khr::ray_tracing_pipeline::Device::new(instance, &device);

        tracing::info!(
            "Ray tracing device ready (max recursion {}, handle size {})",
            capabilities.max_ray_recursion_depth,
            capabilities.shader_group_handle_size
        );

        Ok(RtDevice {
            gpu: self.gpu,
            device,
            queue,
            command_pool,
            allocator: Mutex::new(allocator),
            acceleration_structure,
            ray_tracing_pipeline,
            capabilities,
            timeout: self.timeout,
        })
    }
}

/// The integrator's logical device and the objects bound to it.
pub struct RtDevice {
    /// Keeps the instance alive for as long as this device exists.
    gpu: Arc<GpuContext>,
    device: Arc<ash::Device>,
    queue: vk::Queue,
    command_pool: CommandPool,
    allocator: Mutex<GpuAllocator>,
    acceleration_structure: ash::khr::acceleration_structure::Device,
    ray_tracing_pipeline: ash::khr::ray_tracing_pipeline::Device,
    capabilities: RayTracingCapabilities,
    timeout: Duration,
}

impl RtDevice {
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn gpu(&self) -> &Arc<GpuContext> {
        &self.gpu
    }

    pub fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    pub fn acceleration_structure(&self) -> &ash::khr::acceleration_structure::Device {
        &self.acceleration_structure
    }

    pub fn ray_tracing_pipeline(&self) -> &ash::khr::ray_tracing_pipeline::Device {
        &self.ray_tracing_pipeline
    }

    pub const fn capabilities(&self) -> &RayTracingCapabilities {
        &self.capabilities
    }

    /// Record with `f` and run the commands to completion.
    pub fn execute<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer) -> Result<()>,
    {
        unsafe {
            execute_single_time_commands(
                &self.device,
                &self.command_pool,
                self.queue,
                self.timeout,
                f,
            )
        }
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for RtDevice {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            tracing::warn!("Ray tracing device idle wait failed during teardown: {e}");
        }
        unsafe { self.command_pool.destroy(&self.device) };
        self.allocator.lock().shutdown();
        unsafe { self.device.destroy_device(None) };
        tracing::debug!("Ray tracing device destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(depth: u32) -> RayTracingCapabilities {
        RayTracingCapabilities {
            max_ray_recursion_depth: depth,
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
            min_scratch_offset_alignment: 128,
        }
    }

    #[test]
    fn missing_extensions_are_unsupported() {
        assert!(matches!(
            check_support(None),
            Err(GpuError::RayTracingUnsupported(names)) if names.contains("VK_KHR_ray_tracing_pipeline")
        ));
    }

    #[test]
    fn shallow_recursion_is_rejected() {
        assert!(matches!(
            check_support(Some(&capabilities(1))),
            Err(GpuError::InsufficientRecursionDepth {
                available: 1,
                required: 2
            })
        ));
        assert!(check_support(Some(&capabilities(31))).is_ok());
    }

    #[test]
    #[ignore = "Requires GPU hardware with ray tracing"]
    fn builds_on_capable_hardware() {
        let gpu = Arc::new(
            prism_gpu::GpuContextBuilder::new()
                .headless()
                .build()
                .expect("gpu context"),
        );
        let device = RtDeviceBuilder::new(gpu).build().expect("rt device");
        assert!(device.capabilities().max_ray_recursion_depth >= 2);
    }
}
