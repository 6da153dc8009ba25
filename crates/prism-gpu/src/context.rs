//! GPU context management.

use crate::capabilities::GpuCapabilities;
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device};
use crate::memory::GpuAllocator;
use ash::vk;
use parking_lot::Mutex;
use std::ffi::CStr;
use std::sync::Arc;

/// Raster-side GPU context: instance, physical device, logical device and
/// graphics queue.
///
/// The ray-traced integrator creates a second logical device against the same
/// instance and physical device, see [`GpuContext::instance`].
pub struct GpuContext {
    // Entry must outlive the instance
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) capabilities: GpuCapabilities,
    pub(crate) allocator: Mutex<GpuAllocator>,
    pub(crate) graphics_queue_family: u32,
    pub(crate) graphics_queue: vk::Queue,
    pub(crate) presentable: bool,
}

impl GpuContext {
    /// Get the Vulkan entry point.
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Shared handle to the device, for objects that outlive a borrow.
    pub fn device_arc(&self) -> Arc<ash::Device> {
        Arc::clone(&self.device)
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get GPU capabilities.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Get the graphics queue.
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Get the graphics queue family index.
    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Whether the swapchain extension was enabled.
    pub fn is_presentable(&self) -> bool {
        self.presentable
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    /// Wait for the whole device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        match unsafe { self.device.device_wait_idle() } {
            Ok(()) => Ok(()),
            Err(vk::Result::ERROR_DEVICE_LOST) => Err(GpuError::DeviceLost),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Frees every VkDeviceMemory, so it must precede device destruction
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
        tracing::debug!("GPU context destroyed");
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
    presentable: bool,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Prism".to_string(),
            enable_validation: cfg!(debug_assertions),
            presentable: true,
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    #[must_use]
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    #[must_use]
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Build without surface or swapchain support.
    #[must_use]
    pub fn headless(mut self) -> Self {
        self.presentable = false;
        self
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<GpuContext> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| GpuError::Loading(e.to_string()))?;

        let instance = unsafe {
            create_instance(&entry, &self.app_name, self.enable_validation, self.presentable)
        }?;

        // Everything after instance creation must destroy it on failure
        match unsafe { self.build_device(&instance) } {
            Ok((physical_device, capabilities, device, family, queue, allocator)) => {
                Ok(GpuContext {
                    entry,
                    instance,
                    physical_device,
                    device,
                    capabilities,
                    allocator: Mutex::new(allocator),
                    graphics_queue_family: family,
                    graphics_queue: queue,
                    presentable: self.presentable,
                })
            }
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                Err(e)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    unsafe fn build_device(
        &self,
        instance: &ash::Instance,
    ) -> Result<(
        vk::PhysicalDevice,
        GpuCapabilities,
        Arc<ash::Device>,
        u32,
        vk::Queue,
        GpuAllocator,
    )> {
        let physical_device = select_physical_device(instance)?;
        let capabilities = GpuCapabilities::query(instance, physical_device);
        if !capabilities.meets_requirements() {
            return Err(GpuError::NoSuitableDevice);
        }
        tracing::info!("Selected GPU: {}", capabilities.summary());

        let family = find_graphics_queue_family(instance, physical_device)?;
        let extensions = if self.presentable {
            vec![ash::khr::swapchain::NAME]
        } else {
            Vec::new()
        };
        let device = Arc::new(create_device(
            instance,
            physical_device,
            family,
            &extensions,
            false,
        )?);
        let queue = device.get_device_queue(family, 0);

        match GpuAllocator::new(instance, Arc::clone(&device), physical_device) {
            Ok(allocator) => Ok((physical_device, capabilities, device, family, queue, allocator)),
            Err(e) => {
                device.destroy_device(None);
                Err(e)
            }
        }
    }
}

/// Find the first queue family with graphics and compute support.
///
/// # Safety
/// The instance and physical device must be valid.
pub unsafe fn find_graphics_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<u32> {
    instance
        .get_physical_device_queue_family_properties(physical_device)
        .iter()
        .position(|family| {
            family
                .queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        })
        .map(|i| i as u32)
        .ok_or(GpuError::NoSuitableDevice)
}

/// Create a logical device with one queue on `queue_family`.
///
/// Vulkan 1.2 features every Prism device enables. `PARTIALLY_BOUND`
/// texture arrays depend on `descriptor_binding_partially_bound`.
fn vulkan_1_2_features() -> vk::PhysicalDeviceVulkan12Features<'static> {
    vk::PhysicalDeviceVulkan12Features::default()
        .buffer_device_address(true)
        .descriptor_indexing(true)
        .scalar_block_layout(true)
        .runtime_descriptor_array(true)
        .shader_sampled_image_array_non_uniform_indexing(true)
        .descriptor_binding_partially_bound(true)
}

/// Enables the Vulkan 1.3 dynamic rendering and synchronization2 features
/// plus the Vulkan 1.2 buffer device address and descriptor indexing
/// features. With `ray_tracing` the acceleration structure and ray tracing
/// pipeline features are chained as well; the caller supplies the matching
/// extensions.
///
/// # Safety
/// The instance and physical device must be valid.
pub unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
    extensions: &[&CStr],
    ray_tracing: bool,
) -> Result<ash::Device> {
    let queue_priority = [1.0_f32];
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(&queue_priority)];

    let extension_names: Vec<*const i8> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true)
        .maintenance4(true);

    let mut vulkan_1_2_features = vulkan_1_2_features();

    let features = vk::PhysicalDeviceFeatures::default()
        .shader_int64(true)
        .sampler_anisotropy(true)
        .sample_rate_shading(true);

    let mut acceleration_structure_features =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default().acceleration_structure(true);
    let mut ray_tracing_pipeline_features =
        vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .features(features)
        .push_next(&mut vulkan_1_3_features)
        .push_next(&mut vulkan_1_2_features);
    if ray_tracing {
        features2 = features2
            .push_next(&mut acceleration_structure_features)
            .push_next(&mut ray_tracing_pipeline_features);
    }

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    Ok(instance.create_device(physical_device, &device_create_info, None)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texture_arrays_may_be_partially_bound() {
        let features = vulkan_1_2_features();
        assert_eq!(features.descriptor_binding_partially_bound, vk::TRUE);
        assert_eq!(features.runtime_descriptor_array, vk::TRUE);
        assert_eq!(features.buffer_device_address, vk::TRUE);
    }
}
