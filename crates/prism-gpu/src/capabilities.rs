//! GPU capability detection.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Extensions the ray-traced integrator device enables.
pub const RAY_TRACING_EXTENSIONS: [&CStr; 3] = [
    ash::khr::acceleration_structure::NAME,
    ash::khr::ray_tracing_pipeline::NAME,
    ash::khr::deferred_host_operations::NAME,
];

/// Ray tracing pipeline limits, present only when the extensions are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RayTracingCapabilities {
    pub max_ray_recursion_depth: u32,
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub min_scratch_offset_alignment: u32,
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    /// Dynamic rendering and synchronization2 (VK 1.3 core)
    pub has_vulkan_1_3: bool,
    /// Buffer device address support
    pub supports_buffer_device_address: bool,
    /// Descriptor indexing support
    pub supports_descriptor_indexing: bool,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,

    /// `minUniformBufferOffsetAlignment`, used for dynamic uniform blocks
    pub min_uniform_buffer_offset_alignment: u64,
    /// `optimalBufferCopyRowPitchAlignment`
    pub optimal_buffer_copy_row_pitch_alignment: u64,
    /// Sample counts supported by both color and depth framebuffers
    pub framebuffer_sample_counts: vk::SampleCountFlags,

    /// Ray tracing limits, `None` when the extension set is missing
    pub ray_tracing: Option<RayTracingCapabilities>,

    // Available extensions
    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let available_extensions: HashSet<String> = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default()
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let vendor = GpuVendor::from_vendor_id(properties.vendor_id);
        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let api_version = properties.api_version;
        let has_vulkan_1_3 = vk::api_version_major(api_version) > 1
            || (vk::api_version_major(api_version) == 1 && vk::api_version_minor(api_version) >= 3);

        let has_rt_extensions = RAY_TRACING_EXTENSIONS.iter().all(|name| {
            name.to_str()
                .is_ok_and(|name| available_extensions.contains(name))
        });
        let ray_tracing = has_rt_extensions.then(|| query_ray_tracing(instance, physical_device));

        let limits = properties.limits;
        Self {
            vendor,
            device_name,
            api_version,
            driver_version: properties.driver_version,
            has_vulkan_1_3,
            supports_buffer_device_address: has_vulkan_1_3
                || available_extensions.contains("VK_KHR_buffer_device_address"),
            supports_descriptor_indexing: has_vulkan_1_3
                || available_extensions.contains("VK_EXT_descriptor_indexing"),
            device_local_memory_mb,
            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
            optimal_buffer_copy_row_pitch_alignment: limits.optimal_buffer_copy_row_pitch_alignment,
            framebuffer_sample_counts: limits.framebuffer_color_sample_counts
                & limits.framebuffer_depth_sample_counts,
            ray_tracing,
            available_extensions,
        }
    }

    /// Check if the GPU meets minimum requirements for the raster renderer.
    pub fn meets_requirements(&self) -> bool {
        self.has_vulkan_1_3 && self.supports_buffer_device_address
    }

    /// Largest supported sample count not above `requested`.
    pub fn clamp_samples(&self, requested: vk::SampleCountFlags) -> vk::SampleCountFlags {
        [
            vk::SampleCountFlags::TYPE_8,
            vk::SampleCountFlags::TYPE_4,
            vk::SampleCountFlags::TYPE_2,
        ]
        .into_iter()
        .find(|&count| {
            count.as_raw() <= requested.as_raw() && self.framebuffer_sample_counts.contains(count)
        })
        .unwrap_or(vk::SampleCountFlags::TYPE_1)
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM - ray tracing: {}",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            if self.ray_tracing.is_some() { "yes" } else { "no" },
        )
    }
}

unsafe fn query_ray_tracing(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> RayTracingCapabilities {
    let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
    let mut as_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
    let mut props2 = vk::PhysicalDeviceProperties2::default()
        .push_next(&mut rt_props)
        .push_next(&mut as_props);
    instance.get_physical_device_properties2(physical_device, &mut props2);

    RayTracingCapabilities {
        max_ray_recursion_depth: rt_props.max_ray_recursion_depth,
        shader_group_handle_size: rt_props.shader_group_handle_size,
        shader_group_handle_alignment: rt_props.shader_group_handle_alignment,
        shader_group_base_alignment: rt_props.shader_group_base_alignment,
        min_scratch_offset_alignment: as_props
            .min_acceleration_structure_scratch_offset_alignment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps_with_samples(samples: vk::SampleCountFlags) -> GpuCapabilities {
        GpuCapabilities {
            vendor: GpuVendor::Other(0),
            device_name: "test".to_string(),
            api_version: vk::API_VERSION_1_3,
            driver_version: 0,
            has_vulkan_1_3: true,
            supports_buffer_device_address: true,
            supports_descriptor_indexing: true,
            device_local_memory_mb: 4096,
            min_uniform_buffer_offset_alignment: 256,
            optimal_buffer_copy_row_pitch_alignment: 1,
            framebuffer_sample_counts: samples,
            ray_tracing: None,
            available_extensions: HashSet::new(),
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
    }

    #[test]
    fn samples_clamp_to_supported() {
        let caps = caps_with_samples(
            vk::SampleCountFlags::TYPE_1 | vk::SampleCountFlags::TYPE_2 | vk::SampleCountFlags::TYPE_4,
        );
        assert_eq!(caps.clamp_samples(vk::SampleCountFlags::TYPE_8), vk::SampleCountFlags::TYPE_4);
        assert_eq!(caps.clamp_samples(vk::SampleCountFlags::TYPE_2), vk::SampleCountFlags::TYPE_2);
        assert_eq!(caps.clamp_samples(vk::SampleCountFlags::TYPE_1), vk::SampleCountFlags::TYPE_1);
    }

    #[test]
    fn requirements_need_vulkan_1_3() {
        let mut caps = caps_with_samples(vk::SampleCountFlags::TYPE_1);
        assert!(caps.meets_requirements());
        caps.has_vulkan_1_3 = false;
        assert!(!caps.meets_requirements());
    }
}
