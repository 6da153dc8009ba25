//! Shader binding table for the path integrator pipeline.
//!
//! Group order in the pipeline, and therefore in the table:
//! - 0: ray generation
//! - 1: radiance miss
//! - 2: shadow miss
//! - 3: triangle hit group (closest hit only)
//!
//! The callable region is empty.

use ash::vk;
use gpu_allocator::MemoryLocation;
use prism_core::math::align_up;
use prism_gpu::{GpuAllocator, GpuBuffer, RayTracingCapabilities, Result};

pub const RAYGEN_GROUPS: u32 = 1;
pub const MISS_GROUPS: u32 = 2;
pub const HIT_GROUPS: u32 = 1;
pub const GROUP_COUNT: u32 = RAYGEN_GROUPS + MISS_GROUPS + HIT_GROUPS;

/// Byte layout of the table, independent of any device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SbtLayout {
    pub handle_size: u64,
    /// Handle size rounded up to the handle alignment.
    pub stride: u64,
    pub raygen_size: u64,
    pub miss_size: u64,
    pub hit_size: u64,
}

impl SbtLayout {
    pub fn new(capabilities: &RayTracingCapabilities) -> Self {
        let handle_size = u64::from(capabilities.shader_group_handle_size);
        let stride = align_up(
            handle_size,
            u64::from(capabilities.shader_group_handle_alignment),
        );
        let base = u64::from(capabilities.shader_group_base_alignment);
        Self {
            handle_size,
            stride,
            raygen_size: align_up(stride * u64::from(RAYGEN_GROUPS), base),
            miss_size: align_up(stride * u64::from(MISS_GROUPS), base),
            hit_size: align_up(stride * u64::from(HIT_GROUPS), base),
        }
    }

    pub const fn total_size(&self) -> u64 {
        self.raygen_size + self.miss_size + self.hit_size
    }

    pub const fn miss_offset(&self) -> u64 {
        self.raygen_size
    }

    pub const fn hit_offset(&self) -> u64 {
        self.raygen_size + self.miss_size
    }

    /// Destination offset of each group's handle, in group order.
    pub fn handle_offsets(&self) -> Vec<u64> {
        let raygen = (0..RAYGEN_GROUPS).map(|i| u64::from(i) * self.stride);
        let miss = (0..MISS_GROUPS).map(|i| self.miss_offset() + u64::from(i) * self.stride);
        let hit = (0..HIT_GROUPS).map(|i| self.hit_offset() + u64::from(i) * self.stride);
        raygen.chain(miss).chain(hit).collect()
    }

    /// Raygen, miss, hit and callable regions for a table at `base_address`.
    pub const fn regions(&self, base_address: vk::DeviceAddress) -> [vk::StridedDeviceAddressRegionKHR; 4] {
        [
            // The raygen region size must equal its stride
            vk::StridedDeviceAddressRegionKHR {
                device_address: base_address,
                stride: self.stride,
                size: self.stride,
            },
            vk::StridedDeviceAddressRegionKHR {
                device_address: base_address + self.miss_offset(),
                stride: self.stride,
                size: self.miss_size,
            },
            vk::StridedDeviceAddressRegionKHR {
                device_address: base_address + self.hit_offset(),
                stride: self.stride,
                size: self.hit_size,
            },
            vk::StridedDeviceAddressRegionKHR {
                device_address: 0,
                stride: 0,
                size: 0,
            },
        ]
    }
}

/// Host-visible table filled with the pipeline's group handles.
pub struct ShaderBindingTable {
    pub buffer: GpuBuffer,
    pub raygen_region: vk::StridedDeviceAddressRegionKHR,
    pub miss_region: vk::StridedDeviceAddressRegionKHR,
    pub hit_region: vk::StridedDeviceAddressRegionKHR,
    pub callable_region: vk::StridedDeviceAddressRegionKHR,
}

impl ShaderBindingTable {
    /// # Safety
    /// `pipeline` must be a ray tracing pipeline created on `device` with
    /// [`GROUP_COUNT`] groups.
    pub unsafe fn new(
        device: &ash::Device,
        rt_loader: &ash::khr::ray_tracing_pipeline::Device,
        allocator: &mut GpuAllocator,
        pipeline: vk::Pipeline,
        capabilities: &RayTracingCapabilities,
    ) -> Result<Self> {
        let layout = SbtLayout::new(capabilities);
        let handle_size = layout.handle_size as usize;
        let handles = rt_loader.get_ray_tracing_shader_group_handles(
            pipeline,
            0,
            GROUP_COUNT,
            handle_size * GROUP_COUNT as usize,
        )?;

        let mut buffer = allocator.create_buffer(
            layout.total_size(),
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
            "shader_binding_table",
        )?;
        for (handle, offset) in handles.chunks_exact(handle_size).zip(layout.handle_offsets()) {
            if let Err(e) = buffer.write_bytes(offset, handle) {
                allocator.free_buffer(&mut buffer)?;
                return Err(e);
            }
        }

        let [raygen_region, miss_region, hit_region, callable_region] =
            layout.regions(buffer.device_address(device));
        Ok(Self {
            buffer,
            raygen_region,
            miss_region,
            hit_region,
            callable_region,
        })
    }

    /// # Safety
    /// The table must not be in use.
    pub unsafe fn destroy(mut self, allocator: &mut GpuAllocator) -> Result<()> {
        allocator.free_buffer(&mut self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(handle: u32, handle_alignment: u32, base: u32) -> RayTracingCapabilities {
        RayTracingCapabilities {
            max_ray_recursion_depth: 31,
            shader_group_handle_size: handle,
            shader_group_handle_alignment: handle_alignment,
            shader_group_base_alignment: base,
            min_scratch_offset_alignment: 128,
        }
    }

    #[test]
    fn regions_are_base_aligned() {
        let layout = SbtLayout::new(&capabilities(32, 32, 64));
        assert_eq!(layout.stride, 32);
        assert_eq!(layout.raygen_size, 64);
        assert_eq!(layout.miss_size, 64);
        assert_eq!(layout.hit_size, 64);
        assert_eq!(layout.total_size(), 192);

        let [raygen, miss, hit, callable] = layout.regions(0x1000);
        assert_eq!(raygen.size, raygen.stride);
        assert_eq!(miss.device_address, 0x1040);
        assert_eq!(hit.device_address, 0x1080);
        assert_eq!(callable.size, 0);
    }

    #[test]
    fn handles_land_in_their_regions() {
        let layout = SbtLayout::new(&capabilities(32, 32, 64));
        assert_eq!(layout.handle_offsets(), vec![0, 64, 96, 128]);
    }

    #[test]
    fn two_miss_handles_can_spill_into_larger_region() {
        // 48-byte handles aligned to 64 give a 128-byte miss region
        let layout = SbtLayout::new(&capabilities(48, 64, 64));
        assert_eq!(layout.stride, 64);
        assert_eq!(layout.miss_size, 128);
        assert_eq!(layout.hit_offset(), 64 + 128);
        assert_eq!(layout.handle_offsets()[2], 128);
    }
}
