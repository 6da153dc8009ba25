//! Acceleration structures built for a single render.
//!
//! One triangle BLAS per planned instance, one TLAS over all of them, and a
//! shared scratch buffer carved into per-build regions. Everything is
//! created at the start of a render and destroyed at its end; the
//! [`AsTracker`] makes the balance observable.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use prism_core::math::align_up;
use prism_core::{MeshData, Vertex};
use prism_gpu::{GpuAllocator, GpuBuffer, GpuError, Result};

use crate::plan::{instance, InstancePlan};

/// Counts live acceleration structures.
#[derive(Clone, Debug, Default)]
pub struct AsTracker {
    live: Arc<AtomicUsize>,
}

impl AsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn created(&self) {
        self.live.fetch_add(1, Ordering::Relaxed);
    }

    fn destroyed(&self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    /// Acceleration structures created and not yet destroyed.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Log any structures that outlived their render. Returns the live count.
    pub fn report_leaks(&self) -> usize {
        let live = self.live();
        if live != 0 {
            tracing::error!("{live} acceleration structures still alive after render");
        }
        live
    }
}

const GEOMETRY_BUFFER_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR.as_raw()
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS.as_raw()
        | vk::BufferUsageFlags::STORAGE_BUFFER.as_raw(),
);

/// Create the acceleration structure object and its backing buffer.
unsafe fn create_structure(
    allocator: &mut GpuAllocator,
    as_loader: &ash::khr::acceleration_structure::Device,
    ty: vk::AccelerationStructureTypeKHR,
    size: u64,
    name: &str,
) -> Result<(vk::AccelerationStructureKHR, GpuBuffer, vk::DeviceAddress)> {
    let mut buffer = allocator.create_buffer(
        size,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryLocation::GpuOnly,
        name,
    )?;
    let create_info = vk::AccelerationStructureCreateInfoKHR::default()
        .buffer(buffer.buffer)
        .size(size)
        .ty(ty);
    let structure = match as_loader.create_acceleration_structure(&create_info, None) {
        Ok(structure) => structure,
        Err(e) => {
            allocator.free_buffer(&mut buffer)?;
            return Err(e.into());
        }
    };
    let address_info =
        vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(structure);
    let address = as_loader.get_acceleration_structure_device_address(&address_info);
    Ok((structure, buffer, address))
}

/// Triangle BLAS over one object's mesh in object space.
pub struct MeshBlas {
    pub acceleration_structure: vk::AccelerationStructureKHR,
    pub buffer: GpuBuffer,
    /// Vertex data, also read by the closest-hit stage.
    pub vertex_buffer: GpuBuffer,
    pub index_buffer: GpuBuffer,
    pub device_address: vk::DeviceAddress,
    vertex_count: u32,
    primitive_count: u32,
    scratch_size: u64,
}

impl MeshBlas {
    /// Upload `mesh` and create an unbuilt BLAS sized for it.
    ///
    /// # Safety
    /// Device, allocator and loader must belong to the same logical device.
    pub unsafe fn new(
        device: &ash::Device,
        allocator: &mut GpuAllocator,
        as_loader: &ash::khr::acceleration_structure::Device,
        mesh: &MeshData,
        index: u32,
    ) -> Result<Self> {
        let mut vertex_buffer = allocator.create_buffer_with_data(
            mesh.vertices(),
            GEOMETRY_BUFFER_USAGE,
            &format!("rt_vertices_{index}"),
        )?;
        let mut index_buffer = match allocator.create_buffer_with_data(
            mesh.indices(),
            GEOMETRY_BUFFER_USAGE,
            &format!("rt_indices_{index}"),
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                allocator.free_buffer(&mut vertex_buffer)?;
                return Err(e);
            }
        };

        let vertex_count = mesh.vertices().len() as u32;
        let primitive_count = mesh.triangle_count();
        let geometry = triangles(device, &vertex_buffer, &index_buffer, vertex_count);
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(std::slice::from_ref(&geometry));
        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        as_loader.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &build_info,
            &[primitive_count],
            &mut sizes,
        );

        match create_structure(
            allocator,
            as_loader,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            sizes.acceleration_structure_size,
            &format!("blas_{index}"),
        ) {
            Ok((acceleration_structure, buffer, device_address)) => Ok(Self {
                acceleration_structure,
                buffer,
                vertex_buffer,
                index_buffer,
                device_address,
                vertex_count,
                primitive_count,
                scratch_size: sizes.build_scratch_size,
            }),
            Err(e) => {
                allocator.free_buffer(&mut vertex_buffer)?;
                allocator.free_buffer(&mut index_buffer)?;
                Err(e)
            }
        }
    }

    fn geometry(&self, device: &ash::Device) -> vk::AccelerationStructureGeometryKHR<'static> {
        triangles(device, &self.vertex_buffer, &self.index_buffer, self.vertex_count)
    }

    /// # Safety
    /// The BLAS must not be in use.
    pub unsafe fn destroy(
        mut self,
        as_loader: &ash::khr::acceleration_structure::Device,
        allocator: &mut GpuAllocator,
    ) -> Result<()> {
        as_loader.destroy_acceleration_structure(self.acceleration_structure, None);
        allocator.free_buffer(&mut self.buffer)?;
        allocator.free_buffer(&mut self.vertex_buffer)?;
        allocator.free_buffer(&mut self.index_buffer)?;
        Ok(())
    }
}

fn triangles(
    device: &ash::Device,
    vertices: &GpuBuffer,
    indices: &GpuBuffer,
    vertex_count: u32,
) -> vk::AccelerationStructureGeometryKHR<'static> {
    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
        .flags(vk::GeometryFlagsKHR::OPAQUE)
        .geometry(vk::AccelerationStructureGeometryDataKHR {
            triangles: vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                .vertex_format(vk::Format::R32G32B32_SFLOAT)
                .vertex_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: vertices.device_address(device),
                })
                .vertex_stride(u64::from(Vertex::STRIDE))
                .max_vertex(vertex_count.saturating_sub(1))
                .index_type(vk::IndexType::UINT32)
                .index_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: indices.device_address(device),
                }),
        })
}

/// TLAS over every planned instance.
pub struct Tlas {
    pub acceleration_structure: vk::AccelerationStructureKHR,
    pub buffer: GpuBuffer,
    pub instance_buffer: GpuBuffer,
    pub device_address: vk::DeviceAddress,
    instance_count: u32,
    scratch_size: u64,
}

impl Tlas {
    /// Write `instances` and create an unbuilt TLAS sized for them.
    ///
    /// # Safety
    /// Device, allocator and loader must belong to the same logical device.
    pub unsafe fn new(
        device: &ash::Device,
        allocator: &mut GpuAllocator,
        as_loader: &ash::khr::acceleration_structure::Device,
        instances: &[vk::AccelerationStructureInstanceKHR],
    ) -> Result<Self> {
        let byte_len = std::mem::size_of_val(instances);
        let mut instance_buffer = allocator.create_buffer(
            byte_len.max(1) as u64,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
            "tlas_instances",
        )?;
        let Some(ptr) = instance_buffer.mapped_ptr() else {
            allocator.free_buffer(&mut instance_buffer)?;
            return Err(GpuError::InvalidState("Instance buffer not mapped".to_string()));
        };
        std::ptr::copy_nonoverlapping(instances.as_ptr().cast::<u8>(), ptr, byte_len);

        let instance_count = instances.len() as u32;
        let geometry = instance_geometry(device, &instance_buffer);
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(std::slice::from_ref(&geometry));
        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        as_loader.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &build_info,
            &[instance_count],
            &mut sizes,
        );

        match create_structure(
            allocator,
            as_loader,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            sizes.acceleration_structure_size,
            "tlas",
        ) {
            Ok((acceleration_structure, buffer, device_address)) => Ok(Self {
                acceleration_structure,
                buffer,
                instance_buffer,
                device_address,
                instance_count,
                scratch_size: sizes.build_scratch_size,
            }),
            Err(e) => {
                allocator.free_buffer(&mut instance_buffer)?;
                Err(e)
            }
        }
    }

    pub const fn instance_count(&self) -> u32 {
        self.instance_count
    }

    /// # Safety
    /// The TLAS must not be in use.
    pub unsafe fn destroy(
        mut self,
        as_loader: &ash::khr::acceleration_structure::Device,
        allocator: &mut GpuAllocator,
    ) -> Result<()> {
        as_loader.destroy_acceleration_structure(self.acceleration_structure, None);
        allocator.free_buffer(&mut self.buffer)?;
        allocator.free_buffer(&mut self.instance_buffer)?;
        Ok(())
    }
}

fn instance_geometry(
    device: &ash::Device,
    instances: &GpuBuffer,
) -> vk::AccelerationStructureGeometryKHR<'static> {
    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .flags(vk::GeometryFlagsKHR::OPAQUE)
        .geometry(vk::AccelerationStructureGeometryDataKHR {
            instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                .array_of_pointers(false)
                .data(vk::DeviceOrHostAddressConstKHR {
                    device_address: instances.device_address(device),
                }),
        })
}

/// Byte offsets of each BLAS build inside the shared scratch buffer, and the
/// total size. The TLAS build reuses the buffer from offset 0 after a barrier.
pub fn scratch_layout(blas_sizes: &[u64], tlas_size: u64, alignment: u64) -> (Vec<u64>, u64) {
    let mut offsets = Vec::with_capacity(blas_sizes.len());
    let mut cursor = 0;
    for &size in blas_sizes {
        offsets.push(cursor);
        cursor = align_up(cursor + size, alignment);
    }
    (offsets, cursor.max(align_up(tlas_size, alignment)))
}

/// All acceleration structures of one render.
pub struct SceneAccelerationStructure {
    pub blases: Vec<MeshBlas>,
    pub tlas: Tlas,
    scratch_buffer: GpuBuffer,
    blas_scratch_offsets: Vec<u64>,
    scratch_alignment: u64,
    tracker: AsTracker,
}

impl SceneAccelerationStructure {
    /// Create one BLAS per plan and a TLAS over them. Nothing is built until
    /// [`Self::record_build`] runs.
    ///
    /// # Safety
    /// Device, allocator and loader must belong to the same logical device.
    pub unsafe fn new(
        device: &ash::Device,
        allocator: &mut GpuAllocator,
        as_loader: &ash::khr::acceleration_structure::Device,
        plans: &[InstancePlan],
        scratch_alignment: u64,
        tracker: &AsTracker,
    ) -> Result<Self> {
        let mut blases = Vec::with_capacity(plans.len());
        for plan in plans {
            match MeshBlas::new(device, allocator, as_loader, &plan.mesh, plan.blas_index) {
                Ok(blas) => {
                    tracker.created();
                    blases.push(blas);
                }
                Err(e) => {
                    destroy_blases(blases, as_loader, allocator, tracker);
                    return Err(e);
                }
            }
        }

        let instances: Vec<_> = plans
            .iter()
            .zip(&blases)
            .map(|(plan, blas)| instance(plan, blas.device_address))
            .collect();
        let tlas = match Tlas::new(device, allocator, as_loader, &instances) {
            Ok(tlas) => {
                tracker.created();
                tlas
            }
            Err(e) => {
                destroy_blases(blases, as_loader, allocator, tracker);
                return Err(e);
            }
        };

        let alignment = scratch_alignment.max(1);
        let sizes: Vec<u64> = blases.iter().map(|b| b.scratch_size).collect();
        let (blas_scratch_offsets, scratch_size) =
            scratch_layout(&sizes, tlas.scratch_size, alignment);
        // Extra room so the base address can be aligned up
        let scratch_buffer = match allocator.create_buffer(
            scratch_size + alignment,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            "as_scratch",
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                let _ = tlas.destroy(as_loader, allocator);
                tracker.destroyed();
                destroy_blases(blases, as_loader, allocator, tracker);
                return Err(e);
            }
        };

        tracing::debug!(
            "Acceleration structures: {} BLAS, {} instances, {} KiB scratch",
            blases.len(),
            instances.len(),
            scratch_size / 1024
        );

        Ok(Self {
            blases,
            tlas,
            scratch_buffer,
            blas_scratch_offsets,
            scratch_alignment: alignment,
            tracker: tracker.clone(),
        })
    }

    /// Record every BLAS build, a barrier, then the TLAS build.
    ///
    /// # Safety
    /// The command buffer must be recording on the same device.
    pub unsafe fn record_build(
        &self,
        device: &ash::Device,
        as_loader: &ash::khr::acceleration_structure::Device,
        cmd: vk::CommandBuffer,
    ) {
        let scratch_base = align_up(
            self.scratch_buffer.device_address(device),
            self.scratch_alignment,
        );

        let geometries: Vec<_> = self.blases.iter().map(|b| b.geometry(device)).collect();
        let build_infos: Vec<_> = self
            .blases
            .iter()
            .zip(&geometries)
            .zip(&self.blas_scratch_offsets)
            .map(|((blas, geometry), offset)| {
                vk::AccelerationStructureBuildGeometryInfoKHR::default()
                    .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
                    .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
                    .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                    .dst_acceleration_structure(blas.acceleration_structure)
                    .geometries(std::slice::from_ref(geometry))
                    .scratch_data(vk::DeviceOrHostAddressKHR {
                        device_address: scratch_base + offset,
                    })
            })
            .collect();
        let ranges: Vec<[vk::AccelerationStructureBuildRangeInfoKHR; 1]> = self
            .blases
            .iter()
            .map(|blas| [vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(blas.primitive_count)])
            .collect();
        let range_refs: Vec<&[vk::AccelerationStructureBuildRangeInfoKHR]> =
            ranges.iter().map(<[_; 1]>::as_slice).collect();
        as_loader.cmd_build_acceleration_structures(cmd, &build_infos, &range_refs);

        // BLAS writes and scratch reuse must finish before the TLAS build
        let barrier = vk::MemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
            .src_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR)
            .dst_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
            .dst_access_mask(
                vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR
                    | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
            );
        device.cmd_pipeline_barrier2(
            cmd,
            &vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier)),
        );

        let geometry = instance_geometry(device, &self.tlas.instance_buffer);
        let tlas_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .dst_acceleration_structure(self.tlas.acceleration_structure)
            .geometries(std::slice::from_ref(&geometry))
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch_base,
            });
        let tlas_range = vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(self.tlas.instance_count);
        as_loader.cmd_build_acceleration_structures(
            cmd,
            &[tlas_info],
            &[std::slice::from_ref(&tlas_range)],
        );
    }

    pub fn blas_count(&self) -> usize {
        self.blases.len()
    }

    /// # Safety
    /// None of the structures may be in use.
    pub unsafe fn destroy(
        mut self,
        as_loader: &ash::khr::acceleration_structure::Device,
        allocator: &mut GpuAllocator,
    ) -> Result<()> {
        let tracker = self.tracker.clone();
        let tlas_result = self.tlas.destroy(as_loader, allocator);
        tracker.destroyed();
        destroy_blases(self.blases, as_loader, allocator, &tracker);
        allocator.free_buffer(&mut self.scratch_buffer)?;
        tlas_result
    }
}

unsafe fn destroy_blases(
    blases: Vec<MeshBlas>,
    as_loader: &ash::khr::acceleration_structure::Device,
    allocator: &mut GpuAllocator,
    tracker: &AsTracker,
) {
    for blas in blases {
        if let Err(e) = blas.destroy(as_loader, allocator) {
            tracing::warn!("Failed to free BLAS memory: {e}");
        }
        tracker.destroyed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_counts_balance() {
        let tracker = AsTracker::new();
        let shared = tracker.clone();
        for _ in 0..3 {
            shared.created();
        }
        assert_eq!(tracker.live(), 3);
        for _ in 0..3 {
            shared.destroyed();
        }
        assert_eq!(tracker.live(), 0);
    }

    #[test]
    fn leaked_structures_are_reported_without_panicking() {
        let tracker = AsTracker::new();
        assert_eq!(tracker.report_leaks(), 0);
        tracker.created();
        tracker.created();
        tracker.destroyed();
        assert_eq!(tracker.report_leaks(), 1);
    }

    #[test]
    fn scratch_regions_do_not_overlap() {
        let (offsets, total) = scratch_layout(&[100, 300, 50], 64, 128);
        assert_eq!(offsets, vec![0, 128, 512]);
        assert_eq!(total, 640);
        for (offset, size) in offsets.iter().zip([100, 300, 50]) {
            assert_eq!(offset % 128, 0);
            assert!(offset + size <= total);
        }
    }

    #[test]
    fn scratch_fits_a_larger_tlas_build() {
        let (offsets, total) = scratch_layout(&[16], 1000, 256);
        assert_eq!(offsets, vec![0]);
        assert_eq!(total, 1024);
    }
}
