//! One-shot path traced renders to disk.
//!
//! [`PathTracer`] owns the integrator device, pipeline and shader binding
//! table for its whole life. Everything scene dependent (acceleration
//! structures, uniforms, output and readback images) lives only for the
//! duration of one [`PathTracer::render`] call.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ash::vk;
use gpu_allocator::MemoryLocation;
use prism_core::{RenderSettings, SceneSnapshot};
use prism_gpu::image::{create_image_view, create_sampler};
use prism_gpu::sync::{color_range, image_barrier, memory_barrier};
use prism_gpu::{
    descriptors, DescriptorPool, GpuBuffer, GpuContext, GpuError, GpuImage, ImageTransition,
    SamplerKind,
};
use prism_render::EquirectImage;

use crate::acceleration::{AsTracker, SceneAccelerationStructure};
use crate::device::{RtDevice, RtDeviceBuilder};
use crate::error::{Result, RtError};
use crate::output::write_image;
use crate::pipeline::PathPipeline;
use crate::plan::{plan_instances, InstancePlan, ObjectDescription, SceneResolver};
use crate::sbt::ShaderBindingTable;
use crate::uniforms::TraceUniforms;

const OUTPUT_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;
const TEXEL_SIZE: u64 = 16;

/// Integrator lifecycle.
///
/// `Uninitialized → Initialized`, then per render
/// `Building → Traced → Idle`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntegratorState {
    Uninitialized,
    Initialized,
    Building,
    Traced,
    Idle,
}

impl IntegratorState {
    /// Whether a new render may start.
    pub const fn can_render(self) -> bool {
        matches!(self, Self::Initialized | Self::Idle)
    }

    fn begin(self) -> Result<Self> {
        if self.can_render() {
            Ok(Self::Building)
        } else {
            Err(RtError::InvalidState(self))
        }
    }
}

/// Outcome of a successful render.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderReport {
    pub elapsed: Duration,
    pub blas_count: usize,
    pub tlas_instance_count: u32,
    pub path: PathBuf,
}

/// Hardware path integrator on its own logical device.
pub struct PathTracer {
    state: IntegratorState,
    pipeline: Option<PathPipeline>,
    sbt: Option<ShaderBindingTable>,
    environment_sampler: vk::Sampler,
    tracker: AsTracker,
    renders: u32,
    device: RtDevice,
}

impl PathTracer {
    /// Create the integrator device, pipeline and shader binding table.
    ///
    /// Fails with [`GpuError::RayTracingUnsupported`] or
    /// [`GpuError::InsufficientRecursionDepth`] on hardware that cannot run
    /// the integrator.
    pub fn new(gpu: Arc<GpuContext>) -> Result<Self> {
        let device = RtDeviceBuilder::new(gpu).build()?;
        // Partially built tracers are torn down by Drop
        let mut tracer = Self {
            state: IntegratorState::Uninitialized,
            pipeline: None,
            sbt: None,
            environment_sampler: vk::Sampler::null(),
            tracker: AsTracker::new(),
            renders: 0,
            device,
        };

        let pipeline =
            unsafe { PathPipeline::new(tracer.device.device(), tracer.device.ray_tracing_pipeline()) }?;
        let pipeline_handle = pipeline.pipeline;
        tracer.pipeline = Some(pipeline);

        let sbt = unsafe {
            ShaderBindingTable::new(
                tracer.device.device(),
                tracer.device.ray_tracing_pipeline(),
                &mut tracer.device.allocator().lock(),
                pipeline_handle,
                tracer.device.capabilities(),
            )
        }?;
        tracer.sbt = Some(sbt);

        // Float equirect sources are not guaranteed to be filterable
        tracer.environment_sampler =
            unsafe { create_sampler(tracer.device.device(), SamplerKind::Nearest, 0.0) }?;

        tracer.state = IntegratorState::Initialized;
        tracing::info!("Path tracer initialized");
        Ok(tracer)
    }

    pub const fn state(&self) -> IntegratorState {
        self.state
    }

    /// Live acceleration structure counter. Zero between renders.
    pub fn tracker(&self) -> &AsTracker {
        &self.tracker
    }

    /// Trace `scene` and write the result to `settings.output`.
    ///
    /// Returns `Ok(None)` without writing anything when no object carries a
    /// resolvable mesh.
    pub fn render(
        &mut self,
        scene: &SceneSnapshot,
        resolver: &impl SceneResolver,
        environment: Option<&EquirectImage>,
        settings: &RenderSettings,
    ) -> Result<Option<RenderReport>> {
        let _span = tracing::info_span!(
            "path_trace",
            width = settings.width,
            height = settings.height,
            samples = settings.samples,
            max_depth = settings.max_depth
        )
        .entered();
        settings.validate()?;

        let start = Instant::now();
        let plans = plan_instances(&scene.objects, resolver);
        if plans.is_empty() {
            tracing::warn!("Nothing to trace: scene has no mesh-bearing objects");
            return Ok(None);
        }

        self.state = self.state.begin()?;
        self.renders = self.renders.wrapping_add(1);
        let uniforms = TraceUniforms::new(scene, settings, environment.is_some(), self.renders);

        let mut transient = Transient::default();
        let traced = self.trace(&plans, &uniforms, environment, settings, &mut transient);
        let released = unsafe { transient.destroy(&self.device) };
        self.state = IntegratorState::Idle;
        self.tracker.report_leaks();

        let (pixels, blas_count, tlas_instance_count) = traced?;
        released?;

        write_image(
            &pixels,
            settings.width,
            settings.height,
            settings.format,
            &settings.output,
        )?;

        let report = RenderReport {
            elapsed: start.elapsed(),
            blas_count,
            tlas_instance_count,
            path: settings.output.clone(),
        };
        tracing::info!(
            "Traced {} instances in {:.2?} to {}",
            report.tlas_instance_count,
            report.elapsed,
            report.path.display()
        );
        Ok(Some(report))
    }

    /// Build, dispatch and read back. Every resource created here is
    /// registered in `transient` before anything else can fail.
    fn trace(
        &mut self,
        plans: &[InstancePlan],
        uniforms: &TraceUniforms,
        environment: Option<&EquirectImage>,
        settings: &RenderSettings,
        transient: &mut Transient,
    ) -> Result<(Vec<f32>, usize, u32)> {
        let (Some(pipeline), Some(sbt)) = (self.pipeline.as_ref(), self.sbt.as_ref()) else {
            return Err(RtError::InvalidState(self.state));
        };
        let rt = &self.device;
        let device = rt.device();
        let (width, height) = (settings.width, settings.height);

        let fallback;
        let environment = match environment {
            Some(image) => image,
            None => {
                fallback = EquirectImage::uniform([0.0, 0.0, 0.0, 1.0]);
                &fallback
            }
        };

        let expected = environment.width as usize * environment.height as usize * 4;
        if environment.pixels.len() != expected {
            return Err(prism_core::Error::InvalidData(format!(
                "Environment has {} floats, expected {expected}",
                environment.pixels.len()
            ))
            .into());
        }

        let mut allocator = rt.allocator().lock();
        let scene_as = unsafe {
            SceneAccelerationStructure::new(
                device,
                &mut allocator,
                rt.acceleration_structure(),
                plans,
                u64::from(rt.capabilities().min_scratch_offset_alignment),
                &self.tracker,
            )
        }?;
        let rows: Vec<ObjectDescription> = plans
            .iter()
            .zip(&scene_as.blases)
            .map(|(plan, blas)| {
                ObjectDescription::new(
                    &plan.material,
                    blas.vertex_buffer.device_address(device),
                    blas.index_buffer.device_address(device),
                )
            })
            .collect();
        let tlas = scene_as.tlas.acceleration_structure;
        let blas_count = scene_as.blas_count();
        let tlas_instance_count = scene_as.tlas.instance_count();
        transient.scene = Some(scene_as);

        let descriptions_range = rows.len() as u64 * ObjectDescription::SIZE;
        let descriptions = transient.buffer(allocator.create_buffer_with_data(
            &rows,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            "rt_object_descriptions",
        )?);
        let uniform_buffer = transient.buffer(allocator.create_buffer_with_data(
            std::slice::from_ref(uniforms),
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            "rt_uniforms",
        )?);
        let readback = transient.buffers.len();
        transient.buffer(allocator.create_buffer(
            u64::from(width) * u64::from(height) * TEXEL_SIZE,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
            "rt_readback",
        )?);
        let env_staging = transient.buffer(allocator.create_buffer_with_data(
            &environment.pixels,
            vk::BufferUsageFlags::TRANSFER_SRC,
            "rt_environment_staging",
        )?);
        drop(allocator);

        let output = transient.image(
            rt,
            vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
            "rt_output",
        )?;
        let env_image = transient.image(
            rt,
            vk::Extent3D {
                width: environment.width,
                height: environment.height,
                depth: 1,
            },
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            "rt_environment",
        )?;

        let pool = unsafe {
            DescriptorPool::new(
                device,
                1,
                &[
                    pool_size(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR),
                    pool_size(vk::DescriptorType::STORAGE_IMAGE),
                    pool_size(vk::DescriptorType::UNIFORM_BUFFER),
                    pool_size(vk::DescriptorType::STORAGE_BUFFER),
                    pool_size(vk::DescriptorType::COMBINED_IMAGE_SAMPLER),
                ],
            )
        }?;
        let pool = transient.descriptor_pool.insert(pool);
        let set = unsafe { pool.allocate_one(device, pipeline.set_layout) }?;
        unsafe {
            descriptors::write_acceleration_structure(device, set, 0, tlas);
            descriptors::write_storage_image(device, set, 1, output.1, vk::ImageLayout::GENERAL);
            descriptors::write_uniform_buffer(device, set, 2, uniform_buffer, TraceUniforms::SIZE);
            descriptors::write_storage_buffer(device, set, 3, descriptions, descriptions_range);
            descriptors::write_sampled_images(
                device,
                set,
                4,
                0,
                &[(env_image.1, self.environment_sampler)],
            );
        }

        let readback_buffer = transient.buffers[readback].buffer;
        let scene_as = transient
            .scene
            .as_ref()
            .ok_or(RtError::InvalidState(self.state))?;
        rt.execute(|cmd| unsafe {
            upload_environment(device, cmd, env_staging, env_image.0, environment);
            scene_as.record_build(device, rt.acceleration_structure(), cmd);
            memory_barrier(
                device,
                cmd,
                (
                    vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
                    vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
                ),
                (
                    vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
                    vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
                ),
            );
            image_barrier(
                device,
                cmd,
                output.0,
                color_range(0, 1, 1),
                ImageTransition::discard(
                    vk::ImageLayout::GENERAL,
                    vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
                    vk::AccessFlags2::SHADER_STORAGE_WRITE,
                ),
            );

            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, pipeline.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                pipeline.layout,
                0,
                &[set],
                &[],
            );
            rt.ray_tracing_pipeline().cmd_trace_rays(
                cmd,
                &sbt.raygen_region,
                &sbt.miss_region,
                &sbt.hit_region,
                &sbt.callable_region,
                width,
                height,
                1,
            );

            image_barrier(
                device,
                cmd,
                output.0,
                color_range(0, 1, 1),
                ImageTransition {
                    old_layout: vk::ImageLayout::GENERAL,
                    new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    src_stage: vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
                    src_access: vk::AccessFlags2::SHADER_STORAGE_WRITE,
                    dst_stage: vk::PipelineStageFlags2::COPY,
                    dst_access: vk::AccessFlags2::TRANSFER_READ,
                },
            );
            let region = vk::BufferImageCopy::default()
                .image_subresource(
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .layer_count(1),
                )
                .image_extent(vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                });
            device.cmd_copy_image_to_buffer(
                cmd,
                output.0,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                readback_buffer,
                &[region],
            );
            memory_barrier(
                device,
                cmd,
                (vk::PipelineStageFlags2::COPY, vk::AccessFlags2::TRANSFER_WRITE),
                (vk::PipelineStageFlags2::HOST, vk::AccessFlags2::HOST_READ),
            );
            Ok(())
        })?;
        self.state = IntegratorState::Traced;

        let bytes = transient.buffers[readback].mapped_bytes()?;
        let len = (u64::from(width) * u64::from(height) * TEXEL_SIZE) as usize;
        let bytes = bytes
            .get(..len)
            .ok_or_else(|| GpuError::InvalidState("Readback buffer too small".to_string()))?;
        let pixels = bytes
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned::<f32>)
            .collect();
        Ok((pixels, blas_count, tlas_instance_count))
    }
}

impl Drop for PathTracer {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            tracing::warn!("Path tracer idle wait failed during teardown: {e}");
        }
        let device = self.device.device();
        unsafe {
            if self.environment_sampler != vk::Sampler::null() {
                device.destroy_sampler(self.environment_sampler, None);
            }
            if let Some(sbt) = self.sbt.take() {
                if let Err(e) = sbt.destroy(&mut self.device.allocator().lock()) {
                    tracing::warn!("Failed to free shader binding table: {e}");
                }
            }
            if let Some(pipeline) = self.pipeline.take() {
                pipeline.destroy(device);
            }
        }
    }
}

const fn pool_size(ty: vk::DescriptorType) -> vk::DescriptorPoolSize {
    vk::DescriptorPoolSize {
        ty,
        descriptor_count: 1,
    }
}

/// Copy the staged equirect pixels into `image` and leave it shader readable.
unsafe fn upload_environment(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    staging: vk::Buffer,
    image: vk::Image,
    source: &EquirectImage,
) {
    let range = color_range(0, 1, 1);
    image_barrier(
        device,
        cmd,
        image,
        range,
        ImageTransition::discard(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::PipelineStageFlags2::COPY,
            vk::AccessFlags2::TRANSFER_WRITE,
        ),
    );
    let region = vk::BufferImageCopy::default()
        .image_subresource(
            vk::ImageSubresourceLayers::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .layer_count(1),
        )
        .image_extent(vk::Extent3D {
            width: source.width,
            height: source.height,
            depth: 1,
        });
    device.cmd_copy_buffer_to_image(
        cmd,
        staging,
        image,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        &[region],
    );
    image_barrier(
        device,
        cmd,
        image,
        range,
        ImageTransition {
            old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            src_stage: vk::PipelineStageFlags2::COPY,
            src_access: vk::AccessFlags2::TRANSFER_WRITE,
            dst_stage: vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
            dst_access: vk::AccessFlags2::SHADER_SAMPLED_READ,
        },
    );
}

/// Resources that live for a single render.
#[derive(Default)]
struct Transient {
    scene: Option<SceneAccelerationStructure>,
    buffers: Vec<GpuBuffer>,
    images: Vec<(GpuImage, vk::ImageView)>,
    descriptor_pool: Option<DescriptorPool>,
}

impl Transient {
    /// Keep `buffer` for teardown and return its handle.
    fn buffer(&mut self, buffer: GpuBuffer) -> vk::Buffer {
        let handle = buffer.buffer;
        self.buffers.push(buffer);
        handle
    }

    /// Create a single-mip RGBA32F image with a view.
    fn image(
        &mut self,
        rt: &RtDevice,
        extent: vk::Extent3D,
        usage: vk::ImageUsageFlags,
        name: &str,
    ) -> Result<(vk::Image, vk::ImageView)> {
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(OUTPUT_FORMAT)
            .extent(extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let mut image = rt
            .allocator()
            .lock()
            .create_image(&info, MemoryLocation::GpuOnly, name)?;
        let view = match unsafe {
            create_image_view(
                rt.device(),
                image.image,
                vk::ImageViewType::TYPE_2D,
                OUTPUT_FORMAT,
                color_range(0, 1, 1),
            )
        } {
            Ok(view) => view,
            Err(e) => {
                rt.allocator().lock().free_image(&mut image)?;
                return Err(e.into());
            }
        };
        let handle = image.image;
        self.images.push((image, view));
        Ok((handle, view))
    }

    /// Wait for the device, then free everything. The first failure is
    /// returned after the rest has been released.
    unsafe fn destroy(self, rt: &RtDevice) -> Result<()> {
        let mut first_error: Option<GpuError> = None;
        if let Err(e) = rt.wait_idle() {
            first_error = Some(e);
        }

        let device = rt.device();
        if let Some(pool) = self.descriptor_pool {
            pool.destroy(device);
        }

        let mut allocator = rt.allocator().lock();
        if let Some(scene) = self.scene {
            if let Err(e) = scene.destroy(rt.acceleration_structure(), &mut allocator) {
                first_error.get_or_insert(e);
            }
        }
        for (mut image, view) in self.images {
            device.destroy_image_view(view, None);
            if let Err(e) = allocator.free_image(&mut image) {
                first_error.get_or_insert(e);
            }
        }
        for mut buffer in self.buffers {
            if let Err(e) = allocator.free_buffer(&mut buffer) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), |e| Err(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_start_only_from_resting_states() {
        assert!(IntegratorState::Initialized.can_render());
        assert!(IntegratorState::Idle.can_render());
        assert!(!IntegratorState::Uninitialized.can_render());
        assert!(!IntegratorState::Building.can_render());
        assert!(!IntegratorState::Traced.can_render());
    }

    #[test]
    fn begin_moves_to_building() {
        assert_eq!(
            IntegratorState::Idle.begin().unwrap(),
            IntegratorState::Building
        );
        assert!(matches!(
            IntegratorState::Uninitialized.begin(),
            Err(RtError::InvalidState(IntegratorState::Uninitialized))
        ));
    }

    struct Unresolved;

    impl SceneResolver for Unresolved {
        fn mesh_data(&self, _: prism_core::MeshId) -> Option<Arc<prism_core::MeshData>> {
            None
        }

        fn material(&self, _: prism_core::MaterialId) -> Option<prism_core::Material> {
            None
        }
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn empty_scene_writes_nothing() {
        let gpu = Arc::new(prism_gpu::GpuContextBuilder::new().headless().build().unwrap());
        let Ok(mut tracer) = PathTracer::new(gpu) else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let settings = RenderSettings::default().with_output(dir.path().join("empty.png"));
        let resolver = Unresolved;
        let report = tracer
            .render(&SceneSnapshot::default(), &resolver, None, &settings)
            .unwrap();
        assert!(report.is_none());
        assert!(!settings.output.exists());
        assert_eq!(tracer.tracker().live(), 0);
        assert_eq!(tracer.state(), IntegratorState::Initialized);
    }
}
