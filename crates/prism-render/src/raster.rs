//! Forward, post and UI passes recorded with dynamic rendering.
//!
//! Per frame:
//! 1. Forward: sky, one base sub-pass per material kind, then one additive
//!    sub-pass per point light over the objects it reaches. Color resolves
//!    with AVERAGE, selection with SAMPLE_ZERO.
//! 2. Post: tonemap plus selection outline into the output image.
//! 3. UI: the transform gizmo over the output image and the resolved
//!    selection, only while something is selected.
//!
//! The resolved selection is then copied into the target set's staging
//! image for [`RasterPipeline::pick`].

use std::sync::Arc;

use ash::vk;
use glam::Vec3;
use prism_core::constants::FRAMES_IN_FLIGHT;
use prism_core::{MaterialKind, PickResult, SceneSnapshot, Vertex};
use prism_gpu::descriptors::{write_dynamic_uniform_buffer, write_uniform_buffer};
use prism_gpu::image::create_sampler;
use prism_gpu::pipeline::set_viewport_scissor;
use prism_gpu::sync::{image_barrier, ImageTransition};
use prism_gpu::{
    BlendMode, ColorTarget, DescriptorPool, DescriptorSetLayoutBuilder, GpuBuffer, GpuContext,
    GraphicsPipeline, GraphicsPipelineConfig, MemoryLocation, SamplerKind,
};

use crate::batching::{build_batches, sets, BlockSizes, DrawBinding, DrawRecord, PassKind};
use crate::error::{RenderError, Result};
use crate::gizmo;
use crate::picking;
use crate::resources::{EnvironmentBinding, RenderResources};
use crate::targets::{
    RenderTargetSet, TargetArena, TargetHandle, COLOR_FORMAT, DEPTH_FORMAT, SELECTION_FORMAT,
};
use crate::uniforms::{DrawPushConstants, ObjectBlock, PostPushConstants, SceneUniforms};

const MIN_OBJECT_CAPACITY: u32 = 64;

/// Tunables of the raster passes.
#[derive(Clone, Copy, Debug)]
pub struct RasterConfig {
    /// Requested MSAA sample count, clamped to what the device supports.
    pub samples: vk::SampleCountFlags,
    pub ibl_intensity: f32,
    pub post: PostPushConstants,
}

impl Default for RasterConfig {
    fn default() -> Self {
        Self {
            samples: vk::SampleCountFlags::TYPE_4,
            ibl_intensity: 1.0,
            post: PostPushConstants::default(),
        }
    }
}

/// Image the post and UI passes write into.
#[derive(Clone, Copy, Debug)]
pub struct OutputImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    /// Selects the render target set (the swapchain image index).
    pub target_index: usize,
    /// Layout the image is left in, e.g. `PRESENT_SRC_KHR`.
    pub final_layout: vk::ImageLayout,
}

/// Counters of one recorded frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub base_draws: u32,
    pub additive_draws: u32,
    pub gizmo_drawn: bool,
}

struct SlotResources {
    scene_buffer: GpuBuffer,
    object_buffer: GpuBuffer,
    object_capacity: u32,
    scene_set: vk::DescriptorSet,
    object_set: vk::DescriptorSet,
}

/// The multi-pass raster renderer.
pub struct RasterPipeline {
    gpu: Arc<GpuContext>,
    config: RasterConfig,
    output_format: vk::Format,
    sizes: BlockSizes,
    scene_layout: vk::DescriptorSetLayout,
    object_layout: vk::DescriptorSetLayout,
    post_layout: vk::DescriptorSetLayout,
    forward_layout: vk::PipelineLayout,
    base_pipelines: [vk::Pipeline; MaterialKind::COUNT],
    additive_pipelines: [vk::Pipeline; MaterialKind::COUNT],
    sky_pipeline: vk::Pipeline,
    post: Option<GraphicsPipeline>,
    gizmo: Option<GraphicsPipeline>,
    descriptor_pool: Option<DescriptorPool>,
    slots: Vec<SlotResources>,
    gizmo_vertices: Option<GpuBuffer>,
    gizmo_indices: Option<GpuBuffer>,
    gizmo_index_count: u32,
    attachment_sampler: vk::Sampler,
    targets: TargetArena,
    last_target: Option<TargetHandle>,
}

impl RasterPipeline {
    /// Create layouts, pipelines and per-slot buffers.
    ///
    /// Render targets are created by the first [`RasterPipeline::resize`].
    pub fn new(
        gpu: Arc<GpuContext>,
        resources: &RenderResources,
        output_format: vk::Format,
        config: RasterConfig,
    ) -> Result<Self> {
        let samples = gpu.capabilities().clamp_samples(config.samples);
        let sizes = BlockSizes::aligned(
            ObjectBlock::SIZE,
            resources.material_stride(),
            gpu.capabilities().min_uniform_buffer_offset_alignment,
        );
        tracing::info!("Raster pipeline: {samples:?} MSAA, output {output_format:?}");

        let mut pipeline = Self {
            gpu: Arc::clone(&gpu),
            config: RasterConfig { samples, ..config },
            output_format,
            sizes,
            scene_layout: vk::DescriptorSetLayout::null(),
            object_layout: vk::DescriptorSetLayout::null(),
            post_layout: vk::DescriptorSetLayout::null(),
            forward_layout: vk::PipelineLayout::null(),
            base_pipelines: [vk::Pipeline::null(); MaterialKind::COUNT],
            additive_pipelines: [vk::Pipeline::null(); MaterialKind::COUNT],
            sky_pipeline: vk::Pipeline::null(),
            post: None,
            gizmo: None,
            descriptor_pool: None,
            slots: Vec::with_capacity(FRAMES_IN_FLIGHT),
            gizmo_vertices: None,
            gizmo_indices: None,
            gizmo_index_count: 0,
            attachment_sampler: vk::Sampler::null(),
            targets: TargetArena::new(samples),
            last_target: None,
        };
        // Each stage leaves its handles in `pipeline`, Drop releases them
        pipeline.create_layouts(resources)?;
        pipeline.create_forward_pipelines()?;
        pipeline.create_overlay_pipelines()?;
        pipeline.create_slots()?;
        pipeline.create_gizmo_mesh()?;
        Ok(pipeline)
    }

    fn create_layouts(&mut self, resources: &RenderResources) -> Result<()> {
        let device = self.gpu.device();
        unsafe {
            self.attachment_sampler = create_sampler(device, SamplerKind::Nearest, 0.0)?;
            self.scene_layout = DescriptorSetLayoutBuilder::new()
                .uniform_buffer(0, vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
                .build(device)?;
            self.object_layout = DescriptorSetLayoutBuilder::new()
                .dynamic_uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
                .build(device)?;
            self.post_layout = DescriptorSetLayoutBuilder::new()
                .sampled_image(0, vk::ShaderStageFlags::FRAGMENT)
                .sampled_image(1, vk::ShaderStageFlags::FRAGMENT)
                .build(device)?;

            let set_layouts: [vk::DescriptorSetLayout; sets::COUNT] = [
                self.scene_layout,
                self.object_layout,
                resources.material_layout(),
                resources.texture_layout(),
                resources.environment_layout(),
            ];
            let push_ranges = [vk::PushConstantRange::default()
                .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
                .size(DrawPushConstants::SIZE)];
            let info = vk::PipelineLayoutCreateInfo::default()
                .set_layouts(&set_layouts)
                .push_constant_ranges(&push_ranges);
            self.forward_layout = device.create_pipeline_layout(&info, None)?;
        }
        Ok(())
    }

    fn forward_config(&self, kind: MaterialKind, pass: PassKind) -> GraphicsPipelineConfig {
        let vertex_bindings = vec![vk::VertexInputBindingDescription {
            binding: 0,
            stride: Vertex::STRIDE,
            input_rate: vk::VertexInputRate::VERTEX,
        }];
        let vertex_attributes = vec![
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 0,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 12,
            },
            vk::VertexInputAttributeDescription {
                location: 2,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: 24,
            },
        ];
        let base = GraphicsPipelineConfig {
            vertex_shader: prism_shaders::forward_vert(),
            fragment_shader: prism_shaders::forward_frag(),
            vertex_bindings,
            vertex_attributes,
            cull_mode: vk::CullModeFlags::NONE,
            samples: self.config.samples,
            color_targets: vec![
                ColorTarget::opaque(COLOR_FORMAT),
                ColorTarget::opaque(SELECTION_FORMAT),
            ],
            depth_format: Some(DEPTH_FORMAT),
            fragment_constants: vec![(prism_shaders::MATERIAL_KIND_CONSTANT_ID, kind as u32)],
            ..GraphicsPipelineConfig::default()
        };
        match pass {
            PassKind::Base => base,
            PassKind::Additive => GraphicsPipelineConfig {
                fragment_shader: prism_shaders::forward_point_frag(),
                depth_write: false,
                depth_compare: vk::CompareOp::EQUAL,
                color_targets: vec![
                    ColorTarget::opaque(COLOR_FORMAT).with_blend(BlendMode::Additive),
                    ColorTarget::opaque(SELECTION_FORMAT).masked(),
                ],
                ..base
            },
        }
    }

    fn create_forward_pipelines(&mut self) -> Result<()> {
        let device = self.gpu.device();
        for kind in MaterialKind::ALL {
            let base = self.forward_config(kind, PassKind::Base);
            self.base_pipelines[kind.index()] =
                unsafe { GraphicsPipeline::with_layout(device, &base, self.forward_layout) }?;
            if kind.receives_point_lights() {
                let additive = self.forward_config(kind, PassKind::Additive);
                self.additive_pipelines[kind.index()] =
                    unsafe { GraphicsPipeline::with_layout(device, &additive, self.forward_layout) }?;
            }
        }

        let sky = GraphicsPipelineConfig {
            samples: self.config.samples,
            depth_format: Some(DEPTH_FORMAT),
            color_targets: vec![
                ColorTarget::opaque(COLOR_FORMAT),
                ColorTarget::opaque(SELECTION_FORMAT),
            ],
            ..GraphicsPipelineConfig::fullscreen(
                prism_shaders::sky_frag(),
                prism_shaders::fullscreen_vert(),
            )
        };
        self.sky_pipeline = unsafe { GraphicsPipeline::with_layout(device, &sky, self.forward_layout) }?;
        Ok(())
    }

    fn create_overlay_pipelines(&mut self) -> Result<()> {
        let device = self.gpu.device();
        let post = GraphicsPipelineConfig {
            color_targets: vec![ColorTarget::opaque(self.output_format)],
            ..GraphicsPipelineConfig::fullscreen(
                prism_shaders::post_frag(),
                prism_shaders::fullscreen_vert(),
            )
        };
        let post_push = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .size(PostPushConstants::SIZE);
        self.post = Some(unsafe { GraphicsPipeline::new(device, &post, &[self.post_layout], &[post_push]) }?);

        let gizmo = GraphicsPipelineConfig {
            vertex_shader: prism_shaders::gizmo_vert(),
            fragment_shader: prism_shaders::gizmo_frag(),
            vertex_bindings: vec![vk::VertexInputBindingDescription {
                binding: 0,
                stride: 12,
                input_rate: vk::VertexInputRate::VERTEX,
            }],
            vertex_attributes: vec![vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 0,
            }],
            cull_mode: vk::CullModeFlags::NONE,
            depth_test: false,
            depth_write: false,
            depth_format: None,
            color_targets: vec![
                ColorTarget::opaque(self.output_format),
                ColorTarget::opaque(SELECTION_FORMAT),
            ],
            ..GraphicsPipelineConfig::default()
        };
        let gizmo_push = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .size(crate::uniforms::GizmoPushConstants::SIZE);
        self.gizmo = Some(unsafe { GraphicsPipeline::new(device, &gizmo, &[], &[gizmo_push]) }?);
        Ok(())
    }

    fn create_slots(&mut self) -> Result<()> {
        let device = self.gpu.device();
        let slot_count = FRAMES_IN_FLIGHT as u32;
        let pool = unsafe {
            DescriptorPool::new(
                device,
                slot_count * 2,
                &[
                    vk::DescriptorPoolSize {
                        ty: vk::DescriptorType::UNIFORM_BUFFER,
                        descriptor_count: slot_count,
                    },
                    vk::DescriptorPoolSize {
                        ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                        descriptor_count: slot_count,
                    },
                ],
            )
        }?;
        let pool = self.descriptor_pool.insert(pool);

        for slot in 0..FRAMES_IN_FLIGHT {
            let (scene_set, object_set) = unsafe {
                (
                    pool.allocate_one(device, self.scene_layout)?,
                    pool.allocate_one(device, self.object_layout)?,
                )
            };
            let mut allocator = self.gpu.allocator().lock();
            let scene_buffer = allocator.create_buffer(
                SceneUniforms::SIZE,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                MemoryLocation::CpuToGpu,
                &format!("scene_uniforms_{slot}"),
            )?;
            let object_buffer = match allocator.create_buffer(
                self.sizes.object * u64::from(MIN_OBJECT_CAPACITY),
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                MemoryLocation::CpuToGpu,
                &format!("object_blocks_{slot}"),
            ) {
                Ok(buffer) => buffer,
                Err(e) => {
                    let mut scene_buffer = scene_buffer;
                    allocator.free_buffer(&mut scene_buffer)?;
                    return Err(e.into());
                }
            };
            unsafe {
                write_uniform_buffer(device, scene_set, 0, scene_buffer.buffer, SceneUniforms::SIZE);
                write_dynamic_uniform_buffer(
                    device,
                    object_set,
                    0,
                    object_buffer.buffer,
                    ObjectBlock::SIZE,
                );
            }
            self.slots.push(SlotResources {
                scene_buffer,
                object_buffer,
                object_capacity: MIN_OBJECT_CAPACITY,
                scene_set,
                object_set,
            });
        }
        Ok(())
    }

    fn create_gizmo_mesh(&mut self) -> Result<()> {
        let (positions, indices) = gizmo::arrow_mesh();
        let mut allocator = self.gpu.allocator().lock();
        self.gizmo_vertices = Some(allocator.create_buffer_with_data(
            &positions,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            "gizmo_vertices",
        )?);
        self.gizmo_indices = Some(allocator.create_buffer_with_data(
            &indices,
            vk::BufferUsageFlags::INDEX_BUFFER,
            "gizmo_indices",
        )?);
        self.gizmo_index_count = indices.len() as u32;
        Ok(())
    }

    /// Recreate the render target sets for a new output extent.
    pub fn resize(&mut self, extent: vk::Extent2D, image_count: usize) -> Result<()> {
        self.last_target = None;
        self.targets.rebuild(
            &self.gpu,
            extent,
            image_count,
            self.post_layout,
            self.attachment_sampler,
        )
    }

    pub fn targets(&self) -> &TargetArena {
        &self.targets
    }

    pub const fn samples(&self) -> vk::SampleCountFlags {
        self.config.samples
    }

    /// Grow the slot's transform buffer to hold `count` blocks.
    fn ensure_object_capacity(&mut self, slot: usize, count: usize) -> Result<()> {
        let stride = self.sizes.object;
        let gpu = Arc::clone(&self.gpu);
        let resources = self
            .slots
            .get_mut(slot)
            .ok_or(RenderError::UnknownHandle {
                kind: "frame slot",
                index: slot as u32,
            })?;
        if count as u32 <= resources.object_capacity {
            return Ok(());
        }

        let capacity = (count as u32).next_power_of_two().max(MIN_OBJECT_CAPACITY);
        let mut allocator = gpu.allocator().lock();
        let buffer = allocator.create_buffer(
            stride * u64::from(capacity),
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
            &format!("object_blocks_{slot}"),
        )?;
        let mut old = std::mem::replace(&mut resources.object_buffer, buffer);
        allocator.free_buffer(&mut old)?;
        resources.object_capacity = capacity;
        unsafe {
            write_dynamic_uniform_buffer(
                gpu.device(),
                resources.object_set,
                0,
                resources.object_buffer.buffer,
                ObjectBlock::SIZE,
            );
        }
        tracing::debug!("Slot {slot} transform buffer grown to {capacity} blocks");
        Ok(())
    }

    /// Record all passes of one frame into `cmd`.
    ///
    /// The slot's previous submission must have retired.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn record(
        &mut self,
        cmd: vk::CommandBuffer,
        slot: usize,
        output: OutputImage,
        scene: &SceneSnapshot,
        resources: &RenderResources,
    ) -> Result<FrameStats> {
        let handle = self.targets.handle(output.target_index)?;
        let extent = self.targets.get(handle)?.extent;
        let environment = resources.environment(scene.skybox.as_ref())?;
        let list = build_batches(&scene.objects, resources);

        self.ensure_object_capacity(slot, list.transforms.len())?;
        let slot_resources = &self.slots[slot];
        let uniforms = SceneUniforms::new(
            scene,
            (extent.width, extent.height),
            environment.active,
            environment.prefiltered_mips,
            self.config.ibl_intensity,
        );
        slot_resources.scene_buffer.write(&[uniforms])?;
        for (i, transform) in list.transforms.iter().enumerate() {
            slot_resources.object_buffer.write_range(
                i as u64 * self.sizes.object,
                &[ObjectBlock::from_transform(*transform)],
            )?;
        }

        let targets = self.targets.get(handle)?;
        let mut stats = FrameStats::default();
        let device = self.gpu.device();
        let frame_sets = FrameSets {
            scene: slot_resources.scene_set,
            object: slot_resources.object_set,
            material: resources.material_set(),
            textures: resources.texture_set(),
            environment: environment.descriptor_set,
        };

        unsafe {
            self.begin_forward(cmd, targets);
            self.draw_sky(cmd, &frame_sets, &environment);

            for batch in &list.batches {
                device.cmd_bind_pipeline(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.base_pipelines[batch.kind.index()],
                );
                for record in &batch.records {
                    let push = DrawPushConstants::base(record.selection, record.selected);
                    if self.draw_record(cmd, record, PassKind::Base, push, &frame_sets, resources) {
                        stats.base_draws += 1;
                    }
                }
            }

            for light in &scene.point_lights {
                for batch in list.batches.iter().filter(|b| b.kind.receives_point_lights()) {
                    device.cmd_bind_pipeline(
                        cmd,
                        vk::PipelineBindPoint::GRAPHICS,
                        self.additive_pipelines[batch.kind.index()],
                    );
                    for record in batch.lit_by(light) {
                        let push = DrawPushConstants::base(record.selection, record.selected)
                            .with_point_light(light);
                        if self.draw_record(cmd, record, PassKind::Additive, push, &frame_sets, resources) {
                            stats.additive_draws += 1;
                        }
                    }
                }
            }
            device.cmd_end_rendering(cmd);

            self.record_post(cmd, targets, output, scene.exposure);
            let anchor = scene.selected_object().map(|o| o.world_position());
            stats.gizmo_drawn = anchor.is_some();
            self.record_ui(cmd, targets, output, scene, anchor);
            self.record_selection_copy(cmd, targets, output);
        }

        self.last_target = Some(handle);
        tracing::trace!(
            "Recorded frame: {} base, {} additive draws",
            stats.base_draws,
            stats.additive_draws
        );
        Ok(stats)
    }

    unsafe fn begin_forward(&self, cmd: vk::CommandBuffer, targets: &RenderTargetSet) {
        let device = self.gpu.device();
        let color_write = (
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        );
        let mut color_images = vec![targets.color.image.image, targets.selection.image.image];
        if let (Some(color), Some(selection)) = (&targets.color_msaa, &targets.selection_msaa) {
            color_images.extend([color.image.image, selection.image.image]);
        }
        for image in color_images {
            image_barrier(
                device,
                cmd,
                image,
                color_subresource(),
                overwrite(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, color_write),
            );
        }
        image_barrier(
            device,
            cmd,
            targets.depth.image.image,
            targets.depth.image.full_range(vk::ImageAspectFlags::DEPTH),
            overwrite(
                vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
                (
                    vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                        | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                    vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                        | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
                ),
            ),
        );

        let multisampled = targets.is_multisampled();
        let attachment = |view: vk::ImageView, clear: [f32; 4], resolve: Option<(vk::ImageView, vk::ResolveModeFlags)>| {
            let info = vk::RenderingAttachmentInfo::default()
                .image_view(view)
                .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(if multisampled {
                    vk::AttachmentStoreOp::DONT_CARE
                } else {
                    vk::AttachmentStoreOp::STORE
                })
                .clear_value(vk::ClearValue {
                    color: vk::ClearColorValue { float32: clear },
                });
            match resolve {
                Some((resolve_view, mode)) => info
                    .resolve_mode(mode)
                    .resolve_image_view(resolve_view)
                    .resolve_image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
                None => info,
            }
        };
        let resolve = |view: vk::ImageView, mode| multisampled.then_some((view, mode));
        let color_attachments = [
            attachment(
                targets.forward_color().view,
                [0.0, 0.0, 0.0, 1.0],
                resolve(targets.color.view, vk::ResolveModeFlags::AVERAGE),
            ),
            attachment(
                targets.forward_selection().view,
                [0.0; 4],
                resolve(targets.selection.view, vk::ResolveModeFlags::SAMPLE_ZERO),
            ),
        ];
        let depth_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(targets.depth.view)
            .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            });
        let rendering = vk::RenderingInfo::default()
            .render_area(vk::Rect2D::default().extent(targets.extent))
            .layer_count(1)
            .color_attachments(&color_attachments)
            .depth_attachment(&depth_attachment);

        device.cmd_begin_rendering(cmd, &rendering);
        set_viewport_scissor(device, cmd, targets.extent);
    }

    unsafe fn draw_sky(&self, cmd: vk::CommandBuffer, frame_sets: &FrameSets, environment: &EnvironmentBinding) {
        if !environment.active {
            return;
        }
        let device = self.gpu.device();
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.sky_pipeline);
        device.cmd_bind_descriptor_sets(
            cmd,
            vk::PipelineBindPoint::GRAPHICS,
            self.forward_layout,
            sets::SCENE,
            &[frame_sets.scene],
            &[],
        );
        device.cmd_bind_descriptor_sets(
            cmd,
            vk::PipelineBindPoint::GRAPHICS,
            self.forward_layout,
            sets::ENVIRONMENT,
            &[frame_sets.environment],
            &[],
        );
        device.cmd_push_constants(
            cmd,
            self.forward_layout,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            0,
            bytemuck::bytes_of(&DrawPushConstants::default()),
        );
        device.cmd_draw(cmd, 3, 1, 0, 0);
    }

    /// Bind sets and buffers for one record and draw it. False when the mesh
    /// vanished from the tables.
    unsafe fn draw_record(
        &self,
        cmd: vk::CommandBuffer,
        record: &DrawRecord,
        pass: PassKind,
        push: DrawPushConstants,
        frame_sets: &FrameSets,
        resources: &RenderResources,
    ) -> bool {
        let Some(mesh) = resources.mesh(record.mesh) else {
            return false;
        };
        let device = self.gpu.device();
        let binding = DrawBinding::for_record(record, self.sizes, pass);
        let descriptor_sets: Vec<vk::DescriptorSet> =
            binding.sets.iter().map(|s| frame_sets.get(s.set)).collect();
        device.cmd_bind_descriptor_sets(
            cmd,
            vk::PipelineBindPoint::GRAPHICS,
            self.forward_layout,
            sets::SCENE,
            &descriptor_sets,
            &binding.dynamic_offsets(),
        );
        device.cmd_push_constants(
            cmd,
            self.forward_layout,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            0,
            bytemuck::bytes_of(&push),
        );
        device.cmd_bind_vertex_buffers(cmd, 0, &[mesh.vertex_buffer.buffer], &[0]);
        device.cmd_bind_index_buffer(cmd, mesh.index_buffer.buffer, 0, vk::IndexType::UINT32);
        device.cmd_draw_indexed(cmd, mesh.index_count, 1, 0, 0, 0);
        true
    }

    unsafe fn record_post(
        &self,
        cmd: vk::CommandBuffer,
        targets: &RenderTargetSet,
        output: OutputImage,
        exposure: f32,
    ) {
        let device = self.gpu.device();
        let Some(post) = &self.post else {
            return;
        };
        let attachment_to_sampled = ImageTransition {
            old_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            src_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            src_access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            dst_stage: vk::PipelineStageFlags2::FRAGMENT_SHADER,
            dst_access: vk::AccessFlags2::SHADER_SAMPLED_READ,
        };
        for image in [targets.color.image.image, targets.selection.image.image] {
            image_barrier(device, cmd, image, color_subresource(), attachment_to_sampled);
        }
        image_barrier(
            device,
            cmd,
            output.image,
            color_subresource(),
            overwrite(
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                (
                    vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                    vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                ),
            ),
        );

        let attachments = [vk::RenderingAttachmentInfo::default()
            .image_view(output.view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::DONT_CARE)
            .store_op(vk::AttachmentStoreOp::STORE)];
        let rendering = vk::RenderingInfo::default()
            .render_area(vk::Rect2D::default().extent(targets.extent))
            .layer_count(1)
            .color_attachments(&attachments);
        let params = PostPushConstants {
            exposure: exposure * self.config.post.exposure,
            ..self.config.post
        };

        device.cmd_begin_rendering(cmd, &rendering);
        set_viewport_scissor(device, cmd, targets.extent);
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, post.pipeline);
        device.cmd_bind_descriptor_sets(
            cmd,
            vk::PipelineBindPoint::GRAPHICS,
            post.layout,
            0,
            &[targets.post_set],
            &[],
        );
        device.cmd_push_constants(
            cmd,
            post.layout,
            vk::ShaderStageFlags::FRAGMENT,
            0,
            bytemuck::bytes_of(&params),
        );
        device.cmd_draw(cmd, 3, 1, 0, 0);
        device.cmd_end_rendering(cmd);
    }

    /// Gizmo over the output and the resolved selection. Leaves the resolved
    /// selection in `TRANSFER_SRC_OPTIMAL` either way.
    unsafe fn record_ui(
        &self,
        cmd: vk::CommandBuffer,
        targets: &RenderTargetSet,
        output: OutputImage,
        scene: &SceneSnapshot,
        anchor: Option<Vec3>,
    ) {
        let device = self.gpu.device();
        let (Some(anchor), Some(pipeline), Some(vertices), Some(indices)) = (
            anchor,
            &self.gizmo,
            &self.gizmo_vertices,
            &self.gizmo_indices,
        ) else {
            image_barrier(
                device,
                cmd,
                targets.selection.image.image,
                color_subresource(),
                ImageTransition {
                    old_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    src_stage: vk::PipelineStageFlags2::FRAGMENT_SHADER,
                    src_access: vk::AccessFlags2::NONE,
                    dst_stage: vk::PipelineStageFlags2::COPY,
                    dst_access: vk::AccessFlags2::TRANSFER_READ,
                },
            );
            return;
        };

        image_barrier(
            device,
            cmd,
            targets.selection.image.image,
            color_subresource(),
            ImageTransition {
                old_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                src_stage: vk::PipelineStageFlags2::FRAGMENT_SHADER,
                src_access: vk::AccessFlags2::NONE,
                dst_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                dst_access: vk::AccessFlags2::COLOR_ATTACHMENT_READ
                    | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            },
        );

        let load = |view: vk::ImageView| {
            vk::RenderingAttachmentInfo::default()
                .image_view(view)
                .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::LOAD)
                .store_op(vk::AttachmentStoreOp::STORE)
        };
        let attachments = [load(output.view), load(targets.selection.view)];
        let rendering = vk::RenderingInfo::default()
            .render_area(vk::Rect2D::default().extent(targets.extent))
            .layer_count(1)
            .color_attachments(&attachments);

        let mut camera = scene.camera.clone();
        camera.set_aspect(targets.extent.width as f32 / targets.extent.height.max(1) as f32);
        let draws = gizmo::axis_draws(camera.view_projection_matrix(), &camera, anchor);

        device.cmd_begin_rendering(cmd, &rendering);
        set_viewport_scissor(device, cmd, targets.extent);
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.pipeline);
        device.cmd_bind_vertex_buffers(cmd, 0, &[vertices.buffer], &[0]);
        device.cmd_bind_index_buffer(cmd, indices.buffer, 0, vk::IndexType::UINT32);
        for draw in &draws {
            device.cmd_push_constants(
                cmd,
                pipeline.layout,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                0,
                bytemuck::bytes_of(draw),
            );
            device.cmd_draw_indexed(cmd, self.gizmo_index_count, 1, 0, 0, 0);
        }
        device.cmd_end_rendering(cmd);

        image_barrier(
            device,
            cmd,
            targets.selection.image.image,
            color_subresource(),
            ImageTransition {
                old_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                src_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                src_access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                dst_stage: vk::PipelineStageFlags2::COPY,
                dst_access: vk::AccessFlags2::TRANSFER_READ,
            },
        );
    }

    unsafe fn record_selection_copy(
        &self,
        cmd: vk::CommandBuffer,
        targets: &RenderTargetSet,
        output: OutputImage,
    ) {
        let device = self.gpu.device();
        image_barrier(
            device,
            cmd,
            targets.staging.image,
            color_subresource(),
            overwrite(
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                (vk::PipelineStageFlags2::COPY, vk::AccessFlags2::TRANSFER_WRITE),
            ),
        );
        let layers = vk::ImageSubresourceLayers::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .layer_count(1);
        let region = vk::ImageCopy::default()
            .src_subresource(layers)
            .dst_subresource(layers)
            .extent(vk::Extent3D {
                width: targets.extent.width,
                height: targets.extent.height,
                depth: 1,
            });
        device.cmd_copy_image(
            cmd,
            targets.selection.image.image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            targets.staging.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );
        image_barrier(
            device,
            cmd,
            targets.staging.image,
            color_subresource(),
            ImageTransition {
                old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                new_layout: vk::ImageLayout::GENERAL,
                src_stage: vk::PipelineStageFlags2::COPY,
                src_access: vk::AccessFlags2::TRANSFER_WRITE,
                dst_stage: vk::PipelineStageFlags2::HOST,
                dst_access: vk::AccessFlags2::HOST_READ,
            },
        );
        image_barrier(
            device,
            cmd,
            output.image,
            color_subresource(),
            ImageTransition {
                old_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                new_layout: output.final_layout,
                src_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                src_access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                dst_stage: vk::PipelineStageFlags2::ALL_COMMANDS,
                dst_access: vk::AccessFlags2::MEMORY_READ,
            },
        );
    }

    /// Decode the selection texel at (`x`, `y`) of the last recorded frame.
    ///
    /// That frame's submission must have completed.
    pub fn pick(&self, x: u32, y: u32) -> Result<PickResult> {
        let Some(handle) = self.last_target else {
            return Ok(PickResult::Nothing);
        };
        let targets = self.targets.get(handle)?;
        Ok(picking::pick_from_targets(targets, x, y)?)
    }

    /// Raw selection texel of the last recorded frame.
    pub fn selection_texel(&self, x: u32, y: u32) -> Result<Option<[f32; 3]>> {
        let Some(handle) = self.last_target else {
            return Ok(None);
        };
        let targets = self.targets.get(handle)?;
        let bytes = targets.staging.mapped_bytes()?;
        Ok(picking::read_texel(
            bytes,
            &targets.staging_layout,
            targets.extent,
            x,
            y,
        ))
    }
}

impl Drop for RasterPipeline {
    fn drop(&mut self) {
        let gpu = Arc::clone(&self.gpu);
        if let Err(e) = gpu.wait_idle() {
            tracing::warn!("Device idle wait failed during teardown: {e}");
        }
        let device = gpu.device();
        self.targets.destroy(&gpu);
        {
            let mut allocator = gpu.allocator().lock();
            for mut slot in self.slots.drain(..) {
                let _ = allocator.free_buffer(&mut slot.scene_buffer);
                let _ = allocator.free_buffer(&mut slot.object_buffer);
            }
            for buffer in [self.gizmo_vertices.take(), self.gizmo_indices.take()]
                .into_iter()
                .flatten()
            {
                let mut buffer = buffer;
                let _ = allocator.free_buffer(&mut buffer);
            }
        }
        unsafe {
            for pipeline in self
                .base_pipelines
                .iter()
                .chain(&self.additive_pipelines)
                .chain(std::iter::once(&self.sky_pipeline))
            {
                device.destroy_pipeline(*pipeline, None);
            }
            for pipeline in [self.post.take(), self.gizmo.take()].into_iter().flatten() {
                pipeline.destroy(device);
            }
            device.destroy_pipeline_layout(self.forward_layout, None);
            if let Some(pool) = self.descriptor_pool.take() {
                pool.destroy(device);
            }
            for layout in [self.scene_layout, self.object_layout, self.post_layout] {
                device.destroy_descriptor_set_layout(layout, None);
            }
            device.destroy_sampler(self.attachment_sampler, None);
        }
        tracing::debug!("Raster pipeline destroyed");
    }
}

/// Descriptor sets bound for one frame, indexed by set number.
struct FrameSets {
    scene: vk::DescriptorSet,
    object: vk::DescriptorSet,
    material: vk::DescriptorSet,
    textures: vk::DescriptorSet,
    environment: vk::DescriptorSet,
}

impl FrameSets {
    fn get(&self, set: u32) -> vk::DescriptorSet {
        match set {
            sets::SCENE => self.scene,
            sets::OBJECT => self.object,
            sets::MATERIAL => self.material,
            sets::TEXTURES => self.textures,
            _ => self.environment,
        }
    }
}

fn color_subresource() -> vk::ImageSubresourceRange {
    prism_gpu::sync::color_range(0, 1, 1)
}

/// Discard the previous contents once every earlier access has finished.
fn overwrite(
    new_layout: vk::ImageLayout,
    dst: (vk::PipelineStageFlags2, vk::AccessFlags2),
) -> ImageTransition {
    ImageTransition {
        src_stage: vk::PipelineStageFlags2::ALL_COMMANDS,
        src_access: vk::AccessFlags2::MEMORY_WRITE,
        ..ImageTransition::discard(new_layout, dst.0, dst.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrite_waits_for_prior_writes() {
        let t = overwrite(
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            (
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            ),
        );
        assert_eq!(t.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(t.src_stage, vk::PipelineStageFlags2::ALL_COMMANDS);
    }

    #[test]
    fn frame_sets_follow_layout_order() {
        let frame_sets = FrameSets {
            scene: vk::DescriptorSet::null(),
            object: vk::DescriptorSet::null(),
            material: vk::DescriptorSet::null(),
            textures: vk::DescriptorSet::null(),
            environment: vk::DescriptorSet::null(),
        };
        for set in 0..sets::COUNT as u32 {
            assert_eq!(frame_sets.get(set), vk::DescriptorSet::null());
        }
    }

    #[test]
    fn default_config_requests_msaa() {
        let config = RasterConfig::default();
        assert_eq!(config.samples, vk::SampleCountFlags::TYPE_4);
        assert!(config.post.outline_color[3] > 0.0);
    }
}
