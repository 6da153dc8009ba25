//! One-shot image-based lighting precomputation.
//!
//! Every bake pass renders fullscreen triangles into cube faces through a
//! disposable graphics pipeline that is destroyed as soon as its command
//! buffer retires.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use prism_core::constants::CUBE_FACES;
use prism_core::math::mip_count;
use prism_gpu::command::execute_single_time_commands;
use prism_gpu::descriptors::write_sampled_images;
use prism_gpu::image::{create_image_view, create_sampler};
use prism_gpu::pipeline::set_viewport_scissor;
use prism_gpu::sync::{image_barrier, ImageTransition};
use prism_gpu::{
    ColorTarget, CommandPool, DescriptorPool, DescriptorSetLayoutBuilder, GpuBuffer, GpuContext,
    GpuImage, GraphicsPipeline, GraphicsPipelineConfig, MemoryLocation, SamplerKind,
};

use crate::error::{RenderError, Result};

/// Format of every baked cubemap.
pub const CUBE_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
/// Two-channel split-sum lookup.
pub const BRDF_LUT_FORMAT: vk::Format = vk::Format::R16G16_SFLOAT;
const SOURCE_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;

/// Upper bound on retained environments.
pub const MAX_ENVIRONMENTS: u32 = 32;

const BAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Uniform radiance of the fallback environment.
const NEUTRAL_RADIANCE: [f32; 4] = [0.3, 0.3, 0.3, 1.0];

/// Bake resolutions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IblConfig {
    /// Edge length of the source cubemap.
    pub environment_resolution: u32,
    pub irradiance_resolution: u32,
    /// Edge length of mip 0 of the prefiltered cubemap.
    pub prefilter_resolution: u32,
    pub brdf_lut_resolution: u32,
}

impl Default for IblConfig {
    fn default() -> Self {
        Self {
            environment_resolution: 512,
            irradiance_resolution: 32,
            prefilter_resolution: 128,
            brdf_lut_resolution: 512,
        }
    }
}

impl IblConfig {
    /// Sizes for the 1x1 fallback environment.
    const NEUTRAL: Self = Self {
        environment_resolution: 16,
        irradiance_resolution: 4,
        prefilter_resolution: 8,
        brdf_lut_resolution: 0,
    };

    #[must_use]
    pub const fn with_environment_resolution(mut self, resolution: u32) -> Self {
        self.environment_resolution = resolution;
        self
    }

    #[must_use]
    pub const fn with_prefilter_resolution(mut self, resolution: u32) -> Self {
        self.prefilter_resolution = resolution;
        self
    }

    #[must_use]
    pub const fn with_irradiance_resolution(mut self, resolution: u32) -> Self {
        self.irradiance_resolution = resolution;
        self
    }
}

/// Bake pass push constants.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct BakePushConstants {
    pub face: u32,
    pub sample_count: u32,
    pub roughness: f32,
    pub source_resolution: f32,
}

impl BakePushConstants {
    pub const SIZE: u32 = std::mem::size_of::<Self>() as u32;
}

/// GGX roughness baked into prefiltered mip `mip` of `mips`.
pub fn prefilter_roughness(mip: u32, mips: u32) -> f32 {
    if mips <= 1 {
        0.0
    } else {
        mip.min(mips - 1) as f32 / (mips - 1) as f32
    }
}

/// Importance samples per texel at prefiltered mip `mip`.
pub fn prefilter_samples(mip: u32) -> u32 {
    64u32.saturating_mul(1u32 << mip.min(31)).min(1024)
}

/// Decoded equirectangular environment, RGBA32F.
#[derive(Clone, Debug, PartialEq)]
pub struct EquirectImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<f32>,
}

impl EquirectImage {
    /// Uniform single-texel environment.
    pub fn uniform(radiance: [f32; 4]) -> Self {
        Self {
            width: 1,
            height: 1,
            pixels: radiance.to_vec(),
        }
    }

    /// Load and convert an image to RGBA32F.
    ///
    /// Unreadable or unsupported files yield `None` with a warning.
    pub fn load(path: &Path) -> Option<Self> {
        let decoded = match image::open(path) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!("Cannot import environment {}: {e}", path.display());
                return None;
            }
        };
        let rgba = decoded.to_rgba32f();
        let (width, height) = rgba.dimensions();
        if width == 0 || height == 0 {
            tracing::warn!("Environment {} is empty", path.display());
            return None;
        }
        Some(Self {
            width,
            height,
            pixels: rgba.into_raw(),
        })
    }
}

/// A sampled image with a view over all of it.
pub struct Texture {
    pub image: GpuImage,
    pub view: vk::ImageView,
}

impl Texture {
    pub(crate) fn from_info(
        gpu: &GpuContext,
        info: &vk::ImageCreateInfo,
        view_type: vk::ImageViewType,
        name: &str,
    ) -> Result<Self> {
        let mut image = gpu
            .allocator()
            .lock()
            .create_image(info, MemoryLocation::GpuOnly, name)?;
        let range = image.full_range(vk::ImageAspectFlags::COLOR);
        match unsafe { create_image_view(gpu.device(), image.image, view_type, info.format, range) } {
            Ok(view) => Ok(Self { image, view }),
            Err(e) => {
                gpu.allocator().lock().free_image(&mut image)?;
                Err(e.into())
            }
        }
    }

    fn cube(gpu: &GpuContext, resolution: u32, mips: u32, usage: vk::ImageUsageFlags, name: &str) -> Result<Self> {
        let info = vk::ImageCreateInfo::default()
            .flags(vk::ImageCreateFlags::CUBE_COMPATIBLE)
            .image_type(vk::ImageType::TYPE_2D)
            .format(CUBE_FORMAT)
            .extent(vk::Extent3D {
                width: resolution,
                height: resolution,
                depth: 1,
            })
            .mip_levels(mips)
            .array_layers(CUBE_FACES)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage | vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        Self::from_info(gpu, &info, vk::ImageViewType::CUBE, name)
    }

    fn flat(gpu: &GpuContext, width: u32, height: u32, format: vk::Format, usage: vk::ImageUsageFlags, name: &str) -> Result<Self> {
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage | vk::ImageUsageFlags::SAMPLED)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        Self::from_info(gpu, &info, vk::ImageViewType::TYPE_2D, name)
    }

    pub fn mip_levels(&self) -> u32 {
        self.image.mip_levels
    }

    pub fn layers(&self) -> u32 {
        self.image.array_layers
    }

    pub fn resolution(&self) -> u32 {
        self.image.extent.width
    }

    pub fn destroy(mut self, gpu: &GpuContext) {
        unsafe { gpu.device().destroy_image_view(self.view, None) };
        if let Err(e) = gpu.allocator().lock().free_image(&mut self.image) {
            tracing::warn!("Failed to free texture: {e}");
        }
    }
}

/// Baked lighting for one environment.
pub struct IblAsset {
    pub environment: Texture,
    pub irradiance: Texture,
    pub prefiltered: Texture,
    /// Set 4 of the forward layout: environment, irradiance, prefiltered, BRDF LUT.
    pub descriptor_set: vk::DescriptorSet,
    /// Decoded source, kept for the path tracer's environment lookups.
    pub source: Arc<EquirectImage>,
}

impl IblAsset {
    pub fn face_count(&self) -> u32 {
        self.environment.layers()
    }

    pub fn prefiltered_mip_count(&self) -> u32 {
        self.prefiltered.mip_levels()
    }

    /// Release the cubemaps. The descriptor set returns with the baker's pool.
    pub fn destroy(self, gpu: &GpuContext) {
        self.environment.destroy(gpu);
        self.irradiance.destroy(gpu);
        self.prefiltered.destroy(gpu);
    }
}

/// Runs the bake passes and owns the shared BRDF lookup texture.
pub struct IblBaker {
    gpu: Arc<GpuContext>,
    config: IblConfig,
    command_pool: CommandPool,
    linear_sampler: vk::Sampler,
    nearest_sampler: vk::Sampler,
    source_layout: vk::DescriptorSetLayout,
    environment_layout: vk::DescriptorSetLayout,
    asset_pool: DescriptorPool,
    brdf_lut: Option<Texture>,
}

impl IblBaker {
    /// Create the baker and generate the BRDF lookup texture.
    pub fn new(gpu: Arc<GpuContext>, config: IblConfig) -> Result<Self> {
        let device = gpu.device();
        let command_pool = unsafe {
            CommandPool::new(
                device,
                gpu.graphics_queue_family(),
                vk::CommandPoolCreateFlags::TRANSIENT,
            )
        }?;
        let asset_pool = match unsafe {
            DescriptorPool::new(
                device,
                MAX_ENVIRONMENTS,
                &[vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    descriptor_count: MAX_ENVIRONMENTS * 4,
                }],
            )
        } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { command_pool.destroy(device) };
                return Err(e.into());
            }
        };

        let mut baker = Self {
            gpu: Arc::clone(&gpu),
            config,
            command_pool,
            linear_sampler: vk::Sampler::null(),
            nearest_sampler: vk::Sampler::null(),
            source_layout: vk::DescriptorSetLayout::null(),
            environment_layout: vk::DescriptorSetLayout::null(),
            asset_pool,
            brdf_lut: None,
        };
        // Drop cleans up whatever was created before a failure
        baker.init()?;
        Ok(baker)
    }

    fn init(&mut self) -> Result<()> {
        let device = self.gpu.device();
        unsafe {
            self.linear_sampler = create_sampler(device, SamplerKind::Clamp, 16.0)?;
            self.nearest_sampler = create_sampler(device, SamplerKind::Nearest, 0.0)?;
            self.source_layout = DescriptorSetLayoutBuilder::new()
                .sampled_image(0, vk::ShaderStageFlags::FRAGMENT)
                .build(device)?;
            self.environment_layout = DescriptorSetLayoutBuilder::new()
                .sampled_image(0, vk::ShaderStageFlags::FRAGMENT)
                .sampled_image(1, vk::ShaderStageFlags::FRAGMENT)
                .sampled_image(2, vk::ShaderStageFlags::FRAGMENT)
                .sampled_image(3, vk::ShaderStageFlags::FRAGMENT)
                .build(device)?;
        }
        self.brdf_lut = Some(self.bake_brdf_lut()?);
        Ok(())
    }

    /// Layout of the per-environment set (set 4 of the forward layout).
    pub fn environment_layout(&self) -> vk::DescriptorSetLayout {
        self.environment_layout
    }

    pub const fn config(&self) -> &IblConfig {
        &self.config
    }

    /// Bake the lit-but-featureless fallback environment.
    pub fn bake_neutral(&self) -> Result<IblAsset> {
        self.bake_with(Arc::new(EquirectImage::uniform(NEUTRAL_RADIANCE)), &IblConfig::NEUTRAL)
    }

    /// Bake all lighting data for an environment.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn bake(&self, source: Arc<EquirectImage>) -> Result<IblAsset> {
        self.bake_with(source, &self.config)
    }

    fn bake_with(&self, source: Arc<EquirectImage>, config: &IblConfig) -> Result<IblAsset> {
        let started = std::time::Instant::now();
        let environment = self.bake_environment(&source, config.environment_resolution)?;

        let irradiance = match self.bake_irradiance(&environment, config.irradiance_resolution) {
            Ok(irradiance) => irradiance,
            Err(e) => {
                environment.destroy(&self.gpu);
                return Err(e);
            }
        };
        let prefiltered = match self.bake_prefiltered(&environment, config.prefilter_resolution) {
            Ok(prefiltered) => prefiltered,
            Err(e) => {
                environment.destroy(&self.gpu);
                irradiance.destroy(&self.gpu);
                return Err(e);
            }
        };
        let descriptor_set = match self.write_asset_set(&environment, &irradiance, &prefiltered) {
            Ok(set) => set,
            Err(e) => {
                environment.destroy(&self.gpu);
                irradiance.destroy(&self.gpu);
                prefiltered.destroy(&self.gpu);
                return Err(e);
            }
        };

        tracing::info!(
            "Baked IBL from {}x{} source in {:.1?} ({} prefiltered mips)",
            source.width,
            source.height,
            started.elapsed(),
            prefiltered.mip_levels()
        );
        Ok(IblAsset {
            environment,
            irradiance,
            prefiltered,
            descriptor_set,
            source,
        })
    }

    fn write_asset_set(
        &self,
        environment: &Texture,
        irradiance: &Texture,
        prefiltered: &Texture,
    ) -> Result<vk::DescriptorSet> {
        let brdf_lut = self
            .brdf_lut
            .as_ref()
            .ok_or_else(|| RenderError::InvalidData("BRDF lookup texture missing".to_string()))?;
        let device = self.gpu.device();
        let set = unsafe { self.asset_pool.allocate_one(device, self.environment_layout) }
            .map_err(|_| RenderError::TableFull {
                kind: "environment",
                capacity: MAX_ENVIRONMENTS,
            })?;
        for (binding, view) in [environment.view, irradiance.view, prefiltered.view, brdf_lut.view]
            .into_iter()
            .enumerate()
        {
            unsafe {
                write_sampled_images(device, set, binding as u32, 0, &[(view, self.linear_sampler)]);
            }
        }
        Ok(set)
    }

    /// Project the equirect source onto a cubemap and blit its mip chain.
    fn bake_environment(&self, source: &EquirectImage, resolution: u32) -> Result<Texture> {
        let gpu = &*self.gpu;
        let mips = mip_count(resolution);
        let cube = Texture::cube(
            gpu,
            resolution,
            mips,
            vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST,
            "ibl_environment",
        )?;

        let result = self.with_uploaded_source(source, |source_view| {
            self.run_pass(
                prism_shaders::equirect_to_cube_frag(),
                CUBE_FORMAT,
                Some((source_view, self.nearest_sampler)),
                &cube,
                &[0],
                |cmd, pass| unsafe {
                    let device = gpu.device();
                    image_barrier(
                        device,
                        cmd,
                        cube.image.image,
                        cube.image.full_range(vk::ImageAspectFlags::COLOR),
                        ImageTransition::discard(
                            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                        ),
                    );
                    for face in 0..CUBE_FACES {
                        pass.draw_face(
                            cmd,
                            face,
                            0,
                            BakePushConstants {
                                face,
                                ..BakePushConstants::default()
                            },
                        );
                    }
                    record_mip_chain(device, cmd, &cube.image, resolution);
                    Ok(())
                },
            )
        });

        match result {
            Ok(()) => Ok(cube),
            Err(e) => {
                cube.destroy(gpu);
                Err(e)
            }
        }
    }

    fn bake_irradiance(&self, environment: &Texture, resolution: u32) -> Result<Texture> {
        let gpu = &*self.gpu;
        let cube = Texture::cube(gpu, resolution, 1, vk::ImageUsageFlags::empty(), "ibl_irradiance")?;
        let result = self.run_pass(
            prism_shaders::irradiance_frag(),
            CUBE_FORMAT,
            Some((environment.view, self.linear_sampler)),
            &cube,
            &[0],
            |cmd, pass| unsafe {
                begin_cube_writes(gpu.device(), cmd, &cube.image);
                for face in 0..CUBE_FACES {
                    pass.draw_face(
                        cmd,
                        face,
                        0,
                        BakePushConstants {
                            face,
                            ..BakePushConstants::default()
                        },
                    );
                }
                end_cube_writes(gpu.device(), cmd, &cube.image);
                Ok(())
            },
        );
        match result {
            Ok(()) => Ok(cube),
            Err(e) => {
                cube.destroy(gpu);
                Err(e)
            }
        }
    }

    fn bake_prefiltered(&self, environment: &Texture, resolution: u32) -> Result<Texture> {
        let gpu = &*self.gpu;
        let mips = mip_count(resolution);
        let cube = Texture::cube(gpu, resolution, mips, vk::ImageUsageFlags::empty(), "ibl_prefiltered")?;
        let levels: Vec<u32> = (0..mips).collect();
        let source_resolution = environment.resolution() as f32;
        let result = self.run_pass(
            prism_shaders::prefilter_frag(),
            CUBE_FORMAT,
            Some((environment.view, self.linear_sampler)),
            &cube,
            &levels,
            |cmd, pass| unsafe {
                begin_cube_writes(gpu.device(), cmd, &cube.image);
                for mip in 0..mips {
                    for face in 0..CUBE_FACES {
                        pass.draw_face(
                            cmd,
                            face,
                            mip,
                            BakePushConstants {
                                face,
                                sample_count: prefilter_samples(mip),
                                roughness: prefilter_roughness(mip, mips),
                                source_resolution,
                            },
                        );
                    }
                }
                end_cube_writes(gpu.device(), cmd, &cube.image);
                Ok(())
            },
        );
        match result {
            Ok(()) => Ok(cube),
            Err(e) => {
                cube.destroy(gpu);
                Err(e)
            }
        }
    }

    fn bake_brdf_lut(&self) -> Result<Texture> {
        let gpu = &*self.gpu;
        let size = self.config.brdf_lut_resolution.max(1);
        let lut = Texture::flat(
            gpu,
            size,
            size,
            BRDF_LUT_FORMAT,
            vk::ImageUsageFlags::COLOR_ATTACHMENT,
            "brdf_lut",
        )?;
        let result = self.run_pass(
            prism_shaders::brdf_lut_frag(),
            BRDF_LUT_FORMAT,
            None,
            &lut,
            &[0],
            |cmd, pass| unsafe {
                begin_cube_writes(gpu.device(), cmd, &lut.image);
                pass.draw_face(cmd, 0, 0, BakePushConstants::default());
                end_cube_writes(gpu.device(), cmd, &lut.image);
                Ok(())
            },
        );
        match result {
            Ok(()) => {
                tracing::debug!("BRDF lookup texture generated ({size}x{size})");
                Ok(lut)
            }
            Err(e) => {
                lut.destroy(gpu);
                Err(e)
            }
        }
    }

    /// Upload the equirect pixels into a temporary sampled image.
    fn with_uploaded_source<R>(
        &self,
        source: &EquirectImage,
        f: impl FnOnce(vk::ImageView) -> Result<R>,
    ) -> Result<R> {
        let gpu = &*self.gpu;
        let expected = (source.width * source.height * 4) as usize;
        if source.pixels.len() != expected {
            return Err(RenderError::InvalidData(format!(
                "environment has {} floats, expected {expected}",
                source.pixels.len()
            )));
        }

        let mut staging: GpuBuffer = gpu.allocator().lock().create_buffer_with_data(
            &source.pixels,
            vk::BufferUsageFlags::TRANSFER_SRC,
            "ibl_source_staging",
        )?;
        let image = match Texture::flat(
            gpu,
            source.width,
            source.height,
            SOURCE_FORMAT,
            vk::ImageUsageFlags::TRANSFER_DST,
            "ibl_source",
        ) {
            Ok(image) => image,
            Err(e) => {
                gpu.allocator().lock().free_buffer(&mut staging)?;
                return Err(e);
            }
        };

        let upload = unsafe {
            execute_single_time_commands(
                gpu.device(),
                &self.command_pool,
                gpu.graphics_queue(),
                BAKE_TIMEOUT,
                |cmd| {
                    let device = gpu.device();
                    let range = image.image.full_range(vk::ImageAspectFlags::COLOR);
                    image_barrier(
                        device,
                        cmd,
                        image.image.image,
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
                        .image_extent(image.image.extent);
                    device.cmd_copy_buffer_to_image(
                        cmd,
                        staging.buffer,
                        image.image.image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                    image_barrier(
                        device,
                        cmd,
                        image.image.image,
                        range,
                        ImageTransition {
                            old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                            src_stage: vk::PipelineStageFlags2::COPY,
                            src_access: vk::AccessFlags2::TRANSFER_WRITE,
                            dst_stage: vk::PipelineStageFlags2::FRAGMENT_SHADER,
                            dst_access: vk::AccessFlags2::SHADER_SAMPLED_READ,
                        },
                    );
                    Ok(())
                },
            )
        };

        let result = upload.map_err(RenderError::from).and_then(|()| f(image.view));
        image.destroy(gpu);
        gpu.allocator().lock().free_buffer(&mut staging)?;
        result
    }

    /// Create a throwaway pipeline, record `record` with it, wait, destroy.
    fn run_pass<F>(
        &self,
        fragment: &'static [u32],
        format: vk::Format,
        input: Option<(vk::ImageView, vk::Sampler)>,
        target: &Texture,
        mips: &[u32],
        record: F,
    ) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer, &BakePass<'_>) -> prism_gpu::Result<()>,
    {
        let gpu = &*self.gpu;
        let device = gpu.device();

        let pool = if input.is_some() {
            Some(unsafe {
                DescriptorPool::new(
                    device,
                    1,
                    &[vk::DescriptorPoolSize {
                        ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                        descriptor_count: 1,
                    }],
                )
            }?)
        } else {
            None
        };
        let mut pass = BakePass {
            device,
            pipeline: None,
            set: None,
            face_views: Vec::new(),
            target_resolution: target.resolution(),
            target_mips: target.mip_levels(),
        };

        let result = (|| -> Result<()> {
            let mut layouts = Vec::new();
            if let (Some(pool), Some((view, sampler))) = (&pool, input) {
                let set = unsafe { pool.allocate_one(device, self.source_layout) }?;
                unsafe { write_sampled_images(device, set, 0, 0, &[(view, sampler)]) };
                pass.set = Some(set);
                layouts.push(self.source_layout);
            }

            let config = GraphicsPipelineConfig {
                color_targets: vec![ColorTarget::opaque(format)],
                ..GraphicsPipelineConfig::fullscreen(fragment, prism_shaders::fullscreen_vert())
            };
            let push_range = vk::PushConstantRange::default()
                .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                .size(BakePushConstants::SIZE);
            pass.pipeline = Some(unsafe { GraphicsPipeline::new(device, &config, &layouts, &[push_range]) }?);

            for &mip in mips {
                for layer in 0..target.layers() {
                    let range = vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .base_mip_level(mip)
                        .level_count(1)
                        .base_array_layer(layer)
                        .layer_count(1);
                    let view = unsafe {
                        create_image_view(device, target.image.image, vk::ImageViewType::TYPE_2D, format, range)
                    }?;
                    pass.face_views.push((mip, layer, view));
                }
            }

            unsafe {
                execute_single_time_commands(
                    device,
                    &self.command_pool,
                    gpu.graphics_queue(),
                    BAKE_TIMEOUT,
                    |cmd| record(cmd, &pass),
                )
            }?;
            Ok(())
        })();

        pass.destroy();
        if let Some(pool) = pool {
            unsafe { pool.destroy(device) };
        }
        result
    }
}

impl Drop for IblBaker {
    fn drop(&mut self) {
        let device = self.gpu.device();
        if let Some(lut) = self.brdf_lut.take() {
            lut.destroy(&self.gpu);
        }
        unsafe {
            self.asset_pool.destroy(device);
            device.destroy_descriptor_set_layout(self.environment_layout, None);
            device.destroy_descriptor_set_layout(self.source_layout, None);
            device.destroy_sampler(self.linear_sampler, None);
            device.destroy_sampler(self.nearest_sampler, None);
            self.command_pool.destroy(device);
        }
    }
}

/// Recording state of one bake pass.
struct BakePass<'a> {
    device: &'a ash::Device,
    pipeline: Option<GraphicsPipeline>,
    set: Option<vk::DescriptorSet>,
    face_views: Vec<(u32, u32, vk::ImageView)>,
    target_resolution: u32,
    target_mips: u32,
}

impl BakePass<'_> {
    /// Render one fullscreen triangle into `face` at `mip`.
    unsafe fn draw_face(&self, cmd: vk::CommandBuffer, face: u32, mip: u32, params: BakePushConstants) {
        let (Some(pipeline), Some(&(_, _, view))) = (
            &self.pipeline,
            self.face_views.iter().find(|(m, l, _)| *m == mip && *l == face),
        ) else {
            return;
        };
        let size = (self.target_resolution >> mip.min(self.target_mips)).max(1);
        let extent = vk::Extent2D {
            width: size,
            height: size,
        };
        let attachments = [vk::RenderingAttachmentInfo::default()
            .image_view(view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::DONT_CARE)
            .store_op(vk::AttachmentStoreOp::STORE)];
        let rendering = vk::RenderingInfo::default()
            .render_area(vk::Rect2D::default().extent(extent))
            .layer_count(1)
            .color_attachments(&attachments);

        let device = self.device;
        device.cmd_begin_rendering(cmd, &rendering);
        set_viewport_scissor(device, cmd, extent);
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.pipeline);
        if let Some(set) = self.set {
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.layout,
                0,
                &[set],
                &[],
            );
        }
        device.cmd_push_constants(
            cmd,
            pipeline.layout,
            vk::ShaderStageFlags::FRAGMENT,
            0,
            bytemuck::bytes_of(&params),
        );
        device.cmd_draw(cmd, 3, 1, 0, 0);
        device.cmd_end_rendering(cmd);
    }

    fn destroy(&mut self) {
        unsafe {
            for (_, _, view) in self.face_views.drain(..) {
                self.device.destroy_image_view(view, None);
            }
            if let Some(pipeline) = self.pipeline.take() {
                pipeline.destroy(self.device);
            }
        }
    }
}

unsafe fn begin_cube_writes(device: &ash::Device, cmd: vk::CommandBuffer, image: &GpuImage) {
    image_barrier(
        device,
        cmd,
        image.image,
        image.full_range(vk::ImageAspectFlags::COLOR),
        ImageTransition::discard(
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        ),
    );
}

unsafe fn end_cube_writes(device: &ash::Device, cmd: vk::CommandBuffer, image: &GpuImage) {
    image_barrier(
        device,
        cmd,
        image.image,
        image.full_range(vk::ImageAspectFlags::COLOR),
        ImageTransition {
            old_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            src_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            src_access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            dst_stage: vk::PipelineStageFlags2::FRAGMENT_SHADER,
            dst_access: vk::AccessFlags2::SHADER_SAMPLED_READ,
        },
    );
}

/// Fill mips 1.. from mip 0 (already rendered, in attachment layout) by
/// successive blits, leaving every mip shader-readable.
unsafe fn record_mip_chain(device: &ash::Device, cmd: vk::CommandBuffer, image: &GpuImage, resolution: u32) {
    let level = |mip: u32| {
        vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .base_mip_level(mip)
            .level_count(1)
            .base_array_layer(0)
            .layer_count(CUBE_FACES)
    };
    let layers = |mip: u32| {
        vk::ImageSubresourceLayers::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .mip_level(mip)
            .base_array_layer(0)
            .layer_count(CUBE_FACES)
    };
    let corner = |size: u32| vk::Offset3D {
        x: size as i32,
        y: size as i32,
        z: 1,
    };

    image_barrier(
        device,
        cmd,
        image.image,
        level(0),
        ImageTransition {
            old_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            src_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            src_access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            dst_stage: vk::PipelineStageFlags2::BLIT,
            dst_access: vk::AccessFlags2::TRANSFER_READ,
        },
    );

    for mip in 1..image.mip_levels {
        image_barrier(
            device,
            cmd,
            image.image,
            level(mip),
            ImageTransition {
                old_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                src_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                src_access: vk::AccessFlags2::NONE,
                dst_stage: vk::PipelineStageFlags2::BLIT,
                dst_access: vk::AccessFlags2::TRANSFER_WRITE,
            },
        );
        let blit = vk::ImageBlit::default()
            .src_subresource(layers(mip - 1))
            .src_offsets([vk::Offset3D::default(), corner((resolution >> (mip - 1)).max(1))])
            .dst_subresource(layers(mip))
            .dst_offsets([vk::Offset3D::default(), corner((resolution >> mip).max(1))]);
        device.cmd_blit_image(
            cmd,
            image.image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            image.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[blit],
            vk::Filter::LINEAR,
        );
        image_barrier(
            device,
            cmd,
            image.image,
            level(mip),
            ImageTransition {
                old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                src_stage: vk::PipelineStageFlags2::BLIT,
                src_access: vk::AccessFlags2::TRANSFER_WRITE,
                dst_stage: vk::PipelineStageFlags2::BLIT,
                dst_access: vk::AccessFlags2::TRANSFER_READ,
            },
        );
    }

    image_barrier(
        device,
        cmd,
        image.image,
        image.full_range(vk::ImageAspectFlags::COLOR),
        ImageTransition {
            old_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            src_stage: vk::PipelineStageFlags2::BLIT,
            src_access: vk::AccessFlags2::TRANSFER_READ,
            dst_stage: vk::PipelineStageFlags2::FRAGMENT_SHADER,
            dst_access: vk::AccessFlags2::SHADER_SAMPLED_READ,
        },
    );
}

/// Load `path` and bake it. `Ok(None)` when the file cannot be decoded.
pub fn import_environment(baker: &IblBaker, path: &Path) -> Result<Option<IblAsset>> {
    let Some(source) = EquirectImage::load(path) else {
        return Ok(None);
    };
    baker.bake(Arc::new(source)).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn roughness_spans_zero_to_one() {
        let mips = mip_count(128);
        assert_eq!(mips, 8);
        assert_relative_eq!(prefilter_roughness(0, mips), 0.0);
        assert_relative_eq!(prefilter_roughness(mips - 1, mips), 1.0);
        assert_relative_eq!(prefilter_roughness(0, 1), 0.0);
    }

    #[test]
    fn sample_count_grows_and_saturates() {
        assert_eq!(prefilter_samples(0), 64);
        assert_eq!(prefilter_samples(1), 128);
        assert_eq!(prefilter_samples(4), 1024);
        assert_eq!(prefilter_samples(7), 1024);
        assert_eq!(prefilter_samples(40), 1024);
        for mip in 0..=40 {
            assert!(prefilter_samples(mip) >= 64, "mip {mip}");
        }
        assert_eq!(prefilter_samples(26), 1024);
        assert_eq!(prefilter_samples(31), 1024);
    }

    #[test]
    fn default_sizes() {
        let config = IblConfig::default();
        assert_eq!(config.irradiance_resolution, 32);
        assert_eq!(config.brdf_lut_resolution, 512);
        assert_eq!(mip_count(config.environment_resolution), 10);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        assert!(EquirectImage::load(Path::new("/nonexistent/sky.hdr")).is_none());
    }

    #[test]
    fn uniform_environment_is_one_texel() {
        let image = EquirectImage::uniform([1.0, 2.0, 3.0, 1.0]);
        assert_eq!(image.pixels.len(), 4);
        assert_eq!((image.width, image.height), (1, 1));
    }

    #[test]
    fn bake_constants_are_16_bytes() {
        assert_eq!(BakePushConstants::SIZE, 16);
    }
}
