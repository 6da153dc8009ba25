//! Test harness for the Prism engine.
//!
//! Provides a headless engine (no window, no swapchain) that renders the
//! raster path into an offscreen image and drives the path tracer directly.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use ash::vk;
use glam::{Mat4, Vec3};
use prism_core::constants::FRAMES_IN_FLIGHT;
use prism_core::{
    Camera, DirectionalLight, EnvironmentKey, LambertMaterial, Material, MeshData, ObjectId,
    PbrMaterial, PickResult, RenderSettings, SceneObject, SceneObjectFlags, SceneSnapshot,
};
use prism_gpu::command::{begin_command_buffer, end_command_buffer, submit_command_buffer};
use prism_gpu::image::create_image_view;
use prism_gpu::sync::{create_fence, wait_for_fence};
use prism_gpu::{CommandPool, GpuContext, GpuContextBuilder, GpuImage, MemoryLocation};
use prism_render::{
    FrameStats, IblConfig, OutputImage, RasterConfig, RasterPipeline, RenderResources,
};
use prism_rt::{PathTracer, RenderReport};

pub type Result<T> = anyhow::Result<T>;

const OUTPUT_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
const FRAME_TIMEOUT: Duration = Duration::from_secs(10);

/// Offscreen raster output.
struct Offscreen {
    pipeline: RasterPipeline,
    image: GpuImage,
    view: vk::ImageView,
    extent: vk::Extent2D,
}

/// Headless GPU context with resource tables, an optional offscreen raster
/// pipeline and an optional path tracer.
pub struct HeadlessEngine {
    offscreen: Option<Offscreen>,
    tracer: Option<PathTracer>,
    resources: RenderResources,
    command_pool: CommandPool,
    frames: usize,
    gpu: Arc<GpuContext>,
}

impl HeadlessEngine {
    /// Create a headless engine with small IBL bakes.
    pub fn new() -> Result<Self> {
        Self::with_ibl(
            IblConfig::default()
                .with_environment_resolution(128)
                .with_prefilter_resolution(64),
        )
    }

    pub fn with_ibl(ibl: IblConfig) -> Result<Self> {
        let gpu = Arc::new(
            GpuContextBuilder::new()
                .app_name("prism-test")
                .validation(cfg!(debug_assertions))
                .headless()
                .build()
                .context("headless GPU context")?,
        );
        let resources = RenderResources::new(Arc::clone(&gpu), ibl)?;
        let command_pool = unsafe {
            CommandPool::new(
                gpu.device(),
                gpu.graphics_queue_family(),
                vk::CommandPoolCreateFlags::TRANSIENT,
            )
        }?;
        let tracer = match PathTracer::new(Arc::clone(&gpu)) {
            Ok(tracer) => Some(tracer),
            Err(e) => {
                tracing::warn!("Path tracer unavailable: {e}");
                None
            }
        };

        Ok(Self {
            offscreen: None,
            tracer,
            resources,
            command_pool,
            frames: 0,
            gpu,
        })
    }

    pub fn gpu(&self) -> &Arc<GpuContext> {
        &self.gpu
    }

    pub const fn resources(&self) -> &RenderResources {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut RenderResources {
        &mut self.resources
    }

    pub const fn tracer(&self) -> Option<&PathTracer> {
        self.tracer.as_ref()
    }

    pub fn import_environment(&mut self, path: &Path) -> Result<Option<EnvironmentKey>> {
        Ok(self.resources.import_environment(path)?)
    }

    /// Path trace `scene` to `settings.output`.
    pub fn trace(
        &mut self,
        scene: &SceneSnapshot,
        settings: &RenderSettings,
    ) -> Result<Option<RenderReport>> {
        let tracer = self
            .tracer
            .as_mut()
            .ok_or_else(|| anyhow!("ray tracing is not available on this device"))?;
        let environment = self.resources.environment(scene.skybox.as_ref())?;
        let source = environment.active.then_some(environment.source);
        Ok(tracer.render(scene, &self.resources, source.as_deref(), settings)?)
    }

    /// Create the offscreen raster pipeline at `width` x `height`.
    pub fn enable_raster(&mut self, width: u32, height: u32) -> Result<()> {
        if let Some(old) = self.offscreen.take() {
            self.destroy_offscreen(old);
        }

        let extent = vk::Extent2D { width, height };
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(OUTPUT_FORMAT)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let mut image =
            self.gpu
                .allocator()
                .lock()
                .create_image(&info, MemoryLocation::GpuOnly, "headless_output")?;
        let view = match unsafe {
            create_image_view(
                self.gpu.device(),
                image.image,
                vk::ImageViewType::TYPE_2D,
                OUTPUT_FORMAT,
                image.full_range(vk::ImageAspectFlags::COLOR),
            )
        } {
            Ok(view) => view,
            Err(e) => {
                self.gpu.allocator().lock().free_image(&mut image)?;
                return Err(e.into());
            }
        };

        let pipeline = RasterPipeline::new(
            Arc::clone(&self.gpu),
            &self.resources,
            OUTPUT_FORMAT,
            RasterConfig {
                samples: vk::SampleCountFlags::TYPE_1,
                ..RasterConfig::default()
            },
        )
        .and_then(|mut pipeline| {
            pipeline.resize(extent, 1)?;
            Ok(pipeline)
        });
        match pipeline {
            Ok(pipeline) => {
                self.offscreen = Some(Offscreen {
                    pipeline,
                    image,
                    view,
                    extent,
                });
                Ok(())
            }
            Err(e) => {
                unsafe { self.gpu.device().destroy_image_view(view, None) };
                self.gpu.allocator().lock().free_image(&mut image)?;
                Err(e.into())
            }
        }
    }

    pub fn raster_extent(&self) -> Option<vk::Extent2D> {
        self.offscreen.as_ref().map(|offscreen| offscreen.extent)
    }

    /// Record, submit and wait for one raster frame.
    pub fn render_frame(&mut self, scene: &SceneSnapshot) -> Result<FrameStats> {
        let offscreen = self
            .offscreen
            .as_mut()
            .ok_or_else(|| anyhow!("raster output not enabled"))?;
        let slot = self.frames % FRAMES_IN_FLIGHT;
        let output = OutputImage {
            image: offscreen.image.image,
            view: offscreen.view,
            target_index: 0,
            final_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        };

        let device = self.gpu.device();
        let cmd = unsafe {
            self.command_pool
                .allocate_command_buffer(device, vk::CommandBufferLevel::PRIMARY)
        }?;
        let fence = match unsafe { create_fence(device, false) } {
            Ok(fence) => fence,
            Err(e) => {
                unsafe { device.free_command_buffers(self.command_pool.handle(), &[cmd]) };
                return Err(e.into());
            }
        };

        let resources = &self.resources;
        let queue = self.gpu.graphics_queue();
        let result = (|| -> Result<FrameStats> {
            unsafe {
                begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
            }
            let stats = offscreen
                .pipeline
                .record(cmd, slot, output, scene, resources)?;
            unsafe {
                end_command_buffer(device, cmd)?;
                submit_command_buffer(device, queue, cmd, None, None, fence)?;
                wait_for_fence(device, fence, FRAME_TIMEOUT)?;
            }
            Ok(stats)
        })();

        unsafe {
            device.destroy_fence(fence, None);
            device.free_command_buffers(self.command_pool.handle(), &[cmd]);
        }
        self.frames += 1;
        result
    }

    /// Decode the selection texel at (`x`, `y`) of the last frame.
    pub fn pick(&self, x: u32, y: u32) -> Result<PickResult> {
        match &self.offscreen {
            Some(offscreen) => Ok(offscreen.pipeline.pick(x, y)?),
            None => Ok(PickResult::Nothing),
        }
    }

    pub fn selection_texel(&self, x: u32, y: u32) -> Result<Option<[f32; 3]>> {
        match &self.offscreen {
            Some(offscreen) => Ok(offscreen.pipeline.selection_texel(x, y)?),
            None => Ok(None),
        }
    }

    fn destroy_offscreen(&self, offscreen: Offscreen) {
        let Offscreen {
            pipeline,
            mut image,
            view,
            ..
        } = offscreen;
        if let Err(e) = self.gpu.wait_idle() {
            tracing::warn!("Device wait failed: {e}");
        }
        drop(pipeline);
        unsafe { self.gpu.device().destroy_image_view(view, None) };
        if let Err(e) = self.gpu.allocator().lock().free_image(&mut image) {
            tracing::warn!("Failed to free headless output: {e}");
        }
    }
}

impl Drop for HeadlessEngine {
    fn drop(&mut self) {
        if let Some(offscreen) = self.offscreen.take() {
            self.destroy_offscreen(offscreen);
        }
        if let Err(e) = self.gpu.wait_idle() {
            tracing::warn!("Device wait failed: {e}");
        }
        unsafe { self.command_pool.destroy(self.gpu.device()) };
    }
}

/// A lit test scene: `count` cubes in a row on a ground plane, one
/// directional light and a camera framing them.
///
/// The ground plane is not counted in `count`; the scene has `count + 1`
/// mesh-bearing objects.
pub fn row_of_cubes(resources: &mut RenderResources, count: u32) -> Result<SceneSnapshot> {
    let cube = resources.add_mesh(MeshData::cube(0.5))?;
    let ground = resources.add_mesh(MeshData::plane(10.0))?;
    let red = resources.add_material(Material::Pbr(PbrMaterial {
        base_color: [0.8, 0.1, 0.1, 1.0],
        roughness: 0.4,
        ..PbrMaterial::default()
    }))?;
    let grey = resources.add_material(Material::Lambert(LambertMaterial::default()))?;

    let width = count as f32 * 1.5;
    let mut objects: Vec<SceneObject> = (0..count)
        .map(|i| {
            let x = i as f32 * 1.5 - width * 0.5 + 0.75;
            SceneObject::new(ObjectId(i + 1))
                .with_mesh(cube)
                .with_material(red)
                .with_transform(Mat4::from_translation(Vec3::new(x, 0.5, 0.0)))
        })
        .collect();
    objects.push(
        SceneObject::new(ObjectId(0))
            .with_mesh(ground)
            .with_material(grey),
    );

    Ok(SceneSnapshot {
        camera: Camera::looking_at(
            Vec3::new(0.0, 2.0, width.max(3.0) + 2.0),
            Vec3::new(0.0, 0.5, 0.0),
            std::f32::consts::FRAC_PI_4,
            1.0,
        ),
        sun: Some(DirectionalLight::default()),
        objects,
        ..SceneSnapshot::default()
    })
}

/// Mark object `id` selected so the transform gizmo is drawn on it.
pub fn select(scene: &mut SceneSnapshot, id: ObjectId) {
    for object in &mut scene.objects {
        object.flags.set(SceneObjectFlags::SELECTED, object.id == id);
    }
}

/// Write a small horizontal-gradient Radiance HDR file.
pub fn write_test_hdr(path: &Path, width: u32, height: u32) -> Result<()> {
    let image = image::Rgb32FImage::from_fn(width, height, |x, y| {
        let u = x as f32 / width as f32;
        let v = y as f32 / height as f32;
        image::Rgb([u * 4.0, 1.0 - v, 0.5])
    });
    image
        .save_with_format(path, image::ImageFormat::Hdr)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn selecting_marks_exactly_one_object() {
        let mut scene = SceneSnapshot {
            objects: (0..4).map(|i| SceneObject::new(ObjectId(i))).collect(),
            ..SceneSnapshot::default()
        };
        select(&mut scene, ObjectId(2));
        let selected: Vec<u32> = scene
            .objects
            .iter()
            .filter(|o| o.is_selected())
            .map(|o| o.id.0)
            .collect();
        assert_eq!(selected, vec![2]);
        assert!(scene.objects.iter().all(SceneObject::is_visible));
    }

    #[test]
    fn test_hdr_is_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gradient.hdr");
        write_test_hdr(&path, 16, 8).unwrap();
        let decoded = image::open(&path).unwrap().into_rgb32f();
        assert_eq!((decoded.width(), decoded.height()), (16, 8));

        let [r, g, b] = decoded.get_pixel(8, 4).0;
        assert_relative_eq!(r, 2.0, max_relative = 0.02);
        assert_relative_eq!(g, 0.5, max_relative = 0.02);
        assert_relative_eq!(b, 0.5, max_relative = 0.02);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn headless_engine_creation() {
        let engine = HeadlessEngine::new().unwrap();
        assert!(engine.raster_extent().is_none());
    }
}
