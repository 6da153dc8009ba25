//! Engine facade tying the frame loop, resource tables and path tracer
//! together.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use prism_core::{
    EnvironmentKey, Material, MaterialId, MeshData, MeshId, PickResult, RenderSettings,
    SceneSource, TextureId,
};
use prism_gpu::{GpuContext, GpuContextBuilder, SurfaceContext};
use prism_render::RenderResources;
use prism_rt::{PathTracer, RenderReport};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::backend::VulkanFrameBackend;
use crate::config::EngineConfig;
use crate::error::{EngineError, FrameError, Result};
use crate::orchestrator::{FrameLoop, LoopState};

/// A windowed renderer.
///
/// The raster path runs continuously on the frame loop thread while active.
/// Anything that touches the shared resource tables or the graphics queue
/// from the caller's thread pauses the loop first.
pub struct Engine {
    // Field order is drop order: the loop thread must stop first
    frame_loop: FrameLoop<VulkanFrameBackend>,
    tracer: Option<PathTracer>,
    resources: Arc<Mutex<RenderResources>>,
    scene: Arc<dyn SceneSource>,
    gpu: Arc<GpuContext>,
}

impl Engine {
    /// Create the device, window surface, raster pipeline and frame loop.
    ///
    /// The loop starts idle; call [`Engine::set_active`] to begin rendering.
    /// A device without ray tracing support still yields a working engine.
    pub fn new<W>(
        window: &W,
        size: (u32, u32),
        scene: Arc<dyn SceneSource>,
        config: EngineConfig,
    ) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let gpu = Arc::new(
            GpuContextBuilder::new()
                .app_name(config.app_name.clone())
                .validation(config.validation)
                .build()?,
        );
        tracing::info!("GPU: {}", gpu.capabilities().summary());

        let surface = unsafe { SurfaceContext::from_window(&gpu, window) }?;
        let resources = Arc::new(Mutex::new(RenderResources::new(
            Arc::clone(&gpu),
            config.ibl,
        )?));
        let backend = VulkanFrameBackend::new(
            Arc::clone(&gpu),
            surface,
            size,
            config.vsync,
            Arc::clone(&resources),
            Arc::clone(&scene),
            config.raster_config(),
        )?;

        let tracer = match PathTracer::new(Arc::clone(&gpu)) {
            Ok(tracer) => Some(tracer),
            Err(e) => {
                tracing::warn!("Ray tracing disabled: {e}");
                None
            }
        };

        let frame_loop = FrameLoop::start(backend, config.loop_config())?;

        Ok(Self {
            frame_loop,
            tracer,
            resources,
            scene,
            gpu,
        })
    }

    pub fn gpu(&self) -> &Arc<GpuContext> {
        &self.gpu
    }

    /// Start or stop continuous rendering.
    pub fn set_active(&self, active: bool) {
        self.frame_loop.set_active(active);
    }

    pub fn state(&self) -> LoopState {
        self.frame_loop.state()
    }

    /// Frames presented so far.
    pub fn frames(&self) -> u64 {
        self.frame_loop.frames()
    }

    /// The error that stopped the frame loop, if any.
    pub fn take_error(&self) -> Option<FrameError> {
        self.frame_loop.take_error()
    }

    pub const fn ray_tracing_available(&self) -> bool {
        self.tracer.is_some()
    }

    /// Pause the loop, run `f` on the resource tables, then resume.
    pub fn with_paused<R>(
        &self,
        f: impl FnOnce(&mut RenderResources) -> prism_render::Result<R>,
    ) -> Result<R> {
        let _pause = self.frame_loop.pause()?;
        let mut resources = self.resources.lock();
        Ok(f(&mut resources)?)
    }

    pub fn add_mesh(&self, mesh: MeshData) -> Result<MeshId> {
        self.with_paused(|resources| resources.add_mesh(mesh))
    }

    pub fn add_material(&self, material: Material) -> Result<MaterialId> {
        self.with_paused(|resources| resources.add_material(material))
    }

    pub fn update_material(&self, id: MaterialId, material: Material) -> Result<()> {
        self.with_paused(|resources| resources.update_material(id, material))
    }

    /// Upload RGBA8 pixels into the shared texture array.
    pub fn add_texture(&self, width: u32, height: u32, pixels: &[u8], srgb: bool) -> Result<TextureId> {
        self.with_paused(|resources| resources.add_texture(width, height, pixels, srgb))
    }

    /// Import and bake an equirectangular environment.
    ///
    /// Returns `None` when the file cannot be decoded; the renderers then
    /// keep using the neutral environment.
    pub fn import_environment(&self, path: &Path) -> Result<Option<EnvironmentKey>> {
        self.with_paused(|resources| resources.import_environment(path))
    }

    /// Rebuild the swapchain and render targets for a new window size.
    pub fn resize(&self, width: u32, height: u32) -> Result<()> {
        self.frame_loop.resize(width, height)?;
        Ok(())
    }

    /// Resolve what is under pixel (`x`, `y`) of the last presented frame.
    pub fn pick(&self, x: u32, y: u32) -> Result<PickResult> {
        let _pause = self.frame_loop.pause()?;
        let result = self.frame_loop.backend().lock().pick(x, y)?;
        tracing::debug!("Pick at ({x}, {y}): {result:?}");
        Ok(result)
    }

    /// Raw selection texel at pixel (`x`, `y`) of the last presented frame.
    pub fn selection_texel(&self, x: u32, y: u32) -> Result<Option<[f32; 3]>> {
        let _pause = self.frame_loop.pause()?;
        Ok(self.frame_loop.backend().lock().selection_texel(x, y)?)
    }

    /// Path trace the current scene to `settings.output`.
    ///
    /// The raster loop is paused for the duration of the render. Returns
    /// `Ok(None)` when the scene has nothing to trace.
    pub fn render_scene(&mut self, settings: &RenderSettings) -> Result<Option<RenderReport>> {
        let tracer = self
            .tracer
            .as_mut()
            .ok_or(EngineError::RayTracingUnavailable)?;
        let _pause = self.frame_loop.pause()?;

        let snapshot = self.scene.snapshot();
        let resources = self.resources.lock();
        let environment = resources.environment(snapshot.skybox.as_ref())?;
        let source = environment.active.then_some(environment.source);

        let report = tracer.render(&snapshot, &*resources, source.as_deref(), settings)?;
        if let Some(report) = &report {
            tracing::info!(
                "Path traced {} BLAS / {} instances in {:.2?} to {}",
                report.blas_count,
                report.tlas_instance_count,
                report.elapsed,
                report.path.display()
            );
        }
        Ok(report)
    }

    /// Stop the frame loop. Further rendering requires a new engine.
    pub fn shutdown(&mut self) {
        self.frame_loop.exit_loop();
    }
}
