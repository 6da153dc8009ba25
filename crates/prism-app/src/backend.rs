//! Swapchain-backed frame backend driving the raster pipeline.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use parking_lot::Mutex;
use prism_core::constants::FRAMES_IN_FLIGHT;
use prism_core::{PickResult, SceneSource};
use prism_gpu::command::{begin_command_buffer, end_command_buffer, submit_command_buffer};
use prism_gpu::{CommandPool, FrameSync, GpuContext, GpuError, SurfaceContext, Swapchain};
use prism_render::{FrameStats, OutputImage, RasterConfig, RasterPipeline, RenderResources};

use crate::error::FrameError;
use crate::orchestrator::FrameBackend;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-slot command buffer and sync objects.
struct FrameSlot {
    sync: FrameSync,
    command_buffer: vk::CommandBuffer,
}

/// Frame backend presenting the raster pipeline to a window surface.
pub struct VulkanFrameBackend {
    gpu: Arc<GpuContext>,
    surface: SurfaceContext,
    swapchain: Option<Swapchain>,
    vsync: bool,
    requested: (u32, u32),
    command_pool: CommandPool,
    slots: Vec<FrameSlot>,
    pipeline: Option<RasterPipeline>,
    resources: Arc<Mutex<RenderResources>>,
    scene: Arc<dyn SceneSource>,
    needs_recreate: bool,
    last_stats: FrameStats,
}

impl VulkanFrameBackend {
    /// Create the swapchain, frame slots and raster pipeline.
    ///
    /// Takes ownership of `surface`; it is destroyed with the backend.
    pub fn new(
        gpu: Arc<GpuContext>,
        surface: SurfaceContext,
        size: (u32, u32),
        vsync: bool,
        resources: Arc<Mutex<RenderResources>>,
        scene: Arc<dyn SceneSource>,
        raster: RasterConfig,
    ) -> Result<Self, FrameError> {
        let command_pool = match unsafe {
            CommandPool::new(
                gpu.device(),
                gpu.graphics_queue_family(),
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )
        } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { surface.destroy() };
                return Err(e.into());
            }
        };

        // Everything below is released by Drop on failure
        let mut backend = Self {
            gpu: Arc::clone(&gpu),
            surface,
            swapchain: None,
            vsync,
            requested: size,
            command_pool,
            slots: Vec::with_capacity(FRAMES_IN_FLIGHT),
            pipeline: None,
            resources,
            scene,
            needs_recreate: false,
            last_stats: FrameStats::default(),
        };

        for _ in 0..FRAMES_IN_FLIGHT {
            let sync = unsafe { FrameSync::new(gpu.device()) }?;
            let command_buffer = match unsafe {
                backend
                    .command_pool
                    .allocate_command_buffer(gpu.device(), vk::CommandBufferLevel::PRIMARY)
            } {
                Ok(cmd) => cmd,
                Err(e) => {
                    unsafe { sync.destroy(gpu.device()) };
                    return Err(e.into());
                }
            };
            backend.slots.push(FrameSlot {
                sync,
                command_buffer,
            });
        }

        let swapchain = unsafe {
            backend
                .surface
                .create_swapchain(&gpu, size.0, size.1, vsync, None)
        }?;
        let (format, extent, images) =
            (swapchain.format, swapchain.extent, swapchain.images.len());
        backend.swapchain = Some(swapchain);

        let mut pipeline = RasterPipeline::new(
            Arc::clone(&gpu),
            &backend.resources.lock(),
            format,
            raster,
        )?;
        pipeline.resize(extent, images)?;
        backend.pipeline = Some(pipeline);

        tracing::info!(
            "Frame backend ready: {}x{} {format:?}, {FRAMES_IN_FLIGHT} slots",
            extent.width,
            extent.height
        );
        Ok(backend)
    }

    /// Current swapchain extent.
    pub fn extent(&self) -> Option<vk::Extent2D> {
        self.swapchain.as_ref().map(|swapchain| swapchain.extent)
    }

    pub const fn last_stats(&self) -> FrameStats {
        self.last_stats
    }

    /// Decode the selection attachment of the last recorded frame.
    ///
    /// The device must be idle.
    pub fn pick(&self, x: u32, y: u32) -> Result<PickResult, FrameError> {
        match &self.pipeline {
            Some(pipeline) => Ok(pipeline.pick(x, y)?),
            None => Ok(PickResult::Nothing),
        }
    }

    /// Raw selection texel of the last recorded frame.
    pub fn selection_texel(&self, x: u32, y: u32) -> Result<Option<[f32; 3]>, FrameError> {
        match &self.pipeline {
            Some(pipeline) => Ok(pipeline.selection_texel(x, y)?),
            None => Ok(None),
        }
    }

    /// Rebuild the swapchain and target sets. Returns `false` while the
    /// window has no area.
    fn recreate_swapchain(&mut self) -> Result<bool, FrameError> {
        let (width, height) = self.requested;
        let caps = self.surface.capabilities(&self.gpu)?;
        let current = caps.capabilities.current_extent;
        if width == 0 || height == 0 || current.width == 0 || current.height == 0 {
            return Ok(false);
        }

        self.gpu.wait_idle()?;
        let swapchain = match self.swapchain.take() {
            Some(old) => unsafe {
                self.surface
                    .recreate_swapchain(&self.gpu, old, width, height, self.vsync)
            },
            None => unsafe {
                self.surface
                    .create_swapchain(&self.gpu, width, height, self.vsync, None)
            },
        }?;
        let (extent, images) = (swapchain.extent, swapchain.images.len());
        self.swapchain = Some(swapchain);

        if let Some(pipeline) = &mut self.pipeline {
            pipeline.resize(extent, images)?;
        }
        self.needs_recreate = false;
        tracing::info!("Swapchain recreated at {}x{}", extent.width, extent.height);
        Ok(true)
    }

    fn record_commands(&mut self, slot: usize, image: u32) -> Result<(), FrameError> {
        let device = self.gpu.device();
        let cmd = self.slots[slot].command_buffer;
        let swapchain = self
            .swapchain
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("no swapchain".to_string()))?;
        let output = OutputImage {
            image: swapchain.images[image as usize],
            view: swapchain.image_views[image as usize],
            target_index: image as usize,
            final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        };
        let pipeline = self
            .pipeline
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("no raster pipeline".to_string()))?;
        let snapshot = self.scene.snapshot();

        unsafe {
            device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        }
        let stats = pipeline.record(cmd, slot, output, &snapshot, &self.resources.lock())?;
        unsafe { end_command_buffer(device, cmd) }?;

        self.last_stats = stats;
        Ok(())
    }

    /// Consume the slot's acquire semaphore and signal its fence without
    /// rendering.
    fn submit_empty(&self, slot: usize) -> Result<(), FrameError> {
        let sync = &self.slots[slot].sync;
        let wait_semaphores = [sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages);
        unsafe {
            self.gpu.device().queue_submit(
                self.gpu.graphics_queue(),
                &[submit_info],
                sync.in_flight,
            )?;
        }
        Ok(())
    }
}

impl FrameBackend for VulkanFrameBackend {
    fn wait_slot(&mut self, slot: usize, timeout: Duration) -> Result<(), FrameError> {
        unsafe { self.slots[slot].sync.wait(self.gpu.device(), timeout) }
            .map_err(|e| FrameError::from_fence(slot, e))
    }

    fn acquire(&mut self, slot: usize) -> Result<Option<u32>, FrameError> {
        if self.needs_recreate && !self.recreate_swapchain()? {
            return Ok(None);
        }
        let Some(swapchain) = &self.swapchain else {
            return Ok(None);
        };

        let timeout_ns = u64::try_from(ACQUIRE_TIMEOUT.as_nanos()).unwrap_or(u64::MAX);
        let acquired = unsafe {
            swapchain.acquire_next_image(
                &self.surface.swapchain_loader,
                self.slots[slot].sync.image_available,
                timeout_ns,
            )
        }?;
        match acquired {
            Some((index, suboptimal)) => {
                self.needs_recreate |= suboptimal;
                Ok(Some(index))
            }
            None => {
                self.needs_recreate = true;
                Ok(None)
            }
        }
    }

    fn reset_slot(&mut self, slot: usize) -> Result<(), FrameError> {
        unsafe { self.slots[slot].sync.reset(self.gpu.device()) }?;
        Ok(())
    }

    fn record(&mut self, slot: usize, image: u32) -> Result<(), FrameError> {
        let result = self.record_commands(slot, image);
        if result.is_err() {
            // The acquired image is never presented; release it by rebuilding
            self.needs_recreate = true;
            self.submit_empty(slot)?;
        }
        result
    }

    fn submit(&mut self, slot: usize) -> Result<(), FrameError> {
        let frame = &self.slots[slot];
        unsafe {
            submit_command_buffer(
                self.gpu.device(),
                self.gpu.graphics_queue(),
                frame.command_buffer,
                Some((
                    frame.sync.image_available,
                    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                )),
                Some(frame.sync.render_finished),
                frame.sync.in_flight,
            )
        }?;
        Ok(())
    }

    fn present(&mut self, slot: usize, image: u32) -> Result<(), FrameError> {
        let Some(swapchain) = &self.swapchain else {
            return Ok(());
        };
        let presented = unsafe {
            swapchain.present(
                &self.surface.swapchain_loader,
                self.gpu.graphics_queue(),
                image,
                &[self.slots[slot].sync.render_finished],
            )
        };
        match presented {
            Ok(recreate) => {
                self.needs_recreate |= recreate;
                Ok(())
            }
            Err(e) => {
                self.needs_recreate = true;
                Err(e.into())
            }
        }
    }

    fn wait_device_idle(&mut self) -> Result<(), FrameError> {
        self.gpu.wait_idle()?;
        Ok(())
    }

    /// Rebuild the swapchain and target sets now. A zero-sized window defers
    /// the rebuild to the first acquire after it is restored.
    fn resize(&mut self, width: u32, height: u32) -> Result<(), FrameError> {
        self.requested = (width, height);
        self.needs_recreate = true;
        self.recreate_swapchain()?;
        Ok(())
    }
}

impl Drop for VulkanFrameBackend {
    fn drop(&mut self) {
        if let Err(e) = self.gpu.wait_idle() {
            tracing::warn!("Device wait failed during frame backend teardown: {e}");
        }
        self.pipeline = None;

        let device = self.gpu.device();
        unsafe {
            for slot in &self.slots {
                slot.sync.destroy(device);
            }
            self.command_pool.destroy(device);
            if let Some(swapchain) = self.swapchain.take() {
                swapchain.destroy(device, &self.surface.swapchain_loader);
            }
            self.surface.destroy();
        }
        tracing::debug!("Frame backend destroyed");
    }
}
