//! Per-swapchain-image render targets, tagged by swapchain generation.

use ash::vk;
use prism_gpu::descriptors::{write_sampled_images, DescriptorPool};
use prism_gpu::image::create_image_view;
use prism_gpu::{GpuContext, GpuImage, MemoryLocation};

use crate::error::{RenderError, Result};

/// HDR forward color.
pub const COLOR_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
/// `[id, selected, marker, 0]` per pixel.
pub const SELECTION_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// An image plus its default view.
pub struct Attachment {
    pub image: GpuImage,
    pub view: vk::ImageView,
}

impl Attachment {
    fn new(
        gpu: &GpuContext,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        samples: vk::SampleCountFlags,
        name: &str,
    ) -> Result<Self> {
        let aspect = if format == DEPTH_FORMAT {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let mut image = gpu
            .allocator()
            .lock()
            .create_image(&info, MemoryLocation::GpuOnly, name)?;
        let range = image.full_range(aspect);
        match unsafe {
            create_image_view(gpu.device(), image.image, vk::ImageViewType::TYPE_2D, format, range)
        } {
            Ok(view) => Ok(Self { image, view }),
            Err(e) => {
                gpu.allocator().lock().free_image(&mut image)?;
                Err(e.into())
            }
        }
    }

    fn destroy(mut self, gpu: &GpuContext) {
        unsafe { gpu.device().destroy_image_view(self.view, None) };
        if let Err(e) = gpu.allocator().lock().free_image(&mut self.image) {
            tracing::warn!("Failed to free attachment: {e}");
        }
    }
}

/// Every attachment one frame renders into.
///
/// With single sampling the multisampled attachments are absent and the
/// forward pass writes the resolve targets directly.
pub struct RenderTargetSet {
    pub color_msaa: Option<Attachment>,
    pub selection_msaa: Option<Attachment>,
    pub depth: Attachment,
    /// Resolved color, sampled by the post pass.
    pub color: Attachment,
    /// Resolved selection, sampled by the post pass and copied for picking.
    pub selection: Attachment,
    /// Host-visible linear copy of `selection`.
    pub staging: GpuImage,
    pub staging_layout: vk::SubresourceLayout,
    /// Post pass inputs: resolved color and selection.
    pub post_set: vk::DescriptorSet,
    pub extent: vk::Extent2D,
}

impl RenderTargetSet {
    fn new(
        gpu: &GpuContext,
        extent: vk::Extent2D,
        samples: vk::SampleCountFlags,
        post_set: vk::DescriptorSet,
        sampler: vk::Sampler,
    ) -> Result<Self> {
        let mut created: Vec<Attachment> = Vec::with_capacity(5);
        let result = Self::create_attachments(gpu, extent, samples, &mut created);
        if let Err(e) = result {
            for attachment in created {
                attachment.destroy(gpu);
            }
            return Err(e);
        }

        let staging = match Self::create_staging(gpu, extent) {
            Ok(staging) => staging,
            Err(e) => {
                for attachment in created {
                    attachment.destroy(gpu);
                }
                return Err(e);
            }
        };
        let staging_layout = unsafe {
            gpu.device().get_image_subresource_layout(
                staging.image,
                vk::ImageSubresource {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    array_layer: 0,
                },
            )
        };

        let mut attachments = created.into_iter();
        let (color_msaa, selection_msaa) = if samples == vk::SampleCountFlags::TYPE_1 {
            (None, None)
        } else {
            (attachments.next(), attachments.next())
        };
        let (Some(depth), Some(color), Some(selection)) =
            (attachments.next(), attachments.next(), attachments.next())
        else {
            return Err(RenderError::InvalidData(
                "render target set is missing attachments".to_string(),
            ));
        };

        unsafe {
            write_sampled_images(
                gpu.device(),
                post_set,
                0,
                0,
                &[(color.view, sampler)],
            );
            write_sampled_images(
                gpu.device(),
                post_set,
                1,
                0,
                &[(selection.view, sampler)],
            );
        }

        Ok(Self {
            color_msaa,
            selection_msaa,
            depth,
            color,
            selection,
            staging,
            staging_layout,
            post_set,
            extent,
        })
    }

    fn create_attachments(
        gpu: &GpuContext,
        extent: vk::Extent2D,
        samples: vk::SampleCountFlags,
        out: &mut Vec<Attachment>,
    ) -> Result<()> {
        let transient =
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT;
        if samples != vk::SampleCountFlags::TYPE_1 {
            out.push(Attachment::new(gpu, extent, COLOR_FORMAT, transient, samples, "color_msaa")?);
            out.push(Attachment::new(
                gpu,
                extent,
                SELECTION_FORMAT,
                transient,
                samples,
                "selection_msaa",
            )?);
        }
        out.push(Attachment::new(
            gpu,
            extent,
            DEPTH_FORMAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            samples,
            "depth",
        )?);
        out.push(Attachment::new(
            gpu,
            extent,
            COLOR_FORMAT,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            vk::SampleCountFlags::TYPE_1,
            "color_resolved",
        )?);
        out.push(Attachment::new(
            gpu,
            extent,
            SELECTION_FORMAT,
            vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC,
            vk::SampleCountFlags::TYPE_1,
            "selection_resolved",
        )?);
        Ok(())
    }

    fn create_staging(gpu: &GpuContext, extent: vk::Extent2D) -> Result<GpuImage> {
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(SELECTION_FORMAT)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::LINEAR)
            .usage(vk::ImageUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        Ok(gpu
            .allocator()
            .lock()
            .create_image(&info, MemoryLocation::GpuToCpu, "selection_staging")?)
    }

    /// Forward pass color attachment (multisampled when enabled).
    pub fn forward_color(&self) -> &Attachment {
        self.color_msaa.as_ref().unwrap_or(&self.color)
    }

    /// Forward pass selection attachment (multisampled when enabled).
    pub fn forward_selection(&self) -> &Attachment {
        self.selection_msaa.as_ref().unwrap_or(&self.selection)
    }

    pub fn is_multisampled(&self) -> bool {
        self.color_msaa.is_some()
    }

    /// Release every image. The post descriptor set goes with its pool.
    pub fn destroy(mut self, gpu: &GpuContext) {
        for attachment in [self.color_msaa, self.selection_msaa].into_iter().flatten() {
            attachment.destroy(gpu);
        }
        self.depth.destroy(gpu);
        self.color.destroy(gpu);
        self.selection.destroy(gpu);
        if let Err(e) = gpu.allocator().lock().free_image(&mut self.staging) {
            tracing::warn!("Failed to free selection staging image: {e}");
        }
    }
}

/// Handle to one target set of one swapchain generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TargetHandle {
    index: u32,
    generation: u64,
}

impl TargetHandle {
    pub const fn index(self) -> usize {
        self.index as usize
    }

    pub const fn generation(self) -> u64 {
        self.generation
    }
}

/// Render target sets for the current swapchain.
///
/// [`TargetArena::rebuild`] destroys every set and bumps the generation, so a
/// handle taken before a resize can never reach a destroyed set.
pub struct TargetArena {
    generation: u64,
    samples: vk::SampleCountFlags,
    sets: Vec<RenderTargetSet>,
    pool: Option<DescriptorPool>,
}

impl TargetArena {
    pub fn new(samples: vk::SampleCountFlags) -> Self {
        Self {
            generation: 0,
            samples,
            sets: Vec::new(),
            pool: None,
        }
    }

    pub const fn generation(&self) -> u64 {
        self.generation
    }

    pub const fn samples(&self) -> vk::SampleCountFlags {
        self.samples
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Replace all sets with `count` new ones of `extent`.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn rebuild(
        &mut self,
        gpu: &GpuContext,
        extent: vk::Extent2D,
        count: usize,
        post_layout: vk::DescriptorSetLayout,
        sampler: vk::Sampler,
    ) -> Result<()> {
        self.destroy(gpu);
        self.generation += 1;

        let pool = unsafe {
            DescriptorPool::new(
                gpu.device(),
                count as u32,
                &[vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    descriptor_count: 2 * count as u32,
                }],
            )
        }?;
        self.pool = Some(pool);

        for i in 0..count {
            let set = self
                .pool
                .as_ref()
                .map(|p| unsafe { p.allocate_one(gpu.device(), post_layout) })
                .transpose()?
                .ok_or_else(|| RenderError::InvalidData("descriptor pool missing".to_string()))?;
            match RenderTargetSet::new(gpu, extent, self.samples, set, sampler) {
                Ok(targets) => self.sets.push(targets),
                Err(e) => {
                    tracing::error!("Failed to create render target set {i}: {e}");
                    self.destroy(gpu);
                    return Err(e);
                }
            }
        }

        tracing::debug!(
            "Render targets rebuilt: generation {}, {count} x {}x{}",
            self.generation,
            extent.width,
            extent.height
        );
        Ok(())
    }

    /// Handle for the set of swapchain image `index` in this generation.
    pub fn handle(&self, index: usize) -> Result<TargetHandle> {
        if index < self.sets.len() {
            Ok(TargetHandle {
                index: index as u32,
                generation: self.generation,
            })
        } else {
            Err(RenderError::UnknownHandle {
                kind: "render target",
                index: index as u32,
            })
        }
    }

    /// Resolve a handle, rejecting those from an older generation.
    pub fn get(&self, handle: TargetHandle) -> Result<&RenderTargetSet> {
        check_generation(handle, self.generation)?;
        self.sets
            .get(handle.index())
            .ok_or(RenderError::UnknownHandle {
                kind: "render target",
                index: handle.index,
            })
    }

    /// Destroy every set and the descriptor pool.
    pub fn destroy(&mut self, gpu: &GpuContext) {
        for set in self.sets.drain(..) {
            set.destroy(gpu);
        }
        if let Some(pool) = self.pool.take() {
            unsafe { pool.destroy(gpu.device()) };
        }
    }
}

fn check_generation(handle: TargetHandle, current: u64) -> Result<()> {
    if handle.generation == current {
        Ok(())
    } else {
        Err(RenderError::StaleTarget {
            found: handle.generation,
            current,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_generation_is_rejected() {
        let handle = TargetHandle {
            index: 0,
            generation: 3,
        };
        assert!(check_generation(handle, 3).is_ok());
        assert!(matches!(
            check_generation(handle, 4),
            Err(RenderError::StaleTarget {
                found: 3,
                current: 4
            })
        ));
    }

    #[test]
    fn empty_arena_has_no_handles() {
        let arena = TargetArena::new(vk::SampleCountFlags::TYPE_4);
        assert_eq!(arena.generation(), 0);
        assert!(arena.is_empty());
        assert!(matches!(
            arena.handle(0),
            Err(RenderError::UnknownHandle { .. })
        ));
    }

    #[test]
    fn handle_from_previous_generation_fails_lookup() {
        let arena = TargetArena::new(vk::SampleCountFlags::TYPE_1);
        let old = TargetHandle {
            index: 0,
            generation: arena.generation() + 1,
        };
        assert!(matches!(arena.get(old), Err(RenderError::StaleTarget { .. })));
    }
}
