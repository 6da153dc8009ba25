//! Render context: typed tables of meshes, materials, textures and baked
//! environments shared by the raster and ray-traced renderers.
//!
//! Mutation while the frame loop runs must be bracketed by a pause; this type
//! does no locking of its own.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use hashbrown::HashMap;
use prism_core::constants::MAX_TEXTURES;
use prism_core::{
    Aabb, EnvironmentKey, Material, MaterialId, MaterialKind, MeshData, MeshId, TextureId,
};
use prism_gpu::command::execute_single_time_commands;
use prism_gpu::descriptors::{write_dynamic_uniform_buffer, write_sampled_images};
use prism_gpu::image::create_sampler;
use prism_gpu::sync::{image_barrier, ImageTransition};
use prism_gpu::{
    CommandPool, DescriptorPool, DescriptorSetLayoutBuilder, GpuBuffer, GpuContext,
    MemoryLocation, SamplerKind,
};

use crate::batching::BatchResolver;
use crate::error::{RenderError, Result};
use crate::ibl::{self, EquirectImage, IblAsset, IblBaker, IblConfig, Texture};
use crate::uniforms::MaterialBlock;

/// Capacity of the material block buffer.
pub const MAX_MATERIALS: u32 = 1024;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Mesh buffers on the raster device.
pub struct GpuMesh {
    pub vertex_buffer: GpuBuffer,
    pub index_buffer: GpuBuffer,
    pub index_count: u32,
    /// CPU copy, re-uploaded by the path tracer onto its own device.
    pub data: Arc<MeshData>,
}

/// Environment lighting to bind for a frame.
#[derive(Clone, Debug)]
pub struct EnvironmentBinding {
    pub descriptor_set: vk::DescriptorSet,
    pub prefiltered_mips: u32,
    /// False when the neutral fallback is bound.
    pub active: bool,
    pub source: Arc<EquirectImage>,
}

/// Typed resource tables.
pub struct RenderResources {
    gpu: Arc<GpuContext>,
    meshes: HashMap<MeshId, GpuMesh>,
    next_mesh: u32,
    materials: Vec<Material>,
    material_buffer: GpuBuffer,
    material_stride: u64,
    textures: Vec<Texture>,
    environments: HashMap<EnvironmentKey, IblAsset>,
    neutral: Option<IblAsset>,
    upload_pool: CommandPool,
    texture_sampler: vk::Sampler,
    material_layout: vk::DescriptorSetLayout,
    texture_layout: vk::DescriptorSetLayout,
    descriptor_pool: Option<DescriptorPool>,
    material_set: vk::DescriptorSet,
    texture_set: vk::DescriptorSet,
    // Declared last: assets above are destroyed before the baker drops
    baker: IblBaker,
}

impl RenderResources {
    /// Create empty tables, the BRDF lookup texture and the neutral environment.
    pub fn new(gpu: Arc<GpuContext>, ibl_config: IblConfig) -> Result<Self> {
        let baker = IblBaker::new(Arc::clone(&gpu), ibl_config)?;
        let device = gpu.device();

        let material_stride = prism_core::math::align_up(
            MaterialBlock::SIZE,
            gpu.capabilities().min_uniform_buffer_offset_alignment,
        );
        let material_buffer = gpu.allocator().lock().create_buffer(
            material_stride * u64::from(MAX_MATERIALS),
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
            "material_blocks",
        )?;
        let upload_pool = match unsafe {
            CommandPool::new(
                device,
                gpu.graphics_queue_family(),
                vk::CommandPoolCreateFlags::TRANSIENT,
            )
        } {
            Ok(pool) => pool,
            Err(e) => {
                let mut material_buffer = material_buffer;
                gpu.allocator().lock().free_buffer(&mut material_buffer)?;
                return Err(e.into());
            }
        };

        let mut resources = Self {
            gpu: Arc::clone(&gpu),
            meshes: HashMap::new(),
            next_mesh: 0,
            materials: Vec::new(),
            material_buffer,
            material_stride,
            textures: Vec::new(),
            environments: HashMap::new(),
            neutral: None,
            upload_pool,
            texture_sampler: vk::Sampler::null(),
            material_layout: vk::DescriptorSetLayout::null(),
            texture_layout: vk::DescriptorSetLayout::null(),
            descriptor_pool: None,
            material_set: vk::DescriptorSet::null(),
            texture_set: vk::DescriptorSet::null(),
            baker,
        };
        resources.init_descriptors()?;
        resources.neutral = Some(resources.baker.bake_neutral()?);
        tracing::debug!("Render resources ready");
        Ok(resources)
    }

    fn init_descriptors(&mut self) -> Result<()> {
        let device = self.gpu.device();
        unsafe {
            self.texture_sampler = create_sampler(device, SamplerKind::Repeat, 0.0)?;
            self.material_layout = DescriptorSetLayoutBuilder::new()
                .dynamic_uniform_buffer(0, vk::ShaderStageFlags::FRAGMENT)
                .build(device)?;
            self.texture_layout = DescriptorSetLayoutBuilder::new()
                .sampled_image_array(0, MAX_TEXTURES, vk::ShaderStageFlags::FRAGMENT)
                .build(device)?;
            let pool = DescriptorPool::new(
                device,
                2,
                &[
                    vk::DescriptorPoolSize {
                        ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                        descriptor_count: 1,
                    },
                    vk::DescriptorPoolSize {
                        ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                        descriptor_count: MAX_TEXTURES,
                    },
                ],
            )?;
            self.material_set = pool.allocate_one(device, self.material_layout)?;
            self.texture_set = pool.allocate_one(device, self.texture_layout)?;
            self.descriptor_pool = Some(pool);
            write_dynamic_uniform_buffer(
                device,
                self.material_set,
                0,
                self.material_buffer.buffer,
                MaterialBlock::SIZE,
            );
        }
        Ok(())
    }

    pub fn gpu(&self) -> &Arc<GpuContext> {
        &self.gpu
    }

    /// Upload a mesh to the raster device.
    pub fn add_mesh(&mut self, mesh: MeshData) -> Result<MeshId> {
        let id = MeshId(self.next_mesh);
        let mut allocator = self.gpu.allocator().lock();
        let mut vertex_buffer = allocator.create_buffer_with_data(
            mesh.vertices(),
            vk::BufferUsageFlags::VERTEX_BUFFER,
            &format!("mesh_{}_vertices", id.0),
        )?;
        let index_buffer = match allocator.create_buffer_with_data(
            mesh.indices(),
            vk::BufferUsageFlags::INDEX_BUFFER,
            &format!("mesh_{}_indices", id.0),
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                allocator.free_buffer(&mut vertex_buffer)?;
                return Err(e.into());
            }
        };

        tracing::debug!(
            "Added {id}: {} vertices, {} triangles",
            mesh.vertices().len(),
            mesh.triangle_count()
        );
        self.meshes.insert(
            id,
            GpuMesh {
                vertex_buffer,
                index_buffer,
                index_count: mesh.indices().len() as u32,
                data: Arc::new(mesh),
            },
        );
        self.next_mesh += 1;
        Ok(id)
    }

    pub fn mesh(&self, id: MeshId) -> Option<&GpuMesh> {
        self.meshes.get(&id)
    }

    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    /// Register a material. Its id is also its material-block index.
    pub fn add_material(&mut self, material: Material) -> Result<MaterialId> {
        let index = self.materials.len() as u32;
        if index >= MAX_MATERIALS {
            return Err(RenderError::TableFull {
                kind: "material",
                capacity: MAX_MATERIALS,
            });
        }
        let id = MaterialId(index);
        self.write_material_block(id, &material)?;
        tracing::debug!("Added {id} ({})", material.kind().name());
        self.materials.push(material);
        Ok(id)
    }

    /// Replace the parameters of an existing material.
    pub fn update_material(&mut self, id: MaterialId, material: Material) -> Result<()> {
        if id.index() >= self.materials.len() {
            return Err(RenderError::UnknownHandle {
                kind: "material",
                index: id.0,
            });
        }
        self.write_material_block(id, &material)?;
        self.materials[id.index()] = material;
        Ok(())
    }

    fn write_material_block(&self, id: MaterialId, material: &Material) -> Result<()> {
        let texture_count = self.textures.len();
        let block = MaterialBlock::from_material(material, |t| t.index() < texture_count);
        self.material_buffer
            .write_range(u64::from(id.0) * self.material_stride, &[block])?;
        Ok(())
    }

    pub fn material(&self, id: MaterialId) -> Option<&Material> {
        self.materials.get(id.index())
    }

    /// Upload RGBA8 pixels into the next slot of the texture array.
    pub fn add_texture(
        &mut self,
        width: u32,
        height: u32,
        pixels: &[u8],
        srgb: bool,
    ) -> Result<TextureId> {
        let slot = self.textures.len() as u32;
        if slot >= MAX_TEXTURES {
            return Err(RenderError::TableFull {
                kind: "texture",
                capacity: MAX_TEXTURES,
            });
        }
        check_texture_size(width, height, pixels.len())?;

        let format = if srgb {
            vk::Format::R8G8B8A8_SRGB
        } else {
            vk::Format::R8G8B8A8_UNORM
        };
        let texture = self.upload_texture(width, height, format, pixels)?;
        unsafe {
            write_sampled_images(
                self.gpu.device(),
                self.texture_set,
                0,
                slot,
                &[(texture.view, self.texture_sampler)],
            );
        }
        self.textures.push(texture);

        // Materials registered before this texture may now reference it
        for (index, material) in self.materials.iter().enumerate() {
            self.write_material_block(MaterialId(index as u32), material)?;
        }
        Ok(TextureId(slot))
    }

    fn upload_texture(
        &self,
        width: u32,
        height: u32,
        format: vk::Format,
        pixels: &[u8],
    ) -> Result<Texture> {
        let gpu = &*self.gpu;
        let mut staging = gpu.allocator().lock().create_buffer_with_data(
            pixels,
            vk::BufferUsageFlags::TRANSFER_SRC,
            "texture_staging",
        )?;
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
            .usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let texture = match Texture::from_info(gpu, &info, vk::ImageViewType::TYPE_2D, "material_texture") {
            Ok(texture) => texture,
            Err(e) => {
                gpu.allocator().lock().free_buffer(&mut staging)?;
                return Err(e);
            }
        };

        let result = unsafe {
            execute_single_time_commands(
                gpu.device(),
                &self.upload_pool,
                gpu.graphics_queue(),
                UPLOAD_TIMEOUT,
                |cmd| {
                    let device = gpu.device();
                    let range = texture.image.full_range(vk::ImageAspectFlags::COLOR);
                    image_barrier(
                        device,
                        cmd,
                        texture.image.image,
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
                        .image_extent(texture.image.extent);
                    device.cmd_copy_buffer_to_image(
                        cmd,
                        staging.buffer,
                        texture.image.image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                    image_barrier(
                        device,
                        cmd,
                        texture.image.image,
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

        gpu.allocator().lock().free_buffer(&mut staging)?;
        match result {
            Ok(()) => Ok(texture),
            Err(e) => {
                texture.destroy(gpu);
                Err(e.into())
            }
        }
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    /// Import and bake an environment keyed by its path.
    ///
    /// Already imported paths return their existing key. Undecodable sources
    /// return `Ok(None)`.
    pub fn import_environment(&mut self, path: &Path) -> Result<Option<EnvironmentKey>> {
        let key = EnvironmentKey::new(path);
        if self.environments.contains_key(&key) {
            return Ok(Some(key));
        }
        match ibl::import_environment(&self.baker, path)? {
            Some(asset) => {
                tracing::info!("Imported environment {key}");
                self.environments.insert(key.clone(), asset);
                Ok(Some(key))
            }
            None => Ok(None),
        }
    }

    pub fn environment_asset(&self, key: &EnvironmentKey) -> Option<&IblAsset> {
        self.environments.get(key)
    }

    /// Lighting for `key`, falling back to the neutral environment.
    pub fn environment(&self, key: Option<&EnvironmentKey>) -> Result<EnvironmentBinding> {
        if let Some(asset) = key.and_then(|k| self.environments.get(k)) {
            return Ok(Self::binding(asset, true));
        }
        self.neutral
            .as_ref()
            .map(|asset| Self::binding(asset, false))
            .ok_or_else(|| RenderError::InvalidData("neutral environment missing".to_string()))
    }

    fn binding(asset: &IblAsset, active: bool) -> EnvironmentBinding {
        EnvironmentBinding {
            descriptor_set: asset.descriptor_set,
            prefiltered_mips: asset.prefiltered_mip_count(),
            active,
            source: Arc::clone(&asset.source),
        }
    }

    pub fn material_stride(&self) -> u64 {
        self.material_stride
    }

    pub fn material_layout(&self) -> vk::DescriptorSetLayout {
        self.material_layout
    }

    pub fn texture_layout(&self) -> vk::DescriptorSetLayout {
        self.texture_layout
    }

    pub fn environment_layout(&self) -> vk::DescriptorSetLayout {
        self.baker.environment_layout()
    }

    pub fn material_set(&self) -> vk::DescriptorSet {
        self.material_set
    }

    pub fn texture_set(&self) -> vk::DescriptorSet {
        self.texture_set
    }
}

impl BatchResolver for RenderResources {
    fn mesh_bounds(&self, mesh: MeshId) -> Option<Aabb> {
        self.meshes.get(&mesh).map(|m| m.data.bounds())
    }

    fn material_kind(&self, material: MaterialId) -> Option<MaterialKind> {
        self.materials.get(material.index()).map(Material::kind)
    }
}

impl Drop for RenderResources {
    fn drop(&mut self) {
        let gpu = Arc::clone(&self.gpu);
        if let Err(e) = gpu.wait_idle() {
            tracing::warn!("Device idle wait failed during teardown: {e}");
        }
        let device = gpu.device();
        {
            let mut allocator = gpu.allocator().lock();
            for (_, mut mesh) in self.meshes.drain() {
                let _ = allocator.free_buffer(&mut mesh.vertex_buffer);
                let _ = allocator.free_buffer(&mut mesh.index_buffer);
            }
            let _ = allocator.free_buffer(&mut self.material_buffer);
        }
        for texture in self.textures.drain(..) {
            texture.destroy(&gpu);
        }
        for (_, asset) in self.environments.drain() {
            asset.destroy(&gpu);
        }
        if let Some(asset) = self.neutral.take() {
            asset.destroy(&gpu);
        }
        unsafe {
            if let Some(pool) = self.descriptor_pool.take() {
                pool.destroy(device);
            }
            device.destroy_descriptor_set_layout(self.material_layout, None);
            device.destroy_descriptor_set_layout(self.texture_layout, None);
            device.destroy_sampler(self.texture_sampler, None);
            self.upload_pool.destroy(device);
        }
    }
}

/// Bytes of tightly packed RGBA8 pixels, or `None` on overflow.
fn rgba8_len(width: u32, height: u32) -> Option<usize> {
    u64::from(width)
        .checked_mul(u64::from(height))?
        .checked_mul(4)
        .and_then(|len| usize::try_from(len).ok())
}

fn check_texture_size(width: u32, height: u32, actual: usize) -> Result<()> {
    match rgba8_len(width, height) {
        Some(expected) if width != 0 && height != 0 && expected == actual => Ok(()),
        Some(expected) => Err(RenderError::InvalidData(format!(
            "texture of {width}x{height} needs {expected} bytes, got {actual}"
        ))),
        None => Err(RenderError::InvalidData(format!(
            "texture of {width}x{height} is too large"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texture_size_matches_pixels() {
        assert!(check_texture_size(2, 3, 24).is_ok());
        assert!(check_texture_size(2, 3, 23).is_err());
        assert!(check_texture_size(0, 3, 0).is_err());
    }

    #[test]
    fn large_textures_do_not_wrap() {
        assert_eq!(rgba8_len(32768, 32768), Some(4 << 30));
        assert!(check_texture_size(32768, 32768, 0).is_err());
        assert!(check_texture_size(u32::MAX, u32::MAX, 0).is_err());
    }
}
