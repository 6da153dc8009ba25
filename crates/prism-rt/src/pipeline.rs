//! Ray tracing pipeline of the path integrator.
//!
//! Set 0 bindings:
//! - 0: TLAS
//! - 1: rgba32f output image
//! - 2: trace uniforms
//! - 3: object descriptions
//! - 4: equirect environment

use ash::vk;
#[cfg(feature = "ray_tracing")]
use prism_core::constants::RAY_RECURSION_DEPTH;
#[cfg(feature = "ray_tracing")]
use prism_gpu::pipeline::create_shader_module;
use prism_gpu::{DescriptorSetLayoutBuilder, GpuError, Result};

#[cfg(feature = "ray_tracing")]
use crate::sbt::GROUP_COUNT;

/// Pipeline, layout and descriptor set layout.
pub struct PathPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub set_layout: vk::DescriptorSetLayout,
}

impl PathPipeline {
    /// # Safety
    /// `device` must have the ray tracing pipeline extension enabled and
    /// `rt_loader` must be created from it.
    pub unsafe fn new(
        device: &ash::Device,
        rt_loader: &ash::khr::ray_tracing_pipeline::Device,
    ) -> Result<Self> {
        let raygen = vk::ShaderStageFlags::RAYGEN_KHR;
        let hit = vk::ShaderStageFlags::CLOSEST_HIT_KHR;
        let set_layout = DescriptorSetLayoutBuilder::new()
            .acceleration_structure(0, raygen)
            .storage_image(1, raygen)
            .uniform_buffer(2, raygen | hit | vk::ShaderStageFlags::MISS_KHR)
            .storage_buffer(3, hit)
            .sampled_image(4, raygen)
            .build(device)?;

        let set_layouts = [set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        let layout = match device.create_pipeline_layout(&layout_info, None) {
            Ok(layout) => layout,
            Err(e) => {
                device.destroy_descriptor_set_layout(set_layout, None);
                return Err(e.into());
            }
        };

        match Self::create_pipeline(device, rt_loader, layout) {
            Ok(pipeline) => Ok(Self {
                pipeline,
                layout,
                set_layout,
            }),
            Err(e) => {
                device.destroy_pipeline_layout(layout, None);
                device.destroy_descriptor_set_layout(set_layout, None);
                Err(e)
            }
        }
    }

    #[cfg(feature = "ray_tracing")]
    unsafe fn create_pipeline(
        device: &ash::Device,
        rt_loader: &ash::khr::ray_tracing_pipeline::Device,
        layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline> {
        let code = [
            (vk::ShaderStageFlags::RAYGEN_KHR, prism_shaders::path_rgen()),
            (vk::ShaderStageFlags::MISS_KHR, prism_shaders::path_rmiss()),
            (vk::ShaderStageFlags::MISS_KHR, prism_shaders::shadow_rmiss()),
            (vk::ShaderStageFlags::CLOSEST_HIT_KHR, prism_shaders::path_rchit()),
        ];
        let mut modules = Vec::with_capacity(code.len());
        for (_, words) in &code {
            match create_shader_module(device, words) {
                Ok(module) => modules.push(module),
                Err(e) => {
                    for module in modules {
                        device.destroy_shader_module(module, None);
                    }
                    return Err(e);
                }
            }
        }

        let entry_point = c"main";
        let stages: Vec<_> = code
            .iter()
            .zip(&modules)
            .map(|((stage, _), module)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(*stage)
                    .module(*module)
                    .name(entry_point)
            })
            .collect();

        let general = |stage: u32| {
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(stage)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR)
        };
        let groups = [
            general(0),
            general(1),
            general(2),
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                .general_shader(vk::SHADER_UNUSED_KHR)
                .closest_hit_shader(3)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR),
        ];
        debug_assert_eq!(groups.len() as u32, GROUP_COUNT);

        let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(RAY_RECURSION_DEPTH)
            .layout(layout);
        let result = rt_loader.create_ray_tracing_pipelines(
            vk::DeferredOperationKHR::null(),
            vk::PipelineCache::null(),
            &[pipeline_info],
            None,
        );

        for module in modules {
            device.destroy_shader_module(module, None);
        }

        let pipelines = result
            .map_err(|e| GpuError::PipelineCreation(format!("Path tracing pipeline: {e:?}")))?;
        pipelines
            .first()
            .copied()
            .ok_or_else(|| GpuError::PipelineCreation("No pipeline returned".to_string()))
    }

    #[cfg(not(feature = "ray_tracing"))]
    unsafe fn create_pipeline(
        _device: &ash::Device,
        _rt_loader: &ash::khr::ray_tracing_pipeline::Device,
        _layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline> {
        Err(GpuError::RayTracingUnsupported(
            "built without the ray_tracing feature".to_string(),
        ))
    }

    /// # Safety
    /// The pipeline must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
        device.destroy_descriptor_set_layout(self.set_layout, None);
    }
}
