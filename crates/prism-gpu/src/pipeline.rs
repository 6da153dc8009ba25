//! Pipeline creation and management.

use crate::error::{GpuError, Result};
use ash::vk;

/// Blend behaviour of one color attachment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlendMode {
    /// Overwrite.
    Opaque,
    /// `dst + src`, used for punctual light accumulation.
    Additive,
    /// Standard `src * a + dst * (1 - a)`.
    Alpha,
}

/// Per-attachment blend and write-mask state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColorTarget {
    pub format: vk::Format,
    pub blend: BlendMode,
    pub write_mask: vk::ColorComponentFlags,
}

impl ColorTarget {
    pub const fn opaque(format: vk::Format) -> Self {
        Self {
            format,
            blend: BlendMode::Opaque,
            write_mask: vk::ColorComponentFlags::RGBA,
        }
    }

    #[must_use]
    pub const fn with_blend(mut self, blend: BlendMode) -> Self {
        self.blend = blend;
        self
    }

    /// Keep the attachment bound but never write it.
    #[must_use]
    pub const fn masked(mut self) -> Self {
        self.write_mask = vk::ColorComponentFlags::empty();
        self
    }

    fn state(self) -> vk::PipelineColorBlendAttachmentState {
        let state = vk::PipelineColorBlendAttachmentState::default().color_write_mask(self.write_mask);
        match self.blend {
            BlendMode::Opaque => state.blend_enable(false),
            BlendMode::Additive => state
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::ONE)
                .dst_color_blend_factor(vk::BlendFactor::ONE)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ZERO)
                .dst_alpha_blend_factor(vk::BlendFactor::ONE)
                .alpha_blend_op(vk::BlendOp::ADD),
            BlendMode::Alpha => state
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .alpha_blend_op(vk::BlendOp::ADD),
        }
    }
}

/// Graphics pipeline configuration.
#[derive(Clone)]
pub struct GraphicsPipelineConfig {
    pub vertex_shader: &'static [u32],
    pub fragment_shader: &'static [u32],
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub samples: vk::SampleCountFlags,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    pub color_targets: Vec<ColorTarget>,
    pub depth_format: Option<vk::Format>,
    /// `(constant_id, value)` pairs for the fragment stage.
    pub fragment_constants: Vec<(u32, u32)>,
    /// Multiview mask, non-zero for layered cube renders.
    pub view_mask: u32,
}

impl Default for GraphicsPipelineConfig {
    fn default() -> Self {
        Self {
            vertex_shader: &[],
            fragment_shader: &[],
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            samples: vk::SampleCountFlags::TYPE_1,
            depth_test: true,
            depth_write: true,
            depth_compare: vk::CompareOp::LESS,
            color_targets: vec![ColorTarget::opaque(vk::Format::B8G8R8A8_SRGB)],
            depth_format: Some(vk::Format::D32_SFLOAT),
            fragment_constants: Vec::new(),
            view_mask: 0,
        }
    }
}

impl GraphicsPipelineConfig {
    /// Fullscreen-triangle pass: no vertex input, no depth, no culling.
    pub fn fullscreen(fragment_shader: &'static [u32], vertex_shader: &'static [u32]) -> Self {
        Self {
            vertex_shader,
            fragment_shader,
            cull_mode: vk::CullModeFlags::NONE,
            depth_test: false,
            depth_write: false,
            depth_format: None,
            ..Self::default()
        }
    }
}

/// Graphics pipeline wrapper.
pub struct GraphicsPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl GraphicsPipeline {
    /// Create a graphics pipeline using dynamic rendering (Vulkan 1.3).
    ///
    /// # Safety
    /// The device must be valid and shader code must be valid SPIR-V.
    pub unsafe fn new(
        device: &ash::Device,
        config: &GraphicsPipelineConfig,
        descriptor_set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<Self> {
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(descriptor_set_layouts)
            .push_constant_ranges(push_constant_ranges);
        let layout = device
            .create_pipeline_layout(&layout_info, None)
            .map_err(|e| GpuError::PipelineCreation(e.to_string()))?;

        match Self::with_layout(device, config, layout) {
            Ok(pipeline) => Ok(Self { pipeline, layout }),
            Err(e) => {
                device.destroy_pipeline_layout(layout, None);
                Err(e)
            }
        }
    }

    /// Create a pipeline against an existing, externally owned layout.
    ///
    /// # Safety
    /// The device and layout must be valid and shader code must be valid SPIR-V.
    pub unsafe fn with_layout(
        device: &ash::Device,
        config: &GraphicsPipelineConfig,
        layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline> {
        let vert_module = create_shader_module(device, config.vertex_shader)
            .map_err(|e| GpuError::PipelineCreation(format!("vertex module: {e}")))?;
        let frag_module = match create_shader_module(device, config.fragment_shader) {
            Ok(module) => module,
            Err(e) => {
                device.destroy_shader_module(vert_module, None);
                return Err(GpuError::PipelineCreation(format!("fragment module: {e}")));
            }
        };

        let constant_data: Vec<u32> = config.fragment_constants.iter().map(|&(_, v)| v).collect();
        let constant_entries: Vec<vk::SpecializationMapEntry> = config
            .fragment_constants
            .iter()
            .enumerate()
            .map(|(i, &(id, _))| {
                vk::SpecializationMapEntry::default()
                    .constant_id(id)
                    .offset((i * std::mem::size_of::<u32>()) as u32)
                    .size(std::mem::size_of::<u32>())
            })
            .collect();
        let specialization = vk::SpecializationInfo::default()
            .map_entries(&constant_entries)
            .data(bytemuck::cast_slice(&constant_data));

        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vert_module)
                .name(c"main"),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(frag_module)
                .name(c"main")
                .specialization_info(&specialization),
        ];

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&config.vertex_bindings)
            .vertex_attribute_descriptions(&config.vertex_attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(config.topology)
            .primitive_restart_enable(false);

        // Viewport and scissor are dynamic
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(config.cull_mode)
            .front_face(config.front_face)
            .depth_bias_enable(false)
            .line_width(1.0);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(config.samples)
            .sample_shading_enable(false);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(config.depth_test)
            .depth_write_enable(config.depth_write)
            .depth_compare_op(config.depth_compare)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_blend_attachments: Vec<_> =
            config.color_targets.iter().map(|t| t.state()).collect();
        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let color_formats: Vec<vk::Format> =
            config.color_targets.iter().map(|t| t.format).collect();
        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&color_formats)
            .view_mask(config.view_mask);
        if let Some(depth_format) = config.depth_format {
            rendering_info = rendering_info.depth_attachment_format(depth_format);
        }

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info);

        let result =
            device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None);

        device.destroy_shader_module(vert_module, None);
        device.destroy_shader_module(frag_module, None);

        let pipelines = result.map_err(|(_, e)| GpuError::PipelineCreation(e.to_string()))?;
        pipelines
            .first()
            .copied()
            .ok_or_else(|| GpuError::PipelineCreation("no pipeline returned".to_string()))
    }

    /// Destroy the pipeline.
    ///
    /// # Safety
    /// The device must be valid and the pipeline must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
    }
}

/// Create a shader module from SPIR-V words.
///
/// # Safety
/// The device must be valid and `code` must be valid SPIR-V.
pub unsafe fn create_shader_module(device: &ash::Device, code: &[u32]) -> Result<vk::ShaderModule> {
    let info = vk::ShaderModuleCreateInfo::default().code(code);
    Ok(device.create_shader_module(&info, None)?)
}

/// Set a full-extent viewport and scissor.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn set_viewport_scissor(device: &ash::Device, cmd: vk::CommandBuffer, extent: vk::Extent2D) {
    let viewport = vk::Viewport::default()
        .width(extent.width as f32)
        .height(extent.height as f32)
        .max_depth(1.0);
    let scissor = vk::Rect2D::default().extent(extent);
    device.cmd_set_viewport(cmd, 0, &[viewport]);
    device.cmd_set_scissor(cmd, 0, &[scissor]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn additive_blend_sums_color() {
        let state = ColorTarget::opaque(vk::Format::R16G16B16A16_SFLOAT)
            .with_blend(BlendMode::Additive)
            .state();
        assert_eq!(state.blend_enable, vk::TRUE);
        assert_eq!(state.src_color_blend_factor, vk::BlendFactor::ONE);
        assert_eq!(state.dst_color_blend_factor, vk::BlendFactor::ONE);
    }

    #[test]
    fn masked_target_writes_nothing() {
        let target = ColorTarget::opaque(vk::Format::R32G32B32A32_SFLOAT).masked();
        assert!(target.state().color_write_mask.is_empty());
    }

    #[test]
    fn fullscreen_has_no_depth() {
        let config = GraphicsPipelineConfig::fullscreen(&[], &[]);
        assert!(config.depth_format.is_none());
        assert!(!config.depth_test);
        assert_eq!(config.cull_mode, vk::CullModeFlags::NONE);
    }
}
