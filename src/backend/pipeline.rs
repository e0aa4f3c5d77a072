// Graphics pipeline creation and management
//
// The pipeline targets dynamic rendering, so there is no render pass or
// framebuffer: the attachment formats are declared up front instead.
// Viewport, scissor and topology are dynamic state set by the command list.

use anyhow::{Context, Result};
use ash::vk;
use std::path::Path;
use std::sync::Arc;

use super::shader::ShaderModule;
use super::VulkanDevice;
use crate::scene::Vertex;

/// Pipeline layout. The triangle binds no resources, so it is empty.
pub struct RootSignature {
    pub layout: vk::PipelineLayout,
    device: Arc<VulkanDevice>,
}

impl RootSignature {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let layout_info = vk::PipelineLayoutCreateInfo::builder();
        let layout = unsafe { device.device.create_pipeline_layout(&layout_info, None) }
            .context("Failed to create pipeline layout")?;
        Ok(Self { layout, device })
    }
}

impl Drop for RootSignature {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// Vertex input description for the triangle vertices (position + color)
fn vertex_input_info() -> (
    [vk::VertexInputBindingDescription; 1],
    [vk::VertexInputAttributeDescription; 2],
) {
    // One binding for interleaved position + color data
    let binding = vk::VertexInputBindingDescription::builder()
        .binding(0)
        .stride(Vertex::STRIDE)
        .input_rate(vk::VertexInputRate::VERTEX)
        .build();

    // Position attribute (location 0)
    let position_attr = vk::VertexInputAttributeDescription::builder()
        .binding(0)
        .location(0)
        .format(vk::Format::R32G32B32_SFLOAT)
        .offset(0)
        .build();

    // Color attribute (location 1)
    let color_attr = vk::VertexInputAttributeDescription::builder()
        .binding(0)
        .location(1)
        .format(vk::Format::R32G32B32A32_SFLOAT)
        .offset(Vertex::COLOR_OFFSET)
        .build();

    ([binding], [position_attr, color_attr])
}

pub struct PipelineState {
    pub pipeline: vk::Pipeline,
    device: Arc<VulkanDevice>,
}

impl PipelineState {
    /// Build the triangle pipeline from `triangle.vert.spv` / `triangle.frag.spv`
    /// in `shader_dir`.
    pub fn new(
        device: Arc<VulkanDevice>,
        root_signature: &RootSignature,
        shader_dir: &Path,
        color_format: vk::Format,
        depth_format: Option<vk::Format>,
    ) -> Result<Self> {
        let vert_shader = ShaderModule::load(&device, &shader_dir.join("triangle.vert.spv"))?;
        let frag_shader = ShaderModule::load(&device, &shader_dir.join("triangle.frag.spv"))?;

        // Shader stages
        let entry_point = c"main";

        let vert_stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vert_shader.module)
            .name(entry_point)
            .build();

        let frag_stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(frag_shader.module)
            .name(entry_point)
            .build();

        let shader_stages = &[vert_stage, frag_stage];

        // Vertex input
        let (bindings, attributes) = vertex_input_info();
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        // Input assembly (topology is overridden per frame)
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let dynamic_states = [
            vk::DynamicState::VIEWPORT,
            vk::DynamicState::SCISSOR,
            vk::DynamicState::PRIMITIVE_TOPOLOGY,
        ];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        // Rasterization
        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::CLOCKWISE)
            .depth_bias_enable(false);

        // Multisampling (disabled)
        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(depth_format.is_some())
            .depth_write_enable(depth_format.is_some())
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        // Color blending (no blending, opaque)
        let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build();

        let color_blend_attachments = &[color_blend_attachment];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(color_blend_attachments);

        // Attachment formats for dynamic rendering
        let color_formats = [color_format];
        let mut rendering_info = vk::PipelineRenderingCreateInfo::builder()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(depth_format.unwrap_or(vk::Format::UNDEFINED));

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(root_signature.layout)
            .push_next(&mut rendering_info)
            .build();

        let pipelines = unsafe {
            device
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map_err(|(_, e)| e)
                .context("Failed to create graphics pipeline")?
        };
        let pipeline = pipelines
            .first()
            .copied()
            .context("Driver returned no pipeline")?;

        // Modules are only needed while the pipeline is compiled
        drop(vert_shader);
        drop(frag_shader);

        log::info!("Created triangle pipeline ({:?})", color_format);
        Ok(Self { pipeline, device })
    }
}

impl Drop for PipelineState {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_pipeline(self.pipeline, None);
        }
    }
}
