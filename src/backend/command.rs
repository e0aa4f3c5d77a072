// Command recording - pool + primary command buffer
//
// Vulkan has no standalone clear-then-bind: clears become load ops of the
// next dynamic rendering pass. Pending clears are held until the render
// targets are bound (or flushed by an empty pass if they never are).

use ash::vk;
use std::sync::Arc;

use super::buffer::{DepthStencilView, VertexBufferView};
use super::pipeline::{PipelineState, RootSignature};
use super::swapchain::RenderTargetView;
use super::{CommandAllocator, CommandList, PrimitiveTopology, ResourceState, ScissorRect, Viewport};
use super::{Vulkan, VulkanDevice};
use crate::error::{FrameError, FrameResult};

pub struct VulkanCommandAllocator {
    pub pool: vk::CommandPool,
    device: Arc<VulkanDevice>,
}

impl VulkanCommandAllocator {
    pub fn new(device: Arc<VulkanDevice>) -> FrameResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }?;
        Ok(Self { pool, device })
    }
}

impl CommandAllocator for VulkanCommandAllocator {
    fn reset(&mut self) -> FrameResult<()> {
        unsafe {
            self.device
                .device
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())?;
        }
        Ok(())
    }
}

impl Drop for VulkanCommandAllocator {
    fn drop(&mut self) {
        // Frees every command buffer allocated from the pool
        unsafe {
            self.device.device.destroy_command_pool(self.pool, None);
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct PendingClears {
    color: Option<(vk::ImageView, [f32; 4])>,
    depth: Option<(vk::ImageView, f32, u8)>,
}

#[derive(Debug, Clone, Copy)]
struct BoundTargets {
    color: RenderTargetView,
    depth: Option<DepthStencilView>,
}

pub struct VulkanCommandList {
    pub buffer: vk::CommandBuffer,
    pool: vk::CommandPool,
    recording: bool,
    rendering: bool,
    clears: PendingClears,
    targets: Option<BoundTargets>,
    device: Arc<VulkanDevice>,
}

impl VulkanCommandList {
    pub fn new(device: Arc<VulkanDevice>, allocator: &VulkanCommandAllocator) -> FrameResult<Self> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(allocator.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { device.device.allocate_command_buffers(&alloc_info) }?;
        let buffer = buffers
            .first()
            .copied()
            .ok_or(FrameError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY))?;

        Ok(Self {
            buffer,
            pool: allocator.pool,
            recording: false,
            rendering: false,
            clears: PendingClears::default(),
            targets: None,
            device,
        })
    }

    fn begin_rendering(&mut self, targets: BoundTargets) {
        let device = &self.device.device;
        let clears = std::mem::take(&mut self.clears);

        let (color_load, color_clear) = match clears.color {
            Some((view, color)) if view == targets.color.view => {
                (vk::AttachmentLoadOp::CLEAR, color)
            }
            _ => (vk::AttachmentLoadOp::LOAD, [0.0; 4]),
        };
        let color_attachment = vk::RenderingAttachmentInfo::builder()
            .image_view(targets.color.view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(color_load)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue { float32: color_clear },
            })
            .build();

        let depth_attachment = targets.depth.map(|depth| {
            let (load, value) = match clears.depth {
                Some((view, depth_value, stencil)) if view == depth.view => {
                    let value = vk::ClearDepthStencilValue {
                        depth: depth_value,
                        stencil: stencil as u32,
                    };
                    (vk::AttachmentLoadOp::CLEAR, value)
                }
                _ => (vk::AttachmentLoadOp::LOAD, vk::ClearDepthStencilValue::default()),
            };

            // Cleared every frame, so previous contents are discarded
            let old_layout = if load == vk::AttachmentLoadOp::CLEAR {
                vk::ImageLayout::UNDEFINED
            } else {
                vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL
            };
            let barrier = vk::ImageMemoryBarrier::builder()
                .old_layout(old_layout)
                .new_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                .src_access_mask(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
                .dst_access_mask(
                    vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                        | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                )
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(depth.image)
                .subresource_range(subresource_range(vk::ImageAspectFlags::DEPTH))
                .build();
            let fragment_tests = vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
            unsafe {
                device.cmd_pipeline_barrier(
                    self.buffer,
                    fragment_tests,
                    fragment_tests,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier],
                );
            }

            vk::RenderingAttachmentInfo::builder()
                .image_view(depth.view)
                .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                .load_op(load)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .clear_value(vk::ClearValue { depth_stencil: value })
                .build()
        });

        let color_attachments = [color_attachment];
        let mut rendering_info = vk::RenderingInfo::builder()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: targets.color.extent,
            })
            .layer_count(1)
            .color_attachments(&color_attachments);
        if let Some(depth_attachment) = depth_attachment.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth_attachment);
        }

        unsafe { device.cmd_begin_rendering(self.buffer, &rendering_info) };
        self.rendering = true;
    }

    fn end_rendering(&mut self) {
        if self.rendering {
            unsafe { self.device.device.cmd_end_rendering(self.buffer) };
            self.rendering = false;
        }
    }

    /// Clears recorded without a following bind still have to happen.
    fn flush_clears(&mut self, color: Option<RenderTargetView>) {
        if self.clears.color.is_none() && self.clears.depth.is_none() {
            return;
        }
        let target = color.or_else(|| self.targets.map(|t| t.color));
        if let Some(target) = target {
            let depth = self.targets.and_then(|t| t.depth);
            self.end_rendering();
            self.begin_rendering(BoundTargets { color: target, depth });
            self.end_rendering();
        } else {
            log::warn!("Dropping clears recorded without a render target");
            self.clears = PendingClears::default();
        }
    }
}

fn subresource_range(aspect_mask: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Image layouts and pipeline stages for a back-buffer transition.
fn barrier_params(
    before: ResourceState,
    after: ResourceState,
) -> (vk::ImageLayout, vk::ImageLayout, vk::PipelineStageFlags, vk::PipelineStageFlags) {
    let layout = |state: ResourceState, as_source: bool| match state {
        // Contents of a freshly acquired image are never read
        ResourceState::Presentable if as_source => vk::ImageLayout::UNDEFINED,
        ResourceState::Presentable => vk::ImageLayout::PRESENT_SRC_KHR,
        ResourceState::RenderTarget => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let stage = |state: ResourceState, as_source: bool| match state {
        ResourceState::RenderTarget => vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ResourceState::Presentable if as_source => vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ResourceState::Presentable => vk::PipelineStageFlags::BOTTOM_OF_PIPE,
    };
    (
        layout(before, true),
        layout(after, false),
        stage(before, true),
        stage(after, false),
    )
}

fn access_mask(state: ResourceState) -> vk::AccessFlags {
    match state {
        ResourceState::Presentable => vk::AccessFlags::empty(),
        ResourceState::RenderTarget => vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
    }
}

/// Y-up viewport: a negative height flips clip space to match the vertex data.
fn flipped_viewport(viewport: &Viewport) -> vk::Viewport {
    vk::Viewport {
        x: viewport.x,
        y: viewport.y + viewport.height,
        width: viewport.width,
        height: -viewport.height,
        min_depth: viewport.min_depth,
        max_depth: viewport.max_depth,
    }
}

fn scissor_rect(rect: &ScissorRect) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D {
            x: rect.left,
            y: rect.top,
        },
        extent: vk::Extent2D {
            width: (rect.right - rect.left).max(0) as u32,
            height: (rect.bottom - rect.top).max(0) as u32,
        },
    }
}

impl CommandList<Vulkan> for VulkanCommandList {
    fn reset(
        &mut self,
        allocator: &VulkanCommandAllocator,
        pipeline: Option<&PipelineState>,
    ) -> FrameResult<()> {
        if self.recording {
            return Err(FrameError::InvalidRecorderState {
                operation: "reset",
                state: "recording",
            });
        }
        if allocator.pool != self.pool {
            log::warn!("Command list reset against a foreign allocator");
        }

        // The pool reset already returned the buffer to the initial state
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.device.begin_command_buffer(self.buffer, &begin_info) }?;

        self.recording = true;
        self.rendering = false;
        self.clears = PendingClears::default();
        self.targets = None;

        if let Some(pipeline) = pipeline {
            unsafe {
                self.device.device.cmd_bind_pipeline(
                    self.buffer,
                    vk::PipelineBindPoint::GRAPHICS,
                    pipeline.pipeline,
                );
            }
        }
        Ok(())
    }

    fn set_root_signature(&mut self, root_signature: &RootSignature) {
        // Layouts are baked into the pipeline; nothing to bind without descriptors
        log::trace!("Root signature {:?}", root_signature.layout);
    }

    fn set_viewport(&mut self, viewport: &Viewport) {
        unsafe {
            self.device
                .device
                .cmd_set_viewport(self.buffer, 0, &[flipped_viewport(viewport)]);
        }
    }

    fn set_scissor(&mut self, rect: &ScissorRect) {
        unsafe {
            self.device
                .device
                .cmd_set_scissor(self.buffer, 0, &[scissor_rect(rect)]);
        }
    }

    fn transition(&mut self, target: RenderTargetView, before: ResourceState, after: ResourceState) {
        if after == ResourceState::Presentable {
            self.flush_clears(Some(target));
        }
        // Layout transitions are illegal inside a rendering pass
        self.end_rendering();

        let (old_layout, new_layout, src_stage, dst_stage) = barrier_params(before, after);
        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_access_mask(access_mask(before))
            .dst_access_mask(access_mask(after))
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(target.image)
            .subresource_range(subresource_range(vk::ImageAspectFlags::COLOR))
            .build();

        unsafe {
            self.device.device.cmd_pipeline_barrier(
                self.buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    fn clear_render_target(&mut self, target: RenderTargetView, color: [f32; 4]) {
        self.clears.color = Some((target.view, color));
    }

    fn clear_depth_stencil(&mut self, view: DepthStencilView, depth: f32, stencil: u8) {
        self.clears.depth = Some((view.view, depth, stencil));
    }

    fn set_render_targets(&mut self, target: RenderTargetView, depth_stencil: Option<DepthStencilView>) {
        self.end_rendering();
        let targets = BoundTargets {
            color: target,
            depth: depth_stencil,
        };
        self.targets = Some(targets);
        self.begin_rendering(targets);
    }

    fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        let topology = match topology {
            PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        };
        unsafe {
            self.device
                .device
                .cmd_set_primitive_topology(self.buffer, topology);
        }
    }

    fn set_vertex_buffer(&mut self, view: VertexBufferView) {
        unsafe {
            self.device
                .device
                .cmd_bind_vertex_buffers(self.buffer, 0, &[view.buffer], &[0]);
        }
    }

    fn draw_instanced(&mut self, vertex_count: u32, instance_count: u32, start_vertex: u32, start_instance: u32) {
        if !self.rendering {
            log::warn!("Draw recorded outside a rendering pass; skipped");
            return;
        }
        unsafe {
            self.device.device.cmd_draw(
                self.buffer,
                vertex_count,
                instance_count,
                start_vertex,
                start_instance,
            );
        }
    }

    fn close(&mut self) -> FrameResult<()> {
        if !self.recording {
            return Err(FrameError::InvalidRecorderState {
                operation: "close",
                state: "closed",
            });
        }
        self.flush_clears(None);
        self.end_rendering();
        unsafe { self.device.device.end_command_buffer(self.buffer) }?;
        self.recording = false;
        Ok(())
    }
}
