// Backend module - GPU capabilities consumed by the frame pipeline
//
// Design: the frame core only sees the traits below. The Vulkan types in
// this module implement them on real hardware; `mock` implements them on a
// simulated GPU timeline so the synchronization protocol is testable
// without a device.

pub mod buffer;
pub mod command;
pub mod device;
pub mod pipeline;
pub mod queue;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

#[cfg(test)]
pub mod mock;

use std::time::Duration;

use crate::error::FrameResult;

pub use command::{VulkanCommandAllocator, VulkanCommandList};
pub use device::VulkanDevice;
pub use pipeline::{PipelineState, RootSignature};
pub use queue::VulkanQueue;
pub use surface::Surface;
pub use swapchain::Swapchain;
pub use sync::TimelineFence;

/// Usage state of a back buffer, as tracked by resource barriers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Presentable,
    RenderTarget,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScissorRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl ScissorRect {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            left: 0,
            top: 0,
            right: width as i32,
            bottom: height as i32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveTopology {
    TriangleList,
}

/// Ties together the handle types of one GPU backend.
pub trait Backend: Sized {
    type Device: Device<Self>;
    type Queue: CommandQueue<Self>;
    type SwapChain: SwapChain<Self>;
    type Fence: GpuFence;
    type CommandAllocator: CommandAllocator;
    type CommandList: CommandList<Self>;
    type PipelineState;
    type RootSignature;
    type VertexBufferView: Copy;
    type RenderTargetView: Copy;
    type DepthStencilView: Copy;
}

/// Object factory for the synchronization and recording resources.
pub trait Device<B: Backend> {
    fn create_fence(&self, initial_value: u64) -> FrameResult<B::Fence>;

    fn create_command_allocator(&self) -> FrameResult<B::CommandAllocator>;

    /// The returned list is closed: it must be reset before recording.
    fn create_command_list(&self, allocator: &B::CommandAllocator) -> FrameResult<B::CommandList>;
}

/// GPU-visible counter.
pub trait GpuFence {
    /// Latest value the GPU has reached. Never blocks, may be stale.
    fn completed_value(&self) -> FrameResult<u64>;

    /// Block until the counter reaches `value`. `Ok(false)` means the timeout elapsed.
    fn wait(&self, value: u64, timeout: Duration) -> FrameResult<bool>;
}

pub trait CommandAllocator {
    /// Only valid once every list recorded from this allocator has retired.
    fn reset(&mut self) -> FrameResult<()>;
}

/// Encoder for one frame's worth of GPU commands.
pub trait CommandList<B: Backend> {
    fn reset(
        &mut self,
        allocator: &B::CommandAllocator,
        pipeline: Option<&B::PipelineState>,
    ) -> FrameResult<()>;

    fn set_root_signature(&mut self, root_signature: &B::RootSignature);

    fn set_viewport(&mut self, viewport: &Viewport);

    fn set_scissor(&mut self, rect: &ScissorRect);

    fn transition(
        &mut self,
        target: B::RenderTargetView,
        before: ResourceState,
        after: ResourceState,
    );

    fn clear_render_target(&mut self, target: B::RenderTargetView, color: [f32; 4]);

    fn clear_depth_stencil(&mut self, view: B::DepthStencilView, depth: f32, stencil: u8);

    fn set_render_targets(
        &mut self,
        target: B::RenderTargetView,
        depth_stencil: Option<B::DepthStencilView>,
    );

    fn set_primitive_topology(&mut self, topology: PrimitiveTopology);

    fn set_vertex_buffer(&mut self, view: B::VertexBufferView);

    fn draw_instanced(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    );

    fn close(&mut self) -> FrameResult<()>;
}

/// In-order GPU queue.
pub trait CommandQueue<B: Backend> {
    fn execute(&self, list: &B::CommandList) -> FrameResult<()>;

    /// Set `fence` to `value` once all previously queued work has completed.
    fn signal(&self, fence: &B::Fence, value: u64) -> FrameResult<()>;
}

pub trait SwapChain<B: Backend> {
    fn buffer_count(&self) -> usize;

    /// Index of the back buffer that may be rendered into next.
    fn current_back_buffer_index(&self) -> FrameResult<usize>;

    fn render_target_view(&self, index: usize) -> B::RenderTargetView;

    fn present(&mut self, queue: &B::Queue, sync_interval: u32) -> FrameResult<()>;
}

/// The Vulkan implementation of [`Backend`].
pub enum Vulkan {}

impl Backend for Vulkan {
    type Device = std::sync::Arc<VulkanDevice>;
    type Queue = VulkanQueue;
    type SwapChain = Swapchain;
    type Fence = TimelineFence;
    type CommandAllocator = VulkanCommandAllocator;
    type CommandList = VulkanCommandList;
    type PipelineState = PipelineState;
    type RootSignature = RootSignature;
    type VertexBufferView = buffer::VertexBufferView;
    type RenderTargetView = swapchain::RenderTargetView;
    type DepthStencilView = buffer::DepthStencilView;
}
