// Mock backend for unit tests (no GPU required)
//
// Simulates a single in-order GPU queue. Submitted work sits in a pending
// list until a fence wait (or the test) retires it, which makes the CPU/GPU
// race observable: completed values stay stale until something drives the
// timeline forward.
//
// Protocol breaks that a real driver would turn into corruption are pushed
// onto `violations()` instead, so tests can assert there were none.

use ash::vk;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{
    Backend, CommandAllocator, CommandList, CommandQueue, Device, GpuFence, PrimitiveTopology,
    ResourceState, ScissorRect, SwapChain, Viewport,
};
use crate::error::{FrameError, FrameResult};

pub enum Mock {}

impl Backend for Mock {
    type Device = MockDevice;
    type Queue = MockQueue;
    type SwapChain = MockSwapChain;
    type Fence = MockFence;
    type CommandAllocator = MockAllocator;
    type CommandList = MockCommandList;
    type PipelineState = MockPipeline;
    type RootSignature = MockRootSignature;
    type VertexBufferView = MockVertexBufferView;
    type RenderTargetView = MockRenderTarget;
    type DepthStencilView = MockDepthStencil;
}

// ============================================================================
// Handles
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockPipeline(pub &'static str);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockRootSignature;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockVertexBufferView {
    pub size: u32,
    pub stride: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockRenderTarget(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockDepthStencil;

/// One recorded command, as seen by the simulated GPU.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCommand {
    SetPipeline(&'static str),
    SetRootSignature,
    SetViewport(Viewport),
    SetScissor(ScissorRect),
    Transition {
        target: usize,
        before: ResourceState,
        after: ResourceState,
    },
    ClearRenderTarget {
        target: usize,
        color: [f32; 4],
    },
    ClearDepthStencil {
        depth: f32,
        stencil: u8,
    },
    SetRenderTargets {
        target: usize,
        depth_stencil: bool,
    },
    SetPrimitiveTopology(PrimitiveTopology),
    SetVertexBuffer(MockVertexBufferView),
    Draw {
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    },
    Close,
}

impl MockCommand {
    pub fn transition(&self) -> Option<(ResourceState, ResourceState)> {
        match self {
            MockCommand::Transition { before, after, .. } => Some((*before, *after)),
            _ => None,
        }
    }

    pub fn is_draw(&self) -> bool {
        matches!(self, MockCommand::Draw { .. })
    }

    pub fn writes_render_target(&self) -> bool {
        matches!(
            self,
            MockCommand::ClearRenderTarget { .. }
                | MockCommand::ClearDepthStencil { .. }
                | MockCommand::Draw { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentRecord {
    pub back_buffer: usize,
    pub sync_interval: u32,
}

// ============================================================================
// Simulated GPU
// ============================================================================

#[derive(Debug)]
enum GpuWork {
    Execute { allocator: usize },
    Signal { fence: usize, value: u64 },
}

#[derive(Default)]
struct GpuState {
    fences: Vec<u64>,
    allocators: usize,
    allocator_resets: usize,
    pending: VecDeque<GpuWork>,
    executed: Vec<Vec<MockCommand>>,
    presents: Vec<PresentRecord>,
    buffer_states: Vec<ResourceState>,
    back_buffer: usize,
    next_back_buffer: Option<usize>,
    blocking_waits: usize,
    violations: Vec<String>,
    hung: bool,
    device_lost: bool,
    swap_chain_lost: bool,
    fail_next_close: bool,
}

impl GpuState {
    fn retire_one(&mut self) -> bool {
        match self.pending.pop_front() {
            Some(GpuWork::Signal { fence, value }) => {
                let slot = &mut self.fences[fence];
                *slot = (*slot).max(value);
                true
            }
            Some(GpuWork::Execute { .. }) => true,
            None => false,
        }
    }

    fn check_device(&self) -> FrameResult<()> {
        if self.device_lost {
            Err(FrameError::DeviceLost)
        } else {
            Ok(())
        }
    }
}

/// Handle to the shared simulated GPU. Clones see the same timeline.
#[derive(Clone)]
pub struct MockGpu(Arc<Mutex<GpuState>>);

impl MockGpu {
    pub fn new(back_buffers: usize) -> Self {
        let state = GpuState {
            buffer_states: vec![ResourceState::Presentable; back_buffers],
            ..GpuState::default()
        };
        Self(Arc::new(Mutex::new(state)))
    }

    pub fn device(&self) -> MockDevice {
        MockDevice { gpu: self.clone() }
    }

    pub fn queue(&self) -> MockQueue {
        MockQueue { gpu: self.clone() }
    }

    pub fn swap_chain(&self) -> MockSwapChain {
        let buffer_count = self.0.lock().buffer_states.len();
        MockSwapChain {
            gpu: self.clone(),
            buffer_count,
        }
    }

    /// Let the GPU finish everything queued so far.
    pub fn retire_all(&self) {
        let mut gpu = self.0.lock();
        while gpu.retire_one() {}
    }

    pub fn retire_one(&self) {
        self.0.lock().retire_one();
    }

    /// A hung GPU retires nothing, so every wait times out.
    pub fn set_hung(&self, hung: bool) {
        self.0.lock().hung = hung;
    }

    pub fn lose_device(&self) {
        self.0.lock().device_lost = true;
    }

    pub fn lose_swap_chain(&self) {
        self.0.lock().swap_chain_lost = true;
    }

    /// Make the next command list close fail, leaving the list open.
    pub fn fail_next_close(&self) {
        self.0.lock().fail_next_close = true;
    }

    /// Bring a lost swap chain back with fresh, presentable buffers.
    pub fn restore_swap_chain(&self) {
        let mut gpu = self.0.lock();
        gpu.swap_chain_lost = false;
        gpu.back_buffer = 0;
        gpu.next_back_buffer = None;
        for state in gpu.buffer_states.iter_mut() {
            *state = ResourceState::Presentable;
        }
    }

    /// Override the index the swap chain reports after the next present.
    pub fn set_next_back_buffer(&self, index: usize) {
        self.0.lock().next_back_buffer = Some(index);
    }

    pub fn pending_work(&self) -> usize {
        self.0.lock().pending.len()
    }

    pub fn executed(&self) -> Vec<Vec<MockCommand>> {
        self.0.lock().executed.clone()
    }

    pub fn presents(&self) -> Vec<PresentRecord> {
        self.0.lock().presents.clone()
    }

    pub fn back_buffer_state(&self, index: usize) -> ResourceState {
        self.0.lock().buffer_states[index]
    }

    pub fn allocator_resets(&self) -> usize {
        self.0.lock().allocator_resets
    }

    pub fn blocking_waits(&self) -> usize {
        self.0.lock().blocking_waits
    }

    pub fn violations(&self) -> Vec<String> {
        self.0.lock().violations.clone()
    }
}

// ============================================================================
// Capability implementations
// ============================================================================

pub struct MockDevice {
    gpu: MockGpu,
}

impl Device<Mock> for MockDevice {
    fn create_fence(&self, initial_value: u64) -> FrameResult<MockFence> {
        let mut gpu = self.gpu.0.lock();
        gpu.check_device()?;
        gpu.fences.push(initial_value);
        Ok(MockFence {
            id: gpu.fences.len() - 1,
            gpu: self.gpu.clone(),
        })
    }

    fn create_command_allocator(&self) -> FrameResult<MockAllocator> {
        let mut gpu = self.gpu.0.lock();
        gpu.check_device()?;
        gpu.allocators += 1;
        Ok(MockAllocator {
            id: gpu.allocators - 1,
            gpu: self.gpu.clone(),
        })
    }

    fn create_command_list(&self, allocator: &MockAllocator) -> FrameResult<MockCommandList> {
        self.gpu.0.lock().check_device()?;
        Ok(MockCommandList {
            gpu: self.gpu.clone(),
            allocator: allocator.id,
            commands: Vec::new(),
            recording: false,
        })
    }
}

pub struct MockFence {
    id: usize,
    gpu: MockGpu,
}

impl GpuFence for MockFence {
    fn completed_value(&self) -> FrameResult<u64> {
        let gpu = self.gpu.0.lock();
        gpu.check_device()?;
        Ok(gpu.fences[self.id])
    }

    fn wait(&self, value: u64, _timeout: Duration) -> FrameResult<bool> {
        let mut gpu = self.gpu.0.lock();
        gpu.check_device()?;
        gpu.blocking_waits += 1;
        if !gpu.hung {
            while gpu.fences[self.id] < value && gpu.retire_one() {}
        }
        Ok(gpu.fences[self.id] >= value)
    }
}

pub struct MockAllocator {
    id: usize,
    gpu: MockGpu,
}

impl CommandAllocator for MockAllocator {
    fn reset(&mut self) -> FrameResult<()> {
        let mut gpu = self.gpu.0.lock();
        gpu.check_device()?;
        let in_flight = gpu
            .pending
            .iter()
            .any(|work| matches!(work, GpuWork::Execute { allocator } if *allocator == self.id));
        if in_flight {
            let message = format!("allocator {} reset while the GPU still uses it", self.id);
            gpu.violations.push(message);
        }
        gpu.allocator_resets += 1;
        Ok(())
    }
}

pub struct MockCommandList {
    gpu: MockGpu,
    allocator: usize,
    commands: Vec<MockCommand>,
    recording: bool,
}

impl MockCommandList {
    fn push(&mut self, command: MockCommand) {
        if !self.recording {
            let message = format!("{:?} recorded into a closed list", command);
            self.gpu.0.lock().violations.push(message);
        }
        self.commands.push(command);
    }
}

impl CommandList<Mock> for MockCommandList {
    fn reset(&mut self, allocator: &MockAllocator, pipeline: Option<&MockPipeline>) -> FrameResult<()> {
        if self.recording {
            return Err(FrameError::InvalidRecorderState {
                operation: "reset",
                state: "recording",
            });
        }
        self.allocator = allocator.id;
        self.commands.clear();
        self.recording = true;
        if let Some(pipeline) = pipeline {
            self.push(MockCommand::SetPipeline(pipeline.0));
        }
        Ok(())
    }

    fn set_root_signature(&mut self, _root_signature: &MockRootSignature) {
        self.push(MockCommand::SetRootSignature);
    }

    fn set_viewport(&mut self, viewport: &Viewport) {
        self.push(MockCommand::SetViewport(*viewport));
    }

    fn set_scissor(&mut self, rect: &ScissorRect) {
        self.push(MockCommand::SetScissor(*rect));
    }

    fn transition(&mut self, target: MockRenderTarget, before: ResourceState, after: ResourceState) {
        self.push(MockCommand::Transition {
            target: target.0,
            before,
            after,
        });
    }

    fn clear_render_target(&mut self, target: MockRenderTarget, color: [f32; 4]) {
        self.push(MockCommand::ClearRenderTarget {
            target: target.0,
            color,
        });
    }

    fn clear_depth_stencil(&mut self, _view: MockDepthStencil, depth: f32, stencil: u8) {
        self.push(MockCommand::ClearDepthStencil { depth, stencil });
    }

    fn set_render_targets(&mut self, target: MockRenderTarget, depth_stencil: Option<MockDepthStencil>) {
        self.push(MockCommand::SetRenderTargets {
            target: target.0,
            depth_stencil: depth_stencil.is_some(),
        });
    }

    fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        self.push(MockCommand::SetPrimitiveTopology(topology));
    }

    fn set_vertex_buffer(&mut self, view: MockVertexBufferView) {
        self.push(MockCommand::SetVertexBuffer(view));
    }

    fn draw_instanced(&mut self, vertex_count: u32, instance_count: u32, start_vertex: u32, start_instance: u32) {
        self.push(MockCommand::Draw {
            vertex_count,
            instance_count,
            start_vertex,
            start_instance,
        });
    }

    fn close(&mut self) -> FrameResult<()> {
        if !self.recording {
            return Err(FrameError::InvalidRecorderState {
                operation: "close",
                state: "closed",
            });
        }
        if std::mem::take(&mut self.gpu.0.lock().fail_next_close) {
            return Err(FrameError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        self.commands.push(MockCommand::Close);
        self.recording = false;
        Ok(())
    }
}

pub struct MockQueue {
    gpu: MockGpu,
}

impl CommandQueue<Mock> for MockQueue {
    fn execute(&self, list: &MockCommandList) -> FrameResult<()> {
        let mut gpu = self.gpu.0.lock();
        gpu.check_device()?;
        if list.recording {
            gpu.violations.push("executed a list that was never closed".to_string());
        }

        // Barriers take effect in queue order; track them at submission.
        for command in &list.commands {
            if let MockCommand::Transition { target, before, after } = *command {
                if gpu.buffer_states[target] != before {
                    let message = format!(
                        "back buffer {} transitioned from {:?} but is {:?}",
                        target, before, gpu.buffer_states[target]
                    );
                    gpu.violations.push(message);
                }
                gpu.buffer_states[target] = after;
            }
        }

        gpu.executed.push(list.commands.clone());
        gpu.pending.push_back(GpuWork::Execute {
            allocator: list.allocator,
        });
        Ok(())
    }

    fn signal(&self, fence: &MockFence, value: u64) -> FrameResult<()> {
        let mut gpu = self.gpu.0.lock();
        gpu.check_device()?;
        gpu.pending.push_back(GpuWork::Signal {
            fence: fence.id,
            value,
        });
        Ok(())
    }
}

pub struct MockSwapChain {
    gpu: MockGpu,
    buffer_count: usize,
}

impl SwapChain<Mock> for MockSwapChain {
    fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    fn current_back_buffer_index(&self) -> FrameResult<usize> {
        let gpu = self.gpu.0.lock();
        gpu.check_device()?;
        Ok(gpu.back_buffer)
    }

    fn render_target_view(&self, index: usize) -> MockRenderTarget {
        MockRenderTarget(index)
    }

    fn present(&mut self, _queue: &MockQueue, sync_interval: u32) -> FrameResult<()> {
        let mut gpu = self.gpu.0.lock();
        gpu.check_device()?;
        if gpu.swap_chain_lost {
            return Err(FrameError::SwapChainLost("mock swap chain lost".to_string()));
        }

        let back_buffer = gpu.back_buffer;
        if gpu.buffer_states[back_buffer] != ResourceState::Presentable {
            let message = format!("presented back buffer {} while it is a render target", back_buffer);
            gpu.violations.push(message);
        }

        gpu.presents.push(PresentRecord {
            back_buffer,
            sync_interval,
        });
        gpu.back_buffer = match gpu.next_back_buffer.take() {
            Some(index) => index,
            None => (back_buffer + 1) % self.buffer_count,
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_stays_pending_until_retired() {
        let gpu = MockGpu::new(2);
        let device = gpu.device();
        let queue = gpu.queue();
        let fence = device.create_fence(0).unwrap();

        queue.signal(&fence, 1).unwrap();
        assert_eq!(fence.completed_value().unwrap(), 0);
        assert_eq!(gpu.pending_work(), 1);

        gpu.retire_all();
        assert_eq!(fence.completed_value().unwrap(), 1);
    }

    #[test]
    fn wait_retires_only_what_it_needs() {
        let gpu = MockGpu::new(2);
        let device = gpu.device();
        let queue = gpu.queue();
        let fence = device.create_fence(0).unwrap();
        queue.signal(&fence, 1).unwrap();
        queue.signal(&fence, 2).unwrap();

        assert!(fence.wait(1, Duration::ZERO).unwrap());
        assert_eq!(fence.completed_value().unwrap(), 1);
        assert_eq!(gpu.pending_work(), 1);
    }

    #[test]
    fn resetting_an_in_flight_allocator_is_a_violation() {
        let gpu = MockGpu::new(2);
        let device = gpu.device();
        let queue = gpu.queue();
        let mut allocator = device.create_command_allocator().unwrap();
        let mut list = device.create_command_list(&allocator).unwrap();

        list.reset(&allocator, None).unwrap();
        list.close().unwrap();
        queue.execute(&list).unwrap();
        allocator.reset().unwrap();

        assert_eq!(gpu.violations().len(), 1);
    }

    #[test]
    fn presenting_a_render_target_is_a_violation() {
        let gpu = MockGpu::new(2);
        let device = gpu.device();
        let queue = gpu.queue();
        let allocator = device.create_command_allocator().unwrap();
        let mut list = device.create_command_list(&allocator).unwrap();
        let mut swap_chain = gpu.swap_chain();

        list.reset(&allocator, None).unwrap();
        list.transition(MockRenderTarget(0), ResourceState::Presentable, ResourceState::RenderTarget);
        list.close().unwrap();
        queue.execute(&list).unwrap();
        swap_chain.present(&queue, 0).unwrap();

        assert_eq!(gpu.violations().len(), 1);
        assert_eq!(gpu.back_buffer_state(0), ResourceState::RenderTarget);
    }
}
