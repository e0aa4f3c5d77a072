// Command recorder - one allocator, one reusable command list
//
// The recorded frame is always the same shape: a Presentable -> RenderTarget
// barrier, clears, bindings, the optional triangle draw, and the matching
// RenderTarget -> Presentable barrier. Anything that writes the back buffer
// lives inside that bracket.

use crate::backend::{
    Backend, CommandAllocator, CommandList, CommandQueue, Device, PrimitiveTopology,
    ResourceState, ScissorRect, Viewport,
};
use crate::error::{FrameError, FrameResult};
use crate::frame::FrameFence;
use crate::scene::TRIANGLE_VERTEX_COUNT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Closed,
    Recording,
}

impl RecorderState {
    fn name(self) -> &'static str {
        match self {
            RecorderState::Closed => "closed",
            RecorderState::Recording => "recording",
        }
    }
}

/// What the GPU may still be doing with the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GpuUse {
    Idle,
    /// Submitted, but no fence value has been attached yet.
    Unfenced,
    /// Submitted and followed by a signal of this value.
    Pending(u64),
}

/// Pipeline bindings for the draw step.
pub struct DrawCall<'a, B: Backend> {
    pub root_signature: &'a B::RootSignature,
    pub pipeline: &'a B::PipelineState,
    pub vertex_buffer: B::VertexBufferView,
}

/// Everything one frame's recording needs besides the back buffer itself.
pub struct FrameContext<'a, B: Backend> {
    pub viewport: Viewport,
    pub scissor: ScissorRect,
    pub clear_color: [f32; 4],
    pub depth_stencil: Option<B::DepthStencilView>,
    pub draw: Option<DrawCall<'a, B>>,
}

impl<'a, B: Backend> FrameContext<'a, B> {
    pub fn pipeline_state(&self) -> Option<&'a B::PipelineState> {
        self.draw.as_ref().map(|draw| draw.pipeline)
    }
}

pub struct CommandRecorder<B: Backend> {
    list: B::CommandList,
    allocator: B::CommandAllocator,
    state: RecorderState,
    /// Closed with commands that have not been handed to a queue yet.
    unsubmitted: bool,
    gpu_use: GpuUse,
}

impl<B: Backend> CommandRecorder<B> {
    pub fn new(device: &B::Device) -> FrameResult<Self> {
        let allocator = device.create_command_allocator()?;
        let list = device.create_command_list(&allocator)?;

        Ok(Self {
            list,
            allocator,
            state: RecorderState::Closed,
            unsubmitted: false,
            gpu_use: GpuUse::Idle,
        })
    }

    #[cfg(test)]
    pub fn state(&self) -> RecorderState {
        self.state
    }

    /// Fence value that must complete before the allocator can be reset.
    pub fn pending_fence_value(&self) -> Option<u64> {
        match self.gpu_use {
            GpuUse::Pending(value) => Some(value),
            GpuUse::Idle | GpuUse::Unfenced => None,
        }
    }

    /// Reset the allocator and reopen the list for `pipeline`.
    ///
    /// Fails with `ResourceBusy` while the last submission has not been
    /// observed complete on `fence`.
    pub fn reset_for(
        &mut self,
        pipeline: Option<&B::PipelineState>,
        fence: &FrameFence<B>,
    ) -> FrameResult<()> {
        if self.state == RecorderState::Recording {
            return Err(self.invalid("reset"));
        }

        match self.gpu_use {
            GpuUse::Idle => {}
            GpuUse::Unfenced => {
                return Err(FrameError::ResourceBusy {
                    pending: fence.next_value(),
                    completed: fence.completed_value()?,
                });
            }
            GpuUse::Pending(pending) => {
                let completed = fence.completed_value()?;
                if completed < pending {
                    return Err(FrameError::ResourceBusy { pending, completed });
                }
            }
        }

        self.allocator.reset()?;
        self.list.reset(&self.allocator, pipeline)?;

        self.gpu_use = GpuUse::Idle;
        self.unsubmitted = false;
        self.state = RecorderState::Recording;
        Ok(())
    }

    /// Record the frame into `target` and close the list.
    pub fn record(&mut self, ctx: &FrameContext<'_, B>, target: B::RenderTargetView) -> FrameResult<()> {
        if self.state != RecorderState::Recording {
            return Err(self.invalid("record"));
        }

        let list = &mut self.list;

        if let Some(draw) = &ctx.draw {
            list.set_root_signature(draw.root_signature);
        }
        list.set_viewport(&ctx.viewport);
        list.set_scissor(&ctx.scissor);

        list.transition(target, ResourceState::Presentable, ResourceState::RenderTarget);

        list.clear_render_target(target, ctx.clear_color);
        if let Some(depth_stencil) = ctx.depth_stencil {
            list.clear_depth_stencil(depth_stencil, 1.0, 0);
        }
        list.set_render_targets(target, ctx.depth_stencil);

        if let Some(draw) = &ctx.draw {
            list.set_primitive_topology(PrimitiveTopology::TriangleList);
            list.set_vertex_buffer(draw.vertex_buffer);
            list.draw_instanced(TRIANGLE_VERTEX_COUNT, 1, 0, 0);
        }

        list.transition(target, ResourceState::RenderTarget, ResourceState::Presentable);

        self.close()
    }

    pub fn close(&mut self) -> FrameResult<()> {
        if self.state != RecorderState::Recording {
            return Err(self.invalid("close"));
        }

        self.list.close()?;
        self.state = RecorderState::Closed;
        self.unsubmitted = true;
        Ok(())
    }

    /// Hand the closed list to `queue`. Each recording may be submitted once.
    pub fn submit(&mut self, queue: &B::Queue) -> FrameResult<()> {
        if self.state != RecorderState::Closed {
            return Err(self.invalid("submit"));
        }
        if !self.unsubmitted {
            return Err(FrameError::InvalidRecorderState {
                operation: "submit",
                state: "closed without new commands",
            });
        }

        queue.execute(&self.list)?;
        self.unsubmitted = false;
        self.gpu_use = GpuUse::Unfenced;
        Ok(())
    }

    /// Attach the fence value signaled right after the last submission.
    pub fn mark_in_flight(&mut self, fence_value: u64) {
        if self.gpu_use == GpuUse::Unfenced {
            self.gpu_use = GpuUse::Pending(fence_value);
        }
    }

    /// Close a list left open by a failed frame and drop its commands.
    pub fn abandon(&mut self) -> FrameResult<()> {
        if self.state == RecorderState::Recording {
            log::warn!("Abandoning partially recorded command list");
            self.list.close()?;
            self.state = RecorderState::Closed;
        }
        self.unsubmitted = false;
        Ok(())
    }

    fn invalid(&self, operation: &'static str) -> FrameError {
        FrameError::InvalidRecorderState {
            operation,
            state: self.state.name(),
        }
    }
}
