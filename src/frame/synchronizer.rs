// Frame synchronizer - the per-frame protocol
//
// FRAME TIMELINE:
// ┌──────────────────────────────────────────────────────────────────────┐
// │  Idle ─> Recording ─> Submitted ─> Presenting ─> Idle                │
// │                                                                      │
// │  (wait for the    (reset, record,  (present +    (signal fence,      │
// │   last frame)      close, submit)   advance)      strict: drain)     │
// └──────────────────────────────────────────────────────────────────────┘
//
// There is exactly one allocator, so the reclaim wait is always on the
// previous frame. The strict policy pays that wait at the end of the frame,
// the deferred policy at the start of the next one.

use serde::Deserialize;
use std::time::Duration;

use crate::backend::Backend;
use crate::error::{FrameError, FrameResult};
use crate::frame::{CommandRecorder, FrameContext, FrameFence, PresentationCycle};

/// Extra budget multiplier for the diagnostic re-wait after a timeout.
const STALL_DIAGNOSIS_FACTOR: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrainPolicy {
    /// Wait for the GPU right after signaling; the GPU is idle between frames.
    Strict,
    /// Wait for the previous frame at the start of the next tick.
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Recording,
    Submitted,
    Presenting,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameSettings {
    pub drain_policy: DrainPolicy,
    pub vsync_interval: u32,
    pub fence_timeout: Duration,
    pub fence_initial_value: u64,
    /// Re-wait once with a longer budget after a timeout, for the log only.
    pub diagnose_stalls: bool,
}

impl Default for FrameSettings {
    fn default() -> Self {
        Self {
            drain_policy: DrainPolicy::Strict,
            vsync_interval: 0,
            fence_timeout: Duration::from_secs(5),
            fence_initial_value: 0,
            diagnose_stalls: false,
        }
    }
}

/// Outcome of one frame tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReport {
    pub frame: u64,
    /// Back buffer the frame was rendered into.
    pub back_buffer: usize,
    pub fence_value: u64,
    pub completed_value: u64,
}

pub struct FrameSynchronizer<B: Backend> {
    recorder: CommandRecorder<B>,
    presentation: PresentationCycle<B>,
    fence: FrameFence<B>,
    queue: B::Queue,
    settings: FrameSettings,
    state: FrameState,
    frames: u64,
}

impl<B: Backend> FrameSynchronizer<B> {
    pub fn new(
        device: &B::Device,
        queue: B::Queue,
        swap_chain: B::SwapChain,
        settings: FrameSettings,
    ) -> FrameResult<Self> {
        let fence = FrameFence::new(device, settings.fence_initial_value)?;
        let recorder = CommandRecorder::new(device)?;
        let presentation = PresentationCycle::new(swap_chain)?;

        log::info!(
            "Frame synchronizer ready ({:?} drain, vsync interval {}, fence timeout {:?})",
            settings.drain_policy,
            settings.vsync_interval,
            settings.fence_timeout
        );

        Ok(Self {
            recorder,
            presentation,
            fence,
            queue,
            settings,
            state: FrameState::Idle,
            frames: 0,
        })
    }

    #[cfg(test)]
    pub fn state(&self) -> FrameState {
        self.state
    }

    #[cfg(test)]
    pub fn fence(&self) -> &FrameFence<B> {
        &self.fence
    }

    #[cfg(test)]
    pub fn recorder(&self) -> &CommandRecorder<B> {
        &self.recorder
    }

    pub fn presentation(&self) -> &PresentationCycle<B> {
        &self.presentation
    }

    /// Run one full frame tick.
    pub fn draw_frame(&mut self, ctx: &FrameContext<'_, B>) -> FrameResult<FrameReport> {
        if self.state != FrameState::Idle {
            return Err(FrameError::FrameInProgress(self.state));
        }

        // ─────────────────────────────────────────────────────────────────────
        // Idle -> Recording: reclaim the allocator
        // ─────────────────────────────────────────────────────────────────────
        if let Some(pending) = self.recorder.pending_fence_value() {
            self.wait_for(pending)?;
        }

        self.state = FrameState::Recording;
        let back_buffer = self.presentation.presentable_index();
        self.recorder.reset_for(ctx.pipeline_state(), &self.fence)?;
        self.recorder.record(ctx, self.presentation.back_buffer())?;

        // ─────────────────────────────────────────────────────────────────────
        // Recording -> Submitted
        // ─────────────────────────────────────────────────────────────────────
        self.recorder.submit(&self.queue)?;
        self.state = FrameState::Submitted;

        // ─────────────────────────────────────────────────────────────────────
        // Submitted -> Presenting: the queue is FIFO, so no wait before present
        // ─────────────────────────────────────────────────────────────────────
        self.state = FrameState::Presenting;
        let presented = self
            .presentation
            .present(&self.queue, self.settings.vsync_interval)
            .and_then(|()| self.presentation.advance());

        // ─────────────────────────────────────────────────────────────────────
        // Presenting -> Idle: the submission is fenced even if present failed,
        // so a later drain still covers it
        // ─────────────────────────────────────────────────────────────────────
        let fence_value = self.fence.signal_next(&self.queue)?;
        self.recorder.mark_in_flight(fence_value);
        presented?;

        if self.settings.drain_policy == DrainPolicy::Strict {
            self.wait_for(fence_value)?;
        }

        self.state = FrameState::Idle;
        self.frames += 1;

        let report = FrameReport {
            frame: self.frames,
            back_buffer,
            fence_value,
            completed_value: self.fence.completed_value()?,
        };
        log::trace!("Frame {:?}", report);
        Ok(report)
    }

    /// Block until every submitted frame has retired on the GPU.
    pub fn flush(&self) -> FrameResult<()> {
        let value = self.fence.last_signaled();
        self.diagnosed(value, |fence, timeout| fence.drain(timeout))?;
        log::debug!("Drained GPU up to fence value {}", value);
        Ok(())
    }

    /// Drain, discard any half-recorded frame, and rebuild the swap chain.
    /// Leaves the synchronizer Idle.
    pub fn rebuild_swap_chain<F>(&mut self, rebuild: F) -> FrameResult<()>
    where
        F: FnOnce(&mut B::SwapChain) -> FrameResult<()>,
    {
        self.flush()?;
        self.recorder.abandon()?;
        self.presentation.rebuild(rebuild)?;
        self.state = FrameState::Idle;
        Ok(())
    }

    fn wait_for(&self, value: u64) -> FrameResult<()> {
        self.diagnosed(value, |fence, timeout| fence.wait_until(value, timeout))
    }

    /// Run a fence wait, retrying once with an extended budget on timeout
    /// when stall diagnosis is enabled. The original timeout is returned.
    fn diagnosed<F>(&self, value: u64, wait: F) -> FrameResult<()>
    where
        F: Fn(&FrameFence<B>, Duration) -> FrameResult<()>,
    {
        let timeout = self.settings.fence_timeout;
        match wait(&self.fence, timeout) {
            Err(err @ FrameError::SyncTimeout { .. }) if self.settings.diagnose_stalls => {
                let extended = timeout * STALL_DIAGNOSIS_FACTOR;
                match wait(&self.fence, extended) {
                    Ok(()) => log::warn!(
                        "GPU reached fence value {} only within the extended budget of {:?}",
                        value,
                        extended
                    ),
                    Err(retry) => log::error!("GPU still stalled on fence value {}: {}", value, retry),
                }
                Err(err)
            }
            other => other,
        }
    }
}

impl<B: Backend> Drop for FrameSynchronizer<B> {
    fn drop(&mut self) {
        // GPU work may still reference the list, allocator and back buffers.
        if let Err(e) = self.flush() {
            log::error!("Failed to drain GPU before shutdown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{
        Mock, MockDepthStencil, MockGpu, MockPipeline, MockRootSignature, MockVertexBufferView,
    };
    use crate::backend::{ResourceState, ScissorRect, Viewport};
    use crate::frame::recorder::RecorderState;
    use crate::frame::DrawCall;
    use crate::scene::LIGHT_STEEL_BLUE;

    static ROOT: MockRootSignature = MockRootSignature;
    static PIPELINE: MockPipeline = MockPipeline("triangle");

    fn settings(drain_policy: DrainPolicy) -> FrameSettings {
        FrameSettings {
            drain_policy,
            fence_timeout: Duration::from_millis(10),
            ..FrameSettings::default()
        }
    }

    fn synchronizer(gpu: &MockGpu, drain_policy: DrainPolicy) -> FrameSynchronizer<Mock> {
        FrameSynchronizer::new(&gpu.device(), gpu.queue(), gpu.swap_chain(), settings(drain_policy))
            .unwrap()
    }

    fn triangle_frame() -> FrameContext<'static, Mock> {
        FrameContext {
            viewport: Viewport::full(1280, 720),
            scissor: ScissorRect::full(1280, 720),
            clear_color: LIGHT_STEEL_BLUE,
            depth_stencil: None,
            draw: Some(DrawCall {
                root_signature: &ROOT,
                pipeline: &PIPELINE,
                vertex_buffer: MockVertexBufferView { size: 84, stride: 28 },
            }),
        }
    }

    fn window_frame() -> FrameContext<'static, Mock> {
        FrameContext {
            viewport: Viewport::full(1280, 720),
            scissor: ScissorRect::full(1280, 720),
            clear_color: LIGHT_STEEL_BLUE,
            depth_stencil: Some(MockDepthStencil),
            draw: None,
        }
    }

    #[test]
    fn single_strict_frame_signals_and_drains() {
        let gpu = MockGpu::new(2);
        let mut sync = synchronizer(&gpu, DrainPolicy::Strict);
        assert_eq!(sync.presentation().presentable_index(), 0);

        let report = sync.draw_frame(&triangle_frame()).unwrap();

        assert_eq!(report.fence_value, 1);
        assert_eq!(report.completed_value, 1);
        assert_eq!(report.back_buffer, 0);
        assert_eq!(sync.presentation().presentable_index(), 1);
        assert_eq!(sync.state(), FrameState::Idle);
        assert_eq!(gpu.pending_work(), 0);
        assert!(gpu.violations().is_empty());
    }

    #[test]
    fn ten_strict_frames_alternate_back_buffers() {
        let gpu = MockGpu::new(2);
        let mut sync = synchronizer(&gpu, DrainPolicy::Strict);

        let reports: Vec<FrameReport> =
            (0..10).map(|_| sync.draw_frame(&triangle_frame()).unwrap()).collect();

        let buffers: Vec<usize> = reports.iter().map(|r| r.back_buffer).collect();
        assert_eq!(buffers, vec![0, 1, 0, 1, 0, 1, 0, 1, 0, 1]);
        let values: Vec<u64> = reports.iter().map(|r| r.fence_value).collect();
        assert_eq!(values, (1..=10).collect::<Vec<u64>>());
        assert!(reports.iter().all(|r| r.completed_value == r.fence_value));
        assert!(gpu.violations().is_empty());
    }

    #[test]
    fn ten_deferred_frames_trail_by_at_most_one() {
        let gpu = MockGpu::new(2);
        let mut sync = synchronizer(&gpu, DrainPolicy::Deferred);

        for expected in 1..=10u64 {
            let report = sync.draw_frame(&triangle_frame()).unwrap();
            assert_eq!(report.fence_value, expected);
            assert!(report.completed_value + 1 >= report.fence_value);
            assert!(report.completed_value <= report.fence_value);
        }

        assert_eq!(sync.fence().completed_value().unwrap(), 9);
        sync.flush().unwrap();
        assert_eq!(sync.fence().completed_value().unwrap(), 10);
        assert!(gpu.violations().is_empty());
    }

    #[test]
    fn allocator_is_never_reset_while_in_flight() {
        for policy in [DrainPolicy::Strict, DrainPolicy::Deferred] {
            let gpu = MockGpu::new(3);
            let mut sync = synchronizer(&gpu, policy);
            for _ in 0..7 {
                sync.draw_frame(&window_frame()).unwrap();
            }
            assert!(gpu.violations().is_empty(), "{:?}: {:?}", policy, gpu.violations());
            assert_eq!(gpu.allocator_resets(), 7);
        }
    }

    #[test]
    fn every_frame_brackets_writes_with_barriers() {
        let gpu = MockGpu::new(2);
        let mut sync = synchronizer(&gpu, DrainPolicy::Deferred);
        for _ in 0..4 {
            sync.draw_frame(&triangle_frame()).unwrap();
        }

        for commands in gpu.executed() {
            let transitions: Vec<(ResourceState, ResourceState)> = commands
                .iter()
                .filter_map(|c| c.transition())
                .collect();
            assert_eq!(
                transitions,
                vec![
                    (ResourceState::Presentable, ResourceState::RenderTarget),
                    (ResourceState::RenderTarget, ResourceState::Presentable),
                ]
            );

            let open = commands.iter().position(|c| c.transition().is_some()).unwrap();
            let close = commands.iter().rposition(|c| c.transition().is_some()).unwrap();
            for (i, command) in commands.iter().enumerate() {
                if command.writes_render_target() {
                    assert!(open < i && i < close, "{:?} outside barrier bracket", command);
                }
            }
        }
        assert!((0..2).all(|i| gpu.back_buffer_state(i) == ResourceState::Presentable));
    }

    #[test]
    fn strict_hang_reports_timeout() {
        let gpu = MockGpu::new(2);
        let mut sync = synchronizer(&gpu, DrainPolicy::Strict);
        gpu.set_hung(true);

        let result = sync.draw_frame(&triangle_frame());

        assert!(matches!(result, Err(FrameError::SyncTimeout { value: 1, .. })));
        assert_eq!(sync.fence().last_signaled(), 1);
    }

    #[test]
    fn deferred_hang_is_caught_at_next_reclaim() {
        let gpu = MockGpu::new(2);
        let mut sync = synchronizer(&gpu, DrainPolicy::Deferred);
        sync.draw_frame(&triangle_frame()).unwrap();
        gpu.set_hung(true);

        let result = sync.draw_frame(&triangle_frame());

        assert!(matches!(result, Err(FrameError::SyncTimeout { value: 1, completed: 0, .. })));
        assert_eq!(gpu.allocator_resets(), 1);
        assert!(gpu.violations().is_empty());
    }

    #[test]
    fn stall_diagnosis_still_reports_the_timeout() {
        let gpu = MockGpu::new(2);
        let mut sync = FrameSynchronizer::<Mock>::new(
            &gpu.device(),
            gpu.queue(),
            gpu.swap_chain(),
            FrameSettings {
                diagnose_stalls: true,
                ..settings(DrainPolicy::Strict)
            },
        )
        .unwrap();
        gpu.set_hung(true);

        assert!(matches!(
            sync.draw_frame(&triangle_frame()),
            Err(FrameError::SyncTimeout { .. })
        ));
        assert_eq!(gpu.blocking_waits(), 2);
    }

    #[test]
    fn device_loss_propagates() {
        let gpu = MockGpu::new(2);
        let mut sync = synchronizer(&gpu, DrainPolicy::Strict);
        sync.draw_frame(&triangle_frame()).unwrap();
        gpu.lose_device();

        assert_eq!(sync.draw_frame(&triangle_frame()), Err(FrameError::DeviceLost));
    }

    #[test]
    fn lost_swap_chain_still_fences_the_submission() {
        let gpu = MockGpu::new(2);
        let mut sync = synchronizer(&gpu, DrainPolicy::Strict);
        gpu.lose_swap_chain();

        let result = sync.draw_frame(&triangle_frame());

        assert!(matches!(result, Err(FrameError::SwapChainLost(_))));
        assert_eq!(sync.fence().last_signaled(), 1);
        assert_eq!(sync.recorder().pending_fence_value(), Some(1));
        assert_eq!(sync.state(), FrameState::Presenting);
        assert!(matches!(
            sync.draw_frame(&triangle_frame()),
            Err(FrameError::FrameInProgress(FrameState::Presenting))
        ));
    }

    #[test]
    fn rebuilding_after_swap_chain_loss_resumes_frames() {
        let gpu = MockGpu::new(2);
        let mut sync = synchronizer(&gpu, DrainPolicy::Strict);
        gpu.lose_swap_chain();
        assert!(sync.draw_frame(&triangle_frame()).is_err());

        let handle = gpu.clone();
        sync.rebuild_swap_chain(|_| {
            handle.restore_swap_chain();
            Ok(())
        })
        .unwrap();

        assert_eq!(sync.state(), FrameState::Idle);
        let report = sync.draw_frame(&triangle_frame()).unwrap();
        assert_eq!(report.fence_value, 2);
        assert_eq!(report.back_buffer, 0);
        assert!(gpu.violations().is_empty());
    }

    #[test]
    fn rebuilding_after_a_failed_recording_discards_the_open_list() {
        let gpu = MockGpu::new(2);
        let mut sync = synchronizer(&gpu, DrainPolicy::Strict);
        sync.draw_frame(&triangle_frame()).unwrap();

        gpu.fail_next_close();
        assert!(matches!(sync.draw_frame(&triangle_frame()), Err(FrameError::Vulkan(_))));
        assert_eq!(sync.state(), FrameState::Recording);
        assert_eq!(sync.recorder().state(), RecorderState::Recording);
        assert!(matches!(
            sync.draw_frame(&triangle_frame()),
            Err(FrameError::FrameInProgress(FrameState::Recording))
        ));

        sync.rebuild_swap_chain(|_| Ok(())).unwrap();
        assert_eq!(sync.state(), FrameState::Idle);
        assert_eq!(sync.recorder().state(), RecorderState::Closed);

        let report = sync.draw_frame(&triangle_frame()).unwrap();
        assert_eq!(report.fence_value, 2);
        assert_eq!(gpu.executed().len(), 2);
        assert!(gpu.violations().is_empty());
    }

    #[test]
    fn dropping_drains_outstanding_work() {
        let gpu = MockGpu::new(2);
        {
            let mut sync = synchronizer(&gpu, DrainPolicy::Deferred);
            sync.draw_frame(&window_frame()).unwrap();
            sync.draw_frame(&window_frame()).unwrap();
            assert_eq!(gpu.pending_work(), 2);
        }
        assert_eq!(gpu.pending_work(), 0);
    }

    #[test]
    fn window_sample_never_draws() {
        let gpu = MockGpu::new(2);
        let mut sync = synchronizer(&gpu, DrainPolicy::Strict);
        sync.draw_frame(&window_frame()).unwrap();

        let commands = &gpu.executed()[0];
        assert!(commands.iter().all(|c| !c.is_draw()));
    }

    #[test]
    fn triangle_draw_is_fixed() {
        let gpu = MockGpu::new(2);
        let mut sync = synchronizer(&gpu, DrainPolicy::Strict);
        for _ in 0..3 {
            sync.draw_frame(&triangle_frame()).unwrap();
        }

        for commands in gpu.executed() {
            let draws: Vec<_> = commands.iter().filter(|c| c.is_draw()).collect();
            assert_eq!(draws.len(), 1);
            assert_eq!(
                *draws[0],
                crate::backend::mock::MockCommand::Draw {
                    vertex_count: 3,
                    instance_count: 1,
                    start_vertex: 0,
                    start_instance: 0,
                }
            );
        }
    }
}
