// Frame fence - CPU-side bookkeeping around a GPU counter
//
// The CPU owns the next value to signal; the GPU owns the completed value.
// A frame k is done once completed >= k.

use std::time::Duration;

use crate::backend::{Backend, CommandQueue, Device, GpuFence};
use crate::error::{FrameError, FrameResult};

pub struct FrameFence<B: Backend> {
    fence: B::Fence,
    last_signaled: u64,
}

impl<B: Backend> FrameFence<B> {
    /// Create the fence with its GPU counter at `initial_value`.
    /// The first signal uses `initial_value + 1`.
    pub fn new(device: &B::Device, initial_value: u64) -> FrameResult<Self> {
        let fence = device.create_fence(initial_value)?;
        log::debug!("Created frame fence at value {}", initial_value);
        Ok(Self {
            fence,
            last_signaled: initial_value,
        })
    }

    pub fn last_signaled(&self) -> u64 {
        self.last_signaled
    }

    pub fn next_value(&self) -> u64 {
        self.last_signaled + 1
    }

    /// Enqueue a GPU-side write of `value` behind everything already on `queue`.
    pub fn signal(&mut self, queue: &B::Queue, value: u64) -> FrameResult<()> {
        if value != self.next_value() {
            return Err(FrameError::FenceValueNotMonotonic {
                last: self.last_signaled,
                requested: value,
            });
        }

        queue.signal(&self.fence, value)?;
        self.last_signaled = value;
        log::trace!("Signaled fence value {}", value);
        Ok(())
    }

    pub fn signal_next(&mut self, queue: &B::Queue) -> FrameResult<u64> {
        let value = self.next_value();
        self.signal(queue, value)?;
        Ok(value)
    }

    pub fn completed_value(&self) -> FrameResult<u64> {
        let completed = self.fence.completed_value()?;
        if completed > self.last_signaled {
            log::warn!(
                "Fence completed value {} is ahead of the last signaled value {}",
                completed,
                self.last_signaled
            );
        }
        Ok(completed)
    }

    /// Block until the GPU reaches `value` or `timeout` elapses.
    ///
    /// Returns without touching the backend wait when the value is already
    /// complete. A timeout leaves the fence untouched.
    pub fn wait_until(&self, value: u64, timeout: Duration) -> FrameResult<()> {
        let completed = self.completed_value()?;
        if completed >= value {
            return Ok(());
        }

        if value > self.last_signaled {
            log::warn!(
                "Waiting on fence value {} which was never signaled (last: {})",
                value,
                self.last_signaled
            );
        }

        log::trace!("Waiting for fence value {} (completed: {})", value, completed);
        if self.fence.wait(value, timeout)? {
            return Ok(());
        }

        Err(FrameError::SyncTimeout {
            value,
            completed: self.fence.completed_value()?,
            timeout,
        })
    }

    /// Wait until every value signaled so far has completed.
    pub fn drain(&self, timeout: Duration) -> FrameResult<()> {
        self.wait_until(self.last_signaled, timeout)
    }
}
