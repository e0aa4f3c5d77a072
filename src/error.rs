// Frame pipeline errors
//
// Every fallible call that crosses the device/queue/swap chain boundary
// returns one of these. Nothing in the frame core recovers locally: errors
// travel up to the render loop, which decides whether to rebuild the swap
// chain or shut down.

use ash::vk;
use std::time::Duration;
use thiserror::Error;

use crate::frame::FrameState;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    /// The GPU or driver became unusable. Never retried.
    #[error("GPU device lost")]
    DeviceLost,

    /// A fence wait ran out of budget before the GPU reached `value`.
    #[error("timed out after {timeout:?} waiting for fence value {value} (completed: {completed})")]
    SyncTimeout {
        value: u64,
        completed: u64,
        timeout: Duration,
    },

    /// The command allocator is still referenced by work the GPU has not finished.
    #[error("command allocator still in use by the GPU (pending fence value {pending}, completed {completed})")]
    ResourceBusy { pending: u64, completed: u64 },

    /// A recorder operation was issued out of the Closed/Recording sequence.
    #[error("cannot {operation} while command recorder is {state}")]
    InvalidRecorderState {
        operation: &'static str,
        state: &'static str,
    },

    /// The presentation target can no longer be used for this session.
    #[error("swap chain lost: {0}")]
    SwapChainLost(String),

    /// Fence values must grow by exactly one per signal.
    #[error("fence value {requested} does not follow last signaled value {last}")]
    FenceValueNotMonotonic { last: u64, requested: u64 },

    /// A frame tick started while a previous one never returned to Idle.
    #[error("frame synchronizer is not idle (state: {0:?})")]
    FrameInProgress(FrameState),

    #[error("Vulkan error: {0}")]
    Vulkan(vk::Result),
}

impl FrameError {
    /// Whether the render loop must stop. Swap chain loss is the only error
    /// the surrounding application may answer by rebuilding the swap chain.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FrameError::SwapChainLost(_))
    }
}

impl From<vk::Result> for FrameError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => FrameError::DeviceLost,
            vk::Result::ERROR_OUT_OF_DATE_KHR => {
                FrameError::SwapChainLost("swap chain out of date".to_string())
            }
            vk::Result::ERROR_SURFACE_LOST_KHR => {
                FrameError::SwapChainLost("surface lost".to_string())
            }
            other => FrameError::Vulkan(other),
        }
    }
}

pub type FrameResult<T> = std::result::Result<T, FrameError>;
