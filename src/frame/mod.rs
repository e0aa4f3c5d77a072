// Frame pipeline core
//
// record -> submit -> present -> reclaim, driven from a single CPU thread.
// The fence is the only thing that crosses over to the GPU timeline.
//
// ┌─────────────────────────────────────────────────────────────────┐
// │  FrameSynchronizer                                              │
// │    ├── FrameFence          (CPU/GPU counter)                    │
// │    ├── CommandRecorder     (allocator + list, barrier bracket)  │
// │    └── PresentationCycle   (swap chain, current back buffer)    │
// └─────────────────────────────────────────────────────────────────┘

pub mod fence;
pub mod presentation;
pub mod recorder;
pub mod synchronizer;

pub use fence::FrameFence;
pub use presentation::PresentationCycle;
pub use recorder::{CommandRecorder, DrawCall, FrameContext};
pub use synchronizer::{DrainPolicy, FrameReport, FrameSettings, FrameState, FrameSynchronizer};
