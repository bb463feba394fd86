//! Per-frame command contexts, fences and frame pacing

pub mod frame_context;
pub mod sync_fence;

pub use frame_context::{CommandPass, FrameContext, PassState};
pub use sync_fence::{FramePacer, SyncFence};
