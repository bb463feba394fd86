//! Fence-based GPU/CPU synchronization and frame pacing
//!
//! [`SyncFence`] wraps one monotonic GPU timeline. The CPU enqueues signals
//! of increasing values and may only block on values it has enqueued itself.
//!
//! [`FramePacer`] owns the fence and the per-frame [`FrameContext`]s and
//! implements the move-to-next-frame protocol that bounds how far the CPU
//! may run ahead of the GPU:
//!
//! ```text
//! present frame K:  signal(v)          frame[K].fence = v
//!                   K' = swapchain index
//!                   wait(frame[K'].fence)
//! ```
//!
//! With N frame contexts the CPU blocks before it could reuse a context whose
//! previous submission is still executing, so at most N frames are queued.

use crate::render::api::{CommandQueue, GpuFence, GraphicsDevice, GraphicsError, GraphicsResult};

use super::frame_context::FrameContext;

/// Monotonic fence with a CPU-side target value
pub struct SyncFence {
    fence: Box<dyn GpuFence>,
    target: u64,
    last_signaled: u64,
}

impl SyncFence {
    /// Create the fence at `initial_value`; the first signal uses `initial_value + 1`
    pub fn new(device: &dyn GraphicsDevice, initial_value: u64) -> GraphicsResult<Self> {
        let fence = device.create_fence(initial_value)?;
        log::debug!("Created fence at value {}", initial_value);
        Ok(Self { fence, target: initial_value + 1, last_signaled: initial_value })
    }

    /// Value the next signal will use
    pub fn target(&self) -> u64 {
        self.target
    }

    /// Highest value enqueued so far
    pub fn last_signaled(&self) -> u64 {
        self.last_signaled
    }

    /// Highest value the GPU has reached
    pub fn completed_value(&self) -> u64 {
        self.fence.completed_value()
    }

    /// The backend fence
    pub fn raw(&self) -> &dyn GpuFence {
        self.fence.as_ref()
    }

    /// Enqueue a signal of the current target and advance it
    ///
    /// Returns the signaled value, which is what the CPU waits on to know
    /// the work submitted so far has finished.
    pub fn signal_and_advance(&mut self, queue: &dyn CommandQueue) -> GraphicsResult<u64> {
        let value = self.target;
        queue.signal(self.fence.as_ref(), value)?;
        self.last_signaled = value;
        self.target += 1;
        Ok(value)
    }

    /// Block until the GPU reaches `value`
    ///
    /// Returns immediately when it already has. There is no timeout: a hung
    /// GPU blocks the calling thread indefinitely.
    pub fn block_until(&self, value: u64) -> GraphicsResult<()> {
        if value > self.last_signaled {
            return Err(GraphicsError::invalid(format!(
                "waiting on fence value {} which was never signaled (last {})",
                value, self.last_signaled
            )));
        }
        if self.fence.completed_value() < value {
            self.fence.wait_for_value(value)?;
        }
        Ok(())
    }

    /// Signal and wait until all work enqueued so far has completed
    pub fn drain_all(&mut self, queue: &dyn CommandQueue) -> GraphicsResult<()> {
        let value = self.signal_and_advance(queue)?;
        self.block_until(value)
    }
}

/// Frame contexts plus the fence gating their reuse
pub struct FramePacer {
    fence: SyncFence,
    frames: Vec<FrameContext>,
    current: usize,
}

impl FramePacer {
    /// Create `frame_count` contexts and a fresh fence, starting at frame `start_index`
    pub fn new(device: &dyn GraphicsDevice, frame_count: u32, start_index: u32) -> GraphicsResult<Self> {
        let frames = (0..frame_count)
            .map(|index| FrameContext::new(device, index))
            .collect::<GraphicsResult<Vec<_>>>()?;
        let fence = SyncFence::new(device, 0)?;
        let current = start_index as usize % frames.len().max(1);

        Ok(Self { fence, frames, current })
    }

    /// Index of the frame being recorded
    pub fn current_index(&self) -> usize {
        self.current
    }

    /// Number of frame contexts
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// The frame being recorded
    pub fn current_frame(&self) -> &FrameContext {
        &self.frames[self.current]
    }

    /// The frame being recorded, mutably
    pub fn current_frame_mut(&mut self) -> &mut FrameContext {
        &mut self.frames[self.current]
    }

    /// Frame context `index`
    pub fn frame(&self, index: usize) -> Option<&FrameContext> {
        self.frames.get(index)
    }

    /// Fence value frame `index` was last submitted with
    pub fn frame_fence_value(&self, index: usize) -> Option<u64> {
        self.frames.get(index).map(FrameContext::fence_value)
    }

    /// The fence
    pub fn fence(&self) -> &SyncFence {
        &self.fence
    }

    /// Frames enqueued but not yet completed by the GPU
    pub fn frames_in_flight(&self) -> u64 {
        self.fence.last_signaled().saturating_sub(self.fence.completed_value())
    }

    /// Finish the current frame and wait until frame `next_index` may be reused
    pub fn move_to_next_frame(&mut self, queue: &dyn CommandQueue, next_index: u32) -> GraphicsResult<()> {
        let submitted = self.fence.signal_and_advance(queue)?;
        self.frames[self.current].set_fence_value(submitted);

        let next = next_index as usize;
        if next >= self.frames.len() {
            return Err(GraphicsError::OutOfRange {
                reason: format!("frame index {} with {} frame contexts", next, self.frames.len()),
            });
        }
        self.current = next;

        let wait_value = self.frames[next].fence_value();
        self.fence.block_until(wait_value)
    }

    /// Wait for the GPU to go idle ("WaitForGpu")
    pub fn wait_for_gpu(&mut self, queue: &dyn CommandQueue) -> GraphicsResult<()> {
        self.fence.drain_all(queue)?;
        let value = self.fence.last_signaled();
        self.frames[self.current].set_fence_value(value);
        Ok(())
    }

    /// After a drain, mark every frame as complete up to the last signal
    pub fn sync_all_frames(&mut self) {
        let value = self.fence.last_signaled();
        for frame in &mut self.frames {
            frame.set_fence_value(value);
        }
    }

    /// Switch to `index` without signaling (after swapchain recreation)
    pub fn set_current_index(&mut self, index: u32) {
        self.current = index as usize % self.frames.len().max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::headless::{HeadlessBackend, HeadlessConfig};
    use crate::render::tests::headless_device;
    use std::time::Duration;

    #[test]
    fn test_signal_and_advance() {
        let (_backend, device) = headless_device(HeadlessBackend::default());
        let queue = device.create_command_queue().unwrap();
        let mut fence = SyncFence::new(device.as_ref(), 0).unwrap();

        assert_eq!(fence.target(), 1);
        assert_eq!(fence.signal_and_advance(queue.as_ref()).unwrap(), 1);
        assert_eq!(fence.signal_and_advance(queue.as_ref()).unwrap(), 2);
        assert_eq!(fence.target(), 3);
        fence.block_until(2).unwrap();
        assert!(fence.completed_value() >= 2);
    }

    /// The CPU may not wait on a value it never enqueued
    #[test]
    fn test_block_on_unsignaled_value_fails() {
        let (_backend, device) = headless_device(HeadlessBackend::default());
        let fence = SyncFence::new(device.as_ref(), 0).unwrap();
        assert!(fence.block_until(0).is_ok());
        assert!(matches!(fence.block_until(1), Err(GraphicsError::InvalidOperation { .. })));
    }

    /// block_until(v) returns only once the GPU reports completed >= v
    #[test]
    fn test_fence_monotonicity() {
        let backend = HeadlessBackend::new(HeadlessConfig {
            gpu_latency: Duration::from_millis(2),
            ..HeadlessConfig::default()
        });
        let (_backend, device) = headless_device(backend);
        let queue = device.create_command_queue().unwrap();
        let mut fence = SyncFence::new(device.as_ref(), 0).unwrap();

        let mut previous = 0;
        for _ in 0..10 {
            let mut list = device.create_command_list("work").unwrap();
            list.close().unwrap();
            queue.execute_command_lists(&[list.as_ref()]).unwrap();

            let value = fence.signal_and_advance(queue.as_ref()).unwrap();
            assert!(value > previous);
            fence.block_until(value).unwrap();
            let completed = fence.completed_value();
            assert!(completed >= value, "returned at {completed} before reaching {value}");
            previous = value;
        }
    }

    #[test]
    fn test_drain_all_idles_queue() {
        let backend = HeadlessBackend::new(HeadlessConfig {
            gpu_latency: Duration::from_millis(1),
            ..HeadlessConfig::default()
        });
        let (_backend, device) = headless_device(backend);
        let queue = device.create_command_queue().unwrap();
        let mut fence = SyncFence::new(device.as_ref(), 0).unwrap();

        for _ in 0..3 {
            fence.signal_and_advance(queue.as_ref()).unwrap();
        }
        fence.drain_all(queue.as_ref()).unwrap();
        assert_eq!(fence.completed_value(), fence.last_signaled());
    }

    #[test]
    fn test_move_to_next_frame_records_values() {
        let (_backend, device) = headless_device(HeadlessBackend::default());
        let queue = device.create_command_queue().unwrap();
        let mut pacer = FramePacer::new(device.as_ref(), 2, 0).unwrap();

        pacer.move_to_next_frame(queue.as_ref(), 1).unwrap();
        assert_eq!(pacer.current_index(), 1);
        assert_eq!(pacer.frame(0).unwrap().fence_value(), 1);

        pacer.move_to_next_frame(queue.as_ref(), 0).unwrap();
        assert_eq!(pacer.frame_fence_value(1), Some(2));
        assert_eq!(pacer.frame_fence_value(2), None);
        assert!(pacer.fence().completed_value() >= 1);

        assert!(pacer.move_to_next_frame(queue.as_ref(), 5).is_err());
    }
}
