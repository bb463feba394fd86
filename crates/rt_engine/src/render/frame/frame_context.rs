//! Per-frame command recording resources
//!
//! One [`FrameContext`] exists per back buffer. It owns one command list
//! (with its allocator) for every [`CommandPass`] and remembers the fence
//! value signaled when the frame was last submitted. A list may only be reset
//! once that value has completed, which the frame pacer guarantees before it
//! hands the context out again.

use crate::render::api::{CommandList, GraphicsDevice, GraphicsError, GraphicsResult, PipelineHandle};

/// Logical passes recorded every frame, in submission order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandPass {
    /// Ray dispatch into the intermediate render target
    Scene = 0,
    /// Scale the intermediate target onto the back buffer
    Post = 1,
}

impl CommandPass {
    /// Number of passes
    pub const COUNT: usize = 2;

    /// All passes in submission order
    pub const ALL: [Self; Self::COUNT] = [Self::Scene, Self::Post];

    /// Position in the per-frame list array
    pub const fn index(self) -> usize {
        self as usize
    }

    const fn label(self) -> &'static str {
        match self {
            Self::Scene => "Scene",
            Self::Post => "Post",
        }
    }
}

/// Recording state of one pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassState {
    /// Closed; may be submitted or reset
    Closed,
    /// Between reset and close
    Recording,
}

/// Command lists and fence bookkeeping of one in-flight frame
pub struct FrameContext {
    frame_index: u32,
    command_lists: Vec<Box<dyn CommandList>>,
    fence_value: u64,
}

impl FrameContext {
    /// Create one closed command list per pass
    pub fn new(device: &dyn GraphicsDevice, frame_index: u32) -> GraphicsResult<Self> {
        let mut command_lists = Vec::with_capacity(CommandPass::COUNT);
        for pass in CommandPass::ALL {
            let mut list = device.create_command_list(&format!("Frame{} {}", frame_index, pass.label()))?;
            list.close()?;
            command_lists.push(list);
        }

        log::debug!("Created frame context {} with {} command lists", frame_index, command_lists.len());
        Ok(Self { frame_index, command_lists, fence_value: 0 })
    }

    /// Back buffer index this context belongs to
    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    /// Reclaim the allocator of `pass` and start recording
    ///
    /// Only valid once the GPU finished the previous use of this frame.
    pub fn reset_command_list(
        &mut self,
        pass: CommandPass,
        initial_pipeline: Option<PipelineHandle>,
    ) -> GraphicsResult<&mut dyn CommandList> {
        let list = &mut self.command_lists[pass.index()];
        if list.is_recording() {
            return Err(GraphicsError::invalid(format!("{} is already recording", list.name())));
        }
        list.reset(initial_pipeline)?;
        Ok(list.as_mut())
    }

    /// Finish recording `pass`
    pub fn close(&mut self, pass: CommandPass) -> GraphicsResult<()> {
        let list = &mut self.command_lists[pass.index()];
        if !list.is_recording() {
            return Err(GraphicsError::invalid(format!("{} is not recording", list.name())));
        }
        list.close()
    }

    /// Command list of `pass`
    pub fn command_list(&self, pass: CommandPass) -> &dyn CommandList {
        self.command_lists[pass.index()].as_ref()
    }

    /// Mutable command list of `pass`
    pub fn command_list_mut(&mut self, pass: CommandPass) -> &mut dyn CommandList {
        self.command_lists[pass.index()].as_mut()
    }

    /// Recording state of `pass`
    pub fn pass_state(&self, pass: CommandPass) -> PassState {
        if self.command_lists[pass.index()].is_recording() {
            PassState::Recording
        } else {
            PassState::Closed
        }
    }

    /// All lists in pass order, ready for one submission batch
    ///
    /// Fails if any pass is still recording.
    pub fn submission_batch(&self) -> GraphicsResult<Vec<&dyn CommandList>> {
        if let Some(open) = self.command_lists.iter().find(|list| list.is_recording()) {
            return Err(GraphicsError::invalid(format!("cannot submit {} while it is recording", open.name())));
        }
        Ok(self.command_lists.iter().map(|list| list.as_ref()).collect())
    }

    /// Fence value signaled by the last submission of this frame
    pub fn fence_value(&self) -> u64 {
        self.fence_value
    }

    /// Record the fence value of this frame's latest submission
    pub fn set_fence_value(&mut self, value: u64) {
        self.fence_value = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::headless::HeadlessBackend;
    use crate::render::tests::headless_device;

    #[test]
    fn test_lists_start_closed() {
        let (_backend, device) = headless_device(HeadlessBackend::default());
        let frame = FrameContext::new(device.as_ref(), 1).unwrap();
        assert_eq!(frame.frame_index(), 1);
        for pass in CommandPass::ALL {
            assert_eq!(frame.pass_state(pass), PassState::Closed);
        }
        assert_eq!(frame.submission_batch().unwrap().len(), CommandPass::COUNT);
    }

    /// Closed -> Recording -> Closed, with submission refused in between
    #[test]
    fn test_pass_state_machine() {
        let (_backend, device) = headless_device(HeadlessBackend::default());
        let mut frame = FrameContext::new(device.as_ref(), 0).unwrap();

        frame.reset_command_list(CommandPass::Scene, None).unwrap();
        assert_eq!(frame.pass_state(CommandPass::Scene), PassState::Recording);
        assert!(frame.submission_batch().is_err());
        assert!(frame.reset_command_list(CommandPass::Scene, None).is_err());

        frame.close(CommandPass::Scene).unwrap();
        assert_eq!(frame.pass_state(CommandPass::Scene), PassState::Closed);
        assert!(frame.close(CommandPass::Scene).is_err());

        let batch = frame.submission_batch().unwrap();
        assert_eq!(batch[0].name(), "Frame0 Scene");
        assert_eq!(batch[1].name(), "Frame0 Post");
    }
}
