// Command buffers
//
// A CommandBuffer bundles one primary command buffer with its own fence and
// semaphore, bound to one logical queue. Lifecycle per use:
//   begin(wait) -> record -> end(signal) [submits] -> fence_wait()

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::sync::{create_fence, create_semaphore};
use super::VulkanDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics = 0,
    Compute = 1,
    Transfer = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    /// Ready to begin
    Initial,
    Recording,
    /// Submitted, fence not yet waited on
    Pending,
}

impl RecordingState {
    pub fn begin(self) -> Result<Self> {
        match self {
            Self::Initial => Ok(Self::Recording),
            Self::Recording => anyhow::bail!("Command buffer is already recording"),
            Self::Pending => anyhow::bail!("Command buffer is still pending, wait on its fence first"),
        }
    }

    pub fn end(self) -> Result<Self> {
        match self {
            Self::Recording => Ok(Self::Pending),
            other => anyhow::bail!("Command buffer ended while {:?}", other),
        }
    }

    pub fn wait(self) -> Result<Self> {
        match self {
            Self::Pending => Ok(Self::Initial),
            other => anyhow::bail!("Fence wait on a command buffer that was not submitted ({:?})", other),
        }
    }
}

pub struct CommandBuffer {
    pub buffer: vk::CommandBuffer,
    pub fence: vk::Fence,
    /// Signaled by `end(true)`
    pub semaphore: vk::Semaphore,
    pub kind: QueueKind,
    wait_semaphore: Option<vk::Semaphore>,
    state: RecordingState,
    device: Arc<VulkanDevice>,
}

impl CommandBuffer {
    pub fn new(device: Arc<VulkanDevice>, kind: QueueKind) -> Result<Self> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(device.command_pool(kind))
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffer = unsafe { device.device.allocate_command_buffers(&alloc_info) }
            .with_context(|| format!("Failed to allocate {:?} command buffer", kind))?[0];

        let fence = create_fence(&device, false)?;
        let semaphore = create_semaphore(&device)?;

        Ok(Self {
            buffer,
            fence,
            semaphore,
            kind,
            wait_semaphore: None,
            state: RecordingState::Initial,
            device,
        })
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    /// Opens recording. `wait` is waited on by the submission in `end`.
    pub fn begin(&mut self, wait: Option<vk::Semaphore>) -> Result<()> {
        let next = self.state.begin()?;

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .device
                .begin_command_buffer(self.buffer, &begin_info)
                .context("Failed to begin command buffer")?;
        }

        self.wait_semaphore = wait;
        self.state = next;
        Ok(())
    }

    /// Closes recording and submits to the bound queue
    pub fn end(&mut self, signal: bool) -> Result<()> {
        let next = self.state.end()?;

        let wait_semaphores: Vec<vk::Semaphore> = self.wait_semaphore.into_iter().collect();
        let wait_stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; wait_semaphores.len()];
        let signal_semaphores: Vec<vk::Semaphore> =
            signal.then_some(self.semaphore).into_iter().collect();
        let command_buffers = [self.buffer];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device
                .device
                .end_command_buffer(self.buffer)
                .context("Failed to end command buffer")?;
            self.device
                .device
                .queue_submit(
                    self.device.queue(self.kind),
                    &[submit_info.build()],
                    self.fence,
                )
                .with_context(|| format!("Failed to submit to {:?} queue", self.kind))?;
        }

        self.state = next;
        Ok(())
    }

    /// Blocks until the submission finished, then resets fence and buffer
    pub fn fence_wait(&mut self) -> Result<()> {
        let next = self.state.wait()?;

        unsafe {
            self.device
                .device
                .wait_for_fences(&[self.fence], true, u64::MAX)
                .context("Failed to wait for command buffer fence")?;
            self.device.device.reset_fences(&[self.fence])?;
            self.device
                .device
                .reset_command_buffer(self.buffer, vk::CommandBufferResetFlags::empty())?;
        }

        self.wait_semaphore = None;
        self.state = next;
        Ok(())
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        unsafe {
            if self.state == RecordingState::Pending {
                let _ = self
                    .device
                    .device
                    .wait_for_fences(&[self.fence], true, u64::MAX);
            }
            self.device
                .device
                .free_command_buffers(self.device.command_pool(self.kind), &[self.buffer]);
            self.device.device.destroy_fence(self.fence, None);
            self.device.device.destroy_semaphore(self.semaphore, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_cycle_returns_to_initial() {
        let state = RecordingState::Initial
            .begin()
            .and_then(RecordingState::end)
            .and_then(RecordingState::wait)
            .unwrap();

        assert_eq!(state, RecordingState::Initial);
    }

    #[test]
    fn begin_twice_is_rejected() {
        let recording = RecordingState::Initial.begin().unwrap();
        assert!(recording.begin().is_err());
    }

    #[test]
    fn end_without_begin_is_rejected() {
        assert!(RecordingState::Initial.end().is_err());
    }

    #[test]
    fn wait_without_submit_is_rejected() {
        assert!(RecordingState::Initial.wait().is_err());
        assert!(RecordingState::Recording.wait().is_err());
    }

    #[test]
    fn begin_while_pending_is_rejected() {
        assert!(RecordingState::Pending.begin().is_err());
    }

    #[test]
    fn queue_kinds_index_pools() {
        assert_eq!(QueueKind::Graphics as usize, 0);
        assert_eq!(QueueKind::Transfer as usize, 2);
    }
}
