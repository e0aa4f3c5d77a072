// Graphics queue - in-order submission
//
// Submissions complete in the order they are made, so a signal submitted
// after a command list covers that list and everything before it.

use ash::vk;
use std::sync::Arc;

use super::command::VulkanCommandList;
use super::sync::TimelineFence;
use super::{CommandQueue, Vulkan, VulkanDevice};
use crate::error::FrameResult;

pub struct VulkanQueue {
    pub queue: vk::Queue,
    device: Arc<VulkanDevice>,
}

impl VulkanQueue {
    pub fn new(device: Arc<VulkanDevice>) -> Self {
        Self {
            queue: device.graphics_queue,
            device,
        }
    }

    /// Empty submission that signals a binary semaphore for presentation.
    pub fn signal_binary(&self, semaphore: vk::Semaphore) -> FrameResult<()> {
        let signal = [semaphore];
        let submit = vk::SubmitInfo::builder().signal_semaphores(&signal).build();
        unsafe {
            self.device
                .device
                .queue_submit(self.queue, &[submit], vk::Fence::null())?;
        }
        Ok(())
    }
}

impl CommandQueue<Vulkan> for VulkanQueue {
    fn execute(&self, list: &VulkanCommandList) -> FrameResult<()> {
        let buffers = [list.buffer];
        let submit = vk::SubmitInfo::builder().command_buffers(&buffers).build();
        unsafe {
            self.device
                .device
                .queue_submit(self.queue, &[submit], vk::Fence::null())?;
        }
        log::trace!("Submitted command buffer {:?}", list.buffer);
        Ok(())
    }

    fn signal(&self, fence: &TimelineFence, value: u64) -> FrameResult<()> {
        let semaphores = [fence.semaphore];
        let values = [value];
        let mut timeline = vk::TimelineSemaphoreSubmitInfo::builder().signal_semaphore_values(&values);
        let submit = vk::SubmitInfo::builder()
            .signal_semaphores(&semaphores)
            .push_next(&mut timeline)
            .build();
        unsafe {
            self.device
                .device
                .queue_submit(self.queue, &[submit], vk::Fence::null())?;
        }
        Ok(())
    }
}
