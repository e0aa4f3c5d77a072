// Synchronization primitives
//
// The frame fence is a timeline semaphore: one monotonically increasing
// counter that the queue writes and the CPU reads or waits on.

use ash::vk;
use std::sync::Arc;
use std::time::Duration;

use super::{GpuFence, VulkanDevice};
use crate::error::FrameResult;

pub struct TimelineFence {
    pub semaphore: vk::Semaphore,
    device: Arc<VulkanDevice>,
}

impl TimelineFence {
    pub fn new(device: Arc<VulkanDevice>, initial_value: u64) -> FrameResult<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let create_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);

        let semaphore = unsafe { device.device.create_semaphore(&create_info, None) }?;
        Ok(Self { semaphore, device })
    }
}

impl GpuFence for TimelineFence {
    fn completed_value(&self) -> FrameResult<u64> {
        let value = unsafe { self.device.device.get_semaphore_counter_value(self.semaphore) }?;
        Ok(value)
    }

    fn wait(&self, value: u64, timeout: Duration) -> FrameResult<bool> {
        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);

        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.device.device.wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for TimelineFence {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_semaphore(self.semaphore, None);
        }
    }
}

/// Binary semaphores, one per swap chain image, that gate presentation on
/// the rendering submitted before it.
pub struct PresentSemaphores {
    semaphores: Vec<vk::Semaphore>,
    device: Arc<VulkanDevice>,
}

impl PresentSemaphores {
    pub fn new(device: Arc<VulkanDevice>, count: usize) -> FrameResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::builder();
        let mut semaphores = Vec::with_capacity(count);
        for _ in 0..count {
            // Pushed one by one so a failure still destroys the earlier ones
            let semaphore = unsafe { device.device.create_semaphore(&create_info, None) };
            match semaphore {
                Ok(semaphore) => semaphores.push(semaphore),
                Err(e) => {
                    drop(Self { semaphores, device });
                    return Err(e.into());
                }
            }
        }
        Ok(Self { semaphores, device })
    }

    pub fn get(&self, image_index: usize) -> vk::Semaphore {
        self.semaphores[image_index]
    }
}

impl Drop for PresentSemaphores {
    fn drop(&mut self) {
        unsafe {
            for &semaphore in &self.semaphores {
                self.device.device.destroy_semaphore(semaphore, None);
            }
        }
    }
}

/// Binary fence used to wait for image acquisition on the CPU.
pub struct AcquireFence {
    pub fence: vk::Fence,
    device: Arc<VulkanDevice>,
}

impl AcquireFence {
    pub fn new(device: Arc<VulkanDevice>) -> FrameResult<Self> {
        let fence_info = vk::FenceCreateInfo::builder();
        let fence = unsafe { device.device.create_fence(&fence_info, None) }?;
        Ok(Self { fence, device })
    }

    /// Block until the acquire completes, then rearm the fence.
    pub fn wait_and_reset(&self, timeout: Duration) -> FrameResult<()> {
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        unsafe {
            self.device
                .device
                .wait_for_fences(&[self.fence], true, timeout_ns)?;
            self.device.device.reset_fences(&[self.fence])?;
        }
        Ok(())
    }
}

impl Drop for AcquireFence {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_fence(self.fence, None);
        }
    }
}
