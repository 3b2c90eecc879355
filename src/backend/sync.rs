// Synchronization primitives
//
// Fences and semaphores for GPU-CPU and GPU-GPU sync. Image acquisition uses a
// single persistent fence: acquire, wait, reset, every frame.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::swapchain::Swapchain;
use super::VulkanDevice;

pub fn create_fence(device: &VulkanDevice, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };
    let fence_info = vk::FenceCreateInfo::builder().flags(flags);

    unsafe { device.device.create_fence(&fence_info, None) }.context("Failed to create fence")
}

pub fn create_semaphore(device: &VulkanDevice) -> Result<vk::Semaphore> {
    let semaphore_info = vk::SemaphoreCreateInfo::builder();

    unsafe { device.device.create_semaphore(&semaphore_info, None) }
        .context("Failed to create semaphore")
}

pub struct AcquireFence {
    fence: vk::Fence,
    device: Arc<VulkanDevice>,
}

impl AcquireFence {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        Ok(Self {
            fence: create_fence(&device, false)?,
            device,
        })
    }

    /// Acquires the next swapchain image and blocks until it is usable
    pub fn acquire(&self, swapchain: &Swapchain) -> Result<u32> {
        let (index, suboptimal) =
            swapchain.acquire_next_image(u64::MAX, vk::Semaphore::null(), self.fence)?;
        if suboptimal {
            log::debug!("Swapchain is suboptimal for the surface");
        }

        unsafe {
            self.device
                .device
                .wait_for_fences(&[self.fence], true, u64::MAX)
                .context("Failed to wait for image acquisition")?;
            self.device.device.reset_fences(&[self.fence])?;
        }

        Ok(index)
    }
}

impl Drop for AcquireFence {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_fence(self.fence, None) };
    }
}
