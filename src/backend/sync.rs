// Synchronization primitives
//
// One fence per swapchain image (host waits before reusing that image's
// command buffer) and two semaphores shared by every frame.

use super::DeviceContext;
use crate::error::{Error, Result};
use ash::vk;

pub struct FrameSync {
    /// Signaled by the acquire, waited on by the submit.
    pub present_acquired: vk::Semaphore,
    /// Signaled by the submit, waited on by the present.
    pub render_completed: vk::Semaphore,
    /// Indexed by swapchain image. Created signaled.
    pub fences: Vec<vk::Fence>,
}

impl FrameSync {
    pub fn new(device: &DeviceContext, image_count: usize) -> Result<Self> {
        let mut sync = Self {
            present_acquired: vk::Semaphore::null(),
            render_completed: vk::Semaphore::null(),
            fences: Vec::with_capacity(image_count),
        };

        match sync.build(&device.device, image_count) {
            Ok(()) => Ok(sync),
            Err(e) => {
                unsafe { sync.destroy(&device.device) };
                Err(e)
            }
        }
    }

    fn build(&mut self, device: &ash::Device, image_count: usize) -> Result<()> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED); // Start signaled

        unsafe {
            self.present_acquired = device
                .create_semaphore(&semaphore_info, None)
                .map_err(Error::vk("vkCreateSemaphore"))?;
            self.render_completed = device
                .create_semaphore(&semaphore_info, None)
                .map_err(Error::vk("vkCreateSemaphore"))?;

            for _ in 0..image_count {
                let fence = device
                    .create_fence(&fence_info, None)
                    .map_err(Error::vk("vkCreateFence"))?;
                self.fences.push(fence);
            }
        }
        Ok(())
    }

    /// Release the fences, then the semaphores.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for fence in self.fences.drain(..) {
            device.destroy_fence(fence, None);
        }
        device.destroy_semaphore(std::mem::replace(&mut self.present_acquired, vk::Semaphore::null()), None);
        device.destroy_semaphore(std::mem::replace(&mut self.render_completed, vk::Semaphore::null()), None);
    }
}
