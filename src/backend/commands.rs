// Command pool + one primary command buffer per swapchain image

use super::DeviceContext;
use crate::error::{Error, Result};
use ash::vk;

pub struct CommandStream {
    pub pool: vk::CommandPool,
    /// Indexed by swapchain image, like the framebuffers and fences.
    pub buffers: Vec<vk::CommandBuffer>,
}

impl CommandStream {
    pub fn new(device: &DeviceContext, count: usize) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(device.graphics_queue_family)
            // Each buffer is re-recorded whenever its image comes around again
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .map_err(Error::vk("vkCreateCommandPool"))?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count as u32);

        let buffers = match unsafe { device.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers,
            Err(result) => {
                unsafe { device.device.destroy_command_pool(pool, None) };
                return Err(Error::vk("vkAllocateCommandBuffers")(result));
            }
        };

        log::debug!("Allocated {} command buffers", buffers.len());
        Ok(Self { pool, buffers })
    }

    /// # Safety
    /// None of the buffers may be pending execution.
    pub unsafe fn free_buffers(&mut self, device: &ash::Device) {
        if !self.buffers.is_empty() {
            device.free_command_buffers(self.pool, &self.buffers);
            self.buffers.clear();
        }
    }

    /// # Safety
    /// Buffers must be freed (or not pending) first.
    pub unsafe fn destroy_pool(&mut self, device: &ash::Device) {
        let pool = std::mem::replace(&mut self.pool, vk::CommandPool::null());
        device.destroy_command_pool(pool, None);
    }
}
