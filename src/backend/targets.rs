// Per-image render targets
//
// Color views over the swapchain images, one shared depth buffer, the render
// pass describing both attachments, and one framebuffer per image.

use super::{DeviceContext, PresentationSurface};
use crate::error::{Error, Result};
use ash::vk;

pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

pub struct DepthBuffer {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
}

pub struct FrameTargets {
    pub color_views: Vec<vk::ImageView>,
    pub depth: DepthBuffer,
    pub render_pass: vk::RenderPass,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub extent: vk::Extent2D,
}

impl FrameTargets {
    pub fn new(device: &DeviceContext, surface: &PresentationSurface) -> Result<Self> {
        // Start empty so a failure halfway can release what exists.
        let mut targets = Self {
            color_views: Vec::with_capacity(surface.image_count()),
            depth: DepthBuffer {
                image: vk::Image::null(),
                memory: vk::DeviceMemory::null(),
                view: vk::ImageView::null(),
            },
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::with_capacity(surface.image_count()),
            extent: surface.extent,
        };

        match targets.build(device, surface) {
            Ok(()) => {
                log::debug!(
                    "Created {} color views, {} framebuffers, depth {}x{}",
                    targets.color_views.len(),
                    targets.framebuffers.len(),
                    targets.extent.width,
                    targets.extent.height
                );
                Ok(targets)
            }
            Err(e) => {
                unsafe { targets.destroy(&device.device) };
                Err(e)
            }
        }
    }

    fn build(&mut self, device: &DeviceContext, surface: &PresentationSurface) -> Result<()> {
        for &image in &surface.images {
            let view = create_image_view(
                &device.device,
                image,
                surface.format.format,
                vk::ImageAspectFlags::COLOR,
            )?;
            self.color_views.push(view);
        }

        self.create_depth_buffer(device)?;
        self.render_pass = create_render_pass(&device.device, surface.format.format)?;

        for &color_view in &self.color_views {
            let attachments = [color_view, self.depth.view];
            let framebuffer_info = vk::FramebufferCreateInfo::default()
                .render_pass(self.render_pass)
                .attachments(&attachments)
                .width(self.extent.width)
                .height(self.extent.height)
                .layers(1);

            let framebuffer = unsafe { device.device.create_framebuffer(&framebuffer_info, None) }
                .map_err(Error::vk("vkCreateFramebuffer"))?;
            self.framebuffers.push(framebuffer);
        }

        Ok(())
    }

    fn create_depth_buffer(&mut self, device: &DeviceContext) -> Result<()> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: self.extent.width,
                height: self.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(DEPTH_FORMAT)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        self.depth.image = unsafe { device.device.create_image(&image_info, None) }
            .map_err(Error::vk("vkCreateImage"))?;

        let requirements = unsafe { device.device.get_image_memory_requirements(self.depth.image) };
        let required = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        let memory_type_index =
            find_memory_type(&device.memory_properties, requirements.memory_type_bits, required)
                .ok_or(Error::NoSuitableMemoryType {
                    type_bits: requirements.memory_type_bits,
                    required,
                })?;

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        self.depth.memory = unsafe { device.device.allocate_memory(&alloc_info, None) }
            .map_err(Error::vk("vkAllocateMemory"))?;

        unsafe { device.device.bind_image_memory(self.depth.image, self.depth.memory, 0) }
            .map_err(Error::vk("vkBindImageMemory"))?;

        self.depth.view = create_image_view(
            &device.device,
            self.depth.image,
            DEPTH_FORMAT,
            vk::ImageAspectFlags::DEPTH,
        )?;

        Ok(())
    }

    /// Release render pass, framebuffers, depth buffer and color views, in that order.
    ///
    /// # Safety
    /// No submitted work may still reference these objects.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        let render_pass = std::mem::replace(&mut self.render_pass, vk::RenderPass::null());
        device.destroy_render_pass(render_pass, None);

        for framebuffer in self.framebuffers.drain(..) {
            device.destroy_framebuffer(framebuffer, None);
        }

        let depth = std::mem::replace(
            &mut self.depth,
            DepthBuffer {
                image: vk::Image::null(),
                memory: vk::DeviceMemory::null(),
                view: vk::ImageView::null(),
            },
        );
        device.free_memory(depth.memory, None);
        device.destroy_image(depth.image, None);
        device.destroy_image_view(depth.view, None);

        for view in self.color_views.drain(..) {
            device.destroy_image_view(view, None);
        }
    }
}

/// First memory type allowed by `type_bits` whose flags include `required`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    memory_properties.memory_types[..memory_properties.memory_type_count as usize]
        .iter()
        .enumerate()
        .find(|(i, memory_type)| {
            (type_bits & (1 << i)) != 0 && memory_type.property_flags.contains(required)
        })
        .map(|(i, _)| i as u32)
}

fn create_image_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
    aspect_mask: vk::ImageAspectFlags,
) -> Result<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    unsafe { device.create_image_view(&create_info, None) }.map_err(Error::vk("vkCreateImageView"))
}

/// Render pass with a presentable color attachment and a depth attachment.
fn create_render_pass(device: &ash::Device, color_format: vk::Format) -> Result<vk::RenderPass> {
    let color_attachment = vk::AttachmentDescription::default()
        .format(color_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);

    let depth_attachment = vk::AttachmentDescription::default()
        .format(DEPTH_FORMAT)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

    let color_attachment_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let depth_attachment_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };

    let color_attachments = [color_attachment_ref];
    let subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_attachments)
        .depth_stencil_attachment(&depth_attachment_ref);

    // The swapchain image is only ours once the acquire semaphore signals at
    // COLOR_ATTACHMENT_OUTPUT; the depth buffer is shared by every image.
    let dependency = vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        )
        .src_access_mask(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
        .dst_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        );

    let attachments = [color_attachment, depth_attachment];
    let subpasses = [subpass];
    let dependencies = [dependency];

    let render_pass_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    unsafe { device.create_render_pass(&render_pass_info, None) }
        .map_err(Error::vk("vkCreateRenderPass"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_table(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: flags.len() as u32,
            ..Default::default()
        };
        for (slot, &property_flags) in props.memory_types.iter_mut().zip(flags) {
            slot.property_flags = property_flags;
        }
        props
    }

    #[test]
    fn finds_first_allowed_device_local_type() {
        let table = memory_table(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);
        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;

        assert_eq!(find_memory_type(&table, 0b111, local), Some(1));
        // Type 1 filtered out by the mask, type 2 is a superset.
        assert_eq!(find_memory_type(&table, 0b101, local), Some(2));
    }

    #[test]
    fn mask_without_device_local_type_is_none() {
        let table = memory_table(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);
        assert_eq!(
            find_memory_type(&table, 0b01, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            None
        );
        assert_eq!(find_memory_type(&table, 0, vk::MemoryPropertyFlags::DEVICE_LOCAL), None);
    }

    #[test]
    fn bits_past_type_count_are_ignored() {
        let table = memory_table(&[vk::MemoryPropertyFlags::HOST_VISIBLE]);
        assert_eq!(
            find_memory_type(&table, 0b10, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            None
        );
    }
}
