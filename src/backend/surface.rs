// Presentation surface + swapchain
//
// Binds the native window to the device and owns the chain of images we
// render to. Present mode is FIFO (vsync); the swapchain is created once.

use super::DeviceContext;
use crate::error::{Error, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

/// A window the session can present to.
pub trait NativeWindow: HasWindowHandle + HasDisplayHandle {
    /// Current drawable size in physical pixels.
    fn pixel_size(&self) -> vk::Extent2D;
}

impl NativeWindow for winit::window::Window {
    fn pixel_size(&self) -> vk::Extent2D {
        let size = self.inner_size();
        vk::Extent2D {
            width: size.width,
            height: size.height,
        }
    }
}

pub struct PresentationSurface {
    pub surface: vk::SurfaceKHR,
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: ash::khr::swapchain::Device,
    surface_loader: ash::khr::surface::Instance,
    pub images: Vec<vk::Image>,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
}

impl PresentationSurface {
    pub fn new<W: NativeWindow + ?Sized>(
        device: &DeviceContext,
        window: &W,
        preferred_format: vk::Format,
    ) -> Result<Self> {
        let display_handle = window.display_handle()?.as_raw();
        let window_handle = window.window_handle()?.as_raw();

        let surface = unsafe {
            ash_window::create_surface(
                device.entry(),
                &device.instance,
                display_handle,
                window_handle,
                None,
            )
        }
        .map_err(Error::vk("vkCreateSurfaceKHR"))?;

        let surface_loader = device.surface_loader.clone();
        match Self::create_swapchain(device, &surface_loader, surface, window.pixel_size(), preferred_format) {
            Ok((swapchain_loader, swapchain, images, format, extent)) => Ok(Self {
                surface,
                swapchain,
                swapchain_loader,
                surface_loader,
                images,
                format,
                extent,
            }),
            Err(e) => {
                unsafe { surface_loader.destroy_surface(surface, None) };
                Err(e)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn create_swapchain(
        device: &DeviceContext,
        surface_loader: &ash::khr::surface::Instance,
        surface: vk::SurfaceKHR,
        window_extent: vk::Extent2D,
        preferred_format: vk::Format,
    ) -> Result<(
        ash::khr::swapchain::Device,
        vk::SwapchainKHR,
        Vec<vk::Image>,
        vk::SurfaceFormatKHR,
        vk::Extent2D,
    )> {
        // Verify the graphics family can present to this surface
        let supported = unsafe {
            surface_loader.get_physical_device_surface_support(
                device.physical_device,
                device.graphics_queue_family,
                surface,
            )
        }
        .map_err(Error::vk("vkGetPhysicalDeviceSurfaceSupportKHR"))?;
        if !supported {
            return Err(Error::PresentUnsupported);
        }

        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(device.physical_device, surface)
        }
        .map_err(Error::vk("vkGetPhysicalDeviceSurfaceFormatsKHR"))?;
        let format = select_surface_format(&formats, preferred_format)?;

        let caps = unsafe {
            surface_loader.get_physical_device_surface_capabilities(device.physical_device, surface)
        }
        .map_err(Error::vk("vkGetPhysicalDeviceSurfaceCapabilitiesKHR"))?;

        let image_count = requested_image_count(&caps);
        let extent = swapchain_extent(&caps, window_extent);
        log::info!(
            "Creating swapchain: {}x{}, {:?}, {} images requested",
            extent.width,
            extent.height,
            format.format,
            image_count
        );

        let swapchain_loader = ash::khr::swapchain::Device::new(&device.instance, &device.device);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(vk::PresentModeKHR::FIFO)
            .clipped(true);

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .map_err(Error::vk("vkCreateSwapchainKHR"))?;

        let images = match unsafe { swapchain_loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(result) => {
                unsafe { swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(Error::vk("vkGetSwapchainImagesKHR")(result));
            }
        };

        log::info!("Created swapchain with {} images", images.len());

        Ok((swapchain_loader, swapchain, images, format, extent))
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Acquire next image for rendering, signaling `semaphore` once it is usable.
    ///
    /// Returns the image index and whether the swapchain is suboptimal.
    pub fn acquire_next_image(&self, timeout: u64, semaphore: vk::Semaphore) -> Result<(u32, bool)> {
        unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                timeout,
                semaphore,
                vk::Fence::null(),
            )
        }
        .map_err(Error::vk("vkAcquireNextImageKHR"))
    }

    /// Present rendered image to screen. Returns whether the swapchain is suboptimal.
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe { self.swapchain_loader.queue_present(queue, &present_info) }
            .map_err(Error::vk("vkQueuePresentKHR"))
    }

    /// # Safety
    /// No submitted work may still reference the swapchain images.
    pub unsafe fn destroy_swapchain(&mut self) {
        self.images.clear();
        let swapchain = std::mem::replace(&mut self.swapchain, vk::SwapchainKHR::null());
        if swapchain != vk::SwapchainKHR::null() {
            self.swapchain_loader.destroy_swapchain(swapchain, None);
        }
    }

    /// # Safety
    /// The swapchain must already be destroyed.
    pub unsafe fn destroy_surface(&mut self) {
        let surface = std::mem::replace(&mut self.surface, vk::SurfaceKHR::null());
        if surface != vk::SurfaceKHR::null() {
            self.surface_loader.destroy_surface(surface, None);
        }
    }
}

/// Number of images to ask the driver for: at least two.
pub fn requested_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    caps.min_image_count.max(2)
}

/// Swapchain extent: the surface's current extent, or the window size when
/// the surface leaves it to the swapchain (width == u32::MAX).
pub fn swapchain_extent(caps: &vk::SurfaceCapabilitiesKHR, window: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: window
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: window
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// Pick the surface format matching `preferred`.
pub fn select_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    preferred: vk::Format,
) -> Result<vk::SurfaceFormatKHR> {
    // A lone UNDEFINED entry means the surface takes any format.
    if let [only] = formats {
        if only.format == vk::Format::UNDEFINED {
            return Ok(vk::SurfaceFormatKHR {
                format: preferred,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            });
        }
    }

    formats
        .iter()
        .copied()
        .find(|f| f.format == preferred)
        .ok_or(Error::FormatUnavailable(preferred))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min_images: u32, current: vk::Extent2D) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min_images,
            max_image_count: 8,
            current_extent: current,
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D { width: 4096, height: 4096 },
            ..Default::default()
        }
    }

    const WINDOW: vk::Extent2D = vk::Extent2D { width: 1280, height: 720 };
    const UNCONSTRAINED: vk::Extent2D = vk::Extent2D { width: u32::MAX, height: u32::MAX };

    #[test]
    fn single_image_minimum_is_clamped_to_two() {
        assert_eq!(requested_image_count(&caps(1, WINDOW)), 2);
        assert_eq!(requested_image_count(&caps(0, WINDOW)), 2);
        assert_eq!(requested_image_count(&caps(3, WINDOW)), 3);
    }

    #[test]
    fn unconstrained_extent_uses_window_size() {
        assert_eq!(swapchain_extent(&caps(2, UNCONSTRAINED), WINDOW), WINDOW);
    }

    #[test]
    fn fixed_extent_wins_over_window_size() {
        let current = vk::Extent2D { width: 800, height: 600 };
        assert_eq!(swapchain_extent(&caps(2, current), WINDOW), current);
    }

    #[test]
    fn unconstrained_extent_stays_within_surface_limits() {
        let huge = vk::Extent2D { width: 10_000, height: 0 };
        assert_eq!(
            swapchain_extent(&caps(2, UNCONSTRAINED), huge),
            vk::Extent2D { width: 4096, height: 1 }
        );
    }

    #[test]
    fn preferred_format_is_selected() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        let chosen = select_surface_format(&formats, vk::Format::B8G8R8A8_UNORM).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn absent_format_is_reported() {
        let formats = [vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];
        let err = select_surface_format(&formats, vk::Format::R8G8B8A8_UNORM).unwrap_err();
        assert!(matches!(err, Error::FormatUnavailable(vk::Format::R8G8B8A8_UNORM)));
        assert!(select_surface_format(&[], vk::Format::R8G8B8A8_UNORM).is_err());
    }

    #[test]
    fn undefined_format_accepts_anything() {
        let formats = [vk::SurfaceFormatKHR {
            format: vk::Format::UNDEFINED,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];
        let chosen = select_surface_format(&formats, vk::Format::R8G8B8A8_SRGB).unwrap();
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_SRGB);
    }
}
