// GPU session - every Vulkan object the frame loop needs, in one place
//
// Creation order:  device → surface/swapchain → targets → commands → sync
// Teardown order:  command buffers → render pass → framebuffers → depth →
//                  color views → swapchain → fences → semaphores →
//                  command pool → surface → device → debug messenger → instance

use crate::backend::{
    CommandStream, DeviceContext, DeviceOptions, FrameSync, FrameTargets, NativeWindow,
    PresentationSurface,
};
use crate::error::{Error, Result};
use crate::frame::{FrameBackend, FrameRecording, FrameScheduler, RecordFrame};
use ash::vk;
use std::time::Duration;

/// Everything needed to open a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub application_label: String,
    pub preferred_format: vk::Format,
    pub clear_color: [f32; 4],
    /// Bound on acquire and fence waits. `None` blocks indefinitely.
    pub wait_timeout: Option<Duration>,
    pub device: DeviceOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            application_label: "vk-present".to_string(),
            preferred_format: vk::Format::B8G8R8A8_UNORM,
            clear_color: [0.1, 0.2, 0.8, 1.0],
            wait_timeout: None,
            device: DeviceOptions::default(),
        }
    }
}

/// Owner of all GPU objects for one window.
///
/// Only [`GpuSession::new`] creates one, and it either returns a complete
/// session or releases whatever it had built.
pub struct GpuSession {
    device: DeviceContext,
    surface: PresentationSurface,
    targets: FrameTargets,
    commands: CommandStream,
    sync: FrameSync,
    clear_values: [vk::ClearValue; 2],
    wait_stages: [vk::PipelineStageFlags; 1],
    suboptimal_reported: bool,
    released: bool,
}

impl GpuSession {
    pub fn new<W: NativeWindow + ?Sized>(window: &W, config: &SessionConfig) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        let display = window.display_handle()?.as_raw();
        let mut device = DeviceContext::new(&config.application_label, display, &config.device)?;

        let mut surface = match PresentationSurface::new(&device, window, config.preferred_format) {
            Ok(surface) => surface,
            Err(e) => {
                unsafe { teardown(&mut device, None, None, None, None) };
                return Err(e);
            }
        };

        let mut targets = match FrameTargets::new(&device, &surface) {
            Ok(targets) => targets,
            Err(e) => {
                unsafe { teardown(&mut device, Some(&mut surface), None, None, None) };
                return Err(e);
            }
        };

        let mut commands = match CommandStream::new(&device, surface.image_count()) {
            Ok(commands) => commands,
            Err(e) => {
                unsafe { teardown(&mut device, Some(&mut surface), Some(&mut targets), None, None) };
                return Err(e);
            }
        };

        let mut sync = match FrameSync::new(&device, surface.image_count()) {
            Ok(sync) => sync,
            Err(e) => {
                unsafe {
                    teardown(&mut device, Some(&mut surface), Some(&mut targets), Some(&mut commands), None)
                };
                return Err(e);
            }
        };

        let counts = FrameResourceCounts {
            images: surface.image_count(),
            color_views: targets.color_views.len(),
            framebuffers: targets.framebuffers.len(),
            command_buffers: commands.buffers.len(),
            fences: sync.fences.len(),
        };
        if let Err(e) = counts.verify() {
            unsafe {
                teardown(
                    &mut device,
                    Some(&mut surface),
                    Some(&mut targets),
                    Some(&mut commands),
                    Some(&mut sync),
                )
            };
            return Err(e);
        }

        log::info!("Vulkan initialized successfully! {} frames in flight", counts.images);

        Ok(Self {
            device,
            surface,
            targets,
            commands,
            sync,
            clear_values: [
                vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: config.clear_color,
                    },
                },
                vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: 1.0,
                        stencil: 0,
                    },
                },
            ],
            wait_stages: [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
            suboptimal_reported: false,
            released: false,
        })
    }

    pub fn device(&self) -> &DeviceContext {
        &self.device
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.surface.extent
    }

    pub fn format(&self) -> vk::Format {
        self.surface.format.format
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.targets.render_pass
    }

    fn note_suboptimal(&mut self, suboptimal: bool) {
        if suboptimal && !self.suboptimal_reported {
            log::warn!("Swapchain is suboptimal for the surface; it will not be recreated");
            self.suboptimal_reported = true;
        }
    }
}

impl FrameBackend for GpuSession {
    fn image_count(&self) -> usize {
        self.surface.image_count()
    }

    fn acquire_next_image(&mut self, timeout: u64) -> Result<u32> {
        ensure_live(self.released)?;
        let (image_index, suboptimal) =
            self.surface.acquire_next_image(timeout, self.sync.present_acquired)?;
        self.note_suboptimal(suboptimal);
        Ok(image_index)
    }

    fn wait_for_fence(&mut self, image_index: u32, timeout: u64) -> Result<()> {
        ensure_live(self.released)?;
        let fence = per_image(&self.sync.fences, image_index, "fence")?;
        unsafe { self.device.device.wait_for_fences(&[fence], true, timeout) }
            .map_err(Error::vk("vkWaitForFences"))
    }

    fn begin_recording(&mut self, image_index: u32) -> Result<FrameRecording> {
        ensure_live(self.released)?;
        let cmd = per_image(&self.commands.buffers, image_index, "command buffer")?;
        let framebuffer = per_image(&self.targets.framebuffers, image_index, "framebuffer")?;
        let device = &self.device.device;

        // Begin implicitly resets: the pool was created with RESET_COMMAND_BUFFER.
        let begin_info = vk::CommandBufferBeginInfo::default();
        unsafe { device.begin_command_buffer(cmd, &begin_info) }
            .map_err(Error::vk("vkBeginCommandBuffer"))?;

        let render_pass_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.targets.render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.targets.extent,
            })
            .clear_values(&self.clear_values);

        unsafe { device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE) };

        Ok(FrameRecording {
            image_index,
            command_buffer: cmd,
            extent: self.targets.extent,
        })
    }

    fn end_recording(&mut self, image_index: u32) -> Result<()> {
        ensure_live(self.released)?;
        let cmd = per_image(&self.commands.buffers, image_index, "command buffer")?;
        unsafe {
            self.device.device.cmd_end_render_pass(cmd);
            self.device.device.end_command_buffer(cmd)
        }
        .map_err(Error::vk("vkEndCommandBuffer"))
    }

    fn submit(&mut self, image_index: u32) -> Result<()> {
        ensure_live(self.released)?;
        let fence = per_image(&self.sync.fences, image_index, "fence")?;

        let wait_semaphores = [self.sync.present_acquired];
        let signal_semaphores = [self.sync.render_completed];
        let command_buffers = [per_image(&self.commands.buffers, image_index, "command buffer")?];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&self.wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device
                .device
                .reset_fences(&[fence])
                .map_err(Error::vk("vkResetFences"))?;
            self.device
                .device
                .queue_submit(self.device.graphics_queue, &[submit_info], fence)
                .map_err(Error::vk("vkQueueSubmit"))
        }
    }

    fn present(&mut self, image_index: u32) -> Result<()> {
        ensure_live(self.released)?;
        let suboptimal = self.surface.present(
            self.device.graphics_queue,
            image_index,
            &[self.sync.render_completed],
        )?;
        self.note_suboptimal(suboptimal);
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<()> {
        ensure_live(self.released)?;
        self.device.wait_idle()
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        log::info!("Cleaning up Vulkan resources...");
        unsafe {
            teardown(
                &mut self.device,
                Some(&mut self.surface),
                Some(&mut self.targets),
                Some(&mut self.commands),
                Some(&mut self.sync),
            )
        };
        log::info!("Cleanup complete");
    }
}

impl Drop for GpuSession {
    fn drop(&mut self) {
        if !self.released {
            log::warn!("GpuSession dropped without terminate(), releasing now");
            if let Err(e) = self.device.wait_idle() {
                log::warn!("Device did not go idle cleanly: {}", e);
            }
            self.release();
        }
    }
}

/// A released session hands out no handles.
fn ensure_live(released: bool) -> Result<()> {
    if released {
        Err(Error::Terminated)
    } else {
        Ok(())
    }
}

/// Bounds-checked lookup into one of the per-image arrays.
fn per_image<T: Copy>(items: &[T], image_index: u32, what: &str) -> Result<T> {
    items.get(image_index as usize).copied().ok_or_else(|| {
        Error::InconsistentFrameResources(format!(
            "no {} for image {} ({} exist)",
            what,
            image_index,
            items.len()
        ))
    })
}

/// One call per teardown stage. [`run_teardown`] fixes the order.
trait TeardownSteps {
    fn free_command_buffers(&mut self);
    fn destroy_targets(&mut self);
    fn destroy_swapchain(&mut self);
    fn destroy_sync(&mut self);
    fn destroy_command_pool(&mut self);
    fn destroy_surface(&mut self);
    fn destroy_device(&mut self);
}

fn run_teardown(steps: &mut impl TeardownSteps) {
    steps.free_command_buffers();
    steps.destroy_targets();
    steps.destroy_swapchain();
    steps.destroy_sync();
    steps.destroy_command_pool();
    steps.destroy_surface();
    steps.destroy_device();
}

/// Whichever components of a session exist at teardown time.
struct Components<'a> {
    device: &'a mut DeviceContext,
    surface: Option<&'a mut PresentationSurface>,
    targets: Option<&'a mut FrameTargets>,
    commands: Option<&'a mut CommandStream>,
    sync: Option<&'a mut FrameSync>,
}

// Only built inside `teardown`, whose caller guarantees the device is idle.
impl TeardownSteps for Components<'_> {
    fn free_command_buffers(&mut self) {
        if let Some(commands) = self.commands.as_deref_mut() {
            unsafe { commands.free_buffers(&self.device.device) };
        }
    }

    fn destroy_targets(&mut self) {
        if let Some(targets) = self.targets.as_deref_mut() {
            unsafe { targets.destroy(&self.device.device) };
        }
    }

    fn destroy_swapchain(&mut self) {
        if let Some(surface) = self.surface.as_deref_mut() {
            unsafe { surface.destroy_swapchain() };
        }
    }

    fn destroy_sync(&mut self) {
        if let Some(sync) = self.sync.as_deref_mut() {
            unsafe { sync.destroy(&self.device.device) };
        }
    }

    fn destroy_command_pool(&mut self) {
        if let Some(commands) = self.commands.as_deref_mut() {
            unsafe { commands.destroy_pool(&self.device.device) };
        }
    }

    fn destroy_surface(&mut self) {
        if let Some(surface) = self.surface.as_deref_mut() {
            unsafe { surface.destroy_surface() };
        }
    }

    fn destroy_device(&mut self) {
        unsafe { self.device.destroy() };
    }
}

/// Release whichever components exist, in the fixed teardown order.
///
/// # Safety
/// The device must be idle, and no handle may be used afterwards.
unsafe fn teardown(
    device: &mut DeviceContext,
    surface: Option<&mut PresentationSurface>,
    targets: Option<&mut FrameTargets>,
    commands: Option<&mut CommandStream>,
    sync: Option<&mut FrameSync>,
) {
    run_teardown(&mut Components {
        device,
        surface,
        targets,
        commands,
        sync,
    });
}

/// Sizes of the per-image arrays. They must all match the swapchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameResourceCounts {
    pub images: usize,
    pub color_views: usize,
    pub framebuffers: usize,
    pub command_buffers: usize,
    pub fences: usize,
}

impl FrameResourceCounts {
    /// Returns the shared count, or which array disagrees.
    pub fn verify(&self) -> Result<usize> {
        let named = [
            ("color views", self.color_views),
            ("framebuffers", self.framebuffers),
            ("command buffers", self.command_buffers),
            ("fences", self.fences),
        ];
        for (name, count) in named {
            if count != self.images {
                return Err(Error::InconsistentFrameResources(format!(
                    "{} {} for {} swapchain images",
                    count, name, self.images
                )));
            }
        }
        if self.images < 2 {
            return Err(Error::InconsistentFrameResources(format!(
                "swapchain has {} images, need at least 2",
                self.images
            )));
        }
        Ok(self.images)
    }
}

/// Open a session on `window` and wrap it in a scheduler driving `recorder`.
pub fn start<W: NativeWindow + ?Sized>(
    window: &W,
    config: &SessionConfig,
    recorder: impl RecordFrame + 'static,
) -> Result<FrameScheduler<GpuSession>> {
    let session = GpuSession::new(window, config)?;
    Ok(FrameScheduler::new(session, recorder, config.wait_timeout))
}
