// =============================================================================
// VK-PRESENT - window glue around the present loop
// =============================================================================
//
// The library owns every Vulkan object; this binary only supplies a window,
// polls events, and calls render_frame once per redraw.
//
// FRAME FLOW:
// 1. winit polls events (close / Escape checked between frames only)
// 2. RedrawRequested -> FrameScheduler::render_frame
// 3. about_to_wait -> request the next redraw
//
// =============================================================================

mod config;

use anyhow::{Context, Result};
use config::Config;
use std::fs::OpenOptions;
use std::sync::Arc;
use std::time::Instant;
use vk_present::{FrameRecording, FrameScheduler, GpuSession, Lifecycle};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    init_logging(&config)?;
    log::info!("Starting present loop");
    log::info!("Window: {}x{}", config.window.width, config.window.height);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    app.shutdown();
    Ok(())
}

/// Initialize logging, optionally writing to the configured log file
fn init_logging(config: &Config) -> Result<()> {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    builder.parse_default_env();

    if config.debug.log_to_file {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
            .with_context(|| format!("Failed to open log file {:?}", config.debug.log_file))?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

/// Only an acquire timeout leaves the scheduler able to render again.
fn can_retry(error: &vk_present::Error, lifecycle: Lifecycle) -> bool {
    matches!(error, vk_present::Error::Timeout) && lifecycle == Lifecycle::Running
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

struct App {
    config: Config,
    window: Option<Arc<Window>>,
    /// Terminated explicitly before the window is dropped.
    frames: Option<FrameScheduler<GpuSession>>,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let now = Instant::now();
        Self {
            config,
            window: None,
            frames: None,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn init_vulkan(&mut self, window: &Window) -> Result<()> {
        let session_config = self.config.session_config()?;

        // Draw content is out of scope here: the render pass only clears.
        let recorder = |frame: &FrameRecording| {
            log::trace!("Recording image {}", frame.image_index);
        };

        let frames = vk_present::start(window, &session_config, recorder)
            .context("Failed to initialize Vulkan")?;
        self.frames = Some(frames);
        Ok(())
    }

    /// Terminate the GPU session if it is still alive.
    fn shutdown(&mut self) {
        if let Some(mut frames) = self.frames.take() {
            if let Err(e) = frames.terminate() {
                log::error!("Shutdown error: {}", e);
            }
        }
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms)",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        // The swapchain is never recreated, so the window keeps its size.
        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ))
            .with_resizable(false);

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_vulkan(&window) {
            log::error!("{:#}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown();
                event_loop.exit();
            }

            WindowEvent::RedrawRequested => {
                let Some(frames) = self.frames.as_mut() else {
                    return;
                };
                match frames.render_frame() {
                    Ok(_) => self.update_fps(),
                    Err(e) if can_retry(&e, frames.lifecycle()) => {
                        log::warn!("Frame timed out, retrying next iteration");
                    }
                    Err(e) => {
                        log::error!("Render error: {}", e);
                        self.shutdown();
                        event_loop.exit();
                    }
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed()
                    && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    log::info!("ESC pressed, exiting...");
                    self.shutdown();
                    event_loop.exit();
                }
            }

            _ => {}
        }
    }

    /// Called when the event loop is about to block waiting for events.
    /// Request continuous redraws so the loop presents every vblank.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if self.frames.is_some() {
            if let Some(ref window) = self.window {
                window.request_redraw();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vk_present::Error;

    #[test]
    fn only_timeouts_on_a_running_loop_are_retried() {
        assert!(can_retry(&Error::Timeout, Lifecycle::Running));
        assert!(!can_retry(&Error::Timeout, Lifecycle::Faulted));
        assert!(!can_retry(&Error::OutOfDate, Lifecycle::Faulted));
        assert!(!can_retry(&Error::Faulted, Lifecycle::Faulted));
    }
}
