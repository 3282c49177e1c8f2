// =============================================================================
// VK-PRESENT - Vulkan device session and present loop
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  FrameScheduler (acquire → record → submit → present)           │
// │    └── GpuSession                                               │
// │          ├── DeviceContext (instance, adapter, device, queue)   │
// │          ├── PresentationSurface (surface + swapchain)          │
// │          ├── FrameTargets (views, depth, render pass, fbs)      │
// │          ├── CommandStream (pool + one buffer per image)        │
// │          └── FrameSync (two semaphores + one fence per image)   │
// └─────────────────────────────────────────────────────────────────┘
//
// The window, event loop and draw commands belong to the caller. Draws are
// injected through a `RecordFrame` callback that runs inside the render pass.
//
// =============================================================================

pub mod backend;
pub mod error;
pub mod frame;
pub mod session;

pub use backend::{DeviceOptions, ExtensionPolicy, NativeWindow};
pub use error::{Error, Result};
pub use frame::{FrameBackend, FrameRecording, FrameScheduler, Lifecycle, RecordFrame, SlotState};
pub use session::{start, FrameResourceCounts, GpuSession, SessionConfig};
