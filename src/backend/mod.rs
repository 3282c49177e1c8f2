// Backend module - Vulkan objects owned by a session
//
// Design: thin wrappers around ash, each owning one stage of setup.
// Teardown is explicit and ordered by the session, not by Drop.

pub mod commands;
pub mod device;
pub mod surface;
pub mod sync;
pub mod targets;

pub use commands::CommandStream;
pub use device::{DeviceContext, DeviceOptions, ExtensionPolicy};
pub use surface::{NativeWindow, PresentationSurface};
pub use sync::FrameSync;
pub use targets::FrameTargets;
