// Error types for session setup and the frame loop
//
// Setup failures are returned to the caller; nothing here aborts.

use ash::vk;
use std::ffi::CString;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to load Vulkan library: {0}")]
    Loader(#[from] ash::LoadingError),

    #[error("Vulkan call `{op}` failed: {result}")]
    Vulkan {
        op: &'static str,
        result: vk::Result,
    },

    #[error("Failed to get native window handle: {0}")]
    WindowHandle(#[from] raw_window_handle::HandleError),

    #[error("Invalid application label: {0}")]
    InvalidLabel(#[from] std::ffi::NulError),

    #[error("Required extension {0:?} is not available")]
    MissingExtension(CString),

    #[error("No Vulkan-capable GPU found")]
    NoPhysicalDevice,

    #[error("No queue family with graphics support")]
    NoGraphicsQueueFamily,

    #[error("Graphics queue family cannot present to this surface")]
    PresentUnsupported,

    #[error("Surface does not support format {0:?}")]
    FormatUnavailable(vk::Format),

    #[error("No memory type in mask {type_bits:#034b} has properties {required:?}")]
    NoSuitableMemoryType {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },

    #[error("Per-image resources disagree: {0}")]
    InconsistentFrameResources(String),

    #[error("Swapchain is out of date")]
    OutOfDate,

    #[error("Timed out waiting on the GPU")]
    Timeout,

    #[error("Frame loop faulted by an earlier error; terminate the session")]
    Faulted,

    #[error("Session has been terminated")]
    Terminated,
}

impl Error {
    /// Wrap a raw `vk::Result` with the name of the call that produced it.
    pub fn vk(op: &'static str) -> impl FnOnce(vk::Result) -> Error {
        move |result| match result {
            vk::Result::TIMEOUT => Error::Timeout,
            vk::Result::ERROR_OUT_OF_DATE_KHR => Error::OutOfDate,
            result => Error::Vulkan { op, result },
        }
    }
}
