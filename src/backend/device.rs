// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with the configured extension policy
// - Validation layer + debug messenger (debug builds only)
// - Physical device selection (first enumerated adapter)
// - Logical device + single graphics queue

use crate::error::{Error, Result};
use ash::{vk, Entry};
use raw_window_handle::RawDisplayHandle;
use serde::Deserialize;
use std::ffi::{CStr, CString};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
// Provisional extension, not exposed by ash without extra features.
const PORTABILITY_SUBSET: &CStr = c"VK_KHR_portability_subset";

/// Which extensions to turn on at instance and device creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionPolicy {
    /// Enable everything the driver advertises.
    #[default]
    All,
    /// Enable only what presentation (and debugging) needs.
    Required,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceOptions {
    pub validation: bool,
    pub extension_policy: ExtensionPolicy,
}

/// Connection to the GPU: instance, adapter, logical device, graphics queue.
///
/// Built in one step by [`DeviceContext::new`]; there is no partially
/// initialized state. Destroyed explicitly by the owning session as the
/// last step of teardown.
pub struct DeviceContext {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    pub surface_loader: ash::khr::surface::Instance,
    entry: Entry,

    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,

    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,

    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    destroyed: bool,
}

impl DeviceContext {
    /// Create the device context.
    ///
    /// # Arguments
    /// * `app_name` - Application label, also used as the engine name
    /// * `display` - Display the presentation surface will live on
    /// * `options` - Validation and extension policy
    pub fn new(app_name: &str, display: RawDisplayHandle, options: &DeviceOptions) -> Result<Self> {
        log::info!("Creating Vulkan device: {}", app_name);

        let entry = unsafe { Entry::load() }?;

        let (instance, debug_utils_enabled) = Self::create_instance(&entry, app_name, display, options)?;

        let debug_utils = if options.validation && debug_utils_enabled {
            match Self::setup_debug_messenger(&entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            if options.validation {
                log::warn!("VK_EXT_debug_utils unavailable, validation messages will not be logged");
            }
            None
        };

        match Self::open_device(&instance, options) {
            Ok((physical_device, graphics_queue_family, device, graphics_queue)) => {
                let properties = unsafe { instance.get_physical_device_properties(physical_device) };
                let memory_properties =
                    unsafe { instance.get_physical_device_memory_properties(physical_device) };

                log::info!(
                    "Selected GPU: {}",
                    properties.device_name_as_c_str().map(CStr::to_string_lossy).unwrap_or_default()
                );
                log::info!(
                    "API Version: {}.{}.{}",
                    vk::api_version_major(properties.api_version),
                    vk::api_version_minor(properties.api_version),
                    vk::api_version_patch(properties.api_version)
                );
                log::debug!(
                    "Graphics queue family {}, {} memory types",
                    graphics_queue_family,
                    memory_properties.memory_type_count
                );

                let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);

                Ok(Self {
                    device,
                    physical_device,
                    instance,
                    surface_loader,
                    entry,
                    graphics_queue,
                    graphics_queue_family,
                    debug_utils,
                    properties,
                    memory_properties,
                    destroyed: false,
                })
            }
            Err(e) => {
                unsafe {
                    if let Some((loader, messenger)) = debug_utils {
                        loader.destroy_debug_utils_messenger(messenger, None);
                    }
                    instance.destroy_instance(None);
                }
                Err(e)
            }
        }
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        display: RawDisplayHandle,
        options: &DeviceOptions,
    ) -> Result<(ash::Instance, bool)> {
        let app_name_cstr = CString::new(app_name)?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&app_name_cstr)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_1);

        let available = unsafe { entry.enumerate_instance_extension_properties(None) }
            .map_err(Error::vk("vkEnumerateInstanceExtensionProperties"))?;
        let available = extension_names(&available);

        let surface_extensions = ash_window::enumerate_required_extensions(display)
            .map_err(Error::vk("enumerate_required_extensions"))?;
        let required: Vec<&CStr> = surface_extensions
            .iter()
            .map(|&name| unsafe { CStr::from_ptr(name) })
            .collect();

        let mut optional = vec![ash::khr::portability_enumeration::NAME];
        if options.validation {
            optional.push(ash::ext::debug_utils::NAME);
        }

        let extensions = select_extensions(&available, &required, &optional, options.extension_policy)?;
        log::debug!("Enabling {} instance extensions", extensions.len());

        let enabled = |name: &CStr| extensions.iter().any(|e| e.as_c_str() == name);
        let flags = if enabled(ash::khr::portability_enumeration::NAME) {
            vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR
        } else {
            vk::InstanceCreateFlags::empty()
        };

        let layer_names = if options.validation {
            let layers = unsafe { entry.enumerate_instance_layer_properties() }
                .map_err(Error::vk("vkEnumerateInstanceLayerProperties"))?;
            let present = layers
                .iter()
                .any(|l| l.layer_name_as_c_str().is_ok_and(|name| name == VALIDATION_LAYER));
            if present {
                vec![VALIDATION_LAYER.as_ptr()]
            } else {
                log::warn!("{:?} not installed, continuing without it", VALIDATION_LAYER);
                vec![]
            }
        } else {
            vec![]
        };

        let extension_ptrs: Vec<_> = extensions.iter().map(|e| e.as_ptr()).collect();
        let create_info = vk::InstanceCreateInfo::default()
            .flags(flags)
            .application_info(&app_info)
            .enabled_extension_names(&extension_ptrs)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(Error::vk("vkCreateInstance"))?;

        Ok((instance, enabled(ash::ext::debug_utils::NAME)))
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .map_err(Error::vk("vkCreateDebugUtilsMessengerEXT"))?;

        Ok((debug_utils, messenger))
    }

    /// Pick the adapter, find its graphics family and open the logical device.
    fn open_device(
        instance: &ash::Instance,
        options: &DeviceOptions,
    ) -> Result<(vk::PhysicalDevice, u32, ash::Device, vk::Queue)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .map_err(Error::vk("vkEnumeratePhysicalDevices"))?;

        // First wins, no scoring.
        let physical_device = *devices.first().ok_or(Error::NoPhysicalDevice)?;

        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let graphics_queue_family =
            graphics_queue_family(&queue_families).ok_or(Error::NoGraphicsQueueFamily)?;

        let available = unsafe { instance.enumerate_device_extension_properties(physical_device) }
            .map_err(Error::vk("vkEnumerateDeviceExtensionProperties"))?;
        let available = extension_names(&available);
        let extensions = select_extensions(
            &available,
            &[ash::khr::swapchain::NAME],
            &[PORTABILITY_SUBSET],
            options.extension_policy,
        )?;
        log::debug!("Enabling {} device extensions", extensions.len());
        let extension_ptrs: Vec<_> = extensions.iter().map(|e| e.as_ptr()).collect();

        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extension_ptrs);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .map_err(Error::vk("vkCreateDevice"))?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        Ok((physical_device, graphics_queue_family, device, graphics_queue))
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.map_err(Error::vk("vkDeviceWaitIdle"))
    }

    /// Destroy the logical device, the debug messenger and the instance.
    ///
    /// # Safety
    /// Every object created from this device must already be destroyed.
    pub unsafe fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        log::info!("Destroying Vulkan device...");
        self.device.destroy_device(None);
        if let Some((debug_utils, messenger)) = self.debug_utils.take() {
            debug_utils.destroy_debug_utils_messenger(messenger, None);
        }
        self.instance.destroy_instance(None);
    }
}

/// Index of the first queue family that can do graphics work.
pub fn graphics_queue_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    families
        .iter()
        .position(|props| props.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|i| i as u32)
}

fn extension_names(props: &[vk::ExtensionProperties]) -> Vec<CString> {
    props
        .iter()
        .filter_map(|p| p.extension_name_as_c_str().ok())
        .map(CStr::to_owned)
        .collect()
}

/// Resolve the extension list to enable.
///
/// `required` must be advertised under either policy. `optional` entries are
/// only picked up by [`ExtensionPolicy::Required`] when available; the
/// permissive policy enables them anyway along with everything else.
pub fn select_extensions(
    available: &[CString],
    required: &[&CStr],
    optional: &[&CStr],
    policy: ExtensionPolicy,
) -> Result<Vec<CString>> {
    if let Some(missing) = required
        .iter()
        .find(|&&r| !available.iter().any(|a| a.as_c_str() == r))
    {
        return Err(Error::MissingExtension((*missing).to_owned()));
    }

    match policy {
        ExtensionPolicy::All => Ok(available.to_vec()),
        ExtensionPolicy::Required => {
            let mut selected: Vec<CString> = Vec::new();
            let wanted = required.iter().chain(
                optional
                    .iter()
                    .filter(|&&o| available.iter().any(|a| a.as_c_str() == o)),
            );
            for &name in wanted {
                if !selected.iter().any(|s| s.as_c_str() == name) {
                    selected.push(name.to_owned());
                }
            }
            Ok(selected)
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() {
        return vk::FALSE;
    }
    let data = &*p_callback_data;

    let prefix = if data.p_message_id_name.is_null() {
        "Vulkan".into()
    } else {
        CStr::from_ptr(data.p_message_id_name).to_string_lossy()
    };
    let message = if data.p_message.is_null() {
        "".into()
    } else {
        CStr::from_ptr(data.p_message).to_string_lossy()
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!(target: "vulkan", "[{}] {}", prefix, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!(target: "vulkan", "[{}] {}", prefix, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            log::info!(target: "vulkan", "[{}] {}", prefix, message);
        }
        _ => {
            log::trace!(target: "vulkan", "[{}] {}", prefix, message);
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn names(list: &[&CStr]) -> Vec<CString> {
        list.iter().map(|&n| n.to_owned()).collect()
    }

    #[test]
    fn first_graphics_family_wins() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::GRAPHICS),
        ];
        assert_eq!(graphics_queue_family(&families), Some(1));
    }

    #[test]
    fn missing_graphics_family_is_none() {
        let families = [family(vk::QueueFlags::COMPUTE), family(vk::QueueFlags::TRANSFER)];
        assert_eq!(graphics_queue_family(&families), None);
        assert_eq!(graphics_queue_family(&[]), None);
    }

    #[test]
    fn permissive_policy_enables_everything() {
        let available = names(&[c"VK_KHR_surface", c"VK_KHR_xlib_surface", c"VK_EXT_debug_utils"]);
        let selected = select_extensions(
            &available,
            &[c"VK_KHR_surface"],
            &[],
            ExtensionPolicy::All,
        )
        .unwrap();
        assert_eq!(selected, available);
    }

    #[test]
    fn required_policy_keeps_required_and_available_optional() {
        let available = names(&[
            c"VK_KHR_surface",
            c"VK_KHR_xlib_surface",
            c"VK_EXT_debug_utils",
            c"VK_KHR_get_surface_capabilities2",
        ]);
        let selected = select_extensions(
            &available,
            &[c"VK_KHR_surface", c"VK_KHR_xlib_surface"],
            &[c"VK_EXT_debug_utils", c"VK_KHR_portability_enumeration"],
            ExtensionPolicy::Required,
        )
        .unwrap();
        assert_eq!(
            selected,
            names(&[c"VK_KHR_surface", c"VK_KHR_xlib_surface", c"VK_EXT_debug_utils"])
        );
    }

    #[test]
    fn missing_required_extension_is_an_error() {
        let available = names(&[c"VK_KHR_surface"]);
        for policy in [ExtensionPolicy::All, ExtensionPolicy::Required] {
            let err = select_extensions(&available, &[c"VK_KHR_swapchain"], &[], policy).unwrap_err();
            match err {
                Error::MissingExtension(name) => assert_eq!(name.as_c_str(), c"VK_KHR_swapchain"),
                other => panic!("unexpected {other:?}"),
            }
        }
    }
}
