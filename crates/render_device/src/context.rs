//! Vulkan context management
//!
//! Low-level Vulkan initialization: instance (with validation layers and a
//! debug messenger in debug builds), surface, physical device selection, and
//! logical device with graphics, present, and optional dedicated transfer
//! queues. Field order in `VulkanContext` is the teardown order.

use crate::config::RendererConfig;
use crate::error::{VulkanError, VulkanResult};
use crate::logging::{info, warn};
#[cfg(debug_assertions)]
use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
use ash::{vk, Device, Entry, Instance};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::ffi::{CStr, CString};

/// Vulkan instance wrapper with RAII cleanup
pub struct VulkanInstance {
    /// Vulkan entry point
    pub entry: Entry,
    /// Vulkan instance handle
    pub instance: Instance,
    /// Debug utilities extension (debug builds)
    #[cfg(debug_assertions)]
    pub debug_utils: Option<DebugUtils>,
    /// Debug messenger handle (debug builds)
    #[cfg(debug_assertions)]
    pub debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

impl VulkanInstance {
    /// Create a new Vulkan instance with optional validation layers
    pub fn new(
        display: &dyn HasRawDisplayHandle,
        config: &RendererConfig,
    ) -> VulkanResult<Self> {
        let entry = unsafe { Entry::load() }.map_err(|e| {
            VulkanError::InitializationFailed(format!("Failed to load Vulkan: {:?}", e))
        })?;

        let enable_validation = config.validation_enabled();

        let app_name_cstr = CString::new(config.application_name.as_str())
            .map_err(|_| VulkanError::InitializationFailed("invalid application name".into()))?;
        let engine_name_cstr = CString::new("render_device")
            .map_err(|_| VulkanError::InitializationFailed("invalid engine name".into()))?;
        let (major, minor, patch) = config.application_version;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, major, minor, patch))
            .engine_name(&engine_name_cstr)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_0);

        let required_extensions =
            ash_window::enumerate_required_extensions(display.raw_display_handle())
                .map_err(VulkanError::Api)?;

        #[allow(unused_mut)]
        let mut extensions: Vec<*const i8> = required_extensions.to_vec();

        #[cfg(debug_assertions)]
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names = if cfg!(debug_assertions) && enable_validation {
            vec![CString::new("VK_LAYER_KHRONOS_validation")
                .map_err(|_| VulkanError::InitializationFailed("invalid layer name".into()))?]
        } else {
            vec![]
        };

        let layer_names_ptrs: Vec<*const i8> =
            layer_names.iter().map(|name| name.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names_ptrs);

        let instance = unsafe {
            entry
                .create_instance(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        #[cfg(debug_assertions)]
        let (debug_utils, debug_messenger) = if enable_validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            let debug_messenger = Self::setup_debug_messenger(&debug_utils)?;
            (Some(debug_utils), Some(debug_messenger))
        } else {
            (None, None)
        };

        Ok(Self {
            entry,
            instance,
            #[cfg(debug_assertions)]
            debug_utils,
            #[cfg(debug_assertions)]
            debug_messenger,
        })
    }

    #[cfg(debug_assertions)]
    fn setup_debug_messenger(debug_utils: &DebugUtils) -> VulkanResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        unsafe {
            debug_utils
                .create_debug_utils_messenger(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            #[cfg(debug_assertions)]
            if let (Some(debug_utils), Some(debug_messenger)) =
                (&self.debug_utils, &self.debug_messenger)
            {
                debug_utils.destroy_debug_utils_messenger(*debug_messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Debug callback for validation layers
#[cfg(debug_assertions)]
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let callback_data = *callback_data;
    let message = CStr::from_ptr(callback_data.p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}

/// Surface plus its extension loader, with RAII cleanup
pub struct SurfaceHandles {
    /// Surface extension loader
    pub loader: Surface,
    /// Surface handle
    pub surface: vk::SurfaceKHR,
}

impl SurfaceHandles {
    /// Create a surface for the given window
    pub fn new(
        vulkan_instance: &VulkanInstance,
        window: &(impl HasRawDisplayHandle + HasRawWindowHandle),
    ) -> VulkanResult<Self> {
        let loader = Surface::new(&vulkan_instance.entry, &vulkan_instance.instance);
        let surface = unsafe {
            ash_window::create_surface(
                &vulkan_instance.entry,
                &vulkan_instance.instance,
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            )
            .map_err(VulkanError::Api)?
        };

        Ok(Self { loader, surface })
    }
}

impl Drop for SurfaceHandles {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_surface(self.surface, None);
        }
    }
}

/// Queue family indices chosen for a physical device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    /// Index of the graphics queue family
    pub graphics: u32,
    /// Index of the presentation queue family
    pub present: u32,
    /// Index of a dedicated transfer family, when the device has one
    pub transfer: Option<u32>,
}

/// Pick queue families from their capabilities
///
/// `present_support[i]` is whether family `i` can present to the target
/// surface. A transfer family only counts as dedicated when it lacks both
/// graphics and compute; otherwise uploads share the graphics queue and no
/// ownership transfers are needed.
pub fn pick_queue_families(
    families: &[vk::QueueFamilyProperties],
    present_support: &[bool],
) -> VulkanResult<QueueFamilies> {
    let mut graphics = None;
    let mut present = None;
    let mut transfer = None;

    for (index, family) in families.iter().enumerate() {
        let flags = family.queue_flags;
        let index = index as u32;

        if flags.contains(vk::QueueFlags::GRAPHICS) && graphics.is_none() {
            graphics = Some(index);
        }

        if present_support.get(index as usize).copied().unwrap_or(false) && present.is_none() {
            present = Some(index);
        }

        if flags.contains(vk::QueueFlags::TRANSFER)
            && !flags.contains(vk::QueueFlags::GRAPHICS)
            && !flags.contains(vk::QueueFlags::COMPUTE)
            && transfer.is_none()
        {
            transfer = Some(index);
        }
    }

    let graphics = graphics.ok_or_else(|| {
        VulkanError::InitializationFailed("No graphics queue family found".to_string())
    })?;
    let present = present.ok_or_else(|| {
        VulkanError::InitializationFailed("No present queue family found".to_string())
    })?;

    Ok(QueueFamilies {
        graphics,
        present,
        transfer,
    })
}

/// Physical device selection and capabilities
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Supported device features
    pub features: vk::PhysicalDeviceFeatures,
    /// Memory heaps and types
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Chosen queue family indices
    pub queue_families: QueueFamilies,
}

impl PhysicalDeviceInfo {
    /// Select a suitable physical device for rendering
    pub fn select_suitable_device(
        instance: &Instance,
        surface_handles: &SurfaceHandles,
    ) -> VulkanResult<Self> {
        let devices = unsafe {
            instance
                .enumerate_physical_devices()
                .map_err(VulkanError::Api)?
        };

        for device in devices {
            if let Ok(device_info) = Self::evaluate_device(instance, device, surface_handles) {
                info!("Selected GPU: {}", unsafe {
                    CStr::from_ptr(device_info.properties.device_name.as_ptr()).to_string_lossy()
                });
                if device_info.queue_families.transfer.is_none() {
                    info!("No dedicated transfer queue family; uploads share the graphics queue");
                }
                return Ok(device_info);
            }
        }

        Err(VulkanError::InitializationFailed(
            "No suitable GPU found".to_string(),
        ))
    }

    fn evaluate_device(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface_handles: &SurfaceHandles,
    ) -> VulkanResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let features = unsafe { instance.get_physical_device_features(device) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };
        let families = unsafe { instance.get_physical_device_queue_family_properties(device) };

        let present_support: Vec<bool> = (0..families.len() as u32)
            .map(|index| unsafe {
                surface_handles
                    .loader
                    .get_physical_device_surface_support(device, index, surface_handles.surface)
                    .map_err(VulkanError::Api)
            })
            .collect::<VulkanResult<_>>()?;

        let queue_families = pick_queue_families(&families, &present_support)?;

        let extensions = unsafe {
            instance
                .enumerate_device_extension_properties(device)
                .map_err(VulkanError::Api)?
        };

        let required_extensions = [SwapchainLoader::name()];
        let has_required_extensions = required_extensions.iter().all(|required| {
            extensions.iter().any(|available| {
                let extension_name = unsafe { CStr::from_ptr(available.extension_name.as_ptr()) };
                extension_name == *required
            })
        });

        if !has_required_extensions {
            return Err(VulkanError::InitializationFailed(
                "Required device extensions not supported".to_string(),
            ));
        }

        Ok(Self {
            device,
            properties,
            features,
            memory_properties,
            queue_families,
        })
    }
}

/// Logical device wrapper with RAII cleanup
pub struct LogicalDevice {
    /// Vulkan logical device handle
    pub device: Device,
    /// Graphics operations queue
    pub graphics_queue: vk::Queue,
    /// Surface presentation queue
    pub present_queue: vk::Queue,
    /// Dedicated transfer queue, when the device has one
    pub transfer_queue: Option<vk::Queue>,
    /// Chosen queue family indices
    pub queue_families: QueueFamilies,
}

impl LogicalDevice {
    /// Create a new logical device with required queues
    pub fn new(
        instance: &Instance,
        physical_device_info: &PhysicalDeviceInfo,
    ) -> VulkanResult<Self> {
        let families = physical_device_info.queue_families;
        let mut unique_families: std::collections::HashSet<u32> =
            [families.graphics, families.present].into_iter().collect();
        if let Some(transfer) = families.transfer {
            unique_families.insert(transfer);
        }

        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&[1.0])
                    .build()
            })
            .collect();

        let required_extensions = [SwapchainLoader::name().as_ptr()];

        let device_features = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(physical_device_info.features.sampler_anisotropy == vk::TRUE)
            .build();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&required_extensions)
            .enabled_features(&device_features);

        let device = unsafe {
            instance
                .create_device(physical_device_info.device, &create_info, None)
                .map_err(VulkanError::Api)?
        };

        let graphics_queue = unsafe { device.get_device_queue(families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(families.present, 0) };
        let transfer_queue = families
            .transfer
            .map(|family| unsafe { device.get_device_queue(family, 0) });

        Ok(Self {
            device,
            graphics_queue,
            present_queue,
            transfer_queue,
            queue_families: families,
        })
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                warn!("device_wait_idle failed during teardown: {:?}", e);
            }
            self.device.destroy_device(None);
        }
    }
}

/// Core Vulkan resources in teardown order
///
/// Fields drop in declaration order: the device (after waiting idle), then
/// the surface, then the instance.
pub struct VulkanContext {
    /// Logical device for operations
    pub device: LogicalDevice,
    /// Surface and its loader
    pub surface: SurfaceHandles,
    /// Selected physical device information
    pub physical_device: PhysicalDeviceInfo,
    /// Vulkan instance and debug utilities
    pub instance: VulkanInstance,
}

impl VulkanContext {
    /// Create a context for the given window
    pub fn new(
        window: &(impl HasRawDisplayHandle + HasRawWindowHandle),
        config: &RendererConfig,
    ) -> VulkanResult<Self> {
        let instance = VulkanInstance::new(window, config)?;
        let surface = SurfaceHandles::new(&instance, window)?;
        let physical_device =
            PhysicalDeviceInfo::select_suitable_device(&instance.instance, &surface)?;
        let device = LogicalDevice::new(&instance.instance, &physical_device)?;

        Ok(Self {
            device,
            surface,
            physical_device,
            instance,
        })
    }

    /// Get a reference to the Vulkan instance
    pub fn instance(&self) -> &Instance {
        &self.instance.instance
    }

    /// Get the raw Device handle
    pub fn raw_device(&self) -> Device {
        self.device.device.clone()
    }

    /// Chosen queue family indices
    pub fn queue_families(&self) -> QueueFamilies {
        self.device.queue_families
    }

    /// Cached memory properties of the selected physical device
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.physical_device.memory_properties
    }
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

    #[test]
    fn picks_dedicated_transfer_family() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ];
        let picked = pick_queue_families(&families, &[true, false]).unwrap();
        assert_eq!(picked.graphics, 0);
        assert_eq!(picked.present, 0);
        assert_eq!(picked.transfer, Some(1));
    }

    #[test]
    fn compute_transfer_family_is_not_dedicated() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
        ];
        let picked = pick_queue_families(&families, &[true, false]).unwrap();
        assert_eq!(picked.transfer, None);
    }

    #[test]
    fn present_can_live_on_a_different_family() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::TRANSFER),
        ];
        let picked = pick_queue_families(&families, &[false, true]).unwrap();
        assert_eq!(picked.graphics, 0);
        assert_eq!(picked.present, 1);
    }

    #[test]
    fn missing_graphics_family_is_an_error() {
        let families = [family(vk::QueueFlags::TRANSFER)];
        let result = pick_queue_families(&families, &[true]);
        assert!(matches!(
            result,
            Err(VulkanError::InitializationFailed(_))
        ));
    }
}
