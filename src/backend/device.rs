// Device - instance, GPU and the three logical queues
//
// Responsibilities:
// - Vulkan 1.2 instance, validation layer when it is installed
// - GPU selection: discrete first, must support the swapchain extension
// - Queue family selection (graphics, compute, transfer)
// - Logical device + one command pool per logical queue
// - Memory type selection for the host and local memory blocks

use anyhow::{Context, Result};
use ash::{vk, Entry};
use raw_window_handle::RawDisplayHandle;
use std::ffi::{CStr, CString};
use std::sync::Arc;
use thiserror::Error;

use super::command::QueueKind;
use super::surface;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueSelectionError {
    #[error("no queue family supports graphics")]
    NoGraphicsQueue,
}

/// One queue inside a family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSlot {
    pub family: u32,
    pub index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: QueueSlot,
    pub compute: QueueSlot,
    pub transfer: QueueSlot,
}

impl QueueFamilies {
    pub fn slot(&self, kind: QueueKind) -> QueueSlot {
        match kind {
            QueueKind::Graphics => self.graphics,
            QueueKind::Compute => self.compute,
            QueueKind::Transfer => self.transfer,
        }
    }

    /// Distinct families with the number of queues to request from each
    pub fn queue_counts(&self) -> Vec<(u32, u32)> {
        let mut counts: Vec<(u32, u32)> = Vec::new();
        for slot in [self.graphics, self.compute, self.transfer] {
            match counts.iter_mut().find(|(family, _)| *family == slot.family) {
                Some((_, count)) => *count = (*count).max(slot.index + 1),
                None => counts.push((slot.family, slot.index + 1)),
            }
        }
        counts
    }

    /// Distinct families, graphics first
    pub fn unique_families(&self) -> Vec<u32> {
        self.queue_counts().into_iter().map(|(family, _)| family).collect()
    }
}

/// Picks queue families for the three logical queues.
///
/// Graphics takes the first family with GRAPHICS. Compute prefers a family
/// without graphics, transfer prefers one with neither graphics nor compute.
/// Without a dedicated family a role shares a family with an earlier role,
/// taking its own queue index while the family has queues left.
pub fn select_queue_families(
    families: &[vk::QueueFamilyProperties],
) -> Result<QueueFamilies, QueueSelectionError> {
    let find = |predicate: &dyn Fn(vk::QueueFlags) -> bool| {
        families
            .iter()
            .position(|family| family.queue_count > 0 && predicate(family.queue_flags))
            .map(|index| index as u32)
    };

    let graphics = find(&|flags| flags.contains(vk::QueueFlags::GRAPHICS))
        .ok_or(QueueSelectionError::NoGraphicsQueue)?;

    let compute = find(&|flags| {
        flags.contains(vk::QueueFlags::COMPUTE) && !flags.contains(vk::QueueFlags::GRAPHICS)
    })
    .unwrap_or(graphics);

    let transfer = find(&|flags| {
        flags.contains(vk::QueueFlags::TRANSFER)
            && !flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
    })
    .unwrap_or(compute);

    let mut used = vec![0u32; families.len()];
    let mut take = |family: u32| {
        let available = families[family as usize].queue_count;
        let slot = &mut used[family as usize];
        let index = (*slot).min(available - 1);
        *slot += 1;
        QueueSlot { family, index }
    };

    Ok(QueueFamilies {
        graphics: take(graphics),
        compute: take(compute),
        transfer: take(transfer),
    })
}

/// Index of the first memory type allowed by `type_filter` that has `flags`
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&i| {
        let has_type = (type_filter & (1 << i)) != 0;
        let has_properties = memory_properties.memory_types[i as usize]
            .property_flags
            .contains(flags);
        has_type && has_properties
    })
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    pub entry: Entry,

    pub queue_families: QueueFamilies,
    graphics_queue: vk::Queue,
    compute_queue: vk::Queue,
    transfer_queue: vk::Queue,

    /// One pool per logical queue, RESET_COMMAND_BUFFER
    command_pools: [vk::CommandPool; 3],

    // Debug utils (if validation enabled)
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    /// Host visible + coherent memory type
    pub host_memory_index: u32,
    /// Device local memory type
    pub local_memory_index: u32,
}

impl VulkanDevice {
    /// Creates the instance, picks a GPU and opens the logical device.
    ///
    /// `display` decides which surface extensions the instance enables.
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        display: RawDisplayHandle,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let enable_validation = enable_validation && Self::validation_available(&entry)?;
        let instance = Self::create_instance(&entry, app_name, enable_validation, display)?;

        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let (physical_device, queue_families) = Self::pick_physical_device(&instance)?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let features = unsafe { instance.get_physical_device_features(physical_device) };
        let dynamic_texture_indexing =
            features.shader_sampled_image_array_dynamic_indexing == vk::TRUE;

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!("Queue families: {:?}", queue_families);

        let host_memory_index = find_memory_type(
            &memory_properties,
            u32::MAX,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .context("No host visible + coherent memory type")?;
        let local_memory_index = find_memory_type(
            &memory_properties,
            u32::MAX,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .context("No device local memory type")?;

        let device = Self::create_logical_device(
            &instance,
            physical_device,
            &queue_families,
            dynamic_texture_indexing,
        )?;

        let (graphics_queue, compute_queue, transfer_queue) = unsafe {
            let get = |kind: QueueKind| {
                let slot = queue_families.slot(kind);
                device.get_device_queue(slot.family, slot.index)
            };
            (
                get(QueueKind::Graphics),
                get(QueueKind::Compute),
                get(QueueKind::Transfer),
            )
        };

        let command_pools = [
            Self::create_command_pool(&device, queue_families.graphics.family)?,
            Self::create_command_pool(&device, queue_families.compute.family)?,
            Self::create_command_pool(&device, queue_families.transfer.family)?,
        ];

        Ok(Arc::new(Self {
            device,
            physical_device,
            instance,
            entry,
            queue_families,
            graphics_queue,
            compute_queue,
            transfer_queue,
            command_pools,
            debug_utils,
            host_memory_index,
            local_memory_index,
        }))
    }

    fn validation_available(entry: &Entry) -> Result<bool> {
        let layers = entry
            .enumerate_instance_layer_properties()
            .context("Failed to enumerate instance layers")?;

        let found = layer_listed(&layers, VALIDATION_LAYER);

        if !found {
            log::warn!("Validation layer requested but not installed, continuing without it");
        }
        Ok(found)
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        display: RawDisplayHandle,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("Ekko")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        let mut extensions: Vec<*const std::ffi::c_char> = surface::required_extensions(display)?
            .iter()
            .map(|name| name.as_ptr())
            .collect();
        if enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

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

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(instance: &ash::Instance) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };

            let families = match select_queue_families(&queue_families) {
                Ok(families) => families,
                Err(e) => {
                    log::debug!(
                        "Skipping {}: {}",
                        unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy(),
                        e
                    );
                    continue;
                }
            };

            // Prefer discrete GPUs
            let score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                _ => 1,
            };

            if score > best_score {
                best_score = score;
                best_device = Some((device, families));
            }
        }

        best_device.ok_or_else(|| anyhow::anyhow!("No suitable GPU found"))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: &QueueFamilies,
        dynamic_texture_indexing: bool,
    ) -> Result<ash::Device> {
        let queue_counts = queue_families.queue_counts();
        let priorities: Vec<Vec<f32>> = queue_counts
            .iter()
            .map(|&(_, count)| vec![1.0; count as usize])
            .collect();

        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = queue_counts
            .iter()
            .zip(&priorities)
            .map(|(&(family, _), priorities)| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(priorities)
                    .build()
            })
            .collect();

        let extensions = [ash::extensions::khr::Swapchain::name().as_ptr()];

        let features = vk::PhysicalDeviceFeatures {
            shader_sampled_image_array_dynamic_indexing: dynamic_texture_indexing.into(),
            ..Default::default()
        };

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        Ok(device)
    }

    fn create_command_pool(device: &ash::Device, family: u32) -> Result<vk::CommandPool> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        unsafe { device.create_command_pool(&pool_info, None) }
            .with_context(|| format!("Failed to create command pool for family {}", family))
    }

    pub fn queue(&self, kind: QueueKind) -> vk::Queue {
        match kind {
            QueueKind::Graphics => self.graphics_queue,
            QueueKind::Compute => self.compute_queue,
            QueueKind::Transfer => self.transfer_queue,
        }
    }

    pub fn command_pool(&self, kind: QueueKind) -> vk::CommandPool {
        self.command_pools[kind as usize]
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        unsafe {
            for pool in self.command_pools {
                self.device.destroy_command_pool(pool, None);
            }

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

fn layer_listed(layers: &[vk::LayerProperties], wanted: &CStr) -> bool {
    layers.iter().any(|layer| {
        // Safety: the loader fills layer_name with a NUL-terminated string
        let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
        name == wanted
    })
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, queue_count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count,
            ..Default::default()
        }
    }

    fn layer(name: &str) -> vk::LayerProperties {
        let mut properties = vk::LayerProperties::default();
        for (dst, &byte) in properties.layer_name.iter_mut().zip(name.as_bytes()) {
            *dst = byte as std::ffi::c_char;
        }
        properties
    }

    #[test]
    fn validation_layer_is_found_by_exact_name() {
        let installed = [layer("VK_LAYER_MESA_device_select"), layer("VK_LAYER_KHRONOS_validation")];
        assert!(layer_listed(&installed, VALIDATION_LAYER));

        let missing = [layer("VK_LAYER_KHRONOS_validation_extra"), layer("VK_LAYER_LUNARG_monitor")];
        assert!(!layer_listed(&missing, VALIDATION_LAYER));
        assert!(!layer_listed(&[], VALIDATION_LAYER));
    }

    const ALL: vk::QueueFlags = vk::QueueFlags::from_raw(
        vk::QueueFlags::GRAPHICS.as_raw()
            | vk::QueueFlags::COMPUTE.as_raw()
            | vk::QueueFlags::TRANSFER.as_raw(),
    );

    #[test]
    fn dedicated_families_are_preferred() {
        let families = [
            family(ALL, 16),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 8),
            family(vk::QueueFlags::TRANSFER, 2),
        ];

        let selected = select_queue_families(&families).unwrap();

        assert_eq!(selected.graphics, QueueSlot { family: 0, index: 0 });
        assert_eq!(selected.compute, QueueSlot { family: 1, index: 0 });
        assert_eq!(selected.transfer, QueueSlot { family: 2, index: 0 });
        assert_eq!(selected.unique_families(), vec![0, 1, 2]);
    }

    #[test]
    fn single_family_hands_out_separate_queues() {
        let selected = select_queue_families(&[family(ALL, 4)]).unwrap();

        assert_eq!(selected.graphics.index, 0);
        assert_eq!(selected.compute.index, 1);
        assert_eq!(selected.transfer.index, 2);
        assert_eq!(selected.queue_counts(), vec![(0, 3)]);
    }

    #[test]
    fn single_queue_is_shared_by_every_role() {
        let selected = select_queue_families(&[family(ALL, 1)]).unwrap();

        assert_eq!(selected.graphics, selected.compute);
        assert_eq!(selected.compute, selected.transfer);
        assert_eq!(selected.queue_counts(), vec![(0, 1)]);
    }

    #[test]
    fn transfer_falls_back_to_compute_family() {
        let families = [family(ALL, 1), family(vk::QueueFlags::COMPUTE, 2)];

        let selected = select_queue_families(&families).unwrap();

        assert_eq!(selected.compute, QueueSlot { family: 1, index: 0 });
        assert_eq!(selected.transfer, QueueSlot { family: 1, index: 1 });
    }

    #[test]
    fn missing_graphics_is_an_error() {
        let families = [family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 4)];

        assert_eq!(
            select_queue_families(&families),
            Err(QueueSelectionError::NoGraphicsQueue)
        );
    }

    #[test]
    fn empty_families_are_skipped() {
        let families = [family(vk::QueueFlags::GRAPHICS, 0), family(ALL, 1)];

        let selected = select_queue_families(&families).unwrap();

        assert_eq!(selected.graphics.family, 1);
    }

    #[test]
    fn memory_type_respects_filter_and_flags() {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 3,
            ..Default::default()
        };
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        props.memory_types[2].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL
            | vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT;

        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(find_memory_type(&props, u32::MAX, host), Some(1));
        assert_eq!(find_memory_type(&props, 0b100, host), Some(2));
        assert_eq!(
            find_memory_type(&props, u32::MAX, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(0)
        );
        assert_eq!(find_memory_type(&props, 0b010, vk::MemoryPropertyFlags::DEVICE_LOCAL), None);
    }
}
