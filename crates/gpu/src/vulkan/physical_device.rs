use std::{
    ffi::{c_void, CStr},
    sync::Arc,
};

use ash::{extensions::khr, vk};

use super::Instance;
use crate::{RayTracingProperties, Result};

/// Device extensions every ray tracing capable device has to expose.
pub fn required_device_extensions() -> [&'static CStr; 3] {
    [
        khr::AccelerationStructure::name(),
        khr::RayTracingPipeline::name(),
        khr::DeferredHostOperations::name(),
    ]
}

pub struct PhysicalDevice {
    instance: Arc<Instance>,
    physical_device: vk::PhysicalDevice,
    properties: Box<PhysicalDeviceProperties>,
    features: Box<PhysicalDeviceFeatures>,
    extensions: Vec<vk::ExtensionProperties>,
}

impl PhysicalDevice {
    pub fn enumerate(instance: &Arc<Instance>) -> Result<Vec<Self>> {
        // Safety: No Host Syncronization rules for vkEnumeratePhysicalDevices.
        let physical_devices = unsafe { instance.enumerate_physical_devices()? };
        physical_devices
            .into_iter()
            .map(|pdevice| -> Result<Self> {
                let extensions =
                    unsafe { instance.enumerate_device_extension_properties(pdevice)? };
                Ok(PhysicalDevice {
                    instance: instance.clone(),
                    physical_device: pdevice,
                    properties: PhysicalDeviceProperties::new(instance, pdevice),
                    features: PhysicalDeviceFeatures::new(instance, pdevice),
                    extensions,
                })
            })
            .collect()
    }
    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }
    pub fn raw(&self) -> vk::PhysicalDevice {
        self.physical_device
    }
    pub fn properties(&self) -> &PhysicalDeviceProperties {
        &self.properties
    }
    pub fn features(&self) -> &PhysicalDeviceFeatures {
        &self.features
    }
    pub fn device_name(&self) -> String {
        let name = &self.properties.inner.properties.device_name;
        // Safety: device_name is a null-terminated UTF-8 string of at most VK_MAX_PHYSICAL_DEVICE_NAME_SIZE.
        let bytes = unsafe { std::slice::from_raw_parts(name.as_ptr() as *const u8, name.len()) };
        CStr::from_bytes_until_nul(bytes)
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
    pub fn supports_extension(&self, name: &CStr) -> bool {
        self.extensions.iter().any(|ext| {
            // Safety: extension_name is null-terminated.
            unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) == name }
        })
    }
    pub fn supports_ray_tracing(&self) -> bool {
        required_device_extensions()
            .iter()
            .all(|name| self.supports_extension(name))
            && self.features.v12.buffer_device_address == vk::TRUE
            && self.features.acceleration_structure.acceleration_structure == vk::TRUE
            && self.features.ray_tracing.ray_tracing_pipeline == vk::TRUE
    }
    pub fn graphics_queue_family(&self) -> Option<u32> {
        let families = unsafe {
            self.instance
                .get_physical_device_queue_family_properties(self.physical_device)
        };
        families
            .iter()
            .position(|family| {
                family.queue_count > 0 && family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            })
            .map(|index| index as u32)
    }
    pub fn ray_tracing_properties(&self) -> RayTracingProperties {
        RayTracingProperties {
            shader_group_handle_size: self.properties.ray_tracing.shader_group_handle_size,
            shader_group_base_alignment: self.properties.ray_tracing.shader_group_base_alignment,
            min_acceleration_structure_scratch_offset_alignment: self
                .properties
                .acceleration_structure
                .min_acceleration_structure_scratch_offset_alignment,
        }
    }
}

pub struct PhysicalDeviceProperties {
    pub inner: vk::PhysicalDeviceProperties2,
    pub acceleration_structure: vk::PhysicalDeviceAccelerationStructurePropertiesKHR,
    pub ray_tracing: vk::PhysicalDeviceRayTracingPipelinePropertiesKHR,
}
unsafe impl Send for PhysicalDeviceProperties {}
unsafe impl Sync for PhysicalDeviceProperties {}
impl PhysicalDeviceProperties {
    fn new(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Box<Self> {
        let mut this = Box::pin(Self {
            inner: vk::PhysicalDeviceProperties2::default(),
            acceleration_structure: vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default(),
            ray_tracing: vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default(),
        });
        this.inner.p_next = &mut this.acceleration_structure as *mut _ as *mut c_void;
        this.acceleration_structure.p_next = &mut this.ray_tracing as *mut _ as *mut c_void;
        unsafe {
            instance.get_physical_device_properties2(physical_device, &mut this.inner);
        }
        std::pin::Pin::into_inner(this)
    }
}

/// Pinned behind a `Box`: the `p_next` chain points into the value itself.
#[derive(Default)]
pub struct PhysicalDeviceFeatures {
    pub inner: vk::PhysicalDeviceFeatures2,
    pub v12: vk::PhysicalDeviceVulkan12Features,
    pub acceleration_structure: vk::PhysicalDeviceAccelerationStructureFeaturesKHR,
    pub ray_tracing: vk::PhysicalDeviceRayTracingPipelineFeaturesKHR,
}
unsafe impl Send for PhysicalDeviceFeatures {}
unsafe impl Sync for PhysicalDeviceFeatures {}
impl PhysicalDeviceFeatures {
    pub(crate) fn fix_links(&mut self) {
        self.inner.p_next = &mut self.v12 as *mut _ as *mut c_void;
        self.v12.p_next = &mut self.acceleration_structure as *mut _ as *mut c_void;
        self.acceleration_structure.p_next = &mut self.ray_tracing as *mut _ as *mut c_void;
        self.ray_tracing.p_next = std::ptr::null_mut();
    }
    fn new(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Box<Self> {
        let mut this = Box::pin(Self::default());
        this.fix_links();
        unsafe {
            instance.get_physical_device_features2(physical_device, &mut this.inner);
        }
        std::pin::Pin::into_inner(this)
    }
    /// The minimal feature set the builders rely on.
    pub fn ray_tracing() -> Box<Self> {
        let mut this = Box::<Self>::default();
        this.v12.buffer_device_address = vk::TRUE;
        this.acceleration_structure.acceleration_structure = vk::TRUE;
        this.ray_tracing.ray_tracing_pipeline = vk::TRUE;
        this.fix_links();
        this
    }
}
