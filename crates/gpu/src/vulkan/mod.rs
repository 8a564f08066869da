//! The `ash` + `vma` implementation of [`crate::RayTracingDevice`].

mod device;
mod instance;
mod physical_device;
mod pipeline;

pub use device::VulkanDevice;
pub use instance::{Instance, InstanceCreateInfo, Version};
pub use physical_device::{
    required_device_extensions, PhysicalDevice, PhysicalDeviceFeatures, PhysicalDeviceProperties,
};
pub use pipeline::{PipelineLayout, RayTracingPipeline, ShaderModule};
