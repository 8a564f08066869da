use serde::{Deserialize, Serialize};
use vkrt_gpu::ash::vk;

/// Knobs shared by the bottom and top level builders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    /// Meshes whose name contains this substring are treated as non-opaque.
    pub non_opaque_name_pattern: String,
    /// Visibility mask of ordinary instances.
    pub opaque_mask: u8,
    /// Visibility mask of non-opaque instances, so rays can skip them.
    pub non_opaque_mask: u8,
    pub prefer_fast_trace: bool,
    /// Disables back face culling on every instance.
    pub cull_disable: bool,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            non_opaque_name_pattern: "Window".to_string(),
            opaque_mask: 0x01,
            non_opaque_mask: 0x02,
            prefer_fast_trace: true,
            cull_disable: true,
        }
    }
}

impl BuildSettings {
    pub fn build_flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        if self.prefer_fast_trace {
            vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
        } else {
            vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD
        }
    }
    pub fn instance_flags(&self) -> vk::GeometryInstanceFlagsKHR {
        if self.cull_disable {
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE
        } else {
            vk::GeometryInstanceFlagsKHR::empty()
        }
    }
}
