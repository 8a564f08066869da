use std::ffi::{CStr, CString};

use ash::vk;

/// One pipeline stage of a ray tracing pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderStage {
    pub stage: vk::ShaderStageFlags,
    pub module: vk::ShaderModule,
    pub entry_point: CString,
}

impl ShaderStage {
    pub fn new(stage: vk::ShaderStageFlags, module: vk::ShaderModule) -> Self {
        Self {
            stage,
            module,
            entry_point: CString::from(crate::cstr!("main")),
        }
    }
    pub fn raygen(module: vk::ShaderModule) -> Self {
        Self::new(vk::ShaderStageFlags::RAYGEN_KHR, module)
    }
    pub fn miss(module: vk::ShaderModule) -> Self {
        Self::new(vk::ShaderStageFlags::MISS_KHR, module)
    }
    pub fn closest_hit(module: vk::ShaderModule) -> Self {
        Self::new(vk::ShaderStageFlags::CLOSEST_HIT_KHR, module)
    }
    pub fn any_hit(module: vk::ShaderModule) -> Self {
        Self::new(vk::ShaderStageFlags::ANY_HIT_KHR, module)
    }
    pub fn intersection(module: vk::ShaderModule) -> Self {
        Self::new(vk::ShaderStageFlags::INTERSECTION_KHR, module)
    }
    pub fn with_entry_point(mut self, entry_point: &CStr) -> Self {
        self.entry_point = entry_point.to_owned();
        self
    }

    /// Raw stage info. Points into `self.entry_point`, so `self` must outlive
    /// the pipeline creation call.
    pub fn to_raw(&self) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo {
            stage: self.stage,
            module: self.module,
            p_name: self.entry_point.as_ptr(),
            ..Default::default()
        }
    }
}

/// A shader group referencing stages by their index in the stage list.
/// Unused slots hold `vk::SHADER_UNUSED_KHR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderGroup {
    pub ty: vk::RayTracingShaderGroupTypeKHR,
    pub general_shader: u32,
    pub closest_hit_shader: u32,
    pub any_hit_shader: u32,
    pub intersection_shader: u32,
}

impl ShaderGroup {
    /// Raygen, miss and callable groups.
    pub fn general(stage_index: u32) -> Self {
        Self {
            ty: vk::RayTracingShaderGroupTypeKHR::GENERAL,
            general_shader: stage_index,
            closest_hit_shader: vk::SHADER_UNUSED_KHR,
            any_hit_shader: vk::SHADER_UNUSED_KHR,
            intersection_shader: vk::SHADER_UNUSED_KHR,
        }
    }
    pub fn triangles_hit_group(closest_hit_shader: u32, any_hit_shader: u32) -> Self {
        Self {
            ty: vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
            general_shader: vk::SHADER_UNUSED_KHR,
            closest_hit_shader,
            any_hit_shader,
            intersection_shader: vk::SHADER_UNUSED_KHR,
        }
    }
    pub fn procedural_hit_group(
        closest_hit_shader: u32,
        any_hit_shader: u32,
        intersection_shader: u32,
    ) -> Self {
        Self {
            ty: vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP,
            general_shader: vk::SHADER_UNUSED_KHR,
            closest_hit_shader,
            any_hit_shader,
            intersection_shader,
        }
    }
    pub fn to_raw(&self) -> vk::RayTracingShaderGroupCreateInfoKHR {
        vk::RayTracingShaderGroupCreateInfoKHR {
            ty: self.ty,
            general_shader: self.general_shader,
            closest_hit_shader: self.closest_hit_shader,
            any_hit_shader: self.any_hit_shader,
            intersection_shader: self.intersection_shader,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_entry_point_is_main() {
        let stage = ShaderStage::miss(vk::ShaderModule::null());
        assert_eq!(stage.entry_point.as_bytes(), b"main");
        assert_eq!(stage.to_raw().stage, vk::ShaderStageFlags::MISS_KHR);
    }

    #[test]
    fn test_general_group_leaves_hit_slots_unused() {
        let raw = ShaderGroup::general(3).to_raw();
        assert_eq!(raw.general_shader, 3);
        assert_eq!(raw.closest_hit_shader, vk::SHADER_UNUSED_KHR);
        assert_eq!(raw.any_hit_shader, vk::SHADER_UNUSED_KHR);
        assert_eq!(raw.intersection_shader, vk::SHADER_UNUSED_KHR);
    }
}
