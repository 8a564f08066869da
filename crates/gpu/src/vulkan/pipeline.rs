use std::sync::Arc;

use ash::vk;

use super::VulkanDevice;
use crate::{Result, ShaderGroup, ShaderStage};

pub struct ShaderModule {
    device: Arc<VulkanDevice>,
    module: vk::ShaderModule,
}

impl ShaderModule {
    /// Creates a shader module from SPIR-V bytes, as read from a `.spv` file.
    pub fn from_spirv_bytes(device: Arc<VulkanDevice>, bytes: &[u8]) -> Result<Self> {
        let code = ash::util::read_spv(&mut std::io::Cursor::new(bytes))?;
        let module = unsafe {
            device.device().create_shader_module(
                &vk::ShaderModuleCreateInfo {
                    code_size: std::mem::size_of_val(code.as_slice()),
                    p_code: code.as_ptr(),
                    ..Default::default()
                },
                None,
            )
        }?;
        Ok(Self { device, module })
    }
    pub fn raw(&self) -> vk::ShaderModule {
        self.module
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.device().destroy_shader_module(self.module, None);
        }
    }
}

pub struct PipelineLayout {
    device: Arc<VulkanDevice>,
    inner: vk::PipelineLayout,
}

impl PipelineLayout {
    pub fn new(
        device: Arc<VulkanDevice>,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<Self> {
        let info = vk::PipelineLayoutCreateInfo {
            set_layout_count: set_layouts.len() as u32,
            p_set_layouts: set_layouts.as_ptr(),
            push_constant_range_count: push_constant_ranges.len() as u32,
            p_push_constant_ranges: push_constant_ranges.as_ptr(),
            ..Default::default()
        };
        let inner = unsafe { device.device().create_pipeline_layout(&info, None)? };
        Ok(Self { device, inner })
    }
    pub fn raw(&self) -> vk::PipelineLayout {
        self.inner
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.device().destroy_pipeline_layout(self.inner, None);
        }
    }
}

pub struct RayTracingPipeline {
    device: Arc<VulkanDevice>,
    pipeline: vk::Pipeline,
}

impl RayTracingPipeline {
    /// Creates a pipeline from an ordered stage list and the groups indexing into it.
    pub fn new(
        device: Arc<VulkanDevice>,
        stages: &[ShaderStage],
        groups: &[ShaderGroup],
        layout: &PipelineLayout,
        max_recursion_depth: u32,
    ) -> Result<Self> {
        // `raw_stages` borrows the entry point names owned by `stages`.
        let raw_stages: Vec<vk::PipelineShaderStageCreateInfo> =
            stages.iter().map(ShaderStage::to_raw).collect();
        let raw_groups: Vec<vk::RayTracingShaderGroupCreateInfoKHR> =
            groups.iter().map(ShaderGroup::to_raw).collect();
        let info = vk::RayTracingPipelineCreateInfoKHR::builder()
            .stages(&raw_stages)
            .groups(&raw_groups)
            .max_pipeline_ray_recursion_depth(max_recursion_depth)
            .layout(layout.raw())
            .build();
        let mut pipeline = vk::Pipeline::null();
        unsafe {
            (device.rtx_loader().fp().create_ray_tracing_pipelines_khr)(
                device.device().handle(),
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                1,
                &info,
                std::ptr::null(),
                &mut pipeline,
            )
        }
        .result()?;
        tracing::info!(
            stages = stages.len(),
            groups = groups.len(),
            "created ray tracing pipeline"
        );
        Ok(Self { device, pipeline })
    }
    pub fn raw(&self) -> vk::Pipeline {
        self.pipeline
    }
}

impl Drop for RayTracingPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.device().destroy_pipeline(self.pipeline, None);
        }
    }
}
