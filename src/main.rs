use std::{
    ffi::CString,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use vkrt::{
    config::{Config, ShaderPaths},
    gpu::{
        vulkan::{
            InstanceCreateInfo, PipelineLayout, RayTracingPipeline, ShaderModule, VulkanDevice,
        },
        RayTracingDevice, ShaderStage,
    },
    scene::ShaderBindingTable,
};

fn load_shader(device: &Arc<VulkanDevice>, path: &Path) -> anyhow::Result<ShaderModule> {
    let bytes =
        std::fs::read(path).with_context(|| format!("reading shader {}", path.display()))?;
    ShaderModule::from_spirv_bytes(device.clone(), &bytes)
        .with_context(|| format!("loading shader {}", path.display()))
}

/// Creates the ray tracing pipeline with one hit group and bakes its shader
/// binding table.
fn bake_shader_binding_table(
    device: &Arc<VulkanDevice>,
    shaders: &ShaderPaths,
) -> anyhow::Result<(RayTracingPipeline, ShaderBindingTable)> {
    let raygen = load_shader(device, &shaders.raygen)?;
    let closest_hit = load_shader(device, &shaders.closest_hit)?;
    let any_hit = shaders
        .any_hit
        .as_ref()
        .map(|path| load_shader(device, path))
        .transpose()?;
    let miss = shaders
        .miss
        .iter()
        .map(|path| load_shader(device, path))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut sbt = ShaderBindingTable::new(device.clone());
    sbt.initialize_for_device(1, miss.len() as u32)?;
    sbt.set_raygen_stage(ShaderStage::raygen(raygen.raw()))?;
    let mut hit_stages = vec![ShaderStage::closest_hit(closest_hit.raw())];
    hit_stages.extend(any_hit.as_ref().map(|module| ShaderStage::any_hit(module.raw())));
    sbt.add_stage_to_hit_group(hit_stages, 0)?;
    for (i, module) in miss.iter().enumerate() {
        sbt.add_stage_to_miss_group(ShaderStage::miss(module.raw()), i as u32)?;
    }

    let layout = PipelineLayout::new(device.clone(), &[], &[])?;
    let pipeline = RayTracingPipeline::new(
        device.clone(),
        &sbt.stages(),
        &sbt.groups(),
        &layout,
        shaders.max_recursion_depth,
    )?;
    sbt.create_sbt(pipeline.raw())?;
    Ok((pipeline, sbt))
}

fn main() -> anyhow::Result<()> {
    vkrt_log::init();
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    let device = VulkanDevice::create(&InstanceCreateInfo {
        application_name: CString::new(config.application_name.clone())?,
        enable_validation: config.validation,
        ..Default::default()
    })
    .context("creating the Vulkan device")?;
    let properties = device.ray_tracing_properties();
    tracing::info!(
        device = %device.physical_device().device_name(),
        handle_size = properties.shader_group_handle_size,
        handle_alignment = properties.shader_group_base_alignment,
        "using device"
    );

    let scene = vkrt::prepare_scene(device.clone(), &config)?;

    if let Some(shaders) = &config.shaders {
        let (_pipeline, sbt) = bake_shader_binding_table(&device, shaders)
            .context("baking the shader binding table")?;
        let [raygen, miss, hit, _callable] = sbt.regions()?;
        tracing::info!(
            raygen = raygen.device_address,
            miss = miss.device_address,
            hit = hit.device_address,
            stride = sbt.group_stride(),
            "shader binding table ready"
        );
    }

    tracing::info!(
        tlas = scene.tlas.device_address(),
        instances = scene.tlas.instance_count(),
        "ready for dispatch"
    );
    Ok(())
}
