//! Prepares a scene for hardware ray tracing: uploads mesh geometry, builds
//! one bottom level acceleration structure per mesh and the top level
//! structure over all of them.

use std::sync::Arc;

use anyhow::Context;

pub use vkrt_gpu as gpu;
pub use vkrt_scene as scene;

pub mod config;
pub mod procedural;

use config::Config;
use vkrt_gpu::RayTracingDevice;
use vkrt_scene::{apply_node_transforms, BlasBuilder, Mesh, TopLevelAccelerationStructure};

/// Every structure a ray dispatch needs, kept alive together.
pub struct PreparedScene {
    pub meshes: Vec<Mesh>,
    pub tlas: TopLevelAccelerationStructure,
}

pub fn prepare_scene(
    device: Arc<dyn RayTracingDevice>,
    config: &Config,
) -> anyhow::Result<PreparedScene> {
    let (mut data, root) = procedural::scene(&config.scene);
    apply_node_transforms(&root, &mut data);

    let mut meshes = data
        .iter()
        .map(|data| Mesh::upload(&device, data, &config.build))
        .collect::<Result<Vec<_>, _>>()
        .context("uploading mesh geometry")?;
    BlasBuilder::new(device.clone(), config.build.clone())
        .build(&mut meshes)
        .context("building bottom level acceleration structures")?;

    let mut tlas = TopLevelAccelerationStructure::new(device, config.build.clone());
    tlas.build(&meshes)
        .context("building the top level acceleration structure")?;
    tracing::info!(
        meshes = meshes.len(),
        tlas = tlas.device_address(),
        "scene prepared"
    );
    Ok(PreparedScene { meshes, tlas })
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::SceneConfig;
    use vkrt_gpu::mock::{FailurePoint, MockDevice};

    #[test]
    fn test_prepare_scene() {
        let mock = Arc::new(MockDevice::new());
        let config = Config::default();
        let scene = prepare_scene(mock.clone(), &config).unwrap();

        let mesh_count = 2 + config.scene.cube_count as usize;
        assert_eq!(scene.meshes.len(), mesh_count);
        assert_eq!(scene.tlas.instance_count(), mesh_count);
        assert_ne!(scene.tlas.device_address(), 0);
        assert_eq!(mock.counts().submissions, 2);
        assert_eq!(mock.counts().live_accel_structs(), mesh_count + 1);

        drop(scene);
        let counts = mock.counts();
        assert_eq!(counts.live_buffers(), 0);
        assert_eq!(counts.live_accel_structs(), 0);
    }

    #[test]
    fn test_prepare_scene_reports_device_failure() {
        let mock = Arc::new(MockDevice::new());
        mock.fail_on(FailurePoint::SizeQuery);
        let config = Config {
            scene: SceneConfig {
                cube_count: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let error = prepare_scene(mock.clone(), &config).err().unwrap();
        assert!(format!("{error:#}").contains("bottom level"));
        assert_eq!(mock.counts().live_buffers(), 0);
    }
}
