//! Scene preparation for hardware ray tracing: per-mesh device geometry,
//! bottom and top level acceleration structures, and the shader binding table.

mod blas;
mod error;
mod mesh;
mod node;
mod sbt;
mod settings;
mod tlas;

pub use blas::*;
pub use error::*;
pub use mesh::*;
pub use node::*;
pub use sbt::*;
pub use settings::*;
pub use tlas::*;

#[cfg(test)]
pub(crate) mod test_utils {
    use std::sync::Arc;

    use glam::Vec3;
    use vkrt_gpu::{mock::MockDevice, RayTracingDevice};

    use crate::{BlasBuilder, BuildSettings, Mesh, MeshData};

    pub fn mock_device() -> Arc<dyn RayTracingDevice> {
        Arc::new(MockDevice::new())
    }

    /// A unit quad made of two triangles.
    pub fn quad(name: &str) -> MeshData {
        MeshData {
            name: name.to_string(),
            positions: vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(1.0, 1.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
            ],
            indices: vec![0, 1, 2, 0, 2, 3],
            ..Default::default()
        }
    }

    /// A fan of `count` triangles.
    pub fn triangles(name: &str, count: u32) -> MeshData {
        let mut positions = vec![Vec3::ZERO];
        positions.extend((0..=count).map(|i| {
            let angle = i as f32 / count as f32 * std::f32::consts::PI;
            Vec3::new(angle.cos(), angle.sin(), 0.0)
        }));
        let indices = (1..=count).flat_map(|i| [0, i, i + 1]).collect();
        MeshData {
            name: name.to_string(),
            positions,
            indices,
            ..Default::default()
        }
    }

    pub fn upload_all(device: &Arc<dyn RayTracingDevice>, data: &[MeshData]) -> Vec<Mesh> {
        data.iter()
            .map(|data| Mesh::upload(device, data, &BuildSettings::default()).unwrap())
            .collect()
    }

    /// Uploads and builds the bottom level structure of every mesh.
    pub fn build_meshes(device: &Arc<dyn RayTracingDevice>, data: &[MeshData]) -> Vec<Mesh> {
        let mut meshes = upload_all(device, data);
        BlasBuilder::new(device.clone(), BuildSettings::default())
            .build(&mut meshes)
            .unwrap();
        meshes
    }
}
