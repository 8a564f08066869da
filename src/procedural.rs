//! A small generated scene, standing in for an imported one.

use glam::{Mat4, Vec3, Vec4};
use vkrt_scene::{MeshData, SceneNode, VertexAttribute};

use crate::config::SceneConfig;

pub const GROUND_MATERIAL: u32 = 0;
pub const CUBE_MATERIAL: u32 = 1;
pub const GLASS_MATERIAL: u32 = 2;

fn push_quad(data: &mut MeshData, center: Vec3, normal: Vec3, u: Vec3, v: Vec3) {
    let base = data.positions.len() as u32;
    let corners: [(f32, f32); 4] = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];
    for (s, t) in corners {
        data.positions.push(center + u * s + v * t);
        data.attributes.push(VertexAttribute {
            normal: normal.extend(0.0),
            tex_coord: Vec4::new((s + 1.0) * 0.5, (t + 1.0) * 0.5, 0.0, 0.0),
        });
    }
    data.indices.extend([base, base + 1, base + 2, base, base + 2, base + 3]);
}

/// A square in the XZ plane facing +Y.
pub fn plane(name: &str, size: f32) -> MeshData {
    let mut data = MeshData {
        name: name.to_string(),
        material_id: GROUND_MATERIAL,
        color: Vec4::new(0.6, 0.6, 0.6, 1.0),
        ..Default::default()
    };
    let half = size * 0.5;
    push_quad(&mut data, Vec3::ZERO, Vec3::Y, Vec3::X * half, Vec3::Z * half);
    data
}

/// An axis aligned cube centered on the origin, with per-face normals.
pub fn cube(name: &str, size: f32) -> MeshData {
    let mut data = MeshData {
        name: name.to_string(),
        material_id: CUBE_MATERIAL,
        color: Vec4::new(0.8, 0.3, 0.2, 1.0),
        ..Default::default()
    };
    let half = size * 0.5;
    for (normal, u) in [
        (Vec3::X, Vec3::Z),
        (Vec3::NEG_X, Vec3::Z),
        (Vec3::Y, Vec3::X),
        (Vec3::NEG_Y, Vec3::X),
        (Vec3::Z, Vec3::X),
        (Vec3::NEG_Z, Vec3::X),
    ] {
        let v = normal.cross(u);
        push_quad(&mut data, normal * half, normal, u * half, v * half);
    }
    data
}

/// A vertical pane in the XY plane facing +Z.
pub fn window(name: &str, width: f32, height: f32) -> MeshData {
    let mut data = MeshData {
        name: name.to_string(),
        material_id: GLASS_MATERIAL,
        color: Vec4::new(0.7, 0.85, 1.0, 0.3),
        ..Default::default()
    };
    push_quad(
        &mut data,
        Vec3::ZERO,
        Vec3::Z,
        Vec3::X * width * 0.5,
        Vec3::Y * height * 0.5,
    );
    data
}

/// Meshes in their local space and the graph placing them. Mesh 0 is the
/// ground, followed by the cubes and, if enabled, the window.
pub fn scene(config: &SceneConfig) -> (Vec<MeshData>, SceneNode) {
    let mut meshes = vec![plane("Ground", config.ground_size)];
    let mut root = SceneNode::new("Root", Mat4::IDENTITY)
        .with_child(SceneNode::new("Ground", Mat4::IDENTITY).with_meshes([0]));

    let mut cubes = SceneNode::new("Cubes", Mat4::IDENTITY);
    let first = -(config.cube_count.saturating_sub(1) as f32) * config.spacing * 0.5;
    for i in 0..config.cube_count {
        let index = meshes.len();
        meshes.push(cube(&format!("Cube_{i}"), config.cube_size));
        let translation = Vec3::new(
            first + i as f32 * config.spacing,
            config.cube_size * 0.5,
            0.0,
        );
        cubes = cubes.with_child(
            SceneNode::new(format!("Cube_{i}"), Mat4::from_translation(translation))
                .with_meshes([index]),
        );
    }
    root = root.with_child(cubes);

    if config.window {
        let index = meshes.len();
        let height = config.cube_size * 2.0;
        meshes.push(window("Window_Front", config.spacing, height));
        let translation = Vec3::new(0.0, height * 0.5, config.spacing);
        root = root.with_child(
            SceneNode::new("Window_Front", Mat4::from_translation(translation))
                .with_meshes([index]),
        );
    }
    (meshes, root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vkrt_scene::{apply_node_transforms, BuildSettings, MeshKind};

    #[test]
    fn test_cube_geometry() {
        let cube = cube("Cube", 2.0);
        assert_eq!(cube.positions.len(), 24);
        assert_eq!(cube.attributes.len(), 24);
        assert_eq!(cube.triangle_count(), 12);
        assert!(cube
            .positions
            .iter()
            .all(|p| p.abs().max_element() == 1.0));
        // Every face lies on the plane its normal points at.
        for (position, attribute) in cube.positions.iter().zip(&cube.attributes) {
            assert_eq!(position.dot(attribute.normal.truncate()), 1.0);
        }
    }

    #[test]
    fn test_scene_layout() {
        let config = SceneConfig {
            cube_count: 3,
            ..Default::default()
        };
        let (mut meshes, root) = scene(&config);
        assert_eq!(meshes.len(), 5);
        apply_node_transforms(&root, &mut meshes);

        assert_eq!(meshes[0].transform, Mat4::IDENTITY);
        let xs: Vec<f32> = meshes[1..4]
            .iter()
            .map(|mesh| mesh.transform.w_axis.x)
            .collect();
        assert_eq!(xs, vec![-3.0, 0.0, 3.0]);

        let settings = BuildSettings::default();
        let kinds: Vec<MeshKind> = meshes
            .iter()
            .map(|mesh| MeshKind::classify(&mesh.name, &settings))
            .collect();
        assert_eq!(kinds[4], MeshKind::NonOpaque);
        assert!(kinds[..4].iter().all(|&kind| kind == MeshKind::Opaque));
    }

    #[test]
    fn test_scene_without_cubes_or_window() {
        let config = SceneConfig {
            cube_count: 0,
            window: false,
            ..Default::default()
        };
        let (meshes, root) = scene(&config);
        assert_eq!(meshes.len(), 1);
        assert_eq!(root.children.len(), 2);
    }
}
