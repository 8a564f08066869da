use std::collections::VecDeque;

use glam::Mat4;

use crate::MeshData;

/// A node of an imported scene graph, referencing meshes by index.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneNode {
    pub name: String,
    /// Local transform of this node.
    pub transform: Mat4,
    pub meshes: Vec<usize>,
    pub children: Vec<SceneNode>,
}

impl Default for SceneNode {
    fn default() -> Self {
        Self {
            name: String::new(),
            transform: Mat4::IDENTITY,
            meshes: Vec::new(),
            children: Vec::new(),
        }
    }
}

impl SceneNode {
    pub fn new(name: impl Into<String>, transform: Mat4) -> Self {
        Self {
            name: name.into(),
            transform,
            ..Default::default()
        }
    }
    pub fn with_meshes(mut self, meshes: impl IntoIterator<Item = usize>) -> Self {
        self.meshes.extend(meshes);
        self
    }
    pub fn with_child(mut self, child: SceneNode) -> Self {
        self.children.push(child);
        self
    }
}

/// Visits the graph breadth first and assigns each node's local transform to
/// the meshes it references. A mesh referenced by several nodes keeps the
/// transform of the last node visited. Out of range mesh indices are skipped.
pub fn apply_node_transforms(root: &SceneNode, meshes: &mut [MeshData]) {
    let mut queue = VecDeque::from([root]);
    while let Some(node) = queue.pop_front() {
        for &index in &node.meshes {
            match meshes.get_mut(index) {
                Some(mesh) => mesh.transform = node.transform,
                None => tracing::warn!(node = %node.name, index, "node references a missing mesh"),
            }
        }
        queue.extend(node.children.iter());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn meshes(count: usize) -> Vec<MeshData> {
        (0..count)
            .map(|i| MeshData {
                name: format!("mesh{i}"),
                ..Default::default()
            })
            .collect()
    }

    #[test]
    fn test_last_visited_node_wins() {
        let a = Mat4::from_translation(Vec3::X);
        let a1 = Mat4::from_translation(Vec3::Y);
        let b = Mat4::from_translation(Vec3::Z);
        let root = SceneNode::default()
            .with_child(
                SceneNode::new("a", a)
                    .with_meshes([0])
                    .with_child(SceneNode::new("a1", a1).with_meshes([0])),
            )
            .with_child(SceneNode::new("b", b).with_meshes([0, 1]));

        let mut meshes = meshes(3);
        apply_node_transforms(&root, &mut meshes);
        // Breadth first: a, b, a1.
        assert_eq!(meshes[0].transform, a1);
        assert_eq!(meshes[1].transform, b);
        assert_eq!(meshes[2].transform, Mat4::IDENTITY);
    }

    #[test]
    fn test_transforms_are_not_accumulated() {
        let parent = Mat4::from_scale(Vec3::splat(2.0));
        let child = Mat4::from_translation(Vec3::X);
        let root = SceneNode::new("parent", parent)
            .with_child(SceneNode::new("child", child).with_meshes([0]));
        let mut meshes = meshes(1);
        apply_node_transforms(&root, &mut meshes);
        assert_eq!(meshes[0].transform, child);
    }

    #[test]
    fn test_missing_mesh_is_skipped() {
        let root = SceneNode::new("root", Mat4::from_translation(Vec3::X)).with_meshes([0, 5]);
        let mut meshes = meshes(1);
        apply_node_transforms(&root, &mut meshes);
        assert_eq!(meshes[0].transform, root.transform);
    }
}
