use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};
use vkrt_gpu::{ash::vk, AccelerationStructure, RayTracingDevice, ResidentBuffer};

use crate::{BuildSettings, Error, Result};

/// Per-vertex shading data, read by the hit shaders through its device address.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct VertexAttribute {
    pub normal: Vec4,
    pub tex_coord: Vec4,
}

/// Host side geometry of one mesh, before upload.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshData {
    pub name: String,
    pub positions: Vec<Vec3>,
    /// Either empty or one entry per position. Empty attributes are zero filled.
    pub attributes: Vec<VertexAttribute>,
    /// Triangle list.
    pub indices: Vec<u32>,
    pub material_id: u32,
    pub color: Vec4,
    pub transform: Mat4,
}

impl Default for MeshData {
    fn default() -> Self {
        Self {
            name: String::new(),
            positions: Vec::new(),
            attributes: Vec::new(),
            indices: Vec::new(),
            material_id: 0,
            color: Vec4::ONE,
            transform: Mat4::IDENTITY,
        }
    }
}

impl MeshData {
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Each triangle's indices padded to a `uvec4`.
    pub fn faces(&self) -> Vec<u32> {
        self.indices
            .chunks_exact(3)
            .flat_map(|triangle| [triangle[0], triangle[1], triangle[2], 0])
            .collect()
    }

    fn validate(&self) -> Result<()> {
        if self.positions.is_empty() || self.indices.is_empty() {
            return Err(Error::EmptyGeometry {
                name: self.name.clone(),
            });
        }
        if self.indices.len() % 3 != 0 {
            return Err(Error::MalformedIndices {
                name: self.name.clone(),
                count: self.indices.len(),
            });
        }
        if let Some(&index) = self
            .indices
            .iter()
            .find(|&&index| index as usize >= self.positions.len())
        {
            return Err(Error::IndexOutOfRange {
                name: self.name.clone(),
                index,
                vertices: self.positions.len(),
            });
        }
        if !self.attributes.is_empty() && self.attributes.len() != self.positions.len() {
            return Err(Error::AttributeCountMismatch {
                name: self.name.clone(),
                vertices: self.positions.len(),
                attributes: self.attributes.len(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshKind {
    Opaque,
    /// Glass-like meshes that shadow and occlusion rays may want to ignore.
    NonOpaque,
}

impl MeshKind {
    pub fn classify(name: &str, settings: &BuildSettings) -> Self {
        if !settings.non_opaque_name_pattern.is_empty()
            && name.contains(&settings.non_opaque_name_pattern)
        {
            MeshKind::NonOpaque
        } else {
            MeshKind::Opaque
        }
    }
}

/// Device addresses of everything a mesh uploaded. Immutable once uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryRecord {
    pub position_address: vk::DeviceAddress,
    pub index_address: vk::DeviceAddress,
    pub face_address: vk::DeviceAddress,
    pub attribute_address: vk::DeviceAddress,
    pub material_id_address: vk::DeviceAddress,
    pub color_address: vk::DeviceAddress,
    pub vertex_count: u32,
    pub triangle_count: u32,
}

/// A mesh whose geometry lives in device buffers.
pub struct Mesh {
    name: String,
    kind: MeshKind,
    material_id: u32,
    transform: Mat4,
    geometry: GeometryRecord,
    positions: ResidentBuffer,
    indices: ResidentBuffer,
    faces: ResidentBuffer,
    attributes: ResidentBuffer,
    material_ids: ResidentBuffer,
    color: ResidentBuffer,
    bottom_level: Option<AccelerationStructure>,
}

impl std::fmt::Debug for Mesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mesh")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("geometry", &self.geometry)
            .field("bottom_level", &self.bottom_level)
            .finish()
    }
}

impl Mesh {
    pub fn upload(
        device: &Arc<dyn RayTracingDevice>,
        data: &MeshData,
        settings: &BuildSettings,
    ) -> Result<Self> {
        data.validate()?;
        let build_input = vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;

        let positions = ResidentBuffer::upload(
            device.clone(),
            vk::BufferUsageFlags::VERTEX_BUFFER | build_input,
            None,
            bytemuck::cast_slice(&data.positions),
        )?;
        let indices = ResidentBuffer::upload(
            device.clone(),
            vk::BufferUsageFlags::INDEX_BUFFER | build_input,
            None,
            bytemuck::cast_slice(&data.indices),
        )?;
        let faces = ResidentBuffer::upload(
            device.clone(),
            vk::BufferUsageFlags::INDEX_BUFFER
                | vk::BufferUsageFlags::STORAGE_BUFFER
                | build_input,
            None,
            bytemuck::cast_slice(&data.faces()),
        )?;

        let zeroed;
        let attributes: &[VertexAttribute] = if data.attributes.is_empty() {
            zeroed = vec![VertexAttribute::default(); data.positions.len()];
            &zeroed
        } else {
            &data.attributes
        };
        let attributes = ResidentBuffer::upload(
            device.clone(),
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            None,
            bytemuck::cast_slice(attributes),
        )?;

        let material_ids = vec![data.material_id; data.triangle_count()];
        let material_ids = ResidentBuffer::upload(
            device.clone(),
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            None,
            bytemuck::cast_slice(&material_ids),
        )?;
        let color = ResidentBuffer::upload(
            device.clone(),
            vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::UNIFORM_BUFFER
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            None,
            bytemuck::bytes_of(&data.color),
        )?;

        let geometry = GeometryRecord {
            position_address: positions.device_address(),
            index_address: indices.device_address(),
            face_address: faces.device_address(),
            attribute_address: attributes.device_address(),
            material_id_address: material_ids.device_address(),
            color_address: color.device_address(),
            vertex_count: data.positions.len() as u32,
            triangle_count: data.triangle_count() as u32,
        };
        let kind = MeshKind::classify(&data.name, settings);
        tracing::debug!(
            name = %data.name,
            ?kind,
            vertices = geometry.vertex_count,
            triangles = geometry.triangle_count,
            "uploaded mesh"
        );
        Ok(Self {
            name: data.name.clone(),
            kind,
            material_id: data.material_id,
            transform: data.transform,
            geometry,
            positions,
            indices,
            faces,
            attributes,
            material_ids,
            color,
            bottom_level: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn kind(&self) -> MeshKind {
        self.kind
    }
    pub fn material_id(&self) -> u32 {
        self.material_id
    }
    pub fn transform(&self) -> Mat4 {
        self.transform
    }
    pub fn set_transform(&mut self, transform: Mat4) {
        self.transform = transform;
    }
    pub fn geometry(&self) -> &GeometryRecord {
        &self.geometry
    }
    pub fn position_buffer(&self) -> &ResidentBuffer {
        &self.positions
    }
    pub fn index_buffer(&self) -> &ResidentBuffer {
        &self.indices
    }
    pub fn face_buffer(&self) -> &ResidentBuffer {
        &self.faces
    }
    pub fn attribute_buffer(&self) -> &ResidentBuffer {
        &self.attributes
    }
    pub fn material_id_buffer(&self) -> &ResidentBuffer {
        &self.material_ids
    }
    pub fn color_buffer(&self) -> &ResidentBuffer {
        &self.color
    }
    /// Filled in by [`crate::BlasBuilder::build`].
    pub fn bottom_level(&self) -> Option<&AccelerationStructure> {
        self.bottom_level.as_ref()
    }
    pub(crate) fn set_bottom_level(&mut self, accel_struct: AccelerationStructure) {
        self.bottom_level = Some(accel_struct);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{mock_device, quad};
    use vkrt_gpu::{mock::MockDevice, MemoryLocation};

    #[test]
    fn test_faces_are_padded_to_four() {
        let data = quad("Floor");
        assert_eq!(data.faces(), vec![0, 1, 2, 0, 0, 2, 3, 0]);
    }

    #[test]
    fn test_upload_writes_every_buffer() {
        let mock = Arc::new(MockDevice::new());
        let device: Arc<dyn RayTracingDevice> = mock.clone();
        let mut data = quad("Floor");
        data.material_id = 7;
        let mesh = Mesh::upload(&device, &data, &BuildSettings::default()).unwrap();

        assert_eq!(mock.counts().buffers_created, 6);
        assert!(mock
            .created_buffers()
            .iter()
            .all(|info| info.location == MemoryLocation::HostUpload));
        assert_eq!(mesh.geometry().vertex_count, 4);
        assert_eq!(mesh.geometry().triangle_count, 2);

        let material_ids = mock.buffer_contents(mesh.material_id_buffer().raw()).unwrap();
        let material_ids: Vec<u32> = material_ids
            .chunks_exact(4)
            .map(|bytes| u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            .collect();
        assert_eq!(material_ids, vec![7, 7]);
        let positions = mock.buffer_contents(mesh.position_buffer().raw()).unwrap();
        assert_eq!(positions.len(), 4 * 12);
        let attributes = mock.buffer_contents(mesh.attribute_buffer().raw()).unwrap();
        assert_eq!(attributes.len(), 4 * std::mem::size_of::<VertexAttribute>());
        assert!(attributes.iter().all(|&byte| byte == 0));
        assert_ne!(mesh.geometry().position_address, 0);

        drop(mesh);
        assert_eq!(mock.counts().live_buffers(), 0);
    }

    #[test]
    fn test_upload_rejects_malformed_geometry() {
        let device = mock_device();
        let settings = BuildSettings::default();

        let empty = MeshData {
            name: "Empty".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            Mesh::upload(&device, &empty, &settings),
            Err(Error::EmptyGeometry { .. })
        ));

        let mut partial = quad("Partial");
        partial.indices.pop();
        assert!(matches!(
            Mesh::upload(&device, &partial, &settings),
            Err(Error::MalformedIndices { count: 5, .. })
        ));

        let mut out_of_range = quad("OutOfRange");
        out_of_range.indices[5] = 99;
        assert!(matches!(
            Mesh::upload(&device, &out_of_range, &settings),
            Err(Error::IndexOutOfRange {
                index: 99,
                vertices: 4,
                ..
            })
        ));

        let mut mismatched = quad("Mismatched");
        mismatched.attributes = vec![VertexAttribute::default(); 3];
        assert!(matches!(
            Mesh::upload(&device, &mismatched, &settings),
            Err(Error::AttributeCountMismatch { .. })
        ));
    }

    #[test]
    fn test_classify_by_name() {
        let settings = BuildSettings::default();
        assert_eq!(MeshKind::classify("Window_02", &settings), MeshKind::NonOpaque);
        assert_eq!(MeshKind::classify("window", &settings), MeshKind::Opaque);
        assert_eq!(MeshKind::classify("Wall", &settings), MeshKind::Opaque);

        let disabled = BuildSettings {
            non_opaque_name_pattern: String::new(),
            ..Default::default()
        };
        assert_eq!(MeshKind::classify("Window", &disabled), MeshKind::Opaque);
    }
}
