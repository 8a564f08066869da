use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use vkrt_gpu::{
    ash::vk, AccelerationStructure, AccelerationStructureType, BufferCreateInfo,
    BuildGeometryInfo, CommandList, GeometryData, MemoryLocation, RayTracingDevice,
    ResidentBuffer,
};

use crate::{BuildSettings, Error, Mesh, MeshKind, Result};

/// Instance arrays have to be 16 byte aligned.
const INSTANCE_ALIGNMENT: vk::DeviceSize = 16;

/// One instance of a bottom level structure in the top level structure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceRecord {
    /// A 3x4 row-major affine transformation matrix.
    pub transform: [f32; 12],
    /// 24 bits. The mesh ordinal.
    pub custom_index: u32,
    pub mask: u8,
    /// 24 bits.
    pub sbt_record_offset: u32,
    pub flags: vk::GeometryInstanceFlagsKHR,
    pub acceleration_structure_reference: vk::DeviceAddress,
}

/// `VkAccelerationStructureInstanceKHR` as plain old data.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct RawInstance {
    pub transform: [f32; 12],
    pub instance_custom_index_and_mask: u32,
    pub instance_shader_binding_table_record_offset_and_flags: u32,
    pub acceleration_structure_reference: u64,
}

const _: () = assert!(
    std::mem::size_of::<RawInstance>()
        == std::mem::size_of::<vk::AccelerationStructureInstanceKHR>()
);

fn pack_24_8(low_24: u32, high_8: u8) -> u32 {
    (low_24 & 0x00ff_ffff) | ((high_8 as u32) << 24)
}

/// Row-major upper 3x4 of `transform`.
pub fn affine_rows(transform: Mat4) -> [f32; 12] {
    let mut rows = [0.0; 12];
    rows.copy_from_slice(&transform.transpose().to_cols_array()[0..12]);
    rows
}

impl InstanceRecord {
    pub fn to_raw(&self) -> RawInstance {
        RawInstance {
            transform: self.transform,
            instance_custom_index_and_mask: pack_24_8(self.custom_index, self.mask),
            instance_shader_binding_table_record_offset_and_flags: pack_24_8(
                self.sbt_record_offset,
                self.flags.as_raw() as u8,
            ),
            acceleration_structure_reference: self.acceleration_structure_reference,
        }
    }
}

/// The scene root. Built from every mesh's bottom level structure.
pub struct TopLevelAccelerationStructure {
    device: Arc<dyn RayTracingDevice>,
    settings: BuildSettings,
    accel_struct: Option<AccelerationStructure>,
    instance_count: usize,
}

impl TopLevelAccelerationStructure {
    pub fn new(device: Arc<dyn RayTracingDevice>, settings: BuildSettings) -> Self {
        Self {
            device,
            settings,
            accel_struct: None,
            instance_count: 0,
        }
    }

    /// One record per mesh, in mesh order. Fails if any mesh has no built
    /// bottom level structure.
    pub fn instance_records(&self, meshes: &[Mesh]) -> Result<Vec<InstanceRecord>> {
        meshes
            .iter()
            .enumerate()
            .map(|(i, mesh)| {
                let reference = mesh
                    .bottom_level()
                    .map(AccelerationStructure::device_address)
                    .filter(|&address| address != 0)
                    .ok_or(Error::BottomLevelNotBuilt { mesh: i })?;
                let mask = match mesh.kind() {
                    MeshKind::Opaque => self.settings.opaque_mask,
                    MeshKind::NonOpaque => self.settings.non_opaque_mask,
                };
                Ok(InstanceRecord {
                    transform: affine_rows(mesh.transform()),
                    custom_index: i as u32,
                    mask,
                    // Every instance shares hit group 0.
                    sbt_record_offset: 0,
                    flags: self.settings.instance_flags(),
                    acceleration_structure_reference: reference,
                })
            })
            .collect()
    }

    /// Builds the structure over `meshes`, replacing the previous one.
    /// An empty list keeps the previous structure.
    pub fn build(&mut self, meshes: &[Mesh]) -> Result<()> {
        let records = self.instance_records(meshes)?;
        if records.is_empty() {
            tracing::warn!("no instances, keeping the previous top level acceleration structure");
            return Ok(());
        }
        let raw: Vec<RawInstance> = records.iter().map(InstanceRecord::to_raw).collect();
        let instances = ResidentBuffer::upload(
            self.device.clone(),
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            Some(INSTANCE_ALIGNMENT),
            bytemuck::cast_slice(&raw),
        )?;

        let info = BuildGeometryInfo {
            ty: AccelerationStructureType::TopLevel,
            flags: self.settings.build_flags(),
            geometry_flags: vk::GeometryFlagsKHR::OPAQUE,
            geometry: GeometryData::Instances {
                data: instances.device_address(),
            },
            primitive_count: records.len() as u32,
        };
        let sizes = self.device.acceleration_structure_build_sizes(&info)?;

        self.dispose();
        let mut accel_struct =
            AccelerationStructure::new_tlas(self.device.clone(), sizes.acceleration_structure_size)?;
        let scratch_alignment = self
            .device
            .ray_tracing_properties()
            .min_acceleration_structure_scratch_offset_alignment
            .max(1) as vk::DeviceSize;
        let scratch = ResidentBuffer::new(
            self.device.clone(),
            &BufferCreateInfo {
                size: sizes.build_scratch_size,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                location: MemoryLocation::DeviceLocal,
                alignment: Some(scratch_alignment),
            },
        )?;

        let mut commands = CommandList::new();
        commands.build_acceleration_structure(info, accel_struct.raw(), scratch.device_address());
        self.device.submit_and_wait(commands)?;
        let device_address = accel_struct.resolve_device_address();
        tracing::info!(
            instances = records.len(),
            size = sizes.acceleration_structure_size,
            device_address,
            "built top level acceleration structure"
        );

        self.accel_struct = Some(accel_struct);
        self.instance_count = records.len();
        drop(scratch);
        drop(instances);
        Ok(())
    }

    /// Releases the structure and its backing buffer.
    pub fn dispose(&mut self) {
        self.accel_struct = None;
        self.instance_count = 0;
    }

    pub fn acceleration_structure(&self) -> Option<&AccelerationStructure> {
        self.accel_struct.as_ref()
    }
    /// Zero until built.
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.accel_struct
            .as_ref()
            .map_or(0, AccelerationStructure::device_address)
    }
    pub fn instance_count(&self) -> usize {
        self.instance_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils::{build_meshes, quad, triangles, upload_all},
        BlasBuilder, MeshData,
    };
    use glam::Vec3;
    use vkrt_gpu::mock::{FailurePoint, MockDevice};

    fn parse_instances(bytes: &[u8]) -> Vec<RawInstance> {
        bytes
            .chunks_exact(std::mem::size_of::<RawInstance>())
            .map(bytemuck::pod_read_unaligned)
            .collect()
    }

    #[test]
    fn test_raw_instance_layout() {
        let record = InstanceRecord {
            transform: affine_rows(Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0))),
            custom_index: 5,
            mask: 0x02,
            sbt_record_offset: 0,
            flags: vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
            acceleration_structure_reference: 0xdead_beef_0000,
        };
        assert_eq!(
            record.transform,
            [1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 2.0, 0.0, 0.0, 1.0, 3.0]
        );
        let raw = record.to_raw();
        let bytes = bytemuck::bytes_of(&raw);
        assert_eq!(bytes.len(), 64);
        assert_eq!(&bytes[48..52], &[5, 0, 0, 0x02]);
        assert_eq!(&bytes[52..56], &[0, 0, 0, 0x01]);
        assert_eq!(&bytes[56..64], &0xdead_beef_0000u64.to_le_bytes());
    }

    #[test]
    fn test_custom_index_follows_mesh_order() {
        let mock = Arc::new(MockDevice::new());
        let device: Arc<dyn RayTracingDevice> = mock.clone();
        let meshes = build_meshes(
            &device,
            &[
                triangles("Wall", 3),
                triangles("Window_01", 1),
                triangles("Floor", 2),
                triangles("Roof", 5),
            ],
        );
        let mut tlas = TopLevelAccelerationStructure::new(device.clone(), BuildSettings::default());
        tlas.build(&meshes).unwrap();
        assert_eq!(tlas.instance_count(), 4);
        assert_ne!(tlas.device_address(), 0);
        assert!(mock.is_built(tlas.acceleration_structure().unwrap().raw()));

        let snapshots = mock.instance_snapshots();
        assert_eq!(snapshots.len(), 1);
        let instances = parse_instances(&snapshots[0]);
        assert_eq!(instances.len(), 4);
        for (i, (instance, mesh)) in instances.iter().zip(&meshes).enumerate() {
            assert_eq!(instance.instance_custom_index_and_mask & 0x00ff_ffff, i as u32);
            assert_eq!(
                instance.acceleration_structure_reference,
                mesh.bottom_level().unwrap().device_address()
            );
            assert_eq!(instance.instance_shader_binding_table_record_offset_and_flags & 0x00ff_ffff, 0);
        }
        let masks: Vec<u32> = instances
            .iter()
            .map(|instance| instance.instance_custom_index_and_mask >> 24)
            .collect();
        assert_eq!(masks, vec![0x01, 0x02, 0x01, 0x01]);
    }

    #[test]
    fn test_transform_is_row_major() {
        let device: Arc<dyn RayTracingDevice> = Arc::new(MockDevice::new());
        let mut data = quad("Floor");
        data.transform = Mat4::from_scale_rotation_translation(
            Vec3::splat(2.0),
            glam::Quat::IDENTITY,
            Vec3::new(4.0, 5.0, 6.0),
        );
        let meshes = build_meshes(&device, &[data]);
        let tlas = TopLevelAccelerationStructure::new(device, BuildSettings::default());
        let records = tlas.instance_records(&meshes).unwrap();
        assert_eq!(
            records[0].transform,
            [2.0, 0.0, 0.0, 4.0, 0.0, 2.0, 0.0, 5.0, 0.0, 0.0, 2.0, 6.0]
        );
    }

    #[test]
    fn test_unbuilt_bottom_level_is_rejected() {
        let mock = Arc::new(MockDevice::new());
        let device: Arc<dyn RayTracingDevice> = mock.clone();
        let mut meshes = build_meshes(&device, &[quad("a")]);
        meshes.extend(upload_all(&device, &[quad("b")]));
        let before = mock.counts();

        let mut tlas = TopLevelAccelerationStructure::new(device, BuildSettings::default());
        assert!(matches!(
            tlas.build(&meshes),
            Err(Error::BottomLevelNotBuilt { mesh: 1 })
        ));
        assert_eq!(mock.counts(), before);
        assert!(tlas.acceleration_structure().is_none());
    }

    #[test]
    fn test_empty_build_keeps_previous() {
        let mock = Arc::new(MockDevice::new());
        let device: Arc<dyn RayTracingDevice> = mock.clone();
        let meshes = build_meshes(&device, &[quad("a")]);
        let mut tlas = TopLevelAccelerationStructure::new(device, BuildSettings::default());

        tlas.build(&[]).unwrap();
        assert!(tlas.acceleration_structure().is_none());
        assert_eq!(tlas.device_address(), 0);

        tlas.build(&meshes).unwrap();
        let address = tlas.device_address();
        let submissions = mock.counts().submissions;
        tlas.build(&[]).unwrap();
        assert_eq!(tlas.device_address(), address);
        assert_eq!(tlas.instance_count(), 1);
        assert_eq!(mock.counts().submissions, submissions);
    }

    #[test]
    fn test_rebuild_replaces_structure() {
        let mock = Arc::new(MockDevice::new());
        let device: Arc<dyn RayTracingDevice> = mock.clone();
        let meshes = build_meshes(&device, &[quad("a"), quad("b")]);
        let mut tlas = TopLevelAccelerationStructure::new(device, BuildSettings::default());

        tlas.build(&meshes).unwrap();
        let first = tlas.acceleration_structure().unwrap().raw();
        tlas.build(&meshes[..1]).unwrap();
        let second = tlas.acceleration_structure().unwrap().raw();

        assert_ne!(first, second);
        assert_eq!(tlas.instance_count(), 1);
        // Two bottom level structures and the current top level one.
        assert_eq!(mock.counts().live_accel_structs(), 3);
        // Mesh buffers, bottom level backing buffers, top level backing buffer.
        assert_eq!(mock.counts().live_buffers(), 2 * 6 + 2 + 1);
    }

    #[test]
    fn test_failed_build_releases_temporaries() {
        let mock = Arc::new(MockDevice::new());
        let device: Arc<dyn RayTracingDevice> = mock.clone();
        let meshes = build_meshes(&device, &[quad("a")]);
        let before = mock.counts();

        mock.fail_on(FailurePoint::Submission);
        let mut tlas = TopLevelAccelerationStructure::new(device, BuildSettings::default());
        assert!(matches!(tlas.build(&meshes), Err(Error::Gpu(_))));
        assert!(tlas.acceleration_structure().is_none());
        assert_eq!(mock.counts().live_buffers(), before.live_buffers());
        assert_eq!(mock.counts().live_accel_structs(), before.live_accel_structs());
    }

    #[test]
    fn test_full_build_does_not_leak() {
        let mock = Arc::new(MockDevice::new());
        let device: Arc<dyn RayTracingDevice> = mock.clone();
        let data: Vec<MeshData> = (1..=5).map(|i| triangles(&format!("mesh{i}"), i)).collect();
        {
            let mut meshes = upload_all(&device, &data);
            BlasBuilder::new(device.clone(), BuildSettings::default())
                .build(&mut meshes)
                .unwrap();
            let mut tlas =
                TopLevelAccelerationStructure::new(device.clone(), BuildSettings::default());
            tlas.build(&meshes).unwrap();
            tlas.dispose();
            assert_eq!(mock.counts().live_accel_structs(), 5);
        }
        let counts = mock.counts();
        assert!(counts.buffers_created > 0);
        assert_eq!(counts.buffers_created, counts.buffers_destroyed);
        assert_eq!(counts.accel_structs_created, counts.accel_structs_destroyed);
        assert_eq!(counts.submissions, 2);
    }
}
