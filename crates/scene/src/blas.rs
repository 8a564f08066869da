use std::sync::Arc;

use vkrt_gpu::{
    ash::vk, AccelerationStructure, AccelerationStructureType, BufferCreateInfo,
    BuildGeometryInfo, BuildSizes, CommandList, GeometryData, MemoryBarrier, MemoryLocation,
    RayTracingDevice, ResidentBuffer,
};

use crate::{BuildSettings, GeometryRecord, Mesh, Result};

/// Builds one bottom level acceleration structure per mesh.
///
/// All builds of a batch are recorded into one command buffer and share one
/// scratch buffer sized to the largest requirement of the batch. Consecutive
/// builds are separated by a barrier since each of them reads and writes the
/// same scratch memory.
pub struct BlasBuilder {
    device: Arc<dyn RayTracingDevice>,
    settings: BuildSettings,
}

impl BlasBuilder {
    pub fn new(device: Arc<dyn RayTracingDevice>, settings: BuildSettings) -> Self {
        Self { device, settings }
    }

    pub fn geometry_info(&self, geometry: &GeometryRecord) -> BuildGeometryInfo {
        BuildGeometryInfo {
            ty: AccelerationStructureType::BottomLevel,
            flags: self.settings.build_flags(),
            geometry_flags: vk::GeometryFlagsKHR::OPAQUE,
            geometry: GeometryData::Triangles {
                vertex_data: geometry.position_address,
                vertex_stride: std::mem::size_of::<glam::Vec3>() as vk::DeviceSize,
                max_vertex: geometry.vertex_count.saturating_sub(1),
                vertex_format: vk::Format::R32G32B32_SFLOAT,
                index_data: geometry.index_address,
                index_type: vk::IndexType::UINT32,
            },
            primitive_count: geometry.triangle_count,
        }
    }

    /// The scratch size that fits every build of a batch.
    pub fn scratch_capacity(sizes: &[BuildSizes]) -> vk::DeviceSize {
        sizes
            .iter()
            .map(|size| size.build_scratch_size)
            .max()
            .unwrap_or(0)
    }

    /// Builds the bottom level structures of `meshes` and stores each one in
    /// its mesh. On error no mesh is modified.
    pub fn build(&self, meshes: &mut [Mesh]) -> Result<()> {
        if meshes.is_empty() {
            tracing::warn!("no meshes to build bottom level acceleration structures for");
            return Ok(());
        }
        let infos: Vec<BuildGeometryInfo> = meshes
            .iter()
            .map(|mesh| self.geometry_info(mesh.geometry()))
            .collect();
        let sizes = infos
            .iter()
            .map(|info| self.device.acceleration_structure_build_sizes(info))
            .collect::<Result<Vec<_>, _>>()?;

        let scratch_capacity = Self::scratch_capacity(&sizes);
        let scratch_alignment = self
            .device
            .ray_tracing_properties()
            .min_acceleration_structure_scratch_offset_alignment
            .max(1) as vk::DeviceSize;
        let scratch = ResidentBuffer::new(
            self.device.clone(),
            &BufferCreateInfo {
                size: scratch_capacity,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                location: MemoryLocation::DeviceLocal,
                alignment: Some(scratch_alignment),
            },
        )?;
        tracing::info!(
            meshes = meshes.len(),
            scratch_capacity,
            "building bottom level acceleration structures"
        );

        let mut accel_structs = Vec::with_capacity(meshes.len());
        let mut commands = CommandList::new();
        for (i, (info, size)) in infos.iter().zip(sizes.iter()).enumerate() {
            let accel_struct = AccelerationStructure::new_blas(
                self.device.clone(),
                size.acceleration_structure_size,
            )?;
            commands.build_acceleration_structure(
                *info,
                accel_struct.raw(),
                scratch.device_address(),
            );
            if i + 1 < infos.len() {
                commands.pipeline_barrier(MemoryBarrier::acceleration_structure_build());
            }
            tracing::debug!(
                mesh = %meshes[i].name(),
                triangles = info.primitive_count,
                size = size.acceleration_structure_size,
                scratch = size.build_scratch_size,
                "recorded bottom level build"
            );
            accel_structs.push(accel_struct);
        }
        self.device.submit_and_wait(commands)?;

        for (mesh, mut accel_struct) in meshes.iter_mut().zip(accel_structs) {
            accel_struct.resolve_device_address();
            mesh.set_bottom_level(accel_struct);
        }
        drop(scratch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils::{triangles, upload_all},
        Error,
    };
    use vkrt_gpu::{
        mock::{default_build_sizes, FailurePoint, MockDevice},
        Command,
    };

    fn is_scratch(info: &BufferCreateInfo) -> bool {
        info.location == MemoryLocation::DeviceLocal
            && info.usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER)
            && !info
                .usage
                .contains(vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR)
    }

    fn scenario_device() -> Arc<MockDevice> {
        Arc::new(MockDevice::new().with_build_sizes(|info| {
            let build_scratch_size = match info.primitive_count {
                10 => 1024,
                200 => 4096,
                50 => 2048,
                _ => 512,
            };
            BuildSizes {
                acceleration_structure_size: 4096 + 64 * info.primitive_count as vk::DeviceSize,
                build_scratch_size,
                update_scratch_size: 0,
            }
        }))
    }

    #[test]
    fn test_scratch_capacity_is_max() {
        let sizes: Vec<BuildSizes> = [300, 7000, 12, 6999]
            .into_iter()
            .map(|build_scratch_size| BuildSizes {
                build_scratch_size,
                ..Default::default()
            })
            .collect();
        assert_eq!(BlasBuilder::scratch_capacity(&sizes), 7000);
        assert_eq!(BlasBuilder::scratch_capacity(&[]), 0);
    }

    #[test]
    fn test_single_shared_scratch_buffer() {
        let mock = scenario_device();
        let device: Arc<dyn RayTracingDevice> = mock.clone();
        let mut meshes = upload_all(
            &device,
            &[triangles("a", 10), triangles("b", 200), triangles("c", 50)],
        );
        let builder = BlasBuilder::new(device.clone(), BuildSettings::default());
        builder.build(&mut meshes).unwrap();

        let scratch: Vec<BufferCreateInfo> = mock
            .created_buffers()
            .into_iter()
            .filter(is_scratch)
            .collect();
        assert_eq!(scratch.len(), 1);
        assert_eq!(scratch[0].size, 4096);
        assert_eq!(scratch[0].alignment, Some(128));

        // Scratch released, one structure per mesh kept.
        let counts = mock.counts();
        assert_eq!(counts.size_queries, 3);
        assert_eq!(counts.submissions, 1);
        assert_eq!(counts.live_accel_structs(), 3);
        assert_eq!(counts.live_buffers(), 3 * 6 + 3);
    }

    #[test]
    fn test_builds_are_separated_by_barriers() {
        let mock = Arc::new(MockDevice::new());
        let device: Arc<dyn RayTracingDevice> = mock.clone();
        let mut meshes = upload_all(
            &device,
            &[triangles("a", 1), triangles("b", 2), triangles("c", 3)],
        );
        BlasBuilder::new(device.clone(), BuildSettings::default())
            .build(&mut meshes)
            .unwrap();

        let submissions = mock.submissions();
        assert_eq!(submissions.len(), 1);
        let kinds: Vec<bool> = submissions[0]
            .iter()
            .map(|command| matches!(command, Command::BuildAccelerationStructure { .. }))
            .collect();
        assert_eq!(kinds, vec![true, false, true, false, true]);
        assert!(submissions[0].iter().all(|command| match command {
            Command::MemoryBarrier(barrier) =>
                *barrier == MemoryBarrier::acceleration_structure_build(),
            Command::BuildAccelerationStructure { info, .. } => info.flags
                == vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
                && info.geometry_flags == vk::GeometryFlagsKHR::OPAQUE,
        }));

        let builder = BlasBuilder::new(device.clone(), BuildSettings::default());
        for mesh in &meshes {
            let blas = mesh.bottom_level().unwrap();
            let expected = default_build_sizes(&builder.geometry_info(mesh.geometry()));
            assert_eq!(blas.size(), expected.acceleration_structure_size);
            assert_ne!(blas.device_address(), 0);
            assert!(mock.is_built(blas.raw()));
        }
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let mock = Arc::new(MockDevice::new());
        let device: Arc<dyn RayTracingDevice> = mock.clone();
        BlasBuilder::new(device, BuildSettings::default())
            .build(&mut [])
            .unwrap();
        let counts = mock.counts();
        assert_eq!(counts.submissions, 0);
        assert_eq!(counts.buffers_created, 0);
        assert_eq!(counts.size_queries, 0);
    }

    #[test]
    fn test_undersized_scratch_is_rejected() {
        let mock = scenario_device();
        let device: Arc<dyn RayTracingDevice> = mock.clone();
        let meshes = upload_all(&device, &[triangles("a", 10), triangles("b", 200)]);
        let builder = BlasBuilder::new(device.clone(), BuildSettings::default());
        let infos: Vec<_> = meshes
            .iter()
            .map(|mesh| builder.geometry_info(mesh.geometry()))
            .collect();
        let sizes: Vec<_> = infos
            .iter()
            .map(|info| device.acceleration_structure_build_sizes(info).unwrap())
            .collect();

        // Sized for the first mesh only.
        let scratch = ResidentBuffer::new(
            device.clone(),
            &BufferCreateInfo {
                size: sizes[0].build_scratch_size,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                location: MemoryLocation::DeviceLocal,
                alignment: Some(128),
            },
        )
        .unwrap();
        let accel_structs: Vec<_> = sizes
            .iter()
            .map(|size| {
                AccelerationStructure::new_blas(device.clone(), size.acceleration_structure_size)
                    .unwrap()
            })
            .collect();
        let mut commands = CommandList::new();
        commands
            .build_acceleration_structure(infos[0], accel_structs[0].raw(), scratch.device_address())
            .pipeline_barrier(MemoryBarrier::acceleration_structure_build())
            .build_acceleration_structure(infos[1], accel_structs[1].raw(), scratch.device_address());
        assert!(matches!(
            device.submit_and_wait(commands),
            Err(vkrt_gpu::Error::Submission(vk::Result::ERROR_VALIDATION_FAILED_EXT))
        ));
        assert!(!mock.is_built(accel_structs[0].raw()));
    }

    #[test]
    fn test_failed_build_releases_everything() {
        for failure in [
            FailurePoint::SizeQuery,
            FailurePoint::BufferCreation,
            FailurePoint::AccelerationStructureCreation,
            FailurePoint::Submission,
        ] {
            let mock = Arc::new(MockDevice::new());
            let device: Arc<dyn RayTracingDevice> = mock.clone();
            let mut meshes = upload_all(&device, &[triangles("a", 4), triangles("b", 8)]);
            let before = mock.counts();

            mock.fail_on(failure);
            let result = BlasBuilder::new(device.clone(), BuildSettings::default()).build(&mut meshes);
            assert!(matches!(result, Err(Error::Gpu(_))), "{failure:?}");
            assert!(meshes.iter().all(|mesh| mesh.bottom_level().is_none()));

            let after = mock.counts();
            assert_eq!(after.live_buffers(), before.live_buffers(), "{failure:?}");
            assert_eq!(after.live_accel_structs(), 0, "{failure:?}");
            assert_eq!(after.submissions, 0, "{failure:?}");
        }
    }
}
