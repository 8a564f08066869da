use ash::vk;

use crate::BuildGeometryInfo;

/// A global memory dependency between two pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBarrier {
    pub src_stage_mask: vk::PipelineStageFlags,
    pub src_access_mask: vk::AccessFlags,
    pub dst_stage_mask: vk::PipelineStageFlags,
    pub dst_access_mask: vk::AccessFlags,
}

impl MemoryBarrier {
    /// Orders one acceleration structure build after the previous one.
    /// Builds that share a scratch region read and write it, so both the
    /// read-after-write and the write-after-write hazards are covered.
    pub fn acceleration_structure_build() -> Self {
        Self {
            src_stage_mask: vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            src_access_mask: vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
            dst_stage_mask: vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            dst_access_mask: vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
                | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    BuildAccelerationStructure {
        info: BuildGeometryInfo,
        dst: vk::AccelerationStructureKHR,
        scratch_data: vk::DeviceAddress,
    },
    MemoryBarrier(MemoryBarrier),
}

/// Commands recorded on the host, replayed into one command buffer by
/// [`crate::RayTracingDevice::submit_and_wait`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandList {
    commands: Vec<Command>,
}

impl CommandList {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn build_acceleration_structure(
        &mut self,
        info: BuildGeometryInfo,
        dst: vk::AccelerationStructureKHR,
        scratch_data: vk::DeviceAddress,
    ) -> &mut Self {
        self.commands.push(Command::BuildAccelerationStructure {
            info,
            dst,
            scratch_data,
        });
        self
    }
    pub fn pipeline_barrier(&mut self, barrier: MemoryBarrier) -> &mut Self {
        self.commands.push(Command::MemoryBarrier(barrier));
        self
    }
    pub fn len(&self) -> usize {
        self.commands.len()
    }
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
    pub fn iter(&self) -> std::slice::Iter<'_, Command> {
        self.commands.iter()
    }
    pub fn num_builds(&self) -> usize {
        self.commands
            .iter()
            .filter(|command| matches!(command, Command::BuildAccelerationStructure { .. }))
            .count()
    }
}

impl<'a> IntoIterator for &'a CommandList {
    type Item = &'a Command;
    type IntoIter = std::slice::Iter<'a, Command>;
    fn into_iter(self) -> Self::IntoIter {
        self.commands.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AccelerationStructureType, GeometryData};
    use ash::vk::Handle;

    #[test]
    fn test_num_builds_ignores_barriers() {
        let info = BuildGeometryInfo {
            ty: AccelerationStructureType::TopLevel,
            flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            geometry_flags: vk::GeometryFlagsKHR::empty(),
            geometry: GeometryData::Instances { data: 0x1000 },
            primitive_count: 4,
        };
        let mut commands = CommandList::new();
        assert!(commands.is_empty());
        commands
            .build_acceleration_structure(info, vk::AccelerationStructureKHR::from_raw(1), 0x2000)
            .pipeline_barrier(MemoryBarrier::acceleration_structure_build())
            .build_acceleration_structure(info, vk::AccelerationStructureKHR::from_raw(2), 0x2000);
        assert_eq!(commands.len(), 3);
        assert_eq!(commands.num_builds(), 2);
        assert!(matches!(
            commands.iter().nth(1),
            Some(Command::MemoryBarrier(_))
        ));
    }

    #[test]
    fn test_build_barrier_covers_scratch_hazards() {
        let barrier = MemoryBarrier::acceleration_structure_build();
        assert!(barrier
            .src_access_mask
            .contains(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR));
        assert!(barrier.dst_access_mask.contains(
            vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
                | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR
        ));
        assert_eq!(barrier.src_stage_mask, barrier.dst_stage_mask);
    }
}
