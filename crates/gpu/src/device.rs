use ash::vk;

use crate::{CommandList, Result};

/// Shader group and scratch memory limits reported by the physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RayTracingProperties {
    /// Size in bytes of one opaque shader group identifier.
    pub shader_group_handle_size: u32,
    /// Required alignment of every shader binding table record group.
    pub shader_group_base_alignment: u32,
    pub min_acceleration_structure_scratch_offset_alignment: u32,
}

/// Memory requirements of one acceleration structure build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildSizes {
    pub acceleration_structure_size: vk::DeviceSize,
    pub build_scratch_size: vk::DeviceSize,
    pub update_scratch_size: vk::DeviceSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelerationStructureType {
    TopLevel,
    BottomLevel,
}
impl From<AccelerationStructureType> for vk::AccelerationStructureTypeKHR {
    fn from(value: AccelerationStructureType) -> Self {
        match value {
            AccelerationStructureType::TopLevel => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            AccelerationStructureType::BottomLevel => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        }
    }
}

/// The geometry consumed by one build. Addresses are device addresses of
/// buffers that must stay alive until the build has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryData {
    Triangles {
        vertex_data: vk::DeviceAddress,
        vertex_stride: vk::DeviceSize,
        max_vertex: u32,
        vertex_format: vk::Format,
        index_data: vk::DeviceAddress,
        index_type: vk::IndexType,
    },
    /// A tightly packed array of `VkAccelerationStructureInstanceKHR`.
    Instances { data: vk::DeviceAddress },
}

/// Plain-data description of a single-geometry build, used both for the size
/// query and for the build command itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildGeometryInfo {
    pub ty: AccelerationStructureType,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub geometry_flags: vk::GeometryFlagsKHR,
    pub geometry: GeometryData,
    pub primitive_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLocation {
    /// Only visible to the GPU.
    DeviceLocal,
    /// Host visible and persistently mapped, written sequentially by the CPU.
    HostUpload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCreateInfo {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    /// Minimum alignment of the buffer's device address.
    pub alignment: Option<vk::DeviceSize>,
}

/// The device, allocator and queue that the scene builders run against.
///
/// Handles returned by one device must only be passed back to the same device.
/// Every `create_*` is expected to be paired with exactly one `destroy_*`; the
/// RAII wrappers in this crate take care of that.
pub trait RayTracingDevice: Send + Sync {
    fn ray_tracing_properties(&self) -> RayTracingProperties;

    /// Side-effect free query of the memory a build would need.
    fn acceleration_structure_build_sizes(&self, info: &BuildGeometryInfo) -> Result<BuildSizes>;

    fn create_buffer(&self, info: &BufferCreateInfo) -> Result<vk::Buffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress;
    /// Copies `data` into a host visible buffer at `offset`.
    fn write_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, data: &[u8]) -> Result<()>;

    fn create_acceleration_structure(
        &self,
        ty: AccelerationStructureType,
        buffer: vk::Buffer,
        size: vk::DeviceSize,
    ) -> Result<vk::AccelerationStructureKHR>;
    fn destroy_acceleration_structure(&self, accel_struct: vk::AccelerationStructureKHR);
    fn acceleration_structure_device_address(
        &self,
        accel_struct: vk::AccelerationStructureKHR,
    ) -> vk::DeviceAddress;

    /// Records `commands` into one command buffer, submits it to the queue and
    /// blocks until the queue is idle. An empty list is never submitted.
    fn submit_and_wait(&self, commands: CommandList) -> Result<()>;

    /// Returns `group_count * shader_group_handle_size` bytes of opaque identifiers.
    fn shader_group_handles(
        &self,
        pipeline: vk::Pipeline,
        first_group: u32,
        group_count: u32,
    ) -> Result<Vec<u8>>;
}
