//! An instrumented, in-memory [`RayTracingDevice`] for tests.
//!
//! Handles and device addresses are deterministic. Submitted command lists are
//! validated the way the validation layers would: scratch memory has to be
//! large enough and aligned, builds sharing scratch memory have to be separated
//! by a barrier, and every address consumed by a build has to point into a live
//! buffer.

use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard},
};

use ash::vk::{self, Handle};

use crate::{
    AccelerationStructureType, BufferCreateInfo, BuildGeometryInfo, BuildSizes, Command,
    CommandList, Error, GeometryData, MemoryBarrier, MemoryLocation, RayTracingDevice,
    RayTracingProperties, Result,
};

const ADDRESS_BASE: vk::DeviceAddress = 0x1000_0000;
const ADDRESS_GRANULARITY: vk::DeviceAddress = 256;
const INSTANCE_SIZE: usize = std::mem::size_of::<vk::AccelerationStructureInstanceKHR>();

/// Operations that can be made to fail with [`MockDevice::fail_on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    SizeQuery,
    BufferCreation,
    AccelerationStructureCreation,
    Submission,
    ShaderGroupHandles,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub size_queries: usize,
    pub buffers_created: usize,
    pub buffers_destroyed: usize,
    pub accel_structs_created: usize,
    pub accel_structs_destroyed: usize,
    pub submissions: usize,
}

impl CallCounts {
    pub fn live_buffers(&self) -> usize {
        self.buffers_created - self.buffers_destroyed
    }
    pub fn live_accel_structs(&self) -> usize {
        self.accel_structs_created - self.accel_structs_destroyed
    }
}

struct MockBuffer {
    info: BufferCreateInfo,
    address: vk::DeviceAddress,
    contents: Option<Vec<u8>>,
}

impl MockBuffer {
    fn contains(&self, address: vk::DeviceAddress) -> bool {
        address >= self.address && address < self.address + self.info.size
    }
}

struct MockAccelStruct {
    ty: AccelerationStructureType,
    buffer: vk::Buffer,
    size: vk::DeviceSize,
    address: vk::DeviceAddress,
    built: bool,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    next_address: vk::DeviceAddress,
    buffers: HashMap<vk::Buffer, MockBuffer>,
    accel_structs: HashMap<vk::AccelerationStructureKHR, MockAccelStruct>,
    counts: CallCounts,
    created_buffers: Vec<BufferCreateInfo>,
    submissions: Vec<CommandList>,
    instance_snapshots: Vec<Vec<u8>>,
    failures: HashSet<FailurePoint>,
}

impl State {
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
    fn allocate_address(
        &mut self,
        size: vk::DeviceSize,
        alignment: Option<vk::DeviceSize>,
    ) -> vk::DeviceAddress {
        let alignment = alignment.unwrap_or(1).max(ADDRESS_GRANULARITY);
        let address = self.next_address.next_multiple_of(alignment);
        self.next_address = (address + size).next_multiple_of(ADDRESS_GRANULARITY);
        address
    }
    fn buffer_containing(&self, address: vk::DeviceAddress) -> Option<&MockBuffer> {
        self.buffers.values().find(|buffer| buffer.contains(address))
    }
}

type BuildSizesFn = Box<dyn Fn(&BuildGeometryInfo) -> BuildSizes + Send + Sync>;

pub struct MockDevice {
    properties: RayTracingProperties,
    build_sizes: BuildSizesFn,
    state: Mutex<State>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

/// Sizes grow linearly with the primitive count.
pub fn default_build_sizes(info: &BuildGeometryInfo) -> BuildSizes {
    let primitives = info.primitive_count as vk::DeviceSize;
    BuildSizes {
        acceleration_structure_size: 1024 + 64 * primitives,
        build_scratch_size: 512 + 32 * primitives,
        update_scratch_size: 256 + 16 * primitives,
    }
}

fn validation_failed(reason: &str) -> Error {
    tracing::error!(reason, "mock device rejected submission");
    Error::Submission(vk::Result::ERROR_VALIDATION_FAILED_EXT)
}

fn covers_build_hazards(barrier: &MemoryBarrier) -> bool {
    let required = MemoryBarrier::acceleration_structure_build();
    barrier.src_stage_mask.contains(required.src_stage_mask)
        && barrier.dst_stage_mask.contains(required.dst_stage_mask)
        && barrier.src_access_mask.contains(required.src_access_mask)
        && barrier.dst_access_mask.contains(required.dst_access_mask)
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            properties: RayTracingProperties {
                shader_group_handle_size: 32,
                shader_group_base_alignment: 64,
                min_acceleration_structure_scratch_offset_alignment: 128,
            },
            build_sizes: Box::new(default_build_sizes),
            state: Mutex::new(State {
                next_address: ADDRESS_BASE,
                ..Default::default()
            }),
        }
    }
    pub fn with_properties(mut self, properties: RayTracingProperties) -> Self {
        self.properties = properties;
        self
    }
    pub fn with_build_sizes(
        mut self,
        build_sizes: impl Fn(&BuildGeometryInfo) -> BuildSizes + Send + Sync + 'static,
    ) -> Self {
        self.build_sizes = Box::new(build_sizes);
        self
    }

    /// Makes every subsequent call at `point` fail.
    pub fn fail_on(&self, point: FailurePoint) {
        self.state().failures.insert(point);
    }
    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    pub fn counts(&self) -> CallCounts {
        self.state().counts
    }
    /// Every buffer ever created, in creation order.
    pub fn created_buffers(&self) -> Vec<BufferCreateInfo> {
        self.state().created_buffers.clone()
    }
    /// Every command list accepted by `submit_and_wait`, in submission order.
    pub fn submissions(&self) -> Vec<CommandList> {
        self.state().submissions.clone()
    }
    /// Instance arrays read by top-level builds, one entry per build.
    pub fn instance_snapshots(&self) -> Vec<Vec<u8>> {
        self.state().instance_snapshots.clone()
    }
    /// Host-written contents of a live host visible buffer.
    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.state()
            .buffers
            .get(&buffer)
            .and_then(|buffer| buffer.contents.clone())
    }
    pub fn buffer_info(&self, buffer: vk::Buffer) -> Option<BufferCreateInfo> {
        self.state().buffers.get(&buffer).map(|buffer| buffer.info)
    }
    pub fn is_built(&self, accel_struct: vk::AccelerationStructureKHR) -> bool {
        self.state()
            .accel_structs
            .get(&accel_struct)
            .map_or(false, |accel_struct| accel_struct.built)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn validate(&self, state: &State, commands: &CommandList) -> Result<Vec<Vec<u8>>> {
        let mut snapshots = Vec::new();
        let mut last_scratch: Option<vk::Buffer> = None;
        for command in commands {
            let (info, dst, scratch_data) = match command {
                Command::MemoryBarrier(barrier) => {
                    if covers_build_hazards(barrier) {
                        last_scratch = None;
                    }
                    continue;
                }
                Command::BuildAccelerationStructure {
                    info,
                    dst,
                    scratch_data,
                } => (info, dst, *scratch_data),
            };
            let sizes = (self.build_sizes)(info);

            let dst = state
                .accel_structs
                .get(dst)
                .ok_or_else(|| validation_failed("unknown destination"))?;
            if dst.ty != info.ty {
                return Err(validation_failed("destination type mismatch"));
            }
            if dst.size < sizes.acceleration_structure_size {
                return Err(validation_failed("destination too small"));
            }

            let alignment = self
                .properties
                .min_acceleration_structure_scratch_offset_alignment
                as vk::DeviceAddress;
            if scratch_data % alignment != 0 {
                return Err(validation_failed("misaligned scratch"));
            }
            let (scratch_handle, scratch) = state
                .buffers
                .iter()
                .find(|(_, buffer)| buffer.contains(scratch_data))
                .ok_or_else(|| validation_failed("scratch is not a live buffer"))?;
            if scratch.address + scratch.info.size - scratch_data < sizes.build_scratch_size {
                return Err(validation_failed("scratch too small"));
            }
            if last_scratch == Some(*scratch_handle) {
                return Err(validation_failed("scratch reused without a barrier"));
            }
            last_scratch = Some(*scratch_handle);

            match info.geometry {
                GeometryData::Triangles {
                    vertex_data,
                    index_data,
                    ..
                } => {
                    if state.buffer_containing(vertex_data).is_none()
                        || state.buffer_containing(index_data).is_none()
                    {
                        return Err(validation_failed("geometry is not a live buffer"));
                    }
                }
                GeometryData::Instances { data } => {
                    let buffer = state
                        .buffer_containing(data)
                        .ok_or_else(|| validation_failed("instances are not a live buffer"))?;
                    let contents = buffer
                        .contents
                        .as_ref()
                        .ok_or_else(|| validation_failed("instances were never written"))?;
                    let start = (data - buffer.address) as usize;
                    let end = start + info.primitive_count as usize * INSTANCE_SIZE;
                    let snapshot = contents
                        .get(start..end)
                        .ok_or_else(|| validation_failed("instance array overflows its buffer"))?;
                    for instance in snapshot.chunks_exact(INSTANCE_SIZE) {
                        let mut reference = [0u8; 8];
                        reference.copy_from_slice(&instance[INSTANCE_SIZE - 8..]);
                        let reference = u64::from_le_bytes(reference);
                        let referenced_built = state.accel_structs.values().any(|accel_struct| {
                            accel_struct.address == reference
                                && accel_struct.built
                                && accel_struct.ty == AccelerationStructureType::BottomLevel
                        });
                        if !referenced_built {
                            return Err(validation_failed("instance references an unbuilt structure"));
                        }
                    }
                    snapshots.push(snapshot.to_vec());
                }
            }
        }
        Ok(snapshots)
    }
}

impl RayTracingDevice for MockDevice {
    fn ray_tracing_properties(&self) -> RayTracingProperties {
        self.properties
    }

    fn acceleration_structure_build_sizes(&self, info: &BuildGeometryInfo) -> Result<BuildSizes> {
        let mut state = self.state();
        state.counts.size_queries += 1;
        if state.failures.contains(&FailurePoint::SizeQuery) {
            return Err(Error::SizeQuery(vk::Result::ERROR_UNKNOWN));
        }
        Ok((self.build_sizes)(info))
    }

    fn create_buffer(&self, info: &BufferCreateInfo) -> Result<vk::Buffer> {
        let mut state = self.state();
        if info.size == 0 {
            return Err(Error::Allocation {
                what: "buffer",
                size: 0,
                result: vk::Result::ERROR_INITIALIZATION_FAILED,
            });
        }
        if state.failures.contains(&FailurePoint::BufferCreation) {
            return Err(Error::Allocation {
                what: "buffer",
                size: info.size,
                result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            });
        }
        let buffer = vk::Buffer::from_raw(state.next_handle());
        let address = state.allocate_address(info.size, info.alignment);
        let contents = match info.location {
            MemoryLocation::HostUpload => Some(vec![0; info.size as usize]),
            MemoryLocation::DeviceLocal => None,
        };
        state.buffers.insert(
            buffer,
            MockBuffer {
                info: *info,
                address,
                contents,
            },
        );
        state.created_buffers.push(*info);
        state.counts.buffers_created += 1;
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state();
        if state.buffers.remove(&buffer).is_none() {
            tracing::warn!(?buffer, "destroying an unknown buffer");
            return;
        }
        if state
            .accel_structs
            .values()
            .any(|accel_struct| accel_struct.buffer == buffer)
        {
            tracing::warn!(?buffer, "destroying a buffer still backing an acceleration structure");
        }
        state.counts.buffers_destroyed += 1;
    }

    fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        self.state()
            .buffers
            .get(&buffer)
            .map_or(0, |buffer| buffer.address)
    }

    fn write_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        let mut state = self.state();
        let entry = state
            .buffers
            .get_mut(&buffer)
            .ok_or(Error::UnknownBuffer(buffer))?;
        let size = entry.info.size;
        let contents = entry
            .contents
            .as_mut()
            .ok_or(Error::NotHostVisible(buffer))?;
        if offset + data.len() as vk::DeviceSize > size {
            return Err(Error::WriteOutOfBounds {
                offset,
                len: data.len(),
                size,
            });
        }
        let offset = offset as usize;
        contents[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn create_acceleration_structure(
        &self,
        ty: AccelerationStructureType,
        buffer: vk::Buffer,
        size: vk::DeviceSize,
    ) -> Result<vk::AccelerationStructureKHR> {
        let mut state = self.state();
        if state.failures.contains(&FailurePoint::AccelerationStructureCreation) {
            return Err(Error::Allocation {
                what: "acceleration structure",
                size,
                result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            });
        }
        let backing = state.buffers.get(&buffer).ok_or(Error::UnknownBuffer(buffer))?;
        if backing.info.size < size {
            return Err(Error::Allocation {
                what: "acceleration structure",
                size,
                result: vk::Result::ERROR_VALIDATION_FAILED_EXT,
            });
        }
        let address = backing.address;
        let accel_struct = vk::AccelerationStructureKHR::from_raw(state.next_handle());
        state.accel_structs.insert(
            accel_struct,
            MockAccelStruct {
                ty,
                buffer,
                size,
                address,
                built: false,
            },
        );
        state.counts.accel_structs_created += 1;
        Ok(accel_struct)
    }

    fn destroy_acceleration_structure(&self, accel_struct: vk::AccelerationStructureKHR) {
        let mut state = self.state();
        if state.accel_structs.remove(&accel_struct).is_none() {
            tracing::warn!(?accel_struct, "destroying an unknown acceleration structure");
            return;
        }
        state.counts.accel_structs_destroyed += 1;
    }

    fn acceleration_structure_device_address(
        &self,
        accel_struct: vk::AccelerationStructureKHR,
    ) -> vk::DeviceAddress {
        self.state()
            .accel_structs
            .get(&accel_struct)
            .map_or(0, |accel_struct| accel_struct.address)
    }

    fn submit_and_wait(&self, commands: CommandList) -> Result<()> {
        let mut state = self.state();
        if commands.is_empty() {
            return Err(validation_failed("empty submission"));
        }
        if state.failures.contains(&FailurePoint::Submission) {
            return Err(Error::Submission(vk::Result::ERROR_DEVICE_LOST));
        }
        let snapshots = self.validate(&state, &commands)?;
        for command in &commands {
            if let Command::BuildAccelerationStructure { dst, .. } = command {
                if let Some(accel_struct) = state.accel_structs.get_mut(dst) {
                    accel_struct.built = true;
                }
            }
        }
        state.instance_snapshots.extend(snapshots);
        state.counts.submissions += 1;
        state.submissions.push(commands);
        Ok(())
    }

    fn shader_group_handles(
        &self,
        pipeline: vk::Pipeline,
        first_group: u32,
        group_count: u32,
    ) -> Result<Vec<u8>> {
        if self
            .state()
            .failures
            .contains(&FailurePoint::ShaderGroupHandles)
            || pipeline == vk::Pipeline::null()
        {
            return Err(Error::ShaderGroupHandles(vk::Result::ERROR_UNKNOWN));
        }
        let handle_size = self.properties.shader_group_handle_size as usize;
        Ok((first_group..first_group + group_count)
            .flat_map(|group| std::iter::repeat((group + 1) as u8).take(handle_size))
            .collect())
    }
}
