use std::{
    collections::{HashMap, HashSet},
    ffi::c_char,
    mem::ManuallyDrop,
    sync::{Arc, Mutex, MutexGuard},
};

use ash::{extensions::khr, vk};
use vma::Alloc;

use super::{
    physical_device::required_device_extensions, Instance, InstanceCreateInfo, PhysicalDevice,
    PhysicalDeviceFeatures,
};
use crate::{
    AccelerationStructureType, BufferCreateInfo, BuildGeometryInfo, BuildSizes, Command,
    CommandList, Error, GeometryData, MemoryLocation, RayTracingDevice, RayTracingProperties,
    Result,
};

struct BufferAllocation {
    allocation: vma::Allocation,
    size: vk::DeviceSize,
    mapped_data: *mut u8,
}
// Safety: the mapped pointer is only dereferenced while holding the `buffers` lock.
unsafe impl Send for BufferAllocation {}

/// A logical device with one graphics queue, a VMA allocator and the
/// `VK_KHR_acceleration_structure` / `VK_KHR_ray_tracing_pipeline` loaders.
///
/// Every buffer and acceleration structure created through the
/// [`RayTracingDevice`] interface is tracked by handle, so destroying a
/// handle twice or destroying a foreign handle is reported instead of
/// reaching the driver.
pub struct VulkanDevice {
    // Dropped explicitly, before `device`.
    allocator: ManuallyDrop<vma::Allocator>,
    buffers: Mutex<HashMap<vk::Buffer, BufferAllocation>>,
    accel_structs: Mutex<HashSet<vk::AccelerationStructureKHR>>,
    command_pool: Mutex<vk::CommandPool>,
    queue: Mutex<vk::Queue>,
    queue_family_index: u32,
    accel_struct_loader: khr::AccelerationStructure,
    rtx_loader: khr::RayTracingPipeline,
    device: ash::Device,
    physical_device: PhysicalDevice,
}

impl VulkanDevice {
    /// Creates an instance and a device on the first physical device that
    /// supports hardware ray tracing.
    pub fn create(info: &InstanceCreateInfo) -> Result<Arc<Self>> {
        let instance = Arc::new(Instance::create(info)?);
        let physical_device = PhysicalDevice::enumerate(&instance)?
            .into_iter()
            .find(|pdevice| {
                let suitable =
                    pdevice.supports_ray_tracing() && pdevice.graphics_queue_family().is_some();
                tracing::debug!(device = %pdevice.device_name(), suitable, "physical device");
                suitable
            })
            .ok_or_else(|| {
                Error::Unsupported("no physical device supports hardware ray tracing".to_string())
            })?;
        Self::new(physical_device)
    }

    pub fn new(physical_device: PhysicalDevice) -> Result<Arc<Self>> {
        let queue_family_index = physical_device.graphics_queue_family().ok_or_else(|| {
            Error::Unsupported(format!(
                "{} has no graphics queue family",
                physical_device.device_name()
            ))
        })?;
        let priorities = [1.0_f32];
        let queue_create_infos = [vk::DeviceQueueCreateInfo {
            queue_family_index,
            queue_count: 1,
            p_queue_priorities: priorities.as_ptr(),
            ..Default::default()
        }];
        let extension_names: Vec<*const c_char> = required_device_extensions()
            .iter()
            .map(|name| name.as_ptr())
            .collect();
        let mut features = PhysicalDeviceFeatures::ray_tracing();
        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names)
            .push_next(&mut features.inner)
            .build();

        let instance = physical_device.instance().clone();
        // Safety: the create info and everything it points to outlives this call.
        let device = unsafe { instance.create_device(physical_device.raw(), &create_info, None)? };
        tracing::info!(
            device = %physical_device.device_name(),
            queue_family_index,
            "created device"
        );

        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };
        let command_pool = match unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo {
                    flags: vk::CommandPoolCreateFlags::TRANSIENT,
                    queue_family_index,
                    ..Default::default()
                },
                None,
            )
        } {
            Ok(pool) => pool,
            Err(err) => {
                unsafe { device.destroy_device(None) };
                return Err(err.into());
            }
        };

        let ash_instance: &ash::Instance = &instance;
        let allocator = vma::Allocator::new(
            vma::AllocatorCreateInfo::new(ash_instance, &device, physical_device.raw())
                .vulkan_api_version(instance.api_version().raw())
                .flags(vma::AllocatorCreateFlags::BUFFER_DEVICE_ADDRESS),
        );
        let allocator = match allocator {
            Ok(allocator) => allocator,
            Err(err) => {
                unsafe {
                    device.destroy_command_pool(command_pool, None);
                    device.destroy_device(None);
                }
                return Err(err.into());
            }
        };

        let accel_struct_loader = khr::AccelerationStructure::new(ash_instance, &device);
        let rtx_loader = khr::RayTracingPipeline::new(ash_instance, &device);
        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(allocator),
            buffers: Mutex::new(HashMap::new()),
            accel_structs: Mutex::new(HashSet::new()),
            command_pool: Mutex::new(command_pool),
            queue: Mutex::new(queue),
            queue_family_index,
            accel_struct_loader,
            rtx_loader,
            device,
            physical_device,
        }))
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }
    pub fn physical_device(&self) -> &PhysicalDevice {
        &self.physical_device
    }
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }
    pub(crate) fn rtx_loader(&self) -> &khr::RayTracingPipeline {
        &self.rtx_loader
    }

    fn buffers(&self) -> MutexGuard<'_, HashMap<vk::Buffer, BufferAllocation>> {
        self.buffers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
    fn accel_structs(&self) -> MutexGuard<'_, HashSet<vk::AccelerationStructureKHR>> {
        self.accel_structs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    unsafe fn record(&self, command_buffer: vk::CommandBuffer, commands: &CommandList) -> Result<()> {
        self.device.begin_command_buffer(
            command_buffer,
            &vk::CommandBufferBeginInfo {
                flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                ..Default::default()
            },
        )?;
        for command in commands {
            match command {
                Command::BuildAccelerationStructure {
                    info,
                    dst,
                    scratch_data,
                } => {
                    let geometry = raw_geometry(info);
                    let build_info = vk::AccelerationStructureBuildGeometryInfoKHR {
                        ty: info.ty.into(),
                        flags: info.flags,
                        mode: vk::BuildAccelerationStructureModeKHR::BUILD,
                        dst_acceleration_structure: *dst,
                        geometry_count: 1,
                        p_geometries: &geometry,
                        scratch_data: vk::DeviceOrHostAddressKHR {
                            device_address: *scratch_data,
                        },
                        ..Default::default()
                    };
                    let range = vk::AccelerationStructureBuildRangeInfoKHR {
                        primitive_count: info.primitive_count,
                        ..Default::default()
                    };
                    self.accel_struct_loader.cmd_build_acceleration_structures(
                        command_buffer,
                        std::slice::from_ref(&build_info),
                        &[std::slice::from_ref(&range)],
                    );
                }
                Command::MemoryBarrier(barrier) => {
                    self.device.cmd_pipeline_barrier(
                        command_buffer,
                        barrier.src_stage_mask,
                        barrier.dst_stage_mask,
                        vk::DependencyFlags::empty(),
                        &[vk::MemoryBarrier {
                            src_access_mask: barrier.src_access_mask,
                            dst_access_mask: barrier.dst_access_mask,
                            ..Default::default()
                        }],
                        &[],
                        &[],
                    );
                }
            }
        }
        self.device.end_command_buffer(command_buffer)?;

        let queue = self
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let command_buffers = [command_buffer];
        self.device.queue_submit(
            *queue,
            &[vk::SubmitInfo::builder()
                .command_buffers(&command_buffers)
                .build()],
            vk::Fence::null(),
        )?;
        self.device.queue_wait_idle(*queue)?;
        Ok(())
    }
}

fn raw_geometry(info: &BuildGeometryInfo) -> vk::AccelerationStructureGeometryKHR {
    match info.geometry {
        GeometryData::Triangles {
            vertex_data,
            vertex_stride,
            max_vertex,
            vertex_format,
            index_data,
            index_type,
        } => vk::AccelerationStructureGeometryKHR {
            geometry_type: vk::GeometryTypeKHR::TRIANGLES,
            geometry: vk::AccelerationStructureGeometryDataKHR {
                triangles: vk::AccelerationStructureGeometryTrianglesDataKHR {
                    vertex_format,
                    vertex_data: vk::DeviceOrHostAddressConstKHR {
                        device_address: vertex_data,
                    },
                    vertex_stride,
                    max_vertex,
                    index_type,
                    index_data: vk::DeviceOrHostAddressConstKHR {
                        device_address: index_data,
                    },
                    ..Default::default()
                },
            },
            flags: info.geometry_flags,
            ..Default::default()
        },
        GeometryData::Instances { data } => vk::AccelerationStructureGeometryKHR {
            geometry_type: vk::GeometryTypeKHR::INSTANCES,
            geometry: vk::AccelerationStructureGeometryDataKHR {
                instances: vk::AccelerationStructureGeometryInstancesDataKHR {
                    array_of_pointers: vk::FALSE,
                    data: vk::DeviceOrHostAddressConstKHR {
                        device_address: data,
                    },
                    ..Default::default()
                },
            },
            flags: info.geometry_flags,
            ..Default::default()
        },
    }
}

impl RayTracingDevice for VulkanDevice {
    fn ray_tracing_properties(&self) -> RayTracingProperties {
        self.physical_device.ray_tracing_properties()
    }

    fn acceleration_structure_build_sizes(&self, info: &BuildGeometryInfo) -> Result<BuildSizes> {
        let geometry = raw_geometry(info);
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR {
            ty: info.ty.into(),
            flags: info.flags,
            mode: vk::BuildAccelerationStructureModeKHR::BUILD,
            geometry_count: 1,
            p_geometries: &geometry,
            ..Default::default()
        };
        let sizes = unsafe {
            self.accel_struct_loader
                .get_acceleration_structure_build_sizes(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    &build_info,
                    &[info.primitive_count],
                )
        };
        if sizes.acceleration_structure_size == 0 {
            return Err(Error::SizeQuery(vk::Result::ERROR_UNKNOWN));
        }
        Ok(BuildSizes {
            acceleration_structure_size: sizes.acceleration_structure_size,
            build_scratch_size: sizes.build_scratch_size,
            update_scratch_size: sizes.update_scratch_size,
        })
    }

    fn create_buffer(&self, info: &BufferCreateInfo) -> Result<vk::Buffer> {
        if info.size == 0 {
            return Err(Error::Allocation {
                what: "buffer",
                size: 0,
                result: vk::Result::ERROR_INITIALIZATION_FAILED,
            });
        }
        let buffer_info = vk::BufferCreateInfo {
            size: info.size,
            usage: info.usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let alloc_info = match info.location {
            MemoryLocation::DeviceLocal => vma::AllocationCreateInfo {
                usage: vma::MemoryUsage::AutoPreferDevice,
                ..Default::default()
            },
            MemoryLocation::HostUpload => vma::AllocationCreateInfo {
                usage: vma::MemoryUsage::Auto,
                flags: vma::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE
                    | vma::AllocationCreateFlags::MAPPED,
                required_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
                ..Default::default()
            },
        };
        let result = unsafe {
            match info.alignment {
                Some(alignment) => {
                    self.allocator
                        .create_buffer_with_alignment(&buffer_info, &alloc_info, alignment)
                }
                None => self.allocator.create_buffer(&buffer_info, &alloc_info),
            }
        };
        let (buffer, allocation) = result.map_err(|result| Error::Allocation {
            what: "buffer",
            size: info.size,
            result,
        })?;
        let mapped_data = self.allocator.get_allocation_info(&allocation).mapped_data as *mut u8;
        tracing::trace!(?buffer, size = info.size, location = ?info.location, "create buffer");
        self.buffers().insert(
            buffer,
            BufferAllocation {
                allocation,
                size: info.size,
                mapped_data,
            },
        );
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let Some(mut entry) = self.buffers().remove(&buffer) else {
            tracing::warn!(?buffer, "destroying a buffer this device does not own");
            return;
        };
        unsafe {
            self.allocator.destroy_buffer(buffer, &mut entry.allocation);
        }
    }

    fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        unsafe {
            self.device.get_buffer_device_address(&vk::BufferDeviceAddressInfo {
                buffer,
                ..Default::default()
            })
        }
    }

    fn write_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        let buffers = self.buffers();
        let entry = buffers.get(&buffer).ok_or(Error::UnknownBuffer(buffer))?;
        if entry.mapped_data.is_null() {
            return Err(Error::NotHostVisible(buffer));
        }
        if offset + data.len() as vk::DeviceSize > entry.size {
            return Err(Error::WriteOutOfBounds {
                offset,
                len: data.len(),
                size: entry.size,
            });
        }
        // Safety: the range was checked against the allocation size and the
        // memory is host coherent, so no flush is needed.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                entry.mapped_data.add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }

    fn create_acceleration_structure(
        &self,
        ty: AccelerationStructureType,
        buffer: vk::Buffer,
        size: vk::DeviceSize,
    ) -> Result<vk::AccelerationStructureKHR> {
        let accel_struct = unsafe {
            self.accel_struct_loader.create_acceleration_structure(
                &vk::AccelerationStructureCreateInfoKHR {
                    buffer,
                    offset: 0,
                    size,
                    ty: ty.into(),
                    ..Default::default()
                },
                None,
            )
        }
        .map_err(|result| Error::Allocation {
            what: "acceleration structure",
            size,
            result,
        })?;
        tracing::trace!(?accel_struct, ?ty, size, "create acceleration structure");
        self.accel_structs().insert(accel_struct);
        Ok(accel_struct)
    }

    fn destroy_acceleration_structure(&self, accel_struct: vk::AccelerationStructureKHR) {
        if !self.accel_structs().remove(&accel_struct) {
            tracing::warn!(
                ?accel_struct,
                "destroying an acceleration structure this device does not own"
            );
            return;
        }
        unsafe {
            self.accel_struct_loader
                .destroy_acceleration_structure(accel_struct, None);
        }
    }

    fn acceleration_structure_device_address(
        &self,
        accel_struct: vk::AccelerationStructureKHR,
    ) -> vk::DeviceAddress {
        unsafe {
            self.accel_struct_loader
                .get_acceleration_structure_device_address(
                    &vk::AccelerationStructureDeviceAddressInfoKHR {
                        acceleration_structure: accel_struct,
                        ..Default::default()
                    },
                )
        }
    }

    fn submit_and_wait(&self, commands: CommandList) -> Result<()> {
        if commands.is_empty() {
            tracing::warn!("skipping submission of an empty command list");
            return Ok(());
        }
        let command_pool = self
            .command_pool
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let command_buffer = unsafe {
            self.device
                .allocate_command_buffers(&vk::CommandBufferAllocateInfo {
                    command_pool: *command_pool,
                    level: vk::CommandBufferLevel::PRIMARY,
                    command_buffer_count: 1,
                    ..Default::default()
                })
                .map_err(Error::Submission)?[0]
        };
        let result = unsafe { self.record(command_buffer, &commands) };
        unsafe {
            self.device
                .free_command_buffers(*command_pool, &[command_buffer]);
        }
        tracing::debug!(
            commands = commands.len(),
            builds = commands.num_builds(),
            "submitted command list"
        );
        result.map_err(|err| match err {
            Error::Vk(result) => Error::Submission(result),
            err => err,
        })
    }

    fn shader_group_handles(
        &self,
        pipeline: vk::Pipeline,
        first_group: u32,
        group_count: u32,
    ) -> Result<Vec<u8>> {
        let data_size = group_count as usize
            * self.ray_tracing_properties().shader_group_handle_size as usize;
        unsafe {
            self.rtx_loader.get_ray_tracing_shader_group_handles(
                pipeline,
                first_group,
                group_count,
                data_size,
            )
        }
        .map_err(Error::ShaderGroupHandles)
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(err) = self.device.device_wait_idle() {
                tracing::error!(%err, "device_wait_idle failed while dropping the device");
            }
            let accel_structs = std::mem::take(&mut *self.accel_structs());
            for accel_struct in accel_structs {
                tracing::warn!(?accel_struct, "acceleration structure leaked past device drop");
                self.accel_struct_loader
                    .destroy_acceleration_structure(accel_struct, None);
            }
            let buffers = std::mem::take(&mut *self.buffers());
            for (buffer, mut entry) in buffers {
                tracing::warn!(?buffer, "buffer leaked past device drop");
                self.allocator.destroy_buffer(buffer, &mut entry.allocation);
            }
            let command_pool = *self
                .command_pool
                .get_mut()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            self.device.destroy_command_pool(command_pool, None);
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
        tracing::info!("drop device");
    }
}
