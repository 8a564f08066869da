use std::sync::Arc;

use ash::vk;

use crate::{AccelerationStructureType, BufferCreateInfo, MemoryLocation, RayTracingDevice, Result};

/// A buffer bound to its own allocation. Destroyed together with its memory on drop.
pub struct ResidentBuffer {
    device: Arc<dyn RayTracingDevice>,
    raw: vk::Buffer,
    size: vk::DeviceSize,
    device_address: vk::DeviceAddress,
}

impl std::fmt::Debug for ResidentBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResidentBuffer")
            .field("raw", &self.raw)
            .field("size", &self.size)
            .field("device_address", &self.device_address)
            .finish()
    }
}

impl ResidentBuffer {
    pub fn new(device: Arc<dyn RayTracingDevice>, info: &BufferCreateInfo) -> Result<Self> {
        let raw = device.create_buffer(info)?;
        let device_address = if info
            .usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
        {
            device.buffer_device_address(raw)
        } else {
            0
        };
        Ok(Self {
            device,
            raw,
            size: info.size,
            device_address,
        })
    }

    /// Creates a host visible buffer and fills it with `data`.
    pub fn upload(
        device: Arc<dyn RayTracingDevice>,
        usage: vk::BufferUsageFlags,
        alignment: Option<vk::DeviceSize>,
        data: &[u8],
    ) -> Result<Self> {
        let buffer = Self::new(
            device,
            &BufferCreateInfo {
                size: data.len() as vk::DeviceSize,
                usage,
                location: MemoryLocation::HostUpload,
                alignment,
            },
        )?;
        buffer.write(0, data)?;
        Ok(buffer)
    }

    pub fn raw(&self) -> vk::Buffer {
        self.raw
    }
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
    /// Zero unless the buffer was created with `SHADER_DEVICE_ADDRESS`.
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }
    pub fn write(&self, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        self.device.write_buffer(self.raw, offset, data)
    }
}

impl Drop for ResidentBuffer {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.raw);
    }
}

/// An acceleration structure together with the buffer that stores it.
pub struct AccelerationStructure {
    raw: vk::AccelerationStructureKHR,
    device_address: vk::DeviceAddress,
    ty: AccelerationStructureType,
    size: vk::DeviceSize,
    buffer: ResidentBuffer,
}

impl std::fmt::Debug for AccelerationStructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccelerationStructure")
            .field("raw", &self.raw)
            .field("ty", &self.ty)
            .field("size", &self.size)
            .field("device_address", &self.device_address)
            .finish()
    }
}

impl AccelerationStructure {
    pub fn new_blas(device: Arc<dyn RayTracingDevice>, size: vk::DeviceSize) -> Result<Self> {
        Self::new(device, AccelerationStructureType::BottomLevel, size)
    }
    pub fn new_tlas(device: Arc<dyn RayTracingDevice>, size: vk::DeviceSize) -> Result<Self> {
        Self::new(device, AccelerationStructureType::TopLevel, size)
    }
    pub fn new(
        device: Arc<dyn RayTracingDevice>,
        ty: AccelerationStructureType,
        size: vk::DeviceSize,
    ) -> Result<Self> {
        let buffer = ResidentBuffer::new(
            device.clone(),
            &BufferCreateInfo {
                size,
                usage: vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                location: MemoryLocation::DeviceLocal,
                alignment: None,
            },
        )?;
        // On failure the backing buffer is released by its own drop.
        let raw = device.create_acceleration_structure(ty, buffer.raw(), size)?;
        Ok(Self {
            raw,
            device_address: 0,
            ty,
            size,
            buffer,
        })
    }

    /// Queries the device address. Only meaningful once the structure was built.
    pub fn resolve_device_address(&mut self) -> vk::DeviceAddress {
        self.device_address = self
            .buffer
            .device
            .acceleration_structure_device_address(self.raw);
        self.device_address
    }

    pub fn raw(&self) -> vk::AccelerationStructureKHR {
        self.raw
    }
    /// Zero until [`Self::resolve_device_address`] was called.
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }
    pub fn ty(&self) -> AccelerationStructureType {
        self.ty
    }
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
    pub fn buffer(&self) -> &ResidentBuffer {
        &self.buffer
    }
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        // The backing buffer is dropped after this, once the structure is gone.
        self.buffer.device.destroy_acceleration_structure(self.raw);
    }
}
