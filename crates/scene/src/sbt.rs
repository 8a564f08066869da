use std::sync::Arc;

use vkrt_gpu::{ash::vk, RayTracingDevice, ResidentBuffer, ShaderGroup, ShaderStage};

use crate::{Error, GroupKind, Result};

const HIT_STAGES: [vk::ShaderStageFlags; 3] = [
    vk::ShaderStageFlags::CLOSEST_HIT_KHR,
    vk::ShaderStageFlags::ANY_HIT_KHR,
    vk::ShaderStageFlags::INTERSECTION_KHR,
];

/// Assembles the shader stages and groups of a ray tracing pipeline and bakes
/// the group handles into a table laid out as
/// `[raygen, hit 0 .. hit H-1, miss 0 .. miss M-1]`, one record of
/// `group_stride()` bytes per group.
///
/// The raygen stage has to be set first. Hit and miss slots may then be
/// populated once each, in any order. Stage and group indices always follow
/// slot order, so the lists returned by [`Self::stages`] and [`Self::groups`]
/// stay consistent with each other however the slots were populated.
pub struct ShaderBindingTable {
    device: Arc<dyn RayTracingDevice>,
    handle_size: u32,
    alignment: u32,
    raygen: Option<ShaderStage>,
    hit_groups: Vec<Option<Vec<ShaderStage>>>,
    miss_groups: Vec<Option<ShaderStage>>,
    baked: Option<ResidentBuffer>,
}

impl ShaderBindingTable {
    /// An empty table with no hit or miss slots, laid out for `device`.
    pub fn new(device: Arc<dyn RayTracingDevice>) -> Self {
        let properties = device.ray_tracing_properties();
        Self {
            device,
            handle_size: properties.shader_group_handle_size,
            alignment: properties.shader_group_base_alignment,
            raygen: None,
            hit_groups: Vec::new(),
            miss_groups: Vec::new(),
            baked: None,
        }
    }

    /// Resets the table to `hit_group_count` hit slots and `miss_group_count`
    /// miss slots, dropping every stage and the baked table.
    pub fn initialize(
        &mut self,
        hit_group_count: u32,
        miss_group_count: u32,
        handle_size: u32,
        alignment: u32,
    ) -> Result<()> {
        if handle_size == 0 || alignment < handle_size {
            return Err(Error::InvalidLayout {
                handle_size,
                alignment,
            });
        }
        self.handle_size = handle_size;
        self.alignment = alignment;
        self.raygen = None;
        self.hit_groups = vec![None; hit_group_count as usize];
        self.miss_groups = vec![None; miss_group_count as usize];
        self.baked = None;
        tracing::debug!(
            hit_group_count,
            miss_group_count,
            handle_size,
            alignment,
            "initialized shader binding table"
        );
        Ok(())
    }

    /// [`Self::initialize`] with the handle size and alignment of the device.
    pub fn initialize_for_device(
        &mut self,
        hit_group_count: u32,
        miss_group_count: u32,
    ) -> Result<()> {
        let properties = self.device.ray_tracing_properties();
        self.initialize(
            hit_group_count,
            miss_group_count,
            properties.shader_group_handle_size,
            properties.shader_group_base_alignment,
        )
    }

    pub fn set_raygen_stage(&mut self, stage: ShaderStage) -> Result<()> {
        if self.raygen.is_some() {
            return Err(Error::RaygenAlreadySet);
        }
        if stage.stage != vk::ShaderStageFlags::RAYGEN_KHR {
            return Err(Error::StageKindMismatch {
                kind: "raygen",
                stage: stage.stage,
            });
        }
        self.raygen = Some(stage);
        Ok(())
    }

    /// Populates hit slot `index` with one to three stages, at most one of
    /// each of closest hit, any hit and intersection.
    pub fn add_stage_to_hit_group(&mut self, stages: Vec<ShaderStage>, index: u32) -> Result<()> {
        if self.raygen.is_none() {
            return Err(Error::RaygenNotSet);
        }
        let count = self.hit_groups.len() as u32;
        let slot = self
            .hit_groups
            .get(index as usize)
            .ok_or(Error::GroupIndexOutOfRange {
                kind: GroupKind::Hit,
                index,
                count,
            })?;
        if slot.is_some() {
            return Err(Error::GroupAlreadyPopulated {
                kind: GroupKind::Hit,
                index,
            });
        }
        if stages.is_empty() || stages.len() > HIT_STAGES.len() {
            return Err(Error::InvalidStageCount(stages.len()));
        }
        for (i, stage) in stages.iter().enumerate() {
            if !HIT_STAGES.contains(&stage.stage) {
                return Err(Error::StageKindMismatch {
                    kind: "hit",
                    stage: stage.stage,
                });
            }
            if stages[..i].iter().any(|other| other.stage == stage.stage) {
                return Err(Error::DuplicateHitStage(stage.stage));
            }
        }
        self.hit_groups[index as usize] = Some(stages);
        Ok(())
    }

    pub fn add_stage_to_miss_group(&mut self, stage: ShaderStage, index: u32) -> Result<()> {
        if self.raygen.is_none() {
            return Err(Error::RaygenNotSet);
        }
        let count = self.miss_groups.len() as u32;
        let slot = self
            .miss_groups
            .get(index as usize)
            .ok_or(Error::GroupIndexOutOfRange {
                kind: GroupKind::Miss,
                index,
                count,
            })?;
        if slot.is_some() {
            return Err(Error::GroupAlreadyPopulated {
                kind: GroupKind::Miss,
                index,
            });
        }
        if stage.stage != vk::ShaderStageFlags::MISS_KHR {
            return Err(Error::StageKindMismatch {
                kind: "miss",
                stage: stage.stage,
            });
        }
        self.miss_groups[index as usize] = Some(stage);
        Ok(())
    }

    pub fn num_stages(&self) -> u32 {
        let hit_stages: usize = self.hit_groups.iter().flatten().map(Vec::len).sum();
        let miss_stages = self.miss_groups.iter().flatten().count();
        (self.raygen.iter().count() + hit_stages + miss_stages) as u32
    }
    pub fn num_groups(&self) -> u32 {
        let hit_groups = self.hit_groups.iter().flatten().count();
        let miss_groups = self.miss_groups.iter().flatten().count();
        (self.raygen.iter().count() + hit_groups + miss_groups) as u32
    }
    pub fn hit_group_count(&self) -> u32 {
        self.hit_groups.len() as u32
    }
    pub fn miss_group_count(&self) -> u32 {
        self.miss_groups.len() as u32
    }

    /// Size of one record.
    pub fn group_stride(&self) -> vk::DeviceSize {
        self.alignment as vk::DeviceSize
    }
    pub fn raygen_offset(&self) -> vk::DeviceSize {
        0
    }
    pub fn raygen_size(&self) -> vk::DeviceSize {
        self.group_stride()
    }
    pub fn hit_groups_offset(&self) -> vk::DeviceSize {
        self.raygen_offset() + self.raygen_size()
    }
    pub fn hit_groups_size(&self) -> vk::DeviceSize {
        self.hit_groups.len() as vk::DeviceSize * self.group_stride()
    }
    pub fn miss_groups_offset(&self) -> vk::DeviceSize {
        self.hit_groups_offset() + self.hit_groups_size()
    }
    pub fn miss_groups_size(&self) -> vk::DeviceSize {
        self.miss_groups.len() as vk::DeviceSize * self.group_stride()
    }
    pub fn sbt_size(&self) -> vk::DeviceSize {
        self.miss_groups_offset() + self.miss_groups_size()
    }

    /// Raygen stage, then the stages of every populated hit slot, then every
    /// populated miss slot, each in slot order.
    pub fn stages(&self) -> Vec<ShaderStage> {
        let Some(raygen) = &self.raygen else {
            return Vec::new();
        };
        std::iter::once(raygen)
            .chain(self.hit_groups.iter().flatten().flatten())
            .chain(self.miss_groups.iter().flatten())
            .cloned()
            .collect()
    }

    /// Groups referencing [`Self::stages`] by index.
    pub fn groups(&self) -> Vec<ShaderGroup> {
        if self.raygen.is_none() {
            return Vec::new();
        }
        let mut groups = vec![ShaderGroup::general(0)];
        let mut next_stage = 1;
        for stages in self.hit_groups.iter().flatten() {
            let mut closest_hit = vk::SHADER_UNUSED_KHR;
            let mut any_hit = vk::SHADER_UNUSED_KHR;
            let mut intersection = vk::SHADER_UNUSED_KHR;
            for stage in stages {
                match stage.stage {
                    vk::ShaderStageFlags::ANY_HIT_KHR => any_hit = next_stage,
                    vk::ShaderStageFlags::INTERSECTION_KHR => intersection = next_stage,
                    _ => closest_hit = next_stage,
                }
                next_stage += 1;
            }
            groups.push(if intersection == vk::SHADER_UNUSED_KHR {
                ShaderGroup::triangles_hit_group(closest_hit, any_hit)
            } else {
                ShaderGroup::procedural_hit_group(closest_hit, any_hit, intersection)
            });
        }
        for _ in self.miss_groups.iter().flatten() {
            groups.push(ShaderGroup::general(next_stage));
            next_stage += 1;
        }
        groups
    }

    fn ensure_complete(&self) -> Result<()> {
        if self.raygen.is_none() {
            return Err(Error::RaygenNotSet);
        }
        if let Some(index) = self.hit_groups.iter().position(Option::is_none) {
            return Err(Error::UnpopulatedGroup {
                kind: GroupKind::Hit,
                index: index as u32,
            });
        }
        if let Some(index) = self.miss_groups.iter().position(Option::is_none) {
            return Err(Error::UnpopulatedGroup {
                kind: GroupKind::Miss,
                index: index as u32,
            });
        }
        Ok(())
    }

    /// Fetches the group handles of `pipeline` and writes handle `i` at
    /// `i * group_stride()` of a new device buffer. `pipeline` must have been
    /// created from [`Self::stages`] and [`Self::groups`].
    pub fn create_sbt(&mut self, pipeline: vk::Pipeline) -> Result<()> {
        self.ensure_complete()?;
        let num_groups = self.num_groups();
        let handle_size = self.handle_size as usize;
        let stride = self.alignment as usize;

        let handles = self
            .device
            .shader_group_handles(pipeline, 0, num_groups)?;
        let expected = num_groups as usize * handle_size;
        if handles.len() != expected {
            return Err(Error::HandleSizeMismatch {
                expected,
                actual: handles.len(),
            });
        }
        let mut data = vec![0u8; self.sbt_size() as usize];
        for (record, handle) in data
            .chunks_exact_mut(stride)
            .zip(handles.chunks_exact(handle_size))
        {
            record[..handle_size].copy_from_slice(handle);
        }

        self.baked = None;
        let buffer = ResidentBuffer::upload(
            self.device.clone(),
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            Some(self.alignment as vk::DeviceSize),
            &data,
        )?;
        tracing::info!(
            groups = num_groups,
            size = self.sbt_size(),
            device_address = buffer.device_address(),
            "created shader binding table"
        );
        self.baked = Some(buffer);
        Ok(())
    }

    pub fn baked(&self) -> Option<&ResidentBuffer> {
        self.baked.as_ref()
    }

    pub fn sbt_address(&self) -> Result<vk::DeviceAddress> {
        self.baked
            .as_ref()
            .map(ResidentBuffer::device_address)
            .ok_or(Error::NotBaked)
    }

    /// Raygen, miss, hit and callable regions, in the order `vkCmdTraceRaysKHR`
    /// takes them. The callable region is empty.
    pub fn regions(&self) -> Result<[vk::StridedDeviceAddressRegionKHR; 4]> {
        let address = self.sbt_address()?;
        let stride = self.group_stride();
        Ok([
            vk::StridedDeviceAddressRegionKHR {
                device_address: address + self.raygen_offset(),
                stride,
                size: self.raygen_size(),
            },
            vk::StridedDeviceAddressRegionKHR {
                device_address: address + self.miss_groups_offset(),
                stride,
                size: self.miss_groups_size(),
            },
            vk::StridedDeviceAddressRegionKHR {
                device_address: address + self.hit_groups_offset(),
                stride,
                size: self.hit_groups_size(),
            },
            vk::StridedDeviceAddressRegionKHR::default(),
        ])
    }
}
