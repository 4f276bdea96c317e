/// Top-level spatial index over the scene's instances
///
/// Instance `i` of the build list becomes instance record `i`. Its
/// `hit_group_record` selects the dispatch table hit-group entry a ray hit
/// on it invokes, so the caller keeps the instance list and the hit-group
/// section in the same order.
///
/// A refit rewrites the instance records in place and updates the existing
/// index with the same result and scratch memory. It requires the same
/// instance count and the same bottom-level/hit-group bindings as the build;
/// anything else must go through a new `build`.

use glam::Mat4;
use crate::error::Result;
use crate::graphics_device::{
    BufferDesc, BufferHandle, BufferUsage, CommandStream, GraphicsDevice, IndexBuildCommand,
    IndexBuildFlags, IndexDescriptor, IndexHandle, IndexMemoryRequirements, MemoryKind,
};
use crate::{lumen_bail, lumen_debug, lumen_info, lumen_trace};
use super::instance_record::{InstanceFlags, InstanceRecord, INSTANCE_RECORD_SIZE};
use super::PendingAllocations;

/// One placement in a top-level build
#[derive(Debug, Clone, PartialEq)]
pub struct TopLevelInstance {
    /// Bottom-level index this instance places
    pub bottom_level: IndexHandle,
    /// Custom id visible to hit programs (24 bits)
    pub instance_id: u32,
    /// Hit-group entry invoked on a hit (24 bits)
    pub hit_group_record: u32,
    /// Ray/instance visibility mask
    pub mask: u8,
    pub transform: Mat4,
    pub flags: InstanceFlags,
}

impl TopLevelInstance {
    pub fn new(bottom_level: IndexHandle, instance_id: u32, hit_group_record: u32) -> Self {
        Self {
            bottom_level,
            instance_id,
            hit_group_record,
            mask: 0xFF,
            transform: Mat4::IDENTITY,
            flags: InstanceFlags::TRIANGLE_CULL_DISABLE,
        }
    }

    pub fn with_transform(mut self, transform: Mat4) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_mask(mut self, mask: u8) -> Self {
        self.mask = mask;
        self
    }

    pub fn with_flags(mut self, flags: InstanceFlags) -> Self {
        self.flags = flags;
        self
    }
}

#[derive(Debug)]
pub struct TopLevelIndex {
    index: IndexHandle,
    result_buffer: BufferHandle,
    scratch_buffer: BufferHandle,
    instance_buffer: BufferHandle,
    reference: u64,
    allow_refit: bool,
    flags: IndexBuildFlags,
    requirements: IndexMemoryRequirements,
    /// Bottom-level and hit-group record per instance, fixed at build
    bindings: Vec<(IndexHandle, u32)>,
    refit_count: u64,
}

impl TopLevelIndex {
    /// Build an index over `instances` and wait for the GPU to finish
    ///
    /// Fails with `ResourceCreationFailed` when a referenced bottom-level index
    /// is not resident or an allocation fails. On failure every intermediate
    /// allocation is released.
    pub fn build(
        device: &mut dyn GraphicsDevice,
        name: &str,
        instances: &[TopLevelInstance],
        allow_refit: bool,
    ) -> Result<Self> {
        let records = encode_records(device, instances)?;

        let flags = if allow_refit {
            IndexBuildFlags::PREFER_FAST_TRACE | IndexBuildFlags::ALLOW_UPDATE
        } else {
            IndexBuildFlags::PREFER_FAST_TRACE
        };
        let descriptor = IndexDescriptor::TopLevel {
            instance_count: records.len() as u32,
            flags,
        };

        let mut pending = PendingAllocations::default();
        let built = Self::build_with(device, name, &descriptor, &records, &mut pending)
            .and_then(|parts| device.index_reference(parts.0).map(|reference| (parts, reference)));

        match built {
            Ok(((index, result_buffer, scratch_buffer, instance_buffer, requirements), reference)) => {
                lumen_info!("lumen::TopLevelIndex", "'{}': built over {} instances ({} bytes, refit {})",
                    name, records.len(), requirements.result_size,
                    if allow_refit { "enabled" } else { "disabled" });
                Ok(Self {
                    index,
                    result_buffer,
                    scratch_buffer,
                    instance_buffer,
                    reference,
                    allow_refit,
                    flags,
                    requirements,
                    bindings: instances
                        .iter()
                        .map(|i| (i.bottom_level, i.hit_group_record))
                        .collect(),
                    refit_count: 0,
                })
            }
            Err(e) => {
                pending.release(device);
                Err(e)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn build_with(
        device: &mut dyn GraphicsDevice,
        name: &str,
        descriptor: &IndexDescriptor,
        records: &[InstanceRecord],
        pending: &mut PendingAllocations,
    ) -> Result<(IndexHandle, BufferHandle, BufferHandle, BufferHandle, IndexMemoryRequirements)> {
        let requirements = device.query_memory_requirements(descriptor)?;

        let index = pending.index(device.create_index(descriptor)?);
        let result_buffer = pending.buffer(device.allocate_buffer(&BufferDesc::new(
            format!("{} top-level result", name),
            requirements.result_size,
            BufferUsage::SPATIAL_INDEX_STORAGE,
            MemoryKind::DeviceLocal,
        ))?);
        device.bind_memory(index, result_buffer)?;

        // Sized for both paths so a refit never reallocates
        let scratch_size = if descriptor.flags().contains(IndexBuildFlags::ALLOW_UPDATE) {
            requirements.build_scratch_size.max(requirements.update_scratch_size)
        } else {
            requirements.build_scratch_size
        };
        let scratch_buffer = pending.buffer(device.allocate_buffer(&BufferDesc::new(
            format!("{} top-level scratch", name),
            scratch_size,
            BufferUsage::SPATIAL_INDEX_SCRATCH,
            MemoryKind::DeviceLocal,
        ))?);

        let instance_bytes = (records.len().max(1) as u64) * INSTANCE_RECORD_SIZE;
        let instance_buffer = pending.buffer(device.allocate_buffer(&BufferDesc::new(
            format!("{} instances", name),
            instance_bytes,
            BufferUsage::SPATIAL_INDEX_INPUT,
            MemoryKind::HostVisible,
        ))?);
        if !records.is_empty() {
            device.write_buffer(instance_buffer, 0, bytemuck::cast_slice(records))?;
        }

        let mut commands = device.begin_single_shot(&format!("{} top-level build", name))?;
        commands.build_index(IndexBuildCommand {
            descriptor: descriptor.clone(),
            instance_data: Some(instance_buffer),
            update_only: false,
            source: None,
            destination: index,
            scratch: scratch_buffer,
        });
        commands.index_build_barrier();
        device.submit_and_wait(commands)?;

        Ok((index, result_buffer, scratch_buffer, instance_buffer, requirements))
    }

    /// Record an in-place update into `commands`
    ///
    /// Validation happens before anything is written: a rejected refit leaves
    /// the index and its instance records untouched.
    pub fn record_refit(
        &mut self,
        device: &mut dyn GraphicsDevice,
        commands: &mut CommandStream,
        instances: &[TopLevelInstance],
    ) -> Result<()> {
        if !self.allow_refit {
            lumen_bail!("lumen::TopLevelIndex", InvalidArgument,
                "refit requested on an index built without refit support");
        }
        if instances.len() != self.bindings.len() {
            lumen_bail!("lumen::TopLevelIndex", InvalidArgument,
                "refit with {} instances, index was built with {}; a full rebuild is required",
                instances.len(), self.bindings.len());
        }
        for (i, (instance, binding)) in instances.iter().zip(&self.bindings).enumerate() {
            if (instance.bottom_level, instance.hit_group_record) != *binding {
                lumen_bail!("lumen::TopLevelIndex", InvalidArgument,
                    "instance {} changed its bottom-level or hit group binding; a full rebuild is required", i);
            }
        }

        let records = encode_records(device, instances)?;
        if !records.is_empty() {
            device.write_buffer(self.instance_buffer, 0, bytemuck::cast_slice(&records))?;
        }

        commands.build_index(IndexBuildCommand {
            descriptor: IndexDescriptor::TopLevel {
                instance_count: records.len() as u32,
                flags: self.flags,
            },
            instance_data: Some(self.instance_buffer),
            update_only: true,
            source: Some(self.index),
            destination: self.index,
            scratch: self.scratch_buffer,
        });
        commands.index_build_barrier();

        self.refit_count += 1;
        lumen_trace!("lumen::TopLevelIndex", "refit #{} recorded over {} instances",
            self.refit_count, records.len());
        Ok(())
    }

    /// Refit and wait for the GPU to finish
    pub fn refit(&mut self, device: &mut dyn GraphicsDevice, instances: &[TopLevelInstance]) -> Result<()> {
        let mut commands = device.begin_single_shot("top-level refit")?;
        self.record_refit(device, &mut commands, instances)?;
        device.submit_and_wait(commands)
    }

    /// Handle consumed by descriptor binding and trace calls
    pub fn handle(&self) -> IndexHandle {
        self.index
    }

    pub fn reference(&self) -> u64 {
        self.reference
    }

    pub fn instance_count(&self) -> u32 {
        self.bindings.len() as u32
    }

    pub fn allows_refit(&self) -> bool {
        self.allow_refit
    }

    pub fn instance_buffer(&self) -> BufferHandle {
        self.instance_buffer
    }

    pub fn memory_requirements(&self) -> IndexMemoryRequirements {
        self.requirements
    }

    /// Number of refits recorded since the build
    pub fn refit_count(&self) -> u64 {
        self.refit_count
    }

    pub fn destroy(self, device: &mut dyn GraphicsDevice) {
        lumen_debug!("lumen::TopLevelIndex", "destroying index over {} instances", self.bindings.len());
        device.destroy_index(self.index);
        device.destroy_buffer(self.result_buffer);
        device.destroy_buffer(self.scratch_buffer);
        device.destroy_buffer(self.instance_buffer);
    }
}

fn encode_records(device: &dyn GraphicsDevice, instances: &[TopLevelInstance]) -> Result<Vec<InstanceRecord>> {
    instances
        .iter()
        .map(|instance| {
            let reference = device.index_reference(instance.bottom_level)?;
            InstanceRecord::new(
                &instance.transform,
                instance.instance_id,
                instance.mask,
                instance.hit_group_record,
                instance.flags,
                reference,
            )
        })
        .collect()
}

#[cfg(test)]
#[path = "top_level_tests.rs"]
mod tests;
