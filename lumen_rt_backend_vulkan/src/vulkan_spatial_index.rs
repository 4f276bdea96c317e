/// SpatialIndex - Vulkan acceleration structure behind an IndexHandle
///
/// The Vulkan object needs its backing buffer at creation, so `create_index`
/// only records the descriptor and `bind_memory` creates the structure.

use ash::vk;
use std::sync::Arc;
use lumen_rt::lumen::device::{BufferHandle, IndexDescriptor};

use crate::vulkan_context::GpuContext;

pub struct SpatialIndex {
    ctx: Arc<GpuContext>,
    pub(crate) descriptor: IndexDescriptor,
    /// Null until memory is bound
    pub(crate) structure: vk::AccelerationStructureKHR,
    pub(crate) memory: Option<BufferHandle>,
    /// Set once a build containing this index completed
    pub(crate) built: bool,
}

impl SpatialIndex {
    pub fn new(ctx: Arc<GpuContext>, descriptor: IndexDescriptor) -> Self {
        Self {
            ctx,
            descriptor,
            structure: vk::AccelerationStructureKHR::null(),
            memory: None,
            built: false,
        }
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        let info = vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(self.structure);
        unsafe { self.ctx.acceleration_structure.get_acceleration_structure_device_address(&info) }
    }
}

impl Drop for SpatialIndex {
    fn drop(&mut self) {
        if self.structure != vk::AccelerationStructureKHR::null() {
            unsafe {
                self.ctx.acceleration_structure.destroy_acceleration_structure(self.structure, None);
            }
        }
    }
}
