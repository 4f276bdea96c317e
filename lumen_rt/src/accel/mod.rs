/// Acceleration module - bottom-level and top-level spatial indices

pub mod bounds;
pub mod instance_record;
pub mod bottom_level;
pub mod top_level;

pub use bounds::Aabb;
pub use instance_record::{InstanceRecord, InstanceFlags, INSTANCE_RECORD_SIZE, MAX_24BIT};
pub use bottom_level::BottomLevelIndex;
pub use top_level::{TopLevelIndex, TopLevelInstance};

use crate::graphics_device::{BufferHandle, GraphicsDevice, IndexHandle};

/// Backend objects created by a build that has not completed yet
///
/// A failed build releases them so the caller never sees a partial index.
#[derive(Default)]
pub(crate) struct PendingAllocations {
    buffers: Vec<BufferHandle>,
    indices: Vec<IndexHandle>,
}

impl PendingAllocations {
    pub(crate) fn buffer(&mut self, buffer: BufferHandle) -> BufferHandle {
        self.buffers.push(buffer);
        buffer
    }

    pub(crate) fn index(&mut self, index: IndexHandle) -> IndexHandle {
        self.indices.push(index);
        index
    }

    /// Destroy everything recorded so far
    pub(crate) fn release(self, device: &mut dyn GraphicsDevice) {
        for index in self.indices {
            device.destroy_index(index);
        }
        for buffer in self.buffers {
            device.destroy_buffer(buffer);
        }
    }
}
