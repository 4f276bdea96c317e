/// Bottom-level spatial index over one geometry
///
/// Built once, synchronously, when a geometry is registered. There is no
/// update path: a bottom-level index is immutable until destroyed.

use crate::error::Result;
use crate::graphics_device::{
    BufferDesc, BufferHandle, BufferUsage, GraphicsDevice, IndexBuildCommand,
    IndexBuildFlags, IndexDescriptor, IndexGeometry, IndexHandle, MemoryKind,
    AABB_PRIMITIVE_SIZE,
};
use crate::{lumen_bail, lumen_debug};
use super::PendingAllocations;

#[derive(Debug)]
pub struct BottomLevelIndex {
    index: IndexHandle,
    result_buffer: BufferHandle,
    reference: u64,
    result_size: u64,
    geometry: IndexGeometry,
}

impl BottomLevelIndex {
    /// Build an index over `geometry` and wait for the GPU to finish
    ///
    /// Fails with `InvalidArgument` for an empty or malformed primitive list and
    /// with a resource creation error when the backend cannot allocate. On
    /// failure every intermediate allocation is released.
    pub fn build(device: &mut dyn GraphicsDevice, name: &str, geometry: IndexGeometry) -> Result<Self> {
        validate_geometry(name, &geometry)?;

        let descriptor = IndexDescriptor::BottomLevel {
            geometry: geometry.clone(),
            flags: IndexBuildFlags::PREFER_FAST_TRACE,
        };

        let mut pending = PendingAllocations::default();
        match Self::build_with(device, name, &descriptor, &mut pending) {
            Ok((index, result_buffer, result_size, scratch)) => {
                // Scratch stays in `pending` until the reference is known
                let reference = match device.index_reference(index) {
                    Ok(reference) => reference,
                    Err(e) => {
                        pending.release(device);
                        return Err(e);
                    }
                };
                device.destroy_buffer(scratch);
                lumen_debug!("lumen::BottomLevelIndex", "'{}': {} primitives, {} bytes",
                    name, geometry.primitive_count(), result_size);
                Ok(Self {
                    index,
                    result_buffer,
                    reference,
                    result_size,
                    geometry,
                })
            }
            Err(e) => {
                pending.release(device);
                Err(e)
            }
        }
    }

    fn build_with(
        device: &mut dyn GraphicsDevice,
        name: &str,
        descriptor: &IndexDescriptor,
        pending: &mut PendingAllocations,
    ) -> Result<(IndexHandle, BufferHandle, u64, BufferHandle)> {
        let requirements = device.query_memory_requirements(descriptor)?;

        let index = pending.index(device.create_index(descriptor)?);
        let result_buffer = pending.buffer(device.allocate_buffer(&BufferDesc::new(
            format!("{} bottom-level result", name),
            requirements.result_size,
            BufferUsage::SPATIAL_INDEX_STORAGE,
            MemoryKind::DeviceLocal,
        ))?);
        device.bind_memory(index, result_buffer)?;

        let scratch = pending.buffer(device.allocate_buffer(&BufferDesc::new(
            format!("{} bottom-level scratch", name),
            requirements.build_scratch_size,
            BufferUsage::SPATIAL_INDEX_SCRATCH,
            MemoryKind::DeviceLocal,
        ))?);

        let mut commands = device.begin_single_shot(&format!("{} bottom-level build", name))?;
        commands.build_index(IndexBuildCommand {
            descriptor: descriptor.clone(),
            instance_data: None,
            update_only: false,
            source: None,
            destination: index,
            scratch,
        });
        commands.index_build_barrier();
        device.submit_and_wait(commands)?;

        Ok((index, result_buffer, requirements.result_size, scratch))
    }

    pub fn handle(&self) -> IndexHandle {
        self.index
    }

    /// Opaque reference written into top-level instance records
    pub fn reference(&self) -> u64 {
        self.reference
    }

    pub fn primitive_count(&self) -> u32 {
        self.geometry.primitive_count()
    }

    pub fn result_size(&self) -> u64 {
        self.result_size
    }

    pub fn geometry(&self) -> &IndexGeometry {
        &self.geometry
    }

    /// Release the index and its result memory
    pub fn destroy(self, device: &mut dyn GraphicsDevice) {
        device.destroy_index(self.index);
        device.destroy_buffer(self.result_buffer);
    }
}

fn validate_geometry(name: &str, geometry: &IndexGeometry) -> Result<()> {
    match geometry {
        IndexGeometry::Triangles { vertex_format, vertex_stride, vertex_count, index_count, .. } => {
            if *index_count == 0 || *vertex_count == 0 {
                lumen_bail!("lumen::BottomLevelIndex", InvalidArgument,
                    "'{}': triangle geometry has an empty primitive list", name);
            }
            if index_count % 3 != 0 {
                lumen_bail!("lumen::BottomLevelIndex", InvalidArgument,
                    "'{}': index count {} is not a multiple of 3", name, index_count);
            }
            if *vertex_stride < vertex_format.size() {
                lumen_bail!("lumen::BottomLevelIndex", InvalidArgument,
                    "'{}': vertex stride {} is smaller than the position format ({} bytes)",
                    name, vertex_stride, vertex_format.size());
            }
        }
        IndexGeometry::Aabbs { aabb_count, stride, .. } => {
            if *aabb_count == 0 {
                lumen_bail!("lumen::BottomLevelIndex", InvalidArgument,
                    "'{}': box geometry has an empty primitive list", name);
            }
            if *stride < AABB_PRIMITIVE_SIZE {
                lumen_bail!("lumen::BottomLevelIndex", InvalidArgument,
                    "'{}': box stride {} is smaller than {} bytes", name, stride, AABB_PRIMITIVE_SIZE);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "bottom_level_tests.rs"]
mod tests;
