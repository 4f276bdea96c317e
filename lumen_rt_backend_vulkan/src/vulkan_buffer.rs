/// Buffer - Vulkan buffer with its gpu-allocator allocation

use lumen_rt::lumen::{Error, Result};
use lumen_rt::lumen::device::MemoryKind;
use lumen_rt::{lumen_bail, lumen_err};
use ash::vk;
use gpu_allocator::vulkan::Allocation;
use std::sync::Arc;

use crate::vulkan_context::GpuContext;
use crate::vulkan_conversion::flush_range;

/// Vulkan buffer implementation
pub struct Buffer {
    /// Shared GPU context (device, allocator, queue, command pool)
    ctx: Arc<GpuContext>,
    pub(crate) buffer: vk::Buffer,
    /// GPU memory allocation
    pub(crate) allocation: Option<Allocation>,
    pub(crate) size: u64,
    pub(crate) memory: MemoryKind,
    /// Zero unless created with SHADER_DEVICE_ADDRESS
    pub(crate) address: vk::DeviceAddress,
}

impl Buffer {
    pub fn new(
        ctx: Arc<GpuContext>,
        buffer: vk::Buffer,
        allocation: Allocation,
        size: u64,
        memory: MemoryKind,
        address: vk::DeviceAddress,
    ) -> Self {
        Self {
            ctx,
            buffer,
            allocation: Some(allocation),
            size,
            memory,
            address,
        }
    }

    fn check_range(&self, offset: u64, size: u64) -> Result<()> {
        if offset.checked_add(size).map_or(true, |end| end > self.size) {
            lumen_bail!("lumen::vulkan", OutOfRange,
                "range {}+{} outside buffer of {} bytes", offset, size, self.size);
        }
        Ok(())
    }

    fn mapped_ptr(&self) -> Result<*mut u8> {
        if self.memory != MemoryKind::HostVisible {
            lumen_bail!("lumen::vulkan", InvalidArgument, "buffer is not host-visible");
        }
        let allocation = match &self.allocation {
            Some(allocation) => allocation,
            None => lumen_bail!("lumen::vulkan", "buffer has no allocation"),
        };
        allocation
            .mapped_ptr()
            .map(|ptr| ptr.as_ptr() as *mut u8)
            .ok_or_else(|| Error::BackendError("Buffer is not CPU-accessible".to_string()))
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len() as u64)?;
        let mapped_ptr = self.mapped_ptr()?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped_ptr.add(offset as usize), data.len());
        }
        Ok(())
    }

    pub fn read(&self, offset: u64, size: u64) -> Result<Vec<u8>> {
        self.check_range(offset, size)?;
        let mapped_ptr = self.mapped_ptr()?;
        let mut data = vec![0u8; size as usize];
        unsafe {
            std::ptr::copy_nonoverlapping(mapped_ptr.add(offset as usize), data.as_mut_ptr(), data.len());
        }
        Ok(data)
    }

    /// Flush host writes unless the memory is coherent
    pub fn flush(&self, offset: u64, size: u64) -> Result<()> {
        self.check_range(offset, size)?;
        let allocation = match &self.allocation {
            Some(allocation) if self.memory == MemoryKind::HostVisible => allocation,
            _ => lumen_bail!("lumen::vulkan", InvalidArgument, "flush of a buffer that is not host-visible"),
        };
        if allocation.memory_properties().contains(vk::MemoryPropertyFlags::HOST_COHERENT) {
            return Ok(());
        }

        let (start, length) = flush_range(
            allocation.offset(),
            allocation.size(),
            offset,
            size,
            self.ctx.limits.non_coherent_atom_size,
        );
        let range = vk::MappedMemoryRange::default()
            .memory(unsafe { allocation.memory() })
            .offset(start)
            .size(length);
        unsafe {
            self.ctx
                .device
                .flush_mapped_memory_ranges(&[range])
                .map_err(|e| lumen_err!("lumen::vulkan", "Failed to flush buffer range: {:?}", e))
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            // Free GPU memory
            if let Some(allocation) = self.allocation.take() {
                // Don't panic if lock fails - we still need to destroy the buffer
                if let Ok(mut allocator) = self.ctx.allocator.lock() {
                    allocator.free(allocation).ok();
                }
            }

            self.ctx.device.destroy_buffer(self.buffer, None);
        }
    }
}
