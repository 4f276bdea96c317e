/// Buffer handle, usage flags and buffer descriptor

use bitflags::bitflags;
use slotmap::new_key_type;

new_key_type! {
    /// Backend-owned GPU buffer
    pub struct BufferHandle;
}

bitflags! {
    /// Buffer usage flags
    ///
    /// Backends translate these to their native usage bits; the `SPATIAL_INDEX_*`
    /// and `DISPATCH_TABLE` usages imply a device address.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Vertex data
        const VERTEX = 1 << 0;
        /// 32-bit index data
        const INDEX = 1 << 1;
        /// Shader storage
        const STORAGE = 1 << 2;
        /// Source of a copy
        const TRANSFER_SRC = 1 << 3;
        /// Destination of a copy
        const TRANSFER_DST = 1 << 4;
        /// Read by a spatial index build (vertices, indices, boxes, instances)
        const SPATIAL_INDEX_INPUT = 1 << 5;
        /// Backs a spatial index result
        const SPATIAL_INDEX_STORAGE = 1 << 6;
        /// Build/update scratch memory
        const SPATIAL_INDEX_SCRATCH = 1 << 7;
        /// Holds a dispatch table (shader binding table)
        const DISPATCH_TABLE = 1 << 8;
    }
}

/// Memory placement requested for a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Device-local, not mappable; filled through copies
    DeviceLocal,
    /// Host-visible and coherent; written through `write_buffer`
    HostVisible,
}

/// Descriptor for creating a buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    /// Debug name
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Buffer usage
    pub usage: BufferUsage,
    /// Memory placement
    pub memory: MemoryKind,
}

impl BufferDesc {
    pub fn new(name: impl Into<String>, size: u64, usage: BufferUsage, memory: MemoryKind) -> Self {
        Self {
            name: name.into(),
            size,
            usage,
            memory,
        }
    }

    /// Host-visible staging buffer used as a copy source
    pub fn staging(name: impl Into<String>, size: u64) -> Self {
        Self::new(name, size, BufferUsage::TRANSFER_SRC, MemoryKind::HostVisible)
    }
}

/// Vertex position format accepted by bottom-level builds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum VertexFormat {
    /// vec3 of 32-bit floats (12 bytes)
    R32G32B32_SFLOAT,
}

impl VertexFormat {
    /// Size in bytes of one position
    pub fn size(&self) -> u64 {
        match self {
            VertexFormat::R32G32B32_SFLOAT => 12,
        }
    }
}
