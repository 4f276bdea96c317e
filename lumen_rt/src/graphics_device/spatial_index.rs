/// Spatial-index backend interface
///
/// Index structures are created unbound, bound to a result buffer, then
/// filled by an [`IndexBuildCommand`](super::IndexBuildCommand) recorded into a
/// command stream. Once built, an index exposes an opaque 8-byte reference
/// that top-level instance records point at.

use bitflags::bitflags;
use slotmap::new_key_type;
use crate::error::Result;
use super::buffer::{BufferHandle, VertexFormat};

new_key_type! {
    /// Backend-owned spatial index (bottom or top level)
    pub struct IndexHandle;
}

bitflags! {
    /// Build preferences for a spatial index
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IndexBuildFlags: u32 {
        /// The index may later be updated in place (refit)
        const ALLOW_UPDATE = 1 << 0;
        /// Optimise for traversal speed
        const PREFER_FAST_TRACE = 1 << 1;
        /// Optimise for build speed
        const PREFER_FAST_BUILD = 1 << 2;
    }
}

/// Size in bytes of one AABB primitive (min xyz, max xyz as f32)
pub const AABB_PRIMITIVE_SIZE: u64 = 24;

/// Primitive source of a bottom-level index
#[derive(Debug, Clone, PartialEq)]
pub enum IndexGeometry {
    /// Indexed triangle list
    Triangles {
        vertex_buffer: BufferHandle,
        vertex_format: VertexFormat,
        /// Byte distance between consecutive positions
        vertex_stride: u64,
        vertex_count: u32,
        /// 32-bit indices, three per triangle
        index_buffer: BufferHandle,
        index_count: u32,
        opaque: bool,
    },
    /// Axis-aligned boxes for analytic primitives
    Aabbs {
        aabb_buffer: BufferHandle,
        aabb_count: u32,
        stride: u64,
        opaque: bool,
    },
}

impl IndexGeometry {
    /// Number of primitives (triangles or boxes)
    pub fn primitive_count(&self) -> u32 {
        match self {
            IndexGeometry::Triangles { index_count, .. } => index_count / 3,
            IndexGeometry::Aabbs { aabb_count, .. } => *aabb_count,
        }
    }

    pub fn is_opaque(&self) -> bool {
        match self {
            IndexGeometry::Triangles { opaque, .. } | IndexGeometry::Aabbs { opaque, .. } => *opaque,
        }
    }
}

/// Level of a spatial index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexLevel {
    Bottom,
    Top,
}

/// Everything a backend needs to size and build an index
#[derive(Debug, Clone, PartialEq)]
pub enum IndexDescriptor {
    BottomLevel {
        geometry: IndexGeometry,
        flags: IndexBuildFlags,
    },
    TopLevel {
        instance_count: u32,
        flags: IndexBuildFlags,
    },
}

impl IndexDescriptor {
    pub fn level(&self) -> IndexLevel {
        match self {
            IndexDescriptor::BottomLevel { .. } => IndexLevel::Bottom,
            IndexDescriptor::TopLevel { .. } => IndexLevel::Top,
        }
    }

    pub fn flags(&self) -> IndexBuildFlags {
        match self {
            IndexDescriptor::BottomLevel { flags, .. } | IndexDescriptor::TopLevel { flags, .. } => *flags,
        }
    }

    /// Primitive count for bottom levels, instance count for top levels
    pub fn element_count(&self) -> u32 {
        match self {
            IndexDescriptor::BottomLevel { geometry, .. } => geometry.primitive_count(),
            IndexDescriptor::TopLevel { instance_count, .. } => *instance_count,
        }
    }
}

/// Memory needed to build and update an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexMemoryRequirements {
    pub result_size: u64,
    pub build_scratch_size: u64,
    pub update_scratch_size: u64,
}

/// Spatial-index backend (ray tracing hardware/driver extension)
pub trait SpatialIndexBackend {
    /// Result and scratch sizes for a descriptor
    fn query_memory_requirements(&self, descriptor: &IndexDescriptor) -> Result<IndexMemoryRequirements>;

    /// Create an index object; it holds no memory until `bind_memory`
    fn create_index(&mut self, descriptor: &IndexDescriptor) -> Result<IndexHandle>;

    /// Attach a result buffer (usage `SPATIAL_INDEX_STORAGE`) to an index
    fn bind_memory(&mut self, index: IndexHandle, memory: BufferHandle) -> Result<()>;

    /// Destroy an index object (its memory buffer is destroyed separately)
    fn destroy_index(&mut self, index: IndexHandle);

    /// Opaque 8-byte reference used by top-level instance records
    ///
    /// Fails with `ResourceCreationFailed` if the index is not resident.
    fn index_reference(&self, index: IndexHandle) -> Result<u64>;
}
