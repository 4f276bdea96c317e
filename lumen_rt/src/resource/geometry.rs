//! Geometry store.
//!
//! Owns the source data of every distinct mesh or analytic primitive, its
//! device-local copy and its bottom-level index. Geometries are addressed by a
//! stable [`GeometryId`] assigned in registration order; instances hold the id,
//! never a reference.
//!
//! # Kinds
//!
//! - **Mesh**: interleaved vertices whose first 12 bytes are an `f32` position,
//!   plus 32-bit triangle indices
//! - **Sphere**: a single box primitive `center ± radius`, resolved by an
//!   intersection program at trace time

use glam::Vec3;
use rustc_hash::FxHashMap;
use crate::accel::{Aabb, BottomLevelIndex};
use crate::error::Result;
use crate::graphics_device::{
    BufferDesc, BufferHandle, BufferUsage, CommandStream, GraphicsDevice, IndexGeometry, MemoryKind,
    VertexFormat, AABB_PRIMITIVE_SIZE,
};
use crate::{lumen_bail, lumen_debug, lumen_info};

/// Stable geometry id (registration order)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeometryId(pub u32);

// ============================================================================
// GEOMETRY DESCRIPTOR
// ============================================================================

/// Source data for a geometry registration
#[derive(Debug, Clone)]
pub enum GeometryDesc {
    Mesh {
        name: String,
        /// Interleaved vertex data, position first
        vertex_data: Vec<u8>,
        vertex_stride: u64,
        indices: Vec<u32>,
        opaque: bool,
    },
    Sphere {
        name: String,
        center: Vec3,
        radius: f32,
        opaque: bool,
    },
}

impl GeometryDesc {
    /// Opaque mesh from bare positions (12-byte stride)
    pub fn mesh_from_positions(name: impl Into<String>, positions: &[Vec3], indices: Vec<u32>) -> Self {
        let raw: Vec<[f32; 3]> = positions.iter().map(|p| p.to_array()).collect();
        GeometryDesc::Mesh {
            name: name.into(),
            vertex_data: bytemuck::cast_slice(&raw).to_vec(),
            vertex_stride: VertexFormat::R32G32B32_SFLOAT.size(),
            indices,
            opaque: true,
        }
    }

    /// Opaque sphere
    pub fn sphere(name: impl Into<String>, center: Vec3, radius: f32) -> Self {
        GeometryDesc::Sphere {
            name: name.into(),
            center,
            radius,
            opaque: true,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            GeometryDesc::Mesh { name, .. } | GeometryDesc::Sphere { name, .. } => name,
        }
    }
}

// ============================================================================
// GEOMETRY
// ============================================================================

/// Kind-specific data of a registered geometry
#[derive(Debug, Clone)]
pub enum GeometryKind {
    Mesh {
        vertex_buffer: BufferHandle,
        index_buffer: BufferHandle,
        vertex_stride: u64,
        vertex_count: u32,
        index_count: u32,
    },
    Sphere {
        center: Vec3,
        radius: f32,
        aabb_buffer: BufferHandle,
    },
}

impl GeometryKind {
    fn buffers(&self) -> Vec<BufferHandle> {
        match self {
            GeometryKind::Mesh { vertex_buffer, index_buffer, .. } => vec![*vertex_buffer, *index_buffer],
            GeometryKind::Sphere { aabb_buffer, .. } => vec![*aabb_buffer],
        }
    }
}

#[derive(Debug)]
pub struct Geometry {
    id: GeometryId,
    name: String,
    kind: GeometryKind,
    /// Local-space bounds
    bounds: Aabb,
    bottom_level: BottomLevelIndex,
}

impl Geometry {
    pub fn id(&self) -> GeometryId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &GeometryKind {
        &self.kind
    }

    pub fn bounds(&self) -> Aabb {
        self.bounds
    }

    pub fn bottom_level(&self) -> &BottomLevelIndex {
        &self.bottom_level
    }

    /// True when hits are resolved by an intersection program
    pub fn is_procedural(&self) -> bool {
        matches!(self.kind, GeometryKind::Sphere { .. })
    }

    fn destroy(self, device: &mut dyn GraphicsDevice) {
        self.bottom_level.destroy(device);
        for buffer in self.kind.buffers() {
            device.destroy_buffer(buffer);
        }
    }
}

// ============================================================================
// GEOMETRY STORE
// ============================================================================

#[derive(Debug, Default)]
pub struct GeometryStore {
    geometries: Vec<Geometry>,
    names: FxHashMap<String, GeometryId>,
}

impl GeometryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upload a geometry and build its bottom-level index
    ///
    /// Blocks until the GPU has finished. Fails with `InvalidArgument` for
    /// malformed data or a duplicate name; nothing is left allocated on
    /// failure.
    pub fn register(&mut self, device: &mut dyn GraphicsDevice, desc: GeometryDesc) -> Result<GeometryId> {
        if self.names.contains_key(desc.name()) {
            lumen_bail!("lumen::GeometryStore", InvalidArgument, "geometry '{}' already registered", desc.name());
        }
        let id = GeometryId(self.geometries.len() as u32);

        let geometry = match desc {
            GeometryDesc::Mesh { name, vertex_data, vertex_stride, indices, opaque } => {
                let bounds = validate_mesh(&name, &vertex_data, vertex_stride, &indices)?;
                let vertex_count = (vertex_data.len() as u64 / vertex_stride) as u32;

                let mut uploads = Uploads::new(&name);
                let result = uploads
                    .push(device, "vertices", &vertex_data, BufferUsage::VERTEX)
                    .and_then(|vb| {
                        uploads
                            .push(device, "indices", bytemuck::cast_slice(&indices), BufferUsage::INDEX)
                            .map(|ib| (vb, ib))
                    })
                    .and_then(|buffers| uploads.submit(device).map(|_| buffers));
                let (vertex_buffer, index_buffer) = match result {
                    Ok(buffers) => buffers,
                    Err(e) => {
                        uploads.abandon(device);
                        return Err(e);
                    }
                };

                let kind = GeometryKind::Mesh {
                    vertex_buffer,
                    index_buffer,
                    vertex_stride,
                    vertex_count,
                    index_count: indices.len() as u32,
                };
                let index_geometry = IndexGeometry::Triangles {
                    vertex_buffer,
                    vertex_format: VertexFormat::R32G32B32_SFLOAT,
                    vertex_stride,
                    vertex_count,
                    index_buffer,
                    index_count: indices.len() as u32,
                    opaque,
                };
                Self::finish(device, id, name, kind, bounds, index_geometry)?
            }
            GeometryDesc::Sphere { name, center, radius, opaque } => {
                if !radius.is_finite() || radius <= 0.0 || !center.is_finite() {
                    lumen_bail!("lumen::GeometryStore", InvalidArgument,
                        "'{}': sphere radius {} must be positive and finite", name, radius);
                }
                let bounds = Aabb::around_sphere(center, radius);
                let corners = [bounds.min.to_array(), bounds.max.to_array()];

                let mut uploads = Uploads::new(&name);
                let result = uploads
                    .push(device, "box", bytemuck::cast_slice(&corners), BufferUsage::empty())
                    .and_then(|ab| uploads.submit(device).map(|_| ab));
                let aabb_buffer = match result {
                    Ok(buffer) => buffer,
                    Err(e) => {
                        uploads.abandon(device);
                        return Err(e);
                    }
                };

                let kind = GeometryKind::Sphere { center, radius, aabb_buffer };
                let index_geometry = IndexGeometry::Aabbs {
                    aabb_buffer,
                    aabb_count: 1,
                    stride: AABB_PRIMITIVE_SIZE,
                    opaque,
                };
                Self::finish(device, id, name, kind, bounds, index_geometry)?
            }
        };

        lumen_info!("lumen::GeometryStore", "registered geometry {} '{}' ({} primitives)",
            id.0, geometry.name, geometry.bottom_level.primitive_count());
        self.names.insert(geometry.name.clone(), id);
        self.geometries.push(geometry);
        Ok(id)
    }

    fn finish(
        device: &mut dyn GraphicsDevice,
        id: GeometryId,
        name: String,
        kind: GeometryKind,
        bounds: Aabb,
        index_geometry: IndexGeometry,
    ) -> Result<Geometry> {
        match BottomLevelIndex::build(device, &name, index_geometry) {
            Ok(bottom_level) => Ok(Geometry { id, name, kind, bounds, bottom_level }),
            Err(e) => {
                for buffer in kind.buffers() {
                    device.destroy_buffer(buffer);
                }
                Err(e)
            }
        }
    }

    pub fn get(&self, id: GeometryId) -> Option<&Geometry> {
        self.geometries.get(id.0 as usize)
    }

    pub fn id_by_name(&self, name: &str) -> Option<GeometryId> {
        self.names.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.geometries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.geometries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Geometry> {
        self.geometries.iter()
    }

    /// Release every geometry, its buffers and its bottom-level index
    pub fn clear(&mut self, device: &mut dyn GraphicsDevice) {
        lumen_debug!("lumen::GeometryStore", "releasing {} geometries", self.geometries.len());
        for geometry in self.geometries.drain(..) {
            geometry.destroy(device);
        }
        self.names.clear();
    }
}

/// Validate mesh data and compute its local bounds
fn validate_mesh(name: &str, vertex_data: &[u8], vertex_stride: u64, indices: &[u32]) -> Result<Aabb> {
    let position_size = VertexFormat::R32G32B32_SFLOAT.size();
    if vertex_stride < position_size {
        lumen_bail!("lumen::GeometryStore", InvalidArgument,
            "'{}': vertex stride {} is smaller than a position ({} bytes)", name, vertex_stride, position_size);
    }
    if vertex_data.is_empty() || vertex_data.len() as u64 % vertex_stride != 0 {
        lumen_bail!("lumen::GeometryStore", InvalidArgument,
            "'{}': vertex data size {} is not a non-zero multiple of stride {}", name, vertex_data.len(), vertex_stride);
    }
    if indices.is_empty() || indices.len() % 3 != 0 {
        lumen_bail!("lumen::GeometryStore", InvalidArgument,
            "'{}': index count {} is not a non-zero multiple of 3", name, indices.len());
    }

    let vertex_count = vertex_data.len() as u64 / vertex_stride;
    if let Some(bad) = indices.iter().find(|i| **i as u64 >= vertex_count) {
        lumen_bail!("lumen::GeometryStore", InvalidArgument,
            "'{}': index {} references past the {} vertices", name, bad, vertex_count);
    }

    let positions = vertex_data
        .chunks_exact(vertex_stride as usize)
        .map(|vertex| Vec3::from_array(bytemuck::pod_read_unaligned::<[f32; 3]>(&vertex[..12])));
    Ok(Aabb::from_points(positions))
}

/// Staging uploads batched into one copy submission
struct Uploads {
    name: String,
    commands: CommandStream,
    staging: Vec<BufferHandle>,
    targets: Vec<BufferHandle>,
}

impl Uploads {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            commands: CommandStream::new(format!("{} upload", name)),
            staging: Vec::new(),
            targets: Vec::new(),
        }
    }

    /// Stage `data` and record its copy into a new device-local buffer
    fn push(&mut self, device: &mut dyn GraphicsDevice, label: &str, data: &[u8], usage: BufferUsage) -> Result<BufferHandle> {
        let size = data.len() as u64;
        let staging = device.allocate_buffer(&BufferDesc::staging(format!("{} {} staging", self.name, label), size))?;
        self.staging.push(staging);
        device.write_buffer(staging, 0, data)?;

        let target = device.allocate_buffer(&BufferDesc::new(
            format!("{} {}", self.name, label),
            size,
            usage | BufferUsage::STORAGE | BufferUsage::TRANSFER_DST | BufferUsage::SPATIAL_INDEX_INPUT,
            MemoryKind::DeviceLocal,
        ))?;
        self.targets.push(target);
        self.commands.copy_buffer(staging, target, size);
        Ok(target)
    }

    /// Run the copies and release the staging buffers
    fn submit(&mut self, device: &mut dyn GraphicsDevice) -> Result<()> {
        let commands = std::mem::take(&mut self.commands);
        let result = device.submit_and_wait(commands);
        for staging in self.staging.drain(..) {
            device.destroy_buffer(staging);
        }
        result
    }

    /// Release everything after a failure
    fn abandon(self, device: &mut dyn GraphicsDevice) {
        for buffer in self.staging.into_iter().chain(self.targets) {
            device.destroy_buffer(buffer);
        }
    }
}

#[cfg(test)]
#[path = "geometry_tests.rs"]
mod tests;
