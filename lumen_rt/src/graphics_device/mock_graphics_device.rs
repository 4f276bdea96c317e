/// Mock graphics device for unit tests (no GPU required)
///
/// Buffers live in host memory and recorded command streams are executed on
/// submit: copies move bytes, index builds decode the vertex/box/instance
/// buffers exactly as a GPU would read them, and `trace_ray` answers ray
/// queries against a built top-level index by brute force.
///
/// Failure injection covers allocation budgets, index creation and submits.

use glam::{Mat4, Vec3};
use rustc_hash::FxHashMap;
use slotmap::SlotMap;
use crate::accel::{Aabb, InstanceRecord, INSTANCE_RECORD_SIZE};
use crate::error::{Error, Result};
use crate::graphics_device::{
    BufferDesc, BufferHandle, Command, CommandStream, FrameTicket, IndexBuildCommand,
    IndexBuildFlags, IndexDescriptor, IndexGeometry, IndexHandle, IndexMemoryRequirements,
    MemoryKind, PipelineBackend, PipelineHandle, RayTracingPipelineDesc, ResourceBackend,
    SpatialIndexBackend, TraceRaysCommand,
};

/// Handle size reported by the mock (matches common hardware)
pub const MOCK_HANDLE_SIZE: u32 = 32;

/// Deterministic identity handle for a pipeline group
pub fn mock_group_handle(group: u32) -> Vec<u8> {
    (0..MOCK_HANDLE_SIZE)
        .map(|i| (group as u8).wrapping_mul(31) ^ (0xA0u8.wrapping_add(i as u8)))
        .collect()
}

// ============================================================================
// Mock resources
// ============================================================================

pub struct MockBuffer {
    pub desc: BufferDesc,
    pub data: Vec<u8>,
}

/// Primitives decoded from a bottom-level build
#[derive(Debug, Clone)]
pub enum MockPrimitives {
    Triangles(Vec<[Vec3; 3]>),
    Boxes(Vec<Aabb>),
}

/// One instance decoded from a top-level build
#[derive(Debug, Clone)]
pub struct MockInstance {
    pub record: InstanceRecord,
    pub bottom_level: IndexHandle,
}

#[derive(Debug, Clone)]
pub enum MockIndexContent {
    Bottom(MockPrimitives),
    Top(Vec<MockInstance>),
}

pub struct MockIndex {
    pub descriptor: IndexDescriptor,
    pub requirements: IndexMemoryRequirements,
    pub memory: Option<BufferHandle>,
    pub reference: u64,
    pub content: Option<MockIndexContent>,
    pub build_count: u32,
    pub update_count: u32,
}

pub struct MockPipeline {
    pub desc: RayTracingPipelineDesc,
}

/// Result of a mock ray query
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MockHit {
    /// Position of the instance in the top-level build list
    pub instance: u32,
    pub instance_id: u32,
    pub hit_group_record: u32,
    pub primitive: u32,
    pub t: f32,
}

// ============================================================================
// MockGraphicsDevice
// ============================================================================

pub struct MockGraphicsDevice {
    pub buffers: SlotMap<BufferHandle, MockBuffer>,
    pub indices: SlotMap<IndexHandle, MockIndex>,
    pub pipelines: SlotMap<PipelineHandle, MockPipeline>,
    /// Labels of every submitted stream, in order
    pub submitted: Vec<String>,
    /// Every trace command executed
    pub traces: Vec<TraceRaysCommand>,
    /// Ranges passed to `flush_buffer`
    pub flushed: Vec<(BufferHandle, u64, u64)>,
    /// Total bytes the mock may allocate (None = unlimited)
    pub memory_budget: Option<u64>,
    pub allocated_bytes: u64,
    pub fail_index_creation: bool,
    /// Report built indices as not resident
    pub fail_index_reference: bool,
    /// Destroy calls on handles that were already released
    pub stale_destroys: usize,
    /// Error returned by the next submit instead of executing it
    pub fail_next_submit: Option<Error>,
    pub handle_alignment: u32,
    pub base_alignment: u32,
    references: FxHashMap<u64, IndexHandle>,
    next_reference: u64,
    next_frame: u64,
    waited_frames: Vec<FrameTicket>,
}

impl MockGraphicsDevice {
    pub fn new() -> Self {
        Self {
            buffers: SlotMap::with_key(),
            indices: SlotMap::with_key(),
            pipelines: SlotMap::with_key(),
            submitted: Vec::new(),
            traces: Vec::new(),
            flushed: Vec::new(),
            memory_budget: None,
            allocated_bytes: 0,
            fail_index_creation: false,
            fail_index_reference: false,
            stale_destroys: 0,
            fail_next_submit: None,
            handle_alignment: 16,
            base_alignment: 16,
            references: FxHashMap::default(),
            next_reference: 0x1000,
            next_frame: 0,
            waited_frames: Vec::new(),
        }
    }

    /// Host copy of a buffer regardless of its memory kind
    pub fn buffer_bytes(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(buffer).map(|b| b.data.as_slice())
    }

    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_index_count(&self) -> usize {
        self.indices.len()
    }

    pub fn waited_frames(&self) -> &[FrameTicket] {
        &self.waited_frames
    }

    /// Closest hit of a ray against a built top-level index
    ///
    /// Instances whose mask shares no bit with `cull_mask` are skipped.
    /// Triangles are treated as double-sided.
    pub fn trace_ray(&self, top_level: IndexHandle, origin: Vec3, direction: Vec3, cull_mask: u8) -> Option<MockHit> {
        let instances = match self.indices.get(top_level)?.content.as_ref()? {
            MockIndexContent::Top(instances) => instances,
            MockIndexContent::Bottom(_) => return None,
        };

        let mut closest: Option<MockHit> = None;
        for (position, instance) in instances.iter().enumerate() {
            if instance.record.mask() & cull_mask == 0 {
                continue;
            }
            let primitives = match self.indices.get(instance.bottom_level).and_then(|i| i.content.as_ref()) {
                Some(MockIndexContent::Bottom(primitives)) => primitives,
                _ => continue,
            };

            // Object space ray; the parameter t is preserved by the affine map
            let world_to_object = instance.record.matrix().inverse();
            let local_origin = world_to_object.transform_point3(origin);
            let local_direction = world_to_object.transform_vector3(direction);
            let t_max = closest.map(|h| h.t).unwrap_or(f32::INFINITY);

            if let Some((primitive, t)) = intersect_primitives(primitives, local_origin, local_direction, t_max) {
                closest = Some(MockHit {
                    instance: position as u32,
                    instance_id: instance.record.custom_index(),
                    hit_group_record: instance.record.hit_group_record(),
                    primitive,
                    t,
                });
            }
        }
        closest
    }

    fn execute(&mut self, commands: &CommandStream) -> Result<()> {
        if let Some(error) = self.fail_next_submit.take() {
            return Err(error);
        }
        for command in commands.commands() {
            match command {
                Command::CopyBuffer { src, dst, size } => self.copy(*src, *dst, *size)?,
                Command::BuildIndex(build) => self.build(build)?,
                Command::IndexBuildBarrier => {}
                Command::TraceRays(trace) => self.traces.push(trace.clone()),
            }
        }
        self.submitted.push(commands.label().to_string());
        Ok(())
    }

    fn copy(&mut self, src: BufferHandle, dst: BufferHandle, size: u64) -> Result<()> {
        let bytes = self
            .buffers
            .get(src)
            .and_then(|b| b.data.get(..size as usize))
            .ok_or_else(|| Error::BackendError("copy source out of bounds".to_string()))?
            .to_vec();
        let target = self
            .buffers
            .get_mut(dst)
            .and_then(|b| b.data.get_mut(..size as usize))
            .ok_or_else(|| Error::BackendError("copy destination out of bounds".to_string()))?;
        target.copy_from_slice(&bytes);
        Ok(())
    }

    fn build(&mut self, build: &IndexBuildCommand) -> Result<()> {
        let index = self
            .indices
            .get(build.destination)
            .ok_or_else(|| Error::BackendError("build into unknown index".to_string()))?;
        let memory = index
            .memory
            .ok_or_else(|| Error::BackendError("build into an index without memory".to_string()))?;
        if self.buffers.get(memory).map(|b| b.desc.size).unwrap_or(0) < index.requirements.result_size {
            return Err(Error::BackendError("index memory smaller than required".to_string()));
        }
        let scratch_needed = if build.update_only {
            index.requirements.update_scratch_size
        } else {
            index.requirements.build_scratch_size
        };
        if self.buffers.get(build.scratch).map(|b| b.desc.size).unwrap_or(0) < scratch_needed {
            return Err(Error::BackendError("scratch buffer smaller than required".to_string()));
        }

        if build.update_only {
            let updatable = index.descriptor.flags().contains(IndexBuildFlags::ALLOW_UPDATE);
            if build.source != Some(build.destination) || !updatable || index.content.is_none() {
                return Err(Error::BackendError("invalid index update".to_string()));
            }
            if build.descriptor.element_count() != index.descriptor.element_count() {
                return Err(Error::BackendError("index update changed the element count".to_string()));
            }
        }

        let content = match &build.descriptor {
            IndexDescriptor::BottomLevel { geometry, .. } => MockIndexContent::Bottom(self.decode_geometry(geometry)?),
            IndexDescriptor::TopLevel { instance_count, .. } => {
                let buffer = build
                    .instance_data
                    .ok_or_else(|| Error::BackendError("top-level build without instances".to_string()))?;
                MockIndexContent::Top(self.decode_instances(buffer, *instance_count)?)
            }
        };

        let index = &mut self.indices[build.destination];
        index.content = Some(content);
        if build.update_only {
            index.update_count += 1;
        } else {
            index.build_count += 1;
        }
        Ok(())
    }

    fn read_all(&self, buffer: BufferHandle) -> Result<&[u8]> {
        self.buffer_bytes(buffer)
            .ok_or_else(|| Error::BackendError("build reads an unknown buffer".to_string()))
    }

    fn decode_geometry(&self, geometry: &IndexGeometry) -> Result<MockPrimitives> {
        let f32_at = |bytes: &[u8], offset: usize| -> Result<f32> {
            bytes
                .get(offset..offset + 4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .ok_or_else(|| Error::BackendError("geometry read out of bounds".to_string()))
        };
        let vec3_at = |bytes: &[u8], offset: usize| -> Result<Vec3> {
            Ok(Vec3::new(f32_at(bytes, offset)?, f32_at(bytes, offset + 4)?, f32_at(bytes, offset + 8)?))
        };

        match geometry {
            IndexGeometry::Triangles { vertex_buffer, vertex_stride, vertex_count, index_buffer, index_count, .. } => {
                let vertices = self.read_all(*vertex_buffer)?;
                let indices = self.read_all(*index_buffer)?;
                let mut triangles = Vec::with_capacity(*index_count as usize / 3);
                for t in 0..(*index_count as usize / 3) {
                    let mut corners = [Vec3::ZERO; 3];
                    for (c, corner) in corners.iter_mut().enumerate() {
                        let offset = (t * 3 + c) * 4;
                        let vertex = indices
                            .get(offset..offset + 4)
                            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                            .ok_or_else(|| Error::BackendError("index read out of bounds".to_string()))?;
                        if vertex >= *vertex_count {
                            return Err(Error::BackendError(format!("vertex {} out of bounds", vertex)));
                        }
                        *corner = vec3_at(vertices, vertex as usize * *vertex_stride as usize)?;
                    }
                    triangles.push(corners);
                }
                Ok(MockPrimitives::Triangles(triangles))
            }
            IndexGeometry::Aabbs { aabb_buffer, aabb_count, stride, .. } => {
                let bytes = self.read_all(*aabb_buffer)?;
                let boxes = (0..*aabb_count as usize)
                    .map(|i| {
                        let offset = i * *stride as usize;
                        Ok(Aabb::new(vec3_at(bytes, offset)?, vec3_at(bytes, offset + 12)?))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(MockPrimitives::Boxes(boxes))
            }
        }
    }

    fn decode_instances(&self, buffer: BufferHandle, count: u32) -> Result<Vec<MockInstance>> {
        let bytes = self.read_all(buffer)?;
        (0..count as usize)
            .map(|i| {
                let start = i * INSTANCE_RECORD_SIZE as usize;
                let raw = bytes
                    .get(start..start + INSTANCE_RECORD_SIZE as usize)
                    .ok_or_else(|| Error::BackendError("instance read out of bounds".to_string()))?;
                let record: InstanceRecord = bytemuck::pod_read_unaligned(raw);
                let bottom_level = *self
                    .references
                    .get(&record.bottom_level_reference)
                    .ok_or_else(|| Error::BackendError(format!(
                        "instance {} has unknown bottom-level reference {:#x}", i, record.bottom_level_reference
                    )))?;
                Ok(MockInstance { record, bottom_level })
            })
            .collect()
    }

    fn requirements_for(descriptor: &IndexDescriptor) -> IndexMemoryRequirements {
        let n = descriptor.element_count() as u64;
        match descriptor {
            IndexDescriptor::BottomLevel { .. } => IndexMemoryRequirements {
                result_size: 256 + 64 * n,
                build_scratch_size: 128 + 32 * n,
                update_scratch_size: 0,
            },
            IndexDescriptor::TopLevel { .. } => IndexMemoryRequirements {
                result_size: 128 + 64 * n,
                build_scratch_size: 128 + 32 * n,
                update_scratch_size: 64 + 16 * n,
            },
        }
    }
}

impl Default for MockGraphicsDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn intersect_primitives(primitives: &MockPrimitives, origin: Vec3, direction: Vec3, t_max: f32) -> Option<(u32, f32)> {
    let mut best: Option<(u32, f32)> = None;
    let mut limit = t_max;
    match primitives {
        MockPrimitives::Triangles(triangles) => {
            for (i, triangle) in triangles.iter().enumerate() {
                if let Some(t) = intersect_triangle(triangle, origin, direction, limit) {
                    best = Some((i as u32, t));
                    limit = t;
                }
            }
        }
        MockPrimitives::Boxes(boxes) => {
            for (i, aabb) in boxes.iter().enumerate() {
                if let Some(t) = aabb.intersect_ray(origin, direction, 0.0, limit) {
                    best = Some((i as u32, t));
                    limit = t;
                }
            }
        }
    }
    best
}

/// Möller-Trumbore, double-sided
fn intersect_triangle(triangle: &[Vec3; 3], origin: Vec3, direction: Vec3, t_max: f32) -> Option<f32> {
    let edge1 = triangle[1] - triangle[0];
    let edge2 = triangle[2] - triangle[0];
    let p = direction.cross(edge2);
    let det = edge1.dot(p);
    if det.abs() < 1e-8 {
        return None;
    }
    let inv_det = 1.0 / det;
    let s = origin - triangle[0];
    let u = s.dot(p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(edge1);
    let v = direction.dot(q) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = edge2.dot(q) * inv_det;
    (t > 1e-6 && t < t_max).then_some(t)
}

// ============================================================================
// Backend trait implementations
// ============================================================================

impl ResourceBackend for MockGraphicsDevice {
    fn allocate_buffer(&mut self, desc: &BufferDesc) -> Result<BufferHandle> {
        if desc.size == 0 {
            return Err(Error::ResourceCreationFailed(format!("buffer '{}' has zero size", desc.name)));
        }
        if let Some(budget) = self.memory_budget {
            if self.allocated_bytes + desc.size > budget {
                return Err(Error::OutOfMemory);
            }
        }
        self.allocated_bytes += desc.size;
        Ok(self.buffers.insert(MockBuffer {
            desc: desc.clone(),
            data: vec![0; desc.size as usize],
        }))
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        match self.buffers.remove(buffer) {
            Some(removed) => self.allocated_bytes -= removed.desc.size,
            None => self.stale_destroys += 1,
        }
    }

    fn buffer_size(&self, buffer: BufferHandle) -> Option<u64> {
        self.buffers.get(buffer).map(|b| b.desc.size)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let target = self
            .buffers
            .get_mut(buffer)
            .ok_or_else(|| Error::InvalidArgument("write to unknown buffer".to_string()))?;
        if target.desc.memory != MemoryKind::HostVisible {
            return Err(Error::InvalidArgument(format!("buffer '{}' is not host-visible", target.desc.name)));
        }
        let end = offset as usize + data.len();
        if end > target.data.len() {
            return Err(Error::OutOfRange(format!("write of {} bytes at {} past buffer end", data.len(), offset)));
        }
        target.data[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferHandle, offset: u64, size: u64) -> Result<Vec<u8>> {
        let source = self
            .buffers
            .get(buffer)
            .ok_or_else(|| Error::InvalidArgument("read from unknown buffer".to_string()))?;
        if source.desc.memory != MemoryKind::HostVisible {
            return Err(Error::InvalidArgument(format!("buffer '{}' is not host-visible", source.desc.name)));
        }
        source
            .data
            .get(offset as usize..(offset + size) as usize)
            .map(|b| b.to_vec())
            .ok_or_else(|| Error::OutOfRange("read past buffer end".to_string()))
    }

    fn flush_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64) -> Result<()> {
        self.flushed.push((buffer, offset, size));
        Ok(())
    }

    fn submit_and_wait(&mut self, commands: CommandStream) -> Result<()> {
        self.execute(&commands)
    }

    fn submit_frame(&mut self, commands: CommandStream) -> Result<FrameTicket> {
        self.execute(&commands)?;
        self.next_frame += 1;
        Ok(FrameTicket(self.next_frame))
    }

    fn wait_frame(&mut self, ticket: FrameTicket, _timeout_ns: u64) -> Result<()> {
        if ticket.0 > self.next_frame {
            return Err(Error::BackendError(format!("frame {} was never submitted", ticket.0)));
        }
        self.waited_frames.push(ticket);
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<()> {
        Ok(())
    }
}

impl SpatialIndexBackend for MockGraphicsDevice {
    fn query_memory_requirements(&self, descriptor: &IndexDescriptor) -> Result<IndexMemoryRequirements> {
        Ok(Self::requirements_for(descriptor))
    }

    fn create_index(&mut self, descriptor: &IndexDescriptor) -> Result<IndexHandle> {
        if self.fail_index_creation {
            return Err(Error::ResourceCreationFailed("mock index creation disabled".to_string()));
        }
        let reference = self.next_reference;
        self.next_reference += 0x100;
        let handle = self.indices.insert(MockIndex {
            descriptor: descriptor.clone(),
            requirements: Self::requirements_for(descriptor),
            memory: None,
            reference,
            content: None,
            build_count: 0,
            update_count: 0,
        });
        self.references.insert(reference, handle);
        Ok(handle)
    }

    fn bind_memory(&mut self, index: IndexHandle, memory: BufferHandle) -> Result<()> {
        if !self.buffers.contains_key(memory) {
            return Err(Error::ResourceCreationFailed("bind to unknown buffer".to_string()));
        }
        let target = self
            .indices
            .get_mut(index)
            .ok_or_else(|| Error::ResourceCreationFailed("bind of unknown index".to_string()))?;
        target.memory = Some(memory);
        Ok(())
    }

    fn destroy_index(&mut self, index: IndexHandle) {
        match self.indices.remove(index) {
            Some(removed) => {
                self.references.remove(&removed.reference);
            }
            None => self.stale_destroys += 1,
        }
    }

    fn index_reference(&self, index: IndexHandle) -> Result<u64> {
        match self.indices.get(index) {
            Some(i) if i.content.is_some() && !self.fail_index_reference => Ok(i.reference),
            _ => Err(Error::ResourceCreationFailed("index is not resident".to_string())),
        }
    }
}

impl PipelineBackend for MockGraphicsDevice {
    fn create_pipeline(&mut self, desc: &RayTracingPipelineDesc) -> Result<PipelineHandle> {
        Ok(self.pipelines.insert(MockPipeline { desc: desc.clone() }))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        self.pipelines.remove(pipeline);
    }

    fn shader_group_handle_size(&self) -> u32 {
        MOCK_HANDLE_SIZE
    }

    fn shader_group_handle_alignment(&self) -> u32 {
        self.handle_alignment
    }

    fn shader_group_base_alignment(&self) -> u32 {
        self.base_alignment
    }

    fn group_handles(&self, pipeline: PipelineHandle, first_group: u32, group_count: u32) -> Result<Vec<u8>> {
        let desc = &self
            .pipelines
            .get(pipeline)
            .ok_or_else(|| Error::InvalidArgument("unknown pipeline".to_string()))?
            .desc;
        if first_group + group_count > desc.groups.len() as u32 {
            return Err(Error::OutOfRange("group range past pipeline end".to_string()));
        }
        Ok((first_group..first_group + group_count).flat_map(mock_group_handle).collect())
    }
}

/// Matrix helper used by tests that compare mock hits against transforms
pub fn translated(x: f32, y: f32, z: f32) -> Mat4 {
    Mat4::from_translation(Vec3::new(x, y, z))
}

#[cfg(test)]
#[path = "mock_graphics_device_tests.rs"]
mod tests;
