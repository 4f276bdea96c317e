/// Conversions from lumen descriptors to Vulkan enums and flags
///
/// Pure functions, so they are unit tested without a GPU.

use ash::vk;
use gpu_allocator::MemoryLocation;
use lumen_rt::lumen::device::{
    BufferUsage, IndexBuildFlags, IndexLevel, MemoryKind, ShaderGroupDesc, ShaderStage, StridedRegion, VertexFormat,
};

pub(crate) fn buffer_usage_to_vk(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();
    if usage.contains(BufferUsage::VERTEX) {
        flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDEX) {
        flags |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsage::STORAGE) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::TRANSFER_SRC) {
        flags |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(BufferUsage::TRANSFER_DST) {
        flags |= vk::BufferUsageFlags::TRANSFER_DST;
    }
    if usage.contains(BufferUsage::SPATIAL_INDEX_INPUT) {
        flags |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
    }
    if usage.contains(BufferUsage::SPATIAL_INDEX_STORAGE) {
        flags |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR;
    }
    if usage.contains(BufferUsage::SPATIAL_INDEX_SCRATCH) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::DISPATCH_TABLE) {
        flags |= vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR;
    }
    if needs_device_address(usage) {
        flags |= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
    }
    flags
}

/// Buffers read by builds or traces are addressed, never bound
pub(crate) fn needs_device_address(usage: BufferUsage) -> bool {
    usage.intersects(
        BufferUsage::SPATIAL_INDEX_INPUT
            | BufferUsage::SPATIAL_INDEX_STORAGE
            | BufferUsage::SPATIAL_INDEX_SCRATCH
            | BufferUsage::DISPATCH_TABLE,
    )
}

pub(crate) fn memory_kind_to_location(memory: MemoryKind) -> MemoryLocation {
    match memory {
        MemoryKind::DeviceLocal => MemoryLocation::GpuOnly,
        MemoryKind::HostVisible => MemoryLocation::CpuToGpu,
    }
}

pub(crate) fn build_flags_to_vk(flags: IndexBuildFlags) -> vk::BuildAccelerationStructureFlagsKHR {
    let mut vk_flags = vk::BuildAccelerationStructureFlagsKHR::empty();
    if flags.contains(IndexBuildFlags::ALLOW_UPDATE) {
        vk_flags |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE;
    }
    if flags.contains(IndexBuildFlags::PREFER_FAST_TRACE) {
        vk_flags |= vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;
    }
    if flags.contains(IndexBuildFlags::PREFER_FAST_BUILD) {
        vk_flags |= vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD;
    }
    vk_flags
}

pub(crate) fn index_level_to_vk(level: IndexLevel) -> vk::AccelerationStructureTypeKHR {
    match level {
        IndexLevel::Bottom => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        IndexLevel::Top => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
    }
}

pub(crate) fn vertex_format_to_vk(format: VertexFormat) -> vk::Format {
    match format {
        VertexFormat::R32G32B32_SFLOAT => vk::Format::R32G32B32_SFLOAT,
    }
}

pub(crate) fn geometry_flags(opaque: bool) -> vk::GeometryFlagsKHR {
    if opaque {
        vk::GeometryFlagsKHR::OPAQUE
    } else {
        vk::GeometryFlagsKHR::empty()
    }
}

pub(crate) fn shader_stage_to_vk(stage: ShaderStage) -> vk::ShaderStageFlags {
    match stage {
        ShaderStage::RayGen => vk::ShaderStageFlags::RAYGEN_KHR,
        ShaderStage::Miss => vk::ShaderStageFlags::MISS_KHR,
        ShaderStage::Callable => vk::ShaderStageFlags::CALLABLE_KHR,
        ShaderStage::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        ShaderStage::AnyHit => vk::ShaderStageFlags::ANY_HIT_KHR,
        ShaderStage::Intersection => vk::ShaderStageFlags::INTERSECTION_KHR,
    }
}

fn shader_or_unused(shader: Option<u32>) -> u32 {
    shader.unwrap_or(vk::SHADER_UNUSED_KHR)
}

pub(crate) fn shader_group_to_vk(group: &ShaderGroupDesc) -> vk::RayTracingShaderGroupCreateInfoKHR<'static> {
    let info = vk::RayTracingShaderGroupCreateInfoKHR::default()
        .general_shader(vk::SHADER_UNUSED_KHR)
        .closest_hit_shader(vk::SHADER_UNUSED_KHR)
        .any_hit_shader(vk::SHADER_UNUSED_KHR)
        .intersection_shader(vk::SHADER_UNUSED_KHR);
    match *group {
        ShaderGroupDesc::General { shader } => info
            .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
            .general_shader(shader),
        ShaderGroupDesc::TrianglesHit { closest_hit, any_hit } => info
            .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
            .closest_hit_shader(shader_or_unused(closest_hit))
            .any_hit_shader(shader_or_unused(any_hit)),
        ShaderGroupDesc::ProceduralHit { intersection, closest_hit, any_hit } => info
            .ty(vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP)
            .intersection_shader(intersection)
            .closest_hit_shader(shader_or_unused(closest_hit))
            .any_hit_shader(shader_or_unused(any_hit)),
    }
}

/// Region of a dispatch table buffer located at `table_address`
///
/// An empty region must have a null address.
pub(crate) fn strided_region_to_vk(table_address: vk::DeviceAddress, region: &StridedRegion) -> vk::StridedDeviceAddressRegionKHR {
    if region.size == 0 {
        return vk::StridedDeviceAddressRegionKHR::default();
    }
    vk::StridedDeviceAddressRegionKHR::default()
        .device_address(table_address + region.offset)
        .stride(region.stride)
        .size(region.size)
}

/// Host-to-device flush range aligned to `atom` inside an allocation
///
/// Returns `(offset, size)` relative to the start of the memory object.
pub(crate) fn flush_range(allocation_offset: u64, allocation_size: u64, offset: u64, size: u64, atom: u64) -> (u64, u64) {
    let atom = atom.max(1);
    let start = (allocation_offset + offset) / atom * atom;
    let end = (allocation_offset + offset + size).div_ceil(atom) * atom;
    let limit = (allocation_offset + allocation_size).div_ceil(atom) * atom;
    (start, end.min(limit) - start)
}

#[cfg(test)]
#[path = "vulkan_conversion_tests.rs"]
mod tests;
