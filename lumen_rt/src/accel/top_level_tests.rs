//! Unit tests for top_level.rs

use crate::accel::bottom_level::BottomLevelIndex;
use crate::accel::top_level::*;
use crate::accel::InstanceRecord;
use crate::graphics_device::mock_graphics_device::{translated, MockGraphicsDevice};
use crate::graphics_device::{
    BufferDesc, BufferUsage, CommandStream, IndexGeometry, MemoryKind, ResourceBackend, VertexFormat,
};
use crate::lumen::Error;
use glam::{Mat4, Vec3};

/// Two-triangle quad spanning [-1, 1] in x and y
fn quad(device: &mut MockGraphicsDevice) -> BottomLevelIndex {
    let positions: [f32; 12] = [-1.0, -1.0, 0.0, 1.0, -1.0, 0.0, 1.0, 1.0, 0.0, -1.0, 1.0, 0.0];
    let indices: [u32; 6] = [0, 1, 2, 0, 2, 3];
    let mut upload = |data: &[u8]| {
        let buffer = device
            .allocate_buffer(&BufferDesc::new("input", data.len() as u64, BufferUsage::SPATIAL_INDEX_INPUT, MemoryKind::HostVisible))
            .unwrap();
        device.write_buffer(buffer, 0, data).unwrap();
        buffer
    };
    let vertex_buffer = upload(bytemuck::cast_slice(&positions));
    let index_buffer = upload(bytemuck::cast_slice(&indices));
    BottomLevelIndex::build(
        device,
        "quad",
        IndexGeometry::Triangles {
            vertex_buffer,
            vertex_format: VertexFormat::R32G32B32_SFLOAT,
            vertex_stride: 12,
            vertex_count: 4,
            index_buffer,
            index_count: 6,
            opaque: true,
        },
    )
    .unwrap()
}

fn two_instances(blas: &BottomLevelIndex) -> Vec<TopLevelInstance> {
    vec![
        TopLevelInstance::new(blas.handle(), 0, 0),
        TopLevelInstance::new(blas.handle(), 1, 1).with_transform(translated(5.0, 0.0, 0.0)),
    ]
}

fn read_records(device: &MockGraphicsDevice, tlas: &TopLevelIndex) -> Vec<InstanceRecord> {
    let bytes = device.read_buffer(tlas.instance_buffer(), 0, 64 * tlas.instance_count() as u64).unwrap();
    bytemuck::pod_collect_to_vec(&bytes)
}

#[test]
fn test_build_writes_one_record_per_instance() {
    let mut device = MockGraphicsDevice::new();
    let blas = quad(&mut device);
    let tlas = TopLevelIndex::build(&mut device, "scene", &two_instances(&blas), true).unwrap();

    assert_eq!(tlas.instance_count(), 2);
    let records = read_records(&device, &tlas);
    assert_eq!(records[0].bottom_level_reference, blas.reference());
    assert_eq!(records[1].custom_index(), 1);
    assert_eq!(records[1].hit_group_record(), 1);
    assert_eq!(records[1].matrix().w_axis.truncate(), Vec3::new(5.0, 0.0, 0.0));
}

#[test]
fn test_scratch_sized_for_build_and_update() {
    let mut device = MockGraphicsDevice::new();
    let blas = quad(&mut device);
    let tlas = TopLevelIndex::build(&mut device, "scene", &two_instances(&blas), true).unwrap();
    let requirements = tlas.memory_requirements();
    assert!(requirements.build_scratch_size >= requirements.update_scratch_size);
    assert!(tlas.allows_refit());
}

#[test]
fn test_built_index_answers_rays() {
    let mut device = MockGraphicsDevice::new();
    let blas = quad(&mut device);
    let tlas = TopLevelIndex::build(&mut device, "scene", &two_instances(&blas), true).unwrap();

    let hit = device.trace_ray(tlas.handle(), Vec3::new(5.0, 0.0, 3.0), Vec3::NEG_Z, 0xFF).unwrap();
    assert_eq!(hit.instance, 1);
    assert!(device.trace_ray(tlas.handle(), Vec3::new(2.5, 0.0, 3.0), Vec3::NEG_Z, 0xFF).is_none());
}

#[test]
fn test_refit_moves_instance() {
    let mut device = MockGraphicsDevice::new();
    let blas = quad(&mut device);
    let mut instances = two_instances(&blas);
    let mut tlas = TopLevelIndex::build(&mut device, "scene", &instances, true).unwrap();

    instances[0].transform = translated(-5.0, 0.0, 0.0);
    tlas.refit(&mut device, &instances).unwrap();

    assert_eq!(tlas.refit_count(), 1);
    assert_eq!(device.indices[tlas.handle()].update_count, 1);
    assert!(device.trace_ray(tlas.handle(), Vec3::new(0.0, 0.0, 3.0), Vec3::NEG_Z, 0xFF).is_none());
    let hit = device.trace_ray(tlas.handle(), Vec3::new(-5.0, 0.0, 3.0), Vec3::NEG_Z, 0xFF).unwrap();
    assert_eq!(hit.instance, 0);
}

#[test]
fn test_refit_with_unchanged_transforms_changes_nothing() {
    let mut device = MockGraphicsDevice::new();
    let blas = quad(&mut device);
    let instances = two_instances(&blas);
    let mut tlas = TopLevelIndex::build(&mut device, "scene", &instances, true).unwrap();
    let before = read_records(&device, &tlas);

    tlas.refit(&mut device, &instances).unwrap();
    tlas.refit(&mut device, &instances).unwrap();

    assert_eq!(read_records(&device, &tlas), before);
}

#[test]
fn test_refit_with_different_count_rejected() {
    let mut device = MockGraphicsDevice::new();
    let blas = quad(&mut device);
    let mut instances = two_instances(&blas);
    let mut tlas = TopLevelIndex::build(&mut device, "scene", &instances, true).unwrap();
    let before = read_records(&device, &tlas);

    instances.push(TopLevelInstance::new(blas.handle(), 2, 2));
    let result = tlas.refit(&mut device, &instances);

    assert!(matches!(result, Err(Error::InvalidArgument(_))));
    assert_eq!(tlas.refit_count(), 0);
    assert_eq!(read_records(&device, &tlas), before);
}

#[test]
fn test_refit_with_changed_hit_group_rejected() {
    let mut device = MockGraphicsDevice::new();
    let blas = quad(&mut device);
    let mut instances = two_instances(&blas);
    let mut tlas = TopLevelIndex::build(&mut device, "scene", &instances, true).unwrap();

    instances[1].hit_group_record = 0;
    assert!(matches!(tlas.refit(&mut device, &instances), Err(Error::InvalidArgument(_))));
}

#[test]
fn test_refit_without_allow_refit_rejected() {
    let mut device = MockGraphicsDevice::new();
    let blas = quad(&mut device);
    let instances = two_instances(&blas);
    let mut tlas = TopLevelIndex::build(&mut device, "scene", &instances, false).unwrap();
    assert!(matches!(tlas.refit(&mut device, &instances), Err(Error::InvalidArgument(_))));
}

#[test]
fn test_record_refit_only_records() {
    let mut device = MockGraphicsDevice::new();
    let blas = quad(&mut device);
    let instances = two_instances(&blas);
    let mut tlas = TopLevelIndex::build(&mut device, "scene", &instances, true).unwrap();
    let submitted = device.submitted.len();

    let mut commands = CommandStream::new("frame");
    tlas.record_refit(&mut device, &mut commands, &instances).unwrap();

    assert_eq!(commands.len(), 2);
    assert_eq!(device.submitted.len(), submitted);
}

#[test]
fn test_unbuilt_bottom_level_rejected() {
    let mut device = MockGraphicsDevice::new();
    let blas = quad(&mut device);
    let handle = blas.handle();
    blas.destroy(&mut device);
    let result = TopLevelIndex::build(&mut device, "scene", &[TopLevelInstance::new(handle, 0, 0)], true);
    assert!(result.unwrap_err().is_resource_creation());
}

#[test]
fn test_oversized_instance_id_rejected() {
    let mut device = MockGraphicsDevice::new();
    let blas = quad(&mut device);
    let result = TopLevelIndex::build(&mut device, "scene", &[TopLevelInstance::new(blas.handle(), 1 << 24, 0)], true);
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
}

#[test]
fn test_empty_scene_builds() {
    let mut device = MockGraphicsDevice::new();
    let tlas = TopLevelIndex::build(&mut device, "empty", &[], true).unwrap();
    assert_eq!(tlas.instance_count(), 0);
    assert!(device.trace_ray(tlas.handle(), Vec3::ZERO, Vec3::NEG_Z, 0xFF).is_none());
    tlas.destroy(&mut device);
}

#[test]
fn test_mask_hides_instance() {
    let mut device = MockGraphicsDevice::new();
    let blas = quad(&mut device);
    let instances = vec![TopLevelInstance::new(blas.handle(), 0, 0).with_mask(0x02).with_transform(Mat4::IDENTITY)];
    let tlas = TopLevelIndex::build(&mut device, "scene", &instances, false).unwrap();
    assert!(device.trace_ray(tlas.handle(), Vec3::new(0.0, 0.0, 1.0), Vec3::NEG_Z, 0x01).is_none());
    assert!(device.trace_ray(tlas.handle(), Vec3::new(0.0, 0.0, 1.0), Vec3::NEG_Z, 0x02).is_some());
}
