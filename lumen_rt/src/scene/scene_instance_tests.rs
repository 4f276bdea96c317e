//! Unit tests for scene_instance.rs

use crate::scene::scene_instance::*;
use crate::dispatch::GroupIndex;
use crate::graphics_device::mock_graphics_device::MockGraphicsDevice;
use crate::resource::{GeometryDesc, GeometryId, GeometryStore};
use crate::lumen::Error;
use glam::{Mat4, Vec3, Vec4};

fn desc() -> SceneInstanceDesc {
    SceneInstanceDesc::new(GeometryId(0), GroupIndex(2))
}

#[test]
fn test_hit_record_is_80_bytes() {
    assert_eq!(HIT_RECORD_SIZE, 80);
    assert_eq!(std::mem::align_of::<HitRecord>(), 4);
}

#[test]
fn test_insert_assigns_sequential_indices() {
    let mut table = SceneInstanceTable::new();
    assert_eq!(table.insert(desc()), InstanceIndex(0));
    assert_eq!(table.insert(desc()), InstanceIndex(1));
    assert_eq!(table.len(), 2);
    assert!(table.topology_changed());
    assert_eq!(table.get(InstanceIndex(1)).unwrap().index(), InstanceIndex(1));
}

#[test]
fn test_defaults() {
    let mut table = SceneInstanceTable::new();
    let index = table.insert(desc());
    let instance = table.get(index).unwrap();
    assert_eq!(instance.visibility_mask(), 0xFF);
    assert_eq!(*instance.transform(), Mat4::IDENTITY);
    assert_eq!(instance.material(), None);
    assert_eq!(instance.dispatch_group(), GroupIndex(2));
}

#[test]
fn test_hit_record_contents() {
    let mut table = SceneInstanceTable::new();
    let index = table.insert(
        SceneInstanceDesc::new(GeometryId(3), GroupIndex(0))
            .with_material(MaterialRef::new(7).with_textures([1, -1]))
            .with_color(Vec4::new(0.5, 0.25, 1.0, 1.0)),
    );
    let record = table.get(index).unwrap().hit_record();
    assert_eq!(record.object_id, 3);
    assert_eq!(record.material_id, 7);
    assert_eq!(record.texture_ids, [1, -1]);
    assert_eq!(record.color, [0.5, 0.25, 1.0, 1.0]);
    assert_eq!(record.normal_matrix, [[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0]]);
    assert_eq!(record.as_bytes().len(), 80);
}

#[test]
fn test_missing_material_packs_minus_one() {
    let mut table = SceneInstanceTable::new();
    let index = table.insert(desc());
    let record = table.get(index).unwrap().hit_record();
    assert_eq!((record.material_id, record.texture_ids), (-1, [-1, -1]));
}

#[test]
fn test_normal_matrix_of_non_uniform_scale() {
    let rows = normal_matrix_rows(&Mat4::from_scale(Vec3::new(2.0, 4.0, 1.0)));
    assert_eq!(rows[0], [0.5, 0.0, 0.0, 0.0]);
    assert_eq!(rows[1], [0.0, 0.25, 0.0, 0.0]);
    assert_eq!(rows[2], [0.0, 0.0, 1.0, 0.0]);
}

#[test]
fn test_normal_matrix_ignores_translation() {
    let rows = normal_matrix_rows(&Mat4::from_translation(Vec3::new(5.0, 6.0, 7.0)));
    assert_eq!(rows, normal_matrix_rows(&Mat4::IDENTITY));
}

#[test]
fn test_singular_transform_falls_back_to_identity() {
    let rows = normal_matrix_rows(&Mat4::from_scale(Vec3::new(1.0, 0.0, 1.0)));
    assert_eq!(rows, normal_matrix_rows(&Mat4::IDENTITY));
}

#[test]
fn test_mutators_mark_dirty() {
    let mut table = SceneInstanceTable::new();
    let a = table.insert(desc());
    let b = table.insert(desc());
    table.mark_clean();

    table.set_color(b, Vec4::ZERO).unwrap();
    assert!(table.has_dirty_records());
    assert!(!table.has_dirty_transforms());

    table.set_transform(a, Mat4::from_translation(Vec3::X)).unwrap();
    assert!(table.has_dirty_transforms());
    assert_eq!(table.dirty_records(), vec![a, b]);

    table.set_visibility_mask(b, 0x01).unwrap();
    table.set_material(a, Some(MaterialRef::new(1))).unwrap();
    assert!(!table.topology_changed());

    table.mark_clean();
    assert!(!table.has_dirty_records() && !table.has_dirty_transforms());
}

#[test]
fn test_dispatch_group_change_is_topology_change() {
    let mut table = SceneInstanceTable::new();
    let a = table.insert(desc());
    table.mark_clean();
    table.set_dispatch_group(a, GroupIndex(2)).unwrap();
    assert!(!table.topology_changed());
    table.set_dispatch_group(a, GroupIndex(3)).unwrap();
    assert!(table.topology_changed());
}

#[test]
fn test_unknown_instance_is_out_of_range() {
    let mut table = SceneInstanceTable::new();
    table.insert(desc());
    let result = table.set_transform(InstanceIndex(4), Mat4::IDENTITY);
    assert!(matches!(result, Err(Error::OutOfRange(_))));
}

#[test]
fn test_top_level_instances_follow_table_order() {
    let mut device = MockGraphicsDevice::new();
    let mut store = GeometryStore::new();
    let quad = store
        .register(&mut device, GeometryDesc::mesh_from_positions("tri", &[Vec3::ZERO, Vec3::X, Vec3::Y], vec![0, 1, 2]))
        .unwrap();
    let ball = store.register(&mut device, GeometryDesc::sphere("ball", Vec3::ZERO, 1.0)).unwrap();

    let mut table = SceneInstanceTable::new();
    table.insert(SceneInstanceDesc::new(ball, GroupIndex(1)).with_visibility_mask(0x02));
    table.insert(SceneInstanceDesc::new(quad, GroupIndex(1)).with_transform(Mat4::from_translation(Vec3::Z)));

    let instances = table.top_level_instances(&store).unwrap();
    assert_eq!(instances.len(), 2);
    assert_eq!(instances[0].bottom_level, store.get(ball).unwrap().bottom_level().handle());
    assert_eq!((instances[0].instance_id, instances[0].hit_group_record, instances[0].mask), (0, 0, 0x02));
    assert_eq!((instances[1].instance_id, instances[1].hit_group_record), (1, 1));
    assert_eq!(instances[1].transform, Mat4::from_translation(Vec3::Z));
}

#[test]
fn test_unknown_geometry_rejected() {
    let store = GeometryStore::new();
    let mut table = SceneInstanceTable::new();
    table.insert(desc());
    assert!(matches!(table.top_level_instances(&store), Err(Error::InvalidArgument(_))));
}
