//! Unit tests for geometry.rs

use crate::resource::geometry::*;
use crate::graphics_device::mock_graphics_device::MockGraphicsDevice;
use crate::graphics_device::IndexGeometry;
use crate::lumen::Error;
use glam::Vec3;

fn quad_desc(name: &str) -> GeometryDesc {
    GeometryDesc::mesh_from_positions(
        name,
        &[
            Vec3::new(-1.0, -1.0, 0.0),
            Vec3::new(1.0, -1.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(-1.0, 1.0, 0.0),
        ],
        vec![0, 1, 2, 0, 2, 3],
    )
}

#[test]
fn test_register_mesh() {
    let mut device = MockGraphicsDevice::new();
    let mut store = GeometryStore::new();
    let id = store.register(&mut device, quad_desc("quad")).unwrap();

    assert_eq!(id, GeometryId(0));
    let geometry = store.get(id).unwrap();
    assert_eq!(geometry.name(), "quad");
    assert_eq!(geometry.bottom_level().primitive_count(), 2);
    assert_eq!(geometry.bounds().min, Vec3::new(-1.0, -1.0, 0.0));
    assert_eq!(geometry.bounds().max, Vec3::new(1.0, 1.0, 0.0));
    assert!(!geometry.is_procedural());
    match geometry.kind() {
        GeometryKind::Mesh { vertex_count, index_count, vertex_stride, .. } => {
            assert_eq!((*vertex_count, *index_count, *vertex_stride), (4, 6, 12));
        }
        other => panic!("unexpected kind {:?}", other),
    }
}

#[test]
fn test_mesh_data_reaches_device_buffers() {
    let mut device = MockGraphicsDevice::new();
    let mut store = GeometryStore::new();
    let id = store.register(&mut device, quad_desc("quad")).unwrap();

    if let GeometryKind::Mesh { index_buffer, .. } = store.get(id).unwrap().kind() {
        let bytes = device.buffer_bytes(*index_buffer).unwrap();
        let indices: Vec<u32> = bytemuck::pod_collect_to_vec(bytes);
        assert_eq!(indices, vec![0, 1, 2, 0, 2, 3]);
    } else {
        panic!("expected a mesh");
    }
}

#[test]
fn test_staging_buffers_released() {
    let mut device = MockGraphicsDevice::new();
    let mut store = GeometryStore::new();
    store.register(&mut device, quad_desc("quad")).unwrap();
    // vertex + index + bottom-level result
    assert_eq!(device.live_buffer_count(), 3);
}

#[test]
fn test_register_interleaved_mesh() {
    let mut device = MockGraphicsDevice::new();
    let mut store = GeometryStore::new();
    // position + rgba color, 28-byte stride
    let vertices: [[f32; 7]; 3] = [
        [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0],
        [2.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0],
        [0.0, 3.0, 0.0, 0.0, 0.0, 1.0, 1.0],
    ];
    let id = store
        .register(&mut device, GeometryDesc::Mesh {
            name: "colored".to_string(),
            vertex_data: bytemuck::cast_slice(&vertices).to_vec(),
            vertex_stride: 28,
            indices: vec![0, 1, 2],
            opaque: true,
        })
        .unwrap();
    let geometry = store.get(id).unwrap();
    assert_eq!(geometry.bounds().max, Vec3::new(2.0, 3.0, 0.0));
    match geometry.bottom_level().geometry() {
        IndexGeometry::Triangles { vertex_stride, vertex_count, .. } => assert_eq!((*vertex_stride, *vertex_count), (28, 3)),
        other => panic!("unexpected geometry {:?}", other),
    }
}

#[test]
fn test_register_sphere() {
    let mut device = MockGraphicsDevice::new();
    let mut store = GeometryStore::new();
    store.register(&mut device, quad_desc("quad")).unwrap();
    let id = store.register(&mut device, GeometryDesc::sphere("ball", Vec3::new(0.0, 2.0, 0.0), 0.5)).unwrap();

    assert_eq!(id, GeometryId(1));
    let geometry = store.get(id).unwrap();
    assert!(geometry.is_procedural());
    assert_eq!(geometry.bounds().min, Vec3::new(-0.5, 1.5, -0.5));
    assert_eq!(geometry.bottom_level().primitive_count(), 1);
    if let GeometryKind::Sphere { aabb_buffer, .. } = geometry.kind() {
        let corners: Vec<f32> = bytemuck::pod_collect_to_vec(device.buffer_bytes(*aabb_buffer).unwrap());
        assert_eq!(corners, vec![-0.5, 1.5, -0.5, 0.5, 2.5, 0.5]);
    }
}

#[test]
fn test_lookup_by_name() {
    let mut device = MockGraphicsDevice::new();
    let mut store = GeometryStore::new();
    store.register(&mut device, quad_desc("a")).unwrap();
    store.register(&mut device, quad_desc("b")).unwrap();
    assert_eq!(store.id_by_name("b"), Some(GeometryId(1)));
    assert_eq!(store.id_by_name("c"), None);
    assert_eq!(store.len(), 2);
    assert_eq!(store.iter().map(|g| g.name()).collect::<Vec<_>>(), vec!["a", "b"]);
}

#[test]
fn test_duplicate_name_rejected() {
    let mut device = MockGraphicsDevice::new();
    let mut store = GeometryStore::new();
    store.register(&mut device, quad_desc("quad")).unwrap();
    let result = store.register(&mut device, quad_desc("quad"));
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
    assert_eq!(store.len(), 1);
}

#[test]
fn test_invalid_mesh_rejected() {
    let mut device = MockGraphicsDevice::new();
    let mut store = GeometryStore::new();
    let bad_indices = GeometryDesc::mesh_from_positions("bad", &[Vec3::ZERO, Vec3::X, Vec3::Y], vec![0, 1]);
    let past_end = GeometryDesc::mesh_from_positions("past", &[Vec3::ZERO, Vec3::X, Vec3::Y], vec![0, 1, 3]);
    let empty = GeometryDesc::mesh_from_positions("empty", &[], vec![]);

    for desc in [bad_indices, past_end, empty] {
        assert!(matches!(store.register(&mut device, desc), Err(Error::InvalidArgument(_))));
    }
    assert!(store.is_empty());
    assert_eq!(device.live_buffer_count(), 0);
}

#[test]
fn test_invalid_sphere_rejected() {
    let mut device = MockGraphicsDevice::new();
    let mut store = GeometryStore::new();
    for radius in [0.0, -1.0, f32::NAN] {
        let result = store.register(&mut device, GeometryDesc::sphere("s", Vec3::ZERO, radius));
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}

#[test]
fn test_failed_index_build_releases_buffers() {
    let mut device = MockGraphicsDevice::new();
    let mut store = GeometryStore::new();
    device.fail_index_creation = true;
    let result = store.register(&mut device, quad_desc("quad"));
    assert!(result.unwrap_err().is_resource_creation());
    assert_eq!(device.live_buffer_count(), 0);
    assert_eq!(store.id_by_name("quad"), None);
}

#[test]
fn test_failed_upload_releases_buffers() {
    let mut device = MockGraphicsDevice::new();
    let mut store = GeometryStore::new();
    device.fail_next_submit = Some(Error::BackendError("lost".to_string()));
    assert!(store.register(&mut device, quad_desc("quad")).is_err());
    assert_eq!(device.live_buffer_count(), 0);
}

#[test]
fn test_clear_releases_everything() {
    let mut device = MockGraphicsDevice::new();
    let mut store = GeometryStore::new();
    store.register(&mut device, quad_desc("quad")).unwrap();
    store.register(&mut device, GeometryDesc::sphere("ball", Vec3::ZERO, 1.0)).unwrap();
    store.clear(&mut device);
    assert!(store.is_empty());
    assert_eq!(device.live_buffer_count(), 0);
    assert_eq!(device.live_index_count(), 0);
    assert_eq!(device.allocated_bytes, 0);
}
