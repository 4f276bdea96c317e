/// Scene instance table.
///
/// An ordered list of placements. An instance's position is assigned at
/// insertion and never reused; it is both the top-level instance position and
/// the hit-group entry of the dispatch table, so the two stay in lockstep as
/// long as instances are only appended.

use bytemuck::{Pod, Zeroable};
use glam::{Mat3, Mat4, Vec4};
use rustc_hash::FxHashSet;
use crate::accel::{InstanceFlags, TopLevelInstance};
use crate::dispatch::GroupIndex;
use crate::error::Result;
use crate::resource::{GeometryId, GeometryStore};
use crate::{lumen_bail, lumen_err};

/// Stable position of an instance in the table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceIndex(pub u32);

/// Material and texture ids read by hit programs (-1 = none)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterialRef {
    pub material_id: i32,
    pub texture_ids: [i32; 2],
}

impl MaterialRef {
    pub const NONE: MaterialRef = MaterialRef {
        material_id: -1,
        texture_ids: [-1, -1],
    };

    pub fn new(material_id: i32) -> Self {
        Self {
            material_id,
            texture_ids: [-1, -1],
        }
    }

    pub fn with_textures(mut self, texture_ids: [i32; 2]) -> Self {
        self.texture_ids = texture_ids;
        self
    }
}

// ===== HIT RECORD =====

/// Inline payload of a hit-group entry
///
/// Layout matches the std430 block read by hit programs:
/// ids (16 bytes), color (16 bytes), normal matrix rows padded to vec4
/// (48 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct HitRecord {
    pub object_id: i32,
    pub material_id: i32,
    pub texture_ids: [i32; 2],
    pub color: [f32; 4],
    pub normal_matrix: [[f32; 4]; 3],
}

pub const HIT_RECORD_SIZE: u64 = std::mem::size_of::<HitRecord>() as u64;

impl HitRecord {
    pub fn new(instance: &SceneInstance) -> Self {
        let material = instance.material.unwrap_or(MaterialRef::NONE);
        Self {
            object_id: instance.geometry.0 as i32,
            material_id: material.material_id,
            texture_ids: material.texture_ids,
            color: instance.color.to_array(),
            normal_matrix: normal_matrix_rows(&instance.transform),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// Rows of the inverse-transpose of the upper 3x3, padded to vec4
///
/// A singular matrix yields the identity.
pub fn normal_matrix_rows(transform: &Mat4) -> [[f32; 4]; 3] {
    let linear = Mat3::from_mat4(*transform);
    let normal = if linear.determinant().abs() <= f32::EPSILON {
        Mat3::IDENTITY
    } else {
        linear.inverse().transpose()
    };
    [0, 1, 2].map(|r| normal.row(r).extend(0.0).to_array())
}

// ===== SCENE INSTANCE =====

#[derive(Debug, Clone, PartialEq)]
pub struct SceneInstance {
    index: InstanceIndex,
    geometry: GeometryId,
    transform: Mat4,
    visibility_mask: u8,
    dispatch_group: GroupIndex,
    material: Option<MaterialRef>,
    color: Vec4,
}

impl SceneInstance {
    pub fn index(&self) -> InstanceIndex {
        self.index
    }

    pub fn geometry(&self) -> GeometryId {
        self.geometry
    }

    pub fn transform(&self) -> &Mat4 {
        &self.transform
    }

    pub fn visibility_mask(&self) -> u8 {
        self.visibility_mask
    }

    /// Hit group program invoked when a ray hits this instance
    pub fn dispatch_group(&self) -> GroupIndex {
        self.dispatch_group
    }

    pub fn material(&self) -> Option<MaterialRef> {
        self.material
    }

    pub fn color(&self) -> Vec4 {
        self.color
    }

    pub fn hit_record(&self) -> HitRecord {
        HitRecord::new(self)
    }
}

/// Placement request
#[derive(Debug, Clone, PartialEq)]
pub struct SceneInstanceDesc {
    pub geometry: GeometryId,
    pub dispatch_group: GroupIndex,
    pub transform: Mat4,
    pub visibility_mask: u8,
    pub material: Option<MaterialRef>,
    pub color: Vec4,
}

impl SceneInstanceDesc {
    pub fn new(geometry: GeometryId, dispatch_group: GroupIndex) -> Self {
        Self {
            geometry,
            dispatch_group,
            transform: Mat4::IDENTITY,
            visibility_mask: 0xFF,
            material: None,
            color: Vec4::ONE,
        }
    }

    pub fn with_transform(mut self, transform: Mat4) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_visibility_mask(mut self, mask: u8) -> Self {
        self.visibility_mask = mask;
        self
    }

    pub fn with_material(mut self, material: MaterialRef) -> Self {
        self.material = Some(material);
        self
    }

    pub fn with_color(mut self, color: Vec4) -> Self {
        self.color = color;
        self
    }
}

// ===== SCENE INSTANCE TABLE =====

#[derive(Debug, Default)]
pub struct SceneInstanceTable {
    instances: Vec<SceneInstance>,
    /// Instances whose top-level record changed (transform, mask)
    dirty_transforms: FxHashSet<InstanceIndex>,
    /// Instances whose hit record changed
    dirty_records: FxHashSet<InstanceIndex>,
    /// Count or dispatch group binding changed
    topology_changed: bool,
}

impl SceneInstanceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, desc: SceneInstanceDesc) -> InstanceIndex {
        let index = InstanceIndex(self.instances.len() as u32);
        self.instances.push(SceneInstance {
            index,
            geometry: desc.geometry,
            transform: desc.transform,
            visibility_mask: desc.visibility_mask,
            dispatch_group: desc.dispatch_group,
            material: desc.material,
            color: desc.color,
        });
        self.topology_changed = true;
        index
    }

    pub fn get(&self, index: InstanceIndex) -> Option<&SceneInstance> {
        self.instances.get(index.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SceneInstance> {
        self.instances.iter()
    }

    fn get_mut(&mut self, index: InstanceIndex) -> Result<&mut SceneInstance> {
        let count = self.instances.len();
        self.instances.get_mut(index.0 as usize).ok_or_else(|| {
            lumen_err!("lumen::SceneInstanceTable", OutOfRange, "instance {} out of range ({} instances)", index.0, count)
        })
    }

    pub fn set_transform(&mut self, index: InstanceIndex, transform: Mat4) -> Result<()> {
        self.get_mut(index)?.transform = transform;
        self.dirty_transforms.insert(index);
        self.dirty_records.insert(index);
        Ok(())
    }

    pub fn set_visibility_mask(&mut self, index: InstanceIndex, mask: u8) -> Result<()> {
        self.get_mut(index)?.visibility_mask = mask;
        self.dirty_transforms.insert(index);
        Ok(())
    }

    pub fn set_material(&mut self, index: InstanceIndex, material: Option<MaterialRef>) -> Result<()> {
        self.get_mut(index)?.material = material;
        self.dirty_records.insert(index);
        Ok(())
    }

    pub fn set_color(&mut self, index: InstanceIndex, color: Vec4) -> Result<()> {
        self.get_mut(index)?.color = color;
        self.dirty_records.insert(index);
        Ok(())
    }

    /// Rebinding an instance to another hit program changes the table topology
    pub fn set_dispatch_group(&mut self, index: InstanceIndex, group: GroupIndex) -> Result<()> {
        let instance = self.get_mut(index)?;
        if instance.dispatch_group != group {
            instance.dispatch_group = group;
            self.topology_changed = true;
        }
        Ok(())
    }

    pub fn has_dirty_transforms(&self) -> bool {
        !self.dirty_transforms.is_empty()
    }

    pub fn has_dirty_records(&self) -> bool {
        !self.dirty_records.is_empty()
    }

    pub fn topology_changed(&self) -> bool {
        self.topology_changed
    }

    /// Dirty hit records in table order
    pub fn dirty_records(&self) -> Vec<InstanceIndex> {
        let mut dirty: Vec<_> = self.dirty_records.iter().copied().collect();
        dirty.sort_unstable();
        dirty
    }

    /// Forget all pending changes once they reached the GPU
    pub fn mark_clean(&mut self) {
        self.dirty_transforms.clear();
        self.dirty_records.clear();
        self.topology_changed = false;
    }

    /// Top-level build list: instance `k` uses hit-group entry `k`
    pub fn top_level_instances(&self, geometries: &GeometryStore) -> Result<Vec<TopLevelInstance>> {
        self.instances
            .iter()
            .map(|instance| {
                let geometry = match geometries.get(instance.geometry) {
                    Some(geometry) => geometry,
                    None => lumen_bail!("lumen::SceneInstanceTable", InvalidArgument,
                        "instance {} references unknown geometry {}", instance.index.0, instance.geometry.0),
                };
                Ok(TopLevelInstance::new(geometry.bottom_level().handle(), instance.index.0, instance.index.0)
                    .with_transform(instance.transform)
                    .with_mask(instance.visibility_mask)
                    .with_flags(InstanceFlags::TRIANGLE_CULL_DISABLE))
            })
            .collect()
    }
}

#[cfg(test)]
#[path = "scene_instance_tests.rs"]
mod tests;
