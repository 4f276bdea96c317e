/// GPU instance record consumed by top-level index builds
///
/// Layout matches the hardware instance format: a 3×4 row-major transform,
/// then `custom_index:24 | mask:8`, `hit_group_record:24 | flags:8`, and the
/// 8-byte bottom-level reference. 64 bytes, no padding.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};
use crate::error::Result;
use crate::lumen_bail;

/// Largest value storable in a 24-bit record field
pub const MAX_24BIT: u32 = (1 << 24) - 1;

/// Size in bytes of one instance record
pub const INSTANCE_RECORD_SIZE: u64 = std::mem::size_of::<InstanceRecord>() as u64;

bitflags! {
    /// Per-instance traversal flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InstanceFlags: u8 {
        const TRIANGLE_CULL_DISABLE = 1 << 0;
        const TRIANGLE_FRONT_COUNTERCLOCKWISE = 1 << 1;
        const FORCE_OPAQUE = 1 << 2;
        const FORCE_NO_OPAQUE = 1 << 3;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceRecord {
    /// Rows 0..3 of the object-to-world matrix
    pub transform: [f32; 12],
    pub custom_index_and_mask: u32,
    pub hit_group_record_and_flags: u32,
    pub bottom_level_reference: u64,
}

impl InstanceRecord {
    /// Pack one instance
    ///
    /// Fails with `InvalidArgument` when `custom_index` or `hit_group_record`
    /// does not fit in 24 bits.
    pub fn new(
        transform: &Mat4,
        custom_index: u32,
        mask: u8,
        hit_group_record: u32,
        flags: InstanceFlags,
        bottom_level_reference: u64,
    ) -> Result<Self> {
        if custom_index > MAX_24BIT {
            lumen_bail!("lumen::InstanceRecord", InvalidArgument,
                "instance id {} does not fit in 24 bits", custom_index);
        }
        if hit_group_record > MAX_24BIT {
            lumen_bail!("lumen::InstanceRecord", InvalidArgument,
                "hit group record {} does not fit in 24 bits", hit_group_record);
        }

        Ok(Self {
            transform: pack_transform(transform),
            custom_index_and_mask: custom_index | ((mask as u32) << 24),
            hit_group_record_and_flags: hit_group_record | ((flags.bits() as u32) << 24),
            bottom_level_reference,
        })
    }

    pub fn custom_index(&self) -> u32 {
        self.custom_index_and_mask & MAX_24BIT
    }

    pub fn mask(&self) -> u8 {
        (self.custom_index_and_mask >> 24) as u8
    }

    pub fn hit_group_record(&self) -> u32 {
        self.hit_group_record_and_flags & MAX_24BIT
    }

    pub fn flags(&self) -> InstanceFlags {
        InstanceFlags::from_bits_truncate((self.hit_group_record_and_flags >> 24) as u8)
    }

    /// Rebuild the 4×4 matrix; the bottom row is the implicit `(0, 0, 0, 1)`
    pub fn matrix(&self) -> Mat4 {
        let t = &self.transform;
        Mat4::from_cols(
            Vec4::new(t[0], t[4], t[8], 0.0),
            Vec4::new(t[1], t[5], t[9], 0.0),
            Vec4::new(t[2], t[6], t[10], 0.0),
            Vec4::new(t[3], t[7], t[11], 1.0),
        )
    }
}

/// Transpose the column-major matrix and keep its top three rows
pub fn pack_transform(transform: &Mat4) -> [f32; 12] {
    let rows = transform.transpose().to_cols_array();
    let mut packed = [0.0; 12];
    packed.copy_from_slice(&rows[..12]);
    packed
}

#[cfg(test)]
#[path = "instance_record_tests.rs"]
mod tests;
