/// Dispatch table (shader binding table) layout and packing
///
/// The table is one host-visible buffer split into four sections in fixed
/// order: ray generation, miss, callable, hit group. Each entry is the
/// program-identity handle of its group followed by inline parameter bytes,
/// padded to the section stride:
///
/// ```text
/// stride(section) = round_up(handle_size + max_inline(section), record_alignment)
/// offset(section) = round_up(end of previous section, base_alignment)
/// entry(section, i) = offset(section) + i * stride(section)
/// ```
///
/// Record alignment is `max(16, backend handle alignment)`. With a base
/// alignment of 16 the section offsets are the plain sums of
/// `stride * count` over the preceding sections.
///
/// The stride is fixed by `finalize`. Afterwards only the inline bytes of an
/// entry may be rewritten, never beyond the space the stride reserves.

use std::ops::Range;
use crate::error::Result;
use crate::graphics_device::{
    BufferDesc, BufferHandle, BufferUsage, GraphicsDevice, MemoryKind, StridedRegion,
};
use crate::{lumen_bail, lumen_err, lumen_info, lumen_trace};
use super::pipeline_builder::{GroupIndex, RayTracingPipeline};

/// Minimum alignment of a table record
pub const RECORD_ALIGNMENT: u64 = 16;

/// Table sections, in table order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SectionKind {
    RayGen,
    Miss,
    Callable,
    HitGroup,
}

impl SectionKind {
    pub const ALL: [SectionKind; 4] = [
        SectionKind::RayGen,
        SectionKind::Miss,
        SectionKind::Callable,
        SectionKind::HitGroup,
    ];

    fn slot(self) -> usize {
        self as usize
    }
}

/// Round `value` up to a multiple of `alignment`
pub fn round_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

// ============================================================================
// Builder
// ============================================================================

#[derive(Debug, Clone)]
struct PendingEntry {
    /// Explicit group, or None for "the i-th group of this kind"
    group: Option<GroupIndex>,
    inline: Vec<u8>,
}

/// Collects entries section by section, then packs them with `finalize`
#[derive(Debug)]
pub struct DispatchTableBuilder {
    name: String,
    sections: [Vec<PendingEntry>; 4],
    current: Option<SectionKind>,
}

impl DispatchTableBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sections: Default::default(),
            current: None,
        }
    }

    /// Open a section; sections must be opened in table order
    pub fn begin_section(&mut self, kind: SectionKind) -> Result<()> {
        if let Some(current) = self.current {
            if kind < current {
                lumen_bail!("lumen::DispatchTableBuilder", InvalidArgument,
                    "'{}': {:?} section opened after {:?}", self.name, kind, current);
            }
        }
        self.current = Some(kind);
        Ok(())
    }

    /// Add an entry bound to the next group of `kind` in registration order
    ///
    /// Opens the section if it is not the current one. Returns the entry
    /// index within the section.
    pub fn add_entry(&mut self, kind: SectionKind, inline: &[u8]) -> Result<u32> {
        self.push(kind, None, inline)
    }

    /// Add an entry bound to an explicit group
    ///
    /// Many entries may share one group, e.g. every instance drawn with the
    /// same hit program.
    pub fn add_entry_for_group(&mut self, kind: SectionKind, group: GroupIndex, inline: &[u8]) -> Result<u32> {
        self.push(kind, Some(group), inline)
    }

    pub fn entry_count(&self, kind: SectionKind) -> u32 {
        self.sections[kind.slot()].len() as u32
    }

    fn push(&mut self, kind: SectionKind, group: Option<GroupIndex>, inline: &[u8]) -> Result<u32> {
        if self.current != Some(kind) {
            self.begin_section(kind)?;
        }
        let section = &mut self.sections[kind.slot()];
        section.push(PendingEntry {
            group,
            inline: inline.to_vec(),
        });
        Ok(section.len() as u32 - 1)
    }

    /// Lay out and upload the table
    ///
    /// Fails with `InvalidArgument` when the ray generation section does not
    /// hold exactly one entry or an entry cannot be matched to a pipeline
    /// group of its kind, and with a resource creation error when the buffer
    /// cannot be allocated.
    pub fn finalize(self, device: &mut dyn GraphicsDevice, pipeline: &RayTracingPipeline) -> Result<DispatchTable> {
        let raygen_count = self.entry_count(SectionKind::RayGen);
        if raygen_count != 1 {
            lumen_bail!("lumen::DispatchTableBuilder", InvalidArgument,
                "'{}': expected exactly one ray generation entry, got {}", self.name, raygen_count);
        }

        let handle_size = device.shader_group_handle_size() as u64;
        let record_alignment = RECORD_ALIGNMENT.max(device.shader_group_handle_alignment() as u64);
        let base_alignment = device.shader_group_base_alignment().max(1) as u64;

        // Resolve groups and lay out sections
        let mut groups: [Vec<GroupIndex>; 4] = Default::default();
        let mut layouts = [SectionLayout::default(); 4];
        let mut end = 0u64;
        for kind in SectionKind::ALL {
            let entries = &self.sections[kind.slot()];
            groups[kind.slot()] = resolve_groups(&self.name, kind, entries, pipeline)?;

            let max_inline = entries.iter().map(|e| e.inline.len() as u64).max().unwrap_or(0);
            let stride = round_up(handle_size + max_inline, record_alignment);
            let offset = if entries.is_empty() { end } else { round_up(end, base_alignment) };
            layouts[kind.slot()] = SectionLayout {
                offset,
                stride,
                count: entries.len() as u32,
            };
            end = offset + stride * entries.len() as u64;
        }
        let size = end;

        let handles = device.group_handles(pipeline.handle(), 0, pipeline.group_count())?;
        if (handles.len() as u64) < handle_size * pipeline.group_count() as u64 {
            lumen_bail!("lumen::DispatchTableBuilder",
                "'{}': backend returned {} handle bytes for {} groups", self.name, handles.len(), pipeline.group_count());
        }

        // [handle][inline][padding] per entry
        let mut image = vec![0u8; size as usize];
        for kind in SectionKind::ALL {
            let layout = layouts[kind.slot()];
            for (i, (entry, group)) in self.sections[kind.slot()].iter().zip(&groups[kind.slot()]).enumerate() {
                let start = (layout.offset + i as u64 * layout.stride) as usize;
                let handle_start = (group.0 as u64 * handle_size) as usize;
                let hs = handle_size as usize;
                image[start..start + hs].copy_from_slice(&handles[handle_start..handle_start + hs]);
                image[start + hs..start + hs + entry.inline.len()].copy_from_slice(&entry.inline);
            }
        }

        let buffer = device.allocate_buffer(&BufferDesc::new(
            format!("{} dispatch table", self.name),
            size,
            BufferUsage::DISPATCH_TABLE,
            MemoryKind::HostVisible,
        ))?;
        if let Err(e) = device.write_buffer(buffer, 0, &image) {
            device.destroy_buffer(buffer);
            return Err(e);
        }

        lumen_info!("lumen::DispatchTableBuilder",
            "'{}': {} bytes (raygen {}x{}, miss {}x{}, callable {}x{}, hit {}x{})",
            self.name, size,
            layouts[0].count, layouts[0].stride,
            layouts[1].count, layouts[1].stride,
            layouts[2].count, layouts[2].stride,
            layouts[3].count, layouts[3].stride);

        Ok(DispatchTable {
            name: self.name,
            buffer,
            handle_size,
            size,
            sections: layouts,
        })
    }
}

fn resolve_groups(
    name: &str,
    kind: SectionKind,
    entries: &[PendingEntry],
    pipeline: &RayTracingPipeline,
) -> Result<Vec<GroupIndex>> {
    let of_kind = pipeline.groups_of(kind);
    entries
        .iter()
        .enumerate()
        .map(|(i, entry)| match entry.group {
            Some(group) => match pipeline.section_of(group) {
                Some(section) if section == kind => Ok(group),
                other => Err(lumen_err!("lumen::DispatchTableBuilder", InvalidArgument,
                    "'{}': {:?} entry {} bound to group {} of kind {:?}", name, kind, i, group.0, other)),
            },
            None => of_kind.get(i).copied().ok_or_else(|| lumen_err!("lumen::DispatchTableBuilder", InvalidArgument,
                "'{}': {:?} entry {} has no matching group (pipeline has {})", name, kind, i, of_kind.len())),
        })
        .collect()
}

// ============================================================================
// Finalized table
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct SectionLayout {
    offset: u64,
    stride: u64,
    count: u32,
}

/// Byte range of one section, as handed to the trace dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchRegion {
    pub offset: u64,
    pub stride: u64,
    pub size: u64,
    pub count: u32,
}

impl DispatchRegion {
    pub fn strided(&self) -> StridedRegion {
        StridedRegion {
            offset: self.offset,
            stride: self.stride,
            size: self.size,
        }
    }
}

#[derive(Debug)]
pub struct DispatchTable {
    name: String,
    buffer: BufferHandle,
    handle_size: u64,
    size: u64,
    sections: [SectionLayout; 4],
}

impl DispatchTable {
    pub fn region(&self, kind: SectionKind) -> DispatchRegion {
        let layout = self.sections[kind.slot()];
        DispatchRegion {
            offset: layout.offset,
            stride: layout.stride,
            size: layout.stride * layout.count as u64,
            count: layout.count,
        }
    }

    pub fn entry_count(&self, kind: SectionKind) -> u32 {
        self.sections[kind.slot()].count
    }

    /// Byte offset of an entry; `OutOfRange` past the registered entries
    pub fn entry_offset(&self, kind: SectionKind, index: u32) -> Result<u64> {
        let layout = self.sections[kind.slot()];
        if index >= layout.count {
            lumen_bail!("lumen::DispatchTable", OutOfRange,
                "'{}': {:?} entry {} out of range ({} entries)", self.name, kind, index, layout.count);
        }
        Ok(layout.offset + index as u64 * layout.stride)
    }

    /// Whole byte range of an entry, handle included
    pub fn entry_range(&self, kind: SectionKind, index: u32) -> Result<Range<u64>> {
        let start = self.entry_offset(kind, index)?;
        Ok(start..start + self.sections[kind.slot()].stride)
    }

    /// Inline bytes an entry of this section can hold
    pub fn max_inline_size(&self, kind: SectionKind) -> u64 {
        self.sections[kind.slot()].stride - self.handle_size
    }

    /// Overwrite the inline bytes of one entry in place
    ///
    /// Only `[entry + handle_size, + inline.len())` is written; the handle and
    /// every other entry are left alone. The buffer is host-coherent, so no
    /// GPU synchronization is needed as long as the write precedes the trace
    /// that reads it.
    pub fn update_entry(
        &self,
        device: &mut dyn GraphicsDevice,
        kind: SectionKind,
        index: u32,
        inline: &[u8],
    ) -> Result<()> {
        let offset = self.entry_offset(kind, index)?;
        let capacity = self.max_inline_size(kind);
        if inline.len() as u64 > capacity {
            lumen_bail!("lumen::DispatchTable", InvalidArgument,
                "'{}': {} inline bytes exceed the {} reserved for {:?} entries",
                self.name, inline.len(), capacity, kind);
        }
        device.write_buffer(self.buffer, offset + self.handle_size, inline)?;
        lumen_trace!("lumen::DispatchTable", "'{}': {:?} entry {} updated ({} bytes)",
            self.name, kind, index, inline.len());
        Ok(())
    }

    /// Read back a whole entry
    pub fn read_entry(&self, device: &dyn GraphicsDevice, kind: SectionKind, index: u32) -> Result<Vec<u8>> {
        let range = self.entry_range(kind, index)?;
        device.read_buffer(self.buffer, range.start, range.end - range.start)
    }

    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    pub fn handle_size(&self) -> u64 {
        self.handle_size
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn destroy(self, device: &mut dyn GraphicsDevice) {
        device.destroy_buffer(self.buffer);
    }
}

#[cfg(test)]
#[path = "dispatch_table_tests.rs"]
mod tests;
