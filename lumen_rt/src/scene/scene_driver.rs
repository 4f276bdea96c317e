/// Scene driver - per-frame orchestration of the ray traced scene
///
/// Owns the geometry store, the instance table, the top-level index and the
/// dispatch table, and drives them through one state cycle per frame:
///
/// ```text
/// Idle -> InstancesDirty -> Refitting -> RecordsDirty -> RecordsFlushed -> Idle
/// ```
///
/// Mutators rewrite the instance's hit record in the dispatch table at once
/// (host-coherent memory, in place). `end_frame` then refits or rebuilds the
/// top-level index, flushes the rewritten records, records the trace and
/// submits. A frame that fails on the way is aborted before the trace: the
/// pending changes are kept and the next frame retries them.
///
/// Adding instances or rebinding a dispatch group after `build` changes the
/// table topology and schedules a full rebuild of both structures.
///
/// The previous frame's fence is waited on before the first write of a new
/// frame, whether or not the caller opened it with `begin_frame`.

use std::ops::Range;
use crate::accel::TopLevelIndex;
use crate::config::SceneConfig;
use crate::dispatch::{DispatchTable, DispatchTableBuilder, GroupIndex, RayTracingPipeline, SectionKind};
use crate::error::Result;
use crate::graphics_device::{
    lock_device, CommandStream, FrameTicket, GraphicsDevice, SharedGraphicsDevice, TraceRaysCommand,
};
use crate::resource::{GeometryDesc, GeometryId, GeometryStore};
use crate::runtime::Lumen;
use crate::{lumen_bail, lumen_debug, lumen_err, lumen_info, lumen_trace, lumen_warn};
use super::scene_instance::{InstanceIndex, MaterialRef, SceneInstanceDesc, SceneInstanceTable};

/// Position in the per-frame cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameState {
    Idle,
    /// Transforms or masks changed since the last frame
    InstancesDirty,
    /// Top-level update recorded for this frame
    Refitting,
    /// Hit records rewritten, not yet flushed
    RecordsDirty,
    RecordsFlushed,
}

/// Dispatch size of a trace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceExtent {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl TraceExtent {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height, depth: 1 }
    }
}

/// Non-hit programs placed in the dispatch table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchPrograms {
    pub raygen: GroupIndex,
    /// One entry per miss program, in miss index order
    pub misses: Vec<GroupIndex>,
    pub callables: Vec<GroupIndex>,
}

impl DispatchPrograms {
    /// First ray generation group plus every miss and callable group
    pub fn from_pipeline(pipeline: &RayTracingPipeline) -> Result<Self> {
        let raygen = match pipeline.groups_of(SectionKind::RayGen).first() {
            Some(group) => *group,
            None => lumen_bail!("lumen::SceneDriver", InvalidArgument, "pipeline has no ray generation group"),
        };
        Ok(Self {
            raygen,
            misses: pipeline.groups_of(SectionKind::Miss),
            callables: pipeline.groups_of(SectionKind::Callable),
        })
    }
}

/// How the top-level index was brought up to date in a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAction {
    Unchanged,
    Refit,
    Rebuild,
}

/// Outcome of a submitted frame
#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    pub ticket: FrameTicket,
    pub action: FrameAction,
    pub records_flushed: usize,
    /// States visited, starting and ending with `Idle`
    pub path: Vec<FrameState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DriverStats {
    pub frames_submitted: u64,
    pub frames_aborted: u64,
    pub refits: u64,
    pub rebuilds: u64,
    pub records_updated: u64,
}

struct BuiltScene {
    pipeline: RayTracingPipeline,
    programs: DispatchPrograms,
    top_level: TopLevelIndex,
    table: DispatchTable,
}

pub struct SceneDriver {
    device: SharedGraphicsDevice,
    config: SceneConfig,
    geometries: GeometryStore,
    instances: SceneInstanceTable,
    built: Option<BuiltScene>,
    state: FrameState,
    /// Rewritten hit-record byte ranges awaiting a flush
    pending_ranges: Vec<Range<u64>>,
    last_frame: Option<FrameTicket>,
    /// The previous frame is retired and the per-frame resources are writable
    frame_open: bool,
    stats: DriverStats,
}

impl SceneDriver {
    pub fn new(device: SharedGraphicsDevice, config: SceneConfig) -> Self {
        if let Some(severity) = config.log_severity {
            Lumen::set_min_severity(severity);
        }
        Self {
            device,
            config,
            geometries: GeometryStore::new(),
            instances: SceneInstanceTable::new(),
            built: None,
            state: FrameState::Idle,
            pending_ranges: Vec::new(),
            last_frame: None,
            frame_open: true,
            stats: DriverStats::default(),
        }
    }

    // ===== SETUP =====

    pub fn register_geometry(&mut self, desc: GeometryDesc) -> Result<GeometryId> {
        let mut device = lock_device(&self.device)?;
        self.geometries.register(&mut *device, desc)
    }

    /// Append an instance; after `build` this schedules a full rebuild
    pub fn add_instance(&mut self, desc: SceneInstanceDesc) -> Result<InstanceIndex> {
        if self.geometries.get(desc.geometry).is_none() {
            lumen_bail!("lumen::SceneDriver", InvalidArgument, "unknown geometry {}", desc.geometry.0);
        }
        if let Some(built) = &self.built {
            check_hit_group(&built.pipeline, desc.dispatch_group)?;
        }
        let index = self.instances.insert(desc);
        if self.built.is_some() {
            self.state = FrameState::InstancesDirty;
        }
        Ok(index)
    }

    /// Build the top-level index and the dispatch table over the current instances
    ///
    /// Takes ownership of the pipeline. Blocks until the index is built.
    /// On failure the pipeline is destroyed.
    pub fn build(&mut self, pipeline: RayTracingPipeline, programs: DispatchPrograms) -> Result<()> {
        let device_handle = self.device.clone();
        let mut device = lock_device(&device_handle)?;

        let checked = if self.built.is_some() {
            Err(lumen_err!("lumen::SceneDriver", InvalidArgument, "scene is already built"))
        } else {
            self.instances
                .iter()
                .try_for_each(|instance| check_hit_group(&pipeline, instance.dispatch_group()))
        };
        let structures = checked.and_then(|_| self.build_structures(&mut *device, &pipeline, &programs));
        let (top_level, table) = match structures {
            Ok(structures) => structures,
            Err(e) => {
                pipeline.destroy(&mut *device);
                return Err(e);
            }
        };

        lumen_info!("lumen::SceneDriver", "scene built: {} geometries, {} instances, table {} bytes",
            self.geometries.len(), self.instances.len(), table.size());
        self.built = Some(BuiltScene { pipeline, programs, top_level, table });
        self.instances.mark_clean();
        self.pending_ranges.clear();
        self.state = FrameState::Idle;
        Ok(())
    }

    fn build_structures(
        &self,
        device: &mut dyn GraphicsDevice,
        pipeline: &RayTracingPipeline,
        programs: &DispatchPrograms,
    ) -> Result<(TopLevelIndex, DispatchTable)> {
        let instances = self.instances.top_level_instances(&self.geometries)?;
        let top_level = TopLevelIndex::build(device, "scene", &instances, self.config.allow_refit)?;

        let mut builder = DispatchTableBuilder::new("scene");
        let entries = builder
            .add_entry_for_group(SectionKind::RayGen, programs.raygen, &[])
            .and_then(|_| {
                programs
                    .misses
                    .iter()
                    .try_for_each(|miss| builder.add_entry_for_group(SectionKind::Miss, *miss, &[]).map(|_| ()))
            })
            .and_then(|_| {
                programs
                    .callables
                    .iter()
                    .try_for_each(|call| builder.add_entry_for_group(SectionKind::Callable, *call, &[]).map(|_| ()))
            })
            .and_then(|_| {
                self.instances.iter().try_for_each(|instance| {
                    builder
                        .add_entry_for_group(SectionKind::HitGroup, instance.dispatch_group(), instance.hit_record().as_bytes())
                        .map(|_| ())
                })
            });

        match entries.and_then(|_| builder.finalize(device, pipeline)) {
            Ok(table) => Ok((top_level, table)),
            Err(e) => {
                top_level.destroy(device);
                Err(e)
            }
        }
    }

    // ===== FRAME =====

    /// Wait until the previous frame no longer reads the per-frame resources
    pub fn begin_frame(&mut self) -> Result<()> {
        if self.built.is_none() {
            lumen_bail!("lumen::SceneDriver", InvalidArgument, "begin_frame before build");
        }
        let device_handle = self.device.clone();
        let mut device = lock_device(&device_handle)?;
        self.open_frame(&mut *device)
    }

    /// Retire the previous frame once; later calls within the frame are no-ops
    fn open_frame(&mut self, device: &mut dyn GraphicsDevice) -> Result<()> {
        if self.frame_open {
            return Ok(());
        }
        if let Some(ticket) = self.last_frame {
            device.wait_frame(ticket, self.config.fence_timeout_ns)?;
        }
        self.frame_open = true;
        Ok(())
    }

    pub fn set_transform(&mut self, index: InstanceIndex, transform: glam::Mat4) -> Result<()> {
        self.instances.set_transform(index, transform)?;
        self.state = FrameState::InstancesDirty;
        self.rewrite_record(index)
    }

    pub fn set_visibility_mask(&mut self, index: InstanceIndex, mask: u8) -> Result<()> {
        self.instances.set_visibility_mask(index, mask)?;
        self.state = FrameState::InstancesDirty;
        Ok(())
    }

    pub fn set_material(&mut self, index: InstanceIndex, material: Option<MaterialRef>) -> Result<()> {
        self.instances.set_material(index, material)?;
        self.mark_records_dirty();
        self.rewrite_record(index)
    }

    pub fn set_color(&mut self, index: InstanceIndex, color: glam::Vec4) -> Result<()> {
        self.instances.set_color(index, color)?;
        self.mark_records_dirty();
        self.rewrite_record(index)
    }

    /// Rebind an instance to another hit program; schedules a full rebuild
    pub fn set_dispatch_group(&mut self, index: InstanceIndex, group: GroupIndex) -> Result<()> {
        if let Some(built) = &self.built {
            check_hit_group(&built.pipeline, group)?;
        }
        self.instances.set_dispatch_group(index, group)?;
        if self.instances.topology_changed() {
            self.state = FrameState::InstancesDirty;
        }
        Ok(())
    }

    fn mark_records_dirty(&mut self) {
        if self.state == FrameState::Idle {
            self.state = FrameState::RecordsDirty;
        }
    }

    /// Rewrite one hit record in place, unless a rebuild will repack it anyway
    fn rewrite_record(&mut self, index: InstanceIndex) -> Result<()> {
        if self.built.is_none() || self.instances.topology_changed() {
            return Ok(());
        }
        let record = match self.instances.get(index) {
            Some(instance) => instance.hit_record(),
            None => return Ok(()),
        };

        let device_handle = self.device.clone();
        let mut device = lock_device(&device_handle)?;
        self.open_frame(&mut *device)?;
        let built = match &self.built {
            Some(built) => built,
            None => return Ok(()),
        };
        built.table.update_entry(&mut *device, SectionKind::HitGroup, index.0, record.as_bytes())?;
        let range = built.table.entry_range(SectionKind::HitGroup, index.0)?;
        self.pending_ranges.push(range);
        self.stats.records_updated += 1;
        Ok(())
    }

    /// Bring the structures up to date, record the trace and submit the frame
    ///
    /// On failure nothing is traced, the frame is counted as aborted and the
    /// pending changes stay queued for the next frame.
    pub fn end_frame(&mut self, extent: TraceExtent) -> Result<FrameReport> {
        if extent.width == 0 || extent.height == 0 || extent.depth == 0 {
            lumen_bail!("lumen::SceneDriver", InvalidArgument,
                "empty trace extent {}x{}x{}", extent.width, extent.height, extent.depth);
        }
        let mut built = match self.built.take() {
            Some(built) => built,
            None => lumen_bail!("lumen::SceneDriver", InvalidArgument, "end_frame before build"),
        };

        let device_handle = self.device.clone();
        let result = match lock_device(&device_handle) {
            Ok(mut device) => self.run_frame(&mut *device, &mut built, extent),
            Err(e) => Err(e),
        };
        self.built = Some(built);

        match result {
            Ok(report) => {
                self.instances.mark_clean();
                self.pending_ranges.clear();
                self.last_frame = Some(report.ticket);
                self.frame_open = false;
                self.state = FrameState::Idle;
                self.stats.frames_submitted += 1;
                match report.action {
                    FrameAction::Refit => self.stats.refits += 1,
                    FrameAction::Rebuild => self.stats.rebuilds += 1,
                    FrameAction::Unchanged => {}
                }
                lumen_trace!("lumen::SceneDriver", "frame {} submitted ({:?}, {} records)",
                    report.ticket.0, report.action, report.records_flushed);
                Ok(report)
            }
            Err(e) => {
                self.stats.frames_aborted += 1;
                self.state = if self.instances.has_dirty_transforms() || self.instances.topology_changed() {
                    FrameState::InstancesDirty
                } else if self.instances.has_dirty_records() {
                    FrameState::RecordsDirty
                } else {
                    FrameState::Idle
                };
                lumen_warn!("lumen::SceneDriver", "frame aborted, nothing traced: {}", e);
                Err(e)
            }
        }
    }

    fn run_frame(
        &mut self,
        device: &mut dyn GraphicsDevice,
        built: &mut BuiltScene,
        extent: TraceExtent,
    ) -> Result<FrameReport> {
        let mut path = vec![FrameState::Idle];
        let mut commands = CommandStream::new("scene frame");
        let mut action = FrameAction::Unchanged;
        let mut records_flushed = 0;

        // The previous frame may still read the instance buffer and the table
        self.open_frame(device)?;

        let rebuild = self.instances.topology_changed()
            || (self.instances.has_dirty_transforms() && !built.top_level.allows_refit());

        if rebuild {
            path.push(FrameState::InstancesDirty);
            let (top_level, table) = self.build_structures(device, &built.pipeline, &built.programs)?;
            let old_top_level = std::mem::replace(&mut built.top_level, top_level);
            let old_table = std::mem::replace(&mut built.table, table);
            old_top_level.destroy(device);
            old_table.destroy(device);
            lumen_debug!("lumen::SceneDriver", "top-level index and dispatch table rebuilt over {} instances",
                self.instances.len());
            action = FrameAction::Rebuild;
            records_flushed = self.instances.len();
            path.push(FrameState::RecordsFlushed);
        } else {
            if self.instances.has_dirty_transforms() {
                path.push(FrameState::InstancesDirty);
                let instances = self.instances.top_level_instances(&self.geometries)?;
                built.top_level.record_refit(device, &mut commands, &instances)?;
                action = FrameAction::Refit;
                path.push(FrameState::Refitting);
            }
            if !self.pending_ranges.is_empty() {
                path.push(FrameState::RecordsDirty);
                let buffer = built.table.buffer();
                for range in merge_ranges(&self.pending_ranges) {
                    device.flush_buffer(buffer, range.start, range.end - range.start)?;
                }
                records_flushed = self.instances.dirty_records().len();
                path.push(FrameState::RecordsFlushed);
            }
        }

        commands.trace_rays(TraceRaysCommand {
            pipeline: built.pipeline.handle(),
            top_level: built.top_level.handle(),
            table: built.table.buffer(),
            raygen: built.table.region(SectionKind::RayGen).strided(),
            miss: built.table.region(SectionKind::Miss).strided(),
            hit_group: built.table.region(SectionKind::HitGroup).strided(),
            callable: built.table.region(SectionKind::Callable).strided(),
            width: extent.width,
            height: extent.height,
            depth: extent.depth,
        });
        let ticket = device.submit_frame(commands)?;
        path.push(FrameState::Idle);

        Ok(FrameReport { ticket, action, records_flushed, path })
    }

    // ===== ACCESSORS =====

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn stats(&self) -> DriverStats {
        self.stats
    }

    pub fn config(&self) -> &SceneConfig {
        &self.config
    }

    pub fn device(&self) -> &SharedGraphicsDevice {
        &self.device
    }

    pub fn geometries(&self) -> &GeometryStore {
        &self.geometries
    }

    pub fn instances(&self) -> &SceneInstanceTable {
        &self.instances
    }

    pub fn is_built(&self) -> bool {
        self.built.is_some()
    }

    pub fn top_level(&self) -> Option<&TopLevelIndex> {
        self.built.as_ref().map(|b| &b.top_level)
    }

    pub fn dispatch_table(&self) -> Option<&DispatchTable> {
        self.built.as_ref().map(|b| &b.table)
    }

    pub fn pipeline(&self) -> Option<&RayTracingPipeline> {
        self.built.as_ref().map(|b| &b.pipeline)
    }

    pub fn last_frame(&self) -> Option<FrameTicket> {
        self.last_frame
    }
}

impl Drop for SceneDriver {
    fn drop(&mut self) {
        let device_handle = self.device.clone();
        let mut device = match lock_device(&device_handle) {
            Ok(device) => device,
            Err(_) => {
                lumen_warn!("lumen::SceneDriver", "device unavailable at teardown, GPU objects leaked");
                return;
            }
        };
        if let Err(e) = device.wait_idle() {
            lumen_warn!("lumen::SceneDriver", "wait_idle failed at teardown: {}", e);
        }
        if let Some(built) = self.built.take() {
            built.table.destroy(&mut *device);
            built.top_level.destroy(&mut *device);
            built.pipeline.destroy(&mut *device);
        }
        self.geometries.clear(&mut *device);
    }
}

fn check_hit_group(pipeline: &RayTracingPipeline, group: GroupIndex) -> Result<()> {
    if pipeline.section_of(group) != Some(SectionKind::HitGroup) {
        lumen_bail!("lumen::SceneDriver", InvalidArgument, "group {} is not a hit group of the pipeline", group.0);
    }
    Ok(())
}

/// Sorted, coalesced copy of byte ranges
fn merge_ranges(ranges: &[Range<u64>]) -> Vec<Range<u64>> {
    let mut sorted = ranges.to_vec();
    sorted.sort_by_key(|r| r.start);
    let mut merged: Vec<Range<u64>> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match merged.last_mut() {
            Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
            _ => merged.push(range),
        }
    }
    merged
}

#[cfg(test)]
#[path = "scene_driver_tests.rs"]
mod tests;
