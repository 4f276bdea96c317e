/// Backend-neutral command stream
///
/// Commands are recorded on the host and translated by the backend when the
/// stream is submitted, so nothing here touches the GPU.

use super::buffer::BufferHandle;
use super::pipeline::PipelineHandle;
use super::spatial_index::{IndexDescriptor, IndexHandle};

/// Byte range of a dispatch table section, as consumed by a trace call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StridedRegion {
    pub offset: u64,
    pub stride: u64,
    pub size: u64,
}

/// Build or update of a spatial index
#[derive(Debug, Clone, PartialEq)]
pub struct IndexBuildCommand {
    pub descriptor: IndexDescriptor,
    /// Instance records (top level only)
    pub instance_data: Option<BufferHandle>,
    /// Update in place instead of a full build
    pub update_only: bool,
    /// Index read by an update (the destination itself for a refit)
    pub source: Option<IndexHandle>,
    pub destination: IndexHandle,
    pub scratch: BufferHandle,
}

/// Ray dispatch over the whole extent
#[derive(Debug, Clone, PartialEq)]
pub struct TraceRaysCommand {
    pub pipeline: PipelineHandle,
    pub top_level: IndexHandle,
    pub table: BufferHandle,
    pub raygen: StridedRegion,
    pub miss: StridedRegion,
    pub hit_group: StridedRegion,
    pub callable: StridedRegion,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

/// One recorded command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CopyBuffer {
        src: BufferHandle,
        dst: BufferHandle,
        size: u64,
    },
    BuildIndex(IndexBuildCommand),
    /// Makes index builds visible to later builds and traces
    IndexBuildBarrier,
    TraceRays(TraceRaysCommand),
}

/// Ordered list of commands submitted as one unit
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommandStream {
    label: String,
    commands: Vec<Command>,
}

impl CommandStream {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            commands: Vec::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn copy_buffer(&mut self, src: BufferHandle, dst: BufferHandle, size: u64) {
        self.commands.push(Command::CopyBuffer { src, dst, size });
    }

    pub fn build_index(&mut self, build: IndexBuildCommand) {
        self.commands.push(Command::BuildIndex(build));
    }

    pub fn index_build_barrier(&mut self) {
        self.commands.push(Command::IndexBuildBarrier);
    }

    pub fn trace_rays(&mut self, trace: TraceRaysCommand) {
        self.commands.push(Command::TraceRays(trace));
    }
}
