/// Dispatch module - ray tracing pipelines and their dispatch tables

pub mod pipeline_builder;
pub mod dispatch_table;

pub use pipeline_builder::{GroupIndex, RayTracingPipeline, RayTracingPipelineBuilder};
pub use dispatch_table::{
    round_up, DispatchRegion, DispatchTable, DispatchTableBuilder, SectionKind, RECORD_ALIGNMENT,
};
