//! Scene module
//!
//! The instance table and the per-frame driver that keeps the top-level
//! index and the dispatch table in step with it.

pub mod scene_instance;
pub mod scene_driver;

pub use scene_instance::{
    InstanceIndex, MaterialRef, HitRecord, HIT_RECORD_SIZE, normal_matrix_rows,
    SceneInstance, SceneInstanceDesc, SceneInstanceTable,
};
pub use scene_driver::{
    SceneDriver, FrameState, FrameAction, FrameReport, DriverStats, DispatchPrograms, TraceExtent,
};
