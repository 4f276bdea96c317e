/// Ray tracing pipeline descriptors and the pipeline/program backend interface

use slotmap::new_key_type;
use crate::error::Result;

new_key_type! {
    /// Backend-owned ray tracing pipeline
    pub struct PipelineHandle;
}

/// Ray tracing shader stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    RayGen,
    Miss,
    Callable,
    ClosestHit,
    AnyHit,
    Intersection,
}

impl ShaderStage {
    /// Stages that form a general group on their own
    pub fn is_general(&self) -> bool {
        matches!(self, ShaderStage::RayGen | ShaderStage::Miss | ShaderStage::Callable)
    }

    /// Stages that belong to a hit group
    pub fn is_hit(&self) -> bool {
        !self.is_general()
    }
}

/// Compiled shader module (SPIR-V words) for one stage
#[derive(Debug, Clone, PartialEq)]
pub struct ShaderModuleDesc {
    pub name: String,
    pub stage: ShaderStage,
    pub code: Vec<u32>,
    pub entry_point: String,
}

impl ShaderModuleDesc {
    pub fn new(name: impl Into<String>, stage: ShaderStage, code: Vec<u32>) -> Self {
        Self {
            name: name.into(),
            stage,
            code,
            entry_point: "main".to_string(),
        }
    }
}

/// Shader group referencing stages by their index in the stage list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderGroupDesc {
    /// Ray generation, miss or callable program
    General { shader: u32 },
    /// Hit group over triangle geometry
    TrianglesHit {
        closest_hit: Option<u32>,
        any_hit: Option<u32>,
    },
    /// Hit group over analytic primitives
    ProceduralHit {
        intersection: u32,
        closest_hit: Option<u32>,
        any_hit: Option<u32>,
    },
}

/// Descriptor for creating a ray tracing pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct RayTracingPipelineDesc {
    pub name: String,
    pub stages: Vec<ShaderModuleDesc>,
    pub groups: Vec<ShaderGroupDesc>,
    pub max_recursion_depth: u32,
}

/// Pipeline/program backend
pub trait PipelineBackend {
    /// Create a ray tracing pipeline from stages and groups
    fn create_pipeline(&mut self, desc: &RayTracingPipelineDesc) -> Result<PipelineHandle>;

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle);

    /// Size in bytes of one program-identity handle
    fn shader_group_handle_size(&self) -> u32;

    /// Required alignment of a dispatch table record
    fn shader_group_handle_alignment(&self) -> u32;

    /// Required alignment of the start of a dispatch table section
    fn shader_group_base_alignment(&self) -> u32;

    /// Identity handles of `group_count` groups starting at `first_group`,
    /// concatenated in group order
    fn group_handles(&self, pipeline: PipelineHandle, first_group: u32, group_count: u32) -> Result<Vec<u8>>;
}
