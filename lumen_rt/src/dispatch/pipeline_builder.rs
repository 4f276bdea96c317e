/// Ray tracing pipeline builder
///
/// Stages and groups accumulate in the builder and are handed to the backend
/// in one `create_pipeline` call. Every general stage (ray generation, miss,
/// callable) forms its own group; hit stages are collected between
/// `start_hit_group` and `end_hit_group`. Group indices are returned in
/// registration order, which is also the order the backend reports the
/// group identity handles in.

use crate::error::Result;
use crate::graphics_device::{
    GraphicsDevice, PipelineHandle, RayTracingPipelineDesc, ShaderGroupDesc, ShaderModuleDesc, ShaderStage,
};
use crate::{lumen_bail, lumen_debug};
use super::dispatch_table::SectionKind;

/// Position of a group in the pipeline's group list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupIndex(pub u32);

#[derive(Debug, Default)]
struct OpenHitGroup {
    closest_hit: Option<u32>,
    any_hit: Option<u32>,
    intersection: Option<u32>,
}

pub struct RayTracingPipelineBuilder {
    name: String,
    stages: Vec<ShaderModuleDesc>,
    groups: Vec<ShaderGroupDesc>,
    sections: Vec<SectionKind>,
    open_hit_group: Option<OpenHitGroup>,
    max_recursion_depth: u32,
}

impl RayTracingPipelineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            groups: Vec::new(),
            sections: Vec::new(),
            open_hit_group: None,
            max_recursion_depth: 2,
        }
    }

    pub fn with_max_recursion_depth(mut self, depth: u32) -> Self {
        self.max_recursion_depth = depth;
        self
    }

    /// Add a ray generation, miss or callable stage as its own group
    pub fn add_shader_stage(&mut self, module: ShaderModuleDesc) -> Result<GroupIndex> {
        if self.open_hit_group.is_some() {
            lumen_bail!("lumen::RayTracingPipelineBuilder", InvalidArgument,
                "'{}': general stage '{}' added inside an open hit group", self.name, module.name);
        }
        let section = match module.stage {
            ShaderStage::RayGen => SectionKind::RayGen,
            ShaderStage::Miss => SectionKind::Miss,
            ShaderStage::Callable => SectionKind::Callable,
            stage => lumen_bail!("lumen::RayTracingPipelineBuilder", InvalidArgument,
                "'{}': {:?} stage '{}' must be added to a hit group", self.name, stage, module.name),
        };

        let shader = self.push_stage(module);
        Ok(self.push_group(ShaderGroupDesc::General { shader }, section))
    }

    pub fn start_hit_group(&mut self) -> Result<()> {
        if self.open_hit_group.is_some() {
            lumen_bail!("lumen::RayTracingPipelineBuilder", InvalidArgument,
                "'{}': hit group started while another one is open", self.name);
        }
        self.open_hit_group = Some(OpenHitGroup::default());
        Ok(())
    }

    /// Add a closest-hit, any-hit or intersection stage to the open hit group
    pub fn add_hit_shader_stage(&mut self, module: ShaderModuleDesc) -> Result<()> {
        let stage = module.stage;
        let slot_taken = match (&self.open_hit_group, stage) {
            (None, _) => lumen_bail!("lumen::RayTracingPipelineBuilder", InvalidArgument,
                "'{}': hit stage '{}' added outside a hit group", self.name, module.name),
            (Some(_), s) if s.is_general() => lumen_bail!("lumen::RayTracingPipelineBuilder", InvalidArgument,
                "'{}': {:?} stage '{}' cannot be part of a hit group", self.name, s, module.name),
            (Some(open), ShaderStage::ClosestHit) => open.closest_hit.is_some(),
            (Some(open), ShaderStage::AnyHit) => open.any_hit.is_some(),
            (Some(open), _) => open.intersection.is_some(),
        };
        if slot_taken {
            lumen_bail!("lumen::RayTracingPipelineBuilder", InvalidArgument,
                "'{}': hit group already has a {:?} stage", self.name, stage);
        }

        let shader = self.push_stage(module);
        if let Some(open) = self.open_hit_group.as_mut() {
            match stage {
                ShaderStage::ClosestHit => open.closest_hit = Some(shader),
                ShaderStage::AnyHit => open.any_hit = Some(shader),
                _ => open.intersection = Some(shader),
            }
        }
        Ok(())
    }

    /// Close the open hit group
    ///
    /// A group with an intersection stage is procedural, otherwise it hits
    /// triangles.
    pub fn end_hit_group(&mut self) -> Result<GroupIndex> {
        let open = match self.open_hit_group.take() {
            Some(open) => open,
            None => lumen_bail!("lumen::RayTracingPipelineBuilder", InvalidArgument,
                "'{}': end_hit_group without start_hit_group", self.name),
        };
        let group = match open {
            OpenHitGroup { closest_hit: None, any_hit: None, intersection: None } => {
                lumen_bail!("lumen::RayTracingPipelineBuilder", InvalidArgument,
                    "'{}': hit group has no stages", self.name)
            }
            OpenHitGroup { closest_hit, any_hit, intersection: Some(intersection) } => {
                ShaderGroupDesc::ProceduralHit { intersection, closest_hit, any_hit }
            }
            OpenHitGroup { closest_hit, any_hit, intersection: None } => {
                ShaderGroupDesc::TrianglesHit { closest_hit, any_hit }
            }
        };
        Ok(self.push_group(group, SectionKind::HitGroup))
    }

    pub fn group_count(&self) -> u32 {
        self.groups.len() as u32
    }

    pub fn build(self, device: &mut dyn GraphicsDevice) -> Result<RayTracingPipeline> {
        if self.open_hit_group.is_some() {
            lumen_bail!("lumen::RayTracingPipelineBuilder", InvalidArgument,
                "'{}': pipeline built with an open hit group", self.name);
        }
        if !self.sections.contains(&SectionKind::RayGen) {
            lumen_bail!("lumen::RayTracingPipelineBuilder", InvalidArgument,
                "'{}': pipeline has no ray generation stage", self.name);
        }

        let handle = device.create_pipeline(&RayTracingPipelineDesc {
            name: self.name.clone(),
            stages: self.stages,
            groups: self.groups,
            max_recursion_depth: self.max_recursion_depth,
        })?;

        lumen_debug!("lumen::RayTracingPipelineBuilder", "'{}': pipeline created with {} groups",
            self.name, self.sections.len());

        Ok(RayTracingPipeline {
            handle,
            group_sections: self.sections,
            max_recursion_depth: self.max_recursion_depth,
        })
    }

    fn push_stage(&mut self, module: ShaderModuleDesc) -> u32 {
        self.stages.push(module);
        self.stages.len() as u32 - 1
    }

    fn push_group(&mut self, group: ShaderGroupDesc, section: SectionKind) -> GroupIndex {
        self.groups.push(group);
        self.sections.push(section);
        GroupIndex(self.groups.len() as u32 - 1)
    }
}

/// A created ray tracing pipeline and the section kind of each of its groups
#[derive(Debug)]
pub struct RayTracingPipeline {
    handle: PipelineHandle,
    group_sections: Vec<SectionKind>,
    max_recursion_depth: u32,
}

impl RayTracingPipeline {
    pub fn handle(&self) -> PipelineHandle {
        self.handle
    }

    pub fn group_count(&self) -> u32 {
        self.group_sections.len() as u32
    }

    /// Groups of one section kind, in registration order
    pub fn groups_of(&self, kind: SectionKind) -> Vec<GroupIndex> {
        self.group_sections
            .iter()
            .enumerate()
            .filter(|(_, section)| **section == kind)
            .map(|(i, _)| GroupIndex(i as u32))
            .collect()
    }

    pub fn section_of(&self, group: GroupIndex) -> Option<SectionKind> {
        self.group_sections.get(group.0 as usize).copied()
    }

    pub fn max_recursion_depth(&self) -> u32 {
        self.max_recursion_depth
    }

    pub fn destroy(self, device: &mut dyn GraphicsDevice) {
        device.destroy_pipeline(self.handle);
    }
}

#[cfg(test)]
#[path = "pipeline_builder_tests.rs"]
mod tests;
