//! Ray tracing pipelines from SPIR-V libraries

use std::any::Any;
use std::collections::HashMap;
use std::ffi::CString;
use std::io::Cursor;
use std::sync::Arc;

use ash::vk::{self, Handle};
use ash::Device;

use crate::render::api::{
    GraphicsError, GraphicsResult, PipelineHandle, PipelineKind, RayTracingPipeline, ShaderIdentifier,
};
use crate::render::raytracing::pipeline::{HitGroupKind, RayTracingPipelineDesc, ShaderStage};

use super::conv::{self, vk_error};
use super::device::DeviceShared;

/// One shader stage: an entry point of a library module
#[derive(Debug, Clone, PartialEq, Eq)]
struct StagePlan {
    library: usize,
    entry: String,
    stage: ShaderStage,
}

/// One shader group, referencing stages by index
#[derive(Debug, Clone, PartialEq, Eq)]
enum GroupPlan {
    General { export: String, stage: u32 },
    Hit { export: String, procedural: bool, closest_hit: Option<u32>, any_hit: Option<u32>, intersection: Option<u32> },
}

impl GroupPlan {
    fn export(&self) -> &str {
        match self {
            Self::General { export, .. } | Self::Hit { export, .. } => export,
        }
    }

    fn info(&self) -> vk::RayTracingShaderGroupCreateInfoKHR {
        let unused = vk::SHADER_UNUSED_KHR;
        let builder = vk::RayTracingShaderGroupCreateInfoKHR::builder();
        match self {
            Self::General { stage, .. } => builder
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(*stage)
                .closest_hit_shader(unused)
                .any_hit_shader(unused)
                .intersection_shader(unused),
            Self::Hit { procedural, closest_hit, any_hit, intersection, .. } => builder
                .ty(if *procedural {
                    vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP
                } else {
                    vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP
                })
                .general_shader(unused)
                .closest_hit_shader(closest_hit.unwrap_or(unused))
                .any_hit_shader(any_hit.unwrap_or(unused))
                .intersection_shader(intersection.unwrap_or(unused)),
        }
        .build()
    }
}

/// Stages in library order, then one general group per ray generation, miss
/// and callable export followed by the hit groups
fn plan(desc: &RayTracingPipelineDesc) -> GraphicsResult<(Vec<StagePlan>, Vec<GroupPlan>)> {
    let stages: Vec<StagePlan> = desc
        .libraries
        .iter()
        .enumerate()
        .flat_map(|(library, lib)| {
            lib.exports.iter().map(move |export| StagePlan { library, entry: export.name.clone(), stage: export.stage })
        })
        .collect();
    let index_of: HashMap<&str, u32> =
        stages.iter().enumerate().map(|(index, stage)| (stage.entry.as_str(), index as u32)).collect();

    let mut groups: Vec<GroupPlan> = stages
        .iter()
        .enumerate()
        .filter(|(_, stage)| {
            matches!(stage.stage, ShaderStage::RayGeneration | ShaderStage::Miss | ShaderStage::Callable)
        })
        .map(|(index, stage)| GroupPlan::General { export: stage.entry.clone(), stage: index as u32 })
        .collect();

    let lookup = |group: &str, import: Option<&String>| -> GraphicsResult<Option<u32>> {
        import
            .map(|name| {
                index_of.get(name.as_str()).copied().ok_or_else(|| {
                    GraphicsError::invalid(format!("hit group '{}' imports unknown shader '{}'", group, name))
                })
            })
            .transpose()
    };
    for hit_group in &desc.hit_groups {
        groups.push(GroupPlan::Hit {
            export: hit_group.name.clone(),
            procedural: hit_group.kind == HitGroupKind::ProceduralPrimitive,
            closest_hit: lookup(&hit_group.name, hit_group.closest_hit.as_ref())?,
            any_hit: lookup(&hit_group.name, hit_group.any_hit.as_ref())?,
            intersection: lookup(&hit_group.name, hit_group.intersection.as_ref())?,
        });
    }
    Ok((stages, groups))
}

/// Modules destroyed once the pipeline is created or creation failed
struct ShaderModules<'a> {
    device: &'a Device,
    modules: Vec<vk::ShaderModule>,
}

impl Drop for ShaderModules<'_> {
    fn drop(&mut self) {
        for module in self.modules.drain(..) {
            unsafe { self.device.destroy_shader_module(module, None) };
        }
    }
}

/// Compiled ray tracing pipeline of the Vulkan device
pub struct VulkanPipeline {
    device: Arc<DeviceShared>,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    identifiers: HashMap<String, ShaderIdentifier>,
}

impl VulkanPipeline {
    pub(crate) fn new(device: Arc<DeviceShared>, desc: &RayTracingPipelineDesc) -> GraphicsResult<Self> {
        let loaders = device.ray_tracing()?;
        let (stage_plans, group_plans) = plan(desc)?;

        let mut modules = ShaderModules { device: &device.device, modules: Vec::new() };
        for (index, library) in desc.libraries.iter().enumerate() {
            let code = ash::util::read_spv(&mut Cursor::new(&library.bytecode[..]))
                .map_err(|err| {
                    GraphicsError::invalid(format!("library {} of '{}' is not SPIR-V: {}", index, desc.name, err))
                })?;
            let info = vk::ShaderModuleCreateInfo::builder().code(&code);
            let module = unsafe { device.device.create_shader_module(&info, None) }
                .map_err(vk_error("vkCreateShaderModule"))?;
            modules.modules.push(module);
        }

        let entries = stage_plans
            .iter()
            .map(|plan| CString::new(plan.entry.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| GraphicsError::invalid(format!("export name: {}", err)))?;
        let stages: Vec<vk::PipelineShaderStageCreateInfo> = stage_plans
            .iter()
            .zip(&entries)
            .map(|(plan, entry)| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(conv::shader_stage(plan.stage))
                    .module(modules.modules[plan.library])
                    .name(entry)
                    .build()
            })
            .collect();
        let groups: Vec<vk::RayTracingShaderGroupCreateInfoKHR> = group_plans.iter().map(GroupPlan::info).collect();

        let layout = match desc.global_root_signature.0 {
            0 => device.default_pipeline_layout,
            raw => vk::PipelineLayout::from_raw(raw),
        };
        if !desc.local_root_signatures.is_empty() {
            log::debug!(
                "Pipeline '{}': {} local root signature binding(s) have no Vulkan counterpart and are ignored",
                desc.name,
                desc.local_root_signatures.len()
            );
        }

        let info = vk::RayTracingPipelineCreateInfoKHR::builder()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(desc.pipeline_config.max_recursion_depth)
            .layout(layout);
        let pipelines = unsafe {
            loaders.pipeline.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[info.build()],
                None,
            )
        };
        let pipeline = device
            .check("vkCreateRayTracingPipelinesKHR", pipelines)?
            .into_iter()
            .next()
            .ok_or_else(|| GraphicsError::invalid("no pipeline created"))?;
        drop(modules);

        let handle_size = device.shader_table_properties.identifier_size as usize;
        let handles = unsafe {
            loaders.pipeline.get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                groups.len() as u32,
                groups.len() * handle_size,
            )
        };
        let handles = match device.check("vkGetRayTracingShaderGroupHandlesKHR", handles) {
            Ok(handles) => handles,
            Err(err) => {
                unsafe { device.device.destroy_pipeline(pipeline, None) };
                return Err(err);
            }
        };
        let identifiers = group_plans
            .iter()
            .zip(handles.chunks_exact(handle_size))
            .map(|(plan, handle)| (plan.export().to_string(), ShaderIdentifier(handle.to_vec())))
            .collect::<HashMap<_, _>>();

        log::debug!("Created pipeline '{}' with {} shader groups", desc.name, group_plans.len());
        Ok(Self { device, pipeline, layout, identifiers })
    }

    /// Raw pipeline handle
    pub fn raw(&self) -> vk::Pipeline {
        self.pipeline
    }

    /// Layout the pipeline was created with
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Drop for VulkanPipeline {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_pipeline(self.pipeline, None) };
    }
}

impl RayTracingPipeline for VulkanPipeline {
    fn handle(&self) -> PipelineHandle {
        PipelineHandle { raw: self.pipeline.as_raw(), kind: PipelineKind::RayTracing }
    }

    fn shader_identifier(&self, export: &str) -> Option<ShaderIdentifier> {
        self.identifiers.get(export).cloned()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::api::RootSignatureHandle;
    use crate::render::raytracing::pipeline::{HitGroup, LibraryExport, RayTracingPipelineBuilder};

    fn desc() -> RayTracingPipelineDesc {
        let mut builder = RayTracingPipelineBuilder::new("plan");
        builder.library(
            vec![0u8; 4],
            vec![
                LibraryExport::new("rayGen", ShaderStage::RayGeneration),
                LibraryExport::new("chs", ShaderStage::ClosestHit),
                LibraryExport::new("miss", ShaderStage::Miss),
            ],
        );
        builder.hit_group(HitGroup::triangles("HitGroup", "chs"));
        builder.shader_config(12, 8);
        builder.pipeline_config(1);
        builder.global_root_signature(RootSignatureHandle(0));
        builder.build().unwrap()
    }

    #[test]
    fn test_group_plan() {
        let (stages, groups) = plan(&desc()).unwrap();
        assert_eq!(stages.len(), 3);
        assert_eq!(
            groups,
            vec![
                GroupPlan::General { export: "rayGen".to_string(), stage: 0 },
                GroupPlan::General { export: "miss".to_string(), stage: 2 },
                GroupPlan::Hit {
                    export: "HitGroup".to_string(),
                    procedural: false,
                    closest_hit: Some(1),
                    any_hit: None,
                    intersection: None,
                },
            ]
        );
    }

    #[test]
    fn test_group_info() {
        let (_, groups) = plan(&desc()).unwrap();
        let hit = groups[2].info();
        assert_eq!(hit.ty, vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP);
        assert_eq!(hit.closest_hit_shader, 1);
        assert_eq!(hit.general_shader, vk::SHADER_UNUSED_KHR);
        assert_eq!(groups[0].info().general_shader, 0);
    }
}
