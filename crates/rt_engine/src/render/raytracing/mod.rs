//! Ray tracing: acceleration structures, pipelines and shader tables

pub mod acceleration;
pub mod binding_layout;
pub mod instance;
pub mod pipeline;
pub mod shader_table;

pub use acceleration::{
    instance_descs, AccelerationStructureBuffers, AccelerationStructureBuilder, BottomLevel, PerFrame, TopLevel,
    TopLevelInstance,
};
pub use binding_layout::ShaderBindingLayout;
pub use instance::{InstanceFlags, RaytracingInstanceDesc, INSTANCE_DESC_SIZE};
pub use pipeline::{
    ExportKind, HitGroup, HitGroupKind, LibraryExport, LocalRootSignatureBinding, PipelineBuildError, PipelineConfig,
    RayTracingPipelineBuilder, RayTracingPipelineDesc, ShaderConfig, ShaderLibrary, ShaderStage, Subobject,
    SubobjectIndex, MAX_ATTRIBUTE_SIZE, MAX_RECURSION_DEPTH,
};
pub use shader_table::{RecordWriter, RootArgument, ShaderTable, ShaderTableLayout, ShaderTableWriter, ShaderTableZone};
