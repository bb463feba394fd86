//! Ray tracing pipeline description builder
//!
//! A ray tracing pipeline is assembled from a list of subobjects: shader
//! libraries, hit groups, root signatures, export associations and the shader
//! and pipeline configs. [`RayTracingPipelineBuilder`] collects them as a
//! closed [`Subobject`] enum and [`RayTracingPipelineBuilder::build`] checks
//! the cross-references before anything reaches the driver.
//!
//! ```text
//! library(rayGen, miss, chs) ─┐
//! hit group "HitGroup" → chs ─┼─ association(local root sig → [rayGen, HitGroup])
//! shader config (payload, attributes)
//! pipeline config (recursion depth)
//! global root signature
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::render::api::RootSignatureHandle;

/// Largest attribute struct the hardware intersection path supports
pub const MAX_ATTRIBUTE_SIZE: u32 = 32;

/// Deepest `TraceRay` recursion the API accepts
pub const MAX_RECURSION_DEPTH: u32 = 31;

/// Shader stage of a library export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    /// Ray generation
    RayGeneration,
    /// Miss
    Miss,
    /// Closest hit
    ClosestHit,
    /// Any hit
    AnyHit,
    /// Intersection
    Intersection,
    /// Callable
    Callable,
}

/// Named entry point exported by a library
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryExport {
    /// Export name
    pub name: String,
    /// Stage of the entry point
    pub stage: ShaderStage,
}

impl LibraryExport {
    /// Create an export
    pub fn new(name: impl Into<String>, stage: ShaderStage) -> Self {
        Self { name: name.into(), stage }
    }
}

/// Compiled shader library with its exports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderLibrary {
    /// Library bytecode
    pub bytecode: Arc<[u8]>,
    /// Exported entry points
    pub exports: Vec<LibraryExport>,
}

/// Primitive type a hit group handles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitGroupKind {
    /// Built-in triangle intersection
    Triangles,
    /// Custom intersection shader
    ProceduralPrimitive,
}

/// Hit group combining the hit stages under one exported name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HitGroup {
    /// Exported hit group name
    pub name: String,
    /// Primitive type
    pub kind: HitGroupKind,
    /// Closest hit import
    pub closest_hit: Option<String>,
    /// Any hit import
    pub any_hit: Option<String>,
    /// Intersection import
    pub intersection: Option<String>,
}

impl HitGroup {
    /// Triangle hit group with only a closest hit shader
    pub fn triangles(name: impl Into<String>, closest_hit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: HitGroupKind::Triangles,
            closest_hit: Some(closest_hit.into()),
            any_hit: None,
            intersection: None,
        }
    }

    fn imports(&self) -> impl Iterator<Item = (&str, ShaderStage)> {
        [
            (self.closest_hit.as_deref(), ShaderStage::ClosestHit),
            (self.any_hit.as_deref(), ShaderStage::AnyHit),
            (self.intersection.as_deref(), ShaderStage::Intersection),
        ]
        .into_iter()
        .filter_map(|(name, stage)| name.map(|name| (name, stage)))
    }
}

/// Payload and attribute sizes shared by all shaders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderConfig {
    /// Largest ray payload in bytes
    pub max_payload_size: u32,
    /// Largest intersection attribute struct in bytes
    pub max_attribute_size: u32,
}

/// Pipeline-wide limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Deepest `TraceRay` recursion
    pub max_recursion_depth: u32,
}

/// Position of a subobject in the builder, used by export associations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubobjectIndex(pub usize);

/// One pipeline building block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subobject {
    /// Shader library
    DxilLibrary(ShaderLibrary),
    /// Hit group
    HitGroup(HitGroup),
    /// Local root signature, bound per shader table record
    LocalRootSignature(RootSignatureHandle),
    /// Associates a local root signature or shader config with exports
    ExportAssociation {
        /// Associated subobject
        target: SubobjectIndex,
        /// Export or hit group names
        exports: Vec<String>,
    },
    /// Payload and attribute sizes
    ShaderConfig(ShaderConfig),
    /// Recursion depth
    PipelineConfig(PipelineConfig),
    /// Root signature shared by all shaders
    GlobalRootSignature(RootSignatureHandle),
}

impl Subobject {
    fn kind_name(&self) -> &'static str {
        match self {
            Self::DxilLibrary(_) => "library",
            Self::HitGroup(_) => "hit group",
            Self::LocalRootSignature(_) => "local root signature",
            Self::ExportAssociation { .. } => "export association",
            Self::ShaderConfig(_) => "shader config",
            Self::PipelineConfig(_) => "pipeline config",
            Self::GlobalRootSignature(_) => "global root signature",
        }
    }
}

/// Validation failures of a pipeline description
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineBuildError {
    /// No shader library was added
    #[error("pipeline has no shader library")]
    NoLibrary,

    /// Two exports or hit groups share a name
    #[error("export name '{name}' is defined more than once")]
    DuplicateExport {
        /// Duplicated name
        name: String,
    },

    /// Hit group imports a shader no library exports
    #[error("hit group '{hit_group}' imports unknown shader '{import}'")]
    UnknownHitGroupImport {
        /// Hit group name
        hit_group: String,
        /// Missing import
        import: String,
    },

    /// Hit group imports a shader of the wrong stage
    #[error("hit group '{hit_group}' imports '{import}' as {expected:?}")]
    HitGroupStageMismatch {
        /// Hit group name
        hit_group: String,
        /// Offending import
        import: String,
        /// Stage the slot requires
        expected: ShaderStage,
    },

    /// Hit group has no shaders at all
    #[error("hit group '{hit_group}' has no shaders")]
    EmptyHitGroup {
        /// Hit group name
        hit_group: String,
    },

    /// Association names an export that does not exist
    #[error("association references unknown export '{export}'")]
    UnknownAssociationExport {
        /// Missing export
        export: String,
    },

    /// Association targets a subobject that cannot be associated
    #[error("association target #{index} is not a local root signature or shader config")]
    InvalidAssociationTarget {
        /// Subobject index
        index: usize,
    },

    /// A required singleton subobject is missing
    #[error("pipeline has no {kind}")]
    MissingSubobject {
        /// Subobject kind
        kind: &'static str,
    },

    /// A singleton subobject was added twice
    #[error("pipeline has more than one {kind}")]
    DuplicateSubobject {
        /// Subobject kind
        kind: &'static str,
    },

    /// Recursion depth out of range
    #[error("recursion depth {depth} must be within 1..=31")]
    InvalidRecursionDepth {
        /// Requested depth
        depth: u32,
    },

    /// Zero payload size
    #[error("ray payload size must be non-zero")]
    InvalidPayloadSize,

    /// Attribute size zero or too large
    #[error("attribute size {size} must be within 1..=32")]
    InvalidAttributeSize {
        /// Requested size
        size: u32,
    },
}

/// What an exported name refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    /// Library entry point
    Shader(ShaderStage),
    /// Hit group
    HitGroup,
}

/// Local root signature bound to a set of exports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRootSignatureBinding {
    /// Root signature
    pub root_signature: RootSignatureHandle,
    /// Exports using it
    pub exports: Vec<String>,
}

/// Validated pipeline description handed to the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RayTracingPipelineDesc {
    /// Debug name
    pub name: String,
    /// Shader libraries
    pub libraries: Vec<ShaderLibrary>,
    /// Hit groups
    pub hit_groups: Vec<HitGroup>,
    /// Local root signature associations
    pub local_root_signatures: Vec<LocalRootSignatureBinding>,
    /// Payload and attribute sizes
    pub shader_config: ShaderConfig,
    /// Recursion depth
    pub pipeline_config: PipelineConfig,
    /// Global root signature
    pub global_root_signature: RootSignatureHandle,
    exports: HashMap<String, ExportKind>,
}

impl RayTracingPipelineDesc {
    /// Kind of the export named `name`
    pub fn export_kind(&self, name: &str) -> Option<ExportKind> {
        self.exports.get(name).copied()
    }

    /// Names that receive shader identifiers: ray generation, miss, callable and hit groups
    pub fn identifier_exports(&self) -> impl Iterator<Item = &str> {
        self.exports
            .iter()
            .filter(|(_, kind)| {
                matches!(
                    kind,
                    ExportKind::HitGroup
                        | ExportKind::Shader(ShaderStage::RayGeneration | ShaderStage::Miss | ShaderStage::Callable)
                )
            })
            .map(|(name, _)| name.as_str())
    }

    /// Local root signature associated with `export`, if any
    pub fn local_root_signature_of(&self, export: &str) -> Option<RootSignatureHandle> {
        self.local_root_signatures
            .iter()
            .find(|binding| binding.exports.iter().any(|name| name == export))
            .map(|binding| binding.root_signature)
    }
}

/// Collects subobjects and validates them into a [`RayTracingPipelineDesc`]
#[derive(Debug, Clone, Default)]
pub struct RayTracingPipelineBuilder {
    name: String,
    subobjects: Vec<Subobject>,
}

impl RayTracingPipelineBuilder {
    /// Start an empty pipeline
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), subobjects: Vec::new() }
    }

    /// Append a raw subobject
    pub fn add(&mut self, subobject: Subobject) -> SubobjectIndex {
        self.subobjects.push(subobject);
        SubobjectIndex(self.subobjects.len() - 1)
    }

    /// Add a shader library
    pub fn library(&mut self, bytecode: impl Into<Arc<[u8]>>, exports: Vec<LibraryExport>) -> SubobjectIndex {
        self.add(Subobject::DxilLibrary(ShaderLibrary { bytecode: bytecode.into(), exports }))
    }

    /// Add a hit group
    pub fn hit_group(&mut self, hit_group: HitGroup) -> SubobjectIndex {
        self.add(Subobject::HitGroup(hit_group))
    }

    /// Add a local root signature
    pub fn local_root_signature(&mut self, root_signature: RootSignatureHandle) -> SubobjectIndex {
        self.add(Subobject::LocalRootSignature(root_signature))
    }

    /// Associate `target` with `exports`
    pub fn associate<S: Into<String>>(
        &mut self,
        target: SubobjectIndex,
        exports: impl IntoIterator<Item = S>,
    ) -> SubobjectIndex {
        self.add(Subobject::ExportAssociation { target, exports: exports.into_iter().map(Into::into).collect() })
    }

    /// Set the payload and attribute sizes
    pub fn shader_config(&mut self, max_payload_size: u32, max_attribute_size: u32) -> SubobjectIndex {
        self.add(Subobject::ShaderConfig(ShaderConfig { max_payload_size, max_attribute_size }))
    }

    /// Set the recursion depth
    pub fn pipeline_config(&mut self, max_recursion_depth: u32) -> SubobjectIndex {
        self.add(Subobject::PipelineConfig(PipelineConfig { max_recursion_depth }))
    }

    /// Set the global root signature
    pub fn global_root_signature(&mut self, root_signature: RootSignatureHandle) -> SubobjectIndex {
        self.add(Subobject::GlobalRootSignature(root_signature))
    }

    /// Subobjects added so far
    pub fn subobjects(&self) -> &[Subobject] {
        &self.subobjects
    }

    /// Validate all cross references and produce the description
    pub fn build(&self) -> Result<RayTracingPipelineDesc, PipelineBuildError> {
        let mut libraries = Vec::new();
        let mut hit_groups = Vec::new();
        let mut shader_config = None;
        let mut pipeline_config = None;
        let mut global_root_signature = None;

        for subobject in &self.subobjects {
            match subobject {
                Subobject::DxilLibrary(library) => libraries.push(library.clone()),
                Subobject::HitGroup(group) => hit_groups.push(group.clone()),
                Subobject::ShaderConfig(config) => set_once(&mut shader_config, *config, subobject)?,
                Subobject::PipelineConfig(config) => set_once(&mut pipeline_config, *config, subobject)?,
                Subobject::GlobalRootSignature(handle) => set_once(&mut global_root_signature, *handle, subobject)?,
                Subobject::LocalRootSignature(_) | Subobject::ExportAssociation { .. } => {}
            }
        }

        if libraries.is_empty() {
            return Err(PipelineBuildError::NoLibrary);
        }

        let mut exports = HashMap::new();
        for export in libraries.iter().flat_map(|library| &library.exports) {
            if exports.insert(export.name.clone(), ExportKind::Shader(export.stage)).is_some() {
                return Err(PipelineBuildError::DuplicateExport { name: export.name.clone() });
            }
        }

        for group in &hit_groups {
            let mut has_shader = false;
            for (import, expected) in group.imports() {
                has_shader = true;
                match exports.get(import) {
                    None => {
                        return Err(PipelineBuildError::UnknownHitGroupImport {
                            hit_group: group.name.clone(),
                            import: import.to_string(),
                        })
                    }
                    Some(ExportKind::Shader(stage)) if *stage == expected => {}
                    Some(_) => {
                        return Err(PipelineBuildError::HitGroupStageMismatch {
                            hit_group: group.name.clone(),
                            import: import.to_string(),
                            expected,
                        })
                    }
                }
            }
            if !has_shader {
                return Err(PipelineBuildError::EmptyHitGroup { hit_group: group.name.clone() });
            }
        }
        for group in &hit_groups {
            if exports.insert(group.name.clone(), ExportKind::HitGroup).is_some() {
                return Err(PipelineBuildError::DuplicateExport { name: group.name.clone() });
            }
        }

        let mut local_root_signatures: Vec<LocalRootSignatureBinding> = Vec::new();
        for subobject in &self.subobjects {
            let Subobject::ExportAssociation { target, exports: names } = subobject else {
                continue;
            };
            if let Some(unknown) = names.iter().find(|name| !exports.contains_key(name.as_str())) {
                return Err(PipelineBuildError::UnknownAssociationExport { export: unknown.clone() });
            }
            match self.subobjects.get(target.0) {
                Some(Subobject::LocalRootSignature(handle)) => {
                    local_root_signatures.push(LocalRootSignatureBinding {
                        root_signature: *handle,
                        exports: names.clone(),
                    });
                }
                // The pipeline has exactly one shader config and it already covers every export
                Some(Subobject::ShaderConfig(_)) => {}
                _ => return Err(PipelineBuildError::InvalidAssociationTarget { index: target.0 }),
            }
        }

        let shader_config = shader_config.ok_or(PipelineBuildError::MissingSubobject { kind: "shader config" })?;
        if shader_config.max_payload_size == 0 {
            return Err(PipelineBuildError::InvalidPayloadSize);
        }
        if shader_config.max_attribute_size == 0 || shader_config.max_attribute_size > MAX_ATTRIBUTE_SIZE {
            return Err(PipelineBuildError::InvalidAttributeSize { size: shader_config.max_attribute_size });
        }

        let pipeline_config =
            pipeline_config.ok_or(PipelineBuildError::MissingSubobject { kind: "pipeline config" })?;
        if pipeline_config.max_recursion_depth == 0 || pipeline_config.max_recursion_depth > MAX_RECURSION_DEPTH {
            return Err(PipelineBuildError::InvalidRecursionDepth { depth: pipeline_config.max_recursion_depth });
        }

        let global_root_signature =
            global_root_signature.ok_or(PipelineBuildError::MissingSubobject { kind: "global root signature" })?;

        log::debug!(
            "Pipeline '{}': {} libraries, {} hit groups, {} local root signature bindings",
            self.name,
            libraries.len(),
            hit_groups.len(),
            local_root_signatures.len()
        );

        Ok(RayTracingPipelineDesc {
            name: self.name.clone(),
            libraries,
            hit_groups,
            local_root_signatures,
            shader_config,
            pipeline_config,
            global_root_signature,
            exports,
        })
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T, subobject: &Subobject) -> Result<(), PipelineBuildError> {
    if slot.is_some() {
        return Err(PipelineBuildError::DuplicateSubobject { kind: subobject.kind_name() });
    }
    *slot = Some(value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn library_exports() -> Vec<LibraryExport> {
        vec![
            LibraryExport::new("rayGen", ShaderStage::RayGeneration),
            LibraryExport::new("miss", ShaderStage::Miss),
            LibraryExport::new("chs", ShaderStage::ClosestHit),
            LibraryExport::new("planeChs", ShaderStage::ClosestHit),
        ]
    }

    fn valid_builder() -> RayTracingPipelineBuilder {
        let mut builder = RayTracingPipelineBuilder::new("test");
        builder.library(vec![0u8; 16], library_exports());
        builder.hit_group(HitGroup::triangles("HitGroup", "chs"));
        builder.hit_group(HitGroup::triangles("PlaneHitGroup", "planeChs"));
        let local = builder.local_root_signature(RootSignatureHandle(7));
        builder.associate(local, ["rayGen", "HitGroup"]);
        builder.shader_config(12, 8);
        builder.pipeline_config(2);
        builder.global_root_signature(RootSignatureHandle(1));
        builder
    }

    #[test]
    fn test_valid_pipeline() {
        let desc = valid_builder().build().unwrap();
        assert_eq!(desc.libraries.len(), 1);
        assert_eq!(desc.hit_groups.len(), 2);
        assert_eq!(desc.export_kind("HitGroup"), Some(ExportKind::HitGroup));
        assert_eq!(desc.export_kind("rayGen"), Some(ExportKind::Shader(ShaderStage::RayGeneration)));
        assert_eq!(desc.local_root_signature_of("HitGroup"), Some(RootSignatureHandle(7)));
        assert_eq!(desc.local_root_signature_of("miss"), None);

        let mut names: Vec<_> = desc.identifier_exports().collect();
        names.sort_unstable();
        assert_eq!(names, ["HitGroup", "PlaneHitGroup", "miss", "rayGen"]);
    }

    #[test]
    fn test_missing_library() {
        let mut builder = RayTracingPipelineBuilder::new("empty");
        builder.shader_config(12, 8);
        builder.pipeline_config(1);
        builder.global_root_signature(RootSignatureHandle(1));
        assert_eq!(builder.build().unwrap_err(), PipelineBuildError::NoLibrary);
    }

    #[test]
    fn test_hit_group_import_checks() {
        let mut builder = valid_builder();
        builder.hit_group(HitGroup::triangles("Broken", "doesNotExist"));
        assert!(matches!(builder.build(), Err(PipelineBuildError::UnknownHitGroupImport { .. })));

        let mut builder = valid_builder();
        builder.hit_group(HitGroup::triangles("Wrong", "miss"));
        assert!(matches!(
            builder.build(),
            Err(PipelineBuildError::HitGroupStageMismatch { expected: ShaderStage::ClosestHit, .. })
        ));

        let mut builder = valid_builder();
        builder.hit_group(HitGroup {
            name: "Empty".to_string(),
            kind: HitGroupKind::Triangles,
            closest_hit: None,
            any_hit: None,
            intersection: None,
        });
        assert!(matches!(builder.build(), Err(PipelineBuildError::EmptyHitGroup { .. })));
    }

    /// Hit group names share the export namespace with library entry points
    #[test]
    fn test_duplicate_export_names() {
        let mut builder = valid_builder();
        builder.hit_group(HitGroup::triangles("chs", "chs"));
        assert_eq!(builder.build().unwrap_err(), PipelineBuildError::DuplicateExport { name: "chs".to_string() });
    }

    #[test]
    fn test_association_checks() {
        let mut builder = valid_builder();
        let local = builder.local_root_signature(RootSignatureHandle(9));
        builder.associate(local, ["nope"]);
        assert!(matches!(builder.build(), Err(PipelineBuildError::UnknownAssociationExport { .. })));

        let mut builder = valid_builder();
        builder.associate(SubobjectIndex(0), ["rayGen"]);
        assert_eq!(builder.build().unwrap_err(), PipelineBuildError::InvalidAssociationTarget { index: 0 });
    }

    /// Associating the shader config is accepted and leaves the description unchanged
    #[test]
    fn test_shader_config_association() {
        let mut builder = RayTracingPipelineBuilder::new("configs");
        builder.library(vec![0u8; 16], library_exports());
        builder.hit_group(HitGroup::triangles("HitGroup", "chs"));
        let config = builder.shader_config(16, 8);
        builder.associate(config, ["rayGen", "miss", "HitGroup"]);
        builder.pipeline_config(1);
        builder.global_root_signature(RootSignatureHandle(1));

        let desc = builder.build().unwrap();
        assert_eq!(desc.shader_config.max_payload_size, 16);
        assert!(desc.local_root_signatures.is_empty());
        assert_eq!(desc.local_root_signature_of("rayGen"), None);
    }

    #[test]
    fn test_singleton_subobjects() {
        let mut builder = valid_builder();
        builder.pipeline_config(3);
        assert_eq!(builder.build().unwrap_err(), PipelineBuildError::DuplicateSubobject { kind: "pipeline config" });

        let mut builder = RayTracingPipelineBuilder::new("no config");
        builder.library(vec![0u8; 4], library_exports());
        builder.pipeline_config(1);
        builder.global_root_signature(RootSignatureHandle(1));
        assert_eq!(builder.build().unwrap_err(), PipelineBuildError::MissingSubobject { kind: "shader config" });
    }

    #[test]
    fn test_config_limits() {
        let mut builder = RayTracingPipelineBuilder::new("limits");
        builder.library(vec![0u8; 4], library_exports());
        builder.shader_config(12, 64);
        builder.pipeline_config(1);
        builder.global_root_signature(RootSignatureHandle(1));
        assert_eq!(builder.build().unwrap_err(), PipelineBuildError::InvalidAttributeSize { size: 64 });

        let mut builder = RayTracingPipelineBuilder::new("limits");
        builder.library(vec![0u8; 4], library_exports());
        builder.shader_config(12, 8);
        builder.pipeline_config(0);
        builder.global_root_signature(RootSignatureHandle(1));
        assert_eq!(builder.build().unwrap_err(), PipelineBuildError::InvalidRecursionDepth { depth: 0 });
    }
}
