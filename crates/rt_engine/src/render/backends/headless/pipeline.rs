//! Ray tracing pipelines and dispatch validation

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::render::api::{
    DispatchRaysDesc, GpuAddressRangeAndStride, PipelineHandle, PipelineKind, RayTracingPipeline, ShaderIdentifier,
    ShaderTableProperties,
};
use crate::render::raytracing::pipeline::{ExportKind, RayTracingPipelineDesc, ShaderStage};

use super::device::DeviceShared;

pub(crate) struct PipelineInner {
    pub handle: PipelineHandle,
    pub name: String,
    identifiers: HashMap<String, (ExportKind, ShaderIdentifier)>,
}

impl PipelineInner {
    fn export_of(&self, identifier: &[u8]) -> Option<(&str, ExportKind)> {
        self.identifiers
            .iter()
            .find(|(_, (_, known))| known.as_bytes() == identifier)
            .map(|(name, (kind, _))| (name.as_str(), *kind))
    }
}

/// Compiled pipeline of the headless device
pub struct HeadlessPipeline {
    pub(crate) inner: Arc<PipelineInner>,
}

impl HeadlessPipeline {
    pub(crate) fn new(device: &DeviceShared, desc: &RayTracingPipelineDesc) -> Self {
        let raw = device.next_object_id();
        let size = device.shader_table_properties.identifier_size as usize;
        let identifiers = desc
            .identifier_exports()
            .filter_map(|name| {
                let kind = desc.export_kind(name)?;
                let identifier = derive_identifier(device.serial, raw, name, size);
                Some((name.to_string(), (kind, identifier)))
            })
            .collect::<HashMap<_, _>>();

        log::debug!("Created pipeline '{}' with {} shader identifiers", desc.name, identifiers.len());
        Self {
            inner: Arc::new(PipelineInner {
                handle: PipelineHandle { raw, kind: PipelineKind::RayTracing },
                name: desc.name.clone(),
                identifiers,
            }),
        }
    }
}

impl RayTracingPipeline for HeadlessPipeline {
    fn handle(&self) -> PipelineHandle {
        self.inner.handle
    }

    fn shader_identifier(&self, export: &str) -> Option<ShaderIdentifier> {
        self.inner.identifiers.get(export).map(|(_, identifier)| identifier.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// FNV-1a over the device, pipeline and export, stretched to `size` bytes
fn derive_identifier(device: u64, pipeline: u64, export: &str, size: usize) -> ShaderIdentifier {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut seed = OFFSET;
    for byte in device.to_le_bytes().iter().chain(&pipeline.to_le_bytes()).chain(export.as_bytes()) {
        seed ^= u64::from(*byte);
        seed = seed.wrapping_mul(PRIME);
    }

    let mut bytes = Vec::with_capacity(size);
    let mut block = seed;
    while bytes.len() < size {
        block = (block ^ bytes.len() as u64).wrapping_mul(PRIME);
        bytes.extend_from_slice(&block.to_le_bytes());
    }
    bytes.truncate(size);
    ShaderIdentifier(bytes)
}

/// Check a dispatch against the shader table bytes in device memory
pub(crate) fn validate_dispatch(
    device: &DeviceShared,
    pipeline: &PipelineInner,
    desc: &DispatchRaysDesc,
) -> Vec<String> {
    let props = device.shader_table_properties;
    let mut errors = Vec::new();

    if desc.width == 0 || desc.height == 0 || desc.depth == 0 {
        errors.push(format!("empty dispatch grid {}x{}x{}", desc.width, desc.height, desc.depth));
    }

    let ray_gen = desc.ray_generation;
    if ray_gen.start % u64::from(props.table_alignment) != 0 {
        errors.push(format!("ray generation record at {:#x} is not table aligned", ray_gen.start));
    }
    if ray_gen.size < u64::from(props.identifier_size) {
        errors.push(format!("ray generation record of {} bytes is smaller than an identifier", ray_gen.size));
    } else {
        check_record(device, pipeline, "ray generation", ray_gen.start, &is_ray_generation, &mut errors);
    }

    check_zone(device, pipeline, &props, "miss", &desc.miss, &is_miss, &mut errors);
    check_zone(device, pipeline, &props, "hit group", &desc.hit_group, &is_hit_group, &mut errors);

    for error in &mut errors {
        *error = format!("pipeline '{}': {}", pipeline.name, error);
    }
    errors
}

fn is_ray_generation(kind: ExportKind) -> bool {
    kind == ExportKind::Shader(ShaderStage::RayGeneration)
}

fn is_miss(kind: ExportKind) -> bool {
    kind == ExportKind::Shader(ShaderStage::Miss)
}

fn is_hit_group(kind: ExportKind) -> bool {
    kind == ExportKind::HitGroup
}

fn check_zone(
    device: &DeviceShared,
    pipeline: &PipelineInner,
    props: &ShaderTableProperties,
    zone: &str,
    range: &GpuAddressRangeAndStride,
    expected: &dyn Fn(ExportKind) -> bool,
    errors: &mut Vec<String>,
) {
    if range.size == 0 {
        return;
    }
    if range.start % u64::from(props.table_alignment) != 0 {
        errors.push(format!("{} zone at {:#x} is not table aligned", zone, range.start));
    }
    if range.stride < u64::from(props.identifier_size) || range.stride % u64::from(props.record_alignment) != 0 {
        errors.push(format!("{} zone stride {} is invalid", zone, range.stride));
        return;
    }
    let records = range.size / range.stride;
    for record in 0..records {
        check_record(device, pipeline, zone, range.start + record * range.stride, expected, errors);
    }
}

fn check_record(
    device: &DeviceShared,
    pipeline: &PipelineInner,
    zone: &str,
    address: u64,
    expected: &dyn Fn(ExportKind) -> bool,
    errors: &mut Vec<String>,
) {
    let size = u64::from(device.shader_table_properties.identifier_size);
    let Some(identifier) = device.read_memory(address, size) else {
        errors.push(format!("{} record at {:#x} is not backed by a live buffer", zone, address));
        return;
    };
    match pipeline.export_of(&identifier) {
        Some((_, kind)) if expected(kind) => {}
        Some((name, _)) => errors.push(format!("{} record at {:#x} holds the identifier of '{}'", zone, address, name)),
        None => errors.push(format!("{} record at {:#x} holds an unknown identifier", zone, address)),
    }
}
