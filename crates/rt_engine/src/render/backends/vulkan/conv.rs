//! Translation between API types and Vulkan enums

use ash::vk;

use crate::render::api::{
    BuildFlags, ColorSpace, Format, GeometryFlags, GraphicsError, IndexFormat, ResourceState,
};
use crate::render::raytracing::pipeline::ShaderStage;

/// Map a failed `VkResult` from `call` into a [`GraphicsError`]
pub(crate) fn vk_error(call: &'static str) -> impl Fn(vk::Result) -> GraphicsError {
    move |result| match result {
        vk::Result::ERROR_DEVICE_LOST => {
            GraphicsError::DeviceRemoved { reason: format!("{} returned VK_ERROR_DEVICE_LOST", call) }
        }
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            GraphicsError::OutOfMemory { requested: 0 }
        }
        other => GraphicsError::Api { call, code: format!("{:?}", other) },
    }
}

pub(crate) const fn format(format: Format) -> vk::Format {
    match format {
        Format::Unknown => vk::Format::UNDEFINED,
        Format::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        Format::Bgra8UnormSrgb => vk::Format::B8G8R8A8_SRGB,
        Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::Rgba8UnormSrgb => vk::Format::R8G8B8A8_SRGB,
        Format::Rgb10A2Unorm => vk::Format::A2B10G10R10_UNORM_PACK32,
        Format::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        Format::Rgb32Float => vk::Format::R32G32B32_SFLOAT,
        Format::D32Float => vk::Format::D32_SFLOAT,
        Format::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
    }
}

pub(crate) const fn color_space(color_space: ColorSpace) -> vk::ColorSpaceKHR {
    match color_space {
        ColorSpace::SrgbG22P709 => vk::ColorSpaceKHR::SRGB_NONLINEAR,
        ColorSpace::Hdr10G2084P2020 => vk::ColorSpaceKHR::HDR10_ST2084_EXT,
        ColorSpace::LinearG10P709 => vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
    }
}

pub(crate) fn aspect(format: Format) -> vk::ImageAspectFlags {
    match format {
        Format::D32Float => vk::ImageAspectFlags::DEPTH,
        Format::D24UnormS8Uint => vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Layout, access and stages a resource state stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StateAccess {
    pub layout: vk::ImageLayout,
    pub access: vk::AccessFlags,
    pub stages: vk::PipelineStageFlags,
}

pub(crate) fn state_access(state: ResourceState) -> StateAccess {
    let shader_stages = vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR | vk::PipelineStageFlags::COMPUTE_SHADER;
    let (layout, access, stages) = match state {
        ResourceState::Common => (
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
        ResourceState::GenericRead => {
            (vk::ImageLayout::GENERAL, vk::AccessFlags::MEMORY_READ, vk::PipelineStageFlags::ALL_COMMANDS)
        }
        ResourceState::Present => {
            (vk::ImageLayout::PRESENT_SRC_KHR, vk::AccessFlags::empty(), vk::PipelineStageFlags::ALL_COMMANDS)
        }
        ResourceState::RenderTarget => (
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        ResourceState::UnorderedAccess => (
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            shader_stages,
        ),
        ResourceState::CopySource => {
            (vk::ImageLayout::TRANSFER_SRC_OPTIMAL, vk::AccessFlags::TRANSFER_READ, vk::PipelineStageFlags::TRANSFER)
        }
        ResourceState::CopyDest => {
            (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER)
        }
        ResourceState::PixelShaderResource => (
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        ResourceState::NonPixelShaderResource => {
            (vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, vk::AccessFlags::SHADER_READ, shader_stages)
        }
        ResourceState::DepthWrite => (
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
        ResourceState::AccelerationStructure => (
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR | shader_stages,
        ),
    };
    StateAccess { layout, access, stages }
}

pub(crate) fn build_flags(flags: BuildFlags) -> vk::BuildAccelerationStructureFlagsKHR {
    let mut out = vk::BuildAccelerationStructureFlagsKHR::empty();
    for (ours, theirs) in [
        (BuildFlags::ALLOW_UPDATE, vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE),
        (BuildFlags::ALLOW_COMPACTION, vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION),
        (BuildFlags::PREFER_FAST_TRACE, vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE),
        (BuildFlags::PREFER_FAST_BUILD, vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD),
        (BuildFlags::MINIMIZE_MEMORY, vk::BuildAccelerationStructureFlagsKHR::LOW_MEMORY),
    ] {
        if flags.contains(ours) {
            out |= theirs;
        }
    }
    out
}

pub(crate) fn build_mode(flags: BuildFlags) -> vk::BuildAccelerationStructureModeKHR {
    if flags.contains(BuildFlags::PERFORM_UPDATE) {
        vk::BuildAccelerationStructureModeKHR::UPDATE
    } else {
        vk::BuildAccelerationStructureModeKHR::BUILD
    }
}

pub(crate) fn geometry_flags(flags: GeometryFlags) -> vk::GeometryFlagsKHR {
    let mut out = vk::GeometryFlagsKHR::empty();
    if flags.contains(GeometryFlags::OPAQUE) {
        out |= vk::GeometryFlagsKHR::OPAQUE;
    }
    if flags.contains(GeometryFlags::NO_DUPLICATE_ANYHIT_INVOCATION) {
        out |= vk::GeometryFlagsKHR::NO_DUPLICATE_ANY_HIT_INVOCATION;
    }
    out
}

pub(crate) const fn index_type(format: Option<IndexFormat>) -> vk::IndexType {
    match format {
        None => vk::IndexType::NONE_KHR,
        Some(IndexFormat::U16) => vk::IndexType::UINT16,
        Some(IndexFormat::U32) => vk::IndexType::UINT32,
    }
}

pub(crate) const fn shader_stage(stage: ShaderStage) -> vk::ShaderStageFlags {
    match stage {
        ShaderStage::RayGeneration => vk::ShaderStageFlags::RAYGEN_KHR,
        ShaderStage::Miss => vk::ShaderStageFlags::MISS_KHR,
        ShaderStage::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        ShaderStage::AnyHit => vk::ShaderStageFlags::ANY_HIT_KHR,
        ShaderStage::Intersection => vk::ShaderStageFlags::INTERSECTION_KHR,
        ShaderStage::Callable => vk::ShaderStageFlags::CALLABLE_KHR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_lost_mapping() {
        assert!(vk_error("vkQueueSubmit")(vk::Result::ERROR_DEVICE_LOST).is_device_lost());
        let err = vk_error("vkCreateBuffer")(vk::Result::ERROR_INITIALIZATION_FAILED);
        assert!(!err.is_device_lost());
        assert!(err.to_string().starts_with("vkCreateBuffer failed"));
    }

    #[test]
    fn test_state_layouts() {
        assert_eq!(state_access(ResourceState::Present).layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(state_access(ResourceState::UnorderedAccess).layout, vk::ImageLayout::GENERAL);
        assert_eq!(state_access(ResourceState::CopyDest).access, vk::AccessFlags::TRANSFER_WRITE);
    }

    #[test]
    fn test_build_flag_translation() {
        let flags = BuildFlags::ALLOW_UPDATE | BuildFlags::PREFER_FAST_TRACE | BuildFlags::PERFORM_UPDATE;
        assert_eq!(
            build_flags(flags),
            vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE
                | vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
        );
        assert_eq!(build_mode(flags), vk::BuildAccelerationStructureModeKHR::UPDATE);
        assert_eq!(build_mode(BuildFlags::ALLOW_UPDATE), vk::BuildAccelerationStructureModeKHR::BUILD);
    }

    #[test]
    fn test_format_translation() {
        assert_eq!(format(Format::Bgra8Unorm), vk::Format::B8G8R8A8_UNORM);
        assert_eq!(format(Format::Rgb32Float), vk::Format::R32G32B32_SFLOAT);
        assert_eq!(aspect(Format::D32Float), vk::ImageAspectFlags::DEPTH);
    }
}
