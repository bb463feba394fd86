//! Plain data types passed across the backend boundary
//!
//! These mirror the shape of the underlying explicit APIs closely enough that
//! each backend can translate them one-to-one, while staying free of any
//! backend crate types.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::backend::GpuResource;

/// GPU virtual address of a buffer (or buffer offset)
pub type GpuVirtualAddress = u64;

/// Round `value` up to the next multiple of `alignment` (a power of two)
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Unique identifier of a backend resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u64);

/// Opaque root signature handle supplied by the shader/pipeline provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootSignatureHandle(pub u64);

/// Pipeline bind point an opaque pipeline handle belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    /// Rasterization pipeline
    Graphics,
    /// Compute pipeline
    Compute,
    /// Ray tracing state object
    RayTracing,
}

/// Opaque pipeline state handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineHandle {
    /// Backend handle value
    pub raw: u64,
    /// Bind point of the pipeline
    pub kind: PipelineKind,
}

/// Texel and vertex formats used by the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Format {
    /// No format (e.g. "no depth buffer")
    Unknown,
    /// 8-bit BGRA, linear
    Bgra8Unorm,
    /// 8-bit BGRA, sRGB encoded
    Bgra8UnormSrgb,
    /// 8-bit RGBA, linear
    Rgba8Unorm,
    /// 8-bit RGBA, sRGB encoded
    Rgba8UnormSrgb,
    /// 10-bit RGB with 2-bit alpha (HDR10 back buffers)
    Rgb10A2Unorm,
    /// 16-bit float RGBA (scRGB back buffers)
    Rgba16Float,
    /// Three 32-bit floats (vertex positions)
    Rgb32Float,
    /// 32-bit float depth
    D32Float,
    /// 24-bit depth, 8-bit stencil
    D24UnormS8Uint,
}

impl Format {
    /// Strip sRGB encoding; swapchains are created with the linear variant
    pub const fn without_srgb(self) -> Self {
        match self {
            Self::Bgra8UnormSrgb => Self::Bgra8Unorm,
            Self::Rgba8UnormSrgb => Self::Rgba8Unorm,
            other => other,
        }
    }

    /// Size of one element in bytes
    pub const fn bytes_per_element(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::Bgra8Unorm
            | Self::Bgra8UnormSrgb
            | Self::Rgba8Unorm
            | Self::Rgba8UnormSrgb
            | Self::Rgb10A2Unorm
            | Self::D32Float
            | Self::D24UnormS8Uint => 4,
            Self::Rgba16Float => 8,
            Self::Rgb32Float => 12,
        }
    }

    /// Whether this is a depth/stencil format
    pub const fn is_depth(self) -> bool {
        matches!(self, Self::D32Float | Self::D24UnormS8Uint)
    }
}

/// Hardware capability tiers, ordered from lowest to highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FeatureLevel {
    /// Baseline tier
    L11_0,
    /// Baseline plus logic ops and UAVs in every stage
    L11_1,
    /// Bindless resources
    L12_0,
    /// Conservative rasterization, rasterizer ordered views
    L12_1,
    /// Ray tracing tier 1.1, mesh shaders
    L12_2,
}

impl FeatureLevel {
    /// Probe order used when querying the highest supported tier
    pub const PROBE_ORDER: [Self; 5] = [Self::L12_2, Self::L12_1, Self::L12_0, Self::L11_1, Self::L11_0];
}

/// Output color spaces the swapchain can be switched between
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorSpace {
    /// Standard dynamic range, gamma 2.2, Rec.709 primaries
    SrgbG22P709,
    /// HDR10: ST.2084 (PQ) transfer, Rec.2020 primaries
    Hdr10G2084P2020,
    /// Linear scRGB, Rec.709 primaries
    LinearG10P709,
}

/// Integer rectangle in desktop or render-target coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    /// Left edge (inclusive)
    pub left: i32,
    /// Top edge (inclusive)
    pub top: i32,
    /// Right edge (exclusive)
    pub right: i32,
    /// Bottom edge (exclusive)
    pub bottom: i32,
}

impl Rect {
    /// Create a rectangle from its edges
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self { left, top, right, bottom }
    }

    /// Rectangle anchored at the origin
    pub const fn from_size(width: u32, height: u32) -> Self {
        Self::new(0, 0, width as i32, height as i32)
    }

    /// Width in pixels
    pub const fn width(&self) -> i32 {
        self.right - self.left
    }

    /// Height in pixels
    pub const fn height(&self) -> i32 {
        self.bottom - self.top
    }

    /// Area shared with `other`, zero when they do not overlap
    pub fn intersection_area(&self, other: &Self) -> i64 {
        let width = (i64::from(self.right.min(other.right)) - i64::from(self.left.max(other.left))).max(0);
        let height = (i64::from(self.bottom.min(other.bottom)) - i64::from(self.top.max(other.top))).max(0);
        width * height
    }
}

/// Floating point viewport
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    /// Left edge
    pub top_left_x: f32,
    /// Top edge
    pub top_left_y: f32,
    /// Width in pixels
    pub width: f32,
    /// Height in pixels
    pub height: f32,
    /// Near depth
    pub min_depth: f32,
    /// Far depth
    pub max_depth: f32,
}

impl Viewport {
    /// Full-target viewport with the default 0..1 depth range
    pub fn from_size(width: u32, height: u32) -> Self {
        Self {
            top_left_x: 0.0,
            top_left_y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

/// Adapter preference used when enumerating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuPreference {
    /// Discrete / fastest adapter first
    HighPerformance,
    /// Enumeration order of the driver
    Unspecified,
}

/// Description of a graphics adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    /// Enumeration index
    pub index: u32,
    /// Human readable adapter name
    pub name: String,
    /// PCI vendor id
    pub vendor_id: u32,
    /// PCI device id
    pub device_id: u32,
    /// Dedicated video memory in bytes
    pub dedicated_video_memory: u64,
    /// Software rasterizer (WARP, lavapipe, ...)
    pub is_software: bool,
    /// Highest feature level the adapter can create a device at
    pub max_feature_level: FeatureLevel,
}

/// A display output as reported by the instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDesc {
    /// Output name
    pub name: String,
    /// Bounds in desktop coordinates
    pub desktop_coordinates: Rect,
    /// Color space the output is currently driven in
    pub color_space: ColorSpace,
}

/// Memory heap a resource lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapType {
    /// GPU local memory
    Default,
    /// CPU-writable, GPU-readable memory
    Upload,
    /// GPU-writable, CPU-readable memory
    Readback,
}

bitflags! {
    /// Resource creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceFlags: u32 {
        /// Resource may be bound as an unordered access view
        const ALLOW_UNORDERED_ACCESS = 1 << 0;
        /// Texture may be bound as a render target
        const ALLOW_RENDER_TARGET = 1 << 1;
        /// Texture may be bound as a depth/stencil target
        const ALLOW_DEPTH_STENCIL = 1 << 2;
        /// Buffer holds acceleration structure data
        const ACCELERATION_STRUCTURE = 1 << 3;
    }
}

/// Resource usage states tracked through barriers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// No particular usage
    Common,
    /// Readable by any stage (upload heap resources)
    GenericRead,
    /// Ready to be presented
    Present,
    /// Bound as a render target
    RenderTarget,
    /// Read/write from shaders
    UnorderedAccess,
    /// Source of a copy
    CopySource,
    /// Destination of a copy
    CopyDest,
    /// Sampled by pixel shaders
    PixelShaderResource,
    /// Sampled by non-pixel shaders
    NonPixelShaderResource,
    /// Depth writes
    DepthWrite,
    /// Acceleration structure storage
    AccelerationStructure,
}

/// Buffer creation parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    /// Debug name
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Heap to allocate from
    pub heap: HeapType,
    /// Creation flags
    pub flags: ResourceFlags,
    /// State the buffer starts in
    pub initial_state: ResourceState,
}

impl BufferDesc {
    /// CPU-writable buffer in the generic read state
    pub fn upload(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            heap: HeapType::Upload,
            flags: ResourceFlags::empty(),
            initial_state: ResourceState::GenericRead,
        }
    }

    /// Default heap buffer writable through UAVs
    pub fn unordered_access(name: impl Into<String>, size: u64, initial_state: ResourceState) -> Self {
        Self {
            name: name.into(),
            size,
            heap: HeapType::Default,
            flags: ResourceFlags::ALLOW_UNORDERED_ACCESS,
            initial_state,
        }
    }

    /// Acceleration structure result storage
    pub fn acceleration_structure(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            heap: HeapType::Default,
            flags: ResourceFlags::ALLOW_UNORDERED_ACCESS | ResourceFlags::ACCELERATION_STRUCTURE,
            initial_state: ResourceState::AccelerationStructure,
        }
    }
}

/// 2D texture creation parameters
#[derive(Debug, Clone, PartialEq)]
pub struct TextureDesc {
    /// Debug name
    pub name: String,
    /// Width in texels
    pub width: u32,
    /// Height in texels
    pub height: u32,
    /// Texel format
    pub format: Format,
    /// Creation flags
    pub flags: ResourceFlags,
    /// State the texture starts in
    pub initial_state: ResourceState,
    /// Optimized clear color for render targets
    pub clear_color: Option<[f32; 4]>,
    /// Optimized clear depth for depth targets
    pub clear_depth: Option<f32>,
}

/// Shape of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceDimension {
    /// Linear buffer
    Buffer {
        /// Size in bytes
        size: u64,
    },
    /// 2D texture
    Texture2D {
        /// Width in texels
        width: u32,
        /// Height in texels
        height: u32,
        /// Texel format
        format: Format,
    },
}

/// Descriptor heap categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorHeapKind {
    /// Render target views
    RenderTarget,
    /// Depth stencil views
    DepthStencil,
    /// Constant buffer, shader resource and unordered access views
    CbvSrvUav,
}

/// Descriptor heap creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHeapDesc {
    /// Heap category
    pub kind: DescriptorHeapKind,
    /// Number of descriptors
    pub capacity: u32,
    /// Whether shaders can index the heap directly
    pub shader_visible: bool,
}

/// CPU handle of a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CpuDescriptorHandle(pub u64);

/// GPU handle of a descriptor, written into root arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GpuDescriptorHandle(pub u64);

/// View written into a descriptor heap slot
pub enum ViewDesc<'a> {
    /// Render target view of a texture
    RenderTarget(&'a dyn GpuResource),
    /// Depth stencil view of a texture
    DepthStencil(&'a dyn GpuResource),
    /// Shader resource view of a texture or buffer
    ShaderResource(&'a dyn GpuResource),
    /// Unordered access view of a texture or buffer
    UnorderedAccess(&'a dyn GpuResource),
    /// Constant buffer view over a buffer range
    ConstantBuffer {
        /// Start of the constants
        address: GpuVirtualAddress,
        /// Size in bytes (multiple of 256)
        size: u32,
    },
    /// Top-level acceleration structure view
    AccelerationStructure(&'a dyn GpuResource),
}

/// A resource barrier recorded into a command list
pub enum ResourceBarrier<'a> {
    /// Usage state transition
    Transition {
        /// Transitioned resource
        resource: &'a dyn GpuResource,
        /// State before the barrier
        before: ResourceState,
        /// State after the barrier
        after: ResourceState,
    },
    /// Orders all UAV accesses of a resource before and after the barrier
    Uav {
        /// Resource whose UAV accesses are ordered
        resource: &'a dyn GpuResource,
    },
}

impl<'a> ResourceBarrier<'a> {
    /// Transition helper
    pub fn transition(resource: &'a dyn GpuResource, before: ResourceState, after: ResourceState) -> Self {
        Self::Transition { resource, before, after }
    }

    /// UAV barrier helper
    pub fn uav(resource: &'a dyn GpuResource) -> Self {
        Self::Uav { resource }
    }
}

bitflags! {
    /// Acceleration structure build flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BuildFlags: u32 {
        /// Structure may later be refit in place
        const ALLOW_UPDATE = 1 << 0;
        /// Structure may be compacted
        const ALLOW_COMPACTION = 1 << 1;
        /// Optimize for traversal speed
        const PREFER_FAST_TRACE = 1 << 2;
        /// Optimize for build speed
        const PREFER_FAST_BUILD = 1 << 3;
        /// Minimize scratch and result memory
        const MINIMIZE_MEMORY = 1 << 4;
        /// Refit an existing structure instead of building from scratch
        const PERFORM_UPDATE = 1 << 5;
    }
}

bitflags! {
    /// Per-geometry flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GeometryFlags: u32 {
        /// Any-hit shaders are never invoked
        const OPAQUE = 1 << 0;
        /// Any-hit shaders run at most once per primitive
        const NO_DUPLICATE_ANYHIT_INVOCATION = 1 << 1;
    }
}

/// Index element format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    /// 16-bit indices
    U16,
    /// 32-bit indices
    U32,
}

impl IndexFormat {
    /// Size of one index in bytes
    pub const fn size(self) -> u64 {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }
}

/// Index buffer bound to a triangle geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBufferDesc {
    /// Start of the indices
    pub address: GpuVirtualAddress,
    /// Index format
    pub format: IndexFormat,
    /// Number of indices
    pub count: u32,
}

/// Triangle geometry of a bottom-level structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryDesc {
    /// Start of the vertex positions
    pub vertex_buffer: GpuVirtualAddress,
    /// Distance between consecutive positions in bytes
    pub vertex_stride: u64,
    /// Position format (three floats)
    pub vertex_format: Format,
    /// Number of vertices
    pub vertex_count: u32,
    /// Optional index buffer; without one every three vertices form a triangle
    pub index_buffer: Option<IndexBufferDesc>,
    /// Geometry flags
    pub flags: GeometryFlags,
}

impl GeometryDesc {
    /// Opaque, non-indexed triangle list with tightly packed positions
    pub fn opaque_triangles(vertex_buffer: GpuVirtualAddress, vertex_count: u32) -> Self {
        Self {
            vertex_buffer,
            vertex_stride: u64::from(Format::Rgb32Float.bytes_per_element()),
            vertex_format: Format::Rgb32Float,
            vertex_count,
            index_buffer: None,
            flags: GeometryFlags::OPAQUE,
        }
    }

    /// Number of triangles described
    pub fn triangle_count(&self) -> u32 {
        self.index_buffer.map_or(self.vertex_count, |indices| indices.count) / 3
    }
}

/// Inputs of an acceleration structure build or prebuild query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccelerationStructureInputs {
    /// Triangle geometry
    BottomLevel {
        /// Build flags
        flags: BuildFlags,
        /// Geometries, one hit-group slot each
        geometries: Vec<GeometryDesc>,
    },
    /// Instances of bottom-level structures
    TopLevel {
        /// Build flags
        flags: BuildFlags,
        /// Number of 64-byte instance records
        instance_count: u32,
        /// Start of the instance records (ignored by prebuild queries)
        instance_descs: GpuVirtualAddress,
    },
}

impl AccelerationStructureInputs {
    /// Build flags of either level
    pub const fn flags(&self) -> BuildFlags {
        match self {
            Self::BottomLevel { flags, .. } | Self::TopLevel { flags, .. } => *flags,
        }
    }

    /// Whether these inputs describe a top-level structure
    pub const fn is_top_level(&self) -> bool {
        matches!(self, Self::TopLevel { .. })
    }
}

/// Memory requirements of an acceleration structure build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrebuildInfo {
    /// Upper bound of the result size
    pub result_data_max_size: u64,
    /// Scratch size of a full build
    pub scratch_data_size: u64,
    /// Scratch size of a refit
    pub update_scratch_data_size: u64,
}

/// Acceleration structure build command
pub struct BuildAccelerationStructureDesc<'a> {
    /// Build inputs
    pub inputs: &'a AccelerationStructureInputs,
    /// Result buffer
    pub dest: &'a dyn GpuResource,
    /// Previous structure for `PERFORM_UPDATE` builds
    pub source: Option<&'a dyn GpuResource>,
    /// Scratch buffer
    pub scratch: &'a dyn GpuResource,
}

/// Contiguous GPU address range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GpuAddressRange {
    /// Start address
    pub start: GpuVirtualAddress,
    /// Size in bytes
    pub size: u64,
}

/// Strided GPU address range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GpuAddressRangeAndStride {
    /// Start address
    pub start: GpuVirtualAddress,
    /// Size in bytes
    pub size: u64,
    /// Record stride in bytes
    pub stride: u64,
}

/// Ray dispatch parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchRaysDesc {
    /// The single ray generation record
    pub ray_generation: GpuAddressRange,
    /// Miss zone
    pub miss: GpuAddressRangeAndStride,
    /// Hit group zone
    pub hit_group: GpuAddressRangeAndStride,
    /// Callable zone (unused by the core)
    pub callable: GpuAddressRangeAndStride,
    /// Grid width
    pub width: u32,
    /// Grid height
    pub height: u32,
    /// Grid depth
    pub depth: u32,
}

/// Device limits governing shader table layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderTableProperties {
    /// Size of a shader identifier in bytes
    pub identifier_size: u32,
    /// Required alignment of each record
    pub record_alignment: u32,
    /// Required alignment of the table start
    pub table_alignment: u32,
}

impl Default for ShaderTableProperties {
    fn default() -> Self {
        Self { identifier_size: 32, record_alignment: 32, table_alignment: 64 }
    }
}

/// Opaque shader identifier blob returned by a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderIdentifier(pub Vec<u8>);

impl ShaderIdentifier {
    /// Raw identifier bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Swapchain creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainDesc {
    /// Back buffer width
    pub width: u32,
    /// Back buffer height
    pub height: u32,
    /// Back buffer format (never sRGB; views may add the encoding)
    pub format: Format,
    /// Number of back buffers
    pub buffer_count: u32,
    /// Created with the allow-tearing flag
    pub allow_tearing: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 32), 0);
        assert_eq!(align_up(40, 32), 64);
        assert_eq!(align_up(64, 32), 64);
        assert_eq!(align_up(65, 256), 256);
    }

    /// Disjoint rectangles have zero overlap rather than a negative one
    #[test]
    fn test_rect_intersection_area() {
        let window = Rect::new(100, 100, 900, 700);
        assert_eq!(window.intersection_area(&Rect::new(0, 0, 1920, 1080)), 800 * 600);
        assert_eq!(window.intersection_area(&Rect::new(500, 400, 2000, 2000)), 400 * 300);
        assert_eq!(window.intersection_area(&Rect::new(1920, 0, 3840, 1080)), 0);
    }

    #[test]
    fn test_feature_level_ordering() {
        assert!(FeatureLevel::L12_2 > FeatureLevel::L11_0);
        assert_eq!(FeatureLevel::PROBE_ORDER[0], FeatureLevel::L12_2);
        assert_eq!(*FeatureLevel::PROBE_ORDER.last().unwrap(), FeatureLevel::L11_0);
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(Format::Bgra8UnormSrgb.without_srgb(), Format::Bgra8Unorm);
        assert_eq!(Format::Rgba16Float.without_srgb(), Format::Rgba16Float);
        assert_eq!(Format::Rgb32Float.bytes_per_element(), 12);
        assert!(Format::D32Float.is_depth());
    }

    #[test]
    fn test_triangle_count() {
        let mut geometry = GeometryDesc::opaque_triangles(0x1000, 6);
        assert_eq!(geometry.triangle_count(), 2);
        geometry.index_buffer = Some(IndexBufferDesc { address: 0x2000, format: IndexFormat::U16, count: 9 });
        assert_eq!(geometry.triangle_count(), 3);
    }
}
