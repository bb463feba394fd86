//! Shader table layout and record writing
//!
//! All records share one stride so the three zones can be addressed with a
//! single index each:
//!
//! ```text
//! offset 0                       ray generation record
//! offset 1 * stride              miss records       (miss_count)
//! offset (1 + miss_count)*stride hit group records  (hit_count)
//! ```
//!
//! A record is the shader identifier followed by the local root arguments.
//! 8-byte arguments (descriptor tables, GPU addresses) sit at 8-byte aligned
//! offsets.

use std::sync::Arc;

use crate::render::api::{
    align_up, BufferDesc, DispatchRaysDesc, GpuAddressRange, GpuAddressRangeAndStride, GpuDescriptorHandle,
    GpuResource, GpuVirtualAddress, GraphicsError, GraphicsResult, ShaderIdentifier, ShaderTableProperties,
};
use crate::render::device::SwapchainManager;

use super::binding_layout::ShaderBindingLayout;

/// The three record zones of a shader table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderTableZone {
    /// The single ray generation record
    RayGeneration,
    /// Miss records, indexed by the miss index passed to `TraceRay`
    Miss,
    /// Hit group records, indexed per [`ShaderBindingLayout`]
    HitGroup,
}

/// Record placement of a shader table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderTableLayout {
    props: ShaderTableProperties,
    stride: u64,
    miss_count: u32,
    hit_count: u32,
    max_root_arg_bytes: u32,
}

impl ShaderTableLayout {
    /// Record stride for identifiers followed by `max_root_arg_bytes` of arguments
    pub fn compute_stride(props: &ShaderTableProperties, max_root_arg_bytes: u32) -> u64 {
        align_up(
            u64::from(props.identifier_size) + u64::from(max_root_arg_bytes),
            u64::from(props.record_alignment),
        )
    }

    /// Layout with one ray generation record, `miss_count` miss and `hit_count` hit group records
    ///
    /// Fails when a zone would start off the table alignment; raise
    /// `max_root_arg_bytes` to widen the stride in that case.
    pub fn new(
        props: ShaderTableProperties,
        miss_count: u32,
        hit_count: u32,
        max_root_arg_bytes: u32,
    ) -> GraphicsResult<Self> {
        let layout = Self {
            props,
            stride: Self::compute_stride(&props, max_root_arg_bytes),
            miss_count,
            hit_count,
            max_root_arg_bytes,
        };

        let table_alignment = u64::from(props.table_alignment);
        for zone in [ShaderTableZone::Miss, ShaderTableZone::HitGroup] {
            let offset = layout.zone_offset(zone);
            if layout.zone_count(zone) > 0 && offset % table_alignment != 0 {
                return Err(GraphicsError::OutOfRange {
                    reason: format!(
                        "{:?} zone at offset {} breaks the {} byte table alignment (stride {})",
                        zone, offset, table_alignment, layout.stride
                    ),
                });
            }
        }
        Ok(layout)
    }

    /// Layout whose hit zone holds every record `binding` can address
    pub fn for_binding_layout(
        props: ShaderTableProperties,
        miss_count: u32,
        binding: &ShaderBindingLayout,
        max_root_arg_bytes: u32,
    ) -> GraphicsResult<Self> {
        Self::new(props, miss_count, binding.hit_record_count(), max_root_arg_bytes)
    }

    /// Device properties the layout was computed for
    pub fn properties(&self) -> ShaderTableProperties {
        self.props
    }

    /// Distance between consecutive records
    pub fn stride(&self) -> u64 {
        self.stride
    }

    /// Local root argument bytes available per record
    pub fn max_root_arg_bytes(&self) -> u32 {
        self.max_root_arg_bytes
    }

    /// Number of records in `zone`
    pub fn zone_count(&self, zone: ShaderTableZone) -> u32 {
        match zone {
            ShaderTableZone::RayGeneration => 1,
            ShaderTableZone::Miss => self.miss_count,
            ShaderTableZone::HitGroup => self.hit_count,
        }
    }

    /// Byte offset of the first record of `zone`
    pub fn zone_offset(&self, zone: ShaderTableZone) -> u64 {
        let first_record = match zone {
            ShaderTableZone::RayGeneration => 0,
            ShaderTableZone::Miss => 1,
            ShaderTableZone::HitGroup => 1 + u64::from(self.miss_count),
        };
        first_record * self.stride
    }

    /// Total number of records
    pub fn record_count(&self) -> u64 {
        1 + u64::from(self.miss_count) + u64::from(self.hit_count)
    }

    /// Byte offset of record `index` of `zone`
    pub fn record_offset(&self, zone: ShaderTableZone, index: u32) -> GraphicsResult<u64> {
        let count = self.zone_count(zone);
        if index >= count {
            return Err(GraphicsError::OutOfRange { reason: format!("{:?} record {} of {}", zone, index, count) });
        }
        Ok(self.zone_offset(zone) + u64::from(index) * self.stride)
    }

    /// Bytes covered by records
    pub fn size_in_bytes(&self) -> u64 {
        self.record_count() * self.stride
    }

    /// Buffer size, rounded up to the table alignment
    pub fn buffer_size(&self) -> u64 {
        align_up(self.size_in_bytes(), u64::from(self.props.table_alignment))
    }

    /// Dispatch covering a `width` x `height` grid with the table at `table_address`
    pub fn dispatch_rays_desc(&self, table_address: GpuVirtualAddress, width: u32, height: u32) -> DispatchRaysDesc {
        let zone = |zone: ShaderTableZone| GpuAddressRangeAndStride {
            start: table_address + self.zone_offset(zone),
            size: u64::from(self.zone_count(zone)) * self.stride,
            stride: self.stride,
        };
        DispatchRaysDesc {
            ray_generation: GpuAddressRange { start: table_address, size: self.stride },
            miss: zone(ShaderTableZone::Miss),
            hit_group: zone(ShaderTableZone::HitGroup),
            callable: GpuAddressRangeAndStride::default(),
            width,
            height,
            depth: 1,
        }
    }
}

/// Local root argument written after a shader identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootArgument {
    /// Descriptor table start (8 bytes)
    DescriptorTable(GpuDescriptorHandle),
    /// Root CBV/SRV/UAV address (8 bytes)
    Address(GpuVirtualAddress),
    /// 32-bit root constant (4 bytes)
    Constant(u32),
}

impl RootArgument {
    fn size(self) -> usize {
        match self {
            Self::DescriptorTable(_) | Self::Address(_) => 8,
            Self::Constant(_) => 4,
        }
    }

    fn write(self, out: &mut [u8]) {
        match self {
            Self::DescriptorTable(handle) => out.copy_from_slice(&handle.0.to_le_bytes()),
            Self::Address(address) => out.copy_from_slice(&address.to_le_bytes()),
            Self::Constant(value) => out.copy_from_slice(&value.to_le_bytes()),
        }
    }
}

/// CPU image of a shader table
pub struct ShaderTableWriter {
    layout: ShaderTableLayout,
    bytes: Vec<u8>,
}

impl ShaderTableWriter {
    /// Zeroed table for `layout`
    pub fn new(layout: ShaderTableLayout) -> GraphicsResult<Self> {
        let size = layout.buffer_size();
        let size = usize::try_from(size).map_err(|_| GraphicsError::OutOfMemory { requested: size })?;
        Ok(Self { layout, bytes: vec![0; size] })
    }

    /// Layout being written
    pub fn layout(&self) -> &ShaderTableLayout {
        &self.layout
    }

    /// Table contents
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Writer for record `index` of `zone`
    pub fn record(&mut self, zone: ShaderTableZone, index: u32) -> GraphicsResult<RecordWriter<'_>> {
        let offset = self.layout.record_offset(zone, index)? as usize;
        let stride = self.layout.stride as usize;
        let identifier_size = self.layout.props.identifier_size as usize;
        let argument_end = identifier_size + self.layout.max_root_arg_bytes as usize;

        let record = &mut self.bytes[offset..offset + stride];
        record.fill(0);
        Ok(RecordWriter { record, zone, index, identifier_size, cursor: identifier_size, argument_end })
    }
}

/// Writes the identifier and root arguments of one record
pub struct RecordWriter<'a> {
    record: &'a mut [u8],
    zone: ShaderTableZone,
    index: u32,
    identifier_size: usize,
    cursor: usize,
    argument_end: usize,
}

impl RecordWriter<'_> {
    /// Copy the shader identifier into the head of the record
    pub fn identifier(&mut self, identifier: &ShaderIdentifier) -> GraphicsResult<&mut Self> {
        let bytes = identifier.as_bytes();
        if bytes.len() != self.identifier_size {
            return Err(GraphicsError::invalid(format!(
                "{}-byte shader identifier for {}-byte identifier slots",
                bytes.len(),
                self.identifier_size
            )));
        }
        self.record[..self.identifier_size].copy_from_slice(bytes);
        Ok(self)
    }

    /// Append a root argument at the next offset aligned to its size
    pub fn argument(&mut self, argument: RootArgument) -> GraphicsResult<&mut Self> {
        let size = argument.size();
        let start = self.cursor.next_multiple_of(size);
        let end = start + size;
        if end > self.argument_end {
            return Err(GraphicsError::invalid(format!(
                "{:?} record {} overflows its {} bytes of root arguments",
                self.zone,
                self.index,
                self.argument_end - self.identifier_size
            )));
        }
        argument.write(&mut self.record[start..end]);
        self.cursor = end;
        Ok(self)
    }

    /// Root argument bytes written so far, including alignment padding
    pub fn argument_bytes(&self) -> usize {
        self.cursor - self.identifier_size
    }
}

/// Shader table uploaded to GPU memory
pub struct ShaderTable {
    buffer: Arc<dyn GpuResource>,
    layout: ShaderTableLayout,
}

impl ShaderTable {
    /// Copy `writer` into a new upload-heap buffer
    pub fn upload(manager: &SwapchainManager, writer: &ShaderTableWriter) -> GraphicsResult<Self> {
        let layout = *writer.layout();
        let buffer = manager.device()?.create_buffer(&BufferDesc::upload("Shader table", layout.buffer_size()))?;
        buffer.write_bytes(0, writer.bytes())?;
        log::debug!(
            "Uploaded shader table: {} records of {} bytes at {:#x}",
            layout.record_count(),
            layout.stride(),
            buffer.gpu_virtual_address()
        );
        Ok(Self { buffer, layout })
    }

    /// Backing buffer
    pub fn buffer(&self) -> &Arc<dyn GpuResource> {
        &self.buffer
    }

    /// Layout of the uploaded records
    pub fn layout(&self) -> &ShaderTableLayout {
        &self.layout
    }

    /// Dispatch covering a `width` x `height` grid
    pub fn dispatch_rays_desc(&self, width: u32, height: u32) -> DispatchRaysDesc {
        self.layout.dispatch_rays_desc(self.buffer.gpu_virtual_address(), width, height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props() -> ShaderTableProperties {
        ShaderTableProperties::default()
    }

    #[test]
    fn test_compute_stride() {
        assert_eq!(ShaderTableLayout::compute_stride(&props(), 0), 32);
        assert_eq!(ShaderTableLayout::compute_stride(&props(), 8), 64);
        assert_eq!(ShaderTableLayout::compute_stride(&props(), 32), 64);
        assert_eq!(ShaderTableLayout::compute_stride(&props(), 33), 96);
    }

    /// Every record sits at a multiple of the stride, zones back to back
    #[test]
    fn test_record_offsets_are_stride_multiples() {
        let layout = ShaderTableLayout::new(props(), 2, 6, 8).unwrap();
        let mut expected = 0;
        for zone in [ShaderTableZone::RayGeneration, ShaderTableZone::Miss, ShaderTableZone::HitGroup] {
            for index in 0..layout.zone_count(zone) {
                assert_eq!(layout.record_offset(zone, index).unwrap(), expected * layout.stride());
                expected += 1;
            }
        }
        assert_eq!(layout.record_count(), 9);
        assert_eq!(layout.size_in_bytes(), 9 * 64);
        assert!(layout.record_offset(ShaderTableZone::Miss, 2).is_err());
    }

    #[test]
    fn test_misaligned_zones_rejected() {
        assert!(ShaderTableLayout::new(props(), 1, 1, 0).is_err());
        assert!(ShaderTableLayout::new(props(), 0, 0, 0).is_ok());
    }

    #[test]
    fn test_buffer_size_rounds_to_table_alignment() {
        let props = ShaderTableProperties { identifier_size: 32, record_alignment: 32, table_alignment: 64 };
        let layout = ShaderTableLayout::new(props, 0, 0, 16).unwrap();
        assert_eq!(layout.size_in_bytes(), 64);
        let layout = ShaderTableLayout::new(props, 1, 2, 32).unwrap();
        assert_eq!(layout.buffer_size(), 4 * 64);
    }

    #[test]
    fn test_dispatch_desc_zones() {
        let binding = ShaderBindingLayout::with_instances(2, &[1, 1, 1]).unwrap();
        let layout = ShaderTableLayout::for_binding_layout(props(), 2, &binding, 8).unwrap();
        let desc = layout.dispatch_rays_desc(0x1_0000, 1280, 720);

        assert_eq!(desc.ray_generation, GpuAddressRange { start: 0x1_0000, size: 64 });
        assert_eq!(desc.miss, GpuAddressRangeAndStride { start: 0x1_0000 + 64, size: 128, stride: 64 });
        assert_eq!(desc.hit_group, GpuAddressRangeAndStride { start: 0x1_0000 + 192, size: 6 * 64, stride: 64 });
        assert_eq!((desc.width, desc.height, desc.depth), (1280, 720, 1));
    }

    /// Constants pack at 4 bytes, 8-byte arguments skip to the next 8-byte boundary
    #[test]
    fn test_record_writer_alignment() {
        let layout = ShaderTableLayout::new(props(), 1, 1, 32).unwrap();
        let mut writer = ShaderTableWriter::new(layout).unwrap();
        let identifier = ShaderIdentifier(vec![0xAB; 32]);

        let mut record = writer.record(ShaderTableZone::HitGroup, 0).unwrap();
        record
            .identifier(&identifier)
            .unwrap()
            .argument(RootArgument::Constant(7))
            .unwrap()
            .argument(RootArgument::Address(0xDEAD_BEEF))
            .unwrap();
        assert_eq!(record.argument_bytes(), 16);

        let base = layout.record_offset(ShaderTableZone::HitGroup, 0).unwrap() as usize;
        let bytes = writer.bytes();
        assert_eq!(&bytes[base..base + 32], &[0xAB; 32]);
        assert_eq!(&bytes[base + 32..base + 36], &7u32.to_le_bytes());
        assert_eq!(&bytes[base + 36..base + 40], &[0; 4]);
        assert_eq!(&bytes[base + 40..base + 48], &0xDEAD_BEEFu64.to_le_bytes());
    }

    #[test]
    fn test_record_writer_budget() {
        let layout = ShaderTableLayout::new(props(), 1, 1, 32).unwrap();
        let mut writer = ShaderTableWriter::new(layout).unwrap();
        let mut record = writer.record(ShaderTableZone::RayGeneration, 0).unwrap();
        for _ in 0..4 {
            record.argument(RootArgument::DescriptorTable(GpuDescriptorHandle(1))).unwrap();
        }
        let overflow = record.argument(RootArgument::Constant(1));
        assert!(matches!(overflow, Err(GraphicsError::InvalidOperation { .. })));

        let mut record = writer.record(ShaderTableZone::Miss, 0).unwrap();
        assert!(record.identifier(&ShaderIdentifier(vec![0; 16])).is_err());
    }
}
