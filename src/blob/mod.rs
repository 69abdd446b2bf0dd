//! Relocatable network blob.
//!
//! Layout, all offsets relative to the blob start:
//!
//! ```text
//! NetHeader                  24 bytes
//! layer offset table         u32 per layer, header + table padded to 32
//! layer 0..n                 192-byte LayerHeader + 32-byte records, padded to 32
//! execution list             u32 layer index per executed layer
//! ```

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};
use crate::ir::wire::{self, RECORD_SIZE};
use crate::ir::{Activation, Layer, LayerKind, LayerParams, MmImage, PadConfig};

pub const NET_MAGIC: u32 = 0xf3f6_7a81;
pub const NET_HEADER_SIZE: usize = 24;
pub const LAYER_HEADER_SIZE: usize = 192;

/// A network: layers in blob order plus the order they execute in.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Net {
    pub layers: Vec<Layer>,
    pub exec_list: Vec<u32>,
}

impl Net {
    /// Parse a JSON network description.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

// ─── Headers ───────────────────────────────────────────────────────

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct NetHeader {
    magic: u32,
    blob_size: u32,
    reserved: u32,
    exec_count: u32,
    exec_offset: u32,
    layer_count: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct LayerHeader {
    in_channels: u16,
    out_channels: u16,
    number: u16,
    kind: u8,
    _dummy1: u8,
    stride: u16,
    kernel_length: u16,
    conv_groups: u32,
    dilation_rate_w: u16,
    dilation_rate_h: u16,
    seg_out_w: u16,
    seg_out_h: u16,
    seg_in_w: u16,
    seg_in_h: u16,
    conv_result_shift_right: i16,
    relu6_shift_left: i16,
    alpha_mulh_shift_right: i16,
    bias_shift_right: i16,
    store_shift_right: i16,
    elwise1_left_shift: i16,
    elwise0_left_shift: i16,
    elwise1_right_shift: i16,
    elwise0_right_shift: i16,
    pool_stride: u16,
    activation: u8,
    _dummy2: u8,
    alpha: u16,
    pad: [i32; 5],
    input: [u32; 5],
    output: [u32; 5],
    axis: u16,
    dynamic_shape: u16,
    block_size: u16,
    last_layer_using_input: u8,
    first_layer_producing_output: u8,
    pool_size_w: u16,
    pool_size_h: u16,
    pool_size_ch: u16,
    pool_stride_w: u16,
    pool_stride_h: u16,
    pool_stride_ch: u16,
    pool_avg_shiftr: u16,
    deform_static_offsets: u16,
    deform_max_offset_x: u16,
    deform_max_offset_y: u16,
    parallel_out: u16,
    parallel_in: u16,
    subpixel_pad: [i32; 5],
    input_pixels_w: u16,
    input_pixels_h: u16,
    _align_filler: [u8; 20],
    segment_count: i32,
}

const _: () = {
    assert!(std::mem::size_of::<NetHeader>() == NET_HEADER_SIZE);
    assert!(std::mem::size_of::<LayerHeader>() == LAYER_HEADER_SIZE);
};

fn pad_to_raw(p: &PadConfig) -> [i32; 5] {
    [p.top, p.left, p.bottom, p.right, p.value]
}

fn pad_from_raw(r: [i32; 5]) -> PadConfig {
    PadConfig {
        top: r[0],
        left: r[1],
        bottom: r[2],
        right: r[3],
        value: r[4],
    }
}

fn image_to_raw(m: &MmImage) -> [u32; 5] {
    [m.mm_base, m.x, m.y, m.y_stride, m.channels]
}

fn image_from_raw(r: [u32; 5]) -> MmImage {
    MmImage {
        mm_base: r[0],
        x: r[1],
        y: r[2],
        y_stride: r[3],
        channels: r[4],
    }
}

impl LayerHeader {
    fn new(p: &LayerParams, segment_count: usize) -> Result<Self> {
        let segment_count = i32::try_from(segment_count).map_err(|_| StreamError::FieldOverflow {
            field: "command_segments_count",
            value: segment_count as i64,
        })?;
        Ok(Self {
            in_channels: p.in_channels,
            out_channels: p.out_channels,
            number: p.number,
            kind: p.kind.code(),
            _dummy1: 0,
            stride: p.stride,
            kernel_length: p.kernel_length,
            conv_groups: p.conv_groups,
            dilation_rate_w: p.dilation_rate_w,
            dilation_rate_h: p.dilation_rate_h,
            seg_out_w: p.seg_out_w,
            seg_out_h: p.seg_out_h,
            seg_in_w: p.seg_in_w,
            seg_in_h: p.seg_in_h,
            conv_result_shift_right: p.conv_result_shift_right,
            relu6_shift_left: p.relu6_shift_left,
            alpha_mulh_shift_right: p.alpha_mulh_shift_right,
            bias_shift_right: p.bias_shift_right,
            store_shift_right: p.store_shift_right,
            elwise1_left_shift: p.elwise1_left_shift,
            elwise0_left_shift: p.elwise0_left_shift,
            elwise1_right_shift: p.elwise1_right_shift,
            elwise0_right_shift: p.elwise0_right_shift,
            pool_stride: p.pool_stride,
            activation: p.activation.code(),
            _dummy2: 0,
            alpha: p.alpha,
            pad: pad_to_raw(&p.pad),
            input: image_to_raw(&p.input),
            output: image_to_raw(&p.output),
            axis: p.axis,
            dynamic_shape: p.dynamic_shape,
            block_size: p.block_size,
            last_layer_using_input: p.last_layer_using_input as u8,
            first_layer_producing_output: p.first_layer_producing_output as u8,
            pool_size_w: p.pool_size_w,
            pool_size_h: p.pool_size_h,
            pool_size_ch: p.pool_size_ch,
            pool_stride_w: p.pool_stride_w,
            pool_stride_h: p.pool_stride_h,
            pool_stride_ch: p.pool_stride_ch,
            pool_avg_shiftr: p.pool_avg_shiftr,
            deform_static_offsets: p.deform_static_offsets,
            deform_max_offset_x: p.deform_max_offset_x,
            deform_max_offset_y: p.deform_max_offset_y,
            parallel_out: p.parallel_out,
            parallel_in: p.parallel_in,
            subpixel_pad: pad_to_raw(&p.subpixel_pad),
            input_pixels_w: p.input_pixels_w,
            input_pixels_h: p.input_pixels_h,
            _align_filler: [0; 20],
            segment_count,
        })
    }

    fn params(&self) -> Result<LayerParams> {
        Ok(LayerParams {
            in_channels: self.in_channels,
            out_channels: self.out_channels,
            number: self.number,
            kind: LayerKind::from_code(self.kind)?,
            stride: self.stride,
            kernel_length: self.kernel_length,
            conv_groups: self.conv_groups,
            dilation_rate_w: self.dilation_rate_w,
            dilation_rate_h: self.dilation_rate_h,
            seg_out_w: self.seg_out_w,
            seg_out_h: self.seg_out_h,
            seg_in_w: self.seg_in_w,
            seg_in_h: self.seg_in_h,
            conv_result_shift_right: self.conv_result_shift_right,
            relu6_shift_left: self.relu6_shift_left,
            alpha_mulh_shift_right: self.alpha_mulh_shift_right,
            bias_shift_right: self.bias_shift_right,
            store_shift_right: self.store_shift_right,
            elwise1_left_shift: self.elwise1_left_shift,
            elwise0_left_shift: self.elwise0_left_shift,
            elwise1_right_shift: self.elwise1_right_shift,
            elwise0_right_shift: self.elwise0_right_shift,
            pool_stride: self.pool_stride,
            activation: Activation::from_code(self.activation)?,
            alpha: self.alpha,
            pad: pad_from_raw(self.pad),
            input: image_from_raw(self.input),
            output: image_from_raw(self.output),
            axis: self.axis,
            dynamic_shape: self.dynamic_shape,
            block_size: self.block_size,
            last_layer_using_input: self.last_layer_using_input != 0,
            first_layer_producing_output: self.first_layer_producing_output != 0,
            pool_size_w: self.pool_size_w,
            pool_size_h: self.pool_size_h,
            pool_size_ch: self.pool_size_ch,
            pool_stride_w: self.pool_stride_w,
            pool_stride_h: self.pool_stride_h,
            pool_stride_ch: self.pool_stride_ch,
            pool_avg_shiftr: self.pool_avg_shiftr,
            deform_static_offsets: self.deform_static_offsets,
            deform_max_offset_x: self.deform_max_offset_x,
            deform_max_offset_y: self.deform_max_offset_y,
            parallel_out: self.parallel_out,
            parallel_in: self.parallel_in,
            subpixel_pad: pad_from_raw(self.subpixel_pad),
            input_pixels_w: self.input_pixels_w,
            input_pixels_h: self.input_pixels_h,
        })
    }
}

// ─── Blob ──────────────────────────────────────────────────────────

fn align32(n: usize) -> usize {
    (n + 31) & !31
}

fn size_field(what: &'static str, n: usize) -> Result<u32> {
    u32::try_from(n).map_err(|_| StreamError::FieldOverflow {
        field: what,
        value: n as i64,
    })
}

/// Bytes of `len` at `offset`, or a truncation error.
fn slice_at(bytes: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    bytes
        .get(offset..offset.saturating_add(len))
        .ok_or(StreamError::Truncated {
            offset,
            needed: len,
            available: bytes.len().saturating_sub(offset),
        })
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    Ok(bytemuck::pod_read_unaligned(slice_at(bytes, offset, 4)?))
}

/// Header fields of a blob, for display.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobSummary {
    pub blob_size: u32,
    pub layer_count: u32,
    pub exec_count: u32,
    pub exec_offset: u32,
    pub layer_offsets: Vec<u32>,
}

/// An encoded network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetBlob {
    bytes: Vec<u8>,
}

impl NetBlob {
    /// Lay out `layers` and the execution list into one blob.
    pub fn build(layers: &[Layer], exec_list: &[u32]) -> Result<Self> {
        let layer_count = size_field("layer_count", layers.len())?;
        for (entry, &layer) in exec_list.iter().enumerate() {
            if layer >= layer_count {
                return Err(StreamError::ExecListOutOfRange {
                    entry,
                    layer,
                    count: layer_count,
                });
            }
        }

        let mut encoded = Vec::with_capacity(layers.len());
        for layer in layers {
            let records = wire::encode(&layer.segments)?;
            let header = LayerHeader::new(&layer.params, records.len() / RECORD_SIZE)?;
            encoded.push((header, records));
        }

        let table_end = align32(NET_HEADER_SIZE + 4 * layers.len());
        let mut offsets = Vec::with_capacity(layers.len());
        let mut cursor = table_end;
        for (_, records) in &encoded {
            offsets.push(size_field("layer offset", cursor)?);
            cursor += align32(LAYER_HEADER_SIZE + records.len());
        }
        let exec_offset = cursor;
        let blob_size = exec_offset + 4 * exec_list.len();

        let header = NetHeader {
            magic: NET_MAGIC,
            blob_size: size_field("blob_size", blob_size)?,
            reserved: 0,
            exec_count: size_field("exec_count", exec_list.len())?,
            exec_offset: size_field("exec_offset", exec_offset)?,
            layer_count,
        };

        let mut bytes = Vec::with_capacity(blob_size);
        bytes.extend_from_slice(bytemuck::bytes_of(&header));
        bytes.extend_from_slice(bytemuck::cast_slice(&offsets));
        bytes.resize(table_end, 0);
        for (header, records) in &encoded {
            let start = bytes.len();
            bytes.extend_from_slice(bytemuck::bytes_of(header));
            bytes.extend_from_slice(records);
            bytes.resize(start + align32(LAYER_HEADER_SIZE + records.len()), 0);
        }
        bytes.extend_from_slice(bytemuck::cast_slice(exec_list));
        Ok(Self { bytes })
    }

    pub fn from_net(net: &Net) -> Result<Self> {
        Self::build(&net.layers, &net.exec_list)
    }

    /// Wrap existing bytes after checking that they parse.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::parse(&bytes)?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn digest(&self) -> blake3::Hash {
        blake3::hash(&self.bytes)
    }

    pub fn net(&self) -> Result<Net> {
        Self::parse(&self.bytes)
    }

    /// Validate the NET header and offset table.
    pub fn summary(bytes: &[u8]) -> Result<BlobSummary> {
        let header: NetHeader = bytemuck::pod_read_unaligned(slice_at(bytes, 0, NET_HEADER_SIZE)?);
        if header.magic != NET_MAGIC {
            return Err(StreamError::BadMagic {
                found: header.magic,
                expected: NET_MAGIC,
            });
        }
        let size = header.blob_size as usize;
        if size > bytes.len() {
            return Err(StreamError::Truncated {
                offset: 0,
                needed: size,
                available: bytes.len(),
            });
        }
        let bytes = &bytes[..size];

        let table_len = (header.layer_count as usize).saturating_mul(4);
        if NET_HEADER_SIZE.saturating_add(table_len) > size {
            return Err(StreamError::Truncated {
                offset: NET_HEADER_SIZE,
                needed: table_len,
                available: size.saturating_sub(NET_HEADER_SIZE),
            });
        }
        let mut layer_offsets = Vec::with_capacity(header.layer_count as usize);
        for i in 0..header.layer_count as usize {
            let offset = read_u32(bytes, NET_HEADER_SIZE + 4 * i)?;
            if offset as usize + LAYER_HEADER_SIZE > size {
                return Err(StreamError::OffsetOutOfRange {
                    what: "layer",
                    offset: offset as usize,
                    size,
                });
            }
            layer_offsets.push(offset);
        }
        let exec_end = (header.exec_offset as usize).saturating_add(4 * header.exec_count as usize);
        if exec_end > size {
            return Err(StreamError::OffsetOutOfRange {
                what: "execution list",
                offset: header.exec_offset as usize,
                size,
            });
        }
        Ok(BlobSummary {
            blob_size: header.blob_size,
            layer_count: header.layer_count,
            exec_count: header.exec_count,
            exec_offset: header.exec_offset,
            layer_offsets,
        })
    }

    /// Decode a blob at any address; nothing in it is position dependent.
    pub fn parse(bytes: &[u8]) -> Result<Net> {
        let summary = Self::summary(bytes)?;
        let bytes = &bytes[..summary.blob_size as usize];

        let mut layers = Vec::with_capacity(summary.layer_offsets.len());
        for &offset in &summary.layer_offsets {
            let offset = offset as usize;
            let header: LayerHeader = bytemuck::pod_read_unaligned(slice_at(bytes, offset, LAYER_HEADER_SIZE)?);
            let count = usize::try_from(header.segment_count).map_err(|_| StreamError::FieldOverflow {
                field: "command_segments_count",
                value: header.segment_count as i64,
            })?;
            let records = slice_at(
                bytes,
                offset + LAYER_HEADER_SIZE,
                count.saturating_mul(RECORD_SIZE),
            )?;
            layers.push(Layer::new(header.params()?, wire::decode(records)?));
        }

        let exec_list = (0..summary.exec_count as usize)
            .map(|i| read_u32(bytes, summary.exec_offset as usize + 4 * i))
            .collect::<Result<Vec<_>>>()?;

        Ok(Net { layers, exec_list })
    }
}
