//! 32-byte record layout of the command stream.
//!
//! Every record ends in its type byte at offset 31. Multi-byte fields are
//! little-endian; the crate refuses to build for big-endian targets, so the
//! `bytemuck` casts below are the byte layout.

use bytemuck::{Pod, Zeroable};

use super::{
    Compute, Direction, LoopTransfer, Opcode, PadConfig, PadFlags, Scatter, Segment, SyncKind,
    Transfer,
};
use crate::error::{Result, StreamError};

pub const RECORD_SIZE: usize = 32;
const KIND_OFFSET: usize = RECORD_SIZE - 1;

/// Direction byte marking a loop header.
pub const LOOP_DIRECTION: u8 = 4;

pub const KIND_DMA: u8 = 0;
pub const KIND_COMPUTE: u8 = 1;
pub const KIND_DMA_WAIT: u8 = 2;
pub const KIND_LANE_WAIT: u8 = 3;
pub const KIND_BLOCK: u8 = 4;
pub const KIND_BOTH_SYNC: u8 = 5;
pub const KIND_SCATTER: u8 = 6;
pub const KIND_PADDING: u8 = 7;

// ─── Records ───────────────────────────────────────────────────────

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct DmaRecord {
    pub direction: u8,
    pub bias_offset: u8,
    pub kernel_offset: u8,
    pub padding: u8,
    pub cluster: u32,
    pub unit_mask: u32,
    pub mm_addr: u32,
    pub mm_addr_hi: u32,
    pub lm_addr: u32,
    pub y_leap: u16,
    pub x_size: u16,
    pub y_size: u16,
    pub skipped: u8,
    pub kind: u8,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct LoopRecord {
    pub direction: u8,
    pub cluster_len: u8,
    pub cluster_shift: i8,
    pub unit_len: u8,
    pub unit_shift: i8,
    pub inter_unit_len: u8,
    pub _pad0: [u8; 2],
    pub lm_incr: i16,
    pub _pad1: [u8; 2],
    pub mm_incr: i32,
    pub count: u16,
    pub _pad2: [u8; 13],
    pub kind: u8,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ComputeRecord {
    pub command: u8,
    pub lane: u8,
    pub buffer: u16,
    pub xend: u16,
    pub yend: u16,
    pub zend: u16,
    pub offset: u16,
    pub shift_right: i16,
    pub kernel_l0: u16,
    pub kernel_l1: u16,
    pub bias_l0: u16,
    pub bias_l1: u16,
    pub deform_offset: u16,
    pub deform_output: u16,
    pub lm_lane_stride: i16,
    pub _pad: [u8; 2],
    pub nops: u8,
    pub kind: u8,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct PaddingRecord {
    pub top: i32,
    pub left: i32,
    pub bottom: i32,
    pub right: i32,
    pub value: i32,
    pub _pad: [u8; 11],
    pub kind: u8,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ScatterRecord {
    pub index_shift: i16,
    pub xmin_fixed: i16,
    pub ymin_fixed: i16,
    pub _pad0: [u8; 2],
    pub mm_addr_coords: u32,
    pub mm_addr_features: u32,
    pub mm_addr_grid: u32,
    pub memcopy_size: u16,
    pub use_vpro_dma: u16,
    pub _pad1: [u8; 7],
    pub kind: u8,
}

const _: () = {
    assert!(std::mem::size_of::<DmaRecord>() == RECORD_SIZE);
    assert!(std::mem::size_of::<LoopRecord>() == RECORD_SIZE);
    assert!(std::mem::size_of::<ComputeRecord>() == RECORD_SIZE);
    assert!(std::mem::size_of::<PaddingRecord>() == RECORD_SIZE);
    assert!(std::mem::size_of::<ScatterRecord>() == RECORD_SIZE);
};

// ─── Conversions ───────────────────────────────────────────────────

impl From<&Transfer> for DmaRecord {
    fn from(t: &Transfer) -> Self {
        Self {
            direction: t.direction.code(),
            bias_offset: t.bias_offset as u8,
            kernel_offset: t.kernel_offset as u8,
            padding: t.padding.0,
            cluster: t.cluster,
            unit_mask: t.unit_mask,
            mm_addr: t.mm_addr as u32,
            mm_addr_hi: (t.mm_addr >> 32) as u32,
            lm_addr: t.lm_addr,
            y_leap: t.y_leap,
            x_size: t.x_size,
            y_size: t.y_size,
            skipped: t.skipped,
            kind: KIND_DMA,
        }
    }
}

impl DmaRecord {
    fn to_transfer(self) -> Result<Transfer> {
        Ok(Transfer {
            direction: Direction::from_code(self.direction)?,
            bias_offset: self.bias_offset != 0,
            kernel_offset: self.kernel_offset != 0,
            padding: PadFlags(self.padding),
            cluster: self.cluster,
            unit_mask: self.unit_mask,
            mm_addr: (self.mm_addr_hi as u64) << 32 | self.mm_addr as u64,
            lm_addr: self.lm_addr,
            y_leap: self.y_leap,
            x_size: self.x_size,
            y_size: self.y_size,
            skipped: self.skipped,
        })
    }
}

impl LoopRecord {
    fn from_loop(l: &LoopTransfer) -> Result<Self> {
        let lm = l.lm_incr as i32;
        if !(LoopTransfer::LM_INCR_MIN..=LoopTransfer::LM_INCR_MAX).contains(&lm) {
            return Err(StreamError::FieldOverflow {
                field: "lm_incr",
                value: lm as i64,
            });
        }
        Ok(Self {
            direction: LOOP_DIRECTION,
            cluster_len: l.cluster_len,
            cluster_shift: l.cluster_shift,
            unit_len: l.unit_len,
            unit_shift: l.unit_shift,
            inter_unit_len: l.inter_unit_len,
            lm_incr: l.lm_incr,
            mm_incr: l.mm_incr,
            count: l.count,
            kind: KIND_DMA,
            ..Zeroable::zeroed()
        })
    }

    fn with_base(self, base: Transfer) -> LoopTransfer {
        LoopTransfer {
            cluster_len: self.cluster_len,
            cluster_shift: self.cluster_shift,
            unit_len: self.unit_len,
            unit_shift: self.unit_shift,
            inter_unit_len: self.inter_unit_len,
            lm_incr: self.lm_incr,
            mm_incr: self.mm_incr,
            count: self.count,
            base,
        }
    }
}

impl From<&Compute> for ComputeRecord {
    fn from(c: &Compute) -> Self {
        Self {
            command: c.op.code(),
            lane: c.lane,
            buffer: c.buffer,
            xend: c.xend,
            yend: c.yend,
            zend: c.zend,
            offset: c.offset,
            shift_right: c.shift_right,
            kernel_l0: c.kernel_l0,
            kernel_l1: c.kernel_l1,
            bias_l0: c.bias_l0,
            bias_l1: c.bias_l1,
            deform_offset: c.deform_offset,
            deform_output: c.deform_output,
            lm_lane_stride: c.lm_lane_stride,
            _pad: [0; 2],
            nops: c.nops,
            kind: KIND_COMPUTE,
        }
    }
}

impl ComputeRecord {
    fn to_compute(self) -> Result<Compute> {
        Ok(Compute {
            op: Opcode::from_code(self.command)?,
            lane: self.lane,
            buffer: self.buffer,
            xend: self.xend,
            yend: self.yend,
            zend: self.zend,
            offset: self.offset,
            shift_right: self.shift_right,
            kernel_l0: self.kernel_l0,
            kernel_l1: self.kernel_l1,
            bias_l0: self.bias_l0,
            bias_l1: self.bias_l1,
            deform_offset: self.deform_offset,
            deform_output: self.deform_output,
            lm_lane_stride: self.lm_lane_stride,
            nops: self.nops,
        })
    }
}

impl From<&PadConfig> for PaddingRecord {
    fn from(p: &PadConfig) -> Self {
        Self {
            top: p.top,
            left: p.left,
            bottom: p.bottom,
            right: p.right,
            value: p.value,
            _pad: [0; 11],
            kind: KIND_PADDING,
        }
    }
}

impl From<PaddingRecord> for PadConfig {
    fn from(r: PaddingRecord) -> Self {
        Self {
            top: r.top,
            left: r.left,
            bottom: r.bottom,
            right: r.right,
            value: r.value,
        }
    }
}

impl From<&Scatter> for ScatterRecord {
    fn from(s: &Scatter) -> Self {
        Self {
            index_shift: s.index_shift,
            xmin_fixed: s.xmin_fixed,
            ymin_fixed: s.ymin_fixed,
            mm_addr_coords: s.mm_addr_coords,
            mm_addr_features: s.mm_addr_features,
            mm_addr_grid: s.mm_addr_grid,
            memcopy_size: s.memcopy_size,
            use_vpro_dma: s.use_vpro_dma as u16,
            kind: KIND_SCATTER,
            ..Zeroable::zeroed()
        }
    }
}

impl From<ScatterRecord> for Scatter {
    fn from(r: ScatterRecord) -> Self {
        Self {
            index_shift: r.index_shift,
            xmin_fixed: r.xmin_fixed,
            ymin_fixed: r.ymin_fixed,
            mm_addr_coords: r.mm_addr_coords,
            mm_addr_features: r.mm_addr_features,
            mm_addr_grid: r.mm_addr_grid,
            memcopy_size: r.memcopy_size,
            use_vpro_dma: r.use_vpro_dma != 0,
        }
    }
}

fn marker(kind: u8) -> [u8; RECORD_SIZE] {
    let mut bytes = [0u8; RECORD_SIZE];
    bytes[KIND_OFFSET] = kind;
    bytes
}

// ─── Encode ────────────────────────────────────────────────────────

/// Append the wire records of one segment.
pub fn encode_segment(segment: &Segment, out: &mut Vec<u8>) -> Result<()> {
    match segment {
        Segment::Transfer(t) => out.extend_from_slice(bytemuck::bytes_of(&DmaRecord::from(t))),
        Segment::Loop(l) => {
            out.extend_from_slice(bytemuck::bytes_of(&LoopRecord::from_loop(l)?));
            out.extend_from_slice(bytemuck::bytes_of(&DmaRecord::from(&l.base)));
        }
        Segment::Compute(c) => {
            out.extend_from_slice(bytemuck::bytes_of(&ComputeRecord::from(c)))
        }
        Segment::Block { count } => {
            let record = DmaRecord {
                unit_mask: *count,
                kind: KIND_BLOCK,
                ..Zeroable::zeroed()
            };
            out.extend_from_slice(bytemuck::bytes_of(&record));
        }
        Segment::Sync(kind) => out.extend_from_slice(&marker(match kind {
            SyncKind::Dma => KIND_DMA_WAIT,
            SyncKind::Lanes => KIND_LANE_WAIT,
            SyncKind::Both => KIND_BOTH_SYNC,
        })),
        Segment::Padding(p) => {
            out.extend_from_slice(bytemuck::bytes_of(&PaddingRecord::from(p)))
        }
        Segment::Scatter(s) => {
            out.extend_from_slice(bytemuck::bytes_of(&ScatterRecord::from(s)))
        }
    }
    Ok(())
}

/// Encode a segment list into its contiguous record array.
pub fn encode(segments: &[Segment]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(super::record_len(segments) * RECORD_SIZE);
    for segment in segments {
        encode_segment(segment, &mut out)?;
    }
    Ok(out)
}

// ─── Decode ────────────────────────────────────────────────────────

fn record(bytes: &[u8], index: usize) -> &[u8] {
    &bytes[index * RECORD_SIZE..(index + 1) * RECORD_SIZE]
}

/// Decode a record array. `bytes` must hold a whole number of records.
pub fn decode(bytes: &[u8]) -> Result<Vec<Segment>> {
    if bytes.len() % RECORD_SIZE != 0 {
        let whole = bytes.len() / RECORD_SIZE * RECORD_SIZE;
        return Err(StreamError::Truncated {
            offset: whole,
            needed: RECORD_SIZE,
            available: bytes.len() - whole,
        });
    }
    let records = bytes.len() / RECORD_SIZE;
    let mut out = Vec::with_capacity(records);
    let mut index = 0;
    while index < records {
        let raw = record(bytes, index);
        let segment = match raw[KIND_OFFSET] {
            KIND_DMA if raw[0] == LOOP_DIRECTION => {
                let header: LoopRecord = bytemuck::pod_read_unaligned(raw);
                let base = (index + 1 < records)
                    .then(|| record(bytes, index + 1))
                    .filter(|next| next[KIND_OFFSET] == KIND_DMA && next[0] != LOOP_DIRECTION)
                    .ok_or(StreamError::LoopWithoutBase { index })?;
                let base: DmaRecord = bytemuck::pod_read_unaligned(base);
                index += 1;
                Segment::Loop(header.with_base(base.to_transfer()?))
            }
            KIND_DMA => {
                let dma: DmaRecord = bytemuck::pod_read_unaligned(raw);
                Segment::Transfer(dma.to_transfer()?)
            }
            KIND_COMPUTE => {
                let c: ComputeRecord = bytemuck::pod_read_unaligned(raw);
                Segment::Compute(c.to_compute()?)
            }
            KIND_DMA_WAIT => Segment::Sync(SyncKind::Dma),
            KIND_LANE_WAIT => Segment::Sync(SyncKind::Lanes),
            KIND_BOTH_SYNC => Segment::Sync(SyncKind::Both),
            KIND_BLOCK => {
                let dma: DmaRecord = bytemuck::pod_read_unaligned(raw);
                Segment::Block {
                    count: dma.unit_mask,
                }
            }
            KIND_SCATTER => {
                let s: ScatterRecord = bytemuck::pod_read_unaligned(raw);
                Segment::Scatter(s.into())
            }
            KIND_PADDING => {
                let p: PaddingRecord = bytemuck::pod_read_unaligned(raw);
                Segment::Padding(p.into())
            }
            kind => return Err(StreamError::UnknownSegmentKind { index, kind }),
        };
        out.push(segment);
        index += 1;
    }
    Ok(out)
}
