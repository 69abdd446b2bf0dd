//! Command Segment IR.
//!
//! Every stage of the pipeline and the scheduler operate on [`Segment`], a
//! closed sum type over the record kinds of the accelerator's command
//! stream. The 32-byte packed layout only exists at the wire boundary
//! ([`wire`]); a loop transfer carries its base transfer inline and is
//! written out as two consecutive records.

pub mod layer;
pub mod listing;
pub mod wire;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};

pub use layer::{Activation, Layer, LayerKind, LayerParams, MmImage};

/// Bytes per data element in host memory.
pub const ELEMENT_BYTES: u64 = 2;

// ─── Transfers ─────────────────────────────────────────────────────

/// Direction and dimensionality of a DMA transfer.
///
/// Loads move host (external) memory into unit-local memory, stores move
/// local memory back out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Load1d,
    Load2d,
    Store1d,
    Store2d,
}

impl Direction {
    pub fn code(self) -> u8 {
        match self {
            Direction::Load1d => 0,
            Direction::Load2d => 1,
            Direction::Store1d => 2,
            Direction::Store2d => 3,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Direction::Load1d),
            1 => Ok(Direction::Load2d),
            2 => Ok(Direction::Store1d),
            3 => Ok(Direction::Store2d),
            other => Err(StreamError::UnknownDirection(other)),
        }
    }

    pub fn is_store(self) -> bool {
        matches!(self, Direction::Store1d | Direction::Store2d)
    }

    pub fn is_2d(self) -> bool {
        matches!(self, Direction::Load2d | Direction::Store2d)
    }

    /// Same direction class, one-dimensional.
    pub fn to_1d(self) -> Self {
        if self.is_store() {
            Direction::Store1d
        } else {
            Direction::Load1d
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Direction::Load1d => "e2l1D",
            Direction::Load2d => "e2l2D",
            Direction::Store1d => "l2e1D",
            Direction::Store2d => "l2e2D",
        }
    }
}

/// Per-edge padding switches of a transfer (widths are configured layer-wide).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PadFlags(pub u8);

impl PadFlags {
    pub const TOP: u8 = 1;
    pub const RIGHT: u8 = 2;
    pub const BOTTOM: u8 = 4;
    pub const LEFT: u8 = 8;

    pub fn none() -> Self {
        PadFlags(0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn has(self, edge: u8) -> bool {
        self.0 & edge != 0
    }
}

fn one() -> u16 {
    1
}

/// One DMA descriptor between host memory and unit-local memory.
///
/// `cluster` and `unit_mask` are bit masks: a transfer broadcast to several
/// clusters or units sets several bits. `mm_addr` is a byte address,
/// `lm_addr` a word address. `y_leap` is the host distance from the last
/// element of a row to the first of the next (1 = gapless).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transfer {
    pub direction: Direction,
    #[serde(default)]
    pub bias_offset: bool,
    #[serde(default)]
    pub kernel_offset: bool,
    #[serde(default)]
    pub padding: PadFlags,
    pub cluster: u32,
    pub unit_mask: u32,
    pub mm_addr: u64,
    pub lm_addr: u32,
    #[serde(default = "one")]
    pub y_leap: u16,
    pub x_size: u16,
    #[serde(default = "one")]
    pub y_size: u16,
    /// Trailing elements the front-end over-fetched to satisfy vector
    /// length minimums; removed once by the merger.
    #[serde(default)]
    pub skipped: u8,
}

impl Transfer {
    pub fn new_1d(direction: Direction, cluster: u32, unit_mask: u32, mm_addr: u64, lm_addr: u32, len: u16) -> Self {
        Self {
            direction: direction.to_1d(),
            bias_offset: false,
            kernel_offset: false,
            padding: PadFlags::none(),
            cluster,
            unit_mask,
            mm_addr,
            lm_addr,
            y_leap: 1,
            x_size: len,
            y_size: 1,
            skipped: 0,
        }
    }

    pub fn load_1d(cluster: u32, unit_mask: u32, mm_addr: u64, lm_addr: u32, len: u16) -> Self {
        Self::new_1d(Direction::Load1d, cluster, unit_mask, mm_addr, lm_addr, len)
    }

    pub fn store_1d(cluster: u32, unit_mask: u32, mm_addr: u64, lm_addr: u32, len: u16) -> Self {
        Self::new_1d(Direction::Store1d, cluster, unit_mask, mm_addr, lm_addr, len)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_2d(
        direction: Direction,
        cluster: u32,
        unit_mask: u32,
        mm_addr: u64,
        lm_addr: u32,
        x_size: u16,
        y_size: u16,
        y_leap: u16,
    ) -> Self {
        let direction = if direction.is_store() {
            Direction::Store2d
        } else {
            Direction::Load2d
        };
        Self {
            direction,
            y_leap,
            x_size,
            y_size,
            ..Self::new_1d(direction, cluster, unit_mask, mm_addr, lm_addr, 0)
        }
    }

    pub fn with_padding(mut self, padding: PadFlags) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_skipped(mut self, skipped: u8) -> Self {
        self.skipped = skipped;
        self
    }

    /// Data elements moved, counting every targeted cluster and unit.
    ///
    /// The discarded tail is excluded so that trimming it is count-neutral.
    pub fn elements(&self) -> u64 {
        let per_engine = (self.x_size as u64 * self.y_size as u64).saturating_sub(self.skipped as u64);
        per_engine * self.cluster.count_ones() as u64 * self.unit_mask.count_ones() as u64
    }

    /// Bytes of host address space covered, gaps between rows included.
    pub fn host_span(&self) -> u64 {
        if self.direction.is_2d() {
            (self.x_size as u64 + self.y_leap as u64 - 1) * self.y_size as u64 * ELEMENT_BYTES
        } else {
            self.x_size as u64 * ELEMENT_BYTES
        }
    }

    /// Words of local memory covered.
    pub fn local_span(&self) -> u32 {
        if self.direction.is_2d() {
            self.x_size as u32 * self.y_size as u32
        } else {
            self.x_size as u32
        }
    }

    /// Field-wise comparison ignoring the host address.
    ///
    /// This is the legacy equality of the wire format; it does not take
    /// part in deduplication, which compares every field.
    pub fn matches_except_host(&self, other: &Transfer) -> bool {
        self.direction == other.direction
            && self.cluster == other.cluster
            && self.unit_mask == other.unit_mask
            && self.lm_addr == other.lm_addr
            && self.y_leap == other.y_leap
            && self.x_size == other.x_size
            && self.y_size == other.y_size
            && self.padding == other.padding
    }

    /// Same direction, flags and geometry; addresses and targets may differ.
    pub fn same_shape(&self, other: &Transfer) -> bool {
        self.direction == other.direction
            && self.bias_offset == other.bias_offset
            && self.kernel_offset == other.kernel_offset
            && self.x_size == other.x_size
            && self.y_leap == other.y_leap
            && self.y_size == other.y_size
            && self.padding == other.padding
    }
}

// ─── Loop transfers ────────────────────────────────────────────────

/// Compact encoding of `count` transfers derived from `base`.
///
/// Expansion nests cluster (outer), unit, and inter-unit (inner) counters;
/// `*_len` is the number of additional iterations of each level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoopTransfer {
    pub cluster_len: u8,
    pub cluster_shift: i8,
    pub unit_len: u8,
    pub unit_shift: i8,
    pub inter_unit_len: u8,
    /// Local address step inside one unit iteration (13-bit signed in hardware).
    pub lm_incr: i16,
    /// Host address step per emitted transfer.
    pub mm_incr: i32,
    pub count: u16,
    pub base: Transfer,
}

/// Shift a mask left, or right for negative amounts; bits shifted out are lost.
pub fn shift_mask(mask: u32, shift: i8) -> u32 {
    if shift >= 0 {
        mask.checked_shl(shift as u32).unwrap_or(0)
    } else {
        mask.checked_shr(shift.unsigned_abs() as u32).unwrap_or(0)
    }
}

impl LoopTransfer {
    /// Representable range of `lm_incr`.
    pub const LM_INCR_MIN: i32 = -(1 << 12);
    pub const LM_INCR_MAX: i32 = (1 << 12) - 1;

    /// Expand the loop the way the DMA engine does.
    pub fn expand(&self) -> Vec<Transfer> {
        let mut out = Vec::with_capacity(self.count as usize);
        let mut mm_addr = self.base.mm_addr;
        let mut cluster_mask = self.base.cluster;
        'outer: for _ in 0..=self.cluster_len {
            let mut unit_mask = self.base.unit_mask;
            for _ in 0..=self.unit_len {
                let mut lm_addr = self.base.lm_addr;
                for _ in 0..=self.inter_unit_len {
                    if out.len() >= self.count as usize {
                        break 'outer;
                    }
                    out.push(Transfer {
                        cluster: cluster_mask,
                        unit_mask,
                        mm_addr,
                        lm_addr,
                        ..self.base
                    });
                    lm_addr = lm_addr.wrapping_add_signed(self.lm_incr as i32);
                    mm_addr = mm_addr.wrapping_add_signed(self.mm_incr as i64);
                }
                unit_mask = shift_mask(unit_mask, self.unit_shift);
            }
            cluster_mask = shift_mask(cluster_mask, self.cluster_shift);
        }
        out
    }

    pub fn elements(&self) -> u64 {
        self.expand().iter().map(Transfer::elements).sum()
    }
}

// ─── Compute commands ──────────────────────────────────────────────

/// Compute-lane operation selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Opcode {
    ConvStart,
    ConvAdd,
    Maxpool2x2Fused,
    ActivationFused,
    ShiftStore,
    Add,
    ConvTransposeStart,
    ConvTransposeAdd,
    Conv1dStart,
    Conv1dAdd,
    Concatenate,
    DepthToSpace,
    DconvDeform8x8,
    DconvConvStart,
    DconvConvAdd,
    ReluPoolScatter,
    MaxPooling,
    Avgpool2d,
    Mul,
    GlobalAvgpool2dStart,
    GlobalAvgpool2dAdd,
    GlobalAvgpool2dStoreIntermediates,
    GlobalAvgpool2dSumIntermediates,
    GlobalAvgpool2dDivide,
    SetMasks,
    ResetIndices,
    ShiftStoreUpsample,
}

const OPCODES: [Opcode; 27] = [
    Opcode::ConvStart,
    Opcode::ConvAdd,
    Opcode::Maxpool2x2Fused,
    Opcode::ActivationFused,
    Opcode::ShiftStore,
    Opcode::Add,
    Opcode::ConvTransposeStart,
    Opcode::ConvTransposeAdd,
    Opcode::Conv1dStart,
    Opcode::Conv1dAdd,
    Opcode::Concatenate,
    Opcode::DepthToSpace,
    Opcode::DconvDeform8x8,
    Opcode::DconvConvStart,
    Opcode::DconvConvAdd,
    Opcode::ReluPoolScatter,
    Opcode::MaxPooling,
    Opcode::Avgpool2d,
    Opcode::Mul,
    Opcode::GlobalAvgpool2dStart,
    Opcode::GlobalAvgpool2dAdd,
    Opcode::GlobalAvgpool2dStoreIntermediates,
    Opcode::GlobalAvgpool2dSumIntermediates,
    Opcode::GlobalAvgpool2dDivide,
    Opcode::SetMasks,
    Opcode::ResetIndices,
    Opcode::ShiftStoreUpsample,
];

impl Opcode {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self> {
        OPCODES
            .get(code as usize)
            .copied()
            .ok_or(StreamError::UnknownOpcode(code))
    }
}

/// One compute-lane command.
///
/// Several wire fields are shared between opcodes; the accessor methods
/// give them the name the respective opcode uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Compute {
    pub op: Opcode,
    /// Lane index or lane mask.
    pub lane: u8,
    /// Local-memory buffer (also the local-memory base).
    pub buffer: u16,
    pub xend: u16,
    pub yend: u16,
    pub zend: u16,
    /// Offset (also the register-file base).
    pub offset: u16,
    pub shift_right: i16,
    pub kernel_l0: u16,
    pub kernel_l1: u16,
    pub bias_l0: u16,
    pub bias_l1: u16,
    pub deform_offset: u16,
    pub deform_output: u16,
    pub lm_lane_stride: i16,
    pub nops: u8,
}

impl Default for Compute {
    fn default() -> Self {
        Self {
            op: Opcode::ConvStart,
            lane: 0,
            buffer: 0,
            xend: 0,
            yend: 0,
            zend: 0,
            offset: 0,
            shift_right: 0,
            kernel_l0: 0,
            kernel_l1: 0,
            bias_l0: 0,
            bias_l1: 0,
            deform_offset: 0,
            deform_output: 0,
            lm_lane_stride: 1024,
            nops: 0,
        }
    }
}

impl Compute {
    pub fn new(op: Opcode) -> Self {
        Self {
            op,
            ..Self::default()
        }
    }

    pub fn lm_base(&self) -> u16 {
        self.buffer
    }
    pub fn rf_base(&self) -> u16 {
        self.offset
    }
    pub fn broadcast_map(&self) -> u16 {
        self.kernel_l0
    }
    pub fn n_summands(&self) -> u16 {
        self.kernel_l0
    }
    pub fn multiplier(&self) -> i16 {
        self.kernel_l0 as i16
    }
    pub fn rf_ch_stride(&self) -> u16 {
        self.kernel_l1
    }
    pub fn pre_shift_right(&self) -> i16 {
        self.kernel_l1 as i16
    }
    pub fn lm_ch_stride(&self) -> u16 {
        self.bias_l0
    }
    pub fn cluster_mask(&self) -> u16 {
        self.bias_l0
    }
    pub fn rf_frac_bits(&self) -> i16 {
        self.bias_l1 as i16
    }
    pub fn unit_mask(&self) -> u16 {
        self.bias_l1
    }
    pub fn in_ch_offset(&self) -> u16 {
        self.deform_offset
    }
    pub fn pp_index_buffer(&self) -> u16 {
        self.deform_offset
    }
}

// ─── Auxiliary commands ────────────────────────────────────────────

/// Which hardware side a synchronization marker waits for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncKind {
    Dma,
    Lanes,
    Both,
}

/// DMA pad widths and fill value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PadConfig {
    pub top: i32,
    pub left: i32,
    pub bottom: i32,
    pub right: i32,
    pub value: i32,
}

/// Point-cloud scatter-to-grid command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Scatter {
    pub index_shift: i16,
    pub xmin_fixed: i16,
    pub ymin_fixed: i16,
    pub mm_addr_coords: u32,
    pub mm_addr_features: u32,
    pub mm_addr_grid: u32,
    pub memcopy_size: u16,
    pub use_vpro_dma: bool,
}

// ─── Segments ──────────────────────────────────────────────────────

/// One command of the stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Segment {
    Transfer(Transfer),
    Loop(LoopTransfer),
    Compute(Compute),
    /// The next `count` wire records are fetched by the DMA engine as a batch.
    Block { count: u32 },
    Sync(SyncKind),
    Padding(PadConfig),
    Scatter(Scatter),
}

impl Segment {
    /// Number of 32-byte records this segment occupies on the wire.
    pub fn wire_len(&self) -> usize {
        match self {
            Segment::Loop(_) => 2,
            _ => 1,
        }
    }

    /// Transfers and loop transfers: what a block may contain.
    pub fn is_dma(&self) -> bool {
        matches!(self, Segment::Transfer(_) | Segment::Loop(_))
    }

    pub fn as_transfer(&self) -> Option<&Transfer> {
        match self {
            Segment::Transfer(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_store(&self) -> bool {
        match self {
            Segment::Transfer(t) => t.direction.is_store(),
            Segment::Loop(l) => l.base.direction.is_store(),
            _ => false,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Segment::Transfer(_) => "transfer",
            Segment::Loop(_) => "loop",
            Segment::Compute(_) => "compute",
            Segment::Block { .. } => "block",
            Segment::Sync(_) => "sync",
            Segment::Padding(_) => "padding",
            Segment::Scatter(_) => "scatter",
        }
    }
}

/// Total moved elements of a stream, loops expanded.
pub fn count_elements(segments: &[Segment]) -> u64 {
    segments
        .iter()
        .map(|s| match s {
            Segment::Transfer(t) => t.elements(),
            Segment::Loop(l) => l.elements(),
            _ => 0,
        })
        .sum()
}

/// Number of wire records.
pub fn record_len(segments: &[Segment]) -> usize {
    segments.iter().map(Segment::wire_len).sum()
}

/// Number of segments with every loop replaced by the transfers it encodes.
pub fn unrolled_len(segments: &[Segment]) -> usize {
    segments
        .iter()
        .map(|s| match s {
            Segment::Loop(l) => l.count as usize,
            _ => 1,
        })
        .sum()
}

/// The stream with every loop replaced by the transfers it encodes.
pub fn unroll(segments: &[Segment]) -> Vec<Segment> {
    let mut out = Vec::with_capacity(unrolled_len(segments));
    for seg in segments {
        match seg {
            Segment::Loop(l) => out.extend(l.expand().into_iter().map(Segment::Transfer)),
            other => out.push(*other),
        }
    }
    out
}

/// Recompute every block count as the records of the DMA run after it.
pub fn refresh_block_counts(segments: &mut [Segment]) {
    let mut i = 0;
    while i < segments.len() {
        if let Segment::Block { .. } = segments[i] {
            let records: usize = segments[i + 1..]
                .iter()
                .take_while(|s| s.is_dma())
                .map(Segment::wire_len)
                .sum();
            segments[i] = Segment::Block {
                count: records as u32,
            };
        }
        i += 1;
    }
}

/// Segments covered by the block marker at `index`, or why the marker is malformed.
pub fn block_body(segments: &[Segment], index: usize) -> Result<&[Segment]> {
    let Some(Segment::Block { count }) = segments.get(index) else {
        return Ok(&[]);
    };
    let mut records = 0u32;
    let mut end = index + 1;
    while records < *count {
        match segments.get(end) {
            Some(s) if s.is_dma() => {
                records += s.wire_len() as u32;
                end += 1;
            }
            _ => break,
        }
    }
    if records != *count {
        return Err(StreamError::MalformedBlock {
            index,
            stated: *count,
            available: records,
        });
    }
    Ok(&segments[index + 1..end])
}

/// Every block marker is followed by exactly as many DMA records as it states.
pub fn check_blocks(segments: &[Segment]) -> Result<()> {
    for (index, seg) in segments.iter().enumerate() {
        if let Segment::Block { .. } = seg {
            block_body(segments, index)?;
        }
    }
    Ok(())
}
