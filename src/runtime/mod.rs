//! Runtime: executes finalized command streams on an accelerator.
//!
//! The scheduler walks a layer's segments one at a time and turns them
//! into register-level operations. Those operations are the
//! [`Accelerator`] trait; the physical device and the recording
//! simulator in [`sim`] both implement it. The DMA engines and compute
//! lanes run concurrently with the control processor, and the only
//! points where the scheduler observes completion are the explicit
//! synchronization markers in the stream.

pub mod scheduler;
pub mod sim;

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::info;

use crate::blob::NetBlob;
use crate::config::HardwareConfig;
use crate::error::{Result, StreamError};
use crate::ir::{Activation, Compute, Layer, LayerKind, LayerParams, PadConfig, Scatter, Segment, SyncKind};
use crate::optimize::validate_layer;

pub use scheduler::{run_layer, SchedulingContext};

// ─── Lane configuration ────────────────────────────────────────────

/// When the MAC accumulator restarts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum MacResetMode {
    XIncrement,
    ZIncrement,
    Once,
    Never,
}

/// Initial accumulator value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum MacInitSource {
    /// Read from the register file (bias, running sum).
    Addr,
    Zero,
}

/// Global lane settings written between kernels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum LaneConfig {
    MacShift(i16),
    MulShift(i16),
    MacResetMode(MacResetMode),
    MacInitSource(MacInitSource),
    /// Store the constant 6, shifted left, at `rf_addr` for ReLU6 clipping.
    Relu6Constant { shift_left: i16, rf_addr: i32 },
    GlobalAvgPoolConstants,
    /// Precompute the stride table of a transposed convolution.
    ConvTransposeTable { stride: u16 },
    Masks { cluster: u16, unit: u16 },
}

// ─── Kernels ───────────────────────────────────────────────────────

/// Lane program started by one step of a compute command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Kernel {
    BiasLoad { lane: u8, buffer: u16 },
    KernelLoad { lane: u8, buffer: u16 },
    Conv2d,
    Conv2dAdd,
    Conv1d,
    Conv1dAdd,
    ConvTranspose,
    ConvTransposeAdd,
    DconvConv,
    DconvConvAdd,
    /// One 4x4 block of a deformable convolution's sampling step.
    DeformBlock {
        input: u16,
        offsets: u16,
        output: u16,
        static_offsets: u16,
    },
    Elementwise,
    Concatenate,
    DepthToSpace,
    AvgPoolLoadKernel,
    AvgPool,
    AvgPoolStore,
    MaxPool2d,
    MaxPool2x2,
    Activation(Activation),
    PoolScatter,
    ResetIndices,
    GlobalAvgPoolAdd,
    GlobalAvgPoolStoreIntermediates,
    GlobalAvgPoolSumIntermediates,
    GlobalAvgPoolDivide,
    ShiftStore,
    ShiftStoreUpsample,
}

/// A kernel launch with the compute command that parameterizes it.
///
/// `cmd` already carries any per-layer overrides (dynamic `zend` and
/// `nops` of point-pillar layers). `compensate` is the number of bubble
/// cycles short vectors need before their first result is read back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct KernelCall {
    pub kernel: Kernel,
    pub cmd: Compute,
    pub compensate: u32,
}

// ─── Accelerator ───────────────────────────────────────────────────

/// Register-mapped primitives of the accelerator.
///
/// Issue operations return immediately; the hardware works on them in
/// the background until a `wait` blocks for it.
pub trait Accelerator {
    /// Program DMA pad widths and fill value for later padded loads.
    fn set_pad(&mut self, pad: &PadConfig);

    /// Set the batch size and trigger the DMA engine to fetch `records`.
    fn dma_block(&mut self, records: &[Segment]);

    /// Hand a single transfer or loop transfer to the DMA command queue.
    fn dma_issue(&mut self, segment: &Segment);

    /// Block until the DMA engines, the lanes, or both are idle.
    fn wait(&mut self, kind: SyncKind);

    fn configure(&mut self, setting: LaneConfig);

    /// Insert idle cycles into the lane pipeline.
    fn nops(&mut self, count: u32);

    fn kernel(&mut self, call: &KernelCall);

    /// Cycle counter of the control processor.
    fn cycles(&self) -> u64;

    /// Points per pillar segment, read once per point-pillar layer.
    fn point_counts(&mut self, _params: &LayerParams) -> Vec<u16> {
        Vec::new()
    }

    /// Size the dynamic transfers of a batch from the point counts and
    /// return the largest resulting transfer length.
    fn dynamic_block(&mut self, _records: &[Segment], _point_counts: &[u16]) -> u16 {
        0
    }

    /// Apply the shape update of a dynamic-axis layer.
    fn dynamic_shape(&mut self, _params: &LayerParams) {}

    /// Scatter point features into the grid, by DMA or by the control processor.
    fn scatter(&mut self, _params: &LayerParams, _commands: &[Scatter], _via_dma: bool) {}

    fn pre_layer(&mut self, _entry: usize, _total: usize, _params: &LayerParams) {}

    fn post_layer(&mut self, _entry: usize, _total: usize, _params: &LayerParams) {}
}

// ─── Statistics ────────────────────────────────────────────────────

/// What one layer executed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LayerStats {
    pub number: u16,
    pub kind: LayerKind,
    /// Segments seen by the scheduler, by kind name.
    pub segments: BTreeMap<&'static str, usize>,
    /// Transfers the DMA engines executed, loops expanded.
    pub transfers: u64,
    pub cycles: u64,
}

impl LayerStats {
    pub(crate) fn count(&mut self, segment: &Segment) {
        *self.segments.entry(segment.kind_name()).or_insert(0) += 1;
        self.transfers += match segment {
            Segment::Transfer(_) => 1,
            Segment::Loop(l) => l.count as u64,
            _ => 0,
        };
    }
}

// ─── Network driver ────────────────────────────────────────────────

/// Execute a network blob: every entry of its execution list in order.
///
/// The whole execution list is resolved and every layer on it validated
/// against `hw` before the first command is issued. Each layer ends with
/// a full synchronization so that the next layer starts on idle hardware.
pub fn run_net(acc: &mut dyn Accelerator, blob: &[u8], hw: &HardwareConfig) -> Result<Vec<LayerStats>> {
    let net = NetBlob::parse(blob)?;
    let schedule = net
        .exec_list
        .iter()
        .enumerate()
        .map(|(entry, &index)| {
            net.layers.get(index as usize).ok_or(StreamError::ExecListOutOfRange {
                entry,
                layer: index,
                count: net.layers.len() as u32,
            })
        })
        .collect::<Result<Vec<&Layer>>>()?;
    for layer in &schedule {
        validate_layer(layer, hw)?;
    }

    let total = schedule.len();
    let mut stats = Vec::with_capacity(total);
    let mut cycles = 0u64;
    for (entry, layer) in schedule.into_iter().enumerate() {
        acc.pre_layer(entry, total, &layer.params);
        let mut layer_stats = run_layer(acc, layer, hw)?;
        let before_sync = acc.cycles();
        acc.wait(SyncKind::Both);
        layer_stats.cycles += acc.cycles().saturating_sub(before_sync);
        acc.post_layer(entry, total, &layer.params);

        cycles += layer_stats.cycles;
        info!(
            entry,
            layer = layer.params.number,
            kind = ?layer.params.kind,
            transfers = layer_stats.transfers,
            cycles = layer_stats.cycles,
            total = cycles,
            "layer done"
        );
        stats.push(layer_stats);
    }
    Ok(stats)
}
