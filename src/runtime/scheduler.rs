//! Segment scheduler: the per-layer dispatch loop.

use tracing::{debug, warn};

use super::{Accelerator, Kernel, KernelCall, LaneConfig, LayerStats, MacInitSource, MacResetMode};
use crate::config::HardwareConfig;
use crate::error::Result;
use crate::ir::{self, Activation, Compute, Layer, LayerKind, LayerParams, Opcode, Scatter, Segment, SyncKind};

/// Multiplier shift of leaky ReLU when the layer carries no alpha.
const LEAKY_DEFAULT_SHIFT: i16 = 18;
/// Largest left shift at which the ReLU6 bound still fits the register file.
const RELU6_MAX_SHIFT: i16 = 20;
/// MAC shift used while summing a global average pool.
const GLOBAL_AVGPOOL_MAC_SHIFT: i16 = 16;

// Geometry of one deformable-convolution sampling step.
const DEFORM_KERNEL_LENGTH: u16 = 9;
const DEFORM_BLOCK: u16 = 4;
const DEFORM_CHUNK_WIDTH: u16 = 8;

/// Scheduling state of one layer.
///
/// Computed from the layer header before the first segment runs; the
/// point-pillar extents change while the stream executes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulingContext {
    pub kind: LayerKind,
    /// Effective activation; ReLU6 degrades to ReLU when 6 is not representable.
    pub activation: Activation,
    pub kernel_x: u32,
    pub kernel_y: u32,
    pub rf_kernel_base: i32,
    pub rf_bias_base: i32,
    pub rf_relu6_base: i32,
    /// Elements one compute segment produces per lane.
    pub vector_length: u32,
    /// Bubble cycles short vectors need.
    pub compensate: u32,
    /// Multiplier shift restored after element-wise multiplications.
    pub leaky_shift: i16,
    pub conv_shift: i16,
    pub w2r_bubble: u32,
    /// Lane configuration written before the first segment.
    pub setup: Vec<LaneConfig>,
    point_counts: Vec<u16>,
    max_zend: u16,
    next_max_zend: u16,
}

impl SchedulingContext {
    pub fn for_layer(params: &LayerParams, hw: &HardwareConfig) -> Self {
        let rf_discard = hw.rf_size as i32 - 1;
        let parallel_out = params.parallel_out as i32;
        let vector_length = params.vector_length();
        let mut ctx = Self {
            kind: params.kind,
            activation: params.activation,
            kernel_x: 0,
            kernel_y: 0,
            rf_kernel_base: rf_discard,
            rf_bias_base: rf_discard,
            rf_relu6_base: rf_discard,
            vector_length,
            compensate: hw.min_vector_length.saturating_sub(vector_length),
            leaky_shift: params.alpha_mulh_shift_right,
            conv_shift: params.conv_result_shift_right,
            w2r_bubble: hw.w2r_bubble,
            setup: Vec::new(),
            point_counts: Vec::new(),
            max_zend: 0,
            next_max_zend: 0,
        };

        if params.activation == Activation::Leaky {
            if params.alpha == 0 {
                ctx.leaky_shift = LEAKY_DEFAULT_SHIFT;
            }
            ctx.setup.push(LaneConfig::MulShift(ctx.leaky_shift));
        }

        match params.kind {
            LayerKind::Conv1
            | LayerKind::Conv2
            | LayerKind::Conv2Transpose
            | LayerKind::DconvConv
            | LayerKind::PointPillars
            | LayerKind::MaxPool2d => {
                ctx.kernel_x = if params.kind.kernel_spans_channels() {
                    params.in_channels as u32
                } else {
                    params.kernel_length as u32
                };
                ctx.kernel_y = params.kernel_length as u32;
                ctx.rf_kernel_base = rf_discard - (ctx.kernel_x * ctx.kernel_y) as i32 * parallel_out;
                ctx.rf_bias_base = ctx.rf_kernel_base - parallel_out;
                ctx.rf_relu6_base = ctx.rf_bias_base - 1;

                ctx.setup.push(LaneConfig::MacShift(params.conv_result_shift_right));
                let reset = if params.kind == LayerKind::Conv2 && params.kernel_length == 1 {
                    MacResetMode::XIncrement
                } else {
                    MacResetMode::ZIncrement
                };
                ctx.setup.push(LaneConfig::MacResetMode(reset));
                ctx.setup.push(LaneConfig::MacInitSource(MacInitSource::Addr));
            }
            LayerKind::DconvDeform => {
                ctx.setup.push(LaneConfig::MacShift(params.conv_result_shift_right));
                ctx.setup.push(LaneConfig::MulShift(params.conv_result_shift_right));
            }
            LayerKind::Add => ctx.rf_relu6_base = rf_discard - 1,
            LayerKind::Mul => {
                ctx.rf_relu6_base = rf_discard - 1;
                ctx.setup.push(LaneConfig::MulShift(params.conv_result_shift_right));
            }
            LayerKind::GlobalAvgPool2d => ctx.setup.push(LaneConfig::GlobalAvgPoolConstants),
            _ => {}
        }

        if params.kind == LayerKind::Conv2Transpose {
            ctx.setup.push(LaneConfig::ConvTransposeTable { stride: params.stride });
        }
        if params.kind == LayerKind::AvgPool2d {
            ctx.setup.push(LaneConfig::MacShift(params.pool_avg_shiftr as i16));
            ctx.setup.push(LaneConfig::MacResetMode(MacResetMode::ZIncrement));
            ctx.setup.push(LaneConfig::MacInitSource(MacInitSource::Zero));
        }
        if params.kind == LayerKind::DconvConv {
            ctx.rf_kernel_base = rf_discard - params.kernel_length as i32;
            ctx.rf_bias_base = ctx.rf_kernel_base - 1;
            ctx.rf_relu6_base = ctx.rf_bias_base - 1;
            ctx.kernel_x = params.kernel_length as u32;
            ctx.kernel_y = 1;
        }

        if params.activation == Activation::Relu6 {
            if params.relu6_shift_left <= RELU6_MAX_SHIFT {
                ctx.setup.push(LaneConfig::Relu6Constant {
                    shift_left: params.relu6_shift_left,
                    rf_addr: ctx.rf_relu6_base,
                });
            } else {
                // 6 exceeds the representable range, so clipping never triggers
                ctx.activation = Activation::Rect;
            }
        }
        ctx
    }

    /// Extent of the dynamic compute commands of the batch just fetched.
    ///
    /// A batch loads the data the following compute commands consume, so
    /// the new extent takes effect one batch later.
    fn advance_dynamic_extent(&mut self, max_transfer: u16) {
        self.max_zend = self.next_max_zend;
        self.next_max_zend = max_transfer.saturating_sub(1);
    }

    fn is_dynamic(&self, op: Opcode) -> bool {
        self.kind == LayerKind::PointPillars
            && matches!(op, Opcode::Conv1dStart | Opcode::Conv1dAdd | Opcode::ReluPoolScatter)
    }
}

struct Dispatcher<'a> {
    acc: &'a mut dyn Accelerator,
    ctx: SchedulingContext,
    params: &'a LayerParams,
}

impl Dispatcher<'_> {
    fn call(&mut self, kernel: Kernel, cmd: &Compute) {
        self.acc.kernel(&KernelCall {
            kernel,
            cmd: *cmd,
            compensate: self.ctx.compensate,
        });
    }

    fn preload(&mut self, cmd: &Compute, with_bias: bool) {
        if with_bias {
            self.call(Kernel::BiasLoad { lane: 0, buffer: cmd.bias_l0 }, cmd);
            self.call(Kernel::BiasLoad { lane: 1, buffer: cmd.bias_l1 }, cmd);
        }
        self.call(Kernel::KernelLoad { lane: 0, buffer: cmd.kernel_l0 }, cmd);
        self.call(Kernel::KernelLoad { lane: 1, buffer: cmd.kernel_l1 }, cmd);
    }

    fn nops(&mut self, count: u8) {
        if count > 0 {
            self.acc.nops(count as u32);
        }
    }

    fn compute(&mut self, cmd: &Compute) {
        let mut cmd = *cmd;
        if self.ctx.is_dynamic(cmd.op) {
            cmd.zend = self.ctx.max_zend;
            cmd.nops = self.ctx.w2r_bubble.saturating_sub(self.ctx.max_zend as u32).min(u8::MAX as u32) as u8;
        }
        let cmd = &cmd;

        match cmd.op {
            Opcode::ConvStart => {
                self.preload(cmd, true);
                self.call(Kernel::Conv2d, cmd);
            }
            Opcode::ConvAdd => {
                self.preload(cmd, false);
                self.call(Kernel::Conv2dAdd, cmd);
            }
            Opcode::Conv1dStart => {
                self.preload(cmd, true);
                self.call(Kernel::Conv1d, cmd);
            }
            Opcode::Conv1dAdd => self.call(Kernel::Conv1dAdd, cmd),
            Opcode::ConvTransposeStart => {
                self.preload(cmd, true);
                self.call(Kernel::ConvTranspose, cmd);
            }
            Opcode::ConvTransposeAdd => {
                self.preload(cmd, false);
                self.call(Kernel::ConvTransposeAdd, cmd);
            }
            Opcode::DconvConvStart => {
                self.preload(cmd, true);
                self.call(Kernel::DconvConv, cmd);
            }
            Opcode::DconvConvAdd => {
                self.preload(cmd, false);
                self.call(Kernel::DconvConvAdd, cmd);
            }
            Opcode::DconvDeform8x8 => {
                for y in 0..2u16 {
                    for x in 0..2u16 {
                        let block = y * DEFORM_BLOCK * DEFORM_CHUNK_WIDTH + x * DEFORM_BLOCK;
                        let offsets = cmd
                            .deform_offset
                            .wrapping_add(y * DEFORM_BLOCK * DEFORM_CHUNK_WIDTH * 3 * DEFORM_KERNEL_LENGTH)
                            .wrapping_add(x * DEFORM_BLOCK);
                        let kernel = Kernel::DeformBlock {
                            input: cmd.buffer,
                            offsets,
                            output: cmd.deform_output.wrapping_add(block * DEFORM_KERNEL_LENGTH),
                            static_offsets: self
                                .params
                                .deform_static_offsets
                                .wrapping_add(block * DEFORM_KERNEL_LENGTH),
                        };
                        self.call(kernel, cmd);
                    }
                }
            }
            Opcode::ReluPoolScatter => {
                self.nops(cmd.nops);
                self.call(Kernel::Activation(Activation::Rect), cmd);
                self.call(Kernel::PoolScatter, cmd);
            }
            Opcode::SetMasks => {
                self.acc.configure(LaneConfig::Masks {
                    cluster: cmd.cluster_mask(),
                    unit: cmd.unit_mask(),
                });
                let points = self.ctx.point_counts.get(cmd.offset as usize).copied().unwrap_or(0);
                self.ctx.max_zend = points.saturating_sub(1);
            }
            Opcode::ResetIndices => self.call(Kernel::ResetIndices, cmd),
            Opcode::Add => {
                self.nops(cmd.nops);
                self.call(Kernel::Elementwise, cmd);
            }
            Opcode::Mul => {
                self.nops(cmd.nops);
                // element-wise multiplication and leaky ReLU share the multiplier shift
                let swap = self.ctx.activation == Activation::Leaky && self.ctx.conv_shift != self.ctx.leaky_shift;
                if swap {
                    self.acc.wait(SyncKind::Lanes);
                    self.acc.configure(LaneConfig::MulShift(self.ctx.conv_shift));
                }
                self.call(Kernel::Elementwise, cmd);
                if swap {
                    self.acc.wait(SyncKind::Lanes);
                    self.acc.configure(LaneConfig::MulShift(self.ctx.leaky_shift));
                }
            }
            Opcode::Concatenate => self.call(Kernel::Concatenate, cmd),
            Opcode::DepthToSpace => self.call(Kernel::DepthToSpace, cmd),
            Opcode::Avgpool2d => {
                self.call(Kernel::AvgPoolLoadKernel, cmd);
                self.call(Kernel::AvgPool, cmd);
                self.call(Kernel::AvgPoolStore, cmd);
            }
            Opcode::MaxPooling => self.call(Kernel::MaxPool2d, cmd),
            Opcode::GlobalAvgpool2dStart => {
                self.acc.wait(SyncKind::Lanes);
                self.acc.configure(LaneConfig::MacResetMode(MacResetMode::Once));
                self.acc.configure(LaneConfig::MacInitSource(MacInitSource::Zero));
                self.acc.configure(LaneConfig::MacShift(GLOBAL_AVGPOOL_MAC_SHIFT));
                self.call(Kernel::GlobalAvgPoolAdd, cmd);
                self.acc.wait(SyncKind::Lanes);
                self.acc.configure(LaneConfig::MacResetMode(MacResetMode::Never));
            }
            Opcode::GlobalAvgpool2dAdd => self.call(Kernel::GlobalAvgPoolAdd, cmd),
            Opcode::GlobalAvgpool2dStoreIntermediates => self.call(Kernel::GlobalAvgPoolStoreIntermediates, cmd),
            Opcode::GlobalAvgpool2dSumIntermediates => self.call(Kernel::GlobalAvgPoolSumIntermediates, cmd),
            Opcode::GlobalAvgpool2dDivide => self.call(Kernel::GlobalAvgPoolDivide, cmd),
            Opcode::ShiftStore => {
                self.nops(cmd.nops);
                self.call(Kernel::ShiftStore, cmd);
            }
            Opcode::ShiftStoreUpsample => {
                self.nops(cmd.nops);
                self.call(Kernel::ShiftStoreUpsample, cmd);
            }
            Opcode::Maxpool2x2Fused => {
                self.nops(cmd.nops);
                self.call(Kernel::MaxPool2x2, cmd);
            }
            Opcode::ActivationFused => {
                self.nops(cmd.nops);
                match self.ctx.activation {
                    Activation::None => {
                        warn!(layer = self.params.number, "fused activation without an activation function, skipped")
                    }
                    activation => self.call(Kernel::Activation(activation), cmd),
                }
            }
        }
    }
}

/// Layers whose work bypasses the segment loop.
fn run_special(acc: &mut dyn Accelerator, layer: &Layer) -> bool {
    match layer.params.kind {
        LayerKind::DynamicAxis => {
            acc.dynamic_shape(&layer.params);
            true
        }
        LayerKind::ScatterToGrid => {
            let commands: Vec<Scatter> = layer
                .segments
                .iter()
                .filter_map(|s| match s {
                    Segment::Scatter(c) => Some(*c),
                    _ => None,
                })
                .collect();
            let via_dma = commands.first().is_some_and(|c| c.use_vpro_dma);
            acc.scatter(&layer.params, &commands, via_dma);
            true
        }
        _ => false,
    }
}

/// Execute one layer's stream.
///
/// A malformed block marker aborts the layer; everything issued before
/// it has already reached the hardware.
pub fn run_layer(acc: &mut dyn Accelerator, layer: &Layer, hw: &HardwareConfig) -> Result<LayerStats> {
    let params = &layer.params;
    let start = acc.cycles();
    let mut stats = LayerStats {
        number: params.number,
        kind: params.kind,
        ..LayerStats::default()
    };
    if run_special(acc, layer) {
        stats.cycles = acc.cycles().saturating_sub(start);
        return Ok(stats);
    }

    acc.set_pad(&params.pad);
    let mut ctx = SchedulingContext::for_layer(params, hw);
    for setting in &ctx.setup {
        acc.configure(*setting);
    }
    if params.kind == LayerKind::PointPillars {
        ctx.point_counts = acc.point_counts(params);
    }
    debug!(
        layer = params.number,
        kind = ?params.kind,
        segments = layer.segments.len(),
        compensate = ctx.compensate,
        "layer setup"
    );

    let segments = &layer.segments;
    let mut d = Dispatcher { acc, ctx, params };
    let mut index = 0;
    while index < segments.len() {
        let segment = &segments[index];
        stats.count(segment);
        match segment {
            Segment::Block { .. } => {
                let body = ir::block_body(segments, index)?;
                if d.ctx.kind == LayerKind::PointPillars {
                    let max_transfer = d.acc.dynamic_block(body, &d.ctx.point_counts);
                    d.ctx.advance_dynamic_extent(max_transfer);
                }
                d.acc.dma_block(body);
                for record in body {
                    stats.count(record);
                }
                index += body.len();
            }
            Segment::Transfer(_) | Segment::Loop(_) => d.acc.dma_issue(segment),
            Segment::Compute(cmd) => d.compute(cmd),
            Segment::Sync(kind) => d.acc.wait(*kind),
            Segment::Padding(pad) => d.acc.set_pad(pad),
            Segment::Scatter(_) => {
                warn!(layer = params.number, at = index, "scatter command outside a scatter layer ignored");
            }
        }
        index += 1;
    }
    stats.cycles = d.acc.cycles().saturating_sub(start);
    Ok(stats)
}
