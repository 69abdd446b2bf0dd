//! Per-layer parameters carried in front of each layer's segment array.

use serde::{Deserialize, Serialize};

use super::{PadConfig, Segment};
use crate::error::{Result, StreamError};

/// Operation a layer performs; selects the scheduler's setup and handlers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    #[default]
    Unknown,
    Conv2,
    Add,
    Mul,
    Conv2Transpose,
    Conv1,
    Concatenate,
    DepthToSpace,
    ScatterToGrid,
    DynamicAxis,
    DconvDeform,
    DconvConv,
    PointPillars,
    MaxPool2d,
    AvgPool2d,
    GlobalAvgPool2d,
    GlobalMaxPool2d,
}

const LAYER_KINDS: [LayerKind; 17] = [
    LayerKind::Unknown,
    LayerKind::Conv2,
    LayerKind::Add,
    LayerKind::Mul,
    LayerKind::Conv2Transpose,
    LayerKind::Conv1,
    LayerKind::Concatenate,
    LayerKind::DepthToSpace,
    LayerKind::ScatterToGrid,
    LayerKind::DynamicAxis,
    LayerKind::DconvDeform,
    LayerKind::DconvConv,
    LayerKind::PointPillars,
    LayerKind::MaxPool2d,
    LayerKind::AvgPool2d,
    LayerKind::GlobalAvgPool2d,
    LayerKind::GlobalMaxPool2d,
];

impl LayerKind {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self> {
        LAYER_KINDS
            .get(code as usize)
            .copied()
            .ok_or(StreamError::UnknownLayerType(code))
    }

    /// Kernel width is the input channel count for these layer types.
    pub fn kernel_spans_channels(self) -> bool {
        matches!(self, LayerKind::Conv1 | LayerKind::PointPillars)
    }
}

/// Fused activation applied before storing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Leaky,
    Rect,
    Relu6,
    Sigmoid,
    Swish,
    #[default]
    None,
}

impl Activation {
    pub fn code(self) -> u8 {
        match self {
            Activation::Leaky => 0,
            Activation::Rect => 1,
            Activation::Relu6 => 2,
            Activation::Sigmoid => 3,
            Activation::Swish => 4,
            Activation::None => 255,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Activation::Leaky),
            1 => Ok(Activation::Rect),
            2 => Ok(Activation::Relu6),
            3 => Ok(Activation::Sigmoid),
            4 => Ok(Activation::Swish),
            255 => Ok(Activation::None),
            other => Err(StreamError::UnknownActivation(other)),
        }
    }
}

/// Placement of a feature map in host memory (informational).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MmImage {
    pub mm_base: u32,
    pub x: u32,
    pub y: u32,
    pub y_stride: u32,
    pub channels: u32,
}

fn one() -> u16 {
    1
}

/// Layer header fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerParams {
    pub in_channels: u16,
    pub out_channels: u16,
    pub number: u16,
    pub kind: LayerKind,
    pub stride: u16,
    pub kernel_length: u16,
    pub conv_groups: u32,
    pub dilation_rate_w: u16,
    pub dilation_rate_h: u16,
    pub seg_out_w: u16,
    pub seg_out_h: u16,
    pub seg_in_w: u16,
    pub seg_in_h: u16,
    pub conv_result_shift_right: i16,
    pub relu6_shift_left: i16,
    pub alpha_mulh_shift_right: i16,
    pub bias_shift_right: i16,
    pub store_shift_right: i16,
    pub elwise1_left_shift: i16,
    pub elwise0_left_shift: i16,
    pub elwise1_right_shift: i16,
    pub elwise0_right_shift: i16,
    pub pool_stride: u16,
    pub activation: Activation,
    pub alpha: u16,
    pub pad: PadConfig,
    pub input: MmImage,
    pub output: MmImage,
    pub axis: u16,
    pub dynamic_shape: u16,
    pub block_size: u16,
    pub last_layer_using_input: bool,
    pub first_layer_producing_output: bool,
    pub pool_size_w: u16,
    pub pool_size_h: u16,
    pub pool_size_ch: u16,
    pub pool_stride_w: u16,
    pub pool_stride_h: u16,
    pub pool_stride_ch: u16,
    pub pool_avg_shiftr: u16,
    pub deform_static_offsets: u16,
    pub deform_max_offset_x: u16,
    pub deform_max_offset_y: u16,
    #[serde(default = "one")]
    pub parallel_out: u16,
    #[serde(default = "one")]
    pub parallel_in: u16,
    pub subpixel_pad: PadConfig,
    pub input_pixels_w: u16,
    pub input_pixels_h: u16,
}

impl Default for LayerParams {
    fn default() -> Self {
        Self {
            in_channels: 0,
            out_channels: 0,
            number: 0,
            kind: LayerKind::Unknown,
            stride: 0,
            kernel_length: 0,
            conv_groups: 0,
            dilation_rate_w: 0,
            dilation_rate_h: 0,
            seg_out_w: 0,
            seg_out_h: 0,
            seg_in_w: 0,
            seg_in_h: 0,
            conv_result_shift_right: 0,
            relu6_shift_left: 0,
            alpha_mulh_shift_right: 0,
            bias_shift_right: 0,
            store_shift_right: 0,
            elwise1_left_shift: 0,
            elwise0_left_shift: 0,
            elwise1_right_shift: 0,
            elwise0_right_shift: 0,
            pool_stride: 0,
            activation: Activation::None,
            alpha: 0,
            pad: PadConfig::default(),
            input: MmImage::default(),
            output: MmImage::default(),
            axis: 0,
            dynamic_shape: 0,
            block_size: 0,
            last_layer_using_input: false,
            first_layer_producing_output: false,
            pool_size_w: 0,
            pool_size_h: 0,
            pool_size_ch: 0,
            pool_stride_w: 0,
            pool_stride_h: 0,
            pool_stride_ch: 0,
            pool_avg_shiftr: 0,
            deform_static_offsets: 0,
            deform_max_offset_x: 0,
            deform_max_offset_y: 0,
            parallel_out: 1,
            parallel_in: 1,
            subpixel_pad: PadConfig::default(),
            input_pixels_w: 0,
            input_pixels_h: 0,
        }
    }
}

impl LayerParams {
    pub fn new(kind: LayerKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    /// Output elements produced by one compute segment.
    pub fn vector_length(&self) -> u32 {
        self.seg_out_w as u32 * self.seg_out_h as u32 * self.parallel_out as u32
    }
}

/// One layer: header plus its command stream.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Layer {
    pub params: LayerParams,
    #[serde(default)]
    pub segments: Vec<Segment>,
}

impl Layer {
    pub fn new(params: LayerParams, segments: Vec<Segment>) -> Self {
        Self { params, segments }
    }
}
