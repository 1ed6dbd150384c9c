//! Wire types for the serialized graph format, via prost derive.
//!
//! Hand-defined messages; field tags are part of the format and must not
//! change. Operation options live in a oneof so each operation carries
//! exactly the parameters its code needs.

use prost::Message;

/// Operand element-type constants.
pub mod data_type {
    pub const FLOAT32: i32 = 1;
    pub const INT32: i32 = 2;
    pub const QUANT8_ASYMM: i32 = 3;
}

/// Fused-activation constants.
pub mod fuse_code {
    pub const NONE: i32 = 0;
    pub const RELU: i32 = 1;
    pub const RELU1: i32 = 2;
    pub const RELU6: i32 = 3;
}

/// Padding-scheme constants.
pub mod padding_code {
    pub const SAME: i32 = 1;
    pub const VALID: i32 = 2;
    pub const EXPLICIT: i32 = 3;
}

/// Top-level graph container.
#[derive(Clone, PartialEq, Message)]
pub struct GraphDef {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "2")]
    pub operands: Vec<OperandDef>,
    #[prost(message, repeated, tag = "3")]
    pub operations: Vec<OperationDef>,
    #[prost(uint32, repeated, tag = "4")]
    pub inputs: Vec<u32>,
    #[prost(uint32, repeated, tag = "5")]
    pub outputs: Vec<u32>,
}

/// One declared operand: type, shape, and optional constant payload.
#[derive(Clone, PartialEq, Message)]
pub struct OperandDef {
    #[prost(int32, tag = "1")]
    pub dtype: i32,
    #[prost(uint32, repeated, tag = "2")]
    pub dims: Vec<u32>,
    /// Quantization scale; meaningful only for `QUANT8_ASYMM`.
    #[prost(float, tag = "3")]
    pub scale: f32,
    /// Quantization zero point; meaningful only for `QUANT8_ASYMM`.
    #[prost(sint32, tag = "4")]
    pub zero_point: i32,
    /// Little-endian element bytes; present makes the operand a constant.
    #[prost(bytes = "vec", optional, tag = "5")]
    pub data: Option<Vec<u8>>,
}

/// One operation: operand indices plus per-code options.
#[derive(Clone, PartialEq, Message)]
pub struct OperationDef {
    #[prost(uint32, repeated, tag = "1")]
    pub inputs: Vec<u32>,
    #[prost(uint32, repeated, tag = "2")]
    pub outputs: Vec<u32>,
    #[prost(
        oneof = "operation_def::Options",
        tags = "10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26"
    )]
    pub options: Option<operation_def::Options>,
}

pub mod operation_def {
    /// The operation code, selected by which options message is present.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Options {
        #[prost(message, tag = "10")]
        Add(super::FuseOptions),
        #[prost(message, tag = "11")]
        Mul(super::FuseOptions),
        #[prost(message, tag = "12")]
        Conv2d(super::Conv2dOptions),
        #[prost(message, tag = "13")]
        DepthwiseConv2d(super::DepthwiseConv2dOptions),
        #[prost(message, tag = "14")]
        AveragePool2d(super::Pool2dOptions),
        #[prost(message, tag = "15")]
        MaxPool2d(super::Pool2dOptions),
        #[prost(message, tag = "16")]
        FullyConnected(super::FuseOptions),
        #[prost(message, tag = "17")]
        Concatenation(super::ConcatOptions),
        #[prost(message, tag = "18")]
        Reshape(super::NoOptions),
        #[prost(message, tag = "19")]
        Softmax(super::SoftmaxOptions),
        #[prost(message, tag = "20")]
        Logistic(super::NoOptions),
        #[prost(message, tag = "21")]
        Relu(super::NoOptions),
        #[prost(message, tag = "22")]
        Relu1(super::NoOptions),
        #[prost(message, tag = "23")]
        Relu6(super::NoOptions),
        #[prost(message, tag = "24")]
        Tanh(super::NoOptions),
        #[prost(message, tag = "25")]
        ResizeBilinear(super::ResizeOptions),
        #[prost(message, tag = "26")]
        Dequantize(super::NoOptions),
    }
}

/// Options for codes that carry only a fused activation.
#[derive(Clone, PartialEq, Message)]
pub struct FuseOptions {
    #[prost(int32, tag = "1")]
    pub fuse: i32,
}

/// Options for operations without parameters.
#[derive(Clone, PartialEq, Message)]
pub struct NoOptions {}

/// Padding scheme, explicit amounts used only with `EXPLICIT`.
#[derive(Clone, PartialEq, Message)]
pub struct PaddingDef {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(uint32, tag = "2")]
    pub left: u32,
    #[prost(uint32, tag = "3")]
    pub right: u32,
    #[prost(uint32, tag = "4")]
    pub top: u32,
    #[prost(uint32, tag = "5")]
    pub bottom: u32,
}

/// Convolution parameters.
#[derive(Clone, PartialEq, Message)]
pub struct Conv2dOptions {
    #[prost(message, optional, tag = "1")]
    pub padding: Option<PaddingDef>,
    #[prost(uint32, tag = "2")]
    pub stride_h: u32,
    #[prost(uint32, tag = "3")]
    pub stride_w: u32,
    #[prost(int32, tag = "4")]
    pub fuse: i32,
}

/// Depthwise convolution parameters.
#[derive(Clone, PartialEq, Message)]
pub struct DepthwiseConv2dOptions {
    #[prost(message, optional, tag = "1")]
    pub padding: Option<PaddingDef>,
    #[prost(uint32, tag = "2")]
    pub stride_h: u32,
    #[prost(uint32, tag = "3")]
    pub stride_w: u32,
    #[prost(uint32, tag = "4")]
    pub depth_multiplier: u32,
    #[prost(int32, tag = "5")]
    pub fuse: i32,
}

/// Pooling parameters.
#[derive(Clone, PartialEq, Message)]
pub struct Pool2dOptions {
    #[prost(message, optional, tag = "1")]
    pub padding: Option<PaddingDef>,
    #[prost(uint32, tag = "2")]
    pub stride_h: u32,
    #[prost(uint32, tag = "3")]
    pub stride_w: u32,
    #[prost(uint32, tag = "4")]
    pub filter_h: u32,
    #[prost(uint32, tag = "5")]
    pub filter_w: u32,
    #[prost(int32, tag = "6")]
    pub fuse: i32,
}

/// Concatenation parameters.
#[derive(Clone, PartialEq, Message)]
pub struct ConcatOptions {
    #[prost(uint32, tag = "1")]
    pub axis: u32,
}

/// Softmax parameters.
#[derive(Clone, PartialEq, Message)]
pub struct SoftmaxOptions {
    #[prost(float, tag = "1")]
    pub beta: f32,
}

/// Bilinear resize parameters.
#[derive(Clone, PartialEq, Message)]
pub struct ResizeOptions {
    #[prost(uint32, tag = "1")]
    pub out_height: u32,
    #[prost(uint32, tag = "2")]
    pub out_width: u32,
}
