//! The closed operation set and its per-code option records.
//!
//! Each [`Op`] variant holds exactly the option fields its operation code
//! requires, so invalid option combinations cannot be constructed. Stride
//! and filter pairs are `[height, width]`.

use std::fmt;

use crate::ValidationError;

/// An activation merged into a preceding operation's execution.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FuseCode {
    /// No fused activation.
    #[default]
    None,
    /// Clamp to `[0, +inf)`.
    Relu,
    /// Clamp to `[-1, 1]`.
    Relu1,
    /// Clamp to `[0, 6]`.
    Relu6,
}

impl fmt::Display for FuseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "NONE",
            Self::Relu => "RELU",
            Self::Relu1 => "RELU1",
            Self::Relu6 => "RELU6",
        })
    }
}

/// A symbolic padding policy, resolved to explicit amounts at compile time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PaddingCode {
    /// Pad so the output covers every input position at stride 1.
    Same,
    /// No padding; the window never leaves the input.
    Valid,
}

impl fmt::Display for PaddingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Same => "SAME",
            Self::Valid => "VALID",
        })
    }
}

/// Padding for a windowed operation, either symbolic or explicit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Padding {
    /// Resolved from shapes and stride during compilation.
    Coded(PaddingCode),
    /// Explicit per-edge amounts in elements.
    Explicit {
        /// Columns added on the left.
        left: u32,
        /// Columns added on the right.
        right: u32,
        /// Rows added on top.
        top: u32,
        /// Rows added on the bottom.
        bottom: u32,
    },
}

/// A graph operation: one variant per operation code.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    /// Element-wise addition with broadcasting.
    Add {
        /// Fused activation applied to the result.
        fuse: FuseCode,
    },
    /// Element-wise multiplication with broadcasting.
    Mul {
        /// Fused activation applied to the result.
        fuse: FuseCode,
    },
    /// 2-D convolution over NHWC input with an `[out_ch, kh, kw, in_ch]`
    /// filter and a per-channel bias.
    Conv2d {
        /// Spatial padding.
        padding: Padding,
        /// Window step, `[height, width]`.
        stride: [u32; 2],
        /// Fused activation applied to the result.
        fuse: FuseCode,
    },
    /// Depthwise 2-D convolution with a `[1, kh, kw, out_ch]` filter where
    /// `out_ch = in_ch * depth_multiplier`.
    DepthwiseConv2d {
        /// Spatial padding.
        padding: Padding,
        /// Window step, `[height, width]`.
        stride: [u32; 2],
        /// Output channels produced per input channel.
        depth_multiplier: u32,
        /// Fused activation applied to the result.
        fuse: FuseCode,
    },
    /// Average pooling; padded cells are excluded from the mean.
    AveragePool2d {
        /// Spatial padding.
        padding: Padding,
        /// Window step, `[height, width]`.
        stride: [u32; 2],
        /// Window extent, `[height, width]`.
        filter: [u32; 2],
        /// Fused activation applied to the result.
        fuse: FuseCode,
    },
    /// Max pooling.
    MaxPool2d {
        /// Spatial padding.
        padding: Padding,
        /// Window step, `[height, width]`.
        stride: [u32; 2],
        /// Window extent, `[height, width]`.
        filter: [u32; 2],
        /// Fused activation applied to the result.
        fuse: FuseCode,
    },
    /// Dense layer: inputs are data, `[units, input_size]` weights, and a
    /// per-unit bias.
    FullyConnected {
        /// Fused activation applied to the result.
        fuse: FuseCode,
    },
    /// Concatenation of the inputs along one axis.
    Concatenation {
        /// Axis to join along.
        axis: u32,
    },
    /// Reinterpret the input with a new shape. The second input is a
    /// constant i32 tensor holding the target dimensions (one may be -1).
    Reshape,
    /// Softmax over the last dimension.
    Softmax {
        /// Positive scaling applied to the logits.
        beta: f32,
    },
    /// Element-wise logistic sigmoid.
    Logistic,
    /// Element-wise `max(0, x)`.
    Relu,
    /// Element-wise clamp to `[-1, 1]`.
    Relu1,
    /// Element-wise clamp to `[0, 6]`.
    Relu6,
    /// Element-wise hyperbolic tangent.
    Tanh,
    /// Bilinear resize of the spatial dimensions.
    ResizeBilinear {
        /// Output rows.
        out_height: u32,
        /// Output columns.
        out_width: u32,
    },
    /// Convert a quantized tensor to float.
    Dequantize,
}

impl Op {
    /// Operation code name, used in plan dumps and error messages.
    pub fn code_name(&self) -> &'static str {
        match self {
            Self::Add { .. } => "ADD",
            Self::Mul { .. } => "MUL",
            Self::Conv2d { .. } => "CONV_2D",
            Self::DepthwiseConv2d { .. } => "DEPTHWISE_CONV_2D",
            Self::AveragePool2d { .. } => "AVERAGE_POOL_2D",
            Self::MaxPool2d { .. } => "MAX_POOL_2D",
            Self::FullyConnected { .. } => "FULLY_CONNECTED",
            Self::Concatenation { .. } => "CONCATENATION",
            Self::Reshape => "RESHAPE",
            Self::Softmax { .. } => "SOFTMAX",
            Self::Logistic => "LOGISTIC",
            Self::Relu => "RELU",
            Self::Relu1 => "RELU1",
            Self::Relu6 => "RELU6",
            Self::Tanh => "TANH",
            Self::ResizeBilinear { .. } => "RESIZE_BILINEAR",
            Self::Dequantize => "DEQUANTIZE",
        }
    }

    /// Expected number of inputs, or `None` for variadic operations.
    pub fn input_arity(&self) -> Option<usize> {
        match self {
            Self::Add { .. } | Self::Mul { .. } | Self::Reshape => Some(2),
            Self::Conv2d { .. } | Self::DepthwiseConv2d { .. } | Self::FullyConnected { .. } => {
                Some(3)
            }
            Self::Concatenation { .. } => None,
            Self::AveragePool2d { .. }
            | Self::MaxPool2d { .. }
            | Self::Softmax { .. }
            | Self::Logistic
            | Self::Relu
            | Self::Relu1
            | Self::Relu6
            | Self::Tanh
            | Self::ResizeBilinear { .. }
            | Self::Dequantize => Some(1),
        }
    }

    /// The fused activation carried in this operation's options.
    pub fn fuse(&self) -> FuseCode {
        match self {
            Self::Add { fuse }
            | Self::Mul { fuse }
            | Self::Conv2d { fuse, .. }
            | Self::DepthwiseConv2d { fuse, .. }
            | Self::AveragePool2d { fuse, .. }
            | Self::MaxPool2d { fuse, .. }
            | Self::FullyConnected { fuse } => *fuse,
            _ => FuseCode::None,
        }
    }

    /// Whether this operation's options include a fuse slot.
    pub fn accepts_fuse(&self) -> bool {
        matches!(
            self,
            Self::Add { .. }
                | Self::Mul { .. }
                | Self::Conv2d { .. }
                | Self::DepthwiseConv2d { .. }
                | Self::AveragePool2d { .. }
                | Self::MaxPool2d { .. }
                | Self::FullyConnected { .. }
        )
    }

    /// The standalone-activation form of this op, if it has one.
    ///
    /// These are the operations a later compilation stage may merge into a
    /// preceding operation's fuse slot.
    pub fn as_activation(&self) -> Option<FuseCode> {
        match self {
            Self::Relu => Some(FuseCode::Relu),
            Self::Relu1 => Some(FuseCode::Relu1),
            Self::Relu6 => Some(FuseCode::Relu6),
            _ => None,
        }
    }

    /// Reject option values that are invalid regardless of operand shapes.
    pub(crate) fn check_options(&self) -> Result<(), ValidationError> {
        let bad = |reason: String| ValidationError::InvalidOption {
            op: self.code_name(),
            reason,
        };
        match self {
            Self::Conv2d { stride, .. } | Self::DepthwiseConv2d { stride, .. } => {
                if stride[0] == 0 || stride[1] == 0 {
                    return Err(bad(format!(
                        "stride must be positive, got [{}, {}]",
                        stride[0], stride[1]
                    )));
                }
            }
            Self::AveragePool2d { stride, filter, .. } | Self::MaxPool2d { stride, filter, .. } => {
                if stride[0] == 0 || stride[1] == 0 {
                    return Err(bad(format!(
                        "stride must be positive, got [{}, {}]",
                        stride[0], stride[1]
                    )));
                }
                if filter[0] == 0 || filter[1] == 0 {
                    return Err(bad(format!(
                        "filter must be positive, got [{}, {}]",
                        filter[0], filter[1]
                    )));
                }
            }
            Self::Softmax { beta } => {
                if !beta.is_finite() || *beta <= 0.0 {
                    return Err(bad(format!("beta must be positive and finite, got {beta}")));
                }
            }
            Self::ResizeBilinear {
                out_height,
                out_width,
            } => {
                if *out_height == 0 || *out_width == 0 {
                    return Err(bad(format!(
                        "output extent must be positive, got [{out_height}, {out_width}]"
                    )));
                }
            }
            _ => {}
        }
        if let Self::DepthwiseConv2d {
            depth_multiplier, ..
        } = self
        {
            if *depth_multiplier == 0 {
                return Err(bad("depth_multiplier must be positive".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv(stride: [u32; 2]) -> Op {
        Op::Conv2d {
            padding: Padding::Coded(PaddingCode::Same),
            stride,
            fuse: FuseCode::None,
        }
    }

    #[test]
    fn code_names() {
        assert_eq!(conv([1, 1]).code_name(), "CONV_2D");
        assert_eq!(Op::Dequantize.code_name(), "DEQUANTIZE");
        assert_eq!(Op::Reshape.code_name(), "RESHAPE");
    }

    #[test]
    fn arity_table() {
        assert_eq!(conv([1, 1]).input_arity(), Some(3));
        assert_eq!(Op::Add { fuse: FuseCode::None }.input_arity(), Some(2));
        assert_eq!(Op::Concatenation { axis: 0 }.input_arity(), None);
        assert_eq!(Op::Logistic.input_arity(), Some(1));
        assert_eq!(Op::Reshape.input_arity(), Some(2));
    }

    #[test]
    fn fuse_access() {
        let op = Op::FullyConnected {
            fuse: FuseCode::Relu6,
        };
        assert_eq!(op.fuse(), FuseCode::Relu6);
        assert!(op.accepts_fuse());
        assert_eq!(Op::Softmax { beta: 1.0 }.fuse(), FuseCode::None);
        assert!(!Op::Softmax { beta: 1.0 }.accepts_fuse());
    }

    #[test]
    fn activation_forms() {
        assert_eq!(Op::Relu.as_activation(), Some(FuseCode::Relu));
        assert_eq!(Op::Relu1.as_activation(), Some(FuseCode::Relu1));
        assert_eq!(Op::Relu6.as_activation(), Some(FuseCode::Relu6));
        assert_eq!(Op::Tanh.as_activation(), None);
        assert_eq!(Op::Logistic.as_activation(), None);
    }

    #[test]
    fn zero_stride_rejected() {
        assert!(conv([0, 1]).check_options().is_err());
        assert!(conv([1, 1]).check_options().is_ok());
    }

    #[test]
    fn bad_softmax_beta_rejected() {
        assert!(Op::Softmax { beta: 0.0 }.check_options().is_err());
        assert!(Op::Softmax { beta: -1.0 }.check_options().is_err());
        assert!(Op::Softmax { beta: f32::NAN }.check_options().is_err());
        assert!(Op::Softmax { beta: 1.0 }.check_options().is_ok());
    }

    #[test]
    fn fuse_code_display() {
        assert_eq!(format!("{}", FuseCode::None), "NONE");
        assert_eq!(format!("{}", FuseCode::Relu6), "RELU6");
        assert_eq!(format!("{}", PaddingCode::Same), "SAME");
    }
}
