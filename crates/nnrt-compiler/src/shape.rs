//! Per-operation arity, shape, and type checking plus padding resolution.
//!
//! Turns each model operation into a [`Kernel`] with explicit padding,
//! verifying that the declared output operand matches the shape the
//! operation actually derives from its inputs.

use nnrt_backend_core::bytes::i32_from_le;
use nnrt_backend_core::{Kernel, KernelOp, PadAmounts};
use nnrt_model::{
    DataType, Model, Op, OperandId, OperandSpec, OperationId, Padding, PaddingCode, Shape,
};

use crate::CompileError;

/// A plan step before backend assignment.
#[derive(Clone, Debug)]
pub(crate) struct ResolvedStep {
    pub operation: OperationId,
    pub kernel: Kernel,
    pub inputs: Vec<OperandId>,
    pub outputs: Vec<OperandId>,
}

pub(crate) fn resolve_steps(
    model: &Model,
    order: &[OperationId],
) -> Result<Vec<ResolvedStep>, CompileError> {
    order.iter().map(|&id| resolve_step(model, id)).collect()
}

/// Coarse type classification: quantization parameters may differ between
/// operands of the same kind, the element encoding may not.
fn kind(dtype: DataType) -> &'static str {
    match dtype {
        DataType::Float32 => "f32",
        DataType::Int32 => "i32",
        DataType::Quant8Asymm { .. } => "q8a",
    }
}

fn dims4(shape: &Shape) -> Result<[u32; 4], String> {
    if shape.rank() != 4 {
        return Err(format!("expected a rank-4 NHWC tensor, got {shape}"));
    }
    Ok([shape.dims[0], shape.dims[1], shape.dims[2], shape.dims[3]])
}

/// Resolve symbolic padding against one spatial axis.
///
/// Returns (pad before, pad after, derived output extent).
fn resolve_axis(
    padding: &Padding,
    extent: u32,
    window: u32,
    stride: u32,
    axis: &str,
) -> Result<(u32, u32, u32), String> {
    match padding {
        Padding::Coded(PaddingCode::Valid) => {
            if extent < window {
                return Err(format!(
                    "VALID padding: {axis} extent {extent} is smaller than window {window}"
                ));
            }
            Ok((0, 0, (extent - window) / stride + 1))
        }
        Padding::Coded(PaddingCode::Same) => {
            let out = extent.div_ceil(stride);
            let needed = (out - 1) as i64 * stride as i64 + window as i64 - extent as i64;
            let total = needed.max(0) as u32;
            let before = total / 2;
            Ok((before, total - before, out))
        }
        Padding::Explicit {
            left,
            right,
            top,
            bottom,
        } => {
            let (before, after) = if axis == "height" {
                (*top, *bottom)
            } else {
                (*left, *right)
            };
            let padded = extent + before + after;
            if padded < window {
                return Err(format!(
                    "explicit padding: padded {axis} extent {padded} is smaller than window {window}"
                ));
            }
            Ok((before, after, (padded - window) / stride + 1))
        }
    }
}

/// Resolve padding over both spatial axes and derive the output extents.
fn resolve_pad(
    padding: &Padding,
    in_hw: [u32; 2],
    window: [u32; 2],
    stride: [u32; 2],
) -> Result<(PadAmounts, [u32; 2]), String> {
    let (top, bottom, out_h) = resolve_axis(padding, in_hw[0], window[0], stride[0], "height")?;
    let (left, right, out_w) = resolve_axis(padding, in_hw[1], window[1], stride[1], "width")?;
    Ok((
        PadAmounts {
            top,
            bottom,
            left,
            right,
        },
        [out_h, out_w],
    ))
}

fn expect_shape(declared: &Shape, derived: &[u32], what: &str) -> Result<(), String> {
    if declared.dims != derived {
        return Err(format!(
            "declared output shape {declared} does not match {what} {}",
            Shape::new(derived)
        ));
    }
    Ok(())
}

fn expect_kind(a: DataType, b: DataType, what: &str) -> Result<(), String> {
    if kind(a) != kind(b) {
        return Err(format!("{what}: {} vs {}", kind(a), kind(b)));
    }
    Ok(())
}

fn resolve_step(model: &Model, id: OperationId) -> Result<ResolvedStep, CompileError> {
    let node = model.operation(id);
    let fail = |reason: String| CompileError::ShapeMismatch {
        operation: id.0,
        op: node.op.code_name(),
        reason,
    };

    if let Some(want) = node.op.input_arity() {
        if node.inputs.len() != want {
            return Err(fail(format!(
                "expected {want} inputs, got {}",
                node.inputs.len()
            )));
        }
    } else if node.inputs.is_empty() {
        return Err(fail("expected at least one input".to_owned()));
    }
    if node.outputs.len() != 1 {
        return Err(fail(format!(
            "expected exactly one output, got {}",
            node.outputs.len()
        )));
    }

    let in_specs: Vec<OperandSpec> = node
        .inputs
        .iter()
        .map(|&i| model.operand(i).spec.clone())
        .collect();
    let out_spec = model.operand(node.outputs[0]).spec.clone();

    let op = resolve_kernel_op(model, node, &in_specs, &out_spec).map_err(fail)?;

    Ok(ResolvedStep {
        operation: id,
        kernel: Kernel {
            op,
            fuse: node.op.fuse(),
            inputs: in_specs,
            outputs: vec![out_spec],
        },
        inputs: node.inputs.clone(),
        outputs: node.outputs.clone(),
    })
}

fn resolve_kernel_op(
    model: &Model,
    node: &nnrt_model::Operation,
    in_specs: &[OperandSpec],
    out_spec: &OperandSpec,
) -> Result<KernelOp, String> {
    let data = &in_specs[0];
    match &node.op {
        Op::Add { .. } | Op::Mul { .. } => {
            let other = &in_specs[1];
            expect_kind(data.dtype, other.dtype, "input types differ")?;
            expect_kind(data.dtype, out_spec.dtype, "output type differs from inputs")?;
            let derived = broadcast(&data.shape.dims, &other.shape.dims).ok_or_else(|| {
                format!(
                    "shapes {} and {} do not broadcast",
                    data.shape, other.shape
                )
            })?;
            expect_shape(&out_spec.shape, &derived, "broadcast result")?;
            Ok(match node.op {
                Op::Add { .. } => KernelOp::Add,
                _ => KernelOp::Mul,
            })
        }
        Op::Conv2d {
            padding, stride, ..
        } => {
            let [n, h, w, ci] = dims4(&data.shape)?;
            let [co, kh, kw, fci] = dims4(&in_specs[1].shape)?;
            if fci != ci {
                return Err(format!(
                    "filter expects {fci} input channels, input has {ci}"
                ));
            }
            check_conv_types(data, &in_specs[1], &in_specs[2], out_spec, co)?;
            let (pad, [ho, wo]) = resolve_pad(padding, [h, w], [kh, kw], *stride)?;
            expect_shape(&out_spec.shape, &[n, ho, wo, co], "derived convolution shape")?;
            Ok(KernelOp::Conv2d {
                stride: *stride,
                pad,
            })
        }
        Op::DepthwiseConv2d {
            padding,
            stride,
            depth_multiplier,
            ..
        } => {
            let [n, h, w, ci] = dims4(&data.shape)?;
            let [one, kh, kw, co] = dims4(&in_specs[1].shape)?;
            if one != 1 {
                return Err(format!(
                    "depthwise filter must be [1, kh, kw, channels], got {}",
                    in_specs[1].shape
                ));
            }
            if co != ci * depth_multiplier {
                return Err(format!(
                    "filter has {co} channels, expected {ci} * multiplier {depth_multiplier}"
                ));
            }
            check_conv_types(data, &in_specs[1], &in_specs[2], out_spec, co)?;
            let (pad, [ho, wo]) = resolve_pad(padding, [h, w], [kh, kw], *stride)?;
            expect_shape(&out_spec.shape, &[n, ho, wo, co], "derived convolution shape")?;
            Ok(KernelOp::DepthwiseConv2d {
                stride: *stride,
                pad,
                depth_multiplier: *depth_multiplier,
            })
        }
        Op::AveragePool2d {
            padding,
            stride,
            filter,
            ..
        }
        | Op::MaxPool2d {
            padding,
            stride,
            filter,
            ..
        } => {
            let [n, h, w, c] = dims4(&data.shape)?;
            expect_kind(data.dtype, out_spec.dtype, "output type differs from input")?;
            let (pad, [ho, wo]) = resolve_pad(padding, [h, w], *filter, *stride)?;
            expect_shape(&out_spec.shape, &[n, ho, wo, c], "derived pooling shape")?;
            Ok(match node.op {
                Op::AveragePool2d { .. } => KernelOp::AveragePool2d {
                    stride: *stride,
                    filter: *filter,
                    pad,
                },
                _ => KernelOp::MaxPool2d {
                    stride: *stride,
                    filter: *filter,
                    pad,
                },
            })
        }
        Op::FullyConnected { .. } => {
            let weights = &in_specs[1];
            if weights.shape.rank() != 2 {
                return Err(format!(
                    "weights must be [units, features], got {}",
                    weights.shape
                ));
            }
            let units = weights.shape.dims[0];
            let features = weights.shape.dims[1] as usize;
            let count = data.shape.elem_count();
            if features == 0 || count % features != 0 {
                return Err(format!(
                    "input with {count} elements does not divide into {features}-element rows"
                ));
            }
            check_bias(data, weights, &in_specs[2], units)?;
            expect_kind(data.dtype, out_spec.dtype, "output type differs from input")?;
            let batches = (count / features) as u32;
            expect_shape(&out_spec.shape, &[batches, units], "derived dense shape")?;
            Ok(KernelOp::FullyConnected)
        }
        Op::Concatenation { axis } => {
            let rank = data.shape.rank();
            let axis_usize = *axis as usize;
            if axis_usize >= rank {
                return Err(format!("axis {axis} out of range for rank {rank}"));
            }
            let mut joined = data.shape.dims.clone();
            joined[axis_usize] = 0;
            for spec in in_specs {
                expect_kind(spec.dtype, out_spec.dtype, "input type differs from output")?;
                if spec.shape.rank() != rank {
                    return Err(format!(
                        "input ranks differ: {} vs {}",
                        spec.shape, data.shape
                    ));
                }
                for (d, (&got, &want)) in
                    spec.shape.dims.iter().zip(&data.shape.dims).enumerate()
                {
                    if d != axis_usize && got != want {
                        return Err(format!(
                            "inputs disagree on dimension {d}: {got} vs {want}"
                        ));
                    }
                }
                joined[axis_usize] += spec.shape.dims[axis_usize];
            }
            expect_shape(&out_spec.shape, &joined, "concatenated shape")?;
            Ok(KernelOp::Concatenation { axis: *axis })
        }
        Op::Reshape => {
            let target = &in_specs[1];
            if kind(target.dtype) != "i32" || target.shape.rank() != 1 {
                return Err(format!(
                    "reshape target must be a rank-1 i32 tensor, got {target}"
                ));
            }
            expect_kind(data.dtype, out_spec.dtype, "output type differs from input")?;
            if data.shape.elem_count() != out_spec.shape.elem_count() {
                return Err(format!(
                    "cannot reshape {} elements into {}",
                    data.shape.elem_count(),
                    out_spec.shape
                ));
            }
            if let Some(raw) = model.value(node.inputs[1]) {
                let dims = resolve_target_dims(&i32_from_le(raw), data.shape.elem_count())?;
                expect_shape(&out_spec.shape, &dims, "constant reshape target")?;
            }
            Ok(KernelOp::Reshape)
        }
        Op::Softmax { beta } => {
            elementwise_shapes(data, out_spec)?;
            Ok(KernelOp::Softmax { beta: *beta })
        }
        Op::Logistic => {
            elementwise_shapes(data, out_spec)?;
            Ok(KernelOp::Logistic)
        }
        Op::Relu => {
            elementwise_shapes(data, out_spec)?;
            Ok(KernelOp::Relu)
        }
        Op::Relu1 => {
            elementwise_shapes(data, out_spec)?;
            Ok(KernelOp::Relu1)
        }
        Op::Relu6 => {
            elementwise_shapes(data, out_spec)?;
            Ok(KernelOp::Relu6)
        }
        Op::Tanh => {
            elementwise_shapes(data, out_spec)?;
            Ok(KernelOp::Tanh)
        }
        Op::ResizeBilinear {
            out_height,
            out_width,
        } => {
            let [n, _, _, c] = dims4(&data.shape)?;
            expect_kind(data.dtype, out_spec.dtype, "output type differs from input")?;
            expect_shape(
                &out_spec.shape,
                &[n, *out_height, *out_width, c],
                "declared resize extents",
            )?;
            Ok(KernelOp::ResizeBilinear {
                out_height: *out_height,
                out_width: *out_width,
            })
        }
        Op::Dequantize => {
            if !data.dtype.is_quantized() {
                return Err(format!("input must be quantized, got {}", data.dtype));
            }
            if out_spec.dtype != DataType::Float32 {
                return Err(format!("output must be f32, got {}", out_spec.dtype));
            }
            expect_shape(&out_spec.shape, &data.shape.dims, "input shape")?;
            Ok(KernelOp::Dequantize)
        }
    }
}

fn elementwise_shapes(input: &OperandSpec, output: &OperandSpec) -> Result<(), String> {
    expect_kind(input.dtype, output.dtype, "output type differs from input")?;
    expect_shape(&output.shape, &input.shape.dims, "input shape")
}

/// Conv-family type rules: f32 graphs carry an f32 bias, quantized graphs an
/// i32 bias pre-scaled by input and filter scales.
fn check_conv_types(
    input: &OperandSpec,
    filter: &OperandSpec,
    bias: &OperandSpec,
    output: &OperandSpec,
    channels: u32,
) -> Result<(), String> {
    if kind(input.dtype) == "i32" {
        return Err("convolution does not accept i32 input".to_owned());
    }
    expect_kind(input.dtype, filter.dtype, "filter type differs from input")?;
    expect_kind(input.dtype, output.dtype, "output type differs from input")?;
    check_bias(input, filter, bias, channels)
}

fn check_bias(
    input: &OperandSpec,
    _filter: &OperandSpec,
    bias: &OperandSpec,
    channels: u32,
) -> Result<(), String> {
    if bias.shape.dims != [channels] {
        return Err(format!(
            "bias must be [{channels}], got {}",
            bias.shape
        ));
    }
    let want = if input.dtype.is_quantized() {
        "i32"
    } else {
        "f32"
    };
    if kind(bias.dtype) != want {
        return Err(format!("bias must be {want}, got {}", bias.dtype));
    }
    Ok(())
}

/// Numpy-style broadcasting, right-aligned; dimensions must match or be 1.
fn broadcast(a: &[u32], b: &[u32]) -> Option<Vec<u32>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0u32; rank];
    for i in 0..rank {
        let da = a.get(a.len().wrapping_sub(i + 1)).copied().unwrap_or(1);
        let db = b.get(b.len().wrapping_sub(i + 1)).copied().unwrap_or(1);
        out[rank - 1 - i] = if da == db || db == 1 {
            da
        } else if da == 1 {
            db
        } else {
            return None;
        };
    }
    Some(out)
}

/// Expand a constant reshape target, resolving at most one -1 wildcard.
fn resolve_target_dims(raw: &[i32], elem_count: usize) -> Result<Vec<u32>, String> {
    let mut dims = Vec::with_capacity(raw.len());
    let mut wildcard = None;
    let mut known: usize = 1;
    for (i, &d) in raw.iter().enumerate() {
        match d {
            -1 if wildcard.is_none() => {
                wildcard = Some(i);
                dims.push(0);
            }
            -1 => return Err("reshape target holds more than one -1".to_owned()),
            d if d > 0 => {
                known *= d as usize;
                dims.push(d as u32);
            }
            d => return Err(format!("reshape target dimension {d} is not positive")),
        }
    }
    if let Some(i) = wildcard {
        if known == 0 || elem_count % known != 0 {
            return Err(format!(
                "cannot infer -1: {elem_count} elements do not divide by {known}"
            ));
        }
        dims[i] = (elem_count / known) as u32;
    }
    Ok(dims)
}
