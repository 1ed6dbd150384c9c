#![warn(missing_docs)]
//! Data-parallel backend for the heavy float kernels.
//!
//! Splits output tensors into rows and computes them on the rayon pool.
//! Only the window/matrix operations are covered, and only for all-f32
//! kernels; compilation falls back to the reference backend per step for
//! everything else.

use rayon::prelude::*;

use nnrt_backend_core::bytes::{f32_from_le, f32_to_le};
use nnrt_backend_core::{
    Backend, BackendExecutionError, BackendProfile, Kernel, KernelOp, TensorView, TensorViewMut,
};
use nnrt_model::{DataType, FuseCode, Shape};

/// Threaded backend covering convolution, pooling, dense, and resize
/// kernels on f32 tensors.
#[derive(Debug, Default)]
pub struct MtBackend;

impl Backend for MtBackend {
    fn name(&self) -> &str {
        "cpu-mt"
    }

    fn supports(&self, kernel: &Kernel) -> bool {
        let covered = matches!(
            kernel.op,
            KernelOp::Conv2d { .. }
                | KernelOp::DepthwiseConv2d { .. }
                | KernelOp::AveragePool2d { .. }
                | KernelOp::MaxPool2d { .. }
                | KernelOp::FullyConnected
                | KernelOp::ResizeBilinear { .. }
        );
        covered && all_f32(kernel)
    }

    fn run(
        &self,
        kernel: &Kernel,
        inputs: &[TensorView<'_>],
        outputs: &mut [TensorViewMut<'_>],
    ) -> Result<(), BackendExecutionError> {
        if !self.supports(kernel) {
            return Err(BackendExecutionError::Unsupported(kernel.to_string()));
        }
        let mut acc = vec![0.0; kernel.outputs[0].shape.elem_count()];
        match &kernel.op {
            KernelOp::Conv2d { stride, pad } => conv2d_rows(
                &f32_from_le(inputs[0].data),
                dims4(&inputs[0].spec.shape),
                &f32_from_le(inputs[1].data),
                dims4(&inputs[1].spec.shape),
                &f32_from_le(inputs[2].data),
                [stride[0] as usize, stride[1] as usize],
                1,
                false,
                [pad.top as usize, pad.left as usize],
                kernel.fuse,
                &mut acc,
                dims4(&kernel.outputs[0].shape),
            ),
            KernelOp::DepthwiseConv2d {
                stride,
                pad,
                depth_multiplier,
            } => conv2d_rows(
                &f32_from_le(inputs[0].data),
                dims4(&inputs[0].spec.shape),
                &f32_from_le(inputs[1].data),
                dims4(&inputs[1].spec.shape),
                &f32_from_le(inputs[2].data),
                [stride[0] as usize, stride[1] as usize],
                *depth_multiplier as usize,
                true,
                [pad.top as usize, pad.left as usize],
                kernel.fuse,
                &mut acc,
                dims4(&kernel.outputs[0].shape),
            ),
            KernelOp::AveragePool2d {
                stride,
                filter,
                pad,
            } => pool_rows(
                &f32_from_le(inputs[0].data),
                dims4(&inputs[0].spec.shape),
                [filter[0] as usize, filter[1] as usize],
                [stride[0] as usize, stride[1] as usize],
                [pad.top as usize, pad.left as usize],
                kernel.fuse,
                false,
                &mut acc,
                dims4(&kernel.outputs[0].shape),
            ),
            KernelOp::MaxPool2d {
                stride,
                filter,
                pad,
            } => pool_rows(
                &f32_from_le(inputs[0].data),
                dims4(&inputs[0].spec.shape),
                [filter[0] as usize, filter[1] as usize],
                [stride[0] as usize, stride[1] as usize],
                [pad.top as usize, pad.left as usize],
                kernel.fuse,
                true,
                &mut acc,
                dims4(&kernel.outputs[0].shape),
            ),
            KernelOp::FullyConnected => {
                let weights = f32_from_le(inputs[1].data);
                let bias = f32_from_le(inputs[2].data);
                let w_dims = &inputs[1].spec.shape.dims;
                dense_rows(
                    &f32_from_le(inputs[0].data),
                    &weights,
                    &bias,
                    w_dims[1] as usize,
                    w_dims[0] as usize,
                    kernel.fuse,
                    &mut acc,
                );
            }
            KernelOp::ResizeBilinear { .. } => resize_rows(
                &f32_from_le(inputs[0].data),
                dims4(&inputs[0].spec.shape),
                &mut acc,
                dims4(&kernel.outputs[0].shape),
            ),
            other => {
                return Err(BackendExecutionError::Unsupported(other.to_string()));
            }
        }
        f32_to_le(&acc, outputs[0].data);
        Ok(())
    }

    fn profile(&self) -> BackendProfile {
        BackendProfile {
            latency: 0,
            throughput: 0,
            power: 1,
        }
    }
}

fn all_f32(kernel: &Kernel) -> bool {
    kernel
        .inputs
        .iter()
        .chain(kernel.outputs.iter())
        .all(|s| s.dtype == DataType::Float32)
}

fn activate(v: f32, fuse: FuseCode) -> f32 {
    match fuse {
        FuseCode::None => v,
        FuseCode::Relu => v.max(0.0),
        FuseCode::Relu1 => v.clamp(-1.0, 1.0),
        FuseCode::Relu6 => v.clamp(0.0, 6.0),
    }
}

/// Regular and depthwise convolution, one output row per work item.
///
/// `depthwise` selects the `[1, Kh, Kw, Co]` filter layout, where each
/// output channel reads a single input channel (`oc / depth_multiplier`).
#[allow(clippy::too_many_arguments)]
fn conv2d_rows(
    input: &[f32],
    input_shape: [usize; 4],
    filter: &[f32],
    filter_shape: [usize; 4],
    bias: &[f32],
    stride: [usize; 2],
    depth_multiplier: usize,
    depthwise: bool,
    pad: [usize; 2],
    fuse: FuseCode,
    output: &mut [f32],
    output_shape: [usize; 4],
) {
    let [_, h, w, ci] = input_shape;
    let [_, kh, kw, _] = filter_shape;
    let [_, ho, wo, co] = output_shape;
    let [sh, sw] = stride;
    let [pad_top, pad_left] = pad;
    let filter_co = filter_shape[if depthwise { 3 } else { 0 }];
    debug_assert_eq!(filter_co, co);

    output
        .par_chunks_mut(wo * co)
        .enumerate()
        .for_each(|(row, chunk)| {
            let batch = row / ho;
            let oy = row % ho;
            for ox in 0..wo {
                for oc in 0..co {
                    let mut sum = bias[oc];
                    for ky in 0..kh {
                        for kx in 0..kw {
                            let iy_padded = oy * sh + ky;
                            let ix_padded = ox * sw + kx;
                            if iy_padded < pad_top || ix_padded < pad_left {
                                continue;
                            }
                            let iy = iy_padded - pad_top;
                            let ix = ix_padded - pad_left;
                            if iy >= h || ix >= w {
                                continue;
                            }
                            let pixel = batch * (h * w * ci) + iy * (w * ci) + ix * ci;
                            if depthwise {
                                let ic = oc / depth_multiplier;
                                sum += input[pixel + ic] * filter[ky * (kw * co) + kx * co + oc];
                            } else {
                                for ic in 0..ci {
                                    sum += input[pixel + ic]
                                        * filter[oc * (kh * kw * ci) + ky * (kw * ci) + kx * ci + ic];
                                }
                            }
                        }
                    }
                    chunk[ox * co + oc] = activate(sum, fuse);
                }
            }
        });
}

/// Average or max pooling, one output row per work item.
#[allow(clippy::too_many_arguments)]
fn pool_rows(
    input: &[f32],
    input_shape: [usize; 4],
    filter: [usize; 2],
    stride: [usize; 2],
    pad: [usize; 2],
    fuse: FuseCode,
    take_max: bool,
    output: &mut [f32],
    output_shape: [usize; 4],
) {
    let [_, h, w, c] = input_shape;
    let [kh, kw] = filter;
    let [sh, sw] = stride;
    let [pad_top, pad_left] = pad;
    let [_, ho, wo, _] = output_shape;

    output
        .par_chunks_mut(wo * c)
        .enumerate()
        .for_each(|(row, chunk)| {
            let batch = row / ho;
            let oy = row % ho;
            for ox in 0..wo {
                for ch in 0..c {
                    let mut acc = if take_max { f32::NEG_INFINITY } else { 0.0 };
                    let mut count = 0usize;
                    for ky in 0..kh {
                        for kx in 0..kw {
                            let iy_padded = oy * sh + ky;
                            let ix_padded = ox * sw + kx;
                            if iy_padded < pad_top || ix_padded < pad_left {
                                continue;
                            }
                            let iy = iy_padded - pad_top;
                            let ix = ix_padded - pad_left;
                            if iy >= h || ix >= w {
                                continue;
                            }
                            let val = input[batch * (h * w * c) + iy * (w * c) + ix * c + ch];
                            if take_max {
                                if val > acc {
                                    acc = val;
                                }
                            } else {
                                acc += val;
                            }
                            count += 1;
                        }
                    }
                    if !take_max && count > 0 {
                        acc /= count as f32;
                    }
                    chunk[ox * c + ch] = activate(acc, fuse);
                }
            }
        });
}

/// Dense layer, one batch row per work item.
fn dense_rows(
    input: &[f32],
    weights: &[f32],
    bias: &[f32],
    in_features: usize,
    out_features: usize,
    fuse: FuseCode,
    output: &mut [f32],
) {
    output
        .par_chunks_mut(out_features)
        .enumerate()
        .for_each(|(row, chunk)| {
            let x = &input[row * in_features..(row + 1) * in_features];
            for (o, slot) in chunk.iter_mut().enumerate() {
                let mut sum = bias[o];
                for k in 0..in_features {
                    sum += x[k] * weights[o * in_features + k];
                }
                *slot = activate(sum, fuse);
            }
        });
}

/// Bilinear resize, one output row per work item.
fn resize_rows(
    input: &[f32],
    input_shape: [usize; 4],
    output: &mut [f32],
    output_shape: [usize; 4],
) {
    let [_, h, w, c] = input_shape;
    let [_, ho, wo, _] = output_shape;
    let scale_y = h as f32 / ho as f32;
    let scale_x = w as f32 / wo as f32;

    output
        .par_chunks_mut(wo * c)
        .enumerate()
        .for_each(|(row, chunk)| {
            let batch = row / ho;
            let oy = row % ho;
            let sy = oy as f32 * scale_y;
            let y0 = sy.floor() as usize;
            let y1 = (y0 + 1).min(h - 1);
            let fy = sy - y0 as f32;
            for ox in 0..wo {
                let sx = ox as f32 * scale_x;
                let x0 = sx.floor() as usize;
                let x1 = (x0 + 1).min(w - 1);
                let fx = sx - x0 as f32;
                for ch in 0..c {
                    let at = |y: usize, x: usize| input[batch * (h * w * c) + y * (w * c) + x * c + ch];
                    let top = at(y0, x0) * (1.0 - fx) + at(y0, x1) * fx;
                    let bottom = at(y1, x0) * (1.0 - fx) + at(y1, x1) * fx;
                    chunk[ox * c + ch] = top * (1.0 - fy) + bottom * fy;
                }
            }
        });
}

fn dims4(shape: &Shape) -> [usize; 4] {
    assert!(shape.rank() == 4, "expected a rank-4 tensor, got {shape}");
    [
        shape.dims[0] as usize,
        shape.dims[1] as usize,
        shape.dims[2] as usize,
        shape.dims[3] as usize,
    ]
}
