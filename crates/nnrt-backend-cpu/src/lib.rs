#![warn(missing_docs)]
//! Reference software backend.
//!
//! Runs every kernel the compiler can produce, in plain loops on the
//! current thread. Quantized tensors are widened to f32, computed, and
//! requantized on store; `Reshape` and `Concatenation` move raw bytes and
//! never decode at all. Other backends are validated against this one.

use nnrt_backend_core::bytes::{f32_from_le, f32_to_le, i32_from_le};
use nnrt_backend_core::{
    Backend, BackendExecutionError, BackendProfile, Kernel, KernelOp, TensorView, TensorViewMut,
};
use nnrt_model::{DataType, FuseCode, Shape};

mod kernels;

/// The always-available software fallback backend.
#[derive(Debug, Default)]
pub struct CpuBackend;

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        "cpu-ref"
    }

    fn supports(&self, _kernel: &Kernel) -> bool {
        true
    }

    fn run(
        &self,
        kernel: &Kernel,
        inputs: &[TensorView<'_>],
        outputs: &mut [TensorViewMut<'_>],
    ) -> Result<(), BackendExecutionError> {
        match &kernel.op {
            KernelOp::Add => elementwise(kernel, inputs, outputs, |x, y| x + y),
            KernelOp::Mul => elementwise(kernel, inputs, outputs, |x, y| x * y),
            KernelOp::Conv2d { stride, pad } => {
                let input = decode(&inputs[0]);
                let filter = decode(&inputs[1]);
                let bias = conv_bias(&inputs[0], &inputs[1], &inputs[2]);
                let mut acc = vec![0.0; kernel.outputs[0].shape.elem_count()];
                kernels::conv2d(
                    &input,
                    dims4(&inputs[0].spec.shape),
                    &filter,
                    dims4(&inputs[1].spec.shape),
                    &bias,
                    [stride[0] as usize, stride[1] as usize],
                    [pad.top as usize, pad.left as usize],
                    &mut acc,
                    dims4(&kernel.outputs[0].shape),
                );
                store(kernel, &mut acc, &mut outputs[0]);
            }
            KernelOp::DepthwiseConv2d {
                stride,
                pad,
                depth_multiplier,
            } => {
                let input = decode(&inputs[0]);
                let filter = decode(&inputs[1]);
                let bias = conv_bias(&inputs[0], &inputs[1], &inputs[2]);
                let mut acc = vec![0.0; kernel.outputs[0].shape.elem_count()];
                kernels::depthwise_conv2d(
                    &input,
                    dims4(&inputs[0].spec.shape),
                    &filter,
                    dims4(&inputs[1].spec.shape),
                    &bias,
                    [stride[0] as usize, stride[1] as usize],
                    *depth_multiplier as usize,
                    [pad.top as usize, pad.left as usize],
                    &mut acc,
                    dims4(&kernel.outputs[0].shape),
                );
                store(kernel, &mut acc, &mut outputs[0]);
            }
            KernelOp::AveragePool2d {
                stride,
                filter,
                pad,
            } => {
                let input = decode(&inputs[0]);
                let mut acc = vec![0.0; kernel.outputs[0].shape.elem_count()];
                kernels::avg_pool2d(
                    &input,
                    dims4(&inputs[0].spec.shape),
                    [filter[0] as usize, filter[1] as usize],
                    [stride[0] as usize, stride[1] as usize],
                    [pad.top as usize, pad.left as usize],
                    &mut acc,
                    dims4(&kernel.outputs[0].shape),
                );
                store(kernel, &mut acc, &mut outputs[0]);
            }
            KernelOp::MaxPool2d {
                stride,
                filter,
                pad,
            } => {
                let input = decode(&inputs[0]);
                let mut acc = vec![0.0; kernel.outputs[0].shape.elem_count()];
                kernels::max_pool2d(
                    &input,
                    dims4(&inputs[0].spec.shape),
                    [filter[0] as usize, filter[1] as usize],
                    [stride[0] as usize, stride[1] as usize],
                    [pad.top as usize, pad.left as usize],
                    &mut acc,
                    dims4(&kernel.outputs[0].shape),
                );
                store(kernel, &mut acc, &mut outputs[0]);
            }
            KernelOp::FullyConnected => {
                let input = decode(&inputs[0]);
                let weights = decode(&inputs[1]);
                let bias = conv_bias(&inputs[0], &inputs[1], &inputs[2]);
                let w_dims = &inputs[1].spec.shape.dims;
                let units = w_dims[0] as usize;
                let in_features = w_dims[1] as usize;
                let mut acc = vec![0.0; kernel.outputs[0].shape.elem_count()];
                kernels::fully_connected(&input, &weights, &bias, in_features, units, &mut acc);
                store(kernel, &mut acc, &mut outputs[0]);
            }
            KernelOp::Concatenation { axis } => {
                concat_bytes(*axis as usize, kernel, inputs, &mut outputs[0]);
            }
            KernelOp::Reshape => {
                outputs[0].data.copy_from_slice(inputs[0].data);
            }
            KernelOp::Softmax { beta } => {
                let input = decode(&inputs[0]);
                let inner = inner_extent(&inputs[0].spec.shape);
                let mut acc = vec![0.0; input.len()];
                kernels::softmax(&input, inner, *beta, &mut acc);
                store(kernel, &mut acc, &mut outputs[0]);
            }
            KernelOp::Logistic => {
                let input = decode(&inputs[0]);
                let mut acc = vec![0.0; input.len()];
                kernels::logistic(&input, &mut acc);
                store(kernel, &mut acc, &mut outputs[0]);
            }
            KernelOp::Relu => map_unary(kernel, inputs, outputs, |x| x.max(0.0)),
            KernelOp::Relu1 => map_unary(kernel, inputs, outputs, |x| x.clamp(-1.0, 1.0)),
            KernelOp::Relu6 => map_unary(kernel, inputs, outputs, |x| x.clamp(0.0, 6.0)),
            KernelOp::Tanh => {
                let input = decode(&inputs[0]);
                let mut acc = vec![0.0; input.len()];
                kernels::tanh(&input, &mut acc);
                store(kernel, &mut acc, &mut outputs[0]);
            }
            KernelOp::ResizeBilinear { .. } => {
                let input = decode(&inputs[0]);
                let mut acc = vec![0.0; kernel.outputs[0].shape.elem_count()];
                kernels::resize_bilinear(
                    &input,
                    dims4(&inputs[0].spec.shape),
                    &mut acc,
                    dims4(&kernel.outputs[0].shape),
                );
                store(kernel, &mut acc, &mut outputs[0]);
            }
            KernelOp::Dequantize => {
                let mut acc = decode(&inputs[0]);
                store(kernel, &mut acc, &mut outputs[0]);
            }
        }
        Ok(())
    }

    fn profile(&self) -> BackendProfile {
        BackendProfile {
            latency: 1,
            throughput: 1,
            power: 0,
        }
    }
}

fn elementwise<F: Fn(f32, f32) -> f32>(
    kernel: &Kernel,
    inputs: &[TensorView<'_>],
    outputs: &mut [TensorViewMut<'_>],
    f: F,
) {
    let a = decode(&inputs[0]);
    let b = decode(&inputs[1]);
    let mut acc = vec![0.0; kernel.outputs[0].shape.elem_count()];
    kernels::elementwise_broadcast(
        &a,
        &inputs[0].spec.shape.dims,
        &b,
        &inputs[1].spec.shape.dims,
        &mut acc,
        &kernel.outputs[0].shape.dims,
        f,
    );
    store(kernel, &mut acc, &mut outputs[0]);
}

fn map_unary<F: Fn(f32) -> f32>(
    kernel: &Kernel,
    inputs: &[TensorView<'_>],
    outputs: &mut [TensorViewMut<'_>],
    f: F,
) {
    let mut acc = decode(&inputs[0]);
    for v in acc.iter_mut() {
        *v = f(*v);
    }
    store(kernel, &mut acc, &mut outputs[0]);
}

/// Interleave input blocks along the concatenation axis, bytewise.
fn concat_bytes(
    axis: usize,
    kernel: &Kernel,
    inputs: &[TensorView<'_>],
    output: &mut TensorViewMut<'_>,
) {
    let elem = kernel.outputs[0].dtype.elem_bytes();
    let out_dims = &kernel.outputs[0].shape.dims;
    let outer: usize = out_dims[..axis].iter().map(|&d| d as usize).product();
    let mut offset = 0;
    for o in 0..outer {
        for view in inputs {
            let dims = &view.spec.shape.dims;
            let block: usize = dims[axis..].iter().map(|&d| d as usize).product::<usize>() * elem;
            output.data[offset..offset + block]
                .copy_from_slice(&view.data[o * block..(o + 1) * block]);
            offset += block;
        }
    }
}

/// Apply the kernel's fused activation, then encode into the output buffer.
fn store(kernel: &Kernel, acc: &mut [f32], output: &mut TensorViewMut<'_>) {
    apply_activation(acc, kernel.fuse);
    encode(acc, output);
}

fn apply_activation(values: &mut [f32], fuse: FuseCode) {
    match fuse {
        FuseCode::None => {}
        FuseCode::Relu => {
            for v in values.iter_mut() {
                if *v < 0.0 {
                    *v = 0.0;
                }
            }
        }
        FuseCode::Relu1 => {
            for v in values.iter_mut() {
                *v = v.clamp(-1.0, 1.0);
            }
        }
        FuseCode::Relu6 => {
            for v in values.iter_mut() {
                *v = v.clamp(0.0, 6.0);
            }
        }
    }
}

/// Widen a tensor's raw bytes to f32 working values.
fn decode(view: &TensorView<'_>) -> Vec<f32> {
    match view.spec.dtype {
        DataType::Float32 => f32_from_le(view.data),
        DataType::Int32 => i32_from_le(view.data).iter().map(|&v| v as f32).collect(),
        DataType::Quant8Asymm { scale, zero_point } => view
            .data
            .iter()
            .map(|&raw| (raw as i32 - zero_point) as f32 * scale)
            .collect(),
    }
}

/// Narrow f32 working values into a tensor's raw bytes.
fn encode(values: &[f32], output: &mut TensorViewMut<'_>) {
    match output.spec.dtype {
        DataType::Float32 => f32_to_le(values, output.data),
        DataType::Int32 => {
            for (chunk, &v) in output.data.chunks_exact_mut(4).zip(values) {
                chunk.copy_from_slice(&(v.round() as i32).to_le_bytes());
            }
        }
        DataType::Quant8Asymm { scale, zero_point } => {
            for (slot, &v) in output.data.iter_mut().zip(values) {
                let q = (v / scale).round() as i32 + zero_point;
                *slot = q.clamp(0, 255) as u8;
            }
        }
    }
}

/// Bias for conv-style kernels. Quantized graphs carry an i32 bias scaled
/// by `input_scale * weight_scale`; float graphs carry it as f32 directly.
fn conv_bias(input: &TensorView<'_>, filter: &TensorView<'_>, bias: &TensorView<'_>) -> Vec<f32> {
    match (input.spec.dtype, filter.spec.dtype) {
        (
            DataType::Quant8Asymm { scale: in_scale, .. },
            DataType::Quant8Asymm { scale: w_scale, .. },
        ) => i32_from_le(bias.data)
            .iter()
            .map(|&v| v as f32 * in_scale * w_scale)
            .collect(),
        _ => decode(bias),
    }
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

fn inner_extent(shape: &Shape) -> usize {
    shape.dims.last().map_or(1, |&d| d as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nnrt_backend_core::PadAmounts;
    use nnrt_model::OperandSpec;

    fn bytes_of(values: &[f32]) -> Vec<u8> {
        let mut out = vec![0u8; values.len() * 4];
        f32_to_le(values, &mut out);
        out
    }

    fn run_kernel(kernel: &Kernel, input_data: &[&[u8]]) -> Vec<u8> {
        let views: Vec<TensorView<'_>> = kernel
            .inputs
            .iter()
            .zip(input_data)
            .map(|(spec, data)| TensorView { spec, data })
            .collect();
        let mut out = vec![0u8; kernel.outputs[0].size_bytes()];
        {
            let mut out_views = vec![TensorViewMut {
                spec: &kernel.outputs[0],
                data: &mut out,
            }];
            CpuBackend.run(kernel, &views, &mut out_views).unwrap();
        }
        out
    }

    #[test]
    fn conv_kernel_with_fused_relu_clamps() {
        let kernel = Kernel {
            op: KernelOp::Conv2d {
                stride: [1, 1],
                pad: PadAmounts::default(),
            },
            fuse: FuseCode::Relu,
            inputs: vec![
                OperandSpec::new(DataType::Float32, &[1, 1, 2, 1]),
                OperandSpec::new(DataType::Float32, &[1, 1, 1, 1]),
                OperandSpec::new(DataType::Float32, &[1]),
            ],
            outputs: vec![OperandSpec::new(DataType::Float32, &[1, 1, 2, 1])],
        };
        let out = run_kernel(
            &kernel,
            &[&bytes_of(&[-3.0, 2.0]), &bytes_of(&[1.0]), &bytes_of(&[0.0])],
        );
        assert_eq!(f32_from_le(&out), vec![0.0, 2.0]);
    }

    #[test]
    fn add_kernel_broadcasts_bias_row() {
        let kernel = Kernel {
            op: KernelOp::Add,
            fuse: FuseCode::None,
            inputs: vec![
                OperandSpec::new(DataType::Float32, &[2, 2]),
                OperandSpec::new(DataType::Float32, &[2]),
            ],
            outputs: vec![OperandSpec::new(DataType::Float32, &[2, 2])],
        };
        let out = run_kernel(
            &kernel,
            &[
                &bytes_of(&[1.0, 2.0, 3.0, 4.0]),
                &bytes_of(&[10.0, 20.0]),
            ],
        );
        assert_eq!(f32_from_le(&out), vec![11.0, 22.0, 13.0, 24.0]);
    }

    #[test]
    fn reshape_kernel_copies_bytes() {
        let kernel = Kernel {
            op: KernelOp::Reshape,
            fuse: FuseCode::None,
            inputs: vec![OperandSpec::new(DataType::Float32, &[2, 2])],
            outputs: vec![OperandSpec::new(DataType::Float32, &[4])],
        };
        let data = bytes_of(&[1.0, 2.0, 3.0, 4.0]);
        let out = run_kernel(&kernel, &[&data]);
        assert_eq!(out, data);
    }

    #[test]
    fn concat_kernel_interleaves_channel_blocks() {
        let kernel = Kernel {
            op: KernelOp::Concatenation { axis: 1 },
            fuse: FuseCode::None,
            inputs: vec![
                OperandSpec::new(DataType::Float32, &[2, 1]),
                OperandSpec::new(DataType::Float32, &[2, 2]),
            ],
            outputs: vec![OperandSpec::new(DataType::Float32, &[2, 3])],
        };
        let out = run_kernel(
            &kernel,
            &[
                &bytes_of(&[1.0, 2.0]),
                &bytes_of(&[10.0, 11.0, 20.0, 21.0]),
            ],
        );
        assert_eq!(
            f32_from_le(&out),
            vec![1.0, 10.0, 11.0, 2.0, 20.0, 21.0]
        );
    }

    #[test]
    fn quantized_add_requantizes_result() {
        let q = DataType::Quant8Asymm {
            scale: 0.5,
            zero_point: 128,
        };
        let kernel = Kernel {
            op: KernelOp::Add,
            fuse: FuseCode::None,
            inputs: vec![
                OperandSpec::new(q, &[4]),
                OperandSpec::new(q, &[4]),
            ],
            outputs: vec![OperandSpec::new(q, &[4])],
        };
        // raw 130 ≡ 1.0, raw 132 ≡ 2.0; 1.0 + 2.0 = 3.0 ≡ raw 134.
        let a = [130u8, 130, 130, 130];
        let b = [132u8, 132, 132, 132];
        let out = run_kernel(&kernel, &[&a, &b]);
        assert_eq!(out, vec![134u8; 4]);
    }

    #[test]
    fn quantized_output_saturates_at_byte_range() {
        let q = DataType::Quant8Asymm {
            scale: 1.0,
            zero_point: 0,
        };
        let kernel = Kernel {
            op: KernelOp::Add,
            fuse: FuseCode::None,
            inputs: vec![OperandSpec::new(q, &[2]), OperandSpec::new(q, &[2])],
            outputs: vec![OperandSpec::new(q, &[2])],
        };
        let out = run_kernel(&kernel, &[&[200u8, 200], &[200u8, 1]]);
        assert_eq!(out, vec![255, 201]);
    }

    #[test]
    fn dequantize_kernel_widens_to_float() {
        let kernel = Kernel {
            op: KernelOp::Dequantize,
            fuse: FuseCode::None,
            inputs: vec![OperandSpec::new(
                DataType::Quant8Asymm {
                    scale: 0.25,
                    zero_point: 4,
                },
                &[3],
            )],
            outputs: vec![OperandSpec::new(DataType::Float32, &[3])],
        };
        let out = run_kernel(&kernel, &[&[0u8, 4, 8]]);
        assert_eq!(f32_from_le(&out), vec![-1.0, 0.0, 1.0]);
    }

    #[test]
    fn fully_connected_uses_weight_extents() {
        let kernel = Kernel {
            op: KernelOp::FullyConnected,
            fuse: FuseCode::None,
            inputs: vec![
                OperandSpec::new(DataType::Float32, &[1, 1, 1, 3]),
                OperandSpec::new(DataType::Float32, &[2, 3]),
                OperandSpec::new(DataType::Float32, &[2]),
            ],
            outputs: vec![OperandSpec::new(DataType::Float32, &[1, 2])],
        };
        let out = run_kernel(
            &kernel,
            &[
                &bytes_of(&[1.0, 2.0, 3.0]),
                &bytes_of(&[1.0, 0.0, 0.0, 0.0, 0.0, 1.0]),
                &bytes_of(&[0.0, 100.0]),
            ],
        );
        assert_eq!(f32_from_le(&out), vec![1.0, 103.0]);
    }

    #[test]
    fn standalone_relu_variants() {
        for (op, expect) in [
            (KernelOp::Relu, vec![0.0, 0.0, 0.5, 7.0]),
            (KernelOp::Relu1, vec![-1.0, 0.0, 0.5, 1.0]),
            (KernelOp::Relu6, vec![0.0, 0.0, 0.5, 6.0]),
        ] {
            let kernel = Kernel {
                op,
                fuse: FuseCode::None,
                inputs: vec![OperandSpec::new(DataType::Float32, &[4])],
                outputs: vec![OperandSpec::new(DataType::Float32, &[4])],
            };
            let out = run_kernel(&kernel, &[&bytes_of(&[-2.0, 0.0, 0.5, 7.0])]);
            assert_eq!(f32_from_le(&out), expect);
        }
    }

    #[test]
    fn softmax_kernel_normalizes_rows() {
        let kernel = Kernel {
            op: KernelOp::Softmax { beta: 1.0 },
            fuse: FuseCode::None,
            inputs: vec![OperandSpec::new(DataType::Float32, &[2, 2])],
            outputs: vec![OperandSpec::new(DataType::Float32, &[2, 2])],
        };
        let out = run_kernel(&kernel, &[&bytes_of(&[0.0, 0.0, 1.0, 3.0])]);
        let vals = f32_from_le(&out);
        assert!((vals[0] - 0.5).abs() < 1e-6);
        assert!((vals[2] + vals[3] - 1.0).abs() < 1e-6);
        assert!(vals[3] > vals[2]);
    }
}
