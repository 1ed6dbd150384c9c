use std::sync::Arc;

use nnrt_backend_core::{BackendPreference, BackendRegistry};
use nnrt_backend_cpu::CpuBackend;
use nnrt_backend_mt::MtBackend;
use nnrt_compiler::CompiledPlan;
use nnrt_model::{DataType, FuseCode, Model, ModelBuilder, Op, OperandSpec};
use nnrt_runtime::{Execution, MemoryPool};

/// Registry with the reference CPU backend as fallback plus the threaded one.
#[allow(dead_code)]
pub fn registry() -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    registry.register_fallback(Arc::new(CpuBackend));
    registry.register(Arc::new(MtBackend));
    registry
}

/// Compile under the default preference, panicking on failure.
#[allow(dead_code)]
pub fn compile(model: &Arc<Model>) -> Arc<CompiledPlan> {
    compile_with(model, &BackendPreference::default())
}

/// Compile under a specific preference, panicking on failure.
#[allow(dead_code)]
pub fn compile_with(model: &Arc<Model>, pref: &BackendPreference) -> Arc<CompiledPlan> {
    Arc::new(nnrt_compiler::compile(model, pref, &registry()).expect("compilation failed"))
}

/// Bind f32 inputs and a zeroed output, compute, and decode output 0.
#[allow(dead_code)]
pub fn run_f32(plan: &Arc<CompiledPlan>, inputs: &[&[f32]]) -> Vec<f32> {
    let pool = Arc::new(MemoryPool::new());
    let mut exec = Execution::new(Arc::clone(plan), pool);
    for (index, values) in inputs.iter().enumerate() {
        exec.set_input(index, &f32_bytes(values)).expect("bind input");
    }
    let out_id = plan.model().outputs()[0];
    let size = plan.model().operand(out_id).spec.size_bytes();
    exec.set_output(0, vec![0u8; size]).expect("bind output");
    exec.compute().expect("compute failed");
    f32_values(exec.output(0).expect("output bound"))
}

#[allow(dead_code)]
pub fn f32_spec(dims: &[u32]) -> OperandSpec {
    OperandSpec::new(DataType::Float32, dims)
}

#[allow(dead_code)]
pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

#[allow(dead_code)]
pub fn f32_values(raw: &[u8]) -> Vec<f32> {
    raw.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[allow(dead_code)]
pub fn assert_close(got: &[f32], want: &[f32], tolerance: f32) {
    assert_eq!(got.len(), want.len(), "length mismatch");
    for (i, (g, w)) in got.iter().zip(want).enumerate() {
        assert!(
            (g - w).abs() <= tolerance,
            "element {i}: got {g}, want {w} (tolerance {tolerance})"
        );
    }
}

/// A 1x1 convolution (filter 2.0, bias 0.5) followed by a standalone relu.
#[allow(dead_code)]
pub fn conv_relu_model() -> Arc<Model> {
    let mut b = ModelBuilder::new();
    let input = b.add_operand(f32_spec(&[1, 2, 2, 1]));
    let filter = b
        .add_constant(f32_spec(&[1, 1, 1, 1]), f32_bytes(&[2.0]))
        .expect("filter constant");
    let bias = b
        .add_constant(f32_spec(&[1]), f32_bytes(&[0.5]))
        .expect("bias constant");
    let pre = b.add_operand(f32_spec(&[1, 2, 2, 1]));
    let out = b.add_operand(f32_spec(&[1, 2, 2, 1]));
    b.add_operation(
        Op::Conv2d {
            padding: nnrt_model::Padding::Coded(nnrt_model::PaddingCode::Valid),
            stride: [1, 1],
            fuse: FuseCode::None,
        },
        vec![input, filter, bias],
        vec![pre],
    )
    .expect("conv");
    b.add_operation(Op::Relu, vec![pre], vec![out]).expect("relu");
    b.identify_inputs_outputs(&[input], &[out]);
    Arc::new(b.finish().expect("valid model"))
}

/// A two-step tanh/logistic chain, so the plan needs a scratch arena.
#[allow(dead_code)]
pub fn chain_model(len: u32) -> Arc<Model> {
    let mut b = ModelBuilder::new();
    let input = b.add_operand(f32_spec(&[len]));
    let mid = b.add_operand(f32_spec(&[len]));
    let out = b.add_operand(f32_spec(&[len]));
    b.add_operation(Op::Tanh, vec![input], vec![mid]).expect("tanh");
    b.add_operation(Op::Logistic, vec![mid], vec![out]).expect("logistic");
    b.identify_inputs_outputs(&[input], &[out]);
    Arc::new(b.finish().expect("valid model"))
}
