#![warn(missing_docs)]
//! Compilation: lowering a sealed model into an executable plan.
//!
//! [`compile`] runs a fixed pass pipeline over a [`Model`]: deterministic
//! dependency ordering, per-operation shape and padding resolution,
//! standalone-activation fusion, constant folding, backend assignment, and
//! scratch layout. The result is an immutable [`CompiledPlan`] that an
//! execution walks step by step. Compilation never mutates the model, so one
//! model may be compiled into any number of independent plans.

mod const_fold;
mod fusion;
mod layout;
mod plan;
mod shape;

pub use plan::{CompiledPlan, PlanId, PlanStep, ScratchLayout};

use std::collections::HashMap;
use std::sync::Arc;

use nnrt_backend_core::{BackendExecutionError, BackendPreference, BackendRegistry};
use nnrt_model::Model;

/// Errors reported while lowering a model into a plan.
///
/// `ShapeMismatch` means the graph itself is inconsistent for its declared
/// shapes; the other variants depend on the backend set and preference, so a
/// retry with a different preference may succeed.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// An operation's operand shapes, types, or arity are inconsistent with
    /// its code, or a symbolic padding cannot be resolved to the declared
    /// output shape.
    #[error("operation {operation} ({op}): {reason}")]
    ShapeMismatch {
        /// Declaration index of the offending operation.
        operation: u32,
        /// Operation code name.
        op: &'static str,
        /// What failed to line up.
        reason: String,
    },

    /// An `Exact` preference named a backend that cannot run some step.
    #[error("backend '{backend}' does not support operation {operation}: {kernel}")]
    UnsupportedOperation {
        /// Declaration index of the offending operation.
        operation: u32,
        /// The resolved kernel the backend refused.
        kernel: String,
        /// The required backend's name.
        backend: String,
    },

    /// No registered backend can run some step, or the preference named an
    /// unknown backend.
    #[error("{reason}")]
    BackendUnavailable {
        /// Why no backend could be assigned.
        reason: String,
    },

    /// The reference backend failed while evaluating an all-constant step.
    #[error("folding operation {operation} failed: {source}")]
    FoldFailed {
        /// Declaration index of the folded operation.
        operation: u32,
        /// The reference backend's failure.
        #[source]
        source: BackendExecutionError,
    },
}

/// Lower a sealed model into a backend-assigned [`CompiledPlan`].
///
/// The pipeline is deterministic: compiling the same model with the same
/// preference against the same registry always yields the same step order,
/// fusion decisions, and backend assignments. Steps a preferred backend
/// cannot run fall back per step to the best supporting backend; only an
/// [`BackendPreference::Exact`] preference disables that fallback.
pub fn compile(
    model: &Arc<Model>,
    preference: &BackendPreference,
    registry: &BackendRegistry,
) -> Result<CompiledPlan, CompileError> {
    let order = model.execution_order();
    let mut steps = shape::resolve_steps(model, &order)?;

    let fused = fusion::fuse_activations(model, &mut steps);
    let mut folded_values = HashMap::new();
    let folded = const_fold::fold_constants(model, &mut steps, &mut folded_values)?;
    let scratch = layout::plan_scratch(model, &steps, &folded_values);
    log::debug!(
        "compile: {} steps ({fused} fused, {folded} folded), scratch peak {} bytes",
        steps.len(),
        scratch.peak_bytes()
    );

    let ranked = registry.ranked(preference);
    if ranked.is_empty() {
        let reason = match preference {
            BackendPreference::Exact(name) => format!("unknown backend '{name}'"),
            _ => "no backends registered".to_owned(),
        };
        return Err(CompileError::BackendUnavailable { reason });
    }

    let steps = steps
        .into_iter()
        .map(|step| {
            let backend = ranked.iter().find(|b| b.supports(&step.kernel)).cloned();
            match backend {
                Some(backend) => {
                    log::debug!(
                        "operation {} ({}) -> {}",
                        step.operation.0,
                        step.kernel.op.name(),
                        backend.name()
                    );
                    Ok(PlanStep {
                        operation: step.operation,
                        kernel: step.kernel,
                        inputs: step.inputs,
                        outputs: step.outputs,
                        backend,
                    })
                }
                None => Err(match preference {
                    BackendPreference::Exact(name) => CompileError::UnsupportedOperation {
                        operation: step.operation.0,
                        kernel: step.kernel.to_string(),
                        backend: name.clone(),
                    },
                    _ => CompileError::BackendUnavailable {
                        reason: format!("no registered backend supports {}", step.kernel),
                    },
                }),
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CompiledPlan::new(
        Arc::clone(model),
        preference.clone(),
        steps,
        folded_values,
        scratch,
        fused,
        folded,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nnrt_backend_core::{
        Backend, Kernel, PadAmounts, TensorView, TensorViewMut,
    };
    use nnrt_backend_cpu::CpuBackend;
    use nnrt_backend_mt::MtBackend;
    use nnrt_model::{
        DataType, FuseCode, ModelBuilder, Op, OperandId, OperandSpec, Padding, PaddingCode,
    };

    fn f32_spec(dims: &[u32]) -> OperandSpec {
        OperandSpec::new(DataType::Float32, dims)
    }

    fn registry() -> BackendRegistry {
        let mut reg = BackendRegistry::new();
        reg.register_fallback(Arc::new(CpuBackend));
        reg.register(Arc::new(MtBackend));
        reg
    }

    /// conv(relu-less) -> relu -> output, eligible for fusion.
    fn conv_relu_model() -> (Arc<Model>, OperandId, OperandId) {
        let mut b = ModelBuilder::new();
        let input = b.add_operand(f32_spec(&[1, 4, 4, 1]));
        let filter_spec = f32_spec(&[1, 3, 3, 1]);
        let filter = b
            .add_constant(filter_spec.clone(), vec![0u8; filter_spec.size_bytes()])
            .unwrap();
        let bias = b.add_constant(f32_spec(&[1]), vec![0u8; 4]).unwrap();
        let mid = b.add_operand(f32_spec(&[1, 4, 4, 1]));
        let output = b.add_operand(f32_spec(&[1, 4, 4, 1]));
        b.add_operation(
            Op::Conv2d {
                padding: Padding::Coded(PaddingCode::Same),
                stride: [1, 1],
                fuse: FuseCode::None,
            },
            vec![input, filter, bias],
            vec![mid],
        )
        .unwrap();
        b.add_operation(Op::Relu, vec![mid], vec![output]).unwrap();
        b.identify_inputs_outputs(&[input], &[output]);
        (Arc::new(b.finish().unwrap()), input, output)
    }

    #[test]
    fn conv_relu_fuses_into_one_step() {
        let (model, _, output) = conv_relu_model();
        let plan = compile(&model, &BackendPreference::default(), &registry()).unwrap();
        assert_eq!(plan.steps().len(), 1);
        assert_eq!(plan.steps()[0].kernel.fuse, FuseCode::Relu);
        assert_eq!(plan.steps()[0].outputs, vec![output]);
        assert_eq!(plan.fused_count(), 1);
    }

    #[test]
    fn same_preference_compiles_identically() {
        let (model, _, _) = conv_relu_model();
        let reg = registry();
        let a = compile(&model, &BackendPreference::SustainedSpeed, &reg).unwrap();
        let b = compile(&model, &BackendPreference::SustainedSpeed, &reg).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.steps().len(), b.steps().len());
        for (x, y) in a.steps().iter().zip(b.steps()) {
            assert_eq!(x.kernel, y.kernel);
            assert_eq!(x.backend.name(), y.backend.name());
        }
    }

    #[test]
    fn plan_order_is_topological() {
        // Declared consumer-first; the plan must still run producers first.
        let mut b = ModelBuilder::new();
        let t0 = b.add_operand(f32_spec(&[4]));
        let t1 = b.add_operand(f32_spec(&[4]));
        let t2 = b.add_operand(f32_spec(&[4]));
        b.add_operation(Op::Tanh, vec![t1], vec![t2]).unwrap();
        b.add_operation(Op::Logistic, vec![t0], vec![t1]).unwrap();
        b.identify_inputs_outputs(&[t0], &[t2]);
        let model = Arc::new(b.finish().unwrap());

        let plan = compile(&model, &BackendPreference::default(), &registry()).unwrap();
        let mut produced: Vec<OperandId> = model.inputs().to_vec();
        for step in plan.steps() {
            for id in &step.inputs {
                let available = produced.contains(id) || plan.constant(*id).is_some();
                assert!(available, "step consumes operand {} before it exists", id.0);
            }
            produced.extend(step.outputs.iter().copied());
        }
    }

    #[test]
    fn declared_output_shape_must_match_derived() {
        let mut b = ModelBuilder::new();
        let input = b.add_operand(f32_spec(&[1, 4, 4, 1]));
        let filter_spec = f32_spec(&[1, 3, 3, 1]);
        let filter = b
            .add_constant(filter_spec.clone(), vec![0u8; filter_spec.size_bytes()])
            .unwrap();
        let bias = b.add_constant(f32_spec(&[1]), vec![0u8; 4]).unwrap();
        // VALID padding with a 3x3 kernel shrinks 4x4 to 2x2, not 4x4.
        let output = b.add_operand(f32_spec(&[1, 4, 4, 1]));
        b.add_operation(
            Op::Conv2d {
                padding: Padding::Coded(PaddingCode::Valid),
                stride: [1, 1],
                fuse: FuseCode::None,
            },
            vec![input, filter, bias],
            vec![output],
        )
        .unwrap();
        b.identify_inputs_outputs(&[input], &[output]);
        let model = Arc::new(b.finish().unwrap());

        let err = compile(&model, &BackendPreference::default(), &registry()).unwrap_err();
        assert!(matches!(err, CompileError::ShapeMismatch { .. }));
    }

    #[test]
    fn exact_preference_requires_support_on_every_step() {
        // cpu-mt does not run standalone activations, so an Exact("cpu-mt")
        // compile of relu must fail while the ranked path falls back.
        let mut b = ModelBuilder::new();
        let input = b.add_operand(f32_spec(&[4]));
        let output = b.add_operand(f32_spec(&[4]));
        b.add_operation(Op::Relu, vec![input], vec![output]).unwrap();
        b.identify_inputs_outputs(&[input], &[output]);
        let model = Arc::new(b.finish().unwrap());
        let reg = registry();

        let err = compile(&model, &BackendPreference::Exact("cpu-mt".into()), &reg).unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedOperation { .. }));

        let plan = compile(&model, &BackendPreference::FastSingleAnswer, &reg).unwrap();
        assert_eq!(plan.steps()[0].backend.name(), "cpu-ref");
    }

    #[test]
    fn unknown_exact_backend_is_unavailable() {
        let (model, _, _) = conv_relu_model();
        let err = compile(
            &model,
            &BackendPreference::Exact("npu-42".into()),
            &registry(),
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::BackendUnavailable { .. }));
    }

    #[test]
    fn empty_registry_is_unavailable() {
        let (model, _, _) = conv_relu_model();
        let err = compile(
            &model,
            &BackendPreference::default(),
            &BackendRegistry::new(),
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::BackendUnavailable { .. }));
    }

    /// A backend that claims support for nothing, to prove per-step fallback.
    #[derive(Debug)]
    struct RefusingBackend;

    impl Backend for RefusingBackend {
        fn name(&self) -> &str {
            "refuser"
        }
        fn supports(&self, _kernel: &Kernel) -> bool {
            false
        }
        fn run(
            &self,
            kernel: &Kernel,
            _inputs: &[TensorView<'_>],
            _outputs: &mut [TensorViewMut<'_>],
        ) -> Result<(), BackendExecutionError> {
            Err(BackendExecutionError::Unsupported(kernel.to_string()))
        }
        fn profile(&self) -> nnrt_backend_core::BackendProfile {
            // Best on every axis, so it always ranks first.
            nnrt_backend_core::BackendProfile {
                latency: 0,
                throughput: 0,
                power: 0,
            }
        }
    }

    #[test]
    fn unsupported_steps_fall_back_per_node() {
        let (model, _, _) = conv_relu_model();
        let mut reg = BackendRegistry::new();
        reg.register(Arc::new(RefusingBackend));
        reg.register_fallback(Arc::new(CpuBackend));
        let plan = compile(&model, &BackendPreference::FastSingleAnswer, &reg).unwrap();
        for step in plan.steps() {
            assert_eq!(step.backend.name(), "cpu-ref");
        }
    }

    #[test]
    fn padding_same_resolves_asymmetrically() {
        // 224x224 input, 3x3 kernel, stride 2: SAME pads 0 on top/left and
        // 1 on bottom/right, producing 112x112.
        let mut b = ModelBuilder::new();
        let input = b.add_operand(f32_spec(&[1, 224, 224, 1]));
        let filter_spec = f32_spec(&[1, 3, 3, 1]);
        let filter = b
            .add_constant(filter_spec.clone(), vec![0u8; filter_spec.size_bytes()])
            .unwrap();
        let bias = b.add_constant(f32_spec(&[1]), vec![0u8; 4]).unwrap();
        let output = b.add_operand(f32_spec(&[1, 112, 112, 1]));
        b.add_operation(
            Op::Conv2d {
                padding: Padding::Coded(PaddingCode::Same),
                stride: [2, 2],
                fuse: FuseCode::None,
            },
            vec![input, filter, bias],
            vec![output],
        )
        .unwrap();
        b.identify_inputs_outputs(&[input], &[output]);
        let model = Arc::new(b.finish().unwrap());

        let plan = compile(&model, &BackendPreference::default(), &registry()).unwrap();
        match &plan.steps()[0].kernel.op {
            nnrt_backend_core::KernelOp::Conv2d { pad, .. } => {
                assert_eq!(
                    *pad,
                    PadAmounts {
                        top: 0,
                        bottom: 1,
                        left: 0,
                        right: 1,
                    }
                );
            }
            other => panic!("expected a conv kernel, got {other}"),
        }
    }

    #[test]
    fn all_constant_step_is_folded() {
        // relu over a constant folds away; the add that consumes it stays.
        let mut b = ModelBuilder::new();
        let input = b.add_operand(f32_spec(&[2]));
        let c = b
            .add_constant(f32_spec(&[2]), {
                let mut raw = vec![0u8; 8];
                nnrt_backend_core::bytes::f32_to_le(&[-1.0, 2.0], &mut raw);
                raw
            })
            .unwrap();
        let folded = b.add_operand(f32_spec(&[2]));
        let output = b.add_operand(f32_spec(&[2]));
        b.add_operation(Op::Relu, vec![c], vec![folded]).unwrap();
        b.add_operation(
            Op::Add {
                fuse: FuseCode::None,
            },
            vec![input, folded],
            vec![output],
        )
        .unwrap();
        b.identify_inputs_outputs(&[input], &[output]);
        let model = Arc::new(b.finish().unwrap());

        let plan = compile(&model, &BackendPreference::default(), &registry()).unwrap();
        assert_eq!(plan.steps().len(), 1);
        assert_eq!(plan.folded_count(), 1);
        let value = plan.constant(folded).expect("folded value");
        assert_eq!(
            nnrt_backend_core::bytes::f32_from_le(value),
            vec![0.0, 2.0]
        );
    }

    #[test]
    fn describe_names_steps_and_backends() {
        let (model, _, _) = conv_relu_model();
        let plan = compile(&model, &BackendPreference::SustainedSpeed, &registry()).unwrap();
        let text = plan.describe();
        assert!(text.contains("CONV_2D"));
        assert!(text.contains("fuse=RELU"));
        assert!(text.contains("cpu-mt"));
        assert!(text.contains("sustained-speed"));
    }
}
