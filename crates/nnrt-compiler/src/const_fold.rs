//! Evaluates all-constant steps at compile time.
//!
//! Folding always runs on the reference backend so the folded bytes are
//! identical regardless of the caller's preference. Steps that write a
//! designated model output are never folded; they must still run so the
//! caller's bound buffer receives the value.

use std::collections::HashMap;
use std::sync::Arc;

use nnrt_backend_core::{Backend, TensorView, TensorViewMut};
use nnrt_backend_cpu::CpuBackend;
use nnrt_model::{Model, OperandId};

use crate::shape::ResolvedStep;
use crate::CompileError;

/// Fold foldable steps in place, collecting their outputs as plan-owned
/// constants. Returns how many steps were removed.
pub(crate) fn fold_constants(
    model: &Model,
    steps: &mut Vec<ResolvedStep>,
    folded: &mut HashMap<OperandId, Arc<[u8]>>,
) -> Result<usize, CompileError> {
    let reference = CpuBackend;
    let mut count = 0;
    let mut i = 0;
    while i < steps.len() {
        let step = &steps[i];
        let all_const = step
            .inputs
            .iter()
            .all(|id| model.value(*id).is_some() || folded.contains_key(id));
        let writes_model_output = step.outputs.iter().any(|id| model.outputs().contains(id));
        if !all_const || writes_model_output {
            i += 1;
            continue;
        }

        let inputs: Vec<Arc<[u8]>> = step
            .inputs
            .iter()
            .map(|id| {
                folded
                    .get(id)
                    .or_else(|| model.value(*id))
                    .cloned()
                    .unwrap_or_else(|| Arc::from(&[][..]))
            })
            .collect();
        let views: Vec<TensorView<'_>> = step
            .kernel
            .inputs
            .iter()
            .zip(&inputs)
            .map(|(spec, data)| TensorView { spec, data })
            .collect();
        let mut results: Vec<Vec<u8>> = step
            .kernel
            .outputs
            .iter()
            .map(|spec| vec![0u8; spec.size_bytes()])
            .collect();
        {
            let mut out_views: Vec<TensorViewMut<'_>> = step
                .kernel
                .outputs
                .iter()
                .zip(results.iter_mut())
                .map(|(spec, data)| TensorViewMut { spec, data })
                .collect();
            reference
                .run(&step.kernel, &views, &mut out_views)
                .map_err(|source| CompileError::FoldFailed {
                    operation: step.operation.0,
                    source,
                })?;
        }
        log::debug!(
            "folded operation {} ({}) at compile time",
            step.operation.0,
            step.kernel.op.name()
        );
        let outputs = step.outputs.clone();
        for (id, data) in outputs.into_iter().zip(results) {
            folded.insert(id, data.into());
        }
        steps.remove(i);
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::resolve_steps;
    use nnrt_backend_core::bytes::{f32_from_le, f32_to_le};
    use nnrt_model::{DataType, FuseCode, ModelBuilder, Op, OperandSpec};

    fn f32_spec(dims: &[u32]) -> OperandSpec {
        OperandSpec::new(DataType::Float32, dims)
    }

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        let mut raw = vec![0u8; values.len() * 4];
        f32_to_le(values, &mut raw);
        raw
    }

    #[test]
    fn constant_chain_folds_transitively() {
        // tanh(c) feeds relu; both fold, leaving only the add on the input.
        let mut b = ModelBuilder::new();
        let input = b.add_operand(f32_spec(&[2]));
        let c = b
            .add_constant(f32_spec(&[2]), f32_bytes(&[-5.0, 5.0]))
            .unwrap();
        let squashed = b.add_operand(f32_spec(&[2]));
        let clamped = b.add_operand(f32_spec(&[2]));
        let out = b.add_operand(f32_spec(&[2]));
        b.add_operation(Op::Tanh, vec![c], vec![squashed]).unwrap();
        b.add_operation(Op::Relu, vec![squashed], vec![clamped]).unwrap();
        b.add_operation(
            Op::Add {
                fuse: FuseCode::None,
            },
            vec![input, clamped],
            vec![out],
        )
        .unwrap();
        b.identify_inputs_outputs(&[input], &[out]);
        let model = b.finish().unwrap();

        let mut steps = resolve_steps(&model, &model.execution_order()).unwrap();
        let mut folded = HashMap::new();
        let count = fold_constants(&model, &mut steps, &mut folded).unwrap();
        assert_eq!(count, 2);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].kernel.op.name(), "ADD");

        let value = f32_from_le(&folded[&clamped]);
        assert!((value[0] - 0.0).abs() < 1e-6);
        assert!((value[1] - 5.0f32.tanh()).abs() < 1e-6);
    }

    #[test]
    fn step_writing_model_output_is_kept() {
        let mut b = ModelBuilder::new();
        let c = b
            .add_constant(f32_spec(&[2]), f32_bytes(&[1.0, -1.0]))
            .unwrap();
        let out = b.add_operand(f32_spec(&[2]));
        b.add_operation(Op::Relu, vec![c], vec![out]).unwrap();
        b.identify_inputs_outputs(&[], &[out]);
        let model = b.finish().unwrap();

        let mut steps = resolve_steps(&model, &model.execution_order()).unwrap();
        let mut folded = HashMap::new();
        let count = fold_constants(&model, &mut steps, &mut folded).unwrap();
        assert_eq!(count, 0);
        assert_eq!(steps.len(), 1);
        assert!(folded.is_empty());
    }

    #[test]
    fn runtime_input_blocks_folding() {
        let mut b = ModelBuilder::new();
        let input = b.add_operand(f32_spec(&[2]));
        let out = b.add_operand(f32_spec(&[2]));
        b.add_operation(Op::Relu, vec![input], vec![out]).unwrap();
        b.identify_inputs_outputs(&[input], &[out]);
        let model = b.finish().unwrap();

        let mut steps = resolve_steps(&model, &model.execution_order()).unwrap();
        let mut folded = HashMap::new();
        let count = fold_constants(&model, &mut steps, &mut folded).unwrap();
        assert_eq!(count, 0);
        assert_eq!(steps.len(), 1);
    }
}
