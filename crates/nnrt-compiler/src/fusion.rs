//! Merges standalone activations into the step that feeds them.
//!
//! A `RELU`/`RELU1`/`RELU6` step whose only purpose is to clamp the output
//! of the preceding producer is folded into that producer's fuse slot, and
//! the intermediate operand disappears from the plan. Fusion is refused when
//! the intermediate is a designated model output or has other consumers,
//! when the producer already carries an activation, or when the producer's
//! code has no fuse slot (softmax, logistic, and tanh never fuse).

use nnrt_backend_core::KernelOp;
use nnrt_model::{FuseCode, Model};

use crate::shape::ResolvedStep;

fn standalone_activation(step: &ResolvedStep) -> Option<FuseCode> {
    match step.kernel.op {
        KernelOp::Relu => Some(FuseCode::Relu),
        KernelOp::Relu1 => Some(FuseCode::Relu1),
        KernelOp::Relu6 => Some(FuseCode::Relu6),
        _ => None,
    }
}

/// Fuse eligible activations in place; returns how many were merged.
pub(crate) fn fuse_activations(model: &Model, steps: &mut Vec<ResolvedStep>) -> usize {
    let mut fused = 0;
    let mut i = 0;
    while i < steps.len() {
        let Some(code) = standalone_activation(&steps[i]) else {
            i += 1;
            continue;
        };
        let mid = steps[i].inputs[0];
        if model.outputs().contains(&mid) || model.consumers(mid).len() != 1 {
            i += 1;
            continue;
        }
        let Some(p) = steps[..i].iter().position(|s| s.outputs.contains(&mid)) else {
            // Fed by a model input or constant, nothing to merge into.
            i += 1;
            continue;
        };
        let eligible = steps[p].kernel.fuse == FuseCode::None
            && model.operation(steps[p].operation).op.accepts_fuse();
        if !eligible {
            i += 1;
            continue;
        }

        let activation = steps.remove(i);
        let producer = &mut steps[p];
        producer.kernel.fuse = code;
        producer.kernel.outputs = activation.kernel.outputs;
        producer.outputs = activation.outputs;
        log::debug!(
            "fused {code} into operation {} ({})",
            producer.operation.0,
            producer.kernel.op.name()
        );
        fused += 1;
        // The next candidate shifted into slot i; do not advance.
    }
    fused
}
