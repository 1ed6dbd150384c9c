//! Scratch arena planning for internal operands.
//!
//! Each internal operand surviving fusion and folding gets a byte region in
//! one shared arena. Regions are packed greedily first-fit over live
//! intervals measured in step indices, so operands that are never live at
//! the same time share bytes.

use std::collections::HashMap;
use std::sync::Arc;

use nnrt_model::{Model, OperandId, OperandLifetime};

use crate::plan::ScratchLayout;
use crate::shape::ResolvedStep;

struct LiveInterval {
    operand: OperandId,
    start: usize,
    end: usize,
    size: usize,
}

struct Placed {
    offset: usize,
    size: usize,
    end: usize,
}

/// Compute the arena layout for the surviving steps.
pub(crate) fn plan_scratch(
    model: &Model,
    steps: &[ResolvedStep],
    folded: &HashMap<OperandId, Arc<[u8]>>,
) -> ScratchLayout {
    let mut intervals: HashMap<OperandId, LiveInterval> = HashMap::new();
    for (idx, step) in steps.iter().enumerate() {
        for (slot, id) in step.outputs.iter().enumerate() {
            if model.operand(*id).lifetime != OperandLifetime::Internal
                || folded.contains_key(id)
            {
                continue;
            }
            intervals.entry(*id).or_insert(LiveInterval {
                operand: *id,
                start: idx,
                end: idx,
                size: step.kernel.outputs[slot].size_bytes(),
            });
        }
        for id in &step.inputs {
            if let Some(interval) = intervals.get_mut(id) {
                interval.end = idx;
            }
        }
    }

    let mut intervals: Vec<LiveInterval> = intervals.into_values().collect();
    // First-fit by start; among ties place larger buffers first so small
    // ones slot into the gaps they leave.
    intervals.sort_by(|a, b| a.start.cmp(&b.start).then(b.size.cmp(&a.size)));

    let mut offsets = HashMap::new();
    let mut active: Vec<Placed> = Vec::new();
    let mut peak = 0usize;
    for interval in intervals {
        active.retain(|a| a.end >= interval.start);
        active.sort_by_key(|a| a.offset);
        let mut offset = 0;
        for a in &active {
            if offset + interval.size <= a.offset {
                break;
            }
            offset = a.offset + a.size;
        }
        offsets.insert(interval.operand, (offset, interval.size));
        peak = peak.max(offset + interval.size);
        active.push(Placed {
            offset,
            size: interval.size,
            end: interval.end,
        });
    }
    log::debug!(
        "scratch layout: {} buffers, {peak} bytes peak",
        offsets.len()
    );
    ScratchLayout::new(offsets, peak)
}
