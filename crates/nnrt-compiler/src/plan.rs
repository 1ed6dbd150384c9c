//! The compiled plan: ordered steps, plan-owned constants, scratch layout.

use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nnrt_backend_core::{Backend, BackendPreference, Kernel};
use nnrt_model::{Model, OperandId, OperationId};

/// A process-unique identity for one compiled plan.
///
/// Memory pools key buffers by plan id, so two plans compiled from the same
/// model never alias each other's buffers.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct PlanId(u64);

impl PlanId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "plan#{}", self.0)
    }
}

/// One executable unit of a plan: a resolved kernel bound to a backend.
#[derive(Clone, Debug)]
pub struct PlanStep {
    /// The surviving source operation this step came from.
    pub operation: OperationId,
    /// The resolved kernel, including any fused activation.
    pub kernel: Kernel,
    /// Operand ids read, in kernel order.
    pub inputs: Vec<OperandId>,
    /// Operand ids written.
    pub outputs: Vec<OperandId>,
    /// The backend assigned to run this step.
    pub backend: Arc<dyn Backend>,
}

/// Byte offsets for internal operands within one shared scratch arena.
///
/// Offsets are packed so that operands whose live ranges overlap never
/// share bytes; non-overlapping operands reuse regions, keeping
/// [`peak_bytes`](Self::peak_bytes) below the sum of all sizes.
#[derive(Clone, Debug, Default)]
pub struct ScratchLayout {
    offsets: HashMap<OperandId, (usize, usize)>,
    peak_bytes: usize,
}

impl ScratchLayout {
    pub(crate) fn new(offsets: HashMap<OperandId, (usize, usize)>, peak_bytes: usize) -> Self {
        Self {
            offsets,
            peak_bytes,
        }
    }

    /// Arena offset and byte length for an internal operand.
    pub fn region(&self, id: OperandId) -> Option<(usize, usize)> {
        self.offsets.get(&id).copied()
    }

    /// Total arena size an execution must provide.
    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes
    }

    /// Number of internal operands with a region.
    pub fn buffer_count(&self) -> usize {
        self.offsets.len()
    }
}

/// An immutable, backend-assigned lowering of one model.
///
/// Plans share their source model read-only via [`Arc`]; everything derived
/// (step order, fused kernels, folded constants, scratch layout) is owned by
/// the plan exclusively.
#[derive(Debug)]
pub struct CompiledPlan {
    id: PlanId,
    model: Arc<Model>,
    preference: BackendPreference,
    steps: Vec<PlanStep>,
    folded: HashMap<OperandId, Arc<[u8]>>,
    scratch: ScratchLayout,
    fused: usize,
    folded_steps: usize,
}

impl CompiledPlan {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        model: Arc<Model>,
        preference: BackendPreference,
        steps: Vec<PlanStep>,
        folded: HashMap<OperandId, Arc<[u8]>>,
        scratch: ScratchLayout,
        fused: usize,
        folded_steps: usize,
    ) -> Self {
        Self {
            id: PlanId::next(),
            model,
            preference,
            steps,
            folded,
            scratch,
            fused,
            folded_steps,
        }
    }

    /// This plan's process-unique identity.
    pub fn id(&self) -> PlanId {
        self.id
    }

    /// The source model, shared read-only.
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// The preference this plan was compiled under.
    pub fn preference(&self) -> &BackendPreference {
        &self.preference
    }

    /// Steps in execution order.
    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    /// The constant value backing an operand, if it has one.
    ///
    /// Checks plan-owned folded values first, then the model's constants.
    pub fn constant(&self, id: OperandId) -> Option<&Arc<[u8]>> {
        self.folded.get(&id).or_else(|| self.model.value(id))
    }

    /// Scratch arena layout for internal operands.
    pub fn scratch(&self) -> &ScratchLayout {
        &self.scratch
    }

    /// Number of standalone activations merged into preceding steps.
    pub fn fused_count(&self) -> usize {
        self.fused
    }

    /// Number of all-constant operations evaluated at compile time.
    pub fn folded_count(&self) -> usize {
        self.folded_steps
    }

    /// Human-readable plan dump, one line per step.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{} (preference: {})", self.id, self.preference);
        let _ = writeln!(
            out,
            "model: {} operands, {} operations, {} inputs, {} outputs",
            self.model.operand_count(),
            self.model.operations().len(),
            self.model.inputs().len(),
            self.model.outputs().len(),
        );
        let _ = writeln!(
            out,
            "steps: {} ({} fused, {} folded); scratch: {} bytes peak across {} buffers",
            self.steps.len(),
            self.fused,
            self.folded_steps,
            self.scratch.peak_bytes(),
            self.scratch.buffer_count(),
        );
        for (i, step) in self.steps.iter().enumerate() {
            let _ = writeln!(out, "  {i}: {} -> {}", step.kernel, step.backend.name());
        }
        out
    }
}
