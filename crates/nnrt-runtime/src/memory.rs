//! Shared buffer pooling across executions of the same plan.
//!
//! Constants are registered once per plan and handed out as cheap
//! [`Arc`] clones, so concurrent executions of one plan never duplicate
//! weight data. The pool also owns the shared scratch arena each plan's
//! internal operands live in.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use nnrt_compiler::PlanId;
use nnrt_model::OperandId;

/// A read-only, reference-counted byte buffer handed out by the pool.
pub type BufferHandle = Arc<[u8]>;

/// Errors raised by pool lookups.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// No buffer is registered for the requested plan and operand.
    #[error("no buffer allocated for operand {operand} of {plan}")]
    NotAllocated {
        /// The plan the lookup was scoped to.
        plan: PlanId,
        /// The operand index within that plan's model.
        operand: u32,
    },
}

#[derive(Default)]
struct PoolState {
    buffers: HashMap<(PlanId, OperandId), BufferHandle>,
    scratch: HashMap<PlanId, Arc<Mutex<Vec<u8>>>>,
}

/// A process-wide pool of plan-scoped buffers.
///
/// Keys are `(plan, operand)` pairs, so two plans compiled from the same
/// model keep fully disjoint buffer sets. All methods take `&self`; the
/// pool is safe to share behind an [`Arc`] across executions and threads.
#[derive(Default)]
pub struct MemoryPool {
    inner: Mutex<PoolState>,
}

impl MemoryPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `data` for an operand, or return the existing buffer.
    ///
    /// Get-or-create: registering the same operand twice hands back the
    /// first buffer and ignores the new bytes, so every execution of a
    /// plan observes one consistent value.
    pub fn allocate(&self, plan: PlanId, operand: OperandId, data: &BufferHandle) -> BufferHandle {
        let mut state = self.lock();
        state
            .buffers
            .entry((plan, operand))
            .or_insert_with(|| Arc::clone(data))
            .clone()
    }

    /// Look up a previously registered buffer.
    pub fn get(&self, plan: PlanId, operand: OperandId) -> Result<BufferHandle, MemoryError> {
        self.lock()
            .buffers
            .get(&(plan, operand))
            .cloned()
            .ok_or(MemoryError::NotAllocated {
                plan,
                operand: operand.0,
            })
    }

    /// The shared scratch arena for a plan, created on first use.
    ///
    /// The arena starts empty; executions grow it to the plan's peak on
    /// acquisition. Holding the inner lock for the duration of a compute
    /// call is what makes concurrent shared-scratch executions mutually
    /// exclusive.
    pub fn scratch(&self, plan: PlanId) -> Arc<Mutex<Vec<u8>>> {
        self.lock()
            .scratch
            .entry(plan)
            .or_default()
            .clone()
    }

    /// Drop every buffer and the scratch arena registered for a plan.
    ///
    /// Idempotent; releasing a plan that was never registered is a no-op.
    /// Executions holding handles keep their clones alive, but later
    /// lookups fail until the operand is registered again.
    pub fn release(&self, plan: PlanId) {
        let mut state = self.lock();
        state.buffers.retain(|(p, _), _| *p != plan);
        if state.scratch.remove(&plan).is_some() {
            log::debug!("released pooled buffers for {plan}");
        }
    }

    /// Number of registered buffers, across all plans.
    pub fn len(&self) -> usize {
        self.lock().buffers.len()
    }

    /// Whether the pool holds no buffers.
    pub fn is_empty(&self) -> bool {
        self.lock().buffers.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        // Pool state is plain maps; a panic mid-update cannot leave them
        // inconsistent, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
