//! One inference over a compiled plan.
//!
//! An [`Execution`] binds caller buffers to the plan's model inputs and
//! outputs, then walks the plan's steps in order. Inputs are staged by
//! copy at bind time, so the caller's slices are not borrowed across the
//! compute call. Internal operands live in a scratch arena; under the
//! default [`ScratchPolicy::Shared`] that arena comes from the pool and
//! concurrent computes of the same plan fail fast with [`ExecError::Busy`]
//! rather than queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nnrt_backend_core::{BackendExecutionError, TensorView, TensorViewMut};
use nnrt_compiler::CompiledPlan;
use nnrt_model::OperandId;

use crate::memory::{BufferHandle, MemoryError, MemoryPool};

/// Where an execution's internal operands live.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ScratchPolicy {
    /// Use the plan's pooled arena; concurrent computes contend for it.
    #[default]
    Shared,
    /// Allocate a private arena per execution; computes never contend.
    PerExecution,
}

/// Errors raised while binding buffers or computing.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// An input or output index beyond the model's declared lists.
    #[error("index {index} out of range, model declares {count}")]
    BadIndex {
        /// The offending index.
        index: usize,
        /// How many entries the model declares on that side.
        count: usize,
    },
    /// A model input or output had no buffer bound at compute time.
    #[error("operand {operand} has no bound buffer")]
    UnboundOperand {
        /// The unbound operand's index in the model.
        operand: u32,
    },
    /// A bound buffer's length differs from the operand's byte size.
    #[error("operand {operand} needs exactly {want} bytes, got {got}")]
    BufferSizeMismatch {
        /// The operand being bound.
        operand: u32,
        /// The operand's declared byte size.
        want: usize,
        /// The caller's buffer length.
        got: usize,
    },
    /// The plan's shared scratch arena is held by another execution.
    #[error("shared scratch arena is in use by a concurrent execution")]
    Busy,
    /// The execution was cancelled before it finished.
    #[error("execution cancelled")]
    Cancelled,
    /// A previous compute on this execution failed; results are stale.
    #[error("execution poisoned by an earlier failure")]
    Poisoned,
    /// A backend failed while running a step.
    #[error(transparent)]
    Backend(#[from] BackendExecutionError),
    /// A pooled buffer disappeared, typically after a release.
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Wall-clock cost of one step.
#[derive(Clone, Debug)]
pub struct StepTiming {
    /// Kernel name, e.g. `CONV_2D`.
    pub op: String,
    /// Name of the backend that ran the step.
    pub backend: String,
    /// Time spent inside the backend.
    pub elapsed: Duration,
}

/// Wall-clock cost of one compute call.
#[derive(Clone, Debug, Default)]
pub struct ComputeTimings {
    /// End-to-end time, including buffer staging and write-back.
    pub total: Duration,
    /// Per-step backend timings, in execution order.
    pub steps: Vec<StepTiming>,
}

/// A single inference bound to one compiled plan.
pub struct Execution {
    plan: Arc<CompiledPlan>,
    pool: Arc<MemoryPool>,
    inputs: HashMap<OperandId, Vec<u8>>,
    outputs: HashMap<OperandId, Vec<u8>>,
    policy: ScratchPolicy,
    private_scratch: Vec<u8>,
    poisoned: bool,
    cancel: Arc<AtomicBool>,
}

impl Execution {
    /// Create an execution and register the plan's constants in the pool.
    pub fn new(plan: Arc<CompiledPlan>, pool: Arc<MemoryPool>) -> Self {
        for i in 0..plan.model().operand_count() {
            let id = OperandId(i as u32);
            if let Some(value) = plan.constant(id) {
                pool.allocate(plan.id(), id, value);
            }
        }
        Self {
            plan,
            pool,
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            policy: ScratchPolicy::default(),
            private_scratch: Vec::new(),
            poisoned: false,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The plan this execution runs.
    pub fn plan(&self) -> &Arc<CompiledPlan> {
        &self.plan
    }

    /// Choose where internal operands live for subsequent computes.
    pub fn set_scratch_policy(&mut self, policy: ScratchPolicy) {
        self.policy = policy;
    }

    /// Stage the bytes for the model input at `index`.
    ///
    /// The slice is copied; its length must equal the operand's byte size
    /// exactly.
    pub fn set_input(&mut self, index: usize, data: &[u8]) -> Result<(), ExecError> {
        let id = *self
            .plan
            .model()
            .inputs()
            .get(index)
            .ok_or(ExecError::BadIndex {
                index,
                count: self.plan.model().inputs().len(),
            })?;
        let want = self.plan.model().operand(id).spec.size_bytes();
        if data.len() != want {
            return Err(ExecError::BufferSizeMismatch {
                operand: id.0,
                want,
                got: data.len(),
            });
        }
        self.inputs.insert(id, data.to_vec());
        self.poisoned = false;
        Ok(())
    }

    /// Bind an owned buffer to receive the model output at `index`.
    ///
    /// The buffer's length must equal the operand's byte size exactly; its
    /// contents are overwritten by the next successful compute.
    pub fn set_output(&mut self, index: usize, buffer: Vec<u8>) -> Result<(), ExecError> {
        let id = *self
            .plan
            .model()
            .outputs()
            .get(index)
            .ok_or(ExecError::BadIndex {
                index,
                count: self.plan.model().outputs().len(),
            })?;
        let want = self.plan.model().operand(id).spec.size_bytes();
        if buffer.len() != want {
            return Err(ExecError::BufferSizeMismatch {
                operand: id.0,
                want,
                got: buffer.len(),
            });
        }
        self.outputs.insert(id, buffer);
        self.poisoned = false;
        Ok(())
    }

    /// The computed bytes for the model output at `index`.
    pub fn output(&self, index: usize) -> Option<&[u8]> {
        let id = self.plan.model().outputs().get(index)?;
        self.outputs.get(id).map(Vec::as_slice)
    }

    /// Take ownership of the buffer bound to the model output at `index`.
    pub fn take_output(&mut self, index: usize) -> Option<Vec<u8>> {
        let id = self.plan.model().outputs().get(index)?;
        self.outputs.remove(id)
    }

    /// Run the plan to completion, synchronously.
    ///
    /// Every model input and output must be bound first. A backend failure
    /// poisons the execution; later computes fail with
    /// [`ExecError::Poisoned`] until new buffers are bound via
    /// [`set_input`](Self::set_input)/[`set_output`](Self::set_output).
    pub fn compute(&mut self) -> Result<ComputeTimings, ExecError> {
        if self.poisoned {
            return Err(ExecError::Poisoned);
        }
        for id in self.plan.model().inputs() {
            if !self.inputs.contains_key(id) {
                return Err(ExecError::UnboundOperand { operand: id.0 });
            }
        }
        for id in self.plan.model().outputs() {
            if !self.outputs.contains_key(id) {
                return Err(ExecError::UnboundOperand { operand: id.0 });
            }
        }

        let started = Instant::now();
        let plan = Arc::clone(&self.plan);
        let mut constants: HashMap<OperandId, BufferHandle> = HashMap::new();
        for step in plan.steps() {
            for id in &step.inputs {
                if plan.constant(*id).is_some() && !constants.contains_key(id) {
                    constants.insert(*id, self.pool.get(plan.id(), *id)?);
                }
            }
        }

        let peak = plan.scratch().peak_bytes();
        let result = match self.policy {
            ScratchPolicy::Shared => {
                let arena = self.pool.scratch(plan.id());
                let mut guard = match arena.try_lock() {
                    Ok(guard) => guard,
                    Err(TryLockError::WouldBlock) => return Err(ExecError::Busy),
                    Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                };
                if guard.len() < peak {
                    guard.resize(peak, 0);
                }
                run_steps(
                    &plan,
                    &self.inputs,
                    &mut self.outputs,
                    &constants,
                    &mut guard,
                    &self.cancel,
                )
            }
            ScratchPolicy::PerExecution => {
                if self.private_scratch.len() < peak {
                    self.private_scratch.resize(peak, 0);
                }
                run_steps(
                    &plan,
                    &self.inputs,
                    &mut self.outputs,
                    &constants,
                    &mut self.private_scratch,
                    &self.cancel,
                )
            }
        };

        match result {
            Ok(steps) => Ok(ComputeTimings {
                total: started.elapsed(),
                steps,
            }),
            Err(err) => {
                if matches!(err, ExecError::Backend(_)) {
                    log::warn!("compute failed on {}: {err}", plan.id());
                    self.poisoned = true;
                }
                Err(err)
            }
        }
    }

    /// Run the plan on a worker thread, returning a cancellable handle.
    ///
    /// The execution moves into the handle and comes back from
    /// [`ComputeHandle::join`] together with the compute result.
    pub fn compute_async(mut self) -> ComputeHandle {
        let cancel = Arc::new(AtomicBool::new(false));
        self.cancel = Arc::clone(&cancel);
        let handle = thread::spawn(move || {
            let result = self.compute();
            (self, result)
        });
        ComputeHandle { cancel, handle }
    }
}

/// A handle to an in-flight asynchronous compute.
pub struct ComputeHandle {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<(Execution, Result<ComputeTimings, ExecError>)>,
}

impl ComputeHandle {
    /// Request cancellation.
    ///
    /// The step currently inside a backend runs to completion; the compute
    /// stops before dispatching the next one and reports
    /// [`ExecError::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Wait for the compute to finish and recover the execution.
    ///
    /// The returned execution's cancel flag is reset, so it can compute
    /// again even after a cancellation.
    pub fn join(self) -> (Execution, Result<ComputeTimings, ExecError>) {
        let (mut execution, result) = self.handle.join().expect("compute thread panicked");
        execution.cancel = Arc::new(AtomicBool::new(false));
        (execution, result)
    }
}

fn run_steps(
    plan: &CompiledPlan,
    inputs: &HashMap<OperandId, Vec<u8>>,
    outputs: &mut HashMap<OperandId, Vec<u8>>,
    constants: &HashMap<OperandId, BufferHandle>,
    arena: &mut [u8],
    cancel: &AtomicBool,
) -> Result<Vec<StepTiming>, ExecError> {
    let scratch = plan.scratch();
    let mut timings = Vec::with_capacity(plan.steps().len());
    for step in plan.steps() {
        if cancel.load(Ordering::Relaxed) {
            log::debug!("{} cancelled before {}", plan.id(), step.kernel.op.name());
            return Err(ExecError::Cancelled);
        }

        // Steps write into temporaries so input views can borrow the arena
        // and earlier outputs immutably while this step runs.
        let mut temps: Vec<Vec<u8>> = step
            .kernel
            .outputs
            .iter()
            .map(|spec| vec![0u8; spec.size_bytes()])
            .collect();
        let elapsed;
        {
            let mut views = Vec::with_capacity(step.inputs.len());
            for (id, spec) in step.inputs.iter().zip(&step.kernel.inputs) {
                let data: &[u8] = if let Some(value) = constants.get(id) {
                    value
                } else if let Some(buf) = inputs.get(id) {
                    buf
                } else if let Some(buf) = outputs.get(id) {
                    buf
                } else if let Some((offset, len)) = scratch.region(*id) {
                    &arena[offset..offset + len]
                } else {
                    return Err(ExecError::UnboundOperand { operand: id.0 });
                };
                views.push(TensorView { spec, data });
            }
            let mut out_views: Vec<TensorViewMut<'_>> = step
                .kernel
                .outputs
                .iter()
                .zip(temps.iter_mut())
                .map(|(spec, data)| TensorViewMut { spec, data })
                .collect();
            let start = Instant::now();
            step.backend.run(&step.kernel, &views, &mut out_views)?;
            elapsed = start.elapsed();
        }
        timings.push(StepTiming {
            op: step.kernel.op.name().to_string(),
            backend: step.backend.name().to_string(),
            elapsed,
        });

        for (id, temp) in step.outputs.iter().zip(temps) {
            if let Some(buf) = outputs.get_mut(id) {
                buf.copy_from_slice(&temp);
            } else if let Some((offset, len)) = scratch.region(*id) {
                arena[offset..offset + len].copy_from_slice(&temp);
            }
        }
    }
    Ok(timings)
}
