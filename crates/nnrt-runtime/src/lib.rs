//! Execution sessions over compiled plans.
//!
//! A [`MemoryPool`] shares constants and scratch arenas across every
//! [`Execution`] of the same plan. Executions bind caller buffers, run the
//! plan's steps synchronously via [`Execution::compute`] or on a worker
//! thread via [`Execution::compute_async`], and report per-step wall-clock
//! timings.

#![warn(missing_docs)]

mod execution;
mod memory;

pub use execution::{
    ComputeHandle, ComputeTimings, ExecError, Execution, ScratchPolicy, StepTiming,
};
pub use memory::{BufferHandle, MemoryError, MemoryPool};
