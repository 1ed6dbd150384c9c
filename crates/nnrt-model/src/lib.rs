//! Operand and operation graph model for the nnrt engine.
//!
//! A model is a DAG of typed tensor operands and fixed-code operations,
//! built incrementally and sealed once for compilation. This crate owns the
//! closed code enumerations (datatypes, operation codes, fuse and padding
//! codes) and all build-time validation; shape and arity checking against
//! each operation code happens later, in the compiler.

#![warn(missing_docs)]

mod error;
mod model;
mod ops;
mod types;

pub use error::ValidationError;
pub use model::{Model, ModelBuilder, OperandInfo, Operation};
pub use ops::{FuseCode, Op, Padding, PaddingCode};
pub use types::{DataType, OperandId, OperandLifetime, OperandSpec, OperationId, Shape};
