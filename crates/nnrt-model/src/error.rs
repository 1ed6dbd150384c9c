//! Error types for model construction.

/// Errors reported while building a model or sealing it for compilation.
///
/// Per-call errors (bad handles, bad constant sizes, bad options) surface
/// from the builder method that caused them; whole-graph errors surface
/// from [`ModelBuilder::finish`](crate::ModelBuilder::finish).
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// An operand id does not name a declared operand.
    #[error("operand {id} out of range ({count} operands declared)")]
    OperandOutOfRange { id: u32, count: usize },

    /// A constant value's byte length does not match its operand spec.
    #[error("constant for operand {id} is {got} bytes, spec requires {want}")]
    ConstantSizeMismatch { id: u32, want: usize, got: usize },

    /// Two operations both list the same operand as an output.
    #[error("operand {id} already produced by operation {producer}")]
    DuplicateProducer { id: u32, producer: u32 },

    /// An operation's options hold a value that is invalid for its code.
    #[error("invalid options for {op}: {reason}")]
    InvalidOption { op: &'static str, reason: String },

    /// An operand's shape contains a dimension with extent zero.
    #[error("operand {id} has a zero extent on axis {axis}")]
    ZeroDimension { id: u32, axis: usize },

    /// An operand appears more than once across the input and output lists.
    #[error("operand {id} designated more than once")]
    DuplicateDesignation { id: u32 },

    /// A designated model input is written by an operation.
    #[error("model input {id} is produced by an operation")]
    InputHasProducer { id: u32 },

    /// A designated model input already carries a constant value.
    #[error("model input {id} has a constant value")]
    InputIsConstant { id: u32 },

    /// A designated model output is never written by any operation.
    #[error("model output {id} is not produced by any operation")]
    OutputWithoutProducer { id: u32 },

    /// An operand is consumed but has no value, producer, or input slot.
    #[error("operand {id} is consumed but never produced, bound, or designated as input")]
    NeverProduced { id: u32 },

    /// An operand with a constant value is also written by an operation.
    #[error("constant operand {id} is produced by an operation")]
    ConstantHasProducer { id: u32 },

    /// The model contains no operations.
    #[error("model has no operations")]
    NoOperations,

    /// The model designates no outputs.
    #[error("model has no outputs")]
    NoOutputs,

    /// The operation graph is not acyclic.
    #[error("operation graph contains a cycle ({visited} of {count} operations reachable)")]
    Cycle { visited: usize, count: usize },
}
