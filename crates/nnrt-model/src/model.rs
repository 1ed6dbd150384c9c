//! Model construction and the sealed operation graph.
//!
//! A [`ModelBuilder`] accumulates operands and operations, then
//! [`finish`](ModelBuilder::finish) validates the whole graph and seals it
//! into an immutable [`Model`]. Sealing consumes the builder, so a model can
//! never be edited after compilation starts.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::error::ValidationError;
use crate::ops::Op;
use crate::types::{OperandId, OperandLifetime, OperandSpec, OperationId};

/// A declared operand plus the lifetime class assigned when the model was
/// sealed.
#[derive(Clone, Debug)]
pub struct OperandInfo {
    /// Datatype and shape.
    pub spec: OperandSpec,
    /// How the operand's storage is bound at run time.
    pub lifetime: OperandLifetime,
}

/// One graph node: an operation with its ordered operand lists.
#[derive(Clone, Debug)]
pub struct Operation {
    /// The operation code and its options.
    pub op: Op,
    /// Input operand ids, in the order the code expects.
    pub inputs: Vec<OperandId>,
    /// Output operand ids.
    pub outputs: Vec<OperandId>,
}

/// Accumulates operands and operations for a model under construction.
///
/// Per-call errors (bad constant sizes, out-of-range ids, duplicate
/// producers, invalid options) are reported by the method that caused them
/// and leave the builder unchanged; whole-graph checks run in
/// [`finish`](Self::finish).
#[derive(Debug, Default)]
pub struct ModelBuilder {
    operands: Vec<OperandSpec>,
    values: HashMap<OperandId, Arc<[u8]>>,
    operations: Vec<Operation>,
    inputs: Vec<OperandId>,
    outputs: Vec<OperandId>,
}

impl ModelBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an operand and return its id.
    pub fn add_operand(&mut self, spec: OperandSpec) -> OperandId {
        let id = OperandId(self.operands.len() as u32);
        self.operands.push(spec);
        id
    }

    /// Declare a constant operand with its value bound immediately.
    ///
    /// The byte length must equal the spec's size exactly.
    pub fn add_constant(
        &mut self,
        spec: OperandSpec,
        bytes: impl Into<Arc<[u8]>>,
    ) -> Result<OperandId, ValidationError> {
        let bytes = bytes.into();
        let want = spec.size_bytes();
        if bytes.len() != want {
            return Err(ValidationError::ConstantSizeMismatch {
                id: self.operands.len() as u32,
                want,
                got: bytes.len(),
            });
        }
        let id = self.add_operand(spec);
        self.values.insert(id, bytes);
        Ok(id)
    }

    /// Append an operation consuming `inputs` and producing `outputs`.
    ///
    /// Every referenced id must already be declared and no output may
    /// already have a producer. Arity and shape compatibility are not
    /// checked here; that happens at compile time.
    pub fn add_operation(
        &mut self,
        op: Op,
        inputs: Vec<OperandId>,
        outputs: Vec<OperandId>,
    ) -> Result<OperationId, ValidationError> {
        op.check_options()?;
        for &id in inputs.iter().chain(outputs.iter()) {
            if id.0 as usize >= self.operands.len() {
                return Err(ValidationError::OperandOutOfRange {
                    id: id.0,
                    count: self.operands.len(),
                });
            }
        }
        for &out in &outputs {
            if let Some(i) = self.operations.iter().position(|n| n.outputs.contains(&out)) {
                return Err(ValidationError::DuplicateProducer {
                    id: out.0,
                    producer: i as u32,
                });
            }
        }
        let id = OperationId(self.operations.len() as u32);
        self.operations.push(Operation { op, inputs, outputs });
        Ok(id)
    }

    /// Designate the operands the caller binds per execution.
    ///
    /// Replaces any previous designation.
    pub fn identify_inputs_outputs(&mut self, inputs: &[OperandId], outputs: &[OperandId]) {
        self.inputs = inputs.to_vec();
        self.outputs = outputs.to_vec();
    }

    /// Seal the builder into an immutable [`Model`].
    ///
    /// Validates the whole graph: positive operand dimensions, designation
    /// lists, operand sourcing, single-producer and acyclicity invariants,
    /// and assigns each operand its lifetime class.
    pub fn finish(self) -> Result<Model, ValidationError> {
        let ModelBuilder {
            operands,
            values,
            operations,
            inputs,
            outputs,
        } = self;

        if operations.is_empty() {
            return Err(ValidationError::NoOperations);
        }
        if outputs.is_empty() {
            return Err(ValidationError::NoOutputs);
        }

        // Shape arithmetic downstream assumes every extent is at least one.
        for (i, spec) in operands.iter().enumerate() {
            if let Some(axis) = spec.shape.dims.iter().position(|&d| d == 0) {
                return Err(ValidationError::ZeroDimension { id: i as u32, axis });
            }
        }

        let count = operands.len();
        let mut seen = HashSet::new();
        for &id in inputs.iter().chain(outputs.iter()) {
            if id.0 as usize >= count {
                return Err(ValidationError::OperandOutOfRange { id: id.0, count });
            }
            if !seen.insert(id) {
                return Err(ValidationError::DuplicateDesignation { id: id.0 });
            }
        }

        // add_operation enforced single producers, so this map is total.
        let mut producer: HashMap<OperandId, OperationId> = HashMap::new();
        for (i, node) in operations.iter().enumerate() {
            for &out in &node.outputs {
                producer.insert(out, OperationId(i as u32));
            }
        }

        for &id in &inputs {
            if values.contains_key(&id) {
                return Err(ValidationError::InputIsConstant { id: id.0 });
            }
            if producer.contains_key(&id) {
                return Err(ValidationError::InputHasProducer { id: id.0 });
            }
        }
        for &id in &outputs {
            if !producer.contains_key(&id) {
                return Err(ValidationError::OutputWithoutProducer { id: id.0 });
            }
        }
        for i in 0..count {
            let id = OperandId(i as u32);
            if values.contains_key(&id) && producer.contains_key(&id) {
                return Err(ValidationError::ConstantHasProducer { id: id.0 });
            }
        }

        // Every consumed operand needs a source: a constant value, a
        // producing operation, or a runtime input slot.
        for node in &operations {
            for &inp in &node.inputs {
                let sourced = values.contains_key(&inp)
                    || producer.contains_key(&inp)
                    || inputs.contains(&inp);
                if !sourced {
                    return Err(ValidationError::NeverProduced { id: inp.0 });
                }
            }
        }

        let order = kahn_order(&operations);
        if order.len() != operations.len() {
            return Err(ValidationError::Cycle {
                visited: order.len(),
                count: operations.len(),
            });
        }

        let operands = operands
            .into_iter()
            .enumerate()
            .map(|(i, spec)| {
                let id = OperandId(i as u32);
                let lifetime = if values.contains_key(&id) {
                    OperandLifetime::Constant
                } else if inputs.contains(&id) {
                    OperandLifetime::Input
                } else if outputs.contains(&id) {
                    OperandLifetime::Output
                } else {
                    OperandLifetime::Internal
                };
                OperandInfo { spec, lifetime }
            })
            .collect();

        Ok(Model {
            operands,
            operations,
            values,
            inputs,
            outputs,
            producer,
        })
    }
}

/// A sealed operand/operation graph, ready for compilation.
///
/// Models are immutable and shared via [`Arc`]; compilation and execution
/// only ever read them.
#[derive(Debug)]
pub struct Model {
    operands: Vec<OperandInfo>,
    operations: Vec<Operation>,
    values: HashMap<OperandId, Arc<[u8]>>,
    inputs: Vec<OperandId>,
    outputs: Vec<OperandId>,
    producer: HashMap<OperandId, OperationId>,
}

impl Model {
    /// Number of declared operands.
    pub fn operand_count(&self) -> usize {
        self.operands.len()
    }

    /// Look up an operand's spec and lifetime.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not declared on this model.
    pub fn operand(&self, id: OperandId) -> &OperandInfo {
        &self.operands[id.0 as usize]
    }

    /// All operations in declaration order.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Look up one operation.
    pub fn operation(&self, id: OperationId) -> &Operation {
        &self.operations[id.0 as usize]
    }

    /// Designated runtime inputs, in designation order.
    pub fn inputs(&self) -> &[OperandId] {
        &self.inputs
    }

    /// Designated runtime outputs, in designation order.
    pub fn outputs(&self) -> &[OperandId] {
        &self.outputs
    }

    /// The constant value bound to an operand, if any.
    pub fn value(&self, id: OperandId) -> Option<&Arc<[u8]>> {
        self.values.get(&id)
    }

    /// The operation that writes an operand, if any.
    pub fn producer(&self, id: OperandId) -> Option<OperationId> {
        self.producer.get(&id).copied()
    }

    /// All operations that read an operand.
    pub fn consumers(&self, id: OperandId) -> Vec<OperationId> {
        self.operations
            .iter()
            .enumerate()
            .filter(|(_, n)| n.inputs.contains(&id))
            .map(|(i, _)| OperationId(i as u32))
            .collect()
    }

    /// Operations in dependency order.
    ///
    /// Deterministic: among ready operations, the one declared first is
    /// emitted first.
    pub fn execution_order(&self) -> Vec<OperationId> {
        let order = kahn_order(&self.operations);
        assert!(
            order.len() == self.operations.len(),
            "execution_order: sealed model contains a cycle ({} of {} operations visited)",
            order.len(),
            self.operations.len(),
        );
        order.into_iter().map(|i| OperationId(i as u32)).collect()
    }
}

/// Kahn's algorithm over operation indices.
///
/// Returns indices in dependency order; a short result means a cycle. The
/// ready set is ordered by declaration index, which makes ties
/// deterministic.
fn kahn_order(operations: &[Operation]) -> Vec<usize> {
    let mut producer: HashMap<OperandId, usize> = HashMap::new();
    for (i, node) in operations.iter().enumerate() {
        for &out in &node.outputs {
            producer.insert(out, i);
        }
    }

    let n = operations.len();
    let mut in_degree = vec![0usize; n];
    let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (ci, node) in operations.iter().enumerate() {
        for &inp in &node.inputs {
            if let Some(&pi) = producer.get(&inp) {
                in_degree[ci] += 1;
                consumers[pi].push(ci);
            }
        }
    }

    let mut ready: BTreeSet<usize> = BTreeSet::new();
    for (i, &deg) in in_degree.iter().enumerate() {
        if deg == 0 {
            ready.insert(i);
        }
    }

    let mut order = Vec::with_capacity(n);
    while let Some(&idx) = ready.iter().next() {
        ready.remove(&idx);
        order.push(idx);
        for &ci in &consumers[idx] {
            in_degree[ci] -= 1;
            if in_degree[ci] == 0 {
                ready.insert(ci);
            }
        }
    }

    order
}
