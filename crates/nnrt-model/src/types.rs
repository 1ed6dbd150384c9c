//! Operand identifiers, element types, and shapes.

use std::fmt;

/// A unique identifier for an operand (tensor slot) within one model.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct OperandId(pub u32);

/// A unique identifier for an operation within one model.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct OperationId(pub u32);

/// Element type of an operand, with quantization parameters where needed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DataType {
    /// 32-bit IEEE float.
    Float32,
    /// 32-bit signed integer.
    Int32,
    /// Asymmetric 8-bit quantization: `real = (raw - zero_point) * scale`.
    Quant8Asymm {
        /// Step size between representable real values.
        scale: f32,
        /// Raw value that maps to real zero, in `0..=255`.
        zero_point: i32,
    },
}

impl DataType {
    /// Size of one element in bytes.
    pub fn elem_bytes(self) -> usize {
        match self {
            Self::Float32 | Self::Int32 => 4,
            Self::Quant8Asymm { .. } => 1,
        }
    }

    /// Whether this type carries quantization parameters.
    pub fn is_quantized(self) -> bool {
        matches!(self, Self::Quant8Asymm { .. })
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float32 => f.write_str("f32"),
            Self::Int32 => f.write_str("i32"),
            Self::Quant8Asymm { scale, zero_point } => {
                write!(f, "q8a(scale={scale}, zero={zero_point})")
            }
        }
    }
}

/// A tensor shape: ordered positive dimensions, outermost first.
///
/// Rank 0 (no dimensions) is a scalar holding one element.
#[derive(Clone, Debug, Default, Hash, Eq, PartialEq)]
pub struct Shape {
    /// Dimension extents.
    pub dims: Vec<u32>,
}

impl Shape {
    /// Create a shape from dimension extents.
    pub fn new(dims: &[u32]) -> Self {
        Self {
            dims: dims.to_vec(),
        }
    }

    /// The rank-0 scalar shape.
    pub fn scalar() -> Self {
        Self::default()
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements (1 for scalars).
    pub fn elem_count(&self) -> usize {
        self.dims.iter().map(|&d| d as usize).product()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{d}")?;
        }
        f.write_str("]")
    }
}

/// Static description of an operand: element type plus shape.
#[derive(Clone, Debug, PartialEq)]
pub struct OperandSpec {
    /// Element type.
    pub dtype: DataType,
    /// Tensor shape.
    pub shape: Shape,
}

impl OperandSpec {
    /// Create a spec from an element type and dimension extents.
    pub fn new(dtype: DataType, dims: &[u32]) -> Self {
        Self {
            dtype,
            shape: Shape::new(dims),
        }
    }

    /// Total size of the operand's data in bytes.
    pub fn size_bytes(&self) -> usize {
        self.shape.elem_count() * self.dtype.elem_bytes()
    }
}

impl fmt::Display for OperandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.dtype, self.shape)
    }
}

/// How an operand's storage is provided.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperandLifetime {
    /// Bound by the caller for each execution.
    Input,
    /// Bound by the caller for each execution.
    Output,
    /// Value fixed at build time, owned by the model.
    Constant,
    /// Produced and consumed inside the plan, backed by scratch.
    Internal,
}

impl fmt::Display for OperandLifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Constant => "constant",
            Self::Internal => "internal",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elem_bytes_per_type() {
        assert_eq!(DataType::Float32.elem_bytes(), 4);
        assert_eq!(DataType::Int32.elem_bytes(), 4);
        assert_eq!(
            DataType::Quant8Asymm {
                scale: 0.5,
                zero_point: 128
            }
            .elem_bytes(),
            1
        );
    }

    #[test]
    fn quantized_flag() {
        assert!(!DataType::Float32.is_quantized());
        assert!(!DataType::Int32.is_quantized());
        assert!(DataType::Quant8Asymm {
            scale: 1.0,
            zero_point: 0
        }
        .is_quantized());
    }

    #[test]
    fn shape_elem_count() {
        assert_eq!(Shape::new(&[1, 224, 224, 3]).elem_count(), 150_528);
        assert_eq!(Shape::new(&[4]).elem_count(), 4);
        assert_eq!(Shape::scalar().elem_count(), 1);
    }

    #[test]
    fn spec_size_bytes() {
        let spec = OperandSpec::new(DataType::Float32, &[1, 2, 3]);
        assert_eq!(spec.size_bytes(), 24);

        let quant = OperandSpec::new(
            DataType::Quant8Asymm {
                scale: 0.007_843,
                zero_point: 128,
            },
            &[1, 2, 3],
        );
        assert_eq!(quant.size_bytes(), 6);
    }

    #[test]
    fn display_forms() {
        assert_eq!(format!("{}", DataType::Float32), "f32");
        assert_eq!(format!("{}", Shape::new(&[1, 4])), "[1, 4]");
        assert_eq!(format!("{}", Shape::scalar()), "[]");
        let spec = OperandSpec::new(DataType::Int32, &[2]);
        assert_eq!(format!("{spec}"), "i32[2]");
        assert_eq!(format!("{}", OperandLifetime::Constant), "constant");
    }
}
