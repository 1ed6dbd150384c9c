#![warn(missing_docs)]
//! Backend trait and plugin architecture for the nnrt engine.
//!
//! Defines the [`Backend`] trait that all kernel executors implement, the
//! resolved [`Kernel`] records compilation hands to them, borrowed tensor
//! views for buffer I/O, and a [`BackendRegistry`] that ranks backends by a
//! caller preference.

use std::fmt::{self, Debug};
use std::sync::Arc;

use nnrt_model::{FuseCode, OperandSpec};

/// Explicit spatial padding in elements, resolved from a padding code.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PadAmounts {
    /// Rows added above the input.
    pub top: u32,
    /// Rows added below the input.
    pub bottom: u32,
    /// Columns added left of the input.
    pub left: u32,
    /// Columns added right of the input.
    pub right: u32,
}

impl fmt::Display for PadAmounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {}]",
            self.top, self.bottom, self.left, self.right
        )
    }
}

/// A fully resolved operation: symbolic padding already turned into explicit
/// amounts, ready for a backend to execute.
///
/// Stride and filter pairs are `[height, width]`.
#[derive(Clone, Debug, PartialEq)]
pub enum KernelOp {
    /// Element-wise addition with broadcasting.
    Add,
    /// Element-wise multiplication with broadcasting.
    Mul,
    /// 2-D convolution.
    Conv2d {
        /// Window step.
        stride: [u32; 2],
        /// Resolved padding.
        pad: PadAmounts,
    },
    /// Depthwise 2-D convolution.
    DepthwiseConv2d {
        /// Window step.
        stride: [u32; 2],
        /// Resolved padding.
        pad: PadAmounts,
        /// Output channels per input channel.
        depth_multiplier: u32,
    },
    /// Average pooling.
    AveragePool2d {
        /// Window step.
        stride: [u32; 2],
        /// Window extent.
        filter: [u32; 2],
        /// Resolved padding.
        pad: PadAmounts,
    },
    /// Max pooling.
    MaxPool2d {
        /// Window step.
        stride: [u32; 2],
        /// Window extent.
        filter: [u32; 2],
        /// Resolved padding.
        pad: PadAmounts,
    },
    /// Dense layer.
    FullyConnected,
    /// Concatenation along an axis.
    Concatenation {
        /// Axis to join along.
        axis: u32,
    },
    /// Shape reinterpretation (byte copy).
    Reshape,
    /// Softmax over the last dimension.
    Softmax {
        /// Logit scaling.
        beta: f32,
    },
    /// Logistic sigmoid.
    Logistic,
    /// `max(0, x)`.
    Relu,
    /// Clamp to `[-1, 1]`.
    Relu1,
    /// Clamp to `[0, 6]`.
    Relu6,
    /// Hyperbolic tangent.
    Tanh,
    /// Bilinear spatial resize.
    ResizeBilinear {
        /// Output rows.
        out_height: u32,
        /// Output columns.
        out_width: u32,
    },
    /// Quantized-to-float conversion.
    Dequantize,
}

impl KernelOp {
    /// Operation code name, matching the model-level spelling.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Mul => "MUL",
            Self::Conv2d { .. } => "CONV_2D",
            Self::DepthwiseConv2d { .. } => "DEPTHWISE_CONV_2D",
            Self::AveragePool2d { .. } => "AVERAGE_POOL_2D",
            Self::MaxPool2d { .. } => "MAX_POOL_2D",
            Self::FullyConnected => "FULLY_CONNECTED",
            Self::Concatenation { .. } => "CONCATENATION",
            Self::Reshape => "RESHAPE",
            Self::Softmax { .. } => "SOFTMAX",
            Self::Logistic => "LOGISTIC",
            Self::Relu => "RELU",
            Self::Relu1 => "RELU1",
            Self::Relu6 => "RELU6",
            Self::Tanh => "TANH",
            Self::ResizeBilinear { .. } => "RESIZE_BILINEAR",
            Self::Dequantize => "DEQUANTIZE",
        }
    }
}

impl fmt::Display for KernelOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conv2d { stride, pad } => write!(
                f,
                "CONV_2D(stride=[{}, {}], pad={pad})",
                stride[0], stride[1]
            ),
            Self::DepthwiseConv2d {
                stride,
                pad,
                depth_multiplier,
            } => write!(
                f,
                "DEPTHWISE_CONV_2D(stride=[{}, {}], pad={pad}, mult={depth_multiplier})",
                stride[0], stride[1]
            ),
            Self::AveragePool2d {
                stride,
                filter,
                pad,
            } => write!(
                f,
                "AVERAGE_POOL_2D(filter=[{}, {}], stride=[{}, {}], pad={pad})",
                filter[0], filter[1], stride[0], stride[1]
            ),
            Self::MaxPool2d {
                stride,
                filter,
                pad,
            } => write!(
                f,
                "MAX_POOL_2D(filter=[{}, {}], stride=[{}, {}], pad={pad})",
                filter[0], filter[1], stride[0], stride[1]
            ),
            Self::Concatenation { axis } => write!(f, "CONCATENATION(axis={axis})"),
            Self::Softmax { beta } => write!(f, "SOFTMAX(beta={beta})"),
            Self::ResizeBilinear {
                out_height,
                out_width,
            } => write!(f, "RESIZE_BILINEAR(out=[{out_height}, {out_width}])"),
            other => f.write_str(other.name()),
        }
    }
}

/// One executable plan step: a resolved operation, its fused activation, and
/// the specs of the buffers it reads and writes.
#[derive(Clone, Debug, PartialEq)]
pub struct Kernel {
    /// The resolved operation.
    pub op: KernelOp,
    /// Activation applied to the result before it is stored.
    pub fuse: FuseCode,
    /// Input buffer specs, in operation order.
    pub inputs: Vec<OperandSpec>,
    /// Output buffer specs.
    pub outputs: Vec<OperandSpec>,
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op)?;
        if self.fuse != FuseCode::None {
            write!(f, " fuse={}", self.fuse)?;
        }
        f.write_str(": ")?;
        for (i, spec) in self.inputs.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{spec}")?;
        }
        f.write_str(" -> ")?;
        for (i, spec) in self.outputs.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{spec}")?;
        }
        Ok(())
    }
}

/// A read-only tensor buffer handed to a backend.
#[derive(Clone, Copy, Debug)]
pub struct TensorView<'a> {
    /// Datatype and shape of the buffer.
    pub spec: &'a OperandSpec,
    /// Raw little-endian element bytes.
    pub data: &'a [u8],
}

/// A writable tensor buffer handed to a backend.
#[derive(Debug)]
pub struct TensorViewMut<'a> {
    /// Datatype and shape of the buffer.
    pub spec: &'a OperandSpec,
    /// Raw little-endian element bytes.
    pub data: &'a mut [u8],
}

/// Errors a backend can raise while executing a kernel.
#[derive(Debug, thiserror::Error)]
pub enum BackendExecutionError {
    /// The kernel is outside this backend's support matrix.
    #[error("unsupported kernel: {0}")]
    Unsupported(String),
    /// The backend failed while running the kernel.
    #[error("{0}")]
    Failed(String),
}

/// Relative performance ranks used for preference-based backend selection.
///
/// Each axis is an ordinal where lower is better; equal ranks fall back to
/// registration order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BackendProfile {
    /// Single-inference latency rank.
    pub latency: u8,
    /// Sustained throughput rank.
    pub throughput: u8,
    /// Power cost rank.
    pub power: u8,
}

impl Default for BackendProfile {
    fn default() -> Self {
        Self {
            latency: 1,
            throughput: 1,
            power: 1,
        }
    }
}

/// Caller's hint for backend selection.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum BackendPreference {
    /// Minimize battery/energy cost.
    LowPower,
    /// Minimize latency of a single inference.
    #[default]
    FastSingleAnswer,
    /// Maximize throughput of repeated inferences.
    SustainedSpeed,
    /// Require the named backend for every step, no fallback.
    Exact(String),
}

impl fmt::Display for BackendPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LowPower => f.write_str("low-power"),
            Self::FastSingleAnswer => f.write_str("fast-single-answer"),
            Self::SustainedSpeed => f.write_str("sustained-speed"),
            Self::Exact(name) => f.write_str(name),
        }
    }
}

/// A backend that executes resolved kernels.
pub trait Backend: Debug + Send + Sync {
    /// Stable name used for `Exact` preferences and plan dumps.
    fn name(&self) -> &str;

    /// Capability query: can this backend run `kernel`?
    ///
    /// Called at compile time; a `true` here is a promise that
    /// [`run`](Self::run) will not fail with `Unsupported`.
    fn supports(&self, kernel: &Kernel) -> bool;

    /// Execute one kernel against bound buffers.
    ///
    /// `inputs` and `outputs` line up with the kernel's spec lists; buffer
    /// byte lengths were validated by the caller.
    fn run(
        &self,
        kernel: &Kernel,
        inputs: &[TensorView<'_>],
        outputs: &mut [TensorViewMut<'_>],
    ) -> Result<(), BackendExecutionError>;

    /// Performance ranks used when ordering backends by preference.
    fn profile(&self) -> BackendProfile {
        BackendProfile::default()
    }
}

/// Little-endian conversions between raw tensor bytes and element slices.
///
/// Backends receive buffers as `[u8]`; these helpers widen and narrow them
/// without alignment requirements.
pub mod bytes {
    /// Decode packed little-endian f32 elements.
    pub fn f32_from_le(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// Encode f32 elements as packed little-endian bytes.
    pub fn f32_to_le(values: &[f32], out: &mut [u8]) {
        for (chunk, &v) in out.chunks_exact_mut(4).zip(values) {
            chunk.copy_from_slice(&v.to_le_bytes());
        }
    }

    /// Decode packed little-endian i32 elements.
    pub fn i32_from_le(bytes: &[u8]) -> Vec<i32> {
        bytes
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

}

/// Registry of available backends, used for dispatch assignment.
#[derive(Clone, Debug, Default)]
pub struct BackendRegistry {
    backends: Vec<Arc<dyn Backend>>,
    fallback: Option<usize>,
}

impl BackendRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a backend. Registration order breaks ranking ties.
    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        self.backends.push(backend);
    }

    /// Registers a backend and marks it as the software fallback used when
    /// a preferred backend lacks support for a step.
    pub fn register_fallback(&mut self, backend: Arc<dyn Backend>) {
        self.fallback = Some(self.backends.len());
        self.backends.push(backend);
    }

    /// Finds a backend by name.
    pub fn find(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.backends.iter().find(|b| b.name() == name).cloned()
    }

    /// The designated software fallback, if one was registered.
    pub fn fallback(&self) -> Option<Arc<dyn Backend>> {
        self.fallback.map(|i| Arc::clone(&self.backends[i]))
    }

    /// Backends ordered best-first for the given preference.
    ///
    /// `Exact` yields only the named backend (empty if unknown); the other
    /// preferences sort by the matching [`BackendProfile`] axis, keeping
    /// registration order among equals.
    pub fn ranked(&self, pref: &BackendPreference) -> Vec<Arc<dyn Backend>> {
        if let BackendPreference::Exact(name) = pref {
            return self.find(name).into_iter().collect();
        }
        let mut out = self.backends.clone();
        out.sort_by_key(|b| {
            let p = b.profile();
            match pref {
                BackendPreference::LowPower => p.power,
                BackendPreference::FastSingleAnswer => p.latency,
                BackendPreference::SustainedSpeed | BackendPreference::Exact(_) => p.throughput,
            }
        });
        out
    }

    /// Names of all registered backends, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Number of registered backends.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Whether no backends are registered.
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
