//! Serialized graph format: decode bytes into sealed models and back.
//!
//! The wire format is a protobuf [`GraphDef`](proto::GraphDef). Operand
//! indices on the wire map one-to-one onto [`OperandId`]s, so a decoded
//! model's ids match the payload and a re-encoded payload round-trips.

#![warn(missing_docs)]

pub mod proto;

use prost::Message;

use nnrt_model::{
    DataType, FuseCode, Model, ModelBuilder, Op, OperandId, OperandLifetime, OperandSpec, Padding,
    PaddingCode, ValidationError,
};

use proto::operation_def::Options;
use proto::{data_type, fuse_code, padding_code};

/// Errors raised while decoding a graph payload.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    /// The payload is not a valid protobuf graph.
    #[error("malformed graph payload")]
    Decode(#[from] prost::DecodeError),
    /// An operation carries no options message, so its code is unknown.
    #[error("operation {index} carries no options")]
    MissingOptions {
        /// The operation's index in the payload.
        index: usize,
    },
    /// An enum field holds a value outside its defined constants.
    #[error("operation {index}: bad {field} code {value}")]
    BadCode {
        /// The operation's index in the payload.
        index: usize,
        /// Which field held the bad value.
        field: &'static str,
        /// The offending value.
        value: i32,
    },
    /// An operand declaration is malformed.
    #[error("operand {index}: {reason}")]
    BadOperand {
        /// The operand's index in the payload.
        index: usize,
        /// What was wrong with it.
        reason: String,
    },
    /// The decoded graph fails model validation.
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Decode a serialized graph into a sealed model.
pub fn import_bytes(raw: &[u8]) -> Result<Model, ImportError> {
    let graph = proto::GraphDef::decode(raw)?;
    log::debug!(
        "importing graph '{}': {} operands, {} operations",
        graph.name,
        graph.operands.len(),
        graph.operations.len()
    );

    let mut builder = ModelBuilder::new();
    for (index, operand) in graph.operands.iter().enumerate() {
        let dtype = match operand.dtype {
            data_type::FLOAT32 => DataType::Float32,
            data_type::INT32 => DataType::Int32,
            data_type::QUANT8_ASYMM => DataType::Quant8Asymm {
                scale: operand.scale,
                zero_point: operand.zero_point,
            },
            other => {
                return Err(ImportError::BadOperand {
                    index,
                    reason: format!("unknown data type code {other}"),
                })
            }
        };
        let spec = OperandSpec::new(dtype, &operand.dims);
        match &operand.data {
            Some(bytes) => {
                builder.add_constant(spec, bytes.as_slice())?;
            }
            None => {
                builder.add_operand(spec);
            }
        }
    }

    for (index, operation) in graph.operations.iter().enumerate() {
        let options = operation
            .options
            .as_ref()
            .ok_or(ImportError::MissingOptions { index })?;
        let op = op_from_options(index, options)?;
        let inputs = operation.inputs.iter().map(|i| OperandId(*i)).collect();
        let outputs = operation.outputs.iter().map(|i| OperandId(*i)).collect();
        builder.add_operation(op, inputs, outputs)?;
    }

    let inputs: Vec<OperandId> = graph.inputs.iter().map(|i| OperandId(*i)).collect();
    let outputs: Vec<OperandId> = graph.outputs.iter().map(|i| OperandId(*i)).collect();
    builder.identify_inputs_outputs(&inputs, &outputs);
    Ok(builder.finish()?)
}

/// Encode a sealed model back into the wire format.
pub fn export_bytes(model: &Model) -> Vec<u8> {
    let mut operands = Vec::with_capacity(model.operand_count());
    for i in 0..model.operand_count() {
        let id = OperandId(i as u32);
        let info = model.operand(id);
        let (dtype, scale, zero_point) = match info.spec.dtype {
            DataType::Float32 => (data_type::FLOAT32, 0.0, 0),
            DataType::Int32 => (data_type::INT32, 0.0, 0),
            DataType::Quant8Asymm { scale, zero_point } => {
                (data_type::QUANT8_ASYMM, scale, zero_point)
            }
        };
        let data = if info.lifetime == OperandLifetime::Constant {
            model.value(id).map(|v| v.to_vec())
        } else {
            None
        };
        operands.push(proto::OperandDef {
            dtype,
            dims: info.spec.shape.dims.clone(),
            scale,
            zero_point,
            data,
        });
    }

    let operations = model
        .operations()
        .iter()
        .map(|operation| proto::OperationDef {
            inputs: operation.inputs.iter().map(|id| id.0).collect(),
            outputs: operation.outputs.iter().map(|id| id.0).collect(),
            options: Some(options_from_op(&operation.op)),
        })
        .collect();

    let graph = proto::GraphDef {
        name: String::new(),
        operands,
        operations,
        inputs: model.inputs().iter().map(|id| id.0).collect(),
        outputs: model.outputs().iter().map(|id| id.0).collect(),
    };
    graph.encode_to_vec()
}

fn fuse_from(index: usize, value: i32) -> Result<FuseCode, ImportError> {
    match value {
        fuse_code::NONE => Ok(FuseCode::None),
        fuse_code::RELU => Ok(FuseCode::Relu),
        fuse_code::RELU1 => Ok(FuseCode::Relu1),
        fuse_code::RELU6 => Ok(FuseCode::Relu6),
        _ => Err(ImportError::BadCode {
            index,
            field: "fuse",
            value,
        }),
    }
}

fn fuse_to(fuse: FuseCode) -> i32 {
    match fuse {
        FuseCode::None => fuse_code::NONE,
        FuseCode::Relu => fuse_code::RELU,
        FuseCode::Relu1 => fuse_code::RELU1,
        FuseCode::Relu6 => fuse_code::RELU6,
    }
}

fn padding_from(index: usize, def: Option<&proto::PaddingDef>) -> Result<Padding, ImportError> {
    let def = def.ok_or(ImportError::MissingOptions { index })?;
    match def.code {
        padding_code::SAME => Ok(Padding::Coded(PaddingCode::Same)),
        padding_code::VALID => Ok(Padding::Coded(PaddingCode::Valid)),
        padding_code::EXPLICIT => Ok(Padding::Explicit {
            left: def.left,
            right: def.right,
            top: def.top,
            bottom: def.bottom,
        }),
        value => Err(ImportError::BadCode {
            index,
            field: "padding",
            value,
        }),
    }
}

fn padding_to(padding: &Padding) -> proto::PaddingDef {
    match padding {
        Padding::Coded(PaddingCode::Same) => proto::PaddingDef {
            code: padding_code::SAME,
            ..Default::default()
        },
        Padding::Coded(PaddingCode::Valid) => proto::PaddingDef {
            code: padding_code::VALID,
            ..Default::default()
        },
        Padding::Explicit {
            left,
            right,
            top,
            bottom,
        } => proto::PaddingDef {
            code: padding_code::EXPLICIT,
            left: *left,
            right: *right,
            top: *top,
            bottom: *bottom,
        },
    }
}

fn op_from_options(index: usize, options: &Options) -> Result<Op, ImportError> {
    Ok(match options {
        Options::Add(o) => Op::Add {
            fuse: fuse_from(index, o.fuse)?,
        },
        Options::Mul(o) => Op::Mul {
            fuse: fuse_from(index, o.fuse)?,
        },
        Options::Conv2d(o) => Op::Conv2d {
            padding: padding_from(index, o.padding.as_ref())?,
            stride: [o.stride_h, o.stride_w],
            fuse: fuse_from(index, o.fuse)?,
        },
        Options::DepthwiseConv2d(o) => Op::DepthwiseConv2d {
            padding: padding_from(index, o.padding.as_ref())?,
            stride: [o.stride_h, o.stride_w],
            depth_multiplier: o.depth_multiplier,
            fuse: fuse_from(index, o.fuse)?,
        },
        Options::AveragePool2d(o) => Op::AveragePool2d {
            padding: padding_from(index, o.padding.as_ref())?,
            stride: [o.stride_h, o.stride_w],
            filter: [o.filter_h, o.filter_w],
            fuse: fuse_from(index, o.fuse)?,
        },
        Options::MaxPool2d(o) => Op::MaxPool2d {
            padding: padding_from(index, o.padding.as_ref())?,
            stride: [o.stride_h, o.stride_w],
            filter: [o.filter_h, o.filter_w],
            fuse: fuse_from(index, o.fuse)?,
        },
        Options::FullyConnected(o) => Op::FullyConnected {
            fuse: fuse_from(index, o.fuse)?,
        },
        Options::Concatenation(o) => Op::Concatenation { axis: o.axis },
        Options::Reshape(_) => Op::Reshape,
        Options::Softmax(o) => Op::Softmax { beta: o.beta },
        Options::Logistic(_) => Op::Logistic,
        Options::Relu(_) => Op::Relu,
        Options::Relu1(_) => Op::Relu1,
        Options::Relu6(_) => Op::Relu6,
        Options::Tanh(_) => Op::Tanh,
        Options::ResizeBilinear(o) => Op::ResizeBilinear {
            out_height: o.out_height,
            out_width: o.out_width,
        },
        Options::Dequantize(_) => Op::Dequantize,
    })
}

fn options_from_op(op: &Op) -> Options {
    match op {
        Op::Add { fuse } => Options::Add(proto::FuseOptions {
            fuse: fuse_to(*fuse),
        }),
        Op::Mul { fuse } => Options::Mul(proto::FuseOptions {
            fuse: fuse_to(*fuse),
        }),
        Op::Conv2d {
            padding,
            stride,
            fuse,
        } => Options::Conv2d(proto::Conv2dOptions {
            padding: Some(padding_to(padding)),
            stride_h: stride[0],
            stride_w: stride[1],
            fuse: fuse_to(*fuse),
        }),
        Op::DepthwiseConv2d {
            padding,
            stride,
            depth_multiplier,
            fuse,
        } => Options::DepthwiseConv2d(proto::DepthwiseConv2dOptions {
            padding: Some(padding_to(padding)),
            stride_h: stride[0],
            stride_w: stride[1],
            depth_multiplier: *depth_multiplier,
            fuse: fuse_to(*fuse),
        }),
        Op::AveragePool2d {
            padding,
            stride,
            filter,
            fuse,
        } => Options::AveragePool2d(proto::Pool2dOptions {
            padding: Some(padding_to(padding)),
            stride_h: stride[0],
            stride_w: stride[1],
            filter_h: filter[0],
            filter_w: filter[1],
            fuse: fuse_to(*fuse),
        }),
        Op::MaxPool2d {
            padding,
            stride,
            filter,
            fuse,
        } => Options::MaxPool2d(proto::Pool2dOptions {
            padding: Some(padding_to(padding)),
            stride_h: stride[0],
            stride_w: stride[1],
            filter_h: filter[0],
            filter_w: filter[1],
            fuse: fuse_to(*fuse),
        }),
        Op::FullyConnected { fuse } => Options::FullyConnected(proto::FuseOptions {
            fuse: fuse_to(*fuse),
        }),
        Op::Concatenation { axis } => Options::Concatenation(proto::ConcatOptions { axis: *axis }),
        Op::Reshape => Options::Reshape(proto::NoOptions {}),
        Op::Softmax { beta } => Options::Softmax(proto::SoftmaxOptions { beta: *beta }),
        Op::Logistic => Options::Logistic(proto::NoOptions {}),
        Op::Relu => Options::Relu(proto::NoOptions {}),
        Op::Relu1 => Options::Relu1(proto::NoOptions {}),
        Op::Relu6 => Options::Relu6(proto::NoOptions {}),
        Op::Tanh => Options::Tanh(proto::NoOptions {}),
        Op::ResizeBilinear {
            out_height,
            out_width,
        } => Options::ResizeBilinear(proto::ResizeOptions {
            out_height: *out_height,
            out_width: *out_width,
        }),
        Op::Dequantize => Options::Dequantize(proto::NoOptions {}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn conv_graph() -> proto::GraphDef {
        proto::GraphDef {
            name: "conv".into(),
            operands: vec![
                // input 1x2x2x1
                proto::OperandDef {
                    dtype: data_type::FLOAT32,
                    dims: vec![1, 2, 2, 1],
                    ..Default::default()
                },
                // filter 1x1x1x1
                proto::OperandDef {
                    dtype: data_type::FLOAT32,
                    dims: vec![1, 1, 1, 1],
                    data: Some(f32_bytes(&[2.0])),
                    ..Default::default()
                },
                // bias [1]
                proto::OperandDef {
                    dtype: data_type::FLOAT32,
                    dims: vec![1],
                    data: Some(f32_bytes(&[0.5])),
                    ..Default::default()
                },
                // output 1x2x2x1
                proto::OperandDef {
                    dtype: data_type::FLOAT32,
                    dims: vec![1, 2, 2, 1],
                    ..Default::default()
                },
            ],
            operations: vec![proto::OperationDef {
                inputs: vec![0, 1, 2],
                outputs: vec![3],
                options: Some(Options::Conv2d(proto::Conv2dOptions {
                    padding: Some(proto::PaddingDef {
                        code: padding_code::SAME,
                        ..Default::default()
                    }),
                    stride_h: 1,
                    stride_w: 1,
                    fuse: fuse_code::RELU,
                })),
            }],
            inputs: vec![0],
            outputs: vec![3],
        }
    }

    #[test]
    fn conv_graph_imports() {
        let model = import_bytes(&conv_graph().encode_to_vec()).unwrap();
        assert_eq!(model.operand_count(), 4);
        assert_eq!(model.operations().len(), 1);
        assert_eq!(model.inputs(), &[OperandId(0)]);
        assert_eq!(model.outputs(), &[OperandId(3)]);
        assert_eq!(
            model.operand(OperandId(1)).lifetime,
            OperandLifetime::Constant
        );
        match &model.operations()[0].op {
            Op::Conv2d {
                padding,
                stride,
                fuse,
            } => {
                assert_eq!(*padding, Padding::Coded(PaddingCode::Same));
                assert_eq!(*stride, [1, 1]);
                assert_eq!(*fuse, FuseCode::Relu);
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn export_round_trips() {
        let model = import_bytes(&conv_graph().encode_to_vec()).unwrap();
        let again = import_bytes(&export_bytes(&model)).unwrap();
        assert_eq!(again.operand_count(), model.operand_count());
        assert_eq!(again.operations().len(), model.operations().len());
        assert_eq!(again.inputs(), model.inputs());
        assert_eq!(again.outputs(), model.outputs());
        assert_eq!(
            again.value(OperandId(1)).map(|v| v.to_vec()),
            model.value(OperandId(1)).map(|v| v.to_vec())
        );
    }

    #[test]
    fn quantized_params_survive_the_wire() {
        let graph = proto::GraphDef {
            operands: vec![
                proto::OperandDef {
                    dtype: data_type::QUANT8_ASYMM,
                    dims: vec![4],
                    scale: 0.5,
                    zero_point: 128,
                    ..Default::default()
                },
                proto::OperandDef {
                    dtype: data_type::FLOAT32,
                    dims: vec![4],
                    ..Default::default()
                },
            ],
            operations: vec![proto::OperationDef {
                inputs: vec![0],
                outputs: vec![1],
                options: Some(Options::Dequantize(proto::NoOptions {})),
            }],
            inputs: vec![0],
            outputs: vec![1],
            ..Default::default()
        };
        let model = import_bytes(&graph.encode_to_vec()).unwrap();
        assert_eq!(
            model.operand(OperandId(0)).spec.dtype,
            DataType::Quant8Asymm {
                scale: 0.5,
                zero_point: 128
            }
        );
    }

    #[test]
    fn missing_options_is_rejected() {
        let graph = proto::GraphDef {
            operands: vec![
                proto::OperandDef {
                    dtype: data_type::FLOAT32,
                    dims: vec![1],
                    ..Default::default()
                },
                proto::OperandDef {
                    dtype: data_type::FLOAT32,
                    dims: vec![1],
                    ..Default::default()
                },
            ],
            operations: vec![proto::OperationDef {
                inputs: vec![0],
                outputs: vec![1],
                options: None,
            }],
            inputs: vec![0],
            outputs: vec![1],
            ..Default::default()
        };
        let err = import_bytes(&graph.encode_to_vec()).unwrap_err();
        assert!(matches!(err, ImportError::MissingOptions { index: 0 }));
    }

    #[test]
    fn bad_fuse_code_is_rejected() {
        let mut graph = conv_graph();
        if let Some(Options::Conv2d(o)) = &mut graph.operations[0].options {
            o.fuse = 99;
        }
        let err = import_bytes(&graph.encode_to_vec()).unwrap_err();
        assert!(matches!(
            err,
            ImportError::BadCode {
                field: "fuse",
                value: 99,
                ..
            }
        ));
    }

    #[test]
    fn unknown_dtype_is_rejected() {
        let graph = proto::GraphDef {
            operands: vec![proto::OperandDef {
                dtype: 42,
                dims: vec![1],
                ..Default::default()
            }],
            ..Default::default()
        };
        let err = import_bytes(&graph.encode_to_vec()).unwrap_err();
        assert!(matches!(err, ImportError::BadOperand { index: 0, .. }));
    }

    #[test]
    fn zero_extent_operand_is_rejected() {
        let mut graph = conv_graph();
        graph.operands[0].dims = vec![1, 0, 0, 1];
        let err = import_bytes(&graph.encode_to_vec()).unwrap_err();
        assert!(matches!(
            err,
            ImportError::Invalid(ValidationError::ZeroDimension { id: 0, axis: 1 })
        ));
    }

    #[test]
    fn truncated_payload_is_a_decode_error() {
        let raw = conv_graph().encode_to_vec();
        let err = import_bytes(&raw[..raw.len() - 1]).unwrap_err();
        assert!(matches!(err, ImportError::Decode(_)));
    }
}
