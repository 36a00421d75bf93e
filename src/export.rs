//! Network-to-artifact conversion.
//!
//! The exporter traces a [`Network`](crate::zoo::Network) with a
//! representative input shape, lowering each layer to ONNX nodes with the
//! weights embedded as initializers. The declared tensor interface is fixed:
//! the graph input is named [`INPUT_NAME`], the graph output [`OUTPUT_NAME`],
//! so downstream consumers need no per-variant configuration.

use std::error::Error;
use std::fmt;
use std::io;
use std::path::Path;

use modelprep_onnx::proto::{
    data_type, AttributeProto, Dim, GraphProto, ModelProto, NodeProto, OperatorSetIdProto,
    TensorProto, ValueInfoProto,
};

use crate::artifact::{write_atomic, ModelArtifact, Provenance};
use crate::config::{BatchMode, InputSpec};
use crate::zoo::{Layer, Network};

/// Name of the declared graph input tensor across all artifacts.
pub const INPUT_NAME: &str = "input";

/// Name of the declared graph output tensor across all artifacts.
pub const OUTPUT_NAME: &str = "output";

/// Dim-param used for a symbolic batch dimension.
pub const BATCH_DIM_PARAM: &str = "batch_size";

/// Opset used when the caller does not choose one.
pub const DEFAULT_OPSET: i64 = 11;

/// Lowest opset the emitted operator set is valid for.
pub const MIN_OPSET: i64 = 9;

/// Highest opset the emitted operator set is valid for.
pub const MAX_OPSET: i64 = 13;

/// Errors from [`export`].
#[derive(Debug)]
pub enum ExportError {
    /// The requested graph version is outside the supported range.
    UnsupportedOpset(i64),

    /// The network could not be traced with the given input shape.
    Trace(String),

    /// Writing the artifact failed.
    Io(io::Error),
}

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportError::UnsupportedOpset(v) => write!(
                f,
                "unsupported opset version {} (supported: {}-{})",
                v, MIN_OPSET, MAX_OPSET
            ),
            ExportError::Trace(reason) => write!(f, "trace error: {}", reason),
            ExportError::Io(err) => write!(f, "write error: {}", err),
        }
    }
}

impl Error for ExportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ExportError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ExportError {
    fn from(err: io::Error) -> ExportError {
        ExportError::Io(err)
    }
}

/// Shape of the value flowing through the trace, per-sample (no batch dim).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TraceShape {
    Spatial { c: usize, h: usize, w: usize },
    Flat(usize),
}

impl fmt::Display for TraceShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceShape::Spatial { c, h, w } => write!(f, "{}x{}x{}", c, h, w),
            TraceShape::Flat(n) => write!(f, "{}", n),
        }
    }
}

/// Convert `network` into a serialized ONNX artifact at `path`.
///
/// The network is put into inference-only mode before tracing, so
/// training-time layers leave no nodes in the graph. The file is written
/// atomically: either a complete artifact exists at `path` afterwards or the
/// previous state is untouched. Overwrites unconditionally; confirmation
/// policy belongs to the orchestrator.
pub fn export(
    network: &mut Network,
    spec: &InputSpec,
    path: &Path,
    opset: i64,
) -> Result<ModelArtifact, ExportError> {
    if !(MIN_OPSET..=MAX_OPSET).contains(&opset) {
        return Err(ExportError::UnsupportedOpset(opset));
    }
    network.set_eval();

    let graph = trace_graph(network, spec)?;
    let model = ModelProto {
        ir_version: 7,
        producer_name: "modelprep".to_string(),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        graph: Some(graph),
        opset_import: vec![OperatorSetIdProto {
            domain: String::new(),
            version: opset,
        }],
    };

    let bytes = modelprep_onnx::encode_model(&model);
    write_atomic(path, &bytes)?;

    Ok(ModelArtifact::new(
        path.to_path_buf(),
        bytes.len() as u64,
        Provenance::Exported,
    ))
}

/// Walk the network once, checking shapes and emitting nodes/initializers.
fn trace_graph(network: &Network, spec: &InputSpec) -> Result<GraphProto, ExportError> {
    let mut nodes: Vec<NodeProto> = Vec::new();
    let mut initializers: Vec<TensorProto> = Vec::new();

    let mut shape = TraceShape::Spatial {
        c: spec.channels,
        h: spec.height,
        w: spec.width,
    };
    let mut cursor = INPUT_NAME.to_string();

    for (index, layer) in network.inference_layers().enumerate() {
        match layer {
            Layer::Conv {
                name,
                in_channels,
                out_channels,
                kernel,
                stride,
                pad,
                weight,
                bias,
            } => {
                let (c, h, w) = expect_spatial(&shape, name)?;
                if c != *in_channels {
                    return Err(ExportError::Trace(format!(
                        "layer {} expects {} input channels, got {}",
                        name, in_channels, c
                    )));
                }
                if weight.len() != out_channels * in_channels * kernel * kernel {
                    return Err(ExportError::Trace(format!(
                        "layer {} has {} weights, expected {}",
                        name,
                        weight.len(),
                        out_channels * in_channels * kernel * kernel
                    )));
                }
                let h_out = conv_out_size(h, *kernel, *stride, *pad)
                    .ok_or_else(|| collapsed(name, &shape))?;
                let w_out = conv_out_size(w, *kernel, *stride, *pad)
                    .ok_or_else(|| collapsed(name, &shape))?;

                let weight_name = format!("{}.weight", name);
                initializers.push(TensorProto::from_f32(
                    &weight_name,
                    &[
                        *out_channels as i64,
                        *in_channels as i64,
                        *kernel as i64,
                        *kernel as i64,
                    ],
                    weight,
                ));

                let out = format!("{}_out", name);
                let mut inputs = vec![cursor.as_str(), weight_name.as_str()];
                let bias_name = format!("{}.bias", name);
                if let Some(bias) = bias {
                    initializers.push(TensorProto::from_f32(
                        &bias_name,
                        &[*out_channels as i64],
                        bias,
                    ));
                    inputs.push(bias_name.as_str());
                }
                let mut node = NodeProto::new("Conv", name, &inputs, &[&out]);
                node.attribute = vec![
                    AttributeProto::ints("kernel_shape", &[*kernel as i64, *kernel as i64]),
                    AttributeProto::ints("strides", &[*stride as i64, *stride as i64]),
                    AttributeProto::ints(
                        "pads",
                        &[*pad as i64, *pad as i64, *pad as i64, *pad as i64],
                    ),
                ];
                nodes.push(node);

                cursor = out;
                shape = TraceShape::Spatial {
                    c: *out_channels,
                    h: h_out,
                    w: w_out,
                };
            }

            Layer::BatchNorm {
                name,
                scale,
                bias,
                mean,
                var,
                epsilon,
            } => {
                let (c, ..) = expect_spatial(&shape, name)?;
                if scale.len() != c {
                    return Err(ExportError::Trace(format!(
                        "layer {} normalizes {} channels, input has {}",
                        name,
                        scale.len(),
                        c
                    )));
                }
                let dims = [c as i64];
                let scale_name = format!("{}.weight", name);
                let bias_name = format!("{}.bias", name);
                let mean_name = format!("{}.running_mean", name);
                let var_name = format!("{}.running_var", name);
                initializers.push(TensorProto::from_f32(&scale_name, &dims, scale));
                initializers.push(TensorProto::from_f32(&bias_name, &dims, bias));
                initializers.push(TensorProto::from_f32(&mean_name, &dims, mean));
                initializers.push(TensorProto::from_f32(&var_name, &dims, var));

                let out = format!("{}_out", name);
                let mut node = NodeProto::new(
                    "BatchNormalization",
                    name,
                    &[
                        cursor.as_str(),
                        scale_name.as_str(),
                        bias_name.as_str(),
                        mean_name.as_str(),
                        var_name.as_str(),
                    ],
                    &[&out],
                );
                node.attribute = vec![AttributeProto::float("epsilon", *epsilon)];
                nodes.push(node);
                cursor = out;
            }

            Layer::Relu => {
                let name = format!("relu_{}", index);
                let out = format!("{}_out", name);
                nodes.push(NodeProto::new("Relu", &name, &[cursor.as_str()], &[&out]));
                cursor = out;
            }

            Layer::MaxPool { kernel, stride } => {
                let name = format!("pool_{}", index);
                let (c, h, w) = expect_spatial(&shape, &name)?;
                let h_out =
                    conv_out_size(h, *kernel, *stride, 0).ok_or_else(|| collapsed(&name, &shape))?;
                let w_out =
                    conv_out_size(w, *kernel, *stride, 0).ok_or_else(|| collapsed(&name, &shape))?;

                let out = format!("{}_out", name);
                let mut node = NodeProto::new("MaxPool", &name, &[cursor.as_str()], &[&out]);
                node.attribute = vec![
                    AttributeProto::ints("kernel_shape", &[*kernel as i64, *kernel as i64]),
                    AttributeProto::ints("strides", &[*stride as i64, *stride as i64]),
                ];
                nodes.push(node);
                cursor = out;
                shape = TraceShape::Spatial {
                    c,
                    h: h_out,
                    w: w_out,
                };
            }

            Layer::GlobalAvgPool => {
                let name = format!("global_pool_{}", index);
                let (c, ..) = expect_spatial(&shape, &name)?;
                let out = format!("{}_out", name);
                nodes.push(NodeProto::new(
                    "GlobalAveragePool",
                    &name,
                    &[cursor.as_str()],
                    &[&out],
                ));
                cursor = out;
                shape = TraceShape::Spatial { c, h: 1, w: 1 };
            }

            Layer::Flatten => {
                let name = format!("flatten_{}", index);
                let features = match shape {
                    TraceShape::Spatial { c, h, w } => c * h * w,
                    TraceShape::Flat(n) => n,
                };
                let out = format!("{}_out", name);
                let mut node = NodeProto::new("Flatten", &name, &[cursor.as_str()], &[&out]);
                node.attribute = vec![AttributeProto::int("axis", 1)];
                nodes.push(node);
                cursor = out;
                shape = TraceShape::Flat(features);
            }

            Layer::Dense {
                name,
                in_features,
                out_features,
                weight,
                bias,
            } => {
                let features = match shape {
                    TraceShape::Flat(n) => n,
                    TraceShape::Spatial { .. } => {
                        return Err(ExportError::Trace(format!(
                            "layer {} requires flattened input, got shape {}",
                            name, shape
                        )))
                    }
                };
                if features != *in_features {
                    return Err(ExportError::Trace(format!(
                        "layer {} expects {} input features, got {}",
                        name, in_features, features
                    )));
                }
                if weight.len() != out_features * in_features {
                    return Err(ExportError::Trace(format!(
                        "layer {} has {} weights, expected {}",
                        name,
                        weight.len(),
                        out_features * in_features
                    )));
                }
                let weight_name = format!("{}.weight", name);
                let bias_name = format!("{}.bias", name);
                initializers.push(TensorProto::from_f32(
                    &weight_name,
                    &[*out_features as i64, *in_features as i64],
                    weight,
                ));
                initializers.push(TensorProto::from_f32(
                    &bias_name,
                    &[*out_features as i64],
                    bias,
                ));

                let out = format!("{}_out", name);
                let mut node = NodeProto::new(
                    "Gemm",
                    name,
                    &[cursor.as_str(), weight_name.as_str(), bias_name.as_str()],
                    &[&out],
                );
                node.attribute = vec![
                    AttributeProto::float("alpha", 1.0),
                    AttributeProto::float("beta", 1.0),
                    AttributeProto::int("transB", 1),
                ];
                nodes.push(node);
                cursor = out;
                shape = TraceShape::Flat(*out_features);
            }

            // Skipped by inference_layers(); kept for match exhaustiveness.
            Layer::Dropout { .. } => continue,
        }
    }

    let last = match nodes.last_mut() {
        Some(node) => node,
        None => {
            return Err(ExportError::Trace(
                "network has no layers to trace".to_string(),
            ))
        }
    };
    last.output[0] = OUTPUT_NAME.to_string();

    let batch_dim = match spec.batch_mode {
        BatchMode::Fixed => Dim::fixed(spec.batch as i64),
        BatchMode::Symbolic => Dim::symbolic(BATCH_DIM_PARAM),
    };
    let input_info = ValueInfoProto::tensor(
        INPUT_NAME,
        data_type::FLOAT,
        vec![
            batch_dim.clone(),
            Dim::fixed(spec.channels as i64),
            Dim::fixed(spec.height as i64),
            Dim::fixed(spec.width as i64),
        ],
    );
    let output_dims = match shape {
        TraceShape::Flat(n) => vec![batch_dim, Dim::fixed(n as i64)],
        TraceShape::Spatial { c, h, w } => vec![
            batch_dim,
            Dim::fixed(c as i64),
            Dim::fixed(h as i64),
            Dim::fixed(w as i64),
        ],
    };
    let output_info = ValueInfoProto::tensor(OUTPUT_NAME, data_type::FLOAT, output_dims);

    Ok(GraphProto {
        node: nodes,
        name: network.name().to_string(),
        initializer: initializers,
        input: vec![input_info],
        output: vec![output_info],
        value_info: Vec::new(),
    })
}

fn expect_spatial(shape: &TraceShape, layer: &str) -> Result<(usize, usize, usize), ExportError> {
    match shape {
        TraceShape::Spatial { c, h, w } => Ok((*c, *h, *w)),
        TraceShape::Flat(_) => Err(ExportError::Trace(format!(
            "layer {} requires a spatial input, got shape {}",
            layer, shape
        ))),
    }
}

fn collapsed(layer: &str, shape: &TraceShape) -> ExportError {
    ExportError::Trace(format!(
        "layer {} collapses spatial input {} to zero size",
        layer, shape
    ))
}

/// Output size of a conv/pool window along one axis, or `None` if the window
/// no longer fits.
fn conv_out_size(input: usize, kernel: usize, stride: usize, pad: usize) -> Option<usize> {
    let padded = input + 2 * pad;
    if padded < kernel || stride == 0 {
        return None;
    }
    Some((padded - kernel) / stride + 1)
}
