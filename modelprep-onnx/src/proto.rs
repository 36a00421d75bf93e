//! ONNX protobuf message types via prost derive.
//!
//! The messages are declared by hand rather than generated from `onnx.proto`;
//! field tags match the official ONNX field numbers. Only the parts of the
//! schema the pipeline touches are present: enough to emit a weights-bearing
//! graph, to walk it structurally, and to rewrite it.

use prost::Message;

/// Element type constants from `TensorProto.DataType`.
pub mod data_type {
    pub const FLOAT: i32 = 1;
    pub const UINT8: i32 = 2;
    pub const INT8: i32 = 3;
    pub const INT32: i32 = 6;
    pub const INT64: i32 = 7;
    pub const BOOL: i32 = 9;
    pub const DOUBLE: i32 = 11;
}

/// Attribute kind constants from `AttributeProto.AttributeType`.
pub mod attribute_type {
    pub const UNDEFINED: i32 = 0;
    pub const FLOAT: i32 = 1;
    pub const INT: i32 = 2;
    pub const STRING: i32 = 3;
    pub const TENSOR: i32 = 4;
    pub const FLOATS: i32 = 6;
    pub const INTS: i32 = 7;
    pub const STRINGS: i32 = 8;
}

/// Top-level ONNX model container.
#[derive(Clone, PartialEq, Message)]
pub struct ModelProto {
    #[prost(int64, tag = "1")]
    pub ir_version: i64,
    #[prost(string, tag = "2")]
    pub producer_name: String,
    #[prost(string, tag = "3")]
    pub producer_version: String,
    #[prost(message, optional, tag = "7")]
    pub graph: Option<GraphProto>,
    #[prost(message, repeated, tag = "8")]
    pub opset_import: Vec<OperatorSetIdProto>,
}

/// Operator set version declaration.
#[derive(Clone, PartialEq, Message)]
pub struct OperatorSetIdProto {
    #[prost(string, tag = "1")]
    pub domain: String,
    #[prost(int64, tag = "2")]
    pub version: i64,
}

/// A computation graph: nodes in topological order plus declared inputs,
/// outputs and weight initializers.
#[derive(Clone, PartialEq, Message)]
pub struct GraphProto {
    #[prost(message, repeated, tag = "1")]
    pub node: Vec<NodeProto>,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(message, repeated, tag = "5")]
    pub initializer: Vec<TensorProto>,
    #[prost(message, repeated, tag = "11")]
    pub input: Vec<ValueInfoProto>,
    #[prost(message, repeated, tag = "12")]
    pub output: Vec<ValueInfoProto>,
    #[prost(message, repeated, tag = "13")]
    pub value_info: Vec<ValueInfoProto>,
}

/// A single operator invocation.
#[derive(Clone, PartialEq, Message)]
pub struct NodeProto {
    #[prost(string, repeated, tag = "1")]
    pub input: Vec<String>,
    #[prost(string, repeated, tag = "2")]
    pub output: Vec<String>,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(string, tag = "4")]
    pub op_type: String,
    #[prost(message, repeated, tag = "5")]
    pub attribute: Vec<AttributeProto>,
    #[prost(string, tag = "7")]
    pub domain: String,
}

impl NodeProto {
    /// Create a node for `op_type` in the default ONNX domain.
    pub fn new(op_type: &str, name: &str, inputs: &[&str], outputs: &[&str]) -> Self {
        Self {
            input: inputs.iter().map(|s| s.to_string()).collect(),
            output: outputs.iter().map(|s| s.to_string()).collect(),
            name: name.to_string(),
            op_type: op_type.to_string(),
            attribute: Vec::new(),
            domain: String::new(),
        }
    }
}

/// A named operator parameter. Which value field is populated is declared by
/// `r#type` using the [`attribute_type`] constants.
#[derive(Clone, PartialEq, Message)]
pub struct AttributeProto {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(float, tag = "2")]
    pub f: f32,
    #[prost(int64, tag = "3")]
    pub i: i64,
    #[prost(bytes = "vec", tag = "4")]
    pub s: Vec<u8>,
    #[prost(message, optional, tag = "5")]
    pub t: Option<TensorProto>,
    #[prost(float, repeated, tag = "7")]
    pub floats: Vec<f32>,
    #[prost(int64, repeated, tag = "8")]
    pub ints: Vec<i64>,
    #[prost(bytes = "vec", repeated, tag = "9")]
    pub strings: Vec<Vec<u8>>,
    #[prost(int32, tag = "20")]
    pub r#type: i32,
}

impl AttributeProto {
    /// Single-integer attribute.
    pub fn int(name: &str, value: i64) -> Self {
        Self {
            name: name.to_string(),
            i: value,
            r#type: attribute_type::INT,
            ..Default::default()
        }
    }

    /// Single-float attribute.
    pub fn float(name: &str, value: f32) -> Self {
        Self {
            name: name.to_string(),
            f: value,
            r#type: attribute_type::FLOAT,
            ..Default::default()
        }
    }

    /// Integer-list attribute.
    pub fn ints(name: &str, values: &[i64]) -> Self {
        Self {
            name: name.to_string(),
            ints: values.to_vec(),
            r#type: attribute_type::INTS,
            ..Default::default()
        }
    }
}

/// A dense tensor, used here for weight initializers.
#[derive(Clone, PartialEq, Message)]
pub struct TensorProto {
    #[prost(int64, repeated, tag = "1")]
    pub dims: Vec<i64>,
    #[prost(int32, tag = "2")]
    pub data_type: i32,
    #[prost(float, repeated, tag = "4")]
    pub float_data: Vec<f32>,
    #[prost(int32, repeated, tag = "5")]
    pub int32_data: Vec<i32>,
    #[prost(int64, repeated, tag = "7")]
    pub int64_data: Vec<i64>,
    #[prost(string, tag = "8")]
    pub name: String,
    #[prost(bytes = "vec", tag = "9")]
    pub raw_data: Vec<u8>,
    #[prost(double, repeated, tag = "10")]
    pub double_data: Vec<f64>,
}

impl TensorProto {
    /// Create a float tensor with values stored as little-endian raw data,
    /// the layout produced by the common exporters.
    pub fn from_f32(name: &str, dims: &[i64], values: &[f32]) -> Self {
        let mut raw_data = Vec::with_capacity(values.len() * 4);
        for v in values {
            raw_data.extend_from_slice(&v.to_le_bytes());
        }
        Self {
            dims: dims.to_vec(),
            data_type: data_type::FLOAT,
            name: name.to_string(),
            raw_data,
            ..Default::default()
        }
    }

    /// Number of elements implied by `dims`.
    pub fn elem_count(&self) -> usize {
        self.dims.iter().product::<i64>().max(0) as usize
    }

    /// Extract float values, whether stored as raw bytes or in the typed
    /// `float_data` field. Returns `None` for non-float tensors.
    pub fn f32_data(&self) -> Option<Vec<f32>> {
        if self.data_type != data_type::FLOAT {
            return None;
        }
        if !self.raw_data.is_empty() {
            let values = self
                .raw_data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            Some(values)
        } else {
            Some(self.float_data.clone())
        }
    }
}

/// Typed tensor name declaration.
#[derive(Clone, PartialEq, Message)]
pub struct ValueInfoProto {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub r#type: Option<TypeProto>,
}

impl ValueInfoProto {
    /// Create a tensor value info with the given element type and dimensions.
    pub fn tensor(name: impl Into<String>, elem_type: i32, dims: Vec<Dim>) -> Self {
        Self {
            name: name.into(),
            r#type: Some(TypeProto {
                value: Some(type_proto::Value::TensorType(TensorTypeProto {
                    elem_type,
                    shape: Some(TensorShapeProto { dim: dims }),
                })),
            }),
        }
    }

    /// The declared dimensions, if this value info describes a tensor.
    pub fn dims(&self) -> Option<&[Dim]> {
        let ty = self.r#type.as_ref()?;
        let type_proto::Value::TensorType(tensor) = ty.value.as_ref()?;
        Some(&tensor.shape.as_ref()?.dim)
    }
}

/// Type of a value (only tensor types are used here).
#[derive(Clone, PartialEq, Message)]
pub struct TypeProto {
    #[prost(oneof = "type_proto::Value", tags = "1")]
    pub value: Option<type_proto::Value>,
}

pub mod type_proto {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        #[prost(message, tag = "1")]
        TensorType(super::TensorTypeProto),
    }
}

/// Tensor type: element data type plus shape.
#[derive(Clone, PartialEq, Message)]
pub struct TensorTypeProto {
    #[prost(int32, tag = "1")]
    pub elem_type: i32,
    #[prost(message, optional, tag = "2")]
    pub shape: Option<TensorShapeProto>,
}

/// Tensor shape: a list of dimensions.
#[derive(Clone, PartialEq, Message)]
pub struct TensorShapeProto {
    #[prost(message, repeated, tag = "1")]
    pub dim: Vec<Dim>,
}

/// A single dimension, either pinned to a value or named symbolically.
#[derive(Clone, PartialEq, Message)]
pub struct Dim {
    #[prost(oneof = "dim::Value", tags = "1, 2")]
    pub value: Option<dim::Value>,
}

pub mod dim {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        #[prost(int64, tag = "1")]
        DimValue(i64),
        #[prost(string, tag = "2")]
        DimParam(String),
    }
}

impl Dim {
    /// Create a fixed-size dimension.
    pub fn fixed(size: i64) -> Self {
        Self {
            value: Some(dim::Value::DimValue(size)),
        }
    }

    /// Create a symbolic (named) dimension.
    pub fn symbolic(name: impl Into<String>) -> Self {
        Self {
            value: Some(dim::Value::DimParam(name.into())),
        }
    }

    /// The fixed size, or `None` for symbolic/unset dimensions.
    pub fn as_fixed(&self) -> Option<i64> {
        match self.value {
            Some(dim::Value::DimValue(v)) => Some(v),
            _ => None,
        }
    }
}
