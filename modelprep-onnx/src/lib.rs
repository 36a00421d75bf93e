//! ONNX model reading and writing for the modelprep pipeline.
//!
//! This crate declares the subset of the ONNX protobuf schema that the
//! pipeline produces and inspects (models, graphs, nodes, tensors,
//! attributes) together with small construction helpers. It deals only in
//! bytes; callers own file I/O.

#![forbid(unsafe_code)]

pub mod proto;

pub use prost::DecodeError;

use prost::Message;

use proto::ModelProto;

/// Serialize a model to ONNX protobuf bytes.
pub fn encode_model(model: &ModelProto) -> Vec<u8> {
    model.encode_to_vec()
}

/// Deserialize a model from ONNX protobuf bytes.
pub fn decode_model(bytes: &[u8]) -> Result<ModelProto, DecodeError> {
    ModelProto::decode(bytes)
}
