//! Structural validation of serialized artifacts.
//!
//! Validation is pure and read-only: it decodes the protobuf and walks the
//! graph checking that every reference resolves, without touching the
//! inference engine. Numerical correctness is out of scope here; loading the
//! artifact into a session covers that separately.

use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use modelprep_onnx::proto::{GraphProto, ModelProto};

/// What a successful validation learned about the artifact.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidationReport {
    /// Declared runtime inputs, in graph order (weight initializers are not
    /// counted even when redundantly listed as inputs).
    pub input_names: Vec<String>,

    /// Declared outputs, in graph order.
    pub output_names: Vec<String>,

    /// Declared dimensions of the first input; `None` entries are symbolic.
    pub input_shape: Vec<Option<i64>>,

    /// Number of operator nodes in the graph.
    pub node_count: usize,

    /// Opset version from the default-domain import.
    pub opset: i64,
}

/// Errors from [`validate`].
#[derive(Debug)]
pub enum ValidateError {
    /// No file at the given path.
    FileNotFound(PathBuf),

    /// The file exists but its graph fails a structural check.
    Malformed { reason: String },

    /// Reading the file failed for a reason other than absence.
    Io(io::Error),
}

impl ValidateError {
    fn malformed(reason: impl Into<String>) -> ValidateError {
        ValidateError::Malformed {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ValidateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidateError::FileNotFound(path) => {
                write!(f, "model file not found: {}", path.display())
            }
            ValidateError::Malformed { reason } => write!(f, "malformed model: {}", reason),
            ValidateError::Io(err) => write!(f, "read error: {}", err),
        }
    }
}

impl Error for ValidateError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ValidateError::Io(err) => Some(err),
            _ => None,
        }
    }
}

/// Check the internal consistency of the artifact at `path`.
pub fn validate(path: &Path) -> Result<ValidationReport, ValidateError> {
    if !path.exists() {
        return Err(ValidateError::FileNotFound(path.to_path_buf()));
    }
    let bytes = fs::read(path).map_err(ValidateError::Io)?;
    let model = modelprep_onnx::decode_model(&bytes)
        .map_err(|err| ValidateError::malformed(format!("protobuf decode failed: {}", err)))?;
    check_model(&model)
}

fn check_model(model: &ModelProto) -> Result<ValidationReport, ValidateError> {
    let graph = model
        .graph
        .as_ref()
        .ok_or_else(|| ValidateError::malformed("model has no graph"))?;

    let opset = model
        .opset_import
        .iter()
        .find(|o| o.domain.is_empty())
        .map(|o| o.version)
        .ok_or_else(|| ValidateError::malformed("missing default-domain opset import"))?;

    if graph.node.is_empty() {
        return Err(ValidateError::malformed("graph has no nodes"));
    }
    check_references(graph)?;

    let initializer_names: HashSet<&str> =
        graph.initializer.iter().map(|t| t.name.as_str()).collect();
    let input_names: Vec<String> = graph
        .input
        .iter()
        .filter(|vi| !initializer_names.contains(vi.name.as_str()))
        .map(|vi| vi.name.clone())
        .collect();
    if input_names.is_empty() {
        return Err(ValidateError::malformed("graph declares no runtime inputs"));
    }
    let output_names: Vec<String> = graph.output.iter().map(|vi| vi.name.clone()).collect();
    if output_names.is_empty() {
        return Err(ValidateError::malformed("graph declares no outputs"));
    }

    let first_input = graph
        .input
        .iter()
        .find(|vi| vi.name == input_names[0])
        .and_then(|vi| vi.dims())
        .ok_or_else(|| ValidateError::malformed("graph input has no tensor shape"))?;
    let input_shape = first_input.iter().map(|d| d.as_fixed()).collect();

    Ok(ValidationReport {
        input_names,
        output_names,
        input_shape,
        node_count: graph.node.len(),
        opset,
    })
}

/// Walk nodes in declaration order, checking that every input is defined by
/// the time it is consumed and that no tensor is defined twice.
fn check_references(graph: &GraphProto) -> Result<(), ValidateError> {
    let mut known: HashSet<&str> = HashSet::new();
    for vi in &graph.input {
        if vi.name.is_empty() {
            return Err(ValidateError::malformed("graph input with empty name"));
        }
        known.insert(vi.name.as_str());
    }
    for init in &graph.initializer {
        if init.name.is_empty() {
            return Err(ValidateError::malformed("initializer with empty name"));
        }
        known.insert(init.name.as_str());
    }

    for node in &graph.node {
        for input in &node.input {
            // Empty names mark omitted optional inputs.
            if input.is_empty() {
                continue;
            }
            if !known.contains(input.as_str()) {
                return Err(ValidateError::malformed(format!(
                    "node {} references undefined tensor {}",
                    node.name, input
                )));
            }
        }
        for output in &node.output {
            if output.is_empty() {
                return Err(ValidateError::malformed(format!(
                    "node {} has an output with empty name",
                    node.name
                )));
            }
            if !known.insert(output.as_str()) {
                return Err(ValidateError::malformed(format!(
                    "tensor {} defined more than once",
                    output
                )));
            }
        }
    }

    for output in &graph.output {
        if !known.contains(output.name.as_str()) {
            return Err(ValidateError::malformed(format!(
                "graph output {} is not produced by any node",
                output.name
            )));
        }
    }
    Ok(())
}
