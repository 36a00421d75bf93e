//! Inference sessions over serialized artifacts.
//!
//! A [`Session`] pairs the declared interface of an artifact (tensor names
//! and input shape, read from the protobuf) with an optimized execution plan
//! built by the tract engine. Construction does the full load: decode, shape
//! pinning, typing, optimization. Callers that need cold-load behavior build
//! a fresh session per use; `run` itself allocates only the input tensor.

use std::error::Error;
use std::fmt;
use std::fs;
use std::io::{self, Cursor};
use std::path::Path;

use tract_onnx::prelude::*;

use modelprep_onnx::proto::{data_type, ModelProto};
use modelprep_onnx::DecodeError;

/// Sealed tract plan: typed, optimized and ready to run.
type TractPlan = RunnableModel<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Errors from building or running a [`Session`].
#[derive(Debug)]
pub enum SessionError {
    /// Reading the artifact from disk failed.
    Read(io::Error),

    /// The bytes are not a decodable model.
    Decode(DecodeError),

    /// The model decoded but does not present the single float input the
    /// pipeline works with, or an input of the wrong size was supplied.
    Interface(String),

    /// The engine rejected the graph or failed during execution.
    Engine(Box<dyn Error + Send + Sync>),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Read(err) => write!(f, "failed to read model: {}", err),
            SessionError::Decode(err) => write!(f, "failed to decode model: {}", err),
            SessionError::Interface(reason) => write!(f, "unsupported model interface: {}", reason),
            SessionError::Engine(err) => write!(f, "inference engine error: {}", err),
        }
    }
}

impl Error for SessionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SessionError::Read(err) => Some(err),
            SessionError::Decode(err) => Some(err),
            SessionError::Interface(_) => None,
            SessionError::Engine(err) => Some(err.as_ref()),
        }
    }
}

fn engine(err: TractError) -> SessionError {
    SessionError::Engine(err.into())
}

fn interface(reason: impl Into<String>) -> SessionError {
    SessionError::Interface(reason.into())
}

/// A loaded model ready for repeated inference.
pub struct Session {
    input_names: Vec<String>,
    output_names: Vec<String>,
    input_shape: Vec<usize>,
    plan: TractPlan,
}

// Hand-written: the execution plan has no useful textual form.
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("input_names", &self.input_names)
            .field("output_names", &self.output_names)
            .field("input_shape", &self.input_shape)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Load and prepare the artifact at `path`.
    pub fn load(path: &Path) -> Result<Session, SessionError> {
        let bytes = fs::read(path).map_err(SessionError::Read)?;
        Session::from_bytes(&bytes)
    }

    /// Prepare a session from in-memory model bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Session, SessionError> {
        let model = modelprep_onnx::decode_model(bytes).map_err(SessionError::Decode)?;
        let (input_names, output_names, input_shape) = declared_interface(&model)?;

        // Pin the input shape before typing so that shape-sensitive operators
        // (Conv, MaxPool) can resolve a symbolic batch dimension.
        let mut inference = tract_onnx::onnx()
            .model_for_read(&mut Cursor::new(bytes))
            .map_err(engine)?;
        let fact = InferenceFact::dt_shape(
            f32::datum_type(),
            input_shape
                .iter()
                .map(|&d| (d as i64).to_dim())
                .collect::<TVec<_>>(),
        );
        inference.set_input_fact(0, fact).map_err(engine)?;
        let plan = inference
            .into_typed()
            .map_err(engine)?
            .into_optimized()
            .map_err(engine)?
            .into_runnable()
            .map_err(engine)?;

        Ok(Session {
            input_names,
            output_names,
            input_shape,
            plan,
        })
    }

    /// Declared runtime input names, in graph order.
    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    /// Declared output names, in graph order.
    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    /// Concrete input shape, with any symbolic batch dimension resolved to 1.
    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    /// Number of elements a `run` input must have.
    pub fn input_len(&self) -> usize {
        self.input_shape.iter().product()
    }

    /// Run one inference, returning the flattened values of the first output.
    pub fn run(&self, input: &[f32]) -> Result<Vec<f32>, SessionError> {
        let expected = self.input_len();
        if input.len() != expected {
            return Err(interface(format!(
                "input has {} elements but the model expects {}",
                input.len(),
                expected
            )));
        }
        let array = tract_ndarray::ArrayD::from_shape_vec(
            tract_ndarray::IxDyn(&self.input_shape),
            input.to_vec(),
        )
        .map_err(|err| interface(err.to_string()))?;
        let value: TValue = array.into_tensor().into();

        let outputs = self.plan.run(tvec![value]).map_err(engine)?;
        let first = outputs
            .into_iter()
            .next()
            .ok_or_else(|| interface("model produced no outputs"))?;
        let values = first
            .to_array_view::<f32>()
            .map_err(engine)?
            .iter()
            .copied()
            .collect();
        Ok(values)
    }
}

/// Read the interface the pipeline relies on out of the decoded protobuf:
/// exactly one float runtime input, at least one output, concrete dimensions
/// with symbolic entries standing in for a batch of 1.
fn declared_interface(
    model: &ModelProto,
) -> Result<(Vec<String>, Vec<String>, Vec<usize>), SessionError> {
    let graph = model
        .graph
        .as_ref()
        .ok_or_else(|| interface("model has no graph"))?;

    let initializer_names: std::collections::HashSet<&str> =
        graph.initializer.iter().map(|t| t.name.as_str()).collect();
    let runtime_inputs: Vec<_> = graph
        .input
        .iter()
        .filter(|vi| !initializer_names.contains(vi.name.as_str()))
        .collect();
    let input = match runtime_inputs.as_slice() {
        [single] => *single,
        others => {
            return Err(interface(format!(
                "expected one runtime input, found {}",
                others.len()
            )))
        }
    };

    if let Some(ty) = input.r#type.as_ref().and_then(|t| t.value.as_ref()) {
        let modelprep_onnx::proto::type_proto::Value::TensorType(tensor) = ty;
        if tensor.elem_type != data_type::FLOAT {
            return Err(interface(format!(
                "input '{}' is not a float tensor",
                input.name
            )));
        }
    } else {
        return Err(interface(format!("input '{}' has no type", input.name)));
    }

    let dims = input
        .dims()
        .ok_or_else(|| interface(format!("input '{}' has no declared shape", input.name)))?;
    let mut input_shape = Vec::with_capacity(dims.len());
    for (index, dim) in dims.iter().enumerate() {
        match dim.as_fixed() {
            Some(size) if size > 0 => input_shape.push(size as usize),
            Some(size) => {
                return Err(interface(format!(
                    "input dimension {} has non-positive size {}",
                    index, size
                )))
            }
            // Symbolic dimension: run with a batch of one.
            None => input_shape.push(1),
        }
    }

    let output_names: Vec<String> = graph.output.iter().map(|vi| vi.name.clone()).collect();
    if output_names.is_empty() {
        return Err(interface("model declares no outputs"));
    }

    Ok((
        vec![input.name.clone()],
        output_names,
        input_shape,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InputSpec;
    use crate::export::{export, DEFAULT_OPSET, INPUT_NAME, OUTPUT_NAME};
    use crate::test_util::TempDir;
    use crate::zoo;

    fn exported_model(dir: &TempDir, spec: &InputSpec, file: &str) -> std::path::PathBuf {
        let mut network = zoo::smallnet(spec);
        let path = dir.path().join(file);
        export(&mut network, spec, &path, DEFAULT_OPSET).unwrap();
        path
    }

    #[test]
    fn session_reports_declared_interface() {
        let dir = TempDir::new("session-interface");
        let spec = InputSpec::nchw(1, 3, 32, 32);
        let path = exported_model(&dir, &spec, "net.onnx");

        let session = Session::load(&path).unwrap();
        assert_eq!(session.input_names(), [INPUT_NAME.to_string()]);
        assert_eq!(session.output_names(), [OUTPUT_NAME.to_string()]);
        assert_eq!(session.input_shape(), [1, 3, 32, 32]);
        assert_eq!(session.input_len(), 3 * 32 * 32);
    }

    #[test]
    fn symbolic_batch_resolves_to_one() {
        let dir = TempDir::new("session-symbolic");
        let spec = InputSpec::nchw(1, 3, 32, 32).with_symbolic_batch();
        let path = exported_model(&dir, &spec, "net.onnx");

        let session = Session::load(&path).unwrap();
        assert_eq!(session.input_shape(), [1, 3, 32, 32]);
    }

    #[test]
    fn run_produces_class_scores() {
        let dir = TempDir::new("session-run");
        let spec = InputSpec::nchw(1, 3, 32, 32);
        let path = exported_model(&dir, &spec, "net.onnx");

        let session = Session::load(&path).unwrap();
        let input = vec![0.5f32; session.input_len()];
        let output = session.run(&input).unwrap();
        assert_eq!(output.len(), zoo::NUM_CLASSES);
        assert!(output.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn run_is_deterministic_for_fixed_input() {
        let dir = TempDir::new("session-deterministic");
        let spec = InputSpec::nchw(1, 3, 32, 32);
        let path = exported_model(&dir, &spec, "net.onnx");

        let session = Session::load(&path).unwrap();
        let input: Vec<f32> = (0..session.input_len())
            .map(|i| (i % 17) as f32 / 16.0)
            .collect();
        let first = session.run(&input).unwrap();
        let second = session.run(&input).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn wrong_input_size_is_an_interface_error() {
        let dir = TempDir::new("session-badinput");
        let spec = InputSpec::nchw(1, 3, 32, 32);
        let path = exported_model(&dir, &spec, "net.onnx");

        let session = Session::load(&path).unwrap();
        let err = session.run(&[1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, SessionError::Interface(_)));
    }

    #[test]
    fn session_debug_summarizes_the_interface() {
        let dir = TempDir::new("session-debug");
        let spec = InputSpec::nchw(1, 3, 32, 32);
        let path = exported_model(&dir, &spec, "net.onnx");

        // unwrap/unwrap_err on session results needs this to format.
        let repr = format!("{:?}", Session::load(&path).unwrap());
        assert!(repr.contains("input_names"));
        assert!(repr.contains("input_shape"));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = TempDir::new("session-missing");
        let err = Session::load(&dir.path().join("absent.onnx")).unwrap_err();
        assert!(matches!(err, SessionError::Read(_)));
    }

    #[test]
    fn garbage_bytes_are_a_decode_error() {
        let err = Session::from_bytes(&[0xff, 0xff, 0xff, 0x01]).unwrap_err();
        assert!(matches!(err, SessionError::Decode(_)));
    }
}
