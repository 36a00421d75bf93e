//! Graph simplification with an equivalence check.
//!
//! The rewrite runs three passes over the decoded graph: batch-normalization
//! folding into the preceding convolution, elision of passthrough nodes
//! (`Identity`, inference-mode `Dropout`), and pruning of initializers and
//! value infos the rewrites orphaned. Before anything is written, the
//! original and rewritten graphs are both loaded into sessions and run on
//! the same input; only when their outputs agree within
//! [`EQUIVALENCE_TOLERANCE`] is the output file produced. A failed check
//! leaves no file behind.
//!
//! The whole rewrite capability sits behind the default-on `simplify`
//! feature. Built without it, [`simplify`] reports
//! [`SimplifyError::MissingDependency`] and the caller falls back to the
//! unsimplified artifact.

use std::error::Error;
use std::fmt;
use std::io;
use std::path::Path;

use modelprep_onnx::DecodeError;

use crate::artifact::{ModelArtifact, Provenance};
use crate::runtime::SessionError;

/// Largest absolute per-element output difference accepted by the
/// equivalence check.
pub const EQUIVALENCE_TOLERANCE: f32 = 1e-4;

#[cfg(feature = "simplify")]
const CERTIFY_SEED: u64 = 0x7369_6d70;

/// What [`simplify`] produced.
#[derive(Debug)]
pub struct SimplifyOutcome {
    /// The written artifact, tagged [`Provenance::Simplified`].
    pub artifact: ModelArtifact,

    /// Whether the rewrite passed the equivalence check. Always true on a
    /// successful return; an uncertified rewrite is discarded instead.
    pub certified: bool,

    /// Operator count before the rewrite.
    pub nodes_before: usize,

    /// Operator count after the rewrite.
    pub nodes_after: usize,
}

/// Errors from [`simplify`].
#[derive(Debug)]
pub enum SimplifyError {
    /// The rewrite capability is not compiled in. Recoverable: callers keep
    /// using the unsimplified artifact.
    MissingDependency,

    /// The rewritten graph disagreed with the original beyond
    /// [`EQUIVALENCE_TOLERANCE`]. Nothing was written.
    NotEquivalent { max_diff: f32 },

    /// Reading the input artifact failed.
    Read(io::Error),

    /// The input bytes are not a decodable model.
    Decode(DecodeError),

    /// The input decoded but is not a simplifiable graph.
    Malformed(String),

    /// The equivalence check itself could not run.
    Certify(SessionError),

    /// Writing the output artifact failed.
    Io(io::Error),
}

impl fmt::Display for SimplifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimplifyError::MissingDependency => {
                write!(f, "graph rewrite support is not compiled in")
            }
            SimplifyError::NotEquivalent { max_diff } => write!(
                f,
                "rewritten graph is not equivalent (max output difference {})",
                max_diff
            ),
            SimplifyError::Read(err) => write!(f, "failed to read model: {}", err),
            SimplifyError::Decode(err) => write!(f, "failed to decode model: {}", err),
            SimplifyError::Malformed(reason) => write!(f, "cannot simplify: {}", reason),
            SimplifyError::Certify(err) => write!(f, "equivalence check failed to run: {}", err),
            SimplifyError::Io(err) => write!(f, "failed to write simplified model: {}", err),
        }
    }
}

impl Error for SimplifyError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SimplifyError::Read(err) | SimplifyError::Io(err) => Some(err),
            SimplifyError::Decode(err) => Some(err),
            SimplifyError::Certify(err) => Some(err),
            _ => None,
        }
    }
}

/// Rewrite the artifact at `input_path` into a certified-equivalent graph at
/// `output_path`. The input file is never modified.
#[cfg(feature = "simplify")]
pub fn simplify(input_path: &Path, output_path: &Path) -> Result<SimplifyOutcome, SimplifyError> {
    let bytes = std::fs::read(input_path).map_err(SimplifyError::Read)?;
    let model = modelprep_onnx::decode_model(&bytes).map_err(SimplifyError::Decode)?;
    if model.graph.is_none() {
        return Err(SimplifyError::Malformed("model has no graph".to_string()));
    }

    let mut simplified = model;
    let nodes_before;
    let nodes_after;
    {
        // Checked non-None above.
        let graph = match simplified.graph.as_mut() {
            Some(graph) => graph,
            None => return Err(SimplifyError::Malformed("model has no graph".to_string())),
        };
        nodes_before = graph.node.len();
        passes::fold_batch_norm(graph);
        passes::elide_passthrough(graph);
        passes::prune_orphans(graph);
        nodes_after = graph.node.len();
    }

    let out_bytes = modelprep_onnx::encode_model(&simplified);
    let max_diff = max_output_difference(&bytes, &out_bytes).map_err(SimplifyError::Certify)?;
    // Written with `!(..)` so a NaN difference also fails certification.
    if !(max_diff <= EQUIVALENCE_TOLERANCE) {
        return Err(SimplifyError::NotEquivalent { max_diff });
    }

    crate::artifact::write_atomic(output_path, &out_bytes).map_err(SimplifyError::Io)?;
    Ok(SimplifyOutcome {
        artifact: ModelArtifact::new(
            output_path.to_path_buf(),
            out_bytes.len() as u64,
            Provenance::Simplified,
        ),
        certified: true,
        nodes_before,
        nodes_after,
    })
}

/// Stub used when the rewrite capability is compiled out.
#[cfg(not(feature = "simplify"))]
pub fn simplify(_input_path: &Path, _output_path: &Path) -> Result<SimplifyOutcome, SimplifyError> {
    Err(SimplifyError::MissingDependency)
}

/// Load both byte images into sessions and measure the largest absolute
/// difference between their outputs for one shared input.
#[cfg(feature = "simplify")]
fn max_output_difference(original: &[u8], candidate: &[u8]) -> Result<f32, SessionError> {
    use crate::runtime::Session;

    let before = Session::from_bytes(original)?;
    let after = Session::from_bytes(candidate)?;

    let mut rng = fastrand::Rng::with_seed(CERTIFY_SEED);
    let input: Vec<f32> = (0..before.input_len()).map(|_| rng.f32()).collect();

    let reference = before.run(&input)?;
    let rewritten = after.run(&input)?;
    if reference.len() != rewritten.len() {
        return Ok(f32::INFINITY);
    }
    // f32::max returns the non-NaN operand, so a NaN difference must be
    // pinned explicitly or it would vanish from the accumulator.
    let max = reference
        .iter()
        .zip(&rewritten)
        .map(|(a, b)| (a - b).abs())
        .fold(0.0f32, |acc, d| {
            if acc.is_nan() || d.is_nan() {
                f32::NAN
            } else {
                acc.max(d)
            }
        });
    Ok(max)
}

#[cfg(feature = "simplify")]
mod passes {
    use std::collections::HashSet;

    use modelprep_onnx::proto::{GraphProto, TensorProto};

    /// Fold `Conv -> BatchNormalization` pairs into the convolution weights.
    ///
    /// A pair folds only when the convolution's output feeds the
    /// normalization and nothing else, and every normalization parameter is
    /// a float initializer. The convolution takes over the normalization's
    /// output name so downstream references are untouched.
    pub fn fold_batch_norm(graph: &mut GraphProto) {
        while let Some((conv_index, bn_index)) = find_foldable_pair(graph) {
            fold_pair(graph, conv_index, bn_index);
        }
    }

    fn find_foldable_pair(graph: &GraphProto) -> Option<(usize, usize)> {
        for (bn_index, bn) in graph.node.iter().enumerate() {
            if bn.op_type != "BatchNormalization" || !bn.domain.is_empty() {
                continue;
            }
            if bn.input.len() < 5 || bn.output.is_empty() {
                continue;
            }
            let conv_out = bn.input[0].as_str();
            let Some(conv_index) = producer_index(graph, conv_out) else {
                continue;
            };
            let conv = &graph.node[conv_index];
            if conv.op_type != "Conv" || !conv.domain.is_empty() {
                continue;
            }
            if conv.input.len() < 2 || conv.output.len() != 1 {
                continue;
            }
            // The conv output must go nowhere else.
            if consumer_count(graph, conv_out) != 1 || is_graph_output(graph, conv_out) {
                continue;
            }
            if foldable_parameters(graph, conv, bn).is_some() {
                return Some((conv_index, bn_index));
            }
        }
        None
    }

    struct BnParams {
        scale: Vec<f32>,
        bias: Vec<f32>,
        mean: Vec<f32>,
        var: Vec<f32>,
    }

    /// Check that the weights involved in a fold are all present as float
    /// initializers with matching channel counts.
    fn foldable_parameters(
        graph: &GraphProto,
        conv: &modelprep_onnx::proto::NodeProto,
        bn: &modelprep_onnx::proto::NodeProto,
    ) -> Option<BnParams> {
        let weight = f32_initializer(graph, &conv.input[1])?;
        if weight.0.len() != 4 {
            return None;
        }
        let out_channels = weight.0[0].max(0) as usize;

        let scale = f32_initializer(graph, &bn.input[1])?.1;
        let bias = f32_initializer(graph, &bn.input[2])?.1;
        let mean = f32_initializer(graph, &bn.input[3])?.1;
        let var = f32_initializer(graph, &bn.input[4])?.1;
        let lens_ok = [&scale, &bias, &mean, &var]
            .iter()
            .all(|v| v.len() == out_channels);
        if !lens_ok || out_channels == 0 {
            return None;
        }
        if let Some(conv_bias) = conv.input.get(2) {
            // A conv bias, when present, must also be a foldable initializer.
            let b = f32_initializer(graph, conv_bias)?.1;
            if b.len() != out_channels {
                return None;
            }
        }
        Some(BnParams {
            scale,
            bias,
            mean,
            var,
        })
    }

    fn fold_pair(graph: &mut GraphProto, conv_index: usize, bn_index: usize) {
        let bn = graph.node[bn_index].clone();
        let conv = graph.node[conv_index].clone();
        let Some(params) = foldable_parameters(graph, &conv, &bn) else {
            return;
        };
        let Some((weight_dims, weight)) = f32_initializer(graph, &conv.input[1]) else {
            return;
        };
        let epsilon = bn
            .attribute
            .iter()
            .find(|a| a.name == "epsilon")
            .map(|a| a.f)
            .unwrap_or(1e-5);

        let out_channels = params.scale.len();
        let per_channel = weight.len() / out_channels;
        let factors: Vec<f32> = params
            .scale
            .iter()
            .zip(&params.var)
            .map(|(s, v)| s / (v + epsilon).sqrt())
            .collect();

        let mut new_weight = weight;
        for (oc, factor) in factors.iter().enumerate() {
            for w in &mut new_weight[oc * per_channel..(oc + 1) * per_channel] {
                *w *= factor;
            }
        }

        let old_bias = conv
            .input
            .get(2)
            .and_then(|name| f32_initializer(graph, name))
            .map(|(_, values)| values)
            .unwrap_or_else(|| vec![0.0; out_channels]);
        let new_bias: Vec<f32> = (0..out_channels)
            .map(|oc| (old_bias[oc] - params.mean[oc]) * factors[oc] + params.bias[oc])
            .collect();

        replace_initializer(
            graph,
            TensorProto::from_f32(&conv.input[1], &weight_dims, &new_weight),
        );
        let bias_name = match conv.input.get(2) {
            Some(name) => name.clone(),
            None => format!("{}.bias", conv.name),
        };
        replace_initializer(
            graph,
            TensorProto::from_f32(&bias_name, &[out_channels as i64], &new_bias),
        );

        let node = &mut graph.node[conv_index];
        if node.input.len() < 3 {
            node.input.push(bias_name);
        }
        node.output[0] = bn.output[0].clone();
        graph.node.remove(bn_index);
    }

    /// Remove `Identity` nodes and inference-mode `Dropout` nodes, splicing
    /// their input straight through to their consumers. A passthrough that
    /// feeds a graph output and whose source cannot be renamed is left in
    /// place.
    pub fn elide_passthrough(graph: &mut GraphProto) {
        let mut index = 0;
        while index < graph.node.len() {
            if is_passthrough(&graph.node[index]) && elide_at(graph, index) {
                // A removal can expose a new chain earlier in the list.
                index = 0;
            } else {
                index += 1;
            }
        }
    }

    fn is_passthrough(node: &modelprep_onnx::proto::NodeProto) -> bool {
        node.domain.is_empty()
            && (node.op_type == "Identity" || node.op_type == "Dropout")
            && !node.input.is_empty()
            && node.output.len() == 1
    }

    fn elide_at(graph: &mut GraphProto, index: usize) -> bool {
        let in_name = graph.node[index].input[0].clone();
        let out_name = graph.node[index].output[0].clone();

        if is_graph_output(graph, &out_name) {
            // The passthrough feeds a graph output; rename its producer's
            // output instead of rewriting consumers. Only safe when that
            // producer exists and feeds nothing else.
            let Some(producer) = producer_index(graph, &in_name) else {
                return false;
            };
            if consumer_count(graph, &in_name) != 1 || is_graph_output(graph, &in_name) {
                return false;
            }
            for output in &mut graph.node[producer].output {
                if *output == in_name {
                    *output = out_name.clone();
                }
            }
        } else {
            for node in &mut graph.node {
                for input in &mut node.input {
                    if *input == out_name {
                        *input = in_name.clone();
                    }
                }
            }
        }
        graph.node.remove(index);
        true
    }

    /// Drop initializers no node consumes any more, stale `graph.input`
    /// declarations for them, and `value_info` entries for names no node
    /// produces.
    pub fn prune_orphans(graph: &mut GraphProto) {
        let used: HashSet<String> = graph
            .node
            .iter()
            .flat_map(|n| n.input.iter().cloned())
            .collect();
        let removed: HashSet<String> = graph
            .initializer
            .iter()
            .filter(|t| !used.contains(&t.name))
            .map(|t| t.name.clone())
            .collect();
        graph.initializer.retain(|t| used.contains(&t.name));
        graph.input.retain(|vi| !removed.contains(&vi.name));

        let produced: HashSet<String> = graph
            .node
            .iter()
            .flat_map(|n| n.output.iter().cloned())
            .collect();
        graph.value_info.retain(|vi| produced.contains(&vi.name));
    }

    fn producer_index(graph: &GraphProto, name: &str) -> Option<usize> {
        graph
            .node
            .iter()
            .position(|n| n.output.iter().any(|o| o == name))
    }

    fn consumer_count(graph: &GraphProto, name: &str) -> usize {
        graph
            .node
            .iter()
            .flat_map(|n| n.input.iter())
            .filter(|i| *i == name)
            .count()
    }

    fn is_graph_output(graph: &GraphProto, name: &str) -> bool {
        graph.output.iter().any(|vi| vi.name == name)
    }

    fn f32_initializer(graph: &GraphProto, name: &str) -> Option<(Vec<i64>, Vec<f32>)> {
        let tensor = graph.initializer.iter().find(|t| t.name == name)?;
        let values = tensor.f32_data()?;
        Some((tensor.dims.clone(), values))
    }

    fn replace_initializer(graph: &mut GraphProto, tensor: TensorProto) {
        match graph.initializer.iter_mut().find(|t| t.name == tensor.name) {
            Some(slot) => *slot = tensor,
            None => graph.initializer.push(tensor),
        }
    }
}

#[cfg(all(test, feature = "simplify"))]
mod tests {
    use super::*;
    use crate::config::InputSpec;
    use crate::export::{export, DEFAULT_OPSET, INPUT_NAME, OUTPUT_NAME};
    use crate::runtime::Session;
    use crate::test_util::TempDir;
    use crate::validate::validate;
    use crate::zoo;
    use modelprep_onnx::proto::{
        data_type, Dim, GraphProto, ModelProto, NodeProto, OperatorSetIdProto, TensorProto,
        ValueInfoProto,
    };

    fn exported(dir: &TempDir) -> std::path::PathBuf {
        let spec = InputSpec::nchw(1, 3, 32, 32);
        let mut network = zoo::smallnet(&spec);
        let path = dir.path().join("net.onnx");
        export(&mut network, &spec, &path, DEFAULT_OPSET).unwrap();
        path
    }

    fn op_types(path: &std::path::Path) -> Vec<String> {
        let bytes = std::fs::read(path).unwrap();
        let model = modelprep_onnx::decode_model(&bytes).unwrap();
        model
            .graph
            .unwrap()
            .node
            .iter()
            .map(|n| n.op_type.clone())
            .collect()
    }

    #[test]
    fn folds_batch_norm_and_certifies() {
        let dir = TempDir::new("simplify-fold");
        let input = exported(&dir);
        let output = dir.path().join("net_simplified.onnx");

        let outcome = simplify(&input, &output).unwrap();
        assert!(outcome.certified);
        assert!(outcome.nodes_after < outcome.nodes_before);
        assert!(output.exists());
        assert!(outcome.artifact.size <= std::fs::metadata(&input).unwrap().len());

        let ops = op_types(&output);
        assert!(!ops.contains(&"BatchNormalization".to_string()));
        assert!(ops.contains(&"Conv".to_string()));

        let report = validate(&output).unwrap();
        assert_eq!(report.input_names, [INPUT_NAME.to_string()]);
        assert_eq!(report.output_names, [OUTPUT_NAME.to_string()]);
    }

    #[test]
    fn simplified_outputs_match_original() {
        let dir = TempDir::new("simplify-equiv");
        let input = exported(&dir);
        let output = dir.path().join("net_simplified.onnx");
        simplify(&input, &output).unwrap();

        let before = Session::load(&input).unwrap();
        let after = Session::load(&output).unwrap();
        let values: Vec<f32> = (0..before.input_len())
            .map(|i| ((i % 31) as f32 / 30.0) - 0.5)
            .collect();
        let reference = before.run(&values).unwrap();
        let rewritten = after.run(&values).unwrap();
        assert_eq!(reference.len(), rewritten.len());
        for (a, b) in reference.iter().zip(&rewritten) {
            assert!((a - b).abs() <= EQUIVALENCE_TOLERANCE, "{} vs {}", a, b);
        }
    }

    #[test]
    fn certification_is_idempotent() {
        let dir = TempDir::new("simplify-idempotent");
        let input = exported(&dir);
        let first = dir.path().join("first.onnx");
        let second = dir.path().join("second.onnx");

        let outcome = simplify(&input, &first).unwrap();
        let again = simplify(&first, &second).unwrap();
        assert!(again.certified);
        assert!(again.nodes_after <= outcome.nodes_after);
    }

    #[test]
    fn elides_identity_feeding_graph_output() {
        // input -> Relu -> Identity -> output
        let model = ModelProto {
            ir_version: 7,
            producer_name: "modelprep".into(),
            producer_version: "test".into(),
            graph: Some(GraphProto {
                name: "passthrough".into(),
                node: vec![
                    NodeProto::new("Relu", "relu_0", &[INPUT_NAME], &["relu_0_out"]),
                    NodeProto::new("Identity", "id_0", &["relu_0_out"], &[OUTPUT_NAME]),
                ],
                initializer: vec![],
                input: vec![ValueInfoProto::tensor(
                    INPUT_NAME,
                    data_type::FLOAT,
                    vec![Dim::fixed(1), Dim::fixed(4)],
                )],
                output: vec![ValueInfoProto::tensor(
                    OUTPUT_NAME,
                    data_type::FLOAT,
                    vec![Dim::fixed(1), Dim::fixed(4)],
                )],
                value_info: vec![],
            }),
            opset_import: vec![OperatorSetIdProto {
                domain: String::new(),
                version: DEFAULT_OPSET,
            }],
        };

        let dir = TempDir::new("simplify-identity");
        let input = dir.path().join("passthrough.onnx");
        std::fs::write(&input, modelprep_onnx::encode_model(&model)).unwrap();
        let output = dir.path().join("passthrough_simplified.onnx");

        let outcome = simplify(&input, &output).unwrap();
        assert_eq!(outcome.nodes_before, 2);
        assert_eq!(outcome.nodes_after, 1);
        assert_eq!(op_types(&output), ["Relu".to_string()]);

        let report = validate(&output).unwrap();
        assert_eq!(report.output_names, [OUTPUT_NAME.to_string()]);
    }

    #[test]
    fn nan_outputs_fail_certification() {
        fn shape() -> Vec<Dim> {
            vec![Dim::fixed(1), Dim::fixed(4)]
        }
        fn wrap(graph: GraphProto) -> Vec<u8> {
            modelprep_onnx::encode_model(&ModelProto {
                ir_version: 7,
                producer_name: "modelprep".into(),
                producer_version: "test".into(),
                graph: Some(graph),
                opset_import: vec![OperatorSetIdProto {
                    domain: String::new(),
                    version: DEFAULT_OPSET,
                }],
            })
        }

        // input -> Relu -> output: finite for every input.
        let original = wrap(GraphProto {
            name: "finite".into(),
            node: vec![NodeProto::new("Relu", "relu_0", &[INPUT_NAME], &[OUTPUT_NAME])],
            initializer: vec![],
            input: vec![ValueInfoProto::tensor(INPUT_NAME, data_type::FLOAT, shape())],
            output: vec![ValueInfoProto::tensor(OUTPUT_NAME, data_type::FLOAT, shape())],
            value_info: vec![],
        });

        // input -> Sub(10) -> Sqrt -> output: NaN for every input below 10,
        // which covers the whole [0, 1) range the check draws from.
        let candidate = wrap(GraphProto {
            name: "nan".into(),
            node: vec![
                NodeProto::new("Sub", "sub_0", &[INPUT_NAME, "offset"], &["sub_0_out"]),
                NodeProto::new("Sqrt", "sqrt_0", &["sub_0_out"], &[OUTPUT_NAME]),
            ],
            initializer: vec![TensorProto::from_f32("offset", &[1], &[10.0])],
            input: vec![ValueInfoProto::tensor(INPUT_NAME, data_type::FLOAT, shape())],
            output: vec![ValueInfoProto::tensor(OUTPUT_NAME, data_type::FLOAT, shape())],
            value_info: vec![],
        });

        let diff = max_output_difference(&original, &candidate).unwrap();
        assert!(diff.is_nan());
        // A NaN difference must never satisfy the certification guard.
        assert!(!(diff <= EQUIVALENCE_TOLERANCE));
    }

    #[test]
    fn missing_input_is_a_read_error() {
        let dir = TempDir::new("simplify-missing");
        let err = simplify(
            &dir.path().join("absent.onnx"),
            &dir.path().join("out.onnx"),
        )
        .unwrap_err();
        assert!(matches!(err, SimplifyError::Read(_)));
        assert!(!dir.path().join("out.onnx").exists());
    }
}
