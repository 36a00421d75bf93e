//! Pipeline configuration.

use std::path::PathBuf;

use crate::bench::BenchConfig;

/// Default source for the class-name list consumed by the browser runtime.
pub const DEFAULT_LABELS_URL: &str =
    "https://raw.githubusercontent.com/onnx/models/main/vision/classification/synset.txt";

/// How the leading batch dimension is declared in exported artifacts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchMode {
    /// Pin the batch dimension to the size in the [`InputSpec`].
    Fixed,

    /// Declare the batch dimension as the symbolic parameter `batch_size`,
    /// resolved at execution time from the actual input.
    Symbolic,
}

/// Shape of the representative input used for export tracing and
/// benchmarking: NCHW with a fixed or symbolic batch dimension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InputSpec {
    pub batch: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub batch_mode: BatchMode,
}

impl InputSpec {
    /// Create a spec with a fixed batch dimension.
    pub fn nchw(batch: usize, channels: usize, height: usize, width: usize) -> InputSpec {
        InputSpec {
            batch,
            channels,
            height,
            width,
            batch_mode: BatchMode::Fixed,
        }
    }

    /// Switch the batch dimension to symbolic.
    pub fn with_symbolic_batch(mut self) -> InputSpec {
        self.batch_mode = BatchMode::Symbolic;
        self
    }

    /// Concrete NCHW dimensions, with the declared batch size for the
    /// leading dimension regardless of batch mode.
    pub fn dims(&self) -> [usize; 4] {
        [self.batch, self.channels, self.height, self.width]
    }

    /// Number of elements in one input tensor.
    pub fn elem_count(&self) -> usize {
        self.batch * self.channels * self.height * self.width
    }
}

impl Default for InputSpec {
    fn default() -> InputSpec {
        // The classifier's deployed input: one 224x224 RGB image.
        InputSpec::nchw(1, 3, 224, 224)
    }
}

/// Immutable settings for one pipeline run, fixed at construction.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Directory that receives all produced files.
    pub out_dir: PathBuf,

    /// Input interface every artifact must declare.
    pub input_spec: InputSpec,

    /// ONNX opset version pinned at export time.
    pub opset: i64,

    /// Run counts for the benchmarking stage.
    pub bench: BenchConfig,

    /// Source URL for the class-name list.
    pub labels_url: String,

    /// Base name of the network variant, used for file and manifest naming.
    pub model_name: String,
}

impl PipelineConfig {
    /// Configuration with the stock defaults, targeting `out_dir`.
    pub fn new(out_dir: impl Into<PathBuf>) -> PipelineConfig {
        PipelineConfig {
            out_dir: out_dir.into(),
            input_spec: InputSpec::default(),
            opset: crate::export::DEFAULT_OPSET,
            bench: BenchConfig::default(),
            labels_url: DEFAULT_LABELS_URL.to_string(),
            model_name: "smallnet".to_string(),
        }
    }

    /// File name of the exported artifact.
    pub fn model_file(&self) -> String {
        format!("{}.onnx", self.model_name)
    }

    /// File name of the simplified artifact.
    pub fn simplified_file(&self) -> String {
        format!("{}_simplified.onnx", self.model_name)
    }

    /// File name of the labels JSON.
    pub fn labels_file(&self) -> &'static str {
        "imagenet_classes.json"
    }

    /// File name of the variant manifest JSON.
    pub fn manifest_file(&self) -> &'static str {
        "model_config.json"
    }

    /// Path of the exported artifact.
    pub fn model_path(&self) -> PathBuf {
        self.out_dir.join(self.model_file())
    }

    /// Path of the simplified artifact.
    pub fn simplified_path(&self) -> PathBuf {
        self.out_dir.join(self.simplified_file())
    }

    /// Path of the labels JSON.
    pub fn labels_path(&self) -> PathBuf {
        self.out_dir.join(self.labels_file())
    }

    /// Path of the variant manifest JSON.
    pub fn manifest_path(&self) -> PathBuf {
        self.out_dir.join(self.manifest_file())
    }
}

#[cfg(test)]
mod tests {
    use super::{BatchMode, InputSpec, PipelineConfig};

    #[test]
    fn default_spec_is_single_image() {
        let spec = InputSpec::default();
        assert_eq!(spec.dims(), [1, 3, 224, 224]);
        assert_eq!(spec.batch_mode, BatchMode::Fixed);
        assert_eq!(spec.elem_count(), 3 * 224 * 224);
    }

    #[test]
    fn symbolic_batch_keeps_shape() {
        let spec = InputSpec::nchw(4, 3, 32, 32).with_symbolic_batch();
        assert_eq!(spec.batch_mode, BatchMode::Symbolic);
        assert_eq!(spec.dims(), [4, 3, 32, 32]);
    }

    #[test]
    fn paths_derive_from_model_name() {
        let config = PipelineConfig::new("/tmp/models");
        assert_eq!(config.model_file(), "smallnet.onnx");
        assert_eq!(config.simplified_file(), "smallnet_simplified.onnx");
        assert!(config.model_path().ends_with("smallnet.onnx"));
        assert!(config.manifest_path().ends_with("model_config.json"));
    }
}
