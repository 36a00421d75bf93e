//! Built-in pretrained networks.
//!
//! The pipeline's job starts from an in-memory trained network. This module
//! plays the part of the model repository: it builds a compact convolutional
//! classifier whose weights are generated from a fixed seed, so every run of
//! the exporter produces the same artifact bytes for the same configuration.

use fastrand::Rng;

use crate::config::InputSpec;

/// Number of classes in the classifier head, matching the label list the
/// browser runtime loads.
pub const NUM_CLASSES: usize = 1000;

/// Seed for the deterministic "pretrained" weights.
const WEIGHT_SEED: u64 = 0x6d70_7265_7031;

/// One layer of a [`Network`], with any weights it owns.
#[derive(Clone, Debug)]
pub enum Layer {
    /// 2D convolution over NCHW input. `weight` is `[out_c, in_c, k, k]` in
    /// row-major order, `bias` has `out_c` entries when present.
    Conv {
        name: String,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        pad: usize,
        weight: Vec<f32>,
        bias: Option<Vec<f32>>,
    },

    /// Inference-form batch normalization over the channel dimension. All
    /// parameter vectors have one entry per channel.
    BatchNorm {
        name: String,
        scale: Vec<f32>,
        bias: Vec<f32>,
        mean: Vec<f32>,
        var: Vec<f32>,
        epsilon: f32,
    },

    Relu,

    MaxPool {
        kernel: usize,
        stride: usize,
    },

    GlobalAvgPool,

    /// Collapse all trailing dimensions into one feature axis.
    Flatten,

    /// Fully-connected layer. `weight` is `[out_features, in_features]`.
    Dense {
        name: String,
        in_features: usize,
        out_features: usize,
        weight: Vec<f32>,
        bias: Vec<f32>,
    },

    /// Active in training mode only; dropped when tracing for inference.
    Dropout {
        ratio: f32,
    },
}

impl Layer {
    /// Number of learned parameters in this layer.
    pub fn param_count(&self) -> usize {
        match self {
            Layer::Conv { weight, bias, .. } => {
                weight.len() + bias.as_ref().map(|b| b.len()).unwrap_or(0)
            }
            Layer::BatchNorm {
                scale, bias, mean, var, ..
            } => scale.len() + bias.len() + mean.len() + var.len(),
            Layer::Dense { weight, bias, .. } => weight.len() + bias.len(),
            _ => 0,
        }
    }
}

/// A trained network: an ordered layer list plus a training-mode flag.
#[derive(Clone, Debug)]
pub struct Network {
    name: String,
    layers: Vec<Layer>,
    training: bool,
}

impl Network {
    pub fn new(name: impl Into<String>, layers: Vec<Layer>) -> Network {
        Network {
            name: name.into(),
            // Networks arrive from the repository in training mode, as the
            // common frameworks deliver them.
            layers,
            training: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Switch to inference-only mode: training-time layers (dropout) stop
    /// contributing to traces.
    pub fn set_eval(&mut self) {
        self.training = false;
    }

    /// Layers as seen by an inference-mode trace: dropout is skipped.
    pub fn inference_layers(&self) -> impl Iterator<Item = &Layer> {
        self.layers
            .iter()
            .filter(|layer| !matches!(layer, Layer::Dropout { .. }))
    }

    /// Total learned parameter count.
    pub fn param_count(&self) -> usize {
        self.layers.iter().map(Layer::param_count).sum()
    }
}

/// The stock classifier variant: two conv/batch-norm/relu blocks with
/// downsampling, a global-average-pool head and a fully-connected classifier
/// over [`NUM_CLASSES`] classes. Weights are seeded deterministically.
pub fn smallnet(spec: &InputSpec) -> Network {
    let mut rng = Rng::with_seed(WEIGHT_SEED);

    let layers = vec![
        conv(&mut rng, "conv1", spec.channels, 16, 3, 2, 1),
        batch_norm(&mut rng, "bn1", 16),
        Layer::Relu,
        Layer::MaxPool { kernel: 2, stride: 2 },
        conv(&mut rng, "conv2", 16, 32, 3, 2, 1),
        batch_norm(&mut rng, "bn2", 32),
        Layer::Relu,
        Layer::GlobalAvgPool,
        Layer::Flatten,
        Layer::Dropout { ratio: 0.2 },
        dense(&mut rng, "fc", 32, NUM_CLASSES),
    ];

    Network::new("smallnet", layers)
}

fn conv(
    rng: &mut Rng,
    name: &str,
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    pad: usize,
) -> Layer {
    let weight = uniform(rng, out_channels * in_channels * kernel * kernel, 0.2);
    Layer::Conv {
        name: name.to_string(),
        in_channels,
        out_channels,
        kernel,
        stride,
        pad,
        weight,
        bias: None,
    }
}

fn batch_norm(rng: &mut Rng, name: &str, channels: usize) -> Layer {
    Layer::BatchNorm {
        name: name.to_string(),
        scale: shifted(rng, channels, 0.75, 1.25),
        bias: uniform(rng, channels, 0.1),
        mean: uniform(rng, channels, 0.1),
        // Running variance must stay positive.
        var: shifted(rng, channels, 0.5, 1.5),
        epsilon: 1e-5,
    }
}

fn dense(rng: &mut Rng, name: &str, in_features: usize, out_features: usize) -> Layer {
    Layer::Dense {
        name: name.to_string(),
        in_features,
        out_features,
        weight: uniform(rng, out_features * in_features, 0.3),
        bias: uniform(rng, out_features, 0.1),
    }
}

/// `n` values uniform in `[-scale, scale)`.
fn uniform(rng: &mut Rng, n: usize, scale: f32) -> Vec<f32> {
    (0..n).map(|_| (rng.f32() * 2.0 - 1.0) * scale).collect()
}

/// `n` values uniform in `[lo, hi)`.
fn shifted(rng: &mut Rng, n: usize, lo: f32, hi: f32) -> Vec<f32> {
    (0..n).map(|_| lo + rng.f32() * (hi - lo)).collect()
}

#[cfg(test)]
mod tests {
    use super::{smallnet, Layer, NUM_CLASSES};
    use crate::config::InputSpec;

    #[test]
    fn smallnet_is_deterministic() {
        let spec = InputSpec::default();
        let a = smallnet(&spec);
        let b = smallnet(&spec);

        assert_eq!(a.param_count(), b.param_count());
        for (la, lb) in a.layers().iter().zip(b.layers()) {
            if let (Layer::Conv { weight: wa, .. }, Layer::Conv { weight: wb, .. }) = (la, lb) {
                assert_eq!(wa, wb);
            }
        }
    }

    #[test]
    fn smallnet_arrives_in_training_mode() {
        let net = smallnet(&InputSpec::default());
        assert!(net.is_training());
        // Dropout present in the layer list but absent from inference traces.
        assert!(net
            .layers()
            .iter()
            .any(|l| matches!(l, Layer::Dropout { .. })));
        assert!(!net
            .inference_layers()
            .any(|l| matches!(l, Layer::Dropout { .. })));
    }

    #[test]
    fn smallnet_head_matches_label_count() {
        let net = smallnet(&InputSpec::default());
        let fc_out = net.layers().iter().rev().find_map(|l| match l {
            Layer::Dense { out_features, .. } => Some(*out_features),
            _ => None,
        });
        assert_eq!(fc_out, Some(NUM_CLASSES));
    }

    #[test]
    fn batch_norm_variance_positive() {
        let net = smallnet(&InputSpec::default());
        for layer in net.layers() {
            if let Layer::BatchNorm { var, .. } = layer {
                assert!(var.iter().all(|v| *v > 0.0));
            }
        }
    }

    #[test]
    fn param_count_counts_all_weight_vectors() {
        let spec = InputSpec::default();
        let net = smallnet(&spec);
        // conv1 + bn1 + conv2 + bn2 + fc, biasless convs.
        let expected = 16 * spec.channels * 9
            + 4 * 16
            + 32 * 16 * 9
            + 4 * 32
            + NUM_CLASSES * 32
            + NUM_CLASSES;
        assert_eq!(net.param_count(), expected);
    }
}
