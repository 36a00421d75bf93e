//! modelprep prepares an image-classification network for deployment in a
//! browser-based inference runtime.
//!
//! # Pipeline
//!
//! The work is a sequence of stages over one output directory:
//!
//! 1. [`export`](export::export) traces the built-in network from
//!    [`zoo`] into an ONNX artifact with fixed `input`/`output` tensor
//!    names and a fixed or symbolic batch dimension.
//! 2. [`validate`](validate::validate) checks the artifact's internal
//!    references without executing it.
//! 3. [`simplify`](simplify::simplify) rewrites the graph (batch-norm
//!    folding, passthrough elision) and keeps the result only when the
//!    original and rewritten graphs produce matching outputs for the same
//!    input.
//! 4. The rewritten artifact is validated again.
//! 5. [`benchmark`](bench::benchmark) measures per-call latency over a
//!    warmup plus measured-run protocol; [`compare`](compare::compare)
//!    measures every variant side by side.
//! 6. A class-label list and a JSON variant manifest for the consuming web
//!    application are produced alongside the artifacts.
//!
//! [`pipeline::Orchestrator`] sequences the stages, enforces preconditions
//! and overwrite confirmation, and aggregates a run summary. The `modelprep`
//! binary is a thin CLI over it.
//!
//! Artifacts are written through [`modelprep_onnx`]'s protobuf types and
//! executed through the tract engine wrapped by [`runtime::Session`].

pub mod artifact;
pub mod bench;
pub mod compare;
pub mod config;
pub mod export;
pub mod labels;
pub mod manifest;
pub mod pipeline;
pub mod runtime;
pub mod simplify;
pub mod validate;
pub mod zoo;

#[cfg(test)]
mod test_util;

pub use artifact::{ArtifactStore, ModelArtifact, Provenance, Validity};
pub use bench::{BenchConfig, BenchmarkResult};
pub use compare::{ComparisonEntry, ComparisonReport};
pub use config::{BatchMode, InputSpec, PipelineConfig};
pub use pipeline::{
    Orchestrator, OverwritePrompt, PipelineRunSummary, RunState, Stage, StageOutcome, StepSelect,
};
pub use runtime::Session;
pub use zoo::Network;
