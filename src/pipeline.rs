//! Stage orchestration for the preparation pipeline.
//!
//! The orchestrator runs a fixed sequence of stages, each of which checks
//! its precondition (does the upstream artifact exist?), consults the
//! overwrite gate when its target already exists, executes, and records an
//! outcome. Model-stage failures that leave downstream stages nothing to
//! work on abort the model chain; the labels and manifest stages are
//! independent of it and always get their turn. Every decision lands in a
//! [`PipelineRunSummary`] so the caller can render the run and derive an
//! exit code; nothing here prints.

use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::artifact::ArtifactStore;
use crate::bench::{benchmark, BenchError, BenchmarkResult};
use crate::compare::{compare, ComparisonReport};
use crate::config::PipelineConfig;
use crate::export::{export, ExportError, INPUT_NAME, OUTPUT_NAME};
use crate::labels::{download_labels, LabelsError};
use crate::manifest::{write_manifest, ManifestError};
use crate::simplify::{simplify, SimplifyError};
use crate::validate::{validate, ValidateError, ValidationReport};
use crate::zoo;

/// The stages the orchestrator can run, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Export,
    ValidateExported,
    Simplify,
    ValidateSimplified,
    Benchmark,
    Compare,
    Labels,
    Manifest,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Export => "export",
            Stage::ValidateExported => "validate exported",
            Stage::Simplify => "simplify",
            Stage::ValidateSimplified => "validate simplified",
            Stage::Benchmark => "benchmark",
            Stage::Compare => "compare",
            Stage::Labels => "labels",
            Stage::Manifest => "manifest",
        };
        f.write_str(name)
    }
}

/// Why a stage did not execute.
#[derive(Debug)]
pub enum SkipReason {
    /// A required upstream artifact does not exist.
    MissingInput(PathBuf),

    /// The target exists and the overwrite gate declined to replace it.
    Declined(PathBuf),

    /// Turned off for this run by a flag.
    Disabled,

    /// The file already exists and is reused as-is.
    AlreadyPresent(PathBuf),

    /// The capability the stage needs is not compiled in.
    Unavailable,

    /// Only one artifact exists; a comparison needs two.
    SingleVariant,

    /// An upstream stage failed or was skipped, leaving nothing to work on.
    Cascade,
}

impl SkipReason {
    /// Whether this skip still counts as a successful run. Declining an
    /// overwrite, reusing an existing file, or lacking an optional
    /// capability are all fine; a missing required input is not.
    pub fn is_benign(&self) -> bool {
        match self {
            SkipReason::Declined(_)
            | SkipReason::Disabled
            | SkipReason::AlreadyPresent(_)
            | SkipReason::Unavailable
            | SkipReason::SingleVariant => true,
            SkipReason::MissingInput(_) | SkipReason::Cascade => false,
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MissingInput(path) => {
                write!(f, "required input {} does not exist", path.display())
            }
            SkipReason::Declined(path) => {
                write!(f, "{} exists, overwrite declined", path.display())
            }
            SkipReason::Disabled => write!(f, "disabled for this run"),
            SkipReason::AlreadyPresent(path) => write!(f, "{} already exists", path.display()),
            SkipReason::Unavailable => write!(f, "graph rewrite support not compiled in"),
            SkipReason::SingleVariant => write!(f, "only one artifact exists, nothing to compare"),
            SkipReason::Cascade => write!(f, "an upstream stage did not produce its artifact"),
        }
    }
}

/// An error from whichever stage failed.
#[derive(Debug)]
pub enum StageError {
    Export(ExportError),
    Validate(ValidateError),
    Simplify(SimplifyError),
    Bench(BenchError),
    Labels(LabelsError),
    Manifest(ManifestError),

    /// The artifact's declared names or shape do not match the configured
    /// input interface.
    Interface(String),
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageError::Export(err) => err.fmt(f),
            StageError::Validate(err) => err.fmt(f),
            StageError::Simplify(err) => err.fmt(f),
            StageError::Bench(err) => err.fmt(f),
            StageError::Labels(err) => err.fmt(f),
            StageError::Manifest(err) => err.fmt(f),
            StageError::Interface(reason) => write!(f, "interface mismatch: {}", reason),
        }
    }
}

impl Error for StageError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StageError::Export(err) => Some(err),
            StageError::Validate(err) => Some(err),
            StageError::Simplify(err) => Some(err),
            StageError::Bench(err) => Some(err),
            StageError::Labels(err) => Some(err),
            StageError::Manifest(err) => Some(err),
            StageError::Interface(_) => None,
        }
    }
}

/// What happened to one stage.
#[derive(Debug)]
pub enum StageOutcome {
    /// The stage executed; the string is a one-line human-readable detail.
    Ran(String),

    /// The stage did not execute.
    Skipped(SkipReason),

    /// The stage executed and failed.
    Failed(StageError),
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageOutcome::Ran(detail) => write!(f, "ok - {}", detail),
            StageOutcome::Skipped(reason) => write!(f, "skipped - {}", reason),
            StageOutcome::Failed(err) => write!(f, "failed - {}", err),
        }
    }
}

/// One stage's entry in the run summary.
#[derive(Debug)]
pub struct StageReport {
    pub stage: Stage,
    pub outcome: StageOutcome,
}

/// Existence and size of one pipeline output file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileStatus {
    pub path: PathBuf,

    /// Size in bytes, or `None` when the file does not exist.
    pub size: Option<u64>,
}

/// How a run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    /// Every requested stage ran, or was skipped by an explicit decision.
    Completed,

    /// A model-chain stage failed in a way nothing downstream could survive.
    Aborted,
}

/// Everything one orchestrator invocation decided and produced.
#[derive(Debug)]
pub struct PipelineRunSummary {
    /// Outcome of every requested stage, in execution order.
    pub stages: Vec<StageReport>,

    /// Existence and size of the pipeline's output files.
    pub files: Vec<FileStatus>,

    /// Successful benchmark results, keyed by artifact file name.
    pub benchmarks: Vec<(String, BenchmarkResult)>,

    /// The comparison report, when the compare stage ran.
    pub comparison: Option<ComparisonReport>,

    pub state: RunState,
}

impl PipelineRunSummary {
    /// Whether every requested stage ran or was benignly skipped.
    pub fn success(&self) -> bool {
        self.state == RunState::Completed
            && self.stages.iter().all(|report| match &report.outcome {
                StageOutcome::Ran(_) => true,
                StageOutcome::Skipped(reason) => reason.is_benign(),
                StageOutcome::Failed(_) => false,
            })
    }

    /// Process exit code for this run.
    pub fn exit_code(&self) -> u8 {
        if self.success() {
            0
        } else {
            1
        }
    }

    /// The recorded outcome for `stage`, if it was requested.
    pub fn outcome(&self, stage: Stage) -> Option<&StageOutcome> {
        self.stages
            .iter()
            .find(|report| report.stage == stage)
            .map(|report| &report.outcome)
    }
}

/// Which stages a run should attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepSelect {
    Export,
    Simplify,
    Test,
    Labels,
    Config,
    All,
}

impl StepSelect {
    fn wants(self, stage: Stage) -> bool {
        match self {
            StepSelect::All => true,
            StepSelect::Export => matches!(stage, Stage::Export | Stage::ValidateExported),
            StepSelect::Simplify => {
                matches!(stage, Stage::Simplify | Stage::ValidateSimplified)
            }
            StepSelect::Test => matches!(stage, Stage::Benchmark | Stage::Compare),
            StepSelect::Labels => matches!(stage, Stage::Labels),
            StepSelect::Config => matches!(stage, Stage::Manifest),
        }
    }
}

impl fmt::Display for StepSelect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepSelect::Export => "export",
            StepSelect::Simplify => "simplify",
            StepSelect::Test => "test",
            StepSelect::Labels => "labels",
            StepSelect::Config => "config",
            StepSelect::All => "all",
        };
        f.write_str(name)
    }
}

impl FromStr for StepSelect {
    type Err = String;

    fn from_str(s: &str) -> Result<StepSelect, String> {
        match s {
            "export" => Ok(StepSelect::Export),
            "simplify" => Ok(StepSelect::Simplify),
            "test" => Ok(StepSelect::Test),
            "labels" => Ok(StepSelect::Labels),
            "config" => Ok(StepSelect::Config),
            "all" => Ok(StepSelect::All),
            other => Err(format!(
                "unknown step \"{}\" (expected export, simplify, test, labels, config or all)",
                other
            )),
        }
    }
}

/// Decision source for replacing files that already exist.
///
/// Injected rather than read from stdin directly so the orchestrator is
/// testable without interactive input.
pub trait OverwritePrompt {
    /// Decide whether the file at `path` may be replaced.
    fn allow_overwrite(&mut self, path: &Path) -> bool;
}

/// Refuses every overwrite. The safe default when nobody can answer.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeclineAll;

impl OverwritePrompt for DeclineAll {
    fn allow_overwrite(&mut self, _path: &Path) -> bool {
        false
    }
}

/// Approves every overwrite, for non-interactive runs that asked for it.
#[derive(Clone, Copy, Debug, Default)]
pub struct ApproveAll;

impl OverwritePrompt for ApproveAll {
    fn allow_overwrite(&mut self, _path: &Path) -> bool {
        true
    }
}

/// Sequences the pipeline stages over one configuration.
pub struct Orchestrator<'a> {
    config: PipelineConfig,
    prompt: &'a mut dyn OverwritePrompt,
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: PipelineConfig, prompt: &'a mut dyn OverwritePrompt) -> Orchestrator<'a> {
        Orchestrator { config, prompt }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the stages selected by `step`. `skip_benchmark` turns the
    /// benchmark and compare stages into benign skips.
    pub fn run(&mut self, step: StepSelect, skip_benchmark: bool) -> PipelineRunSummary {
        let mut summary = PipelineRunSummary {
            stages: Vec::new(),
            files: Vec::new(),
            benchmarks: Vec::new(),
            comparison: None,
            state: RunState::Completed,
        };
        // Set when a model-chain stage fails so badly that later model
        // stages have nothing valid to work on. Labels and manifest ignore
        // it; they do not depend on the artifacts.
        let mut fatal = false;
        // Set when the rewrite capability is compiled out, so the follow-up
        // validation knows why there is nothing to check.
        let mut rewrite_unavailable = false;
        // Set when the simplify stage was skipped for a missing input.
        let mut simplify_unfed = false;

        if step.wants(Stage::Export) {
            let outcome = self.run_export();
            fatal |= matches!(outcome, StageOutcome::Failed(_));
            summary.stages.push(StageReport {
                stage: Stage::Export,
                outcome,
            });
        }

        if step.wants(Stage::ValidateExported) {
            let outcome = if fatal {
                StageOutcome::Skipped(SkipReason::Cascade)
            } else {
                self.run_validate(&self.config.model_path())
            };
            fatal |= matches!(outcome, StageOutcome::Failed(_));
            summary.stages.push(StageReport {
                stage: Stage::ValidateExported,
                outcome,
            });
        }

        if step.wants(Stage::Simplify) {
            let outcome = if fatal {
                StageOutcome::Skipped(SkipReason::Cascade)
            } else {
                self.run_simplify(&mut rewrite_unavailable)
            };
            simplify_unfed = matches!(
                outcome,
                StageOutcome::Skipped(SkipReason::MissingInput(_))
            );
            summary.stages.push(StageReport {
                stage: Stage::Simplify,
                outcome,
            });
        }

        if step.wants(Stage::ValidateSimplified) {
            let simplified = self.config.simplified_path();
            let outcome = if fatal || simplify_unfed {
                StageOutcome::Skipped(SkipReason::Cascade)
            } else if rewrite_unavailable && !simplified.exists() {
                StageOutcome::Skipped(SkipReason::Unavailable)
            } else {
                self.run_validate(&simplified)
            };
            summary.stages.push(StageReport {
                stage: Stage::ValidateSimplified,
                outcome,
            });
        }

        if step.wants(Stage::Benchmark) {
            let outcome = if fatal {
                StageOutcome::Skipped(SkipReason::Cascade)
            } else if skip_benchmark {
                StageOutcome::Skipped(SkipReason::Disabled)
            } else {
                self.run_benchmark(&mut summary.benchmarks)
            };
            summary.stages.push(StageReport {
                stage: Stage::Benchmark,
                outcome,
            });
        }

        if step.wants(Stage::Compare) {
            let (outcome, report) = if fatal {
                (StageOutcome::Skipped(SkipReason::Cascade), None)
            } else if skip_benchmark {
                (StageOutcome::Skipped(SkipReason::Disabled), None)
            } else {
                self.run_compare()
            };
            summary.comparison = report;
            summary.stages.push(StageReport {
                stage: Stage::Compare,
                outcome,
            });
        }

        if step.wants(Stage::Labels) {
            summary.stages.push(StageReport {
                stage: Stage::Labels,
                outcome: self.run_labels(),
            });
        }

        if step.wants(Stage::Manifest) {
            summary.stages.push(StageReport {
                stage: Stage::Manifest,
                outcome: self.run_manifest(),
            });
        }

        let store = ArtifactStore::new(&self.config.out_dir);
        let names = [
            self.config.model_file(),
            self.config.simplified_file(),
            self.config.labels_file().to_string(),
            self.config.manifest_file().to_string(),
        ];
        for name in names {
            let path = store.path(&name);
            let size = store.size(&path);
            summary.files.push(FileStatus { path, size });
        }

        summary.state = if fatal {
            RunState::Aborted
        } else {
            RunState::Completed
        };
        summary
    }

    fn run_export(&mut self) -> StageOutcome {
        let path = self.config.model_path();
        if path.exists() && !self.prompt.allow_overwrite(&path) {
            return StageOutcome::Skipped(SkipReason::Declined(path));
        }
        let mut network = zoo::smallnet(&self.config.input_spec);
        match export(&mut network, &self.config.input_spec, &path, self.config.opset) {
            Ok(artifact) => StageOutcome::Ran(format!(
                "wrote {} ({} bytes)",
                artifact.file_name(),
                artifact.size
            )),
            Err(err) => StageOutcome::Failed(StageError::Export(err)),
        }
    }

    fn run_validate(&self, path: &Path) -> StageOutcome {
        if !path.exists() {
            return StageOutcome::Skipped(SkipReason::MissingInput(path.to_path_buf()));
        }
        match validate(path) {
            Ok(report) => match self.check_interface(&report) {
                Ok(()) => StageOutcome::Ran(format!(
                    "{} nodes, interface matches",
                    report.node_count
                )),
                Err(err) => StageOutcome::Failed(err),
            },
            Err(err) => StageOutcome::Failed(StageError::Validate(err)),
        }
    }

    /// Assert that a validated artifact declares the names and shape the
    /// configuration promised, instead of assuming it.
    fn check_interface(&self, report: &ValidationReport) -> Result<(), StageError> {
        if report.input_names != [INPUT_NAME] {
            return Err(StageError::Interface(format!(
                "input names are {:?}, expected [\"{}\"]",
                report.input_names, INPUT_NAME
            )));
        }
        if report.output_names != [OUTPUT_NAME] {
            return Err(StageError::Interface(format!(
                "output names are {:?}, expected [\"{}\"]",
                report.output_names, OUTPUT_NAME
            )));
        }
        let spec = &self.config.input_spec;
        let expected: Vec<Option<i64>> = {
            let dims = spec.dims();
            let mut shape: Vec<Option<i64>> = dims.iter().map(|&d| Some(d as i64)).collect();
            if spec.batch_mode == crate::config::BatchMode::Symbolic {
                shape[0] = None;
            }
            shape
        };
        if report.input_shape != expected {
            return Err(StageError::Interface(format!(
                "input shape is {:?}, expected {:?}",
                report.input_shape, expected
            )));
        }
        Ok(())
    }

    fn run_simplify(&mut self, rewrite_unavailable: &mut bool) -> StageOutcome {
        let input = self.config.model_path();
        if !input.exists() {
            return StageOutcome::Skipped(SkipReason::MissingInput(input));
        }
        let output = self.config.simplified_path();
        if output.exists() && !self.prompt.allow_overwrite(&output) {
            return StageOutcome::Skipped(SkipReason::Declined(output));
        }
        match simplify(&input, &output) {
            Ok(outcome) => StageOutcome::Ran(format!(
                "certified equivalent, {} -> {} nodes",
                outcome.nodes_before, outcome.nodes_after
            )),
            Err(SimplifyError::MissingDependency) => {
                *rewrite_unavailable = true;
                StageOutcome::Skipped(SkipReason::Unavailable)
            }
            Err(err) => StageOutcome::Failed(StageError::Simplify(err)),
        }
    }

    fn variant_paths(&self) -> Vec<PathBuf> {
        vec![self.config.model_path(), self.config.simplified_path()]
    }

    fn run_benchmark(&mut self, results: &mut Vec<(String, BenchmarkResult)>) -> StageOutcome {
        let existing: Vec<PathBuf> = self
            .variant_paths()
            .into_iter()
            .filter(|path| path.exists())
            .collect();
        if existing.is_empty() {
            return StageOutcome::Skipped(SkipReason::MissingInput(self.config.model_path()));
        }

        let total = existing.len();
        let mut first_err: Option<BenchError> = None;
        let mut failed: Vec<String> = Vec::new();
        for path in existing {
            match benchmark(&path, &self.config.bench) {
                Ok(result) => results.push((display_name(&path), result)),
                Err(err) => {
                    failed.push(format!("{} ({})", display_name(&path), err));
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }
        match first_err {
            // Every variant failed to benchmark.
            Some(err) if results.is_empty() => StageOutcome::Failed(StageError::Bench(err)),
            _ => {
                let mut detail = format!("measured {} of {} artifacts", results.len(), total);
                if !failed.is_empty() {
                    detail.push_str(&format!("; failed: {}", failed.join(", ")));
                }
                StageOutcome::Ran(detail)
            }
        }
    }

    fn run_compare(&mut self) -> (StageOutcome, Option<ComparisonReport>) {
        let paths = self.variant_paths();
        let existing: Vec<PathBuf> = paths.iter().filter(|p| p.exists()).cloned().collect();
        if existing.is_empty() {
            return (
                StageOutcome::Skipped(SkipReason::MissingInput(self.config.model_path())),
                None,
            );
        }
        if existing.len() < 2 {
            return (StageOutcome::Skipped(SkipReason::SingleVariant), None);
        }
        let report = compare(&paths, &self.config.bench);
        let outcome = StageOutcome::Ran(format!("{} artifacts compared", report.entries.len()));
        (outcome, Some(report))
    }

    fn run_labels(&mut self) -> StageOutcome {
        let path = self.config.labels_path();
        if path.exists() {
            return StageOutcome::Skipped(SkipReason::AlreadyPresent(path));
        }
        match download_labels(&self.config.labels_url, &path) {
            Ok(count) => StageOutcome::Ran(format!("{} classes", count)),
            Err(err) => StageOutcome::Failed(StageError::Labels(err)),
        }
    }

    fn run_manifest(&mut self) -> StageOutcome {
        match write_manifest(&self.config) {
            Ok(manifest) => {
                StageOutcome::Ran(format!("{} variants listed", manifest.models.len()))
            }
            Err(err) => StageOutcome::Failed(StageError::Manifest(err)),
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
