#![cfg(feature = "simplify")]

//! End-to-end pipeline runs against scratch directories.
//!
//! These tests drive the real exporter, rewriter and inference engine but
//! never the network: the labels file is seeded up front so the labels stage
//! reuses it.

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use modelprep::bench::{benchmark, BenchConfig};
use modelprep::compare::compare;
use modelprep::config::{InputSpec, PipelineConfig};
use modelprep::export::{export, DEFAULT_OPSET, INPUT_NAME, OUTPUT_NAME};
use modelprep::pipeline::{
    ApproveAll, DeclineAll, Orchestrator, PipelineRunSummary, RunState, SkipReason, Stage,
    StageOutcome, StepSelect,
};
use modelprep::simplify::simplify;
use modelprep::validate::validate;
use modelprep::zoo;

/// A uniquely-named directory under the system temp dir, removed on drop.
struct TempDir {
    path: PathBuf,
}

impl TempDir {
    fn new(tag: &str) -> TempDir {
        let path = std::env::temp_dir().join(format!(
            "modelprep-e2e-{}-{}-{:x}",
            tag,
            std::process::id(),
            fastrand::u64(..)
        ));
        fs::create_dir_all(&path).expect("failed to create temp dir");
        TempDir { path }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// Few-run counts so end-to-end tests stay quick.
fn quick_bench() -> BenchConfig {
    BenchConfig {
        warmup_runs: 1,
        measured_runs: 2,
    }
}

fn quick_config(dir: &TempDir) -> PipelineConfig {
    let mut config = PipelineConfig::new(dir.path());
    config.input_spec = InputSpec::nchw(1, 3, 32, 32);
    config.bench = quick_bench();
    config
}

/// Write a label list where the labels stage would download one.
fn seed_labels(config: &PipelineConfig) -> Result<(), Box<dyn Error>> {
    let labels: Vec<String> = (0..zoo::NUM_CLASSES)
        .map(|i| format!("class {}", i))
        .collect();
    fs::write(config.labels_path(), serde_json::to_vec_pretty(&labels)?)?;
    Ok(())
}

/// Fail with a readable message unless `stage` ran.
fn expect_ran(summary: &PipelineRunSummary, stage: Stage) -> Result<(), Box<dyn Error>> {
    match summary.outcome(stage) {
        Some(StageOutcome::Ran(_)) => Ok(()),
        other => Err(format!("stage {} did not run: {:?}", stage, other).into()),
    }
}

#[test]
fn test_deployed_size_conversion_flow() -> Result<(), Box<dyn Error>> {
    let dir = TempDir::new("deployed");
    let spec = InputSpec::nchw(1, 3, 224, 224);
    let exported_path = dir.path().join("smallnet.onnx");
    let simplified_path = dir.path().join("smallnet_simplified.onnx");

    let mut network = zoo::smallnet(&spec);
    let artifact = export(&mut network, &spec, &exported_path, DEFAULT_OPSET)?;
    assert_eq!(artifact.size, fs::metadata(&exported_path)?.len());

    // The converted artifact is structurally sound and declares the fixed
    // tensor interface.
    let report = validate(&exported_path)?;
    assert_eq!(report.input_names, vec![INPUT_NAME.to_string()]);
    assert_eq!(report.output_names, vec![OUTPUT_NAME.to_string()]);
    assert_eq!(
        report.input_shape,
        vec![Some(1), Some(3), Some(224), Some(224)]
    );

    // Simplifying certifies equivalence and never grows the file.
    let outcome = simplify(&exported_path, &simplified_path)?;
    assert!(outcome.certified);
    assert!(outcome.nodes_after < outcome.nodes_before);
    assert!(outcome.artifact.size <= fs::metadata(&exported_path)?.len());
    let report = validate(&simplified_path)?;
    assert_eq!(report.input_names, vec![INPUT_NAME.to_string()]);

    // Benchmarking yields one positive sample per measured run.
    let config = BenchConfig {
        warmup_runs: 1,
        measured_runs: 5,
    };
    for path in [&exported_path, &simplified_path] {
        let result = benchmark(path, &config)?;
        assert_eq!(result.samples_ms.len(), 5);
        assert!(result.samples_ms.iter().all(|&ms| ms > 0.0));
        assert!(result.stats.min <= result.stats.mean);
        assert!(result.stats.mean <= result.stats.max);
    }

    // The comparison keeps input order; paths that do not exist are listed
    // separately instead of dropping the report.
    let bogus = dir.path().join("missing.onnx");
    let comparison = compare(
        &[
            exported_path.clone(),
            simplified_path.clone(),
            bogus.clone(),
        ],
        &quick_bench(),
    );
    assert_eq!(comparison.entries.len(), 2);
    assert_eq!(comparison.entries[0].path, exported_path);
    assert_eq!(comparison.entries[1].path, simplified_path);
    assert!(comparison.entries.iter().all(|e| e.bench.is_ok()));
    assert_eq!(comparison.skipped, vec![bogus]);

    Ok(())
}

#[test]
fn test_full_run_produces_all_artifacts() -> Result<(), Box<dyn Error>> {
    let dir = TempDir::new("full-run");
    let config = quick_config(&dir);
    seed_labels(&config)?;
    let manifest_path = config.manifest_path();

    let mut prompt = ApproveAll;
    let mut orchestrator = Orchestrator::new(config, &mut prompt);
    let summary = orchestrator.run(StepSelect::All, false);

    assert_eq!(summary.state, RunState::Completed);
    for stage in [
        Stage::Export,
        Stage::ValidateExported,
        Stage::Simplify,
        Stage::ValidateSimplified,
        Stage::Benchmark,
        Stage::Compare,
        Stage::Manifest,
    ] {
        expect_ran(&summary, stage)?;
    }
    assert!(matches!(
        summary.outcome(Stage::Labels),
        Some(StageOutcome::Skipped(SkipReason::AlreadyPresent(_)))
    ));
    assert!(summary.success());
    assert_eq!(summary.exit_code(), 0);

    // Both variants were measured and compared.
    assert_eq!(summary.benchmarks.len(), 2);
    let comparison = summary
        .comparison
        .as_ref()
        .ok_or("no comparison recorded")?;
    assert_eq!(comparison.entries.len(), 2);
    assert!(comparison.skipped.is_empty());

    // Every output file exists and the summary agrees.
    assert_eq!(summary.files.len(), 4);
    assert!(summary.files.iter().all(|f| f.size.is_some()));

    // The manifest is valid JSON in the shape the browser runtime loads.
    let manifest: serde_json::Value = serde_json::from_slice(&fs::read(&manifest_path)?)?;
    let models = manifest["models"]
        .as_array()
        .ok_or("manifest has no models array")?;
    assert_eq!(models.len(), 2);
    assert!(models[0]["inputSize"].is_number());
    assert!(models.iter().all(|m| m["labelsPath"].is_string()));
    assert_eq!(manifest["version"], "1.0.0");
    assert!(manifest["lastUpdated"].is_string());

    Ok(())
}

#[test]
fn test_rerun_with_declined_overwrites_is_clean() -> Result<(), Box<dyn Error>> {
    let dir = TempDir::new("rerun");
    let config = quick_config(&dir);
    seed_labels(&config)?;

    let mut approve = ApproveAll;
    let summary = Orchestrator::new(config.clone(), &mut approve).run(StepSelect::All, false);
    assert_eq!(summary.exit_code(), 0);
    let first_bytes = fs::read(config.model_path())?;

    // A second run that declines every overwrite leaves the artifacts alone
    // and still succeeds: re-validation sees the existing files.
    let mut decline = DeclineAll;
    let summary = Orchestrator::new(config.clone(), &mut decline).run(StepSelect::All, true);
    assert!(matches!(
        summary.outcome(Stage::Export),
        Some(StageOutcome::Skipped(SkipReason::Declined(_)))
    ));
    expect_ran(&summary, Stage::ValidateExported)?;
    assert!(matches!(
        summary.outcome(Stage::Simplify),
        Some(StageOutcome::Skipped(SkipReason::Declined(_)))
    ));
    expect_ran(&summary, Stage::ValidateSimplified)?;
    assert!(matches!(
        summary.outcome(Stage::Benchmark),
        Some(StageOutcome::Skipped(SkipReason::Disabled))
    ));
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(fs::read(config.model_path())?, first_bytes);

    Ok(())
}

#[test]
fn test_symbolic_batch_round_trip() -> Result<(), Box<dyn Error>> {
    let dir = TempDir::new("symbolic");
    let mut config = quick_config(&dir);
    config.input_spec = config.input_spec.with_symbolic_batch();
    seed_labels(&config)?;
    let model_path = config.model_path();
    let simplified_path = config.simplified_path();

    let mut prompt = ApproveAll;
    let summary = Orchestrator::new(config, &mut prompt).run(StepSelect::All, false);
    expect_ran(&summary, Stage::Export)?;
    expect_ran(&summary, Stage::ValidateExported)?;
    expect_ran(&summary, Stage::Simplify)?;
    expect_ran(&summary, Stage::ValidateSimplified)?;
    // Symbolic artifacts load and measure like fixed-batch ones.
    expect_ran(&summary, Stage::Benchmark)?;
    expect_ran(&summary, Stage::Compare)?;
    assert_eq!(summary.exit_code(), 0);

    // Both artifacts declare the symbolic batch dimension.
    for path in [&model_path, &simplified_path] {
        let report = validate(path)?;
        assert_eq!(report.input_shape[0], None);
        assert_eq!(&report.input_shape[1..], &[Some(3), Some(32), Some(32)]);
    }

    Ok(())
}
