//! Side-by-side benchmarking of artifact variants.
//!
//! The comparator walks the given paths in order and benchmarks each one
//! that exists on disk. It reports measurements without picking a winner;
//! presentation is left to the caller.

use std::fs;
use std::path::PathBuf;

use crate::bench::{benchmark, BenchConfig, BenchError, BenchmarkResult};

/// One benchmarked artifact.
#[derive(Debug)]
pub struct ComparisonEntry {
    /// Path of the artifact on disk.
    pub path: PathBuf,

    /// File size in bytes.
    pub size: u64,

    /// The benchmark outcome. A failure here (a corrupt file, say) keeps its
    /// slot in the report rather than dropping the entry.
    pub bench: Result<BenchmarkResult, BenchError>,
}

/// Results for every path that exists, in input order, plus the paths that
/// were skipped because they could not be found.
#[derive(Debug, Default)]
pub struct ComparisonReport {
    pub entries: Vec<ComparisonEntry>,
    pub skipped: Vec<PathBuf>,
}

/// Benchmark each existing artifact in `paths` under the same run counts.
pub fn compare(paths: &[PathBuf], config: &BenchConfig) -> ComparisonReport {
    let mut report = ComparisonReport::default();
    for path in paths {
        let size = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(_) => {
                report.skipped.push(path.clone());
                continue;
            }
        };
        report.entries.push(ComparisonEntry {
            path: path.clone(),
            size,
            bench: benchmark(path, config),
        });
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InputSpec;
    use crate::export::{export, DEFAULT_OPSET};
    use crate::test_util::TempDir;
    use crate::zoo;

    fn quick_config() -> BenchConfig {
        BenchConfig {
            warmup_runs: 0,
            measured_runs: 1,
        }
    }

    #[test]
    fn missing_paths_are_skipped_not_reported() {
        let dir = TempDir::new("compare-mixed");
        let spec = InputSpec::nchw(1, 3, 32, 32);
        let mut network = zoo::smallnet(&spec);
        let real = dir.path().join("net.onnx");
        export(&mut network, &spec, &real, DEFAULT_OPSET).unwrap();
        let bogus = dir.path().join("absent.onnx");

        let report = compare(&[real.clone(), bogus.clone()], &quick_config());
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.entries[0].path, real);
        assert!(report.entries[0].size > 0);
        assert!(report.entries[0].bench.is_ok());
        assert_eq!(report.skipped, vec![bogus]);
    }

    #[test]
    fn entries_keep_input_order() {
        let dir = TempDir::new("compare-order");
        let spec = InputSpec::nchw(1, 3, 32, 32);
        let first = dir.path().join("a.onnx");
        let second = dir.path().join("b.onnx");
        export(&mut zoo::smallnet(&spec), &spec, &first, DEFAULT_OPSET).unwrap();
        export(&mut zoo::smallnet(&spec), &spec, &second, DEFAULT_OPSET).unwrap();

        let report = compare(&[second.clone(), first.clone()], &quick_config());
        let paths: Vec<_> = report.entries.iter().map(|e| e.path.clone()).collect();
        assert_eq!(paths, vec![second, first]);
        assert!(report.skipped.is_empty());
    }

    #[test]
    fn unloadable_file_keeps_its_slot() {
        let dir = TempDir::new("compare-corrupt");
        let corrupt = dir.path().join("corrupt.onnx");
        std::fs::write(&corrupt, b"not a model").unwrap();

        let report = compare(&[corrupt.clone()], &quick_config());
        assert_eq!(report.entries.len(), 1);
        assert!(matches!(
            report.entries[0].bench,
            Err(BenchError::LoadFailed(_))
        ));
        assert!(report.skipped.is_empty());
    }

    #[test]
    fn empty_input_gives_empty_report() {
        let report = compare(&[], &quick_config());
        assert!(report.entries.is_empty());
        assert!(report.skipped.is_empty());
    }
}
