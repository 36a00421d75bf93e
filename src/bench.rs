//! Latency benchmarking of serialized artifacts.
//!
//! Each [`benchmark`] call loads the artifact into a fresh [`Session`], so
//! every measurement includes the same cold-start work and nothing carries
//! over between artifacts. One random input is generated per call and reused
//! for the warmup and every measured run.

use std::error::Error;
use std::fmt;
use std::path::Path;
use std::time::Instant;

use modelprep_bench::{duration_ms, LatencyStats};

use crate::runtime::{Session, SessionError};

/// Run counts for a benchmark pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BenchConfig {
    /// Untimed runs executed first to settle caches and lazy initialization.
    pub warmup_runs: u32,

    /// Timed runs that contribute latency samples. Must be at least 1.
    pub measured_runs: u32,
}

impl Default for BenchConfig {
    fn default() -> BenchConfig {
        BenchConfig {
            warmup_runs: 5,
            measured_runs: 10,
        }
    }
}

/// Samples and summary statistics from one benchmark pass.
#[derive(Clone, Debug)]
pub struct BenchmarkResult {
    /// Wall-clock latency of each measured run, in order, in milliseconds.
    pub samples_ms: Vec<f32>,

    /// Summary statistics over `samples_ms`.
    pub stats: LatencyStats,
}

/// Errors from [`benchmark`].
#[derive(Debug)]
pub enum BenchError {
    /// The run counts are unusable (zero measured runs).
    InvalidConfig(String),

    /// The artifact failed to load into a session.
    LoadFailed(SessionError),

    /// A run failed after the session had loaded.
    Run(SessionError),
}

impl fmt::Display for BenchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BenchError::InvalidConfig(reason) => write!(f, "invalid benchmark config: {}", reason),
            BenchError::LoadFailed(err) => write!(f, "model failed to load: {}", err),
            BenchError::Run(err) => write!(f, "benchmark run failed: {}", err),
        }
    }
}

impl Error for BenchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BenchError::InvalidConfig(_) => None,
            BenchError::LoadFailed(err) | BenchError::Run(err) => Some(err),
        }
    }
}

/// Measure inference latency of the artifact at `path`.
///
/// The config is checked before any file access, so a zero `measured_runs`
/// is rejected even for paths that do not exist.
pub fn benchmark(path: &Path, config: &BenchConfig) -> Result<BenchmarkResult, BenchError> {
    if config.measured_runs < 1 {
        return Err(BenchError::InvalidConfig(
            "measured_runs must be at least 1".to_string(),
        ));
    }

    let session = Session::load(path).map_err(BenchError::LoadFailed)?;

    let mut rng = fastrand::Rng::new();
    let input: Vec<f32> = (0..session.input_len()).map(|_| rng.f32()).collect();

    for _ in 0..config.warmup_runs {
        session.run(&input).map_err(BenchError::Run)?;
    }

    let mut samples_ms = Vec::with_capacity(config.measured_runs as usize);
    for _ in 0..config.measured_runs {
        let start = Instant::now();
        session.run(&input).map_err(BenchError::Run)?;
        samples_ms.push(duration_ms(start.elapsed()));
    }

    let stats = match LatencyStats::from_samples(&samples_ms) {
        Some(stats) => stats,
        None => {
            return Err(BenchError::InvalidConfig(
                "no samples collected".to_string(),
            ))
        }
    };
    Ok(BenchmarkResult { samples_ms, stats })
}
