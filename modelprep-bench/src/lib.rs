use std::fmt;
use std::time::Duration;

/// Summary statistics over a sequence of latency samples. All fields are
/// durations in milliseconds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LatencyStats {
    /// Mean duration.
    pub mean: f32,

    /// Population standard deviation of durations.
    pub std_dev: f32,

    /// Duration of the fastest run.
    pub min: f32,

    /// Duration of the slowest run.
    pub max: f32,
}

impl LatencyStats {
    /// Aggregate `samples` (milliseconds, in run order). Returns `None` when
    /// the sample sequence is empty.
    pub fn from_samples(samples: &[f32]) -> Option<LatencyStats> {
        if samples.is_empty() {
            return None;
        }

        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        for &s in samples {
            if s.total_cmp(&min).is_lt() {
                min = s;
            }
            if s.total_cmp(&max).is_gt() {
                max = s;
            }
        }

        let n = samples.len() as f32;
        let mean = samples.iter().sum::<f32>() / n;
        let var = samples.iter().map(|s| (s - mean) * (s - mean)).sum::<f32>() / n;

        Some(LatencyStats {
            mean,
            std_dev: var.sqrt(),
            min,
            max,
        })
    }
}

impl fmt::Display for LatencyStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mean {:.2}ms std {:.2}ms min {:.2}ms max {:.2}ms",
            self.mean, self.std_dev, self.min, self.max
        )
    }
}

/// Convert a measured duration to a millisecond sample.
pub fn duration_ms(duration: Duration) -> f32 {
    (duration.as_secs_f64() * 1000.0) as f32
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{duration_ms, LatencyStats};

    #[test]
    fn stats_over_known_samples() {
        let samples = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let stats = LatencyStats::from_samples(&samples).unwrap();

        assert_eq!(stats.mean, 5.0);
        // Population standard deviation of this sequence is exactly 2.
        assert_eq!(stats.std_dev, 2.0);
        assert_eq!(stats.min, 2.0);
        assert_eq!(stats.max, 9.0);
    }

    #[test]
    fn stats_single_sample() {
        let stats = LatencyStats::from_samples(&[3.5]).unwrap();
        assert_eq!(stats.mean, 3.5);
        assert_eq!(stats.std_dev, 0.0);
        assert_eq!(stats.min, 3.5);
        assert_eq!(stats.max, 3.5);
    }

    #[test]
    fn stats_empty_is_none() {
        assert!(LatencyStats::from_samples(&[]).is_none());
    }

    #[test]
    fn stats_ordering_invariant() {
        let samples = [1.25, 8.5, 0.75, 3.0, 2.125];
        let stats = LatencyStats::from_samples(&samples).unwrap();
        assert!(stats.min <= stats.mean);
        assert!(stats.mean <= stats.max);
    }

    #[test]
    fn duration_to_ms() {
        assert_eq!(duration_ms(Duration::from_millis(250)), 250.0);
        assert_eq!(duration_ms(Duration::from_micros(1500)), 1.5);
    }
}
