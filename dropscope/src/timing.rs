//! Per-stage timing instrumentation

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Maximum samples kept per stage
pub const DEFAULT_MAX_SAMPLES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Preprocessing,
    Segmentation,
    ArtifactRejection,
    Measurement,
    HistogramUpdate,
    TotalPerFrame,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Preprocessing,
        Stage::Segmentation,
        Stage::ArtifactRejection,
        Stage::Measurement,
        Stage::HistogramUpdate,
        Stage::TotalPerFrame,
    ];
}

/// Timing statistics of one stage, in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingStats {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub p95: f64,
    pub p99: f64,
    pub count: usize,
}

impl TimingStats {
    fn from_samples(samples: &VecDeque<f64>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let variance = samples.iter().map(|s| (s - mean) * (s - mean)).sum::<f64>() / n;

        let mut sorted: Vec<f64> = samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        Self {
            mean,
            std: variance.sqrt(),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            p95: percentile(&sorted, 95.0),
            p99: percentile(&sorted, 99.0),
            count: sorted.len(),
        }
    }
}

/// Linear interpolation between closest ranks; `sorted` must be non-empty
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Bounded per-stage samples, shared between the worker and reporting threads
#[derive(Debug)]
pub struct TimingInstrumentation {
    max_samples: usize,
    samples: Mutex<BTreeMap<Stage, VecDeque<f64>>>,
}

impl Default for TimingInstrumentation {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SAMPLES)
    }
}

impl TimingInstrumentation {
    pub fn new(max_samples: usize) -> Self {
        Self {
            max_samples: max_samples.max(1),
            samples: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn record(&self, stage: Stage, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        let stage_samples = samples.entry(stage).or_default();
        if stage_samples.len() >= self.max_samples {
            stage_samples.pop_front();
        }
        stage_samples.push_back(ms);
    }

    /// Run `f` and record how long it took
    pub fn time<R, F: FnOnce() -> R>(&self, stage: Stage, f: F) -> R {
        let start = Instant::now();
        let result = f();
        self.record(stage, start.elapsed());
        result
    }

    /// Statistics for every stage; stages without samples report zeros
    pub fn statistics(&self) -> BTreeMap<Stage, TimingStats> {
        let samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        Stage::ALL
            .iter()
            .map(|&stage| {
                let stats = samples
                    .get(&stage)
                    .map(TimingStats::from_samples)
                    .unwrap_or_default();
                (stage, stats)
            })
            .collect()
    }

    pub fn reset(&self) {
        self.samples
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_statistics_and_percentiles() {
        let timing = TimingInstrumentation::new(1000);
        for ms in 1..=100 {
            timing.record(Stage::Segmentation, Duration::from_millis(ms));
        }
        let stats = timing.statistics()[&Stage::Segmentation];
        assert_eq!(stats.count, 100);
        assert_abs_diff_eq!(stats.mean, 50.5, epsilon = 1e-9);
        assert_abs_diff_eq!(stats.min, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(stats.max, 100.0, epsilon = 1e-9);
        assert_abs_diff_eq!(stats.p95, 95.05, epsilon = 1e-9);
        assert_abs_diff_eq!(stats.p99, 99.01, epsilon = 1e-9);
    }

    #[test]
    fn test_samples_bounded() {
        let timing = TimingInstrumentation::new(10);
        for ms in 0..25 {
            timing.record(Stage::Measurement, Duration::from_millis(ms));
        }
        let stats = timing.statistics()[&Stage::Measurement];
        assert_eq!(stats.count, 10);
        assert_abs_diff_eq!(stats.min, 15.0, epsilon = 1e-9);
    }

    #[test]
    fn test_empty_stages_report_zero() {
        let timing = TimingInstrumentation::default();
        let stats = timing.statistics();
        assert_eq!(stats.len(), Stage::ALL.len());
        assert_eq!(stats[&Stage::TotalPerFrame].count, 0);
    }

    #[test]
    fn test_time_closure_and_reset() {
        let timing = TimingInstrumentation::default();
        let value = timing.time(Stage::Preprocessing, || 7);
        assert_eq!(value, 7);
        assert_eq!(timing.statistics()[&Stage::Preprocessing].count, 1);
        timing.reset();
        assert_eq!(timing.statistics()[&Stage::Preprocessing].count, 0);
    }
}
