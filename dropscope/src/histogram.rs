//! Sliding-window histogram and running statistics of droplet measurements

use crate::types::DropletMetrics;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Measured quantity a statistic or histogram refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    EquivalentDiameter,
    MajorAxis,
    MinorAxis,
    Area,
}

impl Dimension {
    pub const ALL: [Dimension; 4] = [
        Dimension::EquivalentDiameter,
        Dimension::MajorAxis,
        Dimension::MinorAxis,
        Dimension::Area,
    ];

    /// Stored value in pixel units (px or px²)
    pub fn value(&self, m: &DropletMetrics) -> f64 {
        match self {
            Dimension::EquivalentDiameter => m.equivalent_diameter,
            Dimension::MajorAxis => m.major_axis,
            Dimension::MinorAxis => m.minor_axis,
            Dimension::Area => m.area,
        }
    }

    /// Factor from pixel units to display units
    pub fn scale(&self, um_per_px: f64) -> f64 {
        match self {
            Dimension::Area => um_per_px * um_per_px,
            _ => um_per_px,
        }
    }

    /// Display unit, e.g. `um` for lengths and `um2` for area
    pub fn unit(&self, um_per_px: f64) -> String {
        let base = if um_per_px != 1.0 { "um" } else { "px" };
        match self {
            Dimension::Area => format!("{}2", base),
            _ => base.to_string(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Dimension::EquivalentDiameter => "equivalent_diameter",
            Dimension::MajorAxis => "major_axis",
            Dimension::MinorAxis => "minor_axis",
            Dimension::Area => "area",
        }
    }
}

/// Summary statistics in integer display units
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub mean: i64,
    pub std: i64,
    pub min: i64,
    pub max: i64,
    pub mode: i64,
    pub count: usize,
    pub unit: String,
}

/// Statistics of every dimension at one instant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsReport {
    pub count: usize,
    pub equivalent_diameter: Statistics,
    pub major_axis: Statistics,
    pub minor_axis: Statistics,
    pub area: Statistics,
}

/// Binned counts; `bins` holds `counts.len() + 1` edges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    pub dimension: Dimension,
    pub bins: Vec<f64>,
    pub counts: Vec<u64>,
    pub unit: String,
}

/// Fixed-capacity FIFO of droplet metrics
#[derive(Debug, Clone)]
pub struct DropletHistogram {
    window: VecDeque<DropletMetrics>,
    capacity: usize,
    bins: usize,
    um_per_px: f64,
}

impl DropletHistogram {
    pub fn new(capacity: usize, bins: usize, um_per_px: f64) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            bins: bins.max(1),
            um_per_px,
        }
    }

    /// Append one measurement, evicting the oldest once full
    pub fn add(&mut self, metrics: DropletMetrics) {
        while self.window.len() >= self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(metrics);
    }

    pub fn extend<I: IntoIterator<Item = DropletMetrics>>(&mut self, metrics: I) {
        for m in metrics {
            self.add(m);
        }
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn bins(&self) -> usize {
        self.bins
    }

    pub fn um_per_px(&self) -> f64 {
        self.um_per_px
    }

    pub fn iter(&self) -> impl Iterator<Item = &DropletMetrics> {
        self.window.iter()
    }

    /// Change the display calibration; stored history is kept
    pub fn set_calibration(&mut self, um_per_px: f64) {
        self.um_per_px = um_per_px;
    }

    /// Change window capacity and/or bin count. Clears all history.
    pub fn resize(&mut self, capacity: usize, bins: usize) {
        let dropped = self.window.len();
        *self = Self::new(capacity, bins, self.um_per_px);
        log::info!(
            "Histogram resized to {} entries, {} bins ({} measurements cleared)",
            self.capacity,
            self.bins,
            dropped
        );
    }

    pub fn clear(&mut self) {
        self.window.clear();
    }

    fn display_values(&self, dim: Dimension) -> Vec<f64> {
        let scale = dim.scale(self.um_per_px);
        self.window.iter().map(|m| dim.value(m) * scale).collect()
    }

    /// Mean, population std, min, max and binned mode in display units
    pub fn statistics(&self, dim: Dimension) -> Statistics {
        let unit = dim.unit(self.um_per_px);
        let values = self.display_values(dim);
        if values.is_empty() {
            return Statistics {
                unit,
                ..Statistics::default()
            };
        }

        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
        let (min, max) = min_max(&values);

        Statistics {
            mean: mean.round() as i64,
            std: variance.sqrt().round() as i64,
            min: min.round() as i64,
            max: max.round() as i64,
            mode: binned_mode(&values, self.bins).round() as i64,
            count: values.len(),
            unit,
        }
    }

    pub fn report(&self) -> StatisticsReport {
        StatisticsReport {
            count: self.len(),
            equivalent_diameter: self.statistics(Dimension::EquivalentDiameter),
            major_axis: self.statistics(Dimension::MajorAxis),
            minor_axis: self.statistics(Dimension::MinorAxis),
            area: self.statistics(Dimension::Area),
        }
    }

    /// Equal-width histogram over [min, max] of the display values.
    /// An empty window yields edges over [0, 100] and zero counts.
    pub fn snapshot(&self, dim: Dimension) -> HistogramSnapshot {
        let values = self.display_values(dim);
        let (lo, hi) = if values.is_empty() {
            (0.0, 100.0)
        } else {
            let (min, max) = min_max(&values);
            if max > min {
                (min, max)
            } else {
                (min - 0.5, max + 0.5)
            }
        };

        let width = (hi - lo) / self.bins as f64;
        let bins: Vec<f64> = (0..=self.bins).map(|i| lo + width * i as f64).collect();
        let mut counts = vec![0u64; self.bins];
        for &v in &values {
            counts[bin_index(v, lo, width, self.bins)] += 1;
        }

        HistogramSnapshot {
            dimension: dim,
            bins,
            counts,
            unit: dim.unit(self.um_per_px),
        }
    }

    pub fn snapshots(&self) -> Vec<HistogramSnapshot> {
        Dimension::ALL.iter().map(|&d| self.snapshot(d)).collect()
    }

    /// (rounded display value, count) pairs for every value present, ascending
    pub fn bars(&self, dim: Dimension) -> Vec<(i64, u64)> {
        let mut rounded: Vec<i64> = self
            .display_values(dim)
            .into_iter()
            .map(|v| v.round() as i64)
            .collect();
        rounded.sort_unstable();

        let mut bars: Vec<(i64, u64)> = Vec::new();
        for v in rounded {
            match bars.last_mut() {
                Some((value, count)) if *value == v => *count += 1,
                _ => bars.push((v, 1)),
            }
        }
        bars
    }
}

fn min_max(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
}

/// Last bin is closed so the maximum lands in it
fn bin_index(v: f64, lo: f64, width: f64, bins: usize) -> usize {
    if width <= 0.0 {
        return 0;
    }
    let idx = ((v - lo) / width).floor();
    if idx < 0.0 {
        0
    } else {
        (idx as usize).min(bins - 1)
    }
}

/// Centre of the fullest of `bins` equal-width bins over [min, max];
/// the lowest bin wins ties
fn binned_mode(values: &[f64], bins: usize) -> f64 {
    let (min, max) = min_max(values);
    if max <= min {
        return min;
    }
    let width = (max - min) / bins as f64;
    let mut counts = vec![0u64; bins];
    for &v in values {
        counts[bin_index(v, min, width, bins)] += 1;
    }

    let mut best = 0;
    for (i, &c) in counts.iter().enumerate() {
        if c > counts[best] {
            best = i;
        }
    }
    min + width * (best as f64 + 0.5)
}
