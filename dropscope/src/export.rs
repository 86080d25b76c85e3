//! Bounded per-droplet measurement log and tabular export

use crate::error::{DropletError, Result};
use crate::types::DropletMetrics;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    /// Comma-separated
    Csv,
    /// Tab-separated
    Tsv,
}

impl ExportFormat {
    pub fn delimiter(&self) -> u8 {
        match self {
            ExportFormat::Csv => b',',
            ExportFormat::Tsv => b'\t',
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Tsv => "tsv",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = DropletError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "tsv" | "txt" => Ok(ExportFormat::Tsv),
            other => Err(DropletError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// One exported line. Lengths in the display unit, area in unit², centroid in px.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRow {
    pub timestamp: u64,
    pub frame_id: u64,
    pub equivalent_diameter: f64,
    pub area: f64,
    pub major_axis: f64,
    pub minor_axis: f64,
    pub centroid_x: f64,
    pub centroid_y: f64,
    pub aspect_ratio: f64,
    pub unit: String,
    pub radius_offset_applied: f64,
    pub calibration_factor: f64,
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

impl From<&DropletMetrics> for ExportRow {
    fn from(m: &DropletMetrics) -> Self {
        let k = m.um_per_px;
        Self {
            timestamp: m.timestamp_ms,
            frame_id: m.frame_id,
            equivalent_diameter: round2(m.equivalent_diameter * k),
            area: round2(m.area * k * k),
            major_axis: round2(m.major_axis * k),
            minor_axis: round2(m.minor_axis * k),
            centroid_x: round2(m.centroid.0),
            centroid_y: round2(m.centroid.1),
            aspect_ratio: round2(m.aspect_ratio),
            unit: m.unit.clone(),
            radius_offset_applied: m.radius_offset_px,
            calibration_factor: k,
        }
    }
}

/// Oldest-first bounded record of every measured droplet
#[derive(Debug, Clone)]
pub struct MeasurementLog {
    entries: VecDeque<DropletMetrics>,
    capacity: usize,
}

impl MeasurementLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn extend<I: IntoIterator<Item = DropletMetrics>>(&mut self, metrics: I) {
        for m in metrics {
            if self.entries.len() >= self.capacity {
                self.entries.pop_front();
            }
            self.entries.push_back(m);
        }
    }

    /// Shrinking drops the oldest entries
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &DropletMetrics> {
        self.entries.iter()
    }

    /// Render the log as delimited text with a header row
    pub fn export(&self, format: ExportFormat) -> Result<Vec<u8>> {
        if self.entries.is_empty() {
            return Err(DropletError::NoMeasurements);
        }

        let mut writer = csv::WriterBuilder::new()
            .delimiter(format.delimiter())
            .from_writer(Vec::new());
        for m in &self.entries {
            writer.serialize(ExportRow::from(m))?;
        }
        writer
            .into_inner()
            .map_err(|e| DropletError::internal(format!("flushing export buffer: {}", e)))
    }
}
