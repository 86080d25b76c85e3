//! Pipeline configuration, partial updates and validation
//!
//! Configuration documents arrive either flat (`{"min_area": 20, ...}`) or
//! nested under a `droplet_detection` key. Both shapes are normalised into a
//! [`ConfigUpdate`] at the boundary, merged onto the active configuration and
//! validated as a whole. Stages only ever see a validated [`PipelineConfig`].

use crate::error::{DropletError, Result};
use crate::types::CalibrationProfile;
use droptrack::RejectorParams;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdMethod {
    /// Histogram-based level chosen per frame
    Otsu,
    /// Constant level from `threshold_level`
    Fixed,
    /// Local mean over `adaptive_block_size` minus `adaptive_c`
    Adaptive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MorphOperation {
    Open,
    Close,
    /// Open followed by close
    Both,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundMethod {
    /// Absolute difference against the median of the warm-up frames
    Static,
    /// Intensity minus its Gaussian-blurred version, no warm-up
    Highpass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionMethod {
    /// Match blobs to tracked entities and drop the ones that stay put
    Tracking,
    /// Keep blobs whose centroid changed against the previous frame
    FrameDiff,
}

/// Validated tuning parameters of the whole pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    // Preprocessing
    pub background_method: BackgroundMethod,
    pub background_warmup_frames: u32,
    pub highpass_blur_radius: u32,
    pub threshold_method: ThresholdMethod,
    pub threshold_level: u8,
    pub adaptive_block_size: u32,
    pub adaptive_c: i32,
    pub morph_operation: MorphOperation,
    pub morph_kernel_size: u32,

    // Segmentation
    pub min_area: f64,
    pub max_area: f64,
    pub min_aspect_ratio: f64,
    pub max_aspect_ratio: f64,
    pub min_contour_points: usize,
    /// Vertical extent (y_min, y_max) of the channel inside the ROI
    pub channel_band: Option<(f64, f64)>,
    pub channel_band_margin: f64,

    // Artifact rejection
    pub rejection_method: RejectionMethod,
    pub frame_diff_threshold: u8,
    pub min_motion_px: f64,
    pub static_rejection_frames: u32,
    pub max_match_distance_px: f64,
    pub max_missed_frames: u32,

    // Statistics and export
    pub histogram_window_size: usize,
    pub histogram_bins: usize,
    pub export_log_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            background_method: BackgroundMethod::Static,
            background_warmup_frames: 30, // ~1 s at 30 fps
            highpass_blur_radius: 5,      // 11x11 Gaussian, sigma 2
            threshold_method: ThresholdMethod::Otsu,
            threshold_level: 30, // used only with ThresholdMethod::Fixed
            adaptive_block_size: 11,
            adaptive_c: 2,
            morph_operation: MorphOperation::Open,
            morph_kernel_size: 3,

            min_area: 20.0,
            max_area: 5000.0,
            min_aspect_ratio: 1.0, // circles measure ~1.0
            max_aspect_ratio: 3.0,
            min_contour_points: 5,
            channel_band: None,
            channel_band_margin: 10.0,

            rejection_method: RejectionMethod::Tracking,
            frame_diff_threshold: 30,
            min_motion_px: 0.5,
            static_rejection_frames: 3,
            max_match_distance_px: 20.0,
            max_missed_frames: 5,

            histogram_window_size: 2000,
            histogram_bins: 40,
            export_log_capacity: 10_000,
        }
    }
}

impl PipelineConfig {
    /// Check every constraint and report all violations at once
    pub fn validate(&self) -> std::result::Result<(), ConfigViolations> {
        let mut v = ConfigViolations::default();

        if self.background_warmup_frames < 1 {
            v.push("background_warmup_frames", "must be >= 1");
        }
        if self.highpass_blur_radius < 1 {
            v.push("highpass_blur_radius", "must be >= 1");
        }
        if self.adaptive_block_size < 3 || self.adaptive_block_size % 2 == 0 {
            v.push(
                "adaptive_block_size",
                format!("must be odd and >= 3, got {}", self.adaptive_block_size),
            );
        }
        if self.morph_kernel_size < 1 || self.morph_kernel_size % 2 == 0 {
            v.push(
                "morph_kernel_size",
                format!("must be odd and >= 1, got {}", self.morph_kernel_size),
            );
        }

        if !self.min_area.is_finite() || self.min_area < 0.0 {
            v.push("min_area", format!("must be finite and >= 0, got {}", self.min_area));
        }
        if !self.max_area.is_finite() || self.max_area <= 0.0 {
            v.push("max_area", format!("must be finite and > 0, got {}", self.max_area));
        }
        if self.min_area > self.max_area {
            v.push(
                "min_area",
                format!(
                    "min_area ({}) must be <= max_area ({})",
                    self.min_area, self.max_area
                ),
            );
        }
        if !self.min_aspect_ratio.is_finite() || self.min_aspect_ratio <= 0.0 {
            v.push(
                "min_aspect_ratio",
                format!("must be finite and > 0, got {}", self.min_aspect_ratio),
            );
        }
        if !self.max_aspect_ratio.is_finite() || self.max_aspect_ratio < 1.0 {
            v.push(
                "max_aspect_ratio",
                format!("must be finite and >= 1, got {}", self.max_aspect_ratio),
            );
        }
        if self.min_aspect_ratio > self.max_aspect_ratio {
            v.push(
                "min_aspect_ratio",
                format!(
                    "min_aspect_ratio ({}) must be <= max_aspect_ratio ({})",
                    self.min_aspect_ratio, self.max_aspect_ratio
                ),
            );
        }
        if self.min_contour_points < 5 {
            v.push(
                "min_contour_points",
                format!("must be >= 5, got {}", self.min_contour_points),
            );
        }
        if let Some((lo, hi)) = self.channel_band {
            if !lo.is_finite() || !hi.is_finite() || lo > hi {
                v.push(
                    "channel_band",
                    format!("must be finite with y_min <= y_max, got ({}, {})", lo, hi),
                );
            }
        }
        if !self.channel_band_margin.is_finite() || self.channel_band_margin < 0.0 {
            v.push("channel_band_margin", "must be finite and >= 0");
        }

        if !self.min_motion_px.is_finite() || self.min_motion_px < 0.0 {
            v.push(
                "min_motion_px",
                format!("must be finite and >= 0, got {}", self.min_motion_px),
            );
        }
        if self.static_rejection_frames < 1 {
            v.push("static_rejection_frames", "must be >= 1");
        }
        if !self.max_match_distance_px.is_finite() || self.max_match_distance_px <= 0.0 {
            v.push(
                "max_match_distance_px",
                format!("must be finite and > 0, got {}", self.max_match_distance_px),
            );
        }
        if self.max_missed_frames < 1 {
            v.push("max_missed_frames", "must be >= 1");
        }

        if self.histogram_window_size < 1 {
            v.push("histogram_window_size", "must be >= 1");
        }
        if self.histogram_bins < 1 {
            v.push("histogram_bins", "must be >= 1");
        }
        if self.export_log_capacity < 1 {
            v.push("export_log_capacity", "must be >= 1");
        }

        v.into_result()
    }

    /// Parameters for the temporal artifact rejector
    pub fn rejector_params(&self) -> RejectorParams {
        RejectorParams {
            min_motion_px: self.min_motion_px,
            static_rejection_frames: self.static_rejection_frames,
            max_match_distance_px: self.max_match_distance_px,
            max_missed_frames: self.max_missed_frames,
        }
    }

    /// Load a flat or nested JSON document on top of the defaults
    pub fn from_json(json: &str) -> Result<(Self, CalibrationProfile)> {
        let update = ConfigUpdate::from_json(json)?;
        update.apply(&Self::default(), &CalibrationProfile::default())
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<(Self, CalibrationProfile)> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Render as a nested document that `from_json` accepts back
    pub fn to_json(&self, calibration: &CalibrationProfile) -> Result<String> {
        let mut flat = serde_json::to_value(self)?;
        if let serde_json::Value::Object(map) = &mut flat {
            map.insert("um_per_px".into(), calibration.um_per_px.into());
            map.insert(
                "radius_offset_px".into(),
                calibration.radius_offset_px.into(),
            );
        }
        let doc = serde_json::json!({ "droplet_detection": flat });
        Ok(serde_json::to_string_pretty(&doc)?)
    }
}

/// One violated constraint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigViolation {
    pub field: String,
    pub message: String,
}

/// Every constraint violated by a candidate configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigViolations(pub Vec<ConfigViolation>);

impl ConfigViolations {
    pub fn push<F: Into<String>, M: Into<String>>(&mut self, field: F, message: M) {
        self.0.push(ConfigViolation {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigViolation> {
        self.0.iter()
    }

    pub fn contains_field(&self, field: &str) -> bool {
        self.0.iter().any(|v| v.field == field)
    }

    fn into_result(self) -> std::result::Result<(), ConfigViolations> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ConfigViolations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}: {}", v.field, v.message)?;
        }
        Ok(())
    }
}

/// Partial configuration; `None` keeps the active value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigUpdate {
    pub background_method: Option<BackgroundMethod>,
    pub background_warmup_frames: Option<u32>,
    pub highpass_blur_radius: Option<u32>,
    pub threshold_method: Option<ThresholdMethod>,
    pub threshold_level: Option<u8>,
    pub adaptive_block_size: Option<u32>,
    #[serde(alias = "adaptive_C")]
    pub adaptive_c: Option<i32>,
    pub morph_operation: Option<MorphOperation>,
    pub morph_kernel_size: Option<u32>,

    pub min_area: Option<f64>,
    pub max_area: Option<f64>,
    pub min_aspect_ratio: Option<f64>,
    pub max_aspect_ratio: Option<f64>,
    pub min_contour_points: Option<usize>,
    pub channel_band: Option<(f64, f64)>,
    pub channel_band_margin: Option<f64>,

    pub rejection_method: Option<RejectionMethod>,
    pub frame_diff_threshold: Option<u8>,
    pub min_motion_px: Option<f64>,
    pub static_rejection_frames: Option<u32>,
    pub max_match_distance_px: Option<f64>,
    pub max_missed_frames: Option<u32>,

    pub histogram_window_size: Option<usize>,
    pub histogram_bins: Option<usize>,
    pub export_log_capacity: Option<usize>,

    #[serde(alias = "pixel_ratio")]
    pub um_per_px: Option<f64>,
    pub radius_offset_px: Option<f64>,
}

/// Top-level keys a nested document may carry besides the settings section
const NESTED_KEYS: [&str; 2] = ["droplet_detection", "modules"];

/// Pull the settings object out of a flat or nested document. A present
/// `droplet_detection` section is authoritative: it must be an object and
/// its parse errors are reported, never retried as a flat document.
fn settings_section(value: serde_json::Value) -> Result<serde_json::Value> {
    let mut map = match value {
        serde_json::Value::Object(map) => map,
        other => {
            return Err(DropletError::config(format!(
                "configuration must be a JSON object, got {}",
                json_kind(&other)
            )))
        }
    };

    let section = match map.remove("droplet_detection") {
        Some(section) => section,
        None => return Ok(serde_json::Value::Object(map)),
    };
    if !section.is_object() {
        return Err(DropletError::config(format!(
            "'droplet_detection' must be an object, got {}",
            json_kind(&section)
        )));
    }
    if let Some(key) = map.keys().find(|k| !NESTED_KEYS.contains(&k.as_str())) {
        return Err(DropletError::config(format!(
            "unknown top-level key '{}' next to 'droplet_detection'",
            key
        )));
    }
    Ok(section)
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

impl ConfigUpdate {
    /// Parse a flat or nested JSON document. Unknown keys and mistyped
    /// values are errors.
    pub fn from_json(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let section = settings_section(value)?;
        Ok(serde_json::from_value(section)?)
    }

    pub fn is_empty(&self) -> bool {
        *self == ConfigUpdate::default()
    }

    /// Merge onto the active configuration and validate the result as a whole.
    /// On any violation nothing is returned and the caller keeps its current state.
    pub fn apply(
        &self,
        config: &PipelineConfig,
        calibration: &CalibrationProfile,
    ) -> Result<(PipelineConfig, CalibrationProfile)> {
        let mut c = config.clone();

        macro_rules! merge {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = self.$field { c.$field = value; })*
            };
        }
        merge!(
            background_method,
            background_warmup_frames,
            highpass_blur_radius,
            threshold_method,
            threshold_level,
            adaptive_block_size,
            adaptive_c,
            morph_operation,
            morph_kernel_size,
            min_area,
            max_area,
            min_aspect_ratio,
            max_aspect_ratio,
            min_contour_points,
            channel_band_margin,
            rejection_method,
            frame_diff_threshold,
            min_motion_px,
            static_rejection_frames,
            max_match_distance_px,
            max_missed_frames,
            histogram_window_size,
            histogram_bins,
            export_log_capacity,
        );
        if let Some(band) = self.channel_band {
            c.channel_band = Some(band);
        }

        let cal = CalibrationProfile {
            um_per_px: self.um_per_px.unwrap_or(calibration.um_per_px),
            radius_offset_px: self.radius_offset_px.unwrap_or(calibration.radius_offset_px),
        };

        let mut violations = match c.validate() {
            Ok(()) => ConfigViolations::default(),
            Err(v) => v,
        };
        if !cal.um_per_px.is_finite() || cal.um_per_px <= 0.0 {
            violations.push(
                "um_per_px",
                format!("must be finite and > 0, got {}", cal.um_per_px),
            );
        }
        if !cal.radius_offset_px.is_finite() {
            violations.push("radius_offset_px", "must be finite");
        }

        violations.into_result().map_err(DropletError::InvalidConfig)?;
        Ok((c, cal))
    }
}
