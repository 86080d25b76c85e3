//! Type definitions for droplet analysis

use crate::error::{DropletError, Result};
use droptrack::Locate;
use serde::{Deserialize, Serialize};

/// Supported pixel formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Gray8,
    Rgb8,
    Bgr8,
    Rgba8,
    Bgra8,
}

impl PixelFormat {
    /// Get number of channels
    pub fn channels(&self) -> u32 {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => 3,
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => 4,
        }
    }
}

/// A captured frame handed over by the camera collaborator
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw pixel data, row-major, tightly packed
    pub data: Vec<u8>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    pub format: PixelFormat,
    /// Monotonically increasing capture counter
    pub frame_id: u64,
    /// Capture time in milliseconds since the Unix epoch
    pub timestamp_ms: u64,
}

impl Frame {
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
        frame_id: u64,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            data,
            width,
            height,
            format,
            frame_id,
            timestamp_ms,
        }
    }

    /// Single-channel frame, mostly for tests and synthetic sources
    pub fn gray(data: Vec<u8>, width: u32, height: u32, frame_id: u64) -> Self {
        Self::new(data, width, height, PixelFormat::Gray8, frame_id, 0)
    }

    pub fn channels(&self) -> u32 {
        self.format.channels()
    }

    pub fn shape(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Validate frame data consistency
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(DropletError::invalid_frame(format!(
                "frame {} has zero dimension {}x{}",
                self.frame_id, self.width, self.height
            )));
        }
        let expected = self.width as usize * self.height as usize * self.channels() as usize;
        if self.data.len() != expected {
            return Err(DropletError::invalid_frame(format!(
                "frame {} buffer holds {} bytes, expected {} for {}x{} {:?}",
                self.frame_id,
                self.data.len(),
                expected,
                self.width,
                self.height,
                self.format
            )));
        }
        Ok(())
    }

    /// Copy out the sub-rectangle `roi`. The region must lie inside the frame.
    pub fn crop(&self, roi: &Roi) -> Result<Frame> {
        self.validate()?;
        if !roi.fits_within(self.width, self.height) {
            return Err(DropletError::invalid_frame(format!(
                "ROI {:?} exceeds frame {}x{}",
                roi, self.width, self.height
            )));
        }

        let ch = self.channels() as usize;
        let stride = self.width as usize * ch;
        let row_len = roi.width as usize * ch;
        let mut data = Vec::with_capacity(row_len * roi.height as usize);
        for y in roi.y..roi.y + roi.height {
            let start = y as usize * stride + roi.x as usize * ch;
            data.extend_from_slice(&self.data[start..start + row_len]);
        }

        Ok(Frame {
            data,
            width: roi.width,
            height: roi.height,
            format: self.format,
            frame_id: self.frame_id,
            timestamp_ms: self.timestamp_ms,
        })
    }
}

/// Region of interest inside the full camera frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(DropletError::config(format!(
                "ROI width and height must be >= 1, got {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }

    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.x as u64 + self.width as u64 <= width as u64
            && self.y as u64 + self.height as u64 <= height as u64
    }

    pub fn shape(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Per-camera calibration record
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationProfile {
    /// Physical size of one pixel in micrometres
    #[serde(alias = "pixel_ratio")]
    pub um_per_px: f64,
    /// Signed correction applied to measured radii, in pixels
    pub radius_offset_px: f64,
}

impl Default for CalibrationProfile {
    fn default() -> Self {
        Self {
            um_per_px: 1.0,       // uncalibrated: report pixels
            radius_offset_px: 0.0,
        }
    }
}

impl CalibrationProfile {
    pub fn new(um_per_px: f64, radius_offset_px: f64) -> Self {
        Self {
            um_per_px,
            radius_offset_px,
        }
    }

    /// Display unit for lengths
    pub fn unit(&self) -> &'static str {
        if self.um_per_px != 1.0 {
            "um"
        } else {
            "px"
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.um_per_px.is_finite() || self.um_per_px <= 0.0 {
            return Err(DropletError::config(format!(
                "um_per_px must be finite and > 0, got {}",
                self.um_per_px
            )));
        }
        if !self.radius_offset_px.is_finite() {
            return Err(DropletError::config(format!(
                "radius_offset_px must be finite, got {}",
                self.radius_offset_px
            )));
        }
        Ok(())
    }
}

/// Axis-aligned bounding box in mask coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Which fit produced a blob's major/minor axes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AxisFit {
    Ellipse,
    BoundingBox,
}

/// A connected region of the motion mask with raw (uncorrected) geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateBlob {
    /// Outer border points as (x, y)
    pub contour: Vec<(i32, i32)>,
    pub centroid: (f64, f64),
    /// Pixel count
    pub area: f64,
    pub equivalent_diameter: f64,
    pub major_axis: f64,
    pub minor_axis: f64,
    /// major / minor, >= 1.0
    pub aspect_ratio: f64,
    pub bbox: BoundingBox,
    pub axis_fit: AxisFit,
}

impl Locate for CandidateBlob {
    fn centroid(&self) -> (f64, f64) {
        self.centroid
    }
}

/// Calibration-corrected measurement of one droplet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropletMetrics {
    pub frame_id: u64,
    pub timestamp_ms: u64,
    pub centroid: (f64, f64),
    /// Raw pixel area, never radius-corrected
    pub area: f64,
    /// Corrected lengths, in pixels
    pub equivalent_diameter: f64,
    pub major_axis: f64,
    pub minor_axis: f64,
    pub aspect_ratio: f64,
    pub radius_offset_px: f64,
    /// Calibration factor in effect when the droplet was measured
    pub um_per_px: f64,
    /// Display unit of the calibration in effect ("um" or "px")
    pub unit: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_validation() {
        assert!(Frame::gray(vec![0; 12], 4, 3, 0).validate().is_ok());
        assert!(Frame::gray(vec![0; 11], 4, 3, 0).validate().is_err());
        assert!(Frame::gray(vec![], 0, 3, 0).validate().is_err());

        let rgb = Frame::new(vec![0; 36], 4, 3, PixelFormat::Rgb8, 1, 0);
        assert!(rgb.validate().is_ok());
        let bgra = Frame::new(vec![0; 36], 4, 3, PixelFormat::Bgra8, 1, 0);
        assert!(matches!(bgra.validate(), Err(DropletError::InvalidFrame(_))));
    }

    #[test]
    fn test_crop() {
        let data: Vec<u8> = (0..16).collect();
        let frame = Frame::gray(data, 4, 4, 3);
        let cropped = frame.crop(&Roi::new(1, 1, 2, 2)).unwrap();
        assert_eq!(cropped.shape(), (2, 2));
        assert_eq!(cropped.data, vec![5, 6, 9, 10]);
        assert_eq!(cropped.frame_id, 3);

        assert!(frame.crop(&Roi::new(3, 3, 2, 2)).is_err());
    }

    #[test]
    fn test_crop_short_buffer_is_an_error() {
        let frame = Frame::gray(vec![0; 10], 100, 100, 0);
        assert!(matches!(
            frame.crop(&Roi::new(10, 10, 64, 48)),
            Err(DropletError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_crop_multichannel() {
        let data: Vec<u8> = (0..24).collect();
        let frame = Frame::new(data, 4, 2, PixelFormat::Rgb8, 0, 0);
        let cropped = frame.crop(&Roi::new(2, 1, 1, 1)).unwrap();
        assert_eq!(cropped.data, vec![18, 19, 20]);
    }

    #[test]
    fn test_calibration_unit_and_validation() {
        assert_eq!(CalibrationProfile::default().unit(), "px");
        assert_eq!(CalibrationProfile::new(2.5, 0.0).unit(), "um");
        assert!(CalibrationProfile::new(0.0, 0.0).validate().is_err());
        assert!(CalibrationProfile::new(f64::NAN, 0.0).validate().is_err());
        assert!(CalibrationProfile::new(1.0, f64::INFINITY).validate().is_err());
        assert!(CalibrationProfile::new(1.0, -2.0).validate().is_ok());
    }

    #[test]
    fn test_calibration_accepts_legacy_key() {
        let cal: CalibrationProfile =
            serde_json::from_str(r#"{"pixel_ratio": 0.8, "radius_offset_px": -1.5}"#).unwrap();
        assert_eq!(cal.um_per_px, 0.8);
        assert_eq!(cal.radius_offset_px, -1.5);
    }

    #[test]
    fn test_roi_validation() {
        assert!(Roi::new(0, 0, 0, 10).validate().is_err());
        assert!(Roi::new(10, 10, 64, 64).validate().is_ok());
        assert!(Roi::new(10, 10, 64, 64).fits_within(74, 74));
        assert!(!Roi::new(10, 10, 64, 64).fits_within(73, 74));
    }
}
