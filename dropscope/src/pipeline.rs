/// Droplet analysis pipeline - preprocessing, segmentation, artifact rejection
/// and measurement for one frame at a time
///
/// The pipeline instance exclusively owns every piece of mutable per-stream
/// state: the background reference (inside the preprocessor), the tracked
/// entity table (inside the rejector), the previous frame for frame-difference
/// rejection, the histogram window and the export log.
use crate::config::{PipelineConfig, RejectionMethod};
use crate::error::{DropletError, Result};
use crate::export::MeasurementLog;
use crate::histogram::DropletHistogram;
use crate::measurement::Measurer;
use crate::motion::FrameDiffRejector;
use crate::preprocessing::{to_grayscale, BackgroundState, PreprocessOutcome, Preprocessor};
use crate::scheduler::FrameProcessor;
use crate::segmentation::Segmenter;
use crate::timing::{Stage, TimingInstrumentation};
use crate::types::{CalibrationProfile, DropletMetrics, Frame, Roi};
use droptrack::ArtifactRejector;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// How a frame left the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameStatus {
    /// Consumed by the background warm-up
    WarmingUp,
    /// Background discarded (shape change); no measurements
    BackgroundReset,
    /// Full pass through every stage
    Analyzed,
}

/// Timing information for each pipeline stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineTiming {
    pub preprocess_ms: f64,
    pub segmentation_ms: f64,
    pub rejection_ms: f64,
    pub measurement_ms: f64,
    pub total_ms: f64,
}

/// Output of one pipeline pass, not yet published to readers
#[derive(Debug, Clone)]
pub struct FrameResult {
    pub frame_id: u64,
    pub status: FrameStatus,
    /// Blobs within the geometric bounds
    pub candidates: usize,
    /// Measurements of blobs that passed artifact rejection
    pub metrics: Vec<DropletMetrics>,
    pub timing: PipelineTiming,
}

impl FrameResult {
    fn empty(frame_id: u64, status: FrameStatus) -> Self {
        Self {
            frame_id,
            status,
            candidates: 0,
            metrics: Vec::new(),
            timing: PipelineTiming::default(),
        }
    }
}

/// What readers see of the most recently published frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameSummary {
    pub frame_id: u64,
    pub status: FrameStatus,
    pub candidates: usize,
    pub measured: usize,
}

impl From<&FrameResult> for FrameSummary {
    fn from(result: &FrameResult) -> Self {
        Self {
            frame_id: result.frame_id,
            status: result.status,
            candidates: result.candidates,
            measured: result.metrics.len(),
        }
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

pub struct DropletPipeline {
    config: PipelineConfig,
    roi: Option<Roi>,
    preprocessor: Preprocessor,
    segmenter: Segmenter,
    rejector: ArtifactRejector,
    frame_diff: FrameDiffRejector,
    measurer: Measurer,
    histogram: Arc<RwLock<DropletHistogram>>,
    log: Arc<RwLock<MeasurementLog>>,
    last_frame: Arc<RwLock<Option<FrameSummary>>>,
    timing: Arc<TimingInstrumentation>,
}

impl DropletPipeline {
    pub fn new(config: PipelineConfig, calibration: CalibrationProfile) -> Result<Self> {
        config.validate().map_err(DropletError::InvalidConfig)?;
        calibration.validate()?;

        let histogram = DropletHistogram::new(
            config.histogram_window_size,
            config.histogram_bins,
            calibration.um_per_px,
        );

        log::info!(
            "Droplet pipeline created: background {:?}, threshold {:?}, morph {:?} (k={}), rejection {:?}",
            config.background_method,
            config.threshold_method,
            config.morph_operation,
            config.morph_kernel_size,
            config.rejection_method
        );

        Ok(Self {
            preprocessor: Preprocessor::new(&config),
            segmenter: Segmenter::new(&config),
            rejector: ArtifactRejector::new(config.rejector_params()),
            frame_diff: FrameDiffRejector::new(config.frame_diff_threshold),
            measurer: Measurer::new(calibration),
            histogram: Arc::new(RwLock::new(histogram)),
            log: Arc::new(RwLock::new(MeasurementLog::new(config.export_log_capacity))),
            last_frame: Arc::new(RwLock::new(None)),
            timing: Arc::new(TimingInstrumentation::default()),
            roi: None,
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn calibration(&self) -> &CalibrationProfile {
        self.measurer.calibration()
    }

    pub fn roi(&self) -> Option<Roi> {
        self.roi
    }

    pub fn background_state(&self) -> BackgroundState {
        self.preprocessor.background_state()
    }

    pub fn rejector(&self) -> &ArtifactRejector {
        &self.rejector
    }

    pub fn frame_diff(&self) -> &FrameDiffRejector {
        &self.frame_diff
    }

    /// Drop tracked entities and the frame-difference reference
    fn reset_rejection(&mut self) {
        self.rejector.reset();
        self.frame_diff.reset();
    }

    /// Shared handle for histogram readers
    pub fn histogram(&self) -> Arc<RwLock<DropletHistogram>> {
        Arc::clone(&self.histogram)
    }

    /// Shared handle for export readers
    pub fn measurement_log(&self) -> Arc<RwLock<MeasurementLog>> {
        Arc::clone(&self.log)
    }

    pub fn last_frame(&self) -> Arc<RwLock<Option<FrameSummary>>> {
        Arc::clone(&self.last_frame)
    }

    pub fn timing(&self) -> Arc<TimingInstrumentation> {
        Arc::clone(&self.timing)
    }

    /// Change the region of interest. A different ROI invalidates the
    /// background reference and every tracked entity.
    pub fn set_roi(&mut self, roi: Roi) -> Result<()> {
        roi.validate()?;
        if self.roi != Some(roi) {
            log::info!(
                "ROI set to {}x{} at ({}, {})",
                roi.width,
                roi.height,
                roi.x,
                roi.y
            );
            self.roi = Some(roi);
            self.preprocessor.reset_background();
            self.reset_rejection();
        }
        Ok(())
    }

    /// Applies to measurements taken from now on; history keeps the
    /// calibration it was measured with, histogram display switches units.
    pub fn set_calibration(&mut self, calibration: CalibrationProfile) -> Result<()> {
        calibration.validate()?;
        self.measurer.set_calibration(calibration);
        self.histogram
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_calibration(calibration.um_per_px);
        log::info!(
            "Calibration set: {} um/px, radius offset {} px",
            calibration.um_per_px,
            calibration.radius_offset_px
        );
        Ok(())
    }

    /// Apply an already validated configuration to every stage
    pub fn apply_config(&mut self, config: PipelineConfig) {
        self.preprocessor.update_config(&config);
        self.segmenter.update_config(&config);
        self.rejector.set_params(config.rejector_params());
        self.frame_diff.set_threshold(config.frame_diff_threshold);
        if config.rejection_method != self.config.rejection_method {
            log::info!(
                "Artifact rejection switched from {:?} to {:?}",
                self.config.rejection_method,
                config.rejection_method
            );
            self.reset_rejection();
        }

        {
            let mut histogram = self
                .histogram
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if histogram.capacity() != config.histogram_window_size
                || histogram.bins() != config.histogram_bins
            {
                histogram.resize(config.histogram_window_size, config.histogram_bins);
            }
        }
        self.log
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_capacity(config.export_log_capacity);

        self.config = config;
    }

    pub fn reset_background(&mut self) {
        self.preprocessor.reset_background();
    }

    /// Forget everything observed so far: background, tracks, statistics,
    /// export log and timing samples. Configuration and ROI are kept.
    pub fn reset(&mut self) {
        self.preprocessor.reset_background();
        self.reset_rejection();
        self.histogram
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.log
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        *self
            .last_frame
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.timing.reset();
        log::info!("Droplet pipeline reset");
    }

    /// Bring a frame to the ROI shape
    fn frame_for_roi(&self, frame: Frame) -> Result<Frame> {
        let roi = match self.roi {
            Some(roi) => roi,
            None => return Ok(frame),
        };
        if frame.shape() == roi.shape() {
            Ok(frame)
        } else if roi.fits_within(frame.width, frame.height) {
            frame.crop(&roi)
        } else {
            Err(DropletError::ShapeMismatch {
                expected: roi.shape(),
                actual: frame.shape(),
            })
        }
    }

    /// Run every stage on one frame. Nothing is published to the histogram
    /// or log; see [`DropletPipeline::publish`].
    pub fn process_frame(&mut self, frame: Frame) -> Result<FrameResult> {
        let total_start = Instant::now();
        frame.validate()?;
        let frame = self.frame_for_roi(frame)?;
        let frame_id = frame.frame_id;
        let mut timing = PipelineTiming::default();

        // Stage 1: background correction, threshold, morphology
        let start = Instant::now();
        let gray = to_grayscale(&frame)?;
        let outcome = self.preprocessor.process_gray(&gray)?;
        timing.preprocess_ms = elapsed_ms(start);
        self.timing.record(Stage::Preprocessing, start.elapsed());

        let mask = match outcome {
            PreprocessOutcome::Mask(mask) => mask,
            PreprocessOutcome::WarmingUp {
                collected,
                required,
                ..
            } => {
                log::debug!(
                    "Frame {}: background warm-up {}/{}",
                    frame_id,
                    collected,
                    required
                );
                return Ok(FrameResult::empty(frame_id, FrameStatus::WarmingUp));
            }
            PreprocessOutcome::Reset { .. } => {
                self.reset_rejection();
                return Ok(FrameResult::empty(frame_id, FrameStatus::BackgroundReset));
            }
        };

        // Stage 2: contours and geometric filtering
        let start = Instant::now();
        let blobs = self.segmenter.segment(&mask);
        timing.segmentation_ms = elapsed_ms(start);
        self.timing.record(Stage::Segmentation, start.elapsed());
        let candidates = blobs.len();

        // Stage 3: temporal artifact rejection
        let start = Instant::now();
        let moving = match self.config.rejection_method {
            RejectionMethod::Tracking => self
                .rejector
                .filter(blobs, frame_id)
                .map_err(DropletError::Tracking)?,
            RejectionMethod::FrameDiff => self.frame_diff.filter(blobs, &gray),
        };
        timing.rejection_ms = elapsed_ms(start);
        self.timing.record(Stage::ArtifactRejection, start.elapsed());

        // Stage 4: calibrated measurement
        let start = Instant::now();
        let metrics = self.measurer.measure(&moving, frame_id, frame.timestamp_ms);
        timing.measurement_ms = elapsed_ms(start);
        self.timing.record(Stage::Measurement, start.elapsed());

        timing.total_ms = elapsed_ms(total_start);

        log::debug!(
            "Frame {}: {} candidates, {} moving droplets ({:.2} ms)",
            frame_id,
            candidates,
            metrics.len(),
            timing.total_ms
        );

        Ok(FrameResult {
            frame_id,
            status: FrameStatus::Analyzed,
            candidates,
            metrics,
            timing,
        })
    }

    /// Add a frame's measurements to the histogram and log. Each structure is
    /// updated under a single write lock so readers never see half a frame.
    pub fn publish(&mut self, result: FrameResult) {
        let start = Instant::now();
        let summary = FrameSummary::from(&result);

        if !result.metrics.is_empty() {
            self.log
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(result.metrics.iter().cloned());
            self.histogram
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(result.metrics);
        }
        *self
            .last_frame
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(summary);

        let publish_time = start.elapsed();
        self.timing.record(Stage::HistogramUpdate, publish_time);
        if result.status == FrameStatus::Analyzed {
            self.timing.record(
                Stage::TotalPerFrame,
                publish_time + Duration::from_secs_f64(result.timing.total_ms / 1000.0),
            );
        }
    }
}

impl FrameProcessor for DropletPipeline {
    type Output = FrameResult;

    fn process(&mut self, frame: Frame) -> Result<FrameResult> {
        self.process_frame(frame)
    }

    fn publish(&mut self, output: FrameResult) {
        DropletPipeline::publish(self, output);
    }

    fn recover(&mut self, frame_id: u64, error: &DropletError) {
        log::warn!("Frame {}: {}; resetting background", frame_id, error);
        self.preprocessor.reset_background();
        self.reset_rejection();
        DropletPipeline::publish(self, FrameResult::empty(frame_id, FrameStatus::BackgroundReset));
    }
}
