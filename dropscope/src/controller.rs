//! Command surface of the droplet analyzer
//!
//! `DropletAnalyzer` wires one [`DropletPipeline`] to a [`Scheduler`] and
//! exposes the commands and queries of the reporting collaborator. Queries
//! read the shared histogram, log and counters and never wait for a
//! pipeline pass.

use crate::config::{ConfigUpdate, PipelineConfig};
use crate::error::{DropletError, Result};
use crate::export::{ExportFormat, MeasurementLog};
use crate::histogram::{Dimension, DropletHistogram, HistogramSnapshot, StatisticsReport};
use crate::pipeline::{DropletPipeline, FrameSummary};
use crate::scheduler::{Scheduler, SchedulerState, SubmitOutcome};
use crate::timing::{Stage, TimingInstrumentation, TimingStats};
use crate::types::{CalibrationProfile, DropletMetrics, Frame, Roi};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

/// Snapshot of the analyzer for the reporting side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerStatus {
    pub running: bool,
    pub state: SchedulerState,
    /// Frames that completed a pipeline pass
    pub frame_count: u64,
    pub processing_rate_hz: f64,
    pub frames_dropped: u64,
    pub frames_stale: u64,
    pub recoverable_errors: u64,
    pub last_error: Option<String>,
    pub last_frame: Option<FrameSummary>,
    pub roi: Option<Roi>,
    pub calibration: CalibrationProfile,
    pub config: PipelineConfig,
}

#[derive(Debug, Clone)]
struct ActiveSettings {
    config: PipelineConfig,
    calibration: CalibrationProfile,
    roi: Option<Roi>,
}

pub struct DropletAnalyzer {
    scheduler: Scheduler<DropletPipeline>,
    settings: RwLock<ActiveSettings>,
    histogram: Arc<RwLock<DropletHistogram>>,
    log: Arc<RwLock<MeasurementLog>>,
    last_frame: Arc<RwLock<Option<FrameSummary>>>,
    timing: Arc<TimingInstrumentation>,
}

impl DropletAnalyzer {
    pub fn new(config: PipelineConfig, calibration: CalibrationProfile) -> Result<Self> {
        let pipeline = DropletPipeline::new(config.clone(), calibration)?;
        let histogram = pipeline.histogram();
        let log = pipeline.measurement_log();
        let last_frame = pipeline.last_frame();
        let timing = pipeline.timing();

        Ok(Self {
            scheduler: Scheduler::new(Arc::new(Mutex::new(pipeline))),
            settings: RwLock::new(ActiveSettings {
                config,
                calibration,
                roi: None,
            }),
            histogram,
            log,
            last_frame,
            timing,
        })
    }

    /// Build from a flat or nested JSON configuration document
    pub fn from_json(json: &str) -> Result<Self> {
        let (config, calibration) = PipelineConfig::from_json(json)?;
        Self::new(config, calibration)
    }

    fn pipeline(&self) -> std::sync::MutexGuard<'_, DropletPipeline> {
        self.scheduler
            .processor()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn settings(&self) -> ActiveSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_roi(&self, roi: Roi) -> Result<()> {
        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        self.pipeline().set_roi(roi)?;
        settings.roi = Some(roi);
        Ok(())
    }

    pub fn set_calibration(&self, calibration: CalibrationProfile) -> Result<()> {
        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        self.pipeline().set_calibration(calibration)?;
        settings.calibration = calibration;
        Ok(())
    }

    /// Start admitting frames. Requires an ROI.
    pub fn start(&self) -> Result<()> {
        if self.settings().roi.is_none() {
            return Err(DropletError::not_configured(
                "no region of interest set; call set_roi before start",
            ));
        }
        self.scheduler.start()?;
        log::info!("Droplet analyzer started");
        Ok(())
    }

    /// Stop admitting frames. Succeeds whether or not the analyzer is running.
    pub fn stop(&self) -> Result<()> {
        self.scheduler.stop();
        Ok(())
    }

    /// Clear background, tracks, statistics, export log and counters
    pub fn reset(&self) -> Result<()> {
        self.pipeline().reset();
        self.scheduler.reset_counters();
        log::info!("Droplet analyzer reset");
        Ok(())
    }

    /// Merge a partial update onto the active configuration. On any violation
    /// the previous configuration stays active and the error lists every
    /// violated bound.
    pub fn update_config(&self, update: &ConfigUpdate) -> Result<PipelineConfig> {
        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        let (config, calibration) = match update.apply(&settings.config, &settings.calibration) {
            Ok(applied) => applied,
            Err(e) => {
                log::warn!("Configuration update rejected: {}", e);
                return Err(e);
            }
        };

        {
            let mut pipeline = self.pipeline();
            pipeline.apply_config(config.clone());
            if calibration != settings.calibration {
                pipeline.set_calibration(calibration)?;
            }
        }
        settings.config = config.clone();
        settings.calibration = calibration;
        log::info!("Configuration updated");
        Ok(config)
    }

    pub fn update_config_json(&self, json: &str) -> Result<PipelineConfig> {
        let update = ConfigUpdate::from_json(json)?;
        self.update_config(&update)
    }

    /// Offer a frame to the scheduler. Invalid frames are rejected here and
    /// never reach the pipeline.
    pub fn submit_frame(&self, frame: Frame) -> Result<SubmitOutcome> {
        frame.validate()?;
        Ok(self.scheduler.submit(frame))
    }

    pub fn export(&self, format: ExportFormat) -> Result<Vec<u8>> {
        self.log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .export(format)
    }

    /// Export by format name ("csv", "tsv" or "txt")
    pub fn export_named(&self, format: &str) -> Result<Vec<u8>> {
        self.export(format.parse()?)
    }

    pub fn status(&self) -> AnalyzerStatus {
        let stats = self.scheduler.stats();
        let settings = self.settings();
        AnalyzerStatus {
            running: stats.running,
            state: stats.state,
            frame_count: stats.frames_processed,
            processing_rate_hz: stats.processing_rate_hz,
            frames_dropped: stats.frames_dropped,
            frames_stale: stats.frames_stale,
            recoverable_errors: stats.recoverable_errors,
            last_error: stats.last_error,
            last_frame: self
                .last_frame
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            roi: settings.roi,
            calibration: settings.calibration,
            config: settings.config,
        }
    }

    pub fn status_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.status())?)
    }

    pub fn histogram(&self, dimension: Dimension) -> HistogramSnapshot {
        self.histogram
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot(dimension)
    }

    pub fn histograms(&self) -> Vec<HistogramSnapshot> {
        self.histogram
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshots()
    }

    pub fn statistics(&self) -> StatisticsReport {
        self.histogram
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .report()
    }

    /// Measurements currently held by the export log, oldest first
    pub fn measurements(&self) -> Vec<DropletMetrics> {
        self.log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn performance(&self) -> BTreeMap<Stage, TimingStats> {
        self.timing.statistics()
    }

    /// The error that halted the analyzer, if any
    pub fn take_fatal_error(&self) -> Option<DropletError> {
        self.scheduler.take_fatal_error()
    }

    /// Block until the submitted frames have been processed
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.scheduler.wait_idle(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MorphOperation;
    use crate::pipeline::FrameStatus;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::PI;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn config() -> PipelineConfig {
        PipelineConfig {
            background_warmup_frames: 2,
            morph_operation: MorphOperation::None,
            ..PipelineConfig::default()
        }
    }

    fn disk_frame(w: u32, h: u32, id: u64, disks: &[(i64, i64, i64)]) -> Frame {
        let mut data = vec![20u8; (w * h) as usize];
        for &(cx, cy, r) in disks {
            for y in (cy - r).max(0)..=(cy + r).min(h as i64 - 1) {
                for x in (cx - r).max(0)..=(cx + r).min(w as i64 - 1) {
                    if (x - cx).pow(2) + (y - cy).pow(2) <= r * r {
                        data[(y as u32 * w + x as u32) as usize] = 220;
                    }
                }
            }
        }
        Frame::gray(data, w, h, id)
    }

    fn submit_and_wait(analyzer: &DropletAnalyzer, frame: Frame) -> SubmitOutcome {
        let outcome = analyzer.submit_frame(frame).unwrap();
        assert!(analyzer.wait_idle(TIMEOUT));
        outcome
    }

    fn running_analyzer(calibration: CalibrationProfile, w: u32, h: u32) -> DropletAnalyzer {
        let analyzer = DropletAnalyzer::new(config(), calibration).unwrap();
        analyzer.set_roi(Roi::new(0, 0, w, h)).unwrap();
        analyzer.start().unwrap();
        for id in 0..2 {
            submit_and_wait(&analyzer, disk_frame(w, h, id, &[]));
        }
        analyzer
    }

    #[test]
    fn test_eight_disks_with_negative_radius_offset() {
        let analyzer = running_analyzer(CalibrationProfile::new(1.0, -2.0), 640, 160);
        let disks: Vec<(i64, i64, i64)> = (0..8).map(|i| (40 + 75 * i, 80, 20)).collect();
        assert_eq!(
            submit_and_wait(&analyzer, disk_frame(640, 160, 2, &disks)),
            SubmitOutcome::Accepted
        );

        let measurements = analyzer.measurements();
        assert_eq!(measurements.len(), 8);
        for m in &measurements {
            assert_abs_diff_eq!(m.equivalent_diameter, 36.0, epsilon = 0.1);
            assert_abs_diff_eq!(m.area, PI * 400.0, epsilon = 1.0);
            assert_eq!(m.radius_offset_px, -2.0);
        }

        let report = analyzer.statistics();
        assert_eq!(report.count, 8);
        assert_eq!(report.equivalent_diameter.mean, 36);
        assert_eq!(report.equivalent_diameter.unit, "px");

        let status = analyzer.status();
        assert!(status.running);
        assert_eq!(status.frame_count, 3);
        assert_eq!(status.last_frame.unwrap().measured, 8);
    }

    #[test]
    fn test_roi_resize_yields_empty_result_then_continues() {
        let analyzer = running_analyzer(CalibrationProfile::default(), 512, 512);
        submit_and_wait(&analyzer, disk_frame(512, 512, 2, &[(100, 100, 10)]));
        assert_eq!(analyzer.statistics().count, 1);

        analyzer.set_roi(Roi::new(0, 0, 256, 256)).unwrap();
        submit_and_wait(&analyzer, disk_frame(256, 256, 3, &[(100, 100, 10)]));

        let status = analyzer.status();
        assert!(status.running);
        assert!(status.last_error.is_none());
        let last = status.last_frame.unwrap();
        assert_eq!(last.frame_id, 3);
        assert_eq!(last.measured, 0);
        assert_eq!(analyzer.statistics().count, 1);

        // Warm-up at the new size, then measurement resumes
        submit_and_wait(&analyzer, disk_frame(256, 256, 4, &[]));
        submit_and_wait(&analyzer, disk_frame(256, 256, 5, &[(60, 60, 10)]));
        assert_eq!(analyzer.statistics().count, 2);
    }

    #[test]
    fn test_frame_larger_than_roi_mismatch_is_recovered() {
        let analyzer = running_analyzer(CalibrationProfile::default(), 512, 512);
        submit_and_wait(&analyzer, disk_frame(256, 256, 2, &[(100, 100, 10)]));

        let status = analyzer.status();
        assert!(status.running);
        assert_eq!(status.recoverable_errors, 1);
        assert!(status.last_error.is_none());
        let last = status.last_frame.unwrap();
        assert_eq!(last.status, FrameStatus::BackgroundReset);
        assert_eq!(last.measured, 0);
    }

    #[test]
    fn test_rejected_config_keeps_previous() {
        let analyzer = DropletAnalyzer::new(config(), CalibrationProfile::default()).unwrap();
        let before = analyzer.status().config;

        let err = analyzer
            .update_config_json(r#"{"min_area": 5000, "max_area": 1000}"#)
            .unwrap_err();
        match err {
            DropletError::InvalidConfig(violations) => {
                assert!(violations.contains_field("min_area"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(analyzer.status().config, before);
    }

    #[test]
    fn test_unparseable_config_update_is_reported() {
        let analyzer = DropletAnalyzer::new(config(), CalibrationProfile::default()).unwrap();
        let before = analyzer.status().config;

        for json in [
            r#"{"droplet_detection": {"min_area": "abc"}}"#,
            r#"{"min_aera": 5000}"#,
            r#"{"droplet_detection": 5}"#,
        ] {
            assert!(analyzer.update_config_json(json).is_err(), "accepted {}", json);
        }
        assert_eq!(analyzer.status().config, before);
    }

    #[test]
    fn test_nested_update_with_legacy_calibration_key() {
        let analyzer = DropletAnalyzer::new(config(), CalibrationProfile::default()).unwrap();
        let applied = analyzer
            .update_config_json(
                r#"{"droplet_detection": {"min_area": 50, "pixel_ratio": 2.5}, "modules": {}}"#,
            )
            .unwrap();
        assert_eq!(applied.min_area, 50.0);

        let status = analyzer.status();
        assert_eq!(status.config.min_area, 50.0);
        assert_eq!(status.calibration.um_per_px, 2.5);
        assert_eq!(analyzer.histogram(Dimension::EquivalentDiameter).unit, "um");
    }

    #[test]
    fn test_start_requires_roi_and_rejects_double_start() {
        let analyzer = DropletAnalyzer::new(config(), CalibrationProfile::default()).unwrap();
        assert!(matches!(
            analyzer.start(),
            Err(DropletError::NotConfigured(_))
        ));

        analyzer.set_roi(Roi::new(0, 0, 32, 32)).unwrap();
        analyzer.start().unwrap();
        assert!(matches!(analyzer.start(), Err(DropletError::AlreadyRunning)));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let analyzer = DropletAnalyzer::new(config(), CalibrationProfile::default()).unwrap();
        assert!(analyzer.stop().is_ok());

        analyzer.set_roi(Roi::new(0, 0, 32, 32)).unwrap();
        analyzer.start().unwrap();
        assert!(analyzer.stop().is_ok());
        assert!(analyzer.stop().is_ok());
        assert!(!analyzer.status().running);
        assert_eq!(
            analyzer.submit_frame(disk_frame(32, 32, 0, &[])).unwrap(),
            SubmitOutcome::Stopped
        );
    }

    #[test]
    fn test_invalid_frame_rejected_at_submission() {
        let analyzer = running_analyzer(CalibrationProfile::default(), 32, 32);
        let bad = Frame::gray(vec![0; 10], 32, 32, 2);
        assert!(matches!(
            analyzer.submit_frame(bad),
            Err(DropletError::InvalidFrame(_))
        ));
        assert!(analyzer.status().running);
        assert_eq!(
            analyzer.submit_frame(disk_frame(32, 32, 2, &[])).unwrap(),
            SubmitOutcome::Accepted
        );
    }

    #[test]
    fn test_export_requires_measurements() {
        let analyzer = running_analyzer(CalibrationProfile::new(0.5, 0.0), 200, 100);
        assert!(matches!(
            analyzer.export(ExportFormat::Csv),
            Err(DropletError::NoMeasurements)
        ));

        submit_and_wait(&analyzer, disk_frame(200, 100, 2, &[(50, 50, 10), (150, 50, 10)]));
        let csv = String::from_utf8(analyzer.export_named("csv").unwrap()).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("timestamp,frame_id,equivalent_diameter"));
        assert!(lines[1].contains(",um,"));

        assert!(matches!(
            analyzer.export_named("xml"),
            Err(DropletError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_reset_clears_statistics_and_counters() {
        let analyzer = running_analyzer(CalibrationProfile::default(), 200, 100);
        submit_and_wait(&analyzer, disk_frame(200, 100, 2, &[(50, 50, 10)]));
        assert_eq!(analyzer.statistics().count, 1);

        analyzer.reset().unwrap();
        let status = analyzer.status();
        assert_eq!(status.frame_count, 0);
        assert!(status.last_frame.is_none());
        assert_eq!(analyzer.statistics().count, 0);
        assert_eq!(analyzer.performance()[&Stage::Segmentation].count, 0);
        assert!(status.running);
    }

    #[test]
    fn test_performance_reports_every_stage() {
        let analyzer = running_analyzer(CalibrationProfile::default(), 200, 100);
        submit_and_wait(&analyzer, disk_frame(200, 100, 2, &[(50, 50, 10)]));
        let perf = analyzer.performance();
        assert_eq!(perf.len(), Stage::ALL.len());
        assert_eq!(perf[&Stage::Segmentation].count, 1);
        assert_eq!(perf[&Stage::TotalPerFrame].count, 1);
        assert!(analyzer.status_json().unwrap().contains("\"frame_count\": 3"));
    }
}
