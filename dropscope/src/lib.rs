//! Droplet Size Analysis Library
//!
//! Real-time droplet size distribution from a live microfluidic channel feed.
//! Frames are reduced to binary motion masks against a median background,
//! segmented into candidate blobs, filtered for static artifacts, measured
//! with calibration correction and aggregated into a bounded sliding-window
//! histogram. A single-slot scheduler keeps the pipeline on the latest frame
//! when the producer outpaces it.

pub mod config;
pub mod controller;
pub mod error;
pub mod export;
pub mod geometry;
pub mod histogram;
pub mod measurement;
pub mod motion;
pub mod pipeline;
pub mod preprocessing;
pub mod scheduler;
pub mod segmentation;
pub mod timing;
pub mod types;

pub use config::{
    BackgroundMethod, ConfigUpdate, ConfigViolation, ConfigViolations, MorphOperation,
    PipelineConfig, RejectionMethod, ThresholdMethod,
};
pub use controller::{AnalyzerStatus, DropletAnalyzer};
pub use error::{DropletError, Result};
pub use export::{ExportFormat, ExportRow, MeasurementLog};
pub use histogram::{
    Dimension, DropletHistogram, HistogramSnapshot, Statistics, StatisticsReport,
};
pub use motion::FrameDiffRejector;
pub use pipeline::{DropletPipeline, FrameResult, FrameStatus, FrameSummary, PipelineTiming};
pub use preprocessing::{BackgroundState, PreprocessOutcome, Preprocessor};
pub use scheduler::{FrameProcessor, Scheduler, SchedulerState, SchedulerStats, SubmitOutcome};
pub use segmentation::Segmenter;
pub use timing::{Stage, TimingInstrumentation, TimingStats};
pub use types::{
    AxisFit, BoundingBox, CalibrationProfile, CandidateBlob, DropletMetrics, Frame, PixelFormat,
    Roi,
};

/// Initialize the analysis library
/// Call once before creating analyzers; logs the rayon pool size used by
/// the per-pixel stages.
pub fn init() -> Result<()> {
    log::info!(
        "Droplet analysis library {} initialized ({} worker threads)",
        version(),
        rayon::current_num_threads()
    );
    Ok(())
}

/// Get library version information
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Dimensions a histogram can be requested for
pub fn get_dimensions() -> Vec<Dimension> {
    Dimension::ALL.to_vec()
}
