//! Error types for the droplet analysis core

use crate::config::ConfigViolations;
use thiserror::Error;

/// Result type alias for the analysis core
pub type Result<T> = std::result::Result<T, DropletError>;

/// Errors that can occur while configuring or running the analysis pipeline
#[derive(Error, Debug)]
pub enum DropletError {
    #[error("Background/frame shape mismatch: background {expected:?}, frame {actual:?}")]
    ShapeMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(ConfigViolations),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Analyzer not configured: {0}")]
    NotConfigured(String),

    #[error("Analyzer is already running")]
    AlreadyRunning,

    #[error("No measurements available for export")]
    NoMeasurements,

    #[error("Unsupported export format: {0}")]
    UnsupportedFormat(String),

    #[error("Tracking error: {0:#}")]
    Tracking(anyhow::Error),

    #[error("Export error: {0}")]
    Export(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DropletError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn invalid_frame<S: Into<String>>(msg: S) -> Self {
        Self::InvalidFrame(msg.into())
    }

    pub fn not_configured<S: Into<String>>(msg: S) -> Self {
        Self::NotConfigured(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Recoverable errors reset the background and yield an empty frame result.
    /// Everything else halts scheduling.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ShapeMismatch { .. })
    }
}
