//! Pure Rust centroid tracking for droplet streams
//!
//! This crate separates genuinely moving objects from stationary artifacts
//! (dust, scratches, stuck bubbles) by tracking candidate centroids across
//! frames. It knows nothing about images: anything implementing [`Locate`]
//! can be filtered.
//!
//! ```rust,ignore
//! use droptrack::{ArtifactRejector, RejectorParams};
//!
//! let mut rejector = ArtifactRejector::new(RejectorParams::default());
//! let moving = rejector.filter(vec![(120.0, 40.0), (300.5, 41.0)], frame_id)?;
//! ```

pub mod entity;
pub mod rejector;
pub mod spatial; // uniform grid for candidate/entity matching

pub use entity::{Classification, Locate, TrackedEntity};
pub use rejector::{ArtifactRejector, FilterStats, RejectorParams};
pub use spatial::{SpatialGrid, SpatialGridStats};
