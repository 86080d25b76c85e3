//! Tracked entity state for centroid-based artifact rejection

use serde::{Deserialize, Serialize};

/// How the rejector currently sees a tracked entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    /// First sighting, no motion history yet
    New,
    /// Matched and displaced at least `min_motion_px` since the previous sighting,
    /// or still within the static grace period
    Moving,
    /// Held in place for more than `static_rejection_frames` consecutive sightings
    StaticArtifact,
}

impl Classification {
    /// Whether a candidate with this classification is forwarded downstream
    pub fn passes(&self) -> bool {
        !matches!(self, Classification::StaticArtifact)
    }
}

/// Anything with a centroid in frame coordinates can be tracked
pub trait Locate {
    fn centroid(&self) -> (f64, f64);
}

impl Locate for (f64, f64) {
    fn centroid(&self) -> (f64, f64) {
        *self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedEntity {
    /// entity id, unique for the lifetime of the rejector
    pub id: u64,
    /// centroid of the most recent matched candidate
    pub centroid: (f64, f64),
    /// number of consecutive matched sightings with displacement below `min_motion_px`
    pub static_count: u32,
    pub classification: Classification,
    /// number of consecutive passes without a matching candidate
    pub frames_since_seen: u32,
    pub first_seen_frame: u64,
    pub last_seen_frame: u64,
    /// number of passes with a matching candidate, including the first sighting
    pub hits: u32,
}

impl TrackedEntity {
    pub fn new(id: u64, centroid: (f64, f64), frame_id: u64) -> Self {
        Self {
            id,
            centroid,
            static_count: 0,
            classification: Classification::New,
            frames_since_seen: 0,
            first_seen_frame: frame_id,
            last_seen_frame: frame_id,
            hits: 1,
        }
    }

    /// Fold a matched sighting into the entity and reclassify it
    ///
    /// # Arguments
    /// * `centroid` - Centroid of the matched candidate
    /// * `frame_id` - Frame the candidate was observed on
    /// * `min_motion_px` - Displacement below which the sighting counts as static
    /// * `static_rejection_frames` - Static sightings tolerated before suppression
    pub fn observe(
        &mut self,
        centroid: (f64, f64),
        frame_id: u64,
        min_motion_px: f64,
        static_rejection_frames: u32,
    ) -> Classification {
        let displacement = distance(self.centroid, centroid);

        if displacement < min_motion_px {
            self.static_count = self.static_count.saturating_add(1);
        } else {
            self.static_count = 0;
        }

        self.classification = if self.static_count > static_rejection_frames {
            Classification::StaticArtifact
        } else {
            Classification::Moving
        };

        self.centroid = centroid;
        self.frames_since_seen = 0;
        self.last_seen_frame = frame_id;
        self.hits = self.hits.saturating_add(1);
        self.classification
    }

    /// Record a pass without a matching candidate
    pub fn mark_missed(&mut self) {
        self.frames_since_seen = self.frames_since_seen.saturating_add(1);
    }
}

/// Euclidean distance between two centroids
pub fn distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    let dx = a.0 - b.0;
    let dy = a.1 - b.1;
    (dx * dx + dy * dy).sqrt()
}
