//! Static-artifact rejection by centroid tracking
//!
//! Candidates are matched frame to frame against a table of tracked entities.
//! Entities that keep reappearing at the same place (dust, scratches, stuck
//! bubbles) are suppressed once their static counter exceeds the configured
//! number of frames. Candidates without a match are new and always pass.

use crate::entity::{distance, Classification, Locate, TrackedEntity};
use crate::spatial::SpatialGrid;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectorParams {
    /// Displacement below which a matched sighting counts as static
    pub min_motion_px: f64,
    /// Consecutive static sightings tolerated before the entity is suppressed
    pub static_rejection_frames: u32,
    /// Maximum centroid distance for a candidate to match an entity
    pub max_match_distance_px: f64,
    /// Consecutive passes without a match before the entity is evicted
    pub max_missed_frames: u32,
}

impl Default for RejectorParams {
    fn default() -> Self {
        Self {
            min_motion_px: 0.5,          // sub-pixel jitter is not motion
            static_rejection_frames: 3,  // ~0.1 s at 30 fps
            max_match_distance_px: 20.0, // max per-frame droplet travel
            max_missed_frames: 5,
        }
    }
}

/// Per-call counters, kept for the most recent `filter` pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterStats {
    pub candidates: usize,
    pub passed: usize,
    pub suppressed: usize,
    pub new: usize,
    pub evicted: usize,
}

#[derive(Debug, Clone)]
pub struct ArtifactRejector {
    params: RejectorParams,
    entities: BTreeMap<u64, TrackedEntity>,
    grid: SpatialGrid,
    next_id: u64,
    last_frame_id: Option<u64>,
    last_stats: FilterStats,
}

impl ArtifactRejector {
    pub fn new(params: RejectorParams) -> Self {
        let grid = SpatialGrid::new(params.max_match_distance_px);
        Self {
            params,
            entities: BTreeMap::new(),
            grid,
            next_id: 1,
            last_frame_id: None,
            last_stats: FilterStats::default(),
        }
    }

    pub fn params(&self) -> &RejectorParams {
        &self.params
    }

    /// Replace the tuning parameters; tracked entities are kept
    pub fn set_params(&mut self, params: RejectorParams) {
        if params.max_match_distance_px != self.params.max_match_distance_px {
            self.grid = SpatialGrid::new(params.max_match_distance_px);
        }
        self.params = params;
    }

    /// Keep only the candidates that are new or still moving
    ///
    /// # Arguments
    /// * `candidates` - Candidates of one frame, in any order
    /// * `frame_id` - Frame the candidates came from, must increase strictly between calls
    ///
    /// # Returns
    /// The passing candidates in their input order
    pub fn filter<T: Locate>(&mut self, candidates: Vec<T>, frame_id: u64) -> Result<Vec<T>> {
        if let Some(last) = self.last_frame_id {
            if frame_id <= last {
                bail!(
                    "frame id regression in artifact rejector: got {}, last was {}",
                    frame_id,
                    last
                );
            }
        }
        self.last_frame_id = Some(frame_id);

        let centroids: Vec<(f64, f64)> = candidates.iter().map(|c| c.centroid()).collect();
        let entity_ids: Vec<u64> = self.entities.keys().copied().collect();
        let (matches, unmatched_entities) = self.assign(&centroids, &entity_ids);

        let mut stats = FilterStats {
            candidates: centroids.len(),
            ..FilterStats::default()
        };
        let mut keep = vec![true; centroids.len()];
        let mut matched_candidate = vec![false; centroids.len()];

        for (cand_idx, entity_idx) in matches {
            matched_candidate[cand_idx] = true;
            let id = entity_ids[entity_idx];
            if let Some(entity) = self.entities.get_mut(&id) {
                let class = entity.observe(
                    centroids[cand_idx],
                    frame_id,
                    self.params.min_motion_px,
                    self.params.static_rejection_frames,
                );
                keep[cand_idx] = class.passes();
            }
        }

        for (cand_idx, &centroid) in centroids.iter().enumerate() {
            if !matched_candidate[cand_idx] {
                let id = self.next_id;
                self.next_id += 1;
                self.entities
                    .insert(id, TrackedEntity::new(id, centroid, frame_id));
                stats.new += 1;
            }
        }

        for entity_idx in unmatched_entities {
            if let Some(entity) = self.entities.get_mut(&entity_ids[entity_idx]) {
                entity.mark_missed();
            }
        }
        stats.evicted = self.remove_stale_entities();

        let passed: Vec<T> = candidates
            .into_iter()
            .zip(keep)
            .filter_map(|(c, k)| if k { Some(c) } else { None })
            .collect();

        stats.passed = passed.len();
        stats.suppressed = stats.candidates - stats.passed;
        self.last_stats = stats;

        log::debug!(
            "Rejector frame {}: {} candidates, {} passed, {} suppressed, {} new, {} evicted, {} tracked",
            frame_id,
            stats.candidates,
            stats.passed,
            stats.suppressed,
            stats.new,
            stats.evicted,
            self.entities.len()
        );

        Ok(passed)
    }

    /// Greedy one-to-one assignment by ascending distance
    ///
    /// Returns (candidate_idx, entity_idx) pairs and the unmatched entity indices
    fn assign(
        &mut self,
        centroids: &[(f64, f64)],
        entity_ids: &[u64],
    ) -> (Vec<(usize, usize)>, Vec<usize>) {
        let max_distance = self.params.max_match_distance_px;

        self.grid.clear();
        let entity_centroids: Vec<(f64, f64)> = entity_ids
            .iter()
            .filter_map(|id| self.entities.get(id).map(|e| e.centroid))
            .collect();
        for (idx, &c) in entity_centroids.iter().enumerate() {
            self.grid.insert(c, idx);
        }

        let mut pairs: Vec<(f64, usize, usize)> = Vec::new();
        for (cand_idx, &c) in centroids.iter().enumerate() {
            for entity_idx in self.grid.query(c, max_distance) {
                let d = distance(c, entity_centroids[entity_idx]);
                if d <= max_distance {
                    pairs.push((d, cand_idx, entity_idx));
                }
            }
        }

        // Nearest first; index order keeps ties deterministic
        pairs.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });

        let mut used_candidates = vec![false; centroids.len()];
        let mut used_entities = vec![false; entity_centroids.len()];
        let mut matches = Vec::new();

        for (_d, cand_idx, entity_idx) in pairs {
            if !used_candidates[cand_idx] && !used_entities[entity_idx] {
                used_candidates[cand_idx] = true;
                used_entities[entity_idx] = true;
                matches.push((cand_idx, entity_idx));
            }
        }

        let unmatched = (0..entity_centroids.len())
            .filter(|&i| !used_entities[i])
            .collect();

        (matches, unmatched)
    }

    /// Evict entities missed for more than `max_missed_frames` passes
    fn remove_stale_entities(&mut self) -> usize {
        let before = self.entities.len();
        let max_missed = self.params.max_missed_frames;
        self.entities
            .retain(|_, entity| entity.frames_since_seen <= max_missed);
        before - self.entities.len()
    }

    /// Forget every tracked entity and the frame id history
    pub fn reset(&mut self) {
        self.entities.clear();
        self.grid.clear();
        self.last_frame_id = None;
        self.last_stats = FilterStats::default();
    }

    pub fn num_entities(&self) -> usize {
        self.entities.len()
    }

    pub fn entities(&self) -> impl Iterator<Item = &TrackedEntity> {
        self.entities.values()
    }

    /// Number of entities currently suppressed as static artifacts
    pub fn num_static(&self) -> usize {
        self.entities
            .values()
            .filter(|e| e.classification == Classification::StaticArtifact)
            .count()
    }

    pub fn last_stats(&self) -> FilterStats {
        self.last_stats
    }
}

impl Default for ArtifactRejector {
    fn default() -> Self {
        Self::new(RejectorParams::default())
    }
}
