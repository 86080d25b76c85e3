//! Spatial indexing for nearest-centroid search in dense droplet streams

use std::collections::HashMap;

/// Uniform grid over centroid positions
/// Lets the rejector consider only entities in neighbouring cells instead of the whole table
#[derive(Debug, Clone)]
pub struct SpatialGrid {
    cell_size: f64,
    grid: HashMap<(i64, i64), Vec<usize>>,
}

impl SpatialGrid {
    /// Create a new spatial grid with the specified cell size
    ///
    /// # Arguments
    /// * `cell_size` - Edge length of a grid cell in pixels. Should be at least the match radius
    pub fn new(cell_size: f64) -> Self {
        Self {
            cell_size: cell_size.max(1.0),
            grid: HashMap::new(),
        }
    }

    fn cell_of(&self, x: f64, y: f64) -> (i64, i64) {
        (
            (x / self.cell_size).floor() as i64,
            (y / self.cell_size).floor() as i64,
        )
    }

    /// Insert a point into the grid
    ///
    /// # Arguments
    /// * `point` - Centroid as (x, y)
    /// * `id` - Identifier for this point
    pub fn insert(&mut self, point: (f64, f64), id: usize) {
        let cell = self.cell_of(point.0, point.1);
        self.grid.entry(cell).or_default().push(id);
    }

    /// Query the grid for ids stored in every cell touched by the disc
    /// of `radius` around `point`. Callers still have to check the exact distance.
    pub fn query(&self, point: (f64, f64), radius: f64) -> Vec<usize> {
        let (x_min, y_min) = self.cell_of(point.0 - radius, point.1 - radius);
        let (x_max, y_max) = self.cell_of(point.0 + radius, point.1 + radius);

        let mut candidates = Vec::new();
        for x in x_min..=x_max {
            for y in y_min..=y_max {
                if let Some(ids) = self.grid.get(&(x, y)) {
                    candidates.extend(ids);
                }
            }
        }

        candidates.sort_unstable();
        candidates.dedup();
        candidates
    }

    /// Clear all entries from the grid (reuse for next frame)
    pub fn clear(&mut self) {
        for bucket in self.grid.values_mut() {
            bucket.clear();
        }
    }

    /// Get statistics about grid usage
    pub fn stats(&self) -> SpatialGridStats {
        let occupied: Vec<usize> = self
            .grid
            .values()
            .map(|v| v.len())
            .filter(|&n| n > 0)
            .collect();
        let total_entries: usize = occupied.iter().sum();
        let max_entries = occupied.iter().copied().max().unwrap_or(0);
        let avg_entries = if occupied.is_empty() {
            0.0
        } else {
            total_entries as f64 / occupied.len() as f64
        };

        SpatialGridStats {
            occupied_cells: occupied.len(),
            total_entries,
            max_entries_per_cell: max_entries,
            avg_entries_per_cell: avg_entries,
        }
    }
}

/// Statistics about spatial grid usage
#[derive(Debug, Clone)]
pub struct SpatialGridStats {
    pub occupied_cells: usize,
    pub total_entries: usize,
    pub max_entries_per_cell: usize,
    pub avg_entries_per_cell: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spatial_grid_basic() {
        let mut grid = SpatialGrid::new(20.0);

        grid.insert((5.0, 5.0), 0);
        grid.insert((150.0, 150.0), 1);

        let results = grid.query((12.0, 8.0), 10.0);
        assert!(results.contains(&0));
        assert!(!results.contains(&1));
    }

    #[test]
    fn test_query_crosses_cell_boundary() {
        let mut grid = SpatialGrid::new(10.0);
        grid.insert((9.5, 9.5), 7);

        // Neighbouring cell, still within the radius
        let results = grid.query((10.5, 10.5), 2.0);
        assert_eq!(results, vec![7]);
    }

    #[test]
    fn test_negative_coordinates() {
        let mut grid = SpatialGrid::new(10.0);
        grid.insert((-3.0, -3.0), 1);
        assert_eq!(grid.query((1.0, 1.0), 5.0), vec![1]);
    }

    #[test]
    fn test_clear_and_stats() {
        let mut grid = SpatialGrid::new(10.0);
        grid.insert((1.0, 1.0), 0);
        grid.insert((2.0, 2.0), 1);
        grid.insert((55.0, 55.0), 2);

        let stats = grid.stats();
        assert_eq!(stats.occupied_cells, 2);
        assert_eq!(stats.total_entries, 3);
        assert_eq!(stats.max_entries_per_cell, 2);

        grid.clear();
        assert!(grid.query((1.0, 1.0), 5.0).is_empty());
        assert_eq!(grid.stats().total_entries, 0);
    }
}
