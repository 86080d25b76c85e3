//! Motion mask segmentation into candidate blobs

use crate::config::PipelineConfig;
use crate::geometry::{aspect_ratio, equivalent_diameter, fit_axes, RegionMoments};
use crate::types::CandidateBlob;
use image::{GrayImage, Luma};
use imageproc::contours::{find_contours, BorderType};
use imageproc::region_labelling::{connected_components, Connectivity};

/// Geometric filter bounds for candidate blobs
#[derive(Debug, Clone, PartialEq)]
pub struct Segmenter {
    min_area: f64,
    max_area: f64,
    min_aspect_ratio: f64,
    max_aspect_ratio: f64,
    min_contour_points: usize,
    channel_band: Option<(f64, f64)>,
    channel_band_margin: f64,
}

impl Segmenter {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            min_area: config.min_area,
            max_area: config.max_area,
            min_aspect_ratio: config.min_aspect_ratio,
            max_aspect_ratio: config.max_aspect_ratio,
            min_contour_points: config.min_contour_points,
            channel_band: config.channel_band,
            channel_band_margin: config.channel_band_margin,
        }
    }

    pub fn update_config(&mut self, config: &PipelineConfig) {
        *self = Self::new(config);
    }

    /// Extract 8-connected regions of the mask and keep those within the
    /// area, aspect ratio and channel band bounds
    pub fn segment(&self, mask: &GrayImage) -> Vec<CandidateBlob> {
        let blobs = extract_blobs(mask, self.min_contour_points);
        let total = blobs.len();

        let kept: Vec<CandidateBlob> = blobs
            .into_iter()
            .filter(|b| self.accepts(b))
            .collect();

        log::debug!(
            "Segmenter: {} regions, {} within bounds",
            total,
            kept.len()
        );
        kept
    }

    fn accepts(&self, blob: &CandidateBlob) -> bool {
        if blob.area < self.min_area || blob.area > self.max_area {
            return false;
        }
        if blob.aspect_ratio < self.min_aspect_ratio || blob.aspect_ratio > self.max_aspect_ratio {
            return false;
        }
        if let Some((y_min, y_max)) = self.channel_band {
            let cy = blob.centroid.1;
            if cy < y_min - self.channel_band_margin || cy > y_max + self.channel_band_margin {
                return false;
            }
        }
        true
    }
}

/// Every non-degenerate region of the mask with its raw geometry, unfiltered
pub fn extract_blobs(mask: &GrayImage, min_contour_points: usize) -> Vec<CandidateBlob> {
    let labels = connected_components(mask, Connectivity::Eight, Luma([0u8]));

    let mut moments: Vec<RegionMoments> = Vec::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label[0] as usize;
        if label == 0 {
            continue;
        }
        if moments.len() < label {
            moments.resize(label, RegionMoments::default());
        }
        moments[label - 1].add(x, y);
    }

    // Outer border of each region, keyed by the label under its first point
    let mut contours: Vec<Option<Vec<(i32, i32)>>> = vec![None; moments.len()];
    for contour in find_contours::<i32>(mask) {
        if contour.border_type != BorderType::Outer {
            continue;
        }
        let Some(first) = contour.points.first() else {
            continue;
        };
        let label = labels.get_pixel(first.x as u32, first.y as u32)[0] as usize;
        if label == 0 || label > contours.len() {
            continue;
        }
        let slot = &mut contours[label - 1];
        if slot.is_none() {
            *slot = Some(contour.points.iter().map(|p| (p.x, p.y)).collect());
        }
    }

    moments
        .into_iter()
        .zip(contours)
        .filter_map(|(m, contour)| {
            let contour = contour.unwrap_or_default();
            if m.area() <= 0.0 || contour.len() < 3 {
                return None;
            }

            let (major, minor, axis_fit) = fit_axes(&m, contour.len(), min_contour_points);
            Some(CandidateBlob {
                centroid: m.centroid(),
                area: m.area(),
                equivalent_diameter: equivalent_diameter(m.area()),
                major_axis: major,
                minor_axis: minor,
                aspect_ratio: aspect_ratio(major, minor),
                bbox: m.bbox(),
                axis_fit,
                contour,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AxisFit;
    use approx::assert_abs_diff_eq;

    fn draw_disk(mask: &mut GrayImage, cx: i64, cy: i64, r: f64) {
        let ri = r.ceil() as i64;
        for y in cy - ri..=cy + ri {
            for x in cx - ri..=cx + ri {
                let (dx, dy) = ((x - cx) as f64, (y - cy) as f64);
                if dx * dx + dy * dy <= r * r
                    && x >= 0
                    && y >= 0
                    && (x as u32) < mask.width()
                    && (y as u32) < mask.height()
                {
                    mask.put_pixel(x as u32, y as u32, Luma([255]));
                }
            }
        }
    }

    fn draw_rect(mask: &mut GrayImage, x0: u32, y0: u32, w: u32, h: u32) {
        for y in y0..y0 + h {
            for x in x0..x0 + w {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
    }

    #[test]
    fn test_near_circular_blob_passes_default_bounds() {
        let mut mask = GrayImage::new(128, 128);
        draw_disk(&mut mask, 64, 64, 12.0);

        let segmenter = Segmenter::new(&PipelineConfig::default());
        let blobs = segmenter.segment(&mask);
        assert_eq!(blobs.len(), 1);

        let blob = &blobs[0];
        assert_eq!(blob.axis_fit, AxisFit::Ellipse);
        assert!(blob.aspect_ratio >= 1.0 && blob.aspect_ratio < 1.1);
        assert_abs_diff_eq!(blob.centroid.0, 64.0, epsilon = 1e-9);
        assert_abs_diff_eq!(blob.centroid.1, 64.0, epsilon = 1e-9);
        assert!(blob.contour.len() >= 5);
    }

    #[test]
    fn test_equivalent_diameter_from_area() {
        let mut mask = GrayImage::new(100, 100);
        draw_rect(&mut mask, 10, 10, 12, 9);
        let blobs = extract_blobs(&mask, 5);
        assert_eq!(blobs.len(), 1);
        let blob = &blobs[0];
        assert_eq!(blob.area, 108.0);
        assert_abs_diff_eq!(
            blob.equivalent_diameter,
            (4.0 * 108.0 / std::f64::consts::PI).sqrt(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_area_bounds_filter() {
        let mut mask = GrayImage::new(200, 100);
        draw_rect(&mut mask, 5, 5, 3, 3); // 9 px, below min_area
        draw_disk(&mut mask, 50, 50, 10.0);
        draw_rect(&mut mask, 100, 0, 90, 90); // 8100 px, above max_area

        let segmenter = Segmenter::new(&PipelineConfig::default());
        let blobs = segmenter.segment(&mask);
        assert_eq!(blobs.len(), 1);
        assert_abs_diff_eq!(blobs[0].centroid.0, 50.0, epsilon = 1e-9);
    }

    #[test]
    fn test_aspect_ratio_filter() {
        let mut mask = GrayImage::new(200, 50);
        draw_rect(&mut mask, 10, 10, 100, 5); // ratio ~20

        let segmenter = Segmenter::new(&PipelineConfig::default());
        assert!(segmenter.segment(&mask).is_empty());

        let relaxed = Segmenter::new(&PipelineConfig {
            max_aspect_ratio: 50.0,
            ..PipelineConfig::default()
        });
        assert_eq!(relaxed.segment(&mask).len(), 1);
    }

    #[test]
    fn test_degenerate_regions_dropped() {
        let mut mask = GrayImage::new(20, 20);
        mask.put_pixel(3, 3, Luma([255]));
        mask.put_pixel(12, 15, Luma([255]));
        assert!(extract_blobs(&mask, 5).is_empty());
    }

    #[test]
    fn test_diagonal_pixels_are_one_region() {
        let mut mask = GrayImage::new(30, 30);
        draw_rect(&mut mask, 2, 2, 6, 6);
        draw_rect(&mut mask, 8, 8, 6, 6);
        let blobs = extract_blobs(&mask, 5);
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].area, 72.0);
    }

    #[test]
    fn test_ring_area_excludes_hole() {
        let mut mask = GrayImage::new(60, 60);
        draw_disk(&mut mask, 30, 30, 15.0);
        let outer_area = extract_blobs(&mask, 5)[0].area;
        draw_disk_value(&mut mask, 30, 30, 5.0, 0);
        let blobs = extract_blobs(&mask, 5);
        assert_eq!(blobs.len(), 1);
        assert!(blobs[0].area < outer_area);
    }

    fn draw_disk_value(mask: &mut GrayImage, cx: i64, cy: i64, r: f64, value: u8) {
        let ri = r.ceil() as i64;
        for y in cy - ri..=cy + ri {
            for x in cx - ri..=cx + ri {
                let (dx, dy) = ((x - cx) as f64, (y - cy) as f64);
                if dx * dx + dy * dy <= r * r {
                    mask.put_pixel(x as u32, y as u32, Luma([value]));
                }
            }
        }
    }

    #[test]
    fn test_channel_band_filter() {
        let mut mask = GrayImage::new(200, 200);
        draw_disk(&mut mask, 50, 40, 6.0);
        draw_disk(&mut mask, 120, 150, 6.0);

        let segmenter = Segmenter::new(&PipelineConfig {
            channel_band: Some((20.0, 60.0)),
            channel_band_margin: 10.0,
            ..PipelineConfig::default()
        });
        let blobs = segmenter.segment(&mask);
        assert_eq!(blobs.len(), 1);
        assert_abs_diff_eq!(blobs[0].centroid.1, 40.0, epsilon = 1e-9);
    }

    #[test]
    fn test_empty_mask() {
        let mask = GrayImage::new(64, 64);
        assert!(Segmenter::new(&PipelineConfig::default())
            .segment(&mask)
            .is_empty());
    }
}
