//! Frame-difference artifact rejection
//!
//! Stateless alternative to the tracking rejector: a blob counts as moving
//! when the intensity under its centroid changed by more than a threshold
//! since the previous frame. Only the previous grayscale frame is kept.

use droptrack::Locate;
use image::GrayImage;

#[derive(Debug, Clone)]
pub struct FrameDiffRejector {
    threshold: u8,
    previous: Option<GrayImage>,
}

impl FrameDiffRejector {
    pub fn new(threshold: u8) -> Self {
        Self {
            threshold,
            previous: None,
        }
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: u8) {
        self.threshold = threshold;
    }

    pub fn has_reference(&self) -> bool {
        self.previous.is_some()
    }

    /// Forget the previous frame; the next call accepts every blob
    pub fn reset(&mut self) {
        self.previous = None;
    }

    /// Keep blobs whose centroid pixel differs from the previous frame by
    /// more than the threshold. Without a previous frame of the same shape
    /// every blob passes. `gray` becomes the reference for the next call.
    pub fn filter<T: Locate>(&mut self, blobs: Vec<T>, gray: &GrayImage) -> Vec<T> {
        let kept = match self.previous.as_ref() {
            Some(previous) if previous.dimensions() == gray.dimensions() => {
                let (width, height) = gray.dimensions();
                let before = blobs.len();
                let kept: Vec<T> = blobs
                    .into_iter()
                    .filter(|blob| {
                        let (cx, cy) = blob.centroid();
                        if cx < 0.0 || cy < 0.0 {
                            return false;
                        }
                        let (x, y) = (cx as u32, cy as u32);
                        if x >= width || y >= height {
                            return false;
                        }
                        let now = gray.get_pixel(x, y)[0];
                        let then = previous.get_pixel(x, y)[0];
                        now.abs_diff(then) > self.threshold
                    })
                    .collect();
                log::trace!(
                    "Frame difference kept {}/{} blobs (threshold {})",
                    kept.len(),
                    before,
                    self.threshold
                );
                kept
            }
            Some(previous) => {
                log::debug!(
                    "Frame difference reference {:?} does not match {:?}, accepting all blobs",
                    previous.dimensions(),
                    gray.dimensions()
                );
                blobs
            }
            None => blobs,
        };
        self.previous = Some(gray.clone());
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_square(x0: u32, y0: u32) -> GrayImage {
        let mut img = GrayImage::from_pixel(40, 40, image::Luma([20]));
        for y in y0..y0 + 6 {
            for x in x0..x0 + 6 {
                img.put_pixel(x, y, image::Luma([200]));
            }
        }
        img
    }

    #[test]
    fn test_first_frame_accepts_everything() {
        let mut rejector = FrameDiffRejector::new(30);
        assert!(!rejector.has_reference());
        let kept = rejector.filter(vec![(12.5, 12.5), (30.0, 30.0)], &frame_with_square(10, 10));
        assert_eq!(kept.len(), 2);
        assert!(rejector.has_reference());
    }

    #[test]
    fn test_static_blob_dropped_moving_blob_kept() {
        let mut rejector = FrameDiffRejector::new(30);
        let mut first = frame_with_square(5, 5);
        for y in 25..31 {
            for x in 25..31 {
                first.put_pixel(x, y, image::Luma([200]));
            }
        }
        rejector.filter(Vec::<(f64, f64)>::new(), &first);

        // Square at (5, 5) moved to (12, 5); the one at (25, 25) stayed
        let mut second = frame_with_square(12, 5);
        for y in 25..31 {
            for x in 25..31 {
                second.put_pixel(x, y, image::Luma([200]));
            }
        }
        let kept = rejector.filter(vec![(14.5, 7.5), (27.5, 27.5)], &second);
        assert_eq!(kept, vec![(14.5, 7.5)]);
    }

    #[test]
    fn test_difference_must_exceed_threshold() {
        let mut rejector = FrameDiffRejector::new(30);
        rejector.filter(Vec::<(f64, f64)>::new(), &GrayImage::from_pixel(8, 8, image::Luma([100])));
        let kept = rejector.filter(vec![(4.0, 4.0)], &GrayImage::from_pixel(8, 8, image::Luma([130])));
        assert!(kept.is_empty());
        let kept = rejector.filter(vec![(4.0, 4.0)], &GrayImage::from_pixel(8, 8, image::Luma([161])));
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn test_shape_change_and_reset_accept_all() {
        let mut rejector = FrameDiffRejector::new(30);
        rejector.filter(Vec::<(f64, f64)>::new(), &GrayImage::new(8, 8));
        let kept = rejector.filter(vec![(2.0, 2.0)], &GrayImage::new(16, 16));
        assert_eq!(kept.len(), 1);

        rejector.reset();
        assert!(!rejector.has_reference());
        let kept = rejector.filter(vec![(2.0, 2.0)], &GrayImage::new(16, 16));
        assert_eq!(kept.len(), 1);

        // Same frame again: nothing changed
        let kept = rejector.filter(vec![(2.0, 2.0)], &GrayImage::new(16, 16));
        assert!(kept.is_empty());
    }
}
