//! Region moments and axis fitting

use crate::types::{AxisFit, BoundingBox};
use nalgebra::Matrix2;

/// Raw image moments of a pixel region, accumulated one pixel at a time
#[derive(Debug, Clone, Default)]
pub struct RegionMoments {
    m00: f64,
    m10: f64,
    m01: f64,
    m20: f64,
    m11: f64,
    m02: f64,
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
}

impl RegionMoments {
    pub fn add(&mut self, x: u32, y: u32) {
        if self.m00 == 0.0 {
            self.min_x = x;
            self.max_x = x;
            self.min_y = y;
            self.max_y = y;
        } else {
            self.min_x = self.min_x.min(x);
            self.max_x = self.max_x.max(x);
            self.min_y = self.min_y.min(y);
            self.max_y = self.max_y.max(y);
        }

        let (xf, yf) = (x as f64, y as f64);
        self.m00 += 1.0;
        self.m10 += xf;
        self.m01 += yf;
        self.m20 += xf * xf;
        self.m11 += xf * yf;
        self.m02 += yf * yf;
    }

    /// Pixel count
    pub fn area(&self) -> f64 {
        self.m00
    }

    pub fn centroid(&self) -> (f64, f64) {
        if self.m00 == 0.0 {
            return (0.0, 0.0);
        }
        (self.m10 / self.m00, self.m01 / self.m00)
    }

    /// Normalised second central moments (mu20, mu11, mu02)
    pub fn central(&self) -> (f64, f64, f64) {
        if self.m00 == 0.0 {
            return (0.0, 0.0, 0.0);
        }
        let (cx, cy) = self.centroid();
        (
            self.m20 / self.m00 - cx * cx,
            self.m11 / self.m00 - cx * cy,
            self.m02 / self.m00 - cy * cy,
        )
    }

    pub fn bbox(&self) -> BoundingBox {
        BoundingBox {
            x: self.min_x,
            y: self.min_y,
            width: self.max_x - self.min_x + 1,
            height: self.max_y - self.min_y + 1,
        }
    }
}

/// Diameter of the circle with the given area
pub fn equivalent_diameter(area: f64) -> f64 {
    (4.0 * area.max(0.0) / std::f64::consts::PI).sqrt()
}

/// Full axis lengths of the moment-equivalent ellipse, major first.
/// `None` when the covariance is degenerate (a line or a point).
pub fn ellipse_axes(moments: &RegionMoments) -> Option<(f64, f64)> {
    let (mu20, mu11, mu02) = moments.central();
    let cov = Matrix2::new(mu20, mu11, mu11, mu02);
    let eigen = cov.symmetric_eigen();
    let (a, b) = (eigen.eigenvalues[0], eigen.eigenvalues[1]);
    let (l1, l2) = if a >= b { (a, b) } else { (b, a) };

    if !l1.is_finite() || !l2.is_finite() || l2 <= f64::EPSILON {
        return None;
    }
    Some((4.0 * l1.sqrt(), 4.0 * l2.sqrt()))
}

/// Major/minor axes from the ellipse fit, or the bounding box when the
/// contour is too short or the fit degenerates
pub fn fit_axes(
    moments: &RegionMoments,
    contour_points: usize,
    min_contour_points: usize,
) -> (f64, f64, AxisFit) {
    if contour_points >= min_contour_points {
        if let Some((major, minor)) = ellipse_axes(moments) {
            return (major, minor, AxisFit::Ellipse);
        }
    }
    let bbox = moments.bbox();
    let (w, h) = (bbox.width as f64, bbox.height as f64);
    (w.max(h), w.min(h), AxisFit::BoundingBox)
}

/// major / minor, infinite for a zero minor axis
pub fn aspect_ratio(major: f64, minor: f64) -> f64 {
    if minor > 0.0 {
        major / minor
    } else {
        f64::INFINITY
    }
}
