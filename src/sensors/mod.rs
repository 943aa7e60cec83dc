//! Camera sensor model shared by the estimator and the simulation.

use nalgebra::{Vector2, Vector3};
use serde::Deserialize;

/// Pinhole intrinsics with radial-tangential distortion.
///
/// `f` is the focal length in meters and `pixel_size` converts it to the
/// pixel focal lengths `f_x`/`f_y`.
#[derive(Debug, Clone, Deserialize)]
pub struct Intrinsics {
    #[serde(default = "default_focal")]
    pub f: f64,
    #[serde(default)]
    pub c_x: f64,
    #[serde(default)]
    pub c_y: f64,
    #[serde(default)]
    pub k_1: f64,
    #[serde(default)]
    pub k_2: f64,
    #[serde(default)]
    pub p_1: f64,
    #[serde(default)]
    pub p_2: f64,
    #[serde(default = "default_pixel_size")]
    pub pixel_size: f64,
    #[serde(default = "default_width")]
    pub width: f64,
    #[serde(default = "default_height")]
    pub height: f64,
}

fn default_focal() -> f64 {
    1.0
}

fn default_pixel_size() -> f64 {
    1e-2
}

fn default_width() -> f64 {
    640.0
}

fn default_height() -> f64 {
    480.0
}

impl Default for Intrinsics {
    fn default() -> Self {
        Self {
            f: 1.0,
            c_x: 0.0,
            c_y: 0.0,
            k_1: 0.0,
            k_2: 0.0,
            p_1: 0.0,
            p_2: 0.0,
            pixel_size: 1e-2,
            width: 640.0,
            height: 480.0,
        }
    }
}

impl Intrinsics {
    pub fn f_x(&self) -> f64 {
        self.f / self.pixel_size
    }

    pub fn f_y(&self) -> f64 {
        self.f / self.pixel_size
    }

    /// Applies the radial-tangential distortion model to normalized
    /// coordinates.
    fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let radial = 1.0 + self.k_1 * r2 + self.k_2 * r2 * r2;
        let x_d = x * radial + 2.0 * self.p_1 * x * y + self.p_2 * (r2 + 2.0 * x * x);
        let y_d = y * radial + self.p_1 * (r2 + 2.0 * y * y) + 2.0 * self.p_2 * x * y;
        (x_d, y_d)
    }

    /// Projects a camera-frame point to pixel coordinates. Points at or
    /// behind the image plane return `None`.
    pub fn project(&self, point: &Vector3<f64>) -> Option<Vector2<f64>> {
        if point.z <= 0.0 {
            return None;
        }
        let (x_d, y_d) = self.distort(point.x / point.z, point.y / point.z);
        Some(Vector2::new(
            self.f_x() * x_d + self.c_x,
            self.f_y() * y_d + self.c_y,
        ))
    }

    /// Inverts projection and distortion back to normalized coordinates via
    /// fixed-point iteration; converges in a few steps for the mild
    /// distortions this model targets.
    pub fn undistort(&self, pixel: &Vector2<f64>) -> Vector2<f64> {
        let x_d = (pixel.x - self.c_x) / self.f_x();
        let y_d = (pixel.y - self.c_y) / self.f_y();

        let mut x = x_d;
        let mut y = y_d;
        for _ in 0..8 {
            let (x_p, y_p) = self.distort(x, y);
            x += x_d - x_p;
            y += y_d - y_p;
        }
        Vector2::new(x, y)
    }

    /// True when the pixel falls inside the image bounds.
    pub fn in_frame(&self, pixel: &Vector2<f64>) -> bool {
        pixel.x >= 0.0 && pixel.y >= 0.0 && pixel.x < self.width && pixel.y < self.height
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn distorted_intrinsics() -> Intrinsics {
        Intrinsics {
            f: 0.01,
            c_x: 320.0,
            c_y: 240.0,
            k_1: -0.05,
            k_2: 0.01,
            p_1: 1e-4,
            p_2: -2e-4,
            pixel_size: 1e-5,
            width: 640.0,
            height: 480.0,
        }
    }

    #[test]
    fn test_project_center() {
        let intrinsics = distorted_intrinsics();
        let pixel = intrinsics.project(&Vector3::new(0.0, 0.0, 2.0)).unwrap();

        assert_relative_eq!(pixel.x, 320.0, epsilon = 1e-9);
        assert_relative_eq!(pixel.y, 240.0, epsilon = 1e-9);
    }

    #[test]
    fn test_project_rejects_behind_camera() {
        let intrinsics = distorted_intrinsics();
        assert!(intrinsics.project(&Vector3::new(0.1, 0.1, -1.0)).is_none());
        assert!(intrinsics.project(&Vector3::new(0.1, 0.1, 0.0)).is_none());
    }

    #[test]
    fn test_undistort_inverts_project() {
        let intrinsics = distorted_intrinsics();
        let point = Vector3::new(0.3, -0.2, 2.0);

        let pixel = intrinsics.project(&point).unwrap();
        let normalized = intrinsics.undistort(&pixel);

        assert_relative_eq!(normalized.x, point.x / point.z, epsilon = 1e-9);
        assert_relative_eq!(normalized.y, point.y / point.z, epsilon = 1e-9);
    }

    #[test]
    fn test_in_frame_bounds() {
        let intrinsics = distorted_intrinsics();
        assert!(intrinsics.in_frame(&Vector2::new(0.0, 0.0)));
        assert!(intrinsics.in_frame(&Vector2::new(639.0, 479.0)));
        assert!(!intrinsics.in_frame(&Vector2::new(640.0, 100.0)));
        assert!(!intrinsics.in_frame(&Vector2::new(-1.0, 100.0)));
    }
}
