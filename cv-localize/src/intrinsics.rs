use crate::Error;
use cv_core::nalgebra::{Point2, Point3, UnitVector3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// The number of fixed-point iterations used to invert the radial distortion.
const UNDISTORT_ITERATIONS: usize = 20;

/// Pinhole intrinsics with three radial distortion coefficients (K1, K2, K3).
///
/// Pixel coordinates have X pointing right and Y pointing down, the same as the bearings
/// produced by [`Intrinsics::calibrate`], whose Z axis points forwards out of the camera.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    /// The focal lengths in pixels along X and Y.
    pub focals: [f64; 2],
    /// The optical center in pixels.
    pub principal_point: [f64; 2],
    #[serde(default)]
    pub skew: f64,
    /// Radial distortion coefficients `[k1, k2, k3]`.
    #[serde(default)]
    pub radial: [f64; 3],
}

impl Intrinsics {
    /// Distortion-free intrinsics with a single focal length.
    pub fn new(focal: f64, principal_point: [f64; 2]) -> Self {
        Self {
            focals: [focal, focal],
            principal_point,
            skew: 0.0,
            radial: [0.0; 3],
        }
    }

    /// A guess used for frames that come without calibration.
    ///
    /// The focal length is taken as 1.2 times the largest image dimension, which matches
    /// the field of view of most consumer cameras, and the principal point is the image center.
    pub fn guess(width: u32, height: u32) -> Self {
        let focal = 1.2 * f64::from(width.max(height));
        Self::new(focal, [f64::from(width) * 0.5, f64::from(height) * 0.5])
    }

    /// Loads intrinsics from a JSON calibration file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| Error::CalibrationIo {
            path: path.to_owned(),
            source,
        })?;
        let intrinsics: Self =
            serde_json::from_str(&text).map_err(|source| Error::CalibrationJson {
                path: path.to_owned(),
                source,
            })?;
        if !intrinsics.is_valid() {
            return Err(Error::Calibration {
                path: path.to_owned(),
                reason: format!(
                    "focal lengths must be positive and finite, got {:?}",
                    intrinsics.focals
                ),
            });
        }
        Ok(intrinsics)
    }

    pub fn is_valid(&self) -> bool {
        self.focals.iter().all(|f| f.is_finite() && *f > 0.0)
            && self
                .principal_point
                .iter()
                .chain(self.radial.iter())
                .chain(core::iter::once(&self.skew))
                .all(|n| n.is_finite())
    }

    /// Returns a copy with both focal lengths multiplied by `scale`.
    #[must_use]
    pub fn scale_focals(self, scale: f64) -> Self {
        Self {
            focals: [self.focals[0] * scale, self.focals[1] * scale],
            ..self
        }
    }

    fn radial_factor(&self, point: Vector2<f64>) -> f64 {
        let [k1, k2, k3] = self.radial;
        let r2 = point.norm_squared();
        1.0 + r2 * (k1 + r2 * (k2 + r2 * k3))
    }

    /// Applies radial distortion to a point on the virtual image plane.
    pub fn distort(&self, point: Vector2<f64>) -> Vector2<f64> {
        point * self.radial_factor(point)
    }

    /// Removes radial distortion from a point on the virtual image plane.
    pub fn undistort(&self, distorted: Vector2<f64>) -> Vector2<f64> {
        if self.radial == [0.0; 3] {
            return distorted;
        }
        let mut point = distorted;
        for _ in 0..UNDISTORT_ITERATIONS {
            point = distorted / self.radial_factor(point);
        }
        point
    }

    /// Projects a point in camera coordinates into pixel coordinates.
    ///
    /// Returns `None` when the point is not in front of the camera.
    pub fn project(&self, point: Point3<f64>) -> Option<Point2<f64>> {
        if !(point.z > f64::EPSILON) {
            return None;
        }
        let distorted = self.distort(Vector2::new(point.x / point.z, point.y / point.z));
        let [fx, fy] = self.focals;
        let [cx, cy] = self.principal_point;
        Some(Point2::new(
            fx * distorted.x + self.skew * distorted.y + cx,
            fy * distorted.y + cy,
        ))
    }

    /// Computes the bearing out of the camera for a pixel.
    pub fn calibrate(&self, pixel: Point2<f64>) -> UnitVector3<f64> {
        let [fx, fy] = self.focals;
        let [cx, cy] = self.principal_point;
        let y = (pixel.y - cy) / fy;
        let x = (pixel.x - cx - self.skew * y) / fx;
        let normalized = self.undistort(Vector2::new(x, y));
        UnitVector3::new_normalize(Vector3::new(normalized.x, normalized.y, 1.0))
    }
}
