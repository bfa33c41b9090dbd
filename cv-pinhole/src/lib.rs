//! This crate plugs into `cv-core` and provides the pinhole camera model used by sparse
//! reconstructions, with an optional two-coefficient radial distortion. It can convert image
//! coordinates into bearings pointing towards where the light came from, and project camera points
//! back into the image together with the Jacobian needed by the optimizers.

mod camera;
mod distortion;
mod root;

pub use camera::*;
pub use distortion::*;

use cv_core::nalgebra::{Matrix2, Matrix3, Point2, UnitVector3, Vector2};
use cv_core::{CameraPoint, ImagePoint, KeyPoint};
use derive_more::{AsMut, AsRef, Deref, DerefMut, From, Into};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// A point in normalized image coordinates, i.e. on the virtual image plane at depth `1.0`.
///
/// Depending on where it came from, the point may or may not include lens distortion. The
/// [`PinholeCamera`] methods say which one they produce.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, AsMut, AsRef, Deref, DerefMut, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct NormalizedKeyPoint(pub Point2<f64>);

impl NormalizedKeyPoint {
    /// Tries to convert the [`CameraPoint`] into a [`NormalizedKeyPoint`]. This fails for points
    /// on the plane of the optical center.
    pub fn from_camera_point(point: CameraPoint) -> Option<Self> {
        let z = point.depth();
        if z == 0.0 || !point.is_finite() {
            return None;
        }
        Some(Self(Point2::new(point.0.x / z, point.0.y / z)))
    }

    /// The unit bearing pointing through this location on the virtual image plane.
    pub fn bearing(self) -> UnitVector3<f64> {
        UnitVector3::new_normalize(self.0.coords.push(1.0))
    }
}

/// This contains intrinsic camera parameters as per
/// [this Wikipedia page](https://en.wikipedia.org/wiki/Camera_resectioning#Intrinsic_parameters).
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraIntrinsics {
    pub focals: Vector2<f64>,
    pub principal_point: Point2<f64>,
    pub skew: f64,
}

impl Default for CameraIntrinsics {
    fn default() -> Self {
        Self::identity()
    }
}

impl CameraIntrinsics {
    /// Creates camera intrinsics that would create an identity intrinsic matrix.
    pub fn identity() -> Self {
        Self {
            focals: Vector2::new(1.0, 1.0),
            skew: 0.0,
            principal_point: Point2::new(0.0, 0.0),
        }
    }

    #[must_use]
    pub fn focals(self, focals: Vector2<f64>) -> Self {
        Self { focals, ..self }
    }

    #[must_use]
    pub fn focal(self, focal: f64) -> Self {
        Self {
            focals: Vector2::new(focal, focal),
            ..self
        }
    }

    #[must_use]
    pub fn principal_point(self, principal_point: Point2<f64>) -> Self {
        Self {
            principal_point,
            ..self
        }
    }

    #[must_use]
    pub fn skew(self, skew: f64) -> Self {
        Self { skew, ..self }
    }

    #[rustfmt::skip]
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.focals.x,  self.skew,      self.principal_point.x,
            0.0,            self.focals.y,  self.principal_point.y,
            0.0,            0.0,            1.0,
        )
    }

    /// Jacobian of the pixel location in respect to the normalized location.
    #[rustfmt::skip]
    pub fn jacobian(&self) -> Matrix2<f64> {
        Matrix2::new(
            self.focals.x,  self.skew,
            0.0,            self.focals.y,
        )
    }

    /// Takes in a point from an image in pixel coordinates and removes the intrinsic matrix.
    ///
    /// ```
    /// use cv_core::KeyPoint;
    /// use cv_pinhole::CameraIntrinsics;
    /// use cv_core::nalgebra::{Vector2, Point2};
    /// let intrinsics = CameraIntrinsics {
    ///     focals: Vector2::new(800.0, 900.0),
    ///     principal_point: Point2::new(500.0, 600.0),
    ///     skew: 1.7,
    /// };
    /// let kp = KeyPoint(Point2::new(471.0, 322.0));
    /// let nkp = intrinsics.normalize(kp);
    /// let distance = (kp.to_homogeneous() - intrinsics.matrix() * nkp.to_homogeneous()).norm();
    /// assert!(distance < 0.1);
    /// ```
    pub fn normalize<P>(&self, point: P) -> NormalizedKeyPoint
    where
        P: ImagePoint,
    {
        let centered = point.image_point() - self.principal_point;
        let y = centered.y / self.focals.y;
        let x = (centered.x - self.skew * y) / self.focals.x;
        NormalizedKeyPoint(Point2::new(x, y))
    }

    /// Converts a [`NormalizedKeyPoint`] back into pixel coordinates.
    pub fn denormalize(&self, projection: NormalizedKeyPoint) -> KeyPoint {
        let y = projection.y * self.focals.y;
        let x = projection.x * self.focals.x + self.skew * projection.y;
        KeyPoint(Point2::new(x, y) + self.principal_point.coords)
    }
}
