use derive_more::{AsMut, AsRef, Deref, DerefMut, From, Into};
use nalgebra::{Point2, Vector2};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Allows the retrieval of the point on the image the feature came from.
pub trait ImagePoint {
    /// Retrieves the point on the image
    fn image_point(&self) -> Point2<f64>;
}

/// A point on an image frame in pixel coordinates.
///
/// The keypoint is neither undistorted nor normalized. The center of the top-left pixel is at
/// `(0.5, 0.5)` like in COLMAP models.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, AsMut, AsRef, Deref, DerefMut, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct KeyPoint(pub Point2<f64>);

impl KeyPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self(Point2::new(x, y))
    }

    /// Euclidean distance in pixels to another keypoint.
    pub fn distance(self, other: KeyPoint) -> f64 {
        (self.0 - other.0).norm()
    }

    /// Moves the keypoint by a pixel offset.
    #[must_use]
    pub fn offset(self, delta: Vector2<f64>) -> Self {
        Self(self.0 + delta)
    }

    pub fn is_finite(self) -> bool {
        self.0.x.is_finite() && self.0.y.is_finite()
    }
}

impl ImagePoint for KeyPoint {
    fn image_point(&self) -> Point2<f64> {
        self.0
    }
}

impl ImagePoint for Point2<f64> {
    fn image_point(&self) -> Point2<f64> {
        *self
    }
}
