use crate::{CameraPoint, ImagePoint, KeyPoint};
use nalgebra::{Matrix2x3, UnitVector3};

/// Allows conversion between the point on an image and the bearing of the projection out of the
/// camera.
pub trait CameraModel {
    /// Extracts a bearing from a pixel location in an image.
    ///
    /// The bearings X axis points right, Y axis points down, and Z axis points forwards.
    /// The image point uses the same coordinate frame. Its Y is down and its X is right.
    fn calibrate<P>(&self, point: P) -> UnitVector3<f64>
    where
        P: ImagePoint;

    /// Extracts the pixel location in the image from the bearing.
    ///
    /// Since this might not be possible (if bearing is behind camera for pinhole camera),
    /// this operation is fallible.
    fn uncalibrate(&self, bearing: UnitVector3<f64>) -> Option<KeyPoint>;

    /// Projects a point in camera space into the image and computes the Jacobian of the pixel
    /// location in respect to the camera point.
    ///
    /// Returns `None` when the point is not in front of the camera.
    fn project_jacobian(&self, point: CameraPoint) -> Option<(KeyPoint, Matrix2x3<f64>)>;

    /// Projects a point in camera space into the image.
    fn project(&self, point: CameraPoint) -> Option<KeyPoint> {
        self.project_jacobian(point).map(|(keypoint, _)| keypoint)
    }
}
