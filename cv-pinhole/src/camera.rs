use crate::{CameraIntrinsics, NormalizedKeyPoint, RadialDistortion};
use cv_core::nalgebra::{Matrix2x3, UnitVector3};
use cv_core::{CameraModel, CameraPoint, ImagePoint, KeyPoint};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Pinhole camera with radial lens distortion applied on the normalized image plane.
///
/// This covers the `SIMPLE_PINHOLE`, `PINHOLE`, `SIMPLE_RADIAL` and `RADIAL` models of sparse
/// reconstruction files.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct PinholeCamera {
    pub intrinsics: CameraIntrinsics,
    pub distortion: RadialDistortion,
}

impl PinholeCamera {
    pub fn new(intrinsics: CameraIntrinsics, distortion: RadialDistortion) -> Self {
        Self {
            intrinsics,
            distortion,
        }
    }

    /// A camera with no lens distortion.
    pub fn undistorted(intrinsics: CameraIntrinsics) -> Self {
        Self::new(intrinsics, RadialDistortion::default())
    }
}

impl CameraModel for PinholeCamera {
    /// If the distortion cannot be inverted at this location the distorted bearing is returned.
    fn calibrate<P>(&self, point: P) -> UnitVector3<f64>
    where
        P: ImagePoint,
    {
        let distorted = self.intrinsics.normalize(point);
        self.distortion
            .undistort(distorted)
            .unwrap_or(distorted)
            .bearing()
    }

    fn uncalibrate(&self, bearing: UnitVector3<f64>) -> Option<KeyPoint> {
        if bearing.z <= 0.0 {
            return None;
        }
        let point = NormalizedKeyPoint::from_camera_point(CameraPoint(bearing.into_inner().into()))?;
        Some(self.intrinsics.denormalize(self.distortion.distort(point)))
    }

    fn project_jacobian(&self, point: CameraPoint) -> Option<(KeyPoint, Matrix2x3<f64>)> {
        let z = point.depth();
        if z <= 0.0 {
            return None;
        }
        let normalized = NormalizedKeyPoint::from_camera_point(point)?;
        let (x, y) = (point.0.x, point.0.y);
        let inv_z = 1.0 / z;
        #[rustfmt::skip]
        let jacobian_normalized = Matrix2x3::new(
            inv_z,  0.0,    -x * inv_z * inv_z,
            0.0,    inv_z,  -y * inv_z * inv_z,
        );
        let keypoint = self
            .intrinsics
            .denormalize(self.distortion.distort(normalized));
        let jacobian =
            self.intrinsics.jacobian() * self.distortion.jacobian(normalized) * jacobian_normalized;
        Some((keypoint, jacobian))
    }
}
