use crate::{CameraPoint, Skew3, WorldPoint};
use derive_more::{AsMut, AsRef, From, Into};
use nalgebra::{
    IsometryMatrix3, Matrix3, Matrix3x6, Point3, Rotation3, UnitQuaternion, Vector3, Vector6,
};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// This trait is implemented by the poses in this library:
///
/// * [`WorldToCamera`] - Transforms [`WorldPoint`] into [`CameraPoint`]
/// * [`CameraToWorld`] - Transforms [`CameraPoint`] into [`WorldPoint`]
pub trait Pose: From<IsometryMatrix3<f64>> + Clone + Copy {
    type Inverse: Pose;

    /// Retrieve the isometry.
    fn isometry(self) -> IsometryMatrix3<f64>;

    /// Creates a pose with no change in position or orientation.
    fn identity() -> Self {
        IsometryMatrix3::identity().into()
    }

    /// Takes the inverse of the pose.
    fn inverse(self) -> Self::Inverse {
        self.isometry().inverse().into()
    }

    /// Create the pose from rotation and translation.
    fn from_parts(translation: Vector3<f64>, rotation: Rotation3<f64>) -> Self {
        IsometryMatrix3::from_parts(translation.into(), rotation).into()
    }

    /// Retrieve the se(3) representation of the pose (translation before rotation).
    fn se3(self) -> Vector6<f64> {
        let isometry = self.isometry();
        let t = isometry.translation.vector;
        let r: Skew3 = isometry.rotation.into();
        Vector6::new(t.x, t.y, t.z, r.x, r.y, r.z)
    }

    /// Create the pose from its se(3) representation (translation before rotation).
    fn from_se3(se3: Vector6<f64>) -> Self {
        let translation = se3.xyz();
        let rotation = Skew3(Vector3::new(se3[3], se3[4], se3[5])).into();
        Self::from_parts(translation, rotation)
    }

    /// Applies a small se(3) increment `[translation, rotation]` on the left of the pose.
    ///
    /// This is the update rule used by the optimizers: `exp(delta) * self`.
    #[must_use]
    fn increment_left(self, delta: Vector6<f64>) -> Self {
        let rotation: Rotation3<f64> = Skew3(Vector3::new(delta[3], delta[4], delta[5])).into();
        let isometry = self.isometry();
        let translation = rotation * isometry.translation.vector + delta.xyz();
        IsometryMatrix3::from_parts(translation.into(), rotation * isometry.rotation).into()
    }
}

/// The pose of the world relative to the camera.
///
/// This maps [`WorldPoint`] into [`CameraPoint`], changing an absolute position into a vector
/// relative to the camera. It is the representation stored in sparse reconstruction files.
#[derive(Debug, Clone, Copy, PartialEq, AsMut, AsRef, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct WorldToCamera(pub IsometryMatrix3<f64>);

impl Pose for WorldToCamera {
    type Inverse = CameraToWorld;

    #[inline(always)]
    fn isometry(self) -> IsometryMatrix3<f64> {
        self.0
    }
}

impl WorldToCamera {
    /// Creates the pose from a rotation quaternion and a translation, both mapping world
    /// coordinates to camera coordinates.
    pub fn from_quaternion_translation(
        rotation: UnitQuaternion<f64>,
        translation: Vector3<f64>,
    ) -> Self {
        Self::from_parts(translation, rotation.to_rotation_matrix())
    }

    /// Retrieves the rotation as a unit quaternion.
    pub fn quaternion(self) -> UnitQuaternion<f64> {
        UnitQuaternion::from_rotation_matrix(&self.0.rotation)
    }

    /// Retrieves the translation component.
    pub fn translation(self) -> Vector3<f64> {
        self.0.translation.vector
    }

    /// The position of the optical center of the camera in world coordinates.
    pub fn optical_center(self) -> WorldPoint {
        WorldPoint(self.0.inverse_transform_point(&Point3::origin()))
    }

    /// Transforms a world point into the camera frame.
    #[inline(always)]
    pub fn transform(self, point: WorldPoint) -> CameraPoint {
        CameraPoint(self.0 * point.0)
    }

    /// Transforms a world point into the camera frame and also retrieves both Jacobians.
    ///
    /// The following things are returned in this order:
    ///
    /// * The camera point
    /// * The Jacobian of the camera point in respect to the world point
    /// * The Jacobian of the camera point in respect to a left se(3) increment of the pose
    ///   (translation components before rotation components)
    pub fn transform_jacobians(self, point: WorldPoint) -> (CameraPoint, Matrix3<f64>, Matrix3x6<f64>) {
        let camera = self.transform(point);
        let jacobian_point = *self.0.rotation.matrix();
        let mut jacobian_pose = Matrix3x6::zeros();
        jacobian_pose
            .fixed_columns_mut::<3>(0)
            .copy_from(&Matrix3::identity());
        jacobian_pose
            .fixed_columns_mut::<3>(3)
            .copy_from(&-Skew3::jacobian_self(camera.0.coords));
        (camera, jacobian_point, jacobian_pose)
    }
}

/// The pose of the camera relative to the world.
///
/// This transforms camera points (with depth as `z`) into world coordinates and tells you where the
/// camera is located and oriented in the world.
#[derive(Debug, Clone, Copy, PartialEq, AsMut, AsRef, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraToWorld(pub IsometryMatrix3<f64>);

impl Pose for CameraToWorld {
    type Inverse = WorldToCamera;

    #[inline(always)]
    fn isometry(self) -> IsometryMatrix3<f64> {
        self.0
    }
}

impl CameraToWorld {
    /// Transforms a camera point into the world frame.
    #[inline(always)]
    pub fn transform(self, point: CameraPoint) -> WorldPoint {
        WorldPoint(self.0 * point.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn some_pose() -> WorldToCamera {
        WorldToCamera::from_parts(
            Vector3::new(0.3, -0.2, 1.5),
            Rotation3::from_euler_angles(0.1, -0.3, 0.2),
        )
    }

    #[test]
    fn se3_round_trip() {
        let pose = some_pose();
        let back = WorldToCamera::from_se3(pose.se3());
        assert_relative_eq!(pose.0, back.0, epsilon = 1e-12);
    }

    #[test]
    fn optical_center_maps_to_origin() {
        let pose = some_pose();
        let center = pose.transform(pose.optical_center());
        assert_relative_eq!(center.0.coords, Vector3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn pose_jacobian_matches_finite_differences() {
        let pose = some_pose();
        let point = WorldPoint::new(0.4, 0.7, 3.0);
        let (camera, jacobian_point, jacobian_pose) = pose.transform_jacobians(point);
        let h = 1e-6;
        for i in 0..6 {
            let mut delta = Vector6::zeros();
            delta[i] = h;
            let moved = pose.increment_left(delta).transform(point);
            let numeric = (moved.0 - camera.0) / h;
            assert_relative_eq!(numeric, jacobian_pose.column(i).into_owned(), epsilon = 1e-4);
        }
        for i in 0..3 {
            let mut moved = point;
            moved.0[i] += h;
            let numeric = (pose.transform(moved).0 - camera.0) / h;
            assert_relative_eq!(numeric, jacobian_point.column(i).into_owned(), epsilon = 1e-4);
        }
    }

    #[test]
    fn quaternion_round_trip() {
        let pose = some_pose();
        let back = WorldToCamera::from_quaternion_translation(pose.quaternion(), pose.translation());
        assert_relative_eq!(pose.0, back.0, epsilon = 1e-12);
    }
}
