use derive_more::{AsMut, AsRef, Deref, DerefMut, From, Into};
use nalgebra::{Point3, Unit, Vector3};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// A 3d point relative to the optical center and orientation of a camera.
///
/// The positive X axis is right, positive Y axis is down, and positive Z axis is forwards.
/// The unit of distance is the unit of the reconstruction the camera belongs to.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, AsMut, AsRef, Deref, DerefMut, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraPoint(pub Point3<f64>);

impl CameraPoint {
    /// Retrieve the normalized bearing of the point out of the optical center.
    pub fn bearing(self) -> Unit<Vector3<f64>> {
        Unit::new_normalize(self.0.coords)
    }

    /// Depth of the point along the optical axis.
    ///
    /// A point is in front of the camera (satisfies cheirality) when this is positive.
    pub fn depth(self) -> f64 {
        self.0.z
    }

    /// Returns `true` if every coordinate is finite.
    pub fn is_finite(self) -> bool {
        self.0.iter().all(|n| n.is_finite())
    }
}

/// A point in the world frame of a reconstruction.
///
/// The real-world scale of a reconstruction is unknown: the whole world can be scaled by any factor
/// and every observation stays identical. Tracks, camera centers, and translations all share this
/// arbitrary unit.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, AsMut, AsRef, Deref, DerefMut, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct WorldPoint(pub Point3<f64>);

impl WorldPoint {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self(Point3::new(x, y, z))
    }

    /// Returns `true` if every coordinate is finite.
    pub fn is_finite(self) -> bool {
        self.0.iter().all(|n| n.is_finite())
    }
}
