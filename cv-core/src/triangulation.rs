use crate::{WorldPoint, WorldToCamera};
use nalgebra::UnitVector3;

/// This trait is for algorithms which allow you to triangulate a point from two or more observances.
/// Each observance is a [`WorldToCamera`] and the bearing of the observation in that camera.
pub trait TriangulatorObservations {
    fn triangulate_observations(
        &self,
        pairs: impl IntoIterator<Item = (WorldToCamera, UnitVector3<f64>)>,
    ) -> Option<WorldPoint>;
}
