use cv_core::{
    nalgebra::{zero, Matrix3x4, Matrix4, UnitVector3},
    Pose, TriangulatorObservations, WorldPoint, WorldToCamera,
};
use float_ord::FloatOrd;

/// Referred to as the Linear-Eigen method by Hartley and Sturm in the paper
/// ["Triangulation"](https://users.cecs.anu.edu.au/~hartley/Papers/triangulation/triangulation.pdf).
///
/// Each observation contributes the component of the transformed homogeneous point that is
/// orthogonal to its bearing. Summing the normal equations of every observation gives a 4x4
/// symmetric matrix whose eigenvector of smallest eigenvalue is the homogeneous point. The method is
/// linear and scales to any number of observations, but it does not minimize the reprojection error
/// in pixels, so its output is meant as the initial guess for bundle adjustment.
///
/// ```
/// use cv_core::nalgebra::{Vector3, Rotation3};
/// use cv_core::{TriangulatorObservations, WorldToCamera, WorldPoint, Pose};
/// use cv_geom::triangulation::LinearEigenTriangulator;
///
/// let point = WorldPoint::new(0.3, 0.1, 2.0);
/// let a = WorldToCamera::identity();
/// let b = WorldToCamera::from_parts(Vector3::new(0.1, 0.1, 0.1), Rotation3::new(Vector3::new(0.1, 0.1, 0.1)));
/// let triangulated = LinearEigenTriangulator::new()
///     .triangulate_observations([(a, a.transform(point).bearing()), (b, b.transform(point).bearing())])
///     .unwrap();
/// assert!((point.0 - triangulated.0).norm() < 1e-6);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, PartialOrd)]
pub struct LinearEigenTriangulator {
    epsilon: f64,
    max_iterations: usize,
}

impl LinearEigenTriangulator {
    /// Creates a `LinearEigenTriangulator` with default values.
    ///
    /// Same as calling [`Default::default`].
    pub fn new() -> Self {
        Default::default()
    }

    /// Set the epsilon used in the symmetric eigen solver.
    ///
    /// Default is `1e-12`.
    #[must_use]
    pub fn epsilon(self, epsilon: f64) -> Self {
        Self { epsilon, ..self }
    }

    /// Set the maximum number of iterations for the symmetric eigen solver.
    ///
    /// Default is `1000`.
    #[must_use]
    pub fn max_iterations(self, max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..self
        }
    }
}

impl Default for LinearEigenTriangulator {
    fn default() -> Self {
        Self {
            epsilon: 1e-12,
            max_iterations: 1000,
        }
    }
}

impl TriangulatorObservations for LinearEigenTriangulator {
    /// Returns `None` for fewer than two observations, for points at infinity, and for points
    /// that end up behind any of the cameras.
    fn triangulate_observations(
        &self,
        pairs: impl IntoIterator<Item = (WorldToCamera, UnitVector3<f64>)>,
    ) -> Option<WorldPoint> {
        let pairs: Vec<(WorldToCamera, UnitVector3<f64>)> = pairs.into_iter().collect();
        if pairs.len() < 2 {
            return None;
        }

        let mut a: Matrix4<f64> = zero();
        for &(pose, bearing) in &pairs {
            let bearing = bearing.into_inner();
            let rot = pose.0.rotation.matrix();
            let trans = pose.0.translation.vector;
            let pose = Matrix3x4::<f64>::from_columns(&[
                rot.column(0),
                rot.column(1),
                rot.column(2),
                trans.column(0),
            ]);
            let term = pose - bearing * bearing.transpose() * pose;
            a += term.transpose() * term;
        }

        let se = a.try_symmetric_eigen(self.epsilon, self.max_iterations)?;

        // The null space of `a` holds the homogeneous point.
        let homogeneous = se
            .eigenvalues
            .iter()
            .enumerate()
            .min_by_key(|&(_, &n)| FloatOrd(n))
            .map(|(ix, _)| se.eigenvectors.column(ix).into_owned())?;
        let point = WorldPoint(cv_core::nalgebra::Point3::from_homogeneous(homogeneous)?);

        Some(point)
            .filter(|point| point.is_finite())
            .filter(|&point| {
                pairs
                    .iter()
                    .all(|&(pose, _)| pose.transform(point).depth() > 0.0)
            })
    }
}

/// Computes the largest angle in radians between the world-space rays of all pairs of
/// observations.
///
/// Two cameras looking at the same point along nearly parallel rays cannot resolve its depth. This
/// is zero when there are fewer than two observations.
pub fn max_ray_angle(pairs: &[(WorldToCamera, UnitVector3<f64>)]) -> f64 {
    let rays: Vec<UnitVector3<f64>> = pairs
        .iter()
        .map(|&(pose, bearing)| pose.inverse().isometry().rotation * bearing)
        .collect();
    let mut best = 0.0f64;
    for (ix, a) in rays.iter().enumerate() {
        for b in &rays[ix + 1..] {
            best = best.max(a.dot(b).clamp(-1.0, 1.0).acos());
        }
    }
    best
}
