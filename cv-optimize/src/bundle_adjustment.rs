use crate::RobustLoss;
use cv_core::nalgebra::{
    DMatrix, DVector, Matrix3, Matrix6, Matrix6x3, Point2, Vector2, Vector3, Vector6,
};
use cv_core::{CameraModel, Pose, WorldPoint, WorldToCamera};
use log::{debug, trace};

/// One 2d observation of a point in an image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BundleObservation {
    /// Index into [`BundleProblem::poses`].
    pub image: usize,
    /// Index into [`BundleProblem::points`].
    pub point: usize,
    /// Observed pixel location.
    pub keypoint: Point2<f64>,
}

/// Poses, points and observations of a bundle adjustment problem.
///
/// Each image has its own camera model, which is held fixed. Images whose `fixed` flag is set keep
/// their pose and only the points move in respect to them.
#[derive(Debug, Clone)]
pub struct BundleProblem<C> {
    pub cameras: Vec<C>,
    pub poses: Vec<WorldToCamera>,
    pub fixed: Vec<bool>,
    pub points: Vec<WorldPoint>,
    pub observations: Vec<BundleObservation>,
}

impl<C> BundleProblem<C>
where
    C: CameraModel,
{
    /// Reprojection error of one observation, or `None` if the point is behind the camera.
    pub fn reprojection_error(&self, observation: &BundleObservation) -> Option<Vector2<f64>> {
        let camera = self.poses[observation.image].transform(self.points[observation.point]);
        self.cameras[observation.image]
            .project(camera)
            .map(|projected| projected.0 - observation.keypoint)
    }

    /// Robust cost `0.5 * sum(rho(|e|^2))`, infinite if a point moved behind a camera.
    pub fn cost(&self, loss: RobustLoss) -> f64 {
        cost_of(
            &self.cameras,
            &self.poses,
            &self.points,
            &self.observations,
            loss,
        )
    }
}

fn cost_of<C: CameraModel>(
    cameras: &[C],
    poses: &[WorldToCamera],
    points: &[WorldPoint],
    observations: &[BundleObservation],
    loss: RobustLoss,
) -> f64 {
    observations
        .iter()
        .map(|observation| {
            let camera = poses[observation.image].transform(points[observation.point]);
            match cameras[observation.image].project(camera) {
                Some(projected) => {
                    0.5 * loss.rho((projected.0 - observation.keypoint).norm_squared())
                }
                None => f64::INFINITY,
            }
        })
        .sum()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BundleAdjustmentReport {
    pub initial_cost: f64,
    pub final_cost: f64,
    /// Number of linearizations.
    pub iterations: usize,
    pub converged: bool,
}

/// Sparse Levenberg-Marquardt bundle adjustment.
///
/// Each iteration linearizes the robustified reprojection residuals with iteratively reweighted
/// least squares, eliminates the points with the Schur complement, solves the reduced camera
/// system with a Cholesky decomposition and back-substitutes the point updates. Pose updates are
/// left se(3) increments. A step is only accepted when it lowers the cost.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BundleAdjuster {
    loss: RobustLoss,
    max_iterations: usize,
    tolerance: f64,
    initial_lambda: f64,
}

impl Default for BundleAdjuster {
    fn default() -> Self {
        Self {
            loss: RobustLoss::Cauchy { scale: 1.0 },
            max_iterations: 100,
            tolerance: 1e-6,
            initial_lambda: 1e-3,
        }
    }
}

impl BundleAdjuster {
    /// Same as calling [`Default::default`].
    pub fn new() -> Self {
        Default::default()
    }

    /// Loss applied to the squared reprojection error in pixels.
    ///
    /// Default is Cauchy with scale `1.0`.
    #[must_use]
    pub fn loss(self, loss: RobustLoss) -> Self {
        Self { loss, ..self }
    }

    /// Default is `100`.
    #[must_use]
    pub fn max_iterations(self, max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..self
        }
    }

    /// Relative cost decrease of an accepted step below which the solver stops.
    ///
    /// Default is `1e-6`.
    #[must_use]
    pub fn tolerance(self, tolerance: f64) -> Self {
        Self { tolerance, ..self }
    }

    /// Default is `1e-3`.
    #[must_use]
    pub fn initial_lambda(self, initial_lambda: f64) -> Self {
        Self {
            initial_lambda,
            ..self
        }
    }

    /// Optimizes the problem in place.
    pub fn optimize<C>(&self, problem: &mut BundleProblem<C>) -> BundleAdjustmentReport
    where
        C: CameraModel,
    {
        let initial_cost = problem.cost(self.loss);
        let mut cost = initial_cost;
        let mut lambda = self.initial_lambda;
        let mut iterations = 0;
        let mut converged = false;

        if !cost.is_finite() || problem.observations.is_empty() {
            return BundleAdjustmentReport {
                initial_cost,
                final_cost: initial_cost,
                iterations,
                converged: problem.observations.is_empty(),
            };
        }

        let pose_index = {
            let mut next = 0;
            problem
                .fixed
                .iter()
                .map(|&fixed| {
                    if fixed {
                        None
                    } else {
                        next += 1;
                        Some(next - 1)
                    }
                })
                .collect::<Vec<_>>()
        };
        let num_free_poses = pose_index.iter().flatten().count();

        'outer: while iterations < self.max_iterations {
            iterations += 1;
            let system = NormalEquations::build(problem, &pose_index, num_free_poses, self.loss);

            loop {
                let step = match system.solve(lambda) {
                    Some(step) => step,
                    None => {
                        lambda *= 10.0;
                        if lambda > 1e16 {
                            break 'outer;
                        }
                        continue;
                    }
                };
                let poses: Vec<WorldToCamera> = problem
                    .poses
                    .iter()
                    .zip(&pose_index)
                    .map(|(&pose, ix)| match *ix {
                        Some(ix) => pose.increment_left(step.poses[ix]),
                        None => pose,
                    })
                    .collect();
                let points: Vec<WorldPoint> = problem
                    .points
                    .iter()
                    .zip(&step.points)
                    .map(|(point, delta)| WorldPoint(point.0 + *delta))
                    .collect();
                let new_cost = cost_of(
                    &problem.cameras,
                    &poses,
                    &points,
                    &problem.observations,
                    self.loss,
                );
                if new_cost < cost {
                    trace!(
                        "bundle adjustment iteration {} cost {} -> {} (lambda {:e})",
                        iterations,
                        cost,
                        new_cost,
                        lambda
                    );
                    let decrease = (cost - new_cost) / cost.max(f64::MIN_POSITIVE);
                    problem.poses = poses;
                    problem.points = points;
                    cost = new_cost;
                    lambda = (lambda / 10.0).max(1e-12);
                    if decrease < self.tolerance {
                        converged = true;
                        break 'outer;
                    }
                    break;
                }
                lambda *= 10.0;
                if lambda > 1e16 {
                    // No step along the damped direction lowers the cost any more.
                    converged = true;
                    break 'outer;
                }
            }
        }

        debug!(
            "bundle adjustment finished after {} iterations with cost {} -> {}",
            iterations, initial_cost, cost
        );

        BundleAdjustmentReport {
            initial_cost,
            final_cost: cost,
            iterations,
            converged,
        }
    }
}

struct Step {
    poses: Vec<Vector6<f64>>,
    points: Vec<Vector3<f64>>,
}

/// The block structure of `J^T W J` and `J^T W e`.
struct NormalEquations {
    /// Pose-pose diagonal blocks.
    u: Vec<Matrix6<f64>>,
    /// Point-point diagonal blocks.
    v: Vec<Matrix3<f64>>,
    /// Pose-point blocks per point, keyed by free pose index.
    w: Vec<Vec<(usize, Matrix6x3<f64>)>>,
    gradient_poses: Vec<Vector6<f64>>,
    gradient_points: Vec<Vector3<f64>>,
}

impl NormalEquations {
    fn build<C: CameraModel>(
        problem: &BundleProblem<C>,
        pose_index: &[Option<usize>],
        num_free_poses: usize,
        loss: RobustLoss,
    ) -> Self {
        let num_points = problem.points.len();
        let mut system = Self {
            u: vec![Matrix6::zeros(); num_free_poses],
            v: vec![Matrix3::zeros(); num_points],
            w: vec![vec![]; num_points],
            gradient_poses: vec![Vector6::zeros(); num_free_poses],
            gradient_points: vec![Vector3::zeros(); num_points],
        };
        for observation in &problem.observations {
            let pose = problem.poses[observation.image];
            let (camera_point, jacobian_point, jacobian_pose) =
                pose.transform_jacobians(problem.points[observation.point]);
            let (projected, jacobian_projection) =
                match problem.cameras[observation.image].project_jacobian(camera_point) {
                    Some(projection) => projection,
                    None => continue,
                };
            let error = projected.0 - observation.keypoint;
            let weight = loss.weight(error.norm_squared());
            let jx = jacobian_projection * jacobian_point;
            let j = observation.point;
            system.v[j] += weight * jx.transpose() * jx;
            system.gradient_points[j] += weight * jx.transpose() * error;
            if let Some(i) = pose_index[observation.image] {
                let jp = jacobian_projection * jacobian_pose;
                system.u[i] += weight * jp.transpose() * jp;
                system.gradient_poses[i] += weight * jp.transpose() * error;
                let block = weight * jp.transpose() * jx;
                match system.w[j].iter_mut().find(|(ix, _)| *ix == i) {
                    Some((_, existing)) => *existing += block,
                    None => system.w[j].push((i, block)),
                }
            }
        }
        system
    }

    /// Solves the damped system for a step, or `None` if it is not positive definite.
    fn solve(&self, lambda: f64) -> Option<Step> {
        let damp3 = |m: &Matrix3<f64>| {
            let mut m = *m;
            for k in 0..3 {
                m[(k, k)] += lambda * (m[(k, k)] + 1e-9);
            }
            m
        };
        let v_inv: Vec<Matrix3<f64>> = self
            .v
            .iter()
            .map(|v| damp3(v).try_inverse())
            .collect::<Option<_>>()?;

        let n = self.u.len();
        let mut pose_steps = vec![Vector6::zeros(); n];
        if n > 0 {
            let mut s = DMatrix::<f64>::zeros(6 * n, 6 * n);
            let mut b = DVector::<f64>::zeros(6 * n);
            for (i, u) in self.u.iter().enumerate() {
                let mut u = *u;
                for k in 0..6 {
                    u[(k, k)] += lambda * (u[(k, k)] + 1e-9);
                }
                s.fixed_slice_mut::<6, 6>(6 * i, 6 * i).copy_from(&u);
                b.fixed_rows_mut::<6>(6 * i)
                    .copy_from(&-self.gradient_poses[i]);
            }
            for (j, blocks) in self.w.iter().enumerate() {
                let g = self.gradient_points[j];
                for &(a, wa) in blocks {
                    let wa_vinv = wa * v_inv[j];
                    let mut rhs = b.fixed_rows_mut::<6>(6 * a);
                    rhs += wa_vinv * g;
                    for &(c, wc) in blocks {
                        let mut block = s.fixed_slice_mut::<6, 6>(6 * a, 6 * c);
                        block -= wa_vinv * wc.transpose();
                    }
                }
            }
            let solution = s.cholesky()?.solve(&b);
            for (i, step) in pose_steps.iter_mut().enumerate() {
                *step = solution.fixed_rows::<6>(6 * i).into_owned();
            }
        }

        let points = self
            .w
            .iter()
            .enumerate()
            .map(|(j, blocks)| {
                let rhs = blocks.iter().fold(-self.gradient_points[j], |rhs, &(i, w)| {
                    rhs - w.transpose() * pose_steps[i]
                });
                v_inv[j] * rhs
            })
            .collect();

        let step = Step {
            poses: pose_steps,
            points,
        };
        let finite = step.poses.iter().flat_map(|p| p.iter()).all(|n| n.is_finite())
            && step.points.iter().flat_map(|p| p.iter()).all(|n| n.is_finite());
        Some(step).filter(|_| finite)
    }
}
