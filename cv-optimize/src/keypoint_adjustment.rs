use crate::RobustLoss;
use cv_core::nalgebra::{
    dimension::{Dynamic, U1},
    DMatrix, DVector, Point2, VecStorage, Vector2,
};
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use log::trace;

/// A dense multi-channel feature map that can be sampled at sub-pixel locations.
pub trait FeatureInterpolator {
    /// Number of channels written by [`FeatureInterpolator::interpolate`].
    fn channels(&self) -> usize;

    /// Writes the interpolated channel values and their derivatives along `x` and `y` at a pixel
    /// location. All three slices have [`FeatureInterpolator::channels`] elements.
    ///
    /// Returns `false` without touching the slices when the location cannot be interpolated.
    fn interpolate(
        &self,
        point: Point2<f64>,
        values: &mut [f64],
        dx: &mut [f64],
        dy: &mut [f64],
    ) -> bool;
}

impl<T> FeatureInterpolator for &T
where
    T: FeatureInterpolator + ?Sized,
{
    fn channels(&self) -> usize {
        (**self).channels()
    }

    fn interpolate(
        &self,
        point: Point2<f64>,
        values: &mut [f64],
        dx: &mut [f64],
        dy: &mut [f64],
    ) -> bool {
        (**self).interpolate(point, values, dx, dy)
    }
}

/// The element of a track with the most match edges; the lowest index wins ties.
///
/// Returns `None` when there are no edges at all.
pub fn select_anchor(num_elements: usize, edges: &[(usize, usize)]) -> Option<usize> {
    let mut degree = vec![0usize; num_elements];
    for &(a, b) in edges {
        degree[a] += 1;
        degree[b] += 1;
    }
    degree
        .iter()
        .enumerate()
        .filter(|&(_, &d)| d > 0)
        .fold(None, |best: Option<(usize, usize)>, (ix, &d)| match best {
            Some((_, best_d)) if best_d >= d => best,
            _ => Some((ix, d)),
        })
        .map(|(ix, _)| ix)
}

/// The outcome of adjusting the keypoints of one track.
#[derive(Debug, Clone, PartialEq)]
pub struct KeypointAdjustmentReport {
    /// Adjusted keypoints, in the same order as the input.
    pub keypoints: Vec<Point2<f64>>,
    pub anchor: Option<usize>,
    pub initial_cost: f64,
    /// Never larger than `initial_cost`.
    pub final_cost: f64,
    /// Number of cost evaluations performed by the solver.
    pub iterations: usize,
    pub converged: bool,
    /// The solution moved a keypoint farther than allowed and was discarded.
    pub reverted: bool,
}

/// Featuremetric keypoint adjustment.
///
/// For one track, the keypoints of all elements connected by match edges are moved so that the
/// dense features around them agree. For each edge `(i, j)` and each offset `o` of a square patch,
/// the residual is `F_i(p_i + o) - F_j(p_j + o)` over all channels, robustified per edge and offset.
/// The anchor element is held fixed to remove the free translation of the whole track, and elements
/// without edges are never moved. Only the samples that can be interpolated at the initial
/// keypoints contribute, and a step that moves any of them off its map is rejected.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct KeypointAdjuster {
    patch_size: usize,
    loss: RobustLoss,
    max_iterations: usize,
    tolerance: f64,
    max_displacement: f64,
}

impl Default for KeypointAdjuster {
    fn default() -> Self {
        Self {
            patch_size: 3,
            loss: RobustLoss::Cauchy { scale: 0.25 },
            max_iterations: 100,
            tolerance: 1e-6,
            max_displacement: 8.0,
        }
    }
}

impl KeypointAdjuster {
    /// Same as calling [`Default::default`].
    pub fn new() -> Self {
        Default::default()
    }

    /// Side of the square window of samples compared around each keypoint.
    ///
    /// Default is `3`.
    #[must_use]
    pub fn patch_size(self, patch_size: usize) -> Self {
        Self { patch_size, ..self }
    }

    /// Default is Cauchy with scale `0.25`.
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

    /// Relative cost decrease below which the solver stops.
    ///
    /// Default is `1e-6`.
    #[must_use]
    pub fn tolerance(self, tolerance: f64) -> Self {
        Self { tolerance, ..self }
    }

    /// Largest distance in pixels a keypoint may move before the track is reverted.
    ///
    /// Default is `8.0`.
    #[must_use]
    pub fn max_displacement(self, max_displacement: f64) -> Self {
        Self {
            max_displacement,
            ..self
        }
    }

    fn offsets(&self) -> Vec<Vector2<f64>> {
        let half = (self.patch_size.max(1) as f64 - 1.0) / 2.0;
        let side = self.patch_size.max(1);
        (0..side)
            .flat_map(|y| (0..side).map(move |x| Vector2::new(x as f64 - half, y as f64 - half)))
            .collect()
    }

    /// Adjusts the keypoints of one track.
    ///
    /// `maps[i]` is the dense feature map of the image that `keypoints[i]` was detected in and
    /// `edges` index into both slices.
    pub fn adjust<F>(
        &self,
        maps: &[F],
        keypoints: &[Point2<f64>],
        edges: &[(usize, usize)],
    ) -> KeypointAdjustmentReport
    where
        F: FeatureInterpolator,
    {
        let anchor = select_anchor(keypoints.len(), edges);
        let mut connected = vec![false; keypoints.len()];
        for &(a, b) in edges {
            connected[a] = true;
            connected[b] = true;
        }
        let mut num_free = 0;
        let free = connected
            .iter()
            .enumerate()
            .map(|(ix, &connected)| {
                if connected && Some(ix) != anchor {
                    num_free += 1;
                    Some(num_free - 1)
                } else {
                    None
                }
            })
            .collect();
        let channels = maps.iter().map(|map| map.channels()).min().unwrap_or(0);
        let offsets = self.offsets();
        let mut problem = KeypointProblem {
            maps,
            keypoints: keypoints.to_vec(),
            free,
            num_free,
            edges,
            offsets: &offsets,
            loss: self.loss,
            channels,
            active: vec![],
        };
        problem.active = problem.sampled_blocks();
        let initial_cost = problem.cost();

        if num_free == 0 || channels == 0 || !initial_cost.is_finite() {
            return KeypointAdjustmentReport {
                keypoints: keypoints.to_vec(),
                anchor,
                initial_cost,
                final_cost: initial_cost,
                iterations: 0,
                converged: true,
                reverted: false,
            };
        }

        let (problem, report) = LevenbergMarquardt::new()
            .with_ftol(self.tolerance)
            .with_patience(self.max_iterations.max(1))
            .minimize(problem);
        let mut final_cost = problem.cost();
        let mut adjusted = problem.keypoints;
        let mut converged = report.termination.was_successful();
        let mut reverted = false;

        if !final_cost.is_finite() || final_cost > initial_cost {
            trace!(
                "keypoint adjustment increased cost from {} to {}, restoring",
                initial_cost,
                final_cost
            );
            adjusted = keypoints.to_vec();
            final_cost = initial_cost;
            converged = false;
        } else if adjusted
            .iter()
            .zip(keypoints)
            .any(|(a, b)| (a - b).norm() > self.max_displacement)
        {
            trace!("keypoint moved farther than {} pixels, reverting", self.max_displacement);
            adjusted = keypoints.to_vec();
            final_cost = initial_cost;
            reverted = true;
        }

        KeypointAdjustmentReport {
            keypoints: adjusted,
            anchor,
            initial_cost,
            final_cost,
            iterations: report.number_of_evaluations,
            converged,
            reverted,
        }
    }
}

struct KeypointProblem<'a, F> {
    maps: &'a [F],
    keypoints: Vec<Point2<f64>>,
    free: Vec<Option<usize>>,
    num_free: usize,
    edges: &'a [(usize, usize)],
    offsets: &'a [Vector2<f64>],
    loss: RobustLoss,
    channels: usize,
    /// The (edge, offset) blocks contributing residuals.
    active: Vec<bool>,
}

/// Interpolated values and derivatives of both ends of an edge at one patch offset.
struct EdgeSample {
    values: [Vec<f64>; 2],
    dx: [Vec<f64>; 2],
    dy: [Vec<f64>; 2],
}

impl EdgeSample {
    fn new(channels: usize) -> Self {
        let zeros = || [vec![0.0; channels], vec![0.0; channels]];
        Self {
            values: zeros(),
            dx: zeros(),
            dy: zeros(),
        }
    }
}

impl<'a, F> KeypointProblem<'a, F>
where
    F: FeatureInterpolator,
{
    fn num_residuals(&self) -> usize {
        self.edges.len() * self.offsets.len() * self.channels
    }

    /// Samples both ends of an edge. Returns `false` if either falls outside of its map.
    fn sample(&self, (a, b): (usize, usize), offset: Vector2<f64>, sample: &mut EdgeSample) -> bool {
        let [va, vb] = &mut sample.values;
        let [dxa, dxb] = &mut sample.dx;
        let [dya, dyb] = &mut sample.dy;
        self.maps[a].interpolate(self.keypoints[a] + offset, va, dxa, dya)
            && self.maps[b].interpolate(self.keypoints[b] + offset, vb, dxb, dyb)
    }

    /// Which (edge, offset) blocks can be sampled at the current keypoints.
    fn sampled_blocks(&self) -> Vec<bool> {
        let mut sample = EdgeSample::new(self.channels);
        self.edges
            .iter()
            .flat_map(|&edge| self.offsets.iter().map(move |&offset| (edge, offset)))
            .map(|(edge, offset)| self.sample(edge, offset, &mut sample))
            .collect()
    }

    /// Visits every active (edge, offset) block with its squared norm.
    ///
    /// Returns `false` as soon as an active block can no longer be sampled.
    fn for_each_block(&self, mut f: impl FnMut(usize, (usize, usize), &EdgeSample, f64)) -> bool {
        let mut sample = EdgeSample::new(self.channels);
        let mut block = 0;
        for &edge in self.edges {
            for &offset in self.offsets {
                if self.active[block] {
                    if !self.sample(edge, offset, &mut sample) {
                        return false;
                    }
                    let s = (0..self.channels)
                        .map(|c| (sample.values[0][c] - sample.values[1][c]).powi(2))
                        .sum::<f64>();
                    f(block, edge, &sample, s);
                }
                block += 1;
            }
        }
        true
    }

    /// Robust cost `0.5 * sum(rho(s))`, infinite when an active block left its map.
    fn cost(&self) -> f64 {
        let mut cost = 0.0;
        if self.for_each_block(|_, _, _, s| cost += 0.5 * self.loss.rho(s)) {
            cost
        } else {
            f64::INFINITY
        }
    }
}

impl<'a, F> LeastSquaresProblem<f64, Dynamic, Dynamic> for KeypointProblem<'a, F>
where
    F: FeatureInterpolator,
{
    type ResidualStorage = VecStorage<f64, Dynamic, U1>;
    type JacobianStorage = VecStorage<f64, Dynamic, Dynamic>;
    type ParameterStorage = VecStorage<f64, Dynamic, U1>;

    fn set_params(&mut self, x: &DVector<f64>) {
        for (keypoint, free) in self.keypoints.iter_mut().zip(&self.free) {
            if let Some(ix) = *free {
                *keypoint = Point2::new(x[2 * ix], x[2 * ix + 1]);
            }
        }
    }

    fn params(&self) -> DVector<f64> {
        let mut x = DVector::zeros(2 * self.num_free);
        for (keypoint, free) in self.keypoints.iter().zip(&self.free) {
            if let Some(ix) = *free {
                x[2 * ix] = keypoint.x;
                x[2 * ix + 1] = keypoint.y;
            }
        }
        x
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let mut residuals = DVector::zeros(self.num_residuals());
        let channels = self.channels;
        let sampled = self.for_each_block(|block, _, sample, s| {
            let scale = self.loss.residual_scale(s);
            for c in 0..channels {
                residuals[block * channels + c] = scale * (sample.values[0][c] - sample.values[1][c]);
            }
        });
        if sampled && residuals.iter().all(|r| r.is_finite()) {
            Some(residuals)
        } else {
            None
        }
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let mut jacobian = DMatrix::zeros(self.num_residuals(), 2 * self.num_free);
        let channels = self.channels;
        let sampled = self.for_each_block(|block, (a, b), sample, s| {
            let scale = self.loss.residual_scale(s);
            for c in 0..channels {
                let row = block * channels + c;
                if let Some(ix) = self.free[a] {
                    jacobian[(row, 2 * ix)] += scale * sample.dx[0][c];
                    jacobian[(row, 2 * ix + 1)] += scale * sample.dy[0][c];
                }
                if let Some(ix) = self.free[b] {
                    jacobian[(row, 2 * ix)] -= scale * sample.dx[1][c];
                    jacobian[(row, 2 * ix + 1)] -= scale * sample.dy[1][c];
                }
            }
        });
        if sampled {
            Some(jacobian)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64;

    /// An analytic texture seen through a pixel shift.
    struct ShiftedTexture {
        shift: Vector2<f64>,
    }

    impl FeatureInterpolator for ShiftedTexture {
        fn channels(&self) -> usize {
            2
        }

        fn interpolate(
            &self,
            point: Point2<f64>,
            values: &mut [f64],
            dx: &mut [f64],
            dy: &mut [f64],
        ) -> bool {
            let p = point - self.shift;
            if p.x < 0.0 || p.y < 0.0 || p.x > 64.0 || p.y > 64.0 {
                return false;
            }
            let (ax, ay) = (0.31, 0.23);
            values[0] = (ax * p.x).sin() * (ay * p.y).cos();
            dx[0] = ax * (ax * p.x).cos() * (ay * p.y).cos();
            dy[0] = -ay * (ax * p.x).sin() * (ay * p.y).sin();
            let (bx, by) = (0.19, 0.27);
            values[1] = (bx * p.x + by * p.y).cos();
            dx[1] = -bx * (bx * p.x + by * p.y).sin();
            dy[1] = -by * (bx * p.x + by * p.y).sin();
            true
        }
    }

    fn scene() -> (Vec<ShiftedTexture>, Vec<Point2<f64>>) {
        let shifts = [
            Vector2::new(0.0, 0.0),
            Vector2::new(3.5, -1.25),
            Vector2::new(-2.0, 4.0),
        ];
        let center = Point2::new(30.0, 28.0);
        let maps = shifts.iter().map(|&shift| ShiftedTexture { shift }).collect();
        let truth = shifts.iter().map(|shift| center + shift).collect();
        (maps, truth)
    }

    #[test]
    fn anchor_prefers_degree_then_index() {
        assert_eq!(select_anchor(3, &[(0, 1), (1, 2)]), Some(1));
        assert_eq!(select_anchor(3, &[(0, 1), (2, 1), (0, 2)]), Some(0));
        assert_eq!(select_anchor(3, &[]), None);
    }

    #[test]
    fn recovers_perturbed_keypoints() {
        let (maps, truth) = scene();
        let mut keypoints = truth.clone();
        keypoints[1] += Vector2::new(0.6, -0.4);
        keypoints[2] += Vector2::new(-0.5, 0.3);
        let edges = [(0, 1), (0, 2), (1, 2)];
        let report = KeypointAdjuster::new()
            .loss(RobustLoss::Trivial)
            .adjust(&maps, &keypoints, &edges);
        assert_eq!(report.anchor, Some(0));
        assert!(report.final_cost < report.initial_cost);
        assert!(!report.reverted);
        assert_eq!(report.keypoints[0], keypoints[0]);
        for (adjusted, truth) in report.keypoints.iter().zip(&truth) {
            assert_relative_eq!(adjusted, truth, epsilon = 1e-3);
        }
    }

    #[test]
    fn cost_never_increases() {
        let (maps, truth) = scene();
        let mut rng = Pcg64::seed_from_u64(7);
        let adjuster = KeypointAdjuster::new();
        for _ in 0..20 {
            let keypoints: Vec<Point2<f64>> = truth
                .iter()
                .map(|p| p + Vector2::new(rng.gen_range(-3.0..3.0), rng.gen_range(-3.0..3.0)))
                .collect();
            let report = adjuster.adjust(&maps, &keypoints, &[(0, 1), (1, 2)]);
            assert!(report.final_cost <= report.initial_cost);
        }
    }

    /// The (edge, offset) samples that both maps can interpolate.
    fn sampleable(
        maps: &[ShiftedTexture],
        keypoints: &[Point2<f64>],
        edges: &[(usize, usize)],
        offsets: &[Vector2<f64>],
    ) -> Vec<bool> {
        let mut scratch = [[0.0; 2]; 3];
        edges
            .iter()
            .flat_map(|&(a, b)| offsets.iter().map(move |&offset| (a, b, offset)))
            .map(|(a, b, offset)| {
                [a, b].iter().all(|&ix| {
                    let [values, dx, dy] = &mut scratch;
                    maps[ix].interpolate(keypoints[ix] + offset, values, dx, dy)
                })
            })
            .collect()
    }

    #[test]
    fn samples_stay_on_the_map_near_the_border() {
        let (maps, _) = scene();
        let edges = [(0, 1), (1, 2)];
        let adjuster = KeypointAdjuster::new().patch_size(5);
        let offsets = adjuster.offsets();
        let mut rng = Pcg64::seed_from_u64(11);
        for _ in 0..20 {
            // Close to the left border of every map.
            let keypoints: Vec<Point2<f64>> = maps
                .iter()
                .map(|map| {
                    Point2::new(2.5, 30.0)
                        + map.shift
                        + Vector2::new(rng.gen_range(-1.5..1.5), rng.gen_range(-1.0..1.0))
                })
                .collect();
            let before = sampleable(&maps, &keypoints, &edges, &offsets);
            let report = adjuster.adjust(&maps, &keypoints, &edges);
            let after = sampleable(&maps, &report.keypoints, &edges, &offsets);
            assert!(report.final_cost <= report.initial_cost);
            assert!(before.iter().zip(&after).all(|(&before, &after)| !before || after));
            assert!(after.iter().filter(|&&v| v).count() >= before.iter().filter(|&&v| v).count());
        }
    }

    #[test]
    fn isolated_elements_stay_fixed() {
        let (maps, truth) = scene();
        let mut keypoints = truth.clone();
        keypoints[1] += Vector2::new(0.5, 0.5);
        keypoints[2] += Vector2::new(0.5, 0.5);
        let report = KeypointAdjuster::new().adjust(&maps, &keypoints, &[(0, 1)]);
        assert_eq!(report.keypoints[2], keypoints[2]);
        assert_eq!(report.keypoints[0], keypoints[0]);
    }

    #[test]
    fn large_displacement_reverts() {
        let (maps, truth) = scene();
        let mut keypoints = truth.clone();
        keypoints[1] += Vector2::new(0.8, 0.0);
        let report = KeypointAdjuster::new()
            .loss(RobustLoss::Trivial)
            .max_displacement(0.05)
            .adjust(&maps, &keypoints, &[(0, 1)]);
        assert!(report.reverted);
        assert_eq!(report.keypoints, keypoints);
        assert_eq!(report.final_cost, report.initial_cost);
    }
}
