use serde::{Deserialize, Serialize};

/// Keypoint adjustment totals over the tracks of one pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeypointAdjustmentStats {
    pub tracks: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: usize,
    pub converged: usize,
    pub reverted: usize,
}

impl KeypointAdjustmentStats {
    pub(crate) fn add(&mut self, report: &cv_optimize::KeypointAdjustmentReport) {
        self.tracks += 1;
        self.initial_cost += report.initial_cost;
        self.final_cost += report.final_cost;
        self.iterations += report.iterations;
        if report.converged {
            self.converged += 1;
        }
        if report.reverted {
            self.reverted += 1;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BundleAdjustmentStats {
    pub tracks: usize,
    pub free_poses: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// One keypoint adjustment and bundle adjustment pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefinementPass {
    pub keypoint_adjustment: KeypointAdjustmentStats,
    pub bundle_adjustment: BundleAdjustmentStats,
}

/// What happened to the tracks of a reference model during refinement.
///
/// Every input track is either in the output or counted as dropped for exactly one cause.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefinementStats {
    pub input_tracks: usize,
    pub output_tracks: usize,
    pub dropped_missing_observation: usize,
    pub dropped_degenerate_geometry: usize,
    pub passes: Vec<RefinementPass>,
    /// Root mean square reprojection error in pixels of the reference model.
    pub reference_rmse: f64,
    pub refined_rmse: f64,
}

impl RefinementStats {
    pub fn dropped_tracks(&self) -> usize {
        self.dropped_missing_observation + self.dropped_degenerate_geometry
    }
}
