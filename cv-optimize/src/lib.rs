//! Optimizers used to refine a sparse reconstruction.
//!
//! * [`KeypointAdjuster`] moves the keypoints of a track so that dense features sampled around them
//!   agree across images. Each track is a small independent problem solved with
//!   `levenberg-marquardt`.
//! * [`BundleAdjuster`] jointly refines points and camera poses against the keypoints with a sparse
//!   Schur complement Levenberg-Marquardt.
//!
//! Both use the [`RobustLoss`] kernels to limit the influence of outliers.

mod bundle_adjustment;
mod keypoint_adjustment;
mod robust;

pub use bundle_adjustment::*;
pub use keypoint_adjustment::*;
pub use robust::*;
