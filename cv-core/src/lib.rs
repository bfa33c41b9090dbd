//! # Core geometry for sparse refinement
//!
//! This crate provides the small set of geometric types and traits shared by every crate in the
//! workspace: 3d points in world and camera space, pixel keypoints, the world-to-camera pose with
//! its Jacobians, camera models, and the triangulation trait. It pulls in `nalgebra` (re-exported)
//! and nothing heavy, so all other crates can agree on the same types.
//!
//! ## Conventions
//!
//! * Camera space: origin at the optical center, `+z` forwards, `+y` down, `+x` right.
//! * Pixel space: origin at the top-left corner of the image, `+x` right, `+y` down.
//! * Poses are [`WorldToCamera`], so `camera_point = R * world_point + t`.
//! * Pose increments are expressed in se(3) as `[translation, rotation]`, applied on the left:
//!   `exp(delta) * pose`.
//!
//! ## Triangulation
//!
//! A track is observed from two or more cameras. Each observation gives a bearing out of the
//! optical center of its camera. Because keypoints are noisy, the rays never meet exactly and a
//! [`TriangulatorObservations`] picks the point that best explains all of them.
//!
//! ```text
//!                        @
//!                        @
//!               p--------b--------O
//!              /         @
//!             /          @
//!   @@@@@@@a@@@@@
//!         /
//!        /
//!      O
//! ```

mod camera;
mod keypoint;
mod matches;
mod point;
mod pose;
mod so3;
mod triangulation;

pub use camera::*;
pub use keypoint::*;
pub use matches::*;
pub use nalgebra;
pub use point::*;
pub use pose::*;
pub use so3::*;
pub use triangulation::*;
