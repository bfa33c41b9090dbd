//! This crate contains the computational geometry used when re-triangulating tracks.
//!
//! ## Triangulation
//!
//! In this problem we know the poses of the cameras and the bearing of the same feature
//! observed in each camera frame. We want to find the point of intersection from all cameras.
//!
//! - `p` the point we are trying to triangulate
//! - `a` the normalized keypoint on camera A
//! - `b` the normalized keypoint on camera B
//! - `O` the optical center of a camera
//! - `@` the virtual image plane
//!
//! ```text
//!                        @
//!                        @
//!               p--------b--------O
//!              /         @
//!             /          @
//!            /           @
//!           /            @
//!   @@@@@@@a@@@@@
//!         /
//!        /
//!       /
//!      O
//! ```
//!
//! When the rays are nearly parallel the intersection is poorly conditioned along the rays, which
//! is why [`triangulation::max_ray_angle`] is provided to reject such tracks.

pub mod triangulation;

pub use triangulation::*;
