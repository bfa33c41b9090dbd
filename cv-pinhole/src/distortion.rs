use crate::root::root;
use crate::NormalizedKeyPoint;
use cv_core::nalgebra::Matrix2;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Polynomial radial distortion with two coefficients.
///
/// Given undistorted normalized coordinates $\vec n$ and $r^2 = \lVert \vec n \rVert^2$ the
/// distorted coordinates are
///
/// $$
/// \vec d = \vec n ⋅ \p{1 + k_1 ⋅ r^2 + k_2 ⋅ r^4}
/// $$
///
/// `k2 = 0` gives the single coefficient model and `k1 = k2 = 0` disables distortion.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct RadialDistortion {
    pub k1: f64,
    pub k2: f64,
}

impl RadialDistortion {
    pub fn new(k1: f64, k2: f64) -> Self {
        Self { k1, k2 }
    }

    pub fn is_identity(&self) -> bool {
        self.k1 == 0.0 && self.k2 == 0.0
    }

    fn factor(&self, r2: f64) -> f64 {
        1.0 + r2 * (self.k1 + self.k2 * r2)
    }

    /// Applies the distortion to an undistorted point.
    pub fn distort(&self, point: NormalizedKeyPoint) -> NormalizedKeyPoint {
        let r2 = point.coords.norm_squared();
        NormalizedKeyPoint((point.coords * self.factor(r2)).into())
    }

    /// Jacobian of [`RadialDistortion::distort`] in respect to the undistorted point.
    pub fn jacobian(&self, point: NormalizedKeyPoint) -> Matrix2<f64> {
        let n = point.coords;
        let r2 = n.norm_squared();
        let dfactor = 2.0 * (self.k1 + 2.0 * self.k2 * r2);
        Matrix2::identity() * self.factor(r2) + n * n.transpose() * dfactor
    }

    /// Removes the distortion from a distorted point.
    ///
    /// The undistorted radius is found with a bracketed Newton-Bisection search. Returns `None` when
    /// no undistorted radius maps onto the distorted one, which happens far outside of the image
    /// for strongly negative coefficients.
    pub fn undistort(&self, point: NormalizedKeyPoint) -> Option<NormalizedKeyPoint> {
        let rd = point.coords.norm();
        if self.is_identity() || rd == 0.0 {
            return Some(point);
        }
        let func = |r: f64| {
            let r2 = r * r;
            (
                r * self.factor(r2) - rd,
                1.0 + r2 * (3.0 * self.k1 + 5.0 * self.k2 * r2),
            )
        };
        let mut hi = rd;
        for _ in 0..32 {
            if func(hi).0 >= 0.0 {
                break;
            }
            hi *= 2.0;
        }
        let ru = root(func, 0.0, hi)?;
        Some(NormalizedKeyPoint((point.coords * (ru / rd)).into()))
    }
}
