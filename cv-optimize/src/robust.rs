#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Robust loss applied to a squared residual norm `s`.
///
/// The `scale` of a kernel is the residual norm at which it stops behaving quadratically. All
/// kernels satisfy `rho(0) = 0` and `rho'(0) = 1`, so small residuals are treated as plain least
/// squares.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serde-serialize",
    derive(Serialize, Deserialize),
    serde(tag = "name", rename_all = "snake_case")
)]
pub enum RobustLoss {
    /// `rho(s) = s`
    Trivial,
    /// `rho(s) = s` inside the scale, `2 a sqrt(s) - a^2` outside.
    Huber { scale: f64 },
    /// `rho(s) = a^2 ln(1 + s / a^2)`
    Cauchy { scale: f64 },
}

impl Default for RobustLoss {
    fn default() -> Self {
        RobustLoss::Trivial
    }
}

impl RobustLoss {
    pub fn rho(&self, s: f64) -> f64 {
        match *self {
            RobustLoss::Trivial => s,
            RobustLoss::Huber { scale } => {
                let a2 = scale * scale;
                if s <= a2 {
                    s
                } else {
                    2.0 * scale * s.sqrt() - a2
                }
            }
            RobustLoss::Cauchy { scale } => {
                let a2 = scale * scale;
                a2 * (s / a2).ln_1p()
            }
        }
    }

    /// The derivative `rho'(s)`, used as the iteratively reweighted least squares weight.
    pub fn weight(&self, s: f64) -> f64 {
        match *self {
            RobustLoss::Trivial => 1.0,
            RobustLoss::Huber { scale } => {
                if s <= scale * scale {
                    1.0
                } else {
                    scale / s.sqrt()
                }
            }
            RobustLoss::Cauchy { scale } => 1.0 / (1.0 + s / (scale * scale)),
        }
    }

    /// Factor that turns a raw residual into one whose squared norm is `rho(s)`.
    pub fn residual_scale(&self, s: f64) -> f64 {
        if s <= f64::EPSILON {
            1.0
        } else {
            (self.rho(s) / s).sqrt()
        }
    }

    /// Returns `false` for kernels with a scale that is not strictly positive and finite.
    pub fn is_valid(&self) -> bool {
        match *self {
            RobustLoss::Trivial => true,
            RobustLoss::Huber { scale } | RobustLoss::Cauchy { scale } => {
                scale.is_finite() && scale > 0.0
            }
        }
    }
}
