//! Bicubic (Catmull-Rom) interpolation of a grid of samples with its spatial derivatives.
//!
//! This follows the imageproc blend used to sample pixels, extended with the analytic derivative
//! of the cubic so that optimizers can use the gradient of the interpolated surface.

#[inline]
fn blend_cubic(p: [f64; 4], x: f64) -> f64 {
    #[rustfmt::skip]
    let value = p[1] + 0.5 * x * (p[2] - p[0] + x * (2.0 * p[0] - 5.0 * p[1] + 4.0 * p[2] - p[3] + x * (3.0 * (p[1] - p[2]) + p[3] - p[0])));
    value
}

#[inline]
fn blend_cubic_derivative(p: [f64; 4], x: f64) -> f64 {
    let a = p[2] - p[0];
    let b = 2.0 * p[0] - 5.0 * p[1] + 4.0 * p[2] - p[3];
    let c = 3.0 * (p[1] - p[2]) + p[3] - p[0];
    0.5 * (a + x * (2.0 * b + 3.0 * c * x))
}

/// Interpolates the grid `sample(x, y)` of size `width` by `height` at `(x, y)`, where integer
/// coordinates land exactly on samples.
///
/// Returns the value and its derivatives along `x` and `y`, or `None` when the 4x4 neighborhood
/// leaves the grid.
pub fn interpolate_bicubic(
    width: usize,
    height: usize,
    x: f64,
    y: f64,
    sample: impl Fn(usize, usize) -> f64,
) -> Option<(f64, f64, f64)> {
    if !(x.is_finite() && y.is_finite()) {
        return None;
    }
    let left = x.floor() - 1.0;
    let top = y.floor() - 1.0;
    if left < 0.0 || top < 0.0 || left + 4.0 > width as f64 || top + 4.0 > height as f64 {
        return None;
    }
    let x_weight = x - (left + 1.0);
    let y_weight = y - (top + 1.0);
    let (left, top) = (left as usize, top as usize);

    let mut rows = [0.0; 4];
    let mut rows_dx = [0.0; 4];
    for (ix, row) in (top..top + 4).enumerate() {
        let p = [
            sample(left, row),
            sample(left + 1, row),
            sample(left + 2, row),
            sample(left + 3, row),
        ];
        rows[ix] = blend_cubic(p, x_weight);
        rows_dx[ix] = blend_cubic_derivative(p, x_weight);
    }

    Some((
        blend_cubic(rows, y_weight),
        blend_cubic(rows_dx, y_weight),
        blend_cubic_derivative(rows, y_weight),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn surface(x: usize, y: usize) -> f64 {
        let (x, y) = (x as f64, y as f64);
        0.3 * x * x - 0.2 * x * y + 1.5 * y + 2.0
    }

    #[test]
    fn exact_on_samples() {
        let (value, _, _) = interpolate_bicubic(8, 8, 3.0, 4.0, surface).unwrap();
        assert_relative_eq!(value, surface(3, 4), epsilon = 1e-12);
    }

    #[test]
    fn reproduces_quadratics() {
        let (x, y) = (3.3, 4.6);
        let (value, dx, dy) = interpolate_bicubic(8, 8, x, y, surface).unwrap();
        assert_relative_eq!(value, 0.3 * x * x - 0.2 * x * y + 1.5 * y + 2.0, epsilon = 1e-9);
        assert_relative_eq!(dx, 0.6 * x - 0.2 * y, epsilon = 1e-9);
        assert_relative_eq!(dy, -0.2 * x + 1.5, epsilon = 1e-9);
    }

    #[test]
    fn outside_the_grid() {
        assert!(interpolate_bicubic(8, 8, 0.5, 3.0, surface).is_none());
        assert!(interpolate_bicubic(8, 8, 3.0, 6.5, surface).is_none());
        assert!(interpolate_bicubic(8, 8, f64::NAN, 3.0, surface).is_none());
    }
}
