/// Find function root inside the bracket `[a, b]`.
///
/// # Method
///
/// Newton-Bisection hybrid method based on [^1] that converges to almost machine precision.
/// `func` returns the value and the derivative at the query location.
///
/// # Resources
///
/// [^1]: Numerical Recipes 2nd edition. p. 365
///
/// Returns `None` when $f(a) ⋅ f(b) > 0$.
pub(crate) fn root<F>(func: F, a: f64, b: f64) -> Option<f64>
where
    F: Fn(f64) -> (f64, f64),
{
    let (mut xl, mut xh) = (a, b);
    let (fl, _) = func(xl);
    if fl == 0.0 {
        return Some(xl);
    }
    let (fh, _) = func(xh);
    if fh == 0.0 {
        return Some(xh);
    }
    if fl * fh > 0.0 || !(fl * fh).is_finite() {
        return None;
    }
    if fl > 0.0 {
        core::mem::swap(&mut xl, &mut xh);
    }
    let mut rts = 0.5 * (xl + xh);
    let mut dxold = (xl - xh).abs();
    let mut dx = dxold;
    let (mut f, mut df) = func(rts);
    for _ in 0..100 {
        if (((rts - xh) * df - f) * ((rts - xl) * df - f) > 0.0)
            || (2.0 * f.abs() > (dxold * df).abs())
        {
            // Bisection
            dxold = dx;
            dx = 0.5 * (xh - xl);
            rts = xl + dx;
            if xl == rts || xh == rts {
                return Some(rts);
            }
        } else {
            // Newton
            dxold = dx;
            dx = f / df;
            let tmp = rts;
            rts -= dx;
            if tmp == rts {
                return Some(rts);
            }
        }
        let (nf, ndf) = func(rts);
        f = nf;
        df = ndf;
        if f < 0.0 {
            xl = rts;
        } else {
            xh = rts;
        }
    }
    Some(rts)
}
