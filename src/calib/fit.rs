//! Least-squares curve fitting for the power response.

/// Percent difference of `a` relative to `b`.
///
/// Equal inputs are 0 even when both are zero; a zero reference with a
/// non-zero value is reported as infinite.
pub fn percent_diff(a: f64, b: f64) -> f64 {
    if a == b {
        0.0
    } else if b == 0.0 {
        f64::INFINITY
    } else {
        (a - b).abs() / b.abs() * 100.0
    }
}

/// Coefficients of `y = a*x^2 + b*x + c`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quadratic {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl Quadratic {
    pub const IDENTITY: Quadratic = Quadratic {
        a: 0.0,
        b: 1.0,
        c: 0.0,
    };

    pub fn eval(&self, x: f64) -> f64 {
        (self.a * x + self.b) * x + self.c
    }
}

/// Fit a response curve through (commanded, measured) fractions of full
/// power.
///
/// The degree degrades with the data: three or more distinct abscissae give
/// a quadratic, two give a line through least squares (`a = 0`), one gives a
/// proportional fit through the origin, and no data at all yields the
/// identity. Collinear inputs that defeat the quadratic normal equations
/// fall back the same way, so the fit never returns NaN coefficients.
pub fn fit_quadratic(points: &[(f64, f64)]) -> Quadratic {
    let mut xs: Vec<f64> = points.iter().map(|p| p.0).collect();
    xs.sort_by(|a, b| a.total_cmp(b));
    xs.dedup_by(|a, b| (*a - *b).abs() < 1e-12);

    match xs.len() {
        0 => Quadratic::IDENTITY,
        1 => fit_proportional(points),
        2 => fit_linear(points),
        _ => fit_degree_two(points).unwrap_or_else(|| fit_linear(points)),
    }
}

/// `y = b*x` through the origin.
fn fit_proportional(points: &[(f64, f64)]) -> Quadratic {
    let sxx: f64 = points.iter().map(|(x, _)| x * x).sum();
    let sxy: f64 = points.iter().map(|(x, y)| x * y).sum();
    if sxx == 0.0 {
        return Quadratic::IDENTITY;
    }
    Quadratic {
        a: 0.0,
        b: sxy / sxx,
        c: 0.0,
    }
}

/// Ordinary least squares line `y = b*x + c`.
fn fit_linear(points: &[(f64, f64)]) -> Quadratic {
    let n = points.len() as f64;
    let sx: f64 = points.iter().map(|(x, _)| x).sum();
    let sy: f64 = points.iter().map(|(_, y)| y).sum();
    let sxx: f64 = points.iter().map(|(x, _)| x * x).sum();
    let sxy: f64 = points.iter().map(|(x, y)| x * y).sum();
    let det = n * sxx - sx * sx;
    if det.abs() < 1e-12 {
        return fit_proportional(points);
    }
    Quadratic {
        a: 0.0,
        b: (n * sxy - sx * sy) / det,
        c: (sxx * sy - sx * sxy) / det,
    }
}

/// Full quadratic via the 3x3 normal equations, solved by Cramer's rule.
fn fit_degree_two(points: &[(f64, f64)]) -> Option<Quadratic> {
    let n = points.len() as f64;
    let mut sx = 0.0;
    let mut sx2 = 0.0;
    let mut sx3 = 0.0;
    let mut sx4 = 0.0;
    let mut sy = 0.0;
    let mut sxy = 0.0;
    let mut sx2y = 0.0;
    for &(x, y) in points {
        let x2 = x * x;
        sx += x;
        sx2 += x2;
        sx3 += x2 * x;
        sx4 += x2 * x2;
        sy += y;
        sxy += x * y;
        sx2y += x2 * y;
    }

    let m = [[sx4, sx3, sx2], [sx3, sx2, sx], [sx2, sx, n]];
    let rhs = [sx2y, sxy, sy];

    let det = det3(&m);
    if det.abs() < 1e-12 {
        return None;
    }
    let a = det3(&replace_col(&m, 0, &rhs)) / det;
    let b = det3(&replace_col(&m, 1, &rhs)) / det;
    let c = det3(&replace_col(&m, 2, &rhs)) / det;
    Some(Quadratic { a, b, c })
}

fn det3(m: &[[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

fn replace_col(m: &[[f64; 3]; 3], col: usize, rhs: &[f64; 3]) -> [[f64; 3]; 3] {
    let mut out = *m;
    for row in 0..3 {
        out[row][col] = rhs[row];
    }
    out
}
