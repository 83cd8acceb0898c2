//! Univariate Gauss quadrature on the unit interval.

use crate::Real;

/// Computes the `n`-point Gauss-Legendre rule on the interval `[0, 1]`.
///
/// The returned rule is exact for polynomials of degree `2n - 1`. Weights sum
/// to one. Nodes and weights are found by Newton iteration on the Legendre
/// recurrence in double precision and converted to `T` afterwards, so no
/// tabulated constants limit the admissible `n`.
///
/// # Panics
///
/// Panics if `n == 0`.
pub fn gauss_legendre<T: Real>(n: usize) -> (Vec<T>, Vec<T>) {
    assert!(n > 0, "Gauss-Legendre rules require at least one point");

    let mut weights = Vec::with_capacity(n);
    let mut points = Vec::with_capacity(n);

    // The rule is symmetric, so only the first half needs to be computed.
    for i in 0..(n + 1) / 2 {
        let (x, w) = legendre_root(n, i);
        points.push(x);
        weights.push(w);
    }
    for i in (0..n / 2).rev() {
        let x: f64 = points[i];
        let w: f64 = weights[i];
        points.push(-x);
        weights.push(w);
    }

    // Map from [-1, 1] to [0, 1].
    let weights = weights.into_iter().map(|w| T::from_f64(w / 2.0).expect("Weight must fit in T")).collect();
    let points = points
        .into_iter()
        .map(|x| T::from_f64((x + 1.0) / 2.0).expect("Node must fit in T"))
        .collect();
    (weights, points)
}

/// Finds the `i`-th root of the Legendre polynomial `P_n` on `[-1, 1]`
/// together with its Gauss weight.
fn legendre_root(n: usize, i: usize) -> (f64, f64) {
    // Chebyshev-like initial guess, accurate enough for Newton to converge
    // quadratically from the start.
    let mut x = (std::f64::consts::PI * (i as f64 + 0.75) / (n as f64 + 0.5)).cos();
    let mut dp = 0.0;
    for _ in 0..100 {
        let (p, p_prev) = evaluate_legendre(n, x);
        dp = n as f64 * (x * p - p_prev) / (x * x - 1.0);
        let dx = p / dp;
        x -= dx;
        if dx.abs() <= 1e-15 * (1.0 + x.abs()) {
            break;
        }
    }
    let w = 2.0 / ((1.0 - x * x) * dp * dp);
    (x, w)
}

/// Evaluates `(P_n(x), P_{n-1}(x))` by the three-term recurrence.
fn evaluate_legendre(n: usize, x: f64) -> (f64, f64) {
    let mut p_prev = 1.0;
    let mut p = x;
    if n == 0 {
        return (1.0, 0.0);
    }
    for k in 1..n {
        let k = k as f64;
        let p_next = ((2.0 * k + 1.0) * x * p - k * p_prev) / (k + 1.0);
        p_prev = p;
        p = p_next;
    }
    (p, p_prev)
}
