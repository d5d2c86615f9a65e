//! Dense output over one accepted step.
//!
//! Two interpolants are available:
//!
//! - the continuous extension of tableaux that carry dense weights
//!   (Dormand-Prince 5(4), fifth order inside the step);
//! - a cubic Hermite interpolant from the endpoint states and derivatives,
//!   O(h⁴) accurate, usable with any tableau.

/// Cubic Hermite interpolation between `(t_a, y_a, f_a)` and `(t_b, y_b, f_b)`
#[allow(clippy::needless_range_loop)]
pub fn hermite_cubic<const N: usize>(
    t_a: f64,
    y_a: &[f64; N],
    f_a: &[f64; N],
    t_b: f64,
    y_b: &[f64; N],
    f_b: &[f64; N],
    t: f64,
) -> [f64; N] {
    let dt = t_b - t_a;
    let alpha = (t - t_a) / dt;
    let a2 = alpha * alpha;
    let a3 = a2 * alpha;
    // Hermite basis functions
    let h00 = 1.0 - 3.0 * a2 + 2.0 * a3; // y_a weight
    let h10 = alpha - 2.0 * a2 + a3; // f_a weight (scaled by dt)
    let h01 = 3.0 * a2 - 2.0 * a3; // y_b weight
    let h11 = -a2 + a3; // f_b weight (scaled by dt)

    let mut y = [0.0; N];
    for i in 0..N {
        y[i] = h00 * y_a[i] + h10 * dt * f_a[i] + h01 * y_b[i] + h11 * dt * f_b[i];
    }
    y
}

/// Continuous extension of a first-same-as-last tableau.
///
/// `stages` are the step's stage derivatives; the last one is the derivative
/// at `(t + h, y_b)`. `theta` is the fraction of the step, in `[0, 1]`.
#[allow(clippy::needless_range_loop)]
pub fn continuous_extension<const N: usize>(
    h: f64,
    y_a: &[f64; N],
    y_b: &[f64; N],
    stages: &[[f64; N]],
    dense_weights: &[f64],
    theta: f64,
) -> [f64; N] {
    let (Some(k_first), Some(k_last)) = (stages.first(), stages.last()) else {
        return *y_a;
    };
    let theta1 = 1.0 - theta;

    let mut y = [0.0; N];
    for n in 0..N {
        let r2 = y_b[n] - y_a[n];
        let r3 = h * k_first[n] - r2;
        let r4 = r2 - h * k_last[n] - r3;
        let mut r5 = 0.0;
        for (d_i, k_i) in dense_weights.iter().zip(stages) {
            r5 += d_i * k_i[n];
        }
        r5 *= h;
        y[n] = y_a[n] + theta * (r2 + theta1 * (r3 + theta * (r4 + theta1 * r5)));
    }
    y
}
