//! Stage evaluation for explicit embedded Runge-Kutta steps.
//!
//! The derivative function is split in two capabilities:
//!
//! - [`Environment`] is updated with every stage's `(t, y)` before the
//!   derivative is evaluated. This is where cached quantities that depend on
//!   the evaluation point (body ephemerides, frame rotations, densities)
//!   are refreshed.
//! - [`OdeSystem`] computes `dy/dt` from the environment and `(t, y)`.
//!
//! Both are called exactly once per stage, in increasing stage order, with
//! the evaluation points of the Butcher tableau.

use thiserror::Error;

use crate::coefficients::ButcherTableau;
use crate::error::IntegrationError;

/// Failure reported by a derivative function or environment update
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DerivativeError {
    message: String,
}

impl DerivativeError {
    /// Create an error with a description of the failure
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Description of the failure
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// System of ordinary differential equations: dy/dt = f(env, t, y)
///
/// `E` is the environment the derivative reads from; systems without one use
/// the default `()`.
///
/// # Example
/// ```
/// use embedded_rk::{DerivativeError, OdeSystem};
///
/// struct HarmonicOscillator { omega: f64 }
///
/// impl OdeSystem<2> for HarmonicOscillator {
///     fn rhs(&self, _env: &(), _t: f64, y: &[f64; 2], dydt: &mut [f64; 2]) -> Result<(), DerivativeError> {
///         dydt[0] = y[1];
///         dydt[1] = -self.omega * self.omega * y[0];
///         Ok(())
///     }
/// }
/// ```
pub trait OdeSystem<const N: usize, E = ()> {
    /// Evaluate the right-hand side of the ODE system
    ///
    /// # Arguments
    /// * `env` - Environment, already updated to `(t, y)`
    /// * `t` - Current time
    /// * `y` - Current state vector
    /// * `dydt` - Output: derivative dy/dt
    fn rhs(&self, env: &E, t: f64, y: &[f64; N], dydt: &mut [f64; N])
        -> Result<(), DerivativeError>;
}

/// Evaluation-point dependent state shared by the derivative function
pub trait Environment<const N: usize> {
    /// Bring the environment to the evaluation point `(t, y)`
    fn update(&mut self, t: f64, y: &[f64; N]) -> Result<(), DerivativeError>;
}

impl<const N: usize> Environment<N> for () {
    fn update(&mut self, _t: f64, _y: &[f64; N]) -> Result<(), DerivativeError> {
        Ok(())
    }
}

/// Result of evaluating all stages of one step attempt
#[derive(Debug, Clone, PartialEq)]
pub struct StageEvaluation<const N: usize> {
    /// Start of the step
    pub t: f64,
    /// Step size
    pub h: f64,
    /// Lower-order estimate at `t + h`
    pub lower: [f64; N],
    /// Higher-order estimate at `t + h`
    pub higher: [f64; N],
    /// Stage derivatives k_1..k_s
    pub stages: Vec<[f64; N]>,
}

/// Evaluate one derivative point: environment update, then the system.
pub(crate) fn evaluate_point<const N: usize, S, E>(
    sys: &S,
    env: &mut E,
    t: f64,
    y: &[f64; N],
    dydt: &mut [f64; N],
) -> Result<(), DerivativeError>
where
    S: OdeSystem<N, E>,
    E: Environment<N>,
{
    env.update(t, y)?;
    sys.rhs(env, t, y, dydt)
}

/// Compute all stages of a step and both embedded estimates.
///
/// A derivative failure aborts the evaluation; no partial result is
/// returned.
#[allow(clippy::needless_range_loop)]
pub fn evaluate_stages<const N: usize, S, E>(
    tableau: &ButcherTableau,
    sys: &S,
    env: &mut E,
    t: f64,
    y: &[f64; N],
    h: f64,
) -> Result<StageEvaluation<N>, IntegrationError>
where
    S: OdeSystem<N, E>,
    E: Environment<N>,
{
    let c = tableau.c();
    let mut stages: Vec<[f64; N]> = Vec::with_capacity(tableau.stages());
    let mut y_temp = [0.0; N];

    for i in 0..tableau.stages() {
        // y_temp = y + h * sum_{j<i} a[i][j] * k[j]
        let a = tableau.a_row(i);
        for n in 0..N {
            let mut sum = 0.0;
            for (a_ij, k_j) in a.iter().zip(&stages) {
                sum += a_ij * k_j[n];
            }
            y_temp[n] = y[n] + h * sum;
        }

        let t_i = t + c[i] * h;
        let mut k_i = [0.0; N];
        evaluate_point(sys, env, t_i, &y_temp, &mut k_i).map_err(|source| {
            IntegrationError::DerivativeFailed {
                t: t_i,
                stage: i,
                source,
            }
        })?;
        stages.push(k_i);
    }

    let lower = combine(y, h, tableau.b_lower(), &stages);
    let higher = combine(y, h, tableau.b_higher(), &stages);

    Ok(StageEvaluation {
        t,
        h,
        lower,
        higher,
        stages,
    })
}

/// y + h * sum_i b[i] * k[i]
#[allow(clippy::needless_range_loop)]
fn combine<const N: usize>(y: &[f64; N], h: f64, b: &[f64], stages: &[[f64; N]]) -> [f64; N] {
    let mut y_new = [0.0; N];
    for n in 0..N {
        let mut sum = 0.0;
        for (b_i, k_i) in b.iter().zip(stages) {
            sum += b_i * k_i[n];
        }
        y_new[n] = y[n] + h * sum;
    }
    y_new
}
