//! Adaptive Embedded Runge-Kutta Integration Session
//!
//! [`AdaptiveIntegrator`] owns the current and previous `(t, y)` pairs of a
//! propagation and advances them with an embedded pair from
//! [`RungeKuttaMethod`](crate::RungeKuttaMethod):
//!
//! ```text
//!            perform_step / integrate_to (accepted)
//!   Ready ─────────────────────────────────────────▶ Stepped
//!     ▲                                                 │
//!     └──────────── rollback / reinitialize ────────────┘
//! ```
//!
//! Rollback restores the bit-identical pair that existed before the most
//! recent accepted step, and is available only in `Stepped`. A step that
//! fails for any reason leaves `(t, y)` untouched and drops back to `Ready`.

use std::sync::Arc;

use log::{debug, trace, warn};

use crate::coefficients::{ButcherTableau, IntegratedOrder};
use crate::controller::{clamp_step_size, DefaultStepControl, StepSizeControl, StepSizeInput};
use crate::dense::{continuous_extension, hermite_cubic};
use crate::error::{ConfigError, IntegrationError};
use crate::settings::IntegratorSettings;
use crate::stages::{evaluate_point, evaluate_stages, Environment, OdeSystem, StageEvaluation};

/// Integration statistics for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    /// Total number of function evaluations
    pub fn_evals: u64,
    /// Number of accepted steps
    pub accepted_steps: u64,
    /// Number of rejected step attempts
    pub rejected_steps: u64,
}

/// Rollback availability of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No step since construction, rollback, reinitialization or a failed step
    Ready,
    /// Exactly one accepted step since the last `Ready`; rollback is legal
    Stepped,
}

/// Stage data of the last accepted step
#[derive(Debug, Clone)]
struct AcceptedStep<const N: usize> {
    h: f64,
    lower: [f64; N],
    higher: [f64; N],
    stages: Vec<[f64; N]>,
    /// f(t + h, y_{n+1}), evaluated on the first Hermite interpolation
    end_derivative: Option<[f64; N]>,
}

impl<const N: usize> AcceptedStep<N> {
    fn new(eval: StageEvaluation<N>) -> Self {
        Self {
            h: eval.h,
            lower: eval.lower,
            higher: eval.higher,
            stages: eval.stages,
            end_derivative: None,
        }
    }
}

/// Adaptive embedded Runge-Kutta integration session
///
/// # Type Parameters
/// * `N` - Dimension of the state vector
/// * `S` - ODE system
/// * `E` - Environment updated before every stage (`()` for none)
///
/// # Example
/// ```
/// use embedded_rk::{
///     AdaptiveIntegrator, DerivativeError, IntegratorSettings, OdeSystem, RungeKuttaMethod,
///     StepLimits, Tolerances,
/// };
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
///
/// let settings = IntegratorSettings::new(
///     RungeKuttaMethod::Fehlberg78,
///     StepLimits::new(1e-8, 1.0),
///     Tolerances::new(1e-12, 1e-12),
/// );
/// let mut session = AdaptiveIntegrator::new(HarmonicOscillator { omega: 1.0 }, 0.0, [1.0, 0.0], settings)?;
/// let y = session.integrate_to(std::f64::consts::PI, 0.1)?;
/// assert!((y[0] + 1.0).abs() < 1e-9);
/// # Ok::<(), embedded_rk::IntegrationError>(())
/// ```
pub struct AdaptiveIntegrator<const N: usize, S, E = ()> {
    system: S,
    environment: E,
    tableau: Arc<ButcherTableau>,
    settings: IntegratorSettings<N>,
    control: Box<dyn StepSizeControl<N>>,

    t: f64,
    y: [f64; N],
    t_prev: f64,
    y_prev: [f64; N],
    state: SessionState,

    next_h: Option<f64>,
    last_h: Option<f64>,
    last_error: Option<f64>,
    last_step: Option<AcceptedStep<N>>,

    stats: Stats,
}

impl<const N: usize, S> AdaptiveIntegrator<N, S, ()>
where
    S: OdeSystem<N>,
{
    /// Create a session without an environment.
    ///
    /// Fails if the settings are invalid, `N == 0`, or `(t0, y0)` is not
    /// finite.
    pub fn new(
        system: S,
        t0: f64,
        y0: [f64; N],
        settings: IntegratorSettings<N>,
    ) -> Result<Self, ConfigError> {
        Self::with_environment(system, (), t0, y0, settings)
    }
}

impl<const N: usize, S, E> AdaptiveIntegrator<N, S, E>
where
    S: OdeSystem<N, E>,
    E: Environment<N>,
{
    /// Create a session whose system reads from `environment`.
    pub fn with_environment(
        system: S,
        environment: E,
        t0: f64,
        y0: [f64; N],
        settings: IntegratorSettings<N>,
    ) -> Result<Self, ConfigError> {
        settings.validate()?;
        validate_initial_condition(t0, &y0)?;
        let tableau = settings.method.tableau()?;

        Ok(Self {
            system,
            environment,
            tableau,
            settings,
            control: Box::new(DefaultStepControl),
            t: t0,
            y: y0,
            t_prev: t0,
            y_prev: y0,
            state: SessionState::Ready,
            next_h: None,
            last_h: None,
            last_error: None,
            last_step: None,
            stats: Stats::default(),
        })
    }

    /// Replace the default step-size policy
    pub fn with_step_control<P>(mut self, policy: P) -> Self
    where
        P: StepSizeControl<N> + 'static,
    {
        self.control = Box::new(policy);
        self
    }

    /// Integrate with a custom tableau instead of the one named in the
    /// settings.
    pub fn with_tableau(mut self, tableau: impl Into<Arc<ButcherTableau>>) -> Self {
        self.tableau = tableau.into();
        self.last_step = None;
        self
    }

    /// Advance by one accepted step.
    ///
    /// `h` is clamped into the step limits (sign preserved). Rejected attempts
    /// are retried with the policy's proposal until one is accepted. A rejected
    /// attempt at the minimum step size, or one the policy answers without a
    /// shorter step, fails with `StepSizeExhausted`.
    ///
    /// # Returns
    /// The accepted (signed) step size.
    pub fn perform_step(&mut self, h: f64) -> Result<f64, IntegrationError> {
        if !h.is_finite() || h == 0.0 {
            return Err(IntegrationError::InvalidInput {
                message: format!("step size must be finite and non-zero, got {}", h),
            });
        }
        let h = clamp_step_size(h, &self.settings.limits);
        let mut budget = self.settings.max_steps;
        let result = self.advance(h, &mut budget);
        if result.is_err() {
            self.state = SessionState::Ready;
        }
        result
    }

    /// Integrate until the current time equals `target` exactly.
    ///
    /// Only the magnitude of `guess` is used; the direction follows
    /// `target - t`. The last step is shortened to land on `target` and may be
    /// shorter than the minimum step size.
    ///
    /// # Returns
    /// The state at `target`.
    pub fn integrate_to(&mut self, target: f64, guess: f64) -> Result<[f64; N], IntegrationError> {
        if !target.is_finite() || !guess.is_finite() || guess == 0.0 {
            return Err(IntegrationError::InvalidInput {
                message: format!(
                    "target and step guess must be finite, guess non-zero (target = {}, guess = {})",
                    target, guess
                ),
            });
        }
        if target == self.t {
            return Ok(self.y);
        }

        let direction = (target - self.t).signum();
        let limits = self.settings.limits;
        let mut h_mag = guess.abs().clamp(limits.min, limits.max);
        let mut budget = self.settings.max_steps;

        while self.t != target {
            let remaining = target - self.t;
            let (h, covers_target) = if h_mag >= remaining.abs() {
                (remaining, true)
            } else {
                (direction * h_mag, false)
            };

            let accepted = match self.advance(h, &mut budget) {
                Ok(accepted) => accepted,
                Err(e) => {
                    self.state = SessionState::Ready;
                    return Err(e);
                }
            };

            // Land exactly on the target; also absorb rounding overshoot
            if (covers_target && accepted == h) || (self.t - target) * direction > 0.0 {
                self.t = target;
            }
            h_mag = self.next_h.map_or(h_mag, f64::abs);
        }

        Ok(self.y)
    }

    /// Restore the `(t, y)` pair held before the most recent accepted step.
    ///
    /// Returns `false`, leaving the session untouched, when there is nothing
    /// to roll back.
    pub fn rollback(&mut self) -> bool {
        match self.state {
            SessionState::Ready => false,
            SessionState::Stepped => {
                debug!(
                    "rollback from t = {} to t = {}",
                    self.t, self.t_prev
                );
                self.t = self.t_prev;
                self.y = self.y_prev;
                self.state = SessionState::Ready;
                true
            }
        }
    }

    /// Restart from `(t, y)`, e.g. after a discrete event changed the state.
    ///
    /// Clears rollback availability and the last-step diagnostics; the next
    /// step size recommendation is kept.
    pub fn reinitialize(&mut self, t: f64, y: [f64; N]) -> Result<(), IntegrationError> {
        validate_initial_condition(t, &y)?;
        debug!("reinitialize at t = {}", t);
        self.t = t;
        self.y = y;
        self.t_prev = t;
        self.y_prev = y;
        self.state = SessionState::Ready;
        self.last_h = None;
        self.last_error = None;
        self.last_step = None;
        Ok(())
    }

    /// Dense output at `t` inside the last accepted step.
    ///
    /// Uses the tableau's continuous extension when it has one, otherwise a
    /// cubic Hermite interpolant (one extra derivative evaluation per step,
    /// on first use).
    pub fn interpolate(&mut self, t: f64) -> Result<[f64; N], IntegrationError> {
        if self.state != SessionState::Stepped {
            return Err(IntegrationError::NoDenseOutput);
        }
        let step = self.last_step.as_mut().ok_or(IntegrationError::NoDenseOutput)?;

        let (start, end) = (self.t_prev, self.t);
        let inside = if start <= end {
            start <= t && t <= end
        } else {
            end <= t && t <= start
        };
        if !inside || !t.is_finite() {
            return Err(IntegrationError::InterpolationOutOfRange { t, start, end });
        }
        if t == end {
            return Ok(self.y);
        }

        if let Some(dense) = self.tableau.dense_weights() {
            let theta = (t - start) / (end - start);
            return Ok(continuous_extension(
                step.h,
                &self.y_prev,
                &self.y,
                &step.stages,
                dense,
                theta,
            ));
        }

        let f_end = match step.end_derivative {
            Some(f) => f,
            None => {
                let mut f = [0.0; N];
                self.stats.fn_evals += 1;
                evaluate_point(&self.system, &mut self.environment, end, &self.y, &mut f).map_err(
                    |source| IntegrationError::DerivativeFailed {
                        t: end,
                        stage: self.tableau.stages(),
                        source,
                    },
                )?;
                step.end_derivative = Some(f);
                f
            }
        };
        Ok(hermite_cubic(
            start,
            &self.y_prev,
            &step.stages[0],
            end,
            &self.y,
            &f_end,
            t,
        ))
    }

    /// Attempt steps from the current state until one is accepted.
    ///
    /// Every retry is strictly shorter than the attempt it replaces, so a
    /// step sized to reach a target cannot overshoot it. A rejection without
    /// a shorter proposal ends in `StepSizeExhausted`. Every attempt consumes
    /// one unit of `budget`.
    fn advance(&mut self, mut h: f64, budget: &mut u64) -> Result<f64, IntegrationError> {
        let limits = self.settings.limits;
        let stages = self.tableau.stages() as u64;

        loop {
            if *budget == 0 {
                return Err(IntegrationError::MaxStepsExceeded(self.settings.max_steps));
            }
            *budget -= 1;

            let eval = match evaluate_stages(
                &self.tableau,
                &self.system,
                &mut self.environment,
                self.t,
                &self.y,
                h,
            ) {
                Ok(eval) => eval,
                Err(e) => {
                    if let IntegrationError::DerivativeFailed { stage, .. } = &e {
                        self.stats.fn_evals += *stage as u64 + 1;
                    }
                    return Err(e);
                }
            };
            self.stats.fn_evals += stages;

            let decision = self.control.decide(&StepSizeInput {
                step_size: h,
                lower_order: self.tableau.lower_order(),
                higher_order: self.tableau.higher_order(),
                lower: eval.lower,
                higher: eval.higher,
                tolerances: self.settings.tolerances.clone(),
                controller: self.settings.controller,
                limits,
            });
            self.last_error = Some(decision.error);

            let propagated = match self.tableau.integrated_order() {
                IntegratedOrder::Lower => eval.lower,
                IntegratedOrder::Higher => eval.higher,
            };
            let finite = decision.error.is_finite()
                && decision.next_step_size.is_finite()
                && propagated.iter().all(|v| v.is_finite());
            if !finite {
                self.stats.rejected_steps += 1;
                warn!(
                    "non-finite error estimate or state at t = {} with h = {}",
                    self.t, h
                );
                return Err(IntegrationError::NonFiniteState { t: self.t, h });
            }

            if decision.accepted {
                self.stats.accepted_steps += 1;
                self.t_prev = self.t;
                self.y_prev = self.y;
                self.t += h;
                self.y = propagated;
                self.state = SessionState::Stepped;
                self.last_h = Some(h);
                self.next_h = Some(clamp_step_size(decision.next_step_size, &limits));
                self.last_step = Some(AcceptedStep::new(eval));
                trace!(
                    "accepted step h = {} to t = {} (error {:.3e})",
                    h,
                    self.t,
                    decision.error
                );
                return Ok(h);
            }

            self.stats.rejected_steps += 1;
            if h.abs() <= limits.min {
                warn!(
                    "step size exhausted at t = {}: h = {} rejected with error {:.3e}",
                    self.t, h, decision.error
                );
                return Err(IntegrationError::StepSizeExhausted {
                    t: self.t,
                    h,
                    error: decision.error,
                });
            }

            let proposed = clamp_step_size(decision.next_step_size, &limits).abs();
            if proposed >= h.abs() {
                warn!(
                    "step size exhausted at t = {}: h = {} rejected without a smaller proposal",
                    self.t, h
                );
                return Err(IntegrationError::StepSizeExhausted {
                    t: self.t,
                    h,
                    error: decision.error,
                });
            }
            debug!(
                "rejected step h = {} at t = {} (error {:.3e}), retrying with {}",
                h,
                self.t,
                decision.error,
                proposed
            );
            h = h.signum() * proposed;
        }
    }

    /// Current independent variable
    pub fn current_time(&self) -> f64 {
        self.t
    }

    /// Current state
    pub fn current_state(&self) -> &[f64; N] {
        &self.y
    }

    /// Independent variable before the most recent accepted step
    pub fn previous_time(&self) -> f64 {
        self.t_prev
    }

    /// State before the most recent accepted step
    pub fn previous_state(&self) -> &[f64; N] {
        &self.y_prev
    }

    /// Step size recommended by the policy after the last accepted step
    pub fn next_step_size(&self) -> Option<f64> {
        self.next_h
    }

    /// Size of the last accepted step
    pub fn last_step_size(&self) -> Option<f64> {
        self.last_h
    }

    /// Error measure of the most recent attempt, accepted or rejected
    pub fn last_error(&self) -> Option<f64> {
        self.last_error
    }

    /// Lower-order estimate of the last accepted step
    pub fn lower_order_estimate(&self) -> Option<&[f64; N]> {
        self.last_step.as_ref().map(|s| &s.lower)
    }

    /// Higher-order estimate of the last accepted step
    pub fn higher_order_estimate(&self) -> Option<&[f64; N]> {
        self.last_step.as_ref().map(|s| &s.higher)
    }

    /// Stage derivatives k_1..k_s of the last accepted step
    pub fn stage_derivatives(&self) -> Option<&[[f64; N]]> {
        self.last_step.as_ref().map(|s| s.stages.as_slice())
    }

    /// Whether [`rollback`](Self::rollback) would succeed
    pub fn can_rollback(&self) -> bool {
        self.state == SessionState::Stepped
    }

    /// Current rollback state
    pub fn session_state(&self) -> SessionState {
        self.state
    }

    /// Statistics accumulated since construction or the last reset
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Reset statistics
    pub fn reset_stats(&mut self) {
        self.stats = Stats::default();
    }

    /// The integrated system
    pub fn system(&self) -> &S {
        &self.system
    }

    /// The environment
    pub fn environment(&self) -> &E {
        &self.environment
    }

    /// Mutable access to the environment, e.g. to change model parameters
    /// between steps
    pub fn environment_mut(&mut self) -> &mut E {
        &mut self.environment
    }

    /// Coefficient table in use
    pub fn tableau(&self) -> &ButcherTableau {
        &self.tableau
    }

    /// Session settings
    pub fn settings(&self) -> &IntegratorSettings<N> {
        &self.settings
    }
}

fn validate_initial_condition<const N: usize>(t: f64, y: &[f64; N]) -> Result<(), ConfigError> {
    if !t.is_finite() {
        return Err(ConfigError::InvalidInitialCondition {
            message: format!("t = {} is not finite", t),
        });
    }
    for (i, &val) in y.iter().enumerate() {
        if !val.is_finite() {
            return Err(ConfigError::InvalidInitialCondition {
                message: format!("y[{}] = {} is not finite", i, val),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coefficients::RungeKuttaMethod;
    use crate::controller::{StepController, StepDecision, Tolerances};
    use crate::settings::StepLimits;
    use crate::stages::DerivativeError;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    fn settings<const N: usize>(method: RungeKuttaMethod, tol: f64, min: f64, max: f64) -> IntegratorSettings<N> {
        IntegratorSettings::new(method, StepLimits::new(min, max), Tolerances::new(tol, tol))
    }

    /// Harmonic oscillator: y'' + ω²y = 0
    /// State: [y, y']
    struct HarmonicOscillator {
        omega: f64,
    }

    impl OdeSystem<2> for HarmonicOscillator {
        fn rhs(&self, _env: &(), _t: f64, y: &[f64; 2], dydt: &mut [f64; 2]) -> Result<(), DerivativeError> {
            dydt[0] = y[1];
            dydt[1] = -self.omega * self.omega * y[0];
            Ok(())
        }
    }

    /// y' = y
    struct ExpGrowth;

    impl OdeSystem<1> for ExpGrowth {
        fn rhs(&self, _env: &(), _t: f64, y: &[f64; 1], dydt: &mut [f64; 1]) -> Result<(), DerivativeError> {
            dydt[0] = y[0];
            Ok(())
        }
    }

    #[test]
    fn test_harmonic_oscillator() {
        let tf = 2.0 * PI; // One period

        for (method, bound) in [
            (RungeKuttaMethod::Fehlberg78, 1e-10),
            (RungeKuttaMethod::DormandPrince54, 1e-10),
            (RungeKuttaMethod::Fehlberg45, 1e-8),
        ] {
            let mut session =
                AdaptiveIntegrator::new(HarmonicOscillator { omega: 1.0 }, 0.0, [1.0, 0.0], settings(method, 1e-12, 1e-8, 1.0))
                    .unwrap();
            let y_final = session.integrate_to(tf, 0.1).unwrap();

            // Should return to initial conditions after one period
            assert_eq!(session.current_time(), tf);
            assert!(
                (y_final[0] - 1.0).abs() < bound,
                "{}: y(2π) = {}, expected 1.0",
                method,
                y_final[0]
            );
            assert!(y_final[1].abs() < bound, "{}: y'(2π) = {}", method, y_final[1]);

            println!("{}: final y = [{:.15}, {:.15}]", method, y_final[0], y_final[1]);
            println!("  Stats: {:?}", session.stats());
        }
    }

    #[test]
    fn test_exponential_decay() {
        // y' = -y, y(0) = 1
        // Exact: y = exp(-t)
        struct ExpDecay;

        impl OdeSystem<1> for ExpDecay {
            fn rhs(&self, _env: &(), _t: f64, y: &[f64; 1], dydt: &mut [f64; 1]) -> Result<(), DerivativeError> {
                dydt[0] = -y[0];
                Ok(())
            }
        }

        let tf = 5.0;
        let mut session =
            AdaptiveIntegrator::new(ExpDecay, 0.0, [1.0], settings(RungeKuttaMethod::Fehlberg78, 1e-14, 1e-10, 1.0))
                .unwrap();
        let y_final = session.integrate_to(tf, 0.1).unwrap();
        let exact = (-tf).exp();

        let rel_error = (y_final[0] - exact).abs() / exact;
        // Error accumulates over the interval; 1e-11 is appropriate for tol=1e-14 over t=5
        assert!(rel_error < 1e-11, "Relative error {} too large", rel_error);

        println!("  y({}) = {:.15}, exact = {:.15}", tf, y_final[0], exact);
        println!("  Relative error: {:.3e}", rel_error);
    }

    /// Two-body problem for testing energy conservation
    struct TwoBody {
        mu: f64, // GM parameter
    }

    impl OdeSystem<6> for TwoBody {
        fn rhs(&self, _env: &(), _t: f64, y: &[f64; 6], dydt: &mut [f64; 6]) -> Result<(), DerivativeError> {
            let r = (y[0] * y[0] + y[1] * y[1] + y[2] * y[2]).sqrt();
            if r == 0.0 {
                return Err(DerivativeError::new("collision with central body"));
            }
            let mu_r3 = self.mu / (r * r * r);

            dydt[0] = y[3];
            dydt[1] = y[4];
            dydt[2] = y[5];
            dydt[3] = -mu_r3 * y[0];
            dydt[4] = -mu_r3 * y[1];
            dydt[5] = -mu_r3 * y[2];
            Ok(())
        }
    }

    #[test]
    fn test_two_body_energy_conservation() {
        let mu: f64 = 398600.4418; // km³/s² (Earth)

        // Circular orbit at 6878 km (500 km altitude)
        let r0: f64 = 6878.0;
        let v0 = (mu / r0).sqrt();
        let y0 = [r0, 0.0, 0.0, 0.0, v0, 0.0];
        let period = 2.0 * PI * (r0.powi(3) / mu).sqrt();

        let compute_energy = |y: &[f64; 6]| {
            let r = (y[0] * y[0] + y[1] * y[1] + y[2] * y[2]).sqrt();
            let v2 = y[3] * y[3] + y[4] * y[4] + y[5] * y[5];
            0.5 * v2 - mu / r
        };
        let e0 = compute_energy(&y0);

        for method in RungeKuttaMethod::ALL {
            let mut session =
                AdaptiveIntegrator::new(TwoBody { mu }, 0.0, y0, settings(method, 1e-12, 1e-6, 1e4)).unwrap();
            let y_final = session.integrate_to(period, 60.0).unwrap();

            let rel_energy_error = (compute_energy(&y_final) - e0).abs() / e0.abs();
            assert_eq!(session.current_time(), period);
            assert!(
                rel_energy_error < 1e-9,
                "{}: energy drift {} exceeds threshold",
                method,
                rel_energy_error
            );
            println!("{}: relative drift {:.3e}, stats {:?}", method, rel_energy_error, session.stats());
        }
    }

    // ==================== Stepping ====================

    #[test]
    fn test_backward_integration() {
        // Harmonic oscillator integrated backward from 2π to 0
        let tf = 2.0 * PI;
        let mut session = AdaptiveIntegrator::new(
            HarmonicOscillator { omega: 1.0 },
            tf,
            [1.0, 0.0],
            settings(RungeKuttaMethod::Fehlberg78, 1e-12, 1e-8, 1.0),
        )
        .unwrap();

        // Positive guess: direction comes from the target
        let y_final = session.integrate_to(0.0, 0.1).unwrap();

        assert_eq!(session.current_time(), 0.0);
        assert!((y_final[0] - 1.0).abs() < 1e-10, "y(0) = {}, expected 1.0", y_final[0]);
        assert!(y_final[1].abs() < 1e-10, "y'(0) = {}, expected 0.0", y_final[1]);
        assert!(session.last_step_size().unwrap() < 0.0);
    }

    #[test]
    fn test_perform_step_clamps_to_limits() {
        // Infinite tolerances accept every step
        let s = IntegratorSettings::new(
            RungeKuttaMethod::Fehlberg45,
            StepLimits::new(1e-3, 0.5),
            Tolerances::new(f64::INFINITY, f64::INFINITY),
        );
        let mut session = AdaptiveIntegrator::new(ExpGrowth, 0.0, [1.0], s).unwrap();

        assert_eq!(session.perform_step(10.0).unwrap(), 0.5);
        assert_eq!(session.current_time(), 0.5);
        assert_eq!(session.perform_step(1e-9).unwrap(), 1e-3);
        assert_eq!(session.perform_step(-10.0).unwrap(), -0.5);
        assert_eq!(session.last_error(), Some(0.0));
        assert_eq!(session.next_step_size(), Some(-0.5));
    }

    #[test]
    fn test_perform_step_rejects_invalid_step() {
        let mut session =
            AdaptiveIntegrator::new(ExpGrowth, 0.0, [1.0], settings(RungeKuttaMethod::Fehlberg45, 1e-8, 1e-6, 1.0))
                .unwrap();
        for h in [0.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(session.perform_step(h), Err(IntegrationError::InvalidInput { .. })));
        }
        assert_eq!(session.stats(), &Stats::default());
    }

    #[test]
    fn test_step_rejection_with_large_h0() {
        let tf = 2.0 * PI;
        let mut session = AdaptiveIntegrator::new(
            HarmonicOscillator { omega: 1.0 },
            0.0,
            [1.0, 0.0],
            settings(RungeKuttaMethod::Fehlberg78, 1e-12, 1e-8, 100.0),
        )
        .unwrap();

        // h0 = 100 is absurdly large for this problem
        let y_final = session.integrate_to(tf, 100.0).unwrap();
        assert_eq!(session.current_time(), tf);
        assert!((y_final[0] - 1.0).abs() < 1e-9, "y(2π) = {}, expected 1.0", y_final[0]);
        assert!(session.stats().rejected_steps > 0);
        // Every attempt evaluated all 13 stages
        let attempts = session.stats().accepted_steps + session.stats().rejected_steps;
        assert_eq!(session.stats().fn_evals, 13 * attempts);
    }

    #[test]
    fn test_zero_length_integration() {
        let mut session =
            AdaptiveIntegrator::new(ExpGrowth, 5.0, [42.0], settings(RungeKuttaMethod::Fehlberg45, 1e-8, 1e-6, 1.0))
                .unwrap();
        let y = session.integrate_to(5.0, 0.1).unwrap();
        assert_eq!(y, [42.0]);
        assert_eq!(session.session_state(), SessionState::Ready);
        assert_eq!(session.stats().fn_evals, 0);
    }

    #[test]
    fn test_max_steps_exceeded() {
        let s = settings(RungeKuttaMethod::Fehlberg45, 1e-12, 1e-6, 1e-3).with_max_steps(5);
        let mut session = AdaptiveIntegrator::new(ExpGrowth, 0.0, [1.0], s).unwrap();

        let result = session.integrate_to(100.0, 0.01);
        assert!(
            matches!(result, Err(IntegrationError::MaxStepsExceeded(5))),
            "Expected MaxStepsExceeded, got {:?}",
            result
        );
        // Accepted steps before the bound are kept
        assert!(session.current_time() > 0.0);
        assert!(!session.can_rollback());
    }

    #[test]
    fn test_step_size_exhausted() {
        // Large, rapidly oscillating derivative with a pure relative tolerance
        struct Stiff;
        impl OdeSystem<1> for Stiff {
            fn rhs(&self, _env: &(), t: f64, _y: &[f64; 1], dydt: &mut [f64; 1]) -> Result<(), DerivativeError> {
                dydt[0] = 1e6 * (1e3 * t).sin();
                Ok(())
            }
        }

        let s = IntegratorSettings::new(
            RungeKuttaMethod::Fehlberg45,
            StepLimits::new(1e-2, 1.0),
            Tolerances::new(0.0, 1e-12),
        );
        let mut session = AdaptiveIntegrator::new(Stiff, 0.0, [1.0], s).unwrap();

        match session.perform_step(0.5) {
            Err(IntegrationError::StepSizeExhausted { t, h, error }) => {
                assert_eq!(t, 0.0);
                assert_eq!(h, 1e-2);
                assert!(error > 1.0);
            }
            other => panic!("Expected StepSizeExhausted, got {:?}", other),
        }
        // Last good state preserved
        assert_eq!(session.current_time(), 0.0);
        assert_eq!(session.current_state(), &[1.0]);
        assert_eq!(session.stats().accepted_steps, 0);
        assert!(session.last_error().unwrap() > 1.0);
    }

    #[test]
    fn test_non_shrinking_controller_rejected() {
        let mut s = settings(RungeKuttaMethod::Fehlberg45, 1e-14, 1e-6, 10.0).with_max_steps(1000);
        s.controller = StepController {
            safety: 1.0,
            max_factor: 4.0,
            min_factor: 1.0,
        };
        assert!(matches!(
            AdaptiveIntegrator::new(ExpGrowth, 0.0, [1.0], s),
            Err(ConfigError::InvalidController { .. })
        ));
    }

    #[test]
    fn test_policy_without_smaller_retry_exhausts() {
        let s = settings(RungeKuttaMethod::Fehlberg45, 1e-14, 1e-6, 10.0).with_max_steps(1000);
        let stubborn = |input: &StepSizeInput<1>| StepDecision {
            next_step_size: input.step_size,
            accepted: false,
            error: 2.0,
        };
        let mut session = AdaptiveIntegrator::new(ExpGrowth, 0.0, [1.0], s)
            .unwrap()
            .with_step_control(stubborn);

        match session.perform_step(1.0) {
            Err(IntegrationError::StepSizeExhausted { t, h, error }) => {
                assert_eq!(t, 0.0);
                assert_eq!(h, 1.0);
                assert_eq!(error, 2.0);
            }
            other => panic!("Expected StepSizeExhausted, got {:?}", other),
        }
        assert_eq!(session.stats().rejected_steps, 1);
        assert_eq!(session.current_time(), 0.0);
        assert_eq!(session.current_state(), &[1.0]);
    }

    #[test]
    fn test_derivative_failure_leaves_state_unchanged() {
        // Fails for t > 1.2
        struct Bounded;
        impl OdeSystem<1> for Bounded {
            fn rhs(&self, _env: &(), t: f64, y: &[f64; 1], dydt: &mut [f64; 1]) -> Result<(), DerivativeError> {
                if t > 1.2 {
                    return Err(DerivativeError::new("outside model validity"));
                }
                dydt[0] = y[0];
                Ok(())
            }
        }

        let mut session =
            AdaptiveIntegrator::new(Bounded, 0.0, [1.0], settings(RungeKuttaMethod::DormandPrince54, 1e-10, 1e-6, 0.5))
                .unwrap();
        session.integrate_to(1.0, 0.1).unwrap();
        let t_before = session.current_time();
        let y_before = *session.current_state();
        assert!(session.can_rollback());

        let result = session.perform_step(0.5);
        match result {
            Err(IntegrationError::DerivativeFailed { t, source, .. }) => {
                assert!(t > 1.2);
                assert_eq!(source.message(), "outside model validity");
            }
            other => panic!("Expected DerivativeFailed, got {:?}", other),
        }
        assert_eq!(session.current_time(), t_before);
        assert_eq!(session.current_state(), &y_before);
        // A failed step ends rollback availability
        assert!(!session.can_rollback());
        assert!(!session.rollback());
    }

    #[test]
    fn test_non_finite_state() {
        // Derivative overflows to infinity
        struct BlowUp;
        impl OdeSystem<1> for BlowUp {
            fn rhs(&self, _env: &(), _t: f64, y: &[f64; 1], dydt: &mut [f64; 1]) -> Result<(), DerivativeError> {
                dydt[0] = y[0] * y[0] * 1e300;
                Ok(())
            }
        }

        let s = IntegratorSettings::new(
            RungeKuttaMethod::Fehlberg45,
            StepLimits::new(1e-3, 1.0),
            Tolerances::new(f64::INFINITY, f64::INFINITY),
        );
        let mut session = AdaptiveIntegrator::new(BlowUp, 0.0, [1e10], s).unwrap();
        let result = session.perform_step(1.0);
        assert!(
            matches!(result, Err(IntegrationError::NonFiniteState { t, .. }) if t == 0.0),
            "Expected NonFiniteState, got {:?}",
            result
        );
        assert_eq!(session.current_state(), &[1e10]);
    }

    // ==================== Rollback and accessors ====================

    #[test]
    fn test_rollback_exactness() {
        let mut session =
            AdaptiveIntegrator::new(ExpGrowth, 0.0, [1.0], settings(RungeKuttaMethod::Fehlberg56, 1e-10, 1e-6, 0.5))
                .unwrap();
        assert_eq!(session.session_state(), SessionState::Ready);
        assert!(!session.rollback());

        session.perform_step(0.1).unwrap();
        let (t1, y1) = (session.current_time(), *session.current_state());
        session.perform_step(0.1).unwrap();
        assert_eq!(session.previous_time(), t1);
        assert_eq!(session.previous_state(), &y1);
        assert_eq!(session.session_state(), SessionState::Stepped);

        assert!(session.rollback());
        assert_eq!(session.current_time().to_bits(), t1.to_bits());
        assert_eq!(session.current_state()[0].to_bits(), y1[0].to_bits());

        // Only one level of rollback
        assert!(!session.rollback());
        assert_eq!(session.current_time(), t1);
        assert_eq!(session.session_state(), SessionState::Ready);
    }

    #[test]
    fn test_idempotent_accessors() {
        let mut session = AdaptiveIntegrator::new(
            HarmonicOscillator { omega: 2.0 },
            0.0,
            [1.0, 0.0],
            settings(RungeKuttaMethod::Fehlberg78, 1e-12, 1e-8, 1.0),
        )
        .unwrap();
        assert_eq!(session.next_step_size(), None);
        assert_eq!(session.lower_order_estimate(), None);

        session.perform_step(0.1).unwrap();
        let a = *session.current_state();
        let b = *session.current_state();
        assert_eq!(a, b);
        assert_eq!(session.next_step_size(), session.next_step_size());
        assert_eq!(session.stage_derivatives().unwrap().len(), 13);

        // Fehlberg tables propagate the lower-order estimate
        assert_eq!(session.lower_order_estimate(), Some(&a));
        let higher = session.higher_order_estimate().unwrap();
        assert!((higher[0] - a[0]).abs() < 1e-10);
    }

    #[test]
    fn test_dormand_prince_propagates_higher_order() {
        let mut session = AdaptiveIntegrator::new(
            ExpGrowth,
            0.0,
            [1.0],
            settings(RungeKuttaMethod::DormandPrince54, 1e-10, 1e-6, 1.0),
        )
        .unwrap();
        session.perform_step(0.1).unwrap();
        assert_eq!(session.higher_order_estimate(), Some(session.current_state()));
        assert_ne!(session.lower_order_estimate(), Some(session.current_state()));
    }

    #[test]
    fn test_dormand_prince_can_propagate_lower_order() {
        let tableau = RungeKuttaMethod::DormandPrince54
            .tableau()
            .unwrap()
            .as_ref()
            .clone()
            .with_integrated_order(IntegratedOrder::Lower);
        assert!(tableau.dense_weights().is_none());

        let mut session = AdaptiveIntegrator::new(
            ExpGrowth,
            0.0,
            [1.0],
            settings(RungeKuttaMethod::DormandPrince54, 1e-10, 1e-6, 1.0),
        )
        .unwrap()
        .with_tableau(tableau);
        session.perform_step(0.1).unwrap();
        assert_eq!(session.lower_order_estimate(), Some(session.current_state()));
        assert_ne!(session.higher_order_estimate(), Some(session.current_state()));
    }

    #[test]
    fn test_reinitialize() {
        let mut session =
            AdaptiveIntegrator::new(ExpGrowth, 0.0, [1.0], settings(RungeKuttaMethod::Fehlberg45, 1e-10, 1e-6, 1.0))
                .unwrap();
        session.perform_step(0.1).unwrap();
        let next = session.next_step_size();

        // Impulsive change of state, e.g. a manoeuvre
        session.reinitialize(3.0, [2.0]).unwrap();
        assert_eq!(session.current_time(), 3.0);
        assert_eq!(session.current_state(), &[2.0]);
        assert_eq!(session.previous_time(), 3.0);
        assert!(!session.can_rollback());
        assert_eq!(session.last_step_size(), None);
        assert_eq!(session.stage_derivatives(), None);
        assert_eq!(session.next_step_size(), next);

        let err = session.reinitialize(f64::NAN, [2.0]);
        assert!(matches!(
            err,
            Err(IntegrationError::Config(ConfigError::InvalidInitialCondition { .. }))
        ));
        assert_eq!(session.current_time(), 3.0);

        let y = session.integrate_to(3.5, 0.1).unwrap();
        assert_relative_eq!(y[0], 2.0 * (0.5f64).exp(), max_relative = 1e-8);
    }

    #[test]
    fn test_reset_stats() {
        let mut session =
            AdaptiveIntegrator::new(ExpGrowth, 0.0, [1.0], settings(RungeKuttaMethod::Fehlberg45, 1e-10, 1e-6, 1.0))
                .unwrap();
        session.perform_step(0.1).unwrap();
        assert_eq!(session.stats().fn_evals, 6 * (1 + session.stats().rejected_steps));
        session.reset_stats();
        assert_eq!(session.stats(), &Stats::default());
    }

    // ==================== Environment ====================

    /// Counts updates and holds a rate constant
    struct Rate {
        k: f64,
        updates: u64,
        last_t: f64,
    }

    impl Environment<1> for Rate {
        fn update(&mut self, t: f64, _y: &[f64; 1]) -> Result<(), DerivativeError> {
            self.updates += 1;
            self.last_t = t;
            Ok(())
        }
    }

    struct RateGrowth;

    impl OdeSystem<1, Rate> for RateGrowth {
        fn rhs(&self, env: &Rate, t: f64, y: &[f64; 1], dydt: &mut [f64; 1]) -> Result<(), DerivativeError> {
            assert_eq!(env.last_t, t);
            dydt[0] = env.k * y[0];
            Ok(())
        }
    }

    #[test]
    fn test_environment_updated_before_every_stage() {
        let env = Rate {
            k: -0.5,
            updates: 0,
            last_t: f64::NAN,
        };
        let mut session = AdaptiveIntegrator::with_environment(
            RateGrowth,
            env,
            0.0,
            [1.0],
            settings(RungeKuttaMethod::DormandPrince54, 1e-10, 1e-6, 1.0),
        )
        .unwrap();

        let y = session.integrate_to(2.0, 0.1).unwrap();
        assert_relative_eq!(y[0], (-1.0f64).exp(), max_relative = 1e-8);
        assert_eq!(session.environment().updates, session.stats().fn_evals);

        // Changing the model between steps
        session.environment_mut().k = 0.0;
        let y = session.integrate_to(3.0, 0.1).unwrap();
        assert_relative_eq!(y[0], (-1.0f64).exp(), max_relative = 1e-8);
    }

    #[test]
    fn test_environment_failure_propagates() {
        struct Failing;
        impl Environment<1> for Failing {
            fn update(&mut self, _t: f64, _y: &[f64; 1]) -> Result<(), DerivativeError> {
                Err(DerivativeError::new("ephemeris unavailable"))
            }
        }
        struct Constant;
        impl OdeSystem<1, Failing> for Constant {
            fn rhs(&self, _env: &Failing, _t: f64, _y: &[f64; 1], dydt: &mut [f64; 1]) -> Result<(), DerivativeError> {
                dydt[0] = 1.0;
                Ok(())
            }
        }

        let mut session = AdaptiveIntegrator::with_environment(
            Constant,
            Failing,
            0.0,
            [0.0],
            settings(RungeKuttaMethod::Fehlberg45, 1e-10, 1e-6, 1.0),
        )
        .unwrap();
        let result = session.perform_step(0.1);
        assert!(matches!(
            result,
            Err(IntegrationError::DerivativeFailed { stage: 0, .. })
        ));
        assert_eq!(session.stats().fn_evals, 1);
    }

    // ==================== Dense output ====================

    #[test]
    fn test_interpolate_within_last_step() {
        for (method, bound) in [
            (RungeKuttaMethod::DormandPrince54, 1e-8),
            (RungeKuttaMethod::Fehlberg45, 1e-6),
        ] {
            let mut session =
                AdaptiveIntegrator::new(ExpGrowth, 0.0, [1.0], settings(method, 1e-10, 1e-6, 0.2)).unwrap();
            assert!(matches!(session.interpolate(0.0), Err(IntegrationError::NoDenseOutput)));

            session.perform_step(0.2).unwrap();
            let (start, end) = (session.previous_time(), session.current_time());
            for theta in [0.0, 0.25, 0.5, 0.9, 1.0] {
                let t = start + theta * (end - start);
                let y = session.interpolate(t).unwrap();
                assert!(
                    (y[0] - t.exp()).abs() < bound,
                    "{}: interpolated {} vs exact {} at t = {}",
                    method,
                    y[0],
                    t.exp(),
                    t
                );
            }
            assert_eq!(session.interpolate(end).unwrap(), *session.current_state());

            assert!(matches!(
                session.interpolate(end + 0.1),
                Err(IntegrationError::InterpolationOutOfRange { .. })
            ));

            session.rollback();
            assert!(matches!(session.interpolate(start), Err(IntegrationError::NoDenseOutput)));
        }
    }

    #[test]
    fn test_hermite_end_derivative_evaluated_once() {
        let mut session =
            AdaptiveIntegrator::new(ExpGrowth, 0.0, [1.0], settings(RungeKuttaMethod::Fehlberg78, 1e-12, 1e-6, 0.2))
                .unwrap();
        session.perform_step(0.2).unwrap();
        let evals = session.stats().fn_evals;
        let t_mid = 0.5 * (session.previous_time() + session.current_time());
        session.interpolate(t_mid).unwrap();
        session.interpolate(t_mid * 0.5).unwrap();
        assert_eq!(session.stats().fn_evals, evals + 1);
    }

    // ==================== Input Validation ====================

    #[test]
    fn test_invalid_settings_rejected() {
        let bad_limits = settings(RungeKuttaMethod::Fehlberg45, 1e-10, 1.0, 0.1);
        assert!(matches!(
            AdaptiveIntegrator::new(ExpGrowth, 0.0, [1.0], bad_limits),
            Err(ConfigError::InvalidStepLimits { .. })
        ));

        let bad_tol = IntegratorSettings::new(
            RungeKuttaMethod::Fehlberg45,
            StepLimits::new(1e-6, 1.0),
            Tolerances::new(f64::NAN, 1e-12),
        );
        assert!(matches!(
            AdaptiveIntegrator::new(ExpGrowth, 0.0, [1.0], bad_tol),
            Err(ConfigError::InvalidTolerance { .. })
        ));
    }

    #[test]
    fn test_nan_initial_state_rejected() {
        let result = AdaptiveIntegrator::new(
            ExpGrowth,
            0.0,
            [f64::NAN],
            settings(RungeKuttaMethod::Fehlberg45, 1e-10, 1e-6, 1.0),
        );
        assert!(matches!(result, Err(ConfigError::InvalidInitialCondition { .. })));
    }

    #[test]
    fn test_empty_state_rejected() {
        struct Empty;
        impl OdeSystem<0> for Empty {
            fn rhs(&self, _env: &(), _t: f64, _y: &[f64; 0], _dydt: &mut [f64; 0]) -> Result<(), DerivativeError> {
                Ok(())
            }
        }
        let result = AdaptiveIntegrator::new(Empty, 0.0, [], settings(RungeKuttaMethod::Fehlberg45, 1e-10, 1e-6, 1.0));
        assert!(matches!(result, Err(ConfigError::EmptyState)));
    }

    #[test]
    fn test_invalid_integrate_to_arguments() {
        let mut session =
            AdaptiveIntegrator::new(ExpGrowth, 0.0, [1.0], settings(RungeKuttaMethod::Fehlberg45, 1e-10, 1e-6, 1.0))
                .unwrap();
        assert!(matches!(
            session.integrate_to(f64::INFINITY, 0.1),
            Err(IntegrationError::InvalidInput { .. })
        ));
        assert!(matches!(
            session.integrate_to(1.0, 0.0),
            Err(IntegrationError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_custom_tableau() {
        // Heun-Euler 1(2)
        let heun = ButcherTableau::new(
            "Heun-Euler",
            vec![0.0, 1.0],
            vec![vec![], vec![1.0]],
            vec![1.0, 0.0],
            vec![0.5, 0.5],
            (1, 2),
        )
        .unwrap();
        let mut session =
            AdaptiveIntegrator::new(ExpGrowth, 0.0, [1.0], settings(RungeKuttaMethod::Fehlberg45, 1e-6, 1e-8, 0.1))
                .unwrap()
                .with_tableau(heun);
        assert_eq!(session.tableau().name(), "Heun-Euler");
        let y = session.integrate_to(1.0, 0.01).unwrap();
        assert_eq!(session.stats().fn_evals, 2 * (session.stats().accepted_steps + session.stats().rejected_steps));
        assert!((y[0] - 1.0f64.exp()).abs() < 5e-2);
    }
}
