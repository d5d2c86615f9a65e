//! # embedded-rk: Adaptive Embedded Runge-Kutta Integration
//!
//! The stepping core of a trajectory propagator: an explicit embedded
//! Runge-Kutta engine with adaptive step-size control and one-level rollback,
//! independent of the physics being integrated.
//!
//! ## Features
//!
//! - Fehlberg 4(5), 5(6), 7(8) and Dormand-Prince 5(4) tableaux, validated
//!   and cached per [`RungeKuttaMethod`]; custom [`ButcherTableau`]s
//! - RMS error norm over the two embedded estimates with an I-controller,
//!   replaceable through [`StepSizeControl`]
//! - Forward and backward integration landing exactly on the target time
//! - Rollback to the state before the last accepted step
//! - Explicit [`Environment`] updated before every stage evaluation
//! - Dense output over the last accepted step
//!
//! ## Basic Usage
//!
//! ```rust
//! use embedded_rk::{
//!     AdaptiveIntegrator, DerivativeError, IntegratorSettings, OdeSystem, RungeKuttaMethod,
//!     StepLimits, Tolerances,
//! };
//!
//! // Define your ODE system
//! struct HarmonicOscillator { omega: f64 }
//!
//! impl OdeSystem<2> for HarmonicOscillator {
//!     fn rhs(&self, _env: &(), _t: f64, y: &[f64; 2], dydt: &mut [f64; 2]) -> Result<(), DerivativeError> {
//!         dydt[0] = y[1];
//!         dydt[1] = -self.omega * self.omega * y[0];
//!         Ok(())
//!     }
//! }
//!
//! // Set up and run the integrator
//! let settings = IntegratorSettings::new(
//!     RungeKuttaMethod::Fehlberg78,
//!     StepLimits::new(1e-8, 1.0),
//!     Tolerances::new(1e-12, 1e-12),
//! );
//! let mut session = AdaptiveIntegrator::new(HarmonicOscillator { omega: 1.0 }, 0.0, [1.0, 0.0], settings).unwrap();
//!
//! let yf = session.integrate_to(10.0, 0.1).unwrap();
//! assert!(yf[0].is_finite());
//! assert_eq!(session.current_time(), 10.0);
//!
//! // Undo the last accepted step
//! assert!(session.rollback());
//! assert!(session.current_time() < 10.0);
//! ```
//!
//! ## Propagated Estimate
//!
//! Fehlberg tables advance with the lower-order estimate and use the
//! higher-order one for error estimation only.
//! [`RungeKuttaMethod::DormandPrince54`] is the single exception: it advances
//! with its fifth-order solution (local extrapolation), which its dense-output
//! weights are built for. Pass a table from
//! [`ButcherTableau::with_integrated_order`]`(`[`IntegratedOrder::Lower`]`)`
//! to [`AdaptiveIntegrator::with_tableau`] to advance Dormand-Prince with its
//! fourth-order estimate instead; dense output then falls back to the Hermite
//! cubic. Both estimates of the last accepted step stay available through
//! [`lower_order_estimate`](AdaptiveIntegrator::lower_order_estimate) and
//! [`higher_order_estimate`](AdaptiveIntegrator::higher_order_estimate).
//!
//! ## Tolerance Selection
//!
//! - **Position (km)**: `atol ≈ 1e-12 km` for high-precision orbit determination
//! - **Velocity (km/s)**: `atol ≈ 1e-15 km/s` to match position precision
//! - **Relative tolerance**: Typically `1e-12` to `1e-14`
//!
//! An infinite tolerance accepts every step; combined with a custom
//! [`StepSizeControl`] this reproduces fixed or published step sequences.
//!
//! ## Logging
//!
//! Step decisions are reported through the [`log`] facade: accepted steps at
//! `trace`, rejections, rollbacks and reinitializations at `debug`, step-size
//! exhaustion and non-finite states at `warn`.
//!
//! ## References
//!
//! 1. Fehlberg, E. (1968). "Classical Fifth-, Sixth-, Seventh-, and
//!    Eighth-Order Runge-Kutta Formulas with Stepsize Control".
//!    NASA TR R-287.
//!
//! 2. Hairer, E., Nørsett, S.P., & Wanner, G. (1993). "Solving
//!    Ordinary Differential Equations I: Nonstiff Problems".
//!    Springer.
//!
//! 3. Burden, R.L., & Faires, J.D. (2011). "Numerical Analysis", 9th ed.,
//!    Section 5.5.

#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod coefficients;
pub mod controller;
pub mod dense;
pub mod error;
pub mod settings;
pub mod solver;
pub mod stages;

pub use coefficients::{ButcherTableau, IntegratedOrder, RungeKuttaMethod};
pub use controller::{
    DefaultStepControl, StepController, StepDecision, StepSizeControl, StepSizeInput, Tolerances,
};
pub use error::{ConfigError, IntegrationError};
pub use settings::{IntegratorSettings, StepLimits};
pub use solver::{AdaptiveIntegrator, SessionState, Stats};
pub use stages::{DerivativeError, Environment, OdeSystem, StageEvaluation};
