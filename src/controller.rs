//! Step-size control for embedded pairs.
//!
//! The default policy is an elementary I-controller on the RMS-normalized
//! difference between the two embedded estimates:
//!
//! ```text
//! sc_k   = atol_k + rtol_k * max(|x_low_k|, |x_high_k|)
//! err    = sqrt( (1/n) * sum_k ((x_high_k - x_low_k) / sc_k)^2 )
//! h_next = h * clamp(safety * err^(-1/(p+1)), min_factor, max_factor)
//! ```
//!
//! where `p` is the order of the lower-order estimate. A step is accepted
//! iff `err <= 1`. Callers can swap the policy through [`StepSizeControl`],
//! e.g. to reproduce a published step-size sequence.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::settings::StepLimits;

/// Tuning factors of the step-size controller
///
/// h_new = h * clamp(safety * error^(-1/(p+1)), min_factor, max_factor)
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StepController {
    /// Safety factor (0.8-0.9 typical)
    pub safety: f64,
    /// Maximum growth factor per step
    pub max_factor: f64,
    /// Minimum reduction factor per step
    pub min_factor: f64,
}

impl Default for StepController {
    fn default() -> Self {
        Self {
            safety: 0.8,
            max_factor: 4.0,
            min_factor: 0.1,
        }
    }
}

impl StepController {
    /// Compute the step size adjustment factor for an error estimate of an
    /// embedded pair whose lower order is `lower_order`.
    pub fn compute_factor(&self, error: f64, lower_order: u8) -> f64 {
        if error == 0.0 {
            return self.max_factor;
        }

        let exponent = 1.0 / (f64::from(lower_order) + 1.0);
        let factor = self.safety * error.powf(-exponent);
        factor.clamp(self.min_factor, self.max_factor)
    }

    /// Check `0 < safety < 1`, `1 < max_factor < inf` and `0 < min_factor < 1`.
    ///
    /// A rejected step must always shrink, so neither `safety` nor
    /// `min_factor` may reach 1.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.safety > 0.0 && self.safety < 1.0) {
            return Err(ConfigError::InvalidController {
                message: format!("safety factor must be in (0, 1), got {}", self.safety),
            });
        }
        if !(self.max_factor > 1.0 && self.max_factor.is_finite()) {
            return Err(ConfigError::InvalidController {
                message: format!(
                    "maximum increase factor must be finite and > 1, got {}",
                    self.max_factor
                ),
            });
        }
        if !(self.min_factor > 0.0 && self.min_factor < 1.0) {
            return Err(ConfigError::InvalidController {
                message: format!(
                    "minimum decrease factor must be in (0, 1), got {}",
                    self.min_factor
                ),
            });
        }
        Ok(())
    }
}

/// Tolerance specification for error control
///
/// Scale per component: atol + rtol * max(|x_low|, |x_high|)
#[derive(Debug, Clone, PartialEq)]
pub struct Tolerances<const N: usize> {
    /// Absolute tolerance per component
    pub atol: [f64; N],
    /// Relative tolerance per component
    pub rtol: [f64; N],
}

impl<const N: usize> Tolerances<N> {
    /// Create tolerances with uniform values
    pub fn new(atol: f64, rtol: f64) -> Self {
        Self {
            atol: [atol; N],
            rtol: [rtol; N],
        }
    }

    /// Create tolerances with per-component values
    pub fn with_components(atol: [f64; N], rtol: [f64; N]) -> Self {
        Self { atol, rtol }
    }

    /// Tolerances must be non-negative (infinity allowed) and may not both
    /// vanish for any component.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, (&a, &r)) in self.atol.iter().zip(self.rtol.iter()).enumerate() {
            if a.is_nan() || a < 0.0 {
                return Err(ConfigError::InvalidTolerance {
                    message: format!("atol[{}] must be non-negative, got {}", i, a),
                });
            }
            if r.is_nan() || r < 0.0 {
                return Err(ConfigError::InvalidTolerance {
                    message: format!("rtol[{}] must be non-negative, got {}", i, r),
                });
            }
            if a == 0.0 && r == 0.0 {
                return Err(ConfigError::InvalidTolerance {
                    message: format!("atol[{}] and rtol[{}] are both zero", i, i),
                });
            }
        }
        Ok(())
    }

    /// Error scale of component `k`
    pub fn scale(&self, k: usize, lower: f64, higher: f64) -> f64 {
        self.atol[k] + self.rtol[k] * lower.abs().max(higher.abs())
    }
}

/// RMS of the scaled difference between the two embedded estimates.
///
/// Components where both estimates agree contribute nothing, so infinite
/// tolerances never produce `inf / inf`.
pub fn error_norm<const N: usize>(
    lower: &[f64; N],
    higher: &[f64; N],
    tolerances: &Tolerances<N>,
) -> f64 {
    if N == 0 {
        return 0.0;
    }
    let mut sum = 0.0;
    for k in 0..N {
        let diff = higher[k] - lower[k];
        if diff == 0.0 {
            continue;
        }
        let scaled = diff / tolerances.scale(k, lower[k], higher[k]);
        sum += scaled * scaled;
    }
    (sum / N as f64).sqrt()
}

/// Clamp the magnitude of `h` into the step limits, keeping its sign.
pub fn clamp_step_size(h: f64, limits: &StepLimits) -> f64 {
    h.signum() * h.abs().clamp(limits.min, limits.max)
}

/// Everything a step-size policy sees about one step attempt
#[derive(Debug, Clone, PartialEq)]
pub struct StepSizeInput<const N: usize> {
    /// Attempted (signed) step size
    pub step_size: f64,
    /// Order of the lower-order estimate
    pub lower_order: u8,
    /// Order of the higher-order estimate
    pub higher_order: u8,
    /// Lower-order estimate at the end of the attempt
    pub lower: [f64; N],
    /// Higher-order estimate at the end of the attempt
    pub higher: [f64; N],
    /// Session tolerances
    pub tolerances: Tolerances<N>,
    /// Session controller factors
    pub controller: StepController,
    /// Session step limits
    pub limits: StepLimits,
}

/// Outcome of a step-size policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepDecision {
    /// Proposed next step size (signed); clamped into the limits by the session
    pub next_step_size: f64,
    /// Whether the attempted step is accepted
    pub accepted: bool,
    /// Error measure reported for diagnostics
    pub error: f64,
}

/// Pluggable step-size policy
///
/// Closures `FnMut(&StepSizeInput<N>) -> StepDecision` implement this trait.
pub trait StepSizeControl<const N: usize> {
    /// Judge one step attempt and propose the next step size
    fn decide(&mut self, input: &StepSizeInput<N>) -> StepDecision;
}

impl<const N: usize, F> StepSizeControl<N> for F
where
    F: FnMut(&StepSizeInput<N>) -> StepDecision,
{
    fn decide(&mut self, input: &StepSizeInput<N>) -> StepDecision {
        self(input)
    }
}

/// RMS error norm with an I-controller, see the module documentation
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultStepControl;

impl<const N: usize> StepSizeControl<N> for DefaultStepControl {
    fn decide(&mut self, input: &StepSizeInput<N>) -> StepDecision {
        let error = error_norm(&input.lower, &input.higher, &input.tolerances);
        let factor = input.controller.compute_factor(error, input.lower_order);
        let next_step_size = clamp_step_size(input.step_size * factor, &input.limits);

        StepDecision {
            next_step_size,
            accepted: error <= 1.0,
            error,
        }
    }
}
