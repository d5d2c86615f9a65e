//! Session configuration.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::coefficients::RungeKuttaMethod;
use crate::controller::{StepController, Tolerances};
use crate::error::ConfigError;

/// Default bound on step attempts per `integrate_to` call
pub const DEFAULT_MAX_STEPS: u64 = 10_000_000;

/// Bounds on the magnitude of the step size
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StepLimits {
    /// Minimum step size magnitude
    pub min: f64,
    /// Maximum step size magnitude
    pub max: f64,
}

impl StepLimits {
    /// Create step limits; see [`StepLimits::validate`]
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Require `0 < min <= max`; `max` may be infinite.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ok = self.min > 0.0 && self.min.is_finite() && self.max >= self.min;
        if ok {
            Ok(())
        } else {
            Err(ConfigError::InvalidStepLimits {
                min: self.min,
                max: self.max,
            })
        }
    }
}

/// Everything needed to build an integration session
#[derive(Debug, Clone, PartialEq)]
pub struct IntegratorSettings<const N: usize> {
    /// Coefficient table selector
    pub method: RungeKuttaMethod,
    /// Step size bounds
    pub limits: StepLimits,
    /// Per-component error tolerances
    pub tolerances: Tolerances<N>,
    /// Controller tuning factors
    pub controller: StepController,
    /// Maximum step attempts per `integrate_to` call
    pub max_steps: u64,
}

impl<const N: usize> IntegratorSettings<N> {
    /// Settings with the default controller and step bound
    pub fn new(method: RungeKuttaMethod, limits: StepLimits, tolerances: Tolerances<N>) -> Self {
        Self {
            method,
            limits,
            tolerances,
            controller: StepController::default(),
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    /// Replace the controller factors
    pub fn with_controller(mut self, controller: StepController) -> Self {
        self.controller = controller;
        self
    }

    /// Replace the step attempt bound
    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Validate limits, tolerances, controller and the step bound
    pub fn validate(&self) -> Result<(), ConfigError> {
        if N == 0 {
            return Err(ConfigError::EmptyState);
        }
        self.limits.validate()?;
        self.tolerances.validate()?;
        self.controller.validate()?;
        if self.max_steps == 0 {
            return Err(ConfigError::InvalidController {
                message: "max_steps must be positive".to_string(),
            });
        }
        Ok(())
    }
}
