//! Error types for tableau construction, session configuration and stepping.

use thiserror::Error;

use crate::stages::DerivativeError;

/// Invalid configuration detected at construction time.
///
/// These are fatal for the session being built: nothing is integrated with an
/// inconsistent tableau or nonsensical step limits.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// A coupling row does not sum to the stage node
    #[error("tableau `{name}`: row {row} sums to {sum}, expected c[{row}] = {expected}")]
    InconsistentRow {
        /// Tableau name
        name: String,
        /// Offending stage
        row: usize,
        /// Sum of the coupling coefficients
        sum: f64,
        /// Stage node c_i
        expected: f64,
    },
    /// A weight vector does not sum to one
    #[error("tableau `{name}`: {which} weights sum to {sum}, expected 1")]
    WeightSum {
        /// Tableau name
        name: String,
        /// Which weight vector ("lower-order" or "higher-order")
        which: &'static str,
        /// Actual sum
        sum: f64,
    },
    /// Structural problem with a tableau (dimensions, orders, dense weights)
    #[error("tableau `{name}` is malformed: {message}")]
    MalformedTableau {
        /// Tableau name
        name: String,
        /// Description of the problem
        message: String,
    },
    /// Negative, NaN or all-zero tolerance
    #[error("invalid tolerance: {message}")]
    InvalidTolerance {
        /// Description of the problem
        message: String,
    },
    /// Step size limits are not `0 < min <= max`
    #[error("invalid step size limits: min = {min}, max = {max}")]
    InvalidStepLimits {
        /// Minimum step size
        min: f64,
        /// Maximum step size
        max: f64,
    },
    /// Safety or growth/shrink factors out of range
    #[error("invalid step controller: {message}")]
    InvalidController {
        /// Description of the problem
        message: String,
    },
    /// Zero-dimensional state vector
    #[error("state vector must have at least one component")]
    EmptyState,
    /// Initial or reinitialized (t, y) pair is not finite
    #[error("invalid initial condition: {message}")]
    InvalidInitialCondition {
        /// Description of the problem
        message: String,
    },
}

/// Errors that can occur while stepping a session.
///
/// Apart from [`IntegrationError::Config`], none of these leave the session
/// modified: the last accepted `(t, y)` pair is always preserved.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IntegrationError {
    /// The derivative function (or environment update) failed
    #[error("derivative evaluation failed at t = {t} (stage {stage}): {source}")]
    DerivativeFailed {
        /// Stage evaluation time
        t: f64,
        /// Zero-based stage index
        stage: usize,
        /// Error reported by the system
        source: DerivativeError,
    },
    /// Step rejected at the minimum step size; integration cannot progress
    #[error("step size exhausted at t = {t}: step {h} rejected with error estimate {error}")]
    StepSizeExhausted {
        /// Time of the last accepted state
        t: f64,
        /// Step size of the final rejected attempt
        h: f64,
        /// Normalized error of the final rejected attempt
        error: f64,
    },
    /// Non-finite error estimate or propagated state
    #[error("non-finite state or error estimate at t = {t} with step {h}")]
    NonFiniteState {
        /// Time of the last accepted state
        t: f64,
        /// Step size of the failed attempt
        h: f64,
    },
    /// Maximum number of step attempts exceeded
    #[error("maximum number of integration steps ({0}) exceeded")]
    MaxStepsExceeded(u64),
    /// Invalid call arguments
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Description of the invalid input
        message: String,
    },
    /// Interpolation requested without an accepted step to interpolate
    #[error("no accepted step available for dense output")]
    NoDenseOutput,
    /// Interpolation requested outside the last accepted step
    #[error("interpolation time {t} outside last step [{start}, {end}]")]
    InterpolationOutOfRange {
        /// Requested time
        t: f64,
        /// Start of the last accepted step
        start: f64,
        /// End of the last accepted step
        end: f64,
    },
    /// Configuration error raised by a mid-session operation
    #[error(transparent)]
    Config(#[from] ConfigError),
}
