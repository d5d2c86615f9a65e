//! Embedded Runge-Kutta Coefficient Tables
//!
//! Butcher tableaux for the embedded pairs supported by the integrator:
//!
//! | Method              | Stages | Orders | Propagated | Dense output |
//! |---------------------|--------|--------|------------|--------------|
//! | Fehlberg 4(5)       |      6 | 4, 5   | lower      | no           |
//! | Fehlberg 5(6)       |      8 | 5, 6   | lower      | no           |
//! | Fehlberg 7(8)       |     13 | 7, 8   | lower      | no           |
//! | Dormand-Prince 5(4) |      7 | 4, 5   | higher     | 4th degree   |
//!
//! Tables are pure data. They are built on first use, validated, and cached
//! per [`RungeKuttaMethod`].
//!
//! References:
//! - Fehlberg, E. (1968). "Classical Fifth-, Sixth-, Seventh-, and
//!   Eighth-Order Runge-Kutta Formulas with Stepsize Control". NASA TR R-287.
//! - Fehlberg, E. (1969). "Low-order classical Runge-Kutta formulas with
//!   stepsize control and their application to some heat transfer problems".
//!   NASA TR R-315.
//! - Dormand, J.R., Prince, P.J. (1980). "A family of embedded Runge-Kutta
//!   formulae". J. Comp. Appl. Math. 6(1).
//! - Hairer, E., Nørsett, S.P., Wanner, G. (1993). "Solving Ordinary
//!   Differential Equations I", Section II.6 (dense output of DOPRI5).

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use crate::error::ConfigError;

/// Tolerance for the row-sum and weight-sum consistency checks.
///
/// Summation of up to ~13 f64 terms accumulates O(n·eps) roundoff.
pub const CONSISTENCY_TOL: f64 = 1e-12;

/// Identifier of a built-in embedded Runge-Kutta method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum RungeKuttaMethod {
    /// Runge-Kutta-Fehlberg 4(5), 6 stages
    Fehlberg45,
    /// Runge-Kutta-Fehlberg 5(6), 8 stages
    Fehlberg56,
    /// Runge-Kutta-Fehlberg 7(8), 13 stages
    Fehlberg78,
    /// Dormand-Prince 5(4), 7 stages, first-same-as-last
    DormandPrince54,
}

impl RungeKuttaMethod {
    /// All built-in methods
    pub const ALL: [RungeKuttaMethod; 4] = [
        RungeKuttaMethod::Fehlberg45,
        RungeKuttaMethod::Fehlberg56,
        RungeKuttaMethod::Fehlberg78,
        RungeKuttaMethod::DormandPrince54,
    ];

    /// Human-readable name of the method
    pub fn name(self) -> &'static str {
        match self {
            RungeKuttaMethod::Fehlberg45 => "Runge-Kutta-Fehlberg 4(5)",
            RungeKuttaMethod::Fehlberg56 => "Runge-Kutta-Fehlberg 5(6)",
            RungeKuttaMethod::Fehlberg78 => "Runge-Kutta-Fehlberg 7(8)",
            RungeKuttaMethod::DormandPrince54 => "Dormand-Prince 5(4)",
        }
    }

    /// Look up the (cached) tableau for this method.
    ///
    /// The table is built and validated on first use. Every call returns an
    /// equal value.
    pub fn tableau(self) -> Result<Arc<ButcherTableau>, ConfigError> {
        static FEHLBERG45: OnceLock<Result<Arc<ButcherTableau>, ConfigError>> = OnceLock::new();
        static FEHLBERG56: OnceLock<Result<Arc<ButcherTableau>, ConfigError>> = OnceLock::new();
        static FEHLBERG78: OnceLock<Result<Arc<ButcherTableau>, ConfigError>> = OnceLock::new();
        static DORMAND_PRINCE54: OnceLock<Result<Arc<ButcherTableau>, ConfigError>> =
            OnceLock::new();

        let cell = match self {
            RungeKuttaMethod::Fehlberg45 => &FEHLBERG45,
            RungeKuttaMethod::Fehlberg56 => &FEHLBERG56,
            RungeKuttaMethod::Fehlberg78 => &FEHLBERG78,
            RungeKuttaMethod::DormandPrince54 => &DORMAND_PRINCE54,
        };
        cell.get_or_init(|| build(self).map(Arc::new)).clone()
    }
}

impl fmt::Display for RungeKuttaMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RungeKuttaMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(&['-', '_', ' '][..], "").as_str() {
            "rkf45" | "fehlberg45" => Ok(RungeKuttaMethod::Fehlberg45),
            "rkf56" | "fehlberg56" => Ok(RungeKuttaMethod::Fehlberg56),
            "rkf78" | "fehlberg78" => Ok(RungeKuttaMethod::Fehlberg78),
            "dopri54" | "dp54" | "dormandprince54" => Ok(RungeKuttaMethod::DormandPrince54),
            _ => Err(ConfigError::MalformedTableau {
                name: s.to_string(),
                message: "unknown method identifier".to_string(),
            }),
        }
    }
}

/// Which embedded estimate a session propagates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum IntegratedOrder {
    /// Advance with the lower-order estimate (classical Fehlberg convention)
    #[default]
    Lower,
    /// Advance with the higher-order estimate (local extrapolation)
    Higher,
}

/// Explicit embedded Runge-Kutta tableau
///
/// Stage `i` is evaluated as
/// `k_i = f(t + c_i·h, y + h·Σ_{j<i} a_ij·k_j)` and the two embedded
/// estimates are `y + h·Σ b_i·k_i` for the lower- and higher-order weights.
#[derive(Debug, Clone, PartialEq)]
pub struct ButcherTableau {
    name: String,
    c: Vec<f64>,
    a: Vec<Vec<f64>>,
    b_lower: Vec<f64>,
    b_higher: Vec<f64>,
    dense: Option<Vec<f64>>,
    lower_order: u8,
    higher_order: u8,
    integrated: IntegratedOrder,
}

impl ButcherTableau {
    /// Build and validate a tableau.
    ///
    /// # Arguments
    /// * `name` - Display name used in error messages
    /// * `c` - Stage nodes, one per stage
    /// * `a` - Coupling rows; row `i` holds exactly `i` entries (explicit method)
    /// * `b_lower`, `b_higher` - Weights of the two embedded estimates
    /// * `orders` - `(lower_order, higher_order)`
    ///
    /// The tableau propagates the lower-order estimate; see
    /// [`with_integrated_order`](Self::with_integrated_order).
    pub fn new(
        name: impl Into<String>,
        c: Vec<f64>,
        a: Vec<Vec<f64>>,
        b_lower: Vec<f64>,
        b_higher: Vec<f64>,
        orders: (u8, u8),
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        let stages = c.len();
        let malformed = |message: String| ConfigError::MalformedTableau {
            name: name.clone(),
            message,
        };

        if stages == 0 {
            return Err(malformed("tableau must have at least one stage".to_string()));
        }
        if a.len() != stages || b_lower.len() != stages || b_higher.len() != stages {
            return Err(malformed(format!(
                "expected {} coupling rows and weights, got {} rows, {} lower and {} higher weights",
                stages,
                a.len(),
                b_lower.len(),
                b_higher.len()
            )));
        }
        if orders.0 == 0 || orders.0 >= orders.1 {
            return Err(malformed(format!(
                "orders must satisfy 0 < lower < higher, got ({}, {})",
                orders.0, orders.1
            )));
        }
        let all_finite = c
            .iter()
            .chain(a.iter().flatten())
            .chain(b_lower.iter())
            .chain(b_higher.iter())
            .all(|v| v.is_finite());
        if !all_finite {
            return Err(malformed("coefficients must be finite".to_string()));
        }

        for (i, row) in a.iter().enumerate() {
            if row.len() != i {
                return Err(malformed(format!(
                    "coupling row {} has {} entries, expected {}",
                    i,
                    row.len(),
                    i
                )));
            }
            let sum: f64 = row.iter().sum();
            if (sum - c[i]).abs() > CONSISTENCY_TOL {
                return Err(ConfigError::InconsistentRow {
                    name,
                    row: i,
                    sum,
                    expected: c[i],
                });
            }
        }

        for (which, weights) in [("lower-order", &b_lower), ("higher-order", &b_higher)] {
            let sum: f64 = weights.iter().sum();
            if (sum - 1.0).abs() > CONSISTENCY_TOL {
                return Err(ConfigError::WeightSum { name, which, sum });
            }
        }

        Ok(Self {
            name,
            c,
            a,
            b_lower,
            b_higher,
            dense: None,
            lower_order: orders.0,
            higher_order: orders.1,
            integrated: IntegratedOrder::Lower,
        })
    }

    /// Select which embedded estimate is propagated.
    ///
    /// Dense weights are tied to the propagated estimate and are dropped when
    /// the selection changes.
    pub fn with_integrated_order(mut self, integrated: IntegratedOrder) -> Self {
        if integrated != self.integrated {
            self.dense = None;
        }
        self.integrated = integrated;
        self
    }

    /// Attach dense-output weights `d_i` for the continuous extension.
    ///
    /// Requires a first-same-as-last final stage (`c_s = 1` and the last
    /// coupling row equal to the propagated weights), so that the last stage
    /// derivative is `f(t + h, y_{n+1})`.
    pub fn with_dense_weights(mut self, dense: Vec<f64>) -> Result<Self, ConfigError> {
        let stages = self.stages();
        if dense.len() != stages {
            return Err(ConfigError::MalformedTableau {
                name: self.name,
                message: format!("expected {} dense weights, got {}", stages, dense.len()),
            });
        }

        let last = stages - 1;
        let propagated = self.propagated_weights();
        let fsal = (self.c[last] - 1.0).abs() <= CONSISTENCY_TOL
            && self.a[last]
                .iter()
                .zip(propagated)
                .all(|(a, b)| (a - b).abs() <= CONSISTENCY_TOL)
            && propagated[last] == 0.0;
        if !fsal {
            return Err(ConfigError::MalformedTableau {
                name: self.name,
                message: "dense weights require a first-same-as-last final stage".to_string(),
            });
        }

        self.dense = Some(dense);
        Ok(self)
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of stages
    pub fn stages(&self) -> usize {
        self.c.len()
    }

    /// Stage nodes c_i
    pub fn c(&self) -> &[f64] {
        &self.c
    }

    /// Coupling coefficients a_ij for stage `i` (length `i`)
    pub fn a_row(&self, i: usize) -> &[f64] {
        &self.a[i]
    }

    /// Weights of the lower-order estimate
    pub fn b_lower(&self) -> &[f64] {
        &self.b_lower
    }

    /// Weights of the higher-order estimate
    pub fn b_higher(&self) -> &[f64] {
        &self.b_higher
    }

    /// Weights of the propagated estimate
    pub fn propagated_weights(&self) -> &[f64] {
        match self.integrated {
            IntegratedOrder::Lower => &self.b_lower,
            IntegratedOrder::Higher => &self.b_higher,
        }
    }

    /// Dense-output weights, if the method has a continuous extension
    pub fn dense_weights(&self) -> Option<&[f64]> {
        self.dense.as_deref()
    }

    /// Order of the lower-order estimate (the step-size control exponent)
    pub fn lower_order(&self) -> u8 {
        self.lower_order
    }

    /// Order of the higher-order estimate
    pub fn higher_order(&self) -> u8 {
        self.higher_order
    }

    /// Which estimate is propagated
    pub fn integrated_order(&self) -> IntegratedOrder {
        self.integrated
    }
}

fn build(method: RungeKuttaMethod) -> Result<ButcherTableau, ConfigError> {
    let rows = |a: &[&[f64]]| a.iter().map(|row| row.to_vec()).collect::<Vec<_>>();
    match method {
        RungeKuttaMethod::Fehlberg45 => ButcherTableau::new(
            method.name(),
            FEHLBERG45_C.to_vec(),
            rows(&FEHLBERG45_A),
            FEHLBERG45_B4.to_vec(),
            FEHLBERG45_B5.to_vec(),
            (4, 5),
        ),
        RungeKuttaMethod::Fehlberg56 => ButcherTableau::new(
            method.name(),
            FEHLBERG56_C.to_vec(),
            rows(&FEHLBERG56_A),
            FEHLBERG56_B5.to_vec(),
            FEHLBERG56_B6.to_vec(),
            (5, 6),
        ),
        RungeKuttaMethod::Fehlberg78 => ButcherTableau::new(
            method.name(),
            FEHLBERG78_C.to_vec(),
            rows(&FEHLBERG78_A),
            FEHLBERG78_B7.to_vec(),
            FEHLBERG78_B8.to_vec(),
            (7, 8),
        ),
        RungeKuttaMethod::DormandPrince54 => ButcherTableau::new(
            method.name(),
            DORMAND_PRINCE54_C.to_vec(),
            rows(&DORMAND_PRINCE54_A),
            DORMAND_PRINCE54_B4.to_vec(),
            DORMAND_PRINCE54_B5.to_vec(),
            (4, 5),
        )?
        .with_integrated_order(IntegratedOrder::Higher)
        .with_dense_weights(DORMAND_PRINCE54_DENSE.to_vec()),
    }
}

// ---------------------------------------------------------------------------
// Fehlberg 4(5), NASA TR R-315, Table III
// ---------------------------------------------------------------------------

const FEHLBERG45_C: [f64; 6] = [0.0, 1.0 / 4.0, 3.0 / 8.0, 12.0 / 13.0, 1.0, 1.0 / 2.0];

const FEHLBERG45_A: [&[f64]; 6] = [
    &[],
    &[1.0 / 4.0],
    &[3.0 / 32.0, 9.0 / 32.0],
    &[1932.0 / 2197.0, -7200.0 / 2197.0, 7296.0 / 2197.0],
    &[439.0 / 216.0, -8.0, 3680.0 / 513.0, -845.0 / 4104.0],
    &[-8.0 / 27.0, 2.0, -3544.0 / 2565.0, 1859.0 / 4104.0, -11.0 / 40.0],
];

const FEHLBERG45_B4: [f64; 6] = [
    25.0 / 216.0,
    0.0,
    1408.0 / 2565.0,
    2197.0 / 4104.0,
    -1.0 / 5.0,
    0.0,
];

const FEHLBERG45_B5: [f64; 6] = [
    16.0 / 135.0,
    0.0,
    6656.0 / 12825.0,
    28561.0 / 56430.0,
    -9.0 / 50.0,
    2.0 / 55.0,
];

// ---------------------------------------------------------------------------
// Fehlberg 5(6), NASA TR R-287, Table II
// ---------------------------------------------------------------------------

const FEHLBERG56_C: [f64; 8] = [
    0.0,
    1.0 / 6.0,
    4.0 / 15.0,
    2.0 / 3.0,
    4.0 / 5.0,
    1.0,
    0.0,
    1.0,
];

const FEHLBERG56_A: [&[f64]; 8] = [
    &[],
    &[1.0 / 6.0],
    &[4.0 / 75.0, 16.0 / 75.0],
    &[5.0 / 6.0, -8.0 / 3.0, 5.0 / 2.0],
    &[-8.0 / 5.0, 144.0 / 25.0, -4.0, 16.0 / 25.0],
    &[361.0 / 320.0, -18.0 / 5.0, 407.0 / 128.0, -11.0 / 80.0, 55.0 / 128.0],
    &[-11.0 / 640.0, 0.0, 11.0 / 256.0, -11.0 / 160.0, 11.0 / 256.0, 0.0],
    &[93.0 / 640.0, -18.0 / 5.0, 803.0 / 256.0, -11.0 / 160.0, 99.0 / 256.0, 0.0, 1.0],
];

const FEHLBERG56_B5: [f64; 8] = [
    31.0 / 384.0,
    0.0,
    1125.0 / 2816.0,
    9.0 / 32.0,
    125.0 / 768.0,
    5.0 / 66.0,
    0.0,
    0.0,
];

const FEHLBERG56_B6: [f64; 8] = [
    7.0 / 1408.0,
    0.0,
    1125.0 / 2816.0,
    9.0 / 32.0,
    125.0 / 768.0,
    0.0,
    5.0 / 66.0,
    5.0 / 66.0,
];

// ---------------------------------------------------------------------------
// Fehlberg 7(8), NASA TR R-287, Table X
// ---------------------------------------------------------------------------

/// Node coefficients (α values). Stages 11 and 12 only feed the 8th-order
/// estimate.
const FEHLBERG78_C: [f64; 13] = [
    0.0,
    2.0 / 27.0,
    1.0 / 9.0,
    1.0 / 6.0,
    5.0 / 12.0,
    0.5,
    5.0 / 6.0,
    1.0 / 6.0,
    2.0 / 3.0,
    1.0 / 3.0,
    1.0,
    0.0,
    1.0,
];

/// Coupling coefficients (β values)
const FEHLBERG78_A: [&[f64]; 13] = [
    &[],
    &[2.0 / 27.0],
    &[1.0 / 36.0, 1.0 / 12.0],
    &[1.0 / 24.0, 0.0, 1.0 / 8.0],
    &[5.0 / 12.0, 0.0, -25.0 / 16.0, 25.0 / 16.0],
    &[1.0 / 20.0, 0.0, 0.0, 1.0 / 4.0, 1.0 / 5.0],
    &[-25.0 / 108.0, 0.0, 0.0, 125.0 / 108.0, -65.0 / 27.0, 125.0 / 54.0],
    &[31.0 / 300.0, 0.0, 0.0, 0.0, 61.0 / 225.0, -2.0 / 9.0, 13.0 / 900.0],
    &[2.0, 0.0, 0.0, -53.0 / 6.0, 704.0 / 45.0, -107.0 / 9.0, 67.0 / 90.0, 3.0],
    &[
        -91.0 / 108.0,
        0.0,
        0.0,
        23.0 / 108.0,
        -976.0 / 135.0,
        311.0 / 54.0,
        -19.0 / 60.0,
        17.0 / 6.0,
        -1.0 / 12.0,
    ],
    &[
        2383.0 / 4100.0,
        0.0,
        0.0,
        -341.0 / 164.0,
        4496.0 / 1025.0,
        -301.0 / 82.0,
        2133.0 / 4100.0,
        45.0 / 82.0,
        45.0 / 164.0,
        18.0 / 41.0,
    ],
    &[
        3.0 / 205.0,
        0.0,
        0.0,
        0.0,
        0.0,
        -6.0 / 41.0,
        -3.0 / 205.0,
        -3.0 / 41.0,
        3.0 / 41.0,
        6.0 / 41.0,
        0.0,
    ],
    &[
        -1777.0 / 4100.0,
        0.0,
        0.0,
        -341.0 / 164.0,
        4496.0 / 1025.0,
        -289.0 / 82.0,
        2193.0 / 4100.0,
        51.0 / 82.0,
        33.0 / 164.0,
        12.0 / 41.0,
        0.0,
        1.0,
    ],
];

/// 7th-order weights: stages 0-10 only
const FEHLBERG78_B7: [f64; 13] = [
    41.0 / 840.0,
    0.0,
    0.0,
    0.0,
    0.0,
    34.0 / 105.0,
    9.0 / 35.0,
    9.0 / 35.0,
    9.0 / 280.0,
    9.0 / 280.0,
    41.0 / 840.0,
    0.0,
    0.0,
];

/// 8th-order weights: stages 0 and 10 replaced by 11 and 12.
/// The difference is TE = (41/840)·(k_0 + k_10 - k_11 - k_12)·h.
const FEHLBERG78_B8: [f64; 13] = [
    0.0,
    0.0,
    0.0,
    0.0,
    0.0,
    34.0 / 105.0,
    9.0 / 35.0,
    9.0 / 35.0,
    9.0 / 280.0,
    9.0 / 280.0,
    0.0,
    41.0 / 840.0,
    41.0 / 840.0,
];

// ---------------------------------------------------------------------------
// Dormand-Prince 5(4)
// ---------------------------------------------------------------------------

const DORMAND_PRINCE54_C: [f64; 7] = [0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0];

const DORMAND_PRINCE54_A: [&[f64]; 7] = [
    &[],
    &[1.0 / 5.0],
    &[3.0 / 40.0, 9.0 / 40.0],
    &[44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0],
    &[19372.0 / 6561.0, -25360.0 / 2187.0, 64448.0 / 6561.0, -212.0 / 729.0],
    &[
        9017.0 / 3168.0,
        -355.0 / 33.0,
        46732.0 / 5247.0,
        49.0 / 176.0,
        -5103.0 / 18656.0,
    ],
    &[
        35.0 / 384.0,
        0.0,
        500.0 / 1113.0,
        125.0 / 192.0,
        -2187.0 / 6784.0,
        11.0 / 84.0,
    ],
];

const DORMAND_PRINCE54_B4: [f64; 7] = [
    5179.0 / 57600.0,
    0.0,
    7571.0 / 16695.0,
    393.0 / 640.0,
    -92097.0 / 339200.0,
    187.0 / 2100.0,
    1.0 / 40.0,
];

const DORMAND_PRINCE54_B5: [f64; 7] = [
    35.0 / 384.0,
    0.0,
    500.0 / 1113.0,
    125.0 / 192.0,
    -2187.0 / 6784.0,
    11.0 / 84.0,
    0.0,
];

/// Continuous extension coefficients (Hairer, DOPRI5 `d` values)
const DORMAND_PRINCE54_DENSE: [f64; 7] = [
    -12715105075.0 / 11282082432.0,
    0.0,
    87487479700.0 / 32700410799.0,
    -10690763975.0 / 1880347072.0,
    701980252875.0 / 199316789632.0,
    -1453857185.0 / 822651844.0,
    69997945.0 / 29380423.0,
];
