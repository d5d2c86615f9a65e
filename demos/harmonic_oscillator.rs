//! Basic usage: harmonic oscillator with every built-in method.
//!
//! Integrates y'' + ω²y = 0 for one period and compares with the exact solution.
//!
//! Run with:
//!   cargo run --example harmonic_oscillator

use embedded_rk::{
    AdaptiveIntegrator, DerivativeError, IntegratorSettings, OdeSystem, RungeKuttaMethod,
    StepLimits, Tolerances,
};

/// Simple harmonic oscillator: y'' + ω²y = 0
///
/// State vector: [y, y']
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

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let omega = 2.0;

    // Integrate for one full period: T = 2π/ω
    let period = 2.0 * std::f64::consts::PI / omega;
    let y0 = [1.0, 0.0]; // y(0) = 1, y'(0) = 0

    // Exact solution: y(t) = cos(ωt), y'(t) = -ω sin(ωt)
    let y_exact = (omega * period).cos();
    let v_exact = -omega * (omega * period).sin();

    println!("Harmonic Oscillator (ω = {omega}), period {period:.6} s");
    println!();
    println!("  {:<26} {:>10} {:>10} {:>8} {:>8} {:>8}", "method", "y error", "y' error", "accept", "reject", "evals");

    for method in RungeKuttaMethod::ALL {
        let settings = IntegratorSettings::new(method, StepLimits::new(1e-10, 1.0), Tolerances::new(1e-12, 1e-12));
        let mut session = AdaptiveIntegrator::new(HarmonicOscillator { omega }, 0.0, y0, settings)?;
        let yf = session.integrate_to(period, 0.01)?;
        let stats = session.stats();

        println!(
            "  {:<26} {:>10.2e} {:>10.2e} {:>8} {:>8} {:>8}",
            method.name(),
            (yf[0] - y_exact).abs(),
            (yf[1] - v_exact).abs(),
            stats.accepted_steps,
            stats.rejected_steps,
            stats.fn_evals
        );
    }
    Ok(())
}
