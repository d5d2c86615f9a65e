//! Burden & Faires Table 5.9 with a custom step-size rule.
//!
//! RKF45 on y' = y - t² + 1, y(0) = 0.5 over [0, 2] with TOL = 1e-5,
//! h ∈ [0.01, 0.25], and the textbook acceptance test R = |w̃ - w| / h <= TOL.
//!
//! Run with:
//!   cargo run --example burden_faires

use embedded_rk::{
    AdaptiveIntegrator, DerivativeError, IntegratorSettings, OdeSystem, RungeKuttaMethod,
    StepDecision, StepLimits, StepSizeInput, Tolerances,
};

struct TextbookProblem;

impl OdeSystem<1> for TextbookProblem {
    fn rhs(&self, _env: &(), t: f64, y: &[f64; 1], dydt: &mut [f64; 1]) -> Result<(), DerivativeError> {
        dydt[0] = y[0] - t * t + 1.0;
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let tol = 1e-5;
    let settings = IntegratorSettings::new(
        RungeKuttaMethod::Fehlberg45,
        StepLimits::new(0.01, 0.25),
        Tolerances::new(tol, 0.0),
    );

    let textbook_rule = move |input: &StepSizeInput<1>| {
        let h = input.step_size;
        let r = (input.higher[0] - input.lower[0]).abs() / h.abs();
        let delta = if r > 0.0 { 0.84 * (tol / r).powf(0.25) } else { 4.0 };
        StepDecision {
            next_step_size: h * delta.clamp(0.1, 4.0),
            accepted: r <= tol,
            error: r,
        }
    };

    let mut session =
        AdaptiveIntegrator::new(TextbookProblem, 0.0, [0.5], settings)?.with_step_control(textbook_rule);

    println!("{:>10} {:>12} {:>12} {:>12} {:>10}", "t_i", "w_i", "h_i", "R_i", "|y_i - w_i|");
    let mut h = 0.25;
    while session.current_time() < 2.0 {
        let remaining = 2.0 - session.current_time();
        let accepted = if h >= remaining {
            session.integrate_to(2.0, h)?;
            session.last_step_size().unwrap_or(remaining)
        } else {
            session.perform_step(h)?
        };

        let t = session.current_time();
        let w = session.current_state()[0];
        let exact = (t + 1.0).powi(2) - 0.5 * t.exp();
        println!(
            "{:>10.7} {:>12.7} {:>12.7} {:>12.2e} {:>10.2e}",
            t,
            w,
            accepted,
            session.last_error().unwrap_or(0.0),
            (exact - w).abs()
        );
        h = session.next_step_size().unwrap_or(h);
    }
    Ok(())
}
