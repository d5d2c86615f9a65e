//! Two-body Keplerian orbit with an impulsive manoeuvre.
//!
//! Propagates a circular LEO orbit for one period, applies a prograde burn
//! through `reinitialize`, and propagates the resulting transfer orbit. The
//! gravitational parameter lives in an environment so it could be refreshed
//! per stage (here it only counts evaluations).
//!
//! Demonstrates per-component tolerances via `Tolerances::with_components()`.
//!
//! Run with:
//!   cargo run --example two_body_orbit

use embedded_rk::{
    AdaptiveIntegrator, DerivativeError, Environment, IntegratorSettings, OdeSystem,
    RungeKuttaMethod, StepLimits, Tolerances,
};

/// Central body shared by every stage evaluation
struct CentralBody {
    mu: f64,
    evaluations: u64,
}

impl Environment<6> for CentralBody {
    fn update(&mut self, _t: f64, _y: &[f64; 6]) -> Result<(), DerivativeError> {
        self.evaluations += 1;
        Ok(())
    }
}

/// Keplerian two-body problem: d²r/dt² = -μ r / |r|³
///
/// State vector: [x, y, z, vx, vy, vz]  (km, km/s)
struct TwoBody;

impl OdeSystem<6, CentralBody> for TwoBody {
    fn rhs(&self, body: &CentralBody, _t: f64, y: &[f64; 6], dydt: &mut [f64; 6]) -> Result<(), DerivativeError> {
        let r2 = y[0] * y[0] + y[1] * y[1] + y[2] * y[2];
        if r2 == 0.0 {
            return Err(DerivativeError::new("state at the centre of the central body"));
        }
        let r = r2.sqrt();
        let mu_r3 = body.mu / (r2 * r);

        // dr/dt = v
        dydt[0] = y[3];
        dydt[1] = y[4];
        dydt[2] = y[5];

        // dv/dt = -μ r / |r|³
        dydt[3] = -mu_r3 * y[0];
        dydt[4] = -mu_r3 * y[1];
        dydt[5] = -mu_r3 * y[2];
        Ok(())
    }
}

fn energy(mu: f64, y: &[f64; 6]) -> f64 {
    let r = (y[0] * y[0] + y[1] * y[1] + y[2] * y[2]).sqrt();
    let v2 = y[3] * y[3] + y[4] * y[4] + y[5] * y[5];
    0.5 * v2 - mu / r
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mu: f64 = 398600.4418; // Earth μ (km³/s²)

    // Circular orbit at 400 km altitude
    let earth_radius: f64 = 6378.137; // km
    let r0 = earth_radius + 400.0;
    let v0 = (mu / r0).sqrt(); // circular velocity
    let y0 = [r0, 0.0, 0.0, 0.0, v0, 0.0];

    // Orbital period: T = 2π √(a³/μ)
    let period = 2.0 * std::f64::consts::PI * (r0.powi(3) / mu).sqrt();

    // Per-component tolerances: tighter on position (km), looser on velocity (km/s)
    let atol = [1e-12, 1e-12, 1e-12, 1e-15, 1e-15, 1e-15];
    let rtol = [1e-13; 6];
    let settings = IntegratorSettings::new(
        RungeKuttaMethod::Fehlberg78,
        StepLimits::new(1e-6, 600.0),
        Tolerances::with_components(atol, rtol),
    );
    let body = CentralBody { mu, evaluations: 0 };
    let mut session = AdaptiveIntegrator::with_environment(TwoBody, body, 0.0, y0, settings)?;

    let e0 = energy(mu, &y0);
    let yf = session.integrate_to(period, 10.0)?;
    let ef = energy(mu, &yf);

    let pos_err = ((yf[0] - y0[0]).powi(2) + (yf[1] - y0[1]).powi(2) + (yf[2] - y0[2]).powi(2)).sqrt();

    println!("Two-Body Circular Orbit");
    println!("  Altitude:  400 km");
    println!("  Radius:    {r0:.3} km");
    println!("  Velocity:  {v0:.6} km/s");
    println!("  Period:    {:.1} s ({:.1} min)", period, period / 60.0);
    println!();
    println!("  Final time: {:.6} s", session.current_time());
    println!("  Position error (return to start): {pos_err:.2e} km");
    println!(
        "  Energy drift: {:.2e}  (relative: {:.2e})",
        (ef - e0).abs(),
        ((ef - e0) / e0).abs()
    );

    // Prograde burn of 100 m/s at perigee, then half a transfer orbit
    let dv = 0.1;
    let mut burned = *session.current_state();
    burned[4] += dv;
    session.reinitialize(session.current_time(), burned)?;

    let a = 1.0 / (2.0 / r0 - (v0 + dv).powi(2) / mu);
    let half_transfer = std::f64::consts::PI * (a.powi(3) / mu).sqrt();
    let ya = session.integrate_to(period + half_transfer, 10.0)?;
    let apogee = (ya[0] * ya[0] + ya[1] * ya[1] + ya[2] * ya[2]).sqrt();

    println!();
    println!("  Burn: {:.0} m/s prograde", dv * 1e3);
    println!("  Apogee radius: {apogee:.3} km (analytic {:.3} km)", 2.0 * a - r0);
    println!();
    println!("  Accepted steps: {}", session.stats().accepted_steps);
    println!("  Rejected steps: {}", session.stats().rejected_steps);
    println!("  Function evals: {}", session.stats().fn_evals);
    println!("  Environment updates: {}", session.environment().evaluations);
    Ok(())
}
