//! Vehicle model for MpcCtrl
//!
//! The kinematic bicycle model used both for latency compensation and as the
//! equality constraints of the optimisation. Positive steering angles produce
//! positive heading rates (a turn towards +y).

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use serde::{Deserialize, Serialize};

// Internal
use crate::maths::{poly_deriv, poly_val};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// The vehicle state as delivered by the upstream telemetry transform, in the
/// vehicle-local frame (x forward, y to the left, headings from +x towards
/// +y).
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct VehicleState {
    /// Position along the local frame x axis.
    ///
    /// Units: meters
    pub x_m: f64,

    /// Position along the local frame y axis.
    ///
    /// Units: meters
    pub y_m: f64,

    /// Heading.
    ///
    /// Units: radians
    pub psi_rad: f64,

    /// Speed.
    ///
    /// Units: same unit the tuning's `ref_speed` is expressed in.
    pub speed: f64,

    /// Cross-track error, positive when the path is to the left of the
    /// vehicle.
    ///
    /// Units: meters
    pub cte_m: f64,

    /// Orientation error relative to the path tangent.
    ///
    /// Units: radians
    pub epsi_rad: f64,
}

/// One actuation pair.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct Actuation {
    /// Steering angle demand.
    ///
    /// Units: radians
    pub steer_rad: f64,

    /// Acceleration demand.
    ///
    /// Units: normalised actuator range, full throttle = 1
    pub accel_norm: f64,
}

/// The reference path polynomial with its precomputed derivatives.
///
/// Coefficients are highest power first, the convention used by the upstream
/// path fitter and by `maths::poly_val`.
#[derive(Debug, Clone)]
pub struct RefPath {
    coeffs: Vec<f64>,
    d1_coeffs: Vec<f64>,
    d2_coeffs: Vec<f64>,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl VehicleState {
    /// Check that every component of the state is finite.
    pub fn is_finite(&self) -> bool {
        self.x_m.is_finite()
            && self.y_m.is_finite()
            && self.psi_rad.is_finite()
            && self.speed.is_finite()
            && self.cte_m.is_finite()
            && self.epsi_rad.is_finite()
    }
}

impl RefPath {
    /// Build a reference path from fitted polynomial coefficients.
    pub fn new(coeffs: &[f64]) -> Self {
        let d1_coeffs = poly_deriv(coeffs);
        let d2_coeffs = poly_deriv(&d1_coeffs);

        Self {
            coeffs: coeffs.to_vec(),
            d1_coeffs,
            d2_coeffs,
        }
    }

    /// The path's y value at the given x.
    pub fn value(&self, x: f64) -> f64 {
        poly_val(x, &self.coeffs)
    }

    /// The path's slope dy/dx at the given x.
    pub fn slope(&self, x: f64) -> f64 {
        poly_val(x, &self.d1_coeffs)
    }

    /// The second derivative of the path at the given x.
    pub fn second_deriv(&self, x: f64) -> f64 {
        poly_val(x, &self.d2_coeffs)
    }

    /// The heading of the path tangent at the given x.
    ///
    /// Units: radians
    pub fn tangent_heading(&self, x: f64) -> f64 {
        self.slope(x).atan()
    }
}

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Propagate the vehicle state one timestep forward under the given actuation.
///
/// This is the single definition of the plant model. The optimisation's
/// equality constraints are built from it, so a plan produced by repeatedly
/// calling this function has exactly zero constraint residual.
pub fn propagate(
    state: &VehicleState,
    actuation: &Actuation,
    path: &RefPath,
    dt_s: f64,
    lf_m: f64,
) -> VehicleState {
    let psi_rate = state.speed / lf_m * actuation.steer_rad;

    VehicleState {
        x_m: state.x_m + state.speed * state.psi_rad.cos() * dt_s,
        y_m: state.y_m + state.speed * state.psi_rad.sin() * dt_s,
        psi_rad: state.psi_rad + psi_rate * dt_s,
        speed: state.speed + actuation.accel_norm * dt_s,
        cte_m: (path.value(state.x_m) - state.y_m) + state.speed * state.epsi_rad.sin() * dt_s,
        epsi_rad: (state.psi_rad - path.tangent_heading(state.x_m)) + psi_rate * dt_s,
    }
}

/// Project the measured state forward to compensate for actuator latency.
///
/// The previously commanded actuation is applied for `latency_steps` model
/// steps, so the optimisation starts from the state the vehicle will be in
/// when the new actuation actually takes effect.
pub fn project_latency(
    state: &VehicleState,
    actuation: &Actuation,
    path: &RefPath,
    latency_steps: usize,
    dt_s: f64,
    lf_m: f64,
) -> VehicleState {
    let mut projected = *state;

    for _ in 0..latency_steps {
        projected = propagate(&projected, actuation, path, dt_s, lf_m);
    }

    projected
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_latency_projection_zero_actuation() {
        // Driving straight down a straight reference at constant speed: the
        // projection must only advance x, by speed * dt per step
        let state = VehicleState {
            x_m: 1.0,
            y_m: 2.0,
            psi_rad: 0.0,
            speed: 4.0,
            cte_m: 0.0,
            epsi_rad: 0.0,
        };
        // Reference running along y = 2
        let path = RefPath::new(&[2.0]);

        let projected = project_latency(&state, &Actuation::default(), &path, 3, 0.05, 2.67);

        assert!((projected.x_m - (1.0 + 3.0 * 4.0 * 0.05)).abs() < 1e-12);
        assert!((projected.y_m - 2.0).abs() < 1e-12);
        assert!(projected.psi_rad.abs() < 1e-12);
        assert!((projected.speed - 4.0).abs() < 1e-12);
        assert!(projected.cte_m.abs() < 1e-12);
        assert!(projected.epsi_rad.abs() < 1e-12);
    }

    #[test]
    fn test_zero_steps_is_identity() {
        let state = VehicleState {
            x_m: 0.3,
            y_m: -0.2,
            psi_rad: 0.1,
            speed: 5.0,
            cte_m: 0.4,
            epsi_rad: -0.1,
        };
        let path = RefPath::new(&[0.01, -0.2, 0.5]);

        let projected = project_latency(&state, &Actuation::default(), &path, 0, 0.05, 2.67);

        assert_eq!(projected.x_m, state.x_m);
        assert_eq!(projected.cte_m, state.cte_m);
    }

    #[test]
    fn test_positive_steer_turns_left() {
        // Positive steering must yield a positive heading rate
        let state = VehicleState {
            speed: 10.0,
            ..Default::default()
        };
        let actuation = Actuation {
            steer_rad: 0.1,
            accel_norm: 0.0,
        };
        let path = RefPath::new(&[0.0, 0.0]);

        let next = propagate(&state, &actuation, &path, 0.05, 2.67);

        assert!(next.psi_rad > 0.0);
    }

    #[test]
    fn test_ref_path_derivatives() {
        // f = 0.5x^2 - x + 3 -> f' = x - 1, f'' = 1
        let path = RefPath::new(&[0.5, -1.0, 3.0]);

        assert!((path.value(2.0) - 3.0).abs() < 1e-12);
        assert!((path.slope(2.0) - 1.0).abs() < 1e-12);
        assert!((path.second_deriv(2.0) - 1.0).abs() < 1e-12);
        assert!((path.tangent_heading(2.0) - 1.0_f64.atan()).abs() < 1e-12);
    }
}
