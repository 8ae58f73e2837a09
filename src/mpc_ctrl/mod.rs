//! # MPC control module
//!
//! MPC control is responsible for keeping the vehicle on the reference path
//! produced by the upstream path fitter. Each cycle it solves a finite-horizon
//! constrained optimisation problem over the predicted motion of the vehicle
//! and commands the first actuation of the optimal sequence.
//!
//! The reference path is described by the coefficients of a polynomial fitted
//! in the vehicle's local frame (x forward, y to the left, headings measured
//! from +x towards +y). The optimisation unknowns are the predicted states
//! {x, y, psi, v, cte, epsi} at each of the N horizon steps together with the
//! actuations {delta, a} over the N-1 intervals between them. The kinematic
//! bicycle model links consecutive steps as equality constraints, and the cost
//! penalises cross-track error, heading error, speed error, actuation effort
//! and actuation rate.
//!
//! Actuator latency is compensated by projecting the measured state forward by
//! a fixed number of model steps using the previously commanded actuation, so
//! that the plan starts from the state the vehicle will be in when the new
//! actuation takes effect.
//!
//! The sign convention throughout is that a positive steering angle produces a
//! positive heading rate, i.e. a turn towards +y. The upstream frame transform
//! must deliver states and coefficients in the same convention.
//!
//! One solve runs at a time per module instance: `proc` takes the module by
//! mutable reference and the solver workspace is owned by it, so a
//! multi-threaded host must wrap the module in an exclusive lock. The solver
//! is bounded by both an iteration and a wall-clock budget so a cycle cannot
//! overrun the control period unchecked; exhausting either engages the
//! fallback actuation.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

mod encode;
mod evaluate;
mod model;
mod params;
mod solve;
mod state;

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// Internal
pub use encode::Layout;
pub use model::{Actuation, RefPath, VehicleState};
pub use params::{CostWeights, Params, ParamsError, SolverParams};
pub use solve::SolverExit;
pub use state::{InputData, MpcCtrl, OutputData, StatusReport, Trajectory};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Maximum number of reference polynomial coefficients accepted from the path
/// fitter (highest power first, so 6 coefficients is a quintic).
pub const MAX_POLY_COEFFS: usize = 6;

/// Smallest wheelbase constant accepted by parameter validation. Guards the
/// division by `lf_m` in the heading dynamics.
pub const MIN_LF_M: f64 = 1e-6;

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Possible errors that can occur during MpcCtrl operation.
///
/// These cover malformed inputs only. A solver failure is not an error at this
/// level: the module reports it through the status report and substitutes the
/// fallback actuation, so that the control loop always receives a command.
#[derive(Debug, thiserror::Error)]
pub enum MpcCtrlError {
    #[error("Vehicle state contains a non-finite value: {0:?}")]
    NonFiniteState(VehicleState),

    #[error(
        "Expected between 1 and {max} reference coefficients, found {0}",
        max = MAX_POLY_COEFFS
    )]
    InvalidCoeffCount(usize),

    #[error("Reference coefficients contain a non-finite value")]
    NonFiniteCoeffs,
}
