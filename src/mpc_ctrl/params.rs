//! Parameters structure for MpcCtrl

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use serde::Deserialize;

// Internal
use super::MIN_LF_M;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Parameters for MPC control.
///
/// These are fixed for the lifetime of the module. `Default` carries the
/// tuning used on the reference vehicle; a parameter file can override it via
/// `params::load`.
#[derive(Debug, Clone, Deserialize)]
pub struct Params {
    // ---- HORIZON ----
    /// Number of timesteps in the prediction horizon.
    pub n_steps: usize,

    /// Duration of one horizon timestep.
    ///
    /// Units: seconds
    pub dt_s: f64,

    /// Number of model steps the initial state is projected forward by to
    /// compensate for actuator latency. The compensated delay is
    /// `latency_steps * dt_s` seconds.
    pub latency_steps: usize,

    // ---- VEHICLE ----
    /// Distance from the front axle to the centre of gravity.
    ///
    /// Units: meters
    pub lf_m: f64,

    /// The speed the optimisation drives the vehicle towards.
    ///
    /// Units: same speed unit as the telemetry's `speed` field.
    pub ref_speed: f64,

    // ---- CAPABILITIES ----
    /// Maximum steering angle magnitude (the bound is symmetric).
    ///
    /// Units: radians
    pub max_steer_rad: f64,

    /// Maximum acceleration/braking magnitude (the bound is symmetric).
    ///
    /// Units: normalised actuator range, full throttle = 1
    pub max_accel_norm: f64,

    /// Bound applied to the unpinned state unknowns. Effectively unbounded,
    /// but the solver requires a finite box.
    pub state_bound: f64,

    // ---- FALLBACK ----
    /// Acceleration commanded when the solver fails to converge. Negative
    /// values brake the vehicle.
    ///
    /// Units: normalised actuator range
    pub fallback_accel_norm: f64,

    /// Cost function weights.
    pub weights: CostWeights,

    /// Solver budgets and tolerances.
    pub solver: SolverParams,
}

/// Weights of each cost component.
///
/// Cross-track error dominates the state terms since lateral deviation is the
/// primary tracking metric, and the steering rate weight dominates the
/// actuation terms to suppress the oscillatory steering a myopic tracking
/// objective would otherwise favour. The absolute actuation weights are light
/// tie-breakers.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CostWeights {
    /// Cross-track error penalty
    pub cte: f64,

    /// Heading error penalty
    pub epsi: f64,

    /// Speed tracking penalty
    pub speed: f64,

    /// Steering magnitude penalty
    pub steer: f64,

    /// Acceleration magnitude penalty
    pub accel: f64,

    /// Steering rate penalty
    pub steer_rate: f64,

    /// Acceleration rate penalty
    pub accel_rate: f64,
}

/// Budgets and tolerances for the constrained solver.
///
/// One solve must return well within the control period, so both an iteration
/// and a wall-clock budget are enforced. Exhausting either engages the
/// fallback actuation.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SolverParams {
    /// Maximum number of outer (constraint-tightening) iterations.
    pub max_outer_iterations: usize,

    /// Maximum total number of inner solver iterations.
    pub max_inner_iterations: usize,

    /// Tolerance on the infinity norm of the dynamics constraint violation.
    pub delta_tolerance: f64,

    /// Tolerance on the inner solver's fixed point residual.
    pub epsilon_tolerance: f64,

    /// Initial penalty applied to constraint violation.
    pub initial_penalty: f64,

    /// L-BFGS memory length of the inner solver.
    pub lbfgs_memory: usize,

    /// Wall-clock budget for one solve.
    ///
    /// Units: milliseconds
    pub max_solve_time_ms: u64,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// An error in the parameter set, detected at initialisation.
#[derive(Debug, thiserror::Error)]
pub enum ParamsError {
    #[error("Horizon must be at least 2 steps, got {0}")]
    HorizonTooShort(usize),

    #[error("Step duration must be positive, got {0}")]
    NonPositiveStep(f64),

    #[error("Wheelbase constant lf_m must be at least {min}, got {0}", min = MIN_LF_M)]
    WheelbaseTooSmall(f64),

    #[error("Cost weight `{0}` must be non-negative, got {1}")]
    NegativeWeight(&'static str, f64),

    #[error("Bound `{0}` must be positive, got {1}")]
    NonPositiveBound(&'static str, f64),

    #[error("Solver tolerance `{0}` must be positive, got {1}")]
    NonPositiveTolerance(&'static str, f64),

    #[error("Solver budget `{0}` must be non-zero")]
    ZeroSolverBudget(&'static str),
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Params {
    /// Validate the parameter set.
    ///
    /// Must be called before the parameters are used for a solve, normally
    /// from `MpcCtrl::init`.
    pub fn validate(&self) -> Result<(), ParamsError> {
        if self.n_steps < 2 {
            return Err(ParamsError::HorizonTooShort(self.n_steps));
        }
        if self.dt_s <= 0.0 {
            return Err(ParamsError::NonPositiveStep(self.dt_s));
        }
        if self.lf_m < MIN_LF_M {
            return Err(ParamsError::WheelbaseTooSmall(self.lf_m));
        }

        for &(name, value) in &[
            ("cte", self.weights.cte),
            ("epsi", self.weights.epsi),
            ("speed", self.weights.speed),
            ("steer", self.weights.steer),
            ("accel", self.weights.accel),
            ("steer_rate", self.weights.steer_rate),
            ("accel_rate", self.weights.accel_rate),
        ] {
            if value < 0.0 {
                return Err(ParamsError::NegativeWeight(name, value));
            }
        }

        for &(name, value) in &[
            ("max_steer_rad", self.max_steer_rad),
            ("max_accel_norm", self.max_accel_norm),
            ("state_bound", self.state_bound),
        ] {
            if value <= 0.0 {
                return Err(ParamsError::NonPositiveBound(name, value));
            }
        }

        for &(name, value) in &[
            ("delta_tolerance", self.solver.delta_tolerance),
            ("epsilon_tolerance", self.solver.epsilon_tolerance),
            ("initial_penalty", self.solver.initial_penalty),
        ] {
            if value <= 0.0 {
                return Err(ParamsError::NonPositiveTolerance(name, value));
            }
        }

        if self.solver.max_outer_iterations == 0 {
            return Err(ParamsError::ZeroSolverBudget("max_outer_iterations"));
        }
        if self.solver.max_inner_iterations == 0 {
            return Err(ParamsError::ZeroSolverBudget("max_inner_iterations"));
        }
        if self.solver.lbfgs_memory == 0 {
            return Err(ParamsError::ZeroSolverBudget("lbfgs_memory"));
        }
        if self.solver.max_solve_time_ms == 0 {
            return Err(ParamsError::ZeroSolverBudget("max_solve_time_ms"));
        }

        Ok(())
    }
}

impl Default for Params {
    fn default() -> Self {
        Params {
            n_steps: 15,
            dt_s: 0.05,
            latency_steps: 2,
            lf_m: 2.67,
            ref_speed: 100.0,
            max_steer_rad: 25.0_f64.to_radians(),
            max_accel_norm: 1.0,
            state_bound: 1.0e19,
            fallback_accel_norm: -0.3,
            weights: CostWeights::default(),
            solver: SolverParams::default(),
        }
    }
}

impl Default for CostWeights {
    fn default() -> Self {
        CostWeights {
            cte: 100.0,
            epsi: 1.0,
            speed: 1.0,
            steer: 1.0,
            accel: 5.0,
            steer_rate: 600.0,
            accel_rate: 1.0,
        }
    }
}

impl Default for SolverParams {
    fn default() -> Self {
        SolverParams {
            max_outer_iterations: 30,
            max_inner_iterations: 20000,
            delta_tolerance: 1e-3,
            epsilon_tolerance: 1e-4,
            initial_penalty: 10.0,
            lbfgs_memory: 10,
            max_solve_time_ms: 40,
        }
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------
