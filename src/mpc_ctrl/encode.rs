//! Problem encoding for MpcCtrl
//!
//! Lays the horizon plan out as one flat vector of unknowns, builds the
//! variable bounds, and constructs the warm start the solver begins from.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// Internal
use super::model::{propagate, Actuation, RefPath, VehicleState};
use super::params::Params;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Starting offsets of each semantic field within the flat unknown vector.
///
/// The plan is field-major: all x values, then all y values and so on, with
/// the N-1 steering and acceleration actuations at the end. The dynamics
/// residuals follow the same field-major order over the N-1 step intervals.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    n: usize,

    /// Offset of the predicted x positions (length N)
    pub x: usize,
    /// Offset of the predicted y positions (length N)
    pub y: usize,
    /// Offset of the predicted headings (length N)
    pub psi: usize,
    /// Offset of the predicted speeds (length N)
    pub v: usize,
    /// Offset of the predicted cross-track errors (length N)
    pub cte: usize,
    /// Offset of the predicted orientation errors (length N)
    pub epsi: usize,
    /// Offset of the steering actuations (length N-1)
    pub delta: usize,
    /// Offset of the acceleration actuations (length N-1)
    pub a: usize,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Layout {
    /// Build the layout for an N step horizon.
    pub fn new(n_steps: usize) -> Self {
        Self {
            n: n_steps,
            x: 0,
            y: n_steps,
            psi: 2 * n_steps,
            v: 3 * n_steps,
            cte: 4 * n_steps,
            epsi: 5 * n_steps,
            delta: 6 * n_steps,
            a: 6 * n_steps + (n_steps - 1),
        }
    }

    /// Number of horizon steps N.
    pub fn n_steps(&self) -> usize {
        self.n
    }

    /// Total number of unknowns in the plan.
    pub fn n_vars(&self) -> usize {
        6 * self.n + 2 * (self.n - 1)
    }

    /// Total number of dynamics equality residuals.
    pub fn n_residuals(&self) -> usize {
        6 * (self.n - 1)
    }

    /// Extract the state at horizon step `k` from a plan.
    pub fn state_at(&self, plan: &[f64], k: usize) -> VehicleState {
        VehicleState {
            x_m: plan[self.x + k],
            y_m: plan[self.y + k],
            psi_rad: plan[self.psi + k],
            speed: plan[self.v + k],
            cte_m: plan[self.cte + k],
            epsi_rad: plan[self.epsi + k],
        }
    }

    /// Extract the actuation applied over step interval `k` from a plan.
    pub fn actuation_at(&self, plan: &[f64], k: usize) -> Actuation {
        Actuation {
            steer_rad: plan[self.delta + k],
            accel_norm: plan[self.a + k],
        }
    }

    /// Write the state at horizon step `k` into a plan.
    pub fn set_state(&self, plan: &mut [f64], k: usize, state: &VehicleState) {
        plan[self.x + k] = state.x_m;
        plan[self.y + k] = state.y_m;
        plan[self.psi + k] = state.psi_rad;
        plan[self.v + k] = state.speed;
        plan[self.cte + k] = state.cte_m;
        plan[self.epsi + k] = state.epsi_rad;
    }
}

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Build the lower and upper bounds on the plan unknowns.
///
/// Actuations are bounded to the physical actuator ranges and states are
/// bounded to a very large symmetric box, except the step 0 state which is
/// pinned to the latency-projected initial state with a zero-width interval.
/// That pin is how the initial condition constraint is encoded, so no
/// separate constraint type is needed.
pub fn bounds(
    params: &Params,
    layout: &Layout,
    init_state: &VehicleState,
) -> (Vec<f64>, Vec<f64>) {
    let n = layout.n_steps();
    let mut lower = vec![-params.state_bound; layout.n_vars()];
    let mut upper = vec![params.state_bound; layout.n_vars()];

    for k in 0..n - 1 {
        lower[layout.delta + k] = -params.max_steer_rad;
        upper[layout.delta + k] = params.max_steer_rad;
        lower[layout.a + k] = -params.max_accel_norm;
        upper[layout.a + k] = params.max_accel_norm;
    }

    // Pin step 0 to the initial state
    layout.set_state(&mut lower, 0, init_state);
    layout.set_state(&mut upper, 0, init_state);

    (lower, upper)
}

/// Build the plan the solver starts from.
///
/// If the previous cycle produced a converged plan it is reused with the
/// pinned step 0 entries overwritten by the new initial state. Otherwise the
/// initial state is propagated forward under zero actuation, which produces a
/// plan whose dynamics residuals are exactly zero.
pub fn warm_start(
    params: &Params,
    layout: &Layout,
    path: &RefPath,
    init_state: &VehicleState,
    previous: Option<&[f64]>,
) -> Vec<f64> {
    if let Some(prev) = previous {
        if prev.len() == layout.n_vars() {
            let mut plan = prev.to_vec();
            layout.set_state(&mut plan, 0, init_state);
            return plan;
        }
    }

    let mut plan = vec![0.0; layout.n_vars()];
    let mut state = *init_state;

    layout.set_state(&mut plan, 0, &state);
    for k in 1..layout.n_steps() {
        state = propagate(
            &state,
            &Actuation::default(),
            path,
            params.dt_s,
            params.lf_m,
        );
        layout.set_state(&mut plan, k, &state);
    }

    plan
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------
