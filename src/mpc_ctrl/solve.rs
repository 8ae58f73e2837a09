//! Solve driver for MpcCtrl
//!
//! Builds the constrained optimisation problem from the encoder and the
//! evaluator and hands it to the external solver. The solver is PANOC with an
//! augmented Lagrangian outer loop (the `optimization_engine` crate), which
//! takes exactly the capability this module needs: minimise a scalar
//! objective subject to box constraints on the unknowns and equality
//! constraints on the dynamics residuals, given the cost gradient and the
//! constraint Jacobian product.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use log::debug;
use optimization_engine::{
    alm::{AlmCache, AlmFactory, AlmOptimizer, AlmProblem, NO_JACOBIAN_MAPPING, NO_MAPPING},
    constraints::{Ball2, Rectangle, Zero},
    core::ExitStatus,
    panoc::PANOCCache,
    SolverError,
};
use serde::Serialize;
use std::time::{Duration, Instant};

// Internal
use super::encode::{self, Layout};
use super::evaluate;
use super::model::{RefPath, VehicleState};
use super::params::Params;
use crate::maths::all_finite;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Radius of the ball the Lagrange multiplier estimates are projected onto.
const MULTIPLIER_BOUND: f64 = 1e12;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// The result of one horizon solve.
pub(super) struct SolveOutcome {
    /// The plan the solver terminated with. Only meaningful as a solution
    /// when `exit` is `Converged`.
    pub plan: Vec<f64>,

    /// How the solver terminated.
    pub exit: SolverExit,

    /// Outer iterations used.
    pub num_outer_iterations: u64,

    /// Fixed point residual norm of the last inner problem.
    pub norm_fpr: f64,

    /// Cost of the terminal plan.
    pub cost: f64,

    /// Euclidean norm of the dynamics residuals of the terminal plan.
    pub residual_norm: f64,

    /// Wall-clock duration of the solve.
    pub solve_time_s: f64,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Classification of how a solve terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SolverExit {
    /// Feasible and optimal within tolerances.
    Converged,

    /// The iteration budget ran out before convergence.
    IterationLimit,

    /// The wall-clock budget ran out before convergence.
    TimeLimit,

    /// The cost, gradient or residual evaluation produced a non-finite value.
    NumericFailure,
}

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Allocate the solver workspace for the given parameter set.
///
/// The workspace is reused across cycles, which lets the inner solver keep
/// its L-BFGS memory between solves.
pub(super) fn new_cache(params: &Params) -> AlmCache {
    let layout = Layout::new(params.n_steps);

    let panoc_cache = PANOCCache::new(
        layout.n_vars(),
        params.solver.epsilon_tolerance,
        params.solver.lbfgs_memory,
    );

    AlmCache::new(panoc_cache, layout.n_residuals(), 0)
}

/// Solve the horizon optimisation for one cycle.
///
/// Never panics on solver trouble: every failure mode is folded into the
/// returned `SolverExit` so the caller can apply its fallback policy.
pub(super) fn solve_horizon(
    params: &Params,
    path: &RefPath,
    init_state: &VehicleState,
    previous_plan: Option<&[f64]>,
    cache: &mut AlmCache,
) -> SolveOutcome {
    let start = Instant::now();

    let layout = Layout::new(params.n_steps);
    let n_residuals = layout.n_residuals();

    let (lower, upper) = encode::bounds(params, &layout, init_state);
    let mut plan = encode::warm_start(params, &layout, path, init_state, previous_plan);

    let weights = params.weights;
    let ref_speed = params.ref_speed;
    let dt_s = params.dt_s;
    let lf_m = params.lf_m;

    let f = |z: &[f64], cost: &mut f64| -> Result<(), SolverError> {
        *cost = evaluate::cost(&layout, &weights, ref_speed, z);
        if cost.is_finite() {
            Ok(())
        } else {
            Err(SolverError::NotFiniteComputation)
        }
    };

    let df = |z: &[f64], grad: &mut [f64]| -> Result<(), SolverError> {
        evaluate::cost_grad(&layout, &weights, ref_speed, z, grad);
        if all_finite(grad) {
            Ok(())
        } else {
            Err(SolverError::NotFiniteComputation)
        }
    };

    let f1 = |z: &[f64], res: &mut [f64]| -> Result<(), SolverError> {
        evaluate::residuals(&layout, path, dt_s, lf_m, z, res);
        if all_finite(res) {
            Ok(())
        } else {
            Err(SolverError::NotFiniteComputation)
        }
    };

    let jf1t = |z: &[f64], d: &[f64], out: &mut [f64]| -> Result<(), SolverError> {
        evaluate::residual_jac_prod(&layout, path, dt_s, lf_m, z, d, out);
        if all_finite(out) {
            Ok(())
        } else {
            Err(SolverError::NotFiniteComputation)
        }
    };

    let factory = AlmFactory::new(
        f,
        df,
        Some(f1),
        Some(jf1t),
        NO_MAPPING,
        NO_JACOBIAN_MAPPING,
        Some(Zero::new()),
        0,
    );

    let bounds = Rectangle::new(Some(&lower), Some(&upper));
    let set_y = Ball2::new(None, MULTIPLIER_BOUND);

    let alm_problem = AlmProblem::new(
        bounds,
        Some(Zero::new()),
        Some(set_y),
        |z: &[f64], xi: &[f64], cost: &mut f64| -> Result<(), SolverError> {
            factory.psi(z, xi, cost)
        },
        |z: &[f64], xi: &[f64], grad: &mut [f64]| -> Result<(), SolverError> {
            factory.d_psi(z, xi, grad)
        },
        Some(f1),
        NO_MAPPING,
        n_residuals,
        0,
    );

    let mut optimizer = AlmOptimizer::new(cache, alm_problem)
        .with_delta_tolerance(params.solver.delta_tolerance)
        .with_epsilon_tolerance(params.solver.epsilon_tolerance)
        .with_max_outer_iterations(params.solver.max_outer_iterations)
        .with_max_inner_iterations(params.solver.max_inner_iterations)
        .with_initial_penalty(params.solver.initial_penalty)
        .with_max_duration(Duration::from_millis(params.solver.max_solve_time_ms));

    let result = optimizer.solve(&mut plan);
    let solve_time_s = start.elapsed().as_secs_f64();

    let (exit, num_outer_iterations, norm_fpr) = match result {
        Ok(status) => {
            let exit = match status.exit_status() {
                ExitStatus::Converged => SolverExit::Converged,
                ExitStatus::NotConvergedIterations => SolverExit::IterationLimit,
                ExitStatus::NotConvergedOutOfTime => SolverExit::TimeLimit,
            };

            (
                exit,
                status.num_outer_iterations() as u64,
                status.last_problem_norm_fpr(),
            )
        }
        Err(e) => {
            debug!("Solver aborted: {:?}", e);
            (SolverExit::NumericFailure, 0, f64::NAN)
        }
    };

    // Diagnostics of the plan the solver stopped at
    let (cost, residual_norm) = if all_finite(&plan) {
        let mut res = vec![0.0; n_residuals];
        evaluate::residuals(&layout, path, dt_s, lf_m, &plan, &mut res);
        let norm = res.iter().map(|r| r * r).sum::<f64>().sqrt();

        (evaluate::cost(&layout, &weights, ref_speed, &plan), norm)
    } else {
        (f64::NAN, f64::NAN)
    };

    SolveOutcome {
        plan,
        exit,
        num_outer_iterations,
        norm_fpr,
        cost,
        residual_norm,
        solve_time_s,
    }
}
