//! Implementations for the MpcCtrl state structure

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use log::{debug, trace, warn};
use optimization_engine::alm::AlmCache;
use serde::Serialize;

// Internal
use super::encode::Layout;
use super::model::{project_latency, Actuation, RefPath, VehicleState};
use super::params::{Params, ParamsError};
use super::solve::{self, SolverExit};
use super::{MpcCtrlError, MAX_POLY_COEFFS};
use crate::maths::{all_finite, clamp};
use crate::module::State;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// MPC control module state
#[derive(Default)]
pub struct MpcCtrl {
    params: Params,

    report: StatusReport,

    /// The actuation commanded on the previous cycle. Used for the latency
    /// projection and as the steering hold of the fallback.
    last_actuation: Option<Actuation>,

    /// The previous converged plan, reused as the solver warm start.
    warm_plan: Option<Vec<f64>>,

    /// Solver workspace, allocated at init and reused every cycle.
    alm_cache: Option<AlmCache>,

    output: Option<OutputData>,
}

/// Input data to MPC control.
#[derive(Debug, Default, Clone)]
pub struct InputData {
    /// The vehicle state measured this cycle, in the vehicle-local frame.
    pub state: VehicleState,

    /// Reference path polynomial coefficients from the upstream path fitter,
    /// highest power first.
    pub path_coeffs: Vec<f64>,
}

/// Output from MPC control for one cycle.
#[derive(Debug, Default, Clone, Serialize)]
pub struct OutputData {
    /// The actuation to command this cycle.
    pub actuation: Actuation,

    /// The predicted motion over the horizon, for telemetry and display.
    pub trajectory: Trajectory,
}

/// The predicted motion over the optimisation horizon.
///
/// The position sequences have length N and the actuation sequences length
/// N - 1. Element 0 of the actuation sequences is the command applied this
/// cycle. All sequences are empty when the fallback is engaged, as a failed
/// solve has no meaningful prediction.
#[derive(Debug, Default, Clone, Serialize)]
pub struct Trajectory {
    /// Predicted x positions.
    ///
    /// Units: meters
    pub x_m: Vec<f64>,

    /// Predicted y positions.
    ///
    /// Units: meters
    pub y_m: Vec<f64>,

    /// Planned steering angles.
    ///
    /// Units: radians
    pub steer_rad: Vec<f64>,

    /// Planned accelerations.
    ///
    /// Units: normalised actuator range
    pub accel_norm: Vec<f64>,
}

/// Status report for MpcCtrl processing.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatusReport {
    /// How the solver terminated.
    pub solver_exit: SolverExit,

    /// If true the solver failed and the fallback actuation was commanded.
    pub fallback_engaged: bool,

    /// If true the extracted actuation was clamped to the actuator limits.
    pub actuation_limited: bool,

    /// Outer solver iterations used.
    pub num_outer_iterations: u64,

    /// Fixed point residual norm of the last inner problem.
    pub norm_fpr: f64,

    /// Euclidean norm of the dynamics residuals of the returned plan.
    pub dynamics_residual_norm: f64,

    /// Cost of the returned plan.
    pub cost: f64,

    /// Wall-clock duration of the solve.
    ///
    /// Units: seconds
    pub solve_time_s: f64,
}

impl Default for StatusReport {
    fn default() -> Self {
        StatusReport {
            solver_exit: SolverExit::Converged,
            fallback_engaged: false,
            actuation_limited: false,
            num_outer_iterations: 0,
            norm_fpr: 0.0,
            dynamics_residual_norm: 0.0,
            cost: 0.0,
            solve_time_s: 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl State for MpcCtrl {
    type InitData = Params;
    type InitError = ParamsError;

    type InputData = InputData;
    type OutputData = OutputData;
    type StatusReport = StatusReport;
    type ProcError = MpcCtrlError;

    /// Initialise the MpcCtrl module.
    ///
    /// Expected init data is the parameter set, normally loaded from a
    /// parameter file with `params::load`. The parameters are validated
    /// before being accepted.
    fn init(&mut self, init_data: Self::InitData) -> Result<(), Self::InitError> {
        init_data.validate()?;

        self.alm_cache = Some(solve::new_cache(&init_data));
        self.params = init_data;
        self.last_actuation = None;
        self.warm_plan = None;

        Ok(())
    }

    /// Perform cyclic processing of MPC control.
    ///
    /// Processing involves:
    ///  1. Input validation, rejecting malformed states and coefficients
    ///     before any solve is attempted.
    ///  2. Latency projection of the measured state.
    ///  3. Solving the horizon optimisation.
    ///  4. Extracting the first actuation and the predicted trajectory, or
    ///     engaging the fallback actuation if the solver failed.
    ///
    /// A solver failure is not an `Err`: it is flagged in the status report
    /// and substituted by the fallback so the control loop always receives a
    /// usable command.
    fn proc(
        &mut self,
        input_data: &Self::InputData,
    ) -> Result<(Self::OutputData, Self::StatusReport), Self::ProcError> {
        // Clear the status report
        self.report = StatusReport::default();

        self.validate_input(input_data)?;

        let path = RefPath::new(&input_data.path_coeffs);

        // Project the measured state to where the vehicle will be when this
        // cycle's actuation actually takes effect
        let prev_actuation = self.last_actuation.unwrap_or_default();
        let init_state = project_latency(
            &input_data.state,
            &prev_actuation,
            &path,
            self.params.latency_steps,
            self.params.dt_s,
            self.params.lf_m,
        );

        // The workspace is normally created at init, but recreate it here if
        // proc is called on a default-constructed module
        if self.alm_cache.is_none() {
            self.alm_cache = Some(solve::new_cache(&self.params));
        }

        // Safe to unwrap as the cache is created above if missing
        let cache = self.alm_cache.as_mut().unwrap();

        let outcome = solve::solve_horizon(
            &self.params,
            &path,
            &init_state,
            self.warm_plan.as_deref(),
            cache,
        );

        self.report.solver_exit = outcome.exit;
        self.report.num_outer_iterations = outcome.num_outer_iterations;
        self.report.norm_fpr = outcome.norm_fpr;
        self.report.dynamics_residual_norm = outcome.residual_norm;
        self.report.cost = outcome.cost;
        self.report.solve_time_s = outcome.solve_time_s;

        let output = if outcome.exit == SolverExit::Converged && all_finite(&outcome.plan) {
            let layout = Layout::new(self.params.n_steps);

            let actuation = self.enforce_limits(&layout.actuation_at(&outcome.plan, 0));
            let trajectory = Trajectory::from_plan(&layout, &outcome.plan);

            debug!(
                "MPC converged in {} outer iterations ({:.3} ms), cost {:.3}",
                outcome.num_outer_iterations,
                outcome.solve_time_s * 1e3,
                outcome.cost
            );

            self.warm_plan = Some(outcome.plan);

            OutputData {
                actuation,
                trajectory,
            }
        } else {
            self.report.fallback_engaged = true;

            warn!(
                "MPC solve failed ({:?}) after {} outer iterations, residual norm {:.3e}: \
                 engaging fallback actuation",
                outcome.exit, outcome.num_outer_iterations, outcome.residual_norm
            );

            // A stale plan is worse than none as a warm start after a failure
            self.warm_plan = None;

            // Hold the previous steering and brake
            let actuation = self.enforce_limits(&Actuation {
                steer_rad: prev_actuation.steer_rad,
                accel_norm: self.params.fallback_accel_norm,
            });

            OutputData {
                actuation,
                trajectory: Trajectory::default(),
            }
        };

        trace!(
            "MpcCtrl output: steer {:.4} rad, accel {:.4}",
            output.actuation.steer_rad,
            output.actuation.accel_norm
        );

        // The commanded actuation feeds the next cycle's latency projection
        self.last_actuation = Some(output.actuation);
        self.output = Some(output.clone());

        Ok((output, self.report))
    }
}

impl MpcCtrl {
    /// The output computed on the most recent successful cycle.
    pub fn last_output(&self) -> Option<&OutputData> {
        self.output.as_ref()
    }

    /// Check the cycle's input before it reaches the encoder.
    fn validate_input(&self, input_data: &InputData) -> Result<(), MpcCtrlError> {
        if !input_data.state.is_finite() {
            return Err(MpcCtrlError::NonFiniteState(input_data.state));
        }

        let n_coeffs = input_data.path_coeffs.len();
        if n_coeffs == 0 || n_coeffs > MAX_POLY_COEFFS {
            return Err(MpcCtrlError::InvalidCoeffCount(n_coeffs));
        }

        if !all_finite(&input_data.path_coeffs) {
            return Err(MpcCtrlError::NonFiniteCoeffs);
        }

        Ok(())
    }

    /// Enforce the actuator limits on an actuation.
    ///
    /// The solver already constrains the plan to the actuator boxes, so this
    /// only acts on numerical overshoot or a fallback built from stale data.
    /// If a limit is applied the corresponding flag in the status report is
    /// raised.
    fn enforce_limits(&mut self, actuation: &Actuation) -> Actuation {
        let limited = Actuation {
            steer_rad: clamp(
                &actuation.steer_rad,
                &-self.params.max_steer_rad,
                &self.params.max_steer_rad,
            ),
            accel_norm: clamp(
                &actuation.accel_norm,
                &-self.params.max_accel_norm,
                &self.params.max_accel_norm,
            ),
        };

        if limited.steer_rad != actuation.steer_rad || limited.accel_norm != actuation.accel_norm {
            self.report.actuation_limited = true;
        }

        limited
    }
}

impl Trajectory {
    /// Extract the predicted trajectory from a solved plan.
    fn from_plan(layout: &Layout, plan: &[f64]) -> Self {
        let n = layout.n_steps();

        Trajectory {
            x_m: plan[layout.x..layout.x + n].to_vec(),
            y_m: plan[layout.y..layout.y + n].to_vec(),
            steer_rad: plan[layout.delta..layout.delta + n - 1].to_vec(),
            accel_norm: plan[layout.a..layout.a + n - 1].to_vec(),
        }
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    /// Default tuning with the solver budgets relaxed enough for unoptimised
    /// test builds, and latency compensation disabled so scenarios start from
    /// the exact given state.
    fn test_params() -> Params {
        let mut params = Params::default();
        params.latency_steps = 0;
        params.solver.max_outer_iterations = 60;
        params.solver.max_solve_time_ms = 5000;
        params
    }

    fn straight_input(speed: f64) -> InputData {
        InputData {
            state: VehicleState {
                x_m: 0.0,
                y_m: 0.0,
                psi_rad: 0.0,
                speed,
                cte_m: 0.0,
                epsi_rad: 0.0,
            },
            path_coeffs: vec![0.0, 0.0],
        }
    }

    #[test]
    fn test_straight_line_tracking() {
        let mut ctrl = MpcCtrl::default();
        ctrl.init(test_params()).unwrap();

        // On the reference below the target speed: expect near zero steering
        // over the whole horizon and a positive acceleration demand
        let (output, report) = ctrl.proc(&straight_input(50.0)).unwrap();

        assert!(!report.fallback_engaged);
        assert_eq!(report.solver_exit, SolverExit::Converged);
        assert!(output.actuation.steer_rad.abs() < 1e-2);
        assert!(output.actuation.accel_norm > 0.2);

        for steer in &output.trajectory.steer_rad {
            assert!(steer.abs() < 1e-2);
        }

        assert_eq!(output.trajectory.x_m.len(), 15);
        assert_eq!(output.trajectory.y_m.len(), 15);
        assert_eq!(output.trajectory.steer_rad.len(), 14);
        assert_eq!(output.trajectory.accel_norm.len(), 14);
    }

    #[test]
    fn test_left_curve_steers_left() {
        let mut params = test_params();
        params.ref_speed = 15.0;

        let mut ctrl = MpcCtrl::default();
        ctrl.init(params).unwrap();

        // Reference curving towards +y ahead of the vehicle. With the
        // positive-steer = positive-heading-rate convention the command must
        // be a left (positive) steer
        let input = InputData {
            state: VehicleState {
                x_m: 0.0,
                y_m: 0.0,
                psi_rad: 0.0,
                speed: 10.0,
                cte_m: 0.0,
                epsi_rad: 0.0,
            },
            path_coeffs: vec![0.02, 0.0, 0.0],
        };

        let (output, report) = ctrl.proc(&input).unwrap();

        assert!(!report.fallback_engaged);
        assert!(output.actuation.steer_rad > 1e-3);
    }

    #[test]
    fn test_solver_failure_engages_fallback() {
        let mut params = test_params();
        params.solver.max_outer_iterations = 1;
        params.solver.max_inner_iterations = 1;
        params.solver.delta_tolerance = 1e-14;
        params.solver.epsilon_tolerance = 1e-14;
        let fallback_accel_norm = params.fallback_accel_norm;

        let mut ctrl = MpcCtrl::default();
        ctrl.init(params).unwrap();

        // Large initial error so the starved solver cannot converge
        let input = InputData {
            state: VehicleState {
                x_m: 0.0,
                y_m: 0.0,
                psi_rad: 0.5,
                speed: 20.0,
                cte_m: 3.0,
                epsi_rad: 0.5,
            },
            path_coeffs: vec![0.02, 0.0, 0.0],
        };

        let (output, report) = ctrl.proc(&input).unwrap();

        assert!(report.fallback_engaged);
        assert!(report.solver_exit != SolverExit::Converged);

        // The fallback is the documented braking command, never a NaN
        assert!(output.actuation.steer_rad.is_finite());
        assert!((output.actuation.accel_norm - fallback_accel_norm).abs() < 1e-12);
        assert!(output.trajectory.x_m.is_empty());
    }

    #[test]
    fn test_warm_start_continuity() {
        let mut ctrl = MpcCtrl::default();
        ctrl.init(test_params()).unwrap();

        let input = straight_input(50.0);
        let (first, _) = ctrl.proc(&input).unwrap();
        let (second, report) = ctrl.proc(&input).unwrap();

        assert!(!report.fallback_engaged);
        // Commands on consecutive near-identical cycles stay consistent
        assert!((first.actuation.steer_rad - second.actuation.steer_rad).abs() < 1e-2);
    }

    #[test]
    fn test_invalid_input_rejected() {
        let mut ctrl = MpcCtrl::default();
        ctrl.init(test_params()).unwrap();

        let mut input = straight_input(10.0);
        input.state.speed = f64::NAN;
        assert!(matches!(
            ctrl.proc(&input),
            Err(MpcCtrlError::NonFiniteState(_))
        ));

        let mut input = straight_input(10.0);
        input.path_coeffs = vec![];
        assert!(matches!(
            ctrl.proc(&input),
            Err(MpcCtrlError::InvalidCoeffCount(0))
        ));

        let mut input = straight_input(10.0);
        input.path_coeffs = vec![0.0; MAX_POLY_COEFFS + 1];
        assert!(matches!(
            ctrl.proc(&input),
            Err(MpcCtrlError::InvalidCoeffCount(_))
        ));

        let mut input = straight_input(10.0);
        input.path_coeffs = vec![0.0, f64::INFINITY];
        assert!(matches!(
            ctrl.proc(&input),
            Err(MpcCtrlError::NonFiniteCoeffs)
        ));

        // No output was produced by the rejected cycles
        assert!(ctrl.last_output().is_none());
    }
}
