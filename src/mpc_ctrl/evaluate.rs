//! Cost and constraint evaluation for MpcCtrl
//!
//! Pure functions over the flat plan vector, queried repeatedly by the
//! solver. The cost gradient and the constraint Jacobian product are supplied
//! analytically from the closed form of the cost terms and the kinematic
//! model.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// Internal
use super::encode::Layout;
use super::model::{propagate, RefPath};
use super::params::CostWeights;

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Evaluate the scalar cost of a plan.
///
/// Tracking errors and the speed error are penalised at every horizon step,
/// actuation magnitudes at every interval, and actuation rates over every
/// pair of consecutive intervals.
pub fn cost(layout: &Layout, weights: &CostWeights, ref_speed: f64, plan: &[f64]) -> f64 {
    let n = layout.n_steps();
    let mut total = 0.0;

    for k in 0..n {
        total += weights.cte * plan[layout.cte + k].powi(2);
        total += weights.epsi * plan[layout.epsi + k].powi(2);
        total += weights.speed * (plan[layout.v + k] - ref_speed).powi(2);
    }

    for k in 0..n - 1 {
        total += weights.steer * plan[layout.delta + k].powi(2);
        total += weights.accel * plan[layout.a + k].powi(2);
    }

    for k in 0..n.saturating_sub(2) {
        let d_steer = plan[layout.delta + k + 1] - plan[layout.delta + k];
        let d_accel = plan[layout.a + k + 1] - plan[layout.a + k];
        total += weights.steer_rate * d_steer.powi(2);
        total += weights.accel_rate * d_accel.powi(2);
    }

    total
}

/// Evaluate the gradient of the cost with respect to the plan.
pub fn cost_grad(
    layout: &Layout,
    weights: &CostWeights,
    ref_speed: f64,
    plan: &[f64],
    grad: &mut [f64],
) {
    let n = layout.n_steps();

    for g in grad.iter_mut() {
        *g = 0.0;
    }

    for k in 0..n {
        grad[layout.cte + k] = 2.0 * weights.cte * plan[layout.cte + k];
        grad[layout.epsi + k] = 2.0 * weights.epsi * plan[layout.epsi + k];
        grad[layout.v + k] = 2.0 * weights.speed * (plan[layout.v + k] - ref_speed);
    }

    for k in 0..n - 1 {
        grad[layout.delta + k] += 2.0 * weights.steer * plan[layout.delta + k];
        grad[layout.a + k] += 2.0 * weights.accel * plan[layout.a + k];
    }

    for k in 0..n.saturating_sub(2) {
        let d_steer = plan[layout.delta + k + 1] - plan[layout.delta + k];
        grad[layout.delta + k + 1] += 2.0 * weights.steer_rate * d_steer;
        grad[layout.delta + k] -= 2.0 * weights.steer_rate * d_steer;

        let d_accel = plan[layout.a + k + 1] - plan[layout.a + k];
        grad[layout.a + k + 1] += 2.0 * weights.accel_rate * d_accel;
        grad[layout.a + k] -= 2.0 * weights.accel_rate * d_accel;
    }
}

/// Evaluate the dynamics equality residuals of a plan.
///
/// Residual block `k` is the difference between the plan's step `k + 1` state
/// and the kinematic model propagation of its step `k` state under the step
/// `k` actuation. A feasible plan has every residual equal to zero.
pub fn residuals(
    layout: &Layout,
    path: &RefPath,
    dt_s: f64,
    lf_m: f64,
    plan: &[f64],
    res: &mut [f64],
) {
    let n = layout.n_steps();
    let m = n - 1;

    for k in 0..m {
        let state = layout.state_at(plan, k);
        let actuation = layout.actuation_at(plan, k);
        let next = propagate(&state, &actuation, path, dt_s, lf_m);

        res[k] = plan[layout.x + k + 1] - next.x_m;
        res[m + k] = plan[layout.y + k + 1] - next.y_m;
        res[2 * m + k] = plan[layout.psi + k + 1] - next.psi_rad;
        res[3 * m + k] = plan[layout.v + k + 1] - next.speed;
        res[4 * m + k] = plan[layout.cte + k + 1] - next.cte_m;
        res[5 * m + k] = plan[layout.epsi + k + 1] - next.epsi_rad;
    }
}

/// Evaluate the product of the residual Jacobian transpose with a vector,
/// `out = J(plan)^T * d`.
///
/// The partials are the closed-form derivatives of the six propagation
/// equations, including the `f''/(1 + f'^2)` term from differentiating the
/// path tangent heading `atan(f'(x))`.
pub fn residual_jac_prod(
    layout: &Layout,
    path: &RefPath,
    dt_s: f64,
    lf_m: f64,
    plan: &[f64],
    d: &[f64],
    out: &mut [f64],
) {
    let n = layout.n_steps();
    let m = n - 1;

    for o in out.iter_mut() {
        *o = 0.0;
    }

    for k in 0..m {
        let x = plan[layout.x + k];
        let psi = plan[layout.psi + k];
        let v = plan[layout.v + k];
        let epsi = plan[layout.epsi + k];
        let steer = plan[layout.delta + k];

        let (sin_psi, cos_psi) = psi.sin_cos();
        let (sin_epsi, cos_epsi) = epsi.sin_cos();
        let slope = path.slope(x);

        let d_x = d[k];
        let d_y = d[m + k];
        let d_psi = d[2 * m + k];
        let d_v = d[3 * m + k];
        let d_cte = d[4 * m + k];
        let d_epsi = d[5 * m + k];

        // x_{k+1} - (x_k + v_k cos(psi_k) dt)
        out[layout.x + k + 1] += d_x;
        out[layout.x + k] -= d_x;
        out[layout.psi + k] += v * sin_psi * dt_s * d_x;
        out[layout.v + k] -= cos_psi * dt_s * d_x;

        // y_{k+1} - (y_k + v_k sin(psi_k) dt)
        out[layout.y + k + 1] += d_y;
        out[layout.y + k] -= d_y;
        out[layout.psi + k] -= v * cos_psi * dt_s * d_y;
        out[layout.v + k] -= sin_psi * dt_s * d_y;

        // psi_{k+1} - (psi_k + v_k/Lf delta_k dt)
        out[layout.psi + k + 1] += d_psi;
        out[layout.psi + k] -= d_psi;
        out[layout.v + k] -= steer * dt_s / lf_m * d_psi;
        out[layout.delta + k] -= v * dt_s / lf_m * d_psi;

        // v_{k+1} - (v_k + a_k dt)
        out[layout.v + k + 1] += d_v;
        out[layout.v + k] -= d_v;
        out[layout.a + k] -= dt_s * d_v;

        // cte_{k+1} - (f(x_k) - y_k + v_k sin(epsi_k) dt)
        out[layout.cte + k + 1] += d_cte;
        out[layout.x + k] -= slope * d_cte;
        out[layout.y + k] += d_cte;
        out[layout.v + k] -= sin_epsi * dt_s * d_cte;
        out[layout.epsi + k] -= v * cos_epsi * dt_s * d_cte;

        // epsi_{k+1} - (psi_k - atan(f'(x_k)) + v_k/Lf delta_k dt)
        out[layout.epsi + k + 1] += d_epsi;
        out[layout.psi + k] -= d_epsi;
        out[layout.x + k] += path.second_deriv(x) / (1.0 + slope * slope) * d_epsi;
        out[layout.v + k] -= steer * dt_s / lf_m * d_epsi;
        out[layout.delta + k] -= v * dt_s / lf_m * d_epsi;
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::mpc_ctrl::model::{Actuation, VehicleState};
    use crate::mpc_ctrl::params::Params;

    const DT_S: f64 = 0.05;
    const LF_M: f64 = 2.67;

    /// A deterministic but unstructured plan for derivative checks.
    fn scrambled_plan(layout: &Layout) -> Vec<f64> {
        (0..layout.n_vars())
            .map(|i| ((i * 7 + 3) % 11) as f64 / 11.0 - 0.4)
            .collect()
    }

    #[test]
    fn test_residuals_zero_for_propagated_plan() {
        // Build a plan by literally propagating the model forward, then check
        // the evaluator agrees that it is feasible
        let layout = Layout::new(10);
        let path = RefPath::new(&[0.01, -0.2, 0.5]);

        let mut plan = vec![0.0; layout.n_vars()];
        let mut state = VehicleState {
            x_m: 0.3,
            y_m: -0.2,
            psi_rad: 0.1,
            speed: 5.0,
            cte_m: 0.4,
            epsi_rad: -0.1,
        };

        layout.set_state(&mut plan, 0, &state);
        for k in 0..layout.n_steps() - 1 {
            let actuation = Actuation {
                steer_rad: 0.02 * ((k % 3) as f64 - 1.0),
                accel_norm: 0.1,
            };
            plan[layout.delta + k] = actuation.steer_rad;
            plan[layout.a + k] = actuation.accel_norm;

            state = propagate(&state, &actuation, &path, DT_S, LF_M);
            layout.set_state(&mut plan, k + 1, &state);
        }

        let mut res = vec![f64::NAN; layout.n_residuals()];
        residuals(&layout, &path, DT_S, LF_M, &plan, &mut res);

        for r in res {
            assert!(r.abs() < 1e-12);
        }
    }

    #[test]
    fn test_cost_monotonic_in_cte() {
        let params = Params::default();
        let layout = Layout::new(params.n_steps);
        let mut plan = vec![0.0; layout.n_vars()];

        let base = cost(&layout, &params.weights, 0.0, &plan);

        plan[layout.cte + 4] = 0.5;
        let small = cost(&layout, &params.weights, 0.0, &plan);

        plan[layout.cte + 4] = -1.5;
        let large = cost(&layout, &params.weights, 0.0, &plan);

        assert!(base < small);
        assert!(small < large);
    }

    #[test]
    fn test_cost_monotonic_in_steer_rate() {
        let params = Params::default();
        let layout = Layout::new(params.n_steps);
        let mut plan = vec![0.0; layout.n_vars()];

        // A steering step between intervals 3 and 4, everything else fixed
        plan[layout.delta + 3] = 0.1;
        plan[layout.delta + 4] = 0.1;
        let no_rate = cost(&layout, &params.weights, 0.0, &plan);

        plan[layout.delta + 4] = 0.2;
        let small_rate = cost(&layout, &params.weights, 0.0, &plan);

        plan[layout.delta + 4] = 0.4;
        let large_rate = cost(&layout, &params.weights, 0.0, &plan);

        assert!(no_rate < small_rate);
        assert!(small_rate < large_rate);
    }

    #[test]
    fn test_cost_grad_matches_finite_difference() {
        let weights = CostWeights::default();
        let layout = Layout::new(4);
        let ref_speed = 2.0;
        let plan = scrambled_plan(&layout);

        let mut grad = vec![f64::NAN; layout.n_vars()];
        cost_grad(&layout, &weights, ref_speed, &plan, &mut grad);

        let h = 1e-6;
        for i in 0..layout.n_vars() {
            let mut up = plan.clone();
            let mut down = plan.clone();
            up[i] += h;
            down[i] -= h;

            let fd = (cost(&layout, &weights, ref_speed, &up)
                - cost(&layout, &weights, ref_speed, &down))
                / (2.0 * h);

            assert!(
                (grad[i] - fd).abs() < 1e-4 * grad[i].abs().max(1.0),
                "gradient mismatch at index {}: analytic {} vs fd {}",
                i,
                grad[i],
                fd
            );
        }
    }

    #[test]
    fn test_jacobian_product_matches_finite_difference() {
        let layout = Layout::new(4);
        let path = RefPath::new(&[0.1, 0.2, -0.3]);
        let plan = scrambled_plan(&layout);
        let d: Vec<f64> = (0..layout.n_residuals())
            .map(|i| ((i * 5 + 1) % 7) as f64 / 7.0 - 0.5)
            .collect();

        let mut out = vec![f64::NAN; layout.n_vars()];
        residual_jac_prod(&layout, &path, DT_S, LF_M, &plan, &d, &mut out);

        let h = 1e-6;
        for j in 0..layout.n_vars() {
            let mut up = plan.clone();
            let mut down = plan.clone();
            up[j] += h;
            down[j] -= h;

            let mut res_up = vec![0.0; layout.n_residuals()];
            let mut res_down = vec![0.0; layout.n_residuals()];
            residuals(&layout, &path, DT_S, LF_M, &up, &mut res_up);
            residuals(&layout, &path, DT_S, LF_M, &down, &mut res_down);

            // Column j of the Jacobian dotted with d
            let fd: f64 = res_up
                .iter()
                .zip(&res_down)
                .zip(&d)
                .map(|((u, l), w)| (u - l) / (2.0 * h) * w)
                .sum();

            assert!(
                (out[j] - fd).abs() < 1e-4 * out[j].abs().max(1.0),
                "jacobian product mismatch at index {}: analytic {} vs fd {}",
                j,
                out[j],
                fd
            );
        }
    }
}
