// Levenberg-Marquardt least squares
// Minimizes the squared norm of a residual vector over a parameter vector

use nalgebra::{DMatrix, DVector};
use tracing::trace;

/// Relative step for the finite-difference Jacobian
const JACOBIAN_STEP: f64 = 1e-6;
/// Floor for the damped diagonal so flat directions still get damped
const MIN_DIAGONAL: f64 = 1e-12;

pub trait LmProblem {
    fn residual(&self, params: &DVector<f64>) -> DVector<f64>;

    /// Central differences unless the problem knows better.
    fn jacobian(&self, params: &DVector<f64>) -> DMatrix<f64> {
        let mut shifted = params.clone();
        let mut columns = Vec::with_capacity(params.len());

        for i in 0..params.len() {
            let h = JACOBIAN_STEP * params[i].abs().max(1.0);
            shifted[i] = params[i] + h;
            let plus = self.residual(&shifted);
            shifted[i] = params[i] - h;
            let minus = self.residual(&shifted);
            shifted[i] = params[i];
            columns.push((plus - minus) / (2.0 * h));
        }

        DMatrix::from_columns(&columns)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LmSettings {
    pub max_iterations: usize,
    /// Stop once a step lowers the cost by less than this fraction
    pub tolerance: f64,
    pub initial_lambda: f64,
    /// Damping is multiplied or divided by this after each trial step
    pub lambda_factor: f64,
    /// Give up when no step helps even with this much damping
    pub max_lambda: f64,
}

impl Default for LmSettings {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-12,
            initial_lambda: 1e-3,
            lambda_factor: 10.0,
            max_lambda: 1e12,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LmOutcome {
    pub params: DVector<f64>,
    /// Sum of squared residuals at `params`
    pub cost: f64,
    pub iterations: usize,
}

/// Damped Gauss-Newton with Marquardt's diagonal scaling.
/// The cost never increases; a rejected step only raises the damping.
pub fn levenberg_marquardt<P: LmProblem>(problem: &P, init: DVector<f64>, settings: &LmSettings) -> LmOutcome {
    let mut params = init;
    let mut residual = problem.residual(&params);
    let mut cost = residual.norm_squared();
    let mut lambda = settings.initial_lambda;
    let mut iterations = 0;

    'outer: while iterations < settings.max_iterations && cost > 0.0 {
        iterations += 1;
        let jacobian = problem.jacobian(&params);
        let jt = jacobian.transpose();
        let jtj = &jt * &jacobian;
        let gradient = &jt * &residual;

        loop {
            if lambda > settings.max_lambda {
                break 'outer;
            }

            let mut damped = jtj.clone();
            for i in 0..damped.nrows() {
                damped[(i, i)] += lambda * jtj[(i, i)].max(MIN_DIAGONAL);
            }

            let Some(step) = damped.lu().solve(&-&gradient) else {
                lambda *= settings.lambda_factor;
                continue;
            };

            let candidate = &params + &step;
            let candidate_residual = problem.residual(&candidate);
            let candidate_cost = candidate_residual.norm_squared();

            if candidate_cost.is_finite() && candidate_cost < cost {
                let improvement = (cost - candidate_cost) / cost;
                params = candidate;
                residual = candidate_residual;
                cost = candidate_cost;
                lambda = (lambda / settings.lambda_factor).max(f64::EPSILON);
                trace!(iterations, cost, lambda, "accepted step");

                if improvement < settings.tolerance {
                    break 'outer;
                }
                break;
            }
            lambda *= settings.lambda_factor;
        }
    }

    LmOutcome {
        params,
        cost,
        iterations,
    }
}
