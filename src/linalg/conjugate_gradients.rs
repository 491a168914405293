//! Preconditioned conjugate gradients for symmetric positive definite
//! operators.
//!
//! Two convergence tests run every iteration once `min_num_iterations` have
//! been taken:
//!
//! 1. Quadratic model: with `Q(x) = xᵀAx - 2bᵀx`, stop when
//!    `i * (Q_i - Q_{i-1}) / Q_i < q_tolerance`. Useful inside an inexact
//!    Newton loop, where the step only needs to decrease the model enough.
//! 2. Residual: stop when `|r| <= r_tolerance * |b|`.
//!
//! The residual is recomputed from scratch as `b - Ax` every
//! `residual_reset_period` iterations to bound the drift of the cheap
//! `r -= alpha q` update.
//!
//! Outcomes are reported through [`LinearSolverSummary`]; an indefinite
//! operator or a breakdown is a summary, not an error.

use super::{LinearOperator, LinearSolverSummary, LinearSolverTerminationType};
use crate::parallel::{ExecutionContext, axpby, dot, norm, parallel_assign, parallel_set_zero};

#[derive(Debug, Clone)]
pub struct ConjugateGradientsOptions {
    pub min_num_iterations: usize,
    pub max_num_iterations: usize,
    pub residual_reset_period: usize,
    /// Relative residual tolerance, scaled by `|b|`.
    pub r_tolerance: f64,
    /// Quadratic model tolerance.
    pub q_tolerance: f64,
    pub num_threads: usize,
}

impl Default for ConjugateGradientsOptions {
    fn default() -> Self {
        Self {
            min_num_iterations: 1,
            max_num_iterations: 500,
            residual_reset_period: 10,
            r_tolerance: 1e-9,
            q_tolerance: 0.0,
            num_threads: 1,
        }
    }
}

impl ConjugateGradientsOptions {
    pub fn with_min_num_iterations(mut self, min_num_iterations: usize) -> Self {
        self.min_num_iterations = min_num_iterations;
        self
    }

    pub fn with_max_num_iterations(mut self, max_num_iterations: usize) -> Self {
        self.max_num_iterations = max_num_iterations;
        self
    }

    pub fn with_residual_reset_period(mut self, residual_reset_period: usize) -> Self {
        self.residual_reset_period = residual_reset_period;
        self
    }

    pub fn with_r_tolerance(mut self, r_tolerance: f64) -> Self {
        self.r_tolerance = r_tolerance;
        self
    }

    pub fn with_q_tolerance(mut self, q_tolerance: f64) -> Self {
        self.q_tolerance = q_tolerance;
        self
    }

    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }
}

/// Work vectors for [`conjugate_gradients_solve`]. Allocated once and reused
/// across solves of the same size so the iteration itself never allocates.
#[derive(Debug, Clone, Default)]
pub struct ConjugateGradientsScratch {
    r: Vec<f64>,
    p: Vec<f64>,
    z: Vec<f64>,
    tmp: Vec<f64>,
}

impl ConjugateGradientsScratch {
    pub fn new(num_cols: usize) -> Self {
        let mut scratch = Self::default();
        scratch.resize(num_cols);
        scratch
    }

    pub fn resize(&mut self, num_cols: usize) {
        for v in [&mut self.r, &mut self.p, &mut self.z, &mut self.tmp] {
            v.resize(num_cols, 0.0);
        }
    }

    pub fn len(&self) -> usize {
        self.r.len()
    }

    pub fn is_empty(&self) -> bool {
        self.r.is_empty()
    }
}

#[inline]
fn is_zero_or_infinite(x: f64) -> bool {
    x == 0.0 || x.is_infinite()
}

/// Solve `A x = b` starting from the value already in `solution`.
///
/// `lhs` must be symmetric positive definite and `preconditioner` should
/// approximate its inverse; both are applied as accumulate-into products.
///
/// # Panics
///
/// If the vector lengths disagree with `lhs` or the scratch space.
pub fn conjugate_gradients_solve<A, P>(
    options: &ConjugateGradientsOptions,
    lhs: &A,
    rhs: &[f64],
    preconditioner: &P,
    scratch: &mut ConjugateGradientsScratch,
    solution: &mut [f64],
    context: &ExecutionContext,
) -> LinearSolverSummary
where
    A: LinearOperator + ?Sized,
    P: LinearOperator + ?Sized,
{
    let n = lhs.num_cols();
    assert_eq!(lhs.num_rows(), n, "conjugate gradients needs a square operator");
    assert_eq!(rhs.len(), n, "rhs has wrong length");
    assert_eq!(solution.len(), n, "solution has wrong length");
    assert_eq!(scratch.len(), n, "scratch space has wrong length");
    assert!(options.residual_reset_period > 0, "residual_reset_period must be positive");

    let num_threads = options.num_threads;
    let ConjugateGradientsScratch { r, p, z, tmp } = scratch;

    let mut summary = LinearSolverSummary::new(
        LinearSolverTerminationType::NoConvergence,
        "Maximum number of iterations reached.",
        0,
    );

    let norm_b = norm(context, num_threads, rhs);
    if norm_b == 0.0 {
        parallel_set_zero(context, num_threads, solution);
        summary.termination_type = LinearSolverTerminationType::Success;
        summary.message = "Convergence. |b| = 0.".to_string();
        tracing::debug!("CG: {}", summary.message);
        return summary;
    }

    let tol_r = options.r_tolerance * norm_b;

    // r = b - A x
    compute_residual(lhs, rhs, solution, r, tmp, context, num_threads);
    let mut norm_r = norm(context, num_threads, r);
    if options.min_num_iterations == 0 && norm_r <= tol_r {
        summary.termination_type = LinearSolverTerminationType::Success;
        summary.message = format!("Convergence. |r| = {norm_r:e} <= {tol_r:e}.");
        tracing::debug!("CG: {}", summary.message);
        return summary;
    }

    let mut rho = 1.0;

    // Q0 = xᵀAx - 2bᵀx = -xᵀ(b + r)
    let mut q0 = quadratic_model(rhs, solution, r, tmp, context, num_threads);

    summary.num_iterations = 1;
    loop {
        parallel_set_zero(context, num_threads, z);
        preconditioner.right_multiply_and_accumulate_par(r, z, context, num_threads);

        let last_rho = rho;
        rho = dot(context, num_threads, r, z);
        if is_zero_or_infinite(rho) {
            summary.termination_type = LinearSolverTerminationType::Failure;
            summary.message = format!("Numerical failure. rho = r'z = {rho:e}.");
            break;
        }

        if summary.num_iterations == 1 {
            parallel_assign(context, num_threads, p, z);
        } else {
            let beta = rho / last_rho;
            if is_zero_or_infinite(beta) {
                summary.termination_type = LinearSolverTerminationType::Failure;
                summary.message = format!(
                    "Numerical failure. beta = rho_n / rho_{{n-1}} = {beta:e}, \
                     rho_n = {rho:e}, rho_{{n-1}} = {last_rho:e}"
                );
                break;
            }
            // p = z + beta * p
            axpby(context, num_threads, 1.0, z, beta, p);
        }

        let q = &mut *tmp;
        parallel_set_zero(context, num_threads, q);
        lhs.right_multiply_and_accumulate_par(p, q, context, num_threads);
        let pq = dot(context, num_threads, p, q);
        if pq <= 0.0 || pq.is_infinite() {
            summary.termination_type = LinearSolverTerminationType::NoConvergence;
            summary.message = format!(
                "Matrix is indefinite, no more progress can be made. \
                 p'q = {pq:e}. |p| = {:e}, |q| = {:e}",
                norm(context, num_threads, p),
                norm(context, num_threads, q)
            );
            break;
        }

        let alpha = rho / pq;
        if alpha.is_infinite() {
            summary.termination_type = LinearSolverTerminationType::Failure;
            summary.message = format!(
                "Numerical failure. alpha = rho / pq = {alpha:e}, rho = {rho:e}, pq = {pq:e}."
            );
            break;
        }

        // x = x + alpha * p
        axpby(context, num_threads, alpha, p, 1.0, solution);

        if summary.num_iterations % options.residual_reset_period == 0 {
            compute_residual(lhs, rhs, solution, r, tmp, context, num_threads);
        } else {
            // r = r - alpha * q
            axpby(context, num_threads, -alpha, tmp, 1.0, r);
        }

        let q1 = quadratic_model(rhs, solution, r, tmp, context, num_threads);
        let zeta = summary.num_iterations as f64 * (q1 - q0) / q1;
        tracing::trace!(
            "CG iteration {}: alpha = {alpha:e}, rho = {rho:e}, Q = {q1:e}, zeta = {zeta:e}",
            summary.num_iterations
        );
        if zeta < options.q_tolerance && summary.num_iterations >= options.min_num_iterations {
            summary.termination_type = LinearSolverTerminationType::Success;
            summary.message = format!(
                "Iteration: {} Convergence: zeta = {zeta:e} < {:e}. |r| = {:e}",
                summary.num_iterations,
                options.q_tolerance,
                norm(context, num_threads, r)
            );
            break;
        }
        q0 = q1;

        norm_r = norm(context, num_threads, r);
        if norm_r <= tol_r && summary.num_iterations >= options.min_num_iterations {
            summary.termination_type = LinearSolverTerminationType::Success;
            summary.message = format!(
                "Iteration: {} Convergence. |r| = {norm_r:e} <= {tol_r:e}.",
                summary.num_iterations
            );
            break;
        }

        if summary.num_iterations >= options.max_num_iterations {
            break;
        }
        summary.num_iterations += 1;
    }

    tracing::debug!(
        "CG terminated with {} after {} iterations: {}",
        summary.termination_type,
        summary.num_iterations,
        summary.message
    );
    summary
}

/// `r = b - A x`, using `tmp` for `A x`.
fn compute_residual<A: LinearOperator + ?Sized>(
    lhs: &A,
    rhs: &[f64],
    solution: &[f64],
    r: &mut [f64],
    tmp: &mut [f64],
    context: &ExecutionContext,
    num_threads: usize,
) {
    parallel_set_zero(context, num_threads, tmp);
    lhs.right_multiply_and_accumulate_par(solution, tmp, context, num_threads);
    parallel_assign(context, num_threads, r, rhs);
    axpby(context, num_threads, -1.0, tmp, 1.0, r);
}

/// `Q(x) = -xᵀ(b + r)`, which equals `xᵀAx - 2bᵀx` when `r = b - Ax`.
fn quadratic_model(
    rhs: &[f64],
    solution: &[f64],
    r: &[f64],
    tmp: &mut [f64],
    context: &ExecutionContext,
    num_threads: usize,
) -> f64 {
    parallel_assign(context, num_threads, tmp, r);
    axpby(context, num_threads, 1.0, rhs, 1.0, tmp);
    -dot(context, num_threads, solution, tmp)
}
