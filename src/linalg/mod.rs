//! Linear operators and iterative solvers.
//!
//! This module provides the pieces of an inexact Newton step for problems
//! whose Jacobian splits into eliminated ("E") and reduced ("F") columns:
//! - A linear operator interface shared by matrices, the implicit Schur
//!   complement and preconditioners
//! - Preconditioned conjugate gradients with quadratic model termination
//! - Block Jacobi and power series preconditioners
//! - The iterative Schur complement solver tying them together

use std::fmt;

use crate::parallel::ExecutionContext;

pub mod conjugate_gradients;
pub mod implicit_schur;
pub mod iterative_schur;
pub mod preconditioner;
pub mod small_dense;


pub use conjugate_gradients::*;
pub use implicit_schur::*;
pub use iterative_schur::*;
pub use preconditioner::*;

/// Anything that can compute `y += A x` into a caller-provided vector.
pub trait LinearOperator {
    /// `y += A x`
    fn right_multiply_and_accumulate(&self, x: &[f64], y: &mut [f64]);

    /// Multi-threaded `y += A x`. Operators without a parallel kernel run
    /// the single-threaded product.
    fn right_multiply_and_accumulate_par(
        &self,
        x: &[f64],
        y: &mut [f64],
        _context: &ExecutionContext,
        _num_threads: usize,
    ) {
        self.right_multiply_and_accumulate(x, y);
    }

    fn num_rows(&self) -> usize;

    fn num_cols(&self) -> usize;
}

/// How an iterative linear solve ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolverTerminationType {
    /// A convergence criterion was met.
    Success,
    /// The iteration stopped without meeting a convergence criterion, e.g.
    /// the iteration budget ran out or the operator is indefinite.
    NoConvergence,
    /// Numerical breakdown; the solution is not usable.
    Failure,
}

impl fmt::Display for LinearSolverTerminationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "SUCCESS",
            Self::NoConvergence => "NO_CONVERGENCE",
            Self::Failure => "FAILURE",
        };
        f.write_str(name)
    }
}

/// Outcome of an iterative linear solve.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearSolverSummary {
    pub termination_type: LinearSolverTerminationType,
    pub message: String,
    pub num_iterations: usize,
}

impl LinearSolverSummary {
    pub fn new(
        termination_type: LinearSolverTerminationType,
        message: impl Into<String>,
        num_iterations: usize,
    ) -> Self {
        Self {
            termination_type,
            message: message.into(),
            num_iterations,
        }
    }

    pub fn is_success(&self) -> bool {
        self.termination_type == LinearSolverTerminationType::Success
    }
}
