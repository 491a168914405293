//! Iterative Schur complement solver
//!
//! Solves the damped least-squares system `min |A x - b|² + |D x|²` for a
//! Jacobian with the `[E | F]` layout:
//!
//! 1. Eliminate the `E` unknowns implicitly; see [`ImplicitSchurComplement`]
//! 2. Solve the reduced system `S x_F = r` with preconditioned conjugate
//!    gradients
//! 3. Back-substitute: `x_E = (EᵀE + De²)⁻¹ Eᵀ (b - F x_F)`
//!
//! # Preconditioners
//!
//! - `Identity`: plain conjugate gradients
//! - `Jacobi`: block diagonal inverse of `FᵀF + Df²` (Schur-Jacobi)
//! - `SchurPowerSeriesExpansion`: truncated Neumann series for `S⁻¹`
//!
//! With `use_spse_initialization`, the power series applied to `r` is also
//! used as the starting point of conjugate gradients.

use tracing::{debug, info};

use super::conjugate_gradients::{
    ConjugateGradientsOptions, ConjugateGradientsScratch, conjugate_gradients_solve,
};
use super::implicit_schur::{ImplicitSchurComplement, ImplicitSchurOptions, SchurBuffers};
use super::preconditioner::{IdentityPreconditioner, PowerSeriesOptions, PowerSeriesPreconditioner};
use super::{LinearOperator, LinearSolverSummary, LinearSolverTerminationType};
use crate::error::{ApexError, ApexResult};
use crate::parallel::{ExecutionContext, parallel_set_zero};
use crate::sparse::BlockSparseMatrix;

/// Preconditioner used for the reduced system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreconditionerType {
    Identity,
    #[default]
    Jacobi,
    SchurPowerSeriesExpansion,
}

/// Configuration for [`IterativeSchurComplementSolver`]
#[derive(Debug, Clone)]
pub struct IterativeSchurConfig {
    /// Number of leading column blocks eliminated through the Schur complement.
    pub num_eliminate_blocks: usize,
    pub preconditioner_type: PreconditionerType,
    /// Start conjugate gradients from the power series approximation of
    /// `S⁻¹ r` instead of zero.
    pub use_spse_initialization: bool,
    pub power_series: PowerSeriesOptions,
    pub conjugate_gradients: ConjugateGradientsOptions,
    pub num_threads: usize,
}

impl Default for IterativeSchurConfig {
    fn default() -> Self {
        Self {
            num_eliminate_blocks: 0,
            preconditioner_type: PreconditionerType::default(),
            use_spse_initialization: false,
            power_series: PowerSeriesOptions::default(),
            conjugate_gradients: ConjugateGradientsOptions::default(),
            num_threads: 1,
        }
    }
}

impl IterativeSchurConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_num_eliminate_blocks(mut self, num_eliminate_blocks: usize) -> Self {
        self.num_eliminate_blocks = num_eliminate_blocks;
        self
    }

    pub fn with_preconditioner(mut self, preconditioner_type: PreconditionerType) -> Self {
        self.preconditioner_type = preconditioner_type;
        self
    }

    pub fn with_spse_initialization(mut self, use_spse_initialization: bool) -> Self {
        self.use_spse_initialization = use_spse_initialization;
        self
    }

    pub fn with_power_series(mut self, power_series: PowerSeriesOptions) -> Self {
        self.power_series = power_series;
        self
    }

    pub fn with_conjugate_gradients(
        mut self,
        conjugate_gradients: ConjugateGradientsOptions,
    ) -> Self {
        self.conjugate_gradients = conjugate_gradients;
        self
    }

    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    /// Check option consistency.
    pub fn validate(&self) -> ApexResult<()> {
        let cg = &self.conjugate_gradients;
        if self.num_threads == 0 {
            return Err(ApexError::InvalidInput("num_threads must be positive".into()));
        }
        if cg.max_num_iterations < cg.min_num_iterations {
            return Err(ApexError::InvalidInput(format!(
                "max_num_iterations ({}) is smaller than min_num_iterations ({})",
                cg.max_num_iterations, cg.min_num_iterations
            )));
        }
        if cg.residual_reset_period == 0 {
            return Err(ApexError::InvalidInput(
                "residual_reset_period must be positive".into(),
            ));
        }
        if cg.r_tolerance < 0.0 || cg.q_tolerance < 0.0 || self.power_series.tolerance < 0.0 {
            return Err(ApexError::InvalidInput("tolerances must be non-negative".into()));
        }
        Ok(())
    }

    fn needs_ftf_inverse(&self) -> bool {
        self.use_spse_initialization
            || matches!(
                self.preconditioner_type,
                PreconditionerType::Jacobi | PreconditionerType::SchurPowerSeriesExpansion
            )
    }
}

/// Solves `[E | F]` least-squares systems by conjugate gradients on the
/// implicit Schur complement. Buffers are kept between calls to `solve`.
#[derive(Debug)]
pub struct IterativeSchurComplementSolver {
    config: IterativeSchurConfig,
    schur_buffers: SchurBuffers,
    cg_scratch: ConjugateGradientsScratch,
    reduced_solution: Vec<f64>,
}

impl IterativeSchurComplementSolver {
    pub fn new(config: IterativeSchurConfig) -> ApexResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            schur_buffers: SchurBuffers::default(),
            cg_scratch: ConjugateGradientsScratch::new(0),
            reduced_solution: Vec::new(),
        })
    }

    pub fn config(&self) -> &IterativeSchurConfig {
        &self.config
    }

    /// Solve `min |A x - b|² + |D x|²` into `x`.
    ///
    /// # Panics
    ///
    /// If `b`, `d` or `x` do not match the dimensions of `a`, or if `a` does
    /// not have the `[E | F]` layout.
    pub fn solve(
        &mut self,
        a: &BlockSparseMatrix,
        b: &[f64],
        d: Option<&[f64]>,
        x: &mut [f64],
        context: &ExecutionContext,
    ) -> LinearSolverSummary {
        assert_eq!(x.len(), a.num_cols(), "solution has wrong length");

        let schur_options = ImplicitSchurOptions::default()
            .with_num_eliminate_blocks(self.config.num_eliminate_blocks)
            .with_compute_ftf_inverse(self.config.needs_ftf_inverse())
            .with_num_threads(self.config.num_threads);
        let buffers = std::mem::take(&mut self.schur_buffers);
        let mut schur = ImplicitSchurComplement::with_buffers(schur_options, context, buffers);

        // Step 1: initialize the reduced system
        schur.init(a, d, b);
        let num_schur_complement_cols = schur.num_cols_f();

        let summary = if num_schur_complement_cols == 0 {
            // Step 2: nothing left to solve for, only back-substitution
            schur.back_substitute(&[], x);
            LinearSolverSummary::new(
                LinearSolverTerminationType::Success,
                "No parameter blocks left in the schur complement.",
                0,
            )
        } else {
            let summary = self.solve_reduced_system(&schur, context);
            // Step 5: recover the eliminated unknowns
            if summary.termination_type != LinearSolverTerminationType::Failure {
                schur.back_substitute(&self.reduced_solution, x);
            }
            summary
        };

        self.schur_buffers = schur.into_buffers();
        info!(
            "Iterative Schur solve: {} after {} iterations ({})",
            summary.termination_type, summary.num_iterations, summary.message
        );
        summary
    }

    fn solve_reduced_system(
        &mut self,
        schur: &ImplicitSchurComplement<'_>,
        context: &ExecutionContext,
    ) -> LinearSolverSummary {
        let config = &self.config;
        let num_threads = config.num_threads;
        let n = schur.num_cols_f();
        self.reduced_solution.resize(n, 0.0);
        self.cg_scratch.resize(n);

        // Step 3: starting point
        parallel_set_zero(context, num_threads, &mut self.reduced_solution);
        if config.use_spse_initialization {
            let power_series = PowerSeriesPreconditioner::new(
                schur,
                config.power_series.clone(),
                context,
                num_threads,
            );
            power_series.right_multiply_and_accumulate(schur.rhs(), &mut self.reduced_solution);
            debug!("Initialized conjugate gradients from the power series expansion");
        }

        // Step 4: run conjugate gradients with the chosen preconditioner
        let cg_options = config
            .conjugate_gradients
            .clone()
            .with_num_threads(num_threads);
        let scratch = &mut self.cg_scratch;
        let solution = &mut self.reduced_solution;
        let mut run = |preconditioner: &dyn LinearOperator| {
            conjugate_gradients_solve(
                &cg_options,
                schur,
                schur.rhs(),
                preconditioner,
                scratch,
                solution,
                context,
            )
        };

        match config.preconditioner_type {
            PreconditionerType::Identity => run(&IdentityPreconditioner::new(n)),
            PreconditionerType::Jacobi => match schur.block_diagonal_ftf_inverse() {
                Some(ftf_inverse) => run(ftf_inverse),
                None => LinearSolverSummary::new(
                    LinearSolverTerminationType::Failure,
                    "Schur-Jacobi preconditioner is missing the FtF block inverse.",
                    0,
                ),
            },
            PreconditionerType::SchurPowerSeriesExpansion => run(&PowerSeriesPreconditioner::new(
                schur,
                config.power_series.clone(),
                context,
                num_threads,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse::CompressedRowBlockStructure;
    use nalgebra::DVector;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn bundle_like_matrix(seed: u64) -> BlockSparseMatrix {
        // Three points (size 3) seen by two cameras (sizes 6 and 4), plus a
        // prior row on the cameras.
        let bs = CompressedRowBlockStructure::from_pattern(
            &[2, 2, 2, 2, 2, 2, 2, 2, 2, 4],
            &[3, 3, 3, 6, 4],
            &[
                vec![0, 3],
                vec![0, 4],
                vec![0, 3, 4],
                vec![1, 3],
                vec![1, 4],
                vec![1, 4],
                vec![2, 3],
                vec![2, 3, 4],
                vec![2, 4],
                vec![3, 4],
            ],
        );
        let mut matrix = BlockSparseMatrix::new(bs);
        let mut rng = StdRng::seed_from_u64(seed);
        for v in matrix.values_mut() {
            *v = rng.random_range(-1.0..1.0);
        }
        matrix.add_transpose_block_structure();
        matrix
    }

    fn dense_solution(a: &BlockSparseMatrix, b: &[f64], d: &[f64]) -> DVector<f64> {
        let dense = a.to_dense_matrix();
        let mut normal = dense.transpose() * &dense;
        for (i, di) in d.iter().enumerate() {
            normal[(i, i)] += di * di;
        }
        let rhs = dense.transpose() * DVector::from_column_slice(b);
        normal.cholesky().unwrap().solve(&rhs)
    }

    #[test]
    fn test_validate_rejects_inconsistent_options() {
        let config = IterativeSchurConfig::new().with_num_threads(0);
        assert!(IterativeSchurComplementSolver::new(config).is_err());

        let config = IterativeSchurConfig::new().with_conjugate_gradients(
            ConjugateGradientsOptions::default()
                .with_min_num_iterations(10)
                .with_max_num_iterations(5),
        );
        assert!(matches!(config.validate(), Err(ApexError::InvalidInput(_))));
    }

    #[test]
    fn test_every_preconditioner_solves_the_damped_system() {
        let context = ExecutionContext::new(2).unwrap();
        let a = bundle_like_matrix(3);
        let b: Vec<f64> = (0..a.num_rows()).map(|i| (i as f64 * 0.37).sin()).collect();
        let d = vec![0.1; a.num_cols()];
        let expected = dense_solution(&a, &b, &d);

        for preconditioner in [
            PreconditionerType::Identity,
            PreconditionerType::Jacobi,
            PreconditionerType::SchurPowerSeriesExpansion,
        ] {
            for threads in [1, 2] {
                let config = IterativeSchurConfig::new()
                    .with_num_eliminate_blocks(3)
                    .with_preconditioner(preconditioner)
                    .with_num_threads(threads)
                    .with_conjugate_gradients(
                        ConjugateGradientsOptions::default().with_r_tolerance(1e-10),
                    );
                let mut solver = IterativeSchurComplementSolver::new(config).unwrap();
                let mut x = vec![0.0; a.num_cols()];
                let summary = solver.solve(&a, &b, Some(&d), &mut x, &context);

                assert!(summary.is_success(), "{preconditioner:?}: {}", summary.message);
                // The truncated series varies with its input, so only the fixed
                // preconditioners are held to an iteration bound.
                if preconditioner != PreconditionerType::SchurPowerSeriesExpansion {
                    assert!(summary.num_iterations <= 30, "{preconditioner:?}");
                }
                let error = (DVector::from_vec(x) - &expected).norm();
                assert!(error < 1e-5, "{preconditioner:?} with {threads} threads: {error}");
            }
        }
    }

    /// Points observed by three distinct cameras each, one camera cell per
    /// row and no camera-only rows, so `FᵀF` is block diagonal.
    fn block_diagonal_ftf_matrix(
        num_points: usize,
        num_cameras: usize,
        seed: u64,
    ) -> BlockSparseMatrix {
        let mut col_sizes = vec![3; num_points];
        col_sizes.extend(std::iter::repeat_n(6, num_cameras));
        let mut pattern = Vec::new();
        for point in 0..num_points {
            for k in 0..3 {
                pattern.push(vec![point, num_points + (point + k) % num_cameras]);
            }
        }
        let row_sizes = vec![2; pattern.len()];
        let bs = CompressedRowBlockStructure::from_pattern(&row_sizes, &col_sizes, &pattern);
        let mut matrix = BlockSparseMatrix::new(bs);
        let mut rng = StdRng::seed_from_u64(seed);
        for v in matrix.values_mut() {
            *v = rng.random_range(-1.0..1.0);
        }
        matrix.add_transpose_block_structure();
        matrix
    }

    #[test]
    fn test_power_series_converges_quickly_with_block_diagonal_ftf() {
        let context = ExecutionContext::new(2).unwrap();
        let a = block_diagonal_ftf_matrix(12, 4, 31);
        let b: Vec<f64> = (0..a.num_rows()).map(|i| (i as f64 * 0.61).cos()).collect();
        let d = vec![2.0; a.num_cols()];
        let expected = dense_solution(&a, &b, &d);

        // With exact block inverses every term contracts by at most
        // max λ(EᵀE) / (max λ(EᵀE) + 4), so a long series is close to S⁻¹.
        let config = IterativeSchurConfig::new()
            .with_num_eliminate_blocks(12)
            .with_preconditioner(PreconditionerType::SchurPowerSeriesExpansion)
            .with_power_series(
                PowerSeriesOptions::default()
                    .with_max_num_iterations(100)
                    .with_tolerance(1e-14),
            )
            .with_num_threads(2)
            .with_conjugate_gradients(ConjugateGradientsOptions::default().with_r_tolerance(1e-10));
        let mut solver = IterativeSchurComplementSolver::new(config).unwrap();
        let mut x = vec![0.0; a.num_cols()];
        let summary = solver.solve(&a, &b, Some(&d), &mut x, &context);

        assert!(summary.is_success(), "{}", summary.message);
        assert!(summary.num_iterations <= 4, "{} iterations", summary.num_iterations);
        let error = (DVector::from_vec(x) - expected).norm();
        assert!(error < 1e-6, "{error}");
    }

    #[test]
    fn test_spse_initialization_and_solver_reuse() {
        let context = ExecutionContext::new(1).unwrap();
        let config = IterativeSchurConfig::new()
            .with_num_eliminate_blocks(3)
            .with_preconditioner(PreconditionerType::SchurPowerSeriesExpansion)
            .with_spse_initialization(true)
            .with_conjugate_gradients(ConjugateGradientsOptions::default().with_r_tolerance(1e-10));
        let mut solver = IterativeSchurComplementSolver::new(config).unwrap();

        for seed in [4, 5] {
            let a = bundle_like_matrix(seed);
            let b = vec![1.0; a.num_rows()];
            let d = vec![0.2; a.num_cols()];
            let mut x = vec![0.0; a.num_cols()];
            let summary = solver.solve(&a, &b, Some(&d), &mut x, &context);
            assert!(summary.is_success(), "{}", summary.message);
            let error = (DVector::from_vec(x) - dense_solution(&a, &b, &d)).norm();
            assert!(error < 1e-5, "seed {seed}: {error}");
        }
    }

    #[test]
    fn test_all_blocks_eliminated_skips_conjugate_gradients() {
        let context = ExecutionContext::new(1).unwrap();
        let bs = CompressedRowBlockStructure::from_pattern(
            &[2, 2, 3],
            &[2, 1],
            &[vec![0], vec![0], vec![1]],
        );
        let mut a = BlockSparseMatrix::new(bs);
        a.values_mut()
            .copy_from_slice(&[1.0, 2.0, 0.0, 1.0, 3.0, 0.0, 0.0, 1.0, 1.0, 2.0, 2.0]);
        let b = vec![1.0, 1.0, 2.0, 0.0, 1.0, 1.0, 1.0];
        let d = vec![0.0; 3];

        let config = IterativeSchurConfig::new().with_num_eliminate_blocks(2);
        let mut solver = IterativeSchurComplementSolver::new(config).unwrap();
        let mut x = vec![0.0; 3];
        let summary = solver.solve(&a, &b, None, &mut x, &context);

        assert!(summary.is_success());
        assert_eq!(summary.num_iterations, 0);
        let error = (DVector::from_vec(x) - dense_solution(&a, &b, &d)).norm();
        assert!(error < 1e-10);
    }
}
