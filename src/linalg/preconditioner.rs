//! Preconditioners for conjugate gradients.
//!
//! A preconditioner is a [`LinearOperator`] approximating the inverse of the
//! system operator, refreshed from the Jacobian and damping with
//! [`Preconditioner::update`] before each solve.

use std::cell::RefCell;

use super::LinearOperator;
use super::implicit_schur::ImplicitSchurComplement;
use super::small_dense::matrix_transpose_matrix_multiply;
use crate::parallel::{ExecutionContext, norm, parallel_set_zero};
use crate::sparse::{
    BlockRandomAccessDiagonalMatrix, BlockRandomAccessMatrix, BlockSparseMatrix, CellHandle,
    PartitionedMatrixView,
};

pub trait Preconditioner: LinearOperator {
    /// Rebuild from the Jacobian `a` and optional damping `d`. Returns
    /// `false` when the preconditioner could not be formed.
    fn update(&mut self, a: &BlockSparseMatrix, d: Option<&[f64]>) -> bool;
}

/// `M = I`
#[derive(Debug, Clone)]
pub struct IdentityPreconditioner {
    num_rows: usize,
}

impl IdentityPreconditioner {
    pub fn new(num_rows: usize) -> Self {
        Self { num_rows }
    }
}

impl LinearOperator for IdentityPreconditioner {
    fn right_multiply_and_accumulate(&self, x: &[f64], y: &mut [f64]) {
        for (yi, xi) in y.iter_mut().zip(x) {
            *yi += xi;
        }
    }

    fn num_rows(&self) -> usize {
        self.num_rows
    }

    fn num_cols(&self) -> usize {
        self.num_rows
    }
}

impl Preconditioner for IdentityPreconditioner {
    fn update(&mut self, _a: &BlockSparseMatrix, _d: Option<&[f64]>) -> bool {
        true
    }
}

/// Inverse of the block diagonal of `AᵀA + D²`, one block per column block
/// of `A`.
#[derive(Debug)]
pub struct BlockJacobiPreconditioner<'a> {
    block_diagonal: BlockRandomAccessDiagonalMatrix,
    context: &'a ExecutionContext,
    num_threads: usize,
}

impl<'a> BlockJacobiPreconditioner<'a> {
    pub fn new(a: &BlockSparseMatrix, context: &'a ExecutionContext, num_threads: usize) -> Self {
        let sizes: Vec<usize> = a.block_structure().cols.iter().map(|col| col.size).collect();
        Self {
            block_diagonal: BlockRandomAccessDiagonalMatrix::new(&sizes),
            context,
            num_threads,
        }
    }

    pub fn block_diagonal(&self) -> &BlockRandomAccessDiagonalMatrix {
        &self.block_diagonal
    }
}

impl LinearOperator for BlockJacobiPreconditioner<'_> {
    fn right_multiply_and_accumulate(&self, x: &[f64], y: &mut [f64]) {
        self.block_diagonal
            .right_multiply_and_accumulate_par(x, y, self.context, self.num_threads);
    }

    fn num_rows(&self) -> usize {
        self.block_diagonal.num_rows()
    }

    fn num_cols(&self) -> usize {
        self.block_diagonal.num_rows()
    }
}

impl Preconditioner for BlockJacobiPreconditioner<'_> {
    fn update(&mut self, a: &BlockSparseMatrix, d: Option<&[f64]>) -> bool {
        let bs = a.block_structure();
        assert_eq!(
            bs.cols.len(),
            self.block_diagonal.num_blocks(),
            "preconditioner was built for a different column partition"
        );

        if self.num_threads > 1 && a.transpose_block_structure().is_some() {
            // Column-parallel assembly; a view without E blocks is all of A.
            PartitionedMatrixView::new(a, 0).update_block_diagonal_ftf(
                &mut self.block_diagonal,
                self.context,
                self.num_threads,
            );
        } else {
            self.block_diagonal.set_zero(self.context, self.num_threads);
            let values = a.values();
            for row in &bs.rows {
                for cell in &row.cells {
                    let col_size = bs.cols[cell.block_id].size;
                    let Some(CellHandle {
                        values: out,
                        row: r,
                        col: c,
                        col_stride,
                        ..
                    }) = self.block_diagonal.cell_mut(cell.block_id, cell.block_id)
                    else {
                        continue;
                    };
                    matrix_transpose_matrix_multiply(
                        &values[cell.position..],
                        row.block.size,
                        col_size,
                        &mut out[r * col_stride + c..],
                        col_stride,
                    );
                }
            }
        }

        if let Some(d) = d {
            self.block_diagonal.add_squared_diagonal(d);
        }
        self.block_diagonal.invert(self.context, self.num_threads);
        true
    }
}

#[derive(Debug, Clone)]
pub struct PowerSeriesOptions {
    /// Number of series terms after the leading `(FᵀF)⁻¹` term. Zero keeps
    /// only the leading term.
    pub max_num_iterations: usize,
    /// Stop once a term's norm falls below this fraction of the first term's.
    pub tolerance: f64,
}

impl Default for PowerSeriesOptions {
    fn default() -> Self {
        Self {
            max_num_iterations: 5,
            tolerance: 0.1,
        }
    }
}

impl PowerSeriesOptions {
    pub fn with_max_num_iterations(mut self, max_num_iterations: usize) -> Self {
        self.max_num_iterations = max_num_iterations;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }
}

/// Truncated Neumann series for the inverse of the Schur complement:
///
/// ```text
/// S⁻¹ ≈ Σₖ [(FᵀF)⁻¹ FᵀE (EᵀE)⁻¹ EᵀF]ᵏ (FᵀF)⁻¹
/// ```
///
/// Every term is one application of
/// [`ImplicitSchurComplement::inverse_power_series_operator_right_multiply_accumulate`]
/// to the previous term. The Schur complement must have been initialised
/// with `compute_ftf_inverse`.
#[derive(Debug)]
pub struct PowerSeriesPreconditioner<'s, 'a> {
    schur: &'s ImplicitSchurComplement<'a>,
    options: PowerSeriesOptions,
    context: &'a ExecutionContext,
    num_threads: usize,
    series_term: RefCell<Vec<f64>>,
    previous_series_term: RefCell<Vec<f64>>,
}

impl<'s, 'a> PowerSeriesPreconditioner<'s, 'a> {
    pub fn new(
        schur: &'s ImplicitSchurComplement<'a>,
        options: PowerSeriesOptions,
        context: &'a ExecutionContext,
        num_threads: usize,
    ) -> Self {
        let n = schur.num_cols_f();
        Self {
            schur,
            options,
            context,
            num_threads,
            series_term: RefCell::new(vec![0.0; n]),
            previous_series_term: RefCell::new(vec![0.0; n]),
        }
    }

    pub fn options(&self) -> &PowerSeriesOptions {
        &self.options
    }
}

impl LinearOperator for PowerSeriesPreconditioner<'_, '_> {
    fn right_multiply_and_accumulate(&self, x: &[f64], y: &mut [f64]) {
        let Some(ftf_inverse) = self.schur.block_diagonal_ftf_inverse() else {
            panic!("power series preconditioner requires compute_ftf_inverse");
        };
        let context = self.context;
        let num_threads = self.num_threads;
        let mut series_term = self.series_term.borrow_mut();
        let mut previous_series_term = self.previous_series_term.borrow_mut();

        parallel_set_zero(context, num_threads, &mut series_term);
        ftf_inverse.right_multiply_and_accumulate_par(x, &mut series_term, context, num_threads);
        for (yi, ti) in y.iter_mut().zip(series_term.iter()) {
            *yi += ti;
        }

        let norm_threshold = self.options.tolerance * norm(context, num_threads, &series_term);
        let mut num_terms = 1;
        for _ in 0..self.options.max_num_iterations {
            std::mem::swap(&mut *series_term, &mut *previous_series_term);
            parallel_set_zero(context, num_threads, &mut series_term);
            self.schur.inverse_power_series_operator_right_multiply_accumulate(
                &previous_series_term,
                &mut series_term,
            );
            for (yi, ti) in y.iter_mut().zip(series_term.iter()) {
                *yi += ti;
            }
            num_terms += 1;
            if norm(context, num_threads, &series_term) < norm_threshold {
                break;
            }
        }
        tracing::trace!("Power series preconditioner applied {} terms", num_terms);
    }

    fn num_rows(&self) -> usize {
        self.schur.num_cols_f()
    }

    fn num_cols(&self) -> usize {
        self.schur.num_cols_f()
    }
}

impl Preconditioner for PowerSeriesPreconditioner<'_, '_> {
    /// The series is built from the Schur complement, which refreshes its
    /// block inverses in `init`.
    fn update(&mut self, _a: &BlockSparseMatrix, _d: Option<&[f64]>) -> bool {
        true
    }
}
