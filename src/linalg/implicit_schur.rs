//! # Implicit Schur complement
//!
//! For a least-squares system with Jacobian `A = [E | F]`, damping
//! `D = [De | Df]` and right-hand side `b`, eliminating the `E` unknowns
//! leaves the reduced system `S x = r` with
//!
//! ```text
//! S = FᵀF + Df² - FᵀE (EᵀE + De²)⁻¹ EᵀF
//! r = Fᵀ (b - E (EᵀE + De²)⁻¹ Eᵀ b)
//! ```
//!
//! `S` is never formed. Each product `S x` is a chain of sparse products with
//! `E`, `F` and the block diagonal inverse of `EᵀE + De²`, which is exact
//! because every row block touches at most one `E` column block.
//!
//! After the reduced system is solved, [`ImplicitSchurComplement::back_substitute`]
//! recovers the eliminated unknowns.

use std::cell::RefCell;

use super::LinearOperator;
use crate::parallel::{ExecutionContext, axpby, parallel_assign, parallel_set_zero};
use crate::sparse::{BlockRandomAccessDiagonalMatrix, BlockSparseMatrix, PartitionedMatrixView};

#[derive(Debug, Clone)]
pub struct ImplicitSchurOptions {
    /// Number of leading column blocks forming `E`.
    pub num_eliminate_blocks: usize,
    /// Also keep the block diagonal inverse of `FᵀF + Df²`, needed by the
    /// Jacobi and power series preconditioners.
    pub compute_ftf_inverse: bool,
    pub num_threads: usize,
}

impl Default for ImplicitSchurOptions {
    fn default() -> Self {
        Self {
            num_eliminate_blocks: 0,
            compute_ftf_inverse: false,
            num_threads: 1,
        }
    }
}

impl ImplicitSchurOptions {
    pub fn with_num_eliminate_blocks(mut self, num_eliminate_blocks: usize) -> Self {
        self.num_eliminate_blocks = num_eliminate_blocks;
        self
    }

    pub fn with_compute_ftf_inverse(mut self, compute_ftf_inverse: bool) -> Self {
        self.compute_ftf_inverse = compute_ftf_inverse;
        self
    }

    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }
}

/// Allocations owned by the Schur complement that survive re-initialisation.
/// A solver can keep them between solves with
/// [`ImplicitSchurComplement::into_buffers`] and
/// [`ImplicitSchurComplement::with_buffers`].
#[derive(Debug, Clone, Default)]
pub struct SchurBuffers {
    block_diagonal_ete_inverse: Option<BlockRandomAccessDiagonalMatrix>,
    block_diagonal_ftf_inverse: Option<BlockRandomAccessDiagonalMatrix>,
    rhs: Vec<f64>,
    workspace: SchurWorkspace,
}

#[derive(Debug, Clone, Default)]
struct SchurWorkspace {
    tmp_rows: Vec<f64>,
    tmp_e_cols: Vec<f64>,
    tmp_e_cols_2: Vec<f64>,
    tmp_f_cols: Vec<f64>,
}

impl SchurWorkspace {
    fn resize(&mut self, num_rows: usize, num_cols_e: usize, num_cols_f: usize) {
        self.tmp_rows.resize(num_rows, 0.0);
        self.tmp_e_cols.resize(num_cols_e, 0.0);
        self.tmp_e_cols_2.resize(num_cols_e, 0.0);
        self.tmp_f_cols.resize(num_cols_f, 0.0);
    }
}

/// The problem an initialised Schur complement refers to.
#[derive(Debug, Clone, Copy)]
struct SchurProblem<'a> {
    view: PartitionedMatrixView<'a>,
    damping: Option<&'a [f64]>,
    b: &'a [f64],
}

/// Matrix-free Schur complement operator `S`.
///
/// Created uninitialised; [`ImplicitSchurComplement::init`] binds it to a
/// matrix, damping and right-hand side and may be called again for a new
/// problem. Block diagonal structures and workspaces are reused when the
/// new problem has the same shape.
#[derive(Debug)]
pub struct ImplicitSchurComplement<'a> {
    options: ImplicitSchurOptions,
    context: &'a ExecutionContext,
    problem: Option<SchurProblem<'a>>,
    block_diagonal_ete_inverse: Option<BlockRandomAccessDiagonalMatrix>,
    block_diagonal_ftf_inverse: Option<BlockRandomAccessDiagonalMatrix>,
    rhs: Vec<f64>,
    // Products take &self, so the workspace needs interior mutability.
    workspace: RefCell<SchurWorkspace>,
}

impl<'a> ImplicitSchurComplement<'a> {
    pub fn new(options: ImplicitSchurOptions, context: &'a ExecutionContext) -> Self {
        Self::with_buffers(options, context, SchurBuffers::default())
    }

    pub fn with_buffers(
        options: ImplicitSchurOptions,
        context: &'a ExecutionContext,
        buffers: SchurBuffers,
    ) -> Self {
        Self {
            options,
            context,
            problem: None,
            block_diagonal_ete_inverse: buffers.block_diagonal_ete_inverse,
            block_diagonal_ftf_inverse: buffers.block_diagonal_ftf_inverse,
            rhs: buffers.rhs,
            workspace: RefCell::new(buffers.workspace),
        }
    }

    /// Release the reusable allocations.
    pub fn into_buffers(self) -> SchurBuffers {
        SchurBuffers {
            block_diagonal_ete_inverse: self.block_diagonal_ete_inverse,
            block_diagonal_ftf_inverse: self.block_diagonal_ftf_inverse,
            rhs: self.rhs,
            workspace: self.workspace.into_inner(),
        }
    }

    pub fn options(&self) -> &ImplicitSchurOptions {
        &self.options
    }

    /// Bind to `A`, optional damping `D` (one entry per column of `A`) and
    /// `b`, then compute the block diagonal inverses and the reduced
    /// right-hand side.
    ///
    /// # Panics
    ///
    /// If `b` or `D` do not match the dimensions of `A`, or if `A` does not
    /// have the `[E | F]` layout for `num_eliminate_blocks`.
    pub fn init(&mut self, a: &'a BlockSparseMatrix, damping: Option<&'a [f64]>, b: &'a [f64]) {
        assert_eq!(b.len(), a.num_rows(), "rhs has {} entries for {} rows", b.len(), a.num_rows());
        if let Some(d) = damping {
            assert_eq!(
                d.len(),
                a.num_cols(),
                "damping has {} entries for {} columns",
                d.len(),
                a.num_cols()
            );
        }

        let view = PartitionedMatrixView::new(a, self.options.num_eliminate_blocks);
        let context = self.context;
        let num_threads = self.options.num_threads;
        let num_cols_e = view.num_cols_e();

        let ete_sizes: Vec<usize> = a.block_structure().cols[..view.num_col_blocks_e()]
            .iter()
            .map(|col| col.size)
            .collect();
        if let Some(ete) = self
            .block_diagonal_ete_inverse
            .as_mut()
            .filter(|ete| block_sizes_match(ete, &ete_sizes))
        {
            view.update_block_diagonal_ete(ete, context, num_threads);
        } else {
            self.block_diagonal_ete_inverse =
                Some(view.create_block_diagonal_ete(context, num_threads));
        }
        if let Some(ete) = self.block_diagonal_ete_inverse.as_mut() {
            add_diagonal_and_invert(damping.map(|d| &d[..num_cols_e]), ete, context, num_threads);
        }

        if self.options.compute_ftf_inverse {
            let ftf_sizes: Vec<usize> = a.block_structure().cols[view.num_col_blocks_e()..]
                .iter()
                .map(|col| col.size)
                .collect();
            if let Some(ftf) = self
                .block_diagonal_ftf_inverse
                .as_mut()
                .filter(|ftf| block_sizes_match(ftf, &ftf_sizes))
            {
                view.update_block_diagonal_ftf(ftf, context, num_threads);
            } else {
                self.block_diagonal_ftf_inverse =
                    Some(view.create_block_diagonal_ftf(context, num_threads));
            }
            if let Some(ftf) = self.block_diagonal_ftf_inverse.as_mut() {
                add_diagonal_and_invert(
                    damping.map(|d| &d[num_cols_e..]),
                    ftf,
                    context,
                    num_threads,
                );
            }
        } else {
            self.block_diagonal_ftf_inverse = None;
        }

        self.workspace
            .get_mut()
            .resize(view.num_rows(), num_cols_e, view.num_cols_f());
        self.rhs.resize(view.num_cols_f(), 0.0);
        self.problem = Some(SchurProblem { view, damping, b });
        self.update_rhs();

        tracing::debug!(
            "Initialized implicit Schur complement: {} rows, {} eliminated and {} reduced columns",
            view.num_rows(),
            num_cols_e,
            view.num_cols_f()
        );
    }

    fn problem(&self) -> &SchurProblem<'a> {
        let Some(problem) = self.problem.as_ref() else {
            panic!("implicit Schur complement used before init");
        };
        problem
    }

    fn ete_inverse(&self) -> &BlockRandomAccessDiagonalMatrix {
        let Some(ete_inverse) = self.block_diagonal_ete_inverse.as_ref() else {
            panic!("implicit Schur complement used before init");
        };
        ete_inverse
    }

    /// Block diagonal inverse of `EᵀE + De²`.
    pub fn block_diagonal_ete_inverse(&self) -> Option<&BlockRandomAccessDiagonalMatrix> {
        self.block_diagonal_ete_inverse.as_ref()
    }

    /// Block diagonal inverse of `FᵀF + Df²`, present when
    /// `compute_ftf_inverse` is set.
    pub fn block_diagonal_ftf_inverse(&self) -> Option<&BlockRandomAccessDiagonalMatrix> {
        self.block_diagonal_ftf_inverse.as_ref()
    }

    /// Right-hand side of the reduced system.
    pub fn rhs(&self) -> &[f64] {
        &self.rhs
    }

    pub fn num_cols_e(&self) -> usize {
        self.problem().view.num_cols_e()
    }

    pub fn num_cols_f(&self) -> usize {
        self.problem().view.num_cols_f()
    }

    /// `y += S x`
    pub fn right_multiply_and_accumulate(&self, x: &[f64], y: &mut [f64]) {
        let SchurProblem { view, damping, .. } = *self.problem();
        let context = self.context;
        let num_threads = self.options.num_threads;
        debug_assert_eq!(x.len(), view.num_cols_f());
        debug_assert_eq!(y.len(), view.num_cols_f());

        let mut workspace = self.workspace.borrow_mut();
        let SchurWorkspace {
            tmp_rows,
            tmp_e_cols,
            tmp_e_cols_2,
            ..
        } = &mut *workspace;

        // Step 1: tmp_rows = F x
        parallel_set_zero(context, num_threads, tmp_rows);
        view.right_multiply_and_accumulate_f_par(x, tmp_rows, context, num_threads);

        // Step 2: tmp_e_cols = Eᵀ F x
        parallel_set_zero(context, num_threads, tmp_e_cols);
        view.left_multiply_and_accumulate_e_par(tmp_rows, tmp_e_cols, context, num_threads);

        // Step 3: tmp_e_cols_2 = -(EᵀE)⁻¹ Eᵀ F x
        parallel_set_zero(context, num_threads, tmp_e_cols_2);
        self.ete_inverse()
            .right_multiply_and_accumulate_par(tmp_e_cols, tmp_e_cols_2, context, num_threads);
        tmp_e_cols_2.iter_mut().for_each(|v| *v = -*v);

        // Step 4: tmp_rows = (I - E (EᵀE)⁻¹ Eᵀ) F x
        view.right_multiply_and_accumulate_e_par(tmp_e_cols_2, tmp_rows, context, num_threads);

        // Step 5: y += Df² x + Fᵀ tmp_rows
        if let Some(d) = damping {
            let df = &d[view.num_cols_e()..];
            for ((yi, xi), di) in y.iter_mut().zip(x).zip(df) {
                *yi += di * di * xi;
            }
        }
        view.left_multiply_and_accumulate_f_par(tmp_rows, y, context, num_threads);
    }

    /// `y += (FᵀF)⁻¹ FᵀE (EᵀE)⁻¹ EᵀF x`, one term of the power series
    /// `S⁻¹ = Σₖ [(FᵀF)⁻¹ FᵀE (EᵀE)⁻¹ EᵀF]ᵏ (FᵀF)⁻¹`.
    ///
    /// # Panics
    ///
    /// If the operator was initialised without `compute_ftf_inverse`.
    pub fn inverse_power_series_operator_right_multiply_accumulate(
        &self,
        x: &[f64],
        y: &mut [f64],
    ) {
        let Some(ftf_inverse) = self.block_diagonal_ftf_inverse.as_ref() else {
            panic!("power series operator requires compute_ftf_inverse");
        };
        let view = self.problem().view;
        let context = self.context;
        let num_threads = self.options.num_threads;
        debug_assert_eq!(x.len(), view.num_cols_f());
        debug_assert_eq!(y.len(), view.num_cols_f());

        let mut workspace = self.workspace.borrow_mut();
        let SchurWorkspace {
            tmp_rows,
            tmp_e_cols,
            tmp_e_cols_2,
            tmp_f_cols,
        } = &mut *workspace;

        // Step 1: tmp_rows = F x
        parallel_set_zero(context, num_threads, tmp_rows);
        view.right_multiply_and_accumulate_f_par(x, tmp_rows, context, num_threads);

        // Step 2: tmp_e_cols = Eᵀ F x
        parallel_set_zero(context, num_threads, tmp_e_cols);
        view.left_multiply_and_accumulate_e_par(tmp_rows, tmp_e_cols, context, num_threads);

        // Step 3: tmp_e_cols_2 = (EᵀE)⁻¹ Eᵀ F x
        parallel_set_zero(context, num_threads, tmp_e_cols_2);
        self.ete_inverse()
            .right_multiply_and_accumulate_par(tmp_e_cols, tmp_e_cols_2, context, num_threads);

        // Step 4: tmp_rows = E (EᵀE)⁻¹ Eᵀ F x
        parallel_set_zero(context, num_threads, tmp_rows);
        view.right_multiply_and_accumulate_e_par(tmp_e_cols_2, tmp_rows, context, num_threads);

        // Step 5: tmp_f_cols = Fᵀ E (EᵀE)⁻¹ Eᵀ F x
        parallel_set_zero(context, num_threads, tmp_f_cols);
        view.left_multiply_and_accumulate_f_par(tmp_rows, tmp_f_cols, context, num_threads);

        // Step 6: y += (FᵀF)⁻¹ tmp_f_cols
        ftf_inverse.right_multiply_and_accumulate_par(tmp_f_cols, y, context, num_threads);
    }

    /// Full solution `y = [y_E, x]` from the reduced solution `x`, with
    /// `y_E = (EᵀE + De²)⁻¹ Eᵀ (b - F x)`.
    pub fn back_substitute(&self, x: &[f64], y: &mut [f64]) {
        let SchurProblem { view, b, .. } = *self.problem();
        let context = self.context;
        let num_threads = self.options.num_threads;
        let num_cols_e = view.num_cols_e();
        assert_eq!(x.len(), view.num_cols_f(), "reduced solution has wrong length");
        assert_eq!(y.len(), num_cols_e + view.num_cols_f(), "solution has wrong length");

        let mut workspace = self.workspace.borrow_mut();
        let SchurWorkspace {
            tmp_rows,
            tmp_e_cols,
            ..
        } = &mut *workspace;

        // Step 1: tmp_rows = b - F x
        parallel_set_zero(context, num_threads, tmp_rows);
        view.right_multiply_and_accumulate_f_par(x, tmp_rows, context, num_threads);
        axpby(context, num_threads, 1.0, b, -1.0, tmp_rows);

        // Step 2: tmp_e_cols = Eᵀ (b - F x)
        parallel_set_zero(context, num_threads, tmp_e_cols);
        view.left_multiply_and_accumulate_e_par(tmp_rows, tmp_e_cols, context, num_threads);

        // Step 3: y_E = (EᵀE)⁻¹ tmp_e_cols, y_F = x
        let (y_e, y_f) = y.split_at_mut(num_cols_e);
        parallel_set_zero(context, num_threads, y_e);
        self.ete_inverse()
            .right_multiply_and_accumulate_par(tmp_e_cols, y_e, context, num_threads);
        parallel_assign(context, num_threads, y_f, x);
    }

    /// Recompute the reduced right-hand side
    /// `r = Fᵀ (b - E (EᵀE + De²)⁻¹ Eᵀ b)`.
    pub fn update_rhs(&mut self) {
        let SchurProblem { view, b, .. } = *self.problem();
        let context = self.context;
        let num_threads = self.options.num_threads;
        let Self {
            rhs,
            workspace,
            block_diagonal_ete_inverse,
            ..
        } = self;
        let Some(ete_inverse) = block_diagonal_ete_inverse.as_ref() else {
            return;
        };
        let SchurWorkspace {
            tmp_rows,
            tmp_e_cols,
            tmp_e_cols_2,
            ..
        } = workspace.get_mut();

        // Step 1: tmp_e_cols = Eᵀ b
        parallel_set_zero(context, num_threads, tmp_e_cols);
        view.left_multiply_and_accumulate_e_par(b, tmp_e_cols, context, num_threads);

        // Step 2: tmp_e_cols_2 = (EᵀE)⁻¹ Eᵀ b
        parallel_set_zero(context, num_threads, tmp_e_cols_2);
        ete_inverse.right_multiply_and_accumulate_par(
            tmp_e_cols,
            tmp_e_cols_2,
            context,
            num_threads,
        );

        // Step 3: tmp_rows = b - E (EᵀE)⁻¹ Eᵀ b
        parallel_set_zero(context, num_threads, tmp_rows);
        view.right_multiply_and_accumulate_e_par(tmp_e_cols_2, tmp_rows, context, num_threads);
        axpby(context, num_threads, 1.0, b, -1.0, tmp_rows);

        // Step 4: rhs = Fᵀ tmp_rows
        parallel_set_zero(context, num_threads, rhs);
        view.left_multiply_and_accumulate_f_par(tmp_rows, rhs, context, num_threads);
    }
}

impl LinearOperator for ImplicitSchurComplement<'_> {
    fn right_multiply_and_accumulate(&self, x: &[f64], y: &mut [f64]) {
        ImplicitSchurComplement::right_multiply_and_accumulate(self, x, y);
    }

    fn num_rows(&self) -> usize {
        self.num_cols_f()
    }

    fn num_cols(&self) -> usize {
        self.num_cols_f()
    }
}

fn block_sizes_match(matrix: &BlockRandomAccessDiagonalMatrix, sizes: &[usize]) -> bool {
    matrix.num_blocks() == sizes.len()
        && matrix
            .blocks()
            .iter()
            .zip(sizes)
            .all(|(block, &size)| block.size == size)
}

/// Add `d²` to the diagonal (when damping is present) and invert every block.
fn add_diagonal_and_invert(
    d: Option<&[f64]>,
    matrix: &mut BlockRandomAccessDiagonalMatrix,
    context: &ExecutionContext,
    num_threads: usize,
) {
    if let Some(d) = d {
        matrix.add_squared_diagonal(d);
    }
    matrix.invert(context, num_threads);
}
