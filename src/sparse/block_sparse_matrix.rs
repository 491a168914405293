//! Block-sparse matrix: a flat value buffer described by a compressed-row
//! block structure, optionally mirrored by a transposed structure.
//!
//! Each cell stores a dense `row_block.size x col_block.size` sub-matrix in
//! row-major order starting at `cell.position`. The transposed structure, when
//! present, addresses the very same buffer through the same cell positions.
//!
//! Multi-threaded products choose the structure that makes the output ranges
//! of the parallel chunks disjoint:
//! - `A x` partitions by block row, balanced by the running non-zero count.
//! - `Aᵀ x`, squared column norms and column scaling partition by block
//!   column and therefore walk the transposed structure. The access pattern
//!   is less linear, so the single-threaded variants keep using the primary
//!   structure.

use std::io::Write;
use std::ops::Range;

use faer::sparse::Triplet;
use nalgebra::DMatrix;
use rand::Rng;

use super::block_structure::{
    Block, Cell, CompressedRow, CompressedRowBlockStructure, compute_cumulative_nnz,
};
use super::compressed_row::CompressedRowSparseMatrix;
use crate::error::ApexResult;
use crate::linalg::LinearOperator;
use crate::linalg::small_dense::{matrix_transpose_vector_multiply, matrix_vector_multiply};
use crate::parallel::{
    ExecutionContext, group_by_chunks, parallel_for_with_cost, parallel_invoke, parallel_set_zero,
    partition_range_by_cost,
};

/// Parameters of [`BlockSparseMatrix::create_random_matrix`].
#[derive(Debug, Clone)]
pub struct RandomMatrixOptions {
    pub num_row_blocks: usize,
    pub min_row_block_size: usize,
    pub max_row_block_size: usize,
    pub num_col_blocks: usize,
    pub min_col_block_size: usize,
    pub max_col_block_size: usize,
    /// Probability that a given (row block, column block) cell is present.
    pub block_density: f64,
}

impl Default for RandomMatrixOptions {
    fn default() -> Self {
        Self {
            num_row_blocks: 10,
            min_row_block_size: 1,
            max_row_block_size: 3,
            num_col_blocks: 8,
            min_col_block_size: 1,
            max_col_block_size: 3,
            block_density: 0.3,
        }
    }
}

impl RandomMatrixOptions {
    pub fn with_row_blocks(mut self, num_blocks: usize, min_size: usize, max_size: usize) -> Self {
        self.num_row_blocks = num_blocks;
        self.min_row_block_size = min_size;
        self.max_row_block_size = max_size;
        self
    }

    pub fn with_col_blocks(mut self, num_blocks: usize, min_size: usize, max_size: usize) -> Self {
        self.num_col_blocks = num_blocks;
        self.min_col_block_size = min_size;
        self.max_col_block_size = max_size;
        self
    }

    pub fn with_block_density(mut self, block_density: f64) -> Self {
        self.block_density = block_density;
        self
    }
}

/// Block-sparse matrix owning its values and block structure.
#[derive(Debug, Clone)]
pub struct BlockSparseMatrix {
    num_rows: usize,
    num_cols: usize,
    num_nonzeros: usize,
    /// `values.len()` is the allocated capacity; only the first
    /// `num_nonzeros` entries are described by the structure.
    values: Vec<f64>,
    block_structure: CompressedRowBlockStructure,
    transpose_block_structure: Option<CompressedRowBlockStructure>,
}

impl BlockSparseMatrix {
    /// Zero-filled matrix with the given structure.
    pub fn new(block_structure: CompressedRowBlockStructure) -> Self {
        Self::with_options(block_structure, false)
    }

    /// Like [`BlockSparseMatrix::new`], optionally asking for the values to
    /// live in page-locked host memory for staging to an accelerator.
    ///
    /// # Panics
    ///
    /// This build has no accelerator backend, so requesting page-locked
    /// memory is a configuration error and aborts.
    pub fn with_options(
        mut block_structure: CompressedRowBlockStructure,
        use_page_locked_memory: bool,
    ) -> Self {
        if use_page_locked_memory {
            panic!(
                "Page-locked host memory was requested for a block-sparse matrix, \
                 but apex-block-sparse was built without accelerator support"
            );
        }
        block_structure.compute_row_nnz();
        let num_rows = block_structure.num_rows();
        let num_cols = block_structure.num_cols();
        let num_nonzeros = block_structure.num_nonzeros();
        let values = vec![0.0; block_structure.required_values().max(num_nonzeros)];
        tracing::trace!(
            "Allocated block-sparse matrix {num_rows}x{num_cols} with {num_nonzeros} non-zeros"
        );
        Self {
            num_rows,
            num_cols,
            num_nonzeros,
            values,
            block_structure,
            transpose_block_structure: None,
        }
    }

    /// Block-diagonal matrix whose `i`-th diagonal block is the diagonal
    /// matrix built from `diagonal[block.position..block.end()]`.
    pub fn create_diagonal_matrix(diagonal: &[f64], column_blocks: &[Block]) -> Self {
        let pattern: Vec<Vec<usize>> = (0..column_blocks.len()).map(|i| vec![i]).collect();
        let sizes: Vec<usize> = column_blocks.iter().map(|block| block.size).collect();
        let mut matrix = Self::new(CompressedRowBlockStructure::from_pattern(
            &sizes, &sizes, &pattern,
        ));
        for row in &matrix.block_structure.rows {
            let size = row.block.size;
            let cell = &row.cells[0];
            for j in 0..size {
                matrix.values[cell.position + j * size + j] = diagonal[row.block.position + j];
            }
        }
        matrix
    }

    /// Random matrix with uniformly distributed values in `[-1, 1)`. Every row
    /// block receives at least one cell.
    pub fn create_random_matrix<R: Rng>(options: &RandomMatrixOptions, rng: &mut R) -> Self {
        assert!(options.num_row_blocks > 0 && options.num_col_blocks > 0);
        assert!(options.block_density > 0.0 && options.block_density <= 1.0);

        let mut random_sizes = |count: usize, min: usize, max: usize| -> Vec<usize> {
            (0..count).map(|_| rng.random_range(min..=max)).collect()
        };
        let row_sizes = random_sizes(
            options.num_row_blocks,
            options.min_row_block_size,
            options.max_row_block_size,
        );
        let col_sizes = random_sizes(
            options.num_col_blocks,
            options.min_col_block_size,
            options.max_col_block_size,
        );

        let pattern: Vec<Vec<usize>> = (0..options.num_row_blocks)
            .map(|_| loop {
                let cols: Vec<usize> = (0..options.num_col_blocks)
                    .filter(|_| rng.random_bool(options.block_density))
                    .collect();
                if !cols.is_empty() {
                    break cols;
                }
            })
            .collect();

        let mut matrix = Self::new(CompressedRowBlockStructure::from_pattern(
            &row_sizes, &col_sizes, &pattern,
        ));
        for value in matrix.values_mut() {
            *value = rng.random_range(-1.0..1.0);
        }
        matrix
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_cols(&self) -> usize {
        self.num_cols
    }

    pub fn num_nonzeros(&self) -> usize {
        self.num_nonzeros
    }

    pub fn values(&self) -> &[f64] {
        &self.values[..self.num_nonzeros]
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values[..self.num_nonzeros]
    }

    pub fn block_structure(&self) -> &CompressedRowBlockStructure {
        &self.block_structure
    }

    pub fn transpose_block_structure(&self) -> Option<&CompressedRowBlockStructure> {
        self.transpose_block_structure.as_ref()
    }

    /// Build (or rebuild) the transposed structure used by the
    /// multi-threaded column-wise kernels.
    pub fn add_transpose_block_structure(&mut self) {
        self.transpose_block_structure = Some(self.block_structure.create_transpose());
    }

    pub fn set_zero(&mut self) {
        self.values.fill(0.0);
    }

    pub fn set_zero_par(&mut self, context: &ExecutionContext, num_threads: usize) {
        parallel_set_zero(context, num_threads, &mut self.values);
    }

    /// `y += A x`
    pub fn right_multiply_and_accumulate(&self, x: &[f64], y: &mut [f64]) {
        self.check_right_multiply_dims(x, y);
        let cols = &self.block_structure.cols;
        for row in &self.block_structure.rows {
            let y_row = &mut y[row.block.position..row.block.end()];
            for cell in &row.cells {
                let col = &cols[cell.block_id];
                matrix_vector_multiply(
                    &self.values[cell.position..],
                    row.block.size,
                    col.size,
                    &x[col.position..col.end()],
                    y_row,
                );
            }
        }
    }

    /// `y += A x`, partitioned by block row with chunks balanced by non-zeros.
    pub fn right_multiply_and_accumulate_par(
        &self,
        x: &[f64],
        y: &mut [f64],
        context: &ExecutionContext,
        num_threads: usize,
    ) {
        if num_threads <= 1 {
            return self.right_multiply_and_accumulate(x, y);
        }
        self.check_right_multiply_dims(x, y);

        let rows = &self.block_structure.rows;
        let cols = &self.block_structure.cols;
        parallel_for_rows(context, num_threads, rows, y, 0, |row_range, y_chunk, base| {
            for row in &rows[row_range] {
                let start = row.block.position - base;
                let y_row = &mut y_chunk[start..start + row.block.size];
                for cell in &row.cells {
                    let col = &cols[cell.block_id];
                    matrix_vector_multiply(
                        &self.values[cell.position..],
                        row.block.size,
                        col.size,
                        &x[col.position..col.end()],
                        y_row,
                    );
                }
            }
        });
    }

    /// `y += Aᵀ x`, walking the primary structure.
    pub fn left_multiply_and_accumulate(&self, x: &[f64], y: &mut [f64]) {
        self.check_left_multiply_dims(x, y);
        let cols = &self.block_structure.cols;
        for row in &self.block_structure.rows {
            let x_row = &x[row.block.position..row.block.end()];
            for cell in &row.cells {
                let col = &cols[cell.block_id];
                matrix_transpose_vector_multiply(
                    &self.values[cell.position..],
                    row.block.size,
                    col.size,
                    x_row,
                    &mut y[col.position..col.end()],
                );
            }
        }
    }

    /// `y += Aᵀ x`. With more than one thread and a transposed structure
    /// available, each chunk owns a range of block columns of `y`.
    pub fn left_multiply_and_accumulate_par(
        &self,
        x: &[f64],
        y: &mut [f64],
        context: &ExecutionContext,
        num_threads: usize,
    ) {
        let transpose = match self.transpose_block_structure.as_ref() {
            Some(transpose) if num_threads > 1 => transpose,
            _ => return self.left_multiply_and_accumulate(x, y),
        };
        self.check_left_multiply_dims(x, y);

        let transpose_rows = &transpose.rows;
        let transpose_cols = &transpose.cols;
        parallel_for_rows(context, num_threads, transpose_rows, y, 0, |col_range, y_chunk, base| {
            for col in &transpose_rows[col_range] {
                let start = col.block.position - base;
                let y_col = &mut y_chunk[start..start + col.block.size];
                for cell in &col.cells {
                    let row = &transpose_cols[cell.block_id];
                    matrix_transpose_vector_multiply(
                        &self.values[cell.position..],
                        row.size,
                        col.block.size,
                        &x[row.position..row.end()],
                        y_col,
                    );
                }
            }
        });
    }

    /// `x[j] = Σ_i A(i, j)²`
    pub fn squared_column_norm(&self, x: &mut [f64]) {
        assert_eq!(x.len(), self.num_cols, "squared_column_norm: wrong length");
        x.fill(0.0);
        let cols = &self.block_structure.cols;
        for row in &self.block_structure.rows {
            for cell in &row.cells {
                let col = &cols[cell.block_id];
                let cell_values =
                    &self.values[cell.position..cell.position + row.block.size * col.size];
                for (k, value) in cell_values.iter().enumerate() {
                    x[col.position + k % col.size] += value * value;
                }
            }
        }
    }

    pub fn squared_column_norm_par(
        &self,
        x: &mut [f64],
        context: &ExecutionContext,
        num_threads: usize,
    ) {
        let transpose = match self.transpose_block_structure.as_ref() {
            Some(transpose) if num_threads > 1 => transpose,
            _ => return self.squared_column_norm(x),
        };
        assert_eq!(x.len(), self.num_cols, "squared_column_norm: wrong length");

        let transpose_rows = &transpose.rows;
        let transpose_cols = &transpose.cols;
        parallel_for_rows(context, num_threads, transpose_rows, x, 0, |col_range, x_chunk, base| {
            x_chunk.fill(0.0);
            for col in &transpose_rows[col_range] {
                let start = col.block.position - base;
                for cell in &col.cells {
                    let row_size = transpose_cols[cell.block_id].size;
                    let cell_values =
                        &self.values[cell.position..cell.position + row_size * col.block.size];
                    for (k, value) in cell_values.iter().enumerate() {
                        x_chunk[start + k % col.block.size] += value * value;
                    }
                }
            }
        });
    }

    /// `A(:, j) *= scale[j]`
    pub fn scale_columns(&mut self, scale: &[f64]) {
        assert_eq!(scale.len(), self.num_cols, "scale_columns: wrong length");
        let cols = &self.block_structure.cols;
        for row in &self.block_structure.rows {
            for cell in &row.cells {
                let col = &cols[cell.block_id];
                let cell_values =
                    &mut self.values[cell.position..cell.position + row.block.size * col.size];
                for (k, value) in cell_values.iter_mut().enumerate() {
                    *value *= scale[col.position + k % col.size];
                }
            }
        }
    }

    /// Multi-threaded column scaling. Every chunk owns a range of block
    /// columns and therefore a disjoint set of cells.
    pub fn scale_columns_par(
        &mut self,
        scale: &[f64],
        context: &ExecutionContext,
        num_threads: usize,
    ) {
        if num_threads <= 1 || self.transpose_block_structure.is_none() {
            return self.scale_columns(scale);
        }
        let Self {
            values,
            block_structure,
            transpose_block_structure: Some(transpose),
            ..
        } = self
        else {
            return;
        };
        assert_eq!(scale.len(), block_structure.num_cols(), "scale_columns: wrong length");

        let cols = &block_structure.cols;
        let cells_by_col = cell_values_by_column(values.as_mut_slice(), block_structure);
        let transpose_rows = &transpose.rows;
        let boundaries = partition_range_by_cost(
            0,
            cols.len(),
            context.max_chunks(num_threads),
            |i| transpose_rows[i].cumulative_nnz,
        );
        let tasks = group_by_chunks(cells_by_col, &boundaries);

        parallel_invoke(context, tasks, |_, (col_range, cells_in_chunk)| {
            for (col_id, cells) in col_range.zip(cells_in_chunk) {
                let col = &cols[col_id];
                let col_scale = &scale[col.position..col.end()];
                for cell in cells {
                    for (k, value) in cell.iter_mut().enumerate() {
                        *value *= col_scale[k % col.size];
                    }
                }
            }
        });
    }

    /// Conventional compressed-row copy of `A`.
    ///
    /// Pass 1 derives the row offsets and column indices from the block
    /// structure alone; pass 2 copies the values block by block. The number
    /// of non-zeros per row is recomputed from the cell list, which keeps the
    /// conversion correct for producers whose cells are not laid out
    /// contiguously by value offset.
    pub fn to_compressed_row_sparse_matrix(&self) -> CompressedRowSparseMatrix {
        let bs = &self.block_structure;
        let mut rows = vec![0usize; self.num_rows + 1];
        for row in &bs.rows {
            let row_nnz: usize = row.cells.iter().map(|cell| bs.cols[cell.block_id].size).sum();
            for r in 0..row.block.size {
                rows[row.block.position + r + 1] = rows[row.block.position + r] + row_nnz;
            }
        }

        let nnz = rows[self.num_rows];
        let mut cols = vec![0usize; nnz];
        let mut values = vec![0.0; nnz];
        for row in &bs.rows {
            for r in 0..row.block.size {
                let mut index = rows[row.block.position + r];
                for cell in &row.cells {
                    let col = &bs.cols[cell.block_id];
                    let source = cell.position + r * col.size;
                    for c in 0..col.size {
                        cols[index] = col.position + c;
                        values[index] = self.values[source + c];
                        index += 1;
                    }
                }
            }
        }
        CompressedRowSparseMatrix::new(self.num_rows, self.num_cols, rows, cols, values)
    }

    /// Compressed-row copy of `Aᵀ`, driven by the transposed structure. The
    /// per-row non-zero count comes from the cached `nnz` of each transposed
    /// row. Builds a temporary transposed structure if none is attached.
    pub fn to_compressed_row_sparse_matrix_transpose(&self) -> CompressedRowSparseMatrix {
        let owned;
        let transpose = match self.transpose_block_structure.as_ref() {
            Some(transpose) => transpose,
            None => {
                owned = self.block_structure.create_transpose();
                &owned
            }
        };

        let mut rows = vec![0usize; self.num_cols + 1];
        for transpose_row in &transpose.rows {
            let size = transpose_row.block.size;
            let row_nnz = if size == 0 { 0 } else { transpose_row.nnz / size };
            for r in 0..size {
                rows[transpose_row.block.position + r + 1] =
                    rows[transpose_row.block.position + r] + row_nnz;
            }
        }

        let nnz = rows[self.num_cols];
        let mut cols = vec![0usize; nnz];
        let mut values = vec![0.0; nnz];
        for transpose_row in &transpose.rows {
            let size = transpose_row.block.size;
            for c in 0..size {
                let mut index = rows[transpose_row.block.position + c];
                for cell in &transpose_row.cells {
                    let original_row = &transpose.cols[cell.block_id];
                    for i in 0..original_row.size {
                        cols[index] = original_row.position + i;
                        values[index] = self.values[cell.position + i * size + c];
                        index += 1;
                    }
                }
            }
        }
        CompressedRowSparseMatrix::new(self.num_cols, self.num_rows, rows, cols, values)
    }

    /// Visit every stored scalar as `(row, col, value)`.
    fn for_each_entry(&self, mut visit: impl FnMut(usize, usize, f64)) {
        let cols = &self.block_structure.cols;
        for row in &self.block_structure.rows {
            for cell in &row.cells {
                let col = &cols[cell.block_id];
                for r in 0..row.block.size {
                    for c in 0..col.size {
                        visit(
                            row.block.position + r,
                            col.position + c,
                            self.values[cell.position + r * col.size + c],
                        );
                    }
                }
            }
        }
    }

    pub fn to_dense_matrix(&self) -> DMatrix<f64> {
        let mut dense = DMatrix::zeros(self.num_rows, self.num_cols);
        self.for_each_entry(|r, c, value| dense[(r, c)] += value);
        dense
    }

    pub fn to_triplets(&self) -> Vec<Triplet<usize, usize, f64>> {
        let mut triplets = Vec::with_capacity(self.num_nonzeros);
        self.for_each_entry(|r, c, value| triplets.push(Triplet::new(r, c, value)));
        triplets
    }

    /// Plain-text dump, one `row col value` line per stored scalar.
    pub fn write_text<W: Write>(&self, writer: &mut W) -> ApexResult<()> {
        let mut result = Ok(());
        self.for_each_entry(|r, c, value| {
            if result.is_ok() {
                result = writeln!(writer, "{r:>10} {c:>10} {value:>24.17e}");
            }
        });
        Ok(result?)
    }

    /// Append the row blocks of `m` below the existing ones.
    ///
    /// Both the primary and, if present, the transposed structure are
    /// extended, and the running non-zero counts of both are recomputed. The
    /// value buffer is reallocated only when the new values do not fit.
    ///
    /// # Panics
    ///
    /// If `m` does not have the same column partition as `self`.
    pub fn append_rows(&mut self, m: &BlockSparseMatrix) {
        assert_eq!(
            m.num_cols, self.num_cols,
            "append_rows: column count mismatch ({} vs {})",
            m.num_cols, self.num_cols
        );
        assert_eq!(
            m.block_structure.cols.len(),
            self.block_structure.cols.len(),
            "append_rows: column block count mismatch"
        );
        debug_assert_eq!(
            self.block_structure.required_values(),
            self.num_nonzeros,
            "append_rows requires densely packed values"
        );

        let required = self.num_nonzeros + m.num_nonzeros;
        if required > self.values.len() {
            let mut grown = vec![0.0; required];
            grown[..self.num_nonzeros].copy_from_slice(&self.values[..self.num_nonzeros]);
            tracing::trace!(
                "Growing block-sparse value buffer from {} to {} entries",
                self.values.len(),
                required
            );
            self.values = grown;
        }

        let old_num_row_blocks = self.block_structure.rows.len();
        for (i, m_row) in m.block_structure.rows.iter().enumerate() {
            let mut row = CompressedRow::new(Block::new(m_row.block.size, self.num_rows));
            for m_cell in &m_row.cells {
                let col_size = self.block_structure.cols[m_cell.block_id].size;
                let cell_nnz = row.block.size * col_size;
                let position = self.num_nonzeros;
                self.values[position..position + cell_nnz]
                    .copy_from_slice(&m.values[m_cell.position..m_cell.position + cell_nnz]);
                row.cells.push(Cell::new(m_cell.block_id, position));
                row.nnz += cell_nnz;
                if let Some(transpose) = self.transpose_block_structure.as_mut() {
                    let transpose_row = &mut transpose.rows[m_cell.block_id];
                    transpose_row
                        .cells
                        .push(Cell::new(old_num_row_blocks + i, position));
                    transpose_row.nnz += cell_nnz;
                }
                self.num_nonzeros += cell_nnz;
            }
            if let Some(transpose) = self.transpose_block_structure.as_mut() {
                transpose.cols.push(row.block);
            }
            self.num_rows += row.block.size;
            self.block_structure.rows.push(row);
        }

        if let Some(transpose) = self.transpose_block_structure.as_mut() {
            compute_cumulative_nnz(&mut transpose.rows);
        }
        compute_cumulative_nnz(&mut self.block_structure.rows);
    }

    /// Remove the last `delta_row_blocks` row blocks, keeping the transposed
    /// structure in sync. The value buffer keeps its capacity.
    pub fn delete_row_blocks(&mut self, delta_row_blocks: usize) {
        let num_row_blocks = self.block_structure.rows.len();
        assert!(
            delta_row_blocks <= num_row_blocks,
            "delete_row_blocks: cannot delete {delta_row_blocks} of {num_row_blocks} row blocks"
        );

        for row_block_id in (num_row_blocks - delta_row_blocks..num_row_blocks).rev() {
            let row = &self.block_structure.rows[row_block_id];
            for cell in &row.cells {
                let cell_nnz = row.block.size * self.block_structure.cols[cell.block_id].size;
                self.num_nonzeros -= cell_nnz;
                if let Some(transpose) = self.transpose_block_structure.as_mut() {
                    let transpose_row = &mut transpose.rows[cell.block_id];
                    let removed = transpose_row.cells.pop();
                    assert_eq!(
                        removed.map(|c| c.block_id),
                        Some(row_block_id),
                        "transposed structure out of sync with row block {row_block_id}"
                    );
                    transpose_row.nnz -= cell_nnz;
                }
            }
            self.num_rows -= row.block.size;
        }

        self.block_structure
            .rows
            .truncate(num_row_blocks - delta_row_blocks);
        if let Some(transpose) = self.transpose_block_structure.as_mut() {
            transpose.cols.truncate(num_row_blocks - delta_row_blocks);
            compute_cumulative_nnz(&mut transpose.rows);
        }
        compute_cumulative_nnz(&mut self.block_structure.rows);
    }

    fn check_right_multiply_dims(&self, x: &[f64], y: &[f64]) {
        debug_assert_eq!(x.len(), self.num_cols, "right multiply: x has wrong length");
        debug_assert_eq!(y.len(), self.num_rows, "right multiply: y has wrong length");
    }

    fn check_left_multiply_dims(&self, x: &[f64], y: &[f64]) {
        debug_assert_eq!(x.len(), self.num_rows, "left multiply: x has wrong length");
        debug_assert_eq!(y.len(), self.num_cols, "left multiply: y has wrong length");
    }
}

impl LinearOperator for BlockSparseMatrix {
    fn right_multiply_and_accumulate(&self, x: &[f64], y: &mut [f64]) {
        BlockSparseMatrix::right_multiply_and_accumulate(self, x, y);
    }

    fn right_multiply_and_accumulate_par(
        &self,
        x: &[f64],
        y: &mut [f64],
        context: &ExecutionContext,
        num_threads: usize,
    ) {
        BlockSparseMatrix::right_multiply_and_accumulate_par(self, x, y, context, num_threads);
    }

    fn num_rows(&self) -> usize {
        self.num_rows
    }

    fn num_cols(&self) -> usize {
        self.num_cols
    }
}

/// Run `function(row_range, y_chunk, base)` over chunks of `rows` balanced
/// by their non-zero counts. Each chunk owns the slice of `y` covering its
/// rows; `y[0]` corresponds to scalar position `y_base` and `base` is the
/// scalar position of `y_chunk[0]`.
pub(crate) fn parallel_for_rows<F>(
    context: &ExecutionContext,
    num_threads: usize,
    rows: &[CompressedRow],
    y: &mut [f64],
    y_base: usize,
    function: F,
) where
    F: Fn(Range<usize>, &mut [f64], usize) + Sync,
{
    let cost_before = rows.first().map_or(0, |row| row.cumulative_nnz - row.nnz);
    let end = rows.last().map_or(y_base, |row| row.block.end());
    let position = |i: usize| rows.get(i).map_or(end, |row| row.block.position);
    parallel_for_with_cost(
        context,
        0..rows.len(),
        num_threads,
        |i| rows[i].cumulative_nnz - cost_before,
        y,
        |i| position(i) - y_base,
        |row_range, y_chunk| {
            let base = position(row_range.start);
            function(row_range, y_chunk, base);
        },
    );
}

/// Split the value buffer into one mutable slice per cell, grouped by column
/// block (cells within a column keep their row order).
fn cell_values_by_column<'a>(
    values: &'a mut [f64],
    block_structure: &CompressedRowBlockStructure,
) -> Vec<Vec<&'a mut [f64]>> {
    let cells: Vec<(usize, usize, usize)> = block_structure
        .rows
        .iter()
        .flat_map(|row| {
            row.cells.iter().map(move |cell| {
                let len = row.block.size * block_structure.cols[cell.block_id].size;
                (cell.position, len, cell.block_id)
            })
        })
        .collect();
    let num_cells = cells.len();
    let mut order: Vec<usize> = (0..num_cells).collect();
    order.sort_by_key(|&i| cells[i].0);

    let mut slices: Vec<Option<&'a mut [f64]>> = (0..num_cells).map(|_| None).collect();
    let mut rest = values;
    let mut cursor = 0;
    for &i in &order {
        let (position, len, _) = cells[i];
        let (_, tail) = std::mem::take(&mut rest).split_at_mut(position - cursor);
        let (cell, tail) = tail.split_at_mut(len);
        slices[i] = Some(cell);
        rest = tail;
        cursor = position + len;
    }

    let mut by_column: Vec<Vec<&'a mut [f64]>> =
        (0..block_structure.cols.len()).map(|_| Vec::new()).collect();
    for (i, slice) in slices.into_iter().enumerate() {
        if let Some(slice) = slice {
            by_column[cells[i].2].push(slice);
        }
    }
    by_column
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse::block_structure::blocks_from_sizes;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn random_vector(rng: &mut StdRng, len: usize) -> Vec<f64> {
        (0..len).map(|_| rng.random_range(-1.0..1.0)).collect()
    }

    fn assert_close(a: &[f64], b: &[f64], tol: f64) {
        assert_eq!(a.len(), b.len());
        for (i, (x, y)) in a.iter().zip(b).enumerate() {
            assert!((x - y).abs() <= tol, "entry {i}: {x} vs {y}");
        }
    }

    fn random_matrix(seed: u64) -> BlockSparseMatrix {
        let mut rng = StdRng::seed_from_u64(seed);
        let options = RandomMatrixOptions::default()
            .with_row_blocks(40, 1, 4)
            .with_col_blocks(15, 1, 5)
            .with_block_density(0.25);
        BlockSparseMatrix::create_random_matrix(&options, &mut rng)
    }

    #[test]
    fn test_right_multiply_matches_dense() {
        let a = random_matrix(1);
        let mut rng = StdRng::seed_from_u64(2);
        let x = random_vector(&mut rng, a.num_cols());
        let mut y = random_vector(&mut rng, a.num_rows());

        let dense = a.to_dense_matrix();
        let expected = &dense * nalgebra::DVector::from_column_slice(&x)
            + nalgebra::DVector::from_column_slice(&y);
        a.right_multiply_and_accumulate(&x, &mut y);
        assert_close(&y, expected.as_slice(), 1e-12);
    }

    #[test]
    fn test_left_multiply_matches_dense() {
        let a = random_matrix(3);
        let mut rng = StdRng::seed_from_u64(4);
        let x = random_vector(&mut rng, a.num_rows());
        let mut y = vec![0.0; a.num_cols()];

        let expected = a.to_dense_matrix().transpose() * nalgebra::DVector::from_column_slice(&x);
        a.left_multiply_and_accumulate(&x, &mut y);
        assert_close(&y, expected.as_slice(), 1e-12);
    }

    #[test]
    fn test_parallel_products_match_serial() {
        let context = ExecutionContext::new(4).unwrap();
        let mut a = random_matrix(5);
        a.add_transpose_block_structure();
        let mut rng = StdRng::seed_from_u64(6);
        let x_cols = random_vector(&mut rng, a.num_cols());
        let x_rows = random_vector(&mut rng, a.num_rows());

        let mut serial_right = vec![0.0; a.num_rows()];
        a.right_multiply_and_accumulate(&x_cols, &mut serial_right);
        let mut serial_left = vec![0.0; a.num_cols()];
        a.left_multiply_and_accumulate(&x_rows, &mut serial_left);

        for threads in [1, 2, 3, 4, 8] {
            let mut right = vec![0.0; a.num_rows()];
            a.right_multiply_and_accumulate_par(&x_cols, &mut right, &context, threads);
            assert_close(&right, &serial_right, 1e-12);

            let mut left = vec![0.0; a.num_cols()];
            a.left_multiply_and_accumulate_par(&x_rows, &mut left, &context, threads);
            assert_close(&left, &serial_left, 1e-12);
        }
    }

    #[test]
    fn test_squared_column_norm_and_scale_columns() {
        let context = ExecutionContext::new(3).unwrap();
        let mut a = random_matrix(7);
        a.add_transpose_block_structure();
        let dense = a.to_dense_matrix();

        let expected: Vec<f64> = (0..a.num_cols())
            .map(|j| dense.column(j).iter().map(|v| v * v).sum())
            .collect();
        let mut norms = vec![1.0; a.num_cols()];
        a.squared_column_norm(&mut norms);
        assert_close(&norms, &expected, 1e-12);
        let mut norms_par = vec![1.0; a.num_cols()];
        a.squared_column_norm_par(&mut norms_par, &context, 3);
        assert_close(&norms_par, &expected, 1e-12);

        let scale: Vec<f64> = (0..a.num_cols()).map(|j| 1.0 + j as f64).collect();
        let mut b = a.clone();
        a.scale_columns(&scale);
        b.scale_columns_par(&scale, &context, 3);
        assert_close(a.values(), b.values(), 0.0);
        let scaled = a.to_dense_matrix();
        for j in 0..a.num_cols() {
            for i in 0..a.num_rows() {
                assert!((scaled[(i, j)] - dense[(i, j)] * scale[j]).abs() < 1e-12);
            }
        }

        b.set_zero_par(&context, 3);
        assert!(b.values().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_compressed_row_conversions() {
        let mut a = random_matrix(9);
        let dense = a.to_dense_matrix();

        let crs = a.to_compressed_row_sparse_matrix();
        assert_eq!(crs.num_nonzeros(), a.num_nonzeros());
        assert_eq!(crs.to_dense_matrix(), dense);

        let crs_t = a.to_compressed_row_sparse_matrix_transpose();
        assert_eq!(crs_t.to_dense_matrix(), dense.transpose());

        a.add_transpose_block_structure();
        let crs_t_cached = a.to_compressed_row_sparse_matrix_transpose();
        assert_eq!(crs_t_cached, crs_t);
    }

    #[test]
    fn test_empty_row_blocks_replicate_offsets() {
        let bs = CompressedRowBlockStructure::from_pattern(
            &[2, 1, 2],
            &[2, 1],
            &[vec![0], vec![], vec![0, 1]],
        );
        let mut a = BlockSparseMatrix::new(bs);
        for (i, v) in a.values_mut().iter_mut().enumerate() {
            *v = i as f64 + 1.0;
        }
        let crs = a.to_compressed_row_sparse_matrix();
        assert_eq!(crs.rows(), &[0, 2, 4, 4, 7, 10]);
        assert_eq!(crs.to_dense_matrix(), a.to_dense_matrix());
    }

    #[test]
    fn test_triplets_and_text_dump() {
        let a = BlockSparseMatrix::create_diagonal_matrix(
            &[1.0, 2.0, 3.0],
            &blocks_from_sizes(&[2, 1]),
        );
        let dense = a.to_dense_matrix();
        let diagonal = nalgebra::DVector::from_vec(vec![1.0, 2.0, 3.0]);
        assert_eq!(dense, DMatrix::from_diagonal(&diagonal));

        let triplets = a.to_triplets();
        assert_eq!(triplets.len(), 5);
        assert!(triplets.iter().any(|t| t.row == 1 && t.col == 1 && t.val == 2.0));

        let mut text = Vec::new();
        a.write_text(&mut text).unwrap();
        let text = String::from_utf8(text).unwrap();
        assert_eq!(text.lines().count(), 5);
        let last: Vec<&str> = text.lines().last().unwrap().split_whitespace().collect();
        assert_eq!(last[0], "2");
        assert_eq!(last[1], "2");
        assert_eq!(last[2].parse::<f64>().unwrap(), 3.0);
    }

    #[test]
    #[should_panic(expected = "Page-locked host memory")]
    fn test_page_locked_memory_is_fatal() {
        let bs = CompressedRowBlockStructure::from_pattern(&[1], &[1], &[vec![0]]);
        let _ = BlockSparseMatrix::with_options(bs, true);
    }

    #[test]
    #[should_panic(expected = "column block count mismatch")]
    fn test_append_rows_rejects_different_column_partition() {
        let mut a = BlockSparseMatrix::new(CompressedRowBlockStructure::from_pattern(
            &[1],
            &[2],
            &[vec![0]],
        ));
        let b = BlockSparseMatrix::new(CompressedRowBlockStructure::from_pattern(
            &[1],
            &[1, 1],
            &[vec![0]],
        ));
        a.append_rows(&b);
    }
}
