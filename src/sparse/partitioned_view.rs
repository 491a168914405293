//! Column-partitioned view `A = [E | F]` of a block-sparse matrix.
//!
//! The first `num_col_blocks_e` column blocks form `E`, the rest form `F`.
//! Row blocks that contain an `E` cell come first, and each of them holds
//! exactly one `E` cell, stored as its first cell. This is the layout a
//! bundle-adjustment style problem produces when points are eliminated.
//!
//! Vectors over the columns of `E` have length `num_cols_e`; vectors over the
//! columns of `F` have length `num_cols_f` and start at scalar column
//! `num_cols_e` of `A`.

use super::block_sparse_matrix::{BlockSparseMatrix, parallel_for_rows};
use super::block_structure::CompressedRow;
use super::random_access::BlockRandomAccessDiagonalMatrix;
use crate::linalg::small_dense::{
    matrix_transpose_matrix_multiply, matrix_transpose_vector_multiply, matrix_vector_multiply,
};
use crate::parallel::{ExecutionContext, group_by_chunks, parallel_invoke, partition_range_by_cost};

#[derive(Debug, Clone, Copy)]
pub struct PartitionedMatrixView<'a> {
    matrix: &'a BlockSparseMatrix,
    num_row_blocks_e: usize,
    num_col_blocks_e: usize,
    num_col_blocks_f: usize,
    num_cols_e: usize,
    num_cols_f: usize,
}

impl<'a> PartitionedMatrixView<'a> {
    /// # Panics
    ///
    /// If `num_col_blocks_e` exceeds the number of column blocks, or if an
    /// `E` cell appears anywhere other than as the first cell of one of the
    /// leading row blocks.
    pub fn new(matrix: &'a BlockSparseMatrix, num_col_blocks_e: usize) -> Self {
        let bs = matrix.block_structure();
        assert!(
            num_col_blocks_e <= bs.cols.len(),
            "num_col_blocks_e = {num_col_blocks_e} exceeds {} column blocks",
            bs.cols.len()
        );

        let num_row_blocks_e = bs
            .rows
            .iter()
            .take_while(|row| {
                row.cells
                    .first()
                    .is_some_and(|cell| cell.block_id < num_col_blocks_e)
            })
            .count();
        for (i, row) in bs.rows.iter().enumerate() {
            let first_f = usize::from(i < num_row_blocks_e);
            assert!(
                row.cells[first_f..]
                    .iter()
                    .all(|cell| cell.block_id >= num_col_blocks_e),
                "row block {i} has an E cell out of place"
            );
        }

        let num_cols_e = bs
            .cols
            .get(num_col_blocks_e)
            .map_or(matrix.num_cols(), |col| col.position);
        Self {
            matrix,
            num_row_blocks_e,
            num_col_blocks_e,
            num_col_blocks_f: bs.cols.len() - num_col_blocks_e,
            num_cols_e,
            num_cols_f: matrix.num_cols() - num_cols_e,
        }
    }

    pub fn matrix(&self) -> &'a BlockSparseMatrix {
        self.matrix
    }

    pub fn num_row_blocks_e(&self) -> usize {
        self.num_row_blocks_e
    }

    pub fn num_col_blocks_e(&self) -> usize {
        self.num_col_blocks_e
    }

    pub fn num_col_blocks_f(&self) -> usize {
        self.num_col_blocks_f
    }

    pub fn num_cols_e(&self) -> usize {
        self.num_cols_e
    }

    pub fn num_cols_f(&self) -> usize {
        self.num_cols_f
    }

    pub fn num_rows(&self) -> usize {
        self.matrix.num_rows()
    }

    fn rows(&self) -> &'a [CompressedRow] {
        &self.matrix.block_structure().rows
    }

    fn values(&self) -> &'a [f64] {
        self.matrix.values()
    }

    /// Column blocks of `E` followed by the column blocks of `F`, as
    /// `(E transposed rows, F transposed rows)`. `None` without a transposed
    /// structure.
    fn transpose_rows(&self) -> Option<(&'a [CompressedRow], &'a [CompressedRow])> {
        self.matrix
            .transpose_block_structure()
            .map(|transpose| transpose.rows.split_at(self.num_col_blocks_e))
    }

    /// `y += E x`
    pub fn right_multiply_and_accumulate_e(&self, x: &[f64], y: &mut [f64]) {
        debug_assert_eq!(x.len(), self.num_cols_e);
        debug_assert_eq!(y.len(), self.num_rows());
        for row in &self.rows()[..self.num_row_blocks_e] {
            self.multiply_row_e(row, x, &mut y[row.block.position..row.block.end()]);
        }
    }

    pub fn right_multiply_and_accumulate_e_par(
        &self,
        x: &[f64],
        y: &mut [f64],
        context: &ExecutionContext,
        num_threads: usize,
    ) {
        if num_threads <= 1 {
            return self.right_multiply_and_accumulate_e(x, y);
        }
        debug_assert_eq!(x.len(), self.num_cols_e);
        debug_assert_eq!(y.len(), self.num_rows());
        let rows = &self.rows()[..self.num_row_blocks_e];
        parallel_for_rows(context, num_threads, rows, y, 0, |range, y_chunk, base| {
            for row in &rows[range] {
                let start = row.block.position - base;
                self.multiply_row_e(row, x, &mut y_chunk[start..start + row.block.size]);
            }
        });
    }

    fn multiply_row_e(&self, row: &CompressedRow, x: &[f64], y_row: &mut [f64]) {
        let cell = &row.cells[0];
        let col = &self.matrix.block_structure().cols[cell.block_id];
        matrix_vector_multiply(
            &self.values()[cell.position..],
            row.block.size,
            col.size,
            &x[col.position..col.end()],
            y_row,
        );
    }

    /// `y += F x`
    pub fn right_multiply_and_accumulate_f(&self, x: &[f64], y: &mut [f64]) {
        debug_assert_eq!(x.len(), self.num_cols_f);
        debug_assert_eq!(y.len(), self.num_rows());
        for (i, row) in self.rows().iter().enumerate() {
            let y_row = &mut y[row.block.position..row.block.end()];
            self.multiply_row_f(i, row, x, y_row);
        }
    }

    pub fn right_multiply_and_accumulate_f_par(
        &self,
        x: &[f64],
        y: &mut [f64],
        context: &ExecutionContext,
        num_threads: usize,
    ) {
        if num_threads <= 1 {
            return self.right_multiply_and_accumulate_f(x, y);
        }
        debug_assert_eq!(x.len(), self.num_cols_f);
        debug_assert_eq!(y.len(), self.num_rows());
        let rows = self.rows();
        parallel_for_rows(context, num_threads, rows, y, 0, |range, y_chunk, base| {
            for i in range {
                let row = &rows[i];
                let start = row.block.position - base;
                self.multiply_row_f(i, row, x, &mut y_chunk[start..start + row.block.size]);
            }
        });
    }

    fn multiply_row_f(
        &self,
        row_block_id: usize,
        row: &CompressedRow,
        x: &[f64],
        y_row: &mut [f64],
    ) {
        let cols = &self.matrix.block_structure().cols;
        let first_f = usize::from(row_block_id < self.num_row_blocks_e);
        for cell in &row.cells[first_f..] {
            let col = &cols[cell.block_id];
            let x_start = col.position - self.num_cols_e;
            matrix_vector_multiply(
                &self.values()[cell.position..],
                row.block.size,
                col.size,
                &x[x_start..x_start + col.size],
                y_row,
            );
        }
    }

    /// `y += Eᵀ x`
    pub fn left_multiply_and_accumulate_e(&self, x: &[f64], y: &mut [f64]) {
        debug_assert_eq!(x.len(), self.num_rows());
        debug_assert_eq!(y.len(), self.num_cols_e);
        let cols = &self.matrix.block_structure().cols;
        for row in &self.rows()[..self.num_row_blocks_e] {
            let cell = &row.cells[0];
            let col = &cols[cell.block_id];
            matrix_transpose_vector_multiply(
                &self.values()[cell.position..],
                row.block.size,
                col.size,
                &x[row.block.position..row.block.end()],
                &mut y[col.position..col.end()],
            );
        }
    }

    /// `y += Eᵀ x`, one chunk per range of `E` column blocks. Falls back to
    /// the primary structure without a transposed structure.
    pub fn left_multiply_and_accumulate_e_par(
        &self,
        x: &[f64],
        y: &mut [f64],
        context: &ExecutionContext,
        num_threads: usize,
    ) {
        let e_rows = match self.transpose_rows() {
            Some((e_rows, _)) if num_threads > 1 => e_rows,
            _ => return self.left_multiply_and_accumulate_e(x, y),
        };
        debug_assert_eq!(x.len(), self.num_rows());
        debug_assert_eq!(y.len(), self.num_cols_e);
        parallel_for_rows(context, num_threads, e_rows, y, 0, |range, y_chunk, base| {
            self.left_multiply_transposed_rows(&e_rows[range], x, y_chunk, base);
        });
    }

    /// `y += Fᵀ x`
    pub fn left_multiply_and_accumulate_f(&self, x: &[f64], y: &mut [f64]) {
        debug_assert_eq!(x.len(), self.num_rows());
        debug_assert_eq!(y.len(), self.num_cols_f);
        let cols = &self.matrix.block_structure().cols;
        for (i, row) in self.rows().iter().enumerate() {
            let first_f = usize::from(i < self.num_row_blocks_e);
            for cell in &row.cells[first_f..] {
                let col = &cols[cell.block_id];
                let y_start = col.position - self.num_cols_e;
                matrix_transpose_vector_multiply(
                    &self.values()[cell.position..],
                    row.block.size,
                    col.size,
                    &x[row.block.position..row.block.end()],
                    &mut y[y_start..y_start + col.size],
                );
            }
        }
    }

    pub fn left_multiply_and_accumulate_f_par(
        &self,
        x: &[f64],
        y: &mut [f64],
        context: &ExecutionContext,
        num_threads: usize,
    ) {
        let f_rows = match self.transpose_rows() {
            Some((_, f_rows)) if num_threads > 1 => f_rows,
            _ => return self.left_multiply_and_accumulate_f(x, y),
        };
        debug_assert_eq!(x.len(), self.num_rows());
        debug_assert_eq!(y.len(), self.num_cols_f);
        parallel_for_rows(
            context,
            num_threads,
            f_rows,
            y,
            self.num_cols_e,
            |range, y_chunk, base| {
                self.left_multiply_transposed_rows(&f_rows[range], x, y_chunk, base);
            },
        );
    }

    fn left_multiply_transposed_rows(
        &self,
        transpose_rows: &[CompressedRow],
        x: &[f64],
        y_chunk: &mut [f64],
        base: usize,
    ) {
        let Some(transpose) = self.matrix.transpose_block_structure() else {
            return;
        };
        for col in transpose_rows {
            let start = col.block.position - base;
            let y_col = &mut y_chunk[start..start + col.block.size];
            for cell in &col.cells {
                let row = &transpose.cols[cell.block_id];
                matrix_transpose_vector_multiply(
                    &self.values()[cell.position..],
                    row.size,
                    col.block.size,
                    &x[row.position..row.end()],
                    y_col,
                );
            }
        }
    }

    /// Block diagonal of `EᵀE`, one block per `E` column block.
    pub fn create_block_diagonal_ete(
        &self,
        context: &ExecutionContext,
        num_threads: usize,
    ) -> BlockRandomAccessDiagonalMatrix {
        let sizes: Vec<usize> = self.matrix.block_structure().cols[..self.num_col_blocks_e]
            .iter()
            .map(|col| col.size)
            .collect();
        let mut block_diagonal = BlockRandomAccessDiagonalMatrix::new(&sizes);
        self.update_block_diagonal_ete(&mut block_diagonal, context, num_threads);
        block_diagonal
    }

    /// Block diagonal of `FᵀF`, one block per `F` column block.
    pub fn create_block_diagonal_ftf(
        &self,
        context: &ExecutionContext,
        num_threads: usize,
    ) -> BlockRandomAccessDiagonalMatrix {
        let sizes: Vec<usize> = self.matrix.block_structure().cols[self.num_col_blocks_e..]
            .iter()
            .map(|col| col.size)
            .collect();
        let mut block_diagonal = BlockRandomAccessDiagonalMatrix::new(&sizes);
        self.update_block_diagonal_ftf(&mut block_diagonal, context, num_threads);
        block_diagonal
    }

    /// Overwrite `block_diagonal` with the block diagonal of `EᵀE`.
    pub fn update_block_diagonal_ete(
        &self,
        block_diagonal: &mut BlockRandomAccessDiagonalMatrix,
        context: &ExecutionContext,
        num_threads: usize,
    ) {
        assert_eq!(
            block_diagonal.num_blocks(),
            self.num_col_blocks_e,
            "block diagonal does not match the E partition"
        );
        match self.transpose_rows() {
            Some((e_rows, _)) if num_threads > 1 => {
                self.update_block_diagonal_transposed(block_diagonal, e_rows, context, num_threads)
            }
            _ => {
                let cols = &self.matrix.block_structure().cols;
                let mut blocks = block_diagonal.blocks_mut();
                blocks.iter_mut().for_each(|block| block.fill(0.0));
                for row in &self.rows()[..self.num_row_blocks_e] {
                    let cell = &row.cells[0];
                    let col = &cols[cell.block_id];
                    matrix_transpose_matrix_multiply(
                        &self.values()[cell.position..],
                        row.block.size,
                        col.size,
                        &mut *blocks[cell.block_id],
                        col.size,
                    );
                }
            }
        }
    }

    /// Overwrite `block_diagonal` with the block diagonal of `FᵀF`.
    pub fn update_block_diagonal_ftf(
        &self,
        block_diagonal: &mut BlockRandomAccessDiagonalMatrix,
        context: &ExecutionContext,
        num_threads: usize,
    ) {
        assert_eq!(
            block_diagonal.num_blocks(),
            self.num_col_blocks_f,
            "block diagonal does not match the F partition"
        );
        match self.transpose_rows() {
            Some((_, f_rows)) if num_threads > 1 => {
                self.update_block_diagonal_transposed(block_diagonal, f_rows, context, num_threads)
            }
            _ => {
                let cols = &self.matrix.block_structure().cols;
                let mut blocks = block_diagonal.blocks_mut();
                blocks.iter_mut().for_each(|block| block.fill(0.0));
                for (i, row) in self.rows().iter().enumerate() {
                    let first_f = usize::from(i < self.num_row_blocks_e);
                    for cell in &row.cells[first_f..] {
                        let col = &cols[cell.block_id];
                        matrix_transpose_matrix_multiply(
                            &self.values()[cell.position..],
                            row.block.size,
                            col.size,
                            &mut *blocks[cell.block_id - self.num_col_blocks_e],
                            col.size,
                        );
                    }
                }
            }
        }
    }

    /// Each chunk owns a range of column blocks and so a disjoint set of
    /// diagonal blocks, which it zeroes and then accumulates from the cells
    /// listed in the transposed rows.
    fn update_block_diagonal_transposed(
        &self,
        block_diagonal: &mut BlockRandomAccessDiagonalMatrix,
        transpose_rows: &[CompressedRow],
        context: &ExecutionContext,
        num_threads: usize,
    ) {
        let Some(transpose) = self.matrix.transpose_block_structure() else {
            return;
        };
        let cost_before = transpose_rows
            .first()
            .map_or(0, |row| row.cumulative_nnz - row.nnz);
        let boundaries = partition_range_by_cost(
            0,
            transpose_rows.len(),
            context.max_chunks(num_threads),
            |i| transpose_rows[i].cumulative_nnz - cost_before,
        );
        let tasks = group_by_chunks(block_diagonal.blocks_mut(), &boundaries);
        parallel_invoke(context, tasks, |_, (range, blocks)| {
            for (col, block) in transpose_rows[range].iter().zip(blocks) {
                block.fill(0.0);
                for cell in &col.cells {
                    let row_size = transpose.cols[cell.block_id].size;
                    matrix_transpose_matrix_multiply(
                        &self.values()[cell.position..],
                        row_size,
                        col.block.size,
                        block,
                        col.block.size,
                    );
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse::CompressedRowBlockStructure;
    use nalgebra::{DMatrix, DVector};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Rows 0..4 see point blocks 0 or 1 (size 3) plus some cameras; the last
    /// two rows only see cameras (sizes 6 and 4).
    fn sample_matrix(seed: u64) -> BlockSparseMatrix {
        let bs = CompressedRowBlockStructure::from_pattern(
            &[2, 2, 2, 2, 1, 3],
            &[3, 3, 6, 4],
            &[
                vec![0, 2],
                vec![0, 3],
                vec![1, 2, 3],
                vec![1, 3],
                vec![2],
                vec![2, 3],
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

    fn random_vector(rng: &mut StdRng, len: usize) -> Vec<f64> {
        (0..len).map(|_| rng.random_range(-1.0..1.0)).collect()
    }

    #[test]
    fn test_partition_dimensions() {
        let matrix = sample_matrix(1);
        let view = PartitionedMatrixView::new(&matrix, 2);
        assert_eq!(view.num_row_blocks_e(), 4);
        assert_eq!(view.num_col_blocks_e(), 2);
        assert_eq!(view.num_col_blocks_f(), 2);
        assert_eq!(view.num_cols_e(), 6);
        assert_eq!(view.num_cols_f(), 10);
    }

    #[test]
    fn test_products_match_dense_blocks() {
        let context = ExecutionContext::new(3).unwrap();
        let matrix = sample_matrix(2);
        let view = PartitionedMatrixView::new(&matrix, 2);
        let dense = matrix.to_dense_matrix();
        let e = dense.columns(0, 6).into_owned();
        let f = dense.columns(6, 10).into_owned();
        let mut rng = StdRng::seed_from_u64(3);

        let xe = random_vector(&mut rng, 6);
        let xf = random_vector(&mut rng, 10);
        let xr = random_vector(&mut rng, matrix.num_rows());
        let expected_e = &e * DVector::from_column_slice(&xe);
        let expected_f = &f * DVector::from_column_slice(&xf);
        let expected_et = e.transpose() * DVector::from_column_slice(&xr);
        let expected_ft = f.transpose() * DVector::from_column_slice(&xr);

        for threads in [1, 2, 3] {
            let mut y = vec![0.0; matrix.num_rows()];
            view.right_multiply_and_accumulate_e_par(&xe, &mut y, &context, threads);
            assert!((DVector::from_vec(y) - &expected_e).norm() < 1e-12);

            let mut y = vec![0.0; matrix.num_rows()];
            view.right_multiply_and_accumulate_f_par(&xf, &mut y, &context, threads);
            assert!((DVector::from_vec(y) - &expected_f).norm() < 1e-12);

            let mut y = vec![0.0; 6];
            view.left_multiply_and_accumulate_e_par(&xr, &mut y, &context, threads);
            assert!((DVector::from_vec(y) - &expected_et).norm() < 1e-12);

            let mut y = vec![0.0; 10];
            view.left_multiply_and_accumulate_f_par(&xr, &mut y, &context, threads);
            assert!((DVector::from_vec(y) - &expected_ft).norm() < 1e-12);
        }
    }

    #[test]
    fn test_block_diagonals_match_dense_normal_equations() {
        let context = ExecutionContext::new(2).unwrap();
        let matrix = sample_matrix(4);
        let view = PartitionedMatrixView::new(&matrix, 2);
        let dense = matrix.to_dense_matrix();
        let normal: DMatrix<f64> = dense.transpose() * &dense;

        for threads in [1, 2] {
            let ete = view.create_block_diagonal_ete(&context, threads).to_dense_matrix();
            let ftf = view.create_block_diagonal_ftf(&context, threads).to_dense_matrix();
            // diagonal blocks agree, off-diagonal blocks are absent
            let blocks = [(0, 3), (3, 3)];
            for &(start, size) in &blocks {
                let expected = normal.view((start, start), (size, size));
                let got = ete.view((start, start), (size, size));
                assert!((expected - got).norm() < 1e-12);
            }
            assert_eq!(ete[(0, 3)], 0.0);
            for &(start, size) in &[(0, 6), (6, 4)] {
                let expected = normal.view((6 + start, 6 + start), (size, size));
                let got = ftf.view((start, start), (size, size));
                assert!((expected - got).norm() < 1e-12);
            }
            assert_eq!(ftf[(0, 6)], 0.0);
        }
    }

    #[test]
    #[should_panic(expected = "E cell out of place")]
    fn test_rejects_second_e_cell() {
        let bs = CompressedRowBlockStructure::from_pattern(&[1], &[1, 1, 1], &[vec![0, 1, 2]]);
        let matrix = BlockSparseMatrix::new(bs);
        let _ = PartitionedMatrixView::new(&matrix, 2);
    }
}
