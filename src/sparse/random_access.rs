//! Block matrices whose cells can be addressed directly by block indices,
//! used to assemble block diagonals and small dense systems.
//!
//! A [`CellHandle`] mutably borrows its matrix, so no handle can be alive when
//! [`BlockRandomAccessMatrix::set_zero`] runs.

use nalgebra::DMatrix;

use super::block_structure::{Block, blocks_from_sizes};
use crate::linalg::LinearOperator;
use crate::linalg::small_dense::{invert_psd_matrix, matrix_vector_multiply};
use crate::parallel::{
    ExecutionContext, chunk_ranges, parallel_invoke, parallel_set_zero, partition_range_by_cost,
    split_at_offsets,
};

/// Mutable view of one cell inside a random-access matrix buffer.
///
/// Entry `(r, c)` of the cell lives at
/// `values[(row + r) * col_stride + col + c]`; `row_stride` and `col_stride`
/// are the dimensions of the buffer the cell sits in.
#[derive(Debug)]
pub struct CellHandle<'a> {
    pub values: &'a mut [f64],
    pub row: usize,
    pub col: usize,
    pub row_stride: usize,
    pub col_stride: usize,
}

impl CellHandle<'_> {
    #[inline]
    fn index(&self, r: usize, c: usize) -> usize {
        (self.row + r) * self.col_stride + self.col + c
    }

    pub fn get(&self, r: usize, c: usize) -> f64 {
        self.values[self.index(r, c)]
    }

    pub fn set(&mut self, r: usize, c: usize, value: f64) {
        let index = self.index(r, c);
        self.values[index] = value;
    }

    pub fn add(&mut self, r: usize, c: usize, value: f64) {
        let index = self.index(r, c);
        self.values[index] += value;
    }
}

/// Block matrix with random access to its cells.
pub trait BlockRandomAccessMatrix {
    /// Handle to cell `(row_block_id, col_block_id)`, or `None` when the
    /// matrix does not store that cell.
    fn cell_mut(&mut self, row_block_id: usize, col_block_id: usize) -> Option<CellHandle<'_>>;

    /// Zero every stored value.
    fn set_zero(&mut self, context: &ExecutionContext, num_threads: usize);

    fn num_rows(&self) -> usize;

    fn num_cols(&self) -> usize;
}

/// Block-diagonal matrix with each diagonal block stored as its own
/// contiguous row-major square.
#[derive(Debug, Clone)]
pub struct BlockRandomAccessDiagonalMatrix {
    blocks: Vec<Block>,
    /// `offsets[i]` is where block `i` starts in `values`; one extra entry
    /// holds the total length.
    offsets: Vec<usize>,
    cumulative_cost: Vec<usize>,
    values: Vec<f64>,
}

impl BlockRandomAccessDiagonalMatrix {
    pub fn new(block_sizes: &[usize]) -> Self {
        let blocks = blocks_from_sizes(block_sizes);
        let mut offsets = Vec::with_capacity(blocks.len() + 1);
        let mut cumulative_cost = Vec::with_capacity(blocks.len());
        let mut total = 0;
        offsets.push(0);
        for block in &blocks {
            total += block.size * block.size;
            offsets.push(total);
            cumulative_cost.push(total);
        }
        tracing::trace!(
            "Allocated block diagonal matrix with {} blocks and {} values",
            blocks.len(),
            total
        );
        Self {
            blocks,
            offsets,
            cumulative_cost,
            values: vec![0.0; total],
        }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Row-major values of diagonal block `i`.
    pub fn block(&self, i: usize) -> &[f64] {
        &self.values[self.offsets[i]..self.offsets[i + 1]]
    }

    pub fn block_mut(&mut self, i: usize) -> &mut [f64] {
        &mut self.values[self.offsets[i]..self.offsets[i + 1]]
    }

    /// Every diagonal block as its own mutable slice.
    pub fn blocks_mut(&mut self) -> Vec<&mut [f64]> {
        split_at_offsets(&mut self.values, &self.offsets)
    }

    /// Split the blocks into cost-balanced chunks. Each task carries the
    /// block range and the matching slice of the value buffer.
    fn chunked_blocks_mut(
        &mut self,
        context: &ExecutionContext,
        num_threads: usize,
    ) -> Vec<(std::ops::Range<usize>, &mut [f64])> {
        let cumulative_cost = &self.cumulative_cost;
        let boundaries = partition_range_by_cost(
            0,
            self.blocks.len(),
            context.max_chunks(num_threads),
            |i| cumulative_cost[i],
        );
        let value_offsets: Vec<usize> = boundaries.iter().map(|&b| self.offsets[b]).collect();
        chunk_ranges(&boundaries)
            .into_iter()
            .zip(split_at_offsets(&mut self.values, &value_offsets))
            .collect()
    }

    /// Add `d[i]²` to the `i`-th scalar diagonal entry.
    pub fn add_squared_diagonal(&mut self, d: &[f64]) {
        assert_eq!(
            d.len(),
            self.num_rows(),
            "diagonal has {} entries for a {}x{} block diagonal",
            d.len(),
            self.num_rows(),
            self.num_rows()
        );
        for (block, values) in self.blocks.clone().iter().zip(self.blocks_mut()) {
            for j in 0..block.size {
                let dj = d[block.position + j];
                values[j * block.size + j] += dj * dj;
            }
        }
    }

    /// Replace every diagonal block by its inverse. Blocks are assumed
    /// symmetric positive semi-definite; see [`invert_psd_matrix`].
    pub fn invert(&mut self, context: &ExecutionContext, num_threads: usize) {
        let blocks = self.blocks.clone();
        let offsets = self.offsets.clone();
        let tasks = self.chunked_blocks_mut(context, num_threads);
        parallel_invoke(context, tasks, |_, (range, chunk)| {
            let base = offsets[range.start];
            for i in range {
                let size = blocks[i].size;
                let start = offsets[i] - base;
                invert_psd_matrix(true, &mut chunk[start..start + size * size], size);
            }
        });
    }

    /// `y += D x`
    pub fn right_multiply_and_accumulate(&self, x: &[f64], y: &mut [f64]) {
        debug_assert_eq!(x.len(), self.num_rows());
        debug_assert_eq!(y.len(), self.num_rows());
        for (i, block) in self.blocks.iter().enumerate() {
            matrix_vector_multiply(
                self.block(i),
                block.size,
                block.size,
                &x[block.position..block.end()],
                &mut y[block.position..block.end()],
            );
        }
    }

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
        debug_assert_eq!(x.len(), self.num_rows());
        debug_assert_eq!(y.len(), self.num_rows());

        let cumulative_cost = &self.cumulative_cost;
        let boundaries = partition_range_by_cost(
            0,
            self.blocks.len(),
            context.max_chunks(num_threads),
            |i| cumulative_cost[i],
        );
        let num_rows = self.num_rows();
        let row_offsets: Vec<usize> = boundaries
            .iter()
            .map(|&b| self.blocks.get(b).map_or(num_rows, |block| block.position))
            .collect();
        let tasks: Vec<_> = chunk_ranges(&boundaries)
            .into_iter()
            .zip(split_at_offsets(y, &row_offsets))
            .zip(row_offsets.iter().copied())
            .collect();

        parallel_invoke(context, tasks, |_, ((range, y_chunk), base)| {
            for i in range {
                let block = &self.blocks[i];
                let start = block.position - base;
                matrix_vector_multiply(
                    self.block(i),
                    block.size,
                    block.size,
                    &x[block.position..block.end()],
                    &mut y_chunk[start..start + block.size],
                );
            }
        });
    }

    pub fn to_dense_matrix(&self) -> DMatrix<f64> {
        let n = self.num_rows();
        let mut dense = DMatrix::zeros(n, n);
        for (i, block) in self.blocks.iter().enumerate() {
            let values = self.block(i);
            for r in 0..block.size {
                for c in 0..block.size {
                    dense[(block.position + r, block.position + c)] = values[r * block.size + c];
                }
            }
        }
        dense
    }
}

impl BlockRandomAccessMatrix for BlockRandomAccessDiagonalMatrix {
    fn cell_mut(&mut self, row_block_id: usize, col_block_id: usize) -> Option<CellHandle<'_>> {
        if row_block_id != col_block_id {
            return None;
        }
        let size = self.blocks[row_block_id].size;
        Some(CellHandle {
            values: self.block_mut(row_block_id),
            row: 0,
            col: 0,
            row_stride: size,
            col_stride: size,
        })
    }

    fn set_zero(&mut self, context: &ExecutionContext, num_threads: usize) {
        parallel_set_zero(context, num_threads, &mut self.values);
    }

    fn num_rows(&self) -> usize {
        self.blocks.last().map_or(0, |block| block.end())
    }

    fn num_cols(&self) -> usize {
        BlockRandomAccessMatrix::num_rows(self)
    }
}

impl BlockRandomAccessDiagonalMatrix {
    pub fn num_rows(&self) -> usize {
        BlockRandomAccessMatrix::num_rows(self)
    }
}

impl LinearOperator for BlockRandomAccessDiagonalMatrix {
    fn right_multiply_and_accumulate(&self, x: &[f64], y: &mut [f64]) {
        BlockRandomAccessDiagonalMatrix::right_multiply_and_accumulate(self, x, y);
    }

    fn right_multiply_and_accumulate_par(
        &self,
        x: &[f64],
        y: &mut [f64],
        context: &ExecutionContext,
        num_threads: usize,
    ) {
        BlockRandomAccessDiagonalMatrix::right_multiply_and_accumulate_par(
            self,
            x,
            y,
            context,
            num_threads,
        );
    }

    fn num_rows(&self) -> usize {
        BlockRandomAccessDiagonalMatrix::num_rows(self)
    }

    fn num_cols(&self) -> usize {
        BlockRandomAccessDiagonalMatrix::num_rows(self)
    }
}

/// Square dense matrix partitioned into blocks; every cell exists and maps
/// into the single shared row-major `n x n` buffer.
#[derive(Debug, Clone)]
pub struct BlockRandomAccessDenseMatrix {
    blocks: Vec<Block>,
    num_rows: usize,
    values: Vec<f64>,
}

impl BlockRandomAccessDenseMatrix {
    pub fn new(block_sizes: &[usize]) -> Self {
        let blocks = blocks_from_sizes(block_sizes);
        let num_rows = blocks.last().map_or(0, |block| block.end());
        Self {
            blocks,
            num_rows,
            values: vec![0.0; num_rows * num_rows],
        }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Row-major `n x n` values.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn to_dense_matrix(&self) -> DMatrix<f64> {
        DMatrix::from_row_slice(self.num_rows, self.num_rows, &self.values)
    }
}

impl BlockRandomAccessMatrix for BlockRandomAccessDenseMatrix {
    fn cell_mut(&mut self, row_block_id: usize, col_block_id: usize) -> Option<CellHandle<'_>> {
        let row = self.blocks[row_block_id].position;
        let col = self.blocks[col_block_id].position;
        Some(CellHandle {
            values: &mut self.values,
            row,
            col,
            row_stride: self.num_rows,
            col_stride: self.num_rows,
        })
    }

    fn set_zero(&mut self, context: &ExecutionContext, num_threads: usize) {
        parallel_set_zero(context, num_threads, &mut self.values);
    }

    fn num_rows(&self) -> usize {
        self.num_rows
    }

    fn num_cols(&self) -> usize {
        self.num_rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_spd_block(rng: &mut StdRng, size: usize) -> Vec<f64> {
        let a = DMatrix::<f64>::from_fn(size, size, |_, _| rng.random_range(-1.0..1.0));
        let spd = a.transpose() * &a + DMatrix::<f64>::identity(size, size) * size as f64;
        let mut values = vec![0.0; size * size];
        for r in 0..size {
            for c in 0..size {
                values[r * size + c] = spd[(r, c)];
            }
        }
        values
    }

    #[test]
    fn test_diagonal_cells_only_on_diagonal() {
        let mut m = BlockRandomAccessDiagonalMatrix::new(&[2, 3]);
        assert!(m.cell_mut(0, 1).is_none());
        let mut cell = m.cell_mut(1, 1).unwrap();
        assert_eq!(cell.row_stride, 3);
        cell.set(2, 1, 5.0);
        cell.add(2, 1, 1.0);
        assert_eq!(cell.get(2, 1), 6.0);
        assert_eq!(m.block(1)[2 * 3 + 1], 6.0);
        assert_eq!(m.to_dense_matrix()[(4, 3)], 6.0);
    }

    #[test]
    fn test_invert_reproduces_identity_per_block() {
        let context = ExecutionContext::new(3).unwrap();
        let sizes = [3, 1, 4, 2, 3, 2];
        let mut rng = StdRng::seed_from_u64(17);
        let mut m = BlockRandomAccessDiagonalMatrix::new(&sizes);
        for (i, &size) in sizes.iter().enumerate() {
            m.block_mut(i).copy_from_slice(&random_spd_block(&mut rng, size));
        }
        let original = m.clone();
        m.invert(&context, 3);

        for (i, block) in m.blocks().iter().enumerate() {
            // apply A then A^-1 to each unit vector of the block
            for k in 0..block.size {
                let mut e = vec![0.0; m.num_rows()];
                e[block.position + k] = 1.0;
                let mut ae = vec![0.0; m.num_rows()];
                original.right_multiply_and_accumulate(&e, &mut ae);
                let mut back = vec![0.0; m.num_rows()];
                m.right_multiply_and_accumulate_par(&ae, &mut back, &context, 3);
                for r in 0..block.size {
                    let expected = if r == k { 1.0 } else { 0.0 };
                    assert!(
                        (back[block.position + r] - expected).abs() < 1e-10,
                        "block {i} entry ({r}, {k})"
                    );
                }
            }
        }
    }

    #[test]
    fn test_parallel_multiply_matches_serial() {
        let context = ExecutionContext::new(4).unwrap();
        let sizes: Vec<usize> = (0..50).map(|i| 1 + i % 4).collect();
        let mut rng = StdRng::seed_from_u64(5);
        let mut m = BlockRandomAccessDiagonalMatrix::new(&sizes);
        for block in m.blocks_mut() {
            for v in block.iter_mut() {
                *v = rng.random_range(-1.0..1.0);
            }
        }
        let x: Vec<f64> = (0..m.num_rows()).map(|_| rng.random_range(-1.0..1.0)).collect();
        let mut serial = vec![0.5; m.num_rows()];
        let mut parallel = serial.clone();
        m.right_multiply_and_accumulate(&x, &mut serial);
        m.right_multiply_and_accumulate_par(&x, &mut parallel, &context, 4);
        for (a, b) in serial.iter().zip(&parallel) {
            assert!((a - b).abs() < 1e-14);
        }
    }

    #[test]
    fn test_dense_cells_share_one_buffer() {
        let context = ExecutionContext::new(2).unwrap();
        let mut m = BlockRandomAccessDenseMatrix::new(&[2, 1]);
        {
            let mut cell = m.cell_mut(0, 1).unwrap();
            assert_eq!((cell.row, cell.col, cell.col_stride), (0, 2, 3));
            cell.set(1, 0, 7.0);
        }
        m.cell_mut(1, 0).unwrap().set(0, 1, 3.0);
        let dense = m.to_dense_matrix();
        assert_eq!(dense[(1, 2)], 7.0);
        assert_eq!(dense[(2, 1)], 3.0);

        m.set_zero(&context, 2);
        assert!(m.values().iter().all(|v| *v == 0.0));
    }
}
