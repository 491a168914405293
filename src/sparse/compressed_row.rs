//! Scalar compressed-row sparse matrix produced by the block-sparse
//! conversions, with export to nalgebra and faer.

use faer::sparse::{SparseColMat, Triplet};
use nalgebra::DMatrix;

use crate::error::{ApexError, ApexResult};

/// Compressed sparse row storage: row `i` owns
/// `cols[rows[i]..rows[i + 1]]` and the matching `values`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedRowSparseMatrix {
    num_rows: usize,
    num_cols: usize,
    rows: Vec<usize>,
    cols: Vec<usize>,
    values: Vec<f64>,
}

impl CompressedRowSparseMatrix {
    pub fn new(
        num_rows: usize,
        num_cols: usize,
        rows: Vec<usize>,
        cols: Vec<usize>,
        values: Vec<f64>,
    ) -> Self {
        assert_eq!(rows.len(), num_rows + 1, "row offsets must have num_rows + 1 entries");
        assert_eq!(cols.len(), values.len());
        debug_assert_eq!(rows.last().copied(), Some(cols.len()));
        debug_assert!(cols.iter().all(|&c| c < num_cols));
        Self {
            num_rows,
            num_cols,
            rows,
            cols,
            values,
        }
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_cols(&self) -> usize {
        self.num_cols
    }

    pub fn num_nonzeros(&self) -> usize {
        self.values.len()
    }

    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    pub fn cols(&self) -> &[usize] {
        &self.cols
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// `y += A x`
    pub fn right_multiply_and_accumulate(&self, x: &[f64], y: &mut [f64]) {
        debug_assert_eq!(x.len(), self.num_cols);
        debug_assert_eq!(y.len(), self.num_rows);
        for (r, yr) in y.iter_mut().enumerate() {
            let range = self.rows[r]..self.rows[r + 1];
            *yr += self.cols[range.clone()]
                .iter()
                .zip(&self.values[range])
                .map(|(&c, v)| v * x[c])
                .sum::<f64>();
        }
    }

    pub fn to_dense_matrix(&self) -> DMatrix<f64> {
        let mut dense = DMatrix::zeros(self.num_rows, self.num_cols);
        for r in 0..self.num_rows {
            for index in self.rows[r]..self.rows[r + 1] {
                dense[(r, self.cols[index])] += self.values[index];
            }
        }
        dense
    }

    /// Convert to faer's column-major sparse format, e.g. to hand the
    /// matrix to a direct sparse factorization.
    pub fn to_faer(&self) -> ApexResult<SparseColMat<usize, f64>> {
        let triplets: Vec<Triplet<usize, usize, f64>> = (0..self.num_rows)
            .flat_map(|r| {
                (self.rows[r]..self.rows[r + 1])
                    .map(move |index| Triplet::new(r, self.cols[index], self.values[index]))
            })
            .collect();
        SparseColMat::try_new_from_triplets(self.num_rows, self.num_cols, &triplets).map_err(|e| {
            ApexError::LinearAlgebra(format!("Failed to build sparse matrix from triplets: {e:?}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CompressedRowSparseMatrix {
        // [1 0 2]
        // [0 0 0]
        // [0 3 4]
        CompressedRowSparseMatrix::new(
            3,
            3,
            vec![0, 2, 2, 4],
            vec![0, 2, 1, 2],
            vec![1.0, 2.0, 3.0, 4.0],
        )
    }

    #[test]
    fn test_right_multiply() {
        let m = sample();
        let mut y = vec![1.0; 3];
        m.right_multiply_and_accumulate(&[1.0, 1.0, 1.0], &mut y);
        assert_eq!(y, vec![4.0, 1.0, 8.0]);
    }

    #[test]
    fn test_to_faer_matches_dense() {
        let m = sample();
        let dense = m.to_dense_matrix();
        let faer = m.to_faer().unwrap();
        assert_eq!(faer.nrows(), 3);
        assert_eq!(faer.ncols(), 3);
        let symbolic = faer.symbolic();
        let mut stored = 0;
        for c in 0..3 {
            let rows = symbolic.row_idx_of_col_raw(c);
            let values = faer.val_of_col(c);
            for (&r, &v) in rows.iter().zip(values) {
                assert_eq!(v, dense[(r, c)]);
                stored += 1;
            }
        }
        assert_eq!(stored, 4);
    }
}
