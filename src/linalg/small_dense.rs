//! Kernels over small dense blocks stored row-major in a flat value buffer.
//!
//! Cells of a block-sparse matrix are tiny (typically 2x3, 2x9, 3x3, 9x9), so
//! the products here are plain loops. Inversion of a symmetric positive
//! (semi-)definite block goes through nalgebra.

use nalgebra::DMatrix;

/// `y += A x` for a row-major `num_rows x num_cols` block `A`.
#[inline]
pub fn matrix_vector_multiply(
    a: &[f64],
    num_rows: usize,
    num_cols: usize,
    x: &[f64],
    y: &mut [f64],
) {
    debug_assert!(a.len() >= num_rows * num_cols);
    debug_assert!(x.len() >= num_cols && y.len() >= num_rows);
    for (r, yr) in y.iter_mut().take(num_rows).enumerate() {
        let row = &a[r * num_cols..(r + 1) * num_cols];
        *yr += row.iter().zip(x).map(|(aij, xj)| aij * xj).sum::<f64>();
    }
}

/// `y += Aᵀ x` for a row-major `num_rows x num_cols` block `A`.
#[inline]
pub fn matrix_transpose_vector_multiply(
    a: &[f64],
    num_rows: usize,
    num_cols: usize,
    x: &[f64],
    y: &mut [f64],
) {
    debug_assert!(a.len() >= num_rows * num_cols);
    debug_assert!(x.len() >= num_rows && y.len() >= num_cols);
    for (r, xr) in x.iter().take(num_rows).enumerate() {
        let row = &a[r * num_cols..(r + 1) * num_cols];
        for (yj, aij) in y.iter_mut().zip(row) {
            *yj += aij * xr;
        }
    }
}

/// `C += Aᵀ A` where `A` is row-major `num_rows x num_cols` and `C` is a
/// `num_cols x num_cols` block addressed with `c_row_stride` between rows.
#[inline]
pub fn matrix_transpose_matrix_multiply(
    a: &[f64],
    num_rows: usize,
    num_cols: usize,
    c: &mut [f64],
    c_row_stride: usize,
) {
    for r in 0..num_rows {
        let row = &a[r * num_cols..(r + 1) * num_cols];
        for (i, ai) in row.iter().enumerate() {
            let c_row = &mut c[i * c_row_stride..i * c_row_stride + num_cols];
            for (cij, aj) in c_row.iter_mut().zip(row) {
                *cij += ai * aj;
            }
        }
    }
}

/// Invert a `size x size` symmetric positive semi-definite block in place.
///
/// With `assume_full_rank` the block is factored with Cholesky; a failed
/// factorization (or `assume_full_rank == false`) falls back to an SVD based
/// pseudo-inverse that truncates singular values below
/// `eps * size * sigma_max`.
pub fn invert_psd_matrix(assume_full_rank: bool, block: &mut [f64], size: usize) {
    if size == 0 {
        return;
    }
    debug_assert!(block.len() >= size * size);
    let m = DMatrix::from_row_slice(size, size, &block[..size * size]);

    let inverse = if assume_full_rank {
        match m.clone().cholesky() {
            Some(cholesky) => cholesky.inverse(),
            None => {
                tracing::warn!(
                    "Cholesky failed on a {size}x{size} block assumed full rank, \
                     using pseudo-inverse"
                );
                pseudo_inverse(m)
            }
        }
    } else {
        pseudo_inverse(m)
    };

    for r in 0..size {
        for c in 0..size {
            block[r * size + c] = inverse[(r, c)];
        }
    }
}

fn pseudo_inverse(m: DMatrix<f64>) -> DMatrix<f64> {
    let size = m.nrows();
    let svd = m.svd(true, true);
    let sigma_max = svd.singular_values.max();
    let tolerance = f64::EPSILON * size as f64 * sigma_max;
    svd.pseudo_inverse(tolerance)
        .unwrap_or_else(|_| DMatrix::zeros(size, size))
}
