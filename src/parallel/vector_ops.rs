//! Parallel versions of the handful of dense vector operations used by the
//! iterative solvers.
//!
//! Vectors shorter than [`MIN_PARALLEL_VECTOR_SIZE`] per chunk are processed
//! on the calling thread. Reductions accumulate one partial sum per chunk and
//! add the partials in chunk order, so the result is deterministic for a
//! fixed thread count.

use super::{ExecutionContext, chunk_ranges, parallel_for, parallel_invoke, partition_range};

/// Minimum number of entries handled by one chunk of a parallel vector op.
pub const MIN_PARALLEL_VECTOR_SIZE: usize = 1 << 14;

fn vector_chunks(context: &ExecutionContext, len: usize, num_threads: usize) -> Vec<usize> {
    partition_range(
        0,
        len,
        context.max_chunks(num_threads),
        MIN_PARALLEL_VECTOR_SIZE,
    )
}

/// `x = 0`
pub fn parallel_set_zero(context: &ExecutionContext, num_threads: usize, x: &mut [f64]) {
    let len = x.len();
    parallel_for(context, 0..len, num_threads, MIN_PARALLEL_VECTOR_SIZE, x, |_, piece| {
        piece.fill(0.0);
    });
}

/// `dst = src`
pub fn parallel_assign(
    context: &ExecutionContext,
    num_threads: usize,
    dst: &mut [f64],
    src: &[f64],
) {
    debug_assert_eq!(dst.len(), src.len(), "assign: length mismatch");
    let len = dst.len();
    parallel_for(context, 0..len, num_threads, MIN_PARALLEL_VECTOR_SIZE, dst, |range, piece| {
        piece.copy_from_slice(&src[range]);
    });
}

/// `y = a * x + b * y`
pub fn axpby(
    context: &ExecutionContext,
    num_threads: usize,
    a: f64,
    x: &[f64],
    b: f64,
    y: &mut [f64],
) {
    debug_assert_eq!(x.len(), y.len(), "axpby: length mismatch");
    let len = y.len();
    parallel_for(context, 0..len, num_threads, MIN_PARALLEL_VECTOR_SIZE, y, |range, piece| {
        for (yi, xi) in piece.iter_mut().zip(&x[range]) {
            *yi = a * xi + b * *yi;
        }
    });
}

/// `x . y`
pub fn dot(context: &ExecutionContext, num_threads: usize, x: &[f64], y: &[f64]) -> f64 {
    debug_assert_eq!(x.len(), y.len(), "dot: length mismatch");
    let offsets = vector_chunks(context, x.len(), num_threads);
    let ranges = chunk_ranges(&offsets);
    let mut partials = vec![0.0; ranges.len()];
    let tasks: Vec<_> = partials.iter_mut().zip(ranges).collect();
    parallel_invoke(context, tasks, |_, (partial, range)| {
        *partial = x[range.clone()]
            .iter()
            .zip(&y[range])
            .map(|(a, b)| a * b)
            .sum();
    });
    partials.iter().sum()
}

/// Euclidean norm of `x`.
pub fn norm(context: &ExecutionContext, num_threads: usize, x: &[f64]) -> f64 {
    dot(context, num_threads, x, x).sqrt()
}
