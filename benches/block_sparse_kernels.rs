//! Kernel benchmarks for the block-sparse matrix and the implicit Schur
//! complement.
//!
//! - `right_multiply` / `left_multiply`: `y += A x` and `y += Aᵀ x` on a
//!   random block-sparse matrix for several thread counts
//! - `schur_multiply`: one product with the implicit Schur complement of a
//!   bundle-adjustment shaped Jacobian
//!
//! ```bash
//! cargo bench --bench block_sparse_kernels
//! ```

use std::hint::black_box;

use apex_block_sparse::{
    BlockSparseMatrix, CompressedRowBlockStructure, ExecutionContext, ImplicitSchurComplement,
    ImplicitSchurOptions, RandomMatrixOptions,
};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const THREAD_COUNTS: [usize; 3] = [1, 2, 4];

fn random_matrix() -> BlockSparseMatrix {
    let options = RandomMatrixOptions::default()
        .with_row_blocks(20_000, 2, 3)
        .with_col_blocks(2_000, 3, 9)
        .with_block_density(0.002);
    let mut matrix =
        BlockSparseMatrix::create_random_matrix(&options, &mut StdRng::seed_from_u64(1));
    matrix.add_transpose_block_structure();
    matrix
}

fn bundle_adjustment_jacobian(num_points: usize, num_cameras: usize) -> BlockSparseMatrix {
    let mut rng = StdRng::seed_from_u64(2);
    let mut col_sizes = vec![3; num_points];
    col_sizes.extend(std::iter::repeat_n(9, num_cameras));
    let mut row_sizes = Vec::new();
    let mut pattern = Vec::new();
    for point in 0..num_points {
        let first_camera = rng.random_range(0..num_cameras);
        for k in 0..4 {
            row_sizes.push(2);
            pattern.push(vec![point, num_points + (first_camera + k) % num_cameras]);
        }
    }
    let mut matrix = BlockSparseMatrix::new(CompressedRowBlockStructure::from_pattern(
        &row_sizes, &col_sizes, &pattern,
    ));
    for v in matrix.values_mut() {
        *v = rng.random_range(-1.0..1.0);
    }
    matrix.add_transpose_block_structure();
    matrix
}

fn bench_multiply(c: &mut Criterion) {
    let matrix = random_matrix();
    let context = ExecutionContext::new(*THREAD_COUNTS.iter().max().unwrap_or(&1))
        .expect("failed to build thread pool");
    let x = vec![1.0; matrix.num_cols()];
    let z = vec![1.0; matrix.num_rows()];

    let mut group = c.benchmark_group("right_multiply");
    for threads in THREAD_COUNTS {
        let mut y = vec![0.0; matrix.num_rows()];
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            b.iter(|| {
                matrix.right_multiply_and_accumulate_par(black_box(&x), &mut y, &context, threads)
            })
        });
    }
    group.finish();

    let mut group = c.benchmark_group("left_multiply");
    for threads in THREAD_COUNTS {
        let mut y = vec![0.0; matrix.num_cols()];
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            b.iter(|| {
                matrix.left_multiply_and_accumulate_par(black_box(&z), &mut y, &context, threads)
            })
        });
    }
    group.finish();
}

fn bench_schur(c: &mut Criterion) {
    let num_points = 10_000;
    let jacobian = bundle_adjustment_jacobian(num_points, 50);
    let b = vec![1.0; jacobian.num_rows()];
    let context = ExecutionContext::new(4).expect("failed to build thread pool");

    let mut group = c.benchmark_group("schur_multiply");
    for threads in THREAD_COUNTS {
        let options = ImplicitSchurOptions::default()
            .with_num_eliminate_blocks(num_points)
            .with_num_threads(threads);
        let mut schur = ImplicitSchurComplement::new(options, &context);
        schur.init(&jacobian, None, &b);
        let x = vec![1.0; schur.num_cols_f()];
        let mut y = vec![0.0; schur.num_cols_f()];
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |bench, _| {
            bench.iter(|| schur.right_multiply_and_accumulate(black_box(&x), &mut y))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_multiply, bench_schur);
criterion_main!(benches);
