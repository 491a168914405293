//! Random Problem Solver Binary
//!
//! Builds a random bundle-adjustment shaped least-squares problem (points
//! observed by a handful of cameras), then solves the damped normal equations
//! with the iterative Schur complement solver.
//!
//! # Usage
//! ```bash
//! cargo run --release --bin solve_random_problem
//!
//! # Larger problem, power series preconditioner, 8 threads:
//! cargo run --release --bin solve_random_problem -- -p 20000 -c 50 -t 8 --preconditioner power-series
//! ```

use apex_block_sparse::{
    BlockSparseMatrix, CompressedRowBlockStructure, ConjugateGradientsOptions, ExecutionContext,
    IterativeSchurComplementSolver, IterativeSchurConfig, PowerSeriesOptions, PreconditionerType,
    init_logger,
};
use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::error::Error;
use std::time::Instant;
use tracing::info;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PreconditionerArg {
    Identity,
    Jacobi,
    PowerSeries,
}

impl From<PreconditionerArg> for PreconditionerType {
    fn from(arg: PreconditionerArg) -> Self {
        match arg {
            PreconditionerArg::Identity => PreconditionerType::Identity,
            PreconditionerArg::Jacobi => PreconditionerType::Jacobi,
            PreconditionerArg::PowerSeries => PreconditionerType::SchurPowerSeriesExpansion,
        }
    }
}

/// Solve a random bundle-adjustment shaped linear least-squares problem
#[derive(Parser)]
#[command(name = "solve_random_problem")]
#[command(about = "Iterative Schur complement solve of a random bundle-adjustment problem")]
struct Args {
    /// Number of point blocks (eliminated)
    #[arg(short, long, default_value_t = 2000)]
    points: usize,

    /// Number of camera blocks (reduced system)
    #[arg(short, long, default_value_t = 20)]
    cameras: usize,

    /// Observations per point
    #[arg(short, long, default_value_t = 4)]
    observations: usize,

    /// Worker threads (0 uses every available hardware thread)
    #[arg(short, long, default_value_t = 4)]
    threads: usize,

    /// Preconditioner for the reduced system
    #[arg(long, value_enum, default_value_t = PreconditionerArg::Jacobi)]
    preconditioner: PreconditionerArg,

    /// Start CG from the power series approximation
    #[arg(long)]
    spse_initialization: bool,

    /// Levenberg-Marquardt style damping added to every column
    #[arg(long, default_value_t = 1e-4)]
    damping: f64,

    /// Maximum CG iterations
    #[arg(long, default_value_t = 500)]
    max_iterations: usize,

    /// Relative residual tolerance
    #[arg(long, default_value_t = 1e-9)]
    tolerance: f64,

    /// Random seed
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

const POINT_SIZE: usize = 3;
const CAMERA_SIZE: usize = 9;
const OBSERVATION_SIZE: usize = 2;

fn build_problem(args: &Args) -> Result<(BlockSparseMatrix, Vec<f64>), Box<dyn Error>> {
    if args.cameras == 0 || args.observations == 0 {
        return Err("at least one camera and one observation per point are required".into());
    }
    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut col_sizes = vec![POINT_SIZE; args.points];
    col_sizes.extend(std::iter::repeat_n(CAMERA_SIZE, args.cameras));

    let observations = args.observations.min(args.cameras);
    let mut row_sizes = Vec::with_capacity(args.points * observations);
    let mut pattern = Vec::with_capacity(args.points * observations);
    for point in 0..args.points {
        let first_camera = rng.random_range(0..args.cameras);
        for k in 0..observations {
            row_sizes.push(OBSERVATION_SIZE);
            pattern.push(vec![point, args.points + (first_camera + k) % args.cameras]);
        }
    }

    let mut jacobian = BlockSparseMatrix::new(CompressedRowBlockStructure::from_pattern(
        &row_sizes, &col_sizes, &pattern,
    ));
    for value in jacobian.values_mut() {
        *value = rng.random_range(-1.0..1.0);
    }
    jacobian.add_transpose_block_structure();
    let residuals = (0..jacobian.num_rows())
        .map(|_| rng.random_range(-1.0..1.0))
        .collect();
    Ok((jacobian, residuals))
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    // Initialize logger
    init_logger();

    info!("APEX-BLOCK-SPARSE RANDOM PROBLEM");
    info!("");

    let start_build = Instant::now();
    let (jacobian, residuals) = build_problem(&args)?;
    info!("Problem statistics:");
    info!("  Points: {}", args.points);
    info!("  Cameras: {}", args.cameras);
    info!("  Jacobian: {} x {}", jacobian.num_rows(), jacobian.num_cols());
    info!("  Non-zeros: {}", jacobian.num_nonzeros());
    info!("  Build time: {:?}", start_build.elapsed());
    info!("");

    let context = if args.threads == 0 {
        ExecutionContext::with_available_parallelism()?
    } else {
        ExecutionContext::new(args.threads)?
    };
    let num_threads = context.num_workers();
    info!("Using {} worker threads", num_threads);
    let config = IterativeSchurConfig::new()
        .with_num_eliminate_blocks(args.points)
        .with_preconditioner(args.preconditioner.into())
        .with_spse_initialization(args.spse_initialization)
        .with_power_series(PowerSeriesOptions::default())
        .with_num_threads(num_threads)
        .with_conjugate_gradients(
            ConjugateGradientsOptions::default()
                .with_max_num_iterations(args.max_iterations)
                .with_r_tolerance(args.tolerance),
        );
    let mut solver = IterativeSchurComplementSolver::new(config)?;

    let damping = vec![args.damping.sqrt(); jacobian.num_cols()];
    let mut step = vec![0.0; jacobian.num_cols()];
    let start_solve = Instant::now();
    let summary = solver.solve(&jacobian, &residuals, Some(&damping), &mut step, &context);
    let solve_time = start_solve.elapsed();

    let step_norm = step.iter().map(|v| v * v).sum::<f64>().sqrt();
    info!("Solver summary:");
    info!("  Termination: {}", summary.termination_type);
    info!("  Message: {}", summary.message);
    info!("  Iterations: {}", summary.num_iterations);
    info!("  |x|: {:.6e}", step_norm);
    info!("  Solve time: {:?}", solve_time);

    Ok(())
}
