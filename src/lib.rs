//! # Apex Block Sparse
//!
//! Block-sparse linear algebra and iterative solvers for the large normal
//! equations of nonlinear least squares problems such as bundle adjustment.
//!
//! ## Features
//!
//! - **Block-Sparse Matrices**: Compressed-row block storage with an optional
//!   transposed structure kept in sync under row appends and deletions
//! - **Implicit Schur Complement**: Eliminates point-like parameter blocks
//!   without ever forming the reduced matrix
//! - **Preconditioned Conjugate Gradients**: Generic over any linear operator,
//!   with residual and quadratic model termination
//! - **Preconditioners**: Block Jacobi and power series (Neumann) expansions
//! - **Fork-Join Parallelism**: Cost-balanced parallel kernels on an explicit
//!   rayon thread pool
//!
//! ## Typical Flow
//!
//! 1. Evaluate the Jacobian into a [`BlockSparseMatrix`] whose first column
//!    blocks are the eliminated (E) blocks
//! 2. Run the [`IterativeSchurComplementSolver`] with damping and residuals
//! 3. Inspect the returned [`LinearSolverSummary`]

pub mod error;
pub mod linalg;
pub mod logger;
pub mod parallel;
pub mod sparse;

// Re-export error types
pub use error::{ApexError, ApexResult};

// Re-export linear algebra types
pub use linalg::{
    BlockJacobiPreconditioner, ConjugateGradientsOptions, ConjugateGradientsScratch,
    IdentityPreconditioner, ImplicitSchurComplement, ImplicitSchurOptions,
    IterativeSchurComplementSolver, IterativeSchurConfig, LinearOperator, LinearSolverSummary,
    LinearSolverTerminationType, PowerSeriesOptions, PowerSeriesPreconditioner, Preconditioner,
    PreconditionerType, conjugate_gradients_solve,
};

// Re-export logger
pub use logger::{init_logger, init_logger_with_level};

// Re-export parallel execution
pub use parallel::ExecutionContext;

// Re-export sparse matrix types
pub use sparse::{
    Block, BlockRandomAccessDenseMatrix, BlockRandomAccessDiagonalMatrix, BlockRandomAccessMatrix,
    BlockSparseMatrix, Cell, CellHandle, CompressedRow, CompressedRowBlockStructure,
    CompressedRowSparseMatrix, PartitionedMatrixView, RandomMatrixOptions,
};
