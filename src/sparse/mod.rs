//! Block-sparse storage: the compressed-row block structure, the block-sparse
//! matrix built on it, its column-partitioned `[E | F]` view, the random-access
//! block matrices used for assembly, and a scalar compressed-row export.

pub mod block_sparse_matrix;
pub mod block_structure;
pub mod compressed_row;
pub mod partitioned_view;
pub mod random_access;

pub use block_sparse_matrix::{BlockSparseMatrix, RandomMatrixOptions};
pub use block_structure::{
    Block, Cell, CompressedRow, CompressedRowBlockStructure, blocks_from_sizes,
    compute_cumulative_nnz,
};
pub use compressed_row::CompressedRowSparseMatrix;
pub use partitioned_view::PartitionedMatrixView;
pub use random_access::{
    BlockRandomAccessDenseMatrix, BlockRandomAccessDiagonalMatrix, BlockRandomAccessMatrix,
    CellHandle,
};
