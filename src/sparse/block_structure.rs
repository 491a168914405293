//! Row/column block partitions and the compressed-row block structure that
//! describes the non-zero pattern of a [`BlockSparseMatrix`](super::BlockSparseMatrix).

/// A contiguous run of scalar rows or columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Block {
    pub size: usize,
    pub position: usize,
}

impl Block {
    pub fn new(size: usize, position: usize) -> Self {
        Self { size, position }
    }

    /// One past the last scalar index covered by the block.
    pub fn end(&self) -> usize {
        self.position + self.size
    }
}

/// A non-zero sub-block: the column (or, in a transposed structure, row) block
/// it belongs to and the offset of its first value in the value buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub block_id: usize,
    pub position: usize,
}

impl Cell {
    pub fn new(block_id: usize, position: usize) -> Self {
        Self { block_id, position }
    }
}

/// One block row and its cells.
///
/// `nnz` is the number of scalar non-zeros in the row. `cumulative_nnz` is the
/// running total over this and all preceding rows; it is only used to balance
/// parallel work and is recomputed whenever the structure changes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompressedRow {
    pub block: Block,
    pub cells: Vec<Cell>,
    pub nnz: usize,
    pub cumulative_nnz: usize,
}

impl CompressedRow {
    pub fn new(block: Block) -> Self {
        Self {
            block,
            ..Self::default()
        }
    }
}

/// Non-zero pattern of a block-sparse matrix: the block rows with their cells
/// and the column partition.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompressedRowBlockStructure {
    pub rows: Vec<CompressedRow>,
    pub cols: Vec<Block>,
}

impl CompressedRowBlockStructure {
    /// Build a structure from a row partition, a column partition and, for each
    /// row, the ids of its column blocks. Cell values are laid out row-major,
    /// row after row, in the order given.
    pub fn from_pattern(row_sizes: &[usize], col_sizes: &[usize], pattern: &[Vec<usize>]) -> Self {
        assert_eq!(
            row_sizes.len(),
            pattern.len(),
            "one column list is required per row block"
        );
        let cols = blocks_from_sizes(col_sizes);
        let mut rows = Vec::with_capacity(row_sizes.len());
        let mut row_position = 0;
        let mut value_position = 0;
        for (&row_size, col_ids) in row_sizes.iter().zip(pattern) {
            let mut row = CompressedRow::new(Block::new(row_size, row_position));
            for &col_id in col_ids {
                assert!(
                    col_id < cols.len(),
                    "column block {col_id} out of range ({} column blocks)",
                    cols.len()
                );
                row.cells.push(Cell::new(col_id, value_position));
                value_position += row_size * cols[col_id].size;
            }
            row_position += row_size;
            rows.push(row);
        }
        let mut structure = Self { rows, cols };
        structure.compute_row_nnz();
        structure
    }

    pub fn num_rows(&self) -> usize {
        self.rows.last().map_or(0, |row| row.block.end())
    }

    pub fn num_cols(&self) -> usize {
        self.cols.last().map_or(0, |col| col.end())
    }

    pub fn num_nonzeros(&self) -> usize {
        self.rows
            .iter()
            .flat_map(|row| {
                row.cells
                    .iter()
                    .map(move |cell| row.block.size * self.cols[cell.block_id].size)
            })
            .sum()
    }

    /// Largest cell end position, i.e. the value buffer length required.
    pub fn required_values(&self) -> usize {
        self.rows
            .iter()
            .flat_map(|row| {
                row.cells.iter().map(move |cell| {
                    cell.position + row.block.size * self.cols[cell.block_id].size
                })
            })
            .max()
            .unwrap_or(0)
    }

    /// Recompute `nnz` for every row from its cells, then the running totals.
    pub fn compute_row_nnz(&mut self) {
        for row in &mut self.rows {
            row.nnz = row
                .cells
                .iter()
                .map(|cell| row.block.size * self.cols[cell.block_id].size)
                .sum();
        }
        compute_cumulative_nnz(&mut self.rows);
    }

    /// Structure of the transposed matrix. Cell positions are reused, so the
    /// transpose addresses the same value buffer with row-major cells of the
    /// original layout.
    pub fn create_transpose(&self) -> Self {
        let mut transpose = Self {
            rows: self.cols.iter().map(|col| CompressedRow::new(*col)).collect(),
            cols: self.rows.iter().map(|row| row.block).collect(),
        };
        for (row_block_id, row) in self.rows.iter().enumerate() {
            for cell in &row.cells {
                let transpose_row = &mut transpose.rows[cell.block_id];
                transpose_row
                    .cells
                    .push(Cell::new(row_block_id, cell.position));
                transpose_row.nnz += row.block.size * transpose_row.block.size;
            }
        }
        compute_cumulative_nnz(&mut transpose.rows);
        transpose
    }
}

/// Lay out consecutive blocks of the given sizes starting at zero.
pub fn blocks_from_sizes(sizes: &[usize]) -> Vec<Block> {
    let mut position = 0;
    sizes
        .iter()
        .map(|&size| {
            let block = Block::new(size, position);
            position += size;
            block
        })
        .collect()
}

/// Refresh the running non-zero totals of `rows`.
pub fn compute_cumulative_nnz(rows: &mut [CompressedRow]) {
    let mut total = 0;
    for row in rows {
        total += row.nnz;
        row.cumulative_nnz = total;
    }
}
