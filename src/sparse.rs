//! Compressed Sparse Row (CSR) matrix and its symbolic builder.
//!
//! The face×face (`Aff`, `Sff`) and cell×face (`Acf`, `Afc`) blocks share
//! this representation. Their non-zero pattern is produced once by a
//! [`SparsityPattern`] and only the `values` array is rewritten afterwards.

use std::collections::BTreeSet;
use std::ops::AddAssign;

/// Sparse matrix in Compressed Sparse Row format.
#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix<T> {
    pub nrows: usize,
    pub ncols: usize,
    /// Non-zero values, stored row by row.
    pub values: Vec<T>,
    /// Column index for each non-zero value, sorted within a row.
    pub col_indices: Vec<usize>,
    /// `row_pointers[i]` is the index into values/col_indices where row i starts.
    /// `row_pointers[nrows]` = total number of non-zeros.
    pub row_pointers: Vec<usize>,
}

impl<T: Copy + Default + AddAssign> CsrMatrix<T> {
    /// Create an empty matrix with no non-zero entries.
    pub fn new(nrows: usize, ncols: usize) -> Self {
        Self {
            nrows,
            ncols,
            values: Vec::new(),
            col_indices: Vec::new(),
            row_pointers: vec![0; nrows + 1],
        }
    }

    /// Number of non-zero entries.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Build CSR matrix from (row, col, value) triplets.
    /// Duplicate entries at the same (row, col) are summed.
    pub fn from_triplets(nrows: usize, ncols: usize, triplets: &[(usize, usize, T)]) -> Self {
        if triplets.is_empty() {
            return Self::new(nrows, ncols);
        }

        let mut indices: Vec<usize> = (0..triplets.len()).collect();
        indices.sort_by_key(|&i| (triplets[i].0, triplets[i].1));

        let mut values = Vec::with_capacity(triplets.len());
        let mut col_indices = Vec::with_capacity(triplets.len());
        let mut row_pointers = vec![0usize; nrows + 1];

        let first = indices[0];
        let mut cur_row = triplets[first].0;
        let mut cur_col = triplets[first].1;
        let mut cur_val = triplets[first].2;

        for &idx in &indices[1..] {
            let (row, col, val) = triplets[idx];
            if row == cur_row && col == cur_col {
                cur_val += val;
            } else {
                values.push(cur_val);
                col_indices.push(cur_col);
                row_pointers[cur_row + 1] += 1;
                cur_row = row;
                cur_col = col;
                cur_val = val;
            }
        }
        values.push(cur_val);
        col_indices.push(cur_col);
        row_pointers[cur_row + 1] += 1;

        for i in 1..=nrows {
            row_pointers[i] += row_pointers[i - 1];
        }

        Self {
            nrows,
            ncols,
            values,
            col_indices,
            row_pointers,
        }
    }

    /// Convert to dense matrix (row-major). For testing and small matrices only.
    pub fn to_dense(&self) -> Vec<Vec<T>> {
        let mut dense = vec![vec![T::default(); self.ncols]; self.nrows];
        for row in 0..self.nrows {
            for idx in self.row_pointers[row]..self.row_pointers[row + 1] {
                dense[row][self.col_indices[idx]] = self.values[idx];
            }
        }
        dense
    }

    /// Index into `values` of entry (row, col), if it is part of the pattern.
    pub fn position(&self, row: usize, col: usize) -> Option<usize> {
        let start = self.row_pointers[row];
        let end = self.row_pointers[row + 1];
        self.col_indices[start..end]
            .binary_search(&col)
            .ok()
            .map(|offset| start + offset)
    }

    /// Value at (row, col); entries outside the pattern read as zero.
    pub fn get(&self, row: usize, col: usize) -> T {
        self.position(row, col)
            .map(|idx| self.values[idx])
            .unwrap_or_default()
    }

    /// Overwrite every stored value, keeping the pattern.
    pub fn put_scalar(&mut self, value: T) {
        self.values.iter_mut().for_each(|v| *v = value);
    }

    /// Set every stored diagonal entry to `value`.
    pub fn set_diagonal(&mut self, value: T) {
        for row in 0..self.nrows.min(self.ncols) {
            if let Some(idx) = self.position(row, row) {
                self.values[idx] = value;
            }
        }
    }

    /// Zero all stored values of one row.
    pub fn zero_row(&mut self, row: usize) {
        let (start, end) = (self.row_pointers[row], self.row_pointers[row + 1]);
        self.values[start..end]
            .iter_mut()
            .for_each(|v| *v = T::default());
    }
}

impl CsrMatrix<f64> {
    /// Sparse matrix-vector multiply: y = A * x
    pub fn spmv(&self, x: &[f64]) -> Vec<f64> {
        assert_eq!(x.len(), self.ncols, "spmv dimension mismatch");
        let mut y = vec![0.0; self.nrows];
        for row in 0..self.nrows {
            let mut sum = 0.0;
            for idx in self.row_pointers[row]..self.row_pointers[row + 1] {
                sum += self.values[idx] * x[self.col_indices[idx]];
            }
            y[row] = sum;
        }
        y
    }

    /// Transposed multiply: y = Aᵀ * x, with `x` indexed by rows.
    pub fn spmv_transpose(&self, x: &[f64]) -> Vec<f64> {
        assert_eq!(x.len(), self.nrows, "spmv_transpose dimension mismatch");
        let mut y = vec![0.0; self.ncols];
        for row in 0..self.nrows {
            for idx in self.row_pointers[row]..self.row_pointers[row + 1] {
                y[self.col_indices[idx]] += self.values[idx] * x[row];
            }
        }
        y
    }

    /// Largest |A(i,j) − A(j,i)| over the leading `n`×`n` block.
    pub fn symmetry_defect(&self, n: usize) -> f64 {
        let mut defect: f64 = 0.0;
        for row in 0..n.min(self.nrows) {
            for idx in self.row_pointers[row]..self.row_pointers[row + 1] {
                let col = self.col_indices[idx];
                if col < n {
                    defect = defect.max((self.values[idx] - self.get(col, row)).abs());
                }
            }
        }
        defect
    }
}

/// Symbolic builder of a CSR non-zero pattern.
///
/// Rows collect column indices; `finalize` freezes them into a zero-valued
/// [`CsrMatrix`] whose pattern never changes afterwards.
#[derive(Debug, Clone)]
pub struct SparsityPattern {
    nrows: usize,
    ncols: usize,
    rows: Vec<BTreeSet<usize>>,
}

impl SparsityPattern {
    pub fn new(nrows: usize, ncols: usize) -> Self {
        Self {
            nrows,
            ncols,
            rows: vec![BTreeSet::new(); nrows],
        }
    }

    /// Register entries (row, col) for every col in `cols`.
    pub fn insert(&mut self, row: usize, cols: &[usize]) {
        debug_assert!(row < self.nrows);
        for &col in cols {
            debug_assert!(col < self.ncols);
            self.rows[row].insert(col);
        }
    }

    /// Register the dense block `indices × indices`.
    pub fn insert_block(&mut self, indices: &[usize]) {
        for &row in indices {
            self.insert(row, indices);
        }
    }

    pub fn finalize(self) -> CsrMatrix<f64> {
        let mut row_pointers = Vec::with_capacity(self.nrows + 1);
        let mut col_indices = Vec::new();
        row_pointers.push(0);
        for row in &self.rows {
            col_indices.extend(row.iter().copied());
            row_pointers.push(col_indices.len());
        }
        CsrMatrix {
            nrows: self.nrows,
            ncols: self.ncols,
            values: vec![0.0; col_indices.len()],
            col_indices,
            row_pointers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_matrix() {
        let m: CsrMatrix<f64> = CsrMatrix::new(3, 3);
        assert_eq!(m.nnz(), 0);
        assert_eq!(m.row_pointers, vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_from_triplets_duplicates_summed() {
        let triplets = vec![(0, 0, 1.0), (0, 0, 2.0), (1, 1, 3.0)];
        let m = CsrMatrix::from_triplets(2, 2, &triplets);
        assert_eq!(m.nnz(), 2);
        assert_eq!(m.to_dense(), vec![vec![3.0, 0.0], vec![0.0, 3.0]]);
    }

    #[test]
    fn test_spmv_and_transpose() {
        // [[2, 1], [0, 3]]
        let m = CsrMatrix::from_triplets(2, 2, &[(0, 0, 2.0), (0, 1, 1.0), (1, 1, 3.0)]);
        assert_eq!(m.spmv(&[1.0, 2.0]), vec![4.0, 6.0]);
        assert_eq!(m.spmv_transpose(&[1.0, 2.0]), vec![2.0, 7.0]);
    }

    #[test]
    fn pattern_is_sorted_and_deduplicated() {
        let mut p = SparsityPattern::new(3, 4);
        p.insert(0, &[3, 1, 1]);
        p.insert_block(&[2, 0]);
        let m = p.finalize();
        assert_eq!(m.row_pointers, vec![0, 4, 4, 6]);
        assert_eq!(m.col_indices, vec![0, 1, 2, 3, 0, 2]);
        assert!(m.values.iter().all(|&v| v == 0.0));
        assert_eq!(m.position(0, 3), Some(3));
        assert_eq!(m.position(1, 0), None);
    }

    #[test]
    fn zero_then_unit_diagonal() {
        let mut m = CsrMatrix::from_triplets(
            3,
            3,
            &[(0, 0, 5.0), (0, 2, -1.0), (1, 1, 2.0), (2, 0, -1.0), (2, 2, 7.0)],
        );
        m.put_scalar(0.0);
        m.set_diagonal(1.0);
        assert_eq!(
            m.to_dense(),
            vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0], vec![0.0, 0.0, 1.0]]
        );
    }

    #[test]
    fn symmetry_defect_detects_asymmetry() {
        let m = CsrMatrix::from_triplets(2, 2, &[(0, 0, 1.0), (0, 1, 2.0), (1, 0, 2.5)]);
        assert!((m.symmetry_defect(2) - 0.5).abs() < 1e-15);
    }
}
