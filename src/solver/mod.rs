//! Solvers for the face-only Schur complement system.
//!
//! The operator hands a [`FaceOperator`] (the distributed `Sff` with its
//! halo plan) and a right-hand side to a [`SchurSolver`] and gets back a
//! status code plus, on success, the owned part of the solution.

pub mod bicgstab;
pub mod comm;
pub mod comm_threaded;
pub mod preconditioner;
pub mod sparse_direct;

use crate::mesh::HaloPlan;
use crate::sparse::CsrMatrix;
use comm::CommunicationBackend;

pub use bicgstab::BiCgStab;
pub use sparse_direct::SparseLu;

/// Distributed square operator over faces.
///
/// `matrix` has one row and column per used face; rows `0..n_owned` are the
/// owned rows, ghost rows are ignored.
pub struct FaceOperator<'a> {
    pub matrix: &'a CsrMatrix<f64>,
    pub n_owned: usize,
    pub halo: &'a HaloPlan,
    pub comm: &'a dyn CommunicationBackend,
}

impl FaceOperator<'_> {
    /// y = A x over owned rows, importing ghost entries of `x` first.
    pub fn apply(&self, x_owned: &[f64]) -> Vec<f64> {
        let mut x = vec![0.0; self.matrix.ncols];
        x[..self.n_owned].copy_from_slice(x_owned);
        self.halo.import(self.comm, &mut x);
        let mut y = self.matrix.spmv(&x);
        y.truncate(self.n_owned);
        y
    }

    /// Global dot product of two owned vectors.
    pub fn dot(&self, a: &[f64], b: &[f64]) -> f64 {
        self.comm
            .all_reduce_sum(a.iter().zip(b).map(|(x, y)| x * y).sum())
    }

    /// Diagonal of the owned rows.
    pub fn diagonal(&self) -> Vec<f64> {
        (0..self.n_owned).map(|i| self.matrix.get(i, i)).collect()
    }

    /// Owned×owned block, dropping couplings to ghost faces.
    pub fn owned_block(&self) -> CsrMatrix<f64> {
        let mut triplets = Vec::new();
        for row in 0..self.n_owned {
            for idx in self.matrix.row_pointers[row]..self.matrix.row_pointers[row + 1] {
                let col = self.matrix.col_indices[idx];
                if col < self.n_owned {
                    triplets.push((row, col, self.matrix.values[idx]));
                }
            }
        }
        CsrMatrix::from_triplets(self.n_owned, self.n_owned, &triplets)
    }
}

/// Outcome category of a solve. Codes are max-reduced across ranks, so a
/// larger code is a worse outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    Converged,
    MaxIterations,
    Breakdown,
    Failed,
}

impl SolveStatus {
    pub fn code(self) -> i32 {
        match self {
            SolveStatus::Converged => 0,
            SolveStatus::MaxIterations => 1,
            SolveStatus::Breakdown => 2,
            SolveStatus::Failed => 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SolveOutcome {
    pub status: SolveStatus,
    /// Owned face values; present when `status` is `Converged`.
    pub solution: Option<Vec<f64>>,
    pub iterations: usize,
    pub detail: String,
}

impl SolveOutcome {
    pub fn converged(solution: Vec<f64>, iterations: usize) -> Self {
        Self {
            status: SolveStatus::Converged,
            solution: Some(solution),
            iterations,
            detail: String::new(),
        }
    }

    pub fn failed(status: SolveStatus, iterations: usize, detail: impl Into<String>) -> Self {
        Self {
            status,
            solution: None,
            iterations,
            detail: detail.into(),
        }
    }
}

/// "Approximately solve `Sff·y = rhs`" service.
pub trait SchurSolver: Send + Sync {
    fn solve(&self, op: &FaceOperator<'_>, rhs: &[f64]) -> SolveOutcome;

    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use comm::SingleProcessComm;

    #[test]
    fn face_operator_drops_ghost_columns_from_owned_block() {
        // Two owned faces and one ghost.
        let m = CsrMatrix::from_triplets(
            3,
            3,
            &[(0, 0, 2.0), (0, 2, -1.0), (1, 1, 3.0), (1, 0, 1.0)],
        );
        let halo = HaloPlan::empty();
        let op = FaceOperator {
            matrix: &m,
            n_owned: 2,
            halo: &halo,
            comm: &SingleProcessComm,
        };
        assert_eq!(op.apply(&[1.0, 1.0]), vec![2.0, 4.0]);
        assert_eq!(op.diagonal(), vec![2.0, 3.0]);
        assert_eq!(op.owned_block().to_dense(), vec![vec![2.0, 0.0], vec![1.0, 3.0]]);
        assert_eq!(op.dot(&[1.0, 2.0], &[3.0, 4.0]), 11.0);
    }

    #[test]
    fn status_codes_are_ordered() {
        assert!(SolveStatus::Converged.code() < SolveStatus::MaxIterations.code());
        assert!(SolveStatus::Breakdown.code() < SolveStatus::Failed.code());
    }
}
