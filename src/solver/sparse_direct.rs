//! Sparse-direct solve of the Schur complement based on sparse LU.
//!
//! Only usable on a single rank: the factorization sees the owned block,
//! which is the whole matrix when nothing is distributed.

use crate::error::{MfdError, Result};
use crate::sparse::CsrMatrix;
use faer::prelude::*;
use faer::sparse::{SparseColMat, Triplet};

use super::{FaceOperator, SchurSolver, SolveOutcome, SolveStatus};

/// Sparse LU service. Reports [`SolveStatus::Failed`] when run on more
/// than one rank.
#[derive(Debug, Clone, Copy, Default)]
pub struct SparseLu;

impl SchurSolver for SparseLu {
    fn solve(&self, op: &FaceOperator<'_>, rhs: &[f64]) -> SolveOutcome {
        if op.comm.num_ranks() > 1 {
            return SolveOutcome::failed(
                SolveStatus::Failed,
                0,
                "sparse LU needs the whole matrix on one rank",
            );
        }
        match solve_real_sparse_lu(&op.owned_block(), rhs) {
            Ok(x) => SolveOutcome::converged(x, 1),
            Err(e) => SolveOutcome::failed(SolveStatus::Failed, 0, e.to_string()),
        }
    }

    fn name(&self) -> &'static str {
        "sparse-lu"
    }
}

/// Solve a real-valued linear system with sparse LU on CPU.
pub fn solve_real_sparse_lu(a: &CsrMatrix<f64>, b: &[f64]) -> Result<Vec<f64>> {
    let n = a.nrows;
    if a.ncols != n || b.len() != n {
        return Err(MfdError::Solve(format!(
            "dimension mismatch: matrix is {}x{}, rhs length is {}",
            a.nrows,
            a.ncols,
            b.len()
        )));
    }
    if n == 0 {
        return Ok(Vec::new());
    }

    let mut triplets = Vec::with_capacity(a.values.len());
    for row in 0..n {
        for idx in a.row_pointers[row]..a.row_pointers[row + 1] {
            let val = a.values[idx];
            if !val.is_finite() {
                return Err(MfdError::Solve("sparse LU input contains NaN/Inf".into()));
            }
            triplets.push(Triplet::new(row, a.col_indices[idx], val));
        }
    }

    let a_sp = SparseColMat::<usize, f64>::try_new_from_triplets(n, n, &triplets)
        .map_err(|e| MfdError::Solve(format!("sparse matrix build failed: {e:?}")))?;

    let lu = a_sp
        .sp_lu()
        .map_err(|e| MfdError::Solve(format!("sparse LU factorization failed: {e:?}")))?;

    let rhs = faer::Mat::<f64>::from_fn(n, 1, |i, _| b[i]);
    let x = lu.solve(rhs);

    let out: Vec<f64> = (0..n).map(|i| x[(i, 0)]).collect();
    if out.iter().any(|v| !v.is_finite()) {
        return Err(MfdError::Solve("sparse LU produced NaN/Inf solution".into()));
    }
    tracing::debug!(n, nnz = a.nnz(), "sparse LU solve done");
    Ok(out)
}
