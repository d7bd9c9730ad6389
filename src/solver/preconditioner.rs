//! Preconditioners for the distributed Schur complement.
//!
//! Both act on the owned block only (block Jacobi across ranks), so their
//! application needs no communication.

use super::FaceOperator;
use crate::sparse::CsrMatrix;

/// output = M⁻¹ · input, on owned entries.
pub trait Preconditioner: Send + Sync {
    fn apply(&self, input: &[f64]) -> Vec<f64>;
}

/// Inverse of the diagonal. Zero diagonals are treated as one.
pub struct Jacobi {
    inv_diag: Vec<f64>,
}

impl Jacobi {
    pub fn new(op: &FaceOperator<'_>) -> Self {
        let inv_diag = op
            .diagonal()
            .into_iter()
            .map(|d| if d.abs() < 1e-300 { 1.0 } else { 1.0 / d })
            .collect();
        Self { inv_diag }
    }
}

impl Preconditioner for Jacobi {
    fn apply(&self, input: &[f64]) -> Vec<f64> {
        input.iter().zip(&self.inv_diag).map(|(r, d)| r * d).collect()
    }
}

/// Zero fill-in incomplete LU of the owned block, in place on a CSR copy.
///
/// The strictly lower part holds L (unit diagonal implied), the rest holds U.
pub struct BlockIlu0 {
    factors: CsrMatrix<f64>,
    diag_pos: Vec<usize>,
}

impl BlockIlu0 {
    pub fn new(op: &FaceOperator<'_>) -> Self {
        let mut a = op.owned_block();
        let n = a.nrows;
        let mut diag_pos = Vec::with_capacity(n);
        // Every row needs a stored diagonal for the factorization.
        let missing: Vec<usize> = (0..n).filter(|&i| a.position(i, i).is_none()).collect();
        if !missing.is_empty() {
            let mut triplets: Vec<(usize, usize, f64)> = Vec::with_capacity(a.nnz() + missing.len());
            for row in 0..n {
                for idx in a.row_pointers[row]..a.row_pointers[row + 1] {
                    triplets.push((row, a.col_indices[idx], a.values[idx]));
                }
            }
            triplets.extend(missing.iter().map(|&i| (i, i, 0.0)));
            a = CsrMatrix::from_triplets(n, n, &triplets);
        }
        for i in 0..n {
            diag_pos.push(a.position(i, i).unwrap_or(a.row_pointers[i]));
        }

        for i in 0..n {
            let (start, end) = (a.row_pointers[i], a.row_pointers[i + 1]);
            for kk in start..end {
                let k = a.col_indices[kk];
                if k >= i {
                    break;
                }
                let pivot = pivot_value(a.values[diag_pos[k]]);
                a.values[kk] /= pivot;
                let lik = a.values[kk];
                for jj in (kk + 1)..end {
                    let j = a.col_indices[jj];
                    if let Some(kj) = a.position(k, j) {
                        a.values[jj] -= lik * a.values[kj];
                    }
                }
            }
        }
        Self {
            factors: a,
            diag_pos,
        }
    }
}

fn pivot_value(d: f64) -> f64 {
    if d.abs() < 1e-300 {
        1.0
    } else {
        d
    }
}

impl Preconditioner for BlockIlu0 {
    fn apply(&self, input: &[f64]) -> Vec<f64> {
        let a = &self.factors;
        let n = a.nrows;
        let mut y = input.to_vec();
        for i in 0..n {
            let mut sum = y[i];
            for idx in a.row_pointers[i]..self.diag_pos[i] {
                sum -= a.values[idx] * y[a.col_indices[idx]];
            }
            y[i] = sum;
        }
        for i in (0..n).rev() {
            let mut sum = y[i];
            for idx in (self.diag_pos[i] + 1)..a.row_pointers[i + 1] {
                sum -= a.values[idx] * y[a.col_indices[idx]];
            }
            y[i] = sum / pivot_value(a.values[self.diag_pos[i]]);
        }
        y
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::HaloPlan;
    use crate::solver::comm::SingleProcessComm;
    use approx::assert_abs_diff_eq;

    fn tridiagonal(n: usize) -> CsrMatrix<f64> {
        let mut t = Vec::new();
        for i in 0..n {
            t.push((i, i, 4.0));
            if i > 0 {
                t.push((i, i - 1, -1.0));
            }
            if i + 1 < n {
                t.push((i, i + 1, -1.0));
            }
        }
        CsrMatrix::from_triplets(n, n, &t)
    }

    #[test]
    fn ilu0_is_exact_for_tridiagonal() {
        // No fill-in is dropped for a tridiagonal matrix.
        let m = tridiagonal(6);
        let halo = HaloPlan::empty();
        let op = FaceOperator {
            matrix: &m,
            n_owned: 6,
            halo: &halo,
            comm: &SingleProcessComm,
        };
        let ilu = BlockIlu0::new(&op);
        let b = vec![1.0, -2.0, 0.5, 3.0, 0.0, 1.0];
        let x = ilu.apply(&b);
        let ax = m.spmv(&x);
        for (l, r) in ax.iter().zip(&b) {
            assert_abs_diff_eq!(l, r, epsilon = 1e-12);
        }
    }

    #[test]
    fn jacobi_scales_by_inverse_diagonal() {
        let m = tridiagonal(3);
        let halo = HaloPlan::empty();
        let op = FaceOperator {
            matrix: &m,
            n_owned: 3,
            halo: &halo,
            comm: &SingleProcessComm,
        };
        assert_eq!(Jacobi::new(&op).apply(&[4.0, 8.0, -4.0]), vec![1.0, 2.0, -1.0]);
    }
}
