//! Small dense matrices for elemental blocks and permeability tensors.
//!
//! Everything here is a [`faer::Mat`] sized by the number of faces of one
//! cell (or the space dimension). The helpers only cover what faer does not
//! spell out directly.

use faer::prelude::*;
use faer::{Col, ColRef, Mat, MatRef, Scale, Side};

/// Square matrix with `diag` on the diagonal.
pub fn diagonal(diag: &[f64]) -> Mat<f64> {
    let n = diag.len();
    Mat::from_fn(n, n, |i, j| if i == j { diag[i] } else { 0.0 })
}

pub fn trace(m: MatRef<'_, f64>) -> f64 {
    (0..m.nrows().min(m.ncols())).map(|i| m[(i, i)]).sum()
}

/// `m · x` for a plain slice.
pub fn matvec(m: MatRef<'_, f64>, x: &[f64]) -> Vec<f64> {
    let y: Col<f64> = m * ColRef::from_slice(x);
    y.iter().copied().collect()
}

pub fn all_finite(m: MatRef<'_, f64>) -> bool {
    (0..m.ncols()).all(|j| (0..m.nrows()).all(|i| m[(i, j)].is_finite()))
}

/// Replace a square matrix by its symmetric part.
pub fn symmetrize(m: &mut Mat<f64>) {
    *m = (m.as_ref() + m.transpose()) * Scale(0.5);
}

/// Largest |A(i,j) − A(j,i)|.
pub fn symmetric_defect(m: MatRef<'_, f64>) -> f64 {
    (m - m.transpose()).norm_max()
}

/// Solve `a · X = rhs` for symmetric positive-definite `a`.
///
/// Returns `None` when the Cholesky factorization breaks down.
pub fn solve_spd(a: MatRef<'_, f64>, rhs: MatRef<'_, f64>) -> Option<Mat<f64>> {
    if a.nrows() != a.ncols() || rhs.nrows() != a.nrows() {
        return None;
    }
    let x = a.llt(Side::Lower).ok()?.solve(rhs);
    all_finite(x.as_ref()).then_some(x)
}

/// Inverse of a symmetric positive-definite matrix.
pub fn inverse_spd(a: MatRef<'_, f64>) -> Option<Mat<f64>> {
    solve_spd(a, Mat::<f64>::identity(a.nrows(), a.nrows()).as_ref())
}

/// Permeability (hydraulic conductivity) tensor of one cell.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    values: Mat<f64>,
}

impl Tensor {
    pub fn isotropic(dim: usize, k: f64) -> Self {
        Self {
            values: Mat::<f64>::identity(dim, dim) * Scale(k),
        }
    }

    pub fn diagonal(diag: &[f64]) -> Self {
        Self {
            values: diagonal(diag),
        }
    }

    /// Full tensor from row-major entries; symmetry is the caller's business.
    pub fn full(dim: usize, entries: &[f64]) -> Self {
        assert_eq!(entries.len(), dim * dim, "tensor entry count mismatch");
        Self {
            values: Mat::from_fn(dim, dim, |i, j| entries[i * dim + j]),
        }
    }

    pub fn dim(&self) -> usize {
        self.values.nrows()
    }

    pub fn matrix(&self) -> MatRef<'_, f64> {
        self.values.as_ref()
    }

    /// K·v for a vector of length `dim`.
    pub fn apply(&self, v: &[f64]) -> Vec<f64> {
        matvec(self.matrix(), &v[..self.dim()])
    }

    /// vᵀ K w.
    pub fn bilinear(&self, v: &[f64], w: &[f64]) -> f64 {
        self.apply(v).iter().zip(w).map(|(a, b)| a * b).sum()
    }

    /// K⁻¹, or `None` if the tensor is not symmetric positive-definite.
    pub fn inverse(&self) -> Option<Mat<f64>> {
        let scale = self.values.norm_max().max(1.0);
        if symmetric_defect(self.matrix()) > 1e-12 * scale {
            return None;
        }
        inverse_spd(self.matrix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn spd_solve_matches_known_inverse() {
        let a = Mat::from_fn(2, 2, |i, j| [[4.0, 1.0], [1.0, 3.0]][i][j]);
        let inv = inverse_spd(a.as_ref()).expect("SPD matrix");
        let id = &a * &inv;
        for i in 0..2 {
            for j in 0..2 {
                let e = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(id[(i, j)], e, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn indefinite_matrix_is_rejected() {
        let a = Mat::from_fn(2, 2, |i, j| [[1.0, 2.0], [2.0, 1.0]][i][j]);
        assert!(inverse_spd(a.as_ref()).is_none());
    }

    #[test]
    fn tensor_inverse_and_bilinear_form() {
        let k = Tensor::full(2, &[2.0, 0.5, 0.5, 1.0]);
        let kinv = k.inverse().expect("SPD tensor");
        let prod = k.matrix() * &kinv;
        assert_abs_diff_eq!(prod[(0, 0)], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(prod[(0, 1)], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(k.bilinear(&[1.0, 0.0], &[0.0, 1.0]), 0.5, epsilon = 1e-15);
    }

    #[test]
    fn non_symmetric_tensor_has_no_inverse() {
        let k = Tensor::full(2, &[2.0, 0.5, 0.0, 1.0]);
        assert!(k.inverse().is_none());
    }

    #[test]
    fn symmetrize_keeps_the_symmetric_part() {
        let mut m = Mat::from_fn(2, 2, |i, j| [[1.0, 3.0], [1.0, 2.0]][i][j]);
        assert_abs_diff_eq!(symmetric_defect(m.as_ref()), 2.0, epsilon = 1e-15);
        symmetrize(&mut m);
        assert_eq!(m[(0, 1)], 2.0);
        assert_eq!(m[(1, 0)], 2.0);
        assert_abs_diff_eq!(trace(m.as_ref()), 3.0, epsilon = 1e-15);
    }
}
