//! Elemental inverse mass matrices.
//!
//! For a cell with faces `f_1..f_n`, let `N` be the `n×d` matrix of outward
//! area-weighted normals and `R` the `n×d` matrix of vectors from the cell
//! centroid to the face centroids. Then `Rᵀ N = |c| I`, and any matrix of the
//! form
//!
//! ```text
//! W = N K Nᵀ / |c| + (stabilization vanishing on range(R))
//! ```
//!
//! reproduces the fluxes of every linear pressure field (`W R = N K`). The
//! methods below differ only in how they pick the stabilization.

use faer::{Mat, MatRef, Scale};

use crate::dense::{self, Tensor};
use crate::error::{MfdError, Result};
use crate::mesh::{scale, sub, MeshTopology};

/// Construction used for the elemental inverse mass matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MfdMethod {
    /// Consistent matrix with scalar stabilization; any polygon/polyhedron.
    #[default]
    Standard,
    /// Diagonal two-point flux approximation. Consistent only on
    /// K-orthogonal meshes.
    TwoPoint,
    /// Consistent matrix stabilized by the projected two-point diagonal,
    /// kept only when it is an M-matrix. Quadrilaterals and hexahedra.
    HexMonotone,
    /// Mass matrix built in flux space and inverted by Cholesky.
    SupportOperator,
}

/// Count of elemental matrices built with the requested method versus
/// those that fell back to [`MfdMethod::Standard`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ElementalTally {
    pub accepted: usize,
    pub fallback: usize,
}

impl ElementalTally {
    pub fn total(&self) -> usize {
        self.accepted + self.fallback
    }
}

/// How an elemental matrix was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    Accepted,
    Fallback,
}

/// Local geometry of one cell.
struct CellFrame {
    volume: f64,
    /// Outward area-weighted normals, one row per face.
    normals: Mat<f64>,
    /// Centroid-to-face-centroid vectors, one row per face.
    arms: Mat<f64>,
    areas: Vec<f64>,
}

fn cell_frame<M: MeshTopology>(mesh: &M, c: usize) -> Result<CellFrame> {
    let dim = mesh.space_dimension();
    let faces = mesh.cell_faces(c);
    let dirs = mesh.cell_face_dirs(c);
    let volume = mesh.cell_volume(c);
    if volume.is_nan() || volume <= 0.0 {
        return Err(MfdError::MalformedCell {
            cell: c,
            reason: format!("non-positive volume {volume}"),
        });
    }
    let xc = mesh.cell_centroid(c);
    let mut normals = Mat::zeros(faces.len(), dim);
    let mut arms = Mat::zeros(faces.len(), dim);
    let mut areas = Vec::with_capacity(faces.len());
    for (i, (&f, &dir)) in faces.iter().zip(dirs).enumerate() {
        let n = scale(&mesh.face_normal(f), dir as f64);
        let r = sub(&mesh.face_centroid(f), &xc);
        for k in 0..dim {
            normals[(i, k)] = n[k];
            arms[(i, k)] = r[k];
        }
        areas.push(mesh.face_area(f));
    }
    Ok(CellFrame {
        volume,
        normals,
        arms,
        areas,
    })
}

fn malformed(cell: usize, reason: &str) -> MfdError {
    MfdError::MalformedCell {
        cell,
        reason: reason.to_string(),
    }
}

/// `I − A (AᵀA)⁻¹ Aᵀ`, the orthogonal projector onto range(A)ᗮ.
fn complement_projector(a: MatRef<'_, f64>, cell: usize) -> Result<Mat<f64>> {
    let gram = a.transpose() * a;
    let g = dense::solve_spd(gram.as_ref(), a.transpose())
        .ok_or_else(|| malformed(cell, "degenerate face geometry"))?;
    Ok(Mat::<f64>::identity(a.nrows(), a.nrows()) - a * &g)
}

/// `N K Nᵀ / |c|`
fn consistency_term(frame: &CellFrame, k: &Tensor) -> Mat<f64> {
    &frame.normals * k.matrix() * frame.normals.transpose() * Scale(1.0 / frame.volume)
}

fn standard(frame: &CellFrame, k: &Tensor, cell: usize) -> Result<Mat<f64>> {
    let w = consistency_term(frame, k);
    let gamma = 2.0 * dense::trace(w.as_ref()) / frame.areas.len() as f64;
    let stab = complement_projector(frame.arms.as_ref(), cell)?;
    Ok(w + stab * Scale(gamma))
}

/// Two-point transmissibilities `|f| (n̂ᵀ K n̂) / d`.
fn two_point_diagonal(frame: &CellFrame, k: &Tensor, cell: usize) -> Result<Vec<f64>> {
    let dim = k.dim();
    (0..frame.areas.len())
        .map(|i| {
            let area = frame.areas[i];
            let n: Vec<f64> = (0..dim).map(|j| frame.normals[(i, j)] / area).collect();
            let d = (0..dim)
                .map(|j| frame.arms[(i, j)] * n[j])
                .sum::<f64>()
                .abs();
            if d.is_nan() || d <= 1e-14 * area.max(1.0) {
                return Err(malformed(cell, "cell centroid lies on a face plane"));
            }
            Ok(area * k.bilinear(&n, &n) / d)
        })
        .collect()
}

fn hex_monotone(frame: &CellFrame, k: &Tensor, cell: usize) -> Result<Option<Mat<f64>>> {
    let diag = two_point_diagonal(frame, k, cell)?;
    let p = complement_projector(frame.arms.as_ref(), cell)?;
    let w = consistency_term(frame, k) + &p * dense::diagonal(&diag) * &p;

    let tol = 1e-12 * w.norm_max();
    let monotone = (0..w.nrows()).all(|i| (0..w.ncols()).all(|j| i == j || w[(i, j)] <= tol));
    Ok(monotone.then_some(w))
}

fn support_operator(frame: &CellFrame, kinv: MatRef<'_, f64>, cell: usize) -> Result<Mat<f64>> {
    let m = &frame.arms * kinv * frame.arms.transpose() * Scale(1.0 / frame.volume);
    let gamma = 2.0 * dense::trace(m.as_ref()) / frame.areas.len() as f64;
    let stab = complement_projector(frame.normals.as_ref(), cell)?;
    let m = m + stab * Scale(gamma);
    dense::inverse_spd(m.as_ref())
        .ok_or_else(|| malformed(cell, "mass matrix is not positive definite"))
}

fn is_hex_like(dim: usize, nfaces: usize) -> bool {
    nfaces == 2 * dim
}

/// Inverse mass matrix of owned cell `c` for permeability `k`.
pub fn mass_inverse<M: MeshTopology>(
    mesh: &M,
    c: usize,
    k: &Tensor,
    method: MfdMethod,
) -> Result<(Mat<f64>, Acceptance)> {
    let dim = mesh.space_dimension();
    if k.dim() != dim {
        return Err(malformed(c, "tensor dimension does not match the mesh"));
    }
    let kinv = k
        .inverse()
        .ok_or_else(|| malformed(c, "permeability tensor is not symmetric positive definite"))?;
    let frame = cell_frame(mesh, c)?;

    let w = match method {
        MfdMethod::Standard => (standard(&frame, k, c)?, Acceptance::Accepted),
        MfdMethod::TwoPoint => (
            dense::diagonal(&two_point_diagonal(&frame, k, c)?),
            Acceptance::Accepted,
        ),
        MfdMethod::HexMonotone if is_hex_like(dim, frame.areas.len()) => {
            match hex_monotone(&frame, k, c)? {
                Some(w) => (w, Acceptance::Accepted),
                None => (standard(&frame, k, c)?, Acceptance::Fallback),
            }
        }
        MfdMethod::HexMonotone => (standard(&frame, k, c)?, Acceptance::Fallback),
        MfdMethod::SupportOperator => {
            (support_operator(&frame, kinv.as_ref(), c)?, Acceptance::Accepted)
        }
    };

    let (mut w, acceptance) = w;
    if !dense::all_finite(w.as_ref()) {
        return Err(malformed(c, "non-finite elemental matrix"));
    }
    dense::symmetrize(&mut w);
    Ok((w, acceptance))
}

/// Consistency defect `max |W R − N K|` of an elemental matrix, for
/// diagnostics and tests.
pub fn consistency_defect<M: MeshTopology>(
    mesh: &M,
    c: usize,
    k: &Tensor,
    w: MatRef<'_, f64>,
) -> Result<f64> {
    let frame = cell_frame(mesh, c)?;
    Ok((w * &frame.arms - &frame.normals * k.matrix()).norm_max())
}

/// Flux `−K ∇p · N_f` out of face `f` of cell `c` for a linear pressure
/// with gradient `grad`, as reproduced by the elemental matrix.
pub fn linear_field_fluxes<M: MeshTopology>(
    mesh: &M,
    c: usize,
    w: MatRef<'_, f64>,
    grad: &[f64],
) -> Vec<f64> {
    let xc = mesh.cell_centroid(c);
    let drops: Vec<f64> = mesh
        .cell_faces(c)
        .iter()
        .map(|&f| {
            let r = sub(&mesh.face_centroid(f), &xc);
            -(r.iter().zip(grad).map(|(a, b)| a * b).sum::<f64>())
        })
        .collect();
    dense::matvec(w, &drops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{PolyMesh, Point};
    use approx::assert_abs_diff_eq;

    fn oriented_normal<M: MeshTopology>(mesh: &M, c: usize, i: usize) -> Point {
        let f = mesh.cell_faces(c)[i];
        scale(&mesh.face_normal(f), mesh.cell_face_dirs(c)[i] as f64)
    }

    #[test]
    fn unit_square_matrices_agree() {
        let mesh = PolyMesh::quad_grid(1, 1, (0.0, 1.0), (0.0, 1.0)).unwrap();
        let k = Tensor::isotropic(2, 1.0);
        for method in [
            MfdMethod::Standard,
            MfdMethod::TwoPoint,
            MfdMethod::HexMonotone,
            MfdMethod::SupportOperator,
        ] {
            let (w, acc) = mass_inverse(&mesh, 0, &k, method).unwrap();
            assert_eq!(acc, Acceptance::Accepted);
            for i in 0..4 {
                for j in 0..4 {
                    let expect = if i == j { 2.0 } else { 0.0 };
                    assert_abs_diff_eq!(w[(i, j)], expect, epsilon = 1e-12);
                }
            }
        }
    }

    #[test]
    fn consistent_methods_reproduce_linear_fluxes() {
        let mesh =
            PolyMesh::perturbed_quad_grid(3, 3, (0.0, 1.0), (0.0, 1.0), 0.3, 5, &[]).unwrap();
        let k = Tensor::full(2, &[2.0, 0.3, 0.3, 0.7]);
        let grad = [0.4, -1.3];
        for method in [MfdMethod::Standard, MfdMethod::SupportOperator] {
            for c in 0..9 {
                let (w, _) = mass_inverse(&mesh, c, &k, method).unwrap();
                assert!(consistency_defect(&mesh, c, &k, w.as_ref()).unwrap() < 1e-12);
                assert!(dense::symmetric_defect(w.as_ref()) < 1e-12);
                let q = linear_field_fluxes(&mesh, c, w.as_ref(), &grad);
                let kg = k.apply(&grad);
                for (i, qi) in q.iter().enumerate() {
                    let n = oriented_normal(&mesh, c, i);
                    let exact = -(kg[0] * n[0] + kg[1] * n[1]);
                    assert_abs_diff_eq!(*qi, exact, epsilon = 1e-11);
                }
            }
        }
    }

    #[test]
    fn hex_monotone_falls_back_on_strong_anisotropy() {
        let mesh = PolyMesh::quad_grid(1, 1, (0.0, 1.0), (0.0, 1.0)).unwrap();
        // Rotated, strongly anisotropic tensor: the consistent term has
        // positive off-diagonals that no diagonal stabilization removes.
        let k = Tensor::full(2, &[5.5, 4.5, 4.5, 5.5]);
        let (_, acc) = mass_inverse(&mesh, 0, &k, MfdMethod::HexMonotone).unwrap();
        assert_eq!(acc, Acceptance::Fallback);
    }

    #[test]
    fn hex_grid_two_point_matches_standard() {
        let mesh = PolyMesh::hex_grid(1, 1, 1, (0.0, 2.0), (0.0, 1.0), (0.0, 1.0)).unwrap();
        let k = Tensor::diagonal(&[1.0, 2.0, 3.0]);
        let (tp, _) = mass_inverse(&mesh, 0, &k, MfdMethod::TwoPoint).unwrap();
        let (st, _) = mass_inverse(&mesh, 0, &k, MfdMethod::HexMonotone).unwrap();
        // x-faces: area 1, distance 1 -> K_xx; z-faces: area 2, distance 0.5.
        assert_abs_diff_eq!(tp[(0, 0)], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(tp[(4, 4)], 12.0, epsilon = 1e-12);
        assert!(consistency_defect(&mesh, 0, &k, st.as_ref()).unwrap() < 1e-12);
        assert!(consistency_defect(&mesh, 0, &k, tp.as_ref()).unwrap() < 1e-12);
    }

    #[test]
    fn indefinite_tensor_is_fatal() {
        let mesh = PolyMesh::quad_grid(1, 1, (0.0, 1.0), (0.0, 1.0)).unwrap();
        let k = Tensor::full(2, &[1.0, 2.0, 2.0, 1.0]);
        let err = mass_inverse(&mesh, 0, &k, MfdMethod::Standard).unwrap_err();
        assert!(matches!(err, MfdError::MalformedCell { cell: 0, .. }));
    }

    #[test]
    fn wrong_tensor_dimension_is_fatal() {
        let mesh = PolyMesh::quad_grid(1, 1, (0.0, 1.0), (0.0, 1.0)).unwrap();
        let k = Tensor::isotropic(3, 1.0);
        assert!(mass_inverse(&mesh, 0, &k, MfdMethod::TwoPoint).is_err());
    }
}
