//! Face flux and cell velocity reconstruction.

use rayon::prelude::*;

use super::condensation::ElementalBlock;
use super::FlowVector;
use faer::Mat;

use crate::dense;
use crate::error::{MfdError, Result};
use crate::mesh::{MeshTopology, Ownership, Point};
use crate::solver::comm::CommunicationBackend;

/// Owned face values widened to all used faces, ghosts imported.
pub(crate) fn used_face_values<M: MeshTopology>(
    mesh: &M,
    comm: &dyn CommunicationBackend,
    owned: &[f64],
) -> Vec<f64> {
    let mut used = vec![0.0; mesh.num_faces(Ownership::Used)];
    used[..owned.len()].copy_from_slice(owned);
    mesh.face_halo().import(comm, &mut used);
    used
}

/// One flux per owned face, along the face's global normal.
///
/// `blocks` must be the elemental blocks before any boundary condition was
/// applied. Each face takes its value from the first owned cell that
/// touches it, so interior faces are single-valued.
pub fn derive_darcy_flux<M: MeshTopology>(
    mesh: &M,
    comm: &dyn CommunicationBackend,
    blocks: &[ElementalBlock],
    solution: &FlowVector,
) -> Vec<f64> {
    let n_owned = mesh.num_faces(Ownership::Owned);
    let lambda = used_face_values(mesh, comm, &solution.faces);
    let mut flux = vec![0.0; n_owned];
    let mut visited = vec![false; n_owned];

    for (c, block) in blocks.iter().enumerate() {
        let faces = mesh.cell_faces(c);
        let dirs = mesh.cell_face_dirs(c);
        let local: Vec<f64> = faces.iter().map(|&f| lambda[f]).collect();
        let out = block.face_fluxes(solution.cells[c], &local);
        for (n, &f) in faces.iter().enumerate() {
            if f < n_owned && !visited[f] {
                flux[f] = out[n] * f64::from(dirs[n]);
                visited[f] = true;
            }
        }
    }
    flux
}

/// Least-squares velocity per owned cell from its face fluxes:
/// `(Σ N Nᵀ) v = Σ N q`, with `N` the area-weighted face normals.
///
/// The fit does not reproduce the face fluxes exactly on general cells.
pub fn derive_darcy_velocity<M: MeshTopology>(
    mesh: &M,
    comm: &dyn CommunicationBackend,
    flux: &[f64],
) -> Result<Vec<Point>> {
    let dim = mesh.space_dimension();
    let q = used_face_values(mesh, comm, flux);
    (0..mesh.num_cells(Ownership::Owned))
        .into_par_iter()
        .map(|c| {
            let mut matrix = Mat::<f64>::zeros(dim, dim);
            let mut rhs = Mat::<f64>::zeros(dim, 1);
            for &f in mesh.cell_faces(c) {
                let normal = mesh.face_normal(f);
                for i in 0..dim {
                    for j in 0..dim {
                        matrix[(i, j)] += normal[i] * normal[j];
                    }
                    rhs[(i, 0)] += normal[i] * q[f];
                }
            }
            let v = dense::solve_spd(matrix.as_ref(), rhs.as_ref()).ok_or_else(|| MfdError::MalformedCell {
                cell: c,
                reason: "face normals do not span the space".into(),
            })?;
            let mut out = [0.0; 3];
            for (i, slot) in out.iter_mut().enumerate().take(dim) {
                *slot = v[(i, 0)];
            }
            Ok(out)
        })
        .collect()
}
