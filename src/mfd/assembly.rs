//! Distributed global matrices: symbolic pattern, numeric fill, combine.
//!
//! Face matrices (`Aff`, `Sff`) are stored over all used faces so that every
//! owned cell can scatter its whole elemental block locally. Rows of ghost
//! faces collect partial sums that are shipped to the owning rank and added
//! there (the additive combine), after which they are zeroed. Cell matrices
//! (`Acf`, `Afc`) have one row per owned cell and a column per used face.

use super::boundary::BoundaryConditions;
use super::condensation::ElementalBlock;
use crate::error::{MfdError, Result};
use crate::mesh::{HaloPlan, MeshTopology, Ownership};
use crate::solver::comm::{collective, CommunicationBackend};
use crate::sparse::{CsrMatrix, SparsityPattern};
use std::collections::BTreeMap;

/// Assembled operator of one rank.
#[derive(Debug, Clone)]
pub struct GlobalSystem {
    /// Face×face block over used faces; only owned rows are meaningful.
    pub aff: CsrMatrix<f64>,
    /// Schur complement, same pattern as `aff`.
    pub sff: CsrMatrix<f64>,
    /// Owned cells × used faces.
    pub acf: CsrMatrix<f64>,
    /// Face-row couplings to cells, stored by cell row like `acf`. `None`
    /// when the operator is symmetric and `acf` serves for both.
    pub afc: Option<CsrMatrix<f64>>,
    /// Diagonal cell block, one entry per owned cell.
    pub acc: Vec<f64>,
    pub rhs_cells: Vec<f64>,
    pub rhs_faces: Vec<f64>,
    n_used_faces: usize,
    /// Per owned cell, row-major positions of its face pairs in `aff`/`sff`.
    face_slots: Vec<Vec<usize>>,
    /// Per owned cell, positions of its faces in `acf`/`afc`.
    cell_slots: Vec<Vec<usize>>,
    /// Exchange plan over `aff` value positions: ghost-row entries travel
    /// to the matching owned-row entries on the owning rank.
    matrix_combine: HaloPlan,
}

impl GlobalSystem {
    /// Build the non-zero patterns and the combine plan. Collective only in
    /// the sense that every rank must call it; no communication happens.
    pub fn symbolic<M: MeshTopology>(mesh: &M, symmetric: bool) -> Result<Self> {
        let _span = tracing::debug_span!("symbolic_assembly").entered();
        let n_owned_cells = mesh.num_cells(Ownership::Owned);
        let n_used_cells = mesh.num_cells(Ownership::Used);
        let n_owned_faces = mesh.num_faces(Ownership::Owned);
        let n_used_faces = mesh.num_faces(Ownership::Used);

        let mut ff = SparsityPattern::new(n_used_faces, n_used_faces);
        let mut cf = SparsityPattern::new(n_owned_cells, n_used_faces);
        for c in 0..n_owned_cells {
            let faces = mesh.cell_faces(c);
            ff.insert_block(faces);
            cf.insert(c, faces);
        }
        // Owned faces on the partition boundary receive entries from the
        // neighbor's cells during the combine.
        for c in n_owned_cells..n_used_cells {
            let faces = mesh.cell_faces(c);
            for &f in faces.iter().filter(|&&f| f < n_owned_faces) {
                ff.insert(f, faces);
            }
        }
        let aff = ff.finalize();
        let acf = cf.finalize();

        let mut face_slots = Vec::with_capacity(n_owned_cells);
        let mut cell_slots = Vec::with_capacity(n_owned_cells);
        for c in 0..n_owned_cells {
            let faces = mesh.cell_faces(c);
            let mut slots = Vec::with_capacity(faces.len() * faces.len());
            for &f in faces {
                for &g in faces {
                    slots.push(locate(&aff, f, g)?);
                }
            }
            face_slots.push(slots);
            cell_slots.push(
                faces
                    .iter()
                    .map(|&f| locate(&acf, c, f))
                    .collect::<Result<Vec<_>>>()?,
            );
        }

        let matrix_combine = combine_plan(mesh, &aff)?;
        tracing::debug!(
            nnz_ff = aff.nnz(),
            nnz_cf = acf.nnz(),
            combine_neighbors = matrix_combine.neighbor_ranks.len(),
            "symbolic assembly done"
        );

        Ok(Self {
            sff: aff.clone(),
            afc: (!symmetric).then(|| acf.clone()),
            aff,
            acf,
            acc: vec![0.0; n_owned_cells],
            rhs_cells: vec![0.0; n_owned_cells],
            rhs_faces: vec![0.0; n_owned_faces],
            n_used_faces,
            face_slots,
            cell_slots,
            matrix_combine,
        })
    }

    pub fn is_symmetric(&self) -> bool {
        self.afc.is_none()
    }

    /// Face-row cell couplings, aliasing `acf` when symmetric.
    pub fn afc(&self) -> &CsrMatrix<f64> {
        self.afc.as_ref().unwrap_or(&self.acf)
    }

    pub fn num_owned_faces(&self) -> usize {
        self.rhs_faces.len()
    }

    pub fn num_used_faces(&self) -> usize {
        self.n_used_faces
    }

    /// Zero the numeric values and scatter the elemental blocks, then
    /// combine shared-face contributions across ranks.
    pub fn assemble<M: MeshTopology>(
        &mut self,
        mesh: &M,
        comm: &dyn CommunicationBackend,
        blocks: &[ElementalBlock],
    ) -> Result<()> {
        let _span = tracing::debug_span!("numeric_assembly").entered();
        collective(comm, self.check_blocks(blocks), "numeric assembly")?;

        self.aff.put_scalar(0.0);
        self.acf.put_scalar(0.0);
        if let Some(afc) = self.afc.as_mut() {
            afc.put_scalar(0.0);
        }
        let mut rhs_used = vec![0.0; self.n_used_faces];

        for (c, block) in blocks.iter().enumerate() {
            let faces = mesh.cell_faces(c);
            let nf = faces.len();
            for (k, &slot) in self.face_slots[c].iter().enumerate() {
                self.aff.values[slot] += block.bff[(k / nf, k % nf)];
            }
            for (n, &slot) in self.cell_slots[c].iter().enumerate() {
                self.acf.values[slot] += block.bcf[n];
                if let Some(afc) = self.afc.as_mut() {
                    afc.values[slot] += block.bfc[n];
                }
                rhs_used[faces[n]] += block.ff[n];
            }
            self.acc[c] = block.acc;
            self.rhs_cells[c] = block.fc;
        }

        self.combine_faces(comm);
        mesh.face_halo().export_add(comm, &mut rhs_used);
        let n_owned = self.rhs_faces.len();
        self.rhs_faces.copy_from_slice(&rhs_used[..n_owned]);
        Ok(())
    }

    /// Build `Sff` from the elemental blocks. Dirichlet rows and columns are
    /// zeroed, and their diagonal copied from `aff`.
    pub fn compute_schur<M: MeshTopology>(
        &mut self,
        mesh: &M,
        comm: &dyn CommunicationBackend,
        blocks: &[ElementalBlock],
        bc: &BoundaryConditions,
    ) -> Result<()> {
        let _span = tracing::debug_span!("schur_complement").entered();
        let singular = blocks
            .iter()
            .position(|b| b.acc == 0.0 || !b.acc.is_finite())
            .map_or(Ok(()), |c| {
                Err(MfdError::Consistency(format!(
                    "cell {c} has a singular self-coupling {}",
                    blocks[c].acc
                )))
            });
        let check = self.check_blocks(blocks).and(singular);
        collective(comm, check, "Schur complement")?;

        self.sff.put_scalar(0.0);
        for (c, block) in blocks.iter().enumerate() {
            let faces = mesh.cell_faces(c);
            let nf = faces.len();
            let mut schur = block.schur();
            for (n, &f) in faces.iter().enumerate() {
                if bc.marker(f).is_dirichlet() {
                    for m in 0..nf {
                        schur[(n, m)] = 0.0;
                        schur[(m, n)] = 0.0;
                    }
                    schur[(n, n)] = 1.0;
                }
            }
            for (k, &slot) in self.face_slots[c].iter().enumerate() {
                self.sff.values[slot] += schur[(k / nf, k % nf)];
            }
        }

        let halo = &self.matrix_combine;
        halo.export_add(comm, &mut self.sff.values);
        let n_owned = self.rhs_faces.len();
        for row in n_owned..self.n_used_faces {
            self.sff.zero_row(row);
        }
        // Dirichlet rows must match the assembled face block, whichever
        // path eliminated them.
        for row in (0..n_owned).filter(|&r| bc.marker(r).is_dirichlet()) {
            if let Some(idx) = self.sff.position(row, row) {
                self.sff.values[idx] = self.aff.values[idx];
            }
        }
        Ok(())
    }

    fn check_blocks(&self, blocks: &[ElementalBlock]) -> Result<()> {
        if blocks.len() != self.acc.len() {
            return Err(MfdError::Consistency(format!(
                "{} elemental blocks for {} owned cells",
                blocks.len(),
                self.acc.len()
            )));
        }
        let skewed = |b: &ElementalBlock| {
            let tol = 1e-12 * b.acc.abs().max(1.0);
            b.bcf.iter().zip(&b.bfc).any(|(x, y)| (x - y).abs() > tol)
        };
        if self.is_symmetric() && blocks.iter().any(skewed) {
            return Err(MfdError::Consistency(
                "non-symmetric cell couplings in a symmetric operator".into(),
            ));
        }
        Ok(())
    }

    fn combine_faces(&mut self, comm: &dyn CommunicationBackend) {
        self.matrix_combine.export_add(comm, &mut self.aff.values);
        let n_owned = self.rhs_faces.len();
        for row in n_owned..self.n_used_faces {
            self.aff.zero_row(row);
        }
    }
}

fn locate(m: &CsrMatrix<f64>, row: usize, col: usize) -> Result<usize> {
    m.position(row, col).ok_or_else(|| {
        MfdError::Consistency(format!("entry ({row}, {col}) missing from the sparsity pattern"))
    })
}

/// Match ghost-row entries with owned-row entries on the neighbor.
///
/// The sending rank lists, for each ghost face row owned by `q`, all stored
/// entries. The owning rank reproduces the same set from its ghost cells
/// owned by the sender: for every owned face `f` of such a cell, the pairs
/// `(f, g)` with `g` among that cell's faces. Both sides sort by global ids.
fn combine_plan<M: MeshTopology>(mesh: &M, aff: &CsrMatrix<f64>) -> Result<HaloPlan> {
    let n_owned_cells = mesh.num_cells(Ownership::Owned);
    let n_used_cells = mesh.num_cells(Ownership::Used);
    let n_owned_faces = mesh.num_faces(Ownership::Owned);
    let n_used_faces = mesh.num_faces(Ownership::Used);
    let gid = |f: usize| mesh.face_global_id(f);

    let mut outgoing: BTreeMap<usize, BTreeMap<(usize, usize), usize>> = BTreeMap::new();
    for row in n_owned_faces..n_used_faces {
        let owner = mesh.face_owner(row);
        for idx in aff.row_pointers[row]..aff.row_pointers[row + 1] {
            let col = aff.col_indices[idx];
            outgoing
                .entry(owner)
                .or_default()
                .insert((gid(row), gid(col)), idx);
        }
    }

    let mut incoming: BTreeMap<usize, BTreeMap<(usize, usize), usize>> = BTreeMap::new();
    for c in n_owned_cells..n_used_cells {
        let sender = mesh.cell_owner(c);
        let faces = mesh.cell_faces(c);
        for &f in faces.iter().filter(|&&f| f < n_owned_faces) {
            for &g in faces {
                incoming
                    .entry(sender)
                    .or_default()
                    .insert((gid(f), gid(g)), locate(aff, f, g)?);
            }
        }
    }

    let mut plan = HaloPlan::empty();
    let ranks: std::collections::BTreeSet<usize> =
        outgoing.keys().chain(incoming.keys()).copied().collect();
    for q in ranks {
        let send = incoming.remove(&q).unwrap_or_default();
        let recv = outgoing.remove(&q).unwrap_or_default();
        if send.is_empty() && recv.is_empty() {
            continue;
        }
        plan.neighbor_ranks.push(q);
        plan.send_indices.push(send.into_values().collect());
        plan.recv_indices.push(recv.into_values().collect());
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dense::Tensor;
    use approx::assert_abs_diff_eq;
    use faer::Mat;
    use crate::mesh::PolyMesh;
    use crate::mfd::mass::{mass_inverse, MfdMethod};
    use crate::solver::comm::SingleProcessComm;

    fn blocks(mesh: &PolyMesh) -> Vec<ElementalBlock> {
        (0..mesh.num_cells(Ownership::Owned))
            .map(|c| {
                let (w, _) = mass_inverse(mesh, c, &Tensor::isotropic(2, 1.0), MfdMethod::Standard).unwrap();
                let nf = w.nrows();
                ElementalBlock::condense(w.as_ref(), 1.0, &vec![1.0; nf])
            })
            .collect()
    }

    #[test]
    fn pattern_covers_cell_face_pairs() {
        let mesh = PolyMesh::quad_grid(2, 1, (0.0, 2.0), (0.0, 1.0)).unwrap();
        let sys = GlobalSystem::symbolic(&mesh, true).unwrap();
        // Two cells of four faces sharing one: 16 + 16 - 1.
        assert_eq!(sys.aff.nnz(), 31);
        assert_eq!(sys.acf.nnz(), 8);
        assert!(sys.afc.is_none());
        assert!(sys.matrix_combine.is_empty());
    }

    #[test]
    fn assembly_sums_shared_face_and_schur_is_symmetric() {
        let mesh = PolyMesh::quad_grid(2, 1, (0.0, 2.0), (0.0, 1.0)).unwrap();
        let blocks = blocks(&mesh);
        let mut sys = GlobalSystem::symbolic(&mesh, true).unwrap();
        sys.assemble(&mesh, &SingleProcessComm, &blocks).unwrap();
        let shared = mesh.cell_faces(0)[1];
        // Each unit square contributes 2 on the diagonal of its faces.
        assert_abs_diff_eq!(sys.aff.get(shared, shared), 4.0, epsilon = 1e-14);
        for acc in &sys.acc {
            assert_abs_diff_eq!(*acc, 8.0, epsilon = 1e-14);
        }
        assert!(sys.aff.symmetry_defect(sys.aff.nrows) < 1e-14);

        sys.compute_schur(&mesh, &SingleProcessComm, &blocks, &BoundaryConditions::for_mesh(&mesh))
            .unwrap();
        assert!(sys.sff.symmetry_defect(sys.sff.nrows) < 1e-14);
        // Schur of a unit square: 2 - 2*2/8 = 1.5 per cell on the diagonal.
        assert!((sys.sff.get(shared, shared) - 3.0).abs() < 1e-14);
    }

    #[test]
    fn wrong_block_count_is_rejected() {
        let mesh = PolyMesh::quad_grid(2, 1, (0.0, 2.0), (0.0, 1.0)).unwrap();
        let mut sys = GlobalSystem::symbolic(&mesh, false).unwrap();
        let one = vec![ElementalBlock::condense(Mat::<f64>::identity(4, 4).as_ref(), 1.0, &[1.0; 4])];
        assert!(matches!(
            sys.assemble(&mesh, &SingleProcessComm, &one),
            Err(MfdError::Consistency(_))
        ));
    }
}
