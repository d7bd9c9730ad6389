//! Boundary condition table and its two application paths.
//!
//! Dirichlet faces are eliminated: their column contribution is moved to the
//! right-hand side, row and column are zeroed, the diagonal is set to one and
//! the right-hand side to the prescribed value. Neumann faces add
//! `value × area` to the face right-hand side (`value` is the inward flux
//! density). The elemental path acts on condensed cell blocks before
//! assembly; the global path acts on the assembled system. A cycle uses one
//! or the other.

use super::assembly::GlobalSystem;
use super::condensation::ElementalBlock;
use crate::mesh::{MeshTopology, Ownership};

/// Kind of condition on a face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BcMarker {
    #[default]
    None,
    DirichletPressure,
    DirichletHead,
    NeumannFlux,
}

impl BcMarker {
    pub fn is_dirichlet(self) -> bool {
        matches!(self, BcMarker::DirichletPressure | BcMarker::DirichletHead)
    }
}

/// One marker and one value per used face, in local face numbering.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryConditions {
    markers: Vec<BcMarker>,
    values: Vec<f64>,
}

impl BoundaryConditions {
    /// Table with no conditions on `num_faces` faces.
    pub fn new(num_faces: usize) -> Self {
        Self {
            markers: vec![BcMarker::None; num_faces],
            values: vec![0.0; num_faces],
        }
    }

    /// Table sized for the used faces of `mesh`.
    pub fn for_mesh<M: MeshTopology>(mesh: &M) -> Self {
        Self::new(mesh.num_faces(Ownership::Used))
    }

    pub fn set(&mut self, face: usize, marker: BcMarker, value: f64) {
        self.markers[face] = marker;
        self.values[face] = value;
    }

    pub fn marker(&self, face: usize) -> BcMarker {
        self.markers[face]
    }

    pub fn value(&self, face: usize) -> f64 {
        self.values[face]
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// Number of faces carrying a condition.
    pub fn num_marked(&self) -> usize {
        self.markers.iter().filter(|m| **m != BcMarker::None).count()
    }
}

/// Apply conditions to one cell block whose local faces map to `faces`.
pub fn apply_elemental(
    block: &mut ElementalBlock,
    faces: &[usize],
    bc: &BoundaryConditions,
    area: impl Fn(usize) -> f64,
) {
    let nf = faces.len();
    for (n, &f) in faces.iter().enumerate() {
        let value = bc.value(f);
        match bc.marker(f) {
            BcMarker::None => {}
            BcMarker::NeumannFlux => block.ff[n] += value * area(f),
            BcMarker::DirichletPressure | BcMarker::DirichletHead => {
                for m in 0..nf {
                    block.ff[m] -= block.bff[(m, n)] * value;
                    block.bff[(n, m)] = 0.0;
                    block.bff[(m, n)] = 0.0;
                }
                block.fc -= block.bcf[n] * value;
                block.bcf[n] = 0.0;
                block.bfc[n] = 0.0;
                block.bff[(n, n)] = 1.0;
                block.ff[n] = value;
            }
        }
    }
}

/// Apply conditions to the assembled system. Neumann contributions go to
/// owned faces only, so each is counted once across ranks.
pub fn apply_global(system: &mut GlobalSystem, bc: &BoundaryConditions, area: impl Fn(usize) -> f64) {
    let n_owned = system.rhs_faces.len();
    for row in 0..n_owned {
        let (start, end) = (system.aff.row_pointers[row], system.aff.row_pointers[row + 1]);
        for idx in start..end {
            let col = system.aff.col_indices[idx];
            if col != row && bc.marker(col).is_dirichlet() {
                system.rhs_faces[row] -= system.aff.values[idx] * bc.value(col);
                system.aff.values[idx] = 0.0;
            }
        }
        match bc.marker(row) {
            BcMarker::None => {}
            BcMarker::NeumannFlux => system.rhs_faces[row] += bc.value(row) * area(row),
            BcMarker::DirichletPressure | BcMarker::DirichletHead => {
                system.aff.zero_row(row);
                if let Some(idx) = system.aff.position(row, row) {
                    system.aff.values[idx] = 1.0;
                }
                system.rhs_faces[row] = bc.value(row);
            }
        }
    }

    for cell in 0..system.acc.len() {
        let (start, end) = (system.acf.row_pointers[cell], system.acf.row_pointers[cell + 1]);
        for idx in start..end {
            let col = system.acf.col_indices[idx];
            if bc.marker(col).is_dirichlet() {
                system.rhs_cells[cell] -= system.acf.values[idx] * bc.value(col);
                system.acf.values[idx] = 0.0;
                if let Some(afc) = system.afc.as_mut() {
                    afc.values[idx] = 0.0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faer::Mat;

    fn block() -> ElementalBlock {
        let m = Mat::from_fn(3, 3, |i, j| [[2.0, -0.5, 0.1], [-0.5, 1.5, 0.0], [0.1, 0.0, 3.0]][i][j]);
        ElementalBlock::condense(m.as_ref(), 1.0, &[1.0; 3])
    }

    #[test]
    fn dirichlet_folds_column_into_rhs() {
        let mut b = block();
        let original = b.clone();
        let mut bc = BoundaryConditions::new(3);
        bc.set(1, BcMarker::DirichletHead, 2.0);
        apply_elemental(&mut b, &[0, 1, 2], &bc, |_| 1.0);

        assert_eq!(b.ff, vec![1.0, 2.0, 0.0]);
        assert_eq!(b.fc, -original.bcf[1] * 2.0);
        assert_eq!(b.bff[(1, 1)], 1.0);
        for m in [0, 2] {
            assert_eq!(b.bff[(1, m)], 0.0);
            assert_eq!(b.bff[(m, 1)], 0.0);
        }
        assert_eq!(b.bcf[1], 0.0);
        assert_eq!(b.bfc[1], 0.0);
    }

    #[test]
    fn elemental_dirichlet_is_idempotent() {
        let mut bc = BoundaryConditions::new(3);
        bc.set(0, BcMarker::DirichletPressure, -1.5);
        bc.set(2, BcMarker::DirichletHead, 0.25);
        let mut once = block();
        apply_elemental(&mut once, &[0, 1, 2], &bc, |_| 1.0);
        let mut twice = once.clone();
        apply_elemental(&mut twice, &[0, 1, 2], &bc, |_| 1.0);
        assert_eq!(once, twice);
    }

    #[test]
    fn neumann_adds_flux_times_area() {
        let mut b = block();
        let mut bc = BoundaryConditions::new(3);
        bc.set(2, BcMarker::NeumannFlux, 0.5);
        apply_elemental(&mut b, &[0, 1, 2], &bc, |_| 4.0);
        assert_eq!(b.ff, vec![0.0, 0.0, 2.0]);
        assert_eq!(b.bff, block().bff);
        assert_eq!(bc.num_marked(), 1);
    }
}
