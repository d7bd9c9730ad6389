//! Mimetic finite difference discretization of Darcy/Richards flow.
//!
//! Unknowns live on cells (pressure or head) and faces (Lagrange
//! multipliers). Elemental inverse mass matrices are built per cell,
//! statically condensed into stiffness blocks, assembled into distributed
//! face/cell matrices, and reduced to a face-only Schur complement.

pub mod assembly;
pub mod boundary;
pub mod condensation;
pub mod flux;
pub mod mass;
pub mod operator;

use crate::mesh::{MeshTopology, Ownership};
use crate::solver::comm::{global_max_abs, global_norm, CommunicationBackend};

pub use assembly::GlobalSystem;
pub use boundary::{BcMarker, BoundaryConditions};
pub use condensation::ElementalBlock;
pub use mass::{ElementalTally, MfdMethod};
pub use operator::MatrixMfd;

/// Operator-wide discretization settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MfdConfig {
    pub method: MfdMethod,
    /// When true the cell-face couplings are stored once (`Afc` aliases
    /// `Acf`) and non-symmetric updates are refused.
    pub symmetric: bool,
}

impl Default for MfdConfig {
    fn default() -> Self {
        Self {
            method: MfdMethod::Standard,
            symmetric: true,
        }
    }
}

/// Cell and face components of a distributed vector, owned entries only.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowVector {
    pub cells: Vec<f64>,
    pub faces: Vec<f64>,
}

impl FlowVector {
    pub fn zeros(num_cells: usize, num_faces: usize) -> Self {
        Self {
            cells: vec![0.0; num_cells],
            faces: vec![0.0; num_faces],
        }
    }

    /// Zero vector sized for the owned entities of `mesh`.
    pub fn for_mesh<M: MeshTopology>(mesh: &M) -> Self {
        Self::zeros(
            mesh.num_cells(Ownership::Owned),
            mesh.num_faces(Ownership::Owned),
        )
    }

    /// self += alpha * other
    pub fn axpy(&mut self, alpha: f64, other: &FlowVector) {
        for (a, b) in self.cells.iter_mut().zip(&other.cells) {
            *a += alpha * b;
        }
        for (a, b) in self.faces.iter_mut().zip(&other.faces) {
            *a += alpha * b;
        }
    }

    pub fn scale(&mut self, alpha: f64) {
        self.cells.iter_mut().for_each(|v| *v *= alpha);
        self.faces.iter_mut().for_each(|v| *v *= alpha);
    }

    /// Global 2-norm over both components.
    pub fn norm2(&self, comm: &dyn CommunicationBackend) -> f64 {
        let local = self.cells.iter().chain(&self.faces).map(|v| v * v).sum();
        comm.all_reduce_sum(local).sqrt()
    }

    /// Global max-norm over both components.
    pub fn max_abs(&self, comm: &dyn CommunicationBackend) -> f64 {
        global_max_abs(comm, &self.cells).max(global_max_abs(comm, &self.faces))
    }

    /// Global 2-norm of the cell component.
    pub fn cell_norm2(&self, comm: &dyn CommunicationBackend) -> f64 {
        global_norm(comm, &self.cells)
    }
}
